//! Plan Coordinator (C10, §4.7): owns all targets, builds global barriers,
//! spawns workers and the restart monitor, and joins everything at teardown.

use crate::barrier::Barrier;
use crate::error::Error;
use crate::gates::{LockstepController, NullLockstep, Trigger};
use crate::net::{AddressTable, E2eState, Transport};
use crate::raw::RawSideband;
use crate::restart::{self, RestartState};
use crate::target::{TargetOptions, TargetShared, TargetSpec};
use crate::worker::{Worker, WorkerConfig, WorkerResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Process-wide configuration (§3 "Plan"). Never resized once built.
pub struct Plan {
    pub passes: u32,
    pub number_of_targets: u32,
    pub syncio: u64,
    pub global_debug_flags: u32,
    pub restart_frequency_seconds: u64,
    pub abort: AtomicBool,
    pub canceled: AtomicBool,
}

impl Plan {
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn request_cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    /// Latch the plan-wide abort flag. Called alongside a target's own
    /// `error_break` on every fatal path, so every worker across every
    /// target in the plan observes it at the top of its loop (§4.1, §7).
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

/// Everything needed to bring one target up: its static spec, optional E2E
/// wiring, optional restart enablement, and gate collaborators.
pub struct TargetBuildSpec<T: Transport> {
    pub spec: TargetSpec,
    pub e2e_address_table: Option<AddressTable>,
    pub as_destination: bool,
    pub restart_hostnames: Option<(String, String, String, String)>,
    pub lockstep: Arc<dyn LockstepController>,
    pub outgoing_triggers: Vec<Trigger>,
    pub raw_sideband: Option<Arc<RawSideband>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Transport> TargetBuildSpec<T> {
    pub fn new(spec: TargetSpec) -> Self {
        TargetBuildSpec {
            spec,
            e2e_address_table: None,
            as_destination: false,
            restart_hostnames: None,
            lockstep: Arc::new(NullLockstep),
            outgoing_triggers: Vec::new(),
            raw_sideband: None,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn with_e2e(mut self, address_table: AddressTable, as_destination: bool) -> Self {
        self.e2e_address_table = Some(address_table);
        self.as_destination = as_destination;
        self
    }

    pub fn with_restart(mut self, src_host: &str, src_base: &str, dst_host: &str, dst_base: &str) -> Self {
        self.restart_hostnames = Some((src_host.into(), src_base.into(), dst_host.into(), dst_base.into()));
        self
    }

    pub fn with_lockstep(mut self, lockstep: Arc<dyn LockstepController>) -> Self {
        self.lockstep = lockstep;
        self
    }

    pub fn with_outgoing_triggers(mut self, triggers: Vec<Trigger>) -> Self {
        self.outgoing_triggers = triggers;
        self
    }

    /// Wires this target into a RAW sideband pair. Give the writer and its
    /// reader the same `Arc<RawSideband>`; the reader also needs
    /// `raw_mode: Some(RawMode::Sideband)` on its `TargetSpec`.
    pub fn with_raw_sideband(mut self, sideband: Arc<RawSideband>) -> Self {
        self.raw_sideband = Some(sideband);
        self
    }
}

struct TargetRuntime<T: Transport> {
    shared: Arc<TargetShared<T>>,
    worker_configs: Vec<WorkerConfig>,
    restart: Option<Arc<RestartState>>,
}

pub struct PlanBuilder<T: Transport> {
    passes: u32,
    syncio: u64,
    restart_frequency_seconds: u64,
    tick: Duration,
    targets: Vec<TargetBuildSpec<T>>,
}

impl<T: Transport> PlanBuilder<T> {
    pub fn new() -> Self {
        PlanBuilder {
            passes: 1,
            syncio: 0,
            restart_frequency_seconds: 10,
            tick: crate::gates::DEFAULT_TICK,
            targets: Vec::new(),
        }
    }

    pub fn passes(mut self, passes: u32) -> Self {
        self.passes = passes;
        self
    }

    pub fn syncio(mut self, syncio: u64) -> Self {
        self.syncio = syncio;
        self
    }

    pub fn restart_frequency_seconds(mut self, secs: u64) -> Self {
        self.restart_frequency_seconds = secs;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn add_target(mut self, target: TargetBuildSpec<T>) -> Self {
        self.targets.push(target);
        self
    }

    /// Bring every target up: allocate buffer pools, open files, wire the
    /// syncio barrier (parties = total workers across all targets) and
    /// per-target start barriers (parties = worker_count + 1, the extra
    /// party being whichever worker's trigger releases it), then build
    /// the worker configs ready to spawn.
    pub fn build(self, transport: Arc<T>) -> Result<PlanCoordinator<T>, Error> {
        let total_workers: usize = self.targets.iter().map(|t| t.spec.worker_count as usize).sum();
        let syncio_barrier = if self.syncio > 0 && self.targets.len() > 1 {
            Some(Arc::new(Barrier::new(total_workers, "syncio")))
        } else {
            None
        };

        let mut start_barriers: HashMap<u32, Arc<Barrier>> = HashMap::new();
        for t in &self.targets {
            if t.spec.options.contains(TargetOptions::WAITFORSTART) {
                let parties = t.spec.worker_count as usize + 1;
                start_barriers.insert(t.spec.target_number, Arc::new(Barrier::new(parties, "start-trigger")));
            }
        }

        let num_targets = self.targets.len();
        let plan = Arc::new(Plan {
            passes: self.passes,
            number_of_targets: num_targets as u32,
            syncio: self.syncio,
            global_debug_flags: 0,
            restart_frequency_seconds: self.restart_frequency_seconds,
            abort: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
        });

        let mut runtimes = Vec::with_capacity(num_targets);
        for build in self.targets {
            let target_number = build.spec.target_number;
            let worker_count = build.spec.worker_count;
            let is_e2e_destination = build.spec.options.contains(TargetOptions::E2E_DESTINATION);

            let e2e = build
                .e2e_address_table
                .map(|table| E2eState::new(table));

            let restart = if build.spec.options.contains(TargetOptions::RESTART_ENABLE) {
                if is_e2e_destination {
                    let (src_host, src_base, dst_host, dst_base) =
                        build.restart_hostnames.unwrap_or_else(|| {
                            ("localhost".into(), "src".into(), "localhost".into(), "dst".into())
                        });
                    let timestamp = restart::gmt_timestamp_now();
                    let filename = restart::default_filename(&src_host, &src_base, &dst_host, &dst_base, &timestamp);
                    let path = build.spec.full_pathname.with_file_name(filename);
                    Some(Arc::new(RestartState::create(target_number, path)?))
                } else {
                    log::info!(
                        "target {target_number}: RESTART_ENABLE set but target is not an E2E destination; skipping restart file"
                    );
                    None
                }
            } else {
                None
            };

            let start_barrier = start_barriers.get(&target_number).cloned();
            let shared = Arc::new(TargetShared::open_with_raw_sideband(
                build.spec.clone(),
                e2e,
                restart.clone(),
                start_barrier,
                build.raw_sideband.clone(),
            )?);

            let mut worker_configs = Vec::with_capacity(worker_count as usize);
            for w in 0..worker_count {
                let seek_plan = build.spec.seek_plan_for_worker(w);
                let downstream_start_barriers = start_barriers.clone();
                let outgoing_triggers = build
                    .outgoing_triggers
                    .iter()
                    .map(|t| crate::gates::TriggerState::new(*t))
                    .collect();
                worker_configs.push(WorkerConfig {
                    worker_number: w,
                    seek_plan,
                    passes: self.passes,
                    syncio: self.syncio,
                    target_count: num_targets,
                    syncio_barrier: syncio_barrier.clone(),
                    outgoing_triggers,
                    downstream_start_barriers,
                    lockstep: Arc::clone(&build.lockstep),
                    tick: self.tick,
                    plan: Arc::clone(&plan),
                });
            }

            runtimes.push(TargetRuntime {
                shared,
                worker_configs,
                restart,
            });
        }

        Ok(PlanCoordinator {
            plan,
            transport,
            targets: runtimes,
        })
    }
}

impl<T: Transport> Default for PlanBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PlanOutcome {
    pub worker_results: Vec<WorkerResult>,
    pub aborted: bool,
}

pub struct PlanCoordinator<T: Transport> {
    plan: Arc<Plan>,
    transport: Arc<T>,
    targets: Vec<TargetRuntime<T>>,
}

impl<T: Transport> PlanCoordinator<T> {
    pub fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    /// Spawn the restart monitor (if any target needs one) and every
    /// target's workers, then block until all workers finish. Cleanup runs
    /// for every target regardless of how it finished.
    pub fn run(mut self) -> PlanOutcome {
        let restart_states: Vec<Arc<RestartState>> =
            self.targets.iter().filter_map(|t| t.restart.clone()).collect();

        let monitor_handle = if !restart_states.is_empty() {
            let plan = Arc::clone(&self.plan);
            Some(
                thread::Builder::new()
                    .name("restart-monitor".into())
                    .spawn(move || restart_monitor_loop(plan, restart_states))
                    .expect("failed to spawn restart monitor"),
            )
        } else {
            None
        };

        let mut handles: Vec<JoinHandle<WorkerResult>> = Vec::new();
        for target in &mut self.targets {
            for config in target.worker_configs.drain(..) {
                let shared = Arc::clone(&target.shared);
                let transport = Arc::clone(&self.transport);
                let name = format!("worker-{}-{}", shared.target_number(), config.worker_number);
                let mut worker = Worker::new(shared, Some(transport), config);
                let handle = thread::Builder::new()
                    .name(name)
                    .spawn(move || worker.run())
                    .expect("failed to spawn worker");
                handles.push(handle);
            }
        }

        let mut worker_results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.join() {
                Ok(result) => worker_results.push(result),
                Err(_) => log::error!("worker thread panicked"),
            }
        }

        self.plan.request_cancel();
        if let Some(handle) = monitor_handle {
            let _ = handle.join();
        }

        let aborted = self.plan.is_aborted();
        for target in &self.targets {
            if !aborted {
                if let Some(restart) = &target.restart {
                    restart.mark_successful_completion();
                }
            }
            target.shared.cleanup();
        }

        let _ = self.transport;
        PlanOutcome {
            worker_results,
            aborted,
        }
    }
}

fn restart_monitor_loop(plan: Arc<Plan>, targets: Vec<Arc<RestartState>>) {
    loop {
        if plan.is_aborted() || plan.is_canceled() {
            for restart in &targets {
                if let Err(e) = restart.checkpoint() {
                    log::warn!("restart monitor: final checkpoint failed: {e}");
                }
            }
            return;
        }
        thread::sleep(Duration::from_secs(plan.restart_frequency_seconds.max(1)));
        for restart in &targets {
            if let Err(e) = restart.checkpoint() {
                log::warn!("restart monitor: checkpoint failed: {e}");
            }
        }
    }
}
