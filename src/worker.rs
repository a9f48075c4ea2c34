//! Worker Operation Loop (C6, §4.1): executes one scheduled operation at a
//! time — gate, issue I/O, timestamp, advance.

use crate::barrier::{Barrier, Occupant, OccupantType};
use crate::buffer::BufferHandle;
use crate::clock::{self, OpKind, PicoSeconds};
use crate::error::{Error, OpOutcome, Result};
use crate::gates::{throttle_gate, LockstepContext, LockstepController, LockstepDecision, TriggerState};
use crate::net::{ReceiveStatus, TargetBuffer, Transport};
use crate::plan::Plan;
use crate::raw::RawMessage;
use crate::seek::SeekPlan;
use crate::target::{TargetOptions, TargetShared};
use std::collections::HashMap;
use std::io::{Read, Seek as IoSeek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRequest {
    Run,
    Stop,
}

/// The unit a worker loop iteration operates on (§3 "Worker" / "Task").
#[derive(Debug, Clone)]
pub struct Task {
    pub task_request: TaskRequest,
    pub op_number: u64,
    pub byte_offset: u64,
    pub xfer_size: u64,
    pub data: Vec<u8>,
}

/// What a worker publishes when it finishes (or aborts).
#[derive(Debug)]
pub struct WorkerResult {
    pub worker_number: u32,
    pub ops_completed: u64,
    pub error: Option<Error>,
}

/// Everything a worker needs beyond the target it belongs to: its seek
/// plan, gate wiring, and lockstep collaborator. Built by the Plan
/// Coordinator (C10) at target bring-up.
pub struct WorkerConfig {
    pub worker_number: u32,
    pub seek_plan: SeekPlan,
    pub passes: u32,
    pub syncio: u64,
    pub target_count: usize,
    pub syncio_barrier: Option<Arc<Barrier>>,
    pub outgoing_triggers: Vec<TriggerState>,
    pub downstream_start_barriers: HashMap<u32, Arc<Barrier>>,
    pub lockstep: Arc<dyn LockstepController>,
    pub tick: Duration,
    /// Shared with every other worker across every target in the same plan,
    /// so a fatal error on one target's worker can be observed by all of
    /// the others (§4.1 "workers must observe [abort] at the top of the
    /// loop").
    pub plan: Arc<Plan>,
}

pub struct Worker<T: Transport> {
    target: Arc<TargetShared<T>>,
    transport: Option<Arc<T>>,
    config: WorkerConfig,
    current_op: u64,
    current_byte_location: u64,
    current_pass_number: u32,
    last_committed_op: u64,
    last_committed_location: u64,
    last_committed_length: u64,
    triggered: AtomicBool,
    has_waited_for_start: bool,
    expected_next_sequence: u64,
    primed: bool,
    previous_location: u64,
    previous_length: u64,
    raw_data_ready: u64,
    raw_prev_location: u64,
    raw_prev_length: u64,
    raw_last_sequence: u64,
}

impl<T: Transport> Worker<T> {
    pub fn new(target: Arc<TargetShared<T>>, transport: Option<Arc<T>>, config: WorkerConfig) -> Self {
        Worker {
            target,
            transport,
            config,
            current_op: 0,
            current_byte_location: 0,
            current_pass_number: 0,
            last_committed_op: 0,
            last_committed_location: 0,
            last_committed_length: 0,
            triggered: AtomicBool::new(false),
            has_waited_for_start: false,
            expected_next_sequence: 0,
            primed: false,
            previous_location: 0,
            previous_length: 0,
            raw_data_ready: 0,
            raw_prev_location: 0,
            raw_prev_length: 0,
            raw_last_sequence: 0,
        }
    }

    fn plan_should_abort(&self) -> bool {
        self.config.plan.is_aborted() || self.target.has_error_break()
    }

    /// Drive this worker through every scheduled pass. Returns once every
    /// pass has completed, `plan.abort` was observed, or a fatal error
    /// occurred (in which case `error_break`/`plan.abort` are latched
    /// before returning).
    pub fn run(&mut self) -> WorkerResult {
        let operations = self.config.seek_plan.len() as u64;
        for pass in 0..self.config.passes {
            self.current_pass_number = pass;
            self.current_op = 0;
            if pass > 0 {
                if let Err(e) = self.reenable_dio_for_new_pass() {
                    self.target.mark_error_break();
                    self.config.plan.request_abort();
                    return self.finish(Some(e));
                }
            }
            let pass_start = clock::now();
            while self.current_op < operations {
                if self.plan_should_abort() {
                    log::debug!(
                        "worker {}: observed abort, draining at op {}",
                        self.config.worker_number,
                        self.current_op
                    );
                    return self.finish(None);
                }
                match self.run_one_operation(pass_start, operations) {
                    Ok(OpOutcome::Completed) | Ok(OpOutcome::SkippedTransientError) => {
                        self.current_op += 1;
                    }
                    Ok(OpOutcome::Fatal) => {
                        self.target.mark_error_break();
                        self.config.plan.request_abort();
                        return self.finish(None);
                    }
                    Err(e) => {
                        self.target.mark_error_break();
                        self.config.plan.request_abort();
                        return self.finish(Some(e));
                    }
                }
            }
        }
        self.finish(None)
    }

    /// Step 5's alignment workaround reopens the file without direct I/O for
    /// the rest of the pass it tripped in; this puts DIO back for the next
    /// pass, which starts aligned again. Doing this here rather than inline
    /// in step 5 matters: step 5 runs before the *current* op's I/O, so
    /// flipping DIO back on there would defeat the very reopen that op
    /// still needs.
    fn reenable_dio_for_new_pass(&self) -> Result<()> {
        if self.target.spec.options.contains(TargetOptions::DIO) && !self.target.dio_active.load(Ordering::SeqCst) {
            self.target.reopen_with_dio(true)?;
        }
        Ok(())
    }

    fn finish(&self, error: Option<Error>) -> WorkerResult {
        if error.is_none() && self.target.spec.options.contains(TargetOptions::E2E_SOURCE) {
            if let (Some(e2e), Some(transport)) = (&self.target.e2e, &self.transport) {
                let connection_index = self.config.worker_number as usize;
                let _ = e2e.with_connection(transport, connection_index, false, |c| {
                    c.send_target_buffer(&TargetBuffer::eof(self.current_op))
                });
                log::debug!(
                    "target {} worker {}: sent EOF on connection {}",
                    self.target.spec.target_number,
                    self.config.worker_number,
                    connection_index
                );
            }
        }
        WorkerResult {
            worker_number: self.config.worker_number,
            ops_completed: self.current_op,
            error,
        }
    }

    fn run_one_operation(&mut self, pass_start: PicoSeconds, operations: u64) -> Result<OpOutcome> {
        let spec = &self.target.spec;
        let is_last_op = self.current_op + 1 == operations;

        // Step 1: syncio gate.
        if self.config.syncio > 0
            && self.config.target_count > 1
            && self.current_op % self.config.syncio == 0
        {
            if let Some(barrier) = &self.config.syncio_barrier {
                barrier.wait(Occupant::new(
                    format!("worker-{}", self.config.worker_number),
                    OccupantType::WORKER,
                ));
            }
        }

        // Step 2: start-trigger gate.
        if !self.has_waited_for_start {
            if spec.options.contains(TargetOptions::WAITFORSTART) {
                if let Some(barrier) = &self.target.start_barrier {
                    barrier.wait(Occupant::new(
                        format!("worker-{}", self.config.worker_number),
                        OccupantType::WORKER,
                    ));
                }
            }
            self.has_waited_for_start = true;
        }
        for trigger in &self.config.outgoing_triggers {
            if trigger.check(pass_start, self.current_op, operations, self.last_committed_location) {
                self.triggered.store(true, Ordering::Relaxed);
                if let Some(barrier) = self.config.downstream_start_barriers.get(&trigger.downstream_target()) {
                    barrier.wait(Occupant::new(
                        format!("trigger-from-worker-{}", self.config.worker_number),
                        OccupantType::SUPPORT,
                    ));
                }
            }
        }

        // Step 3: lockstep gate.
        let decision = self.config.lockstep.before_op(LockstepContext {
            target_number: spec.target_number,
            worker_number: self.config.worker_number,
            current_op: self.current_op,
            operations_per_worker: operations,
        });
        match decision {
            LockstepDecision::Continue => {}
            LockstepDecision::BlockInternally => return Ok(OpOutcome::SkippedTransientError),
            LockstepDecision::Terminate => {
                return Err(Error::LockstepTerminate {
                    target: spec.target_number,
                    worker: self.config.worker_number,
                });
            }
        }

        // Step 4: seek resolution.
        let seek = self.config.seek_plan.resolve(self.current_op);
        self.current_byte_location = seek.block_location * spec.block_size;
        let mut xfer_size = spec.xfer_size;

        // Step 5: direct-I/O alignment check.
        let page = crate::buffer::page_size();
        if spec.options.contains(TargetOptions::DIO) && !spec.options.contains(TargetOptions::SGIO) {
            let short_tail = is_last_op && xfer_size < spec.block_size;
            let misaligned = xfer_size % page as u64 != 0 || self.current_byte_location % page as u64 != 0;
            if short_tail && misaligned {
                if let Err(e) = self.target.reopen_with_dio(false) {
                    self.target.mark_error_break();
                    return Err(e);
                }
                // DIO comes back, if requested, at the top of the next pass
                // (`reenable_dio_for_new_pass`); this op and the rest of this
                // pass proceed buffered.
            }
        }

        // Step 6: RAW reader gate.
        if spec.options.contains(TargetOptions::RAW_READER) {
            self.raw_wait(xfer_size)?;
        }

        // Step 7: E2E destination gate.
        let mut received_payload: Option<Vec<u8>> = None;
        let mut net_timing: Option<(PicoSeconds, PicoSeconds, u64)> = None;
        if spec.options.contains(TargetOptions::E2E_DESTINATION) {
            let net_start = clock::now();
            match self.e2e_destination_wait(is_last_op, xfer_size)? {
                Some((payload, shrunk_xfer_size)) => {
                    net_timing = Some((net_start, clock::now(), shrunk_xfer_size));
                    xfer_size = shrunk_xfer_size;
                    received_payload = Some(payload);
                }
                None => {
                    // EOF with nothing left to write this op.
                    return Ok(OpOutcome::Completed);
                }
            }
        }

        // Step 8: timestamp begin.
        let ts_index = if spec.options.contains(TargetOptions::TS_ON) || self.triggered.load(Ordering::Relaxed) {
            self.target
                .timestamps
                .begin(self.current_op, seek.op_kind, self.current_pass_number, self.current_byte_location)
        } else {
            None
        };
        if let (Some(index), Some((net_start, net_end, size))) = (ts_index, net_timing) {
            self.target.timestamps.record_net(index, net_start, net_end, size);
        }

        // Step 9: throttle.
        throttle_gate(&spec.throttle, self.config.tick, pass_start, &seek);

        // Step 10: issue the I/O.
        let issued = self.issue_io(seek.op_kind, xfer_size, received_payload);
        let outcome = match issued {
            Ok(bytes) => {
                self.last_committed_op = self.current_op;
                self.last_committed_location = self.current_byte_location;
                self.last_committed_length = xfer_size;
                if let Some(restart) = &self.target.restart {
                    restart.publish(self.last_committed_op, self.last_committed_location, self.last_committed_length);
                }
                // Writer side of a RAW sideband pair: tell the paired reader
                // what just landed. The reader's own target never reaches
                // here with a sideband set and RAW_READER on, since it issues
                // reads, not writes.
                if let Some(sideband) = &self.target.raw_sideband {
                    if !spec.options.contains(TargetOptions::RAW_READER) {
                        let _ = sideband.sender().send(RawMessage {
                            sequence: self.last_committed_op,
                            location: self.last_committed_location,
                            length: self.last_committed_length,
                        });
                    }
                }
                // Source E2E send path: forward what was just read, without
                // re-reading the file a second time.
                if spec.options.contains(TargetOptions::E2E_SOURCE) {
                    let net_start = clock::now();
                    self.e2e_source_send(xfer_size, bytes)?;
                    if let Some(index) = ts_index {
                        self.target.timestamps.record_net(index, net_start, clock::now(), xfer_size);
                    }
                }
                OpOutcome::Completed
            }
            Err(source) => {
                log::warn!(
                    "target {} worker {} op {}: transient I/O error: {source}",
                    spec.target_number,
                    self.config.worker_number,
                    self.current_op
                );
                OpOutcome::SkippedTransientError
            }
        };

        // Step 11: timestamp end.
        if let Some(index) = ts_index {
            self.target.timestamps.finish_disk(index);
        }

        Ok(outcome)
    }

    fn raw_wait(&mut self, xfer_size: u64) -> Result<()> {
        match self.target.spec.raw_mode {
            Some(crate::target::RawMode::Stat) => {
                loop {
                    let size = self
                        .target
                        .file
                        .lock()
                        .expect("file lock poisoned")
                        .metadata()
                        .map_err(|source| Error::TransientIo {
                            target: self.target.spec.target_number,
                            worker: self.config.worker_number,
                            op: self.current_op,
                            source,
                        })?
                        .len();
                    if size < self.current_byte_location {
                        log::warn!(
                            "target {}: RAW source file shrank ({} < {}); forcing wait to exit",
                            self.target.spec.target_number,
                            size,
                            self.current_byte_location
                        );
                        return Ok(());
                    }
                    if size.saturating_sub(self.current_byte_location) >= xfer_size {
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            Some(crate::target::RawMode::Sideband) => self.raw_sideband_wait(xfer_size),
            None => Ok(()),
        }
    }

    /// Sideband variant of the RAW gate (§4.1 step 6): pull notices off the
    /// writer's channel until enough new extent has been accounted for.
    /// `raw_data_ready` carries any excess from a previous op forward, and
    /// the discard/accumulate rule mirrors the STAT branch's intent without
    /// trusting the writer's sequence numbers blindly.
    fn raw_sideband_wait(&mut self, xfer_size: u64) -> Result<()> {
        let sideband = match &self.target.raw_sideband {
            Some(s) => s.clone(),
            None => return Ok(()),
        };
        while self.raw_data_ready < xfer_size {
            let msg: RawMessage = sideband.recv().ok_or_else(|| Error::Protocol {
                target: self.target.spec.target_number,
                worker: self.config.worker_number,
                reason: "RAW sideband channel closed before enough data arrived".into(),
            })?;
            if msg.length != xfer_size {
                log::warn!(
                    "target {} worker {}: RAW sideband msg length {} != xfer_size {}",
                    self.target.spec.target_number,
                    self.config.worker_number,
                    msg.length,
                    xfer_size
                );
            }
            if msg.sequence != self.raw_last_sequence {
                log::warn!(
                    "target {} worker {}: RAW sideband sequence {} != expected {}",
                    self.target.spec.target_number,
                    self.config.worker_number,
                    msg.sequence,
                    self.raw_last_sequence
                );
            }
            if self.raw_last_sequence == 0 {
                self.raw_prev_location = msg.location;
                self.raw_prev_length = 0;
            } else if msg.location <= self.raw_prev_location {
                continue; // stale/resent notice, discard
            }
            self.raw_last_sequence += 1;
            let data_length = (msg.location + msg.length).saturating_sub(self.raw_prev_location + self.raw_prev_length);
            self.raw_data_ready += data_length;
            self.raw_prev_location = msg.location;
            self.raw_prev_length = data_length;
        }
        self.raw_data_ready -= xfer_size;
        Ok(())
    }

    /// Returns `Some((payload, effective_xfer_size))` once enough data has
    /// arrived (or the final short tail was detected), or `None` on a clean
    /// EOF with nothing more to write.
    fn e2e_destination_wait(&mut self, is_last_op: bool, xfer_size: u64) -> Result<Option<(Vec<u8>, u64)>> {
        let (e2e, transport) = match (&self.target.e2e, &self.transport) {
            (Some(e2e), Some(transport)) => (e2e, transport),
            _ => return Ok(Some((Vec::new(), xfer_size))),
        };
        let connection_index = self.config.worker_number as usize;
        let mut data_ready: u64 = 0;
        let mut assembled = Vec::with_capacity(xfer_size as usize);

        loop {
            let (status, buf) = e2e
                .with_connection(transport, connection_index, true, |c| c.receive_target_buffer())
                .map_err(|source| Error::TransientIo {
                    target: self.target.spec.target_number,
                    worker: self.config.worker_number,
                    op: self.current_op,
                    source,
                })?;

            match status {
                ReceiveStatus::Eof => {
                    return Ok(None);
                }
                ReceiveStatus::Err => {
                    return Err(Error::Protocol {
                        target: self.target.spec.target_number,
                        worker: self.config.worker_number,
                        reason: "transport returned an error status".into(),
                    });
                }
                ReceiveStatus::Ok => {
                    if buf.sequence_number != self.expected_next_sequence {
                        return Err(Error::Protocol {
                            target: self.target.spec.target_number,
                            worker: self.config.worker_number,
                            reason: format!(
                                "expected sequence {}, got {}",
                                self.expected_next_sequence, buf.sequence_number
                            ),
                        });
                    }
                    self.expected_next_sequence += 1;

                    if self.primed && buf.target_offset <= self.previous_location {
                        continue; // stale/duplicate, discard
                    }
                    let end = buf.target_offset + buf.data_length as u64;
                    let prev_end = self.previous_location + self.previous_length;
                    data_ready += end.saturating_sub(prev_end);
                    self.previous_location = buf.target_offset;
                    self.previous_length = buf.data_length as u64;
                    self.primed = true;
                    self.current_byte_location = buf.target_offset;
                    assembled = buf.payload;

                    let short_tail = is_last_op && (buf.data_length as u64) < xfer_size;
                    if short_tail {
                        return Ok(Some((assembled, buf.data_length as u64)));
                    }
                    if data_ready >= xfer_size {
                        return Ok(Some((assembled, xfer_size)));
                    }
                }
            }
        }
    }

    /// Stamp and submit the buffer this op's `issue_io` just produced, then
    /// ask the transport for a fresh one for the next disk read (§4.2
    /// "Source send path"). `payload` is whatever `issue_io` read off disk
    /// for this op — reusing it here avoids a second trip to the file.
    fn e2e_source_send(&mut self, xfer_size: u64, payload: Vec<u8>) -> Result<()> {
        let (e2e, transport) = match (&self.target.e2e, &self.transport) {
            (Some(e2e), Some(transport)) => (e2e, transport),
            _ => return Ok(()),
        };
        let connection_index = self.config.worker_number as usize;
        let target_buffer = TargetBuffer {
            sequence_number: self.current_op,
            target_offset: self.current_byte_location,
            data_length: xfer_size as u32,
            payload,
        };
        e2e.with_connection(transport, connection_index, false, |c| {
            c.send_target_buffer(&target_buffer)?;
            c.request_target_buffer()
        })
        .map_err(|source| Error::TransientIo {
            target: self.target.spec.target_number,
            worker: self.config.worker_number,
            op: self.current_op,
            source,
        })?;
        Ok(())
    }

    /// Reads or writes `xfer_size` bytes at `current_byte_location` and
    /// returns whatever bytes took part: the payload written (destination
    /// writes, or a plain local write) or the bytes just read (a plain
    /// local read, or a source about to forward them over E2E).
    ///
    /// The actual syscall runs against a buffer leased from the target's
    /// pool, bracketed by `lease_blocking`/`release`, so no two workers ever
    /// hold the same slot while its data is live on the wire to disk (§4.5,
    /// invariant I-2).
    fn issue_io(
        &self,
        op_kind: OpKind,
        xfer_size: u64,
        received_payload: Option<Vec<u8>>,
    ) -> std::io::Result<Vec<u8>> {
        let handle = self.target.buffer_pool.lease_blocking();
        let result = self.issue_io_with_buffer(handle, op_kind, xfer_size, received_payload);
        self.target.buffer_pool.release(handle);
        result
    }

    fn issue_io_with_buffer(
        &self,
        handle: BufferHandle,
        op_kind: OpKind,
        xfer_size: u64,
        received_payload: Option<Vec<u8>>,
    ) -> std::io::Result<Vec<u8>> {
        let mut file = self.target.file.lock().expect("file lock poisoned");
        file.seek(SeekFrom::Start(self.current_byte_location))?;
        let len = xfer_size as usize;
        match op_kind {
            OpKind::Write => {
                let payload = received_payload.unwrap_or_else(|| vec![0u8; len]);
                // SAFETY: this worker holds the lease on `handle` for the
                // full duration of this call.
                let buf = unsafe { self.target.buffer_pool.data_mut(handle) };
                buf[..len].copy_from_slice(&payload[..len]);
                file.write_all(&buf[..len])?;
                file.flush()?;
                Ok(payload)
            }
            OpKind::Read => {
                // SAFETY: see above.
                let buf = unsafe { self.target.buffer_pool.data_mut(handle) };
                file.read_exact(&mut buf[..len])?;
                Ok(buf[..len].to_vec())
            }
            OpKind::Noop | OpKind::Eof => Ok(Vec::new()),
        }
    }
}

/// Sends an EOF marker on every connection of a source E2E target, once all
/// scheduled operations have completed (§4.2 "EOF").
pub fn send_eof_on_all_connections<T: Transport>(
    e2e: &crate::net::E2eState<T>,
    transport: &T,
    next_sequence: u64,
) {
    for idx in 0..e2e.connection_count() {
        let _ = e2e.with_connection(transport, idx, false, |c| c.send_target_buffer(&TargetBuffer::eof(next_sequence)));
    }
}
