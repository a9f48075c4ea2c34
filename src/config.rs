//! Optional TOML/serde configuration layer (§4.10), gated behind the
//! `config` feature. This is a data-shape concern, not argument parsing: it
//! materializes the same [`TargetSpec`]/[`Plan`] values an external CLI
//! (out of scope for this crate) would otherwise build field by field.

use crate::clock::OpKind;
use crate::gates::{Throttle, ThrottleMode};
use crate::target::{RawMode, TargetOptions, TargetSpec};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Plain, serializable mirror of [`TargetOptions`]'s named bits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetOptionsConfig {
    pub dio: bool,
    pub sgio: bool,
    pub delete_file: bool,
    pub end_to_end: bool,
    pub e2e_source: bool,
    pub e2e_destination: bool,
    pub wait_for_start: bool,
    pub raw: bool,
    pub raw_reader: bool,
    pub restart_enable: bool,
    pub ts_on: bool,
}

impl From<&TargetOptionsConfig> for TargetOptions {
    fn from(c: &TargetOptionsConfig) -> Self {
        let mut options = TargetOptions::empty();
        options.set(TargetOptions::DIO, c.dio);
        options.set(TargetOptions::SGIO, c.sgio);
        options.set(TargetOptions::DELETEFILE, c.delete_file);
        options.set(TargetOptions::ENDTOEND, c.end_to_end);
        options.set(TargetOptions::E2E_SOURCE, c.e2e_source);
        options.set(TargetOptions::E2E_DESTINATION, c.e2e_destination);
        options.set(TargetOptions::WAITFORSTART, c.wait_for_start);
        options.set(TargetOptions::RAW, c.raw);
        options.set(TargetOptions::RAW_READER, c.raw_reader);
        options.set(TargetOptions::RESTART_ENABLE, c.restart_enable);
        options.set(TargetOptions::TS_ON, c.ts_on);
        options
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKindConfig {
    Read,
    Write,
}

impl From<OpKindConfig> for OpKind {
    fn from(c: OpKindConfig) -> Self {
        match c {
            OpKindConfig::Read => OpKind::Read,
            OpKindConfig::Write => OpKind::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Fixed per-operation delay, in seconds. `0.0` disables delay mode.
    pub delay_seconds: f64,
}

impl From<ThrottleConfig> for Throttle {
    fn from(c: ThrottleConfig) -> Self {
        if c.delay_seconds > 0.0 {
            Throttle {
                mode: ThrottleMode::Delay,
                delay_seconds: c.delay_seconds,
            }
        } else {
            Throttle::none()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub target_number: u32,
    pub full_pathname: PathBuf,
    #[serde(default)]
    pub options: TargetOptionsConfig,
    pub block_size: u64,
    pub xfer_size: u64,
    pub operations_per_worker: u64,
    pub worker_count: u32,
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    #[serde(default = "default_op_kind")]
    pub op_kind: OpKindConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default = "default_timestamp_capacity")]
    pub timestamp_capacity: usize,
}

fn default_buffer_count() -> usize {
    4
}

fn default_op_kind() -> OpKindConfig {
    OpKindConfig::Write
}

fn default_timestamp_capacity() -> usize {
    65_536
}

impl From<TargetConfig> for TargetSpec {
    fn from(c: TargetConfig) -> Self {
        TargetSpec {
            target_number: c.target_number,
            full_pathname: c.full_pathname,
            options: TargetOptions::from(&c.options),
            block_size: c.block_size,
            xfer_size: c.xfer_size,
            operations_per_worker: c.operations_per_worker,
            worker_count: c.worker_count,
            buffer_count: c.buffer_count,
            op_kind: c.op_kind.into(),
            throttle: c.throttle.into(),
            raw_mode: if c.options.raw_reader { Some(RawMode::Stat) } else { None },
            timestamp_capacity: c.timestamp_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default = "default_passes")]
    pub passes: u32,
    #[serde(default)]
    pub syncio: u64,
    #[serde(default = "default_restart_frequency")]
    pub restart_frequency_seconds: u64,
    pub targets: Vec<TargetConfig>,
}

fn default_passes() -> u32 {
    1
}

fn default_restart_frequency() -> u64 {
    10
}

impl PlanConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml_plan() {
        let toml = r#"
            passes = 2
            syncio = 4

            [[targets]]
            target_number = 0
            full_pathname = "/tmp/xdrive-target-0.bin"
            block_size = 4096
            xfer_size = 4096
            operations_per_worker = 16
            worker_count = 2
        "#;
        let parsed = PlanConfig::from_toml_str(toml).unwrap();
        assert_eq!(parsed.passes, 2);
        assert_eq!(parsed.syncio, 4);
        assert_eq!(parsed.targets.len(), 1);
        assert_eq!(parsed.targets[0].worker_count, 2);
        assert_eq!(parsed.targets[0].buffer_count, 4);
    }

    #[test]
    fn option_flags_map_onto_bitset() {
        let mut cfg = TargetOptionsConfig::default();
        cfg.dio = true;
        cfg.e2e_destination = true;
        let options: TargetOptions = (&cfg).into();
        assert!(options.contains(TargetOptions::DIO));
        assert!(options.contains(TargetOptions::E2E_DESTINATION));
        assert!(!options.contains(TargetOptions::RAW));
    }
}
