//! Runtime options.
//!
//! Everything is a flag with an environment-variable fallback. The parent
//! process forwards its resolved options to the child processes it spawns
//! through `ROVER_OPTIONS` (a JSON rendering of this struct), so one parse
//! governs all four processes.

use std::path::PathBuf;

use clap::Args;
use serde::{Deserialize, Serialize};

pub const OPTIONS_ENV: &str = "ROVER_OPTIONS";

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct Options {
    /// Addresses the router frontend binds (clients connect here).
    #[arg(
        long,
        env = "ROVER_ROUTER_FRONTEND",
        value_delimiter = ',',
        default_value = "tcp://127.0.0.1:6000,ipc:///tmp/rover-rpc.sock"
    )]
    pub router_frontend: Vec<String>,

    /// Addresses the router backend binds (services connect here).
    #[arg(
        long,
        env = "ROVER_ROUTER_BACKEND",
        value_delimiter = ',',
        default_value = "ipc:///tmp/rover-srv.sock"
    )]
    pub router_backend: Vec<String>,

    /// Address receiving gamepad/field control input.
    #[arg(long, env = "ROVER_CONTROL_ADDR", default_value = "udp://127.0.0.1:6002")]
    pub control_addr: String,

    /// Multicast group receiving Smart Device update snapshots.
    #[arg(long, env = "ROVER_UPDATE_ADDR", default_value = "udp://224.1.1.1:6003")]
    pub update_addr: String,

    /// Seconds between update snapshots.
    #[arg(long, env = "ROVER_UPDATE_INTERVAL", default_value_t = 0.1)]
    pub update_interval: f64,

    /// Device catalog file (JSON).
    #[arg(long, env = "ROVER_DEV_CATALOG", default_value = "config/catalog.json")]
    pub dev_catalog: PathBuf,

    /// Human-readable device names, as NAME:UID pairs.
    #[arg(long = "dev-name", env = "ROVER_DEV_NAMES", value_delimiter = ',')]
    pub dev_names: Vec<String>,

    /// Smart Device serial baud rate.
    #[arg(long, env = "ROVER_DEV_BAUD_RATE", default_value_t = 115_200)]
    pub dev_baud_rate: u32,

    /// Seconds between buffer polls per device session.
    #[arg(long, env = "ROVER_DEV_POLL_INTERVAL", default_value_t = 0.04)]
    pub dev_poll_interval: f64,

    /// Serial port patterns to watch (trailing-star globs).
    #[arg(
        long = "dev-pattern",
        env = "ROVER_DEV_PATTERNS",
        value_delimiter = ',',
        default_value = "/dev/ttyACM*"
    )]
    pub dev_patterns: Vec<String>,

    /// Address accepting virtual Smart Device connections.
    #[arg(long, env = "ROVER_DEV_VSD_ADDR", default_value = "tcp://127.0.0.1:6004")]
    pub dev_vsd_addr: String,

    /// Per-function execution deadlines, as PATTERN:SECONDS pairs resolved
    /// in order (first match wins).
    #[arg(
        long = "exec-timeout",
        env = "ROVER_EXEC_TIMEOUTS",
        value_delimiter = ',',
        default_value = ".*_setup:1,.*_main:0.05"
    )]
    pub exec_timeouts: Vec<String>,

    /// Student module to execute (a registered module name).
    #[arg(long, env = "ROVER_EXEC_MODULE", default_value = "blank")]
    pub exec_module: String,

    /// External lint command run over the student module by `lint()`.
    #[arg(long, env = "ROVER_LINT_COMMAND")]
    pub lint_command: Option<String>,

    /// Workers per remote-call service.
    #[arg(long, env = "ROVER_SERVICE_WORKERS", default_value_t = 5)]
    pub service_workers: usize,

    /// Seconds between health log lines.
    #[arg(long, env = "ROVER_HEALTH_INTERVAL", default_value_t = 60.0)]
    pub health_interval: f64,

    /// Minimum log severity.
    #[arg(long, env = "ROVER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log record format.
    #[arg(long, env = "ROVER_LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,

    /// Namespace prefixing every shared-memory region name.
    #[arg(long, env = "ROVER_SHM_NAMESPACE", default_value = "")]
    pub shm_namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Options {
    /// `NAME:UID` pairs as a name table.
    pub fn device_names(
        &self,
    ) -> Result<std::collections::HashMap<String, rover_proto::DeviceUid>, String> {
        let mut names = std::collections::HashMap::new();
        for spec in &self.dev_names {
            let (name, uid) = spec
                .split_once(':')
                .ok_or_else(|| format!("expected NAME:UID, got {spec:?}"))?;
            let uid = uid
                .parse()
                .map_err(|_| format!("bad UID in {spec:?}"))?;
            names.insert(name.to_owned(), uid);
        }
        Ok(names)
    }

    pub fn to_env_json(&self) -> String {
        serde_json::to_string(self).expect("options serialize")
    }

    pub fn from_env_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
