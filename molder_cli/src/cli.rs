//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "molder", version, about = "Injection-molding process controller")]
pub struct Cli {
    /// Path to config TOML (typed); built-in defaults when absent
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Optional SPC tolerance CSV (strict metric,usl,lsl header)
    #[arg(long, value_name = "FILE")]
    pub spec_limits: Option<PathBuf>,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Memory locking mode for real-time operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RtLock {
    /// Do not lock memory
    None,
    /// Lock currently resident pages
    Current,
    /// Lock current and future pages
    All,
}

impl RtLock {
    #[inline]
    pub fn os_default() -> Self {
        #[cfg(target_os = "linux")]
        {
            return RtLock::Current;
        }
        #[allow(unreachable_code)]
        RtLock::None
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run simulated production cycles
    Run {
        /// Number of cycles to produce
        #[arg(long, default_value_t = 1)]
        cycles: u64,
        /// Read sensors inside the control loop instead of the feed thread
        #[arg(long, action = ArgAction::SetTrue)]
        direct: bool,
        /// Start with zones cold instead of preheated to setpoint
        #[arg(long, action = ArgAction::SetTrue)]
        cold_start: bool,
        /// Append one JSON line per finalized cycle to this file
        #[arg(long, value_name = "FILE")]
        cycle_log: Option<PathBuf>,
        /// Disable the in-process advisor thread
        #[arg(long, action = ArgAction::SetTrue)]
        no_advisor: bool,
        /// Enable real-time mode (SCHED_FIFO, affinity, mlockall)
        #[arg(
            long,
            action = ArgAction::SetTrue,
            long_help = "Enable real-time mode on supported OSes.\n\nLinux: Attempts SCHED_FIFO priority, pins to one CPU, and locks process memory to reduce page faults and jitter. May require elevated privileges or raised memlock ulimits. Use with care on shared systems."
        )]
        rt: bool,
        /// Real-time priority for SCHED_FIFO on Linux (1..=max)
        #[arg(long, value_name = "PRIO")]
        rt_prio: Option<i32>,
        /// Select memory locking mode for --rt: none, current, or all
        #[arg(long, value_enum, value_name = "MODE")]
        rt_lock: Option<RtLock>,
        /// CPU index to pin the process to (Linux only, default 0)
        #[arg(long, value_name = "CPU")]
        rt_cpu: Option<usize>,
    },
    /// Parse and validate the configuration, then exit
    CheckConfig,
    /// Quick health check (simulated machine ticks cleanly)
    SelfCheck,
}
