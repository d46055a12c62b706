//! Shared constants: environment variable names and default timeouts.
//!
//! These must stay in sync with `spec.md` §6 (Configuration) and §4.A
//! (Process Runner timeouts) since both the orchestrator and the stdio
//! harness read them.

/// Environment variables consumed at startup.
pub mod env {
    /// `production` (default) | `testing` | `all` (synonym for testing).
    pub const TOOL_MODE: &str = "TOOL_MODE";

    /// Directory containing the `VBoxManage` binary.
    pub const VBOX_INSTALL_PATH: &str = "VBOX_INSTALL_PATH";

    /// VirtualBox's home directory (`~/VirtualBox VMs` by default).
    pub const VBOX_USER_HOME: &str = "VBOX_USER_HOME";

    /// `debug` | `info` | `warning` | `error`.
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
}

/// Default timeouts for VBoxManage invocations, in seconds.
pub mod timeouts {
    /// Default timeout for read-only queries (`list`, `showvminfo`, ...).
    pub const QUERY_SECS: u64 = 60;

    /// Default timeout for mutating operations (`start`, `modifyvm`, ...).
    pub const WRITE_SECS: u64 = 15 * 60;

    /// Grace period between a terminate signal and an escalated kill.
    pub const CANCEL_GRACE_SECS: u64 = 5;
}

/// Job tracker retention policy (`spec.md` §4.E).
pub mod jobs {
    /// Minimum time a terminal job is retained before eviction, in seconds.
    pub const MIN_RETENTION_SECS: u64 = 60 * 60;

    /// Maximum number of retained jobs; oldest terminal jobs evicted first.
    pub const MAX_RETAINED: usize = 1_000;

    /// Interval between background retention sweeps, in seconds.
    pub const SWEEP_INTERVAL_SECS: u64 = 5 * 60;
}

/// Tool exposure modes (`spec.md` §4.F).
pub mod tool_mode {
    pub const PRODUCTION: &str = "production";
    pub const TESTING: &str = "testing";
    pub const ALL: &str = "all";
}
