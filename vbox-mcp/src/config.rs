//! Startup configuration, loaded once from the environment.
//!
//! Mirrors `spec.md` §6 (Configuration): `TOOL_MODE`, `VBOX_INSTALL_PATH`,
//! `VBOX_USER_HOME`, `LOG_LEVEL`. None of these are re-read after startup —
//! the registry and orchestrator are constructed once and held read-only
//! for the process lifetime (`spec.md` §5, "Shared mutable state").

use std::env;
use std::path::PathBuf;

use vbox_mcp_shared::constants::{env as env_names, tool_mode};

/// How the Tool Registry exposes tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolMode {
    /// The five portmanteau tools, plus `hyperv_management` when available.
    Production,
    /// Portmanteau tools and one standalone tool per orchestrator operation.
    Testing,
}

impl ToolMode {
    fn from_env_value(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            v if v == tool_mode::TESTING || v == tool_mode::ALL => ToolMode::Testing,
            _ => ToolMode::Production,
        }
    }
}

/// Log verbosity, mapped onto `tracing`'s level filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn from_env_value(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "warning" | "warn" => LogLevel::Warning,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Startup configuration for the server.
#[derive(Debug, Clone)]
pub struct Config {
    pub tool_mode: ToolMode,
    /// Directory containing the `VBoxManage` binary, if set explicitly.
    pub vbox_install_path: Option<PathBuf>,
    /// VirtualBox's home directory, if set explicitly.
    pub vbox_user_home: Option<PathBuf>,
    pub log_level: LogLevel,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        let tool_mode = env::var(env_names::TOOL_MODE)
            .map(|v| ToolMode::from_env_value(&v))
            .unwrap_or(ToolMode::Production);

        let vbox_install_path = env::var_os(env_names::VBOX_INSTALL_PATH).map(PathBuf::from);
        let vbox_user_home = env::var_os(env_names::VBOX_USER_HOME).map(PathBuf::from);

        let log_level = env::var(env_names::LOG_LEVEL)
            .map(|v| LogLevel::from_env_value(&v))
            .unwrap_or(LogLevel::Info);

        Self {
            tool_mode,
            vbox_install_path,
            vbox_user_home,
            log_level,
        }
    }

    /// Resolve the `VBoxManage` executable path.
    ///
    /// Order: `$VBOX_INSTALL_PATH/VBoxManage[.exe]`, else a bare
    /// `VBoxManage[.exe]` for `$PATH` resolution by the process runner.
    pub fn vboxmanage_binary(&self) -> PathBuf {
        let exe_name = if cfg!(target_os = "windows") {
            "VBoxManage.exe"
        } else {
            "VBoxManage"
        };

        match &self.vbox_install_path {
            Some(dir) => dir.join(exe_name),
            None => PathBuf::from(exe_name),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tool_mode: ToolMode::Production,
            vbox_install_path: None,
            vbox_user_home: None,
            log_level: LogLevel::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_production_mode() {
        let cfg = Config::default();
        assert_eq!(cfg.tool_mode, ToolMode::Production);
    }

    #[test]
    fn tool_mode_parses_testing_and_all() {
        assert_eq!(ToolMode::from_env_value("testing"), ToolMode::Testing);
        assert_eq!(ToolMode::from_env_value("ALL"), ToolMode::Testing);
        assert_eq!(ToolMode::from_env_value("production"), ToolMode::Production);
        assert_eq!(ToolMode::from_env_value("bogus"), ToolMode::Production);
    }

    #[test]
    fn binary_path_joins_install_dir() {
        let mut cfg = Config::default();
        cfg.vbox_install_path = Some(PathBuf::from("/opt/VirtualBox"));
        let exe = cfg.vboxmanage_binary();
        assert!(exe.starts_with("/opt/VirtualBox"));
    }

    #[test]
    fn binary_path_falls_back_to_path_lookup() {
        let cfg = Config::default();
        let exe = cfg.vboxmanage_binary();
        assert_eq!(exe, PathBuf::from(if cfg!(target_os = "windows") {
            "VBoxManage.exe"
        } else {
            "VBoxManage"
        }));
    }
}
