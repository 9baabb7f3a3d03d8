//! Daemon configuration
//!
//! Everything is environment-driven with conservative defaults; the working
//! directory and permission mode are explicit parameters of the session
//! runner rather than ambient lookups scattered through the call path.

use std::path::PathBuf;
use std::time::Duration;

use crate::monitor::MonitorConfig;

pub const DEFAULT_PORT: u16 = 18900;

/// Default glob patterns for the directory-scan discovery fallback.
pub const DEFAULT_SCAN_PATTERNS: &[&str] = &["*.md", "*.json"];

/// Permission mode handed to the engine. Under `Manual` the engine's
/// filesystem-writing tool calls get denied and surface as error tool
/// results; discovery then reports no files rather than failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionMode {
    #[default]
    Manual,
    AcceptEdits,
    Bypass,
}

impl PermissionMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "acceptEdits" => PermissionMode::AcceptEdits,
            "bypassPermissions" => PermissionMode::Bypass,
            _ => PermissionMode::Manual,
        }
    }

    /// Flag value in the engine CLI's vocabulary.
    pub fn as_flag(self) -> &'static str {
        match self {
            PermissionMode::Manual => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Bypass => "bypassPermissions",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Per-instance working directory for engine sessions.
    pub work_dir: PathBuf,
    /// Command line used to spawn the engine (program + fixed args).
    pub engine_cmd: String,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    /// Wall-clock bound for ordinary chat turns.
    pub turn_timeout: Duration,
    /// Wall-clock bound for research turns (multi-hop search + writes).
    pub research_timeout: Duration,
    /// Files larger than this keep their checksum but drop inline content.
    pub max_inline_file_bytes: u64,
    pub monitor: MonitorConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("RELAY_PORT", DEFAULT_PORT),
            work_dir: std::env::var("RELAY_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
                }),
            engine_cmd: std::env::var("RELAY_ENGINE_CMD")
                .unwrap_or_else(|_| "claude --print --output-format stream-json".to_string()),
            model: std::env::var("RELAY_MODEL").ok(),
            permission_mode: std::env::var("RELAY_PERMISSION_MODE")
                .map(|v| PermissionMode::parse(&v))
                .unwrap_or_default(),
            turn_timeout: Duration::from_secs(env_parse("RELAY_TIMEOUT_SECS", 300u64)),
            research_timeout: Duration::from_secs(env_parse(
                "RELAY_RESEARCH_TIMEOUT_SECS",
                2400u64,
            )),
            max_inline_file_bytes: env_parse(
                "RELAY_MAX_INLINE_FILE_BYTES",
                10 * 1024 * 1024u64,
            ),
            monitor: MonitorConfig::from_env(),
        }
    }

    /// Resolve the working directory for one turn.
    ///
    /// Research commands run two levels above the instance directory so the
    /// engine can reach the shared output folder; the wrong directory makes
    /// the engine silently fail to persist anything.
    pub fn resolve_work_dir(&self, research: bool) -> PathBuf {
        if research {
            self.work_dir
                .parent()
                .and_then(|p| p.parent())
                .map(PathBuf::from)
                .unwrap_or_else(|| self.work_dir.clone())
        } else {
            self.work_dir.clone()
        }
    }

    pub fn timeout_for(&self, research: bool) -> Duration {
        if research {
            self.research_timeout
        } else {
            self.turn_timeout
        }
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_at(dir: &str) -> Config {
        Config {
            port: DEFAULT_PORT,
            work_dir: PathBuf::from(dir),
            engine_cmd: String::new(),
            model: None,
            permission_mode: PermissionMode::Manual,
            turn_timeout: Duration::from_secs(300),
            research_timeout: Duration::from_secs(2400),
            max_inline_file_bytes: 10 * 1024 * 1024,
            monitor: MonitorConfig::default(),
        }
    }

    #[test]
    fn test_research_work_dir_is_two_levels_up() {
        let config = config_at("/srv/instances/alpha");
        assert_eq!(config.resolve_work_dir(false), PathBuf::from("/srv/instances/alpha"));
        assert_eq!(config.resolve_work_dir(true), PathBuf::from("/srv"));
    }

    #[test]
    fn test_research_work_dir_falls_back_near_root() {
        let config = config_at("/srv");
        assert_eq!(config.resolve_work_dir(true), PathBuf::from("/srv"));
    }

    #[test]
    fn test_permission_mode_parsing() {
        assert_eq!(PermissionMode::parse("acceptEdits"), PermissionMode::AcceptEdits);
        assert_eq!(PermissionMode::parse("bypassPermissions"), PermissionMode::Bypass);
        assert_eq!(PermissionMode::parse("anything-else"), PermissionMode::Manual);
    }
}
