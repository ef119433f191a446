//! Pool configuration
//!
//! Configuration is read once from the environment when the process-wide
//! manager is created; explicit [`PoolConfig`] values are used everywhere
//! else (tests construct pools directly).
//!
//! # Environment Variables
//!
//! - `HIPPOOL_POOL`: pool selection, one of "simple", "split", "dummy".
//!   "binned" is recognised but not built into this crate and is rejected.
//!   Unset selects the split pool.
//! - `HIPPOOL_MEMORY_LIMIT`: cap on driver-held bytes, parsed as integer
//!   bytes. Unset means no limit.
//! - `HIPPOOL_TRACE`: truthy values ("1", "true", "yes", "on") enable the
//!   per-pool stats summary at process exit.

use crate::error::{PoolError, PoolResult};

/// Environment variable for pool selection
const POOL_ENV: &str = "HIPPOOL_POOL";

/// Environment variable for the driver byte limit
const MEMORY_LIMIT_ENV: &str = "HIPPOOL_MEMORY_LIMIT";

/// Environment variable enabling the exit summary
const TRACE_ENV: &str = "HIPPOOL_TRACE";

/// Which pool implementation to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolKind {
    /// Passthrough pool: no caching, every request hits the driver.
    Dummy,
    /// Linear free-list of whole driver buffers, no splitting.
    Simple,
    /// Size-class-segregated block pool with splitting and coalescing.
    #[default]
    Split,
}

impl PoolKind {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "dummy" | "none" => Some(PoolKind::Dummy),
            "simple" => Some(PoolKind::Simple),
            "split" => Some(PoolKind::Split),
            _ => None,
        }
    }

    /// Name used in log lines and the exit summary.
    pub fn name(&self) -> &'static str {
        match self {
            PoolKind::Dummy => "dummy",
            PoolKind::Simple => "simple",
            PoolKind::Split => "split",
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool implementation to install
    pub kind: PoolKind,
    /// Whether the kind came from an explicit user selection (controls the
    /// exit summary)
    pub explicit_kind: bool,
    /// Cap on bytes held from the driver; `None` means unlimited
    pub memory_limit: Option<usize>,
    /// Whether the split pool may carve remainders off oversized blocks
    pub split: bool,
    /// Verbose per-pool stats at process exit
    pub trace: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            kind: PoolKind::default(),
            explicit_kind: false,
            memory_limit: None,
            split: true,
            trace: false,
        }
    }
}

impl PoolConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool kind (marks the selection as explicit)
    pub fn with_kind(mut self, kind: PoolKind) -> Self {
        self.kind = kind;
        self.explicit_kind = true;
        self
    }

    /// Set the driver byte limit
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// Enable or disable split-on-alloc in the split pool
    pub fn with_split(mut self, split: bool) -> Self {
        self.split = split;
        self
    }

    /// Enable or disable the exit summary
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Read configuration from the environment.
    ///
    /// Unset variables fall back to defaults. Unparsable values are
    /// configuration errors rather than silent fallbacks: a user who set
    /// `HIPPOOL_MEMORY_LIMIT` to garbage wants to hear about it, not run
    /// unlimited.
    pub fn from_env() -> PoolResult<Self> {
        let mut config = PoolConfig::new();

        if let Ok(raw) = std::env::var(POOL_ENV) {
            if raw.eq_ignore_ascii_case("binned") {
                return Err(PoolError::InvalidConfiguration(format!(
                    "{}=binned: the binned pool is not built into this crate \
                     (use \"simple\", \"split\" or \"dummy\")",
                    POOL_ENV
                )));
            }
            let kind = PoolKind::parse(&raw).ok_or_else(|| {
                PoolError::InvalidConfiguration(format!(
                    "{}={}: unknown pool (use \"simple\", \"split\" or \"dummy\")",
                    POOL_ENV, raw
                ))
            })?;
            config = config.with_kind(kind);
        }

        if let Ok(raw) = std::env::var(MEMORY_LIMIT_ENV) {
            let limit = raw.trim().parse::<usize>().map_err(|_| {
                PoolError::InvalidConfiguration(format!(
                    "{}={}: expected integer bytes",
                    MEMORY_LIMIT_ENV, raw
                ))
            })?;
            config = config.with_memory_limit(limit);
        }

        if let Ok(raw) = std::env::var(TRACE_ENV) {
            config = config.with_trace(is_truthy(&raw));
        }

        Ok(config)
    }
}

fn is_truthy(s: &str) -> bool {
    matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        std::env::remove_var(POOL_ENV);
        std::env::remove_var(MEMORY_LIMIT_ENV);
        std::env::remove_var(TRACE_ENV);
    }

    #[test]
    fn test_pool_kind_parse() {
        assert_eq!(PoolKind::parse("simple"), Some(PoolKind::Simple));
        assert_eq!(PoolKind::parse("SPLIT"), Some(PoolKind::Split));
        assert_eq!(PoolKind::parse("dummy"), Some(PoolKind::Dummy));
        assert_eq!(PoolKind::parse("none"), Some(PoolKind::Dummy));
        assert_eq!(PoolKind::parse("binned"), None);
        assert_eq!(PoolKind::parse("bogus"), None);
    }

    #[test]
    fn test_builder() {
        let config = PoolConfig::new()
            .with_kind(PoolKind::Simple)
            .with_memory_limit(1 << 30)
            .with_split(false)
            .with_trace(true);
        assert_eq!(config.kind, PoolKind::Simple);
        assert!(config.explicit_kind);
        assert_eq!(config.memory_limit, Some(1 << 30));
        assert!(!config.split);
        assert!(config.trace);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = PoolConfig::from_env().unwrap();
        assert_eq!(config.kind, PoolKind::Split);
        assert!(!config.explicit_kind);
        assert_eq!(config.memory_limit, None);
        assert!(!config.trace);
    }

    #[test]
    #[serial]
    fn test_from_env_selection_and_limit() {
        clear_env();
        std::env::set_var(POOL_ENV, "simple");
        std::env::set_var(MEMORY_LIMIT_ENV, "1048576");
        std::env::set_var(TRACE_ENV, "yes");
        let config = PoolConfig::from_env().unwrap();
        assert_eq!(config.kind, PoolKind::Simple);
        assert!(config.explicit_kind);
        assert_eq!(config.memory_limit, Some(1 << 20));
        assert!(config.trace);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_binned() {
        clear_env();
        std::env::set_var(POOL_ENV, "binned");
        let err = PoolConfig::from_env().unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfiguration(_)));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_limit() {
        clear_env();
        std::env::set_var(MEMORY_LIMIT_ENV, "lots");
        let err = PoolConfig::from_env().unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfiguration(_)));
        clear_env();
    }
}
