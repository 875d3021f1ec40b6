//! Operator Configuration
//!
//! Tunables for the controller and the node agent. Both can be loaded from
//! a YAML file; command-line flags override individual values afterwards.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Controller Configuration
// =============================================================================

/// Configuration for the central reconcile loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Interval at which every tracker is re-queued regardless of events
    pub resync_interval_secs: u64,
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Attempts of the steady-state step before giving up on conflicts
    pub max_conflict_retries: u32,
    /// Deadline for each call to the store
    pub call_timeout_secs: u64,
    /// First delay before retrying a failed reconcile
    pub retry_initial_delay_ms: u64,
    /// Upper bound for the retry delay
    pub retry_max_delay_secs: u64,
    /// Capacity of the trigger channel between watchers and scheduler
    pub event_buffer: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: 300,
            workers: 4,
            max_conflict_retries: 5,
            call_timeout_secs: 10,
            retry_initial_delay_ms: 500,
            retry_max_delay_secs: 60,
            event_buffer: 1024,
        }
    }
}

impl ControllerConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_secs)
    }

    /// Reject values that would stall or spin the loop
    pub fn validate(&self) -> Result<()> {
        if self.resync_interval_secs == 0 {
            return Err(Error::Configuration("resyncIntervalSecs must be > 0".into()));
        }
        if self.workers == 0 {
            return Err(Error::Configuration("workers must be > 0".into()));
        }
        if self.max_conflict_retries == 0 {
            return Err(Error::Configuration("maxConflictRetries must be > 0".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(Error::Configuration("callTimeoutSecs must be > 0".into()));
        }
        if self.event_buffer == 0 {
            return Err(Error::Configuration("eventBuffer must be > 0".into()));
        }
        if self.retry_initial_delay() > self.retry_max_delay() {
            return Err(Error::Configuration(
                "retryInitialDelayMs must not exceed retryMaxDelaySecs".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Agent Configuration
// =============================================================================

/// Configuration for the per-node reporting loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    /// Name of the node this agent reports for
    pub node_name: String,
    /// Interval between report cycles
    pub report_interval_secs: u64,
    /// Deadline for each call to the store
    pub call_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            report_interval_secs: 60,
            call_timeout_secs: 10,
        }
    }
}

impl AgentConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Reject an unnamed node or zero intervals
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::Configuration("nodeName must be set".into()));
        }
        if self.report_interval_secs == 0 {
            return Err(Error::Configuration("reportIntervalSecs must be > 0".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(Error::Configuration("callTimeoutSecs must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Parse a configuration document from YAML
pub fn from_yaml<T: for<'de> Deserialize<'de>>(yaml: &str) -> Result<T> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Load configuration from a YAML file, or defaults when no path is given
pub fn load<T>(path: Option<&Path>) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            from_yaml(&raw)
        }
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.resync_interval(), Duration::from_secs(300));
        assert_eq!(config.workers, 4);
        assert!(config.validate().is_ok());

        let agent = AgentConfig::default();
        assert_eq!(agent.report_interval(), Duration::from_secs(60));
        // Node name has no sensible default
        assert!(agent.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: ControllerConfig = from_yaml("workers: 8\nresyncIntervalSecs: 30\n").unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.resync_interval_secs, 30);
        assert_eq!(config.max_conflict_retries, 5);

        let agent: AgentConfig = from_yaml("nodeName: node-1\n").unwrap();
        assert_eq!(agent.node_name, "node-1");
        assert!(agent.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = ControllerConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ControllerConfig {
            retry_initial_delay_ms: 120_000,
            retry_max_delay_secs: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_yaml() {
        let result: Result<ControllerConfig> = from_yaml("workers: [1, 2");
        assert!(matches!(result, Err(Error::YamlParse(_))));
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nodeName: node-7\nreportIntervalSecs: 15").unwrap();

        let agent: AgentConfig = load(Some(file.path())).unwrap();
        assert_eq!(agent.node_name, "node-7");
        assert_eq!(agent.report_interval(), Duration::from_secs(15));
        assert_eq!(agent.call_timeout_secs, 10);

        let missing: Result<AgentConfig> = load(Some(Path::new("/nonexistent/agent.yaml")));
        assert!(matches!(missing, Err(Error::Io(_))));
    }

    #[test]
    fn test_load_without_path_uses_defaults() {
        let config: ControllerConfig = load(None).unwrap();
        assert_eq!(config, ControllerConfig::default());
    }
}
