use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Only `mem://<name>` is served in-process.
    pub endpoint: String,
    pub dedup_ttl_ms: u64,
    pub dedup_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://local".to_string(),
            dedup_ttl_ms: 60_000,
            dedup_capacity: 10_000,
        }
    }
}

impl BrokerConfig {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Per-agent cap on concurrently executing tasks.
    pub max_concurrent_tasks: usize,
    pub task_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            task_timeout_ms: 30_000,
            heartbeat_interval_ms: 5_000,
            max_retries: 3,
            backoff_base_ms: 200,
            backoff_cap_ms: 5_000,
        }
    }
}

impl RuntimeConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Max research children in flight at once.
    pub fanout_concurrency: usize,
    pub stage_deadline_ms: u64,
    /// Timeout for the single-worker stages (parse, extract, assemble).
    pub stage_timeout_ms: u64,
    /// Caller-level bound on a whole workflow.
    pub workflow_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fanout_concurrency: 4,
            stage_deadline_ms: 60_000,
            stage_timeout_ms: 30_000,
            workflow_timeout_ms: 300_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn stage_deadline(&self) -> Duration {
        Duration::from_millis(self.stage_deadline_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_millis(self.workflow_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub min_confidence: f64,
    pub max_nodes_per_task: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            max_nodes_per_task: 10,
        }
    }
}

/// How differing definition texts for one entity are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Text from the child whose best source is most confident.
    #[default]
    HighestConfidence,
    /// Text from the child that brought the most sources.
    MostSources,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub conflict_policy: ConflictPolicy,
    pub degraded_confidence_floor: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::default(),
            degraded_confidence_floor: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LivenessConfig {
    /// Unset means three heartbeat intervals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_after_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub runtime: RuntimeConfig,
    pub orchestrator: OrchestratorConfig,
    pub planner: PlannerConfig,
    pub aggregation: AggregationConfig,
    pub liveness: LivenessConfig,
}

fn parse_override<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name}: cannot parse {raw:?}")))
}

impl Config {
    pub fn glossa_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".glossa"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::glossa_dir()?.join("glossa.toml"))
    }

    pub fn stale_after(&self) -> Duration {
        match self.liveness.stale_after_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.runtime.heartbeat_interval() * 3,
        }
    }

    /// Load `~/.glossa/glossa.toml`, then apply `GLOSSA_*` overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load_from");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::glossa_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Apply environment overrides. An unparsable value is an error.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! env_override {
            ($name:literal, $field:expr) => {
                if let Some(raw) = lookup($name) {
                    $field = parse_override($name, &raw)?;
                    debug!(name = $name, value = %raw, "env override");
                }
            };
        }

        env_override!("GLOSSA_BROKER_ENDPOINT", self.broker.endpoint);
        env_override!("GLOSSA_DEDUP_TTL_MS", self.broker.dedup_ttl_ms);
        env_override!("GLOSSA_MAX_CONCURRENT_TASKS", self.runtime.max_concurrent_tasks);
        env_override!("GLOSSA_MAX_RETRIES", self.runtime.max_retries);
        env_override!("GLOSSA_BACKOFF_BASE_MS", self.runtime.backoff_base_ms);
        env_override!("GLOSSA_BACKOFF_CAP_MS", self.runtime.backoff_cap_ms);
        env_override!("GLOSSA_STAGE_DEADLINE_MS", self.orchestrator.stage_deadline_ms);
        env_override!("GLOSSA_FANOUT_CONCURRENCY", self.orchestrator.fanout_concurrency);
        env_override!("GLOSSA_MIN_CONFIDENCE", self.planner.min_confidence);
        env_override!("GLOSSA_MAX_NODES_PER_TASK", self.planner.max_nodes_per_task);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));

        if !(0.0..=1.0).contains(&self.planner.min_confidence) {
            return fail("planner.min_confidence must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.aggregation.degraded_confidence_floor) {
            return fail("aggregation.degraded_confidence_floor must be within [0, 1]");
        }
        if self.planner.max_nodes_per_task == 0 {
            return fail("planner.max_nodes_per_task must be positive");
        }
        if self.runtime.max_concurrent_tasks == 0 {
            return fail("runtime.max_concurrent_tasks must be positive");
        }
        if self.orchestrator.fanout_concurrency == 0 {
            return fail("orchestrator.fanout_concurrency must be positive");
        }
        if self.runtime.backoff_base_ms > self.runtime.backoff_cap_ms {
            return fail("runtime.backoff_base_ms exceeds backoff_cap_ms");
        }
        if self.runtime.heartbeat_interval_ms == 0 {
            return fail("runtime.heartbeat_interval_ms must be positive");
        }
        Ok(())
    }
}
