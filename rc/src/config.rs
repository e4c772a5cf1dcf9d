//! Run-control configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordinator::RepeatHaltPolicy;
use crate::cti::{ChannelRoles, CtiBinding};
use crate::domain::{Cluster, PrimaryPolicy};
use crate::error::RunControlError;
use crate::fallback::FallbackPolicy;
use crate::poller::PollConfig;

/// Main run-control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Convergence polling cadence
    #[serde(default)]
    pub poll: PollConfig,

    /// Behavior when a cluster member has no CTI binding
    #[serde(rename = "fallback-policy", default)]
    pub fallback_policy: FallbackPolicy,

    /// Behavior of a halt on an already halted cluster
    #[serde(rename = "repeat-halt", default)]
    pub repeat_halt: RepeatHaltPolicy,

    /// Debug targets, in declaration order
    #[serde(default)]
    pub cores: Vec<CoreConfig>,

    /// Clusters halted and resumed as a group
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl Default for Config {
    /// Two-core Cortex-R5 cluster with one CTI per core
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            fallback_policy: FallbackPolicy::default(),
            repeat_halt: RepeatHaltPolicy::default(),
            cores: vec![
                CoreConfig::new("r5.cpu0", Some(CtiBinding::new("r5.cti0", 0x8001_8000))),
                CoreConfig::new("r5.cpu1", Some(CtiBinding::new("r5.cti1", 0x8001_9000))),
            ],
            clusters: vec![ClusterConfig::new("r5", vec!["r5.cpu0".to_string(), "r5.cpu1".to_string()])],
        }
    }
}

impl Config {
    /// Check cross-references and channel assignments before use
    ///
    /// Every rejection names the offending core or cluster.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.poll.interval_ms == 0 {
            return Err(RunControlError::Config("poll.interval-ms must be greater than zero".to_string()));
        }

        let mut cores = HashSet::new();
        for core in &self.cores {
            if !cores.insert(core.name.as_str()) {
                return Err(RunControlError::Config(format!("core {} declared twice", core.name)));
            }
        }

        let mut clusters = HashSet::new();
        let mut owner: HashMap<&str, &str> = HashMap::new();
        for cluster in &self.clusters {
            if !clusters.insert(cluster.name.as_str()) {
                return Err(RunControlError::Config(format!("cluster {} declared twice", cluster.name)));
            }
            if cluster.members.is_empty() {
                return Err(RunControlError::Config(format!("cluster {} has no members", cluster.name)));
            }
            cluster
                .channels
                .validate()
                .map_err(|e| RunControlError::Config(format!("cluster {}: {}", cluster.name, e)))?;
            for member in &cluster.members {
                if !cores.contains(member.as_str()) {
                    return Err(RunControlError::Config(format!(
                        "cluster {} lists undeclared core {}",
                        cluster.name, member
                    )));
                }
                if let Some(other) = owner.insert(member.as_str(), cluster.name.as_str()) {
                    return Err(RunControlError::Config(format!(
                        "core {} is listed in clusters {} and {}",
                        member, other, cluster.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn core(&self, name: &str) -> Option<&CoreConfig> {
        self.cores.iter().find(|c| c.name == name)
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: ./runctl.yml
        let local_config = PathBuf::from("runctl.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/runctl/runctl.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("runctl").join("runctl.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// One debug target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub name: String,

    /// CTI instance wired to this core; absent for cores outside the trigger fabric
    #[serde(default)]
    pub cti: Option<CtiBinding>,

    #[serde(rename = "trigger-domain", default)]
    pub trigger_domain: u8,
}

impl CoreConfig {
    pub fn new(name: impl Into<String>, cti: Option<CtiBinding>) -> Self {
        Self {
            name: name.into(),
            cti,
            trigger_domain: 0,
        }
    }

    /// The CTI binding placed in this core's trigger domain
    pub fn binding(&self) -> Option<CtiBinding> {
        self.cti.clone().map(|mut cti| {
            cti.domain = self.trigger_domain;
            cti
        })
    }
}

/// One cluster of cores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,

    /// Member core names, in the order used for initiator and primary fallback
    pub members: Vec<String>,

    /// Convergence timeout in milliseconds
    #[serde(rename = "timeout-ms", default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub channels: ChannelRoles,

    #[serde(default)]
    pub primary: PrimaryPolicy,
}

fn default_timeout_ms() -> u64 {
    1000
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            name: name.into(),
            members,
            timeout_ms: default_timeout_ms(),
            channels: ChannelRoles::default(),
            primary: PrimaryPolicy::default(),
        }
    }

    pub fn to_cluster(&self) -> Cluster {
        Cluster::new(self.name.clone(), self.members.clone())
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_policy(self.primary)
            .with_channels(self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cti::Channel;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const R5_YAML: &str = r#"
poll:
  interval-ms: 5
fallback-policy: sequential
repeat-halt: suppress
cores:
  - name: r5.cpu0
    cti: { name: r5.cti0, base: 0x80018000 }
  - name: r5.cpu1
    cti: { name: r5.cti1, base: 0x80019000 }
    trigger-domain: 2
  - name: m4.cpu0
clusters:
  - name: r5
    members: [r5.cpu0, r5.cpu1]
    timeout-ms: 250
    channels: { halt: 2, restart: 3 }
    primary: first-eligible
"#;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cores.len(), 2);
        assert_eq!(config.clusters[0].members, vec!["r5.cpu0", "r5.cpu1"]);
        assert_eq!(config.fallback_policy, FallbackPolicy::FailFast);
        assert_eq!(config.repeat_halt, RepeatHaltPolicy::Emit);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse(R5_YAML);
        assert_eq!(config.poll.interval_ms, 5);
        assert_eq!(config.poll.sample_retries, 3);
        assert_eq!(config.fallback_policy, FallbackPolicy::Sequential);
        assert_eq!(config.repeat_halt, RepeatHaltPolicy::Suppress);
        assert!(config.core("m4.cpu0").unwrap().cti.is_none());
        assert_eq!(config.core("r5.cpu1").unwrap().binding().unwrap().domain, 2);

        let cluster = config.clusters[0].to_cluster();
        assert_eq!(cluster.convergence_timeout, Duration::from_millis(250));
        assert_eq!(cluster.channels.halt, Channel(2));
        assert_eq!(cluster.primary_policy, PrimaryPolicy::FirstEligible);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cluster_defaults() {
        let config = parse("cores: [{name: a}]\nclusters: [{name: c, members: [a]}]");
        let cluster = &config.clusters[0];
        assert_eq!(cluster.timeout_ms, 1000);
        assert_eq!(cluster.channels, ChannelRoles::default());
        assert_eq!(cluster.primary, PrimaryPolicy::Requested);
    }

    fn rejection(yaml: &str) -> String {
        parse(yaml).validate().unwrap_err().to_string()
    }

    #[test]
    fn test_validate_rejections_name_offender() {
        assert!(rejection("cores: [{name: a}, {name: a}]").contains("core a declared twice"));
        assert!(rejection("cores: [{name: a}]\nclusters: [{name: c, members: [a, ghost]}]").contains("ghost"));
        assert!(rejection("clusters: [{name: empty, members: []}]").contains("empty"));
        assert!(
            rejection("cores: [{name: a}]\nclusters: [{name: c1, members: [a]}, {name: c2, members: [a]}]")
                .contains("core a is listed in clusters c1 and c2")
        );
        assert!(
            rejection("cores: [{name: a}]\nclusters: [{name: c, members: [a], channels: {halt: 1, restart: 1}}]")
                .contains("cluster c")
        );
        assert!(
            rejection("cores: [{name: a}]\nclusters: [{name: c, members: [a], channels: {halt: 0, restart: 4}}]")
                .contains("out of range")
        );
        assert!(rejection("poll: {interval-ms: 0}").contains("interval-ms"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(R5_YAML.as_bytes()).unwrap();

        let config = Config::load(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(config.cores.len(), 3);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yml");
        let err = Config::load(Some(&missing)).unwrap_err();
        assert!(format!("{:#}", err).contains("nope.yml"));
    }

    #[test]
    fn test_load_malformed_file_fails() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"cores: {not: a list}").unwrap();
        assert!(Config::load_from_file(file.path()).is_err());
    }
}
