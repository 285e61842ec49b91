use crate::handler::backoff::BackoffConfig;
use crate::resource::parse_duration;

use std::fmt::{self, Display};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_WORKER_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Used in logs and as the prefix of generated names
    pub name: String,
    /// Restricts the namespaced kinds to a single namespace. Cluster scoped kinds are always
    /// watched.
    pub namespace: Option<String>,
    /// Workers per reconciler
    pub worker_count: usize,
    /// Every object is requeued at this interval even without watch events
    pub resync_period: Duration,
    /// Hard deadline for a single OSB call
    pub osb_timeout: Duration,
    pub osb_api_version: String,
    /// Cadence of last_operation polls
    pub poll_backoff: BackoffConfig,
    /// Rate limiting of failed reconciles
    pub retry_backoff: BackoffConfig,
    /// Operations retried for longer than this are abandoned
    pub reconciliation_retry_duration: Duration,
    /// Relist interval for brokers that use the `Duration` behavior without setting one
    pub default_relist_interval: Duration,
    /// Sent to brokers as the `organization_guid` and in the request context
    pub cluster_id: String,
    pub server_port: u16,
    pub expose_metrics: bool,
    pub expose_health: bool,
}

impl ControllerConfig {
    pub fn new(name: impl Into<String>) -> ControllerConfig {
        ControllerConfig {
            name: name.into(),
            namespace: None,
            worker_count: DEFAULT_WORKER_COUNT,
            resync_period: Duration::from_secs(5 * 60),
            osb_timeout: Duration::from_secs(60),
            osb_api_version: crate::osb::DEFAULT_API_VERSION.to_owned(),
            poll_backoff: BackoffConfig::poll_default(),
            retry_backoff: BackoffConfig::default(),
            reconciliation_retry_duration: Duration::from_secs(7 * 24 * 60 * 60),
            default_relist_interval: Duration::from_secs(15 * 60),
            cluster_id: uuid::Uuid::new_v4().to_string(),
            server_port: DEFAULT_SERVER_PORT,
            expose_metrics: true,
            expose_health: true,
        }
    }

    pub fn within_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn osb_timeout(mut self, timeout: Duration) -> Self {
        self.osb_timeout = timeout;
        self
    }

    pub fn poll_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.poll_backoff = backoff;
        self
    }

    pub fn retry_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn reconciliation_retry_duration(mut self, duration: Duration) -> Self {
        self.reconciliation_retry_duration = duration;
        self
    }

    pub fn cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = cluster_id.into();
        self
    }

    /// Sets the port of the metrics and health server
    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn expose_metrics(mut self, expose_metrics: bool) -> Self {
        self.expose_metrics = expose_metrics;
        self
    }

    pub fn expose_health(mut self, expose_health: bool) -> Self {
        self.expose_health = expose_health;
        self
    }

    /// Parses a yaml document. Every field is optional, and anything missing keeps its default.
    /// Durations use the `1h30m15s` form.
    pub fn from_yaml_str(yaml: &str) -> Result<ControllerConfig, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(yaml).map_err(ConfigError::Yaml)?;
        file.into_config()
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<ControllerConfig> {
        use anyhow::Context;

        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = ControllerConfig::from_yaml_str(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Yaml(serde_yaml::Error),
    InvalidDuration { field: &'static str, value: String },
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Yaml(e) => write!(f, "failed to parse config: {}", e),
            ConfigError::InvalidDuration { field, value } => {
                write!(f, "invalid duration for {}: {:?}", field, value)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Yaml(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    name: Option<String>,
    namespace: Option<String>,
    worker_count: Option<usize>,
    resync_period: Option<String>,
    osb_timeout: Option<String>,
    osb_api_version: Option<String>,
    poll_max_interval: Option<String>,
    retry_max_interval: Option<String>,
    reconciliation_retry_duration: Option<String>,
    default_relist_interval: Option<String>,
    cluster_id: Option<String>,
    server_port: Option<u16>,
    expose_metrics: Option<bool>,
    expose_health: Option<bool>,
}

fn duration_field(field: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    match value {
        None => Ok(None),
        Some(value) => parse_duration(&value)
            .map(Some)
            .ok_or(ConfigError::InvalidDuration { field, value }),
    }
}

impl ConfigFile {
    fn into_config(self) -> Result<ControllerConfig, ConfigError> {
        let mut config = ControllerConfig::new(self.name.unwrap_or_else(|| "osb-controller".to_owned()));
        config.namespace = self.namespace;
        if let Some(count) = self.worker_count {
            if count == 0 {
                return Err(ConfigError::Invalid("workerCount must be at least 1".to_owned()));
            }
            config.worker_count = count;
        }
        if let Some(d) = duration_field("resyncPeriod", self.resync_period)? {
            config.resync_period = d;
        }
        if let Some(d) = duration_field("osbTimeout", self.osb_timeout)? {
            config.osb_timeout = d;
        }
        if let Some(version) = self.osb_api_version {
            config.osb_api_version = version;
        }
        if let Some(d) = duration_field("pollMaxInterval", self.poll_max_interval)? {
            config.poll_backoff.max_interval = d;
        }
        if let Some(d) = duration_field("retryMaxInterval", self.retry_max_interval)? {
            config.retry_backoff.max_interval = d;
        }
        if let Some(d) = duration_field(
            "reconciliationRetryDuration",
            self.reconciliation_retry_duration,
        )? {
            config.reconciliation_retry_duration = d;
        }
        if let Some(d) = duration_field("defaultRelistInterval", self.default_relist_interval)? {
            config.default_relist_interval = d;
        }
        if let Some(id) = self.cluster_id {
            config.cluster_id = id;
        }
        if let Some(port) = self.server_port {
            config.server_port = port;
        }
        if let Some(expose) = self.expose_metrics {
            config.expose_metrics = expose;
        }
        if let Some(expose) = self.expose_health {
            config.expose_health = expose;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let config = ControllerConfig::new("test");
        assert_eq!(5, config.worker_count);
        assert_eq!(Duration::from_secs(60), config.osb_timeout);
        assert_eq!("2.13", config.osb_api_version);
        assert_eq!(Duration::from_secs(120), config.poll_backoff.max_interval);
        assert_eq!(Duration::from_secs(1200), config.retry_backoff.max_interval);
        assert_eq!(8080, config.server_port);
        assert!(!config.cluster_id.is_empty());
    }

    #[test]
    fn yaml_overrides_only_what_it_sets() {
        let config = ControllerConfig::from_yaml_str(
            r#"
            name: catalog
            namespace: test-ns
            workerCount: 2
            osbTimeout: 30s
            reconciliationRetryDuration: 1h
            clusterId: my-cluster
            exposeMetrics: false
            "#,
        )
        .unwrap();
        assert_eq!("catalog", config.name);
        assert_eq!(Some("test-ns"), config.namespace.as_deref());
        assert_eq!(2, config.worker_count);
        assert_eq!(Duration::from_secs(30), config.osb_timeout);
        assert_eq!(Duration::from_secs(3600), config.reconciliation_retry_duration);
        assert_eq!("my-cluster", config.cluster_id);
        assert!(!config.expose_metrics);
        assert!(config.expose_health);
        assert_eq!(Duration::from_secs(300), config.resync_period);
    }

    #[test]
    fn bad_durations_name_the_field() {
        let err = ControllerConfig::from_yaml_str("resyncPeriod: soon").unwrap_err();
        match err {
            ConfigError::InvalidDuration { field, value } => {
                assert_eq!("resyncPeriod", field);
                assert_eq!("soon", value);
            }
            other => panic!("expected InvalidDuration, got: {:?}", other),
        }
        assert!(ControllerConfig::from_yaml_str("workerCount: 0").is_err());
        assert!(ControllerConfig::from_yaml_str("bogus: true").is_err());
    }
}
