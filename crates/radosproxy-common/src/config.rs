//! Configuration types for RadosProxy
//!
//! Configuration is read once at startup from a TOML file. Every field has a
//! default, so a missing or partial file still yields a usable config.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Root configuration for RadosProxy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub messenger: MessengerSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::configuration(e.to_string()))
    }

    /// Load configuration, falling back to defaults when the file is missing
    /// or malformed. Configuration problems are never fatal.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            warn!("Failed to load config file {}: {}, using defaults", path.display(), e);
            Self::default()
        })
    }
}

/// Cluster client connection settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Path of the cluster client configuration file
    #[serde(default = "default_ceph_conf")]
    pub ceph_conf: PathBuf,
    /// OSD op timeout in seconds, 0 leaves the client default
    #[serde(default)]
    pub osd_op_timeout: u64,
    /// Monitor op timeout in seconds, 0 leaves the client default
    #[serde(default)]
    pub mon_op_timeout: u64,
    /// Connect attempts before giving up
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Base delay of the exponential connect backoff, in seconds
    #[serde(default = "default_connect_backoff")]
    pub connect_backoff_secs: u64,
    /// Extra options passed to the cluster client verbatim
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            ceph_conf: default_ceph_conf(),
            osd_op_timeout: 0,
            mon_op_timeout: 0,
            connect_retries: default_connect_retries(),
            connect_backoff_secs: default_connect_backoff(),
            options: BTreeMap::new(),
        }
    }
}

impl ClusterSection {
    /// Options to apply to the cluster client before connecting
    #[must_use]
    pub fn client_options(&self) -> Vec<(String, String)> {
        let mut opts = Vec::new();
        if self.osd_op_timeout > 0 {
            opts.push((
                "rados_osd_op_timeout".to_string(),
                self.osd_op_timeout.to_string(),
            ));
        }
        if self.mon_op_timeout > 0 {
            opts.push((
                "rados_mon_op_timeout".to_string(),
                self.mon_op_timeout.to_string(),
            ));
        }
        opts.extend(self.options.iter().map(|(k, v)| (k.clone(), v.clone())));
        opts
    }

    /// Base delay of the connect backoff
    #[must_use]
    pub const fn connect_backoff(&self) -> Duration {
        Duration::from_secs(self.connect_backoff_secs)
    }
}

/// Worker pool settings for the proxy op queues
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Number of proxy worker threads
    #[serde(default = "default_worker_num")]
    pub worker_num: usize,
    /// Soft capacity of each worker queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Pin worker threads to cores from `core_list`
    #[serde(default)]
    pub bind_core: bool,
    /// Cores available for pinning, as an array or a comma-separated string
    #[serde(default = "default_core_list", deserialize_with = "deserialize_core_list")]
    pub core_list: Vec<usize>,
    /// Number of messenger threads; the first cores of `core_list` are theirs
    #[serde(default = "default_msgr_amount")]
    pub msgr_amount: usize,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            worker_num: default_worker_num(),
            queue_capacity: default_queue_capacity(),
            bind_core: false,
            core_list: default_core_list(),
            msgr_amount: default_msgr_amount(),
        }
    }
}

/// Server adaptor settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessengerSection {
    /// Address the messenger listens on
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
    /// One listener per port
    #[serde(default = "default_listen_ports")]
    pub listen_ports: Vec<String>,
    /// Number of adaptor worker queues
    #[serde(default = "default_queue_amount")]
    pub queue_amount: usize,
    /// Soft capacity of each adaptor queue
    #[serde(default = "default_queue_capacity")]
    pub queue_max_capacity: usize,
    /// Pin adaptor worker threads
    #[serde(default)]
    pub bind_queue_core: bool,
    /// Periodic latency reporting
    #[serde(default)]
    pub perf: bool,
    #[serde(default = "default_perf_interval")]
    pub perf_interval_secs: u64,
}

impl Default for MessengerSection {
    fn default() -> Self {
        Self {
            listen_ip: default_listen_ip(),
            listen_ports: default_listen_ports(),
            queue_amount: default_queue_amount(),
            queue_max_capacity: default_queue_capacity(),
            bind_queue_core: false,
            perf: false,
            perf_interval_secs: default_perf_interval(),
        }
    }
}

/// Pool usage monitor settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between scrape cycles
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval(),
        }
    }
}

impl MonitorSection {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Logging settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file; stderr when unset
    #[serde(default = "default_log_file")]
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_file: default_log_file(),
        }
    }
}

fn default_ceph_conf() -> PathBuf {
    PathBuf::from("/etc/ceph/ceph.conf")
}

const fn default_connect_retries() -> u32 {
    5
}

const fn default_connect_backoff() -> u64 {
    5
}

const fn default_worker_num() -> usize {
    1
}

const fn default_queue_capacity() -> usize {
    1024
}

fn default_core_list() -> Vec<usize> {
    vec![26, 27, 28, 29]
}

const fn default_msgr_amount() -> usize {
    3
}

fn default_listen_ip() -> String {
    "localhost".to_string()
}

fn default_listen_ports() -> Vec<String> {
    vec!["1234".to_string()]
}

const fn default_queue_amount() -> usize {
    1
}

const fn default_perf_interval() -> u64 {
    3
}

const fn default_true() -> bool {
    true
}

const fn default_monitor_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

#[allow(clippy::unnecessary_wraps)]
fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("/var/log/gcache/proxy.log"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CoreListRepr {
    List(Vec<usize>),
    Text(String),
}

fn deserialize_core_list<'de, D>(deserializer: D) -> std::result::Result<Vec<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    match CoreListRepr::deserialize(deserializer)? {
        CoreListRepr::List(cores) => Ok(cores),
        CoreListRepr::Text(text) => parse_core_list(&text).map_err(serde::de::Error::custom),
    }
}

/// Parse a comma-separated core list such as `"26,27,28,29"`.
pub fn parse_core_list(text: &str) -> Result<Vec<usize>> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|e| Error::configuration(format!("bad core id {s:?}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.cluster.ceph_conf, PathBuf::from("/etc/ceph/ceph.conf"));
        assert_eq!(config.worker.worker_num, 1);
        assert_eq!(config.worker.core_list, vec![26, 27, 28, 29]);
        assert_eq!(config.worker.msgr_amount, 3);
        assert!(!config.worker.bind_core);
        assert_eq!(config.monitor.interval_secs, 10);
        assert_eq!(config.cluster.connect_retries, 5);
        assert!(config.cluster.client_options().is_empty());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = ProxyConfig::from_toml(
            r#"
            [worker]
            worker_num = 4
            core_list = "1, 2,3"

            [cluster]
            osd_op_timeout = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.worker.worker_num, 4);
        assert_eq!(config.worker.core_list, vec![1, 2, 3]);
        assert_eq!(config.worker.queue_capacity, 1024);
        assert_eq!(
            config.cluster.client_options(),
            vec![("rados_osd_op_timeout".to_string(), "30".to_string())]
        );
    }

    #[test]
    fn test_core_list_as_array() {
        let config = ProxyConfig::from_toml("[worker]\ncore_list = [4, 5]\n").unwrap();
        assert_eq!(config.worker.core_list, vec![4, 5]);
    }

    #[test]
    fn test_load_or_default_on_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is = = not toml").unwrap();
        let config = ProxyConfig::load_or_default(file.path());
        assert_eq!(config.worker.worker_num, 1);
        assert!(ProxyConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = ProxyConfig::load_or_default("/nonexistent/radosproxy.toml");
        assert_eq!(config.messenger.listen_ports, vec!["1234".to_string()]);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[monitor]\ninterval_secs = 3\n[messenger]\nqueue_amount = 8").unwrap();
        let config = ProxyConfig::load(file.path()).unwrap();
        assert_eq!(config.monitor.interval(), Duration::from_secs(3));
        assert_eq!(config.messenger.queue_amount, 8);
    }

    #[test]
    fn test_parse_core_list_rejects_garbage() {
        assert!(parse_core_list("1,x").is_err());
        assert_eq!(parse_core_list("").unwrap(), Vec::<usize>::new());
    }
}
