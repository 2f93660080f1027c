use std::collections::BTreeMap;
use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use relay_auth::{generate_key_pair, generate_relay_id, PublicKey, RelayId, SecretKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::byte_size::ByteSize;
use crate::upstream::UpstreamDescriptor;

const DEFAULT_NETWORK_OUTAGE_GRACE_PERIOD: u64 = 10;

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    kind: ConfigErrorKind,
    path: Option<PathBuf>,
    inner: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            kind,
            path: None,
            inner: None,
        }
    }

    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            kind,
            path: None,
            inner: Some(Box::new(inner)),
        }
    }

    fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{} (file {})", self.kind, path.display()),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner
            .as_deref()
            .map(|e| e as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to save a file.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::Yaml => "yml",
            ConfigFormat::Json => "json",
        }
    }
}

trait ConfigObject: DeserializeOwned + Serialize {
    /// The format in which to serialize this configuration.
    fn format() -> ConfigFormat;

    /// The basename of the config file.
    fn name() -> &'static str;

    /// The full filename of the config file, including the file extension.
    fn path(base: &Path) -> PathBuf {
        base.join(format!("{}.{}", Self::name(), Self::format().extension()))
    }

    /// Loads the config file from a file within the given directory location.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;
        let f = std::io::BufReader::new(f);

        match Self::format() {
            ConfigFormat::Yaml => serde_yaml::from_reader(f)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path)),
            ConfigFormat::Json => serde_json::from_reader(f)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadJson).file(&path)),
        }
    }

    /// Writes the configuration to a file within the given directory location.
    fn save(&self, base: &Path) -> Result<(), ConfigError> {
        let path = Self::path(base);
        let mut options = fs::OpenOptions::new();
        options.write(true).truncate(true).create(true);

        // Remove all non-user permissions for the newly created file
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut f = options
            .open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile).file(&path))?;

        match Self::format() {
            ConfigFormat::Yaml => serde_yaml::to_writer(&mut f, self)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile).file(&path))?,
            ConfigFormat::Json => serde_json::to_writer_pretty(&mut f, self)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile).file(&path))?,
        }

        f.write_all(b"\n").ok();

        Ok(())
    }
}

/// The relay credentials.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Credentials {
    /// The secret key of the relay.
    pub secret_key: SecretKey,
    /// The public key of the relay.
    pub public_key: PublicKey,
    /// The unique identifier of the relay.
    pub id: RelayId,
}

impl Credentials {
    /// Generates new random credentials.
    pub fn generate() -> Self {
        relay_log::info!("generating new relay credentials");
        let (sk, pk) = generate_key_pair();
        Self {
            secret_key: sk,
            public_key: pk,
            id: generate_relay_id(),
        }
    }
}

impl ConfigObject for Credentials {
    fn format() -> ConfigFormat {
        ConfigFormat::Json
    }

    fn name() -> &'static str {
        "credentials"
    }
}

/// The operation mode of a relay.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RelayMode {
    /// This relay requires project configurations from the upstream to operate. Events for
    /// unknown or disabled projects are rejected.
    Managed,
    /// This relay forwards all events to the upstream without inspecting project states.
    Proxy,
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayMode::Managed => write!(f, "managed"),
            RelayMode::Proxy => write!(f, "proxy"),
        }
    }
}

/// Error returned when parsing an invalid [`RelayMode`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("Relay mode must be one of: managed, proxy")]
pub struct ParseRelayModeError;

impl FromStr for RelayMode {
    type Err = ParseRelayModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "managed" => Ok(RelayMode::Managed),
            "proxy" => Ok(RelayMode::Proxy),
            _ => Err(ParseRelayModeError),
        }
    }
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup").is_ok_and(|s| s.contains("/docker"))
}

/// Default value for the "bind" configuration.
fn default_host() -> IpAddr {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0".parse().unwrap()
    } else {
        "127.0.0.1".parse().unwrap()
    }
}

/// Relay specific configuration values.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Relay {
    /// The operation mode of this relay.
    pub mode: RelayMode,
    /// The upstream relay or sentry instance.
    pub upstream: UpstreamDescriptor<'static>,
    /// The host the relay should bind to (network interface).
    pub host: IpAddr,
    /// The port to bind for the unencrypted relay HTTP server.
    pub port: u16,
}

impl Default for Relay {
    fn default() -> Self {
        Relay {
            mode: RelayMode::Managed,
            upstream: UpstreamDescriptor::default(),
            host: default_host(),
            port: 3000,
        }
    }
}

/// Controls authentication with the upstream.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Http {
    /// Timeout for upstream requests in seconds.
    pub timeout: u32,
    /// Timeout for establishing connections with the upstream in seconds.
    pub connection_timeout: u32,
    /// Maximum interval between failed request retries in seconds.
    pub max_retry_interval: u32,
    /// Maximum number of send attempts per event batch before giving up.
    pub max_send_attempts: u32,
    /// The grace period for network outages in seconds.
    ///
    /// If connectivity to the upstream resumes within this period, pending requests are retried
    /// without being reported as an outage.
    pub outage_grace_period: u64,
}

impl Default for Http {
    fn default() -> Self {
        Http {
            timeout: 5,
            connection_timeout: 3,
            max_retry_interval: 60,
            max_send_attempts: 5,
            outage_grace_period: DEFAULT_NETWORK_OUTAGE_GRACE_PERIOD,
        }
    }
}

/// Controls internal caching behavior.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Cache {
    /// The cache timeout for project configurations in seconds.
    pub project_expiry: u32,
    /// Continue using project state this many seconds after cache expiry while a new state is
    /// being fetched. Set to 0 to disable stale caches.
    pub project_grace_period: u32,
    /// The cache timeout for non-existing project configurations in seconds.
    pub miss_expiry: u32,
    /// Interval for evicting expired project configs from memory, in seconds.
    pub eviction_interval: u32,
    /// Maximum time to collect events into a forwarding batch, in milliseconds. A value of 0
    /// sends every event immediately.
    pub batch_interval: u32,
    /// Maximum number of events in a forwarding batch.
    pub batch_size: usize,
    /// Interval for collecting project config fetches into a single upstream query, in
    /// milliseconds.
    pub query_batch_interval: u32,
    /// Maximum number of project keys in a single project config query.
    pub query_batch_size: usize,
}

impl Default for Cache {
    fn default() -> Self {
        Cache {
            project_expiry: 300,   // 5 minutes
            project_grace_period: 0,
            miss_expiry: 60,       // 1 minute
            eviction_interval: 60, // 1 minute
            batch_interval: 100,   // 100ms
            batch_size: 50,
            query_batch_interval: 100, // 100ms
            query_batch_size: 500,
        }
    }
}

/// Controls various limits.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Limits {
    /// The maximum payload size for events.
    pub max_event_size: ByteSize,
    /// The maximum number of concurrent requests to the upstream.
    pub max_concurrent_requests: usize,
    /// The maximum number of seconds a query is allowed to take across retries.
    pub query_timeout: u64,
    /// The maximum number of seconds to wait for pending events after receiving a shutdown
    /// signal.
    pub shutdown_timeout: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_event_size: ByteSize::mebibytes(1),
            max_concurrent_requests: 100,
            query_timeout: 30,
            shutdown_timeout: 10,
        }
    }
}

/// Controls the metrics.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// Hostname and port of the statsd server. Metrics are disabled if not set.
    pub statsd: Option<String>,
    /// Common prefix that should be added to all metrics.
    pub prefix: String,
    /// Default tags to apply to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Tag name to report the hostname to for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// Global sample rate for all emitted metrics between 0.0 and 1.0.
    pub sample_rate: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: None,
            prefix: "relay".into(),
            default_tags: BTreeMap::new(),
            hostname_tag: None,
            sample_rate: 1.0,
        }
    }
}

/// Config values which are passed to the relay on startup.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigValues {
    /// General relay settings.
    pub relay: Relay,
    /// HTTP client settings for upstream communication.
    pub http: Http,
    /// Internal caches.
    pub cache: Cache,
    /// Request and event limits.
    pub limits: Limits,
    /// Logging configuration.
    pub logging: relay_log::LogConfig,
    /// Statsd metrics.
    pub metrics: Metrics,
}

impl ConfigObject for ConfigValues {
    fn format() -> ConfigFormat {
        ConfigFormat::Yaml
    }

    fn name() -> &'static str {
        "config"
    }
}

/// Minimal version of a config for dumping out.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MinimalConfig {
    /// The relay part of the config.
    pub relay: Relay,
}

impl MinimalConfig {
    /// Saves the config in the given config folder as `config.yml`.
    pub fn save_in_folder<P: AsRef<Path>>(&self, p: P) -> Result<(), ConfigError> {
        let path = p.as_ref();
        if fs::metadata(path).is_err() {
            fs::create_dir_all(path)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile).file(path))?;
        }
        self.save(path)
    }
}

impl ConfigObject for MinimalConfig {
    fn format() -> ConfigFormat {
        ConfigFormat::Yaml
    }

    fn name() -> &'static str {
        "config"
    }
}

/// Config struct.
pub struct Config {
    values: ConfigValues,
    credentials: Option<Credentials>,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// The folder must contain a `config.yml`. Credentials are loaded from `credentials.json` if
    /// the file exists. A malformed credentials file is an error, credentials are never silently
    /// regenerated.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let config = Config {
            values: ConfigValues::load(&path)?,
            credentials: if Credentials::path(&path).exists() {
                Some(Credentials::load(&path)?)
            } else {
                None
            },
            path: path.clone(),
        };

        Ok(config)
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        Ok(Config {
            values: serde_json::from_value(value)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadJson))?,
            credentials: None,
            path: PathBuf::new(),
        })
    }

    /// Returns the filesystem path of the config directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generates new credentials and saves them, if none exist yet.
    ///
    /// Returns `true` if new credentials were generated, `false` if credentials already existed.
    pub fn ensure_credentials(&mut self) -> Result<bool, ConfigError> {
        if self.credentials.is_some() {
            return Ok(false);
        }

        let credentials = Credentials::generate();
        credentials.save(&self.path)?;
        self.credentials = Some(credentials);
        Ok(true)
    }

    /// Regenerates the relay credentials and saves them.
    pub fn regenerate_credentials(&mut self) -> Result<(), ConfigError> {
        let credentials = Credentials::generate();
        credentials.save(&self.path)?;
        self.credentials = Some(credentials);
        Ok(())
    }

    /// Returns the relay credentials, if set.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Returns `true` if the config is authenticated with credentials.
    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Returns the secret key if set.
    pub fn secret_key(&self) -> Option<&SecretKey> {
        self.credentials.as_ref().map(|x| &x.secret_key)
    }

    /// Returns the public key if set.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.credentials.as_ref().map(|x| &x.public_key)
    }

    /// Returns the relay ID.
    pub fn relay_id(&self) -> Option<&RelayId> {
        self.credentials.as_ref().map(|x| &x.id)
    }

    /// Returns the relay mode.
    pub fn relay_mode(&self) -> RelayMode {
        self.values.relay.mode
    }

    /// Returns the upstream target as descriptor.
    pub fn upstream_descriptor(&self) -> &UpstreamDescriptor<'_> {
        &self.values.relay.upstream
    }

    /// Returns the listen address.
    pub fn listen_addr(&self) -> SocketAddr {
        (self.values.relay.host, self.values.relay.port).into()
    }

    /// Returns the log configuration.
    pub fn logging(&self) -> &relay_log::LogConfig {
        &self.values.logging
    }

    /// Returns the host and port of the statsd server, if metrics are enabled.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Returns the prefix for statsd metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags for statsd metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the name of the hostname tag that should be attached to each outgoing metric.
    pub fn metrics_hostname_tag(&self) -> Option<&str> {
        self.values.metrics.hostname_tag.as_deref()
    }

    /// Returns the global sample rate for all metrics.
    pub fn metrics_sample_rate(&self) -> f64 {
        self.values.metrics.sample_rate
    }

    /// Returns the timeout for individual upstream requests.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.values.http.timeout.into())
    }

    /// Returns the connection timeout for upstream requests.
    pub fn http_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.values.http.connection_timeout.into())
    }

    /// Returns the maximum interval between retries of failed upstream requests.
    pub fn http_max_retry_interval(&self) -> Duration {
        Duration::from_secs(self.values.http.max_retry_interval.into())
    }

    /// Returns the maximum number of send attempts per event batch.
    pub fn http_max_send_attempts(&self) -> u32 {
        self.values.http.max_send_attempts
    }

    /// The maximum time of network outages without failing pending upstream requests.
    pub fn http_outage_grace_period(&self) -> Duration {
        Duration::from_secs(self.values.http.outage_grace_period)
    }

    /// Returns the expiry timeout for cached project configurations.
    pub fn project_cache_expiry(&self) -> Duration {
        Duration::from_secs(self.values.cache.project_expiry.into())
    }

    /// Returns the duration a stale project state may still be served while a refresh is
    /// in flight.
    pub fn project_grace_period(&self) -> Duration {
        Duration::from_secs(self.values.cache.project_grace_period.into())
    }

    /// Returns the expiry timeout for cached misses (non-existing projects).
    pub fn cache_miss_expiry(&self) -> Duration {
        Duration::from_secs(self.values.cache.miss_expiry.into())
    }

    /// Returns the interval for evicting expired projects from the cache.
    pub fn cache_eviction_interval(&self) -> Duration {
        Duration::from_secs(self.values.cache.eviction_interval.into())
    }

    /// Returns the maximum time to collect events into a forwarding batch.
    ///
    /// A zero duration sends every event immediately.
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.values.cache.batch_interval.into())
    }

    /// Returns the maximum number of events per forwarding batch.
    pub fn batch_size(&self) -> usize {
        self.values.cache.batch_size
    }

    /// Returns the interval for collecting project config fetches into a single query.
    pub fn query_batch_interval(&self) -> Duration {
        Duration::from_millis(self.values.cache.query_batch_interval.into())
    }

    /// Returns the maximum number of project keys per project config query.
    pub fn query_batch_size(&self) -> usize {
        self.values.cache.query_batch_size
    }

    /// Returns the maximum size of an event payload in bytes.
    pub fn max_event_size(&self) -> usize {
        self.values.limits.max_event_size.as_bytes() as usize
    }

    /// Returns the maximum number of concurrent requests to the upstream.
    pub fn max_concurrent_requests(&self) -> usize {
        self.values.limits.max_concurrent_requests
    }

    /// Returns the maximum total time a query may take across retries.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.query_timeout)
    }

    /// Returns the timeout for graceful shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.shutdown_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            values: ConfigValues::default(),
            credentials: None,
            path: PathBuf::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.relay_mode(), RelayMode::Managed);
        assert_eq!(config.max_event_size(), 1_048_576);
        assert_eq!(config.http_max_send_attempts(), 5);
        assert_eq!(config.batch_interval(), Duration::from_millis(100));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_from_json_value() {
        let config = Config::from_json_value(serde_json::json!({
            "relay": {
                "mode": "proxy",
                "upstream": "http://localhost:8000/",
                "port": 3001
            },
            "cache": {
                "batch_interval": 0
            }
        }))
        .unwrap();

        assert_eq!(config.relay_mode(), RelayMode::Proxy);
        assert_eq!(config.upstream_descriptor().port(), 8000);
        assert_eq!(config.listen_addr().port(), 3001);
        assert_eq!(config.batch_interval(), Duration::ZERO);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let config = Config::from_json_value(serde_json::json!({
            "relay": {
                "port": 3001,
                "future_option": true
            },
            "unknown_section": { "enabled": true }
        }))
        .unwrap();

        assert_eq!(config.listen_addr().port(), 3001);
    }

    #[test]
    fn test_credentials_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        MinimalConfig::default().save_in_folder(dir.path()).unwrap();

        let mut config = Config::from_path(dir.path()).unwrap();
        assert!(!config.has_credentials());

        assert!(config.ensure_credentials().unwrap());
        let id = *config.relay_id().unwrap();

        // A second call must not replace existing credentials.
        assert!(!config.ensure_credentials().unwrap());
        assert_eq!(config.relay_id(), Some(&id));

        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.relay_id(), Some(&id));
    }

    #[test]
    fn test_regenerate_credentials_replaces() {
        let dir = tempfile::tempdir().unwrap();
        MinimalConfig::default().save_in_folder(dir.path()).unwrap();

        let mut config = Config::from_path(dir.path()).unwrap();
        config.ensure_credentials().unwrap();
        let id = *config.relay_id().unwrap();

        config.regenerate_credentials().unwrap();
        let new_id = *config.relay_id().unwrap();
        assert_ne!(id, new_id);

        // The new credentials are persisted.
        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.relay_id(), Some(&new_id));
    }

    #[test]
    fn test_corrupt_credentials_fail() {
        let dir = tempfile::tempdir().unwrap();
        MinimalConfig::default().save_in_folder(dir.path()).unwrap();

        fs::write(dir.path().join("credentials.json"), "not json").unwrap();

        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadJson);
    }

    #[test]
    fn test_missing_config_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::CouldNotOpenFile);
    }
}
