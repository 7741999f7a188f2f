use crate::common::*;
use crate::mdns_discovery::RTSP_TIMEOUT;
use crate::stream_registry::{CLEANUP_PERIOD, SAP_TIMEOUT};

use platform_dirs::AppDirs;
use serde::{Deserialize, Serialize};
use std::{
  fs, io,
  path::{Path, PathBuf},
  time::Duration,
};
use thiserror::Error;

pub const ENV_INTERFACES: &str = "RTP_MONITOR_INTERFACES";
pub const ENV_SDP_FILES: &str = "RTP_MONITOR_SDP_FILES";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("cannot read config {path:?}: {source}")]
  Io { path: PathBuf, source: io::Error },
  #[error("invalid config: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("invalid config: {0}")]
  Invalid(String),
}

/// Monitor settings, read from a TOML file. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
  /// interfaces to listen on, all multicast capable ones when empty
  pub interfaces: Vec<String>,
  pub sdp_files: Vec<PathBuf>,
  pub enable_sap: bool,
  pub enable_mdns: bool,
  pub enable_ptp: bool,
  pub sap_timeout_secs: u64,
  pub cleanup_period_secs: u64,
  pub rtsp_timeout_secs: u64,
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      interfaces: vec![],
      sdp_files: vec![],
      enable_sap: true,
      enable_mdns: true,
      enable_ptp: true,
      sap_timeout_secs: SAP_TIMEOUT.as_secs(),
      cleanup_period_secs: CLEANUP_PERIOD.as_secs(),
      rtsp_timeout_secs: RTSP_TIMEOUT.as_secs(),
    }
  }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
  value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl MonitorConfig {
  /// `<config dir>/rtp_monitor/config.toml` for the current user.
  pub fn default_path() -> Option<PathBuf> {
    AppDirs::new(Some("rtp_monitor"), false).map(|dirs| dirs.config_dir.join("config.toml"))
  }

  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    let config: Self = toml::from_str(content)?;
    config.validate()?;
    return Ok(config);
  }

  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_owned(), source })?;
    return Self::from_toml_str(&content);
  }

  /// Loads `path` if given (it must exist), else the default location if a file
  /// is there, else the defaults. Environment overrides are applied last.
  pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
    let mut config = match path {
      Some(p) => Self::load(p)?,
      None => match Self::default_path().filter(|p| p.is_file()) {
        Some(p) => {
          info!("using config file {}", p.display());
          Self::load(&p)?
        }
        None => Self::default(),
      },
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());
    return Ok(config);
  }

  /// Comma separated lists from the environment replace the configured ones.
  pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup(ENV_INTERFACES) {
      self.interfaces = split_list(&v).map(str::to_owned).collect();
    }
    if let Some(v) = lookup(ENV_SDP_FILES) {
      self.sdp_files = split_list(&v).map(PathBuf::from).collect();
    }
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if self.cleanup_period_secs == 0 {
      return Err(ConfigError::Invalid("cleanup_period_secs must be positive".to_owned()));
    }
    if self.rtsp_timeout_secs == 0 {
      return Err(ConfigError::Invalid("rtsp_timeout_secs must be positive".to_owned()));
    }
    return Ok(());
  }

  pub fn sap_timeout(&self) -> Duration {
    Duration::from_secs(self.sap_timeout_secs)
  }

  pub fn cleanup_period(&self) -> Duration {
    Duration::from_secs(self.cleanup_period_secs)
  }

  pub fn rtsp_timeout(&self) -> Duration {
    Duration::from_secs(self.rtsp_timeout_secs)
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[test]
  fn empty_file_gives_defaults() {
    let config = MonitorConfig::from_toml_str("").unwrap();
    assert_eq!(config, MonitorConfig::default());
    assert_eq!(config.sap_timeout(), Duration::from_secs(600));
    assert_eq!(config.cleanup_period(), Duration::from_secs(5));
    assert!(config.enable_sap && config.enable_mdns && config.enable_ptp);
  }

  #[test]
  fn partial_file() {
    let config = MonitorConfig::from_toml_str(
      r#"
interfaces = ["eth0", "eth1"]
sdp_files = ["/etc/streams/a.sdp"]
enable_mdns = false
sap_timeout_secs = 120
"#,
    )
    .unwrap();
    assert_eq!(config.interfaces, vec!["eth0", "eth1"]);
    assert_eq!(config.sdp_files, vec![PathBuf::from("/etc/streams/a.sdp")]);
    assert!(!config.enable_mdns);
    assert!(config.enable_sap);
    assert_eq!(config.sap_timeout(), Duration::from_secs(120));
  }

  #[test]
  fn rejects_bad_files() {
    assert!(matches!(MonitorConfig::from_toml_str("bogus_key = 1"), Err(ConfigError::Parse(_))));
    assert!(matches!(MonitorConfig::from_toml_str("enable_sap = \"yes\""), Err(ConfigError::Parse(_))));
    assert!(matches!(MonitorConfig::from_toml_str("cleanup_period_secs = 0"), Err(ConfigError::Invalid(_))));
    assert!(matches!(
      MonitorConfig::load(Path::new("/nonexistent/rtp_monitor.toml")),
      Err(ConfigError::Io { .. })
    ));
  }

  #[test]
  fn environment_overrides_lists() {
    let env: HashMap<&str, &str> = [(ENV_INTERFACES, "eth2, eth3,"), (ENV_SDP_FILES, "x.sdp,y.sdp")].into();
    let mut config = MonitorConfig { interfaces: vec!["eth0".to_owned()], ..Default::default() };
    config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
    assert_eq!(config.interfaces, vec!["eth2", "eth3"]);
    assert_eq!(config.sdp_files, vec![PathBuf::from("x.sdp"), PathBuf::from("y.sdp")]);

    let mut untouched = MonitorConfig::default();
    untouched.apply_env_overrides(|_| None);
    assert_eq!(untouched, MonitorConfig::default());
  }

  #[test]
  fn round_trips_through_toml() {
    let config = MonitorConfig { interfaces: vec!["en0".to_owned()], enable_ptp: false, ..Default::default() };
    let text = toml::to_string(&config).unwrap();
    assert_eq!(MonitorConfig::from_toml_str(&text).unwrap(), config);
  }
}
