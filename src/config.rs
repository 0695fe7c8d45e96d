use anyhow::{Context, Result};
use jbdbms_lib::session::SessionConfig;
use serde::Deserialize;
use std::time::Duration;

use crate::commandline::CliArgs;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Advertised name of the BMS to connect to; any BMS when unset.
    pub device_name: Option<String>,
    #[serde(default = "Config::default_scan_timeout", with = "humantime_serde")]
    pub scan_timeout: Duration,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    fn default_scan_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    /// Commandline flags take precedence over file values.
    pub fn apply_args(&mut self, args: &CliArgs) {
        if let Some(name) = &args.name {
            self.device_name = Some(name.clone());
        }
        if let Some(scan_timeout) = args.scan_timeout {
            self.scan_timeout = scan_timeout;
        }
        if let Some(settle_delay) = args.settle_delay {
            self.session.settle_delay = settle_delay;
        }
        if let Some(poll_interval) = args.poll_interval {
            self.session.poll_interval = poll_interval;
        }
        if let Some(stall_timeout) = args.stall_timeout {
            self.session.stall_timeout = Some(stall_timeout);
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: None,
            scan_timeout: Self::default_scan_timeout(),
            session: SessionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_full_config() {
        let file = write_config(
            "device_name: xiaoxiang BMS\n\
             scan_timeout: 1m\n\
             session:\n  \
               settle_delay: 500ms\n  \
               poll_interval: 5s\n  \
               stall_timeout: 20s\n  \
               check_response_kind: false\n",
        );
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.device_name.as_deref(), Some("xiaoxiang BMS"));
        assert_eq!(config.scan_timeout, Duration::from_secs(60));
        assert_eq!(config.session.settle_delay, Duration::from_millis(500));
        assert_eq!(config.session.poll_interval, Duration::from_secs(5));
        assert_eq!(config.session.stall_timeout, Some(Duration::from_secs(20)));
        assert!(!config.session.check_response_kind);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let file = write_config("session:\n  poll_interval: 3s\n");
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.device_name, None);
        assert_eq!(config.scan_timeout, Duration::from_secs(30));
        assert_eq!(config.session.settle_delay, Duration::from_secs(1));
        assert_eq!(config.session.poll_interval, Duration::from_secs(3));
        assert_eq!(config.session.stall_timeout, Some(Duration::from_secs(10)));
        assert!(config.session.check_response_kind);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load("/nonexistent/jbdbms.yaml").is_err());
    }

    #[test]
    fn args_override_file() {
        let mut config = Config::default();
        let args = CliArgs::parse_from([
            "jbdbms",
            "--name",
            "SP04S034",
            "--poll-interval",
            "10s",
            "--stall-timeout",
            "30s",
            "monitor",
        ]);
        config.apply_args(&args);
        assert_eq!(config.device_name.as_deref(), Some("SP04S034"));
        assert_eq!(config.session.poll_interval, Duration::from_secs(10));
        assert_eq!(config.session.stall_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.session.settle_delay, Duration::from_secs(1));
    }
}
