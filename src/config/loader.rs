use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::{Config, PermittedConfig};
use crate::modules::ModuleId;

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml).context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.bridges.is_empty() && self.datagram.is_empty() {
            anyhow::bail!("at least one bridge or datagram service must be defined");
        }

        let mut bridge_names = HashSet::new();
        for bridge in &self.bridges {
            if !bridge_names.insert(&bridge.name) {
                anyhow::bail!("duplicate bridge name: {}", bridge.name);
            }
            if !bridge.prefix.starts_with('/') {
                anyhow::bail!("bridge '{}' prefix must start with '/': {}", bridge.name, bridge.prefix);
            }
            validate_permitted(&bridge.name, "inbound_permitted", &bridge.inbound_permitted)?;
            validate_permitted(&bridge.name, "outbound_permitted", &bridge.outbound_permitted)?;
        }

        let mut datagram_names = HashSet::new();
        for service in &self.datagram {
            if !datagram_names.insert(&service.name) {
                anyhow::bail!("duplicate datagram service name: {}", service.name);
            }
            match (service.echo, &service.bridge_address) {
                (true, Some(_)) => anyhow::bail!(
                    "datagram service '{}' cannot both echo and publish to the bus",
                    service.name
                ),
                (false, None) => anyhow::bail!(
                    "datagram service '{}' needs either echo: true or a bridge_address",
                    service.name
                ),
                _ => {}
            }
        }

        let mut modules = HashSet::new();
        for module in &self.modules {
            ModuleId::parse(module).with_context(|| format!("invalid module identifier: {module}"))?;
            if !modules.insert(module) {
                anyhow::bail!("module listed twice: {module}");
            }
        }

        if self.settings.hook_timeout.is_zero() {
            anyhow::bail!("settings.hook_timeout must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.telemetry.trace_sample_rate) {
            anyhow::bail!(
                "telemetry.trace_sample_rate must be between 0.0 and 1.0, got {}",
                self.telemetry.trace_sample_rate
            );
        }

        info!("configuration validated successfully");
        Ok(())
    }
}

fn validate_permitted(bridge: &str, list: &str, entries: &[PermittedConfig]) -> Result<()> {
    for entry in entries {
        if let Some(re) = &entry.address_re {
            regex::Regex::new(re).with_context(|| format!("bridge '{bridge}' {list}: invalid address_re '{re}'"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_minimal_config() {
        let yaml = r#"
bridges:
  - name: web
    address: "0.0.0.0:8080"
    inbound_permitted:
      - address: orders
    outbound_permitted:
      - address_re: "news\\..+"
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.bridges.len(), 1);
        assert_eq!(config.bridges[0].prefix, "/eventbus");
        assert_eq!(config.bridges[0].limits.outbound_queue, 256);
        assert_eq!(config.settings.hook_timeout, Duration::from_secs(5));
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
bridges:
  - name: web
    address: "127.0.0.1:8080"
    prefix: /bus
    inbound_permitted:
      - address: orders
        match:
          kind: create
      - requires_auth: true
    limits:
      max_sessions: 10
      idle_timeout: 30s

datagram:
  - name: echo
    listen: "0.0.0.0:9999"
    echo: true
  - name: sensors
    listen: "0.0.0.0:5000"
    bridge_address: sensors.raw
    options:
      reuse_address: true
      multicast_group: 239.0.0.1

modules:
  - eventgate~access-log~1.0

settings:
  workers: 2
  hook_timeout: 250ms
  reply_timeout: 2s
  shutdown:
    drain_timeout: 1s

telemetry:
  log_level: debug
  json_logs: true
"#;

        let config = Config::from_yaml(yaml).unwrap();
        let bridge = &config.bridges[0];
        assert_eq!(bridge.prefix, "/bus");
        assert_eq!(bridge.inbound_permitted.len(), 2);
        assert!(bridge.inbound_permitted[0].match_.is_some());
        assert!(bridge.inbound_permitted[1].requires_auth);
        assert_eq!(bridge.limits.max_sessions, 10);
        assert_eq!(bridge.limits.idle_timeout, Duration::from_secs(30));

        assert_eq!(config.datagram.len(), 2);
        assert!(config.datagram[0].echo);
        assert!(config.datagram[1].options.reuse_address);
        assert_eq!(config.datagram[1].bridge_address.as_deref(), Some("sensors.raw"));

        assert_eq!(config.settings.workers, 2);
        assert_eq!(config.settings.hook_timeout, Duration::from_millis(250));
        assert_eq!(config.settings.shutdown.drain_timeout, Duration::from_secs(1));
        assert!(config.telemetry.json_logs);
    }

    #[test]
    fn test_empty_config_rejected() {
        let result = Config::from_yaml("bridges: []\n");
        assert!(result.unwrap_err().to_string().contains("at least one bridge"));
    }

    #[test]
    fn test_duplicate_bridge_name() {
        let yaml = r#"
bridges:
  - name: web
    address: "0.0.0.0:8080"
  - name: web
    address: "0.0.0.0:8081"
"#;
        let result = Config::from_yaml(yaml);
        assert!(result.unwrap_err().to_string().contains("duplicate bridge name"));
    }

    #[test]
    fn test_bad_prefix() {
        let yaml = r#"
bridges:
  - name: web
    address: "0.0.0.0:8080"
    prefix: eventbus
"#;
        let result = Config::from_yaml(yaml);
        assert!(result.unwrap_err().to_string().contains("must start with '/'"));
    }

    #[test]
    fn test_bad_regex() {
        let yaml = r#"
bridges:
  - name: web
    address: "0.0.0.0:8080"
    outbound_permitted:
      - address_re: "news.(("
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("invalid address_re"));
    }

    #[test]
    fn test_bad_module_id() {
        let yaml = r#"
datagram:
  - name: echo
    listen: "0.0.0.0:9999"
    echo: true
modules:
  - not-a-module
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("invalid module identifier"));
    }

    #[test]
    fn test_datagram_needs_a_role() {
        let yaml = r#"
datagram:
  - name: idle
    listen: "0.0.0.0:9999"
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("either echo"));
    }
}
