use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_yaml::Value;
use tracing::{debug, warn};

const MERGE_KEY: &str = "<<";
const DEFAULT_ADDRESS: &str = "localhost";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSettings {
    pub enabled: bool,
    pub address: Option<String>,
    pub port: Option<u16>,
}

impl EndpointSettings {
    pub fn address_or_default(&self) -> &str {
        self.address.as_deref().unwrap_or(DEFAULT_ADDRESS)
    }

    fn from_value(value: Option<&Value>, section: &str) -> Self {
        let Some(value) = value else {
            return Self::default();
        };

        let enabled = lookup(value, "enabled")
            .map(|flag| match flag {
                Value::Bool(flag) => *flag,
                Value::String(text) => text.trim() == "true",
                _ => false,
            })
            .unwrap_or(false);
        let address = lookup(value, "address")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        let port = lookup(value, "port").and_then(|raw| parse_port(raw, section));

        Self {
            enabled,
            address,
            port,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitoringSettings {
    pub sidekiq_exporter: EndpointSettings,
    pub sidekiq_health_checks: EndpointSettings,
}

impl MonitoringSettings {
    pub fn load(path: &Path, environment: &str) -> Result<Self> {
        if !path.exists() {
            debug!("settings file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        Self::from_yaml(&content, environment)
            .with_context(|| format!("failed to parse settings file {}", path.display()))
    }

    pub fn from_yaml(content: &str, environment: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let root: Value = serde_yaml::from_str(content)?;
        let monitoring = lookup(&root, environment).and_then(|env| lookup(env, "monitoring"));

        Ok(Self {
            sidekiq_exporter: EndpointSettings::from_value(
                monitoring.and_then(|section| lookup(section, "sidekiq_exporter")),
                "sidekiq_exporter",
            ),
            sidekiq_health_checks: EndpointSettings::from_value(
                monitoring.and_then(|section| lookup(section, "sidekiq_health_checks")),
                "sidekiq_health_checks",
            ),
        })
    }
}

/// Mapping lookup that honours YAML merge keys (`<<: *base`). Null values
/// count as absent.
fn lookup<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let mapping = value.as_mapping()?;
    if let Some(found) = mapping.get(key).filter(|found| !found.is_null()) {
        return Some(found);
    }

    match mapping.get(MERGE_KEY)? {
        Value::Sequence(parents) => parents.iter().find_map(|parent| lookup(parent, key)),
        parent @ Value::Mapping(_) => lookup(parent, key),
        _ => None,
    }
}

fn parse_port(raw: &Value, section: &str) -> Option<u16> {
    let parsed = match raw {
        Value::Number(number) => number.as_u64().and_then(|port| u16::try_from(port).ok()),
        Value::String(text) => text.trim().parse::<u16>().ok(),
        _ => None,
    };
    if parsed.is_none() {
        warn!("ignoring invalid monitoring.{section}.port value {raw:?}");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{EndpointSettings, MonitoringSettings};

    const SETTINGS: &str = r#"
test:
  monitoring:
    sidekiq_exporter:
      address: localhost
      enabled: true
      port: '3807'
    sidekiq_health_checks:
      address: 0.0.0.0
      enabled: true
      port: 3907
"#;

    #[test]
    fn reads_endpoints_for_the_environment() {
        let settings = MonitoringSettings::from_yaml(SETTINGS, "test").expect("settings parse");
        assert_eq!(
            settings.sidekiq_exporter,
            EndpointSettings {
                enabled: true,
                address: Some("localhost".to_string()),
                port: Some(3807),
            }
        );
        assert_eq!(settings.sidekiq_health_checks.port, Some(3907));
        assert_eq!(settings.sidekiq_health_checks.address_or_default(), "0.0.0.0");
    }

    #[test]
    fn other_environments_are_empty() {
        let settings =
            MonitoringSettings::from_yaml(SETTINGS, "production").expect("settings parse");
        assert_eq!(settings, MonitoringSettings::default());
    }

    #[test]
    fn blank_sections_are_treated_as_absent() {
        let content = "test:\n  monitoring:\n    sidekiq_exporter:\n    sidekiq_health_checks: ~\n";
        let settings = MonitoringSettings::from_yaml(content, "test").expect("settings parse");
        assert_eq!(settings, MonitoringSettings::default());
        assert_eq!(settings.sidekiq_exporter.address_or_default(), "localhost");
    }

    #[test]
    fn empty_exporter_mapping_has_no_port() {
        let content = "test:\n  monitoring:\n    sidekiq_exporter: {}\n";
        let settings = MonitoringSettings::from_yaml(content, "test").expect("settings parse");
        assert!(!settings.sidekiq_exporter.enabled);
        assert_eq!(settings.sidekiq_exporter.port, None);
    }

    #[test]
    fn merge_keys_are_followed() {
        let content = r#"
production: &base
  monitoring:
    sidekiq_exporter:
      enabled: true
      port: 8082
test:
  <<: *base
"#;
        let settings = MonitoringSettings::from_yaml(content, "test").expect("settings parse");
        assert!(settings.sidekiq_exporter.enabled);
        assert_eq!(settings.sidekiq_exporter.port, Some(8082));
    }

    #[test]
    fn invalid_ports_are_ignored() {
        let content = "test:\n  monitoring:\n    sidekiq_exporter:\n      port: nope\n";
        let settings = MonitoringSettings::from_yaml(content, "test").expect("settings parse");
        assert_eq!(settings.sidekiq_exporter.port, None);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let settings = MonitoringSettings::load(&dir.path().join("gitlab.yml"), "test")
            .expect("missing file is not an error");
        assert_eq!(settings, MonitoringSettings::default());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("gitlab.yml");
        fs::write(&path, SETTINGS).expect("failed to write settings");
        let settings = MonitoringSettings::load(&path, "test").expect("settings load");
        assert!(settings.sidekiq_exporter.enabled);
    }
}
