//! YAML configuration loading for the server.
//!
//! Loads [`ExamGuardConfig`] from a YAML file on disk, then applies a small
//! set of environment overrides for deployment-specific values.

use examguard_core::{ExamGuardConfig, GatewayProvider};
use std::path::Path;
use tracing::warn;

/// Load an [`ExamGuardConfig`] from a YAML file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn load_config(path: &Path) -> anyhow::Result<ExamGuardConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
    let config: ExamGuardConfig = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {}", e))?;
    Ok(config)
}

/// Apply environment overrides from the process environment.
pub fn apply_env_overrides(config: &mut ExamGuardConfig) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides looked up through `lookup`.
///
/// Recognised keys: `EXAMGUARD_LISTEN_ADDR`, `USE_OLLAMA`, `OLLAMA_URL`,
/// `OLLAMA_MODEL`, `OPENAI_API_KEY`, `ALERT_CONFIDENCE_THRESHOLD`.
pub fn apply_overrides_from<F>(config: &mut ExamGuardConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(addr) = lookup("EXAMGUARD_LISTEN_ADDR") {
        config.listen_addr = addr;
    }

    if lookup("USE_OLLAMA").is_some_and(|v| v.eq_ignore_ascii_case("false"))
        && config.gateway.provider == GatewayProvider::Ollama
    {
        config.gateway.provider = GatewayProvider::OpenAi;
        config.gateway.base_url = "https://api.openai.com".to_string();
        config.gateway.model = "gpt-4o".to_string();
    }

    if config.gateway.provider == GatewayProvider::Ollama {
        if let Some(url) = lookup("OLLAMA_URL") {
            config.gateway.base_url = url;
        }
        if let Some(model) = lookup("OLLAMA_MODEL") {
            config.gateway.model = model;
        }
    }
    if let Some(key) = lookup("OPENAI_API_KEY") {
        config.gateway.api_key = Some(key);
    }

    if let Some(raw) = lookup("ALERT_CONFIDENCE_THRESHOLD") {
        match raw.parse::<f64>() {
            Ok(threshold) => config.risk.alert_confidence_threshold = threshold,
            Err(_) => warn!(value = %raw, "Ignoring invalid ALERT_CONFIDENCE_THRESHOLD"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use examguard_core::SignalKind;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper to write YAML to a temp file and return the path.
    fn write_yaml(yaml: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_config_full() {
        let yaml = r#"
listen_addr: "127.0.0.1:9090"
risk:
  alert_confidence_threshold: 0.8
  auto_submit_threshold: 15
  positive_feedback_interval: 10
  score_decay_amount: 0.5
  analysis_timeout_ms: 3000
  signal_score_increments:
    tab_switch: 3
    copy_paste: 2
gateway:
  provider: ollama
  base_url: "http://gpu-box:11434"
  model: "qwen3-vl:8b"
circuit_breaker:
  enabled: true
  failure_threshold: 3
  recovery_timeout_ms: 10000
  half_open_max_calls: 1
dispatcher:
  observer_buffer: 128
evidence:
  enabled: false
  max_items: 50
logging:
  level: debug
  format: json
shutdown:
  timeout_seconds: 5
"#;
        let f = write_yaml(yaml);
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9090");
        assert_eq!(config.risk.auto_submit_threshold, 15.0);
        assert_eq!(config.risk.signal_increment(SignalKind::TabSwitch), 3.0);
        assert_eq!(config.risk.signal_increment(SignalKind::WindowBlur), 1.0);
        assert_eq!(config.gateway.base_url, "http://gpu-box:11434");
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.dispatcher.observer_buffer, 128);
        assert!(!config.evidence.enabled);
        assert_eq!(config.evidence.max_items, 50);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.shutdown.timeout_seconds, 5);
        assert!(config.risk.validate().is_ok());
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Path::new("/nonexistent/config.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let f = write_yaml("not: [valid: yaml: {{{}}}");
        assert!(load_config(f.path()).is_err());
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ExamGuardConfig::default();
        apply_overrides_from(
            &mut config,
            env(&[
                ("EXAMGUARD_LISTEN_ADDR", "127.0.0.1:7000"),
                ("OLLAMA_URL", "http://ollama:11434"),
                ("OLLAMA_MODEL", "llava:13b"),
                ("ALERT_CONFIDENCE_THRESHOLD", "0.85"),
            ]),
        );
        assert_eq!(config.listen_addr, "127.0.0.1:7000");
        assert_eq!(config.gateway.base_url, "http://ollama:11434");
        assert_eq!(config.gateway.model, "llava:13b");
        assert_eq!(config.risk.alert_confidence_threshold, 0.85);
    }

    #[test]
    fn test_use_ollama_false_switches_to_openai() {
        let mut config = ExamGuardConfig::default();
        apply_overrides_from(
            &mut config,
            env(&[
                ("USE_OLLAMA", "false"),
                ("OPENAI_API_KEY", "sk-live"),
                ("OLLAMA_URL", "http://ignored:11434"),
            ]),
        );
        assert_eq!(config.gateway.provider, GatewayProvider::OpenAi);
        assert_eq!(config.gateway.base_url, "https://api.openai.com");
        assert_eq!(config.gateway.model, "gpt-4o");
        assert_eq!(config.gateway.api_key.as_deref(), Some("sk-live"));
    }

    #[test]
    fn test_invalid_threshold_override_is_ignored() {
        let mut config = ExamGuardConfig::default();
        apply_overrides_from(&mut config, env(&[("ALERT_CONFIDENCE_THRESHOLD", "high")]));
        assert_eq!(config.risk.alert_confidence_threshold, 0.7);
    }
}
