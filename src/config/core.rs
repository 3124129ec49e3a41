use super::FirmflowConfig;
use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Json, Toml},
};
use std::path::Path;

// Embed the default config at compile time
const DEFAULT_CONFIG: &str = include_str!("../../default-config.toml");

impl FirmflowConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_custom_config(None)
    }

    /// Load defaults, then the given file (TOML or JSON by extension), then env vars
    pub fn load_with_custom_config(custom_config: Option<&str>) -> Result<Self, ConfigError> {
        let config: FirmflowConfig = Self::figment(custom_config)?
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment(custom_config: Option<&str>) -> Result<Figment, ConfigError> {
        let mut figment = Figment::new().merge(Toml::string(DEFAULT_CONFIG));

        if let Some(custom_path) = custom_config {
            let path = Path::new(custom_path);
            if !path.exists() {
                return Err(ConfigError::Load(format!(
                    "config file {custom_path} does not exist"
                )));
            }
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        } else {
            figment = figment.merge(Toml::file("firmflow.toml"));
        }

        // Environment variables always have highest priority
        Ok(figment.merge(Env::prefixed("FIRMFLOW_").split("__")))
    }

    /// The merged configuration rendered back to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Load(e.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn from_toml_str(overrides: &str) -> Result<Self, ConfigError> {
        let config: FirmflowConfig = Figment::new()
            .merge(Toml::string(DEFAULT_CONFIG))
            .merge(Toml::string(overrides))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CrashPolicy;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_config_loads_defaults() {
        let config = FirmflowConfig::from_toml_str("").expect("Should load default config");

        assert_eq!(config.unpack.max_depth, 8);
        assert_eq!(config.unpack.throttle_limit, 50);
        assert_eq!(config.scheduler.block_delay_ms, 100);
        assert_eq!(config.scheduler.crash_policy, CrashPolicy::Restart);
        assert!(config.unpack.skip_mime_types.iter().any(|p| p == "text/*"));
        assert_eq!(
            config.analysis.plugins["printable_strings"].timeout_ms,
            Some(60000)
        );
    }

    #[test]
    fn test_overrides_merge_over_defaults() {
        let config = FirmflowConfig::from_toml_str(
            r#"
            [unpack]
            threads = 2
            max_depth = 3
            throttle_limit = -1

            [scheduler]
            crash_policy = "fail-fast"

            [analysis.plugins.file_hashes]
            process_count = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.unpack.threads, 2);
        assert_eq!(config.unpack_threads(), 2);
        assert_eq!(config.unpack.max_depth, 3);
        assert_eq!(config.unpack.throttle_limit, -1);
        assert_eq!(config.scheduler.crash_policy, CrashPolicy::FailFast);
        // untouched keys keep their defaults
        assert_eq!(config.scheduler.monitor_interval_ms, 1000);
        let hashes = &config.analysis.plugins["file_hashes"];
        assert_eq!(hashes.process_count, Some(4));
        assert!(hashes.enabled);
    }

    #[test]
    fn test_custom_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("custom.toml");
        fs::write(&path, "[unpack]\nmax_depth = 2\n").unwrap();

        let config = FirmflowConfig::load_with_custom_config(path.to_str()).unwrap();
        assert_eq!(config.unpack.max_depth, 2);
    }

    #[test]
    fn test_custom_json_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("custom.json");
        fs::write(&path, r#"{"analysis": {"default_plugins": ["file_type"]}}"#).unwrap();

        let config = FirmflowConfig::load_with_custom_config(path.to_str()).unwrap();
        assert_eq!(config.analysis.default_plugins, vec!["file_type".to_string()]);
    }

    #[test]
    fn test_missing_custom_config_is_an_error() {
        let result = FirmflowConfig::load_with_custom_config(Some("does-not-exist.toml"));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let result = FirmflowConfig::from_toml_str("[unpack]\nskip_mime_types = [\"text/[\"]\n");
        assert!(matches!(result, Err(ConfigError::Pattern { .. })));
    }

    #[test]
    fn test_to_toml_round_trips_key_settings() {
        let config = FirmflowConfig::from_toml_str("").unwrap();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("max_depth = 8"));
        assert!(rendered.contains("crash_policy = \"restart\""));
    }
}
