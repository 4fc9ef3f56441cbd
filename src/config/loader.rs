use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Result, WrapErr};

use crate::config::models::{RouterConfig, RouterSettings};

/// Load and process a router configuration from a file.
/// Supports YAML (default), JSON and TOML, chosen by extension.
pub fn load_settings(config_path: &str) -> Result<RouterSettings> {
    let raw = load_config(config_path)?;
    raw.process()
        .wrap_err_with(|| format!("invalid configuration in {config_path}"))
}

/// Load the raw (unprocessed) configuration from a file.
pub fn load_config(config_path: &str) -> Result<RouterConfig> {
    let path = Path::new(config_path);

    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("invalid UTF-8 path: {}", path.display()))?,
            format,
        ))
        .build()
        .wrap_err_with(|| format!("failed to read config from {}", path.display()))?;

    let router_config: RouterConfig = settings
        .try_deserialize()
        .wrap_err_with(|| format!("failed to deserialize config from {}", path.display()))?;

    Ok(router_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn loads_yaml_config() {
        let yaml = r#"
port: 9001
droplet_stale_threshold: 60
prune_stale_droplets_interval: 10
trace_key: my_trace_key
extra_headers_to_log:
  - Content-Type
"#;
        let mut file = NamedTempFile::with_suffix(".yml").unwrap();
        write!(file, "{yaml}").unwrap();

        let cfg = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.port, 9001);
        assert_eq!(cfg.droplet_stale_threshold, 60);
        assert_eq!(cfg.prune_stale_droplets_interval, 10);
        assert_eq!(cfg.trace_key, "my_trace_key");
        assert_eq!(cfg.extra_headers_to_log, vec!["Content-Type".to_string()]);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.status.port, 8082);
        assert_eq!(cfg.endpoint_timeout, 60);
    }

    #[test]
    fn loads_json_config() {
        let json = r#"{"port": 9002, "secure_cookies": true}"#;
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, "{json}").unwrap();

        let cfg = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.port, 9002);
        assert!(cfg.secure_cookies);
    }
}
