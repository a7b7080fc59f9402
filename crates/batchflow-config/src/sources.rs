//! Top-level loader: defaults, then an optional TOML file, then env vars.

use anyhow::{Context, Result};

use crate::env_overrides::apply_env_overrides;
use crate::validation::validate;
use crate::Settings;

/// Load settings the way `otlp2parquet_config::load_config` does: start
/// from hard defaults, merge an optional file, then apply environment
/// overrides (highest priority), then validate.
pub fn load_settings() -> Result<Settings> {
    let mut settings = Settings::default();

    if let Some(path) = std::env::var_os("BATCHFLOW_CONFIG") {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file {path:?}"))?;
        let file_settings: FileSettings =
            toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))?;
        file_settings.merge_into(&mut settings);
    }

    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Partial settings as they appear in an optional TOML file; every field is
/// optional so the file only needs to mention what it overrides.
#[derive(Debug, Default, serde::Deserialize)]
struct FileSettings {
    base_dir: Option<String>,
    provider_base_url: Option<String>,
    max_requests_per_batch: Option<i64>,
    max_batch_size_bytes: Option<i64>,
    max_token_limit_retries: Option<u32>,
    default_token_cap: Option<i64>,
}

impl FileSettings {
    fn merge_into(self, settings: &mut Settings) {
        if let Some(v) = self.base_dir {
            settings.base_dir = v;
        }
        if let Some(v) = self.provider_base_url {
            settings.provider_base_url = v;
        }
        if let Some(v) = self.max_requests_per_batch {
            settings.max_requests_per_batch = v;
        }
        if let Some(v) = self.max_batch_size_bytes {
            settings.max_batch_size_bytes = v;
        }
        if let Some(v) = self.max_token_limit_retries {
            settings.max_token_limit_retries = v;
        }
        if let Some(v) = self.default_token_cap {
            settings.default_token_cap = v;
        }
    }
}
