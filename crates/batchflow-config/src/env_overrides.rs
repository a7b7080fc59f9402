//! Environment-variable overrides, highest precedence tier.

use std::time::Duration;

use crate::{LogFormat, ModelCapOverrides, Settings};

const ENV_PREFIX: &str = "BATCHFLOW_";

fn env(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env(name).and_then(|v| v.parse().ok())
}

/// Apply `BATCHFLOW_*` environment variables on top of `settings`,
/// mirroring `otlp2parquet-config::apply_env_overrides`'s one-field-at-a-time
/// shape.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Some(v) = env("BASE_DIR") {
        settings.base_dir = v;
    }
    if let Some(v) = env("PROVIDER_BASE_URL") {
        settings.provider_base_url = v;
    }
    if let Some(v) = env("PROVIDER_API_KEY") {
        settings.provider_api_key = v;
    }
    if let Some(v) = env("AMQP_URL") {
        settings.amqp_url = Some(v);
    }
    if let Some(v) = parse_env::<i64>("MAX_REQUESTS_PER_BATCH") {
        settings.max_requests_per_batch = v;
    }
    if let Some(v) = parse_env::<i64>("MAX_BATCH_SIZE_BYTES") {
        settings.max_batch_size_bytes = v;
    }
    if let Some(v) = parse_env::<u32>("MAX_TOKEN_LIMIT_RETRIES") {
        settings.max_token_limit_retries = v;
    }
    if let Some(v) = parse_env::<i64>("DEFAULT_TOKEN_CAP") {
        settings.default_token_cap = v;
    }
    if let Some(v) = parse_env::<u64>("WEBHOOK_CONNECT_TIMEOUT_SECS") {
        settings.webhook_connect_timeout = Duration::from_secs(v);
    }
    if let Some(v) = parse_env::<u64>("WEBHOOK_READ_TIMEOUT_SECS") {
        settings.webhook_read_timeout = Duration::from_secs(v);
    }
    if let Some(v) = parse_env::<usize>("DEFAULT_QUEUE_CONCURRENCY") {
        settings.default_queue_concurrency = v;
    }
    if let Some(v) = env("LOG_FORMAT") {
        settings.log_format = match v.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
    }
    if let Some(raw) = env("MODEL_TOKEN_CAPS") {
        // "gpt-4o=3000000,gpt-4=1000000"
        let mut caps = ModelCapOverrides::default();
        for pair in raw.split(',') {
            if let Some((prefix, cap)) = pair.split_once('=') {
                if let Ok(cap) = cap.trim().parse::<i64>() {
                    caps.set(prefix.trim(), cap);
                }
            }
        }
        settings.model_token_caps = caps;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn overrides_base_dir_from_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("BATCHFLOW_BASE_DIR", "/tmp/batchflow-test");
        let mut settings = Settings::default();
        apply_env_overrides(&mut settings);
        assert_eq!(settings.base_dir, "/tmp/batchflow-test");
        std::env::remove_var("BATCHFLOW_BASE_DIR");
    }

    #[test]
    fn parses_model_token_caps_list() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("BATCHFLOW_MODEL_TOKEN_CAPS", "gpt-4o=3000000,gpt-4=1000000");
        let mut settings = Settings::default();
        apply_env_overrides(&mut settings);
        assert_eq!(settings.token_limit_for("gpt-4o-mini"), 3_000_000);
        std::env::remove_var("BATCHFLOW_MODEL_TOKEN_CAPS");
    }
}
