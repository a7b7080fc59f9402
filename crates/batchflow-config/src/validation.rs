//! Settings validation, run once after every load.

use anyhow::{bail, Result};

use crate::Settings;

pub fn validate(settings: &Settings) -> Result<()> {
    if settings.max_requests_per_batch <= 0 {
        bail!("max_requests_per_batch must be positive");
    }
    if settings.max_batch_size_bytes <= 0 {
        bail!("max_batch_size_bytes must be positive");
    }
    if settings.default_token_cap <= 0 {
        bail!("default_token_cap must be positive");
    }
    if settings.max_token_limit_retries == 0 {
        bail!("max_token_limit_retries must be at least 1");
    }
    if settings.base_dir.trim().is_empty() {
        bail!("base_dir must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        assert!(validate(&Settings::default()).is_ok());
    }

    #[test]
    fn rejects_zero_batch_cap() {
        let mut s = Settings::default();
        s.max_requests_per_batch = 0;
        assert!(validate(&s).is_err());
    }
}
