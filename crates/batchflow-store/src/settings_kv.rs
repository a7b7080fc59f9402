//! Minimal key/value accessor for the `settings` table named in the
//! persisted schema (spec §6). `batchflow-config::load_settings` resolves
//! from env/file/defaults; this exists for the rare operator-driven
//! override that needs to survive a restart without touching the deploy
//! environment, and is not wired into the default load path.

use sqlx::PgPool;

use crate::error::Result;

const UPSERT_SETTING: &str = r#"
    INSERT INTO settings (key, value, updated_at) VALUES ($1, $2, now())
    ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
"#;

const SELECT_SETTING: &str = "SELECT value FROM settings WHERE key = $1";

pub async fn get_setting(pool: &PgPool, key: &str) -> Result<Option<serde_json::Value>> {
    let value: Option<serde_json::Value> = sqlx::query_scalar(SELECT_SETTING).bind(key).fetch_optional(pool).await?;
    Ok(value)
}

pub async fn set_setting(pool: &PgPool, key: &str, value: serde_json::Value) -> Result<()> {
    sqlx::query(UPSERT_SETTING).bind(key).bind(value).execute(pool).await?;
    Ok(())
}
