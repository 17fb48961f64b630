use std::env;

/// Runtime configuration, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: String,
    /// Administrator IDs that share one logical tenant for usage/settings
    /// lookups. Empty means no admin group expansion.
    pub admin_ids: Vec<i64>,
    /// Telegram bot token for limit-event notifications. Optional; without
    /// it notifications are logged and dropped.
    pub bot_token: Option<String>,
    /// TTL in seconds for the panel fetch memo.
    pub fetch_cache_ttl: u64,
    /// Upper bound on concurrent per-panel fetches in one collection.
    pub fetch_max_workers: usize,
    /// Usage sync tick interval in seconds.
    pub usage_sync_interval: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;
        let listen_addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:5000".to_string());

        let admin_ids = env::var("ADMIN_IDS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse::<i64>().ok())
            .collect();

        let bot_token = env::var("BOT_TOKEN").ok().filter(|t| !t.trim().is_empty());

        Ok(AppConfig {
            database_url,
            listen_addr,
            admin_ids,
            bot_token,
            fetch_cache_ttl: env_parse("FETCH_CACHE_TTL", 300),
            fetch_max_workers: env_parse("FETCH_MAX_WORKERS", 5),
            usage_sync_interval: env_parse("USAGE_SYNC_INTERVAL", 60),
        })
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::env_parse;

    #[test]
    fn env_parse_falls_back_on_missing_or_garbage() {
        std::env::remove_var("PANELMUX_TEST_MISSING");
        assert_eq!(env_parse("PANELMUX_TEST_MISSING", 42u64), 42);
        std::env::set_var("PANELMUX_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_parse("PANELMUX_TEST_GARBAGE", 7usize), 7);
    }
}
