use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::ChannelRef, errors::Error, Result};

/// Typed configuration for the bot.
///
/// Loaded once from the environment at process start and passed by reference
/// into the engine; the scheduler treats every value here as immutable for
/// its lifetime.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub bot_token: String,
    pub admin_ids: Vec<i64>,
    pub source_channel: ChannelRef,

    // Scheduling policy
    pub tick_interval: Duration,
    pub max_probe_steps: u32,
    pub failure_threshold: u32,
    pub per_send_timeout: Duration,
    pub send_concurrency: usize,

    // Persistence
    pub state_path: PathBuf,
    pub save_retries: u32,

    // Chat cache
    pub cache_max_age: Duration,

    // Statistics
    pub history_capacity: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let bot_token = env_str("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(Error::Config(
                "BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        // ADMIN_IDS with OWNER_ID as a single-admin fallback.
        let admin_ids = parse_csv_i64(env_str("ADMIN_IDS").or_else(|| env_str("OWNER_ID")));
        if admin_ids.is_empty() {
            return Err(Error::Config(
                "ADMIN_IDS (or OWNER_ID) environment variable is required".to_string(),
            ));
        }

        let source_channel: ChannelRef = env_str("SOURCE_CHANNEL")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("SOURCE_CHANNEL environment variable is required".to_string())
            })?
            .parse()?;

        let tick_interval = Duration::from_secs(env_u64("TICK_INTERVAL_SECONDS").unwrap_or(300));
        if tick_interval.is_zero() {
            return Err(Error::Config(
                "TICK_INTERVAL_SECONDS must be greater than zero".to_string(),
            ));
        }

        let max_probe_steps = env_u32("MAX_PROBE_STEPS").unwrap_or(10).max(1);
        let failure_threshold = env_u32("FAILURE_THRESHOLD").unwrap_or(5).max(1);
        let per_send_timeout =
            Duration::from_millis(env_u64("PER_SEND_TIMEOUT_MS").unwrap_or(10_000));
        let send_concurrency = env_usize("SEND_CONCURRENCY").unwrap_or(5).max(1);

        let state_path =
            PathBuf::from(env_str("STATE_PATH").unwrap_or("repost-state.json".to_string()));
        let save_retries = env_u32("SAVE_RETRIES").unwrap_or(3);

        let cache_max_age = Duration::from_secs(env_u64("CACHE_MAX_AGE_SECONDS").unwrap_or(300));

        let history_capacity = env_usize("HISTORY_CAPACITY").unwrap_or(20).max(1);

        Ok(Self {
            bot_token,
            admin_ids,
            source_channel,
            tick_interval,
            max_probe_steps,
            failure_threshold,
            per_send_timeout,
            send_concurrency,
            state_path,
            save_retries,
            cache_max_age,
            history_capacity,
        })
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
