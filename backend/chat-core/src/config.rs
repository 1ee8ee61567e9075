use crate::error::AppError;
use crate::services::retry::RetryConfig;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Where realtime events are published
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanoutConfig {
    /// In-process connection registry (single node, tests)
    InProcess,
    /// Redis PUBLISH on `chat:{id}` / `user:{id}` channels
    Redis { url: String },
}

/// Where chats, messages and unread counters are persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// Process-local maps (single node, tests)
    Memory,
    Postgres { url: String, max_connections: usize },
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Maximum length of a text message body, in characters
    pub max_text_length: usize,
    /// Length of the cached last-message preview and notification preview
    pub preview_length: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Maximum number of participants in a group chat
    pub max_group_size: usize,
    /// Retry policy for unread counter updates under contention
    pub counter_retry: RetryConfig,
    pub fanout: FanoutConfig,
    pub store: StoreConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_text_length: 4096,
            preview_length: 100,
            default_page_size: 50,
            max_page_size: 200,
            max_group_size: 256,
            counter_retry: RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(200),
                backoff_multiplier: 2.0,
                jitter: true,
            },
            fanout: FanoutConfig::InProcess,
            store: StoreConfig::Memory,
        }
    }
}

impl ChatConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; unset keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_text_length = parse_or(&lookup, "CHAT_MAX_TEXT_LENGTH", defaults.max_text_length)?;
        let preview_length = parse_or(&lookup, "CHAT_PREVIEW_LENGTH", defaults.preview_length)?;
        let default_page_size =
            parse_or(&lookup, "CHAT_DEFAULT_PAGE_SIZE", defaults.default_page_size)?;
        let max_page_size = parse_or(&lookup, "CHAT_MAX_PAGE_SIZE", defaults.max_page_size)?;
        let max_group_size = parse_or(&lookup, "CHAT_MAX_GROUP_SIZE", defaults.max_group_size)?;

        if max_text_length == 0 || preview_length == 0 {
            return Err(AppError::Config(
                "CHAT_MAX_TEXT_LENGTH and CHAT_PREVIEW_LENGTH must be positive".into(),
            ));
        }
        if default_page_size == 0 || default_page_size > max_page_size {
            return Err(AppError::Config(format!(
                "CHAT_DEFAULT_PAGE_SIZE must be within 1..={}",
                max_page_size
            )));
        }
        if max_group_size < 2 {
            return Err(AppError::Config("CHAT_MAX_GROUP_SIZE must be at least 2".into()));
        }

        let counter_retry = RetryConfig {
            max_retries: parse_or(
                &lookup,
                "CHAT_COUNTER_MAX_RETRIES",
                defaults.counter_retry.max_retries,
            )?,
            initial_backoff: Duration::from_millis(parse_or(
                &lookup,
                "CHAT_COUNTER_INITIAL_BACKOFF_MS",
                defaults.counter_retry.initial_backoff.as_millis() as u64,
            )?),
            max_backoff: Duration::from_millis(parse_or(
                &lookup,
                "CHAT_COUNTER_MAX_BACKOFF_MS",
                defaults.counter_retry.max_backoff.as_millis() as u64,
            )?),
            ..defaults.counter_retry
        };

        let fanout = match lookup("CHAT_FANOUT").as_deref() {
            None | Some("in_process") => FanoutConfig::InProcess,
            Some("redis") => FanoutConfig::Redis {
                url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
            },
            Some(other) => {
                return Err(AppError::Config(format!(
                    "CHAT_FANOUT must be `in_process` or `redis`, got `{}`",
                    other
                )))
            }
        };

        let store = match lookup("CHAT_STORE").as_deref() {
            None | Some("memory") => StoreConfig::Memory,
            Some("postgres") => {
                let url = lookup("DATABASE_URL").ok_or_else(|| {
                    AppError::Config("DATABASE_URL is required when CHAT_STORE=postgres".into())
                })?;
                let max_connections = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10usize)?;
                if max_connections == 0 {
                    return Err(AppError::Config(
                        "DATABASE_MAX_CONNECTIONS must be positive".into(),
                    ));
                }
                StoreConfig::Postgres {
                    url,
                    max_connections,
                }
            }
            Some(other) => {
                return Err(AppError::Config(format!(
                    "CHAT_STORE must be `memory` or `postgres`, got `{}`",
                    other
                )))
            }
        };

        Ok(Self {
            max_text_length,
            preview_length,
            default_page_size,
            max_page_size,
            max_group_size,
            counter_retry,
            fanout,
            store,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{} has invalid value `{}`", key, raw))),
        None => Ok(default),
    }
}
