use crate::error::{AppError, Result};

pub const WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";
pub const GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";
pub const CLOB_API_URL: &str = "https://clob.polymarket.com";

/// Gamma /markets page size. Pagination stops on a short page.
pub const GAMMA_PAGE_SIZE: usize = 500;

/// Hard cap on pages per pagination pass, in case the upstream never
/// returns a short page.
pub const GAMMA_MAX_PAGES: usize = 20;

/// Heartbeat ping interval per WS connection (seconds).
pub const WS_PING_INTERVAL_SECS: u64 = 30;

/// Reconnect backoff ladder in milliseconds. The index advances on each
/// consecutive failed connection and resets after a clean session.
pub const RECONNECT_BACKOFF_MS: &[u64] = &[250, 500, 1000, 2000, 5000, 10_000];

/// Maximum token IDs per WS connection. A single connection has a
/// subscription-count ceiling server-side; the listener opens one
/// connection per chunk of this size.
pub const WS_SUBSCRIBE_CHUNK_SIZE: usize = 500;

/// Shared trade queue capacity. When full the incoming event is dropped
/// (never blocks the read loop).
pub const TRADE_QUEUE_CAPACITY: usize = 4096;

/// Max trades per bulk write from the drain task.
pub const TRADE_BATCH_MAX: usize = 256;

/// Flush a partial trade batch after this long (milliseconds).
pub const TRADE_FLUSH_INTERVAL_MS: u64 = 500;

/// Attempts for a failed trade batch write before the batch is dropped.
pub const TRADE_WRITE_RETRIES: u32 = 3;

/// Delay between trade batch write retries (milliseconds).
pub const TRADE_WRITE_RETRY_DELAY_MS: u64 = 1000;

/// Monitor cycle interval (seconds).
pub const MONITOR_INTERVAL_SECS: u64 = 10;

/// Restart backoff: delay(n) = min(base * 2^(n-1), cap) for consecutive crash n.
pub const RESTART_BASE_DELAY_SECS: u64 = 5;
pub const RESTART_MAX_DELAY_SECS: u64 = 300;

/// A unit that crashes more than this many times is marked failed and never
/// restarted again. The rest of the process keeps running.
pub const MAX_UNIT_RESTARTS: u32 = 50;

/// A unit that has stayed up this long has its crash streak cleared and the
/// backoff ladder starts over on its next crash.
pub const RESTART_STABLE_SECS: u64 = 300;

/// How long stop() waits for a unit to wind down before aborting its task.
pub const SHUTDOWN_GRACE_SECS: u64 = 15;

/// Winner inference thresholds over final observed prices.
pub const WINNER_MIN_PRICE: f64 = 0.95;
pub const LOSER_MAX_PRICE: f64 = 0.05;

/// Rate limiter: tokens per second / burst per endpoint class.
pub const GAMMA_RATE_PER_SEC: f64 = 4.0;
pub const GAMMA_BURST: f64 = 8.0;
pub const CLOB_RATE_PER_SEC: f64 = 10.0;
pub const CLOB_BURST: f64 = 20.0;

/// Outbound HTTP request timeout (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Token IDs per CLOB /books batch request.
pub const CLOB_BOOKS_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub ws_url: String,
    pub gamma_api_url: String,
    pub clob_api_url: String,
    pub log_level: String,
    pub api_port: u16,
    /// Metadata poll interval in seconds (METADATA_INTERVAL_SECS)
    pub metadata_interval_secs: u64,
    /// Price snapshot poll interval in seconds (PRICE_INTERVAL_SECS)
    pub price_interval_secs: u64,
    /// Order book poll interval in seconds (BOOK_INTERVAL_SECS)
    pub book_interval_secs: u64,
    /// Resolution detection interval in seconds (RESOLUTION_INTERVAL_SECS)
    pub resolution_interval_secs: u64,
    /// Max markets whose books are polled per cycle (BOOK_MARKETS_LIMIT)
    pub book_markets_limit: i64,
    /// Max markets the trade listener subscribes to (STREAM_MAX_MARKETS)
    pub stream_max_markets: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL must be set".to_string()))?,
            ws_url: std::env::var("WS_URL").unwrap_or_else(|_| WS_URL.to_string()),
            gamma_api_url: std::env::var("GAMMA_API_URL")
                .unwrap_or_else(|_| GAMMA_API_URL.to_string()),
            clob_api_url: std::env::var("CLOB_API_URL")
                .unwrap_or_else(|_| CLOB_API_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            metadata_interval_secs: env_u64("METADATA_INTERVAL_SECS", 300),
            price_interval_secs: env_u64("PRICE_INTERVAL_SECS", 60),
            book_interval_secs: env_u64("BOOK_INTERVAL_SECS", 120),
            resolution_interval_secs: env_u64("RESOLUTION_INTERVAL_SECS", 600),
            book_markets_limit: env_u64("BOOK_MARKETS_LIMIT", 200) as i64,
            stream_max_markets: env_u64("STREAM_MAX_MARKETS", 500) as i64,
        })
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}
