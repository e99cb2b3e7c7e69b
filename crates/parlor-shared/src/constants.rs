/// Prefix distinguishing locally-generated temporary message ids from any
/// server-assigned id.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Default page size for history fetches.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Number of recent messages re-fetched by the fallback poll.
pub const POLL_WINDOW_SIZE: u32 = 5;

/// Interval between fallback poll ticks, in seconds.
pub const POLL_INTERVAL_SECS: u64 = 10;

/// Minimum delay between push-channel reconnect attempts, in seconds.
pub const RECONNECT_DELAY_SECS: u64 = 5;

/// How long a typing indicator stays visible without a refreshing event,
/// in seconds.
pub const TYPING_TTL_SECS: u64 = 5;

/// Request timeout applied to every request-reply call, in seconds.
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Capacity of the push command / event channels.
pub const PUSH_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the engine's broadcast event channel.
pub const ENGINE_EVENT_CAPACITY: usize = 256;
