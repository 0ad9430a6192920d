/// Prefix of every peer-visible anonymous id.
pub const ANON_ID_PREFIX: &str = "u_";

/// Number of random `[a-z0-9]` characters after [`ANON_ID_PREFIX`].
pub const ANON_ID_LEN: usize = 8;

/// Prefix of session identifiers.
pub const SESSION_ID_PREFIX: &str = "sess_";

/// Prefix of report identifiers.
pub const REPORT_ID_PREFIX: &str = "report_";

/// Hex characters taken from a fresh UUID for session / report ids.
pub const ID_SUFFIX_LEN: usize = 12;

/// The only attribution a relayed message ever carries.
pub const PARTNER_LABEL: &str = "Partner";

/// Deep-link payload prefix that carries a gate token back to the bot.
pub const MONETIZE_DEEP_LINK_PREFIX: &str = "monetize_";

/// Default hours between two required gate completions.
pub const DEFAULT_MONETIZE_INTERVAL_HOURS: i64 = 12;

/// Default lifetime of an issued gate token, in minutes.
pub const DEFAULT_MONETIZE_TOKEN_TTL_MINUTES: i64 = 30;

/// Default minimum seconds between issuing and redeeming a token.
pub const DEFAULT_MONETIZE_MIN_WAIT_SECONDS: i64 = 10;

/// Default number of warnings that triggers an automatic ban.
pub const DEFAULT_WARN_THRESHOLD: u32 = 3;

/// Outbound payloads buffered per user before delivery counts as failed.
pub const MAILBOX_CAPACITY: usize = 256;
