pub(crate) const SEEN_SET_CAPACITY: usize = 100;
pub(crate) const EVENT_BUFFER: usize = 256;

pub(crate) const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
pub(crate) const DEFAULT_TOKEN_EXPIRY_SKEW_SECS: u64 = 30;

pub(crate) const CHANNEL_CONNECT_TIMEOUT_SECS: u64 = 10;
pub(crate) const CHANNEL_PING_INTERVAL_SECS: u64 = 25;
pub(crate) const CHANNEL_MAX_MISSED_PONGS: u32 = 2;
pub(crate) const CHANNEL_BACKOFF_INITIAL_SECS: u64 = 1;
pub(crate) const CHANNEL_BACKOFF_MAX_SECS: u64 = 30;
pub(crate) const CHANNEL_BACKOFF_JITTER_MS: u64 = 500;
pub(crate) const CHANNEL_STOP_GRACE_SECS: u64 = 5;
pub(crate) const CHANNEL_PATH: &str = "/ws/notifications/";

pub(crate) const REFRESH_PATH: &str = "/auth/refresh";
pub(crate) const LOGIN_PATH: &str = "/auth/login";
pub(crate) const LOGIN_VERIFY_PATH: &str = "/auth/login/verify";
pub(crate) const LOGOUT_PATH: &str = "/auth/logout";

pub(crate) const STORE_KEY_ACCESS: &str = "access_token";
pub(crate) const STORE_KEY_USER: &str = "user";
pub(crate) const KEYRING_SERVICE: &str = "net.session-link";

pub(crate) const ERROR_BODY_MAX_CHARS: usize = 200;
