use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read credential store: {0}")]
    Read(String),
    #[error("Failed to write credential store: {0}")]
    Write(String),
    #[error("Credential store is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Access credential must not be empty")]
    EmptyAccess,
}

/// Outcome of a failed refresh, shared by every caller that joined the flight.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Refresh rejected by server (HTTP {status})")]
    Rejected { status: u16 },
    #[error("Server unavailable during refresh: {0}")]
    Unavailable(String),
    #[error("Failed to decode refresh response: {0}")]
    Decode(String),
    #[error("Not signed in")]
    SignedOut,
    #[error("Session ended while refresh was in flight")]
    SessionEnded,
    #[error("Refresh task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication required: {0}")]
    Authentication(String),
    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),
    #[error("Request failed with HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to decode response: {0}")]
    Decode(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ApiError {
    /// Whether the UI shell should drop to the sign-in entry point.
    pub fn requires_login(&self) -> bool {
        matches!(self, ApiError::Authentication(_))
    }

    pub fn is_server_unavailable(&self) -> bool {
        matches!(self, ApiError::ServerUnavailable(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Notification channel is not connected")]
    NotConnected,
    #[error("Not signed in")]
    SignedOut,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("Invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("Failed to read settings: {0}")]
    Read(String),
    #[error("Failed to parse settings: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
