//! Authenticated session client: credential storage, single-flight token
//! refresh, a retrying request pipeline and a reconnecting notification
//! channel with duplicate suppression and a server-confirmed unread count.

mod client;
mod consts;
mod diagnostics;
mod error;
mod model;
mod notifications;
mod pipeline;
mod refresh;
mod session;
mod settings;
mod store;
mod stream;
mod util;

pub use client::SessionClient;
pub use diagnostics::ChannelDiagnostics;
pub use error::{
    ApiError, ChannelError, Error, RefreshError, Result, SessionError, SettingsError, StoreError,
};
pub use model::{
    ChannelEvent, ClientAction, ConnectionState, LoginOutcome, NotificationEnvelope, Priority,
    RefreshedTokens, ServerMessage, UserSummary,
};
pub use notifications::{SeenSet, UnreadCounter};
pub use pipeline::{ApiClient, ApiRequest, ServerStatus};
pub use refresh::{HttpRefresher, RefreshCoordinator, TokenRefresher};
pub use session::SessionStore;
pub use settings::ClientSettings;
pub use store::{CredentialStore, FileStore, KeyringStore, MemoryStore};
pub use stream::{ChannelConfig, NotificationChannel};
