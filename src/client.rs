use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch};

use crate::{
    consts::{LOGIN_PATH, LOGIN_VERIFY_PATH, LOGOUT_PATH},
    diagnostics::ChannelDiagnostics,
    error::{ApiError, Result},
    model::{ChannelEvent, ConnectionState, LoginOutcome, LoginResponseWire, UserSummary},
    pipeline::{ApiClient, ApiRequest, ServerStatus},
    refresh::{HttpRefresher, RefreshCoordinator, TokenRefresher},
    session::SessionStore,
    settings::ClientSettings,
    store::CredentialStore,
    stream::{ChannelConfig, NotificationChannel},
    util::truncate_message,
};

/// Wires the session, refresh coordinator, request pipeline and notification
/// channel together. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SessionClient {
    settings: Arc<ClientSettings>,
    session: SessionStore,
    coordinator: RefreshCoordinator,
    api: ApiClient,
    channel: NotificationChannel,
}

impl SessionClient {
    pub fn new(settings: ClientSettings, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let settings = settings.validate()?;
        let http = build_http_client(&settings)?;
        let refresher = Arc::new(HttpRefresher::new(http.clone(), &settings.api_base_url));
        Self::assemble(settings, store, http, refresher)
    }

    /// Same as [`new`](Self::new) with a custom refresh transport.
    pub fn with_refresher(
        settings: ClientSettings,
        store: Arc<dyn CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self> {
        let settings = settings.validate()?;
        let http = build_http_client(&settings)?;
        Self::assemble(settings, store, http, refresher)
    }

    fn assemble(
        settings: ClientSettings,
        store: Arc<dyn CredentialStore>,
        http: reqwest::Client,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self> {
        let session = SessionStore::new(store);
        let coordinator = RefreshCoordinator::new(session.clone(), refresher);
        let api = ApiClient::new(
            http,
            &settings.api_base_url,
            session.clone(),
            coordinator.clone(),
            ServerStatus::default(),
            settings.token_expiry_skew_secs,
        );
        let channel = NotificationChannel::new(
            ChannelConfig::from_settings(&settings)?,
            session.clone(),
            Some(coordinator.clone()),
        );
        Ok(Self {
            settings: Arc::new(settings),
            session,
            coordinator,
            api,
            channel,
        })
    }

    /// Picks up a persisted session and opens the channel for it.
    pub fn restore(&self) -> Result<bool> {
        if !self.session.restore()? {
            return Ok(false);
        }
        self.channel.start()?;
        Ok(true)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome> {
        let request = ApiRequest::post(LOGIN_PATH)
            .json(serde_json::json!({ "email": email.trim(), "password": password }))
            .lifecycle();
        let wire = self.lifecycle_call::<LoginResponseWire>(&request).await?;

        if wire.verification_required {
            let challenge_id = wire.challenge_id.unwrap_or_default();
            if challenge_id.trim().is_empty() {
                return Err(ApiError::Decode(
                    "verification required without a challenge id".to_string(),
                )
                .into());
            }
            tracing::info!("login requires verification");
            return Ok(LoginOutcome::VerificationRequired { challenge_id });
        }
        self.establish(wire)
    }

    pub async fn verify_login(&self, challenge_id: &str, code: &str) -> Result<LoginOutcome> {
        let request = ApiRequest::post(LOGIN_VERIFY_PATH)
            .json(serde_json::json!({ "challenge_id": challenge_id, "code": code.trim() }))
            .lifecycle();
        let wire = self.lifecycle_call::<LoginResponseWire>(&request).await?;
        self.establish(wire)
    }

    /// Signs out locally, stops the channel, then tells the server. The server
    /// call is best effort.
    pub async fn logout(&self) {
        let access = self.session.current_access();
        self.session.logout();
        self.channel.stop().await;

        let Some(access) = access else {
            return;
        };
        let request = ApiRequest::post(LOGOUT_PATH).lifecycle();
        match self.api.execute(&request, Some(&access)).await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!("server session revoked");
            }
            Ok(response) => {
                tracing::warn!(status = response.status().as_u16(), "server logout rejected");
            }
            Err(error) => tracing::warn!(%error, "server logout failed"),
        }
    }

    pub async fn call(&self, request: &ApiRequest) -> Result<reqwest::Response, ApiError> {
        self.api.call(request).await
    }

    pub async fn call_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        self.api.call_json(request).await
    }

    pub fn mark_as_read(&self, ids: Vec<String>) -> Result<()> {
        Ok(self.channel.mark_as_read(ids)?)
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn user(&self) -> Option<UserSummary> {
        self.session.user()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn unread_count(&self) -> Option<u64> {
        self.channel.unread_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.channel.subscribe()
    }

    pub fn subscribe_unread(&self) -> watch::Receiver<Option<u64>> {
        self.channel.subscribe_unread()
    }

    pub fn subscribe_auth(&self) -> watch::Receiver<bool> {
        self.session.subscribe()
    }

    pub fn diagnostics(&self) -> ChannelDiagnostics {
        self.channel.diagnostics()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn channel(&self) -> &NotificationChannel {
        &self.channel
    }

    pub fn server_status(&self) -> &ServerStatus {
        self.api.server_status()
    }

    async fn lifecycle_call<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        match self.api.call_json::<T>(request).await {
            Ok(value) => Ok(value),
            Err(ApiError::Status { status, body }) if matches!(status, 400 | 401 | 403) => {
                tracing::info!(path = %request.path, status, "sign-in rejected");
                Err(ApiError::Authentication(format!(
                    "Sign-in rejected (HTTP {status}): {}",
                    truncate_message(&body, 120)
                ))
                .into())
            }
            Err(error) => Err(error.into()),
        }
    }

    fn establish(&self, wire: LoginResponseWire) -> Result<LoginOutcome> {
        let access = wire
            .access
            .ok_or_else(|| ApiError::Decode("login response missing access credential".to_string()))?;
        let user = wire
            .user
            .ok_or_else(|| ApiError::Decode("login response missing user".to_string()))?;

        self.session
            .set_credentials(user.clone(), &access, wire.refresh.as_deref())?;
        self.channel.start()?;
        tracing::info!(user_id = %user.id, "signed in");
        Ok(LoginOutcome::Authenticated(user))
    }
}

fn build_http_client(settings: &ClientSettings) -> Result<reqwest::Client, ApiError> {
    reqwest::Client::builder()
        .cookie_store(true)
        .timeout(settings.request_timeout())
        .build()
        .map_err(|error| ApiError::InvalidRequest(format!("Failed to build HTTP client: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::Error, store::MemoryStore};

    #[test]
    fn rejects_unusable_settings() {
        let result = SessionClient::new(ClientSettings::default(), Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(Error::Settings(_))));
    }

    #[tokio::test]
    async fn fresh_client_is_signed_out_and_idle() {
        let client = SessionClient::new(
            ClientSettings::new("http://127.0.0.1:9/api"),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        assert!(!client.is_authenticated());
        assert!(!client.restore().unwrap());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.channel().is_running());
        assert_eq!(
            client.settings().channel_url.as_deref(),
            Some("ws://127.0.0.1:9/ws/notifications/")
        );
        client.logout().await;
        assert!(!client.is_authenticated());
    }
}
