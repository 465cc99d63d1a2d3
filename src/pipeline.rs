use reqwest::{header::AUTHORIZATION, Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::{
    consts::ERROR_BODY_MAX_CHARS,
    error::{ApiError, RefreshError},
    refresh::{is_unavailable_status, RefreshCoordinator},
    session::SessionStore,
    util::{token_expires_within, truncate_message},
};

/// Process-wide "server unavailable" flag the UI renders a retry banner from.
#[derive(Clone)]
pub struct ServerStatus {
    tx: watch::Sender<bool>,
}

impl Default for ServerStatus {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }
}

impl ServerStatus {
    pub fn is_unavailable(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Called by the UI when the user asks to retry.
    pub fn clear(&self) {
        self.tx.send_if_modified(|flag| std::mem::replace(flag, false));
    }

    pub(crate) fn mark_unavailable(&self, detail: &str) {
        if self.tx.send_if_modified(|flag| !std::mem::replace(flag, true)) {
            tracing::warn!(%detail, "server marked unavailable");
        }
    }
}

/// A replayable API call. Kept as data so it can be re-issued after a refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    skip_refresh: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            skip_refresh: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Session lifecycle calls (login, verify, refresh) where a 401 is an
    /// answer, not an expired credential.
    pub(crate) fn lifecycle(mut self) -> Self {
        self.skip_refresh = true;
        self
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    session: SessionStore,
    coordinator: RefreshCoordinator,
    server_status: ServerStatus,
    expiry_skew_secs: u64,
}

impl ApiClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        session: SessionStore,
        coordinator: RefreshCoordinator,
        server_status: ServerStatus,
        expiry_skew_secs: u64,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
            coordinator,
            server_status,
            expiry_skew_secs,
        }
    }

    pub fn server_status(&self) -> &ServerStatus {
        &self.server_status
    }

    /// Sends `request` with the current bearer credential.
    ///
    /// A 401 is recovered with one shared refresh and a single retry. Only a
    /// failed refresh (or a second 401) surfaces as
    /// [`ApiError::Authentication`]. Other statuses are returned untouched.
    pub async fn call(&self, request: &ApiRequest) -> Result<reqwest::Response, ApiError> {
        let mut access = self.session.current_access();

        if !request.skip_refresh {
            if let Some(token) = access.as_deref() {
                if token_expires_within(token, self.expiry_skew_secs) {
                    tracing::debug!(path = %request.path, "access credential expiring, refreshing first");
                    access = Some(self.refresh_for(token).await?);
                }
            }
        }

        let response = self.execute(request, access.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED || request.skip_refresh {
            return Ok(response);
        }

        let Some(stale) = access else {
            return Err(ApiError::Authentication("Not signed in".to_string()));
        };
        tracing::debug!(path = %request.path, "401 received, refreshing credential");
        self.refresh_for(&stale).await?;

        // Whatever the store holds now is newer than what the flight returned.
        let Some(current) = self.session.current_access() else {
            return Err(ApiError::Authentication("Signed out during refresh".to_string()));
        };
        let retry = self.execute(request, Some(&current)).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(path = %request.path, "retry rejected after refresh, signing out");
            self.session.logout();
            return Err(ApiError::Authentication(
                "Credential rejected after refresh".to_string(),
            ));
        }
        Ok(retry)
    }

    /// [`call`](Self::call) plus a typed body; non-success statuses become
    /// [`ApiError::Status`].
    pub async fn call_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        let response = self.call(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unable to read response body>".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: truncate_message(&body, ERROR_BODY_MAX_CHARS),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|error| ApiError::Decode(error.to_string()))
    }

    async fn refresh_for(&self, stale: &str) -> Result<String, ApiError> {
        match self.coordinator.refresh(Some(stale)).await {
            Ok(access) => Ok(access),
            Err(RefreshError::Unavailable(detail)) => {
                self.server_status.mark_unavailable(&detail);
                Err(ApiError::ServerUnavailable(detail))
            }
            // A new sign-in replaced the session mid-flight; use its credential.
            Err(RefreshError::SessionEnded) => self
                .session
                .current_access()
                .ok_or_else(|| ApiError::Authentication(RefreshError::SessionEnded.to_string())),
            Err(error) => {
                // Terminal: no path back to a valid credential.
                self.session.logout();
                Err(ApiError::Authentication(error.to_string()))
            }
        }
    }

    pub(crate) async fn execute(
        &self,
        request: &ApiRequest,
        access: Option<&str>,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.url_for(&request.path)?;
        let mut builder = self.http.request(request.method.clone(), url);
        if let Some(token) = access {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(error) => {
                let detail = format!("Request to {} failed: {error}", request.path);
                self.server_status.mark_unavailable(&detail);
                return Err(ApiError::ServerUnavailable(detail));
            }
        };

        let status = response.status();
        if is_unavailable_status(status) {
            let detail = format!("{} returned HTTP {}", request.path, status.as_u16());
            self.server_status.mark_unavailable(&detail);
            return Err(ApiError::ServerUnavailable(detail));
        }
        if status != StatusCode::UNAUTHORIZED {
            self.server_status.clear();
        }
        tracing::debug!(method = %request.method, path = %request.path, status = status.as_u16(), "api call");
        Ok(response)
    }

    fn url_for(&self, path: &str) -> Result<String, ApiError> {
        let path = path.trim();
        if path.starts_with("http://") || path.starts_with("https://") {
            return Err(ApiError::InvalidRequest(format!(
                "absolute URLs are not routed through the API client: {path}"
            )));
        }
        let path = path.trim_start_matches('/');
        Ok(format!("{}/{path}", self.base_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_status_flag_toggles() {
        let status = ServerStatus::default();
        let mut rx = status.subscribe();
        assert!(!status.is_unavailable());
        status.mark_unavailable("HTTP 503");
        assert!(status.is_unavailable());
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        status.mark_unavailable("again");
        assert!(!rx.has_changed().unwrap());
        status.clear();
        assert!(!status.is_unavailable());
    }

    #[test]
    fn lifecycle_requests_skip_refresh() {
        let request = ApiRequest::post("/auth/login").lifecycle();
        assert!(request.skip_refresh);
        assert!(!ApiRequest::get("/accounts/").skip_refresh);
    }
}
