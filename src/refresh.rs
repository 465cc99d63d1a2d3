use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use futures_util::future::{BoxFuture, FutureExt as _, Shared};
use reqwest::StatusCode;

use crate::{
    consts::REFRESH_PATH, error::RefreshError, model::RefreshedTokens, session::SessionStore,
    util::truncate_message,
};

/// Network seam for minting a new access credential.
pub trait TokenRefresher: Send + Sync + 'static {
    fn refresh(
        &self,
        refresh_credential: Option<String>,
    ) -> BoxFuture<'static, Result<RefreshedTokens, RefreshError>>;
}

/// `POST {api}/auth/refresh`. The HTTP-only refresh cookie rides in the
/// client's cookie jar; a body credential is only sent when the server
/// handed one out at login.
pub struct HttpRefresher {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpRefresher {
    pub fn new(http: reqwest::Client, api_base_url: &str) -> Self {
        Self {
            http,
            endpoint: format!("{}{REFRESH_PATH}", api_base_url.trim_end_matches('/')),
        }
    }
}

impl TokenRefresher for HttpRefresher {
    fn refresh(
        &self,
        refresh_credential: Option<String>,
    ) -> BoxFuture<'static, Result<RefreshedTokens, RefreshError>> {
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        async move {
            let request = http.post(&endpoint);
            let request = match refresh_credential {
                Some(refresh) => request.json(&serde_json::json!({ "refresh": refresh })),
                None => request,
            };
            let response = request
                .send()
                .await
                .map_err(|error| RefreshError::Unavailable(error.to_string()))?;

            let status = response.status();
            if is_unavailable_status(status) {
                return Err(RefreshError::Unavailable(format!("HTTP {}", status.as_u16())));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(
                    status = status.as_u16(),
                    body = %truncate_message(&body, 120),
                    "refresh rejected"
                );
                return Err(RefreshError::Rejected {
                    status: status.as_u16(),
                });
            }
            response
                .json::<RefreshedTokens>()
                .await
                .map_err(|error| RefreshError::Decode(error.to_string()))
        }
        .boxed()
    }
}

pub(crate) fn is_unavailable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

type SharedRefresh = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

struct CoordinatorShared {
    session: SessionStore,
    refresher: Arc<dyn TokenRefresher>,
    in_flight: Mutex<Option<(u64, SharedRefresh)>>,
    next_flight_id: AtomicU64,
    issued: AtomicU64,
}

/// Single-flight token refresh: one network call in flight, any number of
/// joiners sharing its result.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorShared>,
}

impl RefreshCoordinator {
    pub fn new(session: SessionStore, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            inner: Arc::new(CoordinatorShared {
                session,
                refresher,
                in_flight: Mutex::new(None),
                next_flight_id: AtomicU64::new(1),
                issued: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a fresh access credential.
    ///
    /// `stale_access` is the credential the caller's failed request carried.
    /// When no refresh is pending and the session already moved past it, the
    /// current credential is returned without touching the network.
    pub async fn refresh(&self, stale_access: Option<&str>) -> Result<String, RefreshError> {
        let flight = {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .map_err(|_| RefreshError::Aborted("Refresh lock poisoned".to_string()))?;
            match slot.as_ref() {
                Some((_, flight)) => {
                    tracing::debug!("joining in-flight refresh");
                    flight.clone()
                }
                None => {
                    if !self.inner.session.is_authenticated() {
                        return Err(RefreshError::SignedOut);
                    }
                    if let (Some(stale), Some(current)) =
                        (stale_access, self.inner.session.current_access())
                    {
                        if stale != current {
                            tracing::debug!("credential already rotated, skipping refresh");
                            return Ok(current);
                        }
                    }
                    let (flight_id, flight) = self.launch();
                    *slot = Some((flight_id, flight.clone()));
                    flight
                }
            }
        };
        flight.await
    }

    /// Number of refresh calls issued to the network so far.
    pub fn refresh_count(&self) -> u64 {
        self.inner.issued.load(Ordering::SeqCst)
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner
            .in_flight
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    fn launch(&self) -> (u64, SharedRefresh) {
        let flight_id = self.inner.next_flight_id.fetch_add(1, Ordering::SeqCst);
        let generation = self.inner.session.generation();
        let refresh_credential = self.inner.session.refresh_credential();
        let call = self.inner.refresher.refresh(refresh_credential);
        self.inner.issued.fetch_add(1, Ordering::SeqCst);
        tracing::info!(flight_id, "token refresh started");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let outcome = match call.await {
                Ok(tokens) => {
                    if inner.session.apply_refresh(
                        generation,
                        &tokens.access,
                        tokens.refresh.as_deref(),
                    ) {
                        tracing::info!(flight_id, "token refresh succeeded");
                        Ok(tokens.access)
                    } else {
                        tracing::info!(flight_id, "session changed during refresh, result discarded");
                        Err(RefreshError::SessionEnded)
                    }
                }
                Err(RefreshError::Unavailable(detail)) => {
                    tracing::warn!(flight_id, %detail, "refresh failed, server unavailable");
                    Err(RefreshError::Unavailable(detail))
                }
                Err(error) => {
                    tracing::warn!(flight_id, %error, "token refresh failed, signing out");
                    if inner.session.generation() == generation {
                        inner.session.logout();
                    }
                    Err(error)
                }
            };
            if let Ok(mut slot) = inner.in_flight.lock() {
                if matches!(slot.as_ref(), Some((id, _)) if *id == flight_id) {
                    *slot = None;
                }
            }
            outcome
        });

        let flight = async move {
            task.await
                .unwrap_or_else(|error| Err(RefreshError::Aborted(error.to_string())))
        }
        .boxed()
        .shared();
        (flight_id, flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::UserSummary, store::MemoryStore};
    use std::{sync::atomic::AtomicUsize, time::Duration};

    struct ScriptedRefresher {
        calls: Arc<AtomicUsize>,
        delay: Duration,
        result: Result<RefreshedTokens, RefreshError>,
        seen_credentials: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl ScriptedRefresher {
        fn succeeding(access: &str) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                delay: Duration::from_millis(50),
                result: Ok(RefreshedTokens {
                    access: access.to_string(),
                    refresh: None,
                }),
                seen_credentials: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn failing(error: RefreshError) -> Self {
            Self {
                result: Err(error),
                ..Self::succeeding("unused")
            }
        }
    }

    impl TokenRefresher for ScriptedRefresher {
        fn refresh(
            &self,
            refresh_credential: Option<String>,
        ) -> BoxFuture<'static, Result<RefreshedTokens, RefreshError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_credentials.lock().unwrap().push(refresh_credential);
            let delay = self.delay;
            let result = self.result.clone();
            async move {
                tokio::time::sleep(delay).await;
                result
            }
            .boxed()
        }
    }

    fn signed_in_session() -> SessionStore {
        let session = SessionStore::new(Arc::new(MemoryStore::new()));
        session
            .set_credentials(
                UserSummary {
                    id: "1".into(),
                    email: "u@example.com".into(),
                    display_name: None,
                },
                "old-access",
                Some("refresh-1"),
            )
            .unwrap();
        session
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let session = signed_in_session();
        let refresher = ScriptedRefresher::succeeding("new-access");
        let calls = refresher.calls.clone();
        let coordinator = RefreshCoordinator::new(session.clone(), Arc::new(refresher));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.refresh(Some("old-access")).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().as_deref(), Ok("new-access"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.refresh_count(), 1);
        assert!(!coordinator.is_refreshing());
        assert_eq!(session.current_access().as_deref(), Some("new-access"));
    }

    #[tokio::test]
    async fn refresh_uses_credential_held_at_launch() {
        let session = signed_in_session();
        let refresher = ScriptedRefresher::succeeding("new-access");
        let seen = refresher.seen_credentials.clone();
        let coordinator = RefreshCoordinator::new(session, Arc::new(refresher));

        coordinator.refresh(None).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Some("refresh-1".to_string())]);
    }

    #[tokio::test]
    async fn already_rotated_credential_skips_the_network() {
        let session = signed_in_session();
        let refresher = ScriptedRefresher::succeeding("unused");
        let calls = refresher.calls.clone();
        let coordinator = RefreshCoordinator::new(session, Arc::new(refresher));

        let current = coordinator.refresh(Some("older-than-old")).await.unwrap();
        assert_eq!(current, "old-access");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter_and_signs_out() {
        let session = signed_in_session();
        let refresher = ScriptedRefresher::failing(RefreshError::Rejected { status: 401 });
        let calls = refresher.calls.clone();
        let coordinator = RefreshCoordinator::new(session.clone(), Arc::new(refresher));

        let results = futures_util::future::join_all(
            (0..3).map(|_| coordinator.refresh(Some("old-access"))),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result, Err(RefreshError::Rejected { status: 401 }));
        }
        assert!(!session.is_authenticated());
        assert_eq!(
            coordinator.refresh(None).await,
            Err(RefreshError::SignedOut)
        );
    }

    #[tokio::test]
    async fn unavailable_server_does_not_sign_out() {
        let session = signed_in_session();
        let refresher = ScriptedRefresher::failing(RefreshError::Unavailable("HTTP 503".into()));
        let coordinator = RefreshCoordinator::new(session.clone(), Arc::new(refresher));

        assert!(matches!(
            coordinator.refresh(None).await,
            Err(RefreshError::Unavailable(_))
        ));
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn logout_during_flight_discards_result() {
        let session = signed_in_session();
        let coordinator = RefreshCoordinator::new(
            session.clone(),
            Arc::new(ScriptedRefresher::succeeding("late-access")),
        );

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.logout();

        assert_eq!(pending.await.unwrap(), Err(RefreshError::SessionEnded));
        assert!(!session.is_authenticated());
        assert_eq!(session.current_access(), None);
    }

    #[tokio::test]
    async fn sequential_refreshes_each_hit_the_network() {
        let session = signed_in_session();
        let refresher = ScriptedRefresher::succeeding("new-access");
        let calls = refresher.calls.clone();
        let coordinator = RefreshCoordinator::new(session, Arc::new(refresher));

        coordinator.refresh(None).await.unwrap();
        coordinator.refresh(Some("new-access")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
