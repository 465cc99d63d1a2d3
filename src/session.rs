use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;

use crate::{
    consts::{STORE_KEY_ACCESS, STORE_KEY_USER},
    error::{SessionError, StoreError},
    model::UserSummary,
    store::CredentialStore,
};

#[derive(Default)]
struct SessionState {
    access: Option<String>,
    refresh: Option<String>,
    user: Option<UserSummary>,
    authenticated: bool,
    /// Bumped on every login and logout. Work that started under an older
    /// generation must not write its result back.
    generation: u64,
}

struct SessionShared {
    state: RwLock<SessionState>,
    store: Arc<dyn CredentialStore>,
    auth_tx: watch::Sender<bool>,
}

/// Single source of truth for the signed-in credentials.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionShared>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let (auth_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SessionShared {
                state: RwLock::new(SessionState::default()),
                store,
                auth_tx,
            }),
        }
    }

    /// Loads a persisted session. Returns whether it is authenticated afterwards.
    pub fn restore(&self) -> Result<bool, StoreError> {
        let access = self
            .inner
            .store
            .get(STORE_KEY_ACCESS)?
            .filter(|value| !value.trim().is_empty());
        let Some(access) = access else {
            tracing::debug!("no persisted session");
            return Ok(self.is_authenticated());
        };
        let user = match self.inner.store.get(STORE_KEY_USER)? {
            Some(raw) => match serde_json::from_str::<UserSummary>(&raw) {
                Ok(user) => Some(user),
                Err(error) => {
                    tracing::warn!(%error, "persisted user summary unreadable");
                    None
                }
            },
            None => None,
        };

        {
            let mut state = self.write();
            state.access = Some(access);
            state.refresh = None;
            state.user = user;
            state.authenticated = true;
            state.generation = state.generation.wrapping_add(1);
        }
        self.inner.auth_tx.send_replace(true);
        tracing::info!("session restored from credential store");
        Ok(true)
    }

    pub fn set_credentials(
        &self,
        user: UserSummary,
        access: &str,
        refresh: Option<&str>,
    ) -> Result<(), SessionError> {
        let access = access.trim();
        if access.is_empty() {
            return Err(SessionError::EmptyAccess);
        }
        let user_json = serde_json::to_string(&user).ok();
        {
            let mut state = self.write();
            state.access = Some(access.to_string());
            state.refresh = refresh
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string);
            state.user = Some(user);
            state.authenticated = true;
            state.generation = state.generation.wrapping_add(1);
        }
        self.persist(STORE_KEY_ACCESS, access);
        if let Some(user_json) = user_json {
            self.persist(STORE_KEY_USER, &user_json);
        }
        self.inner.auth_tx.send_replace(true);
        tracing::info!("session established");
        Ok(())
    }

    /// Replaces the access credential of the live session. Does nothing once
    /// logged out.
    pub fn update_access(&self, access: &str, refresh: Option<&str>) -> bool {
        let generation = self.generation();
        self.apply_refresh(generation, access, refresh)
    }

    pub(crate) fn apply_refresh(
        &self,
        generation: u64,
        access: &str,
        refresh: Option<&str>,
    ) -> bool {
        let access = access.trim();
        if access.is_empty() {
            return false;
        }
        {
            let mut state = self.write();
            if !state.authenticated || state.generation != generation {
                return false;
            }
            state.access = Some(access.to_string());
            if let Some(rotated) = refresh.map(str::trim).filter(|value| !value.is_empty()) {
                state.refresh = Some(rotated.to_string());
            }
        }
        self.persist(STORE_KEY_ACCESS, access);
        true
    }

    /// Idempotent. The in-memory session is invalidated before anyone
    /// watching the auth flag is told about it.
    pub fn logout(&self) {
        let was_signed_in = {
            let mut state = self.write();
            let was_signed_in = state.authenticated || state.access.is_some();
            state.access = None;
            state.refresh = None;
            state.user = None;
            state.authenticated = false;
            if was_signed_in {
                state.generation = state.generation.wrapping_add(1);
            }
            was_signed_in
        };
        self.inner.auth_tx.send_replace(false);
        if !was_signed_in {
            return;
        }
        if let Err(error) = self.inner.store.clear() {
            tracing::warn!(%error, "failed to clear credential store on logout");
        }
        tracing::info!("session logged out");
    }

    pub fn current_access(&self) -> Option<String> {
        let state = self.read();
        if state.authenticated {
            state.access.clone()
        } else {
            None
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().authenticated
    }

    pub fn user(&self) -> Option<UserSummary> {
        self.read().user.clone()
    }

    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// Whether the sign-in identified by `generation` is still the live one.
    pub fn is_current(&self, generation: u64) -> bool {
        let state = self.read();
        state.authenticated && state.generation == generation
    }

    /// The access credential, only while `generation` is still signed in.
    pub(crate) fn access_for(&self, generation: u64) -> Option<String> {
        let state = self.read();
        if state.authenticated && state.generation == generation {
            state.access.clone()
        } else {
            None
        }
    }

    /// Watch the authenticated flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.auth_tx.subscribe()
    }

    pub(crate) fn refresh_credential(&self) -> Option<String> {
        self.read().refresh.clone()
    }

    fn persist(&self, key: &str, value: &str) {
        if let Err(error) = self.inner.store.set(key, value) {
            tracing::warn!(key, %error, "failed to persist session value");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
