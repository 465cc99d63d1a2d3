use std::{path::PathBuf, sync::Arc};

use session_link::{
    ChannelEvent, ClientSettings, Error, FileStore, LoginOutcome, SessionClient, SettingsError,
};
use tokio::{signal::ctrl_c, sync::broadcast::error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const ENV_STATE_FILE: &str = "SESSION_LINK_STATE_FILE";
const ENV_EMAIL: &str = "SESSION_LINK_EMAIL";
const ENV_PASSWORD: &str = "SESSION_LINK_PASSWORD";
const ENV_CODE: &str = "SESSION_LINK_CODE";
const DEFAULT_STATE_FILE: &str = "session.json";

#[tokio::main]
async fn main() -> Result<(), Error> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = ClientSettings::from_env()?;
    let state_file = std::env::var(ENV_STATE_FILE)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATE_FILE));
    info!(path = %state_file.display(), "using session state file");

    let client = SessionClient::new(settings, Arc::new(FileStore::new(state_file)))?;
    if !client.restore()? {
        sign_in(&client).await?;
    }

    let mut events = client.subscribe();
    let mut auth = client.subscribe_auth();
    info!("watching notifications, press Ctrl+C to exit");

    loop {
        tokio::select! {
            signal = ctrl_c() => {
                if let Err(error) = signal {
                    warn!(%error, "failed to listen for Ctrl+C");
                }
                info!("received Ctrl+C, shutting down");
                break;
            }
            changed = auth.changed() => {
                if changed.is_err() || !*auth.borrow_and_update() {
                    warn!("session ended, sign in again to resume");
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event subscriber lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.channel().stop().await;
    let diagnostics = client.diagnostics();
    info!(
        connections = diagnostics.connections,
        suppressed = diagnostics.suppressed_duplicates,
        "notification watch finished"
    );
    Ok(())
}

async fn sign_in(client: &SessionClient) -> Result<(), Error> {
    let email = required_env(ENV_EMAIL)?;
    let password = required_env(ENV_PASSWORD)?;

    match client.login(&email, &password).await? {
        LoginOutcome::Authenticated(user) => {
            info!(user_id = %user.id, "signed in");
        }
        LoginOutcome::VerificationRequired { challenge_id } => {
            let code = required_env(ENV_CODE)?;
            if let LoginOutcome::Authenticated(user) =
                client.verify_login(&challenge_id, &code).await?
            {
                info!(user_id = %user.id, "signed in after verification");
            }
        }
    }
    Ok(())
}

fn required_env(key: &'static str) -> Result<String, SettingsError> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or(SettingsError::Missing(key))
}

fn log_event(event: &ChannelEvent) {
    match event {
        ChannelEvent::StateChanged(state) => info!(%state, "connection"),
        ChannelEvent::Notification(notification) => info!(
            id = %notification.id,
            kind = %notification.kind,
            priority = ?notification.priority,
            title = %notification.title,
            "notification"
        ),
        ChannelEvent::UnreadCount(count) => info!(count, "unread"),
        ChannelEvent::ServerError(message) => warn!(%message, "server error"),
    }
}
