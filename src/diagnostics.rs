use serde::Serialize;

use crate::{model::ConnectionState, stream::ChannelShared, util::unix_now_secs};

#[derive(Debug, Serialize, Clone)]
pub struct ChannelDiagnostics {
    pub connection_state: ConnectionState,
    pub running: bool,
    pub last_connected_at: Option<u64>,
    pub last_event_at: Option<u64>,
    pub stale_for_seconds: Option<u64>,
    pub last_error: Option<String>,
    pub backoff_ms: u64,
    pub reconnect_attempts: u64,
    pub connections: u64,
    pub resync_requests: u64,
    pub suppressed_duplicates: u64,
    pub unread_count: Option<u64>,
}

pub(crate) fn snapshot_channel(shared: &ChannelShared) -> ChannelDiagnostics {
    let suppressed_duplicates = shared.seen().suppressed();
    let connection_state = *shared.state_tx.borrow();
    let runtime = shared.runtime();

    let now = unix_now_secs();
    ChannelDiagnostics {
        connection_state,
        running: runtime.stop_tx.is_some(),
        last_connected_at: runtime.last_connected_at,
        last_event_at: runtime.last_event_at,
        stale_for_seconds: runtime.last_event_at.map(|last| now.saturating_sub(last)),
        last_error: runtime.last_error.clone(),
        backoff_ms: runtime.backoff_ms,
        reconnect_attempts: runtime.reconnect_attempts,
        connections: runtime.connections,
        resync_requests: runtime.resync_requests,
        suppressed_duplicates,
        unread_count: shared.unread.get(),
    }
}
