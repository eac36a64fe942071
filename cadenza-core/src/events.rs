//! Session status events broadcast to observers (UI, CLI, tests).
//!
//! Every lifecycle transition and every locally detected connection loss is
//! published on the controller's broadcast channel; see
//! [`SessionController::subscribe_status`](crate::SessionController::subscribe_status).

use serde::{Deserialize, Serialize};

/// Emitted whenever the session state changes or the connection is lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub state: SessionState,
    /// Whether the transport was still considered alive when the event fired.
    pub connected: bool,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Lifecycle state of a generation session.
///
/// ```text
/// Disconnected ─► Connecting ─► Connected ─► Playing ⇄ Stopped ─► Closing ─► Disconnected
///                      │
///                      └────────► Failed ───────────────────────► Closing ─► Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No background context, no remote stream.
    Disconnected,
    /// `connect()` in flight.
    Connecting,
    /// Remote stream open, not yet playing.
    Connected,
    /// Remote generation running.
    Playing,
    /// Remote generation paused by `stop()`.
    Stopped,
    /// `close()` in flight.
    Closing,
    /// `connect()` failed. Only `close()` leaves this state.
    Failed,
}

impl SessionState {
    /// States in which a remote stream is open.
    pub fn has_stream(self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Playing | SessionState::Stopped
        )
    }
}
