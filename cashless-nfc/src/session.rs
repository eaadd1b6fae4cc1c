//! NFC session lifecycle.
//!
//! ```text
//!  unavailable    disabled
//!        ▲            ▲
//!        └─ initialize┴──▶ ready ──start_session──▶ scanning
//!                            ▲                         │
//!                            └──── stop / cleanup ◀────┴──▶ error
//! ```
//!
//! The radio is a single exclusive resource. A second `start_session` while
//! one is open fails fast with [`NfcError::SessionBusy`] instead of queueing.
//! Sessions are handed out as [`SessionGuard`]s; callers release them with
//! [`SessionGuard::release`] on every path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::NfcError;
use crate::feedback::{Feedback, NoFeedback};
use crate::listeners::{ListenerId, Listeners};
use crate::radio::{NfcRadio, NfcTechnology, TagInfo};

/// Prompt shown by platforms that display a scan sheet.
pub const DEFAULT_ALERT_MESSAGE: &str = "Hold the bracelet near the device";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No NFC hardware. Terminal until the device changes.
    Unavailable,
    /// Hardware present but switched off in system settings.
    Disabled,
    Ready,
    Scanning,
    /// Last request failed unexpectedly; the next start retries.
    Error,
}

struct Inner {
    radio: Arc<dyn NfcRadio>,
    feedback: Arc<dyn Feedback>,
    state: Mutex<SessionState>,
    discovery: Arc<Listeners<TagInfo>>,
    discovery_task: RwLock<Option<JoinHandle<()>>>,
}

/// Owner of the radio session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(radio: Arc<dyn NfcRadio>) -> Self {
        Self::with_feedback(radio, Arc::new(NoFeedback))
    }

    pub fn with_feedback(radio: Arc<dyn NfcRadio>, feedback: Arc<dyn Feedback>) -> Self {
        Self {
            inner: Arc::new(Inner {
                radio,
                feedback,
                state: Mutex::new(SessionState::Unavailable),
                discovery: Arc::new(Listeners::new("tag_discovery")),
                discovery_task: RwLock::new(None),
            }),
        }
    }

    /// Probe platform capability, start the radio and begin forwarding
    /// discovery events to registered listeners.
    pub async fn initialize(&self) -> SessionState {
        let state = self.probe().await;
        if state == SessionState::Ready {
            self.spawn_discovery_forwarder().await;
        }
        tracing::info!(state = ?state, "NFC session manager initialized");
        state
    }

    /// Re-run the capability probe after the user changed OS settings.
    pub async fn refresh_capability(&self) -> SessionState {
        let current = self.state().await;
        if matches!(current, SessionState::Unavailable | SessionState::Disabled) {
            return self.initialize().await;
        }
        current
    }

    pub async fn state(&self) -> SessionState {
        *self.inner.state.lock().await
    }

    pub fn on_tag_discovered<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TagInfo) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.discovery.add(listener)
    }

    pub fn remove_discovery_listener(&self, id: ListenerId) -> bool {
        self.inner.discovery.remove(id)
    }

    pub fn feedback(&self) -> &dyn Feedback {
        self.inner.feedback.as_ref()
    }

    /// Open a session and wait for a tag.
    ///
    /// Only valid from `ready` (or `error`, which is retried). On failure the
    /// radio request is cancelled before returning.
    pub async fn start_session(
        &self,
        technologies: &[NfcTechnology],
        alert_message: Option<&str>,
    ) -> Result<SessionGuard, NfcError> {
        {
            let mut state = self.inner.state.lock().await;
            match *state {
                SessionState::Unavailable => return Err(NfcError::NotSupported),
                SessionState::Disabled => return Err(NfcError::NotEnabled),
                SessionState::Scanning => return Err(NfcError::SessionBusy),
                SessionState::Ready | SessionState::Error => *state = SessionState::Scanning,
            }
        }

        let radio = &self.inner.radio;
        let alert = alert_message.unwrap_or(DEFAULT_ALERT_MESSAGE);
        if let Err(e) = radio.request_technology(technologies, Some(alert)).await {
            let err = NfcError::from(e);
            let next = match err {
                NfcError::UserCancelled | NfcError::Timeout | NfcError::TagNotFound => {
                    SessionState::Ready
                }
                NfcError::NotEnabled => SessionState::Disabled,
                _ => SessionState::Error,
            };
            self.teardown(next).await;
            self.inner.feedback.error();
            tracing::debug!(error = %err, "technology request failed");
            return Err(err);
        }

        match radio.get_tag().await {
            Ok(Some(tag)) => {
                tracing::debug!(tag_id = %tag.uid_hex(), "session opened");
                Ok(SessionGuard {
                    session: self.clone(),
                    tag,
                    released: false,
                })
            }
            Ok(None) => {
                self.teardown(SessionState::Ready).await;
                Err(NfcError::TagNotFound)
            }
            Err(e) => {
                self.teardown(SessionState::Error).await;
                Err(e.into())
            }
        }
    }

    /// Close any open session. Never fails and is safe to call repeatedly.
    pub async fn stop_session(&self) {
        let current = self.state().await;
        if current == SessionState::Scanning {
            self.teardown(SessionState::Ready).await;
        }
    }

    /// Like [`stop_session`](Self::stop_session) but also clears the error
    /// state.
    pub async fn cleanup(&self) {
        let current = self.state().await;
        if matches!(current, SessionState::Scanning | SessionState::Error) {
            self.teardown(SessionState::Ready).await;
        }
    }

    async fn teardown(&self, next: SessionState) {
        if let Err(e) = self.inner.radio.cancel_technology_request().await {
            tracing::warn!(error = %e, "cancelling technology request failed");
        }
        let mut state = self.inner.state.lock().await;
        if matches!(*state, SessionState::Scanning | SessionState::Error) {
            *state = next;
        }
    }

    async fn probe(&self) -> SessionState {
        let radio = &self.inner.radio;
        let next = match radio.is_supported().await {
            Ok(false) => SessionState::Unavailable,
            Err(e) => {
                tracing::warn!(error = %e, "NFC capability probe failed");
                SessionState::Unavailable
            }
            Ok(true) => match radio.is_enabled().await {
                Ok(Some(false)) => SessionState::Disabled,
                Ok(_) => match radio.start().await {
                    Ok(()) => SessionState::Ready,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to start NFC radio");
                        SessionState::Error
                    }
                },
                Err(e) => {
                    // Unknowable enabled state is treated as enabled.
                    tracing::debug!(error = %e, "NFC enabled state unknown");
                    match radio.start().await {
                        Ok(()) => SessionState::Ready,
                        Err(_) => SessionState::Error,
                    }
                }
            },
        };
        *self.inner.state.lock().await = next;
        next
    }

    async fn spawn_discovery_forwarder(&self) {
        let mut slot = self.inner.discovery_task.write().await;
        if let Some(old) = slot.take() {
            old.abort();
        }
        let mut events = self.inner.radio.discovery_events();
        let listeners = self.inner.discovery.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(tag) => {
                        listeners.notify(&tag);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "discovery listeners lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.discovery_task.try_write() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

/// An open radio session bound to the tag that answered it.
///
/// Release with [`SessionGuard::release`]. Dropping an unreleased guard
/// schedules the teardown on the current runtime as a fallback.
pub struct SessionGuard {
    session: SessionManager,
    tag: TagInfo,
    released: bool,
}

impl SessionGuard {
    pub fn tag(&self) -> &TagInfo {
        &self.tag
    }

    pub async fn read_ndef(&self) -> Result<Vec<u8>, NfcError> {
        self.session
            .inner
            .radio
            .read_ndef()
            .await
            .map_err(|e| NfcError::ReadFailed(e.to_string()))
    }

    pub async fn write_ndef(&self, message: &[u8]) -> Result<(), NfcError> {
        self.session
            .inner
            .radio
            .write_ndef(message)
            .await
            .map_err(|e| NfcError::WriteFailed(e.to_string()))
    }

    pub async fn release(mut self) {
        self.released = true;
        self.session.stop_session().await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(tag_id = %self.tag.uid_hex(), "session guard dropped without release");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let session = self.session.clone();
            handle.spawn(async move { session.stop_session().await });
        }
    }
}
