//! In-process radio with a single virtual tag slot.
//!
//! Used by the terminal binary (backed by a tag image file) and by tests,
//! which can script capability answers and inject one-shot failures.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use crate::error::RadioError;
use crate::radio::{NfcRadio, NfcTechnology, TagInfo};

/// A tag as the simulated radio sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedTag {
    pub info: TagInfo,
    pub ndef: Vec<u8>,
}

impl SimulatedTag {
    pub fn blank(id: impl Into<Vec<u8>>) -> Self {
        Self {
            info: TagInfo::new(id),
            ndef: Vec::new(),
        }
    }

    pub fn with_ndef(id: impl Into<Vec<u8>>, ndef: Vec<u8>) -> Self {
        Self {
            info: TagInfo::new(id),
            ndef,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    supported: bool,
    enabled: Option<bool>,
    field: Option<SimulatedTag>,
    /// Tags swapped into the field on successive technology requests.
    arrivals: VecDeque<SimulatedTag>,
    request_active: bool,
    fail_next_request: Option<RadioError>,
    fail_next_read: Option<RadioError>,
    fail_next_write: Option<RadioError>,
    fail_cancel: Option<RadioError>,
    requests: usize,
    reads: usize,
    writes: usize,
    cancels: usize,
}

/// Scriptable [`NfcRadio`] implementation.
pub struct SimulatedRadio {
    state: Mutex<SimState>,
    discovered: broadcast::Sender<TagInfo>,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    /// A supported, enabled radio with an empty field.
    pub fn new() -> Self {
        let (discovered, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(SimState {
                supported: true,
                enabled: Some(true),
                ..Default::default()
            }),
            discovered,
        }
    }

    pub fn with_tag(tag: SimulatedTag) -> Self {
        let mut radio = Self::new();
        radio.state.get_mut().field = Some(tag);
        radio
    }

    pub async fn set_supported(&self, supported: bool) {
        self.state.lock().await.supported = supported;
    }

    pub async fn set_enabled(&self, enabled: Option<bool>) {
        self.state.lock().await.enabled = enabled;
    }

    /// Put a tag in the field and announce it to discovery subscribers.
    pub async fn present(&self, tag: SimulatedTag) {
        let info = tag.info.clone();
        self.state.lock().await.field = Some(tag);
        let _ = self.discovered.send(info);
    }

    /// Queue a tag that replaces the one in the field at the next request.
    pub async fn queue_arrival(&self, tag: SimulatedTag) {
        self.state.lock().await.arrivals.push_back(tag);
    }

    pub async fn remove(&self) -> Option<SimulatedTag> {
        self.state.lock().await.field.take()
    }

    pub async fn current(&self) -> Option<SimulatedTag> {
        self.state.lock().await.field.clone()
    }

    pub async fn fail_next_request(&self, err: RadioError) {
        self.state.lock().await.fail_next_request = Some(err);
    }

    pub async fn fail_next_read(&self, err: RadioError) {
        self.state.lock().await.fail_next_read = Some(err);
    }

    pub async fn fail_next_write(&self, err: RadioError) {
        self.state.lock().await.fail_next_write = Some(err);
    }

    pub async fn fail_cancel(&self, err: RadioError) {
        self.state.lock().await.fail_cancel = Some(err);
    }

    pub async fn request_count(&self) -> usize {
        self.state.lock().await.requests
    }

    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn read_count(&self) -> usize {
        self.state.lock().await.reads
    }

    pub async fn cancel_count(&self) -> usize {
        self.state.lock().await.cancels
    }

    /// True while a technology request is open and not yet cancelled.
    pub async fn request_active(&self) -> bool {
        self.state.lock().await.request_active
    }
}

#[async_trait]
impl NfcRadio for SimulatedRadio {
    async fn is_supported(&self) -> Result<bool, RadioError> {
        Ok(self.state.lock().await.supported)
    }

    async fn is_enabled(&self) -> Result<Option<bool>, RadioError> {
        Ok(self.state.lock().await.enabled)
    }

    async fn start(&self) -> Result<(), RadioError> {
        let state = self.state.lock().await;
        if !state.supported {
            return Err(RadioError::NotSupported);
        }
        Ok(())
    }

    async fn request_technology(
        &self,
        technologies: &[NfcTechnology],
        _alert_message: Option<&str>,
    ) -> Result<(), RadioError> {
        let mut state = self.state.lock().await;
        state.requests += 1;
        if let Some(err) = state.fail_next_request.take() {
            return Err(err);
        }
        if state.enabled == Some(false) {
            return Err(RadioError::NotEnabled);
        }
        if let Some(next) = state.arrivals.pop_front() {
            state.field = Some(next);
        }
        let Some(tag) = state.field.as_ref() else {
            return Err(RadioError::Timeout);
        };
        if !technologies.is_empty()
            && !technologies.iter().any(|t| tag.info.tech_types.contains(t))
        {
            return Err(RadioError::Timeout);
        }
        let info = tag.info.clone();
        state.request_active = true;
        drop(state);
        let _ = self.discovered.send(info);
        Ok(())
    }

    async fn get_tag(&self) -> Result<Option<TagInfo>, RadioError> {
        let state = self.state.lock().await;
        if !state.request_active {
            return Ok(None);
        }
        Ok(state.field.as_ref().map(|t| t.info.clone()))
    }

    async fn cancel_technology_request(&self) -> Result<(), RadioError> {
        let mut state = self.state.lock().await;
        state.cancels += 1;
        state.request_active = false;
        match state.fail_cancel.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn read_ndef(&self) -> Result<Vec<u8>, RadioError> {
        let mut state = self.state.lock().await;
        state.reads += 1;
        if let Some(err) = state.fail_next_read.take() {
            return Err(err);
        }
        if !state.request_active {
            return Err(RadioError::Other("no technology request in progress".into()));
        }
        state
            .field
            .as_ref()
            .map(|t| t.ndef.clone())
            .ok_or(RadioError::TagLost)
    }

    async fn write_ndef(&self, message: &[u8]) -> Result<(), RadioError> {
        let mut state = self.state.lock().await;
        state.writes += 1;
        if let Some(err) = state.fail_next_write.take() {
            return Err(err);
        }
        if !state.request_active {
            return Err(RadioError::Other("no technology request in progress".into()));
        }
        let tag = state.field.as_mut().ok_or(RadioError::TagLost)?;
        if let Some(max) = tag.info.max_size {
            if message.len() > max {
                return Err(RadioError::Io(format!(
                    "message of {} bytes exceeds {} byte capacity",
                    message.len(),
                    max
                )));
            }
        }
        tag.ndef = message.to_vec();
        Ok(())
    }

    fn discovery_events(&self) -> broadcast::Receiver<TagInfo> {
        self.discovered.subscribe()
    }
}
