//! Turn a physical tap into a verified, decoded tag record.

use std::sync::Arc;
use std::time::Duration;

use cashless_codec::{
    CashlessAccount, DecodeError, ErrorCode, LogicalTagRecord, TagCodec, TagPayload, TagType,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::NfcError;
use crate::radio::{NfcTechnology, TagInfo};
use crate::session::SessionManager;

/// Delay between attempts in continuous-scan mode.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadOptions {
    pub validate_signature: bool,
    pub decrypt_data: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            validate_signature: true,
            decrypt_data: true,
        }
    }
}

/// Outcome of a single tap.
///
/// `success` with `data == None` means the tag is blank or carries nothing of
/// ours. On an integrity failure `raw_payload` is still filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub success: bool,
    pub data: Option<LogicalTagRecord>,
    pub raw_payload: Option<TagPayload>,
    pub tag: Option<TagInfo>,
    pub error: Option<NfcError>,
}

impl ReadResult {
    fn ok(tag: TagInfo, raw_payload: Option<TagPayload>, data: Option<LogicalTagRecord>) -> Self {
        Self {
            success: true,
            data,
            raw_payload,
            tag: Some(tag),
            error: None,
        }
    }

    fn failed(error: NfcError, tag: Option<TagInfo>, raw_payload: Option<TagPayload>) -> Self {
        Self {
            success: false,
            data: None,
            raw_payload,
            tag,
            error: Some(error),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(NfcError::code)
    }
}

/// Outcome of [`TagReader::read_cashless_bracelet`].
#[derive(Debug, Clone, PartialEq)]
pub struct BraceletRead {
    pub success: bool,
    /// Hex UID of the bracelet.
    pub bracelet_id: Option<String>,
    pub cashless_data: Option<CashlessAccount>,
    /// Full decoded record, kept so a writer can merge into it.
    pub record: Option<LogicalTagRecord>,
    pub tag: Option<TagInfo>,
    pub error: Option<NfcError>,
}

impl BraceletRead {
    fn failed(error: NfcError, tag: Option<TagInfo>) -> Self {
        Self {
            success: false,
            bracelet_id: tag.as_ref().map(TagInfo::uid_hex),
            cashless_data: None,
            record: None,
            tag,
            error: Some(error),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(NfcError::code)
    }
}

#[derive(Clone)]
pub struct TagReader {
    session: SessionManager,
    codec: Arc<TagCodec>,
}

impl TagReader {
    pub fn new(session: SessionManager, codec: Arc<TagCodec>) -> Self {
        Self { session, codec }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Open a session, read the NDEF message and interpret it.
    ///
    /// The session is released before interpretation, on every path.
    pub async fn read_tag(&self, options: ReadOptions) -> ReadResult {
        let guard = match self
            .session
            .start_session(&[NfcTechnology::Ndef], None)
            .await
        {
            Ok(guard) => guard,
            Err(e) => return ReadResult::failed(e, None, None),
        };
        let tag = guard.tag().clone();
        let bytes = guard.read_ndef().await;
        guard.release().await;

        let result = match bytes {
            Ok(bytes) => interpret(&self.codec, &bytes, tag, options),
            Err(e) => ReadResult::failed(e, Some(tag), None),
        };
        if result.success {
            self.session.feedback().success();
        } else {
            self.session.feedback().error();
        }
        result
    }

    /// Read a tap and require it to be a cashless bracelet.
    pub async fn read_cashless_bracelet(&self, options: ReadOptions) -> BraceletRead {
        let read = self.read_tag(options).await;
        if !read.success {
            let error = read
                .error
                .unwrap_or_else(|| NfcError::Unknown("read failed without an error".into()));
            return BraceletRead::failed(error, read.tag);
        }
        let Some(tag) = read.tag else {
            return BraceletRead::failed(NfcError::TagNotFound, None);
        };
        let Some(record) = read.data else {
            return BraceletRead::failed(
                NfcError::InvalidTag("tag carries no cashless data".into()),
                Some(tag),
            );
        };
        if record.tag_type != TagType::Cashless {
            return BraceletRead::failed(
                NfcError::InvalidTag(format!("expected a cashless tag, found {}", record.tag_type)),
                Some(tag),
            );
        }

        BraceletRead {
            success: true,
            bracelet_id: Some(tag.uid_hex()),
            cashless_data: record.cashless_account().cloned(),
            record: Some(record),
            tag: Some(tag),
            error: None,
        }
    }

    /// Poll for tags until cancelled, handing every successful read with data
    /// to `on_read`. Failures are logged and retried.
    pub fn start_continuous_scan<F>(
        &self,
        options: ReadOptions,
        interval: Duration,
        on_read: F,
    ) -> ScanHandle
    where
        F: Fn(ReadResult) + Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        let reader = self.clone();
        let stop = token.clone();

        let task = tokio::spawn(async move {
            tracing::info!("continuous scan started");
            let mut attempts: u64 = 0;
            while !stop.is_cancelled() {
                attempts += 1;
                let result = reader.read_tag(options).await;
                if result.success && result.data.is_some() {
                    on_read(result);
                } else if let Some(err) = &result.error {
                    if err.is_transient() {
                        tracing::debug!(attempt = attempts, error = %err, "scan attempt found nothing");
                    } else {
                        tracing::warn!(attempt = attempts, error = %err, "scan attempt failed");
                    }
                }

                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!(attempts, "continuous scan stopped");
        });

        ScanHandle { token, task }
    }
}

/// Map raw NDEF bytes to a read result.
fn interpret(codec: &TagCodec, bytes: &[u8], tag: TagInfo, options: ReadOptions) -> ReadResult {
    let payload = match codec.payload_from_ndef(bytes) {
        Ok(Some(payload)) => payload,
        Ok(None) => return ReadResult::ok(tag, None, None),
        Err(DecodeError::Ndef(reason)) => {
            tracing::debug!(tag_id = %tag.uid_hex(), reason = %reason, "tag holds no NDEF message we understand");
            return ReadResult::ok(tag, None, None);
        }
        Err(e) => {
            return ReadResult::failed(NfcError::InvalidTag(e.to_string()), Some(tag), None);
        }
    };

    if options.validate_signature && !codec.verify_signature(&payload) {
        tracing::warn!(tag_id = %tag.uid_hex(), tag_type = %payload.tag_type, "tag signature rejected");
        return ReadResult::failed(NfcError::AuthenticationFailed, Some(tag), Some(payload));
    }

    match codec.decode(&payload, options.decrypt_data) {
        Ok(record) => ReadResult::ok(tag, Some(payload), Some(record)),
        Err(e) => ReadResult::failed(NfcError::InvalidTag(e.to_string()), Some(tag), Some(payload)),
    }
}

/// Running continuous scan. Dropping the handle does not stop the scan.
pub struct ScanHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ScanHandle {
    /// Stop at the next delay boundary. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and wait for the loop to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "continuous scan task ended abnormally");
        }
    }
}
