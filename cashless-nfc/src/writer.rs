//! Persist tag records onto the physical tag.

use std::sync::Arc;

use cashless_codec::{
    is_blank, ErrorCode, LogicalTagRecord, MinorUnits, TagCodec, TagPayload, TagType,
};
use serde::{Deserialize, Serialize};

use crate::error::NfcError;
use crate::radio::{NfcTechnology, TagInfo};
use crate::reader::{ReadOptions, TagReader};
use crate::session::{SessionGuard, SessionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOptions {
    /// Replace a tag that already carries an NDEF message.
    pub overwrite: bool,
    pub encrypt_data: bool,
    pub sign_data: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            encrypt_data: true,
            sign_data: true,
        }
    }
}

/// Festival-wide tag security settings applied to read-modify-write flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagPolicy {
    pub encrypt_data: bool,
    pub sign_data: bool,
    pub validate_signatures: bool,
}

impl Default for TagPolicy {
    fn default() -> Self {
        Self {
            encrypt_data: true,
            sign_data: true,
            validate_signatures: true,
        }
    }
}

impl TagPolicy {
    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            validate_signature: self.validate_signatures,
            decrypt_data: self.encrypt_data,
        }
    }

    pub fn write_options(&self, overwrite: bool) -> WriteOptions {
        WriteOptions {
            overwrite,
            encrypt_data: self.encrypt_data,
            sign_data: self.sign_data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub success: bool,
    /// The payload that was written.
    pub payload: Option<TagPayload>,
    pub bytes_written: usize,
    pub tag: Option<TagInfo>,
    pub error: Option<NfcError>,
}

impl WriteResult {
    fn failed(error: NfcError, tag: Option<TagInfo>) -> Self {
        Self {
            success: false,
            payload: None,
            bytes_written: 0,
            tag,
            error: Some(error),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(NfcError::code)
    }
}

#[derive(Clone)]
pub struct TagWriter {
    session: SessionManager,
    codec: Arc<TagCodec>,
    reader: TagReader,
    policy: TagPolicy,
}

impl TagWriter {
    pub fn new(session: SessionManager, codec: Arc<TagCodec>) -> Self {
        let reader = TagReader::new(session.clone(), codec.clone());
        Self {
            session,
            codec,
            reader,
            policy: TagPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: TagPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> TagPolicy {
        self.policy
    }

    /// Encode, optionally sign, and write `record`.
    ///
    /// Without `overwrite` a tag that already holds any NDEF content is left
    /// untouched and the call fails with `WRITE_ERROR`.
    pub async fn write_tag(&self, record: &LogicalTagRecord, options: WriteOptions) -> WriteResult {
        self.write_record(record, options, None).await
    }

    /// Read the current record, transform it, and write the result back in
    /// a second session.
    ///
    /// Not atomic: the radio session is closed between the two phases. A
    /// different tag presented for the write phase is rejected, but a write
    /// by another device to the same tag in between goes undetected and the
    /// last writer wins.
    pub async fn read_then_write<F>(&self, transform: F) -> WriteResult
    where
        F: FnOnce(LogicalTagRecord) -> Result<LogicalTagRecord, NfcError>,
    {
        self.read_then_write_on(None, transform).await
    }

    async fn read_then_write_on<F>(&self, expected_bracelet: Option<&str>, transform: F) -> WriteResult
    where
        F: FnOnce(LogicalTagRecord) -> Result<LogicalTagRecord, NfcError>,
    {
        let read = self.reader.read_tag(self.policy.read_options()).await;
        if !read.success {
            let error = match read.error {
                Some(NfcError::ReadFailed(reason)) => {
                    NfcError::InvalidTag(format!("tag unreadable: {reason}"))
                }
                Some(other) => other,
                None => NfcError::Unknown("read failed without an error".into()),
            };
            return WriteResult::failed(error, read.tag);
        }
        let Some(tag) = read.tag else {
            return WriteResult::failed(NfcError::TagNotFound, None);
        };
        if let Some(expected) = expected_bracelet {
            if !tag.uid_hex().eq_ignore_ascii_case(expected) {
                return WriteResult::failed(
                    NfcError::InvalidTag(format!(
                        "expected bracelet {expected}, found {}",
                        tag.uid_hex()
                    )),
                    Some(tag),
                );
            }
        }
        let Some(record) = read.data else {
            return WriteResult::failed(NfcError::InvalidTag("tag is blank".into()), Some(tag));
        };

        let updated = match transform(record) {
            Ok(updated) => updated,
            Err(e) => return WriteResult::failed(e, Some(tag)),
        };

        self.write_record(&updated, self.policy.write_options(true), Some(&tag.id))
            .await
    }

    /// Merge a new balance and last transaction id into the cashless record
    /// on the tag.
    pub async fn update_bracelet_balance(
        &self,
        new_balance: MinorUnits,
        last_transaction_id: &str,
    ) -> WriteResult {
        self.update_balance_on(None, new_balance, last_transaction_id)
            .await
    }

    /// Like [`update_bracelet_balance`](Self::update_bracelet_balance) but
    /// refuses to touch any tag other than `bracelet_id`.
    pub async fn update_bracelet_balance_checked(
        &self,
        bracelet_id: &str,
        new_balance: MinorUnits,
        last_transaction_id: &str,
    ) -> WriteResult {
        self.update_balance_on(Some(bracelet_id), new_balance, last_transaction_id)
            .await
    }

    async fn update_balance_on(
        &self,
        expected_bracelet: Option<&str>,
        new_balance: MinorUnits,
        last_transaction_id: &str,
    ) -> WriteResult {
        let transaction_id = last_transaction_id.to_string();
        let result = self
            .read_then_write_on(expected_bracelet, move |mut record| {
                if record.tag_type != TagType::Cashless {
                    return Err(NfcError::InvalidTag(format!(
                        "expected a cashless tag, found {}",
                        record.tag_type
                    )));
                }
                let account = record
                    .cashless
                    .as_mut()
                    .ok_or_else(|| NfcError::InvalidTag("cashless tag has no account".into()))?;
                account.balance = new_balance;
                account.last_transaction_id = Some(transaction_id);
                record.timestamp_ms = crate::now_ms();
                Ok(record)
            })
            .await;

        if result.success {
            tracing::info!(balance = new_balance, transaction_id = %last_transaction_id, "bracelet balance updated");
        }
        result
    }

    async fn write_record(
        &self,
        record: &LogicalTagRecord,
        options: WriteOptions,
        expected_uid: Option<&[u8]>,
    ) -> WriteResult {
        let (payload, bytes) =
            match self
                .codec
                .to_ndef(record, options.encrypt_data, options.sign_data)
            {
                Ok(encoded) => encoded,
                Err(e) => {
                    return WriteResult::failed(
                        NfcError::WriteFailed(format!("could not encode record: {e}")),
                        None,
                    )
                }
            };

        let guard = match self
            .session
            .start_session(&[NfcTechnology::Ndef], None)
            .await
        {
            Ok(guard) => guard,
            Err(e) => return WriteResult::failed(e, None),
        };
        let tag = guard.tag().clone();
        let outcome = write_checked(&guard, &bytes, options, expected_uid).await;
        guard.release().await;

        match outcome {
            Ok(()) => {
                self.session.feedback().success();
                tracing::debug!(tag_id = %tag.uid_hex(), bytes = bytes.len(), tag_type = %record.tag_type, "tag written");
                WriteResult {
                    success: true,
                    payload: Some(payload),
                    bytes_written: bytes.len(),
                    tag: Some(tag),
                    error: None,
                }
            }
            Err(e) => {
                self.session.feedback().error();
                tracing::warn!(tag_id = %tag.uid_hex(), error = %e, "tag write refused or failed");
                WriteResult::failed(e, Some(tag))
            }
        }
    }
}

async fn write_checked(
    guard: &SessionGuard,
    bytes: &[u8],
    options: WriteOptions,
    expected_uid: Option<&[u8]>,
) -> Result<(), NfcError> {
    if let Some(uid) = expected_uid {
        if guard.tag().id != uid {
            return Err(NfcError::InvalidTag(
                "a different tag was presented between read and write".into(),
            ));
        }
    }

    if !options.overwrite {
        let existing = guard
            .read_ndef()
            .await
            .map_err(|e| NfcError::WriteFailed(format!("could not inspect tag contents: {e}")))?;
        if !is_blank(&existing) {
            return Err(NfcError::WriteFailed(
                "tag already contains data and overwrite is not set".into(),
            ));
        }
    }

    if let Some(capacity) = guard.tag().max_size {
        if bytes.len() > capacity {
            return Err(NfcError::WriteFailed(format!(
                "encoded record is {} bytes but the tag holds {}",
                bytes.len(),
                capacity
            )));
        }
    }

    guard.write_ndef(bytes).await
}
