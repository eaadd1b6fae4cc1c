//! Bracelet image files.
//!
//! The terminal has no radio; the bracelet is a JSON file holding the tag
//! UID and its raw NDEF bytes, both hex encoded:
//!
//! ```json
//! { "uid": "04A22B91", "ndef": "d2..", "maxSize": 888 }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use cashless_nfc::{SimulatedTag, TagInfo};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagImage {
    pub uid: String,
    #[serde(default)]
    pub ndef: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
}

impl TagImage {
    pub fn blank(uid: &[u8], max_size: Option<usize>) -> Self {
        Self {
            uid: hex::encode_upper(uid),
            ndef: String::new(),
            max_size,
        }
    }

    pub fn from_tag(tag: &SimulatedTag) -> Self {
        Self {
            uid: tag.info.uid_hex(),
            ndef: hex::encode(&tag.ndef),
            max_size: tag.info.max_size,
        }
    }

    pub fn to_tag(&self) -> Result<SimulatedTag> {
        let uid = hex::decode(&self.uid).with_context(|| format!("bad uid {:?}", self.uid))?;
        let ndef = hex::decode(&self.ndef).context("bad ndef hex")?;
        let mut info = TagInfo::new(uid);
        if let Some(max_size) = self.max_size {
            info = info.with_max_size(max_size);
        }
        Ok(SimulatedTag { info, ndef })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read bracelet image {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse bracelet image {}", path.display()))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("failed to write bracelet image {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_image_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bracelets").join("b1.json");

        let tag = SimulatedTag::with_ndef(vec![0x04, 0xA2], vec![0xD2, 0x01, 0x00]);
        TagImage::from_tag(&tag).save(&path).await.unwrap();

        let loaded = TagImage::load(&path).await.unwrap();
        assert_eq!(loaded.uid, "04A2");
        assert_eq!(loaded.to_tag().unwrap(), tag);
    }

    #[test]
    fn test_rejects_bad_hex() {
        let image = TagImage {
            uid: "zz".into(),
            ndef: String::new(),
            max_size: None,
        };
        assert!(image.to_tag().is_err());
    }

    #[test]
    fn test_blank_keeps_capacity() {
        let tag = TagImage::blank(&[0x01], Some(144)).to_tag().unwrap();
        assert!(tag.ndef.is_empty());
        assert_eq!(tag.info.max_size, Some(144));
    }
}
