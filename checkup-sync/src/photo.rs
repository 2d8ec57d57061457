//! IT registration photo attachment
//!
//! The photo travels base64-encoded inside the IT slice. Because it is large,
//! photo changes are split out of IT patches and broadcast on their own
//! channel events.

use crate::error::{SyncError, SyncResult};
use crate::record::SlicePatch;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PHOTO: &str = "photo";
pub const PHOTO_FILE_NAME: &str = "photoFileName";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoAttachment {
    /// Base64 image payload
    pub photo: String,
    #[serde(rename = "photoFileName")]
    pub photo_file_name: String,
}

impl PhotoAttachment {
    pub fn from_bytes(bytes: &[u8], file_name: impl Into<String>) -> Self {
        Self {
            photo: STANDARD.encode(bytes),
            photo_file_name: file_name.into(),
        }
    }

    /// Raw image bytes; a `data:<mime>;base64,` prefix is tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Serialization`] when the payload is not valid base64.
    pub fn decode(&self) -> SyncResult<Vec<u8>> {
        let payload = match self.photo.split_once(',') {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => self.photo.as_str(),
        };
        STANDARD
            .decode(payload)
            .map_err(|e| SyncError::Serialization(format!("Invalid photo encoding: {e}")))
    }

    pub fn to_patch(&self) -> SlicePatch {
        SlicePatch::new()
            .set(PHOTO, self.photo.clone())
            .set(PHOTO_FILE_NAME, self.photo_file_name.clone())
    }
}

/// Photo portion extracted from an IT patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhotoChange {
    Set(PhotoAttachment),
    Clear,
}

impl PhotoChange {
    pub fn to_patch(&self) -> SlicePatch {
        match self {
            PhotoChange::Set(attachment) => attachment.to_patch(),
            PhotoChange::Clear => SlicePatch::new().clear(PHOTO).clear(PHOTO_FILE_NAME),
        }
    }
}

/// Remove the photo fields from `patch` and return them as one change.
///
/// # Errors
///
/// `photo` and `photoFileName` must be set or cleared together; anything
/// else is [`SyncError::InvalidPatch`].
pub fn split_photo(patch: &mut SlicePatch) -> SyncResult<Option<PhotoChange>> {
    let photo = patch.get(PHOTO).cloned();
    let file_name = patch.get(PHOTO_FILE_NAME).cloned();

    let change = match (photo, file_name) {
        (None, None) => return Ok(None),
        (Some(Some(Value::String(photo))), Some(Some(Value::String(photo_file_name)))) => {
            PhotoChange::Set(PhotoAttachment {
                photo,
                photo_file_name,
            })
        }
        (Some(None) | None, Some(None)) | (Some(None), None) => PhotoChange::Clear,
        (Some(Some(_)), _) => {
            return Err(SyncError::InvalidPatch(
                "photo must be set together with a string photoFileName".to_string(),
            ))
        }
        (_, Some(Some(_))) => {
            return Err(SyncError::InvalidPatch(
                "photoFileName cannot change without the photo".to_string(),
            ))
        }
    };

    patch.remove(PHOTO);
    patch.remove(PHOTO_FILE_NAME);
    Ok(Some(change))
}
