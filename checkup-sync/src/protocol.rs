//! Realtime channel wire protocol
//!
//! Every frame on the channel is one JSON text message of the form
//! `{"event": "<name>", "data": <payload>}`. Event names and payload shapes
//! are shared with every other station and must not change:
//!
//! | event              | data                                         |
//! |--------------------|----------------------------------------------|
//! | `newPatientId`     | `"P100"` (or `{"patientId": "P100"}`)        |
//! | `departmentUpdate` | `{"ent": {"field": "value"}, "vision": null}` |
//! | `photoUpdate`      | `{"photo": "...", "photoFileName": "..."}`   |
//! | `photoDelete`      | none                                         |
//! | `resetPatientData` | none                                         |
//!
//! Inside a `departmentUpdate`, `null` for a department clears that slice and
//! `null` for a field clears that field.

use crate::error::{SyncError, SyncResult};
use crate::photo::PhotoAttachment;
use crate::record::{Department, SlicePatch};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Partial record patch keyed by department; `None` clears the slice
pub type DepartmentPatchSet = BTreeMap<Department, Option<SlicePatch>>;

pub const EVENT_NEW_PATIENT_ID: &str = "newPatientId";
pub const EVENT_DEPARTMENT_UPDATE: &str = "departmentUpdate";
pub const EVENT_PHOTO_UPDATE: &str = "photoUpdate";
pub const EVENT_PHOTO_DELETE: &str = "photoDelete";
pub const EVENT_RESET_PATIENT_DATA: &str = "resetPatientData";

/// Messages exchanged between stations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ChannelMessage {
    #[serde(rename = "newPatientId")]
    NewPatientId(#[serde(deserialize_with = "patient_id_payload")] String),

    #[serde(rename = "departmentUpdate")]
    DepartmentUpdate(DepartmentPatchSet),

    #[serde(rename = "photoUpdate")]
    PhotoUpdate(PhotoAttachment),

    #[serde(rename = "photoDelete")]
    PhotoDelete,

    #[serde(rename = "resetPatientData")]
    ResetPatientData,
}

impl ChannelMessage {
    /// Single-department update
    pub fn department(department: Department, patch: Option<SlicePatch>) -> Self {
        ChannelMessage::DepartmentUpdate(BTreeMap::from([(department, patch)]))
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ChannelMessage::NewPatientId(_) => EVENT_NEW_PATIENT_ID,
            ChannelMessage::DepartmentUpdate(_) => EVENT_DEPARTMENT_UPDATE,
            ChannelMessage::PhotoUpdate(_) => EVENT_PHOTO_UPDATE,
            ChannelMessage::PhotoDelete => EVENT_PHOTO_DELETE,
            ChannelMessage::ResetPatientData => EVENT_RESET_PATIENT_DATA,
        }
    }

    /// Encode as one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Serialization`] if the payload cannot be encoded.
    pub fn to_frame(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Serialization`] for unknown events or malformed payloads.
    pub fn from_frame(frame: &str) -> SyncResult<Self> {
        serde_json::from_str(frame)
            .map_err(|e| SyncError::Serialization(format!("Invalid channel frame: {e}")))
    }
}

impl fmt::Display for ChannelMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// Older stations send the bare ID, newer ones wrap it in an object
fn patient_id_payload<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Payload {
        Bare(String),
        Wrapped {
            #[serde(rename = "patientId")]
            patient_id: String,
        },
    }

    Ok(match Payload::deserialize(deserializer)? {
        Payload::Bare(id) | Payload::Wrapped { patient_id: id } => id,
    })
}

/// Connection lifecycle events reported by the channel client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    ConnectError(String),
    Disconnect,
}

impl ConnectionEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            ConnectionEvent::Connect => "connect",
            ConnectionEvent::ConnectError(_) => "connect_error",
            ConnectionEvent::Disconnect => "disconnect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_event_names() {
        let frame = ChannelMessage::NewPatientId("P100".to_string()).to_frame().unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&frame).unwrap(),
            json!({"event": "newPatientId", "data": "P100"})
        );

        let frame = ChannelMessage::PhotoDelete.to_frame().unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&frame).unwrap(),
            json!({"event": "photoDelete"})
        );
    }

    #[test]
    fn test_department_update_shape() {
        let mut set = DepartmentPatchSet::new();
        set.insert(
            Department::Ent,
            Some(SlicePatch::new().set("throat_pain", "No").clear("tonsils")),
        );
        set.insert(Department::Vision, None);

        let value = serde_json::to_value(ChannelMessage::DepartmentUpdate(set)).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "departmentUpdate",
                "data": {
                    "ent": {"throat_pain": "No", "tonsils": null},
                    "vision": null
                }
            })
        );
    }

    #[test]
    fn test_new_patient_id_accepts_wrapped_payload() {
        let message =
            ChannelMessage::from_frame(r#"{"event":"newPatientId","data":{"patientId":"P7"}}"#)
                .unwrap();
        assert_eq!(message, ChannelMessage::NewPatientId("P7".to_string()));
    }

    #[test]
    fn test_unit_events_without_data() {
        assert_eq!(
            ChannelMessage::from_frame(r#"{"event":"resetPatientData"}"#).unwrap(),
            ChannelMessage::ResetPatientData
        );
    }

    #[test]
    fn test_photo_update_shape() {
        let message = ChannelMessage::from_frame(
            r#"{"event":"photoUpdate","data":{"photo":"AAAA","photoFileName":"p.jpg"}}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            ChannelMessage::PhotoUpdate(PhotoAttachment {
                photo: "AAAA".to_string(),
                photo_file_name: "p.jpg".to_string(),
            })
        );
    }

    #[test]
    fn test_rejects_unknown_event() {
        assert!(ChannelMessage::from_frame(r#"{"event":"chat","data":"hi"}"#).is_err());
        assert!(ChannelMessage::from_frame("not json").is_err());
    }
}
