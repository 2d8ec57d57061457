//! Patient record data model
//!
//! A [`PatientRecord`] is the aggregate every station edits: an optional
//! patient identifier, one [`DepartmentSlice`] per department that has
//! written at least one field, and a logical `lastUpdated` clock.
//!
//! Slices are open field maps. Mutations arrive as [`SlicePatch`]es where a
//! `None` value is an explicit clear and a missing key means "not touched".

use crate::error::SyncError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Field marking a slice as finalized by its department
pub const IS_SUBMITTED: &str = "isSubmitted";

/// Examining departments sharing one patient record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Department {
    It,
    Ent,
    Vision,
    General,
    Dental,
}

impl Department {
    pub const ALL: [Department; 5] = [
        Department::It,
        Department::Ent,
        Department::Vision,
        Department::General,
        Department::Dental,
    ];

    /// Departments whose slices hold examination findings (everything but registration)
    pub const CLINICAL: [Department; 4] = [
        Department::Ent,
        Department::Vision,
        Department::General,
        Department::Dental,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Department::It => "it",
            Department::Ent => "ent",
            Department::Vision => "vision",
            Department::General => "general",
            Department::Dental => "dental",
        }
    }
}

impl fmt::Display for Department {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Department {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "it" => Ok(Department::It),
            "ent" => Ok(Department::Ent),
            "vision" => Ok(Department::Vision),
            "general" => Ok(Department::General),
            "dental" => Ok(Department::Dental),
            _ => Err(SyncError::InvalidPatch(format!("Unknown department: {s}"))),
        }
    }
}

/// Field-level partial update to one department slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlicePatch {
    fields: BTreeMap<String, Option<Value>>,
}

impl SlicePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `field` to `value`
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), Some(value.into()));
        self
    }

    /// Explicitly clear `field`
    #[must_use]
    pub fn clear(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), None);
        self
    }

    /// Mark the slice as finalized
    #[must_use]
    pub fn submitted(self) -> Self {
        self.set(IS_SUBMITTED, true)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Option<Value>) {
        self.fields.insert(field.into(), value);
    }

    /// `None` when the field is absent, `Some(None)` when it is an explicit clear
    pub fn get(&self, field: &str) -> Option<&Option<Value>> {
        self.fields.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Option<Value>> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<Value>)> {
        self.fields.iter()
    }

    /// Whether applying this patch could create a slice that does not exist yet
    pub fn has_values(&self) -> bool {
        self.fields.values().any(Option::is_some)
    }
}

impl From<&DepartmentSlice> for SlicePatch {
    fn from(slice: &DepartmentSlice) -> Self {
        Self {
            fields: slice
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect(),
        }
    }
}

impl FromIterator<(String, Option<Value>)> for SlicePatch {
    fn from_iter<I: IntoIterator<Item = (String, Option<Value>)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// The portion of a patient record owned by one department
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DepartmentSlice {
    fields: BTreeMap<String, Value>,
}

impl DepartmentSlice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String value of `field`, if it holds one
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn is_submitted(&self) -> bool {
        self.fields
            .get(IS_SUBMITTED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Field-level merge: patch values overwrite, `None` removes, absent keys are untouched
    pub fn apply(&mut self, patch: &SlicePatch) {
        for (field, value) in patch.iter() {
            match value {
                Some(value) => {
                    self.fields.insert(field.clone(), value.clone());
                }
                None => {
                    self.fields.remove(field);
                }
            }
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for DepartmentSlice {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Root aggregate shared by all stations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    #[serde(rename = "patientId", default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub departments: BTreeMap<Department, DepartmentSlice>,

    /// Milliseconds since epoch of the last accepted mutation
    #[serde(rename = "lastUpdated", default)]
    pub last_updated: i64,
}

impl PatientRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when there is neither a patient ID nor any department data
    pub fn is_empty(&self) -> bool {
        self.patient_id.is_none() && self.departments.is_empty()
    }

    pub fn slice(&self, department: Department) -> Option<&DepartmentSlice> {
        self.departments.get(&department)
    }

    /// Merge `patch` into the slice for `department`, creating the slice only
    /// when the patch actually writes a value. A slice left without fields
    /// is removed.
    pub fn merge_patch(&mut self, department: Department, patch: &SlicePatch) {
        if let Some(slice) = self.departments.get_mut(&department) {
            slice.apply(patch);
            if slice.is_empty() {
                self.departments.remove(&department);
            }
        } else if patch.has_values() {
            let mut slice = DepartmentSlice::new();
            slice.apply(patch);
            self.departments.insert(department, slice);
        }
    }

    pub fn clear_slice(&mut self, department: Department) -> Option<DepartmentSlice> {
        self.departments.remove(&department)
    }

    /// Advance the logical clock; strictly increasing even if the wall clock stalls
    pub fn touch(&mut self) -> i64 {
        self.last_updated = next_timestamp(self.last_updated);
        self.last_updated
    }
}

/// Next value of a millisecond clock that never goes backwards
pub fn next_timestamp(previous: i64) -> i64 {
    Utc::now()
        .timestamp_millis()
        .max(previous.saturating_add(1))
}
