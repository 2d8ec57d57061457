//! Process-wide lifecycle notifications
//!
//! Raised by the record store on resets and new patients so that components
//! holding their own local state (forms, pollers) can react without reading
//! every snapshot.

use crate::record::Department;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The whole record was cleared
    PatientReset,
    /// One department slice was cleared
    DepartmentReset { department: Department },
    /// A new patient ID replaced the previous record
    NewPatient {
        patient_id: String,
        /// Slice carried over from the previous record, if any
        preserved: Option<Department>,
    },
    /// All clinical slices were cleared; registration data kept
    ClinicalReset,
}

impl LifecycleEvent {
    /// Whether local state bound to `department` should be discarded
    pub fn affects(&self, department: Department) -> bool {
        match self {
            LifecycleEvent::PatientReset => true,
            LifecycleEvent::DepartmentReset { department: d } => *d == department,
            LifecycleEvent::NewPatient { preserved, .. } => *preserved != Some(department),
            LifecycleEvent::ClinicalReset => department != Department::It,
        }
    }
}
