//! Record store
//!
//! The in-memory authority for the current patient record of one station.
//!
//! Every local mutation follows the same sequence: merge into the record,
//! advance `lastUpdated`, overwrite the cache snapshot, publish the new
//! snapshot to subscribers, then hand the patch to the realtime channel.
//! Cache and channel failures are logged and never undo the local change.
//!
//! Remote mutations (channel messages and polling results) go through the
//! `apply_remote_*` / [`RecordStore::merge_polled`] entry points, which
//! update and persist the record but do not broadcast again.

use crate::cache::RecordCache;
use crate::config::{ItResetPolicy, NewPatientPolicy, StorePolicy};
use crate::dental::{self, Dentition, ToothSelection};
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::LifecycleEvent;
use crate::photo::{self, PhotoChange};
use crate::protocol::{ChannelMessage, DepartmentPatchSet};
use crate::record::{Department, PatientRecord, SlicePatch};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};

const LIFECYCLE_CAPACITY: usize = 64;

/// Outbound half of the realtime channel as seen by the store
pub type OutboundSender = mpsc::UnboundedSender<ChannelMessage>;

pub struct RecordStore {
    /// Serializes mutations; held across the cache write
    state: Mutex<PatientRecord>,
    snapshot: watch::Sender<PatientRecord>,
    cache: Arc<dyn RecordCache>,
    outbound: RwLock<Option<OutboundSender>>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    policy: StorePolicy,
}

impl RecordStore {
    /// Initialize from the cache snapshot, starting empty when there is none.
    pub async fn open(cache: Arc<dyn RecordCache>, policy: StorePolicy) -> Arc<Self> {
        let record = match cache.load().await {
            Ok(Some(record)) => {
                tracing::info!(
                    patient_id = record.patient_id.as_deref().unwrap_or("-"),
                    departments = record.departments.len(),
                    "Restored patient record from cache"
                );
                record
            }
            Ok(None) => PatientRecord::new(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read cached record, starting empty");
                PatientRecord::new()
            }
        };

        let (snapshot, _) = watch::channel(record.clone());
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);

        Arc::new(Self {
            state: Mutex::new(record),
            snapshot,
            cache,
            outbound: RwLock::new(None),
            lifecycle,
            policy,
        })
    }

    /// Current snapshot
    pub fn get(&self) -> PatientRecord {
        self.snapshot.borrow().clone()
    }

    pub fn patient_id(&self) -> Option<String> {
        self.snapshot.borrow().patient_id.clone()
    }

    pub fn policy(&self) -> StorePolicy {
        self.policy
    }

    /// Snapshot stream; the receiver always sees the latest record
    pub fn subscribe(&self) -> watch::Receiver<PatientRecord> {
        self.snapshot.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Route future broadcasts into `sender`
    pub fn attach_channel(&self, sender: OutboundSender) {
        *self.outbound.write() = Some(sender);
    }

    pub fn detach_channel(&self) {
        self.outbound.write().take();
    }

    /// Start a new patient: set the ID, drop the previous slices (keeping
    /// registration data under [`NewPatientPolicy::KeepIt`]) and announce
    /// the ID to peers.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPatch`] for a blank ID.
    pub async fn set_department_id(&self, patient_id: impl Into<String>) -> SyncResult<()> {
        let patient_id = normalize_patient_id(patient_id.into())?;

        let mut record = self.state.lock().await;
        let preserved = self.start_patient(&mut record, &patient_id);
        self.commit(&mut record).await;
        self.publish(ChannelMessage::NewPatientId(patient_id.clone()));
        drop(record);

        tracing::info!(patient_id = %patient_id, "New patient ID set");
        self.notify(LifecycleEvent::NewPatient {
            patient_id,
            preserved,
        });
        Ok(())
    }

    /// Field-level merge of `patch` into the slice of `department`.
    ///
    /// Dental tooth fields are validated and rewritten in group order. For
    /// `it`, photo fields are broadcast as their own photo event and the
    /// remaining fields as a department update. A photo clear always removes
    /// both `photo` and `photoFileName`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPatch`] for malformed tooth codes or a
    /// photo without its file name. Nothing is applied in that case.
    pub async fn update_department(
        &self,
        department: Department,
        mut patch: SlicePatch,
    ) -> SyncResult<()> {
        if patch.is_empty() {
            return Ok(());
        }

        if department == Department::Dental {
            dental::normalize_patch(&mut patch)?;
        }
        let mut outgoing = patch.clone();
        let photo_change = if department == Department::It {
            photo::split_photo(&mut outgoing)?
        } else {
            None
        };

        // Apply locally exactly what peers will apply
        if let Some(change) = &photo_change {
            patch = outgoing.clone();
            for (field, value) in change.to_patch().iter() {
                patch.insert(field.clone(), value.clone());
            }
        }

        let mut record = self.state.lock().await;
        record.merge_patch(department, &patch);
        self.commit(&mut record).await;
        if let Some(change) = photo_change {
            self.publish(match change {
                PhotoChange::Set(attachment) => ChannelMessage::PhotoUpdate(attachment),
                PhotoChange::Clear => ChannelMessage::PhotoDelete,
            });
        }
        if !outgoing.is_empty() {
            self.publish(ChannelMessage::department(department, Some(outgoing)));
        }
        drop(record);

        tracing::debug!(department = %department, fields = patch.len(), "Department updated");
        Ok(())
    }

    /// Toggle one tooth code against the current dental slice and commit
    /// only the affected field. Returns whether the tooth is now selected.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPatch`] when `code` is not a tooth of
    /// `dentition` or the stored selection is malformed.
    pub async fn toggle_tooth(&self, dentition: Dentition, code: &str) -> SyncResult<bool> {
        let field = dentition.field();

        let mut record = self.state.lock().await;
        let current = record
            .slice(Department::Dental)
            .and_then(|slice| slice.get(field));
        let mut selection = ToothSelection::from_value(dentition, current)?;
        let selected = selection.toggle(code)?;

        let patch = if selection.is_empty() {
            SlicePatch::new().clear(field)
        } else {
            SlicePatch::new().set(field, selection.to_field_string())
        };
        record.merge_patch(Department::Dental, &patch);
        self.commit(&mut record).await;
        self.publish(ChannelMessage::department(Department::Dental, Some(patch)));
        drop(record);

        tracing::debug!(tooth = code, selected, field, "Tooth toggled");
        Ok(selected)
    }

    /// Clear one department slice, or with `None` the whole record and its
    /// cache entry.
    pub async fn reset_department(&self, department: Option<Department>) {
        let Some(department) = department else {
            self.reset_all(Some(ChannelMessage::ResetPatientData)).await;
            self.notify(LifecycleEvent::PatientReset);
            return;
        };

        let mut record = self.state.lock().await;
        self.clear_department(&mut record, department);
        self.commit(&mut record).await;
        self.publish(ChannelMessage::department(department, None));
        drop(record);

        tracing::info!(department = %department, "Department reset");
        self.notify(LifecycleEvent::DepartmentReset { department });
    }

    /// Clear every clinical slice, keeping the patient ID and registration data
    pub async fn reset_clinical_departments(&self) {
        let cleared: DepartmentPatchSet =
            Department::CLINICAL.into_iter().map(|d| (d, None)).collect();

        let mut record = self.state.lock().await;
        for department in Department::CLINICAL {
            record.clear_slice(department);
        }
        self.commit(&mut record).await;
        self.publish(ChannelMessage::DepartmentUpdate(cleared));
        drop(record);

        tracing::info!("Clinical departments reset");
        self.notify(LifecycleEvent::ClinicalReset);
    }

    // ------------------------------------------------------------------
    // Remote entry points
    // ------------------------------------------------------------------

    /// Peer announced a new patient ID
    pub async fn apply_remote_patient_id(&self, patient_id: String) {
        let patient_id = match normalize_patient_id(patient_id) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring remote patient ID");
                return;
            }
        };

        let mut record = self.state.lock().await;
        if record.patient_id.as_deref() == Some(patient_id.as_str()) {
            tracing::debug!(patient_id = %patient_id, "Remote patient ID already current");
            return;
        }
        let preserved = self.start_patient(&mut record, &patient_id);
        self.commit(&mut record).await;
        drop(record);

        tracing::info!(patient_id = %patient_id, "Patient ID received from peer");
        self.notify(LifecycleEvent::NewPatient {
            patient_id,
            preserved,
        });
    }

    /// Peer sent a partial record; `None` departments are cleared
    pub async fn apply_remote_update(&self, patches: DepartmentPatchSet) {
        let mut resets = Vec::new();

        let mut record = self.state.lock().await;
        for (department, patch) in patches {
            match patch {
                None => {
                    self.clear_department(&mut record, department);
                    resets.push(department);
                }
                Some(mut patch) => {
                    if department == Department::Dental {
                        if let Err(e) = dental::normalize_patch(&mut patch) {
                            tracing::warn!(
                                department = %department,
                                error = %e,
                                "Skipping invalid remote patch"
                            );
                            continue;
                        }
                    }
                    record.merge_patch(department, &patch);
                }
            }
        }
        self.commit(&mut record).await;
        drop(record);

        tracing::debug!("Applied remote department update");
        if resets.len() == Department::CLINICAL.len()
            && Department::CLINICAL.iter().all(|d| resets.contains(d))
        {
            self.notify(LifecycleEvent::ClinicalReset);
        } else {
            for department in resets {
                self.notify(LifecycleEvent::DepartmentReset { department });
            }
        }
    }

    /// Peer changed or removed the registration photo
    pub async fn apply_remote_photo(&self, change: PhotoChange) {
        let mut record = self.state.lock().await;
        record.merge_patch(Department::It, &change.to_patch());
        self.commit(&mut record).await;
        drop(record);

        tracing::debug!(
            removed = matches!(change, PhotoChange::Clear),
            "Applied remote photo change"
        );
    }

    /// Peer reset the whole record
    pub async fn apply_remote_reset(&self) {
        self.reset_all(None).await;
        self.notify(LifecycleEvent::PatientReset);
    }

    /// Merge authoritative slices pulled from the backend. Data for a
    /// different patient than the current one is ignored.
    pub async fn merge_polled(&self, patient_id: &str, slices: DepartmentPatchSet) {
        if slices.is_empty() {
            return;
        }
        let mut record = self.state.lock().await;
        if record.patient_id.as_deref() != Some(patient_id) {
            tracing::debug!(patient_id, "Discarding poll result for stale patient");
            return;
        }
        for (department, patch) in slices {
            let Some(mut patch) = patch else {
                continue;
            };
            if department == Department::Dental {
                if let Err(e) = dental::normalize_patch(&mut patch) {
                    tracing::warn!(
                        department = %department,
                        error = %e,
                        "Skipping invalid polled slice"
                    );
                    continue;
                }
            }
            record.merge_patch(department, &patch);
        }
        self.commit(&mut record).await;
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn start_patient(&self, record: &mut PatientRecord, patient_id: &str) -> Option<Department> {
        let carried = match self.policy.new_patient {
            NewPatientPolicy::DropAll => None,
            NewPatientPolicy::KeepIt => record.clear_slice(Department::It),
        };

        record.departments = BTreeMap::new();
        record.patient_id = Some(patient_id.to_string());

        carried.map(|slice| {
            record.departments.insert(Department::It, slice);
            Department::It
        })
    }

    fn clear_department(&self, record: &mut PatientRecord, department: Department) {
        record.clear_slice(department);
        if department == Department::It && self.policy.it_reset == ItResetPolicy::ClearPatientId {
            record.patient_id = None;
        }
    }

    /// Empty the record and the cache; `broadcast` is queued before the
    /// lock is released so it cannot overtake a later mutation.
    async fn reset_all(&self, broadcast: Option<ChannelMessage>) {
        let mut record = self.state.lock().await;
        *record = PatientRecord::new();
        if let Err(e) = self.cache.clear().await {
            tracing::warn!(error = %e, "Failed to clear cached record");
        }
        self.snapshot.send_replace(record.clone());
        if let Some(message) = broadcast {
            self.publish(message);
        }
        drop(record);

        tracing::info!("Patient record reset");
    }

    /// Stamp, persist and publish the mutated record
    async fn commit(&self, record: &mut PatientRecord) {
        record.touch();
        if let Err(e) = self.cache.store(record).await {
            tracing::warn!(error = %e, "Failed to persist record, continuing in memory");
        }
        self.snapshot.send_replace(record.clone());
    }

    fn publish(&self, message: ChannelMessage) {
        let outbound = self.outbound.read();
        let Some(sender) = outbound.as_ref() else {
            tracing::debug!(event = message.event_name(), "No channel attached, broadcast dropped");
            return;
        };
        if sender.send(message).is_err() {
            tracing::warn!("Channel closed, broadcast dropped");
        }
    }

    fn notify(&self, event: LifecycleEvent) {
        // No subscribers is not an error
        let _ = self.lifecycle.send(event);
    }
}

fn normalize_patient_id(patient_id: String) -> SyncResult<String> {
    let trimmed = patient_id.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidPatch("Patient ID must not be empty".to_string()));
    }
    Ok(trimmed.to_string())
}

/// Convert backend slices into patches that overwrite each field they carry
pub fn slices_to_patches(
    slices: BTreeMap<Department, BTreeMap<String, Value>>,
) -> DepartmentPatchSet {
    slices
        .into_iter()
        .map(|(department, fields)| {
            let patch: SlicePatch = fields.into_iter().map(|(k, v)| (k, Some(v))).collect();
            (department, Some(patch))
        })
        .collect()
}
