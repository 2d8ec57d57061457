//! Department form adapter
//!
//! Binds one department screen to its slice of the record store:
//! - Field edits update local state at once and reach the store after a
//!   per-field debounce; a newer edit of the same field replaces the
//!   pending one
//! - Store snapshots rehydrate every bound field that has no pending edit
//! - Saving flushes pending edits, checks required fields, marks the slice
//!   submitted, submits it to the backend and resets the form
//! - Reset notifications from the store discard local state
//!
//! The form does not run a task of its own. The screen drives it by calling
//! [`DepartmentForm::sync`] on each render, or by awaiting
//! [`DepartmentForm::next_update`] in its event loop next to user input.

use crate::backend::BackendApi;
use crate::departments::FormSchema;
use crate::dental::{Dentition, ToothSelection};
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::LifecycleEvent;
use crate::notifications::NotificationCenter;
use crate::photo::{PhotoAttachment, PhotoChange, PHOTO, PHOTO_FILE_NAME};
use crate::record::{Department, PatientRecord, SlicePatch};
use crate::store::RecordStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Result of [`DepartmentForm::save`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Backend accepted the slice; carries its message
    Submitted(String),
    /// No backend or no patient ID; the slice is only in the store
    SavedLocally,
    /// Backend refused; the slice stays submitted in the store
    Rejected(String),
}

struct PendingEdit {
    generation: u64,
    value: Option<Value>,
    timer: JoinHandle<()>,
}

type PendingEdits = Arc<Mutex<HashMap<String, PendingEdit>>>;

pub struct DepartmentForm {
    schema: &'static FormSchema,
    store: Arc<RecordStore>,
    backend: Option<Arc<dyn BackendApi>>,
    notifications: NotificationCenter,
    debounce: Duration,
    values: BTreeMap<String, Value>,
    pending: PendingEdits,
    generation: u64,
    snapshots: watch::Receiver<PatientRecord>,
    lifecycle: broadcast::Receiver<LifecycleEvent>,
}

impl DepartmentForm {
    /// Create a form for `department`, initialized from the current record
    pub fn new(
        department: Department,
        store: Arc<RecordStore>,
        notifications: NotificationCenter,
        debounce: Duration,
    ) -> Self {
        let schema = FormSchema::for_department(department);
        let snapshots = store.subscribe();
        let lifecycle = store.subscribe_lifecycle();
        let mut form = Self {
            schema,
            store,
            snapshots,
            lifecycle,
            backend: None,
            notifications,
            debounce,
            values: schema.default_values(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: 0,
        };
        form.refresh();
        form
    }

    /// Submit saved slices to `backend`
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn BackendApi>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn department(&self) -> Department {
        self.schema.department
    }

    pub fn schema(&self) -> &'static FormSchema {
        self.schema
    }

    /// Local field state as shown on screen
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn value(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn has_pending(&self, field: &str) -> bool {
        self.pending.lock().contains_key(field)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Edit a field; the store sees it after the debounce delay.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPatch`] for a field this screen does not bind.
    pub fn set_field(&mut self, field: &str, value: impl Into<Value>) -> SyncResult<()> {
        self.ensure_bound(field)?;
        let value = value.into();
        if value.is_null() {
            self.values.remove(field);
            self.schedule(field, None);
        } else {
            self.values.insert(field.to_string(), value.clone());
            self.schedule(field, Some(value));
        }
        Ok(())
    }

    /// Clear a field; the store sees it after the debounce delay.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPatch`] for a field this screen does not bind.
    pub fn clear_field(&mut self, field: &str) -> SyncResult<()> {
        self.set_field(field, Value::Null)
    }

    /// Commit every pending edit now, as one update.
    ///
    /// # Errors
    ///
    /// Propagates store validation errors (malformed tooth codes, photo fields).
    pub async fn flush(&mut self) -> SyncResult<()> {
        let edits: Vec<(String, PendingEdit)> = self.pending.lock().drain().collect();
        if edits.is_empty() {
            return Ok(());
        }

        let mut patch = SlicePatch::new();
        for (field, edit) in edits {
            edit.timer.abort();
            patch.insert(field, edit.value);
        }
        tracing::debug!(
            department = %self.department(),
            fields = patch.len(),
            "Flushing pending edits"
        );
        self.store.update_department(self.department(), patch).await
    }

    /// Apply lifecycle notifications and store changes received since the
    /// last call. Returns whether anything was applied.
    pub fn sync(&mut self) -> bool {
        let mut applied = false;
        loop {
            match self.lifecycle.try_recv() {
                Ok(event) => {
                    self.on_lifecycle(&event);
                    applied = true;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        department = %self.department(),
                        skipped,
                        "Missed lifecycle events"
                    );
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }

        if self.snapshots.has_changed().unwrap_or(false) {
            let record = self.snapshots.borrow_and_update().clone();
            self.rehydrate(&record);
            applied = true;
        }
        applied
    }

    /// Wait for the next store change or lifecycle notification and apply it
    pub async fn next_update(&mut self) {
        tokio::select! {
            _ = self.snapshots.changed() => {}
            event = self.lifecycle.recv() => {
                if let Ok(event) = event {
                    self.on_lifecycle(&event);
                }
            }
        }
        self.sync();
    }

    /// Reload bound fields from the latest store snapshot
    pub fn refresh(&mut self) {
        let record = self.store.get();
        self.rehydrate(&record);
    }

    /// Take bound fields from `record`, keeping fields with a pending edit.
    /// Fields absent from the slice fall back to their defaults.
    pub fn rehydrate(&mut self, record: &PatientRecord) {
        let pending = self.pending.lock();
        let slice = record.slice(self.schema.department);

        for field in self.schema.fields() {
            if pending.contains_key(field) {
                continue;
            }
            let stored = slice.and_then(|slice| slice.get(field)).cloned();
            let fallback = self
                .schema
                .defaults
                .iter()
                .find(|(name, _)| *name == field)
                .map(|(_, value)| Value::from(*value));

            match stored.or(fallback) {
                Some(value) => {
                    self.values.insert(field.to_string(), value);
                }
                None => {
                    self.values.remove(field);
                }
            }
        }
    }

    /// React to a store lifecycle notification
    pub fn on_lifecycle(&mut self, event: &LifecycleEvent) {
        if event.affects(self.department()) {
            tracing::debug!(department = %self.department(), ?event, "Clearing form state");
            self.reset();
        }
    }

    /// Drop pending edits and restore defaults
    pub fn reset(&mut self) {
        for (_, edit) in self.pending.lock().drain() {
            edit.timer.abort();
        }
        self.values = self.schema.default_values();
    }

    /// Validate, mark submitted, submit to the backend and reset the form.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] when a required field is empty;
    /// nothing is marked submitted in that case. Backend failures are not
    /// errors here, see [`SaveOutcome::Rejected`].
    pub async fn save(&mut self) -> SyncResult<SaveOutcome> {
        let department = self.department();
        self.flush().await?;

        if let Err(e) = self.schema.validate(&self.values) {
            self.notifications.error(e.to_string());
            return Err(e);
        }

        self.store
            .update_department(department, SlicePatch::new().submitted())
            .await?;

        let patient_id = self.store.patient_id();
        let outcome = match (&self.backend, patient_id) {
            (Some(backend), Some(patient_id)) => {
                let slice = self
                    .store
                    .get()
                    .slice(department)
                    .cloned()
                    .unwrap_or_default();
                match backend.submit_department(&patient_id, department, &slice).await {
                    Ok(message) => {
                        self.notifications.success(format!("{department} data saved"));
                        SaveOutcome::Submitted(message)
                    }
                    Err(e) => {
                        tracing::warn!(
                            department = %department,
                            error = %e,
                            "Submit failed, kept locally"
                        );
                        self.notifications
                            .error(format!("Failed to submit {department} data: {e}"));
                        SaveOutcome::Rejected(e.to_string())
                    }
                }
            }
            _ => {
                self.notifications.success(format!("{department} data saved locally"));
                SaveOutcome::SavedLocally
            }
        };

        self.reset();
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Registration photo
    // ------------------------------------------------------------------

    /// Attach the registration photo; committed immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPatch`] outside the IT screen.
    pub async fn attach_photo(
        &mut self,
        bytes: &[u8],
        file_name: impl Into<String>,
    ) -> SyncResult<()> {
        let attachment = PhotoAttachment::from_bytes(bytes, file_name);
        self.commit_photo(PhotoChange::Set(attachment)).await
    }

    /// Remove the registration photo; committed immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPatch`] outside the IT screen.
    pub async fn remove_photo(&mut self) -> SyncResult<()> {
        self.commit_photo(PhotoChange::Clear).await
    }

    async fn commit_photo(&mut self, change: PhotoChange) -> SyncResult<()> {
        self.ensure_department(Department::It)?;
        self.discard_pending(&[PHOTO, PHOTO_FILE_NAME]);

        match &change {
            PhotoChange::Set(attachment) => {
                self.values.insert(PHOTO.to_string(), Value::from(attachment.photo.clone()));
                self.values.insert(
                    PHOTO_FILE_NAME.to_string(),
                    Value::from(attachment.photo_file_name.clone()),
                );
            }
            PhotoChange::Clear => {
                self.values.remove(PHOTO);
                self.values.remove(PHOTO_FILE_NAME);
            }
        }
        self.store.update_department(Department::It, change.to_patch()).await
    }

    // ------------------------------------------------------------------
    // Dental tooth groups
    // ------------------------------------------------------------------

    /// Toggle one tooth in its group selector; committed immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPatch`] outside the dental screen or for
    /// an unknown tooth code.
    pub async fn toggle_tooth(&mut self, dentition: Dentition, code: &str) -> SyncResult<bool> {
        self.ensure_department(Department::Dental)?;
        let field = dentition.field();
        self.discard_pending(&[field]);

        let selected = self.store.toggle_tooth(dentition, code).await?;

        let stored = self
            .store
            .get()
            .slice(Department::Dental)
            .and_then(|slice| slice.get(field))
            .cloned();
        match stored {
            Some(value) => {
                self.values.insert(field.to_string(), value);
            }
            None => {
                self.values.remove(field);
            }
        }
        Ok(selected)
    }

    /// Locally shown selection of one dentition
    pub fn tooth_selection(&self, dentition: Dentition) -> ToothSelection {
        ToothSelection::from_value(dentition, self.values.get(dentition.field()))
            .unwrap_or_else(|_| ToothSelection::empty(dentition))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn schedule(&mut self, field: &str, value: Option<Value>) {
        self.generation += 1;
        let generation = self.generation;

        let pending = Arc::clone(&self.pending);
        let store = Arc::clone(&self.store);
        let department = self.department();
        let delay = self.debounce;
        let key = field.to_string();
        let committed = value.clone();

        let mut edits = self.pending.lock();
        if let Some(previous) = edits.remove(field) {
            previous.timer.abort();
        }
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut edits = pending.lock();
                let current = edits
                    .get(&key)
                    .is_some_and(|edit| edit.generation == generation);
                if !current {
                    return;
                }
                edits.remove(&key);
            }
            let patch: SlicePatch = std::iter::once((key, committed)).collect();
            if let Err(e) = store.update_department(department, patch).await {
                tracing::warn!(department = %department, error = %e, "Debounced edit rejected");
            }
        });
        edits.insert(
            field.to_string(),
            PendingEdit {
                generation,
                value,
                timer,
            },
        );
    }

    fn discard_pending(&self, fields: &[&str]) {
        let mut edits = self.pending.lock();
        for field in fields {
            if let Some(edit) = edits.remove(*field) {
                edit.timer.abort();
            }
        }
    }

    fn ensure_bound(&self, field: &str) -> SyncResult<()> {
        if self.schema.is_bound(field) {
            Ok(())
        } else {
            Err(SyncError::InvalidPatch(format!(
                "{field} is not a field of the {} form",
                self.department()
            )))
        }
    }

    fn ensure_department(&self, department: Department) -> SyncResult<()> {
        if self.department() == department {
            Ok(())
        } else {
            Err(SyncError::InvalidPatch(format!(
                "Operation only available on the {department} form"
            )))
        }
    }
}

impl Drop for DepartmentForm {
    fn drop(&mut self) {
        // Unflushed edits are discarded with the form
        for (_, edit) in self.pending.lock().drain() {
            edit.timer.abort();
        }
    }
}
