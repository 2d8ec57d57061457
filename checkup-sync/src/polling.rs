//! Polling fallback
//!
//! A department screen pulls its slice from the backend at a fixed interval
//! while a patient is selected. This repairs missed channel messages, e.g.
//! after a station was offline. Polling pauses while no patient ID is set
//! and restarts with a fresh `since` when the patient changes.

use crate::backend::BackendApi;
use crate::record::{Department, PatientRecord};
use crate::store::{slices_to_patches, RecordStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Running poller; dropping the handle stops it
pub struct PollingHandle {
    task: JoinHandle<()>,
}

impl PollingHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Periodic pull of one department slice
pub struct Poller {
    store: Arc<RecordStore>,
    backend: Arc<dyn BackendApi>,
    department: Department,
    interval: Duration,
}

impl Poller {
    pub fn new(
        store: Arc<RecordStore>,
        backend: Arc<dyn BackendApi>,
        department: Department,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            department,
            interval,
        }
    }

    /// Start polling in the background
    pub fn spawn(self) -> PollingHandle {
        PollingHandle {
            task: tokio::spawn(self.run()),
        }
    }

    async fn run(self) {
        let mut snapshots = self.store.subscribe();

        loop {
            let patient_id = match snapshots.wait_for(|record| record.patient_id.is_some()).await {
                Ok(record) => record.patient_id.clone(),
                Err(_) => return,
            };
            let Some(patient_id) = patient_id else {
                continue;
            };

            tracing::debug!(
                department = %self.department,
                patient_id = %patient_id,
                "Polling started"
            );
            if !self.poll_patient(&patient_id, &mut snapshots).await {
                return;
            }
            tracing::debug!(
                department = %self.department,
                patient_id = %patient_id,
                "Polling stopped"
            );
        }
    }

    /// Poll until the current patient changes. Returns false once the store is gone.
    async fn poll_patient(
        &self,
        patient_id: &str,
        snapshots: &mut watch::Receiver<PatientRecord>,
    ) -> bool {
        let mut since = self.store.get().last_updated;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    if snapshots.borrow_and_update().patient_id.as_deref() != Some(patient_id) {
                        return true;
                    }
                }
                _ = ticker.tick() => {
                    since = self.poll_once(patient_id, since).await;
                }
            }
        }
    }

    /// Pull once and merge this department's slice; returns the next `since`.
    pub async fn poll_once(&self, patient_id: &str, since: i64) -> i64 {
        let response = match self.backend.get_patient_data(patient_id, since).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(department = %self.department, error = %e, "Poll failed");
                return since;
            }
        };
        if !response.changed {
            return since;
        }

        let slices = response
            .data
            .into_iter()
            .filter(|(department, _)| *department == self.department)
            .collect();
        self.store.merge_polled(patient_id, slices_to_patches(slices)).await;

        let next = response
            .timestamp
            .unwrap_or_else(|| Utc::now().timestamp_millis())
            .max(since);
        tracing::debug!(department = %self.department, since = next, "Merged polled slice");
        next
    }
}
