//! Shared patient-record synchronization for checkup stations
//!
//! Provides:
//! - One patient record per session, split into department slices
//! - A durable local snapshot in SQLite that survives restarts
//! - Live replication between stations over a WebSocket relay
//! - A polling fallback against the backend for missed messages
//! - Department form adapters with debounced field commits

pub mod backend;
pub mod cache;
pub mod channel;
pub mod config;
pub mod dental;
pub mod departments;
pub mod error;
pub mod form;
pub mod lifecycle;
pub mod notifications;
pub mod photo;
pub mod polling;
pub mod protocol;
pub mod record;
pub mod store;

pub use backend::{BackendApi, BackendClient, PatientDataResponse, RegistrationDesk};
pub use cache::{CacheConfig, MemoryRecordCache, RecordCache, SqliteRecordCache};
pub use channel::{ChannelConfig, ChannelHandle};
pub use config::{ItResetPolicy, NewPatientPolicy, StorePolicy, SyncConfig};
pub use dental::{Dentition, ToothSelection};
pub use departments::FormSchema;
pub use error::{SyncError, SyncResult};
pub use form::{DepartmentForm, SaveOutcome};
pub use lifecycle::LifecycleEvent;
pub use notifications::{Notification, NotificationCenter, Severity};
pub use photo::PhotoAttachment;
pub use polling::{Poller, PollingHandle};
pub use protocol::{ChannelMessage, ConnectionEvent};
pub use record::{Department, DepartmentSlice, PatientRecord, SlicePatch};
pub use store::RecordStore;

use std::sync::Arc;

/// One station: record store, realtime channel, backend and notifications
pub struct Station {
    config: SyncConfig,
    store: Arc<RecordStore>,
    backend: Arc<dyn BackendApi>,
    notifications: NotificationCenter,
    channel: ChannelHandle,
}

impl Station {
    /// Start a station from configuration: SQLite cache, HTTP backend and
    /// a channel connection to the configured relay.
    ///
    /// # Errors
    ///
    /// Fails when the cache database cannot be opened or the HTTP client
    /// cannot be built. An unreachable relay or backend is not an error.
    pub async fn start(config: SyncConfig) -> SyncResult<Self> {
        let cache = Arc::new(SqliteRecordCache::new(&config.cache).await?);
        let backend = Arc::new(BackendClient::new(config.clone())?);
        Ok(Self::assemble(config, cache, backend).await)
    }

    /// Start a station from explicit parts
    pub async fn assemble(
        config: SyncConfig,
        cache: Arc<dyn RecordCache>,
        backend: Arc<dyn BackendApi>,
    ) -> Self {
        let store = RecordStore::open(cache, config.policy).await;
        let channel = channel::connect(store.clone(), ChannelConfig::from(&config));

        tracing::info!(
            api_url = %config.api_url,
            socket_url = %config.socket_url,
            "Station started"
        );

        Self {
            config,
            store,
            backend,
            notifications: NotificationCenter::default(),
            channel,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    /// Form adapter for one department screen
    pub fn form(&self, department: Department) -> DepartmentForm {
        DepartmentForm::new(
            department,
            self.store.clone(),
            self.notifications.clone(),
            self.config.debounce,
        )
        .with_backend(self.backend.clone())
    }

    /// Polling fallback for one department screen
    pub fn poll(&self, department: Department) -> PollingHandle {
        Poller::new(
            self.store.clone(),
            self.backend.clone(),
            department,
            self.config.poll_interval,
        )
        .spawn()
    }

    pub fn registration(&self) -> RegistrationDesk {
        RegistrationDesk::new(self.backend.clone(), self.store.clone())
    }

    /// Disconnect from the relay
    pub async fn shutdown(self) {
        self.channel.disconnect().await;
        tracing::info!("Station stopped");
    }
}
