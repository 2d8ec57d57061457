//! Backend REST client
//!
//! The backend issues patient IDs, serves the authoritative record for the
//! polling fallback and persists submitted department data. All endpoints
//! live under `/api` and answer JSON; failures carry `{"error": "..."}`.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::record::{Department, DepartmentSlice, PatientRecord};
use crate::store::RecordStore;
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Response of `GET /api/get_patient_data`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientDataResponse {
    /// Whether anything changed after the requested timestamp
    #[serde(default)]
    pub changed: bool,
    /// Backend timestamp (ms) to use as the next `since`
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Updated department slices
    #[serde(default)]
    pub data: BTreeMap<Department, BTreeMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct GeneratedId {
    #[serde(rename = "patientId")]
    patient_id: Option<String>,
    #[serde(default = "default_success")]
    success: bool,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    message: Option<String>,
}

/// Backend operations used by the stations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Issue a fresh patient ID for the given capture date
    async fn generate_patient_id(&self, date: NaiveDate) -> SyncResult<String>;

    /// Pull the record of `patient_id` if it changed after `since` (ms)
    async fn get_patient_data(
        &self,
        patient_id: &str,
        since: i64,
    ) -> SyncResult<PatientDataResponse>;

    /// Persist the whole record; returns the backend's message
    async fn submit_patient(&self, record: &PatientRecord) -> SyncResult<String>;

    /// Persist one department slice; returns the backend's message
    async fn submit_department(
        &self,
        patient_id: &str,
        department: Department,
        slice: &DepartmentSlice,
    ) -> SyncResult<String>;
}

/// HTTP implementation of [`BackendApi`]
#[derive(Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    config: SyncConfig,
}

impl BackendClient {
    /// Create a client for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Network`] if the HTTP client cannot be built.
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    async fn post_json<T: DeserializeOwned>(&self, endpoint: &str, body: &Value) -> SyncResult<T> {
        let url = self.config.api_endpoint(endpoint);
        tracing::debug!(url = %url, "POST");
        let response = self.client.post(&url).json(body).send().await?;
        read_response(response).await
    }
}

#[async_trait]
impl BackendApi for BackendClient {
    async fn generate_patient_id(&self, date: NaiveDate) -> SyncResult<String> {
        let generated: GeneratedId = self
            .post_json("generate_patient_id", &json!({ "date": date.to_string() }))
            .await?;

        match generated.patient_id {
            Some(id) if generated.success && !id.trim().is_empty() => Ok(id),
            _ => Err(SyncError::BackendRejected(
                "Backend did not issue a patient ID".to_string(),
            )),
        }
    }

    async fn get_patient_data(
        &self,
        patient_id: &str,
        since: i64,
    ) -> SyncResult<PatientDataResponse> {
        let url = self.config.api_endpoint("get_patient_data");
        let since = since.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[("patient_id", patient_id), ("timestamp", since.as_str())])
            .send()
            .await?;
        read_response(response).await
    }

    async fn submit_patient(&self, record: &PatientRecord) -> SyncResult<String> {
        let patient_id = record
            .patient_id
            .as_deref()
            .ok_or_else(|| {
                SyncError::InvalidPatch("Cannot submit a record without patient ID".to_string())
            })?;

        let mut body = Map::new();
        body.insert("patientId".to_string(), Value::from(patient_id));
        for (department, slice) in &record.departments {
            body.insert(department.to_string(), serde_json::to_value(slice)?);
        }
        body.insert(
            "captured_date".to_string(),
            Value::from(Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S").to_string()),
        );

        let response: SubmitResponse =
            self.post_json("submit_patient", &Value::Object(body)).await?;
        let message = response
            .message
            .unwrap_or_else(|| "Patient data submitted".to_string());
        tracing::info!(patient_id, "Patient record submitted");
        Ok(message)
    }

    async fn submit_department(
        &self,
        patient_id: &str,
        department: Department,
        slice: &DepartmentSlice,
    ) -> SyncResult<String> {
        let body = json!({ "patientId": patient_id, "data": slice });
        let response: SubmitResponse = self
            .post_json(&format!("submit_{department}"), &body)
            .await?;
        let message = response
            .message
            .unwrap_or_else(|| format!("{department} data submitted"));
        tracing::info!(patient_id, department = %department, "Department submitted");
        Ok(message)
    }
}

/// Decode a success body, or turn an error status into [`SyncError::BackendRejected`]
async fn read_response<T: DeserializeOwned>(response: reqwest::Response) -> SyncResult<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| SyncError::Serialization(e.to_string()));
    }

    let body: Value = response.json().await.unwrap_or(Value::Null);
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .map_or_else(|| format!("Request failed with status: {status}"), str::to_string);
    tracing::warn!(status = %status, error = %message, "Backend rejected request");
    Err(SyncError::BackendRejected(message))
}

/// Registration desk workflow: obtain a new ID from the backend and start
/// the patient on every station
pub struct RegistrationDesk {
    backend: Arc<dyn BackendApi>,
    store: Arc<RecordStore>,
}

impl RegistrationDesk {
    pub fn new(backend: Arc<dyn BackendApi>, store: Arc<RecordStore>) -> Self {
        Self { backend, store }
    }

    /// Generate an ID for today and make it the current patient.
    ///
    /// # Errors
    ///
    /// Propagates backend failures; the store is left untouched in that case.
    pub async fn register_new_patient(&self) -> SyncResult<String> {
        let today = Local::now().date_naive();
        let patient_id = self.backend.generate_patient_id(today).await?;
        self.store.set_department_id(patient_id.clone()).await?;
        tracing::info!(patient_id = %patient_id, "Registered new patient");
        Ok(patient_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryRecordCache;
    use crate::config::StorePolicy;
    use crate::record::SlicePatch;
    use mockito::Matcher;

    fn client_for(server: &mockito::ServerGuard) -> BackendClient {
        let config = SyncConfig {
            api_url: server.url(),
            ..SyncConfig::default()
        };
        BackendClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_generate_patient_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/generate_patient_id")
            .match_body(Matcher::PartialJson(json!({"date": "2024-03-01"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"patientId": "P100", "success": true}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(client.generate_patient_id(date).await.unwrap(), "P100");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_generate_patient_id_failure_is_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/generate_patient_id")
            .with_status(500)
            .with_body(r#"{"error": "Failed to generate patient ID", "success": false}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let err = client.generate_patient_id(date).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::BackendRejected(ref m) if m == "Failed to generate patient ID"
        ));
    }

    #[tokio::test]
    async fn test_get_patient_data_sends_since() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/get_patient_data")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("patient_id".into(), "P100".into()),
                Matcher::UrlEncoded("timestamp".into(), "1700".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"changed": true, "timestamp": 1800, "data": {"vision": {"re_vision": "6/6"}}}"#,
            )
            .create_async()
            .await;

        let client = client_for(&server);
        let response = client.get_patient_data("P100", 1700).await.unwrap();
        assert!(response.changed);
        assert_eq!(response.timestamp, Some(1800));
        assert_eq!(
            response.data.get(&Department::Vision).and_then(|s| s.get("re_vision")),
            Some(&json!("6/6"))
        );
    }

    #[tokio::test]
    async fn test_submit_patient_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/submit_patient")
            .match_body(Matcher::PartialJson(json!({
                "patientId": "P100",
                "ent": {"throat_pain": "No"}
            })))
            .with_status(200)
            .with_body(r#"{"message": "Patient data submitted successfully."}"#)
            .create_async()
            .await;

        let mut record = PatientRecord::new();
        record.patient_id = Some("P100".to_string());
        record.merge_patch(Department::Ent, &SlicePatch::new().set("throat_pain", "No"));

        let client = client_for(&server);
        assert_eq!(
            client.submit_patient(&record).await.unwrap(),
            "Patient data submitted successfully."
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_submit_department_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/submit_dental")
            .with_status(400)
            .with_body(r#"{"error": "Missing data for departments: dental"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let slice: DepartmentSlice = [("plaque", "Present")].into_iter().collect();
        let err = client
            .submit_department("P100", Department::Dental, &slice)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::BackendRejected(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_error() {
        let config = SyncConfig {
            api_url: "http://127.0.0.1:1".to_string(),
            ..SyncConfig::default()
        };
        let client = BackendClient::new(config).unwrap();
        let err = client.get_patient_data("P1", 0).await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_registration_desk_sets_new_patient() {
        let mut backend = MockBackendApi::new();
        backend
            .expect_generate_patient_id()
            .times(1)
            .returning(|_| Ok("P777".to_string()));

        let store =
            RecordStore::open(Arc::new(MemoryRecordCache::new()), StorePolicy::default()).await;
        let desk = RegistrationDesk::new(Arc::new(backend), store.clone());

        assert_eq!(desk.register_new_patient().await.unwrap(), "P777");
        assert_eq!(store.patient_id().as_deref(), Some("P777"));
    }

    #[tokio::test]
    async fn test_registration_failure_leaves_store_untouched() {
        let mut backend = MockBackendApi::new();
        backend
            .expect_generate_patient_id()
            .returning(|_| Err(SyncError::Network("offline".to_string())));

        let store =
            RecordStore::open(Arc::new(MemoryRecordCache::new()), StorePolicy::default()).await;
        store.set_department_id("P1").await.unwrap();
        let desk = RegistrationDesk::new(Arc::new(backend), store.clone());

        assert!(desk.register_new_patient().await.is_err());
        assert_eq!(store.patient_id().as_deref(), Some("P1"));
    }
}
