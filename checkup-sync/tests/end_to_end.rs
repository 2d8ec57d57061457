use checkup_relay::{RelayHub, RelayServer};
use checkup_sync::{
    BackendClient, Department, MemoryRecordCache, PatientRecord, SlicePatch, Station, SyncConfig,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const ROUND_TRIP: Duration = Duration::from_secs(5);

async fn start_relay() -> (SocketAddr, RelayHub) {
    let server = RelayServer::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
    let addr = server.local_addr().unwrap();
    let hub = server.hub().clone();
    server.spawn();
    (addr, hub)
}

async fn start_station(relay: SocketAddr) -> Station {
    let config = SyncConfig {
        // No backend in this scenario; nothing here calls it
        api_url: "http://127.0.0.1:1".to_string(),
        socket_url: format!("ws://{relay}/ws"),
        reconnect_delay: Duration::from_millis(50),
        ..SyncConfig::default()
    };
    let backend = Arc::new(BackendClient::new(config.clone()).unwrap());
    let station = Station::assemble(config, Arc::new(MemoryRecordCache::new()), backend).await;
    station.channel().wait_connected().await.unwrap();
    station
}

async fn wait_for_stations(hub: &RelayHub, count: usize) {
    for _ in 0..200 {
        if hub.connection_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("relay never saw {count} stations");
}

async fn wait_for_record<F>(station: &Station, predicate: F) -> PatientRecord
where
    F: FnMut(&PatientRecord) -> bool,
{
    let mut snapshots = station.store().subscribe();
    let record = tokio::time::timeout(ROUND_TRIP, snapshots.wait_for(predicate))
        .await
        .expect("timed out waiting for replicated record")
        .unwrap()
        .clone();
    record
}

fn fields(record: &PatientRecord, department: Department) -> BTreeMap<String, Value> {
    record
        .slice(department)
        .map(|slice| slice.fields().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_two_stations_share_patient_and_department_data() {
    let (relay, hub) = start_relay().await;
    let a = start_station(relay).await;
    let b = start_station(relay).await;
    wait_for_stations(&hub, 2).await;

    a.store().set_department_id("P100").await.unwrap();
    let seen = wait_for_record(&b, |r| r.patient_id.as_deref() == Some("P100")).await;
    assert!(seen.departments.is_empty());

    a.store()
        .update_department(
            Department::Ent,
            SlicePatch::new().set("throat_pain", "No").submitted(),
        )
        .await
        .unwrap();
    let seen = wait_for_record(&b, |r| r.slice(Department::Ent).is_some()).await;
    assert_eq!(
        fields(&seen, Department::Ent),
        BTreeMap::from([
            ("isSubmitted".to_string(), json!(true)),
            ("throat_pain".to_string(), json!("No")),
        ])
    );

    // Replication does not echo back into the sender
    assert_eq!(fields(&a.store().get(), Department::Ent), fields(&seen, Department::Ent));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_reset_reaches_every_station() {
    let (relay, hub) = start_relay().await;
    let a = start_station(relay).await;
    let b = start_station(relay).await;
    let c = start_station(relay).await;
    wait_for_stations(&hub, 3).await;

    b.store().set_department_id("P200").await.unwrap();
    b.store()
        .update_department(Department::Vision, SlicePatch::new().set("re_vision", "6/12"))
        .await
        .unwrap();
    for station in [&a, &c] {
        wait_for_record(station, |r| r.slice(Department::Vision).is_some()).await;
    }

    a.store().reset_department(None).await;
    for station in [&b, &c] {
        let record = wait_for_record(station, PatientRecord::is_empty).await;
        assert!(record.patient_id.is_none());
    }

    for station in [a, b, c] {
        station.shutdown().await;
    }
}

#[tokio::test]
async fn test_department_reset_replicates_as_clear() {
    let (relay, hub) = start_relay().await;
    let a = start_station(relay).await;
    let b = start_station(relay).await;
    wait_for_stations(&hub, 2).await;

    a.store().set_department_id("P300").await.unwrap();
    a.store()
        .update_department(Department::General, SlicePatch::new().set("height", "140"))
        .await
        .unwrap();
    a.store()
        .update_department(Department::Dental, SlicePatch::new().set("plaque", "Absent"))
        .await
        .unwrap();
    wait_for_record(&b, |r| {
        r.slice(Department::General).is_some() && r.slice(Department::Dental).is_some()
    })
    .await;

    a.store().reset_department(Some(Department::General)).await;
    let record = wait_for_record(&b, |r| r.slice(Department::General).is_none()).await;
    assert_eq!(record.patient_id.as_deref(), Some("P300"));
    assert_eq!(
        fields(&record, Department::Dental),
        BTreeMap::from([("plaque".to_string(), json!("Absent"))])
    );

    a.shutdown().await;
    b.shutdown().await;
}
