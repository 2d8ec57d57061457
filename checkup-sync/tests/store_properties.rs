use checkup_sync::{
    ChannelMessage, Department, Dentition, MemoryRecordCache, PatientRecord, RecordCache,
    RecordStore, SlicePatch, SqliteRecordCache, StorePolicy,
};
use checkup_sync::cache::CacheConfig;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

const FIELDS: [&str; 5] = ["plaque", "stains", "tarter", "bad_breath", "soft_tissue"];

fn field_value() -> impl Strategy<Value = Option<Value>> {
    prop_oneof![
        Just(None),
        "[A-Za-z ]{1,8}".prop_map(|s| Some(Value::from(s))),
        any::<bool>().prop_map(|b| Some(Value::from(b))),
    ]
}

fn patch_strategy() -> impl Strategy<Value = SlicePatch> {
    prop::collection::btree_map(prop::sample::select(FIELDS.to_vec()), field_value(), 0..5)
        .prop_map(|entries| {
            let mut patch = SlicePatch::new();
            for (field, value) in entries {
                patch.insert(field, value);
            }
            patch
        })
}

fn slice_fields(record: &PatientRecord, department: Department) -> BTreeMap<String, Value> {
    record
        .slice(department)
        .map(|slice| slice.fields().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

proptest! {
    #[test]
    fn merge_is_idempotent(initial in patch_strategy(), patch in patch_strategy()) {
        let mut once = PatientRecord::new();
        once.merge_patch(Department::General, &initial);
        once.merge_patch(Department::General, &patch);

        let mut twice = once.clone();
        twice.merge_patch(Department::General, &patch);

        prop_assert_eq!(once, twice);
    }

    #[test]
    fn clears_remove_and_absent_fields_survive(
        initial in patch_strategy(),
        patch in patch_strategy(),
    ) {
        let mut record = PatientRecord::new();
        record.merge_patch(Department::Dental, &initial);
        let before = slice_fields(&record, Department::Dental);

        record.merge_patch(Department::Dental, &patch);
        let after = slice_fields(&record, Department::Dental);

        for field in FIELDS {
            match patch.get(field) {
                Some(None) => prop_assert!(!after.contains_key(field)),
                Some(Some(value)) => prop_assert_eq!(after.get(field), Some(value)),
                None => prop_assert_eq!(after.get(field), before.get(field)),
            }
        }
    }
}

async fn memory_store() -> (Arc<RecordStore>, Arc<MemoryRecordCache>) {
    let cache = Arc::new(MemoryRecordCache::new());
    let store = RecordStore::open(cache.clone(), StorePolicy::default()).await;
    (store, cache)
}

#[tokio::test]
async fn test_repeated_update_only_advances_timestamp() {
    let (store, _) = memory_store().await;
    let patch = SlicePatch::new().set("height", "140").set("weight", "32");

    store.update_department(Department::General, patch.clone()).await.unwrap();
    let first = store.get();
    store.update_department(Department::General, patch).await.unwrap();
    let second = store.get();

    assert_eq!(first.departments, second.departments);
    assert!(second.last_updated > first.last_updated);
}

#[tokio::test]
async fn test_clear_example() {
    let (store, _) = memory_store().await;
    store
        .update_department(
            Department::Dental,
            SlicePatch::new().set("plaque", "Present").set("stains", "Absent"),
        )
        .await
        .unwrap();
    store
        .update_department(Department::Dental, SlicePatch::new().clear("plaque"))
        .await
        .unwrap();

    assert_eq!(
        slice_fields(&store.get(), Department::Dental),
        BTreeMap::from([("stains".to_string(), json!("Absent"))])
    );
}

#[tokio::test]
async fn test_tooth_toggle_keeps_other_groups() {
    let (store, _) = memory_store().await;
    store
        .update_department(
            Department::Dental,
            SlicePatch::new().set("toothCavityPermanent", "11,21"),
        )
        .await
        .unwrap();

    assert!(!store.toggle_tooth(Dentition::Permanent, "11").await.unwrap());
    assert_eq!(
        store.get().slice(Department::Dental).and_then(|s| s.get_str("toothCavityPermanent")),
        Some("21")
    );

    assert!(store.toggle_tooth(Dentition::Permanent, "11").await.unwrap());
    assert_eq!(
        store.get().slice(Department::Dental).and_then(|s| s.get_str("toothCavityPermanent")),
        Some("11,21")
    );
}

#[tokio::test]
async fn test_full_reset_clears_record_and_cache() {
    let (store, cache) = memory_store().await;
    store.set_department_id("P7").await.unwrap();
    store
        .update_department(Department::Vision, SlicePatch::new().set("re_vision", "6/9"))
        .await
        .unwrap();
    assert!(cache.load().await.unwrap().is_some());

    store.reset_department(None).await;

    let record = store.get();
    assert!(record.patient_id.is_none());
    assert!(record.departments.is_empty());
    assert!(cache.load().await.unwrap().is_none());
}

#[tokio::test]
async fn test_department_reset_preserves_siblings() {
    let (store, _) = memory_store().await;
    store.set_department_id("P8").await.unwrap();
    for department in Department::ALL {
        store
            .update_department(department, SlicePatch::new().set("marker", department.as_str()))
            .await
            .unwrap();
    }

    store.reset_department(Some(Department::Vision)).await;

    let record = store.get();
    assert_eq!(record.patient_id.as_deref(), Some("P8"));
    assert!(record.slice(Department::Vision).is_none());
    for department in [Department::It, Department::Ent, Department::General, Department::Dental] {
        assert_eq!(
            record.slice(department).and_then(|s| s.get_str("marker")),
            Some(department.as_str())
        );
    }
}

#[tokio::test]
async fn test_photo_update_is_broadcast_separately() {
    let (store, _) = memory_store().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    store.attach_channel(tx);

    store
        .update_department(
            Department::It,
            SlicePatch::new()
                .set("photo", "iVBORw0KGgo=")
                .set("photoFileName", "student.png")
                .set("name", "foo"),
        )
        .await
        .unwrap();

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert!(rx.try_recv().is_err());

    assert!(matches!(
        first,
        ChannelMessage::PhotoUpdate(ref photo) if photo.photo == "iVBORw0KGgo="
    ));
    match second {
        ChannelMessage::DepartmentUpdate(patches) => {
            let patch = patches.get(&Department::It).cloned().flatten().unwrap();
            assert_eq!(patch.get("name"), Some(&Some(json!("foo"))));
            assert!(!patch.contains("photo"));
        }
        other => panic!("unexpected message {other:?}"),
    }

    let slice = store.get().slice(Department::It).cloned().unwrap();
    assert_eq!(slice.get_str("photo"), Some("iVBORw0KGgo="));
    assert_eq!(slice.get_str("name"), Some("foo"));
}

#[tokio::test]
async fn test_record_survives_reload() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig {
        db_path: dir.path().join("cache.db").to_str().unwrap().to_string(),
        ..CacheConfig::default()
    };

    let cache = Arc::new(SqliteRecordCache::new(&config).await.unwrap());
    let store = RecordStore::open(cache, StorePolicy::default()).await;
    store.set_department_id("P42").await.unwrap();
    store
        .update_department(Department::Ent, SlicePatch::new().set("throat", "Normal").submitted())
        .await
        .unwrap();
    store
        .update_department(Department::Dental, SlicePatch::new().set("toothCavityPrimary", "61,55"))
        .await
        .unwrap();
    let before = store.get();
    drop(store);

    let cache = Arc::new(SqliteRecordCache::new(&config).await.unwrap());
    let reloaded = RecordStore::open(cache, StorePolicy::default()).await;
    assert_eq!(reloaded.get(), before);
}
