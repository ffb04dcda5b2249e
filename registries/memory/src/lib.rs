//! In-memory [`RecordStore`] used by tests.
//!
//! One mutex over the whole map makes the precondition check and the
//! write a single atomic step, which is the contract conditional puts
//! rely on.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use backhaul_core::records::check_precondition;
use backhaul_core::{Precondition, Record, RecordStore, Result};

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<String, Record>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, key: &str) -> Result<Option<Record>> {
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        attrs: &[(String, String)],
        precondition: Option<&Precondition>,
    ) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let current = records.get(key);
        if let Some(precondition) = precondition {
            check_precondition(key, current, precondition)?;
        }
        let record = records.entry(key.to_string()).or_default();
        for (name, value) in attrs {
            record.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    async fn list_desc(&self, prefix: &str, order_attr: &str) -> Result<Vec<(String, Record)>> {
        let records = self.records.lock().unwrap();
        let mut matching: Vec<(String, Record)> = records
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        matching.sort_by(|(_, a), (_, b)| compare_desc(a.get(order_attr), b.get(order_attr)));
        Ok(matching)
    }
}

fn compare_desc(a: Option<&String>, b: Option<&String>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_core::error::{PreconditionFailed, is_kind};
    use backhaul_core::records::attrs;

    #[tokio::test]
    async fn put_merges_attributes() {
        let store = MemoryRecordStore::new();
        store
            .put("marker", &attrs(&[("salt", "abc")]), None)
            .await
            .unwrap();
        store
            .put("marker", &attrs(&[("version", "1")]), None)
            .await
            .unwrap();

        let record = store.get("marker").await.unwrap().unwrap();
        assert_eq!(record.get("salt").unwrap(), "abc");
        assert_eq!(record.get("version").unwrap(), "1");
    }

    #[tokio::test]
    async fn absent_precondition_blocks_rewrites() {
        let store = MemoryRecordStore::new();
        let guard = Precondition::AttributeAbsent("salt".to_string());

        store
            .put("marker", &attrs(&[("salt", "abc")]), Some(&guard))
            .await
            .unwrap();

        let err = store
            .put("marker", &attrs(&[("salt", "def")]), Some(&guard))
            .await
            .unwrap_err();
        assert!(is_kind::<PreconditionFailed>(&err));

        // The losing write changed nothing.
        let record = store.get("marker").await.unwrap().unwrap();
        assert_eq!(record.get("salt").unwrap(), "abc");
    }

    #[tokio::test]
    async fn equals_precondition_implements_cas() {
        let store = MemoryRecordStore::new();
        let from_absent = Precondition::AttributeEquals("v".to_string(), None);
        store
            .put("marker", &attrs(&[("v", "1")]), Some(&from_absent))
            .await
            .unwrap();

        // A second writer still expecting absence loses.
        let err = store
            .put("marker", &attrs(&[("v", "2")]), Some(&from_absent))
            .await
            .unwrap_err();
        assert!(is_kind::<PreconditionFailed>(&err));

        let from_one = Precondition::AttributeEquals("v".to_string(), Some("1".to_string()));
        store
            .put("marker", &attrs(&[("v", "2")]), Some(&from_one))
            .await
            .unwrap();
        let record = store.get("marker").await.unwrap().unwrap();
        assert_eq!(record.get("v").unwrap(), "2");
    }

    #[tokio::test]
    async fn list_desc_orders_by_attribute() {
        let store = MemoryRecordStore::new();
        for (key, time) in [
            ("backup_01", "2012-08-15T22:56:00Z"),
            ("backup_02", "2015-03-18T17:08:00Z"),
            ("backup_03", "2013-06-17T20:57:00Z"),
        ] {
            store
                .put(key, &attrs(&[("start_time", time)]), None)
                .await
                .unwrap();
        }
        store.put("marker", &attrs(&[("salt", "x")]), None).await.unwrap();

        let listed = store.list_desc("backup_", "start_time").await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["backup_02", "backup_03", "backup_01"]);
    }
}
