//! Local durable [`RecordStore`] backed by a redb database.
//!
//! Records are stored under their key as CBOR-encoded attribute maps.
//! Preconditions are checked inside the write transaction, which is what
//! makes conditional puts atomic here.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use backhaul_core::records::check_precondition;
use backhaul_core::{Precondition, Record, RecordStore, Result};

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

#[derive(Clone)]
pub struct RedbRecordStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbRecordStore").finish()
    }
}

impl RedbRecordStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Database::create(path.as_ref()).context("opening record database")?;

        // Create the table up front so a fresh database serves reads.
        {
            let write_txn = db.begin_write()?;
            {
                let _ = write_txn.open_table(RECORDS)?;
            }
            write_txn.commit()?;
        }

        Ok(Self { db: Arc::new(db) })
    }
}

fn decode_record(bytes: &[u8]) -> Result<Record> {
    minicbor::decode(bytes).map_err(|e| anyhow::anyhow!("decoding record: {e}"))
}

fn encode_record(record: &Record) -> Result<Vec<u8>> {
    minicbor::to_vec(record).map_err(|e| anyhow::anyhow!("encoding record: {e}"))
}

#[async_trait]
impl RecordStore for RedbRecordStore {
    async fn get(&self, key: &str) -> Result<Option<Record>> {
        let db = self.db.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<Record>> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(RECORDS)?;
            table
                .get(key.as_str())?
                .map(|guard| decode_record(guard.value()))
                .transpose()
        })
        .await
        .map_err(|e| anyhow::anyhow!("redb read task failed: {e}"))?
    }

    async fn put(
        &self,
        key: &str,
        attrs: &[(String, String)],
        precondition: Option<&Precondition>,
    ) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_string();
        let attrs = attrs.to_vec();
        let precondition = precondition.cloned();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(RECORDS)?;

                let current = table
                    .get(key.as_str())?
                    .map(|guard| decode_record(guard.value()))
                    .transpose()?;

                if let Some(precondition) = &precondition {
                    check_precondition(&key, current.as_ref(), precondition)?;
                }

                let mut record = current.unwrap_or_default();
                for (name, value) in attrs {
                    record.insert(name, value);
                }
                table.insert(key.as_str(), encode_record(&record)?.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("redb write task failed: {e}"))?
    }

    async fn list_desc(&self, prefix: &str, order_attr: &str) -> Result<Vec<(String, Record)>> {
        let db = self.db.clone();
        let prefix = prefix.to_string();
        let order_attr = order_attr.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<(String, Record)>> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(RECORDS)?;

            let mut matching = Vec::new();
            for item in table.iter()? {
                let (key, value) = item?;
                if !key.value().starts_with(&prefix) {
                    continue;
                }
                matching.push((key.value().to_string(), decode_record(value.value())?));
            }
            matching.sort_by(|(_, a), (_, b)| {
                compare_desc(a.get(&order_attr), b.get(&order_attr))
            });
            Ok(matching)
        })
        .await
        .map_err(|e| anyhow::anyhow!("redb list task failed: {e}"))?
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
