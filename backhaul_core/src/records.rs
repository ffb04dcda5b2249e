//! Attribute records with conditional writes.
//!
//! The registry keeps small records (the bucket marker, one record per
//! completed job) in a store supporting optimistic concurrency via
//! write preconditions. `registries/memory` backs tests; `registries/redb`
//! is the durable local implementation.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;

use crate::store::Result;

/// One record: a set of named UTF-8 attributes.
pub type Record = BTreeMap<String, String>;

/// Condition a [`RecordStore::put`] must atomically verify before writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The named attribute must not exist (the record itself may).
    AttributeAbsent(String),
    /// The named attribute must currently hold `Some(value)`, or be absent
    /// when `None`.
    AttributeEquals(String, Option<String>),
}

/// A store of attribute records keyed by name.
#[async_trait]
pub trait RecordStore: Debug + Send + Sync + 'static {
    /// Fetch the record called `key`, or `None` if it was never written.
    async fn get(&self, key: &str) -> Result<Option<Record>>;

    /// Merge `attrs` into the record called `key`, creating it if absent.
    ///
    /// Attributes not named in `attrs` keep their current values. When a
    /// precondition is supplied it is checked atomically with the write;
    /// failure surfaces as [`PreconditionFailed`](crate::error::PreconditionFailed)
    /// and leaves the record untouched.
    async fn put(
        &self,
        key: &str,
        attrs: &[(String, String)],
        precondition: Option<&Precondition>,
    ) -> Result<()>;

    /// All records whose key starts with `prefix`, ordered descending by
    /// the value of `order_attr`. Records lacking the attribute sort last.
    async fn list_desc(&self, prefix: &str, order_attr: &str) -> Result<Vec<(String, Record)>>;
}

/// Evaluate a precondition against the current state of a record.
///
/// Backends call this inside whatever makes their check-and-write atomic
/// (a mutex, a write transaction) so that all of them fail the same way.
pub fn check_precondition(
    key: &str,
    current: Option<&Record>,
    precondition: &Precondition,
) -> Result<()> {
    match precondition {
        Precondition::AttributeAbsent(name) => {
            if current.is_some_and(|record| record.contains_key(name)) {
                return Err(crate::error::PreconditionFailed(format!(
                    "record {key:?}: attribute {name:?} already exists"
                ))
                .into());
            }
        }
        Precondition::AttributeEquals(name, expected) => {
            let actual = current.and_then(|record| record.get(name));
            if actual.map(String::as_str) != expected.as_deref() {
                return Err(crate::error::PreconditionFailed(format!(
                    "record {key:?}: attribute {name:?} is {actual:?}, expected {expected:?}"
                ))
                .into());
            }
        }
    }
    Ok(())
}

/// Convenience for building `attrs` slices without repeating `.to_string()`.
pub fn attrs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
