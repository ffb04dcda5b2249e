//! Persistent run state for Backhaul.
//!
//! Two pieces survive between runs:
//!
//! - the **existing-scores set**: scores known durable in the object
//!   store, letting the blob stack skip redundant uploads, and
//! - the **score map**: a stat cache mapping file identity to chunk
//!   scores, letting the backup skip re-reading unchanged files.
//!
//! Both are carried in a [`PersistentState`] snapshot with a version
//! number checked against the registry's score-set version, so a run can
//! detect that another writer made its local view stale.

mod score_map;
mod state;

pub use score_map::{ScoreMap, ScoreMapKey};
pub use state::PersistentState;
