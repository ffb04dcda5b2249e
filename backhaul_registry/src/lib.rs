//! The registry: claims a remote namespace for one password, logs
//! completed backups, and carries the score-set version.
//!
//! A single marker record per bucket/domain holds the scrypt salt, a
//! small encrypted probe, and the score-set version. Opening the registry
//! either writes the marker (first ever run, guarded by a precondition so
//! concurrent claims cannot both win) or re-derives the key and decrypts
//! the probe to prove the password matches. The crypter that results is
//! the one used for every blob in the process.

mod crypto;

pub use crypto::{GcmCrypter, KEY_LEN, derive_crypter};

use std::sync::Arc;

use anyhow::{Context, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use rand::RngCore;

use backhaul_core::error::{IncompatibleCredential, NotAuthentic, NotFound, is_kind};
use backhaul_core::records::attrs;
use backhaul_core::timefmt::{format_utc, parse_utc};
use backhaul_core::{Crypter, Precondition, Record, RecordStore, Result, Score};

const MARKER_KEY: &str = "marker";
const SALT_ATTR: &str = "password_salt";
const DATA_ATTR: &str = "encrypted_data";
const VERSION_ATTR: &str = "score_set_version";

const JOB_KEY_PREFIX: &str = "backup_";
const JOB_NAME_ATTR: &str = "job_name";
const START_TIME_ATTR: &str = "start_time";
const SCORE_ATTR: &str = "score";

const MAX_JOB_NAME_BYTES: usize = 1024;
const SALT_LEN: usize = 8;
const PROBE_LEN: usize = 8;

/// One finished backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedJob {
    pub id: u64,
    pub name: String,
    pub start_time: DateTime<Utc>,
    /// Score of the root listing.
    pub score: Score,
}

/// Handle on a claimed bucket/domain.
pub struct Registry {
    records: Arc<dyn RecordStore>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

fn job_key(id: u64) -> String {
    format!("{JOB_KEY_PREFIX}{id:016x}")
}

fn require<'a>(record: &'a Record, key: &str, attr: &str) -> Result<&'a str> {
    record
        .get(attr)
        .map(String::as_str)
        .with_context(|| format!("record {key:?} is missing attribute {attr:?}"))
}

impl Registry {
    /// Open the registry, claiming the domain on first use or verifying
    /// the password against the existing marker. Returns the crypter to
    /// use for every blob in this process.
    pub async fn open(
        records: Arc<dyn RecordStore>,
        password: &str,
    ) -> Result<(Self, Arc<GcmCrypter>)> {
        let marker = records.get(MARKER_KEY).await.context("reading marker")?;

        let crypter = match marker.filter(|m| m.contains_key(SALT_ATTR)) {
            Some(marker) => Self::verify_marker(&marker, password)?,
            None => Self::claim(records.as_ref(), password).await?,
        };

        Ok((Self { records }, Arc::new(crypter)))
    }

    fn verify_marker(marker: &Record, password: &str) -> Result<GcmCrypter> {
        let salt = BASE64
            .decode(require(marker, MARKER_KEY, SALT_ATTR)?)
            .context("marker salt is not valid base64")?;
        let ciphertext = BASE64
            .decode(require(marker, MARKER_KEY, DATA_ATTR)?)
            .context("marker ciphertext is not valid base64")?;

        let crypter = derive_crypter(password, &salt)?;
        match crypter.decrypt(&ciphertext) {
            Ok(_) => Ok(crypter),
            Err(err) if is_kind::<NotAuthentic>(&err) => Err(IncompatibleCredential.into()),
            Err(err) => Err(err.context("decrypting marker")),
        }
    }

    async fn claim(records: &dyn RecordStore, password: &str) -> Result<GcmCrypter> {
        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);
        let mut probe = [0u8; PROBE_LEN];
        rand::rng().fill_bytes(&mut probe);

        let crypter = derive_crypter(password, &salt)?;
        let ciphertext = crypter.encrypt(&probe)?;

        tracing::info!("claiming domain with a fresh marker");
        records
            .put(
                MARKER_KEY,
                &attrs(&[
                    (SALT_ATTR, &BASE64.encode(salt)),
                    (DATA_ATTR, &BASE64.encode(ciphertext)),
                ]),
                Some(&Precondition::AttributeAbsent(SALT_ATTR.to_string())),
            )
            .await
            .context("another process claimed this domain concurrently")?;

        Ok(crypter)
    }

    /// Record a completed backup. Retrying the identical record is a
    /// no-op; recording a different score under an existing id is an
    /// error.
    pub async fn record_backup(&self, job: &CompletedJob) -> Result<()> {
        if job.name.is_empty() || job.name.len() > MAX_JOB_NAME_BYTES {
            bail!(
                "job name must be 1..={MAX_JOB_NAME_BYTES} bytes, got {}",
                job.name.len()
            );
        }

        let key = job_key(job.id);
        let result = self
            .records
            .put(
                &key,
                &attrs(&[
                    (JOB_NAME_ATTR, &job.name),
                    (START_TIME_ATTR, &format_utc(job.start_time)),
                    (SCORE_ATTR, &job.score.to_hex()),
                ]),
                Some(&Precondition::AttributeAbsent(SCORE_ATTR.to_string())),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) if is_kind::<backhaul_core::error::PreconditionFailed>(&err) => {
                let existing = self.find_backup(job.id).await?;
                if existing.score == job.score {
                    Ok(())
                } else {
                    bail!(
                        "backup {:016x} already recorded with score {}, refusing {}",
                        job.id,
                        existing.score,
                        job.score
                    );
                }
            }
            Err(err) => Err(err.context("recording backup")),
        }
    }

    /// All recorded backups, most recent first. Malformed records are an
    /// error naming the offender.
    pub async fn list_recent_backups(&self) -> Result<Vec<CompletedJob>> {
        let records = self
            .records
            .list_desc(JOB_KEY_PREFIX, START_TIME_ATTR)
            .await
            .context("listing backups")?;

        records
            .into_iter()
            .map(|(key, record)| parse_job(&key, &record))
            .collect()
    }

    /// Fetch one recorded backup by id.
    pub async fn find_backup(&self, id: u64) -> Result<CompletedJob> {
        let key = job_key(id);
        let record = self.records.get(&key).await?.ok_or_else(|| {
            anyhow::Error::new(NotFound).context(format!("no backup recorded under id {id:016x}"))
        })?;
        parse_job(&key, &record)
    }

    /// Current score-set version; zero when never written.
    pub async fn score_set_version(&self) -> Result<u64> {
        let marker = self.records.get(MARKER_KEY).await?;
        match marker.as_ref().and_then(|m| m.get(VERSION_ATTR)) {
            Some(raw) => u64::from_str_radix(raw, 16)
                .with_context(|| format!("marker holds a malformed version {raw:?}")),
            None => Ok(0),
        }
    }

    /// Compare-and-swap the score-set version from `last` to `new`.
    /// Fails with the precondition kind when another writer got there
    /// first.
    pub async fn update_score_set_version(&self, new: u64, last: u64) -> Result<()> {
        let expected = if last == 0 {
            None
        } else {
            Some(format!("{last:016x}"))
        };
        self.records
            .put(
                MARKER_KEY,
                &attrs(&[(VERSION_ATTR, &format!("{new:016x}"))]),
                Some(&Precondition::AttributeEquals(
                    VERSION_ATTR.to_string(),
                    expected,
                )),
            )
            .await
    }
}

fn parse_job(key: &str, record: &Record) -> Result<CompletedJob> {
    let id_hex = key
        .strip_prefix(JOB_KEY_PREFIX)
        .with_context(|| format!("record key {key:?} is not a backup key"))?;
    let id = u64::from_str_radix(id_hex, 16)
        .with_context(|| format!("record key {key:?} has a malformed id"))?;

    let name = require(record, key, JOB_NAME_ATTR)?;
    if name.is_empty() || name.len() > MAX_JOB_NAME_BYTES {
        bail!("record {key:?} has an invalid job name");
    }

    let start_time = parse_utc(require(record, key, START_TIME_ATTR)?)
        .with_context(|| format!("record {key:?} has a malformed start time"))?;

    let score: Score = require(record, key, SCORE_ATTR)?
        .parse()
        .map_err(|e| anyhow::anyhow!("record {key:?} has a malformed score: {e}"))?;

    Ok(CompletedJob {
        id,
        name: name.to_string(),
        start_time,
        score,
    })
}

// Re-exported for callers that pattern-match registry failures.
pub use backhaul_core::error::PreconditionFailed;
