//! Command implementations and wiring.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use backhaul_backup::{
    CachingSaver, DirRestorer, DirSaver, FileSaver, TreeRestorer, TreeSaver,
};
use backhaul_blobs::StackConfig;
use backhaul_core::{BlobStore, ObjectStore, RecordStore, Result, Score};
use backhaul_fs::{FileSystem, LocalFileSystem, LocalOwnerLookup};
use backhaul_registry::{CompletedJob, GcmCrypter, Registry};
use backhaul_registry_redb::RedbRecordStore;
use backhaul_state::{PersistentState, ScoreMap};
use backhaul_store_s3::{S3ObjectStore, S3StoreConfig};
use backhaul_verify::{Node, Verifier};

use crate::config::Config;

const BLOB_PREFIX: &str = "blobs/";

/// Everything a command needs once the registry is open.
pub struct Session {
    pub objects: Arc<dyn ObjectStore>,
    pub registry: Registry,
    pub crypter: Arc<GcmCrypter>,
    pub state_path: PathBuf,
    pub cancel: CancellationToken,
}

pub async fn open_session(config: &Config, cancel: CancellationToken) -> Result<Session> {
    let objects: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::create(S3StoreConfig {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
            access_key_id: config.access_key_id.clone(),
            access_key_secret: config.access_key_secret.clone(),
        })
        .context("opening object store")?,
    );

    let state_dir = config.state_dir();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state directory {state_dir:?}"))?;

    let records: Arc<dyn RecordStore> = Arc::new(
        RedbRecordStore::open(state_dir.join(format!("{}.redb", config.domain)))
            .context("opening record store")?,
    );

    let password = read_password()?;
    let (registry, crypter) = Registry::open(records, &password).await?;

    Ok(Session {
        objects,
        registry,
        crypter,
        state_path: state_dir.join(format!("{}.state", config.domain)),
        cancel,
    })
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var("BACKHAUL_PASSWORD") {
        return Ok(password);
    }
    eprint!("Password: ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading password")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("password must be non-empty");
    }
    Ok(password)
}

fn build_stack(session: &Session, state: &PersistentState) -> Arc<dyn BlobStore> {
    backhaul_blobs::build(
        Arc::clone(&session.objects),
        session.crypter.clone(),
        Arc::clone(&state.existing_scores),
        StackConfig {
            prefix: BLOB_PREFIX.to_string(),
            ..StackConfig::default()
        },
        session.cancel.clone(),
    )
}

/// Load saved state and reconcile it with the registry's score-set
/// version. A version mismatch means another process changed the store
/// since this state was written; its score set can no longer be trusted.
async fn load_state(session: &Session) -> Result<PersistentState> {
    let mut state = PersistentState::load_from_path(&session.state_path)?;
    let current = session.registry.score_set_version().await?;
    if state.score_set_version != current {
        tracing::warn!(
            saved = state.score_set_version,
            current,
            "score-set version changed; discarding local known-score set"
        );
        state = PersistentState {
            existing_scores: Arc::new(dashmap::DashSet::new()),
            score_set_version: current,
            score_map: state.score_map,
        };
    }
    Ok(state)
}

pub async fn save(config: &Config, job_name: &str, session: Session) -> Result<()> {
    let job = config.job(job_name)?;
    let excludes = job.compiled_excludes()?;

    let state = load_state(&session).await?;
    let last_version = state.score_set_version;
    let blobs = build_stack(&session, &state);

    let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
    let owners = Arc::new(LocalOwnerLookup::new());

    let sink_map = Arc::new(ScoreMap::new());
    let chunker = Arc::new(FileSaver::with_defaults(blobs.clone(), fs.clone()));
    let files = Arc::new(CachingSaver::new(
        chunker,
        fs.clone(),
        Arc::clone(&state.score_map),
        sink_map.clone(),
    ));
    let saver = TreeSaver::new(blobs.clone(), fs, owners, files);

    let started = Utc::now();
    tracing::info!(job = job_name, base = ?job.base_path, "starting save");
    let score = saver
        .save_dir(&job.base_path, Path::new(""), &excludes)
        .await?;
    blobs.flush().await.context("flushing blob writes")?;

    let completed = CompletedJob {
        id: rand::rng().random(),
        name: job_name.to_string(),
        start_time: started,
        score,
    };
    session.registry.record_backup(&completed).await?;

    // Bump the version so other processes notice their score sets are
    // stale, then persist ours under the new version.
    let new_version = rand::rng().random::<u64>().max(1);
    session
        .registry
        .update_score_set_version(new_version, last_version)
        .await
        .context("updating score-set version")?;

    let state = PersistentState {
        existing_scores: state.existing_scores,
        score_set_version: new_version,
        score_map: sink_map,
    };
    state.save_to_path(&session.state_path)?;

    println!("{:016x} {}", completed.id, score);
    tracing::info!(job = job_name, %score, id = completed.id, "save complete");
    Ok(())
}

pub async fn restore(id: u64, target: &Path, session: Session) -> Result<()> {
    if !target.is_dir() {
        bail!("restore target {target:?} must be an existing directory");
    }

    let state = load_state(&session).await?;
    let blobs = build_stack(&session, &state);
    let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
    let owners = Arc::new(LocalOwnerLookup::new());

    let job = session.registry.find_backup(id).await?;
    tracing::info!(id, job = %job.name, score = %job.score, "starting restore");

    let restorer = TreeRestorer::new(blobs, fs, owners);
    restorer
        .restore_dir(job.score, target, Path::new(""))
        .await?;

    tracing::info!(id, "restore complete");
    Ok(())
}

pub async fn verify(
    read_files: bool,
    concurrency: usize,
    structure_file: Option<&Path>,
    session: Session,
) -> Result<()> {
    let state = load_state(&session).await?;
    let blobs = build_stack(&session, &state);

    // The object store is the authority on which scores exist.
    let known = known_scores(session.objects.as_ref()).await?;
    tracing::info!(known = known.len(), "listed stored blobs");

    // Subtrees proven by an earlier run are skipped, and this run's
    // findings are folded back in for the next one.
    let mut verified_structure = HashMap::new();
    if let Some(path) = structure_file {
        match std::fs::File::open(path) {
            Ok(mut file) => {
                verified_structure = backhaul_verify::load_structure(&mut file)
                    .with_context(|| format!("loading structure {path:?}"))?;
                tracing::info!(subtrees = verified_structure.len(), "loaded verified structure");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(anyhow::Error::new(err).context(format!("opening {path:?}")));
            }
        }
    }

    let roots: Vec<Node> = session
        .registry
        .list_recent_backups()
        .await?
        .into_iter()
        .map(|job| Node::dir(job.score))
        .collect();
    if roots.is_empty() {
        println!("nothing to verify: no recorded backups");
        return Ok(());
    }

    let (tx, mut rx) = tokio::sync::mpsc::channel::<backhaul_verify::VisitRecord>(64);
    let progress = tokio::spawn(async move {
        let mut visited = 0usize;
        while rx.recv().await.is_some() {
            visited += 1;
            if visited % 1000 == 0 {
                tracing::info!(visited, "verifying");
            }
        }
    });

    let verifier = Verifier::new(
        blobs,
        known,
        verified_structure.clone(),
        read_files,
        concurrency,
        session.cancel.clone(),
    );
    let report = verifier.verify(roots, Some(tx)).await?;
    progress.await.ok();

    if let Some(path) = structure_file {
        let mut merged = verified_structure;
        merged.extend(report.structure.clone());
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("creating structure file {path:?}"))?;
        backhaul_verify::save_structure(&merged, &mut file)?;
        tracing::info!(subtrees = merged.len(), "saved verified structure");
    }

    println!("visited {} nodes", report.visited);
    if report.is_clean() {
        println!("verification passed");
        Ok(())
    } else {
        for (node, error) in &report.errors {
            println!("BAD {}: {error}", node.encode());
        }
        bail!("verification failed for {} nodes", report.errors.len());
    }
}

async fn known_scores(objects: &dyn ObjectStore) -> Result<HashSet<Score>> {
    let names = objects.list(BLOB_PREFIX).await.context("listing blobs")?;
    let mut known = HashSet::with_capacity(names.len());
    for name in names {
        let hex = name.strip_prefix(BLOB_PREFIX).unwrap_or(&name);
        let score: Score = hex
            .parse()
            .map_err(|e| anyhow::anyhow!("object {name:?} is not named by a score: {e}"))?;
        known.insert(score);
    }
    Ok(known)
}

pub async fn jobs(session: Session) -> Result<()> {
    let jobs = session.registry.list_recent_backups().await?;
    if jobs.is_empty() {
        println!("no backups recorded");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{:016x}  {}  {}  {}",
            job.id,
            backhaul_core::timefmt::format_utc(job.start_time),
            job.score,
            job.name
        );
    }
    Ok(())
}
