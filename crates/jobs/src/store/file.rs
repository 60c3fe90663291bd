use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use csvforge_core::{ClientId, JobId};

use super::{JobCounts, JobIndex, JobStore, JobStoreError, JobTable, Jobs, Mutator};
use crate::types::{JobFilter, JobRecord, JobStatus};

/// Job store persisted as one JSON document: live records keyed by job id
/// next to the ids of removed records.
///
/// Every mutation writes the complete next snapshot to `<file>.tmp`, syncs it
/// and renames it over the live file before the in-memory index changes, so
/// the file on disk always holds the last committed state in full.
///
/// Records found `running` when the file is opened belonged to a process that
/// died mid-job; they are closed as `failed` / `interrupted`.
#[derive(Debug)]
pub struct FileJobStore {
    table: JobTable,
    path: PathBuf,
    recovered: Vec<JobId>,
}

impl FileJobStore {
    /// Load (or start) the store at `path` and reconcile interrupted jobs.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JobStoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| storage_error(parent, e))?;
        }

        let tmp = tmp_path(&path);
        match fs::remove_file(&tmp) {
            Ok(()) => warn!(path = %tmp.display(), "discarded incomplete snapshot"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(storage_error(&tmp, e)),
        }

        let mut index = load_snapshot(&path)?;
        let recovered = reconcile_interrupted(&mut index.jobs, Utc::now());
        if !recovered.is_empty() {
            write_snapshot(&path, &index)?;
            for id in &recovered {
                warn!(job_id = %id, "job was running when the previous process stopped; marked interrupted");
            }
        }
        info!(
            path = %path.display(),
            jobs = index.jobs.len(),
            retired = index.retired.len(),
            recovered = recovered.len(),
            "job store opened"
        );

        Ok(Self {
            table: JobTable::from_index(index),
            path,
            recovered,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Jobs that were reconciled to `interrupted` when the store was opened.
    pub fn recovered(&self) -> &[JobId] {
        &self.recovered
    }

    fn commit(&self) -> impl FnOnce(&JobIndex) -> Result<(), JobStoreError> + '_ {
        move |index| write_snapshot(&self.path, index)
    }
}

impl JobStore for FileJobStore {
    fn create(&self, job: JobRecord) -> Result<JobId, JobStoreError> {
        self.table.create(job, self.commit())
    }

    fn get(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        self.table.get(job_id)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        Ok(self.table.list(filter))
    }

    fn update(&self, job_id: JobId, mutator: Mutator<'_>) -> Result<JobRecord, JobStoreError> {
        self.table.update(job_id, mutator, self.commit())
    }

    fn delete(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        self.table.delete(job_id, self.commit())
    }

    fn latest_trained(&self, client_id: ClientId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.table.latest_trained(client_id))
    }

    fn purge_finished(
        &self,
        cutoff: DateTime<Utc>,
        retain: &dyn Fn(&JobRecord) -> bool,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        self.table.purge_finished(cutoff, retain, self.commit())
    }

    fn clients(&self) -> Result<Vec<ClientId>, JobStoreError> {
        Ok(self.table.clients())
    }

    fn counts(&self) -> Result<JobCounts, JobStoreError> {
        Ok(self.table.counts())
    }
}

fn storage_error(path: &Path, err: impl std::fmt::Display) -> JobStoreError {
    JobStoreError::StorageUnavailable(format!("{}: {err}", path.display()))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[derive(Debug, Deserialize)]
struct StoredSnapshot {
    #[serde(default)]
    jobs: HashMap<JobId, JobRecord>,
    #[serde(default)]
    retired: BTreeSet<JobId>,
}

// Sorted keys keep the file diffable.
#[derive(Debug, Serialize)]
struct SnapshotView<'a> {
    jobs: BTreeMap<&'a JobId, &'a JobRecord>,
    retired: &'a BTreeSet<JobId>,
}

fn load_snapshot(path: &Path) -> Result<JobIndex, JobStoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(JobIndex::default()),
        Err(e) => return Err(storage_error(path, e)),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(JobIndex::default());
    }
    let snapshot: StoredSnapshot =
        serde_json::from_slice(&bytes).map_err(|e| storage_error(path, e))?;
    if let Some((key, job)) = snapshot.jobs.iter().find(|(key, job)| **key != job.id) {
        return Err(storage_error(
            path,
            format!("entry {key} holds record {}", job.id),
        ));
    }
    if let Some(id) = snapshot.retired.iter().find(|id| snapshot.jobs.contains_key(id)) {
        return Err(storage_error(path, format!("job {id} is both live and retired")));
    }
    Ok(JobIndex {
        jobs: snapshot.jobs,
        retired: snapshot.retired,
    })
}

fn write_snapshot(path: &Path, index: &JobIndex) -> Result<(), JobStoreError> {
    let view = SnapshotView {
        jobs: index.jobs.iter().collect(),
        retired: &index.retired,
    };
    let bytes = serde_json::to_vec_pretty(&view).map_err(|e| storage_error(path, e))?;

    let tmp = tmp_path(path);
    let mut file = File::create(&tmp).map_err(|e| storage_error(&tmp, e))?;
    file.write_all(&bytes).map_err(|e| storage_error(&tmp, e))?;
    file.sync_all().map_err(|e| storage_error(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| storage_error(path, e))?;
    sync_parent(path);
    Ok(())
}

/// Make the rename itself durable where the platform allows it.
#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            warn!(path = %parent.display(), error = %e, "failed to sync store directory");
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

fn reconcile_interrupted(jobs: &mut Jobs, now: DateTime<Utc>) -> Vec<JobId> {
    let mut recovered: Vec<JobId> = jobs
        .values_mut()
        .filter(|job| job.status == JobStatus::Running)
        .map(|job| {
            job.mark_interrupted("process stopped while the job was running", now);
            job.updated_at = job.updated_at.max(now);
            job.id
        })
        .collect();
    recovered.sort();
    recovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use csvforge_core::ArtifactRef;
    use csvforge_engine::FailureKind;

    fn artifact(s: &str) -> ArtifactRef {
        ArtifactRef::new(s).unwrap()
    }

    fn training() -> JobRecord {
        JobRecord::training(ClientId::new(), artifact("in.csv"), artifact("expected.csv"))
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path().join("nested/jobs.json")).unwrap();
        assert_eq!(store.counts().unwrap().total(), 0);
        assert!(store.recovered().is_empty());
    }

    #[test]
    fn committed_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let id = {
            let store = FileJobStore::open(&path).unwrap();
            let id = store.create(training()).unwrap();
            finish(&store, id);
            id
        };

        let reopened = FileJobStore::open(&path).unwrap();
        let job = reopened.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.script_ref, Some(artifact("s.py")));
        assert!(!tmp_path(&path).exists());
    }

    fn finish(store: &FileJobStore, id: JobId) {
        store
            .update(id, &mut |job| {
                job.start_run()?;
                job.begin_attempt()?;
                Ok(())
            })
            .unwrap();
        store
            .update(id, &mut |job| {
                job.record_success(artifact("s.py"), artifact("o.csv"), Utc::now())?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn snapshot_is_keyed_by_job_id_with_rfc3339_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let store = FileJobStore::open(&path).unwrap();
        let id = store.create(training()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let entry = &raw["jobs"][id.to_string()];
        assert_eq!(entry["status"], "queued");
        let created = entry["created_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(created).is_ok());
        assert_eq!(raw["retired"], serde_json::json!([]));
    }

    #[test]
    fn removed_ids_stay_reserved_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let (deleted, purged) = {
            let store = FileJobStore::open(&path).unwrap();
            let deleted = training();
            let purged = training();
            finish(&store, store.create(deleted.clone()).unwrap());
            finish(&store, store.create(purged.clone()).unwrap());
            store.delete(deleted.id).unwrap();
            store
                .purge_finished(Utc::now() + chrono::Duration::seconds(1), &|_| false)
                .unwrap();
            (deleted, purged)
        };

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["retired"].as_array().unwrap().len(), 2);

        let store = FileJobStore::open(&path).unwrap();
        assert_eq!(store.counts().unwrap().total(), 0);
        for job in [deleted, purged] {
            assert_eq!(store.create(job.clone()), Err(JobStoreError::AlreadyExists(job.id)));
        }
    }

    #[test]
    fn snapshot_with_a_live_and_retired_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let job = training();
        let id = job.id;
        {
            let store = FileJobStore::open(&path).unwrap();
            store.create(job).unwrap();
        }
        let mut raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        raw["retired"] = serde_json::json!([id]);
        fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        let err = FileJobStore::open(&path).unwrap_err();
        assert!(matches!(err, JobStoreError::StorageUnavailable(msg) if msg.contains("retired")));
    }

    #[test]
    fn running_jobs_are_interrupted_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let (running, queued) = {
            let store = FileJobStore::open(&path).unwrap();
            let running = store.create(training()).unwrap();
            let queued = store.create(training()).unwrap();
            store
                .update(running, &mut |job| {
                    job.start_run()?;
                    job.begin_attempt()?;
                    Ok(())
                })
                .unwrap();
            (running, queued)
        };

        let store = FileJobStore::open(&path).unwrap();
        assert_eq!(store.recovered(), &[running]);

        let job = store.get(running).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.last_error.as_ref().unwrap();
        assert_eq!(error.kind, FailureKind::Interrupted);
        assert_eq!(job.feedback_history.len() as u32, job.attempt_count);
        assert!(job.check_invariants().is_ok());

        assert_eq!(store.get(queued).unwrap().status, JobStatus::Queued);

        // The reconciliation itself was persisted.
        let again = FileJobStore::open(&path).unwrap();
        assert!(again.recovered().is_empty());
        assert_eq!(again.get(running).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn leftover_tmp_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let id = {
            let store = FileJobStore::open(&path).unwrap();
            store.create(training()).unwrap()
        };
        fs::write(tmp_path(&path), b"{ \"torn\": ").unwrap();

        let store = FileJobStore::open(&path).unwrap();
        assert!(store.get(id).is_ok());
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn corrupt_snapshot_is_reported_not_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        fs::write(&path, b"[1, 2").unwrap();

        let err = FileJobStore::open(&path).unwrap_err();
        assert!(matches!(err, JobStoreError::StorageUnavailable(_)));
        assert_eq!(fs::read(&path).unwrap(), b"[1, 2");
    }

    #[test]
    fn failed_write_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let store = FileJobStore::open(&path).unwrap();
        let kept = store.create(training()).unwrap();
        let done = store.create(training()).unwrap();
        finish(&store, done);
        let before = fs::read(&path).unwrap();

        // A directory in the way of the temporary file fails every write.
        fs::create_dir(tmp_path(&path)).unwrap();

        let err = store
            .update(kept, &mut |job| {
                job.start_run()?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, JobStoreError::StorageUnavailable(_)));
        assert_eq!(store.get(kept).unwrap().status, JobStatus::Queued);

        let extra = training();
        let err = store.create(extra.clone()).unwrap_err();
        assert!(matches!(err, JobStoreError::StorageUnavailable(_)));
        assert!(matches!(store.get(extra.id), Err(JobStoreError::NotFound(_))));

        let err = store.delete(done).unwrap_err();
        assert!(matches!(err, JobStoreError::StorageUnavailable(_)));
        assert_eq!(store.get(done).unwrap().status, JobStatus::Succeeded);

        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(store.counts().unwrap().total(), 2);

        // Nothing rejected above was retired: the same writes succeed once
        // the path is clear.
        fs::remove_dir(tmp_path(&path)).unwrap();
        store.create(extra.clone()).unwrap();
        store.delete(done).unwrap();

        let reopened = FileJobStore::open(&path).unwrap();
        assert_eq!(reopened.get(kept).unwrap().status, JobStatus::Queued);
        assert!(reopened.get(extra.id).is_ok());
        assert!(matches!(reopened.get(done), Err(JobStoreError::NotFound(_))));
    }
}
