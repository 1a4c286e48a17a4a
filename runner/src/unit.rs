use crate::sync::locking::{self, LockError, LOCK_TIMEOUT};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const INFO_FILE: &str = "info.json";
pub const LOCK_FILE: &str = "info.json.lock";

/// digest value recorded when the binary cannot be read
pub const DIGEST_UNAVAILABLE: &str = "-1";
/// return code recorded before the unit ever ran
pub const RETURN_CODE_UNSET: i32 = -1;
/// launch time recorded before the unit ever ran
pub const LAUNCH_TIME_UNSET: i64 = -1;

#[derive(Error, Debug)]
pub enum UnitError {
    #[error("status lock unavailable")]
    Lock(#[from] LockError),
    #[error("failed to encode status document")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write status document {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Run state of one experiment unit.
///
/// `Absent` is the in-memory state of a unit that was never launched; the
/// launch path only ever persists `Running` and `Finished`. A `Finished`
/// unit is success or failure depending on `return_code`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Absent,
    Running,
    Finished,
}

/// One invocation of the gem5 binary: fixed configuration plus mutable run
/// state. The on-disk document in the unit's output directory is the
/// durable source of truth; this struct is the working copy.
#[derive(Debug, Clone)]
pub struct ExperimentUnit {
    pub binary_path: PathBuf,
    pub config_path: PathBuf,
    pub output_path: PathBuf,
    pub gem5_params: IndexMap<String, String>,
    pub config_params: IndexMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub uuid: String,
    pub metadata: BTreeMap<String, String>,
    pub binary_hash: String,
    pub return_code: i32,
    pub launch_time: i64,
    pub status: RunStatus,
}

/// Wire form of the status record at `<output>/info.json`.
///
/// Every field is required; a document that fails to decode is treated as
/// "never validly run" by the rerun decision.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusDocument {
    pub gem5_binary_path: PathBuf,
    pub gem5_config_path: PathBuf,
    pub gem5_output_path: PathBuf,
    pub gem5_params: IndexMap<String, String>,
    pub config_params: IndexMap<String, String>,
    pub uuid: String,
    pub metadata: BTreeMap<String, String>,
    pub return_code: i32,
    pub launch_time: i64,
    pub env: BTreeMap<String, String>,
    pub gem5_binary_hash: String,
    pub status: RunStatus,
}

/// One field whose stored value no longer matches the current configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    pub field: &'static str,
    pub current: String,
    pub stored: String,
}

impl ExperimentUnit {
    pub fn new(
        binary_path: PathBuf,
        config_path: PathBuf,
        output_path: PathBuf,
        gem5_params: IndexMap<String, String>,
        config_params: IndexMap<String, String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        let binary_hash = file_digest(&binary_path);

        Self {
            binary_path,
            config_path,
            output_path,
            gem5_params,
            config_params,
            env,
            uuid: Uuid::new_v4().to_string(),
            metadata: BTreeMap::new(),
            binary_hash,
            return_code: RETURN_CODE_UNSET,
            launch_time: LAUNCH_TIME_UNSET,
            status: RunStatus::Absent,
        }
    }

    /// Rebuild a unit from a previously persisted document, keeping its
    /// identity and recorded run state. The binary hash is recomputed so a
    /// swapped binary shows up as drift.
    pub fn from_document(doc: StatusDocument) -> Self {
        let binary_hash = file_digest(&doc.gem5_binary_path);

        Self {
            binary_path: doc.gem5_binary_path,
            config_path: doc.gem5_config_path,
            output_path: doc.gem5_output_path,
            gem5_params: doc.gem5_params,
            config_params: doc.config_params,
            env: doc.env,
            uuid: doc.uuid,
            metadata: doc.metadata,
            binary_hash,
            return_code: doc.return_code,
            launch_time: doc.launch_time,
            status: doc.status,
        }
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn info_path(&self) -> PathBuf {
        self.output_path.join(INFO_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.output_path.join(LOCK_FILE)
    }

    pub fn document(&self) -> StatusDocument {
        StatusDocument {
            gem5_binary_path: self.binary_path.clone(),
            gem5_config_path: self.config_path.clone(),
            gem5_output_path: self.output_path.clone(),
            gem5_params: self.gem5_params.clone(),
            config_params: self.config_params.clone(),
            uuid: self.uuid.clone(),
            metadata: self.metadata.clone(),
            return_code: self.return_code,
            launch_time: self.launch_time,
            env: self.env.clone(),
            gem5_binary_hash: self.binary_hash.clone(),
            status: self.status,
        }
    }

    /// Rewrite the full status document under the status lock.
    ///
    /// The document is written to a temp file and renamed into place, so a
    /// reader under the same lock never observes a torn record. A lock
    /// timeout here is fatal for the caller: continuing would leave the
    /// on-disk and in-memory state divergent.
    pub fn persist(&self) -> Result<(), UnitError> {
        let info_path = self.info_path();
        let tmp_path = self.output_path.join(format!("{INFO_FILE}.tmp"));

        let _guard = locking::acquire(&self.lock_path(), LOCK_TIMEOUT)?;

        let payload = serde_json::to_vec_pretty(&self.document())?;
        fs::write(&tmp_path, payload).map_err(|source| UnitError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &info_path).map_err(|source| UnitError::Write {
            path: info_path.clone(),
            source,
        })
    }

    /// Decide whether this unit may be launched, from the on-disk record.
    ///
    /// No record, or a record too incomplete to trust, means the unit never
    /// validly ran and is fair game. A `running` marker means another
    /// controller owns the unit. A recorded success is never rerun; if the
    /// stored configuration differs from the current one the discrepancies
    /// are reported but the prior success stays authoritative. A recorded
    /// failure is rerun only when the caller opted in.
    pub fn is_rerunnable(&self, allow_rerun_after_failure: bool) -> bool {
        let info_path = self.info_path();

        if !self.output_path.exists() || !info_path.exists() {
            return true;
        }

        let _guard = match locking::acquire(&self.lock_path(), LOCK_TIMEOUT) {
            Ok(guard) => guard,
            Err(error) => {
                // conservative: someone else may own this unit right now
                warn!(path = ?info_path, %error, "could not lock status file, not rerunning");
                return false;
            }
        };

        let raw = match fs::read_to_string(&info_path) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(path = ?info_path, %error, "unreadable status document, treating as never run");
                return true;
            }
        };
        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(error) => {
                warn!(path = ?info_path, %error, "unparsable status document, treating as never run");
                return true;
            }
        };

        for key in ["status", "return_code"] {
            if value.get(key).is_none() {
                warn!(path = ?info_path, key, "incomplete status document, treating as never run");
                return true;
            }
        }

        if value.get("status").and_then(Value::as_str) == Some("running") {
            return false;
        }

        let stored: StatusDocument = match serde_json::from_value(value) {
            Ok(stored) => stored,
            Err(error) => {
                warn!(path = ?info_path, %error, "malformed status document, treating as never run");
                return true;
            }
        };

        if stored.return_code == 0 {
            let drift = self.config_drift(&stored);
            if !drift.is_empty() {
                warn!(
                    path = ?info_path,
                    "not rerunning a successful unit whose stored configuration differs"
                );
                for entry in &drift {
                    warn!(
                        field = entry.field,
                        current = %entry.current,
                        stored = %entry.stored,
                        "configuration drift"
                    );
                }
            }
            return false;
        }

        allow_rerun_after_failure
    }

    /// Compare the stored configuration of a trusted success against the
    /// current one, in a fixed field order, collecting every mismatch.
    pub(crate) fn config_drift(&self, stored: &StatusDocument) -> Vec<Drift> {
        let mut drift = Vec::new();
        let mut check = |field: &'static str, current: String, stored: String| {
            if current != stored {
                drift.push(Drift {
                    field,
                    current,
                    stored,
                });
            }
        };

        check(
            "gem5_binary_path",
            self.binary_path.display().to_string(),
            stored.gem5_binary_path.display().to_string(),
        );
        check(
            "gem5_output_path",
            self.output_path.display().to_string(),
            stored.gem5_output_path.display().to_string(),
        );
        check(
            "gem5_params",
            format!("{:?}", self.gem5_params),
            format!("{:?}", stored.gem5_params),
        );
        check(
            "gem5_binary_hash",
            self.binary_hash.clone(),
            stored.gem5_binary_hash.clone(),
        );
        check(
            "metadata",
            format!("{:?}", self.metadata),
            format!("{:?}", stored.metadata),
        );

        drift
    }
}

/// Hex sha256 of the file at `path`, [`DIGEST_UNAVAILABLE`] when the file
/// cannot be read.
pub fn file_digest(path: &Path) -> String {
    match hash_file(path) {
        Ok(digest) => digest,
        Err(error) => {
            warn!(path = ?path, %error, "failed to hash file");
            DIGEST_UNAVAILABLE.to_string()
        }
    }
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_unit(dir: &Path) -> ExperimentUnit {
        let binary = dir.join("gem5.opt");
        fs::write(&binary, b"gem5 binary bits").unwrap();
        let script = dir.join("config.py");
        fs::write(&script, b"# run script").unwrap();

        let mut gem5_params = IndexMap::new();
        gem5_params.insert("--debug-flags".to_string(), "Exec".to_string());
        let mut config_params = IndexMap::new();
        config_params.insert("--cpu-type".to_string(), "O3CPU".to_string());

        ExperimentUnit::new(
            binary,
            script,
            dir.join("unit-0"),
            gem5_params,
            config_params,
            BTreeMap::new(),
        )
    }

    fn persist_as(unit: &mut ExperimentUnit, status: RunStatus, return_code: i32) {
        fs::create_dir_all(&unit.output_path).unwrap();
        unit.status = status;
        unit.return_code = return_code;
        unit.persist().unwrap();
    }

    #[test]
    fn missing_output_dir_is_rerunnable() {
        let dir = tempfile::tempdir().unwrap();
        let unit = sample_unit(dir.path());

        assert!(unit.is_rerunnable(false));
        assert!(unit.is_rerunnable(true));
    }

    #[test]
    fn missing_document_is_rerunnable() {
        let dir = tempfile::tempdir().unwrap();
        let unit = sample_unit(dir.path());
        fs::create_dir_all(&unit.output_path).unwrap();

        assert!(unit.is_rerunnable(false));
    }

    #[test]
    fn running_marker_blocks_relaunch() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = sample_unit(dir.path());
        persist_as(&mut unit, RunStatus::Running, RETURN_CODE_UNSET);

        let other = sample_unit(dir.path());
        assert!(!other.is_rerunnable(false));
        assert!(!other.is_rerunnable(true));
    }

    #[test]
    fn recorded_success_is_not_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = sample_unit(dir.path());
        persist_as(&mut unit, RunStatus::Finished, 0);

        assert!(!unit.is_rerunnable(false));
        assert!(!unit.is_rerunnable(true));
    }

    #[test]
    fn recorded_failure_follows_the_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = sample_unit(dir.path());
        persist_as(&mut unit, RunStatus::Finished, 1);

        assert!(!unit.is_rerunnable(false));
        assert!(unit.is_rerunnable(true));
    }

    #[test]
    fn incomplete_document_is_rerunnable() {
        let dir = tempfile::tempdir().unwrap();
        let unit = sample_unit(dir.path());
        fs::create_dir_all(&unit.output_path).unwrap();

        fs::write(unit.info_path(), r#"{"uuid": "x", "status": "running"}"#).unwrap();
        // no return_code, so even a running marker does not count
        assert!(unit.is_rerunnable(false));

        fs::write(unit.info_path(), r#"{"uuid": "x", "return_code": 0}"#).unwrap();
        assert!(unit.is_rerunnable(false));

        fs::write(unit.info_path(), "not json at all").unwrap();
        assert!(unit.is_rerunnable(false));
    }

    #[test]
    fn drift_collects_every_mismatch_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let unit = sample_unit(dir.path());

        let mut stored = unit.document();
        stored.gem5_binary_hash = "deadbeef".to_string();
        stored.metadata.insert("sweep".to_string(), "old".to_string());

        let drift = unit.config_drift(&stored);
        let fields: Vec<_> = drift.iter().map(|d| d.field).collect();
        assert_eq!(fields, vec!["gem5_binary_hash", "metadata"]);
    }

    #[test]
    fn drifted_success_is_still_not_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = sample_unit(dir.path());
        persist_as(&mut unit, RunStatus::Finished, 0);

        let mut other = sample_unit(dir.path());
        other.binary_hash = "deadbeef".to_string();
        assert!(!other.is_rerunnable(true));
    }

    #[test]
    fn persist_round_trips_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = sample_unit(dir.path());
        unit.add_metadata("sweep", "cpu");
        unit.env
            .insert("M5_PATH".to_string(), "/opt/m5".to_string());
        unit.launch_time = 1_700_000_000;
        persist_as(&mut unit, RunStatus::Finished, 0);

        let raw = fs::read_to_string(unit.info_path()).unwrap();
        let stored: StatusDocument = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored, unit.document());
    }

    #[test]
    fn from_document_keeps_identity_and_recomputes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = sample_unit(dir.path());
        unit.add_metadata("sweep", "cpu");
        persist_as(&mut unit, RunStatus::Finished, 0);

        let stored: StatusDocument =
            serde_json::from_str(&fs::read_to_string(unit.info_path()).unwrap()).unwrap();
        let rebuilt = ExperimentUnit::from_document(stored);

        assert_eq!(rebuilt.uuid, unit.uuid);
        assert_eq!(rebuilt.metadata, unit.metadata);
        assert_eq!(rebuilt.return_code, 0);
        assert_eq!(rebuilt.binary_hash, unit.binary_hash);
    }

    #[test]
    fn digest_of_unreadable_file_is_the_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(file_digest(&dir.path().join("nope")), DIGEST_UNAVAILABLE);
    }

    #[test]
    fn digest_tracks_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"same").unwrap();
        fs::write(&b, b"same").unwrap();
        assert_eq!(file_digest(&a), file_digest(&b));

        fs::write(&b, b"different").unwrap();
        assert_ne!(file_digest(&a), file_digest(&b));
    }
}

