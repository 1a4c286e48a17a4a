use crate::unit::{ExperimentUnit, RunStatus, UnitError, RETURN_CODE_UNSET};
use indexmap::IndexMap;
use std::{
    fs::{self, File},
    io,
    path::PathBuf,
    process::{Command, Stdio},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const STDOUT_FILE: &str = "run_stdout";
pub const STDERR_FILE: &str = "run_stderr";

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("output path {0} exists and is not a directory")]
    OutputNotDirectory(PathBuf),
    #[error("failed to prepare output directory {path}: {source}")]
    PrepareOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open {path} for redirection: {source}")]
    Redirect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Unit(#[from] UnitError),
}

/// Caller policy for [`Launcher::try_launch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchOptions {
    /// relaunch units whose prior run exited non-zero
    pub rerun_failed: bool,
    /// launch unconditionally, ignoring any recorded status
    pub force: bool,
}

/// Drives one experiment unit: rerun decision, output directory
/// preparation, status bracketing and the actual child process run.
#[derive(Debug)]
pub struct Launcher {
    unit: ExperimentUnit,
}

impl Launcher {
    pub fn new(unit: ExperimentUnit) -> Self {
        Self { unit }
    }

    pub fn unit(&self) -> &ExperimentUnit {
        &self.unit
    }

    /// Launch the unit unless its on-disk record says otherwise.
    ///
    /// Returns whether the unit was actually launched. A skip has no side
    /// effects at all, not even directory preparation.
    pub fn try_launch(&mut self, opts: &LaunchOptions) -> Result<bool, LaunchError> {
        if !opts.force && !self.unit.is_rerunnable(opts.rerun_failed) {
            info!(output = %self.unit.output_path.display(), "unit is not launchable, skipping");
            return Ok(false);
        }

        self.launch()?;
        Ok(true)
    }

    /// Run the unit to completion with `running`/`finished` bracketing.
    ///
    /// The `running` record is durably persisted before the child is
    /// spawned and `finished` is only written after it exited, so any
    /// concurrent reader sees the unit as owned for the whole run.
    fn launch(&mut self) -> Result<(), LaunchError> {
        self.prepare_output_dir()?;

        self.unit.launch_time = unix_time();
        self.unit.status = RunStatus::Running;
        self.unit.persist()?;

        let stdout_path = self.unit.output_path.join(STDOUT_FILE);
        let stderr_path = self.unit.output_path.join(STDERR_FILE);
        let stdout = File::create(&stdout_path).map_err(|source| LaunchError::Redirect {
            path: stdout_path,
            source,
        })?;
        let stderr = File::create(&stderr_path).map_err(|source| LaunchError::Redirect {
            path: stderr_path,
            source,
        })?;

        let mut command = Command::new(&self.unit.binary_path);
        command
            .args(flatten_params(&self.unit.gem5_params))
            .arg(&self.unit.config_path)
            .args(flatten_params(&self.unit.config_params))
            // inherited parent environment, unit overrides win
            .envs(&self.unit.env)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        debug!(command = ?command, "spawning experiment binary");

        self.unit.return_code = match command.status() {
            Ok(status) => match status.code() {
                Some(code) => code,
                None => {
                    warn!(unit = %self.unit.uuid, "child exited without a code, recording the sentinel");
                    RETURN_CODE_UNSET
                }
            },
            Err(error) => {
                // recorded like a failed run so the on-disk record stays truthful
                warn!(unit = %self.unit.uuid, %error, "failed to spawn experiment binary");
                RETURN_CODE_UNSET
            }
        };

        self.unit.status = RunStatus::Finished;
        self.unit.persist()?;
        Ok(())
    }

    /// Remove any previous output directory and recreate it empty.
    ///
    /// A non-directory in the way is a configuration error and aborts the
    /// unit before anything is mutated.
    fn prepare_output_dir(&self) -> Result<(), LaunchError> {
        let dir = &self.unit.output_path;

        if dir.exists() && !dir.is_dir() {
            return Err(LaunchError::OutputNotDirectory(dir.clone()));
        }
        if dir.is_dir() {
            fs::remove_dir_all(dir).map_err(|source| LaunchError::PrepareOutput {
                path: dir.clone(),
                source,
            })?;
        }
        fs::create_dir_all(dir).map_err(|source| LaunchError::PrepareOutput {
            path: dir.clone(),
            source,
        })
    }
}

/// Flatten a parameter map to argv tokens, key then value in insertion
/// order, skipping the value token for flag-only (empty value) parameters.
pub fn flatten_params(params: &IndexMap<String, String>) -> Vec<String> {
    let mut argv = Vec::with_capacity(params.len() * 2);
    for (key, value) in params {
        argv.push(key.clone());
        if !value.is_empty() {
            argv.push(value.clone());
        }
    }
    argv
}

fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(-1)
}
