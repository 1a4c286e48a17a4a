use crate::{launch::Launcher, unit::ExperimentUnit};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::error;

// check if a file is executable
pub fn check_executable(path: &PathBuf) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Executor not supported")]
    UnsupportedExecutor(String),
    #[error("Experiment config was invalid")]
    InvalidConfig(#[from] serde_yaml::Error),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
}

/// Description of a whole experiment: the shared binary and run script
/// plus one entry per unit.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    // executor config, currently only "local" with a worker count
    pub executor: ExecutorConfig,
    // gem5 binary shared by every unit
    pub binary: PathBuf,
    // gem5 run script passed after the binary-level params
    pub script: PathBuf,
    // directory the per-unit output directories are created under
    pub output_root: PathBuf,
    // relaunch units whose previous run exited non-zero
    #[serde(default)]
    pub rerun_failed: bool,
    // binary-level params applied to every unit, unit values win
    #[serde(default)]
    pub binary_params: IndexMap<String, String>,
    pub units: Vec<UnitConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // Name of the selected executor, see Executors::load for the selection
    pub name: String,
    // worker count, 0 selects the machine's logical cpu count
    #[serde(default)]
    pub workers: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct UnitConfig {
    // output directory of this unit, relative to output_root
    pub output: String,
    #[serde(default)]
    pub gem5_params: IndexMap<String, String>,
    #[serde(default)]
    pub config_params: IndexMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Build one launcher per configured unit, binary-level defaults merged
    /// under the unit's own params.
    pub fn build_launchers(&self) -> Vec<Launcher> {
        self.units
            .iter()
            .map(|unit_config| {
                let mut gem5_params = self.binary_params.clone();
                gem5_params.extend(unit_config.gem5_params.clone());

                let mut unit = ExperimentUnit::new(
                    self.binary.clone(),
                    self.script.clone(),
                    self.output_root.join(&unit_config.output),
                    gem5_params,
                    unit_config.config_params.clone(),
                    unit_config.env.clone(),
                );
                for (key, value) in &unit_config.metadata {
                    unit.add_metadata(key, value);
                }
                Launcher::new(unit)
            })
            .collect()
    }

    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make
        // debugging easier for users
        let mut contains_error = false;

        if self.executor.name != "local" {
            error!(
                "executor.name ({}) is not supported, please use `local` for now",
                self.executor.name
            );
            contains_error = true;
        }

        if self.units.is_empty() {
            error!("No experiment unit was defined, unable to build a launch queue");
            contains_error = true;
        }

        if !self.binary.is_file() {
            error!(
                "Failed to find binary. Either not a file or not found at {}",
                self.binary.to_string_lossy()
            );
            contains_error = true;
        } else {
            match check_executable(&self.binary) {
                Ok(is_executable) => {
                    if !is_executable {
                        error!(
                            "Binary {} is not executable, this might cause problems",
                            self.binary.to_string_lossy()
                        );
                        contains_error = true;
                    }
                }
                Err(e) => {
                    error!(
                        "Failed to determine if binary ({}) is an executable: {e}",
                        self.binary.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        if !self.script.is_file() {
            error!(
                "Failed to find script. Either not a file or not found at {}",
                self.script.to_string_lossy()
            );
            contains_error = true;
        }

        let mut seen_outputs = BTreeSet::new();
        for unit in self.units.iter() {
            if !seen_outputs.insert(&unit.output) {
                error!(
                    "units.output ({}) is used more than once, units must not share an output directory",
                    unit.output
                );
                contains_error = true;
            }
        }

        contains_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn sample_config(dir: &Path) -> ExperimentConfig {
        let binary = write_executable(dir, "gem5.opt");
        let script = dir.join("config.py");
        fs::write(&script, "# run script").unwrap();

        let yaml = format!(
            r#"
executor: {{ name: local, workers: 2 }}
binary: {}
script: {}
output_root: {}
binary_params: {{ "--outdir": "m5out" }}
units:
  - output: unit-a
    gem5_params: {{ "--debug-flags": "Exec" }}
    config_params: {{ "--cpu-type": "O3CPU" }}
    metadata: {{ sweep: cpu }}
  - output: unit-b
"#,
            binary.display(),
            script.display(),
            dir.join("runs").display(),
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn load_parses_a_full_description() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path());

        assert_eq!(config.executor.workers, 2);
        assert_eq!(config.units.len(), 2);
        assert!(!config.preflight_checks());
    }

    #[test]
    fn binary_params_merge_under_unit_params() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path());

        let launchers = config.build_launchers();
        let unit = launchers[0].unit();
        assert_eq!(unit.gem5_params.get("--outdir").unwrap(), "m5out");
        assert_eq!(unit.gem5_params.get("--debug-flags").unwrap(), "Exec");
        assert_eq!(unit.metadata.get("sweep").unwrap(), "cpu");
        assert_eq!(unit.output_path, dir.path().join("runs").join("unit-a"));
    }

    #[test]
    fn preflight_flags_a_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sample_config(dir.path());
        config.binary = dir.path().join("no-such-binary");

        assert!(config.preflight_checks());
    }

    #[test]
    fn preflight_flags_a_non_executable_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sample_config(dir.path());
        config.binary = dir.path().join("plain-file");
        fs::write(&config.binary, "not a program").unwrap();
        fs::set_permissions(&config.binary, fs::Permissions::from_mode(0o644)).unwrap();

        assert!(config.preflight_checks());
    }

    #[test]
    fn preflight_flags_shared_output_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sample_config(dir.path());
        config.units[1].output = config.units[0].output.clone();

        assert!(config.preflight_checks());
    }

    #[test]
    fn preflight_flags_an_unknown_executor() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sample_config(dir.path());
        config.executor.name = "slurm".to_string();

        assert!(config.preflight_checks());
    }
}
