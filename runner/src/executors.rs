mod local;

use crate::{
    config::{ConfigErrors, ExecutorConfig},
    launch::{LaunchOptions, Launcher},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("failed to build the worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug)]
pub enum Executors {
    Local(local::LocalExecutor),
}

impl Executors {
    pub fn load(
        config: &ExecutorConfig,
        launchers: Vec<Launcher>,
        opts: LaunchOptions,
    ) -> Result<Self, ConfigErrors> {
        match config.name.as_str() {
            "local" => Ok(Self::Local(local::LocalExecutor::new(
                config.workers,
                launchers,
                opts,
            ))),
            _ => Err(ConfigErrors::UnsupportedExecutor(config.name.clone())),
        }
    }

    pub fn execute(&mut self) -> Result<(), ExecutorError> {
        match self {
            Self::Local(executor) => executor.execute(),
        }
    }
}
