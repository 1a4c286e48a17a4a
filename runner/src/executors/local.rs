use super::ExecutorError;
use crate::{
    launch::{LaunchError, LaunchOptions, Launcher},
    sync::locking::LockError,
    unit::UnitError,
};
use rayon::{prelude::*, ThreadPoolBuilder};
use std::{
    process::exit,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, error, info};

/// Executor that fans units out over a local thread pool.
///
/// Each worker thread drives one unit's `try_launch` to completion before
/// taking the next; units share nothing but the filesystem.
#[derive(Debug)]
pub struct LocalExecutor {
    workers: usize,
    opts: LaunchOptions,
    launchers: Vec<Launcher>,
}

impl LocalExecutor {
    /// `workers == 0` selects the machine's logical cpu count
    pub fn new(workers: usize, launchers: Vec<Launcher>, opts: LaunchOptions) -> Self {
        Self {
            workers,
            opts,
            launchers,
        }
    }

    pub fn launchers(&self) -> &[Launcher] {
        &self.launchers
    }

    /// Run every unit, returning once all of them completed or were
    /// skipped. A unit-level configuration error aborts only that unit; a
    /// lock timeout aborts the whole process since its status records can
    /// no longer be trusted.
    pub fn execute(&mut self) -> Result<(), ExecutorError> {
        let workers = if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        };
        debug!("starting worker pool with {workers} threads");

        let pool = ThreadPoolBuilder::new().num_threads(workers).build()?;

        let total = self.launchers.len() as u64;
        let processed = AtomicU64::new(0);
        let opts = self.opts;

        pool.install(|| {
            self.launchers.par_iter_mut().for_each(|launcher| {
                let output = launcher.unit().output_path.clone();

                match launcher.try_launch(&opts) {
                    Ok(true) => debug!(
                        output = %output.display(),
                        return_code = launcher.unit().return_code,
                        "unit finished"
                    ),
                    Ok(false) => {}
                    Err(LaunchError::Unit(UnitError::Lock(LockError::Timeout { .. }))) => {
                        error!(
                            output = %output.display(),
                            "status lock timed out, aborting to avoid divergent status records"
                        );
                        exit(2);
                    }
                    Err(error) => error!(output = %output.display(), %error, "unit aborted"),
                }

                info!(
                    "done with {}/{}",
                    processed.fetch_add(1, Ordering::SeqCst) + 1,
                    total
                );
            });
        });

        info!("done with processing");

        Ok(())
    }
}
