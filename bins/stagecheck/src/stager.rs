//! Filesystem Stager
//!
//! Applies the side effects a test declares before it runs and reverses
//! them afterwards. Setup is all-or-nothing: the first failure aborts it.
//! Cleanup is best-effort: every operation is attempted and the failures
//! are reported together.

use crate::error::{EngineError, FsFailure};
use stagecheck_common::types::{Cleanup, Setup};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

/// Stage the filesystem for a test.
///
/// Order is fixed: delete files, delete directories, create directories,
/// create files. Missing paths are not an error when deleting.
pub fn apply_setup(setup: &Setup) -> Result<(), EngineError> {
    for file in &setup.delete_files {
        remove_file(file)?;
    }

    for dir in &setup.delete_dirs {
        remove_dir(dir)?;
    }

    for dir in &setup.create_dirs {
        fs::create_dir_all(dir).map_err(|source| fs_failure("create directory", dir, source))?;
    }

    for file in &setup.create_files {
        if let Some(parent) = file.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|source| fs_failure("create parent directory for", &file.path, source))?;
        }
        fs::write(&file.path, &file.content)
            .map_err(|source| fs_failure("create file", &file.path, source))?;
    }

    debug!(
        deleted_files = setup.delete_files.len(),
        deleted_dirs = setup.delete_dirs.len(),
        created_dirs = setup.create_dirs.len(),
        created_files = setup.create_files.len(),
        "Setup applied"
    );
    Ok(())
}

/// Reverse a test's side effects. Directories are removed recursively.
pub fn apply_cleanup(cleanup: &Cleanup) -> Result<(), EngineError> {
    let mut failures = Vec::new();

    for file in &cleanup.delete_files {
        if let Err(failure) = remove_file(file) {
            failures.push(failure);
        }
    }

    for dir in &cleanup.delete_dirs {
        if let Err(failure) = remove_dir(dir) {
            failures.push(failure);
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Cleanup(failures))
    }
}

/// Runs a test's cleanup exactly once, on whichever path leaves the scope.
///
/// Call [`CleanupGuard::finish`] on the normal path to get the error back;
/// if the guard is dropped instead (early return, panic) cleanup still
/// runs and failures are logged.
pub struct CleanupGuard<'a> {
    test_name: &'a str,
    cleanup: Option<&'a Cleanup>,
}

impl<'a> CleanupGuard<'a> {
    pub fn new(test_name: &'a str, cleanup: Option<&'a Cleanup>) -> Self {
        Self { test_name, cleanup }
    }

    pub fn finish(mut self) -> Result<(), EngineError> {
        match self.cleanup.take() {
            Some(cleanup) => apply_cleanup(cleanup),
            None => Ok(()),
        }
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            if let Err(e) = apply_cleanup(cleanup) {
                warn!(test = self.test_name, error = %e, "Cleanup failed");
            }
        }
    }
}

fn remove_file(path: &Path) -> Result<(), FsFailure> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(fs_failure("delete file", path, e)),
        _ => Ok(()),
    }
}

fn remove_dir(path: &Path) -> Result<(), FsFailure> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(fs_failure("delete directory", path, e)),
        _ => Ok(()),
    }
}

fn fs_failure(action: &'static str, path: &Path, source: io::Error) -> FsFailure {
    FsFailure {
        action,
        path: path.to_path_buf(),
        source,
    }
}
