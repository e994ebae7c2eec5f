//! Custom errors for lab-bisect.

use std::io;
use std::path::PathBuf;

/// Raised to terminate the process with an explicit exit code, e.g. when
/// `exec` ran a test that failed. `main` downcasts this instead of
/// printing it as an error.
#[derive(thiserror::Error, Debug)]
#[error("exiting with {0}")]
pub struct ExitStatusError(pub i32);

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("failed to read archive: {0}")]
    Archive(#[source] io::Error),
    #[error("failed to create directory: {0}")]
    CreateDir(#[source] io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("archive not found at {0}")]
    NotFound(String),
    #[error("a reqwest error occurred: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("could not write {}: {err}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
}
