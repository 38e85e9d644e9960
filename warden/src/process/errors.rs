// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::PathBuf;

/// The executable was rejected before anything was spawned.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Executable {0:?} does not exist")]
    NotFound(PathBuf),
    #[error("Executable {0:?} is not a regular file")]
    NotAFile(PathBuf),
    #[error("{0:?} is not executable")]
    NotExecutable(PathBuf),
    #[error("Executable path {0:?} must be absolute")]
    NotAbsolute(PathBuf),
    #[error("Executable {0:?} is outside of the trusted directories")]
    Untrusted(PathBuf),
    #[error("Executable {0:?} is writable by any user")]
    WorldWritable(PathBuf),
    #[error("Invalid argument or environment entry: {0}")]
    InvalidArgument(String),
    #[error("Unable to inspect {path:?}: {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Failed to spawn {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to create pipe: {0}")]
    Pipe(#[source] io::Error),
    #[error("Pipe I/O with the child failed: {0}")]
    Io(#[source] io::Error),
    #[error("No child process has been spawned")]
    NoChild,
}
