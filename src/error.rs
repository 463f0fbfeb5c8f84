/* Generic tree structures for storage of spatial data.
Copyright (C) 2023  Alexander Pyattaev

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! Error taxonomy of the tree builder.

use crate::worker::WorkStatus;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for tree building operations
pub type Result<T> = std::result::Result<T, BuildError>;

/// Everything that can abort a build. Cancellation is not an error, see
/// [`Dispatcher::process_points`](crate::Dispatcher::process_points).
#[derive(Error, Debug)]
pub enum BuildError {
    /// Rejected settings or input, reported before touching the disk
    #[error("configuration error: {0}")]
    Config(String),

    /// Settings file could not be parsed
    #[error("settings error: {0}")]
    Settings(#[from] toml::de::Error),

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A chunk or node file whose length is not a multiple of the point size
    #[error("{} is not a point file ({len} bytes)", path.display())]
    InvalidPointFile { path: PathBuf, len: u64 },

    #[error("index error: {0}")]
    Index(#[from] serde_json::Error),

    /// Work was assigned to a worker that did not report itself idle
    #[error("worker {index} can not accept work while {status:?}")]
    WorkerNotIdle { index: usize, status: WorkStatus },

    /// A worker thread terminated while the build was running
    #[error("worker {index} died unexpectedly: {reason}")]
    WorkerDied { index: usize, reason: String },

    /// Broken internal invariant (should not occur in normal operation)
    #[error("internal error: {0}")]
    Internal(String),
}

impl BuildError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Attaches a path to raw io errors.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    #[inline]
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| BuildError::io(path, e))
    }
}
