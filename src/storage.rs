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

//! Disk buffering layer: raw point files, memory mapped in both directions, and the naming
//! convention shared by the dispatcher intake and the node processors.
//!
//! Layout of an output directory:
//! ```text
//! {output}/index.pcindex        tree manifest, written once at the end
//! {output}/{identifier}.pcnode  final points of one node
//! {output}/tmp/{identifier}_tmp{n}  chunk files waiting for the node to be processed
//! ```

use crate::error::{BuildError, IoContext, Result};
use crate::point::{Point, POINT_SIZE};
use bytemuck::Zeroable;
use memmap2::{Mmap, MmapMut};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extension used for node files.
pub const NODE_FILE_EXTENSION: &str = "pcnode";
/// Extension used for index file.
pub const INDEX_FILE_EXTENSION: &str = "pcindex";
/// Name of the index file, without extension.
pub const INDEX_FILE_NAME: &str = "index";
/// Directory (relative to output) holding temporary chunk files.
pub const TMP_DIR_NAME: &str = "tmp";

/// Paths of one build's output.
#[derive(Clone, Debug)]
pub struct OutputLayout {
    output: PathBuf,
    tmp: PathBuf,
}

impl OutputLayout {
    /// Layout rooted at given directory. Does not touch the disk.
    pub fn new(output: impl Into<PathBuf>) -> Self {
        let output = output.into();
        let tmp = output.join(TMP_DIR_NAME);
        Self { output, tmp }
    }

    /// Creates the output directory, removes node and index files left by a previous build and
    /// recreates an empty temporary directory.
    pub fn prepare(&self) -> Result<()> {
        self.remove_node_files()?;
        fs::create_dir_all(&self.output).at(&self.output)?;

        if self.tmp.exists() {
            fs::remove_dir_all(&self.tmp).at(&self.tmp)?;
        }
        fs::create_dir_all(&self.tmp).at(&self.tmp)
    }

    /// Deletes node and index files from the output directory, other files are left alone.
    pub fn remove_node_files(&self) -> Result<()> {
        if self.output.is_dir() {
            for entry in fs::read_dir(&self.output).at(&self.output)? {
                let path = entry.at(&self.output)?.path();
                let stale = path.is_file()
                    && path.extension().is_some_and(|ext| {
                        let ext = ext.to_string_lossy().to_ascii_lowercase();
                        ext == NODE_FILE_EXTENSION || ext == INDEX_FILE_EXTENSION
                    });
                if stale {
                    fs::remove_file(&path).at(&path)?;
                }
            }
        }
        Ok(())
    }

    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp
    }

    /// Path of the `n`-th chunk file waiting for node with given identifier.
    pub fn chunk_path(&self, identifier: &str, n: usize) -> PathBuf {
        self.tmp.join(format!("{identifier}_tmp{n}"))
    }

    pub fn node_path(&self, identifier: &str) -> PathBuf {
        self.output.join(format!("{identifier}.{NODE_FILE_EXTENSION}"))
    }

    pub fn index_path(&self) -> PathBuf {
        self.output.join(format!("{INDEX_FILE_NAME}.{INDEX_FILE_EXTENSION}"))
    }

    /// Deletes the temporary directory with everything left in it.
    pub fn remove_tmp(&self) -> Result<()> {
        if self.tmp.exists() {
            fs::remove_dir_all(&self.tmp).at(&self.tmp)?;
        }
        Ok(())
    }
}

/// Creates or overwrites file under given path with raw point records.
pub fn write_points(path: &Path, points: &[Point]) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .at(path)?;

    let bytes: &[u8] = bytemuck::cast_slice(points);
    // zero-length files can not be mapped
    if bytes.is_empty() {
        return Ok(());
    }

    file.set_len(bytes.len() as u64).at(path)?;
    // SAFETY: the file was just created (truncated) by us and nobody else maps it
    let mut map = unsafe { MmapMut::map_mut(&file) }.at(path)?;
    map.copy_from_slice(bytes);
    map.flush().at(path)?;
    debug!(path = %path.display(), points = points.len(), "points written");
    Ok(())
}

/// Returns amount of point records stored in given file.
pub fn point_count(path: &Path) -> Result<usize> {
    let len = fs::metadata(path).at(path)?.len();
    if len % POINT_SIZE as u64 != 0 {
        return Err(BuildError::InvalidPointFile {
            path: path.to_path_buf(),
            len,
        });
    }
    Ok((len / POINT_SIZE as u64) as usize)
}

/// Loads all points from given file into `buffer`, replacing its contents.
/// Returns amount of points read.
pub fn read_points_into(path: &Path, buffer: &mut Vec<Point>) -> Result<usize> {
    let file = File::open(path).at(path)?;
    let len = file.metadata().at(path)?.len();
    if len % POINT_SIZE as u64 != 0 {
        return Err(BuildError::InvalidPointFile {
            path: path.to_path_buf(),
            len,
        });
    }

    let count = (len / POINT_SIZE as u64) as usize;
    buffer.clear();
    if count == 0 {
        return Ok(0);
    }

    // SAFETY: chunk files are owned by the worker processing their node, nothing writes them now
    let map = unsafe { Mmap::map(&file) }.at(path)?;
    buffer.resize(count, Point::zeroed());
    bytemuck::cast_slice_mut::<Point, u8>(buffer).copy_from_slice(&map);
    Ok(count)
}

/// Loads all points from given file.
pub fn read_points(path: &Path) -> Result<Vec<Point>> {
    let mut buffer = Vec::new();
    read_points_into(path, &mut buffer)?;
    Ok(buffer)
}
