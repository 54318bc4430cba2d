// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Opening directories and files: the root directory (fixed area on
//! FAT12/16, ordinary chain on FAT32) and entries found inside other
//! directories.

use mdisk_err::{Error, Result};

use crate::{
    file::{bufferize, internal_open, DirRef, FatDir, FileHandle, MapKind, NEW_FILE_SENTINEL},
    loopdetect::LoopDetector,
    FatFs, Fs,
};

/// A directory entry opened as the thing it names.
pub enum FatNode {
    File(FileHandle),
    Dir(FatDir),
}

/// Length of the chain starting at `start`, in clusters. A chain that bites
/// its own tail is counted up to the loop and then cut off.
pub(crate) fn count_blocks(fs: &mut Fs, start: u32) -> u32 {
    let mut detector = LoopDetector::new();
    let mut blocks = 0;
    let mut block = start;
    let mut rel = 0;
    while block >= 2 && block <= fs.params.last_fat {
        blocks += 1;
        let next = match fs.fat_decode(block) {
            Ok(next) => next,
            Err(_) => break,
        };
        rel += 1;
        if detector.check(rel, next).is_err() {
            break;
        }
        block = next;
    }
    blocks
}

/// Bytes in a directory stored as a cluster chain.
pub(crate) fn count_bytes(fs: &mut Fs, start: u32) -> u32 {
    count_blocks(fs, start) * fs.cluster_bytes()
}

impl FatFs {
    /// Opens the root directory: the fixed directory area on FAT12/16, the
    /// chain at `root_cluster` on FAT32.
    pub fn open_root(&self) -> Result<FatDir> {
        let (first, size) = {
            let mut fs = self.fs.borrow_mut();
            let first = if fs.params.fat_bits == 32 {
                fs.params.root_cluster
            } else {
                0
            };
            let size = if first != 0 {
                count_bytes(&mut fs, first)
            } else {
                fs.params.dir_len as u32 * fs.params.sector_size as u32
            };
            (first, size)
        };
        let map = if first == 0 {
            MapKind::Root
        } else {
            MapKind::Normal
        };
        let file = internal_open(self, first, size, DirRef::Root, map);
        bufferize(file)
    }

    /// Opens the object named by slot `index` of `parent`.
    pub fn open_by_direntry(&self, parent: &FatDir, index: u32) -> Result<FatNode> {
        let rec = parent.clone().read_entry(index)?.ok_or(Error::BadOffset {
            offset: index as u64 * mdisk_fs::dirio::DIR_ENTRY_SIZE as u64,
        })?;

        let first = rec.start();
        if first == 0 && rec.is_dir() {
            // ".." of a first-level subdirectory points at the root.
            return Ok(FatNode::Dir(self.open_root()?));
        }

        let size = if rec.is_dir() {
            count_bytes(&mut self.fs.borrow_mut(), first)
        } else {
            rec.file_size()
        };
        let entry = DirRef::Entry {
            dir: parent.clone(),
            index,
            rec,
        };
        let file = internal_open(self, first, size, entry, MapKind::Normal);
        if rec.is_dir() {
            let mut dir = bufferize(file)?;
            if first == NEW_FILE_SENTINEL {
                // Freshly created subdirectory: give it its first cluster.
                dir.grow(0)?;
            }
            Ok(FatNode::Dir(dir))
        } else {
            Ok(FatNode::File(FileHandle { file }))
        }
    }

    /// Opens a chain directly by its first cluster, without any directory
    /// entry. Meant for chain inspection and salvage work.
    pub fn open_by_cluster(&self, first: u32, size: u32) -> Result<FileHandle> {
        Ok(FileHandle {
            file: internal_open(self, first, size, DirRef::Detached, MapKind::Normal),
        })
    }

    /// Clusters in the chain starting at `start`.
    pub fn count_chain_blocks(&self, start: u32) -> u32 {
        count_blocks(&mut self.fs.borrow_mut(), start)
    }

    /// Frees the whole chain starting at `start`, e.g. when deleting a
    /// file.
    pub fn free_chain(&self, start: u32) -> Result<()> {
        self.fs.borrow_mut().fat_deallocate(start)
    }
}
