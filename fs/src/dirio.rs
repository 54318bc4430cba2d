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

//! Slot-wise directory entry I/O over any stream presenting a directory's
//! bytes.

use mdisk_ds::{force_pread, force_pwrite, Stream};
use mdisk_err::{Error, Result};
use zerocopy::{FromBytes, IntoBytes};

use crate::record::{DirEntry, END_MARKER};

pub const DIR_ENTRY_SIZE: usize = size_of::<DirEntry>();

fn slot_offset(index: u32) -> u64 {
    index as u64 * DIR_ENTRY_SIZE as u64
}

/// Reads the entry in slot `index`. `Ok(None)` means the directory ends
/// before that slot.
pub fn read_entry(dir: &mut dyn Stream, index: u32) -> Result<Option<DirEntry>> {
    let mut bytes = [0u8; DIR_ENTRY_SIZE];
    let got = force_pread(dir, &mut bytes, slot_offset(index))?;
    if got != DIR_ENTRY_SIZE {
        return Ok(None);
    }
    Ok(Some(
        DirEntry::read_from_bytes(&bytes).map_err(|_| Error::Internal("direntry size"))?,
    ))
}

/// Writes the entry in slot `index`.
pub fn write_entry(dir: &mut dyn Stream, index: u32, entry: &DirEntry) -> Result<()> {
    let offset = slot_offset(index);
    let got = force_pwrite(dir, entry.as_bytes(), offset)?;
    if got != DIR_ENTRY_SIZE {
        return Err(Error::ShortIo {
            offset,
            wanted: DIR_ENTRY_SIZE,
            got,
        });
    }
    Ok(())
}

/// Marks slot `index` as the end of the directory.
pub fn write_end_marker(dir: &mut dyn Stream, index: u32) -> Result<()> {
    let offset = slot_offset(index);
    let got = force_pwrite(dir, &[END_MARKER], offset)?;
    if got != 1 {
        return Err(Error::ShortIo {
            offset,
            wanted: 1,
            got,
        });
    }
    Ok(())
}

/// Grows a directory by one zero-filled cluster starting at slot `index`.
/// Only subdirectories can grow; the caller checks for free space first.
pub fn grow(dir: &mut dyn Stream, index: u32, cluster_bytes: usize) -> Result<()> {
    let zeroes = vec![0u8; cluster_bytes];
    let offset = slot_offset(index);
    let got = force_pwrite(dir, &zeroes, offset)?;
    if got < cluster_bytes {
        return Err(Error::ShortIo {
            offset,
            wanted: cluster_bytes,
            got,
        });
    }
    Ok(())
}
