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

//! Shim for filesystems stored at a fixed byte offset into their image.

use mdisk_err::{Error, Result};

use crate::{device::Device, Stream};

pub struct OffsetStream {
    next: Box<dyn Stream>,
    offset: u64,
}

impl Stream for OffsetStream {
    fn next(&mut self) -> Option<&mut dyn Stream> {
        Some(&mut *self.next)
    }

    fn pread(&mut self, buf: &mut [u8], start: u64) -> Result<usize> {
        self.next.pread(buf, start + self.offset)
    }

    fn pwrite(&mut self, buf: &[u8], start: u64) -> Result<usize> {
        self.next.pwrite(buf, start + self.offset)
    }
}

/// Shifts every I/O by `offset` bytes and shrinks both `max_size` and the
/// descriptor's total sector count accordingly.
pub fn open_offset(
    next: Box<dyn Stream>,
    dev: &mut Device,
    offset: u64,
    max_size: &mut u64,
) -> Result<OffsetStream> {
    if offset > *max_size {
        return Err(Error::BadOffset { offset });
    }
    *max_size -= offset;
    dev.adjust_tot_sectors(offset as i64)?;
    Ok(OffsetStream { next, offset })
}
