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

//! Cylinder-aligned read/write cache.
//!
//! One window of the inner stream is kept in memory. Reads are served from
//! the window, writes accumulate in it, and a contiguous sector-aligned
//! dirty range is pushed down in a single transfer on flush. This is the one
//! place in the stack where write coalescing happens; every layer above can
//! think in sector-granular units.

use log::warn;
use mdisk_err::{Error, Result};

use crate::{force_pwrite, limit_len, Stream};

fn round_down(x: usize, grain: usize) -> usize {
    x - x % grain
}

fn round_up(x: usize, grain: usize) -> usize {
    round_down(x + grain - 1, grain)
}

enum Position {
    Inside,
    Append,
    Outside,
}

pub struct BufferedStream {
    next: Box<dyn Stream>,

    /// Read/write window, `size` bytes, a multiple of `cylinder_size`.
    buf: Vec<u8>,
    /// All operations happen in multiples of this.
    sector_size: usize,
    /// Preferred alignment; for efficiency, less data may be read.
    cylinder_size: usize,

    dirty: bool,
    /// Was the window ever dirty since the last successful flush?
    ever_dirty: bool,
    /// Sector-aligned bounds of the dirty range within the window.
    dirty_pos: usize,
    dirty_end: usize,

    /// Absolute offset of the first byte in the window, sector-aligned.
    current: u64,
    /// Bytes currently valid in the window.
    cur_size: usize,
}

impl BufferedStream {
    pub fn new(
        next: Box<dyn Stream>,
        size: usize,
        cylinder_size: usize,
        sector_size: usize,
    ) -> Result<Self> {
        if size == 0 || cylinder_size == 0 || sector_size == 0 {
            return Err(Error::Internal("zero buffer geometry"));
        }
        if size % cylinder_size != 0 {
            return Err(Error::Internal("size not multiple of cylinder size"));
        }
        if cylinder_size % sector_size != 0 {
            return Err(Error::Internal("cylinder size not multiple of sector size"));
        }
        Ok(Self {
            next,
            buf: vec![0; size],
            sector_size,
            cylinder_size,
            dirty: false,
            ever_dirty: false,
            dirty_pos: 0,
            dirty_end: 0,
            current: 0,
            cur_size: 0,
        })
    }

    fn size(&self) -> usize {
        self.buf.len()
    }

    /// End of the currently valid window.
    fn cur_end(&self) -> u64 {
        self.current + self.cur_size as u64
    }

    /// Distance from an absolute position until the next full cylinder. If
    /// the position already is on a cylinder boundary, a full cylinder.
    fn to_next_full_cyl(&self, pos: u64) -> usize {
        self.cylinder_size - (pos % self.cylinder_size as u64) as usize
    }

    /// Writes the dirty range to the inner stream. A short write is an
    /// error; the window stays valid either way.
    fn flush_window(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let wanted = self.dirty_end - self.dirty_pos;
        let offset = self.current + self.dirty_pos as u64;
        let got = force_pwrite(
            &mut *self.next,
            &self.buf[self.dirty_pos..self.dirty_end],
            offset,
        )?;
        if got != wanted {
            return Err(Error::ShortIo {
                offset,
                wanted,
                got,
            });
        }
        self.dirty = false;
        self.dirty_pos = 0;
        self.dirty_end = 0;
        Ok(())
    }

    fn invalidate(&mut self, start: u64) -> Result<()> {
        self.flush_window()?;
        // Start the window at the beginning of start's sector; starting any
        // earlier might mean a load that does not even reach start.
        self.current = start - start % self.sector_size as u64;
        self.cur_size = 0;
        Ok(())
    }

    fn locate(&mut self, start: u64, len: &mut usize) -> Result<Position> {
        if start >= self.current && start < self.cur_end() {
            limit_len(len, self.cur_end() - start);
            Ok(Position::Inside)
        } else if start == self.cur_end()
            && self.cur_size < self.size()
            && *len >= self.sector_size
        {
            // Appending needs the start to fall exactly at the end of the
            // loaded data, space left in the window, and at least one sector.
            limit_len(len, (self.size() - self.cur_size) as u64);
            *len = round_down(*len, self.sector_size);
            Ok(Position::Append)
        } else {
            self.invalidate(start)?;
            limit_len(
                len,
                (self.cylinder_size - (start - self.current) as usize) as u64,
            );
            limit_len(len, self.to_next_full_cyl(self.current) as u64);
            Ok(Position::Outside)
        }
    }

    /// Loads until the end of the cylinder (or the window). A load that does
    /// not reach `start` leaves nothing to serve and is an error.
    fn load(&mut self, start: u64) -> Result<()> {
        let mut length = self.to_next_full_cyl(self.cur_end());
        limit_len(&mut length, (self.size() - self.cur_size) as u64);

        let offset = self.cur_end();
        let window = &mut self.buf[self.cur_size..self.cur_size + length];
        let got = self.next.pread(window, offset)?;
        self.cur_size += got;
        if self.cur_end() < start {
            return Err(Error::ShortIo {
                offset,
                wanted: length,
                got,
            });
        }
        Ok(())
    }

    /// Primes the window with the partial cylinder around `current`, for
    /// writes that are not aligned or smaller than a sector.
    fn prime_partial_cylinder(&mut self) -> Result<()> {
        let read_size = self.cylinder_size - (self.current % self.cylinder_size as u64) as usize;
        let current = self.current;
        let got = self.next.pread(&mut self.buf[..read_size], current)?;

        let mut bytes_read = got;
        if bytes_read % self.sector_size != 0 {
            warn!(
                "read size ({bytes_read}) not a multiple of sector size ({})",
                self.sector_size
            );
            bytes_read -= bytes_read % self.sector_size;
            if bytes_read == 0 {
                return Err(Error::ShortIo {
                    offset: current,
                    wanted: read_size,
                    got,
                });
            }
        }
        self.cur_size = bytes_read;
        // The image may simply end before this window; treat the missing
        // tail as zeroes so images can grow.
        if self.cur_size == 0 {
            self.buf[..read_size].fill(0);
            self.cur_size = read_size;
        }
        Ok(())
    }

    /// Extends the window by `len` whole sectors starting at `start`.
    fn append(&mut self, start: u64, mut len: usize) -> usize {
        len = round_down(len, self.sector_size);
        let offset = (start - self.current) as usize;
        limit_len(&mut len, (self.size() - offset) as u64);
        self.cur_size += len;
        let end = self.cur_end();
        let _ = self.next.pre_allocate(end);
        len
    }
}

impl Stream for BufferedStream {
    fn next(&mut self) -> Option<&mut dyn Stream> {
        Some(&mut *self.next)
    }

    fn pread(&mut self, buf: &mut [u8], start: u64) -> Result<usize> {
        let mut len = buf.len();
        if len == 0 {
            return Ok(0);
        }

        match self.locate(start, &mut len)? {
            Position::Outside | Position::Append => self.load(start)?,
            Position::Inside => {}
        }

        let offset = (start - self.current) as usize;
        limit_len(&mut len, (self.cur_size - offset) as u64);
        buf[..len].copy_from_slice(&self.buf[offset..offset + len]);
        Ok(len)
    }

    fn pwrite(&mut self, buf: &[u8], start: u64) -> Result<usize> {
        let mut len = buf.len();
        if len == 0 {
            return Ok(0);
        }

        self.ever_dirty = true;

        let offset;
        match self.locate(start, &mut len)? {
            Position::Outside => {
                if start % self.cylinder_size as u64 != 0 || len < self.sector_size {
                    self.prime_partial_cylinder()?;
                    offset = (start - self.current) as usize;
                } else {
                    len = self.append(start, len);
                    offset = (start - self.current) as usize;
                }
            }
            Position::Append => {
                len = self.append(start, len);
                offset = (start - self.current) as usize;
            }
            Position::Inside => {
                offset = (start - self.current) as usize;
                limit_len(&mut len, (self.cur_size - offset) as u64);
            }
        }

        // A write past the end of the valid data extends it, in whole
        // sectors; the sub-sector tail is not accepted.
        if offset + len > self.cur_size {
            len -= (offset + len) % self.sector_size;
            self.cur_size = offset + len;
        }

        self.buf[offset..offset + len].copy_from_slice(&buf[..len]);

        if !self.dirty || offset < self.dirty_pos {
            self.dirty_pos = round_down(offset, self.sector_size);
        }
        if !self.dirty || offset + len > self.dirty_end {
            self.dirty_end = round_up(offset + len, self.sector_size);
        }
        if self.dirty_end > self.cur_size {
            debug_assert!(false, "dirty end past buffered data");
            return Err(Error::Internal("dirty end past buffered data"));
        }
        self.dirty = true;
        Ok(len)
    }

    fn flush(&mut self) -> Result<()> {
        if self.ever_dirty {
            self.flush_window()?;
            self.ever_dirty = false;
        }
        self.next.flush()
    }
}

impl Drop for BufferedStream {
    fn drop(&mut self) {
        if self.ever_dirty {
            let _ = self.flush();
        }
    }
}
