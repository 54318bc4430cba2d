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

//! The FAT32 FSINFO sector, carrying the cached free cluster count and the
//! most recently allocated cluster.

use mdisk_ds::{force_pread, force_pwrite};
use mdisk_err::{Error, Result};
use zerocopy::{
    little_endian::U32, FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

pub const INFO_SIGNATURE_LEAD: u32 = 0x4161_5252; // "RRaA"
pub const INFO_SIGNATURE_STRUCT: u32 = 0x6141_7272; // "rrAa"
pub const INFO_SIGNATURE_TRAIL: u32 = 0xAA55_0000;

/// Free-count sentinel for "not known".
pub const INFO_UNKNOWN: u32 = u32::MAX;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct InfoSector {
    pub lead_signature: U32,
    reserved1: [u8; 480],
    pub struct_signature: U32,
    /// Last known free cluster count, or [`INFO_UNKNOWN`].
    pub free_count: U32,
    /// Cluster the allocator should start scanning from, or
    /// [`INFO_UNKNOWN`].
    pub next_free: U32,
    reserved2: [u8; 12],
    pub trail_signature: U32,
}

impl Default for InfoSector {
    fn default() -> Self {
        let mut info = Self::new_zeroed();
        info.lead_signature = U32::new(INFO_SIGNATURE_LEAD);
        info.struct_signature = U32::new(INFO_SIGNATURE_STRUCT);
        info.free_count = U32::new(INFO_UNKNOWN);
        info.next_free = U32::new(INFO_UNKNOWN);
        info.trail_signature = U32::new(INFO_SIGNATURE_TRAIL);
        info
    }
}

impl InfoSector {
    pub fn is_valid(&self) -> bool {
        self.lead_signature.get() == INFO_SIGNATURE_LEAD
            && self.struct_signature.get() == INFO_SIGNATURE_STRUCT
    }
}

impl crate::Fs {
    /// Primes the free-space count and the allocation hint from the FSINFO
    /// sector. An invalid or missing sector just leaves both unknown.
    pub(crate) fn read_info_sector(&mut self) -> Result<()> {
        let loc = self.params.info_sector_loc;
        if loc == 0 || loc == 0xFFFF {
            return Ok(());
        }
        let pos = self.sectors_to_bytes(loc as u32);
        let mut info = InfoSector::new_zeroed();
        let got = force_pread(&mut *self.disk, info.as_mut_bytes(), pos)?;
        if got != size_of::<InfoSector>() || !info.is_valid() {
            return Ok(());
        }
        let free = info.free_count.get();
        if free != INFO_UNKNOWN && free <= self.params.num_clus {
            self.free_space = free;
        }
        let next = info.next_free.get();
        if next != INFO_UNKNOWN && next >= 2 && next < self.params.num_clus + 2 {
            self.last = next;
        }
        Ok(())
    }

    /// Writes the FSINFO sector back when the free count is known.
    pub(crate) fn write_info_sector(&mut self) -> Result<()> {
        let loc = self.params.info_sector_loc;
        if self.params.fat_bits != 32
            || loc == 0
            || loc == 0xFFFF
            || self.free_space == crate::NONE32
        {
            return Ok(());
        }
        let mut info = InfoSector::default();
        info.free_count = U32::new(self.free_space);
        info.next_free = U32::new(if self.last != 0 {
            self.last
        } else {
            INFO_UNKNOWN
        });
        let pos = self.sectors_to_bytes(loc as u32);
        let wanted = size_of::<InfoSector>();
        let got = force_pwrite(&mut *self.disk, info.as_bytes(), pos)?;
        if got != wanted {
            return Err(Error::ShortIo {
                offset: pos,
                wanted,
                got,
            });
        }
        Ok(())
    }
}
