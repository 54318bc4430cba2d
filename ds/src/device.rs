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

use mdisk_err::{Error, Result};

/// Capability and transport bits of a device definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MiscFlags(pub u32);

impl MiscFlags {
    /// Use the SCSI pass-through open path.
    pub const SCSI: u32 = 0x001;
    /// Reclaim elevated privileges around open.
    pub const PRIVILEGED: u32 = 0x002;
    /// Do not acquire the advisory device lock.
    pub const NO_LOCK: u32 = 0x004;
    /// Prefer the XDF terminal layer.
    pub const USE_XDF: u32 = 0x008;
    /// Geometry fields are advisory; do not assert a match on existing media.
    pub const MFORMAT_ONLY: u32 = 0x010;
    /// Translate the device name via the host volume manager.
    pub const VOLD: u32 = 0x020;
    /// Use the floppyd remote terminal layer.
    pub const FLOPPYD: u32 = 0x040;
    /// Present input as a pre-convertible byte stream.
    pub const FILTER: u32 = 0x080;
    /// Interpose the 16-bit byte-swap layer on top of the terminal.
    pub const SWAP: u32 = 0x100;

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }

    pub fn is_mformat_only(self) -> bool {
        self.contains(Self::MFORMAT_ONLY)
    }

    pub fn do_swap(self) -> bool {
        self.contains(Self::SWAP)
    }
}

/// A device definition: identity, geometry and filesystem intent for one
/// drive. This is the configuration surface the stream stack and the
/// filesystem engine consume; command front-ends fill it in from their own
/// sources.
#[derive(Debug, Clone)]
pub struct Device {
    /// Drive letter, for messages.
    pub drive: char,
    /// FAT encoding scheme: 0 auto-detect, negative "preferred but may
    /// change", positive fixed.
    pub fat_bits: i32,
    /// Tracks (cylinders).
    pub tracks: u32,
    /// Heads.
    pub heads: u16,
    /// Sectors per track.
    pub sectors: u16,
    /// Hidden sectors preceding the filesystem, for formatting partitioned
    /// media.
    pub hidden: u32,
    /// Skip this many bytes of the image.
    pub offset: u64,
    /// Primary partition to use (1-4), or 0 for the whole device.
    pub partition: u32,
    pub misc_flags: MiscFlags,
    /// Preferred block size of the device, in bytes.
    pub blocksize: u32,
    /// Codepage for short-name encoding.
    pub codepage: u32,
    /// Mapping description for the remap layer.
    pub data_map: Option<String>,
    /// Total sectors; more precise than `tracks` for partitions that take up
    /// part of a track.
    pub tot_sectors: u32,
    /// Non-default sector size, in bytes (0 means 512).
    pub sector_size: u16,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            drive: 'A',
            fat_bits: 0,
            tracks: 0,
            heads: 0,
            sectors: 0,
            hidden: 0,
            offset: 0,
            partition: 0,
            misc_flags: MiscFlags::default(),
            blocksize: 0,
            codepage: 0,
            data_map: None,
            tot_sectors: 0,
            sector_size: 0,
        }
    }
}

impl Device {
    pub fn sector_size_or_default(&self) -> u32 {
        if self.sector_size != 0 {
            self.sector_size as u32
        } else {
            512
        }
    }

    /// Adjusts the total sector count by an origin shift of `offset` bytes.
    /// Positive shifts shrink the device; a shift beyond the image is an
    /// error. Does nothing when the count is not known yet.
    pub fn adjust_tot_sectors(&mut self, offset: i64) -> Result<()> {
        if self.tot_sectors == 0 {
            return Ok(());
        }
        let offs_sectors = offset / self.sector_size_or_default() as i64;
        if offs_sectors > 0 && (self.tot_sectors as i64) < offs_sectors {
            return Err(Error::BadOffset {
                offset: offset as u64,
            });
        }
        self.tot_sectors = (self.tot_sectors as i64 - offs_sectors) as u32;
        Ok(())
    }

    /// Derives `tot_sectors` from CHS geometry when only that is known.
    pub fn chs_to_tot_sectors(&mut self) {
        if self.tot_sectors == 0 && self.tracks != 0 {
            self.tot_sectors =
                self.tracks * self.heads as u32 * self.sectors as u32 - self.hidden;
        }
    }
}

/// Checks that `tot_sectors` of `sector_size` each fit into `max_bytes` of
/// backing store.
pub fn check_if_sectors_fit(tot_sectors: u32, max_bytes: u64, sector_size: u32) -> Result<()> {
    if tot_sectors as u64 * sector_size as u64 > max_bytes {
        return Err(Error::BadOffset {
            offset: tot_sectors as u64 * sector_size as u64,
        });
    }
    Ok(())
}
