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

//! Fixed parameters of pre-BPB DOS floppy formats, keyed by the media
//! descriptor byte.

use mdisk_ds::device::Device;
use mdisk_err::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct OldDos {
    pub tracks: u32,
    pub sectors: u16,
    pub heads: u16,

    /// Root directory size, in sectors.
    pub dir_len: u16,
    /// Sectors per cluster.
    pub cluster_size: u8,
    /// Sectors per FAT.
    pub fat_len: u32,

    pub media: u8,
}

const OLD_DOS: [OldDos; 8] = [
    OldDos { tracks: 40, sectors: 9, heads: 1, dir_len: 4, cluster_size: 1, fat_len: 2, media: 0xFC },
    OldDos { tracks: 40, sectors: 9, heads: 2, dir_len: 7, cluster_size: 2, fat_len: 2, media: 0xFD },
    OldDos { tracks: 40, sectors: 8, heads: 1, dir_len: 4, cluster_size: 1, fat_len: 1, media: 0xFE },
    OldDos { tracks: 40, sectors: 8, heads: 2, dir_len: 7, cluster_size: 2, fat_len: 1, media: 0xFF },
    OldDos { tracks: 80, sectors: 9, heads: 2, dir_len: 7, cluster_size: 2, fat_len: 3, media: 0xF9 },
    OldDos { tracks: 80, sectors: 15, heads: 2, dir_len: 14, cluster_size: 1, fat_len: 7, media: 0xF9 },
    OldDos { tracks: 80, sectors: 18, heads: 2, dir_len: 14, cluster_size: 1, fat_len: 9, media: 0xF0 },
    OldDos { tracks: 80, sectors: 36, heads: 2, dir_len: 15, cluster_size: 2, fat_len: 9, media: 0xF0 },
];

pub fn by_media(media: u8) -> Option<&'static OldDos> {
    OLD_DOS.iter().find(|preset| preset.media == media)
}

/// Finds a preset by exact geometry. `dir_len` and `cluster_size` of 0
/// match anything, so callers can pass along unset user constraints.
pub fn by_params(
    tracks: u32,
    heads: u16,
    sectors: u16,
    dir_len: u16,
    cluster_size: u8,
) -> Option<&'static OldDos> {
    OLD_DOS.iter().find(|preset| {
        preset.tracks == tracks
            && preset.heads == heads
            && preset.sectors == sectors
            && (dir_len == 0 || preset.dir_len == dir_len)
            && (cluster_size == 0 || preset.cluster_size == cluster_size)
    })
}

/// Fills the device geometry from the preset for `media`.
pub fn set_device_from_old_dos(media: u8, dev: &mut Device) -> Result<()> {
    let preset = by_media(media).ok_or(Error::BadBootSector("unknown media byte"))?;
    dev.tracks = preset.tracks;
    dev.heads = preset.heads;
    dev.sectors = preset.sectors;
    dev.sector_size = 512;
    Ok(())
}
