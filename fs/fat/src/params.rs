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

//! The layout parameter block shared by mounting and formatting.

/// First cluster count too large for a 12-bit FAT.
pub const FAT12_MAX: u32 = 0xFF5;
/// First cluster count too large for a 16-bit FAT.
pub const FAT16_MAX: u32 = 0xFFF5;
/// First cluster count too large for a 28-bit FAT32 entry.
pub const FAT32_MAX: u32 = 0x0FFF_FFF5;

/// Everything that describes where a FAT filesystem's pieces live, without
/// any I/O state. Parsed out of the boot sector when mounting, or derived
/// by the format planner when creating a filesystem.
#[derive(Debug, Clone)]
pub struct FsParams {
    pub sector_size: u16,
    /// log2 of `sector_size`.
    pub sector_shift: u32,
    /// Sectors per cluster.
    pub cluster_size: u8,

    /// First FAT sector (i.e. number of reserved sectors).
    pub fat_start: u16,
    /// Sectors per FAT copy.
    pub fat_len: u32,
    pub num_fat: u8,

    /// Sectors of fixed root directory; 0 on FAT32.
    pub dir_len: u16,
    /// First sector of the cluster area.
    pub clus_start: u32,
    pub num_clus: u32,

    pub fat_bits: u32,
    /// Value written to terminate a chain.
    pub end_fat: u32,
    /// Largest cluster number that can still be part of a chain.
    pub last_fat: u32,

    pub serialized: bool,
    pub serial_number: u32,

    // FAT32 only.
    pub primary_fat: u32,
    pub write_all_fats: bool,
    pub root_cluster: u32,
    pub info_sector_loc: u16,
    pub backup_boot: u16,
}

impl Default for FsParams {
    fn default() -> Self {
        Self {
            sector_size: 512,
            sector_shift: 9,
            cluster_size: 0,
            fat_start: 0,
            fat_len: 0,
            num_fat: 2,
            dir_len: 0,
            clus_start: 0,
            num_clus: 0,
            fat_bits: 0,
            end_fat: 0,
            last_fat: 0,
            serialized: false,
            serial_number: 0,
            primary_fat: 0,
            write_all_fats: true,
            root_cluster: 0,
            info_sector_loc: 0,
            backup_boot: 0,
        }
    }
}

impl FsParams {
    pub fn sector_mask(&self) -> u32 {
        self.sector_size as u32 - 1
    }

    pub fn set_sector_size(&mut self, sector_size: u16) {
        self.sector_size = sector_size;
        self.sector_shift = (sector_size as u32).trailing_zeros();
    }

    pub fn sectors_to_bytes(&self, sectors: u32) -> u64 {
        (sectors as u64) << self.sector_shift
    }

    /// Bytes per cluster.
    pub fn cluster_bytes(&self) -> u32 {
        self.cluster_size as u32 * self.sector_size as u32
    }

    /// First sector after the header: reserved sectors, the FAT copies and
    /// the fixed root directory.
    pub fn calc_clus_start(&self) -> u32 {
        self.fat_start as u32 + self.fat_len * self.num_fat as u32 + self.dir_len as u32
    }

    /// First sector of the fixed FAT12/16 root directory.
    pub fn dir_start(&self) -> u32 {
        self.fat_start as u32 + self.fat_len * self.num_fat as u32
    }

    /// Fills in `clus_start` and `num_clus` for `tot_sectors`. Fails when
    /// there are fewer sectors than the filesystem header needs.
    pub fn calc_num_clus(&mut self, tot_sectors: u32) -> Result<(), mdisk_err::FormatError> {
        self.clus_start = self.calc_clus_start();
        if tot_sectors <= self.clus_start {
            return Err(mdisk_err::FormatError::TooFewSectors);
        }
        self.num_clus = (tot_sectors - self.clus_start) / self.cluster_size as u32;
        Ok(())
    }

    /// Chooses the FAT bit width from the cluster count, along with the
    /// matching end-of-chain and last-legal-cluster values.
    pub fn set_fat(&mut self) {
        if self.num_clus < FAT12_MAX {
            self.fat_bits = 12;
            self.end_fat = 0xFFF;
            self.last_fat = 0xFF6;
        } else if self.num_clus < FAT16_MAX {
            self.fat_bits = 16;
            self.end_fat = 0xFFFF;
            self.last_fat = 0xFFF6;
        } else {
            self.fat_bits = 32;
            self.end_fat = 0x0FFF_FFFF;
            self.last_fat = 0x0FFF_FFF6;
        }
    }

    /// Nybbles one FAT entry occupies.
    pub fn fat_nybbles(&self) -> u32 {
        self.fat_bits / 4
    }
}
