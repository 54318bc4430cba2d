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

//! The boot sector and its BIOS Parameter Block.

use mdisk_ds::device::Device;
use mdisk_err::{Error, Result};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

use crate::{olddos, params::FsParams};

/// Media bytes below this one belong to "old DOS" disks that carry no BPB;
/// their parameters come from a fixed per-media table instead.
pub const OLD_DOS_MEDIA_LIMIT: u8 = 0xF0;

/// Trailing block of the boot sector describing the volume, present when
/// `dos4` contains the 0x29 marker. Located right after the BPB on FAT12/16
/// and after the FAT32 extension on FAT32.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LabelBlock {
    /// BIOS drive number, 0x00 for floppies and 0x80 for hard disks.
    pub physdrive: u8,
    pub reserved: u8,
    /// 0x29 when the serial, label and filesystem type below are valid.
    pub dos4: u8,
    /// Volume serial number, traditionally derived from the format time.
    pub serial: U32,
    /// Volume label, matching the label entry in the root directory.
    /// "NO NAME    " when there is none.
    pub label: [u8; 11],
    /// "FAT12   ", "FAT16   " or "FAT32   ". Informational only; never used
    /// to determine the FAT type.
    pub fat_type: [u8; 8],
}

pub const EXT_BIOS_PARAM_MARKER: u8 = 0x29;

/// FAT32 region of the boot sector, between the common BPB and the FAT32
/// label block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Fat32Ext {
    /// 32-bit count of sectors occupied by one FAT. The 16-bit `fatlen`
    /// field must be 0 when this one is in use.
    pub big_fat: U32,
    /// Bit 7: 0 means the FAT is mirrored into all copies at runtime, 1
    /// means only the FAT selected by the low 4 bits is active.
    pub ext_flags: U16,
    /// FAT32 revision, 0.
    pub fs_version: U16,
    /// First cluster of the root directory, usually 2.
    pub root_cluster: U32,
    /// Sector number of the FSINFO structure, usually 1.
    pub info_sector: U16,
    /// Sector number of the backup boot sector, 0 when absent.
    pub backup_boot: U16,
    pub reserved: [u8; 12],
    pub label: LabelBlock,
}

/// Sector 0 of the filesystem. Everything the engine needs is in the fixed
/// fields; `ext` holds either the FAT12/16 label block or the FAT32
/// extension, depending on `fatlen`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSector {
    /// x86 jump to the boot code.
    pub jump: [u8; 3],
    /// OEM banner.
    pub banner: [u8; 8],
    /// Bytes per sector: 512, 1024, 2048 or 4096.
    pub secsiz: U16,
    /// Sectors per cluster, a power of two.
    pub clsiz: u8,
    /// Reserved sectors in front of the first FAT, at least 1.
    pub nrsvsect: U16,
    /// Number of FAT copies, 1 or 2.
    pub nfat: u8,
    /// Root directory entries; 0 on FAT32.
    pub dirents: U16,
    /// 16-bit total sector count; 0 means `bigsect` holds the count.
    pub psect: U16,
    /// Media descriptor byte.
    pub descr: u8,
    /// 16-bit sectors per FAT; 0 on FAT32, which uses `big_fat`.
    pub fatlen: U16,
    /// Sectors per track, for BIOS int 0x13.
    pub nsect: U16,
    /// Heads, for BIOS int 0x13.
    pub nheads: U16,
    /// Sectors hidden in front of the partition holding this filesystem.
    pub hidden: U32,
    /// 32-bit total sector count, used when `psect` is 0.
    pub bigsect: U32,
    /// [`LabelBlock`] on FAT12/16, [`Fat32Ext`] on FAT32.
    pub ext: [u8; 54],
    pub boot_code: [u8; 420],
    /// 0x55 0xAA.
    pub signature: [u8; 2],
}

pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

impl Default for BootSector {
    fn default() -> Self {
        let mut boot = Self::new_zeroed();
        boot.signature = BOOT_SIGNATURE;
        boot
    }
}

impl BootSector {
    pub fn is_fat32(&self) -> bool {
        self.fatlen.get() == 0
    }

    pub fn tot_sectors(&self) -> u32 {
        if self.psect.get() != 0 {
            self.psect.get() as u32
        } else {
            self.bigsect.get()
        }
    }

    pub fn fat32_ext(&self) -> &Fat32Ext {
        Fat32Ext::ref_from_bytes(&self.ext).expect("54-byte extension region")
    }

    pub fn fat32_ext_mut(&mut self) -> &mut Fat32Ext {
        Fat32Ext::mut_from_bytes(&mut self.ext).expect("54-byte extension region")
    }

    pub fn label_block(&self) -> &LabelBlock {
        if self.is_fat32() {
            &self.fat32_ext().label
        } else {
            LabelBlock::ref_from_bytes(&self.ext[..size_of::<LabelBlock>()])
                .expect("label block prefix")
        }
    }

    pub fn label_block_mut(&mut self) -> &mut LabelBlock {
        if self.is_fat32() {
            &mut self.fat32_ext_mut().label
        } else {
            LabelBlock::mut_from_bytes(&mut self.ext[..size_of::<LabelBlock>()])
                .expect("label block prefix")
        }
    }
}

/// Splits the media byte convention used throughout the engine: the value
/// is the BPB media descriptor plus 0x100 when a BPB is present, or the
/// bare byte taken from the first FAT byte of an old DOS disk.
pub fn has_bpb(media: i32) -> bool {
    media >= 0x100
}

/// Fills the device geometry from the boot sector (or, for old DOS disks,
/// from the media preset table).
pub fn boot_to_geom(dev: &mut Device, media: i32, boot: &BootSector) -> Result<()> {
    if media == 0xF0 || has_bpb(media) {
        dev.heads = boot.nheads.get();
        dev.sectors = boot.nsect.get();
        let tot_sectors = boot.tot_sectors();
        let sect_per_track = dev.heads as u32 * dev.sectors as u32;
        if sect_per_track == 0 {
            return Err(Error::BadBootSector("zero number of heads or sectors"));
        }
        dev.tracks = tot_sectors / sect_per_track;
        if tot_sectors % sect_per_track != 0 {
            dev.tracks += 1;
        }
        dev.sector_size = boot.secsiz.get();
        Ok(())
    } else {
        olddos::set_device_from_old_dos(media as u8, dev)
    }
}

fn log2_exact(value: u32) -> Option<u32> {
    if value.is_power_of_two() {
        Some(value.trailing_zeros())
    } else {
        None
    }
}

/// Gleans the filesystem parameters from the boot sector. Returns the
/// parameter block and the total sector count.
pub fn parse_fs_params(
    boot: &BootSector,
    media: i32,
    cylinder_size: u32,
) -> Result<(FsParams, u32)> {
    let mut params = FsParams::default();
    let tot_sectors;

    if (media & !7) == 0xF8 {
        // No BPB; the parameters of old DOS disks come from the media byte.
        let preset = olddos::by_media(media as u8)
            .ok_or(Error::BadBootSector("unknown media byte"))?;
        params.cluster_size = preset.cluster_size;
        tot_sectors = cylinder_size * preset.tracks;
        params.fat_start = 1;
        params.fat_len = preset.fat_len;
        params.dir_len = preset.dir_len;
        params.num_fat = 2;
        params.set_sector_size(512);
    } else {
        let sector_size = boot.secsiz.get() as u32;
        let shift = log2_exact(sector_size)
            .filter(|&shift| (9..=12).contains(&shift))
            .ok_or(Error::BadBootSector("sector size not a small power of two"))?;
        params.sector_size = sector_size as u16;
        params.sector_shift = shift;

        tot_sectors = boot.tot_sectors();

        if boot.clsiz == 0 {
            return Err(Error::BadBootSector("zero cluster size"));
        }
        params.cluster_size = boot.clsiz;
        params.fat_start = boot.nrsvsect.get();
        params.fat_len = boot.fatlen.get() as u32;
        params.dir_len = (boot.dirents.get() as u32 * mdisk_fs::dirio::DIR_ENTRY_SIZE as u32
            / sector_size) as u16;
        params.num_fat = boot.nfat;

        if params.fat_len == 0 {
            let ext = boot.fat32_ext();
            params.fat_len = ext.big_fat.get();
            params.backup_boot = ext.backup_boot.get();
            params.info_sector_loc = ext.info_sector.get();
            params.root_cluster = ext.root_cluster.get();
            let flags = ext.ext_flags.get();
            if flags & 0x80 != 0 {
                // Mirroring disabled: only one FAT is live.
                params.write_all_fats = false;
                params.primary_fat = (flags & 0x0F) as u32;
            }
            if params.fat_len == 0 {
                return Err(Error::BadBootSector("zero FAT length"));
            }
        }

        let label = boot.label_block();
        if label.dos4 == EXT_BIOS_PARAM_MARKER {
            params.serialized = true;
            params.serial_number = label.serial.get();
        }
    }

    if params.calc_num_clus(tot_sectors).is_err() {
        return Err(Error::BadBootSector("fewer sectors than the filesystem header"));
    }
    params.set_fat();
    Ok((params, tot_sectors))
}
