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

//! Filesystem creation: the parameter planner that finds a valid
//! `{fat_bits, cluster_size, fat_len, dir_len, fat_start}` combination for
//! a given sector count, and the writer that puts a blank filesystem onto
//! a disk.

use std::{cell::RefCell, collections::HashMap, rc::Rc, time::UNIX_EPOCH};

use log::{debug, error, warn};
use mdisk_ds::{device::Device, force_pwrite, geom, Stream};
use mdisk_err::{Error, FormatError, Result};
use mdisk_fs::{
    record::{DirEntry, ATTR_VOLUME_ID},
    AsciiConverter,
};
use zerocopy::{
    little_endian::{U16, U32},
    IntoBytes,
};

use crate::{
    boot::{BootSector, EXT_BIOS_PARAM_MARKER},
    params::{FsParams, FAT12_MAX, FAT16_MAX, FAT32_MAX},
    FatAccess, FatFs, Fs, NONE32,
};

/// Outcome of trying one FAT-bits / cluster-size combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fit {
    /// Too few sectors to even hold the filesystem header.
    TooFewSectors,
    /// Too few clusters for the chosen FAT bits; the caller should shrink
    /// the cluster size or lower the FAT bits.
    TooFewClusters,
    Fits,
    /// Too many clusters for the chosen FAT bits; the caller should grow
    /// the cluster size or raise the FAT bits.
    TooManyClusters,
    /// The FAT length is pinned and cannot describe this many clusters.
    TooManyClustersForFatLen,
}

/// Computes the FAT length from the other parameters, by the closed form:
/// every cluster consumes its data sectors plus one descriptor in each FAT
/// copy, and the remaining space must hold exactly the described clusters.
fn calc_fat_len(params: &mut FsParams, tot_sectors: u32) -> Fit {
    params.fat_len = 0;
    let clus_start = params.calc_clus_start();
    if tot_sectors < clus_start {
        return Fit::TooFewSectors;
    }
    let mut rem_sect = tot_sectors - clus_start;

    // Cheat a little bit to address the really common case of an odd
    // number of remaining sectors while both the FAT count and the cluster
    // size are even.
    if rem_sect % 2 == 1 && params.num_fat % 2 == 0 && params.cluster_size % 2 == 0 {
        rem_sect -= 1;
    }

    let fat_nybbles = params.fat_nybbles();
    // May wrap for sector counts near 2^32 with huge clusters; the
    // correction below cancels the wrap-around again, which is fine for
    // unsigned arithmetic.
    let mut numerator = rem_sect.wrapping_add(2 * params.cluster_size as u32);
    // Nybbles consumed by one cluster, in the cluster area and in all FATs.
    let mut denominator =
        params.cluster_size as u32 * params.sector_size as u32 * 2 + params.num_fat as u32 * fat_nybbles;

    if fat_nybbles == 3 {
        // Test first, or scaling the numerator could overflow.
        if rem_sect > 256 * FAT12_MAX {
            return Fit::TooManyClusters;
        }
        numerator = numerator.wrapping_mul(fat_nybbles);
    } else {
        // Divide the denominator instead of multiplying the numerator, to
        // stay clear of overflows.
        denominator /= fat_nybbles;
    }

    let mut corr = 0;
    if rem_sect > denominator {
        numerator = numerator.wrapping_sub(denominator);
        corr += 1;
    }

    params.fat_len = (numerator - 1) / denominator + 1 + corr;
    Fit::Fits
}

/// Whether the FAT has room for the descriptors of all clusters.
fn clusters_fit_into_fat(params: &FsParams) -> bool {
    ((params.num_clus as u64 + 2) * params.fat_nybbles() as u64 - 1)
        / (params.sector_size as u64 * 2)
        < params.fat_len as u64
}

fn try_cluster_size(
    params: &mut FsParams,
    tot_sectors: u32,
    may_change_boot_size: bool,
    may_change_fat_len: bool,
    may_change_root_size: bool,
    mut may_pad: bool,
) -> Fit {
    let (min_clus, max_clus) = match params.fat_bits {
        12 => (1, FAT12_MAX),
        16 => (4096, FAT16_MAX),
        32 => (FAT16_MAX, FAT32_MAX),
        _ => {
            debug_assert!(false, "bad number of FAT bits");
            return Fit::TooFewSectors;
        }
    };

    debug!(
        "FAT={} cluster={}{}",
        params.fat_bits,
        params.cluster_size,
        if may_pad { " may_pad" } else { "" }
    );

    if may_change_fat_len {
        let fit = calc_fat_len(params, tot_sectors);
        if fit != Fit::Fits {
            return fit;
        }
    }

    loop {
        if params.calc_num_clus(tot_sectors).is_err() {
            return Fit::TooFewSectors;
        }
        if params.num_clus < min_clus {
            // Not enough clusters; the driver loop should shrink the FAT
            // bits again.
            return Fit::TooFewClusters;
        }

        if !may_change_fat_len {
            // The FAT length was pinned by the caller; the cluster
            // descriptors have to fit it.
            if params.num_clus >= FAT32_MAX || !clusters_fit_into_fat(params) {
                return Fit::TooManyClustersForFatLen;
            }
        }

        if params.num_clus < max_clus {
            break;
        }
        if !may_pad {
            return Fit::TooManyClusters;
        }

        // Slightly too many clusters for these FAT bits, but too few for
        // the next size up: consume the surplus sectors by inflating the
        // reserved sectors, the FAT or the root directory, pushing the
        // cluster count back under the ceiling.
        let bwaste = tot_sectors - params.clus_start - max_clus * params.cluster_size as u32 + 1;
        if bwaste > u16::MAX as u32 {
            return Fit::TooManyClusters;
        }
        let mut waste = bwaste as u16;
        let mut dir_grow: u16 = 0;

        if may_change_root_size {
            dir_grow = 32u16.saturating_sub(params.dir_len);
            if dir_grow > waste {
                dir_grow = waste;
            }
            waste -= dir_grow;
        }
        if may_change_fat_len && (!may_change_boot_size || params.fat_bits == 12) {
            let fat_grow = (waste + params.num_fat as u16 - 1) / params.num_fat as u16;
            params.fat_len += fat_grow as u32;

            // The FAT rounds up to whole copies; shrink the directory
            // growth again by the overshoot, at most by what it grew.
            let mut dir_shrink = fat_grow * params.num_fat as u16 - waste;
            if dir_shrink > dir_grow {
                dir_shrink = dir_grow;
            }
            dir_grow -= dir_shrink;
        } else if may_change_boot_size {
            params.fat_start += waste;
        }
        params.dir_len += dir_grow;

        // If padding failed once, no point in retrying.
        may_pad = false;
    }

    debug_assert!(params.num_clus >= min_clus && params.num_clus < max_clus);
    Fit::Fits
}

fn check_fs_params_and_set_fat(params: &mut FsParams, tot_sectors: u32) -> Result<()> {
    if (params.fat_bits == 32) != (params.dir_len == 0) {
        return Err(Error::Internal("root directory size inconsistent"));
    }
    let used = params.clus_start as u64 + params.num_clus as u64 * params.cluster_size as u64;
    // Clusters must fill the disk entirely, up to less than one cluster of
    // slack.
    if (tot_sectors as u64) < used || tot_sectors as u64 >= used + params.cluster_size as u64 {
        return Err(Error::Internal("clusters do not fill the disk"));
    }
    if !clusters_fit_into_fat(params) {
        return Err(Error::Internal("FAT too small for its clusters"));
    }
    let provisional_fat_bits = params.fat_bits;
    params.set_fat();
    if provisional_fat_bits != params.fat_bits {
        return Err(Error::Internal("final cluster count fits different FAT bits"));
    }
    Ok(())
}

fn fat32_specific_init(params: &mut FsParams) -> Result<()> {
    params.primary_fat = 0;
    params.write_all_fats = true;
    if params.backup_boot == 0 {
        params.backup_boot = if params.fat_start <= 6 {
            params.fat_start - 1
        } else {
            6
        };
    }
    if params.fat_start < 3 {
        error!("for FAT32, reserved sectors need to be at least 3");
        return Err(FormatError::TooFewSectors.into());
    }
    if params.fat_start <= params.backup_boot {
        warn!(
            "reserved sectors ({}) must be more than backupBoot ({})",
            params.fat_start, params.backup_boot
        );
        params.backup_boot = 0;
    }
    params.root_cluster = 2;
    params.info_sector_loc = 1;
    Ok(())
}

/// Finds a full, valid parameter set for a filesystem of `tot_sectors`
/// sectors, keeping any fields the caller pinned in `params`. Returns the
/// media descriptor byte to format with.
pub fn calc_fs_parameters(
    dev: &Device,
    fat32: bool,
    tot_sectors: u32,
    params: &mut FsParams,
) -> Result<u8> {
    let may_change_boot_size = params.fat_start == 0;
    let may_change_fat_bits = dev.fat_bits == 0 && !fat32;
    let may_change_cluster_size = params.cluster_size == 0;
    let may_change_root_size = params.dir_len == 0;
    let may_change_fat_len = params.fat_len == 0;
    let mut may_pad = false;

    params.info_sector_loc = 0;

    // A geometry that matches one of the classic formats gets its exact
    // historical parameters.
    if (may_change_fat_bits || dev.fat_bits.unsigned_abs() == 12)
        && (may_change_boot_size || params.fat_start == 1)
    {
        if let Some(preset) =
            olddos_preset(dev, params.dir_len, params.cluster_size)
        {
            params.fat_start = 1;
            params.cluster_size = preset.cluster_size;
            params.dir_len = preset.dir_len;
            params.fat_len = preset.fat_len;
            params.fat_bits = 12;
            params
                .calc_num_clus(tot_sectors)
                .map_err(Error::FormatInfeasible)?;
            check_fs_params_and_set_fat(params, tot_sectors)?;
            return Ok(preset.media);
        }
    }

    // A format described by BPB.
    let sect_per_cyl = dev.sectors as u32 * dev.heads as u32;
    let descr = if dev.hidden != 0 || sect_per_cyl == 0 || tot_sectors % sect_per_cyl != 0 {
        0xF8
    } else {
        0xF0
    };

    params.fat_bits = dev.fat_bits.unsigned_abs();
    if params.fat_bits == 0 {
        // Not specified by the device: start with a 12-bit FAT, unless
        // FAT32 was asked for outright.
        params.fat_bits = if fat32 { 32 } else { 12 };
    }
    if params.cluster_size == 0 {
        params.cluster_size = if tot_sectors < 2400 && dev.heads == 2 {
            // Double sided double density floppies.
            2
        } else if may_change_fat_len && params.fat_bits == 32 {
            8
        } else {
            1
        };
    }

    if params.dir_len == 0 {
        params.dir_len = if tot_sectors < 1200 {
            // Double density floppies.
            if dev.heads == 1 {
                4
            } else {
                7
            }
        } else if tot_sectors <= 3840 {
            // High density floppies.
            14
        } else if tot_sectors <= 7680 {
            // Extra density floppies.
            15
        } else {
            32
        };
    }
    let saved_dir_len = params.dir_len;

    loop {
        if may_change_boot_size {
            params.fat_start = if params.fat_bits == 32 { 32 } else { 1 };
        }
        if params.fat_bits == 32 {
            params.dir_len = 0;
        } else if params.dir_len == 0 {
            params.dir_len = saved_dir_len;
        }

        if params.fat_bits == 32 && may_change_cluster_size && may_change_fat_len {
            // FAT32 cluster sizes per the Microsoft specification,
            // generalized to any sector size.
            params.cluster_size = if tot_sectors >= 32 * 1024 * 1024 * 2 {
                64
            } else if tot_sectors >= 16 * 1024 * 1024 * 2 {
                32
            } else if tot_sectors >= 8 * 1024 * 1024 * 2 {
                16
            } else {
                params.cluster_size
            };
        }

        let fit = try_cluster_size(
            params,
            tot_sectors,
            may_change_boot_size,
            may_change_fat_len,
            may_change_root_size,
            may_pad,
        );
        debug!("fit={fit:?}");
        match fit {
            Fit::Fits => break,
            Fit::TooFewSectors => return Err(FormatError::TooFewSectors.into()),
            Fit::TooFewClusters => {
                if may_change_cluster_size && may_change_fat_len && params.cluster_size > 1 {
                    params.cluster_size /= 2;
                    continue;
                }
                // Raising the FAT bits made each FAT entry larger, pushing
                // the cluster count below the new minimum; lower the bits
                // again and make up for the surplus with padding.
                if !may_change_fat_bits || params.fat_bits == 12 {
                    return Err(FormatError::TooFewClusters.into());
                }
                match params.fat_bits {
                    16 => params.fat_bits = 12,
                    32 => params.fat_bits = 16,
                    _ => {}
                }
                may_pad = true;
                continue;
            }
            Fit::TooManyClusters | Fit::TooManyClustersForFatLen => {
                if fit == Fit::TooManyClusters && may_change_fat_bits && !may_pad {
                    // The cluster size reached its ceiling for these FAT
                    // bits; switch to the next width.
                    if params.fat_bits == 12
                        && (!may_change_cluster_size || params.cluster_size >= 8)
                    {
                        params.fat_bits = 16;
                        if may_change_cluster_size {
                            params.cluster_size = 1;
                        }
                        continue;
                    }
                    if params.fat_bits == 16
                        && (!may_change_cluster_size || params.cluster_size >= 64)
                    {
                        params.fat_bits = 32;
                        if may_change_cluster_size {
                            params.cluster_size = if may_change_fat_len { 8 } else { 1 };
                        }
                        continue;
                    }
                }

                if may_change_cluster_size && params.cluster_size < 128 {
                    params.cluster_size *= 2;
                    continue;
                }

                if fit == Fit::TooManyClustersForFatLen
                    && may_change_fat_bits
                    && may_change_root_size
                    && params.fat_bits == 16
                {
                    params.fat_bits = 12;
                    may_pad = true;
                    continue;
                }

                // Both the FAT bits and the cluster size are pinned; the
                // only lever left is padding out the header.
                if fit == Fit::TooManyClusters && !may_pad {
                    may_pad = true;
                    continue;
                }

                return Err(if fit == Fit::TooManyClustersForFatLen {
                    FormatError::TooManyClustersForFatLen.into()
                } else {
                    FormatError::TooManyClusters.into()
                });
            }
        }
    }

    check_fs_params_and_set_fat(params, tot_sectors)?;
    if params.fat_bits == 32 {
        fat32_specific_init(params)?;
    }
    Ok(descr)
}

fn olddos_preset(
    dev: &Device,
    dir_len: u16,
    cluster_size: u8,
) -> Option<&'static crate::olddos::OldDos> {
    crate::olddos::by_params(dev.tracks, dev.heads, dev.sectors, dir_len, cluster_size)
}

fn label_bytes(label: Option<&str>) -> [u8; 11] {
    let mut bytes = *b"NO NAME    ";
    if let Some(label) = label {
        for (slot, b) in bytes
            .iter_mut()
            .zip(label.bytes().map(|b| b.to_ascii_uppercase()))
        {
            *slot = b;
        }
    }
    bytes
}

/// Builds the boot sector for a filesystem laid out by the planner.
pub fn init_boot_sector(
    params: &FsParams,
    dev: &Device,
    tot_sectors: u32,
    media: u8,
    label: Option<&str>,
    serial: u32,
) -> BootSector {
    let fat32 = params.fat_bits == 32;
    let mut boot = BootSector::default();
    boot.jump = [0xEB, if fat32 { 0x58 } else { 0x3C }, 0x90];
    boot.banner = *b"MDISK1.0";
    boot.secsiz = U16::new(params.sector_size);
    boot.clsiz = params.cluster_size;
    boot.nrsvsect = U16::new(params.fat_start);
    boot.nfat = params.num_fat;
    boot.dirents = U16::new(
        (params.dir_len as u32 * params.sector_size as u32 / size_of::<DirEntry>() as u32) as u16,
    );
    if fat32 || tot_sectors > u16::MAX as u32 {
        boot.bigsect = U32::new(tot_sectors);
    } else {
        boot.psect = U16::new(tot_sectors as u16);
    }
    boot.descr = media;
    boot.nsect = U16::new(dev.sectors);
    boot.nheads = U16::new(dev.heads);
    boot.hidden = U32::new(dev.hidden);

    if fat32 {
        let ext = boot.fat32_ext_mut();
        ext.big_fat = U32::new(params.fat_len);
        ext.root_cluster = U32::new(params.root_cluster);
        ext.info_sector = U16::new(params.info_sector_loc);
        ext.backup_boot = U16::new(params.backup_boot);
    } else {
        boot.fatlen = U16::new(params.fat_len as u16);
    }

    let fat_type: &[u8; 8] = match params.fat_bits {
        12 => b"FAT12   ",
        16 => b"FAT16   ",
        _ => b"FAT32   ",
    };
    let block = boot.label_block_mut();
    block.physdrive = if media == 0xF8 { 0x80 } else { 0x00 };
    block.dos4 = EXT_BIOS_PARAM_MARKER;
    block.serial = U32::new(serial);
    block.label = label_bytes(label);
    block.fat_type = *fat_type;

    boot
}

/// Creates a blank FAT filesystem on `disk` and returns it mounted.
///
/// Caller-pinned fields in `params` constrain the planner; everything else
/// is derived from the device geometry and `tot_sectors`.
pub fn make_filesystem(
    disk: Box<dyn Stream>,
    dev: &mut Device,
    mut params: FsParams,
    fat32: bool,
    label: Option<&str>,
    serial: u32,
) -> Result<FatFs> {
    dev.chs_to_tot_sectors();
    let tot_sectors = dev.tot_sectors;
    if tot_sectors == 0 {
        return Err(FormatError::TooFewSectors.into());
    }
    geom::compute_lba_geom_from_tot_sectors(dev);

    params.set_sector_size(if dev.sector_size != 0 {
        dev.sector_size
    } else {
        512
    });
    let media = calc_fs_parameters(dev, fat32, tot_sectors, &mut params)?;
    params.serialized = true;
    params.serial_number = serial;

    let boot = init_boot_sector(&params, dev, tot_sectors, media, label, serial);

    let sector_size = params.sector_size as usize;
    let disk = Box::new(crate::wrap_fs_buffer(disk, dev, params.sector_size)?);
    let is_fat32 = params.fat_bits == 32;
    let mut fs = Fs {
        disk,
        params,
        drive: dev.drive,
        media,
        tot_sectors,
        fat_cache_sector: NONE32,
        fat_cache: vec![0; sector_size],
        fat_access: FatAccess::None,
        last: 0,
        free_space: NONE32,
        preallocated_clusters: 0,
        batch_mode: false,
        files: HashMap::new(),
        converter: Rc::new(AsciiConverter),
    };

    write_exact(&mut *fs.disk, boot.as_bytes(), 0)?;
    if is_fat32 {
        if fs.params.backup_boot != 0 {
            let pos = fs.sectors_to_bytes(fs.params.backup_boot as u32);
            write_exact(&mut *fs.disk, boot.as_bytes(), pos)?;
        }
    }

    fs.zero_fat(media)?;

    if is_fat32 {
        // The root directory is an ordinary chain: allocate its first
        // cluster and blank it.
        let root_cluster = fs.params.root_cluster;
        let end_fat = fs.params.end_fat;
        fs.fat_allocate(root_cluster, end_fat)?;
        fs.last = root_cluster;
        let cluster_bytes = fs.cluster_bytes() as usize;
        let pos = fs.sectors_to_bytes(
            fs.params.clus_start + (root_cluster - 2) * fs.params.cluster_size as u32,
        );
        write_exact(&mut *fs.disk, &vec![0u8; cluster_bytes], pos)?;
    } else {
        // Blank fixed root directory.
        let dir_bytes = fs.params.dir_len as usize * sector_size;
        let pos = fs.sectors_to_bytes(fs.params.dir_start());
        write_exact(&mut *fs.disk, &vec![0u8; dir_bytes], pos)?;
    }

    if label.is_some() {
        let now = std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let mut entry = DirEntry::new(
            &mdisk_fs::DosName::new("", ""),
            ATTR_VOLUME_ID,
            0,
            0,
            now,
        );
        let bytes = label_bytes(label);
        entry.name.copy_from_slice(&bytes[..8]);
        entry.ext.copy_from_slice(&bytes[8..]);
        let root_start = if is_fat32 {
            fs.sectors_to_bytes(fs.params.clus_start)
        } else {
            fs.sectors_to_bytes(fs.params.dir_start())
        };
        write_exact(&mut *fs.disk, entry.as_bytes(), root_start)?;
    }

    fs.fat_flush_cache()?;
    fs.write_info_sector()?;
    fs.disk.flush()?;

    Ok(FatFs {
        fs: Rc::new(RefCell::new(fs)),
    })
}

fn write_exact(disk: &mut dyn Stream, buf: &[u8], pos: u64) -> Result<()> {
    let got = force_pwrite(disk, buf, pos)?;
    if got != buf.len() {
        return Err(Error::ShortIo {
            offset: pos,
            wanted: buf.len(),
            got,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(
        tot_sectors: u32,
        tracks: u32,
        heads: u16,
        sectors: u16,
        fat_bits: i32,
        cluster_size: u8,
        fat32: bool,
    ) -> Result<(FsParams, u8)> {
        let dev = Device {
            tot_sectors,
            tracks,
            heads,
            sectors,
            fat_bits,
            ..Device::default()
        };
        let mut params = FsParams {
            cluster_size,
            ..FsParams::default()
        };
        let media = calc_fs_parameters(&dev, fat32, tot_sectors, &mut params)?;
        Ok((params, media))
    }

    #[test]
    fn high_density_floppy_uses_preset() {
        let (params, media) = plan(2880, 80, 2, 18, 0, 0, false).unwrap();
        assert_eq!(media, 0xF0);
        assert_eq!(params.fat_bits, 12);
        assert_eq!(params.cluster_size, 1);
        assert_eq!(params.dir_len, 14);
        assert_eq!(params.fat_len, 9);
        assert_eq!(params.fat_start, 1);
        assert_eq!(params.num_fat, 2);
        assert_eq!(params.num_clus, 2847);
        assert_eq!(params.dir_start(), 19);
        assert_eq!(params.clus_start, 33);
    }

    #[test]
    fn padding_keeps_fat12_below_ceiling() {
        // Slightly too many clusters for FAT12 with everything pinned;
        // without padding this cannot be formatted as FAT12 at all.
        let (params, _) = plan(8400, 200, 2, 21, 12, 1, false).unwrap();
        assert_eq!(params.fat_bits, 12);
        assert!(params.num_clus <= 4084, "num_clus={}", params.num_clus);
        // The surplus went into the header, not into thin air.
        assert!(params.fat_len > 25 || params.dir_len > 32);
    }

    #[test]
    fn tiny_images_are_rejected() {
        assert!(matches!(
            plan(8, 0, 4, 5, 0, 0, false),
            Err(Error::FormatInfeasible(FormatError::TooFewSectors))
        ));
    }

    #[test]
    fn fat32_layout_has_its_specific_fields() {
        let (params, media) = plan(1_048_576, 0, 0, 0, 0, 0, true).unwrap();
        assert_eq!(media, 0xF8);
        assert_eq!(params.fat_bits, 32);
        assert_eq!(params.dir_len, 0);
        assert_eq!(params.fat_start, 32);
        assert_eq!(params.backup_boot, 6);
        assert_eq!(params.root_cluster, 2);
        assert_eq!(params.info_sector_loc, 1);
        assert!(params.write_all_fats);
        assert!(params.num_clus >= FAT16_MAX);
    }

    #[test]
    fn planner_output_is_always_valid() {
        let mut tot = 1000u32;
        while tot < 600_000 {
            let (params, _) = plan(tot, 0, 4, 32, 0, 0, false).unwrap();
            let used = params.clus_start as u64 + params.num_clus as u64 * params.cluster_size as u64;
            assert!(used <= tot as u64, "tot={tot}");
            assert!((tot as u64) < used + params.cluster_size as u64, "tot={tot}");
            assert!(
                (params.num_clus as u64 + 2) * (params.fat_bits as u64 / 4)
                    <= params.fat_len as u64 * params.sector_size as u64 * 2,
                "tot={tot}"
            );
            tot += 7919;
        }
    }

    #[test]
    fn planner_is_monotone_in_sector_count() {
        // Fixed geometry and cluster size: growing the disk never lowers
        // the FAT bits or the cluster count.
        let mut last_bits = 0;
        let mut last_clus = 0;
        let mut tot = 1000u32;
        while tot < 600_000 {
            let (params, _) = plan(tot, 0, 4, 32, 0, 4, false).unwrap();
            assert!(params.fat_bits >= last_bits, "tot={tot}");
            assert!(params.num_clus >= last_clus, "tot={tot}");
            last_bits = params.fat_bits;
            last_clus = params.num_clus;
            tot += 997;
        }
    }

    #[test]
    fn boot_sector_mirrors_planned_layout() {
        let (params, media) = plan(2880, 80, 2, 18, 0, 0, false).unwrap();
        let dev = Device {
            tot_sectors: 2880,
            tracks: 80,
            heads: 2,
            sectors: 18,
            ..Device::default()
        };
        let boot = init_boot_sector(&params, &dev, 2880, media, Some("TESTDISK"), 0x1234_5678);
        assert_eq!(boot.signature, [0x55, 0xAA]);
        assert_eq!(boot.psect.get(), 2880);
        assert_eq!(boot.fatlen.get(), 9);
        assert_eq!(boot.dirents.get(), 224);
        assert_eq!(boot.descr, 0xF0);
        assert_eq!(boot.label_block().serial.get(), 0x1234_5678);
        assert_eq!(&boot.label_block().fat_type, b"FAT12   ");
        assert_eq!(&boot.label_block().label, b"TESTDISK   ");
    }
}
