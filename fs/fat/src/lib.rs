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

//! FAT12/16/32 engine over a layered stream stack: mounts, reads, writes
//! and formats DOS filesystem images without going through the host kernel.

pub mod boot;
pub mod dir;
pub mod file;
pub mod format;
pub mod info;
pub mod loopdetect;
pub mod olddos;
pub mod params;
pub mod table;

use std::{
    cell::RefCell,
    collections::HashMap,
    path::Path,
    rc::{Rc, Weak},
};

use log::warn;
use mdisk_ds::{
    buffer::BufferedStream,
    device::Device,
    force_pread,
    offset::open_offset,
    partition::open_partition,
    remap::open_remap,
    swap::SwapStream,
    Stream,
};
use mdisk_ds_file::{open_image, OpenMode};
use mdisk_err::{Error, Result};
use mdisk_fs::{AsciiConverter, DosConverter};
use zerocopy::{FromZeros, IntoBytes};

pub use crate::{
    boot::BootSector,
    dir::FatNode,
    file::{FatDir, FileHandle},
    params::FsParams,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FatAccess {
    None,
    Read,
    Write,
}

/// Sentinel for "no FAT sector cached" and "free space unknown".
pub(crate) const NONE32: u32 = u32::MAX;

/// The live filesystem: layout parameters plus the disk stack, the
/// single-sector FAT cache, the allocation bookkeeping and the table of
/// open files.
pub(crate) struct Fs {
    pub(crate) disk: Box<dyn Stream>,
    pub(crate) params: FsParams,
    pub(crate) drive: char,
    pub(crate) media: u8,
    pub(crate) tot_sectors: u32,

    /// Sector of the primary FAT sitting in `fat_cache`, or [`NONE32`].
    pub(crate) fat_cache_sector: u32,
    pub(crate) fat_cache: Vec<u8>,
    pub(crate) fat_access: FatAccess,

    /// Most recently allocated cluster, scan hint for the allocator.
    pub(crate) last: u32,
    /// Free cluster count, or [`NONE32`] when not counted yet.
    pub(crate) free_space: u32,
    /// Clusters promised to open files but not yet written into the FAT.
    pub(crate) preallocated_clusters: u32,

    /// Pad writes at end of file to whole clusters, saving the read-back of
    /// the cluster tail.
    pub(crate) batch_mode: bool,

    /// Open-file interning: one in-memory handle per first cluster.
    pub(crate) files: HashMap<u32, Weak<RefCell<file::FatFile>>>,

    pub(crate) converter: Rc<dyn DosConverter>,
}

impl Fs {
    pub(crate) fn sectors_to_bytes(&self, sectors: u32) -> u64 {
        self.params.sectors_to_bytes(sectors)
    }

    pub(crate) fn cluster_bytes(&self) -> u32 {
        self.params.cluster_bytes()
    }
}

fn get_media_type(disk: &mut dyn Stream, boot: &BootSector) -> Result<i32> {
    let media = boot.descr;
    if media < boot::OLD_DOS_MEDIA_LIMIT {
        // Old DOS disk: the media descriptor lives in the first FAT byte.
        // 512-byte sectors are a given on those.
        let mut sector = [0u8; 512];
        if force_pread(disk, &mut sector, 512)? == 512 {
            Ok(sector[0] as i32)
        } else {
            Ok(0)
        }
    } else {
        Ok(media as i32 + 0x100)
    }
}

/// Wraps the disk stack in the full-cylinder write-coalescing buffer the
/// filesystem engine works through. Large cylinders fall back to one track
/// so the window stays reasonable.
pub(crate) fn wrap_fs_buffer(
    disk: Box<dyn Stream>,
    dev: &Device,
    sector_size: u16,
) -> Result<BufferedStream> {
    let cylinder_size = dev.heads as u32 * dev.sectors as u32;
    let mut disk_size: u32 = if dev.tracks != 0 && cylinder_size != 0 {
        cylinder_size
    } else {
        512
    };
    if disk_size > 256 {
        disk_size = dev.sectors as u32;
        if dev.sectors % 2 == 1 {
            disk_size <<= 1;
        }
    }
    if disk_size % 2 == 1 {
        disk_size *= 2;
    }
    if disk_size == 0 {
        disk_size = 512;
    }
    let blocksize = dev.blocksize.max(sector_size as u32);
    BufferedStream::new(
        disk,
        (8 * disk_size * blocksize) as usize,
        (disk_size * blocksize) as usize,
        sector_size as usize,
    )
}

/// Opens the image or device behind `dev` and pushes the remapping,
/// offset, byte-swap and partition layers it asks for, in that order.
/// Returns the assembled stack and the maximal usable byte count.
pub fn open_image_stack(
    dev: &mut Device,
    path: &Path,
    mode: OpenMode,
) -> Result<(Box<dyn Stream>, u64)> {
    let orig = dev.clone();
    let (terminal, mut max_size) = open_image(dev, &orig, path, mode)?;
    let mut stack: Box<dyn Stream> = Box::new(terminal);

    if dev.data_map.is_some() {
        stack = Box::new(open_remap(stack, dev)?);
    }
    if dev.offset != 0 {
        let offset = dev.offset;
        stack = Box::new(open_offset(stack, dev, offset, &mut max_size)?);
    }
    if dev.misc_flags.do_swap() {
        stack = Box::new(SwapStream::new(stack));
    }
    if dev.partition != 0 {
        stack = Box::new(open_partition(stack, dev, &mut max_size)?);
    }
    Ok((stack, max_size))
}

/// A mounted FAT filesystem. Cheap to clone; all clones share one engine
/// state. Single-threaded by design.
#[derive(Clone)]
pub struct FatFs {
    pub(crate) fs: Rc<RefCell<Fs>>,
}

impl FatFs {
    /// Opens the image at `path` as described by `dev` and mounts the
    /// filesystem on it. A read-only open that fails while establishing
    /// geometry is retried read-write, as geometry changes may need write
    /// access.
    pub fn open(dev: &mut Device, path: &Path, mode: OpenMode) -> Result<FatFs> {
        let stack = match open_image_stack(dev, path, mode) {
            Err(Error::GeometryFailed) if mode == OpenMode::ReadOnly => {
                open_image_stack(dev, path, OpenMode::ReadWrite)?
            }
            other => other?,
        };
        Self::mount(stack.0, dev, stack.1)
    }

    /// Mounts the filesystem found on an already assembled disk stack.
    pub fn mount(mut disk: Box<dyn Stream>, dev: &mut Device, max_size: u64) -> Result<FatFs> {
        let mut boot = BootSector::new_zeroed();
        let got = force_pread(&mut *disk, boot.as_mut_bytes(), 0)?;
        if got < 256 {
            return Err(Error::BadBootSector("could not read boot sector"));
        }

        let media = get_media_type(&mut *disk, &boot)?;
        if media <= 0xF0 {
            return Err(Error::BadBootSector("non-DOS media"));
        }

        boot::boot_to_geom(dev, media, &boot)?;
        let orig = dev.clone();
        disk.set_geometry(dev, &orig)?;

        let cylinder_size = dev.heads as u32 * dev.sectors as u32;
        let (params, tot_sectors) = boot::parse_fs_params(&boot, media, cylinder_size)?;

        mdisk_ds::device::check_if_sectors_fit(tot_sectors, max_size, params.sector_size as u32)?;

        let disk: Box<dyn Stream> = Box::new(wrap_fs_buffer(disk, dev, params.sector_size)?);

        let sector_size = params.sector_size as usize;
        let fat32 = params.fat_bits == 32;
        let mut fs = Fs {
            disk,
            params,
            drive: dev.drive,
            media: media as u8,
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

        let first_fat_byte = fs.fat_byte(0)?;
        if first_fat_byte != media as u8 {
            warn!(
                "drive {}: FAT media byte {first_fat_byte:02x} does not match boot sector {:02x}",
                fs.drive, media as u8
            );
        }
        if fat32 {
            fs.read_info_sector()?;
        }

        Ok(FatFs {
            fs: Rc::new(RefCell::new(fs)),
        })
    }

    /// Pushes every piece of dirty engine state down to the device: the
    /// cached FAT sector, the FAT32 info sector, and the buffer window.
    pub fn flush(&self) -> Result<()> {
        let mut fs = self.fs.borrow_mut();
        fs.fat_flush_cache()?;
        fs.write_info_sector()?;
        fs.disk.flush()
    }

    /// Copy of the layout parameters.
    pub fn fs_params(&self) -> FsParams {
        self.fs.borrow().params.clone()
    }

    pub fn tot_sectors(&self) -> u32 {
        self.fs.borrow().tot_sectors
    }

    pub fn drive(&self) -> char {
        self.fs.borrow().drive
    }

    pub fn converter(&self) -> Rc<dyn DosConverter> {
        Rc::clone(&self.fs.borrow().converter)
    }

    /// Batch mode rounds end-of-file writes up to whole clusters so the
    /// tail never has to be read back from disk.
    pub fn set_batch_mode(&self, batch_mode: bool) {
        self.fs.borrow_mut().batch_mode = batch_mode;
    }

    /// Free space in bytes, honoring outstanding pre-allocations.
    pub fn get_free_bytes(&self) -> Result<u64> {
        let mut fs = self.fs.borrow_mut();
        let free = fs.get_free_space()?;
        let free = free.saturating_sub(fs.preallocated_clusters);
        Ok(free as u64 * fs.cluster_bytes() as u64)
    }

    /// Whether at least `n` clusters are still free and unreserved.
    pub fn get_free_min_clusters(&self, n: u32) -> Result<bool> {
        self.fs.borrow_mut().get_free_min_clusters(n)
    }

    /// Reserves `n` future clusters against the free-space accounting, so
    /// free-space queries stay honest for data that is yet to be written.
    pub fn preallocate_clusters(&self, n: u32) -> Result<()> {
        self.fs.borrow_mut().preallocate_clusters(n)
    }

    /// Returns clusters reserved with [`Self::preallocate_clusters`].
    pub fn release_preallocated_clusters(&self, n: u32) {
        self.fs.borrow_mut().release_preallocated_clusters(n)
    }

    /// Clusters currently reserved, for free-space accounting checks.
    pub fn preallocated_clusters(&self) -> u32 {
        self.fs.borrow().preallocated_clusters
    }
}

impl Drop for Fs {
    fn drop(&mut self) {
        let _ = self.fat_flush_cache();
        let _ = self.write_info_sector();
        let _ = self.disk.flush();
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Growable memory-backed terminal stream shared with the test body.
    #[derive(Clone)]
    pub struct RamDisk(Rc<RefCell<Vec<u8>>>);

    impl RamDisk {
        pub fn new(size: usize) -> Self {
            Self(Rc::new(RefCell::new(vec![0; size])))
        }

        pub fn bytes(&self, offset: usize, len: usize) -> Vec<u8> {
            self.0.borrow()[offset..offset + len].to_vec()
        }
    }

    impl Stream for RamDisk {
        fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
            let data = self.0.borrow();
            let offset = offset as usize;
            if offset >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }

        fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
            let mut data = self.0.borrow_mut();
            let offset = offset as usize;
            if offset + buf.len() > data.len() {
                data.resize(offset + buf.len(), 0);
            }
            data[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    pub fn test_params(fat_bits: u32, num_clus: u32, cluster_size: u8) -> FsParams {
        let mut params = FsParams {
            cluster_size,
            fat_start: 1,
            num_fat: 2,
            ..FsParams::default()
        };
        params.num_clus = num_clus;
        params.set_fat();
        assert_eq!(params.fat_bits, fat_bits, "cluster count fits other bits");
        let entry_bytes = (num_clus as u64 + 2) * params.fat_nybbles() as u64 / 2 + 1;
        params.fat_len = entry_bytes.div_ceil(params.sector_size as u64) as u32;
        if fat_bits == 32 {
            params.dir_len = 0;
            params.root_cluster = 2;
            params.info_sector_loc = 1;
            params.fat_start = 32;
        } else {
            params.dir_len = 14;
        }
        params.clus_start = params.calc_clus_start();
        params
    }

    pub fn test_fs_with_disk(fat_bits: u32, num_clus: u32, cluster_size: u8) -> (Fs, RamDisk) {
        let params = test_params(fat_bits, num_clus, cluster_size);
        let ram = RamDisk::new(params.sectors_to_bytes(params.clus_start) as usize);
        let sector_size = params.sector_size as usize;
        let tot_sectors = params.clus_start + num_clus * cluster_size as u32;
        let fs = Fs {
            disk: Box::new(ram.clone()),
            params,
            drive: 'A',
            media: 0xF0,
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
        (fs, ram)
    }

    pub fn test_fs(fat_bits: u32, num_clus: u32, cluster_size: u8) -> Fs {
        test_fs_with_disk(fat_bits, num_clus, cluster_size).0
    }
}
