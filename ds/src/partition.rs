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

//! Partition window over a partitioned device: selects one of the four
//! primary MBR partitions and translates every I/O into it.

use log::warn;
use mdisk_err::{Error, Result};
use zerocopy::{
    little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::{device::Device, force_pread, limit_len, Stream, StreamData};

/// Byte offset of the partition table inside the MBR.
pub const PARTITION_TABLE_OFFSET: usize = 0x1BE;
/// Byte offset of the 0x55 0xAA boot signature.
pub const MBR_SIGNATURE_OFFSET: usize = 510;

/// Packed cylinder/head/sector address as stored in a partition entry:
/// head, then sector in the low 6 bits with cylinder bits 8-9 in the top 2,
/// then the low 8 cylinder bits.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Chs {
    head: u8,
    sector: u8,
    cyl: u8,
}

impl Chs {
    pub fn head(&self) -> u8 {
        self.head
    }

    pub fn sector(&self) -> u8 {
        self.sector & 0x3F
    }

    pub fn cyl(&self) -> u16 {
        self.cyl as u16 | ((self.sector as u16 & 0xC0) << 2)
    }

    /// Encodes a linear sector number. Falls back to the all-zero linear
    /// marker when the address does not fit 8-bit heads and 10-bit
    /// cylinders.
    fn set(&mut self, lba: u32, heads: u16, sectors: u16) {
        if heads == 0 || sectors == 0 {
            *self = Chs::default();
            return;
        }
        let sector = lba % sectors as u32;
        let rest = lba / sectors as u32;
        let head = rest % heads as u32;
        let cyl = rest / heads as u32;
        if cyl > 1023 || head > u8::MAX as u32 {
            *self = Chs::default();
            return;
        }
        self.head = head as u8;
        self.sector = (sector as u8 + 1) | (((cyl & 0x300) >> 2) as u8);
        self.cyl = (cyl & 0xFF) as u8;
    }
}

/// One 16-byte entry of the primary partition table.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PartitionEntry {
    pub boot_ind: u8,
    pub start: Chs,
    pub sys_ind: u8,
    pub end: Chs,
    start_sect: U32,
    nr_sects: U32,
}

impl PartitionEntry {
    /// First sector, counting from the start of the device.
    pub fn begin(&self) -> u32 {
        self.start_sect.get()
    }

    /// One past the last sector.
    pub fn end_sector(&self) -> u32 {
        self.start_sect.get().wrapping_add(self.nr_sects.get())
    }

    pub fn nr_sects(&self) -> u32 {
        self.nr_sects.get()
    }

    pub fn is_empty(&self) -> bool {
        self.sys_ind == 0
    }
}

/// Picks the partition type byte for a new entry when the caller did not
/// force one.
pub fn default_partition_type(begin: u32, end: u32, heads: u16, sectors: u16, fat_bits: u32) -> u8 {
    // Without the cluster count only the size gives a rough estimate of the
    // FAT bits actually in use.
    let fat_bits = if fat_bits == 0 {
        if end - begin < 4096 {
            12
        } else {
            16
        }
    } else {
        fat_bits
    };

    if fat_bits == 32 {
        0x0C // Win95 FAT32, LBA
    } else if end < 65536 {
        if fat_bits == 12 {
            0x01 // DOS FAT12, CHS
        } else {
            0x04 // DOS FAT16 below 32M, CHS
        }
    } else if heads != 0 && sectors != 0 && (end - 1) / (heads as u32 * sectors as u32) <= 1023 {
        0x06 // DOS big FAT16, CHS
    } else {
        0x0E // Win95 FAT16, LBA
    }
}

/// Fills in a partition entry for `[begin, end)`.
pub fn set_begin_end(
    entry: &mut PartitionEntry,
    begin: u32,
    end: u32,
    heads: u16,
    sectors: u16,
    activate: bool,
    partition_type: u8,
    fat_bits: u32,
) {
    entry.start.set(begin, heads, sectors);
    entry.end.set(end - 1, heads, sectors);
    entry.start_sect = U32::new(begin);
    entry.nr_sects = U32::new(end - begin);
    entry.boot_ind = if activate { 0x80 } else { 0 };
    entry.sys_ind = if partition_type != 0 {
        partition_type
    } else {
        default_partition_type(begin, end, heads, sectors, fat_bits)
    };
}

/// Parses the four primary entries out of an MBR sector.
pub fn partition_table(sector: &[u8]) -> Result<[PartitionEntry; 4]> {
    if sector.len() < 512 {
        return Err(Error::BadPartition("sector too short"));
    }
    let mut table = [PartitionEntry::default(); 4];
    for (i, entry) in table.iter_mut().enumerate() {
        let offset = PARTITION_TABLE_OFFSET + i * size_of::<PartitionEntry>();
        *entry = PartitionEntry::read_from_bytes(
            &sector[offset..offset + size_of::<PartitionEntry>()],
        )
        .map_err(|_| Error::BadPartition("unreadable entry"))?;
    }
    Ok(table)
}

pub fn has_mbr_signature(sector: &[u8]) -> bool {
    sector.len() > MBR_SIGNATURE_OFFSET + 1
        && u16::from_le_bytes([
            sector[MBR_SIGNATURE_OFFSET],
            sector[MBR_SIGNATURE_OFFSET + 1],
        ]) == 0xAA55
}

fn overlaps(table: &[PartitionEntry; 4], until: usize, start: u32, end: u32) -> Option<usize> {
    for (i, entry) in table.iter().enumerate().take(until) {
        if entry.is_empty() {
            continue;
        }
        if end > entry.begin() && (start < entry.end_sector() || entry.end_sector() < entry.begin())
        {
            return Some(i + 1);
        }
    }
    None
}

/// Sanity-checks the four primaries against each other and the device size.
/// Problems are logged; the return value only says whether any overlap was
/// found. Returns the number of active partitions as well.
pub fn consistency_check(table: &[PartitionEntry; 4], tot_sectors: u32) -> (bool, u32) {
    let mut inconsistent = false;
    let mut has_activated = 0;
    for (i, entry) in table.iter().enumerate() {
        if entry.is_empty() {
            continue;
        }
        let nr = i + 1;
        if entry.boot_ind != 0 {
            has_activated += 1;
        }
        if entry.end_sector() < entry.begin() {
            warn!("end of partition {nr} before its begin");
        }
        if let Some(j) = overlaps(table, i, entry.begin(), entry.end_sector()) {
            warn!("partitions {j} and {nr} overlap");
            inconsistent = true;
        }
        if tot_sectors != 0 && entry.end_sector() > tot_sectors {
            warn!("partition {nr} extends beyond end of disk");
        }
    }
    (inconsistent, has_activated)
}

pub struct PartitionStream {
    next: Box<dyn Stream>,

    /// Start of the partition, in bytes.
    offset: u64,
    /// Size of the partition, in bytes.
    size: u64,
    nb_sect: u32,
}

impl PartitionStream {
    fn limit(&self, start: u64, len: &mut usize) -> Result<()> {
        if start > self.size {
            return Err(Error::BadOffset { offset: start });
        }
        limit_len(len, self.size - start);
        Ok(())
    }
}

impl Stream for PartitionStream {
    fn next(&mut self) -> Option<&mut dyn Stream> {
        Some(&mut *self.next)
    }

    fn pread(&mut self, buf: &mut [u8], start: u64) -> Result<usize> {
        let mut len = buf.len();
        self.limit(start, &mut len)?;
        self.next.pread(&mut buf[..len], start + self.offset)
    }

    fn pwrite(&mut self, buf: &[u8], start: u64) -> Result<usize> {
        let mut len = buf.len();
        self.limit(start, &mut len)?;
        self.next.pwrite(&buf[..len], start + self.offset)
    }

    fn set_geometry(&mut self, dev: &mut Device, _orig: &Device) -> Result<()> {
        if dev.tot_sectors == 0 {
            dev.tot_sectors = self.nb_sect;
        }
        Ok(())
    }

    fn data(&mut self) -> Result<StreamData> {
        let mut data = self.next.data()?;
        data.size = self.size;
        Ok(data)
    }
}

/// Opens the primary partition selected by `dev.partition` (1-4).
///
/// Reads and validates the MBR, records the partition window, and shrinks
/// `max_size` to the space reachable behind it. An inconsistent table is
/// only warned about; a missing signature or empty slot is fatal.
pub fn open_partition(
    mut next: Box<dyn Stream>,
    dev: &mut Device,
    max_size: &mut u64,
) -> Result<PartitionStream> {
    if dev.partition == 0 || dev.partition > 4 {
        return Err(Error::BadPartition("partition must be between 1 and 4"));
    }

    let mut sector = [0u8; 512];
    let got = force_pread(&mut *next, &mut sector, 0)?;
    if got != sector.len() {
        return Err(Error::ShortIo {
            offset: 0,
            wanted: sector.len(),
            got,
        });
    }
    if !has_mbr_signature(&sector) {
        return Err(Error::BadPartition("no BIOS partition table signature"));
    }

    let table = partition_table(&sector)?;
    let entry = &table[dev.partition as usize - 1];
    if entry.is_empty() {
        return Err(Error::BadPartition("partition does not exist"));
    }

    let part_off = entry.begin();
    if part_off as u64 > *max_size >> 9 {
        return Err(Error::BadOffset {
            offset: (part_off as u64) << 9,
        });
    }
    *max_size -= (part_off as u64) << 9;
    if *max_size > (entry.nr_sects() as u64) << 9 {
        *max_size = (entry.nr_sects() as u64) << 9;
    }

    let (inconsistent, _) = consistency_check(&table, dev.tot_sectors);
    if inconsistent {
        warn!(
            "inconsistent partition table, possibly unpartitioned device; \
             maybe try without partition={} in the device definition",
            dev.partition
        );
    }

    let nb_sect = entry.nr_sects();
    dev.tot_sectors = nb_sect;
    Ok(PartitionStream {
        next,
        offset: (part_off as u64) << 9,
        size: (nb_sect as u64) << 9,
        nb_sect,
    })
}
