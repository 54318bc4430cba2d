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

//! End-to-end scenarios: format an image, put files on it, corrupt it,
//! and check every byte where it matters.

use std::{cell::RefCell, rc::Rc};

use mdisk_ds::{device::Device, force_pread, force_pwrite, Stream};
use mdisk_err::{Error, Result};
use mdisk_fs::{
    record::{DirEntry, ATTR_ARCHIVE, ATTR_DIRECTORY},
    DosName,
};
use mdisk_fs_fat::{
    format::make_filesystem,
    FatFs, FatNode, FsParams,
};

/// Growable in-memory image shared between the filesystem and the test.
#[derive(Clone)]
struct RamDisk(Rc<RefCell<Vec<u8>>>);

impl RamDisk {
    fn new(size: usize) -> Self {
        Self(Rc::new(RefCell::new(vec![0; size])))
    }

    fn byte(&self, offset: usize) -> u8 {
        self.0.borrow()[offset]
    }

    fn bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.0.borrow()[offset..offset + len].to_vec()
    }

    fn poke(&self, offset: usize, data: &[u8]) {
        self.0.borrow_mut()[offset..offset + data.len()].copy_from_slice(data);
    }

    fn fat12_entry(&self, fat_start: usize, cluster: usize) -> u16 {
        let pos = fat_start * 512 + cluster * 3 / 2;
        let b0 = self.byte(pos) as u16;
        let b1 = self.byte(pos + 1) as u16;
        if cluster % 2 == 0 {
            b0 | (b1 & 0x0F) << 8
        } else {
            b0 >> 4 | b1 << 4
        }
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

fn floppy_device() -> Device {
    Device {
        tot_sectors: 2880,
        tracks: 80,
        heads: 2,
        sectors: 18,
        ..Device::default()
    }
}

fn format_floppy(ram: &RamDisk) -> FatFs {
    let mut dev = floppy_device();
    make_filesystem(
        Box::new(ram.clone()),
        &mut dev,
        FsParams::default(),
        false,
        None,
        0x2B2B_2B2B,
    )
    .unwrap()
}

const STAMP: i64 = 1623760208;

#[test]
fn format_writes_a_mountable_1440k_floppy() {
    let ram = RamDisk::new(1_474_560);
    let fs = format_floppy(&ram);

    let params = fs.fs_params();
    assert_eq!(params.fat_bits, 12);
    assert_eq!(params.cluster_size, 1);
    assert_eq!(params.dir_len, 14);
    assert_eq!(params.fat_len, 9);
    assert_eq!(params.fat_start, 1);
    assert_eq!(params.num_fat, 2);
    assert_eq!(params.num_clus, 2847);
    assert_eq!(params.dir_start(), 19);
    assert_eq!(params.clus_start, 33);
    drop(fs);

    assert_eq!(ram.byte(510), 0x55);
    assert_eq!(ram.byte(511), 0xAA);
    assert_eq!(ram.byte(21), 0xF0);
    // Media descriptor entry at the head of both FAT copies.
    assert_eq!(ram.bytes(512, 3), vec![0xF0, 0xFF, 0xFF]);
    assert_eq!(ram.bytes(10 * 512, 3), vec![0xF0, 0xFF, 0xFF]);

    let mut dev = Device::default();
    let fs = FatFs::mount(Box::new(ram.clone()), &mut dev, u64::MAX).unwrap();
    let params = fs.fs_params();
    assert_eq!(params.fat_bits, 12);
    assert_eq!(params.num_clus, 2847);
    assert_eq!((dev.tracks, dev.heads, dev.sectors), (80, 2, 18));
}

#[test]
fn small_file_lands_in_the_first_cluster() {
    let ram = RamDisk::new(1_474_560);
    let fs = format_floppy(&ram);

    let mut root = fs.open_root().unwrap();
    let entry = DirEntry::new(&DosName::new("HELLO", "TXT"), ATTR_ARCHIVE, 0, 4, STAMP);
    root.write_entry(0, &entry).unwrap();

    let FatNode::File(file) = fs.open_by_direntry(&root, 0).unwrap() else {
        panic!("HELLO.TXT opened as a directory");
    };
    assert_eq!(file.write_at(b"Hi!\n", 0).unwrap(), 4);
    file.flush().unwrap();
    let rec = root.read_entry(0).unwrap().unwrap();
    let entry_name = root.format_name(&rec);
    root.flush().unwrap();
    fs.flush().unwrap();
    drop((file, root, fs));

    // Root slot 0: name, start cluster 2, size 4.
    let root_start = 19 * 512;
    assert_eq!(ram.bytes(root_start, 11), b"HELLO   TXT".to_vec());
    assert_eq!(entry_name, "HELLO.TXT");
    assert_eq!(ram.bytes(root_start + 26, 2), vec![2, 0]);
    assert_eq!(ram.bytes(root_start + 28, 4), vec![4, 0, 0, 0]);
    // FAT entry 2 terminates the chain.
    assert_eq!(ram.fat12_entry(1, 2), 0xFFF);
    // Payload at the first data sector.
    assert_eq!(ram.bytes(33 * 512, 4), vec![0x48, 0x69, 0x21, 0x0A]);
}

#[test]
fn growing_a_file_chains_clusters() {
    let ram = RamDisk::new(1_474_560);
    let fs = format_floppy(&ram);

    let mut root = fs.open_root().unwrap();
    let entry = DirEntry::new(&DosName::new("HELLO", "TXT"), ATTR_ARCHIVE, 0, 4, STAMP);
    root.write_entry(0, &entry).unwrap();
    let FatNode::File(mut file) = fs.open_by_direntry(&root, 0).unwrap() else {
        panic!("HELLO.TXT opened as a directory");
    };
    file.write_at(b"Hi!\n", 0).unwrap();

    let tail = vec![0xAAu8; 1024];
    assert_eq!(force_pwrite(&mut file, &tail, 4).unwrap(), 1024);
    assert_eq!(file.file_size(), 1028);

    file.flush().unwrap();
    root.flush().unwrap();
    fs.flush().unwrap();
    drop((file, root, fs));

    assert_eq!(ram.fat12_entry(1, 2), 3);
    assert_eq!(ram.fat12_entry(1, 3), 4);
    assert_eq!(ram.fat12_entry(1, 4), 0xFFF);
    assert_eq!(ram.byte(33 * 512 + 4), 0xAA);
    assert_eq!(ram.byte(35 * 512 + 3), 0xAA);
}

#[test]
fn corrupted_chain_is_reported_not_walked_forever() {
    // 16 MB FAT16 image with cluster 5 pointing at itself.
    let ram = RamDisk::new(16 * 1024 * 1024);
    let mut dev = Device {
        tot_sectors: 32768,
        ..Device::default()
    };
    let fs = make_filesystem(
        Box::new(ram.clone()),
        &mut dev,
        FsParams::default(),
        false,
        None,
        0,
    )
    .unwrap();
    let params = fs.fs_params();
    assert_eq!(params.fat_bits, 16);
    drop(fs);

    let fat_start = params.fat_start as usize * 512;
    ram.poke(fat_start + 5 * 2, &[5, 0]);

    let mut dev = Device::default();
    let fs = FatFs::mount(Box::new(ram.clone()), &mut dev, u64::MAX).unwrap();
    let file = fs.open_by_cluster(5, 1 << 20).unwrap();
    let mut buf = [0u8; 16];
    let err = file.read_at(&mut buf, 512 * 1000).unwrap_err();
    assert!(matches!(err, Error::LoopDetected { .. }));
}

#[test]
fn reads_get_back_what_writes_put_in() {
    fn xorshift(state: &mut u32) -> u8 {
        *state ^= *state << 13;
        *state ^= *state >> 17;
        *state ^= *state << 5;
        (*state >> 24) as u8
    }

    for n in [1usize, 512, 4096, 65537] {
        let ram = RamDisk::new(4 * 1024 * 1024);
        let mut dev = Device {
            tot_sectors: 8192,
            ..Device::default()
        };
        let fs = make_filesystem(
            Box::new(ram.clone()),
            &mut dev,
            FsParams::default(),
            false,
            None,
            0,
        )
        .unwrap();

        let mut root = fs.open_root().unwrap();
        let entry = DirEntry::new(&DosName::new("DATA", "BIN"), ATTR_ARCHIVE, 0, 0, STAMP);
        root.write_entry(0, &entry).unwrap();
        let FatNode::File(mut file) = fs.open_by_direntry(&root, 0).unwrap() else {
            panic!("DATA.BIN opened as a directory");
        };

        let mut state = 0x1234_5678u32 ^ n as u32;
        let payload: Vec<u8> = (0..n).map(|_| xorshift(&mut state)).collect();
        // A misaligned offset makes the engine split the transfer across
        // cluster runs.
        let offset = 31;
        assert_eq!(force_pwrite(&mut file, &payload, offset).unwrap(), n);

        let mut back = vec![0u8; n];
        assert_eq!(force_pread(&mut file, &mut back, offset).unwrap(), n);
        assert_eq!(back, payload, "n={n}");

        file.flush().unwrap();
        root.flush().unwrap();
        fs.flush().unwrap();

        // Same bytes after everything went through the device.
        let mut dev = Device::default();
        let fs2 = FatFs::mount(Box::new(ram.clone()), &mut dev, u64::MAX).unwrap();
        let first = {
            let mut root2 = fs2.open_root().unwrap();
            root2.read_entry(0).unwrap().unwrap().start()
        };
        let mut file2 = fs2
            .open_by_cluster(first, (offset as usize + n) as u32)
            .unwrap();
        let mut back = vec![0u8; n];
        assert_eq!(force_pread(&mut file2, &mut back, offset).unwrap(), n);
        assert_eq!(back, payload, "n={n} after remount");
    }
}

#[test]
fn filesystem_inside_a_partition() {
    use mdisk_ds_file::OpenMode;
    use mdisk_fs_fat::open_image_stack;

    const PART_START: usize = 2048;
    const PART_SECTORS: usize = 2001;

    let path = std::env::temp_dir().join(format!(
        "mdisk-partition-scenario-{}.img",
        std::process::id()
    ));
    let mut image = vec![0u8; (PART_START + PART_SECTORS) * 512];
    // One primary partition entry, type 0x06, plus the table signature.
    let entry_offset = 0x1BE;
    image[entry_offset + 4] = 0x06;
    image[entry_offset + 8..entry_offset + 12]
        .copy_from_slice(&(PART_START as u32).to_le_bytes());
    image[entry_offset + 12..entry_offset + 16]
        .copy_from_slice(&(PART_SECTORS as u32).to_le_bytes());
    image[510] = 0x55;
    image[511] = 0xAA;
    std::fs::write(&path, &image).unwrap();

    let mut dev = Device {
        drive: 'C',
        partition: 1,
        ..Device::default()
    };
    let (stack, _max_size) = open_image_stack(&mut dev, &path, OpenMode::ReadWrite).unwrap();
    assert_eq!(dev.tot_sectors, PART_SECTORS as u32);

    let fs = make_filesystem(
        stack,
        &mut dev,
        FsParams::default(),
        false,
        Some("PARTDISK"),
        7,
    )
    .unwrap();
    fs.flush().unwrap();
    drop(fs);

    let image = std::fs::read(&path).unwrap();
    // The boot sector landed inside the partition; the MBR is untouched.
    assert_eq!(&image[PART_START * 512 + 510..PART_START * 512 + 512], &[0x55, 0xAA]);
    assert_eq!(image[entry_offset + 4], 0x06);
    assert_eq!(&image[510..512], &[0x55, 0xAA]);

    let mut dev = Device {
        drive: 'C',
        partition: 1,
        ..Device::default()
    };
    let fs = FatFs::open(&mut dev, &path, OpenMode::ReadOnly).unwrap();
    let mut root = fs.open_root().unwrap();
    let label = root.read_entry(0).unwrap().unwrap();
    assert!(label.is_label());
    assert_eq!(&label.name, b"PARTDISK");

    drop((root, fs));
    std::fs::remove_file(path).unwrap();
}

#[test]
fn preallocation_keeps_free_space_honest() {
    let ram = RamDisk::new(1_474_560);
    let fs = format_floppy(&ram);
    let cluster_bytes = fs.fs_params().cluster_bytes() as u64;

    let before = fs.get_free_bytes().unwrap();
    fs.preallocate_clusters(11).unwrap();
    assert_eq!(fs.get_free_bytes().unwrap(), before - 11 * cluster_bytes);
    fs.release_preallocated_clusters(11);
    assert_eq!(fs.get_free_bytes().unwrap(), before);
    assert_eq!(fs.preallocated_clusters(), 0);
}

#[test]
fn two_opens_share_one_file() {
    let ram = RamDisk::new(1_474_560);
    let fs = format_floppy(&ram);

    let mut root = fs.open_root().unwrap();
    let entry = DirEntry::new(&DosName::new("SHARED", "DAT"), ATTR_ARCHIVE, 0, 0, STAMP);
    root.write_entry(0, &entry).unwrap();

    let FatNode::File(a) = fs.open_by_direntry(&root, 0).unwrap() else {
        panic!("not a file");
    };
    a.write_at(b"abcdef", 0).unwrap();
    a.flush().unwrap();
    root.flush().unwrap();

    // Second open finds the same chain and must yield the same handle
    // state, size included.
    let FatNode::File(b) = fs.open_by_direntry(&root, 0).unwrap() else {
        panic!("not a file");
    };
    assert_eq!(b.file_size(), 6);
    assert_eq!(b.first_cluster(), a.first_cluster());

    let mut buf = [0u8; 6];
    b.read_at(&mut buf, 0).unwrap();
    assert_eq!(&buf, b"abcdef");
}

#[test]
fn subdirectories_grow_and_hold_entries() {
    let ram = RamDisk::new(1_474_560);
    let fs = format_floppy(&ram);

    let mut root = fs.open_root().unwrap();
    let entry = DirEntry::new(&DosName::new("SUBDIR", ""), ATTR_DIRECTORY, 1, 0, STAMP);
    root.write_entry(0, &entry).unwrap();

    let FatNode::Dir(mut sub) = fs.open_by_direntry(&root, 0).unwrap() else {
        panic!("SUBDIR opened as a file");
    };
    let inner = DirEntry::new(&DosName::new("NOTE", "TXT"), ATTR_ARCHIVE, 0, 0, STAMP);
    sub.write_entry(2, &inner).unwrap();
    sub.flush().unwrap();

    let back = sub.read_entry(2).unwrap().unwrap();
    assert_eq!(&back.name, b"NOTE    ");
    // The fresh directory got a real cluster of its own.
    assert!(sub.first_cluster() >= 2);

    // Slots 0 and 1 of the new cluster are blank, ending iteration there
    // for readers that stop at the end marker.
    assert!(sub.read_entry(0).unwrap().unwrap().is_end());
}

#[test]
fn root_directory_is_bounded() {
    let ram = RamDisk::new(1_474_560);
    let fs = format_floppy(&ram);

    let mut root = fs.open_root().unwrap();
    // 14 sectors of 16 entries each.
    let last = 14 * 16 - 1;
    let entry = DirEntry::new(&DosName::new("LAST", ""), ATTR_ARCHIVE, 0, 0, STAMP);
    root.write_entry(last, &entry).unwrap();
    assert_eq!(root.read_entry(last).unwrap().unwrap().name[0], b'L');
    root.flush().unwrap();

    // One slot past the fixed root: the slot buffer absorbs the write, but
    // pushing it to the filesystem cannot succeed. The root cannot grow.
    let _ = root.write_entry(last + 1, &entry);
    assert!(root.flush().is_err());
}
