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

//! Files and directories as streams: a file offset is turned into an
//! absolute disk position by walking the cluster chain, allocating on
//! writes; the fixed FAT12/16 root directory maps linearly instead.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use log::error;
use mdisk_ds::{buffer::BufferedStream, force_pwrite, Stream, StreamData};
use mdisk_err::{Error, Result};
use mdisk_fs::{dirio, record::DirEntry};

use crate::{loopdetect::LoopDetector, FatFs, Fs};

/// Directory entries holding this as their start cluster mark files that
/// were created but never given a real cluster.
pub(crate) const NEW_FILE_SENTINEL: u32 = 1;

/// Where a file handle points back to.
pub(crate) enum DirRef {
    /// The root directory; it has no entry anywhere.
    Root,
    /// Opened by bare first cluster, e.g. for chain inspection.
    Detached,
    /// Slot `index` of `dir`.
    Entry {
        dir: FatDir,
        index: u32,
        rec: DirEntry,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MapKind {
    Normal,
    Root,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

pub(crate) struct FatFile {
    pub(crate) fs: Rc<RefCell<Fs>>,
    map: MapKind,

    pub(crate) file_size: u32,
    /// Bytes this file expects to need, including what is already there.
    preallocated_size: u32,
    /// Clusters reserved with the filesystem for the part of
    /// `preallocated_size` beyond `file_size`.
    preallocated_clusters: u32,

    /// First cluster of the chain; 0 while nothing is allocated.
    pub(crate) first_abs_clu: u32,
    /// Memoized chain position for sequential walks.
    prev_abs_clu: u32,
    prev_rel_clu: u32,

    detector: LoopDetector,
    pub(crate) entry: DirRef,
    /// Cursor for the non-positional read/write calls.
    where_: u32,
    /// Directory handles share one slot-granular buffer across opens.
    buffer: Option<Weak<RefCell<BufferedStream>>>,
}

impl FatFile {
    fn intern_key(&self) -> Option<u32> {
        if self.map == MapKind::Root {
            Some(0)
        } else if self.first_abs_clu >= 2 {
            Some(self.first_abs_clu)
        } else {
            None
        }
    }
}

impl Drop for FatFile {
    fn drop(&mut self) {
        if let Ok(mut fs) = self.fs.try_borrow_mut() {
            fs.release_preallocated_clusters(self.preallocated_clusters);
            if let Some(key) = self.intern_key() {
                if fs.files.get(&key).is_some_and(|w| w.upgrade().is_none()) {
                    fs.files.remove(&key);
                }
            }
        }
    }
}

/// Opens (or re-uses) the in-memory file for `first`. Two opens of the same
/// chain share one handle; the not-yet-allocated sentinel is deliberately
/// kept out of the table.
pub(crate) fn internal_open(
    fatfs: &FatFs,
    first: u32,
    size: u32,
    entry: DirRef,
    map: MapKind,
) -> Rc<RefCell<FatFile>> {
    let key = if map == MapKind::Root {
        Some(0)
    } else if first != NEW_FILE_SENTINEL && first >= 2 {
        Some(first)
    } else {
        None
    };
    if let Some(key) = key {
        let existing = fatfs.fs.borrow().files.get(&key).and_then(Weak::upgrade);
        if let Some(existing) = existing {
            return existing;
        }
    }

    let file = Rc::new(RefCell::new(FatFile {
        fs: Rc::clone(&fatfs.fs),
        map,
        file_size: size,
        preallocated_size: 0,
        preallocated_clusters: 0,
        first_abs_clu: if first == NEW_FILE_SENTINEL { 0 } else { first },
        prev_abs_clu: 0,
        prev_rel_clu: u32::MAX,
        detector: LoopDetector::new(),
        entry,
        where_: 0,
        buffer: None,
    }));
    if let Some(key) = key {
        fatfs.fs.borrow_mut().files.insert(key, Rc::downgrade(&file));
    }
    file
}

fn limit32(len: &mut u32, avail: u32) {
    if *len > avail {
        *len = avail;
    }
}

/// Linear map of the fixed FAT12/16 root directory. Cannot grow.
fn root_map(fs: &Fs, where_: u32, len: &mut u32) -> Result<Option<u64>> {
    let root_bytes = fs.params.dir_len as u32 * fs.params.sector_size as u32;
    if root_bytes < where_ {
        *len = 0;
        return Err(Error::NoSpace);
    }
    limit32(len, root_bytes - where_);
    if *len == 0 {
        return Ok(None);
    }
    Ok(Some(fs.sectors_to_bytes(fs.params.dir_start()) + where_ as u64))
}

/// Chain walk: turns `where_` into an absolute disk position and clips
/// `len` to the contiguous cluster run found there. In write mode the chain
/// grows as needed. `Ok(None)` means end of data.
fn normal_map(
    file: &mut FatFile,
    fs: &mut Fs,
    where_: u32,
    len: &mut u32,
    mode: Access,
) -> Result<Option<u64>> {
    let clus_size = fs.cluster_bytes();
    let offset = where_ % clus_size;

    if mode == Access::Read {
        limit32(len, file.file_size.saturating_sub(where_));
    }
    if *len == 0 {
        return Ok(None);
    }

    if file.first_abs_clu < 2 {
        // Nothing allocated; writes go through the first-cluster path of
        // the handle before mapping.
        *len = 0;
        return Ok(None);
    }

    let rel_clu = where_ / clus_size;
    let (mut cur_clu, mut abs_clu) = if file.prev_rel_clu != u32::MAX && rel_clu >= file.prev_rel_clu
    {
        (file.prev_rel_clu, file.prev_abs_clu)
    } else {
        (0, file.first_abs_clu)
    };

    let nr_clu = (offset + *len - 1) / clus_size;
    while cur_clu <= rel_clu + nr_clu {
        if cur_clu == rel_clu {
            // Reached the beginning of the zone; save the coordinates.
            file.prev_rel_clu = rel_clu;
            file.prev_abs_clu = abs_clu;
        }
        let mut new_clu = fs.fat_decode(abs_clu)?;
        if new_clu == 0 || new_clu == 1 {
            error!("FAT problem while decoding {abs_clu}: {new_clu:x}");
            return Err(Error::Internal("free cluster in the middle of a chain"));
        }
        if cur_clu == rel_clu + nr_clu {
            break;
        }
        if new_clu > fs.params.last_fat && mode == Access::Write {
            // At the end, and writing: extend.
            new_clu = match fs.get_next_free_cluster(abs_clu)? {
                Some(cluster) => cluster,
                None => return Err(Error::NoSpace),
            };
            fs.fat_append(abs_clu, new_clu)?;
        }
        if cur_clu < rel_clu && new_clu > fs.params.last_fat {
            *len = 0;
            return Ok(None);
        }
        if cur_clu >= rel_clu && new_clu != abs_clu + 1 {
            break;
        }
        cur_clu += 1;
        abs_clu = new_clu;
        file.detector.check(cur_clu, abs_clu)?;
    }

    let run = (1 + cur_clu - rel_clu) as u64 * clus_size as u64 - offset as u64;
    if (*len as u64) > run {
        *len = run as u32;
    }

    if fs.batch_mode && mode == Access::Write {
        let end = where_ as u64 + *len as u64;
        if end >= file.file_size as u64 {
            // Pad to the cluster boundary so the tail is never read back.
            // Widened arithmetic; files that would pad past the 32-bit
            // size domain stay unpadded.
            let padded = end.div_ceil(clus_size as u64) * clus_size as u64;
            if padded <= u32::MAX as u64 {
                *len += (padded - end) as u32;
            }
        }
    }

    if (*len as u64 + offset as u64) / clus_size as u64 + (file.prev_abs_clu - 2) as u64
        > fs.params.num_clus as u64
    {
        return Err(Error::Internal("mapped cluster outside filesystem"));
    }

    let pos = fs
        .sectors_to_bytes((file.prev_abs_clu - 2) * fs.params.cluster_size as u32 + fs.params.clus_start)
        + offset as u64;
    Ok(Some(pos))
}

/// Shared handle to an open file. Clones are the same file; the last one
/// dropped returns any unused pre-allocation.
#[derive(Clone)]
pub struct FileHandle {
    pub(crate) file: Rc<RefCell<FatFile>>,
}

impl FileHandle {
    /// Gives a brand-new file its first cluster and makes the handle
    /// findable under the new key.
    fn ensure_first_cluster(&self) -> Result<()> {
        let mut file = self.file.borrow_mut();
        if file.map == MapKind::Root || file.first_abs_clu >= 2 {
            return Ok(());
        }
        let fs_rc = Rc::clone(&file.fs);
        let mut fs = fs_rc.borrow_mut();
        let new_clu = match fs.get_next_free_cluster(1)? {
            Some(cluster) => cluster,
            None => return Err(Error::NoSpace),
        };
        file.first_abs_clu = new_clu;
        let end_fat = fs.params.end_fat;
        fs.fat_allocate(new_clu, end_fat)?;
        fs.files.insert(new_clu, Rc::downgrade(&self.file));
        Ok(())
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() || offset >= u32::MAX as u64 {
            return Ok(0);
        }
        let mut file = self.file.borrow_mut();
        let fs_rc = Rc::clone(&file.fs);
        let mut fs = fs_rc.borrow_mut();

        let where_ = offset as u32;
        let mut len = buf.len().min(u32::MAX as usize) as u32;
        let pos = match file.map {
            MapKind::Normal => normal_map(&mut file, &mut fs, where_, &mut len, Access::Read)?,
            MapKind::Root => root_map(&fs, where_, &mut len)?,
        };
        let Some(pos) = pos else { return Ok(0) };

        let got = fs.disk.pread(&mut buf[..len as usize], pos)?;
        file.where_ = where_ + got as u32;
        Ok(got)
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if offset >= u32::MAX as u64 {
            return Err(Error::NoSpace);
        }
        self.ensure_first_cluster()?;

        let mut file = self.file.borrow_mut();
        let fs_rc = Rc::clone(&file.fs);
        let mut fs = fs_rc.borrow_mut();

        let where_ = offset as u32;
        let mut len = buf.len().min((u32::MAX - where_) as usize) as u32;
        let requested = len;
        let pos = match file.map {
            MapKind::Normal => normal_map(&mut file, &mut fs, where_, &mut len, Access::Write)?,
            MapKind::Root => root_map(&fs, where_, &mut len)?,
        };
        let Some(pos) = pos else { return Ok(0) };

        let got = if len > requested {
            // Batch padding mapped more than the caller has; fill the
            // cluster tail with zeroes in one transfer.
            let mut padded = vec![0u8; len as usize];
            padded[..requested as usize].copy_from_slice(&buf[..requested as usize]);
            force_pwrite(&mut *fs.disk, &padded, pos)?
        } else if fs.batch_mode {
            force_pwrite(&mut *fs.disk, &buf[..len as usize], pos)?
        } else {
            fs.disk.pwrite(&buf[..len as usize], pos)?
        };

        let written = (got as u32).min(requested);
        file.where_ = where_ + written;
        if file.where_ > file.file_size {
            file.file_size = file.where_;
        }
        recalc_prealloc_size(&mut file, &mut fs)?;
        Ok(written as usize)
    }

    /// Sequential read at the handle's cursor.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let where_ = self.file.borrow().where_;
        self.read_at(buf, where_ as u64)
    }

    /// Sequential write at the handle's cursor.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let where_ = self.file.borrow().where_;
        self.write_at(buf, where_ as u64)
    }

    /// Announces the eventual size of this file, reserving clusters with
    /// the filesystem so free-space queries account for them.
    pub fn pre_allocate(&self, size: u32) -> Result<()> {
        let mut file = self.file.borrow_mut();
        if size > file.file_size && size > file.preallocated_size {
            file.preallocated_size = size;
            let fs_rc = Rc::clone(&file.fs);
            let mut fs = fs_rc.borrow_mut();
            recalc_prealloc_size(&mut file, &mut fs)
        } else {
            Ok(())
        }
    }

    /// Writes the directory entry back if the first cluster changed since
    /// the open (i.e. the file got its first real allocation).
    pub fn flush(&self) -> Result<()> {
        let (mut dir, index, mut rec) = {
            let file = self.file.borrow();
            match &file.entry {
                DirRef::Entry { dir, index, rec } if rec.start() != file.first_abs_clu => {
                    let mut rec = *rec;
                    rec.set_start(file.first_abs_clu);
                    (dir.clone(), *index, rec)
                }
                _ => return Ok(()),
            }
        };
        dirio::write_entry(&mut dir, index, &rec)?;
        if let DirRef::Entry { rec: stored, .. } = &mut self.file.borrow_mut().entry {
            *stored = rec;
        }
        Ok(())
    }

    pub fn file_size(&self) -> u32 {
        self.file.borrow().file_size
    }

    pub fn first_cluster(&self) -> u32 {
        self.file.borrow().first_abs_clu
    }

    pub fn stream_data(&self) -> StreamData {
        let file = self.file.borrow();
        let (date, is_dir) = match &file.entry {
            DirRef::Entry { rec, .. } => (rec.mtime_unix(), rec.is_dir()),
            DirRef::Root => (0, true),
            DirRef::Detached => (0, false),
        };
        StreamData {
            date,
            size: file.file_size as u64,
            is_dir,
            address: file.first_abs_clu,
        }
    }
}

impl Stream for FileHandle {
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        FileHandle::read_at(self, buf, offset)
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        FileHandle::write_at(self, buf, offset)
    }

    fn flush(&mut self) -> Result<()> {
        FileHandle::flush(self)
    }

    fn data(&mut self) -> Result<StreamData> {
        Ok(self.stream_data())
    }

    fn pre_allocate(&mut self, size: u64) -> Result<()> {
        FileHandle::pre_allocate(self, size.min(u32::MAX as u64) as u32)
    }
}

fn file_bytes_to_clusters(bytes: u32, clus_size: u32) -> u32 {
    bytes / clus_size + u32::from(bytes % clus_size != 0)
}

/// Re-derives how many clusters this file still needs beyond its current
/// size and moves the filesystem-wide reservation accordingly.
fn recalc_prealloc_size(file: &mut FatFile, fs: &mut Fs) -> Result<()> {
    let clus_size = fs.cluster_bytes();
    let current = file_bytes_to_clusters(file.file_size, clus_size);
    let needed = file_bytes_to_clusters(file.preallocated_size, clus_size);
    let needed_prealloc = needed.saturating_sub(current);
    if needed_prealloc > file.preallocated_clusters {
        fs.preallocate_clusters(needed_prealloc - file.preallocated_clusters)?;
    } else {
        fs.release_preallocated_clusters(file.preallocated_clusters - needed_prealloc);
    }
    file.preallocated_clusters = needed_prealloc;
    Ok(())
}

/// Shared handle to an open directory: the interned file plus the shared
/// slot buffer that batches 32-byte entry reads into sector transfers.
#[derive(Clone)]
pub struct FatDir {
    pub(crate) file: Rc<RefCell<FatFile>>,
    buffer: Rc<RefCell<BufferedStream>>,
}

/// Interposes (or re-uses) the directory buffer for this file.
pub(crate) fn bufferize(file: Rc<RefCell<FatFile>>) -> Result<FatDir> {
    let existing = file.borrow().buffer.as_ref().and_then(Weak::upgrade);
    let buffer = match existing {
        Some(buffer) => buffer,
        None => {
            let buffer = Rc::new(RefCell::new(BufferedStream::new(
                Box::new(FileHandle {
                    file: Rc::clone(&file),
                }),
                64 * 16384,
                512,
                dirio::DIR_ENTRY_SIZE,
            )?));
            file.borrow_mut().buffer = Some(Rc::downgrade(&buffer));
            buffer
        }
    };
    Ok(FatDir { file, buffer })
}

impl FatDir {
    pub fn read_entry(&mut self, index: u32) -> Result<Option<DirEntry>> {
        dirio::read_entry(self, index)
    }

    pub fn write_entry(&mut self, index: u32, entry: &DirEntry) -> Result<()> {
        dirio::write_entry(self, index, entry)
    }

    pub fn write_end_marker(&mut self, index: u32) -> Result<()> {
        dirio::write_end_marker(self, index)
    }

    /// Grows a subdirectory by one zeroed cluster at slot `index`.
    pub fn grow(&mut self, index: u32) -> Result<()> {
        let cluster_bytes = {
            let file = self.file.borrow();
            let mut fs = file.fs.borrow_mut();
            if !fs.get_free_min_clusters(1)? {
                return Err(Error::NoSpace);
            }
            fs.cluster_bytes() as usize
        };
        dirio::grow(self, index, cluster_bytes)
    }

    pub fn fatfs(&self) -> FatFs {
        FatFs {
            fs: Rc::clone(&self.file.borrow().fs),
        }
    }

    pub fn size(&self) -> u32 {
        self.file.borrow().file_size
    }

    pub fn first_cluster(&self) -> u32 {
        self.file.borrow().first_abs_clu
    }

    pub fn is_root(&self) -> bool {
        matches!(self.file.borrow().entry, DirRef::Root)
    }

    /// Renders the 8.3 name of an entry through the filesystem's codepage
    /// converter.
    pub fn format_name(&self, rec: &DirEntry) -> String {
        let converter = {
            let file = self.file.borrow();
            let fs = file.fs.borrow();
            Rc::clone(&fs.converter)
        };
        let base = converter.decode(&rec.name);
        let ext = converter.decode(&rec.ext);
        let base = base.trim_end_matches(' ');
        let ext = ext.trim_end_matches(' ');
        if ext.is_empty() {
            base.to_owned()
        } else {
            format!("{base}.{ext}")
        }
    }
}

impl Stream for FatDir {
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.buffer.borrow_mut().pread(buf, offset)
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        self.buffer.borrow_mut().pwrite(buf, offset)
    }

    fn flush(&mut self) -> Result<()> {
        self.buffer.borrow_mut().flush()
    }

    fn data(&mut self) -> Result<StreamData> {
        let file = FileHandle {
            file: Rc::clone(&self.file),
        };
        Ok(file.stream_data())
    }
}
