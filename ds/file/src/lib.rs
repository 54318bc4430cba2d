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

//! Terminal stream layer over a plain image file or block device.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
    time::UNIX_EPOCH,
};

use mdisk_ds::{device::Device, Stream, StreamData};
use mdisk_err::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

pub struct FileStream {
    file: File,
}

impl FileStream {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl Stream for FileStream {
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        Ok(self.file.write_at(buf, offset)?)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_geometry(&mut self, dev: &mut Device, _orig: &Device) -> Result<()> {
        let metadata = self.file.metadata()?;
        if metadata.is_file() {
            if metadata.len() == 0 {
                // Zero-sized image, i.e. newly created. Size not actually
                // known yet.
                return Ok(());
            }
            let sectors = metadata.len() / dev.sector_size_or_default() as u64;
            dev.tot_sectors = sectors.min(u32::MAX as u64) as u32;
            Ok(())
        } else {
            // Host geometry probing for devices is an external concern; the
            // descriptor has to bring its own numbers.
            if dev.tot_sectors == 0 && dev.tracks == 0 {
                return Err(Error::GeometryFailed);
            }
            Ok(())
        }
    }

    fn data(&mut self) -> Result<StreamData> {
        let metadata = self.file.metadata()?;
        let date = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(StreamData {
            date,
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            address: 0,
        })
    }

    fn discard(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens an image file or device and fills in stat-derived geometry.
///
/// Returns the terminal stream and the maximal byte size the medium can be
/// addressed with. A geometry failure on a read-only open surfaces as
/// [`Error::GeometryFailed`] so the caller can retry the open read-write.
pub fn open_image(
    dev: &mut Device,
    orig: &Device,
    path: &Path,
    mode: OpenMode,
) -> Result<(FileStream, u64)> {
    let file = OpenOptions::new()
        .read(true)
        .write(mode == OpenMode::ReadWrite)
        .open(path)
        .map_err(Error::OpenFailed)?;
    file.metadata().map_err(Error::OpenFailed)?;

    let mut stream = FileStream::new(file);
    if dev.tracks != 0 && !dev.misc_flags.is_mformat_only() || dev.tot_sectors == 0 {
        stream.set_geometry(dev, orig)?;
    }

    Ok((stream, i64::MAX as u64))
}
