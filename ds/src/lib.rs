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

pub mod buffer;
pub mod device;
pub mod geom;
pub mod offset;
pub mod partition;
pub mod remap;
pub mod swap;

pub use mdisk_err::{Error, Result};

use crate::device::Device;

/// Metadata of the object backing a stream chain, as reported by the
/// terminal layer (or overridden by an intermediate one).
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamData {
    /// Modification time, seconds since the Unix epoch.
    pub date: i64,
    /// Size in bytes.
    pub size: u64,
    /// Whether the object is a directory.
    pub is_dir: bool,
    /// Location of the object, when cluster-addressed (0 otherwise).
    pub address: u32,
}

/// A node in a chain of byte-addressed storage layers.
///
/// Every layer decorates the stream below it: a partition window shifts and
/// clips offsets, a buffer coalesces sector writes, a byte swapper transposes
/// 16-bit words, and so on, down to a terminal layer that owns the image file
/// or device. A method a layer does not override delegates to [`Stream::next`]
/// with identical arguments; a terminal layer (no inner stream) falls back to
/// the documented default.
///
/// `pread`/`pwrite` may transfer fewer bytes than requested. Callers that
/// need exact lengths use [`force_pread`]/[`force_pwrite`].
pub trait Stream {
    /// The decorated inner stream, if any.
    fn next(&mut self) -> Option<&mut dyn Stream> {
        None
    }

    /// Reads up to `buf.len()` bytes at the absolute byte `offset`.
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self.next() {
            Some(next) => next.pread(buf, offset),
            None => Err(Error::Unimplemented),
        }
    }

    /// Writes up to `buf.len()` bytes at the absolute byte `offset`.
    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        match self.next() {
            Some(next) => next.pwrite(buf, offset),
            None => Err(Error::Unimplemented),
        }
    }

    /// Pushes all dirty in-layer state down the chain. After a successful
    /// flush no layer holds unwritten data.
    fn flush(&mut self) -> Result<()> {
        match self.next() {
            Some(next) => next.flush(),
            None => Ok(()),
        }
    }

    /// Lets the chain fill in or verify geometry of `dev`. `orig` is the
    /// untouched descriptor the caller started from.
    fn set_geometry(&mut self, dev: &mut Device, orig: &Device) -> Result<()> {
        match self.next() {
            Some(next) => next.set_geometry(dev, orig),
            None => Ok(()),
        }
    }

    /// Metadata of the backing object.
    fn data(&mut self) -> Result<StreamData> {
        match self.next() {
            Some(next) => next.data(),
            None => Err(Error::Unimplemented),
        }
    }

    /// Announces that the stream will grow to `size` bytes, so space can be
    /// reserved ahead of the actual writes.
    fn pre_allocate(&mut self, size: u64) -> Result<()> {
        match self.next() {
            Some(next) => next.pre_allocate(size),
            None => Ok(()),
        }
    }

    /// Asks the terminal device to drop any cached pages.
    fn discard(&mut self) -> Result<()> {
        match self.next() {
            Some(next) => next.discard(),
            None => Ok(()),
        }
    }
}

/// Caps `*len` so that it does not reach past `avail` bytes.
pub fn limit_len(len: &mut usize, avail: u64) {
    if *len as u64 > avail {
        *len = avail as usize;
    }
}

/// Reads until `buf` is full, the stream reports end of data, or an error
/// occurs. An error after partial progress reports the partial count.
pub fn force_pread(stream: &mut dyn Stream, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match stream.pread(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) => {
                if done > 0 {
                    break;
                }
                return Err(e);
            }
        }
    }
    Ok(done)
}

/// Writes until `buf` is drained, the stream accepts no more data, or an
/// error occurs. An error after partial progress reports the partial count.
pub fn force_pwrite(stream: &mut dyn Stream, buf: &[u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match stream.pwrite(&buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) => {
                if done > 0 {
                    break;
                }
                return Err(e);
            }
        }
    }
    Ok(done)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Memory-backed terminal stream for layer tests. Grows on write and
    /// counts the transfers that reach it.
    pub struct MemStream {
        pub data: Vec<u8>,
        pub reads: usize,
        pub writes: usize,
    }

    impl MemStream {
        pub fn new(size: usize) -> Self {
            Self {
                data: vec![0; size],
                reads: 0,
                writes: 0,
            }
        }

        pub fn from(data: Vec<u8>) -> Self {
            Self {
                data,
                reads: 0,
                writes: 0,
            }
        }
    }

    impl Stream for MemStream {
        fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
            self.reads += 1;
            let offset = offset as usize;
            if offset >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - offset);
            buf[..n].copy_from_slice(&self.data[offset..offset + n]);
            Ok(n)
        }

        fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
            self.writes += 1;
            let offset = offset as usize;
            if offset + buf.len() > self.data.len() {
                self.data.resize(offset + buf.len(), 0);
            }
            self.data[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn data(&mut self) -> Result<StreamData> {
            Ok(StreamData {
                size: self.data.len() as u64,
                ..StreamData::default()
            })
        }
    }

    /// Clonable handle to a [`MemStream`], so tests can keep inspecting the
    /// terminal after handing it to a layer.
    #[derive(Clone)]
    pub struct SharedMem(pub std::rc::Rc<std::cell::RefCell<MemStream>>);

    impl SharedMem {
        pub fn new(size: usize) -> Self {
            Self(std::rc::Rc::new(std::cell::RefCell::new(MemStream::new(
                size,
            ))))
        }

        pub fn from(data: Vec<u8>) -> Self {
            Self(std::rc::Rc::new(std::cell::RefCell::new(MemStream::from(
                data,
            ))))
        }

        pub fn reads(&self) -> usize {
            self.0.borrow().reads
        }

        pub fn writes(&self) -> usize {
            self.0.borrow().writes
        }

        pub fn byte(&self, offset: usize) -> u8 {
            self.0.borrow().data[offset]
        }

        pub fn bytes(&self, range: std::ops::Range<usize>) -> Vec<u8> {
            self.0.borrow().data[range].to_vec()
        }
    }

    impl Stream for SharedMem {
        fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
            self.0.borrow_mut().pread(buf, offset)
        }

        fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
            self.0.borrow_mut().pwrite(buf, offset)
        }

        fn data(&mut self) -> Result<StreamData> {
            self.0.borrow_mut().data()
        }
    }

    /// Terminal stream that hands out at most `chunk` bytes per call, for
    /// exercising the force-I/O retry loop.
    pub struct ChunkedStream {
        pub inner: MemStream,
        pub chunk: usize,
    }

    impl Stream for ChunkedStream {
        fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
            let n = buf.len().min(self.chunk);
            self.inner.pread(&mut buf[..n], offset)
        }

        fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
            let n = buf.len().min(self.chunk);
            self.inner.pwrite(&buf[..n], offset)
        }
    }
}
