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

//! Shim for byte-swapped filesystems: transposes every 16-bit word on both
//! read and write. Lengths are expected to be even; a trailing odd byte
//! passes through unswapped.

use mdisk_err::Result;

use crate::Stream;

fn swap_buffer(buf: &mut [u8]) {
    for pair in buf.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

pub struct SwapStream {
    next: Box<dyn Stream>,
}

impl SwapStream {
    pub fn new(next: Box<dyn Stream>) -> Self {
        Self { next }
    }
}

impl Stream for SwapStream {
    fn next(&mut self) -> Option<&mut dyn Stream> {
        Some(&mut *self.next)
    }

    fn pread(&mut self, buf: &mut [u8], start: u64) -> Result<usize> {
        let got = self.next.pread(buf, start)?;
        swap_buffer(&mut buf[..got]);
        Ok(got)
    }

    fn pwrite(&mut self, buf: &[u8], start: u64) -> Result<usize> {
        let mut swapped = buf.to_vec();
        swap_buffer(&mut swapped);
        self.next.pwrite(&swapped, start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SharedMem;

    #[test]
    fn swaps_word_bytes_on_read() {
        let mem = SharedMem::from(vec![0x12, 0x34, 0x56, 0x78]);
        let mut swap = SwapStream::new(Box::new(mem));
        let mut buf = [0u8; 4];
        assert_eq!(swap.pread(&mut buf, 0).unwrap(), 4);
        assert_eq!(buf, [0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn write_keeps_caller_buffer_intact() {
        let mem = SharedMem::new(4);
        let mut swap = SwapStream::new(Box::new(mem.clone()));
        let buf = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(swap.pwrite(&buf, 0).unwrap(), 4);
        assert_eq!(buf, [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(mem.bytes(0..4), vec![0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn double_swap_is_identity() {
        let payload: Vec<u8> = (0..64).collect();
        let mem = SharedMem::new(64);
        let inner = SwapStream::new(Box::new(mem));
        let mut outer = SwapStream::new(Box::new(inner));
        outer.pwrite(&payload, 0).unwrap();

        let mut buf = vec![0u8; 64];
        assert_eq!(outer.pread(&mut buf, 0).unwrap(), 64);
        assert_eq!(buf, payload);
    }
}
