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

//! Remapping shim: presents a virtual byte range assembled from a sparse
//! set of ranges of the underlying stream, described by a mapping string.
//!
//! The string is a comma-separated list of `[kind]length` items, where kind
//! is `skip` (underlying bytes not exposed), `zero` (virtual bytes not
//! backed by anything), `pos` (reset the underlying position) or absent for
//! plain data. Lengths accept `s`/`K`/`M`/`G` suffixes. The tail of the
//! underlying stream is always exposed after the last item.

use mdisk_err::{Error, Result};

use crate::{device::Device, limit_len, Stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapKind {
    Data,
    Zero,
}

#[derive(Debug, Clone, Copy)]
struct MapSegment {
    orig: u64,
    remapped: u64,
    kind: MapKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Data,
    Zero,
    Skip,
    Pos,
}

fn parse_size(s: &str) -> Result<(u64, &str)> {
    let digits = s.len() - s.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    let value: u64 = if digits == 0 {
        0
    } else {
        s[..digits]
            .parse()
            .map_err(|_| Error::BadMapping(s.to_owned()))?
    };
    let rest = &s[digits..];
    let (scale, rest) = match rest.chars().next() {
        Some('s') => (512, &rest[1..]),
        Some('K') => (1024, &rest[1..]),
        Some('M') => (1024 * 1024, &rest[1..]),
        Some('G') => (1024 * 1024 * 1024, &rest[1..]),
        _ => (1, rest),
    };
    Ok((value * scale, rest))
}

fn parse_map(map: &str) -> Result<(Vec<MapSegment>, i64)> {
    let mut segments = Vec::new();
    let mut orig: u64 = 0;
    let mut remapped: u64 = 0;
    let mut rest = map;
    loop {
        let at_end = rest.is_empty();
        let token = if at_end {
            Token::Data
        } else if let Some(r) = rest.strip_prefix("skip") {
            rest = r;
            Token::Skip
        } else if let Some(r) = rest.strip_prefix("zero") {
            rest = r;
            Token::Zero
        } else if let Some(r) = rest.strip_prefix("pos") {
            rest = r;
            Token::Pos
        } else {
            Token::Data
        };

        let (len, after) = parse_size(rest)?;
        rest = match after.chars().next() {
            None => after,
            Some(',') => &after[1..],
            Some(_) => return Err(Error::BadMapping(after.to_owned())),
        };

        if token == Token::Pos {
            orig = len;
            continue;
        }
        if token != Token::Skip {
            segments.push(MapSegment {
                orig,
                remapped,
                kind: if token == Token::Zero {
                    MapKind::Zero
                } else {
                    MapKind::Data
                },
            });
            remapped += len;
        }
        if token != Token::Zero {
            orig += len;
        }
        if at_end {
            break;
        }
    }
    Ok((segments, orig as i64 - remapped as i64))
}

pub struct RemapStream {
    next: Box<dyn Stream>,
    map: Vec<MapSegment>,
}

impl RemapStream {
    /// Translates a virtual position into the underlying one, clipping the
    /// length to the end of the containing segment.
    fn locate(&self, start: &mut u64, len: &mut usize) -> MapKind {
        let mut index = self.map.len() - 1;
        for i in 0..self.map.len() - 1 {
            if *start < self.map[i + 1].remapped {
                limit_len(len, self.map[i + 1].remapped - *start);
                index = i;
                break;
            }
        }
        let segment = &self.map[index];
        *start = *start - segment.remapped + segment.orig;
        segment.kind
    }
}

impl Stream for RemapStream {
    fn next(&mut self) -> Option<&mut dyn Stream> {
        Some(&mut *self.next)
    }

    fn pread(&mut self, buf: &mut [u8], start: u64) -> Result<usize> {
        let mut start = start;
        let mut len = buf.len();
        match self.locate(&mut start, &mut len) {
            MapKind::Data => self.next.pread(&mut buf[..len], start),
            MapKind::Zero => {
                buf[..len].fill(0);
                Ok(len)
            }
        }
    }

    fn pwrite(&mut self, buf: &[u8], start: u64) -> Result<usize> {
        let mut start = start;
        let mut len = buf.len();
        match self.locate(&mut start, &mut len) {
            MapKind::Data => self.next.pwrite(&buf[..len], start),
            MapKind::Zero => {
                // Writing to an unmapped range is tolerated only for zeroes,
                // to catch filesystems formatted with parameters unsuitable
                // to the mapping.
                if buf[..len].iter().any(|&b| b != 0) {
                    return Err(Error::ProtectedWrite);
                }
                Ok(len)
            }
        }
    }
}

/// Builds the remap layer from `dev.data_map` and adjusts the descriptor's
/// total sector count by the net origin shift.
pub fn open_remap(next: Box<dyn Stream>, dev: &mut Device) -> Result<RemapStream> {
    let map = dev.data_map.clone().unwrap_or_default();
    let (segments, net_offset) = parse_map(&map)?;
    dev.adjust_tot_sectors(net_offset)?;
    Ok(RemapStream {
        next,
        map: segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SharedMem;

    fn remapped(map: &str, image: Vec<u8>) -> (RemapStream, Device) {
        let mut dev = Device {
            data_map: Some(map.to_owned()),
            ..Device::default()
        };
        let mem = SharedMem::from(image);
        let stream = open_remap(Box::new(mem), &mut dev).unwrap();
        (stream, dev)
    }

    #[test]
    fn zero_segment_reads_zeroes() {
        let (mut remap, _) = remapped("zero512,512", vec![0xFFu8; 1024]);
        let mut buf = [0xAAu8; 16];
        assert_eq!(remap.pread(&mut buf, 0).unwrap(), 16);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn zero_segment_rejects_nonzero_writes() {
        let (mut remap, _) = remapped("zero512,512", vec![0u8; 1024]);
        assert!(matches!(
            remap.pwrite(&[1u8; 8], 0),
            Err(Error::ProtectedWrite)
        ));
        assert_eq!(remap.pwrite(&[0u8; 8], 0).unwrap(), 8);
    }

    #[test]
    fn data_after_zero_translates_back_to_origin() {
        let mut image = vec![0u8; 1024];
        image[0] = 0x42;
        let (mut remap, _) = remapped("zero512,512", image);
        let mut buf = [0u8; 1];
        assert_eq!(remap.pread(&mut buf, 512).unwrap(), 1);
        assert_eq!(buf[0], 0x42);
    }

    #[test]
    fn skip_hides_underlying_bytes() {
        let mut image = vec![0u8; 2048];
        image[1024] = 0x99;
        let (mut remap, _) = remapped("skip1024", image);
        let mut buf = [0u8; 1];
        assert_eq!(remap.pread(&mut buf, 0).unwrap(), 1);
        assert_eq!(buf[0], 0x99);
    }

    #[test]
    fn pos_resets_origin() {
        let mut image = vec![0u8; 2048];
        image[512] = 0x77;
        let (mut remap, _) = remapped("pos1s", image);
        let mut buf = [0u8; 1];
        assert_eq!(remap.pread(&mut buf, 0).unwrap(), 1);
        assert_eq!(buf[0], 0x77);
    }

    #[test]
    fn reads_clip_at_segment_boundary() {
        let (mut remap, _) = remapped("zero512,512", vec![0u8; 1024]);
        let mut buf = [0xAAu8; 600];
        assert_eq!(remap.pread(&mut buf, 0).unwrap(), 512);
    }

    #[test]
    fn net_offset_adjusts_tot_sectors() {
        let mut dev = Device {
            data_map: Some("zero1s".to_owned()),
            tot_sectors: 10,
            ..Device::default()
        };
        let mem = SharedMem::new(512 * 10);
        open_remap(Box::new(mem), &mut dev).unwrap();
        // One virtual zero sector was added in front of the image.
        assert_eq!(dev.tot_sectors, 11);
    }

    #[test]
    fn bad_map_is_rejected() {
        let mut dev = Device {
            data_map: Some("zebra12".to_owned()),
            ..Device::default()
        };
        let mem = SharedMem::new(512);
        assert!(open_remap(Box::new(mem), &mut dev).is_err());
    }
}
