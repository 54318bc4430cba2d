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

pub mod dirio;
pub mod name;
pub mod record;

pub use mdisk_err::{Error, Result};

pub use crate::{name::DosName, record::DirEntry};

/// Converter between the DOS codepage used for short names on disk and
/// Unicode. Actual codepage tables live outside the core; the engine only
/// passes the converter through to whoever renders names.
pub trait DosConverter {
    /// Decodes codepage bytes into text.
    fn decode(&self, dos: &[u8]) -> String;

    /// Encodes text into codepage bytes, filling `out` completely.
    /// Characters without a representation become `'_'`.
    fn encode(&self, text: &str, out: &mut [u8]);
}

/// Plain 7-bit converter, good for the names the engine itself creates.
pub struct AsciiConverter;

impl DosConverter for AsciiConverter {
    fn decode(&self, dos: &[u8]) -> String {
        dos.iter()
            .map(|&b| if b.is_ascii() && b >= 0x20 { b as char } else { '_' })
            .collect()
    }

    fn encode(&self, text: &str, out: &mut [u8]) {
        let mut chars = text.chars();
        for slot in out.iter_mut() {
            *slot = match chars.next() {
                Some(c) if c.is_ascii() => c as u8,
                Some(_) => b'_',
                None => b' ',
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_converter_pads_and_replaces() {
        let mut out = [0u8; 8];
        AsciiConverter.encode("ab\u{e9}", &mut out);
        assert_eq!(&out, b"ab_     ");
        assert_eq!(AsciiConverter.decode(b"AB CD"), "AB CD");
    }
}
