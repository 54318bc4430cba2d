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

use std::fmt;

/// A short 8.3 name in its on-disk shape: space-padded base and extension,
/// upper case. Codepage concerns stay outside; this type only shuffles
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosName {
    pub base: [u8; 8],
    pub ext: [u8; 3],
}

fn pad(field: &mut [u8], text: &str) {
    for (slot, b) in field.iter_mut().zip(
        text.bytes()
            .map(|b| b.to_ascii_uppercase())
            .chain(std::iter::repeat(b' ')),
    ) {
        *slot = b;
    }
}

impl DosName {
    pub fn new(base: &str, ext: &str) -> Self {
        let mut name = Self {
            base: [b' '; 8],
            ext: [b' '; 3],
        };
        pad(&mut name.base, base);
        pad(&mut name.ext, ext);
        name
    }

    /// Splits `"NAME.EXT"` on the last dot. Overlong parts are truncated,
    /// the way DOS itself did.
    pub fn from_path_component(component: &str) -> Self {
        match component.rsplit_once('.') {
            Some((base, ext)) => Self::new(base, ext),
            None => Self::new(component, ""),
        }
    }

    /// The 11 name bytes as they appear at the front of a directory entry.
    pub fn to_bytes(self) -> [u8; 11] {
        let mut bytes = [0u8; 11];
        bytes[..8].copy_from_slice(&self.base);
        bytes[8..].copy_from_slice(&self.ext);
        bytes
    }
}

impl fmt::Display for DosName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = std::str::from_utf8(&self.base).unwrap_or("????????");
        let ext = std::str::from_utf8(&self.ext).unwrap_or("???");
        let base = base.trim_end_matches(' ');
        let ext = ext.trim_end_matches(' ');
        if ext.is_empty() {
            write!(f, "{base}")
        } else {
            write!(f, "{base}.{ext}")
        }
    }
}
