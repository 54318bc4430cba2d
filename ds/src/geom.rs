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

//! "LBA assist" geometry: derive a plausible heads/sectors/tracks triple
//! from a bare total sector count.

use crate::device::Device;

/// Fills in any of heads/sectors/tracks that are still zero, from
/// `tot_sectors`. Small counts that look like floppies get the classic
/// floppy geometries; everything else gets 63 sectors per track and a head
/// count chosen to keep the cylinder count at or below 1024.
pub fn compute_lba_geom_from_tot_sectors(dev: &mut Device) {
    if dev.heads != 0 && dev.sectors != 0 && dev.tracks != 0 {
        return;
    }
    // tot_sectors may still arrive later, e.g. from a format command line.
    if dev.tot_sectors == 0 {
        return;
    }

    // Floppy sizes, allowing for non-standard formats with slightly more
    // sectors per track than the default.
    if dev.tot_sectors <= 8640 && dev.tot_sectors % 40 == 0 {
        if dev.tot_sectors <= 540 {
            // double density 48tpi single sided
            dev.tracks = 40;
            dev.heads = 1;
        } else if dev.tot_sectors <= 1080 {
            // double density 48tpi double sided or 96tpi single sided
            if dev.heads == 1 {
                dev.tracks = 80;
            } else {
                dev.tracks = 40;
                dev.heads = 2;
            }
        } else {
            // double density 96tpi double sided, high density, extra density
            dev.tracks = 80;
            dev.heads = 2;
        }
        dev.sectors = (dev.tot_sectors / dev.heads as u32 / dev.tracks) as u16;
    }

    if dev.sectors == 0 || dev.heads == 0 {
        dev.sectors = 63;

        dev.heads = if dev.tot_sectors < 16 * 63 * 1024 {
            16
        } else if dev.tot_sectors < 32 * 63 * 1024 {
            32
        } else if dev.tot_sectors < 64 * 63 * 1024 {
            64
        } else if dev.tot_sectors < 128 * 63 * 1024 {
            128
        } else {
            255
        };
    }

    if dev.tracks == 0 {
        let sect_per_track = dev.heads as u32 * dev.sectors as u32;
        dev.tracks = (dev.tot_sectors + sect_per_track - 1) / sect_per_track;
    }
}
