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

use log::error;
use mdisk_err::{Error, Result};

/// Cycle detection for cluster chain walks in constant memory.
///
/// A marker `(old_rel, old_abs)` trails the walk; seeing the marker's
/// absolute cluster again at a later relative position means the chain
/// bites its own tail. The marker is moved forward whenever the walk gets
/// twice as far as where the marker was taken, so any cycle is caught
/// within a bounded number of extra steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopDetector {
    old_rel: u32,
    old_abs: u32,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the walk position: `rel` steps from the chain head, currently
    /// at absolute cluster `abs`.
    pub fn check(&mut self, rel: u32, abs: u32) -> Result<()> {
        if self.old_rel != 0 && rel > self.old_rel && abs == self.old_abs {
            error!("loop detected! oldrel={} newrel={rel} abs={abs}", self.old_rel);
            return Err(Error::LoopDetected { cluster: abs });
        }
        if rel >= 2 * self.old_rel + 1 {
            self.old_rel = rel;
            self.old_abs = abs;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_chain_passes() {
        let mut detector = LoopDetector::new();
        for rel in 1..10_000u32 {
            detector.check(rel, rel + 1).unwrap();
        }
    }

    #[test]
    fn three_cluster_ring_is_caught_quickly() {
        // 5 -> 6 -> 7 -> 5 -> ...
        let ring = [5u32, 6, 7];
        let mut detector = LoopDetector::new();
        let mut steps = 0;
        let caught = (1..).find(|&rel| {
            steps = rel;
            detector.check(rel, ring[rel as usize % 3]).is_err()
        });
        assert!(caught.is_some());
        assert!(steps <= 20, "took {steps} steps");
    }

    #[test]
    fn self_pointing_cluster_is_caught() {
        let mut detector = LoopDetector::new();
        let mut caught = false;
        for rel in 1..32 {
            if detector.check(rel, 5).is_err() {
                caught = true;
                break;
            }
        }
        assert!(caught);
    }
}
