// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Map program counter values onto named boot stages.
// Author: Lukas Bower

//! Boot-stage classification by program-counter range.
//!
//! The table is ordered and ranges may overlap; the first range containing
//! the program counter wins. Reordering the table changes classification.

use serde::{Deserialize, Serialize};

/// Stage name reported when no range matches.
pub const UNKNOWN_STAGE: &str = "unknown";

/// One named half-open address range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageRange {
    /// Stage name recorded in snapshots and traces.
    pub name: String,
    /// First address of the stage.
    pub start: u32,
    /// First address past the stage.
    pub end: u32,
}

impl StageRange {
    /// Construct a range.
    pub fn new(name: impl Into<String>, start: u32, end: u32) -> Self {
        Self {
            name: name.into(),
            start,
            end,
        }
    }

    /// True when `pc` falls inside `[start, end)`.
    #[must_use]
    pub fn contains(&self, pc: u32) -> bool {
        self.start <= pc && pc < self.end
    }
}

/// Ordered boot-stage table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageTable {
    stages: Vec<StageRange>,
}

impl StageTable {
    /// Build a table from ranges in priority order.
    pub fn new(stages: impl IntoIterator<Item = StageRange>) -> Self {
        Self {
            stages: stages.into_iter().collect(),
        }
    }

    /// Classify `pc`, returning [`UNKNOWN_STAGE`] when nothing matches.
    #[must_use]
    pub fn classify(&self, pc: u32) -> &str {
        self.stages
            .iter()
            .find(|stage| stage.contains(pc))
            .map_or(UNKNOWN_STAGE, |stage| stage.name.as_str())
    }

    /// Ranges in priority order.
    #[must_use]
    pub fn stages(&self) -> &[StageRange] {
        &self.stages
    }

    /// True when the table has no ranges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for StageTable {
    /// Boot sequence of the FreeRTOS guest under the seL4 CAmkES VMM.
    fn default() -> Self {
        Self::new([
            StageRange::new("elfloader", 0x6000_0000, 0x6100_0000),
            StageRange::new("seL4_boot", 0xe000_0000, 0xe100_0000),
            StageRange::new("rootserver_start", 0x0001_0000, 0x0002_0000),
            StageRange::new("camkes_init", 0x4000_0000, 0x4000_1000),
            StageRange::new("freertos_main", 0x4000_0e70, 0x4000_1000),
            StageRange::new("pattern_painting", 0x4000_08e8, 0x4000_1000),
            StageRange::new("scheduler_start", 0x4000_3000, 0x4000_4000),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_half_open() {
        let table = StageTable::new([StageRange::new("boot", 0x100, 0x200)]);
        assert_eq!(table.classify(0x100), "boot");
        assert_eq!(table.classify(0x1ff), "boot");
        assert_eq!(table.classify(0x200), UNKNOWN_STAGE);
        assert_eq!(table.classify(0xff), UNKNOWN_STAGE);
    }

    #[test]
    fn first_match_wins_on_overlap() {
        let table = StageTable::new([
            StageRange::new("outer", 0x1000, 0x2000),
            StageRange::new("inner", 0x1800, 0x1900),
        ]);
        assert_eq!(table.classify(0x1850), "outer");

        let reversed = StageTable::new([
            StageRange::new("inner", 0x1800, 0x1900),
            StageRange::new("outer", 0x1000, 0x2000),
        ]);
        assert_eq!(reversed.classify(0x1850), "inner");
    }

    #[test]
    fn default_table_shadows_later_guest_stages() {
        let table = StageTable::default();
        assert_eq!(table.classify(0x6000_0000), "elfloader");
        assert_eq!(table.classify(0xe000_1234), "seL4_boot");
        assert_eq!(table.classify(0x4000_0e70), "camkes_init");
        assert_eq!(table.classify(0x4000_3000), "scheduler_start");
        assert_eq!(table.classify(0xffff_fffc), UNKNOWN_STAGE);
    }

    #[test]
    fn classification_is_repeatable() {
        let table = StageTable::default();
        for pc in [0u32, 0x1_0000, 0x4000_08e8, 0x6080_0000, u32::MAX] {
            assert_eq!(table.classify(pc), table.classify(pc));
        }
    }

    #[test]
    fn empty_table_is_always_unknown() {
        let table = StageTable::new([]);
        assert!(table.is_empty());
        assert_eq!(table.classify(0x4000_0000), UNKNOWN_STAGE);
    }
}
