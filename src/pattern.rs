// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Painted-pattern detection and content checksums for memory regions.
// Author: Lukas Bower

//! Painted-pattern detection and content checksums for captured regions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maps a region-label keyword to the 32-bit word painted into that region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternRule {
    /// Case-insensitive substring looked up in the region label.
    pub keyword: String,
    /// Expected repeating word, stored little-endian in target memory.
    pub pattern: u32,
}

impl PatternRule {
    /// Construct a rule.
    pub fn new(keyword: impl Into<String>, pattern: u32) -> Self {
        Self {
            keyword: keyword.into(),
            pattern,
        }
    }
}

/// Ordered keyword table; the first rule whose keyword occurs in a label wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternTable {
    rules: Vec<PatternRule>,
}

impl PatternTable {
    /// Build a table from rules in priority order.
    pub fn new(rules: impl IntoIterator<Item = PatternRule>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
        }
    }

    /// Expected pattern for `label`, if any keyword matches.
    #[must_use]
    pub fn expected_for(&self, label: &str) -> Option<u32> {
        let label = label.to_lowercase();
        self.rules
            .iter()
            .find(|rule| label.contains(&rule.keyword.to_lowercase()))
            .map(|rule| rule.pattern)
    }

    /// Rules in priority order.
    #[must_use]
    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }
}

impl Default for PatternTable {
    fn default() -> Self {
        Self::new([
            PatternRule::new("stack", 0xDEAD_BEEF),
            PatternRule::new("data", 0x1234_5678),
            PatternRule::new("heap", 0xCAFE_BABE),
            PatternRule::new("pattern", 0x55AA_55AA),
        ])
    }
}

/// Count 4-byte aligned occurrences of `pattern` (little-endian) in `data`.
///
/// Trailing bytes that do not fill a whole word are ignored, so the result
/// never exceeds `data.len() / 4`.
#[must_use]
pub fn count_pattern_matches(data: &[u8], pattern: u32) -> u64 {
    let needle = pattern.to_le_bytes();
    data.chunks_exact(4).filter(|word| *word == needle).count() as u64
}

/// Percentage of words in a region of `size` bytes that hold the pattern.
#[must_use]
pub fn match_percentage(matches: u64, size: u64) -> f64 {
    let words = size / 4;
    if words == 0 {
        return 0.0;
    }
    matches as f64 / words as f64 * 100.0
}

/// Fixed-length hex digest of region content, used for identity comparison.
#[must_use]
pub fn region_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Pattern statistics computed for one captured region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternAnalysis {
    /// Expected word, when the label matched a rule.
    pub expected: Option<u32>,
    /// Number of aligned matches; zero without an expected word.
    pub matches: u64,
    /// Content digest.
    pub checksum: String,
}

impl PatternTable {
    /// Analyse region bytes captured under `label`.
    #[must_use]
    pub fn analyse(&self, label: &str, data: &[u8]) -> PatternAnalysis {
        let expected = self.expected_for(label);
        let matches = expected.map_or(0, |pattern| count_pattern_matches(data, pattern));
        PatternAnalysis {
            expected,
            matches,
            checksum: region_checksum(data),
        }
    }
}
