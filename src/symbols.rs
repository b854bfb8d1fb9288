// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Resolve program counters to known guest function names.
// Author: Lukas Bower

use serde::{Deserialize, Serialize};

/// Assumed upper bound on a function body when only its start is known.
pub const DEFAULT_FUNCTION_SPAN: u32 = 0x1000;

/// A known function entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionSymbol {
    /// Symbol name.
    pub name: String,
    /// Entry address.
    pub address: u32,
}

impl FunctionSymbol {
    /// Construct a symbol.
    pub fn new(name: impl Into<String>, address: u32) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

/// Ordered symbol table; the first symbol whose span covers the pc wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FunctionTable {
    /// Bytes attributed to each symbol from its entry point.
    pub span: u32,
    /// Symbols in lookup order.
    pub symbols: Vec<FunctionSymbol>,
}

impl FunctionTable {
    /// Build a table with the default span.
    pub fn new(symbols: impl IntoIterator<Item = FunctionSymbol>) -> Self {
        Self {
            span: DEFAULT_FUNCTION_SPAN,
            symbols: symbols.into_iter().collect(),
        }
    }

    /// Name of the function containing `pc`, or `unknown_0x<pc>`.
    #[must_use]
    pub fn resolve(&self, pc: u32) -> String {
        self.symbols
            .iter()
            .find(|sym| {
                pc >= sym.address && u64::from(pc) < u64::from(sym.address) + u64::from(self.span)
            })
            .map_or_else(|| format!("unknown_0x{pc:08x}"), |sym| sym.name.clone())
    }
}

impl Default for FunctionTable {
    fn default() -> Self {
        Self::new([
            FunctionSymbol::new("_start", 0x4000_0000),
            FunctionSymbol::new("main", 0x4000_0e70),
            FunctionSymbol::new("vMemoryPatternDebugTask", 0x4000_08e8),
            FunctionSymbol::new("vMonitorTask", 0x4000_1014),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_in_table_order() {
        let table = FunctionTable::default();
        assert_eq!(table.resolve(0x4000_0000), "_start");
        // _start's span covers main's entry point.
        assert_eq!(table.resolve(0x4000_0e70), "_start");
        assert_eq!(table.resolve(0x4000_1014), "main");
        assert_eq!(table.resolve(0x4000_1e80), "vMonitorTask");
    }

    #[test]
    fn unknown_label_is_zero_padded() {
        let table = FunctionTable::default();
        assert_eq!(table.resolve(0x10), "unknown_0x00000010");
    }

    #[test]
    fn span_does_not_overflow_at_top_of_memory() {
        let table = FunctionTable::new([FunctionSymbol::new("vectors", 0xffff_f000)]);
        assert_eq!(table.resolve(0xffff_ffff), "vectors");
    }
}
