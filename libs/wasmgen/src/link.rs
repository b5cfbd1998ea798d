// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Code layout metadata and the relocations needed to make generated code runnable.

use serde::{Deserialize, Serialize};

use crate::codegen::isa::write_u32;
use crate::indices::{ExportIndex, FuncIndex, ImportIndex, TableIndex};
use crate::utils::byte_enum;
use crate::Result;

/// A contiguous span of emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRange {
    pub kind: CodeRangeKind,
    pub begin: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeRangeKind {
    /// The body of a function defined in the module.
    ///
    /// The range begins with the profiling entry, calls normally enter at `entry`.
    Function {
        func_index: FuncIndex,
        /// Offset of the function body in the module bytecode.
        bytecode_offset: u32,
        /// Code offset of the regular entry.
        entry: u32,
    },
    /// Trampoline used by the embedder to call an export.
    Entry { export: ExportIndex },
    /// Exit to an import through the generic invoke path.
    ImportInterpExit { import: ImportIndex },
    /// Exit to an import's optimized entry point.
    ImportJitExit { import: ImportIndex },
    /// Returns a pending host error to the embedder.
    ErrorExit,
    /// A shared trap target.
    Inline,
    /// Far jump to a call target out of direct branch range.
    CallThunk { target: FuncIndex },
}

/// Marks a trapping instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrapSite {
    pub code_offset: u32,
    pub bytecode_offset: u32,
}

/// Describes a direct call for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSiteDesc {
    pub return_offset: u32,
    pub bytecode_offset: u32,
}

byte_enum! {
    /// Well-known runtime entry points referenced from generated code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum SymbolicAddress {
        CallImportVoid,
        CallImportI32,
        CallImportI64,
        CallImportF32,
        CallImportF64,
        CallImportV128,
        CallImportJit,
        GrowMemory,
        CurrentMemory,
        HandleInterrupt,
    }
}

impl SymbolicAddress {
    pub const COUNT: usize = Self::ALL.len();
}

/// An absolute code offset to write at `patch_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalLink {
    pub patch_at: u32,
    pub target: u32,
}

/// Code offsets of the functions an element segment places into a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncPtrTable {
    pub table: TableIndex,
    /// Global data offset of the table handle.
    pub global_data_offset: u32,
    /// One entry per segment element, `None` for null elements.
    pub elems: Vec<Option<u32>>,
}

/// The relocations of a module's code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkData {
    pub internal_links: Vec<InternalLink>,
    /// Patch sites for each [`SymbolicAddress`], indexed by its byte value.
    pub symbolic_links: Vec<Vec<u32>>,
    /// One entry per element segment.
    pub func_ptr_tables: Vec<FuncPtrTable>,
}

// ===== impl CodeRange =====

impl CodeRange {
    pub fn contains(&self, pc: u32) -> bool {
        self.begin <= pc && pc < self.end
    }

    /// The profiling and regular entries of a function range.
    pub fn func_entries(&self) -> Option<(u32, u32)> {
        match self.kind {
            CodeRangeKind::Function { entry, .. } => Some((self.begin, entry)),
            _ => None,
        }
    }

    pub fn func_index(&self) -> Option<FuncIndex> {
        match self.kind {
            CodeRangeKind::Function { func_index, .. } => Some(func_index),
            _ => None,
        }
    }
}

/// Finds the range containing `pc`. `ranges` must be sorted and non-overlapping.
pub fn lookup_code_range(ranges: &[CodeRange], pc: u32) -> Option<&CodeRange> {
    let index = ranges.partition_point(|range| range.end <= pc);
    ranges.get(index).filter(|range| range.contains(pc))
}

/// Finds the bytecode offset of the trapping instruction starting at `pc`.
pub fn lookup_trap_site(sites: &[TrapSite], pc: u32) -> Option<u32> {
    let index = sites.binary_search_by_key(&pc, |site| site.code_offset).ok()?;
    Some(sites[index].bytecode_offset)
}

// ===== impl LinkData =====

impl LinkData {
    pub fn new() -> Self {
        Self {
            internal_links: Vec::new(),
            symbolic_links: vec![Vec::new(); SymbolicAddress::COUNT],
            func_ptr_tables: Vec::new(),
        }
    }

    pub fn add_symbolic_link(&mut self, symbol: SymbolicAddress, patch_at: u32) {
        self.symbolic_links[usize::from(symbol.to_u8())].push(patch_at);
    }

    /// Applies all relocations to a copy of `code`.
    pub fn link(&self, code: &[u8]) -> Result<Box<[u8]>> {
        let mut linked = code.to_vec();

        for link in &self.internal_links {
            write_u32(&mut linked, link.patch_at, link.target)?;
        }

        for (symbol, sites) in SymbolicAddress::ALL.iter().zip(&self.symbolic_links) {
            for &patch_at in sites {
                write_u32(&mut linked, patch_at, u32::from(symbol.to_u8()))?;
            }
        }

        tracing::debug!(
            internal = self.internal_links.len(),
            symbolic = self.symbolic_links.iter().map(Vec::len).sum::<usize>(),
            "statically linked {} bytes of code",
            linked.len()
        );

        Ok(linked.into_boxed_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(begin: u32, end: u32) -> CodeRange {
        CodeRange {
            kind: CodeRangeKind::Inline,
            begin,
            end,
        }
    }

    #[test]
    fn code_range_lookup() {
        let ranges = [range(0, 10), range(10, 12), range(20, 30)];
        assert_eq!(lookup_code_range(&ranges, 0).unwrap().begin, 0);
        assert_eq!(lookup_code_range(&ranges, 11).unwrap().begin, 10);
        assert!(lookup_code_range(&ranges, 15).is_none());
        assert_eq!(lookup_code_range(&ranges, 29).unwrap().begin, 20);
        assert!(lookup_code_range(&ranges, 30).is_none());
    }

    #[test]
    fn trap_site_lookup_is_exact() {
        let sites = [
            TrapSite {
                code_offset: 4,
                bytecode_offset: 100,
            },
            TrapSite {
                code_offset: 9,
                bytecode_offset: 104,
            },
        ];
        assert_eq!(lookup_trap_site(&sites, 9), Some(104));
        assert_eq!(lookup_trap_site(&sites, 5), None);
    }

    #[test]
    fn linking_writes_targets_and_symbols() {
        let mut link = LinkData::new();
        link.internal_links.push(InternalLink {
            patch_at: 0,
            target: 0x1234,
        });
        link.add_symbolic_link(SymbolicAddress::GrowMemory, 4);

        let code = [0xff; 8];
        let linked = link.link(&code).unwrap();
        assert_eq!(&linked[0..4], &0x1234u32.to_le_bytes());
        assert_eq!(
            &linked[4..8],
            &u32::from(SymbolicAddress::GrowMemory.to_u8()).to_le_bytes()
        );
        // the unlinked input is untouched
        assert_eq!(code, [0xff; 8]);
    }
}
