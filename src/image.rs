//! The linked output of assembly: an address-indexed map of words plus the
//! entry address, ready to be loaded into a machine.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::codec::decode;
use crate::word::Word;

/// The memory image a successful assembly run produces.
///
/// Cells are kept ordered by address, so iteration and the serialized form
/// are deterministic. The label map is carried along for annotated
/// disassembly; execution never consults it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryImage {
    cells: BTreeMap<u32, Word>,
    /// Address of the first instruction to execute.
    pub entry: u32,
    /// Label → address, in definition order.
    pub labels: IndexMap<String, u32>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a word, returning the previous occupant if the address was
    /// already populated. The assembler treats that as an overlap error.
    pub fn set(&mut self, address: u32, word: Word) -> Option<Word> {
        self.cells.insert(address, word)
    }

    pub fn get(&self, address: u32) -> Option<Word> {
        self.cells.get(&address).copied()
    }

    /// Cells in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, Word)> + '_ {
        self.cells.iter().map(|(&addr, &word)| (addr, word))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Lowest populated address, if any.
    pub fn first_address(&self) -> Option<u32> {
        self.cells.keys().next().copied()
    }

    /// Annotated disassembly of every populated cell, in address order.
    /// Addresses that carry a label are prefixed with it.
    pub fn disassemble(&self) -> Vec<(u32, String)> {
        let addr_to_label: BTreeMap<u32, &str> = self
            .labels
            .iter()
            .map(|(name, &addr)| (addr, name.as_str()))
            .collect();
        self.iter()
            .map(|(addr, word)| {
                let text = match addr_to_label.get(&addr) {
                    Some(label) => format!("{label}: {}", decode(word)),
                    None => decode(word).to_string(),
                };
                (addr, text)
            })
            .collect()
    }

    /// Serialize to RON. The layout is the ordered (address, word) map, the
    /// entry address and the label map; it round-trips losslessly.
    pub fn to_ron(&self) -> Result<String, ron::Error> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
    }

    /// Parse an image previously produced by [`MemoryImage::to_ron`].
    pub fn from_ron(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::de::from_str(text)
    }
}
