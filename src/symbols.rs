//! Label and constant resolution.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::assembler::AssemblyError;
use crate::ast::Span;

/// A resolved symbol: its numeric value and where it was defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub value: i64,
    pub defined_at: Span,
}

/// Name → value mapping built during pass 1 and read during pass 2.
///
/// Insertion order is preserved so listings and serialized output come out
/// the same on every run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolTable {
    entries: IndexMap<String, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `value`. Redefinition is an error; the diagnostic
    /// carries the position of the first definition.
    pub fn define(&mut self, name: &str, value: i64, span: Span) -> Result<(), AssemblyError> {
        if let Some(existing) = self.entries.get(name) {
            tracing::debug!(name, first = %existing.defined_at, "rejecting symbol redefinition");
            return Err(AssemblyError::DuplicateSymbol {
                name: name.to_owned(),
                first: existing.defined_at,
            });
        }
        tracing::trace!(name, value, line = span.line, "defined symbol");
        self.entries.insert(
            name.to_owned(),
            Symbol {
                value,
                defined_at: span,
            },
        );
        Ok(())
    }

    /// Look a symbol up by name.
    pub fn resolve(&self, name: &str) -> Result<i64, AssemblyError> {
        match self.entries.get(name) {
            Some(symbol) => Ok(symbol.value),
            None => Err(AssemblyError::UndefinedSymbol {
                name: name.to_owned(),
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Symbol)> {
        self.entries.iter().map(|(name, sym)| (name.as_str(), sym))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
