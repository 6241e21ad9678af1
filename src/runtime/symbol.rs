use std::collections::HashMap;

use crate::{gc::mark::Marker, runtime::value::Value};

/// Interned symbols by name. Every entry is a root.
#[derive(Default)]
pub struct SymbolTable {
    symbols: HashMap<String, Value>,
}

impl SymbolTable {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.symbols.get(name).copied()
    }

    pub fn insert(&mut self, name: &str, symbol: Value) {
        self.symbols.insert(name.to_owned(), symbol);
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub(crate) fn trace(&self, marker: &mut Marker) {
        for symbol in self.symbols.values() {
            marker.mark_value(*symbol);
        }
    }
}
