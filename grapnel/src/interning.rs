use std::collections::HashMap;

use crate::Value;

/// Name interning table: one `ByteArray` per distinct string, so names
/// compare by word identity everywhere (dict entries, hook markers, cache
/// keys). Owned by the runtime; allocation of the backing bytearrays happens
/// in the runtime's arena.
#[derive(Debug, Default)]
pub struct Names {
    table: HashMap<String, Value>,
}

impl Names {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.table.get(name).copied()
    }

    pub fn insert(&mut self, name: String, value: Value) {
        self.table.insert(name, value);
    }
}
