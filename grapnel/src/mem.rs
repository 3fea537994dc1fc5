//! Raw word-level access to descriptor memory.
//!
//! This is the leaf primitive the hooking core builds on: it addresses a
//! descriptor purely by base address and byte offset and never looks at the
//! descriptor struct itself. There is no bounds checking; correctness
//! depends entirely on the discovered layout being accurate.

use std::alloc::Layout;

use crate::{Runtime, Value};

/// A read/write view over one descriptor's memory.
#[derive(Debug, Copy, Clone)]
pub struct TypeMem {
    base: *mut u8,
}

impl TypeMem {
    /// View of a descriptor's memory; None when the value is no descriptor.
    pub fn of(rt: &Runtime, tyv: Value) -> Option<Self> {
        if !rt.is_type(tyv) {
            return None;
        }
        // SAFETY: checked; the untagged pointer is the allocation base
        let base = unsafe { tyv.as_tagged_unchecked::<u8>() }.as_ptr();
        Some(Self { base })
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.base as usize
    }

    /// # Safety
    /// `offset` must lie within the descriptor allocation
    #[inline]
    pub unsafe fn read_word(&self, offset: usize) -> u64 {
        // SAFETY: forwarded contract
        unsafe { self.base.add(offset).cast::<u64>().read() }
    }

    /// # Safety
    /// `offset` must lie within the descriptor allocation
    #[inline]
    pub unsafe fn write_word(&self, offset: usize, value: u64) {
        // SAFETY: forwarded contract
        unsafe { self.base.add(offset).cast::<u64>().write(value) }
    }

    /// Byte-for-byte snapshot of the first `words` words.
    /// # Safety
    /// the allocation must span at least `words` words
    pub unsafe fn snapshot(&self, words: usize) -> Vec<u64> {
        (0..words)
            // SAFETY: forwarded contract
            .map(|i| unsafe { self.read_word(i * 8) })
            .collect()
    }
}

/// Read the sub-table pointer stored at `cell_offset`; when the cell is
/// null, allocate zero-initialized backing storage of `size_words` words,
/// write its address into the cell, and return it.
pub fn ensure_table(
    rt: &mut Runtime,
    mem: &TypeMem,
    cell_offset: usize,
    size_words: usize,
) -> *mut u64 {
    // SAFETY: the cell offset comes from the discovered layout
    let existing = unsafe { mem.read_word(cell_offset) };
    if existing != 0 {
        return existing as *mut u64;
    }
    let layout = Layout::array::<u64>(size_words).expect("create valid layout");
    let table = rt.alloc_raw(layout).cast::<u64>().as_ptr();
    // SAFETY: as above
    unsafe { mem.write_word(cell_offset, table as u64) };
    table
}

/// # Safety
/// `table` must point at a table of more than `index` cells
#[inline]
pub unsafe fn write_slot(table: *mut u64, index: usize, bits: u64) {
    // SAFETY: forwarded contract
    unsafe { table.add(index).write(bits) }
}

/// # Safety
/// `table` must point at a table of more than `index` cells
#[inline]
pub unsafe fn read_slot(table: *mut u64, index: usize) -> u64 {
    // SAFETY: forwarded contract
    unsafe { table.add(index).read() }
}
