use std::ptr;

use crate::{Header, HeaderFlags, HeapObject, Object, ObjectType, Tagged, Value};

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DictEntry {
    /// guaranteed to be interned
    pub name: Value,
    pub value: Value,
}

/// Insertion-ordered attribute table.
///
/// Entry storage lives out of line so the dict object itself (and therefore
/// any pointer cell referencing it) keeps a stable address while the table
/// grows. Growth is driven by the owner, which supplies fresh storage.
#[repr(C)]
#[derive(Debug)]
pub struct Dict {
    pub header: Header,
    pub len: Tagged<usize>,
    pub capacity: Tagged<usize>,
    pub entries: *mut DictEntry,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DictSet {
    Inserted,
    Updated,
    Full,
}

impl Dict {
    /// Initialize an empty dict over the given storage
    /// # Safety
    /// `entries` must be valid for `capacity` entries (or null with capacity 0)
    pub unsafe fn init(&mut self, entries: *mut DictEntry, capacity: usize) {
        self.header =
            Header::encode_object(ObjectType::Dict, HeaderFlags::empty(), 0);
        self.len = 0usize.into();
        self.capacity = capacity.into();
        self.entries = entries;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.into()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.into()
    }

    #[inline]
    pub fn entries(&self) -> &[DictEntry] {
        let len = self.len();
        if len == 0 {
            return &[];
        }
        // SAFETY: entries storage is valid for len entries
        unsafe { std::slice::from_raw_parts(self.entries, len) }
    }

    #[inline]
    fn entries_mut(&mut self) -> &mut [DictEntry] {
        let len = self.len();
        if len == 0 {
            return &mut [];
        }
        // SAFETY: entries storage is valid for len entries
        unsafe { std::slice::from_raw_parts_mut(self.entries, len) }
    }

    /// Lookup by interned name identity.
    pub fn lookup(&self, name: Value) -> Option<Value> {
        self.entries()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value)
    }

    pub fn contains(&self, name: Value) -> bool {
        self.lookup(name).is_some()
    }

    /// Insert or update without growing. `Full` means the owner must move the
    /// table to bigger storage first.
    pub fn set(&mut self, name: Value, value: Value) -> DictSet {
        if let Some(entry) =
            self.entries_mut().iter_mut().find(|e| e.name == name)
        {
            entry.value = value;
            return DictSet::Updated;
        }
        let len = self.len();
        if len == self.capacity() {
            return DictSet::Full;
        }
        // SAFETY: len < capacity, slot is within the storage
        unsafe { self.entries.add(len).write(DictEntry { name, value }) };
        self.len = (len + 1).into();
        DictSet::Inserted
    }

    /// Remove an entry, preserving the order of the rest.
    pub fn remove(&mut self, name: Value) -> Option<Value> {
        let len = self.len();
        let index = self.entries().iter().position(|e| e.name == name)?;
        let value = self.entries()[index].value;
        // SAFETY: index < len, shifting stays within the storage
        unsafe {
            ptr::copy(
                self.entries.add(index + 1),
                self.entries.add(index),
                len - index - 1,
            );
        }
        self.len = (len - 1).into();
        Some(value)
    }

    /// Move the table to fresh storage.
    /// # Safety
    /// `entries` must be valid for `capacity >= len` entries
    pub unsafe fn grow(&mut self, entries: *mut DictEntry, capacity: usize) {
        debug_assert!(capacity >= self.len());
        let len = self.len();
        if len > 0 {
            // SAFETY: both regions valid for len entries
            unsafe { ptr::copy_nonoverlapping(self.entries, entries, len) };
        }
        self.entries = entries;
        self.capacity = capacity.into();
    }
}

impl Object for Dict {}
impl HeapObject for Dict {}
