use std::mem;

use crate::{Header, HeaderFlags, HeapObject, Object, ObjectType, Value};

bitflags::bitflags! {
    /// Descriptor flag word. Which bit protects against mutation depends on
    /// the layout revision: RevA guards through HEAP (only heap-backed types
    /// are writable), RevB through a dedicated IMMUTABLE bit.
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct TypeFlags: u64 {
        const READY = 1 << 0;
        const HEAP = 1 << 1;
        const IMMUTABLE = 1 << 2;
    }
}

pub const NUMBER_SLOTS: usize = 8;
pub const SEQUENCE_SLOTS: usize = 6;
pub const MAPPING_SLOTS: usize = 3;
pub const PROTOCOL_SLOTS: usize = 6;

/// Raw dispatch cells. A cell holds the word of the value bound for the
/// operation, or zero when empty; the fast paths read these directly and
/// never consult the attribute table.
#[repr(C)]
#[derive(Debug)]
pub struct NumberTable {
    pub cells: [u64; NUMBER_SLOTS],
}

#[repr(C)]
#[derive(Debug)]
pub struct SequenceTable {
    pub cells: [u64; SEQUENCE_SLOTS],
}

#[repr(C)]
#[derive(Debug)]
pub struct MappingTable {
    pub cells: [u64; MAPPING_SLOTS],
}

#[repr(C)]
#[derive(Debug)]
pub struct ProtocolTable {
    pub cells: [u64; PROTOCOL_SLOTS],
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TableKind {
    Number,
    Sequence,
    Mapping,
    Protocol,
}

#[derive(Debug, Copy, Clone)]
pub struct SlotId {
    pub table: TableKind,
    pub index: usize,
}

const fn nb(index: usize) -> SlotId {
    SlotId {
        table: TableKind::Number,
        index,
    }
}

const fn sq(index: usize) -> SlotId {
    SlotId {
        table: TableKind::Sequence,
        index,
    }
}

const fn mp(index: usize) -> SlotId {
    SlotId {
        table: TableKind::Mapping,
        index,
    }
}

const fn pr(index: usize) -> SlotId {
    SlotId {
        table: TableKind::Protocol,
        index,
    }
}

/// The runtime's own operation-name to dispatch-cell table. Order within an
/// entry is the order the fast path tries the cells in. Operations missing
/// here ("str", "init", ...) dispatch through attribute lookup only.
pub static SLOT_DEFS: &[(&str, &[SlotId])] = &[
    ("add", &[nb(0), sq(0)]),
    ("sub", &[nb(1)]),
    ("mul", &[nb(2), sq(1)]),
    ("div", &[nb(3)]),
    ("rem", &[nb(4)]),
    ("neg", &[nb(5)]),
    ("abs", &[nb(6)]),
    ("matmul", &[nb(7)]),
    ("len", &[sq(2), mp(0)]),
    ("item", &[sq(3), mp(1)]),
    ("set_item", &[sq(4), mp(2)]),
    ("contains", &[sq(5)]),
    ("repr", &[pr(0)]),
    ("hash", &[pr(1)]),
    ("eq", &[pr(2)]),
    ("lt", &[pr(3)]),
    ("call", &[pr(4)]),
    ("iter", &[pr(5)]),
];

pub fn slot_defs(name: &str) -> Option<&'static [SlotId]> {
    SLOT_DEFS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, ids)| *ids)
}

/// Attributes stamped onto every freshly created type; batch application
/// skips these.
pub const DEFAULT_TYPE_ATTRS: &[&str] = &["doc"];

/// The runtime representation of a type. Statically created descriptors
/// leave the sub-table pointers null until something populates them;
/// heap-backed descriptors point them into their own trailing storage.
#[repr(C)]
#[derive(Debug)]
pub struct TypeDescriptor {
    pub header: Header,
    pub flags: u64,
    pub name: Value,
    pub dict: Value,
    pub base: Value,
    pub mro: Value,
    pub subclasses: Value,
    pub lookup_cache: Value,
    pub number: *mut NumberTable,
    pub sequence: *mut SequenceTable,
    pub mapping: *mut MappingTable,
    pub protocol: *mut ProtocolTable,
}

impl TypeDescriptor {
    /// Initialize a statically created descriptor, sub-tables unmaterialized.
    /// # Safety
    /// should only be called by the runtime on fresh storage
    pub unsafe fn init(
        &mut self,
        name: Value,
        dict: Value,
        base: Value,
        flags: TypeFlags,
    ) {
        self.header =
            Header::encode_object(ObjectType::Type, HeaderFlags::empty(), 0);
        self.flags = flags.bits();
        self.name = name;
        self.dict = dict;
        self.base = base;
        self.mro = Value::zero();
        self.subclasses = Value::zero();
        self.lookup_cache = Value::zero();
        self.number = std::ptr::null_mut();
        self.sequence = std::ptr::null_mut();
        self.mapping = std::ptr::null_mut();
        self.protocol = std::ptr::null_mut();
    }

    #[inline]
    pub fn type_flags(&self) -> TypeFlags {
        TypeFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn set_type_flags(&mut self, flags: TypeFlags) {
        self.flags = flags.bits();
    }

    #[inline]
    pub fn is_heap(&self) -> bool {
        self.type_flags().contains(TypeFlags::HEAP)
    }

    /// Read a dispatch cell, zero when the table is unmaterialized.
    pub fn table_cell(&self, id: SlotId) -> u64 {
        debug_assert!(id.index < table_size(id.table));
        match id.table {
            TableKind::Number => {
                // SAFETY: non-null tables are sized per their kind
                (!self.number.is_null())
                    .then(|| unsafe { (*self.number).cells[id.index] })
            }
            TableKind::Sequence => (!self.sequence.is_null())
                .then(|| unsafe { (*self.sequence).cells[id.index] }),
            TableKind::Mapping => (!self.mapping.is_null())
                .then(|| unsafe { (*self.mapping).cells[id.index] }),
            TableKind::Protocol => (!self.protocol.is_null())
                .then(|| unsafe { (*self.protocol).cells[id.index] }),
        }
        .unwrap_or(0)
    }

    /// Write a dispatch cell; false when the table is unmaterialized.
    pub fn set_table_cell(&mut self, id: SlotId, bits: u64) -> bool {
        debug_assert!(id.index < table_size(id.table));
        match id.table {
            TableKind::Number => {
                if self.number.is_null() {
                    return false;
                }
                // SAFETY: non-null tables are sized per their kind
                unsafe { (*self.number).cells[id.index] = bits };
            }
            TableKind::Sequence => {
                if self.sequence.is_null() {
                    return false;
                }
                unsafe { (*self.sequence).cells[id.index] = bits };
            }
            TableKind::Mapping => {
                if self.mapping.is_null() {
                    return false;
                }
                unsafe { (*self.mapping).cells[id.index] = bits };
            }
            TableKind::Protocol => {
                if self.protocol.is_null() {
                    return false;
                }
                unsafe { (*self.protocol).cells[id.index] = bits };
            }
        }
        true
    }
}

impl Object for TypeDescriptor {}
impl HeapObject for TypeDescriptor {}

pub const fn table_size(kind: TableKind) -> usize {
    match kind {
        TableKind::Number => NUMBER_SLOTS,
        TableKind::Sequence => SEQUENCE_SLOTS,
        TableKind::Mapping => MAPPING_SLOTS,
        TableKind::Protocol => PROTOCOL_SLOTS,
    }
}

/// Heap-backed descriptor: the body plus embedded storage for every
/// sub-table, pointer cells wired into that storage at init.
#[repr(C)]
#[derive(Debug)]
pub struct HeapTypeDescriptor {
    pub ty: TypeDescriptor,
    pub number_storage: NumberTable,
    pub sequence_storage: SequenceTable,
    pub mapping_storage: MappingTable,
    pub protocol_storage: ProtocolTable,
}

impl HeapTypeDescriptor {
    /// Initialize a heap descriptor with embedded, zeroed sub-tables.
    /// # Safety
    /// should only be called by the runtime on fresh zeroed storage
    pub unsafe fn init(
        &mut self,
        name: Value,
        dict: Value,
        base: Value,
        flags: TypeFlags,
    ) {
        // SAFETY: same contract
        unsafe { self.ty.init(name, dict, base, flags | TypeFlags::HEAP) };
        self.number_storage = NumberTable {
            cells: [0; NUMBER_SLOTS],
        };
        self.sequence_storage = SequenceTable {
            cells: [0; SEQUENCE_SLOTS],
        };
        self.mapping_storage = MappingTable {
            cells: [0; MAPPING_SLOTS],
        };
        self.protocol_storage = ProtocolTable {
            cells: [0; PROTOCOL_SLOTS],
        };
        self.ty.number = &mut self.number_storage;
        self.ty.sequence = &mut self.sequence_storage;
        self.ty.mapping = &mut self.mapping_storage;
        self.ty.protocol = &mut self.protocol_storage;
    }
}

impl Object for HeapTypeDescriptor {}
impl HeapObject for HeapTypeDescriptor {}

pub const TYPE_WORDS: usize = mem::size_of::<TypeDescriptor>() / 8;
pub const HEAP_TYPE_WORDS: usize = mem::size_of::<HeapTypeDescriptor>() / 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_body_is_twelve_words() {
        assert_eq!(TYPE_WORDS, 12);
        assert_eq!(
            HEAP_TYPE_WORDS,
            TYPE_WORDS
                + NUMBER_SLOTS
                + SEQUENCE_SLOTS
                + MAPPING_SLOTS
                + PROTOCOL_SLOTS
        );
    }

    #[test]
    fn slot_defs_indices_fit_their_tables() {
        for (name, ids) in SLOT_DEFS {
            for id in *ids {
                assert!(
                    id.index < table_size(id.table),
                    "{name} cell out of range"
                );
            }
        }
    }

    #[test]
    fn attr_only_names_have_no_slots() {
        assert!(slot_defs("str").is_none());
        assert!(slot_defs("doc").is_none());
        assert!(slot_defs("add").is_some());
        assert_eq!(slot_defs("add").unwrap().len(), 2);
    }
}
