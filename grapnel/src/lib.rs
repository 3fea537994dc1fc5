//! grapnel: runtime hooking of immutable type descriptors.
//!
//! The crate carries a small embedded object runtime (tagged values, raw
//! `#[repr(C)]` heap objects, type descriptors with raw dispatch sub-tables)
//! and the hooking core that patches it: layout discovery by probing, raw
//! memory access, scoped unlock of the immutability protection, the patch
//! engine with original-call resolution, and a declarative batch front-end.

mod descriptor;
mod error;
mod interning;
mod layout;
mod mem;
mod objects;
mod orig;
mod patch;
mod primitives;
mod runtime;
mod shape;
mod tagged;
mod unlock;

pub use descriptor::{
    DEFAULT_TYPE_ATTRS, HEAP_TYPE_WORDS, HeapTypeDescriptor, MAPPING_SLOTS,
    MappingTable, NUMBER_SLOTS, NumberTable, PROTOCOL_SLOTS, ProtocolTable,
    SEQUENCE_SLOTS, SLOT_DEFS, SequenceTable, SlotId, TYPE_WORDS, TableKind,
    TypeDescriptor, TypeFlags, slot_defs, table_size,
};
pub use error::{HookError, RuntimeError};
pub use interning::Names;
pub use layout::{LayoutRevision, SlotLayout, SlotRef, probe, probed_layout};
pub use mem::{TypeMem, ensure_table, read_slot, write_slot};
pub use objects::{
    Header, HeaderFlags, HeapObject, HeapValue, Object, ObjectType,
    arrays::Array,
    bytearrays::ByteArray,
    dicts::{Dict, DictEntry, DictSet},
    functions::{AccessorPart, Function, HookMarker, Instance, Native, Property},
};
pub use orig::{call_original, original_delete, original_get, original_set};
pub use patch::Hooks;
pub use runtime::{Frame, Runtime, RuntimeCreateInfo, SpecialTypes};
pub use shape::{Shape, ShapeEntry};
pub use tagged::{Tagged, VALUE_TAG_MASK, Value, ValueTag};
pub use unlock::{UnlockGuard, UnlockToken};
