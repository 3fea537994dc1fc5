//! Layout discovery: where, inside an opaque type descriptor, the raw
//! dispatch cells live.
//!
//! Nothing here reads the descriptor struct definition. A scratch heap type
//! is allocated, its memory snapshotted, and every candidate operation name
//! is installed on it with a synthetic method; whichever words move are
//! dispatch cells. Sub-table extents fall out of the pointer words whose
//! targets lie inside the scratch descriptor's own allocation, because
//! heap-backed descriptors embed their sub-table storage.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{HookError, Runtime, Value, mem::TypeMem};

/// Layout revision family the running runtime reports. The descriptor byte
/// layout is shared; what differs is which flag bit protects against
/// mutation (see the unlock module).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum LayoutRevision {
    RevA,
    #[default]
    RevB,
}

impl LayoutRevision {
    /// Hardcoded structural constants for the revision family. The snapshot
    /// is sized from these, never from the descriptor itself, and the probe
    /// result is validated against them.
    pub const fn heap_descriptor_words(self) -> usize {
        35
    }

    pub const fn expected_tables(self) -> usize {
        4
    }
}

/// One discovered dispatch cell: the size of its sub-table, the byte offset
/// of the sub-table pointer cell within the descriptor, and the cell index
/// within the sub-table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlotRef {
    pub table_size: usize,
    pub cell_offset: usize,
    pub index: usize,
}

#[derive(Debug, Copy, Clone)]
struct TableExtent {
    /// byte offset of the pointer cell within the descriptor body
    cell_offset: usize,
    /// byte offset of the table storage within the scratch allocation
    start: usize,
    size_words: usize,
}

/// The discovered slot map plus the two service offsets the controller
/// needs: the flag word and the lookup-cache cell.
#[derive(Debug)]
pub struct SlotLayout {
    pub revision: LayoutRevision,
    pub flags_offset: usize,
    pub cache_offset: usize,
    tables: Vec<TableExtent>,
    by_name: HashMap<String, Vec<SlotRef>>,
}

impl SlotLayout {
    pub fn refs(&self, name: &str) -> Option<&[SlotRef]> {
        self.by_name.get(name).map(|refs| refs.as_slice())
    }

    /// Every sub-table as (pointer cell offset, size in words).
    pub fn table_cells(&self) -> Vec<(usize, usize)> {
        self.tables
            .iter()
            .map(|t| (t.cell_offset, t.size_words))
            .collect()
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(|s| s.as_str())
    }
}

static PROBED: Mutex<Vec<(LayoutRevision, Arc<SlotLayout>)>> =
    Mutex::new(Vec::new());

/// The memoized slot layout for the runtime's revision, probing on first
/// use. Results are shared process-wide: the layout holds offsets only,
/// nothing bound to one runtime instance.
pub fn probed_layout(rt: &mut Runtime) -> Result<Arc<SlotLayout>, HookError> {
    let revision = rt.layout_revision();
    let mut cache = PROBED.lock();
    if let Some((_, layout)) = cache.iter().find(|(r, _)| *r == revision) {
        return Ok(layout.clone());
    }
    let layout = Arc::new(probe(rt)?);
    cache.push((revision, layout.clone()));
    Ok(layout)
}

/// Probe the running runtime, without consulting the memoization table.
pub fn probe(rt: &mut Runtime) -> Result<SlotLayout, HookError> {
    let revision = rt.layout_revision();
    let words = revision.heap_descriptor_words();

    // every operation name observed on any registered type's own namespace
    let mut names: Vec<String> = Vec::new();
    for tyv in rt.registered_types().to_vec() {
        for name_v in rt.own_attr_names(tyv) {
            let name = rt.sym(name_v).to_owned();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    let scratch = rt.new_heap_type("layout_probe", rt.specials.object_type);
    let mem = TypeMem::of(rt, scratch)
        .ok_or(HookError::LayoutUnsupported("probe type not a descriptor"))?;

    // SAFETY: heap descriptors span the revision's word count
    let baseline = unsafe { mem.snapshot(words) };

    // locate the flag word by its reflected value, word 0 excluded
    let flags_word = rt.type_flags_word(scratch);
    let flags_offset = baseline
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, w)| **w == flags_word)
        .map(|(i, _)| i * 8)
        .ok_or(HookError::LayoutUnsupported("flag word not located"))?;

    // sub-table extents: pointer words whose targets fall inside the
    // allocation, sorted by target; each runs to the next, the last to the
    // end of the allocation
    let base = mem.address() as u64;
    let end = base + (words * 8) as u64;
    let mut pointers: Vec<(usize, u64)> = baseline
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, w)| **w > base && **w < end)
        .map(|(i, w)| (i * 8, *w))
        .collect();
    pointers.sort_by_key(|(_, target)| *target);
    if pointers.len() != revision.expected_tables() {
        return Err(HookError::LayoutUnsupported("unexpected sub-table count"));
    }
    let mut tables = Vec::with_capacity(pointers.len());
    for (i, (cell_offset, target)) in pointers.iter().enumerate() {
        let next = pointers.get(i + 1).map(|(_, t)| *t).unwrap_or(end);
        tables.push(TableExtent {
            cell_offset: *cell_offset,
            start: (*target - base) as usize,
            size_words: ((next - *target) / 8) as usize,
        });
    }

    // install a fresh synthetic method per candidate name and watch which
    // words move; the first attempt that perturbs memory wins for a name
    let mut by_name: HashMap<String, Vec<SlotRef>> = HashMap::new();
    for name in &names {
        // SAFETY: as above
        let before = unsafe { mem.snapshot(words) };
        let synthetic = rt
            .allocate_function("layout_probe_method", 2, true, |_, _| {
                Ok(Value::zero())
            });
        let name_v = rt.intern(name);
        if rt.type_set_attr(scratch, name_v, synthetic).is_err() {
            // many names are expected to be unsettable on the scratch type
            continue;
        }
        // SAFETY: as above
        let after = unsafe { mem.snapshot(words) };
        let mut refs = Vec::new();
        for (i, (b, a)) in before.iter().zip(after.iter()).enumerate().skip(1) {
            if b != a {
                let offset = i * 8;
                let table = tables
                    .iter()
                    .find(|t| {
                        offset >= t.start && offset < t.start + t.size_words * 8
                    })
                    .ok_or(HookError::LayoutUnsupported(
                        "moved word outside every sub-table",
                    ))?;
                refs.push(SlotRef {
                    table_size: table.size_words,
                    cell_offset: table.cell_offset,
                    index: (offset - table.start) / 8,
                });
            }
        }
        if !refs.is_empty() && !by_name.contains_key(name) {
            log::trace!("operation '{name}' maps to {} cell(s)", refs.len());
            by_name.insert(name.clone(), refs);
        }
    }
    if by_name.is_empty() {
        return Err(HookError::LayoutUnsupported("probing moved no memory"));
    }

    // the lookup-cache cell: force one cached resolution and find the one
    // word that materializing the cache populated
    // SAFETY: as above
    let before = unsafe { mem.snapshot(words) };
    let _ = rt.type_attr(scratch, "doc");
    // SAFETY: as above
    let after = unsafe { mem.snapshot(words) };
    let moved: Vec<usize> = before
        .iter()
        .zip(after.iter())
        .enumerate()
        .skip(1)
        .filter(|(_, (b, a))| b != a)
        .map(|(i, _)| i * 8)
        .collect();
    if moved.len() != 1 {
        return Err(HookError::LayoutUnsupported("cache cell not isolated"));
    }
    let cache_offset = moved[0];
    rt.notify_modified(scratch);

    log::debug!(
        "layout probe ({revision:?}): {} operations, {} sub-tables, flags at \
         +{flags_offset}, cache at +{cache_offset}",
        by_name.len(),
        tables.len(),
    );

    Ok(SlotLayout {
        revision,
        flags_offset,
        cache_offset,
        tables,
        by_name,
    })
}
