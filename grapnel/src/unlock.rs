//! Temporarily lifting the write protection on a descriptor.
//!
//! `UnlockGuard` is a scope: acquiring it forces the descriptor's
//! substructures into existence, captures the exact flag word as the
//! restoration token and clears the protection bit; dropping it discards
//! any materialized lookup cache and writes the captured word back, on
//! every exit path. Nesting is fine, each guard restores what it saw.

use crate::{
    HookError, Runtime, SlotLayout, TypeFlags, Value,
    layout::LayoutRevision,
    mem::{self, TypeMem},
};

/// Opaque restoration token: the flag word exactly as it was.
#[derive(Debug, Copy, Clone)]
pub struct UnlockToken(pub(crate) u64);

pub struct UnlockGuard {
    mem: TypeMem,
    flags_offset: usize,
    cache_offset: usize,
    token: UnlockToken,
}

impl UnlockGuard {
    pub fn acquire(
        rt: &mut Runtime,
        layout: &SlotLayout,
        tyv: Value,
    ) -> Result<Self, HookError> {
        if !rt.is_type(tyv) {
            return Err(HookError::InvalidTarget);
        }
        // the slot map's raw writes need every sub-table to exist, for the
        // descriptor and for everything below it
        force_substructures(rt, layout, tyv);
        let mem =
            TypeMem::of(rt, tyv).ok_or(HookError::InvalidTarget)?;
        // SAFETY: service offsets come from the discovered layout
        let word = unsafe { mem.read_word(layout.flags_offset) };
        let unlocked = match layout.revision {
            LayoutRevision::RevA => word | TypeFlags::HEAP.bits(),
            LayoutRevision::RevB => word & !TypeFlags::IMMUTABLE.bits(),
        };
        // SAFETY: as above
        unsafe { mem.write_word(layout.flags_offset, unlocked) };
        log::trace!(
            "unlocked {} ({:#x} -> {:#x})",
            rt.type_name(tyv),
            word,
            unlocked
        );
        Ok(Self {
            mem,
            flags_offset: layout.flags_offset,
            cache_offset: layout.cache_offset,
            token: UnlockToken(word),
        })
    }

    pub fn token(&self) -> UnlockToken {
        self.token
    }
}

impl Drop for UnlockGuard {
    fn drop(&mut self) {
        // the cached lookup state must be null before the protection comes
        // back; whatever was materialized under the unlock is abandoned
        // SAFETY: service offsets come from the discovered layout
        unsafe {
            self.mem.write_word(self.cache_offset, 0);
            self.mem.write_word(self.flags_offset, self.token.0);
        }
    }
}

fn force_substructures(rt: &mut Runtime, layout: &SlotLayout, tyv: Value) {
    for sub in rt.subclasses_of(tyv) {
        force_substructures(rt, layout, sub);
    }
    let Some(mem) = TypeMem::of(rt, tyv) else {
        return;
    };
    for (cell_offset, size_words) in layout.table_cells() {
        mem::ensure_table(rt, &mem, cell_offset, size_words);
    }
}
