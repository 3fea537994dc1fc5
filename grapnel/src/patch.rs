//! Installing and removing replacements on type descriptors.
//!
//! `Hooks` owns the process-wide mutable registries of the design: the
//! first-original cache and the active-replacement set, plus a handle on
//! the discovered slot layout. Construct one next to the runtime it
//! manages; tests get isolation by constructing their own.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    HookError, ObjectType, Runtime, SlotLayout, Value, layout,
    mem::{self, TypeMem},
    objects::functions::AccessorPart,
    unlock::UnlockGuard,
};

/// (descriptor identity, interned operation name)
type PairKey = (u64, u64);

pub struct Hooks {
    layout: Option<Arc<SlotLayout>>,
    /// first pre-hook value per pair; None is the "previously absent"
    /// sentinel. Present implies the pair is active.
    originals: HashMap<PairKey, Option<Value>>,
    active: HashSet<PairKey>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self {
            layout: None,
            originals: HashMap::new(),
            active: HashSet::new(),
        }
    }

    pub(crate) fn layout(
        &mut self,
        rt: &mut Runtime,
    ) -> Result<Arc<SlotLayout>, HookError> {
        if let Some(layout) = &self.layout {
            return Ok(layout.clone());
        }
        let layout = layout::probed_layout(rt)?;
        self.layout = Some(layout.clone());
        Ok(layout)
    }

    pub fn is_active(&self, rt: &mut Runtime, tyv: Value, name: &str) -> bool {
        let name_v = rt.intern(name);
        self.active.contains(&(tyv.raw(), name_v.raw()))
    }

    /// Install a replacement for an operation, chaining over any already
    /// installed one. The first install per pair snapshots the pre-hook
    /// own-namespace value; every install wraps a callable with a marker
    /// binding its immediate predecessor for the original-call resolver.
    pub fn install_operation(
        &mut self,
        rt: &mut Runtime,
        tyv: Value,
        name: &str,
        value: Value,
    ) -> Result<(), HookError> {
        if !rt.is_type(tyv) {
            return Err(HookError::InvalidTarget);
        }
        let layout = self.layout(rt)?;
        let name_v = rt.intern(name);
        let key = (tyv.raw(), name_v.raw());
        let prev_own = rt.own_attr(tyv, name_v);
        if !self.originals.contains_key(&key) {
            self.originals.insert(key, prev_own);
            self.active.insert(key);
            log::debug!(
                "hooking {}::{name} (original {})",
                rt.type_name(tyv),
                if prev_own.is_some() { "kept" } else { "absent" }
            );
        }
        let installed =
            if rt.heap_type_of(value) == Some(ObjectType::Function) {
                rt.clone_function_with_marker(
                    value,
                    name_v,
                    prev_own,
                    AccessorPart::None,
                )
            } else {
                value
            };
        self.write_attr(rt, &layout, tyv, name_v, name, installed)?;
        propagate_cells(rt, &layout, tyv, name_v, installed.raw());
        Ok(())
    }

    /// Remove the most recent replacement for an operation. Intermediate
    /// chained layers peel off through their marker predecessor; the last
    /// layer restores the cached first original per the method-resolution
    /// order, or leaves the name to inheritance.
    pub fn remove_operation(
        &mut self,
        rt: &mut Runtime,
        tyv: Value,
        name: &str,
    ) -> Result<(), HookError> {
        if !rt.is_type(tyv) {
            return Err(HookError::InvalidTarget);
        }
        let layout = self.layout(rt)?;
        let name_v = rt.intern(name);
        let key = (tyv.raw(), name_v.raw());
        if !self.active.contains(&key) {
            return Err(HookError::NotInstalled);
        }
        let current = rt.own_attr(tyv, name_v);
        let marker = current.and_then(|v| rt.value_marker(v));

        let guard = UnlockGuard::acquire(rt, &layout, tyv)?;
        if current.is_some()
            && let Err(err) = rt.type_del_attr(tyv, name_v)
        {
            log::warn!("removing {name}: delete failed: {err}");
        }

        // LIFO peel: a predecessor that is itself a live hook layer for the
        // same operation goes back in, and the pair stays active
        if let Some(marker) = marker
            && let Some(pred) = marker.orig
            && rt
                .value_marker(pred)
                .is_some_and(|m| m.name == name_v)
        {
            log::debug!("unhooking {name}: peeled one chained layer");
            if let Err(err) = rt.type_set_attr(tyv, name_v, pred) {
                log::warn!("removing {name}: restore failed: {err}");
            }
            write_cells(rt, &layout, tyv, name, pred.raw());
            drop(guard);
            rt.notify_modified(tyv);
            propagate_cells(rt, &layout, tyv, name_v, pred.raw());
            return Ok(());
        }

        // final layer: accumulate the inherited view, pop the first cached
        // original most-to-least derived, restore it only when inheritance
        // does not already provide it
        let mut inherited: Vec<Value> = Vec::new();
        for ancestor in rt.mro_of(tyv).into_iter().skip(1) {
            if let Some(v) = rt.own_attr(ancestor, name_v) {
                inherited.push(v);
            }
        }
        let mut popped: Option<Option<Value>> = None;
        for ancestor in rt.mro_of(tyv) {
            let k = (ancestor.raw(), name_v.raw());
            if let Some(orig) = self.originals.remove(&k) {
                self.active.remove(&k);
                popped = Some(orig);
                break;
            }
        }
        let Some(original) = popped else {
            // active without a cached original cannot happen
            drop(guard);
            return Err(HookError::NotInstalled);
        };
        match original {
            Some(v) if !inherited.contains(&v) => {
                log::debug!("unhooking {name}: restored the original");
                if let Err(err) = rt.type_set_attr(tyv, name_v, v) {
                    log::warn!("removing {name}: restore failed: {err}");
                }
            }
            Some(_) => {
                log::debug!("unhooking {name}: inheritance already provides it");
            }
            None => {
                log::debug!("unhooking {name}: left absent");
            }
        }
        let bits = rt.mro_lookup(tyv, name_v).map(|v| v.raw()).unwrap_or(0);
        write_cells(rt, &layout, tyv, name, bits);
        drop(guard);
        rt.notify_modified(tyv);
        propagate_cells(rt, &layout, tyv, name_v, bits);
        Ok(())
    }

    /// One-shot forced attribute write under a scoped unlock, no cache or
    /// active bookkeeping.
    pub fn force_set_attr(
        &mut self,
        rt: &mut Runtime,
        tyv: Value,
        name: &str,
        value: Value,
    ) -> Result<(), HookError> {
        if !rt.is_type(tyv) {
            return Err(HookError::InvalidTarget);
        }
        let layout = self.layout(rt)?;
        let name_v = rt.intern(name);
        self.write_attr(rt, &layout, tyv, name_v, name, value)?;
        propagate_cells(rt, &layout, tyv, name_v, value.raw());
        Ok(())
    }

    /// One-shot forced attribute delete under a scoped unlock.
    pub fn force_del_attr(
        &mut self,
        rt: &mut Runtime,
        tyv: Value,
        name: &str,
    ) -> Result<(), HookError> {
        if !rt.is_type(tyv) {
            return Err(HookError::InvalidTarget);
        }
        let layout = self.layout(rt)?;
        let name_v = rt.intern(name);
        if rt.own_attr(tyv, name_v).is_none() {
            return Err(HookError::NotInstalled);
        }
        let guard = UnlockGuard::acquire(rt, &layout, tyv)?;
        if let Err(err) = rt.type_del_attr(tyv, name_v) {
            log::warn!("force delete {name} failed: {err}");
        }
        let bits = rt.mro_lookup(tyv, name_v).map(|v| v.raw()).unwrap_or(0);
        write_cells(rt, &layout, tyv, name, bits);
        drop(guard);
        rt.notify_modified(tyv);
        propagate_cells(rt, &layout, tyv, name_v, bits);
        Ok(())
    }

    /// Guarded attribute-table write plus the raw cell writes for every
    /// slot the discovered map lists for the name. Attribute-table-only
    /// operations get no raw writes.
    pub(crate) fn write_attr(
        &mut self,
        rt: &mut Runtime,
        layout: &SlotLayout,
        tyv: Value,
        name_v: Value,
        name: &str,
        value: Value,
    ) -> Result<(), HookError> {
        let guard = UnlockGuard::acquire(rt, layout, tyv)?;
        if let Err(err) = rt.type_set_attr(tyv, name_v, value) {
            // accepted as a partial failure, the guard still relocks
            log::warn!("installing {name}: attribute write failed: {err}");
        }
        write_cells(rt, layout, tyv, name, value.raw());
        drop(guard);
        rt.notify_modified(tyv);
        Ok(())
    }

    /// Record a pair as hooked if it is not yet, snapshotting the first
    /// original. Shared by the accessor front-end.
    pub(crate) fn record_original(
        &mut self,
        rt: &mut Runtime,
        tyv: Value,
        name_v: Value,
    ) -> Option<Value> {
        let key = (tyv.raw(), name_v.raw());
        let prev_own = rt.own_attr(tyv, name_v);
        if !self.originals.contains_key(&key) {
            self.originals.insert(key, prev_own);
            self.active.insert(key);
        }
        prev_own
    }
}

/// Raw cell writes through the discovered slot map; silently skipped for
/// operations with no slots.
fn write_cells(
    rt: &mut Runtime,
    layout: &SlotLayout,
    tyv: Value,
    name: &str,
    bits: u64,
) {
    let Some(refs) = layout.refs(name) else {
        return;
    };
    let Some(view) = TypeMem::of(rt, tyv) else {
        return;
    };
    let refs = refs.to_vec();
    for r in refs {
        let table = mem::ensure_table(rt, &view, r.cell_offset, r.table_size);
        // SAFETY: index < table_size by the slot map invariant
        unsafe { mem::write_slot(table, r.index, bits) };
    }
}

/// Push a change down to every live direct subclass that was inheriting the
/// operation rather than overriding it. Non-base semantics: only the raw
/// cells move, nothing is recorded against the subclass.
pub(crate) fn propagate_cells(
    rt: &mut Runtime,
    layout: &SlotLayout,
    tyv: Value,
    name_v: Value,
    bits: u64,
) {
    let name = rt.sym(name_v).to_owned();
    for sub in rt.subclasses_of(tyv) {
        if rt.own_attr(sub, name_v).is_some() {
            continue;
        }
        write_cells(rt, layout, sub, &name, bits);
        propagate_cells(rt, layout, sub, name_v, bits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RuntimeCreateInfo, RuntimeError, orig};

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn setup() -> (Runtime, Hooks) {
        init_logs();
        (Runtime::new(RuntimeCreateInfo::default()), Hooks::new())
    }

    const SENTINEL: i64 = 424242;

    #[test]
    fn hook_and_unhook_restore_builtin_dispatch() {
        let (mut rt, mut hooks) = setup();
        let fixnum = rt.specials.fixnum_type;
        let before = rt.type_attr(fixnum, "add").unwrap();

        let f = rt.allocate_function("always_sentinel", 2, false, |_, _| {
            Ok(Value::from_fixnum(SENTINEL))
        });
        hooks.install_operation(&mut rt, fixnum, "add", f).unwrap();

        let hooked = rt
            .binary("add", Value::from_fixnum(1), Value::from_fixnum(2))
            .unwrap();
        assert_eq!(hooked.as_fixnum(), Some(SENTINEL));

        hooks.remove_operation(&mut rt, fixnum, "add").unwrap();
        let after = rt
            .binary("add", Value::from_fixnum(1), Value::from_fixnum(2))
            .unwrap();
        assert_eq!(after.as_fixnum(), Some(3));
        assert_eq!(rt.type_attr(fixnum, "add"), Some(before));
    }

    #[test]
    fn hooking_an_absent_operation_round_trips_to_absent() {
        let (mut rt, mut hooks) = setup();
        let fixnum = rt.specials.fixnum_type;
        assert!(rt.type_attr(fixnum, "contains").is_none());

        let f = rt.allocate_function("fixnum_contains", 2, false, |_, args| {
            let digit = args[1].as_fixnum().unwrap_or(-1);
            let n = args[0].as_fixnum().unwrap_or(0);
            Ok(Value::from_fixnum(
                n.to_string().contains(&digit.to_string()) as i64,
            ))
        });
        hooks
            .install_operation(&mut rt, fixnum, "contains", f)
            .unwrap();
        let r = rt
            .binary("contains", Value::from_fixnum(123), Value::from_fixnum(2))
            .unwrap();
        assert_eq!(r.as_fixnum(), Some(1));

        hooks.remove_operation(&mut rt, fixnum, "contains").unwrap();
        assert!(rt.type_attr(fixnum, "contains").is_none());
        assert!(
            rt.binary(
                "contains",
                Value::from_fixnum(123),
                Value::from_fixnum(2)
            )
            .is_err()
        );
    }

    #[test]
    fn call_original_reaches_the_superseded_implementation() {
        let (mut rt, mut hooks) = setup();
        let fixnum = rt.specials.fixnum_type;
        let f = rt.allocate_function("double_add", 2, false, |rt, args| {
            let sum = orig::call_original(rt, args)?;
            rt.binary("mul", sum, Value::from_fixnum(2))
        });
        hooks.install_operation(&mut rt, fixnum, "add", f).unwrap();
        let r = rt
            .binary("add", Value::from_fixnum(2), Value::from_fixnum(3))
            .unwrap();
        assert_eq!(r.as_fixnum(), Some(10));
        hooks.remove_operation(&mut rt, fixnum, "add").unwrap();
    }

    #[test]
    fn chained_hooks_layer_and_peel_in_lifo_order() {
        let (mut rt, mut hooks) = setup();
        let fixnum = rt.specials.fixnum_type;
        let builtin_add = rt.type_attr(fixnum, "add").unwrap();

        // v1: original + 100, v2: original + 1000 on top of v1
        let v1 = rt.allocate_function("plus_hundred", 2, false, |rt, args| {
            let sum = orig::call_original(rt, args)?;
            Ok(Value::from_fixnum(sum.as_fixnum().unwrap_or(0) + 100))
        });
        let v2 = rt.allocate_function("plus_thousand", 2, false, |rt, args| {
            let sum = orig::call_original(rt, args)?;
            Ok(Value::from_fixnum(sum.as_fixnum().unwrap_or(0) + 1000))
        });
        hooks.install_operation(&mut rt, fixnum, "add", v1).unwrap();
        hooks.install_operation(&mut rt, fixnum, "add", v2).unwrap();

        // v2 on top: its original is v1, whose original is the builtin
        let r = rt
            .binary("add", Value::from_fixnum(1), Value::from_fixnum(2))
            .unwrap();
        assert_eq!(r.as_fixnum(), Some(1103));

        hooks.remove_operation(&mut rt, fixnum, "add").unwrap();
        let r = rt
            .binary("add", Value::from_fixnum(1), Value::from_fixnum(2))
            .unwrap();
        assert_eq!(r.as_fixnum(), Some(103));

        hooks.remove_operation(&mut rt, fixnum, "add").unwrap();
        let r = rt
            .binary("add", Value::from_fixnum(1), Value::from_fixnum(2))
            .unwrap();
        assert_eq!(r.as_fixnum(), Some(3));
        assert_eq!(rt.type_attr(fixnum, "add"), Some(builtin_add));
    }

    #[test]
    fn removal_of_a_never_installed_pair_is_rejected() {
        let (mut rt, mut hooks) = setup();
        let fixnum = rt.specials.fixnum_type;
        let err = hooks
            .remove_operation(&mut rt, fixnum, "sub")
            .unwrap_err();
        assert_eq!(err, HookError::NotInstalled);
    }

    #[test]
    fn non_descriptor_targets_are_rejected() {
        let (mut rt, mut hooks) = setup();
        let err = hooks
            .install_operation(
                &mut rt,
                Value::from_fixnum(7),
                "add",
                Value::from_fixnum(1),
            )
            .unwrap_err();
        assert_eq!(err, HookError::InvalidTarget);
    }

    #[test]
    fn installing_twice_keeps_the_first_original() {
        let (mut rt, mut hooks) = setup();
        let fixnum = rt.specials.fixnum_type;
        let builtin_add = rt.type_attr(fixnum, "add").unwrap();
        let v1 = rt.allocate_function("v1", 2, false, |_, _| {
            Ok(Value::from_fixnum(1))
        });
        let v2 = rt.allocate_function("v2", 2, false, |_, _| {
            Ok(Value::from_fixnum(2))
        });
        hooks.install_operation(&mut rt, fixnum, "add", v1).unwrap();
        hooks.install_operation(&mut rt, fixnum, "add", v2).unwrap();
        hooks.remove_operation(&mut rt, fixnum, "add").unwrap();
        hooks.remove_operation(&mut rt, fixnum, "add").unwrap();
        assert_eq!(rt.type_attr(fixnum, "add"), Some(builtin_add));
        // fully unhooked again
        assert_eq!(
            hooks.remove_operation(&mut rt, fixnum, "add").unwrap_err(),
            HookError::NotInstalled
        );
    }

    #[test]
    fn subclasses_observe_base_installs_without_becoming_active() {
        let (mut rt, mut hooks) = setup();
        let base = rt.new_heap_type("shape", rt.specials.object_type);
        let f_area = rt.allocate_function("area", 1, false, |_, _| {
            Ok(Value::from_fixnum(6))
        });
        let name = rt.intern("abs");
        rt.type_set_attr(base, name, f_area).unwrap();
        let sub = rt.new_heap_type("square", base);
        let obj = rt.new_instance(sub);
        assert_eq!(rt.unary("abs", obj).unwrap().as_fixnum(), Some(6));

        let hook = rt.allocate_function("area_hook", 1, false, |_, _| {
            Ok(Value::from_fixnum(SENTINEL))
        });
        hooks.install_operation(&mut rt, base, "abs", hook).unwrap();

        // the subclass's fast path observes the replacement
        assert_eq!(rt.unary("abs", obj).unwrap().as_fixnum(), Some(SENTINEL));
        // but only the base is active
        assert!(hooks.is_active(&mut rt, base, "abs"));
        assert!(!hooks.is_active(&mut rt, sub, "abs"));

        hooks.remove_operation(&mut rt, base, "abs").unwrap();
        assert_eq!(rt.unary("abs", obj).unwrap().as_fixnum(), Some(6));
    }

    #[test]
    fn overriding_subclasses_are_left_alone() {
        let (mut rt, mut hooks) = setup();
        let base = rt.new_heap_type("b", rt.specials.object_type);
        let sub = rt.new_heap_type("s", base);
        let base_neg = rt.allocate_function("base_neg", 1, false, |_, _| {
            Ok(Value::from_fixnum(1))
        });
        let sub_neg = rt.allocate_function("sub_neg", 1, false, |_, _| {
            Ok(Value::from_fixnum(2))
        });
        let name = rt.intern("neg");
        rt.type_set_attr(base, name, base_neg).unwrap();
        rt.type_set_attr(sub, name, sub_neg).unwrap();

        let hook = rt.allocate_function("neg_hook", 1, false, |_, _| {
            Ok(Value::from_fixnum(3))
        });
        hooks.install_operation(&mut rt, base, "neg", hook).unwrap();

        let base_obj = rt.new_instance(base);
        let sub_obj = rt.new_instance(sub);
        assert_eq!(rt.unary("neg", base_obj).unwrap().as_fixnum(), Some(3));
        assert_eq!(rt.unary("neg", sub_obj).unwrap().as_fixnum(), Some(2));
        hooks.remove_operation(&mut rt, base, "neg").unwrap();
    }

    #[test]
    fn attribute_only_operations_install_without_slots() {
        let (mut rt, mut hooks) = setup();
        let fixnum = rt.specials.fixnum_type;
        let f = rt.allocate_function("str_hook", 1, false, |rt, _| {
            Ok(rt.allocate_bytearray(b"hooked"))
        });
        hooks.install_operation(&mut rt, fixnum, "str", f).unwrap();
        let s = rt.unary("str", Value::from_fixnum(9)).unwrap();
        // SAFETY: the hook returns a bytearray
        let bytes =
            unsafe { s.as_tagged_unchecked::<crate::ByteArray>().as_ref() };
        assert_eq!(bytes.as_bytes(), b"hooked");
        hooks.remove_operation(&mut rt, fixnum, "str").unwrap();
        let s = rt.unary("str", Value::from_fixnum(9)).unwrap();
        // SAFETY: as above
        let bytes =
            unsafe { s.as_tagged_unchecked::<crate::ByteArray>().as_ref() };
        assert_eq!(bytes.as_bytes(), b"9");
    }

    #[test]
    fn forced_writes_bypass_bookkeeping() {
        let (mut rt, mut hooks) = setup();
        let fixnum = rt.specials.fixnum_type;
        hooks
            .force_set_attr(&mut rt, fixnum, "answer", Value::from_fixnum(42))
            .unwrap();
        assert_eq!(
            rt.type_attr(fixnum, "answer"),
            Some(Value::from_fixnum(42))
        );
        assert!(!hooks.is_active(&mut rt, fixnum, "answer"));
        hooks.force_del_attr(&mut rt, fixnum, "answer").unwrap();
        assert!(rt.type_attr(fixnum, "answer").is_none());
        // still locked afterwards
        let name = rt.intern("answer");
        assert!(
            rt.type_set_attr(fixnum, name, Value::from_fixnum(1))
                .is_err()
        );
    }

    #[test]
    fn end_to_end_add_hook_on_fixnums() {
        let (mut rt, mut hooks) = setup();
        let fixnum = rt.specials.fixnum_type;
        let sentinel = rt.allocate_bytearray(b"sentinel");
        let f = rt.allocate_function("return_sentinel", 2, false, move |_, _| {
            Ok(sentinel)
        });
        hooks.install_operation(&mut rt, fixnum, "add", f).unwrap();
        let r = rt
            .binary("add", Value::from_fixnum(1), Value::from_fixnum(2))
            .unwrap();
        assert_eq!(r, sentinel);
        hooks.remove_operation(&mut rt, fixnum, "add").unwrap();
        let r = rt
            .binary("add", Value::from_fixnum(1), Value::from_fixnum(2))
            .unwrap();
        assert_eq!(r.as_fixnum(), Some(3));
    }

    #[test]
    fn partial_failure_still_relocks() {
        let (mut rt, mut hooks) = setup();
        let fixnum = rt.specials.fixnum_type;
        let before = rt.type_flags_word(fixnum);
        // a remove that fails early must not leave the descriptor unlocked
        let _ = hooks.remove_operation(&mut rt, fixnum, "never_hooked");
        assert_eq!(rt.type_flags_word(fixnum), before);
        let name = rt.intern("x");
        let err = rt
            .type_set_attr(fixnum, name, Value::from_fixnum(1))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ImmutableType(_)));
    }
}
