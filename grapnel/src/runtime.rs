use std::{alloc::Layout, ptr::NonNull};

use crate::{
    Array, ByteArray, Dict, DictEntry, DictSet, Function, HeapTypeDescriptor,
    HeapValue, HookMarker, Instance, LayoutRevision, MappingTable, Names, Native,
    NumberTable, ObjectType, Property, ProtocolTable, RuntimeError,
    SequenceTable, TableKind, Tagged, TypeDescriptor, TypeFlags, Value,
    descriptor::{self, DEFAULT_TYPE_ATTRS, slot_defs, table_size},
    objects::functions::AccessorPart,
    primitives,
};

/// Process-lifetime allocation backing every runtime object and sub-table.
/// Nothing is freed until the runtime itself goes away.
pub(crate) struct Arena {
    chunks: Vec<(NonNull<u8>, Layout)>,
}

impl Arena {
    fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    pub(crate) fn alloc_zeroed(&mut self, layout: Layout) -> NonNull<u8> {
        debug_assert!(layout.size() > 0);
        // SAFETY: layout has non-zero size
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            std::alloc::handle_alloc_error(layout);
        };
        self.chunks.push((ptr, layout));
        ptr
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for (ptr, layout) in self.chunks.drain(..) {
            // SAFETY: allocated by this arena with exactly this layout
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

/// One native invocation: the executing function and a snapshot of its
/// arguments, as the original-call resolver reads them.
#[derive(Debug)]
pub struct Frame {
    pub function: Value,
    pub args: Vec<Value>,
}

#[derive(Debug)]
pub struct SpecialTypes {
    pub object_type: Value,
    pub type_type: Value,
    pub fixnum_type: Value,
    pub bytearray_type: Value,
    pub array_type: Value,
    pub dict_type: Value,
    pub function_type: Value,
    pub property_type: Value,
}

impl SpecialTypes {
    fn null() -> Self {
        Self {
            object_type: Value::zero(),
            type_type: Value::zero(),
            fixnum_type: Value::zero(),
            bytearray_type: Value::zero(),
            array_type: Value::zero(),
            dict_type: Value::zero(),
            function_type: Value::zero(),
            property_type: Value::zero(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RuntimeCreateInfo {
    pub revision: LayoutRevision,
}

/// The embedded host runtime: arena, interned names, bootstrap types, call
/// frames and the attribute/dispatch machinery the hooking core patches.
pub struct Runtime {
    revision: LayoutRevision,
    arena: Arena,
    natives: Vec<NonNull<Native>>,
    names: Names,
    pub specials: SpecialTypes,
    types: Vec<Value>,
    frames: Vec<Frame>,
}

impl Runtime {
    pub fn new(info: RuntimeCreateInfo) -> Self {
        let mut rt = Self {
            revision: info.revision,
            arena: Arena::new(),
            natives: Vec::new(),
            names: Names::new(),
            specials: SpecialTypes::null(),
            types: Vec::new(),
            frames: Vec::new(),
        };
        primitives::bootstrap(&mut rt);
        rt
    }

    #[inline]
    pub fn layout_revision(&self) -> LayoutRevision {
        self.revision
    }

    // ---- allocation -----------------------------------------------------

    pub(crate) fn alloc_raw(&mut self, layout: Layout) -> NonNull<u8> {
        self.arena.alloc_zeroed(layout)
    }

    pub fn allocate_bytearray(&mut self, data: &[u8]) -> Value {
        let layout = ByteArray::required_layout(data.len());
        let ptr = self.alloc_raw(layout).cast::<ByteArray>();
        // SAFETY: fresh allocation of the required layout
        unsafe { (*ptr.as_ptr()).init_data(data) };
        Tagged::new_ptr(ptr.as_ptr()).as_value()
    }

    pub fn allocate_array(&mut self, items: &[Value]) -> Value {
        let layout = Array::required_layout(items.len());
        let ptr = self.alloc_raw(layout).cast::<Array>();
        // SAFETY: fresh allocation of the required layout
        unsafe { (*ptr.as_ptr()).init_with_data(items) };
        Tagged::new_ptr(ptr.as_ptr()).as_value()
    }

    fn alloc_entries(&mut self, capacity: usize) -> *mut DictEntry {
        let layout =
            Layout::array::<DictEntry>(capacity).expect("create valid layout");
        self.alloc_raw(layout).cast::<DictEntry>().as_ptr()
    }

    pub fn allocate_dict(&mut self, capacity: usize) -> Value {
        let entries = if capacity > 0 {
            self.alloc_entries(capacity)
        } else {
            std::ptr::null_mut()
        };
        let ptr = self.alloc_raw(Layout::new::<Dict>()).cast::<Dict>();
        // SAFETY: fresh allocation, entry storage sized to capacity
        unsafe { (*ptr.as_ptr()).init(entries, capacity) };
        Tagged::new_ptr(ptr.as_ptr()).as_value()
    }

    /// Insert into a dict, moving its entry table to bigger storage when
    /// needed; the dict object itself never moves.
    pub fn dict_set(&mut self, dictv: Value, name: Value, value: Value) {
        // SAFETY: callers only hand dict references here
        let dict = unsafe { dictv.as_tagged_unchecked::<Dict>().as_mut() };
        if dict.set(name, value) == DictSet::Full {
            let capacity = (dict.capacity() * 2).max(4);
            let entries = self.alloc_entries(capacity);
            // SAFETY: fresh storage sized to capacity >= len
            unsafe { dict.grow(entries, capacity) };
            let outcome = dict.set(name, value);
            debug_assert_ne!(outcome, DictSet::Full);
        }
    }

    pub fn allocate_function<F>(
        &mut self,
        name: &str,
        params: usize,
        variadic: bool,
        f: F,
    ) -> Value
    where
        F: Fn(&mut Runtime, &[Value]) -> Result<Value, RuntimeError> + 'static,
    {
        let native = Box::into_raw(Box::new(Native { run: Box::new(f) }));
        // SAFETY: Box::into_raw never returns null
        self.natives.push(unsafe { NonNull::new_unchecked(native) });
        let name_v = self.intern(name);
        let ptr = self.alloc_raw(Layout::new::<Function>()).cast::<Function>();
        // SAFETY: fresh allocation; native lives as long as the runtime
        unsafe { (*ptr.as_ptr()).init(name_v, params, variadic, native) };
        Tagged::new_ptr(ptr.as_ptr()).as_value()
    }

    /// Copy a function object and attach a hook marker; shares the native.
    pub(crate) fn clone_function_with_marker(
        &mut self,
        funcv: Value,
        op_name: Value,
        orig: Option<Value>,
        part: AccessorPart,
    ) -> Value {
        // SAFETY: caller verified funcv references a Function
        let src = unsafe { funcv.as_tagged_unchecked::<Function>().as_ref() };
        let (name, params, variadic, native) =
            (src.name, src.params(), src.is_variadic(), src.native);
        let ptr = self.alloc_raw(Layout::new::<Function>()).cast::<Function>();
        // SAFETY: fresh allocation; the shared native outlives all objects
        unsafe {
            (*ptr.as_ptr()).init(name, params, variadic, native);
            (*ptr.as_ptr()).set_marker(op_name, orig, part);
        }
        Tagged::new_ptr(ptr.as_ptr()).as_value()
    }

    pub fn allocate_property(
        &mut self,
        get: Option<Value>,
        set: Option<Value>,
        del: Option<Value>,
    ) -> Value {
        let ptr = self.alloc_raw(Layout::new::<Property>()).cast::<Property>();
        // SAFETY: fresh allocation
        unsafe {
            (*ptr.as_ptr()).init(
                get.unwrap_or(Value::zero()),
                set.unwrap_or(Value::zero()),
                del.unwrap_or(Value::zero()),
            )
        };
        Tagged::new_ptr(ptr.as_ptr()).as_value()
    }

    pub fn new_instance(&mut self, tyv: Value) -> Value {
        let dict = self.allocate_dict(4);
        let ptr = self.alloc_raw(Layout::new::<Instance>()).cast::<Instance>();
        // SAFETY: fresh allocation
        unsafe { (*ptr.as_ptr()).init(tyv, dict) };
        Tagged::new_ptr(ptr.as_ptr()).as_value()
    }

    // ---- names ----------------------------------------------------------

    pub fn intern(&mut self, name: &str) -> Value {
        if let Some(v) = self.names.get(name) {
            return v;
        }
        let v = self.allocate_bytearray(name.as_bytes());
        self.names.insert(name.to_owned(), v);
        v
    }

    /// Read an interned name back out.
    pub fn sym(&self, name_v: Value) -> &str {
        // SAFETY: interned names are bytearrays and stay alive forever
        let bytes = unsafe { name_v.as_tagged_unchecked::<ByteArray>().as_ref() };
        bytes.as_utf8().unwrap_or("<non-utf8>")
    }

    // ---- type reflection ------------------------------------------------

    pub fn heap_type_of(&self, v: Value) -> Option<ObjectType> {
        if !v.is_reference() {
            return None;
        }
        // SAFETY: every reference points at a headered heap object
        let header = unsafe { v.as_tagged_unchecked::<HeapValue>().as_ref() };
        Some(header.header.object_type())
    }

    pub fn is_type(&self, v: Value) -> bool {
        self.heap_type_of(v) == Some(ObjectType::Type)
    }

    /// # Safety
    /// `tyv` must be a type descriptor reference; the returned lifetime is
    /// unbounded, the caller must not outlive the runtime with it
    pub(crate) unsafe fn type_ref<'a>(&self, tyv: Value) -> &'a TypeDescriptor {
        // SAFETY: forwarded contract
        unsafe { tyv.as_tagged_unchecked::<TypeDescriptor>().as_ref() }
    }

    /// # Safety
    /// `tyv` must be a type descriptor reference with no other live borrow;
    /// the returned lifetime is unbounded
    pub(crate) unsafe fn type_mut<'a>(&mut self, tyv: Value) -> &'a mut TypeDescriptor {
        // SAFETY: forwarded contract
        unsafe { tyv.as_tagged_unchecked::<TypeDescriptor>().as_mut() }
    }

    pub fn type_of(&self, v: Value) -> Value {
        if v.is_fixnum() {
            return self.specials.fixnum_type;
        }
        match self.heap_type_of(v) {
            Some(ObjectType::ByteArray) => self.specials.bytearray_type,
            Some(ObjectType::Array) => self.specials.array_type,
            Some(ObjectType::Dict) => self.specials.dict_type,
            Some(ObjectType::Function) => self.specials.function_type,
            Some(ObjectType::Property) => self.specials.property_type,
            Some(ObjectType::Type) => self.specials.type_type,
            Some(ObjectType::Instance) => {
                // SAFETY: header says Instance
                unsafe { v.as_tagged_unchecked::<Instance>().as_ref() }.ty
            }
            _ => self.specials.object_type,
        }
    }

    pub fn type_name(&self, tyv: Value) -> String {
        if !self.is_type(tyv) {
            return "<not a type>".to_owned();
        }
        // SAFETY: checked
        let ty = unsafe { self.type_ref(tyv) };
        self.sym(ty.name).to_owned()
    }

    /// The flag word as the runtime reports it for reflection.
    pub fn type_flags_word(&self, tyv: Value) -> u64 {
        // SAFETY: callers verify tyv with is_type first
        unsafe { self.type_ref(tyv) }.flags
    }

    pub fn is_type_mutable(&self, tyv: Value) -> bool {
        // SAFETY: callers verify tyv with is_type first
        let flags = unsafe { self.type_ref(tyv) }.type_flags();
        match self.revision {
            LayoutRevision::RevA => flags.contains(TypeFlags::HEAP),
            LayoutRevision::RevB => !flags.contains(TypeFlags::IMMUTABLE),
        }
    }

    pub fn mro_of(&self, tyv: Value) -> Vec<Value> {
        if !self.is_type(tyv) {
            return Vec::new();
        }
        // SAFETY: checked
        let ty = unsafe { self.type_ref(tyv) };
        if ty.mro.is_null() {
            return vec![tyv];
        }
        // SAFETY: mro is always an array
        let mro = unsafe { ty.mro.as_tagged_unchecked::<Array>().as_ref() };
        mro.fields().to_vec()
    }

    pub fn subclasses_of(&self, tyv: Value) -> Vec<Value> {
        if !self.is_type(tyv) {
            return Vec::new();
        }
        // SAFETY: checked
        let ty = unsafe { self.type_ref(tyv) };
        if ty.subclasses.is_null() {
            return Vec::new();
        }
        // SAFETY: subclasses is always an array
        let subs =
            unsafe { ty.subclasses.as_tagged_unchecked::<Array>().as_ref() };
        subs.fields().to_vec()
    }

    pub fn registered_types(&self) -> &[Value] {
        &self.types
    }

    /// Names in a descriptor's own namespace, in insertion order.
    pub fn own_attr_names(&self, tyv: Value) -> Vec<Value> {
        if !self.is_type(tyv) {
            return Vec::new();
        }
        // SAFETY: checked
        let ty = unsafe { self.type_ref(tyv) };
        // SAFETY: dict is always a dict object
        let dict = unsafe { ty.dict.as_tagged_unchecked::<Dict>().as_ref() };
        dict.entries().iter().map(|e| e.name).collect()
    }

    pub fn own_attr(&self, tyv: Value, name_v: Value) -> Option<Value> {
        if !self.is_type(tyv) {
            return None;
        }
        // SAFETY: checked
        let ty = unsafe { self.type_ref(tyv) };
        // SAFETY: dict is always a dict object
        let dict = unsafe { ty.dict.as_tagged_unchecked::<Dict>().as_ref() };
        dict.lookup(name_v)
    }

    /// Uncached resolution along the method-resolution order. Internal
    /// machinery (slot fixups, probing) must use this, never the cached path.
    pub fn mro_lookup(&self, tyv: Value, name_v: Value) -> Option<Value> {
        for ancestor in self.mro_of(tyv) {
            if let Some(v) = self.own_attr(ancestor, name_v) {
                return Some(v);
            }
        }
        None
    }

    /// Cached attribute resolution: materializes the per-descriptor lookup
    /// cache on first use; `notify_modified` throws it away.
    pub fn type_attr(&mut self, tyv: Value, name: &str) -> Option<Value> {
        let name_v = self.intern(name);
        self.type_attr_interned(tyv, name_v)
    }

    pub(crate) fn type_attr_interned(
        &mut self,
        tyv: Value,
        name_v: Value,
    ) -> Option<Value> {
        if !self.is_type(tyv) {
            return None;
        }
        // SAFETY: checked
        let cache = unsafe { self.type_ref(tyv) }.lookup_cache;
        let cachev = if cache.is_null() {
            let merged = self.materialize_lookup_cache(tyv);
            // SAFETY: checked above
            unsafe { self.type_mut(tyv) }.lookup_cache = merged;
            merged
        } else {
            cache
        };
        // SAFETY: the cache is always a dict object
        unsafe { cachev.as_tagged_unchecked::<Dict>().as_ref() }.lookup(name_v)
    }

    fn materialize_lookup_cache(&mut self, tyv: Value) -> Value {
        let mut merged: Vec<(Value, Value)> = Vec::new();
        // least derived first, more derived entries overwrite
        for ancestor in self.mro_of(tyv).into_iter().rev() {
            // SAFETY: mro entries are descriptors
            let ty = unsafe { self.type_ref(ancestor) };
            // SAFETY: dict is always a dict object
            let dict = unsafe { ty.dict.as_tagged_unchecked::<Dict>().as_ref() };
            for entry in dict.entries() {
                if let Some(slot) =
                    merged.iter_mut().find(|(n, _)| *n == entry.name)
                {
                    slot.1 = entry.value;
                } else {
                    merged.push((entry.name, entry.value));
                }
            }
        }
        let dictv = self.allocate_dict(merged.len().max(1));
        for (name, value) in merged {
            self.dict_set(dictv, name, value);
        }
        dictv
    }

    /// Discard the lookup caches of a descriptor and everything below it.
    /// This is the host runtime's "notify modified" entry point.
    pub fn notify_modified(&mut self, tyv: Value) {
        if !self.is_type(tyv) {
            return;
        }
        // SAFETY: checked
        unsafe { self.type_mut(tyv) }.lookup_cache = Value::zero();
        for sub in self.subclasses_of(tyv) {
            self.notify_modified(sub);
        }
    }

    // ---- type mutation --------------------------------------------------

    pub fn type_set_attr(
        &mut self,
        tyv: Value,
        name_v: Value,
        value: Value,
    ) -> Result<(), RuntimeError> {
        if !self.is_type(tyv) {
            return Err(RuntimeError::AttributeNotAssignable(
                self.sym(name_v).to_owned(),
            ));
        }
        if !self.is_type_mutable(tyv) {
            return Err(RuntimeError::ImmutableType(self.type_name(tyv)));
        }
        // SAFETY: checked
        let dictv = unsafe { self.type_ref(tyv) }.dict;
        self.dict_set(dictv, name_v, value);
        // SAFETY: checked
        if unsafe { self.type_ref(tyv) }.is_heap() {
            let name = self.sym(name_v).to_owned();
            self.fixup_slots(tyv, &name);
        }
        self.notify_modified(tyv);
        Ok(())
    }

    pub fn type_del_attr(
        &mut self,
        tyv: Value,
        name_v: Value,
    ) -> Result<(), RuntimeError> {
        if !self.is_type(tyv) {
            return Err(RuntimeError::AttributeNotAssignable(
                self.sym(name_v).to_owned(),
            ));
        }
        if !self.is_type_mutable(tyv) {
            return Err(RuntimeError::ImmutableType(self.type_name(tyv)));
        }
        // SAFETY: checked
        let dictv = unsafe { self.type_ref(tyv) }.dict;
        // SAFETY: dict is always a dict object
        let removed =
            unsafe { dictv.as_tagged_unchecked::<Dict>().as_mut() }.remove(name_v);
        if removed.is_none() {
            return Err(RuntimeError::MissingAttribute(
                self.sym(name_v).to_owned(),
            ));
        }
        // SAFETY: checked
        if unsafe { self.type_ref(tyv) }.is_heap() {
            let name = self.sym(name_v).to_owned();
            self.fixup_slots(tyv, &name);
        }
        self.notify_modified(tyv);
        Ok(())
    }

    /// Re-derive the dispatch cells for one operation from the current
    /// attribute state. Writes into materialized tables only.
    pub(crate) fn fixup_slots(&mut self, tyv: Value, name: &str) {
        let Some(ids) = slot_defs(name) else {
            return;
        };
        let name_v = self.intern(name);
        let bits = self.mro_lookup(tyv, name_v).map(|v| v.raw()).unwrap_or(0);
        // SAFETY: callers verify tyv
        let ty = unsafe { self.type_mut(tyv) };
        for id in ids {
            ty.set_table_cell(*id, bits);
        }
    }

    fn fixup_all_slots(&mut self, tyv: Value) {
        for (name, _) in descriptor::SLOT_DEFS {
            self.fixup_slots(tyv, name);
        }
    }

    pub(crate) fn materialize_table(&mut self, tyv: Value, kind: TableKind) {
        // SAFETY: callers verify tyv
        let present = {
            let ty = unsafe { self.type_ref(tyv) };
            match kind {
                TableKind::Number => !ty.number.is_null(),
                TableKind::Sequence => !ty.sequence.is_null(),
                TableKind::Mapping => !ty.mapping.is_null(),
                TableKind::Protocol => !ty.protocol.is_null(),
            }
        };
        if present {
            return;
        }
        let layout =
            Layout::array::<u64>(table_size(kind)).expect("create valid layout");
        let raw = self.alloc_raw(layout).as_ptr();
        // SAFETY: callers verify tyv
        let ty = unsafe { self.type_mut(tyv) };
        match kind {
            TableKind::Number => ty.number = raw.cast::<NumberTable>(),
            TableKind::Sequence => ty.sequence = raw.cast::<SequenceTable>(),
            TableKind::Mapping => ty.mapping = raw.cast::<MappingTable>(),
            TableKind::Protocol => ty.protocol = raw.cast::<ProtocolTable>(),
        }
    }

    // ---- type creation --------------------------------------------------

    fn build_type_dict(&mut self, attrs: &[(&str, Value)]) -> Value {
        let dictv = self.allocate_dict(attrs.len() + DEFAULT_TYPE_ATTRS.len());
        for default in DEFAULT_TYPE_ATTRS {
            let name_v = self.intern(default);
            let empty = self.allocate_bytearray(b"");
            self.dict_set(dictv, name_v, empty);
        }
        for (name, value) in attrs {
            let name_v = self.intern(name);
            self.dict_set(dictv, name_v, *value);
        }
        dictv
    }

    fn finish_type(&mut self, tyv: Value, basev: Value) {
        let mut mro = vec![tyv];
        mro.extend(self.mro_of(basev));
        let mrov = self.allocate_array(&mro);
        let subsv = self.allocate_array(&[]);
        // SAFETY: freshly built descriptor
        let ty = unsafe { self.type_mut(tyv) };
        ty.mro = mrov;
        ty.subclasses = subsv;
        self.types.push(tyv);
        if !basev.is_null() {
            self.add_subclass(basev, tyv);
        }
        self.fixup_all_slots(tyv);
    }

    fn add_subclass(&mut self, basev: Value, tyv: Value) {
        // SAFETY: bases are descriptors
        let base = unsafe { self.type_ref(basev) };
        // SAFETY: subclasses is always an array
        let old =
            unsafe { base.subclasses.as_tagged_unchecked::<Array>().as_ref() };
        let mut items = old.fields().to_vec();
        items.push(tyv);
        let new = self.allocate_array(&items);
        // SAFETY: as above
        unsafe { self.type_mut(basev) }.subclasses = new;
    }

    /// Define a statically created, immutable builtin type.
    pub fn define_type(
        &mut self,
        name: &str,
        basev: Value,
        attrs: &[(&str, Value)],
    ) -> Value {
        let name_obj = self.allocate_bytearray(name.as_bytes());
        let dictv = self.build_type_dict(attrs);
        let flags = match self.revision {
            LayoutRevision::RevA => TypeFlags::READY,
            LayoutRevision::RevB => TypeFlags::READY | TypeFlags::IMMUTABLE,
        };
        let ptr = self
            .alloc_raw(Layout::new::<TypeDescriptor>())
            .cast::<TypeDescriptor>();
        // SAFETY: fresh allocation
        unsafe { (*ptr.as_ptr()).init(name_obj, dictv, basev, flags) };
        let tyv = Tagged::new_ptr(ptr.as_ptr()).as_value();

        // materialize only the sub-tables this type or its base populate
        let mut kinds: Vec<TableKind> = Vec::new();
        for (attr, _) in attrs {
            if let Some(ids) = slot_defs(attr) {
                for id in ids {
                    if !kinds.contains(&id.table) {
                        kinds.push(id.table);
                    }
                }
            }
        }
        if !basev.is_null() {
            // SAFETY: base is a descriptor
            let base = unsafe { self.type_ref(basev) };
            for (kind, present) in [
                (TableKind::Number, !base.number.is_null()),
                (TableKind::Sequence, !base.sequence.is_null()),
                (TableKind::Mapping, !base.mapping.is_null()),
                (TableKind::Protocol, !base.protocol.is_null()),
            ] {
                if present && !kinds.contains(&kind) {
                    kinds.push(kind);
                }
            }
        }
        for kind in kinds {
            self.materialize_table(tyv, kind);
        }
        self.finish_type(tyv, basev);
        log::trace!("defined static type '{name}'");
        tyv
    }

    /// Create a mutable heap-backed type with embedded sub-tables.
    pub fn new_heap_type(&mut self, name: &str, basev: Value) -> Value {
        let name_obj = self.allocate_bytearray(name.as_bytes());
        let dictv = self.build_type_dict(&[]);
        let ptr = self
            .alloc_raw(Layout::new::<HeapTypeDescriptor>())
            .cast::<HeapTypeDescriptor>();
        // SAFETY: fresh zeroed allocation
        unsafe { (*ptr.as_ptr()).init(name_obj, dictv, basev, TypeFlags::READY) };
        let tyv =
            Tagged::new_ptr(ptr.as_ptr().cast::<TypeDescriptor>()).as_value();
        self.finish_type(tyv, basev);
        log::trace!("created heap type '{name}'");
        tyv
    }

    // ---- calls and dispatch ---------------------------------------------

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn call_value(
        &mut self,
        funcv: Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        if self.heap_type_of(funcv) != Some(ObjectType::Function) {
            return Err(RuntimeError::NotCallable);
        }
        // SAFETY: checked
        let func = unsafe { funcv.as_tagged_unchecked::<Function>().as_ref() };
        let native = func.native;
        self.frames.push(Frame {
            function: funcv,
            args: args.to_vec(),
        });
        // SAFETY: natives live as long as the runtime
        let result = unsafe { ((*native).run)(self, args) };
        self.frames.pop();
        result
    }

    /// Operator dispatch: raw cells first (the fast path never consults the
    /// attribute table), generic attribute resolution as the fallback for
    /// operations without dispatch cells.
    pub fn operate(
        &mut self,
        name: &str,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let recv = args
            .first()
            .copied()
            .ok_or_else(|| RuntimeError::UnsupportedOperation(name.to_owned()))?;
        let tyv = self.type_of(recv);
        if let Some(ids) = slot_defs(name) {
            // SAFETY: type_of returns descriptors
            let ty = unsafe { self.type_ref(tyv) };
            for id in ids {
                let cell = ty.table_cell(*id);
                if cell != 0 {
                    return self.call_value(Value::from_raw(cell), args);
                }
            }
        }
        match self.type_attr(tyv, name) {
            Some(v) => self.call_value(v, args),
            None => Err(RuntimeError::UnsupportedOperation(name.to_owned())),
        }
    }

    pub fn binary(
        &mut self,
        name: &str,
        a: Value,
        b: Value,
    ) -> Result<Value, RuntimeError> {
        self.operate(name, &[a, b])
    }

    pub fn unary(&mut self, name: &str, a: Value) -> Result<Value, RuntimeError> {
        self.operate(name, &[a])
    }

    // ---- instance attribute protocol ------------------------------------

    fn instance_dict(&self, v: Value) -> Option<Value> {
        if self.heap_type_of(v) == Some(ObjectType::Instance) {
            // SAFETY: checked
            Some(unsafe { v.as_tagged_unchecked::<Instance>().as_ref() }.dict)
        } else {
            None
        }
    }

    pub fn get_attr(&mut self, v: Value, name: &str) -> Result<Value, RuntimeError> {
        let tyv = self.type_of(v);
        if let Some(attr) = self.type_attr(tyv, name) {
            if self.heap_type_of(attr) == Some(ObjectType::Property) {
                // SAFETY: checked
                let prop =
                    unsafe { attr.as_tagged_unchecked::<Property>().as_ref() };
                return match prop.getter() {
                    Some(get) => self.call_value(get, &[v]),
                    None => Err(RuntimeError::MissingAttribute(name.to_owned())),
                };
            }
            return Ok(attr);
        }
        if let Some(dictv) = self.instance_dict(v) {
            let name_v = self.intern(name);
            // SAFETY: instance dicts are dict objects
            if let Some(found) =
                unsafe { dictv.as_tagged_unchecked::<Dict>().as_ref() }
                    .lookup(name_v)
            {
                return Ok(found);
            }
        }
        Err(RuntimeError::MissingAttribute(name.to_owned()))
    }

    pub fn set_attr(
        &mut self,
        v: Value,
        name: &str,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let tyv = self.type_of(v);
        if let Some(attr) = self.type_attr(tyv, name)
            && self.heap_type_of(attr) == Some(ObjectType::Property)
        {
            // SAFETY: checked
            let prop = unsafe { attr.as_tagged_unchecked::<Property>().as_ref() };
            return match prop.setter() {
                Some(set) => self.call_value(set, &[v, value]).map(|_| ()),
                None => Err(RuntimeError::AttributeNotAssignable(name.to_owned())),
            };
        }
        if let Some(dictv) = self.instance_dict(v) {
            let name_v = self.intern(name);
            self.dict_set(dictv, name_v, value);
            return Ok(());
        }
        Err(RuntimeError::AttributeNotAssignable(name.to_owned()))
    }

    pub fn del_attr(&mut self, v: Value, name: &str) -> Result<(), RuntimeError> {
        let tyv = self.type_of(v);
        if let Some(attr) = self.type_attr(tyv, name)
            && self.heap_type_of(attr) == Some(ObjectType::Property)
        {
            // SAFETY: checked
            let prop = unsafe { attr.as_tagged_unchecked::<Property>().as_ref() };
            return match prop.deleter() {
                Some(del) => self.call_value(del, &[v]).map(|_| ()),
                None => Err(RuntimeError::AttributeNotAssignable(name.to_owned())),
            };
        }
        if let Some(dictv) = self.instance_dict(v) {
            let name_v = self.intern(name);
            // SAFETY: instance dicts are dict objects
            if unsafe { dictv.as_tagged_unchecked::<Dict>().as_mut() }
                .remove(name_v)
                .is_some()
            {
                return Ok(());
            }
        }
        Err(RuntimeError::MissingAttribute(name.to_owned()))
    }

    // ---- hook support ---------------------------------------------------

    pub(crate) fn function_marker(&self, v: Value) -> Option<HookMarker> {
        if self.heap_type_of(v) != Some(ObjectType::Function) {
            return None;
        }
        // SAFETY: checked
        unsafe { v.as_tagged_unchecked::<Function>().as_ref() }.marker()
    }

    /// The marker of a hooked value: a hooked function directly, or the
    /// first hooked accessor half of a property.
    pub(crate) fn value_marker(&self, v: Value) -> Option<HookMarker> {
        if let Some(marker) = self.function_marker(v) {
            return Some(marker);
        }
        if self.heap_type_of(v) == Some(ObjectType::Property) {
            // SAFETY: checked
            let prop = unsafe { v.as_tagged_unchecked::<Property>().as_ref() };
            for part in [prop.getter(), prop.setter(), prop.deleter()]
                .into_iter()
                .flatten()
            {
                if let Some(marker) = self.function_marker(part) {
                    return Some(marker);
                }
            }
        }
        None
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for native in self.natives.drain(..) {
            // SAFETY: created by Box::into_raw in allocate_function
            drop(unsafe { Box::from_raw(native.as_ptr()) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_dispatches_fixnum_add() {
        let mut rt = Runtime::new(RuntimeCreateInfo::default());
        let r = rt
            .binary("add", Value::from_fixnum(1), Value::from_fixnum(2))
            .unwrap();
        assert_eq!(r.as_fixnum(), Some(3));
    }

    #[test]
    fn fast_path_and_generic_path_agree() {
        let mut rt = Runtime::new(RuntimeCreateInfo::default());
        let a = rt.allocate_bytearray(b"ab");
        let b = rt.allocate_bytearray(b"cd");
        let joined = rt.binary("add", a, b).unwrap();
        // SAFETY: concat returns a bytearray
        let bytes = unsafe { joined.as_tagged_unchecked::<ByteArray>().as_ref() };
        assert_eq!(bytes.as_bytes(), b"abcd");

        // "str" has no dispatch cell anywhere, resolves through attributes
        let s = rt.unary("str", Value::from_fixnum(5)).unwrap();
        // SAFETY: repr returns a bytearray
        let bytes = unsafe { s.as_tagged_unchecked::<ByteArray>().as_ref() };
        assert_eq!(bytes.as_utf8().unwrap(), "5");
    }

    #[test]
    fn unsupported_operation_reports() {
        let mut rt = Runtime::new(RuntimeCreateInfo::default());
        let err = rt
            .binary("matmul", Value::from_fixnum(1), Value::from_fixnum(2))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnsupportedOperation(_)));
    }

    #[test]
    fn static_types_refuse_attribute_writes() {
        let mut rt = Runtime::new(RuntimeCreateInfo::default());
        let fixnum = rt.specials.fixnum_type;
        let name = rt.intern("add");
        let err = rt
            .type_set_attr(fixnum, name, Value::from_fixnum(1))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ImmutableType(_)));
    }

    #[test]
    fn heap_types_update_dispatch_on_attribute_writes() {
        let mut rt = Runtime::new(RuntimeCreateInfo::default());
        let base = rt.specials.object_type;
        let tyv = rt.new_heap_type("thing", base);
        let f = rt.allocate_function("thing_add", 2, false, |_, _| {
            Ok(Value::from_fixnum(77))
        });
        let name = rt.intern("add");
        rt.type_set_attr(tyv, name, f).unwrap();

        let obj = rt.new_instance(tyv);
        let r = rt.binary("add", obj, Value::from_fixnum(1)).unwrap();
        assert_eq!(r.as_fixnum(), Some(77));
    }

    #[test]
    fn subtypes_inherit_dispatch_cells_at_creation() {
        let mut rt = Runtime::new(RuntimeCreateInfo::default());
        let base = rt.new_heap_type("base", rt.specials.object_type);
        let f = rt.allocate_function("base_add", 2, false, |_, _| {
            Ok(Value::from_fixnum(5))
        });
        let name = rt.intern("add");
        rt.type_set_attr(base, name, f).unwrap();
        let sub = rt.new_heap_type("sub", base);
        let obj = rt.new_instance(sub);
        let r = rt.binary("add", obj, Value::from_fixnum(0)).unwrap();
        assert_eq!(r.as_fixnum(), Some(5));
    }

    #[test]
    fn lookup_cache_discarded_on_modification() {
        let mut rt = Runtime::new(RuntimeCreateInfo::default());
        let tyv = rt.new_heap_type("cached", rt.specials.object_type);
        // materialize the cache
        assert!(rt.type_attr(tyv, "repr").is_some());
        // SAFETY: tyv is a descriptor
        assert!(!unsafe { rt.type_ref(tyv) }.lookup_cache.is_null());
        let f = rt.allocate_function("x", 1, false, |_, _| Ok(Value::zero()));
        let name = rt.intern("x");
        rt.type_set_attr(tyv, name, f).unwrap();
        // SAFETY: tyv is a descriptor
        assert!(unsafe { rt.type_ref(tyv) }.lookup_cache.is_null());
    }

    #[test]
    fn instance_attrs_and_properties() {
        let mut rt = Runtime::new(RuntimeCreateInfo::default());
        let tyv = rt.new_heap_type("point", rt.specials.object_type);
        let obj = rt.new_instance(tyv);
        rt.set_attr(obj, "color", Value::from_fixnum(3)).unwrap();
        assert_eq!(rt.get_attr(obj, "color").unwrap(), Value::from_fixnum(3));

        // builtin property on fixnums
        let m = rt.get_attr(Value::from_fixnum(-4), "magnitude").unwrap();
        assert_eq!(m.as_fixnum(), Some(4));
    }
}
