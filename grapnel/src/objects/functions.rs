use crate::{
    Header, HeaderFlags, HeapObject, Object, ObjectType, Runtime, RuntimeError,
    Tagged, Value,
};

/// Boxed native implementation backing a `Function` object. The runtime owns
/// these for its whole lifetime; `Function` objects keep thin pointers in.
pub struct Native {
    pub run: Box<dyn Fn(&mut Runtime, &[Value]) -> Result<Value, RuntimeError>>,
}

/// Which accessor half a hook replaces.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessorPart {
    None = 0,
    Get = 1,
    Set = 2,
    Del = 3,
}

/// Hidden per-installation marker carried by a replacement function: the
/// operation it is bound to and the exact value it superseded.
#[derive(Debug, Copy, Clone)]
pub struct HookMarker {
    pub name: Value,
    pub orig: Option<Value>,
    pub part: AccessorPart,
}

#[repr(C)]
#[derive(Debug)]
pub struct Function {
    pub header: Header,
    /// interned bytearray, null for anonymous functions
    pub name: Value,
    /// fixed positional parameter count
    pub params: Tagged<usize>,
    pub native: *const Native,
    /// interned operation name, null unless this function is a hook
    pub hook_name: Value,
    /// value superseded by this hook, meaningful only with ORIG_PRESENT
    pub hook_orig: Value,
}

impl Function {
    pub const FLAG_VARIADIC: u32 = 1 << 0;
    pub const FLAG_HOOK: u32 = 1 << 1;
    pub const FLAG_ORIG_PRESENT: u32 = 1 << 2;
    pub const PART_SHIFT: u32 = 3;
    pub const PART_MASK: u32 = 0b11 << Self::PART_SHIFT;

    /// Initialize a function object
    /// # Safety
    /// `native` must stay alive for the function's whole lifetime
    pub unsafe fn init(
        &mut self,
        name: Value,
        params: usize,
        variadic: bool,
        native: *const Native,
    ) {
        let data = if variadic { Self::FLAG_VARIADIC } else { 0 };
        self.header =
            Header::encode_object(ObjectType::Function, HeaderFlags::empty(), data);
        self.name = name;
        self.params = params.into();
        self.native = native;
        self.hook_name = Value::zero();
        self.hook_orig = Value::zero();
    }

    /// Attach a hook marker.
    /// # Safety
    /// should only be called by the patch engine right after `init`
    pub unsafe fn set_marker(
        &mut self,
        name: Value,
        orig: Option<Value>,
        part: AccessorPart,
    ) {
        let mut data = self.header.data() | Self::FLAG_HOOK;
        data = (data & !Self::PART_MASK) | ((part as u32) << Self::PART_SHIFT);
        self.hook_name = name;
        match orig {
            Some(value) => {
                data |= Self::FLAG_ORIG_PRESENT;
                self.hook_orig = value;
            }
            None => self.hook_orig = Value::zero(),
        }
        self.header.set_data(data);
    }

    #[inline]
    pub fn params(&self) -> usize {
        self.params.into()
    }

    #[inline]
    pub fn is_variadic(&self) -> bool {
        self.header.data() & Self::FLAG_VARIADIC != 0
    }

    #[inline]
    pub fn is_hook(&self) -> bool {
        self.header.data() & Self::FLAG_HOOK != 0
    }

    pub fn marker(&self) -> Option<HookMarker> {
        if !self.is_hook() {
            return None;
        }
        let data = self.header.data();
        let orig = if data & Self::FLAG_ORIG_PRESENT != 0 {
            Some(self.hook_orig)
        } else {
            None
        };
        let part = match (data & Self::PART_MASK) >> Self::PART_SHIFT {
            1 => AccessorPart::Get,
            2 => AccessorPart::Set,
            3 => AccessorPart::Del,
            _ => AccessorPart::None,
        };
        Some(HookMarker {
            name: self.hook_name,
            orig,
            part,
        })
    }
}

impl Object for Function {}
impl HeapObject for Function {}

/// Getter/setter/deleter accessor triple; null parts are absent.
#[repr(C)]
#[derive(Debug)]
pub struct Property {
    pub header: Header,
    pub get: Value,
    pub set: Value,
    pub del: Value,
}

impl Property {
    /// Initialize a property object
    pub fn init(&mut self, get: Value, set: Value, del: Value) {
        self.header =
            Header::encode_object(ObjectType::Property, HeaderFlags::empty(), 0);
        self.get = get;
        self.set = set;
        self.del = del;
    }

    #[inline]
    pub fn getter(&self) -> Option<Value> {
        (!self.get.is_null()).then_some(self.get)
    }

    #[inline]
    pub fn setter(&self) -> Option<Value> {
        (!self.set.is_null()).then_some(self.set)
    }

    #[inline]
    pub fn deleter(&self) -> Option<Value> {
        (!self.del.is_null()).then_some(self.del)
    }
}

impl Object for Property {}
impl HeapObject for Property {}

/// A value of a user-defined type: just enough state for dispatch and
/// per-instance attributes.
#[repr(C)]
#[derive(Debug)]
pub struct Instance {
    pub header: Header,
    pub ty: Value,
    pub dict: Value,
}

impl Instance {
    pub fn init(&mut self, ty: Value, dict: Value) {
        self.header =
            Header::encode_object(ObjectType::Instance, HeaderFlags::empty(), 0);
        self.ty = ty;
        self.dict = dict;
    }
}

impl Object for Instance {}
impl HeapObject for Instance {}
