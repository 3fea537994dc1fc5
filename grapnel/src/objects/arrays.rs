use std::{alloc::Layout, ptr};

use crate::{Header, HeaderFlags, HeapObject, Object, ObjectType, Tagged, Value};

#[repr(C)]
#[derive(Debug)]
pub struct Array {
    pub header: Header,
    pub size: Tagged<usize>,
    pub fields: [Value; 0],
}

impl Array {
    /// initialize array with data
    pub fn init_with_data(&mut self, data: &[Value]) {
        // SAFETY: allocation contract checked by the caller
        unsafe { self.init(data.len()) };
        // SAFETY: allocated with correct size
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.fields.as_mut_ptr(),
                data.len(),
            )
        };
    }

    /// Initialize an array
    /// # Safety
    /// must get initialized and allocated with correct size
    pub unsafe fn init(&mut self, size: usize) {
        self.header =
            Header::encode_object(ObjectType::Array, HeaderFlags::empty(), 0);
        self.size = size.into();
    }

    #[inline]
    fn fields_ptr(&self) -> *const Value {
        self.fields.as_ptr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size.into()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[inline]
    pub fn fields(&self) -> &[Value] {
        let len = self.size();
        // SAFETY: array must be correctly sized
        unsafe { std::slice::from_raw_parts(self.fields_ptr(), len) }
    }

    #[inline]
    pub fn fields_mut(&mut self) -> &mut [Value] {
        let len = self.size();
        // SAFETY: array must be correctly sized
        unsafe { std::slice::from_raw_parts_mut(self.fields.as_mut_ptr(), len) }
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<Value> {
        if index < self.size() {
            // SAFETY: checked
            Some(unsafe { self.fields_ptr().add(index).read() })
        } else {
            None
        }
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: Value) -> bool {
        if index < self.size() {
            // SAFETY: checked
            unsafe { self.fields.as_mut_ptr().add(index).write(value) };
            true
        } else {
            false
        }
    }

    /// calculate the layout of an array with n fields
    pub fn required_layout(size: usize) -> Layout {
        let head = Layout::new::<Array>();
        let fields = Layout::array::<Value>(size).expect("create valid layout");
        let (layout, _) = head.extend(fields).expect("create valid layout");
        layout.pad_to_align()
    }
}

impl Object for Array {}
impl HeapObject for Array {}
