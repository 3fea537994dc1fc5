use core::str;
use std::{alloc::Layout, mem, ptr};

use crate::{Header, HeaderFlags, HeapObject, Object, ObjectType, Tagged};

#[repr(C)]
#[derive(Debug)]
pub struct ByteArray {
    pub header: Header,
    pub size: Tagged<usize>,
    pub data: [u8; 0],
}

impl ByteArray {
    /// Initialize ByteArray with correct header and size
    /// # Safety
    /// this sets metadata, should only be called internally
    /// memory allocation must be at least size
    pub unsafe fn init(&mut self, size: usize) {
        self.header =
            Header::encode_object(ObjectType::ByteArray, HeaderFlags::empty(), 0);
        self.size = size.into();
    }

    /// Initialize ByteArray with correct header, size and data
    /// # Safety
    /// this sets metadata, should only be called internally
    /// data must be same size as allocated
    pub unsafe fn init_data(&mut self, data: &[u8]) {
        // SAFETY: same contract as above
        unsafe { self.init(data.len()) };
        let own_data = self.data.as_mut_ptr();
        // SAFETY: allocated with correct size
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), own_data, data.len()) };
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size.into()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.size();
        // SAFETY: bytearray must be correctly sized
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), len) }
    }

    /// convert bytearray to utf8
    pub fn as_utf8(&self) -> Result<&str, str::Utf8Error> {
        str::from_utf8(self.as_bytes())
    }

    /// calculate the layout of a bytearray holding n bytes
    pub fn required_layout(size: usize) -> Layout {
        let head = Layout::new::<ByteArray>();
        let data = Layout::array::<u8>(size).expect("create valid layout");
        let (layout, _) = head.extend(data).expect("create valid layout");
        layout.pad_to_align()
    }
}

impl Object for ByteArray {}
impl HeapObject for ByteArray {}

const _: () = assert!(mem::offset_of!(ByteArray, header) == 0);
