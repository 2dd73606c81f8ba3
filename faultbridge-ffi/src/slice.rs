// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::os::raw::c_char;
use std::str::Utf8Error;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct Slice<'a, T: 'a> {
    /// Should be non-null and suitably aligned for the underlying type. It is
    /// allowed but not recommended for the pointer to be null when the len is
    /// zero.
    ptr: *const T,

    /// The number of elements (not bytes) that `.ptr` points to. Must be less
    /// than or equal to [isize::MAX].
    len: usize,
    _marker: PhantomData<&'a [T]>,
}

/// Use to represent strings -- should be valid UTF-8.
pub type CharSlice<'a> = Slice<'a, c_char>;

impl<'a, T: 'a> Slice<'a, T> {
    /// # Safety
    /// `ptr` must be valid for reads of `len` elements for the lifetime `'a`, or `len` must be 0.
    pub const unsafe fn from_raw_parts(ptr: *const T, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    pub fn new(slice: &'a [T]) -> Self {
        Self {
            ptr: slice.as_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    pub fn as_slice(&self) -> &'a [T] {
        if self.ptr.is_null() || self.len == 0 {
            return &[];
        }
        // SAFETY: non-null with a length, which callers promise is valid for 'a.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl<'a, T: 'a> Default for Slice<'a, T> {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl<'a, T: Debug> Debug for Slice<'a, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_slice().fmt(f)
    }
}

impl<'a> CharSlice<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        let chars = self.as_slice();
        // SAFETY: c_char and u8 have the same size and alignment.
        unsafe { std::slice::from_raw_parts(chars.as_ptr().cast(), chars.len()) }
    }

    pub fn try_to_utf8(&self) -> Result<&'a str, Utf8Error> {
        std::str::from_utf8(self.as_bytes())
    }

    /// `None` for an empty slice.
    pub fn try_to_optional_string(&self) -> Result<Option<String>, Utf8Error> {
        let s = self.try_to_utf8()?;
        Ok((!s.is_empty()).then(|| s.to_string()))
    }
}

impl<'a> From<&'a str> for CharSlice<'a> {
    fn from(s: &'a str) -> Self {
        // SAFETY: a str is valid for reads of its length.
        unsafe { Self::from_raw_parts(s.as_ptr().cast(), s.len()) }
    }
}
