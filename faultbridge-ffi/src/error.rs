// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::slice::CharSlice;
use std::fmt::{Display, Formatter};
use std::mem::ManuallyDrop;

/// Please treat this as opaque; do not reach into it, and especially don't
/// write into it!
#[derive(Debug)]
#[repr(C)]
pub struct Error {
    /// This is a String taken apart into raw parts.
    ptr: *mut u8,
    len: usize,
    capacity: usize,
}

impl AsRef<str> for Error {
    fn as_ref(&self) -> &str {
        // Safety: the parts come from a String.
        unsafe { std::str::from_utf8_unchecked(std::slice::from_raw_parts(self.ptr, self.len)) }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl std::error::Error for Error {}

impl From<String> for Error {
    fn from(value: String) -> Self {
        let mut message = ManuallyDrop::new(value.into_bytes());
        Self {
            ptr: message.as_mut_ptr(),
            len: message.len(),
            capacity: message.capacity(),
        }
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self::from(format!("{value:#}"))
    }
}

impl Drop for Error {
    fn drop(&mut self) {
        // Safety: the parts come from a String and are only released here.
        drop(unsafe { Vec::from_raw_parts(self.ptr, self.len, self.capacity) });
    }
}

/// # Safety
/// Only pass null or a valid reference to a `fbr_Error`.
#[no_mangle]
pub unsafe extern "C" fn fbr_Error_drop(error: Option<&mut Error>) {
    if let Some(err) = error {
        // Leave an empty String in place to help with double-free issues.
        let mut tmp = Error::from(String::new());
        std::mem::swap(&mut tmp, err);
        drop(tmp)
    }
}

/// Returns a CharSlice of the error's message that is valid until the error
/// is dropped.
/// # Safety
/// Only pass null or a valid reference to a `fbr_Error`.
#[no_mangle]
pub unsafe extern "C" fn fbr_Error_message(error: Option<&Error>) -> CharSlice {
    match error {
        None => CharSlice::default(),
        Some(err) => CharSlice::from(err.as_ref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_survives_until_drop() {
        let mut err = Error::from(anyhow::anyhow!("inner").context("outer"));
        let message = unsafe { fbr_Error_message(Some(&err)) };
        assert_eq!(message.try_to_utf8().unwrap(), "outer: inner");
        unsafe { fbr_Error_drop(Some(&mut err)) };
        assert_eq!(err.as_ref(), "");
    }
}
