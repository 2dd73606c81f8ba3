// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::Error;

/// Outcome of an `fbr_` call that has nothing to return.
#[repr(C)]
#[must_use]
pub enum VoidResult {
    /// The value carries no meaning: every variant of a C tagged union needs a payload.
    Ok(bool),
    Err(Error),
}

impl VoidResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

impl From<anyhow::Result<()>> for VoidResult {
    fn from(value: anyhow::Result<()>) -> Self {
        value.map_or_else(|err| Self::Err(err.into()), |()| Self::Ok(true))
    }
}

/// Outcome of an `fbr_` call returning a `T`, such as the decision for a managed fault.
#[repr(C)]
#[must_use]
pub enum Result<T> {
    Ok(T),
    Err(Error),
}

impl<T> Result<T> {
    /// Converts into a Rust result, for callers of the C API written in Rust.
    pub fn into_std(self) -> std::result::Result<T, Error> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Err(err) => Err(err),
        }
    }
}

impl<T> From<anyhow::Result<T>> for Result<T> {
    fn from(value: anyhow::Result<T>) -> Self {
        value.map_or_else(|err| Self::Err(err.into()), Self::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert!(VoidResult::from(anyhow::Ok(())).is_ok());
        assert!(!VoidResult::from(Err(anyhow::anyhow!("no"))).is_ok());
        assert_eq!(Result::from(anyhow::Ok(7)).into_std().ok(), Some(7));
        let err = Result::<u8>::from(Err(anyhow::anyhow!("no"))).into_std();
        assert_eq!(err.map_err(|e| e.to_string()), Err("no".to_string()));
    }
}
