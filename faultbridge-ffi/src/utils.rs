// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Runs the body of an `fbr_` function and converts its outcome for C, prefixing errors with the
/// function's name. A panic becomes an error instead of unwinding into the caller.
pub(crate) fn ffi_call<T, R>(function: &'static str, body: impl FnOnce() -> anyhow::Result<T>) -> R
where
    R: From<anyhow::Result<T>>,
{
    let outcome = catch_unwind(AssertUnwindSafe(body))
        .unwrap_or_else(|payload| Err(anyhow::anyhow!("(panic) {}", panic_message(&*payload))));
    outcome.with_context(|| format!("{function} failed")).into()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unable to retrieve panic context")
}

/// Wraps the body of a C API function returning `Result<T>`. The function must be `#[named]`.
macro_rules! wrap_with_ffi_result {
    ($body:block) => {
        $crate::utils::ffi_call(function_name!(), || $body)
    };
}

/// Wraps the body of a C API function returning `VoidResult`. The function must be `#[named]`.
macro_rules! wrap_with_void_ffi_result {
    ($body:block) => {
        $crate::utils::ffi_call(function_name!(), || {
            $body;
            anyhow::Ok(())
        })
    };
}

pub(crate) use {wrap_with_ffi_result, wrap_with_void_ffi_result};

#[cfg(test)]
mod tests {
    use super::{wrap_with_ffi_result, wrap_with_void_ffi_result};
    use crate::{Result, VoidResult};
    use function_name::named;

    #[named]
    fn fails() -> VoidResult {
        wrap_with_void_ffi_result!({
            anyhow::ensure!(std::hint::black_box(false), "arithmetic");
        })
    }

    #[named]
    fn panics() -> Result<u32> {
        wrap_with_ffi_result!({
            if std::hint::black_box(true) {
                panic!("boom");
            }
            anyhow::Ok(1)
        })
    }

    #[test]
    fn errors_carry_the_function_name() {
        let VoidResult::Err(err) = fails() else {
            panic!("expected an error");
        };
        assert_eq!(err.as_ref(), "fails failed: arithmetic");
    }

    #[test]
    fn panics_become_errors() {
        let Result::Err(err) = panics() else {
            panic!("expected an error");
        };
        assert_eq!(err.as_ref(), "panics failed: (panic) boom");
    }
}
