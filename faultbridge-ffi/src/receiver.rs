// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::utils::wrap_with_void_ffi_result;
use crate::{CharSlice, VoidResult};
use ::function_name::named;

#[no_mangle]
#[must_use]
#[named]
/// Receives reports from a bridge via a pipe on `stdin`, and writes each as a line of JSON to
/// the file named by `FAULTBRIDGE_WATCHER_OUTPUT`, or to stdout.
///
/// At a high-level, this exists because doing anything in a signal handler is dangerous, so the
/// handler hands a raw descriptor to a watcher process that does the rest.
/// # Safety
/// No safety concerns
pub unsafe extern "C" fn fbr_receiver_entry_point_stdin() -> VoidResult {
    wrap_with_void_ffi_result!({ faultbridge::receiver_entry_point_stdin()? })
}

#[no_mangle]
#[must_use]
#[named]
/// As `fbr_receiver_entry_point_stdin`, but serves the first bridge that connects to
/// `socket_path`. On Linux, a path that does not start with `.` or `/` is an abstract socket.
/// # Safety
/// `socket_path` must be a valid slice.
pub unsafe extern "C" fn fbr_receiver_entry_point_unix_socket(
    socket_path: CharSlice,
) -> VoidResult {
    wrap_with_void_ffi_result!({
        faultbridge::receiver_entry_point_unix_socket(socket_path.try_to_utf8()?)?
    })
}
