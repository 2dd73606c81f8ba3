// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(unix)]

mod entry_points;
pub use entry_points::{
    async_receiver_entry_point_unix_listener, async_receiver_entry_point_unix_socket,
    get_receiver_unix_socket, receiver_entry_point_stdin, receiver_entry_point_unix_socket,
    ReportOutput,
};
mod receive_report;
