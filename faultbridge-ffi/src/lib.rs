// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! C bindings for `faultbridge`. Functions are prefixed `fbr_`.

#[cfg(all(unix, feature = "collector"))]
mod collector;
mod error;
#[cfg(all(unix, feature = "receiver"))]
mod receiver;
mod result;
pub mod slice;
mod utils;

#[cfg(all(unix, feature = "collector"))]
pub use collector::*;
pub use error::*;
#[cfg(all(unix, feature = "receiver"))]
pub use receiver::*;
pub use result::*;
pub use slice::CharSlice;
