// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod descriptor;
mod fault_kind;
mod metadata;
mod report;

pub use descriptor::*;
pub use fault_kind::*;
pub use metadata::*;
pub use report::*;
