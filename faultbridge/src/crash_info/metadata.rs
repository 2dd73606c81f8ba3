// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Describes the library and host that installed the bridge. Serialised ahead of time and sent
/// verbatim with every report.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Metadata {
    pub library_name: String,
    pub library_version: String,
    pub family: String,
    /// Should include "service", "environment", etc
    pub tags: Vec<String>,
}

impl Metadata {
    pub fn new(
        library_name: String,
        library_version: String,
        family: String,
        tags: Vec<String>,
    ) -> Self {
        Self {
            library_name,
            library_version,
            family,
            tags,
        }
    }
}
