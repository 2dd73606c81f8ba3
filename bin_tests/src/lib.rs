// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers for tests that need a real process to die.
//!
//! A fault bridge is only observable from outside the faulting process: its exit status, the
//! report it left behind, and what the watcher wrote. [`build_artifacts`] asks cargo for the
//! binaries a test needs and locates them next to the running test executable. Builds are cached
//! for the lifetime of the test process.

use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    process,
    sync::Mutex,
};

use anyhow::Context;
use once_cell::sync::{Lazy, OnceCell};

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ArtifactType {
    ExecutablePackage,
    Bin,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum BuildProfile {
    Debug,
    Release,
}

impl BuildProfile {
    fn target_subdir(self) -> &'static str {
        match self {
            BuildProfile::Debug => "debug",
            BuildProfile::Release => "release",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct ArtifactsBuild {
    pub name: String,
    pub artifact_type: ArtifactType,
    pub build_profile: BuildProfile,
}

/// The `target` directory cargo builds into, found by walking up from the test executable.
/// Assumes the executable has not been moved out of it.
fn target_dir() -> &'static Path {
    static TARGET_DIR: OnceCell<PathBuf> = OnceCell::new();
    TARGET_DIR.get_or_init(|| {
        let exe = PathBuf::from(env::args().next().unwrap_or_default());
        exe.ancestors()
            .find(|p| p.file_name().is_some_and(|name| name == "target"))
            .map(Path::to_path_buf)
            .unwrap_or_default()
    })
}

fn cargo_build(artifact: &ArtifactsBuild) -> anyhow::Result<PathBuf> {
    let mut cmd = process::Command::new(env!("CARGO"));
    cmd.arg("build");
    if artifact.build_profile == BuildProfile::Release {
        cmd.arg("--release");
    }
    cmd.arg(match artifact.artifact_type {
        ArtifactType::ExecutablePackage => "-p",
        ArtifactType::Bin => "--bin",
    });
    cmd.arg(&artifact.name);

    let output = cmd.output().context("Failed to run cargo")?;
    anyhow::ensure!(
        output.status.success(),
        "Cargo build of {} failed: status code {:?}\nstderr:\n {}",
        artifact.name,
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(target_dir()
        .join(artifact.build_profile.target_subdir())
        .join(&artifact.name))
}

/// Builds the requested artifacts, at most once per test process, and returns their paths.
/// Only call this from cargo tests.
pub fn build_artifacts<'b>(
    artifacts: &[&'b ArtifactsBuild],
) -> anyhow::Result<HashMap<&'b ArtifactsBuild, PathBuf>> {
    static BUILT: Lazy<Mutex<HashMap<ArtifactsBuild, PathBuf>>> = Lazy::new(Default::default);

    let mut built = BUILT
        .lock()
        .map_err(|_| anyhow::anyhow!("artifact cache poisoned"))?;
    artifacts
        .iter()
        .map(|&artifact| {
            let path = match built.get(artifact) {
                Some(path) => path.clone(),
                None => {
                    let path = cargo_build(artifact)?;
                    built.insert(artifact.clone(), path.clone());
                    path
                }
            };
            Ok::<_, anyhow::Error>((artifact, path))
        })
        .collect()
}

/// Reads a file of JSON documents, one per line, as written by the watcher.
pub fn read_json_lines(path: impl AsRef<Path>) -> anyhow::Result<Vec<serde_json::Value>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    contents
        .lines()
        .map(|line| serde_json::from_str(line).with_context(|| format!("Bad line {line}")))
        .collect()
}

/// Prints how long `$op` took.
#[macro_export]
macro_rules! timeit {
    ($op_name:literal, $op:block) => {{
        let start = std::time::Instant::now();
        let res = $op;
        println!(
            concat!($op_name, " took {} ms"),
            start.elapsed().as_secs_f64() * 1000.0
        );
        res
    }};
}
