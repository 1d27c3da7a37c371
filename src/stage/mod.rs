//! Plugin registry: the stages a build may enable and their fixed order.
//!
//! Stages are defined as data-producing units: each one turns the build
//! configuration into a list of [`FileOp`] placements, and an executor (the
//! pipeline) applies them. The registry, never the caller, decides
//! execution order, so two configurations naming the same stages in
//! different input order produce identical builds.

pub mod definitions;

use anyhow::Result;
use std::collections::HashSet;

use crate::config::BuildConfig;
use crate::error::BuildError;
use crate::resolver::{LibraryResolver, ModuleResolver};
use crate::tree::FileOp;

/// Everything a stage may consult while generating its operations.
pub struct StageContext<'a> {
    pub config: &'a BuildConfig,
    pub modules: &'a mut ModuleResolver,
    pub libraries: &'a LibraryResolver,
}

/// One ordered unit of the build pipeline.
pub trait Stage {
    /// Name callers use to enable the stage.
    fn name(&self) -> &'static str;

    /// Fixed position in build order. Lower runs earlier.
    fn order(&self) -> u8;

    /// Generate the filesystem mutations this stage contributes.
    fn ops(&self, ctx: &mut StageContext) -> Result<Vec<FileOp>>;
}

/// Every known stage, already in execution order.
fn registry() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(definitions::EarlyFirmwareStage),
        Box::new(definitions::BaseStage),
        Box::new(definitions::BusyboxStage),
        Box::new(definitions::BusyboxInitStage),
        Box::new(definitions::FirmwareStage),
        Box::new(definitions::FilesystemDriversStage),
        Box::new(definitions::KernelModulesStage),
        Box::new(definitions::MdevStage),
        Box::new(definitions::MdevRulesStage),
        Box::new(definitions::RootfsStage),
        Box::new(definitions::PivotStage),
        Box::new(definitions::CompressionMarkerStage),
    ]
}

/// Names of all registered stages, in execution order.
pub fn known_stage_names() -> Vec<&'static str> {
    registry().iter().map(|s| s.name()).collect()
}

/// Select the requested stages and return them in registry order.
///
/// Pure selection: no filesystem is touched. Unknown names fail with
/// [`BuildError::UnknownStage`]; input order is ignored in favor of the
/// registry's fixed order.
pub fn resolve_stages<S: AsRef<str>>(requested: &[S]) -> Result<Vec<Box<dyn Stage>>> {
    let all = registry();
    let known: HashSet<&str> = all.iter().map(|s| s.name()).collect();

    let mut wanted = HashSet::new();
    for name in requested {
        let name = name.as_ref();
        if !known.contains(name) {
            return Err(BuildError::UnknownStage(name.to_string()).into());
        }
        wanted.insert(name.to_string());
    }

    let mut selected: Vec<Box<dyn Stage>> = all
        .into_iter()
        .filter(|s| wanted.contains(s.name()))
        .collect();
    selected.sort_by_key(|s| s.order());
    Ok(selected)
}
