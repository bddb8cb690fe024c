//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Transition planning.
//!
//! A [`pkgplan::PkgPlan`] describes what happens to one package; an
//! [`imageplan::ImagePlan`] aggregates them, resolves cross-package
//! interactions and drives execution inside a boot-environment
//! bracket. Both are strict state machines: calling a phase out of
//! order is an error, never a silent no-op.

pub mod imageplan;
pub mod pkgplan;

pub use imageplan::ImagePlan;
pub use pkgplan::PkgPlan;

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlanError>;

/// Lifecycle of a package plan. Phases advance strictly left to
/// right; a failure parks the plan in one of the terminal failure
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PkgPlanState {
    Created,
    Proposed,
    Evaluated,
    Preexecuted,
    Executed,
    Postexecuted,
    EvaluationFailed,
    ExecutionFailed,
}

#[derive(Debug, Error, Diagnostic)]
pub enum PlanError {
    #[error("cannot {operation} a plan in state {found}, expected {expected}")]
    #[diagnostic(
        code(pkg::plan_error::invalid_state),
        help("Plan phases run in order: propose, evaluate, preexecute, execute, postexecute")
    )]
    InvalidState {
        operation: &'static str,
        expected: PkgPlanState,
        found: PkgPlanState,
    },

    #[error("{fmri} is still required by: {}", .dependents.join(", "))]
    #[diagnostic(
        code(pkg::plan_error::non_leaf_package),
        help("Remove or update the dependent packages first")
    )]
    NonLeafPackage {
        fmri: String,
        dependents: Vec<String>,
    },

    #[error("action {key} of {stem} failed")]
    #[diagnostic(code(pkg::plan_error::action_failed))]
    ActionFailed {
        key: String,
        stem: String,
        #[source]
        source: crate::actions::executors::InstallerError,
    },

    #[error("operation canceled")]
    #[diagnostic(code(pkg::plan_error::canceled))]
    Canceled,

    #[error("boot environment operation failed: {0}")]
    #[diagnostic(code(pkg::plan_error::boot_environment))]
    BootEnvironmentFailed(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] crate::manifest::ManifestError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Image(#[from] crate::image::ImageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Installed(#[from] crate::image::installed::InstalledError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] crate::transport::TransportError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Constraint(#[from] crate::constraint::ConstraintError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Filter(#[from] crate::filter::FilterError),
}

/// Snapshot bracket around plan execution.
///
/// `snapshot` runs before the first mutation, `activate` after the
/// last successful one, `restore` when anything in between failed.
pub trait BootEnvironment {
    fn snapshot(&mut self) -> Result<()>;
    fn restore(&mut self) -> Result<()>;
    fn activate(&mut self) -> Result<()>;
}

/// For images without snapshot support, and for tests.
#[derive(Debug, Default)]
pub struct NullBootEnvironment;

impl BootEnvironment for NullBootEnvironment {
    fn snapshot(&mut self) -> Result<()> {
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        Ok(())
    }
}
