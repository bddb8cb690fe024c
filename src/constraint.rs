// This Source Code Form is subject to the terms of
// the Mozilla Public License, v. 2.0. If a copy of the
// MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Version constraint engine
//!
//! Dependencies and incorporations both reduce to [`Constraint`]
//! values: a package name, a version window and a presence
//! requirement, tagged with the name of the package that imposed
//! them. Constraints from several sources are merged with
//! [`Constraint::combine`]; the merged constraint is then asked what
//! (if anything) has to happen to an installed package with
//! [`Constraint::check_for_work`].
//!
//! [`ConstraintSet`] holds the constraints of everything installed or
//! proposed in an image. Because an incorporation at a new version
//! typically constrains the same packages differently, the set
//! supports reloading a source package wholesale: starting to load a
//! new version of a package first retracts every constraint the old
//! version had contributed.

use crate::fmri::{Fmri, SuccessorMode, Version};
use miette::Diagnostic;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

pub type Result<T> = std::result::Result<T, ConstraintError>;

/// Errors raised when constraints cannot be reconciled.
///
/// A conflict is never conflated with "nothing to do"; callers that
/// want the latter look at the `Ok(None)` arm of
/// [`Constraint::check_for_work`].
#[derive(Debug, Error, Diagnostic, PartialEq)]
pub enum ConstraintError {
    #[error("{new} conflicts with {old}: one requires the package, the other forbids it")]
    #[diagnostic(
        code(pkg::constraint_error::presence_conflict),
        help("A required dependency and an exclude dependency name the same package; one of the depending packages must be removed")
    )]
    PresenceConflict { old: Constraint, new: Constraint },

    #[error("{new} conflicts with {old}: no version satisfies both")]
    #[diagnostic(
        code(pkg::constraint_error::version_conflict),
        help("The version windows of two constraints on the same package do not overlap")
    )]
    VersionConflict { old: Constraint, new: Constraint },

    #[error("pkg:/{name}@{proposed} is excluded or outside the allowed window of {constraint}")]
    #[diagnostic(
        code(pkg::constraint_error::fmri_conflict),
        help("The proposed package version is not accepted by the active constraints; try a version inside the constraint window")
    )]
    FmriConflict {
        name: String,
        proposed: Version,
        constraint: Constraint,
    },

    #[error("installed pkg:/{name}@{installed} is newer than allowed by {constraint}")]
    #[diagnostic(
        code(pkg::constraint_error::downgrade_conflict),
        help("Satisfying this constraint would require downgrading an installed package, which the planner refuses to do implicitly")
    )]
    DowngradeConflict {
        name: String,
        installed: Version,
        constraint: Constraint,
    },

    #[error("constraint loading for {loading} is already active, cannot start {requested}")]
    #[diagnostic(
        code(pkg::constraint_error::load_in_progress),
        help("finish_loading must be called before constraints from another package can be loaded")
    )]
    LoadInProgress { loading: String, requested: String },

    #[error("installed pkg:/{name}@{installed} is forbidden by {constraint}")]
    #[diagnostic(
        code(pkg::constraint_error::excluded_package_installed),
        help("An exclude dependency names a package that is currently installed; the installed package must be removed first")
    )]
    ExcludedPackageInstalled {
        name: String,
        installed: Version,
        constraint: Constraint,
    },

    #[error("{0} is not the package whose constraints are being loaded")]
    #[diagnostic(code(pkg::constraint_error::wrong_source))]
    WrongSource(String),
}

/// Presence requirement of a constraint.
///
/// The numeric order matters: combining two constraints takes the
/// stronger (larger) presence, except that `Always` and `Never`
/// cannot be reconciled at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Presence {
    /// Unset / poisoned; never produced by the constructors.
    Error,
    /// The package must be installed (require dependency).
    Always,
    /// If installed, the version window applies (optional dependency,
    /// incorporation).
    Maybe,
    /// The package must not be installed (exclude dependency).
    Never,
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Presence::Error => "error",
            Presence::Always => "required",
            Presence::Maybe => "optional",
            Presence::Never => "excluded",
        };
        write!(f, "{}", s)
    }
}

/// A version window plus presence requirement on a single package,
/// tagged with the package that imposed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub pkg_name: String,
    pub min_ver: Version,
    pub max_ver: Option<Version>,
    pub presence: Presence,
    pub source_name: String,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pkg:/{}@{} ({} by pkg:/{})",
            self.pkg_name, self.min_ver, self.presence, self.source_name
        )?;
        if let Some(max) = &self.max_ver {
            write!(f, " up to @{}", max)?;
        }
        Ok(())
    }
}

impl Constraint {
    /// A require dependency: the package must be present at
    /// `fmri.version` or a successor.
    pub fn required(fmri: &Fmri, min_ver: Version, source_name: &str) -> Constraint {
        Constraint {
            pkg_name: fmri.stem().to_string(),
            min_ver,
            max_ver: None,
            presence: Presence::Always,
            source_name: source_name.to_string(),
        }
    }

    /// An optional dependency: same window as a require dependency,
    /// but absence is fine.
    pub fn optional(fmri: &Fmri, min_ver: Version, source_name: &str) -> Constraint {
        Constraint {
            pkg_name: fmri.stem().to_string(),
            min_ver,
            max_ver: None,
            presence: Presence::Maybe,
            source_name: source_name.to_string(),
        }
    }

    /// An incorporate dependency: if present, the package is pinned
    /// to `version` and its branded successors.
    pub fn incorporated(fmri: &Fmri, version: Version, source_name: &str) -> Constraint {
        Constraint {
            pkg_name: fmri.stem().to_string(),
            min_ver: version.clone(),
            max_ver: Some(version),
            presence: Presence::Maybe,
            source_name: source_name.to_string(),
        }
    }

    /// An exclude dependency: the package must not be present.
    pub fn excluded(fmri: &Fmri, min_ver: Version, source_name: &str) -> Constraint {
        Constraint {
            pkg_name: fmri.stem().to_string(),
            min_ver,
            max_ver: None,
            presence: Presence::Never,
            source_name: source_name.to_string(),
        }
    }

    fn combined_presence(&self, other: &Constraint) -> Option<Presence> {
        use Presence::*;
        match (
            self.presence.min(other.presence),
            self.presence.max(other.presence),
        ) {
            (Always, Always) => Some(Always),
            (Always, Maybe) => Some(Always),
            (Always, Never) => None,
            (Maybe, Maybe) => Some(Maybe),
            (Maybe, Never) => Some(Never),
            (Never, Never) => Some(Never),
            _ => None,
        }
    }

    /// Merge this constraint with another on the same package.
    ///
    /// The result demands the stronger presence, the larger minimum
    /// and the smaller maximum. An empty resulting window (a minimum
    /// that is not even a branded successor of the maximum) is a
    /// version conflict. Combination is commutative in effect and
    /// idempotent: `c.combine(&c)` yields `c` back.
    pub fn combine(&self, proposed: &Constraint) -> Result<Constraint> {
        let presence =
            self.combined_presence(proposed)
                .ok_or_else(|| ConstraintError::PresenceConflict {
                    old: self.clone(),
                    new: proposed.clone(),
                })?;

        let min_ver = self.min_ver.clone().max(proposed.min_ver.clone());
        let max_ver = match (&self.max_ver, &proposed.max_ver) {
            (None, None) => None,
            (Some(m), None) | (None, Some(m)) => Some(m.clone()),
            (Some(a), Some(b)) => Some(a.clone().min(b.clone())),
        };

        if let Some(max) = &max_ver {
            if min_ver > *max && !min_ver.is_successor(max, SuccessorMode::Auto) {
                return Err(ConstraintError::VersionConflict {
                    old: self.clone(),
                    new: proposed.clone(),
                });
            }
        }

        // The source of the stricter window wins the attribution so
        // diagnostics point at a real package.
        let source_name = if min_ver == proposed.min_ver {
            proposed.source_name.clone()
        } else {
            self.source_name.clone()
        };

        Ok(Constraint {
            pkg_name: self.pkg_name.clone(),
            min_ver,
            max_ver,
            presence,
            source_name,
        })
    }

    /// Decide what has to happen to satisfy this constraint, given
    /// the currently installed version of the package (if any).
    ///
    /// Returns `Ok(Some(version))` when the package must be brought
    /// to `version`, `Ok(None)` when nothing needs to change, and an
    /// error when the installed state and the constraint cannot
    /// coexist.
    pub fn check_for_work(&self, installed: Option<&Fmri>) -> Result<Option<Version>> {
        let installed_version = installed.and_then(|f| f.version.as_ref());

        let installed_version = match installed_version {
            None => {
                return match self.presence {
                    Presence::Always => Ok(Some(self.min_ver.clone())),
                    _ => Ok(None),
                };
            }
            Some(v) => v,
        };

        if self.presence == Presence::Never {
            return Err(ConstraintError::ExcludedPackageInstalled {
                name: self.pkg_name.clone(),
                installed: installed_version.clone(),
                constraint: self.clone(),
            });
        }

        if *installed_version < self.min_ver {
            return Ok(Some(self.min_ver.clone()));
        }

        if let Some(max) = &self.max_ver {
            if *installed_version > *max
                && !installed_version.is_successor(max, SuccessorMode::Auto)
            {
                return Err(ConstraintError::DowngradeConflict {
                    name: self.pkg_name.clone(),
                    installed: installed_version.clone(),
                    constraint: self.clone(),
                });
            }
        }

        Ok(None)
    }
}

/// All constraints active in an image, indexed by constrained
/// package, plus the bookkeeping needed to reload a source package.
#[derive(Debug, Default)]
pub struct ConstraintSet {
    constraints: HashMap<String, Vec<Constraint>>,
    /// source stem -> (version whose constraints are loaded, packages
    /// that version constrained)
    loaded: HashMap<String, (Option<Version>, Vec<String>)>,
    active_source: Option<Fmri>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        ConstraintSet::default()
    }

    /// Begin loading the constraints contributed by `fmri`.
    ///
    /// Returns `Ok(false)` (and records nothing) when exactly this
    /// version was already loaded. When a different version of the
    /// same package was loaded before, all constraints it contributed
    /// are retracted first. Only one load may be active at a time.
    pub fn start_loading(&mut self, fmri: &Fmri) -> Result<bool> {
        if let Some(active) = &self.active_source {
            return Err(ConstraintError::LoadInProgress {
                loading: active.stem().to_string(),
                requested: fmri.stem().to_string(),
            });
        }

        let stem = fmri.stem().to_string();
        if let Some((loaded_version, touched)) = self.loaded.get(&stem) {
            if *loaded_version == fmri.version {
                return Ok(false);
            }
            debug!(source = %stem, "retracting constraints for reloaded package");
            let touched = touched.clone();
            for pkg_name in touched {
                if let Some(list) = self.constraints.get_mut(&pkg_name) {
                    list.retain(|c| c.source_name != stem);
                    if list.is_empty() {
                        self.constraints.remove(&pkg_name);
                    }
                }
            }
            self.loaded.remove(&stem);
        }

        self.active_source = Some(fmri.clone());
        Ok(true)
    }

    /// Record one constraint contributed by the package currently
    /// being loaded.
    ///
    /// Require dependencies are checked for consistency but not
    /// recorded; they do not constrain future versions the way
    /// windows do, and keeping them out of the set keeps retraction
    /// cheap.
    pub fn update_constraints(&mut self, constraint: &Constraint) -> Result<()> {
        let active = match &self.active_source {
            Some(f) => f,
            None => return Err(ConstraintError::WrongSource(constraint.source_name.clone())),
        };
        if constraint.source_name != active.stem() {
            return Err(ConstraintError::WrongSource(constraint.source_name.clone()));
        }

        // Surface conflicts with what is already loaded immediately.
        self.resolve(constraint)?;

        if constraint.presence == Presence::Always {
            return Ok(());
        }

        self.constraints
            .entry(constraint.pkg_name.clone())
            .or_default()
            .push(constraint.clone());

        let stem = active.stem().to_string();
        let version = active.version.clone();
        let entry = self
            .loaded
            .entry(stem)
            .or_insert_with(|| (version, Vec::new()));
        if !entry.1.contains(&constraint.pkg_name) {
            entry.1.push(constraint.pkg_name.clone());
        }
        Ok(())
    }

    /// Declare the load started with [`ConstraintSet::start_loading`]
    /// complete.
    pub fn finish_loading(&mut self, fmri: &Fmri) -> Result<()> {
        match &self.active_source {
            Some(active) if active == fmri => {
                // Packages that contributed no recorded constraint
                // still need a loaded entry so a reload of the same
                // version short-circuits.
                self.loaded
                    .entry(fmri.stem().to_string())
                    .or_insert_with(|| (fmri.version.clone(), Vec::new()));
                self.active_source = None;
                Ok(())
            }
            _ => Err(ConstraintError::WrongSource(fmri.stem().to_string())),
        }
    }

    fn fold_existing(&self, pkg_name: &str) -> Result<Option<Constraint>> {
        let list = match self.constraints.get(pkg_name) {
            Some(list) if !list.is_empty() => list,
            _ => return Ok(None),
        };
        let mut acc = list[0].clone();
        for c in &list[1..] {
            acc = acc.combine(c)?;
        }
        Ok(Some(acc))
    }

    /// Combine `constraint` with everything already recorded for the
    /// same package, returning the effective merged constraint.
    pub fn apply_constraints(&self, constraint: &Constraint) -> Result<Constraint> {
        self.resolve(constraint)
    }

    fn resolve(&self, constraint: &Constraint) -> Result<Constraint> {
        match self.fold_existing(&constraint.pkg_name)? {
            Some(existing) => existing.combine(constraint),
            None => Ok(constraint.clone()),
        }
    }

    /// Treat `fmri` as a minimum requirement and return the FMRI the
    /// active constraints actually allow, which may carry a higher
    /// (or pinned) version. Conflicts are reported against the FMRI.
    pub fn apply_constraints_to_fmri(&self, fmri: &Fmri) -> Result<Fmri> {
        let version = match &fmri.version {
            Some(v) => v.clone(),
            None => {
                // Versionless proposals take whatever the set pins,
                // or stay unversioned.
                return match self.fold_existing(fmri.stem())? {
                    Some(c) => Ok(fmri.replace_version(c.min_ver)),
                    None => Ok(fmri.clone()),
                };
            }
        };

        let proposal = Constraint::required(fmri, version.clone(), fmri.stem());
        match self.resolve(&proposal) {
            Ok(merged) => Ok(fmri.replace_version(merged.min_ver)),
            Err(ConstraintError::VersionConflict { old, .. })
            | Err(ConstraintError::PresenceConflict { old, .. }) => {
                Err(ConstraintError::FmriConflict {
                    name: fmri.stem().to_string(),
                    proposed: version,
                    constraint: old,
                })
            }
            Err(e) => Err(e),
        }
    }
}
