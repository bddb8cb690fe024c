//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! The plan for a whole image transition.
//!
//! One package plan per proposed change, plus the cross-package work
//! no single plan can see: directories shared between packages,
//! links whose target another package still provides, and hardlinks
//! that must be re-created after their target file was replaced.
//!
//! Single-threaded by design. The planner takes `&mut self` and no
//! internal locking exists; callers serialize externally.

use crate::actions::{Action, ActionKind};
use crate::fmri::Fmri;
use crate::image::installed::InstalledPackages;
use crate::image::{Image, ImageError, ImageType};
use crate::manifest::{Manifest, expand_dirs};
use crate::plan::{BootEnvironment, PkgPlan, PlanError, Result};
use crate::transport::Transport;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Aggregated transition plan for one image.
pub struct ImagePlan {
    image: Image,
    changes: Vec<(Option<Fmri>, Option<Fmri>)>,
    plans: Vec<PkgPlan>,
    removal_stream: Vec<(usize, (Action, Option<Action>))>,
    update_stream: Vec<(usize, (Action, Action))>,
    install_stream: Vec<(usize, (Option<Action>, Action))>,
    evaluated: bool,
}

impl ImagePlan {
    pub fn new(image: Image) -> ImagePlan {
        ImagePlan {
            image,
            changes: Vec::new(),
            plans: Vec::new(),
            removal_stream: Vec::new(),
            update_stream: Vec::new(),
            install_stream: Vec::new(),
            evaluated: false,
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn plans(&self) -> &[PkgPlan] {
        &self.plans
    }

    pub fn plans_mut(&mut self) -> &mut [PkgPlan] {
        &mut self.plans
    }

    /// The ordered removal stream, valid after evaluate.
    pub fn removals(&self) -> impl Iterator<Item = &(Action, Option<Action>)> {
        self.removal_stream.iter().map(|(_, pair)| pair)
    }

    pub fn updates(&self) -> impl Iterator<Item = &(Action, Action)> {
        self.update_stream.iter().map(|(_, pair)| pair)
    }

    pub fn installs(&self) -> impl Iterator<Item = &(Option<Action>, Action)> {
        self.install_stream.iter().map(|(_, pair)| pair)
    }

    /// Propose changing a package: `(None, Some)` installs,
    /// `(Some, Some)` updates, `(Some, None)` removes.
    pub fn propose(&mut self, old: Option<Fmri>, new: Option<Fmri>) {
        self.changes.push((old, new));
    }

    /// Total transfer cost over all package plans.
    pub fn get_xferstats(&mut self) -> (u64, u64) {
        let mut nfiles = 0;
        let mut nbytes = 0;
        for plan in &mut self.plans {
            let (f, b) = plan.get_xferstats();
            nfiles += f;
            nbytes += b;
        }
        (nfiles, nbytes)
    }

    /// Evaluate every proposed change, then resolve the
    /// cross-package interactions into three ordered action streams.
    ///
    /// `cancel` is consulted at the top of each per-package
    /// iteration; once a package evaluation has started it finishes.
    pub fn evaluate(
        &mut self,
        installed: &InstalledPackages,
        cancel: &mut dyn FnMut() -> bool,
    ) -> Result<()> {
        // packages leaving in this same transaction do not hold each
        // other back as dependents
        let departing: BTreeSet<String> = self
            .changes
            .iter()
            .filter(|(_, new)| new.is_none())
            .filter_map(|(old, _)| old.as_ref().map(|f| f.stem().to_string()))
            .collect();

        for (old, new) in self.changes.clone() {
            if cancel() {
                return Err(PlanError::Canceled);
            }

            let mut plan = PkgPlan::new();
            if let Some(origin) = &old {
                plan.propose_removal(origin.clone(), self.image.cached_manifest(origin)?)?;
            }
            if let Some(dest) = &new {
                plan.propose_destination(dest.clone(), self.image.cached_manifest(dest)?)?;
            }
            plan.evaluate_excluding(&self.image, installed, &departing)?;
            self.plans.push(plan);
        }

        let target = self.target_image_state(installed)?;
        self.build_streams(&target);
        self.evaluated = true;

        info!(
            packages = self.plans.len(),
            removals = self.removal_stream.len(),
            updates = self.update_stream.len(),
            installs = self.install_stream.len(),
            "image plan evaluated"
        );
        Ok(())
    }

    /// What the image will contain after this plan: directory set,
    /// pathed-action set and hardlinks indexed by target.
    fn target_image_state(&self, installed: &InstalledPackages) -> Result<TargetState> {
        let mut state = TargetState::default();
        let variants = self.image.variants().clone();

        // the metadata tree is never up for removal
        let fixed = match self.image.image_type() {
            ImageType::Full => "var/pkg",
            ImageType::Partial => ".pkg",
        };
        state.dirs.extend(expand_dirs([fixed]));

        let changed_stems: BTreeSet<&str> = self
            .changes
            .iter()
            .flat_map(|(old, new)| [old, new])
            .filter_map(|f| f.as_ref().map(|f| f.stem()))
            .collect();

        // untouched installed packages keep their footprint
        for record in installed.iter_installed()? {
            if changed_stems.contains(record.fmri.stem()) {
                continue;
            }
            let manifest = match self.image.cached_manifest(&record.fmri) {
                Ok(m) => m,
                Err(ImageError::ManifestNotCached(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            state.absorb(&manifest, &variants);
        }

        // planned destinations contribute theirs
        for plan in &self.plans {
            state.dirs.extend(plan.destination_dirs().iter().cloned());
            state.paths.extend(plan.destination_paths().iter().cloned());
            for hl in plan.destination_hardlinks() {
                if let Some(target) = hl.attr("target") {
                    state
                        .hardlinks_by_target
                        .entry(target.to_string())
                        .or_default()
                        .push(hl.clone());
                }
            }
        }

        Ok(state)
    }

    fn build_streams(&mut self, target: &TargetState) {
        let mut removals: Vec<(usize, (Action, Option<Action>))> = Vec::new();
        let mut updates: Vec<(usize, (Action, Action))> = Vec::new();
        let mut installs: Vec<(usize, (Option<Action>, Action))> = Vec::new();

        let mut removed_dirs: BTreeSet<String> = BTreeSet::new();
        for (idx, plan) in self.plans.iter().enumerate() {
            for pair in &plan.actions.removed {
                let path = pair.0.attr("path").map(str::to_string);
                match &pair.0.kind {
                    ActionKind::Dir => {
                        let path = match path {
                            Some(p) => p,
                            None => continue,
                        };
                        // a directory another package still wants, or a
                        // sibling plan already removes, is dropped here
                        if target.dirs.contains(&path) || !removed_dirs.insert(path.clone()) {
                            debug!(path, "discarding directory removal");
                            continue;
                        }
                        removals.push((idx, pair.clone()));
                    }
                    ActionKind::Link | ActionKind::Hardlink => {
                        if let Some(p) = &path {
                            if target.paths.contains(p) {
                                debug!(path = %p, "discarding link removal, path still delivered");
                                continue;
                            }
                        }
                        removals.push((idx, pair.clone()));
                    }
                    _ => removals.push((idx, pair.clone())),
                }
            }

            for pair in &plan.actions.changed {
                updates.push((idx, pair.clone()));
            }
            for pair in &plan.actions.added {
                installs.push((idx, pair.clone()));
            }
        }

        // a replaced file breaks every hardlink pointing at it; those
        // links are installed again after the new file is in place
        let mut renewed: BTreeSet<String> = BTreeSet::new();
        for (idx, plan) in self.plans.iter().enumerate() {
            for (_, new_action) in &plan.actions.changed {
                if new_action.kind != ActionKind::File {
                    continue;
                }
                let path = match new_action.attr("path") {
                    Some(p) => p,
                    None => continue,
                };
                if let Some(links) = target.hardlinks_by_target.get(path) {
                    for link in links {
                        let link_path = link.attr("path").unwrap_or_default().to_string();
                        if renewed.insert(link_path.clone()) {
                            debug!(link = %link_path, target = path, "renewing hardlink");
                            installs.push((idx, (None, link.clone())));
                        }
                    }
                }
            }
        }

        // deepest paths go first so contents leave before their
        // directories
        removals.sort_by_key(|(_, pair)| Reverse(sort_path(&pair.0)));
        // installs and updates go shallow to deep, directories before
        // files, links last
        updates.sort_by_key(|(_, pair)| (pair.1.kind.order_class(), sort_path(&pair.1)));
        installs.sort_by_key(|(_, pair)| (pair.1.kind.order_class(), sort_path(&pair.1)));

        self.removal_stream = removals;
        self.update_stream = updates;
        self.install_stream = installs;
    }

    /// Run the plan inside the boot-environment bracket: snapshot,
    /// stage, apply, persist, activate. Any failure restores the
    /// snapshot and surfaces the original error.
    pub fn execute(
        &mut self,
        installed: &InstalledPackages,
        transport: &mut dyn Transport,
        bootenv: &mut dyn BootEnvironment,
    ) -> Result<()> {
        if !self.evaluated {
            return Err(PlanError::InvalidState {
                operation: "execute",
                expected: crate::plan::PkgPlanState::Evaluated,
                found: crate::plan::PkgPlanState::Created,
            });
        }

        bootenv.snapshot()?;
        match self.execute_inner(installed, transport) {
            Ok(()) => bootenv.activate(),
            Err(e) => {
                // the execution error is what the caller needs to see,
                // even when rolling back fails too
                if let Err(restore_err) = bootenv.restore() {
                    warn!(error = %restore_err, "snapshot restore failed");
                }
                Err(e)
            }
        }
    }

    fn execute_inner(
        &mut self,
        installed: &InstalledPackages,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        for plan in &mut self.plans {
            plan.preexecute(&self.image, transport)?;
        }

        let image = &self.image;
        let plans = &mut self.plans;

        for (idx, pair) in &self.removal_stream {
            plans[*idx].execute_removal(image, pair)?;
        }
        for (idx, pair) in &self.update_stream {
            plans[*idx].execute_update(image, pair)?;
        }
        for (idx, pair) in &self.install_stream {
            plans[*idx].execute_install(image, pair)?;
        }

        for plan in plans.iter_mut() {
            plan.finish_execute()?;
        }
        for plan in self.plans.iter_mut() {
            plan.postexecute(&self.image, installed)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TargetState {
    dirs: BTreeSet<String>,
    paths: BTreeSet<String>,
    hardlinks_by_target: HashMap<String, Vec<Action>>,
}

impl TargetState {
    fn absorb(&mut self, manifest: &Manifest, variants: &crate::actions::VariantSet) {
        self.dirs.extend(manifest.get_directories(variants));
        for action in manifest.gen_actions(variants) {
            if let Some(path) = action.attr("path") {
                self.paths.insert(path.to_string());
            }
            if action.kind == ActionKind::Hardlink {
                if let Some(target) = action.attr("target") {
                    self.hardlinks_by_target
                        .entry(target.to_string())
                        .or_default()
                        .push(action.clone());
                }
            }
        }
    }
}

fn sort_path(action: &Action) -> String {
    action
        .attr("path")
        .or_else(|| action.key())
        .unwrap_or_default()
        .to_string()
}
