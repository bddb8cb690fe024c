//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! The plan for one package: install, update or removal.
//!
//! Proposal hands the manifests in by value; evaluate derives the
//! action difference and drops them again, so an evaluated plan
//! carries only what execution needs.

use crate::actions::executors::{self, ApplyOptions};
use crate::actions::{Action, ActionKind, DependType};
use crate::filter::{apply_filters, Filter};
use crate::fmri::Fmri;
use crate::image::installed::InstalledPackages;
use crate::image::{Image, ImageError};
use crate::manifest::{ActionId, Manifest, ManifestDifference};
use crate::plan::{PkgPlanState, PlanError, Result};
use crate::transport::{Transport, TransportError};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use tracing::{debug, info};

/// Planned transition of a single package.
#[derive(Debug)]
pub struct PkgPlan {
    pub origin_fmri: Option<Fmri>,
    pub destination_fmri: Option<Fmri>,
    origin_manifest: Option<Manifest>,
    destination_manifest: Option<Manifest>,
    /// The action difference driving execution, valid from Evaluated on
    pub actions: ManifestDifference,
    pkg_summary: String,
    xferstats: Option<(u64, u64)>,
    state: PkgPlanState,
    // captured at evaluate time for the global evaluator, since the
    // manifests are gone afterwards
    destination_dirs: BTreeSet<String>,
    destination_paths: BTreeSet<String>,
    destination_hardlinks: Vec<Action>,
}

impl Default for PkgPlan {
    fn default() -> Self {
        PkgPlan::new()
    }
}

impl PkgPlan {
    pub fn new() -> PkgPlan {
        PkgPlan {
            origin_fmri: None,
            destination_fmri: None,
            origin_manifest: None,
            destination_manifest: None,
            actions: ManifestDifference::default(),
            pkg_summary: String::new(),
            xferstats: None,
            state: PkgPlanState::Created,
            destination_dirs: BTreeSet::new(),
            destination_paths: BTreeSet::new(),
            destination_hardlinks: Vec::new(),
        }
    }

    pub fn state(&self) -> PkgPlanState {
        self.state
    }

    pub fn pkg_summary(&self) -> &str {
        &self.pkg_summary
    }

    /// The stem this plan is about.
    pub fn stem(&self) -> &str {
        self.destination_fmri
            .as_ref()
            .or(self.origin_fmri.as_ref())
            .map(|f| f.stem())
            .unwrap_or("")
    }

    pub(crate) fn destination_dirs(&self) -> &BTreeSet<String> {
        &self.destination_dirs
    }

    pub(crate) fn destination_paths(&self) -> &BTreeSet<String> {
        &self.destination_paths
    }

    pub(crate) fn destination_hardlinks(&self) -> &[Action] {
        &self.destination_hardlinks
    }

    fn check_state(&self, operation: &'static str, expected: PkgPlanState) -> Result<()> {
        if self.state != expected {
            return Err(PlanError::InvalidState {
                operation,
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    /// Propose installing or updating to this version.
    pub fn propose_destination(&mut self, fmri: Fmri, manifest: Manifest) -> Result<()> {
        if !matches!(self.state, PkgPlanState::Created | PkgPlanState::Proposed) {
            return Err(PlanError::InvalidState {
                operation: "propose destination for",
                expected: PkgPlanState::Created,
                found: self.state,
            });
        }
        self.destination_fmri = Some(fmri);
        self.destination_manifest = Some(manifest);
        self.state = PkgPlanState::Proposed;
        Ok(())
    }

    /// Propose removing this installed version.
    pub fn propose_removal(&mut self, fmri: Fmri, manifest: Manifest) -> Result<()> {
        if !matches!(self.state, PkgPlanState::Created | PkgPlanState::Proposed) {
            return Err(PlanError::InvalidState {
                operation: "propose removal for",
                expected: PkgPlanState::Created,
                found: self.state,
            });
        }
        self.origin_fmri = Some(fmri);
        self.origin_manifest = Some(manifest);
        self.state = PkgPlanState::Proposed;
        Ok(())
    }

    /// Work out what execution has to do, then drop both manifests.
    pub fn evaluate(&mut self, image: &Image, installed: &InstalledPackages) -> Result<()> {
        self.evaluate_excluding(image, installed, &BTreeSet::new())
    }

    /// Like [`PkgPlan::evaluate`], but installed packages named in
    /// `departing` do not count as dependents. The global evaluator
    /// passes the other removals of the same transaction here, so a
    /// package and its sole requirer can leave together.
    pub fn evaluate_excluding(
        &mut self,
        image: &Image,
        installed: &InstalledPackages,
        departing: &BTreeSet<String>,
    ) -> Result<()> {
        self.check_state("evaluate", PkgPlanState::Proposed)?;
        match self.evaluate_inner(image, installed, departing) {
            Ok(()) => {
                self.state = PkgPlanState::Evaluated;
                Ok(())
            }
            Err(e) => {
                self.state = PkgPlanState::EvaluationFailed;
                Err(e)
            }
        }
    }

    fn evaluate_inner(
        &mut self,
        image: &Image,
        installed: &InstalledPackages,
        departing: &BTreeSet<String>,
    ) -> Result<()> {
        let variants = image.variants().clone();

        // an update proposed without its origin finds the installed
        // version on its own
        let mut stored_filter_sources: Vec<String> = Vec::new();
        if self.origin_fmri.is_none() {
            if let Some(dest) = &self.destination_fmri {
                if let Some(record) = installed.get_record(dest.stem())? {
                    self.origin_manifest = Some(image.cached_manifest(&record.fmri)?);
                    self.origin_fmri = Some(record.fmri);
                    stored_filter_sources = record.filters;
                }
            }
        } else if let Some(origin) = &self.origin_fmri {
            if let Some(record) = installed.get_record(origin.stem())? {
                stored_filter_sources = record.filters;
            }
        }

        // origin actions see the filters they were installed with,
        // destination actions the image's current ones
        let stored_filters = stored_filter_sources
            .iter()
            .map(|s| Filter::parse(s))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let current_filters = image.image_filters()?;

        if self.destination_fmri.is_none() {
            if let Some(origin) = &self.origin_fmri {
                let dependents = find_dependents(image, installed, origin.stem(), departing)?;
                if !dependents.is_empty() {
                    return Err(PlanError::NonLeafPackage {
                        fmri: origin.to_string(),
                        dependents,
                    });
                }
            }
        }

        let origin = filtered(self.origin_manifest.as_ref(), &stored_filters);
        let destination = filtered(self.destination_manifest.as_ref(), &current_filters);

        self.actions = origin.difference(&destination, &variants, &variants)?;

        // directories only the origin needed become removals, once
        let origin_dirs = origin.get_directories(&variants);
        self.destination_dirs = destination.get_directories(&variants);
        let removed_ids: BTreeSet<ActionId> = self
            .actions
            .removed
            .iter()
            .map(|(a, _)| ActionId::of(a))
            .collect();
        for dir in origin_dirs.difference(&self.destination_dirs) {
            let mut action = Action::new(ActionKind::Dir);
            action.set_attr("path", dir);
            if !removed_ids.contains(&ActionId::of(&action)) {
                self.actions.removed.push((action, None));
            }
        }

        for action in destination.gen_actions(&variants) {
            if let Some(path) = action.attr("path") {
                self.destination_paths.insert(path.to_string());
            }
            if action.kind == ActionKind::Hardlink {
                self.destination_hardlinks.push(action.clone());
            }
        }

        self.pkg_summary = destination
            .get_attr("pkg.summary")
            .or_else(|| destination.get_attr("description"))
            .or_else(|| origin.get_attr("pkg.summary"))
            .unwrap_or("none provided")
            .to_string();

        self.origin_manifest = None;
        self.destination_manifest = None;

        debug!(
            stem = self.stem(),
            added = self.actions.added.len(),
            changed = self.actions.changed.len(),
            removed = self.actions.removed.len(),
            "evaluated package plan"
        );
        Ok(())
    }

    /// Files and bytes execution will transfer, cached after the
    /// first call.
    pub fn get_xferstats(&mut self) -> (u64, u64) {
        if let Some(stats) = self.xferstats {
            return stats;
        }
        let mut nfiles = 0u64;
        let mut nbytes = 0u64;
        for action in self
            .actions
            .added
            .iter()
            .map(|(_, a)| a)
            .chain(self.actions.changed.iter().map(|(_, a)| a))
        {
            if action.payload.is_some() {
                nfiles += 1;
                nbytes += action.payload_size();
            }
        }
        self.xferstats = Some((nfiles, nbytes));
        (nfiles, nbytes)
    }

    /// Stage every payload this plan will install into the image's
    /// download cache. Nothing in the image proper is touched, and
    /// the first failure aborts the whole plan.
    pub fn preexecute(&mut self, image: &Image, transport: &mut dyn Transport) -> Result<()> {
        self.check_state("preexecute", PkgPlanState::Evaluated)?;
        match self.preexecute_inner(image, transport) {
            Ok(()) => {
                self.state = PkgPlanState::Preexecuted;
                Ok(())
            }
            Err(e) => {
                self.state = PkgPlanState::ExecutionFailed;
                Err(e)
            }
        }
    }

    fn preexecute_inner(&mut self, image: &Image, transport: &mut dyn Transport) -> Result<()> {
        let download_dir = image.download_dir();
        fs::create_dir_all(&download_dir).map_err(ImageError::IO)?;

        for action in self
            .actions
            .added
            .iter()
            .map(|(_, a)| a)
            .chain(self.actions.changed.iter().map(|(_, a)| a))
        {
            let digest = match &action.payload {
                Some(d) => d,
                None => continue,
            };
            let staged = download_dir.join(digest);
            if staged.exists() {
                continue;
            }
            let bytes = transport.get_content(digest)?;
            verify_digest(digest, &bytes)?;
            fs::write(&staged, &bytes).map_err(ImageError::IO)?;
            debug!(digest, size = bytes.len(), "staged payload");
        }
        Ok(())
    }

    fn action_failed(&mut self, action: &Action, source: executors::InstallerError) -> PlanError {
        self.state = PkgPlanState::ExecutionFailed;
        PlanError::ActionFailed {
            key: action.key().unwrap_or_default().to_string(),
            stem: self.stem().to_string(),
            source,
        }
    }

    pub fn execute_install(&mut self, image: &Image, pair: &(Option<Action>, Action)) -> Result<()> {
        self.check_state("execute", PkgPlanState::Preexecuted)?;
        let opts = ApplyOptions::default();
        executors::install_action(image.path(), &image.download_dir(), &pair.1, &opts)
            .map_err(|e| self.action_failed(&pair.1, e))
    }

    pub fn execute_update(&mut self, image: &Image, pair: &(Action, Action)) -> Result<()> {
        self.check_state("execute", PkgPlanState::Preexecuted)?;
        let opts = ApplyOptions::default();
        executors::update_action(image.path(), &image.download_dir(), &pair.1, &opts)
            .map_err(|e| self.action_failed(&pair.1, e))
    }

    pub fn execute_removal(&mut self, image: &Image, pair: &(Action, Option<Action>)) -> Result<()> {
        self.check_state("execute", PkgPlanState::Preexecuted)?;
        let opts = ApplyOptions::default();
        executors::remove_action(image.path(), &pair.0, &opts)
            .map_err(|e| self.action_failed(&pair.0, e))
    }

    /// Mark the action streams as fully applied.
    pub fn finish_execute(&mut self) -> Result<()> {
        self.check_state("finish executing", PkgPlanState::Preexecuted)?;
        self.state = PkgPlanState::Executed;
        Ok(())
    }

    /// Persist the outcome: the installed-package record and the
    /// filter record. Only after this is the transition durable.
    pub fn postexecute(&mut self, image: &Image, installed: &InstalledPackages) -> Result<()> {
        self.check_state("postexecute", PkgPlanState::Executed)?;

        if let Some(dest) = &self.destination_fmri {
            let filters = image.image_filters()?;
            let sources: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
            installed.add_install_record(dest, &sources)?;
            image.store_filters(dest.stem(), &filters)?;
            info!(fmri = %dest, "package installed");
        } else if let Some(origin) = &self.origin_fmri {
            installed.remove_install_record(origin.stem())?;
            image.store_filters(origin.stem(), &[])?;
            info!(fmri = %origin, "package removed");
        }

        self.state = PkgPlanState::Postexecuted;
        Ok(())
    }
}

/// Apply filter expressions to a manifest, yielding the surviving
/// actions. A missing manifest filters to an empty one.
fn filtered(manifest: Option<&Manifest>, filters: &[Filter]) -> Manifest {
    match manifest {
        None => Manifest::new(),
        Some(m) => Manifest {
            fmri: m.fmri.clone(),
            actions: m
                .actions
                .iter()
                .filter(|a| apply_filters(a, filters))
                .cloned()
                .collect(),
        },
    }
}

/// Installed packages whose cached manifest requires `stem`, minus
/// those in `departing`. Packages without a cached manifest cannot
/// vouch either way and are skipped.
fn find_dependents(
    image: &Image,
    installed: &InstalledPackages,
    stem: &str,
    departing: &BTreeSet<String>,
) -> Result<Vec<String>> {
    let mut dependents = Vec::new();
    for record in installed.iter_installed()? {
        if record.fmri.stem() == stem || departing.contains(record.fmri.stem()) {
            continue;
        }
        let manifest = match image.cached_manifest(&record.fmri) {
            Ok(m) => m,
            Err(ImageError::ManifestNotCached(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        for action in &manifest.actions {
            if let Ok(Some((dep_type, dep_fmri))) = action.depend_info() {
                if matches!(dep_type, DependType::Require | DependType::RequireAny)
                    && dep_fmri.stem() == stem
                {
                    dependents.push(record.fmri.stem().to_string());
                    break;
                }
            }
        }
    }
    Ok(dependents)
}

/// Payload identifiers that are sha256 digests are checked against
/// the fetched content; shorter legacy identifiers pass through.
fn verify_digest(digest: &str, bytes: &[u8]) -> std::result::Result<(), TransportError> {
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Ok(());
    }
    let actual = format!("{:x}", Sha256::digest(bytes));
    if actual != digest {
        return Err(TransportError::DigestMismatch {
            digest: digest.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use tempfile::tempdir;

    fn fmri(s: &str) -> Fmri {
        Fmri::parse(s).unwrap()
    }

    fn manifest(text: &str) -> Manifest {
        Manifest::parse_string(text).unwrap()
    }

    fn test_image() -> (tempfile::TempDir, Image, InstalledPackages) {
        let dir = tempdir().unwrap();
        let image = Image::new_full(dir.path());
        image.create_metadata_dir().unwrap();
        let installed = InstalledPackages::new(image.installed_db_path());
        installed.init_db().unwrap();
        (dir, image, installed)
    }

    const FOO_1_0: &str = "\
set name=pkg.fmri value=pkg:/foo@1.0
set name=pkg.summary value=\"a test package\"
dir group=bin mode=0755 owner=root path=usr/bin
file 1234 group=bin mode=0555 owner=root path=usr/bin/foo pkg.size=100
";

    #[test]
    fn phases_enforce_order() {
        let (_dir, image, installed) = test_image();
        let mut plan = PkgPlan::new();

        // cannot evaluate before proposing
        let err = plan.evaluate(&image, &installed).unwrap_err();
        assert!(matches!(err, PlanError::InvalidState { .. }));

        plan.propose_destination(fmri("foo@1.0"), manifest(FOO_1_0))
            .unwrap();
        assert_eq!(plan.state(), PkgPlanState::Proposed);

        // cannot preexecute before evaluating
        let mut transport = MemoryTransport::new();
        assert!(matches!(
            plan.preexecute(&image, &mut transport),
            Err(PlanError::InvalidState { .. })
        ));

        plan.evaluate(&image, &installed).unwrap();
        assert_eq!(plan.state(), PkgPlanState::Evaluated);

        // double evaluate is an error too
        assert!(matches!(
            plan.evaluate(&image, &installed),
            Err(PlanError::InvalidState { .. })
        ));
    }

    #[test]
    fn fresh_install_diff_and_summary() {
        let (_dir, image, installed) = test_image();
        let mut plan = PkgPlan::new();
        plan.propose_destination(fmri("foo@1.0"), manifest(FOO_1_0))
            .unwrap();
        plan.evaluate(&image, &installed).unwrap();

        assert_eq!(plan.actions.added.len(), 4);
        assert!(plan.actions.changed.is_empty());
        assert!(plan.actions.removed.is_empty());
        assert_eq!(plan.pkg_summary(), "a test package");
        assert_eq!(plan.get_xferstats(), (1, 100));
        // cached
        assert_eq!(plan.get_xferstats(), (1, 100));
    }

    #[test]
    fn update_discovers_installed_origin() {
        let (_dir, image, installed) = test_image();
        let old = fmri("foo@1.0");
        installed.add_install_record(&old, &[]).unwrap();
        image.cache_manifest(&old, FOO_1_0).unwrap();

        let new_text = FOO_1_0.replace("1234", "5678").replace("@1.0", "@1.1");
        let mut plan = PkgPlan::new();
        plan.propose_destination(fmri("foo@1.1"), manifest(&new_text))
            .unwrap();
        plan.evaluate(&image, &installed).unwrap();

        assert_eq!(plan.origin_fmri.as_ref().unwrap().version(), "1.0");
        // only the file and the fmri attribute changed
        assert!(plan.actions.added.is_empty());
        assert_eq!(plan.actions.changed.len(), 2);
    }

    #[test]
    fn removal_appends_implicit_dirs_once() {
        let (_dir, image, installed) = test_image();
        let mut plan = PkgPlan::new();
        plan.propose_removal(fmri("foo@1.0"), manifest(FOO_1_0))
            .unwrap();
        plan.evaluate(&image, &installed).unwrap();

        let dir_removals: Vec<_> = plan
            .actions
            .removed
            .iter()
            .filter(|(a, _)| a.kind == ActionKind::Dir)
            .filter_map(|(a, _)| a.attr("path"))
            .collect();
        // usr/bin is explicit, usr implicit, neither twice
        assert_eq!(dir_removals.iter().filter(|p| **p == "usr/bin").count(), 1);
        assert_eq!(dir_removals.iter().filter(|p| **p == "usr").count(), 1);
    }

    #[test]
    fn removal_of_required_package_is_blocked() {
        let (_dir, image, installed) = test_image();
        let dep = fmri("bar@1.0");
        installed.add_install_record(&dep, &[]).unwrap();
        image
            .cache_manifest(
                &dep,
                "set name=pkg.fmri value=pkg:/bar@1.0\ndepend fmri=pkg:/foo@1.0 type=require\n",
            )
            .unwrap();
        installed.add_install_record(&fmri("foo@1.0"), &[]).unwrap();

        let mut plan = PkgPlan::new();
        plan.propose_removal(fmri("foo@1.0"), manifest(FOO_1_0))
            .unwrap();
        let err = plan.evaluate(&image, &installed).unwrap_err();
        match err {
            PlanError::NonLeafPackage { dependents, .. } => {
                assert_eq!(dependents, vec!["bar".to_string()]);
            }
            other => panic!("expected NonLeafPackage, got {:?}", other),
        }
        assert_eq!(plan.state(), PkgPlanState::EvaluationFailed);
    }

    #[test]
    fn removal_allowed_when_requirer_departs_too() {
        let (_dir, image, installed) = test_image();
        let dep = fmri("bar@1.0");
        installed.add_install_record(&dep, &[]).unwrap();
        image
            .cache_manifest(
                &dep,
                "set name=pkg.fmri value=pkg:/bar@1.0\ndepend fmri=pkg:/foo@1.0 type=require\n",
            )
            .unwrap();
        installed.add_install_record(&fmri("foo@1.0"), &[]).unwrap();

        // bar is being removed in the same transaction, so it does
        // not pin foo down
        let departing: BTreeSet<String> = ["bar".to_string()].into_iter().collect();
        let mut plan = PkgPlan::new();
        plan.propose_removal(fmri("foo@1.0"), manifest(FOO_1_0))
            .unwrap();
        plan.evaluate_excluding(&image, &installed, &departing)
            .unwrap();
        assert_eq!(plan.state(), PkgPlanState::Evaluated);
    }

    #[test]
    fn preexecute_stages_and_verifies() {
        let (_dir, image, installed) = test_image();
        let payload = b"hello world".to_vec();
        let digest = format!("{:x}", Sha256::digest(&payload));
        let text = format!(
            "set name=pkg.fmri value=pkg:/foo@1.0\nfile {} mode=0644 path=etc/motd pkg.size=11\n",
            digest
        );

        let mut transport = MemoryTransport::new();
        transport.add_content(&digest, payload);

        let mut plan = PkgPlan::new();
        plan.propose_destination(fmri("foo@1.0"), manifest(&text))
            .unwrap();
        plan.evaluate(&image, &installed).unwrap();
        plan.preexecute(&image, &mut transport).unwrap();
        assert!(image.download_dir().join(&digest).exists());

        // corrupt content is refused
        let bad_digest = format!("{:x}", Sha256::digest(b"expected"));
        let bad_text = format!(
            "set name=pkg.fmri value=pkg:/bad@1.0\nfile {} mode=0644 path=etc/bad pkg.size=5\n",
            bad_digest
        );
        let mut transport = MemoryTransport::new();
        transport.add_content(&bad_digest, b"tampered".to_vec());
        let mut plan = PkgPlan::new();
        plan.propose_destination(fmri("bad@1.0"), manifest(&bad_text))
            .unwrap();
        plan.evaluate(&image, &installed).unwrap();
        let err = plan.preexecute(&image, &mut transport).unwrap_err();
        assert!(matches!(
            err,
            PlanError::Transport(TransportError::DigestMismatch { .. })
        ));
        assert_eq!(plan.state(), PkgPlanState::ExecutionFailed);
        assert!(!image.download_dir().join(&bad_digest).exists());
    }

    #[test]
    fn postexecute_persists_records() {
        let (_dir, image, installed) = test_image();
        let payload = b"x".to_vec();
        let digest = format!("{:x}", Sha256::digest(&payload));
        let text = format!(
            "set name=pkg.fmri value=pkg:/foo@1.0\ndir mode=0755 path=usr/bin\nfile {} mode=0555 path=usr/bin/foo pkg.size=1\n",
            digest
        );
        let mut transport = MemoryTransport::new();
        transport.add_content(&digest, payload);

        let mut plan = PkgPlan::new();
        plan.propose_destination(fmri("foo@1.0"), manifest(&text))
            .unwrap();
        plan.evaluate(&image, &installed).unwrap();
        plan.preexecute(&image, &mut transport).unwrap();
        let installs = plan.actions.added.clone();
        for pair in &installs {
            plan.execute_install(&image, pair).unwrap();
        }
        plan.finish_execute().unwrap();
        plan.postexecute(&image, &installed).unwrap();

        assert_eq!(plan.state(), PkgPlanState::Postexecuted);
        assert!(image.path().join("usr/bin/foo").exists());
        let installed_fmri = installed.get_version_installed("foo").unwrap().unwrap();
        assert_eq!(installed_fmri.version(), "1.0");

        // removal path deregisters
        image.cache_manifest(&fmri("foo@1.0"), &text).unwrap();
        let mut plan = PkgPlan::new();
        plan.propose_removal(fmri("foo@1.0"), manifest(&text))
            .unwrap();
        plan.evaluate(&image, &installed).unwrap();
        plan.preexecute(&image, &mut transport).unwrap();
        let removals = plan.actions.removed.clone();
        for pair in &removals {
            plan.execute_removal(&image, pair).unwrap();
        }
        plan.finish_execute().unwrap();
        plan.postexecute(&image, &installed).unwrap();
        assert!(installed.get_version_installed("foo").unwrap().is_none());
    }
}
