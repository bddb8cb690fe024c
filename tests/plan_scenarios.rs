//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end planning scenarios against a scratch image.

use libpkg::actions::ActionKind;
use libpkg::constraint::{Constraint, ConstraintSet};
use libpkg::fmri::Fmri;
use libpkg::image::installed::InstalledPackages;
use libpkg::image::Image;
use libpkg::plan::{BootEnvironment, ImagePlan, PlanError, Result as PlanResult};
use libpkg::transport::MemoryTransport;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

fn fmri(s: &str) -> Fmri {
    Fmri::parse(s).unwrap()
}

fn scratch_image() -> (TempDir, Image, InstalledPackages) {
    let dir = TempDir::new().unwrap();
    let image = Image::new_full(dir.path());
    image.create_metadata_dir().unwrap();
    let installed = InstalledPackages::new(image.installed_db_path());
    installed.init_db().unwrap();
    (dir, image, installed)
}

fn never_cancel() -> impl FnMut() -> bool {
    || false
}

/// A boot environment that records the bracket calls.
#[derive(Default)]
struct RecordingBootEnv {
    events: Vec<&'static str>,
}

impl BootEnvironment for RecordingBootEnv {
    fn snapshot(&mut self) -> PlanResult<()> {
        self.events.push("snapshot");
        Ok(())
    }

    fn restore(&mut self) -> PlanResult<()> {
        self.events.push("restore");
        Ok(())
    }

    fn activate(&mut self) -> PlanResult<()> {
        self.events.push("activate");
        Ok(())
    }
}

/// A boot environment whose rollback is itself broken.
#[derive(Default)]
struct BrokenRestoreBootEnv {
    restore_attempted: bool,
}

impl BootEnvironment for BrokenRestoreBootEnv {
    fn snapshot(&mut self) -> PlanResult<()> {
        Ok(())
    }

    fn restore(&mut self) -> PlanResult<()> {
        self.restore_attempted = true;
        Err(PlanError::BootEnvironmentFailed(
            "snapshot vanished".to_string(),
        ))
    }

    fn activate(&mut self) -> PlanResult<()> {
        Ok(())
    }
}

fn digest_of(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[test]
fn install_into_empty_image_plans_two_actions() {
    let (_dir, image, installed) = scratch_image();
    let new = fmri("tools/widget@1.0,5.11");
    image
        .cache_manifest(
            &new,
            "dir mode=0755 owner=root group=bin path=usr/widget\n\
             file abc123 mode=0644 path=usr/widget/data pkg.size=10\n",
        )
        .unwrap();

    let mut plan = ImagePlan::new(image.clone());
    plan.propose(None, Some(new));
    plan.evaluate(&installed, &mut never_cancel()).unwrap();

    let installs: Vec<_> = plan.installs().collect();
    assert_eq!(installs.len(), 2);
    // directories come before their files
    assert_eq!(installs[0].1.kind, ActionKind::Dir);
    assert_eq!(installs[1].1.kind, ActionKind::File);
    assert!(plan.removals().next().is_none());
    assert!(plan.updates().next().is_none());
}

#[test]
fn implicit_directory_removed_exactly_once() {
    let (_dir, image, installed) = scratch_image();

    // two siblings share usr/shared, one has a private dir too
    let a = fmri("tools/alpha@1.0,5.11");
    let b = fmri("tools/beta@1.0,5.11");
    image
        .cache_manifest(
            &a,
            "set name=pkg.fmri value=pkg:/tools/alpha@1.0,5.11\n\
             file aaa mode=0644 path=usr/shared/alpha pkg.size=1\n\
             file bbb mode=0644 path=usr/alpha-only/conf pkg.size=1\n",
        )
        .unwrap();
    image
        .cache_manifest(
            &b,
            "set name=pkg.fmri value=pkg:/tools/beta@1.0,5.11\n\
             file ccc mode=0644 path=usr/shared/beta pkg.size=1\n",
        )
        .unwrap();
    installed.add_install_record(&a, &[]).unwrap();
    installed.add_install_record(&b, &[]).unwrap();

    // removing alpha: usr/alpha-only goes, usr/shared and usr stay
    // because beta still needs them
    let mut plan = ImagePlan::new(image.clone());
    plan.propose(Some(a.clone()), None);
    plan.evaluate(&installed, &mut never_cancel()).unwrap();

    let removed_dirs: Vec<String> = plan
        .removals()
        .filter(|(act, _)| act.kind == ActionKind::Dir)
        .filter_map(|(act, _)| act.attr("path").map(str::to_string))
        .collect();
    assert_eq!(removed_dirs, vec!["usr/alpha-only".to_string()]);

    // removing both siblings in one plan: the shared dir appears once
    let mut plan = ImagePlan::new(image.clone());
    plan.propose(Some(a), None);
    plan.propose(Some(b), None);
    plan.evaluate(&installed, &mut never_cancel()).unwrap();

    let removed_dirs: Vec<String> = plan
        .removals()
        .filter(|(act, _)| act.kind == ActionKind::Dir)
        .filter_map(|(act, _)| act.attr("path").map(str::to_string))
        .collect();
    assert_eq!(
        removed_dirs.iter().filter(|p| *p == "usr/shared").count(),
        1
    );
    assert_eq!(removed_dirs.iter().filter(|p| *p == "usr").count(), 1);
    // depth first
    let usr_pos = removed_dirs.iter().position(|p| p == "usr").unwrap();
    let shared_pos = removed_dirs.iter().position(|p| p == "usr/shared").unwrap();
    assert!(shared_pos < usr_pos);
}

#[test]
fn removing_a_required_package_names_the_dependent() {
    let (_dir, image, installed) = scratch_image();
    let lib = fmri("library/zlib@1.2,5.11");
    let consumer = fmri("web/server/nginx@1.18.0,5.11");
    image
        .cache_manifest(
            &lib,
            "set name=pkg.fmri value=pkg:/library/zlib@1.2,5.11\n\
             file abc mode=0644 path=usr/lib/libz.so pkg.size=1\n",
        )
        .unwrap();
    image
        .cache_manifest(
            &consumer,
            "set name=pkg.fmri value=pkg:/web/server/nginx@1.18.0,5.11\n\
             depend fmri=pkg:/library/zlib@1.2 type=require\n",
        )
        .unwrap();
    installed.add_install_record(&lib, &[]).unwrap();
    installed.add_install_record(&consumer, &[]).unwrap();

    let mut plan = ImagePlan::new(image.clone());
    plan.propose(Some(lib), None);
    let err = plan.evaluate(&installed, &mut never_cancel()).unwrap_err();
    match err {
        PlanError::NonLeafPackage { dependents, .. } => {
            assert_eq!(dependents, vec!["web/server/nginx".to_string()]);
        }
        other => panic!("expected NonLeafPackage, got {:?}", other),
    }
}

#[test]
fn removing_a_dependency_chain_together_succeeds() {
    let (_dir, image, installed) = scratch_image();
    let lib = fmri("library/zlib@1.2,5.11");
    let consumer = fmri("web/server/nginx@1.18.0,5.11");
    image
        .cache_manifest(
            &lib,
            "set name=pkg.fmri value=pkg:/library/zlib@1.2,5.11\n\
             file abc mode=0644 path=usr/lib/libz.so pkg.size=1\n",
        )
        .unwrap();
    image
        .cache_manifest(
            &consumer,
            "set name=pkg.fmri value=pkg:/web/server/nginx@1.18.0,5.11\n\
             file def mode=0555 path=usr/sbin/nginx pkg.size=1\n\
             depend fmri=pkg:/library/zlib@1.2 type=require\n",
        )
        .unwrap();
    installed.add_install_record(&lib, &[]).unwrap();
    installed.add_install_record(&consumer, &[]).unwrap();

    // the library's only requirer leaves in the same transaction, so
    // the library is not held back
    let mut plan = ImagePlan::new(image.clone());
    plan.propose(Some(lib), None);
    plan.propose(Some(consumer), None);
    plan.evaluate(&installed, &mut never_cancel()).unwrap();

    assert_eq!(plan.plans().len(), 2);
    let removed_files: Vec<_> = plan
        .removals()
        .filter(|(act, _)| act.kind == ActionKind::File)
        .filter_map(|(act, _)| act.attr("path"))
        .collect();
    assert!(removed_files.contains(&"usr/lib/libz.so"));
    assert!(removed_files.contains(&"usr/sbin/nginx"));
}

#[test]
fn incorporation_reload_retracts_old_constraints() {
    // an incorporation pins its members; loading a newer version of
    // the same incorporation withdraws the old pins first
    let mut set = ConstraintSet::new();

    let amber1 = fmri("amber@1.0,5.11");
    let bronze1 = fmri("bronze@1.0,5.11");
    assert!(set.start_loading(&amber1).unwrap());
    set.update_constraints(&Constraint::incorporated(
        &bronze1,
        bronze1.version.clone().unwrap(),
        amber1.stem(),
    ))
    .unwrap();
    set.finish_loading(&amber1).unwrap();

    // while amber 1.0 is live, bronze 2.0 violates the pin
    let bronze2 = fmri("bronze@2.0,5.11");
    assert!(set.apply_constraints_to_fmri(&bronze2).is_err());

    // reloading amber at 2.0 drops the 1.0-era pin
    let amber2 = fmri("amber@2.0,5.11");
    assert!(set.start_loading(&amber2).unwrap());
    set.update_constraints(&Constraint::incorporated(
        &bronze2,
        bronze2.version.clone().unwrap(),
        amber2.stem(),
    ))
    .unwrap();
    set.finish_loading(&amber2).unwrap();

    let resolved = set.apply_constraints_to_fmri(&bronze2).unwrap();
    assert_eq!(resolved.version(), "2.0,5.11");
    // and bronze 1.0 is the one in violation now
    assert!(set.apply_constraints_to_fmri(&bronze1).is_err());
}

#[test]
fn replaced_hardlink_target_renews_the_link() {
    let (_dir, image, installed) = scratch_image();
    let old = fmri("tools/editor@1.0,5.11");
    let new = fmri("tools/editor@1.1,5.11");
    image
        .cache_manifest(
            &old,
            "set name=pkg.fmri value=pkg:/tools/editor@1.0,5.11\n\
             dir mode=0755 path=usr/bin\n\
             file aaa mode=0755 path=usr/bin/ed pkg.size=5\n\
             hardlink path=usr/bin/red target=usr/bin/ed\n",
        )
        .unwrap();
    image
        .cache_manifest(
            &new,
            "set name=pkg.fmri value=pkg:/tools/editor@1.1,5.11\n\
             dir mode=0755 path=usr/bin\n\
             file bbb mode=0755 path=usr/bin/ed pkg.size=6\n\
             hardlink path=usr/bin/red target=usr/bin/ed\n",
        )
        .unwrap();
    installed.add_install_record(&old, &[]).unwrap();

    let mut plan = ImagePlan::new(image.clone());
    plan.propose(Some(old), Some(new));
    plan.evaluate(&installed, &mut never_cancel()).unwrap();

    // the hardlink itself did not change, yet it is reinstalled
    // because its target file was replaced
    let renewed: Vec<_> = plan
        .installs()
        .filter(|(_, act)| act.kind == ActionKind::Hardlink)
        .filter_map(|(_, act)| act.attr("path"))
        .collect();
    assert_eq!(renewed, vec!["usr/bin/red"]);

    // links sort after the file they point at
    let kinds: Vec<u8> = plan
        .installs()
        .map(|(_, act)| act.kind.order_class())
        .collect();
    let mut sorted = kinds.clone();
    sorted.sort_unstable();
    assert_eq!(kinds, sorted);
}

#[test]
fn cancellation_stops_between_packages() {
    let (_dir, image, installed) = scratch_image();
    let a = fmri("tools/alpha@1.0,5.11");
    let b = fmri("tools/beta@1.0,5.11");
    image
        .cache_manifest(&a, "dir mode=0755 path=opt/alpha\n")
        .unwrap();
    image
        .cache_manifest(&b, "dir mode=0755 path=opt/beta\n")
        .unwrap();

    let mut plan = ImagePlan::new(image.clone());
    plan.propose(None, Some(a));
    plan.propose(None, Some(b));

    let mut calls = 0;
    let err = plan
        .evaluate(&installed, &mut || {
            calls += 1;
            calls > 1
        })
        .unwrap_err();
    assert!(matches!(err, PlanError::Canceled));
    // the first package was evaluated before the cancel point
    assert_eq!(plan.plans().len(), 1);
}

#[test]
fn execute_snapshots_then_activates() {
    let (_dir, image, installed) = scratch_image();
    let payload = b"configuration\n".to_vec();
    let digest = digest_of(&payload);
    let new = fmri("tools/widget@1.0,5.11");
    image
        .cache_manifest(
            &new,
            &format!(
                "set name=pkg.fmri value=pkg:/tools/widget@1.0,5.11\n\
                 dir mode=0755 path=etc/widget\n\
                 file {} mode=0644 path=etc/widget/widget.conf pkg.size=14\n",
                digest
            ),
        )
        .unwrap();

    let mut transport = MemoryTransport::new();
    transport.add_content(&digest, payload.clone());

    let mut plan = ImagePlan::new(image.clone());
    plan.propose(None, Some(new));
    plan.evaluate(&installed, &mut never_cancel()).unwrap();
    assert_eq!(plan.get_xferstats(), (1, 14));

    let mut bootenv = RecordingBootEnv::default();
    plan.execute(&installed, &mut transport, &mut bootenv)
        .unwrap();

    assert_eq!(bootenv.events, vec!["snapshot", "activate"]);
    assert_eq!(
        std::fs::read(image.path().join("etc/widget/widget.conf")).unwrap(),
        payload
    );
    let record = installed.get_version_installed("tools/widget").unwrap();
    assert_eq!(record.unwrap().version(), "1.0,5.11");
}

#[test]
fn execute_failure_restores_the_snapshot() {
    let (_dir, image, installed) = scratch_image();
    let new = fmri("tools/widget@1.0,5.11");
    let digest = digest_of(b"never delivered");
    image
        .cache_manifest(
            &new,
            &format!(
                "file {} mode=0644 path=etc/widget.conf pkg.size=15\n",
                digest
            ),
        )
        .unwrap();

    // the transport has no content, staging must fail
    let mut transport = MemoryTransport::new();

    let mut plan = ImagePlan::new(image.clone());
    plan.propose(None, Some(new));
    plan.evaluate(&installed, &mut never_cancel()).unwrap();

    let mut bootenv = RecordingBootEnv::default();
    let err = plan
        .execute(&installed, &mut transport, &mut bootenv)
        .unwrap_err();
    assert!(matches!(err, PlanError::Transport(_)));
    assert_eq!(bootenv.events, vec!["snapshot", "restore"]);

    // nothing reached the image or the installed database
    assert!(!image.path().join("etc/widget.conf").exists());
    assert!(installed
        .get_version_installed("tools/widget")
        .unwrap()
        .is_none());
}

#[test]
fn failing_restore_keeps_the_execution_error() {
    let (_dir, image, installed) = scratch_image();
    let new = fmri("tools/widget@1.0,5.11");
    let digest = digest_of(b"never delivered");
    image
        .cache_manifest(
            &new,
            &format!(
                "file {} mode=0644 path=etc/widget.conf pkg.size=15\n",
                digest
            ),
        )
        .unwrap();

    let mut transport = MemoryTransport::new();

    let mut plan = ImagePlan::new(image.clone());
    plan.propose(None, Some(new));
    plan.evaluate(&installed, &mut never_cancel()).unwrap();

    // the rollback itself breaks; the caller still sees why the
    // execution stopped, not why the rollback did
    let mut bootenv = BrokenRestoreBootEnv::default();
    let err = plan
        .execute(&installed, &mut transport, &mut bootenv)
        .unwrap_err();
    assert!(matches!(err, PlanError::Transport(_)));
    assert!(bootenv.restore_attempted);
}

#[test]
fn executing_before_evaluating_is_an_error() {
    let (_dir, image, installed) = scratch_image();
    let mut plan = ImagePlan::new(image);
    let mut transport = MemoryTransport::new();
    let mut bootenv = RecordingBootEnv::default();
    let err = plan
        .execute(&installed, &mut transport, &mut bootenv)
        .unwrap_err();
    assert!(matches!(err, PlanError::InvalidState { .. }));
    assert!(bootenv.events.is_empty());
}
