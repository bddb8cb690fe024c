//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Package manifests
//!
//! A manifest is the parsed action list of one package version. It is
//! immutable once its content is set; everything the planner needs is
//! derived on demand: the variant-filtered action stream, the
//! directory closure, duplicate detection and the three-way
//! difference against another manifest.

use crate::actions::{Action, ActionKind, VariantSet, parse_actions};
use crate::fmri::Fmri;
use miette::Diagnostic;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::read_to_string;
use std::path::Path;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ManifestError>;

#[derive(Debug, Error, Diagnostic)]
pub enum ManifestError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    ActionError(#[from] crate::actions::ActionError),

    #[error("manifest for {fmri} contains conflicting duplicate actions: {keys:?}")]
    #[diagnostic(
        code(pkg::manifest_error::duplicate_actions),
        help("Two actions of the same kind share a key attribute but differ in content and are not distinguished by variants; the package is broken and cannot be installed.")
    )]
    DuplicateActions { fmri: String, keys: Vec<String> },

    #[error(transparent)]
    #[diagnostic(code(pkg::manifest_error::io))]
    IOError(#[from] std::io::Error),
}

/// Identity of an action within a manifest: its kind plus the value
/// of the kind's key attribute. Actions without a key attribute are
/// identified by their full text, which keeps them diffable without
/// ever colliding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionId {
    pub kind: ActionKind,
    pub key: String,
}

impl ActionId {
    pub fn of(action: &Action) -> ActionId {
        ActionId {
            kind: action.kind.clone(),
            key: match action.key() {
                Some(k) => k.to_string(),
                None => action.to_string(),
            },
        }
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

/// The result of diffing two manifests: pairs of (old, new) actions.
///
/// `added` pairs have no old action, `removed` pairs no new one;
/// `changed` carries both. Identical actions appear in none of the
/// lists.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManifestDifference {
    pub added: Vec<(Option<Action>, Action)>,
    pub changed: Vec<(Action, Action)>,
    pub removed: Vec<(Action, Option<Action>)>,
}

impl ManifestDifference {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// A parsed package manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub fmri: Option<Fmri>,
    pub actions: Vec<Action>,
}

impl Manifest {
    pub fn new() -> Manifest {
        Manifest::default()
    }

    /// Parse manifest text. The package FMRI is taken from the
    /// `pkg.fmri` set action when present.
    pub fn parse_string(content: &str) -> Result<Manifest> {
        let actions = parse_actions(content)?;
        let fmri = actions
            .iter()
            .filter(|a| a.kind == ActionKind::Set && a.attr("name") == Some("pkg.fmri"))
            .find_map(|a| a.attr("value").and_then(|v| Fmri::parse(v).ok()));
        Ok(Manifest { fmri, actions })
    }

    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Manifest> {
        let content = read_to_string(path)?;
        Manifest::parse_string(&content)
    }

    /// The value of a `set` attribute action, e.g. `pkg.summary`.
    pub fn get_attr(&self, name: &str) -> Option<&str> {
        self.actions
            .iter()
            .filter(|a| a.kind == ActionKind::Set && a.attr("name") == Some(name))
            .find_map(|a| a.attr("value"))
    }

    /// The actions applicable under the given variant settings.
    pub fn gen_actions<'a>(
        &'a self,
        variants: &'a VariantSet,
    ) -> impl Iterator<Item = &'a Action> {
        self.actions.iter().filter(move |a| a.included(variants))
    }

    /// Groups of actions that share an [`ActionId`] but differ in
    /// content without being variant-differentiated. A non-empty
    /// result means the package can never be installed correctly.
    pub fn duplicates(&self, variants: &VariantSet) -> Vec<ActionId> {
        let mut seen: BTreeMap<ActionId, &Action> = BTreeMap::new();
        let mut broken: BTreeSet<ActionId> = BTreeSet::new();
        for action in self.gen_actions(variants) {
            let id = ActionId::of(action);
            match seen.get(&id) {
                Some(first) if *first != action => {
                    broken.insert(id);
                }
                Some(_) => {}
                None => {
                    seen.insert(id, action);
                }
            }
        }
        broken.into_iter().collect()
    }

    /// Explicit directories plus the parent directories of every
    /// pathed action, under the given variants. Paths are relative to
    /// the image root.
    pub fn get_directories(&self, variants: &VariantSet) -> BTreeSet<String> {
        let mut dirs = BTreeSet::new();
        for action in self.gen_actions(variants) {
            let path = match action.kind {
                ActionKind::Dir => action.attr("path"),
                ActionKind::File | ActionKind::Link | ActionKind::Hardlink => {
                    // only the parent chain, the leaf is not a directory
                    match action.attr("path") {
                        Some(p) => {
                            expand_parent_dirs(p, &mut dirs);
                            None
                        }
                        None => None,
                    }
                }
                _ => None,
            };
            if let Some(p) = path {
                let p = p.trim_end_matches('/');
                if !p.is_empty() {
                    dirs.insert(p.to_string());
                    expand_parent_dirs(p, &mut dirs);
                }
            }
        }
        dirs
    }

    /// Diff this manifest (the origin) against `new` (the
    /// destination).
    ///
    /// Actions are matched by [`ActionId`]; matched-but-different
    /// pairs land in `changed`, license actions always do (their
    /// payload can change without the action text changing). Removed
    /// pairs are sorted by key descending so contained objects come
    /// before their directories; added and changed ascending for the
    /// opposite reason.
    pub fn difference(
        &self,
        new: &Manifest,
        old_variants: &VariantSet,
        new_variants: &VariantSet,
    ) -> Result<ManifestDifference> {
        let dups = new.duplicates(new_variants);
        if !dups.is_empty() {
            return Err(ManifestError::DuplicateActions {
                fmri: new
                    .fmri
                    .as_ref()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "<unknown>".to_string()),
                keys: dups.iter().map(|d| d.to_string()).collect(),
            });
        }

        let old_map: BTreeMap<ActionId, &Action> = self
            .gen_actions(old_variants)
            .map(|a| (ActionId::of(a), a))
            .collect();
        let new_map: BTreeMap<ActionId, &Action> = new
            .gen_actions(new_variants)
            .map(|a| (ActionId::of(a), a))
            .collect();

        let mut diff = ManifestDifference::default();

        for (id, new_action) in &new_map {
            match old_map.get(id) {
                None => diff.added.push((None, (*new_action).clone())),
                Some(old_action) => {
                    if *old_action != *new_action || id.kind == ActionKind::License {
                        diff.changed
                            .push(((*old_action).clone(), (*new_action).clone()));
                    }
                }
            }
        }
        for (id, old_action) in old_map.iter().rev() {
            if !new_map.contains_key(id) {
                diff.removed.push(((*old_action).clone(), None));
            }
        }

        Ok(diff)
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for action in &self.actions {
            writeln!(f, "{}", action)?;
        }
        Ok(())
    }
}

/// All strict ancestors of `path` (relative, slash-separated),
/// inserted into `dirs`.
/// Closure of a path set under "parent of": every given path plus all
/// of its ancestor directories.
pub fn expand_dirs<I, S>(paths: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut dirs = BTreeSet::new();
    for path in paths {
        let path = path.as_ref().trim_end_matches('/');
        if path.is_empty() {
            continue;
        }
        dirs.insert(path.to_string());
        expand_parent_dirs(path, &mut dirs);
    }
    dirs
}

fn expand_parent_dirs(path: &str, dirs: &mut BTreeSet<String>) {
    let path = path.trim_end_matches('/');
    let mut idx = 0;
    while let Some(pos) = path[idx..].find('/') {
        let end = idx + pos;
        if end > 0 {
            dirs.insert(path[..end].to_string());
        }
        idx = end + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(text: &str) -> Manifest {
        Manifest::parse_string(text).unwrap()
    }

    fn no_variants() -> VariantSet {
        VariantSet::new()
    }

    const FOO_1_0: &str = "\
set name=pkg.fmri value=pkg:/foo@1.0
set name=pkg.summary value=\"a test package\"
dir group=bin mode=0755 owner=root path=usr/bin
file 1234 group=bin mode=0555 owner=root path=usr/bin/foo pkg.size=100
";

    const FOO_1_1: &str = "\
set name=pkg.fmri value=pkg:/foo@1.1
set name=pkg.summary value=\"a test package\"
dir group=bin mode=0755 owner=root path=usr/bin
file 5678 group=bin mode=0555 owner=root path=usr/bin/foo pkg.size=120
file 9abc group=bin mode=0555 owner=root path=usr/bin/foo2 pkg.size=50
";

    #[test]
    fn test_parse_extracts_fmri() {
        let m = manifest(FOO_1_0);
        assert_eq!(m.fmri.as_ref().unwrap().stem(), "foo");
        assert_eq!(m.get_attr("pkg.summary"), Some("a test package"));
        assert_eq!(m.actions.len(), 4);
    }

    #[test]
    fn test_display_round_trip() {
        let m = manifest(FOO_1_0);
        let again = manifest(&m.to_string());
        assert_eq!(m, again);
    }

    #[test]
    fn test_duplicates() {
        let clean = manifest(FOO_1_0);
        assert!(clean.duplicates(&no_variants()).is_empty());

        // same path, conflicting modes, no variants: broken
        let broken = manifest(
            "dir mode=0755 owner=root path=usr\ndir mode=0700 owner=root path=usr\n",
        );
        let dups = broken.duplicates(&no_variants());
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].key, "usr");

        // byte-identical repeats are harmless
        let repeated = manifest("dir mode=0755 owner=root path=usr\ndir mode=0755 owner=root path=usr\n");
        assert!(repeated.duplicates(&no_variants()).is_empty());

        // variant-differentiated twins are fine too
        let twins = manifest(
            "file a path=usr/lib/libc.so variant.arch=i386\nfile b path=usr/lib/libc.so variant.arch=sparc\n",
        );
        let mut i386 = VariantSet::new();
        i386.set("variant.arch", "i386");
        assert!(twins.duplicates(&i386).is_empty());
        // with no variant configured both apply and they conflict
        assert_eq!(twins.duplicates(&no_variants()).len(), 1);
    }

    #[test]
    fn test_variant_filtering() {
        let m = manifest(
            "file a path=usr/lib/libc.so variant.arch=i386\nfile b path=kernel/genunix variant.arch=sparc\ndir path=usr mode=0755\n",
        );
        let mut i386 = VariantSet::new();
        i386.set("variant.arch", "i386");
        let kept: Vec<_> = m.gen_actions(&i386).collect();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|a| a.attr("path") != Some("kernel/genunix")));
    }

    #[test]
    fn test_get_directories() {
        let m = manifest(FOO_1_0);
        let dirs = m.get_directories(&no_variants());
        assert!(dirs.contains("usr"));
        assert!(dirs.contains("usr/bin"));
        assert!(!dirs.contains("usr/bin/foo"));

        let deep = manifest("file x path=a/b/c/d\n");
        let dirs = deep.get_directories(&no_variants());
        assert_eq!(
            dirs.into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "a/b".to_string(), "a/b/c".to_string()]
        );
    }

    #[test]
    fn test_expand_dirs() {
        let dirs = expand_dirs(["var/pkg", "usr/bin/", ""]);
        assert_eq!(
            dirs.into_iter().collect::<Vec<_>>(),
            vec![
                "usr".to_string(),
                "usr/bin".to_string(),
                "var".to_string(),
                "var/pkg".to_string()
            ]
        );
    }

    #[test]
    fn test_difference_self_is_empty() {
        let m = manifest(FOO_1_0);
        let diff = m.difference(&m, &no_variants(), &no_variants()).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_difference_install_update_remove() {
        let old = manifest(FOO_1_0);
        let new = manifest(FOO_1_1);

        let diff = old.difference(&new, &no_variants(), &no_variants()).unwrap();

        // foo2 and the new pkg.fmri value are added or changed
        let added_keys: Vec<_> = diff
            .added
            .iter()
            .filter_map(|(_, a)| a.key().map(str::to_string))
            .collect();
        assert_eq!(added_keys, vec!["usr/bin/foo2".to_string()]);

        let changed_keys: Vec<_> = diff
            .changed
            .iter()
            .map(|(old, _)| ActionId::of(old).key)
            .collect();
        assert!(changed_keys.contains(&"usr/bin/foo".to_string()));
        assert!(changed_keys.contains(&"pkg.fmri".to_string()));

        assert!(diff.removed.is_empty());

        // downgrade direction: foo2 goes away
        let diff = new.difference(&old, &no_variants(), &no_variants()).unwrap();
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].0.key(), Some("usr/bin/foo2"));
    }

    #[test]
    fn test_difference_removal_order_is_depth_first() {
        let old = manifest(
            "dir path=a mode=0755\ndir path=a/b mode=0755\nfile x path=a/b/c\n",
        );
        let new = manifest("set name=pkg.fmri value=pkg:/empty@1.0\n");
        let diff = old.difference(&new, &no_variants(), &no_variants()).unwrap();
        let removed: Vec<_> = diff
            .removed
            .iter()
            .filter_map(|(a, _)| a.attr("path").map(str::to_string))
            .collect();
        // files sort after dirs within the same kind ordering, but
        // paths themselves run deepest-first within a kind
        let dirs_only: Vec<_> = removed
            .iter()
            .filter(|p| p.len() <= 3)
            .cloned()
            .collect();
        assert_eq!(dirs_only, vec!["a/b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_difference_rejects_duplicates_in_destination() {
        let old = manifest(FOO_1_0);
        let broken = manifest(
            "dir mode=0755 path=usr\ndir mode=0700 path=usr\n",
        );
        let err = old
            .difference(&broken, &no_variants(), &no_variants())
            .unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateActions { .. }));
    }

    #[test]
    fn test_license_always_changes() {
        let text = "license abcd license=BSD\n";
        let m = manifest(text);
        let diff = m.difference(&m, &no_variants(), &no_variants()).unwrap();
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].0.kind, ActionKind::License);
    }
}
