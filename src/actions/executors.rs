//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Filesystem application of actions.
//!
//! Installs read file payloads from a staging directory keyed by
//! digest, so a failed download can never leave a half-written image.
//! Removals are idempotent: removing what is already gone succeeds,
//! and a directory is only removed when empty.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs as unix_fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;
use tracing::{debug, info};

use crate::actions::{Action, ActionKind};

#[derive(Error, Debug, Diagnostic)]
pub enum InstallerError {
    #[error("I/O error while operating on {path}")]
    #[diagnostic(code(pkg::installer_error::io))]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error("Absolute paths are forbidden in actions: {path}")]
    #[diagnostic(
        code(pkg::installer_error::absolute_path_forbidden),
        help("Provide paths relative to the image root")
    )]
    AbsolutePathForbidden { path: String },

    #[error("Path escapes image root via traversal: {rel}")]
    #[diagnostic(
        code(pkg::installer_error::path_outside_image),
        help("Remove '..' components that escape the image root")
    )]
    PathTraversalOutsideImage { rel: String },

    #[error("Action carries no {attr} attribute: {action}")]
    #[diagnostic(code(pkg::installer_error::missing_attribute))]
    MissingAttribute { attr: &'static str, action: String },

    #[error("No staged payload for digest {digest}")]
    #[diagnostic(
        code(pkg::installer_error::missing_payload),
        help("Run the staging phase before applying file actions")
    )]
    MissingPayload { digest: String },
}

pub type Result<T> = std::result::Result<T, InstallerError>;

fn io_err(source: io::Error, path: &Path) -> InstallerError {
    InstallerError::Io {
        source,
        path: path.to_path_buf(),
    }
}

/// Accept strings like "0755" or "755"; fall back to the default on
/// anything unparseable.
fn parse_mode(mode: Option<&str>, default: u32) -> u32 {
    let mode = match mode {
        Some(m) if !m.is_empty() && m != "0" => m,
        _ => return default,
    };
    let trimmed = mode.trim_start_matches('0');
    u32::from_str_radix(if trimmed.is_empty() { "0" } else { trimmed }, 8).unwrap_or(default)
}

/// Join a manifest-provided path (must be relative) under image_root.
/// - Rejects absolute paths
/// - Rejects traversal that would escape the image root
pub fn safe_join(image_root: &Path, rel: &str) -> Result<PathBuf> {
    if rel.is_empty() {
        return Ok(image_root.to_path_buf());
    }
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(InstallerError::AbsolutePathForbidden {
            path: rel.to_string(),
        });
    }

    let mut stack: Vec<PathBuf> = Vec::new();
    for c in rel_path.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => stack.push(PathBuf::from(seg)),
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(InstallerError::PathTraversalOutsideImage {
                        rel: rel.to_string(),
                    });
                }
            }
            // Prefixes shouldn't appear on Unix; treat conservatively
            Component::Prefix(_) | Component::RootDir => {
                return Err(InstallerError::AbsolutePathForbidden {
                    path: rel.to_string(),
                })
            }
        }
    }

    let mut out = PathBuf::from(image_root);
    for seg in stack {
        out.push(seg);
    }
    Ok(out)
}

#[derive(Debug, Default, Clone)]
pub struct ApplyOptions {
    pub dry_run: bool,
}

fn required_attr<'a>(action: &'a Action, attr: &'static str) -> Result<&'a str> {
    action
        .attr(attr)
        .ok_or_else(|| InstallerError::MissingAttribute {
            attr,
            action: action.to_string(),
        })
}

/// Install one action into the image. File payloads are copied from
/// `staging`, where the transfer phase left them under their digest.
///
/// Kinds without a filesystem footprint (set, depend, license, user,
/// group, driver, legacy, signature, unknown) are logged and skipped.
pub fn install_action(
    image_root: &Path,
    staging: &Path,
    action: &Action,
    opts: &ApplyOptions,
) -> Result<()> {
    match &action.kind {
        ActionKind::Dir => install_dir(image_root, action, opts),
        ActionKind::File => install_file(image_root, staging, action, opts),
        ActionKind::Link => install_link(image_root, action, opts),
        ActionKind::Hardlink => install_hardlink(image_root, action, opts),
        kind => {
            debug!(%kind, action = %action, "no filesystem step for action");
            Ok(())
        }
    }
}

/// Replace an existing action's footprint. Links are torn down and
/// recreated; directories and files install over what is there.
pub fn update_action(
    image_root: &Path,
    staging: &Path,
    action: &Action,
    opts: &ApplyOptions,
) -> Result<()> {
    if matches!(action.kind, ActionKind::Link | ActionKind::Hardlink) && !opts.dry_run {
        let path = required_attr(action, "path")?;
        let full = safe_join(image_root, path)?;
        remove_file_if_present(&full)?;
    }
    install_action(image_root, staging, action, opts)
}

/// Remove one action's footprint from the image. Already-absent
/// targets are fine; a non-empty directory is left in place.
pub fn remove_action(image_root: &Path, action: &Action, opts: &ApplyOptions) -> Result<()> {
    match &action.kind {
        ActionKind::Dir => {
            let path = required_attr(action, "path")?;
            let full = safe_join(image_root, path)?;
            info!(?full, "removing directory");
            if opts.dry_run {
                return Ok(());
            }
            match fs::remove_dir(&full) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                // a directory another package still populates stays
                Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => Ok(()),
                Err(e) => Err(io_err(e, &full)),
            }
        }
        ActionKind::File | ActionKind::Link | ActionKind::Hardlink => {
            let path = required_attr(action, "path")?;
            let full = safe_join(image_root, path)?;
            info!(?full, "removing file");
            if opts.dry_run {
                return Ok(());
            }
            remove_file_if_present(&full)
        }
        kind => {
            debug!(%kind, action = %action, "no filesystem step for action removal");
            Ok(())
        }
    }
}

fn remove_file_if_present(full: &Path) -> Result<()> {
    match fs::remove_file(full) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(e, full)),
    }
}

fn install_dir(image_root: &Path, action: &Action, opts: &ApplyOptions) -> Result<()> {
    let path = required_attr(action, "path")?;
    let full = safe_join(image_root, path)?;
    info!(?full, "creating directory");
    if opts.dry_run {
        return Ok(());
    }

    fs::create_dir_all(&full).map_err(|e| io_err(e, &full))?;

    let mode = parse_mode(action.attr("mode"), 0o755);
    let perm = fs::Permissions::from_mode(mode);
    fs::set_permissions(&full, perm).map_err(|e| io_err(e, &full))?;

    Ok(())
}

fn install_file(
    image_root: &Path,
    staging: &Path,
    action: &Action,
    opts: &ApplyOptions,
) -> Result<()> {
    let path = required_attr(action, "path")?;
    let full = safe_join(image_root, path)?;
    ensure_parent(&full, opts)?;

    info!(?full, "installing file");
    if opts.dry_run {
        return Ok(());
    }

    match &action.payload {
        Some(digest) => {
            let staged = staging.join(digest);
            if !staged.exists() {
                return Err(InstallerError::MissingPayload {
                    digest: digest.clone(),
                });
            }
            fs::copy(&staged, &full).map_err(|e| io_err(e, &full))?;
        }
        // payloadless files (e.g. preserved config skeletons) install empty
        None => {
            File::create(&full).map_err(|e| io_err(e, &full))?;
        }
    }

    let mode = parse_mode(action.attr("mode"), 0o644);
    let perm = fs::Permissions::from_mode(mode);
    fs::set_permissions(&full, perm).map_err(|e| io_err(e, &full))?;

    Ok(())
}

fn ensure_parent(full: &Path, opts: &ApplyOptions) -> Result<()> {
    // directories should already be applied, but be robust
    if let Some(parent) = full.parent() {
        if opts.dry_run {
            return Ok(());
        }
        fs::create_dir_all(parent).map_err(|e| io_err(e, parent))?;
    }
    Ok(())
}

fn install_link(image_root: &Path, action: &Action, opts: &ApplyOptions) -> Result<()> {
    let path = required_attr(action, "path")?;
    let target = required_attr(action, "target")?;
    let link_path = safe_join(image_root, path)?;
    ensure_parent(&link_path, opts)?;

    // Symlink targets stay relative so no host path gets embedded.
    if Path::new(target).is_absolute() {
        return Err(InstallerError::AbsolutePathForbidden {
            path: target.to_string(),
        });
    }

    info!(?link_path, target, "creating symlink");
    if opts.dry_run {
        return Ok(());
    }

    remove_file_if_present(&link_path)?;
    unix_fs::symlink(target, &link_path).map_err(|e| io_err(e, &link_path))?;
    Ok(())
}

fn install_hardlink(image_root: &Path, action: &Action, opts: &ApplyOptions) -> Result<()> {
    let path = required_attr(action, "path")?;
    let target = required_attr(action, "target")?;
    let link_path = safe_join(image_root, path)?;
    // hard links must resolve inside the image
    let target_full = safe_join(image_root, target)?;
    ensure_parent(&link_path, opts)?;

    info!(?link_path, ?target_full, "creating hardlink");
    if opts.dry_run {
        return Ok(());
    }

    remove_file_if_present(&link_path)?;
    fs::hard_link(&target_full, &link_path).map_err(|e| io_err(e, &link_path))?;
    Ok(())
}
