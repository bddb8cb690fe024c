//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! The image: a filesystem tree packages are installed into, plus the
//! metadata directory that tracks what is installed there.
//!
//! Layout under the metadata directory:
//!   image.json            image type, variants
//!   installed.redb        installed-package records
//!   cache/manifests/      fetched manifests, one file per FMRI
//!   cache/download/       staged file payloads, named by digest
//!   pkg/<stem>/filters    per-package filter expressions

pub mod installed;

use crate::actions::VariantSet;
use crate::filter::{parse_filter_lines, Filter};
use crate::manifest::Manifest;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Diagnostic)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    #[diagnostic(
        code(pkg::image_error::io),
        help("Check system resources and permissions")
    )]
    IO(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    #[diagnostic(
        code(pkg::image_error::json),
        help("Check the JSON format and try again")
    )]
    Json(#[from] serde_json::Error),

    #[error("Invalid image path: {0}")]
    #[diagnostic(
        code(pkg::image_error::invalid_path),
        help("Provide a valid path for the image")
    )]
    InvalidPath(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Filter(#[from] crate::filter::FilterError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] crate::manifest::ManifestError),

    #[error("no cached manifest for {0}")]
    #[diagnostic(
        code(pkg::image_error::manifest_not_cached),
        help("Fetch the manifest through the transport before evaluating")
    )]
    ManifestNotCached(String),
}

pub type Result<T> = std::result::Result<T, ImageError>;

/// Type of image, either Full (base path of "/") or Partial (attached to a full image)
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum ImageType {
    /// Full image with base path of "/"
    Full,
    /// Partial image attached to a full image
    Partial,
}

/// An image root and its metadata.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Image {
    /// Path to the image
    path: PathBuf,
    /// Type of image (Full or Partial)
    image_type: ImageType,
    /// Image format version
    version: i32,
    /// Variant settings active in this image (arch, zone, debug, ...)
    variants: VariantSet,
}

impl Image {
    /// Creates a new Full image at the specified path
    pub fn new_full<P: Into<PathBuf>>(path: P) -> Image {
        Image {
            path: path.into(),
            image_type: ImageType::Full,
            version: 6,
            variants: VariantSet::default(),
        }
    }

    /// Creates a new Partial image at the specified path
    pub fn new_partial<P: Into<PathBuf>>(path: P) -> Image {
        Image {
            path: path.into(),
            image_type: ImageType::Partial,
            version: 6,
            variants: VariantSet::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn image_type(&self) -> &ImageType {
        &self.image_type
    }

    pub fn variants(&self) -> &VariantSet {
        &self.variants
    }

    pub fn set_variant(&mut self, name: &str, value: &str) {
        self.variants.set(name, value);
    }

    /// Returns the path to the metadata directory for this image
    pub fn metadata_dir(&self) -> PathBuf {
        match self.image_type {
            ImageType::Full => self.path.join("var/pkg"),
            ImageType::Partial => self.path.join(".pkg"),
        }
    }

    pub fn image_json_path(&self) -> PathBuf {
        self.metadata_dir().join("image.json")
    }

    /// Path of the installed-package database.
    pub fn installed_db_path(&self) -> PathBuf {
        self.metadata_dir().join("installed.redb")
    }

    /// Directory holding staged file payloads, keyed by digest.
    pub fn download_dir(&self) -> PathBuf {
        self.metadata_dir().join("cache/download")
    }

    fn manifest_cache_dir(&self) -> PathBuf {
        self.metadata_dir().join("cache/manifests")
    }

    /// Per-package metadata directory. Stems contain slashes, which
    /// are escaped so one package maps to one directory entry.
    fn pkg_dir(&self, stem: &str) -> PathBuf {
        self.metadata_dir()
            .join("pkg")
            .join(stem.replace('/', "%2F"))
    }

    fn filters_path(&self, stem: &str) -> PathBuf {
        self.pkg_dir(stem).join("filters")
    }

    /// Creates the metadata directory tree if it doesn't exist
    pub fn create_metadata_dir(&self) -> Result<()> {
        fs::create_dir_all(self.metadata_dir())?;
        fs::create_dir_all(self.download_dir())?;
        fs::create_dir_all(self.manifest_cache_dir())?;
        Ok(())
    }

    /// Saves the image metadata to the metadata directory
    pub fn save(&self) -> Result<()> {
        self.create_metadata_dir()?;
        let file = File::create(self.image_json_path())?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Loads an image from the specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let full_json = Image::new_full(path).image_json_path();
        let partial_json = Image::new_partial(path).image_json_path();
        let json_path = if full_json.exists() {
            full_json
        } else if partial_json.exists() {
            partial_json
        } else {
            return Err(ImageError::InvalidPath(format!(
                "image metadata not found at {:?} or {:?}",
                full_json, partial_json
            )));
        };

        let file = File::open(&json_path)?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Store a fetched manifest in the cache, keyed by its FMRI text.
    pub fn cache_manifest(&self, fmri: &crate::fmri::Fmri, content: &str) -> Result<()> {
        let dir = self.manifest_cache_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(fmri.to_string().replace('/', "%2F"));
        fs::write(&path, content)?;
        debug!(fmri = %fmri, "cached manifest");
        Ok(())
    }

    /// Load a manifest from the cache.
    pub fn cached_manifest(&self, fmri: &crate::fmri::Fmri) -> Result<Manifest> {
        let path = self
            .manifest_cache_dir()
            .join(fmri.to_string().replace('/', "%2F"));
        if !path.exists() {
            return Err(ImageError::ManifestNotCached(fmri.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(Manifest::parse_string(&content)?)
    }

    /// The filters stored for an installed package; empty when the
    /// package has none on record.
    pub fn stored_filters(&self, stem: &str) -> Result<Vec<Filter>> {
        let path = self.filters_path(stem);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(parse_filter_lines(&fs::read_to_string(&path)?)?)
    }

    /// Rewrite a package's filter record, one expression per line.
    /// An empty set removes the file.
    pub fn store_filters(&self, stem: &str, filters: &[Filter]) -> Result<()> {
        let path = self.filters_path(stem);
        if filters.is_empty() {
            if path.exists() {
                fs::remove_file(&path)?;
            }
            return Ok(());
        }
        fs::create_dir_all(self.pkg_dir(stem))?;
        let mut out = String::new();
        for f in filters {
            out.push_str(&f.to_string());
            out.push('\n');
        }
        fs::write(&path, out)?;
        Ok(())
    }

    /// Filters currently configured for new installs in this image.
    /// Stored at the image level alongside the metadata.
    pub fn image_filters(&self) -> Result<Vec<Filter>> {
        let path = self.metadata_dir().join("filters");
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(parse_filter_lines(&fs::read_to_string(&path)?)?)
    }

    pub fn set_image_filters(&self, filters: &[Filter]) -> Result<()> {
        self.create_metadata_dir()?;
        let path = self.metadata_dir().join("filters");
        let mut out = String::new();
        for f in filters {
            out.push_str(&f.to_string());
            out.push('\n');
        }
        fs::write(&path, out)?;
        Ok(())
    }
}
