// This Source Code Form is subject to the terms of
// the Mozilla Public License, v. 2.0. If a copy of the
// MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! FMRI (Fault Management Resource Identifier) implementation
//!
//! An FMRI is a unique identifier for a package in the IPS system.
//! It follows the format: pkg://publisher/package_name@version
//! where:
//! - publisher is optional
//! - version is optional and follows the format: release\[,branch\]\[:timestamp\]
//!   - release is a dot-separated vector of non-negative integers (e.g., 5.11)
//!   - branch is optional and is a dot-separated vector of non-negative integers (e.g., 1)
//!   - timestamp is optional and is an ISO-8601 basic string (e.g., 20200421T195136Z)
//!
//! Versions form a total order: release first, then branch, then
//! timestamp. An absent branch or timestamp sorts before any present
//! one. Dot-separated vectors compare component-wise numerically, and
//! a strict prefix sorts before any extension of itself, so
//! 5.11 < 5.11.1 < 5.12.
//!
//! Examples:
//! - pkg:///sunos/coreutils@5.11,1:20200421T195136Z
//! - pkg://openindiana.org/web/server/nginx@1.18.0,5.11:20200421T195136Z
//! - pkg:/system/library@0.5.11
//! - xvm@0.5.11,2015.0.2.0
//!
//! # Examples
//!
//! ```
//! use libpkg::fmri::{Fmri, Version};
//!
//! let a = Fmri::parse("pkg://openindiana.org/web/server/nginx@1.18.0,5.11:20200421T195136Z").unwrap();
//! let b = Fmri::parse("web/server/nginx@1.19.0,5.11").unwrap();
//!
//! assert_eq!(a.stem(), b.stem());
//! assert!(a.version < b.version);
//! ```

use miette::Diagnostic;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur when parsing an FMRI
#[derive(Debug, Error, Diagnostic, PartialEq)]
pub enum FmriError {
    #[error("invalid FMRI format")]
    #[diagnostic(
        code(pkg::fmri_error::invalid_format),
        help("FMRI should be in the format: [scheme://][publisher/]name[@version]")
    )]
    InvalidFormat,

    #[error("invalid version format")]
    #[diagnostic(
        code(pkg::fmri_error::invalid_version_format),
        help("Version should be in the format: release[,branch][:timestamp]")
    )]
    InvalidVersionFormat,

    #[error("invalid release format: {0:?}")]
    #[diagnostic(
        code(pkg::fmri_error::invalid_release_format),
        help("Release should be a dot-separated vector of integers without leading zeros (e.g., 5.11)")
    )]
    InvalidReleaseFormat(String),

    #[error("invalid branch format: {0:?}")]
    #[diagnostic(
        code(pkg::fmri_error::invalid_branch_format),
        help("Branch should be a dot-separated vector of integers without leading zeros (e.g., 1)")
    )]
    InvalidBranchFormat(String),

    #[error("invalid timestamp format: {0:?}")]
    #[diagnostic(
        code(pkg::fmri_error::invalid_timestamp_format),
        help("Timestamp should be an ISO-8601 basic string (e.g., 20200421T195136Z)")
    )]
    InvalidTimestampFormat(String),
}

/// How [`Version::is_successor`] relates two versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessorMode {
    /// Plain ordering: any strictly greater version is a successor.
    None,
    /// Branded matching for constraints: every component the base
    /// version names must be matched. The base release (and branch,
    /// if present) must be a prefix of the candidate's, and a base
    /// timestamp must match exactly. Absent base components are
    /// wildcards.
    Auto,
}

/// A dot-separated vector of non-negative integers.
///
/// The textual form rejects empty components, non-digit characters
/// and zero-padded components such as "01" (those are the legacy
/// encodings [`Version::clean`] exists to repair).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DotSequence(Vec<u64>);

impl DotSequence {
    pub fn parse(s: &str) -> Result<Self, FmriError> {
        if s.is_empty() {
            return Err(FmriError::InvalidReleaseFormat(s.to_string()));
        }
        let mut components = Vec::new();
        for part in s.split('.') {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(FmriError::InvalidReleaseFormat(s.to_string()));
            }
            if part.len() > 1 && part.starts_with('0') {
                return Err(FmriError::InvalidReleaseFormat(s.to_string()));
            }
            let value = part
                .parse::<u64>()
                .map_err(|_| FmriError::InvalidReleaseFormat(s.to_string()))?;
            components.push(value);
        }
        Ok(DotSequence(components))
    }

    pub fn components(&self) -> &[u64] {
        &self.0
    }

    /// True when every component of `self` equals the corresponding
    /// component of `other`. "5.11" is a subsequence of "5.11.1" but
    /// not of "5.12".
    pub fn is_subsequence(&self, other: &DotSequence) -> bool {
        if self.0.len() > other.0.len() {
            return false;
        }
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }
}

impl PartialOrd for DotSequence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DotSequence {
    fn cmp(&self, other: &Self) -> Ordering {
        // Vec<u64> already compares component-wise with the shorter
        // prefix ordering first.
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for DotSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for c in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", c)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for DotSequence {
    type Err = FmriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DotSequence {
    type Error = FmriError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<DotSequence> for String {
    fn from(d: DotSequence) -> String {
        d.to_string()
    }
}

/// A version component of an FMRI
///
/// A version consists of:
/// - release: a dot-separated vector of integers (e.g., 5.11)
/// - branch: optional, a dot-separated vector of integers (e.g., 1)
/// - timestamp: optional, an ISO-8601 basic string (e.g., 20200421T195136Z)
///
/// Versions are totally ordered (release, then branch, then
/// timestamp; absent components sort before present ones), and the
/// ordering is antisymmetric and transitive.
///
/// # Examples
///
/// ```
/// use libpkg::fmri::Version;
///
/// let old = Version::parse("5.11,1").unwrap();
/// let new = Version::parse("5.11,2").unwrap();
/// assert!(old < new);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// The release component (e.g., 5.11)
    pub release: DotSequence,
    /// The branch component (e.g., 1)
    pub branch: Option<DotSequence>,
    /// The timestamp component (e.g., 20200421T195136Z)
    pub timestamp: Option<String>,
}

impl Version {
    /// Create a new Version with the given release
    pub fn new(release: &str) -> Result<Self, FmriError> {
        Ok(Version {
            release: DotSequence::parse(release)?,
            branch: None,
            timestamp: None,
        })
    }

    /// Create a new Version with the given release and branch
    pub fn with_branch(release: &str, branch: &str) -> Result<Self, FmriError> {
        Ok(Version {
            release: DotSequence::parse(release)?,
            branch: Some(
                DotSequence::parse(branch).map_err(|_| FmriError::InvalidBranchFormat(branch.to_string()))?,
            ),
            timestamp: None,
        })
    }

    /// Parse a version string into a Version
    ///
    /// The version string should be in the format: release\[,branch\]\[:timestamp\]
    pub fn parse(version_str: &str) -> Result<Self, FmriError> {
        // Split by colon to separate the timestamp
        let parts: Vec<&str> = version_str.split(':').collect();
        if parts.len() > 2 {
            return Err(FmriError::InvalidVersionFormat);
        }

        let timestamp = if parts.len() == 2 {
            let timestamp = parts[1];
            if !Self::is_valid_timestamp(timestamp) {
                return Err(FmriError::InvalidTimestampFormat(timestamp.to_string()));
            }
            Some(timestamp.to_string())
        } else {
            None
        };

        // Split the first part by comma to separate release and branch
        let parts: Vec<&str> = parts[0].split(',').collect();
        if parts.len() > 2 {
            return Err(FmriError::InvalidVersionFormat);
        }

        let release = DotSequence::parse(parts[0])
            .map_err(|_| FmriError::InvalidReleaseFormat(parts[0].to_string()))?;

        let branch = if parts.len() == 2 {
            Some(
                DotSequence::parse(parts[1])
                    .map_err(|_| FmriError::InvalidBranchFormat(parts[1].to_string()))?,
            )
        } else {
            None
        };

        Ok(Version {
            release,
            branch,
            timestamp,
        })
    }

    fn is_valid_timestamp(s: &str) -> bool {
        if s.is_empty() {
            return false;
        }
        s.chars()
            .all(|c| c.is_ascii_digit() || c == 'T' || c == 'Z')
    }

    /// Check whether this version succeeds `other` under the given mode.
    ///
    /// `SuccessorMode::None` is plain strict ordering. In
    /// `SuccessorMode::Auto` every component named by `other` must be
    /// matched: its release (and branch, when present) must be a
    /// subsequence of ours and its timestamp, when present, equal.
    /// Components `other` leaves out are treated as wildcards, which
    /// is what lets an incorporation on "5.11" accept "5.11.1" but not
    /// "5.12".
    pub fn is_successor(&self, other: &Version, mode: SuccessorMode) -> bool {
        match mode {
            SuccessorMode::None => self > other,
            SuccessorMode::Auto => {
                if !other.release.is_subsequence(&self.release) {
                    return false;
                }
                if let Some(other_branch) = &other.branch {
                    match &self.branch {
                        Some(branch) => {
                            if !other_branch.is_subsequence(branch) {
                                return false;
                            }
                        }
                        None => return false,
                    }
                }
                if let Some(other_ts) = &other.timestamp {
                    if self.timestamp.as_ref() != Some(other_ts) {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Best-effort normalization of legacy zero-padded version text.
    ///
    /// Strips leading zeros from each numeric component of the
    /// release and branch parts ("2.01.01.38" becomes "2.1.1.38").
    /// On any trouble the input is returned unchanged after a
    /// warning; a later parse will then report the real error. This
    /// is a repair heuristic, not a validator.
    pub fn clean(version_str: &str) -> String {
        let (front, timestamp) = match version_str.split_once(':') {
            Some((front, ts)) => (front, Some(ts)),
            None => (version_str, None),
        };

        let mut cleaned_parts = Vec::new();
        for part in front.split(',') {
            let mut components = Vec::new();
            for comp in part.split('.') {
                if comp.is_empty() || !comp.chars().all(|c| c.is_ascii_digit()) {
                    warn!(version = version_str, "unable to normalize legacy version");
                    return version_str.to_string();
                }
                let trimmed = comp.trim_start_matches('0');
                components.push(if trimmed.is_empty() { "0" } else { trimmed });
            }
            cleaned_parts.push(components.join("."));
        }

        let mut out = cleaned_parts.join(",");
        if let Some(ts) = timestamp {
            out.push(':');
            out.push_str(ts);
        }
        out
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.release
            .cmp(&other.release)
            .then_with(|| self.branch.cmp(&other.branch))
            .then_with(|| self.timestamp.cmp(&other.timestamp))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.release)?;

        if let Some(branch) = &self.branch {
            write!(f, ",{}", branch)?;
        }

        if let Some(timestamp) = &self.timestamp {
            write!(f, ":{}", timestamp)?;
        }

        Ok(())
    }
}

impl FromStr for Version {
    type Err = FmriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Versions persist in their textual form.
impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// An FMRI (Fault Management Resource Identifier)
///
/// An FMRI is a unique identifier for a package in the IPS system.
/// It follows the format: pkg://publisher/package_name@version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fmri {
    /// The scheme (e.g., pkg)
    pub scheme: String,
    /// The publisher (e.g., openindiana.org)
    pub publisher: Option<String>,
    /// The package name (e.g., web/server/nginx)
    pub name: String,
    /// The version
    pub version: Option<Version>,
}

impl Fmri {
    /// Create a new FMRI with the given name
    pub fn new(name: &str) -> Self {
        Fmri {
            scheme: "pkg".to_string(),
            publisher: None,
            name: name.to_string(),
            version: None,
        }
    }

    /// Create a new FMRI with the given name and version
    pub fn with_version(name: &str, version: Version) -> Self {
        Fmri {
            scheme: "pkg".to_string(),
            publisher: None,
            name: name.to_string(),
            version: Some(version),
        }
    }

    /// Create a new FMRI with the given publisher, name, and version
    pub fn with_publisher(publisher: &str, name: &str, version: Option<Version>) -> Self {
        Fmri {
            scheme: "pkg".to_string(),
            publisher: Some(publisher.to_string()),
            name: name.to_string(),
            version,
        }
    }

    /// Get the stem of the FMRI (the package name without version)
    pub fn stem(&self) -> &str {
        &self.name
    }

    /// Get the version of the FMRI as a string
    pub fn version(&self) -> String {
        match &self.version {
            Some(v) => v.to_string(),
            None => String::new(),
        }
    }

    /// A copy of this FMRI carrying a different version.
    ///
    /// FMRIs are treated as immutable values; callers wanting another
    /// version build a modified clone instead of mutating in place.
    pub fn replace_version(&self, version: Version) -> Fmri {
        let mut fmri = self.clone();
        fmri.version = Some(version);
        fmri
    }

    /// Check whether this FMRI succeeds `other` under the given mode.
    ///
    /// The stems must match; a versionless `other` is succeeded by
    /// anything carrying a version.
    pub fn is_successor(&self, other: &Fmri, mode: SuccessorMode) -> bool {
        if self.name != other.name {
            return false;
        }
        match (&self.version, &other.version) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => a.is_successor(b, mode),
        }
    }

    /// Parse an FMRI string into an Fmri
    ///
    /// The FMRI string should be in the format: \[scheme://\]\[publisher/\]name\[@version\]
    pub fn parse(fmri_str: &str) -> Result<Self, FmriError> {
        let mut fmri = Fmri {
            scheme: "pkg".to_string(),
            publisher: None,
            name: String::new(),
            version: None,
        };

        // Split by @ to separate name and version
        let parts: Vec<&str> = fmri_str.split('@').collect();
        if parts.len() > 2 {
            return Err(FmriError::InvalidFormat);
        }

        if parts.len() == 2 {
            let version = Version::parse(parts[1])?;
            fmri.version = Some(version);
        }

        let name_part = parts[0];

        // Check if there's a scheme with a publisher (pkg://publisher/name)
        if let Some(scheme_end) = name_part.find("://") {
            fmri.scheme = name_part[0..scheme_end].to_string();

            let rest = &name_part[scheme_end + 3..];

            if let Some(publisher_end) = rest.find('/') {
                // An empty publisher (pkg:///name) is the anonymous form
                if publisher_end > 0 {
                    fmri.publisher = Some(rest[0..publisher_end].to_string());
                }
                fmri.name = rest[publisher_end + 1..].to_string();
            } else {
                fmri.name = rest.to_string();
            }
        }
        // Check if there's a scheme without a publisher (pkg:/name)
        else if let Some(scheme_end) = name_part.find(":/") {
            fmri.scheme = name_part[0..scheme_end].to_string();
            fmri.name = name_part[scheme_end + 2..].to_string();
        } else {
            fmri.name = name_part.to_string();
        }

        if fmri.name.is_empty() {
            return Err(FmriError::InvalidFormat);
        }

        Ok(fmri)
    }
}

impl fmt::Display for Fmri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // For FMRIs without a publisher, we should use the format pkg:/name
        // For FMRIs with a publisher, we should use the format pkg://publisher/name
        if let Some(publisher) = &self.publisher {
            write!(f, "{}://{}/", self.scheme, publisher)?;
        } else {
            write!(f, "{}:/", self.scheme)?;
        }

        write!(f, "{}", self.name)?;

        if let Some(version) = &self.version {
            write!(f, "@{}", version)?;
        }

        Ok(())
    }
}

impl FromStr for Fmri {
    type Err = FmriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// FMRIs persist in their textual form.
impl Serialize for Fmri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fmri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fmri::parse(&s).map_err(serde::de::Error::custom)
    }
}
