//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Package catalog
//!
//! The catalog is the image's view of which package versions exist:
//! publisher -> stem -> ordered version entries, optionally carrying
//! the package's action summary lines. Every mutation appends a
//! timestamped entry to an update log so another catalog (or a remote
//! copy) can catch up incrementally instead of re-reading everything.
//!
//! On disk a catalog is a directory in the legacy layout: a
//! `catalog.attrs` file describing the parts, one part file with the
//! package map, and an update log file, all JSON with SHA-1 content
//! signatures.

use crate::actions::{Action, ActionKind};
use crate::fmri::{Fmri, Version};
use chrono::{DateTime, NaiveDateTime, Utc};
use miette::Diagnostic;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Errors that can occur in catalog operations
#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    #[error("unknown package: {0}")]
    #[diagnostic(
        code(pkg::catalog_error::unknown_package),
        help("The FMRI names a package this catalog has never seen")
    )]
    UnknownPackage(String),

    #[error("{0} carries no version")]
    #[diagnostic(
        code(pkg::catalog_error::versionless_fmri),
        help("Catalog mutations need a fully versioned FMRI")
    )]
    VersionlessFmri(String),

    #[error("invalid pattern: {0}")]
    #[diagnostic(code(pkg::catalog_error::invalid_pattern))]
    InvalidPattern(#[from] regex::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    FmriError(#[from] crate::fmri::FmriError),

    #[error("failed to serialize JSON: {0}")]
    #[diagnostic(
        code(pkg::catalog_error::json_serialize),
        help("This is likely a bug in the code")
    )]
    JsonSerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    #[diagnostic(
        code(pkg::catalog_error::io),
        help("Check system resources and permissions")
    )]
    IoError(#[from] io::Error),
}

const ATTRS_FILE: &str = "catalog.attrs";
const BASE_PART: &str = "catalog.base.C";
const UPDATE_LOG: &str = "update.U";

/// Format a timestamp as an ISO-8601 'basic format' date in UTC.
/// Fixed-width output, so these strings collate chronologically.
pub fn format_iso8601_basic(time: &DateTime<Utc>) -> String {
    format!("{}Z", time.format("%Y%m%dT%H%M%S.%9f"))
}

/// Parse the basic format back; `None` for unrecognized text.
pub fn parse_iso8601_basic(s: &str) -> Option<DateTime<Utc>> {
    let trimmed = s.strip_suffix('Z').unwrap_or(s);
    NaiveDateTime::parse_from_str(trimmed, "%Y%m%dT%H%M%S.%f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn sha1_hex(bytes: &[u8]) -> String {
    use sha1::Digest as _;
    let mut hasher = sha1::Sha1::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Catalog part information in `catalog.attrs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogPartInfo {
    #[serde(rename = "last-modified")]
    pub last_modified: String,

    #[serde(rename = "signature-sha-1", skip_serializing_if = "Option::is_none")]
    pub signature_sha1: Option<String>,
}

/// Catalog attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogAttrs {
    /// Creation timestamp in ISO-8601 'basic format' date in UTC
    pub created: String,

    /// Last modified timestamp in ISO-8601 'basic format' date in UTC
    #[serde(rename = "last-modified")]
    pub last_modified: String,

    /// Number of unique package stems in the catalog
    #[serde(rename = "package-count")]
    pub package_count: usize,

    /// Number of unique package versions in the catalog
    #[serde(rename = "package-version-count")]
    pub package_version_count: usize,

    /// Available catalog parts
    pub parts: HashMap<String, CatalogPartInfo>,

    /// Available update logs
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub updates: HashMap<String, CatalogPartInfo>,

    /// Catalog format version
    pub version: u32,
}

impl CatalogAttrs {
    fn new(now: &str) -> Self {
        CatalogAttrs {
            created: now.to_string(),
            last_modified: now.to_string(),
            package_count: 0,
            package_version_count: 0,
            parts: HashMap::new(),
            updates: HashMap::new(),
            version: 1,
        }
    }
}

/// One known version of a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub version: Version,

    /// Manifest action lines, when the catalog carries them (the
    /// slow-scan search path reads these)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,

    #[serde(rename = "signature-sha-1", skip_serializing_if = "Option::is_none")]
    pub signature_sha1: Option<String>,
}

/// Operation type for catalog updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogOperationType {
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "rename")]
    Rename,
    #[serde(rename = "remove")]
    Remove,
}

/// One delta in the update log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEntry {
    #[serde(rename = "op-type")]
    pub op_type: CatalogOperationType,

    /// Timestamp of the operation in ISO-8601 'basic format' date in UTC
    #[serde(rename = "op-time")]
    pub op_time: String,

    pub publisher: String,

    pub fmri: Fmri,

    /// For renames, the stem the package moved to
    #[serde(rename = "new-name", skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,

    /// Action lines accompanying an add
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CatalogPartFile {
    #[serde(rename = "_SIGNATURE", skip_serializing_if = "Option::is_none")]
    signature: Option<HashMap<String, String>>,
    packages: BTreeMap<String, BTreeMap<String, Vec<CatalogEntry>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct UpdateLogFile {
    #[serde(rename = "_SIGNATURE", skip_serializing_if = "Option::is_none")]
    signature: Option<HashMap<String, String>>,
    updates: Vec<UpdateEntry>,
}

/// The package catalog of an image or publisher origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    attrs: CatalogAttrs,
    /// publisher -> stem -> version entries, ascending by version.
    /// BTreeMaps keep iteration deterministic.
    packages: BTreeMap<String, BTreeMap<String, Vec<CatalogEntry>>>,
    updates: Vec<UpdateEntry>,
}

impl Default for Catalog {
    fn default() -> Self {
        Catalog::new()
    }
}

impl Catalog {
    pub fn new() -> Catalog {
        let now = format_iso8601_basic(&Utc::now());
        Catalog {
            attrs: CatalogAttrs::new(&now),
            packages: BTreeMap::new(),
            updates: Vec::new(),
        }
    }

    pub fn attrs(&self) -> &CatalogAttrs {
        &self.attrs
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        parse_iso8601_basic(&self.attrs.last_modified)
    }

    fn touch(&mut self, now: &str) {
        self.attrs.last_modified = now.to_string();
        self.attrs.package_count = self
            .packages
            .values()
            .map(|stems| stems.len())
            .sum();
        self.attrs.package_version_count = self
            .packages
            .values()
            .flat_map(|stems| stems.values())
            .map(|entries| entries.len())
            .sum();
    }

    /// Record a package version, appending an add entry to the
    /// update log. Re-adding a known version only refreshes its
    /// action lines.
    pub fn add_fmri(
        &mut self,
        publisher: &str,
        fmri: &Fmri,
        actions: Option<Vec<String>>,
    ) -> Result<()> {
        let version = fmri
            .version
            .clone()
            .ok_or_else(|| CatalogError::VersionlessFmri(fmri.to_string()))?;

        let entries = self
            .packages
            .entry(publisher.to_string())
            .or_default()
            .entry(fmri.stem().to_string())
            .or_default();

        if let Some(entry) = entries.iter_mut().find(|e| e.version == version) {
            if actions.is_some() {
                entry.actions = actions;
            }
            return Ok(());
        }

        entries.push(CatalogEntry {
            version,
            actions: actions.clone(),
            signature_sha1: None,
        });
        entries.sort_by(|a, b| a.version.cmp(&b.version));

        let now = format_iso8601_basic(&Utc::now());
        self.updates.push(UpdateEntry {
            op_type: CatalogOperationType::Add,
            op_time: now.clone(),
            publisher: publisher.to_string(),
            fmri: fmri.clone(),
            new_name: None,
            actions,
        });
        self.touch(&now);
        debug!(publisher, fmri = %fmri, "catalog add");
        Ok(())
    }

    /// Remove one package version.
    pub fn remove_fmri(&mut self, publisher: &str, fmri: &Fmri) -> Result<()> {
        let version = fmri
            .version
            .clone()
            .ok_or_else(|| CatalogError::VersionlessFmri(fmri.to_string()))?;

        let stems = self
            .packages
            .get_mut(publisher)
            .ok_or_else(|| CatalogError::UnknownPackage(fmri.to_string()))?;
        let entries = stems
            .get_mut(fmri.stem())
            .ok_or_else(|| CatalogError::UnknownPackage(fmri.to_string()))?;
        let before = entries.len();
        entries.retain(|e| e.version != version);
        if entries.len() == before {
            return Err(CatalogError::UnknownPackage(fmri.to_string()));
        }
        if entries.is_empty() {
            stems.remove(fmri.stem());
        }

        let now = format_iso8601_basic(&Utc::now());
        self.updates.push(UpdateEntry {
            op_type: CatalogOperationType::Remove,
            op_time: now.clone(),
            publisher: publisher.to_string(),
            fmri: fmri.clone(),
            new_name: None,
            actions: None,
        });
        self.touch(&now);
        debug!(publisher, fmri = %fmri, "catalog remove");
        Ok(())
    }

    /// Move every version of a stem to a new name, recording a
    /// rename delta.
    pub fn rename(&mut self, publisher: &str, fmri: &Fmri, new_name: &str) -> Result<()> {
        let stems = self
            .packages
            .get_mut(publisher)
            .ok_or_else(|| CatalogError::UnknownPackage(fmri.to_string()))?;
        let entries = stems
            .remove(fmri.stem())
            .ok_or_else(|| CatalogError::UnknownPackage(fmri.to_string()))?;
        stems.insert(new_name.to_string(), entries);

        let now = format_iso8601_basic(&Utc::now());
        self.updates.push(UpdateEntry {
            op_type: CatalogOperationType::Rename,
            op_time: now.clone(),
            publisher: publisher.to_string(),
            fmri: fmri.clone(),
            new_name: Some(new_name.to_string()),
            actions: None,
        });
        self.touch(&now);
        info!(publisher, from = fmri.stem(), to = new_name, "catalog rename");
        Ok(())
    }

    /// Every FMRI this catalog knows, publishers and stems in
    /// lexical order, versions ascending. The iterator borrows the
    /// catalog and can be restarted by calling again.
    pub fn fmris(&self) -> impl Iterator<Item = Fmri> + '_ {
        self.packages.iter().flat_map(|(publisher, stems)| {
            stems.iter().flat_map(move |(stem, entries)| {
                entries.iter().map(move |entry| {
                    Fmri::with_publisher(publisher, stem, Some(entry.version.clone()))
                })
            })
        })
    }

    /// The newest version entry of a stem, across publishers.
    pub fn newest_version(&self, stem: &str) -> Option<Fmri> {
        self.packages
            .iter()
            .filter_map(|(publisher, stems)| {
                stems.get(stem).and_then(|entries| {
                    entries
                        .last()
                        .map(|e| Fmri::with_publisher(publisher, stem, Some(e.version.clone())))
                })
            })
            .max_by(|a, b| a.version.cmp(&b.version))
    }

    /// Action lines stored for one package version, when present.
    pub fn entry_actions(&self, fmri: &Fmri) -> Option<&[String]> {
        let version = fmri.version.as_ref()?;
        self.packages.values().find_map(|stems| {
            stems.get(fmri.stem()).and_then(|entries| {
                entries
                    .iter()
                    .find(|e| e.version == *version)
                    .and_then(|e| e.actions.as_deref())
            })
        })
    }

    /// Expand glob patterns (`*`, `?`, optional `@version` suffix)
    /// into matching FMRIs, newest version first. A bare name also
    /// matches as a trailing component, so `coreutils` finds
    /// `sunos/coreutils`.
    pub fn get_matching_fmris(&self, patterns: &[&str]) -> Result<Vec<Fmri>> {
        let mut out: Vec<Fmri> = Vec::new();
        for pattern in patterns {
            let (name_pat, version_pat) = match pattern.split_once('@') {
                Some((n, v)) => (n, Some(v)),
                None => (*pattern, None),
            };
            let name_pat = name_pat
                .trim_start_matches("pkg://")
                .trim_start_matches("pkg:/");
            let re = Regex::new(&format!("^(.*/)?{}$", glob_to_regex(name_pat)))?;

            for fmri in self.fmris() {
                if !re.is_match(fmri.stem()) {
                    continue;
                }
                if let Some(vp) = version_pat {
                    if !version_matches(&fmri.version(), vp) {
                        continue;
                    }
                }
                if !out.contains(&fmri) {
                    out.push(fmri);
                }
            }
        }
        // newest first, stems lexical within the same version rank
        out.sort_by(|a, b| {
            a.stem()
                .cmp(b.stem())
                .then_with(|| b.version.cmp(&a.version))
        });
        Ok(out)
    }

    /// All versions of `stem` whose version text matches
    /// `matching_version`, newest first. The pattern takes `*` and `?`
    /// wildcards anywhere; without wildcards it matches by prefix like
    /// the `@version` form of [`Catalog::get_matching_fmris`].
    pub fn get_matching_version_fmris(
        &self,
        stem: &str,
        matching_version: &str,
    ) -> Result<Vec<Fmri>> {
        let wildcard = if matching_version.contains(['*', '?']) {
            Some(Regex::new(&format!("^{}$", glob_to_regex(matching_version)))?)
        } else {
            None
        };
        let mut out: Vec<Fmri> = self
            .fmris()
            .filter(|f| f.stem() == stem)
            .filter(|f| match &wildcard {
                Some(re) => re.is_match(&f.version()),
                None => version_matches(&f.version(), matching_version),
            })
            .collect();
        out.sort_by(|a, b| b.version.cmp(&a.version));
        out.dedup();
        Ok(out)
    }

    /// True when nothing changed after `ts`.
    pub fn up_to_date(&self, ts: &DateTime<Utc>) -> bool {
        match self.last_modified() {
            Some(last) => last <= *ts,
            None => false,
        }
    }

    /// True when the retained update log reaches back to `ts`, i.e. a
    /// consumer last synced at `ts` can catch up from the deltas
    /// alone. An empty log has enough history only for an unmodified
    /// catalog.
    pub fn enough_history(&self, ts: &DateTime<Utc>) -> bool {
        match self.updates.first().and_then(|u| parse_iso8601_basic(&u.op_time)) {
            Some(oldest) => oldest <= *ts,
            None => self.up_to_date(ts),
        }
    }

    /// The deltas recorded strictly after `ts`, oldest first.
    pub fn updates_since(&self, ts: &DateTime<Utc>) -> Vec<&UpdateEntry> {
        let cutoff = format_iso8601_basic(ts);
        self.updates
            .iter()
            .filter(|u| u.op_time.as_str() > cutoff.as_str())
            .collect()
    }

    /// Replay one delta from another catalog's log.
    pub fn apply_update(&mut self, entry: &UpdateEntry) -> Result<()> {
        match entry.op_type {
            CatalogOperationType::Add => {
                self.add_fmri(&entry.publisher, &entry.fmri, entry.actions.clone())
            }
            CatalogOperationType::Remove => self.remove_fmri(&entry.publisher, &entry.fmri),
            CatalogOperationType::Rename => {
                let new_name = entry.new_name.as_deref().unwrap_or(entry.fmri.stem());
                self.rename(&entry.publisher, &entry.fmri, new_name)
            }
        }
    }

    /// Drop update-log entries older than `ts`. After pruning,
    /// [`Catalog::enough_history`] answers false for consumers older
    /// than the cut.
    pub fn prune_history(&mut self, ts: &DateTime<Utc>) {
        let cutoff = format_iso8601_basic(ts);
        self.updates.retain(|u| u.op_time.as_str() >= cutoff.as_str());
    }

    /// Search stored action lines for a token by scanning every
    /// entry. This is the fallback path when no fresh [`SearchIndex`]
    /// exists; it returns the same hit set as the index, though not
    /// necessarily in the same order.
    pub fn search(&self, token: &str) -> Vec<SearchHit> {
        let mut hits = Vec::new();
        for (publisher, stems) in &self.packages {
            for (stem, entries) in stems {
                for entry in entries {
                    let lines = match &entry.actions {
                        Some(lines) => lines,
                        None => continue,
                    };
                    let fmri =
                        Fmri::with_publisher(publisher, stem, Some(entry.version.clone()));
                    for line in lines {
                        collect_hits_from_line(&fmri, line, token, &mut hits);
                    }
                }
            }
        }
        hits
    }

    /// Save the catalog directory: attrs, the base part and the
    /// update log, each with a SHA-1 content signature.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }

        let mut part = CatalogPartFile {
            signature: None,
            packages: self.packages.clone(),
        };
        let part_sig = sha1_hex(&serde_json::to_vec(&part)?);
        part.signature = Some(HashMap::from([("sha-1".to_string(), part_sig.clone())]));
        fs::write(dir.join(BASE_PART), serde_json::to_string_pretty(&part)?)?;

        let mut log = UpdateLogFile {
            signature: None,
            updates: self.updates.clone(),
        };
        let log_sig = sha1_hex(&serde_json::to_vec(&log)?);
        log.signature = Some(HashMap::from([("sha-1".to_string(), log_sig.clone())]));
        fs::write(dir.join(UPDATE_LOG), serde_json::to_string_pretty(&log)?)?;

        let mut attrs = self.attrs.clone();
        attrs.parts.insert(
            BASE_PART.to_string(),
            CatalogPartInfo {
                last_modified: attrs.last_modified.clone(),
                signature_sha1: Some(part_sig),
            },
        );
        attrs.updates.insert(
            UPDATE_LOG.to_string(),
            CatalogPartInfo {
                last_modified: attrs.last_modified.clone(),
                signature_sha1: Some(log_sig),
            },
        );
        fs::write(dir.join(ATTRS_FILE), serde_json::to_string_pretty(&attrs)?)?;
        Ok(())
    }

    /// Load a catalog directory written by [`Catalog::save`]. A
    /// missing directory yields an empty catalog.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Catalog> {
        let dir = dir.as_ref();
        let attrs_path = dir.join(ATTRS_FILE);
        if !attrs_path.exists() {
            return Ok(Catalog::new());
        }
        let attrs: CatalogAttrs = serde_json::from_str(&fs::read_to_string(attrs_path)?)?;

        let part_path = dir.join(BASE_PART);
        let packages = if part_path.exists() {
            let part: CatalogPartFile = serde_json::from_str(&fs::read_to_string(part_path)?)?;
            part.packages
        } else {
            BTreeMap::new()
        };

        let log_path = dir.join(UPDATE_LOG);
        let updates = if log_path.exists() {
            let log: UpdateLogFile = serde_json::from_str(&fs::read_to_string(log_path)?)?;
            log.updates
        } else {
            Vec::new()
        };

        Ok(Catalog {
            attrs,
            packages,
            updates,
        })
    }
}

/// One search result: where a token was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub fmri: Fmri,
    pub action_kind: ActionKind,
    /// Key of the containing action
    pub key: String,
    /// The attribute value the token matched in
    pub value: String,
    /// The full action line
    pub line: String,
}

/// Tokens an action line contributes to the search index, with the
/// value each one came from. Shared by the index builder and the
/// slow-scan path so both find the same hits.
fn line_tokens(line: &str) -> Option<(Action, Vec<(String, String)>)> {
    let action = Action::parse(line).ok()?;
    if !action.kind.indexable() {
        return None;
    }
    let mut tokens = Vec::new();
    for (_, value) in &action.attrs {
        for v in value.iter() {
            tokens.push((v.to_string(), v.to_string()));
            // path components are individually searchable
            if v.contains('/') {
                for comp in v.split('/').filter(|c| !c.is_empty()) {
                    tokens.push((comp.to_string(), v.to_string()));
                }
            }
        }
    }
    Some((action, tokens))
}

fn collect_hits_from_line(fmri: &Fmri, line: &str, token: &str, hits: &mut Vec<SearchHit>) {
    let (action, tokens) = match line_tokens(line) {
        Some(t) => t,
        None => return,
    };
    let mut seen_values: Vec<&String> = Vec::new();
    for (tok, value) in &tokens {
        if tok == token && !seen_values.contains(&value) {
            seen_values.push(value);
            hits.push(SearchHit {
                fmri: fmri.clone(),
                action_kind: action.kind.clone(),
                key: action.key().unwrap_or_default().to_string(),
                value: value.clone(),
                line: line.to_string(),
            });
        }
    }
}

/// A token index over the catalog's stored action lines.
///
/// The index is an explicit value with an explicit staleness check;
/// nothing refreshes it behind the caller's back. Hit sets match the
/// slow path exactly, hit order may differ.
#[derive(Debug, Default, Clone)]
pub struct SearchIndex {
    tokens: BTreeMap<String, Vec<SearchHit>>,
    built_against: String,
}

impl SearchIndex {
    pub fn new() -> SearchIndex {
        SearchIndex::default()
    }

    pub fn is_stale(&self, catalog: &Catalog) -> bool {
        self.built_against != catalog.attrs().last_modified
    }

    /// Rebuild from the catalog when the catalog moved on since the
    /// last build.
    pub fn refresh_if_stale(&mut self, catalog: &Catalog) {
        if !self.is_stale(catalog) {
            return;
        }
        debug!("rebuilding search index");
        let mut tokens: BTreeMap<String, Vec<SearchHit>> = BTreeMap::new();
        for (publisher, stems) in &catalog.packages {
            for (stem, entries) in stems {
                for entry in entries {
                    let lines = match &entry.actions {
                        Some(lines) => lines,
                        None => continue,
                    };
                    let fmri =
                        Fmri::with_publisher(publisher, stem, Some(entry.version.clone()));
                    for line in lines {
                        let (action, line_toks) = match line_tokens(line) {
                            Some(t) => t,
                            None => continue,
                        };
                        let mut seen: Vec<(&String, &String)> = Vec::new();
                        for (tok, value) in &line_toks {
                            if seen.contains(&(tok, value)) {
                                continue;
                            }
                            seen.push((tok, value));
                            tokens.entry(tok.clone()).or_default().push(SearchHit {
                                fmri: fmri.clone(),
                                action_kind: action.kind.clone(),
                                key: action.key().unwrap_or_default().to_string(),
                                value: value.clone(),
                                line: line.to_string(),
                            });
                        }
                    }
                }
            }
        }
        self.tokens = tokens;
        self.built_against = catalog.attrs().last_modified.clone();
    }

    pub fn search(&self, token: &str) -> &[SearchHit] {
        self.tokens.get(token).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c if "\\.+()[]{}^$|".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// A version pattern matches by prefix: `1.18` accepts `1.18,5.11`
/// and `1.18.1` style extensions but not `1.181`.
fn version_matches(version: &str, pattern: &str) -> bool {
    let pattern = pattern.trim_end_matches('*');
    if !version.starts_with(pattern) {
        return false;
    }
    if version.len() == pattern.len() {
        return true;
    }
    matches!(
        version.as_bytes()[pattern.len()],
        b'.' | b',' | b':'
    ) || pattern.is_empty()
}
