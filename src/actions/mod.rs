//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

// Source https://docs.oracle.com/cd/E23824_01/html/E21796/pkg-5.html

//! Package actions
//!
//! Actions are the unit a manifest is made of: one line of text, an
//! action name followed by key=value attributes (and, for payload
//! carrying actions, a leading content hash). All actions share one
//! representation, [`Action`], a kind plus an attribute map; what a
//! kind can do is described by the capability methods on
//! [`ActionKind`] rather than by per-kind types, so manifests can be
//! diffed and ordered uniformly.

pub mod executors;

use crate::fmri::{Fmri, Version};
use miette::Diagnostic;
use pest::Parser;
use pest_derive::Parser;
use std::collections::BTreeMap;
use std::fmt;
use std::result::Result as StdResult;
use std::str::FromStr;
use strum::EnumString;
use thiserror::Error;
use tracing::warn;

pub type Result<T> = StdResult<T, ActionError>;

#[derive(Debug, Error, Diagnostic)]
pub enum ActionError {
    #[error("value {0} is not a boolean")]
    #[diagnostic(
        code(pkg::action_error::invalid_boolean),
        help("Boolean values must be 'true', 'false', 't', or 'f'.")
    )]
    NotBooleanValue(String),

    #[error("action has no {attr} attribute: {action}")]
    #[diagnostic(
        code(pkg::action_error::missing_key_attribute),
        help("Every action must carry its key attribute (e.g. path= for filesystem actions).")
    )]
    MissingKeyAttribute { attr: &'static str, action: String },

    #[error("depend action carries no usable fmri: {0}")]
    #[diagnostic(code(pkg::action_error::invalid_dependency))]
    InvalidDependency(String),

    #[error("no action found in line: {0}")]
    #[diagnostic(code(pkg::action_error::empty_line))]
    EmptyLine(String),

    #[error(transparent)]
    #[diagnostic(code(pkg::action_error::io))]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(code(pkg::action_error::parser))]
    ParserError(#[from] Box<pest::error::Error<Rule>>),
}

impl From<pest::error::Error<Rule>> for ActionError {
    fn from(e: pest::error::Error<Rule>) -> Self {
        ActionError::ParserError(Box::new(e))
    }
}

#[derive(Parser)]
#[grammar = "actions/manifest.pest"]
struct ManifestParser;

/// The closed set of action kinds.
///
/// Unrecognized names are preserved as [`ActionKind::Unknown`] so a
/// manifest written by a newer producer still round-trips; such
/// actions carry no capabilities and are skipped by the executors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ActionKind {
    Set,
    Dir,
    File,
    Link,
    Hardlink,
    Depend,
    License,
    Legacy,
    User,
    Group,
    Driver,
    Signature,
    #[strum(default)]
    Unknown(String),
}

impl Default for ActionKind {
    fn default() -> Self {
        ActionKind::Unknown(String::new())
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Set => "set",
            ActionKind::Dir => "dir",
            ActionKind::File => "file",
            ActionKind::Link => "link",
            ActionKind::Hardlink => "hardlink",
            ActionKind::Depend => "depend",
            ActionKind::License => "license",
            ActionKind::Legacy => "legacy",
            ActionKind::User => "user",
            ActionKind::Group => "group",
            ActionKind::Driver => "driver",
            ActionKind::Signature => "signature",
            ActionKind::Unknown(name) => name,
        };
        write!(f, "{}", s)
    }
}

impl ActionKind {
    /// The attribute that identifies an action of this kind within a
    /// manifest. Two actions of the same kind with the same key value
    /// describe the same object.
    pub fn key_attr(&self) -> Option<&'static str> {
        match self {
            ActionKind::Set => Some("name"),
            ActionKind::Dir | ActionKind::File | ActionKind::Link | ActionKind::Hardlink => {
                Some("path")
            }
            ActionKind::Depend => Some("fmri"),
            ActionKind::License => Some("license"),
            ActionKind::Legacy => Some("pkg"),
            ActionKind::User => Some("username"),
            ActionKind::Group => Some("groupname"),
            ActionKind::Driver => Some("name"),
            ActionKind::Signature => Some("value"),
            ActionKind::Unknown(_) => None,
        }
    }

    /// Whether executing an install of this action touches the
    /// filesystem.
    pub fn installable(&self) -> bool {
        matches!(
            self,
            ActionKind::Dir | ActionKind::File | ActionKind::Link | ActionKind::Hardlink
        )
    }

    /// Whether removal of this action touches the filesystem.
    pub fn removable(&self) -> bool {
        self.installable()
    }

    /// Whether the installed result can be verified against the
    /// action (content hash, link target).
    pub fn verifiable(&self) -> bool {
        matches!(
            self,
            ActionKind::File | ActionKind::Link | ActionKind::Hardlink
        )
    }

    /// Whether the action's attributes feed the catalog token index.
    pub fn indexable(&self) -> bool {
        matches!(
            self,
            ActionKind::Set
                | ActionKind::File
                | ActionKind::Dir
                | ActionKind::Link
                | ActionKind::Hardlink
                | ActionKind::Depend
        )
    }

    /// Execution ordering class: directories before files before
    /// link-like actions, everything non-filesystem last.
    pub fn order_class(&self) -> u8 {
        match self {
            ActionKind::Dir => 0,
            ActionKind::File => 1,
            ActionKind::Link | ActionKind::Hardlink => 2,
            _ => 3,
        }
    }
}

/// A single attribute value; repeated `key=value` tokens collapse
/// into the `Many` form, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    One(String),
    Many(Vec<String>),
}

impl AttrValue {
    pub fn first(&self) -> &str {
        match self {
            AttrValue::One(v) => v,
            AttrValue::Many(vs) => vs.first().map(String::as_str).unwrap_or(""),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            AttrValue::One(v) => std::slice::from_ref(v),
            AttrValue::Many(vs) => vs,
        };
        slice.iter().map(String::as_str)
    }

    fn push(&mut self, value: String) {
        match self {
            AttrValue::One(first) => {
                *self = AttrValue::Many(vec![std::mem::take(first), value]);
            }
            AttrValue::Many(vs) => vs.push(value),
        }
    }
}

/// Dependency flavors carried by depend actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DependType {
    Require,
    Optional,
    Exclude,
    Incorporate,
    Conditional,
    Group,
    Origin,
    #[strum(serialize = "require-any")]
    RequireAny,
}

/// One manifest line: an action kind, an optional leading payload
/// hash, and the attribute map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Action {
    pub kind: ActionKind,
    /// Content hash for payload-carrying actions (file, license).
    pub payload: Option<String>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Action {
        Action {
            kind,
            payload: None,
            attrs: BTreeMap::new(),
        }
    }

    /// First value of an attribute, if present.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(|v| v.first())
    }

    /// All values of an attribute.
    pub fn attr_values(&self, name: &str) -> impl Iterator<Item = &str> {
        self.attrs.get(name).into_iter().flat_map(|v| v.iter())
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self.attrs.get_mut(name) {
            Some(existing) => existing.push(value.to_string()),
            None => {
                self.attrs
                    .insert(name.to_string(), AttrValue::One(value.to_string()));
            }
        }
    }

    /// The value of this action's key attribute.
    pub fn key(&self) -> Option<&str> {
        self.kind.key_attr().and_then(|attr| self.attr(attr))
    }

    /// Like [`Action::key`] but an error when absent, carrying the
    /// serialized action for diagnostics.
    pub fn require_key(&self) -> Result<&str> {
        let attr = self.kind.key_attr().unwrap_or("name");
        self.attr(attr).ok_or_else(|| ActionError::MissingKeyAttribute {
            attr,
            action: self.to_string(),
        })
    }

    /// The variant tags on this action (`variant.*` attributes),
    /// keyed by full attribute name.
    pub fn variants(&self) -> BTreeMap<&str, &str> {
        self.attrs
            .iter()
            .filter(|(k, _)| k.starts_with("variant."))
            .map(|(k, v)| (k.as_str(), v.first()))
            .collect()
    }

    /// Whether this action applies under the given variant settings.
    /// An action is excluded only by a variant tag whose value
    /// differs from the image's configured value; untagged actions
    /// and unconfigured variants always apply.
    pub fn included(&self, variants: &VariantSet) -> bool {
        self.variants().iter().all(|(name, value)| {
            match variants.get(name) {
                Some(configured) => configured == *value,
                None => true,
            }
        })
    }

    /// For depend actions, the dependency type and target FMRI.
    ///
    /// Versions in dependency FMRIs sometimes still carry legacy
    /// zero-padded components; those are passed through
    /// [`Version::clean`] before parsing.
    pub fn depend_info(&self) -> Result<Option<(DependType, Fmri)>> {
        if self.kind != ActionKind::Depend {
            return Ok(None);
        }
        let fmri_str = self
            .attr("fmri")
            .ok_or_else(|| ActionError::InvalidDependency(self.to_string()))?;
        let dep_type = self
            .attr("type")
            .and_then(|t| DependType::from_str(t).ok())
            .unwrap_or(DependType::Require);

        let cleaned = match fmri_str.split_once('@') {
            Some((name, version)) => format!("{}@{}", name, Version::clean(version)),
            None => fmri_str.to_string(),
        };
        match Fmri::parse(&cleaned) {
            Ok(fmri) => Ok(Some((dep_type, fmri))),
            Err(err) => {
                warn!(fmri = fmri_str, %err, "unparseable dependency fmri");
                Err(ActionError::InvalidDependency(self.to_string()))
            }
        }
    }

    /// Size in bytes of the payload this action would transfer, per
    /// its pkg.size attribute.
    pub fn payload_size(&self) -> u64 {
        self.attr("pkg.size")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// Parse a single action line.
    pub fn parse(line: &str) -> Result<Action> {
        let mut manifest = parse_actions(line)?;
        manifest
            .pop()
            .ok_or_else(|| ActionError::EmptyLine(line.to_string()))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(payload) = &self.payload {
            write!(f, " {}", payload)?;
        }
        for (key, value) in &self.attrs {
            for v in value.iter() {
                if v.is_empty() || v.contains(' ') || v.contains('\t') || v.contains('"') {
                    write!(f, " {}=\"{}\"", key, v.replace('\\', "\\\\").replace('"', "\\\""))?;
                } else {
                    write!(f, " {}={}", key, v)?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for Action {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Action> {
        Action::parse(s)
    }
}

/// The variant settings of an image (e.g. `variant.arch` = `i386`).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VariantSet(BTreeMap<String, String>);

impl VariantSet {
    pub fn new() -> VariantSet {
        VariantSet::default()
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.0.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// Parse a block of manifest text into actions, in file order.
/// Comments and blank lines are skipped; a trailing backslash
/// continues a line.
pub fn parse_actions(content: &str) -> Result<Vec<Action>> {
    let mut actions = Vec::new();

    let pairs = ManifestParser::parse(Rule::manifest, content)?;

    for p in pairs {
        if p.as_rule() != Rule::manifest {
            continue;
        }
        for element in p.into_inner() {
            match element.as_rule() {
                Rule::action => {
                    let mut act = Action::default();
                    for part in element.into_inner() {
                        match part.as_rule() {
                            Rule::action_name => {
                                // EnumString's default variant makes this infallible
                                act.kind = ActionKind::from_str(part.as_str())
                                    .unwrap_or_else(|_| {
                                        ActionKind::Unknown(part.as_str().to_string())
                                    });
                            }
                            Rule::payload => {
                                act.payload = Some(part.as_str().to_string());
                            }
                            Rule::property => {
                                let mut key = String::new();
                                let mut value = String::new();
                                for prop in part.into_inner() {
                                    match prop.as_rule() {
                                        Rule::property_name => {
                                            key = prop.as_str().to_string();
                                        }
                                        Rule::property_value => {
                                            value = unquote(prop.as_str());
                                        }
                                        _ => {}
                                    }
                                }
                                act.set_attr(&key, &value);
                            }
                            _ => {}
                        }
                    }
                    actions.push(act);
                }
                _ => {}
            }
        }
    }

    Ok(actions)
}

fn unquote(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        let inner = &raw[1..raw.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some(escaped) => out.push(escaped),
                    None => out.push('\\'),
                }
            } else {
                out.push(c);
            }
        }
        out
    } else {
        raw.to_string()
    }
}

pub fn string_to_bool(orig: &str) -> Result<bool> {
    match &String::from(orig).trim().to_lowercase()[..] {
        "true" | "t" => Ok(true),
        "false" | "f" => Ok(false),
        _ => Err(ActionError::NotBooleanValue(orig.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn parse_one(line: &str) -> Action {
        Action::parse(line).unwrap()
    }

    #[test]
    fn test_parse_set_action() {
        let act = parse_one("set name=pkg.summary value=\"GNU core utilities\"");
        assert_eq!(act.kind, ActionKind::Set);
        assert_eq!(act.attr("name"), Some("pkg.summary"));
        assert_eq!(act.attr("value"), Some("GNU core utilities"));
        assert_eq!(act.key(), Some("pkg.summary"));
    }

    #[test]
    fn test_parse_file_action_with_payload() {
        let act = parse_one(
            "file 1234abcd path=usr/bin/ls owner=root group=bin mode=0555 pkg.size=18600",
        );
        assert_eq!(act.kind, ActionKind::File);
        assert_eq!(act.payload.as_deref(), Some("1234abcd"));
        assert_eq!(act.key(), Some("usr/bin/ls"));
        assert_eq!(act.payload_size(), 18600);
    }

    #[test]
    fn test_parse_multi_valued_attribute() {
        let act = parse_one("set name=pkg.classification value=office value=email");
        assert_eq!(
            act.attrs.get("value"),
            Some(&AttrValue::Many(vec![
                "office".to_string(),
                "email".to_string()
            ]))
        );
        assert_eq!(act.attr("value"), Some("office"));
        let values: Vec<_> = act.attr_values("value").collect();
        assert_eq!(values, vec!["office", "email"]);
    }

    #[test]
    fn test_parse_comments_and_continuations() {
        let text = "# a comment\nset name=pkg.fmri \\\n    value=pkg:/web/server/nginx@1.18.0\n\ndir path=usr mode=0755\n";
        let actions = parse_actions(text).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].attr("value"), Some("pkg:/web/server/nginx@1.18.0"));
        assert_eq!(actions[1].kind, ActionKind::Dir);
    }

    #[test]
    fn test_unknown_action_round_trips() {
        let act = parse_one("mediator name=java version=1.8");
        assert_eq!(act.kind, ActionKind::Unknown("mediator".to_string()));
        assert_eq!(act.key(), None);
        assert_eq!(act.to_string(), "mediator name=java version=1.8");
    }

    #[test]
    fn test_display_round_trip() {
        let lines = [
            "dir group=bin mode=0755 owner=root path=usr/bin",
            "file 1234abcd mode=0555 path=usr/bin/ls pkg.size=18600",
            "set name=pkg.summary value=\"GNU core utilities\"",
            "set name=pkg.classification value=email value=office",
            "link path=usr/bin/vi target=../has/a/deep/target",
            "depend fmri=pkg:/system/library@0.5.11 type=require",
        ];
        for line in lines {
            let act = parse_one(line);
            assert_eq!(act.to_string(), line);
            // And a second pass is identical
            assert_eq!(parse_one(&act.to_string()), act);
        }
    }

    #[test]
    fn test_quoted_value_with_escapes() {
        let act = parse_one(r#"set name=pkg.summary value="say \"hi\" now""#);
        assert_eq!(act.attr("value"), Some(r#"say "hi" now"#));
        assert_eq!(parse_one(&act.to_string()), act);
    }

    #[test]
    fn test_variants() {
        let act = parse_one("file abc path=usr/lib/libfoo.so variant.arch=i386");
        assert_eq!(
            act.variants(),
            btreemap! {"variant.arch" => "i386"}
        );

        let mut sparc = VariantSet::new();
        sparc.set("variant.arch", "sparc");
        let mut i386 = VariantSet::new();
        i386.set("variant.arch", "i386");
        let unconfigured = VariantSet::new();

        assert!(!act.included(&sparc));
        assert!(act.included(&i386));
        assert!(act.included(&unconfigured));
    }

    #[test]
    fn test_depend_info() {
        let act = parse_one("depend fmri=pkg:/system/library@0.5.11 type=require");
        let (dep_type, fmri) = act.depend_info().unwrap().unwrap();
        assert_eq!(dep_type, DependType::Require);
        assert_eq!(fmri.stem(), "system/library");

        // legacy zero-padded versions are repaired on the way in
        let act = parse_one("depend fmri=pkg:/SUNWzlib@0.5.011 type=incorporate");
        let (dep_type, fmri) = act.depend_info().unwrap().unwrap();
        assert_eq!(dep_type, DependType::Incorporate);
        assert_eq!(fmri.version().as_str(), "0.5.11");

        // non-depend actions yield nothing
        let act = parse_one("dir path=usr");
        assert!(act.depend_info().unwrap().is_none());

        // a depend without an fmri is an error
        let act = parse_one("depend type=require");
        assert!(act.depend_info().is_err());
    }

    #[test]
    fn test_key_attrs() {
        assert_eq!(parse_one("dir path=usr").key(), Some("usr"));
        assert_eq!(parse_one("user username=nginx uid=80").key(), Some("nginx"));
        assert_eq!(parse_one("group groupname=www gid=80").key(), Some("www"));
        assert_eq!(parse_one("driver name=audio").key(), Some("audio"));
        assert_eq!(parse_one("legacy pkg=SUNWcs").key(), Some("SUNWcs"));
        assert_eq!(
            parse_one("license lic_OpenSSL license=\"OpenSSL License\"").key(),
            Some("OpenSSL License")
        );
    }

    #[test]
    fn test_capabilities() {
        assert!(ActionKind::Dir.installable());
        assert!(ActionKind::File.verifiable());
        assert!(!ActionKind::Set.installable());
        assert!(ActionKind::Set.indexable());
        assert!(!ActionKind::License.indexable());
        assert!(ActionKind::Dir.order_class() < ActionKind::File.order_class());
        assert!(ActionKind::File.order_class() < ActionKind::Hardlink.order_class());
    }

    #[test]
    fn test_string_to_bool() {
        assert!(string_to_bool("true").unwrap());
        assert!(string_to_bool("t").unwrap());
        assert!(!string_to_bool("false").unwrap());
        assert!(!string_to_bool("F").unwrap());
        assert!(string_to_bool("yes").is_err());
    }
}
