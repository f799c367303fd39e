//! Registry validation
//!
//! Turns a raw key → location document into an immutable [`RegistrySnapshot`].
//! Validation is pure and collects every violation in one pass; any violation
//! rejects the whole document.

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use url::Url;

/// Location schemes a backend may use
pub const ALLOWED_SCHEMES: [&str; 2] = ["http", "https"];

/// Backend protocol shape, selecting which adapter serves the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Speaks the gateway's canonical request shape
    Local,
    /// Reached through the hosted agent platform's foreign shape
    Adapted,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Adapted => "adapted",
        }
    }

    /// Parse a kind name (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Some(BackendKind::Local),
            "adapted" => Some(BackendKind::Adapted),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry value as written in the source document
///
/// Simple form: `stats = "http://stats:8000"` (kind local).
/// Detailed form: `drafting = { location = "https://...", kind = "adapted" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawLocation {
    Simple(String),
    Detailed {
        location: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
}

impl RawLocation {
    pub fn location(&self) -> &str {
        match self {
            RawLocation::Simple(location) => location,
            RawLocation::Detailed { location, .. } => location,
        }
    }

    pub fn kind(&self) -> Option<&str> {
        match self {
            RawLocation::Simple(_) => None,
            RawLocation::Detailed { kind, .. } => kind.as_deref(),
        }
    }
}

/// One key/value pair of the raw document, in document order
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub key: String,
    pub value: RawLocation,
}

/// Unvalidated registry document
///
/// Keeps every pair in document order, including repeated keys, so that
/// [`validate`] can report duplicates instead of silently keeping the last one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRegistry {
    entries: Vec<RawEntry>,
}

impl RawRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from simple `key → location` pairs (all kind local)
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut raw = Self::new();
        for (key, location) in pairs {
            raw.push(key, RawLocation::Simple(location.into()));
        }
        raw
    }

    pub fn push(&mut self, key: impl Into<String>, value: RawLocation) {
        self.entries.push(RawEntry {
            key: key.into(),
            value,
        });
    }

    /// Builder variant of [`RawRegistry::push`] for a detailed entry
    pub fn with_entry(
        mut self,
        key: impl Into<String>,
        location: impl Into<String>,
        kind: BackendKind,
    ) -> Self {
        self.push(
            key,
            RawLocation::Detailed {
                location: location.into(),
                kind: Some(kind.as_str().to_string()),
            },
        );
        self
    }

    pub fn entries(&self) -> &[RawEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Parse a TOML document of top-level `key = location` pairs
    ///
    /// TOML itself rejects a repeated key, which would hide every other issue
    /// in the document. When that happens each pair is parsed on its own so
    /// the repeat reaches [`validate`] as a [`RegistryIssue::DuplicateKey`].
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        match toml::from_str(s) {
            Err(e) if is_duplicate_key_error(&e) => Self::from_toml_pairs(s).ok_or(e),
            parsed => parsed,
        }
    }

    fn from_toml_pairs(s: &str) -> Option<Self> {
        let mut raw = Self::new();
        for statement in top_level_statements(s)? {
            let part: RawRegistry = toml::from_str(statement).ok()?;
            raw.entries.extend(part.entries);
        }
        Some(raw)
    }
}

pub(crate) fn is_duplicate_key_error(error: &toml::de::Error) -> bool {
    error.message().contains("duplicate key")
}

/// Split a document of top-level key/value pairs into one slice per pair
///
/// `None` when the document has a table header or unbalanced delimiters.
fn top_level_statements(doc: &str) -> Option<Vec<&str>> {
    let bytes = doc.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            quote @ (b'"' | b'\'') => {
                i = skip_string(bytes, i, quote)?;
                continue;
            }
            b'[' if depth == 0 && doc[start..i].trim().is_empty() => return None,
            b'[' | b'{' => depth += 1,
            b']' | b'}' => depth = depth.checked_sub(1)?,
            b'\n' if depth == 0 => {
                push_statement(&mut statements, &doc[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }

    if depth != 0 {
        return None;
    }
    push_statement(&mut statements, &doc[start..]);
    Some(statements)
}

fn push_statement<'a>(statements: &mut Vec<&'a str>, text: &'a str) {
    let text = text.trim();
    if !text.is_empty() && !text.starts_with('#') {
        statements.push(text);
    }
}

/// Index just past the string opening at `open`
fn skip_string(bytes: &[u8], open: usize, quote: u8) -> Option<usize> {
    let fence = [quote; 3];
    let multiline = bytes.get(open..open + 3) == Some(&fence[..]);
    let width = if multiline { 3 } else { 1 };
    let mut i = open + width;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' if quote == b'"' => i += 2,
            b'\n' if !multiline => return None,
            c if c == quote && (!multiline || bytes.get(i..i + 3) == Some(&fence[..])) => {
                return Some(i + width);
            }
            _ => i += 1,
        }
    }
    None
}

impl<'de> Deserialize<'de> for RawRegistry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RawRegistryVisitor;

        impl<'de> Visitor<'de> for RawRegistryVisitor {
            type Value = RawRegistry;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of backend keys to locations")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut raw = RawRegistry::new();
                while let Some((key, value)) = map.next_entry::<String, RawLocation>()? {
                    raw.push(key, value);
                }
                Ok(raw)
            }
        }

        deserializer.deserialize_map(RawRegistryVisitor)
    }
}

impl Serialize for RawRegistry {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.key, &entry.value)?;
        }
        map.end()
    }
}

/// A single structural violation found in a raw registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum RegistryIssue {
    EmptyMapping,
    EmptyKey {
        position: usize,
    },
    DuplicateKey {
        key: String,
        occurrences: usize,
    },
    InvalidLocation {
        key: String,
        location: String,
        reason: String,
    },
    UnsupportedScheme {
        key: String,
        scheme: String,
    },
    MissingHost {
        key: String,
        location: String,
    },
    UnknownKind {
        key: String,
        kind: String,
    },
}

impl fmt::Display for RegistryIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryIssue::EmptyMapping => write!(f, "registry mapping is empty"),
            RegistryIssue::EmptyKey { position } => {
                write!(f, "entry #{position} has an empty key")
            }
            RegistryIssue::DuplicateKey { key, occurrences } => {
                write!(f, "key '{key}' appears {occurrences} times")
            }
            RegistryIssue::InvalidLocation {
                key,
                location,
                reason,
            } => write!(
                f,
                "key '{key}' has invalid location '{location}': {reason}"
            ),
            RegistryIssue::UnsupportedScheme { key, scheme } => write!(
                f,
                "key '{key}' uses scheme '{scheme}' (allowed: {})",
                ALLOWED_SCHEMES.join(", ")
            ),
            RegistryIssue::MissingHost { key, location } => {
                write!(f, "key '{key}' location '{location}' has no host")
            }
            RegistryIssue::UnknownKind { key, kind } => write!(
                f,
                "key '{key}' has unknown kind '{kind}' (expected local or adapted)"
            ),
        }
    }
}

/// Rejected registry, carrying every violation found
#[derive(Debug, Clone, PartialEq, Error)]
pub struct RegistryError {
    pub issues: Vec<RegistryIssue>,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registry rejected with {} issue(s)", self.issues.len())?;
        for issue in &self.issues {
            write!(f, "; {issue}")?;
        }
        Ok(())
    }
}

/// Validated backend location
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEntry {
    pub key: String,
    pub location: Url,
    pub kind: BackendKind,
}

/// Immutable, versioned view of the registry
///
/// Snapshots are shared behind `Arc` and never mutated; a reload produces a new
/// snapshot with a higher version.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    version: u64,
    loaded_at: DateTime<Utc>,
    entries: BTreeMap<String, RegistryEntry>,
}

impl RegistrySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn get(&self, key: &str) -> Option<&RegistryEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// All backend keys, sorted
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Validate a raw registry into a snapshot stamped with `version`
pub fn validate(raw: &RawRegistry, version: u64) -> Result<RegistrySnapshot, RegistryError> {
    if raw.is_empty() {
        return Err(RegistryError {
            issues: vec![RegistryIssue::EmptyMapping],
        });
    }

    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    for entry in raw.entries() {
        *occurrences.entry(entry.key.as_str()).or_default() += 1;
    }

    let mut issues = Vec::new();
    let mut reported_duplicates = HashSet::new();
    let mut entries = BTreeMap::new();

    for (position, raw_entry) in raw.entries().iter().enumerate() {
        let key = raw_entry.key.as_str();
        if key.trim().is_empty() {
            issues.push(RegistryIssue::EmptyKey { position });
            continue;
        }

        let count = occurrences.get(key).copied().unwrap_or(0);
        if count > 1 && reported_duplicates.insert(key) {
            issues.push(RegistryIssue::DuplicateKey {
                key: key.to_string(),
                occurrences: count,
            });
        }

        let location = check_location(key, raw_entry.value.location(), &mut issues);
        let kind = match raw_entry.value.kind() {
            None => Some(BackendKind::Local),
            Some(name) => {
                let parsed = BackendKind::parse(name);
                if parsed.is_none() {
                    issues.push(RegistryIssue::UnknownKind {
                        key: key.to_string(),
                        kind: name.to_string(),
                    });
                }
                parsed
            }
        };

        if let (Some(location), Some(kind)) = (location, kind) {
            entries
                .entry(key.to_string())
                .or_insert_with(|| RegistryEntry {
                    key: key.to_string(),
                    location,
                    kind,
                });
        }
    }

    if !issues.is_empty() {
        return Err(RegistryError { issues });
    }

    Ok(RegistrySnapshot {
        version,
        loaded_at: Utc::now(),
        entries,
    })
}

fn check_location(key: &str, location: &str, issues: &mut Vec<RegistryIssue>) -> Option<Url> {
    let url = match Url::parse(location.trim()) {
        Ok(url) => url,
        Err(e) => {
            issues.push(RegistryIssue::InvalidLocation {
                key: key.to_string(),
                location: location.to_string(),
                reason: e.to_string(),
            });
            return None;
        }
    };

    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        issues.push(RegistryIssue::UnsupportedScheme {
            key: key.to_string(),
            scheme: url.scheme().to_string(),
        });
        return None;
    }

    if url.host_str().map_or(true, str::is_empty) {
        issues.push(RegistryIssue::MissingHost {
            key: key.to_string(),
            location: location.to_string(),
        });
        return None;
    }

    Some(url)
}
