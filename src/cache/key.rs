//! Composite cache keys.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::HuginnError;

/// Placeholder owner segment when no owner is given.
pub const ANONYMOUS_OWNER: &str = "anonymous";
/// Placeholder subject segment when no subject is given.
pub const ALL_SUBJECTS: &str = "all";

/// The decomposed parts of a key, kept alongside each entry so it can be
/// matched by partial criteria without re-parsing the key string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyComponents {
    pub kind: Option<String>,
    pub owner_id: Option<String>,
    pub subject_id: Option<String>,
}

impl KeyComponents {
    pub fn matches_owner(&self, owner_id: &str) -> bool {
        self.owner_id.as_deref() == Some(owner_id)
    }

    pub fn matches_kind(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }
}

/// Deterministic composite key `(kind, owner | "anonymous", subject | "all")`.
///
/// Equality and hashing use only that tuple, so a key built without an
/// owner equals one built with owner `"anonymous"`.
///
/// The rendered form escapes `%` as `%25` and `:` as `%3A` inside each
/// segment, so ids containing the separator still parse back to the same key.
///
/// ```rust
/// # use huginn::CacheKey;
/// let key = CacheKey::new("business_profile").owner("user-1");
/// assert_eq!(key.to_string(), "business_profile:user-1:all");
/// ```
#[derive(Debug, Clone)]
pub struct CacheKey {
    kind: String,
    owner_id: Option<String>,
    subject_id: Option<String>,
}

impl CacheKey {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            owner_id: None,
            subject_id: None,
        }
    }

    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn owner_segment(&self) -> &str {
        self.owner_id.as_deref().unwrap_or(ANONYMOUS_OWNER)
    }

    pub fn subject_segment(&self) -> &str {
        self.subject_id.as_deref().unwrap_or(ALL_SUBJECTS)
    }

    pub fn components(&self) -> KeyComponents {
        KeyComponents {
            kind: Some(self.kind.clone()),
            owner_id: self.owner_id.clone(),
            subject_id: self.subject_id.clone(),
        }
    }

    fn tuple(&self) -> (&str, &str, &str) {
        (&self.kind, self.owner_segment(), self.subject_segment())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.tuple() == other.tuple()
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tuple().hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, owner, subject) = self.tuple();
        write_segment(f, kind)?;
        f.write_str(":")?;
        write_segment(f, owner)?;
        f.write_str(":")?;
        write_segment(f, subject)
    }
}

fn write_segment(f: &mut fmt::Formatter<'_>, segment: &str) -> fmt::Result {
    if !segment.contains(['%', ':']) {
        return f.write_str(segment);
    }
    for ch in segment.chars() {
        match ch {
            '%' => f.write_str("%25")?,
            ':' => f.write_str("%3A")?,
            other => write!(f, "{other}")?,
        }
    }
    Ok(())
}

fn unescape_segment(segment: &str) -> String {
    if !segment.contains('%') {
        return segment.to_string();
    }
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("%25") {
            out.push('%');
            rest = &tail[3..];
        } else if tail.starts_with("%3A") || tail.starts_with("%3a") {
            out.push(':');
            rest = &tail[3..];
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for CacheKey {
    type Err = HuginnError;

    /// Parse `kind:owner:subject`. Placeholder segments become `None`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (Some(kind), Some(owner), Some(subject), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HuginnError::Validation(format!(
                "cache key must be kind:owner:subject, got {s:?}"
            )));
        };
        if kind.is_empty() {
            return Err(HuginnError::Validation(format!(
                "cache key has an empty kind: {s:?}"
            )));
        }
        let (owner, subject) = (unescape_segment(owner), unescape_segment(subject));
        let mut key = CacheKey::new(unescape_segment(kind));
        if owner != ANONYMOUS_OWNER {
            key = key.owner(owner);
        }
        if subject != ALL_SUBJECTS {
            key = key.subject(subject);
        }
        Ok(key)
    }
}
