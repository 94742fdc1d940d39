//! Core domain types for datalib imports.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current version of the serialized import cursor format.
pub const CURSOR_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// ImportId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one import run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportId(pub Uuid);

impl ImportId {
    /// Generate a new time-sortable import identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ImportId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ImportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ImportId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// EntityKind
// ---------------------------------------------------------------------------

/// The closed set of entity kinds an export can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    SiteOption,
    User,
    Post,
    PostMeta,
    Comment,
    CommentMeta,
    Term,
    Tag,
    Category,
}

impl EntityKind {
    /// The snake_case name used in logs and serialized cursors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SiteOption => "site_option",
            Self::User => "user",
            Self::Post => "post",
            Self::PostMeta => "post_meta",
            Self::Comment => "comment",
            Self::CommentMeta => "comment_meta",
            Self::Term => "term",
            Self::Tag => "tag",
            Self::Category => "category",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A `(taxonomy, slug, description)` association carried by a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermAssociation {
    pub taxonomy: String,
    pub slug: String,
    pub description: String,
}

/// Insertion-ordered field map.
///
/// Entities hold a couple dozen fields at most, so a vector beats hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
    /// Look up a field value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Set a field, keeping its original position when it already exists.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One typed unit of content read from an export.
///
/// Readers hand entities out by reference; callers that need to change a
/// field work on a clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    kind: EntityKind,
    #[serde(default)]
    fields: Fields,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    terms: Vec<TermAssociation>,
}

impl Entity {
    /// Create an empty entity of the given kind.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            fields: Fields::default(),
            terms: Vec::new(),
        }
    }

    /// Builder-style field setter, handy for tests and synthetic entities.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.set(name, value);
        self
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.set(name, value);
    }

    pub fn terms(&self) -> &[TermAssociation] {
        &self.terms
    }

    pub fn push_term(&mut self, term: TermAssociation) {
        self.terms.push(term);
    }
}
