//! Cache key definitions.
//!
//! Defines the content catalog (`EntityType`, `OperationKind`), `Tag` for bulk
//! invalidation, and `CacheKey` for durable entries.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Content collections the cache knows how to index and invalidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Posts,
    Pages,
    Globals,
    Navigation,
    Forms,
    AiPrompts,
    Redirects,
    FormSubmissions,
}

impl EntityType {
    pub const ALL: [EntityType; 8] = [
        EntityType::Posts,
        EntityType::Pages,
        EntityType::Globals,
        EntityType::Navigation,
        EntityType::Forms,
        EntityType::AiPrompts,
        EntityType::Redirects,
        EntityType::FormSubmissions,
    ];

    /// Collection name used upstream and as the entity's durable tag.
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityType::Posts => "posts",
            EntityType::Pages => "pages",
            EntityType::Globals => "globals",
            EntityType::Navigation => "navigation",
            EntityType::Forms => "forms",
            EntityType::AiPrompts => "ai_prompts",
            EntityType::Redirects => "redirects",
            EntityType::FormSubmissions => "form_submissions",
        }
    }

    /// The tag every cached query over this entity carries.
    pub const fn tag(self) -> Tag {
        Tag::from_static(self.as_str())
    }

    /// Narrow tag for a single record, e.g. `posts:id:42`.
    pub fn id_tag(self, id: &str) -> Tag {
        Tag::new(format!("{}:id:{id}", self.as_str()))
    }

    /// Narrow tag for a slug-like lookup, e.g. `pages:slug:about`.
    pub fn lookup_tag(self, field: &str, value: &str) -> Tag {
        Tag::new(format!("{}:{field}:{value}", self.as_str()))
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownName(pub String);

impl fmt::Display for UnknownName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown name `{}`", self.0)
    }
}

impl std::error::Error for UnknownName {}

impl FromStr for EntityType {
    type Err = UnknownName;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // Accept the camelCase spellings used by JavaScript front ends too.
        match value {
            "posts" => Ok(EntityType::Posts),
            "pages" => Ok(EntityType::Pages),
            "globals" => Ok(EntityType::Globals),
            "navigation" => Ok(EntityType::Navigation),
            "forms" => Ok(EntityType::Forms),
            "ai_prompts" | "aiPrompts" => Ok(EntityType::AiPrompts),
            "redirects" => Ok(EntityType::Redirects),
            "form_submissions" | "formSubmissions" => Ok(EntityType::FormSubmissions),
            other => Err(UnknownName(other.to_string())),
        }
    }
}

/// Read operations a cached query can perform against a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Singleton read (globals).
    Get,
    GetAll,
    GetById,
    GetBySlug,
    GetActive,
    GetPublished,
    GetByFromUrl,
    GetByForm,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            OperationKind::Get => "get",
            OperationKind::GetAll => "get_all",
            OperationKind::GetById => "get_by_id",
            OperationKind::GetBySlug => "get_by_slug",
            OperationKind::GetActive => "get_active",
            OperationKind::GetPublished => "get_published",
            OperationKind::GetByFromUrl => "get_by_from_url",
            OperationKind::GetByForm => "get_by_form",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = UnknownName;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "get" => Ok(OperationKind::Get),
            "get_all" | "getAll" => Ok(OperationKind::GetAll),
            "get_by_id" | "getById" => Ok(OperationKind::GetById),
            "get_by_slug" | "getBySlug" => Ok(OperationKind::GetBySlug),
            "get_active" | "getActive" => Ok(OperationKind::GetActive),
            "get_published" | "getPublished" => Ok(OperationKind::GetPublished),
            "get_by_from_url" | "getByFromUrl" => Ok(OperationKind::GetByFromUrl),
            "get_by_form" | "getByForm" => Ok(OperationKind::GetByForm),
            other => Err(UnknownName(other.to_string())),
        }
    }
}

/// A named query operation, e.g. `posts.get_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId {
    pub entity: EntityType,
    pub kind: OperationKind,
}

impl OperationId {
    pub const fn new(entity: EntityType, kind: OperationKind) -> Self {
        Self { entity, kind }
    }

    pub fn name(&self) -> String {
        format!("{}.{}", self.entity.as_str(), self.kind.as_str())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.kind)
    }
}

/// Opaque label grouping cache entries by content category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Tag(Cow<'static, str>);

impl Tag {
    pub const fn from_static(value: &'static str) -> Self {
        Self(Cow::Borrowed(value))
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(Cow::Owned(value.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for Tag {
    fn from(value: &'static str) -> Self {
        Self::from_static(value)
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Deterministic key for a durable cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from an operation name and its arguments.
    ///
    /// Structurally equal arguments produce the same key regardless of the
    /// order object members were inserted in.
    pub fn derive(operation: &str, args: &Value) -> Self {
        let canonical = canonical_json(args);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("{operation}:{}", hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize a JSON value with object members sorted by key at every depth.
///
/// Array order is preserved: `["-date", "title"]` and `["title", "-date"]`
/// are different sorts and must not collide.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut String) {
    // Display on a non-container Value is infallible JSON serialization.
    out.push_str(&value.to_string());
}
