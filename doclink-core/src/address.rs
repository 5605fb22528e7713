//! Resource addressing.
//!
//! A resource is reachable through two addressing schemes:
//!
//! - a **hierarchical path** of caller-chosen ids rooted at the account
//!   (`dbs/D1/colls/C1/docs/42`), and
//! - a **stable address**, the opaque `_self` link the server assigns when the resource is
//!   created (`dbs/7PlNAA==/colls/7PlNAJ2j1Ac=/`).
//!
//! [`ResourceAddress`] holds either form, [`Target`] additionally expresses a feed (the
//! children of a given kind under a parent), which is what create, list and query operate on.
//!
//! # Example
//!
//! ```ignore
//! use doclink::address::{ResourceAddress, ResourceKind, Target};
//!
//! let collection = ResourceAddress::database("D1").child(ResourceKind::Collection, "C1");
//! assert_eq!(collection.canonical_path(), "dbs/D1/colls/C1");
//!
//! let documents = Target::feed(Some(collection), ResourceKind::Document);
//! assert_eq!(documents.canonical_path(), "dbs/D1/colls/C1/docs");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AccessError, AccessResult};

/// Maximum length of a single resource id.
pub const MAX_ID_LENGTH: usize = 255;

const FORBIDDEN_ID_CHARS: [char; 4] = ['/', '\\', '?', '#'];

/// The type of a resource in the account hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Database,
    Collection,
    Document,
    StoredProcedure,
    Trigger,
    UserDefinedFunction,
    User,
    Permission,
    Attachment,
}

impl ResourceKind {
    /// Path segment naming this kind (`dbs`, `colls`, ...).
    pub fn segment(&self) -> &'static str {
        match self {
            ResourceKind::Database => "dbs",
            ResourceKind::Collection => "colls",
            ResourceKind::Document => "docs",
            ResourceKind::StoredProcedure => "sprocs",
            ResourceKind::Trigger => "triggers",
            ResourceKind::UserDefinedFunction => "udfs",
            ResourceKind::User => "users",
            ResourceKind::Permission => "permissions",
            ResourceKind::Attachment => "attachments",
        }
    }

    /// Key of the array holding items of this kind in a feed response.
    pub fn feed_key(&self) -> &'static str {
        match self {
            ResourceKind::Database => "Databases",
            ResourceKind::Collection => "DocumentCollections",
            ResourceKind::Document => "Documents",
            ResourceKind::StoredProcedure => "StoredProcedures",
            ResourceKind::Trigger => "Triggers",
            ResourceKind::UserDefinedFunction => "UserDefinedFunctions",
            ResourceKind::User => "Users",
            ResourceKind::Permission => "Permissions",
            ResourceKind::Attachment => "Attachments",
        }
    }

    /// The kind a resource of this kind lives under, `None` for account-level databases.
    pub fn parent(&self) -> Option<ResourceKind> {
        match self {
            ResourceKind::Database => None,
            ResourceKind::Collection | ResourceKind::User => Some(ResourceKind::Database),
            ResourceKind::Document
            | ResourceKind::StoredProcedure
            | ResourceKind::Trigger
            | ResourceKind::UserDefinedFunction => Some(ResourceKind::Collection),
            ResourceKind::Permission => Some(ResourceKind::User),
            ResourceKind::Attachment => Some(ResourceKind::Document),
        }
    }

    /// Parses a path segment back into a kind.
    pub fn from_segment(segment: &str) -> Option<ResourceKind> {
        Some(match segment {
            "dbs" => ResourceKind::Database,
            "colls" => ResourceKind::Collection,
            "docs" => ResourceKind::Document,
            "sprocs" => ResourceKind::StoredProcedure,
            "triggers" => ResourceKind::Trigger,
            "udfs" => ResourceKind::UserDefinedFunction,
            "users" => ResourceKind::User,
            "permissions" => ResourceKind::Permission,
            "attachments" => ResourceKind::Attachment,
            _ => return None,
        })
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

/// One `{kind, id}` step of a hierarchical path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSegment {
    pub kind: ResourceKind,
    pub id: String,
}

/// Checks that `id` is usable as a resource id.
pub fn validate_id(id: &str) -> AccessResult<()> {
    if id.is_empty() {
        return Err(AccessError::InvalidIdentifier("id must not be empty".into()));
    }
    if id.chars().count() > MAX_ID_LENGTH {
        return Err(AccessError::InvalidIdentifier(format!(
            "id exceeds {MAX_ID_LENGTH} characters"
        )));
    }
    if let Some(c) = id.chars().find(|c| FORBIDDEN_ID_CHARS.contains(c)) {
        return Err(AccessError::InvalidIdentifier(format!(
            "id {id:?} contains forbidden character {c:?}"
        )));
    }
    if id.ends_with(' ') {
        return Err(AccessError::InvalidIdentifier(format!(
            "id {id:?} ends with a space"
        )));
    }

    Ok(())
}

/// Identifies a single resource, either by hierarchical path or by stable address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum ResourceAddress {
    /// Caller-chosen ids from the account root down to the resource.
    Path { segments: Vec<PathSegment> },
    /// Server-assigned `_self` link.
    Stable { link: String, kind: ResourceKind },
}

impl ResourceAddress {
    /// Address of a database.
    pub fn database(id: impl Into<String>) -> Self {
        ResourceAddress::Path {
            segments: vec![PathSegment { kind: ResourceKind::Database, id: id.into() }],
        }
    }

    /// Address from a server-assigned `_self` link.
    pub fn stable(link: impl Into<String>, kind: ResourceKind) -> Self {
        ResourceAddress::Stable { link: link.into(), kind }
    }

    /// Parses a hierarchical path such as `dbs/D1/colls/C1`.
    pub fn parse_path(path: &str) -> AccessResult<Self> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();

        if parts.len() % 2 != 0 {
            return Err(AccessError::InvalidIdentifier(format!(
                "{path:?} does not name a resource"
            )));
        }

        let segments = parts
            .chunks(2)
            .map(|pair| {
                let kind = ResourceKind::from_segment(pair[0]).ok_or_else(|| {
                    AccessError::InvalidIdentifier(format!("unknown segment {:?}", pair[0]))
                })?;
                Ok(PathSegment { kind, id: pair[1].to_string() })
            })
            .collect::<AccessResult<Vec<_>>>()?;

        let address = ResourceAddress::Path { segments };
        address.validate()?;

        Ok(address)
    }

    /// Appends a child segment. Children of a stable address cannot be expressed
    /// hierarchically, so the child keeps the parent's link as a prefix.
    pub fn child(&self, kind: ResourceKind, id: impl Into<String>) -> Self {
        match self {
            ResourceAddress::Path { segments } => {
                let mut segments = segments.clone();
                segments.push(PathSegment { kind, id: id.into() });
                ResourceAddress::Path { segments }
            }
            ResourceAddress::Stable { link, .. } => ResourceAddress::Stable {
                link: format!("{}/{}/{}", link.trim_matches('/'), kind.segment(), id.into()),
                kind,
            },
        }
    }

    /// The kind of the addressed resource.
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceAddress::Path { segments } => segments
                .last()
                .map(|s| s.kind)
                .unwrap_or(ResourceKind::Database),
            ResourceAddress::Stable { kind, .. } => *kind,
        }
    }

    /// The id of the last path segment. Stable addresses carry no caller-chosen id.
    pub fn id(&self) -> Option<&str> {
        match self {
            ResourceAddress::Path { segments } => segments.last().map(|s| s.id.as_str()),
            ResourceAddress::Stable { .. } => None,
        }
    }

    pub fn is_stable(&self) -> bool {
        matches!(self, ResourceAddress::Stable { .. })
    }

    /// Renders the address as a slash-separated path without leading or trailing slashes.
    pub fn canonical_path(&self) -> String {
        match self {
            ResourceAddress::Path { segments } => segments
                .iter()
                .map(|s| format!("{}/{}", s.kind.segment(), s.id))
                .collect::<Vec<_>>()
                .join("/"),
            ResourceAddress::Stable { link, .. } => link.trim_matches('/').to_string(),
        }
    }

    /// Validates every id of a hierarchical path and the parent chain of its kinds.
    pub fn validate(&self) -> AccessResult<()> {
        match self {
            ResourceAddress::Path { segments } => {
                if segments.is_empty() {
                    return Err(AccessError::InvalidIdentifier("empty resource path".into()));
                }

                let mut parent = None;
                for segment in segments {
                    if segment.kind.parent() != parent {
                        return Err(AccessError::InvalidIdentifier(format!(
                            "{} cannot be nested under {}",
                            segment.kind,
                            parent.map(|k| k.segment()).unwrap_or("the account"),
                        )));
                    }
                    validate_id(&segment.id)?;
                    parent = Some(segment.kind);
                }

                Ok(())
            }
            ResourceAddress::Stable { link, .. } => {
                if link.trim_matches('/').is_empty() {
                    return Err(AccessError::InvalidIdentifier("empty stable address".into()));
                }

                Ok(())
            }
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_path())
    }
}

/// What a request operates on: a single resource or a feed of children.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum Target {
    Resource { address: ResourceAddress },
    Feed { parent: Option<ResourceAddress>, kind: ResourceKind },
}

impl Target {
    pub fn resource(address: ResourceAddress) -> Self {
        Target::Resource { address }
    }

    pub fn feed(parent: Option<ResourceAddress>, kind: ResourceKind) -> Self {
        Target::Feed { parent, kind }
    }

    /// Kind of the resource, or of the feed's items.
    pub fn kind(&self) -> ResourceKind {
        match self {
            Target::Resource { address } => address.kind(),
            Target::Feed { kind, .. } => *kind,
        }
    }

    /// Request path relative to the account endpoint.
    pub fn canonical_path(&self) -> String {
        match self {
            Target::Resource { address } => address.canonical_path(),
            Target::Feed { parent: Some(parent), kind } => {
                format!("{}/{}", parent.canonical_path(), kind.segment())
            }
            Target::Feed { parent: None, kind } => kind.segment().to_string(),
        }
    }

    /// The `(resource type, resource link)` pair authorization tokens are computed over.
    ///
    /// For a feed the link is the parent's, for a resource it is the resource itself.
    pub fn signing_parts(&self) -> (&'static str, String) {
        match self {
            Target::Resource { address } => (address.kind().segment(), address.canonical_path()),
            Target::Feed { parent, kind } => (
                kind.segment(),
                parent.as_ref().map(|p| p.canonical_path()).unwrap_or_default(),
            ),
        }
    }

    /// Validates the target's identifiers and its parent/child kind nesting.
    pub fn validate(&self) -> AccessResult<()> {
        match self {
            Target::Resource { address } => address.validate(),
            Target::Feed { parent, kind } => {
                if let Some(parent) = parent {
                    parent.validate()?;
                    if !parent.is_stable() && Some(parent.kind()) != kind.parent() {
                        return Err(AccessError::InvalidIdentifier(format!(
                            "{kind} cannot be nested under {}",
                            parent.kind()
                        )));
                    }
                } else if kind.parent().is_some() {
                    return Err(AccessError::InvalidIdentifier(format!(
                        "{kind} feed requires a parent"
                    )));
                }

                Ok(())
            }
        }
    }

    /// Address of the child with `id` in this feed, or the resource itself.
    pub fn child_address(&self, id: &str) -> ResourceAddress {
        match self {
            Target::Resource { address } => address.clone(),
            Target::Feed { parent: Some(parent), kind } => parent.child(*kind, id),
            Target::Feed { parent: None, kind } => ResourceAddress::Path {
                segments: vec![PathSegment { kind: *kind, id: id.to_string() }],
            },
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_path())
    }
}
