//! Contact and group records plus field validation.
//!
//! Records are immutable values from the caller's perspective: an update
//! replaces the whole record by id with a refreshed `updated_at_ms`. Ids are
//! assigned at creation and never change.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FieldIssue, ValidationError};

/// Maximum accepted name length in characters.
pub const NAME_MAX_CHARS: usize = 100;
/// Phone digit-count bounds after separator stripping.
pub const PHONE_MIN_DIGITS: usize = 7;
pub const PHONE_MAX_DIGITS: usize = 15;

static EMAIL_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    // Basic local@domain.tld shape, nothing more.
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$")
        .unwrap_or_else(|e| panic!("email pattern must compile: {e}"))
});

/// Opaque contact identifier, globally unique, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(pub Uuid);

impl ContactId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ContactId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Opaque group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl GroupId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for GroupId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A single contact record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    /// Display name, 1–100 characters after trimming.
    pub name: String,
    /// Optional email, validated against a basic `local@domain.tld` shape.
    #[serde(default)]
    pub email: Option<String>,
    /// Optional phone, stored digit-normalized (7–15 digits).
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub blocked: bool,
    /// Group memberships; the group side holds no member list.
    #[serde(default)]
    pub groups: BTreeSet<GroupId>,
    pub created_at_ms: i64,
    /// Refreshed on every replace-by-id. Never below `created_at_ms`.
    pub updated_at_ms: i64,
}

impl Contact {
    /// Build a fresh record from a validated draft.
    pub fn create(draft: ContactDraft, now_ms: i64) -> std::result::Result<Self, ValidationError> {
        let clean = validate_fields(&draft.name, draft.email.as_deref(), draft.phone.as_deref())?;
        Ok(Self {
            id: ContactId::generate(),
            name: clean.name,
            email: clean.email,
            phone: clean.phone,
            favorite: false,
            blocked: false,
            groups: BTreeSet::new(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        })
    }

    /// Produce the replacement record for this id with `patch` applied.
    ///
    /// Re-runs full validation over the merged fields; `updated_at_ms` is
    /// refreshed and clamped so it never precedes `created_at_ms`.
    pub fn apply_patch(
        &self,
        patch: &ContactPatch,
        now_ms: i64,
    ) -> std::result::Result<Self, ValidationError> {
        let name = patch.name.clone().unwrap_or_else(|| self.name.clone());
        let email = if patch.clear_email {
            None
        } else {
            patch.email.clone().or_else(|| self.email.clone())
        };
        let phone = if patch.clear_phone {
            None
        } else {
            patch.phone.clone().or_else(|| self.phone.clone())
        };

        let clean = validate_fields(&name, email.as_deref(), phone.as_deref())?;
        Ok(Self {
            id: self.id,
            name: clean.name,
            email: clean.email,
            phone: clean.phone,
            favorite: patch.favorite.unwrap_or(self.favorite),
            blocked: patch.blocked.unwrap_or(self.blocked),
            groups: patch.groups.clone().unwrap_or_else(|| self.groups.clone()),
            created_at_ms: self.created_at_ms,
            updated_at_ms: now_ms.max(self.created_at_ms),
        })
    }

    /// Field equality ignoring id and timestamps.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.name == other.name
            && self.email == other.email
            && self.phone == other.phone
            && self.favorite == other.favorite
            && self.blocked == other.blocked
            && self.groups == other.groups
    }
}

/// Raw input triple as supplied by callers and device integrations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDraft {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl ContactDraft {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: None,
            phone: None,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }
}

/// Per-field replacement applied by `update`.
///
/// `None` keeps the existing value; the `clear_*` flags drop an optional
/// field entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub favorite: Option<bool>,
    #[serde(default)]
    pub blocked: Option<bool>,
    #[serde(default)]
    pub groups: Option<BTreeSet<GroupId>>,
    #[serde(default)]
    pub clear_email: bool,
    #[serde(default)]
    pub clear_phone: bool,
}

impl ContactPatch {
    #[must_use]
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// A named contact group. Membership lives on the contact side only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub label: String,
}

impl Group {
    pub fn create(label: &str) -> std::result::Result<Self, ValidationError> {
        let trimmed = label.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::single("label", "must not be empty"));
        }
        if trimmed.chars().count() > NAME_MAX_CHARS {
            return Err(ValidationError::single(
                "label",
                format!("must be at most {NAME_MAX_CHARS} characters"),
            ));
        }
        Ok(Self {
            id: GroupId::generate(),
            label: trimmed.to_string(),
        })
    }
}

/// Validated and normalized contact fields.
#[derive(Debug, Clone)]
pub struct CleanFields {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Validate the raw field triple, collecting every violation.
///
/// Phone numbers come back digit-normalized; empty optional strings are
/// treated as absent rather than invalid.
pub fn validate_fields(
    name: &str,
    email: Option<&str>,
    phone: Option<&str>,
) -> std::result::Result<CleanFields, ValidationError> {
    let mut issues = Vec::new();

    let name = name.trim();
    if name.is_empty() {
        issues.push(FieldIssue {
            field: "name".to_string(),
            message: "must not be empty".to_string(),
        });
    } else if name.chars().count() > NAME_MAX_CHARS {
        issues.push(FieldIssue {
            field: "name".to_string(),
            message: format!("must be at most {NAME_MAX_CHARS} characters"),
        });
    }

    let email = email.map(str::trim).filter(|e| !e.is_empty());
    if let Some(e) = email {
        if !EMAIL_SHAPE.is_match(e) {
            issues.push(FieldIssue {
                field: "email".to_string(),
                message: "must look like local@domain.tld".to_string(),
            });
        }
    }

    let phone = phone.map(str::trim).filter(|p| !p.is_empty());
    let normalized_phone = match phone {
        Some(p) => match normalize_phone(p) {
            Some(digits) => Some(digits),
            None => {
                issues.push(FieldIssue {
                    field: "phone".to_string(),
                    message: format!(
                        "must contain {PHONE_MIN_DIGITS}-{PHONE_MAX_DIGITS} digits"
                    ),
                });
                None
            }
        },
        None => None,
    };

    if issues.is_empty() {
        Ok(CleanFields {
            name: name.to_string(),
            email: email.map(str::to_string),
            phone: normalized_phone,
        })
    } else {
        Err(ValidationError::new(issues))
    }
}

/// Strip separators and a leading `+`, keeping digits only.
///
/// Returns `None` when a non-separator, non-digit character remains or the
/// digit count falls outside the accepted range.
#[must_use]
pub fn normalize_phone(raw: &str) -> Option<String> {
    let stripped = raw.strip_prefix('+').unwrap_or(raw);
    let mut digits = String::with_capacity(stripped.len());
    for c in stripped.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return None,
        }
    }
    if (PHONE_MIN_DIGITS..=PHONE_MAX_DIGITS).contains(&digits.len()) {
        Some(digits)
    } else {
        None
    }
}
