//! Identity fields, their formats, and the target identity a session enforces.
//!
//! The set of recognized fields is closed: [`IdentityField`] is shared by the
//! config store, the enforcer and the generator, so a field name that is not
//! one of its variants can never reach the target file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{GuardianError, Result};

/// A recognized identity field. Declaration order is the canonical field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdentityField {
    PrimaryId,
    SecondaryId,
    SessionId,
    VariantId,
}

impl IdentityField {
    pub const ALL: [IdentityField; 4] = [
        IdentityField::PrimaryId,
        IdentityField::SecondaryId,
        IdentityField::SessionId,
        IdentityField::VariantId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityField::PrimaryId => "primaryId",
            IdentityField::SecondaryId => "secondaryId",
            IdentityField::SessionId => "sessionId",
            IdentityField::VariantId => "variantId",
        }
    }

    pub fn format(&self) -> FieldFormat {
        match self {
            IdentityField::PrimaryId => FieldFormat::UuidV4,
            IdentityField::SecondaryId | IdentityField::SessionId => FieldFormat::Hex64,
            IdentityField::VariantId => FieldFormat::BracedUpperUuid,
        }
    }

    pub fn validate(&self, value: &str) -> Result<()> {
        if self.format().is_valid(value) {
            Ok(())
        } else {
            Err(GuardianError::InvalidIdentity {
                field: *self,
                value: value.to_string(),
            })
        }
    }
}

impl fmt::Display for IdentityField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityField {
    type Err = GuardianError;

    fn from_str(s: &str) -> Result<Self> {
        IdentityField::ALL
            .into_iter()
            .find(|field| field.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| GuardianError::UnknownField(s.to_string()))
    }
}

/// Value format an identity field must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFormat {
    /// Lowercase hyphenated UUID, version 4.
    UuidV4,
    /// 64 lowercase hex characters (a 256-bit token).
    Hex64,
    /// Uppercase hyphenated UUID wrapped in braces, e.g. `{6F9619FF-8B86-D011-B42D-00C04FC964FF}`.
    BracedUpperUuid,
}

impl FieldFormat {
    pub fn is_valid(&self, value: &str) -> bool {
        match self {
            FieldFormat::UuidV4 => is_lower_uuid_v4(value),
            FieldFormat::Hex64 => {
                value.len() == 64
                    && value
                        .bytes()
                        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
            }
            FieldFormat::BracedUpperUuid => value
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
                .is_some_and(|inner| {
                    inner.len() == 36
                        && Uuid::parse_str(inner).is_ok()
                        && !inner.bytes().any(|b| b.is_ascii_lowercase())
                }),
        }
    }
}

fn is_lower_uuid_v4(value: &str) -> bool {
    if value.len() != 36 || value.bytes().any(|b| b.is_ascii_uppercase()) {
        return false;
    }
    Uuid::parse_str(value).is_ok_and(|uuid| uuid.get_version_num() == 4)
}

/// The desired identity values a session asserts into the target file.
///
/// Immutable once built: every value has passed its field's validator.
/// Fields iterate in canonical order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<IdentityField, String>", into = "BTreeMap<IdentityField, String>")]
pub struct TargetIdentity {
    fields: BTreeMap<IdentityField, String>,
}

impl TargetIdentity {
    pub fn new<I, V>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (IdentityField, V)>,
        V: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (field, value) in fields {
            let value = value.into();
            field.validate(&value)?;
            map.insert(field, value);
        }
        if map.is_empty() {
            return Err(GuardianError::EmptyIdentity);
        }
        Ok(Self { fields: map })
    }

    /// Parse `name=value` pairs, as given on a command line.
    pub fn from_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<Self> {
        let parsed = pairs
            .iter()
            .map(|pair| {
                let pair = pair.as_ref();
                let (name, value) = pair
                    .split_once('=')
                    .ok_or_else(|| GuardianError::UnknownField(pair.to_string()))?;
                Ok((name.parse::<IdentityField>()?, value.trim().to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(parsed)
    }

    pub fn get(&self, field: IdentityField) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (IdentityField, &str)> {
        self.fields.iter().map(|(field, value)| (*field, value.as_str()))
    }

    pub fn field_names(&self) -> impl Iterator<Item = IdentityField> + '_ {
        self.fields.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl TryFrom<BTreeMap<IdentityField, String>> for TargetIdentity {
    type Error = GuardianError;

    fn try_from(fields: BTreeMap<IdentityField, String>) -> Result<Self> {
        Self::new(fields)
    }
}

impl From<TargetIdentity> for BTreeMap<IdentityField, String> {
    fn from(identity: TargetIdentity) -> Self {
        identity.fields
    }
}

/// Produces well-formed replacement values for identity fields.
pub trait IdentityGenerator {
    /// Return a fresh value that passes `field`'s validator.
    fn generate(&self, field: IdentityField) -> String;

    fn generate_identity(&self, fields: &[IdentityField]) -> Result<TargetIdentity> {
        TargetIdentity::new(fields.iter().map(|field| (*field, self.generate(*field))))
    }
}

/// Generator backed by the OS random source.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdentityGenerator;

impl IdentityGenerator for RandomIdentityGenerator {
    fn generate(&self, field: IdentityField) -> String {
        match field.format() {
            FieldFormat::UuidV4 => Uuid::new_v4().to_string(),
            FieldFormat::Hex64 => hex::encode(rand::random::<[u8; 32]>()),
            FieldFormat::BracedUpperUuid => {
                format!("{{{}}}", Uuid::new_v4().to_string().to_uppercase())
            }
        }
    }
}
