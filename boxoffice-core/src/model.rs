//! Domain model types for boxoffice accounts.
//!
//! This module defines the core types used throughout boxoffice:
//! - [`AccountId`] - Durable identifier of an account
//! - [`ProviderName`] - Name of a federated login provider (e.g., "google")
//! - [`SubjectId`] - Provider-issued subject identifier
//! - [`Account`] - Full account record
//! - [`IdentityLink`] - Binding of one provider subject to one account
//! - [`NewAccount`] - Fields needed to create an account
//! - [`LoginData`] - What the login entry point hands to the resolver

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Durable identifier of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Generate a fresh random account ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AccountId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Name of a federated login provider (e.g., "google", "github").
///
/// Provider names are normalized to lowercase so `Google` and `google`
/// refer to the same provider.
///
/// # Examples
///
/// ```
/// use boxoffice_core::ProviderName;
///
/// let google = ProviderName::new("Google");
/// assert_eq!(google.as_str(), "google");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct ProviderName(String);

impl ProviderName {
    /// Create a new provider name.
    ///
    /// The name is trimmed and normalized to lowercase.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_lowercase())
    }

    /// Get the provider name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProviderName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProviderName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Subject identifier issued by a provider.
///
/// Kept verbatim: providers treat subject IDs as case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectId(String);

impl SubjectId {
    /// Create a new subject ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the subject ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SubjectId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Full account record.
///
/// The email is unique across all accounts. Optional columns are `None`
/// when absent, never empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub full_name: String,
    pub telephone_number: Option<String>,
    pub profile_image_url: Option<String>,
    pub user_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Binding of a provider subject to exactly one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLink {
    pub account_id: AccountId,
    pub provider: ProviderName,
    pub subject_id: SubjectId,
    pub created_at: DateTime<Utc>,
}

/// A local password credential together with the account it belongs to.
#[derive(Debug, Clone)]
pub struct LocalCredential {
    pub account: Account,

    /// Argon2 PHC string.
    pub password_hash: String,
}

/// Fields needed to create an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub email: String,
    pub full_name: String,
    pub telephone_number: Option<String>,
    pub profile_image_url: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl NewAccount {
    /// Create account fields with the given email and display name.
    pub fn new(email: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            full_name: full_name.into(),
            telephone_number: None,
            profile_image_url: None,
            verified_at: None,
        }
    }

    pub fn with_profile_image_url(mut self, url: Option<String>) -> Self {
        self.profile_image_url = url;
        self
    }

    pub fn with_telephone_number(mut self, phone: Option<String>) -> Self {
        self.telephone_number = phone;
        self
    }

    pub fn with_verified_at(mut self, verified_at: DateTime<Utc>) -> Self {
        self.verified_at = Some(verified_at);
        self
    }

    /// Materialize the account row this would insert.
    pub fn into_account(self, id: AccountId, created_at: DateTime<Utc>) -> Account {
        Account {
            id,
            email: self.email,
            full_name: self.full_name,
            telephone_number: self.telephone_number,
            profile_image_url: self.profile_image_url,
            user_name: None,
            created_at,
            updated_at: None,
            verified_at: self.verified_at,
        }
    }
}

/// Callback data extracted by the login entry point after a federated login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginData {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub provider: ProviderName,
    pub provider_subject_id: SubjectId,
    pub avatar_url: Option<String>,
}

impl LoginData {
    /// Display name built from the first and last name parts.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }

    /// Avatar URL, treating an empty string as absent.
    pub fn avatar_url(&self) -> Option<String> {
        self.avatar_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
    }
}

/// Normalize an email address for storage and lookup.
///
/// Emails are trimmed and lowercased so lookups are case-insensitive.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
