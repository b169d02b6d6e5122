//! Error types for boxoffice.

use std::fmt;
use thiserror::Error;

use crate::password::PasswordError;

/// Repository operation an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FindByIdentity,
    FindByEmail,
    FindById,
    ListIdentities,
    CreateAccount,
    LinkIdentity,
    CreateAccountWithIdentity,
    CreateAccountWithCredential,
    FindCredentialByEmail,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FindByIdentity => "find_by_identity",
            Self::FindByEmail => "find_by_email",
            Self::FindById => "find_by_id",
            Self::ListIdentities => "list_identities",
            Self::CreateAccount => "create_account",
            Self::LinkIdentity => "link_identity",
            Self::CreateAccountWithIdentity => "create_account_with_identity",
            Self::CreateAccountWithCredential => "create_account_with_credential",
            Self::FindCredentialByEmail => "find_credential_by_email",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniqueness constraint that rejected a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constraint {
    /// `accounts.email`
    Email,

    /// `identities (provider, provider_subject_id)`
    Identity,

    /// `local_credentials.account_id`
    Credential,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => f.write_str("account email"),
            Self::Identity => f.write_str("provider identity"),
            Self::Credential => f.write_str("local credential"),
        }
    }
}

/// Error type for repository operations.
///
/// Reads report [`RepositoryError::NotFound`] and writes report
/// [`RepositoryError::ConstraintViolation`]; every other storage failure is
/// [`RepositoryError::Internal`] or [`RepositoryError::Timeout`].
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The lookup matched no row.
    #[error("{operation}: not found")]
    NotFound { operation: Operation },

    /// A unique constraint rejected the write.
    #[error("{operation}: {constraint} already exists")]
    ConstraintViolation {
        operation: Operation,
        constraint: Constraint,
    },

    /// The storage call did not finish within the configured timeout.
    #[error("{operation}: timed out")]
    Timeout { operation: Operation },

    /// Any other storage or transport failure.
    #[error("{operation}: {message}")]
    Internal {
        operation: Operation,
        message: String,
    },
}

impl RepositoryError {
    pub fn not_found(operation: Operation) -> Self {
        Self::NotFound { operation }
    }

    pub fn conflict(operation: Operation, constraint: Constraint) -> Self {
        Self::ConstraintViolation {
            operation,
            constraint,
        }
    }

    pub fn internal(operation: Operation, message: impl Into<String>) -> Self {
        Self::Internal {
            operation,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The violated constraint, if this is a constraint violation.
    pub fn constraint(&self) -> Option<Constraint> {
        match self {
            Self::ConstraintViolation { constraint, .. } => Some(*constraint),
            _ => None,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Self::NotFound { operation }
            | Self::ConstraintViolation { operation, .. }
            | Self::Timeout { operation }
            | Self::Internal { operation, .. } => *operation,
        }
    }
}

/// Error type for identity resolution and local login.
///
/// Only these variants leave the service; `NotFound` and
/// `ConstraintViolation` are handled inside it unless they persist after
/// the single retry, in which case they surface wrapped in `Internal`.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The login data is missing a required field.
    #[error("invalid login data: {message}")]
    InvalidLoginData { message: String },

    /// Unknown email or wrong password. Deliberately does not say which.
    #[error("invalid email or password")]
    InvalidCredentials,

    /// Local registration for an email that already has an account.
    #[error("an account with this email already exists")]
    EmailTaken,

    /// The password could not be hashed.
    #[error(transparent)]
    Hashing(#[from] PasswordError),

    /// Unexpected storage failure. Not retried.
    #[error("{context}: {source}")]
    Internal {
        context: &'static str,
        #[source]
        source: RepositoryError,
    },
}

impl ResolveError {
    pub(crate) fn internal(context: &'static str, source: RepositoryError) -> Self {
        Self::Internal { context, source }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidLoginData {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_constraint_accessor() {
        let err = RepositoryError::conflict(Operation::LinkIdentity, Constraint::Identity);
        assert_eq!(err.constraint(), Some(Constraint::Identity));
        assert_eq!(err.operation(), Operation::LinkIdentity);
        assert!(!err.is_not_found());

        let err = RepositoryError::not_found(Operation::FindByEmail);
        assert_eq!(err.constraint(), None);
        assert!(err.is_not_found());
    }

    #[test]
    fn test_internal_preserves_cause() {
        let cause = RepositoryError::internal(Operation::FindByIdentity, "connection reset");
        let err = ResolveError::internal("identity lookup failed", cause);

        assert_eq!(
            err.to_string(),
            "identity lookup failed: find_by_identity: connection reset"
        );
        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "find_by_identity: connection reset");
    }

    #[test]
    fn test_invalid_credentials_message_is_generic() {
        assert_eq!(
            ResolveError::InvalidCredentials.to_string(),
            "invalid email or password"
        );
    }
}
