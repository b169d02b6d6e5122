//! Account repository abstraction.
//!
//! This module provides:
//! - [`AccountRepository`] - Typed data access over the identity store
//! - [`SqliteAccountRepository`] - Implementation backed by an [`IdentityStore`](crate::IdentityStore)
//! - [`MemoryAccountRepository`] - In-memory implementation for testing
//!
//! Reads distinguish [`RepositoryError::NotFound`] from other failures and
//! writes distinguish [`RepositoryError::ConstraintViolation`]. Those are the
//! only two kinds the resolution service special-cases.
//!
//! Dropping a returned future before it completes cancels the call; an open
//! transaction is rolled back and no partial write becomes visible.

use async_trait::async_trait;

use crate::error::RepositoryError;
use crate::model::{
    Account, AccountId, IdentityLink, LocalCredential, NewAccount, ProviderName, SubjectId,
};

mod memory;
mod sqlite;

pub use memory::MemoryAccountRepository;
pub use sqlite::SqliteAccountRepository;

/// Typed operations over accounts, identity links, and local credentials.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Find the account linked to a provider subject.
    async fn find_by_identity(
        &self,
        provider: &ProviderName,
        subject_id: &SubjectId,
    ) -> Result<Account, RepositoryError>;

    /// Find an account by its (normalized) email.
    async fn find_by_email(&self, email: &str) -> Result<Account, RepositoryError>;

    /// Find an account by ID.
    async fn find_by_id(&self, account_id: AccountId) -> Result<Account, RepositoryError>;

    /// All identity links of an account, oldest first.
    ///
    /// Returns an empty vec if the account has none.
    async fn list_identities(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<IdentityLink>, RepositoryError>;

    /// Create a standalone account.
    ///
    /// Fails with a constraint violation on [`Constraint::Email`](crate::Constraint::Email)
    /// if the email is taken.
    async fn create_account(&self, account: &NewAccount) -> Result<Account, RepositoryError>;

    /// Link a provider subject to an existing account.
    ///
    /// Fails with a constraint violation on [`Constraint::Identity`](crate::Constraint::Identity)
    /// if the pair is already linked to any account.
    async fn link_identity(
        &self,
        account_id: AccountId,
        provider: &ProviderName,
        subject_id: &SubjectId,
    ) -> Result<(), RepositoryError>;

    /// Create an account and its first identity link in one transaction.
    ///
    /// Either both rows become visible or neither does. The constraint
    /// violation names whichever uniqueness rule rejected the write.
    async fn create_account_with_identity(
        &self,
        account: &NewAccount,
        provider: &ProviderName,
        subject_id: &SubjectId,
    ) -> Result<Account, RepositoryError>;

    /// Create an account and its local password credential in one transaction.
    async fn create_account_with_credential(
        &self,
        account: &NewAccount,
        password_hash: &str,
    ) -> Result<Account, RepositoryError>;

    /// Find the local credential of the account with this email.
    async fn find_credential_by_email(
        &self,
        email: &str,
    ) -> Result<LocalCredential, RepositoryError>;
}

#[async_trait]
impl<R: AccountRepository + ?Sized> AccountRepository for std::sync::Arc<R> {
    async fn find_by_identity(
        &self,
        provider: &ProviderName,
        subject_id: &SubjectId,
    ) -> Result<Account, RepositoryError> {
        (**self).find_by_identity(provider, subject_id).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Account, RepositoryError> {
        (**self).find_by_email(email).await
    }

    async fn find_by_id(&self, account_id: AccountId) -> Result<Account, RepositoryError> {
        (**self).find_by_id(account_id).await
    }

    async fn list_identities(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<IdentityLink>, RepositoryError> {
        (**self).list_identities(account_id).await
    }

    async fn create_account(&self, account: &NewAccount) -> Result<Account, RepositoryError> {
        (**self).create_account(account).await
    }

    async fn link_identity(
        &self,
        account_id: AccountId,
        provider: &ProviderName,
        subject_id: &SubjectId,
    ) -> Result<(), RepositoryError> {
        (**self).link_identity(account_id, provider, subject_id).await
    }

    async fn create_account_with_identity(
        &self,
        account: &NewAccount,
        provider: &ProviderName,
        subject_id: &SubjectId,
    ) -> Result<Account, RepositoryError> {
        (**self)
            .create_account_with_identity(account, provider, subject_id)
            .await
    }

    async fn create_account_with_credential(
        &self,
        account: &NewAccount,
        password_hash: &str,
    ) -> Result<Account, RepositoryError> {
        (**self)
            .create_account_with_credential(account, password_hash)
            .await
    }

    async fn find_credential_by_email(
        &self,
        email: &str,
    ) -> Result<LocalCredential, RepositoryError> {
        (**self).find_credential_by_email(email).await
    }
}
