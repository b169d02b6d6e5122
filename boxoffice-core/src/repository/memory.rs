//! In-memory account repository.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::AccountRepository;
use crate::error::{Constraint, Operation, RepositoryError};
use crate::model::{
    Account, AccountId, IdentityLink, LocalCredential, NewAccount, ProviderName, SubjectId,
};

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<AccountId, Account>,
    emails: HashMap<String, AccountId>,
    identities: Vec<IdentityLink>,
    identity_index: HashMap<(ProviderName, SubjectId), AccountId>,
    credentials: HashMap<AccountId, String>,
}

impl MemoryState {
    fn account(&self, id: &AccountId, operation: Operation) -> Result<Account, RepositoryError> {
        self.accounts
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(operation))
    }

    fn insert_account(
        &mut self,
        new: &NewAccount,
        operation: Operation,
    ) -> Result<Account, RepositoryError> {
        if self.emails.contains_key(&new.email) {
            return Err(RepositoryError::conflict(operation, Constraint::Email));
        }

        let account = new.clone().into_account(AccountId::generate(), Utc::now());
        self.emails.insert(account.email.clone(), account.id);
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    fn check_identity_free(
        &self,
        provider: &ProviderName,
        subject_id: &SubjectId,
        operation: Operation,
    ) -> Result<(), RepositoryError> {
        if self
            .identity_index
            .contains_key(&(provider.clone(), subject_id.clone()))
        {
            return Err(RepositoryError::conflict(operation, Constraint::Identity));
        }
        Ok(())
    }

    fn insert_identity(
        &mut self,
        account_id: AccountId,
        provider: &ProviderName,
        subject_id: &SubjectId,
    ) {
        self.identity_index
            .insert((provider.clone(), subject_id.clone()), account_id);
        self.identities.push(IdentityLink {
            account_id,
            provider: provider.clone(),
            subject_id: subject_id.clone(),
            created_at: Utc::now(),
        });
    }
}

/// In-memory account repository for testing and development.
///
/// Enforces the same uniqueness rules as the SQLite schema, and every
/// multi-row write happens under a single lock so it is atomic. Data is
/// lost when the repository is dropped.
///
/// Each operation yields to the runtime before touching the data, so
/// concurrent callers interleave between operations the way they would
/// against a real store.
pub struct MemoryAccountRepository {
    state: Mutex<MemoryState>,
    calls: Mutex<HashMap<Operation, usize>>,
    faults: Mutex<HashSet<Operation>>,
}

impl MemoryAccountRepository {
    /// Create a new empty repository.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            calls: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashSet::new()),
        }
    }

    /// Make the next call of `operation` fail with an internal error.
    ///
    /// The failure happens before any data is touched.
    pub fn fail_next(&self, operation: Operation) {
        self.faults.lock().insert(operation);
    }

    /// How many times `operation` has been called, including failed calls.
    pub fn call_count(&self, operation: Operation) -> usize {
        self.calls.lock().get(&operation).copied().unwrap_or(0)
    }

    /// Number of stored accounts.
    pub fn account_count(&self) -> usize {
        self.state.lock().accounts.len()
    }

    /// Number of stored identity links.
    pub fn identity_count(&self) -> usize {
        self.state.lock().identities.len()
    }

    /// Number of stored local credentials.
    pub fn credential_count(&self) -> usize {
        self.state.lock().credentials.len()
    }

    async fn enter(&self, operation: Operation) -> Result<(), RepositoryError> {
        tokio::task::yield_now().await;

        *self.calls.lock().entry(operation).or_insert(0) += 1;
        if self.faults.lock().remove(&operation) {
            return Err(RepositoryError::internal(operation, "injected storage failure"));
        }
        Ok(())
    }
}

impl Default for MemoryAccountRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryAccountRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryAccountRepository")
            .field("accounts", &state.accounts.len())
            .field("identities", &state.identities.len())
            .field("credentials", &state.credentials.len())
            .finish()
    }
}

#[async_trait]
impl AccountRepository for MemoryAccountRepository {
    async fn find_by_identity(
        &self,
        provider: &ProviderName,
        subject_id: &SubjectId,
    ) -> Result<Account, RepositoryError> {
        let op = Operation::FindByIdentity;
        self.enter(op).await?;

        let state = self.state.lock();
        let account_id = state
            .identity_index
            .get(&(provider.clone(), subject_id.clone()))
            .ok_or_else(|| RepositoryError::not_found(op))?;
        state.account(account_id, op)
    }

    async fn find_by_email(&self, email: &str) -> Result<Account, RepositoryError> {
        let op = Operation::FindByEmail;
        self.enter(op).await?;

        let state = self.state.lock();
        let account_id = state
            .emails
            .get(email)
            .ok_or_else(|| RepositoryError::not_found(op))?;
        state.account(account_id, op)
    }

    async fn find_by_id(&self, account_id: AccountId) -> Result<Account, RepositoryError> {
        let op = Operation::FindById;
        self.enter(op).await?;

        self.state.lock().account(&account_id, op)
    }

    async fn list_identities(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<IdentityLink>, RepositoryError> {
        self.enter(Operation::ListIdentities).await?;

        Ok(self
            .state
            .lock()
            .identities
            .iter()
            .filter(|link| link.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn create_account(&self, account: &NewAccount) -> Result<Account, RepositoryError> {
        let op = Operation::CreateAccount;
        self.enter(op).await?;

        self.state.lock().insert_account(account, op)
    }

    async fn link_identity(
        &self,
        account_id: AccountId,
        provider: &ProviderName,
        subject_id: &SubjectId,
    ) -> Result<(), RepositoryError> {
        let op = Operation::LinkIdentity;
        self.enter(op).await?;

        let mut state = self.state.lock();
        if !state.accounts.contains_key(&account_id) {
            return Err(RepositoryError::internal(
                op,
                format!("account {account_id} does not exist"),
            ));
        }
        state.check_identity_free(provider, subject_id, op)?;
        state.insert_identity(account_id, provider, subject_id);
        Ok(())
    }

    async fn create_account_with_identity(
        &self,
        account: &NewAccount,
        provider: &ProviderName,
        subject_id: &SubjectId,
    ) -> Result<Account, RepositoryError> {
        let op = Operation::CreateAccountWithIdentity;
        self.enter(op).await?;

        let mut state = self.state.lock();
        // Same order as the SQL transaction: the account insert fails first.
        if state.emails.contains_key(&account.email) {
            return Err(RepositoryError::conflict(op, Constraint::Email));
        }
        state.check_identity_free(provider, subject_id, op)?;

        let created = state.insert_account(account, op)?;
        state.insert_identity(created.id, provider, subject_id);
        Ok(created)
    }

    async fn create_account_with_credential(
        &self,
        account: &NewAccount,
        password_hash: &str,
    ) -> Result<Account, RepositoryError> {
        let op = Operation::CreateAccountWithCredential;
        self.enter(op).await?;

        let mut state = self.state.lock();
        let created = state.insert_account(account, op)?;
        state
            .credentials
            .insert(created.id, password_hash.to_string());
        Ok(created)
    }

    async fn find_credential_by_email(
        &self,
        email: &str,
    ) -> Result<LocalCredential, RepositoryError> {
        let op = Operation::FindCredentialByEmail;
        self.enter(op).await?;

        let state = self.state.lock();
        let account_id = state
            .emails
            .get(email)
            .ok_or_else(|| RepositoryError::not_found(op))?;
        let password_hash = state
            .credentials
            .get(account_id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(op))?;

        Ok(LocalCredential {
            account: state.account(account_id, op)?,
            password_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn google() -> ProviderName {
        ProviderName::new("google")
    }

    #[tokio::test]
    async fn test_create_and_find_by_email() {
        let repo = MemoryAccountRepository::new();
        let created = repo
            .create_account(&NewAccount::new("a@x.com", "Ada"))
            .await
            .unwrap();

        let found = repo.find_by_email("a@x.com").await.unwrap();
        assert_eq!(found, created);

        let by_id = repo.find_by_id(created.id).await.unwrap();
        assert_eq!(by_id, created);
    }

    #[tokio::test]
    async fn test_duplicate_email_is_constraint_violation() {
        let repo = MemoryAccountRepository::new();
        repo.create_account(&NewAccount::new("a@x.com", "Ada"))
            .await
            .unwrap();

        let err = repo
            .create_account(&NewAccount::new("a@x.com", "Other"))
            .await
            .unwrap_err();
        assert_eq!(err.constraint(), Some(Constraint::Email));
        assert_eq!(repo.account_count(), 1);
    }

    #[tokio::test]
    async fn test_link_identity_twice_conflicts() {
        let repo = MemoryAccountRepository::new();
        let account = repo
            .create_account(&NewAccount::new("a@x.com", "Ada"))
            .await
            .unwrap();
        let subject = SubjectId::new("g1");

        repo.link_identity(account.id, &google(), &subject)
            .await
            .unwrap();
        let err = repo
            .link_identity(account.id, &google(), &subject)
            .await
            .unwrap_err();

        assert_eq!(err.constraint(), Some(Constraint::Identity));
        assert_eq!(repo.identity_count(), 1);
    }

    #[tokio::test]
    async fn test_create_with_identity_is_all_or_nothing() {
        let repo = MemoryAccountRepository::new();
        let subject = SubjectId::new("g1");
        repo.create_account_with_identity(&NewAccount::new("a@x.com", "Ada"), &google(), &subject)
            .await
            .unwrap();

        // Fresh email, taken identity: no account may be left behind.
        let err = repo
            .create_account_with_identity(&NewAccount::new("b@x.com", "Bob"), &google(), &subject)
            .await
            .unwrap_err();

        assert_eq!(err.constraint(), Some(Constraint::Identity));
        assert_eq!(repo.account_count(), 1);
        assert!(repo.find_by_email("b@x.com").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_find_by_identity_not_found() {
        let repo = MemoryAccountRepository::new();
        let err = repo
            .find_by_identity(&google(), &SubjectId::new("missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_fail_next_is_one_shot() {
        let repo = MemoryAccountRepository::new();
        repo.fail_next(Operation::FindByEmail);

        let err = repo.find_by_email("a@x.com").await.unwrap_err();
        assert!(matches!(err, RepositoryError::Internal { .. }));

        let err = repo.find_by_email("a@x.com").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(repo.call_count(Operation::FindByEmail), 2);
    }

    #[tokio::test]
    async fn test_credential_lookup() {
        let repo = MemoryAccountRepository::new();
        let account = repo
            .create_account_with_credential(&NewAccount::new("a@x.com", "Ada"), "$argon2id$hash")
            .await
            .unwrap();

        let credential = repo.find_credential_by_email("a@x.com").await.unwrap();
        assert_eq!(credential.account.id, account.id);
        assert_eq!(credential.password_hash, "$argon2id$hash");

        // Federated-only accounts have no credential.
        repo.create_account(&NewAccount::new("b@x.com", "Bob"))
            .await
            .unwrap();
        assert!(repo
            .find_credential_by_email("b@x.com")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
