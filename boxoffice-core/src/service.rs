//! Identity resolution for federated and local login.
//!
//! [`IdentityService`] decides, for each login, whether it belongs to an
//! existing account, is a new provider for a known email, or needs a brand
//! new account, and applies that decision through an [`AccountRepository`].
//!
//! The service holds no shared mutable state. Concurrent logins for the same
//! person are arbitrated by the store's unique constraints: the loser of a
//! race sees a constraint violation and re-reads the winner's rows, at most
//! once per kind of race.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use boxoffice_core::{IdentityService, LoginData, MemoryAccountRepository};
//!
//! let service = IdentityService::new(MemoryAccountRepository::new());
//! let account = service
//!     .resolve_or_create(&LoginData {
//!         email: "ada@example.com".to_string(),
//!         first_name: "Ada".to_string(),
//!         last_name: "Lovelace".to_string(),
//!         provider: "google".into(),
//!         provider_subject_id: "g-123".into(),
//!         avatar_url: None,
//!     })
//!     .await?;
//! println!("signed in as {}", account.id);
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{Constraint, Operation, RepositoryError, ResolveError};
use crate::model::{normalize_email, Account, LoginData, NewAccount};
use crate::password::{hash_password, verify_password, Password, PasswordError};
use crate::repository::AccountRepository;

const MIN_PASSWORD_CHARS: usize = 8;
const MIN_FULL_NAME_CHARS: usize = 2;
const MAX_TELEPHONE_CHARS: usize = 15;

/// Resolution states. `Done` and `Failed` are the function's return.
enum Step {
    IdentityLookup,
    EmailLookup,
    LinkIdentity(Account),
    CreateAccount,
}

/// One retry hop per race class.
#[derive(Default)]
struct RetryBudget {
    identity_used: bool,
    email_used: bool,
}

/// Fields for a local (email + password) registration.
#[derive(Debug, Clone)]
pub struct LocalRegistration {
    pub email: String,
    pub full_name: String,
    pub telephone_number: Option<String>,
    pub password: Password,
}

/// Resolves logins to accounts.
///
/// # Type Parameters
///
/// * `R` - The repository implementation to use
pub struct IdentityService<R: AccountRepository> {
    repo: R,
    call_timeout: Option<Duration>,
    dummy_hash: OnceCell<String>,
}

impl<R: AccountRepository> IdentityService<R> {
    /// Create a service over the given repository with no call timeout.
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            call_timeout: None,
            dummy_hash: OnceCell::new(),
        }
    }

    /// Bound every repository call by `timeout`.
    ///
    /// A call that runs out of time is dropped, which rolls back any open
    /// transaction, and the resolution fails with an internal error.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// The underlying repository.
    pub fn repository(&self) -> &R {
        &self.repo
    }

    async fn call<T>(
        &self,
        operation: Operation,
        fut: impl Future<Output = Result<T, RepositoryError>>,
    ) -> Result<T, RepositoryError> {
        match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| RepositoryError::Timeout { operation })?,
            None => fut.await,
        }
    }

    /// Find or create the account for a federated login.
    ///
    /// In order: a known (provider, subject) pair returns its account; a
    /// known email gets the new identity linked to it; otherwise a new
    /// account and its first identity are created together. Conflicts from
    /// concurrent logins send the call back to the matching lookup once.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::InvalidLoginData`] if email, provider, or subject is missing
    /// - [`ResolveError::Internal`] for any storage failure, or a conflict
    ///   that persists after its retry
    pub async fn resolve_or_create(&self, login: &LoginData) -> Result<Account, ResolveError> {
        let email = normalize_email(&login.email);
        validate_email(&email)?;
        if login.provider.as_str().is_empty() {
            return Err(ResolveError::invalid("provider is required"));
        }
        if login.provider_subject_id.as_str().trim().is_empty() {
            return Err(ResolveError::invalid("provider subject id is required"));
        }

        let provider = &login.provider;
        let subject_id = &login.provider_subject_id;
        let mut retries = RetryBudget::default();
        let mut step = Step::IdentityLookup;

        loop {
            step = match step {
                Step::IdentityLookup => {
                    let found = self
                        .call(
                            Operation::FindByIdentity,
                            self.repo.find_by_identity(provider, subject_id),
                        )
                        .await;
                    match found {
                        Ok(account) => {
                            debug!(
                                account_id = %account.id,
                                provider = %provider,
                                "Existing identity found, logging in"
                            );
                            return Ok(account);
                        }
                        // After an identity conflict the winner's row must be visible.
                        Err(e) if e.is_not_found() && !retries.identity_used => Step::EmailLookup,
                        Err(e) => return Err(ResolveError::internal("identity lookup failed", e)),
                    }
                }

                Step::EmailLookup => {
                    let found = self
                        .call(Operation::FindByEmail, self.repo.find_by_email(&email))
                        .await;
                    match found {
                        Ok(account) => {
                            debug!(
                                account_id = %account.id,
                                provider = %provider,
                                "Account with same email found, linking new identity"
                            );
                            Step::LinkIdentity(account)
                        }
                        Err(e) if e.is_not_found() && !retries.email_used => Step::CreateAccount,
                        Err(e) => return Err(ResolveError::internal("email lookup failed", e)),
                    }
                }

                Step::LinkIdentity(account) => {
                    let linked = self
                        .call(
                            Operation::LinkIdentity,
                            self.repo.link_identity(account.id, provider, subject_id),
                        )
                        .await;
                    match linked {
                        Ok(()) => return Ok(account),
                        Err(e)
                            if e.constraint() == Some(Constraint::Identity)
                                && !retries.identity_used =>
                        {
                            retries.identity_used = true;
                            warn!(
                                account_id = %account.id,
                                provider = %provider,
                                "Identity linked concurrently, retrying identity lookup"
                            );
                            Step::IdentityLookup
                        }
                        Err(e) => return Err(ResolveError::internal("identity link failed", e)),
                    }
                }

                Step::CreateAccount => {
                    debug!(provider = %provider, "No existing account, creating account and identity");

                    let new_account = NewAccount::new(email.clone(), login.full_name())
                        .with_profile_image_url(login.avatar_url())
                        .with_verified_at(Utc::now());
                    let created = self
                        .call(
                            Operation::CreateAccountWithIdentity,
                            self.repo
                                .create_account_with_identity(&new_account, provider, subject_id),
                        )
                        .await;

                    match created {
                        Ok(account) => {
                            debug!(account_id = %account.id, provider = %provider, "Account created");
                            return Ok(account);
                        }
                        Err(e) => match e.constraint() {
                            Some(Constraint::Email) if !retries.email_used => {
                                retries.email_used = true;
                                warn!(provider = %provider, "Email registered concurrently, retrying email lookup");
                                Step::EmailLookup
                            }
                            Some(Constraint::Identity) if !retries.identity_used => {
                                retries.identity_used = true;
                                warn!(provider = %provider, "Identity created concurrently, retrying identity lookup");
                                Step::IdentityLookup
                            }
                            _ => {
                                return Err(ResolveError::internal("account creation failed", e));
                            }
                        },
                    }
                }
            };
        }
    }

    /// Register an account with a local password.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::InvalidLoginData`] if a field fails validation
    /// - [`ResolveError::EmailTaken`] if the email already has an account,
    ///   including one created concurrently with this call
    /// - [`ResolveError::Internal`] for storage failures
    pub async fn register_local(
        &self,
        registration: &LocalRegistration,
    ) -> Result<Account, ResolveError> {
        let email = normalize_email(&registration.email);
        validate_email(&email)?;

        let full_name = registration.full_name.trim();
        if full_name.chars().count() < MIN_FULL_NAME_CHARS {
            return Err(ResolveError::invalid(format!(
                "full name must be at least {MIN_FULL_NAME_CHARS} characters"
            )));
        }
        if registration.password.len() < MIN_PASSWORD_CHARS {
            return Err(ResolveError::invalid(format!(
                "password must be at least {MIN_PASSWORD_CHARS} characters"
            )));
        }
        let telephone_number = registration
            .telephone_number
            .as_deref()
            .map(str::trim)
            .filter(|phone| !phone.is_empty())
            .map(str::to_string);
        if telephone_number
            .as_deref()
            .is_some_and(|phone| phone.chars().count() > MAX_TELEPHONE_CHARS)
        {
            return Err(ResolveError::invalid(format!(
                "telephone number must be at most {MAX_TELEPHONE_CHARS} characters"
            )));
        }

        match self
            .call(Operation::FindByEmail, self.repo.find_by_email(&email))
            .await
        {
            Ok(_) => return Err(ResolveError::EmailTaken),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(ResolveError::internal("email lookup failed", e)),
        }

        let password_hash = hash_blocking(registration.password.clone()).await?;
        let new_account =
            NewAccount::new(email.clone(), full_name).with_telephone_number(telephone_number);

        let created = self
            .call(
                Operation::CreateAccountWithCredential,
                self.repo
                    .create_account_with_credential(&new_account, &password_hash),
            )
            .await;

        match created {
            Ok(account) => {
                debug!(account_id = %account.id, "Local account registered");
                Ok(account)
            }
            Err(e) if e.constraint() == Some(Constraint::Email) => {
                warn!("Email registered concurrently, re-checking email");
                match self
                    .call(Operation::FindByEmail, self.repo.find_by_email(&email))
                    .await
                {
                    Ok(_) => Err(ResolveError::EmailTaken),
                    Err(lookup) if lookup.is_not_found() => {
                        Err(ResolveError::internal("account creation failed", e))
                    }
                    Err(lookup) => Err(ResolveError::internal("email lookup failed", lookup)),
                }
            }
            Err(e) => Err(ResolveError::internal("account creation failed", e)),
        }
    }

    /// Log in with email and password.
    ///
    /// Unknown emails, accounts without a local password, and wrong
    /// passwords all fail with [`ResolveError::InvalidCredentials`] after
    /// the same amount of hashing work.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::InvalidCredentials`] as described above
    /// - [`ResolveError::Hashing`] if the equalizing hash cannot be computed
    /// - [`ResolveError::Internal`] for storage failures
    pub async fn login_local(
        &self,
        email: &str,
        password: &Password,
    ) -> Result<Account, ResolveError> {
        let email = normalize_email(email);

        let credential = match self
            .call(
                Operation::FindCredentialByEmail,
                self.repo.find_credential_by_email(&email),
            )
            .await
        {
            Ok(credential) => Some(credential),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(ResolveError::internal("credential lookup failed", e)),
        };

        match credential {
            Some(credential) => {
                if verify_blocking(credential.password_hash, password.clone()).await {
                    debug!(account_id = %credential.account.id, "Local login succeeded");
                    Ok(credential.account)
                } else {
                    debug!("Local login rejected");
                    Err(ResolveError::InvalidCredentials)
                }
            }
            None => {
                let dummy = self.dummy_hash().await?;
                verify_blocking(dummy.clone(), password.clone()).await;
                debug!("Local login rejected");
                Err(ResolveError::InvalidCredentials)
            }
        }
    }

    /// Hash verified when there is no real credential to check.
    ///
    /// Built once on the blocking pool; warm it with [`IdentityService::prepare`].
    async fn dummy_hash(&self) -> Result<&String, ResolveError> {
        self.dummy_hash
            .get_or_try_init(|| hash_blocking(Password::new("boxoffice-timing-equalizer")))
            .await
    }

    /// Precompute the hash used to equalize failed local logins.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::Hashing`] if the hash cannot be computed
    pub async fn prepare(&self) -> Result<(), ResolveError> {
        self.dummy_hash().await.map(|_| ())
    }
}

fn validate_email(email: &str) -> Result<(), ResolveError> {
    if email.is_empty() {
        return Err(ResolveError::invalid("email is required"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(ResolveError::invalid("email must contain a local part and a domain")),
    }
}

async fn hash_blocking(password: Password) -> Result<String, ResolveError> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| PasswordError::Hash {
            message: e.to_string(),
        })?
        .map_err(ResolveError::from)
}

async fn verify_blocking(hash: String, password: Password) -> bool {
    tokio::task::spawn_blocking(move || verify_password(&hash, &password))
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProviderName, SubjectId};
    use crate::repository::MemoryAccountRepository;
    use std::sync::Arc;

    fn login(email: &str, provider: &str, subject: &str) -> LoginData {
        LoginData {
            email: email.to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            provider: ProviderName::new(provider),
            provider_subject_id: SubjectId::new(subject),
            avatar_url: Some("https://img/ada.png".to_string()),
        }
    }

    fn service() -> (IdentityService<Arc<MemoryAccountRepository>>, Arc<MemoryAccountRepository>) {
        let repo = Arc::new(MemoryAccountRepository::new());
        (IdentityService::new(repo.clone()), repo)
    }

    fn registration(email: &str, password: &str) -> LocalRegistration {
        LocalRegistration {
            email: email.to_string(),
            full_name: "Ada Lovelace".to_string(),
            telephone_number: Some("+254700000000".to_string()),
            password: Password::new(password),
        }
    }

    #[tokio::test]
    async fn test_new_account_fields() {
        let (service, repo) = service();
        let account = service
            .resolve_or_create(&login(" Ada@X.com ", "Google", "g1"))
            .await
            .unwrap();

        assert_eq!(account.email, "ada@x.com");
        assert_eq!(account.full_name, "Ada Lovelace");
        assert_eq!(account.profile_image_url.as_deref(), Some("https://img/ada.png"));
        assert!(account.verified_at.is_some());
        assert_eq!(repo.account_count(), 1);
        assert_eq!(repo.identity_count(), 1);
    }

    #[tokio::test]
    async fn test_returning_user_takes_fast_path() {
        let (service, repo) = service();
        let first = service.resolve_or_create(&login("a@x.com", "google", "g1")).await.unwrap();
        let second = service.resolve_or_create(&login("a@x.com", "google", "g1")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(repo.call_count(Operation::FindByIdentity), 2);
        assert_eq!(repo.call_count(Operation::FindByEmail), 1);
        assert_eq!(repo.call_count(Operation::CreateAccountWithIdentity), 1);
    }

    #[tokio::test]
    async fn test_missing_fields_rejected_before_storage() {
        let (service, repo) = service();

        for data in [
            login("", "google", "g1"),
            login("no-at-sign", "google", "g1"),
            login("a@x.com", "", "g1"),
            login("a@x.com", "google", "  "),
        ] {
            let err = service.resolve_or_create(&data).await.unwrap_err();
            assert!(matches!(err, ResolveError::InvalidLoginData { .. }), "{data:?}");
        }
        assert_eq!(repo.call_count(Operation::FindByIdentity), 0);
    }

    #[tokio::test]
    async fn test_identity_lookup_failure_is_not_retried() {
        let (service, repo) = service();
        repo.fail_next(Operation::FindByIdentity);

        let err = service
            .resolve_or_create(&login("a@x.com", "google", "g1"))
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::Internal { .. }));
        assert_eq!(repo.call_count(Operation::FindByIdentity), 1);
        assert_eq!(repo.call_count(Operation::FindByEmail), 0);
        assert_eq!(repo.account_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_surfaces_internal() {
        struct Stalled;

        #[async_trait::async_trait]
        impl AccountRepository for Stalled {
            async fn find_by_identity(
                &self,
                _: &ProviderName,
                _: &SubjectId,
            ) -> Result<Account, RepositoryError> {
                std::future::pending().await
            }
            async fn find_by_email(&self, _: &str) -> Result<Account, RepositoryError> {
                unreachable!()
            }
            async fn find_by_id(&self, _: crate::AccountId) -> Result<Account, RepositoryError> {
                unreachable!()
            }
            async fn list_identities(
                &self,
                _: crate::AccountId,
            ) -> Result<Vec<crate::IdentityLink>, RepositoryError> {
                unreachable!()
            }
            async fn create_account(&self, _: &NewAccount) -> Result<Account, RepositoryError> {
                unreachable!()
            }
            async fn link_identity(
                &self,
                _: crate::AccountId,
                _: &ProviderName,
                _: &SubjectId,
            ) -> Result<(), RepositoryError> {
                unreachable!()
            }
            async fn create_account_with_identity(
                &self,
                _: &NewAccount,
                _: &ProviderName,
                _: &SubjectId,
            ) -> Result<Account, RepositoryError> {
                unreachable!()
            }
            async fn create_account_with_credential(
                &self,
                _: &NewAccount,
                _: &str,
            ) -> Result<Account, RepositoryError> {
                unreachable!()
            }
            async fn find_credential_by_email(
                &self,
                _: &str,
            ) -> Result<crate::LocalCredential, RepositoryError> {
                unreachable!()
            }
        }

        let service = IdentityService::new(Stalled).with_call_timeout(Duration::from_millis(50));
        let err = service
            .resolve_or_create(&login("a@x.com", "google", "g1"))
            .await
            .unwrap_err();

        match err {
            ResolveError::Internal { source, .. } => {
                assert!(matches!(
                    source,
                    RepositoryError::Timeout {
                        operation: Operation::FindByIdentity
                    }
                ));
            }
            other => panic!("expected internal error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let (service, repo) = service();
        let registered = service
            .register_local(&registration("Ada@X.com", "correct horse"))
            .await
            .unwrap();
        assert_eq!(registered.telephone_number.as_deref(), Some("+254700000000"));
        assert_eq!(repo.credential_count(), 1);

        let logged_in = service
            .login_local("ada@x.com", &Password::new("correct horse"))
            .await
            .unwrap();
        assert_eq!(logged_in.id, registered.id);
    }

    #[tokio::test]
    async fn test_register_existing_email_is_taken() {
        let (service, _repo) = service();
        service
            .resolve_or_create(&login("a@x.com", "google", "g1"))
            .await
            .unwrap();

        let err = service
            .register_local(&registration("a@x.com", "correct horse"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::EmailTaken));
    }

    #[tokio::test]
    async fn test_register_validation() {
        let (service, repo) = service();

        let err = service
            .register_local(&registration("a@x.com", "short"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidLoginData { .. }));

        let mut long_phone = registration("a@x.com", "correct horse");
        long_phone.telephone_number = Some("1234567890123456".to_string());
        let err = service.register_local(&long_phone).await.unwrap_err();
        assert!(matches!(err, ResolveError::InvalidLoginData { .. }));

        let mut short_name = registration("a@x.com", "correct horse");
        short_name.full_name = " A ".to_string();
        let err = service.register_local(&short_name).await.unwrap_err();
        assert!(matches!(err, ResolveError::InvalidLoginData { .. }));

        assert_eq!(repo.account_count(), 0);
    }

    #[tokio::test]
    async fn test_login_failures_are_indistinguishable() {
        let (service, _repo) = service();
        service
            .register_local(&registration("a@x.com", "correct horse"))
            .await
            .unwrap();
        service
            .resolve_or_create(&login("fed@x.com", "google", "g1"))
            .await
            .unwrap();

        let wrong_password = service
            .login_local("a@x.com", &Password::new("battery staple"))
            .await
            .unwrap_err();
        let unknown_email = service
            .login_local("nobody@x.com", &Password::new("correct horse"))
            .await
            .unwrap_err();
        let federated_only = service
            .login_local("fed@x.com", &Password::new("correct horse"))
            .await
            .unwrap_err();

        for err in [&wrong_password, &unknown_email, &federated_only] {
            assert!(matches!(err, ResolveError::InvalidCredentials));
        }
        assert_eq!(wrong_password.to_string(), unknown_email.to_string());
    }

    #[tokio::test]
    async fn test_login_storage_failure_is_internal() {
        let (service, repo) = service();
        repo.fail_next(Operation::FindCredentialByEmail);

        let err = service
            .login_local("a@x.com", &Password::new("correct horse"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Internal { .. }));
    }

    #[tokio::test]
    async fn test_link_failure_is_not_retried() {
        let (service, repo) = service();
        repo.create_account(&NewAccount::new("a@x.com", "Ada")).await.unwrap();
        repo.fail_next(Operation::LinkIdentity);

        let err = service
            .resolve_or_create(&login("a@x.com", "google", "g1"))
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::Internal { .. }));
        assert_eq!(repo.call_count(Operation::LinkIdentity), 1);
        assert_eq!(repo.call_count(Operation::FindByIdentity), 1);
        assert_eq!(repo.account_count(), 1);
        assert_eq!(repo.identity_count(), 0);
    }

    #[tokio::test]
    async fn test_create_failure_is_not_retried() {
        let (service, repo) = service();
        repo.fail_next(Operation::CreateAccountWithIdentity);

        let err = service
            .resolve_or_create(&login("a@x.com", "google", "g1"))
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::Internal { .. }));
        assert_eq!(repo.call_count(Operation::CreateAccountWithIdentity), 1);
        assert_eq!(repo.call_count(Operation::FindByEmail), 1);
        assert_eq!(repo.account_count(), 0);
        assert_eq!(repo.identity_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_email_verifies_real_dummy_hash() {
        let (service, _repo) = service();
        assert!(service.dummy_hash.get().is_none());

        let err = service
            .login_local("nobody@x.com", &Password::new("correct horse"))
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::InvalidCredentials));
        let dummy = service.dummy_hash.get().expect("dummy hash built on first miss");
        assert!(dummy.starts_with("$argon2id$"));
    }

    #[tokio::test]
    async fn test_prepare_builds_dummy_hash_once() {
        let (service, _repo) = service();
        service.prepare().await.unwrap();
        let first = service.dummy_hash.get().cloned().unwrap();

        service.prepare().await.unwrap();
        service
            .login_local("nobody@x.com", &Password::new("correct horse"))
            .await
            .unwrap_err();
        assert_eq!(service.dummy_hash.get(), Some(&first));
    }
}
