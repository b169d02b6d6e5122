//! SQLite-backed account repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use super::AccountRepository;
use crate::error::{Constraint, Operation, RepositoryError};
use crate::model::{
    Account, AccountId, IdentityLink, LocalCredential, NewAccount, ProviderName, SubjectId,
};
use crate::store::IdentityStore;

const ACCOUNT_COLUMNS: &str = "a.id, a.email, a.full_name, a.telephone_number, \
     a.profile_image_url, a.user_name, a.created_at, a.updated_at, a.verified_at";

#[derive(FromRow)]
struct AccountRow {
    id: String,
    email: String,
    full_name: String,
    telephone_number: Option<String>,
    profile_image_url: Option<String>,
    user_name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    verified_at: Option<DateTime<Utc>>,
}

impl AccountRow {
    fn into_account(self, operation: Operation) -> Result<Account, RepositoryError> {
        let id = self.id.parse::<AccountId>().map_err(|e| {
            RepositoryError::internal(operation, format!("corrupt account id {:?}: {e}", self.id))
        })?;

        Ok(Account {
            id,
            email: self.email,
            full_name: self.full_name,
            telephone_number: self.telephone_number,
            profile_image_url: self.profile_image_url,
            user_name: self.user_name,
            created_at: self.created_at,
            updated_at: self.updated_at,
            verified_at: self.verified_at,
        })
    }
}

#[derive(FromRow)]
struct IdentityRow {
    provider: String,
    provider_subject_id: String,
    created_at: DateTime<Utc>,
}

/// Map a driver error, recognizing unique violations as `constraint`.
fn write_error(
    operation: Operation,
    constraint: Constraint,
) -> impl FnOnce(sqlx::Error) -> RepositoryError {
    move |e| {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.is_unique_violation() {
                return RepositoryError::conflict(operation, constraint);
            }
        }
        RepositoryError::internal(operation, e.to_string())
    }
}

fn read_error(operation: Operation) -> impl FnOnce(sqlx::Error) -> RepositoryError {
    move |e| RepositoryError::internal(operation, e.to_string())
}

/// Account repository over an [`IdentityStore`] pool.
///
/// Multi-row writes run in a single transaction. If the future is dropped
/// mid-transaction the transaction is rolled back when it is dropped.
#[derive(Debug, Clone)]
pub struct SqliteAccountRepository {
    pool: SqlitePool,
}

impl SqliteAccountRepository {
    pub fn new(store: &IdentityStore) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }

    async fn insert_account(
        conn: &mut SqliteConnection,
        new: &NewAccount,
        operation: Operation,
    ) -> Result<Account, RepositoryError> {
        let account = new.clone().into_account(AccountId::generate(), Utc::now());

        sqlx::query(
            r#"
            INSERT INTO accounts
                (id, email, full_name, telephone_number, profile_image_url, created_at, verified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(account.id.to_string())
        .bind(&account.email)
        .bind(&account.full_name)
        .bind(&account.telephone_number)
        .bind(&account.profile_image_url)
        .bind(account.created_at)
        .bind(account.verified_at)
        .execute(&mut *conn)
        .await
        .map_err(write_error(operation, Constraint::Email))?;

        Ok(account)
    }

    async fn insert_identity(
        conn: &mut SqliteConnection,
        account_id: AccountId,
        provider: &ProviderName,
        subject_id: &SubjectId,
        operation: Operation,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO identities (account_id, provider, provider_subject_id, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(account_id.to_string())
        .bind(provider.as_str())
        .bind(subject_id.as_str())
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(write_error(operation, Constraint::Identity))?;

        Ok(())
    }

    async fn fetch_account(
        &self,
        sql: &str,
        binds: &[&str],
        operation: Operation,
    ) -> Result<Account, RepositoryError> {
        let mut query = sqlx::query_as::<_, AccountRow>(sql);
        for value in binds {
            query = query.bind(*value);
        }

        query
            .fetch_optional(&self.pool)
            .await
            .map_err(read_error(operation))?
            .ok_or_else(|| RepositoryError::not_found(operation))?
            .into_account(operation)
    }
}

#[async_trait]
impl AccountRepository for SqliteAccountRepository {
    async fn find_by_identity(
        &self,
        provider: &ProviderName,
        subject_id: &SubjectId,
    ) -> Result<Account, RepositoryError> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts a \
             JOIN identities i ON i.account_id = a.id \
             WHERE i.provider = ? AND i.provider_subject_id = ?"
        );
        self.fetch_account(
            &sql,
            &[provider.as_str(), subject_id.as_str()],
            Operation::FindByIdentity,
        )
        .await
    }

    async fn find_by_email(&self, email: &str) -> Result<Account, RepositoryError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts a WHERE a.email = ?");
        self.fetch_account(&sql, &[email], Operation::FindByEmail)
            .await
    }

    async fn find_by_id(&self, account_id: AccountId) -> Result<Account, RepositoryError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts a WHERE a.id = ?");
        let id = account_id.to_string();
        self.fetch_account(&sql, &[id.as_str()], Operation::FindById)
            .await
    }

    async fn list_identities(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<IdentityLink>, RepositoryError> {
        let rows = sqlx::query_as::<_, IdentityRow>(
            r#"
            SELECT provider, provider_subject_id, created_at
            FROM identities
            WHERE account_id = ?
            ORDER BY id
            "#,
        )
        .bind(account_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(read_error(Operation::ListIdentities))?;

        Ok(rows
            .into_iter()
            .map(|row| IdentityLink {
                account_id,
                provider: ProviderName::new(row.provider),
                subject_id: SubjectId::new(row.provider_subject_id),
                created_at: row.created_at,
            })
            .collect())
    }

    async fn create_account(&self, account: &NewAccount) -> Result<Account, RepositoryError> {
        let op = Operation::CreateAccount;
        let mut conn = self.pool.acquire().await.map_err(read_error(op))?;
        Self::insert_account(&mut conn, account, op).await
    }

    async fn link_identity(
        &self,
        account_id: AccountId,
        provider: &ProviderName,
        subject_id: &SubjectId,
    ) -> Result<(), RepositoryError> {
        let op = Operation::LinkIdentity;
        let mut conn = self.pool.acquire().await.map_err(read_error(op))?;
        Self::insert_identity(&mut conn, account_id, provider, subject_id, op).await
    }

    async fn create_account_with_identity(
        &self,
        account: &NewAccount,
        provider: &ProviderName,
        subject_id: &SubjectId,
    ) -> Result<Account, RepositoryError> {
        let op = Operation::CreateAccountWithIdentity;
        let mut tx = self.pool.begin().await.map_err(read_error(op))?;

        // An early return drops `tx`, which rolls the transaction back.
        let created = Self::insert_account(&mut tx, account, op).await?;
        Self::insert_identity(&mut tx, created.id, provider, subject_id, op).await?;

        tx.commit().await.map_err(read_error(op))?;
        Ok(created)
    }

    async fn create_account_with_credential(
        &self,
        account: &NewAccount,
        password_hash: &str,
    ) -> Result<Account, RepositoryError> {
        let op = Operation::CreateAccountWithCredential;
        let mut tx = self.pool.begin().await.map_err(read_error(op))?;

        let created = Self::insert_account(&mut tx, account, op).await?;
        sqlx::query(
            "INSERT INTO local_credentials (account_id, password_hash, created_at) VALUES (?, ?, ?)",
        )
        .bind(created.id.to_string())
        .bind(password_hash)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(write_error(op, Constraint::Credential))?;

        tx.commit().await.map_err(read_error(op))?;
        Ok(created)
    }

    async fn find_credential_by_email(
        &self,
        email: &str,
    ) -> Result<LocalCredential, RepositoryError> {
        let op = Operation::FindCredentialByEmail;

        #[derive(FromRow)]
        struct CredentialRow {
            #[sqlx(flatten)]
            account: AccountRow,
            password_hash: String,
        }

        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS}, c.password_hash FROM accounts a \
             JOIN local_credentials c ON c.account_id = a.id \
             WHERE a.email = ?"
        );
        let row = sqlx::query_as::<_, CredentialRow>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_error(op))?
            .ok_or_else(|| RepositoryError::not_found(op))?;

        Ok(LocalCredential {
            account: row.account.into_account(op)?,
            password_hash: row.password_hash,
        })
    }
}
