//! # Boxoffice Core
//!
//! Account storage and identity resolution for the boxoffice ticketing backend.
//!
//! This crate provides:
//! - Domain types for accounts, provider identities, and login data
//! - The [`AccountRepository`] trait with SQLite and in-memory implementations
//! - [`IdentityService`], which maps a federated or local login to exactly
//!   one account, safely under concurrent logins
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use boxoffice_core::{IdentityService, IdentityStore, SqliteAccountRepository, StoreConfig};
//!
//! let store = IdentityStore::connect(&StoreConfig::default()).await?;
//! store.migrate().await?;
//!
//! let service = IdentityService::new(SqliteAccountRepository::new(&store));
//! let account = service.resolve_or_create(&login_data).await?;
//! ```

pub mod error;
pub mod model;
pub mod password;
pub mod repository;
pub mod service;
pub mod store;

// Re-export commonly used types at crate root
pub use model::{
    Account,
    AccountId,
    IdentityLink,
    LocalCredential,
    LoginData,
    NewAccount,
    ProviderName,
    SubjectId,
};

pub use error::{
    Constraint,
    Operation,
    RepositoryError,
    ResolveError,
};

pub use repository::{
    AccountRepository,
    MemoryAccountRepository,
    SqliteAccountRepository,
};

pub use store::{
    IdentityStore,
    StoreConfig,
    StoreError,
    StoreHealth,
};

pub use password::{Password, PasswordError};

pub use service::{IdentityService, LocalRegistration};
