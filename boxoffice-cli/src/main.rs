//! Boxoffice CLI
//!
//! Operator interface to the boxoffice identity store: run migrations,
//! resolve federated logins, and register or log in local accounts.
//!
//! # Usage
//!
//! ```bash
//! # Apply schema migrations
//! boxoffice migrate
//!
//! # Resolve a federated login to an account
//! boxoffice resolve ada@example.com --provider google --subject 1234 --first-name Ada
//!
//! # Register and log in with a local password
//! boxoffice register ada@example.com --name "Ada Lovelace" --password 'correct horse'
//! boxoffice login ada@example.com --password 'correct horse'
//! ```

use anyhow::{Context, Result, anyhow};
use boxoffice_core::{
    Account, AccountRepository, IdentityLink, IdentityService, IdentityStore, LocalRegistration,
    LoginData, Password, ProviderName, ResolveError, SqliteAccountRepository, SubjectId,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

mod config;

use config::BoxofficeConfig;

#[derive(Parser)]
#[command(name = "boxoffice")]
#[command(about = "Account and login management for the boxoffice ticketing backend")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Resolve a federated login to an account, creating or linking as needed
    Resolve {
        /// Email reported by the provider
        email: String,

        /// Provider name (e.g., google, github)
        #[arg(short, long)]
        provider: String,

        /// Subject identifier issued by the provider
        #[arg(short, long)]
        subject: String,

        #[arg(long, default_value = "")]
        first_name: String,

        #[arg(long, default_value = "")]
        last_name: String,

        /// Profile picture URL
        #[arg(long)]
        avatar_url: Option<String>,
    },

    /// Register an account with a local password
    Register {
        email: String,

        /// Full name
        #[arg(short, long)]
        name: String,

        /// Telephone number
        #[arg(long)]
        phone: Option<String>,

        #[arg(long)]
        password: String,
    },

    /// Log in with email and password
    Login {
        email: String,

        #[arg(long)]
        password: String,
    },

    /// Show an account and its linked identities
    Show {
        email: String,
    },

    /// Check database connectivity and pool usage
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load_config(cli.config.as_deref())?;
    init_logging(&config.log_level, cli.verbose);
    info!("Loaded configuration from {:?}", config.config_path);

    let store = IdentityStore::connect(&config.database)
        .await
        .context("Failed to open identity store")?;

    let result = run(cli.command, cli.format, &store, &config).await;
    store.close().await;
    result
}

fn init_logging(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(
    command: Commands,
    format: Format,
    store: &IdentityStore,
    config: &BoxofficeConfig,
) -> Result<()> {
    if let Commands::Migrate = command {
        store.migrate().await.context("Failed to apply migrations")?;
        println!("Migrations applied");
        return Ok(());
    }
    if let Commands::Health = command {
        return health(store, format).await;
    }

    store.migrate().await.context("Failed to apply migrations")?;

    let mut service = IdentityService::new(SqliteAccountRepository::new(store));
    if let Some(timeout) = config.resolution.call_timeout() {
        service = service.with_call_timeout(timeout);
    }

    match command {
        Commands::Resolve {
            email,
            provider,
            subject,
            first_name,
            last_name,
            avatar_url,
        } => {
            let login = LoginData {
                email,
                first_name,
                last_name,
                provider: ProviderName::new(provider),
                provider_subject_id: SubjectId::new(subject),
                avatar_url,
            };
            let account = service.resolve_or_create(&login).await.map_err(user_error)?;
            print_account(&account, format)
        }
        Commands::Register {
            email,
            name,
            phone,
            password,
        } => {
            let registration = LocalRegistration {
                email,
                full_name: name,
                telephone_number: phone,
                password: Password::new(password),
            };
            let account = service
                .register_local(&registration)
                .await
                .map_err(user_error)?;
            print_account(&account, format)
        }
        Commands::Login { email, password } => {
            service.prepare().await.map_err(user_error)?;
            let account = service
                .login_local(&email, &Password::new(password))
                .await
                .map_err(user_error)?;
            print_account(&account, format)
        }
        Commands::Show { email } => show(service.repository(), &email, format).await,
        Commands::Migrate | Commands::Health => Ok(()),
    }
}

/// Convert a resolution error into a message fit for the caller.
///
/// Storage failures are logged in full and reported generically.
fn user_error(err: ResolveError) -> anyhow::Error {
    match err {
        ResolveError::Internal { .. } | ResolveError::Hashing(_) => {
            error!(error = %err, "Login failed");
            anyhow!("internal error, please try again later")
        }
        other => anyhow!(other),
    }
}

#[derive(Serialize)]
struct AccountView<'a> {
    account: &'a Account,
    identities: &'a [IdentityLink],
}

async fn show(repo: &SqliteAccountRepository, email: &str, format: Format) -> Result<()> {
    let email = email.trim().to_lowercase();
    let account = match repo.find_by_email(&email).await {
        Ok(account) => account,
        Err(e) if e.is_not_found() => return Err(anyhow!("no account for {email}")),
        Err(e) => return Err(e).context("Failed to look up account"),
    };
    let identities = repo
        .list_identities(account.id)
        .await
        .context("Failed to list identities")?;

    match format {
        Format::Json => {
            let view = AccountView {
                account: &account,
                identities: &identities,
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Format::Text => {
            print_account_text(&account);
            println!("  Identities:");
            if identities.is_empty() {
                println!("    (none)");
            }
            for link in &identities {
                println!(
                    "    {}/{} (linked {})",
                    link.provider,
                    link.subject_id,
                    link.created_at.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

async fn health(store: &IdentityStore, format: Format) -> Result<()> {
    let health = store.health().await;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&health)?),
        Format::Text => {
            println!("Status: {}", health.status);
            println!("  {}", health.message);
            println!(
                "  Connections: {} open, {} idle, {} max",
                health.open_connections, health.idle_connections, health.max_connections
            );
        }
    }

    if health.status == "up" {
        Ok(())
    } else {
        Err(anyhow!("database is down"))
    }
}

fn print_account(account: &Account, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(account)?),
        Format::Text => print_account_text(account),
    }
    Ok(())
}

fn print_account_text(account: &Account) {
    println!("Account {}", account.id);
    println!("  Email: {}", account.email);
    println!("  Name: {}", account.full_name);
    if let Some(phone) = &account.telephone_number {
        println!("  Phone: {}", phone);
    }
    if let Some(url) = &account.profile_image_url {
        println!("  Avatar: {}", url);
    }
    println!("  Created: {}", account.created_at.to_rfc3339());
    match account.verified_at {
        Some(at) => println!("  Verified: {}", at.to_rfc3339()),
        None => println!("  Verified: no"),
    }
}
