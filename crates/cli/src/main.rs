//! Mercado Lister CLI - migrations, user management and token maintenance.
//!
//! # Usage
//!
//! ```bash
//! # Run database migrations
//! ml-cli migrate
//!
//! # Create a user (password from ML_CLI_PASSWORD or stdin)
//! ml-cli user create -e seller@example.com
//!
//! # Reset a user's password
//! ml-cli user set-password -e seller@example.com
//!
//! # Run one MercadoLibre token refresh sweep
//! ml-cli credentials sweep
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "ml-cli")]
#[command(author, version, about = "Mercado Lister CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Manage local users
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Maintain stored MercadoLibre credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create a new user
    Create {
        /// Email address
        #[arg(short, long)]
        email: String,
    },
    /// Set a new password for an existing user
    SetPassword {
        /// Email address
        #[arg(short, long)]
        email: String,
    },
}

#[derive(Subcommand)]
enum CredentialsAction {
    /// Refresh tokens expiring soon and flag lapsed ones, once
    Sweep {
        /// Refresh tokens expiring within this many seconds
        #[arg(long)]
        window_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::User { action } => match action {
            UserAction::Create { email } => {
                commands::user::create(&email).await?;
            }
            UserAction::SetPassword { email } => commands::user::set_password(&email).await?,
        },
        Commands::Credentials { action } => match action {
            CredentialsAction::Sweep { window_secs } => {
                commands::credentials::sweep(window_secs).await?;
            }
        },
    }
    Ok(())
}
