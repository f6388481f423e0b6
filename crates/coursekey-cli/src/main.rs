//! coursekey - command line client for the course catalog identity service.
//!
//! Signs in, keeps the credential pair fresh, and issues authorized requests
//! against the catalog API.

use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use coursekey_core::auth::TeardownReason;
use coursekey_core::{ApiRequest, Config, RegistrationProfile, SessionEvent, SessionManager};

#[derive(Parser)]
#[command(name = "coursekey", version, about = "Course catalog session client")]
struct Cli {
    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and store the credential pair
    Login {
        #[arg(short, long)]
        username: Option<String>,
    },
    /// Forget stored credentials
    Logout,
    /// Show the signed-in identity
    Whoami,
    /// Create an account
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
    },
    /// Request a password reset email
    ForgotPassword { email: String },
    /// Issue an authorized GET and print the JSON response
    Get { path: String },
}

impl Command {
    /// Commands that act on the stored session and need its identity restored.
    fn uses_session(&self) -> bool {
        matches!(self, Command::Whoami | Command::Get { .. })
    }
}

/// Initialize the tracing subscriber for logging.
/// Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
fn init_tracing(log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_ref())?;

    let config = Config::load()?;
    debug!(api = %config.api_base_url, env = ?config.environment, "Configuration loaded");

    let manager = SessionManager::from_config(&config)?;
    let mut events = manager.subscribe();
    if cli.command.uses_session() {
        manager.initialize().await;
    }

    let result = run(cli.command, &manager, &config).await;

    while let Ok(event) = events.try_recv() {
        if let SessionEvent::RedirectToLogin { reason } = event {
            let why = match reason {
                TeardownReason::RefreshRejected => "Your session has expired.",
                TeardownReason::MissingRefreshCredential => "You are not signed in.",
            };
            eprintln!("{} Run `coursekey login` to sign in again.", why);
        }
    }

    result
}

async fn run(command: Command, manager: &SessionManager, config: &Config) -> Result<()> {
    match command {
        Command::Login { username } => {
            let username = match username.or_else(|| config.last_username.clone()) {
                Some(name) => name,
                None => prompt("Username: ")?,
            };
            let password = rpassword::prompt_password("Password: ")?;

            let identity = manager.login(&username, &password).await?;
            info!(user_id = identity.id, "Signed in");
            println!("Signed in as {} ({})", identity.display_name(), identity.role.as_str());

            Config::remember_username(&username).context("Failed to save config")?;
        }
        Command::Logout => {
            manager.logout();
            println!("Signed out");
        }
        Command::Whoami => match manager.current_identity() {
            Some(identity) => {
                println!("{} <{}>", identity.display_name(), identity.email);
                println!("role: {}", identity.role.as_str());
            }
            None => bail!("Not signed in"),
        },
        Command::Register {
            username,
            email,
            first_name,
            last_name,
        } => {
            let password = rpassword::prompt_password("Password: ")?;
            let confirm = rpassword::prompt_password("Confirm password: ")?;
            if password != confirm {
                bail!("Passwords do not match");
            }
            let profile = RegistrationProfile {
                username,
                email,
                password,
                first_name,
                last_name,
            };
            let message = manager.register(&profile).await?;
            println!("{}", message);
        }
        Command::ForgotPassword { email } => {
            let message = manager.forgot_password(&email).await?;
            println!("{}", message);
        }
        Command::Get { path } => {
            let body = manager.request(&ApiRequest::get(path)).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;

    eprint!("{}", label);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
