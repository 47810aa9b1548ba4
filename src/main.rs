#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use botway::materialize;
use botway::profile::{ProfileError, ProfileStore};
use botway::webhook::WebhookClient;
use botway::{doctor, lifecycle, logs, monitor, tunnel};

/// Keeps a Telegram bot reachable: cloudflared tunnel, webhook, gateway,
/// and a health monitor, per named profile.
#[derive(Parser, Debug)]
#[command(name = "botway")]
#[command(version)]
#[command(about = "Profile orchestrator for tunnel-fronted Telegram bots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum ProfileCommands {
    /// Create a profile
    Create {
        /// Profile name (letters, digits, '-', '_')
        name: String,

        /// Bot token from @BotFather
        #[arg(long)]
        token: String,

        /// Local port the gateway listens on
        #[arg(long)]
        port: u16,

        /// Human-readable name (defaults to the profile name)
        #[arg(long)]
        display_name: Option<String>,
    },
    /// List profiles
    List,
    /// Show a profile record (token redacted)
    Show { name: String },
    /// Delete a profile and all its state
    Remove { name: String },
}

#[derive(Subcommand, Debug)]
enum WebhookCommands {
    /// Show the registration Telegram currently holds
    Show { name: String },
    /// Re-register the webhook against the current tunnel address
    Sync { name: String },
    /// Delete the remote registration
    Delete { name: String },
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage profile records
    Profile {
        #[command(subcommand)]
        profile_command: ProfileCommands,
    },

    /// Start a profile: tunnel, webhook, gateway, monitor
    Start { name: String },

    /// Stop a profile and remove its webhook
    Stop { name: String },

    /// Stop then start a profile
    Restart { name: String },

    /// Show role liveness for one or all profiles
    Status { name: Option<String> },

    /// Print or follow a profile's logs
    Logs {
        name: String,

        /// Which log: gateway, tunnel, or orchestrator
        #[arg(long, default_value = "gateway")]
        role: String,

        /// Lines of history to print
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Keep streaming as the log grows
        #[arg(short, long)]
        follow: bool,
    },

    /// Inspect or fix the Telegram webhook registration
    Webhook {
        #[command(subcommand)]
        webhook_command: WebhookCommands,
    },

    /// Internal: run the health monitor loop for a profile
    #[command(hide = true)]
    Monitor { name: String },

    /// Check the environment and profiles for problems
    Doctor { name: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Pin the rustls crypto provider before any TLS client is built.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to INFO.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let store = ProfileStore::open()?;

    match cli.command {
        Commands::Profile { profile_command } => run_profile(&store, profile_command),
        Commands::Start { name } => lifecycle::start_profile(&store, &name).await,
        Commands::Stop { name } => lifecycle::stop_profile(&store, &name).await,
        Commands::Restart { name } => lifecycle::restart_profile(&store, &name).await,
        Commands::Status { name } => lifecycle::status(&store, name.as_deref()),
        Commands::Logs {
            name,
            role,
            lines,
            follow,
        } => run_logs(&store, &name, &role, lines, follow).await,
        Commands::Webhook { webhook_command } => run_webhook(&store, webhook_command).await,
        Commands::Monitor { name } => monitor::run(&store, &name).await,
        Commands::Doctor { name } => {
            if doctor::run(&store, name.as_deref())? {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
    }
}

fn run_profile(store: &ProfileStore, command: ProfileCommands) -> Result<()> {
    match command {
        ProfileCommands::Create {
            name,
            token,
            port,
            display_name,
        } => {
            let profile = store.create(&name, &token, port, display_name.as_deref())?;
            println!("✅ Created profile '{}' (port {})", profile.name, profile.port);
            println!("   Start it with: botway start {}", profile.name);
            Ok(())
        }
        ProfileCommands::List => {
            let summaries = store.list()?;
            if summaries.is_empty() {
                println!("No profiles yet. Create one with: botway profile create <name>");
                return Ok(());
            }
            for s in summaries {
                println!("{:<20} {:<24} port {}", s.name, s.display_name, s.port);
            }
            Ok(())
        }
        ProfileCommands::Show { name } => {
            let mut profile = store.load(&name)?;
            profile.token = redact_token(&profile.token);
            if let Some(t) = profile.internal_token.as_mut() {
                *t = "***".to_string();
            }
            print!("{}", toml::to_string_pretty(&profile)?);
            Ok(())
        }
        ProfileCommands::Remove { name } => {
            let registry = botway::registry::Registry::new(&store.profile_dir(&name));
            for role in botway::registry::Role::ALL {
                if let Some(pid) = registry.alive(role) {
                    bail!("Profile '{name}' has a running {role} (PID {pid}); stop it first");
                }
            }
            store.remove(&name)?;
            println!("✅ Removed profile '{name}'");
            Ok(())
        }
    }
}

/// Keep the bot-id prefix so a redacted record is still attributable.
fn redact_token(token: &str) -> String {
    match token.split_once(':') {
        Some((id, _)) => format!("{id}:***"),
        None => "***".to_string(),
    }
}

async fn run_logs(
    store: &ProfileStore,
    name: &str,
    role: &str,
    lines: usize,
    follow: bool,
) -> Result<()> {
    if !matches!(role, "gateway" | "tunnel" | "orchestrator") {
        bail!("Unknown log role '{role}' (expected gateway, tunnel, or orchestrator)");
    }
    // Resolve the profile first so a typo'd name errors instead of
    // printing an empty log.
    match store.load(name) {
        Ok(_) => {}
        Err(ProfileError::NotFound(_)) => bail!("No profile named '{name}'"),
        Err(e) => return Err(e.into()),
    }

    let path = logs::log_path(&store.profile_dir(name), role);
    if follow {
        logs::follow(&path, lines).await
    } else {
        print!("{}", logs::tail(&path, lines)?);
        Ok(())
    }
}

async fn run_webhook(store: &ProfileStore, command: WebhookCommands) -> Result<()> {
    match command {
        WebhookCommands::Show { name } => {
            let profile = store.load(&name)?;
            let info = WebhookClient::new(profile.token).fetch().await?;
            if info.url.is_empty() {
                println!("No webhook registered");
            } else {
                println!("url:             {}", info.url);
                println!("pending updates: {}", info.pending_update_count);
            }
            if let Some(err) = info.last_error_message {
                println!("last error:      {err}");
            }
            Ok(())
        }
        WebhookCommands::Sync { name } => {
            let profile = store.load(&name)?;
            let dir = store.profile_dir(&name);
            let Some(url) = tunnel::current_url(&dir) else {
                bail!("Profile '{name}' has no tunnel address; start it first");
            };
            let expected = materialize::webhook_url(&url);
            let changed = WebhookClient::new(profile.token)
                .reconcile(&expected)
                .await?;
            if changed {
                println!("✅ Webhook re-registered as {expected}");
            } else {
                println!("✅ Webhook already correct ({expected})");
            }
            Ok(())
        }
        WebhookCommands::Delete { name } => {
            let profile = store.load(&name)?;
            WebhookClient::new(profile.token).remove().await?;
            println!("✅ Webhook deleted");
            Ok(())
        }
    }
}
