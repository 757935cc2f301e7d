use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use podsync::sync::connect;
use podsync::{
    CredentialVault, DeviceId, DeviceRegistry, DeviceSelector, FileLibrary, NoopReporter,
    PassResult, ProgressEvent, ProgressReporter, ReqwestClient, ReqwestSessions,
    SharedProgressReporter, StateFile, SubscriptionStore, SyncEngine, SyncOptions, SyncSettings,
};

// Emoji with fallback for terminals without Unicode support
static SYNC: Emoji<'_, '_> = Emoji("🔄 ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static KEY: Emoji<'_, '_> = Emoji("🔑 ", "[k] ");
static UPLOAD: Emoji<'_, '_> = Emoji("📤 ", "[^] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");
static STAR: Emoji<'_, '_> = Emoji("⭐ ", "* ");

/// Synchronize podcast subscriptions and playback with gpodder servers
#[derive(Parser, Debug)]
#[command(name = "podsync")]
#[command(about = "Synchronize podcast subscriptions and playback with gpodder-compatible servers")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode - suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a sync pass for one user
    Sync(SyncArgs),

    /// Check that the configured servers accept our credentials
    TestConnection {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Manage local sync devices
    Devices {
        #[command(subcommand)]
        action: DevicesCommand,
    },

    /// Subscribe a user to a feed in the local library
    Subscribe {
        /// Feed URL
        url: String,

        #[arg(long)]
        library: PathBuf,

        #[arg(long)]
        user: i64,
    },

    /// Encrypt a server token for the settings file
    EncryptToken {
        /// Plaintext password or app token
        token: String,

        /// Base64 encryption key; a new one is generated when absent
        #[arg(long, env = "PODSYNC_ENCRYPTION_KEY", hide_env_values = true)]
        key: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Sync settings (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Base64 key that seals stored tokens
    #[arg(long, env = "PODSYNC_ENCRYPTION_KEY", hide_env_values = true)]
    key: Option<String>,
}

#[derive(Args, Debug)]
struct StateArgs {
    /// Device and cursor state file
    #[arg(long)]
    state: PathBuf,

    /// User to act for
    #[arg(long)]
    user: i64,

    /// Account that never owns devices or subscriptions
    #[arg(long, default_value = "1")]
    system_user: i64,
}

#[derive(Args, Debug)]
struct SyncArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(flatten)]
    state: StateArgs,

    /// Local library file
    #[arg(long)]
    library: PathBuf,

    /// Sync as this local device, created on first use
    #[arg(long, conflicts_with = "remote_device")]
    device: Option<String>,

    /// Sync as a device known only from the server's device list
    #[arg(long)]
    remote_device: Option<String>,

    /// Reset cursors and overwrite the server's subscription list
    #[arg(long)]
    force_full: bool,
}

#[derive(Subcommand, Debug)]
enum DevicesCommand {
    /// List local devices, and optionally those the servers know
    List {
        #[command(flatten)]
        state: StateArgs,

        /// Also query the configured servers
        #[arg(long, requires = "config")]
        remote: bool,

        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, env = "PODSYNC_ENCRYPTION_KEY", hide_env_values = true)]
        key: Option<String>,
    },

    /// Make a device the user's default
    SetDefault {
        id: i64,

        #[command(flatten)]
        state: StateArgs,
    },

    /// Remove a device and its cursors
    Remove {
        id: i64,

        #[command(flatten)]
        state: StateArgs,
    },
}

/// Progress reporter using an indicatif spinner for terminal output
struct IndicatifReporter {
    bar: ProgressBar,
}

impl IndicatifReporter {
    fn new() -> Self {
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let bar = ProgressBar::new_spinner();
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::PassStarting { server, device } => {
                self.bar.set_message(format!(
                    "{SEARCH}Syncing {} as {}",
                    server.cyan(),
                    device.bold()
                ));
            }

            ProgressEvent::Connected { server, auth_mode } => {
                self.bar.set_message(format!(
                    "{KEY}Connected to {} ({})",
                    server.cyan(),
                    auth_mode.yellow()
                ));
            }

            ProgressEvent::SubscriptionsPulled { to_add, to_remove } => {
                self.bar.set_message(format!(
                    "{SYNC}Subscriptions: {} to add, {} to remove",
                    to_add.to_string().green(),
                    to_remove.to_string().yellow()
                ));
            }

            ProgressEvent::SubscriptionApplied { url, title, added } => {
                let name = title.unwrap_or(url);
                let sign = if added { "+".green() } else { "-".yellow() };
                self.bar.println(format!("  {sign} {}", truncate_title(&name, 60)));
            }

            ProgressEvent::SubscriptionFailed { url, error } => {
                self.bar.println(format!(
                    "  {FAILURE}{} - {}",
                    truncate_title(&url, 40).red(),
                    error.dimmed()
                ));
            }

            ProgressEvent::SubscriptionsOverwritten { count } => {
                self.bar.println(format!(
                    "  {UPLOAD}Replaced server list with {} subscriptions",
                    count.to_string().cyan()
                ));
            }

            ProgressEvent::EpisodeActionsPulled {
                received,
                applied,
                skipped,
            } => {
                self.bar.set_message(format!(
                    "{SYNC}Episode actions: {} received, {} applied, {} skipped",
                    received.to_string().cyan(),
                    applied.to_string().green(),
                    skipped.to_string().dimmed()
                ));
            }

            ProgressEvent::UploadStarting { actions, chunks } => {
                self.bar.set_message(format!(
                    "{UPLOAD}Uploading {} actions in {} chunks",
                    actions.to_string().cyan(),
                    chunks.to_string().cyan()
                ));
            }

            ProgressEvent::ChunkUploaded { .. } => {}

            ProgressEvent::ChunkFailed { chunk, size, error } => {
                self.bar.println(format!(
                    "  {FAILURE}chunk {} ({} actions) - {}",
                    chunk,
                    size,
                    error.red()
                ));
            }

            ProgressEvent::PassCompleted {
                server,
                subscriptions_added,
                subscriptions_removed,
                actions_applied,
                actions_uploaded,
                errors,
            } => {
                self.bar.println(format!(
                    "{SUCCESS}{} {} +{} -{} subscriptions, {} applied, {} uploaded, {} errors",
                    "Done:".bold().green(),
                    server.cyan(),
                    subscriptions_added.to_string().green().bold(),
                    subscriptions_removed.to_string().yellow(),
                    actions_applied.to_string().green(),
                    actions_uploaded.to_string().green(),
                    if errors > 0 {
                        errors.to_string().red().bold()
                    } else {
                        errors.to_string().green()
                    }
                ));
            }
        }
    }
}

impl Drop for IndicatifReporter {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let cut: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "podsync=info",
        1 => "podsync=debug",
        _ => "podsync=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(path: &Path) -> Result<SyncSettings> {
    SyncSettings::load(path).with_context(|| format!("Failed to load settings from {}", path.display()))
}

fn open_state(path: &Path) -> Result<Arc<StateFile>> {
    let state = StateFile::open(path)
        .with_context(|| format!("Failed to open state file {}", path.display()))?;
    Ok(Arc::new(state))
}

fn open_vault(key: Option<&str>) -> Result<Arc<CredentialVault>> {
    let vault = CredentialVault::new(key).context("Invalid encryption key")?;
    Ok(Arc::new(vault))
}

/// Cancel the token on Ctrl-C so a pass stops at its next checkpoint
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", "Cancelling...".yellow());
            child.cancel();
        }
    });
    token
}

async fn run_sync(args: SyncArgs, reporter: SharedProgressReporter, quiet: bool) -> Result<bool> {
    let settings = load_settings(&args.config.config)?;
    let state = open_state(&args.state.state)?;
    let vault = open_vault(args.config.key.as_deref())?;
    let library = FileLibrary::open(ReqwestClient::new(), &args.library)
        .with_context(|| format!("Failed to open library {}", args.library.display()))?;

    let engine = SyncEngine::new(
        ReqwestSessions,
        state,
        Arc::new(library),
        vault,
        args.state.system_user,
    )
    .with_reporter(reporter);

    let selector = match (args.device, args.remote_device) {
        (Some(name), _) => DeviceSelector::Named(name),
        // The server's own id for the device is unknown here; any
        // negative id marks it as virtual.
        (None, Some(name)) => DeviceSelector::Remote {
            remote_id: DeviceId(-1),
            name,
        },
        (None, None) => DeviceSelector::Default,
    };
    let options = SyncOptions {
        selector,
        force_full: args.force_full,
    };

    let results = engine
        .sync_user(args.state.user, &settings, &options, &cancel_on_ctrl_c())
        .await
        .context("Sync failed")?;

    Ok(print_results(&results, quiet))
}

/// Print per-server outcomes; returns true when every pass succeeded
fn print_results(results: &[PassResult], quiet: bool) -> bool {
    let mut all_ok = true;
    for pass in results {
        match &pass.result {
            Ok(report) => {
                if quiet {
                    continue;
                }
                if report.is_in_sync() {
                    println!("{STAR}{} is in sync", pass.server.cyan());
                }
                if report.has_errors() {
                    println!("\n{}", "Recoverable errors:".red().bold());
                    for error in &report.errors {
                        println!("  {CROSS}{}", error.to_string().dimmed());
                    }
                }
            }
            Err(e) => {
                all_ok = false;
                eprintln!("{FAILURE}{} {}", pass.server.red().bold(), e);
            }
        }
    }
    all_ok
}

async fn run_test_connection(args: ConfigArgs) -> Result<bool> {
    let settings = load_settings(&args.config)?;
    let vault = open_vault(args.key.as_deref())?;
    let targets = settings.targets();
    if targets.is_empty() {
        bail!("Sync is disabled in {}", args.config.display());
    }

    let mut all_ok = true;
    for server in targets {
        match connect(&ReqwestSessions, &vault, server, &settings).await {
            Ok(transport) => println!(
                "{SUCCESS}{} accepts {} auth",
                server.label().cyan(),
                transport.auth_mode().to_string().green()
            ),
            Err(e) => {
                all_ok = false;
                eprintln!("{FAILURE}{} {}", server.label().red().bold(), e);
            }
        }
    }
    Ok(all_ok)
}

async fn run_devices(action: DevicesCommand) -> Result<()> {
    match action {
        DevicesCommand::List {
            state,
            remote,
            config,
            key,
        } => {
            let registry = DeviceRegistry::new(open_state(&state.state)?, state.system_user);
            let devices = registry.list_devices(state.user);
            if devices.is_empty() {
                println!("{}", "No local devices".dimmed());
            }
            for device in devices {
                let marker = if device.is_default { "*".green().bold() } else { " ".normal() };
                let last_sync = device
                    .last_sync
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{marker} {:>4} {} ({}) last sync: {}",
                    device.id.to_string().cyan(),
                    device.name.bold(),
                    device.device_type,
                    last_sync.dimmed()
                );
            }

            if remote && let Some(config) = config {
                let settings = load_settings(&config)?;
                let vault = open_vault(key.as_deref())?;
                for server in settings.targets() {
                    let transport = connect(&ReqwestSessions, &vault, server, &settings)
                        .await
                        .with_context(|| format!("Failed to connect to {}", server.label()))?;
                    let devices = transport
                        .list_devices()
                        .await
                        .with_context(|| format!("Failed to list devices on {}", server.label()))?;
                    println!("\n{}", server.label().bold());
                    for device in devices {
                        println!(
                            "  {} {} ({}, {} subscriptions)",
                            device.id.cyan(),
                            device.caption,
                            device.device_type,
                            device.subscriptions
                        );
                    }
                }
            }
        }

        DevicesCommand::SetDefault { id, state } => {
            let registry = DeviceRegistry::new(open_state(&state.state)?, state.system_user);
            registry
                .set_default_device(state.user, DeviceId(id))
                .context("Failed to set default device")?;
            println!("{SUCCESS}Device {} is now the default", id.to_string().cyan());
        }

        DevicesCommand::Remove { id, state } => {
            let registry = DeviceRegistry::new(open_state(&state.state)?, state.system_user);
            let removed = registry
                .remove_device(state.user, DeviceId(id))
                .context("Failed to remove device")?;
            if !removed {
                bail!("No device {id} for user {}", state.user);
            }
            println!("{SUCCESS}Removed device {}", id.to_string().cyan());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let ok = match cli.command {
        Command::Sync(args) => {
            let reporter: SharedProgressReporter = if cli.quiet {
                NoopReporter::shared()
            } else {
                Arc::new(IndicatifReporter::new())
            };
            run_sync(args, reporter, cli.quiet).await?
        }
        Command::TestConnection { config } => run_test_connection(config).await?,
        Command::Devices { action } => {
            run_devices(action).await?;
            true
        }
        Command::Subscribe { url, library, user } => {
            let library = FileLibrary::open(ReqwestClient::new(), &library)
                .with_context(|| format!("Failed to open library {}", library.display()))?;
            let id = library
                .add_from_feed(user, &url)
                .await
                .with_context(|| format!("Failed to subscribe to {url}"))?;
            println!("{SUCCESS}Subscribed to {} (podcast {})", url.cyan(), id.0);
            true
        }
        Command::EncryptToken { token, key } => {
            let key = match key {
                Some(key) => key,
                None => {
                    let key = CredentialVault::generate_key();
                    eprintln!("{KEY}Generated key, export it as PODSYNC_ENCRYPTION_KEY:");
                    eprintln!("{}", key.yellow());
                    key
                }
            };
            let vault = CredentialVault::new(Some(&key)).context("Invalid encryption key")?;
            println!("{}", vault.encrypt(&token).context("Failed to encrypt token")?);
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
