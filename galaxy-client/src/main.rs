use clap::{Args, Parser, Subcommand};
use galaxy_cdn::CdnClient;
use galaxy_engine::{DlcSelection, Engine, Error, InstallOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, warn};

mod auth;

use auth::TokenSource;

#[derive(Parser)]
#[command(
    name = "galaxydl",
    about = "Downloader, updater and repair tool for GOG Galaxy content",
    version,
    author,
    long_about = "Downloads, updates, repairs and patches game installations from the GOG \
                  content system, supporting both content-system generations, chunk-level \
                  reuse, binary deltas and resumable runs."
)]
struct Cli {
    /// Set the logging level
    #[arg(short, long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Configuration directory (manifest store lives here)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Bearer token for authenticated endpoints
    #[arg(long, global = true, env = "GOG_ACCESS_TOKEN")]
    token: Option<String>,

    /// JSON file holding the access token (re-read on every request)
    #[arg(long, global = true)]
    token_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Install a build from scratch (resumes an interrupted run)
    Download(InstallArgs),
    /// Bring an existing installation up to the target build
    Update(InstallArgs),
    /// Verify on-disk files and refetch only mismatching chunks
    Repair(InstallArgs),
    /// Print build sizes, languages, DLCs and branches as JSON (no writes)
    Info(InstallArgs),
    /// Install shared redistributables
    Redist(RedistArgs),
}

#[derive(Args)]
struct InstallArgs {
    /// Product id
    id: String,

    /// Base install path (the build's install directory is appended)
    #[arg(long)]
    path: PathBuf,

    /// Target platform
    #[arg(long, default_value = "windows")]
    platform: String,

    /// Language tag (e.g. en-US, de, pl-PL)
    #[arg(long, default_value = "en-US")]
    lang: String,

    /// Pin a specific build id
    #[arg(long)]
    build: Option<String>,

    /// Select a release branch
    #[arg(long)]
    branch: Option<String>,

    /// Password for protected branches
    #[arg(long)]
    password: Option<String>,

    /// Install every DLC the build offers
    #[arg(long, conflicts_with_all = ["skip_dlcs", "dlcs"])]
    with_dlcs: bool,

    /// Install the base game only
    #[arg(long)]
    skip_dlcs: bool,

    /// Comma-separated DLC id list
    #[arg(long, value_delimiter = ',')]
    dlcs: Vec<String>,

    /// Skip the base game's depots entirely
    #[arg(long)]
    dlc_only: bool,

    /// Downloader worker count (defaults to the CPU count)
    #[arg(long)]
    max_workers: Option<usize>,

    /// Force a content-system generation
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=2))]
    force_gen: Option<u32>,

    /// Root for support files (defaults to gog-support in the game dir)
    #[arg(long)]
    support_path: Option<PathBuf>,

    /// Downlink of the Linux native installer (products without Linux depots)
    #[arg(long)]
    installer_url: Option<String>,
}

impl InstallArgs {
    fn to_options(&self) -> InstallOptions {
        let mut opts = InstallOptions::new(&self.id, &self.path);
        opts.platform = self.platform.clone();
        opts.language = self.lang.clone();
        opts.build_id = self.build.clone();
        opts.branch = self.branch.clone();
        opts.branch_password = self.password.clone();
        opts.dlc_only = self.dlc_only;
        opts.support_path = self.support_path.clone();
        opts.force_generation = self.force_gen;
        opts.linux_installer_url = self.installer_url.clone();
        if let Some(workers) = self.max_workers {
            opts.workers = workers.max(1);
        }
        opts.dlcs = if self.skip_dlcs {
            DlcSelection::None
        } else if !self.dlcs.is_empty() {
            DlcSelection::Ids(self.dlcs.clone())
        } else if self.with_dlcs {
            DlcSelection::All
        } else {
            DlcSelection::None
        };
        opts
    }
}

#[derive(Args)]
struct RedistArgs {
    /// Comma-separated dependency ids
    #[arg(long, value_delimiter = ',', required = true)]
    ids: Vec<String>,

    /// Target directory for the shared redistributable tree
    #[arg(long)]
    path: PathBuf,

    /// Downloader worker count
    #[arg(long)]
    max_workers: Option<usize>,
}

/// Cancellation on SIGINT/SIGTERM; a second signal within the grace window
/// kills the process immediately
fn install_signal_handlers(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut received = 0u32;
        loop {
            wait_for_signal().await;
            received += 1;
            if received == 1 {
                warn!("signal received, finishing in-flight work (repeat to force quit)");
                cancel.cancel();
            } else {
                error!("second signal, terminating immediately");
                std::process::exit(-15);
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term =
        signal(SignalKind::terminate()).unwrap_or_else(|_| std::process::exit(1));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn config_dir(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("galaxydl")
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::from(cli.log_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let token_source: Arc<TokenSource> = Arc::new(match (&cli.token, &cli.token_file) {
        (Some(token), _) => TokenSource::Literal(token.clone()),
        (None, Some(path)) => TokenSource::File(path.clone()),
        (None, None) => TokenSource::None,
    });

    let client = match CdnClient::new() {
        Ok(client) => client.with_auth(token_source),
        Err(e) => {
            error!("failed to set up HTTP client: {e}");
            std::process::exit(1);
        }
    };
    let engine = Engine::new(client, config_dir(&cli));

    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone());

    let result = match &cli.command {
        Commands::Download(args) | Commands::Update(args) => {
            engine.install(&args.to_options(), cancel.clone()).await
        }
        Commands::Repair(args) => {
            let mut opts = args.to_options();
            opts.repair = true;
            engine.install(&opts, cancel.clone()).await
        }
        Commands::Info(args) => match engine.info(&args.to_options()).await {
            Ok(report) => {
                match serde_json::to_string_pretty(&report) {
                    Ok(rendered) => println!("{rendered}"),
                    Err(e) => error!("could not render report: {e}"),
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        Commands::Redist(args) => {
            engine
                .install_redist(
                    &args.ids,
                    &args.path,
                    args.max_workers.unwrap_or_else(|| {
                        std::thread::available_parallelism().map_or(4, |n| n.get())
                    }),
                    cancel.clone(),
                )
                .await
        }
    };

    match result {
        Ok(()) => {}
        Err(e) => {
            match &e {
                Error::NotEnoughDisk {
                    required,
                    available,
                    path,
                } => error!(
                    "not enough disk space at {path}: need {required} bytes, {available} free"
                ),
                Error::Cancelled => warn!("cancelled; rerun the same command to resume"),
                other => error!("{other}"),
            }
            std::process::exit(e.exit_code());
        }
    }
}
