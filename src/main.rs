use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tokio::sync::watch;

use tarpipe::{Config, Settings, TarChoice};

#[derive(Parser, Debug)]
#[command(
    name = "tarpipe",
    version,
    about = "Mirror a directory to a remote machine through a shell, one tar archive per file",
    long_about = "Mirror a directory to a remote machine through a shell, one tar archive per file.

The connection command must start a shell that reads commands from stdin.

EXAMPLE:
    tarpipe ./project /home/me/mirror -- ssh build-host bash"
)]
struct Cli {
    /// Directory to mirror
    source_dir: PathBuf,

    /// Absolute remote directory that receives the mirrored directory
    dest_parent_dir: PathBuf,

    /// Command that opens a shell on the destination, e.g. `ssh host bash`
    #[arg(last = true, value_name = "CONNECTION_COMMAND")]
    connection_command: Vec<String>,

    /// Remove everything in the remote destination before copying
    #[arg(long)]
    clean_out_first: bool,

    /// Skip the initial full copy
    #[arg(long)]
    no_initial_replication: bool,

    /// Exit after the initial copy instead of watching for changes
    #[arg(long)]
    no_watch: bool,

    /// Copy files even when the ignore file excludes them
    #[arg(long)]
    no_gitignore: bool,

    /// Ignore file name at the root of the source directory
    #[arg(long, value_name = "NAME")]
    ignore_file: Option<String>,

    /// Local tar flavor
    #[arg(long, value_enum, value_name = "FLAVOR")]
    local_tar: Option<TarChoice>,

    /// Remote tar flavor (must be GNU tar)
    #[arg(long, value_enum, value_name = "FLAVOR")]
    remote_tar: Option<TarChoice>,

    /// Stop watching after this many seconds without changes
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// How often the watcher checks for stop and timeout
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval_ms: Option<u64>,

    /// Config file (default: <config dir>/tarpipe/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose level: -v DEBUG / -vv TRACE (default: INFO, or RUST_LOG)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Config values with command-line flags layered on top.
    fn settings(self, config: &Config) -> Settings {
        let mut settings = Settings::from_config(
            config,
            self.source_dir,
            self.dest_parent_dir,
            self.connection_command,
        );
        settings.clean_first = self.clean_out_first;
        if self.no_initial_replication {
            settings.initial_replication = false;
        }
        if self.no_watch {
            settings.watch = false;
        }
        if self.no_gitignore {
            settings.gitignore = false;
        }
        if let Some(name) = self.ignore_file {
            settings.ignore_file = name;
        }
        if let Some(choice) = self.local_tar {
            settings.local_tar = choice;
        }
        if let Some(choice) = self.remote_tar {
            settings.remote_tar = choice;
        }
        if let Some(secs) = self.idle_timeout {
            settings.idle_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(ms) = self.poll_interval_ms {
            settings.poll_interval = Duration::from_millis(ms);
        }
        settings
    }
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match replicate(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn replicate(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let settings = cli.settings(&config);
    settings.validate()?;

    if settings.clean_first {
        eprintln!(
            "{}",
            format!(
                "Cleaning out {} before replicating",
                settings.dest_dir()?.display()
            )
            .green()
            .bold()
        );
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, finishing the current file");
            let _ = stop_tx.send(true);
        }
    });

    let summary = tarpipe::run(&settings, stop_rx).await?;
    tracing::info!(
        files = summary.files_sent,
        bytes = summary.bytes_sent,
        "replication stopped"
    );
    Ok(())
}
