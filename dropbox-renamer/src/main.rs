use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dropbox_core::{ApiErrorClass, DropboxClient, Metadata};
use dropbox_renamer::config::{
    DEFAULT_CONCURRENCY, DEFAULT_DEST_DIR, DEFAULT_EXCLUDED_FOLDER,
    DEFAULT_MAX_CONSECUTIVE_LOCAL_FAILURES, RetryConfig, RunConfig,
};
use dropbox_renamer::diagnostics;
use dropbox_renamer::pipeline::naming::DEFAULT_MAX_DISAMBIGUATOR;
use dropbox_renamer::pipeline::paths::normalize_source_folder;
use dropbox_renamer::pipeline::retry::DEFAULT_MAX_ATTEMPTS;
use dropbox_renamer::pipeline::{self, DropboxRemote, RunError, RunSummary};
use dropbox_renamer::token::{TOKEN_ENV, TOKEN_FILE, TokenResolver};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const EXIT_FATAL: u8 = 2;
const DEFAULT_ENV_FILE: &str = ".env";

#[derive(Debug, Parser)]
#[command(name = "dropbox-renamer", version)]
#[command(about = "Download a Dropbox folder, prefixing each file with its modification date")]
struct Cli {
    /// Dropbox folder path or web URL (e.g. /Customers or https://www.dropbox.com/home/Customers)
    #[arg(short = 'f', long = "dropbox-folder", env = "DROPBOX_FOLDER")]
    folder: String,

    /// Local directory to save files into
    #[arg(short = 'd', long, env = "DROPBOX_DEST_DIR", default_value = DEFAULT_DEST_DIR)]
    directory: PathBuf,

    /// Env file with DROPBOX_ACCESS_TOKEN and any of the DROPBOX_* settings
    #[arg(short = 'e', long, default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Access token; overrides the environment
    #[arg(long, hide_env_values = true)]
    token: Option<String>,

    /// Include subfolders, mirroring their layout locally
    #[arg(short, long)]
    recursive: bool,

    /// Parallel downloads
    #[arg(short = 'j', long, env = "DROPBOX_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Calls per file or listing page before giving up
    #[arg(long, env = "DROPBOX_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Save into a new dropbox_download_<timestamp> folder
    #[arg(long)]
    run_subfolder: bool,

    /// Folder names to skip in recursive runs
    #[arg(long = "exclude", value_name = "NAME", default_values_t = [DEFAULT_EXCLUDED_FOLDER.to_string()])]
    excluded: Vec<String>,

    /// Prefix names that already start with a date as well
    #[arg(long)]
    reprefix_dated: bool,

    /// Highest numeric suffix tried before a name counts as exhausted
    #[arg(long, default_value_t = DEFAULT_MAX_DISAMBIGUATOR)]
    max_suffix: u32,

    /// Stop after this many local write failures in a row (0 never stops)
    #[arg(long, default_value_t = DEFAULT_MAX_CONSECUTIVE_LOCAL_FAILURES)]
    max_local_failures: u32,

    /// Entries per listing page requested from Dropbox
    #[arg(long)]
    page_limit: Option<u32>,

    /// Print what the token can see (account, shared and mounted folders, root) before downloading
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn run_config(&self, source_folder: String) -> RunConfig {
        RunConfig {
            source_folder,
            destination_root: self.directory.clone(),
            recursive: self.recursive,
            concurrency: self.concurrency,
            retry: RetryConfig {
                max_attempts: self.max_attempts,
                ..RetryConfig::default()
            },
            max_disambiguator: self.max_suffix,
            keep_existing_prefix: !self.reprefix_dated,
            excluded_folders: self.excluded.clone(),
            run_subfolder: self.run_subfolder,
            max_consecutive_local_failures: self.max_local_failures,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

/// The env file is named on the command line but has to be loaded before
/// clap resolves its `env` fallbacks, so it is picked out of the raw arguments.
fn env_file_from_args(args: &[OsString]) -> PathBuf {
    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        let arg = arg.to_string_lossy();
        if arg == "--" {
            break;
        }
        if arg == "-e" || arg == "--env-file" {
            if let Some(value) = rest.next() {
                return PathBuf::from(value);
            }
        } else if let Some(value) = arg.strip_prefix("--env-file=") {
            return PathBuf::from(value);
        }
    }
    PathBuf::from(DEFAULT_ENV_FILE)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<OsString> = std::env::args_os().collect();
    let env_file = env_file_from_args(&args);
    let loaded = if env_file.exists() {
        dotenvy::from_path(&env_file)
    } else {
        Ok(())
    };
    let cli = Cli::parse_from(args);
    init_tracing();
    if let Err(err) = loaded {
        tracing::error!("failed to load {}: {err}", env_file.display());
        return ExitCode::from(EXIT_FATAL);
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(mut cli: Cli) -> anyhow::Result<ExitCode> {
    let (token, source) = TokenResolver::new(&cli.env_file, TOKEN_FILE)
        .resolve(cli.token.take(), std::env::var(TOKEN_ENV).ok())
        .context("failed to obtain a Dropbox access token")?;
    tracing::debug!(?source, "access token resolved");

    let client = DropboxClient::new(token).context("failed to build Dropbox client")?;
    let account = client
        .current_account()
        .await
        .context("failed to verify the access token")?;
    tracing::info!(
        account = %account.name.display_name,
        email = account.email.as_deref().unwrap_or("-"),
        "connected to Dropbox"
    );

    let folder = normalize_source_folder(&cli.folder);
    if cli.debug {
        print!("{}", diagnostics::describe(&client, &folder).await);
    }
    if !folder.is_empty() {
        check_folder(&client, &folder).await?;
    }

    let config = cli.run_config(folder);
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight work");
            on_signal.cancel();
        }
    });

    let mut remote = DropboxRemote::new(client);
    if let Some(limit) = cli.page_limit {
        remote = remote.with_page_limit(limit);
    }
    match pipeline::run(Arc::new(remote), &config, cancel).await {
        Ok(summary) => {
            print!("{}", render_summary(&summary));
            Ok(ExitCode::from(summary.exit_code()))
        }
        Err(RunError::FolderNotFound(folder)) => {
            anyhow::bail!("Dropbox folder {folder:?} does not exist or is not visible to this token")
        }
        Err(err) => Err(err).context("run aborted before any download"),
    }
}

async fn check_folder(client: &DropboxClient, folder: &str) -> anyhow::Result<()> {
    match client.get_metadata(folder).await {
        Ok(Metadata::Folder(_)) => Ok(()),
        Ok(_) => anyhow::bail!("{folder:?} is not a folder"),
        Err(err) if err.classification() == ApiErrorClass::NotFound => {
            anyhow::bail!("Dropbox folder {folder:?} does not exist or is not visible to this token")
        }
        Err(err) if err.classification() == ApiErrorClass::Auth => {
            Err(err).context("Dropbox rejected the access token")
        }
        Err(err) => {
            // Listing retries on its own and reports the definitive error.
            tracing::warn!(error = %err, folder, "could not check source folder");
            Ok(())
        }
    }
}

fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Downloaded: {}", summary.succeeded);
    let _ = writeln!(out, "Skipped:    {}", summary.skipped);
    let _ = writeln!(out, "Failed:     {}", summary.failed);
    let _ = writeln!(out, "Bytes:      {}", summary.bytes_written);
    if !summary.failures.is_empty() {
        let _ = writeln!(out, "Failures:");
        for failed in &summary.failures {
            let _ = writeln!(
                out,
                "  {} [{}] after {} attempt(s): {}",
                failed.descriptor.remote_path,
                failed.failure.kind,
                failed.failure.attempts,
                failed.failure.message
            );
        }
    }
    if let Some(interruption) = &summary.interruption {
        let _ = writeln!(out, "Incomplete run: {interruption}");
    }
    out
}
