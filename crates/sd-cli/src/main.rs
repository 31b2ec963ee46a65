//! sdrive: encrypted upload client
//!
//! Commands:
//!   upload <file>...   - encrypt and upload files into an in-process loopback drive
//!   status             - list file records in the local store
//!   config show        - display the active configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use sd_core::config::{expand_tilde, SdConfig, CONFIG_ENV};
use sd_core::UploadId;
use sd_upload::{
    ContentSource, FileDraft, FileUploader, LocalStore, LoopbackDrive, ParentFolder, PipelineOutcome, Signer,
    StageContext, UploadEvent, UploadOperationsFactory,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Progress bar resolution per upload
const PROGRESS_STEPS: u64 = 100;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "sdrive", version, about = "Encrypted drive upload client")]
struct Cli {
    /// Path to config.toml
    #[arg(long, short = 'c', env = CONFIG_ENV, default_value = "~/.config/sdrive/config.toml")]
    config: PathBuf,

    /// Log output format (overrides log.format in config)
    #[arg(long, global = true, value_parser = ["text", "json"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt and upload files
    Upload {
        /// Local files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Local store JSON file (overrides config)
        #[arg(long, env = "SDRIVE_STORE")]
        store: Option<PathBuf>,
        /// Share to upload into
        #[arg(long, default_value = "local-share")]
        share: String,
        /// Parent folder node
        #[arg(long, default_value = "root")]
        parent: String,
        /// MIME type for every file (guessed from the extension otherwise)
        #[arg(long)]
        mime_type: Option<String>,
    },

    /// List file records in the local store
    Status {
        /// Local store JSON file (overrides config)
        #[arg(long, env = "SDRIVE_STORE")]
        store: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = SdConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;
    let log_format = cli.log_format.as_deref().unwrap_or(&config.log.format);
    init_logging(&config.log.level, log_format);

    match cli.command {
        Commands::Upload {
            files,
            store,
            share,
            parent,
            mime_type,
        } => cmd_upload(&config, &files, store.as_deref(), &share, &parent, mime_type.as_deref()).await,
        Commands::Status { store } => cmd_status(&config, store.as_deref()),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
    }
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env("SDRIVE_LOG").unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Resolve the store path: CLI flag > config
fn resolve_store_path(config: &SdConfig, override_path: Option<&Path>) -> PathBuf {
    match override_path {
        Some(p) => p.to_path_buf(),
        None => expand_tilde(&config.store.path),
    }
}

fn make_progress_bar(multi: &MultiProgress, prefix: &str) -> Result<ProgressBar> {
    let pb = multi.add(ProgressBar::new(PROGRESS_STEPS));
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("building progress style")?
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

// ── `sdrive upload` ───────────────────────────────────────────────────────────

async fn cmd_upload(
    config: &SdConfig,
    files: &[PathBuf],
    store: Option<&Path>,
    share: &str,
    parent: &str,
    mime_type: Option<&str>,
) -> Result<()> {
    if let Some(missing) = files.iter().find(|p| !p.is_file()) {
        anyhow::bail!("not a file: {}", missing.display());
    }
    let store_path = resolve_store_path(config, store);
    let repo = Arc::new(
        LocalStore::open(&store_path).with_context(|| format!("opening local store: {}", store_path.display()))?,
    );
    let drive = Arc::new(LoopbackDrive::new());
    let ctx = StageContext::new(drive.clone(), drive, repo, config.upload.clone());
    let (uploader, mut events) = FileUploader::new(ctx, Arc::new(UploadOperationsFactory));

    // keys live as long as the loopback drive: this process
    let folder = ParentFolder::new(share, parent, sd_crypto::generate_key()).context("deriving folder keys")?;
    let signer = Signer {
        address: format!("{}@localhost", std::env::var("USER").unwrap_or_else(|_| "sdrive".into())),
        key: sd_crypto::generate_key(),
    };

    let multi = MultiProgress::new();
    let mut bars: HashMap<UploadId, ProgressBar> = HashMap::new();
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("no file name in {}", path.display()))?;
        let mut draft = FileDraft::new_file(folder.clone(), name.clone(), ContentSource::Path(path.clone()), signer.clone());
        if let Some(mime) = mime_type {
            draft = draft.with_mime_type(mime);
        }
        let id = uploader.submit(draft).with_context(|| format!("submitting {}", path.display()))?;
        bars.insert(id, make_progress_bar(&multi, &name)?);
    }

    let mut failures = 0usize;
    let mut remaining = bars.len();
    while remaining > 0 {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                multi.println("interrupted, cancelling uploads")?;
                uploader.cancel_all();
                continue;
            }
        };
        let Some(event) = event else { break };

        match event {
            UploadEvent::Progress(p) => {
                if let Some(pb) = bars.get(&p.upload_id) {
                    pb.set_position((p.fraction() * PROGRESS_STEPS as f64) as u64);
                    pb.set_message(p.stage);
                }
            }
            UploadEvent::Finished(report) => {
                remaining -= 1;
                let Some(pb) = bars.get(&report.upload_id) else {
                    continue;
                };
                match report.result {
                    Ok(PipelineOutcome::Completed) => pb.finish_with_message(format!(
                        "{} ({}, revision {})",
                        report.draft.name,
                        fmt_bytes(report.draft.revision.size),
                        report.draft.revision.id
                    )),
                    Ok(PipelineOutcome::Cancelled { stage }) => {
                        failures += 1;
                        pb.abandon_with_message(format!("cancelled at {stage}"));
                    }
                    Err(e) => {
                        failures += 1;
                        pb.abandon_with_message(format!("failed: {e}"));
                    }
                }
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} uploads did not complete", files.len());
    }
    println!("Uploaded {} file(s); store: {}", files.len(), store_path.display());
    Ok(())
}

// ── `sdrive status` ───────────────────────────────────────────────────────────

fn cmd_status(config: &SdConfig, store: Option<&Path>) -> Result<()> {
    let store_path = resolve_store_path(config, store);
    let repo = LocalStore::open(&store_path).with_context(|| format!("opening local store: {}", store_path.display()))?;
    let files = repo.files();
    if files.is_empty() {
        println!("No uploads recorded in {}", store_path.display());
        return Ok(());
    }

    println!("{:<32} {:<10} {:>10}  REVISION", "NAME", "STATE", "SIZE");
    for file in files {
        let revision = file
            .active_revision
            .as_ref()
            .or(file.revision_draft.as_ref())
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<32} {:<10} {:>10}  {}",
            file.name,
            format!("{:?}", file.state),
            fmt_bytes(file.size),
            revision
        );
    }
    Ok(())
}

// ── `sdrive config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &SdConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_upload() {
        let cli = Cli::try_parse_from(["sdrive", "upload", "a.txt", "b.txt", "--share", "S9"]).unwrap();
        let Commands::Upload { files, share, parent, .. } = cli.command else {
            panic!("expected upload");
        };
        assert_eq!(files, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
        assert_eq!(share, "S9");
        assert_eq!(parent, "root");
    }

    #[test]
    fn cli_parses_mime_override() {
        let cli = Cli::try_parse_from(["sdrive", "upload", "blob", "--mime-type", "text/plain"]).unwrap();
        let Commands::Upload { mime_type, .. } = cli.command else {
            panic!("expected upload");
        };
        assert_eq!(mime_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn log_format_flag_is_global() {
        let cli = Cli::try_parse_from(["sdrive", "status", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format.as_deref(), Some("json"));
        let cli = Cli::try_parse_from(["sdrive", "status"]).unwrap();
        assert_eq!(cli.log_format, None);
        assert!(Cli::try_parse_from(["sdrive", "--log-format", "xml", "status"]).is_err());
    }

    #[test]
    fn upload_requires_a_file() {
        assert!(Cli::try_parse_from(["sdrive", "upload"]).is_err());
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(4 * 1024 * 1024), "4.0 MB");
    }
}
