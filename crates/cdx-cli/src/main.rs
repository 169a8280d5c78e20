//! cdx: cipherdex command-line client
//!
//! Commands:
//!   init                 - set the vault password (creates the vault header)
//!   status               - vault state, index backend and size, storage health
//!   upload <files..>     - encrypt, store, and index files
//!   search <query>       - exact / forward / substring / fuzzy / ranked search
//!   fetch <id>           - decrypt a document (or dump its ciphertext record)
//!   delete <id>          - remove a document and its postings
//!   list                 - stored documents with decrypted filenames
//!   migrate <backend>    - move the index to another backend
//!   verify               - audit every posting-list integrity tag
//!   config show          - display the active configuration
//!
//! Every command that needs keys unlocks the vault for the duration of the
//! process only. The password comes from `CDX_PASSWORD` or a prompt.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cdx_core::config::{expand_tilde, CdxConfig, IndexBackendKind, StorageBackendKind};
use cdx_core::{DocumentId, KeywordCombine, SearchMode};
use cdx_crypto::VaultState;
use cdx_engine::{Engine, SearchOptions, SearchOutcome};
use cdx_storage::S3Credentials;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "cdx",
    version,
    about = "cipherdex searchable encrypted document store",
    long_about = "cdx: encrypt documents, index them under opaque tokens, and search without revealing keywords to storage"
)]
struct Cli {
    /// Path to cdx.toml configuration file
    #[arg(long, short = 'c', env = "CDX_CONFIG", default_value = "~/.config/cdx/cdx.toml")]
    config: PathBuf,

    /// Log output format (overrides logging.format)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Vault password (prompted for when unset)
    #[arg(long, env = "CDX_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Exact,
    Forward,
    Substring,
    Fuzzy,
    Ranked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum CombineArg {
    And,
    Or,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the vault and set its password
    Init,

    /// Show vault, index, and storage status
    Status,

    /// Encrypt, store, and index one or more files
    Upload {
        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Search the encrypted index
    Search {
        /// Query keyword (ranked mode accepts several)
        #[arg(default_value = "")]
        query: String,
        #[arg(long, short = 'm', value_enum, default_value = "exact")]
        mode: ModeArg,
        /// N-gram size for substring mode (default: index.substring_n)
        #[arg(long)]
        n: Option<usize>,
        /// Maximum edit distance for fuzzy mode (default: search.max_edit_distance)
        #[arg(long)]
        max_distance: Option<usize>,
        /// Result count for ranked mode (default: search.default_top_k)
        #[arg(long)]
        top_k: Option<usize>,
        /// Comma-separated keywords combined with --combine (exact lookups)
        #[arg(long, value_delimiter = ',')]
        keywords: Vec<String>,
        #[arg(long, value_enum, default_value = "and")]
        combine: CombineArg,
        /// Pad the response with synthetic IDs up to this size
        #[arg(long)]
        pad_to: Option<usize>,
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long)]
        limit: Option<usize>,
        /// Show the query token prefix
        #[arg(long)]
        trace: bool,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decrypt a document to stdout or a file
    Fetch {
        id: DocumentId,
        /// Write plaintext here instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Print the stored ciphertext record without decrypting
        #[arg(long)]
        raw: bool,
    },

    /// Delete a document and its index entries
    Delete { id: DocumentId },

    /// List stored documents
    List {
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Move the index to another backend (log, table, rocksdb)
    Migrate { backend: IndexBackendKind },

    /// Verify every posting-list integrity tag
    Verify,

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
    let config = CdxConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let format = cli.log_format.unwrap_or(if config.logging.format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    init_logging(&config.logging.level, format);

    if let Commands::Config {
        action: ConfigAction::Show,
    } = &cli.command
    {
        return cmd_config_show(&config, &config_path);
    }

    let credentials = s3_credentials_from_env(&config)?;
    let engine = Engine::open(config, credentials.as_ref()).context("opening cipherdex")?;
    let password = cli.password.map(SecretString::from);

    match cli.command {
        Commands::Init => cmd_init(&engine, password),
        Commands::Status => cmd_status(&engine).await,
        Commands::Upload { files } => {
            unlock(&engine, password)?;
            cmd_upload(&engine, &files).await
        }
        Commands::Search {
            query,
            mode,
            n,
            max_distance,
            top_k,
            keywords,
            combine,
            pad_to,
            skip,
            limit,
            trace,
            json,
        } => {
            unlock(&engine, password)?;
            let options = SearchOptions {
                pad_to,
                skip,
                limit,
                trace,
            };
            let outcome = if keywords.is_empty() {
                let mode = search_mode(engine.config(), mode, n, max_distance, top_k);
                engine.search(&query, mode, &options).await?
            } else {
                let combine = match combine {
                    CombineArg::And => KeywordCombine::And,
                    CombineArg::Or => KeywordCombine::Or,
                };
                engine.search_keywords(&keywords, combine, &options).await?
            };
            print_outcome(&engine, &outcome, json).await
        }
        Commands::Fetch { id, output, raw } => {
            if !raw {
                unlock(&engine, password)?;
            }
            cmd_fetch(&engine, &id, output.as_deref(), raw).await
        }
        Commands::Delete { id } => {
            unlock(&engine, password)?;
            let postings = engine.delete(&id).await?;
            println!("deleted {id} ({postings} posting lists updated)");
            Ok(())
        }
        Commands::List { skip, limit } => {
            unlock(&engine, password)?;
            cmd_list(&engine, skip, limit).await
        }
        Commands::Migrate { backend } => {
            let report = engine.migrate_index(backend)?;
            println!("Migrated index {} → {}", report.from, report.to);
            println!("  postings copied:    {}", report.postings_copied);
            println!("  postings unchanged: {}", report.postings_unchanged);
            println!("  counters copied:    {}", report.counters_copied);
            println!("  verified:           {}", report.verified);
            println!("Set index.backend = \"{}\" in your config to keep using it.", report.to);
            Ok(())
        }
        Commands::Verify => {
            unlock(&engine, password)?;
            let report = engine.verify_index()?;
            println!("checked {} posting lists", report.checked);
            if report.is_ok() {
                println!("all integrity tags valid");
                Ok(())
            } else {
                for token in &report.failed {
                    println!("  FAILED token {token}..");
                }
                anyhow::bail!("{} posting lists failed verification", report.failed.len())
            }
        }
        Commands::Config { .. } => Ok(()),
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env("CDX_LOG").unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command output; logs go to stderr
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Credentials and password ──────────────────────────────────────────────────

/// S3 credentials from AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY (or the
/// CDX_-prefixed variants). Only consulted for the s3 backend.
fn s3_credentials_from_env(config: &CdxConfig) -> Result<Option<S3Credentials>> {
    if config.storage.backend != StorageBackendKind::S3 {
        return Ok(None);
    }
    let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("CDX_ACCESS_KEY_ID"))
        .context(
            "S3 credentials not set\n\
             Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.",
        )?;
    let secret = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("CDX_SECRET_ACCESS_KEY"))
        .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
    Ok(Some(S3Credentials {
        access_key_id,
        secret_access_key: SecretString::from(secret),
    }))
}

fn read_password(given: Option<SecretString>, prompt: &str) -> Result<SecretString> {
    match given {
        Some(pw) => Ok(pw),
        None => rpassword::prompt_password(prompt)
            .map(SecretString::from)
            .context("reading password"),
    }
}

fn unlock(engine: &Engine, password: Option<SecretString>) -> Result<()> {
    if engine.vault().status() == VaultState::Uninitialized {
        anyhow::bail!("vault is not initialized; run `cdx init` first");
    }
    let password = read_password(password, "Vault password: ")?;
    let spinner = make_spinner("unlock");
    spinner.set_message("deriving keys...");
    let result = engine.vault().unlock(&password);
    spinner.finish_and_clear();
    result.context("unlocking vault")
}

// ── Progress helpers ──────────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) =
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}") {
        pb.set_style(style);
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

// ── `cdx init` ────────────────────────────────────────────────────────────────

fn cmd_init(engine: &Engine, password: Option<SecretString>) -> Result<()> {
    use secrecy::ExposeSecret;

    if engine.vault().status() != VaultState::Uninitialized {
        anyhow::bail!("vault is already initialized");
    }
    let password = match password {
        Some(pw) => pw,
        None => {
            let first = read_password(None, "New vault password: ")?;
            let second = read_password(None, "Repeat password: ")?;
            if first.expose_secret() != second.expose_secret() {
                anyhow::bail!("passwords do not match");
            }
            first
        }
    };

    let spinner = make_spinner("init");
    spinner.set_message("deriving keys...");
    let salt = engine.vault().initialize(&password);
    spinner.finish_and_clear();
    let salt = salt.context("initializing vault")?;

    println!("Vault initialized");
    if let Some(header) = engine.vault().header() {
        println!("  kdf:   {}", header.kdf.name());
    }
    println!("  salt:  {}", STANDARD.encode(salt));
    println!(
        "  header: {}",
        expand_tilde(&engine.config().vault.header_path).display()
    );
    Ok(())
}

// ── `cdx status` ──────────────────────────────────────────────────────────────

async fn cmd_status(engine: &Engine) -> Result<()> {
    let config = engine.config();
    println!("cipherdex v{}", env!("CARGO_PKG_VERSION"));
    println!("  vault:     {}", engine.vault().status());
    println!(
        "  index:     {} at {} ({} posting lists)",
        engine.index().kind()?,
        engine.index().dir().display(),
        engine.index().len()?
    );
    println!(
        "  forward privacy: {}",
        if config.index.forward_privacy { "on" } else { "off" }
    );
    match engine.check_storage().await {
        Ok(()) => {
            let docs = engine.documents().list().await?.len();
            println!("  storage:   {:?} reachable ({docs} documents)", config.storage.backend);
        }
        Err(e) => println!("  storage:   {:?} UNREACHABLE: {e}", config.storage.backend),
    }
    Ok(())
}

// ── `cdx upload` ──────────────────────────────────────────────────────────────

async fn cmd_upload(engine: &Engine, files: &[PathBuf]) -> Result<()> {
    let pb = make_progress_bar(files.len() as u64, "upload");
    let mut uploaded = Vec::with_capacity(files.len());
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        pb.set_message(name.clone());
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let receipt = engine
            .upload(&bytes, &name)
            .await
            .with_context(|| format!("uploading {}", path.display()))?;
        uploaded.push((name, receipt.record.id, receipt.keywords, bytes.len()));
        pb.inc(1);
    }
    pb.finish_with_message("done");

    println!();
    for (name, id, keywords, size) in &uploaded {
        println!("  {id}  {name}  ({}, {keywords} keywords)", fmt_bytes(*size as u64));
    }
    println!("Uploaded {} documents", uploaded.len());
    Ok(())
}

// ── `cdx search` ──────────────────────────────────────────────────────────────

fn search_mode(
    config: &CdxConfig,
    mode: ModeArg,
    n: Option<usize>,
    max_distance: Option<usize>,
    top_k: Option<usize>,
) -> SearchMode {
    match mode {
        ModeArg::Exact => SearchMode::Exact,
        ModeArg::Forward => SearchMode::Forward,
        ModeArg::Substring => SearchMode::Substring {
            n: n.unwrap_or(config.index.substring_n),
        },
        ModeArg::Fuzzy => SearchMode::Fuzzy {
            max_distance: max_distance.unwrap_or(config.search.max_edit_distance),
        },
        ModeArg::Ranked => SearchMode::Ranked {
            top_k: top_k.unwrap_or(config.search.default_top_k),
        },
    }
}

async fn print_outcome(engine: &Engine, outcome: &SearchOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    if let Some(token) = &outcome.query_token {
        println!("token: {token}..");
    }
    println!("{} results", outcome.total);
    for id in &outcome.document_ids {
        if id.is_synthetic() {
            println!("  {id}  (padding)");
            continue;
        }
        match engine.decrypt_filename(id).await {
            Ok(name) => println!("  {id}  {name}"),
            Err(e) => println!("  {id}  <{e}>"),
        }
    }
    Ok(())
}

// ── `cdx fetch` ───────────────────────────────────────────────────────────────

async fn cmd_fetch(engine: &Engine, id: &DocumentId, output: Option<&Path>, raw: bool) -> Result<()> {
    if raw {
        let record = engine.fetch(id).await?;
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }
    let plaintext = engine.decrypt(id).await?;
    match output {
        Some(path) => {
            tokio::fs::write(path, &plaintext)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            eprintln!("wrote {} to {}", fmt_bytes(plaintext.len() as u64), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&plaintext)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

// ── `cdx list` ────────────────────────────────────────────────────────────────

async fn cmd_list(engine: &Engine, skip: usize, limit: usize) -> Result<()> {
    let page = engine.list_documents(skip, limit).await?;
    println!("{} documents", page.total);
    for doc in &page.documents {
        let name = engine
            .decrypt_filename(&doc.id)
            .await
            .unwrap_or_else(|e| format!("<{e}>"));
        println!("  {}  {:>10}  {name}", doc.id, fmt_bytes(doc.size as u64));
    }
    Ok(())
}

// ── `cdx config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &CdxConfig, config_path: &Path) -> Result<()> {
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

// ── Utilities ─────────────────────────────────────────────────────────────────

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
        format!("{bytes} B")
    }
}
