//! Command-line client for Keepsake.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use keepsake_core::{
    AuthToken, ClientConfig, ContentHash, CredentialIssuer, EndpointEntry, EndpointList,
    EndpointOutcome, EndpointSelection, EndpointSet, Identity, TokenRequest,
};
use keepsake_engine::{
    Availability, BlobPayload, BlobTransferEngine, MirrorOutcome, OperationOptions, UploadReport,
};
use keepsake_signer::{KeyPair, LocalKeyIssuer};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "keepsakectl")]
#[command(about = "Store, list and repair blobs across several endpoints")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct GlobalArgs {
    /// Client config file path
    #[arg(long, global = true, env = "KEEPSAKE_CLIENT_CONFIG")]
    config: Option<String>,

    /// Endpoint URL; repeat for several (replaces the configured list)
    #[arg(long = "endpoint", global = true)]
    endpoints: Vec<String>,

    /// Cancel endpoint calls still pending after this many seconds
    #[arg(long, global = true)]
    deadline_secs: Option<u64>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Key management commands
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Show the normalized endpoint list
    Endpoints,

    /// Upload a file to every endpoint
    Upload {
        /// File to upload
        file: PathBuf,

        /// MIME type (guessed from the file extension by default)
        #[arg(long)]
        mime_type: Option<String>,

        /// Stop at the first endpoint, in rank order, that accepts the file
        #[arg(long)]
        fallback: bool,
    },

    /// Download a blob from the first endpoint that serves it
    Download {
        /// Content hash (hex)
        hash: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List your blobs across all endpoints
    List,

    /// Delete a blob from every endpoint
    Delete {
        /// Content hash (hex)
        hash: String,
    },

    /// Copy a blob from a URL to the endpoints
    Mirror {
        /// Source blob URL; must contain the content hash
        source_url: String,

        /// Target endpoint; repeat for several (default: the endpoint list)
        #[arg(long = "target")]
        targets: Vec<String>,
    },

    /// Check which endpoints hold a blob
    Probe {
        /// Content hash (hex)
        hash: String,
    },

    /// Copy a blob to every endpoint that confirmed it is missing
    Repair {
        /// Content hash (hex)
        hash: String,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new identity key
    Generate {
        /// Output file for the secret key
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Show the public key of the configured secret key
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { global, command } = Cli::parse();

    match command {
        Commands::Key { command } => handle_key_command(command, &global).await,
        Commands::Endpoints => handle_endpoints_command(&global).await,
        Commands::Upload {
            file,
            mime_type,
            fallback,
        } => handle_upload_command(&global, &file, mime_type, fallback).await,
        Commands::Download { hash, output } => {
            handle_download_command(&global, &hash, output.as_deref()).await
        }
        Commands::List => handle_list_command(&global).await,
        Commands::Delete { hash } => handle_delete_command(&global, &hash).await,
        Commands::Mirror {
            source_url,
            targets,
        } => handle_mirror_command(&global, &source_url, &targets).await,
        Commands::Probe { hash } => handle_probe_command(&global, &hash).await,
        Commands::Repair { hash } => handle_repair_command(&global, &hash).await,
    }
}

async fn handle_key_command(command: KeyCommands, global: &GlobalArgs) -> Result<()> {
    match command {
        KeyCommands::Generate { output } => {
            let keypair = KeyPair::generate();
            let secret_key = keypair.secret.to_hex();

            if let Some(path) = output {
                write_secret_file(Path::new(&path), &secret_key)
                    .await
                    .with_context(|| format!("failed to write key to {path}"))?;
                println!("Secret key written to: {path}");
            } else {
                println!("Secret key:");
                println!("{secret_key}");
            }

            println!("\nPublic key:");
            println!("{}", keypair.public);
            println!("\nSet it in your client config or environment:");
            println!("  KEEPSAKE_SECRET_KEY=<secret key>");
        }
        KeyCommands::Show => {
            let config = load_client_config(&client_config_path(global.config.as_deref())?)?;
            let secret = config
                .secret_key
                .context("no secret key configured (set secret_key or KEEPSAKE_SECRET_KEY)")?;
            let keypair =
                KeyPair::from_secret_hex(&secret).context("failed to parse secret key")?;
            println!("{}", keypair.public);
        }
    }
    Ok(())
}

async fn handle_endpoints_command(global: &GlobalArgs) -> Result<()> {
    let config = load_client_config(&client_config_path(global.config.as_deref())?)?;
    let endpoints = resolve_endpoints(&config, &global.endpoints)?;

    if global.json {
        let entries: Vec<_> = endpoints
            .iter()
            .enumerate()
            .map(|(rank, e)| {
                serde_json::json!({ "rank": rank, "url": e.url(), "name": e.display_name() })
            })
            .collect();
        print_json(&entries)?;
        return Ok(());
    }

    for (rank, endpoint) in endpoints.iter().enumerate() {
        let marker = if rank == 0 { " (primary)" } else { "" };
        println!("{rank}: {} [{}]{marker}", endpoint.url(), endpoint.display_name());
    }
    Ok(())
}

async fn handle_upload_command(
    global: &GlobalArgs,
    file: &Path,
    mime_type: Option<String>,
    fallback: bool,
) -> Result<()> {
    let session = Session::open(global)?;
    let identity = session.require_identity()?;

    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mime_type = mime_type.unwrap_or_else(|| {
        mime_guess::from_path(file)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    });
    let mut payload = BlobPayload::new(bytes, Some(&mime_type));
    if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
        payload = payload.with_filename(name);
    }

    if fallback {
        let upload = session
            .engine
            .upload_with_fallback(identity, &session.endpoints, payload, session.options)
            .await
            .context("upload failed")?;
        if global.json {
            return print_json(&serde_json::json!({
                "url": upload.receipt.url,
                "contentHash": upload.receipt.content_hash,
                "endpoint": upload.endpoint,
                "attempts": upload.attempts,
            }));
        }
        println!("{}", upload.receipt.url);
        print_outcomes(&upload.attempts);
        return Ok(());
    }

    let report = session
        .engine
        .upload(identity, &session.endpoints, payload, session.options)
        .await
        .context("upload failed")?;
    print_upload_report(&report, global.json)
}

async fn handle_download_command(
    global: &GlobalArgs,
    hash: &str,
    output: Option<&Path>,
) -> Result<()> {
    let session = Session::open(global)?;
    let hash = parse_hash(hash)?;

    let download = session
        .engine
        .download(&session.endpoints, hash, session.options)
        .await
        .context("download failed")?;
    tracing::info!(endpoint = %download.endpoint, bytes = download.bytes.len(), "Downloaded");

    match output {
        Some(path) => {
            tokio::fs::write(path, &download.bytes)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!(
                "Wrote {} bytes from {} to {}",
                download.bytes.len(),
                download.endpoint,
                path.display()
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&download.bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

async fn handle_list_command(global: &GlobalArgs) -> Result<()> {
    let session = Session::open(global)?;
    let identity = session.require_identity()?;

    let report = session
        .engine
        .list(identity, &session.endpoints, session.options)
        .await
        .context("listing failed")?;

    if global.json {
        return print_json(&serde_json::json!({
            "blobs": report.blobs,
            "failures": report.failures,
        }));
    }

    if report.blobs.is_empty() {
        println!("No blobs found.");
    }
    for blob in &report.blobs {
        let copies = blob.available_on().count();
        println!(
            "{}  {:>10}  {:<24}  {copies}/{} endpoints",
            blob.content_hash,
            format_bytes(blob.size),
            blob.mime_type,
            session.endpoints.len()
        );
    }
    for failure in &report.failures {
        eprintln!(
            "warning: could not list {}: {}",
            failure.endpoint,
            failure.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn handle_delete_command(global: &GlobalArgs, hash: &str) -> Result<()> {
    let session = Session::open(global)?;
    let identity = session.require_identity()?;
    let hash = parse_hash(hash)?;

    let report = session
        .engine
        .delete(identity, &session.endpoints, hash, session.options)
        .await
        .context("delete failed")?;

    if global.json {
        return print_json(&serde_json::json!({
            "contentHash": report.content_hash,
            "deleted": report.deleted,
            "absent": report.absent,
            "outcomes": report.outcomes,
        }));
    }
    println!(
        "Deleted {hash} from {} endpoint(s); {} did not have it.",
        report.deleted, report.absent
    );
    print_outcomes(&report.outcomes);
    Ok(())
}

async fn handle_mirror_command(
    global: &GlobalArgs,
    source_url: &str,
    targets: &[String],
) -> Result<()> {
    let mut session = Session::open(global)?;
    if !targets.is_empty() {
        session.endpoints = normalize_endpoints(targets.iter().map(|t| t.as_str()))?;
    }
    let identity = session.require_identity()?;

    let outcome = session
        .engine
        .mirror(identity, &session.endpoints, source_url, session.options)
        .await
        .context("mirror failed")?;
    print_mirror_outcome(&outcome, global.json)
}

async fn handle_probe_command(global: &GlobalArgs, hash: &str) -> Result<()> {
    let session = Session::open(global)?;
    let hash = parse_hash(hash)?;

    let report = session
        .engine
        .probe(&session.endpoints, hash, session.options)
        .await
        .context("probe failed")?;

    if global.json {
        let results: Vec<_> = report
            .results
            .iter()
            .map(|r| {
                let (state, error) = match &r.availability {
                    Availability::Available => ("available", None),
                    Availability::Unavailable => ("unavailable", None),
                    Availability::Error(e) => ("error", Some(e.as_str())),
                };
                serde_json::json!({ "endpoint": r.endpoint, "state": state, "error": error })
            })
            .collect();
        return print_json(&results);
    }

    for result in &report.results {
        match &result.availability {
            Availability::Available => println!("{}  available", result.endpoint),
            Availability::Unavailable => println!("{}  missing", result.endpoint),
            Availability::Error(e) => println!("{}  unknown ({e})", result.endpoint),
        }
    }
    Ok(())
}

async fn handle_repair_command(global: &GlobalArgs, hash: &str) -> Result<()> {
    let session = Session::open(global)?;
    let identity = session.require_identity()?;
    let hash = parse_hash(hash)?;

    let outcome = session
        .engine
        .repair(identity, &session.endpoints, hash, session.options)
        .await
        .context("repair failed")?;
    print_mirror_outcome(&outcome, global.json)
}

/// Everything a blob command needs.
struct Session {
    engine: BlobTransferEngine,
    endpoints: EndpointList,
    identity: Option<Identity>,
    options: OperationOptions,
}

impl Session {
    fn open(global: &GlobalArgs) -> Result<Self> {
        let config = load_client_config(&client_config_path(global.config.as_deref())?)?;
        config
            .engine
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid engine configuration: {e}"))?;
        let endpoints = resolve_endpoints(&config, &global.endpoints)?;

        let (issuer, identity): (Arc<dyn CredentialIssuer>, Option<Identity>) =
            match config.secret_key.as_deref() {
                Some(secret) => {
                    let lifetime = config.engine.tokens.token_lifetime();
                    let issuer = LocalKeyIssuer::from_secret_hex(secret, lifetime)
                        .context("failed to parse secret key")?;
                    let identity = issuer.identity();
                    (Arc::new(issuer), Some(identity))
                }
                None => (Arc::new(NoKeyIssuer), None),
            };

        let engine = BlobTransferEngine::with_http(&config.engine, issuer)
            .context("failed to create transfer engine")?;
        let options = match global.deadline_secs {
            Some(secs) => OperationOptions::with_timeout(Duration::from_secs(secs)),
            None => OperationOptions::default(),
        };

        Ok(Self {
            engine,
            endpoints,
            identity,
            options,
        })
    }

    fn require_identity(&self) -> Result<&Identity> {
        self.identity
            .as_ref()
            .context("no secret key configured (set secret_key or KEEPSAKE_SECRET_KEY)")
    }
}

/// Issuer used when no key is configured; anonymous commands never call it.
struct NoKeyIssuer;

#[async_trait]
impl CredentialIssuer for NoKeyIssuer {
    async fn issue(&self, _request: &TokenRequest) -> keepsake_core::Result<AuthToken> {
        Err(keepsake_core::Error::Credential(
            "no secret key configured".to_string(),
        ))
    }
}

fn resolve_endpoints(config: &ClientConfig, overrides: &[String]) -> Result<EndpointList> {
    if overrides.is_empty() {
        match EndpointSet::normalize(config.endpoints.iter().cloned()) {
            EndpointSelection::Configured(list) => Ok(list),
            EndpointSelection::NoEndpoints => anyhow::bail!(
                "no endpoints configured; add [[endpoints]] to the client config or pass --endpoint"
            ),
        }
    } else {
        normalize_endpoints(overrides.iter().map(|u| u.as_str()))
    }
}

fn normalize_endpoints<'a>(urls: impl IntoIterator<Item = &'a str>) -> Result<EndpointList> {
    EndpointSet::normalize(urls.into_iter().map(EndpointEntry::new))
        .into_list()
        .context("none of the given endpoints is a valid http(s) URL")
}

fn parse_hash(hash: &str) -> Result<ContentHash> {
    ContentHash::from_hex(hash.trim()).with_context(|| format!("invalid content hash: {hash}"))
}

fn client_config_path(explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(PathBuf::from(path));
    }

    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(path) => PathBuf::from(path),
        None => {
            let home = std::env::var_os("HOME")
                .ok_or_else(|| anyhow::anyhow!("HOME not set; set KEEPSAKE_CLIENT_CONFIG"))?;
            PathBuf::from(home).join(".config")
        }
    };

    Ok(base.join("keepsake").join("client.toml"))
}

fn load_client_config(path: &Path) -> Result<ClientConfig> {
    let mut figment = Figment::new();

    if path.exists() {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("KEEPSAKE_").split("__"));

    match figment.extract() {
        Ok(config) => Ok(config),
        Err(_) if !path.exists() => Ok(ClientConfig::default()),
        Err(err) => Err(anyhow::anyhow!(err).context("failed to load client configuration")),
    }
}

async fn write_secret_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms).await?;
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_outcomes(outcomes: &[EndpointOutcome]) {
    for outcome in outcomes {
        match &outcome.error {
            None => println!("  ok      {}", outcome.endpoint),
            Some(e) => println!("  failed  {}: {e}", outcome.endpoint),
        }
    }
}

fn print_upload_report(report: &UploadReport, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({
            "url": report.primary.url,
            "primaryEndpoint": report.primary_endpoint,
            "blob": report.blob,
        }));
    }
    println!("{}", report.primary.url);
    println!(
        "Stored on {}/{} endpoint(s):",
        report.succeeded(),
        report.blob.availability.len()
    );
    print_outcomes(&report.blob.availability);
    Ok(())
}

fn print_mirror_outcome(outcome: &MirrorOutcome, json: bool) -> Result<()> {
    match outcome {
        MirrorOutcome::Mirrored(report) => print_upload_report(report, json),
        MirrorOutcome::NothingToMirror if json => {
            print_json(&serde_json::json!({ "mirrored": false }))
        }
        MirrorOutcome::NothingToMirror => {
            println!("Nothing to mirror.");
            Ok(())
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
