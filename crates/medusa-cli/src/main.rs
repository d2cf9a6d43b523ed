//! medusa: incremental Cassandra backup client
//!
//! Commands:
//!   upload <files..>     - back up SSTables of one table into a named backup
//!   restore              - download the latest version of every file of a table
//!   download <keys..>    - fetch raw object keys into a directory
//!   files                - show the aggregated file view across backups
//!   backups              - list this node's backups, oldest first
//!   health               - check that storage is reachable
//!   config show          - print the active configuration (key omitted)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use medusa_backup::{fold_all_backups, fold_differential_only, BackupCatalog, FileMap, StorageFacade};
use medusa_core::config::MedusaConfig;
use medusa_core::{Backup, ManifestSection};
use medusa_crypto::{BackendAvailability, EncryptionConfig, EncryptionManager};
use medusa_storage::{check_health, OpendalDriver, S3Credentials, StorageDriver};

#[derive(Parser, Debug)]
#[command(
    name = "medusa",
    version,
    about = "Incremental backups with client-side encryption"
)]
struct Cli {
    /// Path to medusa.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "MEDUSA_CONFIG",
        default_value = "/etc/medusa/medusa.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging].level
    #[arg(long, env = "MEDUSA_LOG")]
    log: Option<String>,

    /// Log format; overrides [logging].format
    #[arg(long, env = "MEDUSA_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload SSTables of one table into a backup
    ///
    /// Files already stored by an earlier backup of this node are referenced
    /// instead of uploaded again.
    Upload {
        /// Files, or directories whose regular files are uploaded
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long, short = 'b')]
        backup: String,
        #[arg(long, short = 'k')]
        keyspace: String,
        #[arg(long, short = 't')]
        table: String,
        /// Mark the backup as differential
        #[arg(long)]
        differential: bool,
    },

    /// Restore the latest version of every file of a table
    Restore {
        #[arg(long, short = 'k')]
        keyspace: String,
        #[arg(long, short = 't')]
        table: String,
        /// Destination directory
        #[arg(long, short = 'd')]
        dest: PathBuf,
        /// Stop the chain at this backup (default: newest)
        #[arg(long, short = 'b')]
        backup: Option<String>,
    },

    /// Download object keys into a directory, keeping only file names
    Download {
        #[arg(required = true)]
        keys: Vec<String>,
        #[arg(long, short = 'd')]
        dest: PathBuf,
    },

    /// Show the latest version of each file across this node's backups
    Files {
        /// Ignore full backups
        #[arg(long)]
        differential_only: bool,
        #[arg(long, short = 'k')]
        keyspace: Option<String>,
        #[arg(long, short = 't')]
        table: Option<String>,
    },

    /// List this node's backups, oldest first
    Backups,

    /// Check that storage is reachable
    Health,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (defaults merged with the config file)
    Show,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, found) = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    if !found {
        warn!("config file not found: {}  (using defaults)", cli.config.display());
    }
    config
        .validate()
        .with_context(|| format!("invalid config {}", cli.config.display()))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        provider = %config.storage.storage_provider,
        "medusa starting"
    );

    match cli.command {
        Commands::Upload {
            paths,
            backup,
            keyspace,
            table,
            differential,
        } => cmd_upload(&config, &paths, &backup, &keyspace, &table, differential).await,
        Commands::Restore {
            keyspace,
            table,
            dest,
            backup,
        } => cmd_restore(&config, &keyspace, &table, &dest, backup.as_deref()).await,
        Commands::Download { keys, dest } => cmd_download(&config, &keys, &dest).await,
        Commands::Files {
            differential_only,
            keyspace,
            table,
        } => cmd_files(&config, differential_only, keyspace.as_deref(), table.as_deref()).await,
        Commands::Backups => cmd_backups(&config).await,
        Commands::Health => cmd_health(&config).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => {
            let rendered = toml::to_string_pretty(&config).context("rendering config")?;
            println!("{rendered}");
            Ok(())
        }
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

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

/// Returns the config and whether the file existed.
async fn load_config(path: &Path) -> Result<(MedusaConfig, bool)> {
    if !path.exists() {
        return Ok((MedusaConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
    Ok((config, true))
}

/// S3 credentials from the standard AWS environment variables, if both are set
fn credentials_from_env() -> Option<S3Credentials> {
    let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
    let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
    Some(S3Credentials {
        access_key_id,
        secret_access_key,
    })
}

struct Session {
    driver: Arc<OpendalDriver>,
    facade: StorageFacade,
    catalog: BackupCatalog,
}

fn open_session(config: &MedusaConfig) -> Result<Session> {
    let credentials = credentials_from_env();
    let driver = Arc::new(
        OpendalDriver::from_config(&config.storage, credentials.as_ref())
            .context("building storage driver")?,
    );
    let encryption = EncryptionConfig::from_storage_config(&config.storage, BackendAvailability::detect());
    let manager = EncryptionManager::new(&encryption).context("initializing client-side encryption")?;

    let shared: Arc<dyn StorageDriver> = driver.clone();
    Ok(Session {
        facade: StorageFacade::from_config(shared.clone(), Arc::new(manager), config),
        catalog: BackupCatalog::from_config(shared, &config.storage),
        driver,
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Expand directories into their regular files (one level)
fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
                .with_context(|| format!("reading directory {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect();
            entries.sort();
            files.extend(entries);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            anyhow::bail!("not a file or directory: {}", path.display());
        }
    }
    Ok(files)
}

async fn cmd_upload(
    config: &MedusaConfig,
    paths: &[PathBuf],
    backup_name: &str,
    keyspace: &str,
    table: &str,
    differential: bool,
) -> Result<()> {
    let session = open_session(config)?;
    let files = collect_files(paths)?;

    let chain = session.catalog.list_node_backups().await.context("listing backups")?;
    let cache = if differential {
        let earlier: Vec<Backup> = chain.iter().filter(|b| b.name != backup_name).cloned().collect();
        fold_all_backups(&earlier)
            .context("aggregating earlier backups")?
            .table(keyspace, table)
            .cloned()
            .unwrap_or_default()
    } else {
        Default::default()
    };

    let dest = session.catalog.data_prefix(backup_name, keyspace, table);
    println!(
        "Uploading {} file(s) → {}:{} ({})",
        files.len(),
        config.storage.bucket_name,
        dest,
        if session.facade.encryption().is_enabled() { "encrypted" } else { "plaintext" },
    );

    let uploaded = session
        .facade
        .upload_files_with_cache(&files, &dest, &cache)
        .await
        .context("upload failed")?;

    let mut objects: Vec<_> = uploaded.iter().map(|u| u.object.clone()).collect();
    objects.sort_by(|a, b| a.path.cmp(&b.path));
    let transferred = uploaded.iter().filter(|u| u.transferred).count();

    // other tables already recorded in this backup are kept
    let mut backup = match chain.into_iter().find(|b| b.name == backup_name) {
        Some(existing) => existing,
        None => Backup::new(backup_name, differential, Vec::new()).with_started_at(unix_now()),
    };
    backup.is_differential = differential;
    backup
        .manifest
        .retain(|s| !(s.keyspace == keyspace && s.table == table));
    backup.manifest.push(ManifestSection {
        keyspace: keyspace.to_string(),
        table: table.to_string(),
        objects,
    });
    session
        .catalog
        .write_backup(&backup)
        .await
        .context("writing backup manifest")?;

    println!(
        "  done: {} uploaded, {} unchanged",
        transferred,
        uploaded.len() - transferred
    );
    Ok(())
}

async fn cmd_restore(
    config: &MedusaConfig,
    keyspace: &str,
    table: &str,
    dest: &Path,
    until: Option<&str>,
) -> Result<()> {
    let session = open_session(config)?;
    let mut chain = session.catalog.list_node_backups().await.context("listing backups")?;
    if let Some(until) = until {
        let end = chain
            .iter()
            .position(|b| b.name == until)
            .with_context(|| format!("backup {until} not found"))?;
        chain.truncate(end + 1);
    }

    let files = fold_all_backups(&chain).context("aggregating backups")?;
    let objects: Vec<_> = files
        .table(keyspace, table)
        .with_context(|| format!("no files recorded for {keyspace}.{table}"))?
        .values()
        .cloned()
        .collect();

    println!("Restoring {} file(s) of {keyspace}.{table} → {}", objects.len(), dest.display());
    let downloaded = session
        .facade
        .download_objects(&objects, dest)
        .await
        .context("restore failed")?;
    let bytes: u64 = downloaded.iter().map(|d| d.bytes).sum();
    println!("  done: {} file(s), {bytes} bytes", downloaded.len());
    Ok(())
}

async fn cmd_download(config: &MedusaConfig, keys: &[String], dest: &Path) -> Result<()> {
    let session = open_session(config)?;
    let downloaded = session
        .facade
        .download_files(keys, dest)
        .await
        .context("download failed")?;
    for file in &downloaded {
        println!("{} → {} ({} bytes)", file.remote_path, file.local_path.display(), file.bytes);
    }
    Ok(())
}

async fn cmd_files(
    config: &MedusaConfig,
    differential_only: bool,
    keyspace: Option<&str>,
    table: Option<&str>,
) -> Result<()> {
    let session = open_session(config)?;
    let chain = session.catalog.list_node_backups().await.context("listing backups")?;
    let files: FileMap = if differential_only {
        fold_differential_only(&chain)
    } else {
        fold_all_backups(&chain)
    }
    .context("aggregating backups")?;

    for (ks, tbl, name, obj) in files.iter() {
        if keyspace.is_some_and(|k| k != ks) || table.is_some_and(|t| t != tbl) {
            continue;
        }
        let (size, md5) = obj.source_identity();
        println!("{ks}\t{tbl}\t{name}\t{size}\t{}\t{}", md5.unwrap_or("-"), obj.path);
    }
    Ok(())
}

async fn cmd_backups(config: &MedusaConfig) -> Result<()> {
    let session = open_session(config)?;
    let chain = session.catalog.list_node_backups().await.context("listing backups")?;
    if chain.is_empty() {
        println!("no backups for {}", session.catalog.node_root());
        return Ok(());
    }
    for backup in &chain {
        let files: usize = backup.manifest.iter().map(|s| s.objects.len()).sum();
        println!(
            "{}\t{}\t{}\t{files} file(s)",
            backup.name,
            if backup.is_differential { "differential" } else { "full" },
            backup
                .started_at
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

async fn cmd_health(config: &MedusaConfig) -> Result<()> {
    let session = open_session(config)?;
    match check_health(session.driver.as_ref(), &config.storage.prefix).await {
        Ok(report) => {
            println!(
                "storage: ok ({} bucket {}, prefix {:?}, {} node folder(s), {} ms)",
                report.provider,
                config.storage.bucket_name,
                report.prefix,
                report.folders.len(),
                report.elapsed.as_millis()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("storage: UNREACHABLE ({e})");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn upload_args() {
        let cli = Cli::try_parse_from([
            "medusa", "upload", "a.db", "b.db", "-b", "b2", "-k", "ks", "-t", "cf", "--differential",
        ])
        .unwrap();
        match cli.command {
            Commands::Upload {
                paths, differential, ..
            } => {
                assert_eq!(paths.len(), 2);
                assert!(differential);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_config_uses_defaults() {
        let (config, found) = load_config(Path::new("/nonexistent/medusa.toml")).await.unwrap();
        assert!(!found);
        assert_eq!(config.storage.bucket_name, "medusa");
    }

    #[tokio::test]
    async fn config_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("medusa.toml");
        std::fs::write(&path, "[storage]\nstorage_provider = \"local\"\nbucket_name = \"b\"\n").unwrap();
        let (config, found) = load_config(&path).await.unwrap();
        assert!(found);
        assert_eq!(config.storage.bucket_name, "b");
    }

    #[test]
    fn collect_files_expands_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.db"), b"b").unwrap();
        std::fs::write(dir.path().join("a.db"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let files = collect_files(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, ["a.db", "b.db"]);
        assert!(collect_files(&[dir.path().join("missing")]).is_err());
    }
}
