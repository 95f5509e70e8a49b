use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod engine;
mod hash;
mod library;
mod manifest;

use api::products::Product;
use api::Session;
use config::Config;
use engine::download::ChunkSource;
use engine::install::{InstallReport, InstallTarget};
use engine::update::UpdateReport;
use engine::{EngineError, RunOptions};
use manifest::BuildOs;

#[derive(Parser)]
#[command(name = "midway")]
#[command(about = "Game library manager and chunked content downloader", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Verbose diagnostics
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to the upstream service
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Forget the saved session
    Logout,
    /// List owned titles
    Library {
        /// Refresh the cached product list from the service
        #[arg(long)]
        refresh: bool,
    },
    /// Download and install a title
    Install {
        slug: String,
        /// Version to install (default: latest for the OS)
        #[arg(long)]
        version: Option<String>,
        /// Build platform (default: the host platform)
        #[arg(long, value_enum)]
        os: Option<BuildOs>,
        /// Exact install directory
        #[arg(long, conflicts_with = "base_path")]
        path: Option<PathBuf>,
        /// Install under <base-path>/<slug>
        #[arg(long)]
        base_path: Option<PathBuf>,
        /// Download worker count
        #[arg(long)]
        workers: Option<usize>,
        /// Ceiling for chunk bytes held in memory
        #[arg(long)]
        max_memory: Option<u64>,
        /// Skip per-chunk SHA verification
        #[arg(long)]
        skip_verify: bool,
        /// Print download size and exit
        #[arg(long)]
        info: bool,
    },
    /// Update an installed title to a newer version
    Update {
        slug: String,
        /// Target version (default: latest for the installed OS)
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        max_memory: Option<u64>,
        #[arg(long)]
        skip_verify: bool,
        /// Print the delta size and exit
        #[arg(long)]
        info: bool,
    },
    /// Check an installed title against its manifest
    Verify {
        slug: String,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Remove an installed title
    Uninstall {
        slug: String,
        /// Drop the install record but leave the files on disk
        #[arg(long)]
        keep_files: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "midway=debug" } else { "midway=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let result = match cli.command {
        Commands::Login { email } => login(&config, email).await,
        Commands::Logout => logout(),
        Commands::Library { refresh } => library_list(&config, refresh).await,
        Commands::Install {
            slug,
            version,
            os,
            path,
            base_path,
            workers,
            max_memory,
            skip_verify,
            info,
        } => {
            let opts = run_options(&config, workers, max_memory, skip_verify, info);
            install(
                &config, &slug, version, os, path, base_path, opts, info, &cancel,
            )
            .await
        }
        Commands::Update {
            slug,
            version,
            workers,
            max_memory,
            skip_verify,
            info,
        } => {
            let opts = run_options(&config, workers, max_memory, skip_verify, info);
            update(&config, &slug, version, opts, info, &cancel).await
        }
        Commands::Verify { slug, workers } => {
            verify(&config, &slug, workers, cli.verbose).await
        }
        Commands::Uninstall { slug, keep_files } => uninstall(&slug, keep_files),
    };

    match result {
        Err(e) if is_cancellation(&e) => {
            println!("interrupted. progress is saved; rerun the same command to resume");
            Ok(())
        }
        other => other,
    }
}

/// Cancel the run token on SIGINT or SIGTERM. The engine drains and
/// leaves resumable state; main then exits 0.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install signal handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        cancel.cancel();
    });
}

fn is_cancellation(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<EngineError>()
        .is_some_and(|e| e.is_cancelled())
}

fn run_options(
    config: &Config,
    workers: Option<usize>,
    max_memory: Option<u64>,
    skip_verify: bool,
    info: bool,
) -> RunOptions {
    RunOptions {
        workers: workers
            .or(config.workers)
            .unwrap_or_else(engine::default_workers),
        max_memory: max_memory
            .or(config.max_memory)
            .unwrap_or(config::DEFAULT_MAX_MEMORY),
        skip_verify,
        show_progress: !info,
    }
}

fn prompt_line(label: &str) -> anyhow::Result<String> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn login(config: &Config, email: Option<String>) -> anyhow::Result<()> {
    let email = match email {
        Some(email) => email,
        None => prompt_line("email: ")?,
    };
    let password = rpassword::prompt_password("password: ")?;

    let session = Session::login(config, &email, &password).await?;
    let products = api::products::fetch_library(&session).await?;
    library::save_products(&products)?;
    println!("logged in. {} titles in library", products.len());
    Ok(())
}

fn logout() -> anyhow::Result<()> {
    Session::logout()?;
    println!("logged out");
    Ok(())
}

async fn library_list(config: &Config, refresh: bool) -> anyhow::Result<()> {
    let mut products = library::load_products()?;
    if refresh || products.is_empty() {
        let session = Session::load(config)?;
        products = api::products::fetch_library(&session).await?;
        library::save_products(&products)?;
    }

    if products.is_empty() {
        println!("library is empty");
        return Ok(());
    }

    let installed = library::load_installed()?;
    for product in &products {
        let marker = match installed.get(&product.slug) {
            Some(record) => format!(" [installed {}]", record.version),
            None => String::new(),
        };
        println!("{:<24} {}{}", product.slug, product.name, marker);
    }
    Ok(())
}

fn resolve_product(slug: &str) -> anyhow::Result<Product> {
    let products = library::load_products()?;
    if products.is_empty() {
        anyhow::bail!("library cache is empty. run: midway library --refresh");
    }
    library::find_product(&products, slug)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("unknown slug {slug:?}. run: midway library --refresh"))
}

fn resolve_version(
    product: &Product,
    requested: Option<&str>,
    os: BuildOs,
) -> anyhow::Result<String> {
    match requested {
        Some(version) => product
            .version(version, os)
            .map(|v| v.version_id.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("{} has no version {version:?} for {os}", product.slug)
            }),
        None => product
            .latest_version(os)
            .map(|v| v.version_id.clone())
            .ok_or_else(|| anyhow::anyhow!("{} has no builds for {os}", product.slug)),
    }
}

fn target_for(
    config: &Config,
    product: &Product,
    os: BuildOs,
    version: String,
    install_path: PathBuf,
) -> InstallTarget {
    InstallTarget {
        slug: product.slug.clone(),
        source: ChunkSource {
            cdn_base: config.cdn_base().to_string(),
            namespace: product.namespace.clone(),
            id_key: product.id_key.clone(),
            os,
        },
        version,
        install_path,
    }
}

#[allow(clippy::too_many_arguments)]
async fn install(
    config: &Config,
    slug: &str,
    version: Option<String>,
    os: Option<BuildOs>,
    path: Option<PathBuf>,
    base_path: Option<PathBuf>,
    opts: RunOptions,
    info: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let product = resolve_product(slug)?;
    let os = os.unwrap_or_else(BuildOs::host);
    let version = resolve_version(&product, version.as_deref(), os)?;

    let install_path = match path {
        Some(path) => path,
        None => {
            let base = match base_path.or_else(|| config.base_install_path.clone()) {
                Some(base) => base,
                None => std::env::current_dir()?,
            };
            base.join(&product.slug)
        }
    };

    let target = target_for(config, &product, os, version.clone(), install_path);
    match engine::install::install(&target, &opts, info, cancel).await? {
        InstallReport::Info {
            download_bytes,
            file_count,
        } => {
            println!(
                "{} {}: {} files, {} to download",
                slug,
                version,
                file_count,
                format_size(download_bytes)
            );
        }
        InstallReport::Installed { file_count, .. } => {
            println!(
                "installed {} {} ({} files) to {}",
                slug,
                version,
                file_count,
                target.install_path.display()
            );
        }
    }
    Ok(())
}

async fn update(
    config: &Config,
    slug: &str,
    version: Option<String>,
    opts: RunOptions,
    info: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let record = library::install_record(slug)?
        .ok_or_else(|| anyhow::anyhow!("{slug} is not installed"))?;
    let product = resolve_product(slug)?;
    let new_version = resolve_version(&product, version.as_deref(), record.os)?;

    if new_version == record.version {
        println!("{} is already at {}", slug, record.version);
        return Ok(());
    }

    let target = target_for(
        config,
        &product,
        record.os,
        new_version.clone(),
        record.install_path.clone(),
    );
    match engine::update::update(&target, &record.version, &opts, info, cancel).await? {
        UpdateReport::NoChanges => {
            println!("{}: no file changes between {} and {}", slug, record.version, new_version);
        }
        UpdateReport::Info {
            download_bytes,
            removed_bytes,
            added,
            modified,
            removed,
        } => {
            println!(
                "{} -> {}: {} added, {} modified, {} removed",
                record.version, new_version, added, modified, removed
            );
            println!("download: {}", format_size(download_bytes));
            println!("freed: {}", format_size(removed_bytes));
        }
        UpdateReport::Updated { file_count, .. } => {
            println!(
                "updated {} {} -> {} ({} files changed)",
                slug, record.version, new_version, file_count
            );
        }
    }
    Ok(())
}

async fn verify(
    config: &Config,
    slug: &str,
    workers: Option<usize>,
    verbose: bool,
) -> anyhow::Result<()> {
    let record = library::install_record(slug)?
        .ok_or_else(|| anyhow::anyhow!("{slug} is not installed"))?;
    let manifest_bytes = library::read_manifest(slug, &record.version, library::ManifestKind::Build)?
        .ok_or_else(|| {
            anyhow::anyhow!("no cached manifest for {slug} {}; reinstall to restore it", record.version)
        })?;
    let records = manifest::parse_build_manifest(&manifest_bytes).map_err(EngineError::Manifest)?;

    let workers = workers
        .or(config.workers)
        .unwrap_or_else(engine::default_workers);
    let report = engine::verify::verify_install(&records, &record.install_path, workers).await?;

    if report.all_valid {
        println!("{} ok ({} files verified)", slug, report.results.len());
        return Ok(());
    }

    let failures: Vec<_> = report.failures().collect();
    let shown = if verbose { failures.len() } else { failures.len().min(10) };
    for failure in &failures[..shown] {
        println!("{}: {}", failure.file_path, failure.status);
    }
    if failures.len() > shown {
        println!("... and {} more", failures.len() - shown);
    }
    anyhow::bail!(
        "{} of {} files failed verification",
        failures.len(),
        report.results.len()
    );
}

fn uninstall(slug: &str, keep_files: bool) -> anyhow::Result<()> {
    let record = library::install_record(slug)?
        .ok_or_else(|| anyhow::anyhow!("{slug} is not installed"))?;

    if !keep_files {
        match std::fs::remove_dir_all(&record.install_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    library::remove_install_record(slug)?;
    library::remove_manifests(slug)?;

    if keep_files {
        println!("forgot {} (files kept at {})", slug, record.install_path.display());
    } else {
        println!("uninstalled {}", slug);
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
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
