//! debugger-bundler - builds and publishes debugger runtime bundles.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use debugger_bundler::fetch::{SourceFetcher, SystemTransport};
use debugger_bundler::{
    load_config, preflight, CancelToken, CompressionLevel, IntegrationDriver, ManifestStore,
    Target,
};

#[derive(Parser)]
#[command(name = "debugger-bundler")]
#[command(about = "Builds minimal, reproducible debugger runtime bundles")]
#[command(
    after_help = "QUICK START:\n  debugger-bundler build --config bundle.toml          Build every target\n  debugger-bundler build --config bundle.toml --fast   Quick local iteration\n  debugger-bundler manifest show --manifest dist/manifest.json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, verify and publish bundles for the configured targets
    Build {
        /// Build matrix file
        #[arg(long)]
        config: PathBuf,

        /// Only build this target (platform-arch-version); repeatable
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Worker threads (default: from the config, else CPU count)
        #[arg(long)]
        jobs: Option<usize>,

        /// Use the fast compression tier instead of the configured one
        #[arg(long)]
        fast: bool,
    },

    /// Check a published asset against its manifest entry
    Verify {
        #[arg(long)]
        manifest: PathBuf,

        /// platform-arch-version
        #[arg(long)]
        target: String,
    },

    /// Inspect a manifest
    Manifest {
        #[command(subcommand)]
        what: ManifestCommand,
    },

    /// Inspect the source cache
    Cache {
        #[command(subcommand)]
        what: CacheCommand,
    },
}

#[derive(Subcommand)]
enum ManifestCommand {
    /// Print the manifest, or the installer's view of one platform
    Show {
        #[arg(long)]
        manifest: PathBuf,

        #[arg(long, requires = "arch")]
        platform: Option<String>,

        #[arg(long, requires = "platform")]
        arch: Option<String>,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Show entry count and size
    Status {
        #[arg(long)]
        cache: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            config,
            targets,
            jobs,
            fast,
        } => cmd_build(config, targets, jobs, fast),
        Commands::Verify { manifest, target } => cmd_verify(manifest, &target),
        Commands::Manifest {
            what:
                ManifestCommand::Show {
                    manifest,
                    platform,
                    arch,
                },
        } => cmd_manifest_show(manifest, platform, arch),
        Commands::Cache {
            what: CacheCommand::Status { cache },
        } => cmd_cache_status(cache),
    }
}

fn cmd_build(
    config: PathBuf,
    targets: Vec<String>,
    jobs: Option<usize>,
    fast: bool,
) -> Result<()> {
    let mut cfg = load_config(&config)?;
    cfg.filter_targets(&targets)?;
    if let Some(n) = jobs {
        if n == 0 {
            bail!("--jobs must be at least 1");
        }
        cfg.jobs = n;
    }
    if fast {
        cfg.compression = CompressionLevel::Fast;
    }
    preflight::check_config(&cfg).context("preflight checks failed")?;

    let driver = IntegrationDriver::new(cfg).with_cancel(install_interrupt_handler());
    let summary = driver.run()?;

    print!("{}", summary.table());
    println!("run summary: {}", driver.summary_path().display());
    if summary.failed() > 0 {
        bail!(
            "{} of {} target(s) failed",
            summary.failed(),
            summary.targets.len()
        );
    }
    Ok(())
}

fn cmd_verify(manifest: PathBuf, key: &str) -> Result<()> {
    let target = Target::parse_key(key)?;
    let store = ManifestStore::new(&manifest);
    let ok = store
        .verify(&target)
        .with_context(|| format!("verifying {target} against '{}'", manifest.display()))?;
    if !ok {
        bail!(
            "{target}: asset is missing or does not match '{}'",
            manifest.display()
        );
    }
    println!("[bundle:{target}] ok");
    Ok(())
}

fn cmd_manifest_show(
    manifest: PathBuf,
    platform: Option<String>,
    arch: Option<String>,
) -> Result<()> {
    let loaded = ManifestStore::new(&manifest).load()?;
    let json = match (platform, arch) {
        (Some(platform), Some(arch)) => {
            serde_json::to_string_pretty(&loaded.platform_view(&platform, &arch))?
        }
        _ => serde_json::to_string_pretty(&loaded)?,
    };
    println!("{json}");
    Ok(())
}

fn cmd_cache_status(cache: PathBuf) -> Result<()> {
    let fetcher = SourceFetcher::open(&cache, Arc::new(SystemTransport::new()))?;
    let status = fetcher.status()?;
    println!("cache:   {}", status.root.display());
    println!("entries: {}", status.entries);
    println!("blobs:   {}", status.blobs);
    println!("bytes:   {}", status.bytes);
    Ok(())
}

static CANCEL: OnceLock<CancelToken> = OnceLock::new();
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C lets in-flight targets stop at their next stage boundary;
/// a second one exits immediately.
#[cfg(unix)]
fn install_interrupt_handler() -> CancelToken {
    extern "C" fn on_sigint(_: libc::c_int) {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            unsafe { libc::_exit(130) };
        }
        if let Some(token) = CANCEL.get() {
            token.cancel();
        }
    }

    let token = CANCEL.get_or_init(CancelToken::new).clone();
    let handler = on_sigint as extern "C" fn(libc::c_int);
    let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        warn!("could not install SIGINT handler; Ctrl-C will abort immediately");
    } else {
        info!("press Ctrl-C once to stop after the current stage");
    }
    token
}

#[cfg(not(unix))]
fn install_interrupt_handler() -> CancelToken {
    let _ = &INTERRUPTED;
    CANCEL.get_or_init(CancelToken::new).clone()
}
