use annexfs::dataset::{self, GitAnnexProvider};
use annexfs::fetch::RetryPolicy;
use annexfs::fuse::mount::mount_unprivileged;
use annexfs::fuse::AnnexFuse;
use annexfs::vfs::driver::{CacheClearPolicy, DriverConfig, VfsDriver};
use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "annexfs",
    version,
    about = "FUSE filesystem exposing git-annex datasets with lazy remote fetch"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount a dataset, fetching remote-only content on read.
    Mount(MountArgs),
    /// Clear a dataset's on-disk fetch cache.
    CacheClear(CacheClearArgs),
    /// Print the leading lines/bytes of a tracked file, fetching from its
    /// remotes when the content is not present locally.
    Head(HeadArgs),
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CachingMode {
    /// Fetch straight from the remote on every read.
    None,
    /// Keep fetched blocks on disk inside the dataset's metadata area.
    Ondisk,
}

#[derive(Args)]
struct MountArgs {
    /// Dataset to operate on; defaults to the current directory.
    #[arg(short = 'd', long)]
    dataset: Option<PathBuf>,
    /// Where to mount the dataset (must be an existing directory).
    mount_path: PathBuf,
    /// Expose the metadata area read/write instead of hiding it.
    #[arg(long)]
    transparent: bool,
    #[arg(long, value_enum, default_value = "none")]
    caching: CachingMode,
    /// What to do with fetch caches at unmount.
    #[arg(long, value_enum, default_value = "none")]
    cache_clear: CacheClearPolicy,
    /// Stay attached to the invoking process instead of detaching.
    #[arg(long)]
    foreground: bool,
}

#[derive(Args)]
struct CacheClearArgs {
    /// Dataset to operate on; defaults to the current directory.
    #[arg(short = 'd', long)]
    dataset: Option<PathBuf>,
    /// Also clear every nested sub-dataset.
    #[arg(short, long)]
    recursive: bool,
}

#[derive(Args)]
struct HeadArgs {
    /// Dataset to operate on; defaults to the current directory.
    #[arg(short = 'd', long)]
    dataset: Option<PathBuf>,
    /// How many lines to show (default 10).
    #[arg(short = 'n', long, conflicts_with = "bytes")]
    lines: Option<usize>,
    /// How many bytes to show.
    #[arg(short = 'c', long)]
    bytes: Option<usize>,
    #[arg(long)]
    transparent: bool,
    #[arg(long, value_enum, default_value = "none")]
    caching: CachingMode,
    /// Tracked file to show the leading contents of.
    path: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Mount(args) => run_mount(args),
        Command::CacheClear(args) => {
            let root = resolve_dataset(args.dataset.as_deref())?;
            runtime()?.block_on(dataset::clear_caches(&root, args.recursive))?;
            Ok(())
        }
        Command::Head(args) => run_head(args),
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

/// Locate and validate the dataset root.
fn resolve_dataset(arg: Option<&Path>) -> anyhow::Result<PathBuf> {
    let root = match arg {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let root = root
        .canonicalize()
        .with_context(|| format!("dataset not found: {}", root.display()))?;
    if !root.join(".git").exists() {
        bail!("not a dataset (no .git entry): {}", root.display());
    }
    Ok(root)
}

fn run_mount(args: MountArgs) -> anyhow::Result<()> {
    let root = resolve_dataset(args.dataset.as_deref())?;
    if !args.mount_path.is_dir() {
        bail!("mount target is not a directory: {}", args.mount_path.display());
    }
    let mount_path = args
        .mount_path
        .canonicalize()
        .context("cannot resolve mount target")?;

    if !args.foreground {
        // Detach before the runtime exists; forked tokio workers misbehave.
        nix::unistd::daemon(true, false).context("failed to detach")?;
    }

    let config = DriverConfig {
        transparent: args.transparent,
        caching: args.caching == CachingMode::Ondisk,
        cache_clear: args.cache_clear,
        retry: RetryPolicy::default(),
    };
    runtime()?.block_on(async move {
        let driver = VfsDriver::new(root.clone(), config, Arc::new(GitAnnexProvider));
        let fs = AnnexFuse::new(driver);
        info!("mounting {} at {}", root.display(), mount_path.display());
        let handle = mount_unprivileged(fs, &mount_path)
            .await
            .context("mount failed (is fusermount3 available?)")?;

        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for interrupt")?;
        info!("unmounting {}", mount_path.display());
        if let Err(e) = handle.unmount().await {
            warn!("unmount error: {e}");
        }
        Ok(())
    })
}

fn run_head(args: HeadArgs) -> anyhow::Result<()> {
    if args.lines.is_some() && args.bytes.is_some() {
        bail!("'lines' and 'bytes' are mutually exclusive");
    }
    let root = resolve_dataset(args.dataset.as_deref())?;
    let path = if args.path.is_absolute() {
        args.path.clone()
    } else {
        root.join(&args.path)
    };
    let config = DriverConfig {
        transparent: args.transparent,
        caching: args.caching == CachingMode::Ondisk,
        cache_clear: CacheClearPolicy::None,
        retry: RetryPolicy::default(),
    };
    runtime()?.block_on(async move {
        let driver = VfsDriver::new(root, config, Arc::new(GitAnnexProvider));
        let fh = driver
            .open(&path, libc::O_RDONLY)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let blob = match (args.lines, args.bytes) {
            (None, Some(bytes)) => driver
                .read(fh, 0, bytes)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?,
            (lines, None) => {
                let wanted = lines.unwrap_or(10);
                read_leading_lines(&driver, fh, wanted).await?
            }
            (Some(_), Some(_)) => unreachable!("checked above"),
        };
        driver.release(fh).await;
        driver.destroy().await;
        use std::io::Write;
        std::io::stdout().write_all(&blob)?;
        Ok(())
    })
}

/// Accumulate whole lines without fetching more chunks than needed.
async fn read_leading_lines(
    driver: &VfsDriver,
    fh: u64,
    wanted: usize,
) -> anyhow::Result<Vec<u8>> {
    const CHUNK: usize = 64 * 1024;
    let mut blob: Vec<u8> = Vec::new();
    let mut offset = 0u64;
    loop {
        let chunk = driver
            .read(fh, offset, CHUNK)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let eof = chunk.len() < CHUNK;
        blob.extend_from_slice(&chunk);
        offset += chunk.len() as u64;
        let newlines = blob.iter().filter(|b| **b == b'\n').count();
        if newlines >= wanted || eof {
            let mut seen = 0;
            for (i, b) in blob.iter().enumerate() {
                if *b == b'\n' {
                    seen += 1;
                    if seen == wanted {
                        blob.truncate(i + 1);
                        break;
                    }
                }
            }
            return Ok(blob);
        }
    }
}
