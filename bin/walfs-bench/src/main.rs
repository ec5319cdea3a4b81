//! walfs bench - format, recover and load-test disk images
//!
//! All subcommands operate on a single image file. Settings come from an
//! optional TOML file; command line flags take precedence.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use walfs_common::Config;
use walfs_storage::{Engine, FileDisk};

#[derive(Parser, Debug)]
#[command(name = "walfs-bench")]
#[command(about = "walfs image tool and benchmark")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "walfs.toml")]
    config: PathBuf,

    /// Disk image path (overrides config)
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create and format a new image
    Format {
        /// Image size in blocks
        #[arg(long)]
        blocks: Option<u64>,
        /// Log slots
        #[arg(long)]
        log_capacity: Option<u64>,
    },
    /// Open an image, replay its log and report its state
    Recover,
    /// Create, write and unlink small files from several threads
    Smallfile {
        /// Worker threads
        #[arg(short, long, default_value_t = 4)]
        threads: usize,
        /// Run time in seconds
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
        /// Bytes written per file
        #[arg(long, default_value_t = 100)]
        size: usize,
    },
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if args.config.exists() {
        let config_str = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        toml::from_str(&config_str)
            .with_context(|| format!("parsing {}", args.config.display()))?
    } else {
        Config::default()
    };

    if let Some(image) = &args.image {
        config.disk.path.clone_from(image);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if let Commands::Format {
        blocks,
        log_capacity,
    } = &args.command
    {
        if let Some(blocks) = blocks {
            config.disk.blocks = *blocks;
        }
        if let Some(cap) = log_capacity {
            config.engine.log_capacity = *cap;
        }
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Commands::Format { .. } => format(&config),
        Commands::Recover => recover(&config),
        Commands::Smallfile {
            threads,
            duration,
            size,
        } => smallfile(&config, threads, Duration::from_secs(duration), size),
    }
}

fn format(config: &Config) -> Result<()> {
    let disk = FileDisk::create(
        &config.disk.path,
        config.disk.blocks,
        config.disk.sync_on_barrier,
    )?;
    let geo = Engine::format(&disk, &config.engine)?;
    println!("Formatted {}", config.disk.path.display());
    println!("  Blocks:       {}", geo.nblocks);
    println!("  Log slots:    {}", geo.log_capacity);
    println!("  Inodes:       {}", geo.ninodes);
    println!("  Data blocks:  {}", geo.nblocks - geo.data_start);
    Ok(())
}

fn open(config: &Config) -> Result<Engine> {
    let disk = FileDisk::open(&config.disk.path, config.disk.sync_on_barrier)
        .with_context(|| format!("opening {}", config.disk.path.display()))?;
    Ok(Engine::open(Arc::new(disk), &config.engine)?)
}

fn recover(config: &Config) -> Result<()> {
    let start = Instant::now();
    let engine = open(config)?;
    engine.wait_shrinks();
    let elapsed = start.elapsed();

    let geo = engine.geometry();
    let state = engine.state();
    println!("Recovered {} in {:?}", config.disk.path.display(), elapsed);
    println!(
        "  Blocks free:  {} / {}",
        state.blocks().free_count(),
        geo.nblocks
    );
    println!(
        "  Inodes free:  {} / {}",
        state.inodes().free_count(),
        geo.ninodes
    );
    engine.shutdown();
    Ok(())
}

fn smallfile(config: &Config, threads: usize, duration: Duration, size: usize) -> Result<()> {
    if threads == 0 {
        bail!("threads must be positive");
    }
    let engine = Arc::new(open(config)?);
    let stop = Arc::new(AtomicBool::new(false));
    let files = Arc::new(AtomicU64::new(0));
    let payload = vec![0xabu8; size];

    info!(
        "Running smallfile: {} threads, {:?}, {} bytes per file",
        threads, duration, size
    );
    let start = Instant::now();
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            let files = Arc::clone(&files);
            let payload = payload.clone();
            thread::spawn(move || -> walfs_common::Result<()> {
                while !stop.load(Ordering::Relaxed) {
                    let mut op = engine.begin();
                    let mut ip = op.alloc_inode()?;
                    ip.write(&mut op, 0, &payload)?;
                    op.write_inode(&ip);
                    op.commit(true)?;

                    let mut op = engine.begin();
                    let mut ip = op.get_inode_handle(ip.handle())?;
                    ip.unlink(&mut op)?;
                    op.commit(false)?;

                    files.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            })
        })
        .collect();

    thread::sleep(duration);
    stop.store(true, Ordering::Relaxed);

    let mut failed = false;
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("worker failed: {}", e);
                failed = true;
            }
            Err(_) => {
                error!("worker panicked");
                failed = true;
            }
        }
    }
    let elapsed = start.elapsed();
    engine.wait_shrinks();

    let total = files.load(Ordering::Relaxed);
    let stats = engine.log_stats();
    engine.shutdown();

    #[allow(clippy::cast_precision_loss)]
    let rate = total as f64 / elapsed.as_secs_f64();
    println!("Files:        {total}");
    println!("Elapsed:      {elapsed:?}");
    println!("Files/sec:    {rate:.1}");
    println!(
        "Log:          installed {} durable {} logged {}",
        stats.installed, stats.durable, stats.logged
    );
    if failed {
        bail!("one or more workers failed");
    }
    Ok(())
}
