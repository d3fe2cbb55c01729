//! Tresor Tester - meta tree exerciser
//!
//! Formats a meta tree onto a block image, runs a series of copy-on-write
//! updates against it through the module composition and verifies the
//! resulting tree.

mod driver;

use anyhow::{Context, Result, bail};
use clap::Parser;
use driver::{DriverState, check_tree, drive, leaf_layout};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tresor_common::{Config, INITIAL_GENERATION, Pba};
use tresor_engine::{FileBlockStore, MemoryBlockStore, MemoryImage, format_meta_tree, nr_of_node_blocks};

#[derive(Parser, Debug)]
#[command(name = "tresor-tester")]
#[command(about = "Format a meta tree and run copy-on-write updates against it")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "tresor.toml")]
    config: String,

    /// Image file path
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Image size in blocks
    #[arg(long)]
    blocks: Option<u64>,

    /// Number of updates to run
    #[arg(short = 'n', long, default_value = "16")]
    updates: u64,

    /// Keep the image in memory instead of a file
    #[arg(long)]
    memory: bool,

    /// Upper bound of scheduler passes
    #[arg(long, default_value = "1000000")]
    max_passes: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load config file if it exists
    let mut config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    };

    // Merge CLI args with config file (CLI takes precedence)
    if let Some(image) = args.image {
        config.image.path = image;
    }
    if let Some(blocks) = args.blocks {
        config.image.blocks = blocks;
    }
    let log_level = if args.log_level == "info" {
        config.logging.level.clone()
    } else {
        args.log_level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate().context("invalid configuration")?;
    let geometry = config.meta_tree.geometry()?;

    info!("Starting Tresor tester");
    info!("Config file: {}", args.config);
    info!("Meta tree: {geometry}");

    let first_node_pba = config.meta_tree.first_node_pba;
    let data_start: Pba = first_node_pba + nr_of_node_blocks(&geometry);
    let required = data_start + geometry.leaves;
    if config.image.blocks < required {
        bail!(
            "image of {} blocks is too small, the tree needs {required}",
            config.image.blocks
        );
    }

    let entries = leaf_layout(&geometry, data_start);
    let tracked: Vec<Pba> = entries.iter().filter(|e| e.reserved).map(|e| e.pba).collect();
    if tracked.is_empty() {
        bail!("no leaf block of {geometry} holds enough spares for an update");
    }
    let tree = format_meta_tree(&geometry, first_node_pba, &entries, INITIAL_GENERATION)?;
    info!(
        "Formatted {} node blocks, root {}, tracking {} blocks",
        tree.blocks.len(),
        tree.root,
        tracked.len()
    );

    let capacity = config.cache.capacity_entries;
    let report = if args.memory {
        info!("Image: {} blocks in memory", config.image.blocks);
        let image = MemoryImage::new(config.image.blocks);
        for (pba, blk) in &tree.blocks {
            image.write_block(*pba, blk)?;
        }
        let store = MemoryBlockStore::new(image.clone());
        let report = drive(
            store,
            capacity,
            geometry,
            tree.root,
            tracked,
            args.updates,
            args.max_passes,
        )?;
        check_tree(&geometry, &report.root, &report.tracked, |pba| {
            image.read_block(pba)
        })?;
        report
    } else {
        let path = &config.image.path;
        info!("Image: {} ({} blocks)", path.display(), config.image.blocks);
        let store = FileBlockStore::create(path, config.image.blocks)
            .with_context(|| format!("cannot create image {}", path.display()))?;
        for (pba, blk) in &tree.blocks {
            store.write_block(*pba, blk)?;
        }
        let report = drive(
            store,
            capacity,
            geometry,
            tree.root,
            tracked,
            args.updates,
            args.max_passes,
        )?;
        let image = FileBlockStore::open(path, true)?;
        check_tree(&geometry, &report.root, &report.tracked, |pba| {
            image.read_block(pba)
        })?;
        report
    };

    summarize(&report)
}

fn summarize(report: &DriverState) -> Result<()> {
    info!(
        "{} updates completed: {} moved, {} reused in place, {} root updates",
        report.completed, report.moved, report.reused, report.root_updates
    );
    info!("Final root {} at generation {}", report.root, report.generation);

    if let Some(failure) = &report.failure {
        error!("Stopped early: {failure}");
        bail!("update run failed: {failure}");
    }
    Ok(())
}
