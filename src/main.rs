//! fragmend - erasure-coded backup fragment toolkit
//!
//! Usage:
//!   fragmend init                      - Write a default configuration
//!   fragmend map <suppliers>           - Describe the parity map for a ring size
//!   fragmend encode <file> <path-id>   - Encode a file into local fragments
//!   fragmend status                    - List local backups and their fragments
//!   fragmend verify <backup>           - Check which blocks are still recoverable
//!   fragmend restore <backup> <out>    - Rebuild a file from local fragments

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use fragmend::config::FragmendConfig;
use fragmend::ecc::{codec, EccMap, SUPPORTED_SUPPLIER_COUNTS};
use fragmend::fragment::{make_version_tag, BackupId, FragmentId, FragmentKind};
use fragmend::storage::FragmentStore;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "fragmend")]
#[command(author = "fragmend Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Fragment-availability tracking for erasure-coded backups")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/fragmend/config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Customer identity, e.g. alice@node-a
        #[arg(long)]
        customer: Option<String>,

        /// Supplier ring size
        #[arg(long)]
        suppliers: Option<usize>,

        /// Data directory for fragments and listings
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Describe the parity map for a given ring size
    Map {
        /// Supplier count
        suppliers: usize,
    },

    /// Encode a file into erasure-coded fragments in the local store
    Encode {
        /// Input file
        input: PathBuf,

        /// Catalog path ID for the new backup, e.g. 0/0/1
        path_id: String,

        /// Version tag; defaults to a fresh timestamp tag
        #[arg(long)]
        version: Option<String>,
    },

    /// List local backups and their fragment counts
    Status,

    /// Check which blocks of a backup are still recoverable locally
    Verify {
        /// Backup ID, e.g. alice@node-a:0/0/1/F20090709034221PM
        backup: String,
    },

    /// Rebuild a file from local fragments
    Restore {
        /// Backup ID, e.g. alice@node-a:0/0/1/F20090709034221PM
        backup: String,

        /// Output file
        output: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &PathBuf) -> Result<()> {
    match command {
        Commands::Init {
            customer,
            suppliers,
            data_dir,
            force,
        } => cmd_init(config_path, customer, suppliers, data_dir, force),

        Commands::Map { suppliers } => cmd_map(suppliers),

        Commands::Encode {
            input,
            path_id,
            version,
        } => cmd_encode(config_path, &input, &path_id, version),

        Commands::Status => cmd_status(config_path),

        Commands::Verify { backup } => cmd_verify(config_path, &backup),

        Commands::Restore { backup, output } => cmd_restore(config_path, &backup, &output),
    }
}

fn cmd_init(
    config_path: &PathBuf,
    customer: Option<String>,
    suppliers: Option<usize>,
    data_dir: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "configuration already exists at {} (use --force to overwrite)",
            config_path.display()
        );
    }

    let mut config = FragmendConfig::default();
    if let Some(customer) = customer {
        config.customer.id = customer;
    }
    if let Some(suppliers) = suppliers {
        config.customer.suppliers = suppliers;
    }
    if let Some(data_dir) = data_dir {
        config.data_dir = data_dir;
    }
    config.validate().context("invalid configuration")?;
    config.ensure_directories()?;
    config
        .save(config_path)
        .with_context(|| format!("cannot write {}", config_path.display()))?;

    info!("Configuration written to {}", config_path.display());
    info!(
        "Customer {}, {} suppliers, data in {}",
        config.customer.id,
        config.customer.suppliers,
        config.data_dir.display()
    );
    Ok(())
}

fn cmd_map(suppliers: usize) -> Result<()> {
    let map = EccMap::new(suppliers).with_context(|| {
        format!(
            "unsupported ring size {} (supported: {:?})",
            suppliers, SUPPORTED_SUPPLIER_COUNTS
        )
    })?;
    println!("map:                {}", map);
    println!("data fragments:     {}", map.data_segments());
    println!("parity fragments:   {}", map.parity_segments());
    println!("correctable losses: {}", map.correctable_errors());
    println!("fire/hire losses:   {}", map.fire_hire_errors());
    for parity in 0..map.parity_segments() {
        println!("parity {:>2} covers   {:?}", parity, map.parity_group(parity));
    }
    Ok(())
}

fn cmd_encode(
    config_path: &PathBuf,
    input: &PathBuf,
    path_id: &str,
    version: Option<String>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let map = EccMap::new(config.customer.suppliers)?;
    let store = FragmentStore::new(config.fragments_dir());

    let payload = fs::read(input).with_context(|| format!("cannot read {}", input.display()))?;
    let version = version.unwrap_or_else(make_version_tag);
    let backup = BackupId::new(config.customer.id.clone(), path_id, version);

    let block_size = config.customer.block_size;
    let blocks = payload.chunks(block_size).count().max(1);
    let mut written = 0u64;
    // an empty file still gets one (empty) last block
    for block in 0..blocks {
        let start = block * block_size;
        let end = (start + block_size).min(payload.len());
        let last = block == blocks - 1;
        let encoded = codec::encode_block(&map, &payload[start..end], last)?;
        for (slot, bytes) in encoded.data.iter().enumerate() {
            written += store.write_fragment(&backup, &FragmentId::data(block, slot), bytes)?;
        }
        for (slot, bytes) in encoded.parity.iter().enumerate() {
            written += store.write_fragment(&backup, &FragmentId::parity(block, slot), bytes)?;
        }
    }

    info!(
        "Encoded {} into {} blocks, {} fragments, {} bytes on disk",
        input.display(),
        blocks,
        blocks * map.suppliers() * 2,
        written
    );
    println!("{}", backup);
    Ok(())
}

fn cmd_status(config_path: &PathBuf) -> Result<()> {
    let config = load_config(config_path)?;
    let store = FragmentStore::new(config.fragments_dir());
    let found = store.scan_customer(&config.customer.id)?;
    if found.is_empty() {
        println!("no local fragments for {}", config.customer.id);
        return Ok(());
    }

    let mut by_backup: std::collections::BTreeMap<BackupId, (usize, u64)> =
        std::collections::BTreeMap::new();
    for fragment in found {
        let entry = by_backup.entry(fragment.backup).or_default();
        entry.0 += 1;
        entry.1 += fragment.size;
    }
    for (backup, (files, size)) in by_backup {
        println!("{}  {} fragments  {} bytes", backup, files, size);
    }
    Ok(())
}

fn cmd_verify(config_path: &PathBuf, backup: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let map = EccMap::new(config.customer.suppliers)?;
    let store = FragmentStore::new(config.fragments_dir());
    let backup: BackupId = backup.parse()?;

    let found = store.scan_version(&backup)?;
    if found.is_empty() {
        bail!("no local fragments for {}", backup);
    }
    let max_block = found.iter().map(|(id, _)| id.block).max().unwrap_or(0);

    let mut fixable = 0;
    let mut lost = Vec::new();
    for block in 0..=max_block {
        let mut data = vec![false; map.suppliers()];
        let mut parity = vec![false; map.suppliers()];
        for (id, _) in found.iter().filter(|(id, _)| id.block == block) {
            match id.kind {
                FragmentKind::Data => data[id.slot] = true,
                FragmentKind::Parity => parity[id.slot] = true,
            }
        }
        if map.fixable(&data, &parity) {
            fixable += 1;
        } else {
            lost.push(block);
        }
    }

    println!(
        "{}: {} of {} blocks recoverable",
        backup,
        fixable,
        max_block + 1
    );
    if lost.is_empty() {
        Ok(())
    } else {
        bail!("blocks not recoverable from local fragments: {:?}", lost);
    }
}

fn cmd_restore(config_path: &PathBuf, backup: &str, output: &PathBuf) -> Result<()> {
    let config = load_config(config_path)?;
    let map = EccMap::new(config.customer.suppliers)?;
    let store = FragmentStore::new(config.fragments_dir());
    let backup: BackupId = backup.parse()?;

    let mut file = fs::File::create(output)
        .with_context(|| format!("cannot create {}", output.display()))?;
    let mut block = 0usize;
    let mut written = 0u64;
    loop {
        let mut data: Vec<Option<Bytes>> = Vec::with_capacity(map.suppliers());
        let mut parity: Vec<Option<Bytes>> = Vec::with_capacity(map.suppliers());
        for slot in 0..map.suppliers() {
            data.push(read_optional(&store, &backup, &FragmentId::data(block, slot)));
            parity.push(read_optional(&store, &backup, &FragmentId::parity(block, slot)));
        }
        if data.iter().chain(parity.iter()).all(Option::is_none) {
            bail!(
                "block {} of {} has no local fragments and no earlier block was marked last",
                block, backup
            );
        }
        let decoded = codec::decode_block(&map, &mut data, &mut parity)
            .with_context(|| format!("cannot decode block {}", block))?;
        file.write_all(&decoded.payload)?;
        written += decoded.payload.len() as u64;
        if decoded.last_block {
            break;
        }
        block += 1;
    }
    file.flush()?;

    info!(
        "Restored {} blocks, {} bytes into {}",
        block + 1,
        written,
        output.display()
    );
    Ok(())
}

fn read_optional(store: &FragmentStore, backup: &BackupId, id: &FragmentId) -> Option<Bytes> {
    if !store.has_fragment(backup, id) {
        return None;
    }
    store.read_fragment(backup, id).ok()
}

fn load_config(config_path: &PathBuf) -> Result<FragmendConfig> {
    let config = FragmendConfig::load(config_path)
        .with_context(|| format!("cannot load {}", config_path.display()))?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn expand_tilde(path: &PathBuf) -> PathBuf {
    if path.starts_with("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.strip_prefix("~").unwrap());
        }
    }
    path.clone()
}
