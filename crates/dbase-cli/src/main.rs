//! dbase CLI and node
//!
//! Usage:
//!   dbase add <path> [--replicate] [--peer <id>]... [--no-encrypt]
//!   dbase list
//!   dbase get <fileId> -o <out>
//!   dbase delete <fileId>
//!   dbase count
//!   dbase local list|get|delete
//!   dbase peer list|files|get|delete
//!   dbase serve
//!   dbase send-text <peer> <message>

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dbase_cli::{
    download_file, download_folder_file, download_received_file, process_and_store_file, Node,
    NodePaths, PeerDirectory, Stores, UploadOptions,
};
use dbase_config::Config;
use dbase_core::{crypto, encode_file_name, ChunkStore, EncryptionKey, EncryptionMethod};
use dbase_fs::ChunkFolder;
use tracing::{info, warn};

const SIGNALING_WAIT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "dbase")]
#[command(about = "Content-addressed chunk storage with peer replication", long_about = None)]
struct Cli {
    /// Data directory (defaults to the configured one)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Password for chunk encryption keys
    #[arg(long, env = "DBASE_PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,

    /// Peer id registered with the relay (overrides identity.peer_id)
    #[arg(long, global = true)]
    peer_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode and store a file
    Add {
        /// Path to file
        path: PathBuf,
        /// Replicate chunks to peers
        #[arg(long)]
        replicate: bool,
        /// Replicate to these peers instead of looking them up
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Store chunks compressed but unencrypted
        #[arg(long)]
        no_encrypt: bool,
    },
    /// List stored files
    List,
    /// Restore a stored file
    Get {
        file_id: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Delete a stored file and its chunks
    Delete { file_id: String },
    /// Print the number of stored files
    Count,
    /// Local chunk folder
    Local {
        #[command(subcommand)]
        command: FolderCommands,
    },
    /// Chunks received from peers
    Peer {
        #[command(subcommand)]
        command: FolderCommands,
    },
    /// Accept peers and store their chunks until Ctrl-C
    Serve,
    /// Send a text message to a peer
    SendText { peer: String, message: String },
}

#[derive(Subcommand)]
enum FolderCommands {
    /// List folders
    List,
    /// List files received from peers, grouped by owner and name
    Files,
    /// Restore a file from a folder (or, for peer files, by file name)
    Get {
        name: String,
        #[arg(short, long)]
        output: PathBuf,
        /// Owner of a peer file, when several owners share a name
        #[arg(long)]
        owner: Option<String>,
    },
    /// Delete a folder
    Delete { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dbase=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(dbase_config::get_data_dir);
    let paths = NodePaths::from_config(&config, data_dir);
    let stores = Stores::open(&paths)?;
    let key = resolve_key(&config, cli.password.as_deref());

    match cli.command {
        Commands::Add {
            path,
            replicate,
            peers,
            no_encrypt,
        } => {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("Path has no file name")?;
            let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
            let file_size = file.metadata()?.len();
            let owner = config
                .owner()
                .or(cli.peer_id.as_deref())
                .unwrap_or("local")
                .to_string();

            let options = UploadOptions {
                owner,
                key: if no_encrypt { None } else { key },
                chunk_size: config.transfer.chunk_size,
                replicate: replicate || !peers.is_empty(),
            };
            if options.key.is_none() {
                info!("Storing {} without encryption", file_name);
            }

            let result = process_and_store_file(
                file,
                &file_name,
                file_size,
                stores.chunks.as_ref(),
                &stores.local,
                &options,
                |p| info!("{:.0}%", p),
            )
            .await?;
            println!(
                "added {} {} ({} chunks)",
                result.metadata.file_id, file_name, result.metadata.num_chunks
            );

            if options.replicate {
                let peers = if peers.is_empty() {
                    lookup_peers(&config).await?
                } else {
                    peers
                };
                if peers.is_empty() {
                    warn!("No peers to replicate to");
                    return Ok(());
                }
                let node = start_node(&config, cli.peer_id.as_deref(), stores.peer.clone()).await?;
                let results = node.replicate(&peers, &result.records).await;
                node.shutdown();
                for (peer, outcome) in results {
                    match outcome {
                        Ok(n) => println!("replicated {} chunks to {}", n, peer),
                        Err(e) => println!("failed to replicate to {}: {}", peer, e),
                    }
                }
            }
        }
        Commands::List => {
            let files = stores.chunks.list_metadata().await?;
            if files.is_empty() {
                println!("No files");
            }
            for meta in files {
                println!(
                    "{}\t{}\t{} bytes\t{} chunks\t{}\t{}",
                    meta.file_id,
                    meta.file_name,
                    meta.file_size,
                    meta.num_chunks,
                    meta.encryption_method,
                    meta.owner
                );
            }
        }
        Commands::Get { file_id, output } => {
            let data = download_file(stores.chunks.as_ref(), &file_id, key.as_ref(), |_| {}).await?;
            write_output(&output, &data)?;
        }
        Commands::Delete { file_id } => {
            if stores.chunks.get_metadata(&file_id).await?.is_none() {
                bail!("No file with id {}", file_id);
            }
            stores.chunks.delete_file(&file_id).await?;
            println!("deleted {}", file_id);
        }
        Commands::Count => {
            println!("{}", stores.chunks.count().await?);
        }
        Commands::Local { command } => folder_command(&stores.local, command, key.as_ref(), false)?,
        Commands::Peer { command } => folder_command(&stores.peer, command, key.as_ref(), true)?,
        Commands::Serve => {
            let node = start_node(&config, cli.peer_id.as_deref(), stores.peer.clone()).await?;
            node.engine
                .on_text(Arc::new(|peer: &str, content: &str| {
                    println!("[{}] {}", peer, content);
                }))
                .await;
            node.engine
                .on_record(Arc::new(|peer: &str, key: &str| {
                    info!("Received chunk {} from {}", key, peer);
                }))
                .await;

            println!("Serving as {} (Ctrl-C to stop)", node.local_peer_id());
            tokio::signal::ctrl_c().await?;
            node.shutdown();
            println!("Stopped");
        }
        Commands::SendText { peer, message } => {
            let node = start_node(&config, cli.peer_id.as_deref(), stores.peer.clone()).await?;
            let result = node.engine.send_text(&peer, &message).await;
            node.shutdown();
            result?;
            println!("sent");
        }
    }

    Ok(())
}

/// Password-derived key, unless the config disables encryption
fn resolve_key(config: &Config, password: Option<&str>) -> Option<EncryptionKey> {
    match config.encryption_method.parse::<EncryptionMethod>() {
        Ok(EncryptionMethod::None) => None,
        Ok(EncryptionMethod::AesGcm) => password.map(crypto::derive_key_from_password),
        Err(e) => {
            warn!("{}; falling back to AES-GCM", e);
            password.map(crypto::derive_key_from_password)
        }
    }
}

async fn lookup_peers(config: &Config) -> Result<Vec<String>> {
    let Some(wallet) = config.identity.wallet_address.as_deref() else {
        warn!("identity.wallet_address not set; pass --peer to replicate");
        return Ok(Vec::new());
    };
    let directory = PeerDirectory::new(
        config.server.peers_url(),
        Duration::from_millis(config.server.credentials_timeout_ms),
    );
    directory.peers_for_file(wallet).await
}

async fn start_node(config: &Config, peer_id: Option<&str>, peer_store: Arc<ChunkFolder>) -> Result<Node> {
    let peer_id = peer_id
        .or(config.identity.peer_id.as_deref())
        .context("No peer id: set identity.peer_id in config or pass --peer-id")?;
    let node = Node::start(config, peer_id, peer_store);
    if !node.wait_signaling(SIGNALING_WAIT).await {
        node.shutdown();
        bail!("Relay {} not reachable", config.server.signaling_url(peer_id));
    }
    Ok(node)
}

fn folder_command(
    folder: &ChunkFolder,
    command: FolderCommands,
    key: Option<&EncryptionKey>,
    peer: bool,
) -> Result<()> {
    match command {
        FolderCommands::List => {
            let entries = folder.list()?;
            if entries.is_empty() {
                println!("No folders");
            }
            for entry in entries {
                println!(
                    "{}\t{}\t{} bytes\t{} chunks\t{}",
                    entry.name,
                    entry.decoded_name,
                    entry.size,
                    entry.num_chunks,
                    entry.owner.as_deref().unwrap_or("-")
                );
            }
        }
        FolderCommands::Files => {
            for file in folder.received_files()? {
                println!("{}\t{}\t{} chunks", file.owner, file.file_name, file.chunks.len());
            }
        }
        FolderCommands::Get { name, output, owner } => {
            let data = if peer {
                let file = folder
                    .received_files()?
                    .into_iter()
                    .find(|f| f.file_name == name && owner.as_ref().map_or(true, |o| &f.owner == o))
                    .with_context(|| format!("No received file named {}", name))?;
                download_received_file(folder, &file, key)?
            } else {
                download_folder_file(folder, &encode_file_name(&name), key)?
            };
            write_output(&output, &data)?;
        }
        FolderCommands::Delete { name } => {
            let target = if peer { name.clone() } else { encode_file_name(&name) };
            if folder.delete(&target)? {
                println!("deleted {}", name);
            } else {
                bail!("No folder {}", name);
            }
        }
    }
    Ok(())
}

fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("wrote {} bytes to {}", data.len(), path.display());
    Ok(())
}
