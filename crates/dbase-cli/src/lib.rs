//! dbase node library
//!
//! Upload/download pipelines over the chunk store and chunk folders, replica
//! peer lookup, and the node service that replicates records to peers.

pub mod node;
pub mod peers;
pub mod pipeline;

pub use dbase_config::Config;
pub use node::{orchestrator_config, transfer_config, Node, NodePaths, Stores};
pub use peers::PeerDirectory;
pub use pipeline::{
    download_file, download_folder_file, download_received_file, process_and_store_file,
    UploadOptions, UploadResult,
};
