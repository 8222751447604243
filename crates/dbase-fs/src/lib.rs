//! Filesystem storage for dbase chunks.
//!
//! - [`ChunkFolder`]: the local and peer chunk folders (`{root}/{folder}/chunk_{index}`)
//! - [`FsChunkStore`]: the persistent chunk + file metadata store

mod folder;
mod store;

pub use folder::{ChunkFolder, FolderEntry, ReceivedFile};
pub use store::FsChunkStore;
