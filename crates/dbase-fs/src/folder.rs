//! Directory-backed chunk folders
//!
//! One subdirectory per stored unit, one file per chunk:
//!
//! ```text
//! {root}/{folder}/chunk_{index}            ciphertext JSON ({"iv":[..],"data":[..]})
//! {root}/{folder}/{chunkCID}_meta.json     sidecar, written for peer-received chunks
//! ```
//!
//! Locally authored files use the encoded file name as `{folder}`. Chunks
//! received from a peer use the record key (the chunk CID), so a received file
//! is spread over several folders and is regrouped through the sidecars.

use dbase_core::{decode_file_name, encode_file_name, ChunkMeta, ChunkSidecar, EncryptedChunk, StoreError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CHUNK_PREFIX: &str = "chunk_";
const META_SUFFIX: &str = "_meta.json";

/// Summary of one folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
    /// Folder name on disk
    pub name: String,
    /// `name` with the file-name encoding reversed
    pub decoded_name: String,
    /// Total bytes of chunk files
    pub size: u64,
    pub num_chunks: u32,
    /// Owner from a sidecar, when one exists
    pub owner: Option<String>,
}

/// A file reassembled from peer-received chunk folders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub owner: String,
    pub file_name: String,
    /// `(chunk_index, folder)` ascending by index
    pub chunks: Vec<(u32, String)>,
}

/// Root directory holding chunk folders
#[derive(Debug, Clone)]
pub struct ChunkFolder {
    root: PathBuf,
}

impl ChunkFolder {
    /// Open a folder store, creating the root if needed
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn folder_path(&self, folder: &str) -> Result<PathBuf, StoreError> {
        if folder.is_empty()
            || folder == "."
            || folder == ".."
            || folder.contains(['/', '\\', '\0'])
        {
            return Err(StoreError::Other(format!("invalid folder name: {:?}", folder)));
        }
        Ok(self.root.join(folder))
    }

    /// Write `chunk_{index}` for a locally authored file
    pub fn save_chunk(&self, file_name: &str, index: u32, chunk: &EncryptedChunk) -> Result<(), StoreError> {
        let dir = self.folder_path(&encode_file_name(file_name))?;
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(chunk_file_name(index)), &serde_json::to_vec(chunk)?)?;
        Ok(())
    }

    /// Persist a chunk received from a peer under the record key.
    ///
    /// Writes the payload file and its sidecar; both are overwritten if present.
    pub fn store_received(&self, key: &str, meta: &ChunkMeta) -> Result<(), StoreError> {
        if meta.chunk_cid.is_empty() {
            return Err(StoreError::Other("received chunk has no chunkCID".to_string()));
        }
        let dir = self.folder_path(key)?;
        let sidecar_name = format!("{}{}", meta.chunk_cid, META_SUFFIX);
        if sidecar_name.contains(['/', '\\']) {
            return Err(StoreError::Other(format!("invalid chunkCID: {:?}", meta.chunk_cid)));
        }
        fs::create_dir_all(&dir)?;

        write_atomic(
            &dir.join(chunk_file_name(meta.chunk_index)),
            &serde_json::to_vec(&meta.encrypted_chunk)?,
        )?;
        write_atomic(&dir.join(sidecar_name), &serde_json::to_vec(&meta.sidecar())?)?;

        debug!(
            "Stored received chunk {} (index {}) of {:?} in {}",
            meta.chunk_cid, meta.chunk_index, meta.file_name, key
        );
        Ok(())
    }

    /// Whether a locally authored file exists
    pub fn contains_file(&self, file_name: &str) -> bool {
        self.folder_path(&encode_file_name(file_name))
            .map(|p| p.is_dir())
            .unwrap_or(false)
    }

    /// Summaries of every folder
    pub fn list(&self) -> Result<Vec<FolderEntry>, StoreError> {
        let mut entries = Vec::new();
        for dir in fs::read_dir(&self.root)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            let name = dir.file_name().to_string_lossy().to_string();

            let mut size = 0u64;
            let mut num_chunks = 0u32;
            let mut owner = None;
            for file in fs::read_dir(dir.path())? {
                let file = file?;
                let file_name = file.file_name().to_string_lossy().to_string();
                if parse_chunk_index(&file_name).is_some() {
                    size += file.metadata()?.len();
                    num_chunks += 1;
                } else if owner.is_none() && file_name.ends_with(META_SUFFIX) {
                    owner = read_sidecar(&file.path()).map(|s| s.owner);
                }
            }

            entries.push(FolderEntry {
                decoded_name: decode_file_name(&name),
                name,
                size,
                num_chunks,
                owner,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Number of folders
    pub fn count(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        for entry in fs::read_dir(&self.root)? {
            if entry?.file_type()?.is_dir() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Remove a folder and everything in it. Returns false if absent.
    pub fn delete(&self, folder: &str) -> Result<bool, StoreError> {
        let dir = self.folder_path(folder)?;
        if !dir.is_dir() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        Ok(true)
    }

    /// Chunks of one folder, ascending by index
    pub fn read_chunks(&self, folder: &str) -> Result<Vec<(u32, EncryptedChunk)>, StoreError> {
        let dir = self.folder_path(folder)?;
        let mut chunks = Vec::new();
        for file in fs::read_dir(&dir)? {
            let file = file?;
            let name = file.file_name().to_string_lossy().to_string();
            if let Some(index) = parse_chunk_index(&name) {
                let chunk: EncryptedChunk = serde_json::from_slice(&fs::read(file.path())?)?;
                chunks.push((index, chunk));
            }
        }
        chunks.sort_by_key(|(index, _)| *index);
        Ok(chunks)
    }

    /// Group peer-received chunk folders by `(owner, fileName)` using sidecars
    pub fn received_files(&self) -> Result<Vec<ReceivedFile>, StoreError> {
        let mut grouped: BTreeMap<(String, String), BTreeMap<u32, String>> = BTreeMap::new();

        for dir in fs::read_dir(&self.root)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            let folder = dir.file_name().to_string_lossy().to_string();
            for file in fs::read_dir(dir.path())? {
                let file = file?;
                if !file.file_name().to_string_lossy().ends_with(META_SUFFIX) {
                    continue;
                }
                if let Some(sidecar) = read_sidecar(&file.path()) {
                    grouped
                        .entry((sidecar.owner, sidecar.file_name))
                        .or_default()
                        .insert(sidecar.chunk_index, folder.clone());
                }
            }
        }

        Ok(grouped
            .into_iter()
            .map(|((owner, file_name), chunks)| ReceivedFile {
                owner,
                file_name,
                chunks: chunks.into_iter().collect(),
            })
            .collect())
    }

    /// Chunks of a received file gathered from their folders, ascending by index
    pub fn read_received(&self, file: &ReceivedFile) -> Result<Vec<(u32, EncryptedChunk)>, StoreError> {
        let mut out = Vec::with_capacity(file.chunks.len());
        for (index, folder) in &file.chunks {
            let path = self.folder_path(folder)?.join(chunk_file_name(*index));
            let chunk: EncryptedChunk = serde_json::from_slice(&fs::read(path)?)?;
            out.push((*index, chunk));
        }
        Ok(out)
    }
}

fn chunk_file_name(index: u32) -> String {
    format!("{}{}", CHUNK_PREFIX, index)
}

/// Index from a `chunk_{index}` file name
fn parse_chunk_index(name: &str) -> Option<u32> {
    name.strip_prefix(CHUNK_PREFIX)?.parse().ok()
}

fn read_sidecar(path: &Path) -> Option<ChunkSidecar> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(sidecar) => Some(sidecar),
        Err(e) => {
            warn!("Ignoring unreadable sidecar {}: {}", path.display(), e);
            None
        }
    }
}

/// Temp file + rename, so readers never see a half-written chunk
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, data)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}
