//! The storage object binding a local data file, a local Merkle tree, and
//! a reference Merkle tree. All chunk-level reads and writes go through a
//! `Pane`; its local tree's validity bitmap is the authoritative record of
//! which chunks are intact on disk (PANE-1 in `spec.md` §4.3).

use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::PaneError;
use crate::geometry::ChunkGeometry;
use crate::hash::leaf_hash;
use crate::merkle::MerkleTree;

/// The capability set a `Painter` needs from a pane, split out per the
/// redesign note in `spec.md` §9: a real `Pane` and a `FakePane` (in-memory,
/// used by tests) both implement it instead of one inheriting from the
/// other.
#[async_trait]
pub trait PaneCapability: Send + Sync {
    fn geometry(&self) -> &ChunkGeometry;
    async fn is_chunk_intact(&self, index: u32) -> bool;
    async fn submit_chunk(&self, index: u32, bytes: Vec<u8>) -> Result<(), PaneError>;
    async fn verify_chunk(&self, index: u32) -> Result<bool, PaneError>;
    async fn read_chunk(&self, index: u32) -> Result<Vec<u8>, PaneError>;
}

/// Binds a data file, a local tree, and a reference tree for one dataset.
/// Cheap to clone: every field is an `Arc` or `Copy`, so a clone can move
/// onto a `spawn_blocking` thread to run positional file I/O without
/// blocking the async runtime.
#[derive(Clone)]
pub struct Pane {
    data_file: Arc<std::fs::File>,
    local_tree: Arc<RwLock<MerkleTree>>,
    local_tree_path: Arc<PathBuf>,
    ref_tree: Arc<MerkleTree>,
    geometry: ChunkGeometry,
    remote_url: Option<Arc<str>>,
}

impl std::fmt::Debug for Pane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pane")
            .field("geometry", &self.geometry)
            .field("remote_url", &self.remote_url)
            .finish_non_exhaustive()
    }
}

impl Pane {
    /// Opens (or creates) the data file and local tree, and loads the
    /// reference tree, which must already exist. Fails with
    /// `GeometryMismatch` if an existing local tree disagrees with the
    /// reference tree's shape, or if an existing (non-empty) data file's
    /// size disagrees with the reference tree's geometry, and
    /// `RefTreeMissing` if there is no reference tree at `ref_tree_path`.
    pub fn open(
        data_path: impl AsRef<Path>,
        local_tree_path: impl AsRef<Path>,
        ref_tree_path: impl AsRef<Path>,
        remote_url: Option<String>,
    ) -> Result<Self, PaneError> {
        let ref_tree = match MerkleTree::load(ref_tree_path.as_ref()) {
            Ok(t) => t,
            Err(e) if is_not_found(&e) => return Err(PaneError::RefTreeMissing),
            Err(e) => return Err(e.into()),
        };
        let geometry = *ref_tree.geometry();

        let local_tree_path = local_tree_path.as_ref().to_path_buf();
        let local_tree = match MerkleTree::load(&local_tree_path) {
            Ok(t) => {
                if t.chunk_size() != geometry.chunk_size() || t.total_size() != geometry.total_size()
                {
                    return Err(PaneError::GeometryMismatch(
                        "local tree geometry disagrees with reference tree".to_string(),
                    ));
                }
                t
            }
            Err(e) if is_not_found(&e) => MerkleTree::create_empty(geometry),
            Err(e) => return Err(e.into()),
        };

        let data_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(data_path.as_ref())?;
        let data_len = data_file.metadata()?.len();
        if data_len == 0 {
            // Freshly created (or already-empty) data file: grow it sparsely
            // to the full geometry size.
            data_file.set_len(geometry.total_size())?;
        } else if data_len != geometry.total_size() {
            return Err(PaneError::GeometryMismatch(format!(
                "data file size {data_len} disagrees with geometry total size {}",
                geometry.total_size()
            )));
        }

        Ok(Pane {
            data_file: Arc::new(data_file),
            local_tree: Arc::new(RwLock::new(local_tree)),
            local_tree_path: Arc::new(local_tree_path),
            ref_tree: Arc::new(ref_tree),
            geometry,
            remote_url: remote_url.map(Arc::from),
        })
    }

    pub fn remote_url(&self) -> Option<&str> {
        self.remote_url.as_deref()
    }

    /// Flushes the local tree to disk. The data file and tree handles are
    /// dropped along with the last clone of this `Pane`.
    pub fn close(self) -> Result<(), PaneError> {
        self.local_tree.read().save(&*self.local_tree_path)?;
        Ok(())
    }

    fn read_chunk_sync(&self, index: u32) -> Result<Vec<u8>, PaneError> {
        if !self.local_tree.read().is_leaf_valid(index) {
            return Err(PaneError::NotIntact { chunk_index: index });
        }
        let boundary = self.geometry.boundary(index)?;
        let mut buf = vec![0u8; boundary.size() as usize];
        self.data_file.read_exact_at(&mut buf, boundary.start_inclusive)?;
        Ok(buf)
    }

    fn verify_chunk_sync(&self, index: u32) -> Result<bool, PaneError> {
        let boundary = self.geometry.boundary(index)?;
        let mut buf = vec![0u8; boundary.size() as usize];
        self.data_file.read_exact_at(&mut buf, boundary.start_inclusive)?;
        let h = leaf_hash(&buf);
        Ok(h == self.ref_tree.leaf_hash(index)?)
    }

    /// Validates length and hash against the reference tree, writes the
    /// bytes, fsyncs, then marks the leaf valid. A hash mismatch never
    /// touches the data file or the leaf's validity bit.
    fn submit_chunk_sync(&self, index: u32, bytes: &[u8]) -> Result<(), PaneError> {
        let boundary = self.geometry.boundary(index)?;
        if bytes.len() as u64 != boundary.size() {
            return Err(PaneError::InvalidArg(format!(
                "chunk {index} expected {} bytes, got {}",
                boundary.size(),
                bytes.len()
            )));
        }

        let h = leaf_hash(bytes);
        if h != self.ref_tree.leaf_hash(index)? {
            return Err(PaneError::VerifyFailed { chunk_index: index });
        }

        // Durable write precedes marking the leaf valid.
        self.data_file.write_all_at(bytes, boundary.start_inclusive)?;
        self.data_file.sync_data()?;

        let mut tree = self.local_tree.write();
        tree.update_leaf_hash(index, h)?;
        tree.refresh_ancestors(index)?;
        tree.mark_leaf_valid(index);

        Ok(())
    }
}

fn is_not_found(e: &crate::error::MerkleError) -> bool {
    matches!(e, crate::error::MerkleError::Io(io) if io.kind() == std::io::ErrorKind::NotFound)
}

#[async_trait]
impl PaneCapability for Pane {
    fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    async fn is_chunk_intact(&self, index: u32) -> bool {
        self.local_tree.read().is_leaf_valid(index)
    }

    async fn submit_chunk(&self, index: u32, bytes: Vec<u8>) -> Result<(), PaneError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.submit_chunk_sync(index, &bytes))
            .await
            .expect("submit_chunk blocking task panicked")
    }

    async fn verify_chunk(&self, index: u32) -> Result<bool, PaneError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.verify_chunk_sync(index))
            .await
            .expect("verify_chunk blocking task panicked")
    }

    async fn read_chunk(&self, index: u32) -> Result<Vec<u8>, PaneError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.read_chunk_sync(index))
            .await
            .expect("read_chunk blocking task panicked")
    }
}

/// In-memory stand-in for `Pane`, used by `Painter` tests so they don't
/// need real files. Chunks are "durable" the moment they're in the map;
/// an optional reference tree makes `VerifyFailed` reproducible.
pub struct FakePane {
    geometry: ChunkGeometry,
    ref_tree: Option<MerkleTree>,
    chunks: RwLock<std::collections::HashMap<u32, Vec<u8>>>,
}

impl FakePane {
    pub fn new(geometry: ChunkGeometry) -> Self {
        FakePane {
            geometry,
            ref_tree: None,
            chunks: RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub fn with_reference(ref_tree: MerkleTree) -> Self {
        FakePane {
            geometry: *ref_tree.geometry(),
            ref_tree: Some(ref_tree),
            chunks: RwLock::new(std::collections::HashMap::new()),
        }
    }
}

#[async_trait]
impl PaneCapability for FakePane {
    fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    async fn is_chunk_intact(&self, index: u32) -> bool {
        self.chunks.read().contains_key(&index)
    }

    async fn submit_chunk(&self, index: u32, bytes: Vec<u8>) -> Result<(), PaneError> {
        let boundary = self.geometry.boundary(index)?;
        if bytes.len() as u64 != boundary.size() {
            return Err(PaneError::InvalidArg(format!(
                "chunk {index} expected {} bytes, got {}",
                boundary.size(),
                bytes.len()
            )));
        }
        if let Some(ref_tree) = &self.ref_tree {
            if leaf_hash(&bytes) != ref_tree.leaf_hash(index)? {
                return Err(PaneError::VerifyFailed { chunk_index: index });
            }
        }
        self.chunks.write().insert(index, bytes);
        Ok(())
    }

    async fn verify_chunk(&self, index: u32) -> Result<bool, PaneError> {
        let chunks = self.chunks.read();
        let bytes = chunks
            .get(&index)
            .ok_or(PaneError::NotIntact { chunk_index: index })?;
        Ok(match &self.ref_tree {
            Some(ref_tree) => leaf_hash(bytes) == ref_tree.leaf_hash(index)?,
            None => true,
        })
    }

    async fn read_chunk(&self, index: u32) -> Result<Vec<u8>, PaneError> {
        self.chunks
            .read()
            .get(&index)
            .cloned()
            .ok_or(PaneError::NotIntact { chunk_index: index })
    }
}
