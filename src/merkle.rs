//! In-memory and on-disk Merkle tree over fixed-size chunks.
//!
//! Physical layout is a single flat array using array-heap indexing: root
//! at index 0, children of node `i` at `2i+1`/`2i+2`, leaves occupying the
//! last `N` slots where `N = next_pow2(total_chunks)`. This keeps the same
//! "one flat `Vec<Hash>`, built bottom-up, padded to a power of two with a
//! filler hash" idea `pmtorrent`'s `ChunkMerkleTree::build_tree` used, just
//! re-indexed so the footer format in `spec.md` §6 can seek straight to a
//! leaf or a root without walking the array.

use std::io::{Read, Write};
use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::bitmap::Bitmap;
use crate::error::MerkleError;
use crate::geometry::ChunkGeometry;
use crate::hash::{internal_hash, leaf_hash, Hash, HASH_BYTES};

const MAGIC: u32 = 0x4D52_4B4C; // "MRKL"
const VERSION: u32 = 1;
const HASH_ALGO_SHA256: u8 = 1;
const FOOTER_LEN: usize = 44;

/// Progress of an in-flight tree build, reported for large files.
#[derive(Debug, Clone, Copy)]
pub struct BuildProgress {
    pub chunks_hashed: u32,
    pub total_chunks: u32,
}

pub struct MerkleTree {
    nodes: Vec<Hash>,
    valid: Bitmap,
    geometry: ChunkGeometry,
    leaf_capacity: u32, // N = next_pow2(total_chunks), 0 when total_chunks == 0
}

impl MerkleTree {
    /// Allocates an empty tree: all leaves zero, bitmap clear. Its root
    /// hash is not meaningful; it exists purely as a sink for chunks
    /// verified later against a reference tree.
    pub fn create_empty(geometry: ChunkGeometry) -> Self {
        let leaf_capacity = next_pow2(geometry.total_chunks());
        let node_count = node_count_for(leaf_capacity);
        MerkleTree {
            nodes: vec![Hash::zero(); node_count],
            valid: Bitmap::new(geometry.total_chunks()),
            geometry,
            leaf_capacity,
        }
    }

    /// Builds a full tree from an in-memory buffer.
    pub fn from_buffer(data: &[u8]) -> Result<Self, MerkleError> {
        let geometry = ChunkGeometry::from_size(data.len() as u64)?;
        let mut tree = Self::create_empty(geometry);
        for i in 0..geometry.total_chunks() {
            let b = geometry.boundary(i)?;
            let chunk = &data[b.start_inclusive as usize..b.end_exclusive as usize];
            let slot = tree.leaf_slot(i);
            tree.nodes[slot] = leaf_hash(chunk);
        }
        tree.valid = all_set(geometry.total_chunks());
        tree.rebuild_internals();
        Ok(tree)
    }

    /// Builds a full tree by streaming an async reader, chunk size at a
    /// time, optionally reporting progress on `progress`.
    pub async fn from_reader<R>(
        mut reader: R,
        geometry: ChunkGeometry,
        progress: Option<tokio::sync::mpsc::Sender<BuildProgress>>,
    ) -> Result<Self, MerkleError>
    where
        R: AsyncRead + Unpin,
    {
        let mut tree = Self::create_empty(geometry);
        let mut buf = vec![0u8; geometry.chunk_size() as usize];

        for i in 0..geometry.total_chunks() {
            let b = geometry.boundary(i)?;
            let want = b.size() as usize;
            reader.read_exact(&mut buf[..want]).await?;
            let slot = tree.leaf_slot(i);
            tree.nodes[slot] = leaf_hash(&buf[..want]);
            tree.valid.set(i, true);

            if let Some(tx) = &progress {
                let _ = tx
                    .send(BuildProgress {
                        chunks_hashed: i + 1,
                        total_chunks: geometry.total_chunks(),
                    })
                    .await;
            }
        }

        tree.rebuild_internals();
        Ok(tree)
    }

    /// Builds a full tree from a data file on disk. A missing file is
    /// mapped to an empty tree with geometry derived from size 0, matching
    /// every other not-found outcome being a clean "nothing here yet".
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, MerkleError> {
        let file = match tokio::fs::File::open(path.as_ref()).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::create_empty(ChunkGeometry::from_size(0)?));
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        let geometry = ChunkGeometry::from_size(len)?;
        Self::from_reader(file, geometry, None).await
    }

    pub fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    pub fn chunk_size(&self) -> u64 {
        self.geometry.chunk_size()
    }

    pub fn total_size(&self) -> u64 {
        self.geometry.total_size()
    }

    pub fn leaves(&self) -> u32 {
        self.geometry.total_chunks()
    }

    pub fn is_leaf_valid(&self, index: u32) -> bool {
        if index >= self.leaves() {
            return false;
        }
        self.valid.get(index)
    }

    pub fn leaf_hash(&self, index: u32) -> Result<Hash, MerkleError> {
        if index >= self.leaves() {
            return Err(MerkleError::OutOfRange(format!(
                "leaf index {index} out of range [0, {})",
                self.leaves()
            )));
        }
        Ok(self.nodes[self.leaf_slot(index)])
    }

    pub fn hash(&self, node_index: usize) -> Result<Hash, MerkleError> {
        self.nodes.get(node_index).cloned().ok_or_else(|| {
            MerkleError::OutOfRange(format!("node index {node_index} out of range"))
        })
    }

    pub fn invalidate_leaf(&mut self, index: u32) {
        if index < self.leaves() {
            self.valid.set(index, false);
        }
    }

    /// Marks a leaf valid without touching its stored hash. Callers must
    /// already have confirmed the bytes backing this leaf match the hash
    /// on record (e.g. `Pane::submit_chunk` after a successful compare
    /// against the reference tree).
    pub fn mark_leaf_valid(&mut self, index: u32) {
        if index < self.leaves() {
            self.valid.set(index, true);
        }
    }

    /// Overwrites a leaf's stored hash. Per the redesign note in
    /// `spec.md` §9, the leaf is left invalid until the caller re-verifies
    /// it (e.g. via `Pane::submit_chunk`) rather than trusting the raw
    /// overwrite.
    pub fn update_leaf_hash(&mut self, index: u32, h: Hash) -> Result<(), MerkleError> {
        if index >= self.leaves() {
            return Err(MerkleError::OutOfRange(format!(
                "leaf index {index} out of range [0, {})",
                self.leaves()
            )));
        }
        let slot = self.leaf_slot(index);
        self.nodes[slot] = h;
        self.valid.set(index, false);
        Ok(())
    }

    /// Re-derives the `log2(N)` ancestors on the path from leaf `index` to
    /// the root. Call after `update_leaf_hash` if a caller depends on
    /// internal hashes reflecting the new leaf.
    pub fn refresh_ancestors(&mut self, index: u32) -> Result<(), MerkleError> {
        if index >= self.leaves() {
            return Err(MerkleError::OutOfRange(format!(
                "leaf index {index} out of range [0, {})",
                self.leaves()
            )));
        }
        let mut pos = self.leaf_slot(index);
        while pos > 0 {
            let parent = (pos - 1) / 2;
            let (left, right) = (2 * parent + 1, 2 * parent + 2);
            self.nodes[parent] = internal_hash(&self.nodes[left], &self.nodes[right]);
            pos = parent;
        }
        Ok(())
    }

    /// Indices in `[lo, hi)` where both trees have the leaf marked valid
    /// but the stored hashes disagree. Tree shapes (chunk size, total
    /// size) must match.
    pub fn find_mismatched_chunks_in_range(
        &self,
        other: &MerkleTree,
        lo: u32,
        hi: u32,
    ) -> Result<Vec<u32>, MerkleError> {
        if self.chunk_size() != other.chunk_size() || self.total_size() != other.total_size() {
            return Err(MerkleError::InvalidArg(
                "tree shapes must match to compare leaves".to_string(),
            ));
        }

        let hi = std::cmp::min(hi, self.leaves());
        let mut mismatched = Vec::new();
        for i in lo..hi {
            if self.valid.get(i)
                && other.valid.get(i)
                && self.leaf_hash(i)? != other.leaf_hash(i)?
            {
                mismatched.push(i);
            }
        }
        Ok(mismatched)
    }

    /// Atomically writes payload (the flat node array) then bitmap then
    /// footer, flushing before returning so the file is durable.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MerkleError> {
        let tmp_path = Self::tmp_path(path.as_ref());
        {
            let mut f = std::fs::File::create(&tmp_path)?;
            for node in &self.nodes {
                f.write_all(node.as_bytes())?;
            }
            f.write_all(self.valid.as_bytes())?;

            let footer = self.encode_footer();
            f.write_all(&footer)?;
            f.flush()?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, path.as_ref())?;
        Ok(())
    }

    /// Reads the footer from the tail of `path`, maps the payload and
    /// bitmap, and validates every invariant the footer claims to satisfy.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MerkleError> {
        let mut f = std::fs::File::open(path.as_ref())?;
        let file_len = f.metadata()?.len();
        if file_len < FOOTER_LEN as u64 {
            return Err(MerkleError::CorruptFooter(
                "file shorter than one footer".to_string(),
            ));
        }

        let mut footer = [0u8; FOOTER_LEN];
        {
            use std::io::Seek;
            f.seek(std::io::SeekFrom::End(-(FOOTER_LEN as i64)))?;
            f.read_exact(&mut footer)?;
        }

        let magic = be_u32(&footer[0..4]);
        if magic != MAGIC {
            return Err(MerkleError::CorruptFooter(format!(
                "bad magic 0x{magic:08x}"
            )));
        }
        let version = be_u32(&footer[4..8]);
        if version != VERSION {
            return Err(MerkleError::VersionMismatch {
                found: version,
                expected: VERSION,
            });
        }
        let total_file_size = be_u64(&footer[8..16]);
        let chunk_size = be_u64(&footer[16..24]);
        let total_chunks = be_u32(&footer[24..28]);
        let hash_algo = footer[28];
        if hash_algo != HASH_ALGO_SHA256 {
            return Err(MerkleError::CorruptFooter(format!(
                "unsupported hash_algo {hash_algo}"
            )));
        }
        let footer_length = be_u32(&footer[36..40]) as usize;
        if footer_length != FOOTER_LEN {
            return Err(MerkleError::CorruptFooter(format!(
                "unexpected footer_length {footer_length}"
            )));
        }
        let stored_crc = be_u32(&footer[40..44]);
        let computed_crc = crc32fast::hash(&footer[..40]);
        if stored_crc != computed_crc {
            return Err(MerkleError::CorruptFooter("footer CRC mismatch".to_string()));
        }
        if !chunk_size.is_power_of_two() {
            return Err(MerkleError::CorruptFooter(
                "chunk_size is not a power of two".to_string(),
            ));
        }

        let leaf_capacity = next_pow2(total_chunks);
        let node_count = node_count_for(leaf_capacity);
        let bitmap_len = Bitmap::byte_len(total_chunks);
        let expected_len = (node_count * HASH_BYTES + bitmap_len + FOOTER_LEN) as u64;
        if expected_len != file_len {
            return Err(MerkleError::CorruptFooter(format!(
                "file length {file_len} does not match expected {expected_len}"
            )));
        }

        // Read-only mmap of the whole file; payload and bitmap are parsed
        // straight out of the map rather than copied through a buffer.
        let map = unsafe { memmap2::Mmap::map(&f)? };

        let mut nodes = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let off = i * HASH_BYTES;
            let mut h = [0u8; HASH_BYTES];
            h.copy_from_slice(&map[off..off + HASH_BYTES]);
            nodes.push(Hash::from_bytes(h));
        }

        let bitmap_off = node_count * HASH_BYTES;
        let bitmap_bytes = map[bitmap_off..bitmap_off + bitmap_len].to_vec();

        let geometry = ChunkGeometry::from_size(total_file_size)?;
        if geometry.chunk_size() != chunk_size || geometry.total_chunks() != total_chunks {
            return Err(MerkleError::CorruptFooter(
                "footer geometry fields are inconsistent with total_file_size".to_string(),
            ));
        }

        Ok(MerkleTree {
            nodes,
            valid: Bitmap::from_bytes(bitmap_bytes, total_chunks),
            geometry,
            leaf_capacity,
        })
    }

    fn leaf_slot(&self, index: u32) -> usize {
        (self.leaf_capacity as usize - 1) + index as usize
    }

    fn rebuild_internals(&mut self) {
        if self.leaf_capacity == 0 {
            return;
        }
        let internal_count = self.leaf_capacity as usize - 1;
        for k in (0..internal_count).rev() {
            let (left, right) = (2 * k + 1, 2 * k + 2);
            self.nodes[k] = internal_hash(&self.nodes[left], &self.nodes[right]);
        }
    }

    fn encode_footer(&self) -> [u8; FOOTER_LEN] {
        let mut footer = [0u8; FOOTER_LEN];
        footer[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        footer[4..8].copy_from_slice(&VERSION.to_be_bytes());
        footer[8..16].copy_from_slice(&self.geometry.total_size().to_be_bytes());
        footer[16..24].copy_from_slice(&self.geometry.chunk_size().to_be_bytes());
        footer[24..28].copy_from_slice(&self.geometry.total_chunks().to_be_bytes());
        footer[28] = HASH_ALGO_SHA256;
        // footer[29..36] stays zero padding.
        footer[36..40].copy_from_slice(&(FOOTER_LEN as u32).to_be_bytes());
        let crc = crc32fast::hash(&footer[..40]);
        footer[40..44].copy_from_slice(&crc.to_be_bytes());
        footer
    }

    fn tmp_path(path: &Path) -> std::path::PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(".tmp");
        std::path::PathBuf::from(s)
    }
}

fn all_set(len: u32) -> Bitmap {
    let mut bm = Bitmap::new(len);
    for i in 0..len {
        bm.set(i, true);
    }
    bm
}

fn node_count_for(leaf_capacity: u32) -> usize {
    if leaf_capacity == 0 {
        0
    } else {
        2 * leaf_capacity as usize - 1
    }
}

fn next_pow2(n: u32) -> u32 {
    if n == 0 {
        0
    } else if n == 1 {
        1
    } else {
        1u32 << (32 - (n - 1).leading_zeros())
    }
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes(b.try_into().unwrap())
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes(b.try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_pow2_matches_expectations() {
        assert_eq!(next_pow2(0), 0);
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(4), 4);
        assert_eq!(next_pow2(6), 8);
        assert_eq!(next_pow2(9), 16);
    }

    #[test]
    fn empty_tree_has_no_internals() {
        let g = ChunkGeometry::from_size(0).unwrap();
        let t = MerkleTree::create_empty(g);
        assert_eq!(t.leaves(), 0);
    }

    #[test]
    fn law6_hash_determinism() {
        let data = vec![7u8; 6144];
        let t1 = MerkleTree::from_buffer(&data).unwrap();
        let t2 = MerkleTree::from_buffer(&data).unwrap();
        assert_eq!(t1.hash(0).unwrap(), t2.hash(0).unwrap());
        for i in 0..t1.leaves() {
            assert_eq!(t1.leaf_hash(i).unwrap(), t2.leaf_hash(i).unwrap());
        }
    }

    #[test]
    fn s4_round_trip_mismatch_detection() {
        let data: Vec<u8> = (0..8 * 16).map(|i| i as u8).collect();
        let t1 = MerkleTree::from_buffer(&data).unwrap();

        // This geometry (128 bytes) selects chunk_size = MIN_CHUNK (1 MiB),
        // so the "8 chunks of 16 bytes" framing from spec.md's S4 applies at
        // the granularity of actual file chunking below: we build the
        // second tree from the same 8 real chunks but invert a few bytes
        // inside chunk boundaries directly on the node array instead, since
        // bytes this small all collapse into a single 1 MiB chunk under
        // real geometry. Exercise the documented data flow (find
        // mismatches over a range of leaves) by synthesizing two small
        // trees that share geometry but disagree on five specific leaves.
        let leaves = 64u32;
        let chunk_bytes = 16usize;
        let mut raw = vec![0u8; leaves as usize * chunk_bytes];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        let mut t_ref = build_fixed_leaf_tree(&raw, chunk_bytes);
        let mut corrupted = raw.clone();
        for &idx in &[10usize, 20, 30, 40, 50] {
            corrupted[idx * chunk_bytes] ^= 0xFF;
        }
        let t_other = build_fixed_leaf_tree(&corrupted, chunk_bytes);

        let mismatched = t_ref
            .find_mismatched_chunks_in_range(&t_other, 0, leaves)
            .unwrap();
        assert_eq!(mismatched, vec![10, 20, 30, 40, 50]);

        let mismatched = t_ref
            .find_mismatched_chunks_in_range(&t_other, 15, 45)
            .unwrap();
        assert_eq!(mismatched, vec![20, 30, 40]);

        let mismatched = t_ref
            .find_mismatched_chunks_in_range(&t_other, 0, 5)
            .unwrap();
        assert!(mismatched.is_empty());

        // Also cover find_mismatched's reliance on both bitmaps: an
        // invalidated leaf is excluded even if the bytes disagree.
        t_ref.invalidate_leaf(10);
        let mismatched = t_ref
            .find_mismatched_chunks_in_range(&t_other, 0, leaves)
            .unwrap();
        assert_eq!(mismatched, vec![20, 30, 40, 50]);
        let _ = t1; // keep around to show the natural from_buffer path too
    }

    /// Test helper: builds a tree with a caller-chosen chunk size instead
    /// of the geometry selection rule, for exercising tree shape directly.
    fn build_fixed_leaf_tree(raw: &[u8], chunk_bytes: usize) -> MerkleTree {
        let total_chunks = (raw.len() / chunk_bytes) as u32;
        let geometry = test_geometry(raw.len() as u64, chunk_bytes as u64, total_chunks);
        let mut tree = MerkleTree::create_empty(geometry);
        for i in 0..total_chunks {
            let start = i as usize * chunk_bytes;
            let end = start + chunk_bytes;
            let slot = tree.leaf_slot(i);
            tree.nodes[slot] = leaf_hash(&raw[start..end]);
            tree.valid.set(i, true);
        }
        tree.rebuild_internals();
        tree
    }

    fn test_geometry(total_file_size: u64, chunk_size: u64, total_chunks: u32) -> ChunkGeometry {
        ChunkGeometry::for_test(total_file_size, chunk_size, total_chunks)
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.mrkl");

        let data = vec![3u8; 3 * (1 << 20) + 17];
        let tree = MerkleTree::from_buffer(&data).unwrap();
        tree.save(&path).unwrap();

        let loaded = MerkleTree::load(&path).unwrap();
        assert_eq!(loaded.chunk_size(), tree.chunk_size());
        assert_eq!(loaded.total_size(), tree.total_size());
        assert_eq!(loaded.leaves(), tree.leaves());
        for i in 0..tree.leaves() {
            assert_eq!(loaded.leaf_hash(i).unwrap(), tree.leaf_hash(i).unwrap());
            assert_eq!(loaded.is_leaf_valid(i), tree.is_leaf_valid(i));
        }
        assert_eq!(loaded.hash(0).unwrap(), tree.hash(0).unwrap());
    }

    #[tokio::test]
    async fn from_path_missing_file_yields_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-data-file");

        let tree = MerkleTree::from_path(&path).await.unwrap();
        assert_eq!(tree.total_size(), 0);
        assert_eq!(tree.leaves(), 0);
    }

    #[tokio::test]
    async fn from_path_matches_from_buffer_for_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");

        let data = vec![4u8; 2 * (1 << 20) + 9];
        std::fs::write(&path, &data).unwrap();

        let from_disk = MerkleTree::from_path(&path).await.unwrap();
        let from_mem = MerkleTree::from_buffer(&data).unwrap();

        assert_eq!(from_disk.chunk_size(), from_mem.chunk_size());
        assert_eq!(from_disk.total_size(), from_mem.total_size());
        assert_eq!(from_disk.leaves(), from_mem.leaves());
        for i in 0..from_mem.leaves() {
            assert_eq!(from_disk.leaf_hash(i).unwrap(), from_mem.leaf_hash(i).unwrap());
            assert!(from_disk.is_leaf_valid(i));
        }
        assert_eq!(from_disk.hash(0).unwrap(), from_mem.hash(0).unwrap());
    }

    #[test]
    fn load_rejects_corrupt_footer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.mrkl");
        let tree = MerkleTree::from_buffer(&vec![1u8; 1 << 20]).unwrap();
        tree.save(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            MerkleTree::load(&path),
            Err(MerkleError::CorruptFooter(_))
        ));
    }

    #[test]
    fn refresh_ancestors_updates_full_path() {
        let data = vec![9u8; 4 * (1 << 20)];
        let mut tree = MerkleTree::from_buffer(&data).unwrap();
        let root_before = tree.hash(0).unwrap();

        let new_hash = leaf_hash(b"different content entirely");
        tree.update_leaf_hash(0, new_hash).unwrap();
        assert!(!tree.is_leaf_valid(0));
        assert_eq!(tree.leaf_hash(0).unwrap(), new_hash);

        tree.refresh_ancestors(0).unwrap();
        assert_ne!(tree.hash(0).unwrap(), root_before);
    }
}
