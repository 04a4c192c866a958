//! Pure, deterministic mapping from a file's byte size to chunk geometry.
//!
//! No I/O here: everything is arithmetic over `u64`/`u32` and fails only on
//! programmer error (`InvalidArg`, `OutOfRange`), never on transient state.

use crate::error::GeometryError;

/// Smallest chunk size the selection rule will ever choose.
pub const MIN_CHUNK: u64 = 1 << 20; // 1 MiB
/// Largest chunk size the selection rule will ever choose.
pub const MAX_CHUNK: u64 = 64 << 20; // 64 MiB
/// Soft cap on `total_chunks`; relaxed for files bigger than
/// `SOFT_CAP * MAX_CHUNK` rather than growing the chunk size past `MAX_CHUNK`.
pub const SOFT_CAP: u64 = 4096;

/// Immutable, value-typed chunk geometry for one file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    total_file_size: u64,
    chunk_size: u64,
    total_chunks: u32,
}

/// A single chunk's byte range within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBoundary {
    pub chunk_index: u32,
    pub start_inclusive: u64,
    pub end_exclusive: u64,
}

impl ChunkBoundary {
    pub fn size(&self) -> u64 {
        self.end_exclusive - self.start_inclusive
    }

    pub fn contains(&self, position: u64) -> bool {
        position >= self.start_inclusive && position < self.end_exclusive
    }
}

impl ChunkGeometry {
    /// Chooses geometry for a file of `total_file_size` bytes.
    ///
    /// Selection rule: the smallest power-of-two chunk size in
    /// `[MIN_CHUNK, MAX_CHUNK]` whose implied chunk count is `<= SOFT_CAP`;
    /// if none satisfies that (the file is bigger than
    /// `SOFT_CAP * MAX_CHUNK`), use `MAX_CHUNK` and let the chunk count
    /// exceed the cap.
    pub fn from_size(total_file_size: u64) -> Result<Self, GeometryError> {
        let mut chunk_size = MIN_CHUNK;
        loop {
            let implied_chunks = div_ceil(total_file_size, chunk_size);
            if implied_chunks <= SOFT_CAP || chunk_size >= MAX_CHUNK {
                break;
            }
            chunk_size *= 2;
        }

        let total_chunks = div_ceil(total_file_size, chunk_size);
        let total_chunks = u32::try_from(total_chunks).map_err(|_| {
            GeometryError::InvalidArg(format!(
                "total_chunks {total_chunks} overflows u32 for size {total_file_size}"
            ))
        })?;

        Ok(ChunkGeometry {
            total_file_size,
            chunk_size,
            total_chunks,
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn total_size(&self) -> u64 {
        self.total_file_size
    }

    /// The byte range covered by chunk `index`.
    pub fn boundary(&self, index: u32) -> Result<ChunkBoundary, GeometryError> {
        if index >= self.total_chunks {
            return Err(GeometryError::OutOfRange(format!(
                "chunk index {index} out of range [0, {})",
                self.total_chunks
            )));
        }

        let start = index as u64 * self.chunk_size;
        let end = std::cmp::min(start + self.chunk_size, self.total_file_size);

        Ok(ChunkBoundary {
            chunk_index: index,
            start_inclusive: start,
            end_exclusive: end,
        })
    }

    /// The chunk that contains byte position `p`. `p` must be strictly
    /// less than `total_size()`: an empty file has no valid position.
    pub fn chunk_for_position(&self, p: u64) -> Result<u32, GeometryError> {
        if p >= self.total_file_size {
            return Err(GeometryError::OutOfRange(format!(
                "position {p} out of range [0, {})",
                self.total_file_size
            )));
        }

        // chunk_size is always a power of two, so division is exact and cheap.
        Ok((p / self.chunk_size) as u32)
    }

    pub fn contains(&self, boundary: &ChunkBoundary, p: u64) -> bool {
        boundary.contains(p)
    }

    /// Test-only escape hatch: builds a geometry value with an arbitrary
    /// chunk size, bypassing the size-selection rule. Production code
    /// always goes through `from_size`; this exists so tree/pane tests can
    /// exercise small tree shapes without multi-megabyte fixtures.
    #[cfg(test)]
    pub(crate) fn for_test(total_file_size: u64, chunk_size: u64, total_chunks: u32) -> Self {
        ChunkGeometry {
            total_file_size,
            chunk_size,
            total_chunks,
        }
    }
}

fn div_ceil(n: u64, d: u64) -> u64 {
    if n == 0 {
        0
    } else {
        (n - 1) / d + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn s1_cohere_scale_geometry() {
        let g = ChunkGeometry::from_size(41_000_000_000).unwrap();
        assert_eq!(g.chunk_size(), 16 << 20);
        assert_eq!(g.total_chunks(), 2444);
        assert_eq!(g.chunk_for_position(2_324_227 * 4_100).unwrap(), 567);
    }

    #[test]
    fn s2_sub_minimum() {
        let g = ChunkGeometry::from_size(10 * 1024 * 1024).unwrap();
        assert_eq!(g.chunk_size(), MIN_CHUNK);
        assert_eq!(g.total_chunks(), 10);
        assert_eq!(g.chunk_for_position(0).unwrap(), 0);

        let b = g.boundary(9).unwrap();
        assert_eq!(b.start_inclusive, 9 * 1024 * 1024);
        assert_eq!(b.end_exclusive, 10 * 1024 * 1024);
    }

    #[test]
    fn s3_empty_file() {
        let g = ChunkGeometry::from_size(0).unwrap();
        assert_eq!(g.chunk_size(), MIN_CHUNK);
        assert_eq!(g.total_chunks(), 0);
        assert!(matches!(
            g.chunk_for_position(0),
            Err(GeometryError::OutOfRange(_))
        ));
    }

    #[test]
    fn relaxes_cap_past_256_gib() {
        let n = SOFT_CAP * MAX_CHUNK + 1;
        let g = ChunkGeometry::from_size(n).unwrap();
        assert_eq!(g.chunk_size(), MAX_CHUNK);
        assert!(g.total_chunks() as u64 > SOFT_CAP);
    }

    #[test]
    fn boundary_out_of_range() {
        let g = ChunkGeometry::from_size(MIN_CHUNK).unwrap();
        assert!(matches!(
            g.boundary(1),
            Err(GeometryError::OutOfRange(_))
        ));
    }

    #[quickcheck]
    fn law1_chunk_size_is_pow2_in_range(size: u64) -> bool {
        let Ok(g) = ChunkGeometry::from_size(size) else {
            return true; // total_chunks overflowing u32 is outside the spec's domain
        };
        let c = g.chunk_size();
        c.is_power_of_two() && (MIN_CHUNK..=MAX_CHUNK).contains(&c)
    }

    #[quickcheck]
    fn law2_soft_cap_honored_below_threshold(size_mib: u32) -> bool {
        // Keep inputs within a range where the quickcheck loop terminates
        // quickly while still exercising sizes around the soft cap.
        let size = (size_mib as u64) * MIN_CHUNK;
        if size > SOFT_CAP * MAX_CHUNK {
            return true;
        }
        let g = ChunkGeometry::from_size(size).unwrap();
        g.total_chunks() as u64 <= SOFT_CAP
    }

    #[quickcheck]
    fn law3_boundary_arithmetic(size: u64, idx_seed: u32) -> bool {
        let Ok(g) = ChunkGeometry::from_size(size) else {
            return true;
        };
        if g.total_chunks() == 0 {
            return true;
        }
        let idx = idx_seed % g.total_chunks();
        let b = g.boundary(idx).unwrap();
        b.contains(b.start_inclusive)
            && b.end_exclusive == std::cmp::min((idx as u64 + 1) * g.chunk_size(), g.total_size())
    }

    #[quickcheck]
    fn law4_position_roundtrip(size: u64, pos_seed: u64) -> bool {
        let Ok(g) = ChunkGeometry::from_size(size) else {
            return true;
        };
        if g.total_size() == 0 {
            return true;
        }
        let p = pos_seed % g.total_size();
        let idx = g.chunk_for_position(p).unwrap();
        g.boundary(idx).unwrap().contains(p)
    }
}
