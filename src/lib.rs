//! Content-verified, lazily-materialized file cache: a local file is
//! divided into fixed-size chunks, hashed into a Merkle tree, and filled
//! in on demand from a remote source as a [`Painter`] downloads and
//! verifies each missing chunk against a reference tree.

pub mod bitmap;
pub mod error;
pub mod geometry;
pub mod hash;
pub mod merkle;
pub mod pane;
pub mod painter;
pub mod pool;

pub use bitmap::Bitmap;
pub use error::Error;
pub use geometry::{ChunkBoundary, ChunkGeometry};
pub use hash::Hash;
pub use merkle::{BuildProgress, MerkleTree};
pub use pane::{FakePane, Pane, PaneCapability};
pub use painter::{
    CancelToken, CollectingEventSink, EventSink, NodeTransfer, NullEventSink, PaintEvent,
    PaintReport, Painter, PainterConfig, RemoteTransport, TransportError,
};
pub use pool::{ObjectPool, Scoped};
