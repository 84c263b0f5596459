//! Ingestion module
//!
//! Turns columnar chunks into [`RawReading`]s:
//! - Chunk sources (in-memory frames, Parquet files)
//! - Timestamp parsing
//! - Per-row validation with malformed-row accounting

mod frame;
mod reading;

pub use frame::{decode_chunk, ChunkSource, DecodedChunk, FrameSource, MalformedRow, ParquetChunkSource};
pub use reading::{parse_timestamp, RawReading};
