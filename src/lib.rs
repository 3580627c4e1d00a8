//! # array-chunk-engine
//!
//! 分块多维数组引擎：数组被切分为规则的 chunk，每个 chunk 按属性单独存放，
//! 可选 Plain / Sparse / RLE 三种编码；多个来源的 chunk 片段经有序合并
//! 还原为完整 chunk。
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         MemArray                              │
//! │   ArrayDesc (维度 / 属性)      ChunkAddress → ChunkHandle     │
//! │            │                                                  │
//! │          Chunk ── PositionMapper (坐标 ↔ 线性位置)            │
//! │   ┌────────┼─────────────┐                                    │
//! │ Plain    Sparse         RLE        + EmptyBitmap (可空数组)   │
//! │   └────────┼─────────────┘                                    │
//! │   ConstChunkIterator / ChunkWriter (IterationMode 标志位)     │
//! └──────────────────────────────────────────────────────────────┘
//!            ▲ wire::decode_chunk               ▲
//! ┌──────────┴───────────────┐    ┌─────────────┴────────────────┐
//! │ StreamMerger             │    │ SinglePassArray               │
//! │  ChunkSource × K 流      │    │  RowProducer，按行横向消费    │
//! │  最小堆选位置            │    └───────────────────────────────┘
//! │  PartialChunkMerger 合并 │
//! └──────────────────────────┘
//! ```

// ── 基础 ──────────────────────────────────────────────────────────────────────
pub mod common;
pub mod config;
pub mod context;
pub mod field_type;
pub mod compression;
pub mod meta;

// ── Chunk 层 ──────────────────────────────────────────────────────────────────
pub mod mapper;
pub mod bitmap;
pub mod chunk;
pub mod wire;
pub mod array;

// ── 分布式合并 / 消费 ─────────────────────────────────────────────────────────
pub mod merge;
pub mod stream;
pub mod single_pass;

pub use array::{ChunkAddress, ChunkHandle, MemArray};
pub use bitmap::EmptyBitmap;
pub use chunk::{Chunk, ChunkWriter, ConstChunkIterator, EncodingKind, IterationMode, Tile};
pub use common::{AttributeId, Coordinate, Coordinates, EngineError, Position, Pull, Result, StreamId};
pub use config::EngineConfig;
pub use context::TaskContext;
pub use field_type::{AttributeDesc, CompressionType, FieldType, MissingReason, Value};
pub use mapper::PositionMapper;
pub use merge::{DefaultChunkMerger, PartialChunkMerger};
pub use meta::{ArrayDesc, ChunkDescriptor, DimensionDesc};
pub use single_pass::{MemRowProducer, RowProducer, SinglePassArray};
pub use stream::{ChunkSource, QueuedChunkSource, StreamMerger, WireChunkSource};
