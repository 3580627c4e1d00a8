//! chunk 的线上负载
//!
//! ```text
//! ┌──────────────────────────┬─────────────────┬────────────────────┬──────────────┐
//! │ i64 LE × n_dims (起点)   │ compression i32 │ decompressed i32   │ body bytes   │
//! └──────────────────────────┴─────────────────┴────────────────────┴──────────────┘
//! ```
//! body 即 [`Chunk::pack`] 的输出，compression = 1 时为 LZ4 block。

use std::io::{Cursor, Write};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::chunk::Chunk;
use crate::common::{coords_to_string, AttributeId, Coordinates, EngineError, Result};
use crate::compression::{compress_if_smaller, decompress};
use crate::field_type::CompressionType;
use crate::meta::ArrayDesc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireHeader {
    /// chunk 核心区起点
    pub coords:            Coordinates,
    pub compression:       CompressionType,
    pub decompressed_size: usize,
}

pub fn header_len(n_dims: usize) -> usize {
    n_dims * 8 + 4 + 4
}

/// 编码为线上负载；压缩无收益时退回不压缩
pub fn encode_chunk(chunk: &Chunk) -> Result<Vec<u8>> {
    let body = chunk.pack()?;
    let size = i32::try_from(body.len())
        .map_err(|_| EngineError::ResourceExhausted(format!("chunk body of {} bytes", body.len())))?;

    let (codec, data) = compress_if_smaller(&body, chunk.attribute().compression)?;

    let coords = chunk.first_position(false);
    let mut out = Vec::with_capacity(header_len(coords.len()) + data.len());
    for c in &coords {
        out.write_i64::<LittleEndian>(*c)?;
    }
    out.write_i32::<LittleEndian>(codec.code())?;
    out.write_i32::<LittleEndian>(size)?;
    out.write_all(&data)?;
    Ok(out)
}

/// 只解析首部，不解码 body
pub fn decode_header(payload: &[u8], n_dims: usize) -> Result<WireHeader> {
    if payload.len() < header_len(n_dims) {
        return Err(EngineError::Encoding(format!(
            "chunk payload of {} bytes is shorter than its header", payload.len())));
    }
    let mut rd = Cursor::new(payload);
    let coords = (0..n_dims)
        .map(|_| rd.read_i64::<LittleEndian>())
        .collect::<std::io::Result<Coordinates>>()?;
    let compression = CompressionType::from_code(rd.read_i32::<LittleEndian>()?)?;
    let size = rd.read_i32::<LittleEndian>()?;
    let decompressed_size = usize::try_from(size)
        .map_err(|_| EngineError::Encoding(format!("negative decompressed size {size}")))?;
    Ok(WireHeader { coords, compression, decompressed_size })
}

pub fn decode_chunk(payload: &[u8], array: &ArrayDesc, attribute: AttributeId) -> Result<Chunk> {
    let n_dims = array.num_dimensions();
    let header = decode_header(payload, n_dims)?;
    let desc = array.chunk_descriptor(attribute, &header.coords)?;
    if desc.first_position != header.coords {
        return Err(EngineError::SchemaMismatch(format!(
            "payload position {} is not a chunk origin", coords_to_string(&header.coords))));
    }
    let body = decompress(&payload[header_len(n_dims)..], header.compression, header.decompressed_size)?;
    Chunk::unpack(desc, array.attribute(attribute)?.clone(), array.emptyable, &body)
}
