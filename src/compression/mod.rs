//! chunk body 的块压缩（LZ4 / None）
//!
//! 解压时必须给出原始长度（线上首部的 `decompressed size`），结果长度不符即为损坏。

use crate::common::{EngineError, Result};
use crate::field_type::CompressionType;

pub fn compress(data: &[u8], codec: CompressionType) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4  =>
            lz4::block::compress(data, None, false)
                .map_err(|e| EngineError::Compression(e.to_string())),
    }
}

/// 按属性偏好压缩；没有收益时退回 `None`，返回实际采用的方式
pub fn compress_if_smaller(data: &[u8], preferred: CompressionType) -> Result<(CompressionType, Vec<u8>)> {
    if preferred == CompressionType::None {
        return Ok((CompressionType::None, data.to_vec()));
    }
    let packed = compress(data, preferred)?;
    if packed.len() >= data.len() {
        return Ok((CompressionType::None, data.to_vec()));
    }
    Ok((preferred, packed))
}

pub fn decompress(
    data:             &[u8],
    codec:            CompressionType,
    uncompressed_len: usize,
) -> Result<Vec<u8>> {
    let out = match codec {
        CompressionType::None => data.to_vec(),
        CompressionType::Lz4  => {
            let len = i32::try_from(uncompressed_len)
                .map_err(|_| EngineError::Compression(format!("size {uncompressed_len} too large")))?;
            lz4::block::decompress(data, Some(len))
                .map_err(|e| EngineError::Compression(e.to_string()))?
        }
    };
    if out.len() != uncompressed_len {
        return Err(EngineError::Compression(format!(
            "expected {uncompressed_len} bytes after decompression, got {}", out.len())));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_restores_input() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        let packed = compress(&data, CompressionType::Lz4).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed, CompressionType::Lz4, data.len()).unwrap(), data);
    }

    #[test]
    fn incompressible_input_falls_back() {
        let data: Vec<u8> = (0..64u8).collect();
        let (codec, out) = compress_if_smaller(&data, CompressionType::Lz4).unwrap();
        assert_eq!(codec, CompressionType::None);
        assert_eq!(out, data);
    }

    #[test]
    fn size_mismatch_is_reported() {
        let data = b"abcdef".to_vec();
        assert!(decompress(&data, CompressionType::None, 3).is_err());
    }
}
