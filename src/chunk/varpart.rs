//! 变长值区（var part）
//!
//! 每个值带 1 或 5 字节长度头：
//! - 长度 1..=255：`[len: u8][bytes]`
//! - 其他（含 0）：`[0u8][len: u32 LE][bytes]`
//!
//! 定长槽中只保存 4 字节的区内偏移，扩容只移动字节而不会使偏移失效。

use crate::common::{reserve, EngineError, Result};

pub fn header_size(len: usize) -> usize {
    if len > 0 && len < 256 { 1 } else { 5 }
}

/// 追加一个值，返回其偏移
pub fn push_datum(area: &mut Vec<u8>, bytes: &[u8]) -> Result<u32> {
    let offset = u32::try_from(area.len())
        .map_err(|_| EngineError::ResourceExhausted("var part exceeds 4 GiB".into()))?;
    let need = header_size(bytes.len()) + bytes.len();
    if area.len() + need > area.capacity() {
        // 按倍增扩容
        let cap = area.capacity();
        reserve(area, need.max(cap))?;
    }
    if bytes.len() > 0 && bytes.len() < 256 {
        area.push(bytes.len() as u8);
    } else {
        let len = u32::try_from(bytes.len())
            .map_err(|_| EngineError::ResourceExhausted("var value exceeds 4 GiB".into()))?;
        area.push(0);
        area.extend_from_slice(&len.to_le_bytes());
    }
    area.extend_from_slice(bytes);
    Ok(offset)
}

/// 读取偏移处的值
pub fn read_datum(area: &[u8], offset: u32) -> Result<&[u8]> {
    let off = offset as usize;
    let first = *area.get(off)
        .ok_or_else(|| EngineError::Encoding(format!("var offset {off} out of range")))?;
    let (start, len) = if first != 0 {
        (off + 1, first as usize)
    } else {
        let raw = area.get(off + 1..off + 5)
            .ok_or_else(|| EngineError::Encoding(format!("truncated var header at {off}")))?;
        (off + 5, u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    };
    area.get(start..start + len)
        .ok_or_else(|| EngineError::Encoding(format!("truncated var value at {off}")))
}
