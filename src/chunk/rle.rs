//! RLE 编码：run 段 + 值字典 + empty bitmap
//!
//! 每个段覆盖物理序号 `[p_position, next.p_position)`：
//! - `same`  — 段内所有单元共享字典中 `value_index` 处的同一个值
//! - literal — 段内第 i 个单元取 `value_index + i`
//! - `null`  — `value_index` 是原因码，字典中无对应值
//!
//! 逻辑位置先经 empty bitmap 换算为物理序号，再二分定位段。
//!
//! ```text
//! ┌───────┬────────┬───────┬────────────────────────┬─────────────┬──────────────┐
//! │ magic │ n_segs │ count │ (p_position, packed)*  │ value slots │ empty bitmap │
//! └───────┴────────┴───────┴────────────────────────┴─────────────┴──────────────┘
//! packed = value_index(30 bit) | same << 30 | null << 31
//! ```

use std::io::{Read, Write};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bitmap::EmptyBitmap;
use crate::common::{reserve, EngineError, Position, Result};
use crate::field_type::{MissingReason, Value};

use super::{to_usize, CellSource, SlotArea, SlotLayout, RLE_MAGIC};

/// 字典下标上限（30 bit）
pub const MAX_VALUE_INDEX: u64 = (1 << 30) - 1;

const SAME_BIT: u32 = 1 << 30;
const NULL_BIT: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RleSegment {
    pub p_position:  u64,
    pub value_index: u32,
    pub same:        bool,
    pub null:        bool,
}

impl RleSegment {
    fn packed(self) -> u32 {
        let mut raw = self.value_index;
        if self.same { raw |= SAME_BIT; }
        if self.null { raw |= NULL_BIT; }
        raw
    }

    fn from_packed(p_position: u64, raw: u32) -> Self {
        Self {
            p_position,
            value_index: raw & !(SAME_BIT | NULL_BIT),
            same:        raw & SAME_BIT != 0,
            null:        raw & NULL_BIT != 0,
        }
    }
}

// ── RlePayload ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RlePayload {
    segments: Vec<RleSegment>,
    /// 物理单元总数
    count:    u64,
    values:   SlotArea,
}

impl RlePayload {
    pub fn new(layout: SlotLayout) -> Self {
        Self { segments: Vec::new(), count: 0, values: SlotArea::new(layout) }
    }

    pub fn count(&self) -> u64 { self.count }
    pub fn n_segments(&self) -> usize { self.segments.len() }
    pub fn segments(&self) -> &[RleSegment] { &self.segments }
    /// 字典中的值个数
    pub fn n_values(&self) -> u64 { self.values.len() }

    pub fn segment_len(&self, i: usize) -> u64 {
        let end = self.segments.get(i + 1).map_or(self.count, |s| s.p_position);
        end - self.segments[i].p_position
    }

    pub fn find_segment(&self, p: u64) -> Option<usize> {
        if p >= self.count {
            return None;
        }
        self.segments.partition_point(|s| s.p_position <= p).checked_sub(1)
    }

    pub fn get(&self, p: u64) -> Result<Value> {
        let i = self.find_segment(p)
            .ok_or_else(|| EngineError::Encoding(format!("rle ordinal {p} out of range")))?;
        let seg = self.segments[i];
        if seg.null {
            return Ok(Value::Missing(MissingReason::new(seg.value_index)?));
        }
        let idx = if seg.same {
            seg.value_index as u64
        } else {
            seg.value_index as u64 + (p - seg.p_position)
        };
        Ok(Value::Data(self.values.get(idx)?))
    }

    /// 按物理序解码全部单元
    pub fn decode_all(&self) -> Result<Vec<Value>> {
        (0..self.count).map(|p| self.get(p)).collect()
    }

    pub fn append(&mut self, value: &Value) -> Result<()> {
        self.append_run(value, 1)
    }

    /// 追加 `n` 个相同的值，与上一段合并或新开段
    pub fn append_run(&mut self, value: &Value, n: u64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let bytes = match value {
            Value::Missing(r) => {
                let code = r.code() as u32;
                match self.segments.last() {
                    Some(last) if last.null && last.value_index == code => {}
                    _ => self.push_segment(RleSegment {
                        p_position: self.count, value_index: code, same: true, null: true,
                    })?,
                }
                self.count += n;
                return Ok(());
            }
            Value::Data(b) => b,
        };

        if let Some(li) = self.segments.len().checked_sub(1) {
            let last = self.segments[li];
            if !last.null && last.same && self.values.eq_at(last.value_index as u64, bytes)? {
                self.count += n;
                return Ok(());
            }
            if !last.null && !last.same {
                let len = self.segment_len(li);
                let tail = last.value_index as u64 + len - 1;
                if self.values.eq_at(tail, bytes)? {
                    if len == 1 {
                        self.segments[li].same = true;
                    } else {
                        // literal 末值与新值相同：拆出同值段
                        self.push_segment(RleSegment {
                            p_position: self.count - 1, value_index: tail as u32,
                            same: true, null: false,
                        })?;
                    }
                    self.count += n;
                    return Ok(());
                }
            }
        }

        let idx = self.values.len();
        if idx > MAX_VALUE_INDEX {
            return Err(EngineError::ResourceExhausted(format!(
                "rle dictionary exceeds {} values", MAX_VALUE_INDEX + 1)));
        }
        self.values.push(bytes)?;

        let extends_literal = n == 1 && self.segments.last().map_or(false, |last| {
            !last.null && !last.same
                && last.value_index as u64 + self.segment_len(self.segments.len() - 1) == idx
        });
        if !extends_literal {
            self.push_segment(RleSegment {
                p_position: self.count, value_index: idx as u32, same: n > 1, null: false,
            })?;
        }
        self.count += n;
        Ok(())
    }

    fn push_segment(&mut self, seg: RleSegment) -> Result<()> {
        if self.segments.len() == self.segments.capacity() {
            let cap = self.segments.capacity();
            reserve(&mut self.segments, cap.max(4))?;
        }
        self.segments.push(seg);
        Ok(())
    }

    pub fn packed_size(&self) -> usize {
        8 + 8 + self.segments.len() * 12 + self.values.packed_size()
    }

    pub(crate) fn pack<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_u64::<LittleEndian>(self.segments.len() as u64)?;
        out.write_u64::<LittleEndian>(self.count)?;
        for s in &self.segments {
            out.write_u64::<LittleEndian>(s.p_position)?;
            out.write_u32::<LittleEndian>(s.packed())?;
        }
        self.values.pack(out)
    }

    pub(crate) fn unpack<R: Read>(rd: &mut R, layout: SlotLayout) -> Result<Self> {
        let n_segs = rd.read_u64::<LittleEndian>()?;
        let count  = rd.read_u64::<LittleEndian>()?;
        if n_segs > count || (count > 0 && n_segs == 0) {
            return Err(EngineError::Encoding(format!("{n_segs} rle segments for {count} values")));
        }
        let mut segments: Vec<RleSegment> = Vec::new();
        reserve(&mut segments, to_usize(n_segs)?)?;
        for _ in 0..n_segs {
            let p   = rd.read_u64::<LittleEndian>()?;
            let raw = rd.read_u32::<LittleEndian>()?;
            let expected_first = segments.is_empty() && p != 0;
            if expected_first || segments.last().map_or(false, |s| s.p_position >= p) || p >= count {
                return Err(EngineError::Encoding(format!("rle segment at {p} is out of order")));
            }
            segments.push(RleSegment::from_packed(p, raw));
        }
        let values = SlotArea::unpack(rd, layout)?;
        let payload = Self { segments, count, values };

        for (i, s) in payload.segments.iter().enumerate() {
            let needed = match (s.null, s.same) {
                (true, _)      => continue,
                (false, true)  => s.value_index as u64 + 1,
                (false, false) => s.value_index as u64 + payload.segment_len(i),
            };
            if needed > payload.values.len() {
                return Err(EngineError::Encoding(format!(
                    "rle segment {i} references value {} of {}", needed - 1, payload.values.len())));
            }
        }
        Ok(payload)
    }
}

// ── RleBody ───────────────────────────────────────────────────────────────────

/// 按物理序的 payload + 必有的 empty bitmap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RleBody {
    payload:   RlePayload,
    bitmap:    EmptyBitmap,
    emptyable: bool,
}

impl RleBody {
    pub(crate) fn new(layout: SlotLayout) -> Self {
        Self { payload: RlePayload::new(layout), bitmap: EmptyBitmap::new(), emptyable: true }
    }

    pub(crate) fn from_parts(payload: RlePayload, bitmap: EmptyBitmap, emptyable: bool) -> Result<Self> {
        if payload.count() != bitmap.count() {
            return Err(EngineError::Encoding(format!(
                "rle payload holds {} values, bitmap marks {}", payload.count(), bitmap.count())));
        }
        Ok(Self { payload, bitmap, emptyable })
    }

    pub fn payload(&self) -> &RlePayload { &self.payload }
    pub fn bitmap(&self) -> Option<&EmptyBitmap> { Some(&self.bitmap) }
    /// 非 emptyable 数组的 RLE chunk 仍带 bitmap，记录全部可寻址位置
    pub fn is_emptyable(&self) -> bool { self.emptyable }

    pub fn packed_size(&self) -> usize {
        8 + 1 + self.payload.packed_size() + self.bitmap.packed_size()
    }

    pub fn pack<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_u64::<LittleEndian>(RLE_MAGIC)?;
        out.write_u8(self.emptyable as u8)?;
        self.payload.pack(out)?;
        self.bitmap.pack(out)
    }

    pub(crate) fn unpack<R: Read>(rd: &mut R, layout: SlotLayout, logical_size: u64) -> Result<Self> {
        let emptyable = rd.read_u8()? != 0;
        let payload = RlePayload::unpack(rd, layout)?;
        let bitmap  = EmptyBitmap::unpack(rd, logical_size)?;
        Self::from_parts(payload, bitmap, emptyable)
    }
}

impl CellSource for RleBody {
    fn value_at(&self, pos: Position) -> Result<Option<Value>> {
        match self.bitmap.value_index(pos) {
            Some(p) => self.payload.get(p).map(Some),
            None    => Ok(None),
        }
    }

    fn bitmap(&self) -> Option<&EmptyBitmap> {
        Some(&self.bitmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(values: &[Value]) -> RlePayload {
        let mut p = RlePayload::new(SlotLayout::Fixed(4));
        for v in values {
            p.append(v).unwrap();
        }
        p
    }

    #[test]
    fn runs_and_literals() {
        let seq: Vec<Value> = [1, 1, 1, 2, 3, 4, 4, 4, 5]
            .iter().map(|&v| Value::from_i32(v)).collect();
        let p = payload_of(&seq);
        assert_eq!(p.decode_all().unwrap(), seq);
        // [1×3] [2 3] [4×3] [5]
        assert_eq!(p.n_segments(), 4);
        assert!(p.segments()[0].same);
        assert!(!p.segments()[1].same);
        assert_eq!(p.segment_len(1), 2);
        assert_eq!(p.n_values(), 5);
    }

    #[test]
    fn alternating_values_grow_segments() {
        // 每次交替都开启新段，段表须多次扩容
        let seq: Vec<Value> = (0..500)
            .flat_map(|i| [Value::from_i32(i), Value::from_i32(i), Value::missing(1).unwrap()])
            .collect();
        let p = payload_of(&seq);
        assert_eq!(p.n_segments(), 1000);
        assert_eq!(p.count(), 1500);
        assert_eq!(p.decode_all().unwrap(), seq);
    }

    #[test]
    fn null_runs_keep_reason() {
        let seq = vec![
            Value::missing(2).unwrap(),
            Value::missing(2).unwrap(),
            Value::missing(3).unwrap(),
            Value::from_i32(9),
        ];
        let p = payload_of(&seq);
        assert_eq!(p.n_segments(), 3);
        assert_eq!(p.n_values(), 1);
        assert_eq!(p.decode_all().unwrap(), seq);
    }

    #[test]
    fn append_run_extends_same_segment() {
        let mut p = RlePayload::new(SlotLayout::Bit);
        p.append_run(&Value::from_bool(true), 1000).unwrap();
        p.append_run(&Value::from_bool(true), 24).unwrap();
        p.append(&Value::from_bool(false)).unwrap();
        assert_eq!(p.count(), 1025);
        assert_eq!(p.n_segments(), 2);
        assert_eq!(p.get(1023).unwrap(), Value::from_bool(true));
        assert_eq!(p.get(1024).unwrap(), Value::from_bool(false));
        assert!(p.get(1025).is_err());
    }

    #[test]
    fn body_pack_round_trip() {
        let seq = [Value::from_i32(7), Value::from_i32(7), Value::from_i32(8)];
        let bitmap = EmptyBitmap::from_runs(&[(2, 2), (9, 1)], 16).unwrap();
        let body = RleBody::from_parts(payload_of(&seq), bitmap, true).unwrap();
        assert_eq!(body.value_at(9).unwrap(), Some(Value::from_i32(8)));
        assert_eq!(body.value_at(4).unwrap(), None);

        let mut buf = Vec::new();
        body.pack(&mut buf).unwrap();
        assert_eq!(buf.len(), body.packed_size());
        let back = crate::chunk::ChunkBody::unpack(&buf, SlotLayout::Fixed(4), 16).unwrap();
        assert_eq!(back, crate::chunk::ChunkBody::Rle(body));

        assert!(RleBody::from_parts(payload_of(&seq), EmptyBitmap::new(), true).is_err());
    }
}
