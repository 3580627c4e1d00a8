//! Sparse 编码：只保存非默认单元
//!
//! 条目按 position 严格递增，查找为二分。null 条目的 offset 字段保存原因码。
//!
//! ```text
//! ┌───────┬────────┬───────┬─────────────┬────────────┬─────────────────────┬──────┬────────┐
//! │ magic │ layout │ flags │ entry_count │ used_bytes │ (pos, offset, null)*│ data │[bitmap]│
//! └───────┴────────┴───────┴─────────────┴────────────┴─────────────────────┴──────┴────────┘
//! ```

use std::io::{Read, Write};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bitmap::EmptyBitmap;
use crate::common::{reserve, EngineError, Position, Result};
use crate::field_type::{MissingReason, Value};

use super::{read_vec, to_usize, varpart, CellSource, PlainBody, SlotLayout, SPARSE_MAGIC};

const FLAG_BITMAP: u8 = 0b01;
const ENTRY_SIZE:  usize = 8 + 4 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseEntry {
    pub position: Position,
    pub offset:   u32,
    pub is_null:  bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseBody {
    layout:  SlotLayout,
    entries: Vec<SparseEntry>,
    data:    Vec<u8>,
    bitmap:  Option<EmptyBitmap>,
}

impl SparseBody {
    pub(crate) fn new(layout: SlotLayout, emptyable: bool, init_capacity: usize) -> Self {
        let mut entries = Vec::new();
        // 初始容量只是提示，分配失败时推迟到首次写入
        let _ = entries.try_reserve(init_capacity);
        Self { layout, entries, data: Vec::new(), bitmap: emptyable.then(EmptyBitmap::new) }
    }

    pub fn entries(&self) -> &[SparseEntry] { &self.entries }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn used_bytes(&self) -> usize { self.data.len() }
    pub fn bitmap(&self) -> Option<&EmptyBitmap> { self.bitmap.as_ref() }

    /// 非默认条目占逻辑空间的比例
    pub fn density(&self, logical_size: u64) -> f64 {
        if logical_size == 0 { 0.0 } else { self.entries.len() as f64 / logical_size as f64 }
    }

    fn find(&self, pos: Position) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&pos, |e| e.position)
    }

    pub fn get(&self, pos: Position) -> Result<Option<Value>> {
        match self.find(pos) {
            Ok(i)  => self.entry_value(&self.entries[i]).map(Some),
            Err(_) => Ok(None),
        }
    }

    fn entry_value(&self, e: &SparseEntry) -> Result<Value> {
        if e.is_null {
            return Ok(Value::Missing(MissingReason::new(e.offset)?));
        }
        let off = e.offset as usize;
        let bytes = match self.layout {
            SlotLayout::Bit      => self.data.get(off..off + 1),
            SlotLayout::Fixed(k) => self.data.get(off..off + k),
            SlotLayout::Var      => Some(varpart::read_datum(&self.data, e.offset)?),
        };
        bytes
            .map(|b| Value::Data(b.to_vec()))
            .ok_or_else(|| EngineError::Encoding(format!("sparse entry offset {off} out of range")))
    }

    fn store(&mut self, value: &Value) -> Result<(u32, bool)> {
        let bytes = match value {
            Value::Missing(r) => return Ok((r.code() as u32, true)),
            Value::Data(b)    => b,
        };
        if self.layout == SlotLayout::Var {
            return Ok((varpart::push_datum(&mut self.data, bytes)?, false));
        }
        let width = match self.layout {
            SlotLayout::Fixed(k) => k,
            _ => 1,
        };
        let offset = u32::try_from(self.data.len())
            .map_err(|_| EngineError::ResourceExhausted("sparse data exceeds 4 GiB".into()))?;
        if self.data.len() + width > self.data.capacity() {
            let cap = self.data.capacity();
            reserve(&mut self.data, width.max(cap))?;
        }
        let n = width.min(bytes.len());
        self.data.extend_from_slice(&bytes[..n]);
        self.data.resize(self.data.len() + width - n, 0);
        Ok((offset, false))
    }

    /// 覆盖写不回收旧值占用的数据区
    pub(crate) fn upsert(&mut self, pos: Position, value: &Value) -> Result<()> {
        let (offset, is_null) = self.store(value)?;
        let entry = SparseEntry { position: pos, offset, is_null };
        match self.find(pos) {
            Ok(i) => self.entries[i] = entry,
            Err(i) => {
                if self.entries.len() == self.entries.capacity() {
                    let cap = self.entries.capacity();
                    reserve(&mut self.entries, cap.max(1))?;
                }
                self.entries.insert(i, entry);
            }
        }
        Ok(())
    }

    /// 写入默认值即删除条目
    pub(crate) fn remove(&mut self, pos: Position) {
        if let Ok(i) = self.find(pos) {
            self.entries.remove(i);
        }
    }

    pub(crate) fn mark_present(&mut self, pos: Position) {
        if let Some(bm) = self.bitmap.as_mut() {
            bm.insert(pos);
        }
    }

    /// 展开为 Plain：先预填默认值，再写入所有条目
    pub(crate) fn to_plain(&self, logical_size: u64, default: &Value) -> Result<PlainBody> {
        let mut plain = PlainBody::new(self.layout, logical_size, default, false)?;
        for e in &self.entries {
            plain.set(e.position, &self.entry_value(e)?)?;
        }
        Ok(plain.with_bitmap(self.bitmap.clone()))
    }

    pub fn packed_size(&self) -> usize {
        8 + 5 + 1 + 8 + 8
            + self.entries.len() * ENTRY_SIZE
            + self.data.len()
            + self.bitmap.as_ref().map_or(0, |b| b.packed_size())
    }

    pub fn pack<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_u64::<LittleEndian>(SPARSE_MAGIC)?;
        self.layout.write(out)?;
        out.write_u8(if self.bitmap.is_some() { FLAG_BITMAP } else { 0 })?;
        // 条目数与数据区长度紧贴条目数组之前
        out.write_u64::<LittleEndian>(self.entries.len() as u64)?;
        out.write_u64::<LittleEndian>(self.data.len() as u64)?;
        for e in &self.entries {
            out.write_u64::<LittleEndian>(e.position)?;
            out.write_u32::<LittleEndian>(e.offset)?;
            out.write_u8(e.is_null as u8)?;
        }
        out.write_all(&self.data)?;
        if let Some(bm) = &self.bitmap {
            bm.pack(out)?;
        }
        Ok(())
    }

    pub(crate) fn unpack<R: Read>(rd: &mut R, layout: SlotLayout, logical_size: u64) -> Result<Self> {
        SlotLayout::expect(rd, layout)?;
        let flags = rd.read_u8()?;
        let count = rd.read_u64::<LittleEndian>()?;
        let used  = rd.read_u64::<LittleEndian>()?;
        if count > logical_size {
            return Err(EngineError::Encoding(format!(
                "{count} sparse entries in a chunk of {logical_size} positions")));
        }

        let mut entries = Vec::new();
        reserve(&mut entries, to_usize(count)?)?;
        for _ in 0..count {
            let position = rd.read_u64::<LittleEndian>()?;
            let offset   = rd.read_u32::<LittleEndian>()?;
            let is_null  = rd.read_u8()? != 0;
            let ordered = entries.last().map_or(true, |p: &SparseEntry| p.position < position);
            if !ordered || position >= logical_size {
                return Err(EngineError::Encoding(format!(
                    "sparse entry at position {position} is out of order or range")));
            }
            entries.push(SparseEntry { position, offset, is_null });
        }
        let data = read_vec(rd, used)?;
        let bitmap = if flags & FLAG_BITMAP != 0 {
            Some(EmptyBitmap::unpack(rd, logical_size)?)
        } else {
            None
        };
        let body = Self { layout, entries, data, bitmap };
        for e in &body.entries {
            body.entry_value(e)?;
        }
        Ok(body)
    }
}

impl CellSource for SparseBody {
    fn value_at(&self, pos: Position) -> Result<Option<Value>> {
        self.get(pos)
    }

    fn next_non_default(&self, pos: Position) -> Option<Position> {
        let i = self.entries.partition_point(|e| e.position < pos);
        self.entries.get(i).map(|e| e.position)
    }

    fn bitmap(&self) -> Option<&EmptyBitmap> {
        self.bitmap.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkBody;

    #[test]
    fn ordered_upsert_and_remove() {
        let mut body = SparseBody::new(SlotLayout::Fixed(4), false, 0);
        body.upsert(50, &Value::from_i32(2)).unwrap();
        body.upsert(5, &Value::from_i32(1)).unwrap();
        body.upsert(99, &Value::missing(4).unwrap()).unwrap();
        body.upsert(50, &Value::from_i32(20)).unwrap();

        let positions: Vec<_> = body.entries().iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![5, 50, 99]);
        assert_eq!(body.get(50).unwrap(), Some(Value::from_i32(20)));
        assert_eq!(body.get(99).unwrap(), Some(Value::missing(4).unwrap()));
        assert_eq!(body.get(6).unwrap(), None);
        assert_eq!(body.next_non_default(6), Some(50));
        assert_eq!(body.next_non_default(100), None);

        body.remove(50);
        assert_eq!(body.len(), 2);
        assert_eq!(body.density(100), 0.02);
    }

    #[test]
    fn densify_to_plain() {
        let mut body = SparseBody::new(SlotLayout::Var, true, 4);
        body.upsert(1, &Value::from_text("x")).unwrap();
        body.mark_present(1);
        body.mark_present(2);
        let plain = body.to_plain(4, &Value::from_text("d")).unwrap();
        assert_eq!(plain.get(0).unwrap(), Value::from_text("d"));
        assert_eq!(plain.get(1).unwrap(), Value::from_text("x"));
        assert_eq!(plain.bitmap().map(|b| b.count()), Some(2));
    }

    #[test]
    fn densified_bool_null_keeps_reason() {
        let mut body = SparseBody::new(SlotLayout::Bit, false, 0);
        body.upsert(2, &Value::missing(116).unwrap()).unwrap();
        body.upsert(6, &Value::from_bool(true)).unwrap();
        assert_eq!(body.get(2).unwrap(), Some(Value::missing(116).unwrap()));

        let plain = body.to_plain(8, &Value::from_bool(false)).unwrap();
        assert_eq!(plain.get(2).unwrap(), Value::missing(116).unwrap());
        assert_eq!(plain.get(6).unwrap(), Value::from_bool(true));
        assert_eq!(plain.get(0).unwrap(), Value::from_bool(false));
    }

    #[test]
    fn pack_round_trip_and_validation() {
        let mut body = SparseBody::new(SlotLayout::Var, false, 0);
        body.upsert(3, &Value::from_text("three")).unwrap();
        body.upsert(7, &Value::null()).unwrap();
        let mut buf = Vec::new();
        body.pack(&mut buf).unwrap();
        assert_eq!(buf.len(), body.packed_size());

        let ChunkBody::Sparse(back) = ChunkBody::unpack(&buf, SlotLayout::Var, 10).unwrap() else {
            panic!("expected sparse body");
        };
        assert_eq!(back, body);
        assert!(ChunkBody::unpack(&buf, SlotLayout::Var, 5).is_err());
    }

    #[test]
    fn header_counts_precede_entries() {
        let mut body = SparseBody::new(SlotLayout::Fixed(2), false, 0);
        body.upsert(1, &Value::from_i16(5)).unwrap();
        body.upsert(4, &Value::from_i16(6)).unwrap();
        let mut buf = Vec::new();
        body.pack(&mut buf).unwrap();

        // magic(8) + layout(5) + flags(1)，随后是 entry_count 与 used_bytes
        let u64_at = |at: usize| u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
        assert_eq!(u64_at(0), SPARSE_MAGIC);
        assert_eq!(u64_at(14), 2);
        assert_eq!(u64_at(22), 4);
        // 首个条目的 position 紧随其后
        assert_eq!(u64_at(30), 1);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut body = SparseBody::new(SlotLayout::Var, false, 1);
        for pos in (0..300u64).rev() {
            body.upsert(pos, &Value::from_text(&"v".repeat(pos as usize % 7 + 1))).unwrap();
        }
        assert_eq!(body.len(), 300);
        assert!(body.entries().windows(2).all(|w| w[0].position < w[1].position));
        for pos in [0u64, 6, 150, 299] {
            assert_eq!(body.get(pos).unwrap(), Some(Value::from_text(&"v".repeat(pos as usize % 7 + 1))));
        }
    }
}
