//! Plain 编码：覆盖整个逻辑空间的定位数组
//!
//! ```text
//! ┌───────┬───────┬────────────┬──────────────┬──────────────┬───────────────┐
//! │ magic │ flags │ slot area  │ [null bits]  │ [reasons]    │ [empty bitmap]│
//! └───────┴───────┴────────────┴──────────────┴──────────────┴───────────────┘
//! ```
//! 可选段仅在 flags 对应位为 1 时出现。bool 槽只有 1 bit，
//! null 原因码另存在 reasons 段，每位置 1 字节。

use std::io::{Read, Write};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bitmap::EmptyBitmap;
use crate::common::{EngineError, Position, Result};
use crate::field_type::{MissingReason, Value};

use super::{read_vec, to_usize, CellSource, SlotArea, SlotLayout, PLAIN_MAGIC};

const FLAG_NULLS:   u8 = 0b001;
const FLAG_BITMAP:  u8 = 0b010;
const FLAG_REASONS: u8 = 0b100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainBody {
    slots:  SlotArea,
    /// 每位置 1 bit，首个 null 写入时才分配
    nulls:   Option<Vec<u8>>,
    /// bool 槽的 null 原因码，首个非 0 原因码写入时才分配
    reasons: Option<Vec<u8>>,
    bitmap:  Option<EmptyBitmap>,
}

impl PlainBody {
    pub(crate) fn new(layout: SlotLayout, n: u64, default: &Value, emptyable: bool) -> Result<Self> {
        let slots = SlotArea::filled(layout, n, default)?;
        let nulls = if default.is_null() {
            Some(vec![0xFF; to_usize((n + 7) / 8)?])
        } else {
            None
        };
        let mut body = Self { slots, nulls, reasons: None, bitmap: emptyable.then(EmptyBitmap::new) };
        if let Value::Missing(r) = default {
            if layout == SlotLayout::Bit && *r != MissingReason::DEFAULT {
                body.reasons = Some(vec![r.code(); to_usize(n)?]);
            }
        }
        Ok(body)
    }

    pub fn len(&self) -> u64 { self.slots.len() }
    pub fn is_empty(&self) -> bool { self.slots.is_empty() }
    pub fn has_nulls(&self) -> bool { self.nulls.is_some() }
    pub fn bitmap(&self) -> Option<&EmptyBitmap> { self.bitmap.as_ref() }

    fn is_null(&self, pos: Position) -> bool {
        self.nulls.as_ref().map_or(false, |bits| {
            let i = pos as usize;
            bits.get(i >> 3).map_or(false, |b| (b >> (i & 7)) & 1 == 1)
        })
    }

    fn set_null_bit(&mut self, pos: Position, null: bool) -> Result<()> {
        if self.nulls.is_none() {
            if !null { return Ok(()); }
            self.nulls = Some(vec![0; to_usize((self.len() + 7) / 8)?]);
        }
        if let Some(bits) = self.nulls.as_mut() {
            let i = to_usize(pos)?;
            let mask = 1u8 << (i & 7);
            if null { bits[i >> 3] |= mask } else { bits[i >> 3] &= !mask }
        }
        Ok(())
    }

    fn set_bit_reason(&mut self, pos: Position, reason: MissingReason) -> Result<()> {
        if self.reasons.is_none() {
            if reason == MissingReason::DEFAULT { return Ok(()); }
            self.reasons = Some(vec![0; to_usize(self.len())?]);
        }
        if let Some(codes) = self.reasons.as_mut() {
            codes[to_usize(pos)?] = reason.code();
        }
        Ok(())
    }

    fn null_reason(&self, pos: Position) -> Result<MissingReason> {
        match &self.reasons {
            Some(codes) => MissingReason::new(codes[to_usize(pos)?] as u32),
            None        => self.slots.reason(pos),
        }
    }

    pub(crate) fn set(&mut self, pos: Position, value: &Value) -> Result<()> {
        match value {
            Value::Missing(r) => {
                if pos >= self.len() {
                    return Err(EngineError::Encoding(format!("position {pos} outside plain body")));
                }
                self.set_null_bit(pos, true)?;
                if self.slots.layout() == SlotLayout::Bit {
                    self.set_bit_reason(pos, *r)?;
                } else {
                    self.slots.set_reason(pos, *r);
                }
            }
            Value::Data(bytes) => {
                self.slots.set(pos, bytes)?;
                self.set_null_bit(pos, false)?;
            }
        }
        Ok(())
    }

    pub(crate) fn with_bitmap(mut self, bitmap: Option<EmptyBitmap>) -> Self {
        self.bitmap = bitmap; self
    }

    pub(crate) fn mark_present(&mut self, pos: Position) {
        if let Some(bm) = self.bitmap.as_mut() {
            bm.insert(pos);
        }
    }

    pub fn get(&self, pos: Position) -> Result<Value> {
        if self.is_null(pos) {
            Ok(Value::Missing(self.null_reason(pos)?))
        } else {
            Ok(Value::Data(self.slots.get(pos)?))
        }
    }

    pub fn packed_size(&self) -> usize {
        8 + 1
            + self.slots.packed_size()
            + self.nulls.as_ref().map_or(0, |b| b.len())
            + self.reasons.as_ref().map_or(0, |r| r.len())
            + self.bitmap.as_ref().map_or(0, |b| b.packed_size())
    }

    pub fn pack<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut flags = 0u8;
        if self.nulls.is_some()   { flags |= FLAG_NULLS; }
        if self.reasons.is_some() { flags |= FLAG_REASONS; }
        if self.bitmap.is_some()  { flags |= FLAG_BITMAP; }
        out.write_u64::<LittleEndian>(PLAIN_MAGIC)?;
        out.write_u8(flags)?;
        self.slots.pack(out)?;
        if let Some(bits) = &self.nulls {
            out.write_all(bits)?;
        }
        if let Some(codes) = &self.reasons {
            out.write_all(codes)?;
        }
        if let Some(bm) = &self.bitmap {
            bm.pack(out)?;
        }
        Ok(())
    }

    /// magic 已由调用方读取
    pub(crate) fn unpack<R: Read>(rd: &mut R, layout: SlotLayout, logical_size: u64) -> Result<Self> {
        let flags = rd.read_u8()?;
        let slots = SlotArea::unpack(rd, layout)?;
        if slots.len() != logical_size {
            return Err(EngineError::Encoding(format!(
                "plain body has {} slots, chunk has {logical_size} positions", slots.len())));
        }
        let nulls = if flags & FLAG_NULLS != 0 {
            Some(read_vec(rd, (logical_size + 7) / 8)?)
        } else {
            None
        };
        let reasons = if flags & FLAG_REASONS != 0 {
            if layout != SlotLayout::Bit {
                return Err(EngineError::Encoding("reason codes outside a bool plain body".into()));
            }
            let codes = read_vec(rd, logical_size)?;
            for &c in &codes {
                MissingReason::new(c as u32)?;
            }
            Some(codes)
        } else {
            None
        };
        let bitmap = if flags & FLAG_BITMAP != 0 {
            Some(EmptyBitmap::unpack(rd, logical_size)?)
        } else {
            None
        };
        Ok(Self { slots, nulls, reasons, bitmap })
    }
}

impl CellSource for PlainBody {
    fn value_at(&self, pos: Position) -> Result<Option<Value>> {
        self.get(pos).map(Some)
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
    fn prefilled_default_and_nulls() {
        let mut body = PlainBody::new(SlotLayout::Fixed(8), 6, &Value::from_i64(42), false).unwrap();
        assert!(!body.has_nulls());
        body.set(2, &Value::from_i64(-7)).unwrap();
        body.set(4, &Value::missing(3).unwrap()).unwrap();
        assert!(body.has_nulls());
        assert_eq!(body.get(0).unwrap(), Value::from_i64(42));
        assert_eq!(body.get(2).unwrap(), Value::from_i64(-7));
        assert_eq!(body.get(4).unwrap(), Value::missing(3).unwrap());

        body.set(4, &Value::from_i64(1)).unwrap();
        assert_eq!(body.get(4).unwrap(), Value::from_i64(1));
    }

    #[test]
    fn bool_null_keeps_reason() {
        let mut body = PlainBody::new(SlotLayout::Bit, 20, &Value::from_bool(false), false).unwrap();
        body.set(17, &Value::from_bool(true)).unwrap();
        body.set(5, &Value::null()).unwrap();
        let mut buf = Vec::new();
        body.pack(&mut buf).unwrap();
        assert_eq!(buf[8] & FLAG_REASONS, 0);

        body.set(3, &Value::missing(9).unwrap()).unwrap();
        assert_eq!(body.get(17).unwrap(), Value::from_bool(true));
        assert_eq!(body.get(5).unwrap(), Value::null());
        assert_eq!(body.get(3).unwrap(), Value::missing(9).unwrap());

        buf.clear();
        body.pack(&mut buf).unwrap();
        assert_eq!(buf.len(), body.packed_size());
        let ChunkBody::Plain(back) = ChunkBody::unpack(&buf, SlotLayout::Bit, 20).unwrap() else {
            panic!("expected plain body");
        };
        assert_eq!(back.get(3).unwrap(), Value::missing(9).unwrap());
        assert_eq!(back.get(4).unwrap(), Value::from_bool(false));
    }

    #[test]
    fn var_values_and_packing() {
        let mut body = PlainBody::new(SlotLayout::Var, 4, &Value::from_text(""), true).unwrap();
        body.set(1, &Value::from_text("alpha")).unwrap();
        body.mark_present(1);
        body.set(3, &Value::null()).unwrap();
        body.mark_present(3);

        let mut buf = Vec::new();
        body.pack(&mut buf).unwrap();
        assert_eq!(buf.len(), body.packed_size());

        let back = ChunkBody::unpack(&buf, SlotLayout::Var, 4).unwrap();
        let ChunkBody::Plain(back) = back else { panic!("expected plain body") };
        assert_eq!(back, body);
        assert_eq!(back.get(1).unwrap(), Value::from_text("alpha"));
        assert!(back.get(3).unwrap().is_null());
        assert_eq!(back.bitmap().map(|b| b.count()), Some(2));

        assert!(ChunkBody::unpack(&buf, SlotLayout::Var, 5).is_err());
        assert!(ChunkBody::unpack(&buf, SlotLayout::Fixed(4), 4).is_err());
    }
}
