//! Empty bitmap：记录 chunk 中哪些逻辑位置存在值
//!
//! 以有序、互不重叠的 run 列表表示：
//! ```text
//! ┌──────────────┬──────────┬──────────────┐
//! │ l_position   │ length   │ p_position   │   × n_segments
//! └──────────────┴──────────┴──────────────┘
//! ```
//! `p_position` 是该 run 第一个单元在物理值序列中的序号，
//! 因此逻辑位置 `pos` 的物理下标 = `p_position + (pos - l_position)`。

use std::io::{Cursor, Read, Write};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crate::common::{EngineError, Position, Result};

pub const BITMAP_MAGIC: u64 = 0xEEEE_AAAA_0000_EEEE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapSegment {
    pub l_position: Position,
    pub length:     u64,
    pub p_position: u64,
}

impl BitmapSegment {
    fn end(&self) -> Position { self.l_position + self.length }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmptyBitmap {
    segments: Vec<BitmapSegment>,
    count:    u64,
}

impl EmptyBitmap {
    pub fn new() -> Self { Self::default() }

    /// 由 run 列表构造并校验不变式（有序、不重叠、不越过逻辑空间）
    pub fn from_runs(runs: &[(Position, u64)], logical_size: u64) -> Result<Self> {
        let mut bm = Self::new();
        for &(start, len) in runs {
            if len == 0 { continue; }
            if start.checked_add(len).map_or(true, |end| end > logical_size) {
                return Err(EngineError::Encoding(format!(
                    "bitmap run [{start}, +{len}) exceeds logical size {logical_size}")));
            }
            bm.append_run(start, len)?;
        }
        Ok(bm)
    }

    pub fn segments(&self) -> &[BitmapSegment] { &self.segments }
    pub fn n_segments(&self) -> usize { self.segments.len() }

    /// 存在值的单元数
    pub fn count(&self) -> u64 { self.count }
    pub fn is_empty(&self) -> bool { self.count == 0 }

    pub fn last_position(&self) -> Option<Position> {
        self.segments.last().map(|s| s.end() - 1)
    }

    /// 第一个 `end > pos` 的 run 的下标（二分）
    pub fn find_segment(&self, pos: Position) -> usize {
        self.segments.partition_point(|s| s.end() <= pos)
    }

    pub fn contains(&self, pos: Position) -> bool {
        let r = self.find_segment(pos);
        r < self.segments.len() && self.segments[r].l_position <= pos
    }

    /// 逻辑位置 → 物理下标；位置为空时返回 None
    pub fn value_index(&self, pos: Position) -> Option<u64> {
        let r = self.find_segment(pos);
        let seg = self.segments.get(r)?;
        (seg.l_position <= pos).then(|| seg.p_position + pos - seg.l_position)
    }

    /// `>= pos` 的第一个存在位置
    pub fn next_present(&self, pos: Position) -> Option<Position> {
        let seg = self.segments.get(self.find_segment(pos))?;
        Some(pos.max(seg.l_position))
    }

    /// 顺序追加一个位置，必须大于已有的最大位置
    pub fn append(&mut self, pos: Position) -> Result<()> {
        self.append_run(pos, 1)
    }

    pub fn append_run(&mut self, pos: Position, len: u64) -> Result<()> {
        if len == 0 { return Ok(()); }
        match self.segments.last_mut() {
            Some(last) if last.end() > pos => {
                return Err(EngineError::NotSequential { prev: last.end() - 1, next: pos });
            }
            Some(last) if last.end() == pos => last.length += len,
            _ => self.segments.push(BitmapSegment {
                l_position: pos, length: len, p_position: self.count,
            }),
        }
        self.count += len;
        Ok(())
    }

    /// 任意顺序插入；返回是否为新位置。后续 run 的 p_position 顺移。
    pub fn insert(&mut self, pos: Position) -> bool {
        if self.last_position().map_or(true, |last| pos > last) {
            // 顺序追加不会失败
            let _ = self.append(pos);
            return true;
        }
        let r = self.find_segment(pos);
        if self.segments[r].l_position <= pos {
            return false;
        }
        let joins_prev = r > 0 && self.segments[r - 1].end() == pos;
        let joins_next = self.segments[r].l_position == pos + 1;
        match (joins_prev, joins_next) {
            (true, true) => {
                let next = self.segments.remove(r);
                self.segments[r - 1].length += 1 + next.length;
            }
            (true, false) => self.segments[r - 1].length += 1,
            (false, true) => {
                self.segments[r].l_position -= 1;
                self.segments[r].length += 1;
            }
            (false, false) => {
                let p = self.segments[r].p_position;
                self.segments.insert(r, BitmapSegment { l_position: pos, length: 1, p_position: p });
            }
        }
        self.count += 1;
        self.renumber_from(r.saturating_sub(1));
        true
    }

    fn renumber_from(&mut self, from: usize) {
        let mut p = if from == 0 {
            0
        } else {
            let prev = &self.segments[from - 1];
            prev.p_position + prev.length
        };
        for seg in &mut self.segments[from..] {
            seg.p_position = p;
            p += seg.length;
        }
    }

    /// 按升序遍历所有存在位置
    pub fn iter(&self) -> impl Iterator<Item = Position> + '_ {
        self.segments.iter().flat_map(|s| s.l_position..s.end())
    }

    /// 两个 bitmap 的并集
    pub fn union(&self, other: &EmptyBitmap) -> EmptyBitmap {
        let mut runs: Vec<(Position, u64)> = self.segments.iter()
            .chain(other.segments.iter())
            .map(|s| (s.l_position, s.end()))
            .collect();
        runs.sort_unstable();

        let mut out = EmptyBitmap::new();
        let mut cur: Option<(Position, Position)> = None;
        for (start, end) in runs {
            cur = match cur {
                Some((s, e)) if start <= e => Some((s, e.max(end))),
                Some((s, e)) => {
                    let _ = out.append_run(s, e - s);
                    Some((start, end))
                }
                None => Some((start, end)),
            };
        }
        if let Some((s, e)) = cur {
            let _ = out.append_run(s, e - s);
        }
        out
    }

    // ── 打包 ──────────────────────────────────────────────────────────────────

    pub fn packed_size(&self) -> usize {
        24 + self.segments.len() * 24
    }

    pub fn pack<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_u64::<LittleEndian>(BITMAP_MAGIC)?;
        out.write_u64::<LittleEndian>(self.segments.len() as u64)?;
        out.write_u64::<LittleEndian>(self.count)?;
        for s in &self.segments {
            out.write_u64::<LittleEndian>(s.l_position)?;
            out.write_u64::<LittleEndian>(s.length)?;
            out.write_u64::<LittleEndian>(s.p_position)?;
        }
        Ok(())
    }

    pub fn unpack<R: Read>(rd: &mut R, logical_size: u64) -> Result<Self> {
        if rd.read_u64::<LittleEndian>()? != BITMAP_MAGIC {
            return Err(EngineError::Encoding("bad empty bitmap magic".into()));
        }
        let n     = rd.read_u64::<LittleEndian>()?;
        let count = rd.read_u64::<LittleEndian>()?;
        let mut runs = Vec::new();
        for _ in 0..n {
            let l = rd.read_u64::<LittleEndian>()?;
            let len = rd.read_u64::<LittleEndian>()?;
            let _p = rd.read_u64::<LittleEndian>()?;
            runs.push((l, len));
        }
        let bm = Self::from_runs(&runs, logical_size)?;
        if bm.count != count {
            return Err(EngineError::Encoding(format!(
                "bitmap count {} does not match header {count}", bm.count)));
        }
        Ok(bm)
    }

    pub fn from_bytes(data: &[u8], logical_size: u64) -> Result<Self> {
        Self::unpack(&mut Cursor::new(data), logical_size)
    }
}

impl FromIterator<Position> for EmptyBitmap {
    /// 任意顺序的位置集合
    fn from_iter<I: IntoIterator<Item = Position>>(iter: I) -> Self {
        let mut bm = EmptyBitmap::new();
        for pos in iter {
            bm.insert(pos);
        }
        bm
    }
}
