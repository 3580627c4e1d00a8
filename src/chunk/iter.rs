//! 只读游标
//!
//! 三种编码共用同一个 [`ChunkIter`]，差异只在 [`CellSource`]。
//! 候选位置先用 empty bitmap / 非默认条目跳跃，再逐个过滤：
//!
//! ```text
//!   candidate ─► 可寻址? ─► 核心区? ─► 非 null? ─► 非默认? ─► 输出
//!                             (IGNORE_OVERLAPS)  (IGNORE_NULLS) (IGNORE_DEFAULT_VALUES)
//! ```

use bitflags::bitflags;
use tracing::warn;

use crate::common::{Coordinate, Coordinates, EngineError, Position, Result};
use crate::field_type::Value;

use super::{CellSource, Chunk};

bitflags! {
    /// 迭代器模式位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IterationMode: u32 {
        /// 在已 flush 的 chunk 上续写
        const APPEND_EXISTING       = 0b0000_0001;

        /// 写入位置必须严格递增
        const SEQUENTIAL_WRITE      = 0b0000_0010;

        /// 允许 next_tile 批量解码
        const TILE_MODE             = 0b0000_0100;

        const IGNORE_OVERLAPS       = 0b0000_1000;
        const IGNORE_NULLS          = 0b0001_0000;
        const IGNORE_EMPTY_CELLS    = 0b0010_0000;

        /// 跳过等于属性默认值的单元
        const IGNORE_DEFAULT_VALUES = 0b0100_0000;
    }
}

/// 一批解码后的单元
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tile {
    pub positions: Vec<Position>,
    pub values:    Vec<Value>,
}

impl Tile {
    pub fn len(&self) -> usize { self.positions.len() }
    pub fn is_empty(&self) -> bool { self.positions.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (Position, &Value)> + '_ {
        self.positions.iter().copied().zip(self.values.iter())
    }
}

pub trait ConstChunkIterator {
    fn mode(&self) -> IterationMode;
    fn chunk(&self) -> &Chunk;
    fn is_end(&self) -> bool;
    /// 当前逻辑位置；未定位时为 None
    fn position(&self) -> Option<Position>;
    fn coordinates(&self) -> Result<Coordinates>;
    fn current(&self) -> Result<Value>;
    /// 前进到下一个未被过滤的位置
    fn advance(&mut self) -> Result<()>;
    /// 定位到 `coords`；越界或被过滤时返回 Ok(false) 并失去当前位置，解码失败返回 Err
    fn try_seek(&mut self, coords: &[Coordinate]) -> Result<bool>;
    /// [`try_seek`](Self::try_seek) 的布尔形式；解码失败记 WARN 并视为未命中
    fn seek(&mut self, coords: &[Coordinate]) -> bool {
        match self.try_seek(coords) {
            Ok(found) => found,
            Err(e) => {
                warn!(chunk = %self.chunk().descriptor(), ?coords, error = %e, "seek failed to decode cell");
                false
            }
        }
    }
    /// 回到第一个未被过滤的位置
    fn reset(&mut self) -> Result<()>;
    /// 从当前位置起解码至多 `max` 个单元并前进；需要 `TILE_MODE`
    fn next_tile(&mut self, max: usize) -> Result<Option<Tile>>;
}

pub struct ChunkIter<'a, S> {
    chunk:   &'a Chunk,
    cells:   &'a S,
    mode:    IterationMode,
    current: Option<(Position, Value)>,
}

impl<'a, S: CellSource> ChunkIter<'a, S> {
    pub(crate) fn new(chunk: &'a Chunk, cells: &'a S, mode: IterationMode) -> Result<Self> {
        let mut it = Self { chunk, cells, mode, current: None };
        it.reset()?;
        Ok(it)
    }

    fn skip_empty(&self) -> bool { self.mode.contains(IterationMode::IGNORE_EMPTY_CELLS) }
    fn skip_default(&self) -> bool { self.mode.contains(IterationMode::IGNORE_DEFAULT_VALUES) }

    /// `>= p` 的第一个候选位置
    fn next_candidate(&self, mut p: Position) -> Option<Position> {
        let bitmap = self.cells.bitmap().filter(|_| self.skip_empty());
        loop {
            if p >= self.chunk.mapper().logical_size() {
                return None;
            }
            let mut q = p;
            if let Some(bm) = bitmap {
                q = bm.next_present(q)?;
            }
            if self.skip_default() {
                q = self.cells.next_non_default(q)?;
            }
            if q == p {
                return Some(p);
            }
            p = q;
        }
    }

    /// 位置通过全部过滤时返回其值
    fn accept(&self, pos: Position) -> Result<Option<Value>> {
        let mapper = self.chunk.mapper();
        if !mapper.contains_pos(pos) {
            return Ok(None);
        }
        if self.mode.contains(IterationMode::IGNORE_OVERLAPS) && !mapper.in_core(pos) {
            return Ok(None);
        }
        let present = self.cells.bitmap().map_or(true, |bm| bm.contains(pos));
        if !present && self.skip_empty() {
            return Ok(None);
        }
        let stored = if present { self.cells.value_at(pos)? } else { None };
        let value = stored.unwrap_or_else(|| self.chunk.default_value().clone());
        if value.is_null() && self.mode.contains(IterationMode::IGNORE_NULLS) {
            return Ok(None);
        }
        if self.skip_default() && &value == self.chunk.default_value() {
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn scan(&self, mut p: Position) -> Result<Option<(Position, Value)>> {
        while let Some(c) = self.next_candidate(p) {
            if let Some(v) = self.accept(c)? {
                return Ok(Some((c, v)));
            }
            p = c + 1;
        }
        Ok(None)
    }
}

impl<'a, S: CellSource> ConstChunkIterator for ChunkIter<'a, S> {
    fn mode(&self) -> IterationMode { self.mode }
    fn chunk(&self) -> &Chunk { self.chunk }
    fn is_end(&self) -> bool { self.current.is_none() }
    fn position(&self) -> Option<Position> { self.current.as_ref().map(|(p, _)| *p) }

    fn coordinates(&self) -> Result<Coordinates> {
        let pos = self.position().ok_or(EngineError::NoCurrentElement)?;
        Ok(self.chunk.mapper().coords_of(pos))
    }

    fn current(&self) -> Result<Value> {
        self.current.as_ref()
            .map(|(_, v)| v.clone())
            .ok_or(EngineError::NoCurrentElement)
    }

    fn advance(&mut self) -> Result<()> {
        let pos = self.position().ok_or(EngineError::NoCurrentElement)?;
        self.current = self.scan(pos + 1)?;
        Ok(())
    }

    fn try_seek(&mut self, coords: &[Coordinate]) -> Result<bool> {
        self.current = None;
        let Some(pos) = self.chunk.mapper().coords_to_pos(coords) else { return Ok(false) };
        self.current = self.accept(pos)?.map(|v| (pos, v));
        Ok(self.current.is_some())
    }

    fn reset(&mut self) -> Result<()> {
        self.current = self.scan(0)?;
        Ok(())
    }

    fn next_tile(&mut self, max: usize) -> Result<Option<Tile>> {
        if !self.mode.contains(IterationMode::TILE_MODE) {
            return Err(EngineError::TileModeDisabled);
        }
        if self.is_end() {
            return Ok(None);
        }
        let mut tile = Tile::default();
        while tile.len() < max.max(1) {
            let Some((pos, value)) = self.current.take() else { break };
            tile.positions.push(pos);
            tile.values.push(value);
            self.current = self.scan(pos + 1)?;
        }
        Ok(Some(tile))
    }
}

/// 以 `(coords, value)` 形式遍历的适配器；遇错产出一次 Err 后结束
pub struct Cells<'a> {
    inner: Box<dyn ConstChunkIterator + 'a>,
    done:  bool,
}

impl<'a> Cells<'a> {
    pub(crate) fn new(inner: Box<dyn ConstChunkIterator + 'a>) -> Self {
        Self { inner, done: false }
    }
}

impl Cells<'_> {
    fn step(&mut self) -> Result<(Coordinates, Value)> {
        let coords = self.inner.coordinates()?;
        let value  = self.inner.current()?;
        self.inner.advance()?;
        Ok((coords, value))
    }
}

impl Iterator for Cells<'_> {
    type Item = Result<(Coordinates, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.inner.is_end() {
            return None;
        }
        let item = self.step();
        self.done = item.is_err();
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::chunk::EncodingKind;
    use crate::field_type::{AttributeDesc, FieldType};
    use crate::meta::{ArrayDesc, DimensionDesc};

    fn chunk(kind: EncodingKind, emptyable: bool) -> Chunk {
        let mut array = ArrayDesc::new(
            "A",
            vec![DimensionDesc::new("i", 0, 7, 4).with_overlap(1)],
            vec![AttributeDesc::new(0, "v", FieldType::Int32).nullable()],
        );
        if emptyable {
            array = array.emptyable();
        }
        let desc = array.chunk_descriptor(0, &[4]).unwrap();
        let mut c = Chunk::new(desc, array.attributes[0].clone(), emptyable, kind).unwrap();
        let cfg = EngineConfig::default();
        let mut w = c.writer(IterationMode::empty(), &cfg).unwrap();
        // 逻辑空间 [3, 8]，8 超出 end_max
        w.write_at(&[3], Value::from_i32(30)).unwrap();
        w.write_at(&[5], Value::null()).unwrap();
        w.write_at(&[6], Value::from_i32(60)).unwrap();
        w.flush().unwrap();
        c
    }

    #[test]
    fn filters_compose() {
        for kind in [EncodingKind::Plain, EncodingKind::Sparse, EncodingKind::Rle] {
            let c = chunk(kind, true);
            let all: Vec<_> = c.cells(IterationMode::IGNORE_EMPTY_CELLS).unwrap()
                .map(|r| r.unwrap().0[0])
                .collect();
            assert_eq!(all, vec![3, 5, 6], "{kind:?}");

            let core: Vec<_> = c.cells(IterationMode::IGNORE_EMPTY_CELLS | IterationMode::IGNORE_OVERLAPS)
                .unwrap()
                .map(|r| r.unwrap().0[0])
                .collect();
            assert_eq!(core, vec![5, 6], "{kind:?}");

            let no_nulls: Vec<_> = c.cells(IterationMode::IGNORE_EMPTY_CELLS | IterationMode::IGNORE_NULLS)
                .unwrap()
                .map(|r| r.unwrap().1)
                .collect();
            assert_eq!(no_nulls, vec![Value::from_i32(30), Value::from_i32(60)], "{kind:?}");
        }
    }

    #[test]
    fn empty_cells_read_as_default() {
        let c = chunk(EncodingKind::Sparse, true);
        let it = c.const_iterator(IterationMode::empty()).unwrap();
        assert_eq!(it.coordinates().unwrap(), vec![3]);
        let values: Vec<_> = c.cells(IterationMode::empty()).unwrap()
            .map(|r| r.unwrap())
            .collect();
        // 8 不可寻址
        assert_eq!(values.len(), 5);
        assert_eq!(values[1], (vec![4], Value::from_i32(0)));
    }

    #[test]
    fn seek_and_current() {
        let c = chunk(EncodingKind::Plain, false);
        let mut it = c.const_iterator(IterationMode::IGNORE_NULLS).unwrap();
        assert!(it.seek(&[6]));
        assert_eq!(it.current().unwrap(), Value::from_i32(60));
        assert!(!it.seek(&[5]));
        assert!(matches!(it.current(), Err(EngineError::NoCurrentElement)));
        assert!(matches!(it.advance(), Err(EngineError::NoCurrentElement)));
        assert!(!it.seek(&[8]));
        it.reset().unwrap();
        assert_eq!(it.position(), Some(0));
    }

    /// 每次读取都失败的单元来源，模拟损坏的 body
    struct Corrupt;

    impl CellSource for Corrupt {
        fn value_at(&self, pos: Position) -> Result<Option<Value>> {
            Err(EngineError::Encoding(format!("corrupt cell at {pos}")))
        }
        fn bitmap(&self) -> Option<&crate::bitmap::EmptyBitmap> { None }
    }

    #[test]
    fn seek_surfaces_decode_errors() {
        let c = chunk(EncodingKind::Plain, false);
        let mut it = ChunkIter { chunk: &c, cells: &Corrupt, mode: IterationMode::empty(), current: None };
        assert!(matches!(it.try_seek(&[6]), Err(EngineError::Encoding(_))));
        assert!(it.is_end());
        assert!(!it.seek(&[6]));
        // 越界不触发读取
        assert!(!it.try_seek(&[8]).unwrap());

        let mut ok = c.const_iterator(IterationMode::empty()).unwrap();
        assert!(ok.try_seek(&[6]).unwrap());
        assert_eq!(ok.current().unwrap(), Value::from_i32(60));
    }

    #[test]
    fn tiles_require_mode() {
        let c = chunk(EncodingKind::Rle, false);
        let mut plain = c.const_iterator(IterationMode::empty()).unwrap();
        assert!(matches!(plain.next_tile(2), Err(EngineError::TileModeDisabled)));

        let mut it = c.const_iterator(IterationMode::TILE_MODE).unwrap();
        let first = it.next_tile(3).unwrap().unwrap();
        assert_eq!(first.positions, vec![0, 1, 2]);
        let second = it.next_tile(3).unwrap().unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second.iter().next().map(|(_, v)| v.clone()), Some(Value::from_i32(60)));
        // 未写入的可寻址位置以默认值填充
        assert_eq!(second.values[1], Value::from_i32(0));
        assert!(it.next_tile(3).unwrap().is_none());
    }
}
