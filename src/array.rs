//! MemArray：拥有 chunk 的内存数组
//!
//! chunk 存放在 slot 表中，对外只暴露 [`ChunkHandle`]（slot 下标）；
//! 迭代器借用 chunk，生命周期由数组管理。目录按 (attribute, 坐标) 有序，
//! 因此同一属性的 chunk 按行主序枚举。

use std::collections::BTreeMap;
use tracing::trace;

use crate::chunk::{Chunk, ChunkWriter, ConstChunkIterator, EncodingKind, IterationMode, Tile};
use crate::common::{coords_to_string, AttributeId, Coordinate, Coordinates, EngineError, Result};
use crate::config::EngineConfig;
use crate::meta::ArrayDesc;

/// 目录键：属性 + chunk 起点
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkAddress {
    pub attribute: AttributeId,
    pub coords:    Coordinates,
}

impl std::fmt::Display for ChunkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "attr={} {}", self.attribute, coords_to_string(&self.coords))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHandle(usize);

impl ChunkHandle {
    pub fn index(self) -> usize { self.0 }
}

pub struct MemArray {
    desc:   ArrayDesc,
    config: EngineConfig,
    slots:  Vec<Option<Chunk>>,
    free:   Vec<usize>,
    index:  BTreeMap<ChunkAddress, ChunkHandle>,
}

impl MemArray {
    pub fn new(desc: ArrayDesc, config: EngineConfig) -> Self {
        Self { desc, config, slots: Vec::new(), free: Vec::new(), index: BTreeMap::new() }
    }

    pub fn desc(&self) -> &ArrayDesc { &self.desc }
    pub fn config(&self) -> &EngineConfig { &self.config }
    pub fn len(&self) -> usize { self.index.len() }
    pub fn is_empty(&self) -> bool { self.index.is_empty() }

    /// 为 `coords` 所在的 chunk 分配一个空 chunk
    pub fn create_chunk(
        &mut self,
        attribute: AttributeId,
        coords:    &[Coordinate],
        encoding:  EncodingKind,
    ) -> Result<ChunkHandle> {
        let desc = self.desc.chunk_descriptor(attribute, coords)?;
        let attr = self.desc.attribute(attribute)?.clone();
        let chunk = Chunk::new(desc, attr, self.desc.emptyable, encoding)?;
        self.insert(chunk)
    }

    /// 收下一个外部构造（或经线上解码）的 chunk
    pub fn insert(&mut self, chunk: Chunk) -> Result<ChunkHandle> {
        let d = chunk.descriptor();
        if d.dimensions != self.desc.dimensions || chunk.is_emptyable() != self.desc.emptyable {
            return Err(EngineError::SchemaMismatch(format!(
                "chunk {d} does not belong to array '{}'", self.desc.name)));
        }
        if self.desc.attribute(d.attribute)? != chunk.attribute() {
            return Err(EngineError::SchemaMismatch(format!(
                "attribute {} of chunk {d} differs from array '{}'", d.attribute, self.desc.name)));
        }
        let addr = ChunkAddress { attribute: d.attribute, coords: d.first_position.clone() };
        if self.index.contains_key(&addr) {
            return Err(EngineError::ChunkExists(addr.to_string()));
        }

        let handle = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(chunk);
                ChunkHandle(i)
            }
            None => {
                self.slots.push(Some(chunk));
                ChunkHandle(self.slots.len() - 1)
            }
        };
        trace!(array = %self.desc.name, chunk = %addr, slot = handle.0, "chunk registered");
        self.index.insert(addr, handle);
        Ok(handle)
    }

    /// 任意单元坐标所在 chunk 的句柄
    pub fn handle_of(&self, attribute: AttributeId, coords: &[Coordinate]) -> Option<ChunkHandle> {
        let origin = self.desc.chunk_origin(coords).ok()?;
        self.index.get(&ChunkAddress { attribute, coords: origin }).copied()
    }

    pub fn chunk(&self, h: ChunkHandle) -> Result<&Chunk> {
        self.slots.get(h.0)
            .and_then(|s| s.as_ref())
            .ok_or(EngineError::ChunkNotFound(h.0))
    }

    pub fn chunk_mut(&mut self, h: ChunkHandle) -> Result<&mut Chunk> {
        self.slots.get_mut(h.0)
            .and_then(|s| s.as_mut())
            .ok_or(EngineError::ChunkNotFound(h.0))
    }

    pub fn writer(&mut self, h: ChunkHandle, mode: IterationMode) -> Result<ChunkWriter<'_>> {
        let chunk = self.slots.get_mut(h.0)
            .and_then(|s| s.as_mut())
            .ok_or(EngineError::ChunkNotFound(h.0))?;
        chunk.writer(mode, &self.config)
    }

    pub fn iterator(&self, h: ChunkHandle, mode: IterationMode) -> Result<Box<dyn ConstChunkIterator + '_>> {
        self.chunk(h)?.const_iterator(mode)
    }

    /// 以配置的 `tile_size` 分批解码整个 chunk
    pub fn tiles(&self, h: ChunkHandle, mode: IterationMode) -> Result<Vec<Tile>> {
        let chunk = self.chunk(h)?;
        let _pin = chunk.pin();
        let mut it = chunk.const_iterator(mode | IterationMode::TILE_MODE)?;
        let mut out = Vec::new();
        while let Some(tile) = it.next_tile(self.config.tile_size)? {
            out.push(tile);
        }
        Ok(out)
    }

    /// 移除并交还 chunk；被 pin 的 chunk 不可移除
    pub fn remove(&mut self, h: ChunkHandle) -> Result<Chunk> {
        let chunk = self.chunk(h)?;
        if chunk.is_pinned() {
            return Err(EngineError::ChunkPinned(chunk.descriptor().to_string()));
        }
        let d = chunk.descriptor();
        let addr = ChunkAddress { attribute: d.attribute, coords: d.first_position.clone() };
        self.index.remove(&addr);
        self.free.push(h.0);
        self.slots[h.0].take().ok_or(EngineError::ChunkNotFound(h.0))
    }

    /// 属性的全部 chunk，按起点行主序
    pub fn chunks(&self, attribute: AttributeId) -> impl Iterator<Item = (ChunkHandle, &Chunk)> + '_ {
        self.index.iter()
            .filter(move |(addr, _)| addr.attribute == attribute)
            .filter_map(move |(_, &h)| self.slots.get(h.0)?.as_ref().map(|c| (h, c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_type::{AttributeDesc, FieldType, Value};
    use crate::meta::DimensionDesc;

    fn mem_array() -> MemArray {
        MemArray::new(
            ArrayDesc::new(
                "M",
                vec![DimensionDesc::new("x", 0, 29, 10), DimensionDesc::new("y", 0, 9, 5)],
                vec![
                    AttributeDesc::new(0, "a", FieldType::Int32),
                    AttributeDesc::new(1, "b", FieldType::Float64),
                ],
            ),
            EngineConfig::default(),
        )
    }

    #[test]
    fn create_lookup_and_enumerate() {
        let mut arr = mem_array();
        let h2 = arr.create_chunk(0, &[25, 7], EncodingKind::Plain).unwrap();
        let h1 = arr.create_chunk(0, &[3, 1], EncodingKind::Sparse).unwrap();
        arr.create_chunk(1, &[3, 1], EncodingKind::Rle).unwrap();
        assert!(matches!(arr.create_chunk(0, &[9, 4], EncodingKind::Plain), Err(EngineError::ChunkExists(_))));

        assert_eq!(arr.handle_of(0, &[8, 0]), Some(h1));
        assert_eq!(arr.handle_of(0, &[15, 0]), None);
        let order: Vec<_> = arr.chunks(0).map(|(h, c)| (h, c.first_position(false))).collect();
        assert_eq!(order, vec![(h1, vec![0, 0]), (h2, vec![20, 5])]);
        assert_eq!(arr.len(), 3);
    }

    #[test]
    fn write_then_read_through_handles() {
        let mut arr = mem_array();
        let h = arr.create_chunk(1, &[0, 0], EncodingKind::Sparse).unwrap();
        let mut w = arr.writer(h, IterationMode::empty()).unwrap();
        w.write_at(&[4, 4], Value::from_f64(2.5)).unwrap();
        w.flush().unwrap();

        let mut it = arr.iterator(h, IterationMode::IGNORE_DEFAULT_VALUES).unwrap();
        assert_eq!(it.coordinates().unwrap(), vec![4, 4]);
        assert_eq!(it.current().unwrap().as_f64(), Some(2.5));
        it.advance().unwrap();
        assert!(it.is_end());
    }

    #[test]
    fn tiles_follow_configured_size() {
        let mut arr = MemArray::new(mem_array().desc().clone(), EngineConfig::default().with_tile_size(3));
        let h = arr.create_chunk(0, &[0, 0], EncodingKind::Rle).unwrap();
        let mut w = arr.writer(h, IterationMode::SEQUENTIAL_WRITE).unwrap();
        for x in 0..7 {
            w.write_at(&[x, 1], Value::from_i32(x as i32 + 1)).unwrap();
        }
        w.flush().unwrap();

        let tiles = arr.tiles(h, IterationMode::IGNORE_DEFAULT_VALUES).unwrap();
        assert_eq!(tiles.iter().map(Tile::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        assert_eq!(tiles[2].values, vec![Value::from_i32(7)]);
        assert!(!arr.chunk(h).unwrap().is_pinned());
    }

    #[test]
    fn pinned_chunk_cannot_be_removed() {
        let mut arr = mem_array();
        let h = arr.create_chunk(0, &[0, 0], EncodingKind::Plain).unwrap();
        // 模拟外部协作者持有的 pin
        std::mem::forget(arr.chunk(h).unwrap().pin());
        assert!(matches!(arr.remove(h), Err(EngineError::ChunkPinned(_))));

        let h2 = arr.create_chunk(0, &[10, 0], EncodingKind::Plain).unwrap();
        let removed = arr.remove(h2).unwrap();
        assert_eq!(removed.first_position(false), vec![10, 0]);
        assert!(matches!(arr.chunk(h2), Err(EngineError::ChunkNotFound(_))));
        // slot 复用
        let h3 = arr.create_chunk(0, &[20, 0], EncodingKind::Plain).unwrap();
        assert_eq!(h3.index(), h2.index());
    }

    #[test]
    fn foreign_chunk_is_rejected() {
        let mut arr = mem_array();
        let other = ArrayDesc::new(
            "O",
            vec![DimensionDesc::new("x", 0, 9, 10)],
            vec![AttributeDesc::new(0, "a", FieldType::Int32)],
        );
        let desc = other.chunk_descriptor(0, &[0]).unwrap();
        let chunk = Chunk::new(desc, other.attributes[0].clone(), false, EncodingKind::Plain).unwrap();
        assert!(matches!(arr.insert(chunk), Err(EngineError::SchemaMismatch(_))));
    }
}
