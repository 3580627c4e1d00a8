//! 数组 schema：维度、属性与 chunk 描述符

use crate::common::{
    coords_to_string, AttributeId, Coordinate, Coordinates, EngineError, Result,
};
use crate::field_type::AttributeDesc;
use crate::mapper::PositionMapper;

// ── 维度定义 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionDesc {
    pub name:           String,
    pub start:          Coordinate,
    /// 闭区间上界
    pub end_max:        Coordinate,
    pub chunk_interval: u64,
    pub chunk_overlap:  u64,
}

impl DimensionDesc {
    pub fn new(name: &str, start: Coordinate, end_max: Coordinate, chunk_interval: u64) -> Self {
        Self {
            name: name.into(), start, end_max,
            chunk_interval: chunk_interval.max(1),
            chunk_overlap: 0,
        }
    }

    pub fn with_overlap(mut self, overlap: u64) -> Self {
        self.chunk_overlap = overlap; self
    }

    /// 坐标所在 chunk 的起点（按 chunk_interval 对齐）
    pub fn chunk_start(&self, c: Coordinate) -> Coordinate {
        let interval = self.chunk_interval as i64;
        self.start + (c - self.start).div_euclid(interval) * interval
    }

    pub fn contains(&self, c: Coordinate) -> bool {
        c >= self.start && c <= self.end_max
    }
}

// ── 数组 schema ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayDesc {
    pub name:       String,
    pub dimensions: Vec<DimensionDesc>,
    pub attributes: Vec<AttributeDesc>,
    /// 是否带 empty bitmap（允许逻辑上不存在的单元）
    pub emptyable:  bool,
}

impl ArrayDesc {
    pub fn new(name: &str, dimensions: Vec<DimensionDesc>, attributes: Vec<AttributeDesc>) -> Self {
        Self { name: name.into(), dimensions, attributes, emptyable: false }
    }

    pub fn emptyable(mut self) -> Self {
        self.emptyable = true; self
    }

    pub fn num_dimensions(&self) -> usize { self.dimensions.len() }
    pub fn num_attributes(&self) -> usize { self.attributes.len() }

    pub fn attribute(&self, id: AttributeId) -> Result<&AttributeDesc> {
        self.attributes.iter()
            .find(|a| a.id == id)
            .ok_or(EngineError::AttributeNotFound(id))
    }

    /// 将任意单元坐标对齐到其所在 chunk 的起点
    pub fn chunk_origin(&self, coords: &[Coordinate]) -> Result<Coordinates> {
        if coords.len() != self.dimensions.len() {
            return Err(EngineError::SchemaMismatch(format!(
                "{} coordinates for {} dimensions", coords.len(), self.dimensions.len())));
        }
        self.dimensions.iter().zip(coords)
            .map(|(d, &c)| {
                if d.contains(c) {
                    Ok(d.chunk_start(c))
                } else {
                    Err(EngineError::OutOfBounds(coords_to_string(coords)))
                }
            })
            .collect()
    }

    pub fn chunk_descriptor(&self, attribute: AttributeId, coords: &[Coordinate]) -> Result<ChunkDescriptor> {
        self.attribute(attribute)?;
        let first = self.chunk_origin(coords)?;
        Ok(ChunkDescriptor {
            attribute,
            first_position: first,
            dimensions: self.dimensions.clone(),
        })
    }
}

// ── Chunk 描述符 ──────────────────────────────────────────────────────────────

/// 一个 chunk 的形状：属性 + 起点 + 每维 start/end/interval/overlap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub attribute:      AttributeId,
    /// 核心区（不含 overlap）的起点
    pub first_position: Coordinates,
    pub dimensions:     Vec<DimensionDesc>,
}

impl ChunkDescriptor {
    /// 起点；`with_overlap` 时向外扩展 overlap，并截断到维度下界
    pub fn first_position(&self, with_overlap: bool) -> Coordinates {
        self.dimensions.iter().zip(&self.first_position)
            .map(|(d, &c)| {
                if with_overlap { (c - d.chunk_overlap as i64).max(d.start) } else { c }
            })
            .collect()
    }

    /// 终点（闭区间）；始终截断到维度 end_max
    pub fn last_position(&self, with_overlap: bool) -> Coordinates {
        self.dimensions.iter().zip(&self.first_position)
            .map(|(d, &c)| {
                let last = c + d.chunk_interval as i64 - 1;
                let last = if with_overlap { last + d.chunk_overlap as i64 } else { last };
                last.min(d.end_max)
            })
            .collect()
    }

    /// 逻辑位置空间大小 = Π(interval + 2·overlap)
    pub fn logical_size(&self) -> u64 {
        self.dimensions.iter()
            .map(|d| d.chunk_interval + 2 * d.chunk_overlap)
            .product()
    }

    pub fn mapper(&self) -> PositionMapper {
        PositionMapper::new(self)
    }
}

impl std::fmt::Display for ChunkDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "attr={} {}", self.attribute, coords_to_string(&self.first_position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_type::FieldType;

    fn array() -> ArrayDesc {
        ArrayDesc::new(
            "A",
            vec![
                DimensionDesc::new("i", 0, 9, 4).with_overlap(1),
                DimensionDesc::new("j", -5, 5, 5),
            ],
            vec![AttributeDesc::new(0, "v", FieldType::Int64)],
        )
    }

    #[test]
    fn origin_alignment() {
        let a = array();
        assert_eq!(a.chunk_origin(&[5, -1]).unwrap(), vec![4, -5]);
        assert_eq!(a.chunk_origin(&[9, 5]).unwrap(), vec![8, 5]);
        assert!(a.chunk_origin(&[10, 0]).is_err());
        assert!(a.chunk_origin(&[1]).is_err());
    }

    #[test]
    fn overlap_bounds_are_clamped() {
        let d = array().chunk_descriptor(0, &[0, 0]).unwrap();
        assert_eq!(d.first_position(false), vec![0, 0]);
        assert_eq!(d.first_position(true), vec![0, 0]);
        assert_eq!(d.last_position(true), vec![4, 4]);

        let tail = array().chunk_descriptor(0, &[9, 5]).unwrap();
        assert_eq!(tail.first_position(true), vec![7, 5]);
        assert_eq!(tail.last_position(false), vec![9, 5]);
        assert_eq!(tail.logical_size(), 6 * 5);
    }
}
