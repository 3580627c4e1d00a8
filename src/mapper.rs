//! 坐标 ↔ chunk 内线性位置
//!
//! 位置空间以 `first - overlap` 为原点，每维跨度 `interval + 2·overlap`，
//! 行主序（最后一维变化最快）。截断到维度边界之外的位置属于空间但不可寻址。

use crate::common::{Coordinate, Coordinates, Position};
use crate::meta::ChunkDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionMapper {
    origin:       Coordinates,
    extents:      Vec<u64>,
    /// 可寻址区间（含 overlap，已截断）
    lower:        Coordinates,
    upper:        Coordinates,
    /// 核心区（不含 overlap）
    core_lower:   Coordinates,
    core_upper:   Coordinates,
    logical_size: u64,
}

impl PositionMapper {
    pub fn new(desc: &ChunkDescriptor) -> Self {
        let origin = desc.dimensions.iter().zip(&desc.first_position)
            .map(|(d, &c)| c - d.chunk_overlap as i64)
            .collect();
        let extents = desc.dimensions.iter()
            .map(|d| d.chunk_interval + 2 * d.chunk_overlap)
            .collect();
        Self {
            origin,
            extents,
            lower:        desc.first_position(true),
            upper:        desc.last_position(true),
            core_lower:   desc.first_position(false),
            core_upper:   desc.last_position(false),
            logical_size: desc.logical_size(),
        }
    }

    pub fn num_dimensions(&self) -> usize { self.origin.len() }
    pub fn logical_size(&self) -> u64 { self.logical_size }

    /// 坐标 → 位置；不可寻址时返回 None
    pub fn coords_to_pos(&self, coords: &[Coordinate]) -> Option<Position> {
        if coords.len() != self.origin.len() {
            return None;
        }
        let mut pos: u64 = 0;
        for i in 0..coords.len() {
            if coords[i] < self.lower[i] || coords[i] > self.upper[i] {
                return None;
            }
            pos = pos * self.extents[i] + (coords[i] - self.origin[i]) as u64;
        }
        Some(pos)
    }

    /// 位置 → 坐标，写入 `out`（复用缓冲区）
    pub fn pos_to_coords(&self, mut pos: Position, out: &mut Coordinates) {
        let n = self.origin.len();
        out.resize(n, 0);
        for i in (0..n).rev() {
            out[i] = self.origin[i] + (pos % self.extents[i]) as i64;
            pos /= self.extents[i];
        }
    }

    pub fn coords_of(&self, pos: Position) -> Coordinates {
        let mut out = Vec::with_capacity(self.origin.len());
        self.pos_to_coords(pos, &mut out);
        out
    }

    fn each_offset<F: FnMut(usize, i64) -> bool>(&self, mut pos: Position, mut f: F) -> bool {
        for i in (0..self.origin.len()).rev() {
            let c = self.origin[i] + (pos % self.extents[i]) as i64;
            pos /= self.extents[i];
            if !f(i, c) { return false; }
        }
        true
    }

    /// 位置是否落在截断后的可寻址区间内
    pub fn contains_pos(&self, pos: Position) -> bool {
        pos < self.logical_size
            && self.each_offset(pos, |i, c| c >= self.lower[i] && c <= self.upper[i])
    }

    /// 位置是否落在核心区（非 overlap）
    pub fn in_core(&self, pos: Position) -> bool {
        pos < self.logical_size
            && self.each_offset(pos, |i, c| c >= self.core_lower[i] && c <= self.core_upper[i])
    }

    /// 可寻址单元数
    pub fn bounded_size(&self) -> u64 {
        self.lower.iter().zip(&self.upper)
            .map(|(l, u)| (u - l + 1).max(0) as u64)
            .product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_type::{AttributeDesc, FieldType};
    use crate::meta::{ArrayDesc, DimensionDesc};

    fn mapper_at(coords: &[i64]) -> PositionMapper {
        ArrayDesc::new(
            "A",
            vec![
                DimensionDesc::new("i", 0, 9, 4).with_overlap(1),
                DimensionDesc::new("j", 0, 99, 10),
            ],
            vec![AttributeDesc::new(0, "v", FieldType::Int32)],
        )
        .chunk_descriptor(0, coords).unwrap()
        .mapper()
    }

    #[test]
    fn row_major_layout() {
        let m = mapper_at(&[4, 10]);
        assert_eq!(m.logical_size(), 6 * 10);
        // 原点是 (3, 10)
        assert_eq!(m.coords_to_pos(&[3, 10]), Some(0));
        assert_eq!(m.coords_to_pos(&[3, 11]), Some(1));
        assert_eq!(m.coords_to_pos(&[4, 10]), Some(10));
        assert_eq!(m.coords_of(25), vec![5, 15]);
        assert_eq!(m.coords_to_pos(&[9, 10]), None);
    }

    #[test]
    fn coords_round_trip_every_position() {
        let m = mapper_at(&[4, 10]);
        let mut buf = Vec::new();
        for pos in 0..m.logical_size() {
            m.pos_to_coords(pos, &mut buf);
            assert_eq!(m.coords_to_pos(&buf), Some(pos));
        }
    }

    #[test]
    fn edge_chunk_clamps_halo() {
        let m = mapper_at(&[0, 0]);
        // i = -1 超出维度下界，不可寻址
        assert!(!m.contains_pos(0));
        assert_eq!(m.coords_to_pos(&[-1, 0]), None);
        assert!(m.contains_pos(10));
        assert!(!m.in_core(10 * 5));
        assert!(m.in_core(10));
        assert_eq!(m.bounded_size(), 5 * 10);
    }
}
