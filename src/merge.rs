//! 同一逻辑 chunk 的多个片段（fragment）合并
//!
//! 不同来源各自持有某个 chunk 的一部分单元，接收端把它们逐个交给
//! [`PartialChunkMerger`]，全部到齐后取出完整 chunk。

use tracing::{trace, warn};

use crate::chunk::{Chunk, IterationMode};
use crate::common::{coords_to_string, AttributeId, Coordinates, EngineError, Result, StreamId};
use crate::config::EngineConfig;
use crate::field_type::Value;

/// 片段合并策略
pub trait PartialChunkMerger {
    /// 收下一个片段；所有权转移给合并器
    fn merge_partial_chunk(
        &mut self,
        source:    StreamId,
        attribute: AttributeId,
        fragment:  Chunk,
    ) -> Result<()>;

    /// 交出合并结果并重置状态
    fn merged_chunk(&mut self, attribute: AttributeId) -> Result<Chunk>;
}

/// 逐单元取并集
///
/// 第一个片段被直接收养为合并结果，之后的片段以续写方式并入。
/// 后到片段写入一个已有值的单元即为冲突（collision）：
/// - `enforce = true`：`merged_chunk` 返回 [`EngineError::DataCollision`]
/// - `enforce = false`：容忍冲突，首次以 WARN 记录，之后降为 TRACE；保留哪个值不作保证
pub struct DefaultChunkMerger {
    enforce:             bool,
    config:              EngineConfig,
    merged:              Option<Chunk>,
    fragments:           usize,
    collisions:          u64,
    has_integrity_issue: bool,
}

impl DefaultChunkMerger {
    pub fn new(enforce: bool, config: &EngineConfig) -> Self {
        Self {
            enforce,
            config:              config.clone(),
            merged:              None,
            fragments:           0,
            collisions:          0,
            has_integrity_issue: false,
        }
    }

    pub fn is_enforcing(&self) -> bool { self.enforce }
    /// 已检测到（并被容忍的）冲突
    pub fn has_integrity_issue(&self) -> bool { self.has_integrity_issue }

    fn reset(&mut self) {
        self.merged     = None;
        self.fragments  = 0;
        self.collisions = 0;
    }

    fn absorb(merged: &mut Chunk, fragment: &Chunk, config: &EngineConfig) -> Result<u64> {
        let mode = if fragment.is_emptyable() {
            IterationMode::IGNORE_EMPTY_CELLS
        } else {
            IterationMode::IGNORE_DEFAULT_VALUES
        };
        let incoming: Vec<(Coordinates, Value)> = fragment.cells(mode)?.collect::<Result<_>>()?;

        let mut collisions = 0;
        for (coords, _) in &incoming {
            let occupied = match merged.cell(coords)? {
                Some(v) => merged.is_emptyable() || &v != merged.default_value(),
                None    => false,
            };
            if occupied {
                collisions += 1;
                trace!(chunk = %merged.descriptor(), cell = %coords_to_string(coords), "cell already set");
            }
        }

        let mut w = merged.writer(IterationMode::APPEND_EXISTING, config)?;
        for (coords, value) in incoming {
            w.write_at(&coords, value)?;
        }
        w.flush()?;
        Ok(collisions)
    }
}

impl PartialChunkMerger for DefaultChunkMerger {
    fn merge_partial_chunk(
        &mut self,
        source:    StreamId,
        attribute: AttributeId,
        fragment:  Chunk,
    ) -> Result<()> {
        if fragment.attribute_id() != attribute {
            return Err(EngineError::SchemaMismatch(format!(
                "fragment of attribute {} passed for attribute {attribute}", fragment.attribute_id())));
        }
        fragment.ensure_flushed()?;
        self.fragments += 1;

        let Some(merged) = self.merged.as_mut() else {
            trace!(stream = source, attribute, chunk = %fragment.descriptor(), "fragment adopted");
            self.merged = Some(fragment);
            return Ok(());
        };
        if merged.first_position(false) != fragment.first_position(false) {
            return Err(EngineError::FragmentMismatch {
                expected: coords_to_string(&merged.first_position(false)),
                got:      coords_to_string(&fragment.first_position(false)),
            });
        }
        let collisions = Self::absorb(merged, &fragment, &self.config)?;
        trace!(stream = source, attribute, chunk = %merged.descriptor(), collisions, "fragment merged");
        self.collisions += collisions;
        Ok(())
    }

    fn merged_chunk(&mut self, attribute: AttributeId) -> Result<Chunk> {
        let Some(merged) = self.merged.take() else {
            self.reset();
            return Err(EngineError::NothingMerged(attribute));
        };
        let collisions = self.collisions;
        let fragments  = self.fragments;
        self.reset();

        if collisions > 0 {
            let at = coords_to_string(&merged.first_position(false));
            if self.enforce {
                return Err(EngineError::DataCollision { chunk: at, attribute });
            }
            if !self.has_integrity_issue {
                warn!(attribute, chunk = %at, collisions, "data collision detected in chunk");
                self.has_integrity_issue = true;
            } else {
                trace!(attribute, chunk = %at, collisions, "data collision detected in chunk");
            }
        }

        let limit = self.config.chunk_size_limit_bytes();
        let size = merged.packed_size();
        if limit > 0 && size > limit {
            return Err(EngineError::ChunkTooLarge { size, limit });
        }
        trace!(attribute, chunk = %merged.descriptor(), fragments, size, "merged chunk ready");
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::EncodingKind;
    use crate::field_type::{AttributeDesc, FieldType};
    use crate::meta::{ArrayDesc, DimensionDesc};

    fn array(emptyable: bool) -> ArrayDesc {
        let a = ArrayDesc::new(
            "A",
            vec![DimensionDesc::new("i", 0, 15, 8)],
            vec![AttributeDesc::new(0, "v", FieldType::Int32)],
        );
        if emptyable { a.emptyable() } else { a }
    }

    fn fragment(a: &ArrayDesc, kind: EncodingKind, origin: i64, cells: &[(i64, i32)]) -> Chunk {
        let desc = a.chunk_descriptor(0, &[origin]).unwrap();
        let mut c = Chunk::new(desc, a.attributes[0].clone(), a.emptyable, kind).unwrap();
        let mut w = c.writer(IterationMode::empty(), &EngineConfig::default()).unwrap();
        for &(i, v) in cells {
            w.write_at(&[i], Value::from_i32(v)).unwrap();
        }
        w.flush().unwrap();
        c
    }

    #[test]
    fn union_of_disjoint_fragments() {
        let a = array(true);
        let cfg = EngineConfig::default();
        let mut m = DefaultChunkMerger::new(true, &cfg);
        m.merge_partial_chunk(0, 0, fragment(&a, EncodingKind::Rle, 0, &[(1, 10), (3, 30)])).unwrap();
        m.merge_partial_chunk(1, 0, fragment(&a, EncodingKind::Rle, 0, &[(2, 20)])).unwrap();
        let c = m.merged_chunk(0).unwrap();
        let cells: Vec<_> = c.cells(IterationMode::IGNORE_EMPTY_CELLS).unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(cells, vec![
            (vec![1], Value::from_i32(10)),
            (vec![2], Value::from_i32(20)),
            (vec![3], Value::from_i32(30)),
        ]);
        assert!(matches!(m.merged_chunk(0), Err(EngineError::NothingMerged(0))));
    }

    #[test]
    fn collision_policy() {
        let a = array(false);
        let cfg = EngineConfig::default();

        let mut strict = DefaultChunkMerger::new(true, &cfg);
        strict.merge_partial_chunk(0, 0, fragment(&a, EncodingKind::Sparse, 8, &[(9, 1)])).unwrap();
        strict.merge_partial_chunk(1, 0, fragment(&a, EncodingKind::Sparse, 8, &[(9, 2)])).unwrap();
        assert!(matches!(strict.merged_chunk(0), Err(EngineError::DataCollision { attribute: 0, .. })));

        let mut lenient = DefaultChunkMerger::new(false, &cfg);
        lenient.merge_partial_chunk(0, 0, fragment(&a, EncodingKind::Plain, 8, &[(9, 1)])).unwrap();
        lenient.merge_partial_chunk(1, 0, fragment(&a, EncodingKind::Plain, 8, &[(9, 2), (10, 3)])).unwrap();
        let c = lenient.merged_chunk(0).unwrap();
        assert!(lenient.has_integrity_issue());
        let v = c.cell(&[9]).unwrap().and_then(|v| v.as_i64());
        assert!(matches!(v, Some(1) | Some(2)));
        assert_eq!(c.cell(&[10]).unwrap(), Some(Value::from_i32(3)));
    }

    #[test]
    fn mismatched_fragment_and_size_limit() {
        let a = array(true);
        let cfg = EngineConfig::default();
        let mut m = DefaultChunkMerger::new(true, &cfg);
        m.merge_partial_chunk(0, 0, fragment(&a, EncodingKind::Plain, 0, &[(0, 1)])).unwrap();
        assert!(matches!(
            m.merge_partial_chunk(1, 0, fragment(&a, EncodingKind::Plain, 8, &[(8, 1)])),
            Err(EngineError::FragmentMismatch { .. })
        ));

        let tiny = EngineConfig { chunk_size_limit_mib: 1, ..EngineConfig::default() };
        let big = ArrayDesc::new(
            "B",
            vec![DimensionDesc::new("i", 0, 300_000, 300_000)],
            vec![AttributeDesc::new(0, "v", FieldType::Int64)],
        );
        let desc = big.chunk_descriptor(0, &[0]).unwrap();
        let mut c = Chunk::new(desc, big.attributes[0].clone(), false, EncodingKind::Plain).unwrap();
        c.writer(IterationMode::empty(), &tiny).unwrap().flush().unwrap();
        let mut m = DefaultChunkMerger::new(true, &tiny);
        m.merge_partial_chunk(0, 0, c).unwrap();
        assert!(matches!(m.merged_chunk(0), Err(EngineError::ChunkTooLarge { .. })));
    }
}
