//! 单遍（single-pass）消费纪律
//!
//! 生产者按"行"产出 chunk：第 R 行为每个属性各产出一个 chunk。
//! 开启横向约束（horizontal enforcement）后，任一属性请求下一行之前，
//! 当前行的所有属性必须已被取走；否则返回 [`Pull::NotReady`]，
//! 防止共享同一 empty bitmap 的属性间位置错位。
//!
//! 行号从 1 开始；`current_row() == 0` 表示尚未产出任何行。

use tracing::{debug, trace};

use crate::chunk::Chunk;
use crate::common::{AttributeId, EngineError, Pull, Result};

/// 按行产出 chunk 的上游
pub trait RowProducer {
    /// 最近一次产出的行号
    fn current_row(&self) -> usize;

    /// 产出第 `row` 行（= `current_row() + 1`）；没有更多行时返回 false
    fn advance_row(&mut self, row: usize) -> Result<bool>;

    /// 取走当前行某属性的 chunk
    fn chunk(&mut self, attribute: AttributeId, row: usize) -> Result<Chunk>;
}

pub struct SinglePassArray<P: RowProducer> {
    producer:  P,
    enforce:   bool,
    /// 每个属性已取走的最后一行
    rows:      Vec<usize>,
    /// 当前行已被取走的属性数
    consumed:  usize,
}

impl<P: RowProducer> SinglePassArray<P> {
    pub fn new(producer: P, attributes: usize) -> Self {
        Self { producer, enforce: false, rows: vec![0; attributes], consumed: attributes }
    }

    pub fn with_horizontal_enforcement(mut self, enforce: bool) -> Self {
        self.enforce = enforce; self
    }

    pub fn producer(&self) -> &P { &self.producer }
    pub fn producer_mut(&mut self) -> &mut P { &mut self.producer }
    pub fn current_row(&self) -> usize { self.producer.current_row() }

    /// 取属性的下一个 chunk
    pub fn next_chunk(&mut self, attribute: AttributeId) -> Result<Pull<Chunk>> {
        let a = attribute as usize;
        if a >= self.rows.len() {
            return Err(EngineError::AttributeNotFound(attribute));
        }
        loop {
            let current = self.producer.current_row();
            if self.rows[a] != current {
                return self.catch_up(attribute, current).map(Pull::Ready);
            }
            if self.enforce && self.consumed < self.rows.len() {
                trace!(attribute, row = current, consumed = self.consumed, "current row not drained");
                return Ok(Pull::NotReady);
            }
            if !self.producer.advance_row(current + 1)? {
                return Ok(Pull::EndOfStream);
            }
            self.consumed = 0;
            let chunk = self.take_behind(attribute, current + 1)?;
            if has_values(&chunk) {
                return Ok(Pull::Ready(chunk));
            }

            // 空行：同行的其他属性也必须为空，一并丢弃；落后的属性追赶时自行跳过
            for other in 0..self.rows.len() {
                if other == a || self.rows[other] != current {
                    continue;
                }
                let other = other as AttributeId;
                let sibling = self.take_behind(other, current + 1)?;
                if has_values(&sibling) {
                    return Err(EngineError::RowDesync(format!(
                        "row {} is empty for attribute {attribute} but not for attribute {other}", current + 1)));
                }
            }
            debug!(attribute, row = current + 1, "empty row skipped");
        }
    }

    /// 落后的属性向前追赶，跳过途经的空行
    fn catch_up(&mut self, attribute: AttributeId, current: usize) -> Result<Chunk> {
        loop {
            let chunk = self.take_behind(attribute, current)?;
            if has_values(&chunk) || self.rows[attribute as usize] == current {
                return Ok(chunk);
            }
            debug!(attribute, row = self.rows[attribute as usize], "empty row skipped");
        }
    }

    /// 取走落后于生产者当前行的属性的下一行
    fn take_behind(&mut self, attribute: AttributeId, current: usize) -> Result<Chunk> {
        let a = attribute as usize;
        let row = self.rows[a];
        if row >= current || (self.enforce && row + 1 != current) {
            return Err(EngineError::RowDesync(format!(
                "attribute {attribute} is at row {row}, producer is at row {current}")));
        }
        let chunk = self.producer.chunk(attribute, row + 1)?;
        self.rows[a] = row + 1;
        self.consumed += 1;
        Ok(chunk)
    }
}

fn has_values(chunk: &Chunk) -> bool {
    chunk.count() > 0
}

// ── MemRowProducer ────────────────────────────────────────────────────────────

/// 内存中的行生产者；每行的 chunk 只能被取走一次
pub struct MemRowProducer {
    attributes: usize,
    rows:       Vec<Vec<Option<Chunk>>>,
    current:    usize,
}

impl MemRowProducer {
    pub fn new(attributes: usize) -> Self {
        Self { attributes, rows: Vec::new(), current: 0 }
    }

    pub fn push_row(&mut self, chunks: Vec<Chunk>) -> Result<()> {
        if chunks.len() != self.attributes {
            return Err(EngineError::SchemaMismatch(format!(
                "row of {} chunks for {} attributes", chunks.len(), self.attributes)));
        }
        for (i, c) in chunks.iter().enumerate() {
            if c.attribute_id() as usize != i {
                return Err(EngineError::SchemaMismatch(format!(
                    "chunk of attribute {} at column {i}", c.attribute_id())));
            }
        }
        self.rows.push(chunks.into_iter().map(Some).collect());
        Ok(())
    }

    pub fn len(&self) -> usize { self.rows.len() }
    pub fn is_empty(&self) -> bool { self.rows.is_empty() }
}

impl RowProducer for MemRowProducer {
    fn current_row(&self) -> usize { self.current }

    fn advance_row(&mut self, row: usize) -> Result<bool> {
        if row != self.current + 1 {
            return Err(EngineError::RowDesync(format!(
                "cannot advance from row {} to row {row}", self.current)));
        }
        if row > self.rows.len() {
            return Ok(false);
        }
        self.current = row;
        Ok(true)
    }

    fn chunk(&mut self, attribute: AttributeId, row: usize) -> Result<Chunk> {
        if row == 0 || row > self.current {
            return Err(EngineError::RowDesync(format!("row {row} has not been produced")));
        }
        self.rows[row - 1]
            .get_mut(attribute as usize)
            .ok_or(EngineError::AttributeNotFound(attribute))?
            .take()
            .ok_or_else(|| EngineError::RowDesync(format!(
                "chunk of attribute {attribute} at row {row} already consumed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{EncodingKind, IterationMode};
    use crate::config::EngineConfig;
    use crate::field_type::{AttributeDesc, FieldType, Value};
    use crate::meta::{ArrayDesc, DimensionDesc};

    fn array() -> ArrayDesc {
        ArrayDesc::new(
            "P",
            vec![DimensionDesc::new("i", 0, 29, 10)],
            vec![
                AttributeDesc::new(0, "a", FieldType::Int32),
                AttributeDesc::new(1, "b", FieldType::Int32),
            ],
        )
        .emptyable()
    }

    fn row(a: &ArrayDesc, origin: i64, cells: &[i64]) -> Vec<Chunk> {
        (0..2)
            .map(|attr| {
                let desc = a.chunk_descriptor(attr, &[origin]).unwrap();
                let mut c = Chunk::new(desc, a.attributes[attr as usize].clone(), true, EncodingKind::Rle).unwrap();
                let mut w = c.writer(IterationMode::SEQUENTIAL_WRITE, &EngineConfig::default()).unwrap();
                for &i in cells {
                    w.write_at(&[i], Value::from_i32(i as i32)).unwrap();
                }
                w.flush().unwrap();
                c
            })
            .collect()
    }

    fn producer() -> MemRowProducer {
        let a = array();
        let mut p = MemRowProducer::new(2);
        p.push_row(row(&a, 0, &[1, 2])).unwrap();
        p.push_row(row(&a, 10, &[])).unwrap();
        p.push_row(row(&a, 20, &[25])).unwrap();
        p
    }

    #[test]
    fn horizontal_gate() {
        let mut sp = SinglePassArray::new(producer(), 2).with_horizontal_enforcement(true);
        let a0 = sp.next_chunk(0).unwrap().ready().unwrap();
        assert_eq!(a0.first_position(false), vec![0]);
        // 第 1 行的属性 1 未取走前，属性 0 不能前进
        assert!(sp.next_chunk(0).unwrap().is_not_ready());
        let b0 = sp.next_chunk(1).unwrap().ready().unwrap();
        assert_eq!(b0.first_position(false), vec![0]);

        // 第 2 行为空，被整体跳过
        let a2 = sp.next_chunk(0).unwrap().ready().unwrap();
        assert_eq!(a2.first_position(false), vec![20]);
        assert_eq!(sp.current_row(), 3);
        let b2 = sp.next_chunk(1).unwrap().ready().unwrap();
        assert_eq!(b2.first_position(false), vec![20]);

        assert!(sp.next_chunk(1).unwrap().is_end());
        assert!(sp.next_chunk(0).unwrap().is_end());
        assert!(matches!(sp.next_chunk(2), Err(EngineError::AttributeNotFound(2))));
    }

    #[test]
    fn without_enforcement_one_attribute_may_run_ahead() {
        let mut sp = SinglePassArray::new(producer(), 2);
        assert!(sp.next_chunk(0).unwrap().is_ready());
        let a2 = sp.next_chunk(0).unwrap().ready().unwrap();
        assert_eq!(a2.first_position(false), vec![20]);
        // 属性 1 逐行追赶
        let b: Vec<_> = (0..2)
            .map(|_| sp.next_chunk(1).unwrap().ready().unwrap().first_position(false))
            .collect();
        assert_eq!(b, vec![vec![0], vec![20]]);
    }

    #[test]
    fn sibling_with_values_in_empty_row_is_a_desync() {
        let a = array();
        let mut p = MemRowProducer::new(2);
        let mut r = row(&a, 0, &[3]);
        r[0] = row(&a, 0, &[]).swap_remove(0);
        p.push_row(r).unwrap();
        let mut sp = SinglePassArray::new(p, 2).with_horizontal_enforcement(true);
        assert!(matches!(sp.next_chunk(0), Err(EngineError::RowDesync(_))));
    }
}
