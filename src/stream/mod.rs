//! 多流有序合并
//!
//! 每个来源（stream）按行主序递增地提供某属性的 chunk 片段。
//! [`StreamMerger`] 对每个属性维护：
//!
//! ```text
//!   unknown ──next_position──► ready (最小堆, 按坐标) ──选最小──► partial
//!      ▲                                                          │
//!      └──────────── 片段已合并，下一位置未知 ◄──next_fragment───┘
//!                                                                 ▼
//!                                              PartialChunkMerger ─► 输出
//! ```
//!
//! `pull` 不阻塞：任何来源尚未就绪时返回 [`Pull::NotReady`]，已取得的
//! 进度（已知位置、已合并的片段）保留到下一次调用。

pub mod source;

pub use source::{QueuedChunkSource, WireChunkSource};

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::{debug, trace, warn};

use crate::chunk::Chunk;
use crate::common::{coords_to_string, AttributeId, Coordinates, EngineError, Pull, Result, StreamId};
use crate::config::EngineConfig;
use crate::context::TaskContext;
use crate::merge::{DefaultChunkMerger, PartialChunkMerger};
use crate::meta::ArrayDesc;

/// 上游片段提供者
///
/// `next_position` 只窥视，不消费；`next_fragment` 取走该位置的片段。
pub trait ChunkSource {
    fn stream_count(&self) -> usize;

    fn next_position(&mut self, stream: StreamId, attribute: AttributeId) -> Result<Pull<Coordinates>>;

    fn next_fragment(&mut self, stream: StreamId, attribute: AttributeId) -> Result<Pull<Chunk>>;
}

// ── 顺序检查 ──────────────────────────────────────────────────────────────────

struct OrderGuard {
    enforce: bool,
    warned:  bool,
}

impl OrderGuard {
    /// `floor` 为正在合并的位置，没有则为上一次输出的位置；报告的位置必须严格大于它
    fn check(
        &mut self,
        attribute: AttributeId,
        stream:    StreamId,
        floor:     Option<&Coordinates>,
        pos:       &Coordinates,
    ) -> Result<()> {
        let Some(floor) = floor else { return Ok(()) };
        if pos > floor {
            return Ok(());
        }
        let at = coords_to_string(pos);
        if self.enforce {
            return Err(EngineError::PositionOutOfOrder(at));
        }
        if !self.warned {
            warn!(attribute, stream, position = %at, after = %coords_to_string(floor),
                  "chunk position received out of order");
            self.warned = true;
        } else {
            trace!(attribute, stream, position = %at, after = %coords_to_string(floor),
                   "chunk position received out of order");
        }
        Ok(())
    }
}

// ── 单属性状态 ────────────────────────────────────────────────────────────────

struct AttributeState {
    /// 下一位置已知的来源
    ready:        BinaryHeap<Reverse<(Coordinates, StreamId)>>,
    /// 下一位置未知的来源
    unknown:      Vec<StreamId>,
    /// 向当前位置提供片段、尚未交付的来源
    partial:      Vec<StreamId>,
    current:      Option<Coordinates>,
    last_emitted: Option<Coordinates>,
    merger:       Box<dyn PartialChunkMerger>,
}

impl AttributeState {
    fn new(streams: usize, merger: Box<dyn PartialChunkMerger>) -> Self {
        Self {
            ready:        BinaryHeap::new(),
            unknown:      (0..streams).collect(),
            partial:      Vec::new(),
            current:      None,
            last_emitted: None,
            merger,
        }
    }

    fn floor(&self) -> Option<&Coordinates> {
        self.current.as_ref().or(self.last_emitted.as_ref())
    }

    /// 向位置未知的来源询问下一位置；有来源未就绪时返回 false
    fn refresh_positions<S: ChunkSource>(
        &mut self,
        source:    &mut S,
        attribute: AttributeId,
        order:     &mut OrderGuard,
    ) -> Result<bool> {
        let mut all_ready = true;
        let mut i = 0;
        while i < self.unknown.len() {
            let stream = self.unknown[i];
            match source.next_position(stream, attribute)? {
                Pull::Ready(pos) => {
                    order.check(attribute, stream, self.floor(), &pos)?;
                    trace!(attribute, stream, position = %coords_to_string(&pos), "stream position known");
                    self.unknown.swap_remove(i);
                    self.ready.push(Reverse((pos, stream)));
                }
                Pull::NotReady => {
                    all_ready = false;
                    i += 1;
                }
                Pull::EndOfStream => {
                    debug!(attribute, stream, "stream exhausted");
                    self.unknown.swap_remove(i);
                }
            }
        }
        Ok(all_ready)
    }

    /// 弹出所有位于最小位置的来源
    fn select_min(&mut self) {
        let Some(Reverse((min, _))) = self.ready.peek() else { return };
        let min = min.clone();
        while let Some(Reverse((pos, stream))) = self.ready.peek() {
            if *pos != min {
                break;
            }
            self.partial.push(*stream);
            self.ready.pop();
        }
        self.partial.sort_unstable();
        trace!(position = %coords_to_string(&min), streams = self.partial.len(), "next chunk position selected");
        self.current = Some(min);
    }

    /// 取回当前位置的片段；有来源未就绪时返回 false，已合并的片段保留
    fn collect_fragments<S: ChunkSource>(
        &mut self,
        source:    &mut S,
        attribute: AttributeId,
        order:     &mut OrderGuard,
    ) -> Result<bool> {
        let mut all_ready = true;
        let mut i = 0;
        while i < self.partial.len() {
            let stream = self.partial[i];
            let fragment = match source.next_fragment(stream, attribute)? {
                Pull::Ready(chunk) => chunk,
                Pull::NotReady => {
                    all_ready = false;
                    i += 1;
                    continue;
                }
                Pull::EndOfStream => return Err(EngineError::CantFetchChunkBody { stream, attribute }),
            };
            if let Some(expected) = &self.current {
                let got = fragment.first_position(false);
                if &got != expected {
                    return Err(EngineError::FragmentMismatch {
                        expected: coords_to_string(expected),
                        got:      coords_to_string(&got),
                    });
                }
            }
            self.partial.remove(i);
            self.merger.merge_partial_chunk(stream, attribute, fragment)?;

            match source.next_position(stream, attribute)? {
                Pull::Ready(pos) => {
                    order.check(attribute, stream, self.floor(), &pos)?;
                    self.ready.push(Reverse((pos, stream)));
                }
                Pull::NotReady    => self.unknown.push(stream),
                Pull::EndOfStream => debug!(attribute, stream, "stream exhausted"),
            }
        }
        Ok(all_ready)
    }
}

// ── StreamMerger ──────────────────────────────────────────────────────────────

pub struct StreamMerger<S: ChunkSource> {
    source: S,
    states: Vec<AttributeState>,
    order:  OrderGuard,
    ctx:    TaskContext,
}

impl<S: ChunkSource> StreamMerger<S> {
    /// 每个属性默认使用 [`DefaultChunkMerger`]，完整性策略取自 `config`
    pub fn new(desc: &ArrayDesc, source: S, config: &EngineConfig, ctx: TaskContext) -> Self {
        let streams = source.stream_count();
        let enforce = config.enforce_data_integrity;
        let states = (0..desc.num_attributes())
            .map(|_| {
                let merger: Box<dyn PartialChunkMerger> = Box::new(DefaultChunkMerger::new(enforce, config));
                AttributeState::new(streams, merger)
            })
            .collect();
        Self { source, states, order: OrderGuard { enforce, warned: false }, ctx }
    }

    /// 替换某属性的合并策略
    pub fn set_merger(&mut self, attribute: AttributeId, merger: Box<dyn PartialChunkMerger>) -> Result<()> {
        self.state_mut(attribute)?.merger = merger;
        Ok(())
    }

    pub fn source(&self) -> &S { &self.source }
    pub fn source_mut(&mut self) -> &mut S { &mut self.source }
    pub fn context(&self) -> &TaskContext { &self.ctx }

    /// 是否容忍过乱序位置
    pub fn has_integrity_issue(&self) -> bool { self.order.warned }

    pub fn last_emitted(&self, attribute: AttributeId) -> Option<&Coordinates> {
        self.states.get(attribute as usize)?.last_emitted.as_ref()
    }

    fn state_mut(&mut self, attribute: AttributeId) -> Result<&mut AttributeState> {
        self.states.get_mut(attribute as usize)
            .ok_or(EngineError::AttributeNotFound(attribute))
    }

    /// 拉取属性的下一个完整 chunk
    ///
    /// 输出位置严格递增；`NotReady` 表示需稍后重试，`EndOfStream` 表示所有来源均已耗尽。
    pub fn pull(&mut self, attribute: AttributeId) -> Result<Pull<Chunk>> {
        self.ctx.check()?;
        let state = self.states.get_mut(attribute as usize)
            .ok_or(EngineError::AttributeNotFound(attribute))?;

        if !state.refresh_positions(&mut self.source, attribute, &mut self.order)? {
            trace!(attribute, pending = state.unknown.len(), "waiting for stream positions");
            return Ok(Pull::NotReady);
        }
        if state.ready.is_empty() && state.partial.is_empty() {
            return Ok(Pull::EndOfStream);
        }
        if state.partial.is_empty() {
            state.select_min();
        }
        if !state.collect_fragments(&mut self.source, attribute, &mut self.order)? {
            trace!(attribute, pending = state.partial.len(), "waiting for chunk fragments");
            return Ok(Pull::NotReady);
        }

        let chunk = state.merger.merged_chunk(attribute)?;
        state.last_emitted = state.current.take();
        trace!(attribute, chunk = %chunk.descriptor(), "chunk emitted");
        Ok(Pull::Ready(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{EncodingKind, IterationMode};
    use crate::field_type::{AttributeDesc, FieldType, Value};
    use crate::meta::DimensionDesc;

    fn array() -> ArrayDesc {
        ArrayDesc::new(
            "S",
            vec![DimensionDesc::new("i", 0, 39, 10)],
            vec![AttributeDesc::new(0, "v", FieldType::Int64)],
        )
        .emptyable()
    }

    fn fragment(a: &ArrayDesc, cells: &[i64]) -> Chunk {
        let desc = a.chunk_descriptor(0, &[cells[0]]).unwrap();
        let mut c = Chunk::new(desc, a.attributes[0].clone(), true, EncodingKind::Sparse).unwrap();
        let mut w = c.writer(IterationMode::empty(), &EngineConfig::default()).unwrap();
        for &i in cells {
            w.write_at(&[i], Value::from_i64(i * 10)).unwrap();
        }
        w.flush().unwrap();
        c
    }

    #[test]
    fn waits_for_every_stream_before_choosing() {
        let a = array();
        let mut src = QueuedChunkSource::new(2, 1);
        src.push(0, 0, fragment(&a, &[12])).unwrap();
        let mut m = StreamMerger::new(&a, src, &EngineConfig::default(), TaskContext::new());

        // 流 1 的位置未知时不得输出
        assert!(m.pull(0).unwrap().is_not_ready());
        m.source_mut().push(1, 0, fragment(&a, &[3])).unwrap();
        m.source_mut().close(0, 0).unwrap();
        m.source_mut().close(1, 0).unwrap();

        let first = m.pull(0).unwrap().ready().unwrap();
        assert_eq!(first.first_position(false), vec![0]);
        let second = m.pull(0).unwrap().ready().unwrap();
        assert_eq!(second.first_position(false), vec![10]);
        assert!(m.pull(0).unwrap().is_end());
        assert!(m.pull(0).unwrap().is_end());
    }

    #[test]
    fn stalled_body_keeps_merged_progress() {
        let a = array();
        let mut src = QueuedChunkSource::new(2, 1);
        src.push(0, 0, fragment(&a, &[1])).unwrap();
        src.push(1, 0, fragment(&a, &[2])).unwrap();
        src.close(0, 0).unwrap();
        src.close(1, 0).unwrap();
        let mut m = StreamMerger::new(&a, src, &EngineConfig::default(), TaskContext::new());

        m.source_mut().stall(1, 0, 1).unwrap();
        assert!(m.pull(0).unwrap().is_not_ready());
        // 流 1 的片段先被合并，流 0 的片段未就绪
        m.source_mut().stall(0, 0, 1).unwrap();
        assert!(m.pull(0).unwrap().is_not_ready());

        let merged = m.pull(0).unwrap().ready().unwrap();
        assert_eq!(merged.count(), 2);
        assert_eq!(merged.cell(&[1]).unwrap(), Some(Value::from_i64(10)));
        assert_eq!(merged.cell(&[2]).unwrap(), Some(Value::from_i64(20)));
        assert_eq!(m.last_emitted(0), Some(&vec![0]));
        assert!(m.pull(0).unwrap().is_end());
    }

    #[test]
    fn duplicate_position_from_one_stream() {
        let a = array();
        let mut src = QueuedChunkSource::new(1, 1);
        src.push(0, 0, fragment(&a, &[15])).unwrap();
        src.push(0, 0, fragment(&a, &[11])).unwrap();
        src.close(0, 0).unwrap();
        let mut m = StreamMerger::new(&a, src, &EngineConfig::default(), TaskContext::new());
        let err = m.pull(0).unwrap_err();
        assert!(matches!(err, EngineError::PositionOutOfOrder(_)));
        assert!(err.is_integrity_violation());

        let mut src = QueuedChunkSource::new(1, 1);
        src.push(0, 0, fragment(&a, &[15])).unwrap();
        src.push(0, 0, fragment(&a, &[11])).unwrap();
        src.close(0, 0).unwrap();
        let lenient = EngineConfig::default().with_enforce_data_integrity(false);
        let mut m = StreamMerger::new(&a, src, &lenient, TaskContext::new());
        assert!(m.pull(0).unwrap().is_ready());
        assert!(m.has_integrity_issue());
        assert!(m.pull(0).unwrap().is_ready());
        assert!(m.pull(0).unwrap().is_end());
    }

    #[test]
    fn cancellation_and_unknown_attribute() {
        let a = array();
        let ctx = TaskContext::new();
        let mut m = StreamMerger::new(&a, QueuedChunkSource::new(1, 1), &EngineConfig::default(), ctx.clone());
        assert!(matches!(m.pull(3), Err(EngineError::AttributeNotFound(3))));
        assert!(m.pull(0).unwrap().is_not_ready());
        ctx.cancel();
        assert!(matches!(m.pull(0), Err(EngineError::Cancelled)));
    }
}
