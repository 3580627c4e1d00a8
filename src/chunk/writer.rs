//! 写游标
//!
//! 写会话把单元交给按编码选定的 sink，`flush` 时由 sink 生成最终 body
//! 并整体替换 chunk 的 body。`flush(self)` 消耗写游标，保证每个会话恰好 flush 一次；
//! 未 flush 就被丢弃的续写会话不改动原 body。

use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::bitmap::EmptyBitmap;
use crate::common::{coords_to_string, Coordinate, Coordinates, EngineError, Position, Result};
use crate::config::EngineConfig;
use crate::field_type::Value;
use crate::mapper::PositionMapper;

use super::{
    Chunk, ChunkBody, ChunkState, CellSource, IterationMode, PlainBody, RleBody, RlePayload,
    SlotLayout, SparseBody,
};

pub(crate) trait CellSink {
    fn put(&mut self, pos: Position, value: Value) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<ChunkBody>;
}

// ── Plain ─────────────────────────────────────────────────────────────────────

struct PlainSink {
    body: PlainBody,
}

impl CellSink for PlainSink {
    fn put(&mut self, pos: Position, value: Value) -> Result<()> {
        self.body.set(pos, &value)?;
        self.body.mark_present(pos);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<ChunkBody> {
        Ok(ChunkBody::Plain(self.body))
    }
}

// ── Sparse ────────────────────────────────────────────────────────────────────

struct SparseSink {
    body:         SparseBody,
    default:      Value,
    logical_size: u64,
    threshold:    f64,
}

impl CellSink for SparseSink {
    fn put(&mut self, pos: Position, value: Value) -> Result<()> {
        if value == self.default {
            self.body.remove(pos);
        } else {
            self.body.upsert(pos, &value)?;
        }
        self.body.mark_present(pos);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<ChunkBody> {
        let density = self.body.density(self.logical_size);
        if density > self.threshold {
            debug!(
                entries = self.body.len(),
                logical_size = self.logical_size,
                density,
                "sparse chunk exceeds dense threshold, rewriting as plain"
            );
            let plain = self.body.to_plain(self.logical_size, &self.default)?;
            return Ok(ChunkBody::Plain(plain));
        }
        Ok(ChunkBody::Sparse(self.body))
    }
}

// ── RLE ───────────────────────────────────────────────────────────────────────

/// 顺序写直接追加；乱序写先缓冲，flush 时按位置排序后追加
struct RleSink {
    payload:   RlePayload,
    bitmap:    EmptyBitmap,
    /// 下一个尚未输出的位置
    next:      Position,
    pending:   Option<BTreeMap<Position, Value>>,
    /// 非 emptyable 数组：可寻址但未写入的位置以默认值补齐
    fill:      Option<(Value, PositionMapper)>,
    emptyable: bool,
}

impl RleSink {
    fn emit(&mut self, pos: Position, value: &Value) -> Result<()> {
        self.fill_defaults(pos)?;
        self.bitmap.append(pos)?;
        self.payload.append(value)?;
        self.next = pos + 1;
        Ok(())
    }

    fn fill_defaults(&mut self, until: Position) -> Result<()> {
        let Some((default, mapper)) = &self.fill else { return Ok(()) };
        for p in self.next..until {
            if mapper.contains_pos(p) {
                self.bitmap.append(p)?;
                self.payload.append(default)?;
            }
        }
        self.next = self.next.max(until);
        Ok(())
    }
}

impl CellSink for RleSink {
    fn put(&mut self, pos: Position, value: Value) -> Result<()> {
        match self.pending.as_mut() {
            Some(buf) => {
                buf.insert(pos, value);
                Ok(())
            }
            None => self.emit(pos, &value),
        }
    }

    fn finish(mut self: Box<Self>) -> Result<ChunkBody> {
        if let Some(buf) = self.pending.take() {
            for (pos, value) in &buf {
                self.emit(*pos, value)?;
            }
        }
        let end = self.fill.as_ref().map_or(self.next, |(_, m)| m.logical_size());
        self.fill_defaults(end)?;
        let body = RleBody::from_parts(self.payload, self.bitmap, self.emptyable)?;
        Ok(ChunkBody::Rle(body))
    }
}

// ── ChunkWriter ───────────────────────────────────────────────────────────────

pub struct ChunkWriter<'a> {
    chunk:        &'a mut Chunk,
    mode:         IterationMode,
    sink:         Option<Box<dyn CellSink>>,
    current:      Option<Position>,
    last_written: Option<Position>,
    written:      u64,
    /// 在已 flush 的 chunk 上续写
    reopened:     bool,
}

impl<'a> ChunkWriter<'a> {
    pub(crate) fn open(chunk: &'a mut Chunk, mode: IterationMode, config: &EngineConfig) -> Result<Self> {
        let reopened = chunk.state == ChunkState::Flushed;
        let sink = Self::make_sink(chunk, mode, config, reopened)?;
        chunk.set_state(ChunkState::Writing);
        Ok(Self {
            chunk, mode,
            sink:         Some(sink),
            current:      None,
            last_written: None,
            written:      0,
            reopened,
        })
    }

    fn make_sink(
        chunk:    &Chunk,
        mode:     IterationMode,
        config:   &EngineConfig,
        reopened: bool,
    ) -> Result<Box<dyn CellSink>> {
        let n = chunk.mapper.logical_size();
        let default = chunk.default.clone();
        let layout: SlotLayout = chunk.layout;
        let sink: Box<dyn CellSink> = match &chunk.body {
            ChunkBody::Plain(b) => {
                let body = if reopened {
                    b.clone()
                } else {
                    PlainBody::new(layout, n, &default, chunk.emptyable)?
                };
                Box::new(PlainSink { body })
            }
            ChunkBody::Sparse(b) => {
                let body = if reopened {
                    b.clone()
                } else {
                    let init = (config.sparse_chunk_init_size * n as f64) as usize;
                    SparseBody::new(layout, chunk.emptyable, init)
                };
                Box::new(SparseSink {
                    body, default,
                    logical_size: n,
                    threshold:    config.dense_chunk_threshold,
                })
            }
            ChunkBody::Rle(b) => {
                let buffered = reopened || !mode.contains(IterationMode::SEQUENTIAL_WRITE);
                let mut pending = buffered.then(BTreeMap::new);
                if let (true, Some(buf)) = (reopened, pending.as_mut()) {
                    if let Some(bm) = b.bitmap() {
                        for pos in bm.iter() {
                            let v = b.value_at(pos)?.unwrap_or_else(|| default.clone());
                            buf.insert(pos, v);
                        }
                    }
                }
                Box::new(RleSink {
                    payload:   RlePayload::new(layout),
                    bitmap:    EmptyBitmap::new(),
                    next:      0,
                    pending,
                    fill:      (!chunk.emptyable).then(|| (default, chunk.mapper.clone())),
                    emptyable: chunk.emptyable,
                })
            }
        };
        Ok(sink)
    }

    pub fn mode(&self) -> IterationMode { self.mode }
    pub fn chunk(&self) -> &Chunk { self.chunk }
    pub fn position(&self) -> Option<Position> { self.current }
    pub fn is_end(&self) -> bool { self.current.is_none() }
    /// 本会话写入的单元数
    pub fn written(&self) -> u64 { self.written }

    pub fn coordinates(&self) -> Result<Coordinates> {
        let pos = self.current.ok_or(EngineError::NoCurrentElement)?;
        Ok(self.chunk.mapper.coords_of(pos))
    }

    fn writable(&self, pos: Position) -> bool {
        let m = &self.chunk.mapper;
        m.contains_pos(pos) && (!self.mode.contains(IterationMode::IGNORE_OVERLAPS) || m.in_core(pos))
    }

    pub fn seek(&mut self, coords: &[Coordinate]) -> bool {
        self.current = self.chunk.mapper.coords_to_pos(coords).filter(|&p| self.writable(p));
        self.current.is_some()
    }

    /// 前进到下一个可写位置；未定位时从头开始
    pub fn advance(&mut self) -> Result<()> {
        let start = self.current.map_or(0, |p| p + 1);
        let n = self.chunk.mapper.logical_size();
        self.current = (start..n).find(|&p| self.writable(p));
        Ok(())
    }

    /// 写入当前位置
    pub fn write(&mut self, value: Value) -> Result<()> {
        let pos = self.current.ok_or(EngineError::NoCurrentElement)?;
        self.put(pos, value)
    }

    /// 定位并写入
    pub fn write_at(&mut self, coords: &[Coordinate], value: Value) -> Result<()> {
        if !self.seek(coords) {
            return Err(EngineError::OutOfBounds(coords_to_string(coords)));
        }
        self.write(value)
    }

    fn put(&mut self, pos: Position, value: Value) -> Result<()> {
        let value = self.chunk.attr.normalize(value)?;
        if self.mode.contains(IterationMode::SEQUENTIAL_WRITE) {
            if let Some(prev) = self.last_written.filter(|&prev| prev >= pos) {
                return Err(EngineError::NotSequential { prev, next: pos });
            }
        }
        let sink = self.sink.as_mut()
            .ok_or_else(|| EngineError::ChunkFinalized(self.chunk.desc.to_string()))?;
        sink.put(pos, value)?;
        self.last_written = Some(pos);
        self.written += 1;
        Ok(())
    }

    /// 生成最终编码并结束写会话
    pub fn flush(mut self) -> Result<()> {
        let label = self.chunk.desc.to_string();
        let sink = self.sink.take().ok_or_else(|| EngineError::ChunkFinalized(label.clone()))?;
        let body = sink.finish()?;
        trace!(
            chunk = %label,
            encoding = ?body.kind(),
            written = self.written,
            packed_size = body.packed_size(),
            "chunk flushed"
        );
        self.chunk.install(body);
        Ok(())
    }
}

impl Drop for ChunkWriter<'_> {
    fn drop(&mut self) {
        if self.sink.is_some() && self.reopened {
            // 放弃续写：原 body 未被改动
            self.chunk.set_state(ChunkState::Flushed);
        }
    }
}
