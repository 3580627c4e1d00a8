//! [`ChunkSource`] 的两种实现
//!
//! - [`QueuedChunkSource`]：本地流，直接排队已构造的 chunk
//! - [`WireChunkSource`]：缓存传输层送达的线上负载，位置只从首部解析，
//!   body 在被取走时才解码

use std::collections::VecDeque;
use tracing::trace;

use super::ChunkSource;
use crate::chunk::Chunk;
use crate::common::{AttributeId, Coordinates, EngineError, Pull, Result, StreamId};
use crate::meta::ArrayDesc;
use crate::wire::{decode_chunk, decode_header};

// ── Mailbox ───────────────────────────────────────────────────────────────────

/// 单个 (stream, attribute) 的待取队列
struct Mailbox<T> {
    items:  VecDeque<T>,
    closed: bool,
    /// 注入的未就绪次数（模拟传输延迟）
    stalls: usize,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self { items: VecDeque::new(), closed: false, stalls: 0 }
    }
}

impl<T> Mailbox<T> {
    fn stalled(&mut self) -> bool {
        if self.stalls > 0 {
            self.stalls -= 1;
            return true;
        }
        false
    }

    fn peek(&mut self) -> Pull<&T> {
        if self.stalled() {
            return Pull::NotReady;
        }
        match self.items.front() {
            Some(v)             => Pull::Ready(v),
            None if self.closed => Pull::EndOfStream,
            None                => Pull::NotReady,
        }
    }

    fn take(&mut self) -> Pull<T> {
        if self.stalled() {
            return Pull::NotReady;
        }
        match self.items.pop_front() {
            Some(v)             => Pull::Ready(v),
            None if self.closed => Pull::EndOfStream,
            None                => Pull::NotReady,
        }
    }
}

/// stream × attribute 的二维邮箱表
struct Mailboxes<T> {
    streams:    usize,
    attributes: usize,
    boxes:      Vec<Mailbox<T>>,
}

impl<T> Mailboxes<T> {
    fn new(streams: usize, attributes: usize) -> Self {
        let boxes = (0..streams * attributes).map(|_| Mailbox::default()).collect();
        Self { streams, attributes, boxes }
    }

    fn get(&mut self, stream: StreamId, attribute: AttributeId) -> Result<&mut Mailbox<T>> {
        if stream >= self.streams {
            return Err(EngineError::StreamNotFound(stream));
        }
        let a = attribute as usize;
        if a >= self.attributes {
            return Err(EngineError::AttributeNotFound(attribute));
        }
        Ok(&mut self.boxes[stream * self.attributes + a])
    }

    fn push(&mut self, stream: StreamId, attribute: AttributeId, item: T) -> Result<()> {
        let mb = self.get(stream, attribute)?;
        if mb.closed {
            return Err(EngineError::StreamClosed { stream, attribute });
        }
        mb.items.push_back(item);
        Ok(())
    }

    fn close(&mut self, stream: StreamId, attribute: AttributeId) -> Result<()> {
        self.get(stream, attribute)?.closed = true;
        Ok(())
    }

    fn close_all(&mut self) {
        for mb in &mut self.boxes {
            mb.closed = true;
        }
    }

    fn stall(&mut self, stream: StreamId, attribute: AttributeId, polls: usize) -> Result<()> {
        self.get(stream, attribute)?.stalls += polls;
        Ok(())
    }
}

// ── QueuedChunkSource ─────────────────────────────────────────────────────────

pub struct QueuedChunkSource {
    boxes: Mailboxes<Chunk>,
}

impl QueuedChunkSource {
    pub fn new(streams: usize, attributes: usize) -> Self {
        Self { boxes: Mailboxes::new(streams, attributes) }
    }

    pub fn push(&mut self, stream: StreamId, attribute: AttributeId, chunk: Chunk) -> Result<()> {
        if chunk.attribute_id() != attribute {
            return Err(EngineError::SchemaMismatch(format!(
                "chunk of attribute {} queued for attribute {attribute}", chunk.attribute_id())));
        }
        chunk.ensure_flushed()?;
        self.boxes.push(stream, attribute, chunk)
    }

    /// 标记流结束；之后队列取空即为 `EndOfStream`
    pub fn close(&mut self, stream: StreamId, attribute: AttributeId) -> Result<()> {
        self.boxes.close(stream, attribute)
    }

    pub fn close_all(&mut self) { self.boxes.close_all() }

    /// 让接下来的 `polls` 次查询返回 `NotReady`
    pub fn stall(&mut self, stream: StreamId, attribute: AttributeId, polls: usize) -> Result<()> {
        self.boxes.stall(stream, attribute, polls)
    }
}

impl ChunkSource for QueuedChunkSource {
    fn stream_count(&self) -> usize { self.boxes.streams }

    fn next_position(&mut self, stream: StreamId, attribute: AttributeId) -> Result<Pull<Coordinates>> {
        Ok(self.boxes.get(stream, attribute)?.peek().map(|c| c.first_position(false)))
    }

    fn next_fragment(&mut self, stream: StreamId, attribute: AttributeId) -> Result<Pull<Chunk>> {
        Ok(self.boxes.get(stream, attribute)?.take())
    }
}

// ── WireChunkSource ───────────────────────────────────────────────────────────

pub struct WireChunkSource {
    desc:  ArrayDesc,
    boxes: Mailboxes<Vec<u8>>,
}

impl WireChunkSource {
    pub fn new(desc: ArrayDesc, streams: usize) -> Self {
        let attributes = desc.num_attributes();
        Self { desc, boxes: Mailboxes::new(streams, attributes) }
    }

    pub fn desc(&self) -> &ArrayDesc { &self.desc }

    /// 传输层送达一个负载；首部在此校验
    pub fn deliver(&mut self, stream: StreamId, attribute: AttributeId, payload: Vec<u8>) -> Result<()> {
        decode_header(&payload, self.desc.num_dimensions())?;
        trace!(stream, attribute, bytes = payload.len(), "chunk payload delivered");
        self.boxes.push(stream, attribute, payload)
    }

    pub fn close(&mut self, stream: StreamId, attribute: AttributeId) -> Result<()> {
        self.boxes.close(stream, attribute)
    }

    pub fn close_all(&mut self) { self.boxes.close_all() }

    pub fn stall(&mut self, stream: StreamId, attribute: AttributeId, polls: usize) -> Result<()> {
        self.boxes.stall(stream, attribute, polls)
    }
}

impl ChunkSource for WireChunkSource {
    fn stream_count(&self) -> usize { self.boxes.streams }

    fn next_position(&mut self, stream: StreamId, attribute: AttributeId) -> Result<Pull<Coordinates>> {
        let n_dims = self.desc.num_dimensions();
        match self.boxes.get(stream, attribute)?.peek() {
            Pull::Ready(payload) => Ok(Pull::Ready(decode_header(payload, n_dims)?.coords)),
            Pull::NotReady       => Ok(Pull::NotReady),
            Pull::EndOfStream    => Ok(Pull::EndOfStream),
        }
    }

    fn next_fragment(&mut self, stream: StreamId, attribute: AttributeId) -> Result<Pull<Chunk>> {
        match self.boxes.get(stream, attribute)?.take() {
            Pull::Ready(payload) => Ok(Pull::Ready(decode_chunk(&payload, &self.desc, attribute)?)),
            Pull::NotReady       => Ok(Pull::NotReady),
            Pull::EndOfStream    => Ok(Pull::EndOfStream),
        }
    }
}
