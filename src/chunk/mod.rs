//! Chunk：一个属性在一块矩形坐标区域（含 overlap）上的存储单元
//!
//! 三种互斥编码，在创建时选定：
//! - **Plain**  — 覆盖整个逻辑空间的定位数组（bool 按位打包），可选 null bitmap
//! - **Sparse** — 仅保存非默认单元的 (position, offset, is_null) 有序条目
//! - **RLE**    — 同值 run 段 + 值字典，另附 empty bitmap
//!
//! 生命周期：
//! ```text
//!   Chunk::new ──► writer() ──► write()* ──► flush() ──► Flushed（只读）
//!                     ▲                                     │
//!                     └──────── writer(APPEND_EXISTING) ◄───┘
//! ```

pub mod varpart;
pub mod plain;
pub mod sparse;
pub mod rle;
pub mod iter;
pub mod writer;

use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bitmap::EmptyBitmap;
use crate::common::{
    reserve, AttributeId, Coordinate, Coordinates, EngineError, Position, Result,
};
use crate::config::EngineConfig;
use crate::field_type::{AttributeDesc, MissingReason, Value};
use crate::mapper::PositionMapper;
use crate::meta::ChunkDescriptor;

pub use iter::{Cells, ChunkIter, ConstChunkIterator, IterationMode, Tile};
pub use plain::PlainBody;
pub use rle::{RleBody, RlePayload, RleSegment};
pub use sparse::{SparseBody, SparseEntry};
pub use writer::ChunkWriter;

pub const PLAIN_MAGIC:  u64 = 0xAAAA_0001_CCCC_0001;
pub const SPARSE_MAGIC: u64 = 0xAAAA_0001_CCCC_0002;
pub const RLE_MAGIC:    u64 = 0xAAAA_0001_CCCC_0003;

// ── 编码种类 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodingKind {
    Plain,
    Sparse,
    Rle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// 写会话进行中或尚未 flush
    Writing,
    Flushed,
}

// ── 单元槽布局 ────────────────────────────────────────────────────────────────

/// 单元在定长区中的占位方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLayout {
    /// 1 bit / 单元
    Bit,
    /// 定宽字节
    Fixed(usize),
    /// 4 字节 var part 偏移
    Var,
}

impl SlotLayout {
    pub fn of(attr: &AttributeDesc) -> Self {
        if attr.field_type.is_bool() {
            Self::Bit
        } else {
            attr.byte_size().map_or(Self::Var, Self::Fixed)
        }
    }

    /// n 个槽所需的定长区字节数
    pub fn area_len(self, n: u64) -> u64 {
        match self {
            Self::Bit      => (n + 7) / 8,
            Self::Fixed(k) => n * k as u64,
            Self::Var      => n * 4,
        }
    }

    fn tag(self) -> (u8, u32) {
        match self {
            Self::Bit      => (0, 1),
            Self::Fixed(k) => (1, k as u32),
            Self::Var      => (2, 0),
        }
    }

    fn write<W: Write>(self, out: &mut W) -> Result<()> {
        let (tag, elem) = self.tag();
        out.write_u8(tag)?;
        out.write_u32::<LittleEndian>(elem)?;
        Ok(())
    }

    fn read<R: Read>(rd: &mut R) -> Result<Self> {
        let tag  = rd.read_u8()?;
        let elem = rd.read_u32::<LittleEndian>()?;
        match tag {
            0 => Ok(Self::Bit),
            1 => Ok(Self::Fixed(elem as usize)),
            2 => Ok(Self::Var),
            _ => Err(EngineError::Encoding(format!("unknown slot layout {tag}"))),
        }
    }

    fn expect<R: Read>(rd: &mut R, expected: SlotLayout) -> Result<()> {
        let got = Self::read(rd)?;
        if got != expected {
            return Err(EngineError::SchemaMismatch(format!(
                "chunk body layout {got:?}, attribute expects {expected:?}")));
        }
        Ok(())
    }
}

pub(crate) fn to_usize(n: u64) -> Result<usize> {
    usize::try_from(n).map_err(|_| EngineError::ResourceExhausted(format!("{n} bytes")))
}

// ── 槽区：定长区 + var part ──────────────────────────────────────────────────

/// Plain 的定位数组与 RLE 的值字典共用的存储
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotArea {
    layout: SlotLayout,
    n:      u64,
    fixed:  Vec<u8>,
    var:    Vec<u8>,
}

impl SlotArea {
    pub(crate) fn new(layout: SlotLayout) -> Self {
        Self { layout, n: 0, fixed: Vec::new(), var: Vec::new() }
    }

    /// n 个槽，全部预填 `default`
    pub(crate) fn filled(layout: SlotLayout, n: u64, default: &Value) -> Result<Self> {
        let len = to_usize(layout.area_len(n))?;
        let mut area = Self::new(layout);
        reserve(&mut area.fixed, len)?;
        match (layout, default) {
            (SlotLayout::Bit, Value::Data(b)) => {
                let fill = if b.first().copied().unwrap_or(0) != 0 { 0xFF } else { 0 };
                area.fixed.resize(len, fill);
            }
            (SlotLayout::Fixed(k), Value::Data(b)) => {
                for _ in 0..n {
                    area.fixed.extend_from_slice(&b[..k.min(b.len())]);
                    area.fixed.resize(area.fixed.len() + k.saturating_sub(b.len()), 0);
                }
            }
            (SlotLayout::Var, Value::Data(b)) => {
                // 所有槽共享偏移 0 处的默认值
                varpart::push_datum(&mut area.var, b)?;
                area.fixed.resize(len, 0);
            }
            (_, Value::Missing(_)) => area.fixed.resize(len, 0),
        }
        area.n = n;
        if let Value::Missing(r) = default {
            for idx in 0..n {
                area.set_reason(idx, *r);
            }
        }
        Ok(area)
    }

    pub fn layout(&self) -> SlotLayout { self.layout }
    pub fn len(&self) -> u64 { self.n }
    pub fn is_empty(&self) -> bool { self.n == 0 }

    fn check(&self, idx: u64) -> Result<usize> {
        if idx >= self.n {
            return Err(EngineError::Encoding(format!("slot {idx} out of range (n={})", self.n)));
        }
        to_usize(idx)
    }

    /// 追加一个值，返回其槽下标
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<u64> {
        let idx = self.n;
        let need = match self.layout {
            SlotLayout::Bit      => if idx % 8 == 0 { 1 } else { 0 },
            SlotLayout::Fixed(k) => k,
            SlotLayout::Var      => 4,
        };
        if self.fixed.len() + need > self.fixed.capacity() {
            let cap = self.fixed.capacity();
            reserve(&mut self.fixed, need.max(cap))?;
        }
        self.fixed.resize(self.fixed.len() + need, 0);
        self.n += 1;
        self.set(idx, bytes)?;
        Ok(idx)
    }

    pub(crate) fn set(&mut self, idx: u64, bytes: &[u8]) -> Result<()> {
        let i = self.check(idx)?;
        match self.layout {
            SlotLayout::Bit => {
                let mask = 1u8 << (i & 7);
                if bytes.first().copied().unwrap_or(0) != 0 {
                    self.fixed[i >> 3] |= mask;
                } else {
                    self.fixed[i >> 3] &= !mask;
                }
            }
            SlotLayout::Fixed(k) => {
                let slot = &mut self.fixed[i * k..(i + 1) * k];
                let n = k.min(bytes.len());
                slot[..n].copy_from_slice(&bytes[..n]);
                slot[n..].fill(0);
            }
            SlotLayout::Var => {
                let off = varpart::push_datum(&mut self.var, bytes)?;
                self.fixed[i * 4..i * 4 + 4].copy_from_slice(&off.to_le_bytes());
            }
        }
        Ok(())
    }

    /// null 单元在槽内记录原因码；bool 槽无处可记，由 PlainBody 另存
    pub(crate) fn set_reason(&mut self, idx: u64, reason: MissingReason) {
        let Ok(i) = self.check(idx) else { return };
        match self.layout {
            SlotLayout::Bit => {}
            SlotLayout::Fixed(k) => {
                let slot = &mut self.fixed[i * k..(i + 1) * k];
                slot.fill(0);
                if k > 0 { slot[0] = reason.code(); }
            }
            SlotLayout::Var => {
                self.fixed[i * 4..i * 4 + 4].copy_from_slice(&(reason.code() as u32).to_le_bytes());
            }
        }
    }

    pub fn get(&self, idx: u64) -> Result<Vec<u8>> {
        let i = self.check(idx)?;
        Ok(match self.layout {
            SlotLayout::Bit      => vec![(self.fixed[i >> 3] >> (i & 7)) & 1],
            SlotLayout::Fixed(k) => self.fixed[i * k..(i + 1) * k].to_vec(),
            SlotLayout::Var      => {
                let off = u32::from_le_bytes(self.slot4(i));
                varpart::read_datum(&self.var, off)?.to_vec()
            }
        })
    }

    pub fn reason(&self, idx: u64) -> Result<MissingReason> {
        let i = self.check(idx)?;
        match self.layout {
            SlotLayout::Bit      => Ok(MissingReason::DEFAULT),
            SlotLayout::Fixed(k) => MissingReason::new(if k > 0 { self.fixed[i * k] as u32 } else { 0 }),
            SlotLayout::Var      => MissingReason::new(u32::from_le_bytes(self.slot4(i))),
        }
    }

    fn slot4(&self, i: usize) -> [u8; 4] {
        let s = &self.fixed[i * 4..i * 4 + 4];
        [s[0], s[1], s[2], s[3]]
    }

    pub(crate) fn eq_at(&self, idx: u64, bytes: &[u8]) -> Result<bool> {
        Ok(self.get(idx)? == bytes)
    }

    pub fn packed_size(&self) -> usize {
        5 + 24 + self.fixed.len() + self.var.len()
    }

    pub(crate) fn pack<W: Write>(&self, out: &mut W) -> Result<()> {
        self.layout.write(out)?;
        out.write_u64::<LittleEndian>(self.n)?;
        out.write_u64::<LittleEndian>(self.fixed.len() as u64)?;
        out.write_u64::<LittleEndian>(self.var.len() as u64)?;
        out.write_all(&self.fixed)?;
        out.write_all(&self.var)?;
        Ok(())
    }

    pub(crate) fn unpack<R: Read>(rd: &mut R, expected: SlotLayout) -> Result<Self> {
        SlotLayout::expect(rd, expected)?;
        let n         = rd.read_u64::<LittleEndian>()?;
        let fixed_len = rd.read_u64::<LittleEndian>()?;
        let var_len   = rd.read_u64::<LittleEndian>()?;
        if fixed_len != expected.area_len(n) {
            return Err(EngineError::Encoding(format!(
                "slot area of {n} slots cannot be {fixed_len} bytes")));
        }
        let fixed = read_vec(rd, fixed_len)?;
        let var   = read_vec(rd, var_len)?;
        Ok(Self { layout: expected, n, fixed, var })
    }
}

pub(crate) fn read_vec<R: Read>(rd: &mut R, len: u64) -> Result<Vec<u8>> {
    let len = to_usize(len)?;
    let mut buf = Vec::new();
    reserve(&mut buf, len)?;
    buf.resize(len, 0);
    rd.read_exact(&mut buf)?;
    Ok(buf)
}

// ── 单元读取接口 ──────────────────────────────────────────────────────────────

/// 各编码对逻辑位置的读取能力，由 [`ChunkIter`] 统一驱动
pub trait CellSource {
    /// 物理上保存的值；None 表示该位置取默认值
    fn value_at(&self, pos: Position) -> Result<Option<Value>>;

    /// `>= pos` 的第一个可能不是默认值的位置
    fn next_non_default(&self, pos: Position) -> Option<Position> {
        Some(pos)
    }

    fn bitmap(&self) -> Option<&EmptyBitmap>;
}

// ── ChunkBody ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkBody {
    Plain(PlainBody),
    Sparse(SparseBody),
    Rle(RleBody),
}

impl ChunkBody {
    pub(crate) fn empty(
        kind:      EncodingKind,
        layout:    SlotLayout,
        n:         u64,
        default:   &Value,
        emptyable: bool,
    ) -> Result<Self> {
        Ok(match kind {
            EncodingKind::Plain  => Self::Plain(PlainBody::new(layout, n, default, emptyable)?),
            EncodingKind::Sparse => Self::Sparse(SparseBody::new(layout, emptyable, 0)),
            EncodingKind::Rle    => Self::Rle(RleBody::new(layout)),
        })
    }

    pub fn kind(&self) -> EncodingKind {
        match self {
            Self::Plain(_)  => EncodingKind::Plain,
            Self::Sparse(_) => EncodingKind::Sparse,
            Self::Rle(_)    => EncodingKind::Rle,
        }
    }

    pub fn bitmap(&self) -> Option<&EmptyBitmap> {
        match self {
            Self::Plain(b)  => b.bitmap(),
            Self::Sparse(b) => b.bitmap(),
            Self::Rle(b)    => b.bitmap(),
        }
    }

    pub fn packed_size(&self) -> usize {
        match self {
            Self::Plain(b)  => b.packed_size(),
            Self::Sparse(b) => b.packed_size(),
            Self::Rle(b)    => b.packed_size(),
        }
    }

    pub fn pack<W: Write>(&self, out: &mut W) -> Result<()> {
        match self {
            Self::Plain(b)  => b.pack(out),
            Self::Sparse(b) => b.pack(out),
            Self::Rle(b)    => b.pack(out),
        }
    }

    /// 按首部 magic 识别编码
    pub fn unpack(data: &[u8], layout: SlotLayout, logical_size: u64) -> Result<Self> {
        let mut rd = Cursor::new(data);
        let magic = rd.read_u64::<LittleEndian>()?;
        let body = match magic {
            PLAIN_MAGIC  => Self::Plain(PlainBody::unpack(&mut rd, layout, logical_size)?),
            SPARSE_MAGIC => Self::Sparse(SparseBody::unpack(&mut rd, layout, logical_size)?),
            RLE_MAGIC    => Self::Rle(RleBody::unpack(&mut rd, layout, logical_size)?),
            _ => return Err(EngineError::Encoding(format!("unknown chunk magic {magic:#x}"))),
        };
        if rd.position() as usize != data.len() {
            return Err(EngineError::Encoding(format!(
                "{} trailing bytes after chunk body", data.len() - rd.position() as usize)));
        }
        Ok(body)
    }
}

// ── Chunk ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Chunk {
    desc:      ChunkDescriptor,
    attr:      AttributeDesc,
    emptyable: bool,
    mapper:    PositionMapper,
    /// 已按字段宽度补齐的默认值
    default:   Value,
    layout:    SlotLayout,
    body:      ChunkBody,
    state:     ChunkState,
    pins:      AtomicUsize,
}

impl Clone for Chunk {
    /// 副本不继承 pin
    fn clone(&self) -> Self {
        Self {
            desc:      self.desc.clone(),
            attr:      self.attr.clone(),
            emptyable: self.emptyable,
            mapper:    self.mapper.clone(),
            default:   self.default.clone(),
            layout:    self.layout,
            body:      self.body.clone(),
            state:     self.state,
            pins:      AtomicUsize::new(0),
        }
    }
}

impl Chunk {
    /// 空 chunk，处于 Writing 状态，等待首个写会话
    pub fn new(
        desc:      ChunkDescriptor,
        attr:      AttributeDesc,
        emptyable: bool,
        encoding:  EncodingKind,
    ) -> Result<Self> {
        let (mapper, default, layout) = Self::shape(&desc, &attr)?;
        let body = ChunkBody::empty(encoding, layout, mapper.logical_size(), &default, emptyable)?;
        Ok(Self {
            desc, attr, emptyable, mapper, default, layout, body,
            state: ChunkState::Writing,
            pins:  AtomicUsize::new(0),
        })
    }

    /// 由已打包的 body 字节恢复一个 Flushed chunk
    pub fn unpack(
        desc:      ChunkDescriptor,
        attr:      AttributeDesc,
        emptyable: bool,
        data:      &[u8],
    ) -> Result<Self> {
        let (mapper, default, layout) = Self::shape(&desc, &attr)?;
        let body = ChunkBody::unpack(data, layout, mapper.logical_size())?;
        if emptyable != body_is_emptyable(&body) {
            return Err(EngineError::SchemaMismatch(format!(
                "chunk {desc}: empty bitmap presence does not match array")));
        }
        Ok(Self {
            desc, attr, emptyable, mapper, default, layout, body,
            state: ChunkState::Flushed,
            pins:  AtomicUsize::new(0),
        })
    }

    fn shape(desc: &ChunkDescriptor, attr: &AttributeDesc) -> Result<(PositionMapper, Value, SlotLayout)> {
        if desc.attribute != attr.id {
            return Err(EngineError::SchemaMismatch(format!(
                "descriptor is for attribute {}, got attribute {}", desc.attribute, attr.id)));
        }
        let default = attr.normalize(attr.normalized_default())
            .map_err(|e| EngineError::SchemaMismatch(format!("default of '{}': {e}", attr.name)))?;
        Ok((desc.mapper(), default, SlotLayout::of(attr)))
    }

    pub fn descriptor(&self)    -> &ChunkDescriptor { &self.desc }
    pub fn attribute(&self)     -> &AttributeDesc   { &self.attr }
    pub fn attribute_id(&self)  -> AttributeId      { self.attr.id }
    pub fn mapper(&self)        -> &PositionMapper  { &self.mapper }
    pub fn default_value(&self) -> &Value           { &self.default }
    pub fn layout(&self)        -> SlotLayout       { self.layout }
    pub fn body(&self)          -> &ChunkBody       { &self.body }
    pub fn encoding(&self)      -> EncodingKind     { self.body.kind() }
    pub fn state(&self)         -> ChunkState       { self.state }
    pub fn is_flushed(&self)    -> bool             { self.state == ChunkState::Flushed }
    pub fn is_emptyable(&self)  -> bool             { self.emptyable }

    pub fn first_position(&self, with_overlap: bool) -> Coordinates {
        self.desc.first_position(with_overlap)
    }
    pub fn last_position(&self, with_overlap: bool) -> Coordinates {
        self.desc.last_position(with_overlap)
    }

    pub fn empty_bitmap(&self) -> Option<&EmptyBitmap> { self.body.bitmap() }

    /// 存在值的单元数
    pub fn count(&self) -> u64 {
        match self.body.bitmap() {
            Some(bm) => bm.count(),
            None     => self.mapper.bounded_size(),
        }
    }

    pub fn packed_size(&self) -> usize { self.body.packed_size() }

    fn label(&self) -> String { self.desc.to_string() }

    pub(crate) fn ensure_flushed(&self) -> Result<()> {
        if self.state != ChunkState::Flushed {
            return Err(EngineError::ChunkNotFlushed(self.label()));
        }
        Ok(())
    }

    /// 打包为持久化 / 线上 body 格式
    pub fn pack(&self) -> Result<Vec<u8>> {
        self.ensure_flushed()?;
        let mut out = Vec::new();
        reserve(&mut out, self.packed_size())?;
        self.body.pack(&mut out)?;
        Ok(out)
    }

    // ── 读 ────────────────────────────────────────────────────────────────────

    /// 按编码构造只读游标
    pub fn const_iterator(&self, mode: IterationMode) -> Result<Box<dyn ConstChunkIterator + '_>> {
        self.ensure_flushed()?;
        let it: Box<dyn ConstChunkIterator + '_> = match &self.body {
            ChunkBody::Plain(b)  => Box::new(ChunkIter::new(self, b, mode)?),
            ChunkBody::Sparse(b) => Box::new(ChunkIter::new(self, b, mode)?),
            ChunkBody::Rle(b)    => Box::new(ChunkIter::new(self, b, mode)?),
        };
        Ok(it)
    }

    /// 以 `(coords, value)` 迭代
    pub fn cells(&self, mode: IterationMode) -> Result<Cells<'_>> {
        Ok(Cells::new(self.const_iterator(mode)?))
    }

    /// 单个单元；位置不可寻址或为空时返回 None
    pub fn cell(&self, coords: &[Coordinate]) -> Result<Option<Value>> {
        self.ensure_flushed()?;
        let Some(pos) = self.mapper.coords_to_pos(coords) else { return Ok(None) };
        self.cell_at(pos)
    }

    pub(crate) fn cell_at(&self, pos: Position) -> Result<Option<Value>> {
        if let Some(bm) = self.body.bitmap() {
            if !bm.contains(pos) {
                return Ok(None);
            }
        }
        let stored = match &self.body {
            ChunkBody::Plain(b)  => b.value_at(pos)?,
            ChunkBody::Sparse(b) => b.value_at(pos)?,
            ChunkBody::Rle(b)    => b.value_at(pos)?,
        };
        Ok(Some(stored.unwrap_or_else(|| self.default.clone())))
    }

    // ── 写 ────────────────────────────────────────────────────────────────────

    /// 开启写会话；已 flush 的 chunk 必须带 `APPEND_EXISTING`
    pub fn writer(&mut self, mode: IterationMode, config: &EngineConfig) -> Result<ChunkWriter<'_>> {
        if self.state == ChunkState::Flushed && !mode.contains(IterationMode::APPEND_EXISTING) {
            return Err(EngineError::ChunkFinalized(self.label()));
        }
        ChunkWriter::open(self, mode, config)
    }

    pub(crate) fn install(&mut self, body: ChunkBody) {
        self.body  = body;
        self.state = ChunkState::Flushed;
    }

    pub(crate) fn set_state(&mut self, state: ChunkState) {
        self.state = state;
    }

    // ── Pin ───────────────────────────────────────────────────────────────────

    /// 引用计数式 pin；guard 释放时自动 unpin
    pub fn pin(&self) -> PinGuard<'_> {
        self.pins.fetch_add(1, Ordering::AcqRel);
        PinGuard { chunk: self }
    }

    pub fn pin_count(&self) -> usize { self.pins.load(Ordering::Acquire) }
    pub fn is_pinned(&self) -> bool { self.pin_count() > 0 }
}

fn body_is_emptyable(body: &ChunkBody) -> bool {
    match body {
        ChunkBody::Plain(b)  => b.bitmap().is_some(),
        ChunkBody::Sparse(b) => b.bitmap().is_some(),
        ChunkBody::Rle(b)    => b.is_emptyable(),
    }
}

pub struct PinGuard<'a> {
    chunk: &'a Chunk,
}

impl PinGuard<'_> {
    pub fn chunk(&self) -> &Chunk { self.chunk }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.chunk.pins.fetch_sub(1, Ordering::AcqRel);
    }
}
