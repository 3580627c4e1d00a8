//! 全局基础类型与错误定义

use thiserror::Error;

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

pub type AttributeId = u32;
pub type StreamId    = usize;
pub type Coordinate  = i64;
pub type Coordinates = Vec<Coordinate>;
/// chunk 逻辑空间内的行主序线性位置
pub type Position    = u64;

/// `{1, 2, 3}` 形式的坐标串，用于日志与错误信息
pub fn coords_to_string(coords: &[Coordinate]) -> String {
    let parts: Vec<String> = coords.iter().map(|c| c.to_string()).collect();
    format!("{{{}}}", parts.join(", "))
}

// ── Pull ──────────────────────────────────────────────────────────────────────

/// 协作式拉取的结果
///
/// `NotReady` 不是错误：数据尚未到达，调用方稍后重试即可。
#[derive(Debug, Clone, PartialEq)]
pub enum Pull<T> {
    Ready(T),
    NotReady,
    EndOfStream,
}

impl<T> Pull<T> {
    pub fn is_ready(&self)     -> bool { matches!(self, Self::Ready(_)) }
    pub fn is_not_ready(&self) -> bool { matches!(self, Self::NotReady) }
    pub fn is_end(&self)       -> bool { matches!(self, Self::EndOfStream) }

    pub fn ready(self) -> Option<T> {
        match self { Self::Ready(v) => Some(v), _ => None }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Pull<U> {
        match self {
            Self::Ready(v)    => Pull::Ready(f(v)),
            Self::NotReady    => Pull::NotReady,
            Self::EndOfStream => Pull::EndOfStream,
        }
    }
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    // 调用方违约（不可重试）
    #[error("no current element")]
    NoCurrentElement,
    #[error("position {0} is outside chunk bounds")]
    OutOfBounds(String),
    #[error("chunk at {0} is finalized")]
    ChunkFinalized(String),
    #[error("chunk at {0} is not flushed")]
    ChunkNotFlushed(String),
    #[error("truncation: value of {size} bytes does not fit attribute of {capacity} bytes")]
    Truncation { size: usize, capacity: usize },
    #[error("null value assigned to non-nullable attribute '{0}'")]
    NullNotAllowed(String),
    #[error("invalid missing reason {0}, must be < 128")]
    InvalidMissingReason(u32),
    #[error("sequential write violated: position {next} after {prev}")]
    NotSequential { prev: Position, next: Position },
    #[error("tile mode is not enabled on this iterator")]
    TileModeDisabled,

    // 数据完整性（不可重试，需中止整个分布式操作）
    #[error("data collision in chunk at {chunk} for attribute {attribute}")]
    DataCollision { chunk: String, attribute: AttributeId },
    #[error("chunk position {0} is received out of (row-major) order")]
    PositionOutOfOrder(String),
    #[error("fragment at {got} does not belong to chunk at {expected}")]
    FragmentMismatch { expected: String, got: String },
    #[error("merged chunk of {size} bytes exceeds limit of {limit} bytes")]
    ChunkTooLarge { size: usize, limit: usize },
    #[error("cannot fetch chunk body: stream={stream} attribute={attribute}")]
    CantFetchChunkBody { stream: StreamId, attribute: AttributeId },
    #[error("no fragment merged for attribute {0}")]
    NothingMerged(AttributeId),
    #[error("attribute rows out of sync: {0}")]
    RowDesync(String),

    // 资源
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("operation cancelled")]
    Cancelled,

    // 所有权 / 目录
    #[error("chunk handle {0} not found")]
    ChunkNotFound(usize),
    #[error("chunk already exists at {0}")]
    ChunkExists(String),
    #[error("chunk at {0} is pinned")]
    ChunkPinned(String),
    #[error("attribute not found: {0}")]
    AttributeNotFound(AttributeId),
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),
    #[error("stream {stream} is closed for attribute {attribute}")]
    StreamClosed { stream: StreamId, attribute: AttributeId },
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    // 编解码 / 配置
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// 完整性类错误：部分输出可能已对外可见，必须中止整个操作
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::DataCollision { .. } | Self::PositionOutOfOrder(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// 以 `try_reserve` 扩容，失败映射为 `ResourceExhausted`
pub(crate) fn reserve<T>(buf: &mut Vec<T>, additional: usize) -> Result<()> {
    buf.try_reserve(additional)
        .map_err(|e| EngineError::ResourceExhausted(format!("{e} (+{additional})")))
}
