//! 属性的物理字段类型、压缩方式与单元值

use crate::common::{AttributeId, EngineError, Result};

/// 属性在 chunk 中的存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// 1-bit，Plain / RLE 中按位打包
    Bool,
    Int8, Int16, Int32, Int64,
    Float32, Float64,
    /// 变长字节（String / Blob）
    Bytes,
}

impl FieldType {
    /// 固定字节宽度；变长类型返回 None
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Bool | Self::Int8      => Some(1),
            Self::Int16                  => Some(2),
            Self::Int32 | Self::Float32  => Some(4),
            Self::Int64 | Self::Float64  => Some(8),
            Self::Bytes                  => None,
        }
    }
    pub fn is_bool(self) -> bool { self == Self::Bool }

    /// 该类型的零值，用作默认默认值
    pub fn zero_value(self) -> Value {
        match self.fixed_size() {
            Some(n) => Value::Data(vec![0u8; n]),
            None    => Value::Data(Vec::new()),
        }
    }
}

/// 压缩方式；数值即线上格式中的 `compression method`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionType {
    None,
    Lz4,
}

impl CompressionType {
    pub fn code(self) -> i32 {
        match self { Self::None => 0, Self::Lz4 => 1 }
    }
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            _ => Err(EngineError::Compression(format!("unknown compression method {code}"))),
        }
    }
}

// ── MissingReason ─────────────────────────────────────────────────────────────

pub const MAX_MISSING_REASON: u8 = 127;

/// null 的原因码，0..=127
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MissingReason(u8);

impl MissingReason {
    pub const DEFAULT: Self = Self(0);

    pub fn new(code: u32) -> Result<Self> {
        if code > MAX_MISSING_REASON as u32 {
            return Err(EngineError::InvalidMissingReason(code));
        }
        Ok(Self(code as u8))
    }
    pub fn code(self) -> u8 { self.0 }
}

// ── Value ─────────────────────────────────────────────────────────────────────

/// 单元值：要么是原始字节负载，要么是带原因码的 null
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Missing(MissingReason),
    Data(Vec<u8>),
}

impl Value {
    pub fn null() -> Self { Self::Missing(MissingReason::DEFAULT) }

    pub fn missing(code: u32) -> Result<Self> {
        Ok(Self::Missing(MissingReason::new(code)?))
    }

    pub fn from_bool(v: bool)   -> Self { Self::Data(vec![v as u8]) }
    pub fn from_i8(v: i8)       -> Self { Self::Data(v.to_le_bytes().to_vec()) }
    pub fn from_i16(v: i16)     -> Self { Self::Data(v.to_le_bytes().to_vec()) }
    pub fn from_i32(v: i32)     -> Self { Self::Data(v.to_le_bytes().to_vec()) }
    pub fn from_i64(v: i64)     -> Self { Self::Data(v.to_le_bytes().to_vec()) }
    pub fn from_f32(v: f32)     -> Self { Self::Data(v.to_le_bytes().to_vec()) }
    pub fn from_f64(v: f64)     -> Self { Self::Data(v.to_le_bytes().to_vec()) }
    pub fn from_bytes(b: &[u8]) -> Self { Self::Data(b.to_vec()) }
    pub fn from_text(s: &str)   -> Self { Self::Data(s.as_bytes().to_vec()) }

    pub fn is_null(&self) -> bool { matches!(self, Self::Missing(_)) }

    pub fn missing_reason(&self) -> Option<MissingReason> {
        match self { Self::Missing(r) => Some(*r), Self::Data(_) => None }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self { Self::Data(b) => Some(b), Self::Missing(_) => None }
    }

    /// 负载字节数；null 为 0
    pub fn size(&self) -> usize {
        self.as_bytes().map_or(0, |b| b.len())
    }

    /// 按负载宽度（1/2/4/8 字节，小端）做有符号整数解释
    pub fn as_i64(&self) -> Option<i64> {
        let b = self.as_bytes()?;
        match b.len() {
            1 => Some(b[0] as i8 as i64),
            2 => Some(i16::from_le_bytes([b[0], b[1]]) as i64),
            4 => Some(i32::from_le_bytes(b.try_into().ok()?) as i64),
            8 => Some(i64::from_le_bytes(b.try_into().ok()?)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        let b = self.as_bytes()?;
        match b.len() {
            4 => Some(f32::from_le_bytes(b.try_into().ok()?) as f64),
            8 => Some(f64::from_le_bytes(b.try_into().ok()?)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_bytes().and_then(|b| b.first()).map(|&x| x != 0)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(r) => write!(f, "?{}", r.code()),
            Self::Data(b) if b.len() == 8 => write!(f, "{}", i64::from_le_bytes(
                [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])),
            Self::Data(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

// ── AttributeDesc ─────────────────────────────────────────────────────────────

/// 属性描述：chunk 的值类型、可空性与默认值
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDesc {
    pub id:            AttributeId,
    pub name:          String,
    pub field_type:    FieldType,
    pub is_nullable:   bool,
    pub default_value: Value,
    pub compression:   CompressionType,
}

impl AttributeDesc {
    pub fn new(id: AttributeId, name: &str, field_type: FieldType) -> Self {
        Self {
            id, name: name.into(), field_type,
            is_nullable: false,
            default_value: field_type.zero_value(),
            compression: CompressionType::None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.is_nullable = true; self
    }
    pub fn with_default(mut self, v: Value) -> Self {
        self.default_value = v; self
    }
    pub fn with_compression(mut self, comp: CompressionType) -> Self {
        self.compression = comp; self
    }

    pub fn byte_size(&self) -> Option<usize> { self.field_type.fixed_size() }

    /// 校验写入值并补齐固定宽度（短负载右侧补零）
    pub fn normalize(&self, v: Value) -> Result<Value> {
        match v {
            Value::Missing(_) if !self.is_nullable => {
                Err(EngineError::NullNotAllowed(self.name.clone()))
            }
            Value::Missing(_) => Ok(v),
            Value::Data(mut bytes) => {
                if let Some(cap) = self.byte_size() {
                    if bytes.len() > cap {
                        return Err(EngineError::Truncation { size: bytes.len(), capacity: cap });
                    }
                    bytes.resize(cap, 0);
                }
                Ok(Value::Data(bytes))
            }
        }
    }

    /// 默认值按字段宽度补齐后的形式；null 默认值原样返回
    pub fn normalized_default(&self) -> Value {
        match &self.default_value {
            Value::Missing(_) => self.default_value.clone(),
            Value::Data(b) => {
                let mut bytes = b.clone();
                if let Some(cap) = self.byte_size() {
                    bytes.resize(cap, 0);
                }
                Value::Data(bytes)
            }
        }
    }
}
