#![allow(dead_code)]

use std::sync::Once;

use array_chunk_engine::{
    ArrayDesc, AttributeDesc, Chunk, DimensionDesc, EncodingKind, EngineConfig, FieldType,
    IterationMode, Value,
};

static INIT: Once = Once::new();

/// `RUST_LOG=array_chunk_engine=trace cargo test` 查看合并过程
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// 2 维 Int64 数组，chunk 为 4 × 4
pub fn grid(emptyable: bool) -> ArrayDesc {
    let desc = ArrayDesc::new(
        "grid",
        vec![DimensionDesc::new("x", 0, 15, 4), DimensionDesc::new("y", 0, 15, 4)],
        vec![AttributeDesc::new(0, "v", FieldType::Int64)],
    );
    if emptyable { desc.emptyable() } else { desc }
}

/// 在 `origin` 所在 chunk 写入给定单元
pub fn chunk_with(desc: &ArrayDesc, kind: EncodingKind, origin: &[i64], cells: &[(Vec<i64>, i64)]) -> Chunk {
    let cd = desc.chunk_descriptor(0, origin).unwrap();
    let mut chunk = Chunk::new(cd, desc.attributes[0].clone(), desc.emptyable, kind).unwrap();
    let mut w = chunk.writer(IterationMode::empty(), &EngineConfig::default()).unwrap();
    for (coords, v) in cells {
        w.write_at(coords, Value::from_i64(*v)).unwrap();
    }
    w.flush().unwrap();
    chunk
}
