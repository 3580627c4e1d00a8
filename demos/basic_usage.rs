//! # array-chunk-engine 使用案例
//!
//! 1. 定义二维可空数组，在 MemArray 中创建三种编码的 chunk
//! 2. 按模式过滤迭代、Tile 批量读取
//! 3. chunk 编码为线上负载
//! 4. 三个来源各持一部分片段，经 StreamMerger 有序合并
//! 5. SinglePassArray 横向消费

use array_chunk_engine::{
    AttributeDesc, ArrayDesc, Chunk, ChunkSource, CompressionType, DimensionDesc, EncodingKind,
    EngineConfig, EngineError, FieldType, IterationMode, MemArray, MemRowProducer, Pull, SinglePassArray,
    StreamMerger, TaskContext, Value, WireChunkSource,
};
use array_chunk_engine::common::{coords_to_string, Result};
use array_chunk_engine::wire::encode_chunk;

fn schema() -> ArrayDesc {
    ArrayDesc::new(
        "sensor",
        vec![
            DimensionDesc::new("day", 0, 29, 10),
            DimensionDesc::new("slot", 0, 23, 8),
        ],
        vec![
            AttributeDesc::new(0, "temp", FieldType::Float64).with_compression(CompressionType::Lz4),
            AttributeDesc::new(1, "note", FieldType::Bytes).nullable(),
        ],
    )
    .emptyable()
}

fn main() -> Result<()> {
    println!("═══════════════════════════════════════════════════════════");
    println!("   array-chunk-engine 演示                                 ");
    println!("═══════════════════════════════════════════════════════════\n");

    let config = EngineConfig::from_env()?;
    let desc = schema();

    // =========================================================================
    // 1. 创建 chunk
    // =========================================================================
    println!("【1】在 MemArray 中创建 chunk ...");
    let mut array = MemArray::new(desc.clone(), config.clone());
    let kinds = [EncodingKind::Plain, EncodingKind::Sparse, EncodingKind::Rle];
    for (i, kind) in kinds.into_iter().enumerate() {
        let origin = [0, (i as i64) * 8];
        let h = array.create_chunk(0, &origin, kind)?;
        let mut w = array.writer(h, IterationMode::SEQUENTIAL_WRITE)?;
        for day in 0..10 {
            w.write_at(&[day, origin[1] + day % 8], Value::from_f64(20.0 + day as f64 / 2.0))?;
        }
        w.flush()?;
        let chunk = array.chunk(h)?;
        println!("    {:<7?} {}  count={} packed={}B",
                 kind, chunk.descriptor(), chunk.count(), chunk.packed_size());
    }
    println!();

    // =========================================================================
    // 2. 迭代
    // =========================================================================
    println!("【2】迭代 RLE chunk ...");
    let h = array.handle_of(0, &[0, 16]).ok_or_else(|| EngineError::OutOfBounds(coords_to_string(&[0, 16])))?;
    for cell in array.chunk(h)?.cells(IterationMode::IGNORE_EMPTY_CELLS)? {
        let (coords, v) = cell?;
        print!(" {}={:.1}", coords_to_string(&coords), v.as_f64().unwrap_or_default());
    }
    println!();
    let tiles = array.tiles(h, IterationMode::IGNORE_EMPTY_CELLS)?;
    println!("    {} 个 tile (tile_size={})\n", tiles.len(), config.tile_size);

    // =========================================================================
    // 3. 线上编码
    // =========================================================================
    println!("【3】编码为线上负载 ...");
    let mut payloads = Vec::new();
    for (_, chunk) in array.chunks(0) {
        let p = encode_chunk(chunk)?;
        println!("    {} → {} 字节", chunk.descriptor(), p.len());
        payloads.push(p);
    }
    println!("    合计 {} 字节\n", payloads.iter().map(Vec::len).sum::<usize>());

    // =========================================================================
    // 4. 多来源合并
    // =========================================================================
    println!("【4】三个来源，片段交错到达 ...");
    let mut source = WireChunkSource::new(desc.clone(), 3);
    // 来源 s 持有 day ≡ s (mod 3) 的单元
    for s in 0..3usize {
        let mut frag = fragment(&desc, &[0, 0], |day| day as usize % 3 == s)?;
        source.deliver(s, 0, encode_chunk(&frag)?)?;
        frag = fragment(&desc, &[10, 8], |day| day as usize % 3 == s)?;
        source.deliver(s, 0, encode_chunk(&frag)?)?;
    }
    source.stall(2, 0, 1)?;
    source.close_all();
    println!("    streams = {}", source.stream_count());

    let mut merger = StreamMerger::new(&desc, source, &config, TaskContext::new());
    loop {
        match merger.pull(0)? {
            Pull::Ready(chunk) => println!("    ✓ {}  count={}", chunk.descriptor(), chunk.count()),
            Pull::NotReady     => println!("    … 来源未就绪，重试"),
            Pull::EndOfStream  => break,
        }
    }
    println!();

    // =========================================================================
    // 5. 横向消费
    // =========================================================================
    println!("【5】SinglePassArray 横向消费 ...");
    let mut producer = MemRowProducer::new(1);
    for row in 0..3 {
        producer.push_row(vec![fragment(&desc, &[row * 10, 0], |_| row != 1)?])?;
    }
    let mut sp = SinglePassArray::new(producer, 1).with_horizontal_enforcement(true);
    while let Pull::Ready(chunk) = sp.next_chunk(0)? {
        println!("    row {}: {}", sp.current_row(), chunk.descriptor());
    }

    println!("\n═══════════════════════════════════════════════════════════");
    println!("   演示完成                                                 ");
    println!("═══════════════════════════════════════════════════════════");
    Ok(())
}

/// `origin` 处 chunk 的一个片段，只含 `keep(day)` 为真的对角线单元
fn fragment(desc: &ArrayDesc, origin: &[i64], keep: impl Fn(i64) -> bool) -> Result<Chunk> {
    let cd = desc.chunk_descriptor(0, origin)?;
    let mut chunk = Chunk::new(cd, desc.attribute(0)?.clone(), desc.emptyable, EncodingKind::Sparse)?;
    let mut w = chunk.writer(IterationMode::empty(), &EngineConfig::default())?;
    for day in origin[0]..origin[0] + 8 {
        if keep(day) {
            w.write_at(&[day, origin[1] + (day - origin[0])], Value::from_f64(day as f64))?;
        }
    }
    w.flush()?;
    Ok(chunk)
}
