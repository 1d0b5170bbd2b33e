//! Criterion benchmark untuk codec
//!
//! Run dengan: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use dbuslink::protocol::{FrameSplitter, SignatureCache};
use dbuslink::{BasicType, DbusValue, Message, TypeSignature};

fn properties_changed() -> Message {
    let changed = DbusValue::dict(
        BasicType::String,
        BasicType::Variant.into(),
        vec![
            (
                DbusValue::string("Volume"),
                DbusValue::variant(DbusValue::Uint32(42)),
            ),
            (
                DbusValue::string("Muted"),
                DbusValue::variant(DbusValue::Boolean(false)),
            ),
            (
                DbusValue::string("Name"),
                DbusValue::variant(DbusValue::string("Speakers")),
            ),
        ],
    )
    .unwrap();
    let invalidated = DbusValue::array(BasicType::String.into(), Vec::new()).unwrap();

    Message::signal(
        "/org/example/Audio",
        "org.freedesktop.DBus.Properties",
        "PropertiesChanged",
    )
    .unwrap()
    .with_body(vec![
        DbusValue::string("org.example.Audio"),
        changed,
        invalidated,
    ])
}

fn bench_signature(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature");
    group.throughput(Throughput::Elements(1));

    group.bench_function("parse", |b| {
        b.iter(|| TypeSignature::parse_many(black_box("sa{sv}as")).unwrap());
    });

    group.bench_function("serialize", |b| {
        let sig = TypeSignature::parse("a(oa{sa{sv}})").unwrap();
        b.iter(|| black_box(&sig).serialize());
    });

    group.finish();
}

fn bench_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("message");
    let message = properties_changed();
    let frame = message.encode(1).unwrap();
    group.throughput(Throughput::Bytes(frame.len() as u64));

    group.bench_function("encode", |b| {
        b.iter(|| black_box(&message).encode(black_box(7)).unwrap());
    });

    group.bench_function("decode", |b| {
        b.iter(|| Message::decode(black_box(&frame)).unwrap());
    });

    // Signatures repeat across a stream; the cache skips re-parsing them.
    group.bench_function("decode_cached", |b| {
        let cache = SignatureCache::new();
        b.iter(|| Message::decode_cached(black_box(&frame), &cache).unwrap());
    });

    group.finish();
}

fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_splitter");
    let one = properties_changed().encode(1).unwrap();
    let stream: Vec<u8> = one.iter().copied().cycle().take(one.len() * 64).collect();
    group.throughput(Throughput::Elements(64));

    group.bench_function("split_64", |b| {
        b.iter(|| FrameSplitter::new(black_box(&stream)).count());
    });

    group.finish();
}

criterion_group!(benches, bench_signature, bench_message, bench_split);
criterion_main!(benches);
