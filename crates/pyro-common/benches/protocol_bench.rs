// Criterion benchmarks for the pyro-common wire codec
//
// Run benchmarks with:
//   cargo bench -p pyro-common
//
// For detailed output with plots:
//   cargo bench -p pyro-common -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pyro_common::protocol::{Annotations, Flags, Message, MessageType, WireOptions, HEADER_SIZE};
use pyro_common::{JsonSerializer, Serializer};
use serde_json::{json, Map};

fn invoke_message(payload: Vec<u8>) -> Message {
    let mut annotations = Annotations::new();
    annotations
        .insert(Annotations::CORRELATION_ID, uuid::Uuid::nil().as_bytes().to_vec())
        .unwrap();
    Message::new(MessageType::Invoke, payload, JsonSerializer::ID, Flags::EMPTY, 42)
        .with_annotations(annotations)
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_encode");
    let plain = WireOptions::default();
    let compressed = WireOptions { compression: true, ..WireOptions::default() };

    let small = invoke_message(br#"{"object":"calc","method":"multiply","args":[7,6],"kwargs":{}}"#.to_vec());
    let large = invoke_message(json!({"data": vec!["item"; 10_000]}).to_string().into_bytes());

    group.bench_function("encode_small", |b| {
        b.iter(|| black_box(&small).to_bytes(black_box(&plain)));
    });

    group.bench_function("encode_large", |b| {
        b.iter(|| black_box(&large).to_bytes(black_box(&plain)));
    });

    group.bench_function("encode_large_compressed", |b| {
        b.iter(|| black_box(&large).to_bytes(black_box(&compressed)));
    });

    group.finish();
}

fn bench_decode_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_decode");
    let bytes = invoke_message(b"payload".to_vec())
        .to_bytes(&WireOptions::default())
        .unwrap();

    group.bench_function("decode_header", |b| {
        b.iter(|| Message::decode_header(black_box(&bytes[..HEADER_SIZE])));
    });

    group.finish();
}

fn bench_call_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("call_serialization");
    let serializer = JsonSerializer;
    let args = vec![json!(7), json!(6)];
    let kwargs = Map::new();
    let encoded = serializer.dumps_call("calc", "multiply", &args, &kwargs).unwrap();

    group.bench_function("dumps_call", |b| {
        b.iter(|| serializer.dumps_call(black_box("calc"), black_box("multiply"), &args, &kwargs));
    });

    group.bench_function("loads_call", |b| {
        b.iter(|| serializer.loads_call(black_box(&encoded)));
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode_header, bench_call_serialization);
criterion_main!(benches);
