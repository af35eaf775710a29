//! Frame codec and record encoding throughput benchmarks.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio_util::codec::{Decoder, Encoder};

use zbc_client::{MsgPackCodec, Task};
use zbc_core::protocol::{
    EventType, ExecuteCommandRequest, Message, MessageCodec, SubscribedEvent, SubscriptionType,
};

fn command(payload_size: usize) -> Message {
    let task = Task::new("payment").with_payload(vec![0xa5; payload_size]);
    let command = Bytes::from(MsgPackCodec::encode(&task).unwrap());
    Message::request(
        42,
        ExecuteCommandRequest::new("orders", EventType::Task, command).with_partition(1),
    )
}

fn pushed_event(payload_size: usize) -> Message {
    let task = Task::new("payment").with_payload(vec![0x5a; payload_size]);
    Message::single(SubscribedEvent {
        partition_id: 1,
        position: 1024,
        key: 77,
        subscriber_key: 9,
        subscription_type: SubscriptionType::Task,
        event_type: EventType::Task,
        topic_name: "orders".to_string(),
        event: Bytes::from(MsgPackCodec::encode(&task).unwrap()),
    })
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [64usize, 1024, 16 * 1024] {
        let message = command(size);
        group.throughput(Throughput::Bytes(message.frame_length() as u64));
        group.bench_with_input(BenchmarkId::new("execute_command", size), &message, |b, message| {
            let mut codec = MessageCodec::new();
            let mut dst = BytesMut::with_capacity(message.frame_length() + 8);
            b.iter(|| {
                dst.clear();
                codec.encode(black_box(message), &mut dst).unwrap();
                black_box(dst.len())
            })
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [64usize, 1024, 16 * 1024] {
        let mut encoded = BytesMut::new();
        MessageCodec::new()
            .encode(pushed_event(size), &mut encoded)
            .unwrap();
        let encoded = encoded.freeze();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::new("subscribed_event", size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut codec = MessageCodec::new();
                let mut src = BytesMut::from(&encoded[..]);
                black_box(codec.decode(&mut src).unwrap())
            })
        });
    }

    group.finish();
}

fn bench_records(c: &mut Criterion) {
    let mut group = c.benchmark_group("msgpack_records");
    let task = Task::new("payment").with_payload(vec![1; 256]);
    let encoded = MsgPackCodec::encode(&task).unwrap();

    group.bench_function("task_encode", |b| {
        b.iter(|| black_box(MsgPackCodec::encode(black_box(&task)).unwrap()))
    });

    group.bench_function("task_decode", |b| {
        b.iter(|| black_box(MsgPackCodec::decode::<Task>(black_box(&encoded)).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_records);
criterion_main!(benches);
