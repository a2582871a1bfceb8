use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use tapline_bus::data::{Data, Sequencing};
use tapline_bus::protocol::Event;
use tapline_bus::replay::Cursor;
use tapline_bus::transport::TapCodec;
use tokio_util::codec::{Decoder, Encoder};

/// A log with `conversations` conversations of `per_conversation` messages
/// each, all created by sean; alex is never a member.
fn populated(conversations: usize, per_conversation: usize) -> Data {
    let mut data = Data::new();
    data.apply(Event::auth("sean", 0), Sequencing::Assign).unwrap();
    data.apply(Event::auth("alex", 0), Sequencing::Assign).unwrap();
    for c in 0..conversations {
        let title = format!("c{c}");
        data.apply(
            Event::create_conversation("sean", title.clone(), "", vec!["john".into()]),
            Sequencing::Assign,
        )
        .unwrap();
        for m in 0..per_conversation {
            data.apply(Event::message("sean", title.clone(), format!("m{m}")), Sequencing::Assign)
                .unwrap();
        }
    }
    data
}

fn bench_apply_message(c: &mut Criterion) {
    c.bench_function("apply_1000_messages", |b| {
        b.iter(|| {
            let mut data = populated(1, 0);
            for i in 0..1000 {
                black_box(
                    data.apply(Event::message("sean", "c0", format!("m{i}")), Sequencing::Assign)
                        .unwrap(),
                );
            }
        })
    });
}

fn bench_apply_rejected(c: &mut Criterion) {
    let mut data = populated(10, 10);
    c.bench_function("apply_rejected_missing_conversation", |b| {
        b.iter(|| {
            let event = Event::message("sean", "missing", "hi");
            black_box(data.apply(black_box(event), Sequencing::Assign).unwrap_err());
        })
    });
}

fn bench_cursor_scan_member(c: &mut Criterion) {
    let data = populated(10, 100);
    c.bench_function("cursor_scan_member_1k", |b| {
        b.iter(|| {
            let mut cursor = Cursor::new("john", 0);
            black_box(cursor.advance(black_box(&data)));
        })
    });
}

fn bench_cursor_scan_outsider(c: &mut Criterion) {
    let data = populated(10, 100);
    c.bench_function("cursor_scan_outsider_1k", |b| {
        b.iter(|| {
            let mut cursor = Cursor::new("alex", 0);
            black_box(cursor.advance(black_box(&data)));
        })
    });
}

fn bench_invite_backfill(c: &mut Criterion) {
    let mut data = populated(10, 100);
    let position = data.len() as u64;
    data.apply(Event::invite("sean", "c5", vec!["alex".into()]), Sequencing::Assign)
        .unwrap();

    c.bench_function("invite_backfill_100", |b| {
        b.iter(|| {
            let mut cursor = Cursor::new("alex", position);
            black_box(cursor.advance(black_box(&data)));
        })
    });
}

fn bench_codec_encode(c: &mut Criterion) {
    let event = Arc::new(Event::message("sean", "bananas", "Hey guys"));
    let mut codec = TapCodec::default();

    c.bench_function("codec_encode_message", |b| {
        b.iter(|| {
            let mut dst = BytesMut::new();
            codec.encode(black_box(event.clone()), &mut dst).unwrap();
            black_box(dst);
        })
    });
}

fn bench_codec_decode_stream(c: &mut Criterion) {
    let mut codec = TapCodec::default();
    let mut stream = BytesMut::new();
    for i in 0..100 {
        let event = Arc::new(Event::message("sean", "bananas", format!("m{i}")));
        codec.encode(event, &mut stream).unwrap();
    }
    let stream = stream.freeze();

    c.bench_function("codec_decode_100_taps", |b| {
        b.iter(|| {
            let mut src = BytesMut::from(&stream[..]);
            let mut decoded = 0;
            while let Some(event) = codec.decode(&mut src).unwrap() {
                black_box(event);
                decoded += 1;
            }
            assert_eq!(decoded, 100);
        })
    });
}

criterion_group!(
    benches,
    bench_apply_message,
    bench_apply_rejected,
    bench_cursor_scan_member,
    bench_cursor_scan_outsider,
    bench_invite_backfill,
    bench_codec_encode,
    bench_codec_decode_stream,
);
criterion_main!(benches);
