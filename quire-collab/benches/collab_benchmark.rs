use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quire_collab::protocol::{ClientInfo, ClientMessage, ServerMessage};
use quire_collab::resolver::resolve;
use quire_collab::{BroadcastGroup, ClientHandle, Room, RoomConfig};
use quire_core::Operation;
use std::sync::Arc;
use tokio::sync::mpsc;

type Msg = Arc<ServerMessage<Operation>>;

fn bench_resolve(c: &mut Criterion) {
    let batch: Vec<Operation> = (0..10)
        .map(|i| Operation::insert_text(vec![0, 0], 40 + i, "k"))
        .collect();
    let history: Vec<(String, Operation)> = (0..50)
        .map(|i| {
            let op = if i % 2 == 0 {
                Operation::insert_text(vec![0, 0], i, "xy")
            } else {
                Operation::delete_text(vec![0, 0], i / 2, 1)
            };
            (format!("peer-{}", i % 5), op)
        })
        .collect();

    c.bench_function("resolve_10_over_50", |b| {
        b.iter(|| {
            let concurrent = history.iter().map(|(who, op)| (who.as_str(), op));
            black_box(resolve("local", black_box(batch.clone()), concurrent))
        })
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let raw = br#"{"type":"ops","version":42,"ops":[{"kind":"insert-text","path":[0,3],"offset":17,"text":"hello"}]}"#;

    c.bench_function("client_ops_decode", |b| {
        b.iter(|| black_box(ClientMessage::<Operation>::decode(black_box(raw)).unwrap()))
    });
}

fn bench_fanout_100_peers(c: &mut Criterion) {
    let mut group = BroadcastGroup::<Operation>::new();
    let mut receivers = Vec::new();
    for i in 0..100 {
        let (tx, rx) = mpsc::unbounded_channel::<Msg>();
        let info = ClientInfo::with_id(format!("peer-{i}"), "bench", "#000000");
        group.add_peer(ClientHandle::new(info, Arc::new(tx)));
        receivers.push(rx);
    }

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            let sent = group.broadcast_except(
                "peer-0",
                ServerMessage::ClientLeft {
                    client_id: "gone".into(),
                },
            );
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
            black_box(sent)
        })
    });
}

fn bench_room_submit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let room = Room::<Operation>::new("bench", RoomConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
    rt.block_on(async {
        let info = ClientInfo::with_id("writer", "bench", "#000000");
        room.join(ClientHandle::new(info, Arc::new(tx))).await.unwrap();
    });

    c.bench_function("room_submit_uncontended", |b| {
        b.iter(|| {
            rt.block_on(async {
                let base = room.version().await;
                let op = Operation::insert_text(vec![0], 0, "z");
                black_box(room.submit_ops("writer", base, vec![op]).await.unwrap());
            });
            while rx.try_recv().is_ok() {}
        })
    });
}

criterion_group!(
    benches,
    bench_resolve,
    bench_message_decode,
    bench_fanout_100_peers,
    bench_room_submit,
);
criterion_main!(benches);
