use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use quire_core::{Document, Node, Operation, Tie, Transform};

fn bench_text_transform(c: &mut Criterion) {
    let mut group = c.benchmark_group("Transform");
    group.throughput(Throughput::Elements(1));

    let a = Operation::insert_text(vec![0, 0], 12, "hello");
    let b = Operation::delete_text(vec![0, 0], 4, 20);
    group.bench_function("insert_vs_delete", |bench| {
        bench.iter(|| black_box(black_box(&a).transform(black_box(&b), Tie::Left)))
    });

    let f1 = Operation::format(vec![0, 0], 0, 40, "bold", Some("true"));
    let f2 = Operation::format(vec![0, 0], 20, 40, "bold", None);
    group.bench_function("format_vs_format", |bench| {
        bench.iter(|| black_box(black_box(&f1).transform(black_box(&f2), Tie::Right)))
    });

    let deep = Operation::insert_text(vec![3, 2, 1, 0], 0, "x");
    let node = Operation::delete_node(vec![1]);
    group.bench_function("path_shift", |bench| {
        bench.iter(|| black_box(black_box(&deep).transform(black_box(&node), Tie::Left)))
    });

    group.finish();
}

fn bench_apply(c: &mut Criterion) {
    let text: String = "lorem ipsum ".repeat(100);
    let doc = Document::new(vec![Node::element("p", vec![Node::text(&text)])]);
    let op = Operation::insert_text(vec![0, 0], 600, "inserted");

    c.bench_function("apply_insert_1200_chars", |bench| {
        bench.iter(|| {
            let mut d = doc.clone();
            d.apply(black_box(&op)).unwrap();
            black_box(d);
        })
    });
}

criterion_group!(benches, bench_text_transform, bench_apply);
criterion_main!(benches);
