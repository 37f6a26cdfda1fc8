use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lattice::net::buffer::{Buffer, BUF_SIZE_INCREMENT};

fn bench_line_extraction(c: &mut Criterion) {
    let mut wire = Vec::new();
    for i in 0..40 {
        wire.extend_from_slice(format!("210 user{} some chat text padding padding\r\n", i).as_bytes());
    }

    c.bench_function("ingress_extract", |b| {
        b.iter(|| {
            let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
            buffer.append(black_box(&wire)).unwrap();

            let mut lines = 0;
            while let Some(line) = buffer.next_line() {
                lines += black_box(line).len();
            }
            lines
        })
    });
}

criterion_group!(benches, bench_line_extraction);
criterion_main!(benches);
