use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use drudgenet::core::stream::{MeasureStream, ReadStream, Stream, WriteStream};

fn write_snapshot(stream: &mut dyn Stream, entities: &mut [(i32, f32, bool)]) {
    for (id, heading, moving) in entities.iter_mut() {
        stream.serialize_integer(id, 0, 1023).unwrap();
        stream
            .serialize_compressed_float(heading, 0.0, 360.0, 0.5)
            .unwrap();
        stream.serialize_bool(moving).unwrap();
    }
}

fn bench_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("bit_stream");
    let template: Vec<(i32, f32, bool)> = (0..64)
        .map(|i| (i, (i * 5) as f32, i % 2 == 0))
        .collect();

    let mut encoded = WriteStream::new(1024);
    write_snapshot(&mut encoded, &mut template.clone());
    let bytes = encoded.into_bytes();
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("write_64_entities", |b| {
        let mut entities = template.clone();
        b.iter(|| {
            let mut stream = WriteStream::new(1024);
            write_snapshot(&mut stream, &mut entities);
            black_box(stream.bytes_written())
        })
    });

    group.bench_function("read_64_entities", |b| {
        let mut entities = vec![(0, 0.0, false); 64];
        b.iter(|| {
            let mut stream = ReadStream::new(&bytes);
            write_snapshot(&mut stream, &mut entities);
            black_box(entities[63].0)
        })
    });

    group.bench_function("measure_64_entities", |b| {
        let mut entities = template.clone();
        b.iter(|| {
            let mut stream = MeasureStream::new();
            write_snapshot(&mut stream, &mut entities);
            black_box(stream.bits_processed())
        })
    });

    group.bench_function("write_strings", |b| {
        let mut name = String::from("a host with a fairly long name");
        b.iter(|| {
            let mut stream = WriteStream::new(1024);
            for _ in 0..16 {
                stream.serialize_string(&mut name).unwrap();
            }
            black_box(stream.bytes_written())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_stream);
criterion_main!(benches);
