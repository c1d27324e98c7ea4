#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use pfs_block::{MemoryByteDevice, Storage};
use pfs_types::StorageGeometry;

const STREAM_LEN: usize = 2000;

fn region_storage() -> Storage<MemoryByteDevice> {
    let geometry = StorageGeometry::new(64, 256).expect("geometry");
    let device = MemoryByteDevice::new(usize::try_from(geometry.image_len()).expect("len"));
    Storage::format(device, geometry).expect("format")
}

fn bench_region_stream(c: &mut Criterion) {
    let payload: Vec<u8> = (0..STREAM_LEN).map(|byte| byte as u8).collect();

    c.bench_function("region_write_stream", |b| {
        b.iter_batched(
            region_storage,
            |mut storage| {
                let region = storage.allocate_region().expect("region");
                storage.jump_to_region(region).expect("jump");
                storage.write_all(black_box(&payload)).expect("write");
                storage
            },
            criterion::BatchSize::SmallInput,
        );
    });

    c.bench_function("region_read_stream", |b| {
        let mut storage = region_storage();
        let region = storage.allocate_region().expect("region");
        storage.jump_to_region(region).expect("jump");
        storage.write_all(&payload).expect("write");

        let mut back = vec![0_u8; STREAM_LEN];
        b.iter(|| {
            storage.jump_to_region(region).expect("jump");
            storage.read_exact(black_box(&mut back)).expect("read");
        });
    });

    c.bench_function("region_seek_back_and_forth", |b| {
        let mut storage = region_storage();
        let region = storage.allocate_region().expect("region");
        storage.jump_to_region(region).expect("jump");
        storage.write_all(&payload).expect("write");

        b.iter(|| {
            storage.jump_to_region(region).expect("jump");
            storage.seek(black_box(1500)).expect("forward");
            storage.seek(black_box(-1200)).expect("backward");
        });
    });
}

criterion_group!(benches, bench_region_stream);
criterion_main!(benches);
