use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use redlilium_submit::context::build_stage;
use redlilium_submit::{
    BackendChoice, BufferDescriptor, BufferUsage, DummyBackend, DummyConfig, GpuBackend,
    GraphicsInstance, MemoryModel, QueueKind, SubmitConfig, SubmitRecord, TimelineSemaphore,
};

fn dummy_device(dummy: DummyConfig) -> Arc<redlilium_submit::RenderDevice> {
    let instance = GraphicsInstance::with_backend(
        Arc::new(DummyBackend::with_config(dummy)),
        SubmitConfig::default()
            .with_backend(BackendChoice::Dummy)
            .with_buffering_depth(3)
            .with_staging_capacity(4 * 1024 * 1024)
            .with_transient_heap_size(16 * 1024 * 1024),
    )
    .unwrap();
    instance.create_device().unwrap()
}

// ---------------------------------------------------------------------------
// Batch building
// ---------------------------------------------------------------------------

fn bench_build_stage(c: &mut Criterion) {
    let backend: Arc<dyn GpuBackend> = Arc::new(DummyBackend::new());
    let pool = backend
        .create_command_pool(QueueKind::Graphics, "bench")
        .unwrap();
    let frame = TimelineSemaphore::new(&backend, "frame").unwrap();
    let user = TimelineSemaphore::new(&backend, "user").unwrap();

    let records: Vec<SubmitRecord> = (0..64)
        .map(|i| SubmitRecord {
            command_buffer: backend.allocate_command_buffer(&pool, "cb").unwrap(),
            kind: QueueKind::Graphics,
            wait: (i % 8 == 0).then(|| user.op(i)),
            signal: (i % 16 == 15).then(|| user.op(i + 1)),
        })
        .collect();
    let waits = [frame.op(1), frame.op(2)];
    let signals = [frame.op(3)];

    c.bench_function("build_stage_64_records", |b| {
        b.iter(|| black_box(build_stage(black_box(&records), &waits, &signals)));
    });
}

// ---------------------------------------------------------------------------
// Frame loop
// ---------------------------------------------------------------------------

fn bench_frame_loop(c: &mut Criterion) {
    let device = dummy_device(DummyConfig::default());
    let mut context = device.create_context("bench").unwrap();

    c.bench_function("dummy_frame_three_stages", |b| {
        b.iter(|| {
            let info = device.begin_frame(None).unwrap();
            context.reset(info.slot).unwrap();
            for kind in QueueKind::SUBMIT_ORDER {
                match kind {
                    QueueKind::Graphics => context.begin_graphics(),
                    QueueKind::Compute => context.begin_compute(),
                    QueueKind::Transfer => context.begin_transfer(),
                }
                .unwrap();
                let handle = context.end().unwrap();
                match kind {
                    QueueKind::Graphics => context.queue_graphics(handle, None, None).unwrap(),
                    QueueKind::Compute => context.queue_compute(handle, None, None).unwrap(),
                    QueueKind::Transfer => context.queue_transfer(handle, None, None).unwrap(),
                };
            }
            context.flush();
            black_box(device.end_frame(None, None).unwrap());
        });
    });
}

fn bench_staged_frame(c: &mut Criterion) {
    let device = dummy_device(DummyConfig::default().with_memory_model(MemoryModel::NonCoherent));
    let payload = vec![0x5Au8; 16 * 1024];

    c.bench_function("dummy_frame_staging_16k", |b| {
        b.iter(|| {
            device.begin_frame(None).unwrap();
            let staging = device.staging().unwrap();
            staging.allocate(payload.len() as u64, 256).unwrap().write(&payload);
            black_box(device.end_frame(None, None).unwrap());
        });
    });
}

fn bench_transient_placement(c: &mut Criterion) {
    let device = dummy_device(DummyConfig::default());
    let descriptor = BufferDescriptor::new(4096, BufferUsage::STORAGE);

    c.bench_function("transient_place_32_buffers", |b| {
        b.iter(|| {
            device.begin_frame(None).unwrap();
            let heap = device.transient_heap();
            let mut hint = 0;
            for _ in 0..32 {
                let (buffer, consumed) = heap.create_transient_buffer(&descriptor, hint).unwrap();
                hint += consumed;
                black_box(buffer);
            }
            device.end_frame(None, None).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_build_stage,
    bench_frame_loop,
    bench_staged_frame,
    bench_transient_placement,
);
criterion_main!(benches);
