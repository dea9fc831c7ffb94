//! Common utilities for submission integration tests.
//!
//! Every test runs against the dummy backend, which simulates queue
//! execution and records what the device submitted.

#![allow(dead_code)]

use std::sync::Arc;

use redlilium_submit::{
    BackendChoice, CommandBufferHandle, DummyBackend, DummyConfig, GraphicsInstance, QueueKind,
    RenderContext, RenderDevice, SubmitConfig,
};

/// Route `log` output through env_logger, controlled by `RUST_LOG`.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A device on a dummy backend, with the backend kept for inspection.
pub struct TestDevice {
    pub backend: Arc<DummyBackend>,
    pub device: Arc<RenderDevice>,
}

impl TestDevice {
    /// Create a device with small arenas.
    pub fn new(dummy: DummyConfig, config: SubmitConfig) -> Self {
        init_logging();

        let backend = Arc::new(DummyBackend::with_config(dummy));
        let instance = GraphicsInstance::with_backend(
            backend.clone(),
            config.with_backend(BackendChoice::Dummy),
        )
        .expect("instance creation");
        let device = instance.create_device().expect("device creation");

        Self { backend, device }
    }

    /// Three distinct coherent queues at the given buffering depth.
    pub fn with_depth(depth: u32) -> Self {
        Self::new(DummyConfig::default(), small_config().with_buffering_depth(depth))
    }

    /// Create a recording context.
    pub fn context(&self, label: &str) -> RenderContext {
        self.device.create_context(label).expect("context creation")
    }
}

/// Configuration with arenas small enough for tests.
pub fn small_config() -> SubmitConfig {
    SubmitConfig::default()
        .with_staging_capacity(64 * 1024)
        .with_transient_heap_size(4 * 1024 * 1024)
        .with_command_buffers_per_pool(8)
}

/// Record an empty command buffer of `kind` and return its handle.
pub fn record_empty(context: &mut RenderContext, kind: QueueKind) -> CommandBufferHandle {
    match kind {
        QueueKind::Graphics => context.begin_graphics(),
        QueueKind::Compute => context.begin_compute(),
        QueueKind::Transfer => context.begin_transfer(),
    }
    .expect("begin command buffer");
    context.end().expect("end command buffer")
}
