//! GPU-class adapter discovery via wgpu.
//!
//! The lattice kernels run on the host-side GPU-class queue. When the `gpu`
//! feature is enabled the orchestrator asks wgpu for a high-performance
//! adapter, reports it, and caps every device buffer at the adapter's
//! `max_buffer_size`.

/// Error returned when no adapter can be obtained.
#[derive(Debug, thiserror::Error)]
#[error("GPU initialization failed: {0}")]
pub struct GpuInitError(pub String);

/// What the chosen adapter reports about itself.
#[derive(Debug, Clone)]
pub struct AdapterReport {
    /// Adapter name as reported by the driver
    pub name: String,
    /// Graphics backend in use
    pub backend: String,
    /// Discrete, integrated, virtual or CPU
    pub device_type: String,
    /// Largest single buffer the adapter accepts, in bytes.
    pub max_buffer_size: u64,
}

/// Request a high-performance adapter and describe it.
pub fn select_adapter() -> Result<AdapterReport, GpuInitError> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))
    .ok_or_else(|| GpuInitError("No suitable GPU adapter found".into()))?;

    let info = adapter.get_info();
    let report = AdapterReport {
        name: info.name,
        backend: format!("{:?}", info.backend),
        device_type: format!("{:?}", info.device_type),
        max_buffer_size: adapter.limits().max_buffer_size,
    };
    tracing::info!(
        "GPU adapter: {} ({}, {}), max buffer {} bytes",
        report.name,
        report.backend,
        report.device_type,
        report.max_buffer_size
    );
    Ok(report)
}
