//! Orchestration Layer
//!
//! This crate drives a D3Q19 lattice-Boltzmann fluid coupled to rigid
//! particles across a GPU-class and a CPU-class device queue:
//! - Configuration loading and validation
//! - Host setup (parameter blocks, initial fields, zone index, stream map)
//! - Device buffer manager
//! - Kernel binding table and the per-timestep dispatch loop
//! - Sampling/output bridge (trajectory frames, shear-stress analysis)

#![warn(missing_docs)]

pub mod buffers;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod output;
pub mod setup;

pub use buffers::DeviceState;
pub use config::{ConfigError, SimulationConfig};
pub use dispatch::{buffer_roles, BufferRoles, KernelTable, LaunchPlan, Orchestrator, RunSummary, WallPass};
pub use error::SimError;
pub use output::{NullSink, OutputBridge, SampleSink, ShearStressRecord};
pub use setup::HostState;

use lb_kernel::DeviceContext;
use std::path::Path;

/// Load, validate and run a simulation from a configuration file.
///
/// Validation happens before any device resource is created.
pub fn run_from_file(config_path: impl AsRef<Path>) -> Result<RunSummary, SimError> {
    let config_path = config_path.as_ref();
    tracing::info!("Creating simulation from config: {}", config_path.display());
    let config = SimulationConfig::load(config_path)?;
    tracing::info!("Configuration loaded: {}", config.name);
    run(config)
}

/// Run a simulation with the default output bridge.
pub fn run(config: SimulationConfig) -> Result<RunSummary, SimError> {
    config.validate()?;

    let ctx = DeviceContext::new(config.device.max_device_bytes)?.with_max_buffer_size(adapter_buffer_limit());
    let sink = OutputBridge::create(&config.output.trajectory_path, config.wall_axis(), config.rho_init)?;

    let mut orchestrator = Orchestrator::new(config, ctx, sink)?;
    let summary = orchestrator.run()?;
    tracing::info!(
        "Simulation complete: {} steps, {} shear-stress records",
        summary.steps,
        orchestrator.sink().stress_records().len()
    );
    Ok(summary)
}

/// Per-buffer size limit of the GPU adapter, when the `gpu` feature can
/// find one.
#[cfg(feature = "gpu")]
fn adapter_buffer_limit() -> Option<u64> {
    match lb_kernel::select_adapter() {
        Ok(report) => Some(report.max_buffer_size),
        Err(e) => {
            tracing::warn!("{}; running without a per-buffer limit", e);
            None
        }
    }
}

#[cfg(not(feature = "gpu"))]
fn adapter_buffer_limit() -> Option<u64> {
    None
}
