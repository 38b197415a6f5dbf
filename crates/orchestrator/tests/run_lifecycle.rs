//! Whole-run behaviour: fluid-only idempotence, sampling cadences, output
//! files and fatal error paths

use lb_kernel::{DeviceContext, DeviceError, LatticeDims, Vec4};
use lb_orchestrator::{run, NullSink, Orchestrator, SampleSink, SimError, SimulationConfig};
use serde_json::json;
use std::io;
use std::path::PathBuf;

fn config(value: serde_json::Value) -> SimulationConfig {
    serde_json::from_value(value).unwrap()
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("lb-sim-{}-{}", std::process::id(), name))
}

/// Remembers the step of every sample it receives.
#[derive(Default)]
struct RecordingSink {
    velocity_steps: Vec<u64>,
    stress_steps: Vec<u64>,
    particles_seen: Vec<usize>,
}

impl SampleSink for RecordingSink {
    fn velocity_sample(&mut self, step: u64, dims: &LatticeDims, velocity: &[f32], kinematics: &[Vec4]) -> io::Result<()> {
        assert_eq!(velocity.len(), dims.num_nodes() * 3);
        self.velocity_steps.push(step);
        self.particles_seen.push(kinematics.len() / 4);
        Ok(())
    }

    fn stress_sample(&mut self, step: u64, dims: &LatticeDims, _velocity: &[f32], relaxation: &[f32]) -> io::Result<()> {
        assert_eq!(relaxation.len(), dims.num_nodes());
        self.stress_steps.push(step);
        Ok(())
    }
}

fn run_fluid(value: serde_json::Value) -> (Vec<f32>, Vec<lb_kernel::QueueEvent>) {
    let ctx = DeviceContext::with_event_log(None).unwrap();
    let mut orch = Orchestrator::new(config(value), ctx, NullSink).unwrap();
    orch.run().unwrap();
    let f = orch.current_distributions().unwrap();
    (f, orch.context().events().snapshot())
}

#[test]
fn test_zero_particles_match_fluid_only_bitwise() {
    let base = json!({
        "lattice_size": [8, 7, 6],
        "boundaries": ["periodic", "bounce_back", "periodic"],
        "body_force": [1e-5, 0.0, 0.0],
        "max_iterations": 6
    });
    let mut zero_particles = base.clone();
    zero_particles["particles"] = json!({ "enabled": true, "count": 0, "dynamics": true });

    let (f_disabled, events_disabled) = run_fluid(base);
    let (f_zero, events_zero) = run_fluid(zero_particles);

    assert_eq!(f_disabled.len(), f_zero.len());
    assert!(
        f_disabled.iter().zip(&f_zero).all(|(a, b)| a.to_bits() == b.to_bits()),
        "distributions differ between disabled particles and zero particles"
    );
    assert_eq!(events_disabled, events_zero);
}

#[test]
fn test_sampling_cadences() {
    let ctx = DeviceContext::new(None).unwrap();
    let cfg = config(json!({
        "lattice_size": [6, 6, 6],
        "max_iterations": 12,
        "frequencies": { "console_print": 5, "video": 3, "shear_stress": 4 },
        "particles": { "enabled": true, "count": 2, "points_per_particle": 8, "points_per_work_group": 16, "radius": 1.0 }
    }));
    let mut orch = Orchestrator::new(cfg, ctx, RecordingSink::default()).unwrap();
    orch.run().unwrap();
    let sink = orch.into_sink();
    assert_eq!(sink.velocity_steps, vec![3, 6, 9, 12]);
    assert_eq!(sink.stress_steps, vec![4, 8, 12]);
    assert!(sink.particles_seen.iter().all(|&n| n == 2));
}

#[test]
fn test_end_to_end_run_writes_trajectory() {
    let path = temp_path("trajectory.xyz");
    let cfg = config(json!({
        "lattice_size": [8, 8, 8],
        "boundaries": ["periodic", "velocity", "periodic"],
        "velocity_walls": { "upper": [0.02, 0.0, 0.0] },
        "max_iterations": 4,
        "frequencies": { "video": 2, "shear_stress": 2 },
        "particles": {
            "enabled": true,
            "count": 1,
            "points_per_particle": 16,
            "points_per_work_group": 16,
            "radius": 1.0
        },
        "output": { "trajectory_path": path.to_string_lossy() }
    }));

    let summary = run(cfg).unwrap();
    assert_eq!(summary.steps, 4);
    assert_eq!(summary.particle_fluid_forces.len(), 1);
    let (force, _) = summary.particle_fluid_forces[0];
    assert!(force.iter().all(|c| c.is_finite()));

    let text = std::fs::read_to_string(&path).unwrap();
    let frames = text.lines().filter(|l| l.starts_with("step ")).count();
    assert_eq!(frames, 2);
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_invalid_config_fails_before_output_or_device() {
    let path = temp_path("never-created.xyz");
    let cfg = config(json!({
        "lattice_size": [8, 8, 8],
        "tau": 0.4,
        "max_iterations": 4,
        "output": { "trajectory_path": path.to_string_lossy() }
    }));
    match run(cfg) {
        Err(SimError::Config(_)) => {}
        other => panic!("expected config error, got {other:?}"),
    }
    assert!(!path.exists());
}

#[test]
fn test_device_budget_is_fatal_allocation_error() {
    let ctx = DeviceContext::new(Some(4096)).unwrap();
    let cfg = config(json!({ "lattice_size": [16, 16, 16], "max_iterations": 1 }));
    match Orchestrator::new(cfg, ctx, NullSink) {
        Err(SimError::Device(DeviceError::Allocation { tag, bytes, .. })) => {
            assert!(!tag.is_empty());
            assert!(bytes > 0);
        }
        Err(other) => panic!("expected allocation error, got {other}"),
        Ok(_) => panic!("16^3 lattice cannot fit in 4 KiB"),
    }
}

#[test]
fn test_buffer_size_limit_is_per_buffer() {
    // 16^3 nodes: each distribution buffer is 311_296 bytes, the whole
    // working set well over twice that
    let cfg = json!({
        "lattice_size": [16, 16, 16],
        "max_iterations": 1,
        "particles": { "max_surf_points_per_node": 4 }
    });

    let ctx = DeviceContext::new(None).unwrap().with_max_buffer_size(Some(400_000));
    let orch = Orchestrator::new(config(cfg.clone()), ctx, NullSink).unwrap();
    assert!(orch.context().allocated_bytes() > 2 * 311_296);

    let ctx = DeviceContext::new(None).unwrap().with_max_buffer_size(Some(300_000));
    match Orchestrator::new(config(cfg), ctx, NullSink) {
        Err(SimError::Device(DeviceError::Allocation { tag, bytes, .. })) => {
            assert_eq!(tag, "f_a");
            assert_eq!(bytes, 311_296);
        }
        Err(other) => panic!("expected allocation error, got {other}"),
        Ok(_) => panic!("a distribution buffer cannot fit 300 kB"),
    }
}
