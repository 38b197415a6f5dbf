//! Sampling/output bridge.
//!
//! The orchestrator hands host copies of the velocity, relaxation and
//! particle arrays to a [`SampleSink`]. Nothing here feeds back into the
//! simulation.

use lb_kernel::particle::{kin_index, xyz, KIN_POS, KIN_STRIDE, KIN_VEL};
use lb_kernel::{LatticeDims, Region, Vec4};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Consumer of sampled fields.
pub trait SampleSink {
    /// Velocity field (3 components per node) and packed particle kinematics.
    fn velocity_sample(&mut self, step: u64, dims: &LatticeDims, velocity: &[f32], kinematics: &[Vec4])
        -> io::Result<()>;

    /// Velocity field and per-node relaxation time.
    fn stress_sample(&mut self, step: u64, dims: &LatticeDims, velocity: &[f32], relaxation: &[f32])
        -> io::Result<()>;

    /// Flush buffered output at the end of a run.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SampleSink for NullSink {
    fn velocity_sample(&mut self, _: u64, _: &LatticeDims, _: &[f32], _: &[Vec4]) -> io::Result<()> {
        Ok(())
    }

    fn stress_sample(&mut self, _: u64, _: &LatticeDims, _: &[f32], _: &[f32]) -> io::Result<()> {
        Ok(())
    }
}

/// Mean speed over the interior nodes.
pub fn mean_speed(dims: &LatticeDims, velocity: &[f32]) -> f32 {
    let interior = Region::interior(dims);
    if interior.is_empty() {
        return 0.0;
    }
    let total: f32 = interior
        .ids()
        .map(|c| {
            let n = dims.node_index(c) * 3;
            let u = &velocity[n..n + 3];
            (u[0] * u[0] + u[1] * u[1] + u[2] * u[2]).sqrt()
        })
        .sum();
    total / interior.len() as f32
}

// ---------------------------------------------------------------------------
// Trajectory
// ---------------------------------------------------------------------------

/// XYZ frames: particle count, a comment line, one line per particle.
pub struct TrajectoryWriter<W: Write> {
    out: W,
    frames: u64,
}

impl TrajectoryWriter<BufWriter<File>> {
    /// Create (truncate) the trajectory file.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> TrajectoryWriter<W> {
    /// Writer over any byte sink.
    pub fn new(out: W) -> Self {
        Self { out, frames: 0 }
    }

    /// Frames written so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Append one frame of particle positions and velocities.
    pub fn write_frame(&mut self, step: u64, mean_fluid_speed: f32, kinematics: &[Vec4]) -> io::Result<()> {
        let n = kinematics.len() / KIN_STRIDE;
        writeln!(self.out, "{n}")?;
        writeln!(self.out, "step {step} mean_fluid_speed {mean_fluid_speed:.6e}")?;
        for p in 0..n {
            let x = xyz(kinematics[kin_index(p, KIN_POS)]);
            let v = xyz(kinematics[kin_index(p, KIN_VEL)]);
            writeln!(
                self.out,
                "P {:.6} {:.6} {:.6} {:.6e} {:.6e} {:.6e}",
                x[0], x[1], x[2], v[0], v[1], v[2]
            )?;
        }
        self.frames += 1;
        Ok(())
    }

    /// Flush buffered frames.
    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

// ---------------------------------------------------------------------------
// Shear stress
// ---------------------------------------------------------------------------

/// One shear-stress analysis record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShearStressRecord {
    /// Step the sample was taken at.
    pub step: u64,
    /// Mean relaxation time over the interior.
    pub mean_tau: f32,
    /// Tangential wall shear stress magnitude at the lower and upper wall.
    pub wall_shear: Option<[f32; 2]>,
}

/// Viscous wall shear stress from the first two fluid layers next to each
/// wall, `rho * nu * du_t/dn` averaged over the wall plane.
pub fn wall_shear_stress(
    dims: &LatticeDims,
    axis: usize,
    rho: f32,
    velocity: &[f32],
    relaxation: &[f32],
) -> Option<[f32; 2]> {
    let n = dims.size[axis];
    // Needs two distinct interior layers
    if n < 4 {
        return None;
    }
    let mut plane = Region::interior(dims);
    plane.extent[axis] = 1;

    let shear_between = |wall: usize, inner: usize| -> f32 {
        let mut sum = [0.0f32; 3];
        for c in plane.ids() {
            let mut w = c;
            w[axis] = wall;
            let mut i = c;
            i[axis] = inner;
            let nw = dims.node_index(w);
            let ni = dims.node_index(i);
            let nu = (relaxation[nw] - 0.5) / 3.0;
            for a in (0..3).filter(|&a| a != axis) {
                sum[a] += rho * nu * (velocity[ni * 3 + a] - velocity[nw * 3 + a]);
            }
        }
        let count = plane.len().max(1) as f32;
        (sum.iter().map(|s| (s / count).powi(2)).sum::<f32>()).sqrt()
    };

    Some([shear_between(1, 2), shear_between(n - 2, n - 3)])
}

/// Shear-stress analysis records kept for the run summary.
#[derive(Debug, Clone, Default)]
pub struct ShearStressLog {
    wall_axis: Option<usize>,
    rho: f32,
    records: Vec<ShearStressRecord>,
}

impl ShearStressLog {
    /// Log for a wall on `wall_axis`, if any, at reference density `rho`.
    pub fn new(wall_axis: Option<usize>, rho: f32) -> Self {
        Self {
            wall_axis,
            rho,
            records: Vec::new(),
        }
    }

    /// Analyse one sample and keep the record.
    pub fn record(&mut self, step: u64, dims: &LatticeDims, velocity: &[f32], relaxation: &[f32]) -> ShearStressRecord {
        let interior = Region::interior(dims);
        let mean_tau = if interior.is_empty() {
            0.0
        } else {
            interior.ids().map(|c| relaxation[dims.node_index(c)]).sum::<f32>() / interior.len() as f32
        };
        let wall_shear = self
            .wall_axis
            .and_then(|axis| wall_shear_stress(dims, axis, self.rho, velocity, relaxation));
        let record = ShearStressRecord {
            step,
            mean_tau,
            wall_shear,
        };
        self.records.push(record);
        record
    }

    /// Every record so far.
    pub fn records(&self) -> &[ShearStressRecord] {
        &self.records
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Default sink: trajectory file plus shear-stress log.
pub struct OutputBridge<W: Write = BufWriter<File>> {
    trajectory: TrajectoryWriter<W>,
    stress: ShearStressLog,
}

impl OutputBridge {
    /// Open the trajectory file once for the whole run.
    pub fn create(path: impl AsRef<Path>, wall_axis: Option<usize>, rho: f32) -> io::Result<Self> {
        let path = path.as_ref();
        let trajectory = TrajectoryWriter::create(path)?;
        tracing::info!("Writing trajectory to {}", path.display());
        Ok(Self {
            trajectory,
            stress: ShearStressLog::new(wall_axis, rho),
        })
    }
}

impl<W: Write> OutputBridge<W> {
    /// Bridge over an arbitrary trajectory writer.
    pub fn with_writer(out: W, wall_axis: Option<usize>, rho: f32) -> Self {
        Self {
            trajectory: TrajectoryWriter::new(out),
            stress: ShearStressLog::new(wall_axis, rho),
        }
    }

    /// Shear-stress records so far.
    pub fn stress_records(&self) -> &[ShearStressRecord] {
        self.stress.records()
    }

    /// Trajectory frames written so far.
    pub fn trajectory_frames(&self) -> u64 {
        self.trajectory.frames()
    }

    /// Trajectory writer and shear-stress records.
    pub fn into_parts(self) -> (W, Vec<ShearStressRecord>) {
        (self.trajectory.into_inner(), self.stress.records)
    }
}

impl<W: Write> SampleSink for OutputBridge<W> {
    fn velocity_sample(
        &mut self,
        step: u64,
        dims: &LatticeDims,
        velocity: &[f32],
        kinematics: &[Vec4],
    ) -> io::Result<()> {
        let speed = mean_speed(dims, velocity);
        tracing::debug!(step, speed, "velocity sample");
        self.trajectory.write_frame(step, speed, kinematics)
    }

    fn stress_sample(
        &mut self,
        step: u64,
        dims: &LatticeDims,
        velocity: &[f32],
        relaxation: &[f32],
    ) -> io::Result<()> {
        let record = self.stress.record(step, dims, velocity, relaxation);
        match record.wall_shear {
            Some([lower, upper]) => tracing::info!(
                "Step {}: mean tau {:.5}, wall shear stress {:.4e} (lower) {:.4e} (upper)",
                step,
                record.mean_tau,
                lower,
                upper
            ),
            None => tracing::info!("Step {}: mean tau {:.5}", step, record.mean_tau),
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.trajectory.flush()
    }
}
