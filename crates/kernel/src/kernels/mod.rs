//! Kernel argument records and their reference bodies.
//!
//! Every kernel is a plain `Clone` record of the buffer handles and scalars it
//! is bound to. The orchestrator owns one record per kernel, rebinds only the
//! arguments that change between dispatches, and hands `&record` to
//! [`DeviceQueue::dispatch`](crate::device::DeviceQueue::dispatch), which
//! snapshots it for the queue worker.
//!
//! | kernel | index space |
//! |--------|-------------|
//! | [`CollideStream`] | 3D interior |
//! | [`BoundaryPeriodic`] | 1D, stream-map length |
//! | [`BoundaryVelocity`] | 3D wall slab |
//! | [`ResetParticleFluidForces`] | 3D interior |
//! | [`ParticleFluidForces`] | 1D surface points, tiled |
//! | [`SumParticleFluidForces`] | 3D interior |
//! | [`ParticleParticleForces`] | 1D thread groups |
//! | [`ParticleDynamics`] | 1D thread groups |
//! | [`UpdateParticleZones`] | 1D thread groups |

mod coupling;
mod fluid;
mod particles;

pub use coupling::{ParticleFluidForces, ResetParticleFluidForces, SumParticleFluidForces};
pub use fluid::{BoundaryPeriodic, BoundaryVelocity, CollideStream};
pub use particles::{ParticleDynamics, ParticleParticleForces, UpdateParticleZones};

use std::fmt;

use bytemuck::Pod;

use crate::device::DeviceBuffer;
use crate::error::KernelError;
use crate::lattice::Region;

/// Names of the kernels the orchestrator schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    /// BGK collision with push streaming.
    CollideStream,
    /// Prescribed-velocity wall pass.
    BoundaryVelocity,
    /// Periodic wrap-around copy.
    BoundaryPeriodic,
    /// Penalty coupling at surface points.
    ParticleFluidForces,
    /// Fold point-force slots per node.
    SumParticleFluidForces,
    /// Clear point-force slots.
    ResetParticleFluidForces,
    /// Soft-sphere contact forces.
    ParticleParticleForces,
    /// Explicit particle integration.
    ParticleDynamics,
    /// Zone index rebuild.
    UpdateParticleZones,
}

impl KernelId {
    /// Kernel name as reported in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            KernelId::CollideStream => "collide_stream",
            KernelId::BoundaryVelocity => "boundary_velocity",
            KernelId::BoundaryPeriodic => "boundary_periodic",
            KernelId::ParticleFluidForces => "particle_fluid_forces_linear_stencil",
            KernelId::SumParticleFluidForces => "sum_particle_fluid_forces",
            KernelId::ResetParticleFluidForces => "reset_particle_fluid_forces",
            KernelId::ParticleParticleForces => "particle_particle_forces",
            KernelId::ParticleDynamics => "particle_dynamics",
            KernelId::UpdateParticleZones => "update_particle_zones",
        }
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index space of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NdRange {
    /// `global` work items, optionally tiled into groups of `local`.
    Linear {
        /// Work item count
        global: usize,
        /// Work-group size
        local: Option<usize>,
    },
    /// 3D ids with an offset.
    Grid(Region),
}

impl NdRange {
    /// Untiled linear range.
    pub fn linear(global: usize) -> Self {
        NdRange::Linear { global, local: None }
    }

    /// Linear range in work groups of `local`.
    pub fn tiled(global: usize, local: usize) -> Self {
        NdRange::Linear {
            global,
            local: Some(local),
        }
    }

    /// Total work items.
    pub fn work_items(&self) -> usize {
        match self {
            NdRange::Linear { global, .. } => *global,
            NdRange::Grid(r) => r.len(),
        }
    }

    /// Reject empty spaces and global sizes that do not tile evenly.
    pub fn validate(&self) -> Result<(), KernelError> {
        let bad = |reason: &str| {
            Err(KernelError::InvalidRange {
                range: self.to_string(),
                reason: reason.to_string(),
            })
        };
        match *self {
            NdRange::Linear { global: 0, .. } => bad("no work items"),
            NdRange::Linear {
                local: Some(0), ..
            } => bad("work-group size is zero"),
            NdRange::Linear {
                global,
                local: Some(local),
            } if global % local != 0 => bad("global size is not a multiple of the work-group size"),
            NdRange::Grid(r) if r.is_empty() => bad("no work items"),
            _ => Ok(()),
        }
    }

    pub(crate) fn as_grid(&self) -> Result<Region, KernelError> {
        match self {
            NdRange::Grid(r) => Ok(*r),
            NdRange::Linear { .. } => Err(KernelError::InvalidRange {
                range: self.to_string(),
                reason: "kernel needs a 3D index space".into(),
            }),
        }
    }

    pub(crate) fn as_linear(&self) -> Result<usize, KernelError> {
        match self {
            NdRange::Linear { global, .. } => Ok(*global),
            NdRange::Grid(_) => Err(KernelError::InvalidRange {
                range: self.to_string(),
                reason: "kernel needs a 1D index space".into(),
            }),
        }
    }
}

impl fmt::Display for NdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NdRange::Linear { global, local: None } => write!(f, "[{global}]"),
            NdRange::Linear {
                global,
                local: Some(l),
            } => write!(f, "[{global} / {l}]"),
            NdRange::Grid(r) => write!(f, "{r}"),
        }
    }
}

/// A kernel body bound to its arguments.
pub trait Kernel: Clone + Send + 'static {
    /// Which kernel this record binds.
    const ID: KernelId;

    /// Execute every work item of `range`.
    fn run(&self, range: &NdRange) -> Result<(), KernelError>;
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Fail unless a buffer holds at least `needed` elements.
pub(crate) fn ensure_len<T: Pod + Send + Sync>(buf: &DeviceBuffer<T>, needed: usize) -> Result<(), KernelError> {
    if buf.len() < needed {
        return Err(KernelError::BufferTooSmall {
            tag: buf.tag(),
            len: buf.len(),
            needed,
        });
    }
    Ok(())
}

/// First element of a parameter-block buffer.
pub(crate) fn param<T: Pod + Send + Sync>(buf: &DeviceBuffer<T>) -> Result<T, KernelError> {
    let data = buf.read()?;
    data.first().copied().ok_or(KernelError::BufferTooSmall {
        tag: buf.tag(),
        len: 0,
        needed: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiled_range_must_divide() {
        assert!(NdRange::tiled(64, 32).validate().is_ok());
        assert!(NdRange::tiled(60, 32).validate().is_err());
        assert!(NdRange::tiled(64, 0).validate().is_err());
        assert!(NdRange::linear(0).validate().is_err());
    }

    #[test]
    fn names_match_kernel_sources() {
        assert_eq!(KernelId::ParticleFluidForces.name(), "particle_fluid_forces_linear_stencil");
        assert_eq!(KernelId::UpdateParticleZones.to_string(), "update_particle_zones");
    }
}
