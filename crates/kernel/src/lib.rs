//! Lattice-Boltzmann / rigid-particle kernel crate
//!
//! Building blocks for a D3Q19 lattice-Boltzmann solver coupled to rigid
//! spherical particles, executed on two asynchronous device queues.
//!
//! # Modules
//! - [`lattice`] -- D3Q19 stencil, lattice extents, interior/slab regions, equilibrium.
//! - [`stream_map`] -- Precomputed periodic wrap-around links.
//! - [`params`] -- Integer and floating-point parameter blocks.
//! - [`particle`] -- Packed particle records, surface points, quaternion helpers.
//! - [`zone`] -- Zone grid, neighbour cache, thread-group assignment, membership.
//! - [`device`] -- Tagged device buffers, allocation budget, in-order queues.
//! - [`kernels`] -- Kernel argument records and their bodies.

#![warn(missing_docs)]

pub mod device;
pub mod error;
pub mod kernels;
pub mod lattice;
pub mod params;
pub mod particle;
pub mod stream_map;
pub mod zone;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use device::{Access, DeviceBuffer, DeviceContext, DeviceQueue, EventLog, MappedBuffer, QueueEvent};
pub use error::{DeviceError, KernelError, QueueKind};
pub use kernels::{Kernel, KernelId, NdRange};
pub use lattice::{BoundaryKind, LatticeDims, Region, LB_Q};
pub use params::{FlpParams, IntParams};
pub use particle::{ParticleState, Vec4};
pub use stream_map::{PeriodicStreamMap, StreamLink};
pub use zone::{ThreadAssignment, ZoneGrid, ZoneInfo, ZoneMembership};

#[cfg(feature = "gpu")]
pub use gpu::{select_adapter, AdapterReport, GpuInitError};
