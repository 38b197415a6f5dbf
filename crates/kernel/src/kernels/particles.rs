//! Per-particle kernels run on the CPU-class queue, one work item per thread
//! group. Each group walks the particles it statically owns.

use rayon::prelude::*;

use super::{ensure_len, param, Kernel, KernelId, NdRange};
use crate::device::DeviceBuffer;
use crate::error::KernelError;
use crate::lattice::{BoundaryKind, LatticeDims};
use crate::params::{FlpParams, IntParams};
use crate::particle::{
    fluid_slot_index, integrate_rotation, kin_index, vec4, xyz, Vec4, FORCE_STRIDE, KIN_ANG_VEL, KIN_POS,
    KIN_ROT, KIN_STRIDE, KIN_VEL,
};
use crate::zone::{owned_slice, scatter_members, ZoneGrid, ZoneInfo};

/// Thread groups covered by a dispatch, checked against the assignment arrays.
fn thread_groups(
    range: &NdRange,
    ip: &IntParams,
    members: &DeviceBuffer<u32>,
    counts: &DeviceBuffer<u32>,
) -> Result<(usize, usize), KernelError> {
    let groups = range.as_linear()?.min(ip.num_thread_groups as usize);
    let n = ip.num_particles as usize;
    ensure_len(counts, groups)?;
    ensure_len(members, groups * n)?;
    Ok((groups, n))
}

/// Separation `to - from`, minimum image on periodic axes.
fn separation(dims: &LatticeDims, bcs: &[BoundaryKind; 3], from: [f32; 3], to: [f32; 3]) -> [f32; 3] {
    [0, 1, 2].map(|a| {
        let mut d = to[a] - from[a];
        if bcs[a] == BoundaryKind::Periodic {
            let len = dims.size[a] as f32 - 2.0;
            if d > 0.5 * len {
                d -= len;
            } else if d < -0.5 * len {
                d += len;
            }
        }
        d
    })
}

/// Periodic image of `x` in `[1, 1 + len)`.
fn wrap_periodic(x: f32, len: f32) -> f32 {
    let w = 1.0 + (x - 1.0).rem_euclid(len);
    // rem_euclid of a tiny negative offset rounds up to exactly `len`
    if w >= 1.0 + len {
        1.0
    } else {
        w
    }
}

// ---------------------------------------------------------------------------
// Particle-particle forces
// ---------------------------------------------------------------------------

/// Soft-sphere repulsion between particles closer than `2 * radius +
/// interaction_range`, searched over the particle's zone and its cached
/// neighbours.
#[derive(Debug, Clone)]
pub struct ParticleParticleForces {
    /// Integer parameter block.
    pub int_params: DeviceBuffer<IntParams>,
    /// Floating-point parameter block.
    pub flp_params: DeviceBuffer<FlpParams>,
    /// Packed particle kinematics.
    pub par_kin: DeviceBuffer<Vec4>,
    /// Particle-particle force and torque.
    pub par_force: DeviceBuffer<Vec4>,
    /// Neighbour cache per zone.
    pub zone_info: DeviceBuffer<ZoneInfo>,
    /// Zone id per particle.
    pub pars_zone: DeviceBuffer<u32>,
    /// Particles owned by each thread group.
    pub thread_members: DeviceBuffer<u32>,
    /// Owned particle count per thread group.
    pub num_par_in_thread: DeviceBuffer<u32>,
    /// Member slots per zone.
    pub zone_members: DeviceBuffer<u32>,
    /// Member count per zone.
    pub num_par_in_zone: DeviceBuffer<u32>,
}

impl Kernel for ParticleParticleForces {
    const ID: KernelId = KernelId::ParticleParticleForces;

    fn run(&self, range: &NdRange) -> Result<(), KernelError> {
        let ip = param(&self.int_params)?;
        let fp = param(&self.flp_params)?;
        let (groups, n) = thread_groups(range, &ip, &self.thread_members, &self.num_par_in_thread)?;
        let zones = ip.total_zones();
        let dims = ip.dims();
        let bcs = ip.boundaries();
        ensure_len(&self.par_kin, n * KIN_STRIDE)?;
        ensure_len(&self.par_force, n * FORCE_STRIDE)?;
        ensure_len(&self.pars_zone, n)?;
        ensure_len(&self.zone_info, zones)?;
        ensure_len(&self.zone_members, zones * n)?;
        ensure_len(&self.num_par_in_zone, zones)?;

        let cutoff = 2.0 * fp.particle_radius + fp.interaction_range;
        let forces: Vec<(usize, [f32; 3])> = {
            let kin = self.par_kin.read()?;
            let info = self.zone_info.read()?;
            let pars_zone = self.pars_zone.read()?;
            let members = self.thread_members.read()?;
            let owned_counts = self.num_par_in_thread.read()?;
            let zone_members = self.zone_members.read()?;
            let zone_counts = self.num_par_in_zone.read()?;

            (0..groups)
                .into_par_iter()
                .flat_map_iter(|g| {
                    owned_slice(&members, &owned_counts, n, g)
                        .iter()
                        .map(|&p| {
                            let p = p as usize;
                            let xp = xyz(kin[kin_index(p, KIN_POS)]);
                            let z = pars_zone[p] as usize;
                            let mut force = [0.0f32; 3];
                            let search = std::iter::once(z as u32).chain(info[z].neighbours().iter().copied());
                            for zz in search {
                                let zz = zz as usize;
                                let count = (zone_counts[zz] as usize).min(n);
                                for &q in &zone_members[zz * n..zz * n + count] {
                                    let q = q as usize;
                                    if q == p {
                                        continue;
                                    }
                                    let d = separation(&dims, &bcs, xp, xyz(kin[kin_index(q, KIN_POS)]));
                                    let dist = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                                    if dist <= 0.0 || dist >= cutoff {
                                        continue;
                                    }
                                    let push = fp.contact_stiffness * (cutoff - dist) / dist;
                                    for a in 0..3 {
                                        force[a] -= push * d[a];
                                    }
                                }
                            }
                            (p, force)
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        let mut out = self.par_force.write()?;
        for (p, force) in forces {
            out[p * FORCE_STRIDE] = vec4(force);
            out[p * FORCE_STRIDE + 1] = [0.0; 4];
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dynamics
// ---------------------------------------------------------------------------

/// Explicit rigid-body update of every owned particle.
///
/// Adds the particle-particle force to the sum of the fluid accumulation
/// slots, advances velocity, position and orientation by `dt`, and clears the
/// slots it consumed. Positions wrap on periodic axes and are held inside the
/// interior on the others.
#[derive(Debug, Clone)]
pub struct ParticleDynamics {
    /// Integer parameter block.
    pub int_params: DeviceBuffer<IntParams>,
    /// Floating-point parameter block.
    pub flp_params: DeviceBuffer<FlpParams>,
    /// Packed particle kinematics.
    pub par_kin: DeviceBuffer<Vec4>,
    /// Particle-particle force and torque.
    pub par_force: DeviceBuffer<Vec4>,
    /// Fluid force and torque slots per particle.
    pub par_fluid_force: DeviceBuffer<Vec4>,
    /// Neighbour cache per zone.
    pub zone_info: DeviceBuffer<ZoneInfo>,
    /// Zone id per particle.
    pub pars_zone: DeviceBuffer<u32>,
    /// Particles owned by each thread group.
    pub thread_members: DeviceBuffer<u32>,
    /// Owned particle count per thread group.
    pub num_par_in_thread: DeviceBuffer<u32>,
}

impl Kernel for ParticleDynamics {
    const ID: KernelId = KernelId::ParticleDynamics;

    fn run(&self, range: &NdRange) -> Result<(), KernelError> {
        let ip = param(&self.int_params)?;
        let fp = param(&self.flp_params)?;
        let (groups, n) = thread_groups(range, &ip, &self.thread_members, &self.num_par_in_thread)?;
        let nfa = ip.num_force_arrays.max(1) as usize;
        let dims = ip.dims();
        let bcs = ip.boundaries();
        ensure_len(&self.par_kin, n * KIN_STRIDE)?;
        ensure_len(&self.par_force, n * FORCE_STRIDE)?;
        ensure_len(&self.par_fluid_force, n * nfa * FORCE_STRIDE)?;

        let mass = fp.particle_mass();
        let inertia = fp.particle_inertia();
        if mass <= 0.0 || inertia <= 0.0 {
            return Ok(());
        }
        let dt = fp.dt;

        let mut kin = self.par_kin.write()?;
        let mut fluid = self.par_fluid_force.write()?;
        let updates: Vec<(usize, [Vec4; KIN_STRIDE])> = {
            let members = self.thread_members.read()?;
            let owned_counts = self.num_par_in_thread.read()?;
            let pair = self.par_force.read()?;
            let kin: &[Vec4] = &kin;
            let fluid: &[Vec4] = &fluid;
            (0..groups)
                .into_par_iter()
                .flat_map_iter(|g| {
                    owned_slice(&members, &owned_counts, n, g)
                        .iter()
                        .map(|&p| {
                            let p = p as usize;
                            let mut force = xyz(pair[p * FORCE_STRIDE]);
                            let mut torque = xyz(pair[p * FORCE_STRIDE + 1]);
                            for slot in 0..nfa {
                                let s = fluid_slot_index(p, slot, nfa);
                                for a in 0..3 {
                                    force[a] += fluid[s][a];
                                    torque[a] += fluid[s + 1][a];
                                }
                            }
                            let mut x = xyz(kin[kin_index(p, KIN_POS)]);
                            let mut v = xyz(kin[kin_index(p, KIN_VEL)]);
                            let mut w = xyz(kin[kin_index(p, KIN_ANG_VEL)]);
                            for a in 0..3 {
                                v[a] += force[a] / mass * dt;
                                w[a] += torque[a] / inertia * dt;
                                x[a] += v[a] * dt;
                                let hi = dims.size[a] as f32 - 1.0;
                                if bcs[a] == BoundaryKind::Periodic {
                                    x[a] = wrap_periodic(x[a], hi - 1.0);
                                } else if x[a] < 1.0 || x[a] > hi - 1.0 {
                                    x[a] = x[a].clamp(1.0, hi - 1.0);
                                    v[a] = 0.0;
                                }
                            }
                            let q = integrate_rotation(kin[kin_index(p, KIN_ROT)], w, dt);
                            (p, [vec4(x), vec4(v), q, vec4(w)])
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (p, record) in updates {
            kin[p * KIN_STRIDE..(p + 1) * KIN_STRIDE].copy_from_slice(&record);
            let s = fluid_slot_index(p, 0, nfa);
            fluid[s..s + nfa * FORCE_STRIDE].fill([0.0; 4]);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Zone membership
// ---------------------------------------------------------------------------

/// Re-files every particle into the zone containing its current position.
///
/// Zone counts must have been zeroed by the host before dispatch; members are
/// appended after whatever the counts already hold.
#[derive(Debug, Clone)]
pub struct UpdateParticleZones {
    /// Integer parameter block.
    pub int_params: DeviceBuffer<IntParams>,
    /// Floating-point parameter block.
    pub flp_params: DeviceBuffer<FlpParams>,
    /// Packed particle kinematics.
    pub par_kin: DeviceBuffer<Vec4>,
    /// Neighbour cache per zone.
    pub zone_info: DeviceBuffer<ZoneInfo>,
    /// Particles owned by each thread group.
    pub thread_members: DeviceBuffer<u32>,
    /// Owned particle count per thread group.
    pub num_par_in_thread: DeviceBuffer<u32>,
    /// Zone id per particle.
    pub pars_zone: DeviceBuffer<u32>,
    /// Member slots per zone.
    pub zone_members: DeviceBuffer<u32>,
    /// Member count per zone.
    pub num_par_in_zone: DeviceBuffer<u32>,
}

impl Kernel for UpdateParticleZones {
    const ID: KernelId = KernelId::UpdateParticleZones;

    fn run(&self, range: &NdRange) -> Result<(), KernelError> {
        let ip = param(&self.int_params)?;
        let fp = param(&self.flp_params)?;
        let (groups, n) = thread_groups(range, &ip, &self.thread_members, &self.num_par_in_thread)?;
        let grid = ZoneGrid::from_params(&ip, &fp);
        let zones = grid.total();
        ensure_len(&self.par_kin, n * KIN_STRIDE)?;
        ensure_len(&self.zone_info, zones)?;
        ensure_len(&self.pars_zone, n)?;
        ensure_len(&self.zone_members, zones * n)?;
        ensure_len(&self.num_par_in_zone, zones)?;

        let assignments: Vec<(u32, u32)> = {
            let kin = self.par_kin.read()?;
            let members = self.thread_members.read()?;
            let owned_counts = self.num_par_in_thread.read()?;
            let per_group: Vec<Vec<(u32, u32)>> = (0..groups)
                .into_par_iter()
                .map(|g| {
                    owned_slice(&members, &owned_counts, n, g)
                        .iter()
                        .map(|&p| (p, grid.zone_of(xyz(kin[kin_index(p as usize, KIN_POS)]))))
                        .collect()
                })
                .collect();
            per_group.into_iter().flatten().collect()
        };

        let mut pars_zone = self.pars_zone.write()?;
        let mut zone_members = self.zone_members.write()?;
        let mut counts = self.num_par_in_zone.write()?;
        // Stage into copies so an overflow leaves the index as it was
        let mut next_zone = pars_zone.clone();
        let mut next_members = zone_members.clone();
        let mut next_counts = counts.clone();
        scatter_members(&assignments, n, &mut next_zone, &mut next_members, &mut next_counts)?;
        *pars_zone = next_zone;
        *zone_members = next_members;
        *counts = next_counts;
        Ok(())
    }
}
