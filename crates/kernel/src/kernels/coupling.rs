//! Particle-fluid coupling through surface points.
//!
//! Each surface point compares the particle's rigid-body velocity at that
//! point with the fluid velocity interpolated from the 8 surrounding nodes
//! and produces a penalty force. The force is spread back onto those nodes
//! through per-node slots in `gpf` (`max_surf_points_per_node` slots of 3
//! floats each); the reaction lands in the particle's accumulation slot
//! `point % num_force_arrays`.

use rayon::prelude::*;

use super::{ensure_len, param, Kernel, KernelId, NdRange};
use crate::device::DeviceBuffer;
use crate::error::KernelError;
use crate::lattice::{BoundaryKind, LatticeDims};
use crate::params::{FlpParams, IntParams};
use crate::particle::{
    cross, fluid_slot_index, kin_index, rotate, xyz, Vec4, FORCE_STRIDE, KIN_ANG_VEL, KIN_POS, KIN_ROT,
    KIN_STRIDE, KIN_VEL,
};

// ---------------------------------------------------------------------------
// Reset
// ---------------------------------------------------------------------------

/// Clears the per-node point-force slots and counts over the interior.
#[derive(Debug, Clone)]
pub struct ResetParticleFluidForces {
    /// Integer parameter block.
    pub int_params: DeviceBuffer<IntParams>,
    /// Floating-point parameter block.
    pub flp_params: DeviceBuffer<FlpParams>,
    /// Per-node point-force slots, 3 components each.
    pub gpf: DeviceBuffer<f32>,
    /// Occupied point-force slots per node.
    pub count_point: DeviceBuffer<u32>,
}

impl Kernel for ResetParticleFluidForces {
    const ID: KernelId = KernelId::ResetParticleFluidForces;

    fn run(&self, range: &NdRange) -> Result<(), KernelError> {
        let region = range.as_grid()?;
        let ip = param(&self.int_params)?;
        let dims = ip.dims();
        let nodes = dims.num_nodes();
        let stride = ip.max_surf_points_per_node as usize * 3;
        ensure_len(&self.gpf, nodes * stride)?;
        ensure_len(&self.count_point, nodes)?;

        let mut count = self.count_point.write()?;
        count[..nodes].par_iter_mut().enumerate().for_each(|(node, c)| {
            if region.contains(dims.coords(node)) {
                *c = 0;
            }
        });
        if stride > 0 {
            let mut gpf = self.gpf.write()?;
            gpf[..nodes * stride]
                .par_chunks_mut(stride)
                .enumerate()
                .for_each(|(node, slots)| {
                    if region.contains(dims.coords(node)) {
                        slots.fill(0.0);
                    }
                });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-point forces
// ---------------------------------------------------------------------------

/// Penalty force at every surface point, linear (trilinear) stencil.
#[derive(Debug, Clone)]
pub struct ParticleFluidForces {
    /// Integer parameter block.
    pub int_params: DeviceBuffer<IntParams>,
    /// Floating-point parameter block.
    pub flp_params: DeviceBuffer<FlpParams>,
    /// Macroscopic velocity, 3 per node.
    pub u: DeviceBuffer<f32>,
    /// Packed particle kinematics.
    pub par_kin: DeviceBuffer<Vec4>,
    /// Shared unit-sphere surface directions.
    pub surface_points: DeviceBuffer<Vec4>,
    /// Per-node point-force slots, 3 components each.
    pub gpf: DeviceBuffer<f32>,
    /// Occupied point-force slots per node.
    pub count_point: DeviceBuffer<u32>,
    /// Fluid force and torque slots per particle.
    pub par_fluid_force: DeviceBuffer<Vec4>,
    /// Per-point (force on fluid, torque on particle) records.
    pub point_force: DeviceBuffer<Vec4>,
}

struct PointResult {
    particle: usize,
    force: [f32; 3],
    torque: [f32; 3],
    stencil: [(usize, f32); 8],
    stencil_len: usize,
}

impl Kernel for ParticleFluidForces {
    const ID: KernelId = KernelId::ParticleFluidForces;

    fn run(&self, range: &NdRange) -> Result<(), KernelError> {
        let global = range.as_linear()?;
        let ip = param(&self.int_params)?;
        let fp = param(&self.flp_params)?;
        let dims = ip.dims();
        let bcs = ip.boundaries();
        let nodes = dims.num_nodes();
        let ppp = ip.points_per_particle as usize;
        let nfa = ip.num_force_arrays.max(1) as usize;
        let slots = ip.max_surf_points_per_node as usize;
        let n_points = global.min(ip.total_surf_points as usize);
        if ppp == 0 || n_points == 0 {
            return Ok(());
        }
        let n_particles = n_points.div_ceil(ppp);

        ensure_len(&self.u, nodes * 3)?;
        ensure_len(&self.par_kin, n_particles * KIN_STRIDE)?;
        ensure_len(&self.surface_points, ppp)?;
        ensure_len(&self.gpf, nodes * slots * 3)?;
        ensure_len(&self.count_point, nodes)?;
        ensure_len(&self.par_fluid_force, n_particles * nfa * FORCE_STRIDE)?;
        ensure_len(&self.point_force, n_points * FORCE_STRIDE)?;

        let results: Vec<PointResult> = {
            let u = self.u.read()?;
            let kin = self.par_kin.read()?;
            let dirs = self.surface_points.read()?;
            (0..n_points)
                .into_par_iter()
                .map(|i| {
                    let p = i / ppp;
                    let k = i % ppp;
                    let x = xyz(kin[kin_index(p, KIN_POS)]);
                    let v = xyz(kin[kin_index(p, KIN_VEL)]);
                    let q = kin[kin_index(p, KIN_ROT)];
                    let w = xyz(kin[kin_index(p, KIN_ANG_VEL)]);

                    let r = rotate(q, xyz(dirs[k])).map(|c| c * fp.particle_radius);
                    let xp = [x[0] + r[0], x[1] + r[1], x[2] + r[2]];
                    let wr = cross(w, r);
                    let vp = [v[0] + wr[0], v[1] + wr[1], v[2] + wr[2]];

                    let (stencil, stencil_len) = trilinear_stencil(&dims, &bcs, xp);
                    let mut uf = [0.0f32; 3];
                    let mut wsum = 0.0f32;
                    for &(node, wt) in &stencil[..stencil_len] {
                        for a in 0..3 {
                            uf[a] += wt * u[node * 3 + a];
                        }
                        wsum += wt;
                    }
                    if wsum > 0.0 {
                        uf = uf.map(|c| c / wsum);
                    }
                    let force = [0, 1, 2].map(|a| fp.coupling_stiffness * (vp[a] - uf[a]));
                    let reaction = force.map(|c| -c);
                    PointResult {
                        particle: p,
                        force,
                        torque: cross(r, reaction),
                        stencil,
                        stencil_len,
                    }
                })
                .collect()
        };

        let mut gpf = self.gpf.write()?;
        let mut count = self.count_point.write()?;
        let mut pff = self.par_fluid_force.write()?;
        let mut pf = self.point_force.write()?;
        let mut dropped = 0usize;
        for (i, res) in results.iter().enumerate() {
            for &(node, wt) in &res.stencil[..res.stencil_len] {
                let slot = count[node] as usize;
                if slot >= slots {
                    dropped += 1;
                    continue;
                }
                let base = (node * slots + slot) * 3;
                for a in 0..3 {
                    gpf[base + a] = wt * res.force[a];
                }
                count[node] += 1;
            }
            let s = fluid_slot_index(res.particle, i % nfa, nfa);
            for a in 0..3 {
                pff[s][a] -= res.force[a];
                pff[s + 1][a] += res.torque[a];
            }
            pf[i * FORCE_STRIDE] = [res.force[0], res.force[1], res.force[2], 0.0];
            pf[i * FORCE_STRIDE + 1] = [res.torque[0], res.torque[1], res.torque[2], 0.0];
        }
        if dropped > 0 {
            tracing::debug!(dropped, slots, "point-force slots exhausted on some nodes");
        }
        Ok(())
    }
}

/// Interior node holding lattice coordinate `v` on `axis`: wrapped on
/// periodic axes, `None` outside the interior otherwise.
fn stencil_coord(dims: &LatticeDims, bcs: &[BoundaryKind; 3], axis: usize, v: i64) -> Option<usize> {
    let n = dims.size[axis] as i64 - 2;
    if (1..=n).contains(&v) {
        Some(v as usize)
    } else if bcs[axis] == BoundaryKind::Periodic && n > 0 {
        Some(((v - 1).rem_euclid(n) + 1) as usize)
    } else {
        None
    }
}

/// Nodes and weights of the trilinear stencil around `x`.
fn trilinear_stencil(dims: &LatticeDims, bcs: &[BoundaryKind; 3], x: [f32; 3]) -> ([(usize, f32); 8], usize) {
    let base = x.map(|c| c.floor());
    let frac = [x[0] - base[0], x[1] - base[1], x[2] - base[2]];
    let mut out = [(0usize, 0.0f32); 8];
    let mut len = 0;
    for corner in 0..8 {
        let d = [corner & 1, (corner >> 1) & 1, (corner >> 2) & 1];
        let mut c = [0usize; 3];
        let mut wt = 1.0f32;
        let mut valid = true;
        for a in 0..3 {
            match stencil_coord(dims, bcs, a, base[a] as i64 + d[a] as i64) {
                Some(v) => c[a] = v,
                None => valid = false,
            }
            wt *= if d[a] == 1 { frac[a] } else { 1.0 - frac[a] };
        }
        if valid && wt > 0.0 {
            out[len] = (dims.node_index(c), wt);
            len += 1;
        }
    }
    (out, len)
}

// ---------------------------------------------------------------------------
// Per-node fold
// ---------------------------------------------------------------------------

/// Folds the filled point-force slots of every interior node into slot 0,
/// where collide-stream picks it up on the next step.
#[derive(Debug, Clone)]
pub struct SumParticleFluidForces {
    /// Integer parameter block.
    pub int_params: DeviceBuffer<IntParams>,
    /// Floating-point parameter block.
    pub flp_params: DeviceBuffer<FlpParams>,
    /// Per-node point-force slots, 3 components each.
    pub gpf: DeviceBuffer<f32>,
    /// Occupied point-force slots per node.
    pub count_point: DeviceBuffer<u32>,
}

impl Kernel for SumParticleFluidForces {
    const ID: KernelId = KernelId::SumParticleFluidForces;

    fn run(&self, range: &NdRange) -> Result<(), KernelError> {
        let region = range.as_grid()?;
        let ip = param(&self.int_params)?;
        let dims = ip.dims();
        let nodes = dims.num_nodes();
        let slots = ip.max_surf_points_per_node as usize;
        if slots == 0 {
            return Ok(());
        }
        let stride = slots * 3;
        ensure_len(&self.gpf, nodes * stride)?;
        ensure_len(&self.count_point, nodes)?;

        let count = self.count_point.read()?;
        let mut gpf = self.gpf.write()?;
        gpf[..nodes * stride]
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(node, field)| {
                let n = (count[node] as usize).min(slots);
                if n < 2 || !region.contains(dims.coords(node)) {
                    return;
                }
                let mut total = [0.0f32; 3];
                for k in 0..n {
                    for a in 0..3 {
                        total[a] += field[k * 3 + a];
                    }
                }
                field[..3].copy_from_slice(&total);
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Access, DeviceContext};
    use crate::lattice::Region;
    use crate::particle::{sphere_surface_points, sum_fluid_slots, ParticleState};

    struct Coupled {
        ctx: DeviceContext,
        reset: ResetParticleFluidForces,
        points: ParticleFluidForces,
        sum: SumParticleFluidForces,
        dims: LatticeDims,
        total_points: usize,
    }

    fn coupled(velocity: [f32; 3], fluid_u: [f32; 3]) -> Coupled {
        let ctx = DeviceContext::new(None).unwrap();
        let dims = LatticeDims::new([12, 12, 12]);
        let p = BoundaryKind::Periodic;
        let ppp = 32;
        let nfa = 2;
        let slots = 16;

        let mut ip: IntParams = bytemuck::Zeroable::zeroed();
        ip.lattice_size = [12, 12, 12];
        ip.boundary_conds = [p, p, p].map(BoundaryKind::raw);
        ip.num_particles = 1;
        ip.points_per_particle = ppp as u32;
        ip.total_surf_points = ppp as u32;
        ip.num_force_arrays = nfa as u32;
        ip.max_surf_points_per_node = slots as u32;
        let mut fp: FlpParams = bytemuck::Zeroable::zeroed();
        fp.tau = 1.0;
        fp.rho_init = 1.0;
        fp.particle_radius = 2.5;
        fp.coupling_stiffness = 0.5;

        let mut ps = ParticleState::new(nfa);
        ps.push([6.2, 6.0, 5.7], velocity);
        let nodes = dims.num_nodes();
        let u: Vec<f32> = (0..nodes).flat_map(|_| fluid_u).collect();

        let ipb = ctx.create_buffer("int_params", Access::ReadOnly, &[ip]).unwrap();
        let fpb = ctx.create_buffer("flp_params", Access::ReadOnly, &[fp]).unwrap();
        let gpf = ctx.create_zeroed("gpf", Access::ReadWrite, nodes * slots * 3).unwrap();
        let count = ctx.create_zeroed("count_point", Access::ReadWrite, nodes).unwrap();
        let points = ParticleFluidForces {
            int_params: ipb.clone(),
            flp_params: fpb.clone(),
            u: ctx.create_buffer("u", Access::ReadWrite, &u).unwrap(),
            par_kin: ctx.create_buffer("par_kin", Access::ReadWrite, &ps.kinematics).unwrap(),
            surface_points: ctx
                .create_buffer("surface_points", Access::ReadOnly, &sphere_surface_points(ppp))
                .unwrap(),
            gpf: gpf.clone(),
            count_point: count.clone(),
            par_fluid_force: ctx
                .create_buffer("par_fluid_force", Access::ReadWrite, &ps.fluid_forces)
                .unwrap(),
            point_force: ctx.create_zeroed("point_force", Access::ReadWrite, ppp * 2).unwrap(),
        };
        Coupled {
            reset: ResetParticleFluidForces {
                int_params: ipb.clone(),
                flp_params: fpb.clone(),
                gpf: gpf.clone(),
                count_point: count.clone(),
            },
            sum: SumParticleFluidForces {
                int_params: ipb,
                flp_params: fpb,
                gpf,
                count_point: count,
            },
            points,
            ctx,
            dims,
            total_points: ppp,
        }
    }

    #[test]
    fn particle_matching_fluid_feels_no_force() {
        let c = coupled([0.01, 0.0, 0.0], [0.01, 0.0, 0.0]);
        c.ctx.gpu().dispatch(&c.points, NdRange::tiled(c.total_points, 32)).unwrap();
        let pff = c.ctx.gpu().read_buffer(&c.points.par_fluid_force).unwrap();
        let (force, _) = sum_fluid_slots(&pff, 2)[0];
        assert!(force.iter().all(|f| f.abs() < 1e-6), "force {force:?}");
    }

    #[test]
    fn moving_particle_is_dragged_back_and_fluid_pushed_forward() {
        let c = coupled([0.02, 0.0, 0.0], [0.0; 3]);
        let interior = NdRange::Grid(Region::interior(&c.dims));
        let gpu = c.ctx.gpu();
        gpu.dispatch(&c.reset, interior).unwrap();
        gpu.dispatch(&c.points, NdRange::tiled(c.total_points, 32)).unwrap();
        gpu.dispatch(&c.sum, interior).unwrap();

        let pff = gpu.read_buffer(&c.points.par_fluid_force).unwrap();
        let (force, _) = sum_fluid_slots(&pff, 2)[0];
        assert!(force[0] < 0.0, "particle should be decelerated, got {force:?}");
        assert!((force[0] + 0.5 * 0.02 * 32.0).abs() < 1e-4, "force {force:?}");

        // total force deposited on the fluid balances the reaction
        let gpf = gpu.read_buffer(&c.points.gpf).unwrap();
        let count = gpu.read_buffer(&c.points.count_point).unwrap();
        let slots = 16;
        let fluid_x: f32 = (0..c.dims.num_nodes())
            .filter(|&n| count[n] > 0)
            .map(|n| gpf[n * slots * 3])
            .sum();
        assert!((fluid_x + force[0]).abs() < 1e-4, "fluid {fluid_x} vs particle {}", force[0]);
    }

    #[test]
    fn reset_clears_counts() {
        let c = coupled([0.02, 0.0, 0.0], [0.0; 3]);
        let gpu = c.ctx.gpu();
        gpu.dispatch(&c.points, NdRange::tiled(c.total_points, 32)).unwrap();
        gpu.dispatch(&c.reset, NdRange::Grid(Region::interior(&c.dims))).unwrap();
        let count = gpu.read_buffer(&c.points.count_point).unwrap();
        assert!(count.iter().all(|&n| n == 0));
    }

    #[test]
    fn stencil_wraps_on_periodic_axes() {
        let dims = LatticeDims::new([6, 6, 6]);
        let p = BoundaryKind::Periodic;
        let (nodes, len) = trilinear_stencil(&dims, &[p, p, p], [4.5, 2.0, 2.0]);
        assert_eq!(len, 2);
        let xs: Vec<usize> = nodes[..len].iter().map(|(n, _)| dims.coords(*n)[0]).collect();
        assert!(xs.contains(&4) && xs.contains(&1), "{xs:?}");
    }
}
