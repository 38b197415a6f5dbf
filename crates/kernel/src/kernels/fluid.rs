//! Lattice kernels: BGK collide-and-push, periodic wrap, velocity walls.

use rayon::prelude::*;

use super::{ensure_len, param, Kernel, KernelId, NdRange};
use crate::device::DeviceBuffer;
use crate::error::KernelError;
use crate::lattice::{equilibrium, moments, BoundaryKind, LatticeDims, E, LB_Q, OPP};
use crate::params::{FlpParams, IntParams};
use crate::stream_map::StreamLink;

// ---------------------------------------------------------------------------
// Collide + stream
// ---------------------------------------------------------------------------

/// BGK collision at every interior node followed by push streaming into
/// `f_dst`.
///
/// Pushes that cross a bounce-back face are reflected back into the source
/// node. Pushes that cross only periodic faces land in the halo of `f_dst`
/// for [`BoundaryPeriodic`] to wrap. Slots fed across a velocity face are left
/// for [`BoundaryVelocity`].
///
/// Side effects: the macroscopic velocity `u` (3 per node) and the local
/// relaxation time `tau_lb` of every interior node.
#[derive(Debug, Clone)]
pub struct CollideStream {
    /// Distributions read this step.
    pub f_src: DeviceBuffer<f32>,
    /// Distributions written this step.
    pub f_dst: DeviceBuffer<f32>,
    /// Macroscopic velocity, 3 per node.
    pub u: DeviceBuffer<f32>,
    /// Local relaxation time per node.
    pub tau_lb: DeviceBuffer<f32>,
    /// Per-node point-force field; slot 0 holds the folded total.
    pub gpf: DeviceBuffer<f32>,
    /// Occupied point-force slots per node.
    pub count_point: DeviceBuffer<u32>,
    /// Integer parameter block.
    pub int_params: DeviceBuffer<IntParams>,
    /// Floating-point parameter block.
    pub flp_params: DeviceBuffer<FlpParams>,
}

impl CollideStream {
    /// Rebind the two distribution buffers for the next step.
    pub fn bind_distributions(&mut self, src: &DeviceBuffer<f32>, dst: &DeviceBuffer<f32>) {
        self.f_src = src.clone();
        self.f_dst = dst.clone();
    }
}

impl Kernel for CollideStream {
    const ID: KernelId = KernelId::CollideStream;

    fn run(&self, range: &NdRange) -> Result<(), KernelError> {
        let region = range.as_grid()?;
        if self.f_src.same_buffer(&self.f_dst) {
            return Err(KernelError::Aliased { tag: self.f_dst.tag() });
        }
        let ip = param(&self.int_params)?;
        let fp = param(&self.flp_params)?;
        let dims = ip.dims();
        let bcs = ip.boundaries();
        let nodes = dims.num_nodes();
        let slots = ip.max_surf_points_per_node as usize;

        ensure_len(&self.f_src, nodes * LB_Q)?;
        ensure_len(&self.f_dst, nodes * LB_Q)?;
        ensure_len(&self.u, nodes * 3)?;
        ensure_len(&self.tau_lb, nodes)?;
        ensure_len(&self.count_point, nodes)?;
        ensure_len(&self.gpf, nodes * slots * 3)?;

        let src = self.f_src.read()?;
        let gpf = self.gpf.read()?;
        let count = self.count_point.read()?;

        // ---- collision ----
        let mut post = vec![0.0f32; nodes * LB_Q];
        {
            let mut u = self.u.write()?;
            let mut tau = self.tau_lb.write()?;
            post.par_chunks_mut(LB_Q)
                .zip(u[..nodes * 3].par_chunks_mut(3))
                .zip(tau[..nodes].par_iter_mut())
                .enumerate()
                .for_each(|(node, ((out, un), tn))| {
                    if !region.contains(dims.coords(node)) {
                        return;
                    }
                    let f = &src[node * LB_Q..(node + 1) * LB_Q];
                    let mut force = fp.body_force;
                    if slots > 0 && count[node] > 0 {
                        let base = node * slots * 3;
                        for a in 0..3 {
                            force[a] += gpf[base + a];
                        }
                    }
                    let (rho, j) = moments(f);
                    let rho = if rho > 0.0 { rho } else { fp.rho_init };
                    let u_eq = [0, 1, 2].map(|a| (j[a] + fp.tau * force[a]) / rho);
                    let feq = equilibrium(rho, u_eq);
                    for q in 0..LB_Q {
                        out[q] = f[q] - (f[q] - feq[q]) / fp.tau;
                    }
                    for a in 0..3 {
                        un[a] = (j[a] + 0.5 * force[a]) / rho;
                    }
                    *tn = fp.tau;
                });
        }

        // ---- streaming (gathered per destination slot) ----
        let mut dst = self.f_dst.write()?;
        dst[..nodes * LB_Q]
            .par_chunks_mut(LB_Q)
            .enumerate()
            .for_each(|(node, out)| {
                let c = dims.coords(node);
                let c_interior = dims.is_interior(c);
                for q in 0..LB_Q {
                    let from = step_back(c, E[q]);
                    let from_active = from.map_or(false, |s| region.contains(s));
                    if from_active {
                        if c_interior || !crosses(&dims, c, &bcs, BoundaryKind::BounceBack) {
                            let s = from.map_or(0, |s| dims.node_index(s));
                            out[q] = post[s * LB_Q + q];
                        }
                    } else if c_interior && region.contains(c) && q != 0 {
                        // Reflected population: the push of OPP[q] from `c` hit a wall.
                        let wall = match from {
                            Some(s) => crosses(&dims, s, &bcs, BoundaryKind::BounceBack),
                            None => true,
                        };
                        if wall {
                            out[q] = post[node * LB_Q + OPP[q]];
                        }
                    }
                }
            });
        Ok(())
    }
}

/// `c - e`, or `None` below zero.
#[inline]
fn step_back(c: [usize; 3], e: [i32; 3]) -> Option<[usize; 3]> {
    let mut out = [0usize; 3];
    for a in 0..3 {
        let v = c[a] as i64 - e[a] as i64;
        if v < 0 {
            return None;
        }
        out[a] = v as usize;
    }
    Some(out)
}

/// True if `c` lies outside the interior on some axis whose selector is `kind`.
#[inline]
fn crosses(dims: &LatticeDims, c: [usize; 3], bcs: &[BoundaryKind; 3], kind: BoundaryKind) -> bool {
    (0..3).any(|a| bcs[a] == kind && (c[a] == 0 || c[a] + 1 >= dims.size[a]))
}

// ---------------------------------------------------------------------------
// Periodic wrap
// ---------------------------------------------------------------------------

/// Copies halo slots back into the interior along the precomputed map.
#[derive(Debug, Clone)]
pub struct BoundaryPeriodic {
    /// The buffer collide-stream just wrote.
    pub f: DeviceBuffer<f32>,
    /// Integer parameter block.
    pub int_params: DeviceBuffer<IntParams>,
    /// Periodic wrap-around links.
    pub stream_map: DeviceBuffer<StreamLink>,
}

impl BoundaryPeriodic {
    /// Rebind the distribution buffer for the next step.
    pub fn bind_distributions(&mut self, dst: &DeviceBuffer<f32>) {
        self.f = dst.clone();
    }
}

impl Kernel for BoundaryPeriodic {
    const ID: KernelId = KernelId::BoundaryPeriodic;

    fn run(&self, range: &NdRange) -> Result<(), KernelError> {
        let n = range.as_linear()?;
        ensure_len(&self.stream_map, n)?;
        let ip = param(&self.int_params)?;
        ensure_len(&self.f, ip.dims().num_distributions())?;

        let map = self.stream_map.read()?;
        let mut f = self.f.write()?;
        for link in &map[..n] {
            f[link.dst as usize] = f[link.src as usize];
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Velocity walls
// ---------------------------------------------------------------------------

/// Prescribed-velocity wall on the first and last interior layers normal to
/// `wall_axis`.
///
/// Id 1 along the wall axis selects the lower layer (velocity `vel_lower`),
/// id 2 the upper layer (`vel_upper`). Every population of a wall node is
/// replaced by the equilibrium at the wall velocity. With `calc_rho` the
/// density comes from the known populations (Zou/He closure); otherwise the
/// reference density is used.
#[derive(Debug, Clone)]
pub struct BoundaryVelocity {
    /// Distributions written this step.
    pub f: DeviceBuffer<f32>,
    /// Integer parameter block.
    pub int_params: DeviceBuffer<IntParams>,
    /// Floating-point parameter block.
    pub flp_params: DeviceBuffer<FlpParams>,
    wall_axis: u32,
    calc_rho: bool,
}

impl BoundaryVelocity {
    /// Bind a wall pass over `wall_axis`.
    pub fn new(
        f: DeviceBuffer<f32>,
        int_params: DeviceBuffer<IntParams>,
        flp_params: DeviceBuffer<FlpParams>,
        wall_axis: u32,
        calc_rho: bool,
    ) -> Self {
        Self {
            f,
            int_params,
            flp_params,
            wall_axis,
            calc_rho,
        }
    }

    /// Rebind the distribution buffer for the next step.
    pub fn bind_distributions(&mut self, dst: &DeviceBuffer<f32>) {
        self.f = dst.clone();
    }

    /// Rebind the axis / density-flag pair.
    pub fn set_wall(&mut self, axis: u32, calc_rho: bool) {
        self.wall_axis = axis;
        self.calc_rho = calc_rho;
    }

    /// Currently bound axis / density-flag pair.
    pub fn wall(&self) -> (u32, bool) {
        (self.wall_axis, self.calc_rho)
    }
}

impl Kernel for BoundaryVelocity {
    const ID: KernelId = KernelId::BoundaryVelocity;

    fn run(&self, range: &NdRange) -> Result<(), KernelError> {
        let region = range.as_grid()?;
        let axis = self.wall_axis as usize;
        if axis > 2 {
            return Err(KernelError::InvalidRange {
                range: range.to_string(),
                reason: format!("wall axis {axis} out of range"),
            });
        }
        let ip = param(&self.int_params)?;
        let fp = param(&self.flp_params)?;
        let dims = ip.dims();
        ensure_len(&self.f, dims.num_distributions())?;
        let upper_layer = dims.size[axis].saturating_sub(2).max(1);

        let mut f = self.f.write()?;
        let ids: Vec<[usize; 3]> = region.ids().collect();
        let updates: Vec<(usize, [f32; LB_Q])> = {
            let view: &[f32] = &f;
            ids.par_iter()
                .map(|id| {
                    let lower = id[axis] == 1;
                    let mut c = *id;
                    c[axis] = if lower { 1 } else { upper_layer };
                    let node = dims.node_index(c);
                    let wall_u = if lower { fp.vel_lower } else { fp.vel_upper };
                    let rho = if self.calc_rho {
                        let normal = if lower { 1 } else { -1 };
                        wall_density(&view[node * LB_Q..(node + 1) * LB_Q], axis, normal, wall_u[axis])
                    } else {
                        fp.rho_init
                    };
                    (node, equilibrium(rho, wall_u))
                })
                .collect()
        };
        for (node, feq) in updates {
            f[node * LB_Q..(node + 1) * LB_Q].copy_from_slice(&feq);
        }
        Ok(())
    }
}

/// Density at a wall node from the populations that are already known.
///
/// `normal` is the inward wall normal along `axis` (+1 lower wall, -1 upper).
fn wall_density(f: &[f32], axis: usize, normal: i32, u_normal: f32) -> f32 {
    let mut tangential = 0.0f32;
    let mut outgoing = 0.0f32;
    for q in 0..LB_Q {
        let e = E[q][axis];
        if e == 0 {
            tangential += f[q];
        } else if e == -normal {
            outgoing += f[q];
        }
    }
    (tangential + 2.0 * outgoing) / (1.0 - normal as f32 * u_normal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Access, DeviceContext};
    use crate::lattice::{LatticeDims, Region, W};
    use crate::stream_map::PeriodicStreamMap;

    struct Fixture {
        ctx: DeviceContext,
        collide: CollideStream,
        periodic: BoundaryPeriodic,
        dims: LatticeDims,
        map_len: usize,
    }

    fn int_params(dims: &LatticeDims, bcs: [BoundaryKind; 3]) -> IntParams {
        let mut ip: IntParams = bytemuck::Zeroable::zeroed();
        ip.lattice_size = dims.size.map(|s| s as u32);
        ip.boundary_conds = bcs.map(BoundaryKind::raw);
        ip.max_surf_points_per_node = 1;
        ip
    }

    fn flp_params() -> FlpParams {
        let mut fp: FlpParams = bytemuck::Zeroable::zeroed();
        fp.tau = 0.8;
        fp.rho_init = 1.0;
        fp
    }

    fn fixture(size: [usize; 3], bcs: [BoundaryKind; 3], init: &dyn Fn([usize; 3]) -> [f32; 3]) -> Fixture {
        let ctx = DeviceContext::new(None).unwrap();
        let dims = LatticeDims::new(size);
        let mut f0 = vec![0.0f32; dims.num_distributions()];
        for node in 0..dims.num_nodes() {
            let c = dims.coords(node);
            if dims.is_interior(c) {
                f0[node * LB_Q..(node + 1) * LB_Q].copy_from_slice(&equilibrium(1.0, init(c)));
            }
        }
        let map = PeriodicStreamMap::build(&dims, bcs).unwrap();
        let ip = ctx.create_buffer("int_params", Access::ReadOnly, &[int_params(&dims, bcs)]).unwrap();
        let fp = ctx.create_buffer("flp_params", Access::ReadOnly, &[flp_params()]).unwrap();
        let fa = ctx.create_buffer("f_a", Access::ReadWrite, &f0).unwrap();
        let fb = ctx.create_buffer("f_b", Access::ReadWrite, &f0).unwrap();
        let nodes = dims.num_nodes();
        let collide = CollideStream {
            f_src: fa,
            f_dst: fb.clone(),
            u: ctx.create_zeroed("u", Access::ReadWrite, nodes * 3).unwrap(),
            tau_lb: ctx.create_zeroed("tau_lb", Access::ReadWrite, nodes).unwrap(),
            gpf: ctx.create_zeroed("gpf", Access::ReadWrite, nodes * 3).unwrap(),
            count_point: ctx.create_zeroed("count_point", Access::ReadWrite, nodes).unwrap(),
            int_params: ip.clone(),
            flp_params: fp,
        };
        let periodic = BoundaryPeriodic {
            f: fb,
            int_params: ip,
            stream_map: ctx.create_buffer("stream_map", Access::ReadOnly, map.links()).unwrap(),
        };
        Fixture {
            ctx,
            collide,
            periodic,
            dims,
            map_len: map.len(),
        }
    }

    fn step(fx: &mut Fixture) {
        let interior = NdRange::Grid(Region::interior(&fx.dims));
        fx.ctx.gpu().dispatch(&fx.collide, interior).unwrap();
        if fx.map_len > 0 {
            fx.ctx.gpu().dispatch(&fx.periodic, NdRange::linear(fx.map_len)).unwrap();
        }
        fx.ctx.gpu().finish().unwrap();
        let (src, dst) = (fx.collide.f_src.clone(), fx.collide.f_dst.clone());
        fx.collide.bind_distributions(&dst, &src);
        fx.periodic.bind_distributions(&src);
    }

    fn interior_mass(fx: &Fixture) -> f64 {
        let f = fx.ctx.gpu().read_buffer(&fx.collide.f_src).unwrap();
        (0..fx.dims.num_nodes())
            .filter(|&n| fx.dims.is_interior(fx.dims.coords(n)))
            .map(|n| f[n * LB_Q..(n + 1) * LB_Q].iter().map(|&v| v as f64).sum::<f64>())
            .sum()
    }

    #[test]
    fn rest_state_is_a_fixed_point() {
        let p = BoundaryKind::Periodic;
        let mut fx = fixture([6, 6, 6], [p, p, p], &|_| [0.0; 3]);
        step(&mut fx);
        let f = fx.ctx.gpu().read_buffer(&fx.collide.f_src).unwrap();
        let node = fx.dims.node_index([3, 3, 3]);
        for q in 0..LB_Q {
            assert!((f[node * LB_Q + q] - W[q]).abs() < 1e-6, "direction {q}");
        }
    }

    #[test]
    fn periodic_flow_conserves_mass_and_momentum() {
        let p = BoundaryKind::Periodic;
        let mut fx = fixture([10, 8, 6], [p, p, p], &|c| {
            [0.02 * ((c[1] as f32) * 0.7).sin(), 0.0, 0.01 * ((c[0] as f32) * 0.5).cos()]
        });
        let m0 = interior_mass(&fx);
        for _ in 0..6 {
            step(&mut fx);
        }
        let m1 = interior_mass(&fx);
        assert!((m1 - m0).abs() / m0 < 1e-5, "mass drifted from {m0} to {m1}");
    }

    #[test]
    fn bounce_back_walls_conserve_mass() {
        let p = BoundaryKind::Periodic;
        let b = BoundaryKind::BounceBack;
        let mut fx = fixture([7, 9, 7], [p, b, p], &|c| [0.03 * (c[2] as f32 - 3.0), 0.01, 0.0]);
        let m0 = interior_mass(&fx);
        for _ in 0..8 {
            step(&mut fx);
        }
        let m1 = interior_mass(&fx);
        assert!((m1 - m0).abs() / m0 < 1e-5, "mass drifted from {m0} to {m1}");
    }

    #[test]
    fn aliased_buffers_are_rejected() {
        let p = BoundaryKind::Periodic;
        let mut fx = fixture([5, 5, 5], [p, p, p], &|_| [0.0; 3]);
        let same = fx.collide.f_src.clone();
        fx.collide.bind_distributions(&same, &same);
        let err = fx
            .collide
            .run(&NdRange::Grid(Region::interior(&fx.dims)))
            .unwrap_err();
        assert!(matches!(err, KernelError::Aliased { .. }));
    }

    #[test]
    fn velocity_wall_imposes_equilibrium() {
        let ctx = DeviceContext::new(None).unwrap();
        let v = BoundaryKind::Velocity;
        let p = BoundaryKind::Periodic;
        let dims = LatticeDims::new([6, 7, 6]);
        let mut fp = flp_params();
        fp.vel_lower = [0.05, 0.0, 0.0];
        fp.vel_upper = [-0.05, 0.0, 0.0];
        let f0 = vec![1.0f32 / LB_Q as f32; dims.num_distributions()];
        let mut ip = int_params(&dims, [p, v, p]);
        ip.vel_wall_axis = 1;
        let f = ctx.create_buffer("f", Access::ReadWrite, &f0).unwrap();
        let k = BoundaryVelocity::new(
            f.clone(),
            ctx.create_buffer("int_params", Access::ReadOnly, &[ip]).unwrap(),
            ctx.create_buffer("flp_params", Access::ReadOnly, &[fp]).unwrap(),
            1,
            true,
        );
        ctx.gpu()
            .dispatch(&k, NdRange::Grid(Region::velocity_slab(&dims, 1)))
            .unwrap();
        let out = ctx.gpu().read_buffer(&f).unwrap();
        for (y, ux) in [(1usize, 0.05f32), (5, -0.05)] {
            let node = dims.node_index([2, y, 3]);
            let (rho, j) = moments(&out[node * LB_Q..(node + 1) * LB_Q]);
            assert!((j[0] / rho - ux).abs() < 1e-5, "layer {y}");
            assert!(rho > 0.0);
        }
        // a node between the walls is untouched
        let mid = dims.node_index([2, 3, 3]);
        assert_eq!(out[mid * LB_Q], 1.0 / LB_Q as f32);
    }

    #[test]
    fn wall_density_matches_uniform_state() {
        let feq = equilibrium(1.3, [0.0; 3]);
        let rho = wall_density(&feq, 2, 1, 0.0);
        assert!((rho - 1.3).abs() < 1e-5);
    }
}
