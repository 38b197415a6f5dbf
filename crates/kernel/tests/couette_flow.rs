//! Shear flow between two prescribed-velocity walls.
//!
//! Drives collide-stream, the periodic wrap and the velocity boundary kernel
//! through the GPU-class queue with ping-pong buffers and checks that a
//! monotonic shear profile develops while mass stays bounded.

use lb_kernel::kernels::{BoundaryPeriodic, BoundaryVelocity, CollideStream};
use lb_kernel::lattice::equilibrium;
use lb_kernel::{
    Access, BoundaryKind, DeviceBuffer, DeviceContext, FlpParams, IntParams, LatticeDims, NdRange,
    PeriodicStreamMap, Region, LB_Q,
};

const SIZE: [usize; 3] = [6, 14, 6];
const U_WALL: f32 = 0.05;

struct Channel {
    ctx: DeviceContext,
    f: [DeviceBuffer<f32>; 2],
    u: DeviceBuffer<f32>,
    collide: CollideStream,
    periodic: BoundaryPeriodic,
    velocity: BoundaryVelocity,
    dims: LatticeDims,
    links: usize,
}

fn channel() -> Channel {
    let ctx = DeviceContext::new(None).expect("device context");
    let dims = LatticeDims::new(SIZE);
    let bcs = [BoundaryKind::Periodic, BoundaryKind::Velocity, BoundaryKind::Periodic];

    let mut ip: IntParams = bytemuck::Zeroable::zeroed();
    ip.lattice_size = SIZE.map(|s| s as u32);
    ip.boundary_conds = bcs.map(BoundaryKind::raw);
    ip.vel_wall_axis = 1;
    ip.max_surf_points_per_node = 1;
    let mut fp: FlpParams = bytemuck::Zeroable::zeroed();
    fp.tau = 1.0;
    fp.rho_init = 1.0;
    fp.vel_upper = [U_WALL, 0.0, 0.0];

    let rest = equilibrium(1.0, [0.0; 3]);
    let f0: Vec<f32> = (0..dims.num_nodes()).flat_map(|_| rest).collect();
    let nodes = dims.num_nodes();
    let map = PeriodicStreamMap::build(&dims, bcs).unwrap();

    let ip = ctx.create_buffer("int_params", Access::ReadOnly, &[ip]).unwrap();
    let fp = ctx.create_buffer("flp_params", Access::ReadOnly, &[fp]).unwrap();
    let fa = ctx.create_buffer("f_a", Access::ReadWrite, &f0).unwrap();
    let fb = ctx.create_buffer("f_b", Access::ReadWrite, &f0).unwrap();
    let u = ctx.create_zeroed::<f32>("u", Access::ReadWrite, nodes * 3).unwrap();

    Channel {
        collide: CollideStream {
            f_src: fa.clone(),
            f_dst: fb.clone(),
            u: u.clone(),
            tau_lb: ctx.create_zeroed("tau_lb", Access::ReadWrite, nodes).unwrap(),
            gpf: ctx.create_zeroed("gpf", Access::ReadWrite, nodes * 3).unwrap(),
            count_point: ctx.create_zeroed("count_point", Access::ReadWrite, nodes).unwrap(),
            int_params: ip.clone(),
            flp_params: fp.clone(),
        },
        periodic: BoundaryPeriodic {
            f: fb.clone(),
            int_params: ip.clone(),
            stream_map: ctx.create_buffer("stream_map", Access::ReadOnly, map.links()).unwrap(),
        },
        velocity: BoundaryVelocity::new(fb.clone(), ip, fp, 1, true),
        f: [fa, fb],
        u,
        links: map.len(),
        dims,
        ctx,
    }
}

fn run(ch: &mut Channel, steps: u64) {
    let interior = NdRange::Grid(Region::interior(&ch.dims));
    let slab = NdRange::Grid(Region::velocity_slab(&ch.dims, 1));
    for t in 1..=steps {
        let (src, dst) = if t % 2 == 0 { (0, 1) } else { (1, 0) };
        ch.collide.bind_distributions(&ch.f[src], &ch.f[dst]);
        ch.periodic.bind_distributions(&ch.f[dst]);
        ch.velocity.bind_distributions(&ch.f[dst]);
        let gpu = ch.ctx.gpu();
        gpu.dispatch(&ch.collide, interior).unwrap();
        gpu.dispatch(&ch.periodic, NdRange::linear(ch.links)).unwrap();
        gpu.dispatch(&ch.velocity, slab).unwrap();
    }
    ch.ctx.gpu().finish().unwrap();
}

fn mean_ux_by_layer(ch: &Channel) -> Vec<f32> {
    let u = ch.ctx.gpu().read_buffer(&ch.u).unwrap();
    (1..SIZE[1] - 1)
        .map(|y| {
            let mut sum = 0.0;
            let mut n = 0;
            for z in 1..SIZE[2] - 1 {
                for x in 1..SIZE[0] - 1 {
                    sum += u[ch.dims.node_index([x, y, z]) * 3];
                    n += 1;
                }
            }
            sum / n as f32
        })
        .collect()
}

#[test]
fn shear_profile_is_monotonic() {
    let mut ch = channel();
    run(&mut ch, 400);
    let profile = mean_ux_by_layer(&ch);
    for w in profile.windows(2) {
        assert!(w[1] >= w[0] - 1e-6, "profile not monotonic: {profile:?}");
    }
    let mid = profile[profile.len() / 2];
    assert!(mid > 0.0 && mid < U_WALL, "mid-channel velocity {mid} outside (0, {U_WALL})");
}

#[test]
fn density_stays_near_reference() {
    let mut ch = channel();
    run(&mut ch, 200);
    let f = ch.ctx.gpu().read_buffer(&ch.f[1]).unwrap();
    let region = Region::interior(&ch.dims);
    for c in region.ids() {
        let node = ch.dims.node_index(c);
        let rho: f32 = f[node * LB_Q..(node + 1) * LB_Q].iter().sum();
        assert!((rho - 1.0).abs() < 0.05, "density {rho} at {c:?}");
    }
}
