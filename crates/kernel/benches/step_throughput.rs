//! Fluid-only step throughput.
//!
//! Times collide-stream plus the periodic wrap on fully periodic cubes and
//! reports million lattice updates per second (MLUPS).
//!
//! Run with: cargo bench -p lb-kernel --bench step_throughput

use std::time::Instant;

use lb_kernel::kernels::{BoundaryPeriodic, CollideStream};
use lb_kernel::lattice::equilibrium;
use lb_kernel::{
    Access, BoundaryKind, DeviceContext, FlpParams, IntParams, LatticeDims, NdRange, PeriodicStreamMap,
    Region,
};

fn bench_cube(n: usize, steps: u64) -> f64 {
    let ctx = DeviceContext::new(None).expect("device context");
    let size = [n + 2; 3];
    let dims = LatticeDims::new(size);
    let bcs = [BoundaryKind::Periodic; 3];
    let nodes = dims.num_nodes();

    let mut ip: IntParams = bytemuck::Zeroable::zeroed();
    ip.lattice_size = size.map(|s| s as u32);
    ip.boundary_conds = bcs.map(BoundaryKind::raw);
    ip.max_surf_points_per_node = 1;
    let mut fp: FlpParams = bytemuck::Zeroable::zeroed();
    fp.tau = 0.8;
    fp.rho_init = 1.0;
    fp.body_force = [1e-6, 0.0, 0.0];

    let f0: Vec<f32> = (0..nodes).flat_map(|_| equilibrium(1.0, [0.0; 3])).collect();
    let map = PeriodicStreamMap::build(&dims, bcs).unwrap();
    let ip = ctx.create_buffer("int_params", Access::ReadOnly, &[ip]).unwrap();
    let fp = ctx.create_buffer("flp_params", Access::ReadOnly, &[fp]).unwrap();
    let f = [
        ctx.create_buffer("f_a", Access::ReadWrite, &f0).unwrap(),
        ctx.create_buffer("f_b", Access::ReadWrite, &f0).unwrap(),
    ];
    let mut collide = CollideStream {
        f_src: f[0].clone(),
        f_dst: f[1].clone(),
        u: ctx.create_zeroed("u", Access::ReadWrite, nodes * 3).unwrap(),
        tau_lb: ctx.create_zeroed("tau_lb", Access::ReadWrite, nodes).unwrap(),
        gpf: ctx.create_zeroed("gpf", Access::ReadWrite, nodes * 3).unwrap(),
        count_point: ctx.create_zeroed("count_point", Access::ReadWrite, nodes).unwrap(),
        int_params: ip.clone(),
        flp_params: fp,
    };
    let mut periodic = BoundaryPeriodic {
        f: f[1].clone(),
        int_params: ip,
        stream_map: ctx.create_buffer("stream_map", Access::ReadOnly, map.links()).unwrap(),
    };

    let interior = NdRange::Grid(Region::interior(&dims));
    let start = Instant::now();
    for t in 1..=steps {
        let (src, dst) = if t % 2 == 0 { (0, 1) } else { (1, 0) };
        collide.bind_distributions(&f[src], &f[dst]);
        periodic.bind_distributions(&f[dst]);
        ctx.gpu().dispatch(&collide, interior).unwrap();
        ctx.gpu().dispatch(&periodic, NdRange::linear(map.len())).unwrap();
    }
    ctx.gpu().finish().unwrap();
    let elapsed = start.elapsed().as_secs_f64();
    (n * n * n) as f64 * steps as f64 / elapsed / 1e6
}

fn main() {
    println!("{:>8} {:>8} {:>10}", "interior", "steps", "MLUPS");
    for &(n, steps) in &[(16usize, 200u64), (32, 100), (64, 20)] {
        let mlups = bench_cube(n, steps);
        println!("{:>7}^3 {:>8} {:>10.2}", n, steps, mlups);
    }
}
