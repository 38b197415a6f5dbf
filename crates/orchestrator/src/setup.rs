//! Host-side setup: parameter blocks, initial fields, particles and the
//! static index structures, all built before any device buffer exists.

use crate::config::SimulationConfig;
use crate::error::SimError;
use lb_kernel::lattice::equilibrium;
use lb_kernel::particle::sphere_surface_points;
use lb_kernel::{
    BoundaryKind, FlpParams, IntParams, LatticeDims, ParticleState, PeriodicStreamMap, ThreadAssignment, Vec4,
    ZoneGrid, ZoneInfo, ZoneMembership, LB_Q,
};

/// Everything the buffer manager uploads.
#[derive(Debug, Clone)]
pub struct HostState {
    /// Lattice extents.
    pub dims: LatticeDims,
    /// Boundary selector per axis.
    pub boundaries: [BoundaryKind; 3],
    /// Integer parameter block.
    pub int_params: IntParams,
    /// Floating-point parameter block.
    pub flp_params: FlpParams,
    /// Initial distributions, equilibrium at rest everywhere.
    pub distributions: Vec<f32>,
    /// Initial particle records.
    pub particles: ParticleState,
    /// Shared unit-sphere directions.
    pub surface_points: Vec<Vec4>,
    /// Zone grid over the interior.
    pub zone_grid: ZoneGrid,
    /// Neighbour cache per zone.
    pub zone_info: Vec<ZoneInfo>,
    /// Static thread-group ownership.
    pub threads: ThreadAssignment,
    /// Initial zone membership.
    pub membership: ZoneMembership,
    /// Periodic wrap-around links.
    pub stream_map: PeriodicStreamMap,
}

impl HostState {
    /// Build the host state of a validated configuration.
    pub fn prepare(config: &SimulationConfig) -> Result<Self, SimError> {
        let dims = LatticeDims::new(config.lattice_size);
        let boundaries = config.boundaries;
        let p = &config.particles;
        let num_particles = if config.particles_present() { p.count } else { 0 };
        let zone_grid = ZoneGrid::new(&dims, p.zones);

        let int_params = IntParams {
            lattice_size: config.lattice_size.map(|n| n as u32),
            boundary_conds: boundaries.map(BoundaryKind::raw),
            vel_wall_axis: config.wall_axis().map_or(u32::MAX, |a| a as u32),
            num_particles,
            points_per_particle: p.points_per_particle,
            total_surf_points: num_particles * p.points_per_particle,
            num_force_arrays: p.num_force_arrays.max(1),
            max_surf_points_per_node: p.max_surf_points_per_node,
            points_per_work_group: p.points_per_work_group,
            num_zones: zone_grid.counts,
            num_thread_groups: p.thread_groups(),
            max_iterations: config.max_iterations,
            rebuild_freq: p.rebuild_freq,
        };
        let flp_params = FlpParams {
            tau: config.tau,
            rho_init: config.rho_init,
            body_force: config.body_force,
            vel_lower: config.velocity_walls.lower,
            vel_upper: config.velocity_walls.upper,
            particle_radius: p.radius,
            particle_density: p.density,
            coupling_stiffness: p.coupling_stiffness,
            contact_stiffness: p.contact_stiffness,
            interaction_range: p.interaction_range,
            zone_size: zone_grid.zone_size,
            dt: p.dt,
        };
        tracing::info!(
            "Parameter blocks: {} bytes integer, {} bytes floating point",
            std::mem::size_of::<IntParams>(),
            std::mem::size_of::<FlpParams>()
        );

        let feq = equilibrium(config.rho_init, [0.0; 3]);
        let mut distributions = Vec::with_capacity(dims.num_distributions());
        for _ in 0..dims.num_nodes() {
            distributions.extend_from_slice(&feq);
        }
        debug_assert_eq!(distributions.len(), dims.num_nodes() * LB_Q);

        let stream_map = PeriodicStreamMap::build(&dims, boundaries)?;
        tracing::info!("Periodic stream map: {} links", stream_map.len());
        match config.wall_axis() {
            Some(axis) => tracing::info!("Velocity wall axis: {}", axis),
            None => tracing::info!("No velocity wall"),
        }

        let mut particles = ParticleState::new(int_params.num_force_arrays as usize);
        for pos in initial_positions(config, &dims, num_particles as usize) {
            particles.push(pos, p.initial_velocity);
        }
        let surface_points = sphere_surface_points(p.points_per_particle as usize);

        let zone_info = zone_grid.build_info(boundaries);
        let threads = ThreadAssignment::round_robin(num_particles as usize, int_params.num_thread_groups as usize);
        let positions: Vec<[f32; 3]> = (0..particles.len()).map(|i| particles.position(i)).collect();
        let membership = ZoneMembership::build(&zone_grid, &positions, &threads);
        tracing::info!(
            "Particles: {}, zones {:?} ({} total), {} thread groups",
            num_particles,
            zone_grid.counts,
            zone_grid.total(),
            threads.num_groups()
        );

        let cutoff = 2.0 * p.radius + p.interaction_range;
        if num_particles > 0 && zone_grid.min_extent() < cutoff {
            tracing::warn!(
                "Smallest zone extent {:.2} is below the interaction cutoff {:.2}; neighbour search may miss pairs",
                zone_grid.min_extent(),
                cutoff
            );
        }

        Ok(Self {
            dims,
            boundaries,
            int_params,
            flp_params,
            distributions,
            particles,
            surface_points,
            zone_grid,
            zone_info,
            threads,
            membership,
            stream_map,
        })
    }
}

/// Explicit positions, or a regular grid filling the interior.
fn initial_positions(config: &SimulationConfig, dims: &LatticeDims, n: usize) -> Vec<[f32; 3]> {
    if n == 0 {
        return Vec::new();
    }
    if let Some(positions) = &config.particles.positions {
        return positions.iter().take(n).copied().collect();
    }
    let per_axis = (1..).find(|m: &usize| m * m * m >= n).unwrap_or(1);
    let extent = dims.interior_extent();
    let spacing = [0, 1, 2].map(|a| extent[a] as f32 / per_axis as f32);
    (0..n)
        .map(|i| {
            let c = [i % per_axis, (i / per_axis) % per_axis, i / (per_axis * per_axis)];
            [0, 1, 2].map(|a| 1.0 + (c[a] as f32 + 0.5) * spacing[a])
        })
        .collect()
}
