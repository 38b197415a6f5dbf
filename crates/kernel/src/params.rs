//! Integer and floating-point parameter blocks.
//!
//! Both blocks are uploaded once into single-element read-only buffers and
//! bound to every kernel. Layouts are `#[repr(C)]` and `Pod` so they can be
//! copied byte-for-byte into a device buffer.

use crate::lattice::{BoundaryKind, LatticeDims};

/// Integer-valued simulation parameters.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct IntParams {
    /// Lattice node count per axis, halo included.
    pub lattice_size: [u32; 3],
    /// Raw [`BoundaryKind`] per axis.
    pub boundary_conds: [u32; 3],
    /// Wall axis of the prescribed-velocity boundary, or `u32::MAX` when none.
    pub vel_wall_axis: u32,
    /// Particle count; zero disables every particle kernel.
    pub num_particles: u32,
    /// Surface coupling points per particle.
    pub points_per_particle: u32,
    /// `num_particles * points_per_particle`.
    pub total_surf_points: u32,
    /// Independent force accumulation slots per particle.
    pub num_force_arrays: u32,
    /// Per-node capacity of the point-force accumulation field.
    pub max_surf_points_per_node: u32,
    /// Local size of the per-point coupling dispatch.
    pub points_per_work_group: u32,
    /// Zone grid dimensions.
    pub num_zones: [u32; 3],
    /// Number of CPU-side particle thread groups.
    pub num_thread_groups: u32,
    /// Run length in timesteps.
    pub max_iterations: u32,
    /// Zone index rebuild interval.
    pub rebuild_freq: u32,
}

impl IntParams {
    /// Lattice extents as host sizes.
    pub fn dims(&self) -> LatticeDims {
        LatticeDims::new([
            self.lattice_size[0] as usize,
            self.lattice_size[1] as usize,
            self.lattice_size[2] as usize,
        ])
    }

    /// Decoded boundary selector per axis. Unknown raw values read as periodic.
    pub fn boundaries(&self) -> [BoundaryKind; 3] {
        self.boundary_conds
            .map(|raw| BoundaryKind::from_raw(raw).unwrap_or(BoundaryKind::Periodic))
    }

    /// Product of the zone grid dimensions.
    pub fn total_zones(&self) -> usize {
        self.num_zones.iter().map(|&n| n as usize).product()
    }
}

/// Floating-point simulation parameters, all in lattice units.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FlpParams {
    /// BGK relaxation time.
    pub tau: f32,
    /// Initial and reference fluid density.
    pub rho_init: f32,
    /// Uniform body-force density.
    pub body_force: [f32; 3],
    /// Wall velocity at the lower velocity wall.
    pub vel_lower: [f32; 3],
    /// Wall velocity at the upper velocity wall.
    pub vel_upper: [f32; 3],
    /// Sphere radius.
    pub particle_radius: f32,
    /// Particle density relative to the fluid.
    pub particle_density: f32,
    /// Penalty coefficient of the surface-point coupling.
    pub coupling_stiffness: f32,
    /// Soft-sphere contact stiffness.
    pub contact_stiffness: f32,
    /// Extra gap beyond contact over which particles still repel.
    pub interaction_range: f32,
    /// Zone extent per axis.
    pub zone_size: [f32; 3],
    /// Particle integration step.
    pub dt: f32,
}

impl FlpParams {
    /// Particle mass from radius and density.
    pub fn particle_mass(&self) -> f32 {
        let r = self.particle_radius;
        self.particle_density * 4.0 / 3.0 * std::f32::consts::PI * r * r * r
    }

    /// Moment of inertia of a solid sphere.
    pub fn particle_inertia(&self) -> f32 {
        0.4 * self.particle_mass() * self.particle_radius * self.particle_radius
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_have_no_padding() {
        assert_eq!(std::mem::size_of::<IntParams>(), 19 * 4);
        assert_eq!(std::mem::size_of::<FlpParams>(), 20 * 4);
    }

    #[test]
    fn boundaries_decode() {
        let mut p: IntParams = bytemuck::Zeroable::zeroed();
        p.boundary_conds = [0, 1, 2];
        assert_eq!(
            p.boundaries(),
            [BoundaryKind::Periodic, BoundaryKind::BounceBack, BoundaryKind::Velocity]
        );
    }

    #[test]
    fn sphere_mass_and_inertia() {
        let mut p: FlpParams = bytemuck::Zeroable::zeroed();
        p.particle_radius = 2.0;
        p.particle_density = 3.0;
        let m = 3.0 * 4.0 / 3.0 * std::f32::consts::PI * 8.0;
        assert!((p.particle_mass() - m).abs() < 1e-3);
        assert!((p.particle_inertia() - 0.4 * m * 4.0).abs() < 1e-2);
    }
}
