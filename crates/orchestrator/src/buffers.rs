//! Device buffer manager: one tagged device buffer per host array.

use crate::setup::HostState;
use lb_kernel::particle::FORCE_STRIDE;
use lb_kernel::{
    Access, DeviceBuffer, DeviceContext, DeviceError, FlpParams, IntParams, StreamLink, Vec4, ZoneInfo,
};

/// Device-resident working set of a run.
///
/// Read-only buffers are uploaded once here and never written again.
/// Read-write buffers start from the host state and are mutated in place by
/// kernels.
#[derive(Debug, Clone)]
pub struct DeviceState {
    // read-only
    /// Integer parameter block.
    pub int_params: DeviceBuffer<IntParams>,
    /// Floating-point parameter block.
    pub flp_params: DeviceBuffer<FlpParams>,
    /// Periodic wrap-around links.
    pub stream_map: DeviceBuffer<StreamLink>,
    /// Shared unit-sphere surface directions.
    pub surface_points: DeviceBuffer<Vec4>,
    /// Particles owned by each thread group.
    pub thread_members: DeviceBuffer<u32>,
    /// Owned particle count per thread group.
    pub num_par_in_thread: DeviceBuffer<u32>,
    /// Neighbour cache per zone.
    pub zone_info: DeviceBuffer<ZoneInfo>,

    // read-write
    /// Ping-pong distribution buffers A and B.
    pub f: [DeviceBuffer<f32>; 2],
    /// Macroscopic velocity, 3 per node.
    pub u: DeviceBuffer<f32>,
    /// Local relaxation time per node.
    pub tau_lb: DeviceBuffer<f32>,
    /// Per-node point-force slots, 3 components each.
    pub gpf: DeviceBuffer<f32>,
    /// Occupied point-force slots per node.
    pub count_point: DeviceBuffer<u32>,
    /// Packed particle kinematics.
    pub par_kin: DeviceBuffer<Vec4>,
    /// Particle-particle force and torque.
    pub par_force: DeviceBuffer<Vec4>,
    /// Fluid force and torque slots per particle.
    pub par_fluid_force: DeviceBuffer<Vec4>,
    /// Force and torque of every surface point.
    pub point_force: DeviceBuffer<Vec4>,
    /// Zone id per particle.
    pub pars_zone: DeviceBuffer<u32>,
    /// Member slots per zone.
    pub zone_members: DeviceBuffer<u32>,
    /// Member count per zone.
    pub num_par_in_zone: DeviceBuffer<u32>,
}

impl DeviceState {
    /// Allocate and upload every buffer. The first failure aborts the upload.
    pub fn upload(ctx: &DeviceContext, host: &HostState) -> Result<Self, DeviceError> {
        use Access::{ReadOnly, ReadWrite};

        let nodes = host.dims.num_nodes();
        let ip = &host.int_params;
        let slots = ip.max_surf_points_per_node as usize;

        let state = Self {
            int_params: ctx.create_buffer("int_params", ReadOnly, std::slice::from_ref(ip))?,
            flp_params: ctx.create_buffer("flp_params", ReadOnly, std::slice::from_ref(&host.flp_params))?,
            stream_map: ctx.create_buffer("stream_map", ReadOnly, host.stream_map.links())?,
            surface_points: ctx.create_buffer("surface_points", ReadOnly, &host.surface_points)?,
            thread_members: ctx.create_buffer("thread_members", ReadOnly, &host.threads.members)?,
            num_par_in_thread: ctx.create_buffer("num_par_in_thread", ReadOnly, &host.threads.counts)?,
            zone_info: ctx.create_buffer("zone_info", ReadOnly, &host.zone_info)?,

            f: [
                ctx.create_buffer("f_a", ReadWrite, &host.distributions)?,
                ctx.create_buffer("f_b", ReadWrite, &host.distributions)?,
            ],
            u: ctx.create_zeroed("u", ReadWrite, nodes * 3)?,
            tau_lb: ctx.create_buffer("tau_lb", ReadWrite, &vec![host.flp_params.tau; nodes])?,
            gpf: ctx.create_zeroed("gpf", ReadWrite, nodes * slots * 3)?,
            count_point: ctx.create_zeroed("count_point", ReadWrite, nodes)?,
            par_kin: ctx.create_buffer("par_kin", ReadWrite, &host.particles.kinematics)?,
            par_force: ctx.create_buffer("par_force", ReadWrite, &host.particles.forces)?,
            par_fluid_force: ctx.create_buffer("par_fluid_force", ReadWrite, &host.particles.fluid_forces)?,
            point_force: ctx.create_zeroed("point_force", ReadWrite, ip.total_surf_points as usize * FORCE_STRIDE)?,
            pars_zone: ctx.create_buffer("pars_zone", ReadWrite, &host.membership.pars_zone)?,
            zone_members: ctx.create_buffer("zone_members", ReadWrite, &host.membership.members)?,
            num_par_in_zone: ctx.create_buffer("num_par_in_zone", ReadWrite, &host.membership.counts)?,
        };

        tracing::info!(
            "Uploaded device working set: {} bytes{}",
            ctx.allocated_bytes(),
            ctx.budget().map(|b| format!(" of {b} budget")).unwrap_or_default()
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, Frequencies, OutputConfig, ParticleConfig, SimulationConfig, VelocityWalls};
    use lb_kernel::BoundaryKind;

    fn host() -> HostState {
        HostState::prepare(&SimulationConfig {
            name: "buffers".to_string(),
            lattice_size: [6, 6, 6],
            boundaries: [BoundaryKind::Periodic; 3],
            tau: 0.8,
            rho_init: 1.0,
            body_force: [0.0; 3],
            velocity_walls: VelocityWalls::default(),
            tangential_axes: Vec::new(),
            max_iterations: 1,
            frequencies: Frequencies::default(),
            particles: ParticleConfig::default(),
            output: OutputConfig::default(),
            device: DeviceConfig::default(),
        })
        .unwrap()
    }

    #[test]
    fn test_upload_access_classes() {
        let ctx = DeviceContext::new(None).unwrap();
        let state = DeviceState::upload(&ctx, &host()).unwrap();
        assert_eq!(state.stream_map.access(), Access::ReadOnly);
        assert_eq!(state.int_params.access(), Access::ReadOnly);
        assert_eq!(state.f[0].access(), Access::ReadWrite);
        assert_eq!(state.num_par_in_zone.access(), Access::ReadWrite);
        assert!(!state.f[0].same_buffer(&state.f[1]));
        assert_eq!(state.f[0].len(), 216 * 19);
    }

    #[test]
    fn test_read_only_buffer_rejects_host_write() {
        let ctx = DeviceContext::new(None).unwrap();
        let state = DeviceState::upload(&ctx, &host()).unwrap();
        let err = ctx.gpu().write_buffer(&state.stream_map, &vec![StreamLink { src: 0, dst: 0 }; state.stream_map.len()]);
        assert!(matches!(err, Err(DeviceError::ReadOnly { .. })));
    }

    #[test]
    fn test_budget_failure_names_buffer() {
        // Room for the parameter blocks and nothing much else
        let ctx = DeviceContext::new(Some(256)).unwrap();
        let err = DeviceState::upload(&ctx, &host()).unwrap_err();
        match err {
            DeviceError::Allocation { tag, .. } => assert!(!tag.is_empty()),
            other => panic!("expected allocation error, got {other:?}"),
        }
    }
}
