//! Kernel dispatch orchestrator: the per-timestep control loop.
//!
//! One call to [`Orchestrator::step`] issues, in order:
//!
//! 1. collide-stream on the GPU queue, reading buffer `roles.read` and
//!    writing `roles.write`;
//! 2. with particles: (particle dynamics on the CPU queue), barrier,
//!    fluid-force reset;
//! 3. periodic wrap-around over the stream map;
//! 4. barrier;
//! 5. velocity wall pass, tangential passes, wall binding restored;
//! 6. with particles: per-point coupling, GPU drain, per-node summation,
//!    (particle-particle forces on the CPU queue);
//! 7. on rebuild steps: zone counts zeroed through a host mapping, zone
//!    update on the CPU queue, CPU drain;
//! 8. barrier;
//! 9. sampling on the configured cadences.
//!
//! Cross-queue ordering exists only at the barriers; within a queue work runs
//! in issue order.

use crate::buffers::DeviceState;
use crate::config::SimulationConfig;
use crate::error::SimError;
use crate::output::SampleSink;
use crate::setup::HostState;
use lb_kernel::kernels::{
    BoundaryPeriodic, BoundaryVelocity, CollideStream, ParticleDynamics, ParticleFluidForces,
    ParticleParticleForces, ResetParticleFluidForces, SumParticleFluidForces, UpdateParticleZones,
};
use lb_kernel::particle::{sum_fluid_slots, FORCE_STRIDE, KIN_STRIDE};
use lb_kernel::{DeviceBuffer, DeviceContext, DeviceError, LatticeDims, NdRange, QueueEvent, Region, ZoneMembership};

// ============================================================================
// Buffer roles
// ============================================================================

/// Which of the two distribution buffers is read and which is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRoles {
    /// Buffer index read by collide-stream.
    pub read: usize,
    /// Buffer index written by collide-stream and the boundary passes.
    pub write: usize,
}

/// Even steps read A and write B; odd steps read B and write A.
pub fn buffer_roles(step: u64) -> BufferRoles {
    if step % 2 == 0 {
        BufferRoles { read: 0, write: 1 }
    } else {
        BufferRoles { read: 1, write: 0 }
    }
}

// ============================================================================
// Launch plan
// ============================================================================

/// One velocity-boundary pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallPass {
    /// Axis normal to the wall layers.
    pub axis: u32,
    /// Reconstruct the wall density instead of using `rho_init`.
    pub calc_rho: bool,
    /// Slab index space.
    pub range: NdRange,
}

/// Index spaces of every dispatch, computed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Interior region for collide-stream, reset and summation.
    pub interior: NdRange,
    /// Stream-map length; `None` without a periodic axis.
    pub periodic: Option<NdRange>,
    /// Primary prescribed-velocity pass.
    pub wall: Option<WallPass>,
    /// Secondary tangential passes, run after `wall`.
    pub tangential: Vec<WallPass>,
    /// Surface points tiled into work groups; `None` without particles.
    pub surface_points: Option<NdRange>,
    /// One work item per CPU thread group.
    pub thread_groups: NdRange,
}

impl LaunchPlan {
    /// Derive every index space from the validated config and host state.
    pub fn new(config: &SimulationConfig, host: &HostState) -> Self {
        let dims = &host.dims;
        let ip = &host.int_params;
        let periodic = (!host.stream_map.is_empty()).then(|| NdRange::linear(host.stream_map.len()));
        let wall = config.wall_axis().map(|axis| WallPass {
            axis: axis as u32,
            calc_rho: true,
            range: NdRange::Grid(Region::velocity_slab(dims, axis)),
        });
        let tangential = if wall.is_some() {
            config
                .tangential_axes
                .iter()
                .map(|&axis| WallPass {
                    axis: axis as u32,
                    calc_rho: false,
                    range: NdRange::Grid(Region::velocity_slab(dims, axis)),
                })
                .collect()
        } else {
            Vec::new()
        };
        let surface_points = (ip.total_surf_points > 0)
            .then(|| NdRange::tiled(ip.total_surf_points as usize, ip.points_per_work_group as usize));

        Self {
            interior: NdRange::Grid(Region::interior(dims)),
            periodic,
            wall,
            tangential,
            surface_points,
            thread_groups: NdRange::linear(ip.num_thread_groups.max(1) as usize),
        }
    }
}

// ============================================================================
// Kernel binding table
// ============================================================================

/// One argument record per kernel, bound once at startup.
#[derive(Debug, Clone)]
pub struct KernelTable {
    /// BGK collide-stream.
    pub collide: CollideStream,
    /// Periodic wrap-around.
    pub periodic: BoundaryPeriodic,
    /// Velocity wall, bound to the primary wall pass.
    pub velocity: BoundaryVelocity,
    /// Point-force slot reset.
    pub reset_forces: ResetParticleFluidForces,
    /// Surface-point coupling.
    pub point_forces: ParticleFluidForces,
    /// Point-force slot folding.
    pub sum_forces: SumParticleFluidForces,
    /// Particle-particle contacts.
    pub particle_forces: ParticleParticleForces,
    /// Particle integration.
    pub dynamics: ParticleDynamics,
    /// Zone index rebuild.
    pub update_zones: UpdateParticleZones,
}

impl KernelTable {
    /// Bind every static argument. Distribution arguments start at the
    /// roles of step 1.
    pub fn bind(dev: &DeviceState, wall: Option<&WallPass>) -> Self {
        let roles = buffer_roles(1);
        let src = &dev.f[roles.read];
        let dst = &dev.f[roles.write];
        let (axis, calc_rho) = wall.map_or((0, true), |w| (w.axis, w.calc_rho));

        Self {
            collide: CollideStream {
                f_src: src.clone(),
                f_dst: dst.clone(),
                u: dev.u.clone(),
                tau_lb: dev.tau_lb.clone(),
                gpf: dev.gpf.clone(),
                count_point: dev.count_point.clone(),
                int_params: dev.int_params.clone(),
                flp_params: dev.flp_params.clone(),
            },
            periodic: BoundaryPeriodic {
                f: dst.clone(),
                int_params: dev.int_params.clone(),
                stream_map: dev.stream_map.clone(),
            },
            velocity: BoundaryVelocity::new(
                dst.clone(),
                dev.int_params.clone(),
                dev.flp_params.clone(),
                axis,
                calc_rho,
            ),
            reset_forces: ResetParticleFluidForces {
                int_params: dev.int_params.clone(),
                flp_params: dev.flp_params.clone(),
                gpf: dev.gpf.clone(),
                count_point: dev.count_point.clone(),
            },
            point_forces: ParticleFluidForces {
                int_params: dev.int_params.clone(),
                flp_params: dev.flp_params.clone(),
                u: dev.u.clone(),
                par_kin: dev.par_kin.clone(),
                surface_points: dev.surface_points.clone(),
                gpf: dev.gpf.clone(),
                count_point: dev.count_point.clone(),
                par_fluid_force: dev.par_fluid_force.clone(),
                point_force: dev.point_force.clone(),
            },
            sum_forces: SumParticleFluidForces {
                int_params: dev.int_params.clone(),
                flp_params: dev.flp_params.clone(),
                gpf: dev.gpf.clone(),
                count_point: dev.count_point.clone(),
            },
            particle_forces: ParticleParticleForces {
                int_params: dev.int_params.clone(),
                flp_params: dev.flp_params.clone(),
                par_kin: dev.par_kin.clone(),
                par_force: dev.par_force.clone(),
                zone_info: dev.zone_info.clone(),
                pars_zone: dev.pars_zone.clone(),
                thread_members: dev.thread_members.clone(),
                num_par_in_thread: dev.num_par_in_thread.clone(),
                zone_members: dev.zone_members.clone(),
                num_par_in_zone: dev.num_par_in_zone.clone(),
            },
            dynamics: ParticleDynamics {
                int_params: dev.int_params.clone(),
                flp_params: dev.flp_params.clone(),
                par_kin: dev.par_kin.clone(),
                par_force: dev.par_force.clone(),
                par_fluid_force: dev.par_fluid_force.clone(),
                zone_info: dev.zone_info.clone(),
                pars_zone: dev.pars_zone.clone(),
                thread_members: dev.thread_members.clone(),
                num_par_in_thread: dev.num_par_in_thread.clone(),
            },
            update_zones: UpdateParticleZones {
                int_params: dev.int_params.clone(),
                flp_params: dev.flp_params.clone(),
                par_kin: dev.par_kin.clone(),
                zone_info: dev.zone_info.clone(),
                thread_members: dev.thread_members.clone(),
                num_par_in_thread: dev.num_par_in_thread.clone(),
                pars_zone: dev.pars_zone.clone(),
                zone_members: dev.zone_members.clone(),
                num_par_in_zone: dev.num_par_in_zone.clone(),
            },
        }
    }

    /// Rebind the two distribution-buffer roles of the fluid kernels.
    pub fn bind_distributions(&mut self, f: &[DeviceBuffer<f32>; 2], roles: BufferRoles) {
        let src = &f[roles.read];
        let dst = &f[roles.write];
        self.collide.bind_distributions(src, dst);
        self.periodic.bind_distributions(dst);
        self.velocity.bind_distributions(dst);
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Completed timesteps.
    pub steps: u64,
    /// Total fluid force and torque per particle after the last step.
    pub particle_fluid_forces: Vec<([f32; 3], [f32; 3])>,
}

/// Owns the device context, the working set and the kernel table.
pub struct Orchestrator<S: SampleSink> {
    config: SimulationConfig,
    dims: LatticeDims,
    ctx: DeviceContext,
    dev: DeviceState,
    plan: LaunchPlan,
    table: KernelTable,
    sink: S,
    particles: bool,
    last_step: u64,
}

impl<S: SampleSink> Orchestrator<S> {
    /// Validate, prepare the host state and upload it.
    pub fn new(config: SimulationConfig, ctx: DeviceContext, sink: S) -> Result<Self, SimError> {
        config.validate()?;
        let host = HostState::prepare(&config)?;
        let dev = DeviceState::upload(&ctx, &host)?;
        let plan = LaunchPlan::new(&config, &host);
        let table = KernelTable::bind(&dev, plan.wall.as_ref());
        tracing::info!(
            "Launch plan: interior {}, periodic {}, wall {:?}, {} tangential passes",
            plan.interior,
            plan.periodic.map(|r| r.to_string()).unwrap_or_else(|| "none".into()),
            plan.wall.map(|w| w.axis),
            plan.tangential.len()
        );
        Ok(Self {
            particles: config.particles_present(),
            dims: host.dims,
            config,
            ctx,
            dev,
            plan,
            table,
            sink,
            last_step: 0,
        })
    }

    /// Validated configuration.
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Device context with both queues.
    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Uploaded device buffers.
    pub fn device(&self) -> &DeviceState {
        &self.dev
    }

    /// Index spaces of every dispatch.
    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    /// Bound kernel records.
    pub fn table(&self) -> &KernelTable {
        &self.table
    }

    /// Sampling sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Consume the orchestrator, keeping the sink.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Last completed step, 0 before the first.
    pub fn last_step(&self) -> u64 {
        self.last_step
    }

    /// Execute timestep `t` (1-based).
    pub fn step(&mut self, t: u64) -> Result<(), SimError> {
        self.ctx.events().record(QueueEvent::Step(t));
        if t % self.config.frequencies.console_print as u64 == 0 {
            tracing::info!("Starting iteration {}", t);
        }

        let roles = buffer_roles(t);
        self.table.bind_distributions(&self.dev.f, roles);
        let gpu = self.ctx.gpu();
        let cpu = self.ctx.cpu();
        let dynamics = self.particles && self.config.particles.dynamics;

        gpu.dispatch(&self.table.collide, self.plan.interior)?;

        if self.particles {
            if dynamics {
                cpu.dispatch(&self.table.dynamics, self.plan.thread_groups)?;
            }
            // gpf must not be cleared under collide-stream or last step's coupling
            self.ctx.barrier()?;
            gpu.dispatch(&self.table.reset_forces, self.plan.interior)?;
        }

        if let Some(range) = self.plan.periodic {
            gpu.dispatch(&self.table.periodic, range)?;
        }

        // Walls read the completed streaming result
        self.ctx.barrier()?;

        if let Some(wall) = self.plan.wall {
            self.table.velocity.set_wall(wall.axis, wall.calc_rho);
            gpu.dispatch(&self.table.velocity, wall.range)?;
            for pass in &self.plan.tangential {
                self.table.velocity.set_wall(pass.axis, pass.calc_rho);
                gpu.dispatch(&self.table.velocity, pass.range)?;
            }
            self.table.velocity.set_wall(wall.axis, wall.calc_rho);
        }

        if self.particles {
            if let Some(range) = self.plan.surface_points {
                gpu.dispatch(&self.table.point_forces, range)?;
                gpu.finish()?;
            }
            gpu.dispatch(&self.table.sum_forces, self.plan.interior)?;
            if dynamics {
                cpu.dispatch(&self.table.particle_forces, self.plan.thread_groups)?;
            }
            if t % self.config.particles.rebuild_freq as u64 == 0 {
                self.rebuild_zones(t)?;
            }
        }

        self.ctx.barrier()?;
        self.sample(t)?;
        self.last_step = t;
        Ok(())
    }

    /// Zero the zone counts through a host mapping, refile every particle and
    /// drain the CPU queue.
    fn rebuild_zones(&self, t: u64) -> Result<(), SimError> {
        let cpu = self.ctx.cpu();
        {
            let mut counts = cpu.map_write(&self.dev.num_par_in_zone)?;
            counts.fill(0);
        }
        cpu.dispatch(&self.table.update_zones, self.plan.thread_groups)?;
        cpu.finish()?;
        tracing::debug!("Rebuilt particle zones at step {}", t);
        Ok(())
    }

    fn sample(&mut self, t: u64) -> Result<(), SimError> {
        let freq = &self.config.frequencies;
        let video = t % freq.video as u64 == 0;
        let shear = t % freq.shear_stress as u64 == 0;
        if !video && !shear {
            return Ok(());
        }

        let velocity = self.ctx.gpu().read_buffer(&self.dev.u)?;
        if video {
            let kinematics = if self.particles {
                let mut kin = self.ctx.cpu().read_buffer(&self.dev.par_kin)?;
                kin.truncate(self.config.particles.count as usize * KIN_STRIDE);
                kin
            } else {
                Vec::new()
            };
            self.sink.velocity_sample(t, &self.dims, &velocity, &kinematics)?;
        }
        if shear {
            let relaxation = self.ctx.gpu().read_buffer(&self.dev.tau_lb)?;
            self.sink.stress_sample(t, &self.dims, &velocity, &relaxation)?;
        }
        Ok(())
    }

    /// Run every remaining step up to `max_iterations`, drain both queues and
    /// report the final particle forces.
    pub fn run(&mut self) -> Result<RunSummary, SimError> {
        let max = self.config.max_iterations as u64;
        tracing::info!("Running {} iterations", max);
        for t in self.last_step + 1..=max {
            self.step(t)?;
        }
        self.ctx.barrier()?;
        self.sink.finish()?;

        let particle_fluid_forces = if self.particles {
            self.final_fluid_forces()?
        } else {
            Vec::new()
        };
        Ok(RunSummary {
            steps: self.last_step,
            particle_fluid_forces,
        })
    }

    fn final_fluid_forces(&self) -> Result<Vec<([f32; 3], [f32; 3])>, DeviceError> {
        let nfa = self.config.particles.num_force_arrays.max(1) as usize;
        let n = self.config.particles.count as usize;
        let sums = {
            let mapped = self.ctx.cpu().map_write(&self.dev.par_fluid_force)?;
            sum_fluid_slots(&mapped[..n * nfa * FORCE_STRIDE], nfa)
        };
        if let Some((force, torque)) = sums.first() {
            tracing::info!("Final force on particle 0: {:?}, torque {:?}", force, torque);
        }
        Ok(sums)
    }

    /// Host copy of the distributions written by the last step.
    pub fn current_distributions(&self) -> Result<Vec<f32>, DeviceError> {
        let roles = buffer_roles(self.last_step.max(1));
        let buf = if self.last_step == 0 {
            &self.dev.f[roles.read]
        } else {
            &self.dev.f[roles.write]
        };
        self.ctx.gpu().read_buffer(buf)
    }

    /// Host copy of the zone membership arrays.
    pub fn zone_membership(&self) -> Result<ZoneMembership, DeviceError> {
        let cpu = self.ctx.cpu();
        let n = self.config.particles.count as usize;
        let mut pars_zone = cpu.read_buffer(&self.dev.pars_zone)?;
        pars_zone.truncate(if self.particles { n } else { 0 });
        let zones = self.dev.num_par_in_zone.len();
        let mut counts = cpu.read_buffer(&self.dev.num_par_in_zone)?;
        counts.truncate(zones);
        let mut members = cpu.read_buffer(&self.dev.zone_members)?;
        members.truncate(zones * pars_zone.len());
        Ok(ZoneMembership {
            pars_zone,
            members,
            counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_alternate() {
        assert_eq!(buffer_roles(2), BufferRoles { read: 0, write: 1 });
        assert_eq!(buffer_roles(3), BufferRoles { read: 1, write: 0 });
    }

    #[test]
    fn test_read_follows_previous_write() {
        for t in 2..100 {
            let prev = buffer_roles(t - 1);
            let cur = buffer_roles(t);
            assert_eq!(cur.read, prev.write, "step {t}");
            assert_ne!(cur.read, cur.write, "step {t}");
        }
    }
}
