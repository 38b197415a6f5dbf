//! Configuration parsing and validation for coupled LB/particle runs

use lb_kernel::{BoundaryKind, LB_Q};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Human-readable run name
    #[serde(default = "default_name")]
    pub name: String,
    /// Lattice node count per axis, one-node halo on each side included
    pub lattice_size: [usize; 3],
    /// Boundary selector per axis
    #[serde(default = "default_boundaries")]
    pub boundaries: [BoundaryKind; 3],
    /// BGK relaxation time (lattice units)
    #[serde(default = "default_tau")]
    pub tau: f32,
    /// Initial and reference fluid density
    #[serde(default = "default_rho")]
    pub rho_init: f32,
    /// Constant body force density applied to every interior node
    #[serde(default)]
    pub body_force: [f32; 3],
    /// Prescribed wall velocities on the velocity axis
    #[serde(default)]
    pub velocity_walls: VelocityWalls,
    /// Axes that get an extra tangential velocity pass after the primary wall
    #[serde(default)]
    pub tangential_axes: Vec<usize>,
    /// Number of timesteps to run
    pub max_iterations: u32,
    /// Console/output cadences
    #[serde(default)]
    pub frequencies: Frequencies,
    /// Rigid particle setup
    #[serde(default)]
    pub particles: ParticleConfig,
    /// Output destinations
    #[serde(default)]
    pub output: OutputConfig,
    /// Device-side resource limits
    #[serde(default)]
    pub device: DeviceConfig,
}

/// Wall velocities for the lower (layer 1) and upper (layer size-2) wall
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VelocityWalls {
    /// Velocity of the lower wall
    #[serde(default)]
    pub lower: [f32; 3],
    /// Velocity of the upper wall
    #[serde(default)]
    pub upper: [f32; 3],
}

/// Output and progress cadences, in timesteps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frequencies {
    /// Print "Starting iteration" every this many steps
    #[serde(default = "default_freq")]
    pub console_print: u32,
    /// Velocity + trajectory sampling interval
    #[serde(default = "default_freq")]
    pub video: u32,
    /// Relaxation/shear-stress sampling interval
    #[serde(default = "default_freq")]
    pub shear_stress: u32,
}

/// Rigid particle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticleConfig {
    /// Turn the particle path on at all
    #[serde(default)]
    pub enabled: bool,
    /// Number of particles
    #[serde(default)]
    pub count: u32,
    /// Surface coupling points per particle
    #[serde(default = "default_points_per_particle")]
    pub points_per_particle: u32,
    /// Particle radius (lattice units)
    #[serde(default = "default_radius")]
    pub radius: f32,
    /// Particle density relative to the fluid
    #[serde(default = "default_one")]
    pub density: f32,
    /// Penalty stiffness between surface points and the local fluid velocity
    #[serde(default = "default_coupling_stiffness")]
    pub coupling_stiffness: f32,
    /// Soft-sphere contact stiffness
    #[serde(default = "default_contact_stiffness")]
    pub contact_stiffness: f32,
    /// Extra gap beyond contact within which particles interact
    #[serde(default = "default_one")]
    pub interaction_range: f32,
    /// Independent fluid-force accumulation slots per particle
    #[serde(default = "default_num_force_arrays")]
    pub num_force_arrays: u32,
    /// Per-node capacity of the point-force accumulation field
    #[serde(default = "default_max_surf_points_per_node")]
    pub max_surf_points_per_node: u32,
    /// Work-group size of the per-point coupling kernel
    #[serde(default = "default_points_per_work_group")]
    pub points_per_work_group: u32,
    /// Zone grid dimensions
    #[serde(default = "default_unit_grid")]
    pub zones: [u32; 3],
    /// CPU thread-group decomposition; the group count is the product
    #[serde(default = "default_unit_grid")]
    pub domain_decomposition: [u32; 3],
    /// Zone rebuild interval (timesteps)
    #[serde(default = "default_rebuild_freq")]
    pub rebuild_freq: u32,
    /// Run the particle dynamics and particle-particle kernels
    #[serde(default)]
    pub dynamics: bool,
    /// Initial velocity of every particle
    #[serde(default)]
    pub initial_velocity: [f32; 3],
    /// Explicit initial positions; a regular grid is used when absent
    #[serde(default)]
    pub positions: Option<Vec<[f32; 3]>>,
    /// Particle integration timestep (lattice units)
    #[serde(default = "default_one")]
    pub dt: f32,
}

/// Output paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// XYZ trajectory file, opened once at run start
    #[serde(default = "default_trajectory_path")]
    pub trajectory_path: String,
}

/// Device resource limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Total bytes the buffer manager may allocate; unlimited when absent
    #[serde(default)]
    pub max_device_bytes: Option<u64>,
}

/// Failure to load a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path as given
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration JSON
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Every failed validation check
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

// Default values
fn default_name() -> String {
    "lb-sim".to_string()
}

fn default_boundaries() -> [BoundaryKind; 3] {
    [BoundaryKind::Periodic; 3]
}

fn default_tau() -> f32 {
    0.8
}

fn default_rho() -> f32 {
    1.0
}

fn default_freq() -> u32 {
    100
}

fn default_points_per_particle() -> u32 {
    32
}

fn default_radius() -> f32 {
    2.0
}

fn default_one() -> f32 {
    1.0
}

fn default_coupling_stiffness() -> f32 {
    0.05
}

fn default_contact_stiffness() -> f32 {
    0.1
}

fn default_num_force_arrays() -> u32 {
    4
}

fn default_max_surf_points_per_node() -> u32 {
    16
}

fn default_points_per_work_group() -> u32 {
    32
}

fn default_unit_grid() -> [u32; 3] {
    [1, 1, 1]
}

fn default_rebuild_freq() -> u32 {
    10
}

fn default_trajectory_path() -> String {
    "xyz_ovito_output.txt".to_string()
}

impl Default for Frequencies {
    fn default() -> Self {
        Self {
            console_print: default_freq(),
            video: default_freq(),
            shear_stress: default_freq(),
        }
    }
}

impl Default for ParticleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            count: 0,
            points_per_particle: default_points_per_particle(),
            radius: default_radius(),
            density: default_one(),
            coupling_stiffness: default_coupling_stiffness(),
            contact_stiffness: default_contact_stiffness(),
            interaction_range: default_one(),
            num_force_arrays: default_num_force_arrays(),
            max_surf_points_per_node: default_max_surf_points_per_node(),
            points_per_work_group: default_points_per_work_group(),
            zones: default_unit_grid(),
            domain_decomposition: default_unit_grid(),
            rebuild_freq: default_rebuild_freq(),
            dynamics: false,
            initial_velocity: [0.0; 3],
            positions: None,
            dt: default_one(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            trajectory_path: default_trajectory_path(),
        }
    }
}

impl ParticleConfig {
    /// Thread groups used by the CPU-side particle kernels.
    pub fn thread_groups(&self) -> u32 {
        self.domain_decomposition.iter().map(|&d| d.max(1)).product()
    }

    /// Total surface coupling points over all particles.
    pub fn total_points(&self) -> u64 {
        self.count as u64 * self.points_per_particle as u64
    }
}

impl SimulationConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: SimulationConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// The prescribed-velocity axis, if any.
    pub fn wall_axis(&self) -> Option<usize> {
        self.boundaries.iter().position(|&b| b == BoundaryKind::Velocity)
    }

    /// True when the particle kernels take part in the step sequence.
    pub fn particles_present(&self) -> bool {
        self.particles.enabled && self.particles.count > 0
    }

    /// Validate the configuration, reporting every failed check
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        // Lattice must leave at least one interior layer per axis
        for (axis, &n) in self.lattice_size.iter().enumerate() {
            if n < 3 {
                errors.push(format!("lattice_size[{axis}] = {n}, need at least 3"));
            }
        }
        // Every distribution index must fit the 32-bit device index buffers
        let distributions = self.lattice_size.iter().try_fold(LB_Q, |acc, &n| acc.checked_mul(n));
        if !matches!(distributions, Some(d) if d <= u32::MAX as usize) {
            errors.push(format!(
                "lattice_size {:?} has more than {} distributions",
                self.lattice_size,
                u32::MAX
            ));
        }

        // BGK stability
        if !(self.tau > 0.5) {
            errors.push(format!("tau must exceed 0.5, got {}", self.tau));
        }
        if !(self.rho_init > 0.0) {
            errors.push("rho_init must be positive".to_string());
        }

        // One wall axis at most; tangential passes need it and must differ from it
        let walls = self
            .boundaries
            .iter()
            .filter(|&&b| b == BoundaryKind::Velocity)
            .count();
        if walls > 1 {
            errors.push(format!("{walls} velocity axes configured, at most one is supported"));
        }
        if let Some(axis) = self.wall_axis() {
            // Lower and upper wall layers must be distinct interior nodes
            if self.lattice_size[axis] < 4 {
                errors.push(format!(
                    "lattice_size[{axis}] = {}, a velocity axis needs at least 4",
                    self.lattice_size[axis]
                ));
            }
            let walls = [("lower", self.velocity_walls.lower), ("upper", self.velocity_walls.upper)];
            for (side, velocity) in walls {
                if !(velocity[axis].abs() < 1.0) {
                    errors.push(format!(
                        "velocity_walls.{side}[{axis}] = {}, wall-normal speed must be below 1",
                        velocity[axis]
                    ));
                }
            }
        }
        for (i, &axis) in self.tangential_axes.iter().enumerate() {
            if self.tangential_axes[..i].contains(&axis) {
                errors.push(format!("tangential axis {axis} listed twice"));
                continue;
            }
            if axis > 2 {
                errors.push(format!("tangential axis {axis} out of range"));
            } else if self.wall_axis().is_none() {
                errors.push("tangential_axes given without a velocity wall".to_string());
            } else if Some(axis) == self.wall_axis() {
                errors.push(format!("tangential axis {axis} is the wall axis"));
            }
        }

        // Cadences
        if self.max_iterations == 0 {
            errors.push("max_iterations must be at least 1".to_string());
        }
        let freqs = [
            ("frequencies.console_print", self.frequencies.console_print),
            ("frequencies.video", self.frequencies.video),
            ("frequencies.shear_stress", self.frequencies.shear_stress),
            ("particles.rebuild_freq", self.particles.rebuild_freq),
        ];
        for (field, value) in freqs {
            if value == 0 {
                errors.push(format!("{field} must be at least 1"));
            }
        }

        self.validate_particles(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    fn validate_particles(&self, errors: &mut Vec<String>) {
        let p = &self.particles;

        if p.zones.contains(&0) {
            errors.push("particles.zones must be at least 1 per axis".to_string());
        }
        if p.domain_decomposition.contains(&0) {
            errors.push("particles.domain_decomposition must be at least 1 per axis".to_string());
        }
        if p.points_per_work_group == 0 {
            errors.push("particles.points_per_work_group must be at least 1".to_string());
        }
        if !p.enabled {
            return;
        }

        let positive = [
            ("particles.radius", p.radius),
            ("particles.density", p.density),
            ("particles.coupling_stiffness", p.coupling_stiffness),
            ("particles.contact_stiffness", p.contact_stiffness),
            ("particles.dt", p.dt),
        ];
        for (field, value) in positive {
            if !(value > 0.0) {
                errors.push(format!("{field} must be positive"));
            }
        }
        if p.interaction_range < 0.0 {
            errors.push("particles.interaction_range must be non-negative".to_string());
        }
        if p.points_per_particle == 0 {
            errors.push("particles.points_per_particle must be at least 1".to_string());
        }
        if p.num_force_arrays == 0 {
            errors.push("particles.num_force_arrays must be at least 1".to_string());
        }
        if p.max_surf_points_per_node == 0 {
            errors.push("particles.max_surf_points_per_node must be at least 1".to_string());
        }
        if p.total_points() > u32::MAX as u64 {
            errors.push("total surface points do not fit the 32-bit parameter block".to_string());
        } else if p.points_per_work_group > 0 && p.total_points() % p.points_per_work_group as u64 != 0 {
            errors.push(format!(
                "total surface points {} not divisible by points_per_work_group {}",
                p.total_points(),
                p.points_per_work_group
            ));
        }

        // Explicit positions must match the count and sit inside the interior
        if let Some(positions) = &p.positions {
            if positions.len() != p.count as usize {
                errors.push(format!(
                    "particles.positions has {} entries, count is {}",
                    positions.len(),
                    p.count
                ));
            }
            for (i, pos) in positions.iter().enumerate() {
                let inside = (0..3).all(|a| pos[a] >= 1.0 && pos[a] < self.lattice_size[a] as f32 - 1.0);
                if !inside {
                    errors.push(format!("particle {i} at {pos:?} lies outside the interior"));
                }
            }
        }
    }
}
