//! Rigid spherical particle state and the shared surface discretisation.
//!
//! Per-particle data is packed into `[f32; 4]` records so each array maps
//! directly onto one device buffer:
//!
//! | array | records per particle | contents |
//! |-------|----------------------|----------|
//! | kinematics | 4 | position, linear velocity, rotation quaternion, angular velocity |
//! | forces | 2 | particle-particle force, torque |
//! | fluid forces | `2 * num_force_arrays` | (force, torque) per accumulation slot |

/// One packed device record. The fourth lane is padding unless noted.
pub type Vec4 = [f32; 4];

/// Kinematics record offsets within a particle's block.
pub const KIN_POS: usize = 0;
/// Linear velocity record.
pub const KIN_VEL: usize = 1;
/// Quaternion stored as `[w, x, y, z]`.
pub const KIN_ROT: usize = 2;
/// Angular velocity record.
pub const KIN_ANG_VEL: usize = 3;
/// Kinematics records per particle.
pub const KIN_STRIDE: usize = 4;

/// Force records per particle (force, torque).
pub const FORCE_STRIDE: usize = 2;

/// Index of kinematics record `field` for `particle`.
#[inline]
pub fn kin_index(particle: usize, field: usize) -> usize {
    particle * KIN_STRIDE + field
}

/// Index of the force record of accumulation `slot` for `particle`. The
/// torque record follows at `+ 1`.
#[inline]
pub fn fluid_slot_index(particle: usize, slot: usize, num_force_arrays: usize) -> usize {
    (particle * num_force_arrays + slot) * FORCE_STRIDE
}

/// First three lanes of a record.
#[inline]
pub fn xyz(v: Vec4) -> [f32; 3] {
    [v[0], v[1], v[2]]
}

/// Pack a 3-vector with zero padding.
#[inline]
pub fn vec4(v: [f32; 3]) -> Vec4 {
    [v[0], v[1], v[2], 0.0]
}

/// Host-side particle arrays, uploaded once to the read-write device buffers.
#[derive(Debug, Clone)]
pub struct ParticleState {
    /// `KIN_STRIDE` records per particle.
    pub kinematics: Vec<Vec4>,
    /// `FORCE_STRIDE` records per particle.
    pub forces: Vec<Vec4>,
    /// `FORCE_STRIDE * num_force_arrays` records per particle.
    pub fluid_forces: Vec<Vec4>,
    num_force_arrays: usize,
}

impl ParticleState {
    /// Empty state; at least one fluid-force slot per particle.
    pub fn new(num_force_arrays: usize) -> Self {
        Self {
            kinematics: Vec::new(),
            forces: Vec::new(),
            fluid_forces: Vec::new(),
            num_force_arrays: num_force_arrays.max(1),
        }
    }

    /// Append a particle at rest orientation.
    pub fn push(&mut self, position: [f32; 3], velocity: [f32; 3]) {
        self.kinematics.push(vec4(position));
        self.kinematics.push(vec4(velocity));
        self.kinematics.push([1.0, 0.0, 0.0, 0.0]);
        self.kinematics.push([0.0; 4]);
        self.forces.extend([[0.0; 4]; FORCE_STRIDE]);
        self.fluid_forces
            .extend(std::iter::repeat([0.0; 4]).take(FORCE_STRIDE * self.num_force_arrays));
    }

    /// Particle count.
    pub fn len(&self) -> usize {
        self.kinematics.len() / KIN_STRIDE
    }

    /// True with no particles.
    pub fn is_empty(&self) -> bool {
        self.kinematics.is_empty()
    }

    /// Fluid-force accumulation slots per particle.
    pub fn num_force_arrays(&self) -> usize {
        self.num_force_arrays
    }

    /// Position of particle `p`.
    pub fn position(&self, p: usize) -> [f32; 3] {
        xyz(self.kinematics[kin_index(p, KIN_POS)])
    }

    /// Linear velocity of particle `p`.
    pub fn velocity(&self, p: usize) -> [f32; 3] {
        xyz(self.kinematics[kin_index(p, KIN_VEL)])
    }
}

/// Sum the fluid force and torque slots of every particle in a packed
/// fluid-force array.
pub fn sum_fluid_slots(fluid_forces: &[Vec4], num_force_arrays: usize) -> Vec<([f32; 3], [f32; 3])> {
    let per_particle = FORCE_STRIDE * num_force_arrays.max(1);
    fluid_forces
        .chunks_exact(per_particle)
        .map(|block| {
            let mut force = [0.0f32; 3];
            let mut torque = [0.0f32; 3];
            for pair in block.chunks_exact(FORCE_STRIDE) {
                for a in 0..3 {
                    force[a] += pair[0][a];
                    torque[a] += pair[1][a];
                }
            }
            (force, torque)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Surface discretisation
// ---------------------------------------------------------------------------

/// `n` quasi-uniform unit-sphere directions on a golden-angle spiral.
pub fn sphere_surface_points(n: usize) -> Vec<Vec4> {
    let golden = std::f32::consts::PI * (3.0 - 5.0f32.sqrt());
    (0..n)
        .map(|i| {
            let z = 1.0 - 2.0 * (i as f32 + 0.5) / n as f32;
            let r = (1.0 - z * z).max(0.0).sqrt();
            let phi = golden * i as f32;
            [r * phi.cos(), r * phi.sin(), z, 0.0]
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Small vector / quaternion helpers
// ---------------------------------------------------------------------------

/// Cross product.
#[inline]
pub fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Rotate `v` by unit quaternion `q = [w, x, y, z]`.
pub fn rotate(q: Vec4, v: [f32; 3]) -> [f32; 3] {
    let u = [q[1], q[2], q[3]];
    let w = q[0];
    let t = cross(u, v).map(|c| 2.0 * c);
    let ut = cross(u, t);
    [
        v[0] + w * t[0] + ut[0],
        v[1] + w * t[1] + ut[1],
        v[2] + w * t[2] + ut[2],
    ]
}

/// Advance orientation `q` by angular velocity `omega` over `dt`, renormalised.
pub fn integrate_rotation(q: Vec4, omega: [f32; 3], dt: f32) -> Vec4 {
    let [w, x, y, z] = q;
    let [ox, oy, oz] = omega;
    let h = 0.5 * dt;
    let dq = [
        -h * (ox * x + oy * y + oz * z),
        h * (ox * w + oy * z - oz * y),
        h * (oy * w + oz * x - ox * z),
        h * (oz * w + ox * y - oy * x),
    ];
    let next = [w + dq[0], x + dq[1], y + dq[2], z + dq[3]];
    let norm = next.iter().map(|c| c * c).sum::<f32>().sqrt();
    if norm > 0.0 {
        next.map(|c| c / norm)
    } else {
        [1.0, 0.0, 0.0, 0.0]
    }
}
