//! D3Q19 stencil, lattice extents and index-space regions.
//!
//! Distribution values are stored node-major: the 19 populations of node `n`
//! occupy `f[n * LB_Q .. (n + 1) * LB_Q]`. Nodes are flattened with x fastest.
//! Every axis carries a one-node halo; physically active nodes live in
//! `1..=size - 2`.

use std::fmt;

/// Number of discrete velocities in the D3Q19 stencil.
pub const LB_Q: usize = 19;

/// Lattice velocity vectors. Index 0 is the rest population.
pub const E: [[i32; 3]; LB_Q] = [
    [0, 0, 0],
    // face neighbours
    [1, 0, 0],
    [-1, 0, 0],
    [0, 1, 0],
    [0, -1, 0],
    [0, 0, 1],
    [0, 0, -1],
    // edge neighbours
    [1, 1, 0],
    [-1, -1, 0],
    [1, -1, 0],
    [-1, 1, 0],
    [1, 0, 1],
    [-1, 0, -1],
    [1, 0, -1],
    [-1, 0, 1],
    [0, 1, 1],
    [0, -1, -1],
    [0, 1, -1],
    [0, -1, 1],
];

/// Quadrature weights matching [`E`].
pub const W: [f32; LB_Q] = [
    1.0 / 3.0,
    1.0 / 18.0,
    1.0 / 18.0,
    1.0 / 18.0,
    1.0 / 18.0,
    1.0 / 18.0,
    1.0 / 18.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
];

/// Index of the direction opposite to each entry of [`E`].
pub const OPP: [usize; LB_Q] = [
    0, 2, 1, 4, 3, 6, 5, 8, 7, 10, 9, 12, 11, 14, 13, 16, 15, 18, 17,
];

/// Lattice speed of sound squared.
pub const CS2: f32 = 1.0 / 3.0;

/// Boundary-condition selector for one lattice axis.
///
/// The discriminants are the raw values stored in the integer parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum BoundaryKind {
    /// Populations leaving one face re-enter through the opposite face.
    Periodic = 0,
    /// Halfway bounce-back wall, handled inside collide-stream.
    BounceBack = 1,
    /// Prescribed-velocity wall on the first and last interior layers.
    Velocity = 2,
}

impl BoundaryKind {
    /// Decode a raw parameter-block value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Periodic),
            1 => Some(Self::BounceBack),
            2 => Some(Self::Velocity),
            _ => None,
        }
    }

    /// Raw parameter-block value.
    pub fn raw(self) -> u32 {
        self as u32
    }
}

/// Full lattice extents, halo included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatticeDims {
    /// Node count per axis, halo included.
    pub size: [usize; 3],
}

impl LatticeDims {
    /// Extents from node counts per axis.
    pub fn new(size: [usize; 3]) -> Self {
        Self { size }
    }

    /// Total node count, halo included.
    pub fn num_nodes(&self) -> usize {
        self.size[0] * self.size[1] * self.size[2]
    }

    /// Length of one full distribution buffer.
    pub fn num_distributions(&self) -> usize {
        self.num_nodes() * LB_Q
    }

    /// Interior extent per axis (size minus the two halo layers).
    pub fn interior_extent(&self) -> [usize; 3] {
        [
            self.size[0].saturating_sub(2),
            self.size[1].saturating_sub(2),
            self.size[2].saturating_sub(2),
        ]
    }

    /// Flat index of node `c`, x fastest.
    #[inline]
    pub fn node_index(&self, c: [usize; 3]) -> usize {
        c[0] + self.size[0] * (c[1] + self.size[1] * c[2])
    }

    /// Inverse of [`LatticeDims::node_index`].
    #[inline]
    pub fn coords(&self, node: usize) -> [usize; 3] {
        let x = node % self.size[0];
        let y = (node / self.size[0]) % self.size[1];
        let z = node / (self.size[0] * self.size[1]);
        [x, y, z]
    }

    /// True if `c` lies in `1..=size - 2` on every axis.
    #[inline]
    pub fn is_interior(&self, c: [usize; 3]) -> bool {
        (0..3).all(|a| c[a] >= 1 && c[a] + 1 < self.size[a])
    }

    /// Neighbour of `c` along `e`, or `None` if it falls outside the full lattice.
    #[inline]
    pub fn offset(&self, c: [usize; 3], e: [i32; 3]) -> Option<[usize; 3]> {
        let mut out = [0usize; 3];
        for a in 0..3 {
            let v = c[a] as i64 + e[a] as i64;
            if v < 0 || v >= self.size[a] as i64 {
                return None;
            }
            out[a] = v as usize;
        }
        Some(out)
    }
}

/// Flat distribution index of population `dir` at `node`.
#[inline]
pub fn f_index(node: usize, dir: usize) -> usize {
    node * LB_Q + dir
}

// ---------------------------------------------------------------------------
// Regions
// ---------------------------------------------------------------------------

/// A 3D index space: global ids run over `offset .. offset + extent` per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    /// First global id per axis.
    pub offset: [usize; 3],
    /// Id count per axis.
    pub extent: [usize; 3],
}

impl Region {
    /// Interior of the lattice: offset (1, 1, 1), extent `size - 2`.
    pub fn interior(dims: &LatticeDims) -> Self {
        Self {
            offset: [1, 1, 1],
            extent: dims.interior_extent(),
        }
    }

    /// Velocity-wall slab: two ids thick along `axis`, interior extent on the
    /// other two axes. Id 1 along `axis` selects the lower wall layer and
    /// id 2 the upper one.
    pub fn velocity_slab(dims: &LatticeDims, axis: usize) -> Self {
        let mut extent = dims.interior_extent();
        extent[axis] = 2;
        Self {
            offset: [1, 1, 1],
            extent,
        }
    }

    /// Number of work items.
    pub fn len(&self) -> usize {
        self.extent[0] * self.extent[1] * self.extent[2]
    }

    /// True when any axis has zero extent.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `c` is one of the region's global ids.
    pub fn contains(&self, c: [usize; 3]) -> bool {
        (0..3).all(|a| c[a] >= self.offset[a] && c[a] < self.offset[a] + self.extent[a])
    }

    /// Global ids in x-fastest order.
    pub fn ids(&self) -> impl Iterator<Item = [usize; 3]> + '_ {
        let [ox, oy, oz] = self.offset;
        let [ex, ey, ez] = self.extent;
        (oz..oz + ez).flat_map(move |z| {
            (oy..oy + ey).flat_map(move |y| (ox..ox + ex).map(move |x| [x, y, z]))
        })
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{} @ ({}, {}, {})",
            self.extent[0], self.extent[1], self.extent[2], self.offset[0], self.offset[1], self.offset[2]
        )
    }
}

// ---------------------------------------------------------------------------
// Equilibrium
// ---------------------------------------------------------------------------

/// Second-order BGK equilibrium for density `rho` and velocity `u`.
pub fn equilibrium(rho: f32, u: [f32; 3]) -> [f32; LB_Q] {
    let usq = u[0] * u[0] + u[1] * u[1] + u[2] * u[2];
    let mut feq = [0.0f32; LB_Q];
    for q in 0..LB_Q {
        let eu = E[q][0] as f32 * u[0] + E[q][1] as f32 * u[1] + E[q][2] as f32 * u[2];
        feq[q] = W[q] * rho * (1.0 + 3.0 * eu + 4.5 * eu * eu - 1.5 * usq);
    }
    feq
}

/// Density and momentum of one node's populations.
pub fn moments(f: &[f32]) -> (f32, [f32; 3]) {
    let mut rho = 0.0f32;
    let mut j = [0.0f32; 3];
    for (q, &v) in f.iter().enumerate().take(LB_Q) {
        rho += v;
        j[0] += E[q][0] as f32 * v;
        j[1] += E[q][1] as f32 * v;
        j[2] += E[q][2] as f32 * v;
    }
    (rho, j)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_one() {
        let total: f32 = W.iter().sum();
        assert!((total - 1.0).abs() < 1e-6, "weights sum {total}");
    }

    #[test]
    fn opposite_table_negates_velocity() {
        for q in 0..LB_Q {
            let o = OPP[q];
            assert_eq!(OPP[o], q);
            for a in 0..3 {
                assert_eq!(E[q][a], -E[o][a], "direction {q} axis {a}");
            }
        }
    }

    #[test]
    fn equilibrium_recovers_moments() {
        let u = [0.02, -0.01, 0.03];
        let feq = equilibrium(1.2, u);
        let (rho, j) = moments(&feq);
        assert!((rho - 1.2).abs() < 1e-5);
        for a in 0..3 {
            assert!((j[a] / rho - u[a]).abs() < 1e-5, "axis {a}");
        }
    }

    #[test]
    fn interior_region_excludes_halo() {
        let dims = LatticeDims::new([10, 10, 10]);
        let r = Region::interior(&dims);
        assert_eq!(r.offset, [1, 1, 1]);
        assert_eq!(r.extent, [8, 8, 8]);
        assert_eq!(r.ids().count(), 512);
        assert!(r.ids().all(|c| dims.is_interior(c)));
    }

    #[test]
    fn velocity_slab_is_two_thick() {
        let dims = LatticeDims::new([12, 9, 7]);
        let r = Region::velocity_slab(&dims, 1);
        assert_eq!(r.extent, [10, 2, 5]);
        assert_eq!(r.len(), 100);
    }

    #[test]
    fn node_index_round_trips() {
        let dims = LatticeDims::new([5, 6, 7]);
        let c = [3, 4, 5];
        assert_eq!(dims.coords(dims.node_index(c)), c);
    }
}
