//! Spatial zone index for bounded particle-particle neighbour search.
//!
//! The interior `[1, size - 1)` on each axis is cut into a uniform grid of
//! zones. Each zone keeps a cached list of up to 26 distinct neighbouring
//! zones (wrapped on periodic axes, clipped on the others), so a particle
//! only has to look at members of its own zone and those neighbours.
//!
//! Membership is stored with a fixed per-zone capacity of `num_particles`
//! (zone `z` owns `members[z * n .. (z + 1) * n]`) so it maps onto a flat
//! device buffer. Thread-group ownership is independent of zones and stays
//! static: particle `p` belongs to group `p % groups`.

use crate::lattice::{BoundaryKind, LatticeDims};
use crate::params::{FlpParams, IntParams};

/// Maximum distinct neighbours of a zone in a 3x3x3 block.
pub const MAX_ZONE_NEIGHBOURS: usize = 26;

/// Unused membership slot.
pub const EMPTY_SLOT: u32 = u32::MAX;

/// Static per-zone neighbour cache, uploaded read-only.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ZoneInfo {
    /// Neighbouring zone ids; only the first `num_neighbours` are valid.
    pub neighbours: [u32; MAX_ZONE_NEIGHBOURS],
    /// Valid entries in `neighbours`.
    pub num_neighbours: u32,
}

impl ZoneInfo {
    /// The valid neighbour ids.
    pub fn neighbours(&self) -> &[u32] {
        &self.neighbours[..self.num_neighbours as usize]
    }
}

/// A zone would exceed its membership capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("zone {zone} is full ({capacity} members)")]
pub struct ZoneOverflow {
    /// Zone that ran out of slots
    pub zone: u32,
    /// Slots per zone
    pub capacity: usize,
}

// ---------------------------------------------------------------------------
// Zone grid
// ---------------------------------------------------------------------------

/// Uniform zone grid over the lattice interior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneGrid {
    /// Zones per axis.
    pub counts: [u32; 3],
    /// Zone extent per axis in lattice units.
    pub zone_size: [f32; 3],
    /// Lower corner of zone (0, 0, 0).
    pub origin: [f32; 3],
}

impl ZoneGrid {
    /// Split the interior of `dims` into `counts` zones per axis.
    pub fn new(dims: &LatticeDims, counts: [u32; 3]) -> Self {
        let n = dims.interior_extent();
        let zone_size = [0, 1, 2].map(|a| n[a] as f32 / counts[a].max(1) as f32);
        Self {
            counts: counts.map(|c| c.max(1)),
            zone_size,
            origin: [1.0; 3],
        }
    }

    /// Rebuild the grid from the parameter blocks.
    pub fn from_params(ip: &IntParams, fp: &FlpParams) -> Self {
        Self {
            counts: ip.num_zones.map(|c| c.max(1)),
            zone_size: fp.zone_size,
            origin: [1.0; 3],
        }
    }

    /// Zone count.
    pub fn total(&self) -> usize {
        self.counts.iter().map(|&c| c as usize).product()
    }

    /// Smallest zone extent over the three axes.
    pub fn min_extent(&self) -> f32 {
        self.zone_size.iter().copied().fold(f32::INFINITY, f32::min)
    }

    /// Zone coordinate of a position, clamped to the grid.
    #[inline]
    pub fn zone_coords(&self, pos: [f32; 3]) -> [u32; 3] {
        [0, 1, 2].map(|a| {
            ((pos[a] - self.origin[a]) / self.zone_size[a])
                .floor()
                .max(0.0)
                .min((self.counts[a] - 1) as f32) as u32
        })
    }

    #[inline]
    /// Flattened id of zone coordinate `c`, x fastest.
    pub fn zone_id(&self, c: [u32; 3]) -> u32 {
        c[0] + c[1] * self.counts[0] + c[2] * self.counts[0] * self.counts[1]
    }

    /// Flattened zone id of a position.
    #[inline]
    pub fn zone_of(&self, pos: [f32; 3]) -> u32 {
        self.zone_id(self.zone_coords(pos))
    }

    /// Neighbour cache for every zone.
    pub fn build_info(&self, bcs: [BoundaryKind; 3]) -> Vec<ZoneInfo> {
        let [cx, cy, cz] = self.counts;
        let mut info = Vec::with_capacity(self.total());
        for k in 0..cz {
            for j in 0..cy {
                for i in 0..cx {
                    info.push(self.neighbours_of([i, j, k], &bcs));
                }
            }
        }
        info
    }

    fn neighbours_of(&self, c: [u32; 3], bcs: &[BoundaryKind; 3]) -> ZoneInfo {
        let own = self.zone_id(c);
        let mut out = ZoneInfo {
            neighbours: [EMPTY_SLOT; MAX_ZONE_NEIGHBOURS],
            num_neighbours: 0,
        };
        for dz in -1i64..=1 {
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let Some(nc) = self.shifted(c, [dx, dy, dz], bcs) else {
                        continue;
                    };
                    let id = self.zone_id(nc);
                    let n = out.num_neighbours as usize;
                    if id == own || out.neighbours[..n].contains(&id) {
                        continue;
                    }
                    out.neighbours[n] = id;
                    out.num_neighbours += 1;
                }
            }
        }
        out
    }

    fn shifted(&self, c: [u32; 3], d: [i64; 3], bcs: &[BoundaryKind; 3]) -> Option<[u32; 3]> {
        let mut out = [0u32; 3];
        for a in 0..3 {
            let n = self.counts[a] as i64;
            let v = c[a] as i64 + d[a];
            out[a] = if (0..n).contains(&v) {
                v as u32
            } else if bcs[a] == BoundaryKind::Periodic {
                v.rem_euclid(n) as u32
            } else {
                return None;
            };
        }
        Some(out)
    }
}

// ---------------------------------------------------------------------------
// Thread-group assignment
// ---------------------------------------------------------------------------

/// Static partition of particles across CPU-side thread groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadAssignment {
    /// `num_groups * num_particles` slots, group-major, `EMPTY_SLOT` padded.
    pub members: Vec<u32>,
    /// Owned particle count per group.
    pub counts: Vec<u32>,
    num_particles: usize,
}

impl ThreadAssignment {
    /// Round-robin: particle `p` goes to group `p % num_groups`.
    pub fn round_robin(num_particles: usize, num_groups: usize) -> Self {
        let groups = num_groups.max(1);
        let mut members = vec![EMPTY_SLOT; groups * num_particles];
        let mut counts = vec![0u32; groups];
        for p in 0..num_particles {
            let g = p % groups;
            members[g * num_particles + counts[g] as usize] = p as u32;
            counts[g] += 1;
        }
        Self {
            members,
            counts,
            num_particles,
        }
    }

    /// Thread-group count.
    pub fn num_groups(&self) -> usize {
        self.counts.len()
    }

    /// Particles owned by group `g`.
    pub fn owned(&self, g: usize) -> &[u32] {
        owned_slice(&self.members, &self.counts, self.num_particles, g)
    }
}

/// Owned particles of group `g` in flat member/count arrays.
pub fn owned_slice<'a>(members: &'a [u32], counts: &[u32], num_particles: usize, g: usize) -> &'a [u32] {
    let start = g * num_particles;
    &members[start..start + counts[g] as usize]
}

// ---------------------------------------------------------------------------
// Zone membership
// ---------------------------------------------------------------------------

/// Zone membership arrays mirroring the device buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneMembership {
    /// Zone id per particle.
    pub pars_zone: Vec<u32>,
    /// `total_zones * num_particles` slots, zone-major, `EMPTY_SLOT` padded.
    pub members: Vec<u32>,
    /// Member count per zone.
    pub counts: Vec<u32>,
}

impl ZoneMembership {
    /// Assign every particle to its zone, walking thread groups in order.
    pub fn build(grid: &ZoneGrid, positions: &[[f32; 3]], threads: &ThreadAssignment) -> Self {
        let n = positions.len();
        let mut out = Self {
            pars_zone: vec![0; n],
            members: vec![EMPTY_SLOT; grid.total() * n],
            counts: vec![0; grid.total()],
        };
        let assignments: Vec<(u32, u32)> = (0..threads.num_groups())
            .flat_map(|g| threads.owned(g).iter().copied())
            .map(|p| (p, grid.zone_of(positions[p as usize])))
            .collect();
        // Each particle is filed once into empty zones of capacity n
        for (p, z) in assignments {
            place(p, z, n, &mut out.pars_zone, &mut out.members, &mut out.counts);
        }
        out
    }

    /// Member ids of zone `z`.
    pub fn members_of(&self, z: usize) -> &[u32] {
        let n = self.pars_zone.len();
        &self.members[z * n..z * n + self.counts[z] as usize]
    }

    /// True when every particle appears in exactly one zone list, the one
    /// its `pars_zone` entry names, and the counts add up.
    pub fn is_partition(&self) -> bool {
        is_partition(&self.pars_zone, &self.members, &self.counts)
    }
}

/// Append `(particle, zone)` pairs to the flat membership arrays in order.
///
/// Counts are not reset here; callers zero them before a rebuild.
pub fn scatter_members(
    assignments: &[(u32, u32)],
    num_particles: usize,
    pars_zone: &mut [u32],
    members: &mut [u32],
    counts: &mut [u32],
) -> Result<(), ZoneOverflow> {
    for &(p, z) in assignments {
        if counts[z as usize] as usize >= num_particles {
            return Err(ZoneOverflow {
                zone: z,
                capacity: num_particles,
            });
        }
        place(p, z, num_particles, pars_zone, members, counts);
    }
    Ok(())
}

#[inline]
fn place(p: u32, z: u32, num_particles: usize, pars_zone: &mut [u32], members: &mut [u32], counts: &mut [u32]) {
    let slot = counts[z as usize] as usize;
    pars_zone[p as usize] = z;
    members[z as usize * num_particles + slot] = p;
    counts[z as usize] += 1;
}

/// Partition check over flat membership arrays.
pub fn is_partition(pars_zone: &[u32], members: &[u32], counts: &[u32]) -> bool {
    let n = pars_zone.len();
    if counts.iter().map(|&c| c as usize).sum::<usize>() != n {
        return false;
    }
    let mut seen = vec![false; n];
    for (z, &count) in counts.iter().enumerate() {
        for &p in &members[z * n..z * n + count as usize] {
            let p = p as usize;
            if p >= n || seen[p] || pars_zone[p] as usize != z {
                return false;
            }
            seen[p] = true;
        }
    }
    seen.into_iter().all(|s| s)
}
