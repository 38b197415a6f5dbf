//! Precomputed periodic wrap-around links.
//!
//! Collide-stream pushes every post-collision population to its neighbour,
//! including neighbours that sit in the halo. For each such halo slot that
//! only left the interior through periodic faces, the map records where the
//! value has to be copied: the same direction slot of the wrapped interior
//! node. The periodic boundary kernel then performs `f[dst] = f[src]` for
//! every link, once per step.

use crate::lattice::{f_index, BoundaryKind, LatticeDims, E};

/// One periodic transfer between flat distribution indices.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StreamLink {
    /// Halo slot written by the push step.
    pub src: u32,
    /// Interior slot the value belongs in.
    pub dst: u32,
}

/// The lattice has more distributions than a 32-bit link index can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("lattice of {distributions} distributions does not fit 32-bit stream-map indices")]
pub struct IndexOverflow {
    /// Distribution count of the rejected lattice
    pub distributions: usize,
}

/// Ordered list of periodic links for one lattice and boundary selection.
#[derive(Debug, Clone, Default)]
pub struct PeriodicStreamMap {
    links: Vec<StreamLink>,
}

impl PeriodicStreamMap {
    /// Build the map for `dims` with per-axis boundary selectors `bcs`.
    ///
    /// A link exists for an interior node and stencil direction when the
    /// pushed destination leaves the interior on at least one axis and every
    /// axis it leaves on is periodic. Links that also cross a bounce-back or
    /// velocity face belong to those boundary treatments instead.
    pub fn build(dims: &LatticeDims, bcs: [BoundaryKind; 3]) -> Result<Self, IndexOverflow> {
        let size = dims.size;
        let overflow = IndexOverflow {
            distributions: dims.num_distributions(),
        };
        let link_index = |i: usize| u32::try_from(i).map_err(|_| overflow);
        if dims.num_distributions() > u32::MAX as usize {
            return Err(overflow);
        }
        let mut links = Vec::new();

        for z in 1..size[2].saturating_sub(1) {
            for y in 1..size[1].saturating_sub(1) {
                for x in 1..size[0].saturating_sub(1) {
                    let c = [x, y, z];
                    let on_face = (0..3).any(|a| c[a] == 1 || c[a] + 2 == size[a]);
                    if !on_face {
                        continue;
                    }
                    for (dir, e) in E.iter().enumerate().skip(1) {
                        if let Some(wrapped) = wrap_destination(c, *e, size, &bcs) {
                            let halo = [
                                (c[0] as i64 + e[0] as i64) as usize,
                                (c[1] as i64 + e[1] as i64) as usize,
                                (c[2] as i64 + e[2] as i64) as usize,
                            ];
                            debug_assert!(!dims.is_interior(halo));
                            links.push(StreamLink {
                                src: link_index(f_index(dims.node_index(halo), dir))?,
                                dst: link_index(f_index(dims.node_index(wrapped), dir))?,
                            });
                        }
                    }
                }
            }
        }

        Ok(Self { links })
    }

    /// Links in build order.
    pub fn links(&self) -> &[StreamLink] {
        &self.links
    }

    /// Number of links, which is also the periodic kernel's index-space size.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// True without any periodic axis.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Wrapped interior destination of a push from `c` along `e`, if that push
/// crosses only periodic faces.
fn wrap_destination(
    c: [usize; 3],
    e: [i32; 3],
    size: [usize; 3],
    bcs: &[BoundaryKind; 3],
) -> Option<[usize; 3]> {
    let mut out = [0usize; 3];
    let mut crossed = false;
    for a in 0..3 {
        let d = c[a] as i64 + e[a] as i64;
        let last = size[a] as i64 - 2;
        if d < 1 || d > last {
            if bcs[a] != BoundaryKind::Periodic {
                return None;
            }
            crossed = true;
            out[a] = if d < 1 { last as usize } else { 1 };
        } else {
            out[a] = d as usize;
        }
    }
    crossed.then_some(out)
}

/// Closed-form number of periodic links for `dims` and `bcs`.
///
/// For each direction: pushes that stay in the interior on every
/// non-periodic axis, minus pushes that stay in the interior on all axes.
pub fn expected_link_count(dims: &LatticeDims, bcs: [BoundaryKind; 3]) -> usize {
    let n = dims.interior_extent();
    E.iter()
        .skip(1)
        .map(|e| {
            let mut all = 1usize;
            let mut inside = 1usize;
            for a in 0..3 {
                let stay = n[a].saturating_sub(e[a].unsigned_abs() as usize);
                inside *= stay;
                all *= if bcs[a] == BoundaryKind::Periodic { n[a] } else { stay };
            }
            all - inside
        })
        .sum()
}
