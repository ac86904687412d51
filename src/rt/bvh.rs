//! SAH-based BVH builder over primitive bounding boxes.
//!
//! Produces a flat node array (index 0 = root) plus a primitive order;
//! acceleration structures store both verbatim in device memory.

use bytemuck::{Pod, Zeroable};

use crate::util::{Mat3x4f, Vec3};

/// Number of SAH bins for split evaluation.
const NUM_BINS: usize = 12;

/// Cost ratio: traversal vs intersection.
const TRAVERSAL_COST: f32 = 1.0;
const INTERSECT_COST: f32 = 1.0;

/// Maximum primitives per leaf before forcing a split.
const MAX_LEAF_SIZE: usize = 4;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: [f32::INFINITY; 3],
        max: [f32::NEG_INFINITY; 3],
    };

    #[inline]
    pub fn is_empty(&self) -> bool {
        (0..3).any(|i| self.min[i] > self.max[i])
    }

    /// Grow to include a point.
    #[inline]
    pub fn grow_point(&mut self, p: [f32; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }

    /// Grow to include another AABB.
    #[inline]
    pub fn grow(&mut self, other: &Aabb) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(other.min[i]);
            self.max[i] = self.max[i].max(other.max[i]);
        }
    }

    /// Surface area (for SAH cost).
    #[inline]
    pub fn area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let dx = self.max[0] - self.min[0];
        let dy = self.max[1] - self.min[1];
        let dz = self.max[2] - self.min[2];
        2.0 * (dx * dy + dy * dz + dz * dx)
    }

    #[inline]
    pub fn centroid(&self) -> [f32; 3] {
        [
            (self.min[0] + self.max[0]) * 0.5,
            (self.min[1] + self.max[1]) * 0.5,
            (self.min[2] + self.max[2]) * 0.5,
        ]
    }

    /// Bounds of this box after `transform`.
    pub fn transformed(&self, transform: &Mat3x4f) -> Aabb {
        let mut out = Aabb::EMPTY;
        if self.is_empty() {
            return out;
        }
        for corner in 0..8 {
            let p = Vec3::new(
                if corner & 1 == 0 { self.min[0] } else { self.max[0] },
                if corner & 2 == 0 { self.min[1] } else { self.max[1] },
                if corner & 4 == 0 { self.min[2] } else { self.max[2] },
            );
            out.grow_point(transform.transform_point(p).to_array());
        }
        out
    }

    /// Slab test. Returns the entry distance if the ray overlaps `[tmin, tmax]`.
    #[inline]
    pub fn intersect(&self, origin: Vec3, inv_dir: Vec3, tmin: f32, tmax: f32) -> Option<f32> {
        if self.is_empty() {
            return None;
        }
        let (o, d) = (origin.to_array(), inv_dir.to_array());
        let mut t0 = tmin;
        let mut t1 = tmax;
        for i in 0..3 {
            let mut near = (self.min[i] - o[i]) * d[i];
            let mut far = (self.max[i] - o[i]) * d[i];
            if near > far {
                std::mem::swap(&mut near, &mut far);
            }
            // NaN from 0 * inf leaves the bound untouched.
            if near > t0 {
                t0 = near;
            }
            if far < t1 {
                t1 = far;
            }
            if t0 > t1 {
                return None;
            }
        }
        Some(t0)
    }
}

impl From<&BvhNode> for Aabb {
    fn from(node: &BvhNode) -> Self {
        Self {
            min: node.aabb_min,
            max: node.aabb_max,
        }
    }
}

/// Device BVH node (32 bytes).
///
/// Internal node: left_or_first = left child index (right = left + 1), count = 0
/// Leaf node: left_or_first = first primitive slot, count > 0
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct BvhNode {
    pub aabb_min: [f32; 3],
    pub left_or_first: u32,
    pub aabb_max: [f32; 3],
    pub count: u32,
}

impl BvhNode {
    fn leaf(aabb: &Aabb, first: usize, count: usize) -> Self {
        Self {
            aabb_min: aabb.min,
            left_or_first: first as u32,
            aabb_max: aabb.max,
            count: count as u32,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }
}

/// Built BVH.
pub struct Bvh {
    /// Flat node array (index 0 = root).
    pub nodes: Vec<BvhNode>,
    /// Primitive order; leaves reference ranges of this list.
    pub prim_indices: Vec<usize>,
}

impl Bvh {
    /// Node count for `prim_count` primitives in the worst case.
    pub const fn max_nodes(prim_count: usize) -> usize {
        if prim_count <= 1 {
            1
        } else {
            2 * prim_count - 1
        }
    }

    pub fn bounds(&self) -> Aabb {
        self.nodes.first().map_or(Aabb::EMPTY, Aabb::from)
    }
}

/// SAH bin for evaluating split candidates.
#[derive(Clone, Copy)]
struct Bin {
    bounds: Aabb,
    count: usize,
}

/// Build a BVH over primitive bounds using SAH.
///
/// Primitives are not reordered; `prim_indices` maps leaf slots to input indices.
#[tracing::instrument(skip_all, fields(prim_count = aabbs.len()))]
pub fn build_bvh(aabbs: &[Aabb]) -> Bvh {
    let n = aabbs.len();
    if n == 0 {
        return Bvh {
            nodes: vec![BvhNode::leaf(&Aabb::EMPTY, 0, 0)],
            prim_indices: vec![],
        };
    }

    let centroids: Vec<[f32; 3]> = aabbs.iter().map(Aabb::centroid).collect();
    let mut indices: Vec<usize> = (0..n).collect();
    let mut nodes: Vec<BvhNode> = Vec::with_capacity(Bvh::max_nodes(n));
    nodes.push(BvhNode::default());

    struct Task {
        node_idx: usize,
        start: usize,
        end: usize, // exclusive
    }

    let mut stack = vec![Task {
        node_idx: 0,
        start: 0,
        end: n,
    }];

    while let Some(task) = stack.pop() {
        let (start, end) = (task.start, task.end);
        let count = end - start;

        let mut node_aabb = Aabb::EMPTY;
        for &idx in &indices[start..end] {
            node_aabb.grow(&aabbs[idx]);
        }

        if count <= MAX_LEAF_SIZE {
            nodes[task.node_idx] = BvhNode::leaf(&node_aabb, start, count);
            continue;
        }

        let mut centroid_bounds = Aabb::EMPTY;
        for &idx in &indices[start..end] {
            centroid_bounds.grow_point(centroids[idx]);
        }

        let (best_axis, best_split_pos, best_cost) =
            find_best_split(&indices[start..end], aabbs, &centroids, &centroid_bounds);

        let leaf_cost = count as f32 * INTERSECT_COST * node_aabb.area();
        if best_axis == usize::MAX || best_cost >= leaf_cost {
            nodes[task.node_idx] = BvhNode::leaf(&node_aabb, start, count);
            continue;
        }

        let mid = partition(&mut indices[start..end], |&idx| {
            centroids[idx][best_axis] < best_split_pos
        }) + start;
        let mid = if mid == start || mid == end {
            (start + end) / 2
        } else {
            mid
        };

        let left_idx = nodes.len();
        nodes.push(BvhNode::default());
        nodes.push(BvhNode::default());
        nodes[task.node_idx] = BvhNode {
            aabb_min: node_aabb.min,
            left_or_first: left_idx as u32,
            aabb_max: node_aabb.max,
            count: 0,
        };

        // Right first so the left subtree is laid out first.
        stack.push(Task {
            node_idx: left_idx + 1,
            start: mid,
            end,
        });
        stack.push(Task {
            node_idx: left_idx,
            start,
            end: mid,
        });
    }

    Bvh {
        nodes,
        prim_indices: indices,
    }
}

/// SAH binned split search across all 3 axes.
/// Returns (best_axis, split_position, cost). axis=usize::MAX if no valid split.
fn find_best_split(
    indices: &[usize],
    aabbs: &[Aabb],
    centroids: &[[f32; 3]],
    centroid_bounds: &Aabb,
) -> (usize, f32, f32) {
    let mut best_axis = usize::MAX;
    let mut best_pos = 0.0f32;
    let mut best_cost = f32::INFINITY;

    for axis in 0..3 {
        let extent = centroid_bounds.max[axis] - centroid_bounds.min[axis];
        if extent < 1e-8 {
            continue;
        }

        let mut bins = [Bin {
            bounds: Aabb::EMPTY,
            count: 0,
        }; NUM_BINS];
        let inv_extent = NUM_BINS as f32 / extent;

        for &idx in indices {
            let bin_id = ((centroids[idx][axis] - centroid_bounds.min[axis]) * inv_extent) as usize;
            let bin = &mut bins[bin_id.min(NUM_BINS - 1)];
            bin.bounds.grow(&aabbs[idx]);
            bin.count += 1;
        }

        let mut left_area = [0.0f32; NUM_BINS - 1];
        let mut left_count = [0usize; NUM_BINS - 1];
        let mut sweep = Aabb::EMPTY;
        let mut sweep_count = 0;
        for i in 0..NUM_BINS - 1 {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            left_area[i] = sweep.area();
            left_count[i] = sweep_count;
        }

        sweep = Aabb::EMPTY;
        sweep_count = 0;
        for i in (1..NUM_BINS).rev() {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            let cost = TRAVERSAL_COST
                + INTERSECT_COST
                    * (left_count[i - 1] as f32 * left_area[i - 1]
                        + sweep_count as f32 * sweep.area());

            if cost < best_cost {
                best_cost = cost;
                best_axis = axis;
                best_pos = centroid_bounds.min[axis] + (i as f32 / NUM_BINS as f32) * extent;
            }
        }
    }

    (best_axis, best_pos, best_cost)
}

/// Partition slice in-place. Returns count of elements where predicate is true.
fn partition<T, F>(slice: &mut [T], pred: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut left = 0;
    let mut right = slice.len();
    while left < right {
        if pred(&slice[left]) {
            left += 1;
        } else {
            right -= 1;
            slice.swap(left, right);
        }
    }
    left
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box(x: f32) -> Aabb {
        Aabb {
            min: [x - 0.5, -0.5, -0.5],
            max: [x + 0.5, 0.5, 0.5],
        }
    }

    #[test]
    fn test_empty_bvh() {
        let bvh = build_bvh(&[]);
        assert_eq!(bvh.nodes.len(), 1);
        assert!(bvh.prim_indices.is_empty());
        assert!(bvh.bounds().is_empty());
    }

    #[test]
    fn test_small_input_is_single_leaf() {
        let bvh = build_bvh(&[unit_box(0.0), unit_box(1.0), unit_box(2.0)]);
        assert_eq!(bvh.nodes.len(), 1);
        assert_eq!(bvh.nodes[0].count, 3);
    }

    #[test]
    fn test_many_prims_builds_tree() {
        let boxes: Vec<Aabb> = (0..100).map(|i| unit_box(i as f32 * 2.0)).collect();
        let bvh = build_bvh(&boxes);
        assert!(bvh.nodes.len() > 1);
        assert!(bvh.nodes.len() <= Bvh::max_nodes(100));

        let mut sorted = bvh.prim_indices.clone();
        sorted.sort();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());

        let leaf_total: u32 = bvh.nodes.iter().filter(|n| n.is_leaf()).map(|n| n.count).sum();
        assert_eq!(leaf_total, 100);
        assert!(bvh.nodes[0].aabb_min[0] < 0.0);
        assert!(bvh.nodes[0].aabb_max[0] > 198.0);
    }

    #[test]
    fn test_identical_centroids_stay_leaf() {
        let boxes = vec![unit_box(0.0); 20];
        let bvh = build_bvh(&boxes);
        let leaf_total: u32 = bvh.nodes.iter().filter(|n| n.is_leaf()).map(|n| n.count).sum();
        assert_eq!(leaf_total, 20);
    }

    #[test]
    fn test_slab_intersection() {
        let b = unit_box(5.0);
        let origin = Vec3::ZERO;
        let inv = Vec3::X.recip();
        let t = b.intersect(origin, inv, 0.0, f32::INFINITY).unwrap();
        assert!((t - 4.5).abs() < 1e-6);
        assert!(b.intersect(origin, inv, 0.0, 4.0).is_none());
        assert!(b.intersect(origin, Vec3::Y.recip(), 0.0, f32::INFINITY).is_none());
    }

    #[test]
    fn test_transformed_bounds() {
        let b = unit_box(0.0);
        let t = Mat3x4f::from_translation(Vec3::new(10.0, 0.0, 0.0));
        let moved = b.transformed(&t);
        assert_eq!(moved.min, [9.5, -0.5, -0.5]);
        assert_eq!(moved.max, [10.5, 0.5, 0.5]);
    }
}
