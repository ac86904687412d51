//! Closest-hit traversal of built acceleration structures.

use smallvec::SmallVec;

use super::accel::{AccelHeader, AccelInstance, AccelKind, AccelTriangle};
use super::bvh::{Aabb, BvhNode};
use super::launch_params::TraversableHandle;
use crate::device::Status;
use crate::util::{Mat3x4f, Vec2, Vec3};

/// Verdict of an any-hit program on a candidate intersection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AnyHitResult {
    /// Accept and shrink the ray interval to the candidate.
    #[default]
    Accept,
    /// Discard the candidate and keep going.
    Ignore,
    /// Accept and stop traversal.
    Terminate,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct TraceRay {
    pub origin: Vec3,
    pub direction: Vec3,
    pub tmin: f32,
    pub tmax: f32,
}

/// Instance a candidate was found through.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct InstanceInfo {
    pub instance_id: u32,
    pub instance_index: u32,
    pub sbt_offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Candidate {
    pub t: f32,
    pub primitive_index: u32,
    pub barycentrics: Vec2,
    pub instance: InstanceInfo,
}

/// Walk `handle` and return the closest accepted hit within `[tmin, tmax)`.
///
/// Instance levels count towards `max_graph_depth`; a root structure is depth 1.
///
/// # Safety
/// `handle` and every structure it references must be built and alive.
pub(crate) unsafe fn trace_closest(
    handle: TraversableHandle,
    ray: &TraceRay,
    max_graph_depth: u32,
    any_hit: &mut dyn FnMut(&Candidate) -> AnyHitResult,
) -> Result<Option<Candidate>, Status> {
    if handle.is_null() {
        return Ok(None);
    }
    let mut walker = Walker {
        max_graph_depth,
        any_hit,
        closest: None,
        tmax: ray.tmax,
        terminated: false,
    };
    walker.walk(handle, ray.origin, ray.direction, ray.tmin, 1, InstanceInfo::default())?;
    Ok(walker.closest)
}

struct Walker<'a> {
    max_graph_depth: u32,
    any_hit: &'a mut dyn FnMut(&Candidate) -> AnyHitResult,
    closest: Option<Candidate>,
    tmax: f32,
    terminated: bool,
}

impl Walker<'_> {
    unsafe fn walk(
        &mut self,
        handle: TraversableHandle,
        origin: Vec3,
        direction: Vec3,
        tmin: f32,
        depth: u32,
        instance: InstanceInfo,
    ) -> Result<(), Status> {
        if depth > self.max_graph_depth {
            return Err(Status::TraversalDepthExceeded);
        }
        let header = AccelHeader::read(handle)?;
        if header.prim_count == 0 {
            return Ok(());
        }
        let kind = header.kind()?;
        let base = handle.as_device_ptr();
        let nodes = base.offset_bytes(header.nodes_offset as usize);
        let prims = base.offset_bytes(header.prims_offset as usize);
        let inv_dir = direction.recip();

        let mut stack: SmallVec<[u32; 64]> = SmallVec::new();
        stack.push(0);
        while let Some(idx) = stack.pop() {
            if self.terminated {
                return Ok(());
            }
            if idx >= header.node_count {
                return Err(Status::InvalidHandle);
            }
            let node: BvhNode = nodes.read(idx as usize);
            if Aabb::from(&node)
                .intersect(origin, inv_dir, tmin, self.tmax)
                .is_none()
            {
                continue;
            }
            if !node.is_leaf() {
                stack.push(node.left_or_first + 1);
                stack.push(node.left_or_first);
                continue;
            }
            let first = node.left_or_first as usize;
            for slot in first..first + node.count as usize {
                match kind {
                    AccelKind::Triangles => {
                        let tri: AccelTriangle = prims.read(slot);
                        if let Some((t, u, v)) = intersect_triangle(origin, direction, &tri, tmin, self.tmax) {
                            self.report(Candidate {
                                t,
                                primitive_index: tri.prim_index,
                                barycentrics: Vec2::new(u, v),
                                instance,
                            });
                        }
                    }
                    AccelKind::Instances => {
                        let inst: AccelInstance = prims.read(slot);
                        if inst.visibility_mask == 0 {
                            continue;
                        }
                        let to_object = Mat3x4f::from_rows(inst.world_to_object);
                        let info = InstanceInfo {
                            instance_id: inst.instance_id,
                            instance_index: inst.instance_index,
                            sbt_offset: inst.sbt_offset,
                        };
                        // The direction is not renormalized, so t stays comparable across levels.
                        self.walk(
                            inst.child,
                            to_object.transform_point(origin),
                            to_object.transform_vector(direction),
                            tmin,
                            depth + 1,
                            info,
                        )?;
                    }
                }
                if self.terminated {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn report(&mut self, candidate: Candidate) {
        match (self.any_hit)(&candidate) {
            AnyHitResult::Accept => {
                self.tmax = candidate.t;
                self.closest = Some(candidate);
            }
            AnyHitResult::Ignore => {}
            AnyHitResult::Terminate => {
                self.tmax = candidate.t;
                self.closest = Some(candidate);
                self.terminated = true;
            }
        }
    }
}

/// Möller–Trumbore; returns `(t, u, v)` for `t` in `[tmin, tmax)`.
fn intersect_triangle(
    origin: Vec3,
    direction: Vec3,
    tri: &AccelTriangle,
    tmin: f32,
    tmax: f32,
) -> Option<(f32, f32, f32)> {
    let v0 = Vec3::from_array(tri.v0);
    let e1 = Vec3::from_array(tri.v1) - v0;
    let e2 = Vec3::from_array(tri.v2) - v0;
    let p = direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = origin - v0;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    (t >= tmin && t < tmax).then_some((t, u, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri(v0: [f32; 3], v1: [f32; 3], v2: [f32; 3]) -> AccelTriangle {
        AccelTriangle {
            v0,
            v1,
            v2,
            ..Default::default()
        }
    }

    #[test]
    fn test_triangle_hit_and_miss() {
        let t = tri([-1.0, -1.0, 5.0], [1.0, -1.0, 5.0], [0.0, 1.0, 5.0]);
        let (dist, u, v) = intersect_triangle(Vec3::ZERO, Vec3::Z, &t, 0.0, 100.0).unwrap();
        assert!((dist - 5.0).abs() < 1e-6);
        assert!(u >= 0.0 && v >= 0.0 && u + v <= 1.0);

        assert!(intersect_triangle(Vec3::ZERO, -Vec3::Z, &t, 0.0, 100.0).is_none());
        assert!(intersect_triangle(Vec3::new(5.0, 0.0, 0.0), Vec3::Z, &t, 0.0, 100.0).is_none());
        assert!(intersect_triangle(Vec3::ZERO, Vec3::Z, &t, 0.0, 4.0).is_none());
    }

    #[test]
    fn test_parallel_ray_misses() {
        let t = tri([-1.0, -1.0, 5.0], [1.0, -1.0, 5.0], [0.0, 1.0, 5.0]);
        assert!(intersect_triangle(Vec3::ZERO, Vec3::X, &t, 0.0, 100.0).is_none());
    }

    #[test]
    fn test_null_handle_is_miss() {
        let ray = TraceRay {
            origin: Vec3::ZERO,
            direction: Vec3::Z,
            tmin: 0.0,
            tmax: 1.0,
        };
        let hit = unsafe { trace_closest(TraversableHandle::NULL, &ray, 2, &mut |_: &Candidate| AnyHitResult::Accept) };
        assert_eq!(hit, Ok(None));
    }
}
