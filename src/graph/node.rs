//! Node contract shared by every pipeline stage.
//!
//! A node is validated once per configuration and scheduled once per run:
//!
//! ```text
//! Unvalidated --validate()--> Validated --schedule()--> Scheduled
//!      ^                          ^                        |
//!      |                          +---- parameter change --+
//!      +---- topology / field-set change (any state)
//! ```
//!
//! Nodes are shared as [`NodeRef`] (`Arc<RwLock<dyn Node>>`); inputs are
//! strong references, outputs weak ones, so a pipeline is kept alive from
//! its leaves.

use parking_lot::RwLock;
use smallvec::SmallVec;
use std::fmt;
use std::sync::{Arc, Weak};

use super::field::{Field, FieldView};
use crate::buffer::TypedBuffer;
use crate::device::Stream;
use crate::util::{Error, Mat3x4f, Result};

/// Shared, dynamically typed node handle.
pub type NodeRef = Arc<RwLock<dyn Node>>;

/// Shared, statically typed node handle. Coerces into [`NodeRef`].
pub type Shared<N> = Arc<RwLock<N>>;

/// Wrap `node` for use in a graph.
pub fn share<N: Node>(node: N) -> Shared<N> {
    Arc::new(RwLock::new(node))
}

/// Identity of a node, stable for its lifetime.
pub(crate) fn node_key(node: &NodeRef) -> usize {
    Arc::as_ptr(node) as *const () as usize
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Configuration changed; `validate()` must run before scheduling
    Unvalidated,
    /// Validated, output not current
    Validated,
    /// Work for the current parameters has been enqueued
    Scheduled,
}

/// Bookkeeping common to all nodes.
pub struct NodeBase {
    name: &'static str,
    inputs: SmallVec<[NodeRef; 2]>,
    outputs: SmallVec<[Weak<RwLock<dyn Node>>; 2]>,
    state: NodeState,
}

impl NodeBase {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inputs: SmallVec::new(),
            outputs: SmallVec::new(),
            state: NodeState::Unvalidated,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    pub fn inputs(&self) -> &[NodeRef] {
        &self.inputs
    }

    /// Live downstream nodes.
    pub fn outputs(&self) -> Vec<NodeRef> {
        self.outputs.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn add_input(&mut self, node: NodeRef) {
        self.inputs.push(node);
    }

    pub(crate) fn remove_input(&mut self, key: usize) -> bool {
        let before = self.inputs.len();
        self.inputs.retain(|n| node_key(n) != key);
        self.inputs.len() != before
    }

    pub(crate) fn add_output(&mut self, node: &NodeRef) {
        self.outputs.retain(|w| w.strong_count() > 0);
        self.outputs.push(Arc::downgrade(node));
    }

    pub(crate) fn remove_output(&mut self, key: usize) {
        self.outputs
            .retain(|w| w.strong_count() > 0 && w.as_ptr() as *const () as usize != key);
    }

    /// Require re-validation (structural change).
    pub fn invalidate(&mut self) {
        if self.state != NodeState::Unvalidated {
            tracing::trace!(node = self.name, "invalidated");
        }
        self.state = NodeState::Unvalidated;
    }

    /// Require re-scheduling (parameter change).
    pub fn mark_stale(&mut self) {
        if self.state == NodeState::Scheduled {
            self.state = NodeState::Validated;
        }
    }

    fn single_input(&self, capability: &str, has: impl Fn(&dyn Node) -> bool) -> Result<NodeRef> {
        let mut found = self.inputs.iter().filter(|n| has(&*n.read()));
        match (found.next(), found.next()) {
            (Some(node), None) => Ok(Arc::clone(node)),
            (None, _) => Err(Error::pipeline(format!(
                "{} requires an input producing {capability}",
                self.name
            ))),
            (Some(_), Some(_)) => Err(Error::pipeline(format!(
                "{} has more than one input producing {capability}",
                self.name
            ))),
        }
    }

    /// The unique input implementing [`RaysNode`].
    pub fn rays_input(&self) -> Result<NodeRef> {
        self.single_input("rays", |n| n.as_rays().is_some())
    }

    /// The unique input implementing [`PointsNode`].
    pub fn points_input(&self) -> Result<NodeRef> {
        self.single_input("points", |n| n.as_points().is_some())
    }
}

impl fmt::Debug for NodeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeBase")
            .field("name", &self.name)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("state", &self.state)
            .finish()
    }
}

/// A pipeline stage.
pub trait Node: Send + Sync + 'static {
    fn base(&self) -> &NodeBase;
    fn base_mut(&mut self) -> &mut NodeBase;

    /// Resolve inputs and decide which outputs this configuration produces.
    ///
    /// Called when the node or an ancestor changed structurally. Must be
    /// idempotent.
    fn validate(&mut self) -> Result<()>;

    /// Enqueue this node's work on `stream`. Inputs are already scheduled on
    /// the same stream, so their data is ready in stream order. Must not block
    /// except when growing device buffers.
    fn schedule(&mut self, stream: &Stream) -> Result<()>;

    /// Whether state outside the graph changed since the last `schedule`.
    ///
    /// Checked only for scheduled nodes; parameter setters use
    /// [`NodeBase::mark_stale`] instead.
    fn needs_schedule(&self) -> bool {
        false
    }

    /// Fields this node needs from its points input.
    fn required_fields(&self) -> &[Field] {
        &[]
    }

    fn as_rays(&self) -> Option<&dyn RaysNode> {
        None
    }

    fn as_points(&self) -> Option<&dyn PointsNode> {
        None
    }

    fn name(&self) -> &'static str {
        self.base().name()
    }
}

/// Node producing ray transforms.
pub trait RaysNode {
    /// Ray buffer, current after this node was scheduled.
    fn rays(&self) -> &TypedBuffer<Mat3x4f>;
    fn ray_count(&self) -> usize;
    /// Product of all ray transforms applied between the source and this node.
    fn cumulative_ray_transform(&self) -> Mat3x4f;
}

/// Node producing per-point fields.
pub trait PointsNode {
    fn point_count(&self) -> usize;
    /// Whether this node or one of its ancestors produces `field`.
    fn has_field(&self, field: Field) -> bool;
    /// Device data of `field`, produced here or forwarded from the input.
    ///
    /// Does not block. Data is ready in the order of the stream this node was
    /// scheduled on; [`crate::graph::Graph::field_data`] adds the host-visible
    /// synchronization.
    fn field_data(&self, field: Field) -> Result<FieldView>;
    /// Transform taking points into the sensor frame they were measured in.
    fn look_at_origin_transform(&self) -> Mat3x4f {
        Mat3x4f::IDENTITY
    }
}

/// Run `f` on `node` viewed as a [`RaysNode`].
pub fn with_rays<R>(node: &NodeRef, f: impl FnOnce(&dyn RaysNode) -> Result<R>) -> Result<R> {
    let guard = node.read();
    match guard.as_rays() {
        Some(rays) => f(rays),
        None => Err(Error::pipeline(format!("{} does not produce rays", guard.name()))),
    }
}

/// Run `f` on `node` viewed as a [`PointsNode`].
pub fn with_points<R>(node: &NodeRef, f: impl FnOnce(&dyn PointsNode) -> Result<R>) -> Result<R> {
    let guard = node.read();
    match guard.as_points() {
        Some(points) => f(points),
        None => Err(Error::pipeline(format!("{} does not produce points", guard.name()))),
    }
}

/// Resolved input of a validated node.
pub(crate) fn resolved(input: &Option<NodeRef>, node: &'static str) -> Result<NodeRef> {
    input
        .clone()
        .ok_or_else(|| Error::pipeline(format!("{node} used before validation")))
}
