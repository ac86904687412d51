//! Graph assembly and execution.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::field::{Field, FieldView};
use super::node::{node_key, with_points, NodeRef, NodeState};
use crate::device::Stream;
use crate::util::{CheckStatus, Error, Result};

/// Make `parent` an input of `child`.
///
/// Rejects self-loops, duplicate edges and edges that would close a cycle.
/// The child and everything downstream of it must be re-validated.
pub fn connect(parent: &NodeRef, child: &NodeRef) -> Result<()> {
    let (pk, ck) = (node_key(parent), node_key(child));
    if pk == ck {
        return Err(Error::pipeline("cannot connect a node to itself"));
    }
    if child.read().base().inputs().iter().any(|n| node_key(n) == pk) {
        return Err(Error::pipeline(format!(
            "{} is already an input of {}",
            parent.read().name(),
            child.read().name()
        )));
    }
    if reaches(child, pk) {
        return Err(Error::pipeline(format!(
            "connecting {} -> {} would create a cycle",
            parent.read().name(),
            child.read().name()
        )));
    }
    child.write().base_mut().add_input(Arc::clone(parent));
    parent.write().base_mut().add_output(child);
    invalidate_downstream(child);
    tracing::debug!(parent = parent.read().name(), child = child.read().name(), "connected");
    Ok(())
}

/// Remove the edge `parent -> child`.
pub fn disconnect(parent: &NodeRef, child: &NodeRef) -> Result<()> {
    let (pk, ck) = (node_key(parent), node_key(child));
    if !child.write().base_mut().remove_input(pk) {
        return Err(Error::pipeline(format!(
            "{} is not an input of {}",
            parent.read().name(),
            child.read().name()
        )));
    }
    parent.write().base_mut().remove_output(ck);
    invalidate_downstream(child);
    tracing::debug!(parent = parent.read().name(), child = child.read().name(), "disconnected");
    Ok(())
}

/// Whether `target` is `from` or one of its descendants.
fn reaches(from: &NodeRef, target: usize) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![Arc::clone(from)];
    while let Some(node) = stack.pop() {
        let key = node_key(&node);
        if key == target {
            return true;
        }
        if seen.insert(key) {
            stack.extend(node.read().base().outputs());
        }
    }
    false
}

/// Mark `node` and all its descendants unvalidated.
pub fn invalidate_downstream(node: &NodeRef) {
    let mut seen = HashSet::new();
    let mut stack = vec![Arc::clone(node)];
    while let Some(node) = stack.pop() {
        if seen.insert(node_key(&node)) {
            let mut guard = node.write();
            guard.base_mut().invalidate();
            stack.extend(guard.base().outputs());
        }
    }
}

/// Executor for the connected component containing a node.
///
/// The component is re-discovered on every run, so edges added after
/// construction are picked up.
pub struct Graph {
    entry: NodeRef,
    order: Vec<NodeRef>,
}

impl Graph {
    pub fn new(node: &NodeRef) -> Result<Self> {
        let mut graph = Self {
            entry: Arc::clone(node),
            order: Vec::new(),
        };
        graph.refresh()?;
        Ok(graph)
    }

    /// Nodes in topological order (inputs first).
    pub fn nodes(&self) -> &[NodeRef] {
        &self.order
    }

    fn refresh(&mut self) -> Result<()> {
        self.order = topological_order(&self.entry)?;
        Ok(())
    }

    /// Validate every node whose configuration (or an ancestor's) changed.
    pub fn validate(&mut self) -> Result<()> {
        self.refresh()?;
        let mut revalidated: HashSet<usize> = HashSet::new();
        for node in &self.order {
            let mut guard = node.write();
            let upstream_changed = guard
                .base()
                .inputs()
                .iter()
                .any(|n| revalidated.contains(&node_key(n)));
            if guard.base().state() != NodeState::Unvalidated && !upstream_changed {
                continue;
            }

            guard.base_mut().invalidate();
            guard.validate()?;
            check_required_fields(&*guard)?;
            guard.base_mut().set_state(NodeState::Validated);
            revalidated.insert(node_key(node));
            tracing::debug!(node = guard.name(), "validated");
        }
        Ok(())
    }

    /// Enqueue every node's work on `stream`, inputs first.
    pub fn schedule(&mut self, stream: &Stream) -> Result<()> {
        for node in &self.order {
            let mut guard = node.write();
            if guard.base().state() == NodeState::Unvalidated {
                return Err(Error::pipeline(format!(
                    "{} must be validated before scheduling",
                    guard.name()
                )));
            }
            guard.schedule(stream)?;
            guard.base_mut().set_state(NodeState::Scheduled);
            tracing::trace!(node = guard.name(), "scheduled");
        }
        Ok(())
    }

    /// Validate and schedule.
    pub fn run(&mut self, stream: &Stream) -> Result<()> {
        let _span = tracing::debug_span!("graph_run", nodes = self.order.len()).entered();
        self.validate()?;
        self.schedule(stream)
    }

    /// True when every node's output matches its current parameters and
    /// the external state (such as a scene) it was computed from.
    pub fn is_current(&self) -> bool {
        !self.order.is_empty()
            && self.order.iter().all(|n| {
                let guard = n.read();
                guard.base().state() == NodeState::Scheduled && !guard.needs_schedule()
            })
    }

    /// Host-visible data of `field` as seen by `node`.
    ///
    /// Runs the graph first if anything is out of date, then waits for
    /// `stream` so the returned data can be read immediately.
    pub fn field_data(&mut self, node: &NodeRef, field: Field, stream: &Stream) -> Result<FieldView> {
        self.refresh()?;
        let key = node_key(node);
        if !self.order.iter().any(|n| node_key(n) == key) {
            return Err(Error::invalid_argument(format!(
                "{} is not part of this graph",
                node.read().name()
            )));
        }
        if !self.is_current() {
            self.run(stream)?;
        }
        let view = with_points(node, |points| points.field_data(field))?;
        stream.synchronize().checked("Stream::synchronize")?;
        Ok(view)
    }
}

fn check_required_fields(node: &dyn super::Node) -> Result<()> {
    let required = node.required_fields();
    if required.is_empty() {
        return Ok(());
    }
    let input = node.base().points_input()?;
    with_points(&input, |points| {
        match required.iter().find(|f| !points.has_field(**f)) {
            Some(&field) => Err(Error::FieldNotFound {
                node: node.name(),
                field,
            }),
            None => Ok(()),
        }
    })
}

/// Kahn's algorithm over the component reachable from `entry` through
/// inputs and outputs.
fn topological_order(entry: &NodeRef) -> Result<Vec<NodeRef>> {
    let mut nodes: Vec<NodeRef> = Vec::new();
    let mut index: HashMap<usize, usize> = HashMap::new();
    let mut queue = VecDeque::from([Arc::clone(entry)]);
    while let Some(node) = queue.pop_front() {
        let key = node_key(&node);
        if index.contains_key(&key) {
            continue;
        }
        index.insert(key, nodes.len());
        {
            let guard = node.read();
            queue.extend(guard.base().inputs().iter().cloned());
            queue.extend(guard.base().outputs());
        }
        nodes.push(node);
    }

    let mut in_degree = vec![0usize; nodes.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for input in node.read().base().inputs() {
            if let Some(&p) = index.get(&node_key(input)) {
                in_degree[i] += 1;
                children[p].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_front() {
        order.push(Arc::clone(&nodes[i]));
        for &c in &children[i] {
            in_degree[c] -= 1;
            if in_degree[c] == 0 {
                ready.push_back(c);
            }
        }
    }
    if order.len() != nodes.len() {
        return Err(Error::pipeline("graph contains a cycle"));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::graph::{share, RaysFromMat3x4Node, TransformRaysNode};
    use crate::util::{DeviceConfig, Mat3x4f, Vec3};

    fn chain(device: &Device, n: usize) -> Vec<NodeRef> {
        let mut nodes: Vec<NodeRef> = vec![share(RaysFromMat3x4Node::with_device(device))];
        for _ in 1..n {
            let next: NodeRef = share(TransformRaysNode::with_device(device, Mat3x4f::IDENTITY));
            connect(nodes.last().unwrap(), &next).unwrap();
            nodes.push(next);
        }
        nodes
    }

    #[test]
    fn test_connect_rejects_cycles_and_duplicates() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let nodes = chain(&device, 3);
        assert!(connect(&nodes[0], &nodes[0]).is_err());
        assert!(connect(&nodes[0], &nodes[1]).is_err());
        let err = connect(&nodes[2], &nodes[0]).unwrap_err();
        assert!(matches!(err, Error::InvalidPipeline(_)));
    }

    #[test]
    fn test_topological_order_from_any_node() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let nodes = chain(&device, 4);
        for entry in &nodes {
            let graph = Graph::new(entry).unwrap();
            let keys: Vec<usize> = graph.nodes().iter().map(node_key).collect();
            let expected: Vec<usize> = nodes.iter().map(node_key).collect();
            assert_eq!(keys, expected);
        }
    }

    #[test]
    fn test_states_follow_validate_and_schedule() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let stream = Stream::new(&device).unwrap();
        let source = share(RaysFromMat3x4Node::with_device(&device));
        source.write().set_rays(&[Mat3x4f::IDENTITY; 4]).unwrap();
        let transform = share(TransformRaysNode::with_device(&device, Mat3x4f::IDENTITY));
        let src: NodeRef = source.clone();
        let dst: NodeRef = transform.clone();
        connect(&src, &dst).unwrap();

        let mut graph = Graph::new(&dst).unwrap();
        assert!(graph.schedule(&stream).is_err());
        graph.run(&stream).unwrap();
        assert!(graph.is_current());

        transform
            .write()
            .set_transform(Mat3x4f::from_translation(Vec3::X));
        assert_eq!(dst.read().base().state(), NodeState::Validated);
        assert!(!graph.is_current());

        disconnect(&src, &dst).unwrap();
        assert_eq!(dst.read().base().state(), NodeState::Unvalidated);
        assert!(disconnect(&src, &dst).is_err());
        assert!(graph.validate().is_err());
        stream.synchronize().unwrap();
    }
}
