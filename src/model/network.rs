//! Track network arena.
//!
//! Nodes, edges and track segments live in id-keyed maps owned by
//! [`Network`]; entities refer to each other by id only. A node couples at
//! most two segments; edge succession is resolved per lookup through the
//! node's segments so it always reflects the current switch states.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, warn};

use crate::store::{EntityKind, Store};

use super::block_point::BlockPoint;
use super::position::Position;
use super::types::{
    BlockDirection, BlockPointId, EdgeId, ModelConfig, ModelError, NodeId, ScopeId, SegmentId,
    SwitchBranch,
};

/// A coupling point between at most two track segments.
pub struct Node {
    pub id: NodeId,
    slots: Mutex<[Option<SegmentId>; 2]>,
}

impl Node {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            slots: Mutex::new([None, None]),
        }
    }

    /// Both coupling slots, in binding order.
    pub fn bound_segments(&self) -> [Option<SegmentId>; 2] {
        *self.slots.lock().unwrap()
    }

    /// A node is bound once both slots are taken; only then do edges
    /// continue across it.
    pub fn is_bound(&self) -> bool {
        let slots = self.slots.lock().unwrap();
        slots[0].is_some() && slots[1].is_some()
    }

    pub fn is_free(&self) -> bool {
        let slots = self.slots.lock().unwrap();
        slots[0].is_none() && slots[1].is_none()
    }

    fn bind(&self, segment: SegmentId) -> Result<(), ModelError> {
        let mut slots = self.slots.lock().unwrap();
        if slots[0].is_none() {
            slots[0] = Some(segment);
            Ok(())
        } else if slots[1].is_none() {
            slots[1] = Some(segment);
            Ok(())
        } else {
            Err(ModelError::NodeAlreadyBound(self.id))
        }
    }

    fn release(&self, segment: SegmentId) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if *slot == Some(segment) {
                *slot = None;
            }
        }
    }
}

/// A directed piece of track between two nodes.
///
/// The stored orientation runs from `first_node` to `second_node`; trains
/// traverse edges in either direction regardless.
pub struct Edge {
    pub id: EdgeId,
    pub length: f64,
    /// Speed limit in real (prototype) meters per second
    pub max_speed: f64,
    pub first_node: NodeId,
    pub second_node: NodeId,
    pub segment: SegmentId,
    block_points: Mutex<Vec<BlockPoint>>,
    occupants: Mutex<HashSet<ScopeId>>,
}

impl Edge {
    pub fn block_points(&self) -> Vec<BlockPoint> {
        self.block_points.lock().unwrap().clone()
    }

    fn install_block_point(&self, block_point: BlockPoint) {
        self.block_points.lock().unwrap().push(block_point);
    }

    fn remove_block_point(&self, id: BlockPointId) -> bool {
        let mut points = self.block_points.lock().unwrap();
        let before = points.len();
        points.retain(|p| p.id != id);
        points.len() != before
    }

    pub(crate) fn enter(&self, scope: ScopeId) {
        self.occupants.lock().unwrap().insert(scope);
    }

    pub(crate) fn leave(&self, scope: ScopeId) {
        self.occupants.lock().unwrap().remove(&scope);
    }

    pub fn is_occupied(&self) -> bool {
        !self.occupants.lock().unwrap().is_empty()
    }

    pub fn occupants(&self) -> HashSet<ScopeId> {
        self.occupants.lock().unwrap().clone()
    }
}

/// The three segment shapes a layout is built from.
pub enum SegmentKind {
    /// Plain track, one edge
    Track { edge: EdgeId },
    /// Two alternative edges sharing their first node; the inactive branch
    /// carries a seal block point at its far end
    Switch {
        left: EdgeId,
        right: EdgeId,
        state: Mutex<SwitchBranch>,
        seal_left: BlockPoint,
        seal_right: BlockPoint,
    },
    /// Dead end: a stub edge towards an internal helper node, permanently
    /// sealed at its far end
    Bumper {
        edge: EdgeId,
        helper_node: NodeId,
    },
}

pub struct Segment {
    pub id: SegmentId,
    pub kind: SegmentKind,
}

impl Segment {
    /// The edge a train entering this segment continues onto.
    pub fn current_edge(&self) -> EdgeId {
        match &self.kind {
            SegmentKind::Track { edge } => *edge,
            SegmentKind::Switch {
                left, right, state, ..
            } => match *state.lock().unwrap() {
                SwitchBranch::Left => *left,
                SwitchBranch::Right => *right,
            },
            SegmentKind::Bumper { edge, .. } => *edge,
        }
    }

    pub fn edges(&self) -> Vec<EdgeId> {
        match &self.kind {
            SegmentKind::Track { edge } => vec![*edge],
            SegmentKind::Switch { left, right, .. } => vec![*left, *right],
            SegmentKind::Bumper { edge, .. } => vec![*edge],
        }
    }

    pub fn branch(&self) -> Option<SwitchBranch> {
        match &self.kind {
            SegmentKind::Switch { state, .. } => Some(*state.lock().unwrap()),
            _ => None,
        }
    }
}

/// The track network arena. All topology queries and mutations go through
/// here.
pub struct Network {
    config: ModelConfig,
    store: Arc<dyn Store>,
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,
    edges: RwLock<HashMap<EdgeId, Arc<Edge>>>,
    segments: RwLock<HashMap<SegmentId, Arc<Segment>>>,
    next_id: AtomicUsize,
}

impl Network {
    /// An opened store may still hold entities from an earlier run; id
    /// allocation resumes past all of them so fresh entities never
    /// collide with persisted ones.
    pub fn new(config: ModelConfig, store: Arc<dyn Store>) -> Self {
        let mut next_id = 0;
        for kind in [
            EntityKind::Node,
            EntityKind::Edge,
            EntityKind::Segment,
            EntityKind::BlockPoint,
        ] {
            let live = store.enumerate(kind);
            if let Some(highest) = live.last() {
                next_id = next_id.max(highest + 1);
                debug!("store holds {} live {:?} entries", live.len(), kind);
            }
        }
        Self {
            config,
            store,
            nodes: RwLock::new(HashMap::new()),
            edges: RwLock::new(HashMap::new()),
            segments: RwLock::new(HashMap::new()),
            next_id: AtomicUsize::new(next_id),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn allocate_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn node(&self, id: NodeId) -> Result<Arc<Node>, ModelError> {
        self.nodes
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(ModelError::UnknownNode(id))
    }

    pub fn edge(&self, id: EdgeId) -> Result<Arc<Edge>, ModelError> {
        self.edges
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(ModelError::UnknownEdge(id))
    }

    pub fn segment(&self, id: SegmentId) -> Result<Arc<Segment>, ModelError> {
        self.segments
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(ModelError::UnknownSegment(id))
    }

    pub fn add_node(&self) -> NodeId {
        let id = NodeId(self.allocate_id());
        let node = Arc::new(Node::new(id));
        self.nodes.write().unwrap().insert(id, node);
        self.store.notify_created(EntityKind::Node, id.0);
        id
    }

    /// Removes an unbound node. Nodes still coupled to a segment stay.
    pub fn remove_node(&self, id: NodeId) -> Result<(), ModelError> {
        let node = self.node(id)?;
        if !node.is_free() {
            return Err(ModelError::NodeInUse(id));
        }
        self.nodes.write().unwrap().remove(&id);
        self.store.notify_deleted(EntityKind::Node, id.0);
        Ok(())
    }

    fn insert_edge(
        &self,
        first: NodeId,
        second: NodeId,
        length: f64,
        max_speed: f64,
        segment: SegmentId,
    ) -> Arc<Edge> {
        let id = EdgeId(self.allocate_id());
        let edge = Arc::new(Edge {
            id,
            length,
            max_speed,
            first_node: first,
            second_node: second,
            segment,
            block_points: Mutex::new(Vec::new()),
            occupants: Mutex::new(HashSet::new()),
        });
        self.edges.write().unwrap().insert(id, edge.clone());
        self.store.notify_created(EntityKind::Edge, id.0);
        edge
    }

    fn drop_edge(&self, id: EdgeId) {
        if let Some(edge) = self.edges.write().unwrap().remove(&id) {
            for point in edge.block_points() {
                self.store.notify_deleted(EntityKind::BlockPoint, point.id.0);
            }
            self.store.notify_deleted(EntityKind::Edge, id.0);
        }
    }

    fn register_segment(&self, segment: Segment) -> SegmentId {
        let id = segment.id;
        self.segments.write().unwrap().insert(id, Arc::new(segment));
        self.store.notify_created(EntityKind::Segment, id.0);
        id
    }

    /// Adds a plain track between two nodes.
    pub fn add_track(
        &self,
        first: NodeId,
        second: NodeId,
        length: f64,
        max_speed: f64,
    ) -> Result<SegmentId, ModelError> {
        let first_node = self.node(first)?;
        let second_node = self.node(second)?;
        let segment_id = SegmentId(self.allocate_id());
        let edge = self.insert_edge(first, second, length, max_speed, segment_id);

        first_node.bind(segment_id).map_err(|err| {
            self.drop_edge(edge.id);
            err
        })?;
        second_node.bind(segment_id).map_err(|err| {
            first_node.release(segment_id);
            self.drop_edge(edge.id);
            err
        })?;

        debug!(
            "added track {:?} between {:?} and {:?}",
            segment_id, first, second
        );
        Ok(self.register_segment(Segment {
            id: segment_id,
            kind: SegmentKind::Track { edge: edge.id },
        }))
    }

    /// Adds a two-way switch. Both branch edges run from `first` towards
    /// their respective far node; the left branch starts active.
    #[allow(clippy::too_many_arguments)]
    pub fn add_switch(
        &self,
        first: NodeId,
        left_node: NodeId,
        right_node: NodeId,
        length_left: f64,
        length_right: f64,
        max_speed_left: f64,
        max_speed_right: f64,
    ) -> Result<SegmentId, ModelError> {
        let first_handle = self.node(first)?;
        let left_handle = self.node(left_node)?;
        let right_handle = self.node(right_node)?;
        let segment_id = SegmentId(self.allocate_id());
        let left = self.insert_edge(first, left_node, length_left, max_speed_left, segment_id);
        let right = self.insert_edge(first, right_node, length_right, max_speed_right, segment_id);

        // Seal positions are created before the far nodes couple, so the
        // overflow handling clamps them just inside the branch ends. The
        // seals block entry from the far node only; a train already on
        // the inactive branch may still drive off towards it.
        let seal_left = BlockPoint::new(
            BlockPointId(self.allocate_id()),
            BlockDirection::Negative,
            Position::new(self, left.id, length_left)?,
        );
        let seal_right = BlockPoint::new(
            BlockPointId(self.allocate_id()),
            BlockDirection::Negative,
            Position::new(self, right.id, length_right)?,
        );

        let bound = first_handle
            .bind(segment_id)
            .and_then(|_| left_handle.bind(segment_id))
            .and_then(|_| right_handle.bind(segment_id));
        if let Err(err) = bound {
            first_handle.release(segment_id);
            left_handle.release(segment_id);
            right_handle.release(segment_id);
            self.drop_edge(left.id);
            self.drop_edge(right.id);
            return Err(err);
        }

        // Left branch starts active, so only the right branch is sealed.
        self.install_block_point(&seal_right)?;

        debug!(
            "added switch {:?} at {:?} towards {:?} / {:?}",
            segment_id, first, left_node, right_node
        );
        Ok(self.register_segment(Segment {
            id: segment_id,
            kind: SegmentKind::Switch {
                left: left.id,
                right: right.id,
                state: Mutex::new(SwitchBranch::Left),
                seal_left,
                seal_right,
            },
        }))
    }

    /// Adds a dead-end bumper hanging off `node`.
    pub fn add_bumper(
        &self,
        node: NodeId,
        length: f64,
        max_speed: f64,
    ) -> Result<SegmentId, ModelError> {
        let outer = self.node(node)?;
        let helper_id = self.add_node();
        let segment_id = SegmentId(self.allocate_id());
        let edge = self.insert_edge(node, helper_id, length, max_speed, segment_id);

        let stop = BlockPoint::new(
            BlockPointId(self.allocate_id()),
            BlockDirection::All,
            Position::new(self, edge.id, length)?,
        );

        outer.bind(segment_id).map_err(|err| {
            self.drop_edge(edge.id);
            let _ = self.remove_node(helper_id);
            err
        })?;
        self.install_block_point(&stop)?;

        debug!("added bumper {:?} at {:?}", segment_id, node);
        Ok(self.register_segment(Segment {
            id: segment_id,
            kind: SegmentKind::Bumper {
                edge: edge.id,
                helper_node: helper_id,
            },
        }))
    }

    /// Removes a segment whose edges are not occupied by any train scope.
    pub fn remove_segment(&self, id: SegmentId) -> Result<(), ModelError> {
        let segment = self.segment(id)?;
        for edge_id in segment.edges() {
            if self.edge(edge_id)?.is_occupied() {
                return Err(ModelError::SegmentOccupied(id));
            }
        }
        for edge_id in segment.edges() {
            let edge = self.edge(edge_id)?;
            self.node(edge.first_node)?.release(id);
            self.node(edge.second_node)?.release(id);
            self.drop_edge(edge_id);
        }
        if let SegmentKind::Bumper { helper_node, .. } = segment.kind {
            let _ = self.remove_node(helper_node);
        }
        self.segments.write().unwrap().remove(&id);
        self.store.notify_deleted(EntityKind::Segment, id.0);
        debug!("removed segment {:?}", id);
        Ok(())
    }

    /// Whether a switch may be thrown right now: true iff its active branch
    /// is not occupied by any train scope. The inactive branch is sealed and
    /// therefore never occupied.
    pub fn switch_possible(&self, id: SegmentId) -> Result<bool, ModelError> {
        let segment = self.segment(id)?;
        match &segment.kind {
            SegmentKind::Switch { .. } => {
                let active = self.edge(segment.current_edge())?;
                Ok(!active.is_occupied())
            }
            _ => Err(ModelError::NotASwitch(id)),
        }
    }

    /// Throws a switch to its other branch, moving the seal from the newly
    /// active branch onto the newly inactive one.
    pub fn switch_track(&self, id: SegmentId) -> Result<SwitchBranch, ModelError> {
        if !self.switch_possible(id)? {
            return Err(ModelError::SwitchBusy(id));
        }
        let segment = self.segment(id)?;
        let branch = self.flip_switch(&segment)?;
        debug!("switch {:?} thrown to {:?}", id, branch);
        Ok(branch)
    }

    /// Adopts a switch state reported by the command station. Feedback is
    /// authoritative, so the flip happens even when the model would have
    /// rejected it; an occupied active branch is logged as a fault.
    pub fn set_switch(&self, id: SegmentId, branch: SwitchBranch) -> Result<(), ModelError> {
        let segment = self.segment(id)?;
        match &segment.kind {
            SegmentKind::Switch { state, .. } => {
                if *state.lock().unwrap() == branch {
                    return Ok(());
                }
            }
            _ => return Err(ModelError::NotASwitch(id)),
        }
        if !self.switch_possible(id)? {
            warn!(
                "switch {:?} reported as {:?} while its active branch is occupied",
                id, branch
            );
        }
        self.flip_switch(&segment)?;
        Ok(())
    }

    fn flip_switch(&self, segment: &Segment) -> Result<SwitchBranch, ModelError> {
        match &segment.kind {
            SegmentKind::Switch {
                state,
                seal_left,
                seal_right,
                ..
            } => {
                let mut state = state.lock().unwrap();
                let (old_seal, new_seal) = match *state {
                    SwitchBranch::Left => (seal_left, seal_right),
                    SwitchBranch::Right => (seal_right, seal_left),
                };
                self.install_block_point(old_seal)?;
                self.remove_block_point(new_seal)?;
                *state = state.other();
                Ok(*state)
            }
            _ => Err(ModelError::NotASwitch(segment.id)),
        }
    }

    pub fn switch_state(&self, id: SegmentId) -> Result<SwitchBranch, ModelError> {
        self.segment(id)?.branch().ok_or(ModelError::NotASwitch(id))
    }

    /// Creates and installs a new block point at `position`.
    pub fn create_block_point(
        &self,
        blocked: BlockDirection,
        position: Position,
    ) -> Result<BlockPoint, ModelError> {
        let point = BlockPoint::new(BlockPointId(self.allocate_id()), blocked, position);
        self.install_block_point(&point)?;
        Ok(point)
    }

    fn install_block_point(&self, point: &BlockPoint) -> Result<(), ModelError> {
        let edge = self.edge(point.position.edge)?;
        edge.install_block_point(point.clone());
        self.store.notify_created(EntityKind::BlockPoint, point.id.0);
        Ok(())
    }

    pub(crate) fn remove_block_point(&self, point: &BlockPoint) -> Result<(), ModelError> {
        let edge = self.edge(point.position.edge)?;
        if edge.remove_block_point(point.id) {
            self.store.notify_deleted(EntityKind::BlockPoint, point.id.0);
        }
        Ok(())
    }

    /// The edge a positive traversal of `edge` continues onto, or `None` at
    /// an unbound node or when the neighboring switch points elsewhere.
    pub fn next_edge(&self, edge: &Edge) -> Option<Arc<Edge>> {
        self.continuation(edge, edge.second_node)
    }

    /// The edge a negative traversal of `edge` continues onto.
    pub fn previous_edge(&self, edge: &Edge) -> Option<Arc<Edge>> {
        self.continuation(edge, edge.first_node)
    }

    fn continuation(&self, edge: &Edge, via: NodeId) -> Option<Arc<Edge>> {
        let node = self.node(via).ok()?;
        let [first, second] = node.bound_segments();
        let (first, second) = (first?, second?);
        let far = if self.segment(first).ok()?.edges().contains(&edge.id) {
            second
        } else {
            first
        };
        let continuation = self.segment(far).ok()?.current_edge();
        let next = self.edge(continuation).ok()?;
        // A switch whose active branch does not touch `via` offers no
        // continuation; the walk ends here.
        if next.first_node == via || next.second_node == via {
            Some(next)
        } else {
            None
        }
    }
}
