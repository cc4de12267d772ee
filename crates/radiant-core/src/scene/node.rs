//! Scene nodes: ownership, traversal, observers and per-node editor state.
//!
//! A parent owns its children through `Arc`; every other holder (selection,
//! namespace, groups, undo targets) keeps a `Weak` back reference. Topology
//! changes requested while a traversal is running are queued and applied once
//! the outermost traversal returns.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockReadGuard};

use super::brush::{Brush, Patch};
use super::entity::{Entity, KEY_ORIGIN};
use super::root::RootNode;
use crate::math::{Aabb, Vector3};

pub type NodeId = u64;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Root,
    Entity,
    Brush,
    Patch,
    Particle,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Root,
    Entity(Entity),
    Brush(Brush),
    Patch(Patch),
    Particle { name: String },
}

impl NodeData {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Root => NodeType::Root,
            Self::Entity(_) => NodeType::Entity,
            Self::Brush(_) => NodeType::Brush,
            Self::Patch(_) => NodeType::Patch,
            Self::Particle { .. } => NodeType::Particle,
        }
    }

    /// Brushes and patches.
    pub fn is_primitive(&self) -> bool {
        matches!(self, Self::Brush(_) | Self::Patch(_))
    }
}

/// Callbacks for scene membership and rendering changes. All methods default to no-ops.
pub trait NodeObserver: Send + Sync {
    fn on_insert_into_scene(&self, _node: &Node) {}

    fn on_remove_from_scene(&self, _node: &Node) {}

    fn on_bounds_changed(&self, _node: &Node) {}

    fn on_render_system_attached(&self, _node: &Node) {}

    fn on_render_system_detached(&self, _node: &Node) {}
}

/// Snapshot of everything undo restores on a node.
#[derive(Clone)]
pub struct NodeState {
    data: NodeData,
    children: Vec<Arc<Node>>,
    layers: BTreeSet<i32>,
    groups: Vec<usize>,
}

impl PartialEq for NodeState {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
            && self.layers == other.layers
            && self.groups == other.groups
            && self.children.len() == other.children.len()
            && self.children.iter().zip(&other.children).all(|(a, b)| Arc::ptr_eq(a, b))
    }
}

impl fmt::Debug for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeState")
            .field("data", &self.data)
            .field("children", &self.children.iter().map(|c| c.id()).collect::<Vec<_>>())
            .field("layers", &self.layers)
            .field("groups", &self.groups)
            .finish()
    }
}

// ============================================================================
// Deferred topology changes
// ============================================================================

thread_local! {
    static TRAVERSAL_DEPTH: Cell<usize> = const { Cell::new(0) };
    static DEFERRED: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
}

struct TraversalGuard;

impl TraversalGuard {
    fn enter() -> Self {
        TRAVERSAL_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for TraversalGuard {
    fn drop(&mut self) {
        let depth = TRAVERSAL_DEPTH.with(|depth| {
            let value = depth.get().saturating_sub(1);
            depth.set(value);
            value
        });
        if depth == 0 {
            flush_deferred();
        }
    }
}

fn is_traversing() -> bool {
    TRAVERSAL_DEPTH.with(Cell::get) > 0
}

fn flush_deferred() {
    while let Some(change) = DEFERRED.with(|queue| queue.borrow_mut().pop_front()) {
        change();
    }
}

fn defer(change: impl FnOnce() + 'static) {
    DEFERRED.with(|queue| queue.borrow_mut().push_back(Box::new(change)));
}

// ============================================================================
// Node
// ============================================================================

pub struct Node {
    id: NodeId,
    self_weak: Weak<Node>,
    data: RwLock<NodeData>,
    parent: RwLock<Weak<Node>>,
    children: RwLock<Vec<Arc<Node>>>,
    scene: RwLock<Weak<RootNode>>,
    observers: RwLock<Vec<Arc<dyn NodeObserver>>>,
    layers: RwLock<BTreeSet<i32>>,
    groups: RwLock<Vec<usize>>,
    selected: AtomicBool,
    filtered: AtomicBool,
    render_attached: AtomicBool,
}

impl Node {
    pub fn new(data: NodeData) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            self_weak: self_weak.clone(),
            data: RwLock::new(data),
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(Vec::new()),
            scene: RwLock::new(Weak::new()),
            observers: RwLock::new(Vec::new()),
            layers: RwLock::new(BTreeSet::new()),
            groups: RwLock::new(Vec::new()),
            selected: AtomicBool::new(false),
            filtered: AtomicBool::new(false),
            render_attached: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn data(&self) -> RwLockReadGuard<'_, NodeData> {
        self.data.read()
    }

    pub fn node_type(&self) -> NodeType {
        self.data.read().node_type()
    }

    pub fn is_primitive(&self) -> bool {
        self.data.read().is_primitive()
    }

    pub fn is_entity(&self) -> bool {
        self.node_type() == NodeType::Entity
    }

    pub fn is_worldspawn(&self) -> bool {
        matches!(&*self.data.read(), NodeData::Entity(e) if e.is_worldspawn())
    }

    /// Entities whose class holds brushes, and the root.
    pub fn is_container(&self) -> bool {
        match &*self.data.read() {
            NodeData::Root => true,
            NodeData::Entity(entity) => entity.is_container(),
            _ => false,
        }
    }

    fn arc(&self) -> Option<Arc<Node>> {
        self.self_weak.upgrade()
    }

    pub(crate) fn weak_self(&self) -> Weak<Node> {
        self.self_weak.clone()
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.read().upgrade()
    }

    pub fn children(&self) -> Vec<Arc<Node>> {
        self.children.read().clone()
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    pub fn has_children(&self) -> bool {
        !self.children.read().is_empty()
    }

    /// The map root this node is currently inserted into.
    pub fn scene(&self) -> Option<Arc<RootNode>> {
        self.scene.read().upgrade()
    }

    pub fn in_scene(&self) -> bool {
        self.scene().is_some()
    }

    /// `self` is `node` or one of its ancestors.
    pub fn is_ancestor_of(&self, node: &Node) -> bool {
        let mut current = node.arc();
        while let Some(n) = current {
            if n.id == self.id {
                return true;
            }
            current = n.parent();
        }
        false
    }

    // ------------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------------

    /// Appends `child`, detaching it from its previous parent first.
    pub fn add_child_node(&self, child: Arc<Node>) {
        self.request_insert(child, false);
    }

    /// Inserts `child` at index 0 (used to keep worldspawn first).
    pub fn insert_child_first(&self, child: Arc<Node>) {
        self.request_insert(child, true);
    }

    pub fn remove_child_node(&self, child: &Arc<Node>) {
        let Some(parent) = self.arc() else {
            return;
        };
        if is_traversing() {
            let child = child.clone();
            defer(move || {
                parent.remove_child_now(&child);
            });
        } else {
            parent.remove_child_now(child);
        }
    }

    fn request_insert(&self, child: Arc<Node>, first: bool) {
        let Some(parent) = self.arc() else {
            return;
        };
        if is_traversing() {
            defer(move || parent.insert_child_now(child, first));
        } else {
            parent.insert_child_now(child, first);
        }
    }

    fn insert_child_now(self: &Arc<Self>, child: Arc<Node>, first: bool) {
        if child.is_ancestor_of(self) {
            tracing::warn!("[scene] Refusing to insert node {} below itself", child.id);
            return;
        }

        if let Some(old_parent) = child.parent() {
            if Arc::ptr_eq(&old_parent, self) {
                if !first {
                    return;
                }
                // Reordering within the same parent keeps scene membership.
                self.undo_save();
                let mut children = self.children.write();
                children.retain(|c| !Arc::ptr_eq(c, &child));
                children.insert(0, child);
                return;
            }
            old_parent.remove_child_now(&child);
        }

        self.undo_save();
        {
            let mut children = self.children.write();
            if first {
                children.insert(0, child.clone());
            } else {
                children.push(child.clone());
            }
        }
        *child.parent.write() = Arc::downgrade(self);

        if let Some(root) = self.scene() {
            child.connect_to_scene(&root);
        }
    }

    fn remove_child_now(&self, child: &Arc<Node>) -> bool {
        let present = self.children.read().iter().any(|c| Arc::ptr_eq(c, child));
        if !present {
            return false;
        }

        self.undo_save();
        self.children.write().retain(|c| !Arc::ptr_eq(c, child));
        *child.parent.write() = Weak::new();

        if let Some(root) = child.scene() {
            child.disconnect_from_scene(&root);
        }
        true
    }

    /// Depth-first pre-order walk over the descendants. The visitor returns
    /// whether to descend into the visited node's children.
    pub fn traverse_children(&self, visitor: &mut dyn FnMut(&Arc<Node>) -> bool) {
        let _guard = TraversalGuard::enter();
        self.walk(visitor);
    }

    fn walk(&self, visitor: &mut dyn FnMut(&Arc<Node>) -> bool) {
        for child in self.children() {
            if visitor(&child) {
                child.walk(visitor);
            }
        }
    }

    /// All descendants in traversal order.
    pub fn descendants(&self) -> Vec<Arc<Node>> {
        let mut nodes = Vec::new();
        self.traverse_children(&mut |node| {
            nodes.push(node.clone());
            true
        });
        nodes
    }

    // ------------------------------------------------------------------------
    // Scene membership
    // ------------------------------------------------------------------------

    pub(crate) fn set_scene_root(&self, root: &Weak<RootNode>) {
        *self.scene.write() = root.clone();
    }

    pub(crate) fn connect_to_scene(self: &Arc<Self>, root: &Arc<RootNode>) {
        *self.scene.write() = Arc::downgrade(root);

        if self.layers.read().is_empty() {
            self.layers.write().insert(root.layers().active_layer());
        }
        let hidden = !root.layers().is_any_visible(&self.layers.read());
        self.filtered.store(hidden, Ordering::Relaxed);

        if self.is_entity() {
            root.namespace().connect_node(self);
        }
        if let Some(renderer) = root.render_system() {
            self.attach_render_system(renderer.as_ref());
        }
        for observer in self.observers.read().clone() {
            observer.on_insert_into_scene(self);
        }

        for child in self.children() {
            child.connect_to_scene(root);
        }
    }

    pub(crate) fn disconnect_from_scene(&self, root: &Arc<RootNode>) {
        for child in self.children() {
            child.disconnect_from_scene(root);
        }

        if self.is_entity() {
            root.namespace().disconnect_node(self);
        }
        root.selection().on_node_removed(self);
        if let Some(renderer) = root.render_system() {
            self.detach_render_system(renderer.as_ref());
        }
        for observer in self.observers.read().clone() {
            observer.on_remove_from_scene(self);
        }
        *self.scene.write() = Weak::new();
    }

    pub(crate) fn attach_render_system(&self, renderer: &dyn RenderSystem) {
        if !self.render_attached.swap(true, Ordering::Relaxed) {
            renderer.attach_node(self);
            for observer in self.observers.read().clone() {
                observer.on_render_system_attached(self);
            }
        }
    }

    pub(crate) fn detach_render_system(&self, renderer: &dyn RenderSystem) {
        if self.render_attached.swap(false, Ordering::Relaxed) {
            renderer.detach_node(self);
            for observer in self.observers.read().clone() {
                observer.on_render_system_detached(self);
            }
        }
    }

    pub fn is_render_attached(&self) -> bool {
        self.render_attached.load(Ordering::Relaxed)
    }

    pub fn add_observer(&self, observer: Arc<dyn NodeObserver>) {
        self.observers.write().push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn NodeObserver>) {
        self.observers.write().retain(|o| !Arc::ptr_eq(o, observer));
    }

    fn notify_bounds_changed(&self) {
        for observer in self.observers.read().clone() {
            observer.on_bounds_changed(self);
        }
        if let Some(parent) = self.parent() {
            parent.notify_bounds_changed();
        }
    }

    // ------------------------------------------------------------------------
    // Entity key values
    // ------------------------------------------------------------------------

    pub fn key_value(&self, key: &str) -> Option<String> {
        match &*self.data.read() {
            NodeData::Entity(entity) => entity.key_value(key).map(str::to_string),
            _ => None,
        }
    }

    /// Sets a spawnarg on an entity node. Returns false for non-entities.
    pub fn set_key_value(&self, key: &str, value: &str) -> bool {
        if !self.is_entity() {
            return false;
        }
        self.undo_save();

        let old = {
            let mut data = self.data.write();
            let NodeData::Entity(entity) = &mut *data else {
                return false;
            };
            entity.set_key_value(key, value)
        };

        if old.as_deref() != Some(value) {
            if let (Some(root), Some(node)) = (self.scene(), self.arc()) {
                root.namespace().on_key_changed(&node, key, old.as_deref(), value);
            }
        }
        if key.eq_ignore_ascii_case(KEY_ORIGIN) {
            self.notify_bounds_changed();
        }
        true
    }

    // ------------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------------

    pub fn bounds(&self) -> Option<Aabb> {
        let own = match &*self.data.read() {
            NodeData::Brush(brush) => return brush.bounds(),
            NodeData::Patch(patch) => return patch.bounds(),
            NodeData::Particle { .. } | NodeData::Root => None,
            NodeData::Entity(entity) if !self.has_children() => {
                let origin = entity.origin().unwrap_or(Vector3::ZERO);
                let (min, max) = entity.class().bounds().unwrap_or((Vector3::ZERO, Vector3::ZERO));
                Some(Aabb {
                    min: origin + min,
                    max: origin + max,
                })
            }
            NodeData::Entity(_) => None,
        };

        self.children()
            .iter()
            .filter_map(|c| c.bounds())
            .fold(own, |acc, b| match acc {
                Some(mut acc) => {
                    acc.include(&b);
                    Some(acc)
                }
                None => Some(b),
            })
    }

    /// Moves primitives by `offset`. Entities move their children and, when
    /// they carry one or have a fixed size, their origin.
    pub fn translate(&self, offset: Vector3, texture_lock: bool) {
        if self.is_entity() {
            for child in self.children() {
                child.translate(offset, texture_lock);
            }
            let origin = {
                let data = self.data.read();
                let NodeData::Entity(entity) = &*data else {
                    return;
                };
                match entity.origin() {
                    Some(origin) => Some(origin),
                    None if entity.class().is_fixed_size() => Some(Vector3::ZERO),
                    None => None,
                }
            };
            if let Some(origin) = origin {
                self.set_key_value(KEY_ORIGIN, &(origin + offset).to_string());
            }
            return;
        }

        self.undo_save();
        match &mut *self.data.write() {
            NodeData::Brush(brush) => brush.translate(offset, texture_lock),
            NodeData::Patch(patch) => patch.translate(offset),
            _ => return,
        }
        self.notify_bounds_changed();
    }

    /// Replaces the node's data wholesale (used by the map reader and tools).
    pub fn set_data(&self, data: NodeData) {
        self.undo_save();
        *self.data.write() = data;
        self.notify_bounds_changed();
    }

    /// Mutates brush data in place; false for other node types.
    pub fn edit_brush(&self, edit: impl FnOnce(&mut Brush)) -> bool {
        if self.node_type() != NodeType::Brush {
            return false;
        }
        self.undo_save();
        if let NodeData::Brush(brush) = &mut *self.data.write() {
            edit(brush);
        }
        self.notify_bounds_changed();
        true
    }

    // ------------------------------------------------------------------------
    // Layers
    // ------------------------------------------------------------------------

    pub fn layers(&self) -> BTreeSet<i32> {
        self.layers.read().clone()
    }

    pub fn add_to_layer(&self, layer: i32) {
        if self.layers.read().contains(&layer) {
            return;
        }
        self.undo_save();
        self.layers.write().insert(layer);
    }

    /// Leaves `layer`; a node left without layers falls back to the default layer.
    pub fn remove_from_layer(&self, layer: i32) {
        if !self.layers.read().contains(&layer) {
            return;
        }
        self.undo_save();
        let mut layers = self.layers.write();
        layers.remove(&layer);
        if layers.is_empty() {
            layers.insert(super::layers::DEFAULT_LAYER);
        }
    }

    /// Makes `layer` the only layer of this node.
    pub fn move_to_layer(&self, layer: i32) {
        if self.layers.read().len() == 1 && self.layers.read().contains(&layer) {
            return;
        }
        self.undo_save();
        let mut layers = self.layers.write();
        layers.clear();
        layers.insert(layer);
    }

    pub(crate) fn assign_layers(&self, layers: BTreeSet<i32>) {
        self.undo_save();
        *self.layers.write() = layers;
    }

    /// Hidden by layer filtering.
    pub fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::Relaxed)
    }

    pub fn is_visible(&self) -> bool {
        !self.is_filtered()
    }

    pub(crate) fn set_filtered(&self, filtered: bool) {
        self.filtered.store(filtered, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------
    // Selection groups
    // ------------------------------------------------------------------------

    /// Group ids in joining order.
    pub fn groups(&self) -> Vec<usize> {
        self.groups.read().clone()
    }

    pub fn most_recent_group(&self) -> Option<usize> {
        self.groups.read().last().copied()
    }

    pub(crate) fn add_to_group(&self, id: usize) {
        if self.groups.read().contains(&id) {
            return;
        }
        self.undo_save();
        self.groups.write().push(id);
    }

    pub(crate) fn remove_from_group(&self, id: usize) {
        if !self.groups.read().contains(&id) {
            return;
        }
        self.undo_save();
        self.groups.write().retain(|g| *g != id);
    }

    // ------------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------------

    pub fn is_selected(&self) -> bool {
        self.selected.load(Ordering::Relaxed)
    }

    pub(crate) fn set_selected_flag(&self, selected: bool) {
        self.selected.store(selected, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------
    // Undo
    // ------------------------------------------------------------------------

    fn undo_save(&self) {
        if let Some(root) = self.scene() {
            root.undo().save_node(self);
        }
    }

    pub(crate) fn capture_state(&self) -> NodeState {
        NodeState {
            data: self.data.read().clone(),
            children: self.children(),
            layers: self.layers(),
            groups: self.groups(),
        }
    }

    /// Applies a snapshot, connecting or disconnecting children as the child list changes.
    pub(crate) fn restore_state(self: &Arc<Self>, state: NodeState) {
        let old_children = std::mem::replace(&mut *self.children.write(), state.children.clone());
        *self.data.write() = state.data;
        *self.layers.write() = state.layers;
        let old_groups = std::mem::replace(&mut *self.groups.write(), state.groups);

        let root = self.scene();
        for child in &old_children {
            if !state.children.iter().any(|c| Arc::ptr_eq(c, child)) {
                *child.parent.write() = Weak::new();
                if let Some(root) = &root {
                    child.disconnect_from_scene(root);
                }
            }
        }
        for child in &state.children {
            if !old_children.iter().any(|c| Arc::ptr_eq(c, child)) {
                *child.parent.write() = Arc::downgrade(self);
                if let Some(root) = &root {
                    child.connect_to_scene(root);
                }
            }
        }

        if let Some(root) = &root {
            if self.is_entity() {
                root.namespace().disconnect_node(self);
                root.namespace().connect_node(self);
            }
            self.set_filtered(!root.layers().is_any_visible(&self.layers.read()));
            if *self.groups.read() != old_groups {
                root.groups().sync_node_membership(self, &old_groups);
            }
        }
        self.notify_bounds_changed();
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("type", &self.node_type())
            .field("children", &self.child_count())
            .finish_non_exhaustive()
    }
}

/// Receives nodes entering and leaving a rendered scene.
pub trait RenderSystem: Send + Sync {
    fn attach_node(&self, node: &Node);

    fn detach_node(&self, node: &Node);
}
