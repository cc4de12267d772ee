//! The map root: top scene node plus the per-map managers.

use std::sync::Arc;

use parking_lot::RwLock;

use super::group::SelectionGroupManager;
use super::layers::LayerManager;
use super::namespace::Namespace;
use super::node::{Node, NodeData, RenderSystem};
use crate::selection::SelectionSystem;
use crate::undo::UndoSystem;

pub struct RootNode {
    node: Arc<Node>,
    namespace: Namespace,
    layers: LayerManager,
    groups: SelectionGroupManager,
    selection: SelectionSystem,
    undo: Arc<UndoSystem>,
    render_system: RwLock<Option<Arc<dyn RenderSystem>>>,
}

impl RootNode {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let node = Node::new(NodeData::Root);
            node.set_scene_root(weak);
            Self {
                node,
                namespace: Namespace::new(),
                layers: LayerManager::new(weak.clone()),
                groups: SelectionGroupManager::new(weak.clone()),
                selection: SelectionSystem::new(weak.clone()),
                undo: Arc::new(UndoSystem::new()),
                render_system: RwLock::new(None),
            }
        })
    }

    /// The top-level scene node; map entities are its children.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn layers(&self) -> &LayerManager {
        &self.layers
    }

    pub fn groups(&self) -> &SelectionGroupManager {
        &self.groups
    }

    pub fn selection(&self) -> &SelectionSystem {
        &self.selection
    }

    pub fn undo(&self) -> &Arc<UndoSystem> {
        &self.undo
    }

    pub fn render_system(&self) -> Option<Arc<dyn RenderSystem>> {
        self.render_system.read().clone()
    }

    /// Swaps the render system, detaching every node from the old one first.
    pub fn set_render_system(&self, renderer: Option<Arc<dyn RenderSystem>>) {
        let nodes = self.node.descendants();
        if let Some(old) = self.render_system.write().take() {
            for node in &nodes {
                node.detach_render_system(old.as_ref());
            }
        }
        if let Some(new) = &renderer {
            for node in &nodes {
                node.attach_render_system(new.as_ref());
            }
        }
        *self.render_system.write() = renderer;
    }

    pub fn add_child_node(&self, child: Arc<Node>) {
        self.node.add_child_node(child);
    }

    pub fn remove_child_node(&self, child: &Arc<Node>) {
        self.node.remove_child_node(child);
    }

    pub fn traverse_children(&self, visitor: &mut dyn FnMut(&Arc<Node>) -> bool) {
        self.node.traverse_children(visitor);
    }

    /// The worldspawn entity, if the map has one.
    pub fn find_worldspawn(&self) -> Option<Arc<Node>> {
        self.node.children().into_iter().find(|n| n.is_worldspawn())
    }

    /// Number of entities directly below the root.
    pub fn entity_count(&self) -> usize {
        self.node.children().iter().filter(|n| n.is_entity()).count()
    }

    /// Number of brushes and patches anywhere in the map.
    pub fn primitive_count(&self) -> usize {
        self.node.descendants().iter().filter(|n| n.is_primitive()).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.node.has_children()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::eclass::EntityClass;
    use crate::math::Vector3;
    use crate::scene::{Brush, Entity, NodeObserver};

    #[derive(Default)]
    struct CountingRenderer {
        attached: AtomicUsize,
        detached: AtomicUsize,
    }

    impl RenderSystem for CountingRenderer {
        fn attach_node(&self, _node: &Node) {
            self.attached.fetch_add(1, Ordering::SeqCst);
        }

        fn detach_node(&self, _node: &Node) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct SceneObserver {
        inserted: AtomicUsize,
        removed: AtomicUsize,
    }

    impl NodeObserver for SceneObserver {
        fn on_insert_into_scene(&self, _node: &Node) {
            self.inserted.fetch_add(1, Ordering::SeqCst);
        }

        fn on_remove_from_scene(&self, _node: &Node) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup_entity_with_brush() -> (Arc<Node>, Arc<Node>) {
        let entity = Node::new(NodeData::Entity(Entity::new(Arc::new(EntityClass::fabricate(
            "func_static",
            true,
        )))));
        let brush = Node::new(NodeData::Brush(Brush::cuboid(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(16.0, 16.0, 16.0),
            "textures/a",
        )));
        entity.add_child_node(brush.clone());
        (entity, brush)
    }

    #[test]
    fn test_scene_membership_propagates() {
        let root = RootNode::new();
        let (entity, brush) = setup_entity_with_brush();
        let observer = Arc::new(SceneObserver::default());
        brush.add_observer(observer.clone());

        assert!(!brush.in_scene());
        root.add_child_node(entity.clone());
        assert!(brush.in_scene());
        assert_eq!(observer.inserted.load(Ordering::SeqCst), 1);
        assert_eq!(brush.layers().into_iter().collect::<Vec<_>>(), vec![0]);

        root.remove_child_node(&entity);
        assert!(!brush.in_scene());
        assert_eq!(observer.removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_render_system_attach_detach() {
        let root = RootNode::new();
        let (entity, brush) = setup_entity_with_brush();
        root.add_child_node(entity.clone());

        let renderer = Arc::new(CountingRenderer::default());
        root.set_render_system(Some(renderer.clone()));
        assert_eq!(renderer.attached.load(Ordering::SeqCst), 2);
        assert!(brush.is_render_attached());

        root.remove_child_node(&entity);
        assert_eq!(renderer.detached.load(Ordering::SeqCst), 2);
        assert!(!brush.is_render_attached());
    }

    #[test]
    fn test_removed_node_is_destroyed_when_unreferenced() {
        let root = RootNode::new();
        let (entity, brush) = setup_entity_with_brush();
        root.add_child_node(entity.clone());
        let weak = Arc::downgrade(&brush);
        drop(brush);

        entity.remove_child_node(&entity.children()[0]);
        assert!(weak.upgrade().is_none());
    }
}
