//! Named visibility layers of one map.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::node::Node;
use super::root::RootNode;
use crate::signal::Signal;

pub const DEFAULT_LAYER: i32 = 0;
pub const DEFAULT_LAYER_NAME: &str = "Default";

struct LayerState {
    names: BTreeMap<i32, String>,
    hidden: BTreeSet<i32>,
    active: i32,
}

impl Default for LayerState {
    fn default() -> Self {
        Self {
            names: BTreeMap::from([(DEFAULT_LAYER, DEFAULT_LAYER_NAME.to_string())]),
            hidden: BTreeSet::new(),
            active: DEFAULT_LAYER,
        }
    }
}

pub struct LayerManager {
    root: Weak<RootNode>,
    state: RwLock<LayerState>,
    layers_changed: Signal<()>,
    layer_visibility_changed: Signal<()>,
    membership_changed: Signal<()>,
}

impl LayerManager {
    pub(crate) fn new(root: Weak<RootNode>) -> Self {
        Self {
            root,
            state: RwLock::new(LayerState::default()),
            layers_changed: Signal::new(),
            layer_visibility_changed: Signal::new(),
            membership_changed: Signal::new(),
        }
    }

    /// Creates a layer with the smallest free id. `None` if the name is taken.
    pub fn create_layer(&self, name: &str) -> Option<i32> {
        let id = {
            let mut state = self.state.write();
            if state.names.values().any(|n| n == name) {
                tracing::warn!("[layers] Could not create layer {}: name already exists", name);
                return None;
            }
            let id = (0..).find(|id| !state.names.contains_key(id)).unwrap_or(DEFAULT_LAYER);
            state.names.insert(id, name.to_string());
            id
        };
        self.layers_changed.emit(&());
        Some(id)
    }

    /// Creates a layer with a fixed id (used when loading map info files).
    pub fn create_layer_with_id(&self, name: &str, id: i32) -> Option<i32> {
        {
            let mut state = self.state.write();
            if state.names.contains_key(&id) {
                tracing::warn!("[layers] Could not create layer {}: id {} already exists", name, id);
                return None;
            }
            if state.names.values().any(|n| n == name) {
                tracing::warn!("[layers] Could not create layer {}: name already exists", name);
                return None;
            }
            state.names.insert(id, name.to_string());
        }
        self.layers_changed.emit(&());
        Some(id)
    }

    /// Deletes a layer; its members fall back to the default layer when left without one.
    pub fn delete_layer(&self, id: i32) -> bool {
        if id == DEFAULT_LAYER {
            tracing::warn!("[layers] Cannot delete the default layer");
            return false;
        }
        {
            let mut state = self.state.write();
            if state.names.remove(&id).is_none() {
                tracing::warn!("[layers] Cannot find layer {}", id);
                return false;
            }
            state.hidden.remove(&id);
            if state.active == id {
                state.active = DEFAULT_LAYER;
            }
        }

        for node in self.scene_nodes() {
            node.remove_from_layer(id);
        }
        self.update_scene_visibility();
        self.layers_changed.emit(&());
        true
    }

    pub fn rename_layer(&self, id: i32, new_name: &str) -> bool {
        {
            let mut state = self.state.write();
            if new_name.is_empty() || state.names.iter().any(|(i, n)| n == new_name && *i != id) {
                tracing::warn!("[layers] Cannot rename layer {} to {}", id, new_name);
                return false;
            }
            let Some(name) = state.names.get_mut(&id) else {
                tracing::warn!("[layers] Cannot find layer {}", id);
                return false;
            };
            *name = new_name.to_string();
        }
        self.layers_changed.emit(&());
        true
    }

    pub fn get_layer_id(&self, name: &str) -> Option<i32> {
        self.state
            .read()
            .names
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
    }

    pub fn get_layer_name(&self, id: i32) -> Option<String> {
        self.state.read().names.get(&id).cloned()
    }

    pub fn layer_exists(&self, id: i32) -> bool {
        self.state.read().names.contains_key(&id)
    }

    pub fn layer_count(&self) -> usize {
        self.state.read().names.len()
    }

    /// Visits layers in ascending id order.
    pub fn foreach_layer(&self, mut visitor: impl FnMut(i32, &str)) {
        let names = self.state.read().names.clone();
        for (id, name) in &names {
            visitor(*id, name);
        }
    }

    /// Layer that nodes entering the scene without any layer join.
    pub fn active_layer(&self) -> i32 {
        self.state.read().active
    }

    pub fn set_active_layer(&self, id: i32) -> bool {
        let mut state = self.state.write();
        if !state.names.contains_key(&id) {
            tracing::warn!("[layers] Cannot find layer {}", id);
            return false;
        }
        state.active = id;
        true
    }

    pub fn layer_is_visible(&self, id: i32) -> bool {
        let state = self.state.read();
        state.names.contains_key(&id) && !state.hidden.contains(&id)
    }

    /// Whether any layer of `layers` is visible.
    pub fn is_any_visible(&self, layers: &BTreeSet<i32>) -> bool {
        let state = self.state.read();
        layers.iter().any(|id| !state.hidden.contains(id))
    }

    pub fn set_layer_visibility(&self, id: i32, visible: bool) {
        {
            let mut state = self.state.write();
            if !state.names.contains_key(&id) {
                tracing::warn!("[layers] Cannot find layer {}", id);
                return;
            }
            if visible {
                state.hidden.remove(&id);
            } else {
                state.hidden.insert(id);
            }
        }
        self.update_scene_visibility();
        self.layer_visibility_changed.emit(&());
    }

    /// Recomputes the filter state of every scene node. An entity stays visible
    /// while any of its children is visible.
    pub fn update_scene_visibility(&self) {
        let Some(root) = self.root.upgrade() else {
            return;
        };
        for child in root.node().children() {
            self.update_node_visibility(&child);
        }
    }

    fn update_node_visibility(&self, node: &Arc<Node>) -> bool {
        let mut visible = self.is_any_visible(&node.layers());
        for child in node.children() {
            visible |= self.update_node_visibility(&child);
        }
        node.set_filtered(!visible);
        visible
    }

    // ------------------------------------------------------------------------
    // Selection-based membership
    // ------------------------------------------------------------------------

    pub fn add_selection_to_layer(&self, id: i32) {
        self.apply_to_selection(id, |node| node.add_to_layer(id));
    }

    /// Makes `id` the only layer of every selected node.
    pub fn move_selection_to_layer(&self, id: i32) {
        self.apply_to_selection(id, |node| node.move_to_layer(id));
    }

    pub fn remove_selection_from_layer(&self, id: i32) {
        self.apply_to_selection(id, |node| node.remove_from_layer(id));
    }

    fn apply_to_selection(&self, id: i32, apply: impl Fn(&Node)) {
        if !self.layer_exists(id) {
            tracing::warn!("[layers] Cannot find layer {}", id);
            return;
        }
        let Some(root) = self.root.upgrade() else {
            return;
        };
        for node in root.selection().selected_nodes() {
            apply(&node);
            for child in node.descendants() {
                apply(&child);
            }
        }
        self.update_scene_visibility();
        self.membership_changed.emit(&());
    }

    /// Back to a single visible default layer.
    pub fn reset(&self) {
        *self.state.write() = LayerState::default();
        self.layers_changed.emit(&());
    }

    pub fn signal_layers_changed(&self) -> &Signal<()> {
        &self.layers_changed
    }

    pub fn signal_layer_visibility_changed(&self) -> &Signal<()> {
        &self.layer_visibility_changed
    }

    pub fn signal_membership_changed(&self) -> &Signal<()> {
        &self.membership_changed
    }

    fn scene_nodes(&self) -> Vec<Arc<Node>> {
        self.root.upgrade().map(|root| root.node().descendants()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vector3;
    use crate::scene::{Brush, NodeData};

    fn setup_brush(root: &RootNode) -> Arc<Node> {
        let brush = Node::new(NodeData::Brush(Brush::cuboid(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(8.0, 8.0, 8.0),
            "textures/a",
        )));
        root.add_child_node(brush.clone());
        brush
    }

    #[test]
    fn test_create_uses_smallest_free_id() {
        let root = RootNode::new();
        let layers = root.layers();
        assert_eq!(layers.create_layer("one"), Some(1));
        assert_eq!(layers.create_layer("two"), Some(2));
        assert_eq!(layers.create_layer("one"), None);
        assert!(layers.delete_layer(1));
        assert_eq!(layers.create_layer("three"), Some(1));
        assert_eq!(layers.get_layer_id("two"), Some(2));
        assert_eq!(layers.get_layer_name(0).as_deref(), Some(DEFAULT_LAYER_NAME));
        assert!(!layers.delete_layer(DEFAULT_LAYER));
    }

    #[test]
    fn test_hide_and_show_layer() {
        let root = RootNode::new();
        let layers = root.layers();
        layers.create_layer("one");
        layers.create_layer("two");
        let brush = setup_brush(&root);
        let other = setup_brush(&root);

        root.selection().set_selected(&brush, true);
        layers.move_selection_to_layer(2);
        assert_eq!(brush.layers(), BTreeSet::from([2]));

        layers.set_layer_visibility(2, false);
        assert!(brush.is_filtered());
        assert!(other.is_visible());

        layers.set_layer_visibility(2, true);
        assert!(brush.is_visible());
    }

    #[test]
    fn test_delete_layer_falls_back_to_default() {
        let root = RootNode::new();
        let layers = root.layers();
        let id = layers.create_layer("temp").unwrap();
        layers.set_active_layer(id);
        let brush = setup_brush(&root);
        assert_eq!(brush.layers(), BTreeSet::from([id]));

        assert!(layers.delete_layer(id));
        assert_eq!(brush.layers(), BTreeSet::from([DEFAULT_LAYER]));
        assert_eq!(layers.active_layer(), DEFAULT_LAYER);
    }

    #[test]
    fn test_parent_visible_through_child() {
        let root = RootNode::new();
        let layers = root.layers();
        let id = layers.create_layer("hidden").unwrap();

        let entity = Node::new(NodeData::Entity(crate::scene::Entity::new(Arc::new(
            crate::eclass::EntityClass::fabricate("func_static", true),
        ))));
        let brush = Node::new(NodeData::Brush(Brush::default()));
        entity.add_child_node(brush.clone());
        root.add_child_node(entity.clone());
        entity.move_to_layer(id);

        layers.set_layer_visibility(id, false);
        assert!(entity.is_visible());
        assert!(brush.is_visible());

        brush.move_to_layer(id);
        layers.update_scene_visibility();
        assert!(entity.is_filtered());
    }
}
