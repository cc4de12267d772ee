//! Per-map selection set.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::math::Vector3;
use crate::scene::{Node, NodeId, RootNode};
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionMode {
    #[default]
    Primitive,
    GroupPart,
    Entity,
    Component,
}

pub struct SelectionSystem {
    root: Weak<RootNode>,
    selected: Mutex<IndexMap<NodeId, Weak<Node>>>,
    mode: RwLock<SelectionMode>,
    selection_changed: Signal<usize>,
}

impl SelectionSystem {
    pub(crate) fn new(root: Weak<RootNode>) -> Self {
        Self {
            root,
            selected: Mutex::new(IndexMap::new()),
            mode: RwLock::new(SelectionMode::Primitive),
            selection_changed: Signal::new(),
        }
    }

    pub fn mode(&self) -> SelectionMode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: SelectionMode) {
        *self.mode.write() = mode;
    }

    pub fn set_selected(&self, node: &Arc<Node>, selected: bool) {
        if node.node_type() == crate::scene::NodeType::Root {
            return;
        }
        let count = {
            let mut set = self.selected.lock();
            let changed = if selected {
                set.insert(node.id(), Arc::downgrade(node)).is_none()
            } else {
                set.shift_remove(&node.id()).is_some()
            };
            if !changed {
                return;
            }
            node.set_selected_flag(selected);
            set.len()
        };
        self.selection_changed.emit(&count);
    }

    /// Selected nodes in selection order.
    pub fn selected_nodes(&self) -> Vec<Arc<Node>> {
        self.selected.lock().values().filter_map(Weak::upgrade).collect()
    }

    pub fn count_selected(&self) -> usize {
        self.selected_nodes().len()
    }

    pub fn foreach_selected(&self, mut visitor: impl FnMut(&Arc<Node>)) {
        for node in self.selected_nodes() {
            visitor(&node);
        }
    }

    /// Selects every visible selectable of the map, or clears the selection.
    pub fn set_selected_all(&self, selected: bool) {
        if !selected {
            let nodes: Vec<_> = std::mem::take(&mut *self.selected.lock()).into_values().collect();
            for node in nodes.iter().filter_map(Weak::upgrade) {
                node.set_selected_flag(false);
            }
            self.selection_changed.emit(&0);
            return;
        }

        let Some(root) = self.root.upgrade() else {
            return;
        };
        let entity_mode = self.mode() == SelectionMode::Entity;
        let mut candidates = Vec::new();
        root.traverse_children(&mut |node| {
            if node.is_filtered() {
                return false;
            }
            if node.is_worldspawn() {
                return !entity_mode;
            }
            if node.is_entity() {
                if entity_mode || !node.has_children() {
                    candidates.push(node.clone());
                    return false;
                }
                return true;
            }
            if !entity_mode {
                candidates.push(node.clone());
            }
            false
        });
        for node in &candidates {
            self.set_selected(node, true);
        }
    }

    /// Moves the selection; nodes whose ancestor is selected move with it.
    pub fn translate_selected(&self, offset: Vector3, texture_lock: bool) {
        let selected = self.selected_nodes();
        for node in &selected {
            let covered = selected
                .iter()
                .any(|other| other.id() != node.id() && other.is_ancestor_of(node));
            if !covered {
                node.translate(offset, texture_lock);
            }
        }
    }

    pub(crate) fn on_node_removed(&self, node: &Node) {
        let removed = self.selected.lock().shift_remove(&node.id()).is_some();
        if removed {
            node.set_selected_flag(false);
            let count = self.selected.lock().len();
            self.selection_changed.emit(&count);
        }
    }

    pub fn signal_selection_changed(&self) -> &Signal<usize> {
        &self.selection_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eclass::EntityClass;
    use crate::scene::{Brush, Entity, NodeData};

    fn setup_scene() -> (Arc<RootNode>, Arc<Node>, Arc<Node>) {
        let root = RootNode::new();
        let world = Node::new(NodeData::Entity(Entity::new(Arc::new(EntityClass::fabricate("worldspawn", true)))));
        let brush = Node::new(NodeData::Brush(Brush::cuboid(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(16.0, 16.0, 16.0),
            "textures/a",
        )));
        world.add_child_node(brush.clone());
        let light = Node::new(NodeData::Entity(Entity::new(Arc::new(EntityClass::fabricate("light", false)))));
        root.add_child_node(world);
        root.add_child_node(light.clone());
        (root, brush, light)
    }

    #[test]
    fn test_select_all_skips_worldspawn() {
        let (root, brush, light) = setup_scene();
        let selection = root.selection();
        selection.set_selected_all(true);
        assert_eq!(selection.count_selected(), 2);
        assert!(brush.is_selected() && light.is_selected());

        selection.set_selected_all(false);
        assert_eq!(selection.count_selected(), 0);
        assert!(!brush.is_selected());
    }

    #[test]
    fn test_removal_deselects() {
        let (root, brush, _) = setup_scene();
        root.selection().set_selected(&brush, true);
        brush.parent().unwrap().remove_child_node(&brush);
        assert_eq!(root.selection().count_selected(), 0);
        assert!(!brush.is_selected());
    }

    #[test]
    fn test_translate_selected() {
        let (root, brush, light) = setup_scene();
        root.selection().set_selected(&brush, true);
        root.selection().set_selected(&light, true);
        root.selection().translate_selected(Vector3::new(8.0, 0.0, 0.0), false);
        assert!(brush.bounds().unwrap().origin().is_near(Vector3::new(16.0, 8.0, 8.0), 1e-6));
        assert_eq!(light.key_value("origin").as_deref(), Some("8 0 0"));
    }
}
