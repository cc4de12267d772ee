//! Selection groups: numbered node sets that are selected together.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::node::{Node, NodeId};
use super::root::RootNode;
use crate::selection::SelectionMode;

pub struct SelectionGroup {
    id: usize,
    name: RwLock<String>,
    nodes: RwLock<Vec<(NodeId, Weak<Node>)>>,
}

impl SelectionGroup {
    fn new(id: usize) -> Self {
        Self {
            id,
            name: RwLock::new(String::new()),
            nodes: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    pub fn add_node(&self, node: &Arc<Node>) {
        let mut nodes = self.nodes.write();
        if nodes.iter().any(|(id, _)| *id == node.id()) {
            return;
        }
        node.add_to_group(self.id);
        nodes.push((node.id(), Arc::downgrade(node)));
    }

    pub fn remove_node(&self, node: &Node) {
        node.remove_from_group(self.id);
        self.nodes.write().retain(|(id, _)| *id != node.id());
    }

    /// Live members in joining order.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().iter().filter_map(|(_, n)| n.upgrade()).collect()
    }

    pub fn size(&self) -> usize {
        self.nodes().len()
    }

    /// Lists `node` as a member without touching its own membership list.
    fn remember(&self, node: &Arc<Node>) {
        let mut nodes = self.nodes.write();
        if !nodes.iter().any(|(id, _)| *id == node.id()) {
            nodes.push((node.id(), Arc::downgrade(node)));
        }
    }

    fn forget(&self, node: NodeId) -> bool {
        let mut nodes = self.nodes.write();
        nodes.retain(|(id, n)| *id != node && n.strong_count() > 0);
        nodes.is_empty()
    }

    fn detach_all(&self) {
        for node in self.nodes() {
            node.remove_from_group(self.id);
        }
        self.nodes.write().clear();
    }
}

pub struct SelectionGroupManager {
    root: Weak<RootNode>,
    groups: RwLock<BTreeMap<usize, Arc<SelectionGroup>>>,
}

impl SelectionGroupManager {
    pub(crate) fn new(root: Weak<RootNode>) -> Self {
        Self {
            root,
            groups: RwLock::new(BTreeMap::new()),
        }
    }

    /// New empty group with the smallest unused id (ids start at 1).
    pub fn create_selection_group(&self) -> Arc<SelectionGroup> {
        let mut groups = self.groups.write();
        let id = (1..).find(|id| !groups.contains_key(id)).unwrap_or(1);
        let group = Arc::new(SelectionGroup::new(id));
        groups.insert(id, group.clone());
        group
    }

    /// Group with a fixed id; an existing group with that id is replaced.
    pub fn create_selection_group_with_id(&self, id: usize) -> Arc<SelectionGroup> {
        if self.groups.read().contains_key(&id) {
            tracing::warn!("[groups] Replacing existing selection group {}", id);
            self.delete_selection_group(id);
        }
        let group = Arc::new(SelectionGroup::new(id));
        self.groups.write().insert(id, group.clone());
        group
    }

    /// Removes the group and drops the id from every member's membership list.
    pub fn delete_selection_group(&self, id: usize) -> bool {
        let Some(group) = self.groups.write().remove(&id) else {
            return false;
        };
        group.detach_all();
        true
    }

    pub fn delete_all_selection_groups(&self) {
        let groups = std::mem::take(&mut *self.groups.write());
        for group in groups.values() {
            group.detach_all();
        }
    }

    pub fn find_selection_group(&self, id: usize) -> Option<Arc<SelectionGroup>> {
        self.groups.read().get(&id).cloned()
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    pub fn foreach_selection_group(&self, mut visitor: impl FnMut(&Arc<SelectionGroup>)) {
        let groups: Vec<_> = self.groups.read().values().cloned().collect();
        for group in &groups {
            visitor(group);
        }
    }

    /// Updates the member lists after undo replaced the group ids of `node`.
    /// Groups left without members are dropped, missing ones are recreated.
    pub(crate) fn sync_node_membership(&self, node: &Arc<Node>, previous: &[usize]) {
        let current = node.groups();
        for id in previous.iter().filter(|id| !current.contains(id)) {
            let Some(group) = self.find_selection_group(*id) else {
                continue;
            };
            if group.forget(node.id()) {
                self.groups.write().remove(id);
            }
        }
        for id in current.iter().filter(|id| !previous.contains(id)) {
            let group = self
                .groups
                .write()
                .entry(*id)
                .or_insert_with(|| Arc::new(SelectionGroup::new(*id)))
                .clone();
            group.remember(node);
        }
    }

    /// Selects or deselects every member of the group.
    pub fn set_group_selected(&self, id: usize, selected: bool) {
        let Some(group) = self.find_selection_group(id) else {
            tracing::warn!("[groups] Cannot find selection group {}", id);
            return;
        };
        let Some(root) = self.root.upgrade() else {
            return;
        };
        for node in group.nodes() {
            root.selection().set_selected(&node, selected);
        }
    }

    /// Forms a new group from the current selection.
    pub fn group_selected(&self) -> bool {
        let Some(root) = self.root.upgrade() else {
            return false;
        };
        let selection = root.selection();
        if selection.mode() != SelectionMode::Primitive {
            tracing::warn!("[groups] Groups can be formed in Primitive selection mode only");
            return false;
        }

        let selected = selection.selected_nodes();
        if selected.len() < 2 {
            tracing::warn!("[groups] Cannot group anything, select more than one element");
            return false;
        }

        let first = selected[0].most_recent_group();
        if first.is_some() && selected.iter().all(|n| n.most_recent_group() == first) {
            tracing::warn!("[groups] The selected elements already form a group");
            return false;
        }

        let group = self.create_selection_group();
        for node in &selected {
            group.add_node(node);
        }
        tracing::info!("[groups] Created group {} with {} members", group.id(), group.size());
        true
    }

    /// Dissolves every group a selected node most recently joined.
    pub fn ungroup_selected(&self) -> bool {
        let Some(root) = self.root.upgrade() else {
            return false;
        };
        if root.selection().mode() != SelectionMode::Primitive {
            tracing::warn!("[groups] Groups can be dissolved in Primitive selection mode only");
            return false;
        }

        let mut ids: Vec<usize> = root
            .selection()
            .selected_nodes()
            .iter()
            .filter_map(|n| n.most_recent_group())
            .collect();
        ids.sort_unstable();
        ids.dedup();

        if ids.is_empty() {
            tracing::warn!("[groups] The selection is not part of any group");
            return false;
        }
        for id in ids {
            self.delete_selection_group(id);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vector3;
    use crate::scene::{Brush, NodeData};
    use crate::undo::UndoableCommand;

    fn setup_brushes(root: &RootNode, count: usize) -> Vec<Arc<Node>> {
        (0..count)
            .map(|i| {
                let offset = f64::from(u32::try_from(i).unwrap()) * 32.0;
                let brush = Node::new(NodeData::Brush(Brush::cuboid(
                    Vector3::new(offset, 0.0, 0.0),
                    Vector3::new(offset + 16.0, 16.0, 16.0),
                    "textures/a",
                )));
                root.add_child_node(brush.clone());
                brush
            })
            .collect()
    }

    #[test]
    fn test_group_selected_rules() {
        let root = RootNode::new();
        let brushes = setup_brushes(&root, 3);
        let groups = root.groups();

        root.selection().set_selected(&brushes[0], true);
        assert!(!groups.group_selected());

        root.selection().set_selected(&brushes[1], true);
        assert!(groups.group_selected());
        assert_eq!(brushes[0].most_recent_group(), Some(1));
        assert_eq!(brushes[1].most_recent_group(), Some(1));

        // already a group
        assert!(!groups.group_selected());

        root.selection().set_selected(&brushes[2], true);
        assert!(groups.group_selected());
        assert_eq!(brushes[0].groups(), vec![1, 2]);
    }

    #[test]
    fn test_delete_group_disbands_membership() {
        let root = RootNode::new();
        let brushes = setup_brushes(&root, 2);
        let groups = root.groups();
        let group = groups.create_selection_group();
        for brush in &brushes {
            group.add_node(brush);
        }

        assert!(groups.delete_selection_group(group.id()));
        assert!(brushes.iter().all(|b| !b.groups().contains(&group.id())));
        assert!(!groups.delete_selection_group(group.id()));
        assert_eq!(groups.create_selection_group().id(), 1);
    }

    #[test]
    fn test_set_group_selected() {
        let root = RootNode::new();
        let brushes = setup_brushes(&root, 3);
        let groups = root.groups();
        let group = groups.create_selection_group_with_id(5);
        group.add_node(&brushes[0]);
        group.add_node(&brushes[2]);

        groups.set_group_selected(5, true);
        assert_eq!(root.selection().count_selected(), 2);
        assert!(!brushes[1].is_selected());

        groups.set_group_selected(5, false);
        assert_eq!(root.selection().count_selected(), 0);
    }

    #[test]
    fn test_ungroup_selected() {
        let root = RootNode::new();
        let brushes = setup_brushes(&root, 2);
        for brush in &brushes {
            root.selection().set_selected(brush, true);
        }
        assert!(root.groups().group_selected());
        assert!(root.groups().ungroup_selected());
        assert_eq!(root.groups().group_count(), 0);
        assert!(brushes.iter().all(|b| b.groups().is_empty()));
    }

    #[test]
    fn test_groups_follow_undo_and_redo() {
        let root = RootNode::new();
        let brushes = setup_brushes(&root, 2);
        for brush in &brushes {
            root.selection().set_selected(brush, true);
        }
        {
            let _command = UndoableCommand::new(root.undo(), "GroupSelected");
            assert!(root.groups().group_selected());
        }
        {
            let _command = UndoableCommand::new(root.undo(), "DeleteAllSelectionGroups");
            root.groups().delete_all_selection_groups();
        }
        assert_eq!(root.groups().group_count(), 0);

        // back to one group of two
        assert!(root.undo().undo());
        assert_eq!(root.groups().group_count(), 1);
        assert!(brushes.iter().all(|b| b.groups() == vec![1]));
        assert_eq!(root.groups().find_selection_group(1).unwrap().size(), 2);
        root.selection().set_selected_all(false);
        root.groups().set_group_selected(1, true);
        assert_eq!(root.selection().count_selected(), 2);

        // back to no groups at all
        assert!(root.undo().undo());
        assert_eq!(root.groups().group_count(), 0);
        assert!(brushes.iter().all(|b| b.groups().is_empty()));

        assert!(root.undo().redo());
        assert_eq!(root.groups().find_selection_group(1).unwrap().size(), 2);
        assert!(root.undo().redo());
        assert_eq!(root.groups().group_count(), 0);
        assert!(brushes.iter().all(|b| b.groups().is_empty()));
    }
}
