//! Entity name index: `name` spawnargs and the keys referring to them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::entity::{KEY_NAME, is_reference_key};
use super::node::{Node, NodeData, NodeId};

struct Reference {
    node: Weak<Node>,
    node_id: NodeId,
    key: String,
}

/// Weak index over the entities of one map. Rebuilt through connect/disconnect.
#[derive(Default)]
pub struct Namespace {
    names: RwLock<HashMap<String, Weak<Node>>>,
    references: RwLock<HashMap<String, Vec<Reference>>>,
}

fn entity_keys(node: &Node) -> Vec<(String, String)> {
    match &*node.data() {
        NodeData::Entity(entity) => entity
            .key_values()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

fn is_name_key(key: &str) -> bool {
    key.eq_ignore_ascii_case(KEY_NAME)
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes the name and references of one entity node.
    pub fn connect_node(&self, node: &Arc<Node>) {
        for (key, value) in entity_keys(node) {
            if is_name_key(&key) {
                self.insert_name(&value, node);
            } else if is_reference_key(&key) {
                self.insert_reference(&value, node, &key);
            }
        }
    }

    pub fn disconnect_node(&self, node: &Node) {
        let id = node.id();
        self.names
            .write()
            .retain(|_, n| n.upgrade().is_some_and(|n| n.id() != id));
        let mut references = self.references.write();
        for refs in references.values_mut() {
            refs.retain(|r| r.node_id != id);
        }
        references.retain(|_, refs| !refs.is_empty());
    }

    /// Indexes every entity below `root` (inclusive).
    pub fn connect(&self, root: &Arc<Node>) {
        if root.is_entity() {
            self.connect_node(root);
        }
        root.traverse_children(&mut |node| {
            if node.is_entity() {
                self.connect_node(node);
            }
            true
        });
    }

    pub fn disconnect(&self, root: &Arc<Node>) {
        if root.is_entity() {
            self.disconnect_node(root);
        }
        root.traverse_children(&mut |node| {
            if node.is_entity() {
                self.disconnect_node(node);
            }
            true
        });
    }

    fn insert_name(&self, name: &str, node: &Arc<Node>) {
        let mut names = self.names.write();
        if let Some(existing) = names.get(name).and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&existing, node) {
                tracing::warn!("[namespace] Name {} is already in use", name);
            }
            return;
        }
        names.insert(name.to_string(), Arc::downgrade(node));
    }

    fn insert_reference(&self, name: &str, node: &Arc<Node>, key: &str) {
        self.references.write().entry(name.to_string()).or_default().push(Reference {
            node: Arc::downgrade(node),
            node_id: node.id(),
            key: key.to_string(),
        });
    }

    fn remove_reference(&self, name: &str, node: &Node, key: &str) {
        let mut references = self.references.write();
        if let Some(refs) = references.get_mut(name) {
            refs.retain(|r| !(r.node_id == node.id() && r.key == key));
            if refs.is_empty() {
                references.remove(name);
            }
        }
    }

    pub fn name_exists(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn find(&self, name: &str) -> Option<Arc<Node>> {
        self.names.read().get(name).and_then(Weak::upgrade)
    }

    /// Entity nodes holding a key that refers to `name`.
    pub fn referrers(&self, name: &str) -> Vec<(Arc<Node>, String)> {
        self.references
            .read()
            .get(name)
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| r.node.upgrade().map(|n| (n, r.key.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keeps the index current when a spawnarg of a connected entity changes.
    pub fn on_key_changed(&self, node: &Arc<Node>, key: &str, old: Option<&str>, new: &str) {
        if is_name_key(key) {
            if let Some(old) = old {
                let mut names = self.names.write();
                if names.get(old).and_then(Weak::upgrade).is_some_and(|n| Arc::ptr_eq(&n, node)) {
                    names.remove(old);
                }
            }
            if !new.is_empty() {
                self.insert_name(new, node);
            }
        } else if is_reference_key(key) {
            if let Some(old) = old {
                self.remove_reference(old, node, key);
            }
            if !new.is_empty() {
                self.insert_reference(new, node, key);
            }
        }
    }

    /// Renames an entity and rewrites every key referring to it.
    pub fn rename(&self, old: &str, new: &str) -> bool {
        let Some(node) = self.find(old) else {
            tracing::warn!("[namespace] Cannot rename {}: name not found", old);
            return false;
        };
        if self.name_exists(new) {
            tracing::warn!("[namespace] Cannot rename {} to {}: name already in use", old, new);
            return false;
        }

        // Index updates happen through on_key_changed.
        let referrers = self.referrers(old);
        node.set_key_value(KEY_NAME, new);
        for (referrer, key) in referrers {
            referrer.set_key_value(&key, new);
        }
        true
    }

    /// Renames names in `imported` that collide with this namespace to `name_NN`,
    /// rewriting declarations and references inside the imported subtree only.
    pub fn ensure_no_conflicts(&self, imported: &Arc<Node>) {
        let mut entities = Vec::new();
        if imported.is_entity() {
            entities.push(imported.clone());
        }
        entities.extend(imported.descendants().into_iter().filter(|n| n.is_entity()));

        let mut taken: HashSet<String> = HashSet::new();
        for entity in &entities {
            if let Some(name) = entity.key_value(KEY_NAME) {
                taken.insert(name);
            }
        }

        let mut renames: HashMap<String, String> = HashMap::new();
        for entity in &entities {
            let Some(name) = entity.key_value(KEY_NAME) else {
                continue;
            };
            if renames.contains_key(&name) || !self.name_exists(&name) {
                continue;
            }
            let fresh = (1u32..)
                .map(|i| format!("{name}_{i:02}"))
                .find(|candidate| !taken.contains(candidate) && !self.name_exists(candidate))
                .unwrap_or_else(|| format!("{name}_copy"));
            taken.insert(fresh.clone());
            tracing::debug!("[namespace] Renaming imported entity {} to {}", name, fresh);
            renames.insert(name, fresh);
        }

        if renames.is_empty() {
            return;
        }

        for entity in &entities {
            for (key, value) in entity_keys(entity) {
                if !(is_name_key(&key) || is_reference_key(&key)) {
                    continue;
                }
                if let Some(fresh) = renames.get(&value) {
                    entity.set_key_value(&key, fresh);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eclass::EntityClass;
    use crate::scene::{Entity, RootNode};

    fn setup_entity(name: &str, target: Option<&str>) -> Arc<Node> {
        let node = Node::new(NodeData::Entity(Entity::new(Arc::new(EntityClass::fabricate(
            "func_static",
            true,
        )))));
        node.set_key_value("name", name);
        if let Some(target) = target {
            node.set_key_value("target", target);
        }
        node
    }

    #[test]
    fn test_connected_names_resolve() {
        let root = RootNode::new();
        let door = setup_entity("door", None);
        root.add_child_node(door.clone());
        root.add_child_node(setup_entity("trigger", Some("door")));

        let namespace = root.namespace();
        assert!(Arc::ptr_eq(&namespace.find("door").unwrap(), &door));
        assert_eq!(namespace.referrers("door").len(), 1);

        door.set_key_value("name", "gate");
        assert!(!namespace.name_exists("door"));
        assert!(namespace.name_exists("gate"));
    }

    #[test]
    fn test_rename_rewrites_references() {
        let root = RootNode::new();
        root.add_child_node(setup_entity("door", None));
        let trigger = setup_entity("trigger", Some("door"));
        root.add_child_node(trigger.clone());

        assert!(root.namespace().rename("door", "gate"));
        assert_eq!(trigger.key_value("target").as_deref(), Some("gate"));
        assert!(!root.namespace().rename("door", "x"));
        assert!(!root.namespace().rename("gate", "trigger"));
    }

    #[test]
    fn test_ensure_no_conflicts_only_touches_import() {
        let root = RootNode::new();
        let existing = setup_entity("door", None);
        let existing_trigger = setup_entity("trigger", Some("door"));
        root.add_child_node(existing.clone());
        root.add_child_node(existing_trigger.clone());

        let imported = Node::new(NodeData::Root);
        let imported_door = setup_entity("door", None);
        let imported_trigger = setup_entity("button", Some("door"));
        imported.add_child_node(imported_door.clone());
        imported.add_child_node(imported_trigger.clone());

        root.namespace().ensure_no_conflicts(&imported);

        assert_eq!(imported_door.key_value("name").as_deref(), Some("door_01"));
        assert_eq!(imported_trigger.key_value("target").as_deref(), Some("door_01"));
        assert_eq!(imported_trigger.key_value("name").as_deref(), Some("button"));
        assert_eq!(existing.key_value("name").as_deref(), Some("door"));
        assert_eq!(existing_trigger.key_value("target").as_deref(), Some("door"));
    }
}
