//! Moves an imported scene into the edited map.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::scene::{DEFAULT_LAYER, Node, RootNode, SelectionGroup};

/// Moves every entity of `source` below `target` and returns the nodes that
/// should be selected afterwards.
///
/// Imported names are made unique first. Layers are matched by name and
/// created when missing, selection groups get fresh ids. Primitives of an
/// imported worldspawn join the existing worldspawn.
pub fn merge_map(source: &Arc<RootNode>, target: &Arc<RootNode>) -> Vec<Arc<Node>> {
    target.namespace().ensure_no_conflicts(source.node());

    let layer_map = remap_layers(source, target);
    let group_map = remap_groups(source, target);

    for node in source.node().descendants() {
        let layers: BTreeSet<i32> = node
            .layers()
            .iter()
            .map(|id| layer_map.get(id).copied().unwrap_or(DEFAULT_LAYER))
            .collect();
        node.assign_layers(layers);

        let old_groups = node.groups();
        for id in &old_groups {
            if let Some(group) = source.groups().find_selection_group(*id) {
                group.remove_node(&node);
            }
        }
        for id in &old_groups {
            if let Some(group) = group_map.get(id) {
                group.add_node(&node);
            }
        }
    }

    let mut imported = Vec::new();
    let existing_world = target.find_worldspawn();

    for entity in source.node().children() {
        if !entity.is_worldspawn() {
            target.add_child_node(entity.clone());
            imported.push(entity);
            continue;
        }

        match &existing_world {
            Some(world) => {
                for primitive in entity.children() {
                    world.add_child_node(primitive.clone());
                    imported.push(primitive);
                }
            }
            None => {
                target.node().insert_child_first(entity.clone());
                imported.extend(entity.children());
            }
        }
    }

    target.layers().update_scene_visibility();
    tracing::debug!("[mapmerge] Merged {} nodes", imported.len());
    imported
}

fn remap_layers(source: &RootNode, target: &RootNode) -> HashMap<i32, i32> {
    let mut map = HashMap::new();
    source.layers().foreach_layer(|id, name| {
        let mapped = target
            .layers()
            .get_layer_id(name)
            .or_else(|| target.layers().create_layer(name))
            .unwrap_or(DEFAULT_LAYER);
        map.insert(id, mapped);
    });
    map
}

fn remap_groups(source: &RootNode, target: &RootNode) -> HashMap<usize, Arc<SelectionGroup>> {
    let mut map = HashMap::new();
    source.groups().foreach_selection_group(|group| {
        let created = target.groups().create_selection_group();
        created.set_name(&group.name());
        map.insert(group.id(), created);
    });
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eclass::EntityClass;
    use crate::math::Vector3;
    use crate::scene::{Brush, Entity, NodeData};

    fn setup_entity(classname: &str, has_brushes: bool, name: Option<&str>) -> Arc<Node> {
        let mut entity = Entity::new(Arc::new(EntityClass::fabricate(classname, has_brushes)));
        if let Some(name) = name {
            entity.set_key_value("name", name);
        }
        Node::new(NodeData::Entity(entity))
    }

    fn setup_brush(x: f64) -> Arc<Node> {
        Node::new(NodeData::Brush(Brush::cuboid(
            Vector3::new(x, 0.0, 0.0),
            Vector3::new(x + 8.0, 8.0, 8.0),
            "textures/a",
        )))
    }

    fn setup_root_with_world() -> (Arc<RootNode>, Arc<Node>) {
        let root = RootNode::new();
        let world = setup_entity("worldspawn", true, None);
        world.add_child_node(setup_brush(0.0));
        root.add_child_node(world.clone());
        (root, world)
    }

    #[test]
    fn test_worldspawn_primitives_join_existing_world() {
        let (target, world) = setup_root_with_world();
        target.add_child_node(setup_entity("light", false, Some("light_1")));

        let (source, _) = setup_root_with_world();
        let light = setup_entity("light", false, Some("light_1"));
        source.add_child_node(light.clone());

        let imported = merge_map(&source, &target);
        assert_eq!(imported.len(), 2);
        assert!(source.is_empty());
        assert_eq!(target.entity_count(), 3);
        assert_eq!(world.child_count(), 2);
        assert!(Arc::ptr_eq(&target.node().children()[0], &world));
        assert_eq!(light.key_value("name").as_deref(), Some("light_1_01"));
        assert!(target.namespace().name_exists("light_1_01"));
    }

    #[test]
    fn test_world_inserted_first_when_missing() {
        let target = RootNode::new();
        target.add_child_node(setup_entity("light", false, None));
        let (source, world) = setup_root_with_world();

        let imported = merge_map(&source, &target);
        assert_eq!(imported.len(), 1);
        assert!(imported[0].is_primitive());
        assert!(Arc::ptr_eq(&target.node().children()[0], &world));
    }

    #[test]
    fn test_layers_and_groups_are_remapped() {
        let (target, _) = setup_root_with_world();
        target.layers().create_layer("Lights");
        target.groups().create_selection_group();

        let source = RootNode::new();
        source.layers().create_layer("Scratch");
        let lights = source.layers().create_layer("Lights").unwrap();
        let func = setup_entity("func_static", true, None);
        let brush = setup_brush(64.0);
        func.add_child_node(brush.clone());
        source.add_child_node(func.clone());
        brush.move_to_layer(lights);
        let group = source.groups().create_selection_group();
        group.set_name("imported");
        group.add_node(&brush);

        merge_map(&source, &target);
        let target_lights = target.layers().get_layer_id("Lights").unwrap();
        assert_eq!(brush.layers(), BTreeSet::from([target_lights]));
        assert!(target.layers().get_layer_id("Scratch").is_some());

        let new_id = brush.most_recent_group().unwrap();
        assert_eq!(new_id, 2);
        let new_group = target.groups().find_selection_group(new_id).unwrap();
        assert_eq!(new_group.name(), "imported");
        assert_eq!(new_group.size(), 1);
        assert_eq!(source.groups().find_selection_group(1).unwrap().size(), 0);
    }
}
