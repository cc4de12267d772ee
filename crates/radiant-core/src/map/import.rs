use std::sync::Arc;

use super::format::ImportFilter;
use crate::scene::{Node, RootNode};

/// Collects parsed entities below a scene root. Worldspawn is kept first.
pub struct MapImportFilter {
    root: Arc<RootNode>,
}

impl MapImportFilter {
    pub fn new(root: Arc<RootNode>) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Arc<RootNode> {
        &self.root
    }
}

impl ImportFilter for MapImportFilter {
    fn add_entity(&self, entity: Arc<Node>) -> bool {
        if entity.is_worldspawn() {
            if self.root.find_worldspawn().is_some() {
                tracing::warn!("[mapimport] Map contains more than one worldspawn");
            }
            self.root.node().insert_child_first(entity);
        } else {
            self.root.add_child_node(entity);
        }
        true
    }

    fn add_primitive_to_entity(&self, primitive: Arc<Node>, entity: &Arc<Node>) -> bool {
        if !entity.is_container() {
            let classname = entity.key_value(crate::scene::KEY_CLASSNAME).unwrap_or_default();
            tracing::warn!("[mapimport] Entity {} cannot hold primitives, discarding one", classname);
            return false;
        }
        entity.add_child_node(primitive);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eclass::EntityClass;
    use crate::math::Vector3;
    use crate::scene::{Brush, Entity, NodeData};

    fn setup_entity(classname: &str, has_brushes: bool) -> Arc<Node> {
        Node::new(NodeData::Entity(Entity::new(Arc::new(EntityClass::fabricate(
            classname,
            has_brushes,
        )))))
    }

    fn setup_brush() -> Arc<Node> {
        Node::new(NodeData::Brush(Brush::cuboid(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(8.0, 8.0, 8.0),
            "textures/a",
        )))
    }

    #[test]
    fn test_worldspawn_goes_first() {
        let filter = MapImportFilter::new(RootNode::new());
        filter.add_entity(setup_entity("light", false));
        let world = setup_entity("worldspawn", true);
        filter.add_entity(world.clone());

        let children = filter.root().node().children();
        assert!(Arc::ptr_eq(&children[0], &world));
        assert_eq!(filter.root().entity_count(), 2);
    }

    #[test]
    fn test_point_entity_rejects_primitives() {
        let filter = MapImportFilter::new(RootNode::new());
        let light = setup_entity("light", false);
        assert!(!filter.add_primitive_to_entity(setup_brush(), &light));
        assert_eq!(light.child_count(), 0);

        let func = setup_entity("func_static", true);
        assert!(filter.add_primitive_to_entity(setup_brush(), &func));
        assert_eq!(func.child_count(), 1);
    }
}
