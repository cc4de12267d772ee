//! Map format interfaces: readers feed an import filter, writers are driven by
//! a graph traversal.

use std::sync::Arc;

use parking_lot::RwLock;

use super::MapError;
use crate::parser::{DefTokeniser, ParseError};
use crate::scene::{Brush, Entity, Node, NodeData, Patch};

/// Receives entities and primitives as a reader produces them.
pub trait ImportFilter {
    /// Attaches a finished entity to the import root.
    fn add_entity(&self, entity: Arc<Node>) -> bool;

    /// Attaches a primitive to `entity`. Rejected unless the entity holds brushes.
    fn add_primitive_to_entity(&self, primitive: Arc<Node>, entity: &Arc<Node>) -> bool;
}

/// Parses one primitive block (`brushDef3 { ... }` etc.) after its keyword.
pub trait PrimitiveParser: Send + Sync {
    fn keyword(&self) -> &'static str;

    fn parse(&self, tok: &mut DefTokeniser<'_>) -> Result<NodeData, ParseError>;
}

pub trait MapReader {
    fn read_from_str(&mut self, text: &str, filter: &dyn ImportFilter) -> Result<(), MapError>;
}

/// Serialises the scene as the exporter walks it.
pub trait MapWriter {
    fn begin_write_map(&mut self, _out: &mut String) {}

    fn end_write_map(&mut self, _out: &mut String) {}

    fn begin_write_entity(&mut self, entity: &Entity, out: &mut String);

    fn end_write_entity(&mut self, entity: &Entity, out: &mut String);

    fn write_brush(&mut self, brush: &Brush, out: &mut String);

    fn write_patch(&mut self, patch: &Patch, out: &mut String);
}

pub trait MapFormat: Send + Sync {
    fn name(&self) -> &'static str;

    fn game_type(&self) -> &'static str;

    /// File extensions this format handles (lowercase, without dot).
    fn extensions(&self) -> &'static [&'static str];

    fn create_reader(&self) -> Box<dyn MapReader + '_>;

    fn create_writer(&self) -> Box<dyn MapWriter + '_>;

    /// Quick header check used when the extension alone is ambiguous.
    fn can_load(&self, text: &str) -> bool;
}

/// Chooses which nodes get written: `visitor` is called for every entity and
/// primitive that takes part, in write order.
pub type GraphTraversal = fn(&Arc<Node>, &mut dyn FnMut(&Arc<Node>));

/// Every entity and primitive below `root`.
pub fn traverse_all(root: &Arc<Node>, visitor: &mut dyn FnMut(&Arc<Node>)) {
    for entity in root.children() {
        if !entity.is_entity() {
            continue;
        }
        visitor(&entity);
        for child in entity.children() {
            if child.is_primitive() {
                visitor(&child);
            }
        }
    }
}

/// Selected entities with all their primitives, and selected primitives with
/// their owning entity. Worldspawn is always kept so primitives have a parent.
pub fn traverse_selected(root: &Arc<Node>, visitor: &mut dyn FnMut(&Arc<Node>)) {
    for entity in root.children() {
        if !entity.is_entity() {
            continue;
        }
        let primitives: Vec<Arc<Node>> = entity
            .children()
            .into_iter()
            .filter(|c| c.is_primitive() && (entity.is_selected() || c.is_selected()))
            .collect();
        if entity.is_selected() || !primitives.is_empty() || entity.is_worldspawn() {
            visitor(&entity);
            for primitive in &primitives {
                visitor(primitive);
            }
        }
    }
}

/// Runs `traversal` over `root` and feeds the result to `writer`.
pub fn export_map(root: &Arc<Node>, traversal: GraphTraversal, writer: &mut dyn MapWriter, out: &mut String) {
    let mut nodes = Vec::new();
    traversal(root, &mut |node| nodes.push(node.clone()));

    writer.begin_write_map(out);
    let mut open_entity: Option<Arc<Node>> = None;
    for node in &nodes {
        match &*node.data() {
            NodeData::Entity(entity) => {
                if let Some(previous) = open_entity.take() {
                    if let NodeData::Entity(previous) = &*previous.data() {
                        writer.end_write_entity(previous, out);
                    }
                }
                writer.begin_write_entity(entity, out);
                open_entity = Some(node.clone());
            }
            NodeData::Brush(brush) => writer.write_brush(brush, out),
            NodeData::Patch(patch) => writer.write_patch(patch, out),
            NodeData::Particle { .. } | NodeData::Root => {}
        }
    }
    if let Some(previous) = open_entity {
        if let NodeData::Entity(previous) = &*previous.data() {
            writer.end_write_entity(previous, out);
        }
    }
    writer.end_write_map(out);
}

/// Nodes in the order `traversal` writes them; info files index into this list.
pub fn collect_nodes(root: &Arc<Node>, traversal: GraphTraversal) -> Vec<Arc<Node>> {
    let mut nodes = Vec::new();
    traversal(root, &mut |node| nodes.push(node.clone()));
    nodes
}

/// Formats available to the map module, looked up by game type and extension.
#[derive(Default)]
pub struct MapFormatManager {
    formats: RwLock<Vec<Arc<dyn MapFormat>>>,
}

impl MapFormatManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_format(&self, format: Arc<dyn MapFormat>) {
        tracing::debug!("[mapformats] Registered format {} for {}", format.name(), format.game_type());
        self.formats.write().push(format);
    }

    pub fn unregister_format(&self, name: &str) {
        self.formats.write().retain(|f| f.name() != name);
    }

    pub fn get_format_by_name(&self, name: &str) -> Option<Arc<dyn MapFormat>> {
        self.formats.read().iter().find(|f| f.name() == name).cloned()
    }

    pub fn get_format_for_game_type(&self, game_type: &str, extension: &str) -> Option<Arc<dyn MapFormat>> {
        let extension = extension.trim_start_matches('.').to_ascii_lowercase();
        self.formats
            .read()
            .iter()
            .find(|f| f.game_type() == game_type && f.extensions().contains(&extension.as_str()))
            .cloned()
    }

    pub fn foreach_format(&self, mut visitor: impl FnMut(&Arc<dyn MapFormat>)) {
        let formats = self.formats.read().clone();
        for format in &formats {
            visitor(format);
        }
    }
}
