//! `.mapinfo` files: state the map grammar cannot hold (layers, selection
//! groups), stored beside the map and keyed by node write order.
//!
//! ```text
//! MapInformation Version 2
//! {
//!     Layers
//!     {
//!         Layer 0 { "Default" }
//!     }
//!     NodeToLayerMapping
//!     {
//!         Node { 0 }
//!     }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::RwLock;

use super::MapError;
use crate::parser::{DefTokeniser, MAP_DELIMITERS, ParseError};
use crate::scene::{DEFAULT_LAYER, Node, RootNode};

pub const INFO_FILE_EXTENSION: &str = "mapinfo";

const HEADER: &str = "MapInformation";
const INFO_VERSION: i64 = 2;

/// Contributes blocks to the info file and knows how to read them back.
pub trait InfoFileModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Appends this module's blocks. `nodes` is the map's write order.
    fn write_blocks(&self, root: &RootNode, nodes: &[Arc<Node>], out: &mut String);

    fn create_reader(&self) -> Box<dyn InfoBlockReader>;
}

/// Per-load parse state of one module.
pub trait InfoBlockReader {
    fn can_parse(&self, block_name: &str) -> bool;

    /// Parses the block body; the tokeniser sits right after the block name.
    fn parse_block(&mut self, block_name: &str, tok: &mut DefTokeniser<'_>) -> Result<(), MapError>;

    /// Applies what was parsed once the whole map is loaded.
    fn apply(&mut self, root: &RootNode, nodes: &[Arc<Node>]);
}

/// Skips a `{ ... }` block including nested blocks.
fn skip_block(tok: &mut DefTokeniser<'_>) -> Result<(), ParseError> {
    tok.assert_next("{")?;
    let mut depth = 1usize;
    while depth > 0 {
        match tok.require_token()?.as_str() {
            "{" => depth += 1,
            "}" => depth -= 1,
            _ => {}
        }
    }
    Ok(())
}

/// Tokens up to the closing brace, joined by spaces.
fn read_braced_text(tok: &mut DefTokeniser<'_>) -> Result<String, ParseError> {
    tok.assert_next("{")?;
    let mut parts = Vec::new();
    loop {
        let token = tok.require_token()?;
        if token == "}" {
            break;
        }
        parts.push(token);
    }
    Ok(parts.join(" "))
}

fn read_int_list(tok: &mut DefTokeniser<'_>, open: &str, close: &str) -> Result<Vec<i64>, ParseError> {
    tok.assert_next(open)?;
    let mut values = Vec::new();
    loop {
        let token = tok.require_token()?;
        if token == close {
            break;
        }
        let value = token
            .parse()
            .map_err(|_| tok.syntax_error(format!("expected integer, found '{token}'")))?;
        values.push(value);
    }
    Ok(values)
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "'"))
}

#[derive(Default)]
pub struct InfoFileManager {
    modules: RwLock<Vec<Arc<dyn InfoFileModule>>>,
}

impl InfoFileManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager with the layer and selection group modules registered.
    pub fn with_default_modules() -> Self {
        let manager = Self::new();
        manager.register_module(Arc::new(LayerInfoFileModule));
        manager.register_module(Arc::new(SelectionGroupInfoFileModule));
        manager
    }

    pub fn register_module(&self, module: Arc<dyn InfoFileModule>) {
        self.modules.write().push(module);
    }

    pub fn unregister_module(&self, name: &str) {
        self.modules.write().retain(|m| m.name() != name);
    }

    pub fn module_count(&self) -> usize {
        self.modules.read().len()
    }

    pub fn write_info_file(&self, root: &RootNode, nodes: &[Arc<Node>]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{HEADER} Version {INFO_VERSION}\n{{");
        for module in self.modules.read().iter() {
            module.write_blocks(root, nodes, &mut out);
        }
        out.push_str("}\n");
        out
    }

    /// Parses `text` and applies every module's state to `root`. Blocks no
    /// module claims are skipped.
    pub fn read_info_file(&self, text: &str, root: &RootNode, nodes: &[Arc<Node>]) -> Result<(), MapError> {
        let mut readers: Vec<Box<dyn InfoBlockReader>> =
            self.modules.read().iter().map(|m| m.create_reader()).collect();

        let mut tok = DefTokeniser::with_delimiters(text, MAP_DELIMITERS);
        let header = |e: ParseError| MapError::InfoFile(format!("bad header: {e}"));
        tok.assert_next(HEADER).map_err(header)?;
        tok.assert_next("Version").map_err(header)?;
        let version = tok.next_i64().map_err(header)?;
        if version != INFO_VERSION {
            return Err(MapError::InfoFile(format!(
                "version mismatch: required {INFO_VERSION}, found {version}"
            )));
        }

        tok.assert_next("{")?;
        loop {
            let block_name = tok.require_token()?;
            if block_name == "}" {
                break;
            }
            match readers.iter_mut().find(|r| r.can_parse(&block_name)) {
                Some(reader) => reader.parse_block(&block_name, &mut tok)?,
                None => {
                    tracing::debug!("[mapinfo] Skipping unknown block {}", block_name);
                    skip_block(&mut tok)?;
                }
            }
        }

        for reader in &mut readers {
            reader.apply(root, nodes);
        }
        Ok(())
    }
}

// ============================================================================
// Layers
// ============================================================================

const LAYERS: &str = "Layers";
const LAYER: &str = "Layer";
const NODE_TO_LAYER_MAPPING: &str = "NodeToLayerMapping";
const NODE: &str = "Node";

pub struct LayerInfoFileModule;

impl InfoFileModule for LayerInfoFileModule {
    fn name(&self) -> &'static str {
        "Map Layers"
    }

    fn write_blocks(&self, root: &RootNode, nodes: &[Arc<Node>], out: &mut String) {
        let _ = writeln!(out, "\t{LAYERS}\n\t{{");
        root.layers().foreach_layer(|id, name| {
            let _ = writeln!(out, "\t\t{LAYER} {id} {{ {} }}", quote(name));
        });
        out.push_str("\t}\n");

        let _ = writeln!(out, "\t{NODE_TO_LAYER_MAPPING}\n\t{{");
        for node in nodes {
            let ids: Vec<String> = node.layers().iter().map(i32::to_string).collect();
            let _ = writeln!(out, "\t\t{NODE} {{ {} }}", ids.join(" "));
        }
        out.push_str("\t}\n");
    }

    fn create_reader(&self) -> Box<dyn InfoBlockReader> {
        Box::<LayerBlockReader>::default()
    }
}

#[derive(Default)]
struct LayerBlockReader {
    layer_names: BTreeMap<i32, String>,
    node_layers: Vec<BTreeSet<i32>>,
}

impl InfoBlockReader for LayerBlockReader {
    fn can_parse(&self, block_name: &str) -> bool {
        block_name == LAYERS || block_name == NODE_TO_LAYER_MAPPING
    }

    fn parse_block(&mut self, block_name: &str, tok: &mut DefTokeniser<'_>) -> Result<(), MapError> {
        tok.assert_next("{")?;
        loop {
            let token = tok.require_token()?;
            if token == "}" {
                break;
            }
            if block_name == LAYERS {
                if token != LAYER {
                    return Err(tok.syntax_error(format!("expected '{LAYER}', found '{token}'")).into());
                }
                let id = tok.next_i64()?;
                let id = i32::try_from(id).map_err(|_| tok.syntax_error(format!("invalid layer id {id}")))?;
                let name = read_braced_text(tok)?;
                self.layer_names.insert(id, name);
            } else {
                if token != NODE {
                    return Err(tok.syntax_error(format!("expected '{NODE}', found '{token}'")).into());
                }
                let ids = read_int_list(tok, "{", "}")?
                    .into_iter()
                    .filter_map(|id| i32::try_from(id).ok())
                    .collect();
                self.node_layers.push(ids);
            }
        }
        Ok(())
    }

    fn apply(&mut self, root: &RootNode, nodes: &[Arc<Node>]) {
        let layers = root.layers();
        for (id, name) in &self.layer_names {
            if layers.layer_exists(*id) {
                layers.rename_layer(*id, name);
            } else {
                layers.create_layer_with_id(name, *id);
            }
        }

        if !self.node_layers.is_empty() && self.node_layers.len() != nodes.len() {
            tracing::warn!(
                "[mapinfo] Layer mapping covers {} nodes, map has {}",
                self.node_layers.len(),
                nodes.len()
            );
        }
        for (node, ids) in nodes.iter().zip(&self.node_layers) {
            let mut ids: BTreeSet<i32> = ids.iter().copied().filter(|id| layers.layer_exists(*id)).collect();
            if ids.is_empty() {
                ids.insert(DEFAULT_LAYER);
            }
            node.assign_layers(ids);
        }
        layers.update_scene_visibility();
    }
}

// ============================================================================
// Selection groups
// ============================================================================

const SELECTION_GROUPS: &str = "SelectionGroups";
const SELECTION_GROUP: &str = "SelectionGroup";
const SELECTION_GROUP_NODE_MAPPING: &str = "SelectionGroupNodeMapping";

pub struct SelectionGroupInfoFileModule;

impl InfoFileModule for SelectionGroupInfoFileModule {
    fn name(&self) -> &'static str {
        "Selection Groups"
    }

    fn write_blocks(&self, root: &RootNode, nodes: &[Arc<Node>], out: &mut String) {
        let _ = writeln!(out, "\t{SELECTION_GROUPS}\n\t{{");
        root.groups().foreach_selection_group(|group| {
            let _ = writeln!(out, "\t\t{SELECTION_GROUP} {} {{ {} }}", group.id(), quote(&group.name()));
        });
        out.push_str("\t}\n");

        let _ = writeln!(out, "\t{SELECTION_GROUP_NODE_MAPPING}\n\t{{");
        for (index, node) in nodes.iter().enumerate() {
            let groups = node.groups();
            if groups.is_empty() {
                continue;
            }
            let ids: Vec<String> = groups.iter().map(usize::to_string).collect();
            let _ = writeln!(out, "\t\t{NODE} ( {index} ) ( {} )", ids.join(" "));
        }
        out.push_str("\t}\n");
    }

    fn create_reader(&self) -> Box<dyn InfoBlockReader> {
        Box::<SelectionGroupBlockReader>::default()
    }
}

#[derive(Default)]
struct SelectionGroupBlockReader {
    group_names: BTreeMap<usize, String>,
    node_groups: Vec<(usize, Vec<usize>)>,
}

impl InfoBlockReader for SelectionGroupBlockReader {
    fn can_parse(&self, block_name: &str) -> bool {
        block_name == SELECTION_GROUPS || block_name == SELECTION_GROUP_NODE_MAPPING
    }

    fn parse_block(&mut self, block_name: &str, tok: &mut DefTokeniser<'_>) -> Result<(), MapError> {
        tok.assert_next("{")?;
        loop {
            let token = tok.require_token()?;
            if token == "}" {
                break;
            }
            if block_name == SELECTION_GROUPS {
                if token != SELECTION_GROUP {
                    return Err(tok
                        .syntax_error(format!("expected '{SELECTION_GROUP}', found '{token}'"))
                        .into());
                }
                let id = tok.next_i64()?;
                let id = usize::try_from(id).map_err(|_| tok.syntax_error(format!("invalid group id {id}")))?;
                let name = read_braced_text(tok)?;
                self.group_names.insert(id, name);
            } else {
                if token != NODE {
                    return Err(tok.syntax_error(format!("expected '{NODE}', found '{token}'")).into());
                }
                let index = read_int_list(tok, "(", ")")?;
                let &[index] = index.as_slice() else {
                    return Err(tok.syntax_error("expected a single node index").into());
                };
                let index =
                    usize::try_from(index).map_err(|_| tok.syntax_error(format!("invalid node index {index}")))?;
                let ids = read_int_list(tok, "(", ")")?
                    .into_iter()
                    .filter_map(|id| usize::try_from(id).ok())
                    .collect();
                self.node_groups.push((index, ids));
            }
        }
        Ok(())
    }

    fn apply(&mut self, root: &RootNode, nodes: &[Arc<Node>]) {
        let groups = root.groups();
        for (id, name) in &self.group_names {
            groups.create_selection_group_with_id(*id).set_name(name);
        }

        for (index, ids) in &self.node_groups {
            let Some(node) = nodes.get(*index) else {
                tracing::warn!("[mapinfo] Selection group mapping refers to missing node {}", index);
                continue;
            };
            for id in ids {
                match groups.find_selection_group(*id) {
                    Some(group) => group.add_node(node),
                    None => tracing::warn!("[mapinfo] Node {} refers to unknown selection group {}", index, id),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eclass::EntityClass;
    use crate::map::format::{collect_nodes, traverse_all};
    use crate::math::Vector3;
    use crate::scene::{Brush, Entity, NodeData};

    fn setup_map() -> (Arc<RootNode>, Arc<Node>, Arc<Node>) {
        let root = RootNode::new();
        let world = Node::new(NodeData::Entity(Entity::new(Arc::new(EntityClass::fabricate("worldspawn", true)))));
        root.add_child_node(world.clone());
        let a = Node::new(NodeData::Brush(Brush::cuboid(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(8.0, 8.0, 8.0),
            "textures/a",
        )));
        let b = Node::new(NodeData::Brush(Brush::cuboid(
            Vector3::new(16.0, 0.0, 0.0),
            Vector3::new(24.0, 8.0, 8.0),
            "textures/a",
        )));
        world.add_child_node(a.clone());
        world.add_child_node(b.clone());
        (root, a, b)
    }

    #[test]
    fn test_layers_and_groups_survive_write_and_read() {
        let (root, a, b) = setup_map();
        let details = root.layers().create_layer("Details").unwrap();
        a.move_to_layer(details);
        b.add_to_layer(details);
        let group = root.groups().create_selection_group();
        group.set_name("pair");
        group.add_node(&a);
        group.add_node(&b);

        let manager = InfoFileManager::with_default_modules();
        let nodes = collect_nodes(root.node(), traverse_all);
        let text = manager.write_info_file(&root, &nodes);
        assert!(text.starts_with("MapInformation Version 2\n{\n"));
        assert!(text.contains("Layer 1 { \"Details\" }"));
        assert!(text.contains("Node ( 1 ) ( 1 )"));

        let (copy, ca, cb) = setup_map();
        let copy_nodes = collect_nodes(copy.node(), traverse_all);
        manager.read_info_file(&text, &copy, &copy_nodes).unwrap();

        assert_eq!(copy.layers().get_layer_id("Details"), Some(1));
        assert_eq!(ca.layers(), BTreeSet::from([1]));
        assert_eq!(cb.layers(), BTreeSet::from([0, 1]));
        let copied = copy.groups().find_selection_group(1).unwrap();
        assert_eq!(copied.name(), "pair");
        assert_eq!(copied.size(), 2);
        assert_eq!(ca.groups(), vec![1]);
    }

    #[test]
    fn test_unknown_blocks_are_skipped() {
        let (root, a, _) = setup_map();
        let manager = InfoFileManager::with_default_modules();
        let nodes = collect_nodes(root.node(), traverse_all);
        let text = "MapInformation Version 2\n{\n\tMergeActions\n\t{\n\t\tAction { x { y } }\n\t}\n\
            \tLayers\n\t{\n\t\tLayer 0 { Default }\n\t\tLayer 3 { Lights }\n\t}\n\
            \tNodeToLayerMapping\n\t{\n\t\tNode { 0 }\n\t\tNode { 3 }\n\t\tNode { 0 }\n\t}\n}\n";
        manager.read_info_file(text, &root, &nodes).unwrap();
        assert_eq!(root.layers().get_layer_name(3).as_deref(), Some("Lights"));
        assert_eq!(a.layers(), BTreeSet::from([3]));
    }

    #[test]
    fn test_bad_header_is_rejected() {
        let (root, _, _) = setup_map();
        let manager = InfoFileManager::with_default_modules();
        let err = manager.read_info_file("MapInformation Version 7\n{\n}\n", &root, &[]).unwrap_err();
        assert!(err.to_string().contains('7'));
        assert!(manager.read_info_file("Nonsense", &root, &[]).is_err());
    }

    #[test]
    fn test_missing_module_is_not_an_error() {
        let (root, _, _) = setup_map();
        let writer = InfoFileManager::with_default_modules();
        let nodes = collect_nodes(root.node(), traverse_all);
        let text = writer.write_info_file(&root, &nodes);

        let reader = InfoFileManager::new();
        reader.register_module(Arc::new(LayerInfoFileModule));
        reader.read_info_file(&text, &root, &nodes).unwrap();
        assert_eq!(reader.module_count(), 1);
    }
}
