//! Scene graph of the edited map and its per-map managers.

mod brush;
mod entity;
mod group;
mod layers;
mod namespace;
mod node;
mod root;

pub use brush::{Brush, Face, Patch, PatchControl, TextureMatrix, compute_axis_base};
pub use entity::{Entity, KEY_CLASSNAME, KEY_NAME, KEY_ORIGIN, WORLDSPAWN, is_reference_key};
pub use group::{SelectionGroup, SelectionGroupManager};
pub use layers::{DEFAULT_LAYER, DEFAULT_LAYER_NAME, LayerManager};
pub use namespace::Namespace;
pub use node::{Node, NodeData, NodeId, NodeObserver, NodeState, NodeType, RenderSystem};
pub use root::RootNode;
