//! Radiant core library
//!
//! Non-GUI core of an id Tech 4 level editor: the virtual filesystem, the
//! declaration manager with its material, entity class, skin and particle
//! front-ends, the scene graph with layers, selection groups and undo, map
//! file reading and writing, and the console command registry.

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod config;
pub mod decl;
pub mod eclass;
pub mod editor;
pub mod map;
pub mod math;
pub mod module;
pub mod parser;
pub mod particles;
pub mod scene;
pub mod selection;
pub mod shaders;
pub mod signal;
pub mod skins;
pub mod undo;
pub mod vfs;

pub use editor::Editor;
