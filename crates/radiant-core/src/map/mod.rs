//! Map loading, saving, merging and the `.mapinfo` companion files.

mod commands;
mod doom3;
mod format;
mod import;
mod info_file;
mod manager;
mod merge;
mod resource;

use std::path::PathBuf;

pub use commands::register_map_commands;
pub use doom3::{
    BrushDef3Parser, BrushDefParser, Doom3MapFormat, Doom3MapReader, Doom3MapWriter, GAME_TYPE_DOOM3, MAP_VERSION_D3,
    PatchDef2Parser, PatchDef3Parser,
};
pub use format::{
    GraphTraversal, ImportFilter, MapFormat, MapFormatManager, MapReader, MapWriter, PrimitiveParser, collect_nodes,
    export_map, traverse_all, traverse_selected,
};
pub use import::MapImportFilter;
pub use info_file::{
    INFO_FILE_EXTENSION, InfoBlockReader, InfoFileManager, InfoFileModule, LayerInfoFileModule,
    SelectionGroupInfoFileModule,
};
pub use manager::{MODULE_MAP, Map, MapEvent, MapFileSelector};
pub use merge::merge_map;
pub use resource::MapResource;

use crate::parser::ParseError;

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("Incorrect map version: required {required}, found {found}")]
    VersionMismatch { required: f64, found: f64 },
    #[error("Unable to parse map version: {0}")]
    InvalidVersion(String),
    #[error("Failed parsing entity {entity}: {message}")]
    Parse { entity: usize, message: String },
    #[error("Entity {entity}: unknown primitive type {keyword}")]
    UnknownPrimitive { entity: usize, keyword: String },
    #[error(transparent)]
    Syntax(#[from] ParseError),
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("The map has not been saved to a file yet")]
    NoFile,
    #[error("No map format found for {0}")]
    UnknownFormat(String),
    #[error("Invalid map info file: {0}")]
    InfoFile(String),
}
