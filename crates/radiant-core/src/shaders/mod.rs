//! Material system: shader expressions, tables, material templates, texture
//! bindings and the [`MaterialManager`] tying them to the declaration manager.

mod expression;
mod library;
mod manager;
mod material;
mod table;
mod template;
mod textures;

use crate::decl::DeclError;

pub use expression::{NUM_GLOBALS, NUM_PARMS, Register, RegisterBank, ShaderExpression};
pub use library::ShaderLibrary;
pub use manager::{MODULE_SHADERSYSTEM, MaterialManager, ShaderClient};
pub use material::{Material, StageBinding};
pub use table::{NoTables, TableDefinition, TableLookup};
pub use template::{
    BlendFunc, ClampType, DecalInfo, Deform, MapExpression, MaterialData, ShaderTemplate, Stage, StageKind,
    StageTransform, TransformKind, VertexColour, generate_material_text, parse_material,
};
pub use textures::{DefaultTexture, ImageLoader, Texture, TextureManager, TextureSource, VfsImageLoader};

#[derive(Debug, thiserror::Error)]
pub enum MaterialError {
    #[error("Cannot save this material, it's read-only.")]
    ReadOnly,
    #[error("Material {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Save(#[from] DeclError),
}
