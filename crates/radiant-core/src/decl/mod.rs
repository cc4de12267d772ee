//! Typed text declarations (materials, tables, entity classes, particles, skins).
//!
//! A declaration is a named block of text found in a VFS file. The
//! [`DeclarationManager`] discovers and indexes them; concrete types parse
//! their block contents lazily.

mod block;
mod manager;
mod save;

use std::any::Any;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::vfs::FileInfo;

pub use block::{DeclarationBlockReader, parse_blocks};
pub use manager::{DeclarationManager, MODULE_DECLMANAGER, NamedDeclarations};
pub use save::{GENERATED_HEADER, strip_declaration};

/// Declaration types known to the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeclType {
    Undetermined,
    Table,
    Material,
    EntityDef,
    Particle,
    Skin,
}

impl DeclType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Undetermined => "undetermined",
            Self::Table => "table",
            Self::Material => "material",
            Self::EntityDef => "entityDef",
            Self::Particle => "particle",
            Self::Skin => "skin",
        }
    }
}

impl fmt::Display for DeclType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeclError {
    #[error("Failed to parse declaration {name}: {message}")]
    ParseFailure { name: String, message: String },
    #[error("Declaration {0} not found")]
    NotFound(String),
    #[error("No writable path to save {0} to")]
    NoWritablePath(String),
    #[error("Could not remove the file {0}")]
    Remove(String),
    #[error("Could not rename the temporary file {0}")]
    Rename(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Declaration parsing was cancelled")]
    Cancelled,
}

/// Raw text of one declaration plus where it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclarationBlockSyntax {
    /// Keyword as written in the file; empty when the folder's default type applied.
    pub type_name: String,
    pub name: String,
    /// Text between the outermost braces.
    pub contents: String,
    pub file_info: Option<FileInfo>,
    /// Byte range of the whole block within its file.
    pub span: Option<Range<usize>>,
}

impl DeclarationBlockSyntax {
    pub fn new(type_name: &str, name: &str, contents: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            name: name.to_string(),
            contents: contents.to_string(),
            file_info: None,
            span: None,
        }
    }
}

/// State shared by every declaration type.
#[derive(Debug)]
pub struct DeclarationBase {
    decl_type: DeclType,
    name: RwLock<String>,
    block: RwLock<DeclarationBlockSyntax>,
    origin: RwLock<Option<DeclType>>,
    modified: AtomicBool,
}

impl DeclarationBase {
    pub fn new(decl_type: DeclType, name: &str) -> Self {
        Self {
            decl_type,
            name: RwLock::new(name.to_string()),
            block: RwLock::new(DeclarationBlockSyntax {
                name: name.to_string(),
                ..Default::default()
            }),
            origin: RwLock::new(None),
            modified: AtomicBool::new(false),
        }
    }
}

/// Interface of every declaration type.
pub trait Declaration: Any + Send + Sync {
    fn base(&self) -> &DeclarationBase;

    /// Called after the block syntax changed; parsed caches must be dropped.
    fn on_syntax_block_assigned(&self) {}

    /// Canonical body text (without the surrounding braces).
    fn generate_syntax(&self) -> String {
        self.base().block.read().contents.clone()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn decl_type(&self) -> DeclType {
        self.base().decl_type
    }

    fn decl_name(&self) -> String {
        self.base().name.read().clone()
    }

    fn set_decl_name(&self, name: &str) {
        *self.base().name.write() = name.to_string();
        self.base().block.write().name = name.to_string();
    }

    fn block_syntax(&self) -> DeclarationBlockSyntax {
        self.base().block.read().clone()
    }

    fn set_block_syntax(&self, block: DeclarationBlockSyntax) {
        *self.base().name.write() = block.name.clone();
        *self.base().block.write() = block;
        self.on_syntax_block_assigned();
    }

    /// Replaces only the block contents, keeping name and file info.
    fn set_block_contents(&self, contents: String) {
        self.base().block.write().contents = contents;
        self.on_syntax_block_assigned();
    }

    fn file_info(&self) -> Option<FileInfo> {
        self.base().block.read().file_info.clone()
    }

    fn set_file_info(&self, info: Option<FileInfo>) {
        self.base().block.write().file_info = info;
    }

    /// Default type of the folder this declaration was discovered in.
    fn origin(&self) -> Option<DeclType> {
        *self.base().origin.read()
    }

    fn set_origin(&self, origin: Option<DeclType>) {
        *self.base().origin.write() = origin;
    }

    fn is_modified(&self) -> bool {
        self.base().modified.load(Ordering::Acquire)
    }

    fn set_modified(&self, modified: bool) {
        self.base().modified.store(modified, Ordering::Release);
    }
}

impl fmt::Debug for dyn Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declaration")
            .field("type", &self.decl_type())
            .field("name", &self.decl_name())
            .finish()
    }
}

/// Downcasts a declaration handle to its concrete type.
pub fn downcast_decl<T: Declaration>(decl: Arc<dyn Declaration>) -> Option<Arc<T>> {
    decl.into_any().downcast::<T>().ok()
}

/// Factory producing empty declarations of one type.
pub trait DeclarationCreator: Send + Sync {
    fn decl_type(&self) -> DeclType;

    fn create_declaration(&self, name: &str) -> Arc<dyn Declaration>;
}

/// Creator backed by a closure.
pub struct FnCreator<F> {
    decl_type: DeclType,
    create: F,
}

impl<F> FnCreator<F>
where
    F: Fn(&str) -> Arc<dyn Declaration> + Send + Sync,
{
    pub fn new(decl_type: DeclType, create: F) -> Self {
        Self { decl_type, create }
    }
}

impl<F> DeclarationCreator for FnCreator<F>
where
    F: Fn(&str) -> Arc<dyn Declaration> + Send + Sync,
{
    fn decl_type(&self) -> DeclType {
        self.decl_type
    }

    fn create_declaration(&self, name: &str) -> Arc<dyn Declaration> {
        (self.create)(name)
    }
}

/// Declaration without a parsed form; used for types that only need the raw text.
#[derive(Debug)]
pub struct RawDeclaration {
    base: DeclarationBase,
}

impl RawDeclaration {
    pub fn new(decl_type: DeclType, name: &str) -> Self {
        Self {
            base: DeclarationBase::new(decl_type, name),
        }
    }
}

impl Declaration for RawDeclaration {
    fn base(&self) -> &DeclarationBase {
        &self.base
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Case-insensitive identity used for lookups.
pub fn decl_key(name: &str) -> String {
    name.to_ascii_lowercase()
}
