//! The edited map: owns the scene root and drives loading, saving, importing
//! and prefab insertion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::MapError;
use super::doom3::Doom3MapFormat;
use super::format::{MapFormat, MapFormatManager, traverse_all, traverse_selected};
use super::info_file::InfoFileManager;
use super::merge::merge_map;
use super::resource::{MapResource, load_scene, save_scene};
use crate::config::{RKEY_TEXTURE_LOCK, Registry};
use crate::eclass::{EntityClassManager, MODULE_ECLASSMANAGER};
use crate::math::Vector3;
use crate::module::{ModuleContext, ModuleError, RegisterableModule};
use crate::scene::{Entity, Node, NodeData, RootNode, WORLDSPAWN};
use crate::signal::Signal;
use crate::undo::UndoableCommand;

pub const MODULE_MAP: &str = "Map";

const DEFAULT_MAP_NAME: &str = "unnamed.map";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapEvent {
    Loading,
    Loaded,
    Unloading,
    Unloaded,
    SavedToDisk,
}

/// Asks the user for a file when a command runs without a path argument.
pub trait MapFileSelector: Send + Sync {
    /// `open` is false for save dialogs. `None` means cancelled.
    fn select_file(&self, title: &str, open: bool, extension: &str) -> Option<PathBuf>;
}

pub struct Map {
    classes: Arc<EntityClassManager>,
    registry: RwLock<Arc<Registry>>,
    game_type: RwLock<String>,
    formats: Arc<MapFormatManager>,
    info_files: Arc<InfoFileManager>,
    root: RwLock<Arc<RootNode>>,
    resource: Mutex<Option<MapResource>>,
    name: RwLock<String>,
    selector: RwLock<Option<Arc<dyn MapFileSelector>>>,
    map_event: Signal<MapEvent>,
}

impl Map {
    pub fn new(classes: Arc<EntityClassManager>, registry: Arc<Registry>) -> Arc<Self> {
        let formats = Arc::new(MapFormatManager::new());
        formats.register_format(Arc::new(Doom3MapFormat::new(classes.clone())));
        Arc::new(Self {
            classes,
            registry: RwLock::new(registry),
            game_type: RwLock::new(super::GAME_TYPE_DOOM3.to_string()),
            formats,
            info_files: Arc::new(InfoFileManager::with_default_modules()),
            root: RwLock::new(RootNode::new()),
            resource: Mutex::new(None),
            name: RwLock::new(DEFAULT_MAP_NAME.to_string()),
            selector: RwLock::new(None),
            map_event: Signal::new(),
        })
    }

    pub fn root(&self) -> Arc<RootNode> {
        self.root.read().clone()
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn is_unnamed(&self) -> bool {
        self.resource.lock().is_none()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.resource.lock().as_ref().map(|r| r.path().to_path_buf())
    }

    pub fn formats(&self) -> &Arc<MapFormatManager> {
        &self.formats
    }

    pub fn info_files(&self) -> &Arc<InfoFileManager> {
        &self.info_files
    }

    pub fn set_game_type(&self, game_type: &str) {
        *self.game_type.write() = game_type.to_string();
    }

    pub fn is_modified(&self) -> bool {
        self.root().undo().change_tracker().is_modified()
    }

    pub fn set_file_selector(&self, selector: Option<Arc<dyn MapFileSelector>>) {
        *self.selector.write() = selector;
    }

    /// Path from the selector, if one is installed and the user picked a file.
    pub fn select_file(&self, title: &str, open: bool, extension: &str) -> Option<PathBuf> {
        let selector = self.selector.read().clone();
        let Some(selector) = selector else {
            tracing::warn!("[map] {}: no file given and no file selector available", title);
            return None;
        };
        selector.select_file(title, open, extension)
    }

    pub fn signal_map_event(&self) -> &Signal<MapEvent> {
        &self.map_event
    }

    fn format_for(&self, path: &Path) -> Result<Arc<dyn MapFormat>, MapError> {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.formats
            .get_format_for_game_type(&self.game_type.read(), &extension)
            .ok_or_else(|| MapError::UnknownFormat(path.display().to_string()))
    }

    fn new_resource(&self, path: &Path) -> MapResource {
        MapResource::new(path, &self.game_type.read(), self.formats.clone(), self.info_files.clone())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Unloads the current map and drops its undo history.
    pub fn free_map(&self) {
        self.map_event.emit(&MapEvent::Unloading);

        let root = self.root();
        root.selection().set_selected_all(false);
        root.undo().clear();
        root.groups().delete_all_selection_groups();
        root.layers().reset();

        *self.root.write() = RootNode::new();
        *self.resource.lock() = None;
        *self.name.write() = DEFAULT_MAP_NAME.to_string();

        self.map_event.emit(&MapEvent::Unloaded);
    }

    /// Replaces the current map with an empty one holding only worldspawn.
    pub fn new_map(&self) {
        self.free_map();
        self.map_event.emit(&MapEvent::Loading);
        self.find_or_insert_worldspawn();
        self.root().undo().change_tracker().save();
        self.map_event.emit(&MapEvent::Loaded);
        tracing::info!("[map] Created new map");
    }

    /// Loads `path` as the current map. On failure the map is left empty and unnamed.
    pub fn load(&self, path: &Path) -> Result<(), MapError> {
        self.free_map();
        self.map_event.emit(&MapEvent::Loading);

        let mut resource = self.new_resource(path);
        let result = resource.load();
        let root = resource.root();
        *self.name.write() = resource.name().to_string();
        *self.root.write() = root;
        if result.is_ok() {
            *self.resource.lock() = Some(resource);
        }

        self.map_event.emit(&MapEvent::Loaded);
        result.map(|_| ())
    }

    pub fn find_worldspawn(&self) -> Option<Arc<Node>> {
        self.root().find_worldspawn()
    }

    pub fn find_or_insert_worldspawn(&self) -> Arc<Node> {
        let root = self.root();
        if let Some(world) = root.find_worldspawn() {
            return world;
        }
        let world = Node::new(NodeData::Entity(Entity::new(self.classes.find_or_insert(WORLDSPAWN, true))));
        root.node().insert_child_first(world.clone());
        world
    }

    // ------------------------------------------------------------------------
    // Import and prefabs
    // ------------------------------------------------------------------------

    /// Merges the contents of `path` into the current map and selects them.
    pub fn import(&self, path: &Path) -> Result<Vec<Arc<Node>>, MapError> {
        let format = self.format_for(path)?;
        let source = load_scene(path, &format, &self.info_files)?;

        let root = self.root();
        let _command = UndoableCommand::new(root.undo(), "mergeMap");
        root.selection().set_selected_all(false);
        let imported = merge_map(&source, &root);
        for node in &imported {
            if node.is_visible() {
                root.selection().set_selected(node, true);
            }
        }
        tracing::info!("[map] Imported {} nodes from {}", imported.len(), path.display());
        Ok(imported)
    }

    /// Imports a prefab and moves it to `position` with texture lock forced on.
    pub fn load_prefab_at(&self, path: &Path, position: Vector3) -> Result<(), MapError> {
        let root = self.root();
        let _command = UndoableCommand::new(root.undo(), "loadPrefabAt");
        root.selection().set_selected_all(false);
        self.import(path)?;

        let registry = self.registry.read().clone();
        let texture_lock = registry.get_bool(RKEY_TEXTURE_LOCK);
        registry.set_bool(RKEY_TEXTURE_LOCK, true);
        self.translate_selected(position);
        registry.set_bool(RKEY_TEXTURE_LOCK, texture_lock);
        Ok(())
    }

    /// Moves the selection, keeping textures in place when texture lock is on.
    pub fn translate_selected(&self, offset: Vector3) {
        let texture_lock = self.registry.read().get_bool(RKEY_TEXTURE_LOCK);
        self.root().selection().translate_selected(offset, texture_lock);
    }

    // ------------------------------------------------------------------------
    // Saving
    // ------------------------------------------------------------------------

    /// Saves to the current file. An unnamed map needs a path via `save_as`.
    pub fn save(&self) -> Result<(), MapError> {
        let root = self.root();
        {
            let mut resource = self.resource.lock();
            let Some(resource) = resource.as_mut() else {
                return Err(MapError::NoFile);
            };
            resource.set_root(root.clone());
            resource.save()?;
        }
        root.undo().change_tracker().save();
        self.map_event.emit(&MapEvent::SavedToDisk);
        Ok(())
    }

    /// Saves to `path` and makes it the current file.
    pub fn save_as(&self, path: &Path) -> Result<(), MapError> {
        let root = self.root();
        let mut resource = self.new_resource(path);
        resource.set_root(root.clone());
        resource.save()?;

        *self.name.write() = resource.name().to_string();
        *self.resource.lock() = Some(resource);
        root.undo().change_tracker().save();
        self.map_event.emit(&MapEvent::SavedToDisk);
        Ok(())
    }

    /// Writes the whole map to `path`; the current file stays as it is.
    pub fn save_copy_as(&self, path: &Path) -> Result<(), MapError> {
        let format = self.format_for(path)?;
        save_scene(&self.root(), traverse_all, &format, &self.info_files, path)
    }

    pub fn save_selected(&self, path: &Path) -> Result<(), MapError> {
        let format = self.format_for(path)?;
        save_scene(&self.root(), traverse_selected, &format, &self.info_files, path)
    }

    /// Like `save_selected`, defaulting to the prefab extension.
    pub fn save_selected_as_prefab(&self, path: &Path) -> Result<(), MapError> {
        if path.extension().is_some() {
            self.save_selected(path)
        } else {
            self.save_selected(&path.with_extension("pfb"))
        }
    }
}

impl RegisterableModule for Map {
    fn name(&self) -> &'static str {
        MODULE_MAP
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![MODULE_ECLASSMANAGER]
    }

    fn initialise_module(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        *self.registry.write() = ctx.registry.clone();
        self.set_game_type(&ctx.config.game_type);
        self.new_map();
        Ok(())
    }

    fn shutdown_module(&self) {
        self.free_map();
    }
}
