use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::MapError;
use super::format::{GraphTraversal, MapFormat, MapFormatManager, collect_nodes, export_map, traverse_all};
use super::import::MapImportFilter;
use super::info_file::{INFO_FILE_EXTENSION, InfoFileManager};
use crate::scene::RootNode;

pub const UNNAMED_MAP: &str = "unnamed";

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

pub(super) fn info_file_path(path: &Path) -> PathBuf {
    path.with_extension(INFO_FILE_EXTENSION)
}

/// Writes through a sibling temp file and a rename so a failed write leaves
/// the previous file untouched.
pub(super) fn write_atomic(path: &Path, contents: &str) -> Result<(), MapError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| MapError::Io { path, source }
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!("_{file_name}"));
    std::fs::write(&temp, contents).map_err(io_err(&temp))?;
    std::fs::rename(&temp, path).map_err(|source| {
        let _ = std::fs::remove_file(&temp);
        MapError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// A map file on disk and the scene loaded from it.
pub struct MapResource {
    path: PathBuf,
    name: String,
    game_type: String,
    root: Option<Arc<RootNode>>,
    format: Option<Arc<dyn MapFormat>>,
    formats: Arc<MapFormatManager>,
    info_files: Arc<InfoFileManager>,
}

impl MapResource {
    pub fn new(
        path: impl Into<PathBuf>,
        game_type: &str,
        formats: Arc<MapFormatManager>,
        info_files: Arc<InfoFileManager>,
    ) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map_or_else(|| UNNAMED_MAP.to_string(), |n| n.to_string_lossy().into_owned());
        Self {
            path,
            name,
            game_type: game_type.to_string(),
            root: None,
            format: None,
            formats,
            info_files,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Points the resource at another file; the loaded scene is kept.
    pub fn rename(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
        self.name = self
            .path
            .file_name()
            .map_or_else(|| UNNAMED_MAP.to_string(), |n| n.to_string_lossy().into_owned());
        self.format = None;
    }

    /// The scene, created empty on first access.
    pub fn root(&mut self) -> Arc<RootNode> {
        self.root.get_or_insert_with(RootNode::new).clone()
    }

    pub fn set_root(&mut self, root: Arc<RootNode>) {
        self.root = Some(root);
    }

    pub fn format(&self) -> Option<&Arc<dyn MapFormat>> {
        self.format.as_ref()
    }

    fn format_for(&self, path: &Path) -> Result<Arc<dyn MapFormat>, MapError> {
        self.formats
            .get_format_for_game_type(&self.game_type, &extension_of(path))
            .ok_or_else(|| MapError::UnknownFormat(path.display().to_string()))
    }

    /// Parses the file into a fresh scene. On failure the resource holds an
    /// empty scene and is renamed to "unnamed".
    pub fn load(&mut self) -> Result<Arc<RootNode>, MapError> {
        tracing::info!("[mapresource] Loading map from {}", self.path.display());
        match self.load_root() {
            Ok((root, format)) => {
                self.root = Some(root.clone());
                self.format = Some(format);
                Ok(root)
            }
            Err(e) => {
                tracing::error!("[mapresource] Failure reading map file {}: {}", self.path.display(), e);
                self.root = Some(RootNode::new());
                self.name = UNNAMED_MAP.to_string();
                Err(e)
            }
        }
    }

    fn load_root(&self) -> Result<(Arc<RootNode>, Arc<dyn MapFormat>), MapError> {
        let format = self.format_for(&self.path)?;
        let root = load_scene(&self.path, &format, &self.info_files)?;
        Ok((root, format))
    }

    /// Writes the whole scene to the resource's path.
    pub fn save(&mut self) -> Result<(), MapError> {
        let format = match &self.format {
            Some(format) => format.clone(),
            None => self.format_for(&self.path)?,
        };
        let root = self.root();
        save_scene(&root, traverse_all, &format, &self.info_files, &self.path)?;
        self.format = Some(format);
        Ok(())
    }

    /// Writes the nodes picked by `traversal` to `path` without touching the resource.
    pub fn save_copy(&mut self, path: &Path, traversal: GraphTraversal) -> Result<(), MapError> {
        let format = self.format_for(path)?;
        let root = self.root();
        save_scene(&root, traversal, &format, &self.info_files, path)
    }
}

/// Reads `path` into a new scene, applying its info file when present.
pub(super) fn load_scene(
    path: &Path,
    format: &Arc<dyn MapFormat>,
    info_files: &InfoFileManager,
) -> Result<Arc<RootNode>, MapError> {
    let text = std::fs::read_to_string(path).map_err(|source| MapError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let root = RootNode::new();
    let filter = MapImportFilter::new(root.clone());
    format.create_reader().read_from_str(&text, &filter)?;

    let info_path = info_file_path(path);
    match std::fs::read_to_string(&info_path) {
        Ok(info) => {
            let nodes = collect_nodes(root.node(), traverse_all);
            if let Err(e) = info_files.read_info_file(&info, &root, &nodes) {
                tracing::warn!("[mapresource] Ignoring info file {}: {}", info_path.display(), e);
            }
        }
        Err(_) => tracing::debug!("[mapresource] No info file at {}", info_path.display()),
    }

    tracing::info!(
        "[mapresource] Loaded {} entities and {} primitives",
        root.entity_count(),
        root.primitive_count()
    );
    Ok(root)
}

pub(super) fn save_scene(
    root: &Arc<RootNode>,
    traversal: GraphTraversal,
    format: &Arc<dyn MapFormat>,
    info_files: &InfoFileManager,
    path: &Path,
) -> Result<(), MapError> {
    let mut text = String::new();
    export_map(root.node(), traversal, format.create_writer().as_mut(), &mut text);

    let nodes = collect_nodes(root.node(), traversal);
    let info = info_files.write_info_file(root, &nodes);

    write_atomic(path, &text)?;
    write_atomic(&info_file_path(path), &info)?;
    tracing::info!("[mapresource] Saved {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::decl::DeclarationManager;
    use crate::eclass::EntityClassManager;
    use crate::map::doom3::Doom3MapFormat;
    use crate::math::Vector3;
    use crate::scene::{Brush, Node, NodeData};
    use crate::vfs::VirtualFileSystem;

    const MAP: &str = "Version 2\n{\n\"classname\" \"worldspawn\"\n{\nbrushDef3\n{\n\
        ( 0 0 1 -8 ) ( ( 1 0 0 ) ( 0 1 0 ) ) \"textures/a\" 0 0 0\n\
        ( 0 0 -1 -8 ) ( ( 1 0 0 ) ( 0 1 0 ) ) \"textures/a\" 0 0 0\n\
        ( 1 0 0 -8 ) ( ( 1 0 0 ) ( 0 1 0 ) ) \"textures/a\" 0 0 0\n\
        ( -1 0 0 -8 ) ( ( 1 0 0 ) ( 0 1 0 ) ) \"textures/a\" 0 0 0\n\
        ( 0 1 0 -8 ) ( ( 1 0 0 ) ( 0 1 0 ) ) \"textures/a\" 0 0 0\n\
        ( 0 -1 0 -8 ) ( ( 1 0 0 ) ( 0 1 0 ) ) \"textures/a\" 0 0 0\n\
        }\n}\n}\n";

    fn setup_formats() -> (Arc<MapFormatManager>, Arc<InfoFileManager>) {
        let classes = EntityClassManager::new(DeclarationManager::new(Arc::new(VirtualFileSystem::new())));
        classes.initialise();
        let formats = Arc::new(MapFormatManager::new());
        formats.register_format(Arc::new(Doom3MapFormat::new(classes)));
        (formats, Arc::new(InfoFileManager::with_default_modules()))
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("box.map");
        std::fs::write(&path, MAP).unwrap();

        let (formats, info) = setup_formats();
        let mut resource = MapResource::new(&path, "doom3", formats, info);
        let root = resource.load().unwrap();
        assert_eq!(resource.name(), "box.map");
        assert_eq!(root.entity_count(), 1);
        assert_eq!(root.primitive_count(), 1);

        let brush = Node::new(NodeData::Brush(Brush::cuboid(
            Vector3::new(32.0, 0.0, 0.0),
            Vector3::new(40.0, 8.0, 8.0),
            "textures/b",
        )));
        root.find_worldspawn().unwrap().add_child_node(brush.clone());
        let layer = root.layers().create_layer("Extra").unwrap();
        brush.move_to_layer(layer);
        resource.save().unwrap();
        assert!(dir.path().join("box.mapinfo").exists());
        assert!(!dir.path().join("_box.map").exists());

        let mut reloaded = MapResource::new(&path, "doom3", resource.formats.clone(), resource.info_files.clone());
        let root = reloaded.load().unwrap();
        assert_eq!(root.primitive_count(), 2);
        let world = root.find_worldspawn().unwrap();
        assert_eq!(world.children()[1].layers(), BTreeSet::from([layer]));
    }

    #[test]
    fn test_failed_load_leaves_empty_unnamed_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.map");
        std::fs::write(&path, "Version 1\n").unwrap();

        let (formats, info) = setup_formats();
        let mut resource = MapResource::new(&path, "doom3", formats.clone(), info.clone());
        assert!(matches!(resource.load(), Err(MapError::VersionMismatch { .. })));
        assert_eq!(resource.name(), UNNAMED_MAP);
        assert!(resource.root().is_empty());

        let mut missing = MapResource::new(dir.path().join("missing.map"), "doom3", formats.clone(), info.clone());
        assert!(matches!(missing.load(), Err(MapError::Io { .. })));

        let mut unknown = MapResource::new(dir.path().join("thing.bsp"), "doom3", formats, info);
        assert!(matches!(unknown.load(), Err(MapError::UnknownFormat(_))));
    }

    #[test]
    fn test_failed_save_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep.map");
        std::fs::write(&path, MAP).unwrap();
        // A directory squatting on the temp file name makes the write fail.
        std::fs::create_dir(dir.path().join("_keep.map")).unwrap();

        let (formats, info) = setup_formats();
        let mut resource = MapResource::new(&path, "doom3", formats, info);
        resource.load().unwrap();
        assert!(resource.save().is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), MAP);
    }
}
