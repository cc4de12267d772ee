//! Virtual file system over layered archives.
//!
//! Archives are searched in mount order and the first archive holding a
//! logical path wins. Enumeration is sorted by logical path so it is stable for
//! the lifetime of the mount set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use walkdir::WalkDir;

use crate::config::EditorConfig;
use crate::module::{ModuleContext, ModuleError, RegisterableModule};

pub const MODULE_VIRTUALFILESYSTEM: &str = "VirtualFileSystem";

/// Describes where a logical file came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileInfo {
    /// Folder the file was enumerated under, with trailing slash (e.g. `materials/`).
    pub top_dir: String,
    /// Path relative to `top_dir`.
    pub name: String,
    /// True when the file lives in a writable directory on disk.
    pub is_physical: bool,
    /// Name of the archive or search path holding the file.
    pub archive: String,
    pub physical_path: Option<PathBuf>,
}

impl FileInfo {
    /// Full logical path, e.g. `materials/base.mtr`.
    pub fn full_path(&self) -> String {
        format!("{}{}", self.top_dir, self.name)
    }
}

/// Text contents of a logical file.
#[derive(Debug, Clone)]
pub struct ArchiveTextFile {
    pub info: FileInfo,
    pub contents: String,
}

/// A single search layer.
pub trait Archive: Send + Sync {
    fn name(&self) -> &str;

    fn is_physical(&self) -> bool;

    /// All logical file paths in the archive, using forward slashes.
    fn list_files(&self) -> Vec<String>;

    fn read_text(&self, path: &str) -> Option<String>;

    fn physical_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

/// A directory on disk.
pub struct DirectoryArchive {
    root: PathBuf,
    name: String,
}

impl DirectoryArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = root.display().to_string();
        Self { root, name }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Archive for DirectoryArchive {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_physical(&self) -> bool {
        true
    }

    fn list_files(&self) -> Vec<String> {
        WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(&self.root).ok()?;
                let parts: Vec<_> = relative.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
                Some(parts.join("/"))
            })
            .collect()
    }

    fn read_text(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(self.root.join(path)).ok()
    }

    fn physical_path(&self, path: &str) -> Option<PathBuf> {
        let full = self.root.join(path);
        full.is_file().then_some(full)
    }
}

/// Read-only archive held in memory (packed archives, tests).
pub struct MemoryArchive {
    name: String,
    files: BTreeMap<String, String>,
}

impl MemoryArchive {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.files.insert(path.to_string(), contents.to_string());
        self
    }

    pub fn from_files(name: impl Into<String>, files: BTreeMap<String, String>) -> Self {
        Self { name: name.into(), files }
    }
}

impl Archive for MemoryArchive {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_physical(&self) -> bool {
        false
    }

    fn list_files(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    fn read_text(&self, path: &str) -> Option<String> {
        self.files
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(path))
            .map(|(_, contents)| contents.clone())
    }
}

/// Layered file system.
#[derive(Default)]
pub struct VirtualFileSystem {
    archives: RwLock<Vec<Arc<dyn Archive>>>,
    writable_root: RwLock<Option<PathBuf>>,
}

impl VirtualFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts the search paths and inline archives of the configuration.
    pub fn initialise(&self, config: &EditorConfig) {
        self.shutdown();
        for path in config.search_paths() {
            if path.is_dir() {
                tracing::info!("[vfs] Mounting directory {}", path.display());
                self.add_archive(Arc::new(DirectoryArchive::new(path)));
            } else {
                tracing::debug!("[vfs] Skipping missing search path {}", path.display());
            }
        }
        for archive in &config.archives {
            tracing::info!("[vfs] Mounting archive {}", archive.name);
            self.add_archive(Arc::new(MemoryArchive::from_files(archive.name.clone(), archive.files.clone())));
        }
        *self.writable_root.write() = config.writable_root();
    }

    pub fn shutdown(&self) {
        self.archives.write().clear();
    }

    /// Appends an archive at the lowest priority.
    pub fn add_archive(&self, archive: Arc<dyn Archive>) {
        self.archives.write().push(archive);
    }

    pub fn set_writable_root(&self, root: Option<PathBuf>) {
        *self.writable_root.write() = root;
    }

    /// Where new or inherited files are written (mod path or user engine path).
    pub fn writable_root(&self) -> Option<PathBuf> {
        self.writable_root.read().clone()
    }

    /// Visits every file below `folder` with the given extension.
    ///
    /// `depth` counts path levels below `folder`: 1 means no subdirectories,
    /// 0 means unlimited. Each logical path is visited once, taken from the
    /// highest-priority archive.
    pub fn for_each_file(&self, folder: &str, extension: &str, depth: usize, mut visitor: impl FnMut(&FileInfo)) {
        let top_dir = normalise_folder(folder);
        let extension = extension.trim_start_matches('.').to_ascii_lowercase();
        let archives = self.archives.read().clone();

        let mut found: BTreeMap<String, FileInfo> = BTreeMap::new();

        for archive in &archives {
            for path in archive.list_files() {
                let Some(relative) = strip_folder(&path, &top_dir) else {
                    continue;
                };
                if depth > 0 && relative.split('/').count() > depth {
                    continue;
                }
                if !extension.is_empty() && !has_extension(relative, &extension) {
                    continue;
                }
                found.entry(path.to_ascii_lowercase()).or_insert_with(|| FileInfo {
                    top_dir: top_dir.clone(),
                    name: relative.to_string(),
                    is_physical: archive.is_physical(),
                    archive: archive.name().to_string(),
                    physical_path: archive.physical_path(&path),
                });
            }
        }

        for info in found.values() {
            visitor(info);
        }
    }

    /// Opens a logical path from the highest-priority archive containing it.
    pub fn open_text_file(&self, path: &str) -> Option<ArchiveTextFile> {
        let path = path.replace('\\', "/");
        let archives = self.archives.read().clone();

        for archive in &archives {
            let Some(contents) = archive.read_text(&path) else {
                continue;
            };
            let (top_dir, name) = match path.rfind('/') {
                Some(pos) => (path[..=pos].to_string(), path[pos + 1..].to_string()),
                None => (String::new(), path.clone()),
            };
            return Some(ArchiveTextFile {
                info: FileInfo {
                    top_dir,
                    name,
                    is_physical: archive.is_physical(),
                    archive: archive.name().to_string(),
                    physical_path: archive.physical_path(&path),
                },
                contents,
            });
        }
        None
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.open_text_file(path).is_some()
    }
}

/// Module wrapper mounting the configured search paths.
pub struct VfsModule {
    vfs: Arc<VirtualFileSystem>,
}

impl VfsModule {
    pub fn new(vfs: Arc<VirtualFileSystem>) -> Self {
        Self { vfs }
    }
}

impl RegisterableModule for VfsModule {
    fn name(&self) -> &'static str {
        MODULE_VIRTUALFILESYSTEM
    }

    fn initialise_module(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        self.vfs.initialise(&ctx.config);
        Ok(())
    }

    fn shutdown_module(&self) {
        self.vfs.shutdown();
    }
}

fn normalise_folder(folder: &str) -> String {
    let folder = folder.replace('\\', "/");
    let folder = folder.trim_start_matches('/');
    if folder.is_empty() || folder.ends_with('/') {
        folder.to_string()
    } else {
        format!("{folder}/")
    }
}

fn strip_folder<'a>(path: &'a str, top_dir: &str) -> Option<&'a str> {
    if path.len() < top_dir.len() || !path.is_char_boundary(top_dir.len()) {
        return None;
    }
    let (head, tail) = path.split_at(top_dir.len());
    head.eq_ignore_ascii_case(top_dir).then_some(tail)
}

fn has_extension(path: &str, extension: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case(extension))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_vfs() -> VirtualFileSystem {
        let vfs = VirtualFileSystem::new();
        vfs.add_archive(Arc::new(
            MemoryArchive::new("mod")
                .with_file("materials/b.mtr", "mod b")
                .with_file("materials/sub/c.mtr", "mod c"),
        ));
        vfs.add_archive(Arc::new(
            MemoryArchive::new("base")
                .with_file("materials/a.mtr", "base a")
                .with_file("materials/b.mtr", "base b")
                .with_file("materials/readme.txt", "ignored"),
        ));
        vfs
    }

    #[test]
    fn test_for_each_file_depth_and_priority() {
        let vfs = setup_vfs();

        let mut names = Vec::new();
        vfs.for_each_file("materials", ".mtr", 1, |info| names.push((info.name.clone(), info.archive.clone())));
        assert_eq!(
            names,
            vec![("a.mtr".to_string(), "base".to_string()), ("b.mtr".to_string(), "mod".to_string())]
        );

        let mut all = Vec::new();
        vfs.for_each_file("materials/", "mtr", 0, |info| all.push(info.full_path()));
        assert_eq!(all, vec!["materials/a.mtr", "materials/b.mtr", "materials/sub/c.mtr"]);
    }

    #[test]
    fn test_open_text_file() {
        let vfs = setup_vfs();
        let file = vfs.open_text_file("materials/b.mtr").unwrap();
        assert_eq!(file.contents, "mod b");
        assert_eq!(file.info.top_dir, "materials/");
        assert!(!file.info.is_physical);
        assert!(vfs.open_text_file("materials/none.mtr").is_none());
    }

    #[test]
    fn test_directory_archive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("def")).unwrap();
        std::fs::write(dir.path().join("def/lights.def"), "entityDef light {}").unwrap();

        let vfs = VirtualFileSystem::new();
        vfs.add_archive(Arc::new(DirectoryArchive::new(dir.path())));

        let mut seen = Vec::new();
        vfs.for_each_file("def/", "def", 1, |info| seen.push(info.clone()));
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_physical);
        assert_eq!(seen[0].physical_path.as_deref(), Some(dir.path().join("def/lights.def").as_path()));
    }
}
