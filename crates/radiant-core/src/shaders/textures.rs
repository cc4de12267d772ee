//! Shared texture handles with reference-counted release.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::vfs::VirtualFileSystem;

/// Fallback images used when a stage's image cannot be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultTexture {
    /// Used for missing diffuse and specular maps.
    Black,
    /// Used for missing normal maps.
    Flat,
}

impl DefaultTexture {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Black => "_black.bmp",
            Self::Flat => "_flat.bmp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextureSource {
    /// Image found in the VFS under this path.
    Vfs(String),
    /// Image loaded directly from disk.
    File(PathBuf),
    Default(DefaultTexture),
}

#[derive(Debug, PartialEq, Eq)]
pub struct Texture {
    pub name: String,
    pub source: TextureSource,
}

/// Locates image data for a texture name.
pub trait ImageLoader: Send + Sync {
    /// Returns the resolved VFS path of the image, trying the usual extensions.
    fn resolve(&self, name: &str) -> Option<String>;
}

const IMAGE_EXTENSIONS: [&str; 4] = ["tga", "dds", "png", "jpg"];

pub struct VfsImageLoader {
    vfs: Arc<VirtualFileSystem>,
}

impl VfsImageLoader {
    pub fn new(vfs: Arc<VirtualFileSystem>) -> Self {
        Self { vfs }
    }
}

impl ImageLoader for VfsImageLoader {
    fn resolve(&self, name: &str) -> Option<String> {
        if self.vfs.file_exists(name) {
            return Some(name.to_string());
        }
        let stem = Path::new(name).with_extension("");
        let stem = stem.to_string_lossy().replace('\\', "/");
        IMAGE_EXTENSIONS
            .iter()
            .map(|ext| format!("{stem}.{ext}"))
            .find(|candidate| self.vfs.file_exists(candidate))
    }
}

/// Hands out one shared [`Texture`] per name.
pub struct TextureManager {
    loader: Arc<dyn ImageLoader>,
    bitmaps_path: RwLock<PathBuf>,
    textures: Mutex<HashMap<String, Arc<Texture>>>,
}

impl TextureManager {
    pub fn new(loader: Arc<dyn ImageLoader>) -> Self {
        Self {
            loader,
            bitmaps_path: RwLock::new(PathBuf::from("bitmaps")),
            textures: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_bitmaps_path(&self, path: impl Into<PathBuf>) {
        *self.bitmaps_path.write() = path.into();
    }

    /// Texture for `name`, or the given default when the image does not exist.
    pub fn get_binding(&self, name: &str, fallback: DefaultTexture) -> Arc<Texture> {
        let key = name.to_ascii_lowercase();
        if let Some(texture) = self.textures.lock().get(&key) {
            return texture.clone();
        }

        let Some(resolved) = self.loader.resolve(name) else {
            tracing::debug!("[shaders] Image {} not found, using {}", name, fallback.file_name());
            return self.default_texture(fallback);
        };

        let texture = Arc::new(Texture {
            name: name.to_string(),
            source: TextureSource::Vfs(resolved),
        });
        self.textures.lock().entry(key).or_insert(texture).clone()
    }

    pub fn default_texture(&self, kind: DefaultTexture) -> Arc<Texture> {
        let path = self.bitmaps_path.read().join(kind.file_name());
        let key = path.to_string_lossy().to_ascii_lowercase();
        self.textures
            .lock()
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Texture {
                    name: path.to_string_lossy().into_owned(),
                    source: TextureSource::Default(kind),
                })
            })
            .clone()
    }

    pub fn load_texture_from_file(&self, path: &Path) -> Arc<Texture> {
        let key = path.to_string_lossy().to_ascii_lowercase();
        self.textures
            .lock()
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Texture {
                    name: path.to_string_lossy().into_owned(),
                    source: TextureSource::File(path.to_path_buf()),
                })
            })
            .clone()
    }

    /// Drops every texture nobody outside the manager holds. Returns the number released.
    pub fn check_bindings(&self) -> usize {
        let mut textures = self.textures.lock();
        let before = textures.len();
        textures.retain(|_, texture| Arc::strong_count(texture) > 1);
        let released = before - textures.len();
        if released > 0 {
            tracing::debug!("[shaders] Released {} unused textures", released);
        }
        released
    }

    pub fn binding_count(&self) -> usize {
        self.textures.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct KnownImages(Vec<&'static str>);

    impl ImageLoader for KnownImages {
        fn resolve(&self, name: &str) -> Option<String> {
            self.0.iter().find(|n| n.eq_ignore_ascii_case(name)).map(|n| (*n).to_string())
        }
    }

    fn setup_manager() -> TextureManager {
        TextureManager::new(Arc::new(KnownImages(vec!["textures/a.tga"])))
    }

    #[test]
    fn test_binding_is_shared_per_name() {
        let manager = setup_manager();
        let first = manager.get_binding("textures/a.tga", DefaultTexture::Black);
        let second = manager.get_binding("TEXTURES/A.tga", DefaultTexture::Black);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.source, TextureSource::Vfs("textures/a.tga".into()));
    }

    #[test]
    fn test_missing_image_uses_default() {
        let manager = setup_manager();
        let texture = manager.get_binding("textures/missing", DefaultTexture::Flat);
        assert_eq!(texture.source, TextureSource::Default(DefaultTexture::Flat));
        assert!(texture.name.ends_with("_flat.bmp"));
    }

    #[test]
    fn test_check_bindings_releases_unused() {
        let manager = setup_manager();
        let held = manager.get_binding("textures/a.tga", DefaultTexture::Black);
        drop(manager.default_texture(DefaultTexture::Black));
        assert_eq!(manager.binding_count(), 2);

        assert_eq!(manager.check_bindings(), 1);
        assert_eq!(manager.binding_count(), 1);
        drop(held);
        assert_eq!(manager.check_bindings(), 1);
        assert_eq!(manager.binding_count(), 0);
    }
}
