//! Editable, renderable wrapper around a material declaration.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::template::{MapExpression, MaterialData, ShaderTemplate, StageKind};
use super::textures::{DefaultTexture, Texture, TextureManager};
use crate::decl::Declaration;
use crate::vfs::FileInfo;

/// Texture bound to one stage of a realised material.
#[derive(Debug, Clone)]
pub struct StageBinding {
    pub stage_index: usize,
    pub kind: StageKind,
    /// `None` for builtin render targets and stages without a map.
    pub texture: Option<Arc<Texture>>,
}

/// A material as seen by the editor and the renderer.
///
/// The renderer only ever sees the committed stages of the backing
/// [`ShaderTemplate`]; edits go to a working copy until committed.
pub struct Material {
    name: RwLock<String>,
    template: Arc<ShaderTemplate>,
    textures: Arc<TextureManager>,
    working: RwLock<Option<MaterialData>>,
    modified: AtomicBool,
    realised: AtomicBool,
    bindings: RwLock<Vec<StageBinding>>,
    editor_texture: RwLock<Option<Arc<Texture>>>,
    visible_stages: RwLock<Option<Vec<usize>>>,
}

impl Material {
    pub fn new(name: &str, template: Arc<ShaderTemplate>, textures: Arc<TextureManager>) -> Self {
        Self {
            name: RwLock::new(name.to_string()),
            template,
            textures,
            working: RwLock::new(None),
            modified: AtomicBool::new(false),
            realised: AtomicBool::new(false),
            bindings: RwLock::new(Vec::new()),
            editor_texture: RwLock::new(None),
            visible_stages: RwLock::new(None),
        }
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    pub fn template(&self) -> &Arc<ShaderTemplate> {
        &self.template
    }

    pub fn file_info(&self) -> Option<FileInfo> {
        self.template.file_info()
    }

    /// Unsourced materials and those read from a physical file can be saved.
    pub fn is_editable(&self) -> bool {
        self.file_info().is_none_or(|info| info.is_physical)
    }

    /// The committed definition, as the renderer sees it.
    pub fn data(&self) -> Arc<MaterialData> {
        self.template.data()
    }

    pub fn working_copy(&self) -> Option<MaterialData> {
        self.working.read().clone()
    }

    /// Working copy when editing, otherwise the committed definition.
    pub fn current_data(&self) -> MaterialData {
        self.working_copy().unwrap_or_else(|| (*self.data()).clone())
    }

    /// Mutates the working copy, creating it from the committed stages on first use.
    pub fn edit<R>(&self, f: impl FnOnce(&mut MaterialData) -> R) -> R {
        let mut working = self.working.write();
        let data = working.get_or_insert_with(|| (*self.template.data()).clone());
        self.modified.store(true, Ordering::Release);
        f(data)
    }

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Acquire)
    }

    pub fn set_is_modified(&self) {
        self.modified.store(true, Ordering::Release);
    }

    /// Replaces the declaration's text with the canonical form of the working copy.
    pub fn commit_modifications(&self) {
        let data = self
            .working
            .write()
            .take()
            .unwrap_or_else(|| (*self.template.data()).clone());
        self.template.set_data(data);
        self.template.set_modified(true);
        self.modified.store(false, Ordering::Release);

        if self.is_realised() {
            self.unrealise();
            self.realise();
        }
    }

    pub fn revert_modifications(&self) {
        *self.working.write() = None;
        self.modified.store(false, Ordering::Release);
    }

    pub fn description(&self) -> String {
        self.data().description.clone()
    }

    /// `qer_editorimage`, falling back to the first diffuse map.
    pub fn editor_image_name(&self) -> Option<String> {
        let data = self.data();
        data.editor_image.clone().or_else(|| {
            data.stages_of_kind(StageKind::Diffuse)
                .find_map(|stage| stage.map.as_ref().and_then(MapExpression::image_path))
                .map(str::to_string)
        })
    }

    // ========================================================================
    // Realisation
    // ========================================================================

    pub fn is_realised(&self) -> bool {
        self.realised.load(Ordering::Acquire)
    }

    /// Binds textures for every committed stage.
    pub fn realise(&self) {
        if self.realised.swap(true, Ordering::AcqRel) {
            return;
        }

        let data = self.data();
        let bindings = data
            .stages
            .iter()
            .enumerate()
            .map(|(stage_index, stage)| {
                let fallback = match stage.kind {
                    StageKind::Bump => DefaultTexture::Flat,
                    _ => DefaultTexture::Black,
                };
                let texture = match &stage.map {
                    Some(map) => match map.image_path() {
                        Some(path) => Some(self.textures.get_binding(path, fallback)),
                        None if matches!(map, MapExpression::Builtin(_)) => None,
                        None => Some(self.textures.default_texture(fallback)),
                    },
                    None => None,
                };
                StageBinding {
                    stage_index,
                    kind: stage.kind,
                    texture,
                }
            })
            .collect();

        *self.bindings.write() = bindings;
        *self.editor_texture.write() = Some(match self.editor_image_name() {
            Some(image) => self.textures.get_binding(&image, DefaultTexture::Black),
            None => self.textures.default_texture(DefaultTexture::Black),
        });
    }

    /// Drops all texture references; the manager's sweep can then release them.
    pub fn unrealise(&self) {
        if !self.realised.swap(false, Ordering::AcqRel) {
            return;
        }
        self.bindings.write().clear();
        *self.editor_texture.write() = None;
        *self.visible_stages.write() = None;
    }

    pub fn bindings(&self) -> Vec<StageBinding> {
        self.bindings.read().clone()
    }

    pub fn editor_texture(&self) -> Option<Arc<Texture>> {
        self.editor_texture.read().clone()
    }

    /// Chooses the stages the renderer draws for the given lighting mode.
    ///
    /// With lighting every stage is drawn; without it bump and specular
    /// stages are skipped.
    pub fn realise_lighting(&self, lighting_enabled: bool) {
        let data = self.data();
        let visible = data
            .stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| lighting_enabled || matches!(stage.kind, StageKind::Diffuse | StageKind::Blend))
            .map(|(index, _)| index)
            .collect();
        *self.visible_stages.write() = Some(visible);
    }

    pub fn unrealise_lighting(&self) {
        *self.visible_stages.write() = None;
    }

    /// Stage indices chosen by the last [`Self::realise_lighting`], if any.
    pub fn visible_stages(&self) -> Option<Vec<usize>> {
        self.visible_stages.read().clone()
    }
}

impl fmt::Debug for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Material")
            .field("name", &self.name())
            .field("modified", &self.is_modified())
            .field("realised", &self.is_realised())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;
    use crate::shaders::table::NoTables;
    use crate::shaders::template::Stage;
    use crate::shaders::textures::ImageLoader;

    struct AllImages;

    impl ImageLoader for AllImages {
        fn resolve(&self, name: &str) -> Option<String> {
            (!name.contains("missing")).then(|| name.to_string())
        }
    }

    fn setup_material(contents: &str) -> (Material, Arc<TextureManager>) {
        let template = Arc::new(ShaderTemplate::new("textures/a", Weak::<NoTables>::new()));
        template.set_block_contents(contents.to_string());
        let textures = Arc::new(TextureManager::new(Arc::new(AllImages)));
        (Material::new("textures/a", template, textures.clone()), textures)
    }

    #[test]
    fn test_edit_uses_working_copy_until_commit() {
        let (material, _) = setup_material("\n\tdiffusemap textures/a_d\n");
        material.edit(|data| data.stages.push(Stage::new(StageKind::Bump, "textures/a_local")));

        assert!(material.is_modified());
        assert_eq!(material.data().stages.len(), 1);
        assert_eq!(material.current_data().stages.len(), 2);

        material.commit_modifications();
        assert!(!material.is_modified());
        assert!(material.working_copy().is_none());
        assert_eq!(material.data().stages.len(), 2);
        assert!(material.template().block_syntax().contents.contains("bumpmap textures/a_local"));
    }

    #[test]
    fn test_revert_discards_edits() {
        let (material, _) = setup_material("\n\tdiffusemap textures/a_d\n");
        material.edit(|data| data.description = "changed".into());
        material.revert_modifications();
        assert!(!material.is_modified());
        assert_eq!(material.current_data().description, "");
    }

    #[test]
    fn test_realise_binds_fallbacks() {
        let (material, textures) = setup_material(
            "\n\tdiffusemap textures/a_d\n\tbumpmap textures/missing_local\n\t{\n\t\tblend add\n\t\tmap _currentRender\n\t}\n",
        );
        material.realise();

        let bindings = material.bindings();
        assert_eq!(bindings.len(), 3);
        assert_eq!(bindings[0].texture.as_ref().map(|t| t.name.as_str()), Some("textures/a_d"));
        assert!(bindings[1].texture.as_ref().is_some_and(|t| t.name.ends_with("_flat.bmp")));
        assert!(bindings[2].texture.is_none());
        assert_eq!(material.editor_texture().map(|t| t.name.clone()).as_deref(), Some("textures/a_d"));

        drop(bindings);
        material.unrealise();
        assert!(material.bindings().is_empty());
        assert_eq!(textures.check_bindings(), 2);
    }

    #[test]
    fn test_lighting_selects_stages() {
        let (material, _) = setup_material(
            "\n\tdiffusemap textures/a_d\n\tbumpmap textures/a_local\n\tspecularmap textures/a_s\n",
        );
        material.realise_lighting(true);
        assert_eq!(material.visible_stages(), Some(vec![0, 1, 2]));
        material.unrealise_lighting();
        material.realise_lighting(false);
        assert_eq!(material.visible_stages(), Some(vec![0]));
    }

    #[test]
    fn test_unsourced_material_is_editable() {
        let (material, _) = setup_material("");
        assert!(material.is_editable());
    }
}
