//! Material manager: the public face of the shader system.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::MaterialError;
use super::expression::ShaderExpression;
use super::library::ShaderLibrary;
use super::material::Material;
use super::table::{TableDefinition, TableLookup};
use super::template::{ShaderTemplate, StageKind};
use super::textures::{DefaultTexture, Texture, TextureManager};
use crate::decl::{
    DeclType, Declaration, DeclarationCreator, DeclarationManager, FnCreator, MODULE_DECLMANAGER,
};
use crate::module::{ModuleContext, ModuleError, RegisterableModule};
use crate::signal::{Connection, Signal};

pub const MODULE_SHADERSYSTEM: &str = "MaterialManager";

/// Renderer-side holder of material state that must be rebuilt around bulk changes.
pub trait ShaderClient: Send + Sync {
    fn realise_shaders(&self);
    fn unrealise_shaders(&self);
}

pub struct MaterialManager {
    decls: Arc<DeclarationManager>,
    textures: Arc<TextureManager>,
    library: ShaderLibrary,
    lighting_enabled: AtomicBool,
    realised: AtomicBool,
    active_updates: AtomicBool,
    clients: Mutex<Vec<Arc<dyn ShaderClient>>>,
    reload_connection: Mutex<Option<Connection>>,

    material_created: Signal<String>,
    material_renamed: Signal<(String, String)>,
    material_removed: Signal<String>,
    active_shaders_changed: Signal<()>,

    weak_self: Weak<Self>,
}

impl MaterialManager {
    pub fn new(decls: Arc<DeclarationManager>, textures: Arc<TextureManager>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            library: ShaderLibrary::new(decls.clone(), textures.clone()),
            decls,
            textures,
            lighting_enabled: AtomicBool::new(false),
            realised: AtomicBool::new(false),
            active_updates: AtomicBool::new(true),
            clients: Mutex::new(Vec::new()),
            reload_connection: Mutex::new(None),
            material_created: Signal::new(),
            material_renamed: Signal::new(),
            material_removed: Signal::new(),
            active_shaders_changed: Signal::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// Registers the `table` and `material` declaration types and the
    /// `materials/*.mtr` folder, then realises the library.
    pub fn initialise(&self, bitmaps_path: &Path) {
        self.textures.set_bitmaps_path(bitmaps_path);

        let tables: Weak<dyn TableLookup> = Arc::downgrade(&self.decls) as Weak<dyn TableLookup>;
        let table_creator: Arc<dyn DeclarationCreator> = Arc::new(FnCreator::new(DeclType::Table, |name: &str| {
            Arc::new(TableDefinition::new(name)) as Arc<dyn Declaration>
        }));
        let material_creator: Arc<dyn DeclarationCreator> =
            Arc::new(FnCreator::new(DeclType::Material, move |name: &str| {
                Arc::new(ShaderTemplate::new(name, tables.clone())) as Arc<dyn Declaration>
            }));

        self.decls.register_decl_type("table", table_creator);
        self.decls.register_decl_type("material", material_creator);

        let weak = self.weak_self.clone();
        let connection = self
            .decls
            .signal_decls_reloaded(DeclType::Material)
            .connect(move |()| {
                if let Some(manager) = weak.upgrade() {
                    manager.on_materials_reloaded();
                }
            });
        *self.reload_connection.lock() = Some(connection);

        self.decls.register_decl_folder(DeclType::Material, "materials/", "mtr");
        self.realise();
        tracing::info!("[shaders] Material manager initialised");
    }

    pub fn shutdown(&self) {
        if let Some(connection) = self.reload_connection.lock().take() {
            self.decls.signal_decls_reloaded(DeclType::Material).disconnect(connection);
        }
        self.unrealise();
        self.library.clear();
        self.clients.lock().clear();
    }

    fn on_materials_reloaded(&self) {
        tracing::debug!("[shaders] Material declarations reloaded, rebuilding library");
        self.with_clients_unrealised(|| {
            self.library.clear();
        });
        self.emit_active_shaders_changed();
    }

    // ========================================================================
    // Realisation and shader clients
    // ========================================================================

    pub fn attach_client(&self, client: Arc<dyn ShaderClient>) {
        if self.is_realised() {
            client.realise_shaders();
        }
        self.clients.lock().push(client);
    }

    pub fn detach_client(&self, client: &Arc<dyn ShaderClient>) {
        self.clients.lock().retain(|c| !Arc::ptr_eq(c, client));
    }

    pub fn is_realised(&self) -> bool {
        self.realised.load(Ordering::Acquire)
    }

    pub fn realise(&self) {
        if self.realised.swap(true, Ordering::AcqRel) {
            return;
        }
        self.library.realise();
        for client in self.clients.lock().clone() {
            client.realise_shaders();
        }
    }

    pub fn unrealise(&self) {
        if !self.realised.swap(false, Ordering::AcqRel) {
            return;
        }
        for client in self.clients.lock().clone() {
            client.unrealise_shaders();
        }
        self.library.unrealise();
    }

    /// Runs `change` between an unrealise and a realise of every client.
    fn with_clients_unrealised<R>(&self, change: impl FnOnce() -> R) -> R {
        let was_realised = self.is_realised();
        self.unrealise();
        let result = change();
        if was_realised {
            self.realise();
        }
        result
    }

    pub fn set_active_shader_updates(&self, enabled: bool) {
        self.active_updates.store(enabled, Ordering::Release);
        if enabled {
            self.active_shaders_changed.emit(&());
        }
    }

    fn emit_active_shaders_changed(&self) {
        if self.active_updates.load(Ordering::Acquire) {
            self.active_shaders_changed.emit(&());
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn material_exists(&self, name: &str) -> bool {
        self.library.definition_exists(name)
    }

    pub fn get_material(&self, name: &str) -> Option<Arc<Material>> {
        self.library.find_shader(name)
    }

    /// Unsourced materials and those from physical files can be modified.
    pub fn material_can_be_modified(&self, name: &str) -> bool {
        self.get_material(name).is_some_and(|m| m.is_editable())
    }

    pub fn foreach_shader_name(&self, visitor: impl FnMut(&str)) {
        self.library.foreach_shader_name(visitor);
    }

    pub fn foreach_material(&self, visitor: impl FnMut(&Arc<Material>)) {
        self.library.foreach_shader(visitor);
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<TableDefinition>> {
        self.decls.find_table(name)
    }

    pub fn create_shader_expression_from_string(&self, text: &str) -> Option<ShaderExpression> {
        ShaderExpression::parse(text, self.decls.as_ref())
    }

    pub fn get_default_interaction_texture(&self, kind: StageKind) -> Arc<Texture> {
        match kind {
            StageKind::Bump => self.textures.default_texture(DefaultTexture::Flat),
            _ => self.textures.default_texture(DefaultTexture::Black),
        }
    }

    pub fn load_texture_from_file(&self, path: &Path) -> Arc<Texture> {
        self.textures.load_texture_from_file(path)
    }

    /// Releases textures no material references any more.
    pub fn check_bindings(&self) -> usize {
        self.textures.check_bindings()
    }

    // ========================================================================
    // Editing
    // ========================================================================

    /// Creates an empty, modified material under the first free variant of `name`.
    pub fn create_empty_material(&self, name: &str) -> Option<Arc<Material>> {
        let candidate = self.decls.ensure_non_conflicting_name(DeclType::Material, name);
        self.decls.find_or_create_declaration(DeclType::Material, &candidate)?;

        let material = self.library.find_shader(&candidate)?;
        material.set_is_modified();

        tracing::info!("[shaders] Created material {}", candidate);
        self.material_created.emit(&candidate);
        Some(material)
    }

    pub fn copy_material(&self, source: &str, new_name: &str) -> Option<Arc<Material>> {
        if new_name.is_empty() {
            tracing::warn!("[shaders] Cannot copy, the new name must not be empty");
            return None;
        }
        if !self.material_exists(source) {
            tracing::warn!("[shaders] Cannot copy non-existent material {}", source);
            return None;
        }

        let candidate = self.decls.ensure_non_conflicting_name(DeclType::Material, new_name);
        let copy = self.library.copy_definition(source, &candidate)?;

        tracing::info!("[shaders] Copied material {} to {}", source, candidate);
        self.material_created.emit(&candidate);
        Some(copy)
    }

    /// Renames a material. Fails without side effects if `new_name` is taken.
    pub fn rename_material(&self, old_name: &str, new_name: &str) -> bool {
        if old_name == new_name {
            tracing::warn!("[shaders] Cannot rename, the new name is no different");
            return false;
        }
        if !self.material_exists(old_name) {
            tracing::warn!("[shaders] Cannot rename non-existent material {}", old_name);
            return false;
        }
        if self.material_exists(new_name) {
            tracing::warn!("[shaders] Cannot rename material to {} since this name is already in use", new_name);
            return false;
        }

        let renamed = self.with_clients_unrealised(|| self.library.rename_definition(old_name, new_name));
        if renamed {
            self.material_renamed.emit(&(old_name.to_string(), new_name.to_string()));
            self.emit_active_shaders_changed();
        }
        renamed
    }

    pub fn remove_material(&self, name: &str) -> bool {
        if !self.material_exists(name) {
            tracing::warn!("[shaders] Cannot remove non-existent material {}", name);
            return false;
        }

        let removed = self.with_clients_unrealised(|| self.library.remove_definition(name));
        if removed {
            self.material_removed.emit(&name.to_string());
            self.emit_active_shaders_changed();
        }
        removed
    }

    /// Commits pending edits and writes the material into its declaration file.
    pub fn save_material(&self, name: &str) -> Result<(), MaterialError> {
        let Some(material) = self.get_material(name) else {
            return Err(MaterialError::NotFound(name.to_string()));
        };

        if !material.is_modified() {
            tracing::info!("[shaders] Material {} is not modified, nothing to save", name);
            return Ok(());
        }
        if !material.is_editable() {
            return Err(MaterialError::ReadOnly);
        }

        material.commit_modifications();
        let decl: Arc<dyn Declaration> = material.template().clone();
        self.decls.save_declaration(&decl)?;
        Ok(())
    }

    // ========================================================================
    // Lighting mode
    // ========================================================================

    pub fn lighting_enabled(&self) -> bool {
        self.lighting_enabled.load(Ordering::Acquire)
    }

    /// Switches every material between lighting and flat stage sets.
    pub fn set_lighting_enabled(&self, enabled: bool) {
        if self.lighting_enabled() == enabled {
            return;
        }

        let materials = self.library.loaded_shaders();
        for material in &materials {
            material.unrealise_lighting();
        }
        self.lighting_enabled.store(enabled, Ordering::Release);
        for material in &materials {
            material.realise_lighting(enabled);
        }
        self.emit_active_shaders_changed();
    }

    // ========================================================================
    // Signals
    // ========================================================================

    pub fn signal_material_created(&self) -> &Signal<String> {
        &self.material_created
    }

    pub fn signal_material_renamed(&self) -> &Signal<(String, String)> {
        &self.material_renamed
    }

    pub fn signal_material_removed(&self) -> &Signal<String> {
        &self.material_removed
    }

    pub fn signal_active_shaders_changed(&self) -> &Signal<()> {
        &self.active_shaders_changed
    }
}

impl RegisterableModule for MaterialManager {
    fn name(&self) -> &'static str {
        MODULE_SHADERSYSTEM
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![MODULE_DECLMANAGER]
    }

    fn initialise_module(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        self.initialise(&ctx.config.bitmaps_path);
        Ok(())
    }

    fn shutdown_module(&self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::shaders::textures::VfsImageLoader;
    use crate::vfs::{DirectoryArchive, MemoryArchive, VirtualFileSystem};

    const X_MTR: &str = "m1\n{\n\tdiffusemap textures/m1\n}\n\nm2\n{\n\tqer_editorimage textures/m2_ed\n\tdiffusemap textures/m2\n}\n\nm3\n{\n\tdiffusemap textures/m3\n}\n";

    fn setup_manager(root: &Path, files: &[(&str, &str)]) -> Arc<MaterialManager> {
        for (path, contents) in files {
            let full = root.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, contents).unwrap();
        }

        let vfs = Arc::new(VirtualFileSystem::new());
        vfs.add_archive(Arc::new(DirectoryArchive::new(root)));
        vfs.set_writable_root(Some(root.to_path_buf()));

        let decls = DeclarationManager::new(vfs.clone());
        let textures = Arc::new(TextureManager::new(Arc::new(VfsImageLoader::new(vfs))));
        let manager = MaterialManager::new(decls, textures);
        manager.initialise(Path::new("bitmaps"));
        manager
    }

    #[derive(Default)]
    struct CountingClient {
        realised: AtomicUsize,
        unrealised: AtomicUsize,
    }

    impl ShaderClient for CountingClient {
        fn realise_shaders(&self) {
            self.realised.fetch_add(1, Ordering::SeqCst);
        }

        fn unrealise_shaders(&self) {
            self.unrealised.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_create_and_save_material() {
        let dir = tempfile::tempdir().unwrap();
        let manager = setup_manager(dir.path(), &[]);

        let material = manager.create_empty_material("textures/test/a").unwrap();
        assert_eq!(material.name(), "textures/test/a");
        assert!(material.is_modified());
        assert!(manager.material_exists("textures/test/a"));

        manager.save_material("textures/test/a").unwrap();
        let text = std::fs::read_to_string(dir.path().join("materials/editor_generated.mtr")).unwrap();
        assert!(text.contains(crate::decl::GENERATED_HEADER));
        assert_eq!(text.matches("material textures/test/a").count(), 1);
        assert!(text.contains("material textures/test/a\n{\n}\n"));
        assert!(!material.is_modified());
    }

    #[test]
    fn test_copy_into_existing_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let manager = setup_manager(dir.path(), &[("materials/x.mtr", X_MTR)]);

        let copy = manager.copy_material("m2", "m2_copy").unwrap();
        assert_eq!(copy.name(), "m2_copy");
        assert!(copy.is_modified());
        manager.save_material("m2_copy").unwrap();

        let text = std::fs::read_to_string(dir.path().join("materials/x.mtr")).unwrap();
        assert!(text.starts_with(X_MTR));
        let order: Vec<usize> = ["m1\n", "m2\n", "m3\n", "m2_copy\n"]
            .iter()
            .map(|name| text.find(name).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        assert!(text.contains("\tqer_editorimage textures/m2_ed\n"));
    }

    #[test]
    fn test_copy_picks_non_conflicting_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = setup_manager(dir.path(), &[("materials/x.mtr", X_MTR)]);

        let copy = manager.copy_material("m2", "m3").unwrap();
        assert_eq!(copy.name(), "m301");
        assert!(manager.copy_material("missing", "y").is_none());
        assert!(manager.copy_material("m2", "").is_none());
    }

    #[test]
    fn test_rename_with_collision() {
        let dir = tempfile::tempdir().unwrap();
        let manager = setup_manager(dir.path(), &[("materials/ab.mtr", "a { diffusemap textures/a }\nb { }\n")]);
        let client = Arc::new(CountingClient::default());
        manager.attach_client(client.clone());

        let before = manager.get_material("a").unwrap();
        assert!(!manager.rename_material("a", "b"));
        assert!(manager.get_material("a").is_some());
        assert_eq!(client.unrealised.load(Ordering::SeqCst), 0);

        let renamed = Arc::new(Mutex::new(None));
        let sink = renamed.clone();
        manager
            .signal_material_renamed()
            .connect(move |pair| *sink.lock() = Some(pair.clone()));

        assert!(manager.rename_material("a", "c"));
        assert!(manager.get_material("a").is_none());
        let after = manager.get_material("c").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.name(), "c");
        assert_eq!(*renamed.lock(), Some(("a".to_string(), "c".to_string())));
        assert_eq!(client.unrealised.load(Ordering::SeqCst), 1);
        assert_eq!(client.realised.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_material() {
        let dir = tempfile::tempdir().unwrap();
        let manager = setup_manager(dir.path(), &[("materials/x.mtr", X_MTR)]);
        assert!(manager.remove_material("m1"));
        assert!(!manager.material_exists("m1"));
        assert!(!manager.remove_material("m1"));
    }

    #[test]
    fn test_save_read_only_material_fails() {
        let vfs = Arc::new(VirtualFileSystem::new());
        vfs.add_archive(Arc::new(MemoryArchive::new("pak000.pk4").with_file("materials/x.mtr", X_MTR)));
        let decls = DeclarationManager::new(vfs.clone());
        let textures = Arc::new(TextureManager::new(Arc::new(VfsImageLoader::new(vfs))));
        let manager = MaterialManager::new(decls, textures);
        manager.initialise(Path::new("bitmaps"));

        assert!(!manager.material_can_be_modified("m1"));
        manager.get_material("m1").unwrap().set_is_modified();
        let err = manager.save_material("m1").unwrap_err();
        assert_eq!(err.to_string(), "Cannot save this material, it's read-only.");
    }

    #[test]
    fn test_lighting_toggle_reassigns_stages() {
        let dir = tempfile::tempdir().unwrap();
        let manager = setup_manager(
            dir.path(),
            &[("materials/l.mtr", "lit { diffusemap textures/d\n bumpmap textures/n\n}\n")],
        );
        let material = manager.get_material("lit").unwrap();

        manager.set_lighting_enabled(true);
        assert_eq!(material.visible_stages(), Some(vec![0, 1]));
        manager.set_lighting_enabled(false);
        assert_eq!(material.visible_stages(), Some(vec![0]));
    }

    #[test]
    fn test_expressions_resolve_declared_tables() {
        let dir = tempfile::tempdir().unwrap();
        let manager = setup_manager(dir.path(), &[("materials/t.mtr", "table half { { 0.5 } }\n")]);
        let expr = manager.create_shader_expression_from_string("half[0] * 4").unwrap();
        assert!((expr.evaluate_at(0.0) - 2.0).abs() < 1e-12);
        assert!(manager.get_table("HALF").is_some());
    }

    #[test]
    fn test_reload_rebuilds_materials() {
        let dir = tempfile::tempdir().unwrap();
        let manager = setup_manager(dir.path(), &[("materials/x.mtr", X_MTR)]);
        let first = manager.get_material("m1").unwrap();

        std::fs::write(dir.path().join("materials/x.mtr"), "m1 { diffusemap textures/other }\n").unwrap();
        manager.decls.reload_declarations();

        let second = manager.get_material("m1").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!manager.material_exists("m2"));
        assert_eq!(
            second.editor_image_name().as_deref(),
            Some("textures/other")
        );
    }
}
