//! Name to [`Material`] map layered over the material declarations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::material::Material;
use super::template::ShaderTemplate;
use super::textures::TextureManager;
use crate::decl::{DeclType, Declaration, DeclarationManager, decl_key, downcast_decl};

pub struct ShaderLibrary {
    decls: Arc<DeclarationManager>,
    textures: Arc<TextureManager>,
    shaders: RwLock<HashMap<String, Arc<Material>>>,
    realised: AtomicBool,
}

impl ShaderLibrary {
    pub fn new(decls: Arc<DeclarationManager>, textures: Arc<TextureManager>) -> Self {
        Self {
            decls,
            textures,
            shaders: RwLock::new(HashMap::new()),
            realised: AtomicBool::new(false),
        }
    }

    fn find_template(&self, name: &str) -> Option<Arc<ShaderTemplate>> {
        self.decls
            .find_declaration(DeclType::Material, name)
            .and_then(downcast_decl::<ShaderTemplate>)
    }

    /// Material for `name`, created on first access from its declaration.
    pub fn find_shader(&self, name: &str) -> Option<Arc<Material>> {
        let key = decl_key(name);
        if let Some(material) = self.shaders.read().get(&key) {
            return Some(material.clone());
        }

        let template = self.find_template(name)?;
        let material = Arc::new(Material::new(&template.decl_name(), template, self.textures.clone()));

        let mut shaders = self.shaders.write();
        let material = shaders.entry(key).or_insert(material).clone();
        if self.realised.load(Ordering::Acquire) {
            material.realise();
        }
        Some(material)
    }

    pub fn definition_exists(&self, name: &str) -> bool {
        self.shaders.read().contains_key(&decl_key(name)) || self.find_template(name).is_some()
    }

    /// Copies the declaration of `source` (and any pending edits) under `new_name`.
    pub fn copy_definition(&self, source: &str, new_name: &str) -> Option<Arc<Material>> {
        let original = self.find_shader(source)?;
        let decl = self.decls.find_or_create_declaration(DeclType::Material, new_name)?;

        let mut block = original.template().block_syntax();
        block.name = new_name.to_string();
        block.span = None;
        decl.set_block_syntax(block);
        decl.set_modified(true);

        let copy = self.find_shader(new_name)?;
        if let Some(working) = original.working_copy() {
            copy.edit(|data| *data = working);
        }
        copy.set_is_modified();
        Some(copy)
    }

    pub fn rename_definition(&self, old_name: &str, new_name: &str) -> bool {
        if !self.decls.rename_declaration(DeclType::Material, old_name, new_name) {
            return false;
        }

        let mut shaders = self.shaders.write();
        if let Some(material) = shaders.remove(&decl_key(old_name)) {
            material.set_name(new_name);
            shaders.insert(decl_key(new_name), material);
        }
        true
    }

    pub fn remove_definition(&self, name: &str) -> bool {
        if let Some(material) = self.shaders.write().remove(&decl_key(name)) {
            material.unrealise();
        }
        self.decls.remove_declaration(DeclType::Material, name)
    }

    pub fn foreach_shader_name(&self, mut visitor: impl FnMut(&str)) {
        self.decls
            .foreach_declaration(DeclType::Material, |decl| visitor(&decl.decl_name()));
    }

    /// Visits every material, creating the missing ones.
    pub fn foreach_shader(&self, mut visitor: impl FnMut(&Arc<Material>)) {
        let mut names = Vec::new();
        self.foreach_shader_name(|name| names.push(name.to_string()));
        for name in names {
            if let Some(material) = self.find_shader(&name) {
                visitor(&material);
            }
        }
    }

    /// Materials created so far; does not touch the declarations.
    pub fn loaded_shaders(&self) -> Vec<Arc<Material>> {
        self.shaders.read().values().cloned().collect()
    }

    pub fn realise(&self) {
        self.realised.store(true, Ordering::Release);
        for material in self.loaded_shaders() {
            material.realise();
        }
    }

    pub fn unrealise(&self) {
        self.realised.store(false, Ordering::Release);
        for material in self.loaded_shaders() {
            material.unrealise();
        }
    }

    /// Forgets every material so the next lookup rebuilds it from the declarations.
    pub fn clear(&self) {
        let shaders: Vec<_> = self.shaders.write().drain().map(|(_, m)| m).collect();
        for material in shaders {
            material.unrealise();
        }
    }

    pub fn len(&self) -> usize {
        self.shaders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
