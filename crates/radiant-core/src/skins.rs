//! Model skins (`skins/*.skin`): material remaps applied to models.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::decl::{
    DeclType, Declaration, DeclarationBase, DeclarationCreator, DeclarationManager, FnCreator, MODULE_DECLMANAGER,
    downcast_decl,
};
use crate::module::{ModuleContext, ModuleError, RegisterableModule};
use crate::parser::DefTokeniser;

pub const MODULE_SKINMANAGER: &str = "SkinManager";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkinData {
    /// Models this skin is meant for.
    pub models: Vec<String>,
    /// `(from, to)` material pairs; `*` matches every material.
    pub remaps: Vec<(String, String)>,
}

pub struct Skin {
    base: DeclarationBase,
    data: RwLock<Option<Arc<SkinData>>>,
}

impl Skin {
    pub fn new(name: &str) -> Self {
        Self {
            base: DeclarationBase::new(DeclType::Skin, name),
            data: RwLock::new(None),
        }
    }

    pub fn data(&self) -> Arc<SkinData> {
        if let Some(data) = self.data.read().as_ref() {
            return data.clone();
        }

        let contents = self.block_syntax().contents;
        let mut tokens = DefTokeniser::new(&contents);
        let mut data = SkinData::default();
        while let Some(token) = tokens.next_token() {
            let Some(value) = tokens.next_token() else {
                tracing::warn!("[skins] Dangling token '{}' in skin {}", token, self.decl_name());
                break;
            };
            if token.eq_ignore_ascii_case("model") {
                data.models.push(value);
            } else {
                data.remaps.push((token, value));
            }
        }

        let data = Arc::new(data);
        *self.data.write() = Some(data.clone());
        data
    }

    /// Replacement for `material`, if the skin remaps it.
    pub fn remap(&self, material: &str) -> Option<String> {
        let data = self.data();
        data.remaps
            .iter()
            .find(|(from, _)| from.eq_ignore_ascii_case(material))
            .or_else(|| data.remaps.iter().find(|(from, _)| from == "*"))
            .map(|(_, to)| to.clone())
    }
}

impl Declaration for Skin {
    fn base(&self) -> &DeclarationBase {
        &self.base
    }

    fn on_syntax_block_assigned(&self) {
        *self.data.write() = None;
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct SkinManager {
    decls: Arc<DeclarationManager>,
}

impl SkinManager {
    pub fn new(decls: Arc<DeclarationManager>) -> Self {
        Self { decls }
    }

    pub fn initialise(&self) {
        let creator: Arc<dyn DeclarationCreator> = Arc::new(FnCreator::new(DeclType::Skin, |name: &str| {
            Arc::new(Skin::new(name)) as Arc<dyn Declaration>
        }));
        self.decls.register_decl_type("skin", creator);
        self.decls.register_decl_folder(DeclType::Skin, "skins/", "skin");
    }

    pub fn find_skin(&self, name: &str) -> Option<Arc<Skin>> {
        self.decls
            .find_declaration(DeclType::Skin, name)
            .and_then(downcast_decl::<Skin>)
    }

    /// Material to use on a surface after applying `skin`; the input if nothing matches.
    pub fn remapped_material(&self, skin: &str, material: &str) -> String {
        self.find_skin(skin)
            .and_then(|s| s.remap(material))
            .unwrap_or_else(|| material.to_string())
    }

    /// Names of skins declaring `model`.
    pub fn skins_for_model(&self, model: &str) -> Vec<String> {
        let mut names = Vec::new();
        self.decls.foreach_declaration(DeclType::Skin, |decl| {
            let Some(skin) = downcast_decl::<Skin>(decl.clone()) else {
                return;
            };
            if skin.data().models.iter().any(|m| m.eq_ignore_ascii_case(model)) {
                names.push(skin.decl_name());
            }
        });
        names
    }

    pub fn all_skins(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.decls
            .foreach_declaration(DeclType::Skin, |decl| names.push(decl.decl_name()));
        names
    }

    pub fn reload_skins(&self) {
        self.decls.reload_declarations();
    }
}

impl RegisterableModule for SkinManager {
    fn name(&self) -> &'static str {
        MODULE_SKINMANAGER
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![MODULE_DECLMANAGER]
    }

    fn initialise_module(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        self.initialise();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{MemoryArchive, VirtualFileSystem};

    fn setup_manager() -> SkinManager {
        let text = "skin skins/red {\n\tmodel models/box.lwo\n\ttextures/box textures/box_red\n\t* textures/red\n}\n\nskin skins/blue {\n\tmodel models/ball.lwo\n\ttextures/ball textures/ball_blue\n}\n";
        let vfs = Arc::new(VirtualFileSystem::new());
        vfs.add_archive(Arc::new(MemoryArchive::new("base").with_file("skins/test.skin", text)));
        let manager = SkinManager::new(DeclarationManager::new(vfs));
        manager.initialise();
        manager
    }

    #[test]
    fn test_remaps_with_wildcard() {
        let manager = setup_manager();
        assert_eq!(manager.remapped_material("skins/red", "textures/box"), "textures/box_red");
        assert_eq!(manager.remapped_material("skins/red", "textures/other"), "textures/red");
        assert_eq!(manager.remapped_material("skins/blue", "textures/other"), "textures/other");
        assert_eq!(manager.remapped_material("missing", "textures/box"), "textures/box");
    }

    #[test]
    fn test_skins_for_model() {
        let manager = setup_manager();
        assert_eq!(manager.skins_for_model("MODELS/BOX.LWO"), vec!["skins/red".to_string()]);
        assert_eq!(manager.all_skins().len(), 2);
    }
}
