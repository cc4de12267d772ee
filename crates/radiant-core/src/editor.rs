//! Wires every service of one editing session together.

use std::sync::Arc;

use crate::command::CommandSystem;
use crate::config::{EditorConfig, Registry};
use crate::decl::DeclarationManager;
use crate::eclass::EntityClassManager;
use crate::map::{Map, register_map_commands};
use crate::module::{ModuleContext, ModuleError, ModuleRegistry};
use crate::particles::ParticlesManager;
use crate::shaders::{MaterialManager, TextureManager, VfsImageLoader};
use crate::skins::SkinManager;
use crate::vfs::{VfsModule, VirtualFileSystem};

pub struct Editor {
    context: ModuleContext,
    modules: ModuleRegistry,
    vfs: Arc<VirtualFileSystem>,
    decls: Arc<DeclarationManager>,
    materials: Arc<MaterialManager>,
    classes: Arc<EntityClassManager>,
    skins: Arc<SkinManager>,
    particles: Arc<ParticlesManager>,
    commands: Arc<CommandSystem>,
    map: Arc<Map>,
}

impl Editor {
    /// Builds the services and registers them as modules. Nothing is loaded
    /// until [`Editor::initialise`].
    pub fn new(config: EditorConfig) -> Result<Self, ModuleError> {
        let registry = Arc::new(Registry::with_values(config.registry.clone()));
        let context = ModuleContext {
            config: Arc::new(config),
            registry: registry.clone(),
        };

        let vfs = Arc::new(VirtualFileSystem::new());
        let decls = DeclarationManager::new(vfs.clone());
        let textures = Arc::new(TextureManager::new(Arc::new(VfsImageLoader::new(vfs.clone()))));
        let materials = MaterialManager::new(decls.clone(), textures);
        let classes = EntityClassManager::new(decls.clone());
        let skins = Arc::new(SkinManager::new(decls.clone()));
        let particles = ParticlesManager::new(decls.clone());
        let commands = Arc::new(CommandSystem::new());
        let map = Map::new(classes.clone(), registry);

        let mut modules = ModuleRegistry::new();
        modules.register(Arc::new(VfsModule::new(vfs.clone())))?;
        modules.register(decls.clone())?;
        modules.register(materials.clone())?;
        modules.register(classes.clone())?;
        modules.register(skins.clone())?;
        modules.register(particles.clone())?;
        modules.register(commands.clone())?;
        modules.register(map.clone())?;

        Ok(Self {
            context,
            modules,
            vfs,
            decls,
            materials,
            classes,
            skins,
            particles,
            commands,
            map,
        })
    }

    /// Initialises all modules in dependency order and registers the commands.
    pub fn initialise(&self) -> Result<(), ModuleError> {
        self.modules.initialise_all(&self.context)?;

        register_map_commands(&self.commands, &self.map);

        let skins = self.skins.clone();
        self.commands.add_command("ReloadSkins", &[], move |_| skins.reload_skins());
        let particles = self.particles.clone();
        self.commands
            .add_command("ReloadParticles", &[], move |_| particles.reload_particles());

        tracing::info!("[editor] Session ready");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.modules.shutdown_all();
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.context.registry
    }

    pub fn config(&self) -> &EditorConfig {
        &self.context.config
    }

    pub fn vfs(&self) -> &Arc<VirtualFileSystem> {
        &self.vfs
    }

    pub fn decls(&self) -> &Arc<DeclarationManager> {
        &self.decls
    }

    pub fn materials(&self) -> &Arc<MaterialManager> {
        &self.materials
    }

    pub fn classes(&self) -> &Arc<EntityClassManager> {
        &self.classes
    }

    pub fn skins(&self) -> &Arc<SkinManager> {
        &self.skins
    }

    pub fn particles(&self) -> &Arc<ParticlesManager> {
        &self.particles
    }

    pub fn commands(&self) -> &Arc<CommandSystem> {
        &self.commands
    }

    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }
}
