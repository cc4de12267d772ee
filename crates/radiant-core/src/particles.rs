//! Particle system declarations (`particles/*.prt`).

use std::any::Any;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::decl::{
    DeclError, DeclType, Declaration, DeclarationBase, DeclarationCreator, DeclarationManager, FnCreator,
    MODULE_DECLMANAGER, downcast_decl,
};
use crate::module::{ModuleContext, ModuleError, RegisterableModule};
use crate::parser::DefTokeniser;
use crate::scene::{Node, NodeData};
use crate::signal::{Connection, Signal};

pub const MODULE_PARTICLESMANAGER: &str = "ParticlesManager";

/// One emitter stage: ordered `key value` settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticleStage {
    pub settings: Vec<(String, String)>,
}

impl ParticleStage {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.settings.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some((_, v)) => *v = value.to_string(),
            None => self.settings.push((key.to_string(), value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticleData {
    pub depth_hack: f64,
    pub stages: Vec<ParticleStage>,
}

pub struct ParticleDef {
    base: DeclarationBase,
    data: RwLock<Option<Arc<ParticleData>>>,
}

impl ParticleDef {
    pub fn new(name: &str) -> Self {
        Self {
            base: DeclarationBase::new(DeclType::Particle, name),
            data: RwLock::new(None),
        }
    }

    pub fn data(&self) -> Arc<ParticleData> {
        if let Some(data) = self.data.read().as_ref() {
            return data.clone();
        }
        let parsed = Arc::new(parse_particle(&self.decl_name(), &self.block_syntax().contents));
        *self.data.write() = Some(parsed.clone());
        parsed
    }

    /// Replaces the definition and regenerates the block text from it.
    pub fn set_data(&self, data: ParticleData) {
        self.set_block_contents(generate_particle_text(&data));
        *self.data.write() = Some(Arc::new(data));
        self.set_modified(true);
    }
}

impl Declaration for ParticleDef {
    fn base(&self) -> &DeclarationBase {
        &self.base
    }

    fn on_syntax_block_assigned(&self) {
        *self.data.write() = None;
    }

    fn generate_syntax(&self) -> String {
        generate_particle_text(&self.data())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn parse_particle(name: &str, contents: &str) -> ParticleData {
    let mut data = ParticleData::default();
    let mut tokens = DefTokeniser::new(contents);

    while let Some(token) = tokens.next_token() {
        if token.eq_ignore_ascii_case("depthHack") {
            data.depth_hack = tokens.next_f64().unwrap_or_else(|e| {
                tracing::warn!("[particles] Invalid depthHack in {}: {}", name, e);
                0.0
            });
        } else if token == "{" {
            let mut stage = ParticleStage::default();
            while let Some(key) = tokens.next_token() {
                if key == "}" {
                    break;
                }
                stage.settings.push((key, tokens.rest_of_line()));
            }
            data.stages.push(stage);
        } else {
            tracing::warn!("[particles] Unknown token '{}' in particle {}", token, name);
        }
    }
    data
}

pub fn generate_particle_text(data: &ParticleData) -> String {
    let mut out = String::new();
    if data.depth_hack != 0.0 {
        let _ = writeln!(out, "\tdepthHack\t{}", data.depth_hack);
    }
    for stage in &data.stages {
        out.push_str("\t{\n");
        for (key, value) in &stage.settings {
            let _ = writeln!(out, "\t\t{key}\t{value}");
        }
        out.push_str("\t}\n");
    }
    out
}

/// Strips the `.prt` suffix some callers use when naming particles.
pub fn particle_name(name: &str) -> &str {
    let len = name.len();
    if len > 4 && name.is_char_boundary(len - 4) && name[len - 4..].eq_ignore_ascii_case(".prt") {
        &name[..len - 4]
    } else {
        name
    }
}

pub struct ParticlesManager {
    decls: Arc<DeclarationManager>,
    particles_reloaded: Signal<()>,
    reload_connection: Mutex<Option<Connection>>,
    weak_self: Weak<Self>,
}

impl ParticlesManager {
    pub fn new(decls: Arc<DeclarationManager>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            decls,
            particles_reloaded: Signal::new(),
            reload_connection: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn initialise(&self) {
        let creator: Arc<dyn DeclarationCreator> = Arc::new(FnCreator::new(DeclType::Particle, |name: &str| {
            Arc::new(ParticleDef::new(name)) as Arc<dyn Declaration>
        }));
        self.decls.register_decl_type("particle", creator);

        let weak = self.weak_self.clone();
        let connection = self
            .decls
            .signal_decls_reloaded(DeclType::Particle)
            .connect(move |()| {
                if let Some(manager) = weak.upgrade() {
                    manager.particles_reloaded.emit(&());
                }
            });
        *self.reload_connection.lock() = Some(connection);

        self.decls.register_decl_folder(DeclType::Particle, "particles/", "prt");
    }

    pub fn shutdown(&self) {
        if let Some(connection) = self.reload_connection.lock().take() {
            self.decls.signal_decls_reloaded(DeclType::Particle).disconnect(connection);
        }
    }

    pub fn signal_particles_reloaded(&self) -> &Signal<()> {
        &self.particles_reloaded
    }

    pub fn find_particle_def(&self, name: &str) -> Option<Arc<ParticleDef>> {
        self.decls
            .find_declaration(DeclType::Particle, particle_name(name))
            .and_then(downcast_decl::<ParticleDef>)
    }

    pub fn foreach_particle_def(&self, mut visitor: impl FnMut(&Arc<ParticleDef>)) {
        self.decls.foreach_declaration(DeclType::Particle, |decl| {
            if let Some(def) = downcast_decl::<ParticleDef>(decl.clone()) {
                visitor(&def);
            }
        });
    }

    pub fn find_or_insert_particle_def(&self, name: &str) -> Option<Arc<ParticleDef>> {
        self.decls
            .find_or_create_declaration(DeclType::Particle, particle_name(name))
            .and_then(downcast_decl::<ParticleDef>)
    }

    pub fn remove_particle_def(&self, name: &str) -> bool {
        self.decls.remove_declaration(DeclType::Particle, particle_name(name))
    }

    /// Writes the particle back into its `.prt` file, preserving the other definitions.
    pub fn save_particle_def(&self, name: &str) -> Result<(), DeclError> {
        let Some(def) = self.find_particle_def(name) else {
            return Err(DeclError::NotFound(name.to_string()));
        };
        let decl: Arc<dyn Declaration> = def;
        self.decls.save_declaration(&decl)
    }

    /// Scene node rendering the named particle system.
    pub fn create_particle_node(&self, name: &str) -> Option<Arc<Node>> {
        let def = self.find_particle_def(name)?;
        Some(Node::new(NodeData::Particle { name: def.decl_name() }))
    }

    /// Re-parses every declaration folder; listeners are notified through the reload signal.
    pub fn reload_particles(&self) {
        self.decls.reload_declarations();
    }
}

impl RegisterableModule for ParticlesManager {
    fn name(&self) -> &'static str {
        MODULE_PARTICLESMANAGER
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![MODULE_DECLMANAGER]
    }

    fn initialise_module(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        self.initialise();
        Ok(())
    }

    fn shutdown_module(&self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::vfs::{DirectoryArchive, VirtualFileSystem};

    const SMOKE: &str = "particle smoke {\n\tdepthHack\t0.5\n\t{\n\t\tcount\t\t20\n\t\tmaterial\ttextures/particles/smoke\n\t}\n}\n\nparticle fire {\n\t{\n\t\tcount\t\t4\n\t}\n}\n";

    fn setup_manager(root: &std::path::Path) -> Arc<ParticlesManager> {
        std::fs::create_dir_all(root.join("particles")).unwrap();
        std::fs::write(root.join("particles/fx.prt"), SMOKE).unwrap();

        let vfs = Arc::new(VirtualFileSystem::new());
        vfs.add_archive(Arc::new(DirectoryArchive::new(root)));
        vfs.set_writable_root(Some(root.to_path_buf()));
        let manager = ParticlesManager::new(DeclarationManager::new(vfs));
        manager.initialise();
        manager
    }

    #[test]
    fn test_find_strips_extension() {
        let dir = tempfile::tempdir().unwrap();
        let manager = setup_manager(dir.path());

        let smoke = manager.find_particle_def("smoke.prt").unwrap();
        let data = smoke.data();
        assert!((data.depth_hack - 0.5).abs() < 1e-12);
        assert_eq!(data.stages[0].get("count"), Some("20"));
        assert_eq!(data.stages[0].get("Material"), Some("textures/particles/smoke"));

        let mut count = 0;
        manager.foreach_particle_def(|_| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_save_keeps_other_particles() {
        let dir = tempfile::tempdir().unwrap();
        let manager = setup_manager(dir.path());

        let fire = manager.find_particle_def("fire").unwrap();
        let mut data = (*fire.data()).clone();
        data.stages[0].set("count", "8");
        fire.set_data(data);
        manager.save_particle_def("fire").unwrap();

        let text = std::fs::read_to_string(dir.path().join("particles/fx.prt")).unwrap();
        assert!(text.starts_with("particle smoke {\n\tdepthHack\t0.5\n"));
        assert!(text.contains("particle fire\n{\n\t{\n\t\tcount\t8\n\t}\n}\n"));
        assert!(!text.contains("count\t\t4"));
    }

    #[test]
    fn test_reload_signal_and_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = setup_manager(dir.path());
        // initial parse has published
        assert!(manager.find_particle_def("fire").is_some());
        let reloads = Arc::new(AtomicUsize::new(0));
        let counter = reloads.clone();
        manager.signal_particles_reloaded().connect(move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.reload_particles();
        assert_eq!(reloads.load(Ordering::SeqCst), 1);

        let node = manager.create_particle_node("fire.prt").unwrap();
        assert!(matches!(&*node.data(), NodeData::Particle { name } if name == "fire"));
        assert!(manager.create_particle_node("missing").is_none());
    }
}
