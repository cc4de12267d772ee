//! Module registry: process-wide services initialised in dependency order.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{EditorConfig, Registry};

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("Module {module} depends on unknown module {dependency}")]
    MissingDependency { module: String, dependency: String },
    #[error("Dependency cycle detected involving module {0}")]
    DependencyCycle(String),
    #[error("Module {0} is already registered")]
    Duplicate(String),
    #[error("Failed to initialise module {module}: {message}")]
    Initialisation { module: String, message: String },
}

/// Shared context handed to every module during initialisation.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub config: Arc<EditorConfig>,
    pub registry: Arc<Registry>,
}

/// A service with a name, declared dependencies and an init/shutdown lifecycle.
pub trait RegisterableModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn dependencies(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn initialise_module(&self, ctx: &ModuleContext) -> Result<(), ModuleError>;

    fn shutdown_module(&self) {}
}

#[derive(Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<&'static str, Arc<dyn RegisterableModule>>,
    initialised: Mutex<Vec<&'static str>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Arc<dyn RegisterableModule>) -> Result<(), ModuleError> {
        let name = module.name();
        if self.modules.contains_key(name) {
            return Err(ModuleError::Duplicate(name.to_string()));
        }
        self.modules.insert(name, module);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RegisterableModule>> {
        self.modules.get(name).cloned()
    }

    /// Topologically sorted module names (dependencies first).
    pub fn initialisation_order(&self) -> Result<Vec<&'static str>, ModuleError> {
        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut visiting = HashSet::new();

        for name in self.modules.keys().copied() {
            self.visit(name, &mut visiting, &mut done, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        name: &'static str,
        visiting: &mut HashSet<&'static str>,
        done: &mut HashSet<&'static str>,
        order: &mut Vec<&'static str>,
    ) -> Result<(), ModuleError> {
        if done.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name) {
            return Err(ModuleError::DependencyCycle(name.to_string()));
        }

        let Some(module) = self.modules.get(name) else {
            return Ok(());
        };

        for dependency in module.dependencies() {
            if !self.modules.contains_key(dependency) {
                return Err(ModuleError::MissingDependency {
                    module: name.to_string(),
                    dependency: dependency.to_string(),
                });
            }
            self.visit(dependency, visiting, done, order)?;
        }

        visiting.remove(name);
        done.insert(name);
        order.push(name);
        Ok(())
    }

    pub fn initialise_all(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        let order = self.initialisation_order()?;

        for name in order {
            let Some(module) = self.modules.get(name) else {
                continue;
            };
            tracing::info!("[modules] Initialising {}", name);
            module.initialise_module(ctx)?;
            self.initialised.lock().push(name);
        }
        Ok(())
    }

    /// Shuts down initialised modules in reverse order.
    pub fn shutdown_all(&self) {
        let names: Vec<_> = self.initialised.lock().drain(..).rev().collect();
        for name in names {
            if let Some(module) = self.modules.get(name) {
                tracing::info!("[modules] Shutting down {}", name);
                module.shutdown_module();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestModule {
        name: &'static str,
        deps: Vec<&'static str>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RegisterableModule for TestModule {
        fn name(&self) -> &'static str {
            self.name
        }

        fn dependencies(&self) -> Vec<&'static str> {
            self.deps.clone()
        }

        fn initialise_module(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
            self.log.lock().push(format!("init {}", self.name));
            Ok(())
        }

        fn shutdown_module(&self) {
            self.log.lock().push(format!("shutdown {}", self.name));
        }
    }

    fn setup_context() -> ModuleContext {
        ModuleContext {
            config: Arc::new(EditorConfig::default()),
            registry: Arc::new(Registry::new()),
        }
    }

    fn module(name: &'static str, deps: &[&'static str], log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn RegisterableModule> {
        Arc::new(TestModule {
            name,
            deps: deps.to_vec(),
            log: log.clone(),
        })
    }

    #[test]
    fn test_dependency_order_and_reverse_shutdown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ModuleRegistry::new();
        registry.register(module("Shaders", &["Decls", "Vfs"], &log)).unwrap();
        registry.register(module("Decls", &["Vfs"], &log)).unwrap();
        registry.register(module("Vfs", &[], &log)).unwrap();

        registry.initialise_all(&setup_context()).unwrap();
        registry.shutdown_all();

        assert_eq!(
            *log.lock(),
            vec![
                "init Vfs",
                "init Decls",
                "init Shaders",
                "shutdown Shaders",
                "shutdown Decls",
                "shutdown Vfs"
            ]
        );
    }

    #[test]
    fn test_cycle_and_missing_dependency() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ModuleRegistry::new();
        registry.register(module("A", &["B"], &log)).unwrap();
        registry.register(module("B", &["A"], &log)).unwrap();
        assert!(matches!(registry.initialisation_order(), Err(ModuleError::DependencyCycle(_))));

        let mut registry = ModuleRegistry::new();
        registry.register(module("A", &["Missing"], &log)).unwrap();
        assert!(matches!(
            registry.initialise_all(&setup_context()),
            Err(ModuleError::MissingDependency { .. })
        ));
        assert!(log.lock().is_empty());
    }
}
