//! Entity classes from `entityDef` declarations.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::decl::{
    DeclType, Declaration, DeclarationBase, DeclarationCreator, DeclarationManager, FnCreator, MODULE_DECLMANAGER,
    decl_key, downcast_decl,
};
use crate::math::Vector3;
use crate::module::{ModuleContext, ModuleError, RegisterableModule};
use crate::parser::DefTokeniser;
use crate::signal::Connection;

pub const MODULE_ECLASSMANAGER: &str = "EntityClassManager";

/// Colour of classes without `editor_color`.
pub const DEFAULT_ENTITY_COLOUR: Vector3 = Vector3::new(0.3, 0.3, 1.0);

/// Typed attribute prefixes (`editor_<type> <key>` spawnargs).
const EDITOR_TYPE_PREFIXES: [&str; 8] = [
    "editor_var",
    "editor_string",
    "editor_bool",
    "editor_float",
    "editor_int",
    "editor_color",
    "editor_model",
    "editor_snd",
];

/// Raw `entityDef` declaration: ordered spawnargs parsed lazily.
pub struct EntityDef {
    base: DeclarationBase,
    spawnargs: RwLock<Option<Arc<IndexMap<String, String>>>>,
}

impl EntityDef {
    pub fn new(name: &str) -> Self {
        Self {
            base: DeclarationBase::new(DeclType::EntityDef, name),
            spawnargs: RwLock::new(None),
        }
    }

    /// Key/value pairs in declaration order. Later duplicates overwrite earlier ones.
    pub fn spawnargs(&self) -> Arc<IndexMap<String, String>> {
        if let Some(args) = self.spawnargs.read().as_ref() {
            return args.clone();
        }

        let contents = self.block_syntax().contents;
        let mut tokens = DefTokeniser::new(&contents);
        let mut args = IndexMap::new();
        while let Some(key) = tokens.next_token() {
            let Some(value) = tokens.next_token() else {
                tracing::warn!("[eclass] Missing value for key {} in {}", key, self.decl_name());
                break;
            };
            args.insert(key, value);
        }

        let args = Arc::new(args);
        *self.spawnargs.write() = Some(args.clone());
        args
    }
}

impl Declaration for EntityDef {
    fn base(&self) -> &DeclarationBase {
        &self.base
    }

    fn on_syntax_block_assigned(&self) {
        *self.spawnargs.write() = None;
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Spawnarg with its resolved editor type and description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityAttribute {
    pub name: String,
    pub value: String,
    /// `text` unless an `editor_<type>` entry says otherwise.
    pub attr_type: String,
    pub description: String,
    pub inherited: bool,
}

/// An entity class with its inheritance chain resolved.
#[derive(Debug, Clone)]
pub struct EntityClass {
    name: String,
    parents: Vec<String>,
    attributes: IndexMap<String, EntityAttribute>,
    colour: Vector3,
    bounds: Option<(Vector3, Vector3)>,
    is_light: bool,
    fabricated: bool,
}

impl EntityClass {
    /// Placeholder class for classnames without a definition.
    pub fn fabricate(name: &str, has_brushes: bool) -> Self {
        Self {
            name: name.to_string(),
            parents: Vec::new(),
            attributes: IndexMap::new(),
            colour: DEFAULT_ENTITY_COLOUR,
            bounds: (!has_brushes).then(|| (Vector3::new(-8.0, -8.0, -8.0), Vector3::new(8.0, 8.0, 8.0))),
            is_light: false,
            fabricated: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ancestors from the direct parent upwards.
    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    pub fn attribute(&self, key: &str) -> Option<&EntityAttribute> {
        self.attributes.get(&decl_key(key))
    }

    pub fn attribute_value(&self, key: &str) -> Option<&str> {
        self.attribute(key).map(|a| a.value.as_str())
    }

    pub fn attributes(&self) -> impl Iterator<Item = &EntityAttribute> {
        self.attributes.values()
    }

    pub fn colour(&self) -> Vector3 {
        self.colour
    }

    /// `editor_mins`/`editor_maxs` of fixed-size classes.
    pub fn bounds(&self) -> Option<(Vector3, Vector3)> {
        self.bounds
    }

    pub fn is_fixed_size(&self) -> bool {
        self.bounds.is_some()
    }

    /// Brush-holding classes have no fixed size.
    pub fn is_container(&self) -> bool {
        !self.is_fixed_size()
    }

    pub fn is_light(&self) -> bool {
        self.is_light
    }

    pub fn is_fabricated(&self) -> bool {
        self.fabricated
    }

    fn resolve(name: &str, chain: &[Arc<IndexMap<String, String>>], parents: Vec<String>) -> Self {
        let mut attributes: IndexMap<String, EntityAttribute> = IndexMap::new();
        let mut types: HashMap<String, (String, String)> = HashMap::new();

        // Root ancestor first so that derived classes override.
        for (depth, args) in chain.iter().enumerate().rev() {
            for (key, value) in args.iter() {
                if let Some((attr_type, attr_name)) = editor_type_entry(key) {
                    types.insert(decl_key(attr_name), (attr_type, value.clone()));
                    continue;
                }
                attributes.insert(
                    decl_key(key),
                    EntityAttribute {
                        name: key.clone(),
                        value: value.clone(),
                        attr_type: "text".to_string(),
                        description: String::new(),
                        inherited: depth > 0,
                    },
                );
            }
        }
        for (key, (attr_type, description)) in types {
            let attribute = attributes.entry(key.clone()).or_insert_with(|| EntityAttribute {
                name: key,
                value: String::new(),
                attr_type: String::new(),
                description: String::new(),
                inherited: false,
            });
            attribute.attr_type = attr_type;
            attribute.description = description;
        }

        let value = |key: &str| attributes.get(key).map(|a| a.value.as_str());
        let colour = value("editor_color")
            .and_then(Vector3::parse)
            .unwrap_or(DEFAULT_ENTITY_COLOUR);
        let is_light = value("spawnclass").is_some_and(|c| c.eq_ignore_ascii_case("idLight"))
            || value("editor_light").is_some_and(|v| v == "1");
        let bounds = match (value("editor_mins"), value("editor_maxs")) {
            (Some(mins), Some(maxs)) => Vector3::parse(mins).zip(Vector3::parse(maxs)),
            _ if is_light => Some((Vector3::new(-8.0, -8.0, -8.0), Vector3::new(8.0, 8.0, 8.0))),
            _ => None,
        };

        Self {
            name: name.to_string(),
            parents,
            attributes,
            colour,
            bounds,
            is_light,
            fabricated: false,
        }
    }
}

/// Splits `editor_var foo` into (`var`, `foo`).
fn editor_type_entry(key: &str) -> Option<(String, &str)> {
    let (prefix, name) = key.split_once(' ')?;
    let prefix_lower = prefix.to_ascii_lowercase();
    EDITOR_TYPE_PREFIXES
        .contains(&prefix_lower.as_str())
        .then(|| (prefix_lower["editor_".len()..].to_string(), name.trim()))
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Resolves and caches entity classes on top of the `entityDef` declarations.
pub struct EntityClassManager {
    decls: Arc<DeclarationManager>,
    classes: RwLock<HashMap<String, Arc<EntityClass>>>,
    reload_connection: Mutex<Option<Connection>>,
    weak_self: Weak<Self>,
}

impl EntityClassManager {
    pub fn new(decls: Arc<DeclarationManager>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            decls,
            classes: RwLock::new(HashMap::new()),
            reload_connection: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn initialise(&self) {
        let creator: Arc<dyn DeclarationCreator> = Arc::new(FnCreator::new(DeclType::EntityDef, |name: &str| {
            Arc::new(EntityDef::new(name)) as Arc<dyn Declaration>
        }));
        self.decls.register_decl_type("entityDef", creator);

        let weak = self.weak_self.clone();
        let connection = self
            .decls
            .signal_decls_reloaded(DeclType::EntityDef)
            .connect(move |()| {
                if let Some(manager) = weak.upgrade() {
                    manager.classes.write().retain(|_, class| class.is_fabricated());
                }
            });
        *self.reload_connection.lock() = Some(connection);

        self.decls.register_decl_folder(DeclType::EntityDef, "def/", "def");
    }

    pub fn shutdown(&self) {
        if let Some(connection) = self.reload_connection.lock().take() {
            self.decls.signal_decls_reloaded(DeclType::EntityDef).disconnect(connection);
        }
        self.classes.write().clear();
    }

    fn find_def(&self, name: &str) -> Option<Arc<EntityDef>> {
        self.decls
            .find_declaration(DeclType::EntityDef, name)
            .and_then(downcast_decl::<EntityDef>)
    }

    /// Looks up a defined class, resolving `inherit` chains. Cycles are cut and logged.
    pub fn find_class(&self, name: &str) -> Option<Arc<EntityClass>> {
        let key = decl_key(name);
        if let Some(class) = self.classes.read().get(&key) {
            if !class.is_fabricated() {
                return Some(class.clone());
            }
        }

        let def = self.find_def(name)?;
        let mut chain = vec![def.spawnargs()];
        let mut parents = Vec::new();
        let mut visited: HashSet<String> = HashSet::from([key.clone()]);

        while let Some(parent) = chain.last().and_then(|args| inherit_of(args)) {
            if !visited.insert(decl_key(&parent)) {
                tracing::warn!("[eclass] Circular inheritance in {} at {}", name, parent);
                break;
            }
            let Some(parent_def) = self.find_def(&parent) else {
                tracing::warn!("[eclass] {} inherits from unknown class {}", name, parent);
                break;
            };
            parents.push(parent_def.decl_name());
            chain.push(parent_def.spawnargs());
        }

        let class = Arc::new(EntityClass::resolve(&def.decl_name(), &chain, parents));
        self.classes.write().insert(key, class.clone());
        Some(class)
    }

    /// Defined class, or a fabricated one for unknown classnames.
    pub fn find_or_insert(&self, name: &str, has_brushes: bool) -> Arc<EntityClass> {
        if let Some(class) = self.find_class(name) {
            return class;
        }

        let key = decl_key(name);
        if let Some(class) = self.classes.read().get(&key) {
            return class.clone();
        }

        tracing::warn!("[eclass] Entity class {} not found, creating a default one", name);
        let class = Arc::new(EntityClass::fabricate(name, has_brushes));
        self.classes.write().entry(key).or_insert(class).clone()
    }

    pub fn foreach_class(&self, mut visitor: impl FnMut(&Arc<EntityClass>)) {
        let mut names = Vec::new();
        self.decls
            .foreach_declaration(DeclType::EntityDef, |decl| names.push(decl.decl_name()));
        for name in names {
            if let Some(class) = self.find_class(&name) {
                visitor(&class);
            }
        }
    }
}

fn inherit_of(args: &IndexMap<String, String>) -> Option<String> {
    args.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("inherit"))
        .map(|(_, value)| value.clone())
}

impl RegisterableModule for EntityClassManager {
    fn name(&self) -> &'static str {
        MODULE_ECLASSMANAGER
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
    use super::*;
    use crate::vfs::{MemoryArchive, VirtualFileSystem};

    const DEFS: &str = r#"
entityDef worldspawn {
    "editor_color" "0 0 0"
}
entityDef base_light {
    "spawnclass" "idLight"
    "editor_var falloff" "Light falloff"
    "falloff" "0"
}
entityDef light {
    "inherit" "base_light"
    "editor_color" "0 1 0"
    "falloff" "1"
}
entityDef func_static {
    "editor_mins" "?"
    "editor_maxs" "?"
}
entityDef ammo {
    "editor_mins" "-8 -8 0"
    "editor_maxs" "8 8 16"
}
entityDef loop_a { "inherit" "loop_b" }
entityDef loop_b { "inherit" "loop_a" }
"#;

    fn setup_manager() -> Arc<EntityClassManager> {
        let vfs = Arc::new(VirtualFileSystem::new());
        vfs.add_archive(Arc::new(MemoryArchive::new("base").with_file("def/test.def", DEFS)));
        let manager = EntityClassManager::new(DeclarationManager::new(vfs));
        manager.initialise();
        manager
    }

    #[test]
    fn test_inheritance_overrides_parent() {
        let manager = setup_manager();
        let light = manager.find_class("LIGHT").unwrap();
        assert_eq!(light.name(), "light");
        assert_eq!(light.parents(), ["base_light".to_string()]);
        assert_eq!(light.attribute_value("falloff"), Some("1"));
        assert!(light.is_light());
        assert!(light.is_fixed_size());
        assert_eq!(light.colour(), Vector3::new(0.0, 1.0, 0.0));

        let falloff = light.attribute("falloff").unwrap();
        assert_eq!(falloff.attr_type, "var");
        assert_eq!(falloff.description, "Light falloff");
        assert!(light.attribute("spawnclass").unwrap().inherited);
    }

    #[test]
    fn test_fixed_size_and_containers() {
        let manager = setup_manager();
        assert!(manager.find_class("func_static").unwrap().is_container());
        let ammo = manager.find_class("ammo").unwrap();
        assert_eq!(ammo.bounds(), Some((Vector3::new(-8.0, -8.0, 0.0), Vector3::new(8.0, 8.0, 16.0))));
        assert!(manager.find_class("worldspawn").unwrap().is_container());
    }

    #[test]
    fn test_cycle_is_cut() {
        let manager = setup_manager();
        let class = manager.find_class("loop_a").unwrap();
        assert_eq!(class.parents(), ["loop_b".to_string()]);
    }

    #[test]
    fn test_find_or_insert_fabricates_unknown() {
        let manager = setup_manager();
        let class = manager.find_or_insert("monster_unknown", false);
        assert!(class.is_fabricated());
        assert!(class.is_fixed_size());
        assert!(Arc::ptr_eq(&class, &manager.find_or_insert("monster_unknown", false)));
        assert!(manager.find_or_insert("func_mystery", true).is_container());
        assert!(manager.find_class("monster_unknown").is_none());
    }
}
