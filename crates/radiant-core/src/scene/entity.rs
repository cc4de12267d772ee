//! Entity data: an entity class plus ordered spawnargs.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::eclass::EntityClass;
use crate::math::Vector3;

pub const KEY_CLASSNAME: &str = "classname";
pub const KEY_NAME: &str = "name";
pub const KEY_ORIGIN: &str = "origin";
pub const WORLDSPAWN: &str = "worldspawn";

#[derive(Debug, Clone)]
pub struct Entity {
    class: Arc<EntityClass>,
    key_values: IndexMap<String, String>,
}

impl Entity {
    pub fn new(class: Arc<EntityClass>) -> Self {
        let mut key_values = IndexMap::new();
        key_values.insert(KEY_CLASSNAME.to_string(), class.name().to_string());
        Self { class, key_values }
    }

    pub fn class(&self) -> &Arc<EntityClass> {
        &self.class
    }

    pub fn classname(&self) -> &str {
        self.key_value(KEY_CLASSNAME).unwrap_or_else(|| self.class.name())
    }

    pub fn is_worldspawn(&self) -> bool {
        self.classname().eq_ignore_ascii_case(WORLDSPAWN)
    }

    /// Brush-holding entities can own primitives.
    pub fn is_container(&self) -> bool {
        self.class.is_container()
    }

    pub fn key_value(&self, key: &str) -> Option<&str> {
        self.key_values.get(key).map(String::as_str)
    }

    pub fn key_values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.key_values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Sets a spawnarg; an empty value removes the key. Returns the previous value.
    pub(crate) fn set_key_value(&mut self, key: &str, value: &str) -> Option<String> {
        if value.is_empty() {
            self.key_values.shift_remove(key)
        } else {
            self.key_values.insert(key.to_string(), value.to_string())
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.key_value(KEY_NAME)
    }

    pub fn origin(&self) -> Option<Vector3> {
        self.key_value(KEY_ORIGIN).and_then(Vector3::parse)
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.class.name() == other.class.name() && self.key_values == other.key_values
    }
}

/// Keys whose values refer to other entities by name.
pub fn is_reference_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.starts_with("target") || lower == "bind" || lower == "bindto" || lower == "killtarget" || lower == "model"
}
