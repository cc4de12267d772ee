//! `table` declarations: lookup tables indexable from shader expressions.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::decl::{DeclType, Declaration, DeclarationBase, DeclarationManager, downcast_decl};
use crate::parser::DefTokeniser;

/// Resolves table names while parsing expressions.
pub trait TableLookup: Send + Sync {
    fn find_table(&self, name: &str) -> Option<Arc<TableDefinition>>;
}

/// Lookup that knows no tables.
pub struct NoTables;

impl TableLookup for NoTables {
    fn find_table(&self, _name: &str) -> Option<Arc<TableDefinition>> {
        None
    }
}

impl TableLookup for DeclarationManager {
    fn find_table(&self, name: &str) -> Option<Arc<TableDefinition>> {
        self.find_declaration(DeclType::Table, name)
            .and_then(downcast_decl::<TableDefinition>)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct TableData {
    snap: bool,
    clamp: bool,
    values: Vec<f64>,
}

pub struct TableDefinition {
    base: DeclarationBase,
    data: RwLock<Option<Arc<TableData>>>,
}

impl TableDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            base: DeclarationBase::new(DeclType::Table, name),
            data: RwLock::new(None),
        }
    }

    /// Builds an already-parsed table, mostly useful for tests.
    pub fn with_values(name: &str, snap: bool, clamp: bool, values: Vec<f64>) -> Self {
        let table = Self::new(name);
        *table.data.write() = Some(Arc::new(TableData { snap, clamp, values }));
        table
    }

    pub fn name(&self) -> String {
        self.decl_name()
    }

    fn data(&self) -> Arc<TableData> {
        if let Some(data) = self.data.read().as_ref() {
            return data.clone();
        }
        let parsed = Arc::new(parse_table(&self.decl_name(), &self.block_syntax().contents));
        *self.data.write() = Some(parsed.clone());
        parsed
    }

    pub fn is_snapped(&self) -> bool {
        self.data().snap
    }

    pub fn is_clamped(&self) -> bool {
        self.data().clamp
    }

    pub fn values(&self) -> Vec<f64> {
        self.data().values.clone()
    }

    /// Samples the table at `index`.
    ///
    /// The index is mapped into `[0, 1]` (clamped or wrapped), scaled by the
    /// value count and then either snapped down or linearly interpolated,
    /// wrapping around at the end.
    pub fn lookup(&self, index: f64) -> f64 {
        let data = self.data();
        let count = data.values.len();
        if count == 0 {
            return 0.0;
        }

        let u = if data.clamp {
            index.clamp(0.0, 1.0)
        } else {
            index - index.floor()
        };

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (left, frac) = {
            let scaled = u * count as f64;
            let whole = scaled.floor();
            (whole as usize % count, scaled - whole)
        };

        let first = data.values[left];
        if data.snap {
            return first;
        }
        let second = data.values[(left + 1) % count];
        first + (second - first) * frac
    }
}

fn parse_table(name: &str, contents: &str) -> TableData {
    let mut data = TableData::default();
    let mut tokens = DefTokeniser::new(contents);

    while let Some(token) = tokens.next_token() {
        match token.to_ascii_lowercase().as_str() {
            "snap" => data.snap = true,
            "clamp" => data.clamp = true,
            "{" => {
                while let Some(value) = tokens.next_token() {
                    match value.as_str() {
                        "}" => break,
                        "," => {}
                        _ => match value.parse::<f64>() {
                            Ok(v) => data.values.push(v),
                            Err(_) => tracing::warn!("[shaders] Invalid value '{}' in table {}", value, name),
                        },
                    }
                }
            }
            other => tracing::warn!("[shaders] Unknown token '{}' in table {}", other, name),
        }
    }
    data
}

impl Declaration for TableDefinition {
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

impl fmt::Debug for TableDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableDefinition").field("name", &self.decl_name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::DeclarationBlockSyntax;

    fn setup_table(contents: &str) -> TableDefinition {
        let table = TableDefinition::new("test");
        table.set_block_syntax(DeclarationBlockSyntax::new("table", "test", contents));
        table
    }

    #[test]
    fn test_parse_flags_and_values() {
        let table = setup_table(" snap clamp { 0, 0.5, 1 } ");
        assert!(table.is_snapped());
        assert!(table.is_clamped());
        assert_eq!(table.values(), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_snapped_lookup_steps() {
        let table = setup_table(" snap { 10, 20, 30, 40 } ");
        assert!((table.lookup(0.0) - 10.0).abs() < 1e-12);
        assert!((table.lookup(0.24) - 10.0).abs() < 1e-12);
        assert!((table.lookup(0.25) - 20.0).abs() < 1e-12);
        assert!((table.lookup(0.99) - 40.0).abs() < 1e-12);
        // wraps without clamp
        assert!((table.lookup(1.25) - 20.0).abs() < 1e-12);
        assert!((table.lookup(-0.25) - 40.0).abs() < 1e-12);
    }

    #[test]
    fn test_interpolated_lookup_wraps_around() {
        let table = setup_table(" { 0, 1 } ");
        assert!((table.lookup(0.25) - 0.5).abs() < 1e-12);
        assert!((table.lookup(0.75) - 0.5).abs() < 1e-12);
        assert!((table.lookup(0.5) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_clamped_lookup_saturates_below() {
        let table = setup_table(" clamp { 3, 5 } ");
        assert!((table.lookup(-4.0) - 3.0).abs() < 1e-12);
        assert!((table.lookup(0.25) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_table_is_zero() {
        let table = setup_table(" { } ");
        assert!(table.lookup(0.3).abs() < 1e-12);
    }

    #[test]
    fn test_reassigning_block_drops_cache() {
        let table = setup_table(" { 1 } ");
        assert!((table.lookup(0.0) - 1.0).abs() < 1e-12);
        table.set_block_contents(" { 7 } ".to_string());
        assert!((table.lookup(0.0) - 7.0).abs() < 1e-12);
    }
}
