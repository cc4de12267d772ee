//! Doom 3 `.map` / `.pfb` text format (version 2).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use indexmap::IndexMap;

use super::MapError;
use super::format::{ImportFilter, MapFormat, MapReader, MapWriter, PrimitiveParser};
use crate::eclass::EntityClassManager;
use crate::math::{Plane3, Vector3};
use crate::parser::{DefTokeniser, MAP_DELIMITERS, ParseError};
use crate::scene::{Brush, Entity, Face, KEY_CLASSNAME, Node, NodeData, Patch, PatchControl, TextureMatrix};

pub const MAP_VERSION_D3: f64 = 2.0;
pub const GAME_TYPE_DOOM3: &str = "doom3";

fn next_i32(tok: &mut DefTokeniser<'_>) -> Result<i32, ParseError> {
    let value = tok.next_i64()?;
    i32::try_from(value).map_err(|_| tok.syntax_error(format!("integer {value} out of range")))
}

fn next_usize(tok: &mut DefTokeniser<'_>) -> Result<usize, ParseError> {
    let value = tok.next_i64()?;
    usize::try_from(value).map_err(|_| tok.syntax_error(format!("invalid size {value}")))
}

fn parse_vector(tok: &mut DefTokeniser<'_>) -> Result<Vector3, ParseError> {
    tok.assert_next("(")?;
    let v = Vector3::new(tok.next_f64()?, tok.next_f64()?, tok.next_f64()?);
    tok.assert_next(")")?;
    Ok(v)
}

fn parse_texture_matrix(tok: &mut DefTokeniser<'_>) -> Result<TextureMatrix, ParseError> {
    tok.assert_next("(")?;
    let mut rows = [[0.0; 3]; 2];
    for row in &mut rows {
        tok.assert_next("(")?;
        for value in row.iter_mut() {
            *value = tok.next_f64()?;
        }
        tok.assert_next(")")?;
    }
    tok.assert_next(")")?;
    Ok(TextureMatrix { rows })
}

fn parse_face_tail(tok: &mut DefTokeniser<'_>, plane: Plane3) -> Result<Face, ParseError> {
    let texture = parse_texture_matrix(tok)?;
    let shader = tok.require_token()?;
    let flags = [next_i32(tok)?, next_i32(tok)?, next_i32(tok)?];
    Ok(Face {
        plane,
        texture,
        shader,
        flags,
    })
}

/// Faces given as `( a b c d )` plane equations.
pub struct BrushDef3Parser;

impl PrimitiveParser for BrushDef3Parser {
    fn keyword(&self) -> &'static str {
        "brushDef3"
    }

    fn parse(&self, tok: &mut DefTokeniser<'_>) -> Result<NodeData, ParseError> {
        tok.assert_next("{")?;
        let mut brush = Brush::default();
        loop {
            let token = tok.require_token()?;
            if token == "}" {
                break;
            }
            if token != "(" {
                return Err(tok.syntax_error(format!("expected '(' or '}}', found '{token}'")));
            }
            let normal = Vector3::new(tok.next_f64()?, tok.next_f64()?, tok.next_f64()?);
            let dist = -tok.next_f64()?;
            tok.assert_next(")")?;
            brush.faces.push(parse_face_tail(tok, Plane3::new(normal, dist))?);
        }
        Ok(NodeData::Brush(brush))
    }
}

/// Older brush primitive with three-point planes.
pub struct BrushDefParser;

impl PrimitiveParser for BrushDefParser {
    fn keyword(&self) -> &'static str {
        "brushDef"
    }

    fn parse(&self, tok: &mut DefTokeniser<'_>) -> Result<NodeData, ParseError> {
        tok.assert_next("{")?;
        let mut brush = Brush::default();
        loop {
            let token = tok.require_token()?;
            if token == "}" {
                break;
            }
            tok.push_back(token);
            let p0 = parse_vector(tok)?;
            let p1 = parse_vector(tok)?;
            let p2 = parse_vector(tok)?;
            brush.faces.push(parse_face_tail(tok, Plane3::from_points(p0, p1, p2))?);
        }
        Ok(NodeData::Brush(brush))
    }
}

fn parse_patch(tok: &mut DefTokeniser<'_>, fixed: bool) -> Result<NodeData, ParseError> {
    tok.assert_next("{")?;
    let shader = tok.require_token()?;

    tok.assert_next("(")?;
    let width = next_usize(tok)?;
    let height = next_usize(tok)?;
    let subdivisions = if fixed {
        let x = u32::try_from(tok.next_i64()?).map_err(|_| tok.syntax_error("invalid subdivision"))?;
        let y = u32::try_from(tok.next_i64()?).map_err(|_| tok.syntax_error("invalid subdivision"))?;
        Some((x, y))
    } else {
        None
    };
    let flags = [next_i32(tok)?, next_i32(tok)?, next_i32(tok)?];
    tok.assert_next(")")?;

    if width == 0 || height == 0 {
        return Err(tok.syntax_error("patch dimensions must be positive"));
    }

    let mut patch = Patch::new(&shader, width, height);
    patch.fixed_subdivisions = subdivisions;
    patch.flags = flags;

    tok.assert_next("(")?;
    for column in 0..width {
        tok.assert_next("(")?;
        for row in 0..height {
            tok.assert_next("(")?;
            let control = PatchControl {
                vertex: Vector3::new(tok.next_f64()?, tok.next_f64()?, tok.next_f64()?),
                u: tok.next_f64()?,
                v: tok.next_f64()?,
            };
            tok.assert_next(")")?;
            if let Some(slot) = patch.control_mut(column, row) {
                *slot = control;
            }
        }
        tok.assert_next(")")?;
    }
    tok.assert_next(")")?;
    tok.assert_next("}")?;
    Ok(NodeData::Patch(patch))
}

pub struct PatchDef2Parser;

impl PrimitiveParser for PatchDef2Parser {
    fn keyword(&self) -> &'static str {
        "patchDef2"
    }

    fn parse(&self, tok: &mut DefTokeniser<'_>) -> Result<NodeData, ParseError> {
        parse_patch(tok, false)
    }
}

/// Patch with fixed tessellation.
pub struct PatchDef3Parser;

impl PrimitiveParser for PatchDef3Parser {
    fn keyword(&self) -> &'static str {
        "patchDef3"
    }

    fn parse(&self, tok: &mut DefTokeniser<'_>) -> Result<NodeData, ParseError> {
        parse_patch(tok, true)
    }
}

// ============================================================================
// Reader
// ============================================================================

pub struct Doom3MapReader {
    classes: Arc<EntityClassManager>,
    parsers: HashMap<&'static str, Arc<dyn PrimitiveParser>>,
    entity_count: usize,
    primitive_count: usize,
}

impl Doom3MapReader {
    pub fn new(classes: Arc<EntityClassManager>) -> Self {
        let mut reader = Self {
            classes,
            parsers: HashMap::new(),
            entity_count: 0,
            primitive_count: 0,
        };
        reader.add_primitive_parser(Arc::new(BrushDefParser));
        reader.add_primitive_parser(Arc::new(BrushDef3Parser));
        reader.add_primitive_parser(Arc::new(PatchDef2Parser));
        reader.add_primitive_parser(Arc::new(PatchDef3Parser));
        reader
    }

    pub fn add_primitive_parser(&mut self, parser: Arc<dyn PrimitiveParser>) {
        self.parsers.insert(parser.keyword(), parser);
    }

    #[allow(clippy::float_cmp)]
    fn parse_version(tok: &mut DefTokeniser<'_>) -> Result<(), MapError> {
        tok.assert_next("Version").map_err(|e| {
            tracing::error!("[mapdoom3] Unable to parse map version: {}", e);
            MapError::InvalidVersion(e.to_string())
        })?;
        let found = tok.next_f64().map_err(|e| {
            tracing::error!("[mapdoom3] Unable to parse map version: {}", e);
            MapError::InvalidVersion(e.to_string())
        })?;

        if found != MAP_VERSION_D3 {
            let error = MapError::VersionMismatch {
                required: MAP_VERSION_D3,
                found,
            };
            tracing::error!("[mapdoom3] {}", error);
            return Err(error);
        }
        Ok(())
    }

    fn create_entity(&self, key_values: &IndexMap<String, String>) -> Result<Arc<Node>, MapError> {
        let Some(classname) = key_values.get(KEY_CLASSNAME) else {
            return Err(MapError::Parse {
                entity: self.entity_count,
                message: "could not find classname".to_string(),
            });
        };

        let class = self.classes.find_or_insert(classname, true);
        let mut entity = Entity::new(class);
        for (key, value) in key_values {
            entity.set_key_value(key, value);
        }
        Ok(Node::new(NodeData::Entity(entity)))
    }

    fn parse_primitive(
        &mut self,
        tok: &mut DefTokeniser<'_>,
        entity: &Arc<Node>,
        filter: &dyn ImportFilter,
    ) -> Result<(), MapError> {
        self.primitive_count += 1;
        let keyword = tok.require_token()?;
        let Some(parser) = self.parsers.get(keyword.as_str()).cloned() else {
            return Err(MapError::UnknownPrimitive {
                entity: self.entity_count,
                keyword,
            });
        };

        let data = parser.parse(tok).map_err(|e| MapError::Parse {
            entity: self.entity_count,
            message: format!("Primitive #{}: parse exception {}", self.primitive_count, e),
        })?;
        tok.assert_next("}")?;

        filter.add_primitive_to_entity(Node::new(data), entity);
        Ok(())
    }

    fn parse_entity(&mut self, tok: &mut DefTokeniser<'_>, filter: &dyn ImportFilter) -> Result<(), MapError> {
        tok.assert_next("{")?;
        self.primitive_count = 0;

        let mut key_values: IndexMap<String, String> = IndexMap::new();
        let mut entity: Option<Arc<Node>> = None;

        loop {
            let token = tok.require_token()?;
            if token == "{" {
                let node = match &entity {
                    Some(node) => node.clone(),
                    None => {
                        let node = self.create_entity(&key_values)?;
                        entity = Some(node.clone());
                        node
                    }
                };
                self.parse_primitive(tok, &node, filter)?;
            } else if token == "}" {
                break;
            } else {
                let value = tok.require_token()?;
                if value == "{" || value == "}" {
                    return Err(MapError::Parse {
                        entity: self.entity_count,
                        message: format!("Parsed invalid value '{value}' for key '{token}'"),
                    });
                }
                key_values.insert(token, value);
            }
        }

        let node = match entity {
            Some(node) => node,
            None => self.create_entity(&key_values)?,
        };
        filter.add_entity(node);
        Ok(())
    }
}

impl MapReader for Doom3MapReader {
    fn read_from_str(&mut self, text: &str, filter: &dyn ImportFilter) -> Result<(), MapError> {
        let mut tok = DefTokeniser::with_delimiters(text, MAP_DELIMITERS);
        Self::parse_version(&mut tok)?;

        self.entity_count = 0;
        while tok.has_more_tokens() {
            self.parse_entity(&mut tok, filter).map_err(|e| match e {
                e @ (MapError::Parse { .. } | MapError::UnknownPrimitive { .. }) => e,
                other => MapError::Parse {
                    entity: self.entity_count,
                    message: other.to_string(),
                },
            })?;
            self.entity_count += 1;
        }
        Ok(())
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Avoids writing `-0`.
fn num(value: f64) -> f64 {
    if value == 0.0 { 0.0 } else { value }
}

#[derive(Default)]
pub struct Doom3MapWriter {
    entity_count: usize,
    primitive_count: usize,
}

impl Doom3MapWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin_primitive(&mut self, keyword: &str, out: &mut String) {
        let _ = writeln!(out, "// primitive {}", self.primitive_count);
        let _ = writeln!(out, "{{\n{keyword}\n{{");
        self.primitive_count += 1;
    }
}

impl MapWriter for Doom3MapWriter {
    fn begin_write_map(&mut self, out: &mut String) {
        let _ = writeln!(out, "Version {}", MAP_VERSION_D3);
    }

    fn begin_write_entity(&mut self, entity: &Entity, out: &mut String) {
        let _ = writeln!(out, "// entity {}", self.entity_count);
        out.push_str("{\n");
        for (key, value) in entity.key_values() {
            let _ = writeln!(out, "\"{key}\" \"{value}\"");
        }
        self.primitive_count = 0;
    }

    fn end_write_entity(&mut self, _entity: &Entity, out: &mut String) {
        out.push_str("}\n");
        self.entity_count += 1;
    }

    fn write_brush(&mut self, brush: &Brush, out: &mut String) {
        self.begin_primitive("brushDef3", out);
        for face in &brush.faces {
            let n = face.plane.normal;
            let [s, t] = face.texture.rows;
            let _ = writeln!(
                out,
                "( {} {} {} {} ) ( ( {} {} {} ) ( {} {} {} ) ) \"{}\" {} {} {}",
                num(n.x),
                num(n.y),
                num(n.z),
                num(-face.plane.dist),
                num(s[0]),
                num(s[1]),
                num(s[2]),
                num(t[0]),
                num(t[1]),
                num(t[2]),
                face.shader,
                face.flags[0],
                face.flags[1],
                face.flags[2],
            );
        }
        out.push_str("}\n}\n");
    }

    fn write_patch(&mut self, patch: &Patch, out: &mut String) {
        let keyword = if patch.fixed_subdivisions.is_some() { "patchDef3" } else { "patchDef2" };
        self.begin_primitive(keyword, out);
        let _ = writeln!(out, "\"{}\"", patch.shader);

        let [f0, f1, f2] = patch.flags;
        match patch.fixed_subdivisions {
            Some((x, y)) => {
                let _ = writeln!(out, "( {} {} {x} {y} {f0} {f1} {f2} )", patch.width, patch.height);
            }
            None => {
                let _ = writeln!(out, "( {} {} {f0} {f1} {f2} )", patch.width, patch.height);
            }
        }

        out.push_str("(\n");
        for column in 0..patch.width {
            out.push('(');
            for row in 0..patch.height {
                if let Some(c) = patch.control(column, row) {
                    let _ = write!(
                        out,
                        " ( {} {} {} {} {} )",
                        num(c.vertex.x),
                        num(c.vertex.y),
                        num(c.vertex.z),
                        num(c.u),
                        num(c.v)
                    );
                }
            }
            out.push_str(" )\n");
        }
        out.push_str(")\n}\n}\n");
    }
}

// ============================================================================
// Format
// ============================================================================

pub struct Doom3MapFormat {
    classes: Arc<EntityClassManager>,
}

impl Doom3MapFormat {
    pub fn new(classes: Arc<EntityClassManager>) -> Self {
        Self { classes }
    }
}

impl MapFormat for Doom3MapFormat {
    fn name(&self) -> &'static str {
        "Doom 3"
    }

    fn game_type(&self) -> &'static str {
        GAME_TYPE_DOOM3
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["map", "pfb"]
    }

    fn create_reader(&self) -> Box<dyn MapReader + '_> {
        Box::new(Doom3MapReader::new(self.classes.clone()))
    }

    fn create_writer(&self) -> Box<dyn MapWriter + '_> {
        Box::new(Doom3MapWriter::new())
    }

    #[allow(clippy::float_cmp)]
    fn can_load(&self, text: &str) -> bool {
        let mut tok = DefTokeniser::with_delimiters(text, MAP_DELIMITERS);
        tok.assert_next("Version").is_ok() && tok.next_f64().is_ok_and(|v| v == MAP_VERSION_D3)
    }
}
