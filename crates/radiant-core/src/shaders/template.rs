//! Parsed form of a `material` declaration and its canonical text generator.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::expression::ShaderExpression;
use super::table::{NoTables, TableLookup};
use crate::decl::{DeclType, Declaration, DeclarationBase};
use crate::parser::DefTokeniser;

/// Surface keywords kept as plain flags, in their canonical spelling.
const SURFACE_FLAGS: &[&str] = &[
    "twoSided",
    "translucent",
    "noShadows",
    "noSelfShadow",
    "forceShadows",
    "noOverlays",
    "forceOverlays",
    "forceOpaque",
    "noFog",
    "noPortalFog",
    "unsmoothedTangents",
    "mirror",
    "solid",
    "water",
    "playerclip",
    "monsterclip",
    "moveableclip",
    "ikclip",
    "blood",
    "trigger",
    "aassolid",
    "aasobstacle",
    "flashlight_trigger",
    "nonsolid",
    "nullNormal",
    "areaportal",
    "qer_nocarve",
    "discrete",
    "noFragment",
    "slick",
    "collision",
    "noimpact",
    "nodamage",
    "ladder",
    "nosteps",
    "nodraw",
    "lightFalloffImage",
    "fogLight",
    "blendLight",
    "ambientLight",
];

fn canonical_flag(token: &str) -> Option<&'static str> {
    SURFACE_FLAGS.iter().copied().find(|flag| flag.eq_ignore_ascii_case(token))
}

// ============================================================================
// Stage building blocks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageKind {
    Diffuse,
    Bump,
    Specular,
    #[default]
    Blend,
}

impl StageKind {
    fn shortcut(self) -> Option<&'static str> {
        match self {
            Self::Diffuse => Some("diffusemap"),
            Self::Bump => Some("bumpmap"),
            Self::Specular => Some("specularmap"),
            Self::Blend => None,
        }
    }

    fn from_shortcut(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_lowercase().as_str() {
            "diffusemap" => Some(Self::Diffuse),
            "bumpmap" => Some(Self::Bump),
            "specularmap" => Some(Self::Specular),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlendFunc {
    /// Shorthand such as `add`, `blend`, `diffusemap`.
    Named(String),
    Explicit { src: String, dest: String },
}

impl BlendFunc {
    fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split(',').map(str::trim).filter(|p| !p.is_empty());
        let first = parts.next()?.to_string();
        Some(match parts.next() {
            Some(dest) => Self::Explicit {
                src: first,
                dest: dest.to_string(),
            },
            None => Self::Named(first),
        })
    }
}

impl fmt::Display for BlendFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Explicit { src, dest } => write!(f, "{src}, {dest}"),
        }
    }
}

/// Image source of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapExpression {
    Image(String),
    /// Engine-provided image such as `_currentRender` or `_black`.
    Builtin(String),
    /// Image function such as `heightmap(...)` or `addnormals(...)`.
    Function { name: String, args: Vec<MapExpression>, extra: Vec<String> },
}

impl MapExpression {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Some(open) = text.find('(') {
            let name = text[..open].trim().to_string();
            let inner = text[open + 1..].trim_end().strip_suffix(')').unwrap_or(&text[open + 1..]);
            let mut args = Vec::new();
            let mut extra = Vec::new();
            for arg in split_top_level(inner) {
                let arg = arg.trim();
                if arg.parse::<f64>().is_ok() {
                    extra.push(arg.to_string());
                } else {
                    args.push(Self::parse(arg));
                }
            }
            return Self::Function { name, args, extra };
        }
        if text.starts_with('_') {
            Self::Builtin(text.to_string())
        } else {
            Self::Image(text.to_string())
        }
    }

    /// First plain image referenced by the expression.
    pub fn image_path(&self) -> Option<&str> {
        match self {
            Self::Image(path) => Some(path),
            Self::Builtin(_) => None,
            Self::Function { args, .. } => args.iter().find_map(Self::image_path),
        }
    }
}

impl fmt::Display for MapExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(path) | Self::Builtin(path) => f.write_str(path),
            Self::Function { name, args, extra } => {
                let parts: Vec<String> = args
                    .iter()
                    .map(ToString::to_string)
                    .chain(extra.iter().cloned())
                    .collect();
                write!(f, "{name}({})", parts.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClampType {
    #[default]
    Repeat,
    Clamp,
    ZeroClamp,
    AlphaZeroClamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VertexColour {
    #[default]
    None,
    Normal,
    Inverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Translate,
    Scale,
    CenterScale,
    Shear,
    Rotate,
}

impl TransformKind {
    fn parse(keyword: &str) -> Option<Self> {
        match keyword {
            "translate" | "scroll" => Some(Self::Translate),
            "scale" => Some(Self::Scale),
            "centerscale" => Some(Self::CenterScale),
            "shear" => Some(Self::Shear),
            "rotate" => Some(Self::Rotate),
            _ => None,
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            Self::Translate => "translate",
            Self::Scale => "scale",
            Self::CenterScale => "centerScale",
            Self::Shear => "shear",
            Self::Rotate => "rotate",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageTransform {
    pub kind: TransformKind,
    pub args: Vec<ShaderExpression>,
}

/// One `{ ... }` rendering stage of a material.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stage {
    pub kind: StageKind,
    pub blend: Option<BlendFunc>,
    pub map: Option<MapExpression>,
    pub condition: Option<ShaderExpression>,
    /// Red, green, blue, alpha.
    pub colour: [Option<ShaderExpression>; 4],
    pub alpha_test: Option<ShaderExpression>,
    pub clamp: ClampType,
    pub vertex_colour: VertexColour,
    pub transforms: Vec<StageTransform>,
    pub vertex_program: Option<String>,
    pub fragment_program: Option<String>,
    pub vertex_parms: BTreeMap<u32, Vec<ShaderExpression>>,
    pub fragment_maps: BTreeMap<u32, String>,
    pub private_polygon_offset: Option<f64>,
    /// Stage keywords without a structured form, kept verbatim.
    pub extra_lines: Vec<String>,
}

impl Stage {
    pub fn new(kind: StageKind, map: &str) -> Self {
        Self {
            kind,
            blend: kind.shortcut().map(|s| BlendFunc::Named(s.to_string())),
            map: Some(MapExpression::parse(map)),
            ..Default::default()
        }
    }

    /// True when the stage can be written as `diffusemap <image>` and friends.
    fn is_shortcut(&self) -> bool {
        self.kind.shortcut().is_some()
            && self.map.is_some()
            && *self
                == Self {
                    kind: self.kind,
                    blend: self.blend.clone(),
                    map: self.map.clone(),
                    ..Default::default()
                }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecalInfo {
    pub stay_seconds: f64,
    pub fade_seconds: f64,
    pub start_colour: [f64; 4],
    pub end_colour: [f64; 4],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deform {
    pub kind: String,
    pub args: String,
}

/// Everything a material declaration states.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterialData {
    pub description: String,
    pub editor_image: Option<String>,
    pub light_falloff_image: Option<String>,
    pub surface_flags: Vec<String>,
    pub polygon_offset: Option<f64>,
    pub sort: Option<String>,
    pub spectrum: Option<i64>,
    pub deform: Option<Deform>,
    pub decal_info: Option<DecalInfo>,
    pub stages: Vec<Stage>,
    /// Global keywords without a structured form, kept verbatim.
    pub extra_lines: Vec<String>,
}

impl MaterialData {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.surface_flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }

    pub fn set_flag(&mut self, flag: &str, enabled: bool) {
        self.surface_flags.retain(|f| !f.eq_ignore_ascii_case(flag));
        if enabled {
            self.surface_flags
                .push(canonical_flag(flag).map_or_else(|| flag.to_string(), str::to_string));
        }
    }

    pub fn stages_of_kind(&self, kind: StageKind) -> impl Iterator<Item = &Stage> {
        self.stages.iter().filter(move |s| s.kind == kind)
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Splits at commas that are not nested in brackets.
pub(crate) fn split_top_level(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current).trim().to_string());
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn parse_expression_list(text: &str, tables: &dyn TableLookup) -> Option<Vec<ShaderExpression>> {
    split_top_level(text)
        .iter()
        .map(|part| ShaderExpression::parse(part, tables))
        .collect()
}

/// Parses the body of a material declaration.
pub fn parse_material(name: &str, contents: &str, tables: &dyn TableLookup) -> MaterialData {
    let mut data = MaterialData::default();
    let mut tokens = DefTokeniser::new(contents);

    while let Some(token) = tokens.next_token() {
        let lower = token.to_ascii_lowercase();
        match lower.as_str() {
            "{" => data.stages.push(parse_stage(name, &mut tokens, tables)),
            "description" => data.description = tokens.next_token().unwrap_or_default(),
            "qer_editorimage" => data.editor_image = tokens.next_token(),
            "lightfalloffimage" => data.light_falloff_image = Some(tokens.rest_of_line()),
            "polygonoffset" => {
                let rest = tokens.rest_of_line();
                data.polygon_offset = Some(rest.parse().unwrap_or(1.0));
            }
            "sort" => data.sort = tokens.next_token(),
            "spectrum" => data.spectrum = tokens.next_i64().ok(),
            "deform" => {
                let rest = tokens.rest_of_line();
                let (kind, args) = rest.split_once(char::is_whitespace).unwrap_or((rest.as_str(), ""));
                data.deform = Some(Deform {
                    kind: kind.to_string(),
                    args: args.trim().to_string(),
                });
            }
            "decalinfo" => {
                let rest = tokens.rest_of_line();
                data.decal_info = parse_decal_info(&rest);
                if data.decal_info.is_none() {
                    tracing::warn!("[shaders] Invalid decalInfo '{}' in material {}", rest, name);
                }
            }
            _ => {
                if let Some(kind) = StageKind::from_shortcut(&lower) {
                    let map = tokens.rest_of_line();
                    data.stages.push(Stage::new(kind, &map));
                } else if let Some(flag) = canonical_flag(&token) {
                    data.surface_flags.push(flag.to_string());
                } else {
                    let rest = tokens.rest_of_line();
                    data.extra_lines.push(join_line(&token, &rest));
                }
            }
        }
    }
    data
}

fn join_line(keyword: &str, rest: &str) -> String {
    if rest.is_empty() {
        keyword.to_string()
    } else {
        format!("{keyword} {rest}")
    }
}

fn parse_decal_info(text: &str) -> Option<DecalInfo> {
    let numbers: Vec<f64> = text
        .replace(['(', ')'], " ")
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if numbers.len() != 10 {
        return None;
    }
    Some(DecalInfo {
        stay_seconds: numbers[0],
        fade_seconds: numbers[1],
        start_colour: [numbers[2], numbers[3], numbers[4], numbers[5]],
        end_colour: [numbers[6], numbers[7], numbers[8], numbers[9]],
    })
}

fn parse_stage(material: &str, tokens: &mut DefTokeniser<'_>, tables: &dyn TableLookup) -> Stage {
    let mut stage = Stage::default();

    while let Some(token) = tokens.next_token() {
        let lower = token.to_ascii_lowercase();
        let expression = |text: &str| {
            let parsed = ShaderExpression::parse(text, tables);
            if parsed.is_none() {
                tracing::warn!("[shaders] Invalid expression '{}' in material {}", text, material);
            }
            parsed
        };

        match lower.as_str() {
            "}" => return stage,
            "{" => skip_block(tokens),
            "blend" => {
                stage.blend = BlendFunc::parse(&tokens.rest_of_line());
                if let Some(BlendFunc::Named(name)) = &stage.blend {
                    stage.kind = StageKind::from_shortcut(name).unwrap_or(StageKind::Blend);
                }
            }
            "map" => stage.map = Some(MapExpression::parse(&tokens.rest_of_line())),
            "if" => {
                let rest = tokens.rest_of_line();
                stage.condition = expression(&rest);
            }
            "rgb" | "rgba" | "red" | "green" | "blue" | "alpha" => {
                let rest = tokens.rest_of_line();
                let value = expression(&rest);
                let channels = match lower.as_str() {
                    "rgb" => 0..3,
                    "rgba" => 0..4,
                    "red" => 0..1,
                    "green" => 1..2,
                    "blue" => 2..3,
                    _ => 3..4,
                };
                for channel in channels {
                    stage.colour[channel].clone_from(&value);
                }
            }
            "color" => {
                let rest = tokens.rest_of_line();
                match parse_expression_list(&rest, tables) {
                    Some(values) if values.len() == 4 => {
                        for (slot, value) in stage.colour.iter_mut().zip(values) {
                            *slot = Some(value);
                        }
                    }
                    _ => tracing::warn!("[shaders] Invalid color '{}' in material {}", rest, material),
                }
            }
            "alphatest" => {
                let rest = tokens.rest_of_line();
                stage.alpha_test = expression(&rest);
            }
            "clamp" => stage.clamp = ClampType::Clamp,
            "zeroclamp" => stage.clamp = ClampType::ZeroClamp,
            "alphazeroclamp" => stage.clamp = ClampType::AlphaZeroClamp,
            "vertexcolor" => stage.vertex_colour = VertexColour::Normal,
            "inversevertexcolor" => stage.vertex_colour = VertexColour::Inverse,
            "program" => {
                let program = tokens.next_token();
                stage.vertex_program.clone_from(&program);
                stage.fragment_program = program;
            }
            "vertexprogram" => stage.vertex_program = tokens.next_token(),
            "fragmentprogram" => stage.fragment_program = tokens.next_token(),
            "vertexparm" => {
                let index = tokens.next_i64().ok().and_then(|i| u32::try_from(i).ok());
                let rest = tokens.rest_of_line();
                match (index, parse_expression_list(&rest, tables)) {
                    (Some(index), Some(values)) => {
                        stage.vertex_parms.insert(index, values);
                    }
                    _ => tracing::warn!("[shaders] Invalid vertexParm '{}' in material {}", rest, material),
                }
            }
            "fragmentmap" => {
                let index = tokens.next_i64().ok().and_then(|i| u32::try_from(i).ok());
                let rest = tokens.rest_of_line();
                if let Some(index) = index {
                    stage.fragment_maps.insert(index, rest);
                }
            }
            "privatepolygonoffset" => stage.private_polygon_offset = tokens.next_f64().ok(),
            _ => {
                if let Some(kind) = TransformKind::parse(&lower) {
                    let rest = tokens.rest_of_line();
                    match parse_expression_list(&rest, tables) {
                        Some(args) => stage.transforms.push(StageTransform { kind, args }),
                        None => stage.extra_lines.push(join_line(&token, &rest)),
                    }
                } else {
                    let rest = tokens.rest_of_line();
                    stage.extra_lines.push(join_line(&token, &rest));
                }
            }
        }
    }

    tracing::warn!("[shaders] Missing closing brace in a stage of material {}", material);
    stage
}

fn skip_block(tokens: &mut DefTokeniser<'_>) {
    let mut depth = 1;
    while let Some(token) = tokens.next_token() {
        match token.as_str() {
            "{" => depth += 1,
            "}" => {
                depth -= 1;
                if depth == 0 {
                    return;
                }
            }
            _ => {}
        }
    }
}

// ============================================================================
// Generation
// ============================================================================

fn join_expressions(values: &[ShaderExpression]) -> String {
    values.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Canonical body text for `data`, without the surrounding braces.
pub fn generate_material_text(data: &MaterialData) -> String {
    let mut out = String::new();

    if !data.description.is_empty() {
        let _ = writeln!(out, "\tdescription \"{}\"", data.description);
    }
    if let Some(image) = &data.editor_image {
        let _ = writeln!(out, "\tqer_editorimage {image}");
    }
    if let Some(image) = &data.light_falloff_image {
        let _ = writeln!(out, "\tlightFalloffImage {image}");
    }
    if let Some(offset) = data.polygon_offset {
        let _ = writeln!(out, "\tpolygonOffset {offset}");
    }
    if let Some(sort) = &data.sort {
        let _ = writeln!(out, "\tsort {sort}");
    }
    if let Some(spectrum) = data.spectrum {
        let _ = writeln!(out, "\tspectrum {spectrum}");
    }
    if let Some(deform) = &data.deform {
        let _ = writeln!(out, "\t{}", join_line(&format!("deform {}", deform.kind), &deform.args));
    }
    if let Some(decal) = &data.decal_info {
        let [r0, g0, b0, a0] = decal.start_colour;
        let [r1, g1, b1, a1] = decal.end_colour;
        let _ = writeln!(
            out,
            "\tdecalInfo {} {} ( {r0} {g0} {b0} {a0} ) ( {r1} {g1} {b1} {a1} )",
            decal.stay_seconds, decal.fade_seconds
        );
    }
    for flag in &data.surface_flags {
        let _ = writeln!(out, "\t{flag}");
    }
    for line in &data.extra_lines {
        let _ = writeln!(out, "\t{line}");
    }

    for stage in &data.stages {
        if stage.is_shortcut() {
            if let (Some(keyword), Some(map)) = (stage.kind.shortcut(), &stage.map) {
                let _ = writeln!(out, "\t{keyword} {map}");
                continue;
            }
        }
        write_stage(&mut out, stage);
    }
    out
}

fn write_stage(out: &mut String, stage: &Stage) {
    out.push_str("\t{\n");

    if let Some(condition) = &stage.condition {
        let _ = writeln!(out, "\t\tif {condition}");
    }
    if let Some(blend) = &stage.blend {
        let _ = writeln!(out, "\t\tblend {blend}");
    }
    if let Some(map) = &stage.map {
        let _ = writeln!(out, "\t\tmap {map}");
    }
    match stage.clamp {
        ClampType::Repeat => {}
        ClampType::Clamp => out.push_str("\t\tclamp\n"),
        ClampType::ZeroClamp => out.push_str("\t\tzeroclamp\n"),
        ClampType::AlphaZeroClamp => out.push_str("\t\talphazeroclamp\n"),
    }
    match stage.vertex_colour {
        VertexColour::None => {}
        VertexColour::Normal => out.push_str("\t\tvertexColor\n"),
        VertexColour::Inverse => out.push_str("\t\tinverseVertexColor\n"),
    }
    write_colour(out, &stage.colour);
    if let Some(alpha_test) = &stage.alpha_test {
        let _ = writeln!(out, "\t\talphaTest {alpha_test}");
    }
    for transform in &stage.transforms {
        let _ = writeln!(out, "\t\t{} {}", transform.kind.keyword(), join_expressions(&transform.args));
    }
    if let Some(program) = &stage.vertex_program {
        let _ = writeln!(out, "\t\tvertexProgram {program}");
    }
    for (index, values) in &stage.vertex_parms {
        let _ = writeln!(out, "\t\tvertexParm {index} {}", join_expressions(values));
    }
    if let Some(program) = &stage.fragment_program {
        let _ = writeln!(out, "\t\tfragmentProgram {program}");
    }
    for (index, map) in &stage.fragment_maps {
        let _ = writeln!(out, "\t\tfragmentMap {index} {map}");
    }
    if let Some(offset) = stage.private_polygon_offset {
        let _ = writeln!(out, "\t\tprivatePolygonOffset {offset}");
    }
    for line in &stage.extra_lines {
        let _ = writeln!(out, "\t\t{line}");
    }

    out.push_str("\t}\n");
}

fn write_colour(out: &mut String, colour: &[Option<ShaderExpression>; 4]) {
    let [red, green, blue, alpha] = colour;
    let rgb_equal = red.is_some() && red == green && green == blue;

    if rgb_equal && red == alpha {
        if let Some(value) = red {
            let _ = writeln!(out, "\t\trgba {value}");
        }
        return;
    }

    if rgb_equal {
        if let Some(value) = red {
            let _ = writeln!(out, "\t\trgb {value}");
        }
    } else {
        for (keyword, value) in [("red", red), ("green", green), ("blue", blue)] {
            if let Some(value) = value {
                let _ = writeln!(out, "\t\t{keyword} {value}");
            }
        }
    }
    if let Some(value) = alpha {
        let _ = writeln!(out, "\t\talpha {value}");
    }
}

// ============================================================================
// Declaration
// ============================================================================

/// The declaration behind a material: its text plus a lazily parsed form.
pub struct ShaderTemplate {
    base: DeclarationBase,
    tables: Weak<dyn TableLookup>,
    data: RwLock<Option<Arc<MaterialData>>>,
}

impl ShaderTemplate {
    pub fn new(name: &str, tables: Weak<dyn TableLookup>) -> Self {
        Self {
            base: DeclarationBase::new(DeclType::Material, name),
            tables,
            data: RwLock::new(None),
        }
    }

    pub fn data(&self) -> Arc<MaterialData> {
        if let Some(data) = self.data.read().as_ref() {
            return data.clone();
        }

        let contents = self.block_syntax().contents;
        let parsed = match self.tables.upgrade() {
            Some(tables) => parse_material(&self.decl_name(), &contents, tables.as_ref()),
            None => parse_material(&self.decl_name(), &contents, &NoTables),
        };
        let parsed = Arc::new(parsed);
        *self.data.write() = Some(parsed.clone());
        parsed
    }

    /// Replaces the parsed form and regenerates the block text from it.
    pub fn set_data(&self, data: MaterialData) {
        self.set_block_contents(generate_material_text(&data));
        *self.data.write() = Some(Arc::new(data));
    }
}

impl Declaration for ShaderTemplate {
    fn base(&self) -> &DeclarationBase {
        &self.base
    }

    fn on_syntax_block_assigned(&self) {
        *self.data.write() = None;
    }

    fn generate_syntax(&self) -> String {
        generate_material_text(&self.data())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for ShaderTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderTemplate").field("name", &self.decl_name()).finish()
    }
}
