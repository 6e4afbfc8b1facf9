//! Canonical type nodes.
//!
//! The registry resolves raw catalogue descriptors into these frozen
//! nodes. Inheritance is replaced by clone-and-mutate: extending a parent
//! produces a fresh node carrying the parent's shape plus the child's
//! attribute overrides; arrays wrap their element instead of subclassing.

use std::sync::Arc;

use indexmap::IndexMap;
use log::warn;

use crate::adapters::transport::Transport;
use crate::core::attrs::{
    parse_bool, parse_float, parse_int, AttributeSet, ATTR_DEFAULT, ATTR_IGNORED,
    ATTR_LOWER_BORDER, ATTR_ON_CHANGE, ATTR_ON_CLEAR, ATTR_ON_GET, ATTR_ON_SET, ATTR_READ_ONLY,
    ATTR_UPPER_BORDER,
};
use crate::core::model::{Dimension, RawChild, RawSymbolDescriptor, RawTypeDescriptor, WireKind};
use crate::core::value::Value;
use crate::error::MirrorError;

/// Event-name overrides attached via `onset` / `onget` / `onclear` /
/// `onchange` attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventAliases {
    pub on_set: Option<String>,
    pub on_get: Option<String>,
    pub on_clear: Option<String>,
    pub on_change: Option<String>,
}

impl EventAliases {
    fn merge(&mut self, attrs: &AttributeSet) {
        if let Some(v) = attrs.get(ATTR_ON_SET) {
            self.on_set = Some(v.to_string());
        }
        if let Some(v) = attrs.get(ATTR_ON_GET) {
            self.on_get = Some(v.to_string());
        }
        if let Some(v) = attrs.get(ATTR_ON_CLEAR) {
            self.on_clear = Some(v.to_string());
        }
        if let Some(v) = attrs.get(ATTR_ON_CHANGE) {
            self.on_change = Some(v.to_string());
        }
    }
}

/// Attributes common to every type node.
#[derive(Clone, Debug)]
pub struct TypeBase {
    pub name: String,
    pub kind: WireKind,
    /// Byte offset within the enclosing composite (0 for top-level types).
    pub offset: u32,
    pub byte_size: u32,
    pub read_only: bool,
    /// Effective default; `None` on composites, whose clear semantics go
    /// through their leaves.
    pub default_value: Option<Value>,
    /// `default_value` pre-encoded for the wire; kept consistent by every
    /// mutation that touches the default.
    pub default_raw: Vec<u8>,
    pub aliases: EventAliases,
}

impl TypeBase {
    fn from_raw(raw: &RawTypeDescriptor, attrs: &AttributeSet) -> Self {
        let mut aliases = EventAliases::default();
        aliases.merge(attrs);
        Self {
            name: raw.name.clone(),
            kind: raw.kind,
            offset: raw.offset,
            byte_size: raw.byte_size,
            read_only: attrs.flag(ATTR_READ_ONLY),
            default_value: None,
            default_raw: Vec::new(),
            aliases,
        }
    }
}

/// Accepted numeric range. Integer kinds carry exact `i128` bounds so the
/// full 64-bit ranges are representable; float kinds use `f64`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Bounds {
    Int { lower: i128, upper: i128 },
    Float { lower: f64, upper: f64 },
}

impl Bounds {
    /// The kind's natural range.
    pub fn natural(kind: WireKind) -> Self {
        match kind {
            WireKind::Int8 => Bounds::Int {
                lower: i8::MIN as i128,
                upper: i8::MAX as i128,
            },
            WireKind::UInt8 => Bounds::Int {
                lower: 0,
                upper: u8::MAX as i128,
            },
            WireKind::Int16 => Bounds::Int {
                lower: i16::MIN as i128,
                upper: i16::MAX as i128,
            },
            WireKind::UInt16 => Bounds::Int {
                lower: 0,
                upper: u16::MAX as i128,
            },
            WireKind::Int32 => Bounds::Int {
                lower: i32::MIN as i128,
                upper: i32::MAX as i128,
            },
            WireKind::UInt32 => Bounds::Int {
                lower: 0,
                upper: u32::MAX as i128,
            },
            WireKind::Int64 => Bounds::Int {
                lower: i64::MIN as i128,
                upper: i64::MAX as i128,
            },
            WireKind::UInt64 => Bounds::Int {
                lower: 0,
                upper: u64::MAX as i128,
            },
            WireKind::Real32 => Bounds::Float {
                lower: f32::MIN as f64,
                upper: f32::MAX as f64,
            },
            _ => Bounds::Float {
                lower: f64::MIN,
                upper: f64::MAX,
            },
        }
    }

    pub fn contains_int(&self, value: i128) -> bool {
        match self {
            Bounds::Int { lower, upper } => *lower <= value && value <= *upper,
            Bounds::Float { lower, upper } => *lower <= value as f64 && value as f64 <= *upper,
        }
    }

    pub fn contains_float(&self, value: f64) -> bool {
        match self {
            Bounds::Int { lower, upper } => *lower as f64 <= value && value <= *upper as f64,
            Bounds::Float { lower, upper } => *lower <= value && value <= *upper,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NumericType {
    pub base: TypeBase,
    pub bounds: Bounds,
}

#[derive(Clone, Debug)]
pub struct StringType {
    pub base: TypeBase,
    /// Accepted length in code units; narrow strings reserve one byte for
    /// the terminator, wide strings one 16-bit unit.
    pub max_len: usize,
    pub wide: bool,
}

#[derive(Clone, Debug)]
pub struct EnumType {
    pub base: TypeBase,
    /// Qualified member names (`Type.Member`) in declaration order.
    pub fields: Vec<String>,
    /// Qualified name -> pre-encoded bytes of the underlying value.
    pub encoding: IndexMap<String, Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct StructType {
    pub base: TypeBase,
    /// Members in declaration order; nodes are shared between clones.
    pub members: Vec<(String, Arc<TypeNode>)>,
    pub rpc_methods: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ArrayType {
    pub base: TypeBase,
    pub element: Arc<TypeNode>,
    pub dimensions: Vec<Dimension>,
}

#[derive(Clone, Debug)]
pub enum TypeNode {
    Boolean(TypeBase),
    Numeric(NumericType),
    String(StringType),
    Enum(EnumType),
    Struct(StructType),
    Array(ArrayType),
}

/// Attribute/offset override applied when a node is cloned for a struct
/// member, a derived type or a concrete symbol.
#[derive(Clone, Debug, Default)]
pub struct Mutator {
    pub attributes: AttributeSet,
    pub offset: Option<u32>,
    pub rename: Option<String>,
    pub byte_size: Option<u32>,
}

impl Mutator {
    pub fn from_type_child(child: &RawChild) -> Self {
        Self {
            attributes: AttributeSet::from_pairs(&child.attributes),
            offset: Some(child.offset),
            rename: None,
            byte_size: None,
        }
    }

    pub fn from_symbol(raw: &RawSymbolDescriptor) -> Self {
        Self {
            attributes: AttributeSet::from_pairs(&raw.attributes),
            offset: None,
            rename: None,
            byte_size: None,
        }
    }

    /// Mutator for parent extension: the derived type takes over name,
    /// size and offset of the extending raw entry.
    pub fn from_extension(raw: &RawTypeDescriptor) -> Self {
        Self {
            attributes: AttributeSet::from_pairs(&raw.attributes),
            offset: Some(raw.offset),
            rename: Some(raw.name.clone()),
            byte_size: (raw.byte_size > 0).then_some(raw.byte_size),
        }
    }
}

fn qualify_enum_member(type_name: &str, member: &str) -> String {
    let member = member.trim();
    if member.contains('.') {
        member.to_string()
    } else {
        format!("{type_name}.{member}")
    }
}

fn int_value(kind: WireKind, value: i128) -> Value {
    if kind.is_unsigned() {
        Value::UInt(value.max(0) as u64)
    } else {
        Value::Int(value as i64)
    }
}

async fn encode_default(
    codec: &dyn Transport,
    type_name: &str,
    value: &Value,
) -> Result<Vec<u8>, MirrorError> {
    codec
        .convert_to_raw(value, type_name)
        .await
        .map_err(|source| MirrorError::ToRawFailed {
            path: type_name.to_string(),
            source,
        })
}

impl TypeNode {
    pub fn base(&self) -> &TypeBase {
        match self {
            TypeNode::Boolean(base) => base,
            TypeNode::Numeric(n) => &n.base,
            TypeNode::String(s) => &s.base,
            TypeNode::Enum(e) => &e.base,
            TypeNode::Struct(s) => &s.base,
            TypeNode::Array(a) => &a.base,
        }
    }

    fn base_mut(&mut self) -> &mut TypeBase {
        match self {
            TypeNode::Boolean(base) => base,
            TypeNode::Numeric(n) => &mut n.base,
            TypeNode::String(s) => &mut s.base,
            TypeNode::Enum(e) => &mut e.base,
            TypeNode::Struct(s) => &mut s.base,
            TypeNode::Array(a) => &mut a.base,
        }
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    pub fn byte_size(&self) -> u32 {
        self.base().byte_size
    }

    pub fn offset(&self) -> u32 {
        self.base().offset
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            TypeNode::Boolean(_) => "boolean",
            TypeNode::Numeric(_) => "numeric",
            TypeNode::String(_) => "string",
            TypeNode::Enum(_) => "enum",
            TypeNode::Struct(_) => "struct",
            TypeNode::Array(_) => "array",
        }
    }

    pub(crate) async fn new_boolean(
        raw: &RawTypeDescriptor,
        codec: &dyn Transport,
    ) -> Result<Option<TypeNode>, MirrorError> {
        let attrs = AttributeSet::from_pairs(&raw.attributes);
        if attrs.flag(ATTR_IGNORED) {
            return Ok(None);
        }
        let mut base = TypeBase::from_raw(raw, &attrs);
        let default = attrs.get(ATTR_DEFAULT).map(parse_bool).unwrap_or(false);
        base.default_value = Some(Value::Bool(default));
        base.default_raw = encode_default(codec, &base.name, &Value::Bool(default)).await?;
        Ok(Some(TypeNode::Boolean(base)))
    }

    pub(crate) async fn new_numeric(
        raw: &RawTypeDescriptor,
        codec: &dyn Transport,
    ) -> Result<Option<TypeNode>, MirrorError> {
        let attrs = AttributeSet::from_pairs(&raw.attributes);
        if attrs.flag(ATTR_IGNORED) {
            return Ok(None);
        }
        let mut base = TypeBase::from_raw(raw, &attrs);
        let mut bounds = Bounds::natural(raw.kind);
        narrow_bounds(&mut bounds, &attrs);

        let default = numeric_default(raw.kind, &bounds, &attrs);
        base.default_raw = encode_default(codec, &base.name, &default).await?;
        base.default_value = Some(default);
        Ok(Some(TypeNode::Numeric(NumericType { base, bounds })))
    }

    pub(crate) async fn new_string(
        raw: &RawTypeDescriptor,
        codec: &dyn Transport,
    ) -> Result<Option<TypeNode>, MirrorError> {
        let attrs = AttributeSet::from_pairs(&raw.attributes);
        if attrs.flag(ATTR_IGNORED) {
            return Ok(None);
        }
        let mut base = TypeBase::from_raw(raw, &attrs);
        let wide = raw.kind == WireKind::WString;
        let max_len = string_capacity(raw.byte_size, wide);
        let default = Value::String(attrs.get(ATTR_DEFAULT).unwrap_or("").to_string());
        base.default_raw = encode_default(codec, &base.name, &default).await?;
        base.default_value = Some(default);
        Ok(Some(TypeNode::String(StringType {
            base,
            max_len,
            wide,
        })))
    }

    /// Enum built from a raw entry carrying enum fields; the underlying
    /// numeric identity is discarded. Defaults come from the pre-encoded
    /// field bytes, never from the codec.
    pub(crate) fn new_enum(raw: &RawTypeDescriptor) -> Option<TypeNode> {
        let attrs = AttributeSet::from_pairs(&raw.attributes);
        if attrs.flag(ATTR_IGNORED) || raw.enum_fields.is_empty() {
            return None;
        }
        let mut base = TypeBase::from_raw(raw, &attrs);

        let mut fields = Vec::with_capacity(raw.enum_fields.len());
        let mut encoding = IndexMap::with_capacity(raw.enum_fields.len());
        for field in &raw.enum_fields {
            let qualified = qualify_enum_member(&raw.name, &field.name);
            fields.push(qualified.clone());
            encoding.insert(qualified, field.raw.clone());
        }

        let mut default = fields[0].clone();
        if let Some(text) = attrs.get(ATTR_DEFAULT) {
            let qualified = qualify_enum_member(&raw.name, text);
            if encoding.contains_key(&qualified) {
                default = qualified;
            } else {
                warn!("enum {}: default {text} is not a member, keeping {default}", raw.name);
            }
        }
        base.default_raw = encoding[&default].clone();
        base.default_value = Some(Value::String(default));
        Some(TypeNode::Enum(EnumType {
            base,
            fields,
            encoding,
        }))
    }

    pub(crate) fn new_struct(
        raw: &RawTypeDescriptor,
        members: Vec<(String, Arc<TypeNode>)>,
    ) -> Option<TypeNode> {
        let attrs = AttributeSet::from_pairs(&raw.attributes);
        if attrs.flag(ATTR_IGNORED) || members.is_empty() {
            return None;
        }
        let base = TypeBase::from_raw(raw, &attrs);
        Some(TypeNode::Struct(StructType {
            base,
            members,
            rpc_methods: raw.rpc_method_names.clone(),
        }))
    }

    /// Deep copy with an attribute/offset override applied. Struct members
    /// stay shared (they are immutable once registered). Returns `None`
    /// when the mutator marks the node ignored; re-encodes the default
    /// bytes whenever the mutation changed the default or the buffer size.
    pub async fn clone_with(
        &self,
        mutator: &Mutator,
        codec: &dyn Transport,
    ) -> Result<Option<TypeNode>, MirrorError> {
        let attrs = &mutator.attributes;
        if attrs.flag(ATTR_IGNORED) {
            return Ok(None);
        }

        let mut node = self.clone();
        let mut reencode = false;
        let is_string = matches!(self, TypeNode::String(_));
        {
            let base = node.base_mut();
            if let Some(name) = &mutator.rename {
                base.name = name.clone();
            }
            if let Some(size) = mutator.byte_size {
                if size != base.byte_size {
                    base.byte_size = size;
                    reencode = is_string;
                }
            }
            if let Some(offset) = mutator.offset {
                base.offset = offset;
            }
            if attrs.flag(ATTR_READ_ONLY) {
                base.read_only = true;
            }
            base.aliases.merge(attrs);
        }

        match &mut node {
            TypeNode::Boolean(base) => {
                if let Some(text) = attrs.get(ATTR_DEFAULT) {
                    base.default_value = Some(Value::Bool(parse_bool(text)));
                    reencode = true;
                }
            }
            TypeNode::Numeric(numeric) => {
                narrow_bounds(&mut numeric.bounds, attrs);
                if let Some(text) = attrs.get(ATTR_DEFAULT) {
                    if let Some(value) = parse_numeric_text(numeric.base.kind, text) {
                        numeric.base.default_value = Some(value);
                        reencode = true;
                    } else {
                        warn!(
                            "numeric {}: unparseable default {text:?}, keeping previous",
                            numeric.base.name
                        );
                    }
                } else if attrs.get(ATTR_LOWER_BORDER).is_some() {
                    if let Some(raised) = raise_default_to_lower(numeric) {
                        numeric.base.default_value = Some(raised);
                        reencode = true;
                    }
                }
            }
            TypeNode::String(string) => {
                string.max_len = string_capacity(string.base.byte_size, string.wide);
                if let Some(text) = attrs.get(ATTR_DEFAULT) {
                    string.base.default_value = Some(Value::String(text.to_string()));
                    reencode = true;
                }
            }
            TypeNode::Enum(en) => {
                if let Some(text) = attrs.get(ATTR_DEFAULT) {
                    let qualified = qualify_enum_member(&en.base.name, text);
                    match en.encoding.get(&qualified) {
                        Some(raw) => {
                            en.base.default_raw = raw.clone();
                            en.base.default_value = Some(Value::String(qualified));
                        }
                        None => warn!(
                            "enum {}: default {text} is not a member, keeping previous",
                            en.base.name
                        ),
                    }
                }
            }
            TypeNode::Struct(_) | TypeNode::Array(_) => {}
        }

        if reencode {
            let (name, value) = {
                let base = node.base();
                (base.name.clone(), base.default_value.clone())
            };
            if let Some(value) = value {
                let raw = encode_default(codec, &name, &value).await?;
                node.base_mut().default_raw = raw;
            }
        }
        Ok(Some(node))
    }

    /// Parent extension: the resolved parent absorbs a raw entry of the
    /// same wire kind.
    pub async fn extend(
        &self,
        raw: &RawTypeDescriptor,
        codec: &dyn Transport,
    ) -> Result<Option<TypeNode>, MirrorError> {
        if !raw.array_dimensions.is_empty() {
            let attrs = AttributeSet::from_pairs(&raw.attributes);
            if attrs.flag(ATTR_IGNORED) {
                return Ok(None);
            }
            let mut base = TypeBase::from_raw(raw, &attrs);
            base.read_only = base.read_only || self.base().read_only;
            return Ok(Some(TypeNode::Array(ArrayType {
                base,
                element: Arc::new(self.clone()),
                dimensions: raw.array_dimensions.clone(),
            })));
        }

        if !raw.enum_fields.is_empty()
            && matches!(self, TypeNode::Numeric(_) | TypeNode::Enum(_))
        {
            // The extending raw re-classifies; a parent's own enum
            // identity is discarded.
            return Ok(TypeNode::new_enum(raw));
        }

        self.clone_with(&Mutator::from_extension(raw), codec).await
    }
}

fn string_capacity(byte_size: u32, wide: bool) -> usize {
    if wide {
        ((byte_size / 2).saturating_sub(1)) as usize
    } else {
        byte_size.saturating_sub(1) as usize
    }
}

fn narrow_bounds(bounds: &mut Bounds, attrs: &AttributeSet) {
    match bounds {
        Bounds::Int { lower, upper } => {
            if let Some(v) = attrs.get(ATTR_LOWER_BORDER).and_then(parse_int) {
                *lower = v;
            }
            if let Some(v) = attrs.get(ATTR_UPPER_BORDER).and_then(parse_int) {
                *upper = v;
            }
        }
        Bounds::Float { lower, upper } => {
            if let Some(v) = attrs.get(ATTR_LOWER_BORDER).and_then(parse_float) {
                *lower = v;
            }
            if let Some(v) = attrs.get(ATTR_UPPER_BORDER).and_then(parse_float) {
                *upper = v;
            }
        }
    }
}

fn parse_numeric_text(kind: WireKind, text: &str) -> Option<Value> {
    if kind.is_float() {
        parse_float(text).map(Value::Float)
    } else {
        parse_int(text).map(|n| int_value(kind, n))
    }
}

fn numeric_default(kind: WireKind, bounds: &Bounds, attrs: &AttributeSet) -> Value {
    if let Some(text) = attrs.get(ATTR_DEFAULT) {
        if let Some(value) = parse_numeric_text(kind, text) {
            return value;
        }
        warn!("unparseable numeric default {text:?}, using lower border");
    }
    if attrs.get(ATTR_LOWER_BORDER).is_some() {
        return match bounds {
            Bounds::Int { lower, .. } => int_value(kind, *lower),
            Bounds::Float { lower, .. } => Value::Float(*lower),
        };
    }
    if kind.is_float() {
        Value::Float(0.0)
    } else {
        int_value(kind, 0)
    }
}

/// Default must not fall below a freshly-narrowed lower border.
fn raise_default_to_lower(numeric: &NumericType) -> Option<Value> {
    let current = numeric.base.default_value.as_ref()?;
    match (&numeric.bounds, current) {
        (Bounds::Int { lower, .. }, value) => {
            let v = value.as_i128()?;
            (v < *lower).then(|| int_value(numeric.base.kind, *lower))
        }
        (Bounds::Float { lower, .. }, value) => {
            let v = value.as_f64()?;
            (v < *lower).then(|| Value::Float(*lower))
        }
    }
}
