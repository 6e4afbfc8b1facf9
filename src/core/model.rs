//! Stable wire-side data model.
//!
//! Everything in this module is what the transport hands us verbatim:
//! byte-range pointers, bulk I/O packages and the raw catalogue
//! descriptors fetched at connect time. The resolved forms live in
//! `core::types` and `symbols`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::value::Value;

/// A byte range in the controller's address space.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Pointer {
    pub index_group: u32,
    pub index_offset: u32,
    pub size: u32,
}

impl Pointer {
    pub fn new(index_group: u32, index_offset: u32, size: u32) -> Self {
        Self {
            index_group,
            index_offset,
            size,
        }
    }

    /// One past the last byte covered by this pointer.
    pub fn end(&self) -> u32 {
        self.index_offset + self.size
    }
}

/// One item of a bulk read result or a bulk write request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawPackage {
    pub index_group: u32,
    pub index_offset: u32,
    pub data: Vec<u8>,
}

impl RawPackage {
    pub fn new(index_group: u32, index_offset: u32, data: Vec<u8>) -> Self {
        Self {
            index_group,
            index_offset,
            data,
        }
    }

    pub fn pointer(&self) -> Pointer {
        Pointer::new(self.index_group, self.index_offset, self.data.len() as u32)
    }
}

/// Numeric type tag carried by the wire protocol for every catalogue entry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WireKind {
    Void,
    Int16,
    Int32,
    Real32,
    Real64,
    Int8,
    UInt8,
    UInt16,
    UInt32,
    Int64,
    UInt64,
    String,
    WString,
    Bit,
    Composite,
    #[serde(other)]
    Unknown,
}

impl WireKind {
    pub fn from_raw(tag: u32) -> Self {
        match tag {
            0 => WireKind::Void,
            2 => WireKind::Int16,
            3 => WireKind::Int32,
            4 => WireKind::Real32,
            5 => WireKind::Real64,
            16 => WireKind::Int8,
            17 => WireKind::UInt8,
            18 => WireKind::UInt16,
            19 => WireKind::UInt32,
            20 => WireKind::Int64,
            21 => WireKind::UInt64,
            30 => WireKind::String,
            31 => WireKind::WString,
            33 => WireKind::Bit,
            65 => WireKind::Composite,
            _ => WireKind::Unknown,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            WireKind::Int8
                | WireKind::UInt8
                | WireKind::Int16
                | WireKind::UInt16
                | WireKind::Int32
                | WireKind::UInt32
                | WireKind::Int64
                | WireKind::UInt64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, WireKind::Real32 | WireKind::Real64)
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_string(self) -> bool {
        matches!(self, WireKind::String | WireKind::WString)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            WireKind::UInt8 | WireKind::UInt16 | WireKind::UInt32 | WireKind::UInt64
        )
    }
}

/// One array dimension: `[start_index .. start_index + length)`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Dimension {
    pub start_index: i32,
    pub length: u32,
}

/// Declared member of a composite raw type.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawChild {
    pub member_name: String,
    pub type_name: String,
    /// Byte offset of the member within the enclosing type.
    pub offset: u32,
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
}

/// One enum member as delivered by the catalogue: name plus the
/// pre-encoded bytes of its underlying numeric value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnumField {
    pub name: String,
    pub raw: Vec<u8>,
}

/// A type descriptor exactly as fetched from the controller.
///
/// Array entries carry the element type in `parent_name` and the
/// *element's* wire kind in `kind`; the dimensions mark them as arrays.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawTypeDescriptor {
    pub name: String,
    #[serde(default)]
    pub parent_name: String,
    pub kind: WireKind,
    pub byte_size: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
    #[serde(default)]
    pub children: Vec<RawChild>,
    #[serde(default)]
    pub array_dimensions: Vec<Dimension>,
    #[serde(default)]
    pub enum_fields: Vec<EnumField>,
    #[serde(default)]
    pub rpc_method_names: Vec<String>,
}

impl RawTypeDescriptor {
    /// A plain primitive entry of the kind the controller seeds its
    /// catalogue with (`BOOL`, `INT`, `REAL`, ...).
    pub fn primitive(name: &str, kind: WireKind, byte_size: u32) -> Self {
        Self {
            name: name.to_string(),
            parent_name: String::new(),
            kind,
            byte_size,
            offset: 0,
            attributes: Vec::new(),
            children: Vec::new(),
            array_dimensions: Vec::new(),
            enum_fields: Vec::new(),
            rpc_method_names: Vec::new(),
        }
    }
}

/// A top-level variable descriptor exactly as fetched from the controller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawSymbolDescriptor {
    /// Dotted path, e.g. `MAIN.numericValue`.
    pub full_path: String,
    pub type_name: String,
    pub pointer: Pointer,
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
}

/// Result of a controller-side method invocation.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct RpcResult {
    pub return_value: Option<Value>,
    pub outputs: IndexMap<String, Value>,
}
