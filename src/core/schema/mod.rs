//! Extent types: parsed field layouts shared by every extent of a type.
//!
//! A type is described in JSON and expanded into a fixed record layout.
//! Types are interned process-wide on their canonical description, so two
//! registrations of the same description yield the same `Arc` and pointer
//! comparison is a valid identity test.

mod layout;
pub mod library;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

pub use library::ExtentTypeLibrary;

/// Prefix shared by the types the container itself uses.
pub const RESERVED_PREFIX: &str = "ExtentStore::";
pub const TYPE_DEFINITION_NAME: &str = "ExtentStore::TypeDefinition";
pub const INDEX_TYPE_NAME: &str = "ExtentStore::Index";

/// Field kinds accepted in a description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Bool,
    Byte,
    Int32,
    Int64,
    Double,
    Variable32,
    Fixedwidth,
}

/// Record padding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadRecord {
    /// Records are always a multiple of 8 bytes.
    #[default]
    Original,
    /// Records are padded to the widest column.
    MaxColumnSize,
}

/// Order in which column groups are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOrdering {
    #[default]
    SmallToBig,
    BigToSmall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Width of a `fixedwidth` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub nullable: bool,
    /// Identical values of this variable32 field may share storage.
    #[serde(default, skip_serializing_if = "is_false")]
    pub pack_unique: bool,
    /// Store int32/int64 values as a delta from this field; naming the
    /// field itself means "the previous record".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_relative: Option<String>,
    /// Round doubles to a multiple of this value before compression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_scale: Option<f64>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Parsed form of a type description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeDescription {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub pack_pad_record: PadRecord,
    #[serde(default)]
    pub field_ordering: FieldOrdering,
    pub fields: Vec<FieldDescription>,
}

impl TypeDescription {
    pub fn parse(description: &str) -> Result<Self> {
        serde_json::from_str(description)
            .map_err(|err| Error::format(format!("bad type description: {err}")))
    }

    pub fn canonical(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|err| Error::format(format!("cannot serialize type description: {err}")))
    }
}

/// Runtime kind of a field, with the width of fixed-width fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Byte,
    Int32,
    Int64,
    Double,
    Variable32,
    FixedWidth(usize),
}

impl FieldKind {
    /// Bytes occupied in the fixed record. Booleans occupy one bit.
    pub fn size(self) -> usize {
        match self {
            FieldKind::Bool => 0,
            FieldKind::Byte => 1,
            FieldKind::Int32 | FieldKind::Variable32 => 4,
            FieldKind::Int64 | FieldKind::Double => 8,
            FieldKind::FixedWidth(size) => size,
        }
    }
}

/// Location of a bit inside the fixed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitPos {
    pub offset: usize,
    pub mask: u8,
}

#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    kind: FieldKind,
    offset: usize,
    bit_mask: u8,
    null: Option<BitPos>,
    unique: bool,
}

impl Field {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bit within the byte at `offset`; only meaningful for booleans.
    pub fn bit_mask(&self) -> u8 {
        self.bit_mask
    }

    /// Position of the hidden null flag, if the field is nullable.
    pub fn null_bit(&self) -> Option<BitPos> {
        self.null
    }

    pub fn is_nullable(&self) -> bool {
        self.null.is_some()
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }
}

/// Value transform applied to one column when a frame is encoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum PackOp {
    /// Delta from the same column of the previous record.
    DeltaPrevI32 { offset: usize },
    DeltaPrevI64 { offset: usize },
    /// Double rounded to a multiple of `scale`, stored as the step count
    /// delta from the previous record.
    DeltaPrevScaledF64 { offset: usize, scale: f64 },
    /// Delta from another column of the same record.
    DeltaFieldI32 { offset: usize, base: usize },
    DeltaFieldI64 { offset: usize, base: usize },
    /// Round to a multiple of `scale`.
    Scale { offset: usize, scale: f64 },
}

#[derive(Debug)]
pub struct ExtentType {
    name: String,
    namespace: String,
    major: u32,
    minor: u32,
    description: String,
    fields: Vec<Field>,
    by_name: HashMap<String, usize>,
    record_size: usize,
    flip4: Vec<usize>,
    flip8: Vec<usize>,
    variable_fields: Vec<usize>,
    pack_ops: Vec<PackOp>,
}

impl ExtentType {
    /// Parse, lay out and intern a description.
    pub fn from_description(description: &str) -> Result<Arc<ExtentType>> {
        let parsed = TypeDescription::parse(description)?;
        Self::from_parsed(parsed)
    }

    pub fn from_parsed(parsed: TypeDescription) -> Result<Arc<ExtentType>> {
        let canonical = parsed.canonical()?;
        let table = interned();
        let mut table = table.lock();
        if let Some(existing) = table.get(&canonical).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let built = Arc::new(layout::build(parsed, canonical.clone())?);
        table.retain(|_, weak| weak.strong_count() > 0);
        table.insert(canonical, Arc::downgrade(&built));
        Ok(built)
    }

    /// Type of the first extent in every file; one record per description.
    pub fn type_definition() -> Arc<ExtentType> {
        static TYPE: OnceLock<Arc<ExtentType>> = OnceLock::new();
        TYPE.get_or_init(|| {
            reserved_type(TYPE_DEFINITION_NAME, &[("description", FieldType::Variable32)])
        })
        .clone()
    }

    /// Type of the trailing index extent.
    pub fn index_type() -> Arc<ExtentType> {
        static TYPE: OnceLock<Arc<ExtentType>> = OnceLock::new();
        TYPE.get_or_init(|| {
            reserved_type(
                INDEX_TYPE_NAME,
                &[("offset", FieldType::Int64), ("extent_type", FieldType::Variable32)],
            )
        })
        .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn major_version(&self) -> u32 {
        self.major
    }

    pub fn minor_version(&self) -> u32 {
        self.minor
    }

    /// Canonical JSON description, as stored in files.
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Visible fields in declaration order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Result<&Field> {
        self.by_name
            .get(name)
            .map(|&idx| &self.fields[idx])
            .ok_or_else(|| {
                Error::type_mismatch(format!("no field '{name}' in type '{}'", self.name))
            })
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn is_reserved(&self) -> bool {
        self.name.starts_with(RESERVED_PREFIX)
    }

    /// A reader needing `major.minor` accepts the same major and any
    /// minor at least as new.
    pub fn is_compatible(&self, major: u32, minor: u32) -> bool {
        self.major == major && self.minor >= minor
    }

    pub(crate) fn flip4_offsets(&self) -> &[usize] {
        &self.flip4
    }

    pub(crate) fn flip8_offsets(&self) -> &[usize] {
        &self.flip8
    }

    /// Fixed-record offsets of variable32 fields, with their uniqueness flag.
    pub(crate) fn variable_fields(&self) -> impl Iterator<Item = (usize, bool)> + '_ {
        self.variable_fields
            .iter()
            .map(|&idx| (self.fields[idx].offset, self.fields[idx].unique))
    }

    pub(crate) fn pack_ops(&self) -> &[PackOp] {
        &self.pack_ops
    }
}

impl PartialEq for ExtentType {
    fn eq(&self, other: &Self) -> bool {
        self.description == other.description
    }
}

impl Eq for ExtentType {}

fn interned() -> &'static Mutex<HashMap<String, Weak<ExtentType>>> {
    static TABLE: OnceLock<Mutex<HashMap<String, Weak<ExtentType>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn reserved_type(name: &str, fields: &[(&str, FieldType)]) -> Arc<ExtentType> {
    let parsed = TypeDescription {
        name: name.to_string(),
        namespace: "extentstore".to_string(),
        version: "1.0".to_string(),
        pack_pad_record: PadRecord::Original,
        field_ordering: FieldOrdering::SmallToBig,
        fields: fields
            .iter()
            .map(|(name, field_type)| FieldDescription {
                name: name.to_string(),
                field_type: *field_type,
                size: None,
                nullable: false,
                pack_unique: false,
                pack_relative: None,
                pack_scale: None,
            })
            .collect(),
    };
    // Built-in layouts are constant.
    match ExtentType::from_parsed(parsed) {
        Ok(built) => built,
        Err(err) => unreachable!("built-in type {name} rejected: {err}"),
    }
}

pub(crate) fn parse_version(version: &str) -> Result<(u32, u32)> {
    if version.is_empty() {
        return Ok((0, 0));
    }
    let bad = || Error::format(format!("bad version '{version}', expected major.minor"));
    let (major, minor) = version.split_once('.').ok_or_else(bad)?;
    Ok((
        major.parse().map_err(|_| bad())?,
        minor.parse().map_err(|_| bad())?,
    ))
}
