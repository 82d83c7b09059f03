//! In-memory batch of records of one type.
//!
//! The fixed area holds `n_records * record_size` bytes; the variable area is
//! a pool of length-prefixed slots referenced by offset from variable32
//! fields. The pool starts with four zero bytes so offset 0 can mean "empty".
//! Each slot begins at an offset `p` with `(p + 4) % 8 == 0`: a native
//! 32-bit length, the bytes, then zero padding up to the next slot.
//!
//! Values are kept in host byte order; conversion happens in the frame codec.

use std::sync::Arc;

use crate::core::schema::{ExtentType, Field, FieldKind};
use crate::core::{Error, Result};

pub(crate) const VARIABLE_HEADER: usize = 4;

/// Bytes a slot occupies after its length word.
pub(crate) fn variable_roundup(size: usize) -> usize {
    size + (12 - size % 8) % 8
}

fn has_variable_header(variable: &[u8]) -> bool {
    variable.len() >= VARIABLE_HEADER && variable[..VARIABLE_HEADER] == [0u8; VARIABLE_HEADER]
}

#[derive(Debug)]
pub struct Extent {
    schema: Arc<ExtentType>,
    fixed: Vec<u8>,
    variable: Vec<u8>,
}

impl Extent {
    pub fn new(schema: Arc<ExtentType>) -> Self {
        Self {
            schema,
            fixed: Vec::new(),
            variable: vec![0u8; VARIABLE_HEADER],
        }
    }

    pub(crate) fn from_parts(
        schema: Arc<ExtentType>,
        fixed: Vec<u8>,
        variable: Vec<u8>,
    ) -> Result<Self> {
        if fixed.len() % schema.record_size() != 0 {
            return Err(Error::format(format!(
                "fixed area of {} bytes is not a multiple of record size {} for '{}'",
                fixed.len(),
                schema.record_size(),
                schema.name()
            )));
        }
        if !has_variable_header(&variable) {
            return Err(Error::format("variable area must start with four zero bytes"));
        }
        Ok(Self {
            schema,
            fixed,
            variable,
        })
    }

    pub fn schema(&self) -> &Arc<ExtentType> {
        &self.schema
    }

    pub fn type_name(&self) -> &str {
        self.schema.name()
    }

    pub fn n_records(&self) -> usize {
        self.fixed.len() / self.schema.record_size()
    }

    pub fn is_empty(&self) -> bool {
        self.fixed.is_empty()
    }

    /// Total bytes held by both areas.
    pub fn size(&self) -> usize {
        self.fixed.len() + self.variable.len()
    }

    pub fn fixed_data(&self) -> &[u8] {
        &self.fixed
    }

    pub fn variable_data(&self) -> &[u8] {
        &self.variable
    }

    /// Move the records out, leaving this extent empty with the same type.
    pub fn take(&mut self) -> Extent {
        let replacement = Extent::new(Arc::clone(&self.schema));
        std::mem::replace(self, replacement)
    }

    pub fn clear(&mut self) {
        self.fixed.clear();
        self.variable.clear();
        self.variable.resize(VARIABLE_HEADER, 0);
    }

    /// Append `n` zeroed records and return the index of the first one.
    pub fn create_records(&mut self, n: usize) -> usize {
        let first = self.n_records();
        self.fixed.resize(self.fixed.len() + n * self.schema.record_size(), 0);
        first
    }

    pub fn append_record(&mut self) -> usize {
        self.create_records(1)
    }

    fn at(&self, row: usize, field: &Field) -> usize {
        assert!(row < self.n_records(), "row {row} out of range");
        row * self.schema.record_size() + field.offset()
    }

    fn word<const N: usize>(&self, pos: usize) -> [u8; N] {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.fixed[pos..pos + N]);
        bytes
    }

    fn set_word(&mut self, row: usize, field: &Field, bytes: &[u8]) {
        let pos = self.at(row, field);
        self.fixed[pos..pos + bytes.len()].copy_from_slice(bytes);
        self.mark_present(row, field);
    }

    fn mark_present(&mut self, row: usize, field: &Field) {
        if let Some(bit) = field.null_bit() {
            let pos = row * self.schema.record_size() + bit.offset;
            self.fixed[pos] &= !bit.mask;
        }
    }

    pub fn is_null(&self, row: usize, field: &Field) -> bool {
        match field.null_bit() {
            Some(bit) => {
                assert!(row < self.n_records(), "row {row} out of range");
                self.fixed[row * self.schema.record_size() + bit.offset] & bit.mask != 0
            }
            None => false,
        }
    }

    /// Mark a nullable field null or present. Has no effect on non-nullable fields.
    pub fn set_null(&mut self, row: usize, field: &Field, null: bool) {
        let Some(bit) = field.null_bit() else {
            return;
        };
        assert!(row < self.n_records(), "row {row} out of range");
        let pos = row * self.schema.record_size() + bit.offset;
        if null {
            self.fixed[pos] |= bit.mask;
        } else {
            self.fixed[pos] &= !bit.mask;
        }
    }

    pub fn get_bool(&self, row: usize, field: &Field) -> bool {
        debug_assert_eq!(field.kind(), FieldKind::Bool);
        self.fixed[self.at(row, field)] & field.bit_mask() != 0
    }

    pub fn set_bool(&mut self, row: usize, field: &Field, value: bool) {
        debug_assert_eq!(field.kind(), FieldKind::Bool);
        let pos = self.at(row, field);
        if value {
            self.fixed[pos] |= field.bit_mask();
        } else {
            self.fixed[pos] &= !field.bit_mask();
        }
        self.mark_present(row, field);
    }

    pub fn get_byte(&self, row: usize, field: &Field) -> u8 {
        debug_assert_eq!(field.kind(), FieldKind::Byte);
        self.fixed[self.at(row, field)]
    }

    pub fn set_byte(&mut self, row: usize, field: &Field, value: u8) {
        debug_assert_eq!(field.kind(), FieldKind::Byte);
        self.set_word(row, field, &[value]);
    }

    pub fn get_i32(&self, row: usize, field: &Field) -> i32 {
        debug_assert_eq!(field.kind(), FieldKind::Int32);
        i32::from_ne_bytes(self.word(self.at(row, field)))
    }

    pub fn set_i32(&mut self, row: usize, field: &Field, value: i32) {
        debug_assert_eq!(field.kind(), FieldKind::Int32);
        self.set_word(row, field, &value.to_ne_bytes());
    }

    pub fn get_i64(&self, row: usize, field: &Field) -> i64 {
        debug_assert_eq!(field.kind(), FieldKind::Int64);
        i64::from_ne_bytes(self.word(self.at(row, field)))
    }

    pub fn set_i64(&mut self, row: usize, field: &Field, value: i64) {
        debug_assert_eq!(field.kind(), FieldKind::Int64);
        self.set_word(row, field, &value.to_ne_bytes());
    }

    pub fn get_f64(&self, row: usize, field: &Field) -> f64 {
        debug_assert_eq!(field.kind(), FieldKind::Double);
        f64::from_ne_bytes(self.word(self.at(row, field)))
    }

    pub fn set_f64(&mut self, row: usize, field: &Field, value: f64) {
        debug_assert_eq!(field.kind(), FieldKind::Double);
        self.set_word(row, field, &value.to_ne_bytes());
    }

    pub fn get_fixed(&self, row: usize, field: &Field) -> &[u8] {
        let pos = self.at(row, field);
        &self.fixed[pos..pos + field.kind().size()]
    }

    /// Copy into a fixed-width field, zero filling a short value.
    pub fn set_fixed(&mut self, row: usize, field: &Field, value: &[u8]) -> Result<()> {
        let FieldKind::FixedWidth(width) = field.kind() else {
            return Err(Error::type_mismatch(format!("field '{}' is not fixedwidth", field.name())));
        };
        if value.len() > width {
            return Err(Error::format(format!(
                "{} bytes do not fit fixedwidth field '{}' of {width}",
                value.len(),
                field.name()
            )));
        }
        let mut padded = vec![0u8; width];
        padded[..value.len()].copy_from_slice(value);
        self.set_word(row, field, &padded);
        Ok(())
    }

    /// Read a variable32 value. Fails on a dangling or malformed reference.
    pub fn get_bytes(&self, row: usize, field: &Field) -> Result<&[u8]> {
        debug_assert_eq!(field.kind(), FieldKind::Variable32);
        let offset = u32::from_ne_bytes(self.word(self.at(row, field))) as usize;
        self.slot(offset)
    }

    /// Store a variable32 value in a new slot. Empty values use offset 0.
    pub fn set_bytes(&mut self, row: usize, field: &Field, value: &[u8]) -> Result<()> {
        debug_assert_eq!(field.kind(), FieldKind::Variable32);
        let offset = self.append_slot(value)?;
        self.set_word(row, field, &offset.to_ne_bytes());
        Ok(())
    }

    pub(crate) fn append_slot(&mut self, value: &[u8]) -> Result<u32> {
        if value.is_empty() {
            return Ok(0);
        }
        let offset = self.variable.len();
        let end = offset + 4 + variable_roundup(value.len());
        if end > i32::MAX as usize {
            return Err(Error::format("variable area exceeds 2 GiB"));
        }
        self.variable.extend_from_slice(&(value.len() as u32).to_ne_bytes());
        self.variable.extend_from_slice(value);
        self.variable.resize(end, 0);
        Ok(offset as u32)
    }

    pub(crate) fn slot(&self, offset: usize) -> Result<&[u8]> {
        slot_at(&self.variable, offset)
    }

    /// Check every variable32 reference and the zero padding of its slot.
    pub fn selfcheck(&self) -> Result<()> {
        if !has_variable_header(&self.variable) {
            return Err(Error::format("variable area must start with four zero bytes"));
        }
        let record_size = self.schema.record_size();
        for row in 0..self.n_records() {
            for (field_offset, _) in self.schema.variable_fields() {
                let pos = row * record_size + field_offset;
                let offset = u32::from_ne_bytes(self.word(pos)) as usize;
                if offset == 0 {
                    continue;
                }
                let value = self.slot(offset)?;
                let padding_start = offset + 4 + value.len();
                let padding_end = offset + 4 + variable_roundup(value.len());
                if self.variable[padding_start..padding_end].iter().any(|b| *b != 0) {
                    return Err(Error::format(format!(
                        "non-zero padding in variable slot at offset {offset}"
                    )));
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fixed_mut(&mut self) -> &mut [u8] {
        &mut self.fixed
    }
}

/// Resolve a slot in a host-order variable area.
pub(crate) fn slot_at(variable: &[u8], offset: usize) -> Result<&[u8]> {
    if offset == 0 {
        return Ok(&[]);
    }
    if (offset + 4) % 8 != 0 || offset + 4 > variable.len() {
        return Err(Error::format(format!("bad variable offset {offset}")));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&variable[offset..offset + 4]);
    let len = i32::from_ne_bytes(len);
    if len < 0 {
        return Err(Error::format(format!("negative variable length at offset {offset}")));
    }
    let len = len as usize;
    if offset + 4 + variable_roundup(len) > variable.len() {
        return Err(Error::format(format!("variable slot at offset {offset} overruns the area")));
    }
    Ok(&variable[offset + 4..offset + 4 + len])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<ExtentType> {
        ExtentType::from_description(
            r#"{"name": "Extent::Test", "version": "1.0", "fields": [
                {"name": "flag", "type": "bool", "nullable": true},
                {"name": "code", "type": "byte"},
                {"name": "count", "type": "int32", "nullable": true},
                {"name": "total", "type": "int64"},
                {"name": "ratio", "type": "double"},
                {"name": "name", "type": "variable32"},
                {"name": "tag", "type": "fixedwidth", "size": 5}
            ]}"#,
        )
        .expect("schema")
    }

    #[test]
    fn test_roundup_keeps_slots_aligned() {
        for size in 1..64 {
            let slot = 4 + variable_roundup(size);
            assert_eq!(slot % 8, 0, "size {size}");
            assert!(variable_roundup(size) >= size);
        }
    }

    #[test]
    fn test_set_and_get_every_kind() {
        let ty = schema();
        let mut extent = Extent::new(Arc::clone(&ty));
        let row = extent.append_record();
        let f = |name| ty.field(name).expect("field");

        extent.set_bool(row, f("flag"), true);
        extent.set_byte(row, f("code"), 7);
        extent.set_i32(row, f("count"), -42);
        extent.set_i64(row, f("total"), 1 << 40);
        extent.set_f64(row, f("ratio"), 0.25);
        extent.set_bytes(row, f("name"), b"hello").expect("bytes");
        extent.set_fixed(row, f("tag"), b"ab").expect("fixed");

        assert!(extent.get_bool(row, f("flag")));
        assert_eq!(extent.get_byte(row, f("code")), 7);
        assert_eq!(extent.get_i32(row, f("count")), -42);
        assert_eq!(extent.get_i64(row, f("total")), 1 << 40);
        assert_eq!(extent.get_f64(row, f("ratio")), 0.25);
        assert_eq!(extent.get_bytes(row, f("name")).expect("bytes"), b"hello");
        assert_eq!(extent.get_fixed(row, f("tag")), b"ab\0\0\0");
        assert!(extent.set_fixed(row, f("tag"), b"too long").is_err());
        extent.selfcheck().expect("selfcheck");
    }

    #[test]
    fn test_null_flags() {
        let ty = schema();
        let mut extent = Extent::new(Arc::clone(&ty));
        let count = ty.field("count").expect("count");
        let row = extent.append_record();
        assert!(!extent.is_null(row, count));
        extent.set_null(row, count, true);
        assert!(extent.is_null(row, count));
        extent.set_i32(row, count, 3);
        assert!(!extent.is_null(row, count));

        let code = ty.field("code").expect("code");
        extent.set_null(row, code, true);
        assert!(!extent.is_null(row, code));
    }

    #[test]
    fn test_take_leaves_empty_extent() {
        let ty = schema();
        let mut extent = Extent::new(Arc::clone(&ty));
        extent.create_records(10);
        let moved = extent.take();
        assert_eq!(moved.n_records(), 10);
        assert_eq!(extent.n_records(), 0);
        assert!(Arc::ptr_eq(extent.schema(), &ty));
        assert_eq!(extent.variable_data(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_empty_value_uses_offset_zero() {
        let ty = schema();
        let mut extent = Extent::new(Arc::clone(&ty));
        let name = ty.field("name").expect("name");
        let row = extent.append_record();
        extent.set_bytes(row, name, b"").expect("bytes");
        assert_eq!(extent.variable_data().len(), VARIABLE_HEADER);
        assert_eq!(extent.get_bytes(row, name).expect("bytes"), b"");
    }

    #[test]
    fn test_selfcheck_detects_bad_offset() {
        let ty = schema();
        let mut extent = Extent::new(Arc::clone(&ty));
        let name = ty.field("name").expect("name");
        let row = extent.append_record();
        extent.set_bytes(row, name, b"abc").expect("bytes");
        let pos = row * ty.record_size() + name.offset();
        extent.fixed_mut()[pos..pos + 4].copy_from_slice(&6u32.to_ne_bytes());
        assert!(extent.selfcheck().is_err());
        assert!(extent.get_bytes(row, name).is_err());

        extent.fixed_mut()[pos..pos + 4].copy_from_slice(&4u32.to_ne_bytes());
        extent.selfcheck().expect("restored");
        let last = extent.variable.len() - 1;
        extent.variable[last] = 1;
        assert!(extent.selfcheck().is_err());
    }
}
