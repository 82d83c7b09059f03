use std::collections::{HashMap, HashSet};

use crate::core::schema::{
    parse_version, BitPos, ExtentType, Field, FieldKind, FieldOrdering, FieldType, PackOp,
    PadRecord, TypeDescription,
};
use crate::core::{Error, Result};

/// A slot in the fixed record: a visible field or the null flag of one.
#[derive(Clone, Copy)]
enum Column {
    Value(usize),
    Null(usize),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Group {
    Bits,
    Bytes,
    Four,
    Eight,
}

fn group_of(kind: FieldKind) -> Group {
    match kind {
        FieldKind::Bool => Group::Bits,
        FieldKind::Byte | FieldKind::FixedWidth(_) => Group::Bytes,
        FieldKind::Int32 | FieldKind::Variable32 => Group::Four,
        FieldKind::Int64 | FieldKind::Double => Group::Eight,
    }
}

fn pad_to(pos: usize, align: usize) -> usize {
    pos.div_ceil(align) * align
}

pub(super) fn build(parsed: TypeDescription, canonical: String) -> Result<ExtentType> {
    if parsed.name.is_empty() {
        return Err(Error::format("type name is empty"));
    }
    if parsed.name.len() > 255 {
        return Err(Error::format(format!("type name '{}' longer than 255 bytes", parsed.name)));
    }
    if parsed.fields.is_empty() {
        return Err(Error::format(format!("type '{}' has no fields", parsed.name)));
    }
    let (major, minor) = parse_version(&parsed.version)?;

    let mut kinds = Vec::with_capacity(parsed.fields.len());
    let mut by_name = HashMap::new();
    for (idx, desc) in parsed.fields.iter().enumerate() {
        if desc.name.is_empty() || desc.name.starts_with(' ') {
            return Err(Error::format(format!(
                "invalid field name '{}' in type '{}'",
                desc.name, parsed.name
            )));
        }
        if by_name.insert(desc.name.clone(), idx).is_some() {
            return Err(Error::format(format!(
                "duplicate field '{}' in type '{}'",
                desc.name, parsed.name
            )));
        }
        let kind = match (desc.field_type, desc.size) {
            (FieldType::Fixedwidth, Some(size)) if size > 0 => FieldKind::FixedWidth(size),
            (FieldType::Fixedwidth, _) => {
                return Err(Error::format(format!(
                    "fixedwidth field '{}' needs a positive size",
                    desc.name
                )));
            }
            (_, Some(_)) => {
                return Err(Error::format(format!(
                    "size only applies to fixedwidth fields, not '{}'",
                    desc.name
                )));
            }
            (FieldType::Bool, None) => FieldKind::Bool,
            (FieldType::Byte, None) => FieldKind::Byte,
            (FieldType::Int32, None) => FieldKind::Int32,
            (FieldType::Int64, None) => FieldKind::Int64,
            (FieldType::Double, None) => FieldKind::Double,
            (FieldType::Variable32, None) => FieldKind::Variable32,
        };
        kinds.push(kind);
    }

    let mut columns = Vec::new();
    for (idx, desc) in parsed.fields.iter().enumerate() {
        columns.push((Column::Value(idx), kinds[idx]));
        if desc.nullable {
            columns.push((Column::Null(idx), FieldKind::Bool));
        }
    }

    let has = |group: Group| columns.iter().any(|(_, kind)| group_of(*kind) == group);
    let has_four = has(Group::Four);
    let has_eight = has(Group::Eight);
    let original = parsed.pack_pad_record == PadRecord::Original;

    let mut offsets = vec![0usize; parsed.fields.len()];
    let mut masks = vec![0u8; parsed.fields.len()];
    let mut nulls: Vec<Option<BitPos>> = vec![None; parsed.fields.len()];

    let mut pos = 0usize;
    let place_bits = |pos: &mut usize,
                          offsets: &mut Vec<usize>,
                          masks: &mut Vec<u8>,
                          nulls: &mut Vec<Option<BitPos>>| {
        let mut nbits = 0usize;
        for (column, kind) in &columns {
            if *kind != FieldKind::Bool {
                continue;
            }
            let bit = BitPos {
                offset: *pos + nbits / 8,
                mask: 1 << (nbits % 8),
            };
            match column {
                Column::Value(idx) => {
                    offsets[*idx] = bit.offset;
                    masks[*idx] = bit.mask;
                }
                Column::Null(idx) => nulls[*idx] = Some(bit),
            }
            nbits += 1;
        }
        *pos += nbits.div_ceil(8);
    };
    let place_group = |group: Group, pos: &mut usize, offsets: &mut Vec<usize>| {
        for (column, kind) in &columns {
            if let Column::Value(idx) = column {
                if group_of(*kind) == group {
                    offsets[*idx] = *pos;
                    *pos += kind.size();
                }
            }
        }
    };
    // Variable32 columns follow the int32 columns inside the four-byte group.
    let place_four = |pos: &mut usize, offsets: &mut Vec<usize>| {
        for wanted in [FieldKind::Int32, FieldKind::Variable32] {
            for (column, kind) in &columns {
                if let Column::Value(idx) = column {
                    if *kind == wanted {
                        offsets[*idx] = *pos;
                        *pos += 4;
                    }
                }
            }
        }
    };

    match parsed.field_ordering {
        FieldOrdering::SmallToBig => {
            place_bits(&mut pos, &mut offsets, &mut masks, &mut nulls);
            place_group(Group::Bytes, &mut pos, &mut offsets);
            if original || has_four {
                pos = pad_to(pos, 4);
            }
            place_four(&mut pos, &mut offsets);
            if original || has_eight {
                pos = pad_to(pos, 8);
            }
            place_group(Group::Eight, &mut pos, &mut offsets);
        }
        FieldOrdering::BigToSmall => {
            place_group(Group::Eight, &mut pos, &mut offsets);
            place_four(&mut pos, &mut offsets);
            place_group(Group::Bytes, &mut pos, &mut offsets);
            place_bits(&mut pos, &mut offsets, &mut masks, &mut nulls);
        }
    }

    let record_align = if original || has_eight {
        8
    } else if has_four {
        4
    } else {
        1
    };
    let record_size = pad_to(pos, record_align);

    let fields: Vec<Field> = parsed
        .fields
        .iter()
        .enumerate()
        .map(|(idx, desc)| Field {
            name: desc.name.clone(),
            kind: kinds[idx],
            offset: offsets[idx],
            bit_mask: masks[idx],
            null: nulls[idx],
            unique: desc.pack_unique,
        })
        .collect();

    let mut flip4 = Vec::new();
    let mut flip8 = Vec::new();
    let mut variable_fields = Vec::new();
    for (idx, field) in fields.iter().enumerate() {
        match field.kind {
            FieldKind::Int32 => flip4.push(field.offset),
            FieldKind::Variable32 => {
                flip4.push(field.offset);
                variable_fields.push(idx);
            }
            FieldKind::Int64 | FieldKind::Double => flip8.push(field.offset),
            _ => {}
        }
    }

    let pack_ops = pack_ops(&parsed, &fields, &by_name)?;

    Ok(ExtentType {
        name: parsed.name,
        namespace: parsed.namespace,
        major,
        minor,
        description: canonical,
        fields,
        by_name,
        record_size,
        flip4,
        flip8,
        variable_fields,
        pack_ops,
    })
}

/// Field-relative deltas come first, then previous-record deltas, then
/// scaling; decoding walks the same list in reverse group order.
fn pack_ops(
    parsed: &TypeDescription,
    fields: &[Field],
    by_name: &HashMap<String, usize>,
) -> Result<Vec<PackOp>> {
    let mut relative_to_other = HashSet::new();
    for desc in &parsed.fields {
        if let Some(base) = &desc.pack_relative {
            if base != &desc.name {
                relative_to_other.insert(desc.name.as_str());
            }
        }
    }

    let mut field_deltas = Vec::new();
    let mut prev_deltas = Vec::new();
    let mut scales = Vec::new();
    for (idx, desc) in parsed.fields.iter().enumerate() {
        let field = &fields[idx];
        if desc.pack_unique && field.kind != FieldKind::Variable32 {
            return Err(Error::format(format!(
                "pack_unique only applies to variable32 fields, not '{}'",
                desc.name
            )));
        }
        let self_relative = desc.pack_relative.as_deref() == Some(desc.name.as_str());
        if let Some(scale) = desc.pack_scale {
            if field.kind != FieldKind::Double || !(scale.is_finite() && scale > 0.0) {
                return Err(Error::format(format!(
                    "pack_scale needs a double field and a positive scale, field '{}'",
                    desc.name
                )));
            }
            if !self_relative {
                scales.push(PackOp::Scale {
                    offset: field.offset,
                    scale,
                });
            }
        }
        let Some(base_name) = &desc.pack_relative else {
            continue;
        };
        if field.kind == FieldKind::Double && self_relative {
            // Unscaled deltas of doubles drift on decode.
            let Some(scale) = desc.pack_scale else {
                return Err(Error::format(format!(
                    "self-relative double field '{}' needs pack_scale",
                    desc.name
                )));
            };
            prev_deltas.push(PackOp::DeltaPrevScaledF64 {
                offset: field.offset,
                scale,
            });
            continue;
        }
        if !matches!(field.kind, FieldKind::Int32 | FieldKind::Int64) {
            return Err(Error::format(format!(
                "pack_relative needs an int32 or int64 field, or a scaled double relative \
                 to itself, not '{}'",
                desc.name
            )));
        }
        if base_name == &desc.name {
            prev_deltas.push(match field.kind {
                FieldKind::Int32 => PackOp::DeltaPrevI32 {
                    offset: field.offset,
                },
                _ => PackOp::DeltaPrevI64 {
                    offset: field.offset,
                },
            });
            continue;
        }
        let base = by_name.get(base_name).map(|&i| &fields[i]).ok_or_else(|| {
            Error::format(format!(
                "field '{}' is relative to unknown field '{base_name}'",
                desc.name
            ))
        })?;
        if base.kind != field.kind || relative_to_other.contains(base_name.as_str()) {
            return Err(Error::format(format!(
                "field '{}' cannot be packed relative to '{base_name}'",
                desc.name
            )));
        }
        field_deltas.push(match field.kind {
            FieldKind::Int32 => PackOp::DeltaFieldI32 {
                offset: field.offset,
                base: base.offset,
            },
            _ => PackOp::DeltaFieldI64 {
                offset: field.offset,
                base: base.offset,
            },
        });
    }

    let mut ops = field_deltas;
    ops.extend(prev_deltas);
    ops.extend(scales);
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use crate::core::schema::{ExtentType, FieldKind, PackOp};

    #[test]
    fn test_small_to_big_layout() {
        let ty = ExtentType::from_description(
            r#"{"name": "Layout::Small", "fields": [
                {"name": "d", "type": "double"},
                {"name": "b1", "type": "bool"},
                {"name": "i", "type": "int32", "nullable": true},
                {"name": "s", "type": "variable32"},
                {"name": "c", "type": "byte"},
                {"name": "fw", "type": "fixedwidth", "size": 3},
                {"name": "b2", "type": "bool"}
            ]}"#,
        )
        .expect("layout");
        let b1 = ty.field("b1").expect("b1");
        assert_eq!((b1.offset(), b1.bit_mask()), (0, 0b001));
        let null = ty.field("i").expect("i").null_bit().expect("nullable");
        assert_eq!((null.offset, null.mask), (0, 0b010));
        let b2 = ty.field("b2").expect("b2");
        assert_eq!((b2.offset(), b2.bit_mask()), (0, 0b100));
        assert_eq!(ty.field("c").expect("c").offset(), 1);
        assert_eq!(ty.field("fw").expect("fw").offset(), 2);
        assert_eq!(ty.field("i").expect("i").offset(), 8);
        assert_eq!(ty.field("s").expect("s").offset(), 12);
        assert_eq!(ty.field("d").expect("d").offset(), 16);
        assert_eq!(ty.record_size(), 24);
        assert_eq!(ty.field("fw").expect("fw").kind(), FieldKind::FixedWidth(3));
    }

    #[test]
    fn test_original_padding_rounds_to_eight() {
        let ty = ExtentType::from_description(
            r#"{"name": "Layout::Pad", "fields": [{"name": "x", "type": "int32"}]}"#,
        )
        .expect("layout");
        assert_eq!(ty.record_size(), 8);

        let ty = ExtentType::from_description(
            r#"{"name": "Layout::Pad", "pack_pad_record": "max_column_size",
                "fields": [{"name": "x", "type": "int32"}]}"#,
        )
        .expect("layout");
        assert_eq!(ty.record_size(), 4);
    }

    #[test]
    fn test_big_to_small_layout() {
        let ty = ExtentType::from_description(
            r#"{"name": "Layout::Big", "field_ordering": "big_to_small", "fields": [
                {"name": "flag", "type": "bool"},
                {"name": "x", "type": "int32"},
                {"name": "t", "type": "int64"}
            ]}"#,
        )
        .expect("layout");
        assert_eq!(ty.field("t").expect("t").offset(), 0);
        assert_eq!(ty.field("x").expect("x").offset(), 8);
        assert_eq!(ty.field("flag").expect("flag").offset(), 12);
        assert_eq!(ty.record_size(), 16);
    }

    #[test]
    fn test_pack_option_validation() {
        let bad = [
            r#"{"name": "P", "fields": [{"name": "a", "type": "int32", "pack_unique": true}]}"#,
            r#"{"name": "P", "fields": [{"name": "a", "type": "int32", "pack_scale": 0.5}]}"#,
            r#"{"name": "P", "fields": [{"name": "a", "type": "double", "pack_scale": -1.0}]}"#,
            r#"{"name": "P", "fields": [{"name": "a", "type": "double", "pack_relative": "a"}]}"#,
            r#"{"name": "P", "fields": [{"name": "a", "type": "double", "pack_scale": 0.5,
                                         "pack_relative": "b"},
                                        {"name": "b", "type": "double"}]}"#,
            r#"{"name": "P", "fields": [{"name": "a", "type": "int32", "pack_relative": "zz"}]}"#,
            r#"{"name": "P", "fields": [{"name": "a", "type": "int32", "pack_relative": "b"},
                                        {"name": "b", "type": "int64"}]}"#,
            r#"{"name": "P", "fields": [{"name": "a", "type": "int32", "pack_relative": "b"},
                                        {"name": "b", "type": "int32", "pack_relative": "a"}]}"#,
        ];
        for description in bad {
            assert!(ExtentType::from_description(description).is_err(), "{description}");
        }
        let ok = ExtentType::from_description(
            r#"{"name": "P", "fields": [
                {"name": "start", "type": "int64", "pack_relative": "start"},
                {"name": "end", "type": "int64", "pack_relative": "start"}
            ]}"#,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_scaled_double_relative_to_itself() {
        let ty = ExtentType::from_description(
            r#"{"name": "P", "fields": [
                {"name": "t", "type": "double", "pack_scale": 1e-6, "pack_relative": "t"}
            ]}"#,
        )
        .expect("scaled self-relative double");
        let offset = ty.field("t").expect("t").offset();
        assert_eq!(
            ty.pack_ops(),
            &[PackOp::DeltaPrevScaledF64 { offset, scale: 1e-6 }]
        );
    }
}
