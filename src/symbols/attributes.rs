use gimli::{AttributeValue, DebuggingInformationEntry, DwAte, Reader, Unit};

use anyhow::Result;

/// This function will return the value of the name attribute in the given DIE.
///
/// Description:
///
/// * `dwarf` - A reference to gimli-rs `Dwarf` struct.
/// * `unit` - A reference to gimli-rs `Unit` struct which contains the given DIE.
/// * `die` - A reference to a gimli-rs `Die` struct.
///
/// This function will try to retrieve the value of the attribute `DW_AT_name` from the given DIE.
/// Inline strings and references into `.debug_str`/`.debug_line_str` are both handled.
pub fn name_attribute<R: Reader<Offset = usize>>(
    dwarf: &gimli::Dwarf<R>,
    unit: &Unit<R>,
    die: &DebuggingInformationEntry<R>,
) -> Option<String> {
    let value = die.attr_value(gimli::DW_AT_name).ok()??;
    let name = dwarf.attr_string(unit, value).ok()?;
    let name = name.to_string_lossy().ok()?.into_owned();
    Some(name)
}

/// This function will return the value of the byte_size attribute in the given DIE.
///
/// Description:
///
/// * `die` - A reference to a gimli-rs `Die` struct.
///
/// This function will try to retrieve the value of the attribute `DW_AT_byte_size` from the given DIE.
pub fn byte_size_attribute<R: Reader<Offset = usize>>(
    die: &DebuggingInformationEntry<R>,
) -> Option<u64> {
    die.attr(gimli::DW_AT_byte_size).ok()??.udata_value()
}

/// This function will return the value of the data_member_location attribute in the given DIE.
///
/// Description:
///
/// * `die` - A reference to a gimli-rs `Die` struct.
///
/// This function will try to retrieve the value of the attribute `DW_AT_data_member_location`
/// from the given DIE. Both the constant form and the `DW_OP_plus_uconst` expression form that
/// older compilers emit are understood.
pub fn data_member_location_attribute<R: Reader<Offset = usize>>(
    die: &DebuggingInformationEntry<R>,
) -> Option<u64> {
    let attr = die.attr(gimli::DW_AT_data_member_location).ok()??;
    if let Some(offset) = attr.udata_value() {
        return Some(offset);
    }
    match attr.value() {
        AttributeValue::Exprloc(expression) => {
            let mut bytes = expression.0;
            let op = bytes.read_u8().ok()?;
            if op == gimli::DW_OP_plus_uconst.0 {
                bytes.read_uleb128().ok()
            } else {
                None
            }
        }
        _ => None,
    }
}

/// This function will return the value of the type attribute in the given DIE.
///
/// Description:
///
/// * `dwarf` - A reference to gimli-rs `Dwarf` struct.
/// * `units` - All units of the image, the referenced type may live in another one.
/// * `unit_index` - Index of the unit in `units` which contains the given DIE.
/// * `die` - A reference to a gimli-rs `Die` struct.
///
/// This function will try to retrieve the value of the attribute `DW_AT_type` from the given DIE.
/// It returns the index of the unit holding the type DIE together with the DIE's offset.
pub fn type_attribute<R: Reader<Offset = usize>>(
    units: &[Unit<R>],
    unit_index: usize,
    die: &DebuggingInformationEntry<R>,
) -> Result<Option<(usize, gimli::UnitOffset)>> {
    match die.attr_value(gimli::DW_AT_type)? {
        Some(AttributeValue::UnitRef(offset)) => Ok(Some((unit_index, offset))),
        Some(AttributeValue::DebugInfoRef(di_offset)) => {
            let offset = gimli::UnitSectionOffset::DebugInfoOffset(di_offset);
            for (index, unit) in units.iter().enumerate() {
                if let Some(offset) = offset.to_unit_offset(unit) {
                    return Ok(Some((index, offset)));
                }
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

/// This function will return the value of the count attribute in the given DIE.
///
/// Description:
///
/// * `die` - A reference to a gimli-rs `Die` struct.
///
/// This function will try to retrieve the value of the attribute `DW_AT_count` from the given
/// DIE, falling back to `DW_AT_upper_bound + 1`.
pub fn count_attribute<R: Reader<Offset = usize>>(
    die: &DebuggingInformationEntry<R>,
) -> Option<u64> {
    if let Some(count) = die
        .attr(gimli::DW_AT_count)
        .ok()
        .flatten()
        .and_then(|a| a.udata_value())
    {
        return Some(count);
    }
    let upper = die.attr(gimli::DW_AT_upper_bound).ok()??;
    match upper.value() {
        AttributeValue::Sdata(val) if val < 0 => Some(0),
        AttributeValue::Sdata(val) => Some(val as u64 + 1),
        _ => upper.udata_value().map(|val| val + 1),
    }
}

/// This function will return the value of the encoding attribute in the given DIE.
///
/// Description:
///
/// * `die` - A reference to a gimli-rs `Die` struct.
///
/// This function will try to retrieve the value of the attribute `DW_AT_encoding` from the given DIE.
pub fn encoding_attribute<R: Reader<Offset = usize>>(
    die: &DebuggingInformationEntry<R>,
) -> Option<DwAte> {
    match die.attr_value(gimli::DW_AT_encoding).ok()? {
        Some(AttributeValue::Encoding(val)) => Some(val),
        _ => None,
    }
}

/// True if the DIE only declares something that is defined elsewhere.
pub fn is_declaration<R: Reader<Offset = usize>>(die: &DebuggingInformationEntry<R>) -> bool {
    matches!(
        die.attr_value(gimli::DW_AT_declaration),
        Ok(Some(AttributeValue::Flag(true)))
    )
}
