use std::borrow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use gimli::{DebuggingInformationEntry, Dwarf, EndianRcSlice, LittleEndian, Unit, UnitOffset};
use log::{debug, trace};
use object::{Object, ObjectSection};

use super::attributes::{
    byte_size_attribute, count_attribute, data_member_location_attribute, encoding_attribute,
    is_declaration, name_attribute, type_attribute,
};
use super::types::{
    Field, FunctionSignature, Parameter, ScalarEncoding, TypeDescriptor, TypeKind,
};

type DwarfReader = EndianRcSlice<LittleEndian>;

/// A DIE: index of its unit and its offset inside that unit.
type DieRef = (usize, UnitOffset);

/// Upper bound for array elements turned into fields.
const MAX_ARRAY_COUNT: u64 = 1 << 16;

/// Name indexed view of an image's DWARF information.
pub struct DebugInfo {
    dwarf: Dwarf<DwarfReader>,
    units: Vec<Unit<DwarfReader>>,
    functions: HashMap<String, DieRef>,
    variables: HashMap<String, DieRef>,
    types: HashMap<String, DieRef>,
    resolved: RefCell<HashMap<DieRef, Rc<TypeDescriptor>>>,
}

impl DebugInfo {
    /// Reads the debug information of an ELF file.
    pub fn load(path: &Path) -> Result<DebugInfo> {
        let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let mmap = unsafe { memmap::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;

        // Load a section and return as `Cow<[u8]>`.
        let loader = |id: gimli::SectionId| -> Result<DwarfReader, gimli::Error> {
            let data = object
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or_else(|| borrow::Cow::Borrowed(&[][..]));

            Ok(EndianRcSlice::new(Rc::from(&*data), LittleEndian))
        };

        let dwarf = Dwarf::load(loader)?;
        DebugInfo::new(dwarf)
    }

    /// Builds the index from raw section contents, missing sections are empty.
    pub fn from_sections<F>(mut section: F) -> Result<DebugInfo>
    where
        F: FnMut(gimli::SectionId) -> Option<Vec<u8>>,
    {
        let dwarf = Dwarf::load(|id| -> Result<DwarfReader, gimli::Error> {
            let data = section(id).unwrap_or_default();
            Ok(EndianRcSlice::new(Rc::from(data), LittleEndian))
        })?;
        DebugInfo::new(dwarf)
    }

    fn new(dwarf: Dwarf<DwarfReader>) -> Result<DebugInfo> {
        let mut units = vec![];
        let mut iter = dwarf.units();
        while let Some(header) = iter.next()? {
            units.push(dwarf.unit(header)?);
        }

        let mut functions = HashMap::new();
        let mut variables = HashMap::new();
        let mut types = HashMap::new();
        for (index, unit) in units.iter().enumerate() {
            let mut entries = unit.entries();
            let mut depth = 0;
            while let Some((delta, entry)) = entries.next_dfs()? {
                depth += delta;
                let name = match name_attribute(&dwarf, unit, entry) {
                    Some(name) => name,
                    None => continue,
                };
                let die = (index, entry.offset());
                match entry.tag() {
                    gimli::DW_TAG_subprogram if !is_declaration(entry) => {
                        functions.entry(name).or_insert(die);
                    }
                    gimli::DW_TAG_variable if depth == 1 && !is_declaration(entry) => {
                        variables.entry(name).or_insert(die);
                    }
                    gimli::DW_TAG_structure_type => {
                        types.entry(format!("struct {}", name)).or_insert(die);
                        types.entry(name).or_insert(die);
                    }
                    gimli::DW_TAG_union_type => {
                        types.entry(format!("union {}", name)).or_insert(die);
                        types.entry(name).or_insert(die);
                    }
                    gimli::DW_TAG_enumeration_type => {
                        types.entry(format!("enum {}", name)).or_insert(die);
                        types.entry(name).or_insert(die);
                    }
                    gimli::DW_TAG_typedef | gimli::DW_TAG_base_type => {
                        types.entry(name).or_insert(die);
                    }
                    _ => (),
                }
            }
        }
        debug!(
            "Indexed {} functions, {} variables and {} types in {} units",
            functions.len(),
            variables.len(),
            types.len(),
            units.len()
        );

        Ok(DebugInfo {
            dwarf,
            units,
            functions,
            variables,
            types,
            resolved: RefCell::new(HashMap::new()),
        })
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// The signature of a function defined in the image.
    pub fn signature(&self, name: &str) -> Result<Option<FunctionSignature>> {
        let die = match self.functions.get(name) {
            Some(die) => *die,
            None => return Ok(None),
        };
        let unit = &self.units[die.0];
        let entry = unit.entry(die.1)?;
        let return_type = match type_attribute(&self.units, die.0, &entry)? {
            Some(ty) => Some(self.resolve(ty, &mut vec![])?),
            None => None,
        };

        let mut parameters = vec![];
        let mut variadic = false;
        let mut tree = unit.entries_tree(Some(die.1))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            match entry.tag() {
                gimli::DW_TAG_formal_parameter => {
                    let ty = match type_attribute(&self.units, die.0, entry)? {
                        Some(ty) => self.resolve(ty, &mut vec![])?,
                        None => return Err(anyhow!("parameter of `{}` has no type", name)),
                    };
                    parameters.push(Parameter {
                        name: name_attribute(&self.dwarf, unit, entry),
                        ty,
                    });
                }
                gimli::DW_TAG_unspecified_parameters => variadic = true,
                _ => (),
            }
        }

        Ok(Some(FunctionSignature {
            name: name.to_string(),
            parameters,
            return_type,
            variadic,
        }))
    }

    /// The type of a global variable.
    pub fn variable_type(&self, name: &str) -> Result<Option<Rc<TypeDescriptor>>> {
        let die = match self.variables.get(name) {
            Some(die) => *die,
            None => return Ok(None),
        };
        let entry = self.units[die.0].entry(die.1)?;
        match type_attribute(&self.units, die.0, &entry)? {
            Some(ty) => Ok(Some(self.resolve(ty, &mut vec![])?)),
            None => Ok(None),
        }
    }

    /// A type by name, e.g. `uint32_t`, `my_add_t` or `struct my_add_t`.
    pub fn named_type(&self, name: &str) -> Result<Option<Rc<TypeDescriptor>>> {
        match self.types.get(name.trim()) {
            Some(die) => Ok(Some(self.resolve(*die, &mut vec![])?)),
            None => Ok(None),
        }
    }

    fn resolve(&self, die: DieRef, visiting: &mut Vec<DieRef>) -> Result<Rc<TypeDescriptor>> {
        if let Some(ty) = self.resolved.borrow().get(&die) {
            return Ok(ty.clone());
        }
        visiting.push(die);
        let ty = self.describe(die, visiting);
        visiting.pop();
        let ty = ty?;
        trace!("Resolved type {}", ty);
        self.resolved.borrow_mut().insert(die, ty.clone());
        Ok(ty)
    }

    fn referenced(
        &self,
        unit_index: usize,
        entry: &DebuggingInformationEntry<DwarfReader>,
        visiting: &mut Vec<DieRef>,
    ) -> Result<Option<Rc<TypeDescriptor>>> {
        match type_attribute(&self.units, unit_index, entry)? {
            Some(ty) if visiting.contains(&ty) => Ok(None),
            Some(ty) => Ok(Some(self.resolve(ty, visiting)?)),
            None => Ok(None),
        }
    }

    fn describe(&self, die: DieRef, visiting: &mut Vec<DieRef>) -> Result<Rc<TypeDescriptor>> {
        let unit = &self.units[die.0];
        let entry = unit.entry(die.1)?;
        let name = name_attribute(&self.dwarf, unit, &entry);
        let address_size = u64::from(unit.header.encoding().address_size);

        let ty = match entry.tag() {
            gimli::DW_TAG_base_type => {
                let encoding = match encoding_attribute(&entry) {
                    Some(gimli::DW_ATE_float) => ScalarEncoding::Float,
                    Some(gimli::DW_ATE_boolean) => ScalarEncoding::Bool,
                    Some(gimli::DW_ATE_signed) | Some(gimli::DW_ATE_signed_char) => {
                        ScalarEncoding::Signed
                    }
                    _ => ScalarEncoding::Unsigned,
                };
                TypeDescriptor::scalar(
                    name.as_deref().unwrap_or("<base>"),
                    byte_size_attribute(&entry).unwrap_or(0),
                    encoding,
                )
            }
            gimli::DW_TAG_pointer_type | gimli::DW_TAG_reference_type => {
                let pointee = self.referenced(die.0, &entry, visiting)?;
                let name = match (&name, &pointee) {
                    (Some(name), _) => name.clone(),
                    (None, Some(pointee)) => format!("{} *", pointee.name),
                    (None, None) => "void *".to_string(),
                };
                TypeDescriptor::pointer(
                    &name,
                    byte_size_attribute(&entry).unwrap_or(address_size),
                    pointee,
                )
            }
            gimli::DW_TAG_typedef => match self.referenced(die.0, &entry, visiting)? {
                Some(inner) => Rc::new(TypeDescriptor {
                    name: name.unwrap_or_else(|| inner.name.clone()),
                    size: inner.size,
                    kind: inner.kind.clone(),
                }),
                None => TypeDescriptor::void(),
            },
            gimli::DW_TAG_const_type
            | gimli::DW_TAG_volatile_type
            | gimli::DW_TAG_restrict_type
            | gimli::DW_TAG_atomic_type => self
                .referenced(die.0, &entry, visiting)?
                .unwrap_or_else(TypeDescriptor::void),
            gimli::DW_TAG_structure_type
            | gimli::DW_TAG_class_type
            | gimli::DW_TAG_union_type => {
                let union = entry.tag() == gimli::DW_TAG_union_type;
                let mut fields = vec![];
                let mut tree = unit.entries_tree(Some(die.1))?;
                let root = tree.root()?;
                let mut children = root.children();
                while let Some(child) = children.next()? {
                    let member = child.entry();
                    if member.tag() != gimli::DW_TAG_member {
                        continue;
                    }
                    let ty = match type_attribute(&self.units, die.0, member)? {
                        Some(ty) if visiting.contains(&ty) => {
                            return Err(anyhow!("type contains itself by value"))
                        }
                        Some(ty) => self.resolve(ty, visiting)?,
                        None => continue,
                    };
                    let offset = if union {
                        0
                    } else {
                        data_member_location_attribute(member).unwrap_or(0)
                    };
                    fields.push(Field {
                        name: name_attribute(&self.dwarf, unit, member)
                            .unwrap_or_else(|| format!("<anonymous@{}>", offset)),
                        offset,
                        ty,
                    });
                }
                let keyword = if union { "union" } else { "struct" };
                TypeDescriptor::aggregate(
                    &name
                        .map(|n| format!("{} {}", keyword, n))
                        .unwrap_or_else(|| format!("{} <anonymous>", keyword)),
                    byte_size_attribute(&entry).unwrap_or(0),
                    fields,
                )
            }
            gimli::DW_TAG_enumeration_type => {
                let underlying = self.referenced(die.0, &entry, visiting)?;
                let encoding = match underlying.as_ref().map(|u| &u.kind) {
                    Some(TypeKind::Scalar(encoding)) => *encoding,
                    _ => ScalarEncoding::Unsigned,
                };
                TypeDescriptor::scalar(
                    &name
                        .map(|n| format!("enum {}", n))
                        .unwrap_or_else(|| "enum <anonymous>".to_string()),
                    byte_size_attribute(&entry)
                        .or_else(|| underlying.map(|u| u.size))
                        .unwrap_or(4),
                    encoding,
                )
            }
            gimli::DW_TAG_array_type => {
                let element = self
                    .referenced(die.0, &entry, visiting)?
                    .ok_or_else(|| anyhow!("array without element type"))?;
                let mut count: u64 = 1;
                let mut tree = unit.entries_tree(Some(die.1))?;
                let root = tree.root()?;
                let mut children = root.children();
                while let Some(child) = children.next()? {
                    if child.entry().tag() == gimli::DW_TAG_subrange_type {
                        count = count.saturating_mul(count_attribute(child.entry()).unwrap_or(0));
                    }
                }
                let count = count.min(MAX_ARRAY_COUNT);
                let name = format!("{}[{}]", element.name, count);
                TypeDescriptor::array(&name, element, count)
            }
            gimli::DW_TAG_subroutine_type => Rc::new(TypeDescriptor {
                name: "function".to_string(),
                size: 0,
                kind: TypeKind::Void,
            }),
            _ => Rc::new(TypeDescriptor {
                name: name.unwrap_or_else(|| format!("{}", entry.tag())),
                size: byte_size_attribute(&entry).unwrap_or(0),
                kind: TypeKind::Void,
            }),
        };
        Ok(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gimli::write::{AttributeValue, DwarfUnit, EndianVec, Sections, UnitEntryId};

    fn add(
        dwarf: &mut DwarfUnit,
        parent: UnitEntryId,
        tag: gimli::DwTag,
        name: &str,
    ) -> UnitEntryId {
        let id = dwarf.unit.add(parent, tag);
        dwarf
            .unit
            .get_mut(id)
            .set(gimli::DW_AT_name, AttributeValue::String(name.as_bytes().to_vec()));
        id
    }

    fn member(dwarf: &mut DwarfUnit, parent: UnitEntryId, name: &str, offset: u64, ty: UnitEntryId) {
        let id = add(dwarf, parent, gimli::DW_TAG_member, name);
        let entry = dwarf.unit.get_mut(id);
        entry.set(gimli::DW_AT_data_member_location, AttributeValue::Udata(offset));
        entry.set(gimli::DW_AT_type, AttributeValue::UnitRef(ty));
    }

    /// The debug information of a small test firmware.
    fn firmware() -> DebugInfo {
        let encoding = gimli::Encoding {
            format: gimli::Format::Dwarf32,
            version: 4,
            address_size: 4,
        };
        let mut dwarf = DwarfUnit::new(encoding);
        let root = dwarf.unit.root();

        let uint = add(&mut dwarf, root, gimli::DW_TAG_base_type, "unsigned int");
        let entry = dwarf.unit.get_mut(uint);
        entry.set(gimli::DW_AT_byte_size, AttributeValue::Udata(4));
        entry.set(gimli::DW_AT_encoding, AttributeValue::Encoding(gimli::DW_ATE_unsigned));

        let uchar = add(&mut dwarf, root, gimli::DW_TAG_base_type, "unsigned char");
        let entry = dwarf.unit.get_mut(uchar);
        entry.set(gimli::DW_AT_byte_size, AttributeValue::Udata(1));
        entry.set(
            gimli::DW_AT_encoding,
            AttributeValue::Encoding(gimli::DW_ATE_unsigned_char),
        );

        let uint32 = add(&mut dwarf, root, gimli::DW_TAG_typedef, "uint32_t");
        dwarf
            .unit
            .get_mut(uint32)
            .set(gimli::DW_AT_type, AttributeValue::UnitRef(uint));
        let uint8 = add(&mut dwarf, root, gimli::DW_TAG_typedef, "uint8_t");
        dwarf
            .unit
            .get_mut(uint8)
            .set(gimli::DW_AT_type, AttributeValue::UnitRef(uchar));

        let ptr = dwarf.unit.add(root, gimli::DW_TAG_pointer_type);
        let entry = dwarf.unit.get_mut(ptr);
        entry.set(gimli::DW_AT_byte_size, AttributeValue::Udata(4));
        entry.set(gimli::DW_AT_type, AttributeValue::UnitRef(uint32));

        let strukt = add(&mut dwarf, root, gimli::DW_TAG_structure_type, "my_add");
        dwarf
            .unit
            .get_mut(strukt)
            .set(gimli::DW_AT_byte_size, AttributeValue::Udata(24));
        member(&mut dwarf, strukt, "paddA", 0, uint8);
        member(&mut dwarf, strukt, "a", 4, uint32);
        member(&mut dwarf, strukt, "paddB", 8, uint8);
        member(&mut dwarf, strukt, "b", 12, uint32);
        member(&mut dwarf, strukt, "paddC", 16, uint8);
        member(&mut dwarf, strukt, "sum", 20, uint32);
        let typedef = add(&mut dwarf, root, gimli::DW_TAG_typedef, "my_add_t");
        dwarf
            .unit
            .get_mut(typedef)
            .set(gimli::DW_AT_type, AttributeValue::UnitRef(strukt));

        let get_b = add(&mut dwarf, root, gimli::DW_TAG_subprogram, "example_GetB");
        dwarf
            .unit
            .get_mut(get_b)
            .set(gimli::DW_AT_type, AttributeValue::UnitRef(uint32));
        let param = add(&mut dwarf, get_b, gimli::DW_TAG_formal_parameter, "b");
        dwarf
            .unit
            .get_mut(param)
            .set(gimli::DW_AT_type, AttributeValue::UnitRef(ptr));

        let by_value = add(&mut dwarf, root, gimli::DW_TAG_subprogram, "example_AdditionStruct");
        dwarf
            .unit
            .get_mut(by_value)
            .set(gimli::DW_AT_type, AttributeValue::UnitRef(uint32));
        let param = add(&mut dwarf, by_value, gimli::DW_TAG_formal_parameter, "s");
        dwarf
            .unit
            .get_mut(param)
            .set(gimli::DW_AT_type, AttributeValue::UnitRef(typedef));

        let log = add(&mut dwarf, root, gimli::DW_TAG_subprogram, "example_Log");
        add(&mut dwarf, log, gimli::DW_TAG_unspecified_parameters, "");

        let global = add(&mut dwarf, root, gimli::DW_TAG_variable, "global_data");
        dwarf
            .unit
            .get_mut(global)
            .set(gimli::DW_AT_type, AttributeValue::UnitRef(uint32));

        let mut sections = Sections::new(EndianVec::new(LittleEndian));
        dwarf.write(&mut sections).unwrap();
        let mut contents = HashMap::new();
        sections
            .for_each(|id, data| {
                contents.insert(id, data.slice().to_vec());
                Ok::<(), gimli::write::Error>(())
            })
            .unwrap();
        DebugInfo::from_sections(|id| contents.get(&id).cloned()).unwrap()
    }

    #[test]
    fn reads_struct_layout_with_padding() {
        let info = firmware();
        let ty = info.named_type("my_add_t").unwrap().unwrap();
        assert_eq!(ty.name, "my_add_t");
        assert_eq!(ty.size, 24);
        let offsets: Vec<(String, u64, u64)> = match &ty.kind {
            TypeKind::Aggregate { fields } => fields
                .iter()
                .map(|f| (f.name.clone(), f.offset, f.ty.size))
                .collect(),
            other => panic!("expected an aggregate, got {:?}", other),
        };
        assert_eq!(
            offsets,
            vec![
                ("paddA".to_string(), 0, 1),
                ("a".to_string(), 4, 4),
                ("paddB".to_string(), 8, 1),
                ("b".to_string(), 12, 4),
                ("paddC".to_string(), 16, 1),
                ("sum".to_string(), 20, 4),
            ]
        );
        assert!(info.named_type("struct my_add").unwrap().is_some());
    }

    #[test]
    fn reads_signatures() {
        let info = firmware();
        let sig = info.signature("example_GetB").unwrap().unwrap();
        assert_eq!(sig.parameters.len(), 1);
        assert_eq!(sig.parameters[0].name.as_deref(), Some("b"));
        match &sig.parameters[0].ty.kind {
            TypeKind::Pointer { pointee: Some(p) } => assert_eq!(p.name, "uint32_t"),
            other => panic!("expected a pointer, got {:?}", other),
        }
        assert_eq!(sig.return_type.map(|t| t.size), Some(4));

        let by_value = info.signature("example_AdditionStruct").unwrap().unwrap();
        assert!(by_value.parameters[0].ty.is_aggregate());

        let log = info.signature("example_Log").unwrap().unwrap();
        assert!(log.variadic);
        assert!(log.return_type.is_none());
        assert!(info.signature("missing").unwrap().is_none());
    }

    #[test]
    fn reads_global_types() {
        let info = firmware();
        let ty = info.variable_type("global_data").unwrap().unwrap();
        assert_eq!(ty.kind, TypeKind::Scalar(ScalarEncoding::Unsigned));
        assert!(info.variable_type("nothing").unwrap().is_none());
    }
}
