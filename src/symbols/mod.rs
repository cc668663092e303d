//! Name, address and type resolution for the loaded image.
//!
//! Types come from the image's DWARF information when the symbols file is available on the
//! host, otherwise they are recovered from the debugger's own output. Every answer is cached
//! until the next image is loaded.

/// Helpers for reading DWARF attributes.
pub mod attributes;

/// Parsers for type information printed by the debugger.
pub mod debugger;

/// Index over the DWARF information of an ELF file.
pub mod dwarf;

/// Type descriptors and function signatures.
pub mod types;

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::mi::Command;
use crate::target::TargetSession;
use debugger::{
    descriptor_from_text, fields_from_declarations, parse_address, parse_function_type,
    parse_layout, parse_location_literal, parse_size, parse_type_header,
};
use dwarf::DebugInfo;
pub use types::{
    Field, FunctionSignature, Parameter, ScalarEncoding, SymbolInfo, TypeDescriptor, TypeKind,
};

/// How deep `type_of` follows pointers and typedefs when asking the debugger.
const MAX_TYPE_DEPTH: usize = 8;

/// Per image cache of resolved names.
#[derive(Default)]
pub struct SymbolCatalog {
    symbols: HashMap<String, SymbolInfo>,
    types: HashMap<String, Rc<TypeDescriptor>>,
    signatures: HashMap<String, Rc<FunctionSignature>>,
    debug_info: Option<DebugInfo>,
}

impl SymbolCatalog {
    /// Forgets everything, including the DWARF index.
    pub fn invalidate(&mut self) {
        debug!(
            "Dropping {} symbols, {} types and {} signatures",
            self.symbols.len(),
            self.types.len(),
            self.signatures.len()
        );
        self.symbols.clear();
        self.types.clear();
        self.signatures.clear();
        self.debug_info = None;
    }

    /// Reads the DWARF information of `path`, used before asking the debugger.
    pub fn attach_debug_info(&mut self, path: &Path) -> Result<()> {
        let debug_info = DebugInfo::load(path).map_err(Error::DebugInfo)?;
        info!("Loaded debug information from {}", path.display());
        self.debug_info = Some(debug_info);
        Ok(())
    }

    pub fn set_debug_info(&mut self, debug_info: DebugInfo) {
        self.debug_info = Some(debug_info);
    }

    pub fn has_debug_info(&self) -> bool {
        self.debug_info.is_some()
    }

    /// Number of cached answers.
    pub fn len(&self) -> usize {
        self.symbols.len() + self.types.len() + self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn local_type(&self, expression: &str) -> Result<Option<Rc<TypeDescriptor>>> {
        let debug_info = match &self.debug_info {
            Some(debug_info) => debug_info,
            None => return Ok(None),
        };
        if let Some(ty) = debug_info
            .variable_type(expression)
            .map_err(Error::DebugInfo)?
        {
            return Ok(Some(ty));
        }
        debug_info.named_type(expression).map_err(Error::DebugInfo)
    }

    fn local_signature(&self, function: &str) -> Result<Option<FunctionSignature>> {
        match &self.debug_info {
            Some(debug_info) => debug_info.signature(function).map_err(Error::DebugInfo),
            None => Ok(None),
        }
    }
}

impl TargetSession {
    /// Resolves a symbol or a literal address.
    ///
    /// Description:
    ///
    /// * `name` - A function or variable name, or an address such as `0x8000200` or `*0x8000200`.
    ///
    /// The first resolution of a name asks the debugger for `&name`, later ones are answered from
    /// the cache without any I/O.
    pub fn resolve(&mut self, name: &str) -> Result<SymbolInfo> {
        if let Some(address) = parse_location_literal(name) {
            return Ok(SymbolInfo {
                name: name.to_string(),
                address,
                ty: None,
            });
        }
        if let Some(symbol) = self.catalog.symbols.get(name) {
            trace!("Symbol cache hit for `{}`", name);
            return Ok(symbol.clone());
        }

        let record = self.execute(Command::Evaluate(format!("&{}", name)))?;
        let value = record.field("value")?;
        let address = parse_address(value).ok_or_else(|| {
            Error::Protocol(format!("`&{}` is not an address: {}", name, value))
        })?;
        let ty = self.catalog.local_type(name)?;
        let symbol = SymbolInfo {
            name: name.to_string(),
            address,
            ty,
        };
        debug!("Resolved `{}` to {:#010x}", name, address);
        self.catalog.symbols.insert(name.to_string(), symbol.clone());
        Ok(symbol)
    }

    /// The type of a variable, an expression or a type name.
    pub fn type_of(&mut self, expression: &str) -> Result<Rc<TypeDescriptor>> {
        self.type_of_depth(expression.trim(), 0)
    }

    /// The signature of a function in the loaded image.
    pub fn signature(&mut self, function: &str) -> Result<Rc<FunctionSignature>> {
        if let Some(signature) = self.catalog.signatures.get(function) {
            return Ok(signature.clone());
        }
        let signature = match self.catalog.local_signature(function)? {
            Some(signature) => signature,
            None => self.remote_signature(function)?,
        };
        debug!("Signature of `{}`: {}", function, signature);
        let signature = Rc::new(signature);
        self.catalog
            .signatures
            .insert(function.to_string(), signature.clone());
        Ok(signature)
    }

    fn type_of_depth(&mut self, expression: &str, depth: usize) -> Result<Rc<TypeDescriptor>> {
        if let Some(ty) = self.catalog.types.get(expression) {
            return Ok(ty.clone());
        }
        let ty = match self.catalog.local_type(expression)? {
            Some(ty) => ty,
            None if depth >= MAX_TYPE_DEPTH => {
                return Err(Error::Protocol(format!(
                    "type of `{}` nests too deep",
                    expression
                )))
            }
            None => self.remote_type(expression, depth)?,
        };
        trace!("Type of `{}` is {}", expression, ty);
        self.catalog
            .types
            .insert(expression.to_string(), ty.clone());
        Ok(ty)
    }

    fn remote_type(&mut self, expression: &str, depth: usize) -> Result<Rc<TypeDescriptor>> {
        if expression == "void" {
            return Ok(TypeDescriptor::void());
        }
        if let Some(pointee) = expression.strip_suffix('*') {
            let pointee = pointee.trim();
            let target = if pointee == "void" || pointee.ends_with("void") {
                None
            } else {
                Some(self.type_of_depth(pointee, depth + 1)?)
            };
            return Ok(TypeDescriptor::pointer(expression, 4, target));
        }

        let record = self.execute(Command::Console(format!("ptype/o {}", expression)))?;
        let text = record.console_text();
        let layout = parse_layout(&text).ok_or_else(|| {
            Error::Protocol(format!("unexpected `ptype/o {}` output: {}", expression, text))
        })?;

        if layout.is_aggregate() || layout.is_pointer_to_aggregate() {
            let size = match layout.size {
                Some(size) => size,
                None => self.size_of(&layout.header)?,
            };
            let aggregate = TypeDescriptor::aggregate(
                &layout.header,
                size,
                fields_from_declarations(&layout.fields, 0),
            );
            if layout.is_pointer_to_aggregate() {
                return Ok(TypeDescriptor::pointer(expression, 4, Some(aggregate)));
            }
            return Ok(rename(aggregate, expression));
        }

        if layout.header.ends_with('*') {
            let pointer = self.remote_type(&layout.header, depth)?;
            return Ok(rename(pointer, expression));
        }
        let size = self.size_of(expression)?;
        Ok(rename(descriptor_from_text(&layout.header, size), expression))
    }

    fn size_of(&mut self, expression: &str) -> Result<u64> {
        let record = self.execute(Command::Evaluate(format!("sizeof({})", expression)))?;
        let value = record.field("value")?;
        parse_size(value).ok_or_else(|| {
            Error::Protocol(format!("`sizeof({})` is not a number: {}", expression, value))
        })
    }

    fn remote_signature(&mut self, function: &str) -> Result<FunctionSignature> {
        let text = match self.function_info(function)? {
            Some(text) => text,
            None => {
                let record = self.execute(Command::Console(format!("whatis {}", function)))?;
                parse_type_header(&record.console_text())
                    .ok_or_else(|| Error::UnknownSymbol(function.to_string()))?
            }
        };
        let (ret, parameters, variadic) = parse_function_type(&text)
            .ok_or_else(|| Error::Protocol(format!("`{}` is not a function: {}", function, text)))?;

        let return_type = if ret == "void" {
            None
        } else {
            Some(self.type_of(&ret)?)
        };
        let mut resolved = vec![];
        for parameter in parameters {
            resolved.push(Parameter {
                name: None,
                ty: self.type_of(&parameter)?,
            });
        }
        Ok(FunctionSignature {
            name: function.to_string(),
            parameters: resolved,
            return_type,
            variadic,
        })
    }

    /// The type text of a function as listed by `-symbol-info-functions`.
    fn function_info(&mut self, function: &str) -> Result<Option<String>> {
        let record = self.execute(Command::FunctionInfo(function.to_string()))?;
        let files = match record
            .results
            .get_tuple("symbols")
            .and_then(|symbols| symbols.get_list("debug"))
        {
            Some(files) => files,
            None => return Ok(None),
        };
        for file in files.values() {
            let symbols = match file.as_tuple().and_then(|f| f.get_list("symbols")) {
                Some(symbols) => symbols,
                None => continue,
            };
            for symbol in symbols.values() {
                let symbol = match symbol.as_tuple() {
                    Some(symbol) => symbol,
                    None => continue,
                };
                if symbol.get_str("name") == Some(function) {
                    return Ok(symbol.get_str("type").map(|t| t.to_string()));
                }
            }
        }
        Ok(None)
    }
}

fn rename(ty: Rc<TypeDescriptor>, name: &str) -> Rc<TypeDescriptor> {
    if ty.name == name {
        return ty;
    }
    Rc::new(TypeDescriptor {
        name: name.to_string(),
        size: ty.size,
        kind: ty.kind.clone(),
    })
}
