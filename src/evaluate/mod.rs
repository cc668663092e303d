pub mod marshal;
pub mod parse;
pub mod value;

use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, trace, warn};

use crate::calling_convention::{ArgumentShape, CallingConvention, Placement, TargetAccess};
use crate::error::{Error, Result};
use crate::memory::Trampoline;
use crate::mi::{Command, Deadline, ResultRecord};
use crate::registers::CoreRegister;
use crate::symbols::{FunctionSignature, TypeDescriptor};
use crate::target::TargetSession;
use marshal::{check, check_arguments, decode, encode, host_layout};
pub use parse::parse_value;
pub use value::{StructValue, TargetPtr, Value};

/// Largest block moved by one memory command.
const MEMORY_CHUNK: u32 = 1024;

impl TargetSession {
    /// Evaluates a C expression in the halted target's current frame.
    pub fn evaluate(&mut self, expression: &str) -> Result<Value> {
        self.require_halted()?;
        let record = self.execute(Command::Evaluate(expression.to_string()))?;
        let value = parse_value(record.field("value")?);
        trace!("`{}` = {}", expression, value);
        Ok(value)
    }

    /// Assigns a scalar to a variable or register, e.g. `global_data` or `$r0`.
    ///
    /// Returns the value the debugger reports after the assignment.
    pub fn assign<V: Into<Value>>(&mut self, lvalue: &str, value: V) -> Result<Value> {
        self.require_halted()?;
        let value = value.into();
        let literal = literal(&value)?;
        let record = self.execute(Command::Evaluate(format!("{} = {}", lvalue, literal)))?;
        self.registers.clear();
        Ok(parse_value(record.field("value")?))
    }

    /// Calls a function of the halted target and returns its result.
    ///
    /// Description:
    ///
    /// * `function` - Name of the function.
    /// * `arguments` - One value per parameter, plus any variadic extras.
    ///
    /// The arguments are checked against the signature before the target is touched. The call
    /// returns to the trampoline of the memory model, intercepts hit meanwhile run their
    /// callbacks. Afterwards the registers of the caller are restored and the scratch memory used
    /// for the arguments is released.
    pub fn call(&mut self, function: &str, arguments: &[Value]) -> Result<Value> {
        self.require_halted()?;
        let signature = self.signature(function)?;
        check_arguments(&signature, arguments)?;
        let entry = self.resolve(function)?.address & !1;
        let trampoline = self.memory.trampoline.ok_or_else(|| {
            Error::Config(format!(
                "the {} memory model has no trampoline, `{}` cannot be called",
                self.config.memory_model.kind(),
                function
            ))
        })?;

        self.enter()?;
        let errors = self.callback_errors.len();
        let mark = self.memory.mark();
        let result = self.call_at(&signature, entry, trampoline, arguments);
        self.memory.release(mark);
        self.check_canary();
        self.leave();

        let value = result?;
        self.take_callback_error(errors)?;
        debug!("`{}` returned {}", function, value);
        Ok(value)
    }

    fn call_at(
        &mut self,
        signature: &FunctionSignature,
        entry: u32,
        trampoline: Trampoline,
        arguments: &[Value],
    ) -> Result<Value> {
        let convention = self.convention;
        let mut encoded = vec![];
        let mut shapes = vec![];
        for (index, value) in arguments.iter().enumerate() {
            match signature.parameters.get(index) {
                Some(parameter) => {
                    encoded.push(self.encode_in_scratch(&parameter.ty, value)?);
                    shapes.push(ArgumentShape::of(&parameter.ty));
                }
                None => {
                    let bytes = self.encode_variadic(value)?;
                    shapes.push(ArgumentShape {
                        size: bytes.len() as u32,
                        alignment: if bytes.len() > 4 { 8 } else { 4 },
                        composite: false,
                        signed: matches!(value, Value::Signed(_)),
                    });
                    encoded.push(bytes);
                }
            }
        }

        let return_type = signature.return_type.clone();
        let placement = convention.place(return_type.as_deref(), &shapes);
        let result_address = match &return_type {
            Some(ty) if placement.indirect_result => Some(self.memory.alloc(
                ty.size as u32,
                TargetSession::scratch_alignment(ty.alignment() as u32),
            )?),
            _ => None,
        };

        self.save_context()?;
        let outcome = self.run_call(
            signature,
            entry,
            trampoline,
            &placement,
            &encoded,
            result_address,
        );
        match &outcome {
            Err(err) if err.is_fatal() || err.is_retryable() => {
                warn!("Registers of the caller of `{}` not restored: {}", signature.name, err);
                self.registers.pop_stashed_registers();
            }
            _ => self.restore_context()?,
        }
        outcome
    }

    fn run_call(
        &mut self,
        signature: &FunctionSignature,
        entry: u32,
        trampoline: Trampoline,
        placement: &Placement,
        arguments: &[Vec<u8>],
        result_address: Option<u32>,
    ) -> Result<Value> {
        let convention = self.convention;
        let sp = self.read_core_register(CoreRegister::Sp)?;
        let sp = sp.wrapping_sub(placement.stack_size) & !(convention.stack_alignment() - 1);
        self.write_core_register(CoreRegister::Sp, sp)?;
        if let Some(address) = result_address {
            self.write_core_register(convention.indirect_result_register(), address)?;
        }
        for (slot, bytes) in placement.arguments.iter().zip(arguments) {
            convention.write_argument(self, slot, bytes)?;
        }
        convention.set_return_address(self, trampoline.address)?;
        self.write_core_register(CoreRegister::Pc, entry)?;

        debug!("Calling `{}` at {:#010x}", signature.name, entry);
        self.resume()?;
        let deadline = Deadline::after(self.config.run_timeout());
        let stop = self.wait_stop(&deadline)?;
        let returned = stop.frame_address() == Some(trampoline.address)
            || (stop.is_breakpoint_hit() && stop.breakpoint_number() == Some(trampoline.breakpoint));
        if !returned {
            return Err(Error::UnexpectedStop {
                pc: stop.frame_address().unwrap_or(0),
                reason: stop.describe(),
            });
        }

        match &signature.return_type {
            None => Ok(Value::Void),
            Some(ty) => {
                let bytes = match result_address {
                    Some(address) => self.read_memory(address, ty.size as u32)?,
                    None => convention.read_return(self, ty)?,
                };
                decode(ty, &bytes)
            }
        }
    }

    /// Encodes an argument, copying referenced data into scratch memory.
    fn encode_in_scratch(&mut self, ty: &TypeDescriptor, value: &Value) -> Result<Vec<u8>> {
        let memory = &mut self.memory;
        let mut pending: Vec<(u32, Vec<u8>)> = vec![];
        let mut place = |bytes: &[u8], alignment: u32| -> Result<u32> {
            let address = memory.alloc(
                bytes.len() as u32,
                TargetSession::scratch_alignment(alignment),
            )?;
            pending.push((address, bytes.to_vec()));
            Ok(address)
        };
        let encoded = encode(ty, value, &mut place)?;
        for (address, bytes) in pending {
            self.write_memory(address, &bytes)?;
        }
        Ok(encoded)
    }

    /// Variadic arguments follow the default argument promotions, buffers are passed by address.
    fn encode_variadic(&mut self, value: &Value) -> Result<Vec<u8>> {
        let (bytes, alignment) = match value {
            Value::Bytes(_) | Value::Text(_) => host_layout(value)?,
            Value::Ref(inner) => host_layout(inner)?,
            other => return Ok(host_layout(other)?.0),
        };
        let address = self.place(&bytes, alignment)?;
        Ok(address.to_le_bytes().to_vec())
    }

    fn place(&mut self, bytes: &[u8], alignment: u32) -> Result<u32> {
        let address = self.memory.alloc(
            bytes.len() as u32,
            TargetSession::scratch_alignment(alignment),
        )?;
        self.write_memory(address, bytes)?;
        Ok(address)
    }

    /// Stores a value in scratch memory until the next reset.
    pub fn alloc_value<V: Into<Value>>(&mut self, ty: &TypeDescriptor, value: V) -> Result<TargetPtr> {
        self.require_halted()?;
        let value = value.into();
        check(ty, &value)?;
        let bytes = self.encode_in_scratch(ty, &value)?;
        let address = self.place(&bytes, ty.alignment() as u32)?;
        Ok(TargetPtr(address))
    }

    /// Reads a value of type `ty` stored at `address`.
    pub fn read_value(&mut self, address: TargetPtr, ty: &TypeDescriptor) -> Result<Value> {
        let bytes = self.read_memory(address.address(), ty.size as u32)?;
        decode(ty, &bytes)
    }

    /// Stores `value` as a `ty` at `address`.
    pub fn write_value<V: Into<Value>>(
        &mut self,
        address: TargetPtr,
        ty: &TypeDescriptor,
        value: V,
    ) -> Result<()> {
        let value = value.into();
        check(ty, &value)?;
        let bytes = self.encode_in_scratch(ty, &value)?;
        self.write_memory(address.address(), &bytes)
    }

    /// Reads a global variable through its type.
    pub fn read_variable(&mut self, name: &str) -> Result<Value> {
        let symbol = self.resolve(name)?;
        let ty: Rc<TypeDescriptor> = match symbol.ty {
            Some(ty) => ty,
            None => self.type_of(name)?,
        };
        self.read_value(TargetPtr(symbol.address), &ty)
    }

    pub fn read_memory(&mut self, address: u32, length: u32) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(length as usize);
        let mut offset = 0;
        while offset < length {
            let chunk = (length - offset).min(MEMORY_CHUNK);
            let record = self.execute(Command::ReadMemory {
                address: address.wrapping_add(offset),
                length: chunk,
            })?;
            let contents = memory_contents(&record)?;
            if contents.len() < chunk as usize {
                return Err(Error::Protocol(format!(
                    "read {} of {} bytes at {:#010x}",
                    contents.len(),
                    chunk,
                    address.wrapping_add(offset)
                )));
            }
            bytes.extend_from_slice(&contents[..chunk as usize]);
            offset += chunk;
        }
        Ok(bytes)
    }

    pub fn write_memory(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        for (index, chunk) in bytes.chunks(MEMORY_CHUNK as usize).enumerate() {
            self.execute(Command::WriteMemory {
                address: address.wrapping_add(index as u32 * MEMORY_CHUNK),
                bytes: chunk.to_vec(),
            })?;
        }
        Ok(())
    }

    /// Reads a register by the name the debugger uses for it.
    pub fn read_register(&mut self, name: &str) -> Result<u32> {
        let number = self.register_number(name)?;
        let values = self.read_register_numbers(&[number])?;
        values
            .get(&number)
            .copied()
            .ok_or_else(|| Error::Protocol(format!("no value for register `{}`", name)))
    }

    pub fn write_register(&mut self, name: &str, value: u32) -> Result<()> {
        let number = self.register_number(name)?;
        self.write_register_number(number, value)
    }

    /// The registers a call changes, by name.
    pub fn register_snapshot(&mut self) -> Result<Vec<(String, u32)>> {
        self.load_register_names()?;
        let numbers = self.registers.call_context();
        self.read_register_numbers(&numbers)?;
        Ok(self.registers.get_registers_as_list())
    }

    fn register_number(&mut self, name: &str) -> Result<u16> {
        self.load_register_names()?;
        let name = name.trim_start_matches('$');
        match CoreRegister::from_name(name) {
            Some(register) => self.registers.number(register),
            None => self
                .registers
                .number_of(name)
                .ok_or_else(|| Error::UnknownSymbol(format!("${}", name))),
        }
    }

    fn load_register_names(&mut self) -> Result<()> {
        if self.registers.is_known() {
            return Ok(());
        }
        let record = self.execute(Command::RegisterNames)?;
        let names = record
            .results
            .get_list("register-names")
            .ok_or_else(|| Error::Protocol(format!("no register names: {}", record.results)))?
            .values()
            .iter()
            .map(|name| name.as_str().unwrap_or("").to_string())
            .collect();
        self.registers.set_names(names);
        Ok(())
    }

    fn read_register_numbers(&mut self, numbers: &[u16]) -> Result<HashMap<u16, u32>> {
        let missing: Vec<u32> = numbers
            .iter()
            .filter(|n| self.registers.get_register_value(n).is_none())
            .map(|n| u32::from(*n))
            .collect();
        if !missing.is_empty() {
            let record = self.execute(Command::RegisterValues(missing))?;
            let values = record.results.get_list("register-values").ok_or_else(|| {
                Error::Protocol(format!("no register values: {}", record.results))
            })?;
            for entry in values.values() {
                let entry = match entry.as_tuple() {
                    Some(entry) => entry,
                    None => continue,
                };
                if let (Some(number), Some(value)) = (entry.get_u64("number"), entry.get_u64("value"))
                {
                    self.registers
                        .add_register_value(number as u16, value as u32);
                }
            }
        }

        let mut values = HashMap::new();
        for number in numbers {
            let value = self.registers.get_register_value(number).ok_or_else(|| {
                Error::Protocol(format!("the debugger did not report register {}", number))
            })?;
            values.insert(*number, *value);
        }
        Ok(values)
    }

    fn write_register_number(&mut self, number: u16, value: u32) -> Result<()> {
        let name = self
            .registers
            .name(number)
            .map(|n| n.to_string())
            .ok_or_else(|| Error::UnknownSymbol(format!("register {}", number)))?;
        self.execute(Command::Evaluate(format!("${} = {}", name, value)))?;
        self.registers.add_register_value(number, value);
        Ok(())
    }

    /// Saves the registers a call changes.
    fn save_context(&mut self) -> Result<()> {
        self.load_register_names()?;
        let numbers = self.registers.call_context();
        let context = self.read_register_numbers(&numbers)?;
        self.registers.stash_registers(context);
        trace!("Saved call context {}", self.registers.stash_depth());
        Ok(())
    }

    /// Writes back the registers that differ from the saved context, the program counter last.
    fn restore_context(&mut self) -> Result<()> {
        let saved = match self.registers.pop_stashed_registers() {
            Some(saved) => saved,
            None => return Ok(()),
        };
        let numbers: Vec<u16> = saved.keys().copied().collect();
        let current = self.read_register_numbers(&numbers)?;
        let pc = self.registers.number(CoreRegister::Pc)?;

        let mut changed: Vec<(u16, u32)> = saved
            .into_iter()
            .filter(|(number, value)| current.get(number) != Some(value))
            .collect();
        changed.sort_by_key(|(number, _)| (*number == pc, *number));
        for (number, value) in changed {
            self.write_register_number(number, value)?;
        }
        Ok(())
    }
}

impl TargetAccess for TargetSession {
    fn read_core_register(&mut self, register: CoreRegister) -> Result<u32> {
        self.load_register_names()?;
        let number = self.registers.number(register)?;
        let values = self.read_register_numbers(&[number])?;
        values
            .get(&number)
            .copied()
            .ok_or_else(|| Error::Protocol(format!("no value for {}", register.name())))
    }

    fn write_core_register(&mut self, register: CoreRegister, value: u32) -> Result<()> {
        self.load_register_names()?;
        let number = self.registers.number(register)?;
        self.write_register_number(number, value)
    }

    fn read_memory(&mut self, address: u32, length: u32) -> Result<Vec<u8>> {
        TargetSession::read_memory(self, address, length)
    }

    fn write_memory(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        TargetSession::write_memory(self, address, bytes)
    }
}

/// The value as a C literal for the debugger.
fn literal(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Unsigned(v) => v.to_string(),
        Value::Signed(v) => v.to_string(),
        Value::Float(v) => format!("{:?}", v),
        Value::Bool(v) => (*v as u8).to_string(),
        Value::Pointer(p) => format!("{:#x}", p.address()),
        other => {
            return Err(Error::ArgumentType(format!(
                "a {} cannot be assigned through an expression, use write_value",
                other.get_type()
            )))
        }
    })
}

/// The bytes of a `-data-read-memory-bytes` reply.
fn memory_contents(record: &ResultRecord) -> Result<Vec<u8>> {
    let blocks = record
        .results
        .get_list("memory")
        .ok_or_else(|| Error::Protocol(format!("no memory in reply: {}", record.results)))?;
    let mut bytes = vec![];
    for block in blocks.values() {
        let contents = block
            .as_tuple()
            .and_then(|b| b.get_str("contents"))
            .ok_or_else(|| Error::Protocol(format!("memory block without contents: {}", block)))?;
        bytes.extend(decode_hex(contents)?);
    }
    Ok(bytes)
}

fn decode_hex(text: &str) -> Result<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(Error::Protocol(format!("odd length hex `{}`", text)));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| Error::Protocol(format!("invalid hex `{}`", text)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::record::{List, Tuple, Value as MiValue};
    use crate::mi::ResultClass;

    #[test]
    fn renders_literals() {
        assert_eq!(literal(&Value::Unsigned(42)).unwrap(), "42");
        assert_eq!(literal(&Value::Signed(-3)).unwrap(), "-3");
        assert_eq!(literal(&Value::Bool(true)).unwrap(), "1");
        assert_eq!(literal(&Value::Float(1.5)).unwrap(), "1.5");
        assert_eq!(
            literal(&Value::Pointer(TargetPtr(0x2000_0000))).unwrap(),
            "0x20000000"
        );
        assert!(matches!(
            literal(&Value::Bytes(vec![1, 2])),
            Err(Error::ArgumentType(_))
        ));
    }

    #[test]
    fn decodes_memory_replies() {
        let block = |contents: &str| {
            MiValue::Tuple(Tuple(vec![
                ("begin".to_string(), MiValue::Const("0x20000000".to_string())),
                ("contents".to_string(), MiValue::Const(contents.to_string())),
            ]))
        };
        let record = ResultRecord {
            token: 1000,
            command: "-data-read-memory-bytes".to_string(),
            class: ResultClass::Done,
            results: Tuple(vec![(
                "memory".to_string(),
                MiValue::List(List::Values(vec![block("2a00"), block("ff")])),
            )]),
            console: vec![],
        };
        assert_eq!(memory_contents(&record).unwrap(), vec![0x2a, 0x00, 0xff]);
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
    }
}
