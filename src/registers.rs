use std::collections::HashMap;

use crate::error::{Error, Result};

/// Core registers of the target, named the way the debugger names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreRegister {
    /// `r0` to `r12`.
    R(u8),
    Sp,
    Lr,
    Pc,
    Xpsr,
}

impl CoreRegister {
    /// All registers a function call may change.
    pub const CALL_CONTEXT: [CoreRegister; 17] = [
        CoreRegister::R(0),
        CoreRegister::R(1),
        CoreRegister::R(2),
        CoreRegister::R(3),
        CoreRegister::R(4),
        CoreRegister::R(5),
        CoreRegister::R(6),
        CoreRegister::R(7),
        CoreRegister::R(8),
        CoreRegister::R(9),
        CoreRegister::R(10),
        CoreRegister::R(11),
        CoreRegister::R(12),
        CoreRegister::Sp,
        CoreRegister::Lr,
        CoreRegister::Pc,
        CoreRegister::Xpsr,
    ];

    pub fn name(&self) -> String {
        match self {
            CoreRegister::R(n) => format!("r{}", n),
            CoreRegister::Sp => "sp".to_string(),
            CoreRegister::Lr => "lr".to_string(),
            CoreRegister::Pc => "pc".to_string(),
            CoreRegister::Xpsr => "xpsr".to_string(),
        }
    }

    pub fn from_name(name: &str) -> Option<CoreRegister> {
        match name {
            "sp" | "r13" => Some(CoreRegister::Sp),
            "lr" | "r14" => Some(CoreRegister::Lr),
            "pc" | "r15" => Some(CoreRegister::Pc),
            "xpsr" | "cpsr" => Some(CoreRegister::Xpsr),
            _ => {
                let n: u8 = name.strip_prefix('r')?.parse().ok()?;
                if n <= 12 {
                    Some(CoreRegister::R(n))
                } else {
                    None
                }
            }
        }
    }
}

/// A struct to hold the register numbering of the target and saved register contexts.
#[derive(Debug, Clone, Default)]
pub struct Registers {
    /// Register names indexed by the debugger's register number. Unused numbers have empty names.
    names: Vec<String>,

    /// The register numbers of the core registers.
    numbers: HashMap<CoreRegister, u16>,

    /// Holds the register values read last.
    pub registers: HashMap<u16, u32>,

    /// Saved register contexts of calls in progress, innermost last.
    stashed_registers: Vec<HashMap<u16, u32>>,
}

impl Registers {
    /// Sets the register numbering.
    ///
    /// Description:
    ///
    /// * `names` - The register names as listed by `-data-list-register-names`.
    ///
    /// The register number is the position in the list. `cpsr` stands in for `xpsr` on targets
    /// that do not name it.
    pub fn set_names(&mut self, names: Vec<String>) {
        self.numbers.clear();
        for (number, name) in names.iter().enumerate() {
            if let Some(register) = CoreRegister::from_name(name) {
                if name == "cpsr" && names.iter().any(|n| n == "xpsr") {
                    continue;
                }
                self.numbers.entry(register).or_insert(number as u16);
            }
        }
        self.names = names;
    }

    pub fn is_known(&self) -> bool {
        !self.names.is_empty()
    }

    pub fn number(&self, register: CoreRegister) -> Result<u16> {
        self.numbers
            .get(&register)
            .copied()
            .ok_or_else(|| Error::Protocol(format!("the target has no register `{}`", register.name())))
    }

    /// The number of a register given by name, e.g. `r0` or `msp`.
    pub fn number_of(&self, name: &str) -> Option<u16> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|n| n as u16)
    }

    pub fn name(&self, number: u16) -> Option<&str> {
        self.names
            .get(number as usize)
            .map(|n| n.as_str())
            .filter(|n| !n.is_empty())
    }

    /// The numbers of the call context registers the target has.
    pub fn call_context(&self) -> Vec<u16> {
        CoreRegister::CALL_CONTEXT
            .iter()
            .filter_map(|r| self.numbers.get(r).copied())
            .collect()
    }

    /// Add a register value to the struct.
    pub fn add_register_value(&mut self, register: u16, value: u32) {
        self.registers.insert(register, value);
    }

    /// Retrieve a register value.
    pub fn get_register_value(&self, register: &u16) -> Option<&u32> {
        self.registers.get(register)
    }

    /// Forgets the register values read last.
    pub fn clear(&mut self) {
        self.registers = HashMap::new();
    }

    /// Saves a register context before a call changes it.
    ///
    /// Description:
    ///
    /// * `context` - Register values by number.
    ///
    /// Contexts are restored in the opposite order of saving, one per nested call.
    pub fn stash_registers(&mut self, context: HashMap<u16, u32>) {
        self.stashed_registers.push(context);
    }

    /// Pop the stashed register values of the innermost call.
    pub fn pop_stashed_registers(&mut self) -> Option<HashMap<u16, u32>> {
        self.stashed_registers.pop()
    }

    /// Number of saved contexts.
    pub fn stash_depth(&self) -> usize {
        self.stashed_registers.len()
    }

    /// Get the register values as a list of names and values.
    pub fn get_registers_as_list(&self) -> Vec<(String, u32)> {
        let mut res: Vec<(u16, u32)> = self.registers.iter().map(|(n, v)| (*n, *v)).collect();
        res.sort_by(|a, b| a.0.cmp(&b.0));
        res.into_iter()
            .map(|(n, v)| {
                let name = self
                    .name(n)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| format!("${}", n));
                (name, v)
            })
            .collect()
    }
}
