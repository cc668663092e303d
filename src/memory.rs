//! Memory models: where the trampoline and the scratch memory used by calls live.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Written below the scratch region of the flash model, checked after every call.
pub const STACK_CANARY: u32 = 0xabad_1dea;

/// Two Thumb `nop` instructions, hosting the trampoline breakpoint of the SRAM model.
pub const THUMB_NOPS: [u8; 4] = [0x00, 0xbf, 0x00, 0xbf];

/// Default alignment of scratch allocations.
pub const SCRATCH_ALIGNMENT: u32 = 4;

fn default_trampoline() -> String {
    "Reset_Handler".to_string()
}

fn default_halt_location() -> String {
    "main".to_string()
}

fn default_scratch_size() -> u32 {
    0x400
}

fn default_hook() -> String {
    "DOTT_test_hook_chained".to_string()
}

fn default_hook_trampoline() -> String {
    "DOTT_test_hook".to_string()
}

/// Selected once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryModel {
    /// No scratch memory. Calls with scalar arguments work if a trampoline is named.
    None {
        #[serde(default)]
        trampoline: Option<String>,
    },

    /// The trampoline is a flash resident function, the scratch memory is taken from the stack.
    Flash {
        #[serde(default = "default_trampoline")]
        trampoline: String,
        #[serde(default = "default_halt_location")]
        halt_location: String,
        #[serde(default = "default_scratch_size")]
        scratch_size: u32,
    },

    /// A dedicated SRAM region holds the trampoline followed by the scratch memory.
    Sram {
        base: u32,
        size: u32,
        #[serde(default = "default_halt_location")]
        halt_location: String,
    },

    /// The firmware halts in a hook whose arguments describe a scratch buffer.
    TestHook {
        #[serde(default = "default_hook")]
        hook: String,
        #[serde(default = "default_hook_trampoline")]
        trampoline: String,
    },
}

impl Default for MemoryModel {
    fn default() -> Self {
        MemoryModel::None { trampoline: None }
    }
}

impl MemoryModel {
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryModel::None { .. } => "none",
            MemoryModel::Flash { .. } => "flash",
            MemoryModel::Sram { .. } => "sram",
            MemoryModel::TestHook { .. } => "test_hook",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            MemoryModel::Sram { size, .. } if *size <= THUMB_NOPS.len() as u32 => Err(
                Error::Config(format!("sram region of {} bytes is too small", size)),
            ),
            MemoryModel::Flash { scratch_size, .. } if *scratch_size == 0 => {
                Err(Error::Config("flash scratch_size must not be 0".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// A position in the scratch memory to release back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchMark(u32);

/// Bump allocator over a target memory region.
#[derive(Debug, Clone, PartialEq)]
pub struct ScratchArena {
    base: u32,
    size: u32,
    next: u32,
}

impl ScratchArena {
    pub fn new(base: u32, size: u32) -> ScratchArena {
        ScratchArena {
            base,
            size,
            next: base,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn used(&self) -> u32 {
        self.next - self.base
    }

    pub fn available(&self) -> u32 {
        self.size - self.used()
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.base && address - self.base < self.size
    }

    /// Reserves `size` bytes aligned to `alignment`, which must be a power of two.
    pub fn alloc(&mut self, size: u32, alignment: u32) -> Result<u32> {
        let alignment = alignment.max(1);
        let start = (u64::from(self.next) + u64::from(alignment) - 1) & !(u64::from(alignment) - 1);
        let end = start + u64::from(size.max(1));
        if end > u64::from(self.base) + u64::from(self.size) {
            return Err(Error::ScratchExhausted {
                requested: size,
                available: self.available(),
            });
        }
        self.next = end as u32;
        Ok(start as u32)
    }

    pub fn mark(&self) -> ScratchMark {
        ScratchMark(self.next)
    }

    /// Frees everything allocated after `mark`.
    pub fn release(&mut self, mark: ScratchMark) {
        if mark.0 >= self.base && mark.0 <= self.next {
            self.next = mark.0;
        }
    }

    pub fn reset(&mut self) {
        self.next = self.base;
    }
}

/// Where calls return to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trampoline {
    pub address: u32,
    pub breakpoint: u32,
}

/// The prepared memory model of a halted target.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub trampoline: Option<Trampoline>,
    pub arena: Option<ScratchArena>,
    /// Address of the canary word of the flash model.
    pub canary: Option<u32>,
}

impl MemoryState {
    pub fn alloc(&mut self, size: u32, alignment: u32) -> Result<u32> {
        match self.arena.as_mut() {
            Some(arena) => arena.alloc(size, alignment),
            None => Err(Error::ScratchExhausted {
                requested: size,
                available: 0,
            }),
        }
    }

    pub fn mark(&self) -> Option<ScratchMark> {
        self.arena.as_ref().map(|a| a.mark())
    }

    pub fn release(&mut self, mark: Option<ScratchMark>) {
        if let (Some(arena), Some(mark)) = (self.arena.as_mut(), mark) {
            arena.release(mark);
        }
    }
}
