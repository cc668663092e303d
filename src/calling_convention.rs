//! Where arguments and return values of a function live on the target.
//!
//! This is the only place with knowledge of the target's procedure call standard. The rest of
//! the engine places arguments and fabricates returns through [`CallingConvention`].

use crate::error::{Error, Result};
use crate::registers::CoreRegister;
use crate::symbols::{ScalarEncoding, TypeDescriptor, TypeKind};

/// Register and memory access to a halted target.
pub trait TargetAccess {
    fn read_core_register(&mut self, register: CoreRegister) -> Result<u32>;

    fn write_core_register(&mut self, register: CoreRegister, value: u32) -> Result<()>;

    fn read_memory(&mut self, address: u32, length: u32) -> Result<Vec<u8>>;

    fn write_memory(&mut self, address: u32, bytes: &[u8]) -> Result<()>;
}

/// What the calling convention needs to know about an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgumentShape {
    pub size: u32,
    pub alignment: u32,
    pub composite: bool,
    pub signed: bool,
}

impl ArgumentShape {
    pub fn of(ty: &TypeDescriptor) -> ArgumentShape {
        ArgumentShape {
            size: ty.size as u32,
            alignment: ty.alignment() as u32,
            composite: ty.is_aggregate(),
            signed: matches!(ty.kind, TypeKind::Scalar(ScalarEncoding::Signed)),
        }
    }

    /// A word sized scalar.
    pub fn word() -> ArgumentShape {
        ArgumentShape {
            size: 4,
            alignment: 4,
            composite: false,
            signed: false,
        }
    }
}

/// A part of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Piece {
    Register { register: CoreRegister, size: u32 },
    /// `offset` is relative to the stack pointer at function entry.
    Stack { offset: u32, size: u32 },
}

impl Piece {
    pub fn size(&self) -> u32 {
        match self {
            Piece::Register { size, .. } | Piece::Stack { size, .. } => *size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentSlot {
    pub shape: ArgumentShape,
    /// In argument byte order.
    pub pieces: Vec<Piece>,
}

/// The location of every argument of one call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Placement {
    /// The first register carries the address the result is to be written to.
    pub indirect_result: bool,
    pub arguments: Vec<ArgumentSlot>,
    /// Stack bytes the arguments occupy at function entry.
    pub stack_size: u32,
}

pub trait CallingConvention {
    /// Assigns every argument its registers and stack locations.
    fn place(&self, return_type: Option<&TypeDescriptor>, arguments: &[ArgumentShape])
        -> Placement;

    /// True if a value of this type is returned through memory.
    fn returns_indirectly(&self, ty: &TypeDescriptor) -> bool;

    /// Required stack pointer alignment at a call.
    fn stack_alignment(&self) -> u32;

    /// The register holding the address a result is written to.
    fn indirect_result_register(&self) -> CoreRegister;

    /// Reads a value returned in registers.
    fn read_return(&self, target: &mut dyn TargetAccess, ty: &TypeDescriptor) -> Result<Vec<u8>>;

    /// Places a return value the way the function would have, valid at function entry.
    fn write_return(
        &self,
        target: &mut dyn TargetAccess,
        ty: &TypeDescriptor,
        bytes: &[u8],
    ) -> Result<()>;

    fn return_address(&self, target: &mut dyn TargetAccess) -> Result<u32>;

    fn set_return_address(&self, target: &mut dyn TargetAccess, address: u32) -> Result<()>;

    /// Reads the bytes of an argument, valid at function entry.
    fn read_argument(&self, target: &mut dyn TargetAccess, slot: &ArgumentSlot) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(slot.shape.size as usize);
        for piece in &slot.pieces {
            match *piece {
                Piece::Register { register, size } => {
                    let value = target.read_core_register(register)?;
                    bytes.extend_from_slice(&value.to_le_bytes()[..size.min(4) as usize]);
                }
                Piece::Stack { offset, size } => {
                    let sp = target.read_core_register(CoreRegister::Sp)?;
                    bytes.extend(target.read_memory(sp.wrapping_add(offset), size)?);
                }
            }
        }
        Ok(bytes)
    }

    /// Overwrites an argument, valid at function entry.
    fn write_argument(
        &self,
        target: &mut dyn TargetAccess,
        slot: &ArgumentSlot,
        bytes: &[u8],
    ) -> Result<()> {
        if bytes.len() as u32 != slot.shape.size {
            return Err(Error::ArgumentType(format!(
                "argument takes {} bytes, got {}",
                slot.shape.size,
                bytes.len()
            )));
        }
        let mut rest = bytes;
        for piece in &slot.pieces {
            let size = piece.size() as usize;
            let (chunk, tail) = rest.split_at(size.min(rest.len()));
            rest = tail;
            let word = extend_to_word(chunk, slot.shape.signed && !slot.shape.composite);
            match *piece {
                Piece::Register { register, .. } => {
                    let mut value = [0; 4];
                    value.copy_from_slice(&word[..4]);
                    target.write_core_register(register, u32::from_le_bytes(value))?;
                }
                Piece::Stack { offset, .. } => {
                    let sp = target.read_core_register(CoreRegister::Sp)?;
                    target.write_memory(sp.wrapping_add(offset), &word)?;
                }
            }
        }
        Ok(())
    }

    /// Makes the halted function return to its caller with `value` as result.
    ///
    /// Returns the address execution continues at.
    fn force_return(
        &self,
        target: &mut dyn TargetAccess,
        return_type: Option<&TypeDescriptor>,
        value: &[u8],
    ) -> Result<u32> {
        if let Some(ty) = return_type {
            self.write_return(target, ty, value)?;
        }
        let address = self.return_address(target)?;
        target.write_core_register(CoreRegister::Pc, address)?;
        Ok(address)
    }
}

/// Widens a chunk to whole words, sign extending narrow signed scalars.
fn extend_to_word(chunk: &[u8], signed: bool) -> Vec<u8> {
    let len = ((chunk.len() + 3) / 4).max(1) * 4;
    let negative = signed && chunk.last().map_or(false, |b| b & 0x80 != 0);
    let fill = if negative { 0xff } else { 0 };
    let mut word = chunk.to_vec();
    word.resize(len, fill);
    word
}

/// The base procedure call standard for 32-bit Arm (soft float), as used by Cortex-M code.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aapcs;

const ARGUMENT_REGISTERS: u32 = 4;

impl CallingConvention for Aapcs {
    fn place(
        &self,
        return_type: Option<&TypeDescriptor>,
        arguments: &[ArgumentShape],
    ) -> Placement {
        let indirect_result = return_type.map_or(false, |ty| self.returns_indirectly(ty));
        // Next core register number and next stacked argument address.
        let mut ncrn: u32 = if indirect_result { 1 } else { 0 };
        let mut nsaa: u32 = 0;
        let mut slots = vec![];

        for shape in arguments {
            let words = ((shape.size + 3) / 4).max(1);
            let doubleword = shape.alignment >= 8;
            if doubleword && ncrn % 2 == 1 {
                ncrn += 1;
            }

            let mut pieces = vec![];
            if ncrn + words <= ARGUMENT_REGISTERS {
                pieces.extend(register_pieces(ncrn, shape.size));
                ncrn += words;
            } else if shape.composite && ncrn < ARGUMENT_REGISTERS && nsaa == 0 {
                let in_registers = (ARGUMENT_REGISTERS - ncrn) * 4;
                pieces.extend(register_pieces(ncrn, in_registers));
                pieces.push(Piece::Stack {
                    offset: nsaa,
                    size: shape.size - in_registers,
                });
                nsaa += (words * 4) - in_registers;
                ncrn = ARGUMENT_REGISTERS;
            } else {
                ncrn = ARGUMENT_REGISTERS;
                if doubleword {
                    nsaa = (nsaa + 7) & !7;
                }
                pieces.push(Piece::Stack {
                    offset: nsaa,
                    size: shape.size,
                });
                nsaa += words * 4;
            }
            slots.push(ArgumentSlot {
                shape: *shape,
                pieces,
            });
        }

        Placement {
            indirect_result,
            arguments: slots,
            stack_size: (nsaa + 7) & !7,
        }
    }

    fn returns_indirectly(&self, ty: &TypeDescriptor) -> bool {
        ty.is_aggregate() && ty.size > 4
    }

    fn stack_alignment(&self) -> u32 {
        8
    }

    fn indirect_result_register(&self) -> CoreRegister {
        CoreRegister::R(0)
    }

    fn read_return(&self, target: &mut dyn TargetAccess, ty: &TypeDescriptor) -> Result<Vec<u8>> {
        let size = ty.size as usize;
        if self.returns_indirectly(ty) || size > 8 {
            return Err(Error::ArgumentType(format!(
                "`{}` is not returned in registers",
                ty.name
            )));
        }
        let mut bytes = target.read_core_register(CoreRegister::R(0))?.to_le_bytes().to_vec();
        if size > 4 {
            bytes.extend_from_slice(&target.read_core_register(CoreRegister::R(1))?.to_le_bytes());
        }
        bytes.truncate(size);
        Ok(bytes)
    }

    fn write_return(
        &self,
        target: &mut dyn TargetAccess,
        ty: &TypeDescriptor,
        bytes: &[u8],
    ) -> Result<()> {
        if bytes.len() as u64 != ty.size {
            return Err(Error::ArgumentType(format!(
                "`{}` takes {} bytes, got {}",
                ty.name,
                ty.size,
                bytes.len()
            )));
        }
        if self.returns_indirectly(ty) {
            let address = target.read_core_register(self.indirect_result_register())?;
            return target.write_memory(address, bytes);
        }
        let signed = matches!(ty.kind, TypeKind::Scalar(ScalarEncoding::Signed));
        let words = extend_to_word(bytes, signed);
        for (index, chunk) in words.chunks(4).take(2).enumerate() {
            let mut value = [0; 4];
            value.copy_from_slice(chunk);
            target.write_core_register(CoreRegister::R(index as u8), u32::from_le_bytes(value))?;
        }
        Ok(())
    }

    fn return_address(&self, target: &mut dyn TargetAccess) -> Result<u32> {
        Ok(target.read_core_register(CoreRegister::Lr)? & !1)
    }

    fn set_return_address(&self, target: &mut dyn TargetAccess, address: u32) -> Result<()> {
        // Thumb state.
        target.write_core_register(CoreRegister::Lr, address | 1)
    }
}

fn register_pieces(first: u32, size: u32) -> Vec<Piece> {
    let mut pieces = vec![];
    let mut left = size;
    let mut register = first;
    while left > 0 {
        let chunk = left.min(4);
        pieces.push(Piece::Register {
            register: CoreRegister::R(register as u8),
            size: chunk,
        });
        left -= chunk;
        register += 1;
    }
    pieces
}
