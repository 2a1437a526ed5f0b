//! CIL opcode table and instruction decoder.
//!
//! Every supported opcode knows its exact encoded length, so the decoder
//! can step over inline operands and the runtime can check that branch
//! targets land on instruction boundaries.
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Escape byte introducing the two byte opcodes.
pub const EXTENDED_PREFIX: u8 = 0xFE;

/// Width of an array element accessed by `ldelem.*` and `stelem.*`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ElementKind {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    /// Native int, 64 bits wide here.
    I,
    R4,
    R8,
    Ref,
}

impl ElementKind {
    fn suffix(self) -> &'static str {
        match self {
            Self::I1 => "i1",
            Self::U1 => "u1",
            Self::I2 => "i2",
            Self::U2 => "u2",
            Self::I4 => "i4",
            Self::U4 => "u4",
            Self::I8 => "i8",
            Self::I => "i",
            Self::R4 => "r4",
            Self::R8 => "r8",
            Self::Ref => "ref",
        }
    }
}

/// Supported CIL opcodes.
///
/// Compact forms that imply their operand (`ldloc.2`, `ldc.i4.m1`) carry it
/// in the variant, forms with an inline operand get it from the decoded
/// [`Instruction`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OPCode {
    Nop,
    Break,
    /// `ldloc.0` to `ldloc.3`.
    Ldloc(u8),
    /// `stloc.0` to `stloc.3`.
    Stloc(u8),
    LdlocS,
    StlocS,
    Ldnull,
    /// `ldc.i4.m1` to `ldc.i4.8`.
    LdcI4Const(i8),
    LdcI4S,
    LdcI4,
    LdcI8,
    LdcR4,
    LdcR8,
    Dup,
    Pop,
    Ret,
    BrS,
    BrfalseS,
    BrtrueS,
    Br,
    Brfalse,
    Brtrue,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Neg,
    Not,
    ConvI1,
    ConvI2,
    ConvI4,
    ConvI8,
    Ldstr,
    Newarr,
    Ldlen,
    Ldelem(ElementKind),
    Stelem(ElementKind),
    Ceq,
    Cgt,
    Clt,
}

impl OPCode {
    /// Look up a single byte opcode.
    pub fn from_byte(byte: u8) -> Option<Self> {
        let op = match byte {
            0x00 => Self::Nop,
            0x01 => Self::Break,
            0x06..=0x09 => Self::Ldloc(byte - 0x06),
            0x0A..=0x0D => Self::Stloc(byte - 0x0A),
            0x11 => Self::LdlocS,
            0x13 => Self::StlocS,
            0x14 => Self::Ldnull,
            // ldc.i4.m1 is 0x15, ldc.i4.0 is 0x16.
            0x15..=0x1E => Self::LdcI4Const(byte as i8 - 0x16),
            0x1F => Self::LdcI4S,
            0x20 => Self::LdcI4,
            0x21 => Self::LdcI8,
            0x22 => Self::LdcR4,
            0x23 => Self::LdcR8,
            0x25 => Self::Dup,
            0x26 => Self::Pop,
            0x2A => Self::Ret,
            0x2B => Self::BrS,
            0x2C => Self::BrfalseS,
            0x2D => Self::BrtrueS,
            0x38 => Self::Br,
            0x39 => Self::Brfalse,
            0x3A => Self::Brtrue,
            0x58 => Self::Add,
            0x59 => Self::Sub,
            0x5A => Self::Mul,
            0x5B => Self::Div,
            0x5D => Self::Rem,
            0x5F => Self::And,
            0x60 => Self::Or,
            0x61 => Self::Xor,
            0x62 => Self::Shl,
            0x63 => Self::Shr,
            0x65 => Self::Neg,
            0x66 => Self::Not,
            0x67 => Self::ConvI1,
            0x68 => Self::ConvI2,
            0x69 => Self::ConvI4,
            0x6A => Self::ConvI8,
            0x72 => Self::Ldstr,
            0x8D => Self::Newarr,
            0x8E => Self::Ldlen,
            0x90 => Self::Ldelem(ElementKind::I1),
            0x91 => Self::Ldelem(ElementKind::U1),
            0x92 => Self::Ldelem(ElementKind::I2),
            0x93 => Self::Ldelem(ElementKind::U2),
            0x94 => Self::Ldelem(ElementKind::I4),
            0x95 => Self::Ldelem(ElementKind::U4),
            0x96 => Self::Ldelem(ElementKind::I8),
            0x97 => Self::Ldelem(ElementKind::I),
            0x98 => Self::Ldelem(ElementKind::R4),
            0x99 => Self::Ldelem(ElementKind::R8),
            0x9A => Self::Ldelem(ElementKind::Ref),
            0x9B => Self::Stelem(ElementKind::I),
            0x9C => Self::Stelem(ElementKind::I1),
            0x9D => Self::Stelem(ElementKind::I2),
            0x9E => Self::Stelem(ElementKind::I4),
            0x9F => Self::Stelem(ElementKind::I8),
            0xA0 => Self::Stelem(ElementKind::R4),
            0xA1 => Self::Stelem(ElementKind::R8),
            0xA2 => Self::Stelem(ElementKind::Ref),
            _ => return None,
        };
        Some(op)
    }

    /// Look up the second byte of an `0xFE`-prefixed opcode.
    pub fn from_extended(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Ceq),
            0x02 => Some(Self::Cgt),
            0x04 => Some(Self::Clt),
            _ => None,
        }
    }

    pub fn is_extended(self) -> bool {
        matches!(self, Self::Ceq | Self::Cgt | Self::Clt)
    }

    /// Size in bytes of the inline operand following the opcode.
    pub fn operand_size(self) -> usize {
        match self {
            Self::LdlocS | Self::StlocS | Self::LdcI4S => 1,
            Self::BrS | Self::BrfalseS | Self::BrtrueS => 1,
            Self::LdcI4 | Self::LdcR4 => 4,
            Self::Br | Self::Brfalse | Self::Brtrue => 4,
            Self::Ldstr | Self::Newarr => 4,
            Self::LdcI8 | Self::LdcR8 => 8,
            _ => 0,
        }
    }

    /// Total encoded length, opcode bytes included.
    pub fn encoded_len(self) -> usize {
        let opcode = if self.is_extended() { 2 } else { 1 };
        opcode + self.operand_size()
    }
}

impl fmt::Display for OPCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Nop => "nop",
            Self::Break => "break",
            Self::Ldloc(n) => return write!(f, "ldloc.{n}"),
            Self::Stloc(n) => return write!(f, "stloc.{n}"),
            Self::LdlocS => "ldloc.s",
            Self::StlocS => "stloc.s",
            Self::Ldnull => "ldnull",
            Self::LdcI4Const(-1) => "ldc.i4.m1",
            Self::LdcI4Const(n) => return write!(f, "ldc.i4.{n}"),
            Self::LdcI4S => "ldc.i4.s",
            Self::LdcI4 => "ldc.i4",
            Self::LdcI8 => "ldc.i8",
            Self::LdcR4 => "ldc.r4",
            Self::LdcR8 => "ldc.r8",
            Self::Dup => "dup",
            Self::Pop => "pop",
            Self::Ret => "ret",
            Self::BrS => "br.s",
            Self::BrfalseS => "brfalse.s",
            Self::BrtrueS => "brtrue.s",
            Self::Br => "br",
            Self::Brfalse => "brfalse",
            Self::Brtrue => "brtrue",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Rem => "rem",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Shl => "shl",
            Self::Shr => "shr",
            Self::Neg => "neg",
            Self::Not => "not",
            Self::ConvI1 => "conv.i1",
            Self::ConvI2 => "conv.i2",
            Self::ConvI4 => "conv.i4",
            Self::ConvI8 => "conv.i8",
            Self::Ldstr => "ldstr",
            Self::Newarr => "newarr",
            Self::Ldlen => "ldlen",
            Self::Ldelem(kind) => return write!(f, "ldelem.{}", kind.suffix()),
            Self::Stelem(kind) => return write!(f, "stelem.{}", kind.suffix()),
            Self::Ceq => "ceq",
            Self::Cgt => "cgt",
            Self::Clt => "clt",
        };
        f.write_str(name)
    }
}

/// Raw opcode bytes that have no handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RawOpcode {
    pub byte: u8,
    /// Second byte when `byte` is the extended prefix.
    pub extended: Option<u8>,
}

impl fmt::Display for RawOpcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.extended {
            Some(second) => write!(f, "0x{:02X} 0x{:02X}", self.byte, second),
            None => write!(f, "0x{:02X}", self.byte),
        }
    }
}

/// Inline operand of a decoded instruction.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Operand {
    None,
    Local(u8),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    /// Signed displacement relative to the end of the instruction.
    Branch(i32),
    Token(u32),
}

/// A decoded instruction and the offset it was read from.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Instruction {
    pub offset: usize,
    pub opcode: OPCode,
    pub operand: Operand,
}

impl Instruction {
    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.opcode.encoded_len()
    }

    /// Offset of the byte following the instruction and its operand.
    pub fn next(&self) -> usize {
        self.offset + self.size()
    }

    /// Branch target relative to the end of the instruction. May be out of
    /// range, the caller validates it against the stream.
    pub fn branch_target(&self) -> Option<i64> {
        match self.operand {
            Operand::Branch(disp) => Some(self.next() as i64 + i64::from(disp)),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "IL_{:04x}: {}", self.offset, self.opcode)?;
        match self.operand {
            Operand::None => Ok(()),
            // Compact forms carry their operand in the mnemonic.
            Operand::Local(_) if !matches!(self.opcode, OPCode::LdlocS | OPCode::StlocS) => Ok(()),
            Operand::Int32(_) if matches!(self.opcode, OPCode::LdcI4Const(_)) => Ok(()),
            Operand::Local(n) => write!(f, " {n}"),
            Operand::Int32(v) => write!(f, " {v}"),
            Operand::Int64(v) => write!(f, " {v}"),
            Operand::Float64(v) => write!(f, " {v:?}"),
            Operand::Branch(_) => match self.branch_target() {
                Some(target) => write!(f, " IL_{target:04x}"),
                None => Ok(()),
            },
            Operand::Token(tok) => write!(f, " 0x{tok:08x}"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("no handler for opcode {0}")]
    Unknown(RawOpcode),
    #[error("instruction at {offset} needs {needed} bytes, {available} left")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

/// Decode the instruction starting at `offset`.
///
/// `offset` must be inside `code`.
pub fn decode(code: &[u8], offset: usize) -> Result<Instruction, DecodeError> {
    let available = code.len().saturating_sub(offset);
    let byte = *code.get(offset).ok_or(DecodeError::Truncated {
        offset,
        needed: 1,
        available,
    })?;

    let opcode = if byte == EXTENDED_PREFIX {
        let second = *code.get(offset + 1).ok_or(DecodeError::Truncated {
            offset,
            needed: 2,
            available,
        })?;
        OPCode::from_extended(second).ok_or(DecodeError::Unknown(RawOpcode {
            byte,
            extended: Some(second),
        }))?
    } else {
        OPCode::from_byte(byte).ok_or(DecodeError::Unknown(RawOpcode {
            byte,
            extended: None,
        }))?
    };

    let needed = opcode.encoded_len();
    if available < needed {
        return Err(DecodeError::Truncated {
            offset,
            needed,
            available,
        });
    }
    let start = offset + needed - opcode.operand_size();
    let raw = &code[start..offset + needed];

    let operand = match opcode {
        OPCode::Ldloc(n) | OPCode::Stloc(n) => Operand::Local(n),
        OPCode::LdlocS | OPCode::StlocS => Operand::Local(raw[0]),
        OPCode::LdcI4Const(v) => Operand::Int32(i32::from(v)),
        OPCode::LdcI4S => Operand::Int32(i32::from(raw[0] as i8)),
        OPCode::LdcI4 => Operand::Int32(LittleEndian::read_i32(raw)),
        OPCode::LdcI8 => Operand::Int64(LittleEndian::read_i64(raw)),
        OPCode::LdcR4 => Operand::Float64(f64::from(LittleEndian::read_f32(raw))),
        OPCode::LdcR8 => Operand::Float64(LittleEndian::read_f64(raw)),
        OPCode::BrS | OPCode::BrfalseS | OPCode::BrtrueS => {
            Operand::Branch(i32::from(raw[0] as i8))
        }
        OPCode::Br | OPCode::Brfalse | OPCode::Brtrue => {
            Operand::Branch(LittleEndian::read_i32(raw))
        }
        OPCode::Ldstr | OPCode::Newarr => Operand::Token(LittleEndian::read_u32(raw)),
        _ => Operand::None,
    };

    Ok(Instruction {
        offset,
        opcode,
        operand,
    })
}

/// Encoded length of any ECMA-335 instruction at `offset`, handled by the
/// runtime or not. Undefined opcodes count as bare opcodes. `None` when the
/// instruction runs past the end of `code`.
pub fn encoded_len_at(code: &[u8], offset: usize) -> Option<usize> {
    let byte = *code.get(offset)?;
    let len = if byte == EXTENDED_PREFIX {
        let operand = match *code.get(offset + 1)? {
            // ldftn, ldvirtftn, initobj, constrained., sizeof
            0x06 | 0x07 | 0x15 | 0x16 | 0x1C => 4,
            // ldarg, ldarga, starg, ldloc, ldloca, stloc
            0x09..=0x0E => 2,
            // unaligned., no.
            0x12 | 0x19 => 1,
            _ => 0,
        };
        2 + operand
    } else {
        let operand = match byte {
            // ldarg.s through stloc.s, ldc.i4.s, short branches, leave.s
            0x0E..=0x13 | 0x1F | 0x2B..=0x37 | 0xDE => 1,
            // ldc.i4, ldc.r4, jmp, call, calli, long branches
            0x20 | 0x22 | 0x27..=0x29 | 0x38..=0x44 => 4,
            // token operands: callvirt through isinst, unbox, field access,
            // stobj, box, newarr, ldelema, ldelem, stelem, unbox.any,
            // refanyval, mkrefany, ldtoken, leave
            0x6F..=0x75 | 0x79 | 0x7B..=0x81 | 0x8C | 0x8D | 0x8F => 4,
            0xA3..=0xA5 | 0xC2 | 0xC6 | 0xD0 | 0xDD => 4,
            0x21 | 0x23 => 8,
            // switch: a count followed by that many int32 targets
            0x45 => {
                let count = code.get(offset + 1..offset + 5)?;
                let count = usize::try_from(LittleEndian::read_u32(count)).ok()?;
                count.checked_mul(4)?.checked_add(4)?
            }
            _ => 0,
        };
        1 + operand
    };
    let end = offset.checked_add(len)?;
    (end <= code.len()).then_some(len)
}

/// Instruction start offsets of a method body.
///
/// Built by a linear sweep from offset 0 using the full opcode table, so
/// opcodes without a handler still skip their inline operands. The sweep
/// stops at a truncated instruction. The end of the stream is always a
/// boundary.
#[derive(Debug, Clone)]
pub struct Boundaries {
    starts: Vec<bool>,
}

impl Boundaries {
    pub fn scan(code: &[u8]) -> Self {
        let mut starts = vec![false; code.len() + 1];
        starts[code.len()] = true;
        let mut offset = 0;
        while offset < code.len() {
            starts[offset] = true;
            offset += match encoded_len_at(code, offset) {
                Some(len) => len,
                None => break,
            };
        }
        Self { starts }
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.starts.get(offset).copied().unwrap_or(false)
    }
}
