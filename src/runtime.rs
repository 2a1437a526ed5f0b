//! CIL runtime module responsible for creating execution frames and
//! interpreting method bodies.
use std::fmt;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::bytecode::{self, Boundaries, DecodeError, ElementKind, Instruction, OPCode, RawOpcode};
use crate::metadata::{Metadata, MethodBody};
use crate::trace::TraceSink;
use crate::value::{ObjectArray, Tag, Value};

type Result<T> = std::result::Result<T, RuntimeError>;

/// Index space of an out-of-range access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IndexSpace {
    Local,
    Array,
}

impl fmt::Display for IndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local slot"),
            Self::Array => f.write_str("array element"),
        }
    }
}

/// `RuntimeErrorKind` represents the possible errors that can occur
/// while executing an instruction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeErrorKind {
    #[error("unknown opcode {0}")]
    UnknownOpcode(RawOpcode),
    #[error("truncated instruction: {0}")]
    Truncated(DecodeError),
    #[error("branch to {target} is not an instruction boundary")]
    BadBranchTarget { target: i64 },
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: Tag },
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("operand stack overflow, capacity {capacity}")]
    StackOverflow { capacity: usize },
    #[error("{space} index {index} out of range for length {len}")]
    IndexFault {
        space: IndexSpace,
        index: i64,
        len: usize,
    },
    #[error("arithmetic fault: {0}")]
    ArithmeticFault(&'static str),
    #[error("unresolved string token 0x{token:08x}")]
    MetadataFault { token: u32 },
    #[error("negative array length {0}")]
    NegativeArrayLength(i32),
    #[error("{op} not supported for {left} and {right}")]
    NotSupported {
        op: OPCode,
        left: Tag,
        right: Tag,
    },
    #[error("no active frame")]
    NoFrame,
    #[error("instruction budget of {0} exhausted")]
    FuelExhausted(u64),
}

/// `RuntimeError` is a fault raised by an instruction, together with the
/// offset of that instruction in the method body.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("IL_{offset:04x}: {kind}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub offset: usize,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, offset: usize) -> Self {
        Self { kind, offset }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Config {
    /// Fault on opcodes without a handler instead of halting.
    pub strict_opcodes: bool,
    /// Upper bound on executed instructions, unbounded when `None`.
    pub max_instructions: Option<u64>,
}

/// Execution frame of a single method activation. We create a frame each
/// time we start executing a method and destroy it once we leave it.
///
/// The frame holds the program counter, the locals and a bounded operand
/// stack.
#[derive(Debug, Clone)]
pub struct Frame {
    method: Rc<MethodBody>,
    boundaries: Boundaries,
    pc: usize,
    locals: Vec<Value>,
    stack: Vec<Value>,
    max_stack: usize,
}

impl Frame {
    pub fn new(method: Rc<MethodBody>) -> Self {
        Self {
            boundaries: Boundaries::scan(&method.code),
            pc: 0,
            locals: vec![Value::Null; method.local_count],
            stack: Vec::with_capacity(method.max_stack),
            max_stack: method.max_stack,
            method,
        }
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn locals(&self) -> &[Value] {
        &self.locals
    }

    /// Operand stack, bottom first.
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn load_local(&self, index: usize) -> std::result::Result<Value, RuntimeErrorKind> {
        self.locals
            .get(index)
            .cloned()
            .ok_or(RuntimeErrorKind::IndexFault {
                space: IndexSpace::Local,
                index: index as i64,
                len: self.locals.len(),
            })
    }

    pub fn store_local(
        &mut self,
        index: usize,
        value: Value,
    ) -> std::result::Result<(), RuntimeErrorKind> {
        let len = self.locals.len();
        let slot = self.locals.get_mut(index).ok_or(RuntimeErrorKind::IndexFault {
            space: IndexSpace::Local,
            index: index as i64,
            len,
        })?;
        *slot = value;
        Ok(())
    }

    pub fn push_operand(&mut self, value: Value) -> std::result::Result<(), RuntimeErrorKind> {
        if self.stack.len() >= self.max_stack {
            return Err(RuntimeErrorKind::StackOverflow {
                capacity: self.max_stack,
            });
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop_operand(&mut self) -> std::result::Result<Value, RuntimeErrorKind> {
        self.stack.pop().ok_or(RuntimeErrorKind::StackUnderflow)
    }

    pub fn peek_operand(&self) -> std::result::Result<&Value, RuntimeErrorKind> {
        self.stack.last().ok_or(RuntimeErrorKind::StackUnderflow)
    }

    fn pop_int32(&mut self) -> std::result::Result<i32, RuntimeErrorKind> {
        match self.pop_operand()? {
            Value::Int32(v) => Ok(v),
            other => Err(mismatch("int32", &other)),
        }
    }

    fn pop_array(&mut self) -> std::result::Result<ObjectArray, RuntimeErrorKind> {
        match self.pop_operand()? {
            Value::ObjectArray(arr) => Ok(arr),
            other => Err(mismatch("array", &other)),
        }
    }

    /// Pop a branch condition: integers test against zero, `null` is false
    /// and references are true.
    fn pop_condition(&mut self) -> std::result::Result<bool, RuntimeErrorKind> {
        match self.pop_operand()? {
            Value::Int32(v) => Ok(v != 0),
            Value::Int64(v) => Ok(v != 0),
            Value::Null => Ok(false),
            Value::ObjectArray(_) | Value::Utf16String(_) => Ok(true),
            other @ Value::Float64(_) => Err(mismatch("int32", &other)),
        }
    }
}

fn mismatch(expected: &'static str, found: &Value) -> RuntimeErrorKind {
    RuntimeErrorKind::TypeMismatch {
        expected,
        found: found.tag(),
    }
}

/// Stack of frames, the last one is the frame being executed.
#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a frame sized from `method` and make it current.
    pub fn push(&mut self, method: Rc<MethodBody>) {
        self.frames.push(Frame::new(method));
    }

    /// Discard the current frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn current(&self) -> std::result::Result<&Frame, RuntimeErrorKind> {
        self.frames.last().ok_or(RuntimeErrorKind::NoFrame)
    }

    pub fn current_mut(&mut self) -> std::result::Result<&mut Frame, RuntimeErrorKind> {
        self.frames.last_mut().ok_or(RuntimeErrorKind::NoFrame)
    }

    pub fn load_local(&self, index: usize) -> std::result::Result<Value, RuntimeErrorKind> {
        self.current()?.load_local(index)
    }

    pub fn store_local(
        &mut self,
        index: usize,
        value: Value,
    ) -> std::result::Result<(), RuntimeErrorKind> {
        self.current_mut()?.store_local(index, value)
    }

    pub fn push_operand(&mut self, value: Value) -> std::result::Result<(), RuntimeErrorKind> {
        self.current_mut()?.push_operand(value)
    }

    pub fn pop_operand(&mut self) -> std::result::Result<Value, RuntimeErrorKind> {
        self.current_mut()?.pop_operand()
    }
}

/// Why the interpreter loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// A `ret` instruction executed.
    Returned,
    /// The program counter ran off the end of the body.
    EndOfStream,
    /// An opcode without a handler was met and the runtime is not strict.
    Halted { opcode: RawOpcode, offset: usize },
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Returned => f.write_str("returned"),
            Self::EndOfStream => f.write_str("end of method body"),
            Self::Halted { opcode, offset } => {
                write!(f, "halted on opcode {opcode} at IL_{offset:04x}")
            }
        }
    }
}

/// Final state of a method execution, taken from its frame when popped.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub termination: Termination,
    pub locals: Vec<Value>,
    /// Operand stack, bottom first.
    pub stack: Vec<Value>,
    /// Number of instructions executed.
    pub executed: u64,
}

/// Control flow after one instruction.
enum Flow {
    Next,
    Jump(i64),
    Return,
}

/// `Runtime` represents an execution context for CIL method bodies and is
/// responsible for interpreting their instructions. String literals are
/// resolved through the `Metadata` bridge.
pub struct Runtime<'m> {
    metadata: &'m dyn Metadata,
    frames: CallStack,
    config: Config,
}

impl<'m> Runtime<'m> {
    pub fn new(metadata: &'m dyn Metadata, config: Config) -> Self {
        Self {
            metadata,
            frames: CallStack::new(),
            config,
        }
    }

    /// Resolve `type_name::method_name` through the metadata and execute it.
    pub fn invoke(
        &mut self,
        type_name: &str,
        method_name: &str,
        sink: &mut dyn TraceSink,
    ) -> crate::error::Result<Outcome> {
        let method = self
            .metadata
            .method_body(type_name, method_name)
            .ok_or_else(|| crate::error::Error::EntryPointNotFound {
                type_name: type_name.to_string(),
                method: method_name.to_string(),
            })?;
        debug!(
            type_name,
            method_name,
            code_size = method.code.len(),
            locals = method.local_count,
            max_stack = method.max_stack,
            "entering method"
        );
        Ok(self.execute(Rc::new(method), sink)?)
    }

    /// Push a frame for `method`, run it to completion and pop it. The
    /// frame is popped on every exit path.
    pub fn execute(&mut self, method: Rc<MethodBody>, sink: &mut dyn TraceSink) -> Result<Outcome> {
        let depth = self.frames.depth();
        self.frames.push(method);
        let mut executed = 0;
        let result = self.run(sink, &mut executed);
        let frame = self.frames.pop();
        debug_assert_eq!(self.frames.depth(), depth);

        let termination = result?;
        let frame = frame.ok_or(RuntimeError::new(RuntimeErrorKind::NoFrame, 0))?;
        Ok(Outcome {
            termination,
            locals: frame.locals,
            stack: frame.stack,
            executed,
        })
    }

    /// Interpreter loop over the current frame.
    fn run(&mut self, sink: &mut dyn TraceSink, executed: &mut u64) -> Result<Termination> {
        let depth = self.frames.depth();
        let method = {
            let frame = self.frames.current().map_err(|kind| RuntimeError::new(kind, 0))?;
            Rc::clone(&frame.method)
        };
        let code = &method.code;

        loop {
            let frame = self.frames.current().map_err(|kind| RuntimeError::new(kind, 0))?;
            let pc = frame.pc;
            if pc >= code.len() {
                return Ok(Termination::EndOfStream);
            }
            if let Some(limit) = self.config.max_instructions {
                if *executed >= limit {
                    return Err(RuntimeError::new(RuntimeErrorKind::FuelExhausted(limit), pc));
                }
            }

            let inst = match bytecode::decode(code, pc) {
                Ok(inst) => inst,
                Err(DecodeError::Unknown(opcode)) => {
                    if self.config.strict_opcodes {
                        return Err(RuntimeError::new(RuntimeErrorKind::UnknownOpcode(opcode), pc));
                    }
                    warn!(offset = pc, "cannot decode opcode {opcode}, halting");
                    return Ok(Termination::Halted { opcode, offset: pc });
                }
                Err(err @ DecodeError::Truncated { .. }) => {
                    return Err(RuntimeError::new(RuntimeErrorKind::Truncated(err), pc));
                }
            };

            sink.record(depth, &inst, frame.stack());
            *executed += 1;

            let flow = self.step(&inst).map_err(|kind| RuntimeError::new(kind, pc))?;
            let frame = self.frames.current_mut().map_err(|kind| RuntimeError::new(kind, pc))?;
            match flow {
                Flow::Next => frame.pc = inst.next(),
                Flow::Jump(target) => {
                    let valid = usize::try_from(target)
                        .ok()
                        .filter(|t| frame.boundaries.contains(*t));
                    match valid {
                        Some(t) => frame.pc = t,
                        None => {
                            return Err(RuntimeError::new(
                                RuntimeErrorKind::BadBranchTarget { target },
                                pc,
                            ))
                        }
                    }
                }
                Flow::Return => return Ok(Termination::Returned),
            }
        }
    }

    /// Evaluate a given instruction against the current frame.
    fn step(&mut self, inst: &Instruction) -> std::result::Result<Flow, RuntimeErrorKind> {
        let frame = self.frames.current_mut()?;
        match inst.opcode {
            OPCode::Nop | OPCode::Break => {}

            OPCode::Ldloc(_) | OPCode::LdlocS => {
                let value = frame.load_local(local_index(inst))?;
                frame.push_operand(value)?;
            }
            OPCode::Stloc(_) | OPCode::StlocS => {
                let value = frame.pop_operand()?;
                frame.store_local(local_index(inst), value)?;
            }

            OPCode::Ldnull => frame.push_operand(Value::Null)?,
            OPCode::LdcI4Const(_)
            | OPCode::LdcI4S
            | OPCode::LdcI4
            | OPCode::LdcI8
            | OPCode::LdcR4
            | OPCode::LdcR8 => {
                let value = match inst.operand {
                    bytecode::Operand::Int32(v) => Value::Int32(v),
                    bytecode::Operand::Int64(v) => Value::Int64(v),
                    bytecode::Operand::Float64(v) => Value::Float64(v),
                    _ => Value::Null,
                };
                frame.push_operand(value)?;
            }

            OPCode::Dup => {
                // Cloning a value shares array storage.
                let value = frame.peek_operand()?.clone();
                frame.push_operand(value)?;
            }
            OPCode::Pop => {
                frame.pop_operand()?;
            }
            OPCode::Ret => return Ok(Flow::Return),

            OPCode::BrS | OPCode::Br => return Ok(Flow::Jump(branch_target(inst))),
            OPCode::BrfalseS | OPCode::Brfalse => {
                if !frame.pop_condition()? {
                    return Ok(Flow::Jump(branch_target(inst)));
                }
            }
            OPCode::BrtrueS | OPCode::Brtrue => {
                if frame.pop_condition()? {
                    return Ok(Flow::Jump(branch_target(inst)));
                }
            }

            OPCode::Add => apply_binary(frame, BinaryOp::Add)?,
            OPCode::Sub => apply_binary(frame, BinaryOp::Sub)?,
            OPCode::Mul => apply_binary(frame, BinaryOp::Mul)?,
            OPCode::Div => apply_binary(frame, BinaryOp::Div)?,
            OPCode::Rem => apply_binary(frame, BinaryOp::Rem)?,
            OPCode::And => apply_binary(frame, BinaryOp::And)?,
            OPCode::Or => apply_binary(frame, BinaryOp::Or)?,
            OPCode::Xor => apply_binary(frame, BinaryOp::Xor)?,
            OPCode::Shl | OPCode::Shr => {
                let amount = frame.pop_int32()?;
                let value = frame.pop_int32()?;
                // Shift amounts are taken modulo the operand width.
                let shifted = if inst.opcode == OPCode::Shl {
                    value.wrapping_shl(amount as u32)
                } else {
                    value.wrapping_shr(amount as u32)
                };
                frame.push_operand(Value::Int32(shifted))?;
            }
            OPCode::Neg => {
                let value = frame.pop_int32()?;
                frame.push_operand(Value::Int32(value.wrapping_neg()))?;
            }
            OPCode::Not => {
                let value = frame.pop_int32()?;
                frame.push_operand(Value::Int32(!value))?;
            }

            OPCode::ConvI1 | OPCode::ConvI2 | OPCode::ConvI4 | OPCode::ConvI8 => {
                let value = frame.pop_operand()?;
                let wide = match value {
                    Value::Int32(v) => i64::from(v),
                    Value::Int64(v) => v,
                    // Truncates toward zero, saturating out of range.
                    Value::Float64(v) => v as i64,
                    other => return Err(mismatch("numeric", &other)),
                };
                let converted = match inst.opcode {
                    OPCode::ConvI1 => Value::Int32(i32::from(wide as i8)),
                    OPCode::ConvI2 => Value::Int32(i32::from(wide as i16)),
                    OPCode::ConvI4 => Value::Int32(wide as i32),
                    _ => Value::Int64(wide),
                };
                frame.push_operand(converted)?;
            }

            OPCode::Ldstr => {
                let token = token(inst);
                let literal = self
                    .metadata
                    .user_string(token)
                    .ok_or(RuntimeErrorKind::MetadataFault { token })?;
                frame.push_operand(Value::Utf16String(literal))?;
            }

            // The element type token is not used, every array holds values.
            OPCode::Newarr => {
                let len = frame.pop_int32()?;
                if len < 0 {
                    return Err(RuntimeErrorKind::NegativeArrayLength(len));
                }
                frame.push_operand(Value::ObjectArray(ObjectArray::new(len as usize)))?;
            }
            OPCode::Ldlen => {
                let arr = frame.pop_array()?;
                frame.push_operand(Value::Int32(arr.len() as i32))?;
            }
            OPCode::Ldelem(kind) => {
                let index = frame.pop_int32()?;
                let arr = frame.pop_array()?;
                let element = arr.get(array_index(&arr, index)?).unwrap_or_default();
                frame.push_operand(load_element(kind, element)?)?;
            }
            OPCode::Stelem(kind) => {
                let value = frame.pop_operand()?;
                let index = frame.pop_int32()?;
                let arr = frame.pop_array()?;
                let index = array_index(&arr, index)?;
                arr.set(index, store_element(kind, value)?);
            }

            OPCode::Ceq => {
                let v1 = frame.pop_operand()?;
                let v2 = frame.pop_operand()?;
                let equal = match (&v1, &v2) {
                    (Value::Int32(i1), Value::Int32(i2)) => i1 == i2,
                    // Identity for arrays, structural for everything else.
                    _ => v1 == v2,
                };
                frame.push_operand(Value::Int32(equal as i32))?;
            }
            OPCode::Cgt | OPCode::Clt => {
                let v1 = frame.pop_operand()?;
                let v2 = frame.pop_operand()?;
                let (i1, i2) = match (&v1, &v2) {
                    (Value::Int32(i1), Value::Int32(i2)) => (*i1, *i2),
                    _ => {
                        return Err(RuntimeErrorKind::NotSupported {
                            op: inst.opcode,
                            left: v2.tag(),
                            right: v1.tag(),
                        })
                    }
                };
                // v2 was pushed first and is the left operand.
                let holds = if inst.opcode == OPCode::Cgt {
                    i2 > i1
                } else {
                    i2 < i1
                };
                frame.push_operand(Value::Int32(holds as i32))?;
            }
        }
        Ok(Flow::Next)
    }
}

fn local_index(inst: &Instruction) -> usize {
    match inst.operand {
        bytecode::Operand::Local(n) => usize::from(n),
        _ => 0,
    }
}

fn branch_target(inst: &Instruction) -> i64 {
    inst.branch_target().unwrap_or(inst.next() as i64)
}

fn token(inst: &Instruction) -> u32 {
    match inst.operand {
        bytecode::Operand::Token(tok) => tok,
        _ => 0,
    }
}

/// Two operand `Int32` arithmetic and bitwise operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
}

fn apply_binary(frame: &mut Frame, op: BinaryOp) -> std::result::Result<(), RuntimeErrorKind> {
    let a = frame.pop_int32()?;
    let b = frame.pop_int32()?;
    frame.push_operand(Value::Int32(binary(op, a, b)?))
}

/// Binary `Int32` operation where `a` was popped first and `b` second.
fn binary(op: BinaryOp, a: i32, b: i32) -> std::result::Result<i32, RuntimeErrorKind> {
    let result = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => b.wrapping_sub(a),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div | BinaryOp::Rem => {
            if a == 0 {
                return Err(RuntimeErrorKind::ArithmeticFault("division by zero"));
            }
            let checked = if op == BinaryOp::Div {
                b.checked_div(a)
            } else {
                b.checked_rem(a)
            };
            checked.ok_or(RuntimeErrorKind::ArithmeticFault("overflow"))?
        }
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
    };
    Ok(result)
}

fn array_index(arr: &ObjectArray, index: i32) -> std::result::Result<usize, RuntimeErrorKind> {
    let len = arr.len();
    usize::try_from(index)
        .ok()
        .filter(|i| *i < len)
        .ok_or(RuntimeErrorKind::IndexFault {
            space: IndexSpace::Array,
            index: i64::from(index),
            len,
        })
}

/// Re-tag an element to the width of a typed load. `null` elements read
/// as zero, the default of a freshly allocated typed array.
fn load_element(kind: ElementKind, element: Value) -> std::result::Result<Value, RuntimeErrorKind> {
    if kind == ElementKind::Ref {
        return Ok(element);
    }
    let element = match (kind, element) {
        (ElementKind::R4 | ElementKind::R8, Value::Null) => Value::Float64(0.0),
        (_, Value::Null) => Value::Int64(0),
        (_, element) => element,
    };
    let value = match kind {
        ElementKind::R4 | ElementKind::R8 => match element {
            Value::Float64(v) if kind == ElementKind::R4 => Value::Float64(f64::from(v as f32)),
            Value::Float64(v) => Value::Float64(v),
            other => return Err(mismatch("float64", &other)),
        },
        _ => {
            let v = element
                .as_integer()
                .ok_or_else(|| mismatch("integer", &element))?;
            match kind {
                ElementKind::I1 => Value::Int32(i32::from(v as i8)),
                ElementKind::U1 => Value::Int32(i32::from(v as u8)),
                ElementKind::I2 => Value::Int32(i32::from(v as i16)),
                ElementKind::U2 => Value::Int32(i32::from(v as u16)),
                // u4 keeps the bit pattern in an int32 slot.
                ElementKind::I4 | ElementKind::U4 => Value::Int32(v as i32),
                _ => Value::Int64(v),
            }
        }
    };
    Ok(value)
}

/// Narrow or widen `value` to the width of a typed store.
fn store_element(kind: ElementKind, value: Value) -> std::result::Result<Value, RuntimeErrorKind> {
    let stored = match kind {
        ElementKind::Ref => value,
        ElementKind::R4 => match value {
            Value::Float64(v) => Value::Float64(f64::from(v as f32)),
            other => return Err(mismatch("float64", &other)),
        },
        ElementKind::R8 => match value {
            Value::Float64(v) => Value::Float64(v),
            other => return Err(mismatch("float64", &other)),
        },
        _ => {
            let v = value
                .as_integer()
                .ok_or_else(|| mismatch("integer", &value))?;
            match kind {
                ElementKind::I1 | ElementKind::U1 => Value::Int32(i32::from(v as i8)),
                ElementKind::I2 | ElementKind::U2 => Value::Int32(i32::from(v as i16)),
                ElementKind::I4 | ElementKind::U4 => Value::Int32(v as i32),
                _ => Value::Int64(v),
            }
        }
    };
    Ok(stored)
}
