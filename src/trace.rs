//! Instruction tracing for the runtime.
//!
//! The runtime reports every instruction it is about to execute to a
//! [`TraceSink`]. Tracing is opt-in: [`NoTrace`] drops everything,
//! [`LogTrace`] forwards to `tracing`, and [`TraceRecorder`] keeps the
//! executed instructions in memory.
use tracing::debug;

use crate::bytecode::{Instruction, OPCode};
use crate::value::Value;

/// Receives each instruction before it executes, together with the call
/// depth (1 for the entry frame) and the operand stack at that point.
pub trait TraceSink {
    fn record(&mut self, depth: usize, inst: &Instruction, stack: &[Value]);
}

/// Sink that ignores everything.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoTrace;

impl TraceSink for NoTrace {
    fn record(&mut self, _depth: usize, _inst: &Instruction, _stack: &[Value]) {}
}

/// Sink emitting one `debug` event per instruction.
#[derive(Debug, Default, Copy, Clone)]
pub struct LogTrace;

impl TraceSink for LogTrace {
    fn record(&mut self, depth: usize, inst: &Instruction, stack: &[Value]) {
        debug!(depth, stack = stack.len(), "{inst}");
    }
}

/// Each record entry is a pair of (pc, opcode) where pc is the offset of
/// the instruction in the method body.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RecordEntry {
    pub pc: usize,
    pub depth: usize,
    pub opcode: OPCode,
}

/// Keeps every executed instruction.
#[derive(Debug, Default, Clone)]
pub struct TraceRecorder {
    trace: Vec<RecordEntry>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[RecordEntry] {
        &self.trace
    }

    /// Offsets of the executed instructions, in execution order.
    pub fn pcs(&self) -> Vec<usize> {
        self.trace.iter().map(|entry| entry.pc).collect()
    }

    pub fn clear(&mut self) {
        self.trace.clear();
    }
}

impl TraceSink for TraceRecorder {
    fn record(&mut self, depth: usize, inst: &Instruction, _stack: &[Value]) {
        self.trace.push(RecordEntry {
            pc: inst.offset,
            depth,
            opcode: inst.opcode,
        });
    }
}

impl<T: TraceSink + ?Sized> TraceSink for &mut T {
    fn record(&mut self, depth: usize, inst: &Instruction, stack: &[Value]) {
        (**self).record(depth, inst, stack);
    }
}

/// Fan out to two sinks.
impl<A: TraceSink, B: TraceSink> TraceSink for (A, B) {
    fn record(&mut self, depth: usize, inst: &Instruction, stack: &[Value]) {
        self.0.record(depth, inst, stack);
        self.1.record(depth, inst, stack);
    }
}
