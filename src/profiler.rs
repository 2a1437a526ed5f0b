//! Execution profiler for the interpreter. Counts executed instructions
//! and keeps track of loop entries: an instruction reached by moving the
//! program counter backwards is a loop header, and once its entry count
//! exceeds the threshold it is considered hot.
use std::collections::HashMap;

use crate::bytecode::Instruction;
use crate::trace::TraceSink;
use crate::value::Value;

#[derive(Debug)]
pub struct Profiler {
    // Threshold before a loop entry is considered hot.
    threshold: usize,
    // Last executed program counter and its call depth.
    last_pc: Option<(usize, usize)>,
    // Record of loop entries and their access counts, keyed by pc.
    records: HashMap<usize, usize>,
    // Instructions seen.
    executed: u64,
}

impl Profiler {
    pub fn new() -> Profiler {
        Profiler::with_threshold(2)
    }

    pub fn with_threshold(threshold: usize) -> Profiler {
        Profiler {
            threshold,
            last_pc: None,
            records: HashMap::new(),
            executed: 0,
        }
    }

    /// Count a visit of `pc` at call depth `depth`.
    pub fn count_entry(&mut self, depth: usize, pc: usize) {
        if let Some((last_depth, last_pc)) = self.last_pc {
            if depth == last_depth && pc <= last_pc {
                *self.records.entry(pc).or_insert(0) += 1;
            }
        }
        self.last_pc = Some((depth, pc));
        self.executed += 1;
    }

    pub fn is_hot(&self, pc: usize) -> bool {
        self.entries(pc) > self.threshold
    }

    /// Number of times the loop header at `pc` was entered.
    pub fn entries(&self, pc: usize) -> usize {
        self.records.get(&pc).copied().unwrap_or(0)
    }

    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Entry counts above this mark a loop as hot.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Every loop header with its entry count, by offset.
    pub fn loops(&self) -> Vec<(usize, usize)> {
        let mut loops: Vec<_> = self
            .records
            .iter()
            .map(|(pc, count)| (*pc, *count))
            .collect();
        loops.sort_unstable();
        loops
    }

    /// Loop headers entered more than `threshold` times.
    pub fn hot_loops(&self) -> Vec<(usize, usize)> {
        let mut hot = self.loops();
        hot.retain(|(_, count)| *count > self.threshold);
        hot
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceSink for Profiler {
    fn record(&mut self, depth: usize, inst: &Instruction, _stack: &[Value]) {
        self.count_entry(depth, inst.offset);
    }
}
