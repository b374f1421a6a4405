//! Opcode profiler for the interpreter. Counts how often every opcode
//! executes and renders the counts as a report once the program ends.
use std::fmt::Write;

use crate::bytecode::OPCode;

#[derive(Debug)]
pub struct Profiler {
    counts: [u64; 256],
    total: u64,
}

impl Profiler {
    pub fn new() -> Profiler {
        Profiler {
            counts: [0; 256],
            total: 0,
        }
    }

    pub fn record(&mut self, opcode: u8) {
        self.counts[opcode as usize] += 1;
        self.total += 1;
    }

    pub fn count(&self, opcode: u8) -> u64 {
        self.counts[opcode as usize]
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Executed opcodes, most frequent first.
    pub fn report(&self) -> String {
        let mut executed: Vec<(u8, u64)> = (0..=255u8)
            .map(|opcode| (opcode, self.counts[opcode as usize]))
            .filter(|&(_, count)| count > 0)
            .collect();
        executed.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut report = format!("opcode statistics ({} executed)\n", self.total);
        for (opcode, count) in executed {
            let share = count as f64 * 100.0 / self.total as f64;
            let _ = writeln!(
                report,
                "{:>16} {:>12} {:>6.2}%",
                OPCode::from(opcode).mnemonic(),
                count,
                share
            );
        }
        report
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}
