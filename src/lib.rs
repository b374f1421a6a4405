//! cortado: a small interpreter for Java class files.
pub mod bytecode;
pub mod class;
pub mod cli;
pub mod heap;
mod interpreter;
pub mod jvm;
pub mod method_area;
pub mod native;
pub mod profiler;
pub mod program;
pub mod runtime;
pub mod stack;
pub mod trace;
pub mod value;

#[cfg(test)]
mod testing;
