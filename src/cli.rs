//! Command line surface of the `cortado` binary.
//!
//! The launcher accepts Java style single dash options (`-cp`, `-stack`)
//! in any letter case. They are rewritten into clap's `--long` form before
//! parsing; everything from the main class on is passed to the program
//! untouched.
use std::env;

use clap::Parser as ClapParser;
use log::LevelFilter;

use crate::method_area::Classpath;
use crate::runtime::RuntimeSettings;
use crate::stack::{DEFAULT_STACK_SIZE, MAX_STACK_SIZE};

/// Environment variable consulted when no classpath option is given.
pub const CLASSPATH_VAR: &str = "CORTADO_CLASSPATH";

/// Options that take a value.
const VALUE_OPTIONS: [&str; 3] = ["cp", "classpath", "stack"];
const FLAG_OPTIONS: [&str; 6] = ["silent", "mem", "memory", "opcodestats", "all", "help"];

#[derive(ClapParser, Debug)]
#[command(author, version, about = "A small Java virtual machine", long_about = None)]
pub struct Cli {
    #[arg(
        long = "classpath",
        visible_alias = "cp",
        value_name = "PATH",
        help = "Class search path; defaults to $CORTADO_CLASSPATH, else ."
    )]
    pub classpath: Option<String>,

    #[arg(
        long,
        value_name = "BYTES",
        default_value_t = DEFAULT_STACK_SIZE as u32,
        value_parser = clap::value_parser!(u32).range(0..=MAX_STACK_SIZE as i64),
        help = "Maximum size of the call stack in bytes"
    )]
    pub stack: u32,

    #[arg(long, help = "Only log warnings and errors")]
    pub silent: bool,

    #[arg(long, visible_alias = "memory", help = "Report heap, stack and class statistics")]
    pub mem: bool,

    #[arg(long, help = "Report how often each opcode executed")]
    pub opcodestats: bool,

    #[arg(long, help = "Trace every instruction and report all statistics")]
    pub all: bool,

    #[arg(help = "Class declaring `public static void main(String[])`")]
    pub main_class: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true, help = "Program arguments")]
    pub args: Vec<String>,
}

impl Cli {
    /// Parse the process arguments.
    pub fn from_env() -> Self {
        Self::parse_from(normalize_args(env::args()))
    }

    pub fn settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            stack_size: self.stack as usize,
            opcode_stats: self.opcodestats || self.all,
            memory_stats: self.mem || self.all,
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        if self.all {
            LevelFilter::Trace
        } else if self.silent {
            LevelFilter::Warn
        } else {
            LevelFilter::Info
        }
    }

    /// Classpath from the option, the environment, or the working directory.
    pub fn classpath(&self) -> Classpath {
        let path_list = self
            .classpath
            .clone()
            .or_else(|| env::var(CLASSPATH_VAR).ok())
            .unwrap_or_else(|| ".".to_string());
        Classpath::parse(&path_list)
    }
}

/// Rewrite launcher options to clap's syntax. The first argument is the
/// program name; option parsing stops at the first non option, which is the
/// main class.
pub fn normalize_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut args = args.into_iter();
    let mut normalized: Vec<String> = args.next().into_iter().collect();
    while let Some(arg) = args.next() {
        let Some(name) = arg.strip_prefix('-') else {
            normalized.push(arg);
            normalized.extend(trailing(args));
            return normalized;
        };
        let lower = name.trim_start_matches('-').to_ascii_lowercase();
        if VALUE_OPTIONS.contains(&lower.as_str()) {
            normalized.push(format!("--{lower}"));
            normalized.extend(args.next());
        } else if FLAG_OPTIONS.contains(&lower.as_str()) {
            normalized.push(format!("--{lower}"));
        } else {
            normalized.push(arg);
        }
    }
    normalized
}

/// Program arguments, fenced off so that clap does not read them as options.
fn trailing(args: impl Iterator<Item = String>) -> Vec<String> {
    let rest: Vec<String> = args.collect();
    if rest.is_empty() {
        return rest;
    }
    std::iter::once("--".to_string()).chain(rest).collect()
}
