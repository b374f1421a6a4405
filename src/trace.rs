//! Stack traces of thrown exceptions.
use std::fmt;

use crate::method_area::ClassRegistry;
use crate::stack::Stack;

/// One activation in a captured trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceElement {
    pub class_name: String,
    pub method_name: String,
    pub source_file: Option<String>,
    pub pc: usize,
}

/// Snapshot of the call stack at the point an exception was thrown,
/// innermost activation first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTrace {
    pub exception_class: String,
    pub message: Option<String>,
    pub elements: Vec<TraceElement>,
}

impl StackTrace {
    pub fn capture(
        classes: &ClassRegistry,
        stack: &Stack,
        exception_class: &str,
        message: Option<String>,
    ) -> Self {
        let elements = stack
            .frames()
            .iter()
            .rev()
            .map(|frame| {
                let class = classes.get(frame.class);
                TraceElement {
                    class_name: class.name.clone(),
                    method_name: class.method(frame.method).name.clone(),
                    source_file: class.source_file.clone(),
                    pc: frame.pc,
                }
            })
            .collect();
        Self {
            exception_class: exception_class.to_string(),
            message,
            elements,
        }
    }
}

impl fmt::Display for TraceElement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let class = self.class_name.replace('/', ".");
        match &self.source_file {
            Some(file) => write!(f, "{class}.{}({file})", self.method_name),
            None => write!(f, "{class}.{}(pc {})", self.method_name, self.pc),
        }
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.exception_class.replace('/', "."))?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        for element in &self.elements {
            write!(f, "\n\tat {element}")?;
        }
        Ok(())
    }
}
