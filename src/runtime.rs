//! JVM runtime module responsible for creating a new runtime
//! environment and running programs.
use std::fmt;
use std::io::{self, Write};

use log::{debug, info, warn};

use crate::class::{ClassId, ConstantPoolEntry, MethodRef, RuntimeClass};
use crate::heap::ObjectHeap;
use crate::method_area::{ClassRegistry, ClassSource, OBJECT_CLASS, STRING_CLASS};
use crate::native::{NativeBridge, NativeEnv, NativeRegistry};
use crate::profiler::Profiler;
use crate::stack::{Stack, DEFAULT_STACK_SIZE};
use crate::trace::StackTrace;
use crate::value::{Reference, Slot};

pub type Result<T> = std::result::Result<T, RuntimeError>;

const MAIN_DESCRIPTOR: &str = "([Ljava/lang/String;)V";

/// `RuntimeErrorKind` represents the possible errors that can occur
/// during runtime. All of them end the run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// Class file or bytecode that cannot be decoded.
    MalformedInput,
    /// Missing class, method, field or native implementation.
    ResolutionFailure,
    /// Class structure contradicts how it is used.
    IncompatibleClassChange,
    OutOfMemory,
    StackOverflow,
    UnsupportedOperation,
    Arithmetic,
    NullPointer,
    ArrayIndexOutOfBounds,
    NegativeArraySize,
    ClassCast,
    /// A Java exception left the outermost frame.
    UncaughtException,
}

impl RuntimeErrorKind {
    fn describe(self) -> &'static str {
        match self {
            Self::MalformedInput => "malformed input",
            Self::ResolutionFailure => "resolution failure",
            Self::IncompatibleClassChange => "incompatible class change",
            Self::OutOfMemory => "out of memory",
            Self::StackOverflow => "stack overflow",
            Self::UnsupportedOperation => "unsupported operation",
            Self::Arithmetic => "arithmetic exception",
            Self::NullPointer => "null pointer",
            Self::ArrayIndexOutOfBounds => "array index out of bounds",
            Self::NegativeArraySize => "negative array size",
            Self::ClassCast => "class cast exception",
            Self::UncaughtException => "uncaught exception",
        }
    }
}

/// `RuntimeError` is a custom type used to handle and represents
/// possible execution failures.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    kind: RuntimeErrorKind,
    message: String,
    /// Java exception still looking for a handler, with its trace.
    pending: Option<(Reference, StackTrace)>,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            pending: None,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::MalformedInput, message)
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::ResolutionFailure, message)
    }

    pub fn incompatible(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::IncompatibleClassChange, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::UnsupportedOperation, message)
    }

    /// A thrown Java exception on its way to a handler.
    pub(crate) fn thrown(exception: Reference, trace: StackTrace) -> Self {
        Self {
            kind: RuntimeErrorKind::UncaughtException,
            message: trace.to_string(),
            pending: Some((exception, trace)),
        }
    }

    pub fn kind(&self) -> RuntimeErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The uncaught Java exception, if this error carries one.
    pub fn exception(&self) -> Option<Reference> {
        self.pending.as_ref().map(|(exception, _)| *exception)
    }

    pub fn stack_trace(&self) -> Option<&StackTrace> {
        self.pending.as_ref().map(|(_, trace)| trace)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind.describe(), self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Tunables of a runtime instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Stack limit in bytes.
    pub stack_size: usize,
    pub opcode_stats: bool,
    pub memory_stats: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            opcode_stats: false,
            memory_stats: false,
        }
    }
}

/// `Runtime` owns the method area, the heap and the call stack and runs
/// programs on them.
pub struct Runtime {
    pub(crate) classes: ClassRegistry,
    pub(crate) heap: ObjectHeap,
    pub(crate) stack: Stack,
    pub(crate) profiler: Option<Profiler>,
    natives: Box<dyn NativeBridge>,
    output: Box<dyn Write>,
    settings: RuntimeSettings,
}

impl Runtime {
    pub fn new(source: Box<dyn ClassSource>, settings: RuntimeSettings) -> Self {
        Self {
            classes: ClassRegistry::new(source),
            heap: ObjectHeap::new(),
            stack: Stack::new(settings.stack_size),
            profiler: settings.opcode_stats.then(Profiler::new),
            natives: Box::new(NativeRegistry::with_builtins()),
            output: Box::new(io::stdout()),
            settings,
        }
    }

    /// Redirect program output (`PrintStream.print`, statistics).
    pub fn with_output(mut self, output: Box<dyn Write>) -> Self {
        self.output = output;
        self
    }

    pub fn with_natives(mut self, natives: Box<dyn NativeBridge>) -> Self {
        self.natives = natives;
        self
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    pub fn classes_mut(&mut self) -> &mut ClassRegistry {
        &mut self.classes
    }

    pub fn heap(&self) -> &ObjectHeap {
        &self.heap
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Run `public static void main(String[])` of `main_class` (dotted or
    /// internal name) with `args`.
    pub fn start(&mut self, main_class: &str, args: &[String]) -> Result<()> {
        let name = main_class.replace('.', "/");
        info!("starting {name}");
        let result = match self.run_main(&name, args) {
            Err(err) if err.pending.is_some() => Err(self.report_uncaught(err)),
            other => other,
        };
        self.report_statistics()?;
        self.flush()?;
        result
    }

    fn run_main(&mut self, name: &str, args: &[String]) -> Result<()> {
        for system_class in [OBJECT_CLASS, STRING_CLASS] {
            let id = self.classes.get_class(system_class)?;
            self.ensure_initialized(id)?;
        }
        let main = self.classes.get_class(name)?;
        let class = self.classes.class(main);
        let index = class
            .find_method("main", MAIN_DESCRIPTOR)
            .filter(|&index| class.method(index).is_static())
            .ok_or_else(|| {
                RuntimeError::resolution(format!(
                    "{name} has no public static void main(String[])"
                ))
            })?;

        let string_class = self.classes.get_class(STRING_CLASS)?;
        let array = self
            .heap
            .new_reference_array(&mut self.classes, string_class, args.len() as i32)?;
        for (i, arg) in args.iter().enumerate() {
            let string = self.heap.new_string(&mut self.classes, arg)?;
            self.heap.store_element(array, i as i32, string.to_slot())?;
        }
        self.ensure_initialized(main)?;

        self.stack.push_reference(array);
        self.invoke(MethodRef { class: main, index })?;
        self.execute(0)
    }

    /// Call a static method and return its result slots, deepest first.
    pub fn call_static(
        &mut self,
        class_name: &str,
        name: &str,
        descriptor: &str,
        args: &[Slot],
    ) -> Result<Vec<Slot>> {
        let class = self.classes.get_class(class_name)?;
        self.ensure_initialized(class)?;
        let target = self
            .classes
            .resolve_method(class, name, descriptor)
            .ok_or_else(|| {
                RuntimeError::resolution(format!("no method {class_name}.{name}{descriptor}"))
            })?;
        let return_slots = self.classes.get(target.class).method(target.index).return_slots;
        let (base, height) = (self.stack.depth(), self.stack.height());
        for &arg in args {
            self.stack.push(arg);
        }
        if let Err(err) = self.invoke(target).and_then(|()| self.execute(base)) {
            self.stack.unwind_to(base, height);
            return Err(err);
        }
        let mut results = (0..return_slots)
            .map(|_| self.stack.pop())
            .collect::<Result<Vec<Slot>>>()?;
        results.reverse();
        Ok(results)
    }

    /// Initialize `id` and its ancestors if not done yet, running
    /// `<clinit>` on a nested interpreter loop.
    pub fn ensure_initialized(&mut self, id: ClassId) -> Result<()> {
        let class = self.classes.class(id);
        if class.is_initialized() {
            return Ok(());
        }
        if let Some(parent) = class.super_class {
            self.ensure_initialized(parent)?;
        }
        // Flag first so that the initializer may use its own class.
        class.mark_initialized();
        debug!("initializing {}", class.name);
        self.apply_constant_values(&class)?;
        if let Some(index) = class.find_method("<clinit>", "()V") {
            let base = self.stack.depth();
            self.invoke(MethodRef { class: id, index })?;
            self.execute(base)?;
        }
        Ok(())
    }

    fn apply_constant_values(&mut self, class: &RuntimeClass) -> Result<()> {
        for variable in class.static_variables() {
            let Some(index) = variable.constant_value else {
                continue;
            };
            match class.entry(index)? {
                ConstantPoolEntry::Integer(_) | ConstantPoolEntry::Float(_) => {
                    class.set_static_slot(variable.slot, class.constant_int(index)?)?
                }
                ConstantPoolEntry::Long(_) | ConstantPoolEntry::Double(_) => {
                    class.set_static_wide(variable.slot, class.constant_wide(index)?)?
                }
                ConstantPoolEntry::String { .. } => {
                    let string = self.resolve_string(class.id, index)?;
                    class.set_static_slot(variable.slot, string.to_slot())?;
                }
                _ => {
                    return Err(RuntimeError::malformed(format!(
                        "{}.{}: bad ConstantValue {index}",
                        class.name, variable.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// String constant `index` of class `id`, materialized on first use.
    pub fn resolve_string(&mut self, id: ClassId, index: u16) -> Result<Reference> {
        let class = self.classes.class(id);
        let (text, cache) = class.string_entry(index)?;
        if let Some(string) = cache.get() {
            return Ok(*string);
        }
        let string = self.heap.new_string(&mut self.classes, text)?;
        let _ = cache.set(string);
        Ok(string)
    }

    /// Enter `target`: push its frame, or run it to completion through the
    /// native bridge. Parameters must already be on the operand stack.
    pub(crate) fn invoke(&mut self, target: MethodRef) -> Result<()> {
        let class = self.classes.class(target.class);
        let method = class.method(target.index);
        if method.is_native() {
            let params = self.stack.top_slots(method.parameter_slots)?;
            let mut env = NativeEnv {
                classes: &mut self.classes,
                heap: &mut self.heap,
                stack: &mut self.stack,
                output: &mut *self.output,
            };
            let results = self.natives.invoke(&mut env, &class, method, &params)?;
            return self.stack.compact(method.parameter_slots, results);
        }
        if method.code.is_none() {
            return Err(RuntimeError::resolution(format!(
                "abstract method {}.{}{}",
                class.name, method.name, method.descriptor
            )));
        }
        self.stack.push_frame(target.class, target.index, method)
    }

    /// Run the interpreter until the frame depth falls back to `base`.
    pub(crate) fn execute(&mut self, base: usize) -> Result<()> {
        while self.stack.depth() > base {
            if let Err(err) = self.step() {
                match err.pending {
                    Some((exception, trace)) => self.unwind(exception, trace, base)?,
                    None => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Find a handler for `exception` in the frames above `base`, popping
    /// the frames that have none. The newest frame is matched at its current
    /// pc, callers at their pending invoke instruction.
    fn unwind(&mut self, exception: Reference, trace: StackTrace, base: usize) -> Result<()> {
        let mut at_throw = true;
        while self.stack.depth() > base {
            let frame = *self.stack.current()?;
            let pc = if at_throw {
                frame.pc
            } else {
                frame.pc.saturating_sub(1)
            };
            at_throw = false;
            let class = self.classes.class(frame.class);
            let method = class.method(frame.method);
            let handlers = method
                .code
                .as_ref()
                .map(|code| code.exception_table.as_slice())
                .unwrap_or_default();
            for handler in handlers {
                if pc < handler.start_pc as usize || pc >= handler.end_pc as usize {
                    continue;
                }
                let caught = handler.catch_type == 0 || {
                    let catch_class = self.classes.resolve_class(frame.class, handler.catch_type)?;
                    self.heap.is_instance_of(exception, catch_class)?
                };
                if caught {
                    debug!(
                        "exception caught in {}.{}{} at {}",
                        class.name, method.name, method.descriptor, handler.handler_pc
                    );
                    self.stack.clear_operands();
                    self.stack.push_reference(exception);
                    self.stack.current_mut()?.pc = handler.handler_pc as usize;
                    return Ok(());
                }
            }
            self.stack.pop_frame()?;
        }
        Err(RuntimeError::thrown(exception, trace))
    }

    /// Give the exception a chance to print itself through its own
    /// `printStackTrace()`, then turn it into the final error.
    fn report_uncaught(&mut self, err: RuntimeError) -> RuntimeError {
        self.stack.unwind_to(0, 0);
        let Some(exception) = err.exception() else {
            return err;
        };
        let printer = self
            .heap
            .class_of(exception)
            .ok()
            .and_then(|class| self.classes.resolve_method(class, "printStackTrace", "()V"))
            .filter(|method| self.classes.get(method.class).method(method.index).code.is_some());
        if let Some(method) = printer {
            self.stack.push_reference(exception);
            if let Err(print_err) = self.invoke(method).and_then(|()| self.execute(0)) {
                warn!("printStackTrace failed: {print_err}");
                self.stack.unwind_to(0, 0);
            }
        }
        err
    }

    fn report_statistics(&mut self) -> Result<()> {
        let mut report = String::new();
        if let Some(profiler) = &self.profiler {
            report.push_str(&profiler.report());
        }
        if self.settings.memory_stats {
            let heap = self.heap.stats();
            report.push_str(&format!(
                "heap: {} objects, {} slot bytes, table capacity {}\n\
                 classes loaded: {}\n\
                 stack: {} of {} bytes used at most\n",
                heap.objects,
                heap.slots * 4,
                heap.capacity,
                self.classes.len(),
                self.stack.high_water(),
                self.stack.max_size(),
            ));
        }
        if !report.is_empty() {
            self.output
                .write_all(report.as_bytes())
                .map_err(|err| RuntimeError::unsupported(format!("cannot write output: {err}")))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.output
            .flush()
            .map_err(|err| RuntimeError::unsupported(format!("cannot flush output: {err}")))
    }
}
