//! Native method bridge.
//!
//! A native method receives a copy of its parameter slots (receiver first
//! for instance methods), pushes its results on the stack and reports how
//! many slots it pushed. The interpreter then drops the parameters so the
//! results take their place.
use std::collections::HashMap;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::class::{ClassId, Method, RuntimeClass};
use crate::heap::ObjectHeap;
use crate::method_area::ClassRegistry;
use crate::runtime::{Result, RuntimeError, RuntimeErrorKind};
use crate::stack::Stack;
use crate::value::{join_wide, Reference, Slot};

const STACK_TRACE_ELEMENT_CLASS: &str = "java/lang/StackTraceElement";

/// Runtime state a native method may touch.
pub struct NativeEnv<'a> {
    pub classes: &'a mut ClassRegistry,
    pub heap: &'a mut ObjectHeap,
    pub stack: &'a mut Stack,
    pub output: &'a mut dyn Write,
}

/// Dispatches native methods to host implementations.
pub trait NativeBridge {
    /// Run `method` declared by `class`. Returns the number of result slots
    /// pushed onto `env.stack`.
    fn invoke(
        &self,
        env: &mut NativeEnv<'_>,
        class: &RuntimeClass,
        method: &Method,
        params: &[Slot],
    ) -> Result<usize>;
}

pub type NativeFn = fn(&mut NativeEnv<'_>, &[Slot]) -> Result<usize>;

/// Table of natives keyed by (class, name, descriptor).
#[derive(Default)]
pub struct NativeRegistry {
    methods: HashMap<(String, String, String), NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the natives the bundled class library relies on.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("java/lang/System", "currentTimeMillis", "()J", current_time_millis);
        registry.register("java/lang/Object", "hashCode", "()I", object_hash_code);
        registry.register(
            "java/lang/Object",
            "getClassName",
            "()Ljava/lang/String;",
            object_class_name,
        );
        registry.register("java/io/PrintStream", "print", "(Ljava/lang/String;)V", print_string);
        registry.register("java/io/PrintStream", "print", "(I)V", print_int);
        registry.register("java/io/PrintStream", "print", "(J)V", print_long);
        registry.register("java/io/PrintStream", "print", "(F)V", print_float);
        registry.register("java/io/PrintStream", "print", "(D)V", print_double);
        registry.register("java/io/PrintStream", "print", "(C)V", print_char);
        registry.register("java/io/PrintStream", "print", "(Z)V", print_boolean);
        registry.register("java/lang/Throwable", "getStackTraceDepth", "()I", stack_trace_depth);
        registry.register(
            "java/lang/Throwable",
            "getStackTraceElement",
            "(I)Ljava/lang/StackTraceElement;",
            stack_trace_element,
        );
        registry
    }

    pub fn register(&mut self, class: &str, name: &str, descriptor: &str, function: NativeFn) {
        self.methods.insert(
            (class.to_string(), name.to_string(), descriptor.to_string()),
            function,
        );
    }

    pub fn lookup(&self, class: &str, name: &str, descriptor: &str) -> Option<NativeFn> {
        self.methods
            .get(&(class.to_string(), name.to_string(), descriptor.to_string()))
            .copied()
    }
}

impl NativeBridge for NativeRegistry {
    fn invoke(
        &self,
        env: &mut NativeEnv<'_>,
        class: &RuntimeClass,
        method: &Method,
        params: &[Slot],
    ) -> Result<usize> {
        let function = self
            .lookup(&class.name, &method.name, &method.descriptor)
            .ok_or_else(|| {
                RuntimeError::resolution(format!(
                    "no native implementation for {}.{}{}",
                    class.name, method.name, method.descriptor
                ))
            })?;
        debug!("native {}.{}{}", class.name, method.name, method.descriptor);
        function(env, params)
    }
}

fn param(params: &[Slot], index: usize) -> Result<Slot> {
    params
        .get(index)
        .copied()
        .ok_or_else(|| RuntimeError::malformed("missing native parameter"))
}

fn write_output(env: &mut NativeEnv<'_>, text: &str) -> Result<usize> {
    env.output
        .write_all(text.as_bytes())
        .map_err(|err| RuntimeError::unsupported(format!("cannot write output: {err}")))?;
    Ok(0)
}

fn current_time_millis(env: &mut NativeEnv<'_>, _params: &[Slot]) -> Result<usize> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64);
    env.stack.push_long(millis);
    Ok(2)
}

fn object_hash_code(env: &mut NativeEnv<'_>, params: &[Slot]) -> Result<usize> {
    let this = Reference::from_slot(param(params, 0)?);
    env.heap.object(this)?;
    env.stack.push_int(this.0 as i32);
    Ok(1)
}

fn object_class_name(env: &mut NativeEnv<'_>, params: &[Slot]) -> Result<usize> {
    let this = Reference::from_slot(param(params, 0)?);
    let class = env.heap.class_of(this)?;
    let name = env.classes.get(class).name.clone();
    let string = env.heap.new_string(env.classes, &name)?;
    env.stack.push_reference(string);
    Ok(1)
}

fn print_string(env: &mut NativeEnv<'_>, params: &[Slot]) -> Result<usize> {
    let string = Reference::from_slot(param(params, 1)?);
    let text = if string.is_null() {
        "null".to_string()
    } else {
        env.heap.read_string(env.classes, string)?
    };
    write_output(env, &text)
}

fn print_int(env: &mut NativeEnv<'_>, params: &[Slot]) -> Result<usize> {
    let value = param(params, 1)? as i32;
    write_output(env, &value.to_string())
}

fn print_long(env: &mut NativeEnv<'_>, params: &[Slot]) -> Result<usize> {
    let value = join_wide(param(params, 1)?, param(params, 2)?) as i64;
    write_output(env, &value.to_string())
}

fn print_float(env: &mut NativeEnv<'_>, params: &[Slot]) -> Result<usize> {
    let value = f32::from_bits(param(params, 1)?);
    write_output(env, &java_decimal(value as f64, value.to_string()))
}

fn print_double(env: &mut NativeEnv<'_>, params: &[Slot]) -> Result<usize> {
    let value = f64::from_bits(join_wide(param(params, 1)?, param(params, 2)?));
    write_output(env, &java_decimal(value, value.to_string()))
}

fn print_char(env: &mut NativeEnv<'_>, params: &[Slot]) -> Result<usize> {
    let unit = param(params, 1)? as u16;
    let text = String::from_utf16_lossy(&[unit]);
    write_output(env, &text)
}

fn print_boolean(env: &mut NativeEnv<'_>, params: &[Slot]) -> Result<usize> {
    let text = if param(params, 1)? != 0 { "true" } else { "false" };
    write_output(env, text)
}

/// Format a floating point value the way `Float.toString` and
/// `Double.toString` do. `shortest` is the shortest round-trip decimal of
/// the value at its own precision.
fn java_decimal(value: f64, shortest: String) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-3..1e7).contains(&magnitude) {
        // Rust prints 1.5e7, Java prints 1.5E7 and always keeps a fraction.
        let decimal: f64 = shortest.parse().unwrap_or(value);
        let scientific = format!("{decimal:e}");
        let (mantissa, exponent) = scientific
            .split_once('e')
            .unwrap_or((scientific.as_str(), "0"));
        let mantissa = if mantissa.contains('.') {
            mantissa.to_string()
        } else {
            format!("{mantissa}.0")
        };
        return format!("{mantissa}E{exponent}");
    }
    if shortest.contains('.') {
        shortest
    } else {
        format!("{shortest}.0")
    }
}

/// Number of frames that belong to the program rather than to the
/// construction of `exception`. Walking down from the top, the `<init>`
/// frames of the exception's class and its ancestors are skipped.
fn visible_frames(env: &NativeEnv<'_>, exception: Reference) -> Result<usize> {
    let frames = env.stack.frames();
    let mut visible = frames.len();
    while let Some(frame) = visible.checked_sub(1).map(|top| frames[top]) {
        let constructing = env.classes.get(frame.class).method(frame.method).name == "<init>"
            && env.heap.is_instance_of(exception, frame.class)?;
        if !constructing {
            break;
        }
        visible -= 1;
    }
    Ok(visible)
}

fn stack_trace_depth(env: &mut NativeEnv<'_>, params: &[Slot]) -> Result<usize> {
    let this = Reference::from_slot(param(params, 0)?);
    let depth = visible_frames(env, this)?;
    env.stack.push_int(depth as i32);
    Ok(1)
}

fn stack_trace_element(env: &mut NativeEnv<'_>, params: &[Slot]) -> Result<usize> {
    let this = Reference::from_slot(param(params, 0)?);
    let index = param(params, 1)? as i32;
    let depth = visible_frames(env, this)?;
    if index < 0 || index as usize >= depth {
        return Err(RuntimeError::new(
            RuntimeErrorKind::ArrayIndexOutOfBounds,
            format!("stack trace element {index} of {depth}"),
        ));
    }
    // Element 0 is the frame that created the exception.
    let frame = env.stack.frames()[depth - 1 - index as usize];
    let declaring = env.classes.class(frame.class);
    let method_name = declaring.method(frame.method).name.clone();

    let element_class = env.classes.get_class(STACK_TRACE_ELEMENT_CLASS)?;
    let element = env.heap.new_instance(env.classes, element_class)?;
    let class_name = env.heap.new_string(env.classes, &declaring.name)?;
    let method_name = env.heap.new_string(env.classes, &method_name)?;
    let file_name = match &declaring.source_file {
        Some(file) => env.heap.new_string(env.classes, file)?,
        None => Reference::NULL,
    };
    let string = "Ljava/lang/String;";
    for (name, value) in [
        ("declaringClass", class_name),
        ("methodName", method_name),
        ("fileName", file_name),
    ] {
        set_field(env, element_class, element, name, string, value.to_slot())?;
    }
    // Line numbers are not tracked.
    set_field(env, element_class, element, "lineNumber", "I", -1i32 as Slot)?;
    env.stack.push_reference(element);
    Ok(1)
}

fn set_field(
    env: &mut NativeEnv<'_>,
    class: ClassId,
    instance: Reference,
    name: &str,
    descriptor: &str,
    value: Slot,
) -> Result<()> {
    let field = env.classes.resolve_field(class, name, descriptor).ok_or_else(|| {
        RuntimeError::resolution(format!(
            "{STACK_TRACE_ELEMENT_CLASS} has no field {name}:{descriptor}"
        ))
    })?;
    let slot = env.classes.get(field.class).variable(&field).slot;
    env.heap.set_slot(instance, field.class, slot, value)
}
