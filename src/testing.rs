//! Test fixtures: an in-memory class file assembler and class source.
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use crate::class::{ACC_ABSTRACT, ACC_INTERFACE, ACC_NATIVE, ACC_PUBLIC, ACC_STATIC, ACC_SUPER};
use crate::method_area::{ClassSource, OBJECT_CLASS, STRING_CLASS};
use crate::runtime::{Result, Runtime, RuntimeError, RuntimeSettings};

/// Exception handler for `ClassBuilder::method_with_handlers`:
/// `(start_pc, end_pc, handler_pc, catch class or None for any)`.
pub(crate) type Handler<'a> = (u16, u16, u16, Option<&'a str>);

/// Assembles a class file one constant at a time.
pub(crate) struct ClassBuilder {
    name: String,
    access_flags: u16,
    pool: Vec<u8>,
    pool_count: u16,
    utf8s: HashMap<String, u16>,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<Vec<u8>>,
    methods: Vec<Vec<u8>>,
    attributes: Vec<Vec<u8>>,
}

impl ClassBuilder {
    /// Public class extending `java/lang/Object`.
    pub fn new(name: &str) -> Self {
        let mut builder = Self::root(name);
        builder.super_class = builder.class_ref(OBJECT_CLASS);
        builder
    }

    /// Class without a superclass.
    pub fn root(name: &str) -> Self {
        let mut builder = Self {
            name: name.to_string(),
            access_flags: ACC_PUBLIC | ACC_SUPER,
            pool: Vec::new(),
            pool_count: 1,
            utf8s: HashMap::new(),
            this_class: 0,
            super_class: 0,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        };
        builder.this_class = builder.class_ref(name);
        builder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extends(&mut self, parent: &str) -> &mut Self {
        self.super_class = self.class_ref(parent);
        self
    }

    pub fn interface(&mut self) -> &mut Self {
        self.access_flags = ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT;
        self
    }

    pub fn implements(&mut self, interface: &str) -> &mut Self {
        let index = self.class_ref(interface);
        self.interfaces.push(index);
        self
    }

    pub fn source_file(&mut self, file: &str) -> &mut Self {
        let name = self.utf8("SourceFile");
        let value = self.utf8(file);
        let mut attribute = u2(name);
        attribute.extend(2u32.to_be_bytes());
        attribute.extend(u2(value));
        self.attributes.push(attribute);
        self
    }

    fn constant(&mut self, bytes: &[u8], entries: u16) -> u16 {
        let index = self.pool_count;
        self.pool.extend_from_slice(bytes);
        self.pool_count += entries;
        index
    }

    pub fn utf8(&mut self, text: &str) -> u16 {
        if let Some(&index) = self.utf8s.get(text) {
            return index;
        }
        let mut bytes = vec![1];
        bytes.extend(u2(text.len() as u16));
        bytes.extend(text.as_bytes());
        let index = self.constant(&bytes, 1);
        self.utf8s.insert(text.to_string(), index);
        index
    }

    pub fn class_ref(&mut self, name: &str) -> u16 {
        let name = self.utf8(name);
        let mut bytes = vec![7];
        bytes.extend(u2(name));
        self.constant(&bytes, 1)
    }

    pub fn string(&mut self, text: &str) -> u16 {
        let text = self.utf8(text);
        let mut bytes = vec![8];
        bytes.extend(u2(text));
        self.constant(&bytes, 1)
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        let mut bytes = vec![3];
        bytes.extend(value.to_be_bytes());
        self.constant(&bytes, 1)
    }

    pub fn float(&mut self, value: f32) -> u16 {
        let mut bytes = vec![4];
        bytes.extend(value.to_bits().to_be_bytes());
        self.constant(&bytes, 1)
    }

    pub fn long(&mut self, value: i64) -> u16 {
        let mut bytes = vec![5];
        bytes.extend(value.to_be_bytes());
        self.constant(&bytes, 2)
    }

    pub fn double(&mut self, value: f64) -> u16 {
        let mut bytes = vec![6];
        bytes.extend(value.to_bits().to_be_bytes());
        self.constant(&bytes, 2)
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        let mut bytes = vec![12];
        bytes.extend(u2(name));
        bytes.extend(u2(descriptor));
        self.constant(&bytes, 1)
    }

    fn member_ref(&mut self, tag: u8, class: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.class_ref(class);
        let name_and_type = self.name_and_type(name, descriptor);
        let mut bytes = vec![tag];
        bytes.extend(u2(class));
        bytes.extend(u2(name_and_type));
        self.constant(&bytes, 1)
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.member_ref(9, class, name, descriptor)
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.member_ref(10, class, name, descriptor)
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.member_ref(11, class, name, descriptor)
    }

    fn member(&mut self, flags: u16, name: &str, descriptor: &str, attributes: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = u2(flags);
        bytes.extend(u2(self.utf8(name)));
        bytes.extend(u2(self.utf8(descriptor)));
        bytes.extend(u2(attributes.len() as u16));
        for attribute in attributes {
            bytes.extend(attribute);
        }
        bytes
    }

    pub fn field(&mut self, flags: u16, name: &str, descriptor: &str) -> &mut Self {
        let field = self.member(flags, name, descriptor, &[]);
        self.fields.push(field);
        self
    }

    /// Field with a `ConstantValue` attribute pointing at pool entry `value`.
    pub fn constant_field(&mut self, flags: u16, name: &str, descriptor: &str, value: u16) -> &mut Self {
        let mut attribute = u2(self.utf8("ConstantValue"));
        attribute.extend(2u32.to_be_bytes());
        attribute.extend(u2(value));
        let field = self.member(flags, name, descriptor, &[attribute]);
        self.fields.push(field);
        self
    }

    pub fn method(
        &mut self,
        flags: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) -> &mut Self {
        self.method_with_handlers(flags, name, descriptor, max_stack, max_locals, code, &[])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn method_with_handlers(
        &mut self,
        flags: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        handlers: &[Handler<'_>],
    ) -> &mut Self {
        let mut body = u2(max_stack);
        body.extend(u2(max_locals));
        body.extend((code.len() as u32).to_be_bytes());
        body.extend(&code);
        body.extend(u2(handlers.len() as u16));
        for &(start, end, handler, catch) in handlers {
            let catch_type = catch.map_or(0, |class| self.class_ref(class));
            for value in [start, end, handler, catch_type] {
                body.extend(u2(value));
            }
        }
        body.extend(u2(0));
        let mut attribute = u2(self.utf8("Code"));
        attribute.extend((body.len() as u32).to_be_bytes());
        attribute.extend(body);
        let method = self.member(flags, name, descriptor, &[attribute]);
        self.methods.push(method);
        self
    }

    pub fn native_method(&mut self, flags: u16, name: &str, descriptor: &str) -> &mut Self {
        let method = self.member(flags | ACC_NATIVE, name, descriptor, &[]);
        self.methods.push(method);
        self
    }

    pub fn abstract_method(&mut self, name: &str, descriptor: &str) -> &mut Self {
        let method = self.member(ACC_PUBLIC | ACC_ABSTRACT, name, descriptor, &[]);
        self.methods.push(method);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut bytes = vec![0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 50];
        bytes.extend(u2(self.pool_count));
        bytes.extend(&self.pool);
        bytes.extend(u2(self.access_flags));
        bytes.extend(u2(self.this_class));
        bytes.extend(u2(self.super_class));
        bytes.extend(u2(self.interfaces.len() as u16));
        for &interface in &self.interfaces {
            bytes.extend(u2(interface));
        }
        for members in [&self.fields, &self.methods, &self.attributes] {
            bytes.extend(u2(members.len() as u16));
            for member in members {
                bytes.extend(member);
            }
        }
        bytes
    }
}

fn u2(value: u16) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Bytecode assembly shorthands.
pub(crate) mod op {
    /// `opcode` followed by a two byte operand.
    pub fn u2(opcode: u8, operand: u16) -> Vec<u8> {
        let [high, low] = operand.to_be_bytes();
        vec![opcode, high, low]
    }

    /// `opcode` followed by a signed 16 bit branch offset.
    pub fn branch(opcode: u8, offset: i16) -> Vec<u8> {
        u2(opcode, offset as u16)
    }
}

/// Class source backed by a map of assembled class files.
#[derive(Default)]
pub(crate) struct MemoryClassSource {
    classes: HashMap<String, Vec<u8>>,
}

impl MemoryClassSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source preloaded with the minimal class library the runtime and its
    /// natives expect.
    pub fn with_bootstrap() -> Self {
        let mut source = Self::new();
        let return_only = vec![0xb1];

        let mut object = ClassBuilder::root(OBJECT_CLASS);
        object.method(ACC_PUBLIC, "<init>", "()V", 0, 1, return_only);
        object.native_method(ACC_PUBLIC, "hashCode", "()I");
        object.native_method(ACC_PUBLIC, "getClassName", "()Ljava/lang/String;");
        source.add(&object);

        let mut string = ClassBuilder::new(STRING_CLASS);
        string.field(0, "value", "[C");
        source.add(&string);

        let mut print_stream = ClassBuilder::new("java/io/PrintStream");
        let object_init = print_stream.method_ref(OBJECT_CLASS, "<init>", "()V");
        let mut init = vec![0x2a];
        init.extend(op::u2(0xb7, object_init));
        init.push(0xb1);
        print_stream.method(ACC_PUBLIC, "<init>", "()V", 1, 1, init);
        for descriptor in ["(Ljava/lang/String;)V", "(I)V", "(J)V", "(F)V", "(D)V", "(C)V", "(Z)V"] {
            print_stream.native_method(ACC_PUBLIC, "print", descriptor);
        }
        let print_char = print_stream.method_ref("java/io/PrintStream", "print", "(C)V");
        let print_string =
            print_stream.method_ref("java/io/PrintStream", "print", "(Ljava/lang/String;)V");
        // println(String): print(s); print('\n')
        let mut println = vec![0x2a, 0x2b];
        println.extend(op::u2(0xb6, print_string));
        println.extend([0x2a, 0x10, b'\n']);
        println.extend(op::u2(0xb6, print_char));
        println.push(0xb1);
        print_stream.method(ACC_PUBLIC, "println", "(Ljava/lang/String;)V", 2, 2, println);
        source.add(&print_stream);

        let mut system = ClassBuilder::new("java/lang/System");
        system.field(ACC_PUBLIC | ACC_STATIC, "out", "Ljava/io/PrintStream;");
        system.native_method(ACC_PUBLIC | ACC_STATIC, "currentTimeMillis", "()J");
        let stream = system.class_ref("java/io/PrintStream");
        let stream_init = system.method_ref("java/io/PrintStream", "<init>", "()V");
        let out = system.field_ref("java/lang/System", "out", "Ljava/io/PrintStream;");
        let mut clinit = op::u2(0xbb, stream);
        clinit.push(0x59);
        clinit.extend(op::u2(0xb7, stream_init));
        clinit.extend(op::u2(0xb3, out));
        clinit.push(0xb1);
        system.method(ACC_STATIC, "<clinit>", "()V", 2, 0, clinit);
        source.add(&system);

        let mut element = ClassBuilder::new("java/lang/StackTraceElement");
        element.field(0, "declaringClass", "Ljava/lang/String;");
        element.field(0, "methodName", "Ljava/lang/String;");
        element.field(0, "fileName", "Ljava/lang/String;");
        element.field(0, "lineNumber", "I");
        source.add(&element);

        let mut throwable = ClassBuilder::new("java/lang/Throwable");
        throwable.field(0, "detailMessage", "Ljava/lang/String;");
        throwable.field(0, "depth", "I");
        let object_init = throwable.method_ref(OBJECT_CLASS, "<init>", "()V");
        let message = throwable.field_ref("java/lang/Throwable", "detailMessage", "Ljava/lang/String;");
        let depth = throwable.field_ref("java/lang/Throwable", "depth", "I");
        let trace_depth = throwable.method_ref("java/lang/Throwable", "getStackTraceDepth", "()I");
        // super(); this.depth = getStackTraceDepth();
        let mut record = vec![0x2a];
        record.extend(op::u2(0xb7, object_init));
        record.extend([0x2a, 0x2a]);
        record.extend(op::u2(0xb6, trace_depth));
        record.extend(op::u2(0xb5, depth));
        let mut init = record.clone();
        init.push(0xb1);
        throwable.method(ACC_PUBLIC, "<init>", "()V", 2, 1, init);
        let mut init = record;
        init.extend([0x2a, 0x2b]);
        init.extend(op::u2(0xb5, message));
        init.push(0xb1);
        throwable.method(ACC_PUBLIC, "<init>", "(Ljava/lang/String;)V", 2, 2, init);
        throwable.native_method(ACC_PUBLIC, "getStackTraceDepth", "()I");
        throwable.native_method(
            ACC_PUBLIC,
            "getStackTraceElement",
            "(I)Ljava/lang/StackTraceElement;",
        );
        source.add(&throwable);

        for (name, parent) in [
            ("java/lang/Exception", "java/lang/Throwable"),
            ("java/lang/RuntimeException", "java/lang/Exception"),
        ] {
            let mut class = ClassBuilder::new(name);
            class.extends(parent);
            let parent_init = class.method_ref(parent, "<init>", "()V");
            let mut init = vec![0x2a];
            init.extend(op::u2(0xb7, parent_init));
            init.push(0xb1);
            class.method(ACC_PUBLIC, "<init>", "()V", 1, 1, init);
            source.add(&class);
        }
        source
    }

    pub fn add(&mut self, builder: &ClassBuilder) -> &mut Self {
        self.insert(builder.name(), builder.build())
    }

    pub fn insert(&mut self, name: &str, bytes: Vec<u8>) -> &mut Self {
        self.classes.insert(name.to_string(), bytes);
        self
    }
}

impl ClassSource for MemoryClassSource {
    fn load(&self, name: &str) -> Result<Vec<u8>> {
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::resolution(format!("class {name} not found")))
    }
}

/// Output sink that stays readable after the runtime took ownership.
#[derive(Clone, Default)]
pub(crate) struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl SharedOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) fn runtime_with(source: MemoryClassSource, settings: RuntimeSettings) -> (Runtime, SharedOutput) {
    let output = SharedOutput::default();
    let runtime = Runtime::new(Box::new(source), settings).with_output(Box::new(output.clone()));
    (runtime, output)
}
