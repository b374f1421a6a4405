//! In-memory class model.
//!
//! A `RuntimeClass` is built once from a decoded class file and never
//! restructured afterwards. The only mutable state is the lazy resolution
//! caches inside the constant pool, the static slots and the initialized
//! flag.
use std::cell::{Cell, OnceCell, Ref, RefCell};

use crate::jvm::{AttributeInfo, CPInfo, ExceptionTableEntry, JVMClassFile};
use crate::program::{field_slot_count, ArrayKind, MethodDescriptor};
use crate::runtime::{Result, RuntimeError};
use crate::value::{join_wide, split_wide, Reference, Slot};

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;

/// Handle of a loaded class inside the method area.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

impl ClassId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A resolved method: the class that declares it and its index in that
/// class's method table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MethodRef {
    pub class: ClassId,
    pub index: usize,
}

/// A resolved field: the declaring class, the index in its static or
/// instance variable table and which of the two tables it lives in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub class: ClassId,
    pub index: usize,
    pub is_static: bool,
}

/// Runtime constant pool entry. Symbolic references carry a cache that is
/// filled on first resolution and never cleared.
#[derive(Debug)]
pub enum ConstantPoolEntry {
    Unusable,
    Utf8(String),
    Integer(i32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class {
        name_index: u16,
        resolved: OnceCell<ClassId>,
    },
    String {
        string_index: u16,
        resolved: OnceCell<Reference>,
    },
    Fieldref {
        class_index: u16,
        name_and_type_index: u16,
        resolved: OnceCell<FieldRef>,
    },
    Methodref {
        class_index: u16,
        name_and_type_index: u16,
        resolved: OnceCell<MethodRef>,
    },
    InterfaceMethodref {
        class_index: u16,
        name_and_type_index: u16,
        resolved: OnceCell<MethodRef>,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    Unsupported(u8),
}

impl From<&CPInfo> for ConstantPoolEntry {
    fn from(info: &CPInfo) -> Self {
        match info {
            CPInfo::Unusable => ConstantPoolEntry::Unusable,
            CPInfo::ConstantUtf8 { bytes } => ConstantPoolEntry::Utf8(bytes.clone()),
            CPInfo::ConstantInteger { bytes } => ConstantPoolEntry::Integer(*bytes as i32),
            CPInfo::ConstantFloat { bytes } => ConstantPoolEntry::Float(*bytes),
            CPInfo::ConstantLong {
                high_bytes,
                low_bytes,
            } => ConstantPoolEntry::Long(join_wide(*high_bytes, *low_bytes)),
            CPInfo::ConstantDouble {
                high_bytes,
                low_bytes,
            } => ConstantPoolEntry::Double(join_wide(*high_bytes, *low_bytes)),
            CPInfo::ConstantClass { name_index } => ConstantPoolEntry::Class {
                name_index: *name_index,
                resolved: OnceCell::new(),
            },
            CPInfo::ConstantString { string_index } => ConstantPoolEntry::String {
                string_index: *string_index,
                resolved: OnceCell::new(),
            },
            CPInfo::ConstantFieldRef {
                class_index,
                name_and_type_index,
            } => ConstantPoolEntry::Fieldref {
                class_index: *class_index,
                name_and_type_index: *name_and_type_index,
                resolved: OnceCell::new(),
            },
            CPInfo::ConstantMethodRef {
                class_index,
                name_and_type_index,
            } => ConstantPoolEntry::Methodref {
                class_index: *class_index,
                name_and_type_index: *name_and_type_index,
                resolved: OnceCell::new(),
            },
            CPInfo::ConstantInterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => ConstantPoolEntry::InterfaceMethodref {
                class_index: *class_index,
                name_and_type_index: *name_and_type_index,
                resolved: OnceCell::new(),
            },
            CPInfo::ConstantNameAndType {
                name_index,
                descriptor_index,
            } => ConstantPoolEntry::NameAndType {
                name_index: *name_index,
                descriptor_index: *descriptor_index,
            },
            CPInfo::Unsupported { tag } => ConstantPoolEntry::Unsupported(*tag),
        }
    }
}

/// Bytecode body of a method.
#[derive(Debug, Clone)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytes: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
}

/// Java class method representation for the interpreter.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    /// Parameter slots including the receiver of instance methods.
    pub parameter_slots: usize,
    pub return_slots: usize,
    pub code: Option<Code>,
}

impl Method {
    pub const fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub const fn is_native(&self) -> bool {
        self.access_flags & ACC_NATIVE != 0
    }

    pub const fn is_abstract(&self) -> bool {
        self.access_flags & ACC_ABSTRACT != 0
    }
}

/// A static or instance field with its assigned slot.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    pub slot: usize,
    /// Pool index of the `ConstantValue` attribute, if any.
    pub constant_value: Option<u16>,
}

impl Variable {
    pub fn size(&self) -> usize {
        field_slot_count(&self.descriptor)
    }

    pub const fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }
}

#[derive(Debug)]
pub struct RuntimeClass {
    pub id: ClassId,
    pub name: String,
    pub access_flags: u16,
    pub super_class: Option<ClassId>,
    pub source_file: Option<String>,
    /// Pool indices of the directly implemented interfaces.
    pub interfaces: Vec<u16>,
    pub array_kind: Option<ArrayKind>,
    constant_pool: Vec<ConstantPoolEntry>,
    methods: Vec<Method>,
    static_variables: Vec<Variable>,
    instance_variables: Vec<Variable>,
    instance_slot_count: usize,
    static_slots: RefCell<Vec<Slot>>,
    initialized: Cell<bool>,
}

impl RuntimeClass {
    /// Build the runtime model of a parsed class file.
    pub fn link(
        id: ClassId,
        file: &JVMClassFile,
        super_class: Option<ClassId>,
    ) -> Result<Self> {
        let mut methods = Vec::with_capacity(file.methods().len());
        for info in file.methods() {
            let name = file.utf8(info.name_index())?.to_string();
            let descriptor = file.utf8(info.descriptor_index())?.to_string();
            let parsed = MethodDescriptor::parse(&descriptor)?;
            let receiver = usize::from(info.access_flags() & ACC_STATIC == 0);
            let code = match info.attributes().get("Code") {
                Some(AttributeInfo::CodeAttribute {
                    max_stack,
                    max_locals,
                    code,
                    exception_table,
                }) => Some(Code {
                    max_stack: *max_stack,
                    max_locals: *max_locals,
                    bytes: code.clone(),
                    exception_table: exception_table.clone(),
                }),
                _ => None,
            };
            methods.push(Method {
                name,
                descriptor,
                access_flags: info.access_flags(),
                parameter_slots: parsed.arg_slots() + receiver,
                return_slots: parsed.return_slots(),
                code,
            });
        }

        let mut static_variables = Vec::new();
        let mut instance_variables = Vec::new();
        let mut static_slot_count = 0;
        let mut instance_slot_count = 0;
        for info in file.fields() {
            let descriptor = file.utf8(info.descriptor_index())?.to_string();
            let size = field_slot_count(&descriptor);
            let constant_value = match info.attributes().get("ConstantValue") {
                Some(AttributeInfo::ConstantValueAttribute {
                    constant_value_index,
                }) => Some(*constant_value_index),
                _ => None,
            };
            let is_static = info.access_flags() & ACC_STATIC != 0;
            let counter = if is_static {
                &mut static_slot_count
            } else {
                &mut instance_slot_count
            };
            let variable = Variable {
                name: file.utf8(info.name_index())?.to_string(),
                descriptor,
                access_flags: info.access_flags(),
                slot: *counter,
                constant_value,
            };
            *counter += size;
            if is_static {
                static_variables.push(variable);
            } else {
                instance_variables.push(variable);
            }
        }

        Ok(Self {
            id,
            name: file.name()?.to_string(),
            access_flags: file.access_flags,
            super_class,
            source_file: file.source_file().map(str::to_string),
            interfaces: file.interfaces().to_vec(),
            array_kind: None,
            constant_pool: file.constant_pool().iter().map(Into::into).collect(),
            methods,
            static_variables,
            instance_variables,
            instance_slot_count,
            static_slots: RefCell::new(vec![0; static_slot_count]),
            initialized: Cell::new(false),
        })
    }

    /// Synthesize an array class. Arrays have no members of their own and
    /// extend `java/lang/Object`.
    pub fn array(id: ClassId, name: &str, object: ClassId, kind: ArrayKind) -> Self {
        Self {
            id,
            name: name.to_string(),
            access_flags: ACC_PUBLIC | ACC_FINAL,
            super_class: Some(object),
            source_file: None,
            interfaces: Vec::new(),
            array_kind: Some(kind),
            constant_pool: vec![ConstantPoolEntry::Unusable],
            methods: Vec::new(),
            static_variables: Vec::new(),
            instance_variables: Vec::new(),
            instance_slot_count: 0,
            static_slots: RefCell::new(Vec::new()),
            initialized: Cell::new(true),
        }
    }

    pub const fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub const fn is_abstract(&self) -> bool {
        self.access_flags & ACC_ABSTRACT != 0
    }

    pub const fn is_array(&self) -> bool {
        self.array_kind.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    pub fn mark_initialized(&self) {
        self.initialized.set(true);
    }

    pub fn entry(&self, index: u16) -> Result<&ConstantPoolEntry> {
        match self.constant_pool.get(index as usize) {
            Some(ConstantPoolEntry::Unusable) | None => Err(RuntimeError::malformed(
                format!("{}: unusable constant pool index {index}", self.name),
            )),
            Some(ConstantPoolEntry::Unsupported(tag)) => {
                Err(RuntimeError::unsupported(format!(
                    "{}: constant pool tag {tag} at index {index}",
                    self.name
                )))
            }
            Some(entry) => Ok(entry),
        }
    }

    fn mismatch(&self, index: u16, expected: &str) -> RuntimeError {
        RuntimeError::malformed(format!(
            "{}: constant pool entry {index} is not a {expected}",
            self.name
        ))
    }

    pub fn utf8(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            ConstantPoolEntry::Utf8(s) => Ok(s),
            _ => Err(self.mismatch(index, "Utf8")),
        }
    }

    /// Name referenced by the Class entry at `index`.
    pub fn class_name_at(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            ConstantPoolEntry::Class { name_index, .. } => self.utf8(*name_index),
            _ => Err(self.mismatch(index, "Class")),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.entry(index)? {
            ConstantPoolEntry::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(self.mismatch(index, "NameAndType")),
        }
    }

    /// Owner class index, member name and descriptor of a field, method or
    /// interface method reference.
    pub fn member_ref(&self, index: u16) -> Result<(u16, &str, &str)> {
        let (class_index, name_and_type_index) = match self.entry(index)? {
            ConstantPoolEntry::Fieldref {
                class_index,
                name_and_type_index,
                ..
            }
            | ConstantPoolEntry::Methodref {
                class_index,
                name_and_type_index,
                ..
            }
            | ConstantPoolEntry::InterfaceMethodref {
                class_index,
                name_and_type_index,
                ..
            } => (*class_index, *name_and_type_index),
            _ => return Err(self.mismatch(index, "member reference")),
        };
        let (name, descriptor) = self.name_and_type(name_and_type_index)?;
        Ok((class_index, name, descriptor))
    }

    pub fn class_cache(&self, index: u16) -> Result<&OnceCell<ClassId>> {
        match self.entry(index)? {
            ConstantPoolEntry::Class { resolved, .. } => Ok(resolved),
            _ => Err(self.mismatch(index, "Class")),
        }
    }

    pub fn method_cache(&self, index: u16) -> Result<&OnceCell<MethodRef>> {
        match self.entry(index)? {
            ConstantPoolEntry::Methodref { resolved, .. } => Ok(resolved),
            _ => Err(self.mismatch(index, "Methodref")),
        }
    }

    pub fn interface_method_cache(&self, index: u16) -> Result<&OnceCell<MethodRef>> {
        match self.entry(index)? {
            ConstantPoolEntry::InterfaceMethodref { resolved, .. } => Ok(resolved),
            _ => Err(self.mismatch(index, "InterfaceMethodref")),
        }
    }

    pub fn field_cache(&self, index: u16) -> Result<&OnceCell<FieldRef>> {
        match self.entry(index)? {
            ConstantPoolEntry::Fieldref { resolved, .. } => Ok(resolved),
            _ => Err(self.mismatch(index, "Fieldref")),
        }
    }

    /// Literal text and cache of the String entry at `index`.
    pub fn string_entry(&self, index: u16) -> Result<(&str, &OnceCell<Reference>)> {
        match self.entry(index)? {
            ConstantPoolEntry::String {
                string_index,
                resolved,
            } => Ok((self.utf8(*string_index)?, resolved)),
            _ => Err(self.mismatch(index, "String")),
        }
    }

    /// Integer or Float entry as a single slot.
    pub fn constant_int(&self, index: u16) -> Result<Slot> {
        match self.entry(index)? {
            ConstantPoolEntry::Integer(value) => Ok(*value as Slot),
            ConstantPoolEntry::Float(bits) => Ok(*bits),
            _ => Err(self.mismatch(index, "Integer or Float")),
        }
    }

    /// Long or Double entry as its 64-bit pattern.
    pub fn constant_wide(&self, index: u16) -> Result<u64> {
        match self.entry(index)? {
            ConstantPoolEntry::Long(value) | ConstantPoolEntry::Double(value) => Ok(*value),
            _ => Err(self.mismatch(index, "Long or Double")),
        }
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn method(&self, index: usize) -> &Method {
        &self.methods[index]
    }

    /// Index of the method declared by this very class.
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods
            .iter()
            .position(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn static_variables(&self) -> &[Variable] {
        &self.static_variables
    }

    pub fn instance_variables(&self) -> &[Variable] {
        &self.instance_variables
    }

    pub fn find_static_variable(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.static_variables
            .iter()
            .position(|v| v.name == name && v.descriptor == descriptor)
    }

    pub fn find_instance_variable(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.instance_variables
            .iter()
            .position(|v| v.name == name && v.descriptor == descriptor)
    }

    /// Variable behind a resolved field.
    pub fn variable(&self, field: &FieldRef) -> &Variable {
        if field.is_static {
            &self.static_variables[field.index]
        } else {
            &self.instance_variables[field.index]
        }
    }

    /// Slots of an instance of this class, ancestors excluded.
    pub const fn instance_slot_count(&self) -> usize {
        self.instance_slot_count
    }

    pub fn static_slots(&self) -> Ref<'_, Vec<Slot>> {
        self.static_slots.borrow()
    }

    pub fn static_slot(&self, slot: usize) -> Result<Slot> {
        self.static_slots.borrow().get(slot).copied().ok_or_else(|| {
            RuntimeError::incompatible(format!("{}: no static slot {slot}", self.name))
        })
    }

    pub fn set_static_slot(&self, slot: usize, value: Slot) -> Result<()> {
        match self.static_slots.borrow_mut().get_mut(slot) {
            Some(target) => {
                *target = value;
                Ok(())
            }
            None => Err(RuntimeError::incompatible(format!(
                "{}: no static slot {slot}",
                self.name
            ))),
        }
    }

    pub fn static_wide(&self, slot: usize) -> Result<u64> {
        Ok(join_wide(self.static_slot(slot)?, self.static_slot(slot + 1)?))
    }

    pub fn set_static_wide(&self, slot: usize, value: u64) -> Result<()> {
        let (high, low) = split_wide(value);
        self.set_static_slot(slot, high)?;
        self.set_static_slot(slot + 1, low)
    }
}
