//! Lightweight implementation of a parser and decoder for JVM bytecode
//! class files.
//!
//! The parser only decodes what the runtime consumes: the constant pool,
//! fields with their `ConstantValue`, methods with their `Code` and the
//! class level `SourceFile`. Every other attribute is skipped by length.
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};

use crate::runtime::{Result, RuntimeError};

const MAGIC: u32 = 0xCAFE_BABE;

/// Constant pool tags as they appear in the class file.
const CONSTANT_UTF8: u8 = 1;
const CONSTANT_INTEGER: u8 = 3;
const CONSTANT_FLOAT: u8 = 4;
const CONSTANT_LONG: u8 = 5;
const CONSTANT_DOUBLE: u8 = 6;
const CONSTANT_CLASS: u8 = 7;
const CONSTANT_STRING: u8 = 8;
const CONSTANT_FIELDREF: u8 = 9;
const CONSTANT_METHODREF: u8 = 10;
const CONSTANT_INTERFACE_METHODREF: u8 = 11;
const CONSTANT_NAME_AND_TYPE: u8 = 12;
const CONSTANT_METHOD_HANDLE: u8 = 15;
const CONSTANT_METHOD_TYPE: u8 = 16;
const CONSTANT_DYNAMIC: u8 = 17;
const CONSTANT_INVOKE_DYNAMIC: u8 = 18;
const CONSTANT_MODULE: u8 = 19;
const CONSTANT_PACKAGE: u8 = 20;

/// Raw constant pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CPInfo {
    /// Index 0 and the shadow slot following a long or double.
    Unusable,
    ConstantUtf8 {
        bytes: String,
    },
    ConstantInteger {
        bytes: u32,
    },
    ConstantFloat {
        bytes: u32,
    },
    ConstantLong {
        high_bytes: u32,
        low_bytes: u32,
    },
    ConstantDouble {
        high_bytes: u32,
        low_bytes: u32,
    },
    ConstantClass {
        name_index: u16,
    },
    ConstantString {
        string_index: u16,
    },
    ConstantFieldRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantInterfaceMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantNameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    /// Method handles, dynamic constants, modules and packages. Their
    /// payload is skipped, the runtime refuses to use them.
    Unsupported {
        tag: u8,
    },
}

/// One row of a `Code` attribute's exception table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

/// Attributes the runtime understands.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeInfo {
    CodeAttribute {
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        exception_table: Vec<ExceptionTableEntry>,
    },
    ConstantValueAttribute {
        constant_value_index: u16,
    },
    SourceFileAttribute {
        sourcefile_index: u16,
    },
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
    attributes: HashMap<String, AttributeInfo>,
}

impl FieldInfo {
    pub const fn access_flags(&self) -> u16 {
        self.access_flags
    }

    pub const fn name_index(&self) -> u16 {
        self.name_index
    }

    pub const fn descriptor_index(&self) -> u16 {
        self.descriptor_index
    }

    pub fn attributes(&self) -> &HashMap<String, AttributeInfo> {
        &self.attributes
    }
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
    attributes: HashMap<String, AttributeInfo>,
}

impl MethodInfo {
    pub const fn access_flags(&self) -> u16 {
        self.access_flags
    }

    pub const fn name_index(&self) -> u16 {
        self.name_index
    }

    pub const fn descriptor_index(&self) -> u16 {
        self.descriptor_index
    }

    pub fn attributes(&self) -> &HashMap<String, AttributeInfo> {
        &self.attributes
    }
}

/// Decoded class file.
#[derive(Debug, Clone)]
pub struct JVMClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    constant_pool: Vec<CPInfo>,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<FieldInfo>,
    methods: Vec<MethodInfo>,
    attributes: HashMap<String, AttributeInfo>,
}

impl JVMClassFile {
    /// Constant pool, index 0 is `CPInfo::Unusable` so pool indices from
    /// the bytecode can be used directly.
    pub fn constant_pool(&self) -> &[CPInfo] {
        &self.constant_pool
    }

    pub fn interfaces(&self) -> &[u16] {
        &self.interfaces
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }

    pub fn attributes(&self) -> &HashMap<String, AttributeInfo> {
        &self.attributes
    }

    /// Returns the Utf8 constant at `index`.
    pub fn utf8(&self, index: u16) -> Result<&str> {
        match self.constant_pool.get(index as usize) {
            Some(CPInfo::ConstantUtf8 { bytes }) => Ok(bytes),
            _ => Err(RuntimeError::malformed(format!(
                "constant pool entry {index} is not a Utf8"
            ))),
        }
    }

    /// Returns the name behind the Class constant at `index`.
    pub fn class_name(&self, index: u16) -> Result<&str> {
        match self.constant_pool.get(index as usize) {
            Some(CPInfo::ConstantClass { name_index }) => self.utf8(*name_index),
            _ => Err(RuntimeError::malformed(format!(
                "constant pool entry {index} is not a Class"
            ))),
        }
    }

    /// Name of the class this file defines.
    pub fn name(&self) -> Result<&str> {
        self.class_name(self.this_class)
    }

    /// Name of the super class, `None` only for `java/lang/Object`.
    pub fn super_name(&self) -> Result<Option<&str>> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.class_name(self.super_class).map(Some)
    }

    pub fn source_file(&self) -> Option<&str> {
        match self.attributes.get("SourceFile") {
            Some(AttributeInfo::SourceFileAttribute { sourcefile_index }) => {
                self.utf8(*sourcefile_index).ok()
            }
            _ => None,
        }
    }
}

/// Sequential big-endian reader over the class file bytes.
struct ClassReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> ClassReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    fn u1(&mut self) -> Result<u8> {
        self.cursor.read_u8().map_err(truncated)
    }

    fn u2(&mut self) -> Result<u16> {
        self.cursor.read_u16::<BigEndian>().map_err(truncated)
    }

    fn u4(&mut self) -> Result<u32> {
        self.cursor.read_u32::<BigEndian>().map_err(truncated)
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        // Lengths come from the file; check them before allocating.
        if len > self.remaining() {
            return Err(RuntimeError::malformed(format!(
                "truncated class file: {len} bytes wanted, {} left",
                self.remaining()
            )));
        }
        let mut buf = vec![0u8; len];
        self.cursor.read_exact(&mut buf).map_err(truncated)?;
        Ok(buf)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        let end = self.cursor.position() + len as u64;
        if end > self.cursor.get_ref().len() as u64 {
            return Err(RuntimeError::malformed("truncated class file"));
        }
        self.cursor.set_position(end);
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.cursor.position() as usize
    }
}

fn truncated(err: std::io::Error) -> RuntimeError {
    RuntimeError::malformed(format!("truncated class file: {err}"))
}

/// `JVMParser` decodes class file bytes into a `JVMClassFile`.
pub struct JVMParser;

impl JVMParser {
    pub fn parse(class_file_bytes: &[u8]) -> Result<JVMClassFile> {
        let mut reader = ClassReader::new(class_file_bytes);
        let magic = reader.u4()?;
        if magic != MAGIC {
            return Err(RuntimeError::malformed(format!(
                "bad magic number {magic:#010x}"
            )));
        }
        let minor_version = reader.u2()?;
        let major_version = reader.u2()?;
        let constant_pool = Self::parse_constant_pool(&mut reader)?;
        let access_flags = reader.u2()?;
        let this_class = reader.u2()?;
        let super_class = reader.u2()?;

        let interfaces_count = reader.u2()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(reader.u2()?);
        }

        let fields_count = reader.u2()?;
        let mut fields = Vec::with_capacity(fields_count as usize);
        for _ in 0..fields_count {
            let access_flags = reader.u2()?;
            let name_index = reader.u2()?;
            let descriptor_index = reader.u2()?;
            let attributes =
                Self::parse_attributes(&mut reader, &constant_pool)?;
            fields.push(FieldInfo {
                access_flags,
                name_index,
                descriptor_index,
                attributes,
            });
        }

        let methods_count = reader.u2()?;
        let mut methods = Vec::with_capacity(methods_count as usize);
        for _ in 0..methods_count {
            let access_flags = reader.u2()?;
            let name_index = reader.u2()?;
            let descriptor_index = reader.u2()?;
            let attributes =
                Self::parse_attributes(&mut reader, &constant_pool)?;
            methods.push(MethodInfo {
                access_flags,
                name_index,
                descriptor_index,
                attributes,
            });
        }

        let attributes = Self::parse_attributes(&mut reader, &constant_pool)?;
        if reader.remaining() != 0 {
            log::warn!(
                "{} trailing bytes after class file attributes",
                reader.remaining()
            );
        }

        Ok(JVMClassFile {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    fn parse_constant_pool(reader: &mut ClassReader) -> Result<Vec<CPInfo>> {
        let count = reader.u2()? as usize;
        let mut pool = Vec::with_capacity(count);
        pool.push(CPInfo::Unusable);
        while pool.len() < count {
            let tag = reader.u1()?;
            let entry = match tag {
                CONSTANT_UTF8 => {
                    let len = reader.u2()? as usize;
                    let raw = reader.bytes(len)?;
                    CPInfo::ConstantUtf8 {
                        bytes: decode_modified_utf8(&raw)?,
                    }
                }
                CONSTANT_INTEGER => CPInfo::ConstantInteger {
                    bytes: reader.u4()?,
                },
                CONSTANT_FLOAT => CPInfo::ConstantFloat {
                    bytes: reader.u4()?,
                },
                CONSTANT_LONG => CPInfo::ConstantLong {
                    high_bytes: reader.u4()?,
                    low_bytes: reader.u4()?,
                },
                CONSTANT_DOUBLE => CPInfo::ConstantDouble {
                    high_bytes: reader.u4()?,
                    low_bytes: reader.u4()?,
                },
                CONSTANT_CLASS => CPInfo::ConstantClass {
                    name_index: reader.u2()?,
                },
                CONSTANT_STRING => CPInfo::ConstantString {
                    string_index: reader.u2()?,
                },
                CONSTANT_FIELDREF => CPInfo::ConstantFieldRef {
                    class_index: reader.u2()?,
                    name_and_type_index: reader.u2()?,
                },
                CONSTANT_METHODREF => CPInfo::ConstantMethodRef {
                    class_index: reader.u2()?,
                    name_and_type_index: reader.u2()?,
                },
                CONSTANT_INTERFACE_METHODREF => {
                    CPInfo::ConstantInterfaceMethodRef {
                        class_index: reader.u2()?,
                        name_and_type_index: reader.u2()?,
                    }
                }
                CONSTANT_NAME_AND_TYPE => CPInfo::ConstantNameAndType {
                    name_index: reader.u2()?,
                    descriptor_index: reader.u2()?,
                },
                CONSTANT_METHOD_HANDLE => {
                    reader.skip(3)?;
                    CPInfo::Unsupported { tag }
                }
                CONSTANT_METHOD_TYPE | CONSTANT_MODULE | CONSTANT_PACKAGE => {
                    reader.skip(2)?;
                    CPInfo::Unsupported { tag }
                }
                CONSTANT_DYNAMIC | CONSTANT_INVOKE_DYNAMIC => {
                    reader.skip(4)?;
                    CPInfo::Unsupported { tag }
                }
                _ => {
                    return Err(RuntimeError::malformed(format!(
                        "unknown constant pool tag {tag} at index {}",
                        pool.len()
                    )))
                }
            };
            let wide = matches!(
                entry,
                CPInfo::ConstantLong { .. } | CPInfo::ConstantDouble { .. }
            );
            pool.push(entry);
            // Longs and doubles take two entries.
            if wide {
                pool.push(CPInfo::Unusable);
            }
        }
        if pool.len() != count {
            return Err(RuntimeError::malformed(
                "wide constant overruns the constant pool",
            ));
        }
        Ok(pool)
    }

    fn parse_attributes(
        reader: &mut ClassReader,
        constant_pool: &[CPInfo],
    ) -> Result<HashMap<String, AttributeInfo>> {
        let count = reader.u2()?;
        let mut attributes = HashMap::new();
        for _ in 0..count {
            let name_index = reader.u2()?;
            let length = reader.u4()? as usize;
            let name = match constant_pool.get(name_index as usize) {
                Some(CPInfo::ConstantUtf8 { bytes }) => bytes.as_str(),
                _ => {
                    return Err(RuntimeError::malformed(format!(
                        "attribute name {name_index} is not a Utf8"
                    )))
                }
            };
            match name {
                "Code" => {
                    let max_stack = reader.u2()?;
                    let max_locals = reader.u2()?;
                    let code_length = reader.u4()? as usize;
                    let code = reader.bytes(code_length)?;
                    let table_length = reader.u2()?;
                    let mut exception_table =
                        Vec::with_capacity(table_length as usize);
                    for _ in 0..table_length {
                        exception_table.push(ExceptionTableEntry {
                            start_pc: reader.u2()?,
                            end_pc: reader.u2()?,
                            handler_pc: reader.u2()?,
                            catch_type: reader.u2()?,
                        });
                    }
                    // Nested attributes (LineNumberTable, StackMapTable...)
                    // are of no use to the interpreter.
                    Self::parse_attributes(reader, constant_pool)?;
                    attributes.insert(
                        name.to_string(),
                        AttributeInfo::CodeAttribute {
                            max_stack,
                            max_locals,
                            code,
                            exception_table,
                        },
                    );
                }
                "ConstantValue" => {
                    attributes.insert(
                        name.to_string(),
                        AttributeInfo::ConstantValueAttribute {
                            constant_value_index: reader.u2()?,
                        },
                    );
                }
                "SourceFile" => {
                    attributes.insert(
                        name.to_string(),
                        AttributeInfo::SourceFileAttribute {
                            sourcefile_index: reader.u2()?,
                        },
                    );
                }
                _ => reader.skip(length)?,
            }
        }
        Ok(attributes)
    }
}

/// Decode the modified UTF-8 used by class files: NUL is encoded on two
/// bytes and supplementary characters as surrogate pairs.
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let bad = || RuntimeError::malformed("invalid modified UTF-8 sequence");
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            let b2 = *bytes.get(i + 1).ok_or_else(bad)?;
            units.push((((b & 0x1F) as u16) << 6) | (b2 & 0x3F) as u16);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            let b2 = *bytes.get(i + 1).ok_or_else(bad)?;
            let b3 = *bytes.get(i + 2).ok_or_else(bad)?;
            units.push(
                (((b & 0x0F) as u16) << 12)
                    | (((b2 & 0x3F) as u16) << 6)
                    | (b3 & 0x3F) as u16,
            );
            i += 3;
        } else {
            return Err(bad());
        }
    }
    Ok(char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}

/// Reads a class file from disk.
pub fn read_class_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|err| {
        RuntimeError::resolution(format!(
            "cannot read class file {}: {err}",
            path.display()
        ))
    })
}
