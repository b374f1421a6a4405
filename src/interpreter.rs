//! Interpreter for JVM bytecode.
//!
//! `Runtime::step` executes the instruction at the program counter of the
//! current frame. Branch offsets are relative to the address of the opcode;
//! switch operands start on the next 4 byte boundary from the start of the
//! method's code.
use std::cmp::Ordering;

use log::trace;

use crate::bytecode::OPCode;
use crate::class::{ClassId, ConstantPoolEntry, FieldRef, MethodRef};
use crate::program::{field_slot_count, ArrayKind};
use crate::runtime::{Result, Runtime, RuntimeError, RuntimeErrorKind};
use crate::stack::Stack;
use crate::trace::StackTrace;
use crate::value::{Reference, Slot};

/// What `step` did to the current frame's program counter.
enum Flow {
    /// Fall through to the next instruction.
    Next,
    Jump(usize),
    /// A frame was pushed or popped; the counters are already in place.
    Transfer,
}

/// Operand reader over a method's code.
struct Operands<'a> {
    code: &'a [u8],
    pc: usize,
}

impl Operands<'_> {
    fn u1(&mut self) -> Result<u8> {
        let byte = *self
            .code
            .get(self.pc)
            .ok_or_else(|| RuntimeError::malformed(format!("operand past end of code at {}", self.pc)))?;
        self.pc += 1;
        Ok(byte)
    }

    fn i1(&mut self) -> Result<i8> {
        Ok(self.u1()? as i8)
    }

    fn u2(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes([self.u1()?, self.u1()?]))
    }

    fn i2(&mut self) -> Result<i16> {
        Ok(self.u2()? as i16)
    }

    fn i4(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes([self.u1()?, self.u1()?, self.u1()?, self.u1()?]))
    }

    fn align(&mut self) {
        self.pc = self.pc.next_multiple_of(4);
    }
}

fn branch(code: &[u8], pc: usize, offset: i32) -> Result<Flow> {
    let target = pc as i64 + offset as i64;
    if target < 0 || target as usize >= code.len() {
        return Err(RuntimeError::malformed(format!(
            "branch from {pc} by {offset} leaves the method"
        )));
    }
    Ok(Flow::Jump(target as usize))
}

fn int_op(stack: &mut Stack, op: impl FnOnce(i32, i32) -> i32) -> Result<()> {
    let b = stack.pop_int()?;
    let a = stack.pop_int()?;
    stack.push_int(op(a, b));
    Ok(())
}

fn long_op(stack: &mut Stack, op: impl FnOnce(i64, i64) -> i64) -> Result<()> {
    let b = stack.pop_long()?;
    let a = stack.pop_long()?;
    stack.push_long(op(a, b));
    Ok(())
}

fn float_op(stack: &mut Stack, op: impl FnOnce(f32, f32) -> f32) -> Result<()> {
    let b = stack.pop_float()?;
    let a = stack.pop_float()?;
    stack.push_float(op(a, b));
    Ok(())
}

fn double_op(stack: &mut Stack, op: impl FnOnce(f64, f64) -> f64) -> Result<()> {
    let b = stack.pop_double()?;
    let a = stack.pop_double()?;
    stack.push_double(op(a, b));
    Ok(())
}

fn long_shift(stack: &mut Stack, op: impl FnOnce(i64, u32) -> i64) -> Result<()> {
    let shift = stack.pop_int()? & 0x3f;
    let value = stack.pop_long()?;
    stack.push_long(op(value, shift as u32));
    Ok(())
}

fn division_by_zero() -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::Arithmetic, "/ by zero")
}

/// `fcmpl`/`dcmpl` push -1 on NaN, `fcmpg`/`dcmpg` push 1.
fn compare_floating(ordering: Option<Ordering>, nan: i32) -> i32 {
    ordering.map_or(nan, |ordering| ordering as i32)
}

impl Runtime {
    /// Execute one instruction of the current frame.
    pub(crate) fn step(&mut self) -> Result<()> {
        let frame = *self.stack.current()?;
        let class = self.classes.class(frame.class);
        let method = class.method(frame.method);
        let code = match &method.code {
            Some(code) => code.bytes.as_slice(),
            None => {
                return Err(RuntimeError::malformed(format!(
                    "{}.{} has no code",
                    class.name, method.name
                )))
            }
        };
        let pc = frame.pc;
        let byte = *code.get(pc).ok_or_else(|| {
            RuntimeError::malformed(format!(
                "{}.{}{} runs off the end of its code",
                class.name, method.name, method.descriptor
            ))
        })?;
        let opcode = OPCode::from(byte);
        if let Some(profiler) = &mut self.profiler {
            profiler.record(byte);
        }
        trace!("{}.{} {pc:>5}: {}", class.name, method.name, opcode.mnemonic());

        let mut operands = Operands { code, pc: pc + 1 };
        let flow = match opcode {
            OPCode::NOP => Flow::Next,
            OPCode::AconstNull => {
                self.stack.push_reference(Reference::NULL);
                Flow::Next
            }
            OPCode::IconstM1
            | OPCode::Iconst0
            | OPCode::Iconst1
            | OPCode::Iconst2
            | OPCode::Iconst3
            | OPCode::Iconst4
            | OPCode::Iconst5 => {
                self.stack.push_int(byte as i32 - 0x03);
                Flow::Next
            }
            OPCode::Lconst0 | OPCode::Lconst1 => {
                self.stack.push_long(byte as i64 - 0x09);
                Flow::Next
            }
            OPCode::Fconst0 | OPCode::Fconst1 | OPCode::Fconst2 => {
                self.stack.push_float((byte - 0x0b) as f32);
                Flow::Next
            }
            OPCode::Dconst0 | OPCode::Dconst1 => {
                self.stack.push_double((byte - 0x0e) as f64);
                Flow::Next
            }
            OPCode::BiPush => {
                self.stack.push_int(operands.i1()? as i32);
                Flow::Next
            }
            OPCode::SiPush => {
                self.stack.push_int(operands.i2()? as i32);
                Flow::Next
            }
            OPCode::Ldc => {
                let index = operands.u1()? as u16;
                self.load_constant(frame.class, index)?;
                Flow::Next
            }
            OPCode::LdcW => {
                let index = operands.u2()?;
                self.load_constant(frame.class, index)?;
                Flow::Next
            }
            OPCode::Ldc2W => {
                let index = operands.u2()?;
                self.stack.push_wide(class.constant_wide(index)?);
                Flow::Next
            }

            // Loads and stores.
            OPCode::Iload | OPCode::Fload | OPCode::Aload => {
                let index = operands.u1()? as usize;
                let value = self.stack.local(index)?;
                self.stack.push(value);
                Flow::Next
            }
            OPCode::Lload | OPCode::Dload => {
                let index = operands.u1()? as usize;
                let value = self.stack.local_wide(index)?;
                self.stack.push_wide(value);
                Flow::Next
            }
            OPCode::Iload0 | OPCode::Iload1 | OPCode::Iload2 | OPCode::Iload3 => {
                self.load_local(byte - 0x1a)?
            }
            OPCode::Fload0 | OPCode::Fload1 | OPCode::Fload2 | OPCode::Fload3 => {
                self.load_local(byte - 0x22)?
            }
            OPCode::Aload0 | OPCode::Aload1 | OPCode::Aload2 | OPCode::Aload3 => {
                self.load_local(byte - 0x2a)?
            }
            OPCode::Lload0 | OPCode::Lload1 | OPCode::Lload2 | OPCode::Lload3 => {
                self.load_wide_local(byte - 0x1e)?
            }
            OPCode::Dload0 | OPCode::Dload1 | OPCode::Dload2 | OPCode::Dload3 => {
                self.load_wide_local(byte - 0x26)?
            }
            OPCode::Istore | OPCode::Fstore | OPCode::Astore => {
                let index = operands.u1()?;
                self.store_local(index)?
            }
            OPCode::Lstore | OPCode::Dstore => {
                let index = operands.u1()?;
                self.store_wide_local(index)?
            }
            OPCode::Istore0 | OPCode::Istore1 | OPCode::Istore2 | OPCode::Istore3 => {
                self.store_local(byte - 0x3b)?
            }
            OPCode::Fstore0 | OPCode::Fstore1 | OPCode::Fstore2 | OPCode::Fstore3 => {
                self.store_local(byte - 0x43)?
            }
            OPCode::Astore0 | OPCode::Astore1 | OPCode::Astore2 | OPCode::Astore3 => {
                self.store_local(byte - 0x4b)?
            }
            OPCode::Lstore0 | OPCode::Lstore1 | OPCode::Lstore2 | OPCode::Lstore3 => {
                self.store_wide_local(byte - 0x3f)?
            }
            OPCode::Dstore0 | OPCode::Dstore1 | OPCode::Dstore2 | OPCode::Dstore3 => {
                self.store_wide_local(byte - 0x47)?
            }
            OPCode::Iinc => {
                let index = operands.u1()? as usize;
                let delta = operands.i1()? as i32;
                let value = self.stack.local(index)? as i32;
                self.stack.set_local(index, value.wrapping_add(delta) as Slot)?;
                Flow::Next
            }

            // Arrays.
            OPCode::Iaload | OPCode::Faload | OPCode::Aaload => {
                let index = self.stack.pop_int()?;
                let array = self.stack.pop_reference()?;
                let value = self.heap.load_element(array, index)?;
                self.stack.push(value);
                Flow::Next
            }
            OPCode::Laload | OPCode::Daload => {
                let index = self.stack.pop_int()?;
                let array = self.stack.pop_reference()?;
                let value = self.heap.load_wide_element(array, index)?;
                self.stack.push_wide(value);
                Flow::Next
            }
            OPCode::Baload => {
                let index = self.stack.pop_int()?;
                let array = self.stack.pop_reference()?;
                let value = self.heap.load_byte(array, index)?;
                self.stack.push_int(value as i32);
                Flow::Next
            }
            OPCode::Caload => {
                let index = self.stack.pop_int()?;
                let array = self.stack.pop_reference()?;
                let value = self.heap.load_char(array, index)?;
                self.stack.push_int(value as i32);
                Flow::Next
            }
            OPCode::Saload => {
                let index = self.stack.pop_int()?;
                let array = self.stack.pop_reference()?;
                let value = self.heap.load_short(array, index)?;
                self.stack.push_int(value as i32);
                Flow::Next
            }
            OPCode::Iastore | OPCode::Fastore | OPCode::Aastore => {
                let value = self.stack.pop()?;
                let index = self.stack.pop_int()?;
                let array = self.stack.pop_reference()?;
                self.heap.store_element(array, index, value)?;
                Flow::Next
            }
            OPCode::Lastore | OPCode::Dastore => {
                let value = self.stack.pop_wide()?;
                let index = self.stack.pop_int()?;
                let array = self.stack.pop_reference()?;
                self.heap.store_wide_element(array, index, value)?;
                Flow::Next
            }
            OPCode::Bastore => {
                let value = self.stack.pop_int()?;
                let index = self.stack.pop_int()?;
                let array = self.stack.pop_reference()?;
                let value = match self.heap.object(array)?.array_kind {
                    Some(ArrayKind::Boolean) => value & 1,
                    _ => value,
                };
                self.heap.store_byte(array, index, value as i8)?;
                Flow::Next
            }
            OPCode::Castore => {
                let value = self.stack.pop_int()?;
                let index = self.stack.pop_int()?;
                let array = self.stack.pop_reference()?;
                self.heap.store_char(array, index, value as u16)?;
                Flow::Next
            }
            OPCode::Sastore => {
                let value = self.stack.pop_int()?;
                let index = self.stack.pop_int()?;
                let array = self.stack.pop_reference()?;
                self.heap.store_short(array, index, value as i16)?;
                Flow::Next
            }

            // Operand stack shuffles, on raw slots.
            OPCode::Pop => {
                self.stack.pop()?;
                Flow::Next
            }
            OPCode::Pop2 => {
                self.stack.pop()?;
                self.stack.pop()?;
                Flow::Next
            }
            OPCode::Dup => {
                let value = self.stack.peek(0)?;
                self.stack.push(value);
                Flow::Next
            }
            OPCode::DupX1 => self.shuffle(2, &[0, 1, 0])?,
            OPCode::DupX2 => self.shuffle(3, &[0, 2, 1, 0])?,
            OPCode::Dup2 => self.shuffle(2, &[1, 0, 1, 0])?,
            OPCode::Dup2X1 => self.shuffle(3, &[1, 0, 2, 1, 0])?,
            OPCode::Dup2X2 => self.shuffle(4, &[1, 0, 3, 2, 1, 0])?,
            OPCode::Swap => self.shuffle(2, &[0, 1])?,

            // Arithmetic.
            OPCode::Iadd => self.arithmetic(|s| int_op(s, i32::wrapping_add))?,
            OPCode::Ladd => self.arithmetic(|s| long_op(s, i64::wrapping_add))?,
            OPCode::Fadd => self.arithmetic(|s| float_op(s, |a, b| a + b))?,
            OPCode::Dadd => self.arithmetic(|s| double_op(s, |a, b| a + b))?,
            OPCode::Isub => self.arithmetic(|s| int_op(s, i32::wrapping_sub))?,
            OPCode::Lsub => self.arithmetic(|s| long_op(s, i64::wrapping_sub))?,
            OPCode::Fsub => self.arithmetic(|s| float_op(s, |a, b| a - b))?,
            OPCode::Dsub => self.arithmetic(|s| double_op(s, |a, b| a - b))?,
            OPCode::Imul => self.arithmetic(|s| int_op(s, i32::wrapping_mul))?,
            OPCode::Lmul => self.arithmetic(|s| long_op(s, i64::wrapping_mul))?,
            OPCode::Fmul => self.arithmetic(|s| float_op(s, |a, b| a * b))?,
            OPCode::Dmul => self.arithmetic(|s| double_op(s, |a, b| a * b))?,
            OPCode::Fdiv => self.arithmetic(|s| float_op(s, |a, b| a / b))?,
            OPCode::Ddiv => self.arithmetic(|s| double_op(s, |a, b| a / b))?,
            OPCode::Frem => self.arithmetic(|s| float_op(s, |a, b| a % b))?,
            OPCode::Drem => self.arithmetic(|s| double_op(s, |a, b| a % b))?,
            OPCode::Idiv | OPCode::Irem => {
                let b = self.stack.pop_int()?;
                let a = self.stack.pop_int()?;
                if b == 0 {
                    return Err(division_by_zero());
                }
                let result = if opcode == OPCode::Idiv {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                };
                self.stack.push_int(result);
                Flow::Next
            }
            OPCode::Ldiv | OPCode::Lrem => {
                let b = self.stack.pop_long()?;
                let a = self.stack.pop_long()?;
                if b == 0 {
                    return Err(division_by_zero());
                }
                let result = if opcode == OPCode::Ldiv {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                };
                self.stack.push_long(result);
                Flow::Next
            }
            OPCode::Ineg => {
                let value = self.stack.pop_int()?;
                self.stack.push_int(value.wrapping_neg());
                Flow::Next
            }
            OPCode::Lneg => {
                let value = self.stack.pop_long()?;
                self.stack.push_long(value.wrapping_neg());
                Flow::Next
            }
            OPCode::Fneg => {
                let value = self.stack.pop_float()?;
                self.stack.push_float(-value);
                Flow::Next
            }
            OPCode::Dneg => {
                let value = self.stack.pop_double()?;
                self.stack.push_double(-value);
                Flow::Next
            }
            OPCode::Ishl => self.arithmetic(|s| int_op(s, |a, b| a << (b & 0x1f)))?,
            OPCode::Ishr => self.arithmetic(|s| int_op(s, |a, b| a >> (b & 0x1f)))?,
            OPCode::Iushr => {
                self.arithmetic(|s| int_op(s, |a, b| ((a as u32) >> (b & 0x1f)) as i32))?
            }
            OPCode::Lshl => self.arithmetic(|s| long_shift(s, |a, b| a << b))?,
            OPCode::Lshr => self.arithmetic(|s| long_shift(s, |a, b| a >> b))?,
            OPCode::Lushr => self.arithmetic(|s| long_shift(s, |a, b| ((a as u64) >> b) as i64))?,
            OPCode::Iand => self.arithmetic(|s| int_op(s, |a, b| a & b))?,
            OPCode::Land => self.arithmetic(|s| long_op(s, |a, b| a & b))?,
            OPCode::Ior => self.arithmetic(|s| int_op(s, |a, b| a | b))?,
            OPCode::Lor => self.arithmetic(|s| long_op(s, |a, b| a | b))?,
            OPCode::Ixor => self.arithmetic(|s| int_op(s, |a, b| a ^ b))?,
            OPCode::Lxor => self.arithmetic(|s| long_op(s, |a, b| a ^ b))?,

            // Conversions. `as` saturates float to int and maps NaN to 0.
            OPCode::I2L => {
                let value = self.stack.pop_int()?;
                self.stack.push_long(value as i64);
                Flow::Next
            }
            OPCode::I2F => {
                let value = self.stack.pop_int()?;
                self.stack.push_float(value as f32);
                Flow::Next
            }
            OPCode::I2D => {
                let value = self.stack.pop_int()?;
                self.stack.push_double(value as f64);
                Flow::Next
            }
            OPCode::L2I => {
                let value = self.stack.pop_long()?;
                self.stack.push_int(value as i32);
                Flow::Next
            }
            OPCode::L2F => {
                let value = self.stack.pop_long()?;
                self.stack.push_float(value as f32);
                Flow::Next
            }
            OPCode::L2D => {
                let value = self.stack.pop_long()?;
                self.stack.push_double(value as f64);
                Flow::Next
            }
            OPCode::F2I => {
                let value = self.stack.pop_float()?;
                self.stack.push_int(value as i32);
                Flow::Next
            }
            OPCode::F2L => {
                let value = self.stack.pop_float()?;
                self.stack.push_long(value as i64);
                Flow::Next
            }
            OPCode::F2D => {
                let value = self.stack.pop_float()?;
                self.stack.push_double(value as f64);
                Flow::Next
            }
            OPCode::D2I => {
                let value = self.stack.pop_double()?;
                self.stack.push_int(value as i32);
                Flow::Next
            }
            OPCode::D2L => {
                let value = self.stack.pop_double()?;
                self.stack.push_long(value as i64);
                Flow::Next
            }
            OPCode::D2F => {
                let value = self.stack.pop_double()?;
                self.stack.push_float(value as f32);
                Flow::Next
            }
            OPCode::I2B => {
                let value = self.stack.pop_int()?;
                self.stack.push_int(value as i8 as i32);
                Flow::Next
            }
            OPCode::I2C => {
                let value = self.stack.pop_int()?;
                self.stack.push_int(value as u16 as i32);
                Flow::Next
            }
            OPCode::I2S => {
                let value = self.stack.pop_int()?;
                self.stack.push_int(value as i16 as i32);
                Flow::Next
            }

            // Comparisons.
            OPCode::Lcmp => {
                let b = self.stack.pop_long()?;
                let a = self.stack.pop_long()?;
                self.stack.push_int(a.cmp(&b) as i32);
                Flow::Next
            }
            OPCode::Fcmpl | OPCode::Fcmpg => {
                let b = self.stack.pop_float()?;
                let a = self.stack.pop_float()?;
                let nan = if opcode == OPCode::Fcmpl { -1 } else { 1 };
                self.stack.push_int(compare_floating(a.partial_cmp(&b), nan));
                Flow::Next
            }
            OPCode::Dcmpl | OPCode::Dcmpg => {
                let b = self.stack.pop_double()?;
                let a = self.stack.pop_double()?;
                let nan = if opcode == OPCode::Dcmpl { -1 } else { 1 };
                self.stack.push_int(compare_floating(a.partial_cmp(&b), nan));
                Flow::Next
            }

            // Control flow.
            OPCode::IfEq
            | OPCode::IfNe
            | OPCode::IfLt
            | OPCode::IfGe
            | OPCode::IfGt
            | OPCode::IfLe => {
                let offset = operands.i2()? as i32;
                let value = self.stack.pop_int()?;
                let taken = match opcode {
                    OPCode::IfEq => value == 0,
                    OPCode::IfNe => value != 0,
                    OPCode::IfLt => value < 0,
                    OPCode::IfGe => value >= 0,
                    OPCode::IfGt => value > 0,
                    _ => value <= 0,
                };
                if taken {
                    branch(code, pc, offset)?
                } else {
                    Flow::Next
                }
            }
            OPCode::IfIcmpEq
            | OPCode::IfIcmpNe
            | OPCode::IfIcmpLt
            | OPCode::IfIcmpGe
            | OPCode::IfIcmpGt
            | OPCode::IfIcmpLe => {
                let offset = operands.i2()? as i32;
                let b = self.stack.pop_int()?;
                let a = self.stack.pop_int()?;
                let taken = match opcode {
                    OPCode::IfIcmpEq => a == b,
                    OPCode::IfIcmpNe => a != b,
                    OPCode::IfIcmpLt => a < b,
                    OPCode::IfIcmpGe => a >= b,
                    OPCode::IfIcmpGt => a > b,
                    _ => a <= b,
                };
                if taken {
                    branch(code, pc, offset)?
                } else {
                    Flow::Next
                }
            }
            OPCode::IfAcmpEq | OPCode::IfAcmpNe => {
                let offset = operands.i2()? as i32;
                let b = self.stack.pop()?;
                let a = self.stack.pop()?;
                if (a == b) == (opcode == OPCode::IfAcmpEq) {
                    branch(code, pc, offset)?
                } else {
                    Flow::Next
                }
            }
            OPCode::IfNull | OPCode::IfNonNull => {
                let offset = operands.i2()? as i32;
                let value = self.stack.pop_reference()?;
                if value.is_null() == (opcode == OPCode::IfNull) {
                    branch(code, pc, offset)?
                } else {
                    Flow::Next
                }
            }
            OPCode::Goto => branch(code, pc, operands.i2()? as i32)?,
            OPCode::GotoW => branch(code, pc, operands.i4()?)?,
            OPCode::Jsr | OPCode::JsrW => {
                let offset = if opcode == OPCode::Jsr {
                    operands.i2()? as i32
                } else {
                    operands.i4()?
                };
                self.stack.push(operands.pc as Slot);
                branch(code, pc, offset)?
            }
            OPCode::Ret => {
                let index = operands.u1()? as usize;
                let target = self.stack.local(index)? as usize;
                if target >= code.len() {
                    return Err(RuntimeError::malformed(format!("ret to {target}")));
                }
                Flow::Jump(target)
            }
            OPCode::TableSwitch => {
                operands.align();
                let default = operands.i4()?;
                let low = operands.i4()?;
                let high = operands.i4()?;
                if low > high {
                    return Err(RuntimeError::malformed(format!(
                        "tableswitch bounds {low}..{high}"
                    )));
                }
                let key = self.stack.pop_int()?;
                let offset = if key < low || key > high {
                    default
                } else {
                    operands.pc += 4 * (key as i64 - low as i64) as usize;
                    operands.i4()?
                };
                branch(code, pc, offset)?
            }
            OPCode::LookupSwitch => {
                operands.align();
                let default = operands.i4()?;
                let pairs = operands.i4()?;
                let key = self.stack.pop_int()?;
                let mut offset = default;
                for _ in 0..pairs.max(0) {
                    let candidate = operands.i4()?;
                    let target = operands.i4()?;
                    if candidate == key {
                        offset = target;
                        break;
                    }
                }
                branch(code, pc, offset)?
            }
            OPCode::Ireturn | OPCode::Freturn | OPCode::Areturn => {
                let value = self.stack.pop()?;
                self.stack.pop_frame()?;
                self.stack.push(value);
                Flow::Transfer
            }
            OPCode::Lreturn | OPCode::Dreturn => {
                let value = self.stack.pop_wide()?;
                self.stack.pop_frame()?;
                self.stack.push_wide(value);
                Flow::Transfer
            }
            OPCode::Return => {
                self.stack.pop_frame()?;
                Flow::Transfer
            }

            // Fields.
            OPCode::GetStatic | OPCode::PutStatic => {
                let index = operands.u2()?;
                let field = self.classes.resolve_field_ref(frame.class, index)?;
                if !field.is_static {
                    return Err(RuntimeError::incompatible(format!(
                        "{} expects a static field",
                        opcode.mnemonic()
                    )));
                }
                self.ensure_initialized(field.class)?;
                let owner = self.classes.class(field.class);
                let variable = owner.variable(&field);
                let wide = variable.size() == 2;
                match (opcode == OPCode::GetStatic, wide) {
                    (true, false) => self.stack.push(owner.static_slot(variable.slot)?),
                    (true, true) => self.stack.push_wide(owner.static_wide(variable.slot)?),
                    (false, false) => owner.set_static_slot(variable.slot, self.stack.pop()?)?,
                    (false, true) => owner.set_static_wide(variable.slot, self.stack.pop_wide()?)?,
                }
                Flow::Next
            }
            OPCode::GetField => {
                let index = operands.u2()?;
                let field = self.instance_field(frame.class, index)?;
                let slot = self.classes.get(field.class).variable(&field).slot;
                let object = self.stack.pop_reference()?;
                if self.field_is_wide(field.class, &field) {
                    let value = self.heap.get_wide(object, field.class, slot)?;
                    self.stack.push_wide(value);
                } else {
                    let value = self.heap.get_slot(object, field.class, slot)?;
                    self.stack.push(value);
                }
                Flow::Next
            }
            OPCode::PutField => {
                let index = operands.u2()?;
                let field = self.instance_field(frame.class, index)?;
                let slot = self.classes.get(field.class).variable(&field).slot;
                if self.field_is_wide(field.class, &field) {
                    let value = self.stack.pop_wide()?;
                    let object = self.stack.pop_reference()?;
                    self.heap.set_wide(object, field.class, slot, value)?;
                } else {
                    let value = self.stack.pop()?;
                    let object = self.stack.pop_reference()?;
                    self.heap.set_slot(object, field.class, slot, value)?;
                }
                Flow::Next
            }

            // Invocation.
            OPCode::InvokeVirtual => {
                let index = operands.u2()?;
                let target = self.classes.resolve_method_ref(frame.class, index)?;
                let resolved = self.classes.class(target.class);
                let callee = resolved.method(target.index);
                if callee.is_static() {
                    return Err(RuntimeError::incompatible(format!(
                        "invokevirtual of static method {}.{}",
                        resolved.name, callee.name
                    )));
                }
                let receiver = self.receiver(callee.parameter_slots, &callee.name)?;
                let actual = self.heap.class_of(receiver)?;
                let target = if actual == target.class {
                    target
                } else {
                    self.classes
                        .resolve_method(actual, &callee.name, &callee.descriptor)
                        .ok_or_else(|| {
                            RuntimeError::resolution(format!(
                                "no method {}{} for {}",
                                callee.name,
                                callee.descriptor,
                                self.classes.get(actual).name
                            ))
                        })?
                };
                self.call(operands.pc, target)?
            }
            OPCode::InvokeSpecial => {
                let index = operands.u2()?;
                let target = self.any_method_ref(frame.class, index)?;
                let callee = self.classes.class(target.class);
                let callee = callee.method(target.index);
                self.receiver(callee.parameter_slots, &callee.name)?;
                self.call(operands.pc, target)?
            }
            OPCode::InvokeStatic => {
                let index = operands.u2()?;
                let target = self.any_method_ref(frame.class, index)?;
                let owner = self.classes.class(target.class);
                if !owner.method(target.index).is_static() {
                    return Err(RuntimeError::incompatible(format!(
                        "invokestatic of instance method {}.{}",
                        owner.name,
                        owner.method(target.index).name
                    )));
                }
                self.ensure_initialized(target.class)?;
                self.call(operands.pc, target)?
            }
            OPCode::InvokeInterface => {
                let index = operands.u2()?;
                let count = operands.u1()? as usize;
                operands.u1()?;
                if count == 0 {
                    return Err(RuntimeError::malformed("invokeinterface with count 0"));
                }
                let target = self.classes.resolve_interface_method_ref(frame.class, index)?;
                let interface = self.classes.class(target.class);
                let callee = interface.method(target.index);
                let receiver = self.receiver(count, &callee.name)?;
                let actual = self.heap.class_of(receiver)?;
                let target = self
                    .classes
                    .resolve_method(actual, &callee.name, &callee.descriptor)
                    .ok_or_else(|| {
                        RuntimeError::resolution(format!(
                            "{} does not implement {}.{}{}",
                            self.classes.get(actual).name,
                            interface.name,
                            callee.name,
                            callee.descriptor
                        ))
                    })?;
                self.call(operands.pc, target)?
            }
            OPCode::InvokeDynamic => {
                return Err(self.unsupported_opcode(opcode, &class.name, &method.name, pc))
            }

            // Objects.
            OPCode::New => {
                let index = operands.u2()?;
                let target = self.classes.resolve_class(frame.class, index)?;
                let instantiated = self.classes.class(target);
                if instantiated.is_interface() || instantiated.is_abstract() {
                    return Err(RuntimeError::incompatible(format!(
                        "cannot instantiate {}",
                        instantiated.name
                    )));
                }
                self.ensure_initialized(target)?;
                let object = self.heap.new_instance(&self.classes, target)?;
                self.stack.push_reference(object);
                Flow::Next
            }
            OPCode::NewArray => {
                let atype = operands.u1()?;
                let name = ArrayKind::class_name_for_atype(atype).ok_or_else(|| {
                    RuntimeError::malformed(format!("newarray of unknown type {atype}"))
                })?;
                let count = self.stack.pop_int()?;
                let array = self.heap.new_array(&mut self.classes, name, count)?;
                self.stack.push_reference(array);
                Flow::Next
            }
            OPCode::ANewArray => {
                let index = operands.u2()?;
                let element = self.classes.resolve_class(frame.class, index)?;
                let count = self.stack.pop_int()?;
                let array = self.heap.new_reference_array(&mut self.classes, element, count)?;
                self.stack.push_reference(array);
                Flow::Next
            }
            OPCode::MultiANewArray => {
                let index = operands.u2()?;
                let dimensions = operands.u1()? as usize;
                if dimensions == 0 {
                    return Err(RuntimeError::malformed("multianewarray with 0 dimensions"));
                }
                let array_class = self.classes.resolve_class(frame.class, index)?;
                let name = self.classes.get(array_class).name.clone();
                let mut counts = (0..dimensions)
                    .map(|_| self.stack.pop_int())
                    .collect::<Result<Vec<i32>>>()?;
                counts.reverse();
                if let Some(negative) = counts.iter().find(|&&count| count < 0) {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::NegativeArraySize,
                        negative.to_string(),
                    ));
                }
                let array = self.new_multi_array(&name, &counts)?;
                self.stack.push_reference(array);
                Flow::Next
            }
            OPCode::ArrayLength => {
                let array = self.stack.pop_reference()?;
                let length = self.heap.array_length(array)?;
                self.stack.push_int(length as i32);
                Flow::Next
            }
            OPCode::AThrow => {
                let exception = self.stack.pop_reference()?;
                if exception.is_null() {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::NullPointer,
                        format!("athrow of null in {}.{}", class.name, method.name),
                    ));
                }
                let exception_class = self.heap.class_of(exception)?;
                let message = self.exception_message(exception);
                let trace = StackTrace::capture(
                    &self.classes,
                    &self.stack,
                    &self.classes.get(exception_class).name,
                    message,
                );
                return Err(RuntimeError::thrown(exception, trace));
            }
            OPCode::CheckCast => {
                let index = operands.u2()?;
                let object = Reference::from_slot(self.stack.peek(0)?);
                if !object.is_null() {
                    let target = self.classes.resolve_class(frame.class, index)?;
                    if !self.is_instance(object, target)? {
                        let actual = self.heap.class_of(object)?;
                        return Err(RuntimeError::new(
                            RuntimeErrorKind::ClassCast,
                            format!(
                                "{} cannot be cast to {}",
                                self.classes.get(actual).name,
                                self.classes.get(target).name
                            ),
                        ));
                    }
                }
                Flow::Next
            }
            OPCode::InstanceOf => {
                let index = operands.u2()?;
                let object = self.stack.pop_reference()?;
                let result = if object.is_null() {
                    false
                } else {
                    let target = self.classes.resolve_class(frame.class, index)?;
                    self.is_instance(object, target)?
                };
                self.stack.push_int(result as i32);
                Flow::Next
            }
            // Single threaded: monitors only consume their operand.
            OPCode::MonitorEnter | OPCode::MonitorExit => {
                self.stack.pop_reference()?;
                Flow::Next
            }
            OPCode::Wide
            | OPCode::Breakpoint
            | OPCode::ImpDep1
            | OPCode::ImpDep2
            | OPCode::Unspecified => {
                return Err(self.unsupported_opcode(opcode, &class.name, &method.name, pc))
            }
        };

        match flow {
            Flow::Next => self.stack.current_mut()?.pc = operands.pc,
            Flow::Jump(target) => self.stack.current_mut()?.pc = target,
            Flow::Transfer => {}
        }
        Ok(())
    }

    fn unsupported_opcode(&self, opcode: OPCode, class: &str, method: &str, pc: usize) -> RuntimeError {
        RuntimeError::unsupported(format!(
            "opcode {} in {class}.{method} at {pc}",
            opcode.mnemonic()
        ))
    }

    fn load_constant(&mut self, class: ClassId, index: u16) -> Result<()> {
        let owner = self.classes.class(class);
        match owner.entry(index)? {
            ConstantPoolEntry::Integer(_) | ConstantPoolEntry::Float(_) => {
                self.stack.push(owner.constant_int(index)?)
            }
            ConstantPoolEntry::String { .. } => {
                let string = self.resolve_string(class, index)?;
                self.stack.push_reference(string);
            }
            ConstantPoolEntry::Class { .. } => {
                return Err(RuntimeError::unsupported(format!(
                    "ldc of class constant {index} in {}",
                    owner.name
                )))
            }
            _ => {
                return Err(RuntimeError::malformed(format!(
                    "ldc of unloadable constant {index} in {}",
                    owner.name
                )))
            }
        }
        Ok(())
    }

    fn load_local(&mut self, index: u8) -> Result<Flow> {
        let value = self.stack.local(index as usize)?;
        self.stack.push(value);
        Ok(Flow::Next)
    }

    fn load_wide_local(&mut self, index: u8) -> Result<Flow> {
        let value = self.stack.local_wide(index as usize)?;
        self.stack.push_wide(value);
        Ok(Flow::Next)
    }

    fn store_local(&mut self, index: u8) -> Result<Flow> {
        let value = self.stack.pop()?;
        self.stack.set_local(index as usize, value)?;
        Ok(Flow::Next)
    }

    fn store_wide_local(&mut self, index: u8) -> Result<Flow> {
        let value = self.stack.pop_wide()?;
        self.stack.set_local_wide(index as usize, value)?;
        Ok(Flow::Next)
    }

    fn arithmetic(&mut self, op: impl FnOnce(&mut Stack) -> Result<()>) -> Result<Flow> {
        op(&mut self.stack)?;
        Ok(Flow::Next)
    }

    /// Pop `depth` slots and push them back in `order`, where 0 names the
    /// slot that was on top.
    fn shuffle(&mut self, depth: usize, order: &[usize]) -> Result<Flow> {
        let popped = (0..depth)
            .map(|_| self.stack.pop())
            .collect::<Result<Vec<Slot>>>()?;
        for &position in order {
            self.stack.push(popped[position]);
        }
        Ok(Flow::Next)
    }

    /// Resolve a method ref that may be tagged either as a class or an
    /// interface member (`invokestatic`/`invokespecial` accept both).
    fn any_method_ref(&mut self, class: ClassId, index: u16) -> Result<MethodRef> {
        match self.classes.get(class).entry(index)? {
            ConstantPoolEntry::InterfaceMethodref { .. } => {
                self.classes.resolve_interface_method_ref(class, index)
            }
            _ => self.classes.resolve_method_ref(class, index),
        }
    }

    fn instance_field(&mut self, class: ClassId, index: u16) -> Result<FieldRef> {
        let field = self.classes.resolve_field_ref(class, index)?;
        if field.is_static {
            return Err(RuntimeError::incompatible(format!(
                "{} is static",
                self.classes.get(field.class).variable(&field).name
            )));
        }
        Ok(field)
    }

    fn field_is_wide(&self, class: ClassId, field: &FieldRef) -> bool {
        field_slot_count(&self.classes.get(class).variable(field).descriptor) == 2
    }

    /// The receiver of a call taking `parameter_slots` slots, this included.
    fn receiver(&self, parameter_slots: usize, method: &str) -> Result<Reference> {
        if parameter_slots == 0 {
            return Err(RuntimeError::malformed(format!("{method} has no receiver")));
        }
        let receiver = Reference::from_slot(self.stack.peek(parameter_slots - 1)?);
        if receiver.is_null() {
            return Err(RuntimeError::new(
                RuntimeErrorKind::NullPointer,
                format!("cannot invoke {method} on null"),
            ));
        }
        Ok(receiver)
    }

    /// Leave the caller at `return_pc` and enter `target`.
    fn call(&mut self, return_pc: usize, target: MethodRef) -> Result<Flow> {
        self.stack.current_mut()?.pc = return_pc;
        self.invoke(target)?;
        Ok(Flow::Transfer)
    }

    fn is_instance(&mut self, object: Reference, class: ClassId) -> Result<bool> {
        if self.heap.is_instance_of(object, class)? {
            return Ok(true);
        }
        let actual = self.heap.class_of(object)?;
        self.classes.is_assignable(actual, class)
    }

    fn new_multi_array(&mut self, name: &str, counts: &[i32]) -> Result<Reference> {
        let array = self.heap.new_array(&mut self.classes, name, counts[0])?;
        if counts.len() > 1 {
            let element = &name[1..];
            for i in 0..counts[0] {
                let inner = self.new_multi_array(element, &counts[1..])?;
                self.heap.store_element(array, i, inner.to_slot())?;
            }
        }
        Ok(array)
    }

    /// `detailMessage` of a throwable, when it has one.
    fn exception_message(&self, exception: Reference) -> Option<String> {
        let class = self.heap.class_of(exception).ok()?;
        let field = self
            .classes
            .resolve_field(class, "detailMessage", "Ljava/lang/String;")?;
        let slot = self.classes.get(field.class).variable(&field).slot;
        let message = Reference::from_slot(self.heap.get_slot(exception, field.class, slot).ok()?);
        if message.is_null() {
            return None;
        }
        self.heap.read_string(&self.classes, message).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ACC_PUBLIC, ACC_STATIC};
    use crate::runtime::RuntimeSettings;
    use crate::testing::{op, runtime_with, ClassBuilder, MemoryClassSource};

    const STATIC: u16 = ACC_PUBLIC | ACC_STATIC;
    const RTE: &str = "java/lang/RuntimeException";

    fn call(source: MemoryClassSource, descriptor: &str, args: &[Slot]) -> Result<Vec<Slot>> {
        let (mut runtime, _) = runtime_with(source, RuntimeSettings::default());
        runtime.call_static("T", "f", descriptor, args)
    }

    /// Source holding class `T` with the single static method `f`.
    fn single(descriptor: &str, max_stack: u16, max_locals: u16, code: Vec<u8>) -> MemoryClassSource {
        let mut source = MemoryClassSource::with_bootstrap();
        let mut t = ClassBuilder::new("T");
        t.method(STATIC, "f", descriptor, max_stack, max_locals, code);
        source.add(&t);
        source
    }

    fn int_result(code: Vec<u8>) -> i32 {
        call(single("()I", 4, 2, code), "()I", &[]).unwrap()[0] as i32
    }

    fn error_kind(source: MemoryClassSource, descriptor: &str) -> RuntimeErrorKind {
        call(source, descriptor, &[]).unwrap_err().kind()
    }

    /// `<init>()V` that chains to `parent`.
    fn constructor(builder: &mut ClassBuilder, parent: &str) {
        let parent_init = builder.method_ref(parent, "<init>", "()V");
        let mut code = vec![0x2a];
        code.extend(op::u2(0xb7, parent_init));
        code.push(0xb1);
        builder.method(ACC_PUBLIC, "<init>", "()V", 1, 1, code);
    }

    /// `new class; dup; invokespecial <init>` for `builder`'s pool.
    fn instantiate(builder: &mut ClassBuilder, class: &str) -> Vec<u8> {
        let index = builder.class_ref(class);
        let init = builder.method_ref(class, "<init>", "()V");
        let mut code = op::u2(0xbb, index);
        code.push(0x59);
        code.extend(op::u2(0xb7, init));
        code
    }

    #[test]
    fn integer_division_and_shifts() {
        assert_eq!(int_result(vec![0x10, 7, 0x05, 0x6c, 0xac]), 3);
        assert_eq!(int_result(vec![0x10, 7, 0x05, 0x70, 0xac]), 1);
        assert_eq!(int_result(vec![0x10, 0xf9, 0x06, 0x70, 0xac]), -1);
        assert_eq!(int_result(vec![0x04, 0x10, 33, 0x78, 0xac]), 2);
        let source = single("(II)I", 2, 2, vec![0x1a, 0x1b, 0x6c, 0xac]);
        let result = call(source, "(II)I", &[i32::MIN as Slot, -1i32 as Slot]).unwrap();
        assert_eq!(result[0] as i32, i32::MIN);
    }

    #[test]
    fn division_by_zero_is_arithmetic() {
        let source = single("()I", 2, 0, vec![0x04, 0x03, 0x6c, 0xac]);
        assert_eq!(error_kind(source, "()I"), RuntimeErrorKind::Arithmetic);
        let source = single("()I", 2, 0, vec![0x04, 0x03, 0x70, 0xac]);
        assert_eq!(error_kind(source, "()I"), RuntimeErrorKind::Arithmetic);
    }

    #[test]
    fn long_division_and_remainder() {
        // lconst_1; lconst_0; ldiv or lrem
        for opcode in [0x6d, 0x71] {
            let source = single("()J", 4, 0, vec![0x0a, 0x09, opcode, 0xad]);
            assert_eq!(error_kind(source, "()J"), RuntimeErrorKind::Arithmetic);
        }
        let long_op = |opcode: u8, a: i64, b: i64| {
            let source = single("(JJ)J", 4, 4, vec![0x1e, 0x20, opcode, 0xad]);
            let (a_high, a_low) = crate::value::split_wide(a as u64);
            let (b_high, b_low) = crate::value::split_wide(b as u64);
            let result = call(source, "(JJ)J", &[a_high, a_low, b_high, b_low]).unwrap();
            crate::value::join_wide(result[0], result[1]) as i64
        };
        assert_eq!(long_op(0x6d, 7, 2), 3);
        assert_eq!(long_op(0x71, 7, 2), 1);
        assert_eq!(long_op(0x71, -7, 3), -1);
        assert_eq!(long_op(0x6d, i64::MIN, -1), i64::MIN);
        assert_eq!(long_op(0x71, i64::MIN, -1), 0);
    }

    #[test]
    fn long_arithmetic_uses_two_slots() {
        let source = single("(JJ)J", 4, 4, vec![0x1e, 0x20, 0x69, 0xad]);
        let (a_high, a_low) = crate::value::split_wide(3_000_000_000u64);
        let result = call(source, "(JJ)J", &[a_high, a_low, 0, 3]).unwrap();
        assert_eq!(crate::value::join_wide(result[0], result[1]), 9_000_000_000);

        let source = single("(JJ)I", 4, 4, vec![0x1e, 0x20, 0x94, 0xac]);
        let minus_one = crate::value::split_wide(-1i64 as u64);
        let result = call(source, "(JJ)I", &[minus_one.0, minus_one.1, 0, 1]).unwrap();
        assert_eq!(result[0] as i32, -1);
    }

    #[test]
    fn float_compare_nan_bias() {
        let nan = f32::NAN.to_bits();
        let source = single("(FF)I", 2, 2, vec![0x22, 0x23, 0x95, 0xac]);
        assert_eq!(call(source, "(FF)I", &[nan, 0]).unwrap()[0] as i32, -1);
        let source = single("(FF)I", 2, 2, vec![0x22, 0x23, 0x96, 0xac]);
        assert_eq!(call(source, "(FF)I", &[nan, 0]).unwrap()[0] as i32, 1);
        let source = single("(FF)I", 2, 2, vec![0x22, 0x23, 0x96, 0xac]);
        let args = [2.5f32.to_bits(), 1.0f32.to_bits()];
        assert_eq!(call(source, "(FF)I", &args).unwrap()[0] as i32, 1);
    }

    #[test]
    fn double_to_int_saturates() {
        for (value, expected) in [(f64::NAN, 0), (1e20, i32::MAX), (-1e20, i32::MIN), (-2.9, -2)] {
            let source = single("(D)I", 2, 2, vec![0x26, 0x8e, 0xac]);
            let (high, low) = crate::value::split_wide(value.to_bits());
            assert_eq!(call(source, "(D)I", &[high, low]).unwrap()[0] as i32, expected);
        }
    }

    #[test]
    fn stack_shuffles() {
        // 1 2 swap isub
        assert_eq!(int_result(vec![0x04, 0x05, 0x5f, 0x64, 0xac]), 1);
        // 1 2 dup_x1 -> 2 1 2; isub -> 2 -1; iadd -> 1
        assert_eq!(int_result(vec![0x04, 0x05, 0x5a, 0x64, 0x60, 0xac]), 1);
    }

    #[test]
    fn loops_with_backward_branches() {
        let code = vec![
            0x03, 0x3c, // sum = 0
            0x1a, 0x9e, 0x00, 0x0d, // 2: if n <= 0 goto 16
            0x1b, 0x1a, 0x60, 0x3c, // sum += n
            0x84, 0x00, 0xff, // n--
            0xa7, 0xff, 0xf5, // goto 2
            0x1b, 0xac,
        ];
        let source = single("(I)I", 2, 2, code);
        assert_eq!(call(source, "(I)I", &[4]).unwrap()[0], 10);
    }

    #[test]
    fn table_switch_selects_case_or_default() {
        let mut code = vec![0x1a, 0xaa, 0x00, 0x00];
        for word in [33i32, 1, 3, 27, 29, 31] {
            code.extend(word.to_be_bytes());
        }
        code.extend([0x04, 0xac, 0x05, 0xac, 0x06, 0xac, 0x02, 0xac]);
        for (key, expected) in [(1, 1), (2, 2), (3, 3), (0, -1), (5, -1)] {
            let source = single("(I)I", 1, 1, code.clone());
            assert_eq!(call(source, "(I)I", &[key as Slot]).unwrap()[0] as i32, expected);
        }
    }

    #[test]
    fn lookup_switch_matches_keys() {
        let mut code = vec![0x1a, 0xab, 0x00, 0x00];
        for word in [31i32, 2, 100, 27, -5, 29] {
            code.extend(word.to_be_bytes());
        }
        code.extend([0x04, 0xac, 0x05, 0xac, 0x03, 0xac]);
        for (key, expected) in [(100, 1), (-5, 2), (7, 0)] {
            let source = single("(I)I", 1, 1, code.clone());
            assert_eq!(call(source, "(I)I", &[key as Slot]).unwrap()[0] as i32, expected);
        }
    }

    #[test]
    fn subroutines_return_through_locals() {
        let code = vec![
            0xa8, 0x00, 0x05, // jsr 5
            0x1a, 0xac, // 3: return n
            0x4c, // 5: astore_1
            0x10, 9, 0x3b, // n = 9
            0xa9, 0x01, // ret 1
        ];
        let source = single("(I)I", 1, 2, code);
        assert_eq!(call(source, "(I)I", &[0]).unwrap()[0], 9);
    }

    #[test]
    fn byte_arrays_sign_extend() {
        let code = vec![
            0x05, 0xbc, 8, // new byte[2]
            0x59, 0x03, 0x10, 0xff, 0x54, // a[0] = -1
            0x03, 0x33, 0xac,
        ];
        assert_eq!(int_result(code), -1);
    }

    #[test]
    fn array_errors() {
        let source = single("()I", 2, 0, vec![0x02, 0xbc, 10, 0xbe, 0xac]);
        assert_eq!(error_kind(source, "()I"), RuntimeErrorKind::NegativeArraySize);
        let source = single("()I", 2, 0, vec![0x04, 0xbc, 10, 0x04, 0x2e, 0xac]);
        assert_eq!(error_kind(source, "()I"), RuntimeErrorKind::ArrayIndexOutOfBounds);
        let source = single("()I", 2, 0, vec![0x01, 0xbe, 0xac]);
        assert_eq!(error_kind(source, "()I"), RuntimeErrorKind::NullPointer);
    }

    #[test]
    fn multi_dimensional_arrays() {
        let mut source = MemoryClassSource::with_bootstrap();
        let mut t = ClassBuilder::new("T");
        let matrix = t.class_ref("[[I");
        let mut code = vec![0x05, 0x06];
        code.extend(op::u2(0xc5, matrix));
        code.extend([2, 0x04, 0x32, 0xbe, 0xac]);
        t.method(STATIC, "f", "()I", 2, 0, code);
        source.add(&t);
        assert_eq!(call(source, "()I", &[]).unwrap()[0], 3);
    }

    #[test]
    fn reference_arrays_of_strings() {
        let mut source = MemoryClassSource::with_bootstrap();
        let mut t = ClassBuilder::new("T");
        let string = t.class_ref("java/lang/String");
        let hello = t.string("hello");
        let mut code = vec![0x04];
        code.extend(op::u2(0xbd, string));
        code.extend([0x59, 0x03, 0x12, hello as u8, 0x53, 0x03, 0x32, 0xb0]);
        t.method(STATIC, "f", "()Ljava/lang/String;", 4, 0, code);
        source.add(&t);
        let (mut runtime, _) = runtime_with(source, RuntimeSettings::default());
        let result = runtime.call_static("T", "f", "()Ljava/lang/String;", &[]).unwrap();
        let text = runtime.heap().read_string(runtime.classes(), Reference(result[0])).unwrap();
        assert_eq!(text, "hello");
    }

    fn animals(source: &mut MemoryClassSource) {
        let mut animal = ClassBuilder::new("Animal");
        constructor(&mut animal, "java/lang/Object");
        animal.method(ACC_PUBLIC, "sound", "()I", 1, 1, vec![0x04, 0xac]);
        source.add(&animal);
        let mut dog = ClassBuilder::new("Dog");
        dog.extends("Animal");
        dog.implements("Pet");
        constructor(&mut dog, "Animal");
        dog.method(ACC_PUBLIC, "sound", "()I", 1, 1, vec![0x05, 0xac]);
        dog.method(ACC_PUBLIC, "tricks", "()I", 1, 1, vec![0x08, 0xac]);
        source.add(&dog);
        let mut pet = ClassBuilder::new("Pet");
        pet.interface();
        pet.abstract_method("tricks", "()I");
        source.add(&pet);
    }

    #[test]
    fn virtual_calls_dispatch_on_receiver() {
        let mut source = MemoryClassSource::with_bootstrap();
        animals(&mut source);
        let mut t = ClassBuilder::new("T");
        let sound = t.method_ref("Animal", "sound", "()I");
        let mut code = instantiate(&mut t, "Dog");
        code.extend(op::u2(0xb6, sound));
        code.push(0xac);
        t.method(STATIC, "f", "()I", 2, 0, code);
        source.add(&t);
        assert_eq!(call(source, "()I", &[]).unwrap()[0], 2);
    }

    #[test]
    fn interface_calls_find_implementation() {
        let mut source = MemoryClassSource::with_bootstrap();
        animals(&mut source);
        let mut t = ClassBuilder::new("T");
        let tricks = t.interface_method_ref("Pet", "tricks", "()I");
        let mut code = instantiate(&mut t, "Dog");
        code.extend(op::u2(0xb9, tricks));
        code.extend([1, 0, 0xac]);
        t.method(STATIC, "f", "()I", 2, 0, code);
        source.add(&t);
        assert_eq!(call(source, "()I", &[]).unwrap()[0], 5);
    }

    #[test]
    fn calls_on_null_fail() {
        let mut source = MemoryClassSource::with_bootstrap();
        animals(&mut source);
        let mut t = ClassBuilder::new("T");
        let sound = t.method_ref("Animal", "sound", "()I");
        let mut code = vec![0x01];
        code.extend(op::u2(0xb6, sound));
        code.push(0xac);
        t.method(STATIC, "f", "()I", 1, 0, code);
        source.add(&t);
        assert_eq!(error_kind(source, "()I"), RuntimeErrorKind::NullPointer);
    }

    #[test]
    fn type_checks() {
        let mut source = MemoryClassSource::with_bootstrap();
        animals(&mut source);
        let mut t = ClassBuilder::new("T");
        let pet = t.class_ref("Pet");
        let animal = t.class_ref("Animal");
        let text = t.string("x");
        // new Dog() instanceof Pet
        let mut code = instantiate(&mut t, "Dog");
        code.extend(op::u2(0xc1, pet));
        code.push(0xac);
        t.method(STATIC, "f", "()I", 2, 0, code);
        // (Animal) "x"
        let mut code = vec![0x12, text as u8];
        code.extend(op::u2(0xc0, animal));
        code.push(0xb0);
        t.method(STATIC, "g", "()Ljava/lang/Object;", 1, 0, code);
        source.add(&t);

        let (mut runtime, _) = runtime_with(source, RuntimeSettings::default());
        assert_eq!(runtime.call_static("T", "f", "()I", &[]).unwrap()[0], 1);
        let err = runtime
            .call_static("T", "g", "()Ljava/lang/Object;", &[])
            .unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::ClassCast);
        assert_eq!(err.message(), "java/lang/String cannot be cast to Animal");
    }

    #[test]
    fn instance_fields_hold_longs() {
        let mut source = MemoryClassSource::with_bootstrap();
        let mut point = ClassBuilder::new("Point");
        point.field(0, "tag", "I");
        point.field(0, "big", "J");
        constructor(&mut point, "java/lang/Object");
        source.add(&point);
        let mut t = ClassBuilder::new("T");
        let big = t.field_ref("Point", "big", "J");
        let value = t.long(-42);
        let mut code = instantiate(&mut t, "Point");
        code.push(0x59);
        code.extend(op::u2(0x14, value));
        code.extend(op::u2(0xb5, big));
        code.extend(op::u2(0xb4, big));
        code.push(0xad);
        t.method(STATIC, "f", "()J", 4, 0, code);
        source.add(&t);
        let result = call(source, "()J", &[]).unwrap();
        assert_eq!(crate::value::join_wide(result[0], result[1]) as i64, -42);
    }

    #[test]
    fn exceptions_are_caught_by_matching_handler() {
        let mut source = MemoryClassSource::with_bootstrap();
        let mut t = ClassBuilder::new("T");
        let mut code = instantiate(&mut t, RTE);
        code.extend([0xbf, 0x4b, 0x10, 7, 0xac]);
        t.method_with_handlers(STATIC, "f", "()I", 2, 1, code, &[(0, 8, 8, Some("java/lang/Exception"))]);
        source.add(&t);
        assert_eq!(call(source, "()I", &[]).unwrap()[0], 7);
    }

    #[test]
    fn exceptions_unwind_into_callers() {
        let mut source = MemoryClassSource::with_bootstrap();
        let mut t = ClassBuilder::new("T");
        let mut code = instantiate(&mut t, RTE);
        code.push(0xbf);
        t.method(STATIC, "g", "()V", 2, 0, code);
        let g = t.method_ref("T", "g", "()V");
        let mut code = op::u2(0xb8, g);
        code.extend([0x03, 0xac, 0x57, 0x08, 0xac]);
        t.method_with_handlers(STATIC, "f", "()I", 1, 0, code, &[(0, 3, 5, None)]);
        source.add(&t);
        assert_eq!(call(source, "()I", &[]).unwrap()[0], 5);
    }

    #[test]
    fn unrelated_handlers_are_skipped() {
        let mut source = MemoryClassSource::with_bootstrap();
        animals(&mut source);
        let mut t = ClassBuilder::new("T");
        let mut code = instantiate(&mut t, RTE);
        code.extend([0xbf, 0x57, 0x03, 0xac]);
        t.method_with_handlers(STATIC, "f", "()I", 2, 0, code, &[(0, 8, 8, Some("Animal"))]);
        source.add(&t);
        let err = call(source, "()I", &[]).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::UncaughtException);
        assert!(err.exception().is_some());
        let trace = err.stack_trace().unwrap();
        assert_eq!(trace.exception_class, RTE);
        assert_eq!(trace.elements[0].method_name, "f");
        assert!(err.to_string().contains("java.lang.RuntimeException"));
    }

    #[test]
    fn exception_from_class_initializer_reaches_caller() {
        let mut source = MemoryClassSource::with_bootstrap();
        let mut bad = ClassBuilder::new("Bad");
        bad.field(ACC_STATIC, "x", "I");
        let mut clinit = instantiate(&mut bad, RTE);
        clinit.push(0xbf);
        bad.method(ACC_STATIC, "<clinit>", "()V", 2, 0, clinit);
        source.add(&bad);

        let mut t = ClassBuilder::new("T");
        let x = t.field_ref("Bad", "x", "I");
        let mut code = op::u2(0xb2, x);
        code.extend([0xac, 0x57, 0x10, 9, 0xac]);
        t.method_with_handlers(STATIC, "f", "()I", 1, 0, code, &[(0, 3, 4, Some(RTE))]);
        source.add(&t);
        assert_eq!(call(source, "()I", &[]).unwrap()[0], 9);
    }

    #[test]
    fn uncaught_exception_prints_through_java() {
        let mut source = MemoryClassSource::with_bootstrap();
        let mut oops = ClassBuilder::new("Oops");
        oops.extends(RTE);
        constructor(&mut oops, RTE);
        let out = oops.field_ref("java/lang/System", "out", "Ljava/io/PrintStream;");
        let print = oops.method_ref("java/io/PrintStream", "print", "(Ljava/lang/String;)V");
        let text = oops.string("oops");
        let mut code = op::u2(0xb2, out);
        code.extend([0x12, text as u8]);
        code.extend(op::u2(0xb6, print));
        code.push(0xb1);
        oops.method(ACC_PUBLIC, "printStackTrace", "()V", 2, 1, code);
        source.add(&oops);

        let mut main = ClassBuilder::new("Main");
        let mut code = instantiate(&mut main, "Oops");
        code.push(0xbf);
        main.method(STATIC, "main", "([Ljava/lang/String;)V", 2, 1, code);
        source.add(&main);

        let (mut runtime, output) = runtime_with(source, RuntimeSettings::default());
        let err = runtime.start("Main", &[]).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::UncaughtException);
        assert_eq!(output.text(), "oops");
        assert_eq!(runtime.stack().depth(), 0);
    }

    #[test]
    fn throwable_natives_see_the_creating_frames() {
        let mut source = MemoryClassSource::with_bootstrap();
        let mut boom = ClassBuilder::new("Boom");
        boom.extends(RTE);
        constructor(&mut boom, RTE);
        source.add(&boom);

        let mut t = ClassBuilder::new("T");
        t.source_file("T.java");
        let depth = t.method_ref("java/lang/Throwable", "getStackTraceDepth", "()I");
        let element = t.method_ref(
            "java/lang/Throwable",
            "getStackTraceElement",
            "(I)Ljava/lang/StackTraceElement;",
        );
        let method_name =
            t.field_ref("java/lang/StackTraceElement", "methodName", "Ljava/lang/String;");
        let mut code = instantiate(&mut t, "Boom");
        code.extend(op::u2(0xb6, depth));
        code.push(0xac);
        t.method(STATIC, "f", "()I", 2, 0, code);
        let mut code = instantiate(&mut t, "Boom");
        code.push(0x03);
        code.extend(op::u2(0xb6, element));
        code.extend(op::u2(0xb4, method_name));
        code.push(0xb0);
        t.method(STATIC, "g", "()Ljava/lang/String;", 3, 0, code);
        source.add(&t);

        let (mut runtime, _) = runtime_with(source, RuntimeSettings::default());
        assert_eq!(runtime.call_static("T", "f", "()I", &[]).unwrap()[0], 1);
        let name = runtime.call_static("T", "g", "()Ljava/lang/String;", &[]).unwrap();
        let text = runtime.heap().read_string(runtime.classes(), Reference(name[0])).unwrap();
        assert_eq!(text, "g");
    }

    /// Exception class whose constructor stores the method and class names
    /// of the first `recorded.len()` stack trace elements into the named
    /// static fields.
    fn recording_exception(name: &str, recorded: &[(&str, &str)]) -> ClassBuilder {
        let mut class = ClassBuilder::new(name);
        class.extends(RTE);
        let super_init = class.method_ref(RTE, "<init>", "()V");
        let element = class.method_ref(
            "java/lang/Throwable",
            "getStackTraceElement",
            "(I)Ljava/lang/StackTraceElement;",
        );
        let mut code = vec![0x2a];
        code.extend(op::u2(0xb7, super_init));
        for (i, (field, member)) in recorded.iter().enumerate() {
            class.field(ACC_STATIC, field, "Ljava/lang/String;");
            let member = class.field_ref("java/lang/StackTraceElement", member, "Ljava/lang/String;");
            let target = class.field_ref(name, field, "Ljava/lang/String;");
            code.extend([0x2a, 0x03 + i as u8]);
            code.extend(op::u2(0xb6, element));
            code.extend(op::u2(0xb4, member));
            code.extend(op::u2(0xb3, target));
        }
        code.push(0xb1);
        class.method(ACC_PUBLIC, "<init>", "()V", 2, 1, code);
        class
    }

    fn static_string(runtime: &Runtime, class: &str, field: &str) -> String {
        let id = runtime.classes().find(class).unwrap();
        let class = runtime.classes().get(id);
        let index = class.find_static_variable(field, "Ljava/lang/String;").unwrap();
        let slot = class.static_slot(class.static_variables()[index].slot).unwrap();
        runtime.heap().read_string(runtime.classes(), Reference(slot)).unwrap()
    }

    #[test]
    fn constructor_frames_are_left_out_of_traces() {
        let mut source = MemoryClassSource::with_bootstrap();
        source.add(&recording_exception("Boom", &[("creator", "methodName")]));
        let mut t = ClassBuilder::new("T");
        let depth = t.field_ref("java/lang/Throwable", "depth", "I");
        let mut code = instantiate(&mut t, "Boom");
        code.extend(op::u2(0xb4, depth));
        code.push(0xac);
        t.method(STATIC, "f", "()I", 2, 0, code);
        source.add(&t);

        let (mut runtime, _) = runtime_with(source, RuntimeSettings::default());
        assert_eq!(runtime.call_static("T", "f", "()I", &[]).unwrap()[0], 1);
        assert_eq!(static_string(&runtime, "Boom", "creator"), "f");
    }

    #[test]
    fn static_factories_stay_in_traces() {
        let mut source = MemoryClassSource::with_bootstrap();
        let mut trail = recording_exception(
            "Trail",
            &[("top", "methodName"), ("below", "methodName")],
        );
        let mut make = instantiate(&mut trail, "Trail");
        make.push(0xb0);
        trail.method(STATIC, "make", "()LTrail;", 2, 0, make);
        let mut owner = recording_exception("Owner", &[("owner", "declaringClass")]);
        let mut make = instantiate(&mut owner, "Owner");
        make.push(0xb0);
        owner.method(STATIC, "make", "()LOwner;", 2, 0, make);
        source.add(&trail);
        source.add(&owner);

        let mut t = ClassBuilder::new("T");
        let depth = t.field_ref("java/lang/Throwable", "depth", "I");
        let make_trail = t.method_ref("Trail", "make", "()LTrail;");
        let make_owner = t.method_ref("Owner", "make", "()LOwner;");
        let mut code = op::u2(0xb8, make_trail);
        code.extend(op::u2(0xb4, depth));
        code.push(0xac);
        t.method(STATIC, "g", "()I", 1, 0, code);
        let mut code = op::u2(0xb8, make_owner);
        code.push(0xb0);
        t.method(STATIC, "h", "()LOwner;", 1, 0, code);
        source.add(&t);

        let (mut runtime, _) = runtime_with(source, RuntimeSettings::default());
        assert_eq!(runtime.call_static("T", "g", "()I", &[]).unwrap()[0], 2);
        assert_eq!(static_string(&runtime, "Trail", "top"), "make");
        assert_eq!(static_string(&runtime, "Trail", "below"), "g");
        runtime.call_static("T", "h", "()LOwner;", &[]).unwrap();
        assert_eq!(static_string(&runtime, "Owner", "owner"), "Owner");
    }

    #[test]
    fn unbounded_recursion_overflows() {
        let mut source = MemoryClassSource::with_bootstrap();
        let mut t = ClassBuilder::new("T");
        let f = t.method_ref("T", "f", "()V");
        let mut code = op::u2(0xb8, f);
        code.push(0xb1);
        t.method(STATIC, "f", "()V", 0, 0, code);
        source.add(&t);
        let settings = RuntimeSettings {
            stack_size: 512,
            ..RuntimeSettings::default()
        };
        let (mut runtime, _) = runtime_with(source, settings);
        let err = runtime.call_static("T", "f", "()V", &[]).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::StackOverflow);
    }

    #[test]
    fn unsupported_opcodes_are_reported() {
        for code in [vec![0xba, 0, 1, 0, 0, 0xb1], vec![0xc4, 0x15, 0, 1, 0xb1], vec![0xcb]] {
            let source = single("()V", 1, 2, code);
            assert_eq!(error_kind(source, "()V"), RuntimeErrorKind::UnsupportedOperation);
        }
    }

    #[test]
    fn monitors_consume_their_operand() {
        let mut source = MemoryClassSource::with_bootstrap();
        let mut t = ClassBuilder::new("T");
        let mut code = instantiate(&mut t, "java/lang/Object");
        code.extend([0x59, 0xc2, 0xc3, 0x04, 0xac]);
        t.method(STATIC, "f", "()I", 2, 0, code);
        source.add(&t);
        assert_eq!(call(source, "()I", &[]).unwrap()[0], 1);
    }
}
