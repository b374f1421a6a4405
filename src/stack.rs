//! Call stack: one slot arena shared by all frames plus a vector of frame
//! descriptors.
//!
//! A frame's locals start where the caller's outgoing arguments were
//! pushed, so parameters become the callee's first locals without a copy.
//! Its operand region follows the locals.
use crate::class::{ClassId, Method};
use crate::runtime::{Result, RuntimeError, RuntimeErrorKind};
use crate::value::{join_wide, split_wide, Reference, Slot};

pub const DEFAULT_STACK_SIZE: usize = 10240;
pub const MAX_STACK_SIZE: usize = 10_000_000;

/// Bytes accounted per frame for its bookkeeping (back link, class,
/// method, saved pc).
const FRAME_HEADER_SIZE: usize = 16;
const SLOT_SIZE: usize = 4;

/// Activation record of an interpreted method.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Frame {
    pub class: ClassId,
    pub method: usize,
    /// Offset of the instruction being executed.
    pub pc: usize,
    locals: usize,
    operands: usize,
}

impl Frame {
    pub const fn max_locals(&self) -> usize {
        self.operands - self.locals
    }
}

#[derive(Debug)]
pub struct Stack {
    slots: Vec<Slot>,
    frames: Vec<Frame>,
    max_size: usize,
    high_water: usize,
}

impl Stack {
    /// Create a stack limited to `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            slots: Vec::with_capacity(max_size / SLOT_SIZE),
            frames: Vec::new(),
            max_size,
            high_water: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn current(&self) -> Result<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| RuntimeError::malformed("no active frame"))
    }

    pub fn current_mut(&mut self) -> Result<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| RuntimeError::malformed("no active frame"))
    }

    /// Bytes in use, frame headers included.
    pub fn used(&self) -> usize {
        self.frames.len() * FRAME_HEADER_SIZE + self.slots.len() * SLOT_SIZE
    }

    /// Largest number of bytes ever in use.
    pub const fn high_water(&self) -> usize {
        self.high_water
    }

    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Install a frame for `method`. Its `parameter_slots` topmost operand
    /// slots become locals `0..parameter_slots`.
    pub fn push_frame(&mut self, class: ClassId, index: usize, method: &Method) -> Result<()> {
        let code = method.code.as_ref().ok_or_else(|| {
            RuntimeError::malformed(format!("{}{} has no code", method.name, method.descriptor))
        })?;
        let max_locals = code.max_locals as usize;
        let params = method.parameter_slots;
        if max_locals < params {
            return Err(RuntimeError::malformed(format!(
                "{}{}: max_locals {max_locals} below {params} parameter slots",
                method.name, method.descriptor
            )));
        }
        if self.operand_count() < params {
            return Err(RuntimeError::malformed(format!(
                "{}{}: missing arguments on the operand stack",
                method.name, method.descriptor
            )));
        }
        let locals = self.slots.len() - params;
        let required = (self.frames.len() + 1) * FRAME_HEADER_SIZE
            + (locals + max_locals + code.max_stack as usize) * SLOT_SIZE;
        if required > self.max_size {
            return Err(RuntimeError::new(
                RuntimeErrorKind::StackOverflow,
                format!(
                    "stack overflow entering {}{} ({required} of {} bytes)",
                    method.name, method.descriptor, self.max_size
                ),
            ));
        }
        self.slots.resize(locals + max_locals, 0);
        self.frames.push(Frame {
            class,
            method: index,
            pc: 0,
            locals,
            operands: locals + max_locals,
        });
        self.high_water = self.high_water.max(required);
        Ok(())
    }

    /// Drop the current frame together with its locals and operands.
    pub fn pop_frame(&mut self) -> Result<Frame> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| RuntimeError::malformed("frame stack underflow"))?;
        self.slots.truncate(frame.locals);
        Ok(frame)
    }

    fn operand_base(&self) -> usize {
        self.frames.last().map_or(0, |frame| frame.operands)
    }

    /// Slots in use across all frames.
    pub fn height(&self) -> usize {
        self.slots.len()
    }

    /// Discard the frames above `depth` and the slots above `height`, as
    /// recorded before a call that failed.
    pub fn unwind_to(&mut self, depth: usize, height: usize) {
        self.frames.truncate(depth);
        self.slots.truncate(height);
    }

    /// Slots on the current operand stack.
    pub fn operand_count(&self) -> usize {
        self.slots.len() - self.operand_base()
    }

    pub fn clear_operands(&mut self) {
        let base = self.operand_base();
        self.slots.truncate(base);
    }

    pub fn push(&mut self, value: Slot) {
        self.slots.push(value);
        let used = self.used();
        if used > self.high_water {
            self.high_water = used;
        }
    }

    pub fn pop(&mut self) -> Result<Slot> {
        if self.operand_count() == 0 {
            return Err(RuntimeError::malformed("operand stack underflow"));
        }
        self.slots
            .pop()
            .ok_or_else(|| RuntimeError::malformed("operand stack underflow"))
    }

    /// Slot `depth` positions below the top, 0 being the top.
    pub fn peek(&self, depth: usize) -> Result<Slot> {
        if depth >= self.operand_count() {
            return Err(RuntimeError::malformed("operand stack underflow"));
        }
        Ok(self.slots[self.slots.len() - 1 - depth])
    }

    /// Copy of the `count` topmost slots, deepest first.
    pub fn top_slots(&self, count: usize) -> Result<Vec<Slot>> {
        if count > self.operand_count() {
            return Err(RuntimeError::malformed("operand stack underflow"));
        }
        Ok(self.slots[self.slots.len() - count..].to_vec())
    }

    /// Remove the `discard` slots lying directly under the `keep` topmost
    /// ones.
    pub fn compact(&mut self, discard: usize, keep: usize) -> Result<()> {
        if discard + keep > self.operand_count() {
            return Err(RuntimeError::malformed("operand stack underflow"));
        }
        let end = self.slots.len() - keep;
        self.slots.drain(end - discard..end);
        Ok(())
    }

    pub fn push_int(&mut self, value: i32) {
        self.push(value as Slot);
    }

    pub fn pop_int(&mut self) -> Result<i32> {
        Ok(self.pop()? as i32)
    }

    pub fn push_float(&mut self, value: f32) {
        self.push(value.to_bits());
    }

    pub fn pop_float(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.pop()?))
    }

    /// Push a 64-bit pattern, high half first.
    pub fn push_wide(&mut self, value: u64) {
        let (high, low) = split_wide(value);
        self.push(high);
        self.push(low);
    }

    pub fn pop_wide(&mut self) -> Result<u64> {
        let low = self.pop()?;
        let high = self.pop()?;
        Ok(join_wide(high, low))
    }

    pub fn push_long(&mut self, value: i64) {
        self.push_wide(value as u64);
    }

    pub fn pop_long(&mut self) -> Result<i64> {
        Ok(self.pop_wide()? as i64)
    }

    pub fn push_double(&mut self, value: f64) {
        self.push_wide(value.to_bits());
    }

    pub fn pop_double(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.pop_wide()?))
    }

    pub fn push_reference(&mut self, value: Reference) {
        self.push(value.to_slot());
    }

    pub fn pop_reference(&mut self) -> Result<Reference> {
        Ok(Reference::from_slot(self.pop()?))
    }

    fn local_index(&self, index: usize) -> Result<usize> {
        let frame = self.current()?;
        if index >= frame.max_locals() {
            return Err(RuntimeError::malformed(format!(
                "local variable {index} out of range"
            )));
        }
        Ok(frame.locals + index)
    }

    pub fn local(&self, index: usize) -> Result<Slot> {
        Ok(self.slots[self.local_index(index)?])
    }

    pub fn set_local(&mut self, index: usize, value: Slot) -> Result<()> {
        let i = self.local_index(index)?;
        self.slots[i] = value;
        Ok(())
    }

    pub fn local_wide(&self, index: usize) -> Result<u64> {
        Ok(join_wide(self.local(index)?, self.local(index + 1)?))
    }

    pub fn set_local_wide(&mut self, index: usize, value: u64) -> Result<()> {
        let (high, low) = split_wide(value);
        self.set_local(index, high)?;
        self.set_local(index + 1, low)
    }
}
