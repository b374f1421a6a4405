//! Object heap.
//!
//! Objects are not laid out flat: every ancestor level of an instance is a
//! separate heap object holding only that level's fields, chained through
//! `super_instance`. Arrays store their element count in slot 0 followed by
//! the packed element data. Nothing is ever freed.
use log::{debug, trace};

use crate::class::ClassId;
use crate::method_area::{ClassRegistry, OBJECT_CLASS, STRING_CLASS};
use crate::program::ArrayKind;
use crate::runtime::{Result, RuntimeError, RuntimeErrorKind};
use crate::value::{join_wide, split_wide, Reference, Slot};

const INITIAL_CAPACITY: usize = 1024;
/// Largest single object, in slots (1 GiB).
const MAX_OBJECT_SLOTS: usize = 1 << 28;

fn out_of_memory(class_name: &str, count: usize) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::OutOfMemory,
        format!("cannot allocate {class_name} of {count} elements"),
    )
}

/// One level of an object, or a whole array.
#[derive(Debug, Clone)]
pub struct HeapObject {
    pub class: ClassId,
    pub super_instance: Reference,
    pub array_kind: Option<ArrayKind>,
    slots: Vec<Slot>,
}

impl HeapObject {
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }
}

/// Allocation statistics reported by `-mem`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub objects: usize,
    pub slots: usize,
    pub capacity: usize,
}

/// `ObjectHeap` owns the object table. Entry 0 is the null reference.
#[derive(Debug)]
pub struct ObjectHeap {
    objects: Vec<Option<HeapObject>>,
    capacity: usize,
    allocated_slots: usize,
}

impl ObjectHeap {
    pub fn new() -> Self {
        let mut objects = Vec::with_capacity(INITIAL_CAPACITY);
        objects.push(None);
        Self {
            objects,
            capacity: INITIAL_CAPACITY,
            allocated_slots: 0,
        }
    }

    fn allocate(&mut self, object: HeapObject) -> Result<Reference> {
        if self.objects.len() >= u32::MAX as usize {
            return Err(RuntimeError::new(
                RuntimeErrorKind::OutOfMemory,
                "object table exhausted",
            ));
        }
        if self.objects.len() == self.capacity {
            self.capacity *= 2;
            self.objects
                .reserve_exact(self.capacity - self.objects.len());
            debug!("object table grown to {} entries", self.capacity);
        }
        self.allocated_slots += object.slots.len();
        let reference = Reference(self.objects.len() as u32);
        self.objects.push(Some(object));
        Ok(reference)
    }

    /// Allocate a zeroed instance of `class`, super instances first.
    pub fn new_instance(&mut self, classes: &ClassRegistry, class: ClassId) -> Result<Reference> {
        let runtime_class = classes.get(class);
        let super_instance = match runtime_class.super_class {
            Some(parent) => self.new_instance(classes, parent)?,
            None => Reference::NULL,
        };
        trace!("new {}", runtime_class.name);
        self.allocate(HeapObject {
            class,
            super_instance,
            array_kind: None,
            slots: vec![0; runtime_class.instance_slot_count()],
        })
    }

    pub fn object(&self, reference: Reference) -> Result<&HeapObject> {
        if reference.is_null() {
            return Err(RuntimeError::new(
                RuntimeErrorKind::NullPointer,
                "null reference",
            ));
        }
        self.objects
            .get(reference.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| RuntimeError::malformed(format!("dangling reference {reference}")))
    }

    fn object_mut(&mut self, reference: Reference) -> Result<&mut HeapObject> {
        self.object(reference)?;
        self.objects[reference.index()]
            .as_mut()
            .ok_or_else(|| RuntimeError::malformed(format!("dangling reference {reference}")))
    }

    pub fn class_of(&self, reference: Reference) -> Result<ClassId> {
        Ok(self.object(reference)?.class)
    }

    /// Walk the super instance chain of `reference` to the level owned by
    /// `class`.
    fn level(&self, reference: Reference, class: ClassId) -> Result<Reference> {
        let mut current = reference;
        loop {
            let object = self.object(current)?;
            if object.class == class {
                return Ok(current);
            }
            if object.super_instance.is_null() {
                return Err(RuntimeError::incompatible(format!(
                    "object {reference} has no level for class #{}",
                    class.0
                )));
            }
            current = object.super_instance;
        }
    }

    fn slot_error(reference: Reference, slot: usize) -> RuntimeError {
        RuntimeError::incompatible(format!("object {reference} has no slot {slot}"))
    }

    /// Read field slot `slot` declared by `class`.
    pub fn get_slot(&self, reference: Reference, class: ClassId, slot: usize) -> Result<Slot> {
        let level = self.level(reference, class)?;
        self.object(level)?
            .slots
            .get(slot)
            .copied()
            .ok_or_else(|| Self::slot_error(reference, slot))
    }

    pub fn set_slot(
        &mut self,
        reference: Reference,
        class: ClassId,
        slot: usize,
        value: Slot,
    ) -> Result<()> {
        let level = self.level(reference, class)?;
        let target = self
            .object_mut(level)?
            .slots
            .get_mut(slot)
            .ok_or_else(|| Self::slot_error(reference, slot))?;
        *target = value;
        Ok(())
    }

    pub fn get_wide(&self, reference: Reference, class: ClassId, slot: usize) -> Result<u64> {
        let high = self.get_slot(reference, class, slot)?;
        let low = self.get_slot(reference, class, slot + 1)?;
        Ok(join_wide(high, low))
    }

    pub fn set_wide(
        &mut self,
        reference: Reference,
        class: ClassId,
        slot: usize,
        value: u64,
    ) -> Result<()> {
        let (high, low) = split_wide(value);
        self.set_slot(reference, class, slot, high)?;
        self.set_slot(reference, class, slot + 1, low)
    }

    /// Allocate an array of the named array class (`[I`, `[Ljava/lang/String;`).
    pub fn new_array(
        &mut self,
        classes: &mut ClassRegistry,
        class_name: &str,
        count: i32,
    ) -> Result<Reference> {
        if count < 0 {
            return Err(RuntimeError::new(
                RuntimeErrorKind::NegativeArraySize,
                format!("negative array size {count}"),
            ));
        }
        let class = classes.get_class(class_name)?;
        let kind = classes.get(class).array_kind.ok_or_else(|| {
            RuntimeError::incompatible(format!("{class_name} is not an array class"))
        })?;
        let count = count as usize;
        let size = 1 + kind.data_slots(count);
        if size > MAX_OBJECT_SLOTS {
            return Err(out_of_memory(class_name, count));
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(size)
            .map_err(|_| out_of_memory(class_name, count))?;
        slots.resize(size, 0);
        slots[0] = count as Slot;
        let object = classes.get_class(OBJECT_CLASS)?;
        let super_instance = self.new_instance(classes, object)?;
        trace!("new {class_name} of {count} elements");
        self.allocate(HeapObject {
            class,
            super_instance,
            array_kind: Some(kind),
            slots,
        })
    }

    pub fn new_int_array(&mut self, classes: &mut ClassRegistry, count: i32) -> Result<Reference> {
        self.new_array(classes, "[I", count)
    }

    pub fn new_char_array(&mut self, classes: &mut ClassRegistry, count: i32) -> Result<Reference> {
        self.new_array(classes, "[C", count)
    }

    /// Array whose elements are references to `element` instances.
    pub fn new_reference_array(
        &mut self,
        classes: &mut ClassRegistry,
        element: ClassId,
        count: i32,
    ) -> Result<Reference> {
        let element = &classes.get(element).name;
        let name = if element.starts_with('[') {
            format!("[{element}")
        } else {
            format!("[L{element};")
        };
        self.new_array(classes, &name, count)
    }

    pub fn array_length(&self, reference: Reference) -> Result<usize> {
        let object = self.object(reference)?;
        if object.array_kind.is_none() {
            return Err(RuntimeError::incompatible(format!(
                "object {reference} is not an array"
            )));
        }
        Ok(object.slots[0] as usize)
    }

    /// Check the array kind and bounds, returning the element index.
    fn element(&self, reference: Reference, index: i32, expected: &[ArrayKind]) -> Result<usize> {
        let object = self.object(reference)?;
        match object.array_kind {
            Some(kind) if expected.contains(&kind) => {}
            other => {
                return Err(RuntimeError::malformed(format!(
                    "array access expecting {expected:?} on {other:?} object {reference}"
                )))
            }
        }
        let length = object.slots[0] as usize;
        if index < 0 || index as usize >= length {
            return Err(RuntimeError::new(
                RuntimeErrorKind::ArrayIndexOutOfBounds,
                format!("index {index} out of bounds for length {length}"),
            ));
        }
        Ok(index as usize)
    }

    const SINGLE: [ArrayKind; 3] = [ArrayKind::Int, ArrayKind::Float, ArrayKind::Reference];
    const WIDE: [ArrayKind; 2] = [ArrayKind::Long, ArrayKind::Double];
    const BYTES: [ArrayKind; 2] = [ArrayKind::Byte, ArrayKind::Boolean];

    /// Element of an int, float or reference array.
    pub fn load_element(&self, reference: Reference, index: i32) -> Result<Slot> {
        let i = self.element(reference, index, &Self::SINGLE)?;
        Ok(self.object(reference)?.slots[1 + i])
    }

    pub fn store_element(&mut self, reference: Reference, index: i32, value: Slot) -> Result<()> {
        let i = self.element(reference, index, &Self::SINGLE)?;
        self.object_mut(reference)?.slots[1 + i] = value;
        Ok(())
    }

    /// Element of a long or double array.
    pub fn load_wide_element(&self, reference: Reference, index: i32) -> Result<u64> {
        let i = self.element(reference, index, &Self::WIDE)?;
        let slots = &self.object(reference)?.slots;
        Ok(join_wide(slots[1 + 2 * i], slots[2 + 2 * i]))
    }

    pub fn store_wide_element(&mut self, reference: Reference, index: i32, value: u64) -> Result<()> {
        let i = self.element(reference, index, &Self::WIDE)?;
        let (high, low) = split_wide(value);
        let slots = &mut self.object_mut(reference)?.slots;
        slots[1 + 2 * i] = high;
        slots[2 + 2 * i] = low;
        Ok(())
    }

    /// Element of a byte or boolean array.
    pub fn load_byte(&self, reference: Reference, index: i32) -> Result<i8> {
        let i = self.element(reference, index, &Self::BYTES)?;
        let slot = self.object(reference)?.slots[1 + i / 4];
        Ok((slot >> (24 - 8 * (i % 4))) as u8 as i8)
    }

    pub fn store_byte(&mut self, reference: Reference, index: i32, value: i8) -> Result<()> {
        let i = self.element(reference, index, &Self::BYTES)?;
        let shift = 24 - 8 * (i % 4);
        let slot = &mut self.object_mut(reference)?.slots[1 + i / 4];
        *slot = (*slot & !(0xff << shift)) | ((value as u8 as Slot) << shift);
        Ok(())
    }

    fn load_half(&self, reference: Reference, index: i32, kind: ArrayKind) -> Result<u16> {
        let i = self.element(reference, index, &[kind])?;
        let slot = self.object(reference)?.slots[1 + i / 2];
        Ok((slot >> (16 - 16 * (i % 2))) as u16)
    }

    fn store_half(&mut self, reference: Reference, index: i32, kind: ArrayKind, value: u16) -> Result<()> {
        let i = self.element(reference, index, &[kind])?;
        let shift = 16 - 16 * (i % 2);
        let slot = &mut self.object_mut(reference)?.slots[1 + i / 2];
        *slot = (*slot & !(0xffff << shift)) | ((value as Slot) << shift);
        Ok(())
    }

    pub fn load_char(&self, reference: Reference, index: i32) -> Result<u16> {
        self.load_half(reference, index, ArrayKind::Char)
    }

    pub fn store_char(&mut self, reference: Reference, index: i32, value: u16) -> Result<()> {
        self.store_half(reference, index, ArrayKind::Char, value)
    }

    pub fn load_short(&self, reference: Reference, index: i32) -> Result<i16> {
        Ok(self.load_half(reference, index, ArrayKind::Short)? as i16)
    }

    pub fn store_short(&mut self, reference: Reference, index: i32, value: i16) -> Result<()> {
        self.store_half(reference, index, ArrayKind::Short, value as u16)
    }

    /// Create a `java/lang/String` whose `value` field holds the UTF-16
    /// code units of `text`.
    pub fn new_string(&mut self, classes: &mut ClassRegistry, text: &str) -> Result<Reference> {
        let string = classes.get_class(STRING_CLASS)?;
        let field = classes.resolve_field(string, "value", "[C").ok_or_else(|| {
            RuntimeError::resolution("java/lang/String has no value:[C field")
        })?;
        let units: Vec<u16> = text.encode_utf16().collect();
        let chars = self.new_char_array(classes, units.len() as i32)?;
        for (i, unit) in units.into_iter().enumerate() {
            self.store_char(chars, i as i32, unit)?;
        }
        let slot = classes.get(field.class).variable(&field).slot;
        let instance = self.new_instance(classes, string)?;
        self.set_slot(instance, field.class, slot, chars.to_slot())?;
        Ok(instance)
    }

    /// Read back the text of a `java/lang/String` instance.
    pub fn read_string(&self, classes: &ClassRegistry, reference: Reference) -> Result<String> {
        let string = classes
            .find(STRING_CLASS)
            .ok_or_else(|| RuntimeError::resolution("java/lang/String is not loaded"))?;
        let field = classes.resolve_field(string, "value", "[C").ok_or_else(|| {
            RuntimeError::resolution("java/lang/String has no value:[C field")
        })?;
        let slot = classes.get(field.class).variable(&field).slot;
        let chars = Reference::from_slot(self.get_slot(reference, field.class, slot)?);
        if chars.is_null() {
            return Ok(String::new());
        }
        let units = (0..self.array_length(chars)?)
            .map(|i| self.load_char(chars, i as i32))
            .collect::<Result<Vec<u16>>>()?;
        Ok(String::from_utf16_lossy(&units))
    }

    /// Whether one level of `reference`'s chain belongs to `class`. Null is
    /// an instance of nothing.
    pub fn is_instance_of(&self, reference: Reference, class: ClassId) -> Result<bool> {
        let mut current = reference;
        while !current.is_null() {
            let object = self.object(current)?;
            if object.class == class {
                return Ok(true);
            }
            current = object.super_instance;
        }
        Ok(false)
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            objects: self.objects.len() - 1,
            slots: self.allocated_slots,
            capacity: self.capacity,
        }
    }
}

impl Default for ObjectHeap {
    fn default() -> Self {
        Self::new()
    }
}
