//! Method area: the registry of loaded classes and symbolic resolution.
//!
//! Classes are loaded on demand through a `ClassSource` and live for the
//! whole run. Each is identified by a `ClassId` handle; asking for the same
//! name twice returns the same handle.
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::PathBuf;
use std::rc::Rc;

use log::{debug, trace};

use crate::class::{ClassId, FieldRef, MethodRef, RuntimeClass};
use crate::jvm::{read_class_file, JVMParser};
use crate::program::ArrayKind;
use crate::runtime::{Result, RuntimeError};

pub const OBJECT_CLASS: &str = "java/lang/Object";
pub const STRING_CLASS: &str = "java/lang/String";
/// Interfaces every array class implements.
const ARRAY_INTERFACES: [&str; 2] = ["java/lang/Cloneable", "java/io/Serializable"];

/// Provider of raw class file bytes, keyed by internal class name
/// (`java/lang/Object`).
pub trait ClassSource {
    fn load(&self, name: &str) -> Result<Vec<u8>>;
}

/// Directory based class lookup.
#[derive(Debug, Clone)]
pub struct Classpath {
    roots: Vec<PathBuf>,
}

impl Classpath {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Build a classpath from a list separated by the platform delimiter.
    pub fn parse(path_list: &str) -> Self {
        Self::new(env::split_paths(path_list).collect())
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

impl ClassSource for Classpath {
    fn load(&self, name: &str) -> Result<Vec<u8>> {
        let relative = format!("{}.class", name.replace('.', "/"));
        for root in &self.roots {
            let path = root.join(&relative);
            if path.is_file() {
                debug!("reading {}", path.display());
                return read_class_file(&path);
            }
        }
        Err(RuntimeError::resolution(format!(
            "class {name} not found on classpath"
        )))
    }
}

/// `ClassRegistry` owns every loaded class.
pub struct ClassRegistry {
    source: Box<dyn ClassSource>,
    classes: Vec<Rc<RuntimeClass>>,
    by_name: HashMap<String, ClassId>,
    loading: HashSet<String>,
}

impl ClassRegistry {
    pub fn new(source: Box<dyn ClassSource>) -> Self {
        Self {
            source,
            classes: Vec::new(),
            by_name: HashMap::new(),
            loading: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Returns a shared handle on a loaded class.
    pub fn class(&self, id: ClassId) -> Rc<RuntimeClass> {
        Rc::clone(&self.classes[id.index()])
    }

    pub fn get(&self, id: ClassId) -> &RuntimeClass {
        &self.classes[id.index()]
    }

    pub fn find(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    /// Return the class named `name`, loading it (and its ancestors) first
    /// if needed.
    pub fn get_class(&mut self, name: &str) -> Result<ClassId> {
        if let Some(id) = self.find(name) {
            return Ok(id);
        }
        if name.starts_with('[') {
            return self.define_array(name);
        }
        self.load_class(name)
    }

    fn load_class(&mut self, name: &str) -> Result<ClassId> {
        if !self.loading.insert(name.to_string()) {
            return Err(RuntimeError::resolution(format!(
                "class circularity while loading {name}"
            )));
        }
        let result = self.read_and_link(name);
        self.loading.remove(name);
        result
    }

    fn read_and_link(&mut self, name: &str) -> Result<ClassId> {
        debug!("loading class {name}");
        let bytes = self.source.load(name)?;
        let file = JVMParser::parse(&bytes)?;
        let actual = file.name()?;
        if actual != name {
            return Err(RuntimeError::resolution(format!(
                "class file for {name} defines {actual}"
            )));
        }
        let super_class = match file.super_name()? {
            Some(super_name) => Some(self.get_class(super_name)?),
            None => None,
        };
        let id = self.next_id();
        let class = RuntimeClass::link(id, &file, super_class)?;
        Ok(self.insert(class))
    }

    fn define_array(&mut self, name: &str) -> Result<ClassId> {
        let kind = ArrayKind::from_class_name(name).ok_or_else(|| {
            RuntimeError::resolution(format!("invalid array class name {name}"))
        })?;
        let object = self.get_class(OBJECT_CLASS)?;
        debug!("defining array class {name}");
        let id = self.next_id();
        Ok(self.insert(RuntimeClass::array(id, name, object, kind)))
    }

    fn next_id(&self) -> ClassId {
        ClassId(self.classes.len() as u32)
    }

    fn insert(&mut self, class: RuntimeClass) -> ClassId {
        let id = class.id;
        self.by_name.insert(class.name.clone(), id);
        self.classes.push(Rc::new(class));
        id
    }

    /// Resolve the Class entry `index` of class `from`.
    pub fn resolve_class(&mut self, from: ClassId, index: u16) -> Result<ClassId> {
        let class = self.class(from);
        let cache = class.class_cache(index)?;
        if let Some(id) = cache.get() {
            return Ok(*id);
        }
        let id = self.get_class(class.class_name_at(index)?)?;
        let _ = cache.set(id);
        Ok(id)
    }

    /// Resolve the Methodref entry `index` of class `from`.
    pub fn resolve_method_ref(&mut self, from: ClassId, index: u16) -> Result<MethodRef> {
        let class = self.class(from);
        let cache = class.method_cache(index)?;
        if let Some(method) = cache.get() {
            return Ok(*method);
        }
        let (class_index, name, descriptor) = class.member_ref(index)?;
        let owner = self.resolve_class(from, class_index)?;
        let method = self
            .resolve_method(owner, name, descriptor)
            .ok_or_else(|| self.no_such_method(owner, name, descriptor))?;
        trace!(
            "{}: resolved {name}{descriptor} in {}",
            class.name,
            self.get(method.class).name
        );
        let _ = cache.set(method);
        Ok(method)
    }

    /// Resolve the InterfaceMethodref entry `index` of class `from`. The
    /// referenced class must be an interface.
    pub fn resolve_interface_method_ref(
        &mut self,
        from: ClassId,
        index: u16,
    ) -> Result<MethodRef> {
        let class = self.class(from);
        let cache = class.interface_method_cache(index)?;
        if let Some(method) = cache.get() {
            return Ok(*method);
        }
        let (class_index, name, descriptor) = class.member_ref(index)?;
        let owner = self.resolve_class(from, class_index)?;
        if !self.get(owner).is_interface() {
            return Err(RuntimeError::incompatible(format!(
                "{} is not an interface",
                self.get(owner).name
            )));
        }
        let method = self
            .resolve_interface_method(owner, name, descriptor)?
            .ok_or_else(|| self.no_such_method(owner, name, descriptor))?;
        let _ = cache.set(method);
        Ok(method)
    }

    /// Resolve the Fieldref entry `index` of class `from`.
    pub fn resolve_field_ref(&mut self, from: ClassId, index: u16) -> Result<FieldRef> {
        let class = self.class(from);
        let cache = class.field_cache(index)?;
        if let Some(field) = cache.get() {
            return Ok(*field);
        }
        let (class_index, name, descriptor) = class.member_ref(index)?;
        let owner = self.resolve_class(from, class_index)?;
        let field = self.lookup_field(owner, name, descriptor)?.ok_or_else(|| {
            RuntimeError::resolution(format!(
                "no field {}.{name}:{descriptor}",
                self.get(owner).name
            ))
        })?;
        let _ = cache.set(field);
        Ok(field)
    }

    fn no_such_method(&self, owner: ClassId, name: &str, descriptor: &str) -> RuntimeError {
        RuntimeError::resolution(format!(
            "no method {}.{name}{descriptor}",
            self.get(owner).name
        ))
    }

    /// Find a method by name and descriptor, starting at `start` and
    /// walking up the super classes.
    pub fn resolve_method(&self, start: ClassId, name: &str, descriptor: &str) -> Option<MethodRef> {
        let mut current = Some(start);
        while let Some(id) = current {
            let class = self.get(id);
            if let Some(index) = class.find_method(name, descriptor) {
                return Some(MethodRef { class: id, index });
            }
            current = class.super_class;
        }
        None
    }

    /// Method lookup through an interface, its super interfaces and finally
    /// `java/lang/Object`.
    pub fn resolve_interface_method(
        &mut self,
        interface: ClassId,
        name: &str,
        descriptor: &str,
    ) -> Result<Option<MethodRef>> {
        let class = self.class(interface);
        if let Some(index) = class.find_method(name, descriptor) {
            return Ok(Some(MethodRef {
                class: interface,
                index,
            }));
        }
        for &index in &class.interfaces {
            let parent = self.resolve_class(interface, index)?;
            if let Some(method) = self.resolve_interface_method(parent, name, descriptor)? {
                return Ok(Some(method));
            }
        }
        Ok(class
            .super_class
            .and_then(|object| self.resolve_method(object, name, descriptor)))
    }

    /// Find an instance field, walking up the super classes. The result
    /// names the declaring class.
    pub fn resolve_field(&self, start: ClassId, name: &str, descriptor: &str) -> Option<FieldRef> {
        let mut current = Some(start);
        while let Some(id) = current {
            let class = self.get(id);
            if let Some(index) = class.find_instance_variable(name, descriptor) {
                return Some(FieldRef {
                    class: id,
                    index,
                    is_static: false,
                });
            }
            current = class.super_class;
        }
        None
    }

    /// Find a static field in `start`, its interfaces or its ancestors.
    pub fn resolve_static_field(
        &mut self,
        start: ClassId,
        name: &str,
        descriptor: &str,
    ) -> Result<Option<FieldRef>> {
        let mut current = Some(start);
        while let Some(id) = current {
            let class = self.class(id);
            if let Some(index) = class.find_static_variable(name, descriptor) {
                return Ok(Some(FieldRef {
                    class: id,
                    index,
                    is_static: true,
                }));
            }
            for &index in &class.interfaces {
                let interface = self.resolve_class(id, index)?;
                if let Some(field) = self.resolve_static_field(interface, name, descriptor)? {
                    return Ok(Some(field));
                }
            }
            current = class.super_class;
        }
        Ok(None)
    }

    /// Field lookup regardless of the static modifier; the caller checks it
    /// against the instruction used.
    fn lookup_field(
        &mut self,
        start: ClassId,
        name: &str,
        descriptor: &str,
    ) -> Result<Option<FieldRef>> {
        if let Some(field) = self.resolve_field(start, name, descriptor) {
            return Ok(Some(field));
        }
        self.resolve_static_field(start, name, descriptor)
    }

    /// Whether `ancestor` is `class` itself or one of its super classes.
    pub fn is_subclass_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.get(id).super_class;
        }
        false
    }

    /// Whether `class` or any of its ancestors implements `interface`,
    /// directly or through a super interface.
    pub fn implements_interface(&mut self, class: ClassId, interface: ClassId) -> Result<bool> {
        let mut current = Some(class);
        while let Some(id) = current {
            let runtime_class = self.class(id);
            for &index in &runtime_class.interfaces {
                let direct = self.resolve_class(id, index)?;
                if direct == interface || self.implements_interface(direct, interface)? {
                    return Ok(true);
                }
            }
            current = runtime_class.super_class;
        }
        Ok(false)
    }

    /// Whether a value of class `from` can be used where `to` is expected.
    pub fn is_assignable(&mut self, from: ClassId, to: ClassId) -> Result<bool> {
        if from == to {
            return Ok(true);
        }
        let target = self.class(to);
        let source = self.class(from);
        if source.is_array() && ARRAY_INTERFACES.contains(&target.name.as_str()) {
            return Ok(true);
        }
        if target.is_interface() {
            return self.implements_interface(from, to);
        }
        if source.is_array() && target.is_array() {
            return match (element_class(&source.name), element_class(&target.name)) {
                (Some(from_element), Some(to_element)) => {
                    let from_element = self.get_class(from_element)?;
                    let to_element = self.get_class(to_element)?;
                    self.is_assignable(from_element, to_element)
                }
                _ => Ok(false),
            };
        }
        Ok(self.is_subclass_of(from, to))
    }
}

/// Element class name of a reference array class, `None` for primitive
/// arrays.
fn element_class(array_name: &str) -> Option<&str> {
    let element = array_name.strip_prefix('[')?;
    if element.starts_with('[') {
        Some(element)
    } else {
        element.strip_prefix('L')?.strip_suffix(';')
    }
}
