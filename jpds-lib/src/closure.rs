use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::annotation::field_bits;
use crate::classfile::{Annotation, ClassDef, FieldDef, MethodDef};
use crate::classpath::ClassSource;
use crate::config::Config;
use crate::error::TranslateError;
use crate::ir::Category;
use crate::jvmtypes::args::{field_size, param_types, referenced_class};
use crate::GeneralResult;

/// Index of a class within its registry.
pub type ClassId = usize;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Interface,
    Array,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldEntry {
    pub name : String,
    /// the class that declares the field
    pub owner : String,
    pub descriptor : String,
    /// position in the object layout; `None` for static fields
    pub id : Option<u32>,
    pub category : Category,
    pub is_final : bool,
    pub constant_value : Option<i32>,
    pub bits : Option<u32>,
}

impl FieldEntry {
    fn declared(owner : &str, f : &FieldDef) -> GeneralResult<Self> {
        let ch = f.descriptor.chars().next().ok_or_else(|| TranslateError::Descriptor(f.descriptor.clone()))?;
        Ok(FieldEntry {
            name : f.name.clone(),
            owner : owner.to_owned(),
            descriptor : f.descriptor.clone(),
            id : None,
            category : Category::from_slots(field_size(ch)?),
            is_final : f.is_final,
            constant_value : f.constant_value,
            bits : field_bits(f),
        })
    }

    /// Name of the global or constant that backs a static field.
    pub fn global_name(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassEntry {
    pub id : u32,
    pub name : String,
    pub kind : ClassKind,
    pub superclass : Option<String>,
    pub interfaces : Vec<String>,
    /// declared instance fields, before layout
    pub declared_fields : Vec<FieldEntry>,
    /// the inherited-then-own layout, filled in by the hierarchy pass
    pub instance_fields : Vec<FieldEntry>,
    pub static_fields : Vec<FieldEntry>,
    pub methods : Vec<MethodDef>,
    pub annotations : Vec<Annotation>,
    pub subclasses : BTreeSet<ClassId>,
}

impl ClassEntry {
    fn array(id : u32, name : &str) -> Self {
        ClassEntry {
            id,
            name : name.to_owned(),
            kind : ClassKind::Array,
            superclass : Some("java/lang/Object".to_owned()),
            interfaces : Vec::new(),
            declared_fields : Vec::new(),
            instance_fields : Vec::new(),
            static_fields : Vec::new(),
            methods : Vec::new(),
            annotations : Vec::new(),
            subclasses : BTreeSet::new(),
        }
    }

    fn from_def(id : u32, def : ClassDef) -> GeneralResult<Self> {
        let mut declared_fields = Vec::new();
        let mut static_fields = Vec::new();
        for f in &def.fields {
            let entry = FieldEntry::declared(&def.name, f)?;
            if f.is_static {
                static_fields.push(entry);
            } else {
                declared_fields.push(entry);
            }
        }
        Ok(ClassEntry {
            id,
            kind : if def.is_interface { ClassKind::Interface } else { ClassKind::Class },
            name : def.name,
            superclass : def.super_name,
            interfaces : def.interfaces,
            declared_fields,
            instance_fields : Vec::new(),
            static_fields,
            methods : def.methods,
            annotations : def.annotations,
            subclasses : BTreeSet::new(),
        })
    }

    pub fn method(&self, name : &str, descriptor : &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn has_clinit(&self) -> bool {
        self.method("<clinit>", "()V").is_some()
    }

    /// Object size in heap cells, not counting the header.
    pub fn size(&self) -> u32 {
        self.instance_fields.len() as u32
    }
}

/// Every class of one closure, in discovery order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassRegistry {
    classes : Vec<ClassEntry>,
    by_name : BTreeMap<String, ClassId>,
    first_id : u32,
}

impl ClassRegistry {
    pub fn new(first_id : u32) -> Self {
        ClassRegistry { first_id, ..Default::default() }
    }

    fn next_id(&self) -> u32 {
        self.first_id + self.classes.len() as u32
    }

    fn add(&mut self, entry : ClassEntry) -> ClassId {
        let index = self.classes.len();
        self.by_name.insert(entry.name.clone(), index);
        self.classes.push(entry);
        index
    }

    pub fn contains(&self, name : &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn index_of(&self, name : &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, name : &str) -> Option<&ClassEntry> {
        self.index_of(name).map(|i| &self.classes[i])
    }

    pub fn entry(&self, index : ClassId) -> &ClassEntry {
        &self.classes[index]
    }

    pub(crate) fn entry_mut(&mut self, index : ClassId) -> &mut ClassEntry {
        &mut self.classes[index]
    }

    pub fn id_of(&self, name : &str) -> Option<u32> {
        self.get(name).map(|c| c.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassEntry> {
        self.classes.iter()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

struct Closure<'a> {
    config : &'a Config,
    source : &'a dyn ClassSource,
    registry : ClassRegistry,
}

impl Closure<'_> {
    fn load(&self, name : &str) -> GeneralResult<Option<ClassDef>> {
        if self.config.is_stub(name) {
            let stub = format!("{}{}", self.config.stub_prefix, name);
            let def = match self.source.load(&stub)? {
                Some(def) => def,
                None => self.source.load(name)?.ok_or(TranslateError::MissingClass(stub))?,
            };
            return Ok(Some(ClassDef { name : name.to_owned(), ..def }));
        }
        if self.config.is_ignored(name) {
            debug!(class = name, "class is ignored");
            return Ok(None);
        }
        match self.source.load(name)? {
            Some(def) => Ok(Some(def)),
            None => Err(TranslateError::MissingClass(name.to_owned()).into()),
        }
    }

    fn visit(&mut self, name : &str) -> GeneralResult<()> {
        if self.registry.contains(name) {
            return Ok(());
        }

        if let Some(element) = name.strip_prefix('[') {
            let id = self.registry.next_id();
            self.registry.add(ClassEntry::array(id, name));
            info!(class = name, id, "included array type");
            if let Some(inner) = referenced_class(element) {
                self.visit(&inner)?;
            }
            return self.visit("java/lang/Object");
        }

        let def = match self.load(name)? {
            Some(def) => def,
            None => return Ok(()),
        };

        let id = self.registry.next_id();
        let entry = ClassEntry::from_def(id, def)?;
        let index = self.registry.add(entry);
        info!(class = name, id, "included class");

        // the hierarchy comes before anything the methods mention
        let (interfaces, superclass) = {
            let e = self.registry.entry(index);
            (e.interfaces.clone(), e.superclass.clone())
        };
        for i in &interfaces {
            self.visit(i)?;
        }
        if let Some(s) = &superclass {
            self.visit(s)?;
        }

        let mut referenced = Vec::new();
        for m in &self.registry.entry(index).methods {
            for p in param_types(&m.descriptor)? {
                referenced.extend(referenced_class(&p));
            }
            if let Some(code) = &m.code {
                for (_, op) in &code.ops {
                    referenced.extend(op.referenced_classes());
                }
                referenced.extend(code.handlers.iter().filter_map(|h| h.catch_type.clone()));
            }
        }
        for r in &referenced {
            self.visit(r)?;
        }

        Ok(())
    }
}

/// Discovers every class reachable from `entry`, assigning ids in visit order.
pub fn include(config : &Config, source : &dyn ClassSource, entry : &str) -> GeneralResult<ClassRegistry> {
    let mut closure = Closure {
        config,
        source,
        registry : ClassRegistry::new(config.first_class_id()),
    };
    closure.visit(entry)?;
    info!(entry, classes = closure.registry.len(), "closure complete");
    Ok(closure.registry)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::classfile::*;
    use crate::jvmtypes::Operation;

    pub fn class(name : &str, super_name : Option<&str>) -> ClassDef {
        ClassDef {
            name : name.into(),
            super_name : super_name.map(Into::into),
            interfaces : vec![],
            is_interface : false,
            fields : vec![],
            methods : vec![],
            annotations : vec![],
        }
    }

    pub fn object() -> ClassDef {
        class("java/lang/Object", None)
    }

    pub fn interface(name : &str) -> ClassDef {
        ClassDef { is_interface : true, ..class(name, Some("java/lang/Object")) }
    }

    pub fn field(name : &str, descriptor : &str, is_static : bool) -> FieldDef {
        FieldDef {
            name : name.into(),
            descriptor : descriptor.into(),
            is_static,
            is_final : false,
            constant_value : None,
            annotations : vec![],
        }
    }

    pub fn method(name : &str, descriptor : &str, is_static : bool, ops : Vec<Operation>) -> MethodDef {
        let ops = ops.into_iter().enumerate().collect();
        MethodDef {
            name : name.into(),
            descriptor : descriptor.into(),
            is_static,
            is_synchronized : false,
            is_abstract : false,
            is_native : false,
            code : Some(MethodCode { max_stack : 4, max_locals : 4, ops, handlers : vec![], lines : vec![] }),
            annotations : vec![],
            param_names : vec![],
        }
    }

    pub fn abstract_method(name : &str, descriptor : &str) -> MethodDef {
        MethodDef { is_abstract : true, code : None, ..method(name, descriptor, false, vec![]) }
    }
}

#[cfg(test)]
use crate::classpath::MemorySource;
#[cfg(test)]
use crate::jvmtypes::{AllocationKind, Operation};

#[test]
fn test_discovery_order() -> GeneralResult<()> {
    use fixtures::*;
    let mut main = class("app/Main", Some("app/Base"));
    main.interfaces.push("app/Shape".into());
    main.methods.push(method("run", "(Lapp/Arg;)V", true, vec![
        Operation::Allocation(AllocationKind::Element { class : "app/Made".into() }),
        Operation::Allocation(AllocationKind::Array { class : "[[I".into(), dims : 2 }),
    ]));

    let mut source = MemorySource::new();
    source.insert(object())
        .insert(main)
        .insert(class("app/Base", Some("java/lang/Object")))
        .insert(interface("app/Shape"))
        .insert(class("app/Arg", Some("java/lang/Object")))
        .insert(class("app/Made", Some("java/lang/Object")));

    let reg = include(&Config::new(4, 15), &source, "app/Main")?;
    let names : Vec<_> = reg.iter().map(|c| (c.name.as_str(), c.id)).collect();
    assert_eq!(names, vec![
        ("app/Main", 1),
        ("app/Shape", 2),
        ("java/lang/Object", 3),
        ("app/Base", 4),
        ("app/Arg", 5),
        ("app/Made", 6),
        ("[[I", 7),
        ("[I", 8),
    ]);
    assert_eq!(reg.get("[I").map(|c| c.kind), Some(ClassKind::Array));
    assert_eq!(reg.get("app/Shape").map(|c| c.kind), Some(ClassKind::Interface));
    Ok(())
}

#[test]
fn test_ignored_and_stubbed_classes() -> GeneralResult<()> {
    use fixtures::*;
    let mut main = class("app/Main", Some("java/lang/Object"));
    main.methods.push(method("run", "()V", true, vec![
        Operation::Allocation(AllocationKind::Element { class : "sun/misc/Thing".into() }),
        Operation::Allocation(AllocationKind::Element { class : "java/lang/Integer".into() }),
    ]));

    let mut config = Config::new(4, 15);
    config.thread_bound = 2;
    let stub = format!("{}java/lang/Integer", config.stub_prefix);

    let mut source = MemorySource::new();
    source.insert(object()).insert(main).insert_as(&stub, class("java/lang/Integer", Some("java/lang/Object")));

    let reg = include(&config, &source, "app/Main")?;
    assert!(!reg.contains("sun/misc/Thing"));
    assert_eq!(reg.id_of("app/Main"), Some(2));
    assert_eq!(reg.id_of("java/lang/Integer"), Some(4));
    Ok(())
}

#[test]
fn test_missing_class_is_fatal() {
    use fixtures::*;
    let mut source = MemorySource::new();
    source.insert(object()).insert(class("app/Main", Some("app/Gone")));
    let err = include(&Config::new(4, 15), &source, "app/Main").err().map(|e| e.to_string());
    assert_eq!(err.as_deref(), Some("file for class app/Gone not found in any search path"));
}
