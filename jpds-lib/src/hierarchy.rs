use std::collections::BTreeSet;

use tracing::debug;

use crate::closure::{ClassEntry, ClassId, ClassKind, ClassRegistry, FieldEntry};
use crate::ir::IdSet;
use crate::jvmtypes::array_of;

/// Links subclasses and lays out instance fields over a finished closure.
pub fn resolve(registry : &mut ClassRegistry) {
    link_subclasses(registry);
    layout_fields(registry);
}

pub fn link_subclasses(registry : &mut ClassRegistry) {
    for i in 0..registry.len() {
        let parent = registry.entry(i).superclass.as_deref().and_then(|s| registry.index_of(s));
        if let Some(p) = parent {
            if p != i {
                registry.entry_mut(p).subclasses.insert(i);
            }
        }
    }
}

/// Copies every ancestor's declared fields ahead of a class's own and numbers
/// the result from 1, so an inherited field keeps its declaring class's id.
pub fn layout_fields(registry : &mut ClassRegistry) {
    for i in 0..registry.len() {
        let mut fields : Vec<FieldEntry> = Vec::new();
        for a in registry.ancestry(i) {
            for f in &registry.entry(a).declared_fields {
                let mut f = f.clone();
                f.id = Some(fields.len() as u32 + 1);
                fields.push(f);
            }
        }
        debug!(class = %registry.entry(i).name, fields = fields.len(), "laid out fields");
        registry.entry_mut(i).instance_fields = fields;
    }
}

impl ClassRegistry {
    /// The superclass chain, root first, ending with `index` itself. A
    /// superclass outside the closure ends the chain.
    pub fn ancestry(&self, index : ClassId) -> Vec<ClassId> {
        let mut chain = vec![ index ];
        let mut current = index;
        while let Some(p) = self.entry(current).superclass.as_deref().and_then(|s| self.index_of(s)) {
            if chain.contains(&p) {
                break;
            }
            chain.push(p);
            current = p;
        }
        chain.reverse();
        chain
    }

    /// `index` and every transitive subclass.
    pub fn descendants(&self, index : ClassId) -> BTreeSet<ClassId> {
        let mut out = BTreeSet::new();
        let mut work = vec![ index ];
        while let Some(i) = work.pop() {
            if out.insert(i) {
                work.extend(self.entry(i).subclasses.iter().copied());
            }
        }
        out
    }

    // the interface and every interface extending it
    fn subinterfaces(&self, index : ClassId) -> BTreeSet<ClassId> {
        let mut out = BTreeSet::new();
        out.insert(index);
        let mut changed = true;
        while changed {
            changed = false;
            for (i, c) in self.iter().enumerate() {
                if c.kind == ClassKind::Interface
                    && !out.contains(&i)
                    && c.interfaces.iter().any(|n| self.index_of(n).map_or(false, |j| out.contains(&j)))
                {
                    out.insert(i);
                    changed = true;
                }
            }
        }
        out
    }

    /// Every non-interface class implementing the interface, directly,
    /// through a subinterface, or by inheritance.
    pub fn implementers(&self, index : ClassId) -> BTreeSet<ClassId> {
        let interfaces = self.subinterfaces(index);
        let mut out = BTreeSet::new();
        for (i, c) in self.iter().enumerate() {
            if c.kind == ClassKind::Interface {
                continue;
            }
            if c.interfaces.iter().any(|n| self.index_of(n).map_or(false, |j| interfaces.contains(&j))) {
                out.extend(self.descendants(i));
            }
        }
        out
    }

    /// Runtime classes an instance of `index` may belong to.
    pub fn members(&self, index : ClassId) -> BTreeSet<ClassId> {
        match self.entry(index).kind {
            ClassKind::Interface => self.implementers(index),
            _ => self.descendants(index),
        }
    }

    fn castable_indices(&self, name : &str) -> BTreeSet<ClassId> {
        let index = match self.index_of(name) {
            Some(i) => i,
            None => return BTreeSet::new(),
        };
        let mut out = self.members(index);
        if let Some(element) = name.strip_prefix('[') {
            let inner = match element.strip_prefix('L').and_then(|e| e.strip_suffix(';')) {
                Some(class) => Some(class.to_owned()),
                None if element.starts_with('[') => Some(element.to_owned()),
                None => None,
            };
            if let Some(inner) = inner {
                for e in self.castable_indices(&inner) {
                    if let Some(a) = self.index_of(&array_of(&self.entry(e).name)) {
                        out.insert(a);
                    }
                }
            }
        }
        out
    }

    /// Ids of every class whose instances may be cast to `name`. Empty when
    /// `name` is outside the closure.
    pub fn castable_ids(&self, name : &str) -> IdSet {
        self.castable_indices(name).into_iter().map(|i| self.entry(i).id).collect()
    }

    /// The class providing the body of a method for receivers of class
    /// `index`: the class itself or its nearest ancestor with code.
    pub fn find_method_owner(&self, index : ClassId, name : &str, descriptor : &str) -> Option<ClassId> {
        self.ancestry(index).into_iter().rev().find(|&a| {
            self.entry(a).method(name, descriptor).map_or(false, |m| m.code.is_some())
        })
    }

    /// The class declaring the instance field `name` as seen from `index`.
    pub fn field_owner(&self, index : ClassId, name : &str) -> Option<ClassId> {
        self.ancestry(index).into_iter().rev().find(|&a| {
            self.entry(a).declared_fields.iter().any(|f| f.name == name)
        })
    }

    /// The laid-out entry of field `owner.name` within class `index`.
    pub fn instance_field<'a>(&'a self, index : ClassId, owner : &str, name : &str) -> Option<&'a FieldEntry> {
        self.entry(index).instance_fields.iter().find(|f| f.owner == owner && f.name == name)
    }

    /// Resolves a static field through superclasses and interfaces.
    pub fn static_field(&self, class : &str, name : &str) -> Option<&FieldEntry> {
        let mut seen = BTreeSet::new();
        let mut work = vec![ class.to_owned() ];
        while let Some(c) = work.pop() {
            let entry : &ClassEntry = match self.get(&c) {
                Some(e) => e,
                None => continue,
            };
            if !seen.insert(c) {
                continue;
            }
            if let Some(f) = entry.static_fields.iter().find(|f| f.name == name) {
                return Some(f);
            }
            work.extend(entry.interfaces.iter().rev().cloned());
            work.extend(entry.superclass.clone());
        }
        None
    }
}

#[cfg(test)]
use crate::classpath::MemorySource;
#[cfg(test)]
use crate::closure::{fixtures::*, include};
#[cfg(test)]
use crate::config::Config;
#[cfg(test)]
use crate::ir::id_set;
#[cfg(test)]
use crate::GeneralResult;
#[cfg(test)]
use quickcheck::{quickcheck, TestResult};

#[cfg(test)]
fn shapes() -> GeneralResult<ClassRegistry> {
    use crate::jvmtypes::{AllocationKind, Operation};

    let mut a = class("A", Some("java/lang/Object"));
    a.fields.push(field("x", "I", false));
    a.fields.push(field("count", "I", true));
    a.methods.push(method("main", "()V", true, vec![
        Operation::Allocation(AllocationKind::Element { class : "B".into() }),
        Operation::Allocation(AllocationKind::Element { class : "C".into() }),
        Operation::Allocation(AllocationKind::Array { class : "[LA;".into(), dims : 1 }),
        Operation::Allocation(AllocationKind::Array { class : "[LB;".into(), dims : 1 }),
    ]));
    let mut b = class("B", Some("A"));
    b.fields.push(field("y", "J", false));
    b.interfaces.push("I".into());
    let mut c = class("C", Some("B"));
    c.fields.push(field("z", "I", false));

    let mut source = MemorySource::new();
    source.insert(object()).insert(a).insert(b).insert(c).insert(interface("I"));
    let mut reg = include(&Config::new(4, 15), &source, "A")?;
    resolve(&mut reg);
    Ok(reg)
}

#[test]
fn test_field_layout_is_inherited() -> GeneralResult<()> {
    let reg = shapes()?;
    let ids = |class : &str| -> Vec<(String, Option<u32>)> {
        reg.get(class).map_or(vec![], |c| c.instance_fields.iter().map(|f| (f.global_name(), f.id)).collect())
    };
    assert_eq!(ids("A"), vec![ ("A.x".to_owned(), Some(1)) ]);
    assert_eq!(ids("B"), vec![ ("A.x".to_owned(), Some(1)), ("B.y".to_owned(), Some(2)) ]);
    assert_eq!(ids("C"), vec![
        ("A.x".to_owned(), Some(1)),
        ("B.y".to_owned(), Some(2)),
        ("C.z".to_owned(), Some(3)),
    ]);
    assert_eq!(reg.get("C").map(ClassEntry::size), Some(3));
    assert!(reg.get("C").map_or(false, |c| c.static_fields.is_empty()));
    assert_eq!(reg.static_field("C", "count").map(FieldEntry::global_name).as_deref(), Some("A.count"));
    Ok(())
}

#[test]
fn test_castable_sets() -> GeneralResult<()> {
    let reg = shapes()?;
    let id = |n : &str| reg.id_of(n).unwrap_or(0);
    assert_eq!(reg.castable_ids("B"), id_set(vec![ id("B"), id("C") ]));
    assert_eq!(reg.castable_ids("I"), id_set(vec![ id("B"), id("C") ]));
    assert_eq!(reg.castable_ids("[LA;"), id_set(vec![ id("[LA;"), id("[LB;") ]));
    assert!(reg.castable_ids("Nowhere").is_empty());
    Ok(())
}

#[test]
fn test_method_owner_walks_up() -> GeneralResult<()> {
    let reg = shapes()?;
    let (a, c) = (reg.index_of("A"), reg.index_of("C"));
    assert_eq!(c.and_then(|c| reg.find_method_owner(c, "main", "()V")), a);
    assert_eq!(c.and_then(|c| reg.find_method_owner(c, "other", "()V")), None);
    assert_eq!(c.and_then(|c| reg.field_owner(c, "y")), reg.index_of("B"));
    Ok(())
}

#[cfg(test)]
quickcheck! {
    // builds a random single-inheritance chain forest and checks that every
    // inherited field keeps its ancestor's id
    fn prop_field_ids_are_stable(parents : Vec<u8>) -> TestResult {
        let parents = &parents[..parents.len().min(12)];
        let mut source = MemorySource::new();
        source.insert(object());
        let mut root = class("K0", Some("java/lang/Object"));
        root.fields.push(field("f", "I", false));
        let mut all = vec![ root ];
        for (i, p) in parents.iter().enumerate() {
            let parent = format!("K{}", usize::from(*p) % (i + 1));
            let mut k = class(&format!("K{}", i + 1), Some(&parent));
            k.fields.push(field("f", "I", false));
            all.push(k);
        }
        let mut entry = all[0].clone();
        entry.methods.push(method("main", "()V", true, (1..all.len()).map(|i| {
            crate::jvmtypes::Operation::InstanceOf { class : format!("K{}", i) }
        }).collect()));
        all[0] = entry;
        for k in all {
            source.insert(k);
        }
        let mut reg = match include(&Config::new(4, 15), &source, "K0") {
            Ok(r) => r,
            Err(_) => return TestResult::failed(),
        };
        resolve(&mut reg);
        let ok = reg.iter().enumerate().all(|(i, c)| {
            reg.ancestry(i).into_iter().all(|a| {
                let owner = &reg.entry(a).name;
                let theirs = reg.instance_field(a, owner, "f").and_then(|f| f.id);
                let ours = reg.instance_field(i, owner, "f").and_then(|f| f.id);
                c.kind != ClassKind::Class || theirs.is_none() || theirs == ours
            })
        });
        TestResult::from_bool(ok)
    }
}
