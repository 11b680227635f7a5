use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::classfile::Handler;
use crate::closure::{ClassId, ClassKind, ClassRegistry};
use crate::ir::{Condition, IdSet};

/// One implementation a call site may reach, and the receiver ids that
/// reach it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallTarget {
    pub owner : ClassId,
    pub ids : IdSet,
}

/// Groups every runtime class of `index` by the class whose body it runs.
/// Receivers with no body anywhere up their chain are dropped; an empty
/// result means the call cannot be dispatched inside the closure.
pub fn virtual_targets(registry : &ClassRegistry, index : ClassId, name : &str, descriptor : &str) -> Vec<CallTarget> {
    let mut by_owner : BTreeMap<ClassId, IdSet> = BTreeMap::new();
    for m in registry.members(index) {
        let member = registry.entry(m);
        if member.kind == ClassKind::Interface {
            continue;
        }
        if let Some(owner) = registry.find_method_owner(m, name, descriptor) {
            by_owner.entry(owner).or_default().insert(member.id);
        }
    }
    debug!(class = %registry.entry(index).name, method = name, targets = by_owner.len(), "resolved virtual call");
    by_owner.into_iter().map(|(owner, ids)| CallTarget { owner, ids }).collect()
}

/// Classes whose `run()V` a `Runnable.run` call site starts as a thread,
/// as (receiver id, class declaring `run`) pairs.
pub fn runnable_targets(registry : &ClassRegistry) -> Vec<(u32, ClassId)> {
    let mut out : BTreeMap<u32, ClassId> = BTreeMap::new();
    if let Some(thread) = registry.index_of("java/lang/Thread") {
        for s in registry.descendants(thread) {
            if registry.entry(s).method("run", "()V").map_or(false, |m| m.code.is_some()) {
                out.insert(registry.entry(s).id, s);
            }
        }
    }
    if let Some(runnable) = registry.index_of("java/lang/Runnable") {
        for i in registry.implementers(runnable) {
            if let Some(owner) = registry.find_method_owner(i, "run", "()V") {
                out.insert(registry.entry(i).id, owner);
            }
        }
    }
    out.into_iter().collect()
}

/// Every runtime class that may hold field `owner.name` when the static type
/// is `index`, with the field's layout id in each.
pub fn field_members(registry : &ClassRegistry, index : ClassId, owner : &str, name : &str) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    for m in registry.members(index) {
        if registry.entry(m).kind != ClassKind::Class {
            continue;
        }
        if let Some(id) = registry.instance_field(m, owner, name).and_then(|f| f.id) {
            out.push((registry.entry(m).id, id));
        }
    }
    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Catch {
    /// enter the handler at this offset
    Handler { target : usize, cond : Condition },
    /// leave the method with the exception pending
    Propagate(Condition),
}

/// Routes an exception raised at `offset` through the covering handlers in
/// table order. Each handler claims the ids it can catch that no earlier
/// handler claimed; whatever remains, except null, propagates.
pub fn exception_dispatch(registry : &ClassRegistry, handlers : &[Handler], offset : usize) -> Vec<Catch> {
    let mut handled : IdSet = BTreeSet::new();
    let mut out = Vec::new();
    for h in handlers.iter().filter(|h| h.covers(offset)) {
        match &h.catch_type {
            None => {
                let mut rest = handled.clone();
                rest.insert(0);
                out.push(Catch::Handler { target : h.target, cond : Condition::NotContains(rest) });
                return out;
            },
            Some(t) => {
                let candidates : IdSet = registry.castable_ids(t).difference(&handled).copied().collect();
                if candidates.is_empty() {
                    continue;
                }
                handled.extend(candidates.iter().copied());
                out.push(Catch::Handler { target : h.target, cond : Condition::Contains(candidates) });
            },
        }
    }
    handled.insert(0);
    out.push(Catch::Propagate(Condition::NotContains(handled)));
    out
}

#[cfg(test)]
use crate::classpath::MemorySource;
#[cfg(test)]
use crate::closure::{fixtures::*, include};
#[cfg(test)]
use crate::config::Config;
#[cfg(test)]
use crate::hierarchy::resolve;
#[cfg(test)]
use crate::ir::id_set;
#[cfg(test)]
use crate::jvmtypes::{AllocationKind, Operation};
#[cfg(test)]
use crate::GeneralResult;

#[cfg(test)]
fn zoo() -> GeneralResult<ClassRegistry> {
    let news = |names : &[&str]| -> Vec<Operation> {
        names.iter().map(|&n| Operation::Allocation(AllocationKind::Element { class : n.into() })).collect()
    };
    let mut animal = class("Animal", Some("java/lang/Object"));
    animal.methods.push(method("speak", "()I", false, vec![]));
    animal.methods.push(method("main", "()V", true, news(&[ "Dog", "Puppy", "Cat", "Bird" ])));
    let mut dog = class("Dog", Some("Animal"));
    dog.methods.push(method("speak", "()I", false, vec![]));
    let puppy = class("Puppy", Some("Dog"));
    let cat = class("Cat", Some("Animal"));
    let mut bird = class("Bird", Some("java/lang/Object"));
    bird.interfaces.push("Flyer".into());
    let mut flyer = interface("Flyer");
    flyer.methods.push(abstract_method("fly", "()V"));

    let mut source = MemorySource::new();
    source.insert(object()).insert(animal).insert(dog).insert(puppy).insert(cat).insert(bird).insert(flyer);
    let mut reg = include(&Config::new(4, 15), &source, "Animal")?;
    resolve(&mut reg);
    Ok(reg)
}

#[test]
fn test_virtual_targets_cover_every_receiver() -> GeneralResult<()> {
    let reg = zoo()?;
    let index = |n : &str| reg.index_of(n).ok_or("missing class");
    let id = |n : &str| reg.id_of(n).unwrap_or(0);

    let targets = virtual_targets(&reg, index("Animal")?, "speak", "()I");
    assert_eq!(targets, vec![
        CallTarget { owner : index("Animal")?, ids : id_set(vec![ id("Animal"), id("Cat") ]) },
        CallTarget { owner : index("Dog")?, ids : id_set(vec![ id("Dog"), id("Puppy") ]) },
    ]);
    let union : IdSet = targets.iter().flat_map(|t| t.ids.iter().copied()).collect();
    let members : IdSet = reg.members(index("Animal")?).into_iter().map(|m| reg.entry(m).id).collect();
    assert_eq!(union, members);

    let single = virtual_targets(&reg, index("Puppy")?, "speak", "()I");
    assert_eq!(single.len(), 1);

    // the interface method has no body anywhere
    assert!(virtual_targets(&reg, index("Flyer")?, "fly", "()V").is_empty());
    Ok(())
}

#[test]
fn test_exception_dispatch() -> GeneralResult<()> {
    let reg = zoo()?;
    let id = |n : &str| reg.id_of(n).unwrap_or(0);
    let handlers = vec![
        Handler { start : 0, end : 10, target : 20, catch_type : Some("Dog".into()) },
        Handler { start : 0, end : 10, target : 30, catch_type : Some("Animal".into()) },
        Handler { start : 0, end : 10, target : 40, catch_type : Some("Puppy".into()) },
        Handler { start : 5, end : 10, target : 50, catch_type : None },
    ];

    let early = exception_dispatch(&reg, &handlers, 2);
    assert_eq!(early, vec![
        Catch::Handler { target : 20, cond : Condition::Contains(id_set(vec![ id("Dog"), id("Puppy") ])) },
        Catch::Handler { target : 30, cond : Condition::Contains(id_set(vec![ id("Animal"), id("Cat") ])) },
        Catch::Propagate(Condition::NotContains(id_set(vec![ 0, id("Animal"), id("Dog"), id("Puppy"), id("Cat") ]))),
    ]);

    let late = exception_dispatch(&reg, &handlers, 7);
    assert_eq!(late.len(), 3);
    assert!(matches!(late.last(), Some(Catch::Handler { target : 50, .. })));

    let outside = exception_dispatch(&reg, &handlers, 12);
    assert_eq!(outside, vec![ Catch::Propagate(Condition::NotContains(id_set(vec![ 0 ]))) ]);
    Ok(())
}

#[test]
fn test_field_members() -> GeneralResult<()> {
    let mut base = class("Base", Some("java/lang/Object"));
    base.fields.push(field("v", "I", false));
    base.methods.push(method("main", "()V", true, vec![
        Operation::Allocation(AllocationKind::Element { class : "Derived".into() }),
    ]));
    let mut derived = class("Derived", Some("Base"));
    derived.fields.push(field("w", "I", false));

    let mut source = MemorySource::new();
    source.insert(object()).insert(base).insert(derived);
    let mut reg = include(&Config::new(4, 15), &source, "Base")?;
    resolve(&mut reg);

    let base = reg.index_of("Base").ok_or("missing class")?;
    let got = field_members(&reg, base, "Base", "v");
    assert_eq!(got, vec![ (reg.id_of("Base").unwrap_or(0), 1), (reg.id_of("Derived").unwrap_or(0), 1) ]);
    Ok(())
}
