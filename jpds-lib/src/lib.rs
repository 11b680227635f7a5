#![deny(clippy::items_after_statements)]
#![deny(clippy::needless_borrow)]
#![deny(clippy::option_unwrap_used)]
#![deny(clippy::redundant_field_names)]
#![deny(clippy::result_unwrap_used)]
#![deny(unconditional_recursion)]

pub mod annotation;
pub mod classfile;
pub mod classpath;
pub mod closure;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hierarchy;
pub mod ir;
pub mod jvmtypes;
pub mod label;
pub mod translate;
pub mod wrapper;

use std::error::Error;

use tracing::info;

use annotation::ClassAnnotations;
use classpath::ClassSource;
use closure::ClassRegistry;
use ir::{Program, VarType, Variable};
use translate::{Translator, EXCEPTION};

pub use config::{Config, WrapMode};
pub use error::TranslateError;

pub type GeneralResult<T> = std::result::Result<T, Box<dyn Error>>;

fn generic_error(e : impl Error) -> Box<dyn Error> {
    format!("unknown error: {}", e).into()
}

/// A method named as `pkg/Class.method(descriptor)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryPoint {
    pub class : String,
    pub method : String,
    pub descriptor : String,
}

pub fn parse_entry(entry : &str) -> GeneralResult<EntryPoint> {
    let bad = || TranslateError::Config(format!("expected an entry of the form pkg/Class.method(descriptor), got {}", entry));
    let open = entry.find('(').ok_or_else(bad)?;
    let (qualified, descriptor) = entry.split_at(open);
    let dot = qualified.rfind('.').ok_or_else(bad)?;
    let (class, method) = (&qualified[..dot], &qualified[dot + 1..]);
    if class.is_empty() || method.is_empty() || !descriptor.contains(')') {
        return Err(bad().into());
    }
    Ok(EntryPoint { class : class.to_owned(), method : method.to_owned(), descriptor : descriptor.to_owned() })
}

/// Every heap cell holds a full-width int, except the cells the entry
/// harness's fixed-length arrays occupy, which start at cell 1.
fn initial_heap(config : &Config, estimate : Option<Vec<u64>>) -> GeneralResult<Vec<u64>> {
    let mut heap = vec![ 1_u64 << config.bits; config.heap_size ];
    if let Some(sizes) = estimate {
        let needed = sizes.len() + 2;
        if config.heap_size < needed {
            return Err(TranslateError::HeapTooSmall(needed).into());
        }
        heap[1..=sizes.len()].copy_from_slice(&sizes);
    }
    Ok(heap)
}

fn globals(config : &Config, registry : &ClassRegistry) -> Vec<Variable> {
    let int = |name : String, bits| Variable { name, ty : VarType::Int(bits) };
    let flag = |name : String| Variable { name, ty : VarType::Bool };

    let mut out = vec![ int(EXCEPTION.to_owned(), config.bits) ];
    for c in registry.iter() {
        // set once the class's static initializer has run
        if c.has_clinit() {
            out.push(flag(c.name.clone()));
        }
        for f in c.static_fields.iter().filter(|f| !f.is_final) {
            if f.name.ends_with("$assertionsDisabled") {
                out.push(flag(f.global_name()));
            } else {
                out.push(int(f.global_name(), f.bits.unwrap_or(config.bits)));
            }
        }
    }
    if config.multithreading() {
        for i in 1..=config.thread_bound {
            out.push(int(format!("save{}", i), config.bits));
            out.push(flag(format!("waitflag{}", i)));
            out.push(int(format!("waitfor{}", i), config.bits));
        }
    }
    out
}

fn constants(registry : &ClassRegistry) -> Vec<(String, i32)> {
    registry.iter()
        .flat_map(|c| c.static_fields.iter())
        .filter(|f| f.is_final)
        .map(|f| (f.global_name(), f.constant_value.unwrap_or(0)))
        .collect()
}

/// Translates the closure of `entry`, a `pkg/Class.method(descriptor)`, into
/// one program whose first module is the harness calling it.
pub fn translate(config : &Config, source : &dyn ClassSource, entry : &str) -> GeneralResult<Program> {
    let entry = parse_entry(entry)?;
    config.validate()?;
    info!(class = %entry.class, method = %entry.method, bits = config.bits, threads = config.thread_bound, "translation started");

    let mut registry = closure::include(config, source, &entry.class)?;
    hierarchy::resolve(&mut registry);

    let class = registry.get(&entry.class).ok_or_else(|| TranslateError::MissingClass(entry.class.clone()))?;
    let lookup = ClassAnnotations::new(&class.annotations);
    let harness = wrapper::wrap(config, &registry, &entry.class, &entry.method, &entry.descriptor, &lookup)?;
    let heap = initial_heap(config, harness.heap)?;

    let mut modules = vec![ harness.module ];
    let mut translator = Translator::new(config, &registry, &entry.class);
    for c in registry.iter() {
        for m in c.methods.iter().filter(|m| m.code.is_some()) {
            modules.push(translator.translate_method(c, m)?);
        }
    }

    let program = Program {
        bits : config.bits,
        heap,
        globals : globals(config, &registry),
        constants : constants(&registry),
        modules,
        entry : label::at(wrapper::HARNESS, 0),
    };
    info!(classes = registry.len(), modules = program.modules.len(), rules = program.rules().count(), "translation complete");
    Ok(program)
}

#[cfg(test)]
use std::collections::BTreeSet;
#[cfg(test)]
use classfile::{Annotation, ClassDef, ElementValue, Handler};
#[cfg(test)]
use classpath::{ClassPath, MemorySource};
#[cfg(test)]
use closure::fixtures::*;
#[cfg(test)]
use ir::{Condition, ExprOp, IdSet};
#[cfg(test)]
use jvmtypes::*;
#[cfg(test)]
use walkdir::WalkDir;

#[cfg(test)]
fn source_of(classes : Vec<ClassDef>) -> MemorySource {
    let mut source = MemorySource::new();
    source.insert(object());
    for c in classes {
        source.insert(c);
    }
    source
}

#[cfg(test)]
fn identity_class() -> ClassDef {
    let mut a = class("A", Some("java/lang/Object"));
    a.methods.push(method("m", "(I)I", true, vec![
        Operation::LoadLocal { kind : JType::Int, index : 0 },
        Operation::Yield { kind : JType::Int },
    ]));
    a
}

#[cfg(test)]
fn zoo() -> Vec<ClassDef> {
    use Operation::*;
    let speak = |class : &str| Invocation { kind : InvokeKind::Virtual, method : MemberRef::new(class, "speak", "()I") };
    let mut animal = class("Animal", Some("java/lang/Object"));
    animal.methods.push(method("speak", "()I", false, vec![
        Constant { value : Literal::Int(0), pooled : false },
        Yield { kind : JType::Int },
    ]));
    animal.methods.push(method("test", "(I)I", true, vec![
        Allocation(AllocationKind::Element { class : "Dog".into() }),
        speak("Animal"),
        Allocation(AllocationKind::Element { class : "Cat".into() }),
        Yield { kind : JType::Int },
    ]));
    let mut dog = class("Dog", Some("Animal"));
    dog.methods.push(method("speak", "()I", false, vec![
        Constant { value : Literal::Int(1), pooled : false },
        Yield { kind : JType::Int },
    ]));
    let puppy = class("Puppy", Some("Dog"));
    let mut cat = class("Cat", Some("Animal"));
    cat.methods.push(method("purr", "()V", false, vec![
        Allocation(AllocationKind::Element { class : "Puppy".into() }),
        Yield { kind : JType::Void },
    ]));
    vec![ animal, dog, puppy, cat ]
}

#[test]
fn test_parse_entry() -> GeneralResult<()> {
    let e = parse_entry("sort/Quicksort.test([I)V")?;
    assert_eq!(e, EntryPoint { class : "sort/Quicksort".into(), method : "test".into(), descriptor : "([I)V".into() });
    assert!(parse_entry("sort/Quicksort").is_err());
    assert!(parse_entry("Quicksort.test").is_err());
    assert!(parse_entry(".test()V").is_err());
    Ok(())
}

#[test]
fn test_symbolic_entry_program() -> GeneralResult<()> {
    let config = Config::new(4, 15);
    let program = translate(&config, &source_of(vec![ identity_class() ]), "A.m(I)I")?;

    assert_eq!(program.entry, "init0");
    let harness = program.module(wrapper::HARNESS).ok_or("no harness")?;
    let pushes : Vec<String> = harness.rules.iter()
        .filter(|r| matches!(r.expr.op, ExprOp::Push { .. }))
        .map(ToString::to_string)
        .collect();
    assert_eq!(pushes, vec![ "init0 -> init1 : push 1 [-8,7]" ]);
    assert_eq!(program.modules[0].name, wrapper::HARNESS);
    assert!(program.module("A.m(I)I").is_some());
    assert_eq!(program.heap, vec![ 16; 15 ]);
    assert_eq!(program.globals, vec![ Variable { name : "e".into(), ty : VarType::Int(4) } ]);

    let text = program.to_string();
    assert!(text.starts_with("bits 4\n"), "{}", text);
    assert!(text.contains("init0 -> init1 : push 1 [-8,7]"));
    Ok(())
}

#[test]
fn test_exhaustive_entry_program() -> GeneralResult<()> {
    let mut config = Config::new(4, 15);
    config.mode = WrapMode::Exhaustive;
    let program = translate(&config, &source_of(vec![ identity_class() ]), "A.m(I)I")?;
    let harness = program.module(wrapper::HARNESS).ok_or("no harness")?;
    let text : Vec<String> = harness.rules.iter().map(ToString::to_string).collect();
    assert_eq!(text[0], "init0 -> init4 : push 1 -8");
    assert!(text.iter().any(|r| r.ends_with(": push 1 7")));
    assert_eq!(text.iter().filter(|r| r.contains("A.m(I)I0")).count(), 1);
    Ok(())
}

#[test]
fn test_translation_is_deterministic() -> GeneralResult<()> {
    let config = Config::new(4, 15);
    let first = translate(&config, &source_of(zoo()), "Animal.test(I)I")?;
    let second = translate(&config, &source_of(zoo()), "Animal.test(I)I")?;
    assert_eq!(first, second);
    assert_eq!(first.to_string(), second.to_string());
    Ok(())
}

#[test]
fn test_class_ids_are_unique() -> GeneralResult<()> {
    for threads in &[ 1, 3 ] {
        let mut config = Config::new(4, 15);
        config.thread_bound = *threads;
        let reg = closure::include(&config, &source_of(zoo()), "Animal")?;
        let ids : Vec<u32> = reg.iter().map(|c| c.id).collect();
        let unique : BTreeSet<u32> = ids.iter().copied().collect();
        assert_eq!(ids.len(), unique.len());
        assert!(!unique.contains(&0));
        assert_eq!(unique.iter().next().copied(), Some(config.first_class_id()));
        if *threads > 1 {
            assert!(unique.iter().all(|&id| id >= 2));
        }
    }
    Ok(())
}

#[test]
fn test_thread_globals() -> GeneralResult<()> {
    let mut config = Config::new(4, 15);
    config.thread_bound = 2;
    let program = translate(&config, &source_of(vec![ identity_class() ]), "A.m(I)I")?;
    let names : Vec<&str> = program.globals.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec![ "e", "save1", "waitflag1", "waitfor1", "save2", "waitflag2", "waitfor2" ]);
    Ok(())
}

#[test]
fn test_closure_is_complete() -> GeneralResult<()> {
    use Operation::*;
    let mut classes = zoo();
    classes[0].methods.push(method("io", "()V", true, vec![
        Allocation(AllocationKind::Element { class : "java/io/File".into() }),
        InstanceOf { class : "sun/misc/Unsafe".into() },
        Allocation(AllocationKind::Array { class : "[[LDog;".into(), dims : 2 }),
        Yield { kind : JType::Void },
    ]));
    let config = Config::new(4, 15);
    let reg = closure::include(&config, &source_of(classes), "Animal")?;
    for c in reg.iter() {
        for m in &c.methods {
            for (_, op) in m.code.iter().flat_map(|code| code.ops.iter()) {
                for name in op.referenced_classes() {
                    assert!(reg.contains(&name) || config.is_ignored(&name), "{} missing", name);
                }
            }
        }
    }
    assert!(reg.contains("[LDog;"));
    assert!(!reg.contains("java/io/File"));
    Ok(())
}

#[test]
fn test_dispatch_guards_cover_every_receiver() -> GeneralResult<()> {
    let config = Config::new(4, 15);
    let program = translate(&config, &source_of(zoo()), "Animal.test(I)I")?;
    let module = program.module("Animal.test(I)I").ok_or("no module")?;

    let mut covered = IdSet::new();
    let mut guarded = 0;
    for r in module.rules_from("Animal.test(I)I1") {
        if let (ExprOp::Invoke { .. }, Some(Condition::Contains(ids))) = (&r.expr.op, &r.expr.cond) {
            assert!(covered.is_disjoint(ids));
            covered.extend(ids.iter().copied());
            guarded += 1;
        }
    }
    assert_eq!(guarded, 2);

    let mut reg = closure::include(&config, &source_of(zoo()), "Animal")?;
    hierarchy::resolve(&mut reg);
    assert_eq!(covered, reg.castable_ids("Animal"));
    Ok(())
}

#[test]
fn test_interface_call_without_body_erases_value() -> GeneralResult<()> {
    use Operation::*;
    let mut a = class("A", Some("java/lang/Object"));
    a.methods.push(method("test", "()I", true, vec![
        Allocation(AllocationKind::Element { class : "B".into() }),
        Invocation { kind : InvokeKind::Interface(1), method : MemberRef::new("I", "foo", "()I") },
        Yield { kind : JType::Int },
    ]));
    let mut b = class("B", Some("A"));
    b.interfaces.push("I".into());
    let mut i = interface("I");
    i.methods.push(abstract_method("foo", "()I"));

    let program = translate(&Config::new(4, 15), &source_of(vec![ a, b, i ]), "A.test()I")?;
    let module = program.module("A.test()I").ok_or("no module")?;
    let at1 : Vec<String> = module.rules_from("A.test()I1").map(ToString::to_string).collect();
    assert!(at1.contains(&"A.test()I1 -> A.test()I2 : poppush 1 1".to_owned()), "{:?}", at1);
    assert!(!module.rules_from("A.test()I1").any(|r| matches!(r.expr.op, ExprOp::Invoke { .. })));
    Ok(())
}

#[test]
fn test_catch_by_ancestor() -> GeneralResult<()> {
    use Operation::*;
    let mut a = class("A", Some("java/lang/Object"));
    let mut m = method("test", "()V", true, vec![
        Allocation(AllocationKind::Element { class : "E".into() }),
        Throw,
        Yield { kind : JType::Void },
    ]);
    if let Some(code) = m.code.as_mut() {
        code.handlers.push(Handler { start : 0, end : 2, target : 2, catch_type : Some("F".into()) });
    }
    a.methods.push(m);
    let e = class("E", Some("F"));
    let f = class("F", Some("java/lang/Object"));

    let program = translate(&Config::new(4, 15), &source_of(vec![ a, e, f ]), "A.test()V")?;
    let module = program.module("A.test()V").ok_or("no module")?;
    let thrown : Vec<_> = module.rules_from("A.test()V1").collect();
    assert_eq!(thrown.len(), 2);
    let handler = thrown.iter().filter(|r| matches!(r.expr.op, ExprOp::Jump(ir::JumpKind::Throw))).count();
    assert_eq!(handler, 1);
    match (&thrown[0].expr.cond, &thrown[1].expr.cond) {
        (Some(Condition::Contains(caught)), Some(Condition::NotContains(rest))) => {
            assert!(caught.is_subset(rest));
            assert!(rest.contains(&0));
        },
        other => return Err(format!("unexpected guards {:?}", other).into()),
    }
    Ok(())
}

#[cfg(test)]
fn annotated_entry(range : &str) -> ClassDef {
    let mut a = class("A", Some("java/lang/Object"));
    let mut m = method("test", "([I)V", true, vec![ Operation::Yield { kind : JType::Void } ]);
    m.param_names.push("a".into());
    m.annotations.push(Annotation {
        type_name : "Lde/tum/in/jmoped/annotation/Range;".into(),
        elements : vec![ ("value".into(), ElementValue::Array(vec![
            ElementValue::Str(range.into()),
            ElementValue::Str("a[]=[0,1]".into()),
        ])) ],
    });
    a.methods.push(m);
    a
}

#[test]
fn test_range_errors_fail_fast() -> GeneralResult<()> {
    let config = Config::new(4, 15);
    let err = translate(&config, &source_of(vec![ annotated_entry("a=[0,100]") ]), "A.test([I)V")
        .err()
        .ok_or("translation should fail")?;
    assert_eq!(
        err.downcast_ref::<TranslateError>(),
        Some(&TranslateError::RangeTooLarge { min : 0, max : 100, bits : 4 })
    );
    Ok(())
}

#[test]
fn test_heap_estimate() -> GeneralResult<()> {
    let source = source_of(vec![ annotated_entry("a=[2,2]") ]);
    let program = translate(&Config::new(4, 9), &source, "A.test([I)V")?;
    assert_eq!(program.heap, vec![ 16, 16, 6, 2, 2, 16, 16, 16, 16 ]);

    let err = translate(&Config::new(4, 5), &source, "A.test([I)V").err().ok_or("heap should not fit")?;
    assert_eq!(err.downcast_ref::<TranslateError>(), Some(&TranslateError::HeapTooSmall(6)));

    // unfixed lengths leave the heap alone
    let program = translate(&Config::new(4, 5), &source_of(vec![ annotated_entry("a=[0,2]") ]), "A.test([I)V")?;
    assert_eq!(program.heap, vec![ 16; 5 ]);
    Ok(())
}

#[test]
fn test_static_globals_and_constants() -> GeneralResult<()> {
    let mut a = identity_class();
    a.fields.push(field("count", "I", true));
    a.fields.push(field("$assertionsDisabled", "Z", true));
    a.fields.push(classfile::FieldDef { is_final : true, constant_value : Some(3), ..field("K", "I", true) });
    a.fields.push(classfile::FieldDef { is_final : true, ..field("L", "I", true) });
    a.methods.push(method("<clinit>", "()V", true, vec![ Operation::Yield { kind : JType::Void } ]));

    let program = translate(&Config::new(5, 15), &source_of(vec![ a ]), "A.m(I)I")?;
    assert_eq!(program.globals, vec![
        Variable { name : "e".into(), ty : VarType::Int(5) },
        Variable { name : "A".into(), ty : VarType::Bool },
        Variable { name : "A.count".into(), ty : VarType::Int(5) },
        Variable { name : "A.$assertionsDisabled".into(), ty : VarType::Bool },
    ]);
    assert_eq!(program.constants, vec![ ("A.K".to_owned(), 3), ("A.L".to_owned(), 0) ]);
    let harness = program.module(wrapper::HARNESS).ok_or("no harness")?;
    assert_eq!(harness.rules[0].to_string(), "init0 -> A.<clinit>()V0 init1 : invoke 0");
    Ok(())
}

#[test]
fn test_invalid_config_is_rejected() {
    let source = source_of(vec![ identity_class() ]);
    assert!(translate(&Config::new(0, 15), &source, "A.m(I)I").is_err());
    assert!(translate(&Config::new(4, 0), &source, "A.m(I)I").is_err());
    let missing = translate(&Config::new(4, 15), &source, "Nowhere.m(I)I").err().map(|e| e.to_string());
    assert!(missing.map_or(false, |e| e.contains("Nowhere")));
}

#[cfg(test)]
fn translate_compiled(root : &std::path::Path, name : &str) -> GeneralResult<usize> {
    let mut config = Config::new(4, 31);
    config.ignored_prefixes = vec![ "java/".into(), "jdk/".into(), "sun/".into() ];
    config.never_ignored.clear();
    config.stubs.clear();
    let cp = ClassPath::new(vec![ root.to_owned() ], None);
    let def = match cp.load(name)? {
        Some(def) => def,
        None => return Ok(0),
    };
    let mut count = 0;
    for m in def.methods.iter().filter(|m| m.is_static && m.name == "test") {
        let entry = format!("{}.{}{}", name, m.name, m.descriptor);
        eprintln!("Translating {} ...", entry);
        let program = translate(&config, &cp, &entry)?;
        assert!(program.rules().count() > 0);
        count += 1;
    }
    Ok(count)
}

#[test]
fn test_translate_compiled_classes() -> GeneralResult<()> {
    let root = std::path::Path::new(env!("OUT_DIR"));
    let is_dir_or_class = |e : &walkdir::DirEntry| {
        e.metadata().map(|e| e.is_dir()).unwrap_or(false) ||
            e.file_name().to_str().map(|s| s.ends_with(".class")).unwrap_or(false)
    };
    for class in WalkDir::new(root).into_iter().filter_entry(is_dir_or_class) {
        let class = class?;
        if ! class.path().metadata()?.is_dir() {
            let relative = class.path().strip_prefix(root)?.with_extension("");
            let name = relative.to_str().ok_or("no name")?.replace(std::path::MAIN_SEPARATOR, "/");
            translate_compiled(root, &name)?;
        }
    }

    Ok(())
}
