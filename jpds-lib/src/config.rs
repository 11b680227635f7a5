use crate::error::TranslateError;
use crate::GeneralResult;

pub const DEFAULT_STUB_PREFIX : &str = "de/tum/in/jmoped/translator/stub/";

pub const DEFAULT_IGNORED : &[&str] = &[
    "java/io",
    "java/lang/AssertionError",
    "org/gjt/jclasslib",
    "org/junit",
    "sun",
];

pub const DEFAULT_STUBS : &[&str] = &[
    "java/lang/Exception",
    "java/lang/Integer",
    "java/lang/Math",
    "java/lang/RuntimeException",
    "java/lang/String",
    "java/lang/StringBuilder",
    "java/lang/Thread",
    "java/lang/Throwable",
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WrapMode {
    /// each argument is a single ranged nondeterministic value
    Symbolic,
    /// every argument combination is enumerated by explicit loops
    Exhaustive,
}

/// Per-run settings. Fixed before any rule is generated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub bits : u32,
    pub heap_size : usize,
    pub thread_bound : u32,
    pub context_switches : bool,
    pub mode : WrapMode,
    pub nondet : bool,
    pub ignored_prefixes : Vec<String>,
    pub never_ignored : Vec<String>,
    pub stubs : Vec<String>,
    pub stub_prefix : String,
}

impl Config {
    pub fn new(bits : u32, heap_size : usize) -> Self {
        Config {
            bits,
            heap_size,
            thread_bound : 1,
            context_switches : true,
            mode : WrapMode::Symbolic,
            nondet : true,
            ignored_prefixes : DEFAULT_IGNORED.iter().map(|&s| s.to_owned()).collect(),
            never_ignored : vec![ "java/lang/Object".to_owned() ],
            stubs : DEFAULT_STUBS.iter().map(|&s| s.to_owned()).collect(),
            stub_prefix : DEFAULT_STUB_PREFIX.to_owned(),
        }
    }

    pub fn validate(&self) -> GeneralResult<()> {
        let bad = |s : &str| -> GeneralResult<()> { Err(TranslateError::Config(s.to_owned()).into()) };
        if self.bits == 0 || self.bits > 32 {
            return bad("bit width must be between 1 and 32");
        }
        if self.heap_size == 0 {
            return bad("heap size must be positive");
        }
        if self.thread_bound == 0 {
            return bad("thread bound must be positive");
        }
        Ok(())
    }

    pub fn multithreading(&self) -> bool {
        self.thread_bound > 1
    }

    /// Whether interleaving points are tagged for the downstream scheduler.
    pub fn shared_rules(&self) -> bool {
        self.multithreading() && self.context_switches
    }

    /// The first class id. Id 0 is null; a second id is reserved when
    /// modeling threads.
    pub fn first_class_id(&self) -> u32 {
        if self.multithreading() { 2 } else { 1 }
    }

    /// Header cells preceding the fields of every object.
    pub fn object_base(&self) -> u32 {
        if self.multithreading() { 2 } else { 0 }
    }

    pub fn is_stub(&self, name : &str) -> bool {
        self.stubs.iter().any(|s| s == name)
    }

    pub fn is_ignored(&self, name : &str) -> bool {
        !self.never_ignored.iter().any(|s| s == name)
            && self.ignored_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    pub fn int_max(&self) -> i64 {
        (1_i64 << (self.bits - 1)) - 1
    }

    pub fn int_min(&self) -> i64 {
        -(1_i64 << (self.bits - 1))
    }
}

#[test]
fn test_validate() {
    assert!(Config::new(4, 15).validate().is_ok());
    assert!(Config::new(0, 15).validate().is_err());
    assert!(Config::new(33, 15).validate().is_err());
    assert!(Config::new(4, 0).validate().is_err());
    let mut c = Config::new(4, 15);
    c.thread_bound = 0;
    assert!(c.validate().is_err());
}

#[test]
fn test_ignore_policy() {
    let c = Config::new(4, 15);
    assert!(c.is_ignored("java/io/PrintStream"));
    assert!(c.is_ignored("sun/misc/Unsafe"));
    assert!(!c.is_ignored("java/lang/Object"));
    assert!(!c.is_ignored("sort/Quicksort"));
    assert!(c.is_stub("java/lang/Integer"));
    assert!(c.is_ignored("org/junit/Assert"));
}

#[test]
fn test_thread_dependent_layout() {
    let mut c = Config::new(4, 15);
    assert_eq!((c.first_class_id(), c.object_base()), (1, 0));
    assert!(!c.shared_rules());
    c.thread_bound = 2;
    assert_eq!((c.first_class_id(), c.object_base()), (2, 2));
    assert!(c.shared_rules());
    c.context_switches = false;
    assert!(!c.shared_rules());
    assert_eq!((c.int_min(), c.int_max()), (-8, 7));
}
