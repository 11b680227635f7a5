/// Module name of a method, e.g. `sort/Quicksort.test([I)V`.
pub fn method_name(class : &str, name : &str, descriptor : &str) -> String {
    format!("{}.{}{}", class, name, descriptor)
}

/// Label of the instruction at `offset` within `method`.
pub fn at(method : &str, offset : usize) -> String {
    format!("{}{}", method, offset)
}

pub fn npe(label : &str) -> String { format!("{}_NPE", label) }
pub fn ioob(label : &str) -> String { format!("{}_IOOB", label) }
pub fn heap_overflow(label : &str) -> String { format!("{}_HEAPOVERFLOW", label) }
pub fn assertion(label : &str) -> String { format!("{}_ASSERTION", label) }

/// Produces labels that never repeat within one run.
#[derive(Clone, Debug)]
pub struct FreshLabels {
    prefix : &'static str,
    next : usize,
}

impl FreshLabels {
    pub fn new(prefix : &'static str) -> Self {
        FreshLabels { prefix, next : 0 }
    }

    pub fn fresh(&mut self) -> String {
        let label = format!("{}{}", self.prefix, self.next);
        self.next += 1;
        label
    }
}

#[test]
fn test_labels() {
    let m = method_name("sort/Quicksort", "test", "([I)V");
    assert_eq!(m, "sort/Quicksort.test([I)V");
    assert_eq!(at(&m, 12), "sort/Quicksort.test([I)V12");
    assert_eq!(npe("A.f()V3"), "A.f()V3_NPE");
    assert_eq!(heap_overflow("A.f()V3"), "A.f()V3_HEAPOVERFLOW");

    let mut f = FreshLabels::new("ret");
    assert_eq!(f.fresh(), "ret0");
    assert_eq!(f.fresh(), "ret1");
}
