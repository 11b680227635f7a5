use tracing::{debug, info};

use crate::annotation::{AnnotationLookup, Range};
use crate::classfile::MethodDef;
use crate::closure::{ClassEntry, ClassRegistry};
use crate::config::{Config, WrapMode};
use crate::error::TranslateError;
use crate::ir::*;
use crate::jvmtypes::args::{field_size, param_types};
use crate::jvmtypes::{Comparison, StackOperation};
use crate::label::{self, FreshLabels};
use crate::translate::clinit_name;
use crate::GeneralResult;

/// Name of the harness module. Its first label is the program entry.
pub const HARNESS : &str = "init";

const INTEGER : &str = "java/lang/Integer";

#[derive(Clone, Debug, PartialEq)]
enum Param {
    Scalar { cat : Category, range : Range },
    /// a `java/lang/Integer` built from an int in `range`
    Boxed { range : Range },
    /// a one-dimensional primitive array
    Array { class : String, length : Range, element : Range },
}

impl Param {
    // exhaustive mode keeps a length counter, the array, a dirty flag and an
    // element cursor for every array
    fn slots(&self) -> u16 {
        match self {
            Param::Scalar { cat, .. } => u16::from(cat.slots()),
            Param::Boxed { .. } => 1,
            Param::Array { .. } => 4,
        }
    }

    fn arg_slots(&self) -> u8 {
        match self {
            Param::Scalar { cat, .. } => cat.slots(),
            Param::Boxed { .. } | Param::Array { .. } => 1,
        }
    }

    /// The category and range of a parameter enumerated as a single value.
    fn scalar(&self) -> Option<(Category, Range)> {
        match self {
            Param::Scalar { cat, range } => Some((*cat, *range)),
            Param::Boxed { range } => Some((Category::One, *range)),
            Param::Array { .. } => None,
        }
    }

    /// Stack slots the parameter occupies while its argument is built.
    fn peak(&self) -> u16 {
        match self {
            // reference, its duplicate and the int
            Param::Boxed { .. } => 3,
            _ => u16::from(self.arg_slots()),
        }
    }
}

/// Deepest operand stack reached while the call arguments are pushed.
fn max_stack(receiver : bool, params : &[Param]) -> u16 {
    let mut depth = u16::from(receiver);
    let mut peak = depth;
    for p in params {
        peak = peak.max(depth + p.peak());
        depth += u16::from(p.arg_slots());
    }
    peak
}

/// The synthesized entry module, with the estimated value-domain sizes of
/// the heap cells its fixed-length arrays occupy.
#[derive(Clone, Debug, PartialEq)]
pub struct Harness {
    pub module : MethodModule,
    pub heap : Option<Vec<u64>>,
}

/// The method by exact descriptor, else the first of the same name and
/// parameter count.
fn find_method<'r>(class : &'r ClassEntry, name : &str, descriptor : &str) -> GeneralResult<&'r MethodDef> {
    if let Some(m) = class.method(name, descriptor) {
        return Ok(m);
    }
    let count = param_types(descriptor)?.len();
    for m in class.methods.iter().filter(|m| m.name == name) {
        if param_types(&m.descriptor)?.len() == count {
            debug!(wanted = descriptor, found = %m.descriptor, "matched entry method by parameter count");
            return Ok(m);
        }
    }
    Err(TranslateError::MissingMethod(label::method_name(&class.name, name, descriptor)).into())
}

fn is_primitive(s : &str) -> bool {
    s.len() == 1 && "BCDFIJSZ".contains(s)
}

/// Classifies every parameter and checks its ranges against the bit width.
fn params(config : &Config, method : &MethodDef, lookup : &dyn AnnotationLookup) -> GeneralResult<Vec<Param>> {
    let mut out = Vec::new();
    for (i, p) in param_types(&method.descriptor)?.into_iter().enumerate() {
        let name = method.param_names.get(i).map(String::as_str);
        let range = lookup.param_range(method, i, name).unwrap_or_else(|| Range::from_bits(config.bits));
        range.check(config.bits)?;

        let param = match p.as_str() {
            "Ljava/lang/Integer;" => Param::Boxed { range },
            s if is_primitive(s) => {
                let ch = s.chars().next().ok_or("empty parameter type")?;
                Param::Scalar { cat : Category::from_slots(field_size(ch)?), range }
            },
            s if s.starts_with('[') && is_primitive(&s[1..]) => {
                let element = lookup.element_range(method, i, name).unwrap_or_else(|| Range::from_bits(config.bits));
                element.check(config.bits)?;
                Param::Array { class : p.clone(), length : Range { min : range.min.max(0), ..range }, element }
            },
            _ => {
                let what = format!("parameter of type {} in entry method {}{}", p, method.name, method.descriptor);
                return Err(TranslateError::Unsupported(what).into());
            },
        };
        out.push(param);
    }
    Ok(out)
}

fn estimate_heap(config : &Config, params : &[Param]) -> Option<Vec<u64>> {
    let cell = 1_u64 << config.bits;
    let mut sizes = Vec::new();
    for p in params {
        if let Param::Array { length, element, .. } = p {
            if length.min != length.max {
                return None;
            }
            let n = length.min as u64;
            sizes.push(cell);
            sizes.push(2 * (n + 1));
            if config.shared_rules() {
                sizes.push(cell);
                sizes.push(cell);
            }
            sizes.extend(std::iter::repeat(element.size()).take(n as usize));
        }
    }
    if sizes.is_empty() { None } else { Some(sizes) }
}

/// How `java/lang/Integer` arguments are allocated and constructed.
struct Boxing {
    new : ExprOp,
    init : String,
}

fn boxing(config : &Config, registry : &ClassRegistry, params : &[Param]) -> GeneralResult<Option<Boxing>> {
    if !params.iter().any(|p| matches!(p, Param::Boxed { .. })) {
        return Ok(None);
    }
    let integer = registry.get(INTEGER).ok_or_else(|| TranslateError::MissingClass(INTEGER.to_owned()))?;
    let init = integer.method("<init>", "(I)V")
        .map(|m| label::at(&label::method_name(INTEGER, &m.name, &m.descriptor), 0))
        .ok_or_else(|| TranslateError::MissingMethod(label::method_name(INTEGER, "<init>", "(I)V")))?;
    let new = ExprOp::New { id : integer.id, size : config.object_base() + integer.size() };
    Ok(Some(Boxing { new, init }))
}

/// Builds the harness calling `class.method(descriptor)`. Every parameter
/// range is validated before the first rule is emitted.
pub fn wrap(
    config : &Config,
    registry : &ClassRegistry,
    class : &str,
    method : &str,
    descriptor : &str,
    lookup : &dyn AnnotationLookup,
) -> GeneralResult<Harness> {
    let entry = registry.get(class).ok_or_else(|| TranslateError::MissingClass(class.to_owned()))?;
    let def = find_method(entry, method, descriptor)?;
    let params = params(config, def, lookup)?;
    let boxing = boxing(config, registry, &params)?;
    let heap = match config.mode {
        WrapMode::Symbolic => estimate_heap(config, &params),
        WrapMode::Exhaustive => None,
    };

    let mut b = Builder {
        registry,
        labels : FreshLabels::new(HARNESS),
        module : MethodModule::new(HARNESS),
        boxing,
    };
    let mut from = b.fresh();
    if entry.has_clinit() {
        let to = b.fresh();
        b.module.add_call_rule(&from, ExprOp::Invoke { nargs : 0 }, &label::at(&clinit_name(class), 0), &to);
        from = to;
    }

    let receiver = if def.is_static {
        None
    } else {
        Some(ExprOp::New { id : entry.id, size : config.object_base() + entry.size() })
    };
    let call = Call {
        callee : label::at(&label::method_name(class, &def.name, &def.descriptor), 0),
        nargs : params.iter().map(Param::arg_slots).sum::<u8>() + if def.is_static { 0 } else { 1 },
    };

    match config.mode {
        WrapMode::Symbolic => b.symbolic(from, receiver, &params, &call)?,
        WrapMode::Exhaustive => b.exhaustive(from, receiver, &params, &call)?,
    }
    info!(entry = %call.callee, params = params.len(), mode = ?config.mode, rules = b.module.rules.len(), "built harness");
    Ok(Harness { module : b.module, heap })
}

struct Call {
    callee : String,
    nargs : u8,
}

struct Builder<'a> {
    registry : &'a ClassRegistry,
    labels : FreshLabels,
    module : MethodModule,
    boxing : Option<Boxing>,
}

impl Builder<'_> {
    fn fresh(&mut self) -> String {
        self.labels.fresh()
    }

    /// Emits `op` from `from` to a fresh label and returns that label.
    fn step(&mut self, from : &str, op : ExprOp) -> String {
        let to = self.fresh();
        self.module.add_rule(from, op, &to);
        to
    }

    fn int(cat : Category, v : i64) -> ExprOp {
        ExprOp::Push { cat, value : Value::Int(v as i32) }
    }

    fn array_id(&self, class : &str) -> u32 {
        self.registry.id_of(class).unwrap_or(0)
    }

    /// Allocates an `Integer`, then constructs it from the int `value` pushes.
    /// Leaves one reference on the stack.
    fn boxed(&mut self, from : &str, value : ExprOp) -> GeneralResult<String> {
        let (new, init) = match &self.boxing {
            Some(b) => (b.new.clone(), b.init.clone()),
            None => return Err(TranslateError::MissingClass(INTEGER.to_owned()).into()),
        };
        let l = self.step(from, new);
        let l = self.step(&l, ExprOp::Dup { op : StackOperation::Dup, size : 1 });
        let l = self.step(&l, value);
        let ret = self.fresh();
        self.module.add_call_rule(&l, ExprOp::Invoke { nargs : 2 }, &init, &ret);
        Ok(ret)
    }

    fn symbolic(&mut self, mut from : String, receiver : Option<ExprOp>, params : &[Param], call : &Call) -> GeneralResult<()> {
        let has_receiver = receiver.is_some();
        if let Some(new) = receiver {
            from = self.step(&from, new);
        }
        for p in params {
            match p {
                Param::Scalar { cat, range } => {
                    let value = Value::Range { min : range.min, max : range.max };
                    from = self.step(&from, ExprOp::Push { cat : *cat, value });
                },
                Param::Boxed { range } => {
                    let value = Value::Range { min : range.min, max : range.max };
                    from = self.boxed(&from, ExprOp::Push { cat : Category::One, value })?;
                },
                Param::Array { class, length, element } => {
                    let value = Value::Range { min : length.min, max : length.max };
                    from = self.step(&from, ExprOp::Push { cat : Category::One, value });
                    let types = vec![ self.array_id(class) ];
                    let init = Value::Range { min : element.min, max : element.max };
                    from = self.step(&from, ExprOp::NewArray { dims : 1, types, init });
                },
            }
        }
        let ret = self.fresh();
        self.module.add_call_rule(&from, ExprOp::Invoke { nargs : call.nargs }, &call.callee, &ret);
        self.module.add_return_rule(&ret, ExprOp::Return(None));
        self.module.max_stack = max_stack(has_receiver, params);
        Ok(())
    }

    fn increment(&mut self, from : &str, cat : Category, slot : u16, to : &str) {
        match cat {
            Category::One => self.module.add_rule(from, ExprOp::Inc { index : slot, value : 1 }, to),
            Category::Two => {
                let l = self.step(from, ExprOp::Load { cat, index : slot });
                let l = self.step(&l, Self::int(cat, 1));
                let l = self.step(&l, ExprOp::Arith { op : ArithOp::Add, cat, float : false });
                self.module.add_rule(&l, ExprOp::Store { cat, index : slot }, to);
            },
        }
    }

    /// Nested loops, first parameter outermost. `inits[k]` gives parameter
    /// `k` its first value and `steps[k]` its next one; both continue with
    /// the parameters inside it. A heap snapshot is taken around every call,
    /// boxed arguments included, and under every live array allocation.
    fn exhaustive(&mut self, from : String, receiver : Option<ExprOp>, params : &[Param], call : &Call) -> GeneralResult<()> {
        use Category::One;

        let mut slot = 0_u16;
        let mut first = from;
        let has_receiver = receiver.is_some();
        if let Some(new) = receiver {
            let l = self.step(&first, new);
            first = self.step(&l, ExprOp::Store { cat : One, index : 0 });
            slot = 1;
        }
        let mut slots = Vec::new();
        for p in params {
            slots.push(slot);
            slot += p.slots();
        }

        let n = params.len();
        let mut inits = vec![ first ];
        for _ in 0..n {
            let l = self.fresh();
            inits.push(l);
        }
        let steps : Vec<String> = (0..n).map(|_| self.fresh()).collect();
        let exit = self.fresh();

        for (k, p) in params.iter().enumerate() {
            let s = slots[k];
            let inner = inits[k + 1].clone();
            let outer = if k == 0 { exit.clone() } else { steps[k - 1].clone() };
            match (p, p.scalar()) {
                (_, Some((cat, range))) => {
                    let l = self.step(&inits[k], Self::int(cat, range.min));
                    self.module.add_rule(&l, ExprOp::Store { cat, index : s }, &inner);

                    let l = self.step(&steps[k], ExprOp::Load { cat, index : s });
                    let l = self.step(&l, Self::int(cat, range.max));
                    self.module.add_rule(&l, ExprOp::IfCmp { cat, way : Comparison::Ge }, &outer);
                    let bump = self.fresh();
                    self.module.add_rule(&l, ExprOp::IfCmp { cat, way : Comparison::Lt }, &bump);
                    self.increment(&bump, cat, s, &inner);
                },
                (Param::Array { class, length, element }, _) => {
                    let (array, dirty, cursor) = (s + 1, s + 2, s + 3);
                    let load = |index| ExprOp::Load { cat : One, index };
                    let store = |index| ExprOp::Store { cat : One, index };

                    let alloc = self.fresh();
                    let l = self.step(&inits[k], Self::int(One, 0));
                    let l = self.step(&l, store(dirty));
                    let l = self.step(&l, Self::int(One, length.min));
                    self.module.add_rule(&l, store(s), &alloc);

                    // drop the previous allocation, if any, then allocate
                    let l = self.step(&alloc, load(dirty));
                    let restore = self.fresh();
                    let clean = self.fresh();
                    self.module.add_rule(&l, ExprOp::If(IfTest::Compare(Comparison::Ne)), &restore);
                    self.module.add_rule(&l, ExprOp::If(IfTest::Compare(Comparison::Eq)), &clean);
                    self.module.add_rule(&restore, ExprOp::HeapRestore, &clean);
                    let l = self.step(&clean, ExprOp::HeapSave);
                    let l = self.step(&l, load(s));
                    let types = vec![ self.array_id(class) ];
                    let l = self.step(&l, ExprOp::NewArray { dims : 1, types, init : Value::Int(element.min as i32) });
                    let l = self.step(&l, store(array));
                    let l = self.step(&l, Self::int(One, 1));
                    self.module.add_rule(&l, store(dirty), &inner);

                    // odometer over the elements
                    let scan = self.fresh();
                    let l = self.step(&steps[k], Self::int(One, 0));
                    self.module.add_rule(&l, store(cursor), &scan);
                    let l = self.step(&scan, load(cursor));
                    let l = self.step(&l, load(s));
                    let grow_check = self.fresh();
                    let element_check = self.fresh();
                    self.module.add_rule(&l, ExprOp::IfCmp { cat : One, way : Comparison::Ge }, &grow_check);
                    self.module.add_rule(&l, ExprOp::IfCmp { cat : One, way : Comparison::Lt }, &element_check);

                    let l = self.step(&element_check, load(array));
                    let l = self.step(&l, load(cursor));
                    let l = self.step(&l, ExprOp::ArrayLoad(One));
                    let l = self.step(&l, Self::int(One, element.max));
                    let bump = self.fresh();
                    let reset = self.fresh();
                    self.module.add_rule(&l, ExprOp::IfCmp { cat : One, way : Comparison::Lt }, &bump);
                    self.module.add_rule(&l, ExprOp::IfCmp { cat : One, way : Comparison::Ge }, &reset);

                    let l = self.step(&bump, load(array));
                    let l = self.step(&l, load(cursor));
                    let l = self.step(&l, ExprOp::Dup { op : StackOperation::Dup, size : 2 });
                    let l = self.step(&l, ExprOp::ArrayLoad(One));
                    let l = self.step(&l, Self::int(One, 1));
                    let l = self.step(&l, ExprOp::Arith { op : ArithOp::Add, cat : One, float : false });
                    self.module.add_rule(&l, ExprOp::ArrayStore(One), &inner);

                    let l = self.step(&reset, load(array));
                    let l = self.step(&l, load(cursor));
                    let l = self.step(&l, Self::int(One, element.min));
                    let l = self.step(&l, ExprOp::ArrayStore(One));
                    self.module.add_rule(&l, ExprOp::Inc { index : cursor, value : 1 }, &scan);

                    // every element wrapped around: try the next length
                    let l = self.step(&grow_check, load(s));
                    let l = self.step(&l, Self::int(One, length.max));
                    let grow = self.fresh();
                    let done = self.fresh();
                    self.module.add_rule(&l, ExprOp::IfCmp { cat : One, way : Comparison::Lt }, &grow);
                    self.module.add_rule(&l, ExprOp::IfCmp { cat : One, way : Comparison::Ge }, &done);
                    self.module.add_rule(&grow, ExprOp::Inc { index : s, value : 1 }, &alloc);
                    let l = self.step(&done, Self::int(One, 0));
                    let l = self.step(&l, store(dirty));
                    self.module.add_rule(&l, ExprOp::HeapRestore, &outer);
                },
                _ => {},
            }
        }

        let mut l = self.step(&inits[n], ExprOp::HeapSave);
        if has_receiver {
            l = self.step(&l, ExprOp::Load { cat : One, index : 0 });
        }
        for (k, p) in params.iter().enumerate() {
            l = match p {
                Param::Scalar { cat, .. } => self.step(&l, ExprOp::Load { cat : *cat, index : slots[k] }),
                Param::Boxed { .. } => self.boxed(&l, ExprOp::Load { cat : One, index : slots[k] })?,
                Param::Array { .. } => self.step(&l, ExprOp::Load { cat : One, index : slots[k] + 1 }),
            };
        }
        let ret = self.fresh();
        self.module.add_call_rule(&l, ExprOp::Invoke { nargs : call.nargs }, &call.callee, &ret);
        let last = if n == 0 { exit.clone() } else { steps[n - 1].clone() };
        self.module.add_rule(&ret, ExprOp::HeapRestore, &last);
        self.module.add_return_rule(&exit, ExprOp::Return(None));

        self.module.max_locals = slot;
        self.module.max_stack = max_stack(has_receiver, params).max(4);
        Ok(())
    }
}

#[cfg(test)]
use std::collections::BTreeMap;
#[cfg(test)]
use crate::classfile::ClassDef;
#[cfg(test)]
use crate::classpath::MemorySource;
#[cfg(test)]
use crate::closure::{fixtures::*, include};
#[cfg(test)]
use crate::hierarchy::resolve;

#[cfg(test)]
struct Fixed {
    params : Vec<Option<Range>>,
    elements : Option<Range>,
}

#[cfg(test)]
impl AnnotationLookup for Fixed {
    fn param_range(&self, _ : &MethodDef, index : usize, _ : Option<&str>) -> Option<Range> {
        self.params.get(index).copied().flatten()
    }

    fn element_range(&self, _ : &MethodDef, _ : usize, _ : Option<&str>) -> Option<Range> {
        self.elements
    }
}

#[cfg(test)]
fn harness_of(config : &Config, entry : ClassDef, method : &str, descriptor : &str, lookup : &Fixed) -> GeneralResult<(ClassRegistry, Harness)> {
    let name = entry.name.clone();
    let mut source = MemorySource::new();
    source.insert(object()).insert(entry);
    let mut reg = include(config, &source, &name)?;
    resolve(&mut reg);
    let harness = wrap(config, &reg, &name, method, descriptor, lookup)?;
    Ok((reg, harness))
}

#[cfg(test)]
#[derive(Clone, Debug, PartialEq)]
enum Cell {
    Int(i64),
    Ref(usize),
}

/// Just enough of a pushdown machine to run a harness, recording the
/// arguments of every call it makes.
#[cfg(test)]
#[derive(Default)]
struct Machine {
    stack : Vec<Cell>,
    locals : BTreeMap<u16, Cell>,
    heap : Vec<Vec<i64>>,
    snapshots : Vec<Vec<Vec<i64>>>,
    calls : Vec<Vec<String>>,
}

#[cfg(test)]
fn holds(way : Comparison, a : i64, b : i64) -> bool {
    match way {
        Comparison::Eq => a == b,
        Comparison::Ne => a != b,
        Comparison::Lt => a < b,
        Comparison::Ge => a >= b,
        Comparison::Gt => a > b,
        Comparison::Le => a <= b,
    }
}

#[cfg(test)]
impl Machine {
    fn pop(&mut self) -> GeneralResult<Cell> {
        self.stack.pop().ok_or_else(|| "stack underflow".into())
    }

    fn pop_int(&mut self) -> GeneralResult<i64> {
        match self.pop()? {
            Cell::Int(v) => Ok(v),
            c => Err(format!("expected an int, got {:?}", c).into()),
        }
    }

    fn pop_ref(&mut self) -> GeneralResult<usize> {
        match self.pop()? {
            Cell::Ref(r) => Ok(r),
            c => Err(format!("expected a reference, got {:?}", c).into()),
        }
    }

    fn top(&self, depth : usize) -> Option<i64> {
        match self.stack.iter().rev().nth(depth) {
            Some(Cell::Int(v)) => Some(*v),
            _ => None,
        }
    }

    fn enabled(&self, op : &ExprOp) -> bool {
        match op {
            ExprOp::If(IfTest::Compare(way)) => self.top(0).map_or(false, |v| holds(*way, v, 0)),
            ExprOp::IfCmp { way, .. } => match (self.top(1), self.top(0)) {
                (Some(a), Some(b)) => holds(*way, a, b),
                _ => false,
            },
            _ => true,
        }
    }

    fn apply(&mut self, op : &ExprOp) -> GeneralResult<()> {
        match op {
            ExprOp::Push { value : Value::Int(v), .. } => self.stack.push(Cell::Int(i64::from(*v))),
            ExprOp::Load { index, .. } => {
                let c = self.locals.get(index).cloned().ok_or("unset local")?;
                self.stack.push(c);
            },
            ExprOp::Store { index, .. } => {
                let c = self.pop()?;
                self.locals.insert(*index, c);
            },
            ExprOp::If(_) => { self.pop()?; },
            ExprOp::IfCmp { .. } => { self.pop()?; self.pop()?; },
            ExprOp::Inc { index, value } => match self.locals.get_mut(index) {
                Some(Cell::Int(v)) => *v += i64::from(*value),
                _ => return Err("increment of a non-int local".into()),
            },
            ExprOp::Arith { op : ArithOp::Add, .. } => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.stack.push(Cell::Int(a + b));
            },
            ExprOp::Dup { op : StackOperation::Dup, size } => {
                let at = self.stack.len().checked_sub(usize::from(*size)).ok_or("stack underflow")?;
                let top = self.stack[at..].to_vec();
                self.stack.extend(top);
            },
            ExprOp::ArrayLoad(_) => {
                let i = self.pop_int()? as usize;
                let r = self.pop_ref()?;
                let v = *self.heap.get(r).and_then(|a| a.get(i)).ok_or("index out of bounds")?;
                self.stack.push(Cell::Int(v));
            },
            ExprOp::ArrayStore(_) => {
                let v = self.pop_int()?;
                let i = self.pop_int()? as usize;
                let r = self.pop_ref()?;
                let cell = self.heap.get_mut(r).and_then(|a| a.get_mut(i)).ok_or("index out of bounds")?;
                *cell = v;
            },
            ExprOp::NewArray { init : Value::Int(v), .. } => {
                let n = self.pop_int()? as usize;
                self.heap.push(vec![ i64::from(*v); n ]);
                self.stack.push(Cell::Ref(self.heap.len() - 1));
            },
            ExprOp::New { .. } => {
                self.heap.push(vec![]);
                self.stack.push(Cell::Ref(self.heap.len() - 1));
            },
            ExprOp::HeapSave => self.snapshots.push(self.heap.clone()),
            ExprOp::HeapRestore => self.heap = self.snapshots.pop().ok_or("no heap snapshot")?,
            ExprOp::Invoke { nargs } => {
                let at = self.stack.len().checked_sub(usize::from(*nargs)).ok_or("missing arguments")?;
                let args = self.stack.split_off(at);
                let shown = args.iter().map(|c| match c {
                    Cell::Int(v) => v.to_string(),
                    Cell::Ref(r) => format!("{:?}", self.heap[*r]),
                }).collect();
                self.calls.push(shown);
            },
            ExprOp::Return(_) => {},
            other => return Err(format!("unexpected operation {}", other).into()),
        }
        Ok(())
    }

    /// Runs `Integer.<init>(I)V` in place: the object holds its value.
    fn construct_integer(&mut self) -> GeneralResult<()> {
        let v = self.pop_int()?;
        let r = self.pop_ref()?;
        *self.heap.get_mut(r).ok_or("dangling reference")? = vec![ v ];
        Ok(())
    }
}

#[cfg(test)]
fn run_harness(module : &MethodModule) -> GeneralResult<Machine> {
    let init = label::at(&label::method_name(INTEGER, "<init>", "(I)V"), 0);
    let mut m = Machine::default();
    let mut at = label::at(HARNESS, 0);
    for _ in 0..100_000 {
        let rule = module.rules_from(&at).find(|r| m.enabled(&r.expr.op)).cloned()
            .ok_or_else(|| format!("stuck at {}", at))?;
        match &rule.to {
            Target::Call { callee, .. } if *callee == init => m.construct_integer()?,
            _ => m.apply(&rule.expr.op)?,
        }
        at = match rule.to {
            Target::Label(l) => l,
            Target::Call { ret, .. } => ret,
            Target::Return => return Ok(m),
            Target::Dynamic { .. } => return Err("unexpected fork".into()),
        };
    }
    Err("harness did not terminate".into())
}

#[test]
fn test_symbolic_scalar() -> GeneralResult<()> {
    let mut a = class("A", Some("java/lang/Object"));
    a.methods.push(method("m", "(I)I", true, vec![]));
    let none = Fixed { params : vec![], elements : None };
    let (_, h) = harness_of(&Config::new(4, 15), a, "m", "(I)I", &none)?;

    let rules : Vec<String> = h.module.rules.iter().map(Rule::to_string).collect();
    assert_eq!(rules, vec![
        "init0 -> init1 : push 1 [-8,7]",
        "init1 -> A.m(I)I0 init2 : invoke 1",
        "init2 -> - : return",
    ]);
    assert_eq!(h.module.name, HARNESS);
    assert_eq!(h.heap, None);
    Ok(())
}

#[test]
fn test_symbolic_receiver_array_and_heap() -> GeneralResult<()> {
    let mut a = class("A", Some("java/lang/Object"));
    a.fields.push(field("x", "I", false));
    a.methods.push(method("<clinit>", "()V", true, vec![]));
    a.methods.push(method("f", "([I)V", false, vec![]));
    let lookup = Fixed { params : vec![ Some(Range::new(3, 3)) ], elements : Some(Range::new(0, 1)) };
    let (reg, h) = harness_of(&Config::new(4, 15), a, "f", "([I)V", &lookup)?;

    let (a, arr) = (reg.id_of("A").ok_or("missing A")?, reg.id_of("[I").ok_or("missing [I")?);
    let rules : Vec<String> = h.module.rules.iter().map(Rule::to_string).collect();
    assert_eq!(rules, vec![
        "init0 -> A.<clinit>()V0 init1 : invoke 0".to_owned(),
        format!("init1 -> init2 : new {} 1", a),
        "init2 -> init3 : push 1 [3,3]".to_owned(),
        format!("init3 -> init4 : newarray 1 [{}] [0,1]", arr),
        "init4 -> A.f([I)V0 init5 : invoke 2".to_owned(),
        "init5 -> - : return".to_owned(),
    ]);
    assert_eq!(h.heap, Some(vec![ 16, 8, 2, 2, 2 ]));
    Ok(())
}

#[test]
fn test_unusable_entries() -> GeneralResult<()> {
    let mut a = class("A", Some("java/lang/Object"));
    a.methods.push(method("m", "(I)I", true, vec![]));
    a.methods.push(method("s", "(Ljava/lang/Object;)V", true, vec![]));
    let wide = Fixed { params : vec![ Some(Range::new(0, 20)) ], elements : None };
    let none = Fixed { params : vec![], elements : None };
    let config = Config::new(4, 15);

    let e = harness_of(&config, a.clone(), "m", "(I)I", &wide).err().ok_or("range was accepted")?;
    assert!(e.to_string().contains("[0,20]"), "{}", e);
    assert!(harness_of(&config, a.clone(), "s", "(Ljava/lang/Object;)V", &none).is_err());
    assert!(harness_of(&config, a.clone(), "nothere", "()V", &none).is_err());

    // same name and arity stands in for a descriptor that does not match
    let (_, h) = harness_of(&config, a, "m", "(J)I", &none)?;
    assert!(h.module.rules.iter().any(|r| r.to_string() == "init1 -> A.m(I)I0 init2 : invoke 1"));
    Ok(())
}

#[test]
fn test_exhaustive_scalar_enumerates_range() -> GeneralResult<()> {
    let mut a = class("A", Some("java/lang/Object"));
    a.methods.push(method("m", "(I)I", true, vec![]));
    let mut config = Config::new(4, 15);
    config.mode = WrapMode::Exhaustive;
    let none = Fixed { params : vec![], elements : None };
    let (_, h) = harness_of(&config, a, "m", "(I)I", &none)?;

    let m = run_harness(&h.module)?;
    let expected : Vec<Vec<String>> = (-8..=7).map(|v : i32| vec![ v.to_string() ]).collect();
    assert_eq!(m.calls, expected);
    assert!(m.snapshots.is_empty());
    assert_eq!(h.module.max_stack, 4);
    Ok(())
}

#[test]
fn test_exhaustive_arrays_enumerate_every_combination() -> GeneralResult<()> {
    let mut a = class("A", Some("java/lang/Object"));
    a.methods.push(method("f", "(I[I)V", false, vec![]));
    let mut config = Config::new(4, 15);
    config.mode = WrapMode::Exhaustive;
    let lookup = Fixed {
        params : vec![ Some(Range::new(0, 1)), Some(Range::new(-1, 2)) ],
        elements : Some(Range::new(0, 1)),
    };
    let (_, h) = harness_of(&config, a, "f", "(I[I)V", &lookup)?;

    let m = run_harness(&h.module)?;
    assert_eq!(m.calls.len(), 14);
    let first : Vec<Vec<&str>> = m.calls.iter().take(7).map(|c| c.iter().map(String::as_str).collect()).collect();
    assert_eq!(first, vec![
        vec![ "[]", "0", "[]" ],
        vec![ "[]", "0", "[0]" ],
        vec![ "[]", "0", "[1]" ],
        vec![ "[]", "0", "[0, 0]" ],
        vec![ "[]", "0", "[1, 0]" ],
        vec![ "[]", "0", "[0, 1]" ],
        vec![ "[]", "0", "[1, 1]" ],
    ]);
    assert!(m.calls.iter().skip(7).all(|c| c[1] == "1"));
    assert!(m.snapshots.is_empty());
    // the receiver is allocated before any snapshot is taken
    assert_eq!(m.heap.len(), 1);
    Ok(())
}

#[cfg(test)]
fn with_integer(entry : ClassDef, name : &str, descriptor : &str, config : &Config, lookup : &Fixed) -> GeneralResult<(ClassRegistry, Harness)> {
    let entry_class = entry.name.clone();
    let mut integer = class(INTEGER, Some("java/lang/Object"));
    integer.fields.push(field("value", "I", false));
    integer.methods.push(method("<init>", "(I)V", false, vec![]));
    let stub = format!("{}{}", config.stub_prefix, INTEGER);
    let mut source = MemorySource::new();
    source.insert(object()).insert(entry).insert_as(&stub, integer);
    let mut reg = include(config, &source, &entry_class)?;
    resolve(&mut reg);
    let harness = wrap(config, &reg, &entry_class, name, descriptor, lookup)?;
    Ok((reg, harness))
}

#[test]
fn test_symbolic_integer_is_boxed() -> GeneralResult<()> {
    let mut a = class("A", Some("java/lang/Object"));
    a.methods.push(method("m", "(Ljava/lang/Integer;)I", true, vec![]));
    let config = Config::new(4, 15);
    let none = Fixed { params : vec![], elements : None };
    let (reg, h) = with_integer(a, "m", "(Ljava/lang/Integer;)I", &config, &none)?;

    let integer = reg.get(INTEGER).ok_or("Integer not in the closure")?;
    let rules : Vec<String> = h.module.rules.iter().map(Rule::to_string).collect();
    assert_eq!(rules, vec![
        format!("init0 -> init1 : new {} {}", integer.id, config.object_base() + integer.size()),
        "init1 -> init2 : Dup 1".to_owned(),
        "init2 -> init3 : push 1 [-8,7]".to_owned(),
        "init3 -> java/lang/Integer.<init>(I)V0 init4 : invoke 2".to_owned(),
        "init4 -> A.m(Ljava/lang/Integer;)I0 init5 : invoke 1".to_owned(),
        "init5 -> - : return".to_owned(),
    ]);
    assert_eq!(h.module.max_stack, 3);

    // a receiver and an int below the box deepen the peak
    let mut b = class("B", Some("java/lang/Object"));
    b.methods.push(method("f", "(ILjava/lang/Integer;)V", false, vec![]));
    let (_, h) = with_integer(b, "f", "(ILjava/lang/Integer;)V", &config, &none)?;
    assert_eq!(h.module.max_stack, 5);
    Ok(())
}

#[test]
fn test_integer_needs_its_constructor() -> GeneralResult<()> {
    let mut a = class("A", Some("java/lang/Object"));
    a.methods.push(method("m", "(Ljava/lang/Integer;)I", true, vec![]));
    let config = Config::new(4, 15);
    let stub = format!("{}{}", config.stub_prefix, INTEGER);
    let mut source = MemorySource::new();
    source.insert(object()).insert(a).insert_as(&stub, class(INTEGER, Some("java/lang/Object")));
    let mut reg = include(&config, &source, "A")?;
    resolve(&mut reg);

    let none = Fixed { params : vec![], elements : None };
    let e = wrap(&config, &reg, "A", "m", "(Ljava/lang/Integer;)I", &none).err().ok_or("harness without a constructor")?;
    assert!(e.to_string().contains("java/lang/Integer.<init>(I)V"), "{}", e);
    Ok(())
}

#[test]
fn test_exhaustive_integer_boxes_every_value() -> GeneralResult<()> {
    let mut a = class("A", Some("java/lang/Object"));
    a.methods.push(method("m", "(Ljava/lang/Integer;)I", true, vec![]));
    let mut config = Config::new(4, 15);
    config.mode = WrapMode::Exhaustive;
    let lookup = Fixed { params : vec![ Some(Range::new(0, 2)) ], elements : None };
    let (_, h) = with_integer(a, "m", "(Ljava/lang/Integer;)I", &config, &lookup)?;

    assert!(h.module.rules.iter().any(|r| matches!(&r.to, Target::Call { callee, .. } if callee == "java/lang/Integer.<init>(I)V0")));
    let m = run_harness(&h.module)?;
    assert_eq!(m.calls, vec![ vec![ "[0]" ], vec![ "[1]" ], vec![ "[2]" ] ]);
    // every box is dropped with the snapshot taken before it
    assert!(m.heap.is_empty());
    assert!(m.snapshots.is_empty());
    Ok(())
}
