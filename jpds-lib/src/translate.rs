use tracing::{debug, warn};

use crate::classfile::{MethodCode, MethodDef};
use crate::closure::{ClassEntry, ClassRegistry};
use crate::config::Config;
use crate::dispatch::{exception_dispatch, field_members, runnable_targets, virtual_targets, CallTarget, Catch};
use crate::error::TranslateError;
use crate::ir::*;
use crate::jvmtypes::args::{count_params, count_returns, field_size, is_void};
use crate::jvmtypes::*;
use crate::label::{self, FreshLabels};
use crate::GeneralResult;

/// The global holding the pending exception, 0 when there is none.
pub const EXCEPTION : &str = "e";

const ASSERTION_ERROR : &str = "java/lang/AssertionError";

/// Module name of a class's static initializer.
pub fn clinit_name(class : &str) -> String {
    label::method_name(class, "<clinit>", "()V")
}

fn category_of(descriptor : &str) -> GeneralResult<Category> {
    let ch = descriptor.chars().next().ok_or_else(|| TranslateError::Descriptor(descriptor.into()))?;
    Ok(Category::from_slots(field_size(ch)?))
}

fn guarded(op : ExprOp, cond : Option<Condition>) -> Expr {
    Expr { op, cond }
}

fn arith_op(op : ArithmeticOperation) -> ArithOp {
    use ArithmeticOperation::*;
    match op {
        Add => ArithOp::Add,
        Sub => ArithOp::Sub,
        Mul => ArithOp::Mul,
        Div => ArithOp::Div,
        Rem => ArithOp::Rem,
        Shl => ArithOp::Shl,
        Shr => ArithOp::Shr,
        Ushr => ArithOp::Ushr,
        And => ArithOp::And,
        Or => ArithOp::Or,
        Xor => ArithOp::Xor,
        Neg => ArithOp::Sub, // handled as a unary op before we get here
    }
}

fn conversion(from : JType, to : JType) -> ExprOp {
    use JType::*;
    let op = match to {
        Byte | Char | Short => ConvertOp::Narrow(to),
        _ if from.is_floating() && !to.is_floating() => ConvertOp::FloatToInt,
        _ if !from.is_floating() && to.is_floating() => ConvertOp::IntToFloat,
        _ => ConvertOp::Resize,
    };
    ExprOp::Convert { op, from : Category::of(from), to : Category::of(to) }
}

/// Translates method bodies of one closure. The return-label counter spans
/// the whole run, so labels never repeat across methods.
pub struct Translator<'a> {
    config : &'a Config,
    registry : &'a ClassRegistry,
    entry_class : String,
    labels : FreshLabels,
}

impl<'a> Translator<'a> {
    pub fn new(config : &'a Config, registry : &'a ClassRegistry, entry_class : &str) -> Self {
        Translator { config, registry, entry_class : entry_class.to_owned(), labels : FreshLabels::new("ret") }
    }

    pub fn translate_method(&mut self, class : &ClassEntry, method : &MethodDef) -> GeneralResult<MethodModule> {
        let name = label::method_name(&class.name, &method.name, &method.descriptor);
        let code = method.code.as_ref()
            .ok_or_else(|| TranslateError::Unsupported(format!("method {} has no code", name)))?;

        let mut module = MethodModule::new(&name);
        module.is_static = method.is_static;
        module.is_synchronized = method.is_synchronized;
        module.is_void = is_void(&method.descriptor)?;
        module.max_stack = code.max_stack;
        module.max_locals = code.max_locals;
        module.lines = code.lines.clone();

        let mut emitter = Emitter {
            tr : self,
            class,
            method,
            code,
            name,
            module,
            subroutines : Vec::new(),
        };
        emitter.run()?;
        debug!(method = %emitter.name, rules = emitter.module.rules.len(), "translated method");
        Ok(emitter.module)
    }
}

struct Emitter<'t, 'a> {
    tr : &'t mut Translator<'a>,
    class : &'t ClassEntry,
    method : &'t MethodDef,
    code : &'t MethodCode,
    name : String,
    module : MethodModule,
    /// return site of every `jsr`, indexed by the value it pushes
    subroutines : Vec<String>,
}

impl<'t, 'a> Emitter<'t, 'a> {
    fn config(&self) -> &'a Config { self.tr.config }
    fn registry(&self) -> &'a ClassRegistry { self.tr.registry }

    fn fresh(&mut self) -> String {
        self.tr.labels.fresh()
    }

    fn at(&self, offset : usize) -> String {
        label::at(&self.name, offset)
    }

    fn next_label(&self, i : usize) -> String {
        let ops = &self.code.ops;
        let offset = match ops.get(i + 1) {
            Some((o, _)) => *o,
            None => ops.get(i).map_or(0, |(o, _)| o + 1),
        };
        self.at(offset)
    }

    fn run(&mut self) -> GeneralResult<()> {
        let code = self.code;
        self.subroutines = code.ops.iter().enumerate()
            .filter(|(_, (_, op))| matches!(op, Operation::Subroutine { .. }))
            .map(|(i, _)| self.next_label(i))
            .collect();

        let mut first = self.at(code.ops.first().map_or(0, |(o, _)| *o));
        if self.method.name == "<clinit>" {
            first = self.clinit_prologue(first);
        }

        for (i, (offset, op)) in code.ops.iter().enumerate() {
            let label = if i == 0 { first.clone() } else { self.at(*offset) };
            let next = self.next_label(i);
            self.translate_op(&label, &next, *offset, op)?;
        }
        Ok(())
    }

    /// Marks the class initialized, then runs the superclass's initializer
    /// if it has not run yet. Returns the label the body starts from.
    fn clinit_prologue(&mut self, mut label : String) -> String {
        let class = self.class;
        if class.name != self.tr.entry_class {
            let store = self.fresh();
            self.module.add_rule(&label, ExprOp::Push { cat : Category::One, value : Value::Int(1) }, &store);
            let after = self.fresh();
            self.module.add_rule(&store, ExprOp::GlobalStore { cat : Category::One, name : class.name.clone() }, &after);
            label = after;
        }

        let parent = class.superclass.as_deref()
            .and_then(|s| self.registry().get(s))
            .filter(|p| p.has_clinit() && p.name != self.tr.entry_class);
        if let Some(parent) = parent {
            let after = self.fresh();
            let callee = label::at(&clinit_name(&parent.name), 0);
            self.module.add_call_rule(&label,
                ExprOp::Invoke { nargs : 0 }.when(Condition::GlobalZero(parent.name.clone())),
                &callee, &after);
            self.module.add_rule(&label,
                ExprOp::Jump(JumpKind::Goto).when(Condition::GlobalOne(parent.name.clone())),
                &after);
            label = after;
        }
        label
    }

    fn translate_op(&mut self, label : &str, next : &str, offset : usize, op : &Operation) -> GeneralResult<()> {
        use Operation::*;

        match op {
            Noop => self.module.add_rule(label, ExprOp::PopPush { pop : 0, push : 0 }, next),
            Constant { value, pooled } => self.constant(label, next, value, *pooled),
            Arithmetic { kind, op : ArithmeticOperation::Neg } =>
                self.module.add_rule(label, ExprOp::Unary { op : UnaryOp::Neg, cat : Category::of(*kind) }, next),
            Arithmetic { kind, op } =>
                self.module.add_rule(label, ExprOp::Arith { op : arith_op(*op), cat : Category::of(*kind), float : kind.is_floating() }, next),
            Increment { index, value } =>
                self.module.add_rule(label, ExprOp::Inc { index : *index, value : i32::from(*value) }, next),
            Conversion { from, to } => self.module.add_rule(label, conversion(*from, *to), next),
            Compare { kind, nans } => {
                let op = match nans {
                    None => ArithOp::Cmp,
                    Some(NanComparisons::Less) => ArithOp::CmpL,
                    Some(NanComparisons::Greater) => ArithOp::CmpG,
                };
                self.module.add_rule(label, ExprOp::Arith { op, cat : Category::of(*kind), float : kind.is_floating() }, next)
            },
            Branch { ops : OperandCount::_1, way, target, .. } => {
                let target = self.at(*target);
                self.module.add_rule(label, ExprOp::If(IfTest::Compare(*way)), &target);
                self.module.add_rule(label, ExprOp::If(IfTest::Compare(way.negate())), next);
            },
            Branch { ops : OperandCount::_2, way, target, .. } => {
                let target = self.at(*target);
                self.module.add_rule(label, ExprOp::IfCmp { cat : Category::One, way : *way }, &target);
                self.module.add_rule(label, ExprOp::IfCmp { cat : Category::One, way : way.negate() }, next);
            },
            Jump { target } => {
                let target = self.at(*target);
                self.module.add_rule(label, ExprOp::Jump(JumpKind::Goto), &target);
            },
            LoadLocal { kind, index } =>
                self.module.add_rule(label, ExprOp::Load { cat : Category::of(*kind), index : *index }, next),
            StoreLocal { kind, index } =>
                self.module.add_rule(label, ExprOp::Store { cat : Category::of(*kind), index : *index }, next),
            StackOp { op : StackOperation::Pop, size } =>
                self.module.add_rule(label, ExprOp::PopPush { pop : *size as u8, push : 0 }, next),
            StackOp { op : StackOperation::Swap, .. } => self.module.add_rule(label, ExprOp::Swap, next),
            StackOp { op, size } => self.module.add_rule(label, ExprOp::Dup { op : *op, size : *size as u8 }, next),
            LoadArray(kind) => self.array_access(label, next, ExprOp::ArrayLoad(Category::of(*kind)), 1),
            StoreArray(kind) => {
                let cat = Category::of(*kind);
                self.array_access(label, next, ExprOp::ArrayStore(cat), cat.slots() + 1)
            },
            Length => {
                self.check(label, ExprOp::NpeCheck { depth : 0 }, label::npe(label));
                self.module.add_rule(label, ExprOp::ArrayLength, next);
            },
            Allocation(kind) => self.allocation(label, next, kind),
            VarAction { op, kind : VarKind::Field, field } => self.instance_field(label, next, *op, field)?,
            VarAction { op, kind : VarKind::Static, field } => self.static_field(label, next, *op, field)?,
            Invocation { kind, method } => self.invocation(label, next, offset, *kind, method)?,
            CheckCast { class } => {
                let reg = self.registry();
                if reg.contains(class) {
                    let mut ids = reg.castable_ids(class);
                    ids.insert(0);
                    self.module.add_rule(label, ExprOp::Jump(JumpKind::Goto).when(Condition::Contains(ids)), next);
                } else {
                    self.module.add_rule(label, ExprOp::Jump(JumpKind::Goto), next);
                }
            },
            InstanceOf { class } => {
                let ids = self.registry().castable_ids(class);
                // header slot 0 holds the class id
                let loaded = self.fresh();
                self.interleaved(label, ExprOp::FieldLoad { cat : Category::One, id : 0 }, &loaded);
                self.module.add_rule(&loaded, ExprOp::Unary { op : UnaryOp::Contains(ids), cat : Category::One }, next);
            },
            Throw => self.dispatch_exception(label, offset),
            Monitor(op) => {
                let expr = match op {
                    MonitorOp::Enter => ExprOp::MonitorEnter,
                    MonitorOp::Exit => ExprOp::MonitorExit,
                };
                if self.config().multithreading() {
                    self.interleaved(label, expr, next);
                } else {
                    self.module.add_rule(label, ExprOp::PopPush { pop : 1, push : 0 }, next);
                }
            },
            Switch(params) => self.switch(label, params),
            Subroutine { target } => {
                let index = self.subroutines.iter().position(|l| l == next)
                    .ok_or_else(|| TranslateError::Unsupported(format!("jsr at {}", label)))?;
                let jump = self.fresh();
                self.module.add_rule(label, ExprOp::Push { cat : Category::One, value : Value::Int(index as i32) }, &jump);
                let target = self.at(*target);
                self.module.add_rule(&jump, ExprOp::Jump(JumpKind::Goto), &target);
            },
            SubroutineReturn { index } => {
                if self.subroutines.is_empty() {
                    return Err(TranslateError::Unsupported(format!("ret without jsr at {}", label)).into());
                }
                let select = self.fresh();
                self.module.add_rule(label, ExprOp::Load { cat : Category::One, index : *index }, &select);
                for (i, site) in self.subroutines.clone().iter().enumerate() {
                    self.module.add_rule(&select, ExprOp::If(IfTest::Is(i as i32)), site);
                }
            },
            Yield { kind : JType::Void } => self.leave(label, None),
            Yield { kind } => self.leave(label, Some(Category::of(*kind))),

            Unhandled(..) =>
                return Err(TranslateError::Unsupported(format!("unhandled operation {:?}", op)).into()),
        }
        Ok(())
    }

    fn error_loop(&mut self, label : &str) {
        self.module.add_rule(label, ExprOp::Error, label);
    }

    /// A check rule diverting to an error label that loops forever.
    fn check(&mut self, label : &str, op : ExprOp, error : String) {
        self.module.add_rule(label, op, &error);
        self.error_loop(&error);
    }

    fn interleaved(&mut self, from : &str, expr : impl Into<Expr>, to : &str) {
        if self.config().shared_rules() {
            self.module.add_shared_rule(from, expr, to);
        } else {
            self.module.add_rule(from, expr, to);
        }
    }

    fn needs_clinit(&self, class : &str) -> bool {
        class != self.tr.entry_class
            && !(self.method.name == "<clinit>" && self.class.name == class)
            && self.registry().get(class).map_or(false, ClassEntry::has_clinit)
    }

    /// Where an operation that needs `class` initialized runs from: the label
    /// the initializer returns to, then the instruction itself once the class
    /// is initialized. The initializer call rule is emitted first.
    fn clinit_entries(&mut self, label : &str, class : &str) -> Vec<(String, Option<Condition>)> {
        if !self.needs_clinit(class) {
            return vec![ (label.to_owned(), None) ];
        }
        let ret = self.fresh();
        let callee = label::at(&clinit_name(class), 0);
        self.module.add_call_rule(label,
            ExprOp::Invoke { nargs : 0 }.when(Condition::GlobalZero(class.to_owned())),
            &callee, &ret);
        vec![
            (ret, None),
            (label.to_owned(), Some(Condition::GlobalOne(class.to_owned()))),
        ]
    }

    fn with_clinit(&mut self, label : &str, next : &str, class : &str, op : ExprOp) {
        for (from, cond) in self.clinit_entries(label, class) {
            self.module.add_rule(&from, guarded(op.clone(), cond), next);
        }
    }

    fn constant(&mut self, label : &str, next : &str, value : &Literal, pooled : bool) {
        use Category::*;
        let config = self.config();
        let (cat, value) = match value {
            Literal::Null => (One, Value::Int(0)),
            Literal::Int(v) => {
                let v = match *v {
                    i32::MAX if pooled && config.nondet => config.int_max() as i32,
                    i32::MIN if pooled && config.nondet => config.int_min() as i32,
                    v => v,
                };
                (One, Value::Int(v))
            },
            // longs share the integer domain
            Literal::Long(v) => (Two, Value::Int(*v as i32)),
            Literal::Float(v) => (One, Value::Float(f64::from(*v))),
            Literal::Double(v) => (Two, Value::Float(*v)),
            Literal::Str(s) => (One, Value::Str(s.clone())),
            Literal::Class(c) => (One, Value::Int(self.registry().id_of(c).unwrap_or(0) as i32)),
        };
        self.module.add_rule(label, ExprOp::Push { cat, value }, next);
    }

    fn array_access(&mut self, label : &str, next : &str, op : ExprOp, depth : u8) {
        self.check(label, ExprOp::NpeCheck { depth }, label::npe(label));
        self.check(label, ExprOp::IoobCheck { depth }, label::ioob(label));
        self.module.add_rule(label, op, next);
    }

    fn allocation(&mut self, label : &str, next : &str, kind : &AllocationKind) {
        let reg = self.registry();
        match kind {
            AllocationKind::Element { class } if class == ASSERTION_ERROR => {
                let failed = label::assertion(label);
                self.module.add_rule(label, ExprOp::Jump(JumpKind::Goto), &failed);
                self.error_loop(&failed);
            },
            AllocationKind::Element { class } => {
                let entry = match reg.get(class) {
                    Some(e) => e,
                    None => {
                        warn!(class = %class, at = label, line = ?self.module.source_line(label), "allocating a class outside the closure");
                        self.module.add_rule(label, ExprOp::PopPush { pop : 0, push : 1 }, next);
                        return;
                    },
                };
                let new = ExprOp::New { id : entry.id, size : self.config().object_base() + entry.size() };
                self.check(label, ExprOp::HeapOverflow(Box::new(new.clone())), label::heap_overflow(label));
                self.with_clinit(label, next, class, new);
            },
            AllocationKind::Array { class, dims } => {
                let mut types = Vec::new();
                let mut name = class.as_str();
                for _ in 0..*dims {
                    types.push(reg.id_of(name).unwrap_or(0));
                    name = name.strip_prefix('[').unwrap_or(name);
                }
                let op = ExprOp::NewArray { dims : *dims, types, init : Value::Int(0) };
                self.check(label, ExprOp::HeapOverflow(Box::new(op.clone())), label::heap_overflow(label));
                self.module.add_rule(label, op, next);
            },
        }
    }

    fn instance_field(&mut self, label : &str, next : &str, op : VarOp, field : &MemberRef) -> GeneralResult<()> {
        let cat = category_of(&field.descriptor)?;
        let get = op == VarOp::Get;
        self.check(label, ExprOp::NpeCheck { depth : if get { 0 } else { cat.slots() } }, label::npe(label));

        let reg = self.registry();
        let members = reg.index_of(&field.class)
            .and_then(|index| reg.field_owner(index, &field.name).map(|owner| (index, owner)))
            .map(|(index, owner)| field_members(reg, index, &reg.entry(owner).name, &field.name))
            .unwrap_or_default();

        if members.is_empty() {
            warn!(class = %field.class, field = %field.name, line = ?self.module.source_line(label), "field outside the closure; erasing its value");
            let erase = if get {
                ExprOp::PopPush { pop : 1, push : cat.slots() }
            } else {
                ExprOp::PopPush { pop : 1 + cat.slots(), push : 0 }
            };
            self.module.add_rule(label, erase, next);
            return Ok(());
        }

        let base = self.config().object_base();
        let make = |id : u32| if get {
            ExprOp::FieldLoad { cat, id : base + id }
        } else {
            ExprOp::FieldStore { cat, id : base + id }
        };
        if let [ (_, id) ] = members.as_slice() {
            self.module.add_rule(label, make(*id), next);
        } else {
            for (member, id) in members {
                self.module.add_rule(label, make(id).when(Condition::Contains(id_set(vec![ member ]))), next);
            }
        }
        Ok(())
    }

    fn static_field(&mut self, label : &str, next : &str, op : VarOp, field : &MemberRef) -> GeneralResult<()> {
        let cat = category_of(&field.descriptor)?;
        let get = op == VarOp::Get;
        let entry = match self.registry().static_field(&field.class, &field.name) {
            Some(e) => e,
            None => {
                warn!(class = %field.class, field = %field.name, line = ?self.module.source_line(label), "static field outside the closure; erasing its value");
                let erase = if get {
                    ExprOp::PopPush { pop : 0, push : cat.slots() }
                } else {
                    ExprOp::PopPush { pop : cat.slots(), push : 0 }
                };
                self.module.add_rule(label, erase, next);
                return Ok(());
            },
        };
        let name = entry.global_name();
        let expr = match (get, entry.is_final) {
            (true, true) => ExprOp::ConstLoad { cat, name },
            (false, true) => ExprOp::ConstStore { cat, name },
            (true, false) => ExprOp::GlobalLoad { cat, name },
            (false, false) => ExprOp::GlobalStore { cat, name },
        };
        self.with_clinit(label, next, &entry.owner, expr);
        Ok(())
    }

    fn switch(&mut self, label : &str, params : &SwitchParams) {
        match params {
            SwitchParams::Lookup { default, pairs } => {
                for (value, target) in pairs {
                    let target = self.at(*target);
                    self.module.add_rule(label, ExprOp::If(IfTest::Is(*value)), &target);
                }
                let values = pairs.iter().map(|(v, _)| *v).collect();
                let default = self.at(*default);
                self.module.add_rule(label, ExprOp::If(IfTest::NotIn(values)), &default);
            },
            SwitchParams::Table { default, low, high, targets } => {
                for (i, target) in targets.iter().enumerate() {
                    let target = self.at(*target);
                    self.module.add_rule(label, ExprOp::If(IfTest::Is(low + i as i32)), &target);
                }
                let default = self.at(*default);
                self.module.add_rule(label, ExprOp::If(IfTest::Outside { low : *low, high : *high }), &default);
            },
        }
    }

    /// Leaves the method, releasing the monitor of a synchronized instance
    /// method first when threads are modeled.
    fn leave(&mut self, label : &str, value : Option<Category>) {
        let mut from = label.to_owned();
        if self.method.is_synchronized && !self.method.is_static && self.config().multithreading() {
            let this = self.fresh();
            self.module.add_rule(&from, ExprOp::Load { cat : Category::One, index : 0 }, &this);
            let exit = self.fresh();
            self.interleaved(&this, ExprOp::MonitorExit, &exit);
            from = exit;
        }
        self.module.add_return_rule(&from, ExprOp::Return(value));
    }

    /// Routes the exception on top of the stack at `label` to the handlers
    /// covering `offset`, or stores it and leaves the method.
    fn dispatch_exception(&mut self, label : &str, offset : usize) {
        let catches = exception_dispatch(self.registry(), &self.code.handlers, offset);
        for c in catches {
            match c {
                Catch::Handler { target, cond } => {
                    let target = self.at(target);
                    self.module.add_rule(label, ExprOp::Jump(JumpKind::Throw).when(cond), &target);
                },
                Catch::Propagate(cond) => {
                    let store = self.fresh();
                    self.module.add_rule(label, ExprOp::Jump(JumpKind::Goto).when(cond), &store);
                    let out = self.fresh();
                    self.module.add_rule(&store, ExprOp::GlobalStore { cat : Category::One, name : EXCEPTION.into() }, &out);
                    self.leave(&out, None);
                },
            }
        }
    }

    /// The epilogue every call returns into: continue when no exception is
    /// pending, otherwise dispatch it as if thrown here.
    fn after_call(&mut self, ret : &str, next : &str, offset : usize, returns : u8) {
        let pending = self.fresh();
        self.module.add_rule(ret, ExprOp::GlobalLoad { cat : Category::One, name : EXCEPTION.into() }, &pending);
        let clear = self.fresh();
        self.module.add_rule(&pending, ExprOp::Jump(JumpKind::Goto).when(Condition::Contains(id_set(vec![ 0 ]))), &clear);
        self.dispatch_exception(&pending, offset);
        if returns == 0 {
            self.module.add_rule(&clear, ExprOp::PopPush { pop : 1, push : 0 }, next);
        } else {
            let value = self.fresh();
            self.module.add_rule(&clear, ExprOp::PopPush { pop : 1, push : 0 }, &value);
            self.module.add_rule(&value, ExprOp::GetReturn(Category::from_slots(returns)), next);
        }
    }

    fn call_targets(&self, kind : InvokeKind, m : &MemberRef) -> Vec<CallTarget> {
        let reg = self.registry();
        let index = match reg.index_of(&m.class) {
            Some(i) => i,
            None => return vec![],
        };
        match kind {
            InvokeKind::Virtual | InvokeKind::Interface(_) => virtual_targets(reg, index, &m.name, &m.descriptor),
            _ => reg.find_method_owner(index, &m.name, &m.descriptor)
                .map(|owner| vec![ CallTarget { owner, ids : id_set(vec![ reg.entry(owner).id ]) } ])
                .unwrap_or_default(),
        }
    }

    fn invocation(&mut self, label : &str, next : &str, offset : usize, kind : InvokeKind, m : &MemberRef) -> GeneralResult<()> {
        if kind == InvokeKind::Dynamic {
            return Err(TranslateError::Unsupported("invokedynamic".into()).into());
        }
        if self.bypass(label, next, offset, kind, m)? {
            return Ok(());
        }

        let params = count_params(&m.descriptor)?;
        let returns = count_returns(&m.descriptor)?;
        let is_static = kind == InvokeKind::Static;
        let nargs = params + if is_static { 0 } else { 1 };
        if matches!(kind, InvokeKind::Virtual | InvokeKind::Interface(_)) {
            self.check(label, ExprOp::NpeCheck { depth : params }, label::npe(label));
        }

        let targets = self.call_targets(kind, m);
        if targets.is_empty() {
            warn!(method = %label::method_name(&m.class, &m.name, &m.descriptor), line = ?self.module.source_line(label), "method outside the closure; erasing the call");
            self.module.add_rule(label, ExprOp::PopPush { pop : nargs, push : returns }, next);
            return Ok(());
        }

        let reg = self.registry();
        let ret = self.fresh();
        let entries = if is_static {
            self.clinit_entries(label, &reg.entry(targets[0].owner).name)
        } else {
            vec![ (label.to_owned(), None) ]
        };
        let single = targets.len() == 1;
        for (from, init) in entries {
            for t in &targets {
                let owner = reg.entry(t.owner);
                let callee = label::at(&label::method_name(&owner.name, &m.name, &m.descriptor), 0);
                let cond = if single { init.clone() } else { Some(Condition::Contains(t.ids.clone())) };
                let synchronized = owner.method(&m.name, &m.descriptor).map_or(false, |d| d.is_synchronized);
                if synchronized && !is_static && self.config().multithreading() {
                    let call = self.fresh();
                    self.interleaved(&from, guarded(ExprOp::MonitorTouch { depth : params }, cond), &call);
                    self.module.add_call_rule(&call, ExprOp::Invoke { nargs }, &callee, &ret);
                } else {
                    self.module.add_call_rule(&from, guarded(ExprOp::Invoke { nargs }, cond), &callee, &ret);
                }
            }
        }
        self.after_call(&ret, next, offset, returns);
        Ok(())
    }

    /// Calls modeled without a class file. Returns whether `m` was handled.
    fn bypass(&mut self, label : &str, next : &str, offset : usize, kind : InvokeKind, m : &MemberRef) -> GeneralResult<bool> {
        match (m.class.as_str(), m.name.as_str()) {
            ("java/io/PrintStream", "print") | ("java/io/PrintStream", "println") => {
                let kind = match m.descriptor.as_str() {
                    "()V" => None,
                    "(I)V" | "(J)V" => Some(PrintKind::Int),
                    "(F)V" | "(D)V" => Some(PrintKind::Float),
                    "(C)V" => Some(PrintKind::Char),
                    "(Ljava/lang/String;)V" => Some(PrintKind::Str),
                    _ => return Ok(false),
                };
                self.module.add_rule(label, ExprOp::Print { kind, newline : m.name == "println" }, next);
                return Ok(true);
            },
            ("org/junit/Assert", "assertTrue") if m.descriptor == "(Z)V" => {
                self.assertion(label, label, next, true);
                return Ok(true);
            },
            ("org/junit/Assert", "assertFalse") if m.descriptor == "(Z)V" => {
                self.assertion(label, label, next, false);
                return Ok(true);
            },
            ("org/junit/Assert", "assertEquals") if m.descriptor == "(Ljava/lang/Object;Ljava/lang/Object;)V" => {
                let compared = self.fresh();
                let equals = MemberRef::new("java/lang/Object", "equals", "(Ljava/lang/Object;)Z");
                self.invocation(label, &compared, offset, InvokeKind::Virtual, &equals)?;
                self.assertion(&compared, label, next, true);
                return Ok(true);
            },
            ("java/lang/Math", "random") if m.descriptor == "()D" => {
                let range = Value::FloatRange { min : 0.0, max : 1.0 };
                self.module.add_rule(label, ExprOp::Push { cat : Category::Two, value : range }, next);
                return Ok(true);
            },
            _ => {},
        }

        if matches!(kind, InvokeKind::Interface(_)) && m.is("java/lang/Runnable", "run", "()V") && self.config().multithreading() {
            let reg = self.registry();
            let targets = runnable_targets(reg);
            if targets.is_empty() {
                return Ok(false);
            }
            self.check(label, ExprOp::NpeCheck { depth : 0 }, label::npe(label));
            for (id, owner) in targets {
                let run = label::at(&label::method_name(&reg.entry(owner).name, "run", "()V"), 0);
                self.module.add_dynamic_rule(label,
                    ExprOp::Fork { nargs : 1 }.when(Condition::Contains(id_set(vec![ id ]))),
                    next, &run);
            }
            return Ok(true);
        }

        // final methods of java/lang/Object, whatever the receiver's static type
        if kind != InvokeKind::Virtual {
            return Ok(false);
        }
        let threads = self.config().multithreading();
        match (m.name.as_str(), m.descriptor.as_str()) {
            ("getClass", "()Ljava/lang/Class;") => {
                self.check(label, ExprOp::NpeCheck { depth : 0 }, label::npe(label));
                self.module.add_rule(label, ExprOp::FieldLoad { cat : Category::One, id : 0 }, next);
            },
            ("wait", "()V") => {
                self.check(label, ExprOp::NpeCheck { depth : 0 }, label::npe(label));
                let waiting = self.fresh();
                if threads {
                    self.interleaved(label, ExprOp::WaitInvoke, &waiting);
                    self.interleaved(&waiting, ExprOp::WaitReturn, next);
                } else {
                    // nobody can notify a lone thread
                    self.module.add_rule(label, ExprOp::PopPush { pop : 1, push : 0 }, &waiting);
                    self.module.add_rule(&waiting, ExprOp::Jump(JumpKind::Goto), &waiting);
                }
            },
            ("notify", "()V") | ("notifyAll", "()V") => {
                self.check(label, ExprOp::NpeCheck { depth : 0 }, label::npe(label));
                if threads {
                    self.interleaved(label, ExprOp::Notify { all : m.name == "notifyAll" }, next);
                } else {
                    self.module.add_rule(label, ExprOp::PopPush { pop : 1, push : 0 }, next);
                }
            },
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Continues at `next` when the popped boolean is `expected`, otherwise
    /// fails at the assertion label of `site`.
    fn assertion(&mut self, from : &str, site : &str, next : &str, expected : bool) {
        let (pass, fail) = if expected {
            (Comparison::Ne, Comparison::Eq)
        } else {
            (Comparison::Eq, Comparison::Ne)
        };
        self.module.add_rule(from, ExprOp::If(IfTest::Compare(pass)), next);
        let failed = label::assertion(site);
        self.module.add_rule(from, ExprOp::If(IfTest::Compare(fail)), &failed);
        self.error_loop(&failed);
    }
}

#[cfg(test)]
use crate::classfile::{ClassDef, Handler};
#[cfg(test)]
use crate::classpath::MemorySource;
#[cfg(test)]
use crate::closure::{fixtures::*, include};
#[cfg(test)]
use crate::hierarchy::resolve;

#[cfg(test)]
fn registry_of(config : &Config, classes : Vec<ClassDef>, entry : &str) -> GeneralResult<ClassRegistry> {
    let mut source = MemorySource::new();
    source.insert(object());
    for c in classes {
        source.insert(c);
    }
    let mut reg = include(config, &source, entry)?;
    resolve(&mut reg);
    Ok(reg)
}

#[cfg(test)]
fn rules_of(config : &Config, reg : &ClassRegistry, entry : &str, class : &str, method : &str, descriptor : &str) -> GeneralResult<Vec<String>> {
    let c = reg.get(class).ok_or("missing class")?;
    let m = c.method(method, descriptor).ok_or("missing method")?;
    let module = Translator::new(config, reg, entry).translate_method(c, m)?;
    Ok(module.rules.iter().map(Rule::to_string).collect())
}

#[test]
fn test_branches_and_returns() -> GeneralResult<()> {
    use Operation::*;
    let mut a = class("A", Some("java/lang/Object"));
    a.methods.push(method("f", "(I)I", true, vec![
        LoadLocal { kind : JType::Int, index : 0 },
        Branch { kind : JType::Int, ops : OperandCount::_1, way : Comparison::Eq, target : 4 },
        Constant { value : Literal::Int(1), pooled : false },
        Yield { kind : JType::Int },
        Constant { value : Literal::Int(i32::MAX), pooled : true },
        Yield { kind : JType::Int },
    ]));
    let config = Config::new(4, 15);
    let reg = registry_of(&config, vec![ a ], "A")?;
    assert_eq!(rules_of(&config, &reg, "A", "A", "f", "(I)I")?, vec![
        "A.f(I)I0 -> A.f(I)I1 : load 1 0",
        "A.f(I)I1 -> A.f(I)I4 : if Eq",
        "A.f(I)I1 -> A.f(I)I2 : if Ne",
        "A.f(I)I2 -> A.f(I)I3 : push 1 1",
        "A.f(I)I3 -> - : return 1",
        "A.f(I)I4 -> A.f(I)I5 : push 1 7",
        "A.f(I)I5 -> - : return 1",
    ]);
    Ok(())
}

#[test]
fn test_virtual_call_dispatch() -> GeneralResult<()> {
    use Operation::*;
    let call = |class : &str| Invocation { kind : InvokeKind::Virtual, method : MemberRef::new(class, "speak", "()I") };
    let mut animal = class("Animal", Some("java/lang/Object"));
    animal.methods.push(method("speak", "()I", false, vec![]));
    animal.methods.push(method("main", "()V", true, vec![
        Allocation(AllocationKind::Element { class : "Dog".into() }),
        call("Animal"),
        Allocation(AllocationKind::Element { class : "Puppy".into() }),
        call("Puppy"),
        Yield { kind : JType::Void },
    ]));
    let mut dog = class("Dog", Some("Animal"));
    dog.methods.push(method("speak", "()I", false, vec![]));
    let puppy = class("Puppy", Some("Dog"));

    let config = Config::new(4, 15);
    let reg = registry_of(&config, vec![ animal, dog, puppy ], "Animal")?;
    let id = |n : &str| reg.id_of(n).unwrap_or(0);
    let rules = rules_of(&config, &reg, "Animal", "Animal", "main", "()V")?;

    let at1 : Vec<_> = rules.iter().filter(|r| r.starts_with("Animal.main()V1 ->")).cloned().collect();
    assert_eq!(at1, vec![
        "Animal.main()V1 -> Animal.main()V1_NPE : npe 0".to_owned(),
        format!("Animal.main()V1 -> Animal.speak()I0 ret0 : invoke 1 if in {{{}}}", id("Animal")),
        format!("Animal.main()V1 -> Dog.speak()I0 ret0 : invoke 1 if in {{{},{}}}", id("Dog"), id("Puppy")),
    ]);
    assert!(rules.contains(&"ret0 -> ret1 : globalload 1 e".to_owned()));
    assert!(rules.contains(&"ret1 -> ret2 : jump if in {0}".to_owned()));
    assert!(rules.contains(&"ret2 -> ret5 : poppush 1 0".to_owned()));
    assert!(rules.contains(&"ret5 -> Animal.main()V2 : getreturn 1".to_owned()));

    // a single candidate needs no guard
    let at3 : Vec<_> = rules.iter().filter(|r| r.starts_with("Animal.main()V3 ->") && r.contains("invoke")).collect();
    assert_eq!(at3, vec![ "Animal.main()V3 -> Dog.speak()I0 ret6 : invoke 1" ]);
    Ok(())
}

#[test]
fn test_static_initializer_interleave() -> GeneralResult<()> {
    use Operation::*;
    let mut a = class("A", Some("java/lang/Object"));
    a.methods.push(method("main", "()V", true, vec![
        VarAction { op : VarOp::Get, kind : VarKind::Static, field : MemberRef::new("B", "x", "I") },
        Yield { kind : JType::Void },
    ]));
    a.methods.push(method("<clinit>", "()V", true, vec![ Yield { kind : JType::Void } ]));
    let mut b = class("B", Some("java/lang/Object"));
    b.fields.push(field("x", "I", true));
    b.methods.push(method("<clinit>", "()V", true, vec![ Yield { kind : JType::Void } ]));
    let mut c = class("C", Some("B"));
    c.methods.push(method("<clinit>", "()V", true, vec![ Yield { kind : JType::Void } ]));
    a.methods[0].code.as_mut().ok_or("no code")?.ops.push((2, Allocation(AllocationKind::Element { class : "C".into() })));

    let config = Config::new(4, 15);
    let reg = registry_of(&config, vec![ a, b, c ], "A")?;
    let rules = rules_of(&config, &reg, "A", "A", "main", "()V")?;
    assert_eq!(&rules[..3], &[
        "A.main()V0 -> B.<clinit>()V0 ret0 : invoke 0 if B == 0",
        "ret0 -> A.main()V1 : globalload 1 B.x",
        "A.main()V0 -> A.main()V1 : globalload 1 B.x if B == 1",
    ]);

    // the entry class runs no prologue; others set their flag and run their parent's
    assert_eq!(rules_of(&config, &reg, "A", "A", "<clinit>", "()V")?, vec![ "A.<clinit>()V0 -> - : return" ]);
    assert_eq!(rules_of(&config, &reg, "A", "C", "<clinit>", "()V")?, vec![
        "C.<clinit>()V0 -> ret0 : push 1 1",
        "ret0 -> ret1 : globalstore 1 C",
        "ret1 -> B.<clinit>()V0 ret2 : invoke 0 if B == 0",
        "ret1 -> ret2 : jump if B == 1",
        "ret2 -> - : return",
    ]);
    Ok(())
}

#[test]
fn test_array_and_field_checks() -> GeneralResult<()> {
    use Operation::*;
    let mut a = class("A", Some("java/lang/Object"));
    a.fields.push(field("v", "J", false));
    a.methods.push(method("f", "()V", false, vec![
        LoadArray(JType::Int),
        VarAction { op : VarOp::Put, kind : VarKind::Field, field : MemberRef::new("A", "v", "J") },
        VarAction { op : VarOp::Get, kind : VarKind::Field, field : MemberRef::new("Gone", "w", "I") },
        Yield { kind : JType::Void },
    ]));
    let mut config = Config::new(4, 15);
    config.ignored_prefixes.push("Gone".into());
    let reg = registry_of(&config, vec![ a ], "A")?;
    assert_eq!(rules_of(&config, &reg, "A", "A", "f", "()V")?, vec![
        "A.f()V0 -> A.f()V0_NPE : npe 1",
        "A.f()V0_NPE -> A.f()V0_NPE : error",
        "A.f()V0 -> A.f()V0_IOOB : ioob 1",
        "A.f()V0_IOOB -> A.f()V0_IOOB : error",
        "A.f()V0 -> A.f()V1 : arrayload 1",
        "A.f()V1 -> A.f()V1_NPE : npe 2",
        "A.f()V1_NPE -> A.f()V1_NPE : error",
        "A.f()V1 -> A.f()V2 : fieldstore 2 1",
        "A.f()V2 -> A.f()V2_NPE : npe 0",
        "A.f()V2_NPE -> A.f()V2_NPE : error",
        "A.f()V2 -> A.f()V3 : poppush 1 1",
        "A.f()V3 -> - : return",
    ]);
    Ok(())
}

#[test]
fn test_subroutines_and_switches() -> GeneralResult<()> {
    use Operation::*;
    let mut a = class("A", Some("java/lang/Object"));
    a.methods.push(method("f", "(I)V", true, vec![
        Subroutine { target : 3 },
        Switch(SwitchParams::Table { default : 6, low : 1, high : 2, targets : vec![ 5, 6 ] }),
        Switch(SwitchParams::Lookup { default : 6, pairs : vec![ (7, 5) ] }),
        StoreLocal { kind : JType::Object, index : 1 },
        SubroutineReturn { index : 1 },
        Yield { kind : JType::Void },
        Yield { kind : JType::Void },
    ]));
    let config = Config::new(4, 15);
    let reg = registry_of(&config, vec![ a ], "A")?;
    assert_eq!(rules_of(&config, &reg, "A", "A", "f", "(I)V")?, vec![
        "A.f(I)V0 -> ret0 : push 1 0",
        "ret0 -> A.f(I)V3 : jump",
        "A.f(I)V1 -> A.f(I)V5 : if is 1",
        "A.f(I)V1 -> A.f(I)V6 : if is 2",
        "A.f(I)V1 -> A.f(I)V6 : if outside [1,2]",
        "A.f(I)V2 -> A.f(I)V5 : if is 7",
        "A.f(I)V2 -> A.f(I)V6 : if notin {7}",
        "A.f(I)V3 -> A.f(I)V4 : store 1 1",
        "A.f(I)V4 -> ret1 : load 1 1",
        "ret1 -> A.f(I)V1 : if is 0",
        "A.f(I)V5 -> - : return",
        "A.f(I)V6 -> - : return",
    ]);

    let mut b = class("B", Some("java/lang/Object"));
    b.methods.push(method("g", "()V", true, vec![ SubroutineReturn { index : 0 } ]));
    let reg = registry_of(&config, vec![ b ], "B")?;
    let err = rules_of(&config, &reg, "B", "B", "g", "()V").err().map(|e| e.to_string());
    assert!(err.map_or(false, |e| e.contains("ret without jsr")));
    Ok(())
}

#[test]
fn test_throw_reaches_handlers() -> GeneralResult<()> {
    use Operation::*;
    let mut a = class("A", Some("java/lang/Object"));
    let mut m = method("f", "()V", true, vec![
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

    let config = Config::new(4, 15);
    let reg = registry_of(&config, vec![ a, e, f ], "A")?;
    let id = |n : &str| reg.id_of(n).unwrap_or(0);
    let rules = rules_of(&config, &reg, "A", "A", "f", "()V")?;
    let thrown : Vec<_> = rules.iter().filter(|r| r.starts_with("A.f()V1 ->")).collect();
    let mut castable = vec![ id("E"), id("F") ];
    castable.sort_unstable();
    assert_eq!(thrown, vec![
        &format!("A.f()V1 -> A.f()V2 : throw if in {{{},{}}}", castable[0], castable[1]),
        &format!("A.f()V1 -> ret0 : jump if notin {{0,{},{}}}", castable[0], castable[1]),
    ]);
    assert!(rules.contains(&"ret0 -> ret1 : globalstore 1 e".to_owned()));
    assert!(rules.contains(&"ret1 -> - : return".to_owned()));
    Ok(())
}

#[test]
fn test_monitors_and_threads() -> GeneralResult<()> {
    use Operation::*;
    let mut a = class("A", Some("java/lang/Object"));
    a.interfaces.push("java/lang/Runnable".into());
    a.methods.push(method("run", "()V", false, vec![
        Monitor(MonitorOp::Enter),
        Invocation { kind : InvokeKind::Interface(1), method : MemberRef::new("java/lang/Runnable", "run", "()V") },
        Invocation { kind : InvokeKind::Virtual, method : MemberRef::new("A", "notifyAll", "()V") },
        Yield { kind : JType::Void },
    ]));
    let runnable = interface("java/lang/Runnable");

    let single = Config::new(4, 15);
    let reg = registry_of(&single, vec![ a.clone(), runnable.clone() ], "A")?;
    let rules = rules_of(&single, &reg, "A", "A", "run", "()V")?;
    assert!(rules.contains(&"A.run()V0 -> A.run()V1 : poppush 1 0".to_owned()));
    assert!(rules.contains(&"A.run()V2 -> A.run()V3 : poppush 1 0".to_owned()));

    let mut threads = Config::new(4, 15);
    threads.thread_bound = 2;
    let reg = registry_of(&threads, vec![ a, runnable ], "A")?;
    let rules = rules_of(&threads, &reg, "A", "A", "run", "()V")?;
    let id = reg.id_of("A").unwrap_or(0);
    assert!(rules.contains(&"shared A.run()V0 -> A.run()V1 : monitorenter".to_owned()));
    assert!(rules.contains(&format!("A.run()V1 -> A.run()V2 |> A.run()V0 : fork 1 if in {{{}}}", id)));
    assert!(rules.contains(&"shared A.run()V2 -> A.run()V3 : notifyall".to_owned()));

    // without context switches the monitor rules stay, but untagged
    threads.context_switches = false;
    let rules = rules_of(&threads, &reg, "A", "A", "run", "()V")?;
    assert!(rules.contains(&"A.run()V0 -> A.run()V1 : monitorenter".to_owned()));
    assert!(rules.contains(&"A.run()V2 -> A.run()V3 : notifyall".to_owned()));
    assert!(!rules.iter().any(|r| r.starts_with("shared ")));
    Ok(())
}

#[test]
fn test_synchronized_calls_match_explicit_monitors() -> GeneralResult<()> {
    use Operation::*;
    let mut a = class("A", Some("java/lang/Object"));
    let mut locked = method("locked", "()V", false, vec![ Yield { kind : JType::Void } ]);
    locked.is_synchronized = true;
    a.methods.push(locked);
    a.methods.push(method("main", "()V", true, vec![
        Allocation(AllocationKind::Element { class : "A".into() }),
        Monitor(MonitorOp::Enter),
        Invocation { kind : InvokeKind::Virtual, method : MemberRef::new("A", "locked", "()V") },
        Yield { kind : JType::Void },
    ]));

    let mut config = Config::new(4, 15);
    config.thread_bound = 2;
    config.context_switches = false;
    let reg = registry_of(&config, vec![ a ], "A")?;
    let rules = rules_of(&config, &reg, "A", "A", "main", "()V")?;
    assert!(rules.contains(&"A.main()V1 -> A.main()V2 : monitorenter".to_owned()));
    assert!(rules.iter().any(|r| r.starts_with("A.main()V2 -> ") && r.ends_with(": monitortouch 0")));
    assert!(!rules.iter().any(|r| r.contains(": poppush 1 0")));
    Ok(())
}

#[test]
fn test_instanceof_reads_the_class_id() -> GeneralResult<()> {
    use Operation::*;
    let mut a = class("A", Some("java/lang/Object"));
    a.methods.push(method("f", "()I", true, vec![
        InstanceOf { class : "B".into() },
        Yield { kind : JType::Int },
    ]));
    a.methods.push(method("g", "()V", true, vec![
        Allocation(AllocationKind::Element { class : "C".into() }),
        Yield { kind : JType::Void },
    ]));
    let b = class("B", Some("java/lang/Object"));
    let c = class("C", Some("B"));

    let mut config = Config::new(4, 15);
    let reg = registry_of(&config, vec![ a.clone(), b.clone(), c.clone() ], "A")?;
    let (b_id, c_id) = (reg.id_of("B").ok_or("missing B")?, reg.id_of("C").ok_or("missing C")?);
    let ids = format!("{},{}", b_id.min(c_id), b_id.max(c_id));
    assert_eq!(&rules_of(&config, &reg, "A", "A", "f", "()I")?[..2], &[
        "A.f()I0 -> ret0 : fieldload 1 0".to_owned(),
        format!("ret0 -> A.f()I1 : contains {{{}}}", ids),
    ]);

    // the header read is an interleaving point
    config.thread_bound = 2;
    let reg = registry_of(&config, vec![ a, b, c ], "A")?;
    let rules = rules_of(&config, &reg, "A", "A", "f", "()I")?;
    assert_eq!(rules[0], "shared A.f()I0 -> ret0 : fieldload 1 0");
    Ok(())
}

#[test]
fn test_field_access_guarded_per_member() -> GeneralResult<()> {
    use Operation::*;
    let field_ref = || MemberRef::new("Base", "x", "I");
    let mut base = class("Base", Some("java/lang/Object"));
    base.fields.push(field("x", "I", false));
    base.methods.push(method("touch", "(LBase;)V", true, vec![
        Allocation(AllocationKind::Element { class : "Derived".into() }),
        VarAction { op : VarOp::Get, kind : VarKind::Field, field : field_ref() },
        VarAction { op : VarOp::Put, kind : VarKind::Field, field : field_ref() },
        Yield { kind : JType::Void },
    ]));
    let mut derived = class("Derived", Some("Base"));
    derived.fields.push(field("y", "I", false));

    for threads in &[ 1, 2 ] {
        let mut config = Config::new(4, 15);
        config.thread_bound = *threads;
        let reg = registry_of(&config, vec![ base.clone(), derived.clone() ], "Base")?;
        let id = |n : &str| reg.id_of(n).unwrap_or(0);
        let slot = config.object_base() + 1;
        let rules = rules_of(&config, &reg, "Base", "Base", "touch", "(LBase;)V")?;

        let at = |offset : usize| -> Vec<String> {
            let prefix = format!("Base.touch(LBase;)V{} -> Base.touch(LBase;)V{} :", offset, offset + 1);
            rules.iter().filter(|r| r.starts_with(&prefix)).cloned().collect()
        };
        let mut loads = at(1);
        loads.sort();
        let mut expected = vec![
            format!("Base.touch(LBase;)V1 -> Base.touch(LBase;)V2 : fieldload 1 {} if in {{{}}}", slot, id("Base")),
            format!("Base.touch(LBase;)V1 -> Base.touch(LBase;)V2 : fieldload 1 {} if in {{{}}}", slot, id("Derived")),
        ];
        expected.sort();
        assert_eq!(loads, expected);

        let stores = at(2);
        assert_eq!(stores.len(), 2);
        assert!(stores.iter().all(|r| r.contains(&format!(": fieldstore 1 {} if in {{", slot))));
        assert!(rules.contains(&"Base.touch(LBase;)V2 -> Base.touch(LBase;)V2_NPE : npe 1".to_owned()));
    }
    Ok(())
}
