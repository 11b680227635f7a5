use std::collections::BTreeSet;
use std::fmt;

use crate::jvmtypes::{Comparison, JType, StackOperation};

/// Class ids used in guards. 0 stands for null.
pub type IdSet = BTreeSet<u32>;

pub fn id_set<I : IntoIterator<Item = u32>>(ids : I) -> IdSet {
    ids.into_iter().collect()
}

/// Word category of a stack value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    One = 1,
    Two = 2,
}

impl Category {
    pub fn of(kind : JType) -> Self {
        if kind.size() == 2 { Category::Two } else { Category::One }
    }

    pub fn from_slots(n : u8) -> Self {
        if n == 2 { Category::Two } else { Category::One }
    }

    pub fn slots(self) -> u8 {
        self as u8
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    /// the class id of the reference the guarded operation acts on is in
    /// the set; for loads, calls and jumps that is the top reference
    Contains(IdSet),
    NotContains(IdSet),
    /// the named boolean global is 0
    GlobalZero(String),
    GlobalOne(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f64),
    Str(String),
    /// any integer in the inclusive range
    Range { min : i64, max : i64 },
    FloatRange { min : f64, max : f64 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Ushr,
    And,
    Or,
    Xor,
    /// three-way comparison; NaN handling is in the variant for floats
    Cmp,
    CmpL,
    CmpG,
    /// nondeterministic value within the two popped bounds
    Ndt,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    /// pops a class id and pushes 1 if it is in the set, else 0
    Contains(IdSet),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConvertOp {
    IntToFloat,
    FloatToInt,
    /// truncation to byte, char or short
    Narrow(JType),
    /// same domain, different word category
    Resize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IfTest {
    /// compares the popped value against zero
    Compare(Comparison),
    Is(i32),
    NotIn(BTreeSet<i32>),
    /// strictly below `low` or strictly above `high`
    Outside { low : i32, high : i32 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JumpKind {
    Goto,
    /// entry into an exception handler, keeping only the thrown reference
    Throw,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrintKind {
    Int,
    Float,
    Char,
    Str,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprOp {
    Arith       { op : ArithOp, cat : Category, float : bool },
    ArrayLength,
    ArrayLoad   (Category),
    ArrayStore  (Category),
    ConstLoad   { cat : Category, name : String },
    ConstStore  { cat : Category, name : String },
    Convert     { op : ConvertOp, from : Category, to : Category },
    Dup         { op : StackOperation, size : u8 },
    Error,
    FieldLoad   { cat : Category, id : u32 },
    FieldStore  { cat : Category, id : u32 },
    Fork        { nargs : u8 },
    GetReturn   (Category),
    GlobalLoad  { cat : Category, name : String },
    GlobalStore { cat : Category, name : String },
    /// fails when the allocation it carries does not fit in the heap
    HeapOverflow(Box<ExprOp>),
    /// pops the latest heap snapshot back into the heap
    HeapRestore,
    /// pushes a snapshot of the heap
    HeapSave,
    If          (IfTest),
    IfCmp       { cat : Category, way : Comparison },
    Inc         { index : u16, value : i32 },
    Invoke      { nargs : u8 },
    IoobCheck   { depth : u8 },
    Jump        (JumpKind),
    Load        { cat : Category, index : u16 },
    MonitorEnter,
    MonitorExit,
    /// acquires the monitor of the reference `depth` slots below the top
    MonitorTouch { depth : u8 },
    New         { id : u32, size : u32 },
    Notify      { all : bool },
    NewArray    { dims : u8, types : Vec<u32>, init : Value },
    NpeCheck    { depth : u8 },
    PopPush     { pop : u8, push : u8 },
    Print       { kind : Option<PrintKind>, newline : bool },
    Push        { cat : Category, value : Value },
    Return      (Option<Category>),
    Store       { cat : Category, index : u16 },
    Swap,
    Unary       { op : UnaryOp, cat : Category },
    /// releases the monitor of the popped reference and blocks
    WaitInvoke,
    /// reacquires the monitor after a notify
    WaitReturn,
}

/// An operation together with the guard that enables it.
#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub op : ExprOp,
    pub cond : Option<Condition>,
}

impl ExprOp {
    pub fn when(self, cond : Condition) -> Expr {
        Expr { op : self, cond : Some(cond) }
    }
}

impl From<ExprOp> for Expr {
    fn from(op : ExprOp) -> Self {
        Expr { op, cond : None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Label(String),
    Call { callee : String, ret : String },
    /// spawns `target` as a new thread while the current one continues at `ret`
    Dynamic { ret : String, target : String },
    /// leaves the current module
    Return,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Visibility {
    Local,
    Shared,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Rule {
    pub from : String,
    pub expr : Expr,
    pub to : Target,
    pub visibility : Visibility,
}

/// Receives translated rules. The text form belongs to the implementor.
pub trait RuleSink {
    fn push_rule(&mut self, rule : Rule);

    fn add_rule(&mut self, from : &str, expr : impl Into<Expr>, to : &str) {
        self.push_rule(Rule {
            from : from.to_owned(),
            expr : expr.into(),
            to : Target::Label(to.to_owned()),
            visibility : Visibility::Local,
        })
    }

    fn add_call_rule(&mut self, from : &str, expr : impl Into<Expr>, callee : &str, ret : &str) {
        self.push_rule(Rule {
            from : from.to_owned(),
            expr : expr.into(),
            to : Target::Call { callee : callee.to_owned(), ret : ret.to_owned() },
            visibility : Visibility::Local,
        })
    }

    fn add_shared_rule(&mut self, from : &str, expr : impl Into<Expr>, to : &str) {
        self.push_rule(Rule {
            from : from.to_owned(),
            expr : expr.into(),
            to : Target::Label(to.to_owned()),
            visibility : Visibility::Shared,
        })
    }

    fn add_dynamic_rule(&mut self, from : &str, expr : impl Into<Expr>, ret : &str, target : &str) {
        self.push_rule(Rule {
            from : from.to_owned(),
            expr : expr.into(),
            to : Target::Dynamic { ret : ret.to_owned(), target : target.to_owned() },
            visibility : Visibility::Local,
        })
    }

    fn add_return_rule(&mut self, from : &str, expr : impl Into<Expr>) {
        self.push_rule(Rule {
            from : from.to_owned(),
            expr : expr.into(),
            to : Target::Return,
            visibility : Visibility::Local,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodModule {
    pub name : String,
    pub is_static : bool,
    pub is_synchronized : bool,
    pub is_void : bool,
    pub max_stack : u16,
    pub max_locals : u16,
    pub rules : Vec<Rule>,
    /// (start offset, source line)
    pub lines : Vec<(usize, u16)>,
}

impl MethodModule {
    pub fn new(name : &str) -> Self {
        MethodModule {
            name : name.to_owned(),
            is_static : true,
            is_synchronized : false,
            is_void : true,
            max_stack : 0,
            max_locals : 0,
            rules : Vec::new(),
            lines : Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn rules_from<'a>(&'a self, label : &'a str) -> impl Iterator<Item = &'a Rule> + 'a {
        self.rules.iter().filter(move |r| r.from == label)
    }

    /// Maps one of this module's instruction labels back to its source line,
    /// when the class file recorded one.
    pub fn source_line(&self, label : &str) -> Option<u16> {
        let offset : usize = label.strip_prefix(self.name.as_str())?.parse().ok()?;
        self.lines.iter().take_while(|(start, _)| *start <= offset).last().map(|&(_, line)| line)
    }
}

impl RuleSink for MethodModule {
    fn push_rule(&mut self, rule : Rule) {
        self.rules.push(rule);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VarType {
    Int(u32),
    Bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variable {
    pub name : String,
    pub ty : VarType,
}

/// The complete translated program.
#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub bits : u32,
    /// value-domain size of each heap cell
    pub heap : Vec<u64>,
    pub globals : Vec<Variable>,
    pub constants : Vec<(String, i32)>,
    /// the entry harness comes first
    pub modules : Vec<MethodModule>,
    pub entry : String,
}

impl Program {
    pub fn module(&self, name : &str) -> Option<&MethodModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.modules.iter().flat_map(|m| m.rules.iter())
    }
}

fn write_ids(f : &mut fmt::Formatter, ids : &IdSet) -> fmt::Result {
    let list : Vec<_> = ids.iter().map(u32::to_string).collect();
    write!(f, "{{{}}}", list.join(","))
}

impl fmt::Display for Category {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.slots())
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        use Condition::*;
        match self {
            Contains(ids)    => { write!(f, "in ")?; write_ids(f, ids) },
            NotContains(ids) => { write!(f, "notin ")?; write_ids(f, ids) },
            GlobalZero(name) => write!(f, "{} == 0", name),
            GlobalOne(name)  => write!(f, "{} == 1", name),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        use Value::*;
        match self {
            Int(v) => write!(f, "{}", v),
            Float(v) => write!(f, "{:?}f", v),
            Str(s) => write!(f, "{:?}", s),
            Range { min, max } => write!(f, "[{},{}]", min, max),
            FloatRange { min, max } => write!(f, "[{:?}f,{:?}f]", min, max),
        }
    }
}

impl fmt::Display for IfTest {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        use IfTest::*;
        match self {
            Compare(way) => write!(f, "{:?}", way),
            Is(v) => write!(f, "is {}", v),
            NotIn(vs) => {
                let list : Vec<_> = vs.iter().map(i32::to_string).collect();
                write!(f, "notin {{{}}}", list.join(","))
            },
            Outside { low, high } => write!(f, "outside [{},{}]", low, high),
        }
    }
}

impl fmt::Display for ExprOp {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        use ExprOp::*;
        match self {
            Arith { op, cat, float } =>
                write!(f, "{}arith {:?} {}", if *float { "f" } else { "" }, op, cat),
            ArrayLength => write!(f, "arraylength"),
            ArrayLoad(cat) => write!(f, "arrayload {}", cat),
            ArrayStore(cat) => write!(f, "arraystore {}", cat),
            ConstLoad { cat, name } => write!(f, "constload {} {}", cat, name),
            ConstStore { cat, name } => write!(f, "conststore {} {}", cat, name),
            Convert { op, from, to } => write!(f, "convert {:?} {} {}", op, from, to),
            Dup { op, size } => write!(f, "{:?} {}", op, size),
            Error => write!(f, "error"),
            FieldLoad { cat, id } => write!(f, "fieldload {} {}", cat, id),
            FieldStore { cat, id } => write!(f, "fieldstore {} {}", cat, id),
            Fork { nargs } => write!(f, "fork {}", nargs),
            GetReturn(cat) => write!(f, "getreturn {}", cat),
            GlobalLoad { cat, name } => write!(f, "globalload {} {}", cat, name),
            GlobalStore { cat, name } => write!(f, "globalstore {} {}", cat, name),
            HeapOverflow(op) => write!(f, "heapoverflow ({})", op),
            HeapRestore => write!(f, "heaprestore"),
            HeapSave => write!(f, "heapsave"),
            If(test) => write!(f, "if {}", test),
            IfCmp { cat, way } => write!(f, "ifcmp {} {:?}", cat, way),
            Inc { index, value } => write!(f, "inc {} {}", index, value),
            Invoke { nargs } => write!(f, "invoke {}", nargs),
            IoobCheck { depth } => write!(f, "ioob {}", depth),
            Jump(JumpKind::Goto) => write!(f, "jump"),
            Jump(JumpKind::Throw) => write!(f, "throw"),
            Load { cat, index } => write!(f, "load {} {}", cat, index),
            MonitorEnter => write!(f, "monitorenter"),
            MonitorExit => write!(f, "monitorexit"),
            MonitorTouch { depth } => write!(f, "monitortouch {}", depth),
            New { id, size } => write!(f, "new {} {}", id, size),
            Notify { all } => write!(f, "notify{}", if *all { "all" } else { "" }),
            NewArray { dims, types, init } => {
                let list : Vec<_> = types.iter().map(u32::to_string).collect();
                write!(f, "newarray {} [{}] {}", dims, list.join(","), init)
            },
            NpeCheck { depth } => write!(f, "npe {}", depth),
            PopPush { pop, push } => write!(f, "poppush {} {}", pop, push),
            Print { kind, newline } =>
                write!(f, "print{} {:?}", if *newline { "ln" } else { "" }, kind),
            Push { cat, value } => write!(f, "push {} {}", cat, value),
            Return(Some(cat)) => write!(f, "return {}", cat),
            Return(None) => write!(f, "return"),
            Store { cat, index } => write!(f, "store {} {}", cat, index),
            Swap => write!(f, "swap"),
            Unary { op : UnaryOp::Neg, cat } => write!(f, "neg {}", cat),
            Unary { op : UnaryOp::Contains(ids), .. } => { write!(f, "contains ")?; write_ids(f, ids) },
            WaitInvoke => write!(f, "waitinvoke"),
            WaitReturn => write!(f, "waitreturn"),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        if self.visibility == Visibility::Shared {
            write!(f, "shared ")?;
        }
        write!(f, "{} -> ", self.from)?;
        match &self.to {
            Target::Label(l) => write!(f, "{}", l)?,
            Target::Call { callee, ret } => write!(f, "{} {}", callee, ret)?,
            Target::Dynamic { ret, target } => write!(f, "{} |> {}", ret, target)?,
            Target::Return => write!(f, "-")?,
        }
        write!(f, " : {}", self.expr.op)?;
        if let Some(c) = &self.expr.cond {
            write!(f, " if {}", c)?;
        }
        Ok(())
    }
}

impl fmt::Display for MethodModule {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "module {} {}{}{}stack={} locals={}",
            self.name,
            if self.is_static { "static " } else { "" },
            if self.is_synchronized { "synchronized " } else { "" },
            if self.is_void { "void " } else { "" },
            self.max_stack,
            self.max_locals)?;
        for r in &self.rules {
            writeln!(f, "    {}", r)?;
        }
        writeln!(f, "end")
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "bits {}", self.bits)?;
        let heap : Vec<_> = self.heap.iter().map(u64::to_string).collect();
        writeln!(f, "heap [{}]", heap.join(","))?;
        for v in &self.globals {
            match v.ty {
                VarType::Int(bits) => writeln!(f, "global int({}) {}", bits, v.name)?,
                VarType::Bool => writeln!(f, "global bool {}", v.name)?,
            }
        }
        for (name, value) in &self.constants {
            writeln!(f, "const {} = {}", name, value)?;
        }
        writeln!(f, "entry {}", self.entry)?;
        for m in &self.modules {
            writeln!(f)?;
            write!(f, "{}", m)?;
        }
        Ok(())
    }
}

#[test]
fn test_rule_display() {
    let mut m = MethodModule::new("A.m()V");
    m.add_rule("A.m()V0", ExprOp::Push { cat : Category::One, value : Value::Int(3) }, "A.m()V1");
    m.add_call_rule("A.m()V1",
        ExprOp::Invoke { nargs : 1 }.when(Condition::Contains(id_set(vec![ 2, 3 ]))),
        "B.f()V0", "ret0");
    m.add_shared_rule("ret0", ExprOp::MonitorEnter, "A.m()V2");
    m.add_return_rule("A.m()V2", ExprOp::Return(None));

    let text : Vec<_> = m.rules.iter().map(Rule::to_string).collect();
    assert_eq!(text, vec![
        "A.m()V0 -> A.m()V1 : push 1 3",
        "A.m()V1 -> B.f()V0 ret0 : invoke 1 if in {2,3}",
        "shared ret0 -> A.m()V2 : monitorenter",
        "A.m()V2 -> - : return",
    ]);
    assert_eq!(m.rules_from("ret0").count(), 1);
}

#[test]
fn test_source_line() {
    let mut m = MethodModule::new("A.m()V");
    m.lines = vec![ (0, 10), (4, 11), (9, 13) ];
    assert_eq!(m.source_line("A.m()V0"), Some(10));
    assert_eq!(m.source_line("A.m()V6"), Some(11));
    assert_eq!(m.source_line("A.m()V12"), Some(13));
    assert_eq!(m.source_line("B.m()V0"), None);
    assert_eq!(m.source_line("ret3"), None);
}
