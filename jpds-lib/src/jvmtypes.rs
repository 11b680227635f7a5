use std::convert::TryFrom;

use classfile_parser::code_attribute::Instruction;

use crate::classfile::ConstantPool;
use crate::GeneralResult;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JType {
    Int,
    Long,
    Float,
    Double,
    Object,
    Byte,
    Char,
    Short,
    Void,
}

impl JType {
    pub fn size(self) -> u8 {
        use JType::*;
        match self {
            Long | Double => 2,
            Int | Float | Object | Byte | Char | Short => 1,
            Void => 0,
        }
    }

    pub fn is_floating(self) -> bool {
        matches!(self, JType::Float | JType::Double)
    }
}

impl TryFrom<JType> for char {
    type Error = &'static str;
    fn try_from(t : JType) -> Result<Self, Self::Error> {
        use JType::*;
        match t {
            Int    => Ok('I'),
            Long   => Ok('J'),
            Float  => Ok('F'),
            Double => Ok('D'),
            Byte   => Ok('B'),
            Char   => Ok('C'),
            Short  => Ok('S'),
            Void   => Ok('V'),
            _  => Err("no such mapping"),
        }
    }
}

impl TryFrom<char> for JType {
    type Error = &'static str;
    fn try_from(ch : char) -> Result<Self, Self::Error> {
        use JType::*;
        match ch {
            'I' => Ok(Int),
            'J' => Ok(Long),
            'F' => Ok(Float),
            'D' => Ok(Double),
            'L' => Ok(Object),
            '[' => Ok(Object),
            'B' => Ok(Byte),
            'Z' => Ok(Byte), // booleans are stored as bytes
            'C' => Ok(Char),
            'S' => Ok(Short),
            'V' => Ok(Void),
            _ => Err("no such mapping"),
        }
    }
}

/// Maps a `newarray` type code to the descriptor of the array it creates.
pub fn primitive_array_name(atype : u8) -> Option<&'static str> {
    match atype {
        4  => Some("[Z"),
        5  => Some("[C"),
        6  => Some("[F"),
        7  => Some("[D"),
        8  => Some("[B"),
        9  => Some("[S"),
        10 => Some("[I"),
        11 => Some("[J"),
        _  => None,
    }
}

/// Returns the name of the array type whose elements are `class`.
pub fn array_of(class : &str) -> String {
    if class.starts_with('[') {
        format!("[{}", class)
    } else {
        format!("[L{};", class)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Comparison {
    pub fn negate(self) -> Self {
        use Comparison::*;
        match self {
            Eq => Ne,
            Ne => Eq,
            Lt => Ge,
            Ge => Lt,
            Gt => Le,
            Le => Gt,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArithmeticOperation {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Shl,
    Shr,
    Ushr,
    And,
    Or,
    Xor,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StackOperation {
    Pop,
    Dup,
    DupX1,
    DupX2,
    Swap,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NanComparisons {
    Greater,
    Less,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperandCount {
    _1 = 1,
    _2 = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VarOp {
    Get,
    Put,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VarKind {
    Static,
    Field,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InvokeKind {
    Dynamic,
    Interface(u8),
    Special,
    Static,
    Virtual,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MonitorOp {
    Enter,
    Exit,
}

/// Branch destinations are absolute code offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SwitchParams {
    Lookup { default : usize, pairs : Vec<(i32, usize)> },
    Table  { default : usize, low : i32, high : i32, targets : Vec<usize> },
}

/// A member reference resolved out of the constant pool.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberRef {
    pub class : String,
    pub name : String,
    pub descriptor : String,
}

impl MemberRef {
    pub fn new(class : &str, name : &str, descriptor : &str) -> Self {
        MemberRef { class : class.into(), name : name.into(), descriptor : descriptor.into() }
    }

    pub fn is(&self, class : &str, name : &str, descriptor : &str) -> bool {
        self.class == class && self.name == name && self.descriptor == descriptor
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Class(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocationKind {
    /// `class` is the descriptor of the outermost array type
    Array { class : String, dims : u8 },
    Element { class : String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Allocation  (AllocationKind),
    Arithmetic  { kind : JType, op : ArithmeticOperation },
    Branch      { kind : JType, ops : OperandCount, way : Comparison, target : usize },
    CheckCast   { class : String },
    Compare     { kind : JType, nans : Option<NanComparisons> },
    Constant    { value : Literal, pooled : bool },
    Conversion  { from : JType, to : JType },
    Increment   { index : u16, value : i16 },
    InstanceOf  { class : String },
    Invocation  { kind : InvokeKind, method : MemberRef },
    Jump        { target : usize },
    Length,     /* i.e. arraylength */
    LoadArray   (JType),
    LoadLocal   { kind : JType, index : u16 },
    Monitor     (MonitorOp),
    Noop,
    StackOp     { size : OperandCount, op : StackOperation },
    StoreArray  (JType),
    StoreLocal  { kind : JType, index : u16 },
    Subroutine  { target : usize }, /* i.e. jsr */
    SubroutineReturn { index : u16 }, /* i.e. ret */
    Switch      (SwitchParams),
    Throw,
    VarAction   { op : VarOp, kind : VarKind, field : MemberRef },
    Yield       { kind : JType }, /* i.e. return */

    Unhandled   (Instruction),
}

impl Operation {
    /// Class names this operation needs in the closure.
    pub fn referenced_classes(&self) -> Vec<String> {
        use Operation::*;
        match self {
            Allocation(AllocationKind::Array { class, .. })
                | Allocation(AllocationKind::Element { class })
                | CheckCast { class }
                | InstanceOf { class }
                => vec![ class.clone() ],
            Invocation { method : r, .. } | VarAction { field : r, .. }
                => vec![ r.class.clone() ],
            _ => vec![],
        }
    }
}

trait OperandType {
    fn get_operand_type(&self) -> Option<JType>;
}

impl OperandType for Instruction {
    fn get_operand_type(&self) -> Option<JType> {
        use Instruction::*;
        use JType::*;
        match self {
            Aconstnull
                | Aload(_) | AloadWide(_)
                | Aload0 | Aload1 | Aload2 | Aload3
                | Astore(_) | AstoreWide(_)
                | Astore0 | Astore1 | Astore2 | Astore3
                | Areturn
                | IfAcmpeq(_) | IfAcmpne(_) | Ifnull(_) | Ifnonnull(_)
                => Some(Object),
            Iconstm1 | Iconst0 | Iconst1 | Iconst2 | Iconst3 | Iconst4 | Iconst5
                | Iload(_) | IloadWide(_)
                | Iload0 | Iload1 | Iload2 | Iload3
                | Istore(_) | IstoreWide(_)
                | Istore0 | Istore1 | Istore2 | Istore3
                | Iadd | Isub | Imul | Idiv | Irem | Ineg
                | Ishl | Ishr | Iushr | Iand | Ior | Ixor
                | Ireturn
                | Ifeq(_) | Ifne(_) | Iflt(_) | Ifge(_) | Ifgt(_) | Ifle(_)
                | IfIcmpeq(_) | IfIcmpne(_) | IfIcmplt(_) | IfIcmpge(_) | IfIcmpgt(_) | IfIcmple(_)
                => Some(Int),
            Lconst0 | Lconst1
                | Lload(_) | LloadWide(_)
                | Lload0 | Lload1 | Lload2 | Lload3
                | Lstore(_) | LstoreWide(_)
                | Lstore0 | Lstore1 | Lstore2 | Lstore3
                | Ladd | Lsub | Lmul | Ldiv | Lrem | Lneg
                | Lshl | Lshr | Lushr | Land | Lor | Lxor
                | Lreturn
                => Some(Long),
            Fconst0 | Fconst1 | Fconst2
                | Fload(_) | FloadWide(_)
                | Fload0 | Fload1 | Fload2 | Fload3
                | Fstore(_) | FstoreWide(_)
                | Fstore0 | Fstore1 | Fstore2 | Fstore3
                | Fadd | Fsub | Fmul | Fdiv | Frem | Fneg
                | Freturn
                => Some(Float),
            Dconst0 | Dconst1
                | Dload(_) | DloadWide(_)
                | Dload0 | Dload1 | Dload2 | Dload3
                | Dstore(_) | DstoreWide(_)
                | Dstore0 | Dstore1 | Dstore2 | Dstore3
                | Dadd | Dsub | Dmul | Ddiv | Drem | Dneg
                | Dreturn
                => Some(Double),
            Return
                => Some(Void),

                  I2l | I2f | I2d | I2b | I2c | I2s => Some(Int),
            L2i |       L2f | L2d                   => Some(Long),
            F2i | F2l |       F2d                   => Some(Float),
            D2i | D2l | D2f                         => Some(Double),

            _ => None,
        }
    }
}

fn relative(addr : usize, off : i32) -> usize {
    (addr as i64 + i64::from(off)) as usize
}

/// Decodes one instruction, resolving its constant-pool operands. Returns the
/// instruction's own offset alongside the decoded operation.
pub fn decode_insn(pool : &ConstantPool, insn : (usize, Instruction)) -> GeneralResult<(usize, Operation)> {
    use AllocationKind::*;
    use Instruction::*;
    use JType::*;
    use Operation::*;
    use SwitchParams::*;

    let (addr, insn) = insn;

    let make_constant = |value| Constant { value, pooled : false };

    let kind = || insn.get_operand_type().ok_or("kind must be valid but is not");

    let op = match insn {
        Nop => Noop,

        Aconstnull => make_constant(Literal::Null),

        Iconstm1 => make_constant(Literal::Int(-1)),
        Iconst0  => make_constant(Literal::Int(0)),
        Iconst1  => make_constant(Literal::Int(1)),
        Iconst2  => make_constant(Literal::Int(2)),
        Iconst3  => make_constant(Literal::Int(3)),
        Iconst4  => make_constant(Literal::Int(4)),
        Iconst5  => make_constant(Literal::Int(5)),

        Lconst0 => make_constant(Literal::Long(0)),
        Lconst1 => make_constant(Literal::Long(1)),
        Fconst0 => make_constant(Literal::Float(0.0)),
        Fconst1 => make_constant(Literal::Float(1.0)),
        Fconst2 => make_constant(Literal::Float(2.0)),
        Dconst0 => make_constant(Literal::Double(0.0)),
        Dconst1 => make_constant(Literal::Double(1.0)),

        Bipush(v) => make_constant(Literal::Int(v.into())),
        Sipush(v) => make_constant(Literal::Int(v.into())),

        Iload(index) | Lload(index) | Fload(index) | Dload(index) | Aload(index)
            => LoadLocal { kind : kind()?, index : index.into() },

        IloadWide(index) | LloadWide(index) | FloadWide(index) | DloadWide(index) | AloadWide(index)
            => LoadLocal { kind : kind()?, index },

        Dload0 | Fload0 | Iload0 | Lload0 | Aload0 => LoadLocal { kind : kind()?, index : 0 },
        Dload1 | Fload1 | Iload1 | Lload1 | Aload1 => LoadLocal { kind : kind()?, index : 1 },
        Dload2 | Fload2 | Iload2 | Lload2 | Aload2 => LoadLocal { kind : kind()?, index : 2 },
        Dload3 | Fload3 | Iload3 | Lload3 | Aload3 => LoadLocal { kind : kind()?, index : 3 },

        Iaload => LoadArray(Int),
        Laload => LoadArray(Long),
        Faload => LoadArray(Float),
        Daload => LoadArray(Double),
        Aaload => LoadArray(Object),
        Baload => LoadArray(Byte),
        Caload => LoadArray(Char),
        Saload => LoadArray(Short),

        Istore(index) | Lstore(index) | Fstore(index) | Dstore(index) | Astore(index)
            => StoreLocal { kind : kind()?, index : index.into() },

        IstoreWide(index) | LstoreWide(index) | FstoreWide(index) | DstoreWide(index) | AstoreWide(index)
            => StoreLocal { kind : kind()?, index },

        Dstore0 | Fstore0 | Istore0 | Lstore0 | Astore0 => StoreLocal { kind : kind()?, index : 0 },
        Dstore1 | Fstore1 | Istore1 | Lstore1 | Astore1 => StoreLocal { kind : kind()?, index : 1 },
        Dstore2 | Fstore2 | Istore2 | Lstore2 | Astore2 => StoreLocal { kind : kind()?, index : 2 },
        Dstore3 | Fstore3 | Istore3 | Lstore3 | Astore3 => StoreLocal { kind : kind()?, index : 3 },

        Iastore => StoreArray(Int),
        Lastore => StoreArray(Long),
        Fastore => StoreArray(Float),
        Dastore => StoreArray(Double),
        Aastore => StoreArray(Object),
        Bastore => StoreArray(Byte),
        Castore => StoreArray(Char),
        Sastore => StoreArray(Short),

        Pop     => StackOp { op : StackOperation::Pop  , size : OperandCount::_1 },
        Pop2    => StackOp { op : StackOperation::Pop  , size : OperandCount::_2 },
        Dup     => StackOp { op : StackOperation::Dup  , size : OperandCount::_1 },
        Dupx1   => StackOp { op : StackOperation::DupX1, size : OperandCount::_1 },
        Dupx2   => StackOp { op : StackOperation::DupX2, size : OperandCount::_1 },
        Dup2    => StackOp { op : StackOperation::Dup  , size : OperandCount::_2 },
        Dup2x1  => StackOp { op : StackOperation::DupX1, size : OperandCount::_2 },
        Dup2x2  => StackOp { op : StackOperation::DupX2, size : OperandCount::_2 },
        Swap    => StackOp { op : StackOperation::Swap , size : OperandCount::_1 },

        Iadd | Ladd | Fadd | Dadd
            | Isub | Lsub | Fsub | Dsub
            | Imul | Lmul | Fmul | Dmul
            | Idiv | Ldiv | Fdiv | Ddiv
            | Irem | Lrem | Frem | Drem
            | Ineg | Lneg | Fneg | Dneg
            | Ishl | Lshl
            | Ishr | Lshr
            | Iushr| Lushr
            | Iand | Land
            | Ior  | Lor
            | Ixor | Lxor
            => {
                let op = match insn {
                    Iadd | Ladd | Fadd | Dadd => ArithmeticOperation::Add,
                    Isub | Lsub | Fsub | Dsub => ArithmeticOperation::Sub,
                    Imul | Lmul | Fmul | Dmul => ArithmeticOperation::Mul,
                    Idiv | Ldiv | Fdiv | Ddiv => ArithmeticOperation::Div,
                    Irem | Lrem | Frem | Drem => ArithmeticOperation::Rem,
                    Ineg | Lneg | Fneg | Dneg => ArithmeticOperation::Neg,
                    Ishl | Lshl               => ArithmeticOperation::Shl,
                    Ishr | Lshr               => ArithmeticOperation::Shr,
                    Iushr| Lushr              => ArithmeticOperation::Ushr,
                    Iand | Land               => ArithmeticOperation::And,
                    Ior  | Lor                => ArithmeticOperation::Or,
                    Ixor | Lxor               => ArithmeticOperation::Xor,
                    _ => unreachable!(),
                };
                Arithmetic { kind : kind()?, op }
            },

        Iinc     { index, value } => Increment { index : index.into(), value : value.into() },
        IincWide { index, value } => Increment { index, value },

        I2l | I2f | I2d | L2i | L2f | L2d | F2i | F2l | F2d | D2i | D2l | D2f | I2b | I2c | I2s
            => {
                let to = match insn {
                    I2b                   => Byte,
                    I2c                   => Char,
                    I2s                   => Short,

                          L2i | F2i | D2i => Int,
                    I2l |       F2l | D2l => Long,
                    I2f | L2f |       D2f => Float,
                    I2d | L2d | F2d       => Double,

                    _ => unreachable!(),
                };

                Conversion { from : kind()?, to }
            },

        Lcmp    => Compare { kind : Long  , nans : None                          },
        Fcmpl   => Compare { kind : Float , nans : Some(NanComparisons::Less   ) },
        Fcmpg   => Compare { kind : Float , nans : Some(NanComparisons::Greater) },
        Dcmpl   => Compare { kind : Double, nans : Some(NanComparisons::Less   ) },
        Dcmpg   => Compare { kind : Double, nans : Some(NanComparisons::Greater) },

        Ifeq(off) | Ifne(off) | Iflt(off) | Ifge(off) | Ifgt(off) | Ifle(off)
            | IfIcmpeq(off) | IfIcmpne(off)
            | IfIcmplt(off) | IfIcmpge(off) | IfIcmpgt(off) | IfIcmple(off)
            | IfAcmpeq(off) | IfAcmpne(off)
            | Ifnull(off) | Ifnonnull(off)
            => {
                let target = relative(addr, off.into());
                let way = match insn {
                    Ifeq(_) | IfIcmpeq(_) | IfAcmpeq(_) | Ifnull(_)    => Comparison::Eq,
                    Ifne(_) | IfIcmpne(_) | IfAcmpne(_) | Ifnonnull(_) => Comparison::Ne,
                    Iflt(_) | IfIcmplt(_)                              => Comparison::Lt,
                    Ifge(_) | IfIcmpge(_)                              => Comparison::Ge,
                    Ifgt(_) | IfIcmpgt(_)                              => Comparison::Gt,
                    Ifle(_) | IfIcmple(_)                              => Comparison::Le,

                    _ => unreachable!(),
                };
                let ops = match insn {
                    Ifeq(_) | Ifne(_) | Iflt(_) | Ifge(_) | Ifgt(_) | Ifle(_)
                        | Ifnull(_) | Ifnonnull(_)
                        => OperandCount::_1,
                    IfIcmpeq(_) | IfIcmpne(_)
                        | IfIcmplt(_) | IfIcmpge(_) | IfIcmpgt(_) | IfIcmple(_)
                        | IfAcmpeq(_) | IfAcmpne(_)
                        => OperandCount::_2,
                    _ => unreachable!(),
                };

                Branch { kind : kind()?, way, ops, target }
            },

        Goto(off) => Jump { target : relative(addr, off.into()) },
        GotoW(off) => Jump { target : relative(addr, off) },

        Ireturn | Lreturn | Freturn | Dreturn | Areturn | Return
            => Yield { kind : kind()? },

        Getstatic(index) => VarAction { op : VarOp::Get, kind : VarKind::Static, field : pool.member(index)? },
        Putstatic(index) => VarAction { op : VarOp::Put, kind : VarKind::Static, field : pool.member(index)? },
        Getfield(index)  => VarAction { op : VarOp::Get, kind : VarKind::Field , field : pool.member(index)? },
        Putfield(index)  => VarAction { op : VarOp::Put, kind : VarKind::Field , field : pool.member(index)? },

        Invokevirtual(index) => Invocation { kind : InvokeKind::Virtual, method : pool.member(index)? },
        Invokespecial(index) => Invocation { kind : InvokeKind::Special, method : pool.member(index)? },
        Invokestatic(index)  => Invocation { kind : InvokeKind::Static , method : pool.member(index)? },
        Invokeinterface { index, count } =>
            Invocation { kind : InvokeKind::Interface(count), method : pool.member(index)? },
        // call sites of invokedynamic do not name a concrete method
        Invokedynamic(_) => Unhandled(insn),

        New(index) => Allocation(Element { class : pool.class_name(index)? }),
        Newarray(atype) =>
            match primitive_array_name(atype) {
                Some(name) => Allocation(Array { class : name.into(), dims : 1 }),
                None => Unhandled(insn),
            },
        Anewarray(index) =>
            Allocation(Array { class : array_of(&pool.class_name(index)?), dims : 1 }),
        Multianewarray { index, dimensions : dims } =>
            Allocation(Array { class : pool.class_name(index)?, dims }),

        Arraylength => Length,

        Tableswitch { default, low, high, offsets } =>
            Switch(Table {
                default : relative(addr, default),
                low,
                high,
                targets : offsets.into_iter().map(|o| relative(addr, o)).collect(),
            }),
        Lookupswitch { default, pairs } =>
            Switch(Lookup {
                default : relative(addr, default),
                pairs : pairs.into_iter().map(|(v, o)| (v, relative(addr, o))).collect(),
            }),

        Ldc(index) => Constant { value : pool.literal(index.into())?, pooled : true },
        LdcW(index) | Ldc2W(index) => Constant { value : pool.literal(index)?, pooled : true },

        Jsr(off) => Subroutine { target : relative(addr, off.into()) },
        JsrW(off) => Subroutine { target : relative(addr, off) },
        Ret(index) => SubroutineReturn { index : index.into() },
        RetWide(index) => SubroutineReturn { index },

        Athrow => Throw,
        Checkcast(index) => CheckCast { class : pool.class_name(index)? },
        Instanceof(index) => InstanceOf { class : pool.class_name(index)? },
        Monitorenter => Monitor(MonitorOp::Enter),
        Monitorexit => Monitor(MonitorOp::Exit),
    };

    Ok((addr, op))
}

/// Field and method descriptor arithmetic. Counts are in stack slots.
pub mod args {
    use std::convert::TryFrom;
    use crate::error::TranslateError;
    use crate::GeneralResult;
    use super::JType;

    pub fn field_size(ch : char) -> GeneralResult<u8> {
        JType::try_from(ch).map(JType::size).map_err(Into::into)
    }

    // returns the byte length of the first field descriptor in `s`
    fn eat(s : &str) -> GeneralResult<usize> {
        let ch = s.chars().next().ok_or("string ended too soon")?;
        match ch {
            'B' | 'C' | 'F' | 'I' | 'S' | 'Z' | 'D' | 'J' | 'V' => Ok(1),
            'L' => Ok(1 + s.find(';').ok_or("string ended too soon")?),
            '[' => Ok(1 + eat(&s[1..])?),
            _ => Err(format!("unexpected character {}", ch).into()),
        }
    }

    fn split_internal(mut s : &str) -> GeneralResult<Vec<String>> {
        let mut out = Vec::new();
        while !s.is_empty() {
            let n = eat(s)?;
            out.push(s[..n].to_owned());
            s = &s[n..];
        }
        Ok(out)
    }

    fn parts(descriptor : &str) -> GeneralResult<(&str, &str)> {
        let bad = || TranslateError::Descriptor(descriptor.into());
        if !descriptor.starts_with('(') {
            return Err(bad().into());
        }
        let close = descriptor.rfind(')').ok_or_else(bad)?;
        Ok((&descriptor[1..close], &descriptor[close+1..]))
    }

    /// Splits a method descriptor into its parameter field descriptors.
    pub fn param_types(descriptor : &str) -> GeneralResult<Vec<String>> {
        let (params, _) = parts(descriptor)?;
        split_internal(params).map_err(|_| TranslateError::Descriptor(descriptor.into()).into())
    }

    pub fn return_type(descriptor : &str) -> GeneralResult<String> {
        let (_, ret) = parts(descriptor)?;
        match split_internal(ret) {
            Ok(mut v) if v.len() == 1 => Ok(v.remove(0)),
            _ => Err(TranslateError::Descriptor(descriptor.into()).into()),
        }
    }

    fn slots(field : &str) -> GeneralResult<u8> {
        let ch = field.chars().next().ok_or("empty field descriptor")?;
        field_size(ch)
    }

    // JVM limitations restrict the count of method parameters to 255 at most
    pub fn count_params(descriptor : &str) -> GeneralResult<u8> {
        param_types(descriptor)?.iter().map(|p| slots(p)).sum()
    }

    // JVM limitations restrict the count of return values to 1 at most, of size 2 at most
    pub fn count_returns(descriptor : &str) -> GeneralResult<u8> {
        slots(&return_type(descriptor)?)
    }

    pub fn is_void(descriptor : &str) -> GeneralResult<bool> {
        Ok(return_type(descriptor)? == "V")
    }

    /// The class a field descriptor refers to, if any. Array descriptors name
    /// themselves, since array types are classes in their own right.
    pub fn referenced_class(field : &str) -> Option<String> {
        if field.starts_with('[') {
            Some(field.to_owned())
        } else if field.starts_with('L') && field.ends_with(';') {
            Some(field[1..field.len()-1].to_owned())
        } else {
            None
        }
    }
}

#[test]
fn test_count_params() -> GeneralResult<()> {
    use args::count_params;
    assert_eq!(3, count_params("(III)V")?);
    assert_eq!(4, count_params("(JD)I")?);
    assert_eq!(2, count_params("(Lmetasyntactic;Lvariable;)I")?);
    assert_eq!(1, count_params("([[[I)I")?);
    assert_eq!(0, count_params("()Lplaceholder;")?);
    assert_eq!(2, count_params("(BZ)D")?);
    Ok(())
}

#[test]
fn test_count_returns() -> GeneralResult<()> {
    use args::count_returns;
    assert_eq!(0, count_returns("(III)V")?);
    assert_eq!(1, count_returns("(JD)I")?);
    assert_eq!(1, count_returns("([[[I)I")?);
    assert_eq!(1, count_returns("()Lplaceholder;")?);
    assert_eq!(2, count_returns("()D")?);
    Ok(())
}

#[test]
fn test_param_types() -> GeneralResult<()> {
    use args::*;
    assert_eq!(param_types("(I[JLjava/lang/String;[[LFoo;)V")?,
        vec![ "I", "[J", "Ljava/lang/String;", "[[LFoo;" ]);
    assert!(param_types("I)V").is_err());
    assert!(param_types("(Q)V").is_err());
    assert_eq!(referenced_class("Ljava/lang/String;").as_deref(), Some("java/lang/String"));
    assert_eq!(referenced_class("[[LFoo;").as_deref(), Some("[[LFoo;"));
    assert_eq!(referenced_class("I"), None);
    assert!(is_void("()V")?);
    Ok(())
}

#[test]
fn test_array_of() {
    assert_eq!(array_of("Foo"), "[LFoo;");
    assert_eq!(array_of("[I"), "[[I");
    assert_eq!(primitive_array_name(10), Some("[I"));
    assert_eq!(primitive_array_name(3), None);
}
