use classfile_parser::attribute_info::AttributeInfo;
use classfile_parser::constant_info::ConstantInfo;
use classfile_parser::field_info::FieldAccessFlags;
use classfile_parser::method_info::MethodAccessFlags;
use classfile_parser::ClassAccessFlags;

use crate::error::TranslateError;
use crate::jvmtypes::{decode_insn, Literal, MemberRef, Operation};
use crate::{generic_error, GeneralResult};

/// An annotation element value. Only the shapes that range metadata uses are
/// kept; anything else is `Other`.
#[derive(Clone, Debug, PartialEq)]
pub enum ElementValue {
    Int(i32),
    Str(String),
    Array(Vec<ElementValue>),
    Other,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    /// field descriptor of the annotation type, e.g. `Lpkg/Bits;`
    pub type_name : String,
    pub elements : Vec<(String, ElementValue)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDef {
    pub name : String,
    pub descriptor : String,
    pub is_static : bool,
    pub is_final : bool,
    pub constant_value : Option<i32>,
    pub annotations : Vec<Annotation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handler {
    pub start : usize,
    pub end : usize,
    pub target : usize,
    /// `None` catches everything (`finally`)
    pub catch_type : Option<String>,
}

impl Handler {
    pub fn covers(&self, offset : usize) -> bool {
        self.start <= offset && offset < self.end
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodCode {
    pub max_stack : u16,
    pub max_locals : u16,
    pub ops : Vec<(usize, Operation)>,
    pub handlers : Vec<Handler>,
    /// (start offset, source line)
    pub lines : Vec<(usize, u16)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodDef {
    pub name : String,
    pub descriptor : String,
    pub is_static : bool,
    pub is_synchronized : bool,
    pub is_abstract : bool,
    pub is_native : bool,
    pub code : Option<MethodCode>,
    pub annotations : Vec<Annotation>,
    /// parameter names, when a local variable table is present
    pub param_names : Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassDef {
    pub name : String,
    pub super_name : Option<String>,
    pub interfaces : Vec<String>,
    pub is_interface : bool,
    pub fields : Vec<FieldDef>,
    pub methods : Vec<MethodDef>,
    pub annotations : Vec<Annotation>,
}

impl ClassDef {
    pub fn method(&self, name : &str, descriptor : &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn has_clinit(&self) -> bool {
        self.method("<clinit>", "()V").is_some()
    }
}

/// Resolves constant-pool entries to owned names, with any stub prefix
/// removed so that substitute classes stand in under their real names.
pub struct ConstantPool<'a> {
    pool : &'a [ConstantInfo],
    stub_prefix : Option<&'a str>,
}

impl<'a> ConstantPool<'a> {
    pub fn new(pool : &'a [ConstantInfo], stub_prefix : Option<&'a str>) -> Self {
        ConstantPool { pool, stub_prefix }
    }

    fn get(&self, index : u16) -> GeneralResult<&'a ConstantInfo> {
        usize::from(index)
            .checked_sub(1)
            .and_then(|i| self.pool.get(i))
            .ok_or_else(|| format!("constant pool index {} out of range", index).into())
    }

    fn strip(&self, s : &str) -> String {
        match self.stub_prefix {
            Some(p) if !p.is_empty() => s.replace(p, ""),
            _ => s.to_owned(),
        }
    }

    pub fn utf8(&self, index : u16) -> GeneralResult<String> {
        match self.get(index)? {
            ConstantInfo::Utf8(u) => Ok(self.strip(&u.utf8_string)),
            _ => Err(format!("constant {} is not a string", index).into()),
        }
    }

    pub fn class_name(&self, index : u16) -> GeneralResult<String> {
        match self.get(index)? {
            ConstantInfo::Class(cl) => self.utf8(cl.name_index),
            _ => Err(format!("constant {} is not a class", index).into()),
        }
    }

    fn name_and_type(&self, index : u16) -> GeneralResult<(String, String)> {
        match self.get(index)? {
            ConstantInfo::NameAndType(nt) => Ok((self.utf8(nt.name_index)?, self.utf8(nt.descriptor_index)?)),
            _ => Err(format!("constant {} is not a name-and-type", index).into()),
        }
    }

    pub fn member(&self, index : u16) -> GeneralResult<MemberRef> {
        use ConstantInfo::*;
        let (class_index, nat) = match self.get(index)? {
            FieldRef(r) => (r.class_index, r.name_and_type_index),
            MethodRef(r) => (r.class_index, r.name_and_type_index),
            InterfaceMethodRef(r) => (r.class_index, r.name_and_type_index),
            _ => return Err(format!("constant {} is not a member reference", index).into()),
        };
        let (name, descriptor) = self.name_and_type(nat)?;
        Ok(MemberRef { class : self.class_name(class_index)?, name, descriptor })
    }

    pub fn literal(&self, index : u16) -> GeneralResult<Literal> {
        use ConstantInfo::*;
        match self.get(index)? {
            Integer(c) => Ok(Literal::Int(c.value)),
            Long(c) => Ok(Literal::Long(c.value)),
            Float(c) => Ok(Literal::Float(c.value)),
            Double(c) => Ok(Literal::Double(c.value)),
            String(c) => Ok(Literal::Str(self.utf8(c.string_index)?)),
            Class(_) => Ok(Literal::Class(self.class_name(index)?)),
            _ => Err(TranslateError::Unsupported(format!("loadable constant at pool index {}", index)).into()),
        }
    }
}

/// Big-endian cursor over raw attribute bytes.
struct Bytes<'a>(&'a [u8]);

impl Bytes<'_> {
    fn u8(&mut self) -> GeneralResult<u8> {
        let (&b, rest) = self.0.split_first().ok_or("attribute ended too soon")?;
        self.0 = rest;
        Ok(b)
    }

    fn u16(&mut self) -> GeneralResult<u16> {
        Ok(u16::from(self.u8()?) << 8 | u16::from(self.u8()?))
    }
}

fn find_attributes<'b>(pool : &ConstantPool, attrs : &'b [AttributeInfo], name : &str) -> GeneralResult<Vec<&'b [u8]>> {
    let mut out = Vec::new();
    for a in attrs {
        if pool.utf8(a.attribute_name_index)? == name {
            out.push(&a.info[..]);
        }
    }
    Ok(out)
}

fn read_element(pool : &ConstantPool, b : &mut Bytes) -> GeneralResult<ElementValue> {
    let tag = char::from(b.u8()?);
    let value = match tag {
        'B' | 'C' | 'I' | 'S' | 'Z' => {
            match pool.literal(b.u16()?)? {
                Literal::Int(v) => ElementValue::Int(v),
                _ => ElementValue::Other,
            }
        },
        'D' | 'F' | 'J' | 'c' => { b.u16()?; ElementValue::Other },
        's' => ElementValue::Str(pool.utf8(b.u16()?)?),
        'e' => { b.u16()?; b.u16()?; ElementValue::Other },
        '@' => { read_annotation(pool, b)?; ElementValue::Other },
        '[' => {
            let n = b.u16()?;
            let values : GeneralResult<Vec<_>> = (0..n).map(|_| read_element(pool, b)).collect();
            ElementValue::Array(values?)
        },
        _ => return Err(format!("unknown annotation element tag {}", tag).into()),
    };
    Ok(value)
}

fn read_annotation(pool : &ConstantPool, b : &mut Bytes) -> GeneralResult<Annotation> {
    let type_name = pool.utf8(b.u16()?)?;
    let pairs = b.u16()?;
    let mut elements = Vec::with_capacity(pairs.into());
    for _ in 0..pairs {
        let name = pool.utf8(b.u16()?)?;
        elements.push((name, read_element(pool, b)?));
    }
    Ok(Annotation { type_name, elements })
}

fn read_annotations(pool : &ConstantPool, attrs : &[AttributeInfo]) -> GeneralResult<Vec<Annotation>> {
    let mut out = Vec::new();
    for name in &[ "RuntimeInvisibleAnnotations", "RuntimeVisibleAnnotations" ] {
        for info in find_attributes(pool, attrs, name)? {
            let mut b = Bytes(info);
            for _ in 0..b.u16()? {
                out.push(read_annotation(pool, &mut b)?);
            }
        }
    }
    Ok(out)
}

fn read_constant_value(pool : &ConstantPool, attrs : &[AttributeInfo]) -> GeneralResult<Option<i32>> {
    use classfile_parser::attribute_info::constant_value_attribute_parser;

    let info = match find_attributes(pool, attrs, "ConstantValue")?.first().copied() {
        Some(info) => info,
        None => return Ok(None),
    };
    let attr = constant_value_attribute_parser(info).map_err(generic_error)?.1;
    match pool.literal(attr.constant_value_index)? {
        Literal::Int(v) => Ok(Some(v)),
        // the model has no double-word globals
        Literal::Long(v) => Ok(Some(v as i32)),
        _ => Ok(None),
    }
}

fn read_lines(pool : &ConstantPool, attrs : &[AttributeInfo]) -> GeneralResult<Vec<(usize, u16)>> {
    let mut out = Vec::new();
    for info in find_attributes(pool, attrs, "LineNumberTable")? {
        let mut b = Bytes(info);
        for _ in 0..b.u16()? {
            let start = b.u16()?;
            out.push((start.into(), b.u16()?));
        }
    }
    out.sort_unstable();
    Ok(out)
}

// returns (slot, name) pairs for locals live at offset zero
fn read_locals(pool : &ConstantPool, attrs : &[AttributeInfo]) -> GeneralResult<Vec<(u16, String)>> {
    let mut out = Vec::new();
    for info in find_attributes(pool, attrs, "LocalVariableTable")? {
        let mut b = Bytes(info);
        for _ in 0..b.u16()? {
            let start = b.u16()?;
            let _length = b.u16()?;
            let name = pool.utf8(b.u16()?)?;
            let _desc = b.u16()?;
            let slot = b.u16()?;
            if start == 0 {
                out.push((slot, name));
            }
        }
    }
    out.sort();
    Ok(out)
}

fn param_names(locals : &[(u16, String)], is_static : bool, descriptor : &str) -> GeneralResult<Vec<String>> {
    use crate::jvmtypes::args::{field_size, param_types};

    let mut slot = if is_static { 0 } else { 1 };
    let mut names = Vec::new();
    for p in param_types(descriptor)? {
        match locals.iter().find(|(s, _)| *s == slot) {
            Some((_, name)) => names.push(name.clone()),
            None => return Ok(Vec::new()),
        }
        slot += u16::from(field_size(p.chars().next().ok_or("empty parameter")?)?);
    }
    Ok(names)
}

// returns the method body and, when recoverable, its parameter names
fn read_code(pool : &ConstantPool, info : &[u8], is_static : bool, descriptor : &str)
    -> GeneralResult<(MethodCode, Vec<String>)>
{
    use classfile_parser::attribute_info::code_attribute_parser;
    use classfile_parser::code_attribute::code_parser;

    let code = code_attribute_parser(info).map_err(generic_error)?.1;
    let insns = code_parser(&code.code).map_err(generic_error)?.1;
    let ops : GeneralResult<Vec<_>> = insns.into_iter().map(|i| decode_insn(pool, i)).collect();

    let mut handlers = Vec::with_capacity(code.exception_table.len());
    for e in &code.exception_table {
        handlers.push(Handler {
            start : e.start_pc.into(),
            end : e.end_pc.into(),
            target : e.handler_pc.into(),
            catch_type : if e.catch_type == 0 { None } else { Some(pool.class_name(e.catch_type)?) },
        });
    }

    let body = MethodCode {
        max_stack : code.max_stack,
        max_locals : code.max_locals,
        ops : ops?,
        handlers,
        lines : read_lines(pool, &code.attributes)?,
    };
    let names = param_names(&read_locals(pool, &code.attributes)?, is_static, descriptor)?;
    Ok((body, names))
}

/// Parses class-file bytes into the owned class model.
pub fn read_class(bytes : &[u8], stub_prefix : Option<&str>) -> GeneralResult<ClassDef> {
    let (_, class) = classfile_parser::class_parser(bytes).map_err(generic_error)?;
    let pool = ConstantPool::new(&class.const_pool, stub_prefix);

    let name = pool.class_name(class.this_class)?;
    let malformed = |e : Box<dyn std::error::Error>|
        -> Box<dyn std::error::Error> {
            TranslateError::MalformedClass { name : name.clone(), reason : e.to_string() }.into()
        };

    let super_name = match class.super_class {
        0 => None,
        n => Some(pool.class_name(n).map_err(malformed)?),
    };
    let interfaces : GeneralResult<Vec<_>> = class.interfaces.iter().map(|&i| pool.class_name(i)).collect();
    let interfaces = interfaces.map_err(malformed)?;

    let mut fields = Vec::with_capacity(class.fields.len());
    for f in &class.fields {
        let is_final = f.access_flags.contains(FieldAccessFlags::FINAL);
        fields.push(FieldDef {
            name : pool.utf8(f.name_index)?,
            descriptor : pool.utf8(f.descriptor_index)?,
            is_static : f.access_flags.contains(FieldAccessFlags::STATIC),
            is_final,
            constant_value : if is_final { read_constant_value(&pool, &f.attributes)? } else { None },
            annotations : read_annotations(&pool, &f.attributes)?,
        });
    }

    let mut methods = Vec::with_capacity(class.methods.len());
    for m in &class.methods {
        let is_static = m.access_flags.contains(MethodAccessFlags::STATIC);
        let descriptor = pool.utf8(m.descriptor_index)?;
        let (code, param_names) = match find_attributes(&pool, &m.attributes, "Code")?.first().copied() {
            Some(info) => {
                let (code, names) = read_code(&pool, info, is_static, &descriptor).map_err(malformed)?;
                (Some(code), names)
            },
            None => (None, Vec::new()),
        };
        methods.push(MethodDef {
            name : pool.utf8(m.name_index)?,
            descriptor,
            is_static,
            is_synchronized : m.access_flags.contains(MethodAccessFlags::SYNCHRONIZED),
            is_abstract : m.access_flags.contains(MethodAccessFlags::ABSTRACT),
            is_native : m.access_flags.contains(MethodAccessFlags::NATIVE),
            code,
            annotations : read_annotations(&pool, &m.attributes)?,
            param_names,
        });
    }

    Ok(ClassDef {
        name,
        super_name,
        interfaces,
        is_interface : class.access_flags.contains(ClassAccessFlags::INTERFACE),
        fields,
        methods,
        annotations : read_annotations(&pool, &class.attributes)?,
    })
}

#[test]
fn test_bytes_cursor() -> GeneralResult<()> {
    let mut b = Bytes(&[ 0x01, 0x02, 0x03 ]);
    assert_eq!(b.u16()?, 0x0102);
    assert_eq!(b.u8()?, 0x03);
    assert!(b.u8().is_err());
    Ok(())
}

#[test]
fn test_handler_covers() {
    let h = Handler { start : 2, end : 8, target : 10, catch_type : None };
    assert!(!h.covers(1));
    assert!(h.covers(2));
    assert!(h.covers(7));
    assert!(!h.covers(8));
}

#[test]
fn test_param_names_need_every_slot() -> GeneralResult<()> {
    let locals = vec![ (0, "this".to_owned()), (1, "x".to_owned()), (3, "y".to_owned()) ];
    assert_eq!(param_names(&locals, false, "(JI)V")?, vec![ "x", "y" ]);
    assert_eq!(param_names(&locals, false, "(II)V")?, Vec::<String>::new());
    Ok(())
}

#[test]
fn test_constant_values_of_compiled_class() -> GeneralResult<()> {
    let path = std::path::Path::new(env!("OUT_DIR")).join("Counter.class");
    if !path.exists() {
        return Ok(());
    }
    let class = read_class(&std::fs::read(path)?, None)?;
    let value = |name : &str| class.fields.iter().find(|f| f.name == name).map(|f| f.constant_value);
    assert_eq!(value("LIMIT"), Some(Some(3)));
    assert_eq!(value("WIDE"), Some(Some(7)));
    assert_eq!(value("count"), Some(None));
    Ok(())
}
