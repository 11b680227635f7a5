use crate::classfile::{Annotation, ElementValue, FieldDef, MethodDef};
use crate::error::TranslateError;
use crate::GeneralResult;

#[cfg(test)]
use quickcheck::{quickcheck, TestResult};

const BITS : &str = "Lde/tum/in/jmoped/annotation/Bits;";
const PARAMETER_BITS : &str = "Lde/tum/in/jmoped/annotation/ParameterBits;";
const RANGE : &str = "Lde/tum/in/jmoped/annotation/Range;";
const ARRAY_BITS : &str = "Lde/tum/in/jmoped/annotation/ArrayBits;";
const FIELD_BITS : &str = "Lde/tum/in/jmoped/annotation/FieldBits;";

/// An inclusive integer range, optionally derived from a bit width.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Range {
    pub min : i64,
    pub max : i64,
    pub width : Option<u32>,
}

impl Range {
    pub fn new(min : i64, max : i64) -> Self {
        Range { min, max, width : None }
    }

    /// A single bit means a boolean `[0,1]`; anything wider is signed.
    /// Widths past 63 saturate; `check` still rejects them by width.
    pub fn from_bits(width : u32) -> Self {
        if width <= 1 {
            Range { min : 0, max : 1, width : Some(width) }
        } else {
            let half = 1_i64 << (width.min(63) - 1);
            Range { min : -half, max : half - 1, width : Some(width) }
        }
    }

    pub fn fits(&self, bits : u32) -> bool {
        match self.width {
            Some(w) => w <= bits,
            None => {
                let half = 1_i64 << (bits - 1);
                self.min >= -half && self.max < half
            },
        }
    }

    pub fn check(&self, bits : u32) -> GeneralResult<()> {
        if self.fits(bits) {
            return Ok(());
        }
        Err(match self.width {
            Some(width) => TranslateError::BitsTooLarge { width, bits },
            None => TranslateError::RangeTooLarge { min : self.min, max : self.max, bits },
        }.into())
    }

    pub fn size(&self) -> u64 {
        let size = i128::from(self.max) - i128::from(self.min) + 1;
        size.clamp(0, i128::from(u64::MAX)) as u64
    }
}

/// Per-parameter range metadata. `index` counts parameters, not slots, and
/// `name` is the parameter name when the class file records it.
pub trait AnnotationLookup {
    /// The value range of a scalar, or the length range of an array.
    fn param_range(&self, method : &MethodDef, index : usize, name : Option<&str>) -> Option<Range>;
    /// The value range of the elements of an array parameter.
    fn element_range(&self, method : &MethodDef, index : usize, name : Option<&str>) -> Option<Range>;
}

/// Reads the range annotations of a method and its declaring class.
pub struct ClassAnnotations<'a> {
    class : &'a [Annotation],
}

fn find<'a>(list : &'a [Annotation], type_name : &str) -> Option<&'a Annotation> {
    list.iter().find(|a| a.type_name == type_name)
}

fn first_value(a : &Annotation) -> Option<&ElementValue> {
    a.elements.first().map(|(_, v)| v)
}

fn entries(a : &Annotation) -> &[ElementValue] {
    match first_value(a) {
        Some(ElementValue::Array(v)) => v,
        _ => &[],
    }
}

fn int_value(a : &Annotation) -> Option<i32> {
    match first_value(a) {
        Some(ElementValue::Int(v)) => Some(*v),
        _ => None,
    }
}

// "x=3", "x : 3" and "x 3" all name `x`
fn named<'s>(entry : &'s str, var : &str) -> Option<&'s str> {
    let parts : Vec<_> = entry.split(|c| c == ' ' || c == ':' || c == '=').collect();
    match parts.as_slice() {
        [ first, .., last ] if *first == var => Some(*last),
        _ => None,
    }
}

fn bits_entry(values : &[ElementValue], var : Option<&str>, index : Option<usize>) -> Option<u32> {
    for (i, v) in values.iter().enumerate() {
        if let ElementValue::Str(s) = v {
            if Some(i) == index {
                if let Ok(b) = s.parse() {
                    return Some(b);
                }
            }
            if let Some(b) = var.and_then(|var| named(s, var)).and_then(|t| t.parse().ok()) {
                return Some(b);
            }
        }
    }
    match index.and_then(|i| values.get(i)) {
        Some(ElementValue::Int(b)) if *b >= 0 => Some(*b as u32),
        _ => None,
    }
}

fn parse_range(s : &str) -> Option<Range> {
    let open = s.find('[')?;
    let comma = s.find(',')?;
    let close = s.find(']')?;
    let min = s.get(open + 1..comma)?.trim().parse().ok()?;
    let max = s.get(comma + 1..close)?.trim().parse().ok()?;
    Some(Range::new(min, max))
}

fn range_entry(values : &[ElementValue], var : Option<&str>, index : Option<usize>) -> Option<Range> {
    for (i, v) in values.iter().enumerate() {
        if let ElementValue::Str(s) = v {
            if Some(i) == index {
                if let Some(r) = parse_range(s) {
                    return Some(r);
                }
            }
            if let Some(r) = var.and_then(|var| named(s, var)).and_then(parse_range) {
                return Some(r);
            }
        }
    }
    None
}

impl<'a> ClassAnnotations<'a> {
    pub fn new(class : &'a [Annotation]) -> Self {
        ClassAnnotations { class }
    }

    fn bit_values(method : &MethodDef) -> &[ElementValue] {
        find(&method.annotations, BITS)
            .or_else(|| find(&method.annotations, PARAMETER_BITS))
            .map_or(&[][..], entries)
    }

    fn range_values(method : &MethodDef) -> &[ElementValue] {
        find(&method.annotations, RANGE).map_or(&[][..], entries)
    }

    /// `ArrayBits` on the method wins over `ArrayBits` on the class.
    fn default_array_bits(&self, method : &MethodDef) -> Option<u32> {
        find(&method.annotations, ARRAY_BITS)
            .or_else(|| find(self.class, ARRAY_BITS))
            .and_then(int_value)
            .and_then(|b| if b >= 0 { Some(b as u32) } else { None })
    }
}

impl AnnotationLookup for ClassAnnotations<'_> {
    fn param_range(&self, method : &MethodDef, index : usize, name : Option<&str>) -> Option<Range> {
        range_entry(Self::range_values(method), name, Some(index))
            .or_else(|| bits_entry(Self::bit_values(method), name, Some(index)).map(Range::from_bits))
    }

    fn element_range(&self, method : &MethodDef, _index : usize, name : Option<&str>) -> Option<Range> {
        let var = name.map(|n| format!("{}[]", n));
        let var = var.as_deref();
        range_entry(Self::range_values(method), var, None)
            .or_else(|| bits_entry(Self::bit_values(method), var, None).map(Range::from_bits))
            .or_else(|| self.default_array_bits(method).map(Range::from_bits))
    }
}

/// The annotated width of a field, when there is one. `Bits` wins over
/// `FieldBits`.
pub fn field_bits(field : &FieldDef) -> Option<u32> {
    let from_bits = find(&field.annotations, BITS)
        .and_then(|a| entries(a).first())
        .and_then(|v| match v {
            ElementValue::Str(s) => s.parse().ok(),
            _ => None,
        });
    from_bits.or_else(|| {
        find(&field.annotations, FIELD_BITS)
            .and_then(int_value)
            .and_then(|b| if b >= 0 { Some(b as u32) } else { None })
    })
}

#[cfg(test)]
fn annotated(type_name : &str, value : ElementValue) -> Annotation {
    Annotation { type_name : type_name.into(), elements : vec![ ("value".into(), value) ] }
}

#[cfg(test)]
fn strings(list : &[&str]) -> ElementValue {
    ElementValue::Array(list.iter().map(|&s| ElementValue::Str(s.into())).collect())
}

#[cfg(test)]
fn method_with(annotations : Vec<Annotation>) -> MethodDef {
    MethodDef {
        name : "test".into(),
        descriptor : "(I[I)V".into(),
        is_static : true,
        is_synchronized : false,
        is_abstract : false,
        is_native : false,
        code : None,
        annotations,
        param_names : vec![ "n".into(), "a".into() ],
    }
}

#[test]
fn test_range_from_bits() {
    assert_eq!(Range::from_bits(4), Range { min : -8, max : 7, width : Some(4) });
    assert_eq!((Range::from_bits(1).min, Range::from_bits(1).max), (0, 1));
    assert!(Range::from_bits(1).fits(1));
    assert!(!Range::from_bits(5).fits(4));
    assert!(Range::new(-8, 7).fits(4));
    assert!(!Range::new(-9, 7).fits(4));
    assert!(!Range::new(0, 8).fits(4));
    assert_eq!(Range::new(-8, 7).size(), 16);
}

#[test]
fn test_range_check_messages() {
    let e = Range::new(0, 20).check(4).err().map(|e| e.to_string());
    assert_eq!(e.as_deref(), Some("the specified range [0,20] is too large for integers with 4 bits"));
    let e = Range::from_bits(6).check(4).err().map(|e| e.to_string());
    assert_eq!(e.as_deref(), Some("the specified bits 6 is too large for integers with 4 bits"));
}

#[test]
fn test_oversized_bits_are_rejected() {
    for width in &[ 63, 64, 100, u32::MAX ] {
        let r = Range::from_bits(*width);
        assert!(r.min < 0 && r.max > 0);
        assert_eq!(r.width, Some(*width));
        let e = r.check(32).err().map(|e| e.to_string());
        assert_eq!(e, Some(format!("the specified bits {} is too large for integers with 32 bits", width)));
    }
    assert_eq!(Range::from_bits(64).size(), 1_u64 << 63);

    // an annotation asking for 64 bits reaches the same error
    let m = method_with(vec![ annotated(BITS, strings(&[ "n=64" ])) ]);
    let none : [Annotation; 0] = [];
    let r = ClassAnnotations::new(&none).param_range(&m, 0, Some("n"));
    assert_eq!(r.map(|r| r.check(4).is_err()), Some(true));
}

#[test]
fn test_positional_and_named_bits() {
    let m = method_with(vec![ annotated(BITS, strings(&[ "3", "a=2" ])) ]);
    let none : [Annotation; 0] = [];
    let look = ClassAnnotations::new(&none);
    assert_eq!(look.param_range(&m, 0, Some("n")), Some(Range::from_bits(3)));
    assert_eq!(look.param_range(&m, 1, Some("a")), Some(Range::from_bits(2)));

    let m = method_with(vec![ annotated(PARAMETER_BITS, ElementValue::Array(vec![ ElementValue::Int(2) ])) ]);
    assert_eq!(look.param_range(&m, 0, None), Some(Range::from_bits(2)));
    assert_eq!(look.param_range(&m, 1, None), None);
}

#[test]
fn test_ranges_and_array_elements() {
    let m = method_with(vec![
        annotated(RANGE, strings(&[ "n=[0,5]", "a = [2,2]", "a[]=[-1,1]" ])),
    ]);
    let class = [ annotated(ARRAY_BITS, ElementValue::Int(3)) ];
    let look = ClassAnnotations::new(&class);
    assert_eq!(look.param_range(&m, 0, Some("n")), Some(Range::new(0, 5)));
    assert_eq!(look.param_range(&m, 1, Some("a")), Some(Range::new(2, 2)));
    assert_eq!(look.element_range(&m, 1, Some("a")), Some(Range::new(-1, 1)));

    let bare = method_with(vec![]);
    assert_eq!(look.element_range(&bare, 1, Some("a")), Some(Range::from_bits(3)));
    let nothing : [Annotation; 0] = [];
    assert_eq!(ClassAnnotations::new(&nothing).element_range(&bare, 1, Some("a")), None);
}

#[test]
fn test_field_bits() {
    let mut f = FieldDef {
        name : "x".into(),
        descriptor : "I".into(),
        is_static : false,
        is_final : false,
        constant_value : None,
        annotations : vec![ annotated(FIELD_BITS, ElementValue::Int(1)) ],
    };
    assert_eq!(field_bits(&f), Some(1));
    f.annotations.push(annotated(BITS, strings(&[ "2" ])));
    assert_eq!(field_bits(&f), Some(2));
}

#[cfg(test)]
quickcheck! {
    fn prop_bits_range_fits_exactly(width : u8, bits : u8) -> TestResult {
        let (width, bits) = (u32::from(width % 32) + 2, u32::from(bits % 32) + 2);
        let r = Range::from_bits(width);
        let as_plain = Range::new(r.min, r.max);
        TestResult::from_bool(r.fits(bits) == (width <= bits) && as_plain.fits(bits) == r.fits(bits))
    }
}
