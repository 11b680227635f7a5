use thiserror::Error;

/// Fatal translation failures. Coverage gaps are not errors and never produce
/// one of these; they degrade to stack-preserving fallback rules instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("file for class {0} not found in any search path")]
    MissingClass(String),

    #[error("method not found: {0}")]
    MissingMethod(String),

    #[error("malformed class file for {name}: {reason}")]
    MalformedClass { name : String, reason : String },

    #[error("malformed descriptor {0}")]
    Descriptor(String),

    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("the specified range [{min},{max}] is too large for integers with {bits} bits")]
    RangeTooLarge { min : i64, max : i64, bits : u32 },

    #[error("the specified bits {width} is too large for integers with {bits} bits")]
    BitsTooLarge { width : u32, bits : u32 },

    #[error("the heap size is too small for the specified range(s); a heap of size at least {0} is required")]
    HeapTooSmall(usize),
}

#[test]
fn test_error_messages() {
    let e = TranslateError::RangeTooLarge { min : -9, max : 7, bits : 4 };
    assert_eq!(e.to_string(), "the specified range [-9,7] is too large for integers with 4 bits");

    let e = TranslateError::Unsupported("invokedynamic".into());
    assert!(e.to_string().contains("invokedynamic"));
}
