//! Tagged values.
//!
//! A [`Value`] is one machine word. The low [`TagConfig::tag_bits`] bits select
//! the representation:
//!
//! ```text
//!     ....PPPP:PPPP:P000   heap reference (address of an object header, never 0)
//!     0000:0000:0000:0000  Empty (contents of a zero-initialized slot)
//!     IIII:IIII:IIII:III1  fixnum (word width minus one bit, signed)
//!     CCCC:CCCC:CCCC:C010  character (Unicode scalar value)
//!     NNNN:NNNN:NNNN:N100  constant (nil, t, eof, unbound)
//!     FFFF:FFFF:0000:0110  single float (64-bit targets only)
//! ```
//!
//! Heap objects are allocated on granule boundaries, so a heap reference
//! always has its tag bits clear and can never collide with an immediate.

use std::fmt;

use crate::runtime::{error::contract_violation, object};

/// Build-time description of the tag layout for the target word size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagConfig {
    pub word_bits: u32,
    pub tag_bits: u32,
    /// Allocation granule; every heap reference is a multiple of it.
    pub granule: usize,
    pub fixnum_bits: u32,
    pub immediate_single_float: bool,
}

impl TagConfig {
    pub const fn for_word_bits(word_bits: u32) -> Self {
        Self {
            word_bits,
            tag_bits: 3,
            granule: 8,
            fixnum_bits: word_bits - 1,
            immediate_single_float: word_bits >= 64,
        }
    }

    pub const fn tag_mask(&self) -> usize {
        (1 << self.tag_bits) - 1
    }

    pub const fn most_positive_fixnum(&self) -> isize {
        (1isize << (self.fixnum_bits - 1)) - 1
    }

    pub const fn most_negative_fixnum(&self) -> isize {
        -(1isize << (self.fixnum_bits - 1))
    }
}

pub const TAG_CONFIG: TagConfig = TagConfig::for_word_bits(usize::BITS);

pub const FIXNUM_TAG: usize = 0b1;
pub const POINTER_TAG: usize = 0b000;
pub const CHARACTER_TAG: usize = 0b010;
pub const CONSTANT_TAG: usize = 0b100;
pub const SINGLE_FLOAT_TAG: usize = 0b110;

/// Discriminant of a value: the header kind of heap objects, or the
/// immediate representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Kind {
    /// Header of a reclaimed cell. Only seen through dangling references.
    Free = 0,
    Bignum = 1,
    Ratio,
    Complex,
    DoubleFloat,
    Cons,
    Symbol,
    String,
    Vector,
    Closure,
    Stream,
    Structure,
    Foreign,

    Empty = 64,
    Fixnum,
    Character,
    SingleFloat,
    Constant,

    /// Any bit pattern that decodes to nothing known.
    Invalid = 255,
}

impl Kind {
    pub const HEAP_KINDS: [Kind; 12] = [
        Kind::Bignum,
        Kind::Ratio,
        Kind::Complex,
        Kind::DoubleFloat,
        Kind::Cons,
        Kind::Symbol,
        Kind::String,
        Kind::Vector,
        Kind::Closure,
        Kind::Stream,
        Kind::Structure,
        Kind::Foreign,
    ];

    pub const fn from_header_byte(byte: u8) -> Kind {
        match byte {
            0 => Kind::Free,
            1 => Kind::Bignum,
            2 => Kind::Ratio,
            3 => Kind::Complex,
            4 => Kind::DoubleFloat,
            5 => Kind::Cons,
            6 => Kind::Symbol,
            7 => Kind::String,
            8 => Kind::Vector,
            9 => Kind::Closure,
            10 => Kind::Stream,
            11 => Kind::Structure,
            12 => Kind::Foreign,
            _ => Kind::Invalid,
        }
    }

    pub const fn is_immediate(self) -> bool {
        matches!(
            self,
            Kind::Empty | Kind::Fixnum | Kind::Character | Kind::SingleFloat | Kind::Constant
        )
    }

    pub const fn is_heap(self) -> bool {
        (self as u8) >= Kind::Bignum as u8 && (self as u8) <= Kind::Foreign as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Kind::Free => "free",
            Kind::Bignum => "bignum",
            Kind::Ratio => "ratio",
            Kind::Complex => "complex",
            Kind::DoubleFloat => "double-float",
            Kind::Cons => "cons",
            Kind::Symbol => "symbol",
            Kind::String => "string",
            Kind::Vector => "vector",
            Kind::Closure => "closure",
            Kind::Stream => "stream",
            Kind::Structure => "structure",
            Kind::Foreign => "foreign",
            Kind::Empty => "empty",
            Kind::Fixnum => "fixnum",
            Kind::Character => "character",
            Kind::SingleFloat => "single-float",
            Kind::Constant => "constant",
            Kind::Invalid => "invalid",
        }
    }
}

/// Enumerated constants encoded with [`CONSTANT_TAG`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Constant {
    Nil = 0,
    T = 1,
    Eof = 2,
    Unbound = 3,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Value(usize);

/// Encodes an immediate of `kind` from its payload bits. Never allocates.
///
/// For fixnums the payload is a two's-complement `isize` reinterpreted as
/// `usize`; bits that do not fit the fixnum range are lost.
pub fn tag_immediate(kind: Kind, bits: usize) -> Value {
    match kind {
        Kind::Empty => Value::EMPTY,
        Kind::Fixnum => Value((bits << 1) | FIXNUM_TAG),
        Kind::Character => Value((bits << TAG_CONFIG.tag_bits) | CHARACTER_TAG),
        Kind::Constant => Value((bits << TAG_CONFIG.tag_bits) | CONSTANT_TAG),
        Kind::SingleFloat if TAG_CONFIG.immediate_single_float => {
            Value(((bits & 0xffff_ffff) << 32) | SINGLE_FLOAT_TAG)
        }
        _ => {
            contract_violation(|| format!("{} is not an immediate kind", kind.name()));
            Value::EMPTY
        }
    }
}

impl Value {
    pub const EMPTY: Value = Value(0);
    pub const NIL: Value = Value::constant(Constant::Nil);
    pub const T: Value = Value::constant(Constant::T);
    pub const EOF: Value = Value::constant(Constant::Eof);
    pub const UNBOUND: Value = Value::constant(Constant::Unbound);

    /// Reinterprets a word as a value.
    ///
    /// # Safety
    ///
    /// `bits` must be an immediate or the header address of a live heap
    /// object: [`Value::classify`] reads the header of anything tagged as a
    /// heap reference. Words of unknown origin go through
    /// [`VirtualMachine::decode`](crate::vm::VirtualMachine::decode).
    #[inline(always)]
    pub const unsafe fn from_raw(bits: usize) -> Self {
        Self(bits)
    }

    #[inline(always)]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn constant(c: Constant) -> Self {
        Self(((c as usize) << TAG_CONFIG.tag_bits) | CONSTANT_TAG)
    }

    #[inline(always)]
    pub fn boolean(x: bool) -> Self {
        if x {
            Self::T
        } else {
            Self::NIL
        }
    }

    #[inline]
    pub fn fixnum(x: isize) -> Self {
        debug_assert!(
            x >= TAG_CONFIG.most_negative_fixnum() && x <= TAG_CONFIG.most_positive_fixnum(),
            "{} is out of fixnum range",
            x
        );
        tag_immediate(Kind::Fixnum, x as usize)
    }

    #[inline]
    pub fn fits_fixnum(x: i128) -> bool {
        x >= TAG_CONFIG.most_negative_fixnum() as i128 && x <= TAG_CONFIG.most_positive_fixnum() as i128
    }

    #[inline]
    pub fn character(c: char) -> Self {
        tag_immediate(Kind::Character, c as usize)
    }

    #[inline]
    pub fn single_float(x: f32) -> Self {
        tag_immediate(Kind::SingleFloat, x.to_bits() as usize)
    }

    /// # Safety
    ///
    /// `ptr` must be the header address of a live heap object.
    #[inline(always)]
    pub unsafe fn from_object(ptr: *const object::ObjectHeader) -> Self {
        debug_assert_eq!(ptr as usize & TAG_CONFIG.tag_mask(), 0);
        Self(ptr as usize)
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_TAG != 0
    }

    #[inline(always)]
    pub fn is_heap_ref(self) -> bool {
        self.0 != 0 && self.0 & TAG_CONFIG.tag_mask() == POINTER_TAG
    }

    #[inline(always)]
    pub fn is_character(self) -> bool {
        self.0 & TAG_CONFIG.tag_mask() == CHARACTER_TAG
    }

    #[inline(always)]
    pub fn is_constant(self) -> bool {
        self.0 & TAG_CONFIG.tag_mask() == CONSTANT_TAG
    }

    #[inline(always)]
    pub fn is_single_float(self) -> bool {
        TAG_CONFIG.immediate_single_float && self.0 & TAG_CONFIG.tag_mask() == SINGLE_FLOAT_TAG
    }

    #[inline(always)]
    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    #[inline(always)]
    pub fn is_true(self) -> bool {
        self != Self::NIL
    }

    #[inline]
    pub fn get_fixnum(self) -> isize {
        debug_assert!(self.is_fixnum());
        (self.0 as isize) >> 1
    }

    #[inline]
    pub fn get_character(self) -> char {
        debug_assert!(self.is_character());
        char::from_u32((self.0 >> TAG_CONFIG.tag_bits) as u32).unwrap_or(char::REPLACEMENT_CHARACTER)
    }

    #[inline]
    pub fn get_single_float(self) -> f32 {
        debug_assert!(self.is_single_float());
        f32::from_bits((self.0 >> 32) as u32)
    }

    /// Payload bits of an immediate, the inverse of [`tag_immediate`].
    pub fn immediate_bits(self) -> usize {
        match self.classify() {
            Kind::Fixnum => self.get_fixnum() as usize,
            Kind::Character | Kind::Constant => self.0 >> TAG_CONFIG.tag_bits,
            Kind::SingleFloat => self.0 >> 32,
            _ => 0,
        }
    }

    #[inline(always)]
    pub fn as_object(self) -> *mut object::ObjectHeader {
        debug_assert!(self.is_heap_ref());
        self.0 as *mut object::ObjectHeader
    }

    /// Discriminant of this value. Total: malformed immediates decode to
    /// [`Kind::Invalid`] and reclaimed cells to [`Kind::Free`]. Only values
    /// built safely (or under [`Value::from_raw`]'s contract) reach the header
    /// read.
    #[inline]
    pub fn classify(self) -> Kind {
        let bits = self.0;
        if bits & FIXNUM_TAG != 0 {
            return Kind::Fixnum;
        }
        match bits & TAG_CONFIG.tag_mask() {
            POINTER_TAG if bits == 0 => Kind::Empty,
            POINTER_TAG => unsafe { (*self.as_object()).kind() },
            CHARACTER_TAG => Kind::Character,
            CONSTANT_TAG => Kind::Constant,
            SINGLE_FLOAT_TAG if TAG_CONFIG.immediate_single_float => Kind::SingleFloat,
            _ => Kind::Invalid,
        }
    }

    #[inline]
    pub fn is_kind(self, kind: Kind) -> bool {
        if kind.is_heap() {
            self.is_heap_ref() && self.classify() == kind
        } else {
            self.classify() == kind
        }
    }

    pub fn is_cons(self) -> bool {
        self.is_kind(Kind::Cons)
    }

    pub fn is_symbol(self) -> bool {
        self.is_kind(Kind::Symbol)
    }

    pub fn is_string(self) -> bool {
        self.is_kind(Kind::String)
    }

    pub fn is_vector(self) -> bool {
        self.is_kind(Kind::Vector)
    }

    pub fn is_closure(self) -> bool {
        self.is_kind(Kind::Closure)
    }

    /// `nil` or a cons.
    pub fn is_list(self) -> bool {
        self.is_nil() || self.is_cons()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.classify() {
            Kind::Empty => f.write_str("#<empty>"),
            Kind::Fixnum => write!(f, "{}", self.get_fixnum()),
            Kind::Character => write!(f, "#\\{}", self.get_character()),
            Kind::SingleFloat => write!(f, "{:?}f0", self.get_single_float()),
            Kind::Constant => match *self {
                Value::NIL => f.write_str("nil"),
                Value::T => f.write_str("t"),
                Value::EOF => f.write_str("#<eof>"),
                Value::UNBOUND => f.write_str("#<unbound>"),
                _ => write!(f, "#<constant {}>", self.immediate_bits()),
            },
            Kind::Symbol => {
                let name = object::field_get(*self, object::Field::SymbolName);
                if name.is_string() {
                    f.write_str(&object::string_to_string(name))
                } else {
                    write!(f, "#<symbol {:#x}>", self.0)
                }
            }
            Kind::String => write!(f, "{:?}", object::string_to_string(*self)),
            Kind::DoubleFloat => write!(f, "{:?}d0", object::double_value(*self)),
            kind => write!(f, "#<{} {:#x}>", kind.name(), self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediates_classify_to_their_kind() {
        for (kind, bits) in [
            (Kind::Fixnum, 0usize),
            (Kind::Fixnum, 42),
            (Kind::Fixnum, (-7isize) as usize),
            (Kind::Character, 'λ' as usize),
            (Kind::Constant, Constant::T as usize),
            (Kind::Empty, 0),
        ] {
            assert_eq!(tag_immediate(kind, bits).classify(), kind);
        }
        if TAG_CONFIG.immediate_single_float {
            let v = tag_immediate(Kind::SingleFloat, 1.5f32.to_bits() as usize);
            assert_eq!(v.classify(), Kind::SingleFloat);
            assert_eq!(v.get_single_float(), 1.5);
        }
    }

    #[test]
    fn identity_is_bitwise() {
        assert_eq!(Value::fixnum(12), Value::fixnum(12));
        assert_ne!(Value::fixnum(12), Value::fixnum(13));
        assert_eq!(Value::character('a'), tag_immediate(Kind::Character, 'a' as usize));
        assert_eq!(Value::NIL, Value::constant(Constant::Nil));
        assert_ne!(Value::NIL, Value::EMPTY);
    }

    #[test]
    fn fixnum_range_round_trips_at_the_edges() {
        let max = TAG_CONFIG.most_positive_fixnum();
        let min = TAG_CONFIG.most_negative_fixnum();
        assert_eq!(Value::fixnum(max).get_fixnum(), max);
        assert_eq!(Value::fixnum(min).get_fixnum(), min);
        assert!(Value::fits_fixnum(max as i128));
        assert!(!Value::fits_fixnum(max as i128 + 1));
    }

    #[test]
    fn immediates_never_look_like_heap_references() {
        for v in [
            Value::fixnum(8),
            Value::character('x'),
            Value::NIL,
            Value::T,
            Value::EOF,
            Value::EMPTY,
        ] {
            assert!(!v.is_heap_ref(), "{:?}", v);
        }
    }

    #[test]
    fn malformed_tags_decode_to_invalid() {
        if !TAG_CONFIG.immediate_single_float {
            assert_eq!(unsafe { Value::from_raw(SINGLE_FLOAT_TAG) }.classify(), Kind::Invalid);
        }
        assert_eq!(Kind::from_header_byte(200), Kind::Invalid);
        assert_eq!(Kind::from_header_byte(0), Kind::Free);
    }

    #[test]
    fn debug_rendering_of_immediates() {
        assert_eq!(format!("{:?}", Value::fixnum(-3)), "-3");
        assert_eq!(format!("{:?}", Value::character('a')), "#\\a");
        assert_eq!(format!("{:?}", Value::NIL), "nil");
        assert_eq!(format!("{:?}", Value::EMPTY), "#<empty>");
    }
}
