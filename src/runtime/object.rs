//! Heap object layouts.
//!
//! Every heap object starts with an [`ObjectHeader`] followed by `words`
//! payload words. The discriminant in the header selects a [`Layout`] which
//! tells the collector which payload words hold [`Value`]s; everything else
//! (lengths, raw bits, bytes) is opaque to it.

use std::{
    mem::size_of,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::runtime::{
    error::contract_violation,
    value::{Kind, Value},
};

#[repr(C)]
pub struct ObjectHeader {
    kind: u8,
    mark: AtomicU8,
    flags: u8,
    _pad: u8,
    words: u32,
}

pub const HEADER_WORDS: usize = size_of::<ObjectHeader>() / size_of::<usize>();

pub const FLAG_HAS_FINALIZER: u8 = 0b01;

impl ObjectHeader {
    #[inline(always)]
    pub const fn new(kind: Kind, words: u32) -> Self {
        Self {
            kind: kind as u8,
            mark: AtomicU8::new(0),
            flags: 0,
            _pad: 0,
            words,
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> Kind {
        Kind::from_header_byte(self.kind)
    }

    #[inline(always)]
    pub fn words(&self) -> usize {
        self.words as usize
    }

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Relaxed) != 0
    }

    /// Sets the mark bit, returning `true` if it was previously clear.
    #[inline(always)]
    pub fn try_mark(&self) -> bool {
        self.mark.swap(1, Ordering::Relaxed) == 0
    }

    #[inline(always)]
    pub fn clear_mark(&self) {
        self.mark.store(0, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    #[inline(always)]
    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    #[inline(always)]
    pub fn clear_flag(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut usize {
        unsafe { (self as *const Self as *mut Self).add(1).cast() }
    }
}

/// Variable-length part of an object, sized by one of its fixed words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    None,
    Values { length_word: usize },
    Words { length_word: usize },
    Bytes { length_word: usize },
}

#[derive(Debug)]
pub struct Layout {
    pub fixed_words: usize,
    /// Indices of fixed words holding values.
    pub value_words: &'static [usize],
    pub tail: Tail,
}

impl Layout {
    /// Payload words of an object of this layout whose tail has `length` items.
    pub const fn payload_words(&self, length: usize) -> usize {
        self.fixed_words
            + match self.tail {
                Tail::None => 0,
                Tail::Values { .. } | Tail::Words { .. } => length,
                Tail::Bytes { .. } => (length + size_of::<usize>()) / size_of::<usize>(),
            }
    }
}

pub const DOUBLE_WORDS: usize = size_of::<f64>() / size_of::<usize>();

pub mod word {
    pub const BIGNUM_SIGN: usize = 0;
    pub const BIGNUM_LENGTH: usize = 1;
    pub const RATIO_NUM: usize = 0;
    pub const RATIO_DEN: usize = 1;
    pub const COMPLEX_REAL: usize = 0;
    pub const COMPLEX_IMAG: usize = 1;
    pub const DOUBLE_BITS: usize = 0;
    pub const CAR: usize = 0;
    pub const CDR: usize = 1;
    pub const SYMBOL_NAME: usize = 0;
    pub const SYMBOL_VALUE: usize = 1;
    pub const SYMBOL_FUNCTION: usize = 2;
    pub const SYMBOL_PLIST: usize = 3;
    pub const SYMBOL_PACKAGE: usize = 4;
    pub const SYMBOL_BINDING_INDEX: usize = 5;
    pub const SYMBOL_FLAGS: usize = 6;
    pub const STRING_LENGTH: usize = 0;
    pub const VECTOR_LENGTH: usize = 0;
    pub const CLOSURE_ENTRY: usize = 0;
    pub const CLOSURE_ENV: usize = 1;
    pub const CLOSURE_NAME: usize = 2;
    pub const STREAM_MODE: usize = 0;
    pub const STREAM_POSITION: usize = 1;
    pub const STREAM_ELEMENT_TYPE: usize = 2;
    pub const STREAM_BUFFER: usize = 3;
    pub const STREAM_HANDLE: usize = 4;
    pub const STRUCT_TYPE: usize = 0;
    pub const STRUCT_LENGTH: usize = 1;
    pub const FOREIGN_ADDRESS: usize = 0;
    pub const FOREIGN_SIZE: usize = 1;
    pub const FOREIGN_TAG: usize = 2;
}

static BIGNUM_LAYOUT: Layout = Layout {
    fixed_words: 2,
    value_words: &[],
    tail: Tail::Words {
        length_word: word::BIGNUM_LENGTH,
    },
};
static RATIO_LAYOUT: Layout = Layout {
    fixed_words: 2,
    value_words: &[word::RATIO_NUM, word::RATIO_DEN],
    tail: Tail::None,
};
static COMPLEX_LAYOUT: Layout = Layout {
    fixed_words: 2,
    value_words: &[word::COMPLEX_REAL, word::COMPLEX_IMAG],
    tail: Tail::None,
};
static DOUBLE_LAYOUT: Layout = Layout {
    fixed_words: DOUBLE_WORDS,
    value_words: &[],
    tail: Tail::None,
};
static CONS_LAYOUT: Layout = Layout {
    fixed_words: 2,
    value_words: &[word::CAR, word::CDR],
    tail: Tail::None,
};
static SYMBOL_LAYOUT: Layout = Layout {
    fixed_words: 7,
    value_words: &[
        word::SYMBOL_NAME,
        word::SYMBOL_VALUE,
        word::SYMBOL_FUNCTION,
        word::SYMBOL_PLIST,
        word::SYMBOL_PACKAGE,
    ],
    tail: Tail::None,
};
static STRING_LAYOUT: Layout = Layout {
    fixed_words: 1,
    value_words: &[],
    tail: Tail::Bytes {
        length_word: word::STRING_LENGTH,
    },
};
static VECTOR_LAYOUT: Layout = Layout {
    fixed_words: 1,
    value_words: &[],
    tail: Tail::Values {
        length_word: word::VECTOR_LENGTH,
    },
};
static CLOSURE_LAYOUT: Layout = Layout {
    fixed_words: 3,
    value_words: &[word::CLOSURE_ENV, word::CLOSURE_NAME],
    tail: Tail::None,
};
static STREAM_LAYOUT: Layout = Layout {
    fixed_words: 5,
    value_words: &[word::STREAM_ELEMENT_TYPE, word::STREAM_BUFFER],
    tail: Tail::None,
};
static STRUCTURE_LAYOUT: Layout = Layout {
    fixed_words: 2,
    value_words: &[word::STRUCT_TYPE],
    tail: Tail::Values {
        length_word: word::STRUCT_LENGTH,
    },
};
static FOREIGN_LAYOUT: Layout = Layout {
    fixed_words: 3,
    value_words: &[word::FOREIGN_TAG],
    tail: Tail::None,
};
static OPAQUE_LAYOUT: Layout = Layout {
    fixed_words: 0,
    value_words: &[],
    tail: Tail::None,
};

pub fn layout(kind: Kind) -> &'static Layout {
    match kind {
        Kind::Bignum => &BIGNUM_LAYOUT,
        Kind::Ratio => &RATIO_LAYOUT,
        Kind::Complex => &COMPLEX_LAYOUT,
        Kind::DoubleFloat => &DOUBLE_LAYOUT,
        Kind::Cons => &CONS_LAYOUT,
        Kind::Symbol => &SYMBOL_LAYOUT,
        Kind::String => &STRING_LAYOUT,
        Kind::Vector => &VECTOR_LAYOUT,
        Kind::Closure => &CLOSURE_LAYOUT,
        Kind::Stream => &STREAM_LAYOUT,
        Kind::Structure => &STRUCTURE_LAYOUT,
        Kind::Foreign => &FOREIGN_LAYOUT,
        _ => &OPAQUE_LAYOUT,
    }
}

/// Calls `visit` with every value slot of `object`, as described by its layout.
///
/// # Safety
///
/// `object` must point to an initialized object header.
pub(crate) unsafe fn for_each_value_slot(
    object: *mut ObjectHeader,
    mut visit: impl FnMut(*mut Value),
) {
    let header = &*object;
    let words = header.words();
    let payload = header.payload();
    let layout = layout(header.kind());

    for &index in layout.value_words {
        if index < words {
            visit(payload.add(index).cast());
        }
    }

    if let Tail::Values { length_word } = layout.tail {
        if length_word >= words {
            return;
        }
        let length = payload.add(length_word).read();
        let room = words.saturating_sub(layout.fixed_words);
        if length > room {
            contract_violation(|| {
                format!("{} of length {} in {} payload words", header.kind().name(), length, words)
            });
        }
        let end = layout.fixed_words + length.min(room);
        for index in layout.fixed_words..end {
            visit(payload.add(index).cast());
        }
    }
}

/// Value-holding fields addressable through [`field_get`] and [`field_set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Car,
    Cdr,
    SymbolName,
    SymbolValue,
    SymbolFunction,
    SymbolPlist,
    SymbolPackage,
    RatioNumerator,
    RatioDenominator,
    ComplexReal,
    ComplexImag,
    VectorElt(usize),
    StructType,
    StructSlot(usize),
    ClosureEnv,
    ClosureName,
    StreamElementType,
    StreamBuffer,
    ForeignTag,
}

impl Field {
    /// Owning discriminant and payload word of the field.
    pub const fn position(self) -> (Kind, usize) {
        match self {
            Field::Car => (Kind::Cons, word::CAR),
            Field::Cdr => (Kind::Cons, word::CDR),
            Field::SymbolName => (Kind::Symbol, word::SYMBOL_NAME),
            Field::SymbolValue => (Kind::Symbol, word::SYMBOL_VALUE),
            Field::SymbolFunction => (Kind::Symbol, word::SYMBOL_FUNCTION),
            Field::SymbolPlist => (Kind::Symbol, word::SYMBOL_PLIST),
            Field::SymbolPackage => (Kind::Symbol, word::SYMBOL_PACKAGE),
            Field::RatioNumerator => (Kind::Ratio, word::RATIO_NUM),
            Field::RatioDenominator => (Kind::Ratio, word::RATIO_DEN),
            Field::ComplexReal => (Kind::Complex, word::COMPLEX_REAL),
            Field::ComplexImag => (Kind::Complex, word::COMPLEX_IMAG),
            Field::VectorElt(i) => (Kind::Vector, 1 + i),
            Field::StructType => (Kind::Structure, word::STRUCT_TYPE),
            Field::StructSlot(i) => (Kind::Structure, 2 + i),
            Field::ClosureEnv => (Kind::Closure, word::CLOSURE_ENV),
            Field::ClosureName => (Kind::Closure, word::CLOSURE_NAME),
            Field::StreamElementType => (Kind::Stream, word::STREAM_ELEMENT_TYPE),
            Field::StreamBuffer => (Kind::Stream, word::STREAM_BUFFER),
            Field::ForeignTag => (Kind::Foreign, word::FOREIGN_TAG),
        }
    }
}

/// Address of a field, or `None` when the access would leave the object.
///
/// The discriminant check only runs in debug builds; release builds only
/// keep the access inside the object's own extent.
#[inline]
fn locate(object: Value, field: Field) -> Option<*mut Value> {
    if !object.is_heap_ref() {
        contract_violation(|| format!("{:?} of non-heap value {:#x}", field, object.raw()));
        return None;
    }

    let header = unsafe { &*object.as_object() };
    let (kind, index) = field.position();

    if cfg!(debug_assertions) && header.kind() != kind {
        contract_violation(|| format!("{:?} of a {}", field, header.kind().name()));
    }

    if index >= header.words() {
        contract_violation(|| format!("{:?} is outside of a {}", field, header.kind().name()));
        return None;
    }

    Some(unsafe { header.payload().add(index).cast() })
}

#[inline]
pub fn field_get(object: Value, field: Field) -> Value {
    match locate(object, field) {
        Some(slot) => unsafe { slot.read() },
        None => Value::EMPTY,
    }
}

#[inline]
pub fn field_set(object: Value, field: Field, value: Value) {
    if let Some(slot) = locate(object, field) {
        unsafe { slot.write(value) }
    }
}

/// Raw payload word `index` of a heap object, bounds-checked against its extent.
#[inline]
pub(crate) fn raw_word(object: Value, kind: Kind, index: usize) -> usize {
    debug_assert!(object.is_kind(kind), "expected {}, got {:?}", kind.name(), object.classify());
    let header = unsafe { &*object.as_object() };
    if index >= header.words() {
        contract_violation(|| format!("word {} outside of a {}", index, kind.name()));
        return 0;
    }
    unsafe { header.payload().add(index).read() }
}

#[inline]
pub(crate) fn set_raw_word(object: Value, kind: Kind, index: usize, bits: usize) {
    debug_assert!(object.is_kind(kind), "expected {}, got {:?}", kind.name(), object.classify());
    let header = unsafe { &*object.as_object() };
    if index >= header.words() {
        contract_violation(|| format!("word {} outside of a {}", index, kind.name()));
        return;
    }
    unsafe { header.payload().add(index).write(bits) }
}

pub fn car(cons: Value) -> Value {
    field_get(cons, Field::Car)
}

pub fn cdr(cons: Value) -> Value {
    field_get(cons, Field::Cdr)
}

pub fn set_car(cons: Value, value: Value) {
    field_set(cons, Field::Car, value)
}

pub fn set_cdr(cons: Value, value: Value) {
    field_set(cons, Field::Cdr, value)
}

pub fn vector_len(vector: Value) -> usize {
    raw_word(vector, Kind::Vector, word::VECTOR_LENGTH)
}

pub fn vector_ref(vector: Value, index: usize) -> Value {
    if index >= vector_len(vector) {
        contract_violation(|| format!("index {} out of bounds", index));
        return Value::EMPTY;
    }
    field_get(vector, Field::VectorElt(index))
}

pub fn vector_set(vector: Value, index: usize, value: Value) {
    if index >= vector_len(vector) {
        contract_violation(|| format!("index {} out of bounds", index));
        return;
    }
    field_set(vector, Field::VectorElt(index), value)
}

pub fn string_len(string: Value) -> usize {
    raw_word(string, Kind::String, word::STRING_LENGTH)
}

/// Byte contents of a string object, never longer than its payload.
/// Empty for anything else.
///
/// # Safety
///
/// The returned slice is only valid while `string` stays reachable.
unsafe fn string_bytes<'a>(string: Value) -> &'a [u8] {
    if !string.is_string() {
        contract_violation(|| format!("{:?} is not a string", string.classify()));
        return &[];
    }
    let header = &*string.as_object();
    let capacity = header.words().saturating_sub(1) * size_of::<usize>();
    let len = string_len(string);
    if len > capacity {
        contract_violation(|| format!("string length {} exceeds {} bytes", len, capacity));
    }
    std::slice::from_raw_parts(header.payload().add(1).cast::<u8>(), len.min(capacity))
}

/// Borrow the UTF-8 contents of a string object.
///
/// # Safety
///
/// The returned slice is only valid while `string` stays reachable. The
/// bytes are trusted to be UTF-8, as every string constructor writes them.
pub unsafe fn string_str<'a>(string: Value) -> &'a str {
    std::str::from_utf8_unchecked(string_bytes(string))
}

/// Owned copy of a string object's contents. Bytes that are not UTF-8 are
/// replaced; non-strings give an empty string.
pub fn string_to_string(string: Value) -> String {
    String::from_utf8_lossy(unsafe { string_bytes(string) }).into_owned()
}

pub fn double_value(double: Value) -> f64 {
    debug_assert!(double.is_kind(Kind::DoubleFloat));
    unsafe {
        (*double.as_object())
            .payload()
            .cast::<f64>()
            .read_unaligned()
    }
}

pub fn bignum_negative(bignum: Value) -> bool {
    raw_word(bignum, Kind::Bignum, word::BIGNUM_SIGN) != 0
}

/// Magnitude limbs of a bignum, least significant first.
pub fn bignum_limbs(bignum: Value) -> Vec<usize> {
    let len = raw_word(bignum, Kind::Bignum, word::BIGNUM_LENGTH);
    (0..len)
        .map(|i| raw_word(bignum, Kind::Bignum, 2 + i))
        .collect()
}

pub fn symbol_name(symbol: Value) -> Value {
    field_get(symbol, Field::SymbolName)
}

pub fn symbol_binding_index(symbol: Value) -> usize {
    raw_word(symbol, Kind::Symbol, word::SYMBOL_BINDING_INDEX)
}

pub const SYMBOL_SPECIAL: usize = 0b01;
pub const SYMBOL_CONSTANT: usize = 0b10;

pub fn symbol_flags(symbol: Value) -> usize {
    raw_word(symbol, Kind::Symbol, word::SYMBOL_FLAGS)
}

pub fn set_symbol_flags(symbol: Value, flags: usize) {
    set_raw_word(symbol, Kind::Symbol, word::SYMBOL_FLAGS, flags)
}

pub fn structure_len(structure: Value) -> usize {
    raw_word(structure, Kind::Structure, word::STRUCT_LENGTH)
}

pub fn foreign_address(foreign: Value) -> usize {
    raw_word(foreign, Kind::Foreign, word::FOREIGN_ADDRESS)
}

pub fn foreign_size(foreign: Value) -> usize {
    raw_word(foreign, Kind::Foreign, word::FOREIGN_SIZE)
}

/// Direction of a stream object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StreamMode {
    Input = 1,
    Output = 2,
    Io = 3,
}

pub fn stream_mode(stream: Value) -> Option<StreamMode> {
    match raw_word(stream, Kind::Stream, word::STREAM_MODE) {
        1 => Some(StreamMode::Input),
        2 => Some(StreamMode::Output),
        3 => Some(StreamMode::Io),
        _ => None,
    }
}

pub fn stream_position(stream: Value) -> usize {
    raw_word(stream, Kind::Stream, word::STREAM_POSITION)
}

pub fn set_stream_position(stream: Value, position: usize) {
    set_raw_word(stream, Kind::Stream, word::STREAM_POSITION, position)
}

pub fn stream_handle(stream: Value) -> usize {
    raw_word(stream, Kind::Stream, word::STREAM_HANDLE)
}

/// Collects the elements of a proper list.
pub fn list_to_vec(mut list: Value) -> Vec<Value> {
    let mut out = vec![];
    while list.is_cons() {
        out.push(car(list));
        list = cdr(list);
    }
    out
}
