//! Typed allocation entry points.
//!
//! Arguments are kept on the caller's stack while the object is allocated,
//! so with conservative stack scanning they survive a collection triggered
//! by the allocation itself.

use crate::{
    runtime::{
        object::{self, layout, set_raw_word, word, StreamMode, DOUBLE_WORDS},
        value::{Kind, Value},
    },
    vm::{control::ClosureEntry, thread::Thread},
};

impl Thread {
    pub fn cons(&self, car: Value, cdr: Value) -> Value {
        let cons = self.allocate_words(Kind::Cons, 2);
        object::set_car(cons, car);
        object::set_cdr(cons, cdr);
        cons
    }

    pub fn list(&self, elements: &[Value]) -> Value {
        let mut list = Value::NIL;
        for element in elements.iter().rev() {
            list = self.cons(*element, list);
        }
        list
    }

    pub fn make_vector(&self, len: usize, fill: Value) -> Value {
        let vector = self.allocate_words(Kind::Vector, layout(Kind::Vector).payload_words(len));
        set_raw_word(vector, Kind::Vector, word::VECTOR_LENGTH, len);
        if fill != Value::EMPTY {
            for i in 0..len {
                object::vector_set(vector, i, fill);
            }
        }
        vector
    }

    pub fn make_string(&self, contents: &str) -> Value {
        let len = contents.len();
        let string = self.allocate_words(Kind::String, layout(Kind::String).payload_words(len));
        set_raw_word(string, Kind::String, word::STRING_LENGTH, len);
        unsafe {
            let bytes = (*string.as_object()).payload().add(1).cast::<u8>();
            bytes.copy_from_nonoverlapping(contents.as_ptr(), len);
        }
        string
    }

    /// An uninterned symbol with no value and a fresh binding index.
    pub fn make_symbol(&self, name: &str) -> Value {
        let name = self.make_string(name);
        let symbol = self.allocate_words(Kind::Symbol, layout(Kind::Symbol).fixed_words);
        object::field_set(symbol, object::Field::SymbolName, name);
        object::field_set(symbol, object::Field::SymbolValue, Value::UNBOUND);
        object::field_set(symbol, object::Field::SymbolFunction, Value::UNBOUND);
        object::field_set(symbol, object::Field::SymbolPlist, Value::NIL);
        object::field_set(symbol, object::Field::SymbolPackage, Value::NIL);
        set_raw_word(
            symbol,
            Kind::Symbol,
            word::SYMBOL_BINDING_INDEX,
            self.vm().next_binding_index(),
        );
        symbol
    }

    /// The symbol named `name`, created on first use.
    pub fn intern(&self, name: &str) -> Value {
        let mut symbols = self.vm().symbols.lock(true);
        if let Some(symbol) = symbols.get(name) {
            return symbol;
        }
        let symbol = self.make_symbol(name);
        symbols.insert(name, symbol);
        symbol
    }

    pub fn make_double(&self, x: f64) -> Value {
        let double = self.allocate_words(Kind::DoubleFloat, DOUBLE_WORDS);
        unsafe {
            (*double.as_object())
                .payload()
                .cast::<f64>()
                .write_unaligned(x);
        }
        double
    }

    /// A bignum from its magnitude, least significant limb first.
    pub fn make_bignum(&self, negative: bool, limbs: &[usize]) -> Value {
        let bignum =
            self.allocate_words(Kind::Bignum, layout(Kind::Bignum).payload_words(limbs.len()));
        set_raw_word(bignum, Kind::Bignum, word::BIGNUM_SIGN, negative as usize);
        set_raw_word(bignum, Kind::Bignum, word::BIGNUM_LENGTH, limbs.len());
        for (i, limb) in limbs.iter().enumerate() {
            set_raw_word(bignum, Kind::Bignum, 2 + i, *limb);
        }
        bignum
    }

    pub fn make_ratio(&self, numerator: Value, denominator: Value) -> Value {
        let ratio = self.allocate_words(Kind::Ratio, 2);
        object::field_set(ratio, object::Field::RatioNumerator, numerator);
        object::field_set(ratio, object::Field::RatioDenominator, denominator);
        ratio
    }

    pub fn make_complex(&self, real: Value, imag: Value) -> Value {
        let complex = self.allocate_words(Kind::Complex, 2);
        object::field_set(complex, object::Field::ComplexReal, real);
        object::field_set(complex, object::Field::ComplexImag, imag);
        complex
    }

    pub fn make_closure(&self, entry: ClosureEntry, env: Value, name: Value) -> Value {
        let closure = self.allocate_words(Kind::Closure, layout(Kind::Closure).fixed_words);
        set_raw_word(closure, Kind::Closure, word::CLOSURE_ENTRY, entry as usize);
        object::field_set(closure, object::Field::ClosureEnv, env);
        object::field_set(closure, object::Field::ClosureName, name);
        closure
    }

    pub fn make_stream(
        &self,
        mode: StreamMode,
        element_type: Value,
        buffer: Value,
        handle: usize,
    ) -> Value {
        let stream = self.allocate_words(Kind::Stream, layout(Kind::Stream).fixed_words);
        set_raw_word(stream, Kind::Stream, word::STREAM_MODE, mode as usize);
        set_raw_word(stream, Kind::Stream, word::STREAM_HANDLE, handle);
        object::field_set(stream, object::Field::StreamElementType, element_type);
        object::field_set(stream, object::Field::StreamBuffer, buffer);
        stream
    }

    pub fn make_structure(&self, type_: Value, slots: &[Value]) -> Value {
        let structure = self.allocate_words(
            Kind::Structure,
            layout(Kind::Structure).payload_words(slots.len()),
        );
        set_raw_word(structure, Kind::Structure, word::STRUCT_LENGTH, slots.len());
        object::field_set(structure, object::Field::StructType, type_);
        for (i, slot) in slots.iter().enumerate() {
            object::field_set(structure, object::Field::StructSlot(i), *slot);
        }
        structure
    }

    /// Wraps a foreign address. The pointee is never scanned.
    pub fn make_foreign(&self, address: usize, size: usize, tag: Value) -> Value {
        let foreign = self.allocate_words(Kind::Foreign, layout(Kind::Foreign).fixed_words);
        set_raw_word(foreign, Kind::Foreign, word::FOREIGN_ADDRESS, address);
        set_raw_word(foreign, Kind::Foreign, word::FOREIGN_SIZE, size);
        object::field_set(foreign, object::Field::ForeignTag, tag);
        foreign
    }
}
