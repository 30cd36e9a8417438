//! Parameter declarations and the resolved, mutable view hooks operate on.

use std::fmt;

use crate::{
    abi::{ArgSlot, VariadicCursor},
    cpu::GuestAddress,
};

/// Semantic type of one declared parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 16-bit integer.
    I16,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 64-bit integer.
    U64,
    /// A guest pointer, not dereferenced.
    Pointer,
    /// Pointer to a NUL-terminated narrow string; dereferenced on resolve.
    Str,
    /// Pointer to a NUL-terminated UTF-16 string; dereferenced on resolve.
    WStr,
    /// Pointer to a fixed-size buffer of this many bytes.
    Buffer(u64),
    /// Marker freezing the slot cursor for on-demand trailing arguments.
    ///
    /// Must be the last entry of a spec; everything after it is ignored.
    Variadic,
}

/// Ordered (name, semantic type) parameter declaration for one API.
///
/// Order is significant: it must match the convention's argument slot order.
#[derive(Clone, Debug, Default)]
pub struct ParamSpec {
    entries: Vec<(String, ParamKind)>,
}

impl ParamSpec {
    /// Creates an empty spec (an API taking no marshalled arguments).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a parameter, preserving declaration order.
    #[must_use]
    pub fn with(mut self, name: &str, kind: ParamKind) -> Self {
        self.entries.push((name.to_string(), kind));
        self
    }

    /// Declared parameters in order.
    #[must_use]
    pub fn entries(&self) -> &[(String, ParamKind)] {
        &self.entries
    }

    /// Number of declared parameters, including a variadic marker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A decoded argument value.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    /// Signed 8-bit integer.
    I8(i8),
    /// Unsigned 8-bit integer.
    U8(u8),
    /// Signed 16-bit integer.
    I16(i16),
    /// Unsigned 16-bit integer.
    U16(u16),
    /// Signed 32-bit integer.
    I32(i32),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Signed 64-bit integer.
    I64(i64),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// A guest pointer.
    Pointer(GuestAddress),
    /// A decoded narrow string.
    Str(String),
    /// A decoded UTF-16 string.
    WStr(String),
    /// A copied fixed-size buffer.
    Buffer(Vec<u8>),
}

impl ParamValue {
    /// The value as an unsigned 64-bit word, sign-extending signed kinds.
    ///
    /// Strings and buffers have no single-word representation and yield
    /// `None`; their storage is the pointer word left in the slot.
    #[must_use]
    pub fn as_word(&self) -> Option<u64> {
        match self {
            ParamValue::I8(v) => Some(*v as u64),
            ParamValue::U8(v) => Some(u64::from(*v)),
            ParamValue::I16(v) => Some(*v as u64),
            ParamValue::U16(v) => Some(u64::from(*v)),
            ParamValue::I32(v) => Some(*v as u64),
            ParamValue::U32(v) => Some(u64::from(*v)),
            ParamValue::I64(v) => Some(*v as u64),
            ParamValue::U64(v) => Some(*v),
            ParamValue::Pointer(addr) => Some(addr.value()),
            ParamValue::Str(_) | ParamValue::WStr(_) | ParamValue::Buffer(_) => None,
        }
    }

    /// The value as string text, for `Str`/`WStr` kinds.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) | ParamValue::WStr(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(s) | ParamValue::WStr(s) => write!(f, "{s:?}"),
            ParamValue::Pointer(addr) => write!(f, "{addr}"),
            ParamValue::Buffer(bytes) => write!(f, "<{} bytes>", bytes.len()),
            other => match other.as_word() {
                Some(word) => write!(f, "{word:#x}"),
                None => write!(f, "?"),
            },
        }
    }
}

/// One resolved parameter with its slot bookkeeping.
#[derive(Clone, Debug)]
pub(crate) struct ParamEntry {
    pub name: String,
    pub kind: ParamKind,
    /// Where the raw word came from; `commit` re-encodes into this slot only.
    pub slot: ArgSlot,
    /// The raw word pulled from the slot (a pointer for indirect kinds).
    pub raw: u64,
    pub value: ParamValue,
    /// The value as originally decoded, for cheap dirtiness checks.
    pub original: ParamValue,
}

/// Decoded arguments for one intercepted call, in declaration order.
///
/// Hooks may overwrite entries before resumption;
/// [`commit`](crate::abi::commit) re-encodes any mutated entry back into its
/// original storage. Insertion order always equals [`ParamSpec`] order.
#[derive(Debug, Default)]
pub struct ResolvedParams {
    pub(crate) entries: Vec<ParamEntry>,
    pub(crate) variadic: Option<VariadicCursor>,
    pub(crate) stack_words: u64,
}

impl ResolvedParams {
    /// Looks a parameter up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.value)
    }

    /// Overwrites a parameter by name.
    ///
    /// Returns `false` when no parameter with that name exists. The new value
    /// is re-encoded into the original slot on the next commit; the kind is
    /// not rechecked, mirroring how the guest itself cannot tell.
    pub fn set(&mut self, name: &str, value: ParamValue) -> bool {
        match self.entries.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    /// Iterates parameters in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries
            .iter()
            .map(|entry| (entry.name.as_str(), &entry.value))
    }

    /// Number of resolved (non-variadic) parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The frozen cursor for trailing arguments, if the spec declared one.
    #[must_use]
    pub fn variadic(&self) -> Option<&VariadicCursor> {
        self.variadic.as_ref()
    }

    /// Stack words consumed by the fixed parameters; what a callee-cleanup
    /// convention pops on return.
    #[must_use]
    pub fn stack_words(&self) -> u64 {
        self.stack_words
    }
}

impl fmt::Display for ResolvedParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (index, entry) in self.entries.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", entry.name, entry.value)?;
        }
        write!(f, ")")
    }
}
