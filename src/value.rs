//! Values flowing through the operand stack and the locals of a frame.
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Tag of a runtime value, used to report what an instruction was given.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tag {
    Null,
    Int32,
    Int64,
    Float64,
    ObjectArray,
    Utf16String,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::ObjectArray => "object[]",
            Self::Utf16String => "string",
        };
        f.write_str(name)
    }
}

/// Fixed-length array of values shared by reference.
///
/// Cloning an `ObjectArray` clones the handle, not the storage: a store
/// through one handle is observed by every other handle to the same array.
/// Equality is identity.
#[derive(Clone)]
pub struct ObjectArray(Rc<RefCell<Vec<Value>>>);

impl ObjectArray {
    /// Allocate an array of `len` elements, all `Null`.
    pub fn new(len: usize) -> Self {
        Self(Rc::new(RefCell::new(vec![Value::Null; len])))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the element at `index`, `None` when out of bounds.
    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.borrow().get(index).cloned()
    }

    /// Store `value` at `index`, returns false when out of bounds.
    pub fn set(&self, index: usize, value: Value) -> bool {
        match self.0.borrow_mut().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Snapshot of the current elements.
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for ObjectArray {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ObjectArray {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Arrays may contain themselves, print the length only.
        write!(f, "ObjectArray(len = {})", self.len())
    }
}

/// Immutable string of UTF-16 code units, as stored in the user string heap.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Utf16String(Rc<[u16]>);

impl Utf16String {
    pub fn from_units(units: Vec<u16>) -> Self {
        Self(units.into())
    }

    /// Length in code units.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lossy conversion, unpaired surrogates become U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }
}

impl From<&str> for Utf16String {
    fn from(s: &str) -> Self {
        Self::from_units(s.encode_utf16().collect())
    }
}

impl fmt::Display for Utf16String {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl fmt::Debug for Utf16String {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

/// Runtime value.
///
/// Scalars are stored inline, arrays and strings behind reference counted
/// handles. Equality on arrays is identity, on strings it is content.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Int32(i32),
    Int64(i64),
    Float64(f64),
    ObjectArray(ObjectArray),
    Utf16String(Utf16String),
}

impl Value {
    /// Returns the tag of the value.
    pub fn tag(&self) -> Tag {
        match self {
            Self::Null => Tag::Null,
            Self::Int32(_) => Tag::Int32,
            Self::Int64(_) => Tag::Int64,
            Self::Float64(_) => Tag::Float64,
            Self::ObjectArray(_) => Tag::ObjectArray,
            Self::Utf16String(_) => Tag::Utf16String,
        }
    }

    /// Integer payload widened to 64 bits, for `Int32` and `Int64` only.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Int32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}L"),
            Self::Float64(v) => write!(f, "{v:?}"),
            Self::ObjectArray(arr) => {
                f.write_str("[")?;
                for (i, elem) in arr.to_vec().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match elem {
                        // Avoid recursing into nested arrays.
                        Self::ObjectArray(inner) => write!(f, "object[{}]", inner.len())?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("]")
            }
            Self::Utf16String(s) => write!(f, "{s:?}"),
        }
    }
}
