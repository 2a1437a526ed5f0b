//! Bridge between the interpreter and whatever holds the program's
//! metadata: string literals and method bodies.
use std::collections::HashMap;

use crate::value::Utf16String;

/// Method body as seen by the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    /// Raw instruction bytes.
    pub code: Vec<u8>,
    /// Declared number of local variable slots.
    pub local_count: usize,
    /// Declared maximum operand stack depth.
    pub max_stack: usize,
}

impl MethodBody {
    pub fn new(code: Vec<u8>, local_count: usize, max_stack: usize) -> Self {
        Self {
            code,
            local_count,
            max_stack,
        }
    }
}

/// Metadata lookups the runtime needs.
pub trait Metadata {
    /// Resolve an `ldstr` token to its literal.
    fn user_string(&self, token: u32) -> Option<Utf16String>;

    /// Find the body of `method_name` declared on `type_name`, where
    /// `type_name` is namespace qualified (`Demo.Program`). Returns `None`
    /// when the type or method is missing or the method has no body.
    fn method_body(&self, type_name: &str, method_name: &str) -> Option<MethodBody>;
}

/// In-memory metadata, for embedding the interpreter without a binary.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    strings: HashMap<u32, Utf16String>,
    methods: HashMap<(String, String), MethodBody>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the literal `text` under `token`.
    pub fn with_string(mut self, token: u32, text: &str) -> Self {
        self.strings.insert(token, Utf16String::from(text));
        self
    }

    pub fn with_method(mut self, type_name: &str, method_name: &str, body: MethodBody) -> Self {
        self.methods
            .insert((type_name.to_string(), method_name.to_string()), body);
        self
    }
}

impl Metadata for StaticMetadata {
    fn user_string(&self, token: u32) -> Option<Utf16String> {
        self.strings.get(&token).cloned()
    }

    fn method_body(&self, type_name: &str, method_name: &str) -> Option<MethodBody> {
        self.methods
            .get(&(type_name.to_string(), method_name.to_string()))
            .cloned()
    }
}
