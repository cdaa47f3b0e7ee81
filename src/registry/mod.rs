//! Function registry: descriptors, input schemas and validation.
//!
//! The registry owns the set of callable functions. Lookups of unknown and
//! inactive ids fail identically with [`SkaldError::NotFound`], so callers
//! cannot tell a disabled function from one that was never registered.

pub mod builtin;
mod descriptor;
mod schema;

use std::collections::HashMap;
use std::sync::Arc;

pub use descriptor::{FunctionDefinition, FunctionDescriptor, FunctionInfo, PromptTemplate};
pub use schema::{FieldSpec, FieldType, InputSchema};

use crate::types::InputFields;
use crate::{Result, SkaldError};

/// Registry of function descriptors in registration order.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    entries: Vec<Arc<FunctionDescriptor>>,
    index: HashMap<String, usize>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in functions.
    pub fn with_builtin_functions() -> Self {
        let mut registry = Self::new();
        for descriptor in builtin::all() {
            registry.register(descriptor);
        }
        registry
    }

    /// Insert a descriptor, replacing any existing one with the same id.
    ///
    /// A replaced descriptor keeps its original position in listings.
    pub fn register(&mut self, descriptor: FunctionDescriptor) {
        let descriptor = Arc::new(descriptor);
        match self.index.get(&descriptor.id) {
            Some(&slot) => self.entries[slot] = descriptor,
            None => {
                self.index.insert(descriptor.id.clone(), self.entries.len());
                self.entries.push(descriptor);
            }
        }
    }

    /// Look up an active descriptor.
    pub fn get(&self, id: &str) -> Result<Arc<FunctionDescriptor>> {
        self.index
            .get(id)
            .map(|&slot| &self.entries[slot])
            .filter(|d| d.active)
            .cloned()
            .ok_or_else(|| SkaldError::NotFound(id.to_string()))
    }

    /// Active descriptors in registration order.
    pub fn list(&self) -> Vec<Arc<FunctionDescriptor>> {
        self.entries.iter().filter(|d| d.active).cloned().collect()
    }

    /// Listing view of the active descriptors.
    pub fn infos(&self) -> Vec<FunctionInfo> {
        self.entries
            .iter()
            .filter(|d| d.active)
            .map(|d| d.info())
            .collect()
    }

    /// Validate `input` against a descriptor's schema and length limit.
    pub fn validate(&self, descriptor: &FunctionDescriptor, input: &InputFields) -> Result<()> {
        descriptor
            .input_schema
            .validate(input, descriptor.max_input_length)
    }

    /// Number of registered descriptors, active or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
