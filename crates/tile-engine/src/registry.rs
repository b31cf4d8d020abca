//! Operator registry: operator type name to descriptor and factory.
//!
//! The registry is populated explicitly at startup; nothing is discovered at
//! runtime.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{OperatorResult, ResolutionError, ResolutionResult};
use crate::operator::Operator;
use crate::params::{ParamDescriptor, ParameterSchema, Parameters};

/// Creates a fresh operator instance from validated parameters.
pub type OperatorFactory = Arc<dyn Fn(&Parameters) -> OperatorResult<Box<dyn Operator>> + Send + Sync>;

/// A named source slot of an operator type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSlot {
    pub name: String,
    pub mandatory: bool,
}

/// Everything the resolver needs to know about an operator type.
#[derive(Clone)]
pub struct OperatorDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
    pub sources: Vec<SourceSlot>,
    factory: OperatorFactory,
}

impl OperatorDescriptor {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Parameters) -> OperatorResult<Box<dyn Operator>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: ParameterSchema::new(),
            sources: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameter(mut self, param: ParamDescriptor) -> Self {
        self.parameters = self.parameters.param(param);
        self
    }

    /// Declare a mandatory source slot.
    pub fn with_source(mut self, slot: impl Into<String>) -> Self {
        self.sources.push(SourceSlot {
            name: slot.into(),
            mandatory: true,
        });
        self
    }

    pub fn with_optional_source(mut self, slot: impl Into<String>) -> Self {
        self.sources.push(SourceSlot {
            name: slot.into(),
            mandatory: false,
        });
        self
    }

    pub fn slot(&self, name: &str) -> Option<&SourceSlot> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Instantiate an operator for one node.
    pub fn create(&self, parameters: &Parameters) -> OperatorResult<Box<dyn Operator>> {
        (self.factory)(parameters)
    }
}

impl fmt::Debug for OperatorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorDescriptor")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

/// All operator types known to the engine.
#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, OperatorDescriptor>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operator type. Each name can be registered once.
    pub fn register(&mut self, descriptor: OperatorDescriptor) -> ResolutionResult<()> {
        if self.operators.contains_key(&descriptor.name) {
            return Err(ResolutionError::DuplicateOperator(descriptor.name));
        }
        self.operators.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&OperatorDescriptor> {
        self.operators.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    /// Registered operator names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operators.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}
