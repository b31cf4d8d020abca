//! Declarative operator graph, as loaded from YAML/JSON or built in code.
//!
//! ```yaml
//! nodes:
//!   - id: speckle
//!     operator: median
//!     parameters:
//!       filterSizeX: 5
//!       filterSizeY: 5
//!     sources:
//!       - slot: source
//!         external: S1A_GRD
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{ResolutionError, ResolutionResult};
use crate::params::ParamValue;

/// What a source slot is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceRef {
    /// Output product of another node, by node id.
    Node(String),
    /// A registered external source, by product name.
    External(String),
}

/// Binding of one named source slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBinding {
    pub slot: String,
    #[serde(flatten)]
    pub source: SourceRef,
}

/// One operator instance in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub operator: String,
    #[serde(default)]
    pub parameters: HashMap<String, ParamValue>,
    #[serde(default)]
    pub sources: Vec<SourceBinding>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, operator: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operator: operator.into(),
            parameters: HashMap::new(),
            sources: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Bind `slot` to the output of node `node`.
    pub fn with_node_source(mut self, slot: impl Into<String>, node: impl Into<String>) -> Self {
        self.sources.push(SourceBinding {
            slot: slot.into(),
            source: SourceRef::Node(node.into()),
        });
        self
    }

    /// Bind `slot` to an external source product.
    pub fn with_external_source(
        mut self,
        slot: impl Into<String>,
        product: impl Into<String>,
    ) -> Self {
        self.sources.push(SourceBinding {
            slot: slot.into(),
            source: SourceRef::External(product.into()),
        });
        self
    }

    pub fn binding(&self, slot: &str) -> Option<&SourceBinding> {
        self.sources.iter().find(|b| b.slot == slot)
    }
}

/// A whole operator graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

impl GraphSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn from_yaml(text: &str) -> ResolutionResult<Self> {
        let graph: GraphSpec = serde_yaml::from_str(text)?;
        graph.check_unique_ids()?;
        Ok(graph)
    }

    pub fn from_json(text: &str) -> ResolutionResult<Self> {
        let graph: GraphSpec = serde_json::from_str(text)?;
        graph.check_unique_ids()?;
        Ok(graph)
    }

    pub fn find(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Fail with DuplicateNode on the first repeated node id.
    pub fn check_unique_ids(&self) -> ResolutionResult<()> {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ResolutionError::DuplicateNode(node.id.clone()));
            }
        }
        Ok(())
    }
}
