//! DSL module: a name-keyed builder over [`Graph`].
//!
//! Endpoints are written `"block:port"`; a bare `"block"` means port 0.
//! Parameters are written `"block.param"`.

use crate::block::Block;
use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::graph::{BlockId, Graph, PoolId};
use crate::parameter::{ParamId, ParamValue};
use std::collections::HashMap;
use thiserror::Error;

/// The graph builder.
#[derive(Debug)]
pub struct GraphBuilder {
    graph: Graph,
    pools: HashMap<String, PoolId>,
}

impl GraphBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            pools: HashMap::new(),
        }
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self, DslError> {
        Ok(Self {
            graph: Graph::with_config(config)?,
            pools: HashMap::new(),
        })
    }

    /// Add a named block.
    pub fn block(&mut self, name: &str, block: impl Block) -> Result<BlockId, DslError> {
        Ok(self.graph.add_block(name, block)?)
    }

    /// Add a named thread pool.
    pub fn pool(&mut self, name: &str, max_threads: usize) -> Result<PoolId, DslError> {
        if self.pools.contains_key(name) {
            return Err(DslError::DuplicatePool(name.to_string()));
        }
        let id = self.graph.add_pool(name, max_threads)?;
        self.pools.insert(name.to_string(), id);
        Ok(id)
    }

    /// Run `block` on the pool called `pool`.
    pub fn assign(&mut self, block: &str, pool: &str) -> Result<(), DslError> {
        let block = self.find(block)?;
        let pool = *self
            .pools
            .get(pool)
            .ok_or_else(|| DslError::MissingPool(pool.to_string()))?;
        Ok(self.graph.assign(block, pool)?)
    }

    /// Connect `"from:output"` to `"to:input"`.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), DslError> {
        let (from, output) = self.endpoint(from)?;
        let (to, input) = self.endpoint(to)?;
        Ok(self.graph.connect(from, output, to, input)?)
    }

    /// Connect port 0 to port 0 along a list of blocks.
    pub fn chain(&mut self, names: &[&str]) -> Result<(), DslError> {
        for pair in names.windows(2) {
            self.connect(pair[0], pair[1])?;
        }
        Ok(())
    }

    /// Join two parameters, `"block.param"` each.
    pub fn link(&mut self, a: &str, b: &str) -> Result<(), DslError> {
        let a = self.param(a)?;
        let b = self.param(b)?;
        Ok(self.graph.connect_parameters(a, b)?)
    }

    /// Set a parameter while the graph is being built.
    pub fn set(&mut self, param: &str, value: impl Into<ParamValue>) -> Result<(), DslError> {
        let id = self.param(param)?;
        Ok(self.graph.set_parameter(id, value)?)
    }

    /// Build the graph.
    pub fn build(self) -> Result<Graph, DslError> {
        Ok(self.graph)
    }

    fn find(&self, name: &str) -> Result<BlockId, DslError> {
        self.graph
            .block_id(name)
            .ok_or_else(|| DslError::MissingBlock(name.to_string()))
    }

    fn endpoint(&self, text: &str) -> Result<(BlockId, usize), DslError> {
        let (name, port) = match text.rsplit_once(':') {
            Some((name, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| DslError::BadEndpoint(text.to_string()))?;
                (name, port)
            }
            None => (text, 0),
        };
        Ok((self.find(name)?, port))
    }

    fn param(&self, text: &str) -> Result<ParamId, DslError> {
        let (block, name) = text
            .rsplit_once('.')
            .ok_or_else(|| DslError::BadEndpoint(text.to_string()))?;
        Ok(self.graph.parameter(self.find(block)?, name)?)
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// DSL-specific errors.
#[derive(Error, Debug)]
pub enum DslError {
    #[error(transparent)]
    Graph(#[from] Error),
    #[error("no block named '{0}'")]
    MissingBlock(String),
    #[error("no pool named '{0}'")]
    MissingPool(String),
    #[error("pool name '{0}' is already in use")]
    DuplicatePool(String),
    #[error("malformed endpoint '{0}'")]
    BadEndpoint(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Declare;
    use crate::error::BlockError;
    use crate::parameter::ParamType;

    struct Relay;

    impl Block for Relay {
        fn declare(&mut self, decl: &mut Declare<'_>) -> Result<(), BlockError> {
            decl.set_num_inputs(0, 1);
            decl.set_num_outputs(0, 1);
            decl.setter("level", ParamType::Double, 1)?;
            Ok(())
        }
    }

    #[test]
    fn dsl_equivalence() {
        let mut builder = GraphBuilder::new();
        builder.block("a", Relay).unwrap();
        builder.block("b", Relay).unwrap();
        builder.block("c", Relay).unwrap();
        builder.chain(&["a", "b", "c:0"]).unwrap();
        builder.link("a.level", "c.level").unwrap();
        let dsl_graph = builder.build().unwrap();

        let mut manual_graph = Graph::new();
        let a = manual_graph.add_block("a", Relay).unwrap();
        let b = manual_graph.add_block("b", Relay).unwrap();
        let c = manual_graph.add_block("c", Relay).unwrap();
        manual_graph.connect(a, 0, b, 0).unwrap();
        manual_graph.connect(b, 0, c, 0).unwrap();

        assert_eq!(dsl_graph.edges(), manual_graph.edges());
    }

    #[test]
    fn ui_errors() {
        let mut builder = GraphBuilder::new();
        builder.block("a", Relay).unwrap();
        builder.block("b", Relay).unwrap();
        assert!(matches!(
            builder.connect("a:x", "b"),
            Err(DslError::BadEndpoint(_))
        ));
        assert!(matches!(
            builder.connect("a", "nope"),
            Err(DslError::MissingBlock(_))
        ));
        assert!(matches!(
            builder.connect("a:1", "b"),
            Err(DslError::Graph(Error::InvalidPort { .. }))
        ));
        assert!(matches!(
            builder.assign("a", "main"),
            Err(DslError::MissingPool(_))
        ));
        builder.pool("main", 1).unwrap();
        assert!(matches!(
            builder.pool("main", 2),
            Err(DslError::DuplicatePool(_))
        ));
        builder.assign("a", "main").unwrap();
        assert!(builder.set("a.level", 0.5).is_ok());
        assert!(builder.set("a.volume", 0.5).is_err());
    }
}
