//! Ordered AST rewrites applied to a parsed graph before validation.
//!
//! Default order: sub-pipeline inlining → variable expansion → stylesheet
//! application. Order matters: inlining must precede expansion so variables
//! can refer to inlined node attributes, and expansion must precede the
//! stylesheet so selectors match final class assignments.

mod stylesheet;
mod sub_pipeline;
mod variables;

pub use stylesheet::StylesheetTransform;
pub use sub_pipeline::{SubPipelineInliner, SubPipelineLoader};
pub use variables::VariableExpansion;

use std::sync::Arc;

use thiserror::Error;

use crate::graph::Graph;

#[derive(Debug, Error)]
#[error("transform failed: {0}")]
pub struct TransformError(pub String);

/// One rewrite step in the transform chain. Embedders may append their own
/// transforms after the default three.
pub trait GraphTransform: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: Graph) -> Result<Graph, TransformError>;
}

/// Runs `transforms` in order over `graph`.
pub fn run_chain(mut graph: Graph, transforms: &[Box<dyn GraphTransform>]) -> Result<Graph, TransformError> {
    for t in transforms {
        graph = t.apply(graph)?;
    }
    Ok(graph)
}

/// The default chain for a given sub-pipeline loader: inlining, expansion, stylesheet.
pub fn default_chain(loader: Arc<dyn SubPipelineLoader>) -> Vec<Box<dyn GraphTransform>> {
    vec![
        Box::new(SubPipelineInliner::new(loader)),
        Box::new(VariableExpansion),
        Box::new(StylesheetTransform),
    ]
}
