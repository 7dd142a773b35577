//! Front door for condition strings: parse, validate and evaluate in one
//! call. Used at order-creation time and by the command line.

use crate::domain::error::EngineError;
use crate::domain::expr::Node;
use crate::domain::expr_eval::Evaluator;
use crate::domain::expr_parser;
use crate::domain::registry::Registry;
use crate::domain::value::Value;

/// Parse `input` and check it against `registry`.
pub fn compile(input: &str, registry: &Registry) -> Result<Node, EngineError> {
    let node = expr_parser::parse(input)?;
    registry.validate(&node)?;
    Ok(node)
}

pub async fn execute(input: &str, evaluator: &Evaluator<'_>) -> Result<Value, EngineError> {
    let node = compile(input, evaluator.registry())?;
    Ok(evaluator.evaluate(&node).await?)
}

pub async fn execute_to_bool(input: &str, evaluator: &Evaluator<'_>) -> Result<bool, EngineError> {
    let node = compile(input, evaluator.registry())?;
    Ok(evaluator.evaluate_to_bool(&node).await?)
}
