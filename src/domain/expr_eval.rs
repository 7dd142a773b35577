//! Condition evaluation.
//!
//! Walks a [`Node`] tree, resolving field references through the registry's
//! data sources and calls through its functions. Evaluation is strict:
//! every argument and both sides of `and`/`or` are evaluated, so data
//! fetches happen regardless of the eventual result.

use crate::domain::builtins::contains_any;
use crate::domain::error::EvalError;
use crate::domain::expr::{BinaryOp, Node};
use crate::domain::registry::{CallContext, Registry};
use crate::domain::value::{Value, compare};
use crate::ports::data_source_port::QueryParams;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::cmp::Ordering;

/// Evaluates trees against one registry at a fixed instant.
pub struct Evaluator<'r> {
    registry: &'r Registry,
    now: DateTime<Utc>,
}

impl<'r> Evaluator<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self::at(registry, Utc::now())
    }

    /// Pin "now" for time-relative functions.
    pub fn at(registry: &'r Registry, now: DateTime<Utc>) -> Self {
        Self { registry, now }
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub async fn evaluate(&self, node: &Node) -> Result<Value, EvalError> {
        self.eval(node, QueryParams::default()).await
    }

    pub async fn evaluate_to_bool(&self, node: &Node) -> Result<bool, EvalError> {
        self.evaluate(node).await?.as_bool()
    }

    fn eval<'a>(
        &'a self,
        node: &'a Node,
        params: QueryParams,
    ) -> BoxFuture<'a, Result<Value, EvalError>> {
        async move {
            match node {
                Node::Literal(lit) => Ok(Value::from(lit)),
                Node::Field(field) => {
                    self.registry
                        .get_data(&field.module, &field.entity, &field.field, params)
                        .await
                }
                Node::Call { name, args } => self.eval_call(name, args).await,
                Node::Binary { op, left, right } => self.eval_binary(*op, left, right).await,
            }
        }
        .boxed()
    }

    async fn eval_call(&self, name: &str, args: &[Node]) -> Result<Value, EvalError> {
        let def = self
            .registry
            .get_function(name)
            .ok_or_else(|| EvalError::UnknownFunction(name.to_string()))?;
        if def.arity() != args.len() {
            return Err(EvalError::Arity {
                function: name.to_string(),
                expected: def.arity(),
                found: args.len(),
            });
        }

        let wrap = |index: usize| {
            move |cause: EvalError| EvalError::Argument {
                function: name.to_string(),
                index,
                cause: Box::new(cause),
            }
        };

        // Window lengths come from sibling values, so plain arguments go first
        // and each is evaluated exactly once.
        let siblings: Vec<Option<usize>> = args
            .iter()
            .enumerate()
            .map(|(index, arg)| self.window_sibling(name, index, arg, args.len()))
            .collect();
        let mut values: Vec<Option<Value>> = args.iter().map(|_| None).collect();
        for (index, arg) in args.iter().enumerate() {
            if siblings[index].is_none() {
                let value = self.eval(arg, QueryParams::default()).await;
                values[index] = Some(value.map_err(wrap(index))?);
            }
        }
        for (index, arg) in args.iter().enumerate() {
            let Some(sibling) = siblings[index] else {
                continue;
            };
            let params = match &values[sibling] {
                Some(length) => window_request(length).map_err(wrap(index))?,
                None => QueryParams::default(),
            };
            let value = self.eval(arg, params).await;
            values[index] = Some(value.map_err(wrap(index))?);
        }

        let values: Vec<Value> = values.into_iter().flatten().collect();
        def.call(&values, &CallContext { now: self.now })
    }

    /// Index of the sibling argument of `function` that carries the window
    /// length for `arg`, when `arg` is a field of a windowed data source.
    fn window_sibling(&self, function: &str, index: usize, arg: &Node, arity: usize) -> Option<usize> {
        let Node::Field(field) = arg else {
            return None;
        };
        self.registry
            .window_param(&field.module, function)
            .filter(|&sibling| sibling != index && sibling < arity)
    }

    async fn eval_binary(&self, op: BinaryOp, left: &Node, right: &Node) -> Result<Value, EvalError> {
        let operand = |side: &'static str| {
            move |cause| EvalError::Operand {
                op,
                side,
                cause: Box::new(cause),
            }
        };

        let lhs = self
            .eval(left, QueryParams::default())
            .await
            .map_err(operand("left"))?;
        let rhs = self
            .eval(right, QueryParams::default())
            .await
            .map_err(operand("right"))?;

        let result = match op {
            BinaryOp::And | BinaryOp::Or => {
                let a = lhs.as_bool().map_err(operand("left"))?;
                let b = rhs.as_bool().map_err(operand("right"))?;
                if op == BinaryOp::And { a && b } else { a || b }
            }
            BinaryOp::Gt | BinaryOp::Lt | BinaryOp::Ge | BinaryOp::Le | BinaryOp::Eq | BinaryOp::Ne => {
                let side = if matches!(lhs, Value::Series(_)) { "left" } else { "right" };
                let ordering = compare(&lhs, &rhs).map_err(operand(side))?;
                match op {
                    BinaryOp::Gt => ordering == Some(Ordering::Greater),
                    BinaryOp::Lt => ordering == Some(Ordering::Less),
                    BinaryOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                    BinaryOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                    BinaryOp::Eq => ordering == Some(Ordering::Equal),
                    _ => ordering != Some(Ordering::Equal),
                }
            }
            BinaryOp::In | BinaryOp::NotIn => {
                let items = rhs.as_list().map_err(operand("right"))?;
                let needle = lhs.to_string();
                let found = items.iter().any(|item| *item == needle);
                if op == BinaryOp::In { found } else { !found }
            }
            BinaryOp::Has => {
                let needles = rhs.as_needles().map_err(operand("right"))?;
                contains_any(&lhs.to_string(), &needles)
            }
        };
        Ok(Value::Bool(result))
    }
}

/// Window request for an evaluated length; lengths below one ask for the
/// current value instead.
fn window_request(length: &Value) -> Result<QueryParams, EvalError> {
    let n = length
        .as_number()
        .ok_or_else(|| length.coercion_error("number"))?;
    if n.is_nan() || n < 1.0 {
        return Ok(QueryParams::default());
    }
    Ok(QueryParams::window(n as usize))
}
