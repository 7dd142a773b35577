//! Function and data-source registry.
//!
//! Built once at startup and shared read-only (behind an `Arc`) by the
//! evaluator and scheduler. Besides name lookup it owns static validation of
//! parsed conditions and the window-parameter mapping data sources declare.

use crate::domain::builtins;
use crate::domain::error::{DataError, EvalError, ValidationError};
use crate::domain::expr::{FieldRef, Literal, Node};
use crate::domain::value::Value;
use crate::ports::data_source_port::{DataSource, MAX_WINDOW, QueryParams};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Static hint for one function argument, checked against literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Any,
    Number,
    /// A numeric history: a field reference or a nested call.
    Window,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgKind::Any => f.write_str("any value"),
            ArgKind::Number => f.write_str("a number"),
            ArgKind::Window => f.write_str("a field reference or function call"),
        }
    }
}

impl ArgKind {
    fn accepts(self, lit: &Literal) -> bool {
        match (self, lit) {
            (ArgKind::Any, _) => true,
            (ArgKind::Number, Literal::Number(_)) => true,
            (ArgKind::Window, Literal::Number(_)) => true,
            _ => false,
        }
    }
}

/// Per-call context handed to function implementations.
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    pub now: DateTime<Utc>,
}

pub type FunctionImpl =
    Arc<dyn Fn(&[Value], &CallContext) -> Result<Value, EvalError> + Send + Sync>;

#[derive(Clone)]
pub struct FunctionDef {
    pub name: String,
    pub arg_kinds: Vec<ArgKind>,
    call: FunctionImpl,
}

impl FunctionDef {
    pub fn arity(&self) -> usize {
        self.arg_kinds.len()
    }

    pub fn call(&self, args: &[Value], ctx: &CallContext) -> Result<Value, EvalError> {
        (self.call)(args, ctx)
    }
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.name)
            .field("arg_kinds", &self.arg_kinds)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct Registry {
    functions: HashMap<String, FunctionDef>,
    sources: HashMap<String, Arc<dyn DataSource>>,
    /// (source, function) -> index of the argument holding the window length.
    window_params: HashMap<(String, String), usize>,
}

impl Registry {
    /// An empty registry: no functions, no data sources.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtins::register_all(&mut registry);
        registry
    }

    /// Register (or replace) a function. Arity is the number of hints.
    pub fn register_function<F>(&mut self, name: &str, arg_kinds: Vec<ArgKind>, call: F)
    where
        F: Fn(&[Value], &CallContext) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.functions.insert(
            name.to_string(),
            FunctionDef {
                name: name.to_string(),
                arg_kinds,
                call: Arc::new(call),
            },
        );
    }

    /// Register (or replace) a data source under `name`, together with the
    /// window parameters it declares.
    pub fn register_data_source(&mut self, name: &str, source: Arc<dyn DataSource>) {
        self.window_params.retain(|(module, _), _| module != name);
        for param in source.window_params() {
            self.window_params.insert(
                (name.to_string(), param.function.to_string()),
                param.arg_index,
            );
        }
        self.sources.insert(name.to_string(), source);
    }

    pub fn get_function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(name)
    }

    pub fn get_data_source(&self, name: &str) -> Option<&Arc<dyn DataSource>> {
        self.sources.get(name)
    }

    /// Which argument of `function` supplies the window length for fields of
    /// `module`, if the module declared one.
    pub fn window_param(&self, module: &str, function: &str) -> Option<usize> {
        self.window_params
            .get(&(module.to_string(), function.to_string()))
            .copied()
    }

    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn data_source_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve `source.entity.field`, as a window when `params` asks for one.
    pub async fn get_data(
        &self,
        source: &str,
        entity: &str,
        field: &str,
        params: QueryParams,
    ) -> Result<Value, EvalError> {
        let provider = self
            .get_data_source(source)
            .ok_or_else(|| EvalError::DataSourceNotFound(source.to_string()))?;

        let result = match params.window {
            Some(length) => provider
                .get_window(entity, field, length)
                .await
                .map(Value::Series),
            None => provider.get_value(entity, field).await,
        };

        result.map_err(|cause| match cause {
            DataError::NoData { entity, field } => EvalError::NoDataForEntity {
                module: source.to_string(),
                entity,
                field,
            },
            cause => EvalError::Data {
                module: source.to_string(),
                cause,
            },
        })
    }

    /// Check every function and data-source name in `node` against the
    /// registry, plus arity and literal argument kinds.
    pub fn validate(&self, node: &Node) -> Result<(), ValidationError> {
        match node {
            Node::Binary { left, right, .. } => {
                self.validate(left)?;
                self.validate(right)
            }
            Node::Call { name, args } => {
                let def = self
                    .get_function(name)
                    .ok_or_else(|| ValidationError::UnknownFunction(name.clone()))?;
                if def.arity() != args.len() {
                    return Err(ValidationError::Arity {
                        name: name.clone(),
                        expected: def.arity(),
                        found: args.len(),
                    });
                }
                for (index, (arg, kind)) in args.iter().zip(&def.arg_kinds).enumerate() {
                    if let Node::Literal(lit) = arg {
                        if !kind.accepts(lit) {
                            return Err(ValidationError::ArgumentType {
                                function: name.clone(),
                                index,
                                expected: *kind,
                            });
                        }
                    }
                    self.check_window_length(name, arg, args)?;
                    self.validate(arg)?;
                }
                Ok(())
            }
            Node::Field(field) => self.validate_field(field),
            Node::Literal(_) => Ok(()),
        }
    }

    /// A literal window length for a field argument must fit [`MAX_WINDOW`].
    fn check_window_length(
        &self,
        function: &str,
        arg: &Node,
        siblings: &[Node],
    ) -> Result<(), ValidationError> {
        let Node::Field(field) = arg else {
            return Ok(());
        };
        let Some(index) = self.window_param(&field.module, function) else {
            return Ok(());
        };
        match siblings.get(index) {
            Some(Node::Literal(Literal::Number(n))) if *n > MAX_WINDOW as f64 => {
                Err(ValidationError::WindowTooLarge {
                    function: function.to_string(),
                    index,
                    max: MAX_WINDOW,
                })
            }
            _ => Ok(()),
        }
    }

    fn validate_field(&self, field: &FieldRef) -> Result<(), ValidationError> {
        if field.module.is_empty() || field.entity.is_empty() || field.field.is_empty() {
            return Err(ValidationError::EmptyComponent(field.to_string()));
        }
        if !self.sources.contains_key(&field.module) {
            return Err(ValidationError::UnknownDataSource(field.module.clone()));
        }
        Ok(())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("functions", &self.function_names())
            .field("sources", &self.data_source_names())
            .finish()
    }
}
