//! Built-in condition functions.

use crate::domain::error::EvalError;
use crate::domain::registry::{ArgKind, CallContext, Registry};
use crate::domain::value::Value;

/// Functions whose first argument is a numeric window and second its length.
pub const AGGREGATES: [&str; 4] = ["avg", "max", "min", "sum"];

pub fn register_all(registry: &mut Registry) {
    registry.register_function("avg", vec![ArgKind::Window, ArgKind::Number], |args, _| {
        aggregate("avg", args, |points| {
            points.iter().sum::<f64>() / points.len() as f64
        })
    });
    registry.register_function("max", vec![ArgKind::Window, ArgKind::Number], |args, _| {
        aggregate("max", args, |points| {
            points.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        })
    });
    registry.register_function("min", vec![ArgKind::Window, ArgKind::Number], |args, _| {
        aggregate("min", args, |points| {
            points.iter().copied().fold(f64::INFINITY, f64::min)
        })
    });
    registry.register_function("sum", vec![ArgKind::Window, ArgKind::Number], |args, _| {
        aggregate("sum", args, |points| points.iter().sum())
    });

    for name in ["time_since", "ago"] {
        registry.register_function(name, vec![ArgKind::Any], move |args, ctx| {
            time_since(name, args, ctx)
        });
    }
    for name in ["has", "contains"] {
        registry.register_function(name, vec![ArgKind::Any, ArgKind::Any], |args, _| {
            let needles = args[1].as_needles()?;
            Ok(Value::Bool(contains_any(&args[0].to_string(), &needles)))
        });
    }
}

/// Reduce the last `n` points of `args[0]`. Fewer points use what exists;
/// `n <= 0` or an empty window yields 0.
fn aggregate(
    function: &str,
    args: &[Value],
    reduce: impl Fn(&[f64]) -> f64,
) -> Result<Value, EvalError> {
    let points = args[0].as_series().ok_or_else(|| EvalError::Argument {
        function: function.to_string(),
        index: 0,
        cause: Box::new(args[0].coercion_error("series")),
    })?;
    let n = args[1].as_number().ok_or_else(|| EvalError::Argument {
        function: function.to_string(),
        index: 1,
        cause: Box::new(args[1].coercion_error("number")),
    })?;
    if n.is_nan() || n < 1.0 || points.is_empty() {
        return Ok(Value::Number(0.0));
    }
    let take = (n as usize).min(points.len());
    Ok(Value::Number(reduce(&points[points.len() - take..])))
}

fn time_since(function: &str, args: &[Value], ctx: &CallContext) -> Result<Value, EvalError> {
    let then = args[0].as_time().ok_or_else(|| EvalError::Argument {
        function: function.to_string(),
        index: 0,
        cause: Box::new(args[0].coercion_error("time")),
    })?;
    let elapsed = ctx.now.signed_duration_since(then);
    Ok(Value::Number(elapsed.num_milliseconds() as f64 / 1000.0))
}

/// Substring test shared by the `has` operator and function.
pub fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, Utc};

    fn call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let registry = Registry::with_builtins();
        let ctx = CallContext { now: Utc::now() };
        registry.get_function(name).unwrap().call(args, &ctx)
    }

    fn number(value: Result<Value, EvalError>) -> f64 {
        match value.unwrap() {
            Value::Number(n) => n,
            other => panic!("expected number, got {other:?}"),
        }
    }

    fn window() -> Value {
        Value::Series(vec![1.0, 2.0, 3.0, 4.0, 5.0])
    }

    #[test]
    fn avg_over_full_and_partial_windows() {
        assert_relative_eq!(number(call("avg", &[window(), Value::Number(5.0)])), 3.0);
        assert_relative_eq!(number(call("avg", &[window(), Value::Number(2.0)])), 4.5);
    }

    #[test]
    fn short_history_uses_available_points() {
        assert_relative_eq!(number(call("sum", &[window(), Value::Number(50.0)])), 15.0);
    }

    #[test]
    fn non_positive_length_yields_zero() {
        for n in [0.0, -3.0] {
            assert_eq!(number(call("max", &[window(), Value::Number(n)])), 0.0);
        }
        assert_eq!(
            number(call("avg", &[Value::Series(vec![]), Value::Number(3.0)])),
            0.0
        );
    }

    #[test]
    fn min_max_and_scalar_window() {
        assert_eq!(number(call("min", &[window(), Value::Number(3.0)])), 3.0);
        assert_eq!(number(call("max", &[window(), Value::Number(3.0)])), 5.0);
        assert_eq!(
            number(call("avg", &[Value::Number(7.0), Value::Number(5.0)])),
            7.0
        );
    }

    #[test]
    fn aggregate_rejects_text_window() {
        let err = call("avg", &[Value::Text("abc".into()), Value::Number(2.0)]).unwrap_err();
        assert!(matches!(err, EvalError::Argument { index: 0, .. }));
    }

    #[test]
    fn time_since_counts_seconds() {
        let five_minutes_ago = Utc::now() - Duration::seconds(300);
        let elapsed = number(call("time_since", &[Value::Time(five_minutes_ago)]));
        assert!((299.0..=310.0).contains(&elapsed), "{elapsed}");

        let via_text = number(call("ago", &[Value::Text(five_minutes_ago.to_rfc3339())]));
        assert!((299.0..=310.0).contains(&via_text), "{via_text}");
    }

    #[test]
    fn time_since_rejects_non_time() {
        assert!(call("time_since", &[Value::Text("yesterday".into())]).is_err());
    }

    #[test]
    fn has_and_contains() {
        let title = Value::Text("SEC approves spot ETF".into());
        assert_eq!(
            call("has", &[title.clone(), Value::Text("ETF".into())]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call(
                "contains",
                &[title, Value::List(vec!["ban".into(), "hack".into()])]
            )
            .unwrap(),
            Value::Bool(false)
        );
    }
}
