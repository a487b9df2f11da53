/// Expression evaluator used by control-flow nodes
///
/// Wraps parsing, static checking and evaluation behind the API the actions
/// use (`evaluate_condition`, `evaluate`, compile-once/run-many and
/// validation). Parsed programs are cached by source text; type checking is
/// repeated per context because it depends on the context's shape.

use crate::expression::compiler::{lookup, type_check, CompiledExpression, ValueType};
use crate::expression::error::ExpressionError;
use crate::expression::lexer::BinaryOp;
use crate::expression::parser::{parse, Expr};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;

/// Upper bound on cached parsed programs before the cache is reset.
const MAX_CACHED_PROGRAMS: usize = 1024;

/// Sandboxed evaluator for workflow conditions and values.
///
/// The language has no loops, calls or assignment, so evaluation is bounded
/// by the size of the expression.
#[derive(Debug, Default)]
pub struct Evaluator {
    cache: DashMap<String, Arc<Expr>>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn parsed(&self, source: &str) -> Result<Arc<Expr>, ExpressionError> {
        if source.trim().is_empty() {
            return Err(ExpressionError::EmptyExpression);
        }
        if let Some(program) = self.cache.get(source) {
            return Ok(Arc::clone(program.value()));
        }

        let program = Arc::new(parse(source)?);
        if self.cache.len() >= MAX_CACHED_PROGRAMS {
            tracing::debug!("🧹 Expression cache full ({} entries), clearing", self.cache.len());
            self.cache.clear();
        }
        self.cache.insert(source.to_string(), Arc::clone(&program));
        Ok(program)
    }

    /// Parse and type-check `source` against the shape of `context`.
    pub fn compile_expression(
        &self,
        source: &str,
        context: &Value,
    ) -> Result<CompiledExpression, ExpressionError> {
        ensure_context(context)?;
        let program = self.parsed(source)?;
        let result_type = type_check(&program, context)?;
        Ok(CompiledExpression::new(source, program, result_type))
    }

    /// Run a previously compiled program against a (possibly different) context.
    pub fn evaluate_with_program(
        &self,
        compiled: &CompiledExpression,
        context: &Value,
    ) -> Result<Value, ExpressionError> {
        ensure_context(context)?;
        eval(compiled.program(), context)
    }

    /// Evaluate `source` and return whatever value it produces.
    pub fn evaluate(&self, source: &str, context: &Value) -> Result<Value, ExpressionError> {
        let compiled = self.compile_expression(source, context)?;
        self.evaluate_with_program(&compiled, context)
    }

    /// Evaluate `source` as a condition; the result must be a boolean.
    pub fn evaluate_condition(&self, source: &str, context: &Value) -> Result<bool, ExpressionError> {
        let value = self.evaluate(source, context)?;
        match value {
            Value::Bool(result) => Ok(result),
            other => Err(ExpressionError::NonBooleanResult {
                result_type: ValueType::of(&other).to_string(),
            }),
        }
    }

    /// Check a condition for syntax and static type errors without real data.
    pub fn validate_condition(&self, source: &str) -> Result<(), ExpressionError> {
        let compiled = self.compile_expression(source, &mock_context())?;
        match compiled.result_type() {
            ValueType::Bool | ValueType::Any => Ok(()),
            other => Err(ExpressionError::NonBooleanResult {
                result_type: other.to_string(),
            }),
        }
    }

    /// Best-effort list of the variable paths an expression reads.
    ///
    /// Only statically written paths are reported; an unparsable expression
    /// yields an empty list.
    pub fn extract_paths(&self, source: &str) -> Vec<String> {
        match self.parsed(source) {
            Ok(program) => CompiledExpression::new(source, program, ValueType::Any).paths(),
            Err(_) => Vec::new(),
        }
    }
}

/// Representative context used by [`Evaluator::validate_condition`].
fn mock_context() -> Value {
    json!({
        "trigger": {},
        "steps": {},
        "env": {
            "tenant_id": "tenant",
            "execution_id": "execution",
            "workflow_id": "workflow",
            "trigger_type": "manual"
        }
    })
}

fn ensure_context(context: &Value) -> Result<(), ExpressionError> {
    if !context.is_object() {
        return Err(ExpressionError::InvalidContext(
            "context must be a JSON object with trigger, steps and env".to_string(),
        ));
    }
    Ok(())
}

fn eval(expr: &Expr, context: &Value) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => Ok(lookup(path, context).cloned().unwrap_or(Value::Null)),
        Expr::Not(inner) => {
            let value = eval(inner, context)?;
            Ok(Value::Bool(!expect_bool("!", &value)?))
        }
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, context),
    }
}

fn expect_bool(op: &str, value: &Value) -> Result<bool, ExpressionError> {
    value.as_bool().ok_or_else(|| {
        ExpressionError::eval(format!(
            "operand of '{}' must be bool, got {}",
            op,
            ValueType::of(value)
        ))
    })
}

fn eval_binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, context: &Value) -> Result<Value, ExpressionError> {
    let operands = || -> Result<(Value, Value), ExpressionError> { Ok((eval(lhs, context)?, eval(rhs, context)?)) };
    let result = match op {
        // Short-circuit: the right side is only evaluated when needed.
        BinaryOp::And => {
            expect_bool(op.symbol(), &eval(lhs, context)?)? && expect_bool(op.symbol(), &eval(rhs, context)?)?
        }
        BinaryOp::Or => {
            expect_bool(op.symbol(), &eval(lhs, context)?)? || expect_bool(op.symbol(), &eval(rhs, context)?)?
        }
        BinaryOp::Eq => {
            let (left, right) = operands()?;
            values_equal(&left, &right)
        }
        BinaryOp::Ne => {
            let (left, right) = operands()?;
            !values_equal(&left, &right)
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let (left, right) = operands()?;
            let ordering = compare(op, &left, &right)?;
            match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }
        }
        BinaryOp::Contains => {
            let (left, right) = operands()?;
            contains(&left, &right)?
        }
        BinaryOp::StartsWith => {
            let (left, right) = operands()?;
            let (subject, affix) = string_operands(op, &left, &right)?;
            subject.starts_with(affix)
        }
        BinaryOp::EndsWith => {
            let (left, right) = operands()?;
            let (subject, affix) = string_operands(op, &left, &right)?;
            subject.ends_with(affix)
        }
    };
    Ok(Value::Bool(result))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        _ => left == right,
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExpressionError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y)
                .ok_or_else(|| ExpressionError::eval(format!("cannot order {} and {}", a, b)))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(ExpressionError::eval(format!(
            "cannot evaluate {} {} {}",
            ValueType::of(left),
            op.symbol(),
            ValueType::of(right)
        ))),
    }
}

fn contains(left: &Value, right: &Value) -> Result<bool, ExpressionError> {
    match (left, right) {
        (Value::String(haystack), Value::String(needle)) => Ok(haystack.contains(needle.as_str())),
        (Value::Array(items), needle) => Ok(items.iter().any(|item| values_equal(item, needle))),
        _ => Err(ExpressionError::eval(format!(
            "'contains' cannot be applied to {} and {}",
            ValueType::of(left),
            ValueType::of(right)
        ))),
    }
}

fn string_operands<'a>(
    op: BinaryOp,
    left: &'a Value,
    right: &'a Value,
) -> Result<(&'a str, &'a str), ExpressionError> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok((a.as_str(), b.as_str())),
        _ => Err(ExpressionError::eval(format!(
            "'{}' needs string operands, got {} and {}",
            op.symbol(),
            ValueType::of(left),
            ValueType::of(right)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(steps: Value) -> Value {
        json!({"trigger": {}, "steps": steps, "env": {"tenant_id": "t1"}})
    }

    #[test]
    fn test_scenario_status_and_count() {
        let evaluator = Evaluator::new();
        let context = ctx(json!({"step1": {"status": "success", "output": {"count": 42}}}));
        assert!(evaluator
            .evaluate_condition(
                "steps.step1.status == \"success\" && steps.step1.output.count > 10",
                &context,
            )
            .unwrap());
    }

    #[test]
    fn test_numeric_segments_index_arrays() {
        let evaluator = Evaluator::new();
        let context = ctx(json!({"a": [[1, 2], [3, 4]], "b": {"0": {"1": "keyed"}}}));
        assert!(evaluator.evaluate_condition("steps.a.0.1 == 2", &context).unwrap());
        assert!(evaluator.evaluate_condition("steps.a.1.0 == steps.a[1][0]", &context).unwrap());
        assert!(evaluator.evaluate_condition("steps.b.0.1 == 'keyed'", &context).unwrap());
    }

    #[test]
    fn test_ordering_round_trip() {
        let evaluator = Evaluator::new();
        let high = json!({"trigger": {"a": 10, "b": 5}, "steps": {}, "env": {}});
        let low = json!({"trigger": {"a": 5, "b": 10}, "steps": {}, "env": {}});
        assert!(evaluator.evaluate_condition("trigger.a > trigger.b", &high).unwrap());
        assert!(!evaluator.evaluate_condition("trigger.a > trigger.b", &low).unwrap());
    }

    #[test]
    fn test_failure_modes() {
        let evaluator = Evaluator::new();
        let context = ctx(json!({"s": {"n": 1, "name": "x"}}));

        assert_eq!(
            evaluator.evaluate_condition("", &context).unwrap_err(),
            ExpressionError::EmptyExpression
        );
        assert!(matches!(
            evaluator.evaluate_condition("{{ steps.s.n > 0", &context).unwrap_err(),
            ExpressionError::Parse { .. }
        ));
        assert!(matches!(
            evaluator.evaluate_condition("steps.s.n > 'a'", &context).unwrap_err(),
            ExpressionError::Compile { .. }
        ));
        assert!(matches!(
            evaluator.evaluate_condition("steps.s.missing > 1", &context).unwrap_err(),
            ExpressionError::Eval { .. }
        ));
        assert!(matches!(
            evaluator.evaluate_condition("steps.s.name", &context).unwrap_err(),
            ExpressionError::NonBooleanResult { ref result_type } if result_type == "string"
        ));
    }

    #[test]
    fn test_evaluate_returns_values() {
        let evaluator = Evaluator::new();
        let context = ctx(json!({"fetch": {"data": [{"name": "a"}, {"name": "b"}]}}));
        assert_eq!(
            evaluator.evaluate("{{ steps.fetch.data[1].name }}", &context).unwrap(),
            json!("b")
        );
        assert_eq!(evaluator.evaluate("steps.fetch.nothing", &context).unwrap(), Value::Null);
        assert_eq!(evaluator.evaluate("-2.5", &context).unwrap(), json!(-2.5));
    }

    #[test]
    fn test_string_predicates_symbolic_and_named() {
        let evaluator = Evaluator::new();
        let context = json!({"trigger": {"path": "/api/v1/users", "tags": ["x", "y"]}, "steps": {}, "env": {}});
        for source in [
            "trigger.path contains 'v1'",
            "trigger.path *= 'v1'",
            "trigger.path starts_with '/api'",
            "trigger.path ^= '/api'",
            "trigger.path endsWith 'users'",
            "trigger.path $= 'users'",
            "trigger.tags contains 'y'",
            "not (trigger.path contains 'v2')",
            "!(trigger.path ends_with 'x') and trigger.path != 'y'",
        ] {
            assert!(evaluator.evaluate_condition(source, &context).unwrap(), "{}", source);
        }
    }

    #[test]
    fn test_numeric_equality_ignores_representation() {
        let evaluator = Evaluator::new();
        let context = json!({"trigger": {"n": 3.0}, "steps": {}, "env": {}});
        assert!(evaluator.evaluate_condition("trigger.n == 3", &context).unwrap());
    }

    #[test]
    fn test_compiled_program_reused_across_contexts() {
        let evaluator = Evaluator::new();
        let first = json!({"trigger": {"count": 20}, "steps": {}, "env": {}});
        let second = json!({"trigger": {"count": 2}, "steps": {}, "env": {}});
        let compiled = evaluator.compile_expression("trigger.count >= 10", &first).unwrap();
        assert_eq!(compiled.result_type(), ValueType::Bool);
        assert_eq!(evaluator.evaluate_with_program(&compiled, &first).unwrap(), json!(true));
        assert_eq!(evaluator.evaluate_with_program(&compiled, &second).unwrap(), json!(false));
    }

    #[test]
    fn test_short_circuit_skips_rhs_type_errors() {
        let evaluator = Evaluator::new();
        let context = json!({"trigger": {"ok": false, "name": "x"}, "steps": {}, "env": {}});
        // rhs would fail at runtime if evaluated
        assert!(!evaluator
            .evaluate_condition("trigger.ok && steps.absent > 1", &context)
            .unwrap());
    }

    #[test]
    fn test_validate_condition() {
        let evaluator = Evaluator::new();
        assert!(evaluator.validate_condition("steps.a.b > 3 || trigger.x == 'y'").is_ok());
        assert!(evaluator.validate_condition("{{ steps.a.status }}").is_ok());
        assert!(matches!(
            evaluator.validate_condition("env.tenant_id > 5").unwrap_err(),
            ExpressionError::Compile { .. }
        ));
        assert!(matches!(
            evaluator.validate_condition("'just text'").unwrap_err(),
            ExpressionError::NonBooleanResult { .. }
        ));
        assert!(matches!(
            evaluator.validate_condition("steps.a ==").unwrap_err(),
            ExpressionError::Compile { .. }
        ));
    }

    #[test]
    fn test_extract_paths() {
        let evaluator = Evaluator::new();
        assert_eq!(
            evaluator.extract_paths("{{ steps.a.b == trigger.c[0] }}"),
            vec!["steps.a.b".to_string(), "trigger.c[0]".to_string()]
        );
        assert!(evaluator.extract_paths("steps.a ==").is_empty());
    }

    #[test]
    fn test_rejects_non_object_context() {
        let evaluator = Evaluator::new();
        assert!(matches!(
            evaluator.evaluate("true", &json!([1])).unwrap_err(),
            ExpressionError::InvalidContext(_)
        ));
    }
}
