use crate::auth::error::{AuthError, AuthResult};
use cel_interpreter::{Context, Program, Value};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::Arc;

/// The closed variable environment a conditional binding may reference.
/// Nothing else about the request is exposed to expressions.
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub path: String,
    pub host: String,
    /// Unix seconds at decision time.
    pub time: i64,
}

/// Compile-once, evaluate-many CEL conditions.
///
/// Programs are cached by exact expression text and never evicted; the
/// population is bounded by the distinct expressions in policy bindings.
/// A first compile holds the cache shard for its text, so concurrent first
/// evaluations of one expression compile it exactly once.
pub struct ConditionEvaluator {
    programs: DashMap<String, Arc<Program>>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self {
            programs: DashMap::new(),
        }
    }

    /// Evaluate `text` against the request parameters. Compile failures and
    /// evaluation failures are distinct kinds; the caller denies on both.
    pub fn evaluate(&self, text: &str, params: &RequestParams) -> AuthResult<bool> {
        let program = self.program_for(text)?;

        let mut context = Context::default();
        let request: HashMap<String, Value> = HashMap::from([
            (
                "path".to_string(),
                Value::String(Arc::new(params.path.clone())),
            ),
            (
                "host".to_string(),
                Value::String(Arc::new(params.host.clone())),
            ),
            ("time".to_string(), Value::Int(params.time)),
        ]);
        context.add_variable_from_value("request", Value::from(request));

        match program.execute(&context) {
            Ok(Value::Bool(holds)) => Ok(holds),
            Ok(_) => Err(AuthError::ExpressionError(
                "expression did not evaluate to a boolean".to_string(),
            )),
            Err(err) => Err(AuthError::ExpressionError(err.to_string())),
        }
    }

    fn program_for(&self, text: &str) -> AuthResult<Arc<Program>> {
        if let Some(program) = self.programs.get(text) {
            return Ok(program.clone());
        }
        match self.programs.entry(text.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(slot) => {
                let program = Arc::new(
                    Program::compile(text)
                        .map_err(|err| AuthError::BadExpression(err.to_string()))?,
                );
                slot.insert(program.clone());
                Ok(program)
            }
        }
    }

    #[cfg(test)]
    fn compiled_count(&self) -> usize {
        self.programs.len()
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}
