//! Boolean expression assertions over named resources
//!
//! Evaluating an expression language is left to a [`PredicateEvaluator`]
//! implementation. This module owns the shape of an expression block (named
//! resource bindings plus `all`/`any` expression groups) and folds evaluator
//! results into the step's failure list.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::resource::TypeId;

/// Errors from evaluating expressions
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PredicateError {
    #[error("no expression evaluator configured, cannot evaluate '{0}'")]
    Unsupported(String),

    #[error("failed to evaluate '{expression}': {reason}")]
    Evaluation { expression: String, reason: String },

    #[error("expression '{0}' evaluated to false")]
    False(String),

    #[error("none of the 'any' expressions held: {}", .0.join(", "))]
    NoneHeld(Vec<String>),

    #[error("resource binding '{name}' could not be resolved: {reason}")]
    Binding { name: String, reason: String },
}

/// A resource made available to expressions under `binding`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(rename = "ref")]
    pub binding: String,
}

impl ResourceRef {
    pub fn type_id(&self) -> TypeId {
        TypeId::from_api_version(&self.api_version, &self.kind)
    }
}

/// Expression block of an assertion
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Expressions {
    pub resource_refs: Vec<ResourceRef>,
    /// Every expression must hold
    pub assert_all: Vec<Expression>,
    /// At least one expression must hold
    pub assert_any: Vec<Expression>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Expression {
    #[serde(alias = "cel")]
    pub expression: String,
}

impl Expressions {
    pub fn is_empty(&self) -> bool {
        self.assert_all.is_empty() && self.assert_any.is_empty()
    }
}

/// Evaluates one boolean expression against bound resources
pub trait PredicateEvaluator: Send + Sync {
    fn evaluate(
        &self,
        bindings: &BTreeMap<String, Value>,
        expression: &str,
    ) -> Result<bool, PredicateError>;
}

/// Evaluator used when no expression engine is configured
///
/// Any expression is a failure, so a suite relying on expressions cannot pass
/// silently.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPredicates;

impl PredicateEvaluator for NoPredicates {
    fn evaluate(
        &self,
        _bindings: &BTreeMap<String, Value>,
        expression: &str,
    ) -> Result<bool, PredicateError> {
        Err(PredicateError::Unsupported(expression.to_string()))
    }
}

/// Evaluate an expression block; an empty list means every check held
pub fn check(
    evaluator: &dyn PredicateEvaluator,
    bindings: &BTreeMap<String, Value>,
    expressions: &Expressions,
) -> Vec<PredicateError> {
    let mut failures = Vec::new();

    for expr in &expressions.assert_all {
        match evaluator.evaluate(bindings, &expr.expression) {
            Ok(true) => {}
            Ok(false) => failures.push(PredicateError::False(expr.expression.clone())),
            Err(e) => failures.push(e),
        }
    }

    if !expressions.assert_any.is_empty() {
        let mut held = false;
        let mut errors = Vec::new();
        for expr in &expressions.assert_any {
            match evaluator.evaluate(bindings, &expr.expression) {
                Ok(true) => {
                    held = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => errors.push(e),
            }
        }
        if !held {
            failures.extend(errors);
            failures.push(PredicateError::NoneHeld(
                expressions
                    .assert_any
                    .iter()
                    .map(|e| e.expression.clone())
                    .collect(),
            ));
        }
    }

    failures
}
