//! Gate routing: evaluate a row to a label, resolve the label to a route.

use serde_json::Value;
use tracery_expr::Expression;
use tracery_types::{Result, RowData, TraceryError};

use crate::config::{GateSettings, RouteTarget};
use crate::plugin::GatePlugin;

/// How a gate produces its label.
pub enum GateEvaluator {
    Condition(Expression),
    Plugin(Box<dyn GatePlugin>),
}

pub struct Gate {
    pub settings: GateSettings,
    evaluator: GateEvaluator,
}

/// A gate's decision for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub label: String,
    pub target: RouteTarget,
    /// Condition text, for the routing event.
    pub condition: Option<String>,
}

impl Gate {
    /// A condition gate. The condition is parsed here, so a bad expression
    /// fails before any row is read.
    pub fn condition(settings: GateSettings) -> Result<Self> {
        let source = settings.condition.as_deref().ok_or_else(|| {
            TraceryError::ValidationError(format!(
                "gate '{}' has neither a condition nor a plugin",
                settings.name
            ))
        })?;
        let expression = Expression::parse(source)?;
        Ok(Self {
            settings,
            evaluator: GateEvaluator::Condition(expression),
        })
    }

    pub fn plugin(settings: GateSettings, plugin: Box<dyn GatePlugin>) -> Self {
        Self {
            settings,
            evaluator: GateEvaluator::Plugin(plugin),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn plugin_name(&self) -> &str {
        match &self.evaluator {
            GateEvaluator::Condition(_) => "condition",
            GateEvaluator::Plugin(plugin) => plugin.name(),
        }
    }

    pub fn plugin_version(&self) -> &str {
        match &self.evaluator {
            GateEvaluator::Condition(_) => env!("CARGO_PKG_VERSION"),
            GateEvaluator::Plugin(plugin) => plugin.plugin_version(),
        }
    }

    pub fn decide(&self, row: &RowData) -> Result<GateDecision> {
        let (label, condition) = match &self.evaluator {
            GateEvaluator::Condition(expr) => {
                let label = match expr.evaluate(self.name(), row)? {
                    Value::Bool(b) => b.to_string(),
                    Value::String(s) => s,
                    other => {
                        return Err(TraceryError::ExpressionEvaluation {
                            node: self.name().to_string(),
                            message: format!(
                                "gate condition `{expr}` must produce a boolean or a string label, got {other}"
                            ),
                        })
                    }
                };
                (label, Some(expr.source().to_string()))
            }
            GateEvaluator::Plugin(plugin) => (plugin.route(row)?, None),
        };
        let target = self.settings.routes.get(&label).cloned().ok_or_else(|| {
            TraceryError::ExpressionEvaluation {
                node: self.name().to_string(),
                message: format!("no route configured for label '{label}'"),
            }
        })?;
        Ok(GateDecision {
            label,
            target,
            condition,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::FnGate;
    use serde_json::json;

    fn row(value: Value) -> RowData {
        value.as_object().cloned().unwrap_or_default()
    }

    fn confidence_gate() -> Gate {
        Gate::condition(
            GateSettings::new("quality")
                .condition("row['confidence'] >= 0.85")
                .route("true", RouteTarget::Continue)
                .route(
                    "false",
                    RouteTarget::Sink {
                        sink: "review".into(),
                    },
                ),
        )
        .unwrap()
    }

    #[test]
    fn boolean_condition_maps_to_true_false_labels() {
        let gate = confidence_gate();
        let pass = gate.decide(&row(json!({"confidence": 0.9}))).unwrap();
        assert_eq!(pass.label, "true");
        assert_eq!(pass.target, RouteTarget::Continue);
        assert_eq!(pass.condition.as_deref(), Some("row['confidence'] >= 0.85"));

        let fail = gate.decide(&row(json!({"confidence": 0.5}))).unwrap();
        assert_eq!(
            fail.target,
            RouteTarget::Sink {
                sink: "review".into()
            }
        );
    }

    #[test]
    fn missing_field_is_attributed_to_the_gate() {
        let gate = confidence_gate();
        match gate.decide(&row(json!({}))).unwrap_err() {
            TraceryError::MissingField { node, field } => {
                assert_eq!(node, "quality");
                assert_eq!(field, "row['confidence']");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn string_labels_select_routes() {
        let gate = Gate::condition(
            GateSettings::new("router")
                .condition("row.get('kind', 'other')")
                .route("other", RouteTarget::Continue)
                .route(
                    "fanout",
                    RouteTarget::Fork {
                        branches: vec!["a".into(), "b".into()],
                    },
                ),
        )
        .unwrap();
        let decision = gate.decide(&row(json!({"kind": "fanout"}))).unwrap();
        assert!(matches!(decision.target, RouteTarget::Fork { .. }));
        let decision = gate.decide(&row(json!({}))).unwrap();
        assert_eq!(decision.target, RouteTarget::Continue);
    }

    #[test]
    fn unmapped_label_is_an_error() {
        let gate = Gate::condition(
            GateSettings::new("router")
                .condition("row['kind']")
                .route("x", RouteTarget::Continue),
        )
        .unwrap();
        let err = gate.decide(&row(json!({"kind": "y"}))).unwrap_err();
        assert!(err.to_string().contains("no route configured for label 'y'"));
    }

    #[test]
    fn numeric_result_is_rejected() {
        let gate = Gate::condition(
            GateSettings::new("router")
                .condition("row['n']")
                .route("1", RouteTarget::Continue),
        )
        .unwrap();
        assert!(gate.decide(&row(json!({"n": 1}))).is_err());
    }

    #[test]
    fn bad_condition_fails_at_construction() {
        let result = Gate::condition(
            GateSettings::new("g")
                .condition("row['a'].upper() == 'X'")
                .route("true", RouteTarget::Continue),
        );
        assert!(matches!(
            result,
            Err(TraceryError::ExpressionSyntax { .. })
        ));
        assert!(Gate::condition(GateSettings::new("g")).is_err());
    }

    #[test]
    fn plugin_gate_uses_plugin_label() {
        let gate = Gate::plugin(
            GateSettings::new("custom").route("even", RouteTarget::Continue),
            Box::new(FnGate::new("parity", |row: &RowData| {
                Ok(if row["n"].as_i64().unwrap_or(1) % 2 == 0 {
                    "even".to_string()
                } else {
                    "odd".to_string()
                })
            })),
        );
        assert_eq!(gate.plugin_name(), "parity");
        assert_eq!(gate.decide(&row(json!({"n": 2}))).unwrap().label, "even");
        assert!(gate.decide(&row(json!({"n": 3}))).is_err());
    }
}
