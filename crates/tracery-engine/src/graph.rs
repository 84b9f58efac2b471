//! Pipeline definition and its registration in the ledger.
//!
//! A pipeline is one source, a linear list of steps, and a set of named
//! sinks. Forks fan out along the same step list; gates and error
//! dispositions divert rows to sinks. Positions in the ledger are: source 0,
//! steps `1..=n`, sinks `n + 1`.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracery_audit::{Ledger, NodeRegistration};
use tracery_types::{
    stable_hash, Determinism, NodeId, NodeType, Result, RoutingMode, RunId, TraceryError,
};

use crate::config::{
    AggregationSettings, CoalesceSettings, ErrorDisposition, GateSettings, RouteTarget,
    RunSettings, TransformSettings,
};
use crate::gate::Gate;
use crate::plugin::{Aggregation, GatePlugin, Sink, Source, Transform};
use crate::validation::validate_or_raise;

/// Edge label for the main path out of a non-gate node.
pub const CONTINUE: &str = "continue";
/// Edge label for a transform's error-sink diversion.
pub const ON_ERROR: &str = "on_error";

pub enum StepKind {
    Transform {
        settings: TransformSettings,
        plugin: Box<dyn Transform>,
    },
    Gate(Gate),
    Aggregation {
        settings: AggregationSettings,
        plugin: Box<dyn Aggregation>,
    },
    Coalesce(CoalesceSettings),
}

pub struct Step {
    pub node_id: NodeId,
    pub kind: StepKind,
}

impl Step {
    fn new(kind: StepKind) -> Self {
        let node_id = NodeId::for_node(node_type_of(&kind).as_str(), name_of(&kind));
        Self { node_id, kind }
    }

    pub fn name(&self) -> &str {
        name_of(&self.kind)
    }

    pub fn node_type(&self) -> NodeType {
        node_type_of(&self.kind)
    }

    pub fn plugin_name(&self) -> &str {
        match &self.kind {
            StepKind::Transform { plugin, .. } => plugin.name(),
            StepKind::Gate(gate) => gate.plugin_name(),
            StepKind::Aggregation { plugin, .. } => plugin.name(),
            StepKind::Coalesce(_) => "coalesce",
        }
    }

    fn plugin_version(&self) -> &str {
        match &self.kind {
            StepKind::Transform { plugin, .. } => plugin.plugin_version(),
            StepKind::Gate(gate) => gate.plugin_version(),
            StepKind::Aggregation { plugin, .. } => plugin.plugin_version(),
            StepKind::Coalesce(_) => env!("CARGO_PKG_VERSION"),
        }
    }

    fn determinism(&self) -> Determinism {
        match &self.kind {
            StepKind::Transform { plugin, .. } => plugin.determinism(),
            StepKind::Aggregation { plugin, .. } => plugin.determinism(),
            StepKind::Gate(_) | StepKind::Coalesce(_) => Determinism::Deterministic,
        }
    }

    /// The step's settings as recorded in the run fingerprint.
    pub fn settings_json(&self) -> Result<Value> {
        let settings = match &self.kind {
            StepKind::Transform { settings, .. } => serde_json::to_value(settings)?,
            StepKind::Gate(gate) => serde_json::to_value(&gate.settings)?,
            StepKind::Aggregation { settings, .. } => serde_json::to_value(settings)?,
            StepKind::Coalesce(settings) => serde_json::to_value(settings)?,
        };
        Ok(json!({
            "type": self.node_type().as_str(),
            "plugin": self.plugin_name(),
            "plugin_version": self.plugin_version(),
            "settings": settings,
        }))
    }
}

fn name_of(kind: &StepKind) -> &str {
    match kind {
        StepKind::Transform { settings, .. } => &settings.name,
        StepKind::Gate(gate) => gate.name(),
        StepKind::Aggregation { settings, .. } => &settings.name,
        StepKind::Coalesce(settings) => &settings.name,
    }
}

fn node_type_of(kind: &StepKind) -> NodeType {
    match kind {
        StepKind::Transform { .. } => NodeType::Transform,
        StepKind::Gate(_) => NodeType::Gate,
        StepKind::Aggregation { .. } => NodeType::Aggregation,
        StepKind::Coalesce(_) => NodeType::Coalesce,
    }
}

pub fn sink_node_id(name: &str) -> NodeId {
    NodeId::for_node(NodeType::Sink.as_str(), name)
}

/// Edge label for one fork branch out of a gate route.
pub fn fork_edge_label(route: &str, branch: &str) -> String {
    format!("{route}:{branch}")
}

pub struct Pipeline {
    pub(crate) source: Box<dyn Source>,
    pub(crate) source_node: NodeId,
    pub(crate) steps: Vec<Step>,
    pub(crate) sinks: BTreeMap<String, Box<dyn Sink>>,
    pub(crate) settings: RunSettings,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("settings", &self.settings)
            .field("steps", &self.steps.len())
            .field("sinks", &self.sinks.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn builder(settings: RunSettings, source: impl Source + 'static) -> PipelineBuilder {
        PipelineBuilder::new(settings, source)
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn sink_names(&self) -> impl Iterator<Item = &str> {
        self.sinks.keys().map(String::as_str)
    }

    pub fn has_sink(&self, name: &str) -> bool {
        self.sinks.contains_key(name)
    }

    pub fn node_count(&self) -> usize {
        1 + self.steps.len() + self.sinks.len()
    }

    /// Ledger position of the sinks.
    pub fn sink_step_index(&self) -> usize {
        self.steps.len() + 1
    }

    /// The node a token moves to after step `index` (0-based).
    pub fn next_node(&self, index: usize) -> NodeId {
        self.steps
            .get(index + 1)
            .map(|s| s.node_id.clone())
            .unwrap_or_else(|| sink_node_id(&self.settings.default_sink))
    }

    /// Canonical description of the pipeline, stored as the run's settings.
    pub fn describe(&self) -> Result<Value> {
        let steps = self
            .steps
            .iter()
            .map(Step::settings_json)
            .collect::<Result<Vec<_>>>()?;
        Ok(json!({
            "run": self.settings,
            "source": {
                "plugin": self.source.name(),
                "plugin_version": self.source.plugin_version(),
            },
            "steps": steps,
            "sinks": self
                .sinks
                .iter()
                .map(|(name, sink)| json!({"name": name, "plugin": sink.name()}))
                .collect::<Vec<_>>(),
        }))
    }

    /// Register every node and edge of this pipeline under `run_id`.
    pub fn register(&self, ledger: &Ledger, run_id: &RunId) -> Result<()> {
        let source_config = json!({
            "plugin": self.source.name(),
            "plugin_version": self.source.plugin_version(),
        });
        ledger.register_node(
            run_id,
            NodeRegistration {
                node_id: self.source_node.clone(),
                plugin_name: self.source.name().to_string(),
                node_type: NodeType::Source,
                plugin_version: self.source.plugin_version().to_string(),
                determinism: self.source.determinism(),
                config_hash: stable_hash(&source_config)?,
            },
        )?;
        for step in &self.steps {
            ledger.register_node(
                run_id,
                NodeRegistration {
                    node_id: step.node_id.clone(),
                    plugin_name: step.plugin_name().to_string(),
                    node_type: step.node_type(),
                    plugin_version: step.plugin_version().to_string(),
                    determinism: step.determinism(),
                    config_hash: stable_hash(&step.settings_json()?)?,
                },
            )?;
        }
        for (name, sink) in &self.sinks {
            ledger.register_node(
                run_id,
                NodeRegistration {
                    node_id: sink_node_id(name),
                    plugin_name: sink.name().to_string(),
                    node_type: NodeType::Sink,
                    plugin_version: sink.plugin_version().to_string(),
                    determinism: sink.determinism(),
                    config_hash: stable_hash(&json!({"name": name, "plugin": sink.name()}))?,
                },
            )?;
        }

        let first = self
            .steps
            .first()
            .map(|s| s.node_id.clone())
            .unwrap_or_else(|| sink_node_id(&self.settings.default_sink));
        ledger.register_edge(run_id, &self.source_node, &first, CONTINUE, RoutingMode::Move)?;

        for (index, step) in self.steps.iter().enumerate() {
            let next = self.next_node(index);
            match &step.kind {
                StepKind::Gate(gate) => {
                    for (label, target) in &gate.settings.routes {
                        match target {
                            RouteTarget::Continue => {
                                ledger.register_edge(
                                    run_id,
                                    &step.node_id,
                                    &next,
                                    label,
                                    RoutingMode::Move,
                                )?;
                            }
                            RouteTarget::Fork { branches } => {
                                for branch in branches {
                                    ledger.register_edge(
                                        run_id,
                                        &step.node_id,
                                        &next,
                                        &fork_edge_label(label, branch),
                                        RoutingMode::Copy,
                                    )?;
                                }
                            }
                            RouteTarget::Sink { sink } => {
                                ledger.register_edge(
                                    run_id,
                                    &step.node_id,
                                    &sink_node_id(sink),
                                    label,
                                    RoutingMode::Move,
                                )?;
                            }
                        }
                    }
                }
                StepKind::Transform { settings, .. } => {
                    ledger.register_edge(run_id, &step.node_id, &next, CONTINUE, RoutingMode::Move)?;
                    if let ErrorDisposition::Sink { sink } = &settings.on_error {
                        ledger.register_edge(
                            run_id,
                            &step.node_id,
                            &sink_node_id(sink),
                            ON_ERROR,
                            RoutingMode::Move,
                        )?;
                    }
                }
                StepKind::Aggregation { .. } | StepKind::Coalesce(_) => {
                    ledger.register_edge(run_id, &step.node_id, &next, CONTINUE, RoutingMode::Move)?;
                }
            }
        }
        tracing::debug!(run_id = %run_id, nodes = self.node_count(), "Pipeline registered");
        Ok(())
    }
}

/// Assembles a [`Pipeline`]. Conditions are parsed as steps are added and the
/// finished pipeline is validated by [`build`](Self::build).
pub struct PipelineBuilder {
    settings: RunSettings,
    source: Box<dyn Source>,
    steps: Vec<Step>,
    sinks: BTreeMap<String, Box<dyn Sink>>,
    errors: Vec<TraceryError>,
}

impl PipelineBuilder {
    pub fn new(settings: RunSettings, source: impl Source + 'static) -> Self {
        Self {
            settings,
            source: Box::new(source),
            steps: Vec::new(),
            sinks: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn transform(mut self, settings: TransformSettings, plugin: impl Transform + 'static) -> Self {
        self.steps.push(Step::new(StepKind::Transform {
            settings,
            plugin: Box::new(plugin),
        }));
        self
    }

    /// A gate routed by its condition.
    pub fn gate(mut self, settings: GateSettings) -> Self {
        match Gate::condition(settings) {
            Ok(gate) => self.steps.push(Step::new(StepKind::Gate(gate))),
            Err(e) => self.errors.push(e),
        }
        self
    }

    /// A gate routed by plugin code.
    pub fn plugin_gate(mut self, settings: GateSettings, plugin: impl GatePlugin + 'static) -> Self {
        let gate = Gate::plugin(settings, Box::new(plugin));
        self.steps.push(Step::new(StepKind::Gate(gate)));
        self
    }

    pub fn aggregation(
        mut self,
        settings: AggregationSettings,
        plugin: impl Aggregation + 'static,
    ) -> Self {
        if let Err(e) = settings.trigger.parse_condition() {
            self.errors.push(e);
        }
        self.steps.push(Step::new(StepKind::Aggregation {
            settings,
            plugin: Box::new(plugin),
        }));
        self
    }

    pub fn coalesce(mut self, settings: CoalesceSettings) -> Self {
        self.steps.push(Step::new(StepKind::Coalesce(settings)));
        self
    }

    pub fn sink(mut self, name: impl Into<String>, sink: impl Sink + 'static) -> Self {
        let name = name.into();
        if self.sinks.contains_key(&name) {
            self.errors.push(TraceryError::ValidationError(format!(
                "sink '{name}' declared twice"
            )));
        } else {
            self.sinks.insert(name, Box::new(sink));
        }
        self
    }

    /// Fails on the first condition that does not parse, then on any
    /// error-severity diagnostic.
    pub fn build(self) -> Result<Pipeline> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(error);
        }
        let source_node = NodeId::for_node(NodeType::Source.as_str(), self.source.name());
        let pipeline = Pipeline {
            source: self.source,
            source_node,
            steps: self.steps,
            sinks: self.sinks,
            settings: self.settings,
        };
        for diagnostic in validate_or_raise(&pipeline)? {
            tracing::warn!(
                rule = %diagnostic.rule,
                node = diagnostic.node.as_deref().unwrap_or("-"),
                "{}",
                diagnostic.message
            );
        }
        Ok(pipeline)
    }
}
