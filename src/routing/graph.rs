//! Route graph and the resolver the orchestrators consult for next steps.
//!
//! The graph is loaded once at startup and shared read-only. All route
//! topology lives here; nothing else hardcodes a transition.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::assembly::IncompleteAssemblyPolicy;
use crate::ids::{MaterialId, RouteId, RouteStepId};

#[derive(Debug, Error)]
pub enum RouteGraphError {
    #[error("failed to read route graph {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse route graph: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("first step {0} is not defined")]
    UndefinedFirstStep(RouteStepId),
    #[error("step {0} is defined more than once")]
    DuplicateStep(RouteStepId),
    #[error("step {step} names undefined successor {successor}")]
    UndefinedSuccessor {
        step: RouteStepId,
        successor: RouteStepId,
    },
    #[error("step {step} has a rejoin rule for undefined previous step {previous}")]
    UndefinedRejoinStep {
        step: RouteStepId,
        previous: RouteStepId,
    },
    #[error("step {0} is not reachable from the first step")]
    UnreachableStep(RouteStepId),
}

/// Pure, total lookups over the route topology. Unknown steps resolve to
/// an empty sequence, which callers treat as a dead end.
pub trait RouteResolver: Send + Sync {
    fn route_id(&self) -> &RouteId;

    fn first_step(&self) -> &RouteStepId;

    /// `previous` disambiguates routes that rejoin at `current`.
    fn next_on_pass(&self, current: &RouteStepId, previous: Option<&RouteStepId>)
        -> &[RouteStepId];

    fn next_on_fail(&self, current: &RouteStepId) -> &[RouteStepId];

    fn next_on_abort(&self, current: &RouteStepId) -> &[RouteStepId];
}

/// Overrides the pass successors when the unit reached this step from
/// `previous`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinRule {
    pub previous: RouteStepId,
    pub next: Vec<RouteStepId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: RouteStepId,
    #[serde(default)]
    pub on_pass: Vec<RouteStepId>,
    #[serde(default)]
    pub on_fail: Vec<RouteStepId>,
    #[serde(default)]
    pub on_abort: Vec<RouteStepId>,
    #[serde(default)]
    pub on_pass_from: Vec<RejoinRule>,
    /// Non-empty when an operation at this step is an assembly.
    #[serde(default)]
    pub materials_to_assemble: Vec<MaterialId>,
    #[serde(default)]
    pub incomplete_assembly_policy: Option<IncompleteAssemblyPolicy>,
}

impl StepDefinition {
    pub fn new(id: impl Into<RouteStepId>) -> Self {
        Self {
            id: id.into(),
            on_pass: Vec::new(),
            on_fail: Vec::new(),
            on_abort: Vec::new(),
            on_pass_from: Vec::new(),
            materials_to_assemble: Vec::new(),
            incomplete_assembly_policy: None,
        }
    }

    pub fn requires_assembly(&self) -> bool {
        !self.materials_to_assemble.is_empty()
    }

    fn successors(&self) -> impl Iterator<Item = &RouteStepId> {
        self.on_pass
            .iter()
            .chain(&self.on_fail)
            .chain(&self.on_abort)
            .chain(self.on_pass_from.iter().flat_map(|rule| rule.next.iter()))
    }
}

/// On-disk shape of a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub route_id: RouteId,
    pub first_step: RouteStepId,
    #[serde(default)]
    pub associated_materials: Vec<MaterialId>,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone)]
pub struct RouteGraph {
    route_id: RouteId,
    first_step: RouteStepId,
    associated_materials: HashSet<MaterialId>,
    steps: HashMap<RouteStepId, StepDefinition>,
    order: Vec<RouteStepId>,
}

impl RouteGraph {
    /// Validate a definition and build the graph.
    pub fn from_definition(definition: RouteDefinition) -> Result<Self, RouteGraphError> {
        let mut seen = HashSet::new();
        for step in &definition.steps {
            if !seen.insert(step.id.clone()) {
                return Err(RouteGraphError::DuplicateStep(step.id.clone()));
            }
        }

        if !seen.contains(&definition.first_step) {
            return Err(RouteGraphError::UndefinedFirstStep(definition.first_step));
        }

        for step in &definition.steps {
            if let Some(successor) = step.successors().find(|s| !seen.contains(*s)) {
                return Err(RouteGraphError::UndefinedSuccessor {
                    step: step.id.clone(),
                    successor: successor.clone(),
                });
            }
            if let Some(rule) = step.on_pass_from.iter().find(|r| !seen.contains(&r.previous)) {
                return Err(RouteGraphError::UndefinedRejoinStep {
                    step: step.id.clone(),
                    previous: rule.previous.clone(),
                });
            }
        }

        let graph = Self::assemble(definition);
        graph.check_reachability()?;
        Ok(graph)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, RouteGraphError> {
        let definition: RouteDefinition = toml::from_str(source)?;
        Self::from_definition(definition)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RouteGraphError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| RouteGraphError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let graph = Self::from_toml_str(&source)?;
        tracing::info!(
            route_id = %graph.route_id,
            steps = graph.order.len(),
            path = %path.display(),
            "Route graph loaded"
        );
        Ok(graph)
    }

    /// Built-in route used when no graph file is configured.
    pub fn demo() -> Self {
        Self::assemble(demo_definition())
    }

    fn assemble(definition: RouteDefinition) -> Self {
        let order = definition.steps.iter().map(|s| s.id.clone()).collect();
        let steps = definition
            .steps
            .into_iter()
            .map(|step| (step.id.clone(), step))
            .collect();
        Self {
            route_id: definition.route_id,
            first_step: definition.first_step,
            associated_materials: definition.associated_materials.into_iter().collect(),
            steps,
            order,
        }
    }

    fn check_reachability(&self) -> Result<(), RouteGraphError> {
        let mut reached = HashSet::new();
        let mut frontier = VecDeque::from([&self.first_step]);
        while let Some(id) = frontier.pop_front() {
            if !reached.insert(id) {
                continue;
            }
            if let Some(step) = self.steps.get(id) {
                frontier.extend(step.successors());
            }
        }

        match self.order.iter().find(|id| !reached.contains(id)) {
            Some(unreachable) => Err(RouteGraphError::UnreachableStep(unreachable.clone())),
            None => Ok(()),
        }
    }

    pub fn route_id(&self) -> &RouteId {
        &self.route_id
    }

    pub fn is_material_valid(&self, material_id: &MaterialId) -> bool {
        self.associated_materials.contains(material_id)
    }

    pub fn step(&self, id: &RouteStepId) -> Option<&StepDefinition> {
        self.steps.get(id)
    }

    /// Steps in definition order.
    pub fn steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.order.iter().filter_map(|id| self.steps.get(id))
    }
}

impl RouteResolver for RouteGraph {
    fn route_id(&self) -> &RouteId {
        &self.route_id
    }

    fn first_step(&self) -> &RouteStepId {
        &self.first_step
    }

    fn next_on_pass(
        &self,
        current: &RouteStepId,
        previous: Option<&RouteStepId>,
    ) -> &[RouteStepId] {
        let Some(step) = self.steps.get(current) else {
            return &[];
        };
        previous
            .and_then(|prev| step.on_pass_from.iter().find(|rule| &rule.previous == prev))
            .map(|rule| rule.next.as_slice())
            .unwrap_or(step.on_pass.as_slice())
    }

    fn next_on_fail(&self, current: &RouteStepId) -> &[RouteStepId] {
        self.steps
            .get(current)
            .map(|step| step.on_fail.as_slice())
            .unwrap_or(&[])
    }

    fn next_on_abort(&self, current: &RouteStepId) -> &[RouteStepId] {
        self.steps
            .get(current)
            .map(|step| step.on_abort.as_slice())
            .unwrap_or(&[])
    }
}

/// Kit, assemble, test, pack. Failures go through rework, which sends a
/// unit back to whichever step it came from; a failed rework is scrapped.
pub fn demo_definition() -> RouteDefinition {
    let ids = |names: &[&str]| names.iter().map(|n| RouteStepId::from(*n)).collect::<Vec<_>>();

    let mut kit = StepDefinition::new("KIT");
    kit.on_pass = ids(&["ASSEMBLE"]);
    kit.on_abort = ids(&["KIT"]);

    let mut assemble = StepDefinition::new("ASSEMBLE");
    assemble.on_pass = ids(&["TEST"]);
    assemble.on_fail = ids(&["REWORK"]);
    assemble.on_abort = ids(&["ASSEMBLE"]);
    assemble.materials_to_assemble = ["M-CASE", "M-BOARD", "M-SCREW", "M-SCREW"]
        .into_iter()
        .map(MaterialId::from)
        .collect();
    assemble.incomplete_assembly_policy = Some(IncompleteAssemblyPolicy::Fail);

    let mut test = StepDefinition::new("TEST");
    test.on_pass = ids(&["PACKOUT"]);
    test.on_fail = ids(&["REWORK"]);
    test.on_abort = ids(&["TEST"]);

    let mut rework = StepDefinition::new("REWORK");
    rework.on_pass = ids(&["TEST"]);
    rework.on_pass_from = vec![RejoinRule {
        previous: RouteStepId::from("ASSEMBLE"),
        next: ids(&["ASSEMBLE"]),
    }];
    rework.on_fail = ids(&["SCRAP"]);
    rework.on_abort = ids(&["REWORK"]);

    RouteDefinition {
        route_id: RouteId::from("R-100"),
        first_step: RouteStepId::from("KIT"),
        associated_materials: ["M-UNIT", "M-CASE", "M-BOARD", "M-SCREW"]
            .into_iter()
            .map(MaterialId::from)
            .collect(),
        steps: vec![
            kit,
            assemble,
            test,
            rework,
            StepDefinition::new("PACKOUT"),
            StepDefinition::new("SCRAP"),
        ],
    }
}
