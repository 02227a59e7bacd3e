// WIP Routing Library - saga-driven routing of manufacturing work-in-process
// This exposes the core components for testing and integration

pub mod assembly;
pub mod broadcast;
pub mod cli;
pub mod config;
pub mod ids;
pub mod messages;
pub mod observability;
pub mod routing;
pub mod runtime;
pub mod saga;
pub mod stage;
pub mod telemetry;

// Re-export key types for easy access
pub use assembly::{AssembleState, IncompleteAssemblyPolicy};
pub use broadcast::{spawn_viewer_forwarder, JsonLinesSink, ViewerNotification, ViewerSink};
pub use config::WipRoutingConfig;
pub use ids::{MaterialId, ResourceId, RouteId, RouteStepId, WipId};
pub use messages::{Anomaly, Command, Continuation, Effect, Event, Fault, Message, Operation, OperationOutcome};
pub use observability::{RuntimeMetrics, RuntimeStats};
pub use routing::{OperationGuard, RouteGraph, RouteResolver, RoutingSagaState, WipState};
pub use runtime::{RuntimeError, WipRuntime};
pub use saga::{SagaState, Transition};
pub use stage::{SimulatedOutcome, StagePhase, StageSimulator};
pub use telemetry::{init_telemetry, shutdown_telemetry};
