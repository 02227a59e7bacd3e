pub mod graph;
pub mod guard;
pub mod projection;
pub mod saga;

pub use graph::{RouteDefinition, RouteGraph, RouteGraphError, RouteResolver, StepDefinition};
pub use guard::OperationGuard;
pub use projection::WipState;
pub use saga::RoutingSagaState;
