// Integration tests for the routing runtime: release, queueing, the
// operation guard, assembly tracking and route resolution, driven through
// the message bus the way stations and operators drive it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use wip_routing::config::WipRoutingConfig;
use wip_routing::{Anomaly, Command, Event, Fault, MaterialId, Operation, RouteGraph, RouteId, RouteStepId, WipId, WipRuntime};

const SETTLE: Duration = Duration::from_secs(5);

fn start_demo() -> WipRuntime {
    WipRuntime::start(Arc::new(RouteGraph::demo()), &WipRoutingConfig::default())
}

fn operation(wip_id: &WipId, step: &str, material: &str) -> Operation {
    Operation::new(wip_id.clone(), step, format!("RES-{step}"), material)
}

fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn released(runtime: &WipRuntime) -> WipId {
    let wip_id = WipId::generate();
    runtime.release_to_route(&wip_id, &RouteId::from("R-100")).unwrap();
    runtime.wait_idle(SETTLE).await.unwrap();
    wip_id
}

async fn start_and_settle(runtime: &WipRuntime, operation: &Operation) {
    runtime.send(Command::StartWipAtOperation(operation.clone())).unwrap();
    runtime.wait_idle(SETTLE).await.unwrap();
}

async fn pass_and_settle(runtime: &WipRuntime, operation: &Operation) {
    runtime.publish(Event::OperationPassedAtRouteStep(operation.clone())).unwrap();
    runtime.wait_idle(SETTLE).await.unwrap();
}

async fn assemble_all(runtime: &WipRuntime, wip_id: &WipId) {
    for material in ["M-CASE", "M-BOARD", "M-SCREW", "M-SCREW"] {
        runtime
            .publish(Event::PartAssembled {
                wip_id: wip_id.clone(),
                material_id: MaterialId::from(material),
            })
            .unwrap();
        runtime.wait_idle(SETTLE).await.unwrap();
    }
}

fn queued(steps: &[&str]) -> std::collections::BTreeSet<RouteStepId> {
    steps.iter().map(|s| RouteStepId::from(*s)).collect()
}

#[tokio::test]
async fn test_release_enqueues_at_first_step() {
    let runtime = start_demo();
    let mut events = runtime.subscribe();
    let wip_id = released(&runtime).await;

    let state = runtime.wip_state(&wip_id).await.unwrap();
    assert_eq!(state.in_queue_route_steps, queued(&["KIT"]));
    assert!(!state.is_in_process());

    let routing = runtime.routing_state(&wip_id).await.unwrap();
    assert_eq!(routing.in_queue_route_steps, queued(&["KIT"]));

    let seen = drain(&mut events);
    assert!(seen.contains(&Event::WipEnqueuedAtRouteStep {
        wip_id: wip_id.clone(),
        route_step_id: RouteStepId::from("KIT"),
    }));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_start_then_pass_moves_unit_to_next_step() {
    let runtime = start_demo();
    let wip_id = released(&runtime).await;
    let kit = operation(&wip_id, "KIT", "M-UNIT");

    start_and_settle(&runtime, &kit).await;
    let state = runtime.wip_state(&wip_id).await.unwrap();
    assert_eq!(state.current_route_step_id, Some(RouteStepId::from("KIT")));
    assert!(state.in_queue_route_steps.is_empty());

    pass_and_settle(&runtime, &kit).await;
    let state = runtime.wip_state(&wip_id).await.unwrap();
    assert_eq!(state.current_route_step_id, None);
    assert_eq!(state.last_route_step_id, Some(RouteStepId::from("KIT")));
    assert_eq!(state.in_queue_route_steps, queued(&["ASSEMBLE"]));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_second_start_while_in_process_faults() {
    let runtime = start_demo();
    let wip_id = released(&runtime).await;
    start_and_settle(&runtime, &operation(&wip_id, "KIT", "M-UNIT")).await;

    let mut events = runtime.subscribe();
    start_and_settle(&runtime, &operation(&wip_id, "KIT", "M-UNIT")).await;

    let seen = drain(&mut events);
    assert_eq!(
        seen,
        vec![Event::Fault(Fault::OperationFailedToStartBecauseWipIsAlreadyInProcess {
            wip_id: wip_id.clone(),
            route_step_id: RouteStepId::from("KIT"),
            material_id: MaterialId::from("M-UNIT"),
        })]
    );
    assert_eq!(runtime.metrics().faults, 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_foreign_material_faults_and_leaves_unit_queued() {
    let runtime = start_demo();
    let wip_id = released(&runtime).await;
    let mut events = runtime.subscribe();

    start_and_settle(&runtime, &operation(&wip_id, "KIT", "M-FOREIGN")).await;

    let seen = drain(&mut events);
    assert!(matches!(
        seen.as_slice(),
        [Event::Fault(Fault::OperationFailedToStartBecauseMaterialIsNotValidForRoute { .. })]
    ));
    let state = runtime.wip_state(&wip_id).await.unwrap();
    assert!(!state.is_in_process());
    assert_eq!(state.in_queue_route_steps, queued(&["KIT"]));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_assembly_passes_when_all_parts_are_in() {
    let runtime = start_demo();
    let wip_id = released(&runtime).await;
    let kit = operation(&wip_id, "KIT", "M-UNIT");
    start_and_settle(&runtime, &kit).await;
    pass_and_settle(&runtime, &kit).await;

    let mut events = runtime.subscribe();
    start_and_settle(&runtime, &operation(&wip_id, "ASSEMBLE", "M-UNIT")).await;
    assemble_all(&runtime, &wip_id).await;

    let seen = drain(&mut events);
    assert!(seen.contains(&Event::OperationPassedAtRouteStep(operation(&wip_id, "ASSEMBLE", "M-UNIT"))));
    let tracker = runtime.assembly_state(&wip_id).await.unwrap();
    assert!(tracker.completed);
    assert!(tracker.materials_to_assemble.is_empty());
    assert_eq!(tracker.assembled_materials.len(), 4);

    let state = runtime.wip_state(&wip_id).await.unwrap();
    assert_eq!(state.in_queue_route_steps, queued(&["TEST"]));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_incomplete_assembly_fails_into_rework_and_rejoins() {
    let runtime = start_demo();
    let wip_id = released(&runtime).await;
    let kit = operation(&wip_id, "KIT", "M-UNIT");
    start_and_settle(&runtime, &kit).await;
    pass_and_settle(&runtime, &kit).await;

    let assemble = operation(&wip_id, "ASSEMBLE", "M-UNIT");
    start_and_settle(&runtime, &assemble).await;
    runtime
        .publish(Event::PartAssembled {
            wip_id: wip_id.clone(),
            material_id: MaterialId::from("M-CASE"),
        })
        .unwrap();
    runtime.wait_idle(SETTLE).await.unwrap();
    runtime.send(Command::CompleteAssemble(assemble.clone())).unwrap();
    runtime.wait_idle(SETTLE).await.unwrap();

    let state = runtime.wip_state(&wip_id).await.unwrap();
    assert_eq!(state.in_queue_route_steps, queued(&["REWORK"]));

    // Rework reached from assemble goes back to assemble, not to test.
    let rework = operation(&wip_id, "REWORK", "M-UNIT");
    start_and_settle(&runtime, &rework).await;
    pass_and_settle(&runtime, &rework).await;
    let state = runtime.wip_state(&wip_id).await.unwrap();
    assert_eq!(state.in_queue_route_steps, queued(&["ASSEMBLE"]));

    // The second visit opens a fresh tracker.
    start_and_settle(&runtime, &assemble).await;
    let tracker = runtime.assembly_state(&wip_id).await.unwrap();
    assert!(!tracker.completed);
    assert!(tracker.assembled_materials.is_empty());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_part_without_open_assembly_is_an_anomaly() {
    let runtime = start_demo();
    let wip_id = released(&runtime).await;
    let mut events = runtime.subscribe();

    runtime
        .publish(Event::PartAssembled {
            wip_id: wip_id.clone(),
            material_id: MaterialId::from("M-CASE"),
        })
        .unwrap();
    runtime.wait_idle(SETTLE).await.unwrap();

    let seen = drain(&mut events);
    assert!(seen.contains(&Event::Anomaly(Anomaly::UnexpectedPartAssembled {
        wip_id: wip_id.clone(),
        material_id: MaterialId::from("M-CASE"),
    })));
    assert_eq!(runtime.metrics().anomalies, 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_release_to_unknown_route_creates_no_saga() {
    let runtime = start_demo();
    let mut events = runtime.subscribe();
    let wip_id = WipId::generate();

    runtime.release_to_route(&wip_id, &RouteId::from("R-999")).unwrap();
    runtime.wait_idle(SETTLE).await.unwrap();

    assert!(runtime.routing_state(&wip_id).await.is_none());
    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(e, Event::Anomaly(Anomaly::UnknownRoute { .. }))));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_walk_to_packout_reaches_end_of_route() {
    let runtime = start_demo();
    let wip_id = released(&runtime).await;
    let mut events = runtime.subscribe();

    for step in ["KIT", "ASSEMBLE", "TEST", "PACKOUT"] {
        let op = operation(&wip_id, step, "M-UNIT");
        start_and_settle(&runtime, &op).await;
        if step == "ASSEMBLE" {
            assemble_all(&runtime, &wip_id).await;
        } else {
            pass_and_settle(&runtime, &op).await;
        }
    }

    let seen = drain(&mut events);
    assert!(seen.iter().any(|event| matches!(
        event,
        Event::WipReachedEndOfRoute { route_step_id, .. } if route_step_id.as_str() == "PACKOUT"
    )));
    let routing = runtime.routing_state(&wip_id).await.unwrap();
    assert!(routing.completed);
    assert!(routing.in_queue_route_steps.is_empty());

    // Late outcomes for a finished unit change nothing.
    let before = runtime.routing_state(&wip_id).await;
    pass_and_settle(&runtime, &operation(&wip_id, "PACKOUT", "M-UNIT")).await;
    assert_eq!(runtime.routing_state(&wip_id).await, before);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_units_are_routed_independently() {
    let runtime = start_demo();
    let first = released(&runtime).await;
    let second = released(&runtime).await;

    let kit = operation(&first, "KIT", "M-UNIT");
    start_and_settle(&runtime, &kit).await;
    pass_and_settle(&runtime, &kit).await;

    assert_eq!(runtime.wip_state(&first).await.unwrap().in_queue_route_steps, queued(&["ASSEMBLE"]));
    assert_eq!(runtime.wip_state(&second).await.unwrap().in_queue_route_steps, queued(&["KIT"]));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_outcome_does_not_move_a_unit_in_process() {
    let runtime = start_demo();
    let wip_id = released(&runtime).await;
    let kit = operation(&wip_id, "KIT", "M-UNIT");
    start_and_settle(&runtime, &kit).await;
    pass_and_settle(&runtime, &kit).await;
    start_and_settle(&runtime, &operation(&wip_id, "ASSEMBLE", "M-UNIT")).await;
    let mut events = runtime.subscribe();

    pass_and_settle(&runtime, &kit).await;

    let state = runtime.wip_state(&wip_id).await.unwrap();
    assert_eq!(state.current_route_step_id, Some(RouteStepId::from("ASSEMBLE")));
    assert_eq!(state.last_route_step_id, Some(RouteStepId::from("KIT")));
    assert!(state.in_queue_route_steps.is_empty());
    let routing = runtime.routing_state(&wip_id).await.unwrap();
    assert_eq!(routing.current_route_step_id, Some(RouteStepId::from("ASSEMBLE")));
    assert!(routing.in_queue_route_steps.is_empty());

    let seen = drain(&mut events);
    assert_eq!(
        seen,
        vec![
            Event::OperationPassedAtRouteStep(kit.clone()),
            Event::Anomaly(Anomaly::StaleOutcome {
                wip_id: wip_id.clone(),
                route_step_id: RouteStepId::from("KIT"),
            }),
        ]
    );

    // Still in process, so the next start is refused.
    start_and_settle(&runtime, &operation(&wip_id, "TEST", "M-UNIT")).await;
    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        Event::Fault(Fault::OperationFailedToStartBecauseWipIsAlreadyInProcess { .. })
    )));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_start_leaves_queues_alone() {
    let runtime = start_demo();
    let wip_id = released(&runtime).await;
    let kit = operation(&wip_id, "KIT", "M-UNIT");
    start_and_settle(&runtime, &kit).await;
    pass_and_settle(&runtime, &kit).await;
    let mut events = runtime.subscribe();

    runtime.publish(Event::OperationStartedAtRouteStep(kit.clone())).unwrap();
    runtime.wait_idle(SETTLE).await.unwrap();

    let state = runtime.wip_state(&wip_id).await.unwrap();
    assert!(!state.is_in_process());
    assert_eq!(state.in_queue_route_steps, queued(&["ASSEMBLE"]));
    let routing = runtime.routing_state(&wip_id).await.unwrap();
    assert_eq!(routing.current_route_step_id, None);
    assert_eq!(routing.previous_route_step_id, Some(RouteStepId::from("KIT")));
    assert_eq!(routing.in_queue_route_steps, queued(&["ASSEMBLE"]));
    assert!(drain(&mut events).contains(&Event::Anomaly(Anomaly::DuplicateStart {
        wip_id: wip_id.clone(),
        route_step_id: RouteStepId::from("KIT"),
    })));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_late_outcome_after_end_of_route_is_stale() {
    let runtime = start_demo();
    let wip_id = released(&runtime).await;
    let kit = operation(&wip_id, "KIT", "M-UNIT");
    start_and_settle(&runtime, &kit).await;
    runtime.publish(Event::OperationFailedAtRouteStep(kit.clone())).unwrap();
    runtime.wait_idle(SETTLE).await.unwrap();
    let mut events = runtime.subscribe();

    runtime.publish(Event::OperationFailedAtRouteStep(kit.clone())).unwrap();
    runtime.wait_idle(SETTLE).await.unwrap();

    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        Event::Anomaly(Anomaly::StaleOutcome { route_step_id, .. }) if route_step_id.as_str() == "KIT"
    )));
    assert_eq!(runtime.metrics().anomalies, 1);
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_admit_exactly_one() {
    let runtime = start_demo();
    let wip_id = released(&runtime).await;
    let mut events = runtime.subscribe();
    let kit = operation(&wip_id, "KIT", "M-UNIT");

    runtime.send(Command::StartWipAtOperation(kit.clone())).unwrap();
    runtime.send(Command::StartWipAtOperation(kit.clone())).unwrap();
    runtime.wait_idle(SETTLE).await.unwrap();

    let seen = drain(&mut events);
    let started = seen
        .iter()
        .filter(|event| matches!(event, Event::OperationStartedAtRouteStep(_)))
        .count();
    let refused = seen
        .iter()
        .filter(|event| {
            matches!(
                event,
                Event::Fault(Fault::OperationFailedToStartBecauseWipIsAlreadyInProcess { .. })
            )
        })
        .count();
    assert_eq!(started, 1);
    assert_eq!(refused, 1);
    assert_eq!(runtime.metrics().anomalies, 0);
    let state = runtime.wip_state(&wip_id).await.unwrap();
    assert_eq!(state.current_route_step_id, Some(RouteStepId::from("KIT")));
    runtime.shutdown().await;
}
