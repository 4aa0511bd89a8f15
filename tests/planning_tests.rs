mod common;

use common::ScriptedBackend;

use conductor::config::{ContextConfig, PlanningConfig};
use conductor::error::ConductorError;
use conductor::planning::{backlog_from_plan, PlanningCoordinator};
use conductor::session::SessionBroker;

const ALL_SECTIONS: [&str; 6] = [
    "## Objectives",
    "## Scope",
    "## Components",
    "## Interfaces",
    "## Risks",
    "## Test Strategy",
];

/// Replies with exactly the sections the role's prompt demands.
fn role_player() -> ScriptedBackend {
    ScriptedBackend::with_reply(|prompt| {
        let mut doc = String::new();
        for marker in ALL_SECTIONS {
            if !prompt.contains(marker) {
                continue;
            }
            doc.push_str(marker);
            doc.push('\n');
            if marker == "## Scope" {
                doc.push_str("- t-001: Build the lexer (deps: none)\n");
                doc.push_str("- t-002: Build the parser (deps: t-001)\n");
            } else {
                doc.push_str("- covered\n");
            }
            doc.push('\n');
        }
        doc
    })
}

#[tokio::test]
async fn planning_produces_all_six_sections_and_a_backlog() {
    let backend = role_player();
    let broker = SessionBroker::new(backend.clone());
    let coordinator = PlanningCoordinator::new(&broker, PlanningConfig::default());

    let plan = coordinator.run_planning("build a small language").await.unwrap();

    for marker in ALL_SECTIONS {
        assert!(plan.contains(marker), "plan is missing {marker}");
    }
    assert_eq!(backend.open_sessions(), 0, "planning sessions must be gone");

    // Exactly three roles: three creates, three prompts.
    let prompts = backend.state.lock().prompts.clone();
    assert_eq!(prompts.len(), 3);

    let backlog = backlog_from_plan("trk-001", &plan, &ContextConfig::default(), 600).unwrap();
    assert_eq!(backlog.tasks.len(), 2);
    assert_eq!(backlog.tasks[1].dependencies, vec!["t-001".to_string()]);
}

#[tokio::test]
async fn role_without_its_sections_fails_the_phase() {
    // Every role replies with prose and no markers at all.
    let backend = ScriptedBackend::with_output("I have thoughts but no structure");
    let broker = SessionBroker::new(backend.clone());
    let coordinator = PlanningCoordinator::new(&broker, PlanningConfig::default());

    let err = coordinator.run_planning("anything").await.unwrap_err();
    assert!(matches!(err, ConductorError::PlanningRoleFailed { .. }));
    assert_eq!(backend.open_sessions(), 0, "teardown runs on failure too");
}
