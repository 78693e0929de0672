#![allow(clippy::unwrap_used)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{ScriptedCapability, navigator, review, review_with, tasker};
use tandem::capability::Capability;
use tandem::model::{Context, ReviewDecision, Role, StructuredOutput, Task, TaskId};
use tandem::navigator::Navigator;
use tandem::pair::{
    AuditTrail, ExhaustionPolicy, IterationSink, MAX_ITERATIONS_REASON, PairError, PairSettings, TaskPair, Tasker,
};

fn draft() -> StructuredOutput {
    StructuredOutput::default().with_summary("draft")
}

fn task() -> Task {
    Task::new(TaskId::new("t-1"), Role::Developer, "Write the thing")
}

fn run(cap: ScriptedCapability, settings: PairSettings, max: u32) -> (Arc<ScriptedCapability>, tandem::model::TaskPairResult) {
    let cap = Arc::new(cap);
    let dyn_cap = Arc::clone(&cap) as Arc<dyn Capability>;
    let result = TaskPair::new(settings)
        .run(
            &Tasker::new(Role::Developer, Arc::clone(&dyn_cap)),
            &Navigator::new(Role::Developer, dyn_cap),
            task(),
            &Context::new(),
            max,
        )
        .unwrap();
    (cap, result)
}

#[test]
fn never_approving_navigator_stops_at_the_ceiling() {
    let cap = ScriptedCapability::new()
        .always(tasker(Role::Developer), draft())
        .always(navigator(Role::Developer), review(4));
    let (cap, result) = run(cap, PairSettings::default(), 4);

    assert!(!result.success);
    assert_eq!(result.iterations.len(), 4);
    assert_eq!(result.failure_reason.as_deref(), Some(MAX_ITERATIONS_REASON));
    assert!(result.final_output.is_none());
    assert_eq!(cap.calls(tasker(Role::Developer)), 4);
    assert!(
        result
            .iterations
            .iter()
            .all(|it| it.decision() == ReviewDecision::NeedsChanges)
    );
}

#[test]
fn rejection_ends_the_pair_immediately() {
    let rejecting = review(9).with_data("constraint_violation", json!("deletes the legal notice"));
    let cap = ScriptedCapability::new()
        .always(tasker(Role::Developer), draft())
        .always(navigator(Role::Developer), rejecting);
    let (cap, result) = run(cap, PairSettings::default(), 5);

    assert!(!result.success);
    assert_eq!(result.iterations.len(), 1);
    let reason = result.failure_reason.unwrap();
    assert!(reason.starts_with("Navigator rejected"), "{reason}");
    assert_eq!(cap.calls(tasker(Role::Developer)), 1);
}

#[test]
fn reviewer_error_is_a_rejection() {
    let cap = ScriptedCapability::new()
        .always(tasker(Role::Developer), draft())
        .sequence(navigator(Role::Developer), vec![Err("review service down".into())]);
    let (_, result) = run(cap, PairSettings::default(), 3);

    assert!(!result.success);
    assert_eq!(result.iterations.len(), 1);
    let fb = &result.iterations[0].navigator_feedback;
    assert_eq!(fb.decision, ReviewDecision::Rejected);
    assert_eq!(fb.quality_score, 0);
    assert!(fb.overall_assessment.contains("review service down"));
}

#[test]
fn approval_short_circuits_remaining_iterations() {
    let cap = ScriptedCapability::new()
        .always(tasker(Role::Developer), draft())
        .sequence(navigator(Role::Developer), vec![Ok(review(5)), Ok(review(9))]);
    let (cap, result) = run(cap, PairSettings::default(), 5);

    assert!(result.success);
    assert!(!result.provisional);
    assert_eq!(result.iterations.len(), 2);
    assert_eq!(result.final_output, Some(draft()));
    assert_eq!(cap.calls(tasker(Role::Developer)), 2);
    assert_eq!(cap.calls(navigator(Role::Developer)), 2);
}

#[test]
fn leniency_lets_a_steady_score_through_later() {
    let cap = ScriptedCapability::new()
        .always(tasker(Role::Developer), draft())
        .always(navigator(Role::Developer), review(7));
    let (_, result) = run(cap, PairSettings::default(), 5);

    assert!(result.success);
    assert_eq!(result.iterations.len(), 3);
    let decisions: Vec<_> = result.iterations.iter().map(|it| it.decision()).collect();
    assert_eq!(
        decisions,
        vec![ReviewDecision::NeedsChanges, ReviewDecision::NeedsChanges, ReviewDecision::Approved]
    );
}

#[test]
fn major_issue_blocks_until_lenient() {
    let issue = json!([{ "severity": "major", "dimension": "clarity", "description": "wordy" }]);
    let cap = ScriptedCapability::new()
        .always(tasker(Role::Developer), draft())
        .always(navigator(Role::Developer), review_with(10, issue));
    let (_, result) = run(cap, PairSettings::default(), 5);

    assert!(result.success);
    assert_eq!(result.iterations.len(), 3);
    let last = &result.iterations[2].navigator_feedback;
    assert!(last.required_changes.is_empty());
}

#[test]
fn history_grows_by_one_each_iteration() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = Arc::clone(&seen);
    let cap = ScriptedCapability::new()
        .on(tasker(Role::Developer), move |_, task, ctx| {
            seen_in
                .lock()
                .unwrap()
                .push((ctx.history.len(), task.description.clone()));
            Ok(draft())
        })
        .always(navigator(Role::Developer), review(3));
    let (_, result) = run(cap, PairSettings::default(), 3);

    let numbers: Vec<u32> = result.iterations.iter().map(|it| it.iteration_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    let seen = seen.lock().unwrap();
    let lens: Vec<usize> = seen.iter().map(|(n, _)| *n).collect();
    assert_eq!(lens, vec![0, 1, 2]);
    assert!(!seen[0].1.contains("--- Review of iteration"));
    assert!(seen[1].1.contains("--- Review of iteration 1"));
    assert!(seen[2].1.contains("--- Review of iteration 2"));
}

#[test]
fn tasker_failure_is_reviewed_not_fatal() {
    let cap = ScriptedCapability::new()
        .sequence(tasker(Role::Developer), vec![Err("model overloaded".into()), Ok(draft())])
        .always(navigator(Role::Developer), review(9));
    let (cap, result) = run(cap, PairSettings::default(), 3);

    assert!(result.success);
    assert_eq!(result.iterations.len(), 2);
    let first = &result.iterations[0];
    assert!(first.tasker_output.failed);
    assert_eq!(first.decision(), ReviewDecision::NeedsChanges);
    assert!(first.navigator_feedback.critical_issues[0].contains("model overloaded"));
    // The review capability is not consulted for a failed generation.
    assert_eq!(cap.calls(navigator(Role::Developer)), 1);
}

#[test]
fn slow_tasker_times_out_into_a_failed_output() {
    let cap = ScriptedCapability::new()
        .on(tasker(Role::Developer), |_, _, _| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(draft())
        })
        .always(navigator(Role::Developer), review(9));
    let settings = PairSettings {
        tasker_timeout: Some(Duration::from_millis(20)),
        ..PairSettings::default()
    };
    let (_, result) = run(cap, settings, 1);

    assert!(!result.success);
    let output = &result.iterations[0].tasker_output;
    assert!(output.failed);
    assert!(output.error.as_deref().unwrap().contains("timed out"));
}

#[test]
fn slow_reviewer_times_out_into_a_rejection() {
    let cap = ScriptedCapability::new()
        .always(tasker(Role::Developer), draft())
        .on(navigator(Role::Developer), |_, _, _| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(review(10))
        });
    let settings = PairSettings {
        navigator_timeout: Some(Duration::from_millis(20)),
        ..PairSettings::default()
    };
    let (cap, result) = run(cap, settings, 3);

    assert!(!result.success);
    assert_eq!(result.iterations.len(), 1);
    let fb = &result.iterations[0].navigator_feedback;
    assert_eq!(fb.decision, ReviewDecision::Rejected);
    assert_eq!(fb.quality_score, 0);
    assert!(fb.overall_assessment.contains("timed out"), "{}", fb.overall_assessment);
    assert_eq!(cap.calls(tasker(Role::Developer)), 1);
}

#[test]
fn provisional_policy_keeps_the_last_output() {
    let cap = ScriptedCapability::new()
        .always(tasker(Role::Developer), draft())
        .always(navigator(Role::Developer), review(2));
    let settings = PairSettings {
        on_exhaustion: ExhaustionPolicy::Provisional,
        ..PairSettings::default()
    };
    let (_, result) = run(cap, settings, 2);

    assert!(result.success);
    assert!(result.provisional);
    assert_eq!(result.final_output, Some(draft()));
    assert_eq!(result.iterations.len(), 2);
}

#[test]
fn every_iteration_reaches_the_audit_trail() {
    let cap: Arc<dyn Capability> = Arc::new(
        ScriptedCapability::new()
            .always(tasker(Role::Developer), draft())
            .sequence(navigator(Role::Developer), vec![Ok(review(3)), Ok(review(9))]),
    );
    let trail = Arc::new(AuditTrail::new());
    let result = TaskPair::new(PairSettings::default())
        .with_sink(Arc::clone(&trail) as Arc<dyn IterationSink>)
        .run(
            &Tasker::new(Role::Developer, Arc::clone(&cap)),
            &Navigator::new(Role::Developer, cap),
            task(),
            &Context::new(),
            3,
        )
        .unwrap();

    assert_eq!(trail.iterations(&TaskId::new("t-1")), result.iterations);
}

#[test]
fn zero_iterations_is_an_input_error() {
    let cap: Arc<dyn Capability> = Arc::new(ScriptedCapability::new());
    let err = TaskPair::new(PairSettings::default())
        .run(
            &Tasker::new(Role::Developer, Arc::clone(&cap)),
            &Navigator::new(Role::Developer, cap),
            task(),
            &Context::new(),
            0,
        )
        .unwrap_err();
    assert_eq!(err, PairError::NoIterations);
}

#[test]
fn mismatched_roles_are_refused() {
    let cap: Arc<dyn Capability> = Arc::new(ScriptedCapability::new());
    let err = TaskPair::new(PairSettings::default())
        .run(
            &Tasker::new(Role::Tester, Arc::clone(&cap)),
            &Navigator::new(Role::Developer, cap),
            task(),
            &Context::new(),
            3,
        )
        .unwrap_err();
    assert!(matches!(err, PairError::RoleMismatch { .. }));
}
