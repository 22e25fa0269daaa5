use std::sync::Arc;
use std::time::Duration;

use appvisor::core::types::{ErrorReport, FixStatus};
use appvisor::error::OrchestratorError;
use appvisor::events::{EventBus, FixProgressStatus, RuntimeEvent};
use appvisor::fix::{AutoFixer, FixOptions};
use appvisor::test_support::{
    ScriptedAgent, ScriptedFixTarget, ScriptedResponse, report_with_build_errors, wait_until,
};

const WRITE_APP: &str = r#"Fixed the import.
<app-write path="src/App.tsx">
export default function App() { return null; }
</app-write>"#;

fn fixer(attempt_timeout: Duration) -> (AutoFixer, EventBus) {
    let bus = EventBus::new(256);
    let fixer = AutoFixer::new(
        FixOptions {
            max_attempts: 2,
            attempt_timeout,
        },
        bus.clone(),
    );
    (fixer, bus)
}

fn broken() -> ErrorReport {
    report_with_build_errors(&[("src/App.tsx", 10, "Cannot find module 'uuid'")])
}

#[tokio::test]
async fn stops_after_two_attempts_when_errors_persist() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, _bus) = fixer(Duration::from_secs(5));
    let agent = ScriptedAgent::replies(&[WRITE_APP, WRITE_APP, WRITE_APP]);
    let target = ScriptedFixTarget::new(temp.path(), vec![broken(), broken(), ErrorReport::empty()]);

    let outcome = fixer
        .auto_fix("a", broken(), &agent, &target)
        .await
        .expect("outcome");

    assert_eq!(outcome.status, FixStatus::Exhausted);
    assert_eq!(agent.calls(), 2);
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(outcome.last_attempt_number(), 2);
    let remaining = outcome.remaining.expect("remaining report");
    assert_eq!(remaining.build_errors.len(), 1);
    assert!(!fixer.is_running("a"));
}

#[tokio::test]
async fn residual_errors_feed_the_next_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, _bus) = fixer(Duration::from_secs(5));
    let agent = ScriptedAgent::replies(&[WRITE_APP, WRITE_APP]);
    let residual = report_with_build_errors(&[("src/App.tsx", 3, "Unexpected token")]);
    let target = ScriptedFixTarget::new(temp.path(), vec![residual, ErrorReport::empty()]);

    let outcome = fixer
        .auto_fix("a", broken(), &agent, &target)
        .await
        .expect("outcome");

    assert_eq!(outcome.status, FixStatus::Fixed);
    assert_eq!(outcome.last_attempt_number(), 2);
    let first = outcome.attempts[0]
        .resulting_error_report
        .as_ref()
        .expect("first attempt report");
    assert_eq!(first.build_errors.len(), 1);
    assert!(outcome.attempts[0].error.is_none());
    let second_prompt = &agent.prompts()[1];
    assert!(second_prompt.contains("Unexpected token"), "{second_prompt}");
    assert!(!second_prompt.contains("Cannot find module"), "{second_prompt}");
}

#[tokio::test]
async fn replies_without_edits_leave_the_errors_standing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, _bus) = fixer(Duration::from_secs(5));
    let agent = ScriptedAgent::replies(&["I could not find the problem.", "Still nothing."]);
    // A running app with no new output would otherwise look clean.
    let target = ScriptedFixTarget::new(temp.path(), Vec::new());

    let outcome = fixer
        .auto_fix("a", broken(), &agent, &target)
        .await
        .expect("outcome");

    assert_eq!(outcome.status, FixStatus::Exhausted);
    assert_eq!(agent.calls(), 2);
    assert_eq!(target.restarts(), 0);
    for attempt in &outcome.attempts {
        assert!(attempt.applied_edits.is_empty());
        let error = attempt.error.as_deref().expect("attempt error");
        assert!(error.contains("no edits"), "{error}");
        let report = attempt.resulting_error_report.as_ref().expect("report");
        assert!(report.has_errors);
    }
    let remaining = outcome.remaining.expect("remaining report");
    assert_eq!(remaining.build_errors.len(), 1);
    assert!(agent.prompts()[1].contains("Cannot find module 'uuid'"));
}

#[tokio::test]
async fn an_empty_reply_still_verifies_a_stopped_app() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, _bus) = fixer(Duration::from_secs(5));
    let agent = ScriptedAgent::replies(&["Restarting should be enough."]);
    let target = ScriptedFixTarget::new(temp.path(), vec![ErrorReport::empty()]);
    target.set_running(false);

    let outcome = fixer
        .auto_fix("a", broken(), &agent, &target)
        .await
        .expect("outcome");

    assert_eq!(outcome.status, FixStatus::Fixed);
    assert_eq!(target.restarts(), 1);
}

#[tokio::test]
async fn first_clean_report_ends_the_loop() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, _bus) = fixer(Duration::from_secs(5));
    let agent = ScriptedAgent::replies(&[WRITE_APP]);
    let target = ScriptedFixTarget::new(temp.path(), vec![ErrorReport::empty()]);

    let outcome = fixer
        .auto_fix("a", broken(), &agent, &target)
        .await
        .expect("outcome");

    assert_eq!(outcome.status, FixStatus::Fixed);
    assert_eq!(outcome.attempts.len(), 1);
    assert!(outcome.remaining.is_none());
    assert_eq!(outcome.attempts[0].applied_edits.len(), 1);
    let written = std::fs::read_to_string(temp.path().join("src/App.tsx")).expect("written");
    assert_eq!(written, "export default function App() { return null; }\n");
    assert_eq!(target.restarts(), 0);

    let prompt = &agent.prompts()[0];
    assert!(prompt.contains("src/App.tsx:10:1: Cannot find module 'uuid'"));
}

#[tokio::test]
async fn empty_report_never_calls_the_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, _bus) = fixer(Duration::from_secs(5));
    let agent = ScriptedAgent::replies(&[WRITE_APP]);
    let target = ScriptedFixTarget::new(temp.path(), Vec::new());

    let outcome = fixer
        .auto_fix("a", ErrorReport::empty(), &agent, &target)
        .await
        .expect("outcome");

    assert_eq!(outcome.status, FixStatus::Fixed);
    assert!(outcome.attempts.is_empty());
    assert_eq!(agent.calls(), 0);
}

#[tokio::test]
async fn second_loop_for_the_same_app_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, _bus) = fixer(Duration::from_secs(5));
    let agent = Arc::new(ScriptedAgent::replies(&[WRITE_APP]).with_delay(Duration::from_millis(300)));
    let target = Arc::new(ScriptedFixTarget::new(temp.path(), vec![ErrorReport::empty()]));

    let first = {
        let (fixer, agent, target) = (fixer.clone(), agent.clone(), target.clone());
        tokio::spawn(async move {
            fixer
                .auto_fix("a", broken(), agent.as_ref(), target.as_ref())
                .await
        })
    };
    assert!(wait_until(Duration::from_secs(2), || fixer.is_running("a")).await);

    let second = fixer
        .auto_fix("a", broken(), agent.as_ref(), target.as_ref())
        .await;
    assert!(matches!(second, Err(OrchestratorError::FixInProgress(_))));

    // Other apps are independent.
    let other = fixer
        .auto_fix("b", ErrorReport::empty(), agent.as_ref(), target.as_ref())
        .await
        .expect("other app");
    assert_eq!(other.status, FixStatus::Fixed);

    let first = first.await.expect("join").expect("first outcome");
    assert_eq!(first.status, FixStatus::Fixed);
    assert_eq!(agent.calls(), 1);
    assert!(!fixer.is_running("a"));
}

#[tokio::test]
async fn cancellation_discards_the_in_flight_response() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, _bus) = fixer(Duration::from_secs(5));
    let agent = Arc::new(ScriptedAgent::replies(&[WRITE_APP]).with_delay(Duration::from_millis(300)));
    let target = Arc::new(ScriptedFixTarget::new(temp.path(), Vec::new()));

    let running = {
        let (fixer, agent, target) = (fixer.clone(), agent.clone(), target.clone());
        tokio::spawn(async move {
            fixer
                .auto_fix("a", broken(), agent.as_ref(), target.as_ref())
                .await
        })
    };
    assert!(wait_until(Duration::from_secs(2), || agent.calls() == 1).await);
    assert!(fixer.cancel("a"));

    let outcome = running.await.expect("join").expect("outcome");

    assert_eq!(outcome.status, FixStatus::Cancelled);
    assert_eq!(outcome.attempts.len(), 1);
    assert!(outcome.attempts[0].applied_edits.is_empty());
    assert!(outcome.remaining.is_some());
    assert!(!temp.path().join("src/App.tsx").exists());
    assert!(!fixer.cancel("a"));
}

#[tokio::test]
async fn agent_failure_consumes_an_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, _bus) = fixer(Duration::from_secs(5));
    let agent = ScriptedAgent::new(vec![
        ScriptedResponse::Fail("model overloaded".to_string()),
        ScriptedResponse::Reply(WRITE_APP.to_string()),
    ]);
    let target = ScriptedFixTarget::new(temp.path(), vec![ErrorReport::empty()]);

    let outcome = fixer
        .auto_fix("a", broken(), &agent, &target)
        .await
        .expect("outcome");

    assert_eq!(outcome.status, FixStatus::Fixed);
    assert_eq!(outcome.attempts.len(), 2);
    let first_error = outcome.attempts[0].error.as_deref().expect("first error");
    assert!(first_error.contains("model overloaded"), "{first_error}");
    assert!(outcome.attempts[0].response.is_none());
    assert!(outcome.attempts[1].error.is_none());
}

#[tokio::test]
async fn edits_outside_the_project_fail_the_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, _bus) = fixer(Duration::from_secs(5));
    let escape = r#"<app-write path="../outside.txt">nope</app-write>"#;
    let agent = ScriptedAgent::replies(&[escape, escape]);
    let target = ScriptedFixTarget::new(temp.path(), Vec::new());

    let outcome = fixer
        .auto_fix("a", broken(), &agent, &target)
        .await
        .expect("outcome");

    assert_eq!(outcome.status, FixStatus::Exhausted);
    for attempt in &outcome.attempts {
        let error = attempt.error.as_deref().expect("attempt error");
        assert!(error.contains("escapes the project root"), "{error}");
    }
    assert!(!temp.path().join("../outside.txt").exists());
}

#[tokio::test]
async fn dependency_additions_install_and_restart() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, _bus) = fixer(Duration::from_secs(5));
    let agent = ScriptedAgent::replies(&[
        r#"<app-add-dependency packages="uuid @types/uuid"></app-add-dependency>"#,
    ]);
    let target = ScriptedFixTarget::new(temp.path(), vec![ErrorReport::empty()]);

    let outcome = fixer
        .auto_fix("a", broken(), &agent, &target)
        .await
        .expect("outcome");

    assert_eq!(outcome.status, FixStatus::Fixed);
    assert_eq!(
        target.installs(),
        vec![vec!["uuid".to_string(), "@types/uuid".to_string()]]
    );
    assert_eq!(target.restarts(), 1);
}

#[tokio::test]
async fn stopped_app_is_restarted_before_verification() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, _bus) = fixer(Duration::from_secs(5));
    let agent = ScriptedAgent::replies(&[WRITE_APP]);
    let target = ScriptedFixTarget::new(temp.path(), vec![ErrorReport::empty()]);
    target.set_running(false);

    fixer
        .auto_fix("a", broken(), &agent, &target)
        .await
        .expect("outcome");

    assert_eq!(target.restarts(), 1);
}

#[tokio::test]
async fn hung_agent_hits_the_attempt_ceiling() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, _bus) = fixer(Duration::from_millis(100));
    let agent = ScriptedAgent::replies(&[WRITE_APP, WRITE_APP]).with_delay(Duration::from_secs(5));
    let target = ScriptedFixTarget::new(temp.path(), Vec::new());

    let outcome = fixer
        .auto_fix("a", broken(), &agent, &target)
        .await
        .expect("outcome");

    assert_eq!(outcome.status, FixStatus::Exhausted);
    assert_eq!(agent.calls(), 2);
    assert!(
        outcome
            .attempts
            .iter()
            .all(|a| a.error.as_deref().is_some_and(|e| e.contains("timed out")))
    );
}

#[tokio::test]
async fn progress_is_published_per_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (fixer, bus) = fixer(Duration::from_secs(5));
    let mut rx = bus.subscribe();
    let agent = ScriptedAgent::replies(&[WRITE_APP]);
    let target = ScriptedFixTarget::new(temp.path(), vec![ErrorReport::empty()]);

    fixer
        .auto_fix("a", broken(), &agent, &target)
        .await
        .expect("outcome");

    let mut phases = Vec::new();
    while let Ok(RuntimeEvent::FixProgress { attempt, status, .. }) = rx.try_recv() {
        phases.push((attempt, status));
    }
    assert_eq!(
        phases,
        vec![
            (1, FixProgressStatus::Prompting),
            (1, FixProgressStatus::Applying { edits: 1 }),
            (1, FixProgressStatus::Verifying),
            (
                1,
                FixProgressStatus::Finished {
                    status: FixStatus::Fixed
                }
            ),
        ]
    );
}
