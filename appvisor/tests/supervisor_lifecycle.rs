#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use appvisor::core::types::AppState;
use appvisor::detector::{DetectorOptions, ErrorDetector};
use appvisor::error::OrchestratorError;
use appvisor::events::{EventBus, RuntimeEvent};
use appvisor::io::config::AppvisorConfig;
use appvisor::supervisor::Supervisor;
use appvisor::test_support::{TestApp, wait_until};
use tokio::sync::broadcast;

const READY_SERVER: &str = r#"echo "booting $APPVISOR_APP_ID"
echo "  ready on http://127.0.0.1:4999"
while true; do sleep 1; done
"#;

fn supervisor(cfg: AppvisorConfig) -> (Supervisor, ErrorDetector, EventBus) {
    let cfg = Arc::new(cfg);
    let bus = EventBus::default();
    let detector = ErrorDetector::new(
        cfg.classifier().expect("classifier"),
        bus.clone(),
        DetectorOptions::from_config(&cfg),
    );
    let supervisor = Supervisor::new(cfg, detector.clone(), bus.clone()).expect("supervisor");
    (supervisor, detector, bus)
}

fn drain(rx: &mut broadcast::Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn states(events: &[RuntimeEvent]) -> Vec<AppState> {
    events
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn run_waits_for_ready_line_and_fronts_server_with_proxy() {
    let app = TestApp::new("demo", READY_SERVER).expect("app");
    let (supervisor, detector, bus) = supervisor(app.config().expect("config"));
    let mut rx = bus.subscribe();

    let url = supervisor.run(&app.spec).await.expect("run");

    let handle = supervisor.status("demo");
    assert_eq!(handle.state, AppState::Running);
    assert!(handle.pid.is_some());
    assert_eq!(handle.original_url.as_deref(), Some("http://127.0.0.1:4999"));
    assert_eq!(handle.proxy_url.as_deref(), Some(url.as_str()));
    assert!(url.starts_with("http://localhost:"), "{url}");

    let events = drain(&mut rx);
    assert_eq!(states(&events), vec![AppState::Starting, AppState::Starting, AppState::Running]);
    assert!(events.iter().any(|e| matches!(
        e,
        RuntimeEvent::ProxyReady { proxy_url, original_url, .. }
            if *proxy_url == url && original_url == "http://127.0.0.1:4999"
    )));
    let logs: Vec<String> = detector.logs("demo").into_iter().map(|r| r.message).collect();
    assert_eq!(logs[0], "booting demo");

    supervisor.stop("demo").await.expect("stop");
}

#[tokio::test]
async fn run_is_idempotent_while_running() {
    let app = TestApp::new("demo", READY_SERVER).expect("app");
    let (supervisor, _detector, _bus) = supervisor(app.config().expect("config"));

    let first = supervisor.run(&app.spec).await.expect("first run");
    let pid = supervisor.status("demo").pid;
    let second = supervisor.run(&app.spec).await.expect("second run");

    assert_eq!(first, second);
    assert_eq!(supervisor.status("demo").pid, pid);
    supervisor.stop("demo").await.expect("stop");
}

#[tokio::test]
async fn stop_then_run_gets_a_fresh_process_and_proxy() {
    let app = TestApp::new("demo", READY_SERVER).expect("app");
    let (supervisor, _detector, _bus) = supervisor(app.config().expect("config"));

    let first_url = supervisor.run(&app.spec).await.expect("run");
    let first_pid = supervisor.status("demo").pid;

    let stopped = supervisor.stop("demo").await.expect("stop");
    assert_eq!(stopped.state, AppState::Stopped);
    assert_eq!(stopped.pid, None);
    assert_eq!(stopped.proxy_url, None);

    let second_url = supervisor.run(&app.spec).await.expect("rerun");
    assert_ne!(supervisor.status("demo").pid, first_pid);
    assert_ne!(second_url, first_url);
    supervisor.stop("demo").await.expect("stop again");
}

#[tokio::test]
async fn exit_before_ready_fails_with_exit_code_and_tail() {
    let script = "echo 'src/App.tsx:3:1: Unexpected token' >&2\nexit 2\n";
    let app = TestApp::new("demo", script).expect("app");
    let (supervisor, detector, _bus) = supervisor(app.config().expect("config"));

    let err = supervisor.run(&app.spec).await.expect_err("crash");

    match err {
        OrchestratorError::ProcessCrashed { exit_code, tail } => {
            assert_eq!(exit_code, Some(2));
            assert!(tail.iter().any(|l| l.contains("Unexpected token")), "{tail:?}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(supervisor.status("demo").state, AppState::Crashed);
    assert_eq!(detector.report("demo").build_errors.len(), 1);

    // Crashed apps may be started again.
    assert!(matches!(
        supervisor.run(&app.spec).await,
        Err(OrchestratorError::ProcessCrashed { .. })
    ));
}

#[tokio::test]
async fn exit_after_ready_is_published_as_a_crash() {
    let script = "echo 'ready on http://127.0.0.1:4999'\nsleep 0.3\necho 'fatal: out of memory' >&2\nexit 3\n";
    let app = TestApp::new("demo", script).expect("app");
    let (supervisor, detector, bus) = supervisor(app.config().expect("config"));
    let mut rx = bus.subscribe();

    supervisor.run(&app.spec).await.expect("run");
    let crashed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(RuntimeEvent::StateChanged {
                state: AppState::Crashed,
                exit_code,
                ..
            }) = rx.recv().await
            {
                return exit_code;
            }
        }
    })
    .await
    .expect("crash event");

    assert_eq!(crashed, Some(3));
    let handle = supervisor.status("demo");
    assert_eq!(handle.state, AppState::Crashed);
    assert_eq!(handle.proxy_url, None);
    let logs: Vec<String> = detector.logs("demo").into_iter().map(|r| r.message).collect();
    assert!(logs.iter().any(|l| l.contains("out of memory")));
    assert!(logs.iter().any(|l| l.contains("exited unexpectedly (exit code 3)")));
}

#[tokio::test]
async fn spawn_failure_leaves_the_app_stopped() {
    let app = TestApp::new("demo", READY_SERVER).expect("app");
    let mut cfg = app.config().expect("config");
    cfg.dev.command = vec!["/nonexistent/appvisor-dev-server".to_string()];
    let (supervisor, detector, _bus) = supervisor(cfg);

    let err = supervisor.run(&app.spec).await.expect_err("spawn failure");

    assert!(matches!(err, OrchestratorError::ProcessSpawnFailed(_)), "{err}");
    let handle = supervisor.status("demo");
    assert_eq!(handle.state, AppState::Stopped);
    assert_eq!(handle.pid, None);
    assert!(
        detector
            .logs("demo")
            .iter()
            .any(|r| r.message.contains("failed to start dev server"))
    );
}

#[tokio::test]
async fn silent_server_times_out_and_is_stopped() {
    let app = TestApp::new("demo", "echo 'warming up'\nwhile true; do sleep 1; done\n")
        .expect("app");
    let mut cfg = app.config().expect("config");
    cfg.dev.ready_timeout_secs = 1;
    let (supervisor, _detector, _bus) = supervisor(cfg);

    let err = supervisor.run(&app.spec).await.expect_err("timeout");

    match err {
        OrchestratorError::ReadyTimeout { secs, tail } => {
            assert_eq!(secs, 1);
            assert_eq!(tail, vec!["warming up".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(supervisor.status("demo").state, AppState::Stopped);
}

#[tokio::test]
async fn dependencies_install_before_the_first_start() {
    let app = TestApp::new("demo", READY_SERVER).expect("app");
    app.write("package.json", "{}").expect("manifest");
    let mut cfg = app.config().expect("config");
    cfg.dev.install_command = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "mkdir node_modules && echo installed".to_string(),
    ];
    let (supervisor, detector, bus) = supervisor(cfg);
    let mut rx = bus.subscribe();

    supervisor.run(&app.spec).await.expect("run");

    assert!(app.root().join("node_modules").is_dir());
    assert_eq!(
        states(&drain(&mut rx))[..2],
        [AppState::Installing, AppState::Starting]
    );
    assert!(detector.logs("demo").iter().any(|r| r.message == "installed"));

    // Rebuilding drops the cache, so the install runs again.
    supervisor.rebuild("demo").await.expect("rebuild");
    assert!(states(&drain(&mut rx)).contains(&AppState::Installing));
    assert_eq!(
        detector
            .logs("demo")
            .iter()
            .filter(|r| r.message == "installed")
            .count(),
        2
    );
    supervisor.stop("demo").await.expect("stop");
}

#[tokio::test]
async fn restart_reinstalls_even_with_the_cache_kept() {
    let app = TestApp::new("demo", READY_SERVER).expect("app");
    app.write("package.json", "{}").expect("manifest");
    let mut cfg = app.config().expect("config");
    cfg.dev.install_command = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "mkdir -p node_modules && echo installed".to_string(),
    ];
    let (supervisor, detector, bus) = supervisor(cfg);
    supervisor.run(&app.spec).await.expect("run");
    let mut rx = bus.subscribe();

    supervisor.restart("demo", false).await.expect("restart");

    assert!(app.root().join("node_modules").is_dir());
    let states = states(&drain(&mut rx));
    assert!(states.contains(&AppState::Installing), "{states:?}");
    assert_eq!(supervisor.status("demo").state, AppState::Running);
    assert_eq!(
        detector
            .logs("demo")
            .iter()
            .filter(|r| r.message == "installed")
            .count(),
        2
    );
    supervisor.stop("demo").await.expect("stop");
}

#[tokio::test]
async fn disabled_proxy_serves_the_dev_server_directly() {
    let app = TestApp::new("demo", READY_SERVER).expect("app");
    let mut cfg = app.config().expect("config");
    cfg.proxy.enabled = false;
    let (supervisor, _detector, _bus) = supervisor(cfg);

    let url = supervisor.run(&app.spec).await.expect("run");

    assert_eq!(url, "http://127.0.0.1:4999");
    assert_eq!(supervisor.status("demo").proxy_url, None);
    supervisor.stop("demo").await.expect("stop");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn stop_kills_the_whole_process_group() {
    let script = "sleep 60 &\necho $! > grandchild.pid\necho 'ready on http://127.0.0.1:4999'\nwait\n";
    let app = TestApp::new("demo", script).expect("app");
    let (supervisor, _detector, _bus) = supervisor(app.config().expect("config"));

    supervisor.run(&app.spec).await.expect("run");
    let pid_file = app.root().join("grandchild.pid");
    assert!(wait_until(Duration::from_secs(2), || pid_file.exists()).await);
    let pid = std::fs::read_to_string(&pid_file).expect("pid").trim().to_string();

    supervisor.stop("demo").await.expect("stop");

    // A killed orphan may linger as a zombie until its new parent reaps it.
    let stat = format!("/proc/{pid}/stat");
    let gone = wait_until(Duration::from_secs(3), || {
        std::fs::read_to_string(&stat).map_or(true, |s| s.contains(") Z "))
    })
    .await;
    assert!(gone, "grandchild {pid} survived stop");
}

#[tokio::test]
async fn stopping_an_unknown_app_is_an_error() {
    let app = TestApp::new("demo", READY_SERVER).expect("app");
    let (supervisor, _detector, _bus) = supervisor(app.config().expect("config"));
    assert!(matches!(
        supervisor.stop("ghost").await,
        Err(OrchestratorError::AppNotFound(_))
    ));
    assert_eq!(supervisor.status("ghost").state, AppState::Idle);
}
