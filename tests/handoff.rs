//! Listener handoff between generations.

use std::os::fd::IntoRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use lifeline::http::GENERATION_HEADER;
use lifeline::lifecycle::Orchestrator;
use lifeline::net::{ExitReason, HandoffError, SupervisorState, Upgrader};
use reqwest::StatusCode;

mod common;

#[tokio::test]
async fn successor_receives_protocol_environment() {
    let upgrader = Upgrader::with_inheritance(
        common::shell_successor(
            r#"test "$LIFELINE_LISTEN_FDS" = "tcp|127.0.0.1:0|4" && test "$LIFELINE_READY_FD" = 3 && printf r >&3"#,
        ),
        None,
        None,
    )
    .unwrap();
    let _listener = upgrader.listen("tcp", "127.0.0.1:0").unwrap();
    upgrader.signal_ready().unwrap();

    let successor = upgrader.trigger_handoff().unwrap();
    assert!(successor.pid() > 0);
    successor.ready().await.unwrap();

    assert_eq!(upgrader.state(), SupervisorState::UpgradeRequested);
    assert!(matches!(upgrader.await_exit().await, ExitReason::Upgraded { .. }));
    upgrader.stop();
}

#[tokio::test]
async fn failed_successor_leaves_current_generation_serving() {
    let upgrader = Upgrader::with_inheritance(common::shell_successor("exit 1"), None, None).unwrap();
    let _listener = upgrader.listen("tcp", "127.0.0.1:0").unwrap();
    upgrader.signal_ready().unwrap();

    let error = upgrader.trigger_handoff().unwrap().ready().await.unwrap_err();
    assert!(matches!(error, HandoffError::SuccessorFailed(_)), "{error}");
    assert_eq!(upgrader.state(), SupervisorState::Listening);
    assert_eq!(upgrader.exit_reason(), None);

    // A later attempt is allowed.
    let error = upgrader.trigger_handoff().unwrap().ready().await.unwrap_err();
    assert!(matches!(error, HandoffError::SuccessorFailed(_)));
    upgrader.stop();
}

#[tokio::test]
async fn silent_successor_times_out_and_is_killed() {
    let options = common::shell_successor("exec sleep 30").with_ready_timeout(Duration::from_millis(300));
    let upgrader = Upgrader::with_inheritance(options, None, None).unwrap();
    let _listener = upgrader.listen("tcp", "127.0.0.1:0").unwrap();
    upgrader.signal_ready().unwrap();

    let successor = upgrader.trigger_handoff().unwrap();
    assert!(matches!(upgrader.trigger_handoff(), Err(HandoffError::UpgradeInProgress)));

    let started = std::time::Instant::now();
    let error = successor.ready().await.unwrap_err();
    assert!(matches!(error, HandoffError::ReadyTimeout(_)), "{error}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(upgrader.state(), SupervisorState::Listening);
    upgrader.stop();
}

#[tokio::test]
async fn handoff_is_rejected_until_ready() {
    let upgrader = Upgrader::with_inheritance(common::ready_successor(), None, None).unwrap();
    assert!(matches!(
        upgrader.trigger_handoff(),
        Err(HandoffError::NotListening(SupervisorState::Starting))
    ));

    // Listening but still starting up: an upgrade request must not replace it.
    let _listener = upgrader.listen("tcp", "127.0.0.1:0").unwrap();
    assert!(matches!(upgrader.trigger_handoff(), Err(HandoffError::NotReady)));
    upgrader.signal_ready().unwrap();
    let successor = upgrader.trigger_handoff().unwrap();
    successor.ready().await.unwrap();
    upgrader.stop();
}

fn slow_routes(entered: Arc<AtomicUsize>) -> Router {
    Router::new().route(
        "/slow",
        get(move || {
            let entered = entered.clone();
            async move {
                entered.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                "done"
            }
        }),
    )
}

/// Two generations share one socket: the old one drains its in-flight
/// requests while the new one takes every new connection.
#[tokio::test]
async fn in_flight_requests_finish_on_the_old_generation() {
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = socket.local_addr().unwrap();
    let shared = socket.try_clone().unwrap().into_raw_fd();
    let old_fds = format!("tcp|127.0.0.1:0|{}", socket.into_raw_fd());
    let new_fds = format!("tcp|127.0.0.1:0|{shared}");
    let config = Arc::new(common::test_config());

    let old_upgrader = Upgrader::with_inheritance(common::ready_successor(), Some(&old_fds), None).unwrap();
    let old_entered = Arc::new(AtomicUsize::new(0));
    let old = Orchestrator::new(config.clone(), old_upgrader.clone())
        .with_routes(slow_routes(old_entered.clone()))
        .startup()
        .await
        .unwrap();
    assert_eq!(old.address(), address);
    let old_generation = old.generation().to_string();

    let client = common::fresh_client();
    let in_flight: Vec<_> = (0..10)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.get(format!("http://{address}/slow")).send().await })
        })
        .collect();
    while old_entered.load(Ordering::SeqCst) < 10 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let new_upgrader = Upgrader::with_inheritance(common::ready_successor(), Some(&new_fds), None).unwrap();
    let new = Orchestrator::new(config.clone(), new_upgrader)
        .with_routes(slow_routes(Arc::new(AtomicUsize::new(0))))
        .startup()
        .await
        .unwrap();
    let new_generation = new.generation().to_string();
    assert_ne!(old_generation, new_generation);

    let running = tokio::spawn(old.run_until_exit());
    old_upgrader.trigger_handoff().unwrap().ready().await.unwrap();
    let report = running.await.unwrap().unwrap();
    assert!(matches!(report.reason, ExitReason::Upgraded { .. }));

    for request in in_flight {
        let res = request.await.unwrap().unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[GENERATION_HEADER], old_generation.as_str());
        assert_eq!(res.text().await.unwrap(), "done");
    }

    let res = common::fresh_client().get(format!("http://{address}/ping")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[GENERATION_HEADER], new_generation.as_str());

    new.shutdown(ExitReason::Terminated("test".into())).await.unwrap();
}
