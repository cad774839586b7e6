// packages/engine/tests/session_tests.rs
//! Session behaviour against the mock kernel

mod common;

use common::{mock_kernel, mock_kernel_with, test_session_config, wait_until};
use kernel_eval_engine::runtime::{ResultShape, TerminationReason};
use kernel_eval_engine::{
    serialize, AsyncSession, EngineError, Expr, SessionConfig, SessionState,
    STARTUP_READ_TIMEOUT, TERMINATE_READ_TIMEOUT,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn start_session() -> Arc<AsyncSession> {
    AsyncSession::launch(&mock_kernel(), test_session_config())
        .await
        .expect("mock kernel starts")
}

#[tokio::test]
async fn test_range_evaluates() {
    let session = start_session().await;
    assert_eq!(session.state(), SessionState::Ready);

    let expected = Expr::list([1, 2, 3]);
    assert_eq!(session.evaluate(Expr::apply("Range", [3])).await.unwrap(), expected);
    assert_eq!(session.evaluate(Expr::string("Range[3]")).await.unwrap(), expected);

    session.terminate().await.unwrap();
    assert_eq!(session.state(), SessionState::Terminated);

    assert!(matches!(
        session.submit(&Expr::string("Range[3]"), ResultShape::Decoded),
        Err(EngineError::SessionTerminated)
    ));
    assert!(matches!(
        session.evaluate(1).await,
        Err(EngineError::SessionTerminated)
    ));
}

#[tokio::test]
async fn test_submit_returns_before_kernel_finishes() {
    let session = start_session().await;

    let started = Instant::now();
    let pending = session
        .submit(&Expr::string("Pause[.1]; Range[3]"), ResultShape::Decoded)
        .unwrap();
    let submitted_in = started.elapsed();
    assert!(submitted_in < Duration::from_millis(50), "{:?}", submitted_in);

    let value = pending.await.unwrap().into_value().unwrap();
    assert_eq!(value, Expr::list([1, 2, 3]));
    assert!(started.elapsed() >= Duration::from_millis(100));

    session.terminate().await.unwrap();
}

#[tokio::test]
async fn test_background_task_evaluation() {
    let session = start_session().await;

    let started = Instant::now();
    let background = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.evaluate(Expr::string("Pause[.1]; Range[3]")).await })
    };
    assert!(started.elapsed() < Duration::from_millis(50));

    assert_eq!(background.await.unwrap().unwrap(), Expr::list([1, 2, 3]));
    session.terminate().await.unwrap();
}

#[tokio::test]
async fn test_result_shapes() {
    let session = start_session().await;

    let raw = session.evaluate_wxf(Expr::apply("Range", [2])).await.unwrap();
    assert_eq!(raw, serialize(&Expr::list([1, 2])).unwrap());

    let ok = session.evaluate_wrap(Expr::string("Range[2]")).await.unwrap();
    assert!(ok.is_success());
    assert!(ok.messages.is_empty());
    assert_eq!(ok.get(), &Expr::list([1, 2]));

    let failed = session
        .evaluate_wrap(Expr::string("Message[\"Power::infy\", \"Infinite expression 1/0\"]; 7"))
        .await
        .unwrap();
    assert!(!failed.is_success());
    assert_eq!(failed.messages.len(), 1);
    assert_eq!(failed.messages[0].tag, "Power::infy");
    assert_eq!(failed.result, Expr::Integer(7));

    session.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_get_their_own_results() {
    let session = start_session().await;

    let tasks: Vec<_> = (0..64i64)
        .map(|i| {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let value = session.evaluate(Expr::apply("Plus", [i, 1000])).await?;
                Ok::<_, EngineError>((i, value))
            })
        })
        .collect();

    for task in tasks {
        let (i, value) = task.await.unwrap().unwrap();
        assert_eq!(value, Expr::Integer(i + 1000));
    }
    assert_eq!(session.pending_count(), 0);
    assert_eq!(session.state(), SessionState::Ready);

    session.terminate().await.unwrap();
}

#[tokio::test]
async fn test_timeout_keeps_later_results_aligned() {
    let session = start_session().await;

    let started = Instant::now();
    let err = session
        .evaluate_with_timeout(Expr::string("Pause[1]; \"late\""), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EvaluationTimeout(_)));
    assert!(started.elapsed() < Duration::from_millis(800));

    // The late answer is still read and dropped; this one must not receive it
    assert_eq!(
        session.evaluate(Expr::string("Range[2]")).await.unwrap(),
        Expr::list([1, 2])
    );
    assert!(session.is_healthy());

    session.terminate().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_request_does_not_shift_responses() {
    let session = start_session().await;

    let abandoned = session
        .submit(&Expr::string("Pause[.1]; \"first\""), ResultShape::Decoded)
        .unwrap();
    drop(abandoned);

    assert_eq!(
        session.evaluate(Expr::string("\"second\"")).await.unwrap(),
        Expr::string("second")
    );
    session.terminate().await.unwrap();
}

#[tokio::test]
async fn test_kernel_exit_crashes_session() {
    let session = start_session().await;

    let before = session
        .submit(&Expr::string("Pause[.1]; 1"), ResultShape::Decoded)
        .unwrap();
    let killer = session
        .submit(&Expr::string("Kill[]"), ResultShape::Decoded)
        .unwrap();

    assert_eq!(before.await.unwrap().into_value().unwrap(), Expr::Integer(1));
    match killer.await {
        Err(EngineError::StreamClosed { stderr }) => {
            assert!(stderr.contains("killed on request"), "stderr: {:?}", stderr)
        }
        other => panic!("expected StreamClosed, got {:?}", other),
    }

    assert_eq!(session.state(), SessionState::Crashed);
    assert!(!session.is_healthy());
    assert!(matches!(
        session.evaluate(1).await,
        Err(EngineError::SessionUnavailable {
            state: SessionState::Crashed,
            ..
        })
    ));

    // the dead process is still reaped
    let reason = session.terminate().await.unwrap();
    assert!(reason.is_some());
    assert_eq!(session.state(), SessionState::Crashed);
}

#[tokio::test]
async fn test_unframeable_output_crashes_session() {
    let session = start_session().await;

    let err = session.evaluate(Expr::string("Garbage[]")).await.unwrap_err();
    assert!(matches!(err, EngineError::MalformedPayload(_)), "{:?}", err);
    assert_eq!(session.state(), SessionState::Crashed);

    session.terminate().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_result_fails_only_that_request() {
    let session = start_session().await;

    let err = session.evaluate(Expr::string("BadResult[]")).await.unwrap_err();
    assert!(matches!(err, EngineError::MalformedPayload(_)));

    let raw = session.evaluate_wxf(Expr::string("BadResult[]")).await.unwrap();
    assert_eq!(raw.as_ref(), b"8:\xff");

    assert!(session.is_healthy());
    assert_eq!(
        session.evaluate(Expr::string("Range[1]")).await.unwrap(),
        Expr::list([1])
    );
    session.terminate().await.unwrap();
}

#[tokio::test]
async fn test_unsupported_value_is_local() {
    let session = start_session().await;

    let err = session.evaluate(Expr::Real(f64::NAN)).await.unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedValue(_)));
    assert_eq!(session.evaluate(5).await.unwrap(), Expr::Integer(5));

    session.terminate().await.unwrap();
}

#[tokio::test]
async fn test_startup_timeout() {
    let kernel = mock_kernel_with(&[
        ("MOCK_KERNEL_NEVER_READY", "1"),
        ("MOCK_KERNEL_STDERR", "waiting for license"),
    ]);
    let config = SessionConfig::from_parameters([(STARTUP_READ_TIMEOUT, 0.3)]).unwrap();
    let session = AsyncSession::new(&kernel, config).unwrap();

    let started = Instant::now();
    match session.start().await {
        Err(EngineError::StartupTimeout { timeout, stderr }) => {
            assert_eq!(timeout, Duration::from_millis(300));
            assert!(stderr.contains("waiting for license"), "stderr: {:?}", stderr);
        }
        other => panic!("expected StartupTimeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(session.state(), SessionState::Crashed);
}

#[tokio::test]
async fn test_slow_start_within_timeout() {
    let kernel = mock_kernel_with(&[("MOCK_KERNEL_STARTUP_DELAY_MS", "200")]);
    let session = AsyncSession::launch(&kernel, test_session_config())
        .await
        .unwrap();
    assert!(session.is_healthy());
    session.terminate().await.unwrap();
}

#[test]
fn test_unknown_session_parameter_rejected() {
    let err = SessionConfig::from_parameters([("STARTUP_TIMEOUT", 1.0)]).unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfiguration(_)));

    let err = SessionConfig::from_parameters([(TERMINATE_READ_TIMEOUT, -1.0)]).unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn test_terminate_fails_outstanding_requests() {
    let session = start_session().await;

    let pending = session
        .submit(&Expr::string("Pause[5]"), ResultShape::Decoded)
        .unwrap();
    assert_eq!(session.pending_count(), 1);
    assert_eq!(session.state(), SessionState::Evaluating);

    let reason = session.terminate().await.unwrap().unwrap();
    assert!(reason.is_graceful(), "{:?}", reason);
    assert!(matches!(pending.await, Err(EngineError::SessionTerminated)));
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn test_terminate_during_start_reaps_kernel() {
    let kernel = mock_kernel_with(&[("MOCK_KERNEL_STARTUP_DELAY_MS", "800")]);
    let session = Arc::new(AsyncSession::new(&kernel, test_session_config()).unwrap());

    let starting = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.start().await })
    };
    let is_starting = || session.state() == SessionState::Starting;
    assert!(wait_until(Duration::from_secs(2), is_starting).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let reason = session.terminate().await.unwrap();
    assert!(reason.is_some(), "kernel was not reaped by terminate");
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(matches!(
        starting.await.unwrap(),
        Err(EngineError::SessionTerminated)
    ));

    let pid = session.pid().unwrap();
    assert_eq!(
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None),
        Err(nix::errno::Errno::ESRCH)
    );
}

#[tokio::test]
async fn test_terminate_before_start() {
    let session = AsyncSession::new(&mock_kernel(), test_session_config()).unwrap();
    assert_eq!(session.terminate().await.unwrap(), None);
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(matches!(
        session.start().await,
        Err(EngineError::SessionTerminated)
    ));
    assert!(session.pid().is_none());
}

#[tokio::test]
async fn test_stderr_tail_is_not_consumed() {
    let kernel = mock_kernel_with(&[("MOCK_KERNEL_STDERR", "kernel banner")]);
    let session = AsyncSession::launch(&kernel, test_session_config())
        .await
        .unwrap();

    let banner = || session.stderr_tail().contains("kernel banner");
    assert!(wait_until(Duration::from_secs(2), banner).await);
    assert!(session.stderr_tail().contains("kernel banner"));

    match session.evaluate(Expr::string("Kill[]")).await {
        Err(EngineError::StreamClosed { stderr }) => {
            assert!(stderr.contains("kernel banner"), "stderr: {:?}", stderr);
            assert!(stderr.contains("killed on request"), "stderr: {:?}", stderr);
        }
        other => panic!("expected StreamClosed, got {:?}", other),
    }
    session.terminate().await.unwrap();
}

#[tokio::test]
async fn test_terminate_forces_kill_after_grace_period() {
    let kernel = mock_kernel_with(&[
        ("MOCK_KERNEL_IGNORE_SIGTERM", "1"),
        ("MOCK_KERNEL_LINGER", "1"),
    ]);
    let config = SessionConfig::from_parameters([(TERMINATE_READ_TIMEOUT, 0.3)]).unwrap();
    let session = AsyncSession::launch(&kernel, config).await.unwrap();

    let started = Instant::now();
    let reason = session.terminate().await.unwrap();
    assert_eq!(reason, Some(TerminationReason::Killed));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn test_session_introspection() {
    let session = start_session().await;

    let info = session.info();
    assert_eq!(info.id, session.id());
    assert_eq!(info.state, SessionState::Ready);
    assert_eq!(info.pending, 0);
    assert!(info.started_at.is_some());

    let pid = session.pid().unwrap();
    assert_eq!(
        session.evaluate(Expr::symbol("$ProcessID")).await.unwrap(),
        Expr::Integer(i64::from(pid))
    );

    let plus = session.function("Plus");
    assert_eq!(plus.call([1, 2]).await.unwrap(), Expr::Integer(3));

    assert!(matches!(
        session.start().await,
        Err(EngineError::InvalidState {
            expected: SessionState::NotStarted,
            ..
        })
    ));

    session.terminate().await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || !session.is_healthy()).await);
}
