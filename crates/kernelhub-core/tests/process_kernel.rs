//! Tests against a real `python3`. Run with `cargo test -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use kernelhub_core::kernel::ProcessKernelLauncher;
use kernelhub_core::{
    AcquirePolicy, Completion, DeadlinePolicy, DegradedCause, GatewayError, GatewayOptions,
    KernelGateway, OutputEvent,
};

fn gateway(inactivity: Duration) -> KernelGateway {
    let launcher = ProcessKernelLauncher::new("python3").with_startup_timeout(Duration::from_secs(20));
    KernelGateway::new(
        Arc::new(launcher),
        GatewayOptions {
            relay_policy: DeadlinePolicy::ResetOnActivity { inactivity },
            ..GatewayOptions::default()
        },
    )
}

#[tokio::test]
#[ignore = "requires python3"]
async fn print_streams_stdout() {
    let gateway = gateway(Duration::from_secs(5));
    let id = gateway.start_session().await.unwrap();

    let report = gateway.execute_collect(&id, "print(\"hi\")").await.unwrap();
    assert_eq!(report.completion, Completion::Clean);
    assert_eq!(
        report.output().cloned().collect::<Vec<_>>(),
        vec![OutputEvent::Stream {
            name: "stdout".into(),
            text: "hi\n".into()
        }]
    );
    gateway.shutdown().await;
}

#[tokio::test]
#[ignore = "requires python3"]
async fn namespace_persists_and_trailing_expression_is_result() {
    let gateway = gateway(Duration::from_secs(5));
    let id = gateway.start_session().await.unwrap();

    gateway.execute_collect(&id, "x = 20").await.unwrap();
    let report = gateway.execute_collect(&id, "x * 2 + 2").await.unwrap();
    assert!(
        report
            .output()
            .any(|e| *e == OutputEvent::Result { text: "42".into() })
    );
    gateway.shutdown().await;
}

#[tokio::test]
#[ignore = "requires python3"]
async fn exception_is_reported() {
    let gateway = gateway(Duration::from_secs(5));
    let id = gateway.start_session().await.unwrap();

    let report = gateway
        .execute_collect(&id, "raise ValueError('bad')")
        .await
        .unwrap();
    assert!(report.completion.is_clean());
    let errors: Vec<_> = report.output().filter(|e| e.is_error()).collect();
    assert!(matches!(
        errors.as_slice(),
        [OutputEvent::Error { name, message, trace }]
            if name == "ValueError" && message == "bad" && !trace.is_empty()
    ));
    gateway.shutdown().await;
}

#[tokio::test]
#[ignore = "requires python3"]
async fn silent_sleep_times_out_then_recovers() {
    let gateway = gateway(Duration::from_millis(500));
    let id = gateway.start_session().await.unwrap();

    let report = gateway
        .execute_collect(&id, "import time\ntime.sleep(30)")
        .await
        .unwrap();
    assert_eq!(
        report.completion,
        Completion::Degraded(DegradedCause::RelayTimeout)
    );

    let report = gateway.execute_collect(&id, "print('back')").await.unwrap();
    assert!(report.completion.is_clean());
    assert!(!report.has_error());
    gateway.shutdown().await;
}

#[tokio::test]
#[ignore = "requires python3"]
async fn restart_clears_namespace() {
    let gateway = gateway(Duration::from_secs(5));
    let id = gateway.start_session().await.unwrap();

    gateway.execute_collect(&id, "y = 1").await.unwrap();
    gateway.restart(&id).await.unwrap();
    let report = gateway.execute_collect(&id, "y").await.unwrap();
    assert!(report.output().any(|e| matches!(e, OutputEvent::Error { name, .. } if name == "NameError")));
    gateway.shutdown().await;
}

#[tokio::test]
#[ignore = "requires python3"]
async fn interrupts_racing_cell_end_keep_kernel_alive() {
    let gateway = gateway(Duration::from_secs(5));
    let id = gateway.start_session().await.unwrap();

    for i in 0..50 {
        let running = gateway
            .execute(&id, &format!("n = {i}"), AcquirePolicy::Reject)
            .await
            .unwrap();
        gateway.interrupt(&id).await.unwrap();
        let report = running.collect().await;
        assert!(report.completion.is_clean(), "run {i}: {:?}", report.completion);
    }

    let report = gateway.execute_collect(&id, "print('alive')").await.unwrap();
    assert!(report.completion.is_clean());
    assert!(!report.has_error());
    gateway.shutdown().await;
}

#[tokio::test]
#[ignore = "requires python3"]
async fn kernel_exit_removes_session() {
    let gateway = gateway(Duration::from_secs(5));
    let id = gateway.start_session().await.unwrap();

    let report = gateway
        .execute_collect(&id, "import os; os._exit(1)")
        .await
        .unwrap();
    assert_eq!(
        report.completion,
        Completion::Degraded(DegradedCause::KernelChannelClosed)
    );
    let err = gateway.execute_collect(&id, "1").await.unwrap_err();
    assert!(matches!(err, GatewayError::SessionNotFound { .. }));
}

#[tokio::test]
async fn missing_interpreter_fails_to_start() {
    let launcher = ProcessKernelLauncher::new("kernelhub-no-such-interpreter");
    let gateway = KernelGateway::new(Arc::new(launcher), GatewayOptions::default());
    let err = gateway.start_session().await.unwrap_err();
    assert!(matches!(err, GatewayError::KernelStart(_)));
    assert!(gateway.sessions().await.is_empty());
}
