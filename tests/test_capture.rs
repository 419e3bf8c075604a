use std::time::Duration;

use procio::{CaptureRunner, EXIT_CODE_NOT_STARTED, run};

/// Upper bound for tests that would otherwise hang on a regression.
const TEST_DEADLINE: Duration = Duration::from_secs(10);

async fn with_deadline<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(TEST_DEADLINE, f)
        .await
        .expect("test deadline exceeded")
}

#[tokio::test]
async fn test_echo_is_fully_captured() {
    with_deadline(async {
        let mut runner = CaptureRunner::new("echo", vec!["hello"]);
        runner.start().unwrap();

        assert!(runner.wait_for_exit(5000).await.unwrap());
        assert_eq!(runner.stdout(), "hello\n");
        assert_eq!(runner.stderr(), "");
        assert_eq!(runner.combined(), "hello\n");
        assert_eq!(runner.exit_code(), Some(0));
    })
    .await;
}

#[tokio::test]
async fn test_run_returns_result_for_missing_binary() {
    let result = with_deadline(run(
        "/definitely/not/a/binary",
        Vec::<String>::new(),
        Vec::new(),
        5000,
    ))
    .await;

    assert!(result.start_failure.is_some());
    assert_eq!(result.exit_code, EXIT_CODE_NOT_STARTED);
    assert!(!result.success());
    assert_eq!(result.stdout, "");
    assert_eq!(result.combined, "");
}

#[tokio::test]
async fn test_zero_timeout_waits_indefinitely() {
    with_deadline(async {
        let mut runner = CaptureRunner::new("sh", vec!["-c", "sleep 0.2; echo waited"]);
        runner.start().unwrap();

        assert!(runner.wait_for_exit(0).await.unwrap());
        assert_eq!(runner.stdout(), "waited\n");
        assert_eq!(runner.exit_code(), Some(0));
    })
    .await;
}

#[tokio::test]
async fn test_timeout_then_kill() {
    with_deadline(async {
        let mut runner = CaptureRunner::new("sleep", vec!["10"]);
        runner.start().unwrap();

        assert!(!runner.wait_for_exit(100).await.unwrap());

        let code = runner.kill().await.unwrap();
        // SIGKILL leaves no exit code; it is reported as -1.
        assert_eq!(code, -1);
        assert_eq!(runner.exit_code(), Some(-1));
    })
    .await;
}

#[tokio::test]
async fn test_run_kills_on_timeout() {
    let result = with_deadline(run("sleep", vec!["10"], Vec::new(), 100)).await;

    assert!(result.start_failure.is_none());
    assert_eq!(result.exit_code, -1);
    assert!(!result.success());
}

#[tokio::test]
async fn test_combined_is_union_of_both_streams() {
    with_deadline(async {
        let mut runner = CaptureRunner::new("sh", vec!["-c", "echo a; echo b 1>&2; echo c"]);
        runner.start().unwrap();
        assert!(runner.wait_for_exit(5000).await.unwrap());

        assert_eq!(runner.stdout(), "a\nc\n");
        assert_eq!(runner.stderr(), "b\n");

        // Cross-stream arrival order is not deterministic, but the combined
        // buffer must hold exactly the union of both streams, and stdout's
        // own order must survive the merge.
        let combined_owned = runner.combined();
        let mut combined: Vec<&str> = combined_owned.lines().collect();
        combined.sort_unstable();
        assert_eq!(combined, vec!["a", "b", "c"]);

        let a_pos = combined_owned.lines().position(|l| l == "a").unwrap();
        let c_pos = combined_owned.lines().position(|l| l == "c").unwrap();
        assert!(a_pos < c_pos);
    })
    .await;
}

#[tokio::test]
async fn test_no_output_after_wait_returns() {
    with_deadline(async {
        let script = "for i in $(seq 1 200); do echo line$i; done";
        let mut runner = CaptureRunner::new("sh", vec!["-c", script]);
        runner.start().unwrap();

        assert!(runner.wait_for_exit(5000).await.unwrap());

        let snapshot = runner.stdout();
        assert_eq!(snapshot.lines().count(), 200);

        // Drained means drained: nothing trickles in afterwards.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.stdout(), snapshot);
    })
    .await;
}

#[tokio::test]
async fn test_kill_is_idempotent() {
    with_deadline(async {
        let mut runner = CaptureRunner::new("sleep", vec!["10"]);
        runner.start().unwrap();

        let first = runner.kill().await.unwrap();
        let second = runner.kill().await.unwrap();
        let third = runner.kill().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second, third);
    })
    .await;
}

#[tokio::test]
async fn test_accessors_return_partial_snapshot_while_running() {
    with_deadline(async {
        let mut runner = CaptureRunner::new("sh", vec!["-c", "echo started; sleep 10"]);
        runner.start().unwrap();

        assert!(!runner.wait_for_exit(100).await.unwrap());

        // The first line is already out; give the reader a moment to land it.
        while !runner.stdout().contains("started") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runner.stdout(), "started\n");
        assert_eq!(runner.exit_code(), None);

        runner.kill().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_run_with_env_override() {
    let result = with_deadline(run(
        "sh",
        vec!["-c", "echo $CAPTURE_TEST_VALUE"],
        vec![("CAPTURE_TEST_VALUE".to_string(), "42".to_string())],
        5000,
    ))
    .await;

    assert!(result.success());
    assert_eq!(result.stdout, "42\n");
}

#[tokio::test]
async fn test_nonzero_exit_code_is_reported() {
    let result = with_deadline(run("sh", vec!["-c", "echo oops 1>&2; exit 3"], Vec::new(), 5000)).await;

    assert!(result.start_failure.is_none());
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stderr, "oops\n");
    assert!(!result.success());
}
