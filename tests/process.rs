//! Timeout/kill and interleaved-stream ordering invariants, per spec.md §8.

use proptest::prelude::*;
use sandkit::error::ProcessError;
use sandkit::process::{spawn_piped, ProcessHandle, StreamName};
use std::time::Duration;

#[tokio::test]
async fn wait_surfaces_exit_code() {
    let child = spawn_piped(&["true".to_string()], false).unwrap();
    let mut handle = ProcessHandle::from_piped_child(child, None);
    assert_eq!(handle.wait(None, false).await.unwrap(), 0);
}

#[tokio::test]
async fn timeout_kills_child_and_returncode_is_some_afterward() {
    let child = spawn_piped(&["sleep".to_string(), "30".to_string()], false).unwrap();
    let mut handle = ProcessHandle::from_piped_child(child, None);
    let err = handle
        .wait(Some(Duration::from_millis(50)), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::Timeout(_)));
    assert!(handle.returncode().is_some());
}

#[tokio::test]
async fn communicate_sends_stdin_and_collects_stdout() {
    let child = spawn_piped(&["cat".to_string()], true).unwrap();
    let mut handle = ProcessHandle::from_piped_child(child, None);
    let (stdout, _stderr) = handle
        .communicate(Some(b"round trip\n"), None, false)
        .await
        .unwrap();
    assert_eq!(stdout, b"round trip\n");
}

#[tokio::test]
async fn stream_preserves_ordering_within_each_named_stream() {
    let child = spawn_piped(
        &[
            "bash".to_string(),
            "-c".to_string(),
            "for i in 1 2 3; do echo out$i; echo err$i >&2; done".to_string(),
        ],
        false,
    )
    .unwrap();
    let mut handle = ProcessHandle::from_piped_child(child, None);
    let mut stream = handle.stream(64).unwrap();

    let mut stdout_lines = Vec::new();
    let mut stderr_lines = Vec::new();
    while let Some(chunk) = stream.next().await {
        let text = chunk.to_utf8_lossy();
        match chunk.stream {
            StreamName::Stdout => stdout_lines.push(text),
            StreamName::Stderr => stderr_lines.push(text),
        }
    }
    let stdout_joined: String = stdout_lines.concat();
    let stderr_joined: String = stderr_lines.concat();
    assert_eq!(stdout_joined, "out1\nout2\nout3\n");
    assert_eq!(stderr_joined, "err1\nerr2\nerr3\n");
}

proptest! {
    /// For any sequence of stdout writes, concatenating the emitted line
    /// chunks reproduces the original bytes exactly (spec.md §8).
    #[test]
    fn line_stream_concatenation_matches_source(lines in proptest::collection::vec("[a-zA-Z0-9 ]{0,40}", 0..20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut script = String::new();
            for line in &lines {
                script.push_str(&format!("echo '{line}'\n"));
            }
            let child = spawn_piped(&["bash".to_string(), "-c".to_string(), script], false).unwrap();
            let mut handle = ProcessHandle::from_piped_child(child, None);
            let mut line_stream = handle.stream_lines().unwrap();

            let mut collected = Vec::new();
            while let Some(chunk) = line_stream.next().await {
                collected.extend_from_slice(&chunk.data);
            }
            let expected: String = lines.iter().map(|l| format!("{l}\n")).collect();
            prop_assert_eq!(collected, expected.into_bytes());
            Ok(())
        })?;
    }
}
