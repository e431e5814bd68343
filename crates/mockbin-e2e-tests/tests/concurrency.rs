// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Concurrency scenarios: several proxies at once, several in-flight calls
//! per proxy, and mocks resolved through PATH like a real system under test
//! would.

use mockbin::{Mock, RecordingReporter};
use std::process::Command;

#[cfg(unix)]
#[test]
fn parallel_mocks_with_passthrough() {
    mockbin_e2e_tests::init_tracing();

    let mut handles = Vec::new();
    for i in 1..3 {
        handles.push(std::thread::spawn(move || {
            let dir = tempfile::tempdir().expect("tempdir");
            let mock = Mock::new(dir.path().join("sleep")).expect("mock");
            let duration = format!("0.{i}");
            mock.expect([duration.as_str()])
                .exactly(1)
                .and_passthrough_to_local_command("sleep");

            let output = Command::new(mock.path())
                .arg(&duration)
                .output()
                .expect("run mock");
            assert!(
                output.status.success(),
                "stderr: {}",
                String::from_utf8_lossy(&output.stderr)
            );

            let mut reporter = RecordingReporter::new();
            assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
            mock.close().expect("close");
        }));
    }
    for handle in handles {
        handle.join().expect("join");
    }
}

#[test]
fn many_concurrent_invocations_of_one_mock() {
    mockbin_e2e_tests::init_tracing();

    let mock = Mock::new("busy").expect("mock");
    mock.expect(())
        .with_any_arguments()
        .exactly(8)
        .and_write_to_stdout("hi\n")
        .and_exit_with(0);

    let mut children = Vec::new();
    for i in 0..8 {
        children.push(
            Command::new(mock.path())
                .arg(format!("call-{i}"))
                .stdout(std::process::Stdio::piped())
                .spawn()
                .expect("spawn"),
        );
    }
    for child in children {
        let output = child.wait_with_output().expect("wait");
        assert!(output.status.success());
        assert_eq!(output.stdout, b"hi\n");
    }

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[cfg(unix)]
#[test]
fn mock_resolved_through_path_lookup() {
    mockbin_e2e_tests::init_tracing();

    let mock = Mock::new("fakegit").expect("mock");
    mock.expect(["status"])
        .and_write_to_stdout("clean\n")
        .and_exit_with(0);

    let mock_dir = mock.path().parent().expect("mock dir").to_path_buf();
    let path = format!(
        "{}:{}",
        mock_dir.display(),
        std::env::var("PATH").unwrap_or_default()
    );
    let output = Command::new("sh")
        .args(["-c", "fakegit status"])
        .env("PATH", path)
        .output()
        .expect("run through sh");

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(output.stdout, b"clean\n");

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[test]
fn debug_forwarding_does_not_disturb_the_relay() {
    mockbin_e2e_tests::init_tracing();

    let mock = Mock::new("chatty").expect("mock");
    mock.expect(["noisy"])
        .and_write_to_stdout("still fine\n")
        .and_exit_with(0);

    let output = Command::new(mock.path())
        .arg("noisy")
        .env("MOCKBIN_DEBUG", "1")
        .output()
        .expect("run mock");

    assert!(output.status.success());
    assert_eq!(output.stdout, b"still fine\n");

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter));
    mock.close().expect("close");
}
