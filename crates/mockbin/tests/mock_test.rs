// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end tests for the mock façade: every scenario here executes the
//! published binary for real and drives it from expectations.

use mockbin::{match_any, match_pattern, Matcher, Mock, RecordingReporter};
use std::io::Write;
use std::process::{Command, Stdio};

/// Pin the relay binary for the producer; cargo builds it alongside these
/// tests.
fn use_built_shim() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| std::env::set_var("MOCKBIN_SHIM", env!("CARGO_BIN_EXE_mockbin-shim")));
}

fn new_mock(name: &str) -> Mock {
    use_built_shim();
    Mock::new(name).expect("failed to create mock")
}

#[test]
fn calling_mock_with_stdout_expected() {
    let mock = new_mock("blargh-stdout");
    mock.expect(["blargh"]).and_write_to_stdout("llamas").and_exit_with(0);

    let output = Command::new(mock.path())
        .arg("blargh")
        .output()
        .expect("failed to run mock");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(output.stdout, b"llamas");
    assert!(output.stderr.is_empty());

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[test]
fn calling_mock_with_stderr_expected() {
    let mock = new_mock("blargh-stderr");
    mock.expect(["blargh"]).and_write_to_stderr("llamas").and_exit_with(0);

    let output = Command::new(mock.path())
        .arg("blargh")
        .output()
        .expect("failed to run mock");

    assert!(output.status.success());
    assert_eq!(output.stderr, b"llamas");
    assert!(output.stdout.is_empty());

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter));
    mock.close().expect("close");
}

#[test]
fn happy_path_writes_and_exit_code() {
    let mock = new_mock("git");
    mock.expect(["rev-parse"]).and_write_to_stdout("abc\n").and_exit_with(0);

    let output = Command::new(mock.path())
        .arg("rev-parse")
        .output()
        .expect("failed to run mock");

    assert_eq!(output.stdout, b"abc\n");
    assert!(output.stderr.is_empty());
    assert_eq!(output.status.code(), Some(0));

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter));
    mock.close().expect("close");
}

#[test]
fn nonzero_exit_codes_are_mirrored() {
    let mock = new_mock("failing");
    mock.expect(["explode"]).and_exit_with(24);

    let status = Command::new(mock.path())
        .arg("explode")
        .status()
        .expect("failed to run mock");
    assert_eq!(status.code(), Some(24));

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter));
    mock.close().expect("close");
}

#[test]
fn empty_writes_still_exit_cleanly() {
    let mock = new_mock("quiet");
    mock.expect(["nothing"]).and_exit_with(0);

    let output = Command::new(mock.path())
        .arg("nothing")
        .output()
        .expect("failed to run mock");
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
    assert!(output.stderr.is_empty());
    mock.close().expect("close");
}

#[test]
fn calling_mock_with_no_expectations_set() {
    let mock = new_mock("bare");

    let output = Command::new(mock.path())
        .arg("blargh")
        .output()
        .expect("failed to run mock");
    assert!(!output.status.success(), "expected a failure without expectations");

    // No expectations declared means nothing to report.
    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter));
    mock.close().expect("close");
}

#[test]
fn unexpected_call_reports_closest_match() {
    let mock = new_mock("closest");
    mock.expect(["checkout", "rock"]).once();

    let output = Command::new(mock.path())
        .args(["checkout", "ro"])
        .output()
        .expect("failed to run mock");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Argument #2 doesn't match: Differs at character 3, expected \"ck\", got \"\""),
        "stderr was: {stderr}"
    );

    let mut reporter = RecordingReporter::new();
    assert!(!mock.check(&mut reporter));
    assert!(
        reporter.logs.iter().any(|l| l.contains("called 0 times, expected at least 1")),
        "logs: {:?}",
        reporter.logs
    );
    assert!(
        reporter.logs.iter().any(|l| l.starts_with("Unexpected call to")),
        "logs: {:?}",
        reporter.logs
    );
    assert_eq!(reporter.errors.len(), 2, "errors: {:?}", reporter.errors);
    mock.close().expect("close");
}

#[test]
fn expectations_of_number_of_calls() {
    struct Case {
        label: &'static str,
        calls: usize,
        min: mockbin::Count,
        max: mockbin::Count,
    }
    use mockbin::Count::Fixed;
    let cases = [
        Case { label: "zero", calls: 0, min: Fixed(0), max: Fixed(0) },
        Case { label: "once", calls: 1, min: Fixed(1), max: Fixed(1) },
        Case { label: "twice", calls: 2, min: Fixed(2), max: Fixed(2) },
        Case { label: "infinite", calls: 10, min: Fixed(10), max: mockbin::UNBOUNDED },
        Case { label: "min-infinite", calls: 10, min: mockbin::UNBOUNDED, max: mockbin::UNBOUNDED },
    ];

    for case in cases {
        let mock = new_mock(&format!("counted-{}", case.label));
        mock.expect(["test"]).min(case.min).max(case.max).and_exit_with(0);

        for _ in 0..case.calls {
            let status = Command::new(mock.path())
                .arg("test")
                .status()
                .expect("failed to run mock");
            assert!(status.success(), "case {}", case.label);
        }

        let mut reporter = RecordingReporter::new();
        assert!(
            mock.check(&mut reporter),
            "case {}: logs {:?}",
            case.label,
            reporter.logs
        );
        mock.close().expect("close");
    }
}

#[test]
fn too_few_calls_fails_check_with_counts() {
    let mock = new_mock("undercalled");
    mock.expect(["x"]).min(2usize).max(3usize).and_exit_with(0);

    let status = Command::new(mock.path()).arg("x").status().expect("run");
    assert!(status.success());

    let mut reporter = RecordingReporter::new();
    assert!(!mock.check(&mut reporter));
    assert!(
        reporter.logs.iter().any(|l| l.contains("called 1 times, expected at least 2")),
        "logs: {:?}",
        reporter.logs
    );
    assert_eq!(reporter.errors.len(), 1);
    mock.close().expect("close");
}

#[test]
fn mock_with_call_func() {
    let mock = new_mock("echo-fn");
    mock.expect(["hello", "world"]).and_call_func(|call| {
        assert_eq!(&call.args[1..], ["hello", "world"]);
        let mut stdout = call.stdout();
        writeln!(stdout, "hello world").unwrap();
        call.exit(0);
    });

    let output = Command::new(mock.path())
        .args(["hello", "world"])
        .output()
        .expect("failed to run mock");

    assert!(output.status.success());
    assert_eq!(output.stdout, b"hello world\n");

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter));
    mock.close().expect("close");
}

#[test]
fn handler_panic_becomes_exit_1() {
    let mock = new_mock("panicky");
    mock.expect(["boom"]).and_call_func(|_| panic!("kaboom"));

    let output = Command::new(mock.path())
        .arg("boom")
        .output()
        .expect("failed to run mock");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("kaboom"), "stderr was: {stderr}");

    // The call still counted against the expectation.
    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[test]
fn ignoring_unexpected_invocations() {
    let mock = new_mock("llamas-seq");
    mock.expect(["first", "call"]).once().and_exit_with(0);
    mock.expect(["third", "call"]).once().and_exit_with(0);
    mock.expect(["fifth", "call"]).once().and_exit_with(0);
    mock.expect(["seventh", "call"]).not_called();
    mock.expect(()).with_any_arguments().at_least_once().and_exit_with(0);

    for args in [
        ["first", "call"],
        ["second", "call"],
        ["third", "call"],
        ["fourth", "call"],
        ["fifth", "call"],
    ] {
        let status = Command::new(mock.path()).args(args).status().expect("run");
        assert!(status.success(), "args {args:?}");
    }

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[test]
fn unexpected_calls_exit_zero_when_ignored() {
    let mock = new_mock("tolerant");
    mock.ignore_unexpected_invocations();
    mock.expect(["known"]).optionally().and_exit_with(0);

    let output = Command::new(mock.path())
        .args(["entirely", "unknown"])
        .output()
        .expect("run");
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
    assert!(output.stderr.is_empty());

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter));
    mock.close().expect("close");
}

#[test]
fn optional_expectations() {
    let mock = new_mock("llamas-opt");
    mock.expect(["first", "call"]).optionally().and_exit_with(0);
    mock.expect(["third", "call"]).once().and_exit_with(0);

    for args in [["first", "call"], ["third", "call"]] {
        let status = Command::new(mock.path()).args(args).status().expect("run");
        assert!(status.success());
    }

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[test]
fn multiple_identical_expectations_drain_in_order() {
    let mock = new_mock("llamas-multi");
    mock.expect(["first", "call"]).and_exit_with(0);
    mock.expect(["first", "call"]).and_exit_with(0);
    mock.expect(["first", "call"]).and_exit_with(0);

    for _ in 0..3 {
        let status = Command::new(mock.path())
            .args(["first", "call"])
            .status()
            .expect("run");
        assert!(status.success());
    }

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[test]
fn expect_with_no_arguments() {
    let mock = new_mock("llamas-bare");
    mock.expect(()).at_least_once().and_exit_with(0);

    for _ in 0..2 {
        let status = Command::new(mock.path()).status().expect("run");
        assert!(status.success());
    }

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter));
    mock.close().expect("close");
}

#[test]
fn expect_with_matcher_func() {
    let mock = new_mock("llamas-holistic");
    mock.expect(())
        .at_least_once()
        .with_matcher_func(|args| mockbin::ArgumentsMatchResult {
            is_match: true,
            match_count: args.len(),
            explanation: String::new(),
        })
        .and_exit_with(0);

    for args in [vec!["x", "y"], vec!["x"], vec![]] {
        let status = Command::new(mock.path()).args(&args).status().expect("run");
        assert!(status.success(), "args {args:?}");
    }

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter));
    mock.close().expect("close");
}

#[test]
fn expect_with_wildcard_and_pattern_matchers() {
    let mock = new_mock("llamas-pattern");
    mock.expect([Matcher::from("push"), match_any()]).and_exit_with(0);
    mock.expect([match_pattern("^pull(-request)?$")]).and_exit_with(0);

    for args in [vec!["push", "origin"], vec!["pull-request"]] {
        let status = Command::new(mock.path()).args(&args).status().expect("run");
        assert!(status.success(), "args {args:?}");
    }

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[test]
fn before_middleware_asserts_environment() {
    let mock = new_mock("envy");
    mock.before(|invocation| {
        mockbin::expect_env(&invocation.env, &["MY_CUSTOM_ENV=1", "LLAMAS_ROCK=absolutely"])?;
        Ok(())
    });
    mock.expect(()).with_any_arguments().at_least_once().and_exit_with(0);

    let status = Command::new(mock.path())
        .env("MY_CUSTOM_ENV", "1")
        .env("LLAMAS_ROCK", "absolutely")
        .status()
        .expect("run");
    assert!(status.success());

    // Without the environment the middleware fails the call.
    let output = Command::new(mock.path())
        .env_remove("MY_CUSTOM_ENV")
        .env_remove("LLAMAS_ROCK")
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("wasn't set in environment"), "stderr: {stderr}");

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[test]
fn stdin_is_captured_and_checked() {
    let mock = new_mock("reader");
    mock.expect(()).with_stdin("the input").and_exit_with(0);

    let mut child = Command::new(mock.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"the input")
        .expect("write stdin");
    let output = child.wait_with_output().expect("wait");
    assert!(output.status.success());

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[test]
fn stdin_pattern_mismatch_fails_check() {
    let mock = new_mock("reader-regex");
    mock.expect(()).with_stdin(match_pattern("^abc")).and_exit_with(0);

    let mut child = Command::new(mock.path())
        .stdin(Stdio::piped())
        .spawn()
        .expect("spawn");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"xyz")
        .expect("write stdin");
    let status = child.wait().expect("wait");
    assert!(status.success());

    let mut reporter = RecordingReporter::new();
    assert!(!mock.check(&mut reporter));
    assert!(
        reporter
            .logs
            .contains(&"Expected stdin \"^abc\", got \"xyz\"".to_string()),
        "logs: {:?}",
        reporter.logs
    );
    assert_eq!(reporter.errors.len(), 1);
    mock.close().expect("close");
}

#[test]
fn stdin_is_replayed_to_call_handlers() {
    let mock = new_mock("reader-replay");
    mock.expect(()).with_stdin("replay me").and_call_func(|call| {
        let mut stdin = call.stdin();
        let mut buffer = String::new();
        std::io::Read::read_to_string(&mut stdin, &mut buffer).unwrap();
        let mut stdout = call.stdout();
        write!(stdout, "got: {buffer}").unwrap();
        call.exit(0);
    });

    let mut child = Command::new(mock.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"replay me")
        .expect("write stdin");
    let output = child.wait_with_output().expect("wait");
    assert!(output.status.success());
    assert_eq!(output.stdout, b"got: replay me");

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[cfg(unix)]
#[test]
fn passthrough_to_local_echo() {
    let mock = new_mock("echo");
    mock.expect(["hello world"]).and_passthrough_to_local_command("echo");

    let output = Command::new(mock.path())
        .arg("hello world")
        .output()
        .expect("run");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(output.stdout, b"hello world\n");

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[cfg(unix)]
#[test]
fn passthrough_deadline_kills_the_child() {
    let mock = new_mock("sleep");
    mock.expect(["2"]).and_passthrough_to_local_command_with_timeout(
        "sleep",
        std::time::Duration::from_millis(100),
    );

    let output = Command::new(mock.path()).arg("2").output().expect("run");
    assert!(!output.status.success(), "child should have been killed");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("deadline"), "stderr: {stderr}");

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[cfg(unix)]
#[test]
fn mock_level_passthrough_applies_to_matched_calls() {
    let mock = new_mock("echo");
    mock.passthrough_to_local_command().expect("echo should be in PATH");
    mock.expect(["llamas"]).once();

    let output = Command::new(mock.path()).arg("llamas").output().expect("run");
    assert!(output.status.success());
    assert_eq!(output.stdout, b"llamas\n");

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[test]
fn calling_mock_via_relative_path() {
    let mock = new_mock("testmock");
    mock.expect(["blargh"]).exactly(1).and_exit_with(0);

    let dir = mock.path().parent().expect("parent dir").to_path_buf();
    let relative = format!("./{}", mock.name());
    let status = Command::new(relative)
        .arg("blargh")
        .current_dir(dir)
        .status()
        .expect("run");
    assert!(status.success());

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter));
    mock.close().expect("close");
}

#[test]
fn overlapping_expectations_consume_in_declaration_order() {
    let mock = new_mock("overlap");
    mock.expect(["llamas"]).once().and_exit_with(0);
    mock.expect(()).with_any_arguments().exactly(2).and_exit_with(0);

    for args in [["llamas"], ["alpacas"], ["horses"]] {
        let status = Command::new(mock.path()).args(args).status().expect("run");
        assert!(status.success(), "args {args:?}");
    }

    let mut reporter = RecordingReporter::new();
    assert!(mock.check(&mut reporter), "logs: {:?}", reporter.logs);
    mock.close().expect("close");
}

#[test]
fn close_is_idempotent_and_removes_the_file() {
    let mock = new_mock("closable");
    let path = mock.path().to_path_buf();
    assert!(path.exists());

    mock.close().expect("first close");
    assert!(!path.exists(), "published executable should be removed");
    mock.close().expect("second close");
}

#[test]
fn check_and_close_closes_even_when_checks_fail() {
    let mock = new_mock("strict");
    mock.expect(["never-called"]).once();
    let path = mock.path().to_path_buf();

    let mut reporter = RecordingReporter::new();
    let result = mock.check_and_close(&mut reporter);
    assert!(matches!(result, Err(mockbin::MockError::ChecksFailed)));
    assert!(!path.exists());
    assert!(!reporter.is_clean());
}

#[test]
fn invocations_record_their_expectation() {
    let mock = new_mock("recorded");
    mock.expect(["known"]).optionally().and_exit_with(0);

    let known = Command::new(mock.path()).arg("known").status().expect("run");
    assert!(known.success());
    let unknown = Command::new(mock.path()).arg("unknown").status().expect("run");
    assert!(!unknown.success());

    let invocations = mock.invocations();
    assert_eq!(invocations.len(), 2);
    assert!(invocations[0].expectation.is_some());
    assert!(invocations[1].expectation.is_none());
    mock.close().expect("close");
}
