#![forbid(unsafe_code)]

//! Runs the built `deferred-demo` binary against real files.

use std::fs;
use std::process::{Command, Output};

fn demo(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_deferred-demo"))
        .args(args)
        .env_remove("DEFERRED_LOG")
        .output()
        .expect("run deferred-demo")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn prints_count_preview_and_done() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("index.js");
    fs::write(&path, "console.log('deferred values');\n").expect("write input");

    let output = demo(&[path.to_str().expect("utf-8 path"), "--delay-ms", "10"]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(
        stdout(&output),
        "32 characters read\ncnsl.lg('dfrrd vls');\n\n===All done===\n"
    );
}

#[test]
fn preview_chars_limits_output() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("long.txt");
    fs::write(&path, "bcd".repeat(1_000)).expect("write input");

    let output = demo(&[
        path.to_str().expect("utf-8 path"),
        "--delay-ms",
        "0",
        "--preview-chars",
        "7",
    ]);

    assert!(output.status.success());
    let text = stdout(&output);
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines, vec!["3000 characters read", "bcdbcdb", "===All done==="]);
}

#[test]
fn missing_file_exits_nonzero_after_cleanup() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("indexs.js");

    let output = demo(&[path.to_str().expect("utf-8 path"), "--delay-ms", "0"]);

    assert_eq!(output.status.code(), Some(1));
    assert_eq!(stdout(&output), "===All done===\n");
    let err = stderr(&output);
    assert!(err.contains("An error occurred!"), "stderr: {err}");
    assert!(err.contains("indexs.js"), "stderr: {err}");
    assert!(err.contains("pipeline failed for"), "stderr: {err}");
}

#[test]
fn missing_path_argument_is_a_usage_error() {
    let output = demo(&[]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("Usage"));
}
