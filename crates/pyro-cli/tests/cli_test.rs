//! CLI Integration Tests
//!
//! Runs the `pyro` binary:
//! 1. `echo-server` starts and prints its URI
//! 2. `ping` and `call` work against it
//! 3. bad arguments fail with a non-zero exit code

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Output, Stdio};

/// Kills the server process when dropped.
struct EchoServerProcess {
    child: Child,
    uri: String,
}

impl EchoServerProcess {
    fn start(extra: &[&str]) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_pyro"))
            .arg("echo-server")
            .args(["-b", "127.0.0.1:0"])
            .args(extra)
            .env("RUST_LOG", "warn")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut uri = String::new();
        BufReader::new(stdout).read_line(&mut uri).unwrap();
        Self {
            child,
            uri: uri.trim().to_string(),
        }
    }
}

impl Drop for EchoServerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn pyro(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pyro")).args(args).output().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_echo_server_ping_and_call() {
    let server = EchoServerProcess::start(&[]);
    assert!(server.uri.starts_with("PYRO:test.echoserver@127.0.0.1:"), "{}", server.uri);

    let ping = pyro(&["ping", &server.uri]);
    assert!(ping.status.success());
    assert!(stdout(&ping).contains("is alive"));

    let call = pyro(&["call", &server.uri, "echo", "-a", "[\"hello\"]"]);
    assert!(call.status.success());
    assert_eq!(stdout(&call).trim(), "\"hello\"");

    let stream = pyro(&["call", &server.uri, "generator"]);
    assert!(stream.status.success());
    assert_eq!(stdout(&stream).lines().collect::<Vec<_>>(), vec!["\"one\"", "\"two\"", "\"three\""]);
}

#[test]
fn test_multiplexed_echo_server() {
    let server = EchoServerProcess::start(&["--multiplexed"]);
    let call = pyro(&["call", &server.uri, "echo", "-a", "[42]"]);
    assert!(call.status.success());
    assert_eq!(stdout(&call).trim(), "42");
}

#[test]
fn test_remote_error_exits_nonzero() {
    let server = EchoServerProcess::start(&[]);
    let call = pyro(&["call", &server.uri, "error"]);
    assert!(!call.status.success());
    assert!(String::from_utf8_lossy(&call.stderr).contains("ValueError"));

    let unknown = pyro(&["call", &server.uri, "no_such_method"]);
    assert!(!unknown.status.success());
}

#[test]
fn test_invalid_arguments() {
    assert!(!pyro(&["call", "not a uri", "echo"]).status.success());
    assert!(!pyro(&["call", "PYRO:x@127.0.0.1:1", "echo", "-a", "{}"]).status.success());
    assert!(!pyro(&["echo-server", "-b", "no-port"]).status.success());
}
