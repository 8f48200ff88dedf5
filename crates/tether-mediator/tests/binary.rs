//! Behaviour of the mediator executable itself

use std::process::{Command, Stdio};

fn mediator() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tether-mediator"));
    cmd.env("RUST_LOG", "info")
        .env_remove("TETHER_ASKPASS_PASSWORD")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

#[cfg(unix)]
#[test]
fn test_mediator_leads_its_own_process_group() {
    let child = mediator().spawn().unwrap();
    let pid = child.id();
    let output = child.wait_with_output().unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains(&format!("Running in process group {}", pid)),
        "stderr: {}",
        stderr
    );
}

#[test]
fn test_missing_launch_argument_exits_with_failure() {
    let output = mediator().output().unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Missing launch argument"));
}

#[test]
fn test_askpass_mode_prints_password() {
    let output = mediator()
        .env("TETHER_ASKPASS_PASSWORD", "hunter2")
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hunter2\n");
}
