use std::ffi::OsStr;
use std::process::{Command, Output};

use crate::error::ImagingError;

/// Creates a command that never pops up a console window on Windows.
pub fn quiet<S: AsRef<OsStr>>(program: S) -> Command {
    #[allow(unused_mut)]
    let mut command = Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(winapi::um::winbase::CREATE_NO_WINDOW);
    }
    command
}

/// Runs `command` to completion and returns its trimmed stdout.
///
/// On a non-zero exit the error carries stderr, falling back to stdout, falling back to a
/// generic message.
pub fn run(command: &mut Command) -> Result<String, ImagingError> {
    let program = command.get_program().to_string_lossy().into_owned();
    tracing::trace!("Running {program} {:?}", command.get_args().collect::<Vec<_>>());
    let output = command.output().map_err(|source| ImagingError::Spawn {
        program: program.clone(),
        source,
    })?;
    check(&program, output)
}

fn check(program: &str, output: Output) -> Result<String, ImagingError> {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        return Ok(stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        format!("exited with {}", output.status)
    };
    Err(ImagingError::Command {
        program: program.to_string(),
        message,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_run_returns_stdout() {
        let out = run(Command::new("sh").args(["-c", "echo ' hello '"])).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_run_prefers_stderr() {
        let err = run(Command::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .unwrap_err();
        assert_eq!(err.to_string(), "sh failed: err");

        let err = run(Command::new("sh").args(["-c", "exit 4"])).unwrap_err();
        match err {
            ImagingError::Command { message, .. } => assert!(message.contains('4')),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_run_missing_program() {
        let err = run(&mut Command::new("/nonexistent/vdm-no-such-tool")).unwrap_err();
        assert!(matches!(err, ImagingError::Spawn { .. }));
    }
}
