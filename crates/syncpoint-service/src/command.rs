// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Subprocess plumbing: shell quoting, `{placeholder}` templates, and a
//! captured-output bash runner.

use std::process::Stdio;

use tokio::process::Command;

use crate::error::{ShellError, ShellResult};

/// Quotes a string for safe interpolation into a POSIX shell command line.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Captured stdout, trailing whitespace trimmed.
    pub stdout: String,
    /// Captured stderr, trailing whitespace trimmed.
    pub stderr: String,
}

impl CommandOutput {
    /// True iff the process exited with code zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Converts a non-zero exit into a [`ShellError`], tagging it with the
    /// host the command ran against.
    pub fn into_checked(self, host: &str) -> ShellResult<String> {
        match self.code {
            Some(0) => Ok(self.stdout),
            Some(code) => Err(ShellError::NonZeroExit {
                host: host.to_owned(),
                code,
                stderr: self.stderr,
            }),
            None => Err(ShellError::Signalled {
                host: host.to_owned(),
            }),
        }
    }
}

/// Runs a program with arguments, capturing stdout and stderr.
pub async fn run_command(
    program: &str,
    args: &[&str],
    envs: &[(&str, &str)],
) -> ShellResult<CommandOutput> {
    let output = Command::new(program)
        .args(args)
        .envs(envs.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ShellError::Spawn {
            program: program.to_owned(),
            source,
        })?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_owned(),
    })
}

/// Runs a script under a clean, non-interactive bash.
pub async fn run_bash(script: &str) -> ShellResult<CommandOutput> {
    run_command("bash", &["--noprofile", "--norc", "-c", script], &[]).await
}

/// A command template with named `{placeholder}` slots.
///
/// Substitution is literal text replacement; every value is shell-quoted
/// before insertion, so the rendered string is safe to hand to a shell.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    template: String,
}

impl CommandTemplate {
    /// Wraps a template string.
    pub fn new(template: impl Into<String>) -> Self {
        CommandTemplate {
            template: template.into(),
        }
    }

    /// Renders the template with the given placeholder values.
    ///
    /// Unknown placeholders are left untouched; the shell will fail loudly on
    /// them, which beats silently probing the wrong path.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut rendered = self.template.clone();
        for (name, value) in vars {
            rendered = rendered.replace(&format!("{{{name}}}"), &sh_quote(value));
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use syncpoint_test_utils::param_test;

    use super::*;

    param_test! {
        quoting: [
            plain: ("abc", "'abc'"),
            embedded_quote: ("it's", r#"'it'"'"'s'"#),
            empty: ("", "''"),
            spaces: ("a b", "'a b'"),
        ]
    }
    fn quoting(input: &str, expected: &str) {
        assert_eq!(sh_quote(input), expected);
    }

    #[test]
    fn template_substitutes_and_quotes() {
        let template = CommandTemplate::new("ssh {host} test -f {wal_path} && echo ok");
        let rendered = template.render(&[
            ("host", "prim-a"),
            ("wal_path", "/archive/0000000100000009"),
        ]);
        assert_eq!(
            rendered,
            "ssh 'prim-a' test -f '/archive/0000000100000009' && echo ok"
        );
    }

    #[test]
    fn template_leaves_unknown_placeholders() {
        let template = CommandTemplate::new("fetch {manifest_path} --to {dest}");
        let rendered = template.render(&[("manifest_path", "/m/x.json")]);
        assert_eq!(rendered, "fetch '/m/x.json' --to {dest}");
    }

    #[tokio::test]
    async fn run_bash_captures_output_and_code() {
        let ok = run_bash("echo hello").await.unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout, "hello");

        let fail = run_bash("echo oops >&2; exit 3").await.unwrap();
        assert_eq!(fail.code, Some(3));
        assert_eq!(fail.stderr, "oops");
        assert!(fail.into_checked("localhost").is_err());
    }
}
