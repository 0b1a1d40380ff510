//! Demoted, timeout-bounded execution of materialized grading scripts.
//!
//! The runner launches the script under the configured interpreter with
//! stdout/stderr piped to the parent, demotes the child to the resolved
//! student identity between fork and exec, and enforces a hard wall-clock
//! budget. The parent's own credentials are never touched.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::identity::Demotion;

/// Raw capture of one grading run.
#[derive(Debug, Clone)]
pub enum Captured {
    /// The child exited within the budget; pipes were drained to EOF.
    Exited {
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    /// The child was killed at the budget boundary. Partial output is
    /// discarded — output from a killed process is not scoreable.
    TimedOut,
}

/// Credential-drop syscalls, abstracted so the sequence is testable.
#[cfg(unix)]
pub trait CredentialOps {
    fn set_gid(&mut self, gid: nix::unistd::Gid) -> std::io::Result<()>;
    fn set_groups(&mut self, groups: &[nix::unistd::Gid]) -> std::io::Result<()>;
    fn set_uid(&mut self, uid: nix::unistd::Uid) -> std::io::Result<()>;
}

/// Credentials to drop to, preconverted so the post-fork hook does not
/// allocate.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct DemotionPlan {
    gid: nix::unistd::Gid,
    groups: Vec<nix::unistd::Gid>,
    uid: nix::unistd::Uid,
}

#[cfg(unix)]
impl DemotionPlan {
    pub fn new(identity: &crate::identity::OsIdentity) -> Self {
        use nix::unistd::{Gid, Uid};
        Self {
            gid: Gid::from_raw(identity.gid),
            groups: identity.groups.iter().copied().map(Gid::from_raw).collect(),
            uid: Uid::from_raw(identity.uid),
        }
    }

    /// Drop credentials in the only safe order: gid, supplementary
    /// groups, then uid. Once the uid is dropped the process can no
    /// longer change its groups, so reversing this silently retains
    /// group privilege.
    pub fn apply(&self, ops: &mut impl CredentialOps) -> std::io::Result<()> {
        ops.set_gid(self.gid)?;
        ops.set_groups(&self.groups)?;
        ops.set_uid(self.uid)?;
        Ok(())
    }
}

/// `CredentialOps` backed by real syscalls. Runs in the child between
/// fork and exec; each call is a thin syscall wrapper.
#[cfg(unix)]
struct SysCredentials;

#[cfg(unix)]
impl CredentialOps for SysCredentials {
    fn set_gid(&mut self, gid: nix::unistd::Gid) -> std::io::Result<()> {
        nix::unistd::setgid(gid).map_err(Into::into)
    }

    fn set_groups(&mut self, groups: &[nix::unistd::Gid]) -> std::io::Result<()> {
        nix::unistd::setgroups(groups).map_err(Into::into)
    }

    fn set_uid(&mut self, uid: nix::unistd::Uid) -> std::io::Result<()> {
        nix::unistd::setuid(uid).map_err(Into::into)
    }
}

/// Runs grading scripts as child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    interpreter: String,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(interpreter: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute a materialized script under the given demotion.
    ///
    /// The child's working directory is the script's containing
    /// directory. When demoting, HOME/LOGNAME/USER/SHELL are rebuilt
    /// from the resolved identity instead of inheriting the grading
    /// server's own identity fields.
    #[instrument(skip(self, demotion), fields(interpreter = %self.interpreter))]
    pub async fn run(&self, script: &Path, demotion: &Demotion) -> Result<Captured> {
        let script_dir = script
            .parent()
            .context("Grading script path has no parent directory")?;
        let script_name = script
            .file_name()
            .context("Grading script path has no file name")?;

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(script_name)
            .current_dir(script_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match demotion {
            Demotion::Drop(identity) => {
                cmd.env("HOME", &identity.home)
                    .env("LOGNAME", &identity.login)
                    .env("USER", &identity.login)
                    .env("SHELL", &identity.shell);
                self.demote(&mut cmd, identity);
            }
            Demotion::Unavailable => {
                warn!("Running grading script without privilege demotion");
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn interpreter: {}", self.interpreter))?;

        // Take pipe handles out so `child` stays in scope for kill-on-timeout
        let mut child_stdout = child.stdout.take().context("Failed to open stdout")?;
        let mut child_stderr = child.stderr.take().context("Failed to open stderr")?;

        // Drain both pipes AND await exit under one deadline. Pipe EOF
        // alone is not proof of exit: a child can close its own ends and
        // keep running, so the wait itself must sit inside the budget.
        // `child` is not moved into this future, so we can kill it on timeout.
        let run_to_exit = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (r1, r2) = tokio::join!(
                child_stdout.read_to_end(&mut stdout_buf),
                child_stderr.read_to_end(&mut stderr_buf),
            );
            r1.context("Failed to read stdout")?;
            r2.context("Failed to read stderr")?;
            let status = child.wait().await.context("Failed to wait for process")?;
            Ok::<_, anyhow::Error>((stdout_buf, stderr_buf, status))
        };

        let Ok(run_result) = tokio::time::timeout(self.timeout, run_to_exit).await else {
            let _ = child.kill().await;
            debug!(budget = ?self.timeout, "Grading run exceeded budget, child killed");
            return Ok(Captured::TimedOut);
        };
        let (stdout_buf, stderr_buf, status) = run_result?;
        let exit_code = status.code().unwrap_or(-1);

        debug!(exit_code, "Grading run completed");

        Ok(Captured::Exited {
            exit_code,
            stdout: stdout_buf,
            stderr: stderr_buf,
        })
    }

    #[cfg(unix)]
    fn demote(&self, cmd: &mut Command, identity: &crate::identity::OsIdentity) {
        let plan = DemotionPlan::new(identity);
        // SAFETY: the hook runs in the child after fork(). The plan is
        // preconverted in the parent and apply() only issues setgid /
        // setgroups / setuid syscalls, no allocation.
        unsafe {
            cmd.pre_exec(move || plan.apply(&mut SysCredentials));
        }
    }

    #[cfg(not(unix))]
    fn demote(&self, _cmd: &mut Command, _identity: &crate::identity::OsIdentity) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    async fn write_script(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("grading_script.py");
        tokio::fs::write(&path, body).await.unwrap();
        path
    }

    fn sh_runner(timeout: Duration) -> ProcessRunner {
        ProcessRunner::new("sh", timeout)
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo hello\necho oops 1>&2\n").await;

        let runner = sh_runner(Duration::from_secs(5));
        let captured = runner.run(&script, &Demotion::Unavailable).await.unwrap();

        match captured {
            Captured::Exited {
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(exit_code, 0);
                assert_eq!(stdout, b"hello\n");
                assert_eq!(stderr, b"oops\n");
            }
            Captured::TimedOut => panic!("run should not time out"),
        }
    }

    #[tokio::test]
    async fn reports_nonzero_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit 3\n").await;

        let runner = sh_runner(Duration::from_secs(5));
        let captured = runner.run(&script, &Demotion::Unavailable).await.unwrap();

        assert!(matches!(captured, Captured::Exited { exit_code: 3, .. }));
    }

    #[tokio::test]
    async fn kills_child_at_budget_and_discards_output() {
        let dir = tempfile::tempdir().unwrap();
        // Prints before sleeping: partial output must still be discarded
        let script = write_script(dir.path(), "echo partial\nsleep 30\n").await;

        let runner = sh_runner(Duration::from_millis(300));
        let started = std::time::Instant::now();
        let captured = runner.run(&script, &Demotion::Unavailable).await.unwrap();

        assert!(matches!(captured, Captured::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn budget_bounds_child_exit_not_just_pipe_eof() {
        let dir = tempfile::tempdir().unwrap();
        // Child closes both pipes then keeps running: EOF must not be
        // mistaken for exit
        let script = write_script(dir.path(), "exec >&- 2>&-\nsleep 30\n").await;

        let runner = sh_runner(Duration::from_millis(300));
        let started = std::time::Instant::now();
        let captured = runner.run(&script, &Demotion::Unavailable).await.unwrap();

        assert!(matches!(captured, Captured::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn runs_in_script_directory() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("marker.txt"), "here")
            .await
            .unwrap();
        let script = write_script(dir.path(), "cat marker.txt\n").await;

        let runner = sh_runner(Duration::from_secs(5));
        let captured = runner.run(&script, &Demotion::Unavailable).await.unwrap();

        match captured {
            Captured::Exited { stdout, .. } => assert_eq!(stdout, b"here"),
            Captured::TimedOut => panic!("run should not time out"),
        }
    }

    #[tokio::test]
    async fn missing_interpreter_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo hi\n").await;

        let runner = ProcessRunner::new("no-such-interpreter-xyzzy", Duration::from_secs(1));
        assert_err!(runner.run(&script, &Demotion::Unavailable).await);
    }

    #[cfg(unix)]
    mod demotion {
        use super::super::*;
        use crate::identity::OsIdentity;
        use nix::unistd::{Gid, Uid};

        #[derive(Default)]
        struct RecordingOps {
            calls: Vec<String>,
        }

        impl CredentialOps for RecordingOps {
            fn set_gid(&mut self, gid: Gid) -> std::io::Result<()> {
                self.calls.push(format!("setgid({gid})"));
                Ok(())
            }

            fn set_groups(&mut self, groups: &[Gid]) -> std::io::Result<()> {
                self.calls.push(format!("setgroups({})", groups.len()));
                Ok(())
            }

            fn set_uid(&mut self, uid: Uid) -> std::io::Result<()> {
                self.calls.push(format!("setuid({uid})"));
                Ok(())
            }
        }

        fn identity() -> OsIdentity {
            OsIdentity {
                login: "alice".to_string(),
                uid: 1000,
                gid: 1000,
                groups: vec![1000, 27, 100],
                home: "/home/alice".into(),
                shell: "/bin/bash".into(),
            }
        }

        #[test]
        fn drop_order_is_gid_groups_uid() {
            let plan = DemotionPlan::new(&identity());
            let mut ops = RecordingOps::default();
            plan.apply(&mut ops).unwrap();

            assert_eq!(
                ops.calls,
                vec!["setgid(1000)", "setgroups(3)", "setuid(1000)"]
            );
        }

        #[test]
        fn failed_gid_drop_aborts_before_uid() {
            struct FailingGid(Vec<String>);

            impl CredentialOps for FailingGid {
                fn set_gid(&mut self, _gid: Gid) -> std::io::Result<()> {
                    self.0.push("setgid".to_string());
                    Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
                }
                fn set_groups(&mut self, _groups: &[Gid]) -> std::io::Result<()> {
                    self.0.push("setgroups".to_string());
                    Ok(())
                }
                fn set_uid(&mut self, _uid: Uid) -> std::io::Result<()> {
                    self.0.push("setuid".to_string());
                    Ok(())
                }
            }

            let plan = DemotionPlan::new(&identity());
            let mut ops = FailingGid(Vec::new());
            assert!(plan.apply(&mut ops).is_err());
            // Nothing after the failed gid drop may run
            assert_eq!(ops.0, vec!["setgid"]);
        }

        #[test]
        fn plan_carries_full_supplementary_list() {
            let plan = DemotionPlan::new(&identity());
            assert_eq!(plan.groups.len(), 3);
            assert_eq!(plan.gid, Gid::from_raw(1000));
            assert_eq!(plan.uid, Uid::from_raw(1000));
        }
    }
}
