//! Child process handles owned by the supervisor.

use std::{io, process::ExitStatus, time::Duration};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// A named child process.
#[derive(Debug)]
pub struct ManagedChild {
    pub name: &'static str,
    child: Child,
}

impl ManagedChild {
    /// Spawn `command`; the child is killed if its handle is dropped.
    pub fn spawn(name: &'static str, command: &mut Command) -> io::Result<Self> {
        let child = command.kill_on_drop(true).spawn()?;
        info!(name, pid = ?child.id(), "launched child process");
        Ok(Self { name, child })
    }

    /// Exit status if the child has already exited, without blocking.
    pub fn try_exited(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Failures are logged; shutdown continues regardless.
    pub async fn terminate(mut self, grace: Duration) {
        let name = self.name;
        if let Ok(Some(status)) = self.child.try_wait() {
            info!(name, ?status, "child already exited");
            return;
        }

        if let Some(pid) = self.child.id() {
            info!(name, pid, "Sending SIGTERM to child");

            #[cfg(unix)]
            {
                // SAFETY: plain kill(2) on a pid we spawned and have not reaped.
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if rc != 0 {
                    warn!(name, pid, error = %io::Error::last_os_error(), "SIGTERM failed");
                }
            }

            #[cfg(not(unix))]
            {
                let _ = self.child.start_kill();
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(name, ?status, "child exited gracefully"),
            Ok(Err(e)) => warn!(name, error = %e, "Error waiting for child to exit"),
            Err(_) => {
                warn!(
                    name,
                    grace_period_secs = grace.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                if let Err(e) = self.child.kill().await {
                    warn!(name, error = %e, "failed to kill child");
                }
            }
        }
    }
}

/// The proxy and backend processes, as far as they have been started.
#[derive(Debug, Default)]
pub struct Children {
    pub proxy: Option<ManagedChild>,
    pub backend: Option<ManagedChild>,
}

impl Children {
    /// Resolves when any running child exits; pending forever if none run.
    pub async fn wait_any(&mut self) -> (&'static str, io::Result<ExitStatus>) {
        tokio::select! {
            exited = wait_child(self.proxy.as_mut()) => exited,
            exited = wait_child(self.backend.as_mut()) => exited,
        }
    }

    /// Terminate every started child concurrently.
    pub async fn terminate_all(&mut self, grace: Duration) {
        let proxy = self.proxy.take();
        let backend = self.backend.take();
        tokio::join!(
            async {
                if let Some(child) = proxy {
                    child.terminate(grace).await;
                }
            },
            async {
                if let Some(child) = backend {
                    child.terminate(grace).await;
                }
            },
        );
    }
}

async fn wait_child(child: Option<&mut ManagedChild>) -> (&'static str, io::Result<ExitStatus>) {
    match child {
        Some(child) => (child.name, child.wait().await),
        None => std::future::pending().await,
    }
}
