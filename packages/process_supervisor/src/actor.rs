use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use crate::error::ProcessError;

/// Configuration for spawning a supervised child process.
#[derive(Clone, Debug, Default)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
}

/// Point-in-time state of a supervised process.
#[derive(Clone, Debug)]
pub struct ProcessState {
    pub running: bool,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
}

enum ProcessMessage {
    GetState {
        respond_to: oneshot::Sender<ProcessState>,
    },
    Kill {
        signal: Option<String>,
        respond_to: oneshot::Sender<Result<(), ProcessError>>,
    },
}

/// Handle to a running process actor. Cloning shares the same process.
#[derive(Clone)]
pub struct ProcessHandle {
    sender: mpsc::Sender<ProcessMessage>,
    exited: watch::Receiver<bool>,
}

impl ProcessHandle {
    /// Current state of the process as observed by its actor.
    pub async fn state(&self) -> Result<ProcessState, ProcessError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProcessMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| ProcessError::ActorGone)?;
        rx.await.map_err(|_| ProcessError::ActorGone)
    }

    /// Signal the process. `None` and `Some("SIGTERM")` request a portable
    /// graceful terminate; `Some("SIGKILL")` requests a portable forceful
    /// kill. A process that has already exited is treated as a success,
    /// not an error.
    pub async fn kill(&self, signal: Option<&str>) -> Result<(), ProcessError> {
        if self.has_exited() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProcessMessage::Kill {
                signal: signal.map(|s| s.to_string()),
                respond_to: tx,
            })
            .await
            .map_err(|_| ProcessError::ActorGone)?;
        rx.await.map_err(|_| ProcessError::ActorGone)?
    }

    /// True once the actor has observed process exit.
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolves once the actor observes process exit. Used by the owning
    /// lifecycle engine's exit-observer; it must not touch persisted state.
    pub async fn wait_exited(&mut self) {
        if self.has_exited() {
            return;
        }
        let _ = self.exited.changed().await;
    }
}

/// The actor task owning a single `tokio::process::Child`.
pub struct ProcessActor {
    child: Child,
    state: ProcessState,
    receiver: mpsc::Receiver<ProcessMessage>,
    exited_tx: watch::Sender<bool>,
}

impl ProcessActor {
    /// Spawn a child process and return a handle to its actor.
    pub fn spawn(config: ProcessConfig) -> Result<ProcessHandle, ProcessError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(false);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "spawning process: {} {:?} (cwd: {:?})",
            config.command, config.args, config.working_dir
        );

        let child = cmd.spawn().map_err(|e| {
            error!("failed to spawn '{}': {}", config.command, e);
            ProcessError::SpawnFailed(e.to_string())
        })?;

        let pid = child.id();
        info!("process started with pid: {:?}", pid);

        let state = ProcessState {
            running: true,
            pid,
            command: config.command.clone(),
            args: config.args.clone(),
        };

        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (exited_tx, exited_rx) = watch::channel(false);

        let actor = ProcessActor {
            child,
            state,
            receiver: msg_rx,
            exited_tx,
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        Ok(ProcessHandle {
            sender: msg_tx,
            exited: exited_rx,
        })
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_msg = self.receiver.recv() => {
                    match maybe_msg {
                        Some(ProcessMessage::GetState { respond_to }) => {
                            let _ = respond_to.send(self.state.clone());
                        }
                        Some(ProcessMessage::Kill { signal, respond_to }) => {
                            let result = self.handle_kill(signal.as_deref());
                            let _ = respond_to.send(result);
                        }
                        None => break,
                    }
                }
                status = self.child.wait() => {
                    info!("process exited: {:?}", status);
                    self.state.running = false;
                    self.state.pid = None;
                    let _ = self.exited_tx.send(true);
                    break;
                }
            }
        }

        // Drain so late callers get a deterministic reply instead of a hang.
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                ProcessMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.state.clone());
                }
                ProcessMessage::Kill { respond_to, .. } => {
                    let _ = respond_to.send(Ok(()));
                }
            }
        }
    }

    fn handle_kill(&mut self, signal: Option<&str>) -> Result<(), ProcessError> {
        match signal {
            Some("SIGTERM") | None => {
                #[cfg(unix)]
                {
                    use nix::errno::Errno;
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    if let Some(pid) = self.state.pid {
                        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                            Ok(()) | Err(Errno::ESRCH) => {}
                            Err(e) => return Err(ProcessError::KillFailed(e.to_string())),
                        }
                    }
                }
                #[cfg(not(unix))]
                {
                    if let Err(e) = self.child.start_kill() {
                        warn!("start_kill failed (process may already be gone): {}", e);
                    }
                }
            }
            Some("SIGKILL") => {
                if let Err(e) = self.child.start_kill() {
                    warn!("start_kill failed (process may already be gone): {}", e);
                }
            }
            Some(sig) => {
                return Err(ProcessError::KillFailed(format!(
                    "unsupported signal: {sig}"
                )));
            }
        }

        self.state.running = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_and_observe_exit() {
        let config = ProcessConfig {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exit 0".to_string()],
            working_dir: None,
            env: vec![],
        };
        let mut handle = ProcessActor::spawn(config).unwrap();
        handle.wait_exited().await;
        assert!(handle.has_exited());
        let state = handle.state().await.unwrap();
        assert!(!state.running);
    }

    #[tokio::test]
    async fn kill_terminates_a_sleeping_process() {
        let config = ProcessConfig {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            working_dir: None,
            env: vec![],
        };
        let mut handle = ProcessActor::spawn(config).unwrap();
        let state = handle.state().await.unwrap();
        assert!(state.running);

        handle.kill(Some("SIGKILL")).await.unwrap();
        handle.wait_exited().await;
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn kill_on_already_exited_process_is_not_an_error() {
        let config = ProcessConfig {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exit 0".to_string()],
            working_dir: None,
            env: vec![],
        };
        let mut handle = ProcessActor::spawn(config).unwrap();
        handle.wait_exited().await;
        handle.kill(Some("SIGTERM")).await.unwrap();
    }

    #[tokio::test]
    async fn custom_env_is_visible_to_the_child() {
        let config = ProcessConfig {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "[ \"$FOO\" = \"bar\" ]".to_string()],
            working_dir: None,
            env: vec![("FOO".to_string(), "bar".to_string())],
        };
        let mut handle = ProcessActor::spawn(config).unwrap();
        handle.wait_exited().await;
        let state = handle.state().await.unwrap();
        assert!(!state.running);
    }
}
