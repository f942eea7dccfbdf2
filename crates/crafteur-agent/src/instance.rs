use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use crafteur_process::{ConsoleEvent, ServerStats, ServerStatus};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{Mutex, mpsc, watch},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    console::{Console, SubscriberId, Subscription},
    error::InstanceError,
    launch::JvmArgs,
    players::{ConnectedPlayers, PlayerLogParser, VanillaLogPatterns},
    resources::ResourceSampler,
};

pub const START_MARKER: &str = "--- PROCESS START ---";
pub const GRACEFUL_EXIT_MARKER: &str = "--- PROCESS STOPPED GRACEFULLY ---";
pub const CRASH_MARKER_PREFIX: &str = "--- CRASH/STOP ERROR:";

const STOP_COMMAND: &str = "stop";
const LINE_QUEUE: usize = 256;
/// How long a graceful `stop` may wait on the console pipe before the process is killed.
const STOP_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct InstanceOptions {
    /// Launcher executable, normally `java`.
    pub java_bin: String,
    pub subscriber_capacity: usize,
    pub stats_interval: Duration,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            java_bin: "java".to_string(),
            subscriber_capacity: 100,
            stats_interval: Duration::from_secs(1),
        }
    }
}

/// Handles that exist only while a process is alive; dropped when the exit is observed.
#[derive(Debug)]
struct ProcessHandle {
    pid: Option<u32>,
    /// Writers clone this and write without holding `runtime`.
    stdin: Arc<Mutex<ChildStdin>>,
}

#[derive(Debug)]
struct Runtime {
    status: ServerStatus,
    jvm_args: JvmArgs,
    /// Set from `Starting` until the exit is observed. Cancelling it kills the process,
    /// or the process-to-be if the spawn is still in flight.
    kill: Option<CancellationToken>,
    process: Option<ProcessHandle>,
}

/// Runtime wrapper around one supervised server process.
///
/// Lock order: `runtime` may be held while taking `console`, never the reverse.
/// Broadcasting only needs `console`. No pipe I/O happens while `runtime` is held.
#[derive(Debug)]
pub struct Instance {
    id: String,
    run_dir: PathBuf,
    artifact: String,
    options: InstanceOptions,
    player_parser: Arc<dyn PlayerLogParser>,
    runtime: Mutex<Runtime>,
    status_tx: watch::Sender<ServerStatus>,
    console: Mutex<Console>,
    players: Mutex<ConnectedPlayers>,
}

impl Instance {
    pub fn new(
        id: impl Into<String>,
        run_dir: impl Into<PathBuf>,
        artifact: impl Into<String>,
        options: InstanceOptions,
    ) -> Self {
        let (status_tx, _) = watch::channel(ServerStatus::Stopped);
        Self {
            id: id.into(),
            run_dir: run_dir.into(),
            artifact: artifact.into(),
            console: Mutex::new(Console::new(options.subscriber_capacity)),
            options,
            player_parser: Arc::new(VanillaLogPatterns),
            runtime: Mutex::new(Runtime {
                status: ServerStatus::Stopped,
                jvm_args: JvmArgs::default(),
                kill: None,
                process: None,
            }),
            status_tx,
            players: Mutex::new(ConnectedPlayers::default()),
        }
    }

    pub fn with_player_parser(mut self, parser: Arc<dyn PlayerLogParser>) -> Self {
        self.player_parser = parser;
        self
    }

    pub fn with_jvm_args(mut self, args: JvmArgs) -> Self {
        self.runtime.get_mut().jvm_args = args;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    pub async fn status(&self) -> ServerStatus {
        self.runtime.lock().await.status
    }

    pub async fn pid(&self) -> Option<u32> {
        self.runtime
            .lock()
            .await
            .process
            .as_ref()
            .and_then(|p| p.pid)
    }

    pub async fn jvm_args(&self) -> JvmArgs {
        self.runtime.lock().await.jvm_args.clone()
    }

    pub async fn players(&self) -> Vec<String> {
        self.players.lock().await.names()
    }

    /// Waits until the instance reports `target`; `false` on timeout.
    pub async fn wait_for_status(&self, target: ServerStatus, timeout: Duration) -> bool {
        let mut rx = self.status_tx.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await {
            Ok(res) => res.is_ok(),
            Err(_) => false,
        }
    }

    /// Status changes are published while `runtime` is held so subscribers see them in order.
    async fn transition(&self, rt: &mut Runtime, next: ServerStatus) {
        if !rt.status.can_transition_to(next) {
            tracing::warn!(server_id = %self.id, from = %rt.status, to = %next, "unexpected status transition");
        }
        rt.status = next;
        self.console
            .lock()
            .await
            .publish(ConsoleEvent::Status(next));
        self.status_tx.send_replace(next);
    }

    async fn revert_to_stopped(&self) {
        let mut rt = self.runtime.lock().await;
        rt.kill = None;
        rt.process = None;
        self.transition(&mut rt, ServerStatus::Stopped).await;
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), InstanceError> {
        let kill = CancellationToken::new();
        let (args, ram_max) = {
            let mut rt = self.runtime.lock().await;
            if rt.status != ServerStatus::Stopped {
                return Err(InstanceError::AlreadyRunning);
            }
            rt.kill = Some(kill.clone());
            self.transition(&mut rt, ServerStatus::Starting).await;
            (
                rt.jvm_args.command_args(&self.artifact),
                rt.jvm_args.max_heap_bytes(),
            )
        };

        let mut cmd = Command::new(&self.options.java_bin);
        cmd.current_dir(&self.run_dir)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        tracing::info!(
            server_id = %self.id,
            exec = %self.options.java_bin,
            args = %args.join(" "),
            cwd = %self.run_dir.display(),
            "starting server process"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(server_id = %self.id, error = %err, "spawn failed");
                self.revert_to_stopped().await;
                return Err(InstanceError::Spawn(err));
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.revert_to_stopped().await;
            return Err(InstanceError::Pipe("stdio"));
        };

        let pid = child.id();
        let exited = CancellationToken::new();
        {
            let mut rt = self.runtime.lock().await;
            rt.process = Some(ProcessHandle {
                pid,
                stdin: Arc::new(Mutex::new(stdin)),
            });
            self.transition(&mut rt, ServerStatus::Running).await;
            self.console.lock().await.push_line(START_MARKER.to_string());
        }
        tracing::info!(server_id = %self.id, pid = ?pid, "server process running");

        // stdout and stderr are merged into one ordered queue drained by a single pump.
        let (line_tx, line_rx) = mpsc::channel::<String>(LINE_QUEUE);
        spawn_line_reader(stdout, line_tx.clone());
        spawn_line_reader(stderr, line_tx);

        tokio::spawn(self.clone().pump_output(child, line_rx, kill, exited.clone()));
        if let Some(pid) = pid {
            tokio::spawn(self.clone().sample_resources(pid, ram_max, exited));
        }

        Ok(())
    }

    async fn pump_output(
        self: Arc<Self>,
        mut child: Child,
        mut lines: mpsc::Receiver<String>,
        kill: CancellationToken,
        exited: CancellationToken,
    ) {
        let mut killed = false;
        loop {
            tokio::select! {
                line = lines.recv() => match line {
                    Some(line) => self.ingest_line(line).await,
                    None => break,
                },
                _ = kill.cancelled(), if !killed => {
                    killed = true;
                    self.force_kill(&mut child);
                }
            }
        }

        let exit = loop {
            tokio::select! {
                res = child.wait() => break res,
                _ = kill.cancelled(), if !killed => {}
            }
            killed = true;
            self.force_kill(&mut child);
        };

        self.finish_run(exit, exited).await;
    }

    fn force_kill(&self, child: &mut Child) {
        tracing::warn!(server_id = %self.id, "killing server process");
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // The child leads its own session, so this takes down anything it spawned too.
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
        }
        if let Err(err) = child.start_kill() {
            tracing::debug!(server_id = %self.id, error = %err, "start_kill failed");
        }
    }

    async fn ingest_line(&self, line: String) {
        if let Some(event) = self.player_parser.parse(&line) {
            self.players.lock().await.apply(event);
        }
        self.console.lock().await.push_line(line);
    }

    async fn finish_run(&self, exit: std::io::Result<ExitStatus>, exited: CancellationToken) {
        self.players.lock().await.clear();

        let marker = match &exit {
            Ok(status) if status.success() => {
                tracing::info!(server_id = %self.id, "server process exited");
                GRACEFUL_EXIT_MARKER.to_string()
            }
            Ok(status) => {
                tracing::warn!(server_id = %self.id, %status, "server process exited abnormally");
                format!("{CRASH_MARKER_PREFIX} {status} ---")
            }
            Err(err) => {
                tracing::warn!(server_id = %self.id, error = %err, "wait on server process failed");
                format!("{CRASH_MARKER_PREFIX} {err} ---")
            }
        };
        self.console.lock().await.push_line(marker);

        let mut rt = self.runtime.lock().await;
        rt.kill = None;
        rt.process = None;
        self.transition(&mut rt, ServerStatus::Stopped).await;
        drop(rt);
        exited.cancel();
    }

    async fn sample_resources(self: Arc<Self>, pid: u32, ram_max: u64, exited: CancellationToken) {
        let mut sampler = ResourceSampler::new(pid);
        let mut ticker = tokio::time::interval(self.options.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = exited.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.status().await != ServerStatus::Running {
                break;
            }
            let Some(sample) = sampler.sample().await else {
                tracing::debug!(server_id = %self.id, pid, "resource sampling stopped");
                break;
            };
            self.console
                .lock()
                .await
                .publish(ConsoleEvent::Stats(ServerStats {
                    cpu: sample.cpu,
                    ram: sample.rss_bytes,
                    ram_max,
                }));
        }
    }

    /// Requests shutdown and returns without waiting for the process to exit.
    ///
    /// A running server moves to `Stopping` and gets `stop` on stdin; the exit watcher
    /// moves it to `Stopped` later. If that write fails or does not complete within
    /// `STOP_WRITE_TIMEOUT`, the process is killed instead. From `Starting` or
    /// `Stopping` the process is killed right away (a spawn still in flight is killed as
    /// soon as it exists).
    pub async fn stop(&self) -> Result<(), InstanceError> {
        let stdin = {
            let mut rt = self.runtime.lock().await;
            match rt.status {
                ServerStatus::Stopped => return Ok(()),
                ServerStatus::Running => {
                    let stdin = rt.process.as_ref().map(|p| p.stdin.clone());
                    self.transition(&mut rt, ServerStatus::Stopping).await;
                    stdin
                }
                ServerStatus::Starting | ServerStatus::Stopping => None,
            }
        };

        if let Some(stdin) = stdin {
            match tokio::time::timeout(STOP_WRITE_TIMEOUT, write_line(&stdin, STOP_COMMAND)).await {
                Ok(Ok(())) => {
                    tracing::info!(server_id = %self.id, "graceful stop requested");
                    return Ok(());
                }
                Ok(Err(err)) => {
                    tracing::warn!(server_id = %self.id, error = %err, "graceful stop failed; killing process");
                }
                Err(_) => {
                    tracing::warn!(server_id = %self.id, "console pipe blocked; killing process");
                }
            }
        }

        self.kill().await
    }

    /// Forcibly terminates the process; returns once the kill is issued.
    pub async fn kill(&self) -> Result<(), InstanceError> {
        let rt = self.runtime.lock().await;
        if rt.status == ServerStatus::Stopped {
            return Ok(());
        }
        rt.kill
            .as_ref()
            .ok_or(InstanceError::NotRunning)?
            .cancel();
        Ok(())
    }

    pub async fn send_command(&self, text: &str) -> Result<(), InstanceError> {
        let stdin = {
            let rt = self.runtime.lock().await;
            if rt.status != ServerStatus::Running {
                return Err(InstanceError::NotRunning);
            }
            rt.process
                .as_ref()
                .map(|p| p.stdin.clone())
                .ok_or(InstanceError::NotRunning)?
        };
        write_line(&stdin, text).await
    }

    /// Takes effect on the next start; a running process is left alone.
    pub async fn set_ram(&self, mb: u32) {
        self.runtime.lock().await.jvm_args.set_ram(mb);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.console.lock().await.subscriber_count()
    }

    pub async fn subscribe(&self) -> Subscription {
        self.console.lock().await.subscribe()
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.console.lock().await.unsubscribe(id)
    }

    pub async fn history(&self) -> Vec<String> {
        self.console.lock().await.history()
    }

    /// History snapshot plus a subscription registered under the same lock, so
    /// nothing is missed or repeated between the two.
    pub async fn attach_console(&self) -> (Vec<String>, Subscription) {
        let mut console = self.console.lock().await;
        let history = console.history();
        (history, console.subscribe())
    }

    pub async fn tail_logs(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.console.lock().await.tail_after(cursor, limit)
    }
}

async fn write_line(stdin: &Mutex<ChildStdin>, text: &str) -> Result<(), InstanceError> {
    let mut line = String::with_capacity(text.len() + 1);
    line.push_str(text);
    line.push('\n');
    let mut stdin = stdin.lock().await;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

fn spawn_line_reader<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Best-effort UTF-8: the console should never stall on a bad byte.
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "console read failed");
                    break;
                }
            }
        }
    });
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies (crash/kill), ensure the child is terminated.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}
