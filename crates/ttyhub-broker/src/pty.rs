//! Pseudo-terminal processes.
//!
//! Reads and writes happen on dedicated OS threads; the broker only ever
//! sees [`PtyEvent`]s on a channel and a [`PtyControl`] handle.

use std::io::{Read, Write as IoWrite};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::mode::SpawnSpec;
use crate::models::{ExitEvent, Geometry};

const PTY_READ_BUFFER_SIZE: usize = 16384;
const PTY_WRITE_CHUNK_SIZE: usize = 1024;
/// How long a SIGHUP'd process group gets before SIGKILL.
const KILL_GRACE_POLLS: u32 = 5;
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Data(Vec<u8>),
    /// Emitted once, after the last `Data`.
    Exit(ExitEvent),
}

pub trait PtyControl: Send + Sync {
    /// Queue input for the process. Never blocks.
    fn write(&self, data: &[u8]) -> BrokerResult<()>;
    fn resize(&self, geometry: Geometry) -> BrokerResult<()>;
    /// Terminate the process and everything in its process group.
    fn kill(&self);
    fn pid(&self) -> Option<u32>;
}

pub struct SpawnedPty {
    pub control: Arc<dyn PtyControl>,
    pub events: mpsc::UnboundedReceiver<PtyEvent>,
}

pub trait PtySpawner: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec, geometry: Geometry) -> BrokerResult<SpawnedPty>;
}

fn pty_size(geometry: Geometry) -> PtySize {
    PtySize {
        rows: geometry.rows,
        cols: geometry.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawns real processes through `portable-pty`.
#[derive(Debug, Default, Clone)]
pub struct NativePtySpawner;

struct NativePtyControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: Mutex<std::sync::mpsc::Sender<Vec<u8>>>,
    pid: Option<u32>,
    /// Set by the reader thread once the child has been waited on; after
    /// that the pid may be reused and must not be signalled.
    reaped: Arc<AtomicBool>,
}

impl PtyControl for NativePtyControl {
    fn write(&self, data: &[u8]) -> BrokerResult<()> {
        self.input_tx
            .lock()
            .send(data.to_vec())
            .map_err(|_| BrokerError::Internal("PTY writer has stopped".to_string()))
    }

    fn resize(&self, geometry: Geometry) -> BrokerResult<()> {
        self.master
            .lock()
            .resize(pty_size(geometry))
            .map_err(|e| BrokerError::Internal(format!("PTY resize failed: {e}")))
    }

    fn kill(&self) {
        let Some(pid) = self.pid else {
            if let Err(e) = self.killer.lock().kill() {
                debug!("kill failed: {}", e);
            }
            return;
        };
        if self.reaped.load(Ordering::SeqCst) {
            return;
        }

        // The child is a session leader, so its pid is also the group id.
        // The zombie keeps the pid reserved until the reader thread reaps it.
        let group = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(group, Signal::SIGHUP) {
            debug!("[pty:{}] SIGHUP failed: {}", pid, e);
            return;
        }

        let reaped = self.reaped.clone();
        std::thread::spawn(move || {
            for _ in 0..KILL_GRACE_POLLS {
                std::thread::sleep(KILL_POLL_INTERVAL);
                if reaped.load(Ordering::SeqCst) {
                    return;
                }
            }
            match killpg(group, Signal::SIGKILL) {
                Ok(()) => info!("[pty:{}] Escalated to SIGKILL", pid),
                Err(e) => debug!("[pty:{}] SIGKILL failed: {}", pid, e),
            }
        });
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, spec: &SpawnSpec, geometry: Geometry) -> BrokerResult<SpawnedPty> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(geometry))
            .map_err(|e| BrokerError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.executable);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BrokerError::Spawn(e.to_string()))?;
        // The child holds its own copy; keeping ours would delay EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BrokerError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BrokerError::Spawn(e.to_string()))?;

        let label = pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());
        let (input_tx, input_rx) = std::sync::mpsc::channel();
        spawn_pty_writer_thread(label.clone(), writer, input_rx);

        let (events_tx, events) = mpsc::unbounded_channel();
        let reader_label = label.clone();
        let reaped = Arc::new(AtomicBool::new(false));
        let reader_reaped = reaped.clone();
        std::thread::spawn(move || {
            read_until_eof(&reader_label, reader, &events_tx);
            let exit = wait_for_exit(&reader_label, pid, &mut child);
            reader_reaped.store(true, Ordering::SeqCst);
            info!(
                "[reader:{}] Process exited with code {:?}, signal {:?}",
                reader_label, exit.code, exit.signal
            );
            let _ = events_tx.send(PtyEvent::Exit(exit));
        });

        info!(
            "[pty:{}] Spawned {} {:?} in {} ({})",
            label, spec.executable, spec.args, spec.cwd, geometry
        );

        Ok(SpawnedPty {
            control: Arc::new(NativePtyControl {
                master: Mutex::new(pair.master),
                killer: Mutex::new(killer),
                input_tx: Mutex::new(input_tx),
                pid,
                reaped,
            }),
            events,
        })
    }
}

/// Reap the child, keeping the terminating signal when there is one.
fn wait_for_exit(
    label: &str,
    pid: Option<u32>,
    child: &mut Box<dyn Child + Send + Sync>,
) -> ExitEvent {
    let Some(pid) = pid else {
        return match child.wait() {
            Ok(status) => ExitEvent::exited(status.exit_code() as i32),
            Err(e) => {
                warn!("[reader:{}] wait failed: {}", label, e);
                ExitEvent::killed()
            }
        };
    };

    loop {
        match waitpid(Pid::from_raw(pid as i32), None) {
            Ok(WaitStatus::Exited(_, code)) => return ExitEvent::exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return ExitEvent::signaled(signal.as_str())
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("[reader:{}] waitpid failed: {}", label, e);
                return ExitEvent::killed();
            }
        }
    }
}

fn read_until_eof(
    label: &str,
    mut reader: Box<dyn Read + Send>,
    events_tx: &mpsc::UnboundedSender<PtyEvent>,
) {
    let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
    let mut total_bytes_read: usize = 0;

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total_bytes_read += n;
                if events_tx.send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                    debug!("[reader:{}] Receiver dropped", label);
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how Linux reports a closed slave side
                debug!(
                    "[reader:{}] Read ended: {} (errno: {:?})",
                    label,
                    e,
                    e.raw_os_error()
                );
                break;
            }
        }
    }

    debug!("[reader:{}] EOF after {} bytes", label, total_bytes_read);
}

/// Writes queued input in small chunks so the PTY buffer can drain.
fn spawn_pty_writer_thread(
    label: String,
    mut writer: Box<dyn IoWrite + Send>,
    input_rx: std::sync::mpsc::Receiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        while let Ok(data) = input_rx.recv() {
            for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                    error!(
                        "[writer:{}] Write error: {} (errno: {:?})",
                        label,
                        e,
                        e.raw_os_error()
                    );
                    return;
                }
                std::thread::yield_now();
            }
        }
        debug!("[writer:{}] Writer thread finished", label);
    });
}

/// In-memory spawner for protocol tests.
#[cfg(test)]
pub(crate) mod fake {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Default)]
    pub struct FakeControl {
        pub written: Mutex<Vec<u8>>,
        pub resizes: Mutex<Vec<Geometry>>,
        pub killed: AtomicBool,
    }

    impl FakeControl {
        pub fn was_killed(&self) -> bool {
            self.killed.load(Ordering::SeqCst)
        }

        pub fn written_string(&self) -> String {
            String::from_utf8_lossy(&self.written.lock()).into_owned()
        }
    }

    impl PtyControl for FakeControl {
        fn write(&self, data: &[u8]) -> BrokerResult<()> {
            self.written.lock().extend_from_slice(data);
            Ok(())
        }

        fn resize(&self, geometry: Geometry) -> BrokerResult<()> {
            self.resizes.lock().push(geometry);
            Ok(())
        }

        fn kill(&self) {
            self.killed.store(true, Ordering::SeqCst);
        }

        fn pid(&self) -> Option<u32> {
            Some(4242)
        }
    }

    #[derive(Clone)]
    pub struct FakeHandle {
        pub events: mpsc::UnboundedSender<PtyEvent>,
        pub control: Arc<FakeControl>,
    }

    impl FakeHandle {
        pub fn output(&self, data: &[u8]) {
            let _ = self.events.send(PtyEvent::Data(data.to_vec()));
        }

        pub fn exit(&self, code: i32) {
            let _ = self.events.send(PtyEvent::Exit(ExitEvent::exited(code)));
        }
    }

    #[derive(Default)]
    pub struct FakeSpawner {
        handles: Mutex<Vec<FakeHandle>>,
    }

    impl FakeSpawner {
        pub fn spawned(&self) -> usize {
            self.handles.lock().len()
        }

        pub fn last(&self) -> FakeHandle {
            let handles = self.handles.lock();
            handles[handles.len() - 1].clone()
        }
    }

    impl PtySpawner for FakeSpawner {
        fn spawn(&self, _spec: &SpawnSpec, _geometry: Geometry) -> BrokerResult<SpawnedPty> {
            let (tx, rx) = mpsc::unbounded_channel();
            let control = Arc::new(FakeControl::default());
            self.handles.lock().push(FakeHandle {
                events: tx,
                control: control.clone(),
            });
            Ok(SpawnedPty { control, events: rx })
        }
    }
}
