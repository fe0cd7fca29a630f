//! One PTY session: output fan-out, mirror actor and the attach handshake.
//!
//! Every output chunk gets a sequence number under the session lock, and
//! the mirror write for that chunk is queued under the same lock. A
//! snapshot requested while holding the lock therefore reflects exactly the
//! chunks up to the sequence number read at that moment, which is what
//! lets [`Session::attach`] hand over from snapshot to live output without
//! gaps or duplicates.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};
use ttyhub_terminal::{OscEvent, OscScanner, OutputTail, TerminalMirror};

use crate::activity::{ActivityState, ActivityTracker, Heuristic};
use crate::error::{BrokerError, BrokerResult};
use crate::models::{ExitEvent, Geometry, SessionInfo};
use crate::pty::PtyControl;

// =============================================================================
// Mirror actor
// =============================================================================

/// Terminal state the mirror actor drives.
pub trait MirrorBackend: Send + 'static {
    fn process(&mut self, data: &[u8]);
    fn resize(&mut self, geometry: Geometry);
    fn snapshot(&mut self) -> String;
    fn plain_text(&self) -> String;
}

impl MirrorBackend for TerminalMirror {
    fn process(&mut self, data: &[u8]) {
        TerminalMirror::process(self, data);
    }

    fn resize(&mut self, geometry: Geometry) {
        TerminalMirror::resize(self, geometry.cols, geometry.rows);
    }

    fn snapshot(&mut self) -> String {
        TerminalMirror::snapshot(self)
    }

    fn plain_text(&self) -> String {
        TerminalMirror::plain_text(self)
    }
}

enum MirrorOp {
    Write(Bytes),
    /// Applies whatever geometry is in the shared slot at execution time.
    Resize,
    Snapshot(oneshot::Sender<String>),
    Screen(oneshot::Sender<String>),
}

/// Serialized queue of mirror operations, executed one at a time by a
/// dedicated task. A failing operation is logged and skipped.
pub struct MirrorChain {
    tx: mpsc::UnboundedSender<MirrorOp>,
    pending_resize: Arc<Mutex<Option<Geometry>>>,
    task: JoinHandle<()>,
}

fn run_guarded<T>(label: &str, op: &str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            error!("[mirror:{}] {} failed; continuing", label, op);
            None
        }
    }
}

impl MirrorChain {
    pub fn spawn<M: MirrorBackend>(label: String, mut mirror: M) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pending_resize: Arc<Mutex<Option<Geometry>>> = Arc::new(Mutex::new(None));
        let slot = pending_resize.clone();

        let task = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    MirrorOp::Write(data) => {
                        run_guarded(&label, "write", || mirror.process(&data));
                    }
                    MirrorOp::Resize => {
                        let geometry = slot.lock().take();
                        if let Some(geometry) = geometry {
                            run_guarded(&label, "resize", || mirror.resize(geometry));
                        }
                    }
                    MirrorOp::Snapshot(reply) => {
                        if let Some(snapshot) = run_guarded(&label, "snapshot", || mirror.snapshot()) {
                            let _ = reply.send(snapshot);
                        }
                    }
                    MirrorOp::Screen(reply) => {
                        if let Some(text) = run_guarded(&label, "screen", || mirror.plain_text()) {
                            let _ = reply.send(text);
                        }
                    }
                }
            }
            debug!("[mirror:{}] Chain finished", label);
        });

        Self {
            tx,
            pending_resize,
            task,
        }
    }

    pub fn write(&self, data: Bytes) {
        let _ = self.tx.send(MirrorOp::Write(data));
    }

    /// Only the first resize of a burst enqueues a marker; later ones just
    /// replace the geometry the marker will apply.
    pub fn resize(&self, geometry: Geometry) {
        let mut slot = self.pending_resize.lock();
        let queued = slot.is_some();
        *slot = Some(geometry);
        if !queued {
            let _ = self.tx.send(MirrorOp::Resize);
        }
    }

    /// The receiver errors if the chain is gone or the snapshot failed.
    pub fn snapshot(&self) -> oneshot::Receiver<String> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(MirrorOp::Snapshot(reply));
        rx
    }

    pub fn screen(&self) -> oneshot::Receiver<String> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(MirrorOp::Screen(reply));
        rx
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for MirrorChain {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// Connections
// =============================================================================

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Messages delivered to one attached viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Snapshot(String),
    Output(Bytes),
    Exit(ExitEvent),
}

/// Sending half of a viewer's queue. Delivery is fire-and-forget.
#[derive(Debug, Clone)]
pub struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns false when the viewer has gone away.
    pub fn send(&self, message: Outbound) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Session
// =============================================================================

struct PendingAttach {
    conn: Connection,
    buffered: Vec<(u64, Bytes)>,
}

struct SessionState {
    output_seq: u64,
    live: BTreeMap<u64, Connection>,
    pending: BTreeMap<u64, PendingAttach>,
    scanner: OscScanner,
    tail: OutputTail,
    activity: ActivityTracker,
    activity_timer: Option<JoinHandle<()>>,
    activity_epoch: u64,
    grace_timer: Option<JoinHandle<()>>,
    grace_epoch: u64,
    pump: Option<JoinHandle<()>>,
    title: Option<String>,
    detected_cwd: Option<String>,
    geometry: Geometry,
    last_activity: Instant,
    /// Set once the grace timer has committed to tearing the session down.
    draining: bool,
    closed: bool,
}

impl SessionState {
    fn has_viewers(&self) -> bool {
        !self.live.is_empty() || !self.pending.is_empty()
    }

    fn cancel_grace(&mut self) {
        self.grace_epoch += 1;
        if let Some(handle) = self.grace_timer.take() {
            handle.abort();
        }
    }
}

/// Static attributes of a new session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub id: String,
    pub owner: String,
    pub mode: String,
    pub cwd: String,
    pub name: Option<String>,
    pub resume_key: Option<String>,
    pub geometry: Geometry,
    pub carry_bytes: usize,
    pub tail_chars: usize,
    pub activity_revert: Duration,
    /// Creation order, used to list sessions stably.
    pub order: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCapture {
    /// Visible screen as plain text.
    pub screen: String,
    /// ANSI-stripped tail of recent output.
    pub tail: String,
}

pub struct Session {
    pub id: String,
    pub owner: String,
    pub mode: String,
    pub cwd: String,
    pub name: Option<String>,
    pub resume_key: Option<String>,
    pub order: u64,
    created_at: f64,
    activity_revert: Duration,
    control: Arc<dyn PtyControl>,
    mirror: MirrorChain,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(params: SessionParams, control: Arc<dyn PtyControl>, mirror: MirrorChain) -> Arc<Self> {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Arc::new(Self {
            id: params.id,
            owner: params.owner,
            mode: params.mode,
            cwd: params.cwd,
            name: params.name,
            resume_key: params.resume_key,
            order: params.order,
            created_at,
            activity_revert: params.activity_revert,
            control,
            mirror,
            state: Mutex::new(SessionState {
                output_seq: 0,
                live: BTreeMap::new(),
                pending: BTreeMap::new(),
                scanner: OscScanner::new(params.carry_bytes),
                tail: OutputTail::new(params.tail_chars),
                activity: ActivityTracker::default(),
                activity_timer: None,
                activity_epoch: 0,
                grace_timer: None,
                grace_epoch: 0,
                pump: None,
                title: None,
                detected_cwd: None,
                geometry: params.geometry,
                last_activity: Instant::now(),
                draining: false,
                closed: false,
            }),
        })
    }

    /// Record one chunk of process output and fan it out.
    pub fn handle_data(self: &Arc<Self>, data: Bytes) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return;
        }

        state.output_seq += 1;
        let seq = state.output_seq;
        state.last_activity = Instant::now();

        let mut explicit_signal = false;
        for event in state.scanner.scan(&data) {
            match event {
                OscEvent::Title(title) => state.title = Some(title),
                OscEvent::WorkingDirectory(path) => state.detected_cwd = Some(path),
                OscEvent::Activity(signal) => {
                    explicit_signal = true;
                    state.activity_epoch += 1;
                    if let Some(handle) = state.activity_timer.take() {
                        handle.abort();
                    }
                    if state.activity.on_signal(signal) {
                        debug!("[session:{}] Activity -> {:?} (explicit)", self.id, state.activity.state());
                    }
                }
            }
        }

        let text = state.tail.push(&data);
        if !explicit_signal && state.activity.on_output(text) == Heuristic::Armed {
            self.arm_activity_timer(state);
        }

        self.mirror.write(data.clone());

        state
            .live
            .retain(|_, conn| conn.send(Outbound::Output(data.clone())));
        for pending in state.pending.values_mut() {
            pending.buffered.push((seq, data.clone()));
        }
    }

    fn arm_activity_timer(self: &Arc<Self>, state: &mut SessionState) {
        state.activity_epoch += 1;
        let epoch = state.activity_epoch;
        if let Some(handle) = state.activity_timer.take() {
            handle.abort();
        }

        let weak = Arc::downgrade(self);
        let deadline = Instant::now() + self.activity_revert;
        state.activity_timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(session) = weak.upgrade() {
                session.revert_activity(epoch);
            }
        }));
    }

    fn revert_activity(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.activity_epoch != epoch || state.closed {
            return;
        }
        state.activity_timer = None;
        if state.activity.revert() {
            debug!("[session:{}] Activity -> Idle (quiet)", self.id);
        }
    }

    /// Attach a viewer: snapshot first, then every later chunk exactly once.
    ///
    /// Returns `Ok(false)` if the viewer went away mid-handshake.
    pub async fn attach(self: &Arc<Self>, conn: Connection) -> BrokerResult<bool> {
        let conn_id = conn.id();

        let (snapshot_seq, snapshot_rx) = {
            let mut state = self.state.lock();
            if state.closed || state.draining {
                return Err(BrokerError::NotFound(self.id.clone()));
            }
            state.cancel_grace();
            state.pending.insert(
                conn_id,
                PendingAttach {
                    conn: conn.clone(),
                    buffered: Vec::new(),
                },
            );
            (state.output_seq, self.mirror.snapshot())
        };

        let snapshot = match snapshot_rx.await {
            Ok(snapshot) => snapshot,
            Err(_) => {
                let closed = {
                    let mut state = self.state.lock();
                    state.pending.remove(&conn_id);
                    state.closed
                };
                return Err(if closed {
                    BrokerError::NotFound(self.id.clone())
                } else {
                    BrokerError::Internal("snapshot failed".to_string())
                });
            }
        };

        if conn.is_closed() || !conn.send(Outbound::Snapshot(snapshot)) {
            self.state.lock().pending.remove(&conn_id);
            debug!("[attach:{}] Viewer {} left during handshake", self.id, conn_id);
            return Ok(false);
        }

        let mut state = self.state.lock();
        let Some(pending) = state.pending.remove(&conn_id) else {
            // Shut down while the snapshot was in flight
            return Ok(false);
        };
        if state.closed {
            return Ok(false);
        }

        let mut flushed = 0;
        for (seq, data) in pending.buffered {
            if seq > snapshot_seq {
                if !conn.send(Outbound::Output(data)) {
                    return Ok(false);
                }
                flushed += 1;
            }
        }
        state.live.insert(conn_id, conn);
        debug!(
            "[attach:{}] Viewer {} live at seq {} ({} buffered chunks)",
            self.id, conn_id, snapshot_seq, flushed
        );
        Ok(true)
    }

    /// Remove a viewer. Returns true when nobody is attached any more.
    pub fn detach(&self, conn_id: u64) -> bool {
        let mut state = self.state.lock();
        state.live.remove(&conn_id);
        state.pending.remove(&conn_id);
        !state.closed && !state.has_viewers()
    }

    /// Start the detach-grace countdown unless a viewer is attached.
    /// Re-arming replaces any previous countdown.
    pub fn arm_grace_timer<F>(self: &Arc<Self>, grace: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.closed || state.has_viewers() {
            return;
        }
        state.cancel_grace();
        let epoch = state.grace_epoch;

        let weak = Arc::downgrade(self);
        let deadline = Instant::now() + grace;
        state.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(session) = weak.upgrade() else {
                return;
            };
            {
                let mut state = session.state.lock();
                if state.grace_epoch != epoch || state.closed || state.has_viewers() {
                    return;
                }
                state.grace_timer = None;
                state.draining = true;
            }
            info!("[session:{}] No viewers for {:?}; closing", session.id, grace);
            on_expire();
        }));
    }

    pub fn has_grace_timer(&self) -> bool {
        self.state.lock().grace_timer.is_some()
    }

    pub(crate) fn set_pump(&self, handle: JoinHandle<()>) {
        let mut state = self.state.lock();
        if state.closed {
            handle.abort();
        } else {
            state.pump = Some(handle);
        }
    }

    pub fn write(&self, data: &[u8]) -> BrokerResult<()> {
        self.control.write(data)?;
        self.state.lock().last_activity = Instant::now();
        Ok(())
    }

    pub fn resize(&self, geometry: Geometry) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.geometry = geometry;
        if let Err(e) = self.control.resize(geometry) {
            error!("[session:{}] Resize failed: {}", self.id, e);
        }
        self.mirror.resize(geometry);
    }

    pub async fn capture(&self) -> BrokerResult<SessionCapture> {
        let (screen_rx, tail) = {
            let state = self.state.lock();
            (self.mirror.screen(), state.tail.text())
        };
        let screen = screen_rx
            .await
            .map_err(|_| BrokerError::NotFound(self.id.clone()))?;
        Ok(SessionCapture { screen, tail })
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    pub fn activity(&self) -> ActivityState {
        self.state.lock().activity.state()
    }

    pub fn output_seq(&self) -> u64 {
        self.state.lock().output_seq
    }

    /// `(live, pending)` viewer counts.
    pub fn viewer_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.live.len(), state.pending.len())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock();
        SessionInfo {
            id: self.id.clone(),
            owner: self.owner.clone(),
            mode: self.mode.clone(),
            cwd: self.cwd.clone(),
            name: self.name.clone(),
            resume_key: self.resume_key.clone(),
            cols: state.geometry.cols,
            rows: state.geometry.rows,
            created_at: self.created_at,
            idle_secs: state.last_activity.elapsed().as_secs_f64(),
            output_seq: state.output_seq,
            viewers: state.live.len(),
            activity: state.activity.state(),
            title: state.title.clone(),
            detected_cwd: state.detected_cwd.clone(),
            pid: self.control.pid(),
        }
    }

    /// Stop everything the session owns and tell every viewer it is over.
    /// Only the first call has any effect.
    pub fn shutdown(&self, exit: ExitEvent) {
        let connections: Vec<Connection> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.cancel_grace();
            if let Some(handle) = state.activity_timer.take() {
                handle.abort();
            }
            if let Some(handle) = state.pump.take() {
                handle.abort();
            }
            let live = std::mem::take(&mut state.live).into_values();
            let pending = std::mem::take(&mut state.pending)
                .into_values()
                .map(|p| p.conn);
            live.chain(pending).collect()
        };

        self.mirror.abort();
        self.control.kill();

        for conn in &connections {
            conn.send(Outbound::Exit(exit.clone()));
        }
        debug!(
            "[session:{}] Shut down; notified {} viewers",
            self.id,
            connections.len()
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::fake::FakeControl;

    fn params(id: &str) -> SessionParams {
        SessionParams {
            id: id.to_string(),
            owner: "alice".to_string(),
            mode: "shell".to_string(),
            cwd: "/tmp".to_string(),
            name: None,
            resume_key: None,
            geometry: Geometry::new(80, 24),
            carry_bytes: 4096,
            tail_chars: 4000,
            activity_revert: Duration::from_secs(2),
            order: 0,
        }
    }

    fn new_session(id: &str) -> (Arc<Session>, Arc<FakeControl>) {
        let control = Arc::new(FakeControl::default());
        let mirror = MirrorChain::spawn(id.to_string(), TerminalMirror::new(80, 24, 100));
        (Session::new(params(id), control.clone(), mirror), control)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    struct PanickyMirror {
        inner: TerminalMirror,
    }

    impl MirrorBackend for PanickyMirror {
        fn process(&mut self, data: &[u8]) {
            if data == b"boom" {
                panic!("mirror exploded");
            }
            self.inner.process(data);
        }

        fn resize(&mut self, geometry: Geometry) {
            self.inner.resize(geometry.cols, geometry.rows);
        }

        fn snapshot(&mut self) -> String {
            self.inner.snapshot()
        }

        fn plain_text(&self) -> String {
            self.inner.plain_text()
        }
    }

    #[derive(Default, Clone)]
    struct RecordingMirror {
        resizes: Arc<Mutex<Vec<Geometry>>>,
        writes: Arc<Mutex<Vec<u8>>>,
    }

    impl MirrorBackend for RecordingMirror {
        fn process(&mut self, data: &[u8]) {
            self.writes.lock().extend_from_slice(data);
        }

        fn resize(&mut self, geometry: Geometry) {
            self.resizes.lock().push(geometry);
        }

        fn snapshot(&mut self) -> String {
            String::from_utf8_lossy(&self.writes.lock()).into_owned()
        }

        fn plain_text(&self) -> String {
            self.snapshot_text()
        }
    }

    impl RecordingMirror {
        fn snapshot_text(&self) -> String {
            String::from_utf8_lossy(&self.writes.lock()).into_owned()
        }
    }

    #[tokio::test]
    async fn mirror_chain_survives_failing_op() {
        let chain = MirrorChain::spawn(
            "t".to_string(),
            PanickyMirror {
                inner: TerminalMirror::new(40, 10, 10),
            },
        );
        chain.write(Bytes::from_static(b"before "));
        chain.write(Bytes::from_static(b"boom"));
        chain.write(Bytes::from_static(b"after"));

        let snapshot = chain.snapshot().await.unwrap();
        assert!(snapshot.contains("before"));
        assert!(snapshot.contains("after"));
    }

    #[tokio::test]
    async fn mirror_chain_coalesces_resizes() {
        let mirror = RecordingMirror::default();
        let chain = MirrorChain::spawn("t".to_string(), mirror.clone());
        chain.resize(Geometry::new(100, 30));
        chain.resize(Geometry::new(120, 40));
        chain.resize(Geometry::new(132, 43));
        chain.snapshot().await.unwrap();
        assert_eq!(*mirror.resizes.lock(), vec![Geometry::new(132, 43)]);

        chain.resize(Geometry::new(80, 24));
        chain.snapshot().await.unwrap();
        assert_eq!(mirror.resizes.lock().len(), 2);
    }

    #[tokio::test]
    async fn output_seq_increments_per_chunk() {
        let (session, _) = new_session("seq");
        for chunk in [&b"a"[..], b"bc", b""] {
            session.handle_data(Bytes::copy_from_slice(chunk));
        }
        assert_eq!(session.output_seq(), 3);
    }

    #[tokio::test]
    async fn attach_sends_snapshot_then_live_output() {
        let (session, _) = new_session("live");
        session.handle_data(Bytes::from_static(b"history\r\n"));

        let (conn, mut rx) = Connection::new();
        assert!(session.attach(conn).await.unwrap());
        session.handle_data(Bytes::from_static(b"fresh"));

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            Outbound::Snapshot(s) => {
                assert!(s.contains("history"));
                assert!(!s.contains("fresh"));
            }
            other => panic!("expected snapshot first, got {other:?}"),
        }
        assert_eq!(messages[1], Outbound::Output(Bytes::from_static(b"fresh")));
        assert_eq!(session.viewer_counts(), (1, 0));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn output_during_handshake_is_flushed_after_snapshot() {
        let mirror = RecordingMirror::default();
        let control = Arc::new(FakeControl::default());
        let session = Session::new(
            params("handshake"),
            control,
            MirrorChain::spawn("handshake".to_string(), mirror.clone()),
        );
        session.handle_data(Bytes::from_static(b"one;"));

        let (conn, mut rx) = Connection::new();
        let attaching = {
            let session = session.clone();
            tokio::spawn(async move { session.attach(conn).await })
        };
        while session.viewer_counts().1 == 0 {
            tokio::task::yield_now().await;
        }

        // Registered as pending: these land after the snapshot point
        session.handle_data(Bytes::from_static(b"two;"));
        session.handle_data(Bytes::from_static(b"three;"));

        assert!(attaching.await.unwrap().unwrap());
        session.handle_data(Bytes::from_static(b"four;"));

        let messages = drain(&mut rx);
        assert_eq!(
            messages,
            vec![
                Outbound::Snapshot("one;".to_string()),
                Outbound::Output(Bytes::from_static(b"two;")),
                Outbound::Output(Bytes::from_static(b"three;")),
                Outbound::Output(Bytes::from_static(b"four;")),
            ]
        );
    }

    #[tokio::test]
    async fn closed_viewer_is_dropped_during_handshake() {
        let (session, _) = new_session("gone");
        let (conn, rx) = Connection::new();
        drop(rx);
        assert!(!session.attach(conn).await.unwrap());
        assert_eq!(session.viewer_counts(), (0, 0));
    }

    #[tokio::test]
    async fn detach_reports_last_viewer() {
        let (session, _) = new_session("detach");
        let (a, _rx_a) = Connection::new();
        let (b, _rx_b) = Connection::new();
        session.attach(a.clone()).await.unwrap();
        session.attach(b.clone()).await.unwrap();

        assert!(!session.detach(a.id()));
        assert!(session.detach(b.id()));
    }

    #[tokio::test]
    async fn osc_events_update_title_cwd_and_activity() {
        let (session, _) = new_session("osc");
        session.handle_data(Bytes::from_static(b"\x1b]0;build\x07"));
        session.handle_data(Bytes::from_static(b"\x1b]7;file://host/srv/app\x1b\\"));
        session.handle_data(Bytes::from_static(b"\x1b]7777;running\x07"));

        let info = session.info();
        assert_eq!(info.title.as_deref(), Some("build"));
        assert_eq!(info.detected_cwd.as_deref(), Some("/srv/app"));
        assert_eq!(info.activity, ActivityState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn heuristic_running_reverts_after_quiet_period() {
        let (session, _) = new_session("revert");
        session.handle_data(Bytes::from_static("⠋ Working… (esc to interrupt)".as_bytes()));
        assert_eq!(session.activity(), ActivityState::Running);

        tokio::time::advance(Duration::from_millis(1999)).await;
        settle().await;
        assert_eq!(session.activity(), ActivityState::Running);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(session.activity(), ActivityState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_done_outlives_pending_revert() {
        let (session, _) = new_session("done-pending");
        session.handle_data(Bytes::from_static("⠋ Working… (esc to interrupt)".as_bytes()));
        assert_eq!(session.activity(), ActivityState::Running);

        tokio::time::advance(Duration::from_millis(1000)).await;
        session.handle_data(Bytes::from_static(b"\x1b]7777;done\x07"));
        assert_eq!(session.activity(), ActivityState::Done);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(session.activity(), ActivityState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_output_rearms_the_revert_timer() {
        let (session, _) = new_session("rearm");
        session.handle_data(Bytes::from_static("⠋".as_bytes()));
        tokio::time::advance(Duration::from_millis(1500)).await;
        session.handle_data(Bytes::from_static("⠙".as_bytes()));
        tokio::time::advance(Duration::from_millis(1500)).await;
        settle().await;
        assert_eq!(session.activity(), ActivityState::Running);

        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(session.activity(), ActivityState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_running_is_not_reverted() {
        let (session, _) = new_session("locked");
        session.handle_data(Bytes::from_static(b"\x1b]7777;running\x07"));
        session.handle_data(Bytes::from_static("⠋ esc to interrupt".as_bytes()));
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(session.activity(), ActivityState::Running);

        session.handle_data(Bytes::from_static(b"\x1b]7777;done\x07"));
        assert_eq!(session.activity(), ActivityState::Done);
    }

    #[tokio::test]
    async fn shutdown_kills_and_notifies_once() {
        let (session, control) = new_session("shutdown");
        let (conn, mut rx) = Connection::new();
        session.attach(conn).await.unwrap();

        session.shutdown(ExitEvent::killed());
        session.shutdown(ExitEvent::exited(0));

        assert!(control.was_killed());
        assert!(session.is_closed());
        let messages = drain(&mut rx);
        assert_eq!(messages.last(), Some(&Outbound::Exit(ExitEvent::killed())));
        assert_eq!(
            messages.iter().filter(|m| matches!(m, Outbound::Exit(_))).count(),
            1
        );

        let (late, _rx) = Connection::new();
        assert!(matches!(
            session.attach(late).await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn resize_reaches_process_and_info() {
        let (session, control) = new_session("resize");
        session.resize(Geometry::new(120, 40));
        assert_eq!(*control.resizes.lock(), vec![Geometry::new(120, 40)]);
        let info = session.info();
        assert_eq!((info.cols, info.rows), (120, 40));
    }

    #[tokio::test]
    async fn capture_returns_screen_and_tail() {
        let (session, _) = new_session("capture");
        session.handle_data(Bytes::from_static(b"\x1b[32mgreen\x1b[0m text\r\n"));
        let capture = session.capture().await.unwrap();
        assert!(capture.screen.contains("green text"));
        assert_eq!(capture.tail, "green text\n");
    }
}
