//! Process-wide table of sessions and the operations clients drive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ttyhub_terminal::TerminalMirror;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::mode::ModeResolver;
use crate::models::{CreateSessionRequest, ExitEvent, Geometry, SessionInfo};
use crate::observer::{CloseReason, SessionObserver};
use crate::pty::{PtyEvent, PtySpawner, SpawnedPty};
use crate::session::{Connection, MirrorChain, Session, SessionParams};
use crate::token::{AttachTokenRecord, AttachTokenStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub idle_closed: usize,
    pub tokens_purged: usize,
}

pub struct SessionRegistry {
    config: BrokerConfig,
    spawner: Arc<dyn PtySpawner>,
    resolver: Arc<dyn ModeResolver>,
    observer: Arc<dyn SessionObserver>,
    sessions: DashMap<String, Arc<Session>>,
    tokens: AttachTokenStore,
    /// Serializes capacity check + spawn + insert.
    create_lock: Mutex<()>,
    next_order: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        config: BrokerConfig,
        spawner: Arc<dyn PtySpawner>,
        resolver: Arc<dyn ModeResolver>,
        observer: Arc<dyn SessionObserver>,
    ) -> Arc<Self> {
        let tokens = AttachTokenStore::new(config.token_ttl);
        Arc::new(Self {
            config,
            spawner,
            resolver,
            observer,
            sessions: DashMap::new(),
            tokens,
            create_lock: Mutex::new(()),
            next_order: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Create a session, or return the caller's existing one when
    /// `resume_key` matches. The flag is true for the resumed case.
    pub fn create(
        self: &Arc<Self>,
        owner: &str,
        request: CreateSessionRequest,
    ) -> BrokerResult<(Arc<Session>, bool)> {
        let geometry = request.geometry_or(self.config.default_geometry);
        if !self.config.accepts(geometry) {
            return Err(BrokerError::InvalidGeometry {
                cols: geometry.cols,
                rows: geometry.rows,
            });
        }
        if !self.config.mode_enabled(&request.mode) {
            return Err(BrokerError::ModeDisabled(request.mode.clone()));
        }

        let (session, events) = {
            let _guard = self.create_lock.lock();

            if let Some(key) = request.resume_key.as_deref() {
                if let Some(existing) = self.find_by_resume_key(owner, key) {
                    debug!("[session:{}] Resumed by key {}", existing.id, key);
                    return Ok((existing, true));
                }
            }

            let owned = self
                .sessions
                .iter()
                .filter(|entry| entry.value().owner == owner)
                .count();
            if owned >= self.config.max_sessions_per_owner {
                return Err(BrokerError::CapacityExceeded {
                    limit: self.config.max_sessions_per_owner,
                });
            }

            let spec = self.resolver.resolve(&request)?;
            let SpawnedPty { control, events } = self.spawner.spawn(&spec, geometry)?;

            let id = Uuid::new_v4().to_string();
            let mut mirror =
                TerminalMirror::new(geometry.cols, geometry.rows, self.config.scrollback_lines);
            if let Some(snapshot) = request.initial_snapshot.as_deref() {
                mirror.seed(snapshot);
            }

            let session = Session::new(
                SessionParams {
                    id: id.clone(),
                    owner: owner.to_string(),
                    mode: request.mode.clone(),
                    cwd: spec.cwd.clone(),
                    name: spec.external_name.clone().or(request.name.clone()),
                    resume_key: request.resume_key.clone(),
                    geometry,
                    carry_bytes: self.config.carry_bytes,
                    tail_chars: self.config.tail_chars,
                    activity_revert: self.config.activity_revert,
                    order: self.next_order.fetch_add(1, Ordering::Relaxed),
                },
                control,
                MirrorChain::spawn(id.clone(), mirror),
            );
            self.sessions.insert(id, session.clone());
            (session, events)
        };

        self.spawn_pump(&session, events);
        self.arm_grace(&session);

        info!(
            "[session:{}] Created for {} (mode={}, cwd={}, {}x{})",
            session.id, owner, session.mode, session.cwd, geometry.cols, geometry.rows
        );
        Ok((session, false))
    }

    fn spawn_pump(self: &Arc<Self>, session: &Arc<Session>, mut events: mpsc::UnboundedReceiver<PtyEvent>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let pumped = session.clone();
        let observed = self.spawn_output_observer(&session.id);

        let handle = tokio::spawn(async move {
            let mut exit = None;
            while let Some(event) = events.recv().await {
                match event {
                    PtyEvent::Data(data) => {
                        let data = Bytes::from(data);
                        pumped.handle_data(data.clone());
                        let _ = observed.send(data);
                    }
                    PtyEvent::Exit(event) => {
                        exit = Some(event);
                        break;
                    }
                }
            }

            let exit = exit.unwrap_or_else(ExitEvent::killed);
            if let Some(registry) = registry.upgrade() {
                registry.teardown(&pumped.id, CloseReason::ProcessExit, exit);
            }
        });
        session.set_pump(handle);
    }

    /// Feeds output to the observer on its own task; ends when the pump
    /// drops the sender.
    fn spawn_output_observer(&self, id: &str) -> mpsc::UnboundedSender<Bytes> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let observer = self.observer.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                observer.on_output(&id, &data);
            }
        });
        tx
    }

    fn arm_grace(self: &Arc<Self>, session: &Arc<Session>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let id = session.id.clone();
        session.arm_grace_timer(self.config.detach_grace, move || {
            if let Some(registry) = registry.upgrade() {
                registry.teardown(&id, CloseReason::DetachGraceExpired, ExitEvent::killed());
            }
        });
    }

    /// Remove and stop a session. Only the first call for an id does
    /// anything; returns whether this call did the work.
    pub fn teardown(&self, id: &str, reason: CloseReason, exit: ExitEvent) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        let revoked = self.tokens.revoke_session(id);
        session.shutdown(exit);
        info!(
            "[session:{}] Torn down ({}); revoked {} tokens",
            id, reason, revoked
        );
        self.observer.on_session_closed(id, reason);
        true
    }

    fn lookup(&self, id: &str) -> BrokerResult<Arc<Session>> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))
    }

    /// Owner-checked lookup. A foreign session looks exactly like a missing one.
    pub fn get(&self, owner: &str, id: &str) -> BrokerResult<Arc<Session>> {
        let session = self.lookup(id)?;
        if session.owner != owner {
            return Err(BrokerError::NotFound(id.to_string()));
        }
        Ok(session)
    }

    pub fn list(&self, owner: &str) -> Vec<SessionInfo> {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().owner == owner)
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by_key(|s| s.order);
        sessions.iter().map(|s| s.info()).collect()
    }

    pub fn close(&self, owner: &str, id: &str) -> BrokerResult<()> {
        self.get(owner, id)?;
        self.teardown(id, CloseReason::UserClose, ExitEvent::killed());
        Ok(())
    }

    /// Out-of-range geometry is ignored rather than rejected.
    pub fn resize(&self, owner: &str, id: &str, cols: u16, rows: u16) -> BrokerResult<()> {
        let session = self.get(owner, id)?;
        let geometry = Geometry::new(cols, rows);
        if !self.config.accepts(geometry) {
            debug!("[session:{}] Ignoring resize to {}", id, geometry);
            return Ok(());
        }
        session.resize(geometry);
        Ok(())
    }

    pub fn write(&self, id: &str, data: &[u8]) -> BrokerResult<()> {
        self.lookup(id)?.write(data)
    }

    pub fn mint_attach_token(
        &self,
        owner: &str,
        id: &str,
        geometry: Option<Geometry>,
    ) -> BrokerResult<String> {
        self.get(owner, id)?;
        if let Some(geometry) = geometry {
            if !self.config.accepts(geometry) {
                return Err(BrokerError::InvalidGeometry {
                    cols: geometry.cols,
                    rows: geometry.rows,
                });
            }
        }
        Ok(self.tokens.mint(id, owner, geometry))
    }

    /// Redeem a token for a session that still exists.
    pub fn consume_attach_token(&self, token: &str) -> BrokerResult<AttachTokenRecord> {
        let record = self.tokens.consume(token)?;
        match self.lookup(&record.session_id) {
            Ok(session) if session.owner == record.user_id => Ok(record),
            _ => Err(BrokerError::InvalidToken),
        }
    }

    pub fn token_ttl(&self) -> std::time::Duration {
        self.tokens.ttl()
    }

    pub fn find_by_resume_key(&self, owner: &str, key: &str) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .find(|entry| {
                let session = entry.value();
                session.owner == owner && session.resume_key.as_deref() == Some(key)
            })
            .map(|entry| entry.value().clone())
    }

    /// Run the attach handshake. On any failure the viewer is detached again
    /// so the grace countdown resumes.
    pub async fn attach(self: &Arc<Self>, id: &str, conn: Connection) -> BrokerResult<bool> {
        let session = self.lookup(id)?;
        let conn_id = conn.id();
        let result = session.attach(conn).await;
        match &result {
            Ok(true) => debug!("[attach:{}] Viewer {} attached", id, conn_id),
            Ok(false) | Err(_) => self.detach(id, conn_id),
        }
        result
    }

    pub fn detach(self: &Arc<Self>, id: &str, conn_id: u64) {
        let Ok(session) = self.lookup(id) else {
            return;
        };
        if session.detach(conn_id) {
            debug!(
                "[attach:{}] Last viewer left; closing in {:?} unless reattached",
                id, self.config.detach_grace
            );
            self.arm_grace(&session);
        }
    }

    /// Close idle sessions and drop expired tokens.
    pub fn sweep(&self) -> SweepReport {
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() >= self.config.idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut report = SweepReport::default();
        for id in idle {
            if self.teardown(&id, CloseReason::IdleTimeout, ExitEvent::killed()) {
                report.idle_closed += 1;
            }
        }
        report.tokens_purged = self.tokens.purge_expired();
        if report.idle_closed > 0 || report.tokens_purged > 0 {
            debug!(
                "[sweep] Closed {} idle sessions, purged {} tokens",
                report.idle_closed, report.tokens_purged
            );
        }
        report
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep();
            }
        })
    }

    /// Tear every session down.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            warn!("Shutting down {} sessions", ids.len());
        }
        for id in ids {
            self.teardown(&id, CloseReason::Shutdown, ExitEvent::killed());
        }
    }
}
