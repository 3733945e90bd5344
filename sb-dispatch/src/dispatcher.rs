//! Session actors: one task owns each session's queue and its running turn.
//!
//! Events reach an actor over its command channel; replies leave on the shared
//! `DispatchOutput` channel. A process-wide semaphore bounds running turns.

use crate::agent::{AgentOutput, AgentRunner, RunOrigin, RunRequest, SteerInbox};
use crate::error::{DispatchError, Result};
use crate::queue::{Admission, Phase, QueueMode, QueueSettings, SessionQueue};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use sb_channels::{CanonicalInboundEvent, ReplyKind, ReplyPayload, SessionKey, Surface};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_IDLE_RETENTION: Duration = Duration::from_secs(30 * 60);

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const STEER_CHANNEL_CAPACITY: usize = 16;
const REPLY_CHANNEL_CAPACITY: usize = 32;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue: QueueSettings,
    /// Mode override keyed by the surface of a session's first event.
    pub by_surface: HashMap<Surface, QueueMode>,
    pub max_concurrent: usize,
    /// Idle session actors exit after this long. `None` keeps them until evicted.
    pub idle_retention: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue: QueueSettings::default(),
            by_surface: HashMap::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            idle_retention: Some(DEFAULT_IDLE_RETENTION),
        }
    }
}

impl DispatcherConfig {
    pub fn mode_for(&self, surface: Surface) -> QueueMode {
        self.by_surface
            .get(&surface)
            .copied()
            .unwrap_or(self.queue.mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone)]
pub enum DispatchOutput {
    Reply {
        session_key: SessionKey,
        run_id: Uuid,
        origin: RunOrigin,
        kind: ReplyKind,
        payload: ReplyPayload,
    },
    RunFinished {
        session_key: SessionKey,
        run_id: Uuid,
        origin: RunOrigin,
        outcome: RunOutcome,
    },
}

impl DispatchOutput {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::Reply { run_id, .. } | Self::RunFinished { run_id, .. } => *run_id,
        }
    }

    pub fn session_key(&self) -> &SessionKey {
        match self {
            Self::Reply { session_key, .. } | Self::RunFinished { session_key, .. } => session_key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub mode: QueueMode,
    pub phase: Phase,
    pub backlog: usize,
    pub run_id: Option<Uuid>,
}

enum SessionCommand {
    Event(CanonicalInboundEvent),
    Abort,
    SetMode(QueueMode),
    Status(oneshot::Sender<SessionStatus>),
    /// Acked once the running turn has been joined and its slot released.
    Evict(oneshot::Sender<()>),
}

struct SessionHandle {
    id: Uuid,
    command_tx: mpsc::Sender<SessionCommand>,
}

type Sessions = Arc<DashMap<SessionKey, SessionHandle>>;
type SlotFuture = BoxFuture<'static, std::result::Result<OwnedSemaphorePermit, AcquireError>>;

#[derive(Clone)]
struct SessionContext {
    config: Arc<DispatcherConfig>,
    agent: Arc<dyn AgentRunner>,
    slots: Arc<Semaphore>,
    output_tx: mpsc::Sender<DispatchOutput>,
    shutdown: CancellationToken,
    sessions: Sessions,
    finished_runs: Arc<AtomicU64>,
}

pub struct Dispatcher {
    ctx: SessionContext,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        agent: Arc<dyn AgentRunner>,
    ) -> (Self, mpsc::Receiver<DispatchOutput>) {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let max_concurrent = config.max_concurrent.max(1);
        let ctx = SessionContext {
            config: Arc::new(config),
            agent,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            output_tx,
            shutdown: CancellationToken::new(),
            sessions: Arc::new(DashMap::new()),
            finished_runs: Arc::new(AtomicU64::new(0)),
        };
        (Self { ctx }, output_rx)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.ctx.config
    }

    /// Hand an event to its session, creating the session actor on first use.
    pub async fn dispatch(&self, key: SessionKey, event: CanonicalInboundEvent) -> Result<()> {
        let surface = event.surface;
        self.ctx.send(&key, surface, SessionCommand::Event(event)).await
    }

    /// Cancel the running turn. The backlog is kept and runs next.
    pub async fn abort(&self, key: &SessionKey) -> bool {
        self.send_existing(key, SessionCommand::Abort).await
    }

    pub async fn set_mode(&self, key: &SessionKey, surface: Surface, mode: QueueMode) -> Result<()> {
        self.ctx.send(key, surface, SessionCommand::SetMode(mode)).await
    }

    pub async fn status(&self, key: &SessionKey) -> Option<SessionStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if !self
            .send_existing(key, SessionCommand::Status(reply_tx))
            .await
        {
            return None;
        }
        reply_rx.await.ok()
    }

    /// Drop the session: its running turn is cancelled and pending events discarded.
    /// Returns once the turn has ended, so a later event for `key` cannot overlap it.
    pub async fn evict(&self, key: &SessionKey) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if !self.send_existing(key, SessionCommand::Evict(ack_tx)).await {
            return false;
        }
        ack_rx.await.is_ok()
    }

    pub fn shutdown(&self) {
        tracing::info!(sessions = self.ctx.sessions.len(), "dispatcher shutting down");
        self.ctx.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    pub fn running_count(&self) -> usize {
        self.ctx
            .config
            .max_concurrent
            .max(1)
            .saturating_sub(self.ctx.slots.available_permits())
    }

    pub fn session_count(&self) -> usize {
        self.ctx.sessions.len()
    }

    /// Runs whose `RunFinished` has been emitted.
    pub fn finished_runs(&self) -> u64 {
        self.ctx.finished_runs.load(Ordering::Acquire)
    }

    /// No session has a running turn or pending events.
    pub async fn is_idle(&self) -> bool {
        let keys: Vec<SessionKey> = self
            .ctx
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            let busy = self
                .status(&key)
                .await
                .is_some_and(|status| status.phase != Phase::Idle || status.run_id.is_some());
            if busy {
                return false;
            }
        }
        true
    }

    async fn send_existing(&self, key: &SessionKey, command: SessionCommand) -> bool {
        let tx = match self.ctx.sessions.get(key) {
            Some(handle) => handle.command_tx.clone(),
            None => return false,
        };
        tx.send(command).await.is_ok()
    }
}

impl SessionContext {
    async fn send(&self, key: &SessionKey, surface: Surface, command: SessionCommand) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }
        let mut command = command;
        // A second attempt covers an actor that retired between lookup and send.
        for _ in 0..2 {
            let tx = self.command_tx(key, surface);
            match tx.send(command).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    self.sessions
                        .remove_if(key, |_, handle| handle.command_tx.same_channel(&tx));
                    command = returned;
                }
            }
            if self.shutdown.is_cancelled() {
                return Err(DispatchError::ShuttingDown);
            }
        }
        Err(DispatchError::SessionClosed(key.clone()))
    }

    fn command_tx(&self, key: &SessionKey, surface: Surface) -> mpsc::Sender<SessionCommand> {
        self.sessions
            .entry(key.clone())
            .or_insert_with(|| self.spawn_session(key.clone(), surface))
            .command_tx
            .clone()
    }

    fn spawn_session(&self, key: SessionKey, surface: Surface) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let settings = QueueSettings {
            mode: self.config.mode_for(surface),
            ..self.config.queue
        };
        tracing::debug!(session_key = %key, %surface, mode = %settings.mode, "session actor spawned");
        let id = Uuid::new_v4();
        tokio::spawn(session_task(key, surface, id, settings, self.clone(), command_rx));
        SessionHandle { id, command_tx }
    }
}

struct ActiveRun {
    run_id: Uuid,
    origin: RunOrigin,
    cancel: CancellationToken,
    steer_tx: mpsc::Sender<CanonicalInboundEvent>,
    steer: SteerInbox,
    replies: mpsc::Receiver<AgentOutput>,
    handle: JoinHandle<anyhow::Result<()>>,
    _permit: OwnedSemaphorePermit,
}

enum RunEvent {
    Reply(AgentOutput),
    Joined(std::result::Result<anyhow::Result<()>, JoinError>),
}

#[tracing::instrument(level = "info", skip_all, fields(session_key = %key))]
async fn session_task(
    key: SessionKey,
    surface: Surface,
    id: Uuid,
    settings: QueueSettings,
    ctx: SessionContext,
    mut commands: mpsc::Receiver<SessionCommand>,
) {
    let mut queue = SessionQueue::new(settings);
    let mut active: Option<ActiveRun> = None;
    let mut pending_slot: Option<SlotFuture> = None;

    loop {
        let now = Instant::now();
        let ready = active.is_none() && queue.is_ready(now);
        if !ready {
            pending_slot = None;
        } else if pending_slot.is_none() {
            pending_slot = Some(Box::pin(Arc::clone(&ctx.slots).acquire_owned()));
        }
        let debounce = queue
            .debounce_deadline()
            .filter(|deadline| active.is_none() && *deadline > now);
        let idle = active.is_none() && queue.phase() == Phase::Idle;

        tokio::select! {
            biased;

            () = ctx.shutdown.cancelled() => {
                if let Some(run) = active.take() {
                    cancel_run(&key, &ctx, &mut queue, run).await;
                }
                let dropped = queue.clear();
                if dropped > 0 {
                    tracing::info!(dropped, "pending events discarded on shutdown");
                }
                break;
            }

            command = commands.recv() => {
                let Some(command) = command else {
                    if let Some(run) = active.take() {
                        cancel_run(&key, &ctx, &mut queue, run).await;
                    }
                    break;
                };
                match command {
                    SessionCommand::Event(event) => {
                        admit(&key, &ctx, &mut queue, &mut active, event).await;
                    }
                    SessionCommand::Abort => {
                        if let Some(run) = active.take() {
                            tracing::info!(run_id = %run.run_id, "run aborted");
                            cancel_run(&key, &ctx, &mut queue, run).await;
                        }
                    }
                    SessionCommand::SetMode(mode) => {
                        tracing::info!(from = %queue.mode(), to = %mode, "queue mode changed");
                        queue.set_mode(mode);
                    }
                    SessionCommand::Status(reply_tx) => {
                        let _ = reply_tx.send(SessionStatus {
                            mode: queue.mode(),
                            phase: queue.phase(),
                            backlog: queue.backlog_len(),
                            run_id: active.as_ref().map(|run| run.run_id),
                        });
                    }
                    SessionCommand::Evict(ack) => {
                        if let Some(run) = active.take() {
                            cancel_run(&key, &ctx, &mut queue, run).await;
                        }
                        let dropped = queue.clear();
                        tracing::info!(dropped, "session evicted");
                        retire(&key, surface, id, &ctx, &mut commands).await;
                        let _ = ack.send(());
                        return;
                    }
                }
            }

            run_event = next_run_event(&mut active) => match run_event {
                RunEvent::Reply(output) => {
                    if let Some(run) = active.as_ref() {
                        forward_reply(&key, &ctx, run, output).await;
                    }
                }
                RunEvent::Joined(joined) => {
                    if let Some(run) = active.take() {
                        complete_run(&key, &ctx, &mut queue, run, joined).await;
                    }
                }
            },

            () = sleep_until(debounce) => {}

            permit = acquire_slot(&mut pending_slot) => {
                pending_slot = None;
                match permit {
                    Ok(permit) => {
                        if let Some(events) = queue.take_ready(Instant::now()) {
                            active = start_run(&key, &ctx, events, permit);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%e, "concurrency limiter closed");
                        break;
                    }
                }
            }

            () = idle_timeout(ctx.config.idle_retention), if idle => {
                tracing::debug!("idle session actor exiting");
                break;
            }
        }
    }

    retire(&key, surface, id, &ctx, &mut commands).await;
}

/// Unregister the actor, then hand commands that raced its exit to a successor.
async fn retire(
    key: &SessionKey,
    surface: Surface,
    id: Uuid,
    ctx: &SessionContext,
    commands: &mut mpsc::Receiver<SessionCommand>,
) {
    ctx.sessions.remove_if(key, |_, handle| handle.id == id);
    commands.close();
    while let Ok(command) = commands.try_recv() {
        let (surface, command) = match command {
            SessionCommand::Event(event) => (event.surface, SessionCommand::Event(event)),
            SessionCommand::SetMode(mode) => (surface, SessionCommand::SetMode(mode)),
            SessionCommand::Evict(ack) => {
                let _ = ack.send(());
                continue;
            }
            // Nothing runs any more; a dropped status sender reads as "no session".
            SessionCommand::Abort | SessionCommand::Status(_) => continue,
        };
        match ctx.send(key, surface, command).await {
            Ok(()) => tracing::debug!("command handed to successor actor"),
            Err(DispatchError::ShuttingDown) => {
                tracing::debug!("command discarded during shutdown");
            }
            Err(e) => tracing::warn!(%e, "command lost while session actor retired"),
        }
    }
}

async fn admit(
    key: &SessionKey,
    ctx: &SessionContext,
    queue: &mut SessionQueue,
    active: &mut Option<ActiveRun>,
    event: CanonicalInboundEvent,
) {
    let message_id = event.message_id.clone();
    match queue.on_event(event, Instant::now()) {
        Admission::Ready => {
            tracing::debug!(%message_id, "session ready");
        }
        Admission::Interrupt => {
            if let Some(run) = active.take() {
                tracing::info!(run_id = %run.run_id, %message_id, "interrupting run");
                cancel_run(key, ctx, queue, run).await;
            }
        }
        Admission::Steer(event) => {
            let rejected = match active.as_ref() {
                Some(run) => run.steer_tx.try_send(event).err().map(|e| e.into_inner()),
                None => Some(event),
            };
            match rejected {
                Some(event) => {
                    tracing::debug!(%message_id, "steer rejected; event backlogged");
                    if let Some(dropped) = queue.on_steer_rejected(event) {
                        tracing::info!(?dropped, "backlog overflow");
                    }
                }
                None => tracing::debug!(%message_id, "event steered into running turn"),
            }
        }
        Admission::Enqueued(dropped) => {
            tracing::debug!(%message_id, backlog = queue.backlog_len(), "event backlogged");
            if let Some(dropped) = dropped {
                tracing::info!(?dropped, "backlog overflow");
            }
        }
    }
}

fn start_run(
    key: &SessionKey,
    ctx: &SessionContext,
    events: Vec<CanonicalInboundEvent>,
    permit: OwnedSemaphorePermit,
) -> Option<ActiveRun> {
    let request = RunRequest::new(key.clone(), events)?;
    let (steer_tx, steer) = SteerInbox::channel(STEER_CHANNEL_CAPACITY);
    let (replies_tx, replies) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
    let cancel = ctx.shutdown.child_token();
    let run_id = request.run_id;
    let origin = request.origin.clone();
    tracing::info!(%run_id, events = request.events.len(), surface = %origin.surface, "agent run started");

    let handle = tokio::spawn({
        let agent = Arc::clone(&ctx.agent);
        let steer = steer.clone();
        let cancel = cancel.clone();
        async move { agent.run(request, steer, replies_tx, cancel).await }
    });

    Some(ActiveRun {
        run_id,
        origin,
        cancel,
        steer_tx,
        steer,
        replies,
        handle,
        _permit: permit,
    })
}

async fn forward_reply(key: &SessionKey, ctx: &SessionContext, run: &ActiveRun, output: AgentOutput) {
    if run.cancel.is_cancelled() {
        return;
    }
    emit(
        ctx,
        DispatchOutput::Reply {
            session_key: key.clone(),
            run_id: run.run_id,
            origin: run.origin.clone(),
            kind: output.kind,
            payload: output.payload,
        },
    )
    .await;
}

async fn complete_run(
    key: &SessionKey,
    ctx: &SessionContext,
    queue: &mut SessionQueue,
    mut run: ActiveRun,
    joined: std::result::Result<anyhow::Result<()>, JoinError>,
) {
    while let Ok(output) = run.replies.try_recv() {
        forward_reply(key, ctx, &run, output).await;
    }
    let outcome = match joined {
        Ok(Ok(())) if run.cancel.is_cancelled() => RunOutcome::Cancelled,
        Ok(Ok(())) => RunOutcome::Completed,
        Ok(Err(e)) => {
            tracing::warn!(%e, run_id = %run.run_id, "agent run failed");
            RunOutcome::Failed(e.to_string())
        }
        Err(e) => {
            tracing::warn!(%e, run_id = %run.run_id, "agent task panicked");
            RunOutcome::Failed(e.to_string())
        }
    };
    finish(key, ctx, queue, run, outcome).await;
}

async fn cancel_run(key: &SessionKey, ctx: &SessionContext, queue: &mut SessionQueue, mut run: ActiveRun) {
    run.cancel.cancel();
    run.handle.abort();
    let _ = (&mut run.handle).await;
    finish(key, ctx, queue, run, RunOutcome::Cancelled).await;
}

async fn finish(
    key: &SessionKey,
    ctx: &SessionContext,
    queue: &mut SessionQueue,
    run: ActiveRun,
    outcome: RunOutcome,
) {
    let ActiveRun {
        run_id,
        origin,
        steer,
        _permit: permit,
        ..
    } = run;
    drop(permit);

    for event in steer.reclaim().await {
        if let Some(dropped) = queue.on_steer_rejected(event) {
            tracing::info!(?dropped, "backlog overflow");
        }
    }
    tracing::info!(%run_id, ?outcome, backlog = queue.backlog_len(), "agent run finished");
    emit(
        ctx,
        DispatchOutput::RunFinished {
            session_key: key.clone(),
            run_id,
            origin,
            outcome,
        },
    )
    .await;
    ctx.finished_runs.fetch_add(1, Ordering::AcqRel);
    queue.on_run_finished(Instant::now());
}

async fn emit(ctx: &SessionContext, output: DispatchOutput) {
    if ctx.output_tx.send(output).await.is_err() {
        tracing::debug!("dispatch output receiver dropped");
    }
}

async fn next_run_event(active: &mut Option<ActiveRun>) -> RunEvent {
    let Some(run) = active.as_mut() else {
        return std::future::pending().await;
    };
    tokio::select! {
        biased;
        Some(output) = run.replies.recv() => RunEvent::Reply(output),
        joined = &mut run.handle => RunEvent::Joined(joined),
    }
}

async fn acquire_slot(
    pending: &mut Option<SlotFuture>,
) -> std::result::Result<OwnedSemaphorePermit, AcquireError> {
    match pending.as_mut() {
        Some(slot) => slot.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn idle_timeout(retention: Option<Duration>) {
    match retention {
        Some(retention) => tokio::time::sleep(retention).await,
        None => std::future::pending().await,
    }
}
