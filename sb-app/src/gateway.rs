//! Session multiplexer: every channel adapter feeds one inbound queue, and one
//! delivery loop turns dispatcher output into platform sends.

use crate::commands::{self, ControlCommand, QueueArg, SlashCommandGrammar};
use crate::config::RuntimePolicy;
use crate::last_route::LastRouteStore;
use anyhow::Result;
use sb_channels::{
    CanonicalInboundEvent, ChannelAdapter, ChatType, ReplyKind, ReplyPayload, SessionKey, Surface,
};
use sb_dispatch::{
    AgentRunner, DedupeCache, DeliveryFailure, DeliveryReport, DispatchOutput, Dispatcher,
    QueueMode, ReplyTargetPicker, RunOutcome, deliver_all, route, sequence, sequence_payload,
};
use sb_policy::AuthorizationVerdict;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What the gateway did with one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    Duplicate,
    NoAdapter,
    Rejected(AuthorizationVerdict),
    Command(ControlCommand),
    Dispatched(SessionKey),
}

/// Delivery failures for one payload, tagged with where it sat in the turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryIssue {
    pub surface: Surface,
    pub to: String,
    pub kind: ReplyKind,
    pub failures: Vec<DeliveryFailure>,
}

pub struct GatewayTasks {
    pub inbound: JoinHandle<()>,
    pub delivery: JoinHandle<()>,
}

pub struct Gateway {
    policy: RuntimePolicy,
    started_at: Instant,
    dispatcher: Arc<Dispatcher>,
    adapters: HashMap<Surface, Arc<dyn ChannelAdapter>>,
    dedupe: DedupeCache,
    last_route: Arc<LastRouteStore>,
    grammar: SlashCommandGrammar,
    inbound_rx: Arc<Mutex<mpsc::Receiver<CanonicalInboundEvent>>>,
    outputs_rx: Arc<Mutex<mpsc::Receiver<DispatchOutput>>>,
    delivered_runs: AtomicU64,
    delivery_issues: Option<mpsc::Sender<DeliveryIssue>>,
}

impl Gateway {
    pub fn new(
        policy: RuntimePolicy,
        agent: Arc<dyn AgentRunner>,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
        last_route: Arc<LastRouteStore>,
        inbound_rx: mpsc::Receiver<CanonicalInboundEvent>,
    ) -> Self {
        let (dispatcher, outputs_rx) = Dispatcher::new(policy.dispatcher.clone(), agent);
        let adapters = adapters
            .into_iter()
            .map(|adapter| (adapter.surface(), adapter))
            .collect();
        Self {
            policy,
            started_at: Instant::now(),
            dispatcher: Arc::new(dispatcher),
            adapters,
            dedupe: DedupeCache::default(),
            last_route,
            grammar: SlashCommandGrammar,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            outputs_rx: Arc::new(Mutex::new(outputs_rx)),
            delivered_runs: AtomicU64::new(0),
            delivery_issues: None,
        }
    }

    /// Report delivery failures on `tx` in addition to logging them.
    pub fn with_delivery_issues(mut self, tx: mpsc::Sender<DeliveryIssue>) -> Self {
        self.delivery_issues = Some(tx);
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn surfaces(&self) -> Vec<Surface> {
        let mut surfaces: Vec<Surface> = self.adapters.keys().copied().collect();
        surfaces.sort();
        surfaces
    }

    /// Hand every adapter the inbound sender. A failing adapter aborts startup.
    pub async fn start_adapters(&self, tx: mpsc::Sender<CanonicalInboundEvent>) -> Result<()> {
        for surface in self.surfaces() {
            let Some(adapter) = self.adapters.get(&surface) else {
                continue;
            };
            adapter
                .start(tx.clone())
                .await
                .map_err(|e| anyhow::anyhow!("start {surface} adapter: {e}"))?;
            tracing::info!(%surface, "channel adapter started");
        }
        Ok(())
    }

    pub fn start(self: Arc<Self>) -> GatewayTasks {
        let inbound = tokio::spawn({
            let gateway = Arc::clone(&self);
            async move {
                if let Err(e) = gateway.run_loop().await {
                    tracing::error!(%e, "gateway loop exited");
                }
            }
        });
        let delivery = tokio::spawn(async move {
            if let Err(e) = self.delivery_loop().await {
                tracing::error!(%e, "delivery loop exited");
            }
        });
        GatewayTasks { inbound, delivery }
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    /// Wait until no session has pending work and every finished run's output
    /// has gone through the delivery loop.
    pub async fn wait_drained(&self) {
        loop {
            if self.dispatcher.is_idle().await
                && self.delivered_runs.load(Ordering::Acquire) == self.dispatcher.finished_runs()
            {
                return;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self) -> Result<()> {
        let shutdown = self.dispatcher.shutdown_token();
        loop {
            let inbound = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    () = shutdown.cancelled() => None,
                    inbound = rx.recv() => inbound,
                }
            };
            let Some(event) = inbound else {
                return Ok(());
            };

            if let Err(e) = self.handle_inbound(event).await {
                tracing::warn!(%e, "handle_inbound failed");
            }
        }
    }

    pub async fn handle_inbound(&self, event: CanonicalInboundEvent) -> Result<InboundOutcome> {
        if !self.dedupe.check_and_insert(&event.dedupe_key()) {
            tracing::debug!(surface = %event.surface, message_id = %event.message_id, "duplicate inbound dropped");
            return Ok(InboundOutcome::Duplicate);
        }
        let Some(adapter) = self.adapters.get(&event.surface).cloned() else {
            tracing::warn!(surface = %event.surface, "inbound event for a surface without an adapter");
            return Ok(InboundOutcome::NoAdapter);
        };

        let group_id = adapter.group_identity(&event);
        let verdict = self
            .policy
            .evaluate(&event, group_id.as_deref(), &self.grammar);
        if !verdict.accepted() {
            tracing::debug!(
                surface = %event.surface,
                sender_id = %event.sender_id,
                chat_type = %event.chat_type,
                group_id = group_id.as_deref().unwrap_or(""),
                ?verdict,
                "inbound rejected"
            );
            return Ok(InboundOutcome::Rejected(verdict));
        }

        let key = route(self.policy.scope, &event, &self.policy.main_key);
        if event.chat_type == ChatType::Direct && key == self.policy.main_key {
            if let Err(e) = self
                .last_route
                .record(&key, event.surface, &event.from)
                .await
            {
                tracing::warn!(%e, session_key = %key, "failed to persist last route");
            }
        }

        if verdict.command_authorized {
            if let Some(command) = self.grammar.parse(&event.body) {
                tracing::info!(session_key = %key, command = command.name(), "control command");
                let reply = self.run_command(&key, &event, &command).await;
                self.reply_direct(adapter.as_ref(), &event, reply).await;
                return Ok(InboundOutcome::Command(command));
            }
        }

        tracing::debug!(session_key = %key, surface = %event.surface, message_id = %event.message_id, "inbound dispatched");
        self.dispatcher.dispatch(key.clone(), event).await?;
        Ok(InboundOutcome::Dispatched(key))
    }

    async fn run_command(
        &self,
        key: &SessionKey,
        event: &CanonicalInboundEvent,
        command: &ControlCommand,
    ) -> String {
        match command {
            ControlCommand::New | ControlCommand::Reset => {
                self.dispatcher.evict(key).await;
                "Session reset.".to_string()
            }
            ControlCommand::Stop => {
                if self.dispatcher.abort(key).await {
                    "Stopped.".to_string()
                } else {
                    "Nothing is running.".to_string()
                }
            }
            ControlCommand::Status => {
                let status = self.dispatcher.status(key).await;
                let (mode, phase, backlog) = match &status {
                    Some(status) => (status.mode, status.phase.as_str(), status.backlog),
                    None => (self.default_mode(event.surface), "idle", 0),
                };
                let surfaces: Vec<&str> =
                    self.surfaces().into_iter().map(Surface::as_str).collect();
                format!(
                    "session={key}\nqueue_mode={mode}\nphase={phase}\nbacklog={backlog}\nrunning={}/{}\nchannels={}\nuptime_seconds={}",
                    self.dispatcher.running_count(),
                    self.dispatcher.config().max_concurrent,
                    surfaces.join(","),
                    self.started_at.elapsed().as_secs()
                )
            }
            ControlCommand::Queue(QueueArg::Show) => {
                let mode = match self.dispatcher.status(key).await {
                    Some(status) => status.mode,
                    None => self.default_mode(event.surface),
                };
                format!("queue_mode={mode}")
            }
            ControlCommand::Queue(QueueArg::Set(mode)) => {
                match self.dispatcher.set_mode(key, event.surface, *mode).await {
                    Ok(()) => format!("queue mode set to {mode}"),
                    Err(e) => format!("Error: {e}"),
                }
            }
            ControlCommand::Queue(QueueArg::Invalid(raw)) => {
                let modes: Vec<&str> = QueueMode::ALL.iter().map(|mode| mode.as_str()).collect();
                format!(
                    "unknown queue mode {raw:?}. available_modes={}",
                    modes.join(",")
                )
            }
            ControlCommand::Help => commands::help_text(),
        }
    }

    fn default_mode(&self, surface: Surface) -> QueueMode {
        self.dispatcher.config().mode_for(surface)
    }

    async fn reply_direct(
        &self,
        adapter: &dyn ChannelAdapter,
        event: &CanonicalInboundEvent,
        text: String,
    ) {
        let payload = ReplyPayload::text(text).with_reply_to(event.message_id.clone());
        let ops = sequence(
            &[payload],
            self.chunk_limit(adapter),
            self.reply_to_mode(event.surface),
        );
        let report = deliver_all(adapter, &event.from, ops).await;
        self.report(event.surface, &event.from, ReplyKind::Final, report)
            .await;
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn delivery_loop(&self) -> Result<()> {
        let shutdown = self.dispatcher.shutdown_token();
        let mut pickers: HashMap<Uuid, ReplyTargetPicker> = HashMap::new();
        loop {
            let output = {
                let mut rx = self.outputs_rx.lock().await;
                tokio::select! {
                    biased;
                    output = rx.recv() => output,
                    () = shutdown.cancelled() => None,
                }
            };
            let Some(output) = output else {
                return Ok(());
            };
            self.deliver_output(&mut pickers, output).await;
        }
    }

    async fn deliver_output(
        &self,
        pickers: &mut HashMap<Uuid, ReplyTargetPicker>,
        output: DispatchOutput,
    ) {
        match output {
            DispatchOutput::Reply {
                session_key,
                run_id,
                origin,
                kind,
                mut payload,
            } => {
                let Some(adapter) = self.adapters.get(&origin.surface) else {
                    tracing::warn!(surface = %origin.surface, session_key = %session_key, "reply for a surface without an adapter");
                    return;
                };
                if payload.reply_to_id.is_none() {
                    payload.reply_to_id = Some(origin.message_id.clone());
                }
                let mode = self.reply_to_mode(origin.surface);
                let picker = pickers
                    .entry(run_id)
                    .or_insert_with(|| ReplyTargetPicker::new(mode));
                let ops = sequence_payload(&payload, self.chunk_limit(adapter.as_ref()), picker);
                let report = deliver_all(adapter.as_ref(), &origin.to, ops).await;
                self.report(origin.surface, &origin.to, kind, report).await;
            }
            DispatchOutput::RunFinished {
                session_key,
                run_id,
                origin,
                outcome,
            } => {
                pickers.remove(&run_id);
                if let RunOutcome::Failed(error) = outcome {
                    tracing::warn!(%run_id, session_key = %session_key, %error, "agent run failed");
                    if let Some(adapter) = self.adapters.get(&origin.surface) {
                        let payload = ReplyPayload::text(format!("Error: {error}"))
                            .with_reply_to(origin.message_id.clone());
                        let ops = sequence(
                            &[payload],
                            self.chunk_limit(adapter.as_ref()),
                            self.reply_to_mode(origin.surface),
                        );
                        let report = deliver_all(adapter.as_ref(), &origin.to, ops).await;
                        self.report(origin.surface, &origin.to, ReplyKind::Final, report)
                            .await;
                    }
                }
                self.delivered_runs.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    async fn report(&self, surface: Surface, to: &str, kind: ReplyKind, report: DeliveryReport) {
        if report.is_complete() {
            return;
        }
        tracing::warn!(
            %surface,
            to,
            %kind,
            delivered = report.delivered.len(),
            failed = report.failures.len(),
            "reply delivery incomplete"
        );
        if let Some(tx) = &self.delivery_issues {
            let issue = DeliveryIssue {
                surface,
                to: to.to_string(),
                kind,
                failures: report.failures,
            };
            if tx.send(issue).await.is_err() {
                tracing::debug!("delivery issue receiver dropped");
            }
        }
    }

    fn chunk_limit(&self, adapter: &dyn ChannelAdapter) -> usize {
        self.policy
            .surface(adapter.surface())
            .and_then(|runtime| runtime.text_chunk_limit)
            .unwrap_or_else(|| adapter.text_chunk_limit())
    }

    fn reply_to_mode(&self, surface: Surface) -> sb_dispatch::ReplyToMode {
        self.policy
            .surface(surface)
            .map(|runtime| runtime.reply_to_mode)
            .unwrap_or_default()
    }
}
