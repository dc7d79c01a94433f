//! Push Channel - One Managed Connection
//!
//! Each channel is a task owning one push link. The supervisor talks to it
//! through a command queue and observes it through a `watch` of its
//! [`ConnectionState`] and through [`PushEvent`]s.
//!
//! # State Machine
//!
//! ```text
//!  Idle ──► Connecting ──► Open ──► Subscribing ──► Subscribed
//!               ▲            │           │               │
//!               │            └───────────┴───────┬───────┘
//!               │                   transport error
//!               │                                ▼
//!               └──────── backoff delay ── Reconnecting
//!
//!  close: any state ──► Closing ──► Closed
//!  credentials refused: ──► Closed (no reconnect)
//! ```
//!
//! The channel remembers which topics it should carry, so a reconnect
//! re-subscribes every topic that was subscribed before the drop.
//!
//! A multiplexed channel subscribes topics with explicit control frames. An
//! implicit channel serves exactly one topic and counts as subscribed once
//! open; every frame on it is a sample for that topic.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::backoff::Backoff;
use super::protocol::{self, AckStatus, ClientFrame, ServerFrame};
use super::transport::{ConnectRequest, PushConnector, PushLink};
use super::PushConfig;
use crate::error::TransportError;
use crate::sample::{Payload, Sample, SampleOrigin};
use crate::store::SampleSink;
use crate::topic::TopicId;

/// Identifies a managed connection
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKey {
    /// The multiplexed price channel
    Shared,
    /// A channel dedicated to one topic
    Dedicated(TopicId),
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Dedicated(topic) => write!(f, "dedicated:{topic}"),
        }
    }
}

/// Lifecycle state of a managed connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Created, not yet connecting
    #[default]
    Idle,
    /// Connect attempt in progress
    Connecting,
    /// Link open, nothing subscribed
    Open,
    /// Subscribe frames awaiting acknowledgement
    Subscribing,
    /// All requested subscriptions acknowledged
    Subscribed,
    /// Waiting out the backoff delay after a transport error
    Reconnecting,
    /// Flushing unsubscribes before closing
    Closing,
    /// Terminated; no transport handle remains
    Closed,
}

impl ConnectionState {
    /// Whether frames can be written
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open | Self::Subscribing | Self::Subscribed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Subscribing => "subscribing",
            Self::Subscribed => "subscribed",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a subscription did not take effect
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscribeFailure {
    /// Server answered with an error acknowledgement
    Rejected(String),
    /// No acknowledgement within the subscribe-ack timeout
    AckTimeout,
}

/// Events emitted by push channels
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushEvent {
    /// A channel changed state
    StateChanged {
        /// Channel that changed
        channel: ChannelKey,
        /// New state
        state: ConnectionState,
    },
    /// A topic's subscription was confirmed
    Subscribed {
        /// Confirmed topic
        topic: TopicId,
    },
    /// A topic's subscription failed; the connection is kept
    SubscribeFailed {
        /// Affected topic
        topic: TopicId,
        /// What went wrong
        reason: SubscribeFailure,
    },
    /// Credentials were refused; the channel is closed and will not retry
    AuthFailed {
        /// Channel that was refused
        channel: ChannelKey,
        /// Topics the channel was carrying
        topics: Vec<TopicId>,
        /// Reason given by the server or transport
        reason: String,
    },
}

#[derive(Debug)]
pub(crate) enum ChannelCommand {
    Subscribe(TopicId),
    Unsubscribe(TopicId),
    Close(oneshot::Sender<()>),
}

enum Connect {
    Linked(Box<dyn PushLink>),
    Failed(TransportError),
    Stop(Option<oneshot::Sender<()>>),
}

enum Exit {
    Reconnect,
    Stop,
}

/// Whether an error acknowledgement refers to credentials
fn is_auth_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["unauthorized", "forbidden", "credential", "auth", "token", "인증"]
        .iter()
        .any(|needle| lower.contains(needle))
}

struct ChannelActor {
    key: ChannelKey,
    implicit: Option<TopicId>,
    config: PushConfig,
    request: ConnectRequest,
    connector: Arc<dyn PushConnector>,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<PushEvent>,
    sink: SampleSink,
    backoff: Backoff,
    desired: BTreeSet<TopicId>,
    confirmed: HashSet<TopicId>,
    outstanding: VecDeque<(TopicId, Instant)>,
    saw_sample: bool,
}

impl ChannelActor {
    async fn run(mut self) {
        tracing::debug!(channel = %self.key, url = %self.request.url, "Push channel started");
        loop {
            self.set_state(ConnectionState::Connecting);
            let link = match self.connect().await {
                Connect::Linked(link) => link,
                Connect::Failed(e) if e.is_auth() => {
                    self.fail_auth(e.to_string());
                    return;
                }
                Connect::Failed(e) => {
                    tracing::warn!(channel = %self.key, error = %e, "Push connect failed");
                    if self.wait_reconnect().await {
                        continue;
                    }
                    return;
                }
                Connect::Stop(ack) => {
                    self.finish(ack);
                    return;
                }
            };

            match self.drive(link).await {
                Exit::Reconnect => {
                    if !self.wait_reconnect().await {
                        return;
                    }
                }
                Exit::Stop => return,
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        self.state_tx.send_replace(state);
        tracing::debug!(channel = %self.key, %state, "Push channel state changed");
        let _ = self.events.send(PushEvent::StateChanged {
            channel: self.key.clone(),
            state,
        });
    }

    fn emit(&self, event: PushEvent) {
        let _ = self.events.send(event);
    }

    fn finish(&self, ack: Option<oneshot::Sender<()>>) {
        self.set_state(ConnectionState::Closed);
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn fail_auth(&mut self, reason: String) {
        // Topics still queued are refused along with the rest
        while let Ok(command) = self.commands.try_recv() {
            if let Some(ack) = self.absorb(command) {
                let _ = ack.send(());
            }
        }
        tracing::error!(channel = %self.key, %reason, "Push credentials rejected");
        self.emit(PushEvent::AuthFailed {
            channel: self.key.clone(),
            topics: self.desired.iter().cloned().collect(),
            reason,
        });
        self.set_state(ConnectionState::Closed);
    }

    /// Apply a queued command after the channel gave up, handing back a close ack
    fn absorb(&mut self, command: ChannelCommand) -> Option<oneshot::Sender<()>> {
        match self.apply_offline(Some(command)) {
            ControlFlow::Break(ack) => ack,
            ControlFlow::Continue(()) => None,
        }
    }

    /// Apply a command while no link is open
    fn apply_offline(
        &mut self,
        command: Option<ChannelCommand>,
    ) -> ControlFlow<Option<oneshot::Sender<()>>> {
        match command {
            Some(ChannelCommand::Subscribe(topic)) => {
                if self.implicit.is_none() {
                    self.desired.insert(topic);
                }
                ControlFlow::Continue(())
            }
            Some(ChannelCommand::Unsubscribe(topic)) => {
                self.desired.remove(&topic);
                self.confirmed.remove(&topic);
                ControlFlow::Continue(())
            }
            Some(ChannelCommand::Close(ack)) => ControlFlow::Break(Some(ack)),
            None => ControlFlow::Break(None),
        }
    }

    async fn connect(&mut self) -> Connect {
        let connector = Arc::clone(&self.connector);
        let request = self.request.clone();
        let attempt = tokio::time::timeout(self.config.connect_timeout, async move {
            connector.connect(&request).await
        });
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(Ok(link)) => Connect::Linked(link),
                        Ok(Err(e)) => Connect::Failed(e),
                        Err(_) => Connect::Failed(TransportError::ConnectTimeout),
                    };
                }
                command = self.commands.recv() => {
                    if let ControlFlow::Break(ack) = self.apply_offline(command) {
                        return Connect::Stop(ack);
                    }
                }
            }
        }
    }

    /// Wait out the reconnect backoff
    ///
    /// Returns false if the channel was closed meanwhile.
    async fn wait_reconnect(&mut self) -> bool {
        self.set_state(ConnectionState::Reconnecting);
        self.confirmed.clear();
        self.outstanding.clear();
        self.sink.store().stats().record_reconnect();

        let delay = self.backoff.next_delay();
        tracing::info!(
            channel = %self.key,
            delay_ms = delay.as_millis() as u64,
            attempt = self.backoff.attempts(),
            "Reconnecting after backoff"
        );

        let backoff_delay = tokio::time::sleep(delay);
        tokio::pin!(backoff_delay);
        loop {
            tokio::select! {
                () = &mut backoff_delay => return true,
                command = self.commands.recv() => {
                    if let ControlFlow::Break(ack) = self.apply_offline(command) {
                        self.finish(ack);
                        return false;
                    }
                }
            }
        }
    }

    async fn drive(&mut self, mut link: Box<dyn PushLink>) -> Exit {
        self.set_state(ConnectionState::Open);
        self.saw_sample = false;

        if let Err(e) = self.on_open(&mut link).await {
            tracing::warn!(channel = %self.key, error = %e, "Resubscribe failed");
            return Exit::Reconnect;
        }

        let period = (self.config.subscribe_ack_timeout / 4).max(Duration::from_millis(10));
        let mut ack_check = tokio::time::interval(period);
        ack_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                frame = link.recv() => match frame {
                    Ok(text) => {
                        if let ControlFlow::Break(reason) = self.on_frame(&text) {
                            self.shutdown(&mut link).await;
                            self.fail_auth(reason);
                            return Exit::Stop;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(channel = %self.key, error = %e, "Push link dropped");
                        return Exit::Reconnect;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(ChannelCommand::Subscribe(topic)) => {
                        if let Err(e) = self.subscribe_online(&mut link, topic).await {
                            tracing::warn!(channel = %self.key, error = %e, "Subscribe send failed");
                            return Exit::Reconnect;
                        }
                    }
                    Some(ChannelCommand::Unsubscribe(topic)) => {
                        if let Err(e) = self.unsubscribe_online(&mut link, topic).await {
                            tracing::warn!(channel = %self.key, error = %e, "Unsubscribe send failed");
                            return Exit::Reconnect;
                        }
                    }
                    Some(ChannelCommand::Close(ack)) => {
                        self.shutdown(&mut link).await;
                        self.finish(Some(ack));
                        return Exit::Stop;
                    }
                    None => {
                        self.shutdown(&mut link).await;
                        self.finish(None);
                        return Exit::Stop;
                    }
                },
                _ = ack_check.tick() => self.check_ack_timeouts(),
            }
        }
    }

    async fn on_open(&mut self, link: &mut Box<dyn PushLink>) -> Result<(), TransportError> {
        if let Some(topic) = self.implicit.clone() {
            self.set_state(ConnectionState::Subscribed);
            self.confirm(&topic);
            return Ok(());
        }

        let topics: Vec<TopicId> = self.desired.iter().cloned().collect();
        if !topics.is_empty() {
            tracing::debug!(channel = %self.key, count = topics.len(), "Subscribing topics");
        }
        for topic in topics {
            link.send(ClientFrame::Subscribe(topic.clone()).encode()).await?;
            self.outstanding.push_back((topic, Instant::now()));
        }
        self.refresh_state();
        Ok(())
    }

    async fn subscribe_online(
        &mut self,
        link: &mut Box<dyn PushLink>,
        topic: TopicId,
    ) -> Result<(), TransportError> {
        if self.implicit.is_some() || !self.desired.insert(topic.clone()) {
            return Ok(());
        }
        link.send(ClientFrame::Subscribe(topic.clone()).encode()).await?;
        self.outstanding.push_back((topic, Instant::now()));
        self.refresh_state();
        Ok(())
    }

    async fn unsubscribe_online(
        &mut self,
        link: &mut Box<dyn PushLink>,
        topic: TopicId,
    ) -> Result<(), TransportError> {
        if !self.desired.remove(&topic) {
            return Ok(());
        }
        self.confirmed.remove(&topic);
        self.outstanding.retain(|(t, _)| *t != topic);

        if self.state_tx.borrow().is_open() {
            link.send(ClientFrame::Unsubscribe(topic).encode()).await?;
        }
        self.refresh_state();
        Ok(())
    }

    /// Best-effort unsubscribe flush bounded by the grace period, then close
    async fn shutdown(&mut self, link: &mut Box<dyn PushLink>) {
        self.set_state(ConnectionState::Closing);
        let grace = self.config.unsubscribe_grace;

        let frames: Vec<String> = if self.implicit.is_some() {
            Vec::new()
        } else {
            self.desired
                .iter()
                .map(|topic| ClientFrame::Unsubscribe(topic.clone()).encode())
                .collect()
        };
        let flush = async {
            for frame in frames {
                if link.send(frame).await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(grace, flush).await.is_err() {
            tracing::debug!(channel = %self.key, "Unsubscribe flush exceeded grace period");
        }
        let _ = tokio::time::timeout(grace, link.close()).await;
    }

    /// Handle one inbound frame
    ///
    /// Breaks with the server's message when it refused our credentials.
    fn on_frame(&mut self, text: &str) -> ControlFlow<String> {
        if let Some(topic) = self.implicit.clone() {
            self.on_implicit_frame(topic, text);
            return ControlFlow::Continue(());
        }

        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.sink.store().stats().record_malformed();
                tracing::warn!(channel = %self.key, error = %e, "Dropping malformed frame");
                return ControlFlow::Continue(());
            }
        };

        match frame {
            ServerFrame::Update {
                topic,
                payload,
                seq,
            } => {
                if !self.desired.contains(&topic) {
                    tracing::trace!(channel = %self.key, topic = %topic, "Update for topic not carried");
                    return ControlFlow::Continue(());
                }
                self.confirm(&topic);
                let sample = Sample::new(topic, Payload::Price(payload), seq, SampleOrigin::Push);
                self.sink.ingest(sample);
            }
            ServerFrame::Ack {
                status: AckStatus::Success,
                topic,
                ..
            } => {
                if let Some(topic) = self.take_outstanding(topic.as_ref()) {
                    self.confirm(&topic);
                }
            }
            ServerFrame::Ack {
                status: AckStatus::Error,
                message,
                topic,
            } => {
                if is_auth_message(&message) {
                    return ControlFlow::Break(message);
                }
                match self.take_outstanding(topic.as_ref()) {
                    Some(topic) => {
                        tracing::warn!(channel = %self.key, topic = %topic, %message, "Subscription rejected");
                        self.emit(PushEvent::SubscribeFailed {
                            topic,
                            reason: SubscribeFailure::Rejected(message),
                        });
                    }
                    None => {
                        tracing::warn!(channel = %self.key, %message, "Server error");
                    }
                }
            }
            ServerFrame::Ignored => {}
        }

        self.refresh_state();
        ControlFlow::Continue(())
    }

    fn on_implicit_frame(&mut self, topic: TopicId, text: &str) {
        match protocol::parse_alert(text) {
            Ok((alert, seq)) => {
                if !self.saw_sample {
                    self.saw_sample = true;
                    self.backoff.reset();
                }
                let sample = Sample::new(topic, Payload::Alert(alert), seq, SampleOrigin::Push);
                self.sink.ingest(sample);
            }
            Err(e) => {
                self.sink.store().stats().record_malformed();
                tracing::warn!(channel = %self.key, error = %e, "Dropping malformed frame");
            }
        }
    }

    /// Remove the outstanding subscribe an ack refers to
    ///
    /// Acks naming a topic match only that topic; anonymous acks match the
    /// oldest.
    fn take_outstanding(&mut self, topic: Option<&TopicId>) -> Option<TopicId> {
        match topic {
            Some(topic) => {
                let pos = self.outstanding.iter().position(|(t, _)| t == topic)?;
                self.outstanding.remove(pos).map(|(t, _)| t)
            }
            None => self.outstanding.pop_front().map(|(t, _)| t),
        }
    }

    fn confirm(&mut self, topic: &TopicId) {
        self.outstanding.retain(|(t, _)| t != topic);
        if self.confirmed.insert(topic.clone()) {
            self.backoff.reset();
            self.emit(PushEvent::Subscribed {
                topic: topic.clone(),
            });
        }
    }

    fn check_ack_timeouts(&mut self) {
        let timeout = self.config.subscribe_ack_timeout;
        let mut expired = false;
        while let Some((_, sent_at)) = self.outstanding.front() {
            if sent_at.elapsed() <= timeout {
                break;
            }
            let Some((topic, _)) = self.outstanding.pop_front() else {
                break;
            };
            tracing::warn!(channel = %self.key, topic = %topic, "Subscribe acknowledgement timed out");
            self.emit(PushEvent::SubscribeFailed {
                topic,
                reason: SubscribeFailure::AckTimeout,
            });
            expired = true;
        }
        if expired {
            self.refresh_state();
        }
    }

    fn refresh_state(&self) {
        if self.implicit.is_some() || !self.state_tx.borrow().is_open() {
            return;
        }
        let state = if !self.outstanding.is_empty() {
            ConnectionState::Subscribing
        } else if !self.confirmed.is_empty() {
            ConnectionState::Subscribed
        } else {
            ConnectionState::Open
        };
        self.set_state(state);
    }
}

/// Handle to a running push channel
///
/// Dropping the handle aborts the channel task, which drops its link.
pub(crate) struct ChannelHandle {
    key: ChannelKey,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
    close_budget: Duration,
}

impl ChannelHandle {
    /// Spawn a channel task
    ///
    /// `implicit` makes this a dedicated channel for that one topic.
    pub(crate) fn spawn(
        key: ChannelKey,
        implicit: Option<TopicId>,
        config: &PushConfig,
        request: ConnectRequest,
        connector: Arc<dyn PushConnector>,
        sink: SampleSink,
        events: mpsc::UnboundedSender<PushEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let backoff = Backoff::new(config.backoff, config.reconnect_delay, config.reconnect_max_delay)
            .with_jitter(config.reconnect_jitter);

        let actor = ChannelActor {
            key: key.clone(),
            desired: implicit.iter().cloned().collect(),
            implicit,
            config: config.clone(),
            request,
            connector,
            commands: command_rx,
            state_tx,
            events,
            sink,
            backoff,
            confirmed: HashSet::new(),
            outstanding: VecDeque::new(),
            saw_sample: false,
        };

        Self {
            key,
            commands: command_tx,
            state: state_rx,
            task: tokio::spawn(actor.run()),
            close_budget: config.unsubscribe_grace * 2 + Duration::from_millis(500),
        }
    }

    pub(crate) fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub(crate) fn subscribe(&self, topic: TopicId) -> bool {
        self.commands.send(ChannelCommand::Subscribe(topic)).is_ok()
    }

    pub(crate) fn unsubscribe(&self, topic: TopicId) -> bool {
        self.commands.send(ChannelCommand::Unsubscribe(topic)).is_ok()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Whether the task has ended (closed, or refused credentials)
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished() || self.state() == ConnectionState::Closed
    }

    /// Close the channel and wait for its task to end
    ///
    /// The task is aborted if it does not finish within the close budget.
    pub(crate) async fn close(mut self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let budget = self.close_budget;
        let graceful = async {
            if self.commands.send(ChannelCommand::Close(ack_tx)).is_ok() {
                let _ = ack_rx.await;
            }
            let _ = (&mut self.task).await;
        };
        if tokio::time::timeout(budget, graceful).await.is_err() {
            tracing::warn!(channel = %self.key, "Push channel did not close in time, aborting");
            self.task.abort();
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
