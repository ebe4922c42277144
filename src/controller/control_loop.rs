//! Control loop - owner of the device state
//!
//! Sequences startup, then drains the notification queue one event at a time.
//! All mutable device state (light level, connectivity, update state, reconnect
//! bookkeeping) lives in [`Controller`] and is only touched from here.
//!
//! ```text
//! SessionManager ─(link events)─┐
//! MqttHandler ──(channel events)─┼─► queue ─► Controller ─► store / output / publish
//! OtaReceiver ──(update events)──┤
//! timers ───(reconnect/restart)──┘
//! ```

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::event::{
    ChannelEvent, Event, EventReceiver, EventSender, LinkEvent, RestartReason, SessionId,
    UpdateEvent,
};
use super::ConnectivityState;
use crate::config::Config;
use crate::level::LightLevel;
use crate::mqtt::config::{
    CONNECTED, GET_LEVEL_QOS, LEVEL_QOS, SET_LEVEL_QOS, STATUS_QOS, UPDATE_DONE, UPDATE_STARTED,
};
use crate::mqtt::{Command, DecodeError, MessageTransport, Topics};
use crate::network::{LinkDriver, SessionManager};
use crate::output::OutputDriver;
use crate::persistence::SetpointStore;
use crate::update::{UpdateAgent, UpdateCoordinator, UpdateState};

/// Why the control loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The device must restart. Link exhaustion and a completed update both end here.
    Restart(RestartReason),
    /// Operator shutdown.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSettings {
    pub identity: String,
    pub topics: Topics,
    pub reconnect_delay: Duration,
    pub restart_grace: Duration,
}

impl ControlSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            identity: config.device.identity.clone(),
            topics: Topics::new(&config.broker.topic_prefix),
            reconnect_delay: config.broker.reconnect_delay(),
            restart_grace: config.update.restart_grace(),
        }
    }
}

pub struct Controller<D, C, O, U> {
    level: LightLevel,
    connectivity: ConnectivityState,
    update: UpdateCoordinator,
    reconnect_pending: bool,

    settings: ControlSettings,
    store: SetpointStore,
    output: O,
    session: SessionManager<D>,
    channel: C,
    agent: U,

    notify: EventSender,
    events: EventReceiver,
}

impl<D, C, O, U> Controller<D, C, O, U>
where
    D: LinkDriver,
    C: MessageTransport,
    O: OutputDriver,
    U: UpdateAgent,
{
    pub fn new(
        settings: ControlSettings,
        store: SetpointStore,
        output: O,
        session: SessionManager<D>,
        channel: C,
        agent: U,
        (notify, events): (EventSender, EventReceiver),
    ) -> Self {
        Self {
            level: LightLevel::default(),
            connectivity: ConnectivityState::Disconnected,
            update: UpdateCoordinator::new(),
            reconnect_pending: false,
            settings,
            store,
            output,
            session,
            channel,
            agent,
            notify,
            events,
        }
    }

    pub fn level(&self) -> LightLevel {
        self.level
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.connectivity
    }

    pub fn update_state(&self) -> UpdateState {
        self.update.state()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn store(&self) -> &SetpointStore {
        &self.store
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn agent(&self) -> &U {
        &self.agent
    }

    /// Handle for producers that feed the notification queue.
    pub fn notifier(&self) -> EventSender {
        self.notify.clone()
    }

    /// Runs the startup sequence and then the event loop until a restart is due or
    /// `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> Exit {
        let started = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Shutdown requested during startup");
                return Exit::Stopped;
            }
            started = self.start() => started,
        };
        if let Err(reason) = started {
            return Exit::Restart(reason);
        }

        info!("Entering control loop");
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Exit::Stopped;
                }
                event = self.events.recv() => event,
            };

            match event {
                Some(event) => {
                    if let Some(exit) = self.handle(event).await {
                        return exit;
                    }
                }
                None => return Exit::Stopped,
            }
        }
    }

    /// Startup in strict order. Only link exhaustion aborts it.
    pub async fn start(&mut self) -> Result<(), RestartReason> {
        info!("{} starting", self.settings.identity);

        self.store.init().await;
        self.level = self.store.load().await;

        match self.session.connect().await {
            Ok(link) => {
                self.set_connectivity(ConnectivityState::LinkUp);
                info!("{} reachable via {}", self.settings.identity, link);
                self.session.supervise(self.notify.clone());
            }
            Err(e) => {
                error!("{}, restarting", e);
                return Err(RestartReason::LinkExhausted {
                    attempts: self.session.attempts(),
                });
            }
        }

        match self.agent.ready(self.notify.clone()).await {
            Ok(()) => debug!("Update coordinator ready"),
            Err(e) => warn!("Remote updates unavailable: {}", e),
        }

        info!("Connecting to MQTT broker...");
        self.channel.connect();

        let level = self.level;
        self.set_level(i64::from(level.get())).await;
        Ok(())
    }

    /// Handles every event already queued, without waiting for new ones.
    pub async fn process_pending(&mut self) -> Option<Exit> {
        while let Ok(event) = self.events.try_recv() {
            if let Some(exit) = self.handle(event).await {
                return Some(exit);
            }
        }
        None
    }

    /// Processes one notification to completion.
    pub async fn handle(&mut self, event: Event) -> Option<Exit> {
        match event {
            Event::Link(LinkEvent::Lost) => {
                warn!("Lost link connection!");
                self.set_connectivity(ConnectivityState::Disconnected);
                self.channel.drop_session();
            }
            Event::Link(LinkEvent::Restored) => {
                info!("Link connection restored");
                if self.connectivity == ConnectivityState::Disconnected {
                    self.set_connectivity(ConnectivityState::LinkUp);
                }
            }
            Event::Channel(session, event) => self.handle_channel(session, event).await,
            Event::Update(event) => self.handle_update(event),
            Event::ReconnectDue => {
                self.reconnect_pending = false;
                info!("Reconnecting to MQTT...");
                self.channel.connect();
            }
            Event::RestartDue(reason) => {
                if let Some(target) = self.update.completed_target() {
                    info!("Booting updated {}", target);
                }
                info!("Restarting: {}", reason);
                return Some(Exit::Restart(reason));
            }
        }
        None
    }

    async fn handle_channel(&mut self, session: SessionId, event: ChannelEvent) {
        let current = self.channel.session();
        let stale = match event {
            // The end of a dropped session still has to schedule the reconnect.
            ChannelEvent::Disconnected => current.is_some_and(|id| id != session),
            _ => current != Some(session),
        };
        if stale {
            debug!("Ignoring {:?} from abandoned session {}", event, session);
            return;
        }

        match event {
            ChannelEvent::Connected { session_present } => {
                info!(
                    "Connected to the MQTT broker, session present: {}",
                    session_present
                );
                self.set_connectivity(ConnectivityState::SessionUp);
                self.announce_session();
            }
            ChannelEvent::Disconnected => {
                self.set_connectivity(ConnectivityState::Disconnected);
                warn!("Disconnected from the MQTT broker!");
                self.schedule_reconnect();
            }
            ChannelEvent::Message { topic, payload } => self.handle_message(&topic, &payload).await,
            ChannelEvent::Published { pkid } => {
                debug!("MQTT publish acknowledged, packetId: {}", pkid);
            }
        }
    }

    async fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        debug!("Message on {}", topic);
        let command = match Command::decode(&self.settings.topics, topic, payload) {
            Ok(command) => command,
            Err(DecodeError::UnknownTopic { .. }) => {
                warn!(
                    "Unknown message received. topic={}, payload: {}",
                    topic,
                    String::from_utf8_lossy(payload)
                );
                return;
            }
            Err(e) => {
                warn!("Dropping malformed command on {}: {}", topic, e);
                return;
            }
        };

        if self.update.blocks_commands() {
            debug!("Update in progress, dropping {:?}", command);
            return;
        }

        match command {
            Command::SetLevel(requested) => self.set_level(requested).await,
            Command::GetLevel => self.publish_level(),
        }
    }

    fn handle_update(&mut self, event: UpdateEvent) {
        match event {
            UpdateEvent::Begin { target } => {
                if self.update.on_begin(target) {
                    self.publish_status(UPDATE_STARTED);
                }
            }
            UpdateEvent::Progress { done, total } => self.update.on_progress(done, total),
            UpdateEvent::End => {
                if self.update.on_end() {
                    self.publish_status(UPDATE_DONE);
                    let restart = Event::RestartDue(RestartReason::UpdateCompleted);
                    self.schedule(self.settings.restart_grace, restart);
                }
            }
            UpdateEvent::Error(kind) => {
                self.update.on_error(kind);
            }
        }
    }

    /// Clamp, persist, drive, publish.
    pub async fn set_level(&mut self, requested: i64) {
        let level = LightLevel::clamped(requested);
        if i64::from(level.get()) != requested {
            info!("Requested light level {} clamped to {}", requested, level);
        }

        self.level = level;
        self.store.save(level).await;
        self.output.apply(level);
        self.publish_level();

        info!("Set light level to {}", level);
    }

    fn announce_session(&mut self) {
        // CONNECTED must replace the retained last-will before anything else goes out.
        self.publish_status(CONNECTED);

        let topics = self.settings.topics.clone();
        self.channel.subscribe(&topics.set_level, SET_LEVEL_QOS);
        self.channel.subscribe(&topics.get_level, GET_LEVEL_QOS);

        self.publish_level();
    }

    fn publish_level(&mut self) {
        let topic = self.settings.topics.level.clone();
        self.publish(&topic, LEVEL_QOS, self.level.to_string());
    }

    fn publish_status(&mut self, status: &str) {
        let topic = self.settings.topics.status.clone();
        self.publish(&topic, STATUS_QOS, status.to_string());
    }

    fn publish(&mut self, topic: &str, qos: rumqttc::QoS, payload: String) {
        if self.connectivity != ConnectivityState::SessionUp {
            debug!("Not connected, not publishing {:?} to {}", payload, topic);
            return;
        }
        self.channel.publish(topic, qos, true, payload.into_bytes());
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_pending {
            debug!("Reconnect already scheduled");
            return;
        }
        self.reconnect_pending = true;
        debug!("Reconnecting in {:?}", self.settings.reconnect_delay);
        self.schedule(self.settings.reconnect_delay, Event::ReconnectDue);
    }

    fn schedule(&self, delay: Duration, event: Event) {
        let notify = self.notify.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = notify.send(event).await;
        });
    }

    fn set_connectivity(&mut self, next: ConnectivityState) {
        if self.connectivity != next {
            info!("Connectivity {:?} -> {:?}", self.connectivity, next);
            self.connectivity = next;
        }
    }
}
