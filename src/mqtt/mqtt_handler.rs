use std::time::Duration;

use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{DISCONNECTED, STATUS_QOS};
use crate::config::BrokerConfig;
use crate::controller::event::{ChannelEvent, Event, EventSender, SessionId};

const REQUEST_CAPACITY: usize = 32;

/// The control loop's view of the pub/sub session.
///
/// Every call is fire-and-forget. Outcomes (connected, dropped, acknowledged,
/// inbound messages) come back later as [`ChannelEvent`] notifications.
pub trait MessageTransport {
    fn connect(&mut self);
    /// The session that channel events are currently accepted from. `None` once the
    /// session was dropped.
    fn session(&self) -> Option<SessionId>;
    /// Abandons the current session, if any. A `Disconnected` notification follows.
    fn drop_session(&mut self);
    fn subscribe(&mut self, topic: &str, qos: QoS);
    fn publish(&mut self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>);
}

struct Session {
    id: SessionId,
    eventloop: EventLoop,
    cancel: CancellationToken,
}

/// rumqttc-backed transport.
///
/// Each `connect()` builds a fresh client/event loop pair and hands the event loop
/// to a long-lived pump task, which turns broker traffic into notifications. When
/// the session ends for any reason the pump reports `Disconnected` and waits for
/// the next `connect()`; it never reconnects on its own.
pub struct MqttHandler {
    options: MqttOptions,
    client: Option<AsyncClient>,
    session: Option<(SessionId, CancellationToken)>,
    next_session: SessionId,
    sessions: mpsc::Sender<Session>,
    shutdown: CancellationToken,
}

impl MqttHandler {
    pub fn spawn(
        broker: &BrokerConfig,
        identity: &str,
        status_topic: &str,
        notify: EventSender,
        shutdown: CancellationToken,
    ) -> Self {
        let options = mqtt_options(broker, identity, status_topic);
        let (sessions, session_rx) = mpsc::channel(1);

        tokio::spawn(run_pump(session_rx, notify, shutdown.clone()));

        MqttHandler {
            options,
            client: None,
            session: None,
            next_session: 1,
            sessions,
            shutdown,
        }
    }

    fn session_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|(_, token)| !token.is_cancelled())
    }
}

impl MessageTransport for MqttHandler {
    fn connect(&mut self) {
        if self.session_active() {
            debug!("MQTT connect already in flight");
            return;
        }

        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let cancel = self.shutdown.child_token();
        let id = self.next_session;

        match self.sessions.try_send(Session {
            id,
            eventloop,
            cancel: cancel.clone(),
        }) {
            Ok(()) => {
                let (host, port) = self.options.broker_address();
                info!("Connecting to MQTT broker {}:{}", host, port);
                self.client = Some(client);
                self.session = Some((id, cancel));
                self.next_session += 1;
            }
            Err(e) => error!("MQTT session pump rejected new session: {}", e),
        }
    }

    fn session(&self) -> Option<SessionId> {
        self.session.as_ref().map(|(id, _)| *id)
    }

    fn drop_session(&mut self) {
        if let Some((_, token)) = self.session.take() {
            token.cancel();
        }
        self.client = None;
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) {
        let Some(client) = &self.client else {
            debug!("No MQTT session, not subscribing to {}", topic);
            return;
        };
        match client.try_subscribe(topic, qos) {
            Ok(()) => info!("Subscribed to {} ({:?})", topic, qos),
            Err(e) => warn!("Failed to subscribe to {}: {}", topic, e),
        }
    }

    fn publish(&mut self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) {
        let Some(client) = &self.client else {
            debug!("No MQTT session, dropping publish to {}", topic);
            return;
        };
        if let Err(e) = client.try_publish(topic, qos, retain, payload) {
            warn!("Failed to publish to {}: {}", topic, e);
        }
    }
}

/// Client options: identity, keep-alive, optional credentials and the retained
/// `DISCONNECTED` last-will on the status topic.
pub fn mqtt_options(broker: &BrokerConfig, identity: &str, status_topic: &str) -> MqttOptions {
    let mut options = MqttOptions::new(identity, broker.host.clone(), broker.port);
    options
        .set_keep_alive(Duration::from_secs(broker.keep_alive_secs))
        .set_clean_session(true)
        .set_last_will(LastWill::new(
            status_topic,
            DISCONNECTED.as_bytes().to_vec(),
            STATUS_QOS,
            true,
        ));

    if let Some(username) = &broker.username {
        options.set_credentials(username.clone(), broker.password.clone().unwrap_or_default());
    }

    options
}

async fn run_pump(
    mut sessions: mpsc::Receiver<Session>,
    notify: EventSender,
    shutdown: CancellationToken,
) {
    loop {
        let session = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = sessions.recv() => match next {
                Some(session) => session,
                None => break,
            },
        };

        let Session {
            id,
            mut eventloop,
            cancel,
        } = session;

        drive_session(id, &mut eventloop, &cancel, &notify).await;
        // Cancel before notifying so a reconnect triggered by the notification
        // sees the session as finished.
        cancel.cancel();

        if shutdown.is_cancelled() {
            break;
        }
        if notify
            .send(Event::Channel(id, ChannelEvent::Disconnected))
            .await
            .is_err()
        {
            break;
        }
    }
    debug!("MQTT session pump stopped");
}

async fn drive_session(
    id: SessionId,
    eventloop: &mut EventLoop,
    cancel: &CancellationToken,
    notify: &EventSender,
) {
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => {
                info!("MQTT session abandoned");
                return;
            }
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(MqttEvent::Incoming(Packet::ConnAck(ack))) => ChannelEvent::Connected {
                session_present: ack.session_present,
            },
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => ChannelEvent::Message {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            },
            Ok(MqttEvent::Incoming(Packet::PubAck(ack))) => ChannelEvent::Published { pkid: ack.pkid },
            Ok(MqttEvent::Incoming(Packet::PubComp(comp))) => {
                ChannelEvent::Published { pkid: comp.pkid }
            }
            Ok(MqttEvent::Incoming(Packet::Disconnect)) => {
                warn!("MQTT broker closed the session");
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                return;
            }
        };

        if notify.send(Event::Channel(id, event)).await.is_err() {
            return;
        }
    }
}
