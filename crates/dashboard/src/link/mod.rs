//! Broker link: one supervised MQTT connection.
//!
//! [`machine`] holds the pure lifecycle state machine; this module owns the
//! actual `rumqttc` handle and performs the machine's effects.  A single
//! `select!` loop serializes broker events, the retry timer and shutdown, so
//! no two connect attempts can ever overlap.  The active client lives in a
//! shared slot that is emptied before every re-dial — collaborators that hold
//! a [`Link`] can publish, but never keep a stale handle alive.

pub mod machine;

use std::pin::Pin;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{watch, RwLock};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, Topics};
use crate::state::SharedState;
use crate::store::Store;
use crate::sync::Synchronizer;
use crate::wire::{Command, SensorReading, StatusUpdate};
use machine::{Effect, Level, LinkEvent, LinkMachine, LinkStatus};

type ClientSlot = Arc<RwLock<Option<AsyncClient>>>;

// ---------------------------------------------------------------------------
// Link handle (what collaborators hold)
// ---------------------------------------------------------------------------

/// Cheap-to-clone handle for publishing commands and reading link status.
#[derive(Clone)]
pub struct Link {
    client: ClientSlot,
    status_rx: watch::Receiver<LinkStatus>,
    command_topic: String,
}

impl Link {
    pub(crate) fn new(
        client: ClientSlot,
        status_rx: watch::Receiver<LinkStatus>,
        command_topic: String,
    ) -> Self {
        Self {
            client,
            status_rx,
            command_topic,
        }
    }

    pub fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == LinkStatus::Connected
    }

    /// Publish a sparse command.  Fails immediately when the link is not
    /// connected; commands are never queued for later delivery.
    pub async fn publish(&self, command: &Command) -> Result<()> {
        if !self.is_connected() {
            bail!("not connected to the broker");
        }
        let client = self
            .client
            .read()
            .await
            .clone()
            .context("no active broker handle")?;
        let payload = serde_json::to_vec(command).context("failed to encode command")?;
        client
            .publish(&self.command_topic, QoS::AtLeastOnce, false, payload)
            .await
            .context("mqtt publish failed")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct LinkSupervisor<S: Store> {
    broker: BrokerConfig,
    topics: Topics,
    machine: LinkMachine,
    client: ClientSlot,
    status_tx: watch::Sender<LinkStatus>,
    state: SharedState,
    sync: Synchronizer<S>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: Store> LinkSupervisor<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: BrokerConfig,
        topics: Topics,
        client: ClientSlot,
        status_tx: watch::Sender<LinkStatus>,
        state: SharedState,
        sync: Synchronizer<S>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker,
            topics,
            machine: LinkMachine::new(),
            client,
            status_tx,
            state,
            sync,
            shutdown_rx,
        }
    }

    /// Run until shutdown.  All lifecycle decisions go through the machine;
    /// this loop only performs effects and turns IO into machine events.
    pub async fn run(mut self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut eventloop: Option<EventLoop> = None;
        let mut retry: Option<Pin<Box<Sleep>>> = None;
        let mut connect_deadline: Option<Instant> = None;

        let mut effects = self.machine.handle(LinkEvent::Start);

        loop {
            for effect in effects.drain(..) {
                match effect {
                    Effect::OpenConnection => {
                        self.teardown(&mut eventloop).await;
                        let (client, el) = self.dial();
                        *self.client.write().await = Some(client);
                        eventloop = Some(el);
                        connect_deadline = Some(Instant::now() + machine::CONNECT_TIMEOUT);
                    }
                    Effect::Subscribe => {
                        connect_deadline = None;
                        self.subscribe_topics().await;
                    }
                    Effect::ScheduleRetry(delay) => {
                        retry = Some(Box::pin(tokio::time::sleep(delay)));
                    }
                    Effect::CancelRetry => retry = None,
                    Effect::CloseConnection => self.teardown(&mut eventloop).await,
                    Effect::SetStatus(status) => {
                        let _ = self.status_tx.send(status);
                    }
                    Effect::Notify(level, message) => self.notify(level, message).await,
                }
            }

            if self.machine.is_shut_down() {
                // Nothing may fire against a dismantled controller.
                self.sync.cancel_pending().await;
                info!("broker link shut down");
                return;
            }

            let deadline = if self.machine.is_connecting() {
                connect_deadline
            } else {
                None
            };
            let event = tokio::select! {
                _ = shutdown_rx.changed() => LinkEvent::Shutdown,
                () = async {
                    match retry.as_mut() {
                        Some(sleep) => sleep.as_mut().await,
                        None => std::future::pending().await,
                    }
                } => {
                    retry = None;
                    LinkEvent::RetryDue
                }
                event = async {
                    match eventloop.as_mut() {
                        Some(el) => self.next_broker_event(el, deadline).await,
                        None => std::future::pending().await,
                    }
                } => event,
            };
            effects = self.machine.handle(event);
        }
    }

    fn dial(&self) -> (AsyncClient, EventLoop) {
        let mut options = MqttOptions::new(
            self.broker.client_id.clone(),
            self.broker.host.clone(),
            self.broker.port,
        );
        options.set_keep_alive(machine::KEEP_ALIVE);
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&self.broker.username, &self.broker.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        AsyncClient::new(options, 32)
    }

    /// Force-terminate the active handle, if any.  Dropping the event loop
    /// closes the socket; the disconnect is best effort on top.
    async fn teardown(&self, eventloop: &mut Option<EventLoop>) {
        if let Some(client) = self.client.write().await.take() {
            let _ = client.disconnect().await;
        }
        *eventloop = None;
    }

    async fn subscribe_topics(&self) {
        let Some(client) = self.client.read().await.clone() else {
            return;
        };
        for topic in [&self.topics.status, &self.topics.sensor] {
            if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                self.notify(Level::Warn, format!("subscribe to '{topic}' failed: {e}"))
                    .await;
            }
        }
    }

    /// Poll the broker until something the machine cares about happens.
    /// Telemetry is dispatched to the synchronizer inline — it never changes
    /// the lifecycle state.
    async fn next_broker_event(
        &self,
        eventloop: &mut EventLoop,
        deadline: Option<Instant>,
    ) -> LinkEvent {
        loop {
            let polled = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, eventloop.poll()).await {
                        Ok(result) => result,
                        Err(_) => return LinkEvent::ConnectionLost("connect timed out".into()),
                    }
                }
                None => eventloop.poll().await,
            };

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return LinkEvent::ConnAck;
                    }
                    return LinkEvent::ConnectionLost(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    ));
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return LinkEvent::SubscribeFailed(
                            "broker rejected a subscription".into(),
                        );
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.dispatch(&publish.topic, &publish.payload).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return LinkEvent::ConnectionLost("broker closed the connection".into());
                }
                Ok(_) => {}
                Err(e) => return LinkEvent::ConnectionLost(e.to_string()),
            }
        }
    }

    async fn dispatch(&self, topic: &str, payload: &[u8]) {
        if topic == self.topics.status {
            match serde_json::from_slice::<StatusUpdate>(payload) {
                Ok(update) => self.sync.apply_status(update).await,
                Err(e) => {
                    warn!(topic, "bad status payload: {e}");
                    self.state
                        .write()
                        .await
                        .record_error(format!("bad status payload: {e}"));
                }
            }
        } else if topic == self.topics.sensor {
            match serde_json::from_slice::<SensorReading>(payload) {
                Ok(reading) => self.sync.apply_sensor(reading).await,
                Err(e) => {
                    warn!(topic, "bad sensor payload: {e}");
                    self.state
                        .write()
                        .await
                        .record_error(format!("bad sensor payload: {e}"));
                }
            }
        } else {
            debug!(topic, "unhandled topic");
        }
    }

    async fn notify(&self, level: Level, message: String) {
        match level {
            Level::Info => info!("{message}"),
            Level::Warn => warn!("{message}"),
            Level::Error => tracing::error!("{message}"),
        }
        let mut state = self.state.write().await;
        match level {
            Level::Error => state.record_error(message),
            _ => state.record_link(message),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// A client whose event loop is never polled: publishes park in the
    /// request channel, which is all these tests need.
    fn idle_client() -> (AsyncClient, EventLoop) {
        let options = MqttOptions::new("link-test", "127.0.0.1", 1883);
        AsyncClient::new(options, 8)
    }

    fn link_with_status(status: LinkStatus, client: Option<AsyncClient>) -> Link {
        // The receiver keeps serving the last value after the sender drops.
        let (_tx, rx) = watch::channel(status);
        Link::new(
            Arc::new(RwLock::new(client)),
            rx,
            "garden/command".to_string(),
        )
    }

    // -- publish gate -------------------------------------------------------

    #[tokio::test]
    async fn publish_fails_immediately_when_disconnected() {
        let link = link_with_status(LinkStatus::Disconnected, None);
        let err = link.publish(&Command::default()).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    #[tokio::test]
    async fn publish_fails_while_reconnecting() {
        let (client, _el) = idle_client();
        let link = link_with_status(LinkStatus::Reconnecting { attempt: 2 }, Some(client));
        assert!(link.publish(&Command::default()).await.is_err());
    }

    #[tokio::test]
    async fn publish_fails_when_exhausted() {
        let link = link_with_status(LinkStatus::Exhausted, None);
        assert!(link.publish(&Command::default()).await.is_err());
    }

    #[tokio::test]
    async fn publish_succeeds_when_connected() {
        let (client, _el) = idle_client();
        let link = link_with_status(LinkStatus::Connected, Some(client));
        link.publish(&Command {
            pump: Some("on".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn publish_with_empty_slot_fails_even_if_status_says_connected() {
        // The slot is emptied before every re-dial; a racing publish must
        // fail rather than reach a dead handle.
        let link = link_with_status(LinkStatus::Connected, None);
        let err = link.publish(&Command::default()).await.unwrap_err();
        assert!(err.to_string().contains("no active broker handle"));
    }
}
