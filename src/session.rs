use std::{
    collections::HashMap,
    fmt::Display,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, Incoming, LastWill, MqttOptions,
    Outgoing, QoS,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch, Mutex, RwLock};

use crate::{discovery_topic, Component};

/// Upper bound on how long `disconnect` waits for the event loop to flush and exit.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(250);
/// Default pause between reconnect attempts after the connection drops.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to connect to MQTT broker: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Session is already connected")]
    AlreadyConnected,
    #[error("Session was disconnected and cannot be reused")]
    Closed,
    #[error("MQTT event loop stopped before the connection was established")]
    EventLoopStopped,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Client is not connected")]
    NotConnected,
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to publish message: {0}")]
    MqttClient(#[from] ClientError),
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("Client is not connected")]
    NotConnected,
    #[error("Failed to subscribe to topic: {0}")]
    MqttClient(#[from] ClientError),
}

#[derive(Debug, Clone)]
pub struct MqttClientConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: Option<String>,
    pub last_will: Option<LastWill>,
    pub mqtt_channel_size: usize,
    pub keep_alive: u64,
    pub clean_session: bool,
    pub reconnect_delay: Duration,
}

impl MqttClientConfig {
    /// Create a new instance with required fields and default optional fields
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: None,
            last_will: None,
            mqtt_channel_size: 256,
            keep_alive: 30,
            clean_session: true,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn last_will(mut self, last_will: Option<LastWill>) -> Self {
        self.last_will = last_will;
        self
    }

    pub fn mqtt_channel_size(mut self, mqtt_channel_size: usize) -> Self {
        self.mqtt_channel_size = mqtt_channel_size;
        self
    }

    pub fn keep_alive(mut self, keep_alive: u64) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }

    pub fn broker_url(&self) -> String {
        format!("tcp://{}:{}", self.hostname, self.port)
    }

    pub fn to_mqtt_options(&self, client_id: &str) -> MqttOptions {
        let mut mqttoptions = MqttOptions::new(client_id, self.hostname.to_owned(), self.port);
        if !self.username.is_empty() {
            mqttoptions.set_credentials(self.username.to_owned(), self.password.to_owned());
        }
        mqttoptions.set_keep_alive(Duration::from_secs(self.keep_alive));
        mqttoptions.set_clean_session(self.clean_session);
        if let Some(last_will) = &self.last_will {
            mqttoptions.set_last_will(last_will.clone());
        }
        mqttoptions
    }
}

/// Client id unique per process start: `go-commands-<unix seconds>`.
pub fn generate_client_id() -> String {
    format!("go-commands-{}", chrono::Utc::now().timestamp())
}

/// Outgoing message body. Text and bytes go out unchanged, JSON values are serialized.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Payload {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Json)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Json(value) => serde_json::to_vec(value),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Self::Json(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Called once per inbound message on a blocking worker thread.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { reconnect: bool },
    ConnectionLost(String),
    Disconnected,
}

/// Publish/subscribe surface the service talks to. `Session` is the MQTT implementation.
pub trait MessageBus: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Payload,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;

    fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> impl Future<Output = Result<(), SubscribeError>> + Send;

    /// Publish a discovery document to `homeassistant/<component>/<node_id>/<object_id>/config`.
    /// Always QoS 1 and retained.
    fn publish_discovery<T>(
        &self,
        component: Component,
        node_id: &str,
        object_id: &str,
        document: &T,
    ) -> impl Future<Output = Result<(), PublishError>> + Send
    where
        T: Serialize + Sync,
    {
        async move {
            let topic = discovery_topic(component, node_id, object_id);
            let payload = Payload::json(document)?;
            self.publish(&topic, QoS::AtLeastOnce, true, payload).await?;
            log::info!("Published discovery message: {topic}");
            Ok(())
        }
    }
}

struct Subscription {
    qos: QoS,
    handler: MessageHandler,
}

struct SessionState {
    connected: AtomicBool,
    closed: AtomicBool,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionState {
    fn emit(&self, event: SessionEvent) {
        // No listeners is fine.
        let _ = self.events.send(event);
    }

    async fn dispatch(&self, topic: String, payload: Vec<u8>) {
        let handler = match self.subscriptions.read().await.get(&topic) {
            Some(sub) => Arc::clone(&sub.handler),
            None => {
                log::debug!("No handler for message on {topic}");
                return;
            }
        };
        tokio::task::spawn_blocking(move || handler(InboundMessage { topic, payload }));
    }

    async fn resubscribe(&self, client: &AsyncClient) {
        for (topic, sub) in self.subscriptions.read().await.iter() {
            // try_ variant: awaiting the request queue from inside the event loop can deadlock.
            if let Err(err) = client.try_subscribe(topic.as_str(), sub.qos) {
                log::error!("Failed to resubscribe to {topic}: {err}");
            }
        }
    }
}

struct Connection {
    client: AsyncClient,
    stop_sender: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

/// A single long-lived MQTT session.
///
/// Created unconnected. `connect` starts the event loop, which keeps reconnecting on network
/// loss until `disconnect` tears it down for good.
pub struct Session {
    config: MqttClientConfig,
    client_id: String,
    state: Arc<SessionState>,
    connection: Mutex<Option<Connection>>,
}

impl Session {
    pub fn new(config: MqttClientConfig) -> Self {
        let client_id = config.client_id.clone().unwrap_or_else(generate_client_id);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            config,
            client_id,
            state: Arc::new(SessionState {
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                subscriptions: RwLock::new(HashMap::new()),
                events,
            }),
            connection: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Last known state as reported by the event loop. Not a live probe.
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.state.events.subscribe()
    }

    /// Connect and wait for the broker's CONNACK. A failure here is returned; failures after the
    /// first successful handshake are retried by the event loop.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(ConnectError::Closed);
        }
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            return Err(ConnectError::AlreadyConnected);
        }

        log::info!(
            "Connecting to MQTT broker {} as {}",
            self.config.broker_url(),
            self.client_id
        );
        let options = self.config.to_mqtt_options(&self.client_id);
        let (client, eventloop) = AsyncClient::new(options, self.config.mqtt_channel_size);
        let (stop_sender, stop_receiver) = watch::channel(false);
        let (ready_sender, ready_receiver) = oneshot::channel();

        let handle = tokio::task::spawn(run_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&self.state),
            stop_receiver,
            ready_sender,
            self.config.reconnect_delay,
        ));

        match ready_receiver.await {
            Ok(Ok(())) => {
                log::info!("Connected to MQTT broker {}", self.config.broker_url());
                *connection = Some(Connection {
                    client,
                    stop_sender,
                    handle,
                });
                Ok(())
            }
            Ok(Err(err)) => Err(ConnectError::Connection(err)),
            Err(_) => Err(ConnectError::EventLoopStopped),
        }
    }

    /// Send DISCONNECT and wait up to `DISCONNECT_TIMEOUT` for the event loop to finish.
    /// No-op if the session was never connected or is already torn down.
    pub async fn disconnect(&self) {
        let Some(Connection {
            client,
            stop_sender,
            mut handle,
        }) = self.connection.lock().await.take()
        else {
            return;
        };
        self.state.closed.store(true, Ordering::SeqCst);

        let graceful = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            if let Err(err) = client.disconnect().await {
                log::warn!("Error sending disconnect: {err}");
            }
            let _ = (&mut handle).await;
        })
        .await;

        if graceful.is_err() {
            log::warn!("MQTT event loop did not stop in time, aborting");
            let _ = stop_sender.send(true);
            handle.abort();
        }

        self.state.connected.store(false, Ordering::SeqCst);
        self.state.emit(SessionEvent::Disconnected);
        log::info!("Disconnected from MQTT broker");
    }

    async fn client(&self) -> Option<AsyncClient> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.client.clone())
    }
}

impl MessageBus for Session {
    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Payload,
    ) -> impl Future<Output = Result<(), PublishError>> + Send {
        async move {
            if !self.is_connected() {
                return Err(PublishError::NotConnected);
            }
            let client = self.client().await.ok_or(PublishError::NotConnected)?;
            let bytes = payload.to_bytes()?;
            client.publish(topic, qos, retain, bytes).await?;
            log::info!("Published message to {topic}: {payload}");
            Ok(())
        }
    }

    fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> impl Future<Output = Result<(), SubscribeError>> + Send {
        async move {
            if !self.is_connected() {
                return Err(SubscribeError::NotConnected);
            }
            let client = self.client().await.ok_or(SubscribeError::NotConnected)?;

            // Register first so a message right after SUBACK finds its handler.
            self.state
                .subscriptions
                .write()
                .await
                .insert(topic.to_owned(), Subscription { qos, handler });

            if let Err(err) = client.subscribe(topic, qos).await {
                self.state.subscriptions.write().await.remove(topic);
                return Err(err.into());
            }
            log::info!("Subscribed to topic {topic}");
            Ok(())
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    state: Arc<SessionState>,
    mut stop_receiver: watch::Receiver<bool>,
    ready: oneshot::Sender<Result<(), ConnectionError>>,
    reconnect_delay: Duration,
) {
    let mut ready = Some(ready);
    let mut has_connected = false;

    loop {
        let poll_res = tokio::select! {
            poll_res = eventloop.poll() => poll_res,
            changed = stop_receiver.changed() => {
                if changed.is_err() || *stop_receiver.borrow() {
                    log::trace!("Received stop signal. Exiting...");
                    break;
                }
                continue;
            }
        };

        match poll_res {
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                state.dispatch(p.topic, p.payload.to_vec()).await;
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                state.connected.store(true, Ordering::SeqCst);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                } else {
                    log::info!("Reconnected to MQTT broker");
                    state.resubscribe(&client).await;
                }
                state.emit(SessionEvent::Connected {
                    reconnect: has_connected,
                });
                has_connected = true;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                log::trace!("Connection closed from our side.");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                if let Some(ready) = ready.take() {
                    // Initial handshake failed; the caller treats this as fatal.
                    let _ = ready.send(Err(err));
                    return;
                }
                if state.connected.swap(false, Ordering::SeqCst) {
                    log::error!("Lost connection to MQTT broker: {err}");
                    state.emit(SessionEvent::ConnectionLost(err.to_string()));
                } else {
                    log::warn!("Reconnecting to MQTT broker failed: {err}");
                }

                tokio::select! {
                    _ = tokio::time::sleep(reconnect_delay) => {}
                    changed = stop_receiver.changed() => {
                        if changed.is_err() || *stop_receiver.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    }

    state.connected.store(false, Ordering::SeqCst);
    log::trace!("Exiting MQTT event loop...");
}
