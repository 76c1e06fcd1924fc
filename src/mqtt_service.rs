use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

pub use rumqttc::QoS;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("MQTT handshake with {0} failed: {1}")]
    Handshake(String, String),
    #[error("MQTT handshake with {0} did not complete within {1:?}")]
    Timeout(String, Duration),
    #[error("Failed to publish to '{0}': {1}")]
    Publish(String, String),
    #[error("MQTT broker {0} is unavailable, next connect attempt in {1:?}")]
    Backoff(String, Duration),
}

/// Connection parameters for one broker session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub wait_slice: Duration,
    pub retry_backoff: Duration,
}

impl ConnectOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            client_id: config.mqtt_client_id.clone(),
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            connect_timeout: config.connect_timeout(),
            wait_slice: config.wait_slice(),
            retry_backoff: config.retry_backoff(),
        }
    }

    pub fn broker_url(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// A live (or formerly live) connection to the message bus.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: String,
    ) -> Result<(), BrokerError>;

    /// Disconnects after everything queued so far went out, waiting at most `grace`.
    async fn close(&self, grace: Duration);
}

/// Opens new broker sessions. Returns only once the handshake has completed.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Disconnected => write!(f, "disconnected"),
            ClientState::Connecting => write!(f, "connecting"),
            ClientState::Connected => write!(f, "connected"),
            ClientState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Handshake progress reported by the event loop task.
#[derive(Debug, Clone)]
enum Handshake {
    Pending,
    Accepted,
    Failed(String),
}

/// Session backed by a rumqttc client whose event loop runs in its own task.
pub struct RumqttSession {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    /// Closed once the event loop task has ended.
    stopped: watch::Receiver<Handshake>,
    event_loop: JoinHandle<()>,
}

#[async_trait]
impl BrokerSession for RumqttSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.event_loop.is_finished()
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: String,
    ) -> Result<(), BrokerError> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| BrokerError::Publish(topic.to_string(), e.to_string()))
    }

    async fn close(&self, grace: Duration) {
        if let Err(e) = self.client.disconnect().await {
            warn!("Failed to disconnect from MQTT broker: {}", e);
            return;
        }

        let mut stopped = self.stopped.clone();
        let drained = timeout(grace, async { while stopped.changed().await.is_ok() {} }).await;
        match drained {
            Ok(()) => info!("Disconnected from MQTT broker."),
            Err(_) => warn!("MQTT event loop did not stop within {:?}.", grace),
        }
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

pub struct RumqttConnector;

#[async_trait]
impl BrokerConnector for RumqttConnector {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        debug!("Configuring MQTT broker at {}...", options.broker_url());

        let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);
        mqtt_options.set_keep_alive(Duration::from_secs(10));
        mqtt_options.set_clean_session(true);

        if !options.username.is_empty() && !options.password.is_empty() {
            mqtt_options.set_credentials(&options.username, &options.password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
        let (handshake_tx, mut handshake_rx) = watch::channel(Handshake::Pending);
        let connected = Arc::new(AtomicBool::new(false));

        let connected_flag = connected.clone();
        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!("Connected to MQTT broker.");
                            connected_flag.store(true, Ordering::SeqCst);
                            handshake_tx.send_replace(Handshake::Accepted);
                        } else {
                            handshake_tx.send_replace(Handshake::Failed(format!("{:?}", ack.code)));
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("MQTT broker closed the session.");
                        break;
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("MQTT disconnect sent.");
                        break;
                    }
                    Ok(event) => {
                        debug!("MQTT event: {:?}", event);
                    }
                    Err(e) => {
                        error!("Error in MQTT event loop: {}", e);
                        handshake_tx.send_replace(Handshake::Failed(e.to_string()));
                        break;
                    }
                }
            }
            connected_flag.store(false, Ordering::SeqCst);
        });

        let session = RumqttSession {
            client,
            connected,
            stopped: handshake_rx.clone(),
            event_loop,
        };

        // Only the wait is retried, never the connect itself.
        let url = options.broker_url();
        let deadline = Instant::now() + options.connect_timeout;
        loop {
            let current = handshake_rx.borrow_and_update().clone();
            match current {
                Handshake::Accepted => return Ok(Arc::new(session)),
                Handshake::Failed(reason) => return Err(BrokerError::Handshake(url, reason)),
                Handshake::Pending => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BrokerError::Timeout(url, options.connect_timeout));
            }
            let slice = options.wait_slice.min(deadline - now);
            match timeout(slice, handshake_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(BrokerError::Handshake(url, "event loop stopped".to_string()))
                }
                Err(_) => debug!("Still waiting for MQTT handshake with {}...", url),
            }
        }
    }
}

#[derive(Default)]
struct Slot {
    session: Option<Arc<dyn BrokerSession>>,
    failed_at: Option<Instant>,
}

/// Owns the single broker session of the server and replaces it lazily.
///
/// The slot lock is held across check, reconnect and hand-out, so
/// concurrent requests never race on a half-replaced session. After a
/// failed connect, callers get `BrokerError::Backoff` without another
/// attempt until `retry_backoff` has passed.
pub struct BrokerManager {
    connector: Arc<dyn BrokerConnector>,
    options: ConnectOptions,
    client_state: Mutex<ClientState>,
    slot: Mutex<Slot>,
}

impl BrokerManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, options: ConnectOptions) -> Arc<Self> {
        Arc::new(Self {
            connector,
            options,
            client_state: Mutex::new(ClientState::Disconnected),
            slot: Mutex::new(Slot::default()),
        })
    }

    /// Returns a live session, connecting first if there is none or the
    /// current one has dropped.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let mut slot = self.slot.lock().await;

        if let Some(existing) = slot.session.as_ref() {
            if existing.is_connected() {
                return Ok(existing.clone());
            }
            warn!("Lost connection to MQTT broker. Reconnecting...");
            slot.session = None;
            self.set_state(ClientState::Disconnected).await;
        }

        if let Some(failed_at) = slot.failed_at {
            let waited = failed_at.elapsed();
            if waited < self.options.retry_backoff {
                return Err(BrokerError::Backoff(
                    self.options.broker_url(),
                    self.options.retry_backoff - waited,
                ));
            }
        }

        info!("Connecting to MQTT broker at {}...", self.options.broker_url());
        self.set_state(ClientState::Connecting).await;

        match self.connector.connect(&self.options).await {
            Ok(fresh) => {
                self.set_state(ClientState::Connected).await;
                slot.session = Some(fresh.clone());
                slot.failed_at = None;
                Ok(fresh)
            }
            Err(e) => {
                error!("{}", e);
                self.set_state(ClientState::Error(e.to_string())).await;
                slot.failed_at = Some(Instant::now());
                Err(e)
            }
        }
    }

    /// The current session if it is still connected; never reconnects.
    pub async fn current(&self) -> Option<Arc<dyn BrokerSession>> {
        let slot = self.slot.lock().await;
        slot.session.as_ref().filter(|s| s.is_connected()).cloned()
    }

    pub async fn state(&self) -> ClientState {
        let snapshot = self.client_state.lock().await.clone();
        // a dropped session is only noticed lazily, so report it here
        if snapshot == ClientState::Connected && self.current().await.is_none() {
            return ClientState::Disconnected;
        }
        snapshot
    }

    async fn set_state(&self, next: ClientState) {
        let mut state = self.client_state.lock().await;
        debug!("MQTT client state: {} -> {}", *state, next);
        *state = next;
    }
}
