//! MQTT Client
//!
//! Connects to a server, performs the CONNECT/CONNACK handshake and renews
//! subscriptions, then hands the transport to a network loop task that owns
//! it until the session ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{tls, ConnectionStatus, MqttError, MqttOptions};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    Connect, ConnectReturnCode, Packet, PubAck, Publish, QoS, Subscribe, SubscribeReturnCode,
};

/// Callback for PUBLISH packets received from the server: `(topic, payload)`
pub type InboundCallback = Arc<dyn Fn(String, Bytes) + Send + Sync>;

const COMMAND_CHANNEL_CAPACITY: usize = 256;

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

/// Completion signal for an outbound publish
type AckSender = oneshot::Sender<Result<(), MqttError>>;

/// Message to the network loop task
enum Command {
    /// Publish; `done` fires once written (QoS 0) or acknowledged (QoS 1)
    Publish { publish: Publish, done: AckSender },
    /// Send DISCONNECT and close the transport
    Disconnect,
}

/// MQTT v3.1.1 client session
pub struct MqttClient {
    options: MqttOptions,
    status: Arc<watch::Sender<ConnectionStatus>>,
    inbound_callback: Arc<RwLock<Option<InboundCallback>>>,
    /// Command channel of the current network loop
    command_tx: Mutex<Option<mpsc::Sender<Command>>>,
    next_packet_id: AtomicU16,
    /// Serializes concurrent `connect()` calls
    connect_lock: tokio::sync::Mutex<()>,
}

impl MqttClient {
    pub fn new(options: MqttOptions) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            options,
            status: Arc::new(status),
            inbound_callback: Arc::new(RwLock::new(None)),
            command_tx: Mutex::new(None),
            next_packet_id: AtomicU16::new(1),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn options(&self) -> &MqttOptions {
        &self.options
    }

    /// Set the receiver for inbound publishes, replacing any previous one
    pub fn set_inbound_callback(&self, callback: InboundCallback) {
        *self.inbound_callback.write() = Some(callback);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Watch status transitions
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn next_packet_id(&self) -> u16 {
        let id = self.next_packet_id.fetch_add(1, Ordering::SeqCst);
        if id == 0 {
            self.next_packet_id.fetch_add(1, Ordering::SeqCst)
        } else {
            id
        }
    }

    /// Establish a session and start its network loop.
    ///
    /// A no-op when already connected. On failure the status returns to
    /// `Disconnected` and the error is handed back so the caller can back off.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.status.send_replace(ConnectionStatus::Connecting);
        debug!(
            "MQTT '{}': Connecting to {}",
            self.options.client_id,
            self.options.address()
        );

        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.status.send_replace(ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }

    async fn open_transport(&self) -> Result<BoxedTransport, MqttError> {
        let connect_timeout = self.options.connect_timeout;
        let stream = timeout(connect_timeout, TcpStream::connect(self.options.address()))
            .await
            .map_err(|_| MqttError::Timeout)??;
        stream.set_nodelay(true)?;

        match &self.options.ca_cert {
            Some(ca_cert) => {
                let stream = timeout(
                    connect_timeout,
                    tls::wrap(stream, &self.options.host, ca_cert),
                )
                .await
                .map_err(|_| MqttError::Timeout)??;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(stream)),
        }
    }

    async fn establish(&self) -> Result<(), MqttError> {
        let transport = self.open_transport().await?;
        let (mut reader, mut writer) = tokio::io::split(transport);

        let encoder = Encoder::new();
        let decoder = Decoder::new();
        let mut write_buf = BytesMut::new();
        let mut read_buf = BytesMut::with_capacity(4096);

        let connect = Packet::Connect(Box::new(Connect {
            client_id: self.options.client_id.clone(),
            clean_session: self.options.clean_session,
            keep_alive: self.options.keep_alive.as_secs().min(u16::MAX as u64) as u16,
            username: self.options.username.clone(),
            password: self
                .options
                .password
                .as_ref()
                .map(|p| Bytes::from(p.clone().into_bytes())),
        }));
        write_packet(&mut writer, &encoder, &mut write_buf, &connect).await?;

        let packet = timeout(
            self.options.connect_timeout,
            read_packet(&mut reader, &mut read_buf, &decoder),
        )
        .await
        .map_err(|_| MqttError::Timeout)??;

        match packet {
            Packet::ConnAck(connack) if connack.return_code == ConnectReturnCode::Accepted => {
                info!(
                    "MQTT '{}': Connected to {} (session_present={})",
                    self.options.client_id,
                    self.options.address(),
                    connack.session_present
                );
            }
            Packet::ConnAck(connack) => {
                return Err(MqttError::Rejected(connack.return_code));
            }
            other => {
                return Err(MqttError::Protocol(format!(
                    "expected CONNACK, received {:?}",
                    other.packet_type()
                )));
            }
        }

        if !self.options.subscriptions.is_empty() {
            let subscribe = Packet::Subscribe(Subscribe {
                packet_id: self.next_packet_id(),
                subscriptions: self.options.subscriptions.clone(),
            });
            write_packet(&mut writer, &encoder, &mut write_buf, &subscribe).await?;
            debug!(
                "MQTT '{}': Subscribed to {} topic filters",
                self.options.client_id,
                self.options.subscriptions.len()
            );
        }

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        *self.command_tx.lock() = Some(tx);
        self.status.send_replace(ConnectionStatus::Connected);

        let network_loop = NetworkLoop {
            client_id: self.options.client_id.clone(),
            reader,
            writer,
            read_buf,
            write_buf,
            encoder,
            decoder,
            commands: rx,
            inbound_callback: self.inbound_callback.clone(),
            pending: HashMap::new(),
            keep_alive: self.options.keep_alive,
        };
        let status = self.status.clone();
        let client_id = self.options.client_id.clone();

        tokio::spawn(async move {
            match network_loop.run().await {
                Ok(()) => info!("MQTT '{}': Disconnected", client_id),
                Err(e) => warn!("MQTT '{}': Connection lost: {}", client_id, e),
            }
            status.send_replace(ConnectionStatus::Disconnected);
        });

        Ok(())
    }

    /// Publish a message.
    ///
    /// QoS 0 completes once the packet is written, QoS 1 once the server's
    /// PUBACK arrives (bounded by the ack timeout).
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: Bytes,
        qos: QoS,
    ) -> Result<(), MqttError> {
        if qos == QoS::ExactlyOnce {
            return Err(MqttError::Protocol(
                "QoS 2 publish is not supported".to_string(),
            ));
        }

        let tx = self
            .command_tx
            .lock()
            .clone()
            .ok_or(MqttError::NotConnected)?;
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }

        let packet_id = (qos != QoS::AtMostOnce).then(|| self.next_packet_id());
        let publish = Publish {
            qos,
            packet_id,
            ..Publish::new(topic, payload)
        };

        let (done_tx, done_rx) = oneshot::channel();
        tx.send(Command::Publish {
            publish,
            done: done_tx,
        })
        .await
        .map_err(|_| MqttError::NotConnected)?;

        match timeout(self.options.ack_timeout, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MqttError::ConnectionLost(
                "session ended before the publish completed".to_string(),
            )),
            Err(_) => Err(MqttError::AckTimeout),
        }
    }

    /// Send DISCONNECT and wait for the network loop to stop
    pub async fn disconnect(&self) {
        let tx = self.command_tx.lock().take();
        let Some(tx) = tx else {
            return;
        };

        let mut status = self.status.subscribe();
        if tx.send(Command::Disconnect).await.is_err() {
            return;
        }
        let _ = timeout(
            self.options.connect_timeout,
            status.wait_for(|s| *s == ConnectionStatus::Disconnected),
        )
        .await;
    }
}

/// Encode a packet and flush it to the transport
async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    encoder: &Encoder,
    buf: &mut BytesMut,
    packet: &Packet,
) -> Result<(), MqttError> {
    buf.clear();
    encoder.encode(packet, buf)?;
    writer.write_all(buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read until one complete packet is buffered
async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    decoder: &Decoder,
) -> Result<Packet, MqttError> {
    loop {
        if let Some((packet, consumed)) = decoder.decode(&buf[..])? {
            buf.advance(consumed);
            return Ok(packet);
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(MqttError::ConnectionLost(
                "connection closed by peer".to_string(),
            ));
        }
    }
}

/// Owns the transport of one established session
struct NetworkLoop {
    client_id: String,
    reader: ReadHalf<BoxedTransport>,
    writer: WriteHalf<BoxedTransport>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    encoder: Encoder,
    decoder: Decoder,
    commands: mpsc::Receiver<Command>,
    inbound_callback: Arc<RwLock<Option<InboundCallback>>>,
    /// QoS 1 publishes awaiting PUBACK, by packet id
    pending: HashMap<u16, AckSender>,
    keep_alive: Duration,
}

impl NetworkLoop {
    async fn run(mut self) -> Result<(), MqttError> {
        let keep_alive_enabled = !self.keep_alive.is_zero();
        let period = if keep_alive_enabled {
            self.keep_alive
        } else {
            Duration::from_secs(3600)
        };
        let mut keepalive_timer = tokio::time::interval(period);
        keepalive_timer.reset();
        let mut awaiting_pingresp = false;

        // Bytes that arrived together with CONNACK
        self.drain_read_buf(&mut awaiting_pingresp).await?;

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(Command::Publish { publish, done }) => {
                            self.send_publish(publish, done).await?;
                        }
                        Some(Command::Disconnect) | None => {
                            let _ = self.send(&Packet::Disconnect).await;
                            let _ = self.writer.shutdown().await;
                            return Ok(());
                        }
                    }
                }

                result = self.reader.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        return Err(MqttError::ConnectionLost(
                            "connection closed by peer".to_string(),
                        ));
                    }
                    self.drain_read_buf(&mut awaiting_pingresp).await?;
                }

                _ = keepalive_timer.tick(), if keep_alive_enabled => {
                    if awaiting_pingresp {
                        return Err(MqttError::ConnectionLost(
                            "no PINGRESP within keep-alive".to_string(),
                        ));
                    }
                    self.send(&Packet::PingReq).await?;
                    awaiting_pingresp = true;
                }
            }
        }
    }

    async fn drain_read_buf(&mut self, awaiting_pingresp: &mut bool) -> Result<(), MqttError> {
        while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf[..])? {
            self.read_buf.advance(consumed);
            self.handle_packet(packet, awaiting_pingresp).await?;
        }
        Ok(())
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), MqttError> {
        write_packet(&mut self.writer, &self.encoder, &mut self.write_buf, packet).await
    }

    async fn send_publish(&mut self, publish: Publish, done: AckSender) -> Result<(), MqttError> {
        let packet_id = publish.packet_id;
        let packet = Packet::Publish(publish);

        self.write_buf.clear();
        if let Err(e) = self.encoder.encode(&packet, &mut self.write_buf) {
            let _ = done.send(Err(e.into()));
            return Ok(());
        }
        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;

        match packet_id {
            Some(id) => {
                self.pending.retain(|_, waiter| !waiter.is_closed());
                self.pending.insert(id, done);
            }
            None => {
                let _ = done.send(Ok(()));
            }
        }
        Ok(())
    }

    async fn handle_packet(
        &mut self,
        packet: Packet,
        awaiting_pingresp: &mut bool,
    ) -> Result<(), MqttError> {
        match packet {
            Packet::Publish(publish) => {
                let callback = self.inbound_callback.read().clone();
                let packet_id = publish.packet_id;
                let qos = publish.qos;

                match callback {
                    Some(callback) => callback(publish.topic, publish.payload),
                    None => debug!(
                        "MQTT '{}': No handler for message on {}",
                        self.client_id, publish.topic
                    ),
                }

                match (qos, packet_id) {
                    (QoS::AtLeastOnce, Some(packet_id)) => {
                        self.send(&Packet::PubAck(PubAck { packet_id })).await?;
                    }
                    (QoS::ExactlyOnce, _) => {
                        warn!(
                            "MQTT '{}': Ignoring QoS 2 delivery handshake",
                            self.client_id
                        );
                    }
                    _ => {}
                }
            }
            Packet::PubAck(puback) => match self.pending.remove(&puback.packet_id) {
                Some(waiter) => {
                    let _ = waiter.send(Ok(()));
                }
                None => debug!(
                    "MQTT '{}': PUBACK for unknown packet id {}",
                    self.client_id, puback.packet_id
                ),
            },
            Packet::SubAck(suback) => {
                for code in &suback.return_codes {
                    if *code == SubscribeReturnCode::Failure {
                        warn!("MQTT '{}': Subscription refused by server", self.client_id);
                    }
                }
                debug!("MQTT '{}': SUBACK received", self.client_id);
            }
            Packet::PingResp => {
                *awaiting_pingresp = false;
            }
            Packet::Disconnect => {
                return Err(MqttError::ConnectionLost(
                    "server sent DISCONNECT".to_string(),
                ));
            }
            other => {
                warn!(
                    "MQTT '{}': Unexpected {:?} packet",
                    self.client_id,
                    other.packet_type()
                );
            }
        }
        Ok(())
    }
}
