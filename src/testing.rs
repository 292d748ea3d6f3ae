//! Test doubles: an in-process fake MQTT server, a scripted edge hub module
//! client and a recording device connector

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::codec::{Decoder, Encoder};
use crate::edgehub::{EdgeHubError, InputMessage, ModuleClient};
use crate::mqtt::{ConnectionStatus, MqttError};
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, Packet, Subscribe};
use crate::registry::{DeviceConnector, DeviceCredential, DeviceLink};
use crate::router::Envelope;

pub struct FakeServer {
    listener: TcpListener,
    pub port: u16,
}

impl FakeServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    pub async fn accept(&self) -> FakePeer {
        let (stream, _) = self.listener.accept().await.unwrap();
        FakePeer {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// True if a client connects within `wait`
    pub async fn accepts_within(&self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.listener.accept())
            .await
            .is_ok()
    }
}

pub struct FakePeer {
    stream: TcpStream,
    buf: BytesMut,
}

impl FakePeer {
    pub async fn recv(&mut self) -> Packet {
        let decoder = Decoder::new();
        loop {
            if let Some((packet, consumed)) = decoder.decode(&self.buf[..]).unwrap() {
                self.buf.advance(consumed);
                return packet;
            }
            let n = self.stream.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "client closed the connection");
        }
    }

    pub async fn send_all(&mut self, packets: &[Packet]) {
        let mut out = BytesMut::new();
        for packet in packets {
            Encoder::new().encode(packet, &mut out).unwrap();
        }
        self.stream.write_all(&out).await.unwrap();
    }

    pub async fn send(&mut self, packet: Packet) {
        self.send_all(&[packet]).await;
    }

    /// Read CONNECT and answer with an accepting CONNACK
    pub async fn accept_session(&mut self) -> Box<Connect> {
        let connect = match self.recv().await {
            Packet::Connect(connect) => connect,
            other => panic!("expected CONNECT, got {:?}", other),
        };
        self.send(connack(ConnectReturnCode::Accepted)).await;
        connect
    }

    pub async fn expect_subscribe(&mut self) -> Subscribe {
        match self.recv().await {
            Packet::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        }
    }
}

pub fn connack(return_code: ConnectReturnCode) -> Packet {
    Packet::ConnAck(ConnAck {
        session_present: false,
        return_code,
    })
}

// ============================================================================
// Module client
// ============================================================================

pub struct MockModuleClient {
    status: watch::Sender<ConnectionStatus>,
    sent: Mutex<Vec<(Envelope, String)>>,
    connect_calls: AtomicUsize,
    connect_failures: AtomicUsize,
    fail_sends: AtomicBool,
    twin_tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    twin_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    input_tx: Mutex<Option<mpsc::UnboundedSender<InputMessage>>>,
    input_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InputMessage>>,
}

impl MockModuleClient {
    pub fn new() -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (twin_tx, twin_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            status,
            sent: Mutex::new(Vec::new()),
            connect_calls: AtomicUsize::new(0),
            connect_failures: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            twin_tx: Mutex::new(Some(twin_tx)),
            twin_rx: tokio::sync::Mutex::new(twin_rx),
            input_tx: Mutex::new(Some(input_tx)),
            input_rx: tokio::sync::Mutex::new(input_rx),
        })
    }

    /// Fail the next `n` connect attempts
    pub fn fail_connects(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(Envelope, String)> {
        self.sent.lock().clone()
    }

    pub fn push_twin_patch(&self, patch: Value) {
        if let Some(tx) = self.twin_tx.lock().as_ref() {
            tx.send(patch).unwrap();
        }
    }

    pub fn push_input(&self, message: InputMessage) {
        if let Some(tx) = self.input_tx.lock().as_ref() {
            tx.send(message).unwrap();
        }
    }

    /// End both receive channels
    pub fn close_channels(&self) {
        self.twin_tx.lock().take();
        self.input_tx.lock().take();
    }

    /// Simulate the runtime dropping the session
    pub fn drop_connection(&self) {
        self.status.send_replace(ConnectionStatus::Disconnected);
    }
}

#[async_trait]
impl ModuleClient for MockModuleClient {
    async fn connect(&self) -> Result<(), EdgeHubError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EdgeHubError::Connection(MqttError::ConnectionLost(
                "edge hub unavailable".to_string(),
            )));
        }
        self.status.send_replace(ConnectionStatus::Connected);
        Ok(())
    }

    async fn send_message_to_output(
        &self,
        envelope: &Envelope,
        output: &str,
    ) -> Result<(), EdgeHubError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(EdgeHubError::Send(MqttError::AckTimeout));
        }
        self.sent
            .lock()
            .push((envelope.clone(), output.to_string()));
        Ok(())
    }

    async fn receive_twin_desired_patch(&self) -> Result<Value, EdgeHubError> {
        self.twin_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(EdgeHubError::Closed)
    }

    async fn receive_message_on_input(&self, input: &str) -> Result<InputMessage, EdgeHubError> {
        let mut rx = self.input_rx.lock().await;
        loop {
            let message = rx.recv().await.ok_or(EdgeHubError::Closed)?;
            if message.input == input {
                return Ok(message);
            }
        }
    }

    async fn disconnect(&self) {
        self.status.send_replace(ConnectionStatus::Disconnected);
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }
}

// ============================================================================
// Device connector
// ============================================================================

#[derive(Default)]
pub struct FakeLink {
    pub name: String,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    connected: AtomicBool,
    fail_connect: bool,
    fail_send: bool,
    events: Mutex<Vec<Bytes>>,
}

impl FakeLink {
    /// Lose the connection without a disconnect call
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Sent events parsed as JSON
    pub fn events(&self) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .map(|body| serde_json::from_slice(body).unwrap())
            .collect()
    }
}

#[async_trait]
impl DeviceLink for FakeLink {
    async fn connect(&self) -> Result<(), MqttError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(MqttError::Rejected(ConnectReturnCode::NotAuthorized));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_event(&self, body: Bytes) -> Result<(), MqttError> {
        if self.fail_send {
            return Err(MqttError::AckTimeout);
        }
        self.events.lock().push(body);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Connector handing out [`FakeLink`]s and remembering them
#[derive(Default)]
pub struct FakeConnector {
    links: Mutex<Vec<(String, DeviceCredential, Arc<FakeLink>)>>,
    pub fail_connect: AtomicBool,
    pub fail_send: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of links created so far
    pub fn created(&self) -> usize {
        self.links.lock().len()
    }

    /// Most recently created link for `name`
    pub fn link(&self, name: &str) -> Option<Arc<FakeLink>> {
        self.links
            .lock()
            .iter()
            .rev()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, link)| link.clone())
    }

    pub fn credential(&self, name: &str) -> Option<DeviceCredential> {
        self.links
            .lock()
            .iter()
            .rev()
            .find(|(n, _, _)| n == name)
            .map(|(_, credential, _)| credential.clone())
    }
}

impl DeviceConnector for FakeConnector {
    fn create(&self, name: &str, credential: &DeviceCredential) -> Arc<dyn DeviceLink> {
        let link = Arc::new(FakeLink {
            name: name.to_string(),
            fail_connect: self.fail_connect.load(Ordering::SeqCst),
            fail_send: self.fail_send.load(Ordering::SeqCst),
            ..Default::default()
        });
        self.links
            .lock()
            .push((name.to_string(), credential.clone(), link.clone()));
        link
    }
}
