//! Bridge
//!
//! Wires the broker connection, the edge hub session, the device registry
//! and the router together and keeps both connections alive.
//!
//! Startup order:
//! 1. connect the edge hub (retried forever)
//! 2. start the twin patch listener and, if configured, the input listener
//! 3. start the router worker draining the broker queue
//! 4. supervise the broker connection, reconnecting whenever it drops
//!
//! Both connections are retried at the same fixed interval with no attempt
//! limit. A shutdown signal stops every task and closes all sessions.

mod retry;


use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use retry::retry_forever;

use crate::broker::BrokerConnection;
use crate::config::{Config, ConfigError};
use crate::edgehub::{EdgeHubConnection, MqttModuleClient};
use crate::mqtt::ConnectionStatus;
use crate::registry::{DeviceRegistry, MqttDeviceConnector};
use crate::router::BridgeRouter;

/// Running bridge context; owns every connection handle
pub struct Bridge {
    config: Config,
    broker: Arc<BrokerConnection>,
    edge_hub: Arc<EdgeHubConnection>,
    registry: Arc<DeviceRegistry>,
    router: Arc<BridgeRouter>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Bridge {
    pub fn new(
        config: Config,
        broker: BrokerConnection,
        edge_hub: EdgeHubConnection,
        registry: DeviceRegistry,
    ) -> Self {
        let edge_hub = Arc::new(edge_hub);
        let registry = Arc::new(registry);
        let router = Arc::new(BridgeRouter::new(
            edge_hub.clone(),
            registry.clone(),
            config.module_id(),
            config.bridge.output_name.clone(),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            broker: Arc::new(broker),
            edge_hub,
            registry,
            router,
            shutdown_tx,
        }
    }

    /// Build all connections from validated configuration
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        let identity = config.edge_hub.identity()?;
        let edge_hub = EdgeHubConnection::new(Arc::new(MqttModuleClient::new(
            &identity,
            &config.edge_hub,
            config.bridge.input_name.as_deref(),
        )));

        let registry = if config.devices.enabled {
            let connector = MqttDeviceConnector::new(config.devices.endpoint()?);
            DeviceRegistry::new(Arc::new(connector), config.devices.max_sessions)
        } else {
            DeviceRegistry::disabled()
        };

        let broker = BrokerConnection::new(&config.broker, config.broker_client_id());

        Ok(Self::new(config, broker, edge_hub, registry))
    }

    pub fn broker(&self) -> &Arc<BrokerConnection> {
        &self.broker
    }

    pub fn edge_hub(&self) -> &Arc<EdgeHubConnection> {
        &self.edge_hub
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<BridgeRouter> {
        &self.router
    }

    /// Sender that stops a running bridge
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Shut down on Ctrl+C, and on SIGTERM where available since that is
    /// how the IoT Edge runtime stops modules. Must be called inside the
    /// runtime.
    pub fn shutdown_on_signals(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())?;
            let shutdown = self.shutdown_handle();
            tokio::spawn(async move {
                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM, shutting down");
                    let _ = shutdown.send(());
                }
            });
        }

        let shutdown = self.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
                let _ = shutdown.send(());
            }
        });
        Ok(())
    }

    /// Run until shutdown
    pub async fn run(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.config.bridge.retry_interval;

        info!(
            "Bridge: Starting module '{}' (output '{}')",
            self.config.module_id(),
            self.router.output_name()
        );

        let edge_hub = self.edge_hub.clone();
        let connected = retry_forever("edge hub", interval, &mut shutdown, || {
            let edge_hub = edge_hub.clone();
            async move { edge_hub.connect().await }
        })
        .await;
        if connected.is_none() {
            self.close().await;
            return;
        }

        let mut tasks = vec![self.spawn_edge_hub_supervisor(), self.spawn_twin_listener()];
        if let Some(input) = &self.config.bridge.input_name {
            tasks.push(self.spawn_input_listener(input.clone()));
        }

        let (tx, rx) = mpsc::channel(self.config.bridge.channel_capacity);
        self.broker.on_message(BridgeRouter::queue_handler(tx));
        tasks.push(self.router.spawn_worker(rx, self.shutdown_tx.subscribe()));

        let broker = self.broker.clone();
        supervise(
            "broker",
            interval,
            self.broker.status_watch(),
            shutdown,
            move || {
                let broker = broker.clone();
                async move { broker.connect().await }
            },
        )
        .await;

        info!("Bridge: Shutting down");
        for task in tasks {
            let _ = task.await;
        }
        self.close().await;
    }

    async fn close(&self) {
        self.broker.disconnect().await;
        self.registry.shutdown().await;
        self.edge_hub.disconnect().await;
        info!("Bridge: Stopped");
    }

    /// Reconnects the edge hub after the initial connect
    fn spawn_edge_hub_supervisor(&self) -> JoinHandle<()> {
        let edge_hub = self.edge_hub.clone();
        let status = self.edge_hub.status_watch();
        let shutdown = self.shutdown_tx.subscribe();
        let interval = self.config.bridge.retry_interval;
        tokio::spawn(supervise("edge hub", interval, status, shutdown, move || {
            let edge_hub = edge_hub.clone();
            async move { edge_hub.connect().await }
        }))
    }

    fn spawn_twin_listener(&self) -> JoinHandle<()> {
        let router = self.router.clone();
        self.edge_hub.listen_twin_patches(
            move |patch| {
                let router = router.clone();
                async move { router.on_twin_patch(patch).await }
            },
            self.shutdown_tx.subscribe(),
        )
    }

    fn spawn_input_listener(&self, input: String) -> JoinHandle<()> {
        let router = self.router.clone();
        self.edge_hub.listen_input(
            input,
            move |message| {
                let router = router.clone();
                async move {
                    let input = message.input.clone();
                    if let Err(e) = router.on_input_message(message).await {
                        warn!("Bridge: Message on input '{}' not relayed: {}", input, e);
                    }
                }
            },
            self.shutdown_tx.subscribe(),
        )
    }
}

/// Keep a connection up: reconnect with [`retry_forever`] whenever `status`
/// leaves `Connected`, until shutdown
async fn supervise<F, Fut, E>(
    what: &'static str,
    interval: Duration,
    mut status: watch::Receiver<ConnectionStatus>,
    mut shutdown: broadcast::Receiver<()>,
    mut connect: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    loop {
        let connected = *status.borrow_and_update() == ConnectionStatus::Connected;
        if !connected
            && retry_forever(what, interval, &mut shutdown, &mut connect)
                .await
                .is_none()
        {
            return;
        }

        let lost = tokio::select! {
            changed = status.wait_for(|s| *s == ConnectionStatus::Disconnected) => changed.is_ok(),
            _ = shutdown.recv() => false,
        };
        if !lost {
            return;
        }
        warn!("Bridge: {} connection lost, reconnecting", what);
    }
}
