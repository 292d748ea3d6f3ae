use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use test_case::test_case;

use super::*;
use crate::testing::{FakeConnector, MockModuleClient};

struct Fixture {
    router: Arc<BridgeRouter>,
    edge_hub: Arc<MockModuleClient>,
    connector: Arc<FakeConnector>,
    registry: Arc<DeviceRegistry>,
}

async fn fixture() -> Fixture {
    let edge_hub = MockModuleClient::new();
    let connection = Arc::new(EdgeHubConnection::new(edge_hub.clone()));
    connection.connect().await.unwrap();

    let connector = FakeConnector::new();
    let registry = Arc::new(DeviceRegistry::new(connector.clone(), 10));
    let router = Arc::new(BridgeRouter::new(
        connection,
        registry.clone(),
        "ptm",
        "ptm_output",
    ));
    Fixture {
        router,
        edge_hub,
        connector,
        registry,
    }
}

proptest! {
    #[test]
    fn prop_device_id_is_second_segment(id in "[A-Za-z0-9_.:-]{1,40}") {
        let topic = format!("device/{}/message", id);
        prop_assert_eq!(device_id_from_topic(&topic).unwrap(), id.as_str());

        let envelope = Envelope::from_device_message(&topic, &id, "ptm", json!({}));
        prop_assert_eq!(envelope.device_id(), Some(id.as_str()));
        prop_assert_eq!(&envelope.topic[1], &id);
    }
}

#[test_case("device" ; "single segment")]
#[test_case("" ; "empty topic")]
#[test_case("device//message" ; "empty device segment")]
fn test_malformed_topic(topic: &str) {
    assert!(matches!(
        device_id_from_topic(topic),
        Err(RouteError::MalformedTopic(_))
    ));
}

#[test]
fn test_two_segment_topic_accepted() {
    assert_eq!(device_id_from_topic("device/abc").unwrap(), "abc");
}

#[tokio::test]
async fn test_broker_message_routed_to_output() {
    let fx = fixture().await;

    fx.router
        .on_broker_message("device/sensor-7/message", br#"{"t":21.5}"#)
        .await
        .unwrap();

    let sent = fx.edge_hub.sent();
    assert_eq!(sent.len(), 1);
    let (envelope, output) = &sent[0];
    assert_eq!(output, "ptm_output");
    assert_eq!(
        envelope.properties,
        BTreeMap::from([
            ("leafdeviceid".to_string(), "sensor-7".to_string()),
            ("moduleid".to_string(), "ptm".to_string()),
        ])
    );
    assert_eq!(
        envelope.body().unwrap(),
        json!({"topic": "device/sensor-7/message", "payload": {"t": 21.5}})
    );
    assert_eq!(envelope.topic, vec!["device", "sensor-7", "message"]);
}

#[tokio::test]
async fn test_malformed_topic_not_sent() {
    let fx = fixture().await;
    let result = fx.router.on_broker_message("device", b"{}").await;
    assert!(matches!(result, Err(RouteError::MalformedTopic(_))));
    assert!(fx.edge_hub.sent().is_empty());
}

#[test_case(b"not json" ; "invalid json")]
#[test_case(b"{\"t\":" ; "truncated json")]
#[tokio::test]
async fn test_invalid_json_not_sent(payload: &[u8]) {
    let fx = fixture().await;
    let result = fx.router.on_broker_message("device/a/message", payload).await;
    assert!(matches!(
        result,
        Err(RouteError::PayloadDecode(PayloadDecodeError::Json(_)))
    ));
    assert!(fx.edge_hub.sent().is_empty());
}

#[tokio::test]
async fn test_invalid_utf8_not_sent() {
    let fx = fixture().await;
    let result = fx
        .router
        .on_broker_message("device/a/message", &[0xff, 0xfe, 0x00])
        .await;
    assert!(matches!(
        result,
        Err(RouteError::PayloadDecode(PayloadDecodeError::Utf8(_)))
    ));
    assert!(fx.edge_hub.sent().is_empty());
}

#[tokio::test]
async fn test_scalar_payload_wrapped() {
    let fx = fixture().await;
    fx.router
        .on_broker_message("device/a/status", b"42")
        .await
        .unwrap();
    let (envelope, _) = &fx.edge_hub.sent()[0];
    assert_eq!(
        envelope.body().unwrap(),
        json!({"topic": "device/a/status", "payload": 42})
    );
}

#[tokio::test]
async fn test_send_failure_reported() {
    let fx = fixture().await;
    fx.edge_hub.fail_sends(true);

    let result = fx.router.on_broker_message("device/a/message", b"{}").await;
    assert!(matches!(result, Err(RouteError::Send(EdgeHubError::Send(_)))));
}

#[tokio::test]
async fn test_send_before_edge_hub_connect() {
    let edge_hub = MockModuleClient::new();
    let router = BridgeRouter::new(
        Arc::new(EdgeHubConnection::new(edge_hub.clone())),
        Arc::new(DeviceRegistry::disabled()),
        "ptm",
        "ptm_output",
    );
    let result = router.on_broker_message("device/a/message", b"{}").await;
    assert!(matches!(
        result,
        Err(RouteError::Send(EdgeHubError::NotConnected))
    ));
    assert!(edge_hub.sent().is_empty());
}

#[tokio::test]
async fn test_relay_to_registered_device() {
    let fx = fixture().await;
    fx.registry
        .register("sensor-7", DeviceCredential::new("t"))
        .await
        .unwrap();

    fx.router
        .relay_to_device("sensor-7", &json!({"cmd": "reset"}))
        .await
        .unwrap();

    let events = fx.connector.link("sensor-7").unwrap().events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1], json!({"cmd": "reset"}));
}

#[tokio::test]
async fn test_relay_to_unknown_device() {
    let fx = fixture().await;
    let result = fx.router.relay_to_device("ghost", &json!({})).await;
    assert!(matches!(result, Err(RouteError::UnknownDevice(ref name)) if name == "ghost"));
}

#[tokio::test]
async fn test_relay_failure_reported() {
    let fx = fixture().await;
    fx.connector.fail_send.store(true, Ordering::SeqCst);
    fx.registry
        .register("sensor-7", DeviceCredential::new("t"))
        .await
        .unwrap();

    let result = fx.router.relay_to_device("sensor-7", &json!({})).await;
    assert!(matches!(result, Err(RouteError::DeviceSend { .. })));
}

#[tokio::test]
async fn test_input_message_relayed_by_property() {
    let fx = fixture().await;
    fx.registry
        .register("sensor-7", DeviceCredential::new("t"))
        .await
        .unwrap();

    let message = InputMessage {
        input: "commands".to_string(),
        properties: BTreeMap::from([("leafdeviceid".to_string(), "sensor-7".to_string())]),
        payload: Bytes::from_static(b"{\"on\":true}"),
    };
    fx.router.on_input_message(message).await.unwrap();

    let events = fx.connector.link("sensor-7").unwrap().events();
    assert_eq!(events.last(), Some(&json!({"on": true})));
}

#[tokio::test]
async fn test_input_message_without_device_ignored() {
    let fx = fixture().await;
    let message = InputMessage {
        input: "commands".to_string(),
        properties: BTreeMap::new(),
        payload: Bytes::from_static(b"not even json"),
    };
    fx.router.on_input_message(message).await.unwrap();
    assert_eq!(fx.connector.created(), 0);
}

#[tokio::test]
async fn test_twin_patch_registers_and_deregisters() {
    let fx = fixture().await;

    fx.router
        .on_twin_patch(json!({
            "leafDevices": {"sensor-1": "token-1", "sensor-2": "token-2"},
            "$version": 2
        }))
        .await;
    assert_eq!(fx.registry.device_names(), vec!["sensor-1", "sensor-2"]);

    // Known devices are left alone
    fx.router
        .on_twin_patch(json!({"leafDevices": {"sensor-1": "token-1b", "sensor-2": null}}))
        .await;
    assert_eq!(fx.registry.device_names(), vec!["sensor-1"]);
    assert_eq!(fx.connector.created(), 2);
    assert_eq!(
        fx.connector
            .link("sensor-2")
            .unwrap()
            .disconnects
            .load(Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn test_twin_patch_replaces_dropped_device_session() {
    let fx = fixture().await;
    fx.router
        .on_twin_patch(json!({"leafDevices": {"sensor-1": "token-1"}}))
        .await;
    let first = fx.connector.link("sensor-1").unwrap();
    first.drop_connection();

    fx.router
        .on_twin_patch(json!({"leafDevices": {"sensor-1": "token-1"}}))
        .await;

    assert_eq!(fx.connector.created(), 2);
    assert_eq!(first.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(fx.registry.device_names(), vec!["sensor-1"]);
    assert!(fx.registry.lookup("sensor-1").unwrap().is_connected());
}

#[tokio::test]
async fn test_twin_patch_without_devices_is_logged_only() {
    let fx = fixture().await;
    fx.router.on_twin_patch(json!({"reportInterval": 30})).await;
    fx.router
        .on_twin_patch(json!({"leafDevices": {"gone": null, "bad": 5}}))
        .await;
    assert!(fx.registry.is_empty());
    assert_eq!(fx.connector.created(), 0);
}

#[tokio::test]
async fn test_worker_preserves_order() {
    let fx = fixture().await;
    let (tx, rx) = mpsc::channel(16);
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = fx.router.spawn_worker(rx, shutdown_tx.subscribe());

    let handler = BridgeRouter::queue_handler(tx);
    handler("device/a/message".to_string(), Bytes::from_static(b"1"));
    handler("device".to_string(), Bytes::from_static(b"2"));
    handler("device/b/message".to_string(), Bytes::from_static(b"3"));
    handler("device/c/message".to_string(), Bytes::from_static(b"4"));
    drop(handler);

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();

    let devices: Vec<_> = fx
        .edge_hub
        .sent()
        .iter()
        .map(|(envelope, _)| envelope.device_id().unwrap().to_string())
        .collect();
    assert_eq!(devices, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_queue_full_drops_message() {
    let (tx, mut rx) = mpsc::channel(1);
    let handler = BridgeRouter::queue_handler(tx);
    handler("device/a/message".to_string(), Bytes::from_static(b"1"));
    handler("device/b/message".to_string(), Bytes::from_static(b"2"));

    assert_eq!(rx.recv().await.unwrap().0, "device/a/message");
    drop(handler);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_worker_stops_on_shutdown() {
    let fx = fixture().await;
    let (_tx, rx) = mpsc::channel(16);
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = fx.router.spawn_worker(rx, shutdown_tx.subscribe());

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
