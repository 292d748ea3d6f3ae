use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use test_case::test_case;
use tokio::sync::mpsc;

use super::*;
use crate::config::EdgeHubConfig;
use crate::protocol::{Packet, PubAck, Publish, QoS};
use crate::testing::{FakePeer, FakeServer, MockModuleClient};

fn envelope() -> Envelope {
    Envelope::from_device_message("device/sensor-7/message", "sensor-7", "ptm", json!({"t": 21.5}))
}

fn input(name: &str, body: &'static [u8]) -> InputMessage {
    InputMessage {
        input: name.to_string(),
        properties: BTreeMap::new(),
        payload: Bytes::from_static(body),
    }
}

#[tokio::test]
async fn test_send_requires_connection() {
    let mock = MockModuleClient::new();
    let edge_hub = EdgeHubConnection::new(mock.clone());

    let result = edge_hub.send_to_output(&envelope(), "ptm_output").await;
    assert!(matches!(result, Err(EdgeHubError::NotConnected)));
    assert!(mock.sent().is_empty());
}

#[tokio::test]
async fn test_send_after_connect() {
    let mock = MockModuleClient::new();
    let edge_hub = EdgeHubConnection::new(mock.clone());
    edge_hub.connect().await.unwrap();
    assert!(edge_hub.is_connected());

    edge_hub
        .send_to_output(&envelope(), "ptm_output")
        .await
        .unwrap();

    assert_eq!(mock.sent(), vec![(envelope(), "ptm_output".to_string())]);
}

#[tokio::test]
async fn test_connect_when_connected_is_noop() {
    let mock = MockModuleClient::new();
    let edge_hub = EdgeHubConnection::new(mock.clone());
    edge_hub.connect().await.unwrap();
    edge_hub.connect().await.unwrap();
    assert_eq!(mock.connect_calls(), 1);
}

#[tokio::test]
async fn test_send_failure_surfaces() {
    let mock = MockModuleClient::new();
    let edge_hub = EdgeHubConnection::new(mock.clone());
    edge_hub.connect().await.unwrap();
    mock.fail_sends(true);

    let result = edge_hub.send_to_output(&envelope(), "ptm_output").await;
    assert!(matches!(result, Err(EdgeHubError::Send(_))));
}

#[tokio::test]
async fn test_twin_listener_delivers_in_order() {
    let mock = MockModuleClient::new();
    let edge_hub = EdgeHubConnection::new(mock.clone());
    let (shutdown_tx, _) = broadcast::channel(1);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = edge_hub.listen_twin_patches(
        move |patch| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(patch);
            }
        },
        shutdown_tx.subscribe(),
    );

    for version in 1..=3 {
        mock.push_twin_patch(json!({ "$version": version }));
    }
    for version in 1..=3 {
        assert_eq!(rx.recv().await.unwrap(), json!({ "$version": version }));
    }

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_twin_listener_stops_when_channel_closes() {
    let mock = MockModuleClient::new();
    let edge_hub = EdgeHubConnection::new(mock.clone());
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let handle = edge_hub.listen_twin_patches(|_| async {}, shutdown_tx.subscribe());
    mock.close_channels();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_input_listener_filters_by_name() {
    let mock = MockModuleClient::new();
    let edge_hub = EdgeHubConnection::new(mock.clone());
    let (shutdown_tx, _) = broadcast::channel(1);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = edge_hub.listen_input(
        "commands",
        move |message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        },
        shutdown_tx.subscribe(),
    );

    mock.push_input(input("other", b"skip"));
    mock.push_input(input("commands", b"take"));

    let received = rx.recv().await.unwrap();
    assert_eq!(received.input, "commands");
    assert_eq!(&received.payload[..], b"take");

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(rx.try_recv().is_err());
}

// ============================================================================
// MQTT module client
// ============================================================================

fn module_client(port: u16, input: Option<&str>) -> MqttModuleClient {
    let config = EdgeHubConfig {
        module_id: Some("ptm".to_string()),
        device_id: Some("edge-1".to_string()),
        iothub_hostname: Some("contoso.azure-devices.net".to_string()),
        gateway_hostname: Some("127.0.0.1".to_string()),
        sas_token: Some("SharedAccessSignature sr=x&sig=y".to_string()),
        port,
        ack_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let identity = config.identity().unwrap();
    MqttModuleClient::new(&identity, &config, input)
}

async fn connected_module(input: Option<&str>) -> (MqttModuleClient, FakePeer, FakeServer) {
    let server = FakeServer::bind().await;
    let client = module_client(server.port, input);
    let (result, peer) = tokio::join!(client.connect(), async {
        let mut peer = server.accept().await;
        peer.accept_session().await;
        peer.expect_subscribe().await;
        peer
    });
    result.unwrap();
    (client, peer, server)
}

#[tokio::test]
async fn test_module_session_identity_and_subscriptions() {
    let server = FakeServer::bind().await;
    let client = module_client(server.port, Some("commands"));

    let (result, _peer) = tokio::join!(client.connect(), async {
        let mut peer = server.accept().await;
        let connect = peer.accept_session().await;
        assert_eq!(connect.client_id, "edge-1/ptm");
        assert_eq!(
            connect.username.as_deref(),
            Some("contoso.azure-devices.net/edge-1/ptm/?api-version=2018-06-30")
        );
        assert_eq!(
            connect.password,
            Some(Bytes::from_static(b"SharedAccessSignature sr=x&sig=y"))
        );

        let subscribe = peer.expect_subscribe().await;
        let filters: Vec<_> = subscribe
            .subscriptions
            .iter()
            .map(|s| (s.filter.as_str(), s.qos))
            .collect();
        assert_eq!(
            filters,
            vec![
                ("$iothub/twin/PATCH/properties/desired/#", QoS::AtMostOnce),
                ("devices/edge-1/modules/ptm/inputs/commands/#", QoS::AtLeastOnce),
            ]
        );
        peer
    });
    result.unwrap();
    assert_eq!(client.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_module_send_to_output() {
    let (client, mut peer, _server) = connected_module(None).await;
    let envelope = envelope();

    let (result, _) = tokio::join!(
        client.send_message_to_output(&envelope, "ptm_output"),
        async {
            match peer.recv().await {
                Packet::Publish(publish) => {
                    assert_eq!(
                        publish.topic,
                        "devices/edge-1/modules/ptm/messages/events/\
                         $.on=ptm_output&$.ct=application%2Fjson&$.ce=utf-8\
                         &leafdeviceid=sensor-7&moduleid=ptm"
                    );
                    assert_eq!(publish.qos, QoS::AtLeastOnce);
                    assert_eq!(publish.payload, envelope.payload);
                    peer.send(Packet::PubAck(PubAck {
                        packet_id: publish.packet_id.unwrap(),
                    }))
                    .await;
                }
                other => panic!("expected PUBLISH, got {:?}", other),
            }
        }
    );
    result.unwrap();
}

#[tokio::test]
async fn test_module_send_before_connect() {
    let client = module_client(1, None);
    let result = client.send_message_to_output(&envelope(), "out").await;
    assert!(matches!(result, Err(EdgeHubError::NotConnected)));
}

#[tokio::test]
async fn test_module_receives_twin_patch() {
    let (client, mut peer, _server) = connected_module(None).await;

    peer.send_all(&[
        Packet::Publish(Publish::new(
            "$iothub/twin/PATCH/properties/desired/?$version=2",
            Bytes::from_static(b"not json"),
        )),
        Packet::Publish(Publish::new(
            "$iothub/twin/PATCH/properties/desired/?$version=3",
            Bytes::from_static(b"{\"leafDevices\":{\"sensor-7\":\"token\"},\"$version\":3}"),
        )),
    ])
    .await;

    let patch = tokio::time::timeout(Duration::from_secs(5), client.receive_twin_desired_patch())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        patch,
        json!({"leafDevices": {"sensor-7": "token"}, "$version": 3})
    );
}

#[tokio::test]
async fn test_module_receives_input_message() {
    let (client, mut peer, _server) = connected_module(Some("commands")).await;

    peer.send_all(&[
        Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            packet_id: Some(3),
            ..Publish::new(
                "devices/edge-1/modules/ptm/inputs/other/$.ce=utf-8",
                Bytes::from_static(b"skip"),
            )
        }),
        Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            packet_id: Some(4),
            ..Publish::new(
                "devices/edge-1/modules/ptm/inputs/commands/leafdeviceid=sensor-7&$.ct=application%2Fjson",
                Bytes::from_static(b"{\"on\":true}"),
            )
        }),
    ])
    .await;

    let message = tokio::time::timeout(
        Duration::from_secs(5),
        client.receive_message_on_input("commands"),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(message.input, "commands");
    assert_eq!(message.property("leafdeviceid"), Some("sensor-7"));
    assert_eq!(message.property("$.ct"), Some("application/json"));
    assert_eq!(&message.payload[..], b"{\"on\":true}");

    assert_eq!(peer.recv().await, Packet::PubAck(PubAck { packet_id: 3 }));
    assert_eq!(peer.recv().await, Packet::PubAck(PubAck { packet_id: 4 }));
}

#[tokio::test]
async fn test_module_without_input_buffers_nothing() {
    let server = FakeServer::bind().await;
    let client = module_client(server.port, None);

    let (result, mut peer) = tokio::join!(client.connect(), async {
        let mut peer = server.accept().await;
        peer.accept_session().await;
        let subscribe = peer.expect_subscribe().await;
        let filters: Vec<_> = subscribe
            .subscriptions
            .iter()
            .map(|s| s.filter.as_str())
            .collect();
        assert_eq!(filters, vec!["$iothub/twin/PATCH/properties/desired/#"]);
        peer
    });
    result.unwrap();

    let inputs: Vec<_> = (0..500)
        .map(|_| {
            Packet::Publish(Publish::new(
                "devices/edge-1/modules/ptm/inputs/commands/",
                Bytes::from_static(b"{}"),
            ))
        })
        .collect();
    peer.send_all(&inputs).await;
    peer.send(Packet::Publish(Publish::new(
        "$iothub/twin/PATCH/properties/desired/?$version=2",
        Bytes::from_static(b"{\"$version\":2}"),
    )))
    .await;

    // The twin patch comes after every input on the wire
    let patch = tokio::time::timeout(Duration::from_secs(5), client.receive_twin_desired_patch())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(patch, json!({"$version": 2}));

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        client.receive_message_on_input("commands"),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(EdgeHubError::Closed)));
}

#[test]
fn test_property_bag_encoding() {
    let bag = encode_property_bag([
        ("$.on", "out put"),
        ("$.ct", "application/json"),
        ("leafdeviceid", "a&b=c"),
    ]);
    assert_eq!(bag, "$.on=out%20put&$.ct=application%2Fjson&leafdeviceid=a%26b%3Dc");

    let decoded = decode_property_bag(&bag);
    assert_eq!(decoded.get("$.on").map(String::as_str), Some("out put"));
    assert_eq!(decoded.get("leafdeviceid").map(String::as_str), Some("a&b=c"));
}

#[test_case("devices/d/modules/m/inputs/in1/a=1&b=2", Some(("in1", 2)) ; "with properties")]
#[test_case("devices/d/modules/m/inputs/in1/", Some(("in1", 0)) ; "empty bag")]
#[test_case("devices/d/modules/m/inputs/in1", Some(("in1", 0)) ; "no bag")]
#[test_case("devices/d/modules/m/inputs/", None ; "missing input name")]
#[test_case("devices/d/modules/m/outputs/x/", None ; "not an input")]
#[test_case("$iothub/twin/res/200/", None ; "twin response")]
fn test_parse_input_topic(topic: &str, expected: Option<(&str, usize)>) {
    let parsed = parse_input_topic(topic);
    assert_eq!(
        parsed
            .as_ref()
            .map(|(input, properties)| (input.as_str(), properties.len())),
        expected
    );
}

#[test]
fn test_error_display() {
    assert_eq!(EdgeHubError::NotConnected.to_string(), "edge hub not connected");
    assert_eq!(
        EdgeHubError::Send(MqttError::AckTimeout).to_string(),
        format!("edge hub send failed: {}", MqttError::AckTimeout)
    );
}
