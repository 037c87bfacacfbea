use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};

use super::*;
use crate::{signaling, transport::MemoryTransport};
use meshfl_core::{
    aggregator::{AggregatorSettings, MeanAggregator},
    message::PayloadKind,
    privacy::PrivacySettings,
};
use meshfl_server::rendezvous::RendezvousHandle;

fn protocol(minimum_ready_peers: usize, round_timeout_ms: u64) -> ProtocolSettings {
    ProtocolSettings {
        minimum_ready_peers,
        round_timeout_ms,
    }
}

fn new_client(settings: ProtocolSettings, aggregator: AggregatorSettings) -> DecentralizedClient {
    DecentralizedClient::new(
        settings,
        aggregator.build().unwrap(),
        Box::new(PrivacySettings::default()),
        Arc::new(MemoryTransport::new(1024)),
    )
}

fn weights(value: f32) -> WeightsContainer {
    WeightsContainer::from(vec![vec![value, value]])
}

/// A rendezvous server that assigns the id `a` and answers every ready message
/// with `peers`, if any.
fn fake_server(
    peers: Option<Vec<&str>>,
) -> (RendezvousSender, RendezvousReceiver, JoinHandle<()>) {
    fake_server_with_pushes(peers, 1)
}

/// Like [`fake_server`], but sends the peer list `pushes` times.
fn fake_server_with_pushes(
    peers: Option<Vec<&str>>,
    pushes: usize,
) -> (RendezvousSender, RendezvousReceiver, JoinHandle<()>) {
    let (tx, mut client_rx) = signaling::channel();
    let (server_tx, rx) = mpsc::unbounded_channel();
    let peers: Option<Vec<NodeId>> = peers.map(|peers| peers.into_iter().map(NodeId::from).collect());
    let handle = tokio::spawn(async move {
        while let Some(message) = client_rx.recv().await {
            match message {
                ClientMessage::ClientConnected => {
                    let id = NodeId::from("a");
                    server_tx.send(ServerMessage::AssignNodeId { id }).unwrap();
                }
                ClientMessage::PeerIsReady => {
                    if let Some(peers) = peers.as_ref() {
                        for _ in 0..pushes {
                            let peers = peers.clone();
                            server_tx
                                .send(ServerMessage::PeersForRound { peers })
                                .unwrap();
                        }
                    }
                }
                ClientMessage::SignalForPeer { .. } => {}
            }
        }
    });
    (tx, rx, handle)
}

#[tokio::test]
async fn test_connect() {
    let (tx, rx, _server) = fake_server(None);
    let mut client = new_client(protocol(3, 1_000), AggregatorSettings::default());
    assert_eq!(client.connect(tx.clone(), rx).await.unwrap(), NodeId::from("a"));
    assert_eq!(client.id(), Some(&NodeId::from("a")));
    client.with_aggregator(|aggregator| {
        assert!(aggregator.core().nodes().contains(&NodeId::from("a")));
    });

    let (_, rx) = mpsc::unbounded_channel();
    assert!(matches!(
        client.connect(tx, rx).await.unwrap_err(),
        ClientError::AlreadyConnected
    ));
}

#[tokio::test]
async fn test_connect_server_disconnected() {
    let (tx, _client_rx) = signaling::channel();
    let (_, rx) = mpsc::unbounded_channel();
    let mut client = new_client(protocol(3, 1_000), AggregatorSettings::default());
    assert!(matches!(
        client.connect(tx, rx).await.unwrap_err(),
        ClientError::ServerDisconnected
    ));
    assert!(client.id().is_none());
}

#[tokio::test]
async fn test_not_connected() {
    let mut client = new_client(protocol(3, 1_000), AggregatorSettings::default());
    assert!(matches!(
        client.exchange(&weights(1.0), &weights(0.0), 1).await.unwrap_err(),
        RoundError::NotConnected
    ));
    let update = client
        .on_round_end_communication(weights(1.0), &weights(0.0), 1)
        .await;
    assert_eq!(update, weights(1.0));
}

#[tokio::test]
async fn test_rendezvous_timeout() {
    let (tx, rx, _server) = fake_server(None);
    let mut client = new_client(protocol(3, 50), AggregatorSettings::default());
    client.connect(tx, rx).await.unwrap();
    assert!(matches!(
        client.exchange(&weights(1.0), &weights(0.0), 1).await.unwrap_err(),
        RoundError::Timeout(_)
    ));
    let update = client
        .on_round_end_communication(weights(4.0), &weights(0.0), 2)
        .await;
    assert_eq!(update, weights(4.0));
}

#[tokio::test]
async fn test_not_enough_peers() {
    let (tx, rx, _server) = fake_server(Some(vec!["b"]));
    let mut client = new_client(protocol(3, 1_000), AggregatorSettings::default());
    client.connect(tx, rx).await.unwrap();
    assert!(matches!(
        client.exchange(&weights(1.0), &weights(0.0), 1).await.unwrap_err(),
        RoundError::NotEnoughPeers {
            available: 2,
            required: 3
        }
    ));
}

#[tokio::test]
async fn test_invalid_peer_lists() {
    let (tx, rx, _server) = fake_server(Some(vec!["a", "b", "c"]));
    let mut client = new_client(protocol(3, 1_000), AggregatorSettings::default());
    client.connect(tx, rx).await.unwrap();
    assert!(matches!(
        client.exchange(&weights(1.0), &weights(0.0), 1).await.unwrap_err(),
        RoundError::SelfInPeerList
    ));

    let (tx, rx, _server) = fake_server(Some(vec!["b", "c", "b"]));
    let mut client = new_client(protocol(3, 1_000), AggregatorSettings::default());
    client.connect(tx, rx).await.unwrap();
    assert!(matches!(
        client.exchange(&weights(1.0), &weights(0.0), 1).await.unwrap_err(),
        RoundError::DuplicatePeerList
    ));
}

#[tokio::test]
async fn test_second_peer_list() {
    let (tx, rx, _server) = fake_server_with_pushes(Some(vec!["b", "c"]), 2);
    let mut client = new_client(protocol(3, 1_000), AggregatorSettings::default());
    client.connect(tx, rx).await.unwrap();
    assert!(matches!(
        client.exchange(&weights(1.0), &weights(0.0), 1).await.unwrap_err(),
        RoundError::UnexpectedPeerList
    ));
}

fn ids(ids: &[&str]) -> BTreeSet<NodeId> {
    ids.iter().map(|id| NodeId::from(*id)).collect()
}

fn payload(peer: &str, round: u64, value: f32) -> PeerMessage {
    PeerMessage::new(PayloadKind::Weights, NodeId::from(peer), round, &weights(value)).unwrap()
}

#[tokio::test]
async fn test_peers_complete_exchange_first() {
    let aggregator = SharedAggregator::new(Box::new(MeanAggregator::new(0.5, 0).unwrap()));
    let round = aggregator.start_round(0, ids(&["a", "b", "c"]));
    aggregator.receive(payload("b", 0, 2.0));
    aggregator.receive(payload("c", 0, 4.0));
    assert_eq!(aggregator.lock().exchange(), (1, 0));

    let result = exchange_once(
        &NodeId::from("a"),
        &aggregator,
        &HashMap::new(),
        &weights(100.0),
        round,
        0,
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    assert!(result.approx_eq(&weights(3.0), 1e-6));
    // the own payload doesn't leak into the next round
    assert_eq!(aggregator.lock().aggregator.core().size(), 0);
}

#[tokio::test]
async fn test_exchange_of_skipped_round() {
    let aggregator = SharedAggregator::new(Box::new(MeanAggregator::new(1.0, 0).unwrap()));
    aggregator.start_round(3, ids(&["a", "b"]));
    assert!(matches!(
        exchange_once(
            &NodeId::from("a"),
            &aggregator,
            &HashMap::new(),
            &weights(1.0),
            1,
            0,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err(),
        RoundError::OutOfSync
    ));
}

#[tokio::test]
async fn test_server_disconnected_during_round() {
    let (tx, rx, server) = fake_server(None);
    let mut client = new_client(protocol(3, 1_000), AggregatorSettings::default());
    client.connect(tx, rx).await.unwrap();
    server.abort();
    let _ = server.await;
    assert!(matches!(
        client.exchange(&weights(1.0), &weights(0.0), 1).await.unwrap_err(),
        RoundError::ServerDisconnected | RoundError::Signaling(_)
    ));
}

/// Runs one round with three nodes connected to an in-process rendezvous server.
async fn run_round(aggregator: AggregatorSettings, updates: Vec<f32>) -> Vec<WeightsContainer> {
    let server = RendezvousHandle::new(updates.len());
    let transport = MemoryTransport::new(256);

    let mut rounds = Vec::new();
    for value in updates {
        let (tx, rx) = server.connect_local("task");
        let mut client = DecentralizedClient::new(
            protocol(3, 10_000),
            aggregator.build().unwrap(),
            Box::new(PrivacySettings::default()),
            Arc::new(transport.clone()),
        );
        rounds.push(tokio::spawn(async move {
            client.connect(RendezvousSender::new(tx), rx).await.unwrap();
            let result = client
                .exchange(&weights(value), &weights(0.0), 1)
                .await
                .unwrap();
            // the peers may still be waiting for our payloads
            (client, result)
        }));
    }

    let mut clients = Vec::new();
    let mut results = Vec::new();
    for round in rounds {
        let (client, result) = round.await.unwrap();
        clients.push(client);
        results.push(result);
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mean_round() {
    let results = run_round(AggregatorSettings::default(), vec![1.0, 2.0, 3.0]).await;
    for result in results {
        assert!(result.approx_eq(&weights(2.0), 1e-6));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mean_round_relative_threshold() {
    let aggregator = AggregatorSettings::Mean {
        threshold: 0.5,
        threshold_type: None,
        round_cutoff: 0,
        min_participants: None,
    };
    let results = run_round(aggregator, vec![1.0, 3.0, 5.0]).await;
    // every node averages two of the three updates, none keeps its own
    for result in results {
        assert!([2.0, 3.0, 4.0]
            .iter()
            .any(|mean| result.approx_eq(&weights(*mean), 1e-6)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_secure_round() {
    let aggregator = AggregatorSettings::Secure {
        max_share_value: 100.0,
    };
    let results = run_round(aggregator, vec![1.0, 2.0, 3.0]).await;
    for result in results {
        assert!(result.approx_eq(&weights(2.0), 1e-3));
    }
}
