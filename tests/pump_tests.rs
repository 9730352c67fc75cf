mod common;

use common::*;
use haversine::policy::{CollectionEvent, EventSinkTransfers};
use haversine::pump::PumpStats;
use haversine::simulator::{collection_payload, SimulatedTransport, SimulatorConfig};
use haversine::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pump_transfers_from_every_satellite() {
    let (transport, events) = SimulatedTransport::new(SimulatorConfig::default());
    let transport = Arc::new(transport);
    for n in 0..4 {
        transport.add_satellite(simulated(n, CollectionIndexes::new(10, 15)));
    }
    let (sink, mut collected) = mpsc::unbounded_channel();
    let manager = Arc::new(SatelliteManager::new(
        transport.clone(),
        Environment::new().with_transfers(Arc::new(EventSinkTransfers::new(sink))),
        ManagerConfig::default(),
    ));
    let pump = EventPump::spawn(Arc::clone(&manager), events);

    manager.scan_for_satellites().unwrap();

    let mut delivered = HashSet::new();
    while delivered.len() < 20 {
        let event = timeout(Duration::from_secs(10), collected.recv())
            .await
            .expect("collections should arrive")
            .expect("sink open");
        if let CollectionEvent::Finished { satellite, index, data } = event {
            let slot = (0..4)
                .find(|&n| satellite_id(n) == satellite)
                .expect("known satellite");
            assert_eq!(data, collection_payload(&format!("HV-{:04}", slot), index));
            assert!(delivered.insert((satellite, index)), "collection delivered twice");
        }
    }

    manager.shutdown();
    let stats = pump.shutdown().await;
    assert_eq!(stats.mailboxes, 4);
    assert!(stats.transfers >= 4);
    assert!(stats.events >= 12);

    for n in 0..4 {
        let satellite = manager.satellite(&satellite_id(n)).unwrap();
        assert!(satellite.pending_collections().is_empty());
    }
}

#[tokio::test]
async fn test_join_waits_for_stream_end() {
    let transport = MockTransport::new(AdapterState::PoweredOn);
    let manager = manager_with(transport.clone(), Environment::new());
    let (sender, receiver) = mpsc::unbounded_channel();
    let pump = EventPump::spawn(Arc::clone(&manager), receiver);

    sender
        .send(TransportEvent::AdapterStateChanged(AdapterState::PoweredOff))
        .unwrap();
    sender
        .send(TransportEvent::Advertisement(advertisement(&satellite_id(1), -60)))
        .unwrap();
    sender
        .send(TransportEvent::Advertisement(advertisement(&satellite_id(2), -70)))
        .unwrap();
    drop(sender);

    let stats = pump.join().await;
    assert_eq!(
        stats,
        PumpStats {
            events: 3,
            mailboxes: 2,
            transfers: 0,
        }
    );
    assert_eq!(manager.bluetooth_state(), AdapterState::PoweredOff);
    assert_eq!(manager.get_discovered_satellites().len(), 2);
    // Adapter was off before the advertisements were handled
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_shutdown_without_events() {
    let manager = manager_with(MockTransport::powered_on(), Environment::new());
    let (_sender, receiver) = mpsc::unbounded_channel();
    let pump = EventPump::spawn(manager, receiver);

    assert!(!pump.is_finished());
    let stats = pump.shutdown().await;
    assert_eq!(stats, PumpStats::default());
}
