use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use bgg_config_lib::device::simulated::SIMULATED_UID;
use bgg_config_lib::device::{ConnectionState, DeviceManager, SimulatedBackend, SimulatedFirmware, TickOutcome};
use bgg_config_lib::events::{event_channel, UiEvent};
use bgg_config_lib::serial::DeviceFilter;

fn manager(backend: Arc<SimulatedBackend>) -> DeviceManager {
    let (events, _) = event_channel();
    DeviceManager::new(backend, DeviceFilter::default(), events)
}

async fn next_matching<F>(events: &mut broadcast::Receiver<UiEvent>, mut pred: F) -> UiEvent
where
    F: FnMut(&UiEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(evt) if pred(&evt) => return evt,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event did not arrive")
}

#[tokio::test]
async fn tick_connects_and_reads_device_info() {
    let backend = Arc::new(SimulatedBackend::new(SimulatedFirmware::default));
    let manager = manager(backend.clone());
    let mut events = manager.subscribe_events();

    let outcome = manager.tick().await.unwrap();
    let id = outcome.connected.expect("should connect");

    match next_matching(&mut events, |e| matches!(e, UiEvent::DeviceConnected { .. })).await {
        UiEvent::DeviceConnected { device_id, port_name } => {
            assert_eq!(device_id, id);
            assert_eq!(port_name, backend.info().port_name);
        }
        _ => unreachable!(),
    }
    match next_matching(&mut events, |e| matches!(e, UiEvent::DeviceInfoRead { .. })).await {
        UiEvent::DeviceInfoRead { uid, firmware_version, device_name, .. } => {
            assert_eq!(uid.as_deref(), Some(SIMULATED_UID));
            assert_eq!(firmware_version.as_deref(), Some("2.2"));
            assert_eq!(device_name.as_deref(), Some("CH-Guitar"));
        }
        _ => unreachable!(),
    }

    let device = manager.get_device(&id).await.unwrap();
    assert_eq!(device.connection_state, ConnectionState::Connected);

    // Nothing changed, so nothing happens.
    assert_eq!(manager.tick().await.unwrap(), TickOutcome::default());
    assert_eq!(backend.open_count(), 1);
}

#[tokio::test]
async fn removed_port_tears_the_session_down() {
    let backend = Arc::new(SimulatedBackend::new(SimulatedFirmware::default));
    let manager = manager(backend.clone());
    let mut events = manager.subscribe_events();

    let id = manager.tick().await.unwrap().connected.unwrap();
    let session = manager.active_session().await.unwrap();

    backend.set_present(false);
    let outcome = manager.tick().await.unwrap();
    assert!(outcome.disconnected == Some(id) || manager.active_session().await.is_none());

    next_matching(&mut events, |e| matches!(e, UiEvent::DeviceDisconnected { device_id, .. } if *device_id == id)).await;
    assert!(session.is_closed());
    assert!(manager.active_session().await.is_none());
    assert_eq!(manager.get_device(&id).await.unwrap().connection_state, ConnectionState::Disconnected);

    assert_eq!(manager.cleanup_disconnected_devices().await.unwrap(), vec![id]);
    assert!(manager.get_devices().await.is_empty());
}

#[tokio::test]
async fn transport_loss_is_noticed_without_a_tick() {
    let backend = Arc::new(SimulatedBackend::new(SimulatedFirmware::default));
    let manager = manager(backend.clone());
    let mut events = manager.subscribe_events();
    let mut sessions = manager.session_watch();

    manager.tick().await.unwrap();
    next_matching(&mut events, |e| matches!(e, UiEvent::DeviceInfoRead { .. })).await;

    backend.unplug();
    next_matching(&mut events, |e| matches!(e, UiEvent::DeviceDisconnected { .. })).await;
    tokio::time::timeout(Duration::from_secs(5), sessions.wait_for(|s| s.is_none()))
        .await
        .unwrap()
        .unwrap();

    // Port still listed: the next tick opens a fresh session.
    let outcome = manager.tick().await.unwrap();
    assert!(outcome.connected.is_some());
    assert_eq!(backend.open_count(), 2);
}

#[tokio::test]
async fn explicit_disconnect_and_reconnect() {
    let backend = Arc::new(SimulatedBackend::new(SimulatedFirmware::default));
    let manager = manager(backend.clone());

    let id = manager.tick().await.unwrap().connected.unwrap();
    assert!(manager.connect_device(&id).await.is_err());

    manager.disconnect_device(&id).await.unwrap();
    assert!(manager.active_session().await.is_none());
    assert!(manager.disconnect_device(&id).await.is_err());

    manager.connect_device(&id).await.unwrap();
    assert_eq!(manager.active_session().await.unwrap().id, id);
}

#[tokio::test]
async fn no_ports_means_no_session() {
    let backend = Arc::new(SimulatedBackend::new(SimulatedFirmware::default));
    backend.set_present(false);
    let manager = manager(backend.clone());

    assert_eq!(manager.tick().await.unwrap(), TickOutcome::default());
    assert!(manager.get_devices().await.is_empty());
    assert_eq!(backend.open_count(), 0);
}
