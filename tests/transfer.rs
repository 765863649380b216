use bgg_config_lib::cancellation::CancelToken;
use bgg_config_lib::device::SimulatedFirmware;
use bgg_config_lib::serial::loopback::{loopback_pair, ServedDevice};
use bgg_config_lib::serial::unified::UnifiedSerialBuilder;
use bgg_config_lib::serial::{DeviceProtocol, SerialInterface};
use bgg_config_lib::transfer::{TransferEvent, TransferQueue};

fn serve(mut firmware: SimulatedFirmware) -> (DeviceProtocol, ServedDevice) {
    let (port, device) = loopback_pair();
    let served = device.serve(move |line| firmware.handle(line));
    let handle = UnifiedSerialBuilder::new(SerialInterface::from_io(Box::new(port))).build();
    (DeviceProtocol::new(handle), served)
}

fn names(events: &[TransferEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| match e {
            TransferEvent::Loaded { name, .. } => format!("loaded:{}", name),
            TransferEvent::Failed { name, .. } => format!("failed:{}", name),
            TransferEvent::Restored { name, .. } => format!("restored:{}", name),
            TransferEvent::AllLoaded { device_name } => format!("done:{}", device_name.as_deref().unwrap_or("-")),
        })
        .collect()
}

#[tokio::test]
async fn loads_boot_files_in_order() {
    let (protocol, device) = serve(SimulatedFirmware::default());
    let mut queue = TransferQueue::with_defaults(protocol, CancelToken::new());

    let mut events = Vec::new();
    queue.load_all(|e| events.push(e)).await.unwrap();

    assert_eq!(names(&events), vec!["loaded:config", "loaded:presets", "loaded:user_presets", "done:CH-Guitar"]);
    let reads: Vec<String> = device.received().into_iter().filter(|l| l.starts_with("READFILE:")).collect();
    assert_eq!(
        reads,
        vec!["READFILE:config.json", "READFILE:presets.json", "READFILE:user_presets.json", "READFILE:boot.py"]
    );
    assert!(queue.pending().is_empty());
}

#[tokio::test]
async fn corrupt_config_is_restored_from_factory_once() {
    let firmware = SimulatedFirmware::default().with_file("config.json", "{\"GREEN_FRET\": \"GP10\",");
    let (protocol, device) = serve(firmware);
    let mut queue = TransferQueue::with_defaults(protocol, CancelToken::new());

    let mut events = Vec::new();
    queue.load_all(|e| events.push(e)).await.unwrap();

    assert_eq!(
        names(&events),
        vec!["restored:config", "loaded:presets", "loaded:user_presets", "done:CH-Guitar"]
    );
    match &events[0] {
        TransferEvent::Restored { contents, .. } => assert_eq!(contents["WHAMMY"], "GP27"),
        other => panic!("unexpected {:?}", other),
    }

    let received = device.received();
    let count = |line: &str| received.iter().filter(|l| l.as_str() == line).count();
    assert_eq!(count("READFILE:factory_config.json"), 1);
    assert_eq!(count("WRITEFILE:config.json"), 1);
}

#[tokio::test]
async fn missing_file_is_reported_and_queue_continues() {
    let (protocol, _device) = serve(SimulatedFirmware::default().without_file("presets.json"));
    let mut queue = TransferQueue::with_defaults(protocol, CancelToken::new());

    let mut events = Vec::new();
    queue.load_all(|e| events.push(e)).await.unwrap();

    assert_eq!(names(&events), vec!["loaded:config", "failed:presets", "loaded:user_presets", "done:CH-Guitar"]);
}

#[tokio::test]
async fn cancelled_session_stops_the_queue() {
    let (protocol, _device) = serve(SimulatedFirmware::default());
    let token = CancelToken::new();
    token.cancel();
    let mut queue = TransferQueue::with_defaults(protocol, token);

    let mut events = Vec::new();
    assert!(queue.load_all(|e| events.push(e)).await.is_err());
    assert!(events.is_empty());
    assert!(queue.pending().is_empty());
}
