//! End-to-end exercises of the device's dispatch loop against a scripted
//! peer, without a real websocket.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use device::comm::{DeviceConfigResponseHandler, DeviceDataAckHandler, EdgeVersionHandler};
use device::storage::blackbox::Blackbox;
use device::update::Updater;
use meridian_edge::handler::CommunicationHandler;
use meridian_edge::messages::{
    DeviceConfigResponsePayload, DeviceDataAckPayload, EdgeMessage, EdgeVersionPayload,
    MessageType,
};
use meridian_edge::testing::InMemoryChannel;
use meridian_edge::{ChannelError, EdgeChannel};
use tokio::sync::Mutex;

struct RecordingUpdater(AtomicBool);

impl Updater for RecordingUpdater {
    fn update(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn device_id() -> meridian_edge::DeviceId {
    "0191d9b4-6f5a-7cde-8f00-000000000001".parse().unwrap()
}

fn ts(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap()
}

fn make_blackbox() -> (Arc<Mutex<Blackbox>>, tempfile::NamedTempFile) {
    let file = tempfile::NamedTempFile::new().unwrap();
    let blackbox = Arc::new(Mutex::new(Blackbox::open(file.path()).unwrap()));
    (blackbox, file)
}

fn build_handler(
    channel: Arc<InMemoryChannel>,
    blackbox: Arc<Mutex<Blackbox>>,
    updater: Arc<RecordingUpdater>,
) -> CommunicationHandler<InMemoryChannel> {
    let mut handler = CommunicationHandler::new(channel, device_id());
    handler.register_handler(
        MessageType::EdgeVersion,
        Box::new(EdgeVersionHandler::new(updater).unwrap()),
    );
    handler.register_handler(
        MessageType::DeviceConfigResponse,
        Box::new(DeviceConfigResponseHandler::new(Arc::clone(&blackbox))),
    );
    handler.register_handler(
        MessageType::DeviceDataAck,
        Box::new(DeviceDataAckHandler::new(blackbox)),
    );
    handler
}

/// Buffered samples become deliverable after the config response arrives,
/// and the ack empties the buffer.
#[tokio::test]
async fn config_then_data_then_ack_round_trip() {
    let (device_end, server_end) = InMemoryChannel::pair();
    let device_end = Arc::new(device_end);
    let (blackbox, _file) = make_blackbox();
    let updater = Arc::new(RecordingUpdater(AtomicBool::new(false)));
    let handler = build_handler(Arc::clone(&device_end), Arc::clone(&blackbox), updater);

    // Three samples, recorded while no server id is known yet.
    {
        let mut guard = blackbox.lock().await;
        for (offset, value) in [(0, 21.5), (30, 21.6), (60, 21.7)] {
            guard
                .record(
                    "climate",
                    ts(1_705_320_000 + offset),
                    &BTreeMap::from([("temperature".to_owned(), value)]),
                )
                .unwrap();
        }
        assert!(guard.stage(250).unwrap().is_none());
    }

    // The server answers the config announcement with the index mapping.
    let mut index = BTreeMap::new();
    index.insert(
        "climate".to_owned(),
        BTreeMap::from([("temperature".to_owned(), 42i64)]),
    );
    server_end
        .send(&EdgeMessage::DeviceConfigResponse(
            DeviceConfigResponsePayload {
                timeseries_index: index,
            },
        ))
        .await
        .unwrap();
    server_end.disconnect().await;
    assert!(matches!(
        handler.listen().await,
        Err(ChannelError::Disconnected)
    ));

    // Staging now yields the batch, grouped under the server id.
    let payload = {
        let mut guard = blackbox.lock().await;
        guard.stage(250).unwrap().expect("batch after reconcile")
    };
    let series = &payload.data[&42];
    assert_eq!(
        series.timestamps_utc,
        vec![1_705_320_000, 1_705_320_030, 1_705_320_060]
    );
    assert_eq!(series.values, vec![21.5, 21.6, 21.7]);

    // The ack deletes exactly this batch.
    let handler = build_handler(
        Arc::clone(&device_end),
        Arc::clone(&blackbox),
        Arc::new(RecordingUpdater(AtomicBool::new(false))),
    );
    handler
        .handle_message(EdgeMessage::DeviceDataAck(DeviceDataAckPayload {
            staging_id: payload.staging_id,
        }))
        .await
        .unwrap();
    assert_eq!(blackbox.lock().await.sample_count().unwrap(), 0);
}

/// A ping from the server is answered with a pong; a newer announced
/// version triggers the update seam.
#[tokio::test]
async fn ping_and_version_handling() {
    let (device_end, server_end) = InMemoryChannel::pair();
    let device_end = Arc::new(device_end);
    let (blackbox, _file) = make_blackbox();
    let updater = Arc::new(RecordingUpdater(AtomicBool::new(false)));
    let handler = build_handler(Arc::clone(&device_end), blackbox, Arc::clone(&updater));

    server_end.send(&EdgeMessage::Ping).await.unwrap();
    server_end
        .send(&EdgeMessage::EdgeVersion(EdgeVersionPayload {
            version: "999.0.0".to_owned(),
        }))
        .await
        .unwrap();
    server_end.disconnect().await;
    let _ = handler.listen().await;

    assert_eq!(server_end.try_receive(), Some(EdgeMessage::Pong));
    assert!(updater.0.load(Ordering::SeqCst));
}

/// An unacked staged batch survives, and a replayed ack for an already
/// confirmed batch stays harmless.
#[tokio::test]
async fn replayed_acks_are_no_ops() {
    let (device_end, _server_end) = InMemoryChannel::pair();
    let device_end = Arc::new(device_end);
    let (blackbox, _file) = make_blackbox();
    let handler = build_handler(
        Arc::clone(&device_end),
        Arc::clone(&blackbox),
        Arc::new(RecordingUpdater(AtomicBool::new(false))),
    );

    let staging_id = {
        let mut guard = blackbox.lock().await;
        guard
            .record(
                "climate",
                ts(1_705_320_000),
                &BTreeMap::from([("temperature".to_owned(), 21.5)]),
            )
            .unwrap();
        let id = guard.find_index(None, None).unwrap()[0].timeseries_id;
        guard.update_index(id, Some(42)).unwrap();
        guard.stage(250).unwrap().unwrap().staging_id
    };

    for _ in 0..2 {
        handler
            .handle_message(EdgeMessage::DeviceDataAck(DeviceDataAckPayload {
                staging_id: staging_id.clone(),
            }))
            .await
            .unwrap();
    }
    assert_eq!(blackbox.lock().await.sample_count().unwrap(), 0);
}
