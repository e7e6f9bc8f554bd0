//! meridian-edge: the shared interface between the Meridian server and its
//! edge devices.
//!
//! Holds the wire message envelope and codec, the [`EdgeChannel`] channel
//! abstraction with its dispatch loop, and the driver metadata types both
//! sides agree on. Transport implementations live with the binaries.

pub mod channel;
pub mod driver_config;
pub mod handler;
pub mod messages;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod units;

pub use channel::{ChannelError, EdgeChannel};
pub use handler::{CommunicationHandler, HandlerError, MessageHandler, MessageObserver};
pub use messages::{
    CodecError, DeviceConfigPayload, DeviceConfigResponsePayload, DeviceDataAckPayload,
    DeviceDataPayload, DriverTimeseries, EdgeMessage, EdgeVersionPayload, MessageType,
};

/// The unique identifier of a device.
pub type DeviceId = uuid::Uuid;

/// The HTTP/websocket path a device connects to.
pub fn websocket_endpoint(device_id: DeviceId) -> String {
    format!("/devices/{device_id}/ws")
}

/// The HTTP path a device fetches its connection token from.
pub fn websocket_token_endpoint(device_id: DeviceId) -> String {
    format!("/devices/{device_id}/ws/token")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_embed_the_device_id() {
        let device_id: DeviceId = "0191d9b4-6f5a-7cde-8f00-000000000001".parse().unwrap();
        assert_eq!(
            websocket_endpoint(device_id),
            "/devices/0191d9b4-6f5a-7cde-8f00-000000000001/ws"
        );
        assert_eq!(
            websocket_token_endpoint(device_id),
            "/devices/0191d9b4-6f5a-7cde-8f00-000000000001/ws/token"
        );
    }
}
