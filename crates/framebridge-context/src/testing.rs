//! Shared fixtures for unit tests.

use std::sync::Arc;

use framebridge_core::MessengerConfig;
use framebridge_messenger::Messenger;
use framebridge_transport::pair;

pub const HOST: &str = "https://host.test";
pub const GUEST: &str = "https://guest.test";

pub struct Sides {
    pub host: Arc<Messenger>,
    pub guest: Arc<Messenger>,
}

pub fn sides_with(host: MessengerConfig, guest: MessengerConfig) -> Sides {
    let (host_transport, guest_transport) = pair(HOST, GUEST);
    Sides {
        host: Messenger::spawn(host, host_transport),
        guest: Messenger::spawn(guest, guest_transport),
    }
}

pub fn sides() -> Sides {
    sides_with(
        MessengerConfig::host(HOST, GUEST),
        MessengerConfig::guest(GUEST, HOST),
    )
}
