//! Shared rig for the monitor integration tests
//!
//! The secure RPC entry resolves one process-wide monitor, so every test in a
//! binary takes the serial lock before building one.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use smc_comm::{
    CommMonitor, CommandMessage, Connection, ConnectionContext, LifecycleState, MessageType,
    MonitorBuilder, SdpAddresses,
};
use smc_platform::mock::{MockMemory, MockSecureMonitor};

static SERIAL: Mutex<()> = Mutex::new(());

pub const SDP: SdpAddresses = SdpAddresses {
    backing_store: 0x8000_0000,
    back_ext_storage: 0x8010_0000,
};

pub const PA_IMAGE: &[u8] = b"\x7fPA-image-for-tests";
pub const PROPERTIES: &[u8] = b"[Global]\ntrace_level=3\n";

pub fn serial() -> MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    SERIAL.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct Rig {
    pub mem: Arc<MockMemory>,
    pub platform: Arc<MockSecureMonitor>,
}

impl Rig {
    pub fn new() -> Self {
        let mem = Arc::new(MockMemory::new());
        let platform = Arc::new(MockSecureMonitor::new(mem.clone()));
        Self { mem, platform }
    }

    pub fn builder(&self) -> MonitorBuilder {
        CommMonitor::builder(self.platform.clone(), self.mem.clone())
    }

    pub fn monitor(&self) -> CommMonitor {
        self.builder().build().expect("build monitor")
    }
}

pub fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn start_active(monitor: &CommMonitor) {
    monitor.start(SDP, PA_IMAGE, PROPERTIES).expect("start");
    wait_until("secure side active", || monitor.lifecycle() == LifecycleState::Active);
}

/// Connection holding a device context created through `monitor`
pub fn open_connection(monitor: &CommMonitor) -> Connection {
    let conn = Connection::new();
    let create = CommandMessage::new(MessageType::CreateDeviceContext);
    monitor.send_receive(&create, &conn, None).expect("create device context");
    assert!(conn.check_message_validity(&CommandMessage::new(MessageType::InvokeClientCommand)));
    conn
}

pub fn invoke(tag: u32) -> CommandMessage {
    CommandMessage::new(MessageType::InvokeClientCommand).with_body(&[tag])
}
