//! Client connection context
//!
//! The monitor asks the connection whether a message may be sent in its
//! current state before the message reaches the ring, and flushes the
//! connection's shared buffers before messages that touch them.

use std::sync::Mutex;

use crate::layout::{status, AnswerMessage, CommandMessage, MessageType};
use crate::shmem::SharedMemoryMonitor;
use crate::signal::lock;

/// Connection-side hooks consulted on the send path
pub trait ConnectionContext: Send + Sync {
    /// Whether `msg` is acceptable in the connection's current state
    fn check_message_validity(&self, msg: &CommandMessage) -> bool;

    /// Buffers shared by this connection, if any
    fn shared_memory(&self) -> Option<&SharedMemoryMonitor> {
        None
    }

    /// Called with every answer returned to a blocking send
    fn record_answer(&self, _answer: &AnswerMessage) {}
}

/// Device context lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceContextState {
    NoDeviceContext,
    Valid { device_context: u32 },
    Closed,
}

/// Connection of one client to the secure world
#[derive(Debug)]
pub struct Connection {
    state: Mutex<DeviceContextState>,
    shmem: SharedMemoryMonitor,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceContextState::NoDeviceContext),
            shmem: SharedMemoryMonitor::new(),
        }
    }

    pub fn state(&self) -> DeviceContextState {
        *lock(&self.state)
    }

    pub fn shmem(&self) -> &SharedMemoryMonitor {
        &self.shmem
    }
}

impl ConnectionContext for Connection {
    fn check_message_validity(&self, msg: &CommandMessage) -> bool {
        let state = *lock(&self.state);
        match (msg.kind(), state) {
            (Some(MessageType::CreateDeviceContext), DeviceContextState::NoDeviceContext) => true,
            (Some(MessageType::PowerManagement), _) | (None, _) => false,
            (Some(MessageType::CreateDeviceContext), _) => false,
            (Some(_), DeviceContextState::Valid { .. }) => true,
            (Some(_), _) => false,
        }
    }

    fn shared_memory(&self) -> Option<&SharedMemoryMonitor> {
        Some(&self.shmem)
    }

    /// Advance the device context state from a received answer
    fn record_answer(&self, answer: &AnswerMessage) {
        if answer.status != status::S_SUCCESS {
            return;
        }
        let mut state = lock(&self.state);
        match (answer.kind(), *state) {
            (Some(MessageType::CreateDeviceContext), DeviceContextState::NoDeviceContext) => {
                *state = DeviceContextState::Valid {
                    device_context: answer.body[0],
                };
            }
            (Some(MessageType::DestroyDeviceContext), DeviceContextState::Valid { .. }) => {
                *state = DeviceContextState::Closed;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(handle: u32) -> AnswerMessage {
        let mut ans = AnswerMessage::new(MessageType::CreateDeviceContext, 0, status::S_SUCCESS);
        ans.body[0] = handle;
        ans
    }

    #[test]
    fn test_fresh_connection_only_creates() {
        let conn = Connection::new();
        assert!(conn.check_message_validity(&CommandMessage::new(MessageType::CreateDeviceContext)));
        assert!(!conn.check_message_validity(&CommandMessage::new(MessageType::OpenClientSession)));
        assert!(!conn.check_message_validity(&CommandMessage::prepare_shutdown()));
    }

    #[test]
    fn test_device_context_lifecycle() {
        let conn = Connection::new();
        conn.record_answer(&created(0x44));
        assert_eq!(conn.state(), DeviceContextState::Valid { device_context: 0x44 });
        assert!(conn.check_message_validity(&CommandMessage::new(MessageType::InvokeClientCommand)));
        assert!(!conn.check_message_validity(&CommandMessage::new(MessageType::CreateDeviceContext)));

        let destroyed = AnswerMessage::new(MessageType::DestroyDeviceContext, 0, status::S_SUCCESS);
        conn.record_answer(&destroyed);
        assert_eq!(conn.state(), DeviceContextState::Closed);
        assert!(!conn.check_message_validity(&CommandMessage::new(MessageType::InvokeClientCommand)));
    }

    #[test]
    fn test_failed_create_keeps_state() {
        let conn = Connection::new();
        let mut failed = created(1);
        failed.status = status::S_ERROR_GENERIC;
        conn.record_answer(&failed);
        assert_eq!(conn.state(), DeviceContextState::NoDeviceContext);
    }
}
