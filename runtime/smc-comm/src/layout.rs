//! Shared page layouts exchanged with the secure world
//!
//! Two structures are shared: the L0 page (SMC init input, protocol version,
//! PA exit status, trace area and crypto scratch space) and the L1 page (the
//! command/answer rings and the clock/timeout registers). Both must occupy
//! exactly one page.

use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::AtomicU32;

use smc_platform::PAGE_SIZE;
use static_assertions::{const_assert, const_assert_eq};

use crate::error::{CommError, Result};

/// Slots per ring (commands and answers alike)
pub const QUEUE_CAPACITY: u32 = 32;

pub const COMMAND_BODY_WORDS: usize = 14;
pub const ANSWER_BODY_WORDS: usize = 5;

/// Protocol version this driver speaks
pub const PROTOCOL_VERSION: u32 = 0x0602_0000;
pub const PROTOCOL_MAJOR_VERSION: u32 = protocol_major(PROTOCOL_VERSION);

/// Major component of a protocol version word
pub const fn protocol_major(version: u32) -> u32 {
    version >> 24
}

pub const fn protocol_minor(version: u32) -> u32 {
    (version >> 16) & 0xFF
}

/// Secure channel status words carried in answers and in the L0 exit status
pub mod status {
    pub const S_SUCCESS: u32 = 0x0000_0000;
    pub const S_ERROR_GENERIC: u32 = 0xFFFF_0000;
    pub const S_ERROR_BAD_STATE: u32 = 0xFFFF_0007;
    pub const S_PENDING: u32 = 0xFFFF_2000;
    pub const S_ERROR_SDP_RUNTIME_INIT_ADDR_CHECK_FAIL: u32 = 0xFFFF_3001;
}

/// Command word written into L0 to start the channel
pub const L1_COMMAND_SMC_INIT: u32 = 0x0000_0001;

/// Power management operation carried in `body[0]`
pub const PM_PREPARE_SHUTDOWN: u32 = 0x0000_0001;

// L0 output overlays the input header
pub const L0_PROTOCOL_VERSION_OFFSET: usize = 0x0;
pub const L0_L1_STATUS_OFFSET: usize = 0x4;
pub const L0_TRACE_OFFSET: usize = 0xC00;
pub const L0_TRACE_CAPACITY: usize = PAGE_SIZE - L0_TRACE_OFFSET;
pub const L0_PROPERTIES_CAPACITY: usize = L0_TRACE_OFFSET - 28;

// Status word power state field
pub const STATUS_POWER_STATE_SHIFT: u32 = 3;
pub const STATUS_POWER_STATE_MASK: u32 = 0x1F << STATUS_POWER_STATE_SHIFT;

// Timeout sentinels
pub const TIME_IMMEDIATE: u64 = 0;
pub const TIME_INFINITE: u64 = u64::MAX;

/// Operation id used for messages that expect no correlated answer
pub const OPERATION_ID_NONE: u32 = u32::MAX;

/// Message kinds understood by the secure world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    CreateDeviceContext = 0x02,
    OpenClientSession = 0xF0,
    CloseClientSession = 0xF2,
    CancelClientOperation = 0xF4,
    InvokeClientCommand = 0xF5,
    RegisterSharedMemory = 0xF7,
    ReleaseSharedMemory = 0xF9,
    DestroyDeviceContext = 0xFD,
    PowerManagement = 0xFE,
}

impl MessageType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x02 => Self::CreateDeviceContext,
            0xF0 => Self::OpenClientSession,
            0xF2 => Self::CloseClientSession,
            0xF4 => Self::CancelClientOperation,
            0xF5 => Self::InvokeClientCommand,
            0xF7 => Self::RegisterSharedMemory,
            0xF9 => Self::ReleaseSharedMemory,
            0xFD => Self::DestroyDeviceContext,
            0xFE => Self::PowerManagement,
            _ => return None,
        })
    }

    /// Messages that touch client shared memory
    pub fn uses_client_memory(self) -> bool {
        matches!(
            self,
            Self::OpenClientSession | Self::CloseClientSession | Self::InvokeClientCommand
        )
    }
}

/// Secure-world power state decoded from the L1 status word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Uninitialized,
    Active,
    ReadyToShutdown,
    Unknown(u32),
}

impl PowerMode {
    pub fn from_status(status_s: u32) -> Self {
        match (status_s & STATUS_POWER_STATE_MASK) >> STATUS_POWER_STATE_SHIFT {
            0 => Self::Uninitialized,
            3 => Self::Active,
            5 => Self::ReadyToShutdown,
            other => Self::Unknown(other),
        }
    }

    pub fn to_status_bits(self) -> u32 {
        let raw = match self {
            Self::Uninitialized => 0,
            Self::Active => 3,
            Self::ReadyToShutdown => 5,
            Self::Unknown(v) => v,
        };
        (raw << STATUS_POWER_STATE_SHIFT) & STATUS_POWER_STATE_MASK
    }
}

/// Command slot in the L1 command ring
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandMessage {
    pub message_size: u8,
    pub message_type: u8,
    pub flags: u16,
    pub operation_id: u32,
    pub body: [u32; COMMAND_BODY_WORDS],
}

impl CommandMessage {
    pub fn new(kind: MessageType) -> Self {
        Self {
            message_size: COMMAND_BODY_WORDS as u8,
            message_type: kind as u8,
            flags: 0,
            operation_id: OPERATION_ID_NONE,
            body: [0; COMMAND_BODY_WORDS],
        }
    }

    pub fn with_body(mut self, words: &[u32]) -> Self {
        let n = words.len().min(COMMAND_BODY_WORDS);
        self.body[..n].copy_from_slice(&words[..n]);
        self
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_raw(self.message_type)
    }

    /// Power management command asking the secure side to shut down
    pub fn prepare_shutdown() -> Self {
        Self::new(MessageType::PowerManagement).with_body(&[PM_PREPARE_SHUTDOWN])
    }
}

/// Answer slot in the L1 answer ring
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerMessage {
    pub message_size: u8,
    pub message_type: u8,
    pub flags: u16,
    pub operation_id: u32,
    /// Secure channel status of the operation
    pub status: u32,
    pub body: [u32; ANSWER_BODY_WORDS],
}

impl AnswerMessage {
    pub fn new(kind: MessageType, operation_id: u32, status: u32) -> Self {
        Self {
            message_size: ANSWER_BODY_WORDS as u8,
            message_type: kind as u8,
            flags: 0,
            operation_id,
            status,
            body: [0; ANSWER_BODY_WORDS],
        }
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_raw(self.message_type)
    }
}

/// L1 shared page: rings plus clock/timeout registers
///
/// Counters are monotonic and wrap at `u32::MAX`; the slot index is
/// `counter % QUEUE_CAPACITY`. Normal-world writers hold the monitor lock.
#[repr(C)]
pub struct L1Buffer {
    pub config_flags_s: AtomicU32,
    pub status_s: AtomicU32,
    pub sync_serial_n: AtomicU32,
    pub sync_serial_s: AtomicU32,
    /// Normal-world clock, `[slot][HI, LO]`
    pub time_n: [[AtomicU32; 2]; 2],
    /// Secure-world timeout, `[slot][HI, LO]`
    pub timeout_s: [[AtomicU32; 2]; 2],
    pub first_command: AtomicU32,
    pub first_free_command: AtomicU32,
    pub first_answer: AtomicU32,
    pub first_free_answer: AtomicU32,
    pub(crate) commands: [UnsafeCell<CommandMessage>; QUEUE_CAPACITY as usize],
    pub(crate) answers: [UnsafeCell<AnswerMessage>; QUEUE_CAPACITY as usize],
    _reserved: [u8; 960],
}

pub const HI: usize = 0;
pub const LO: usize = 1;

/// SMC init request written at the start of the L0 page
#[repr(C)]
pub struct SmcInitInput {
    pub l1_command: u32,
    pub l1_shared_buffer_length: u32,
    pub l1_shared_buffer_phys_addr: u64,
    pub backing_store_addr: u32,
    pub back_ext_storage_addr: u32,
    pub properties_buffer_length: u32,
    pub properties_buffer: [u8; L0_PROPERTIES_CAPACITY],
    pub trace: [u8; L0_TRACE_CAPACITY],
}

/// PA info block handed to the PA load call
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PaInfo {
    pub certificate: usize,
    pub parameters: usize,
    pub results: usize,
}

const_assert_eq!(size_of::<CommandMessage>(), 64);
const_assert_eq!(size_of::<AnswerMessage>(), 32);
const_assert_eq!(size_of::<L1Buffer>(), PAGE_SIZE);
const_assert_eq!(size_of::<SmcInitInput>(), PAGE_SIZE);
const_assert!(QUEUE_CAPACITY.is_power_of_two());

/// Check both shared structures against the platform page size
pub fn check_page_layout(page_size: usize) -> Result<()> {
    for (name, actual) in [
        ("L0 shared buffer", size_of::<SmcInitInput>()),
        ("L1 shared buffer", size_of::<L1Buffer>()),
    ] {
        if actual != page_size {
            return Err(CommError::LayoutMismatch {
                name,
                actual,
                expected: page_size,
            });
        }
    }
    Ok(())
}

/// Volatile view of the L0 page
///
/// The secure side overwrites the input header with its output (protocol
/// version, exit status), so fields are accessed by offset.
#[derive(Debug, Clone, Copy)]
pub struct L0Page {
    base: *mut u8,
}

// SAFETY: the page is plain shared memory; access is serialised by the monitor
// lock on the normal-world side.
unsafe impl Send for L0Page {}
unsafe impl Sync for L0Page {}

impl L0Page {
    /// # Safety
    /// `vaddr` must point to a live, page-sized, suitably aligned block.
    pub unsafe fn from_raw(vaddr: usize) -> Self {
        Self { base: vaddr as *mut u8 }
    }

    pub fn vaddr(&self) -> usize {
        self.base as usize
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= PAGE_SIZE && offset % 4 == 0);
        // SAFETY: bounds and alignment checked above.
        unsafe { ptr::read_volatile(self.base.add(offset) as *const u32) }
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= PAGE_SIZE && offset % 4 == 0);
        // SAFETY: bounds and alignment checked above.
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
    }

    pub fn protocol_version(&self) -> u32 {
        self.read_u32(L0_PROTOCOL_VERSION_OFFSET)
    }

    pub fn l1_status(&self) -> u32 {
        self.read_u32(L0_L1_STATUS_OFFSET)
    }

    pub fn zero(&self) {
        // SAFETY: the page is PAGE_SIZE bytes long.
        unsafe { ptr::write_bytes(self.base, 0, PAGE_SIZE) }
    }

    /// Write the SMC init request over the whole page
    pub fn write_init_input(&self, input: &SmcInitInput) {
        // SAFETY: SmcInitInput is exactly one page.
        unsafe { ptr::copy_nonoverlapping(input as *const SmcInitInput, self.base as *mut SmcInitInput, 1) }
    }

    /// Read back the init request, as the secure side does
    pub fn read_init_input(&self) -> SmcInitInput {
        // SAFETY: SmcInitInput is plain old data spanning the page.
        unsafe { ptr::read_volatile(self.base as *const SmcInitInput) }
    }

    /// NUL-terminated trace string left by the secure side
    pub fn trace_message(&self) -> String {
        // SAFETY: the trace area lies within the page.
        let area = unsafe {
            core::slice::from_raw_parts(self.base.add(L0_TRACE_OFFSET), L0_TRACE_CAPACITY)
        };
        let end = area.iter().position(|&b| b == 0).unwrap_or(area.len());
        String::from_utf8_lossy(&area[..end]).into_owned()
    }

    /// Raw page bytes for the crypto delegate
    ///
    /// # Safety
    /// No other reference into the page may be live, which holds while the
    /// secure side is suspended in an RPC.
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.base, PAGE_SIZE)
    }
}

impl SmcInitInput {
    pub fn zeroed() -> Self {
        Self {
            l1_command: 0,
            l1_shared_buffer_length: 0,
            l1_shared_buffer_phys_addr: 0,
            backing_store_addr: 0,
            back_ext_storage_addr: 0,
            properties_buffer_length: 0,
            properties_buffer: [0; L0_PROPERTIES_CAPACITY],
            trace: [0; L0_TRACE_CAPACITY],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn test_page_layout_check() {
        assert!(check_page_layout(PAGE_SIZE).is_ok());
        assert!(matches!(
            check_page_layout(2 * PAGE_SIZE),
            Err(CommError::LayoutMismatch { name: "L0 shared buffer", .. })
        ));
    }

    #[test]
    fn test_l0_offsets() {
        assert_eq!(offset_of!(SmcInitInput, trace), L0_TRACE_OFFSET);
        assert_eq!(offset_of!(SmcInitInput, l1_shared_buffer_phys_addr), 8);
        assert_eq!(offset_of!(L1Buffer, commands), 64);
    }

    #[test]
    fn test_l1_fills_one_page() {
        assert_eq!(size_of::<L1Buffer>(), PAGE_SIZE);
        assert_eq!(offset_of!(L1Buffer, first_free_answer), 60);
        assert_eq!(offset_of!(L1Buffer, answers), 64 + 32 * size_of::<CommandMessage>());
        assert!(check_page_layout(PAGE_SIZE).is_ok());
    }

    #[test]
    fn test_protocol_version_helpers() {
        assert_eq!(PROTOCOL_MAJOR_VERSION, 0x06);
        assert_eq!(protocol_minor(PROTOCOL_VERSION), 0x02);
        assert_eq!(protocol_major(0x0700_0000), 0x07);
    }

    #[test]
    fn test_power_mode_roundtrip_bits() {
        let status = PowerMode::Active.to_status_bits() | 0x1;
        assert_eq!(PowerMode::from_status(status), PowerMode::Active);
        assert_eq!(PowerMode::from_status(0), PowerMode::Uninitialized);
        assert_eq!(PowerMode::from_status(7 << STATUS_POWER_STATE_SHIFT), PowerMode::Unknown(7));
    }

    #[test]
    fn test_message_types() {
        assert_eq!(MessageType::from_raw(0xFD), Some(MessageType::DestroyDeviceContext));
        assert_eq!(MessageType::from_raw(0x42), None);
        assert!(MessageType::InvokeClientCommand.uses_client_memory());
        assert!(!MessageType::CreateDeviceContext.uses_client_memory());

        let pm = CommandMessage::prepare_shutdown();
        assert_eq!(pm.kind(), Some(MessageType::PowerManagement));
        assert_eq!(pm.body[0], PM_PREPARE_SHUTDOWN);
        assert_eq!(pm.operation_id, OPERATION_ID_NONE);
    }

    #[test]
    fn test_l0_trace_message() {
        let mut page = vec![0u64; PAGE_SIZE / 8];
        let l0 = unsafe { L0Page::from_raw(page.as_mut_ptr() as usize) };
        let msg = b"secure hello";
        unsafe {
            l0.bytes_mut()[L0_TRACE_OFFSET..L0_TRACE_OFFSET + msg.len()].copy_from_slice(msg);
        }
        assert_eq!(l0.trace_message(), "secure hello");

        l0.write_u32(L0_L1_STATUS_OFFSET, status::S_ERROR_GENERIC);
        assert_eq!(l0.l1_status(), status::S_ERROR_GENERIC);
    }
}
