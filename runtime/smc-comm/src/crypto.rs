//! Public crypto delegate invoked from secure-world RPCs
//!
//! The delegate receives the L0 page, which carries the request and receives
//! the result. Its payload layout is owned by the delegate.

use crate::rpc::status;

/// Handlers for the public crypto RPC family
pub trait CryptoDelegate: Send {
    fn init(&mut self, l0: &mut [u8]) -> u32;

    fn update(&mut self, l0: &mut [u8]) -> u32;

    fn finalize(&mut self, l0: &mut [u8]) -> u32;

    fn terminate(&mut self, l0: &mut [u8]) -> u32;

    fn enable_clock(&mut self, l0: &mut [u8]) -> u32;

    /// Forget the current crypto session
    fn invalidate_session(&mut self);

    /// Release delegate resources when the monitor terminates
    fn shutdown(&mut self) {}
}

/// Delegate for builds without public crypto acceleration
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCrypto;

impl CryptoDelegate for NullCrypto {
    fn init(&mut self, _l0: &mut [u8]) -> u32 {
        log::debug!("crypto: init ignored, no accelerator");
        status::GENERIC
    }

    fn update(&mut self, _l0: &mut [u8]) -> u32 {
        status::GENERIC
    }

    fn finalize(&mut self, _l0: &mut [u8]) -> u32 {
        status::GENERIC
    }

    fn terminate(&mut self, _l0: &mut [u8]) -> u32 {
        status::SUCCESS
    }

    fn enable_clock(&mut self, _l0: &mut [u8]) -> u32 {
        status::SUCCESS
    }

    fn invalidate_session(&mut self) {}
}
