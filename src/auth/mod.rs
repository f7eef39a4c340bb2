//! Session lifecycle management.
//!
//! This module provides:
//! - `TokenStore`: durable storage for the access/refresh credential pair
//! - `RenewalCoordinator`: single-flight token refresh with queued replays
//! - `OtpFlow`: the phone-verification state machine that establishes a session
//!
//! Credentials are created by OTP verification, renewed by the coordinator,
//! and cleared on logout or unrecoverable auth failure.

pub mod otp;
pub mod renewal;
pub mod store;

pub use otp::{OtpFlow, OtpPhase, RESEND_COOLDOWN_SECS};
pub use renewal::{RenewalCoordinator, SessionEvent, REFRESH_PATH};
pub use store::TokenStore;
