//! HTTP client module for the invitation portal backend.
//!
//! This module provides the `ApiClient` dispatcher for the portal's JWT
//! bearer-token API: OTP challenge endpoints, the session liveness probe,
//! and guest invitation submission.

pub mod client;
pub mod error;

pub use client::{
    ApiClient, Identity, InvitationReceipt, InviteContact, OtpRequestOutcome, OtpVerifyOutcome,
};
pub use error::ApiError;
