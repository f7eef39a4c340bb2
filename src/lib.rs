//! invitegate - client core for a phone-gated invitation portal.
//!
//! A visitor proves control of a whitelisted phone number with a one-time
//! SMS code, receives a short-lived JWT session, and can then reach the
//! protected booking surface. This crate owns the pieces with real
//! coordination hazards:
//!
//! - [`auth::TokenStore`]: durable access/refresh credential storage
//! - [`api::ApiClient`]: request dispatch with bearer decoration and a
//!   single transparent replay after token renewal
//! - [`auth::RenewalCoordinator`]: at-most-one refresh in flight, with
//!   concurrent failures queued behind it and failed closed on any
//!   unrecoverable auth error
//! - [`auth::OtpFlow`]: the phone-entry / code-entry state machine with
//!   resend cooldown and attempt exhaustion handling
//! - [`guard::RouteGuard`]: session liveness gate for protected surfaces

pub mod api;
pub mod auth;
pub mod config;
pub mod guard;
pub mod phone;
