//! OTP sign-in state machine.
//!
//! Drives a visitor from phone entry to an established session:
//!
//! ```text
//! PhoneEntry -> Requesting -> CodeEntry -> Verifying -> Authenticated
//!                   |             |  ^
//!                   v             v  | (resend / wrong code)
//!                 Denied        Denied
//! ```
//!
//! Validation failures and challenge rejections are handled entirely inside
//! the flow; callers observe them through `phase()` and `notice()` rather
//! than as errors. `Authenticated` and `Denied` are terminal; `restart()` is
//! the only way out of `Denied`.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::client::{ApiClient, OtpRequestOutcome, OtpVerifyOutcome};
use crate::api::error::ApiError;
use crate::phone::{fold_digits, mask_phone, normalize_phone};

// ============================================================================
// Constants
// ============================================================================

/// Seconds a visitor must wait before a code can be resent.
/// Matches the backend's resend cooldown window.
pub const RESEND_COOLDOWN_SECS: u64 = 60;

/// Minimum code length before a verification attempt is sent.
const MIN_CODE_LEN: usize = 4;

/// Maximum accepted code length; extra input is dropped.
const MAX_CODE_LEN: usize = 8;

// User-facing messages. Malformed and ineligible numbers share one text so
// the two cases are indistinguishable from the outside.
const MSG_GENERIC_DENIED: &str =
    "We can't process this number right now. Check the number and try again.";
const MSG_CODE_INCOMPLETE: &str = "Enter the full verification code.";
const MSG_CODE_INVALID: &str = "The verification code is invalid or has expired.";
const MSG_ATTEMPTS_EXHAUSTED: &str = "Too many attempts. Please request a new code.";
const MSG_THROTTLED: &str = "Too many requests. Please wait before trying again.";
const MSG_GENERIC_RETRY: &str = "Something went wrong. Please try again.";
const MSG_RESEND_FAILED: &str = "Could not resend the code. Try again.";

/// Where the flow currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpPhase {
    PhoneEntry,
    Requesting,
    CodeEntry,
    Verifying,
    Authenticated,
    Denied,
}

/// OTP sign-in flow. Owns the resend cooldown timer; dropping the flow
/// cancels it, so a navigation-away cannot tick a counter that is no longer
/// on screen.
pub struct OtpFlow {
    api: ApiClient,
    phase: OtpPhase,
    phone: Option<String>,
    request_id: Option<String>,
    code: String,
    notice: Option<String>,
    attempts_remaining: Option<u32>,
    cooldown_tx: watch::Sender<u64>,
    cooldown_rx: watch::Receiver<u64>,
    timer: Option<JoinHandle<()>>,
    resending: bool,
}

impl OtpFlow {
    pub fn new(api: ApiClient) -> Self {
        let (cooldown_tx, cooldown_rx) = watch::channel(0);
        Self {
            api,
            phase: OtpPhase::PhoneEntry,
            phone: None,
            request_id: None,
            code: String::new(),
            notice: None,
            attempts_remaining: None,
            cooldown_tx,
            cooldown_rx,
            timer: None,
            resending: false,
        }
    }

    // ===== Observers =====

    pub fn phase(&self) -> OtpPhase {
        self.phase
    }

    /// Current user-facing message, if any.
    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    /// Sanitized code entered so far.
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn attempts_remaining(&self) -> Option<u32> {
        self.attempts_remaining
    }

    /// Seconds until resend is permitted again.
    pub fn cooldown_remaining(&self) -> u64 {
        *self.cooldown_rx.borrow()
    }

    /// Watch handle for rendering the countdown.
    pub fn cooldown_watch(&self) -> watch::Receiver<u64> {
        self.cooldown_rx.clone()
    }

    /// The normalized phone under verification.
    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }

    /// The phone under verification, masked for display.
    pub fn masked_phone(&self) -> Option<String> {
        self.phone.as_deref().map(mask_phone)
    }

    // ===== Transitions =====

    /// Submit a raw phone number. Malformed input is rejected locally without
    /// any network call.
    pub async fn submit_phone(&mut self, raw: &str) {
        if self.phase != OtpPhase::PhoneEntry {
            return;
        }
        self.notice = None;

        let Some(phone) = normalize_phone(raw) else {
            self.notice = Some(MSG_GENERIC_DENIED.to_string());
            return;
        };

        self.phase = OtpPhase::Requesting;
        match self.api.request_otp(&phone).await {
            Ok(OtpRequestOutcome::Sent { request_id }) => {
                debug!(phone = %mask_phone(&phone), "OTP challenge issued");
                self.phone = Some(phone);
                self.request_id = Some(request_id);
                self.code.clear();
                self.attempts_remaining = None;
                self.phase = OtpPhase::CodeEntry;
                self.start_cooldown(RESEND_COOLDOWN_SECS);
            }
            Ok(OtpRequestOutcome::Denied) => {
                self.phase = OtpPhase::Denied;
                self.notice = Some(MSG_GENERIC_DENIED.to_string());
            }
            Ok(OtpRequestOutcome::Cooldown { remaining, message }) => {
                self.phase = OtpPhase::PhoneEntry;
                self.notice = Some(message.unwrap_or_else(|| {
                    format!("Please wait {remaining} seconds before requesting another code.")
                }));
            }
            Err(ApiError::Throttled { .. }) => {
                self.phase = OtpPhase::PhoneEntry;
                self.notice = Some(MSG_THROTTLED.to_string());
            }
            Err(err) => {
                warn!(error = %err, "Code request failed");
                self.phase = OtpPhase::PhoneEntry;
                self.notice = Some(MSG_GENERIC_RETRY.to_string());
            }
        }
    }

    /// Feed raw code input: non-ASCII numerals are folded, non-digits
    /// stripped, and the result truncated to the maximum code length.
    pub fn input_code(&mut self, raw: &str) {
        if self.phase != OtpPhase::CodeEntry {
            return;
        }
        self.code = fold_digits(raw)
            .chars()
            .filter(|c| c.is_ascii_digit())
            .take(MAX_CODE_LEN)
            .collect();
    }

    /// Whether the entered code is long enough to submit.
    pub fn can_submit(&self) -> bool {
        self.phase == OtpPhase::CodeEntry && self.code.len() >= MIN_CODE_LEN
    }

    /// Submit the entered code. Codes below the minimum length are rejected
    /// locally without a network call.
    pub async fn submit_code(&mut self) {
        if self.phase != OtpPhase::CodeEntry {
            return;
        }
        self.notice = None;

        if self.code.len() < MIN_CODE_LEN {
            self.notice = Some(MSG_CODE_INCOMPLETE.to_string());
            return;
        }
        let (Some(phone), Some(request_id)) = (self.phone.clone(), self.request_id.clone()) else {
            // Attempt budget already spent; only a fresh code helps.
            self.notice = Some(MSG_ATTEMPTS_EXHAUSTED.to_string());
            return;
        };

        self.phase = OtpPhase::Verifying;
        let code = std::mem::take(&mut self.code);

        match self.api.verify_otp(&phone, &request_id, &code).await {
            Ok(OtpVerifyOutcome::Verified) => {
                info!(phone = %mask_phone(&phone), "Visitor authenticated");
                self.cancel_cooldown();
                self.phase = OtpPhase::Authenticated;
            }
            Ok(OtpVerifyOutcome::Rejected {
                attempts_remaining, ..
            }) => {
                self.attempts_remaining = attempts_remaining;
                self.notice = Some(match attempts_remaining {
                    Some(n) => format!("Incorrect code. Attempts remaining: {n}"),
                    None => MSG_CODE_INVALID.to_string(),
                });
                self.phase = OtpPhase::CodeEntry;
            }
            Ok(OtpVerifyOutcome::Exhausted) => {
                // The request id is dead; drop it so further submissions
                // cannot reuse it.
                self.request_id = None;
                self.notice = Some(MSG_ATTEMPTS_EXHAUSTED.to_string());
                self.phase = OtpPhase::CodeEntry;
            }
            Err(err) => {
                warn!(error = %err, "Code verification failed");
                self.notice = Some(MSG_GENERIC_RETRY.to_string());
                self.phase = OtpPhase::CodeEntry;
            }
        }
    }

    /// Ask for a new code. A no-op while the cooldown is running or another
    /// resend is still in flight; a successful resend supersedes the previous
    /// challenge and restarts the cooldown.
    pub async fn resend(&mut self) {
        if self.phase != OtpPhase::CodeEntry {
            return;
        }
        if self.cooldown_remaining() > 0 || self.resending {
            return;
        }
        let Some(phone) = self.phone.clone() else {
            return;
        };

        self.resending = true;
        self.notice = None;
        match self.api.request_otp(&phone).await {
            Ok(OtpRequestOutcome::Sent { request_id }) => {
                debug!("OTP challenge reissued");
                self.request_id = Some(request_id);
                self.code.clear();
                self.attempts_remaining = None;
                self.start_cooldown(RESEND_COOLDOWN_SECS);
            }
            Ok(OtpRequestOutcome::Cooldown { remaining, message }) => {
                // Server-side cooldown is authoritative; adopt its clock.
                self.start_cooldown(remaining);
                self.notice = Some(
                    message.unwrap_or_else(|| format!("Please wait {remaining} seconds.")),
                );
            }
            Ok(OtpRequestOutcome::Denied) => {
                self.cancel_cooldown();
                self.phase = OtpPhase::Denied;
                self.notice = Some(MSG_GENERIC_DENIED.to_string());
            }
            Err(err) => {
                warn!(error = %err, "Resend failed");
                self.notice = Some(MSG_RESEND_FAILED.to_string());
            }
        }
        self.resending = false;
    }

    /// Return to phone entry with a clean slate. The only exit from `Denied`.
    pub fn restart(&mut self) {
        self.cancel_cooldown();
        self.phase = OtpPhase::PhoneEntry;
        self.phone = None;
        self.request_id = None;
        self.code.clear();
        self.notice = None;
        self.attempts_remaining = None;
        self.resending = false;
    }

    // ===== Cooldown timer =====

    /// Start (or restart) the resend countdown. The previous timer task is
    /// aborted first so exactly one task ever decrements the counter.
    fn start_cooldown(&mut self, secs: u64) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let _ = self.cooldown_tx.send(secs);
        if secs == 0 {
            return;
        }
        let tx = self.cooldown_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            let mut remaining = secs;
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            // The first tick completes immediately
            ticker.tick().await;
            while remaining > 0 {
                ticker.tick().await;
                remaining -= 1;
                let _ = tx.send(remaining);
            }
        }));
    }

    fn cancel_cooldown(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let _ = self.cooldown_tx.send(0);
    }
}

impl Drop for OtpFlow {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
