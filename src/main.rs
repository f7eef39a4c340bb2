//! invitegate CLI - sign in to the invitation portal from the terminal.
//!
//! Walks the OTP flow (phone entry, code entry, resend with cooldown) and
//! keeps the resulting session alive across runs. Subcommands cover the
//! small protected surface: `whoami`, `invite`, `logout`.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use invitegate::api::{ApiClient, InviteContact};
use invitegate::auth::{OtpFlow, OtpPhase, TokenStore};
use invitegate::config::Config;
use invitegate::guard::{GateDecision, RouteGuard};
use invitegate::phone::mask_phone;

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let mut config = Config::load()?;
    let store = Arc::new(TokenStore::open(Config::data_dir()?));
    let api = ApiClient::new(config.base_url.clone(), Arc::clone(&store))?;

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("logout") => {
            store.clear();
            println!("Signed out.");
            return Ok(());
        }
        Some("whoami") => {
            return whoami(&api).await;
        }
        Some("invite") => {
            require_session(&api).await?;
            return invite(&api).await;
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            eprintln!("Usage: invitegate [whoami | invite | logout]");
            std::process::exit(2);
        }
        None => {}
    }

    // Default: make sure a session exists, signing in if needed.
    let guard = RouteGuard::new(api.clone());
    if let GateDecision::Allow(identity) = guard.check().await {
        println!("Already signed in as {}.", mask_phone(&identity.phone));
        return Ok(());
    }

    info!("No live session, starting OTP sign-in");
    sign_in(&api, &mut config).await
}

async fn require_session(api: &ApiClient) -> Result<()> {
    let guard = RouteGuard::new(api.clone());
    match guard.check().await {
        GateDecision::Allow(_) => Ok(()),
        GateDecision::Deny => {
            anyhow::bail!("No live session. Run `invitegate` to sign in first.")
        }
    }
}

async fn whoami(api: &ApiClient) -> Result<()> {
    let guard = RouteGuard::new(api.clone());
    match guard.check().await {
        GateDecision::Allow(identity) => {
            println!("Signed in as {}.", mask_phone(&identity.phone));
        }
        GateDecision::Deny => println!("Not signed in."),
    }
    Ok(())
}

/// Drive the OTP state machine from the terminal until it reaches a terminal
/// phase.
async fn sign_in(api: &ApiClient, config: &mut Config) -> Result<()> {
    let mut flow = OtpFlow::new(api.clone());

    loop {
        match flow.phase() {
            OtpPhase::PhoneEntry => {
                if let Some(notice) = flow.notice() {
                    println!("{notice}");
                }
                let hint = config
                    .last_phone
                    .as_deref()
                    .map(|p| format!(" [{}]", mask_phone(p)))
                    .unwrap_or_default();
                let mut raw = prompt(&format!("Phone number{hint}: "))?;
                if raw.is_empty() {
                    if let Some(last) = &config.last_phone {
                        raw = last.clone();
                    } else {
                        continue;
                    }
                }
                flow.submit_phone(&raw).await;
            }
            OtpPhase::CodeEntry => {
                if let Some(notice) = flow.notice() {
                    println!("{notice}");
                }
                if let Some(masked) = flow.masked_phone() {
                    println!("A verification code was sent to {masked}.");
                }
                let entry = prompt("Code (or 'r' to resend, 'b' to change number): ")?;
                match entry.as_str() {
                    "r" => {
                        let remaining = flow.cooldown_remaining();
                        if remaining > 0 {
                            println!("Resend available in {remaining}s.");
                        }
                        flow.resend().await;
                    }
                    "b" => flow.restart(),
                    raw => {
                        flow.input_code(raw);
                        flow.submit_code().await;
                    }
                }
            }
            OtpPhase::Authenticated => {
                if let Some(masked) = flow.masked_phone() {
                    println!("Welcome! Signed in as {masked}.");
                }
                config.last_phone = flow.phone().map(str::to_string);
                config.save()?;
                return Ok(());
            }
            OtpPhase::Denied => {
                if let Some(notice) = flow.notice() {
                    println!("{notice}");
                }
                let again = prompt("Try a different number? [y/N]: ")?;
                if again.eq_ignore_ascii_case("y") {
                    flow.restart();
                } else {
                    return Ok(());
                }
            }
            // Transient phases resolve inside the calls above
            OtpPhase::Requesting | OtpPhase::Verifying => {}
        }
    }
}

/// Collect up to three guests and submit them.
async fn invite(api: &ApiClient) -> Result<()> {
    let mut contacts = Vec::new();
    for slot in 1..=3 {
        let name = prompt(&format!("Guest {slot} name (blank to finish): "))?;
        if name.is_empty() {
            break;
        }
        let phone = prompt(&format!("Guest {slot} phone: "))?;
        contacts.push(InviteContact { name, phone });
    }
    if contacts.is_empty() {
        println!("Nothing to submit.");
        return Ok(());
    }

    let receipt = api.submit_invitations(&contacts).await?;
    match receipt.message {
        Some(message) => println!("{message} ({} created)", receipt.created),
        None => println!("{} invitation(s) created.", receipt.created),
    }
    Ok(())
}
