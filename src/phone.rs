//! Phone number normalization for Saudi mobile numbers.
//!
//! The backend whitelists numbers in canonical local form (`05xxxxxxxx`), so
//! every submission path must collapse the accepted input variants to that one
//! string before anything touches the network:
//!
//! - `05xxxxxxxx`  (already canonical)
//! - `5xxxxxxxx`   (missing trunk digit)
//! - `9665xxxxxxxx` / `+9665xxxxxxxx` (international forms)
//!
//! Normalization is pure and idempotent: feeding its own output back in
//! produces the same string.

/// Fold Arabic-Indic (U+0660..U+0669) and Eastern Arabic-Indic
/// (U+06F0..U+06F9) numeral glyphs to ASCII digits, leaving everything else
/// unchanged.
pub fn fold_digits(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\u{0660}'..='\u{0669}' => {
                char::from(b'0' + (c as u32 - 0x0660) as u8)
            }
            '\u{06F0}'..='\u{06F9}' => {
                char::from(b'0' + (c as u32 - 0x06F0) as u8)
            }
            _ => c,
        })
        .collect()
}

/// Normalize a raw phone number to `05xxxxxxxx` form.
/// Returns `None` if the input cannot be normalized to a Saudi mobile number.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let folded = fold_digits(raw.trim());

    // Strip whitespace and common separators
    let mut phone: String = folded
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')'))
        .collect();

    if let Some(rest) = phone.strip_prefix('+') {
        phone = rest.to_string();
    }

    if let Some(rest) = phone.strip_prefix("966") {
        phone = format!("0{rest}");
    }

    // Bare local form without the trunk digit: 5xxxxxxxx / 5xxxxxxxxx
    if phone.starts_with('5') && matches!(phone.len(), 9 | 10) && all_digits(&phone) {
        phone = format!("0{phone}");
    }

    // Final form: 05 followed by 8 or 9 digits
    if phone.starts_with("05") && matches!(phone.len(), 10 | 11) && all_digits(&phone) {
        Some(phone)
    } else {
        None
    }
}

/// Mask a normalized phone for display: `0512345678` becomes `051****678`.
/// Inputs that are too short (or not plain ASCII) are returned unchanged.
pub fn mask_phone(phone: &str) -> String {
    if phone.len() >= 10 && phone.is_ascii() {
        format!("{}****{}", &phone[..3], &phone[7..])
    } else {
        phone.to_string()
    }
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}
