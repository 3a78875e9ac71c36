//! QR rendering of share URLs.
//!
//! A phone camera pointed at the terminal opens the share URL directly.
//!
//! ```rust,ignore
//! use wisp_core::qr;
//!
//! println!("{}", qr::generate_ascii("https://wisp.local/123456")?);
//! ```

use qrcode::render::unicode;
use qrcode::{EcLevel, QrCode};

use crate::code::ShareCode;
use crate::error::{Error, Result};

/// Render `data` as a compact Unicode QR code.
///
/// Two modules share one character cell, so the code stays small enough
/// for an ordinary terminal.
///
/// # Errors
///
/// Returns an error if `data` does not fit in a QR code.
pub fn generate_ascii(data: &str) -> Result<String> {
    let qr_code = QrCode::with_error_correction_level(data, EcLevel::M)
        .map_err(|e| Error::Internal(format!("Failed to generate QR code: {e}")))?;

    Ok(qr_code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

/// Render the share URL of `code` under `origin`.
///
/// # Errors
///
/// Returns an error if the URL does not fit in a QR code.
pub fn share_qr(code: &ShareCode, origin: &str) -> Result<String> {
    generate_ascii(&code.share_url(origin))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ascii() {
        let rendered = generate_ascii("https://wisp.local/123456").expect("qr");
        assert!(rendered.lines().count() > 10);
        assert!(rendered.chars().any(|c| c == '▀' || c == '▄' || c == '█'));
    }

    #[test]
    fn test_share_qr_encodes_url() {
        let code = ShareCode::parse("654321").expect("code");
        let a = share_qr(&code, "https://wisp.local").expect("qr");
        let b = generate_ascii("https://wisp.local/654321").expect("qr");
        assert_eq!(a, b);
    }

    #[test]
    fn test_oversized_input_fails() {
        let huge = "x".repeat(8000);
        assert!(generate_ascii(&huge).is_err());
    }
}
