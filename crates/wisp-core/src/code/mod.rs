//! Share codes and endpoint identities.
//!
//! A sending session is identified by a 6-digit decimal share code. The code
//! is turned into an endpoint identity by prefixing the fixed namespace
//! [`ENDPOINT_PREFIX`](crate::ENDPOINT_PREFIX), and into a display URL by
//! appending it to an origin.
//!
//! ## Example
//!
//! ```rust,ignore
//! use wisp_core::code::{CodeGenerator, EndpointId, ShareCode};
//!
//! let code = CodeGenerator::new().generate();
//! let endpoint = EndpointId::for_code(&code);
//! let code = ShareCode::parse("482913")?;
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ENDPOINT_PREFIX;

/// Length of a share code
pub const CODE_LENGTH: usize = 6;

/// Lowest code handed out by the generator (codes never start with 0).
const CODE_MIN: u32 = 100_000;

/// One past the highest code.
const CODE_MAX: u32 = 1_000_000;

/// A validated 6-digit share code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShareCode {
    code: String,
}

impl ShareCode {
    /// Parse and validate a share code from a string.
    ///
    /// Whitespace and dashes are ignored, so `"482 913"` and `"482-913"` parse.
    ///
    /// # Errors
    ///
    /// Returns an error if the code is not exactly six decimal digits.
    pub fn parse(input: &str) -> Result<Self> {
        let normalized: String = input
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();

        if normalized.len() != CODE_LENGTH {
            return Err(Error::InvalidCodeFormat(format!(
                "code must be {CODE_LENGTH} digits, got {}",
                normalized.len()
            )));
        }

        if let Some(c) = normalized.chars().find(|c| !c.is_ascii_digit()) {
            return Err(Error::InvalidCodeFormat(format!(
                "invalid character '{c}' in code"
            )));
        }

        Ok(Self { code: normalized })
    }

    /// Returns the code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.code
    }

    /// Display URL for this code under `origin`.
    #[must_use]
    pub fn share_url(&self, origin: &str) -> String {
        format!("{}/{}", origin.trim_end_matches('/'), self.code)
    }
}

impl fmt::Display for ShareCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

impl TryFrom<String> for ShareCode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ShareCode> for String {
    fn from(code: ShareCode) -> Self {
        code.code
    }
}

/// Generator for share codes.
#[derive(Debug, Default)]
pub struct CodeGenerator;

impl CodeGenerator {
    /// Create a new code generator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Generate a new random share code.
    ///
    /// Collisions are detected by the transport at registration time, not here.
    #[must_use]
    pub fn generate(&self) -> ShareCode {
        use rand::Rng;

        let value = rand::thread_rng().gen_range(CODE_MIN..CODE_MAX);
        ShareCode {
            code: value.to_string(),
        }
    }

    /// Generate a code different from `previous`.
    #[must_use]
    pub fn generate_other(&self, previous: &ShareCode) -> ShareCode {
        loop {
            let code = self.generate();
            if &code != previous {
                return code;
            }
        }
    }
}

/// Opaque address one side publishes so the other can open channels to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Endpoint identity of the sending session holding `code`.
    #[must_use]
    pub fn for_code(code: &ShareCode) -> Self {
        Self(format!("{ENDPOINT_PREFIX}{code}"))
    }

    /// Throwaway identity for a receiving session.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self(format!("{ENDPOINT_PREFIX}rx-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Wrap an id received from the network or a checkpoint.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Share code embedded in this id, if it is a sender identity.
    #[must_use]
    pub fn code(&self) -> Option<ShareCode> {
        self.0
            .strip_prefix(ENDPOINT_PREFIX)
            .and_then(|rest| ShareCode::parse(rest).ok())
    }

    /// Short label for progress displays: the first four characters after
    /// the namespace prefix, followed by an ellipsis.
    #[must_use]
    pub fn short_label(&self) -> String {
        let rest = self.0.strip_prefix(ENDPOINT_PREFIX).unwrap_or(&self.0);
        let rest = rest.strip_prefix("rx-").unwrap_or(rest);
        let head: String = rest.chars().take(4).collect();
        format!("{head}...")
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
