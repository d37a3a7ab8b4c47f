//! Connection options (§6.3 of the design doc).

use std::time::Duration;

/// Byte encoding used for the ASCII command bodies.
///
/// The wire dialect is printable ASCII in practice; `Utf8` covers it and
/// is the only encoding the reference client ever used, but the knob is
/// kept so a caller talking to a panel with a Latin-1 label can opt in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Latin1,
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::Utf8
    }
}

impl Encoding {
    pub(crate) fn encode(&self, s: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => s.as_bytes().to_vec(),
            Encoding::Latin1 => s.chars().map(|c| c as u32 as u8).collect(),
        }
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(bytes).ok().map(|s| s.to_string()),
            Encoding::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

/// Tunables for [`crate::connect`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Byte encoding for command bodies. Default UTF-8.
    pub encoding: Encoding,
    /// Maximum number of in-flight requests (semaphore permits). Default 4.
    pub concurrency: usize,
    /// Pause after the TCP connect before sending `RID`, to let the panel settle. Default 1s.
    pub communication_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            encoding: Encoding::Utf8,
            concurrency: 4,
            communication_delay: Duration::from_secs(1),
        }
    }
}
