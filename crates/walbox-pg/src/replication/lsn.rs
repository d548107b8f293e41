//! WAL positions and their textual `X/Y` form.

use std::fmt;

use crate::error::{PgError, PgResult};

/// Parse a textual LSN such as `0/16B3748`. Each half is 32-bit hex.
pub fn parse_lsn(text: &str) -> PgResult<u64> {
    let invalid = || PgError::InvalidLsn(text.to_string());

    let (hi, lo) = text.trim().split_once('/').ok_or_else(invalid)?;
    let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
    let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;

    Ok((u64::from(hi) << 32) | u64::from(lo))
}

/// Render an LSN the way the server prints it.
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn as u32)
}

/// Position consumed so far in one replication session. Never moves backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct WalPosition(u64);

impl WalPosition {
    pub fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Move forward to `lsn` if it is ahead. Returns whether the position changed.
    pub fn advance(&mut self, lsn: u64) -> bool {
        if lsn > self.0 {
            self.0 = lsn;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for WalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_lsn(self.0))
    }
}
