//! Sierra Chart intraday (`.scid`) record layout and decoder.
//!
//! Format version 1, little-endian throughout:
//!
//! ```text
//! header (56 bytes)
//!   0  magic            [u8; 4]  "SCID"
//!   4  header_size      u32      56
//!   8  record_size      u32      40
//!  12  version          u16      1
//!  14  unused           u16
//!  16  utc_start_index  u32
//!  20  reserved         [u8; 36]
//!
//! record (40 bytes)
//!   0  datetime         i64      microseconds since 1899-12-30T00:00:00Z
//!   8  open             f32
//!  12  high             f32
//!  16  low              f32
//!  20  close            f32
//!  24  num_trades       u32
//!  28  total_volume     u32
//!  32  bid_volume       u32
//!  36  ask_volume       u32
//! ```
//!
//! Decoding is pure: the tailer hands over bytes together with the absolute file
//! offset they start at, and the decoder reports how many of them form complete
//! records. A trailing partial record is left for the next poll.

use crate::error::FormatError;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;
use tracing::warn;

pub const FORMAT_VERSION: u16 = 1;
pub const MAGIC: [u8; 4] = *b"SCID";
pub const HEADER_SIZE: usize = 56;
pub const RECORD_SIZE: usize = 40;

/// Microseconds between the SCDateTime epoch (1899-12-30) and the Unix epoch.
pub const SC_EPOCH_OFFSET_US: i64 = 25_569 * 86_400 * 1_000_000;

/// One trade-aggregation sample as written to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct TickRecord {
    /// Unix-epoch microseconds.
    pub timestamp_us: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u32,
    pub number_of_trades: u32,
    pub bid_volume: u32,
    pub ask_volume: u32,
    pub symbol: String,
    pub symbol_period: String,
}

impl TickRecord {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.timestamp_us)
    }

    /// `high >= max(open, close) >= min(open, close) >= low`.
    ///
    /// Tick-level files store bid/ask in high/low and leave open at zero, so this is
    /// reported, never enforced.
    pub fn price_bounds_consistent(&self) -> bool {
        let upper = self.open.max(self.close);
        let lower = self.open.min(self.close);
        self.high >= upper && lower >= self.low
    }

    /// `(timestamp, symbol, symbol_period)`, unique in the sink.
    pub fn dedup_key(&self) -> (i64, &str, &str) {
        (self.timestamp_us, &self.symbol, &self.symbol_period)
    }
}

/// Root symbol and contract period a source file belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContractId {
    pub symbol: String,
    pub symbol_period: String,
}

impl ContractId {
    pub fn new(symbol: impl Into<String>, symbol_period: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            symbol_period: symbol_period.into(),
        }
    }

    /// Derive the contract from a file name such as `ESU5.CME.scid` (`ES`, `U5`).
    ///
    /// Names that don't follow the `<ROOT><MONTH><YEAR>.<EXCHANGE>` convention fall
    /// back to splitting the stem on `.`. Returns `None` when no symbol can be found.
    pub fn from_path(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        if let Some(contract) = parse_contract_stem(stem) {
            return Some(contract);
        }

        warn!(
            path = %path.display(),
            "file name does not match <ROOT><PERIOD>.<EXCHANGE>; splitting on '.'"
        );
        let mut parts = stem.split('.');
        let symbol = parts.next().unwrap_or_default().trim();
        let period = parts.next().unwrap_or_default().trim();
        if symbol.is_empty() {
            return None;
        }
        Some(Self::new(symbol, period))
    }
}

lazy_static! {
    /// `<ROOT><MONTH><YEAR>.<EXCHANGE>`, e.g. `ESU5.CME`.
    static ref CONTRACT_STEM: Regex = Regex::new(r"^([A-Z]{2,3})([A-Z]\d)\.([A-Z]+)$").unwrap();
}

fn parse_contract_stem(stem: &str) -> Option<ContractId> {
    let caps = CONTRACT_STEM.captures(stem)?;
    Some(ContractId::new(&caps[1], &caps[2]))
}

/// Parsed file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub header_size: u32,
    pub record_size: u32,
    pub version: u16,
    pub utc_start_index: u32,
}

impl FileHeader {
    /// Parse and validate the header. `Ok(None)` means fewer than `HEADER_SIZE`
    /// bytes are available yet.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, FormatError> {
        if buf.len() < HEADER_SIZE {
            if buf.len() >= MAGIC.len() && buf[..4] != MAGIC {
                return Err(FormatError::BadMagic {
                    found: read_array(buf, 0),
                });
            }
            return Ok(None);
        }

        let magic: [u8; 4] = read_array(buf, 0);
        if magic != MAGIC {
            return Err(FormatError::BadMagic { found: magic });
        }
        let header_size = u32::from_le_bytes(read_array(buf, 4));
        if header_size as usize != HEADER_SIZE {
            return Err(FormatError::HeaderSize(header_size));
        }
        let record_size = u32::from_le_bytes(read_array(buf, 8));
        if record_size as usize != RECORD_SIZE {
            return Err(FormatError::RecordSize(record_size));
        }

        Ok(Some(Self {
            header_size,
            record_size,
            version: u16::from_le_bytes(read_array(buf, 12)),
            utc_start_index: u32::from_le_bytes(read_array(buf, 16)),
        }))
    }
}

/// Result of decoding one buffer.
#[derive(Debug, Default)]
pub struct Decoded {
    pub records: Vec<TickRecord>,
    /// Bytes of the input that were turned into records (header included).
    pub consumed: usize,
    /// Trailing bytes that do not yet form a complete record.
    pub leftover: usize,
}

/// Stateless decoder bound to the contract its source file belongs to.
#[derive(Debug, Clone)]
pub struct RecordDecoder {
    contract: ContractId,
}

impl RecordDecoder {
    pub fn new(contract: ContractId) -> Self {
        Self { contract }
    }

    pub fn contract(&self) -> &ContractId {
        &self.contract
    }

    /// Decode `buf`, which starts at absolute file offset `offset`.
    ///
    /// At offset zero the header is validated and skipped. Any other offset must sit
    /// on a record boundary.
    pub fn decode(&self, buf: &[u8], offset: u64) -> Result<Decoded, FormatError> {
        let mut cursor = 0usize;
        if offset == 0 {
            match FileHeader::parse(buf)? {
                Some(_) => cursor = HEADER_SIZE,
                None => {
                    return Ok(Decoded {
                        records: Vec::new(),
                        consumed: 0,
                        leftover: buf.len(),
                    })
                }
            }
        } else if !is_record_boundary(offset) {
            return Err(FormatError::Misaligned(offset));
        }

        let body = &buf[cursor..];
        let complete = body.len() / RECORD_SIZE;
        let records = body
            .chunks_exact(RECORD_SIZE)
            .map(|raw| self.decode_record(raw))
            .collect::<Vec<_>>();
        debug_assert_eq!(records.len(), complete);

        let consumed = cursor + complete * RECORD_SIZE;
        Ok(Decoded {
            records,
            consumed,
            leftover: buf.len() - consumed,
        })
    }

    fn decode_record(&self, raw: &[u8]) -> TickRecord {
        let sc_datetime = i64::from_le_bytes(read_array(raw, 0));
        TickRecord {
            timestamp_us: sc_datetime.saturating_sub(SC_EPOCH_OFFSET_US),
            open: f64::from(f32::from_le_bytes(read_array(raw, 8))),
            high: f64::from(f32::from_le_bytes(read_array(raw, 12))),
            low: f64::from(f32::from_le_bytes(read_array(raw, 16))),
            close: f64::from(f32::from_le_bytes(read_array(raw, 20))),
            number_of_trades: u32::from_le_bytes(read_array(raw, 24)),
            volume: u32::from_le_bytes(read_array(raw, 28)),
            bid_volume: u32::from_le_bytes(read_array(raw, 32)),
            ask_volume: u32::from_le_bytes(read_array(raw, 36)),
            symbol: self.contract.symbol.clone(),
            symbol_period: self.contract.symbol_period.clone(),
        }
    }
}

/// Whether `offset` is a valid resume position: start of file, or the start of a record.
pub fn is_record_boundary(offset: u64) -> bool {
    offset == 0
        || (offset >= HEADER_SIZE as u64 && (offset - HEADER_SIZE as u64) % RECORD_SIZE as u64 == 0)
}

fn read_array<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

/// Byte-level writers for building fixture files in tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn header() -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        buf.extend_from_slice(&(RECORD_SIZE as u32).to_le_bytes());
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.resize(HEADER_SIZE, 0);
        buf
    }

    /// Encode a record `seq` microseconds after 2024-01-02T00:00:00Z.
    pub fn record(seq: u32) -> Vec<u8> {
        let unix_us = 1_704_153_600_000_000i64 + i64::from(seq);
        let price = 4_800.0f32 + seq as f32;
        let mut buf = Vec::with_capacity(RECORD_SIZE);
        buf.extend_from_slice(&(unix_us + SC_EPOCH_OFFSET_US).to_le_bytes());
        buf.extend_from_slice(&price.to_le_bytes());
        buf.extend_from_slice(&(price + 0.5).to_le_bytes());
        buf.extend_from_slice(&(price - 0.25).to_le_bytes());
        buf.extend_from_slice(&(price + 0.25).to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&(seq + 1).to_le_bytes());
        buf.extend_from_slice(&(seq / 2).to_le_bytes());
        buf.extend_from_slice(&(seq - seq / 2 + 1).to_le_bytes());
        buf
    }

    pub fn file_with_records(count: u32) -> Vec<u8> {
        let mut buf = header();
        for seq in 0..count {
            buf.extend_from_slice(&record(seq));
        }
        buf
    }
}
