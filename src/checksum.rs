//! 64-bit checksums over blocks and index records.
//!
//! A checksum is serialized as a fixed-size record so that the algorithm
//! can widen later without changing the framing:
//!
//! ```text
//! +-----------+-----------------+
//! | Algo (u8) | Sum (u64, LE)   |
//! +-----------+-----------------+
//! ```

use byteorder::{ByteOrder, LittleEndian};
use crc::Crc;

use crate::error::{corruption, errdecode, Result};

const CRC64: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_ECMA_182);

/// Serialized length of a checksum record.
pub const CHECKSUM_SIZE: usize = 9;

/// Identifies the algorithm a stored checksum was computed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Crc64Ecma = 0,
}

/// A checksum record: the sum plus the algorithm that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum {
    pub algo: Algorithm,
    pub sum: u64,
}

/// Computes the checksum of `data` with the default algorithm.
pub fn calculate(data: &[u8]) -> Checksum {
    Checksum {
        algo: Algorithm::Crc64Ecma,
        sum: CRC64.checksum(data),
    }
}

/// Verifies that `data` matches the serialized checksum record `expected`.
pub fn verify(data: &[u8], expected: &[u8]) -> Result<()> {
    let want = Checksum::decode(expected)?;
    let got = calculate(data);
    if got.sum != want.sum {
        return Err(corruption!(
            "checksum mismatch: computed {:#018x}, stored {:#018x}",
            got.sum,
            want.sum
        ));
    }
    Ok(())
}

impl Checksum {
    pub fn encode(&self) -> [u8; CHECKSUM_SIZE] {
        let mut buf = [0u8; CHECKSUM_SIZE];
        buf[0] = self.algo as u8;
        LittleEndian::write_u64(&mut buf[1..], self.sum);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != CHECKSUM_SIZE {
            return Err(errdecode!("checksum record has length {}", buf.len()));
        }
        let algo = match buf[0] {
            0 => Algorithm::Crc64Ecma,
            other => return Err(errdecode!("unknown checksum algorithm {other}")),
        };
        Ok(Self {
            algo,
            sum: LittleEndian::read_u64(&buf[1..]),
        })
    }
}
