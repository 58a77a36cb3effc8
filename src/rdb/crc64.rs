//! CRC-64 with the Jones polynomial, the checksum trailing every snapshot.

use crc::{Crc, CRC_64_REDIS};

static JONES: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

pub fn checksum(data: &[u8]) -> u64 {
    JONES.checksum(data)
}
