//! CRC-32 of record payloads
//!
//! Stores are configured with a reversed polynomial (IEEE by default). The
//! checksum itself comes from the `crc` crate; polynomials without a catalog
//! entry get an algorithm built once per process.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crc::{Algorithm, Crc, CRC_32_ISCSI, CRC_32_ISO_HDLC};
use parking_lot::Mutex;

/// Reversed IEEE polynomial
pub const IEEE: u32 = 0xEDB8_8320;

/// Reversed Castagnoli polynomial
pub const CASTAGNOLI: u32 = 0x82F6_3B78;

/// Checksum for one polynomial
#[derive(Clone)]
pub struct CrcTable {
    polynomial: u32,
    crc: Arc<Crc<u32>>,
}

impl CrcTable {
    pub fn new(polynomial: u32) -> Self {
        Self {
            polynomial,
            crc: Arc::new(Crc::<u32>::new(algorithm_for(polynomial))),
        }
    }

    pub fn checksum(&self, data: &[u8]) -> u32 {
        self.crc.checksum(data)
    }
}

/// Reflected CRC-32 algorithm for a reversed polynomial.
fn algorithm_for(polynomial: u32) -> &'static Algorithm<u32> {
    match polynomial {
        IEEE => &CRC_32_ISO_HDLC,
        CASTAGNOLI => &CRC_32_ISCSI,
        _ => {
            static CUSTOM: OnceLock<Mutex<HashMap<u32, &'static Algorithm<u32>>>> = OnceLock::new();
            let mut custom = CUSTOM.get_or_init(|| Mutex::new(HashMap::new())).lock();
            custom.entry(polynomial).or_insert_with(|| {
                Box::leak(Box::new(Algorithm {
                    width: 32,
                    poly: polynomial.reverse_bits(),
                    init: 0xFFFF_FFFF,
                    refin: true,
                    refout: true,
                    xorout: 0xFFFF_FFFF,
                    check: 0,
                    residue: 0,
                }))
            })
        }
    }
}

impl Default for CrcTable {
    fn default() -> Self {
        Self::new(IEEE)
    }
}

impl std::fmt::Debug for CrcTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CrcTable({:#010x})", self.polynomial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ieee_check_value() {
        assert_eq!(CrcTable::default().checksum(b"123456789"), 0xCBF4_3926);
        assert_eq!(CrcTable::default().checksum(b""), 0);
    }

    #[test]
    fn test_castagnoli_check_value() {
        assert_eq!(CrcTable::new(CASTAGNOLI).checksum(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn test_custom_polynomial() {
        // Reversed Koopman polynomial, not in the catalog shortcuts above.
        let koopman = CrcTable::new(0xEB31_D82E);
        assert_eq!(koopman.checksum(b"123456789"), 0x2D3D_D0AE);
        // Built once, reused afterwards.
        assert!(std::ptr::eq(algorithm_for(0xEB31_D82E), algorithm_for(0xEB31_D82E)));
        assert_ne!(koopman.checksum(b"abc"), CrcTable::default().checksum(b"abc"));
    }
}
