//! Compact bitmap of which pieces a peer has announced.
//!
//! Bit `i` lives at byte `i/8`, masked by `1 << (7 - i%8)` — the same big-endian layout the
//! wire `bitfield` message payload uses, so a received payload can be stored as-is.
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield(Vec<u8>);

impl Bitfield {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Indexes past the end of the array are safely false rather than a panic: peers
    /// frequently send `have` messages for pieces our copy of the bitfield never sized for.
    pub fn has_piece(&self, index: usize) -> bool {
        let byte_index = index / 8;
        let Some(byte) = self.0.get(byte_index) else {
            return false;
        };
        let offset = index % 8;
        byte >> (7 - offset) & 1 != 0
    }

    /// Sets bit `index`, growing the backing vector if needed so `have` messages for
    /// pieces beyond the initial bitfield payload are still representable.
    pub fn set_piece(&mut self, index: usize) {
        let byte_index = index / 8;
        if byte_index >= self.0.len() {
            self.0.resize(byte_index + 1, 0);
        }
        let offset = index % 8;
        self.0[byte_index] |= 1 << (7 - offset);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Bitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "piece#")?;
        for i in 0..self.0.len() * 8 {
            if self.has_piece(i) {
                write!(f, " {i}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_piece_then_has_piece_is_true() {
        let mut field = Bitfield::new(vec![0u8; 2]);
        field.set_piece(3);
        assert!(field.has_piece(3));
    }

    #[test]
    fn unset_indexes_are_false() {
        let mut field = Bitfield::new(vec![0u8; 2]);
        field.set_piece(3);
        for i in 0..16 {
            if i != 3 {
                assert!(!field.has_piece(i), "index {i} should be unset");
            }
        }
    }

    #[test]
    fn out_of_range_index_is_false_not_a_panic() {
        let field = Bitfield::new(vec![0u8; 1]);
        assert!(!field.has_piece(1000));
    }

    #[test]
    fn bit_zero_is_the_high_bit_of_the_first_byte() {
        let mut field = Bitfield::new(vec![0u8; 1]);
        field.set_piece(0);
        assert_eq!(field.as_bytes(), &[0b1000_0000]);
    }

    #[test]
    fn set_piece_grows_backing_storage_on_demand() {
        let mut field = Bitfield::new(Vec::new());
        field.set_piece(20);
        assert!(field.has_piece(20));
    }
}
