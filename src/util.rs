// SPDX-License-Identifier: Apache-2.0

/// Check if the n-th bit is set.
///
/// Bits are 0-indexed, from the LSB.
pub(crate) fn is_bit_set<B>(value: B, index: usize) -> bool
where
    B: num_traits::PrimInt + num_traits::Unsigned,
{
    (value & (B::one() << index)) > B::zero()
}

/// Sign-extend the lowest `num_bits` bits of a word into an `i16`.
///
/// The bits above `num_bits` are ignored.
pub(crate) fn i16_from_bits(raw: u16, num_bits: u8) -> i16 {
    let shift_amount = 16 - num_bits;
    ((raw as i16) << shift_amount) >> shift_amount
}

/// Convert a big-endian byte buffer into 16-bit words.
///
/// Only as many words as fit in `destination` are converted.
pub(crate) fn be_words(bytes: &[u8], destination: &mut [u16]) {
    for (word, pair) in destination.iter_mut().zip(bytes.chunks_exact(2)) {
        *word = u16::from_be_bytes([pair[0], pair[1]]);
    }
}

#[cfg(test)]
mod test {
    #[test]
    fn is_bit_set() {
        for n in 0..16 {
            let value: u16 = 1 << n;
            assert!(
                super::is_bit_set(value, n),
                "is_bit_set was incorrect for bit {}",
                n
            );
        }
    }

    #[test]
    fn i16_from_bits() {
        assert_eq!(super::i16_from_bits(0x00FF, 8), -1);
        assert_eq!(super::i16_from_bits(0x03FF, 10), -1);
        assert_eq!(super::i16_from_bits(0x0007, 3), -1);
        assert_eq!(super::i16_from_bits(0x0003, 3), 3);
        // Upper bits get ignored
        assert_eq!(super::i16_from_bits(0xF0FF, 8), -1);
        assert_eq!(super::i16_from_bits(0xF3FF, 10), -1);
        // Positive values come through unchanged
        assert_eq!(super::i16_from_bits(0x001F, 6), 31);
        assert_eq!(super::i16_from_bits(0x0020, 6), -32);
    }

    #[test]
    fn be_words() {
        let bytes = [0xDE, 0xAD, 0xBE, 0xEF];
        let mut words = [0u16; 2];
        super::be_words(&bytes, &mut words);
        assert_eq!(words, [0xDEAD, 0xBEEF]);
    }
}
