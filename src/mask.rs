//! Payload masking and masking-key generation.
//!
//! Frames sent by a client MUST be masked with a fresh 32-bit key; frames sent
//! by a server MUST NOT be masked. The XOR transform is its own inverse, so
//! [`apply_mask`] serves both directions. The key source is pluggable through
//! [`MaskKeyGenerator`] so deployments (and tests) can control key selection.

// the mask application routines have been copied from tungstenite

/// Mask/unmask a frame payload in place.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_fast32(buf, mask);
}

/// A safe unoptimized mask application.
#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Faster version of `apply_mask()` which operates on 4-byte blocks.
#[inline]
pub fn apply_mask_fast32(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);

    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u32>() };
    apply_mask_fallback(prefix, mask);
    let head = prefix.len() & 3;
    let mask_u32 = if head > 0 {
        if cfg!(target_endian = "big") {
            mask_u32.rotate_left(8 * head as u32)
        } else {
            mask_u32.rotate_right(8 * head as u32)
        }
    } else {
        mask_u32
    };
    for word in words.iter_mut() {
        *word ^= mask_u32;
    }
    apply_mask_fallback(suffix, mask_u32.to_ne_bytes());
}

/// Source of 32-bit masking keys for client-to-server frames.
///
/// The session's write path calls [`MaskKeyGenerator::next_key`] once per
/// outgoing frame when operating in the client role. Implementations must be
/// cheap and thread-safe; cryptographic strength is not required by RFC 6455,
/// but keys should be unpredictable to proxies.
///
/// The negotiated extension pipeline observes the key actually used for each
/// frame, which lets an extension verify or audit key selection.
pub trait MaskKeyGenerator: Send + Sync {
    /// Returns the masking key for the next outgoing frame.
    fn next_key(&self) -> [u8; 4];
}

/// Default generator backed by [`rand::random`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomMaskKeyGenerator;

impl MaskKeyGenerator for RandomMaskKeyGenerator {
    fn next_key(&self) -> [u8; 4] {
        rand::random()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_mask() {
        let mask = [0x6d, 0xb6, 0xb2, 0x80];
        let unmasked = [
            0xf3, 0x00, 0x01, 0x02, 0x03, 0x80, 0x81, 0x82, 0xff, 0xfe, 0x00, 0x17, 0x74, 0xf9,
            0x12, 0x03,
        ];

        for data_len in 0..=unmasked.len() {
            let unmasked = &unmasked[0..data_len];
            // Check masking with different alignment.
            for off in 0..=3 {
                if unmasked.len() < off {
                    continue;
                }
                let mut masked = unmasked.to_vec();
                apply_mask_fallback(&mut masked[off..], mask);

                let mut masked_fast = unmasked.to_vec();
                apply_mask_fast32(&mut masked_fast[off..], mask);

                assert_eq!(masked, masked_fast);
            }
        }
    }

    #[test]
    fn test_mask_unmask_identity() {
        let mask = [0xAA, 0xBB, 0xCC, 0xDD];
        let original = b"Hello, World! This is a test message with various lengths.";

        let mut data = original.to_vec();
        apply_mask(&mut data, mask);
        assert_ne!(&data[..], &original[..]);

        apply_mask(&mut data, mask);
        assert_eq!(&data[..], &original[..]);
    }

    #[test]
    fn test_mask_large_buffer() {
        // exercise the word-aligned path
        let mask = [0x01, 0x02, 0x03, 0x04];
        let size = 10000;
        let mut data: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        let original = data.clone();

        apply_mask(&mut data, mask);

        for (i, &byte) in data.iter().enumerate() {
            let expected = original[i] ^ mask[i % 4];
            assert_eq!(byte, expected, "Mismatch at index {}", i);
        }
    }

    #[test]
    fn test_random_generator_varies() {
        let generator = RandomMaskKeyGenerator;
        let keys: Vec<[u8; 4]> = (0..16).map(|_| generator.next_key()).collect();
        // 16 identical random keys would mean the generator is broken
        assert!(keys.windows(2).any(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn test_custom_generator() {
        struct Fixed;
        impl MaskKeyGenerator for Fixed {
            fn next_key(&self) -> [u8; 4] {
                [7, 7, 7, 7]
            }
        }

        let generator: Box<dyn MaskKeyGenerator> = Box::new(Fixed);
        assert_eq!(generator.next_key(), [7, 7, 7, 7]);
    }
}
