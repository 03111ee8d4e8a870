//! Deterministic readers and decoders for exercising the pipeline, plus
//! the single-threaded reference path the conformance tests compare
//! against.

use crate::{
    buffer::BufferTriple,
    media::{Media, MediaError},
    reader::{Reader, ReaderError},
};

/// Sums a byte block; the pipeline's transpose only permutes bytes, so
/// sums survive it.
pub fn byte_sum(data: &[u8]) -> u64 {
    data.iter().map(|&b| u64::from(b)).sum()
}

fn mix(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

/// A synthetic archive of `item_count` variable-length items, derived
/// entirely from the seed so that independent instances agree.
pub struct SyntheticReader {
    batch_size: usize,
    item_count: usize,
    max_datum_len: usize,
    emit_target_len: usize,
    seed: u64,
    cursor: usize,
}

impl SyntheticReader {
    pub fn new(
        batch_size: usize,
        item_count: usize,
        max_datum_len: usize,
        emit_target_len: usize,
        seed: u64,
    ) -> Self {
        assert!(max_datum_len > 0);
        Self { batch_size, item_count, max_datum_len, emit_target_len, seed, cursor: 0 }
    }

    /// The datum bytes of archive item `index`.
    pub fn datum(&self, index: usize) -> Vec<u8> {
        let mut state = mix(self.seed ^ (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let len = 1 + (state % self.max_datum_len as u64) as usize;

        (0..len)
            .map(|_| {
                state = mix(state);
                state as u8
            })
            .collect()
    }

    /// The target bytes of archive item `index`.
    pub fn target(&self, index: usize) -> Vec<u8> {
        let mut state = mix(self.seed.wrapping_add(0x5133) ^ (index as u64 + 1));

        (0..self.emit_target_len)
            .map(|_| {
                state = mix(state);
                state as u8
            })
            .collect()
    }
}

impl Reader for SyntheticReader {
    fn read(&mut self, bufs: &mut BufferTriple) -> Result<(), ReaderError> {
        for _ in 0..self.batch_size {
            let index = self.cursor % self.item_count;
            bufs.data.push_item(&self.datum(index));
            bufs.targets.push_item(&self.target(index));
            self.cursor += 1;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Serves a fixed list of `(datum, target)` items, cycling when the
/// list runs out.
pub struct VecReader {
    items: Vec<(Vec<u8>, Vec<u8>)>,
    batch_size: usize,
    cursor: usize,
}

impl VecReader {
    pub fn new(items: Vec<(Vec<u8>, Vec<u8>)>, batch_size: usize) -> Self {
        assert!(!items.is_empty());
        Self { items, batch_size, cursor: 0 }
    }
}

impl Reader for VecReader {
    fn read(&mut self, bufs: &mut BufferTriple) -> Result<(), ReaderError> {
        for _ in 0..self.batch_size {
            let (datum, target) = &self.items[self.cursor % self.items.len()];
            bufs.data.push_item(datum);
            bufs.targets.push_item(target);
            self.cursor += 1;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Copies encoded bytes straight into the fixed slot, zero-padding the
/// tail; metadata is the encoded length.
pub struct IdentityMedia;

impl IdentityMedia {
    fn copy_padded(enc: &[u8], out: &mut [u8]) {
        let n = enc.len().min(out.len());
        out[..n].copy_from_slice(&enc[..n]);
        out[n..].fill(0);
    }
}

impl Media for IdentityMedia {
    fn transform(&mut self, enc: &[u8], datum: &mut [u8], meta: &mut i32) -> Result<(), MediaError> {
        Self::copy_padded(enc, datum);
        *meta = enc.len() as i32;
        Ok(())
    }

    fn transform_joint(
        &mut self,
        enc_datum: &[u8],
        enc_target: &[u8],
        datum: &mut [u8],
        target: &mut [u8],
    ) -> Result<(), MediaError> {
        Self::copy_padded(enc_datum, datum);
        Self::copy_padded(enc_target, target);
        Ok(())
    }
}

/// The single-threaded reference path: decode every item of every batch
/// serially through the same media and accumulate the byte sums the way
/// the pipeline's split mode stores them (targets clipped to the fixed
/// slot, padding contributing zero).
pub fn serial_sum(
    reader: &mut dyn Reader,
    media: &mut dyn Media,
    epochs: usize,
    batches: usize,
    batch_size: usize,
    datum_len: usize,
    target_len: usize,
) -> u64 {
    let mut scratch = vec![0u8; datum_len];
    let mut bufs = BufferTriple::new(0, 0, None, false).unwrap();
    let mut sum = 0u64;

    for _ in 0..epochs {
        reader.reset();
        for _ in 0..batches {
            bufs.reset();
            reader.read(&mut bufs).unwrap();
            for i in 0..batch_size {
                let enc = bufs.data.item(i).expect("reference batch short of items");
                let mut meta = 0;
                media.transform(enc, &mut scratch, &mut meta).unwrap();
                sum += byte_sum(&scratch);

                let target = bufs.targets.item(i).expect("reference batch short of targets");
                let stored = target.len().min(target_len);
                sum += byte_sum(&target[..stored]);
            }
        }
    }

    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_items_are_reproducible() {
        let a = SyntheticReader::new(4, 100, 16, 4, 7);
        let b = SyntheticReader::new(4, 100, 16, 4, 7);

        for i in 0..100 {
            assert_eq!(a.datum(i), b.datum(i));
            assert_eq!(a.target(i), b.target(i));
        }
    }

    #[test]
    fn synthetic_lengths_vary() {
        let reader = SyntheticReader::new(4, 64, 16, 4, 3);
        let lens: Vec<usize> = (0..64).map(|i| reader.datum(i).len()).collect();

        assert!(lens.iter().any(|&len| len != lens[0]));
        assert!(lens.iter().all(|&len| (1..=16).contains(&len)));
    }

    #[test]
    fn identity_media_pads_and_reports_length() {
        let mut media = IdentityMedia;
        let mut out = [0xFFu8; 4];
        let mut meta = 0;

        media.transform(&[1, 2], &mut out, &mut meta).unwrap();

        assert_eq!(out, [1, 2, 0, 0]);
        assert_eq!(meta, 2);
    }
}
