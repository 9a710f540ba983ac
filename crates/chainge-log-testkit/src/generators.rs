//! Proptest generators for property-based testing.

use proptest::prelude::*;

use chainge_log::core::Keypair;
use chainge_log::{Chain, Raw, Result};

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate one block of at most `max_len` bytes.
pub fn block(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Generate up to `max_count` blocks of at most `max_len` bytes each.
pub fn blocks(max_count: usize, max_len: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(block(max_len), 0..=max_count)
}

/// A local mutation of a writer.
#[derive(Debug, Clone)]
pub enum ChainOp {
    Append(Vec<Vec<u8>>),
    /// Truncate to this share (in percent) of the current length.
    Truncate(u8),
}

impl Arbitrary for ChainOp {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![
            3 => blocks(8, 64).prop_map(ChainOp::Append),
            1 => (0u8..=100).prop_map(ChainOp::Truncate),
        ]
        .boxed()
    }
}

/// Apply `ops` to `chain`, mirroring them on a plain list of blocks.
///
/// Each truncate moves to the next fork. Returns the expected blocks.
pub async fn apply_ops(chain: &Chain<Raw>, ops: &[ChainOp]) -> Result<Vec<Vec<u8>>> {
    let mut expected: Vec<Vec<u8>> = Vec::new();

    for op in ops {
        match op {
            ChainOp::Append(values) => {
                chain.append(values).await?;
                expected.extend(values.iter().cloned());
            }
            ChainOp::Truncate(percent) => {
                let info = chain.info().await?;
                let length = info.length * u64::from(*percent) / 100;
                chain.truncate(length, info.fork + 1).await?;
                expected.truncate(length as usize);
            }
        }
    }
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn blocks_respect_bounds(values in blocks(4, 16)) {
            prop_assert!(values.len() <= 4);
            prop_assert!(values.iter().all(|b| b.len() <= 16));
        }

        #[test]
        fn truncate_share_is_a_percentage(op in any::<ChainOp>()) {
            if let ChainOp::Truncate(percent) = op {
                prop_assert!(percent <= 100);
            }
        }
    }
}
