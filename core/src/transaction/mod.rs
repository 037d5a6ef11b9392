use crate::crypto::{Hash, sha256d};
use bincode::{Decode, Encode};

/// Reference to a specific output of a previous transaction.
#[derive(Encode, Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self {
        Self { txid, vout }
    }
}

/// Input: the outpoint being spent plus its unlocking script
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct TransactionInput {
    pub previous_output: OutPoint,
    pub script: Vec<u8>,
    pub sequence: u32,
}

/// Output: amount + locking script
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct TransactionOutput {
    pub value: u64,
    pub script: Vec<u8>,
}

#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TransactionInput>, outputs: Vec<TransactionOutput>) -> Self {
        Self {
            version: 1,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Outpoints spent by this transaction, in input order.
    pub fn outpoints(&self) -> impl Iterator<Item = &OutPoint> {
        self.inputs.iter().map(|input| &input.previous_output)
    }

    /// Deterministic little-endian layout used for hashing. Independent of the
    /// wire encoding so that txids stay stable across codec changes.
    pub fn serialize_for_hash(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.inputs.len() * 48 + self.outputs.len() * 16);
        buf.extend_from_slice(&self.version.to_le_bytes());

        write_len(&mut buf, self.inputs.len());
        for input in &self.inputs {
            buf.extend_from_slice(input.previous_output.txid.as_bytes());
            buf.extend_from_slice(&input.previous_output.vout.to_le_bytes());
            write_len(&mut buf, input.script.len());
            buf.extend_from_slice(&input.script);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_len(&mut buf, self.outputs.len());
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_len(&mut buf, output.script.len());
            buf.extend_from_slice(&output.script);
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    pub fn txid(&self) -> Hash {
        sha256d(&self.serialize_for_hash())
    }
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u64).to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend(prev: Hash, vout: u32, value: u64) -> Transaction {
        Transaction::new(
            vec![TransactionInput {
                previous_output: OutPoint::new(prev, vout),
                script: vec![0x51],
                sequence: u32::MAX,
            }],
            vec![TransactionOutput {
                value,
                script: vec![0x76, 0xa9],
            }],
        )
    }

    #[test]
    fn txid_is_deterministic() {
        let a = spend(Hash([1; 32]), 0, 50);
        let b = spend(Hash([1; 32]), 0, 50);
        assert_eq!(a.txid(), b.txid());
    }

    #[test]
    fn txid_depends_on_outputs() {
        let a = spend(Hash([1; 32]), 0, 50);
        let b = spend(Hash([1; 32]), 0, 49);
        assert_ne!(a.txid(), b.txid());
    }

    #[test]
    fn outpoints_follow_input_order() {
        let mut tx = spend(Hash([1; 32]), 0, 50);
        tx.inputs.push(TransactionInput {
            previous_output: OutPoint::new(Hash([2; 32]), 3),
            script: vec![],
            sequence: 0,
        });
        let outpoints: Vec<_> = tx.outpoints().copied().collect();
        assert_eq!(
            outpoints,
            vec![
                OutPoint::new(Hash([1; 32]), 0),
                OutPoint::new(Hash([2; 32]), 3)
            ]
        );
    }
}
