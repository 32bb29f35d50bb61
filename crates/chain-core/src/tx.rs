// chain-core/src/tx.rs

use crate::{Amount, BlockNumber, ChainError, ChainResult};
use serde::{Deserialize, Serialize};
use wot_crypto::{Hash, Hashable, Pubkey, Signature};

/// Origin of a transaction input
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxSource {
    /// Universal dividend received by a member at a given block
    Dividend { pubkey: Pubkey, block: BlockNumber },
    /// Output of a previous transaction
    Output { tx_hash: Hash, index: u32 },
}

/// Transaction input consuming one source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxInput {
    pub source: TxSource,
    pub amount: Amount,
}

impl TxInput {
    pub fn to_inline(&self) -> String {
        match &self.source {
            TxSource::Dividend { pubkey, block } => {
                format!("D:{}:{}:{}", pubkey, block, self.amount)
            }
            TxSource::Output { tx_hash, index } => {
                format!("T:{}:{}:{}", tx_hash.to_hex(), index, self.amount)
            }
        }
    }

    pub fn from_inline(s: &str) -> ChainResult<Self> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 4 {
            return Err(ChainError::MalformedDocument(format!("tx input `{s}`")));
        }
        let bad = || ChainError::MalformedDocument(format!("tx input `{s}`"));
        let amount: Amount = fields[3].parse().map_err(|_| bad())?;
        let source = match fields[0] {
            "D" => TxSource::Dividend {
                pubkey: fields[1].parse()?,
                block: fields[2].parse().map_err(|_| bad())?,
            },
            "T" => TxSource::Output {
                tx_hash: Hash::from_hex(fields[1])?,
                index: fields[2].parse().map_err(|_| bad())?,
            },
            _ => return Err(bad()),
        };
        Ok(Self { source, amount })
    }
}

/// Transaction output crediting one public key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOutput {
    pub pubkey: Pubkey,
    pub amount: Amount,
}

impl TxOutput {
    pub fn to_inline(&self) -> String {
        format!("{}:{}", self.pubkey, self.amount)
    }

    pub fn from_inline(s: &str) -> ChainResult<Self> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 2 {
            return Err(ChainError::MalformedDocument(format!("tx output `{s}`")));
        }
        Ok(Self {
            pubkey: fields[0].parse()?,
            amount: fields[1]
                .parse()
                .map_err(|_| ChainError::MalformedDocument(format!("tx output `{s}`")))?,
        })
    }
}

/// Transaction document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub issuers: Vec<Pubkey>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub comment: String,
    /// One signature per issuer, in issuer order
    pub signatures: Vec<Signature>,
}

impl Transaction {
    /// The compact multi-line form embedded in a block
    pub fn to_compact(&self) -> String {
        let mut out = format!(
            "TX:{}:{}:{}\n",
            self.issuers.len(),
            self.inputs.len(),
            self.outputs.len()
        );
        for issuer in &self.issuers {
            out.push_str(&format!("{issuer}\n"));
        }
        for input in &self.inputs {
            out.push_str(&format!("{}\n", input.to_inline()));
        }
        for output in &self.outputs {
            out.push_str(&format!("{}\n", output.to_inline()));
        }
        out.push_str(&format!("Comment: {}\n", self.comment));
        for signature in &self.signatures {
            out.push_str(&format!("{signature}\n"));
        }
        out
    }

    /// The payload covered by each issuer signature
    pub fn signing_message(&self) -> String {
        let mut out = format!(
            "TX:{}:{}:{}\n",
            self.issuers.len(),
            self.inputs.len(),
            self.outputs.len()
        );
        for issuer in &self.issuers {
            out.push_str(&format!("{issuer}\n"));
        }
        for input in &self.inputs {
            out.push_str(&format!("{}\n", input.to_inline()));
        }
        for output in &self.outputs {
            out.push_str(&format!("{}\n", output.to_inline()));
        }
        out.push_str(&format!("Comment: {}\n", self.comment));
        out
    }

    /// Transaction identifier: digest of the compact form
    pub fn hash(&self) -> Hash {
        self.to_compact().hash()
    }

    pub fn total_inputs(&self) -> Amount {
        self.inputs.iter().map(|i| i.amount).sum()
    }

    pub fn total_outputs(&self) -> Amount {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Implicit fee: whatever the inputs carry beyond the outputs
    pub fn fee(&self) -> Amount {
        self.total_inputs().saturating_sub(self.total_outputs())
    }

    /// Structural checks independent of any chain context
    pub fn check_structure(&self) -> ChainResult<()> {
        if self.issuers.is_empty() {
            return Err(ChainError::MalformedDocument("transaction has no issuer".into()));
        }
        if self.signatures.len() != self.issuers.len() {
            return Err(ChainError::MalformedDocument(format!(
                "transaction has {} signatures for {} issuers",
                self.signatures.len(),
                self.issuers.len()
            )));
        }
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(ChainError::MalformedDocument(
                "transaction must have inputs and outputs".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for input in &self.inputs {
            if !seen.insert(&input.source) {
                return Err(ChainError::MalformedDocument(
                    "transaction consumes the same source twice".into(),
                ));
            }
        }
        if self.total_inputs() < self.total_outputs() {
            return Err(ChainError::MalformedDocument(format!(
                "transaction outputs {} exceed inputs {}",
                self.total_outputs(),
                self.total_inputs()
            )));
        }
        Ok(())
    }

    /// Verify every issuer signature over the signing message
    pub fn check_signatures(&self) -> ChainResult<()> {
        let message = self.signing_message();
        for (issuer, signature) in self.issuers.iter().zip(&self.signatures) {
            issuer.verify(message.as_bytes(), signature)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wot_crypto::KeyPair;

    fn sample_tx() -> (KeyPair, Transaction) {
        let kp = KeyPair::generate();
        let dest = KeyPair::generate();
        let mut tx = Transaction {
            issuers: vec![kp.pubkey()],
            inputs: vec![TxInput {
                source: TxSource::Dividend {
                    pubkey: kp.pubkey(),
                    block: 4,
                },
                amount: 100,
            }],
            outputs: vec![TxOutput {
                pubkey: dest.pubkey(),
                amount: 90,
            }],
            comment: "groceries".into(),
            signatures: vec![],
        };
        let sig = kp.sign(tx.signing_message().as_bytes());
        tx.signatures.push(sig);
        (kp, tx)
    }

    #[test]
    fn test_structure_and_signatures() {
        let (_, tx) = sample_tx();
        tx.check_structure().unwrap();
        tx.check_signatures().unwrap();
        assert_eq!(tx.fee(), 10);
    }

    #[test]
    fn test_overspend_rejected() {
        let (_, mut tx) = sample_tx();
        tx.outputs[0].amount = 200;
        assert!(tx.check_structure().is_err());
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let (_, mut tx) = sample_tx();
        tx.inputs.push(tx.inputs[0].clone());
        assert!(tx.check_structure().is_err());
    }

    #[test]
    fn test_input_inline_roundtrip() {
        let (_, tx) = sample_tx();
        for input in &tx.inputs {
            assert_eq!(TxInput::from_inline(&input.to_inline()).unwrap(), *input);
        }
    }
}
