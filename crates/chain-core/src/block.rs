// chain-core/src/block.rs

use crate::{
    identity::{Certification, InlineIdentity, Membership, MembershipKind},
    params::ProtocolParameters,
    tx::Transaction,
    types::*,
    ChainError, ChainResult,
};
use serde::{Deserialize, Serialize};
use wot_crypto::{Hash, Hashable, Pubkey, Signature, Signer};

/// Current block document version
pub const BLOCK_VERSION: u32 = 1;

/// A signed block of the chain
///
/// The raw wire form is line-oriented; the issuer signature covers the
/// unsigned raw (nonce included), and the block hash covers the signed raw,
/// which is what proof-of-work grinds on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub version: u32,
    pub currency: String,
    pub number: BlockNumber,
    pub pow_min: u32,
    pub time: Timestamp,
    pub median_time: Timestamp,
    pub dividend: Option<Amount>,
    pub ud_time: Option<Timestamp>,
    pub issuer: Pubkey,
    /// Absent at height 0
    pub previous_hash: Option<Hash>,
    /// Absent at height 0
    pub previous_issuer: Option<Pubkey>,
    /// Present at height 0 only
    pub parameters: Option<ProtocolParameters>,
    pub members_count: u64,
    pub monetary_mass: Amount,
    pub identities: Vec<InlineIdentity>,
    pub joiners: Vec<Membership>,
    pub actives: Vec<Membership>,
    pub leavers: Vec<Membership>,
    pub excluded: Vec<Pubkey>,
    pub certifications: Vec<Certification>,
    pub transactions: Vec<Transaction>,
    pub nonce: u64,
    pub signature: Signature,
}

impl Block {
    pub fn is_root(&self) -> bool {
        self.number == 0
    }

    /// The raw form covered by the issuer signature
    pub fn unsigned_raw(&self) -> String {
        let mut raw = String::with_capacity(512);
        raw.push_str(&format!("Version: {}\n", self.version));
        raw.push_str("Type: Block\n");
        raw.push_str(&format!("Currency: {}\n", self.currency));
        raw.push_str(&format!("Number: {}\n", self.number));
        raw.push_str(&format!("PoWMin: {}\n", self.pow_min));
        raw.push_str(&format!("Time: {}\n", self.time));
        raw.push_str(&format!("MedianTime: {}\n", self.median_time));
        if let Some(ud) = self.dividend {
            raw.push_str(&format!("UniversalDividend: {ud}\n"));
        }
        if let Some(ud_time) = self.ud_time {
            raw.push_str(&format!("UDTime: {ud_time}\n"));
        }
        raw.push_str(&format!("Issuer: {}\n", self.issuer));
        if let Some(previous_hash) = &self.previous_hash {
            raw.push_str(&format!("PreviousHash: {}\n", previous_hash.to_hex()));
        }
        if let Some(previous_issuer) = &self.previous_issuer {
            raw.push_str(&format!("PreviousIssuer: {previous_issuer}\n"));
        }
        if let Some(parameters) = &self.parameters {
            raw.push_str(&format!("Parameters: {}\n", parameters.to_line()));
        }
        raw.push_str(&format!("MembersCount: {}\n", self.members_count));
        raw.push_str(&format!("MonetaryMass: {}\n", self.monetary_mass));
        raw.push_str("Identities:\n");
        for identity in &self.identities {
            raw.push_str(&format!("{}\n", identity.to_inline()));
        }
        raw.push_str("Joiners:\n");
        for joiner in &self.joiners {
            raw.push_str(&format!("{}\n", joiner.to_inline()));
        }
        raw.push_str("Actives:\n");
        for active in &self.actives {
            raw.push_str(&format!("{}\n", active.to_inline()));
        }
        raw.push_str("Leavers:\n");
        for leaver in &self.leavers {
            raw.push_str(&format!("{}\n", leaver.to_inline()));
        }
        raw.push_str("Excluded:\n");
        for excluded in &self.excluded {
            raw.push_str(&format!("{excluded}\n"));
        }
        raw.push_str("Certifications:\n");
        for certification in &self.certifications {
            raw.push_str(&format!("{}\n", certification.to_inline()));
        }
        raw.push_str("Transactions:\n");
        for transaction in &self.transactions {
            raw.push_str(&transaction.to_compact());
        }
        raw.push_str(&format!("Nonce: {}\n", self.nonce));
        raw
    }

    /// The raw form covered by the block hash
    pub fn signed_raw(&self) -> String {
        format!("{}{}\n", self.unsigned_raw(), self.signature)
    }

    /// Block hash: digest of the signed raw form
    pub fn hash(&self) -> Hash {
        self.signed_raw().hash()
    }

    /// Sign the block in place with the given signer
    pub fn sign(&mut self, signer: &dyn Signer) {
        self.signature = signer.sign(self.unsigned_raw().as_bytes());
    }

    /// Verify the issuer signature over the unsigned raw
    pub fn verify_signature(&self) -> ChainResult<()> {
        self.issuer
            .verify(self.unsigned_raw().as_bytes(), &self.signature)?;
        Ok(())
    }

    /// Parse a block from its signed raw form
    pub fn parse_raw(raw: &str) -> ChainResult<Block> {
        Parser::new(raw).parse()
    }

    /// JSON view of the block, as served to API consumers
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

struct Parser<'a> {
    lines: Vec<&'a str>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(raw: &'a str) -> Self {
        Self {
            lines: raw.lines().collect(),
            pos: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> ChainError {
        ChainError::ParseError {
            line: self.pos + 1,
            reason: reason.into(),
        }
    }

    fn next_line(&mut self) -> ChainResult<&'a str> {
        let line = self
            .lines
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.error("unexpected end of document"))?;
        self.pos += 1;
        Ok(line)
    }

    fn peek(&self) -> Option<&'a str> {
        self.lines.get(self.pos).copied()
    }

    /// Consume `PREFIX: value`, failing when the prefix does not match
    fn field(&mut self, prefix: &str) -> ChainResult<&'a str> {
        let line = self.next_line()?;
        line.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix(": "))
            .ok_or_else(|| self.error(format!("expected `{prefix}:` field, got `{line}`")))
    }

    /// Consume `PREFIX: value` only when the prefix matches
    fn optional_field(&mut self, prefix: &str) -> Option<&'a str> {
        let value = self
            .peek()?
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix(": "))?;
        self.pos += 1;
        Some(value)
    }

    fn parsed_field<T: std::str::FromStr>(&mut self, prefix: &str) -> ChainResult<T> {
        let value = self.field(prefix)?;
        value
            .parse()
            .map_err(|_| self.error(format!("bad `{prefix}` value `{value}`")))
    }

    fn section_header(&mut self, name: &str) -> ChainResult<()> {
        let line = self.next_line()?;
        if line != format!("{name}:") {
            return Err(self.error(format!("expected `{name}:` section, got `{line}`")));
        }
        Ok(())
    }

    /// Entries of a section: every line until the next `Section:`-looking header
    fn section_entries<T>(
        &mut self,
        parse: impl Fn(&str) -> ChainResult<T>,
    ) -> ChainResult<Vec<T>> {
        let mut entries = Vec::new();
        while let Some(line) = self.peek() {
            if line.ends_with(':') && !line.contains(' ') {
                break;
            }
            self.pos += 1;
            entries.push(parse(line)?);
        }
        Ok(entries)
    }

    fn parse(mut self) -> ChainResult<Block> {
        let version: u32 = self.parsed_field("Version")?;
        let kind = self.field("Type")?;
        if kind != "Block" {
            return Err(self.error(format!("not a block document: `{kind}`")));
        }
        let currency = self.field("Currency")?.to_string();
        let number: BlockNumber = self.parsed_field("Number")?;
        let pow_min: u32 = self.parsed_field("PoWMin")?;
        let time: Timestamp = self.parsed_field("Time")?;
        let median_time: Timestamp = self.parsed_field("MedianTime")?;
        let dividend = match self.optional_field("UniversalDividend") {
            Some(v) => Some(
                v.parse::<Amount>()
                    .map_err(|_| self.error(format!("bad dividend `{v}`")))?,
            ),
            None => None,
        };
        let ud_time = match self.optional_field("UDTime") {
            Some(v) => Some(
                v.parse::<Timestamp>()
                    .map_err(|_| self.error(format!("bad UDTime `{v}`")))?,
            ),
            None => None,
        };
        let issuer: Pubkey = self.parsed_field("Issuer")?;
        let previous_hash = match self.optional_field("PreviousHash") {
            Some(v) => Some(Hash::from_hex(v)?),
            None => None,
        };
        let previous_issuer = match self.optional_field("PreviousIssuer") {
            Some(v) => Some(v.parse::<Pubkey>()?),
            None => None,
        };
        let parameters = match self.optional_field("Parameters") {
            Some(v) => Some(ProtocolParameters::from_line(v)?),
            None => None,
        };
        let members_count: u64 = self.parsed_field("MembersCount")?;
        let monetary_mass: Amount = self.parsed_field("MonetaryMass")?;

        self.section_header("Identities")?;
        let identities = self.section_entries(InlineIdentity::from_inline)?;
        self.section_header("Joiners")?;
        let joiners =
            self.section_entries(|s| Membership::from_inline(s, MembershipKind::In))?;
        self.section_header("Actives")?;
        let actives =
            self.section_entries(|s| Membership::from_inline(s, MembershipKind::In))?;
        self.section_header("Leavers")?;
        let leavers =
            self.section_entries(|s| Membership::from_inline(s, MembershipKind::Out))?;
        self.section_header("Excluded")?;
        let excluded = self.section_entries(|s| {
            s.parse::<Pubkey>().map_err(ChainError::CryptoError)
        })?;
        self.section_header("Certifications")?;
        let certifications = self.section_entries(Certification::from_inline)?;
        self.section_header("Transactions")?;
        let transactions = self.transactions()?;

        let nonce: u64 = self.parsed_field("Nonce")?;
        let signature: Signature = self
            .next_line()?
            .parse()
            .map_err(|e| self.error(format!("bad block signature: {e}")))?;

        Ok(Block {
            version,
            currency,
            number,
            pow_min,
            time,
            median_time,
            dividend,
            ud_time,
            issuer,
            previous_hash,
            previous_issuer,
            parameters,
            members_count,
            monetary_mass,
            identities,
            joiners,
            actives,
            leavers,
            excluded,
            certifications,
            transactions,
            nonce,
            signature,
        })
    }

    fn transactions(&mut self) -> ChainResult<Vec<Transaction>> {
        let mut transactions = Vec::new();
        while let Some(line) = self.peek() {
            if !line.starts_with("TX:") {
                break;
            }
            self.pos += 1;
            let counts: Vec<&str> = line.split(':').collect();
            if counts.len() != 4 {
                return Err(self.error(format!("bad transaction header `{line}`")));
            }
            let bad = |what: &str| format!("bad transaction {what} count in `{line}`");
            let n_issuers: usize = counts[1].parse().map_err(|_| self.error(bad("issuer")))?;
            let n_inputs: usize = counts[2].parse().map_err(|_| self.error(bad("input")))?;
            let n_outputs: usize = counts[3].parse().map_err(|_| self.error(bad("output")))?;

            let mut issuers = Vec::with_capacity(n_issuers);
            for _ in 0..n_issuers {
                issuers.push(self.next_line()?.parse::<Pubkey>()?);
            }
            let mut inputs = Vec::with_capacity(n_inputs);
            for _ in 0..n_inputs {
                inputs.push(crate::tx::TxInput::from_inline(self.next_line()?)?);
            }
            let mut outputs = Vec::with_capacity(n_outputs);
            for _ in 0..n_outputs {
                outputs.push(crate::tx::TxOutput::from_inline(self.next_line()?)?);
            }
            let comment_line = self.next_line()?;
            let comment = comment_line
                .strip_prefix("Comment: ")
                .ok_or_else(|| self.error(format!("expected `Comment:`, got `{comment_line}`")))?
                .to_string();
            let mut signatures = Vec::with_capacity(n_issuers);
            for _ in 0..n_issuers {
                signatures.push(self.next_line()?.parse::<Signature>()?);
            }
            transactions.push(Transaction {
                issuers,
                inputs,
                outputs,
                comment,
                signatures,
            });
        }
        Ok(transactions)
    }
}
