// chain-core/src/params.rs

use crate::{ChainError, ChainResult, Amount, Timestamp};
use serde::{Deserialize, Serialize};

/// Protocol constants, carried by the root block only
///
/// The on-wire form is the colon-joined `Parameters:` line in declaration
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolParameters {
    /// Relative growth of the universal dividend
    pub c: f64,
    /// Seconds between two universal dividends
    pub dt: Timestamp,
    /// First universal dividend amount
    pub ud0: Amount,
    /// Seconds before a link from the same issuer to the same target may be renewed
    pub sig_delay: Timestamp,
    /// Lifetime of a certification in seconds
    pub sig_validity: Timestamp,
    /// Incoming certifications required to become a member
    pub sig_qty: u64,
    /// Outgoing links required to count as a sentry
    pub sig_wot: u64,
    /// Lifetime of a membership in seconds
    pub ms_validity: Timestamp,
    /// Maximum distance, in hops, between a sentry and a newcomer
    pub step_max: u32,
    /// Number of previous blocks entering the median time
    pub median_time_blocks: u64,
    /// Targeted seconds between two blocks
    pub avg_gen_time: Timestamp,
    /// Number of blocks between two difficulty re-evaluations
    pub dt_diff_eval: u64,
    /// Size of the issuer rotation window in blocks
    pub blocks_rot: u64,
    /// Share of the rotation window one issuer may fill without handicap
    pub percent_rot: f64,
}

impl Default for ProtocolParameters {
    fn default() -> Self {
        Self {
            c: 0.007376,
            dt: 2_629_800, // one month
            ud0: 100,
            sig_delay: 5_259_600,
            sig_validity: 31_557_600, // one year
            sig_qty: 5,
            sig_wot: 5,
            ms_validity: 31_557_600,
            step_max: 3,
            median_time_blocks: 20,
            avg_gen_time: 960,
            dt_diff_eval: 10,
            blocks_rot: 20,
            percent_rot: 0.67,
        }
    }
}

impl ProtocolParameters {
    /// The `Parameters:` line payload of the root block
    pub fn to_line(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.c,
            self.dt,
            self.ud0,
            self.sig_delay,
            self.sig_validity,
            self.sig_qty,
            self.sig_wot,
            self.ms_validity,
            self.step_max,
            self.median_time_blocks,
            self.avg_gen_time,
            self.dt_diff_eval,
            self.blocks_rot,
            self.percent_rot,
        )
    }

    pub fn from_line(line: &str) -> ChainResult<Self> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 14 {
            return Err(ChainError::MalformedDocument(format!(
                "Parameters line has {} fields, expected 14",
                fields.len()
            )));
        }
        let bad = |what: &str| ChainError::MalformedDocument(format!("bad {what} parameter"));
        Ok(Self {
            c: fields[0].parse().map_err(|_| bad("c"))?,
            dt: fields[1].parse().map_err(|_| bad("dt"))?,
            ud0: fields[2].parse().map_err(|_| bad("ud0"))?,
            sig_delay: fields[3].parse().map_err(|_| bad("sigDelay"))?,
            sig_validity: fields[4].parse().map_err(|_| bad("sigValidity"))?,
            sig_qty: fields[5].parse().map_err(|_| bad("sigQty"))?,
            sig_wot: fields[6].parse().map_err(|_| bad("sigWoT"))?,
            ms_validity: fields[7].parse().map_err(|_| bad("msValidity"))?,
            step_max: fields[8].parse().map_err(|_| bad("stepMax"))?,
            median_time_blocks: fields[9].parse().map_err(|_| bad("medianTimeBlocks"))?,
            avg_gen_time: fields[10].parse().map_err(|_| bad("avgGenTime"))?,
            dt_diff_eval: fields[11].parse().map_err(|_| bad("dtDiffEval"))?,
            blocks_rot: fields[12].parse().map_err(|_| bad("blocksRot"))?,
            percent_rot: fields[13].parse().map_err(|_| bad("percentRot"))?,
        })
    }
}
