// consensus/src/wot.rs

//! Web-of-Trust reachability: sentries and certification distance.

use std::collections::{HashMap, HashSet, VecDeque};
use wot_crypto::Pubkey;

/// Directed certification graph
///
/// Edges follow certification direction, certifier to certified. Distance
/// checks walk the reverse edges from the target so one traversal answers
/// reachability from every sentry at once.
#[derive(Debug, Default, Clone)]
pub struct WotGraph {
    forward: HashMap<Pubkey, HashSet<Pubkey>>,
    reverse: HashMap<Pubkey, HashSet<Pubkey>>,
}

impl WotGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, from: Pubkey, to: Pubkey) {
        self.forward.entry(from).or_default().insert(to);
        self.reverse.entry(to).or_default().insert(from);
    }

    /// Number of outgoing edges of a key
    pub fn out_degree(&self, pubkey: &Pubkey) -> usize {
        self.forward.get(pubkey).map(|s| s.len()).unwrap_or(0)
    }

    /// Keys that can reach `target` in at most `step_max` hops
    pub fn reaching_within(&self, target: &Pubkey, step_max: u32) -> HashSet<Pubkey> {
        let mut reached = HashSet::new();
        let mut queue = VecDeque::new();
        reached.insert(*target);
        queue.push_back((*target, 0u32));
        while let Some((node, depth)) = queue.pop_front() {
            if depth == step_max {
                continue;
            }
            if let Some(sources) = self.reverse.get(&node) {
                for source in sources {
                    if reached.insert(*source) {
                        queue.push_back((*source, depth + 1));
                    }
                }
            }
        }
        reached
    }

    /// The subset of sentries that cannot reach `target` within `step_max`
    /// hops; the target is admissible iff the subset is empty
    pub fn outdistanced_sentries(
        &self,
        sentries: &[Pubkey],
        target: &Pubkey,
        step_max: u32,
    ) -> Vec<Pubkey> {
        let reached = self.reaching_within(target, step_max);
        sentries
            .iter()
            .filter(|s| !reached.contains(s))
            .copied()
            .collect()
    }

    /// Sentries of a member set: members with at least `sig_wot` outgoing
    /// edges
    pub fn sentries(&self, members: &[Pubkey], sig_wot: u64) -> Vec<Pubkey> {
        members
            .iter()
            .filter(|m| self.out_degree(m) as u64 >= sig_wot)
            .copied()
            .collect()
    }
}
