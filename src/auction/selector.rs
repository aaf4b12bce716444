//! Winner selection over a closed bid set.
//!
//! Pure functions: same bids in, same ranking out, no clocks and no
//! side effects. The full ranking (not just the winner) drives the
//! delivery cascade.

use crate::domain::Bid;

/// Accepted bids ranked best-first: highest amount, then lowest
/// priority rank, then earliest arrival.
pub fn rank_bids(bids: &[Bid]) -> Vec<&Bid> {
    let mut ranked: Vec<&Bid> = bids.iter().filter(|b| b.accepted).collect();
    ranked.sort_by(|a, b| {
        b.amount
            .cmp(&a.amount)
            .then_with(|| a.priority_rank.cmp(&b.priority_rank))
            .then_with(|| a.arrival_seq.cmp(&b.arrival_seq))
    });
    ranked
}

pub fn select_winner(bids: &[Bid]) -> Option<&Bid> {
    rank_bids(bids).into_iter().next()
}
