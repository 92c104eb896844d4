//! Temporal redundancy voting.
//!
//! Every logged read of a plate is one ballot. Ballots are aligned on the
//! character position; each position is won by the most frequent character,
//! and voting stops at the first position where a strict majority of ballots
//! has already ended.

use serde::Serialize;

use super::registry::PlateDetectionEvent;

/// Result of voting over one vehicle's logged reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsensusPlate {
    pub text: String,
    pub votes: usize,
}

impl ConsensusPlate {
    /// `None` when there is nothing to vote on.
    pub fn from_events(events: &[PlateDetectionEvent]) -> Option<Self> {
        let text = temporal_redundancy_vote(events.iter().map(|e| e.text.as_str()))?;
        Some(Self {
            text,
            votes: events.len(),
        })
    }
}

/// Votes a consensus string out of `reads`. Returns `None` for an empty
/// input. Ties go to the character found in the earliest read.
pub fn temporal_redundancy_vote<'a, I>(reads: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let ballots: Vec<Vec<char>> = reads.into_iter().map(|r| r.chars().collect()).collect();
    if ballots.is_empty() {
        return None;
    }

    let max_len = ballots.iter().map(Vec::len).max().unwrap_or(0);
    let mut voted = String::with_capacity(max_len);

    for position in 0..max_len {
        // (character, count) in order of first appearance
        let mut tally: Vec<(char, usize)> = Vec::new();
        let mut blanks = 0;

        for ballot in &ballots {
            match ballot.get(position) {
                Some(c) => match tally.iter_mut().find(|(seen, _)| seen == c) {
                    Some((_, count)) => *count += 1,
                    None => tally.push((*c, 1)),
                },
                None => blanks += 1,
            }
        }

        if blanks * 2 > ballots.len() {
            break;
        }

        let mut winner = tally[0];
        for candidate in &tally[1..] {
            if candidate.1 > winner.1 {
                winner = *candidate;
            }
        }
        voted.push(winner.0);
    }

    Some(voted)
}
