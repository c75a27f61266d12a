//! Positional scoring: every query feature ranks the alternatives it voted
//! for, and the per-feature rankings are aggregated.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use nalgebra::{DMatrix, DVector};

use super::{ScoreContext, ScoreMethod};
use crate::chipmatch::ChipMatch;
use crate::error::QueryError;
use crate::types::{ChipId, Identity};

/// Teleport probability of the rank-centrality chain.
const DAMPING: f64 = 0.01;
const MAX_ITERS: usize = 1000;
const TOL: f64 = 1e-12;

pub(super) fn score(
    ctx: &ScoreContext<'_>,
    method: ScoreMethod,
    cm: &ChipMatch,
) -> Result<BTreeMap<ChipId, f64>, QueryError> {
    let mut alt_of = HashMap::with_capacity(cm.len());
    for chip in cm.chip_ids() {
        alt_of.insert(chip, ctx.store.chip_identity(chip)?);
    }

    let rankings = rankings(cm, &alt_of);
    let alt_scores = match method {
        ScoreMethod::Borda => tally(&rankings, ctx.k, |pos| (ctx.k - pos) as f64),
        ScoreMethod::Topk => tally(&rankings, ctx.k, |_| 1.0),
        _ => rank_centrality(&rankings),
    };

    Ok(cm
        .chip_ids()
        .map(|chip| {
            let s = alt_of
                .get(&chip)
                .and_then(|alt| alt_scores.get(alt))
                .copied()
                .unwrap_or(0.0);
            (chip, s)
        })
        .collect())
}

/// Per query feature, alternatives ordered by neighbor rank then chip id,
/// each alternative listed once.
fn rankings(cm: &ChipMatch, alt_of: &HashMap<ChipId, Identity>) -> Vec<Vec<Identity>> {
    let mut votes: BTreeMap<u32, Vec<(u16, ChipId)>> = BTreeMap::new();
    for cand in cm.candidates() {
        for (pair, &rank) in cand.fm.iter().zip(&cand.fk) {
            votes.entry(pair[0]).or_default().push((rank, cand.chip));
        }
    }
    votes
        .into_values()
        .map(|mut v| {
            v.sort_unstable();
            let mut ranked: Vec<Identity> = Vec::with_capacity(v.len());
            for (_, chip) in v {
                let alt = alt_of[&chip];
                if !ranked.contains(&alt) {
                    ranked.push(alt);
                }
            }
            ranked
        })
        .collect()
}

fn tally(rankings: &[Vec<Identity>], k: usize, points: impl Fn(usize) -> f64) -> HashMap<Identity, f64> {
    let mut out = HashMap::new();
    for ranked in rankings {
        for (pos, alt) in ranked.iter().enumerate().take(k) {
            *out.entry(*alt).or_insert(0.0) += points(pos);
        }
    }
    out
}

/// Stationary distribution of the pairwise-preference Markov chain in which
/// probability flows from the loser of each comparison to its winner.
fn rank_centrality(rankings: &[Vec<Identity>]) -> HashMap<Identity, f64> {
    let alts: Vec<Identity> = rankings
        .iter()
        .flatten()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let m = alts.len();
    match m {
        0 => return HashMap::new(),
        1 => return HashMap::from([(alts[0], 1.0)]),
        _ => {}
    }
    let slot: HashMap<Identity, usize> = alts.iter().enumerate().map(|(i, &a)| (a, i)).collect();

    // wins[(i, j)]: how often i was ranked above j.
    let mut wins = DMatrix::<f64>::zeros(m, m);
    for ranked in rankings {
        for (a, winner) in ranked.iter().enumerate() {
            for loser in &ranked[a + 1..] {
                wins[(slot[winner], slot[loser])] += 1.0;
            }
        }
    }

    let degree = |j: usize| (0..m).filter(|&i| i != j && wins[(i, j)] + wins[(j, i)] > 0.0).count();
    let d_max = (0..m).map(degree).max().unwrap_or(0).max(1) as f64;

    let mut p = DMatrix::<f64>::zeros(m, m);
    for j in 0..m {
        let mut out_flow = 0.0;
        for i in (0..m).filter(|&i| i != j) {
            let total = wins[(i, j)] + wins[(j, i)];
            if total > 0.0 {
                p[(j, i)] = wins[(i, j)] / total / d_max;
                out_flow += p[(j, i)];
            }
        }
        p[(j, j)] = 1.0 - out_flow;
    }
    let p = p * (1.0 - DAMPING) + DMatrix::from_element(m, m, DAMPING / m as f64);
    let pt = p.transpose();

    let mut pi = DVector::from_element(m, 1.0 / m as f64);
    for _ in 0..MAX_ITERS {
        let next = &pt * &pi;
        let delta = (&next - &pi).abs().sum();
        pi = next;
        if delta < TOL {
            break;
        }
    }
    alts.into_iter().zip(pi.iter().copied()).collect()
}
