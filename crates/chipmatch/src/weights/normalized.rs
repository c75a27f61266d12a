//! Distance-ratio weights (`ratio`, `lnbnn`, `lnrat`).

use std::collections::HashMap;

use nalgebra::DMatrix;

use super::{NeighborWeighter, NormalizerRule, WeightArrays, WeightContext};
use crate::error::QueryError;
use crate::neighbors::Neighbors;
use crate::store::FeatureStore;
use crate::types::{ChipId, Identity, ImageId};

const EPS: f32 = 1e-8;

/// How a voting distance is compared with its normalizer distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatioKind {
    /// `nn / norm`; small is distinctive.
    Ratio,
    /// `norm - nn`; large is distinctive.
    Lnbnn,
    /// `ln(norm / nn)`; large is distinctive.
    Lnrat,
}

impl RatioKind {
    fn name(self) -> &'static str {
        match self {
            Self::Ratio => "ratio",
            Self::Lnbnn => "lnbnn",
            Self::Lnrat => "lnrat",
        }
    }

    #[inline]
    fn apply(self, nn: f32, norm: f32) -> f32 {
        match self {
            Self::Ratio => nn / norm.max(EPS),
            Self::Lnbnn => norm - nn,
            Self::Lnrat => ((norm + EPS) / (nn + EPS)).ln(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DistanceRatioWeighter {
    kind: RatioKind,
    rule: NormalizerRule,
}

impl DistanceRatioWeighter {
    pub fn new(kind: RatioKind, rule: NormalizerRule) -> Self {
        Self { kind, rule }
    }
}

impl NeighborWeighter for DistanceRatioWeighter {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn weigh(
        &self,
        ctx: &WeightContext<'_>,
        _probe: ChipId,
        neighbors: &Neighbors,
    ) -> Result<WeightArrays, QueryError> {
        let k = ctx.nn.k;
        if ctx.nn.k_norm == 0 {
            return Err(QueryError::InvalidConfig(format!(
                "filter '{}' needs nn.k_norm >= 1",
                self.kind.name()
            )));
        }
        let n = neighbors.n_features();
        let mut selector = NormalizerSelector::new(ctx, self.rule);
        let mut weights = DMatrix::zeros(n, k);
        let mut normalizers = Vec::with_capacity(n);

        for i in 0..n {
            let col = selector.column(neighbors, i)?;
            let norm = neighbors.dist[(i, col)];
            normalizers.push(neighbors.idx[(i, col)]);
            for c in 0..k {
                weights[(i, c)] = self.kind.apply(neighbors.dist[(i, c)], norm);
            }
        }

        Ok(WeightArrays {
            weights,
            normalizers: Some(normalizers),
        })
    }
}

/// Picks the normalizer column per feature row, memoizing chip lookups.
struct NormalizerSelector<'a> {
    ctx: &'a WeightContext<'a>,
    rule: NormalizerRule,
    names: HashMap<ChipId, Identity>,
    images: HashMap<ChipId, ImageId>,
}

impl<'a> NormalizerSelector<'a> {
    fn new(ctx: &'a WeightContext<'a>, rule: NormalizerRule) -> Self {
        Self {
            ctx,
            rule,
            names: HashMap::new(),
            images: HashMap::new(),
        }
    }

    fn column(&mut self, nb: &Neighbors, row: usize) -> Result<usize, QueryError> {
        let k = self.ctx.nn.k;
        let last = k + self.ctx.nn.k_norm - 1;
        match self.rule {
            NormalizerRule::First => Ok(k),
            NormalizerRule::Last => Ok(last),
            NormalizerRule::Name => self.first_distinct(nb, row, last, Self::identity),
            NormalizerRule::Image => self.first_distinct(nb, row, last, Self::image),
        }
    }

    /// First normalizer column whose key differs from every top-K key;
    /// the last column when none does.
    fn first_distinct<T: PartialEq>(
        &mut self,
        nb: &Neighbors,
        row: usize,
        last: usize,
        key: fn(&mut Self, usize) -> Result<T, QueryError>,
    ) -> Result<usize, QueryError> {
        let k = self.ctx.nn.k;
        let mut voters = Vec::with_capacity(k);
        for c in 0..k {
            voters.push(key(self, nb.idx[(row, c)])?);
        }
        for col in k..=last {
            let candidate = key(self, nb.idx[(row, col)])?;
            if !voters.contains(&candidate) {
                return Ok(col);
            }
        }
        Ok(last)
    }

    fn identity(&mut self, index_row: usize) -> Result<Identity, QueryError> {
        let (chip, _) = self.ctx.index.resolve(index_row);
        if let Some(&id) = self.names.get(&chip) {
            return Ok(id);
        }
        let id = self.ctx.store.chip_identity(chip)?;
        self.names.insert(chip, id);
        Ok(id)
    }

    fn image(&mut self, index_row: usize) -> Result<ImageId, QueryError> {
        let (chip, _) = self.ctx.index.resolve(index_row);
        if let Some(&img) = self.images.get(&chip) {
            return Ok(img);
        }
        let img = self.ctx.store.chip_image(chip)?;
        self.images.insert(chip, img);
        Ok(img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexParams, NnConfig};
    use crate::index::DescriptorIndex;
    use crate::store::InMemoryStore;
    use crate::test_utils::{chip_from_rows, store_from};
    use approx::assert_relative_eq;

    /// Database rows on a line so distances are easy to reason about:
    /// chip 1 (name 5) at 0 and 1, chip 2 (name 5) at 2, chip 3 (name 6) at 4.
    fn line_store() -> InMemoryStore {
        let mut c1 = chip_from_rows(10, &[[0u8, 0], [1, 0]]);
        c1.name = Some(5);
        let mut c2 = chip_from_rows(20, &[[2u8, 0]]);
        c2.name = Some(5);
        let mut c3 = chip_from_rows(30, &[[4u8, 0]]);
        c3.name = Some(6);
        let probe = chip_from_rows(40, &[[0u8, 0]]);
        store_from(vec![(1, c1), (2, c2), (3, c3), (9, probe)])
    }

    fn weigh(kind: RatioKind, rule: NormalizerRule, k: usize, k_norm: usize) -> WeightArrays {
        let store = line_store();
        let index =
            DescriptorIndex::build(&[1, 2, 3], &store, &IndexParams::default(), false, None)
                .unwrap();
        let nn = NnConfig {
            k,
            k_norm,
            checks: 0,
        };
        let probe = store.chip_descriptors(9).unwrap();
        let neighbors = index.query(&probe, k + k_norm, 0).unwrap();
        let ctx = WeightContext {
            store: &store,
            index: &index,
            nn: &nn,
        };
        DistanceRatioWeighter::new(kind, rule)
            .weigh(&ctx, 9, &neighbors)
            .unwrap()
    }

    #[test]
    fn lnbnn_and_ratio_use_first_normalizer() {
        // Probe at 0: neighbor distances 0, 1, 4, 16.
        let w = weigh(RatioKind::Lnbnn, NormalizerRule::First, 1, 1);
        assert_relative_eq!(w.weights[(0, 0)], 1.0);
        assert_eq!(w.normalizers, Some(vec![1]));

        let w = weigh(RatioKind::Ratio, NormalizerRule::First, 2, 1);
        assert_relative_eq!(w.weights[(0, 0)], 0.0);
        assert_relative_eq!(w.weights[(0, 1)], 0.25);
    }

    #[test]
    fn name_rule_skips_normalizers_of_voting_identities() {
        // Top-1 is chip 1 (name 5); chip 1 and chip 2 share the name, so the
        // normalizer falls through to chip 3 at squared distance 16.
        let w = weigh(RatioKind::Lnbnn, NormalizerRule::Name, 1, 3);
        assert_relative_eq!(w.weights[(0, 0)], 16.0);
        assert_eq!(w.normalizers, Some(vec![3]));

        let w = weigh(RatioKind::Lnbnn, NormalizerRule::Last, 1, 2);
        assert_relative_eq!(w.weights[(0, 0)], 4.0);
    }

    #[test]
    fn lnrat_is_finite_for_exact_matches() {
        let w = weigh(RatioKind::Lnrat, NormalizerRule::First, 1, 1);
        assert!(w.weights[(0, 0)].is_finite());
        assert!(w.weights[(0, 0)] > 0.0);
    }
}
