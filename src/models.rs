//! Clustering priors, conjugate feature models, and log-space sampling
//!
//! Three conjugate families cover the schema's typed fields:
//!
//! - booleans: Beta-Bernoulli,
//! - counts: Gamma-Poisson (negative-binomial predictive),
//! - reals: Normal-Inverse-Chi-Squared (Student-t predictive).
//!
//! Each family is a pair of types: the hyperparameters and the per-group
//! sufficient statistics. Statistics use integer or raw-sum forms so that
//! `remove` is the exact inverse of `add`: a value added to empty statistics
//! and removed again restores the zero state bit for bit.
//!
//! Group and feature clustering use a Pitman-Yor process. [`PitmanYor::score_add`]
//! is exactly normalized over the nonempty groups plus the maintained empty
//! groups: the new-table mass is split uniformly across the empty slots.
//!
//! All scores are log-space until the final draw; [`sample_from_scores`] uses
//! the Gumbel-max trick, which is invariant to additive shifts and never
//! exponentiates raw sums.

#![allow(missing_docs)]

use libm::lgamma;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{ChiSquared, Distribution, Gamma, Normal, Poisson};
use serde::{Deserialize, Serialize};

// ============================================================================
// Log-space utilities
// ============================================================================

/// `ln Σ exp(s_i)` with max-subtraction; `-∞` entries contribute nothing.
pub fn log_sum_exp(scores: &[f64]) -> f64 {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = scores.iter().map(|&s| (s - max).exp()).sum();
    max + sum.ln()
}

/// Sample an index proportional to `exp(scores[i])` via Gumbel-max.
///
/// `-∞` scores are unsampleable; at least one score must be finite.
pub fn sample_from_scores(rng: &mut StdRng, scores: &[f64]) -> usize {
    let mut best = usize::MAX;
    let mut best_key = f64::NEG_INFINITY;
    for (i, &s) in scores.iter().enumerate() {
        if s == f64::NEG_INFINITY {
            continue;
        }
        let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
        let key = s - (-u.ln()).ln();
        if key > best_key || best == usize::MAX {
            best = i;
            best_key = key;
        }
    }
    assert!(best != usize::MAX, "all scores are -inf");
    best
}

/// Normalize log-scores into probabilities in place.
pub fn scores_to_probs(scores: &mut [f64]) {
    let total = log_sum_exp(scores);
    assert!(total.is_finite(), "cannot normalize all--inf scores");
    for s in scores.iter_mut() {
        *s = (*s - total).exp();
    }
}

/// Sample an index from a probability vector (cumulative walk).
pub fn sample_from_probs(rng: &mut StdRng, probs: &[f64]) -> usize {
    let mut u: f64 = rng.gen::<f64>();
    for (i, &p) in probs.iter().enumerate() {
        u -= p;
        if u <= 0.0 {
            return i;
        }
    }
    probs.len() - 1
}

// ============================================================================
// Pitman-Yor clustering prior
// ============================================================================

/// Two-parameter CRP prior over partitions.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PitmanYor {
    /// Concentration, `> 0`.
    pub alpha: f64,
    /// Discount, `0 <= d < 1`.
    pub d: f64,
}

impl PitmanYor {
    /// Log-probability of seating a new row at a group.
    ///
    /// `group_rows` is the group's current row count (0 for an empty slot),
    /// `total` the rows seated so far, `nonempty` the nonempty group count,
    /// and `empty_count` how many empty slots share the new-table mass.
    /// Summed over all nonempty groups and empty slots, the masses are
    /// exactly normalized.
    pub fn score_add(
        &self,
        group_rows: usize,
        total: usize,
        nonempty: usize,
        empty_count: usize,
    ) -> f64 {
        let denom = total as f64 + self.alpha;
        if group_rows > 0 {
            ((group_rows as f64 - self.d) / denom).ln()
        } else {
            debug_assert!(empty_count > 0);
            ((self.alpha + self.d * nonempty as f64) / denom).ln() - (empty_count as f64).ln()
        }
    }

    /// Log EPPF of the partition given by `counts` (zeros are ignored).
    pub fn score_counts(&self, counts: &[usize]) -> f64 {
        let nonempty: Vec<usize> = counts.iter().copied().filter(|&c| c > 0).collect();
        let n: usize = nonempty.iter().sum();
        if n == 0 {
            return 0.0;
        }
        let mut score = 0.0;
        for i in 1..nonempty.len() {
            score += (self.alpha + i as f64 * self.d).ln();
        }
        score -= lgamma(self.alpha + n as f64) - lgamma(self.alpha + 1.0);
        for &c in &nonempty {
            score += lgamma(c as f64 - self.d) - lgamma(1.0 - self.d);
        }
        score
    }

    /// Draw a partition of `n` rows from the prior; returns group ids.
    pub fn sample_assignments(&self, n: usize, rng: &mut StdRng) -> Vec<usize> {
        let mut counts: Vec<usize> = Vec::new();
        let mut assignments = Vec::with_capacity(n);
        for i in 0..n {
            let denom = i as f64 + self.alpha;
            let mut u: f64 = rng.gen::<f64>() * denom;
            let mut chosen = counts.len();
            for (g, &c) in counts.iter().enumerate() {
                u -= c as f64 - self.d;
                if u <= 0.0 {
                    chosen = g;
                    break;
                }
            }
            if chosen == counts.len() {
                counts.push(0);
            }
            counts[chosen] += 1;
            assignments.push(chosen);
        }
        assignments
    }
}

// ============================================================================
// Beta-Bernoulli (boolean features)
// ============================================================================

/// Beta prior over a Bernoulli rate.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BetaBernoulli {
    pub alpha: f64,
    pub beta: f64,
}

/// Per-group sufficient statistics for one boolean feature.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BernoulliStats {
    pub heads: u64,
    pub total: u64,
}

impl BernoulliStats {
    #[inline]
    pub fn add(&mut self, x: bool) {
        self.heads += x as u64;
        self.total += 1;
    }

    #[inline]
    pub fn remove(&mut self, x: bool) {
        self.heads -= x as u64;
        self.total -= 1;
    }
}

impl BetaBernoulli {
    /// Posterior-predictive log-probability of `x` given group stats.
    pub fn score_value(&self, stats: &BernoulliStats, x: bool) -> f64 {
        let denom = self.alpha + self.beta + stats.total as f64;
        let p_true = (self.alpha + stats.heads as f64) / denom;
        if x {
            p_true.ln()
        } else {
            (1.0 - p_true).ln()
        }
    }

    /// Log marginal likelihood of the group's data.
    pub fn score_stats(&self, stats: &BernoulliStats) -> f64 {
        let h = stats.heads as f64;
        let t = (stats.total - stats.heads) as f64;
        lgamma(self.alpha + h) + lgamma(self.beta + t) - lgamma(self.alpha + self.beta + stats.total as f64)
            - (lgamma(self.alpha) + lgamma(self.beta) - lgamma(self.alpha + self.beta))
    }

    /// Draw from the posterior predictive.
    pub fn sample_value(&self, stats: &BernoulliStats, rng: &mut StdRng) -> bool {
        let denom = self.alpha + self.beta + stats.total as f64;
        rng.gen_bool((self.alpha + stats.heads as f64) / denom)
    }
}

// ============================================================================
// Gamma-Poisson (count features)
// ============================================================================

/// Gamma prior (shape/rate) over a Poisson rate.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GammaPoisson {
    pub shape: f64,
    pub rate: f64,
}

/// Per-group sufficient statistics for one count feature.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoissonStats {
    pub sum: u64,
    pub total: u64,
    /// `Σ ln(x_i!)`, carried for the marginal likelihood.
    pub log_fact: f64,
}

impl PoissonStats {
    #[inline]
    pub fn add(&mut self, x: u32) {
        self.sum += x as u64;
        self.total += 1;
        self.log_fact += lgamma(x as f64 + 1.0);
    }

    #[inline]
    pub fn remove(&mut self, x: u32) {
        self.sum -= x as u64;
        self.total -= 1;
        self.log_fact -= lgamma(x as f64 + 1.0);
    }
}

impl GammaPoisson {
    /// Posterior-predictive (negative binomial) log-pmf of `x`.
    pub fn score_value(&self, stats: &PoissonStats, x: u32) -> f64 {
        let a = self.shape + stats.sum as f64;
        let b = self.rate + stats.total as f64;
        let x = x as f64;
        lgamma(a + x) - lgamma(a) - lgamma(x + 1.0) + a * (b / (b + 1.0)).ln()
            - x * (b + 1.0).ln()
    }

    /// Log marginal likelihood of the group's data.
    pub fn score_stats(&self, stats: &PoissonStats) -> f64 {
        let a = self.shape + stats.sum as f64;
        let b = self.rate + stats.total as f64;
        lgamma(a) - lgamma(self.shape) + self.shape * self.rate.ln() - a * b.ln() - stats.log_fact
    }

    /// Draw from the posterior predictive: `λ ~ Gamma`, then `x ~ Poisson(λ)`.
    pub fn sample_value(&self, stats: &PoissonStats, rng: &mut StdRng) -> u32 {
        let a = self.shape + stats.sum as f64;
        let b = self.rate + stats.total as f64;
        let lambda = Gamma::new(a, 1.0 / b).expect("gamma params").sample(rng);
        let lambda = lambda.max(1e-12);
        let x = Poisson::new(lambda).expect("poisson rate").sample(rng);
        x.min(u32::MAX as f64) as u32
    }
}

// ============================================================================
// Normal-Inverse-Chi-Squared (real features)
// ============================================================================

/// Conjugate prior over a normal mean and variance.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalInvChiSq {
    pub mu: f64,
    pub kappa: f64,
    pub nu: f64,
    pub sigmasq: f64,
}

/// Per-group sufficient statistics for one real feature.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalStats {
    pub total: u64,
    pub sum: f64,
    pub sum_sq: f64,
}

impl NormalStats {
    #[inline]
    pub fn add(&mut self, x: f64) {
        self.total += 1;
        self.sum += x;
        self.sum_sq += x * x;
    }

    #[inline]
    pub fn remove(&mut self, x: f64) {
        self.total -= 1;
        self.sum -= x;
        self.sum_sq -= x * x;
    }
}

/// Posterior parameters after folding stats into the prior.
struct NichPosterior {
    mu: f64,
    kappa: f64,
    nu: f64,
    nu_sigmasq: f64,
}

impl NormalInvChiSq {
    fn posterior(&self, stats: &NormalStats) -> NichPosterior {
        let n = stats.total as f64;
        if stats.total == 0 {
            return NichPosterior {
                mu: self.mu,
                kappa: self.kappa,
                nu: self.nu,
                nu_sigmasq: self.nu * self.sigmasq,
            };
        }
        let mean = stats.sum / n;
        // Sum of squared deviations from the sample mean; clamp the
        // catastrophic-cancellation residue at zero.
        let ss = (stats.sum_sq - stats.sum * stats.sum / n).max(0.0);
        let kappa = self.kappa + n;
        NichPosterior {
            mu: (self.kappa * self.mu + stats.sum) / kappa,
            kappa,
            nu: self.nu + n,
            nu_sigmasq: self.nu * self.sigmasq
                + ss
                + (n * self.kappa / kappa) * (mean - self.mu) * (mean - self.mu),
        }
    }

    /// Posterior-predictive (Student-t) log-pdf of `x`.
    pub fn score_value(&self, stats: &NormalStats, x: f64) -> f64 {
        let post = self.posterior(stats);
        let scale_sq = post.nu_sigmasq / post.nu * (post.kappa + 1.0) / post.kappa;
        student_t_log_pdf(x, post.nu, post.mu, scale_sq)
    }

    /// Log marginal likelihood of the group's data.
    pub fn score_stats(&self, stats: &NormalStats) -> f64 {
        if stats.total == 0 {
            return 0.0;
        }
        let post = self.posterior(stats);
        let n = stats.total as f64;
        lgamma(post.nu / 2.0) - lgamma(self.nu / 2.0)
            + 0.5 * (self.kappa.ln() - post.kappa.ln())
            + (self.nu / 2.0) * (self.nu * self.sigmasq).ln()
            - (post.nu / 2.0) * post.nu_sigmasq.ln()
            - (n / 2.0) * std::f64::consts::PI.ln()
    }

    /// Draw from the posterior predictive.
    pub fn sample_value(&self, stats: &NormalStats, rng: &mut StdRng) -> f64 {
        let post = self.posterior(stats);
        let chi2 = ChiSquared::new(post.nu).expect("chi-squared dof").sample(rng);
        let sigma_sq = post.nu_sigmasq / chi2.max(1e-12);
        let mu = Normal::new(post.mu, (sigma_sq / post.kappa).sqrt())
            .expect("normal params")
            .sample(rng);
        Normal::new(mu, sigma_sq.sqrt()).expect("normal params").sample(rng)
    }
}

fn student_t_log_pdf(x: f64, nu: f64, mu: f64, scale_sq: f64) -> f64 {
    let z_sq = (x - mu) * (x - mu) / scale_sq;
    lgamma((nu + 1.0) / 2.0) - lgamma(nu / 2.0)
        - 0.5 * (nu * std::f64::consts::PI * scale_sq).ln()
        - ((nu + 1.0) / 2.0) * (1.0 + z_sq / nu).ln()
}

// ============================================================================
// Hyperparameter grids
// ============================================================================

/// Grid priors for hyperparameter inference, one axis per family plus
/// the clustering axis shared by kinds and the feature-level prior.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HyperGrid {
    pub clustering: Vec<PitmanYor>,
    pub booleans: Vec<BetaBernoulli>,
    pub counts: Vec<GammaPoisson>,
    pub reals: Vec<NormalInvChiSq>,
}

impl HyperGrid {
    /// An empty grid: hyper-inference becomes a no-op.
    pub fn empty() -> Self {
        HyperGrid {
            clustering: Vec::new(),
            booleans: Vec::new(),
            counts: Vec::new(),
            reals: Vec::new(),
        }
    }

    /// A modest default grid covering a few orders of magnitude per axis.
    pub fn default_grid() -> Self {
        let mut clustering = Vec::new();
        for &alpha in &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0] {
            for &d in &[0.0, 0.1, 0.25, 0.5] {
                clustering.push(PitmanYor { alpha, d });
            }
        }
        let mut booleans = Vec::new();
        for &alpha in &[0.25, 0.5, 1.0, 2.0, 4.0] {
            for &beta in &[0.25, 0.5, 1.0, 2.0, 4.0] {
                booleans.push(BetaBernoulli { alpha, beta });
            }
        }
        let mut counts = Vec::new();
        for &shape in &[0.5, 1.0, 2.0, 4.0] {
            for &rate in &[0.25, 1.0, 4.0] {
                counts.push(GammaPoisson { shape, rate });
            }
        }
        let mut reals = Vec::new();
        for &kappa in &[0.5, 1.0, 2.0] {
            for &nu in &[1.0, 2.0, 4.0] {
                for &sigmasq in &[0.25, 1.0, 4.0] {
                    reals.push(NormalInvChiSq {
                        mu: 0.0,
                        kappa,
                        nu,
                        sigmasq,
                    });
                }
            }
        }
        HyperGrid {
            clustering,
            booleans,
            counts,
            reals,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn log_sum_exp_matches_naive_and_handles_neg_inf() {
        let scores: [f64; 3] = [1.0, 2.0, 3.0];
        let naive: f64 = scores.iter().map(|s| s.exp()).sum::<f64>().ln();
        assert!((log_sum_exp(&scores) - naive).abs() < 1e-12);

        let with_inf = [f64::NEG_INFINITY, 0.0];
        assert!((log_sum_exp(&with_inf) - 0.0_f64).abs() < 1e-12);
        assert_eq!(
            log_sum_exp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn sample_from_scores_is_shift_invariant() {
        let scores = [0.3, -1.2, 2.0, 0.0];
        let shifted: Vec<f64> = scores.iter().map(|s| s + 123.5).collect();
        for seed in 0..64 {
            let mut a = StdRng::seed_from_u64(seed);
            let mut b = StdRng::seed_from_u64(seed);
            assert_eq!(
                sample_from_scores(&mut a, &scores),
                sample_from_scores(&mut b, &shifted)
            );
        }
    }

    #[test]
    fn sample_from_scores_skips_forbidden_groups() {
        let scores = [f64::NEG_INFINITY, 0.0, f64::NEG_INFINITY];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..32 {
            assert_eq!(sample_from_scores(&mut rng, &scores), 1);
        }
    }

    #[test]
    fn pitman_yor_seating_masses_are_normalized() {
        let py = PitmanYor { alpha: 1.5, d: 0.2 };
        // Groups of 3 and 2 rows, plus 2 empty slots.
        let scores = [
            py.score_add(3, 5, 2, 2),
            py.score_add(2, 5, 2, 2),
            py.score_add(0, 5, 2, 2),
            py.score_add(0, 5, 2, 2),
        ];
        let total: f64 = scores.iter().map(|s| s.exp()).sum();
        assert!((total - 1.0).abs() < 1e-12, "total mass {}", total);
    }

    #[test]
    fn pitman_yor_sample_assignments_covers_n_rows() {
        let py = PitmanYor { alpha: 2.0, d: 0.1 };
        let mut rng = StdRng::seed_from_u64(42);
        let assignment = py.sample_assignments(100, &mut rng);
        assert_eq!(assignment.len(), 100);
        let max = assignment.iter().copied().max().unwrap();
        // Group ids are dense 0..=max.
        for g in 0..=max {
            assert!(assignment.contains(&g));
        }
    }

    #[test]
    fn stats_add_remove_restores_zero_state() {
        let mut b = BernoulliStats::default();
        b.add(true);
        b.remove(true);
        assert_eq!(b, BernoulliStats::default());

        let mut p = PoissonStats::default();
        p.add(17);
        p.remove(17);
        assert_eq!(p, PoissonStats::default());

        let mut n = NormalStats::default();
        n.add(-3.25);
        n.remove(-3.25);
        assert_eq!(n, NormalStats::default());
    }

    #[test]
    fn bernoulli_predictive_sums_to_one() {
        let h = BetaBernoulli { alpha: 0.5, beta: 2.0 };
        let stats = BernoulliStats { heads: 3, total: 10 };
        let p = h.score_value(&stats, true).exp() + h.score_value(&stats, false).exp();
        assert!((p - 1.0).abs() < 1e-12);
    }

    #[test]
    fn gamma_poisson_predictive_is_a_distribution() {
        let h = GammaPoisson { shape: 2.0, rate: 1.0 };
        let stats = PoissonStats::default();
        let mass: f64 = (0..200).map(|x| h.score_value(&stats, x).exp()).sum();
        assert!((mass - 1.0).abs() < 1e-6, "mass {}", mass);
    }

    #[test]
    fn marginal_likelihood_decomposes_over_adds() {
        // score_stats(x1, x2) == score_stats(x1) + score_value(x2 | x1).
        let h = GammaPoisson { shape: 1.5, rate: 0.5 };
        let mut stats = PoissonStats::default();
        stats.add(4);
        let joint_one = h.score_stats(&stats);
        let cond = h.score_value(&stats, 9);
        stats.add(9);
        let joint_two = h.score_stats(&stats);
        assert!((joint_two - (joint_one + cond)).abs() < 1e-9);

        let h = NormalInvChiSq {
            mu: 0.0,
            kappa: 1.0,
            nu: 2.0,
            sigmasq: 1.0,
        };
        let mut stats = NormalStats::default();
        stats.add(0.7);
        let joint_one = h.score_stats(&stats);
        let cond = h.score_value(&stats, -1.3);
        stats.add(-1.3);
        let joint_two = h.score_stats(&stats);
        assert!((joint_two - (joint_one + cond)).abs() < 1e-9);
    }

    #[test]
    fn default_grid_is_nonempty_on_every_axis() {
        let grid = HyperGrid::default_grid();
        assert!(!grid.clustering.is_empty());
        assert!(!grid.booleans.is_empty());
        assert!(!grid.counts.is_empty());
        assert!(!grid.reals.is_empty());
    }
}
