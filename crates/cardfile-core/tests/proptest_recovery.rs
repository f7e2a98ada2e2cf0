//! Property-based tests for candidate scoring and the count sweep.
//!
//! Tests cover: the scoring formula's components, ranking order and
//! determinism, tie-breaks by source reliability, and the tolerance
//! boundary of the integrity sweep.

use proptest::prelude::*;

use cardfile_core::integrity::{CountSource, IntegrityConfig, ObservedCount, evaluate};
use cardfile_core::model::{Contact, ContactDraft};
use cardfile_core::recovery::{Candidate, ScoringWeights, SourceTier, rank, score, select_best};
use cardfile_core::snapshot::Snapshot;

const NOW: i64 = 1_700_000_000_000;
const HOUR_MS: i64 = 3_600_000;

// ============================================================================
// Strategies
// ============================================================================

fn arb_tier() -> impl Strategy<Value = SourceTier> {
    prop_oneof![
        Just(SourceTier::Primary),
        Just(SourceTier::Backup),
        Just(SourceTier::AsyncStore),
        Just(SourceTier::Snapshot),
    ]
}

fn snapshot_with(count: usize, captured_at_ms: i64) -> Snapshot {
    let contacts: Vec<Contact> = (0..count)
        .map(|i| Contact::create(ContactDraft::new(format!("c{i}")), captured_at_ms).unwrap())
        .collect();
    Snapshot::capture(contacts, Vec::new(), captured_at_ms, None, None)
}

fn arb_candidate() -> impl Strategy<Value = Candidate> {
    (arb_tier(), "[a-z.]{1,24}", 0..40usize, 0..(300 * HOUR_MS))
        .prop_map(|(tier, key, count, age_ms)| {
            Candidate::new(tier, key, snapshot_with(count, NOW - age_ms))
        })
}

// ============================================================================
// Scoring formula
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// The score decomposes into count, recency, and tier terms.
    #[test]
    fn prop_score_decomposes(
        tier in arb_tier(),
        count in 0..50usize,
        age_hours in 0..300i64,
    ) {
        let weights = ScoringWeights::default();
        let snap = snapshot_with(count, NOW - age_hours * HOUR_MS);
        let expected = weights.count_weight * count as f64
            + (weights.recency_horizon_hours - age_hours as f64).max(0.0)
            + tier.bonus(&weights);
        let got = score(&snap, tier, NOW, &weights);
        prop_assert!((got - expected).abs() < 1e-6, "got {got}, expected {expected}");
    }

    /// More records never lowers the score, everything else fixed.
    #[test]
    fn prop_score_monotonic_in_count(
        tier in arb_tier(),
        count in 0..50usize,
        age_hours in 0..300i64,
    ) {
        let weights = ScoringWeights::default();
        let ts = NOW - age_hours * HOUR_MS;
        let smaller = score(&snapshot_with(count, ts), tier, NOW, &weights);
        let larger = score(&snapshot_with(count + 1, ts), tier, NOW, &weights);
        prop_assert!(larger > smaller);
    }

    /// A fresher capture never scores below a staler one, everything else
    /// fixed, and the recency term bottoms out past the horizon.
    #[test]
    fn prop_score_monotonic_in_freshness(
        tier in arb_tier(),
        count in 0..20usize,
        age_hours in 0..300i64,
    ) {
        let weights = ScoringWeights::default();
        let fresher = score(&snapshot_with(count, NOW - age_hours * HOUR_MS), tier, NOW, &weights);
        let staler = score(
            &snapshot_with(count, NOW - (age_hours + 1) * HOUR_MS),
            tier,
            NOW,
            &weights,
        );
        prop_assert!(fresher >= staler);
        if age_hours as f64 >= weights.recency_horizon_hours {
            prop_assert_eq!(fresher, staler);
        }
    }

    /// With non-negative weights the score is never negative.
    #[test]
    fn prop_score_non_negative(candidate in arb_candidate()) {
        let weights = ScoringWeights::default();
        prop_assert!(score(&candidate.snapshot, candidate.tier, NOW, &weights) >= 0.0);
    }
}

// ============================================================================
// Ranking and selection
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Ranking sorts best first and preserves every candidate.
    #[test]
    fn prop_rank_is_sorted_and_complete(
        candidates in proptest::collection::vec(arb_candidate(), 0..8),
    ) {
        let weights = ScoringWeights::default();
        let ranked = rank(candidates.clone(), NOW, &weights);
        prop_assert_eq!(ranked.len(), candidates.len());
        for pair in ranked.windows(2) {
            prop_assert!(pair[0].score >= pair[1].score);
        }
    }

    /// The same inputs always produce the same ranking.
    #[test]
    fn prop_rank_is_deterministic(
        candidates in proptest::collection::vec(arb_candidate(), 0..8),
    ) {
        let weights = ScoringWeights::default();
        let first = rank(candidates.clone(), NOW, &weights);
        let second = rank(candidates, NOW, &weights);
        prop_assert_eq!(first, second);
    }

    /// Selection returns the top of the ranking, and only an empty pool
    /// reports exhaustion.
    #[test]
    fn prop_select_best_matches_rank_head(
        candidates in proptest::collection::vec(arb_candidate(), 0..8),
    ) {
        let weights = ScoringWeights::default();
        let head = rank(candidates.clone(), NOW, &weights).into_iter().next();
        match select_best(candidates, NOW, &weights) {
            Ok(winner) => prop_assert_eq!(Some(winner), head),
            Err(_) => prop_assert!(head.is_none()),
        }
    }

    /// Identical datasets at different tiers tie-break toward the more
    /// trusted source.
    #[test]
    fn prop_ties_resolve_by_tier(count in 0..20usize, age_hours in 0..200i64) {
        let weights = ScoringWeights {
            primary_bonus: 50.0,
            backup_bonus: 50.0,
            async_store_bonus: 50.0,
            snapshot_bonus: 50.0,
            ..ScoringWeights::default()
        };
        let ts = NOW - age_hours * HOUR_MS;
        let winner = select_best(
            vec![
                Candidate::new(SourceTier::Snapshot, "s", snapshot_with(count, ts)),
                Candidate::new(SourceTier::AsyncStore, "a", snapshot_with(count, ts)),
                Candidate::new(SourceTier::Backup, "b", snapshot_with(count, ts)),
                Candidate::new(SourceTier::Primary, "p", snapshot_with(count, ts)),
            ],
            NOW,
            &weights,
        )
        .unwrap();
        prop_assert_eq!(winner.tier, SourceTier::Primary);
    }
}

// ============================================================================
// Count sweep tolerance
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Flagged exactly when the spread strictly exceeds
    /// `max(gap_fraction * max, gap_floor)`, and never with fewer than two
    /// observations.
    #[test]
    fn prop_flag_matches_tolerance(
        values in proptest::collection::vec(0..2_000usize, 0..5),
        gap_floor in 0..20usize,
    ) {
        let config = IntegrityConfig { gap_floor, ..IntegrityConfig::default() };
        let observed: Vec<ObservedCount> = values
            .iter()
            .map(|&c| ObservedCount::new(CountSource::Primary, c))
            .collect();
        let report = evaluate(observed, &config, NOW);

        let max = values.iter().copied().max().unwrap_or(0);
        let min = values.iter().copied().min().unwrap_or(0);
        prop_assert_eq!(report.max_count, max);
        prop_assert_eq!(report.min_count, min);
        prop_assert_eq!(report.spread(), max - min);

        let allowed = (config.gap_fraction * max as f64).max(gap_floor as f64);
        let expected = values.len() >= 2 && (max - min) as f64 > allowed;
        prop_assert_eq!(report.flagged, expected);
    }

    /// Agreeing counts never flag, whatever the configuration.
    #[test]
    fn prop_agreement_never_flags(
        count in 0..5_000usize,
        copies in 2..5usize,
        gap_floor in 0..20usize,
    ) {
        let config = IntegrityConfig { gap_floor, ..IntegrityConfig::default() };
        let observed = vec![ObservedCount::new(CountSource::Backup, count); copies];
        prop_assert!(!evaluate(observed, &config, NOW).flagged);
    }

    /// Raising the floor never turns an unflagged sweep into a flagged one.
    #[test]
    fn prop_flagging_monotonic_in_floor(
        values in proptest::collection::vec(0..500usize, 2..5),
        gap_floor in 0..20usize,
    ) {
        let observed: Vec<ObservedCount> = values
            .iter()
            .map(|&c| ObservedCount::new(CountSource::AsyncStore, c))
            .collect();
        let tight = IntegrityConfig { gap_floor, ..IntegrityConfig::default() };
        let loose = IntegrityConfig { gap_floor: gap_floor + 1, ..IntegrityConfig::default() };
        let flagged_tight = evaluate(observed.clone(), &tight, NOW).flagged;
        let flagged_loose = evaluate(observed, &loose, NOW).flagged;
        if flagged_loose {
            prop_assert!(flagged_tight);
        }
    }
}
