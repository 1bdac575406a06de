//! Cycle timing, lane planning and shard selection.

use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

use tapedeck_core::Target;

/// Time budget of one cycle: `max(min_interval, window / target_count)`.
pub fn cycle_budget(window: Duration, min_interval: Duration, target_count: usize) -> Duration {
    if target_count == 0 {
        return min_interval;
    }
    let per_target = window / target_count as u32;
    per_target.max(min_interval)
}

/// Start offset of each target: `i × budget / n`.
///
/// Offsets increase strictly with the index and the last one stays below
/// the budget, so every request starts inside its cycle.
pub fn stagger_offsets(budget: Duration, target_count: usize) -> Vec<Duration> {
    if target_count == 0 {
        return Vec::new();
    }
    let step_nanos = budget.as_nanos() / target_count as u128;
    (0..target_count)
        .map(|i| Duration::from_nanos((step_nanos * i as u128) as u64))
        .collect()
}

/// Lane (egress identity) for each target this cycle.
///
/// The lane order is reshuffled every cycle and target `i` takes
/// `shuffled[i % lanes]`, so consecutive starts rotate across identities and
/// a target does not stick to one address.
pub fn lane_plan<R: Rng + ?Sized>(target_count: usize, lanes: usize, rng: &mut R) -> Vec<usize> {
    let lanes = lanes.max(1);
    let mut order: Vec<usize> = (0..lanes).collect();
    order.shuffle(rng);
    (0..target_count).map(|i| order[i % lanes]).collect()
}

/// Contiguous slice of `targets` owned by shard `index` of `count`.
///
/// The last shard takes the remainder. `count <= 1` keeps everything.
pub fn shard_targets(targets: &[Target], index: usize, count: usize) -> Vec<Target> {
    if count <= 1 {
        return targets.to_vec();
    }
    let chunk = targets.len() / count;
    let start = (index * chunk).min(targets.len());
    let end = if index + 1 >= count {
        targets.len()
    } else {
        (start + chunk).min(targets.len())
    };
    targets[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn budget_respects_minimum() {
        let b = cycle_budget(Duration::from_secs(5), Duration::from_secs(5), 100);
        assert_eq!(b, Duration::from_secs(5));
        let b = cycle_budget(Duration::from_secs(60), Duration::from_secs(1), 10);
        assert_eq!(b, Duration::from_secs(6));
        let b = cycle_budget(Duration::from_secs(60), Duration::from_secs(1), 0);
        assert_eq!(b, Duration::from_secs(1));
    }

    #[test]
    fn offsets_increase_and_stay_within_budget() {
        for n in [1usize, 2, 3, 7, 50, 333] {
            let budget = cycle_budget(Duration::from_secs(5), Duration::from_secs(5), n);
            let offsets = stagger_offsets(budget, n);
            assert_eq!(offsets.len(), n);
            assert_eq!(offsets[0], Duration::ZERO);
            assert!(offsets.windows(2).all(|w| w[0] < w[1]), "n={n}");
            assert!(*offsets.last().unwrap() < budget, "n={n}");
        }
    }

    #[test]
    fn lane_plan_uses_every_lane_evenly() {
        let mut rng = StdRng::seed_from_u64(7);
        let plan = lane_plan(9, 3, &mut rng);
        for lane in 0..3 {
            assert_eq!(plan.iter().filter(|&&l| l == lane).count(), 3);
        }
        assert!(lane_plan(4, 0, &mut rng).iter().all(|&l| l == 0));
    }

    #[test]
    fn shards_cover_all_targets_once() {
        let targets: Vec<Target> = (0..10)
            .map(|i| Target::new(format!("t{i}"), format!("T {i}")))
            .collect();
        let a = shard_targets(&targets, 0, 3);
        let b = shard_targets(&targets, 1, 3);
        let c = shard_targets(&targets, 2, 3);
        assert_eq!((a.len(), b.len(), c.len()), (3, 3, 4));
        assert_eq!(a[0].id, "t0");
        assert_eq!(c.last().unwrap().id, "t9");
        assert_eq!(shard_targets(&targets, 0, 1).len(), 10);
    }
}
