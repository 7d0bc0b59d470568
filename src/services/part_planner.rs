//! Chooses between a single put and a multipart transfer, and sizes parts.

use crate::{
    backend::MAX_PARTS_PER_UPLOAD,
    config::TransferConfig,
    models::PartPlan,
};

/// How an object goes to the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    SingleShot,
    Multipart(PartPlan),
}

#[derive(Clone, Debug)]
pub struct PartPlanner {
    threshold: u64,
    target_part_size: u64,
    min_part_size: u64,
}

impl PartPlanner {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            threshold: config.multipart_threshold_bytes,
            target_part_size: config.target_part_size_bytes,
            min_part_size: config.min_part_size_bytes,
        }
    }

    /// Plan a transfer of `total_size` bytes, or of a stream of unknown
    /// length when `None`.
    ///
    /// Sizes up to the threshold go single-shot. Anything larger is split
    /// into contiguous parts; an unknown size yields an open-ended plan that
    /// is cut while reading, the last short read becoming the final part.
    pub fn plan(&self, total_size: Option<u64>) -> Strategy {
        match total_size {
            Some(total) if total <= self.threshold => Strategy::SingleShot,
            Some(total) => Strategy::Multipart(PartPlan::sized(total, self.part_size_for(total))),
            None => Strategy::Multipart(PartPlan::open_ended(self.base_part_size())),
        }
    }

    /// Part size for a known total: the target size, raised when the target
    /// would need more parts than the backend accepts.
    pub fn part_size_for(&self, total_size: u64) -> u64 {
        let part_size = self.base_part_size();
        let max_parts = u64::from(MAX_PARTS_PER_UPLOAD);
        if total_size.div_ceil(part_size) > max_parts {
            total_size.div_ceil(max_parts)
        } else {
            part_size
        }
    }

    fn base_part_size(&self) -> u64 {
        self.target_part_size.max(self.min_part_size).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn planner(threshold: u64, part: u64) -> PartPlanner {
        PartPlanner::new(&TransferConfig {
            multipart_threshold_bytes: threshold,
            target_part_size_bytes: part,
            min_part_size_bytes: 5 * MIB,
            ..TransferConfig::default()
        })
    }

    fn multipart(strategy: Strategy) -> PartPlan {
        match strategy {
            Strategy::Multipart(plan) => plan,
            Strategy::SingleShot => panic!("expected a multipart plan"),
        }
    }

    #[test]
    fn at_or_below_threshold_is_single_shot() {
        let p = planner(MIB, 5 * MIB);
        assert_eq!(p.plan(Some(1)), Strategy::SingleShot);
        assert_eq!(p.plan(Some(10)), Strategy::SingleShot);
        assert_eq!(p.plan(Some(MIB)), Strategy::SingleShot);
    }

    #[test]
    fn just_above_threshold_is_multipart() {
        let plan = multipart(planner(MIB, 5 * MIB).plan(Some(MIB + 1)));
        assert_eq!(plan.part_count(), Some(1));
        assert_eq!(plan.parts()[0].byte_length, MIB + 1);
    }

    #[test]
    fn two_hundred_fifty_mib_splits_into_fifty_parts() {
        let plan = multipart(planner(5 * MIB, 5 * MIB).plan(Some(250 * MIB)));
        assert_eq!(plan.part_count(), Some(50));
        assert!(plan.parts().iter().all(|p| p.byte_length == 5 * MIB));
        let numbers: Vec<u32> = plan.parts().iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, (1..=50).collect::<Vec<_>>());
    }

    #[test]
    fn part_lengths_sum_to_total() {
        let p = planner(16 * MIB, 8 * MIB);
        for total in [16 * MIB + 1, 17 * MIB, 100 * MIB + 3, 1 << 33] {
            let plan = multipart(p.plan(Some(total)));
            let sum: u64 = plan.parts().iter().map(|d| d.byte_length).sum();
            assert_eq!(sum, total);
            assert!(plan.parts().len() <= MAX_PARTS_PER_UPLOAD as usize);
        }
    }

    #[test]
    fn part_size_grows_to_respect_part_ceiling() {
        let total = 100 * 1024 * MIB;
        let p = planner(16 * MIB, 5 * MIB);
        let part_size = p.part_size_for(total);
        assert!(part_size > 5 * MIB);
        assert!(total.div_ceil(part_size) <= u64::from(MAX_PARTS_PER_UPLOAD));

        let plan = multipart(p.plan(Some(total)));
        assert_eq!(plan.part_size(), part_size);
        assert!(plan.parts().len() <= MAX_PARTS_PER_UPLOAD as usize);
    }

    #[test]
    fn target_below_minimum_is_raised() {
        let p = planner(MIB, MIB);
        assert_eq!(p.part_size_for(20 * MIB), 5 * MIB);
    }

    #[test]
    fn unknown_size_gets_open_ended_plan() {
        let plan = multipart(planner(MIB, 8 * MIB).plan(None));
        assert_eq!(plan.total_size(), None);
        assert_eq!(plan.part_size(), 8 * MIB);
    }
}
