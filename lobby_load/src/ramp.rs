//! Virtual user ramp schedule.
//!
//! The driver ramps the number of concurrent virtual users through a list of
//! stages. Within a stage the VU count moves linearly from the previous
//! stage's target, or the starting count for the first stage, to this
//! stage's target. Past the last stage the final target holds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Errors produced by [`Schedule`].
pub enum Error {
    /// A schedule needs at least one stage to define the test window.
    #[error("Ramp schedule must have at least one stage")]
    NoStages,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// One segment of the ramp.
pub struct Stage {
    /// How long this stage lasts
    pub duration_seconds: u64,
    /// The VU count reached at the end of this stage
    pub target: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The full ramp, from the starting VU count through every stage.
pub struct Schedule {
    start_vus: u32,
    stages: Vec<(Duration, u32)>,
}

impl Schedule {
    /// Create a new [`Schedule`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoStages`] if `stages` is empty.
    pub fn new(start_vus: u32, stages: &[Stage]) -> Result<Self, Error> {
        if stages.is_empty() {
            return Err(Error::NoStages);
        }
        let stages = stages
            .iter()
            .map(|stage| (Duration::from_secs(stage.duration_seconds), stage.target))
            .collect();
        Ok(Self { start_vus, stages })
    }

    /// The sum of all stage durations, the length of the test window.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|(duration, _)| *duration).sum()
    }

    /// The largest VU count the schedule ever asks for.
    #[must_use]
    pub fn peak(&self) -> u32 {
        self.stages
            .iter()
            .map(|(_, target)| *target)
            .fold(self.start_vus, u32::max)
    }

    /// The VU count wanted `elapsed` after the start of the test.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        let mut from = self.start_vus;
        let mut stage_start = Duration::ZERO;

        for &(duration, to) in &self.stages {
            let stage_end = stage_start + duration;
            if elapsed < stage_end {
                let progress = (elapsed - stage_start).as_secs_f64() / duration.as_secs_f64();
                let value = f64::from(from) + (f64::from(to) - f64::from(from)) * progress;
                return value.floor() as u32;
            }
            from = to;
            stage_start = stage_end;
        }

        from
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn stage(duration_seconds: u64, target: u32) -> Stage {
        Stage {
            duration_seconds,
            target,
        }
    }

    fn default_ramp() -> Schedule {
        Schedule::new(
            0,
            &[stage(120, 30), stage(120, 30), stage(120, 20), stage(120, 10)],
        )
        .expect("stages are not empty")
    }

    #[test]
    fn empty_stages_rejected() {
        assert_eq!(Schedule::new(0, &[]), Err(Error::NoStages));
    }

    #[test]
    fn total_duration_is_sum_of_stages() {
        assert_eq!(default_ramp().total_duration(), Duration::from_secs(480));
    }

    #[test]
    fn peak_covers_start_and_stages() {
        assert_eq!(default_ramp().peak(), 30);
        let schedule = Schedule::new(50, &[stage(10, 5)]).expect("stages are not empty");
        assert_eq!(schedule.peak(), 50);
    }

    #[test]
    fn stage_endpoints() {
        let ramp = default_ramp();
        assert_eq!(ramp.target_at(Duration::ZERO), 0);
        assert_eq!(ramp.target_at(Duration::from_secs(60)), 15);
        assert_eq!(ramp.target_at(Duration::from_secs(120)), 30);
        assert_eq!(ramp.target_at(Duration::from_secs(200)), 30);
        assert_eq!(ramp.target_at(Duration::from_secs(300)), 25);
        assert_eq!(ramp.target_at(Duration::from_secs(360)), 20);
        assert_eq!(ramp.target_at(Duration::from_secs(480)), 10);
        assert_eq!(ramp.target_at(Duration::from_secs(10_000)), 10);
    }

    #[test]
    fn zero_length_stage_jumps() {
        let ramp = Schedule::new(0, &[stage(0, 10), stage(10, 10)]).expect("stages are not empty");
        assert_eq!(ramp.target_at(Duration::ZERO), 10);
        assert_eq!(ramp.target_at(Duration::from_secs(5)), 10);
    }

    proptest! {
        #[test]
        fn rising_stage_is_monotone(target in 1u32..1_000, duration in 1u64..600, a in 0u64..600_000, b in 0u64..600_000) {
            let ramp = Schedule::new(0, &[stage(duration, target)]).expect("stages are not empty");
            let (early, late) = if a <= b { (a, b) } else { (b, a) };
            let early = ramp.target_at(Duration::from_millis(early));
            let late = ramp.target_at(Duration::from_millis(late));

            prop_assert!(early <= late);
            prop_assert!(late <= target);
        }

        #[test]
        fn target_stays_within_stage_bounds(
            start in 0u32..500,
            targets in prop::collection::vec(0u32..500, 1..6),
            elapsed in 0u64..4_000_000,
        ) {
            let stages: Vec<Stage> = targets.iter().map(|t| stage(600, *t)).collect();
            let ramp = Schedule::new(start, &stages).expect("stages are not empty");
            let value = ramp.target_at(Duration::from_millis(elapsed));

            prop_assert!(value <= ramp.peak());
        }
    }
}
