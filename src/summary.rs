use crate::{
    error::{BandlinkError, Result},
    types::{ActivitySample, Measurement, Unit, WorkoutSummary},
};
use tracing::debug;

/// Minimum session duration, in seconds, for the steps-per-minute statistic
const MIN_STEP_RATE_DURATION_SECS: u32 = 60;

/// Absent-skipping accumulator for one averaged statistic
#[derive(Debug, Default)]
struct Averager {
    sum: f64,
    count: u32,
    min: Option<f64>,
    max: Option<f64>,
}

impl Averager {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / f64::from(self.count))
    }
}

/// Reduces one workout's decoded samples into a [`WorkoutSummary`]
///
/// The builder runs a single pass over the sample series. Samples that do not
/// report a field are excluded from that field's sum and count, so a dropout
/// never drags an average toward zero. The summary is built wholly in memory
/// and returned complete; nothing is published from a partial pass.
#[derive(Debug, Clone, Copy)]
pub struct SummaryBuilder {
    workout_id: u32,
}

impl SummaryBuilder {
    /// Create a builder for one workout session
    #[must_use]
    pub const fn new(workout_id: u32) -> Self {
        Self { workout_id }
    }

    /// Fold an ordered sample series into summary statistics
    ///
    /// `duration_secs` comes from the session header rather than the samples;
    /// short sessions (under a minute) skip the steps-per-minute statistic
    /// instead of dividing by a zero minute count.
    #[must_use]
    pub fn build(&self, samples: &[ActivitySample], duration_secs: u32) -> WorkoutSummary {
        let mut heart_rate = Averager::default();
        let mut speed = Averager::default();
        let mut altitude = Averager::default();
        let mut step_total: Option<u64> = None;
        let mut calorie_total: Option<u64> = None;
        let mut distance_total: Option<f64> = None;

        let mut previous_alt: Option<f64> = None;
        let mut ascent = 0.0;
        let mut descent = 0.0;
        let mut has_altitude = false;

        for sample in samples {
            // zero heart rate is a sensor dropout, not a reading
            if let Some(hr) = sample.heart_rate.filter(|hr| *hr != 0) {
                heart_rate.push(f64::from(hr));
            }
            if let Some(v) = sample.speed {
                speed.push(v);
            }
            if let Some(steps) = sample.steps {
                *step_total.get_or_insert(0) += u64::from(steps);
            }
            if let Some(kcal) = sample.calories {
                *calorie_total.get_or_insert(0) += u64::from(kcal);
            }
            if let Some(d) = sample.distance {
                distance_total = Some(d);
            }

            match sample.altitude {
                Some(alt) => {
                    altitude.push(alt);
                    has_altitude = true;
                    if let Some(prev) = previous_alt {
                        if alt > prev {
                            ascent += alt - prev;
                        } else {
                            descent += prev - alt;
                        }
                    }
                    previous_alt = Some(alt);
                }
                // a gap ends the contiguous series; the next reading
                // starts a new one without contributing a delta
                None => previous_alt = None,
            }
        }

        let step_rate_avg = step_total.and_then(|steps| {
            if duration_secs < MIN_STEP_RATE_DURATION_SECS {
                debug!(
                    "Session of {}s too short for steps-per-minute, skipping",
                    duration_secs
                );
                return None;
            }
            Some(steps as f64 / (f64::from(duration_secs) / 60.0))
        });

        WorkoutSummary {
            workout_id: self.workout_id,
            duration: Measurement::new(f64::from(duration_secs), Unit::Seconds),
            heart_rate_avg: heart_rate.avg().map(|v| Measurement::new(v, Unit::Bpm)),
            heart_rate_min: heart_rate.min.map(|v| Measurement::new(v, Unit::Bpm)),
            heart_rate_max: heart_rate.max.map(|v| Measurement::new(v, Unit::Bpm)),
            speed_avg: speed
                .avg()
                .map(|v| Measurement::new(v, Unit::MetersPerSecond)),
            step_total: step_total.map(|v| Measurement::new(v as f64, Unit::Steps)),
            step_rate_avg: step_rate_avg.map(|v| Measurement::new(v, Unit::StepsPerMinute)),
            calorie_total: calorie_total.map(|v| Measurement::new(v as f64, Unit::Kilocalories)),
            distance_total: distance_total.map(|v| Measurement::new(v, Unit::Meters)),
            altitude_avg: altitude.avg().map(|v| Measurement::new(v, Unit::Meters)),
            altitude_min: altitude.min.map(|v| Measurement::new(v, Unit::Meters)),
            altitude_max: altitude.max.map(|v| Measurement::new(v, Unit::Meters)),
            ascent: has_altitude.then(|| Measurement::new(ascent, Unit::Meters)),
            descent: has_altitude.then(|| Measurement::new(descent, Unit::Meters)),
        }
    }

    /// Run the reduction on a blocking worker thread
    ///
    /// Scanning a long session can touch thousands of samples; this offloads
    /// the pass without changing its all-or-nothing result contract.
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::Protocol`] if the worker task is torn down
    /// before the pass completes.
    pub async fn build_in_background(
        self,
        samples: Vec<ActivitySample>,
        duration_secs: u32,
    ) -> Result<WorkoutSummary> {
        tokio::task::spawn_blocking(move || self.build(&samples, duration_secs))
            .await
            .map_err(|e| BandlinkError::Protocol(format!("summary worker failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hr_sample(ts: i64, hr: Option<u8>) -> ActivitySample {
        let mut sample = ActivitySample::at(ts);
        sample.heart_rate = hr;
        sample
    }

    fn alt_sample(ts: i64, alt: Option<f64>) -> ActivitySample {
        let mut sample = ActivitySample::at(ts);
        sample.altitude = alt;
        sample
    }

    #[test]
    fn test_average_skips_absent_values() {
        let samples = vec![
            hr_sample(0, Some(60)),
            hr_sample(1, None),
            hr_sample(2, Some(80)),
        ];
        let summary = SummaryBuilder::new(1).build(&samples, 120);

        let avg = summary.heart_rate_avg.unwrap();
        assert!((avg.value - 70.0).abs() < f64::EPSILON);
        assert_eq!(avg.unit, Unit::Bpm);
        assert_eq!(summary.heart_rate_min.unwrap().value, 60.0);
        assert_eq!(summary.heart_rate_max.unwrap().value, 80.0);
    }

    #[test]
    fn test_zero_heart_rate_treated_as_absent() {
        let samples = vec![
            hr_sample(0, Some(60)),
            hr_sample(1, Some(0)),
            hr_sample(2, Some(80)),
        ];
        let summary = SummaryBuilder::new(1).build(&samples, 120);
        assert!((summary.heart_rate_avg.unwrap().value - 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cumulative_ascent_and_descent() {
        let samples = vec![
            alt_sample(0, Some(100.0)),
            alt_sample(1, Some(105.0)),
            alt_sample(2, Some(102.0)),
            alt_sample(3, Some(110.0)),
        ];
        let summary = SummaryBuilder::new(1).build(&samples, 240);

        assert!((summary.ascent.unwrap().value - 13.0).abs() < f64::EPSILON);
        assert!((summary.descent.unwrap().value - 3.0).abs() < f64::EPSILON);
        assert_eq!(summary.altitude_min.unwrap().value, 100.0);
        assert_eq!(summary.altitude_max.unwrap().value, 110.0);
    }

    #[test]
    fn test_altitude_gap_resets_accumulation() {
        let samples = vec![
            alt_sample(0, Some(100.0)),
            alt_sample(1, None),
            alt_sample(2, Some(150.0)),
            alt_sample(3, Some(151.0)),
        ];
        let summary = SummaryBuilder::new(1).build(&samples, 240);

        // the 100 -> 150 jump spans a gap and contributes nothing
        assert!((summary.ascent.unwrap().value - 1.0).abs() < f64::EPSILON);
        assert!((summary.descent.unwrap().value).abs() < f64::EPSILON);
    }

    #[test]
    fn test_step_rate_guarded_for_short_sessions() {
        let mut sample = ActivitySample::at(0);
        sample.steps = Some(90);
        let summary = SummaryBuilder::new(1).build(&[sample.clone()], 45);
        assert!(summary.step_rate_avg.is_none());
        assert_eq!(summary.step_total.unwrap().value, 90.0);

        let summary = SummaryBuilder::new(1).build(&[sample], 180);
        let rate = summary.step_rate_avg.unwrap();
        assert!((rate.value - 30.0).abs() < f64::EPSILON);
        assert_eq!(rate.unit, Unit::StepsPerMinute);
    }

    #[test]
    fn test_empty_series_yields_no_statistics() {
        let summary = SummaryBuilder::new(7).build(&[], 300);

        assert_eq!(summary.workout_id, 7);
        assert_eq!(summary.duration.value, 300.0);
        assert!(summary.heart_rate_avg.is_none());
        assert!(summary.speed_avg.is_none());
        assert!(summary.step_total.is_none());
        assert!(summary.ascent.is_none());
        assert!(summary.descent.is_none());
    }

    #[test]
    fn test_distance_takes_last_cumulative_value() {
        let mut a = ActivitySample::at(0);
        a.distance = Some(100.0);
        let mut b = ActivitySample::at(1);
        b.distance = Some(250.0);
        let summary = SummaryBuilder::new(1).build(&[a, b], 120);

        assert_eq!(summary.distance_total.unwrap().value, 250.0);
        assert_eq!(summary.distance_total.unwrap().unit, Unit::Meters);
    }

    #[tokio::test]
    async fn test_background_build_matches_inline() {
        let samples = vec![hr_sample(0, Some(60)), hr_sample(1, Some(80))];
        let builder = SummaryBuilder::new(3);

        let inline = builder.build(&samples, 120);
        let offloaded = builder
            .build_in_background(samples, 120)
            .await
            .unwrap();
        assert_eq!(inline, offloaded);
    }
}
