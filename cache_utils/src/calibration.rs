#![allow(clippy::missing_safety_doc)]

use crate::{flush, maccess, rdtsc_fence};

use core::cmp::min;
use core::ops::AddAssign;
use itertools::Itertools;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistParams {
    pub iterations: u32,
    pub bucket_size: usize,
    pub bucket_number: usize,
}

pub const CALIBRATION_BUCKET_SIZE: usize = 2;
pub const CALIBRATION_BUCKET_NUMBER: usize = 512;
pub const CALIBRATION_NUM_ITER: u32 = 1 << 10;

impl Default for HistParams {
    fn default() -> Self {
        HistParams {
            iterations: CALIBRATION_NUM_ITER,
            bucket_size: CALIBRATION_BUCKET_SIZE,
            bucket_number: CALIBRATION_BUCKET_NUMBER,
        }
    }
}

pub unsafe fn only_reload(p: *const u8) -> u64 {
    let t = unsafe { rdtsc_fence() };
    unsafe { maccess(p) };
    (unsafe { rdtsc_fence() } - t)
}

pub unsafe fn flush_and_reload(p: *const u8) -> u64 {
    unsafe {
        flush(p);
        only_reload(p)
    }
}

pub unsafe fn load_and_reload(p: *const u8) -> u64 {
    unsafe {
        maccess(p);
        only_reload(p)
    }
}

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_LEN: usize = 1 << PAGE_SHIFT;

pub type VPN = usize;

pub fn get_vpn<T>(p: *const T) -> VPN {
    (p as usize) & (!(PAGE_LEN - 1))
}

/// What to do to the line before the timed access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prepare {
    /// Load the line first, the timed access should hit.
    Access,
    /// Flush the line first, the timed access should miss.
    Flush,
}

#[derive(Debug, Clone, Copy)]
pub struct CalibrateOperation<'a> {
    pub prepare: Prepare,
    pub name: &'a str,
    pub display_name: &'a str,
}

pub const HIT_INDEX: usize = 0;
pub const MISS_INDEX: usize = 1;

pub const HIT_MISS_OPERATIONS: [CalibrateOperation<'static>; 2] = [
    CalibrateOperation {
        prepare: Prepare::Access,
        name: "hit",
        display_name: "hit",
    },
    CalibrateOperation {
        prepare: Prepare::Flush,
        name: "miss",
        display_name: "miss",
    },
];

#[derive(Debug)]
pub struct CalibrateResult {
    pub page: VPN,
    pub offset: usize,
    pub histogram: Vec<Vec<u32>>,
    pub median: Vec<u64>,
    pub min: Vec<u64>,
    pub max: Vec<u64>,
}

pub const SPURIOUS_THRESHOLD: u32 = 1;

/// Builds one latency histogram per operation for every line in `[p, p + len)`.
///
/// `measure` performs the operation's preparation on the line and returns the
/// latency of one timed access. The last bucket collects everything slower than
/// the histogram range (context switches, interrupts) and is ignored for the
/// min, median and max. Per-line results are logged at debug level.
///
/// # Safety
///
/// Every `p + i` for `i` in `(0..len).step_by(increment)` must be readable.
pub unsafe fn calibrate(
    p: *const u8,
    increment: usize,
    len: usize,
    operations: &[CalibrateOperation],
    hist_params: HistParams,
    mut measure: impl FnMut(&CalibrateOperation, *const u8) -> u64,
) -> Vec<CalibrateResult> {
    log::debug!(
        "Calibrating {}...",
        operations
            .iter()
            .map(|operation| { operation.display_name })
            .format(", ")
    );

    let to_bucket = |time: u64| -> usize { time as usize / hist_params.bucket_size };
    let from_bucket = |bucket: usize| -> u64 { (bucket * hist_params.bucket_size) as u64 };

    let mut ret = Vec::new();

    for i in (0..len).step_by(increment) {
        let pointer = unsafe { p.add(i) };

        let mut calibrate_result = CalibrateResult {
            page: get_vpn(pointer),
            offset: i,
            histogram: Vec::with_capacity(operations.len()),
            median: vec![0; operations.len()],
            min: vec![0; operations.len()],
            max: vec![0; operations.len()],
        };

        for op in operations {
            let mut hist = vec![0; hist_params.bucket_number];
            for _ in 0..hist_params.iterations {
                let time = measure(op, pointer);
                let bucket = min(hist_params.bucket_number - 1, to_bucket(time));
                hist[bucket] += 1;
            }
            calibrate_result.histogram.push(hist);
        }

        let mut sums = vec![0; operations.len()];
        let mut median_found = vec![false; operations.len()];

        let median_thresholds: Vec<u32> = calibrate_result
            .histogram
            .iter()
            .map(|h| (hist_params.iterations - h[hist_params.bucket_number - 1]) / 2)
            .collect();

        for j in 0..hist_params.bucket_number - 1 {
            for op in 0..operations.len() {
                let hist = &calibrate_result.histogram[op][j];
                let min = &mut calibrate_result.min[op];
                let max = &mut calibrate_result.max[op];
                let med = &mut calibrate_result.median[op];
                let sum = &mut sums[op];

                if *min == 0 {
                    // looking for min
                    if *hist > SPURIOUS_THRESHOLD {
                        *min = from_bucket(j);
                    }
                } else if *hist > SPURIOUS_THRESHOLD {
                    *max = from_bucket(j);
                }

                if !median_found[op] {
                    *sum += *hist;
                    if *sum >= median_thresholds[op] {
                        *med = from_bucket(j);
                        median_found[op] = true;
                    }
                }
            }
        }
        for (j, op) in operations.iter().enumerate() {
            log::debug!(
                "{:p} {}: min {}, median {}, max {}",
                pointer,
                op.display_name,
                calibrate_result.min[j],
                calibrate_result.median[j],
                calibrate_result.max[j]
            );
        }
        ret.push(calibrate_result);
    }
    ret
}

#[derive(Debug, Clone)]
pub struct RawHistogram {
    pub hit: Vec<u32>,
    pub miss: Vec<u32>,
}

// ALL Histogram deal in buckets.
// Thresholds are less than equal.
impl RawHistogram {
    pub fn from(
        mut calibrate_result: CalibrateResult,
        hit_index: usize,
        miss_index: usize,
    ) -> Self {
        calibrate_result.histogram.push(Vec::default());
        let hit = calibrate_result.histogram.swap_remove(hit_index);
        calibrate_result.histogram.push(Vec::default());
        let miss = calibrate_result.histogram.swap_remove(miss_index);
        RawHistogram { hit, miss }
    }

    pub fn empty(len: usize) -> Self {
        Self {
            hit: vec![0; len],
            miss: vec![0; len],
        }
    }
}

impl AddAssign<&RawHistogram> for RawHistogram {
    fn add_assign(&mut self, rhs: &Self) {
        assert_eq!(self.hit.len(), rhs.hit.len());
        assert_eq!(self.miss.len(), rhs.miss.len());
        assert_eq!(self.hit.len(), self.miss.len());

        for i in 0..self.hit.len() {
            self.hit[i] += rhs.hit[i];
            self.miss[i] += rhs.miss[i];
        }
    }
}

impl AddAssign<Self> for RawHistogram {
    fn add_assign(&mut self, rhs: Self) {
        *self += &rhs;
    }
}

pub fn cum_sum(vector: &[u32]) -> Vec<u32> {
    let mut res = Vec::with_capacity(vector.len());
    let mut acc = 0;
    for v in vector {
        acc += v;
        res.push(acc);
    }
    res
}

#[derive(Debug, Clone)]
pub struct HistogramCumSum {
    pub num_hit: u32,
    pub num_miss: u32,
    pub hit: Vec<u32>,
    pub miss: Vec<u32>,
    pub hit_cum_sum: Vec<u32>,
    pub miss_cum_sum: Vec<u32>,
}

impl HistogramCumSum {
    pub fn from(raw_histogram: RawHistogram) -> Self {
        let len = raw_histogram.miss.len();

        assert_eq!(raw_histogram.hit.len(), len);

        let miss_cum_sum = cum_sum(&raw_histogram.miss);
        let hit_cum_sum = cum_sum(&raw_histogram.hit);
        let miss_total = miss_cum_sum[len - 1];
        let hit_total = hit_cum_sum[len - 1];
        Self {
            num_hit: hit_total,
            num_miss: miss_total,
            hit: raw_histogram.hit,
            miss: raw_histogram.miss,
            hit_cum_sum,
            miss_cum_sum,
        }
    }

    pub fn error_for_threshold(&self, threshold: BucketThreshold) -> ErrorPrediction {
        if threshold.miss_faster_than_hit {
            ErrorPrediction {
                true_hit: self.num_hit - self.hit_cum_sum[threshold.bucket_index],
                true_miss: self.miss_cum_sum[threshold.bucket_index],
                false_hit: self.num_miss - self.miss_cum_sum[threshold.bucket_index],
                false_miss: self.hit_cum_sum[threshold.bucket_index],
            }
        } else {
            ErrorPrediction {
                true_hit: self.hit_cum_sum[threshold.bucket_index],
                true_miss: self.num_miss - self.miss_cum_sum[threshold.bucket_index],
                false_hit: self.miss_cum_sum[threshold.bucket_index],
                false_miss: self.num_hit - self.hit_cum_sum[threshold.bucket_index],
            }
        }
    }

    pub fn len(&self) -> usize {
        self.hit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hit.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorPrediction {
    pub true_hit: u32,
    pub true_miss: u32,
    pub false_hit: u32,
    pub false_miss: u32,
}

impl ErrorPrediction {
    pub fn total_error(&self) -> u32 {
        self.false_hit + self.false_miss
    }
    pub fn total(&self) -> u32 {
        self.false_hit + self.false_miss + self.true_hit + self.true_miss
    }
    pub fn error_rate(&self) -> f32 {
        (self.false_miss + self.false_hit) as f32 / (self.total() as f32)
    }
}

#[derive(Debug, Clone)]
pub struct ErrorPredictions {
    pub histogram: HistogramCumSum,
    pub error_miss_less_than_hit: Vec<u32>,
    pub error_hit_less_than_miss: Vec<u32>,
}

impl ErrorPredictions {
    pub fn predict_errors(hist: HistogramCumSum) -> Self {
        let mut error_miss_less_than_hit = vec![0; hist.len() - 1];
        let mut error_hit_less_than_miss = vec![0; hist.len() - 1];
        for threshold_bucket_index in 0..(hist.len() - 1) {
            error_miss_less_than_hit[threshold_bucket_index] = hist
                .error_for_threshold(BucketThreshold {
                    bucket_index: threshold_bucket_index,
                    miss_faster_than_hit: true,
                })
                .total_error();

            error_hit_less_than_miss[threshold_bucket_index] = hist
                .error_for_threshold(BucketThreshold {
                    bucket_index: threshold_bucket_index,
                    miss_faster_than_hit: false,
                })
                .total_error();
        }
        Self {
            histogram: hist,
            error_miss_less_than_hit,
            error_hit_less_than_miss,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdError {
    pub threshold: BucketThreshold,
    pub error: ErrorPrediction,
}

#[derive(Debug, Clone)]
pub struct PotentialThresholds {
    pub threshold_errors: Vec<ThresholdError>,
}

impl PotentialThresholds {
    pub fn median(mut self) -> Option<ThresholdError> {
        if !self.threshold_errors.is_empty() {
            let index = (self.threshold_errors.len() - 1) / 2;
            self.threshold_errors.push(Default::default());
            Some(self.threshold_errors.swap_remove(index))
        } else {
            None
        }
    }

    pub fn minimizing_total_error(error_pred: ErrorPredictions) -> Self {
        let mut min_error = u32::MAX;
        let mut threshold_errors = Vec::new();
        for i in 0..error_pred.error_miss_less_than_hit.len() {
            if error_pred.error_miss_less_than_hit[i] < min_error {
                min_error = error_pred.error_miss_less_than_hit[i];
                threshold_errors = Vec::new();
            }
            if error_pred.error_hit_less_than_miss[i] < min_error {
                min_error = error_pred.error_hit_less_than_miss[i];
                threshold_errors = Vec::new();
            }
            if error_pred.error_miss_less_than_hit[i] == min_error {
                let threshold = BucketThreshold {
                    bucket_index: i,
                    miss_faster_than_hit: true,
                };
                let error = error_pred.histogram.error_for_threshold(threshold);
                threshold_errors.push(ThresholdError { threshold, error })
            }
            if error_pred.error_hit_less_than_miss[i] == min_error {
                let threshold = BucketThreshold {
                    bucket_index: i,
                    miss_faster_than_hit: false,
                };
                let error = error_pred.histogram.error_for_threshold(threshold);
                threshold_errors.push(ThresholdError { threshold, error })
            }
        }
        Self { threshold_errors }
    }
}

// Thresholds are less than equal.
// usize for bucket, u64 for time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketThreshold {
    pub bucket_index: usize,
    pub miss_faster_than_hit: bool,
}

impl BucketThreshold {
    /// The cycle threshold equivalent to this bucket boundary.
    pub fn to_cycles(&self, bucket_size: usize) -> Threshold {
        Threshold {
            cycles: ((self.bucket_index + 1) * bucket_size - 1) as u64,
            miss_faster_than_hit: self.miss_faster_than_hit,
        }
    }
}

/// A hit/miss decision boundary, in cycles.
///
/// With `miss_faster_than_hit == false` (the usual reload timing) an access is a
/// hit when it took at most `cycles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
    pub cycles: u64,
    pub miss_faster_than_hit: bool,
}

impl Threshold {
    pub const fn at_most(cycles: u64) -> Threshold {
        Threshold {
            cycles,
            miss_faster_than_hit: false,
        }
    }

    pub fn is_hit(&self, time: u64) -> bool {
        if self.miss_faster_than_hit {
            time > self.cycles
        } else {
            time <= self.cycles
        }
    }
}

/// Result of a hit/miss calibration over a set of lines.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdCalibration {
    pub threshold: Threshold,
    pub error: ErrorPrediction,
    /// Median of the per-line hit medians, in cycles.
    pub hit_median: u64,
    /// Median of the per-line miss medians, in cycles.
    pub miss_median: u64,
}

/// Reduces per-line hit/miss calibration results to the single threshold that
/// minimises false hits plus false misses over all lines.
///
/// `None` when the histograms cannot separate hits from misses: no hit or no
/// miss sample inside the histogram range, a best threshold that is wrong at
/// least half the time, or one that would call the slower accesses hits.
pub fn hit_miss_threshold(
    results: Vec<CalibrateResult>,
    bucket_size: usize,
) -> Option<ThresholdCalibration> {
    let bucket_number = results.first()?.histogram.first()?.len();
    let mut hit_medians: Vec<u64> = results.iter().map(|r| r.median[HIT_INDEX]).collect();
    let mut miss_medians: Vec<u64> = results.iter().map(|r| r.median[MISS_INDEX]).collect();
    hit_medians.sort_unstable();
    miss_medians.sort_unstable();

    let mut total = RawHistogram::empty(bucket_number);
    for result in results {
        total += RawHistogram::from(result, HIT_INDEX, MISS_INDEX);
    }
    let overflow = bucket_number - 1;
    let in_range_hits: u32 = total.hit[..overflow].iter().sum();
    let in_range_misses: u32 = total.miss[..overflow].iter().sum();
    if in_range_hits == 0 || in_range_misses == 0 {
        log::debug!(
            "{} hit and {} miss samples inside the histogram range",
            in_range_hits,
            in_range_misses
        );
        return None;
    }

    let predictions = ErrorPredictions::predict_errors(HistogramCumSum::from(total));
    let best = PotentialThresholds::minimizing_total_error(predictions).median()?;
    if best.threshold.miss_faster_than_hit || best.error.error_rate() >= 0.5 {
        log::debug!("rejecting threshold {:?}, {:?}", best.threshold, best.error);
        return None;
    }
    Some(ThresholdCalibration {
        threshold: best.threshold.to_cycles(bucket_size),
        error: best.error,
        hit_median: hit_medians[(hit_medians.len() - 1) / 2],
        miss_median: miss_medians[(miss_medians.len() - 1) / 2],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Deterministic latencies: hits take 40 cycles, misses 200.
    fn fake_measure(op: &CalibrateOperation, _p: *const u8) -> u64 {
        match op.prepare {
            Prepare::Access => 40,
            Prepare::Flush => 200,
        }
    }

    #[test]
    fn test_cum_sum() {
        assert_eq!(cum_sum(&[1, 0, 2, 3]), vec![1, 1, 3, 6]);
    }

    #[test]
    fn threshold_is_less_than_equal() {
        let t = Threshold::at_most(80);
        assert!(t.is_hit(80));
        assert!(t.is_hit(0));
        assert!(!t.is_hit(81));
        let inverted = Threshold {
            cycles: 80,
            miss_faster_than_hit: true,
        };
        assert!(!inverted.is_hit(80));
        assert!(inverted.is_hit(81));
    }

    #[test]
    fn bucket_threshold_covers_whole_bucket() {
        let b = BucketThreshold {
            bucket_index: 20,
            miss_faster_than_hit: false,
        };
        let t = b.to_cycles(2);
        // bucket 20 holds times 40 and 41
        assert!(t.is_hit(41));
        assert!(!t.is_hit(42));
    }

    #[test]
    fn separates_hit_and_miss() {
        let buffer = [0u8; 256];
        let params = HistParams {
            iterations: 64,
            bucket_size: 2,
            bucket_number: 256,
        };
        let results = unsafe {
            calibrate(
                buffer.as_ptr(),
                64,
                buffer.len(),
                &HIT_MISS_OPERATIONS,
                params,
                fake_measure,
            )
        };
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].median, vec![40, 200]);
        assert_eq!(results[0].min, vec![40, 200]);

        let calibration = hit_miss_threshold(results, params.bucket_size).unwrap();
        assert_eq!(calibration.error.total_error(), 0);
        assert_eq!(calibration.hit_median, 40);
        assert_eq!(calibration.miss_median, 200);
        assert!(calibration.threshold.is_hit(40));
        assert!(!calibration.threshold.is_hit(200));
        assert!(!calibration.threshold.miss_faster_than_hit);
    }

    #[test]
    fn slow_outliers_land_in_last_bucket() {
        let buffer = [0u8; 64];
        let params = HistParams {
            iterations: 10,
            bucket_size: 1,
            bucket_number: 100,
        };
        let results = unsafe {
            calibrate(
                buffer.as_ptr(),
                64,
                buffer.len(),
                &HIT_MISS_OPERATIONS,
                params,
                |_, _| 10_000,
            )
        };
        assert_eq!(results[0].histogram[HIT_INDEX][99], 10);
        assert_eq!(results[0].median, vec![0, 0]);
        assert!(hit_miss_threshold(results, params.bucket_size).is_none());
    }

    #[test]
    fn median_in_first_bucket() {
        let buffer = [0u8; 64];
        let params = HistParams {
            iterations: 10,
            bucket_size: 2,
            bucket_number: 100,
        };
        let results = unsafe {
            calibrate(
                buffer.as_ptr(),
                64,
                buffer.len(),
                &HIT_MISS_OPERATIONS,
                params,
                |op, _| match op.prepare {
                    Prepare::Access => 1,
                    Prepare::Flush => 150,
                },
            )
        };
        assert_eq!(results[0].median, vec![0, 150]);
        let calibration = hit_miss_threshold(results, params.bucket_size).unwrap();
        assert_eq!(calibration.hit_median, 0);
        assert!(calibration.threshold.is_hit(1));
        assert!(!calibration.threshold.is_hit(150));
    }

    #[test]
    fn no_threshold_when_hits_are_slower() {
        let buffer = [0u8; 64];
        let params = HistParams {
            iterations: 16,
            bucket_size: 2,
            bucket_number: 256,
        };
        let results = unsafe {
            calibrate(
                buffer.as_ptr(),
                64,
                buffer.len(),
                &HIT_MISS_OPERATIONS,
                params,
                |op, _| match op.prepare {
                    Prepare::Access => 300,
                    Prepare::Flush => 40,
                },
            )
        };
        assert!(hit_miss_threshold(results, params.bucket_size).is_none());
    }

    #[test]
    fn no_threshold_when_latencies_overlap() {
        let buffer = [0u8; 64];
        let params = HistParams {
            iterations: 16,
            bucket_size: 2,
            bucket_number: 256,
        };
        let results = unsafe {
            calibrate(
                buffer.as_ptr(),
                64,
                buffer.len(),
                &HIT_MISS_OPERATIONS,
                params,
                |_, _| 100,
            )
        };
        assert!(hit_miss_threshold(results, params.bucket_size).is_none());
    }
}
