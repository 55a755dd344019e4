//! Session-scoped telemetry log: append-only samples, durable CSV record,
//! and the post-test phase segmentation that produces the pass/fail
//! verdict.
//!
//! Segmentation slices the sample series into the four electrical phases
//! of a full test (precharge, constant current, constant voltage,
//! discharge), trims a guard margin at each boundary to exclude transition
//! noise, and checks min/max current and voltage of every phase against a
//! fixed limit band. A run whose boundaries cannot be located is a failed
//! test, not a system error.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use log::{debug, info};
use serde::Serialize;

use crate::constants::*;
use crate::error::Result;

/// One telemetry snapshot, immutable once appended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetrySample {
    /// Time since the test session started
    pub elapsed: Duration,
    pub voltage_mv: f64,
    /// Signed; positive while charging
    pub current_ma: f64,
    pub charge_mah: f64,
    /// 0 to 100
    pub charge_level_pct: f64,
    pub temperature_c: f64,
}

/// Limit band applied to one phase of the test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseLimits {
    pub i_min_ma: f64,
    pub i_max_ma: f64,
    pub v_min_mv: f64,
    pub v_max_mv: f64,
}

impl PhaseLimits {
    /// Number of bound breaches for a phase: each min below floor or max
    /// above ceiling counts once.
    fn violations(&self, stats: &PhaseStats) -> u32 {
        let mut count = 0;
        if stats.i_min_ma < self.i_min_ma {
            count += 1;
        }
        if stats.i_max_ma > self.i_max_ma {
            count += 1;
        }
        if stats.v_min_mv < self.v_min_mv {
            count += 1;
        }
        if stats.v_max_mv > self.v_max_mv {
            count += 1;
        }
        count
    }
}

/// Min/avg/max of current and voltage across one trimmed phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseStats {
    pub duration: Duration,
    pub i_min_ma: f64,
    pub i_avg_ma: f64,
    pub i_max_ma: f64,
    pub v_min_mv: f64,
    pub v_avg_mv: f64,
    pub v_max_mv: f64,
}

/// Sample indices where each electrical phase begins. `None` until the
/// boundary is detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseBoundaries {
    pub precharge_start: Option<usize>,
    pub const_current_start: Option<usize>,
    pub const_voltage_start: Option<usize>,
    pub discharge_start: Option<usize>,
}

/// Append-only telemetry record for one full test run.
///
/// Every appended sample is persisted to the CSV file in the same call, so
/// the in-memory log and the durable record never diverge within a
/// session.
pub struct TestLog {
    samples: Vec<TelemetrySample>,
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

const CSV_HEADER: &str =
    "elapsed time,elapsed time (ms),voltage (mV),current (mA),charge (mAh),charge level (%),temperature (°C)";

impl TestLog {
    /// Create a log with a fresh timestamped CSV file under `dir`.
    pub fn create(dir: &Path) -> Result<Self> {
        let fname = format!(
            "battery_test_{}.csv",
            Local::now().format("%Y-%m-%d_%H-%M-%S")
        );
        let path = dir.join(fname);
        std::fs::create_dir_all(dir)?;
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{}", CSV_HEADER)?;
        writer.flush()?;
        info!("test log started: {}", path.display());
        Ok(TestLog {
            samples: Vec::new(),
            writer: Some(writer),
            path: Some(path),
        })
    }

    /// Memory-only log, used when no durable record is wanted.
    pub fn in_memory() -> Self {
        TestLog {
            samples: Vec::new(),
            writer: None,
            path: None,
        }
    }

    /// Path of the durable record, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a sample and flush it to the durable record in the same
    /// call.
    pub fn add_result(&mut self, sample: TelemetrySample) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writeln!(
                writer,
                "{},{},{:.0},{:.0},{:.1},{:.1},{:.1}",
                format_elapsed(sample.elapsed),
                sample.elapsed.as_millis(),
                sample.voltage_mv,
                sample.current_ma,
                sample.charge_mah,
                sample.charge_level_pct,
                sample.temperature_c,
            )?;
            writer.flush()?;
        }
        self.samples.push(sample);
        Ok(())
    }

    pub fn samples(&self) -> &[TelemetrySample] {
        &self.samples
    }

    pub fn last(&self) -> Option<&TelemetrySample> {
        self.samples.last()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Elapsed test time of the newest sample.
    pub fn test_time(&self) -> Duration {
        self.last().map(|s| s.elapsed).unwrap_or_default()
    }

    /// Locate the four phase boundaries in one left-to-right scan.
    pub fn boundaries(&self) -> PhaseBoundaries {
        let mut b = PhaseBoundaries::default();
        let mut cc_sum = 0.0f64;
        let mut cc_count = 0usize;
        let mut rolling: VecDeque<f64> = VecDeque::with_capacity(ROLLING_AVG_SAMPLES);
        let mut neg_run = 0usize;

        for (i, sample) in self.samples.iter().enumerate() {
            // precharge begins when current first swings from <=0 to >0
            if b.precharge_start.is_none()
                && i > 0
                && sample.current_ma > 0.0
                && self.samples[i - 1].current_ma <= 0.0
            {
                b.precharge_start = Some(i);
                debug!("precharge start idx: {}", i);
            }

            // precharge ends once the feedback voltage threshold is crossed
            // while still charging
            if b.precharge_start.is_some()
                && b.const_current_start.is_none()
                && sample.voltage_mv > PRECHRG_END_VFB_THRESH_MV
                && sample.current_ma > 0.0
            {
                b.const_current_start = Some(i);
                debug!("constant current start idx: {}", i);
            }

            // inside the constant-current region, the charge current
            // tapering off marks the constant-voltage boundary: the rolling
            // average falls away from the overall average
            if b.const_current_start.is_some() && b.const_voltage_start.is_none() {
                cc_sum += sample.current_ma;
                cc_count += 1;
                if rolling.len() == ROLLING_AVG_SAMPLES {
                    rolling.pop_front();
                }
                rolling.push_back(sample.current_ma);
                if rolling.len() == ROLLING_AVG_SAMPLES {
                    let overall = cc_sum / cc_count as f64;
                    let recent = rolling.iter().sum::<f64>() / rolling.len() as f64;
                    if overall - recent > CONST_V_DIVERGENCE_MA {
                        b.const_voltage_start = Some(i);
                        debug!("constant voltage start idx: {}", i);
                    }
                }
            }

            // discharge begins at the first of a run of consecutive
            // negative-current samples
            if b.const_voltage_start.is_some() && b.discharge_start.is_none() {
                if sample.current_ma < 0.0 {
                    neg_run += 1;
                    if neg_run == DISCHARGE_NEG_RUN {
                        b.discharge_start = Some(i + 1 - DISCHARGE_NEG_RUN);
                        debug!("discharge start idx: {}", i + 1 - DISCHARGE_NEG_RUN);
                    }
                } else {
                    neg_run = 0;
                }
            }
        }

        b
    }

    /// Per-phase statistics after guard trimming, in phase order
    /// (precharge, constant current, constant voltage, discharge). `None`
    /// when boundaries are missing or a trimmed slice would be empty.
    pub fn phase_stats(&self) -> Option<[PhaseStats; 4]> {
        let b = self.boundaries();
        let (Some(pre), Some(cc), Some(cv), Some(dis)) = (
            b.precharge_start,
            b.const_current_start,
            b.const_voltage_start,
            b.discharge_start,
        ) else {
            return None;
        };

        Some([
            self.trimmed_stats(pre, cc, PHASE_GUARD_SAMPLES, PHASE_GUARD_SAMPLES)?,
            self.trimmed_stats(cc, cv, PHASE_GUARD_SAMPLES, PHASE_GUARD_SAMPLES)?,
            self.trimmed_stats(cv, dis, PHASE_GUARD_SAMPLES, PHASE_GUARD_SAMPLES)?,
            self.trimmed_stats(
                dis,
                self.samples.len(),
                DISCHARGE_GUARD_HEAD,
                DISCHARGE_GUARD_TAIL,
            )?,
        ])
    }

    /// Pass/fail verdict for the whole run: true iff every phase stays
    /// inside its limit band. Unlocatable boundaries fail the test.
    pub fn test_pass(&self) -> bool {
        let Some(stats) = self.phase_stats() else {
            info!("test failed: phase boundaries not found");
            return false;
        };

        let limits = [
            PRECHARGE_LIMITS,
            CONST_I_LIMITS,
            CONST_V_LIMITS,
            DISCHARGE_LIMITS,
        ];
        let violations: u32 = limits
            .iter()
            .zip(stats.iter())
            .map(|(lim, st)| lim.violations(st))
            .sum();
        if violations > 0 {
            info!("test failed: {} limit violations", violations);
        }
        violations == 0
    }

    fn trimmed_stats(
        &self,
        start: usize,
        end: usize,
        head: usize,
        tail: usize,
    ) -> Option<PhaseStats> {
        let lo = start.checked_add(head)?;
        let hi = end.checked_sub(tail)?;
        if lo >= hi || hi > self.samples.len() {
            return None;
        }
        let slice = &self.samples[lo..hi];

        let mut i_min = f64::INFINITY;
        let mut i_max = f64::NEG_INFINITY;
        let mut i_sum = 0.0;
        let mut v_min = f64::INFINITY;
        let mut v_max = f64::NEG_INFINITY;
        let mut v_sum = 0.0;
        for s in slice {
            i_min = i_min.min(s.current_ma);
            i_max = i_max.max(s.current_ma);
            i_sum += s.current_ma;
            v_min = v_min.min(s.voltage_mv);
            v_max = v_max.max(s.voltage_mv);
            v_sum += s.voltage_mv;
        }
        let n = slice.len() as f64;
        let duration = slice
            .last()
            .map(|s| s.elapsed.saturating_sub(slice[0].elapsed))
            .unwrap_or_default();
        Some(PhaseStats {
            duration,
            i_min_ma: i_min,
            i_avg_ma: i_sum / n,
            i_max_ma: i_max,
            v_min_mv: v_min,
            v_avg_mv: v_sum / n,
            v_max_mv: v_max,
        })
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(i: usize, voltage_mv: f64, current_ma: f64) -> TelemetrySample {
        TelemetrySample {
            elapsed: Duration::from_secs(i as u64),
            voltage_mv,
            current_ma,
            charge_mah: 0.0,
            charge_level_pct: 0.0,
            temperature_c: 25.0,
        }
    }

    #[test]
    fn empty_log_fails_not_panics() {
        let log = TestLog::in_memory();
        assert!(!log.test_pass());
        assert_eq!(log.boundaries(), PhaseBoundaries::default());
    }

    #[test]
    fn precharge_start_needs_a_sign_change() {
        let mut log = TestLog::in_memory();
        // positive from the very first sample: no <=0 -> >0 transition
        for i in 0..20 {
            log.add_result(sample(i, 4000.0, 150.0)).unwrap();
        }
        assert_eq!(log.boundaries().precharge_start, None);

        let mut log = TestLog::in_memory();
        for i in 0..5 {
            log.add_result(sample(i, 4000.0, -10.0)).unwrap();
        }
        for i in 5..20 {
            log.add_result(sample(i, 4000.0, 150.0)).unwrap();
        }
        assert_eq!(log.boundaries().precharge_start, Some(5));
    }

    #[test]
    fn elapsed_formats_as_hms() {
        assert_eq!(format_elapsed(Duration::from_secs(3725)), "01:02:05");
    }

    #[test]
    fn csv_row_is_flushed_per_sample() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TestLog::create(dir.path()).unwrap();
        log.add_result(sample(0, 12000.0, 1000.0)).unwrap();
        log.add_result(sample(1, 12050.0, 1001.0)).unwrap();

        let contents = std::fs::read_to_string(log.path().unwrap()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].starts_with("00:00:00,0,12000,1000,"));
        assert!(lines[2].starts_with("00:00:01,1000,12050,1001,"));
    }
}
