//! SLA and error-budget calculation.
//!
//! `calculate` is a pure function over check rows. Whether a result has enough
//! data behind it to be trusted is decided separately by `SlaPolicy`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{CheckRecord, DbError, TargetStore};

/// Tolerance for comparing uptime fractions; 999/1000 meets a 99.9% target.
const UPTIME_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlaPeriod {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl SlaPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlaPeriod::Daily => "daily",
            SlaPeriod::Weekly => "weekly",
            SlaPeriod::Monthly => "monthly",
            SlaPeriod::Quarterly => "quarterly",
            SlaPeriod::Yearly => "yearly",
        }
    }

    /// Nominal length of the period in minutes.
    pub fn minutes(&self) -> f64 {
        match self {
            SlaPeriod::Daily => 1_440.0,
            SlaPeriod::Weekly => 10_080.0,
            SlaPeriod::Monthly => 43_200.0,
            SlaPeriod::Quarterly => 129_600.0,
            SlaPeriod::Yearly => 525_600.0,
        }
    }

    /// Start of the period containing `now` (UTC).
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = |y: i32, m: u32, d: u32| {
            Utc.with_ymd_and_hms(y, m, d, 0, 0, 0)
                .single()
                .unwrap_or(now)
        };
        match self {
            SlaPeriod::Daily => midnight(now.year(), now.month(), now.day()),
            SlaPeriod::Weekly => {
                let today = midnight(now.year(), now.month(), now.day());
                today - Duration::days(now.weekday().num_days_from_monday() as i64)
            }
            SlaPeriod::Monthly => midnight(now.year(), now.month(), 1),
            SlaPeriod::Quarterly => midnight(now.year(), (now.month0() / 3) * 3 + 1, 1),
            SlaPeriod::Yearly => midnight(now.year(), 1, 1),
        }
    }

    /// Half-open window `[start, now)`.
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.window_start(now), now)
    }

    /// Minimum first-to-last check span before a result is trusted.
    pub fn min_coverage(&self) -> Duration {
        match self {
            SlaPeriod::Daily => Duration::hours(1),
            SlaPeriod::Weekly => Duration::hours(6),
            SlaPeriod::Monthly => Duration::hours(24),
            SlaPeriod::Quarterly => Duration::hours(72),
            SlaPeriod::Yearly => Duration::hours(168),
        }
    }
}

impl fmt::Display for SlaPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlaPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(SlaPeriod::Daily),
            "weekly" => Ok(SlaPeriod::Weekly),
            "monthly" => Ok(SlaPeriod::Monthly),
            "quarterly" => Ok(SlaPeriod::Quarterly),
            "yearly" => Ok(SlaPeriod::Yearly),
            other => Err(format!("unknown SLA period: {}", other)),
        }
    }
}

/// An uptime objective, e.g. 99.9% monthly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaTarget {
    /// Percentage, e.g. `99.9`.
    pub percentage: f64,
    pub period: SlaPeriod,
    pub label: String,
}

impl SlaTarget {
    pub fn new(percentage: f64, period: SlaPeriod) -> Self {
        Self {
            percentage,
            period,
            label: format!("{}% {}", percentage, period),
        }
    }

    pub fn fraction(&self) -> f64 {
        self.percentage / 100.0
    }
}

/// Objectives evaluated for every target by the breach sweep and the SLA report.
pub fn default_catalog() -> Vec<SlaTarget> {
    vec![
        SlaTarget::new(99.9, SlaPeriod::Monthly),
        SlaTarget::new(99.5, SlaPeriod::Monthly),
        SlaTarget::new(99.0, SlaPeriod::Weekly),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlaStatus {
    Met,
    Breached,
    /// Not enough data to say either way.
    Undetermined,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlaCalculation {
    pub target_id: i64,
    pub label: String,
    pub period: SlaPeriod,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// `None` when there are no checks in the window.
    pub actual_uptime: Option<f64>,
    pub target_uptime: f64,
    pub status: SlaStatus,
    pub allowed_downtime_minutes: f64,
    pub actual_downtime_minutes: Option<f64>,
    /// Negative when the budget is exhausted.
    pub remaining_budget_minutes: Option<f64>,
    pub total_checks: usize,
    pub up_checks: usize,
    pub down_checks: usize,
    pub first_check_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
}

impl SlaCalculation {
    pub fn is_met(&self) -> bool {
        self.status == SlaStatus::Met
    }

    pub fn is_breached(&self) -> bool {
        self.status == SlaStatus::Breached
    }
}

/// Compute every objective in `targets` over the `period` window ending at `now`.
///
/// Uptime is `up / total` over raw check counts in `[start, now)`; zero checks
/// yield `Undetermined` with no uptime.
pub fn calculate(
    target_id: i64,
    checks: &[CheckRecord],
    targets: &[SlaTarget],
    period: SlaPeriod,
    now: DateTime<Utc>,
) -> Vec<SlaCalculation> {
    let (start, end) = period.window(now);
    let in_window: Vec<&CheckRecord> = checks
        .iter()
        .filter(|c| c.checked_at >= start && c.checked_at < end)
        .collect();

    let total = in_window.len();
    let up = in_window.iter().filter(|c| c.is_up()).count();
    let first = in_window.iter().map(|c| c.checked_at).min();
    let last = in_window.iter().map(|c| c.checked_at).max();
    let actual = (total > 0).then(|| up as f64 / total as f64);
    let period_minutes = period.minutes();

    targets
        .iter()
        .map(|sla| {
            let target_fraction = sla.fraction();
            let allowed = period_minutes * (1.0 - target_fraction);
            let actual_downtime = actual.map(|a| period_minutes * (1.0 - a));
            let status = match actual {
                None => SlaStatus::Undetermined,
                Some(a) if a + UPTIME_EPSILON >= target_fraction => SlaStatus::Met,
                Some(_) => SlaStatus::Breached,
            };
            SlaCalculation {
                target_id,
                label: sla.label.clone(),
                period,
                window_start: start,
                window_end: end,
                actual_uptime: actual,
                target_uptime: target_fraction,
                status,
                allowed_downtime_minutes: allowed,
                actual_downtime_minutes: actual_downtime,
                remaining_budget_minutes: actual_downtime.map(|d| allowed - d),
                total_checks: total,
                up_checks: up,
                down_checks: total - up,
                first_check_at: first,
                last_check_at: last,
            }
        })
        .collect()
}

/// Evaluate a mixed-period catalog, each objective over its own period.
pub fn calculate_catalog(
    target_id: i64,
    checks: &[CheckRecord],
    catalog: &[SlaTarget],
    now: DateTime<Utc>,
) -> Vec<SlaCalculation> {
    catalog
        .iter()
        .flat_map(|sla| calculate(target_id, checks, std::slice::from_ref(sla), sla.period, now))
        .collect()
}

/// Calculations that did not meet their objective. Undetermined results are never breaches.
pub fn detect_breaches(calculations: &[SlaCalculation]) -> Vec<SlaCalculation> {
    calculations
        .iter()
        .filter(|c| c.is_breached())
        .cloned()
        .collect()
}

/// Sample-sufficiency rule applied before a calculation is shown or alerted on.
#[derive(Debug, Clone, Copy)]
pub struct SlaPolicy {
    pub min_checks: usize,
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self { min_checks: 3 }
    }
}

impl SlaPolicy {
    pub fn is_sufficient(&self, calc: &SlaCalculation) -> bool {
        if calc.total_checks < self.min_checks {
            return false;
        }
        match (calc.first_check_at, calc.last_check_at) {
            (Some(first), Some(last)) => last - first >= calc.period.min_coverage(),
            _ => false,
        }
    }

    /// Downgrade insufficiently sampled calculations to `Undetermined`.
    pub fn apply(&self, mut calc: SlaCalculation) -> SlaCalculation {
        if !self.is_sufficient(&calc) {
            calc.status = SlaStatus::Undetermined;
        }
        calc
    }
}

/// Load checks for the widest window in `catalog` and evaluate it under `policy`.
pub fn evaluate_target(
    store: &dyn TargetStore,
    target_id: i64,
    catalog: &[SlaTarget],
    policy: &SlaPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<SlaCalculation>, DbError> {
    let Some(earliest) = catalog.iter().map(|s| s.period.window_start(now)).min() else {
        return Ok(Vec::new());
    };
    let checks = store.get_checks(target_id, earliest, now)?;
    Ok(calculate_catalog(target_id, &checks, catalog, now)
        .into_iter()
        .map(|c| policy.apply(c))
        .collect())
}
