//! Accounting-period lifecycle
//!
//! Per subscriber: `NO_PERIOD -> CURRENT -> CLOSED`, with a new CURRENT period
//! opened whenever one closes while the subscriber still has a plan.
//!
//! Boundaries are calendar aligned, so every subscriber on the same plan
//! shares the same windows. Transitions happen inside the caller's ledger
//! transaction; catalog lookups must therefore happen before it starts.

use crate::config::CalendarConfig;
use crate::directory::Directory;
use crate::error::{CoreError, Result};
use crate::models::{AccountingPeriod, PeriodBounds, PeriodId, Plan, ResetCadence, SubscriberId};
use crate::store::{Ledger, SqliteStore};
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Months, NaiveDate, NaiveTime, Offset, Utc, Weekday,
};
use meterboard_types::UsageSnapshot;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Length of the window used for plans that never reset
const NEVER_RESET_YEARS: u32 = 100;

/// Computes calendar-aligned period bounds in a fixed timezone
#[derive(Debug, Clone, Copy)]
pub struct PeriodCalendar {
    offset: FixedOffset,
    week_start: Weekday,
}

impl PeriodCalendar {
    pub fn new(offset: FixedOffset, week_start: Weekday) -> Self {
        Self { offset, week_start }
    }

    pub fn from_config(config: &CalendarConfig) -> Result<Self> {
        Ok(Self::new(config.offset()?, config.week_start()?))
    }

    /// UTC calendar with weeks starting on Sunday
    pub fn utc() -> Self {
        Self::new(Utc.fix(), Weekday::Sun)
    }

    /// Window containing `now` for `cadence`
    pub fn bounds(&self, now: DateTime<Utc>, cadence: ResetCadence) -> PeriodBounds {
        let today = now.with_timezone(&self.offset).date_naive();

        let (start, end) = match cadence {
            ResetCadence::Daily => (today, today + Duration::days(1)),
            ResetCadence::Weekly => {
                let days_back = (today.weekday().num_days_from_sunday() + 7
                    - self.week_start.num_days_from_sunday())
                    % 7;
                let start = today - Duration::days(i64::from(days_back));
                (start, start + Duration::days(7))
            }
            ResetCadence::Monthly => {
                let start = first_of_month(today);
                (start, first_of_month(start + Duration::days(32)))
            }
            ResetCadence::Yearly => {
                let start = first_of_year(today);
                (start, first_of_year(start + Duration::days(400)))
            }
            ResetCadence::None => {
                let end = now
                    .checked_add_months(Months::new(NEVER_RESET_YEARS * 12))
                    .unwrap_or_else(|| now + Duration::days(36_525));
                return PeriodBounds { start: now, end };
            }
        };

        PeriodBounds {
            start: self.local_midnight(start),
            end: self.local_midnight(end),
        }
    }

    fn local_midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        let local = date.and_time(NaiveTime::MIN);
        (local - Duration::seconds(i64::from(self.offset.local_minus_utc()))).and_utc()
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.day0()))
}

fn first_of_year(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.ordinal0()))
}

/// What `ensure_current` had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodTransition {
    /// A live current period already existed
    Existing,
    /// NO_PERIOD -> CURRENT
    Opened,
    /// CURRENT -> CLOSED, then a fresh CURRENT
    RolledOver { closed: PeriodId },
}

/// Result of a rollover sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub closed: usize,
    pub reopened: usize,
    pub failed: usize,
}

/// Owns the period state machine
pub struct PeriodManager {
    calendar: PeriodCalendar,
    store: Arc<SqliteStore>,
    directory: Arc<dyn Directory>,
    timeout: std::time::Duration,
}

impl PeriodManager {
    pub fn new(
        calendar: PeriodCalendar,
        store: Arc<SqliteStore>,
        directory: Arc<dyn Directory>,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            calendar,
            store,
            directory,
            timeout,
        }
    }

    pub fn calendar(&self) -> &PeriodCalendar {
        &self.calendar
    }

    /// Current period for `subscriber_id`, opening or rolling it over as needed.
    ///
    /// A period opened under another plan is rolled over like an expired one,
    /// so bounds and quota always come from the subscriber's present plan.
    /// Runs inside the caller's transaction so the read, close and insert are
    /// atomic with respect to concurrent ingestion.
    pub fn ensure_current(
        &self,
        ledger: &Ledger<'_>,
        subscriber_id: SubscriberId,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<(AccountingPeriod, PeriodTransition)> {
        match ledger.current_period(subscriber_id)? {
            None => {
                let period = self.open_in(ledger, subscriber_id, plan, now)?;
                debug!(subscriber_id, period_id = period.id, "Opened first period");
                Ok((period, PeriodTransition::Opened))
            }
            Some(period) if !period.is_expired(now) && period.plan_id == plan.id => {
                Ok((period, PeriodTransition::Existing))
            }
            Some(expired) => {
                ledger.close_period(expired.id, now)?;
                let period = self.open_in(ledger, subscriber_id, plan, now)?;
                info!(
                    subscriber_id,
                    closed = expired.id,
                    opened = period.id,
                    previous_plan = expired.plan_id,
                    plan_id = plan.id,
                    "Rolled over period"
                );
                Ok((
                    period,
                    PeriodTransition::RolledOver { closed: expired.id },
                ))
            }
        }
    }

    fn open_in(
        &self,
        ledger: &Ledger<'_>,
        subscriber_id: SubscriberId,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<AccountingPeriod> {
        let bounds = self.calendar.bounds(now, plan.reset_cadence);
        ledger.insert_period(subscriber_id, plan.id, bounds)
    }

    /// Lazily obtain the subscriber's current period
    pub fn current_period(
        &self,
        subscriber_id: SubscriberId,
        now: DateTime<Utc>,
    ) -> Result<AccountingPeriod> {
        let plan = self.plan_for(subscriber_id)?;
        self.store
            .transaction("ensure current period", self.timeout, |ledger| {
                self.ensure_current(ledger, subscriber_id, &plan, now)
            })
            .map(|(period, _)| period)
    }

    /// Eagerly start a fresh period, e.g. after a plan assignment.
    ///
    /// Any existing current period is closed first, whether or not it expired.
    pub fn open_period(
        &self,
        subscriber_id: SubscriberId,
        now: DateTime<Utc>,
    ) -> Result<AccountingPeriod> {
        let plan = self.plan_for(subscriber_id)?;
        self.store
            .transaction("open period", self.timeout, |ledger| {
                if let Some(existing) = ledger.current_period(subscriber_id)? {
                    ledger.close_period(existing.id, now)?;
                    debug!(subscriber_id, closed = existing.id, "Closed period on plan change");
                }
                self.open_in(ledger, subscriber_id, &plan, now)
            })
    }

    /// Read-only view of the current period with its node breakdown
    pub fn current_usage(&self, subscriber_id: SubscriberId) -> Result<Option<UsageSnapshot>> {
        let found = self.store.read(|ledger| {
            match ledger.current_period(subscriber_id)? {
                Some(period) => {
                    let nodes = ledger.node_usage(period.id)?;
                    Ok(Some((period, nodes)))
                }
                None => Ok(None),
            }
        })?;

        match found {
            Some((period, nodes)) => {
                let quota = self.directory.plan(period.plan_id)?.quota_bytes;
                Ok(Some(period.snapshot(quota, &nodes)))
            }
            None => Ok(None),
        }
    }

    /// Most recent periods first, each with its node breakdown
    pub fn history(&self, subscriber_id: SubscriberId, limit: usize) -> Result<Vec<UsageSnapshot>> {
        let periods = self.store.read(|ledger| {
            let mut rows = Vec::new();
            for period in ledger.period_history(subscriber_id, limit)? {
                let nodes = ledger.node_usage(period.id)?;
                rows.push((period, nodes));
            }
            Ok(rows)
        })?;

        let mut snapshots = Vec::with_capacity(periods.len());
        for (period, nodes) in periods {
            let quota = match self.directory.plan(period.plan_id) {
                Ok(plan) => plan.quota_bytes,
                // Plan deleted since the period was opened
                Err(CoreError::PlanNotFound { .. }) => 0,
                Err(e) => return Err(e),
            };
            snapshots.push(period.snapshot(quota, &nodes));
        }
        Ok(snapshots)
    }

    /// Close every current period whose end has passed and reopen it when the
    /// subscriber still has a plan. One failure does not stop the sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let expired = self.store.read(|ledger| ledger.expired_current_periods(now))?;
        let mut report = SweepReport {
            examined: expired.len(),
            ..Default::default()
        };

        for period in expired {
            match self.roll_over(&period, now) {
                Ok(reopened) => {
                    report.closed += 1;
                    if reopened {
                        report.reopened += 1;
                    }
                }
                // Already rolled by concurrent ingestion
                Err(CoreError::InvariantViolation { .. })
                    if self.was_already_closed(period.id) =>
                {
                    debug!(subscriber_id = period.subscriber_id, period_id = period.id, "Period already rolled");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        subscriber_id = period.subscriber_id,
                        period_id = period.id,
                        error = %e,
                        "Failed to roll over period"
                    );
                }
            }
        }

        if report.closed > 0 || report.failed > 0 {
            info!(
                closed = report.closed,
                reopened = report.reopened,
                failed = report.failed,
                "Period sweep finished"
            );
        }
        Ok(report)
    }

    fn roll_over(&self, period: &AccountingPeriod, now: DateTime<Utc>) -> Result<bool> {
        let plan = match self.directory.subscriber(period.subscriber_id)?.plan_id {
            Some(plan_id) => Some(self.directory.plan(plan_id)?),
            // Plan removed: the lineage stops here
            None => None,
        };

        self.store.transaction("roll over period", self.timeout, |ledger| {
            ledger.close_period(period.id, now)?;
            match &plan {
                Some(plan) => {
                    self.open_in(ledger, period.subscriber_id, plan, now)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn was_already_closed(&self, period_id: PeriodId) -> bool {
        matches!(
            self.store.read(|ledger| ledger.period(period_id)),
            Ok(Some(p)) if !p.is_current
        )
    }

    fn plan_for(&self, subscriber_id: SubscriberId) -> Result<Plan> {
        let subscriber = self.directory.subscriber(subscriber_id)?;
        match subscriber.plan_id {
            Some(plan_id) => self.directory.plan(plan_id),
            None => Err(CoreError::NoPlan { subscriber_id }),
        }
    }
}
