// Analytics Aggregator - per-automation per-day counters

use autoflow_shared::{AutomationAnalytics, ContactId, DailyMetric};
use chrono::{Duration, NaiveDate};
use std::sync::Arc;
use uuid::Uuid;

use super::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::storage::{MetricDelta, MetricsStore};

const DEFAULT_RANGE_DAYS: i64 = 30;

pub struct AnalyticsAggregator {
    store: Arc<dyn MetricsStore>,
    clock: Arc<dyn Clock>,
    max_range_days: i64,
}

impl AnalyticsAggregator {
    pub fn new(store: Arc<dyn MetricsStore>, clock: Arc<dyn Clock>, max_range_days: i64) -> Self {
        Self {
            store,
            clock,
            max_range_days,
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub async fn record_trigger(&self, automation_id: Uuid, day: NaiveDate) -> EngineResult<()> {
        self.ensure_open(day)?;
        self.store.increment(automation_id, day, MetricDelta::trigger()).await
    }

    pub async fn record_message(&self, automation_id: Uuid, day: NaiveDate) -> EngineResult<()> {
        self.ensure_open(day)?;
        self.store.increment(automation_id, day, MetricDelta::message()).await
    }

    pub async fn record_contact(&self, automation_id: Uuid, day: NaiveDate, contact_id: ContactId) -> EngineResult<()> {
        self.ensure_open(day)?;
        self.store.add_contact(automation_id, day, contact_id).await?;
        Ok(())
    }

    /// Stores an externally computed conversion rate (fraction in `[0, 1]`).
    pub async fn record_conversion_rate(&self, automation_id: Uuid, day: NaiveDate, rate: f64) -> EngineResult<()> {
        if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
            return Err(EngineError::validation(
                "conversion_rate",
                "conversion_rate must be between 0 and 1",
            ));
        }
        self.ensure_open(day)?;
        self.store.set_conversion_rate(automation_id, day, rate).await
    }

    /// One row per day in the range, ascending, zero-filled.
    pub async fn query(
        &self,
        automation_id: Uuid,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> EngineResult<Vec<DailyMetric>> {
        let (start, end) = self.resolve_range(start, end)?;
        let stored = self.store.fetch(automation_id, start, end).await?;
        Ok(zero_fill(start, end, stored))
    }

    pub async fn summarize(
        &self,
        automation_id: Uuid,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> EngineResult<AutomationAnalytics> {
        let (start, end) = self.resolve_range(start, end)?;
        let stored = self.store.fetch(automation_id, start, end).await?;

        let total_triggers = stored.iter().map(|m| m.triggers_count).sum();
        let total_messages = stored.iter().map(|m| m.messages_sent).sum();
        let avg_conversion_rate = if stored.is_empty() {
            0.0
        } else {
            stored.iter().map(|m| m.conversion_rate).sum::<f64>() / stored.len() as f64
        };

        Ok(AutomationAnalytics {
            total_triggers,
            total_messages,
            avg_conversion_rate,
            daily_metrics: zero_fill(start, end, stored),
        })
    }

    fn ensure_open(&self, day: NaiveDate) -> EngineResult<()> {
        let today = self.today();
        if day < today {
            return Err(EngineError::validation("date", "metrics for past days are frozen"));
        }
        if day > today {
            return Err(EngineError::validation("date", "cannot record metrics for a future day"));
        }
        Ok(())
    }

    fn resolve_range(&self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> EngineResult<(NaiveDate, NaiveDate)> {
        let end = end.unwrap_or_else(|| self.today());
        let start = start.unwrap_or(end - Duration::days(DEFAULT_RANGE_DAYS));

        if start > end {
            return Err(EngineError::validation("start_date", "start_date must not be after end_date"));
        }
        if (end - start).num_days() + 1 > self.max_range_days {
            return Err(EngineError::validation(
                "end_date",
                format!("date range cannot exceed {} days", self.max_range_days),
            ));
        }
        Ok((start, end))
    }
}

fn zero_fill(start: NaiveDate, end: NaiveDate, stored: Vec<DailyMetric>) -> Vec<DailyMetric> {
    let mut stored = stored.into_iter().peekable();

    start
        .iter_days()
        .take_while(|day| *day <= end)
        .map(|day| match stored.next_if(|m| m.date == day) {
            Some(metric) => metric,
            None => DailyMetric::empty(day),
        })
        .collect()
}
