use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::models::{PriceCycle, PricePoint, END_REASON_DRAWDOWN};

/// What a price sample does to the open cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStep {
    /// No cycle yet: open one at this sample
    Open,
    /// Price exceeded the peak
    NewPeak,
    /// Drawdown reached: close and open the successor at this sample
    Close,
    Unchanged,
    /// Sample is older than the last one applied
    Ignored,
}

/// Classify a sample against the currently open cycle.
pub fn step(cycle: Option<&PriceCycle>, point: &PricePoint) -> CycleStep {
    let Some(cycle) = cycle else {
        return CycleStep::Open;
    };

    if point.timestamp < cycle.last_sample_time {
        CycleStep::Ignored
    } else if point.price > cycle.peak_price {
        CycleStep::NewPeak
    } else if point.price <= cycle.drawdown_floor() {
        CycleStep::Close
    } else {
        CycleStep::Unchanged
    }
}

/// Cycle changes produced by one sample.
#[derive(Debug, Clone)]
pub enum CycleEvent {
    Opened(PriceCycle),
    Closed { closed: PriceCycle, next: PriceCycle },
}

/// Result of applying one sample to every tracked threshold.
#[derive(Debug, Default)]
pub struct SampleOutcome {
    pub events: Vec<CycleEvent>,
    /// Thresholds whose update failed; re-applying the same sample is safe
    pub failed: Vec<Decimal>,
}

impl SampleOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Tracker liveness based on sample arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerHealth {
    Healthy,
    /// No sample within the staleness window; cycles stay open
    Degraded { silent_for_secs: i64 },
}

/// Maintains the open cycle of one asset for a set of thresholds.
///
/// The database is authoritative; the in-memory copy is a cache that is
/// reloaded whenever a conditional write reports a conflict.
pub struct CycleTracker {
    db: Database,
    asset: String,
    thresholds: Vec<Decimal>,
    open: HashMap<Decimal, PriceCycle>,
    last_sample_at: Option<DateTime<Utc>>,
    staleness: Duration,
}

impl CycleTracker {
    pub fn new(db: Database, asset: impl Into<String>, staleness_secs: i64) -> Self {
        Self {
            db,
            asset: asset.into(),
            thresholds: Vec::new(),
            open: HashMap::new(),
            last_sample_at: None,
            staleness: Duration::seconds(staleness_secs),
        }
    }

    /// Replace the tracked thresholds, keeping cached cycles of retained ones.
    pub fn set_thresholds(&mut self, thresholds: impl IntoIterator<Item = Decimal>) {
        let mut normalized: Vec<Decimal> = thresholds.into_iter().map(|t| t.normalize()).collect();
        normalized.sort();
        normalized.dedup();
        self.open.retain(|t, _| normalized.contains(t));
        self.thresholds = normalized;
    }

    pub fn thresholds(&self) -> &[Decimal] {
        &self.thresholds
    }

    /// Time of the newest sample already applied to the tracked cycles.
    pub async fn resume_point(&self) -> Result<Option<DateTime<Utc>>> {
        let mut latest = None;
        for threshold in &self.thresholds {
            if let Some(cycle) = self.db.get_open_cycle(&self.asset, *threshold).await? {
                latest = latest.max(Some(cycle.last_sample_time));
            }
        }
        Ok(latest)
    }

    /// Apply one price sample to every tracked threshold.
    ///
    /// Thresholds are independent: a storage failure on one is recorded in
    /// the outcome and the rest are still applied.
    pub async fn on_price(&mut self, point: &PricePoint) -> SampleOutcome {
        let mut outcome = SampleOutcome::default();
        if point.asset != self.asset {
            return outcome;
        }
        self.last_sample_at = self.last_sample_at.max(Some(point.timestamp));

        for threshold in self.thresholds.clone() {
            match self.apply(threshold, point).await {
                Ok(Some(event)) => outcome.events.push(event),
                Ok(None) => {}
                Err(e) => {
                    error!(
                        asset = %self.asset,
                        threshold = %threshold,
                        timestamp = %point.timestamp,
                        error = %e,
                        "Failed to apply price sample"
                    );
                    // Re-read from storage on the retry
                    self.open.remove(&threshold);
                    outcome.failed.push(threshold);
                }
            }
        }
        outcome
    }

    async fn apply(&mut self, threshold: Decimal, point: &PricePoint) -> Result<Option<CycleEvent>> {
        let cycle = match self.open.get(&threshold) {
            Some(cycle) => Some(cycle.clone()),
            None => self.db.get_open_cycle(&self.asset, threshold).await?,
        };

        match step(cycle.as_ref(), point) {
            CycleStep::Open => {
                let opened = self.db.open_cycle(threshold, point).await?;
                info!(
                    asset = %self.asset,
                    threshold = %threshold,
                    cycle_id = opened.id,
                    price = %opened.start_price,
                    "Cycle opened"
                );
                self.open.insert(threshold, opened.clone());
                Ok(Some(CycleEvent::Opened(opened)))
            }
            CycleStep::NewPeak => {
                let Some(mut cycle) = cycle else {
                    return Ok(None);
                };
                if self.db.raise_cycle_peak(&cycle, point.price, point.timestamp).await? {
                    cycle.peak_price = point.price;
                    cycle.peak_time = point.timestamp;
                    cycle.last_sample_time = point.timestamp;
                    debug!(cycle_id = cycle.id, peak = %cycle.peak_price, "New cycle peak");
                    self.open.insert(threshold, cycle);
                } else {
                    self.reload(threshold).await?;
                }
                Ok(None)
            }
            CycleStep::Close => {
                let Some(mut closed) = cycle else {
                    return Ok(None);
                };
                match self.db.roll_cycle(&closed, point, END_REASON_DRAWDOWN).await? {
                    Some(next) => {
                        closed.end_time = Some(point.timestamp);
                        closed.end_reason = Some(END_REASON_DRAWDOWN.to_string());
                        closed.last_sample_time = point.timestamp;
                        info!(
                            asset = %self.asset,
                            threshold = %threshold,
                            closed_id = closed.id,
                            peak = %closed.peak_price,
                            close_price = %point.price,
                            next_id = next.id,
                            "Cycle closed on drawdown"
                        );
                        self.open.insert(threshold, next.clone());
                        Ok(Some(CycleEvent::Closed { closed, next }))
                    }
                    None => {
                        self.reload(threshold).await?;
                        Ok(None)
                    }
                }
            }
            CycleStep::Unchanged => {
                if let Some(mut cycle) = cycle {
                    self.db.touch_cycle(cycle.id, point.timestamp).await?;
                    cycle.last_sample_time = point.timestamp;
                    self.open.insert(threshold, cycle);
                }
                Ok(None)
            }
            CycleStep::Ignored => {
                debug!(
                    asset = %self.asset,
                    timestamp = %point.timestamp,
                    "Ignoring out-of-order price sample"
                );
                Ok(None)
            }
        }
    }

    async fn reload(&mut self, threshold: Decimal) -> Result<()> {
        warn!(asset = %self.asset, threshold = %threshold, "Cycle changed concurrently, reloading");
        match self.db.get_open_cycle(&self.asset, threshold).await? {
            Some(cycle) => {
                self.open.insert(threshold, cycle);
            }
            None => {
                self.open.remove(&threshold);
            }
        }
        Ok(())
    }

    /// Open cycle for `threshold`, read from storage.
    pub async fn current_open_cycle(&self, threshold: Decimal) -> Result<Option<PriceCycle>> {
        self.db.get_open_cycle(&self.asset, threshold).await
    }

    /// Any cycle by id, open or closed.
    pub async fn cycle(&self, id: i64) -> Result<Option<PriceCycle>> {
        self.db.get_cycle(id).await
    }

    pub fn health(&self, now: DateTime<Utc>) -> TrackerHealth {
        match self.last_sample_at {
            Some(last) if now - last <= self.staleness => TrackerHealth::Healthy,
            Some(last) => TrackerHealth::Degraded {
                silent_for_secs: (now - last).num_seconds(),
            },
            None => TrackerHealth::Degraded { silent_for_secs: -1 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn point(price: Decimal, secs: i64) -> PricePoint {
        PricePoint::new("BTC", price, t(secs))
    }

    fn open_at(price: Decimal, threshold: Decimal) -> PriceCycle {
        PriceCycle {
            id: 1,
            asset: "BTC".to_string(),
            threshold,
            start_time: t(0),
            start_price: price,
            peak_price: price,
            peak_time: t(0),
            last_sample_time: t(0),
            end_time: None,
            end_reason: None,
        }
    }

    #[test]
    fn test_step_classification() {
        let cycle = open_at(dec!(100), dec!(0.01));
        assert_eq!(step(None, &point(dec!(100), 0)), CycleStep::Open);
        assert_eq!(step(Some(&cycle), &point(dec!(100.01), 1)), CycleStep::NewPeak);
        assert_eq!(step(Some(&cycle), &point(dec!(99.5), 1)), CycleStep::Unchanged);
        // Exactly at the floor closes
        assert_eq!(step(Some(&cycle), &point(dec!(99), 1)), CycleStep::Close);
        assert_eq!(step(Some(&cycle), &point(dec!(90), -1)), CycleStep::Ignored);
    }

    #[tokio::test]
    async fn test_drawdown_sequence_closes_and_reopens() {
        let db = Database::in_memory().await.unwrap();
        let mut tracker = CycleTracker::new(db.clone(), "BTC", 120);
        tracker.set_thresholds([dec!(0.01)]);

        let prices = [dec!(100), dec!(100.5), dec!(101), dec!(100.2), dec!(99.6)];
        let mut events = Vec::new();
        for (i, price) in prices.into_iter().enumerate() {
            events.extend(tracker.on_price(&point(price, i as i64)).await.events);
        }

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], CycleEvent::Opened(c) if c.start_price == dec!(100)));
        let CycleEvent::Closed { closed, next } = &events[1] else {
            panic!("expected close");
        };
        assert_eq!(closed.peak_price, dec!(101));
        assert_eq!(closed.end_time, Some(t(4)));
        assert_eq!(next.start_price, dec!(99.6));
        assert_eq!(next.start_time, t(4));

        let stored = tracker.cycle(closed.id).await.unwrap().unwrap();
        assert_eq!(stored.peak_price, dec!(101));
        assert_eq!(stored.end_time, Some(t(4)));
        assert_eq!(stored.end_reason.as_deref(), Some(END_REASON_DRAWDOWN));
        assert!(tracker.cycle(next.id).await.unwrap().unwrap().is_open());
        assert!(tracker.cycle(next.id + 100).await.unwrap().is_none());

        let open = tracker.current_open_cycle(dec!(0.01)).await.unwrap().unwrap();
        assert_eq!(open.id, next.id);
        assert_eq!(tracker.resume_point().await.unwrap(), Some(t(4)));
    }

    #[tokio::test]
    async fn test_thresholds_track_independently() {
        let db = Database::in_memory().await.unwrap();
        let mut tracker = CycleTracker::new(db.clone(), "BTC", 120);
        tracker.set_thresholds([dec!(0.01), dec!(0.05), dec!(0.010)]);
        assert_eq!(tracker.thresholds().len(), 2);

        for (i, price) in [dec!(100), dec!(98)].into_iter().enumerate() {
            tracker.on_price(&point(price, i as i64)).await;
        }

        let tight = tracker.current_open_cycle(dec!(0.01)).await.unwrap().unwrap();
        let wide = tracker.current_open_cycle(dec!(0.05)).await.unwrap().unwrap();
        assert_eq!(tight.start_price, dec!(98));
        assert_eq!(wide.start_price, dec!(100));
    }

    #[tokio::test]
    async fn test_failed_threshold_does_not_block_others() {
        let db = Database::in_memory().await.unwrap();
        let mut tracker = CycleTracker::new(db.clone(), "BTC", 120);
        tracker.set_thresholds([dec!(0.01), dec!(0.02)]);
        tracker.on_price(&point(dec!(100), 0)).await;

        db.execute_sql(
            "CREATE TRIGGER fail_tight_close BEFORE UPDATE OF end_time ON price_cycles \
             WHEN OLD.threshold = '0.01' BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
        )
        .await
        .unwrap();

        // Both floors are broken; only the wide close can be stored
        let outcome = tracker.on_price(&point(dec!(97.5), 1)).await;
        assert!(!outcome.is_complete());
        assert_eq!(outcome.failed, vec![dec!(0.01)]);
        assert_eq!(outcome.events.len(), 1);
        let CycleEvent::Closed { closed, next: wide } = &outcome.events[0] else {
            panic!("expected close");
        };
        assert_eq!(closed.threshold, dec!(0.02));
        let tight = tracker.current_open_cycle(dec!(0.01)).await.unwrap().unwrap();
        assert_eq!(tight.start_price, dec!(100));

        // Re-applying the sample closes the tight cycle and leaves the wide one as is
        db.execute_sql("DROP TRIGGER fail_tight_close").await.unwrap();
        let retry = tracker.on_price(&point(dec!(97.5), 1)).await;
        assert!(retry.is_complete());
        assert_eq!(retry.events.len(), 1);
        assert!(matches!(&retry.events[0], CycleEvent::Closed { closed, .. } if closed.id == tight.id));

        let tight = tracker.current_open_cycle(dec!(0.01)).await.unwrap().unwrap();
        assert_eq!(tight.start_price, dec!(97.5));
        let still_wide = tracker.current_open_cycle(dec!(0.02)).await.unwrap().unwrap();
        assert_eq!(still_wide.id, wide.id);
    }

    #[tokio::test]
    async fn test_out_of_order_sample_ignored() {
        let db = Database::in_memory().await.unwrap();
        let mut tracker = CycleTracker::new(db, "BTC", 120);
        tracker.set_thresholds([dec!(0.01)]);

        tracker.on_price(&point(dec!(100), 10)).await;
        let events = tracker.on_price(&point(dec!(50), 5)).await.events;
        assert!(events.is_empty());
        let open = tracker.current_open_cycle(dec!(0.01)).await.unwrap().unwrap();
        assert_eq!(open.start_price, dec!(100));
    }

    #[tokio::test]
    async fn test_restart_resumes_open_cycle() {
        let db = Database::in_memory().await.unwrap();
        let mut first = CycleTracker::new(db.clone(), "BTC", 120);
        first.set_thresholds([dec!(0.01)]);
        first.on_price(&point(dec!(100), 0)).await;
        first.on_price(&point(dec!(102), 1)).await;

        let mut second = CycleTracker::new(db.clone(), "BTC", 120);
        second.set_thresholds([dec!(0.01)]);
        let events = second.on_price(&point(dec!(100.9), 2)).await.events;
        assert!(matches!(&events[0], CycleEvent::Closed { closed, .. } if closed.peak_price == dec!(102)));
    }

    #[tokio::test]
    async fn test_health_degrades_without_samples() {
        let db = Database::in_memory().await.unwrap();
        let mut tracker = CycleTracker::new(db, "BTC", 120);
        tracker.set_thresholds([dec!(0.01)]);
        assert!(matches!(tracker.health(t(0)), TrackerHealth::Degraded { .. }));

        tracker.on_price(&point(dec!(100), 0)).await;
        assert_eq!(tracker.health(t(60)), TrackerHealth::Healthy);
        assert_eq!(
            tracker.health(t(300)),
            TrackerHealth::Degraded { silent_for_secs: 300 }
        );
    }

    /// Pure replay of `step` over a price path.
    fn simulate(prices: &[Decimal], threshold: Decimal) -> (Vec<PriceCycle>, PriceCycle) {
        let mut closed = Vec::new();
        let mut current: Option<PriceCycle> = None;
        for (i, price) in prices.iter().enumerate() {
            let p = point(*price, i as i64);
            match step(current.as_ref(), &p) {
                CycleStep::Open => {
                    let mut c = open_at(*price, threshold);
                    c.start_time = p.timestamp;
                    c.last_sample_time = p.timestamp;
                    current = Some(c);
                }
                CycleStep::NewPeak => {
                    if let Some(c) = current.as_mut() {
                        c.peak_price = p.price;
                        c.peak_time = p.timestamp;
                        c.last_sample_time = p.timestamp;
                    }
                }
                CycleStep::Close => {
                    if let Some(mut c) = current.take() {
                        c.end_time = Some(p.timestamp);
                        closed.push(c);
                    }
                    let mut next = open_at(*price, threshold);
                    next.start_time = p.timestamp;
                    next.last_sample_time = p.timestamp;
                    current = Some(next);
                }
                CycleStep::Unchanged => {
                    if let Some(c) = current.as_mut() {
                        c.last_sample_time = p.timestamp;
                    }
                }
                CycleStep::Ignored => unreachable!("timestamps are increasing"),
            }
        }
        (closed, current.expect("at least one sample"))
    }

    proptest! {
        #[test]
        fn prop_cycles_respect_peak_and_drawdown(
            cents in prop::collection::vec(9_000i64..11_000, 1..200),
            threshold_bps in 10i64..500,
        ) {
            let prices: Vec<Decimal> = cents.iter().map(|c| Decimal::new(*c, 2)).collect();
            let threshold = Decimal::new(threshold_bps, 4);
            let (closed, open) = simulate(&prices, threshold);

            for cycle in closed.iter().chain(std::iter::once(&open)) {
                prop_assert!(cycle.peak_price >= cycle.start_price);
            }

            // Successive cycles are contiguous: each starts where the previous ended
            for pair in closed.windows(2) {
                prop_assert_eq!(pair[0].end_time, Some(pair[1].start_time));
            }

            // Each closing sample reached the drawdown floor; no earlier sample did
            let mut idx = 0usize;
            for cycle in &closed {
                let start = (cycle.start_time - t(0)).num_seconds() as usize;
                let end = (cycle.end_time.unwrap() - t(0)).num_seconds() as usize;
                let peak = prices[start..end].iter().copied().max().unwrap();
                prop_assert_eq!(cycle.peak_price, peak);
                prop_assert!(prices[end] <= peak * (Decimal::ONE - threshold));
                let mut running = prices[start];
                for price in &prices[start + 1..end] {
                    running = running.max(*price);
                    prop_assert!(*price > running * (Decimal::ONE - threshold));
                }
                idx = end;
            }
            prop_assert_eq!((open.start_time - t(0)).num_seconds() as usize, idx);
        }
    }
}
