//! Daily delivery caps per (buyer, service, ZIP) entitlement.
//!
//! Caps count *delivered* leads, not pings: a buyer that bids and loses
//! has consumed none of its cap. Counters are keyed by UTC calendar day
//! and roll over lazily on first touch after midnight.

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;

type CapKey = (String, String, String);

#[derive(Debug, Clone, Copy)]
struct CapCell {
    day: NaiveDate,
    delivered: u32,
}

#[derive(Debug, Default)]
pub struct DailyCapTracker {
    counts: DashMap<CapKey, CapCell>,
}

impl DailyCapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leads delivered against this entitlement so far today (UTC).
    pub fn delivered_today(&self, buyer_id: &str, service_type_id: &str, zip: &str) -> u32 {
        self.delivered_on(Utc::now().date_naive(), buyer_id, service_type_id, zip)
    }

    /// Whether one more delivery would still be within `cap`.
    /// `None` means the entitlement is uncapped.
    ///
    /// Check-then-act: the counter only moves on `record_delivery`, so
    /// concurrent auctions that each pass this gate at cap-1 can
    /// overshoot the cap by at most the number of in-flight auctions
    /// for the entitlement.
    pub fn has_capacity(
        &self,
        buyer_id: &str,
        service_type_id: &str,
        zip: &str,
        cap: Option<u32>,
    ) -> bool {
        match cap {
            None => true,
            Some(cap) => self.delivered_today(buyer_id, service_type_id, zip) < cap,
        }
    }

    /// Count one delivered lead. Called only after a post succeeds.
    pub fn record_delivery(&self, buyer_id: &str, service_type_id: &str, zip: &str) {
        self.record_on(Utc::now().date_naive(), buyer_id, service_type_id, zip);
    }

    fn delivered_on(
        &self,
        day: NaiveDate,
        buyer_id: &str,
        service_type_id: &str,
        zip: &str,
    ) -> u32 {
        let key = (
            buyer_id.to_string(),
            service_type_id.to_string(),
            zip.to_string(),
        );
        match self.counts.get(&key) {
            Some(cell) if cell.day == day => cell.delivered,
            _ => 0,
        }
    }

    fn record_on(&self, day: NaiveDate, buyer_id: &str, service_type_id: &str, zip: &str) {
        let key = (
            buyer_id.to_string(),
            service_type_id.to_string(),
            zip.to_string(),
        );
        let mut cell = self.counts.entry(key).or_insert(CapCell { day, delivered: 0 });
        if cell.day != day {
            cell.day = day;
            cell.delivered = 0;
        }
        cell.delivered += 1;
    }
}
