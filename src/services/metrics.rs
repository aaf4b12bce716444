use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::info;

/// Metrics collector for observability
pub struct EngineMetrics {
    /// Auctions started
    pub auctions_total: AtomicU64,
    /// Leads that ended Sold
    pub leads_sold: AtomicU64,
    /// Leads that ended Rejected
    pub leads_rejected: AtomicU64,
    /// Ping requests sent (per attempt)
    pub pings_sent: AtomicU64,
    /// Accepting bids that passed bounds validation
    pub bids_accepted: AtomicU64,
    /// Explicit declines
    pub bids_declined: AtomicU64,
    /// Accepting bids rejected by bounds policy
    pub bids_invalid: AtomicU64,
    /// Ping attempts that timed out
    pub ping_timeouts: AtomicU64,
    /// Ping attempts that failed for any other reason
    pub ping_errors: AtomicU64,
    /// Post requests sent (per attempt)
    pub posts_sent: AtomicU64,
    /// Deliveries confirmed by a buyer
    pub posts_delivered: AtomicU64,
    /// Post chains that ended in rejection or error
    pub post_failures: AtomicU64,
    /// Cascade steps past the first-ranked buyer
    pub failovers: AtomicU64,
    /// Buyers excluded during eligibility resolution
    pub buyers_excluded: AtomicU64,
    /// Ledger writes that failed and were dropped
    pub ledger_write_failures: AtomicU64,
    /// Terminal state of the most recent auction
    last_disposition: RwLock<String>,
    /// Last update timestamp
    last_update: RwLock<i64>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            auctions_total: AtomicU64::new(0),
            leads_sold: AtomicU64::new(0),
            leads_rejected: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            bids_accepted: AtomicU64::new(0),
            bids_declined: AtomicU64::new(0),
            bids_invalid: AtomicU64::new(0),
            ping_timeouts: AtomicU64::new(0),
            ping_errors: AtomicU64::new(0),
            posts_sent: AtomicU64::new(0),
            posts_delivered: AtomicU64::new(0),
            post_failures: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
            buyers_excluded: AtomicU64::new(0),
            ledger_write_failures: AtomicU64::new(0),
            last_disposition: RwLock::new("IDLE".to_string()),
            last_update: RwLock::new(Utc::now().timestamp()),
        }
    }

    pub fn inc_auctions(&self) {
        self.auctions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pings_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bids_accepted(&self) {
        self.bids_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bids_declined(&self) {
        self.bids_declined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bids_invalid(&self) {
        self.bids_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ping_timeouts(&self) {
        self.ping_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ping_errors(&self) {
        self.ping_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_posts_sent(&self) {
        self.posts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_posts_delivered(&self) {
        self.posts_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_post_failures(&self) {
        self.post_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failovers(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_buyers_excluded(&self) {
        self.buyers_excluded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ledger_write_failures(&self) {
        self.ledger_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an auction's terminal state.
    pub async fn record_disposition(&self, disposition: &str, sold: bool) {
        if sold {
            self.leads_sold.fetch_add(1, Ordering::Relaxed);
        } else {
            self.leads_rejected.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_disposition.write().await = disposition.to_string();
        *self.last_update.write().await = Utc::now().timestamp();
    }

    /// Get current metrics as a formatted string
    pub async fn summary(&self) -> String {
        let last = self.last_disposition.read().await;

        format!(
            r#"
=== PINGPOST DISPATCH STATUS ===
Auctions: {} | Sold: {} | Rejected: {} | Last: {}
Pings: {} sent | Bids: {} accepted, {} declined, {} invalid
Ping faults: {} timeouts, {} errors
Posts: {} sent, {} delivered, {} failed | Failovers: {}
Excluded buyers: {} | Ledger write failures: {}
================================
"#,
            self.auctions_total.load(Ordering::Relaxed),
            self.leads_sold.load(Ordering::Relaxed),
            self.leads_rejected.load(Ordering::Relaxed),
            last,
            self.pings_sent.load(Ordering::Relaxed),
            self.bids_accepted.load(Ordering::Relaxed),
            self.bids_declined.load(Ordering::Relaxed),
            self.bids_invalid.load(Ordering::Relaxed),
            self.ping_timeouts.load(Ordering::Relaxed),
            self.ping_errors.load(Ordering::Relaxed),
            self.posts_sent.load(Ordering::Relaxed),
            self.posts_delivered.load(Ordering::Relaxed),
            self.post_failures.load(Ordering::Relaxed),
            self.failovers.load(Ordering::Relaxed),
            self.buyers_excluded.load(Ordering::Relaxed),
            self.ledger_write_failures.load(Ordering::Relaxed),
        )
    }

    /// Export metrics in Prometheus format
    pub fn prometheus(&self) -> String {
        format!(
            r#"# HELP pingpost_auctions_total Auctions started
# TYPE pingpost_auctions_total counter
pingpost_auctions_total {}

# HELP pingpost_leads_sold_total Leads delivered to a winning buyer
# TYPE pingpost_leads_sold_total counter
pingpost_leads_sold_total {}

# HELP pingpost_leads_rejected_total Leads that ended without a sale
# TYPE pingpost_leads_rejected_total counter
pingpost_leads_rejected_total {}

# HELP pingpost_pings_sent_total Ping attempts sent to buyers
# TYPE pingpost_pings_sent_total counter
pingpost_pings_sent_total {}

# HELP pingpost_bids_accepted_total Valid accepting bids received
# TYPE pingpost_bids_accepted_total counter
pingpost_bids_accepted_total {}

# HELP pingpost_bids_declined_total Explicit declines received
# TYPE pingpost_bids_declined_total counter
pingpost_bids_declined_total {}

# HELP pingpost_bids_invalid_total Bids rejected by bounds policy
# TYPE pingpost_bids_invalid_total counter
pingpost_bids_invalid_total {}

# HELP pingpost_ping_timeouts_total Ping attempts that timed out
# TYPE pingpost_ping_timeouts_total counter
pingpost_ping_timeouts_total {}

# HELP pingpost_ping_errors_total Ping attempts that errored
# TYPE pingpost_ping_errors_total counter
pingpost_ping_errors_total {}

# HELP pingpost_posts_sent_total Post attempts sent to buyers
# TYPE pingpost_posts_sent_total counter
pingpost_posts_sent_total {}

# HELP pingpost_posts_delivered_total Confirmed deliveries
# TYPE pingpost_posts_delivered_total counter
pingpost_posts_delivered_total {}

# HELP pingpost_post_failures_total Post chains that failed
# TYPE pingpost_post_failures_total counter
pingpost_post_failures_total {}

# HELP pingpost_failovers_total Deliveries that moved past the top bid
# TYPE pingpost_failovers_total counter
pingpost_failovers_total {}

# HELP pingpost_buyers_excluded_total Buyers excluded at eligibility
# TYPE pingpost_buyers_excluded_total counter
pingpost_buyers_excluded_total {}

# HELP pingpost_ledger_write_failures_total Dropped ledger writes
# TYPE pingpost_ledger_write_failures_total counter
pingpost_ledger_write_failures_total {}
"#,
            self.auctions_total.load(Ordering::Relaxed),
            self.leads_sold.load(Ordering::Relaxed),
            self.leads_rejected.load(Ordering::Relaxed),
            self.pings_sent.load(Ordering::Relaxed),
            self.bids_accepted.load(Ordering::Relaxed),
            self.bids_declined.load(Ordering::Relaxed),
            self.bids_invalid.load(Ordering::Relaxed),
            self.ping_timeouts.load(Ordering::Relaxed),
            self.ping_errors.load(Ordering::Relaxed),
            self.posts_sent.load(Ordering::Relaxed),
            self.posts_delivered.load(Ordering::Relaxed),
            self.post_failures.load(Ordering::Relaxed),
            self.failovers.load(Ordering::Relaxed),
            self.buyers_excluded.load(Ordering::Relaxed),
            self.ledger_write_failures.load(Ordering::Relaxed),
        )
    }

    /// Log periodic status
    pub async fn log_status(&self) {
        info!("{}", self.summary().await);
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
