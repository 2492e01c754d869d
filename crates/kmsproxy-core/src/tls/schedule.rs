// Single retriggerable renewal deadline

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::time::Instant;

/// Delay used after every issuance and whenever no renewal window is known
pub const FALLBACK_INTERVAL: Duration = Duration::from_secs(5 * 60);

const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Clone, Copy)]
struct Deadline {
    instant: Instant,
    at: DateTime<Utc>,
}

/// The next moment the agent should look at its certificate
///
/// At most one deadline is armed. `fired` resolves once per armed deadline
/// and disarms it; while disarmed it never resolves.
#[derive(Debug, Default)]
pub struct RenewalSchedule {
    next: Option<Deadline>,
}

impl RenewalSchedule {
    pub fn new() -> Self {
        Self { next: None }
    }

    /// Arm the deadline `delay` from now, replacing any previous one
    pub fn schedule_after(&mut self, delay: Duration) -> DateTime<Utc> {
        let delay = if delay.is_zero() { FALLBACK_INTERVAL } else { delay };

        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let instant = Instant::now()
            .checked_add(delay)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);

        self.next = Some(Deadline { instant, at });
        debug!("Next renewal check at {at}");

        at
    }

    /// Arm the deadline at a wall-clock time
    ///
    /// A time that is not in the future arms the fallback interval instead.
    pub fn reschedule_at(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        let now = Utc::now();

        match (at - now).to_std() {
            Ok(delay) if !delay.is_zero() => self.schedule_after(delay),
            _ => {
                warn!("Renewal time {at} is not in the future, retrying in {FALLBACK_INTERVAL:?}");
                self.schedule_after(FALLBACK_INTERVAL)
            }
        }
    }

    pub fn cancel(&mut self) {
        self.next = None;
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.next.map(|d| d.at)
    }

    pub fn is_armed(&self) -> bool {
        self.next.is_some()
    }

    /// Wait for the armed deadline
    ///
    /// Cancel safe: dropping the future leaves the deadline armed.
    pub async fn fired(&mut self) {
        let Some(deadline) = self.next else {
            return std::future::pending().await;
        };

        tokio::time::sleep_until(deadline.instant).await;
        self.next = None;
    }
}
