//! Pattern-matched resend timers for dronelink.
//!
//! Links such as UDP or a radio dongle drop frames silently. A request that
//! expects an answer is therefore registered here under a [`ReplyPattern`]
//! (header byte plus the leading payload bytes the answer will start
//! with). Until a matching packet comes back, a timer keeps asking for the
//! request to be sent again.
//!
//! # Integration
//!
//! The register does not send anything itself. Fired timers post a
//! [`ResendRequest`] on the channel returned by [`RetryRegister::new`]; the
//! owner drains that channel and, for each request, calls
//! [`RetryRegister::rearm`] inside its send critical section:
//!
//! ```ignore
//! while let Some(request) = resend_rx.recv().await {
//!     let _guard = send_lock.lock().await;
//!     if let Some(packet) = register.rearm(&request) {
//!         link.send(&codec.encode(&packet)).await?;
//!     }
//! }
//! ```
//!
//! Inbound packets go through [`RetryRegister::on_packet_received`], which
//! cancels the most specific matching pattern.

mod pattern;
mod policy;

pub use pattern::ReplyPattern;
pub use policy::{Backoff, MAX_RETRY_DELAY, RetryPolicy};

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dronelink_protocol::Packet;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time;
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Resend requests
// ---------------------------------------------------------------------------

/// Posted by a timer when its pattern went unanswered for too long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendRequest {
    /// The pattern whose timer fired.
    pub pattern: ReplyPattern,
    /// Identifies the timer. A request from a timer that has since been
    /// replaced (the pattern was answered and armed again) is ignored.
    timer: u64,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Counters for the register's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryMetrics {
    /// Patterns armed by original sends.
    pub total_armed: u64,
    /// Resends handed back by [`RetryRegister::rearm`].
    pub total_resends: u64,
    /// Patterns cancelled by a matching reply.
    pub total_matched: u64,
    /// Patterns dropped because the policy's attempt budget ran out.
    pub total_given_up: u64,
    /// Resend requests ignored because their pattern was gone.
    pub total_stale: u64,
}

// ---------------------------------------------------------------------------
// Register
// ---------------------------------------------------------------------------

struct PendingRetry {
    packet: Packet,
    timeout: Duration,
    resends: u32,
    timer: u64,
    abort: AbortHandle,
}

#[derive(Default)]
struct State {
    pending: HashMap<ReplyPattern, PendingRetry>,
    next_timer: u64,
    metrics: RetryMetrics,
}

/// Outstanding requests keyed by the reply they wait for.
///
/// Invariant: at most one pending retry per distinct pattern. Timers are
/// Tokio tasks, so arming and re-arming must happen inside a runtime.
pub struct RetryRegister {
    policy: RetryPolicy,
    state: Mutex<State>,
    resend_tx: mpsc::UnboundedSender<ResendRequest>,
}

impl RetryRegister {
    /// Creates an empty register and the channel its timers post to.
    pub fn new(policy: RetryPolicy) -> (Self, mpsc::UnboundedReceiver<ResendRequest>) {
        let policy = policy.validated();
        let (resend_tx, resend_rx) = mpsc::unbounded_channel();
        debug!(
            max_attempts = ?policy.max_attempts,
            backoff = ?policy.backoff,
            jitter_ms = policy.jitter.as_secs_f64() * 1000.0,
            "retry register created"
        );
        let register = Self {
            policy,
            state: Mutex::new(State::default()),
            resend_tx,
        };
        (register, resend_rx)
    }

    /// Registers `packet` as waiting for a reply that starts with
    /// `header | prefix`, and starts its first timer.
    ///
    /// If the same pattern was already pending, the old entry and its timer
    /// are replaced.
    pub fn arm(&self, packet: &Packet, prefix: &[u8], timeout: Duration) -> ReplyPattern {
        let pattern = ReplyPattern::new(packet.header(), prefix);
        let mut state = self.lock();

        let timer = Self::next_timer(&mut state);
        let abort = self.spawn_timer(&pattern, timer, self.policy.delay(timeout, 0));
        let replaced = state.pending.insert(
            pattern.clone(),
            PendingRetry {
                packet: packet.clone(),
                timeout,
                resends: 0,
                timer,
                abort,
            },
        );
        if let Some(old) = replaced {
            old.abort.abort();
            debug!(%pattern, "replaced pending retry for same pattern");
        }
        state.metrics.total_armed += 1;

        debug!(
            %pattern,
            timeout_ms = timeout.as_secs_f64() * 1000.0,
            "sending packet and expecting pattern back"
        );
        pattern
    }

    /// Handles a fired timer.
    ///
    /// Returns the packet to send again and arms a fresh timer, or `None`
    /// when the pattern was answered meanwhile, the request came from a
    /// replaced timer, or the policy gave up.
    pub fn rearm(&self, request: &ResendRequest) -> Option<Packet> {
        let mut state = self.lock();
        let pattern = &request.pattern;

        let live = state
            .pending
            .get(pattern)
            .is_some_and(|entry| entry.timer == request.timer);
        if !live {
            state.metrics.total_stale += 1;
            debug!(%pattern, "resend requested, but no pattern registered");
            return None;
        }

        let resends = state.pending.get(pattern).map_or(0, |entry| entry.resends);
        if self.policy.exhausted(resends) {
            state.pending.remove(pattern);
            state.metrics.total_given_up += 1;
            warn!(%pattern, resends, "no reply after maximum resends, giving up");
            return None;
        }

        let timer = Self::next_timer(&mut state);
        let entry = state.pending.get_mut(pattern)?;
        let delay = self.policy.delay(entry.timeout, resends + 1);
        entry.abort = self.spawn_timer(pattern, timer, delay);
        entry.timer = timer;
        entry.resends = resends + 1;
        let packet = entry.packet.clone();
        state.metrics.total_resends += 1;

        debug!(%pattern, attempt = resends + 1, "resending for pattern");
        Some(packet)
    }

    /// Cancels the longest pending pattern that `packet` answers.
    ///
    /// Shorter patterns that also match stay pending: a caller that
    /// registered more payload bytes waits for something more specific, so
    /// it claims the reply first.
    pub fn on_packet_received(&self, packet: &Packet) -> Option<ReplyPattern> {
        let mut state = self.lock();
        if state.pending.is_empty() {
            return None;
        }

        let longest = state
            .pending
            .keys()
            .filter(|pattern| {
                trace!(%pattern, "looking for pattern match");
                pattern.matches(packet)
            })
            .max_by_key(|pattern| pattern.len())
            .cloned()?;

        if let Some(entry) = state.pending.remove(&longest) {
            entry.abort.abort();
        }
        state.metrics.total_matched += 1;
        debug!(pattern = %longest, "reply matched, retry cancelled");
        Some(longest)
    }

    /// Cancels every pending retry. Returns how many there were.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let count = state.pending.len();
        for (_, entry) in state.pending.drain() {
            entry.abort.abort();
        }
        if count > 0 {
            debug!(count, "cleared pending retries");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, pattern: &ReplyPattern) -> bool {
        self.lock().pending.contains_key(pattern)
    }

    /// Resends performed so far for `pattern`, if it is pending.
    pub fn attempts(&self, pattern: &ReplyPattern) -> Option<u32> {
        self.lock().pending.get(pattern).map(|entry| entry.resends)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Snapshot of current metrics.
    pub fn metrics(&self) -> RetryMetrics {
        self.lock().metrics.clone()
    }

    fn next_timer(state: &mut State) -> u64 {
        state.next_timer += 1;
        state.next_timer
    }

    fn spawn_timer(&self, pattern: &ReplyPattern, timer: u64, delay: Duration) -> AbortHandle {
        let tx = self.resend_tx.clone();
        let request = ResendRequest {
            pattern: pattern.clone(),
            timer,
        };
        tokio::spawn(async move {
            time::sleep(delay).await;
            // The receiver is gone only when the owner shut down.
            let _ = tx.send(request);
        })
        .abort_handle()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RetryRegister {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dronelink_protocol::Header;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn packet(header: u8, payload: &[u8]) -> Packet {
        Packet::new(Header::from_byte(header), payload)
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_registers_pattern() {
        let (register, _rx) = RetryRegister::new(RetryPolicy::default());
        let pattern = register.arm(&packet(0x20, &[1, 9]), &[1], TIMEOUT);

        assert_eq!(pattern.as_bytes(), &[0x20, 1]);
        assert!(register.is_pending(&pattern));
        assert_eq!(register.attempts(&pattern), Some(0));
        assert_eq!(register.metrics().total_armed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_same_pattern_keeps_single_entry() {
        let (register, mut rx) = RetryRegister::new(RetryPolicy::default());
        register.arm(&packet(0x20, &[1]), &[1], TIMEOUT);
        let pattern = register.arm(&packet(0x20, &[1, 2]), &[1], TIMEOUT);

        assert_eq!(register.pending_count(), 1);

        // Only the second timer survives.
        let request = rx.recv().await.unwrap();
        assert_eq!(request.pattern, pattern);
        assert_eq!(register.rearm(&request), Some(packet(0x20, &[1, 2])));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_timeout() {
        let (register, mut rx) = RetryRegister::new(RetryPolicy::default());
        let start = time::Instant::now();
        let pattern = register.arm(&packet(0x0C, &[]), &[], TIMEOUT);

        let request = rx.recv().await.unwrap();
        assert_eq!(request.pattern, pattern);
        let elapsed = start.elapsed();
        assert!(elapsed >= TIMEOUT && elapsed < TIMEOUT + Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_returns_packet_and_counts() {
        let (register, mut rx) = RetryRegister::new(RetryPolicy::default());
        let original = packet(0x30, &[7, 7]);
        let pattern = register.arm(&original, &[7], TIMEOUT);

        for expected in 1..=3 {
            let request = rx.recv().await.unwrap();
            assert_eq!(register.rearm(&request), Some(original.clone()));
            assert_eq!(register.attempts(&pattern), Some(expected));
        }
        assert_eq!(register.metrics().total_resends, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_after_match_is_dropped() {
        let (register, mut rx) = RetryRegister::new(RetryPolicy::default());
        register.arm(&packet(0x30, &[]), &[], TIMEOUT);

        let request = rx.recv().await.unwrap();
        // Reply arrives between the timer firing and the resend.
        assert!(register.on_packet_received(&packet(0x30, &[1])).is_some());

        assert_eq!(register.rearm(&request), None);
        assert_eq!(register.metrics().total_stale, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_request_from_replaced_timer_is_ignored() {
        let (register, mut rx) = RetryRegister::new(RetryPolicy::default());
        register.arm(&packet(0x30, &[]), &[], TIMEOUT);
        let stale = rx.recv().await.unwrap();

        // Answered, then the same request is sent again.
        register.on_packet_received(&packet(0x30, &[]));
        let pattern = register.arm(&packet(0x30, &[]), &[], TIMEOUT);

        assert_eq!(register.rearm(&stale), None);
        assert_eq!(register.attempts(&pattern), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capped_policy_gives_up() {
        let (register, mut rx) = RetryRegister::new(RetryPolicy::capped(2));
        let pattern = register.arm(&packet(0x40, &[]), &[], TIMEOUT);

        for _ in 0..2 {
            let request = rx.recv().await.unwrap();
            assert!(register.rearm(&request).is_some());
        }
        let request = rx.recv().await.unwrap();
        assert_eq!(register.rearm(&request), None);
        assert!(!register.is_pending(&pattern));
        assert_eq!(register.metrics().total_given_up, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_longest_match_wins() {
        let (register, _rx) = RetryRegister::new(RetryPolicy::default());
        let short = register.arm(&packet(0x50, &[]), &[], TIMEOUT);
        let long = register.arm(&packet(0x50, &[3, 1]), &[3, 1], TIMEOUT);

        let cancelled = register.on_packet_received(&packet(0x50, &[3, 1, 0xAA]));

        assert_eq!(cancelled, Some(long.clone()));
        assert!(!register.is_pending(&long));
        assert!(register.is_pending(&short));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_packet_cancels_nothing() {
        let (register, _rx) = RetryRegister::new(RetryPolicy::default());
        register.arm(&packet(0x50, &[3]), &[3], TIMEOUT);

        assert_eq!(register.on_packet_received(&packet(0x50, &[4])), None);
        assert_eq!(register.on_packet_received(&packet(0x51, &[3])), None);
        assert_eq!(register.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_timers() {
        let (register, mut rx) = RetryRegister::new(RetryPolicy::default());
        register.arm(&packet(0x10, &[]), &[], TIMEOUT);
        register.arm(&packet(0x20, &[]), &[], TIMEOUT);

        assert_eq!(register.clear(), 2);
        assert_eq!(register.pending_count(), 0);

        let fired = time::timeout(TIMEOUT * 5, rx.recv()).await;
        assert!(fired.is_err(), "cleared timers must not fire");
    }
}
