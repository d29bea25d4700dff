use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use dashmap::DashMap;
use relaygate_types::EndpointId;

const WINDOW_MS: i64 = 60_000;

struct Bucket {
	count: AtomicU32,
	window_start_ms: AtomicI64,
}

impl Bucket {
	fn new(now_ms: i64) -> Self {
		Self { count: AtomicU32::new(0), window_start_ms: AtomicI64::new(now_ms) }
	}
}

/// Fixed-window, per-endpoint admission counter. A window is 60 seconds wide;
/// once it has elapsed the next admission attempt for that endpoint resets
/// the counter rather than carrying remainder budget forward.
///
/// Buckets live for as long as an endpoint keeps being checked; the reaper
/// calls [`RateLimiter::evict_idle`] to drop buckets for endpoints that have
/// had no admission attempts in a while, so the table doesn't grow unbounded
/// across endpoint churn.
pub struct RateLimiter {
	buckets: DashMap<EndpointId, Bucket>,
}

impl RateLimiter {
	pub fn new() -> Self {
		Self { buckets: DashMap::new() }
	}

	/// Returns `true` if this admission attempt is allowed under `limit_rpm`.
	/// A `None` limit means unlimited and always allows, without touching the
	/// bucket table at all.
	pub fn check(&self, endpoint_id: &EndpointId, limit_rpm: Option<u32>) -> bool {
		let Some(limit) = limit_rpm else {
			return true;
		};
		if limit == 0 {
			return true;
		}
		let now_ms = now_ms();
		let bucket = self.buckets.entry(endpoint_id.clone()).or_insert_with(|| Bucket::new(now_ms));

		let window_start = bucket.window_start_ms.load(Ordering::Relaxed);
		if now_ms - window_start >= WINDOW_MS {
			bucket.window_start_ms.store(now_ms, Ordering::Relaxed);
			bucket.count.store(0, Ordering::Relaxed);
		}

		let new_count = bucket.count.fetch_add(1, Ordering::Relaxed) + 1;
		new_count <= limit
	}

	/// Drops buckets whose window started more than `idle_for_ms` ago and
	/// have seen no traffic since — called from the session manager's reaper
	/// sweep.
	pub fn evict_idle(&self, idle_for_ms: i64) {
		let now_ms = now_ms();
		self.buckets.retain(|_, bucket| now_ms - bucket.window_start_ms.load(Ordering::Relaxed) < idle_for_ms);
	}

	#[cfg(test)]
	fn bucket_count(&self, endpoint_id: &EndpointId) -> Option<u32> {
		self.buckets.get(endpoint_id).map(|b| b.count.load(Ordering::Relaxed))
	}
}

impl Default for RateLimiter {
	fn default() -> Self {
		Self::new()
	}
}

fn now_ms() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unlimited_endpoint_always_allowed() {
		let limiter = RateLimiter::new();
		let id = EndpointId::from("e1");
		for _ in 0..1000 {
			assert!(limiter.check(&id, None), "no limit configured should never reject");
		}
	}

	#[test]
	fn admits_up_to_limit_then_rejects() {
		let limiter = RateLimiter::new();
		let id = EndpointId::from("e1");
		assert!(limiter.check(&id, Some(2)), "1st attempt within limit of 2");
		assert!(limiter.check(&id, Some(2)), "2nd attempt within limit of 2");
		assert!(!limiter.check(&id, Some(2)), "3rd attempt exceeds limit of 2");
	}

	#[test]
	fn distinct_endpoints_have_independent_buckets() {
		let limiter = RateLimiter::new();
		let a = EndpointId::from("a");
		let b = EndpointId::from("b");
		assert!(limiter.check(&a, Some(1)));
		assert!(!limiter.check(&a, Some(1)), "endpoint a should be exhausted");
		assert!(limiter.check(&b, Some(1)), "endpoint b has its own independent bucket");
	}

	#[test]
	fn evict_idle_drops_stale_buckets_only() {
		let limiter = RateLimiter::new();
		let id = EndpointId::from("e1");
		limiter.check(&id, Some(5));
		assert_eq!(limiter.bucket_count(&id), Some(1));

		limiter.evict_idle(-1);
		assert_eq!(limiter.bucket_count(&id), None, "bucket with a negative idle threshold must be considered stale");
	}

	#[test]
	fn zero_limit_is_treated_as_unlimited() {
		let limiter = RateLimiter::new();
		let id = EndpointId::from("e1");
		for _ in 0..10 {
			assert!(limiter.check(&id, Some(0)), "a configured limit of zero means unlimited, not always-deny");
		}
	}
}
