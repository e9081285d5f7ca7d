//! Streaming bandwidth budget shared by all concurrent migrations.
//!
//! A token bucket refilled in real time. Each migration acquires its
//! tablet's estimated size before its transfer is allowed to start, so
//! the aggregate streaming rate stays under the configured ceiling no
//! matter how many migrations the balancer has in flight.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use heron_common::config::BandwidthConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BandwidthError {
    /// The request can never be satisfied: larger than the whole burst
    /// capacity. Callers should acquire in smaller pieces.
    #[error("requested {requested} bytes exceeds burst capacity of {burst} bytes")]
    ExceedsBurst { requested: u64, burst: u64 },
    /// The bucket did not refill enough within the configured wait.
    #[error("timed out waiting for {requested} bytes of bandwidth budget")]
    Timeout { requested: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct BandwidthSnapshot {
    pub available_bytes: u64,
    pub burst_bytes: u64,
    pub bytes_per_sec: u64,
}

struct Bucket {
    available: f64,
    last_refill: Instant,
}

/// Token-bucket limiter. `acquire` blocks until the budget is there or
/// the wait ceiling passes; `release` returns unused budget after a
/// cancelled transfer.
pub struct BandwidthLimiter {
    config: BandwidthConfig,
    bucket: Mutex<Bucket>,
    refilled: Condvar,
}

impl BandwidthLimiter {
    pub fn new(config: BandwidthConfig) -> Self {
        let bucket = Bucket {
            available: config.burst_bytes as f64,
            last_refill: Instant::now(),
        };
        Self {
            config,
            bucket: Mutex::new(bucket),
            refilled: Condvar::new(),
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let refill = elapsed * self.config.bytes_per_sec as f64;
        bucket.available = (bucket.available + refill).min(self.config.burst_bytes as f64);
        bucket.last_refill = now;
    }

    /// Take `bytes` out of the budget without blocking.
    pub fn try_acquire(&self, bytes: u64) -> Result<(), BandwidthError> {
        if bytes > self.config.burst_bytes {
            return Err(BandwidthError::ExceedsBurst {
                requested: bytes,
                burst: self.config.burst_bytes,
            });
        }
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.available >= bytes as f64 {
            bucket.available -= bytes as f64;
            Ok(())
        } else {
            Err(BandwidthError::Timeout { requested: bytes })
        }
    }

    /// Take `bytes` out of the budget, blocking up to the configured
    /// maximum wait for the bucket to refill.
    pub fn acquire(&self, bytes: u64) -> Result<(), BandwidthError> {
        if bytes > self.config.burst_bytes {
            return Err(BandwidthError::ExceedsBurst {
                requested: bytes,
                burst: self.config.burst_bytes,
            });
        }
        let deadline = Instant::now() + Duration::from_millis(self.config.max_wait_ms);
        let mut bucket = self.bucket.lock();
        loop {
            let now = Instant::now();
            self.refill(&mut bucket, now);
            if bucket.available >= bytes as f64 {
                bucket.available -= bytes as f64;
                return Ok(());
            }
            if now >= deadline {
                return Err(BandwidthError::Timeout { requested: bytes });
            }
            // Wake either when budget is released or when enough time
            // has passed for the refill to cover the deficit.
            let deficit = bytes as f64 - bucket.available;
            let refill_wait =
                Duration::from_secs_f64(deficit / self.config.bytes_per_sec.max(1) as f64);
            let wait = refill_wait.min(deadline - now);
            let _ = self.refilled.wait_for(&mut bucket, wait);
        }
    }

    /// Return unused budget, e.g. after a migration was cancelled
    /// before its transfer started.
    pub fn release(&self, bytes: u64) {
        let mut bucket = self.bucket.lock();
        bucket.available =
            (bucket.available + bytes as f64).min(self.config.burst_bytes as f64);
        self.refilled.notify_all();
    }

    pub fn snapshot(&self) -> BandwidthSnapshot {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        BandwidthSnapshot {
            available_bytes: bucket.available as u64,
            burst_bytes: self.config.burst_bytes,
            bytes_per_sec: self.config.bytes_per_sec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bytes_per_sec: u64, burst: u64, max_wait_ms: u64) -> BandwidthConfig {
        BandwidthConfig {
            bytes_per_sec,
            burst_bytes: burst,
            max_wait_ms,
        }
    }

    #[test]
    fn test_bucket_starts_full() {
        let limiter = BandwidthLimiter::new(config(1000, 4096, 100));
        assert!(limiter.try_acquire(4096).is_ok());
        assert!(matches!(
            limiter.try_acquire(1),
            Err(BandwidthError::Timeout { .. })
        ));
    }

    #[test]
    fn test_oversized_request_rejected_up_front() {
        let limiter = BandwidthLimiter::new(config(1000, 4096, 100));
        let err = limiter.acquire(8192).unwrap_err();
        assert!(matches!(err, BandwidthError::ExceedsBurst { .. }));
    }

    #[test]
    fn test_release_returns_budget() {
        let limiter = BandwidthLimiter::new(config(1, 4096, 10));
        limiter.try_acquire(4096).unwrap();
        limiter.release(4096);
        assert!(limiter.try_acquire(4096).is_ok());
    }

    #[test]
    fn test_acquire_waits_for_refill() {
        // 1 MiB/s refill, so 10 KiB takes ~10 ms.
        let limiter = BandwidthLimiter::new(config(1 << 20, 1 << 20, 1000));
        limiter.try_acquire(1 << 20).unwrap();
        let start = Instant::now();
        limiter.acquire(10 * 1024).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_acquire_times_out() {
        let limiter = BandwidthLimiter::new(config(1, 4096, 20));
        limiter.try_acquire(4096).unwrap();
        let start = Instant::now();
        let err = limiter.acquire(4096).unwrap_err();
        assert!(matches!(err, BandwidthError::Timeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_release_never_exceeds_burst() {
        let limiter = BandwidthLimiter::new(config(1000, 4096, 100));
        limiter.release(1 << 30);
        let snap = limiter.snapshot();
        assert!(snap.available_bytes <= 4096);
    }
}
