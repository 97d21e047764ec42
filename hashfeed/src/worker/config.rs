//! CPU device settings from the environment.

use crate::tracing::prelude::*;

pub const THREADS_VAR: &str = "HASHFEED_CPUMINER_THREADS";
pub const DUTY_VAR: &str = "HASHFEED_CPUMINER_DUTY";

const DEFAULT_DUTY: u8 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuMinerConfig {
    /// One device (and one worker) per thread.
    pub thread_count: usize,

    /// Share of each one-second cycle spent hashing, 1-100.
    ///
    /// At 80 a device hashes for 800 ms then sleeps for 200 ms, which keeps
    /// cloud hosts from flagging sustained CPU load.
    pub duty_percent: u8,
}

impl CpuMinerConfig {
    /// Read `HASHFEED_CPUMINER_THREADS` and `HASHFEED_CPUMINER_DUTY`.
    ///
    /// CPU mining is off (`None`) unless the thread count is set to a
    /// positive number. The duty cycle defaults to 50 and is clamped.
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var(THREADS_VAR).ok()?;
        let thread_count = match raw.trim().parse::<usize>() {
            Ok(0) => return None,
            Ok(n) => n,
            Err(_) => {
                warn!(value = %raw, "Ignoring malformed {THREADS_VAR}");
                return None;
            }
        };

        let duty_percent = match std::env::var(DUTY_VAR) {
            Ok(raw) => raw.trim().parse::<u8>().unwrap_or_else(|_| {
                warn!(value = %raw, "Ignoring malformed {DUTY_VAR}");
                DEFAULT_DUTY
            }),
            Err(_) => DEFAULT_DUTY,
        }
        .clamp(1, 100);

        Some(Self {
            thread_count,
            duty_percent,
        })
    }
}
