//! Host port selection from the two reserved ranges.
//!
//! The runtime stays authoritative: a requested port that turns out to be
//! taken is reported by the engine, and whatever it actually binds is what
//! gets recorded.

use std::collections::HashSet;
use std::ops::RangeInclusive;

use rand::Rng;

use labvm_core::{LabVmError, LabVmResult};

const RANDOM_ATTEMPTS: usize = 32;

#[derive(Debug, Clone)]
pub struct PortAllocator {
    display: RangeInclusive<u16>,
    proxy: RangeInclusive<u16>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(6000..=6999, 7000..=7999)
    }
}

impl PortAllocator {
    pub fn new(display: RangeInclusive<u16>, proxy: RangeInclusive<u16>) -> Self {
        Self { display, proxy }
    }

    pub fn display_range(&self) -> &RangeInclusive<u16> {
        &self.display
    }

    pub fn proxy_range(&self) -> &RangeInclusive<u16> {
        &self.proxy
    }

    /// Pick a `(display, proxy)` pair avoiding ports already recorded for
    /// other sessions.
    pub fn allocate(&self, in_use: &HashSet<u16>) -> LabVmResult<(u16, u16)> {
        let display = pick(&self.display, in_use)
            .ok_or_else(|| LabVmError::ResourceExhausted("display port range exhausted".into()))?;
        let proxy = pick(&self.proxy, in_use)
            .ok_or_else(|| LabVmError::ResourceExhausted("proxy port range exhausted".into()))?;
        Ok((display, proxy))
    }
}

fn pick(range: &RangeInclusive<u16>, in_use: &HashSet<u16>) -> Option<u16> {
    if range.is_empty() {
        return None;
    }
    let mut rng = rand::thread_rng();
    for _ in 0..RANDOM_ATTEMPTS {
        let port = rng.gen_range(range.clone());
        if !in_use.contains(&port) {
            return Some(port);
        }
    }
    // Dense range: fall back to the first free slot.
    range.clone().find(|p| !in_use.contains(p))
}
