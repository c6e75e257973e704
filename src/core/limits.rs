use crate::core::errors::{ConvoyError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Process-wide admission gate on whole-plan executions.
///
/// Step fan-out inside a single execution is not bounded here.
#[derive(Debug)]
pub struct AdmissionController {
    max_concurrent_executions: usize,

    in_flight: AtomicUsize,

    // Statistics
    peak_in_flight: AtomicUsize,
    total_admitted: AtomicU64,
    total_rejected: AtomicU64,
}

impl AdmissionController {
    pub fn new(max_concurrent_executions: usize) -> Result<Self> {
        if max_concurrent_executions == 0 {
            return Err(ConvoyError::configuration_field(
                "max_concurrent_executions must be greater than 0",
                "max_concurrent_executions",
            ));
        }

        Ok(Self {
            max_concurrent_executions,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            total_admitted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        })
    }

    /// Claim an execution slot, failing with a capacity error when the gate is full.
    ///
    /// The slot is released when the returned guard is dropped.
    pub fn try_admit(&self) -> Result<AdmissionSlot<'_>> {
        let limit = self.max_concurrent_executions;
        let admitted = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            });

        match admitted {
            Ok(previous) => {
                let now = previous + 1;
                self.peak_in_flight.fetch_max(now, Ordering::Relaxed);
                self.total_admitted.fetch_add(1, Ordering::Relaxed);
                debug!(in_flight = now, limit, "Execution admitted");
                Ok(AdmissionSlot { controller: self })
            }
            Err(current) => {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(in_flight = current, limit, "Execution rejected: capacity exhausted");
                Err(ConvoyError::capacity(current, limit))
            }
        }
    }

    fn release(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            })
            .unwrap_or(0);
        debug!(in_flight = previous.saturating_sub(1), "Execution slot released");
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.max_concurrent_executions
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            limit: self.max_concurrent_executions,
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }
}

/// RAII execution slot
#[derive(Debug)]
pub struct AdmissionSlot<'a> {
    controller: &'a AdmissionController,
}

impl Drop for AdmissionSlot<'_> {
    fn drop(&mut self) {
        self.controller.release();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub in_flight: usize,
    pub limit: usize,
    pub peak_in_flight: usize,
    pub total_admitted: u64,
    pub total_rejected: u64,
}
