//! Counters shared between the render thread and the host.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counters. The render side only ever increments them.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    blocks_rendered: AtomicU64,
    render_faults: AtomicU64,
    analysis_underruns: AtomicU64,
    recorder_widenings: AtomicU64,
    retire_overflows: AtomicU64,
    rejected_requests: AtomicU64,
}

/// A point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub blocks_rendered: u64,
    pub render_faults: u64,
    /// Blocks that overwrote analysis samples the control side never read.
    pub analysis_underruns: u64,
    /// Times the recorder backlog grew past its reserved capacity.
    pub recorder_widenings: u64,
    /// Released objects dropped on the render thread because the retire
    /// queue was full.
    pub retire_overflows: u64,
    /// Requests refused with `QueueFull`.
    pub rejected_requests: u64,
}

impl EngineMetrics {
    pub(crate) fn block_rendered(&self) {
        self.blocks_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn render_fault(&self) {
        self.render_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn analysis_underrun(&self) {
        self.analysis_underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recorder_widened(&self) {
        self.recorder_widenings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retire_overflow(&self) {
        self.retire_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            blocks_rendered: self.blocks_rendered.load(Ordering::Relaxed),
            render_faults: self.render_faults.load(Ordering::Relaxed),
            analysis_underruns: self.analysis_underruns.load(Ordering::Relaxed),
            recorder_widenings: self.recorder_widenings.load(Ordering::Relaxed),
            retire_overflows: self.retire_overflows.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
        }
    }
}
