//! Leak-tracking decorator.
//!
//! Every block allocated through the tracker is recorded with its size, the
//! source location of the `allocate` call and a creation sequence number.
//! Freeing removes the record; whatever remains when the tracker is disposed
//! (or dropped) is reported as a leak, in the configured [`LeakReportMode`].

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::panic::Location;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use memkit_common::{Error, Result};

use crate::allocator::{AllocRequest, Block, MemoryStrategy, SharedStrategy};

/// Environment variable read by [`LeakReportMode::from_env`].
pub const LEAK_REPORT_ENV: &str = "MEMKIT_LEAK_REPORT";

/// What happens to leaks found at teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LeakReportMode {
    /// Report as an error; a tracker dropped with leaks panics.
    FailFast,
    /// `log::error!` one entry per leak.
    #[default]
    Log,
    /// One `LEAK ...` line per leak on the report sink.
    MachineReadable,
}

impl LeakReportMode {
    /// Reads the mode from `MEMKIT_LEAK_REPORT`, defaulting to [`LeakReportMode::Log`]
    /// when the variable is not set.
    pub fn from_env() -> Result<LeakReportMode> {
        match std::env::var(LEAK_REPORT_ENV) {
            Ok(value) => value.parse(),
            Err(std::env::VarError::NotPresent) => Ok(LeakReportMode::default()),
            Err(e) => Err(Error::invalid_arg(LEAK_REPORT_ENV, e.to_string())),
        }
    }
}

impl FromStr for LeakReportMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "failfast" => Ok(LeakReportMode::FailFast),
            "log" => Ok(LeakReportMode::Log),
            "machine" | "machine-readable" => Ok(LeakReportMode::MachineReadable),
            other => Err(Error::invalid_arg(
                "leak report mode",
                format!("unknown mode '{other}', expected fail-fast, log or machine"),
            )),
        }
    }
}

impl fmt::Display for LeakReportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LeakReportMode::FailFast => "fail-fast",
            LeakReportMode::Log => "log",
            LeakReportMode::MachineReadable => "machine",
        })
    }
}

/// A live allocation known to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub address: usize,
    pub size: usize,
    pub site: &'static Location<'static>,
    /// Creation order, starting at 0 for the tracker's first allocation.
    pub sequence: u64,
}

impl fmt::Display for AllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x} ({} bytes, seq {}) allocated at {}",
            self.address, self.size, self.sequence, self.site
        )
    }
}

/// Allocations still live when a report was taken, oldest first.
#[derive(Debug, Clone)]
pub struct LeakReport {
    allocator: String,
    leaks: Vec<AllocationRecord>,
}

impl LeakReport {
    pub fn allocator(&self) -> &str {
        &self.allocator
    }

    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.leaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    pub fn leaks(&self) -> &[AllocationRecord] {
        &self.leaks
    }

    /// The report as `LEAK allocator=<name> address=0x<hex> bytes=<n>
    /// site=<file>:<line>:<col> seq=<n>` lines.
    pub fn machine_lines(&self) -> impl Iterator<Item = String> + '_ {
        self.leaks.iter().map(|leak| {
            format!(
                "LEAK allocator={} address={:#x} bytes={} site={}:{}:{} seq={}",
                self.allocator,
                leak.address,
                leak.size,
                leak.site.file(),
                leak.site.line(),
                leak.site.column(),
                leak.sequence
            )
        })
    }
}

type ReportSink = Box<dyn Write + Send>;

/// Configures a [`LeakTrackingAllocator`].
pub struct LeakTrackingBuilder {
    backing: SharedStrategy,
    name: String,
    mode: LeakReportMode,
    sink: Option<ReportSink>,
}

impl LeakTrackingBuilder {
    pub fn mode(mut self, mode: LeakReportMode) -> Self {
        self.mode = mode;
        self
    }

    /// Destination of machine-readable lines; stderr when not set.
    pub fn sink(mut self, sink: impl Write + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn build(self) -> Arc<LeakTrackingAllocator> {
        Arc::new(LeakTrackingAllocator {
            backing: self.backing,
            name: self.name,
            mode: self.mode,
            sink: Mutex::new(self.sink.unwrap_or_else(|| Box::new(std::io::stderr()))),
            records: Mutex::default(),
            next_sequence: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        })
    }
}

pub struct LeakTrackingAllocator {
    backing: SharedStrategy,
    name: String,
    mode: LeakReportMode,
    sink: Mutex<ReportSink>,
    records: Mutex<HashMap<usize, AllocationRecord>>,
    next_sequence: AtomicU64,
    disposed: AtomicBool,
}

impl LeakTrackingAllocator {
    pub fn new(
        backing: SharedStrategy,
        name: impl Into<String>,
        mode: LeakReportMode,
    ) -> Arc<LeakTrackingAllocator> {
        LeakTrackingAllocator::builder(backing, name).mode(mode).build()
    }

    pub fn builder(backing: SharedStrategy, name: impl Into<String>) -> LeakTrackingBuilder {
        LeakTrackingBuilder {
            backing,
            name: name.into(),
            mode: LeakReportMode::default(),
            sink: None,
        }
    }

    pub fn mode(&self) -> LeakReportMode {
        self.mode
    }

    pub fn tracked_allocation_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Live records, oldest first.
    pub fn snapshot(&self) -> LeakReport {
        let mut leaks = self
            .records
            .lock()
            .unwrap()
            .values()
            .copied()
            .collect::<Vec<_>>();
        leaks.sort_by_key(|record| record.sequence);
        LeakReport {
            allocator: self.name.clone(),
            leaks,
        }
    }

    /// Reports every live allocation according to the tracker's mode.
    ///
    /// In [`LeakReportMode::FailFast`] a non-empty report is returned as an
    /// [`ErrorKind::Leak`](memkit_common::ErrorKind::Leak) error naming the
    /// oldest leak.
    pub fn report_leaks(&self) -> Result<LeakReport> {
        let report = self.snapshot();
        if report.is_clean() {
            return Ok(report);
        }
        match self.mode {
            LeakReportMode::FailFast => {
                return Err(Error::leak(
                    &self.name,
                    report.len(),
                    report.leaks[0].to_string(),
                ));
            }
            LeakReportMode::Log => {
                for leak in report.leaks() {
                    log::error!("{}: leaked {leak}", self.name);
                }
            }
            LeakReportMode::MachineReadable => {
                let mut sink = self.sink.lock().unwrap();
                for line in report.machine_lines() {
                    writeln!(sink, "{line}")
                        .map_err(|e| Error::io("writing leak report", e))?;
                }
                sink.flush().map_err(|e| Error::io("flushing leak report", e))?;
            }
        }
        Ok(report)
    }

    /// Reports leaks and tears the tracker down. Later allocations fail with
    /// `InvalidOperation`; frees of tracked blocks keep working.
    ///
    /// Only the first call reports.
    pub fn dispose(&self) -> Result<LeakReport> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(self.snapshot());
        }
        self.report_leaks()
    }
}

impl MemoryStrategy for LeakTrackingAllocator {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate_block(&self, request: &AllocRequest) -> Result<Block> {
        if self.is_disposed() {
            return Err(Error::invalid_operation(format!(
                "allocate on disposed leak tracker '{}'",
                self.name
            )));
        }
        let block = self.backing.allocate_block(request)?;
        let record = AllocationRecord {
            address: block.address(),
            size: request.size(),
            site: request.site(),
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.records.lock().unwrap().insert(record.address, record);
        Ok(block)
    }

    fn free(&self, block: Block) -> Result<()> {
        let Some(record) = self.records.lock().unwrap().remove(&block.address()) else {
            log::warn!(
                "{}: free of untracked block at {:#x}",
                self.name,
                block.address()
            );
            return Err(Error::foreign_block(&self.name, block.address()));
        };
        // Backings without individual deallocation (arenas) reclaim the block
        // themselves; the record still goes.
        if !self.backing.supports_individual_deallocation() {
            return Ok(());
        }
        if let Err(e) = self.backing.free(block) {
            self.records.lock().unwrap().insert(record.address, record);
            return Err(e);
        }
        Ok(())
    }

    fn supports_individual_deallocation(&self) -> bool {
        true
    }

    fn total_allocated_bytes(&self) -> u64 {
        self.backing.total_allocated_bytes()
    }
}

impl Drop for LeakTrackingAllocator {
    fn drop(&mut self) {
        if *self.disposed.get_mut() {
            return;
        }
        *self.disposed.get_mut() = true;
        match self.report_leaks() {
            Ok(_) => {}
            Err(e) if matches!(self.mode, LeakReportMode::FailFast) && !std::thread::panicking() => {
                panic!("{e}");
            }
            Err(e) => log::error!("{}: {e}", self.name),
        }
    }
}
