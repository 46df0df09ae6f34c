//! A fixed pool of scan workers, driven one pass at a time.
//!
//! Every worker owns one read session and a share of the selected regions.
//! The controlling thread hands each worker a pass over a command channel
//! and then waits until every worker has reported back on a shared report
//! channel. Between passes workers park on their command channel, so the
//! same threads serve every pass of a scan.

use crate::{
    error::Error,
    memory::{read_exact, MemoryReader},
    Address, AddressRange, AreaSet, Options, RegionId, Token, WorkLister,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, trace, warn};
use std::{
    mem,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

/// How long the controller waits for reports before checking that every
/// worker is still alive.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What a scan callback gets to see at every candidate address.
#[derive(Debug)]
pub struct ScanContext<'a> {
    /// Absolute address being scanned.
    pub address: Address,
    /// Region the address belongs to.
    pub region: RegionId,
    /// Offset of the address from the start of its region.
    pub region_offset: u64,
    /// Number of buffered bytes starting at `address`, always
    /// `bytes.len()`.
    pub remaining: usize,
    /// Buffered bytes starting at `address`. Shorter than a pointer only at
    /// the very end of a region.
    pub bytes: &'a [u8],
}

/// Callback invoked by workers for every candidate address.
pub trait ScanCallback: Send + Sync {
    /// Inspect the given address.
    ///
    /// Returns the number of bytes to advance before the next invocation.
    fn scan(&self, context: &ScanContext<'_>) -> Result<usize, Error>;
}

impl<F> ScanCallback for F
where
    F: Send + Sync + Fn(&ScanContext<'_>) -> Result<usize, Error>,
{
    fn scan(&self, context: &ScanContext<'_>) -> Result<usize, Error> {
        self(context)
    }
}

/// Flags modifying how [WorkerPool::setup] treats existing state.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetupFlags {
    /// Partition regions again even if the area set did not change.
    pub rebalance: bool,
    /// Join and spawn every worker thread again.
    pub respawn: bool,
}

/// Totals for a single pass, summed across workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Number of callback invocations.
    pub addresses: u64,
    /// Number of region bytes covered.
    pub bytes: u64,
}

/// Everything a worker needs to run one pass.
struct Plan {
    regions: Vec<(RegionId, AddressRange)>,
    callback: Arc<dyn ScanCallback>,
    alignment: usize,
    pointer_width: usize,
    buffer_size: usize,
    cancel: Arc<Token>,
    abort: Arc<Token>,
}

enum Command {
    Pass(Arc<Plan>),
    Exit,
}

struct Report {
    worker: usize,
    result: Result<PassStats, Error>,
}

struct Worker<R> {
    commands: Sender<Command>,
    handle: JoinHandle<R>,
}

/// A pool of long-lived scan workers, one per read session.
pub struct WorkerPool<R> {
    /// Sessions not currently owned by a running worker.
    idle: Vec<R>,
    workers: Vec<Worker<R>>,
    report_tx: Sender<Report>,
    report_rx: Receiver<Report>,
    lister: WorkLister,
    plans: Vec<Arc<Plan>>,
    cancel: Arc<Token>,
    abort: Arc<Token>,
}

impl<R> WorkerPool<R>
where
    R: 'static + Send + MemoryReader,
{
    /// Construct a pool with one worker per session.
    ///
    /// Threads are spawned on the first call to [setup][WorkerPool::setup].
    pub fn new(sessions: Vec<R>) -> Result<Self, Error> {
        if sessions.is_empty() {
            return Err(Error::NoSessions);
        }

        let (report_tx, report_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            idle: sessions,
            workers: Vec::new(),
            report_tx,
            report_rx,
            lister: WorkLister::new(),
            plans: Vec::new(),
            cancel: Arc::new(Token::new()),
            abort: Arc::new(Token::new()),
        })
    }

    /// Prepare the pool for passes over `areas` with the given callback.
    ///
    /// Existing threads and the existing partition are reused unless the
    /// area set changed or `flags` say otherwise.
    pub fn setup(
        &mut self,
        options: &Options,
        areas: &AreaSet,
        callback: Arc<dyn ScanCallback>,
        alignment: usize,
        flags: SetupFlags,
    ) -> Result<(), Error> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::invalid_option(
                "alignment",
                format!("{} is not a power of two", alignment),
            ));
        }

        let map = options.map()?;
        let pointer_width = options.pointer_width().size();

        if options.buffer_size() < 2 * pointer_width {
            return Err(Error::invalid_option(
                "buffer_size",
                format!("{} bytes cannot hold two pointers", options.buffer_size()),
            ));
        }

        if areas.is_empty() {
            return Err(Error::EmptyAreaSet);
        }

        if flags.respawn {
            self.shutdown()?;
        }

        let workers = self.workers();

        let rebalanced = self.lister.update(
            map,
            areas.regions(),
            areas.generation(),
            workers,
            flags.rebalance,
        )?;

        if !rebalanced {
            trace!("reusing partition for area set {}", areas.generation());
        }

        let mut plans = Vec::with_capacity(workers);

        for ids in self.lister.partition() {
            let mut regions = Vec::with_capacity(ids.len());

            for id in ids {
                let region = map.region(*id).ok_or(Error::UnknownRegion(*id))?;
                regions.push((region.id, region.range));
            }

            plans.push(Arc::new(Plan {
                regions,
                callback: callback.clone(),
                alignment,
                pointer_width,
                buffer_size: options.buffer_size(),
                cancel: self.cancel.clone(),
                abort: self.abort.clone(),
            }));
        }

        self.plans = plans;
        self.spawn()
    }

    /// Spawn worker threads for every idle session.
    fn spawn(&mut self) -> Result<(), Error> {
        if !self.workers.is_empty() {
            return Ok(());
        }

        for (id, session) in mem::take(&mut self.idle).into_iter().enumerate() {
            let (commands, command_rx) = crossbeam_channel::unbounded();
            let reports = self.report_tx.clone();

            let result = thread::Builder::new()
                .name(format!("scan-worker-{}", id))
                .spawn(move || work(id, session, command_rx, reports));

            let handle = match result {
                Ok(handle) => handle,
                Err(e) => {
                    // NB: the session is lost with the closure, take the rest down too.
                    if let Err(e) = self.shutdown() {
                        warn!("failed to shut down after spawn error: {}", e);
                    }

                    return Err(Error::Spawn(e));
                }
            };

            self.workers.push(Worker { commands, handle });
        }

        debug!("spawned {} workers", self.workers.len());
        Ok(())
    }

    /// Run a single pass: every worker scans all of its regions exactly once.
    ///
    /// Blocks until every worker has reported. If any worker fails, every
    /// other worker is told to abort, the pool is shut down, and the first
    /// error is returned. The next call to [setup][WorkerPool::setup]
    /// respawns the workers.
    pub fn run_one_pass(&mut self) -> Result<PassStats, Error> {
        if self.workers.is_empty() || self.plans.len() != self.workers.len() {
            return Err(Error::PoolNotSetUp);
        }

        self.abort.clear();

        // NB: nothing should be buffered, but never mix up passes.
        while self.report_rx.try_recv().is_ok() {}

        let mut tally = Tally::new(self.workers.len());

        for (n, (worker, plan)) in self.workers.iter().zip(&self.plans).enumerate() {
            if worker.commands.send(Command::Pass(plan.clone())).is_err() {
                tally.record(n, Err(Error::WorkerLost(n)), &self.abort);
            }
        }

        while tally.pending > 0 {
            match self.report_rx.recv_timeout(POLL_INTERVAL) {
                Ok(report) => {
                    tally.record(report.worker, report.result, &self.abort);
                }
                Err(RecvTimeoutError::Timeout) => {
                    let lost = self
                        .workers
                        .iter()
                        .enumerate()
                        .find(|(n, w)| !tally.done[*n] && w.handle.is_finished())
                        .map(|(n, _)| n);

                    if let Some(n) = lost {
                        // A report might have raced the check.
                        match self.report_rx.try_recv() {
                            Ok(report) => tally.record(report.worker, report.result, &self.abort),
                            Err(..) => tally.record(n, Err(Error::WorkerLost(n)), &self.abort),
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::WorkerLost(0));
                }
            }
        }

        if let Some(e) = tally.error {
            warn!("pass failed: {}", e);

            if let Error::Cancelled = e {
                self.cancel.clear();
            }

            if let Err(e) = self.shutdown() {
                warn!("failed to shut down after failed pass: {}", e);
            }

            return Err(e);
        }

        debug!(
            "pass complete: {} addresses, {:#x} bytes",
            tally.stats.addresses, tally.stats.bytes
        );

        Ok(tally.stats)
    }
}

impl<R> WorkerPool<R> {
    /// The number of workers in the pool.
    pub fn workers(&self) -> usize {
        self.workers.len() + self.idle.len()
    }

    /// Test if worker threads are currently running.
    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Token which, when set, cancels the pass in progress.
    pub fn cancel_token(&self) -> Arc<Token> {
        self.cancel.clone()
    }

    /// Tell every worker to exit and join them, recovering their sessions.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        if self.workers.is_empty() {
            return Ok(());
        }

        for worker in &self.workers {
            // NB: workers that failed have already exited.
            let _ = worker.commands.send(Command::Exit);
        }

        let mut lost = None;

        for (n, worker) in mem::take(&mut self.workers).into_iter().enumerate() {
            match worker.handle.join() {
                Ok(session) => self.idle.push(session),
                Err(..) => lost = Some(n),
            }
        }

        self.plans.clear();
        debug!("workers shut down, {} sessions recovered", self.idle.len());

        match lost {
            Some(n) => Err(Error::WorkerLost(n)),
            None => Ok(()),
        }
    }
}

impl<R> Drop for WorkerPool<R> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("failed to shut down worker pool: {}", e);
        }
    }
}

/// Reports collected during a pass.
struct Tally {
    done: Vec<bool>,
    pending: usize,
    stats: PassStats,
    error: Option<Error>,
}

impl Tally {
    fn new(workers: usize) -> Self {
        Self {
            done: vec![false; workers],
            pending: workers,
            stats: PassStats::default(),
            error: None,
        }
    }

    fn record(&mut self, worker: usize, result: Result<PassStats, Error>, abort: &Token) {
        match self.done.get_mut(worker) {
            Some(done) if !*done => *done = true,
            _ => return,
        }

        self.pending -= 1;

        match result {
            Ok(stats) => {
                self.stats.addresses += stats.addresses;
                self.stats.bytes += stats.bytes;
            }
            Err(e) => {
                abort.set();

                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
        }
    }
}

/// Worker thread main loop.
///
/// Returns the session so that it can be reused when the pool respawns.
fn work<R>(id: usize, session: R, commands: Receiver<Command>, reports: Sender<Report>) -> R
where
    R: MemoryReader,
{
    trace!("worker {} started", id);

    while let Ok(command) = commands.recv() {
        let plan = match command {
            Command::Pass(plan) => plan,
            Command::Exit => break,
        };

        let result = scan_plan(&session, &plan);
        let failed = result.is_err();
        drop(plan);

        if reports.send(Report { worker: id, result }).is_err() || failed {
            break;
        }
    }

    trace!("worker {} exiting", id);
    session
}

fn scan_plan<R>(session: &R, plan: &Plan) -> Result<PassStats, Error>
where
    R: MemoryReader,
{
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(plan.buffer_size)?;
    buffer.resize(plan.buffer_size, 0u8);

    let mut stats = PassStats::default();

    for (id, range) in &plan.regions {
        if plan.cancel.is_set() {
            return Err(Error::Cancelled);
        }

        if plan.abort.is_set() {
            break;
        }

        scan_region(session, plan, *id, *range, &mut buffer, &mut stats)?;
    }

    Ok(stats)
}

/// Advance `offset` so that `start + offset` is aligned.
fn align(start: u64, offset: u64, alignment: u64) -> u64 {
    let rem = start.wrapping_add(offset) % alignment;

    if rem > 0 {
        offset + (alignment - rem)
    } else {
        offset
    }
}

/// Walk a single region through a sliding read window.
fn scan_region<R>(
    session: &R,
    plan: &Plan,
    id: RegionId,
    range: AddressRange,
    buffer: &mut [u8],
    stats: &mut PassStats,
) -> Result<(), Error>
where
    R: MemoryReader,
{
    let start = range.start.into_inner();
    let size = range.size();
    let alignment = plan.alignment as u64;

    // region offset of `buffer[0]`.
    let mut base = 0u64;
    let mut filled = 0usize;
    let mut pos = align(start, 0, alignment) as usize;

    loop {
        if pos >= filled {
            base += pos as u64;
            pos = 0;

            if base >= size {
                break;
            }

            let len = u64::min(buffer.len() as u64, size - base) as usize;
            read_exact(session, range.start.add(base)?, &mut buffer[..len])?;
            filled = len;

            if plan.cancel.is_set() {
                return Err(Error::Cancelled);
            }

            if plan.abort.is_set() {
                return Ok(());
            }
        } else if filled - pos < plan.pointer_width && base + (filled as u64) < size {
            // keep the unconsumed tail, so that a pointer spanning the
            // window boundary is seen intact.
            buffer.copy_within(pos..filled, 0);
            base += pos as u64;
            filled -= pos;
            pos = 0;

            let unread = size - base - filled as u64;
            let len = u64::min((buffer.len() - filled) as u64, unread) as usize;
            let address = range.start.add(base + filled as u64)?;
            read_exact(session, address, &mut buffer[filled..filled + len])?;
            filled += len;
        }

        let region_offset = base + pos as u64;
        let bytes = &buffer[pos..filled];

        let advance = plan.callback.scan(&ScanContext {
            address: range.start.add(region_offset)?,
            region: id,
            region_offset,
            remaining: bytes.len(),
            bytes,
        })?;

        if advance == 0 {
            return Err(Error::ZeroAdvance);
        }

        stats.addresses += 1;

        let next = align(start, region_offset.saturating_add(advance as u64), alignment);
        pos = (next - base) as usize;
    }

    stats.bytes += size;
    Ok(())
}
