use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::{Aggregator, TimeSlot};
use crate::collector::Collector;
use crate::config::Config;
use crate::perf::{PerfRing, RingStorage};
use crate::protocol::{MessageStats, RmidTracker};

/// Callback for slots leaving the aggregation window. The tracker maps the
/// slot's entity ids to the processes that owned them.
pub type SlotHandler = Box<dyn Fn(&TimeSlot, &RmidTracker) + Send + Sync>;

/// One CPU's ring storage.
struct RingSource {
    cpu: u32,
    storage: Arc<dyn RingStorage>,
}

/// Agent owns the per-CPU rings and drives the collector on a timer.
pub struct Agent {
    cfg: Config,
    sources: Vec<RingSource>,
    handlers: Vec<SlotHandler>,
    stats: Arc<MessageStats>,
    poll_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates an agent with one kernel perf ring per configured CPU.
    pub fn new(cfg: Config) -> Result<Self> {
        let cpus = resolve_cpus(&cfg)?;
        let sources = open_sources(&cfg, &cpus)?;
        info!(
            cpus = cpus.len(),
            data_pages = cfg.ring.data_pages,
            "opened perf rings"
        );
        Ok(Self::from_sources(cfg, sources))
    }

    /// Creates an agent over caller-provided storages, labelled 0..n.
    pub fn with_storages(cfg: Config, storages: Vec<Arc<dyn RingStorage>>) -> Self {
        let sources = storages
            .into_iter()
            .zip(0u32..)
            .map(|(storage, cpu)| RingSource { cpu, storage })
            .collect();
        Self::from_sources(cfg, sources)
    }

    fn from_sources(cfg: Config, sources: Vec<RingSource>) -> Self {
        Self {
            cfg,
            sources,
            handlers: Vec::new(),
            stats: Arc::new(MessageStats::new()),
            poll_task: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Register a slot handler. Handlers registered after `start` are ignored.
    pub fn on_slot(&mut self, handler: SlotHandler) {
        self.handlers.push(handler);
    }

    pub fn stats(&self) -> Arc<MessageStats> {
        Arc::clone(&self.stats)
    }

    /// Bind the rings and spawn the poll loop.
    pub async fn start(&mut self) -> Result<()> {
        if self.poll_task.is_some() {
            bail!("agent already started");
        }

        let agg_cfg = self.cfg.aggregation.aggregator_config()?;
        let aggregator = Aggregator::new(agg_cfg).context("creating aggregator")?;
        let collector = Collector::with_stats(aggregator, Arc::clone(&self.stats));

        let mut rings = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let ring = PerfRing::new(Arc::clone(&source.storage))
                .with_context(|| format!("binding ring for cpu {}", source.cpu))?;
            debug!(cpu = source.cpu, capacity = ring.capacity(), "ring bound");
            rings.push(ring);
        }

        if self.handlers.is_empty() {
            self.handlers.push(Box::new(log_slot));
        }
        let handlers = Arc::new(std::mem::take(&mut self.handlers));

        let poll_loop = PollLoop {
            rings,
            collector,
            handlers,
            poll_interval: self.cfg.poll_interval,
            stats_interval: self.cfg.stats_interval,
        };
        let cancel = self.cancel.clone();
        self.poll_task = Some(tokio::spawn(poll_loop.run(cancel)));

        info!(
            rings = self.sources.len(),
            slot_length_ns = agg_cfg.slot_length_ns,
            window_size = agg_cfg.window_size,
            poll_interval = ?self.cfg.poll_interval,
            "agent started"
        );
        Ok(())
    }

    /// Stop polling, flush the window to handlers and release the rings.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(handle) = self.poll_task.take() {
            handle.await.context("waiting for poll task")?;
        }

        for source in &mut self.sources {
            match Arc::get_mut(&mut source.storage) {
                Some(storage) => {
                    if let Err(e) = storage.close() {
                        error!(cpu = source.cpu, error = %e, "error closing ring storage");
                    }
                }
                None => {
                    warn!(cpu = source.cpu, "ring storage still shared, leaving it to drop");
                }
            }
        }

        info!("agent stopped");
        Ok(())
    }
}

/// Default handler: one debug line per emitted slot.
pub fn log_slot(slot: &TimeSlot, rmids: &RmidTracker) {
    if slot.is_empty() {
        return;
    }
    let cycles: u64 = slot.aggregations.values().map(|a| a.cycles).sum();
    let llc_misses: u64 = slot.aggregations.values().map(|a| a.llc_misses).sum();
    let top = slot
        .aggregations
        .iter()
        .max_by_key(|(_, a)| a.llc_misses)
        .map(|(id, _)| *id);
    let top_comm = top
        .and_then(|id| rmids.get(id))
        .map_or("unknown", |meta| meta.comm.as_str());
    debug!(
        start = slot.start_time,
        entities = slot.aggregations.len(),
        cycles,
        llc_misses,
        top_entity = ?top,
        top_comm,
        "slot complete"
    );
}

fn dispatch(handlers: &[SlotHandler], slot: &TimeSlot, rmids: &RmidTracker) {
    for handler in handlers {
        handler(slot, rmids);
    }
}

/// Configured CPUs, or every CPU the process can run on.
fn resolve_cpus(cfg: &Config) -> Result<Vec<u32>> {
    if !cfg.ring.cpus.is_empty() {
        return Ok(cfg.ring.cpus.clone());
    }
    let count = std::thread::available_parallelism()
        .context("detecting CPU count")?
        .get();
    let count = u32::try_from(count).context("CPU count out of range")?;
    Ok((0..count).collect())
}

#[cfg(target_os = "linux")]
fn open_sources(cfg: &Config, cpus: &[u32]) -> Result<Vec<RingSource>> {
    use crate::perf::MmapRingStorage;

    cpus.iter()
        .map(|&cpu| {
            let cpu_arg = i32::try_from(cpu).with_context(|| format!("cpu {cpu} out of range"))?;
            let storage =
                MmapRingStorage::open(cpu_arg, cfg.ring.data_pages, cfg.ring.watermark_bytes)
                    .with_context(|| format!("opening perf ring on cpu {cpu}"))?;
            Ok(RingSource {
                cpu,
                storage: Arc::new(storage),
            })
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn open_sources(_cfg: &Config, _cpus: &[u32]) -> Result<Vec<RingSource>> {
    bail!("kernel perf rings are only available on Linux")
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

struct PollLoop {
    rings: Vec<PerfRing>,
    collector: Collector,
    handlers: Arc<Vec<SlotHandler>>,
    poll_interval: Duration,
    stats_interval: Duration,
}

impl PollLoop {
    async fn run(mut self, cancel: CancellationToken) {
        let mut poll_ticker = tokio::time::interval(self.poll_interval);
        poll_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let first_report = tokio::time::Instant::now() + self.stats_interval;
        let mut stats_ticker = tokio::time::interval_at(first_report, self.stats_interval);
        stats_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll_ticker.tick() => self.poll_once(),
                _ = stats_ticker.tick() => self.report_stats(),
            }
        }

        // Pick up whatever was published before cancellation, then flush.
        self.poll_once();
        let handlers = Arc::clone(&self.handlers);
        let drained = self.collector.drain(|slot, rmids| dispatch(&handlers, &slot, rmids));
        info!(drained, "aggregation window flushed");
    }

    fn poll_once(&mut self) {
        let handlers = &self.handlers;
        match self
            .collector
            .poll(&mut self.rings, |slot, rmids| dispatch(handlers, &slot, rmids))
        {
            Ok(summary) => {
                if summary.lost_samples > 0 {
                    warn!(lost = summary.lost_samples, "kernel dropped perf records");
                }
            }
            Err(e) => warn!(error = %e, "ring poll failed"),
        }
    }

    fn report_stats(&self) {
        let snapshot = self.collector.stats().snapshot();
        if snapshot.is_empty() {
            return;
        }

        let total: u64 = snapshot.messages.iter().map(|(_, n)| n).sum();
        info!(
            messages = total,
            lost = snapshot.lost_samples,
            decode_errors = snapshot.decode_errors,
            interval = ?self.stats_interval,
            "message stats"
        );
        for (kind, count) in &snapshot.messages {
            debug!(kind = %kind, count, "  by kind");
        }
    }
}
