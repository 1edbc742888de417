//! The coordinator: the main-thread reactor owning the NIC descriptor.
//!
//! One cycle per readable event: snapshot the slowest active task's
//! private head for every ring, wake the active tasks, then advance the
//! shared heads to those snapshots (or to the tails when nobody is
//! consuming) and park the cursors at the tails. Heads only ever move
//! towards the tail, so reclamation never overtakes a consumer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Duration;

use tespkt::Frame;

use crate::ifring::{RingBackend, Rings};
use crate::task::{Back, TaskSet};

/// Receive statistics, logged every stats period and totalled at exit.
#[derive(Debug, Default, Clone, Copy)]
struct Stats {
    polled: u64,
    received: u64,
    missed: u64,
    skipped: u64,
}

impl Stats {
    fn absorb(&mut self, other: Stats) {
        self.polled += other.polled;
        self.received += other.received;
        self.missed += other.missed;
        self.skipped += other.skipped;
    }

    fn log(&self, what: &str) {
        log::info!(
            "{what}: {} packet(s), {} missed, polled {} time(s) ({} without progress)",
            self.received,
            self.missed,
            self.polled,
            self.skipped
        );
    }
}

/// Run the fan-out until `shutdown` resolves or a task dies.
pub async fn run<B: RingBackend>(
    rings: Arc<Rings<B>>,
    mut tasks: TaskSet,
    monitor: mpsc::Receiver<(usize, Back)>,
    stats_period: Duration,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    let mut monitor = monitor;
    let mut period = Stats::default();
    let mut total = Stats::default();
    let mut stat_timer = if stats_period > Duration::ZERO {
        let mut iv = tokio::time::interval(stats_period);
        iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        Some(iv)
    } else {
        None
    };
    tokio::pin!(shutdown);

    log::debug!("all tasks initialized, polling the interface");
    let result = loop {
        tokio::select! {
            r = rings.wait_rx() => {
                if let Err(e) = r {
                    log::error!("cannot poll the interface: {e}");
                    break Err(e.into());
                }
                wakeup_cycle(&rings, &tasks, &mut period);
            }
            id = died(&mut monitor) => {
                log::error!("task #{id} died");
                break Err(anyhow::anyhow!("task #{id} died"));
            }
            _ = &mut shutdown => {
                log::info!("shutting down");
                break Ok(());
            }
            _ = tick(&mut stat_timer) => {
                period.log("rx");
                total.absorb(period);
                period = Stats::default();
            }
        }
    };

    tasks.stop_all().await;
    total.absorb(period);
    total.log("total rx");
    result
}

async fn died(monitor: &mut mpsc::Receiver<(usize, Back)>) -> usize {
    loop {
        match monitor.recv().await {
            Some((id, Back::Died)) => return id,
            Some(_) => continue,
            None => std::future::pending().await,
        }
    }
}

async fn tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// One readable event: wake, then reclaim up to the slowest consumer.
fn wakeup_cycle<B: RingBackend>(rings: &Rings<B>, tasks: &TaskSet, stats: &mut Stats) {
    // snapshot before waking so the heads can only be behind
    let heads = tasks.slowest_heads(rings);
    tasks.wakeup_all();

    stats.polled += 1;
    let mut progressed = false;
    for r in 0..rings.num_rings() {
        let new = rings.pending(r);
        if new > 0 {
            progressed = true;
            // span of frame sequences vs number of slots: the difference
            // is what the wire lost
            let first = rings.cursor(r);
            let last = rings.preceding(r, rings.tail(r));
            let fseq_first = Frame::new(rings.buf(r, first)).map(|p| p.fseq()).unwrap_or(0);
            let fseq_last = Frame::new(rings.buf(r, last)).map(|p| p.fseq()).unwrap_or(0);
            let span = fseq_last.wrapping_sub(fseq_first).wrapping_add(1) as u32;
            stats.received += new as u64;
            stats.missed += span.wrapping_sub(new) as u16 as u64;
        }

        let new_head = match &heads {
            Some(h) => h[r],
            None => rings.tail(r), // nobody consuming, free everything
        };
        rings.release(r, new_head);
    }
    if !progressed {
        stats.skipped += 1;
    }
}
