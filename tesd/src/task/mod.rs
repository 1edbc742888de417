//! Task supervisor and per-task runtime.
//!
//! Every consumer runs as an independent reactor on its own OS thread
//! (a current-thread tokio runtime), connected to the coordinator by a
//! bounded control channel. The coordinator sends [`Ctrl::Wakeup`] when
//! new frames arrive and [`Ctrl::Stop`] at shutdown; a task announces
//! [`Back::Init`] once its endpoints are up and [`Back::Died`] if it
//! fails on its own (never in response to `Stop`).
//!
//! A task is `active` when its packet handler wants frames. While active
//! it owns a private head per receive ring; the coordinator reads those
//! heads (single-word loads, the worst a stale read costs is delayed
//! reclamation) and never reclaims past the slowest one. Activation
//! resynchronizes the private heads to the rings' heads.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use tespkt::{Frame, FrameErrors, McaSizeMode};

use crate::ifring::{RingBackend, Rings};

pub mod avgtr;
pub mod capture;
pub mod coinc;
pub mod coinccount;
pub mod endpoint;
pub mod hist;
pub mod info;
pub mod jitter;

pub use endpoint::{EndpointKind, EndpointSpec, TaskEvent};

/// Coordinator-to-task signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ctrl {
    Wakeup,
    Stop,
}

/// Task-to-coordinator signals, tagged with the task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Back {
    Init,
    Died,
}

/// What a handler wants next: keep consuming, drop out of the fan-out, or
/// give up entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Sleep,
    Error,
}

/// Task state shared with the coordinator.
pub struct TaskShared {
    pub name: &'static str,
    pub active: AtomicBool,
    pub busy: AtomicBool,
    pub error: AtomicBool,
    /// Private per-ring heads; owned by the task, read by the
    /// coordinator at wakeup boundaries.
    pub heads: Vec<AtomicU32>,
}

impl TaskShared {
    fn new(name: &'static str, nrings: usize) -> Self {
        TaskShared {
            name,
            active: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            error: AtomicBool::new(false),
            heads: (0..nrings).map(|_| AtomicU32::new(0)).collect(),
        }
    }
}

/// Reactor-owned facilities handlers reach through.
pub struct TaskCtx {
    pub id: usize,
    pub name: &'static str,
    /// Protocol sequence of the previous MCA frame this task saw. The
    /// dispatch loop updates it after the packet handler runs, so inside
    /// the handler it refers to the frame before the current one.
    pub prev_pseq_mca: u16,
    /// Same for multi-frame (non-dot-product) trace frames.
    pub prev_pseq_tr: u16,
    reply_txs: Vec<Option<mpsc::Sender<Bytes>>>,
    publishers: Vec<Option<endpoint::Publisher>>,
    timer: Option<Instant>,
    want_activate: bool,
}

impl TaskCtx {
    /// Send the reply for the request in flight on a rep endpoint.
    pub fn reply(&self, ep: usize, payload: Bytes) {
        match &self.reply_txs[ep] {
            Some(tx) => {
                if tx.try_send(payload).is_err() {
                    log::warn!("[{}] reply with no request in flight", self.name);
                }
            }
            None => log::warn!("[{}] endpoint {ep} is not request/reply", self.name),
        }
    }

    pub fn publish(&self, ep: usize, payload: Bytes) {
        match &self.publishers[ep] {
            Some(p) => p.publish(payload),
            None => log::warn!("[{}] endpoint {ep} is not a publisher", self.name),
        }
    }

    pub fn subscriber_count(&self, ep: usize) -> usize {
        self.publishers[ep].as_ref().map_or(0, |p| p.subscriber_count())
    }

    /// Arm the one-shot timer; [`TaskLogic::on_timer`] fires when it
    /// expires.
    pub fn set_timer(&mut self, after: Duration) {
        self.timer = Some(Instant::now() + after);
    }

    pub fn cancel_timer(&mut self) {
        self.timer = None;
    }

    /// Join the fan-out after the current handler returns.
    pub fn request_activation(&mut self) {
        self.want_activate = true;
    }
}

/// One consumer's behavior. The runtime owns the reactor; the logic sees
/// client events, packets and timer expiry.
#[async_trait(?Send)]
pub trait TaskLogic: Send {
    fn name(&self) -> &'static str;

    /// Start consuming packets immediately instead of waiting for a
    /// client event.
    fn autoactivate(&self) -> bool {
        false
    }

    fn endpoints(&self) -> Vec<EndpointSpec> {
        Vec::new()
    }

    async fn init(&mut self, _ctx: &mut TaskCtx) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_event(&mut self, _ctx: &mut TaskCtx, _ev: TaskEvent) -> Flow {
        Flow::Continue
    }

    /// One frame from the dispatch loop. `flen` is the frame length
    /// clipped to the slot, `missed` the jump in frame sequence since the
    /// previous frame this task saw, `err` the validity bitmask.
    async fn on_packet(
        &mut self,
        ctx: &mut TaskCtx,
        pkt: Frame<'_>,
        flen: u16,
        missed: u16,
        err: FrameErrors,
    ) -> Flow;

    async fn on_timer(&mut self, _ctx: &mut TaskCtx) -> Flow {
        Flow::Continue
    }

    /// Last words before the thread exits: flush, close, best-effort
    /// replies.
    async fn finalize(&mut self, _ctx: &mut TaskCtx) {}
}

/// Frame-sequence reconstruction state.
struct SeqState {
    prev_fseq: u16,
    just_activated: bool,
}

struct DbgStats {
    wakeups: u64,
    wakeups_inactive: u64,
    wakeups_false: u64,
    rings_dispatched: u64,
    missed: u64,
}

/// A started task as the coordinator sees it.
pub struct TaskHandle {
    pub shared: Arc<TaskShared>,
    ctrl_tx: mpsc::Sender<Ctrl>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl TaskHandle {
    /// Nudge the task if it is in the fan-out and not already working.
    /// Wakeups coalesce in the bounded channel.
    pub fn wakeup(&self) {
        if self.shared.active.load(Ordering::Acquire) && !self.shared.busy.load(Ordering::Acquire)
        {
            let _ = self.ctrl_tx.try_send(Ctrl::Wakeup);
        }
    }

    async fn stop(&mut self) {
        let _ = self.ctrl_tx.send(Ctrl::Stop).await;
        if let Some(join) = self.join.take() {
            // the task flushes and closes in its finalizer first
            let _ = join.join();
        }
    }
}

/// The set of running tasks.
pub struct TaskSet {
    pub tasks: Vec<TaskHandle>,
}

impl TaskSet {
    /// Spawn every task on its own thread and wait for each to
    /// initialize. Returns the set and the back channel the tasks
    /// report deaths on.
    pub async fn start<B: RingBackend>(
        rings: &Arc<Rings<B>>,
        logics: Vec<Box<dyn TaskLogic>>,
        size_mode: McaSizeMode,
    ) -> anyhow::Result<(TaskSet, mpsc::Receiver<(usize, Back)>)> {
        let (back_tx, mut back_rx) = mpsc::channel(8);
        let mut tasks = Vec::with_capacity(logics.len());
        for (id, logic) in logics.into_iter().enumerate() {
            let name = logic.name();
            log::debug!("starting task #{id} ({name})");
            let shared = Arc::new(TaskShared::new(name, rings.num_rings()));
            let (ctrl_tx, ctrl_rx) = mpsc::channel(2);
            let rings = Arc::clone(rings);
            let shared2 = Arc::clone(&shared);
            let back_tx2 = back_tx.clone();
            let join = std::thread::Builder::new()
                .name(format!("tes-{name}"))
                .spawn(move || {
                    task_thread(rings, shared2, logic, ctrl_rx, back_tx2, id, size_mode)
                })?;
            tasks.push(TaskHandle { shared, ctrl_tx, join: Some(join) });

            // block until this task acks; a death anywhere aborts startup
            loop {
                match back_rx.recv().await {
                    Some((tid, Back::Init)) if tid == id => break,
                    Some((tid, Back::Died)) => {
                        anyhow::bail!("task #{tid} failed to initialize")
                    }
                    Some(_) => continue,
                    None => anyhow::bail!("task channel closed during startup"),
                }
            }
            log::debug!("task #{id} ({name}) initialized");
        }
        Ok((TaskSet { tasks }, back_rx))
    }

    /// Wake every active task that is not currently dispatching.
    pub fn wakeup_all(&self) {
        for t in &self.tasks {
            t.wakeup();
        }
    }

    /// For each ring, the head of the slowest active task. `None` when no
    /// task is active.
    pub fn slowest_heads<B: RingBackend>(&self, rings: &Rings<B>) -> Option<Vec<u32>> {
        let mut heads: Option<Vec<u32>> = None;
        for t in &self.tasks {
            if !t.shared.active.load(Ordering::Relaxed) {
                continue;
            }
            match &mut heads {
                None => {
                    heads = Some(
                        (0..rings.num_rings())
                            .map(|r| t.shared.heads[r].load(Ordering::Relaxed))
                            .collect(),
                    );
                }
                Some(hs) => {
                    for (r, h) in hs.iter_mut().enumerate() {
                        let th = t.shared.heads[r].load(Ordering::Relaxed);
                        *h = rings.earlier_id(r, *h, th);
                    }
                }
            }
        }
        heads
    }

    /// Ask every task to terminate and join it.
    pub async fn stop_all(&mut self) {
        for t in &mut self.tasks {
            log::debug!("stopping task ({})", t.shared.name);
            t.stop().await;
        }
    }
}

fn task_thread<B: RingBackend>(
    rings: Arc<Rings<B>>,
    shared: Arc<TaskShared>,
    logic: Box<dyn TaskLogic>,
    ctrl_rx: mpsc::Receiver<Ctrl>,
    back_tx: mpsc::Sender<(usize, Back)>,
    id: usize,
    size_mode: McaSizeMode,
) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("[{}] cannot build runtime: {e}", shared.name);
            let _ = back_tx.blocking_send((id, Back::Died));
            return;
        }
    };
    rt.block_on(run_task(rings, shared, logic, ctrl_rx, back_tx, id, size_mode));
}

async fn run_task<B: RingBackend>(
    rings: Arc<Rings<B>>,
    shared: Arc<TaskShared>,
    mut logic: Box<dyn TaskLogic>,
    mut ctrl_rx: mpsc::Receiver<Ctrl>,
    back_tx: mpsc::Sender<(usize, Back)>,
    id: usize,
    size_mode: McaSizeMode,
) {
    let name = shared.name;
    let specs = logic.endpoints();
    let (ev_tx, mut ev_rx) = mpsc::channel::<TaskEvent>(8);
    let mut ctx = TaskCtx {
        id,
        name,
        prev_pseq_mca: 0,
        prev_pseq_tr: 0,
        reply_txs: Vec::new(),
        publishers: Vec::new(),
        timer: None,
        want_activate: false,
    };

    for (i, spec) in specs.iter().enumerate() {
        let listener = match TcpListener::bind(("0.0.0.0", spec.port)).await {
            Ok(l) => l,
            Err(e) => {
                log::error!("[{name}] cannot bind port {}: {e}", spec.port);
                shared.error.store(true, Ordering::Relaxed);
                let _ = back_tx.send((id, Back::Died)).await;
                return;
            }
        };
        log::info!("[{name}] listening on port {}", spec.port);
        match spec.kind {
            EndpointKind::Rep => {
                let (reply_tx, reply_rx) = mpsc::channel(1);
                tokio::spawn(endpoint::rep_loop(listener, i, ev_tx.clone(), reply_rx));
                ctx.reply_txs.push(Some(reply_tx));
                ctx.publishers.push(None);
            }
            EndpointKind::Pub => {
                let publisher = endpoint::pub_endpoint(listener, i, ev_tx.clone());
                ctx.reply_txs.push(None);
                ctx.publishers.push(Some(publisher));
            }
        }
    }
    drop(ev_tx);

    if let Err(e) = logic.init(&mut ctx).await {
        log::error!("[{name}] cannot initialize: {e:#}");
        shared.error.store(true, Ordering::Relaxed);
        let _ = back_tx.send((id, Back::Died)).await;
        return;
    }

    if back_tx.send((id, Back::Init)).await.is_err() {
        return;
    }

    let mut seq =
        SeqState { prev_fseq: 0, just_activated: false };
    let mut dbg = DbgStats {
        wakeups: 0,
        wakeups_inactive: 0,
        wakeups_false: 0,
        rings_dispatched: 0,
        missed: 0,
    };

    if logic.autoactivate() {
        activate(&rings, &shared, &mut seq);
    }

    log::debug!("[{name}] polling");
    loop {
        let deadline = ctx.timer.unwrap_or_else(Instant::now);
        let flow = tokio::select! {
            biased;
            ctrl = ctrl_rx.recv() => match ctrl {
                None | Some(Ctrl::Stop) => {
                    log::debug!("[{name}] asked to terminate");
                    break;
                }
                Some(Ctrl::Wakeup) => {
                    if !shared.active.load(Ordering::Acquire) {
                        // signals queue up; a job may have finished since
                        dbg.wakeups_inactive += 1;
                        Flow::Continue
                    } else {
                        dbg.wakeups += 1;
                        loop {
                            shared.busy.store(true, Ordering::Release);
                            let flow = dispatch_cycle(
                                &rings, &shared, logic.as_mut(), &mut ctx,
                                &mut seq, &mut dbg, size_mode,
                            )
                            .await;
                            shared.busy.store(false, Ordering::Release);
                            // a frame may have landed between the last
                            // tail check and the busy-flag clear, with
                            // the coordinator skipping the wakeup
                            if flow != Flow::Continue || !has_work(&rings, &shared) {
                                break flow;
                            }
                        }
                    }
                }
            },
            Some(ev) = ev_rx.recv() => logic.on_event(&mut ctx, ev).await,
            _ = tokio::time::sleep_until(deadline), if ctx.timer.is_some() => {
                ctx.timer = None;
                logic.on_timer(&mut ctx).await
            }
        };

        match flow {
            Flow::Continue => {}
            Flow::Sleep => deactivate(&shared),
            Flow::Error => {
                shared.error.store(true, Ordering::Relaxed);
                break;
            }
        }
        if std::mem::take(&mut ctx.want_activate) {
            activate(&rings, &shared, &mut seq);
        }
    }

    logic.finalize(&mut ctx).await;
    // let the endpoint tasks drain any best-effort final reply before
    // this runtime (and its spawned tasks) goes away
    tokio::time::sleep(Duration::from_millis(100)).await;
    if shared.error.load(Ordering::Relaxed) {
        let _ = back_tx.send((id, Back::Died)).await;
    }
    log::debug!(
        "[{name}] done; woken up {} times ({} inactive, {} without new packets), \
         dispatched {} rings, missed {} frames",
        dbg.wakeups,
        dbg.wakeups_inactive,
        dbg.wakeups_false,
        dbg.rings_dispatched,
        dbg.missed,
    );
}

fn activate<B: RingBackend>(rings: &Rings<B>, shared: &TaskShared, seq: &mut SeqState) {
    for r in 0..rings.num_rings() {
        shared.heads[r].store(rings.head(r), Ordering::Relaxed);
    }
    seq.just_activated = true;
    shared.active.store(true, Ordering::Release);
}

fn deactivate(shared: &TaskShared) {
    shared.active.store(false, Ordering::Release);
}

fn has_work<B: RingBackend>(rings: &Rings<B>, shared: &TaskShared) -> bool {
    shared.active.load(Ordering::Acquire)
        && (0..rings.num_rings())
            .any(|r| shared.heads[r].load(Ordering::Relaxed) != rings.tail(r))
}

/// Drain the rings until there is no more work or a handler stops the
/// cycle.
#[allow(clippy::too_many_arguments)]
async fn dispatch_cycle<B: RingBackend>(
    rings: &Rings<B>,
    shared: &TaskShared,
    logic: &mut dyn TaskLogic,
    ctx: &mut TaskCtx,
    seq: &mut SeqState,
    dbg: &mut DbgStats,
    size_mode: McaSizeMode,
) -> Flow {
    let mut first = true;
    loop {
        let Some((ring, missed)) = next_ring(rings, shared, seq) else {
            if first {
                dbg.wakeups_false += 1;
            }
            return Flow::Continue;
        };
        first = false;
        dbg.rings_dispatched += 1;

        let flow =
            dispatch_ring(rings, shared, logic, ctx, seq, dbg, size_mode, ring, missed).await;
        seq.just_activated = false;

        match flow {
            Flow::Continue => continue,
            Flow::Sleep => {
                deactivate(shared);
                return Flow::Continue;
            }
            Flow::Error => return Flow::Error,
        }
    }
}

/// Choose the ring holding the next frame in sequence.
///
/// Normally that is the ring whose head frame is closest past
/// `prev_fseq`, counting the circular gap `(fseq - prev_fseq - 1) mod
/// 2^16`. On the first selection after activation there is no previous
/// sequence: take the globally earliest head, treating sequence A as
/// after B when `A - B` exceeds half the sequence space.
fn next_ring<B: RingBackend>(
    rings: &Rings<B>,
    shared: &TaskShared,
    seq: &mut SeqState,
) -> Option<(usize, u16)> {
    if seq.just_activated {
        let thres = u16::MAX >> 1;
        let mut next = None;
        for r in 0..rings.num_rings() {
            let head = shared.heads[r].load(Ordering::Relaxed);
            if rings.tail(r) == head {
                continue;
            }
            let cur_fseq = match Frame::new(rings.buf(r, head)) {
                Ok(pkt) => pkt.fseq(),
                Err(_) => 0,
            };
            if next.is_none() || cur_fseq.wrapping_sub(seq.prev_fseq) > thres {
                seq.prev_fseq = cur_fseq.wrapping_sub(1);
                next = Some((r, 0));
            }
        }
        next
    } else {
        let mut missed = u16::MAX;
        let mut next = None;
        for r in 0..rings.num_rings() {
            let head = shared.heads[r].load(Ordering::Relaxed);
            if rings.tail(r) == head {
                continue;
            }
            let cur_fseq = match Frame::new(rings.buf(r, head)) {
                Ok(pkt) => pkt.fseq(),
                Err(_) => 0,
            };
            let gap = cur_fseq.wrapping_sub(seq.prev_fseq).wrapping_sub(1);
            if gap <= missed {
                next = Some((r, gap));
                missed = gap;
                if gap == 0 {
                    break;
                }
            }
        }
        next
    }
}

/// Walk one ring from the task's private head towards the tail, handing
/// every frame to the packet handler.
#[allow(clippy::too_many_arguments)]
async fn dispatch_ring<B: RingBackend>(
    rings: &Rings<B>,
    shared: &TaskShared,
    logic: &mut dyn TaskLogic,
    ctx: &mut TaskCtx,
    seq: &mut SeqState,
    dbg: &mut DbgStats,
    size_mode: McaSizeMode,
    ring: usize,
    missed: u16,
) -> Flow {
    let mut first = true;
    loop {
        let head = shared.heads[ring].load(Ordering::Relaxed);
        if head == rings.tail(ring) {
            return Flow::Continue;
        }
        let slot = rings.buf(ring, head);
        let slot_len = slot.len() as u16;
        let pkt = match Frame::new(slot) {
            Ok(pkt) => pkt,
            Err(_) => {
                // runt slot, nothing to hand over
                log::debug!("[{}] runt slot of {slot_len} bytes", shared.name);
                shared.heads[ring].store(rings.following(ring, head), Ordering::Release);
                continue;
            }
        };

        let mut err = pkt.validate(size_mode);
        if !err.is_empty() {
            log::debug!("[{}] invalid frame: {err}", shared.name);
        }
        let mut flen = pkt.flen();
        if flen > slot_len {
            log::debug!(
                "[{}] frame too long (header says {flen}, slot is {slot_len})",
                shared.name
            );
            err |= FrameErrors::ETHLEN;
            flen = slot_len;
        }

        let cur_fseq = pkt.fseq();
        let fseq_gap = cur_fseq.wrapping_sub(seq.prev_fseq).wrapping_sub(1);
        debug_assert!(!first || fseq_gap == missed || seq.just_activated);
        first = false;
        dbg.missed += fseq_gap as u64;

        let flow = logic.on_packet(ctx, pkt, flen, fseq_gap, err).await;

        seq.prev_fseq = cur_fseq;
        if pkt.is_mca() {
            ctx.prev_pseq_mca = pkt.pseq();
        } else if pkt.is_trace_long() {
            ctx.prev_pseq_tr = pkt.pseq();
        }

        if flow != Flow::Continue {
            // the stopping frame stays under the private head; an
            // activation resync will skip it
            return flow;
        }
        shared.heads[ring].store(rings.following(ring, head), Ordering::Release);
    }
}
