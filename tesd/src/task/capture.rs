//! Capture-to-file task.
//!
//! One job at a time: open per-stream files under the data root, discard
//! everything until the first tick so the capture starts on a tick
//! boundary, then write payloads and fixed-width index records through
//! the double-buffered writers until the requested tick and event minima
//! are met. On completion the files are flushed, closed and truncated, a
//! 64-byte stats record is written next to them, the HDF5 converter is
//! handed the dataset list, and the client gets the reply.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use tespkt::{Frame, FrameErrors, McaSizeMode, HDR_LEN, TYPE_TRACE};

use crate::aiobuf::AioBuf;
use crate::api::{
    cap_status, CaptureCounts, CaptureMode, CaptureReply, CaptureRequest, OverwriteMode,
    CAPTURE_PORT,
};
use crate::hdf5::{ConvStatus, ConversionRequest, Converter, DatasetDesc};
use crate::pathutil::{self, PathError};
use crate::task::{EndpointSpec, Flow, TaskCtx, TaskEvent, TaskLogic};

const FIDX_LEN: u64 = 16;
const TIDX_LEN: u64 = 8;
const SIDX_LEN: u64 = 16;
const STAT_LEN: usize = 64;

/// Extension of the stats file written next to the streams.
const STATS_EXT: &str = "stats";

// Transformed packet type stored in the frame index.
const FTYPE_TICK: u8 = 7;
const FTYPE_MCA: u8 = 8;
const FTYPE_BAD: u8 = 9;

fn linear_etype(pkt_type: u8, tr_type: u8) -> u8 {
    if pkt_type == TYPE_TRACE {
        3 + tr_type
    } else {
        pkt_type
    }
}

/// Job statistics; the on-disk stats record is these eight words in
/// native byte order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Stats {
    ticks: u64,
    events: u64,
    traces: u64,
    hists: u64,
    frames: u64,
    frames_lost: u64,
    frames_dropped: u64,
    errors: u64,
}

impl Stats {
    fn to_bytes(self) -> [u8; STAT_LEN] {
        let mut out = [0u8; STAT_LEN];
        for (i, v) in [
            self.ticks,
            self.events,
            self.traces,
            self.hists,
            self.frames,
            self.frames_lost,
            self.frames_dropped,
            self.errors,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 8..(i + 1) * 8].copy_from_slice(&v.to_ne_bytes());
        }
        out
    }

    fn from_bytes(raw: &[u8; STAT_LEN]) -> Stats {
        let word = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[i * 8..(i + 1) * 8]);
            u64::from_ne_bytes(b)
        };
        Stats {
            ticks: word(0),
            events: word(1),
            traces: word(2),
            hists: word(3),
            frames: word(4),
            frames_lost: word(5),
            frames_dropped: word(6),
            errors: word(7),
        }
    }

    fn counts(&self) -> CaptureCounts {
        CaptureCounts {
            ticks: self.ticks,
            events: self.events,
            traces: self.traces,
            hists: self.hists,
            frames: self.frames,
            frames_lost: self.frames_lost,
            frames_dropped: self.frames_dropped,
        }
    }
}

/// One frame-index record: where the payload landed and what it was.
struct FrameIdx {
    start: u64,
    length: u32,
    esize: [u8; 2],
    changed: bool,
    pt: u8,
    hdr: bool,
    seq: bool,
}

impl FrameIdx {
    fn encode(&self) -> [u8; FIDX_LEN as usize] {
        let mut out = [0u8; FIDX_LEN as usize];
        out[0..8].copy_from_slice(&self.start.to_le_bytes());
        out[8..12].copy_from_slice(&self.length.to_le_bytes());
        out[12..14].copy_from_slice(&self.esize);
        out[14] = self.changed as u8;
        out[15] = (self.pt & 0x0f) | (self.hdr as u8) << 6 | (self.seq as u8) << 7;
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TickIdx {
    start_frame: u32,
    stop_frame: u32,
}

impl TickIdx {
    fn encode(&self) -> [u8; TIDX_LEN as usize] {
        let mut out = [0u8; TIDX_LEN as usize];
        out[0..4].copy_from_slice(&self.start_frame.to_le_bytes());
        out[4..8].copy_from_slice(&self.stop_frame.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StreamIdx {
    start: u64,
    length: u64,
}

impl StreamIdx {
    fn encode(&self) -> [u8; SIDX_LEN as usize] {
        let mut out = [0u8; SIDX_LEN as usize];
        out[0..8].copy_from_slice(&self.start.to_le_bytes());
        out[8..16].copy_from_slice(&self.length.to_le_bytes());
        out
    }
}

/// The multi-frame stream currently being assembled (trace or MCA).
#[derive(Default)]
struct CurStream {
    /// Declared total size; zero when no stream is in progress.
    size: u64,
    cur_size: u64,
    /// Trace when true, histogram when false.
    is_event: bool,
    /// Lost the thread of this stream; skip frames until the next header.
    discard: bool,
    idx: StreamIdx,
}

#[derive(Default)]
struct CurTick {
    idx: TickIdx,
    /// Non-tick event frames since the last tick.
    nframes: u64,
}

#[derive(Clone, Copy)]
enum DatKind {
    Bad,
    Mca,
    Tick,
    Event,
}

enum DatFiles {
    Single(AioBuf),
    PerType { bdat: AioBuf, mdat: AioBuf, tdat: AioBuf, edat: AioBuf },
}

struct Streams {
    fidx: AioBuf,
    midx: AioBuf,
    tidx: AioBuf,
    ridx: AioBuf,
    dat: DatFiles,
}

impl Streams {
    fn create(base: &std::path::Path, single_file: bool) -> std::io::Result<Streams> {
        let ab = |ext: &str| AioBuf::new(with_ext(base, ext));
        Ok(Streams {
            fidx: ab("fidx")?,
            midx: ab("midx")?,
            tidx: ab("tidx")?,
            ridx: ab("ridx")?,
            dat: if single_file {
                DatFiles::Single(ab("adat")?)
            } else {
                DatFiles::PerType {
                    bdat: ab("bdat")?,
                    mdat: ab("mdat")?,
                    tdat: ab("tdat")?,
                    edat: ab("edat")?,
                }
            },
        })
    }

    fn all_mut(&mut self) -> Vec<&mut AioBuf> {
        let mut v = vec![&mut self.fidx, &mut self.midx, &mut self.tidx, &mut self.ridx];
        match &mut self.dat {
            DatFiles::Single(adat) => v.push(adat),
            DatFiles::PerType { bdat, mdat, tdat, edat } => {
                v.extend([bdat, mdat, tdat, edat]);
            }
        }
        v
    }

    fn dat_mut(&mut self, kind: DatKind) -> &mut AioBuf {
        match &mut self.dat {
            DatFiles::Single(adat) => adat,
            DatFiles::PerType { bdat, mdat, tdat, edat } => match kind {
                DatKind::Bad => bdat,
                DatKind::Mca => mdat,
                DatKind::Tick => tdat,
                DatKind::Event => edat,
            },
        }
    }

}

/// `(dataset name, file path)` pairs for the HDF5 handoff.
fn dataset_list(base: &std::path::Path, single_file: bool) -> Vec<(&'static str, PathBuf)> {
    let mut v = vec![
        ("fidx", with_ext(base, "fidx")),
        ("midx", with_ext(base, "midx")),
        ("tidx", with_ext(base, "tidx")),
        ("ridx", with_ext(base, "ridx")),
    ];
    if single_file {
        v.push(("all data", with_ext(base, "adat")));
    } else {
        v.push(("bad", with_ext(base, "bdat")));
        v.push(("mca", with_ext(base, "mdat")));
        v.push(("ticks", with_ext(base, "tdat")));
        v.push(("events", with_ext(base, "edat")));
    }
    v
}

fn with_ext(base: &std::path::Path, ext: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

struct Job {
    base: PathBuf,
    measurement: String,
    min_ticks: u64,
    min_events: u64,
    overwrite: OverwriteMode,
    async_conversion: bool,
    mode: CaptureMode,
    stats: Stats,
    recording: bool,
    write_failed: bool,
    prev_etype: u8,
    prev_esize: [u8; 2],
    cur_stream: CurStream,
    cur_tick: CurTick,
    streams: Streams,
}

pub struct CaptureTask {
    data_root: PathBuf,
    single_file: bool,
    drop_bad_frames: bool,
    size_mode: McaSizeMode,
    converter: Arc<dyn Converter>,
    port: u16,
    job: Option<Job>,
}

impl CaptureTask {
    pub fn new(
        data_root: PathBuf,
        single_file: bool,
        drop_bad_frames: bool,
        size_mode: McaSizeMode,
        converter: Arc<dyn Converter>,
    ) -> Self {
        CaptureTask {
            data_root,
            single_file,
            drop_bad_frames,
            size_mode,
            converter,
            port: CAPTURE_PORT,
            job: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn reply(&self, ctx: &TaskCtx, status: u8, counts: CaptureCounts) {
        ctx.reply(0, CaptureReply { status, counts }.encode());
    }

    fn reply_err(&self, ctx: &TaskCtx, status: u8) {
        self.reply(ctx, status, CaptureCounts::default());
    }

    /// Validate the request and resolve the base path. Replies inline and
    /// returns None when the request cannot start a job.
    fn resolve(&self, ctx: &TaskCtx, req: &CaptureRequest) -> Option<(PathBuf, CaptureMode, OverwriteMode, u64)> {
        let Ok(overwrite) = OverwriteMode::try_from(req.overwrite) else {
            log::info!("[{}] invalid overwrite mode {}", ctx.name, req.overwrite);
            self.reply_err(ctx, cap_status::EINV);
            return None;
        };
        let Ok(mode) = CaptureMode::try_from(req.mode) else {
            log::info!("[{}] invalid capture mode {}", ctx.name, req.mode);
            self.reply_err(ctx, cap_status::EINV);
            return None;
        };
        if req.measurement.contains('/') {
            log::info!("[{}] measurement group contains a slash", ctx.name);
            self.reply_err(ctx, cap_status::EPERM);
            return None;
        }

        // asking for events without ticks implies at least one tick
        let min_ticks = if req.min_events != 0 && req.min_ticks == 0 { 1 } else { req.min_ticks };
        let nocapture = min_ticks == 0;
        if (mode == CaptureMode::ConvertOnly && !nocapture)
            || (mode == CaptureMode::CaptureOnly && nocapture)
        {
            log::info!("[{}] ambiguous request", ctx.name);
            self.reply_err(ctx, cap_status::EINV);
            return None;
        }

        // existence of a queried job is decided by its stats record, not
        // by the extension-less base path
        let base = match pathutil::canonicalize_under(&self.data_root, &req.filename, false) {
            Ok(p) => p,
            Err(PathError::DoesNotExist) => {
                log::info!("[{}] job '{}' not found", ctx.name, req.filename);
                self.reply_err(ctx, cap_status::EABORT);
                return None;
            }
            Err(PathError::NotUnderRoot) => {
                log::info!("[{}] filename '{}' is not allowed", ctx.name, req.filename);
                self.reply_err(ctx, cap_status::EPERM);
                return None;
            }
            Err(PathError::Io(e)) => {
                log::error!("[{}] cannot resolve '{}': {e}", ctx.name, req.filename);
                self.reply_err(ctx, cap_status::EFAIL);
                return None;
            }
        };
        Some((base, mode, overwrite, min_ticks))
    }

    fn read_stats(&self, base: &std::path::Path) -> std::io::Result<Stats> {
        let raw = std::fs::read(with_ext(base, STATS_EXT))?;
        let raw: [u8; STAT_LEN] = raw
            .try_into()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad stats file"))?;
        Ok(Stats::from_bytes(&raw))
    }

    fn write_stats(&self, base: &std::path::Path, stats: &Stats) -> std::io::Result<()> {
        let path = with_ext(base, STATS_EXT);
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create_new(true);
        use std::io::Write;
        opts.open(&path)?.write_all(&stats.to_bytes())
    }

    async fn convert(
        &self,
        base: &std::path::Path,
        measurement: &str,
        datasets: Vec<(&'static str, PathBuf)>,
        overwrite: OverwriteMode,
        async_run: bool,
    ) -> u8 {
        let req = ConversionRequest {
            hdf5_path: with_ext(base, "hdf5"),
            group: measurement.to_string(),
            datasets: datasets
                .into_iter()
                .map(|(name, path)| DatasetDesc::whole_file(name, path))
                .collect(),
            use_existing: overwrite != OverwriteMode::File,
            overwrite: overwrite != OverwriteMode::None,
            backup: overwrite == OverwriteMode::Relink,
            async_run,
        };
        match self.converter.convert(&req).await {
            ConvStatus::Ok => cap_status::OK,
            ConvStatus::Exists => cap_status::EABORT,
            ConvStatus::FinError => cap_status::EFIN,
            ConvStatus::Malformed | ConvStatus::InitError | ConvStatus::ConvError => {
                cap_status::ECONV
            }
        }
    }

    /// Status query / convert-only path: read the stats record, convert
    /// if asked, reply. Leaves the task inert.
    async fn handle_nocapture(&mut self, ctx: &TaskCtx, base: PathBuf, req: &CaptureRequest, overwrite: OverwriteMode, mode: CaptureMode) {
        let stats = match self.read_stats(&base) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("[{}] job '{}' not found", ctx.name, req.filename);
                self.reply_err(ctx, cap_status::EABORT);
                return;
            }
            Err(e) => {
                log::error!("[{}] cannot read stats: {e}", ctx.name);
                self.reply_err(ctx, cap_status::EFAIL);
                return;
            }
        };
        let mut status = cap_status::OK;
        if mode == CaptureMode::ConvertOnly {
            log::info!(
                "[{}] converting '{}', measurement '{}'",
                ctx.name,
                req.filename,
                req.measurement
            );
            status = self
                .convert(
                    &base,
                    &req.measurement,
                    dataset_list(&base, self.single_file),
                    overwrite,
                    req.async_conversion,
                )
                .await;
        } else {
            log::info!("[{}] status of '{}'", ctx.name, req.filename);
        }
        self.reply(ctx, status, stats.counts());
    }

    /// Open every stream file for a new job.
    fn open_job(&mut self, ctx: &TaskCtx, base: PathBuf, req: &CaptureRequest, mode: CaptureMode, overwrite: OverwriteMode, min_ticks: u64) -> bool {
        let mut streams = match Streams::create(&base, self.single_file) {
            Ok(s) => s,
            Err(e) => {
                log::error!("[{}] cannot set up streams: {e}", ctx.name);
                self.reply_err(ctx, cap_status::EFAIL);
                return false;
            }
        };
        let allow_overwrite = overwrite != OverwriteMode::None;
        let mut failed = None;
        for buf in streams.all_mut() {
            if let Err(e) = buf.open(allow_overwrite) {
                failed = Some((e, buf.path().to_path_buf()));
                break;
            }
        }
        if let Some((e, path)) = failed {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                log::info!("[{}] '{}' exists, job will not proceed", ctx.name, req.filename);
                self.reply_err(ctx, cap_status::EABORT);
            } else {
                log::error!("[{}] cannot open {}: {e}", ctx.name, path.display());
                self.reply_err(ctx, cap_status::EFAIL);
            }
            // release whatever did open; nothing was written yet
            for b in streams.all_mut() {
                let _ = b.close();
            }
            return false;
        }
        if allow_overwrite {
            // the stats file is rewritten with O_EXCL at the end
            let _ = std::fs::remove_file(with_ext(&base, STATS_EXT));
        }

        log::info!(
            "[{}] writing {} tick(s) and {} event(s) to '{}'",
            ctx.name,
            min_ticks,
            req.min_events,
            req.filename
        );
        self.job = Some(Job {
            base,
            measurement: req.measurement.clone(),
            min_ticks,
            min_events: req.min_events,
            overwrite,
            async_conversion: req.async_conversion,
            mode,
            stats: Stats::default(),
            recording: false,
            write_failed: false,
            prev_etype: 0,
            prev_esize: [0; 2],
            cur_stream: CurStream::default(),
            cur_tick: CurTick::default(),
            streams,
        });
        true
    }

    /// Wrap up the job: flush, close, truncate, write stats, convert,
    /// reply.
    async fn finish(&mut self, ctx: &TaskCtx) {
        let Some(mut job) = self.job.take() else {
            return;
        };
        for buf in job.streams.all_mut() {
            if let Err(e) = buf.flush().await {
                log::error!("[{}] cannot flush {}: {e}", ctx.name, buf.path().display());
                job.write_failed = true;
            }
            if let Err(e) = buf.close() {
                log::error!("[{}] cannot close {}: {e}", ctx.name, buf.path().display());
                job.write_failed = true;
            }
        }
        log::info!(
            "[{}] finished writing {} tick(s) and {} event(s)",
            ctx.name,
            job.stats.ticks,
            job.stats.events
        );

        let short =
            job.stats.ticks < job.min_ticks || job.stats.events < job.min_events;
        let mut status =
            if job.write_failed || short { cap_status::EWRT } else { cap_status::OK };

        if let Err(e) = self.write_stats(&job.base, &job.stats) {
            log::error!("[{}] cannot write stats: {e}", ctx.name);
            status = cap_status::EFIN;
        }

        if status == cap_status::OK && job.mode != CaptureMode::CaptureOnly {
            status = self
                .convert(
                    &job.base,
                    &job.measurement,
                    dataset_list(&job.base, self.single_file),
                    job.overwrite,
                    job.async_conversion,
                )
                .await;
        }

        self.reply(ctx, status, job.stats.counts());
    }
}

#[async_trait(?Send)]
impl TaskLogic for CaptureTask {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn endpoints(&self) -> Vec<EndpointSpec> {
        vec![EndpointSpec::rep(self.port)]
    }

    async fn on_event(&mut self, ctx: &mut TaskCtx, ev: TaskEvent) -> Flow {
        let TaskEvent::Request { payload, .. } = ev else {
            return Flow::Continue;
        };
        debug_assert!(self.job.is_none());
        let req = match CaptureRequest::decode(payload) {
            Ok(r) => r,
            Err(_) => {
                log::info!("[{}] malformed request", ctx.name);
                self.reply_err(ctx, cap_status::EINV);
                return Flow::Continue;
            }
        };
        let Some((base, mode, overwrite, min_ticks)) = self.resolve(ctx, &req) else {
            return Flow::Continue;
        };

        if min_ticks == 0 {
            self.handle_nocapture(ctx, base, &req, overwrite, mode).await;
            return Flow::Continue;
        }

        if self.open_job(ctx, base, &req, mode, overwrite, min_ticks) {
            // no reply until the job completes; join the fan-out
            ctx.request_activation();
        }
        Flow::Continue
    }

    async fn on_packet(
        &mut self,
        ctx: &mut TaskCtx,
        pkt: Frame<'_>,
        flen: u16,
        missed: u16,
        err: FrameErrors,
    ) -> Flow {
        let size_mode = self.size_mode;
        let drop_bad = self.drop_bad_frames;
        let Some(job) = self.job.as_mut() else {
            return Flow::Continue;
        };

        let is_tick = pkt.is_tick();
        if !job.recording {
            if !is_tick {
                return Flow::Continue; // wait for a tick boundary
            }
            job.recording = true;
        }

        let bad = !err.is_empty();
        if bad {
            job.stats.frames_dropped += 1;
            job.stats.errors |= err.bits() as u64;
            if drop_bad {
                return Flow::Continue;
            }
        }

        job.stats.frames += 1;
        job.stats.frames_lost += missed as u64;

        let paylen = (flen as usize).saturating_sub(HDR_LEN);
        let is_header = pkt.is_header();
        let is_mca = pkt.is_mca();
        let is_trace = pkt.is_trace_long();

        let mut finishing = false;

        // ---- tick and frame indices, and the payload file ----
        let mut fidx = FrameIdx {
            start: 0,
            length: paylen as u32,
            esize: pkt.esize_raw(),
            changed: false,
            pt: 0,
            hdr: is_header && (is_mca || is_trace),
            seq: missed > 0,
        };

        let dat_kind = if bad {
            fidx.pt = FTYPE_BAD;
            DatKind::Bad
        } else if is_mca {
            fidx.pt = FTYPE_MCA;
            DatKind::Mca
        } else if is_tick {
            fidx.pt = FTYPE_TICK;
            // close out the previous tick interval
            if job.stats.ticks > 0 {
                let rec = job.cur_tick.idx.encode();
                if let Err(e) = job.streams.tidx.stage(&rec).await {
                    log::error!("[{}] cannot write tick index: {e}", ctx.name);
                    job.write_failed = true;
                    finishing = true;
                }
            }
            job.cur_tick.nframes = 0;
            DatKind::Tick
        } else {
            let pt = linear_etype(pkt.etype_pkt(), pkt.etype_tr());
            fidx.pt = pt;
            let esize = pkt.esize_raw();
            if job.stats.frames > 1 && (job.prev_etype != pt || job.prev_esize != esize) {
                fidx.changed = true;
            }
            job.prev_etype = pt;
            job.prev_esize = esize;

            if job.cur_tick.nframes == 0 {
                // first event frame after a tick
                job.cur_tick.idx.start_frame = (job.stats.frames - 1) as u32;
                job.cur_tick.idx.stop_frame = job.cur_tick.idx.start_frame;
            } else {
                job.cur_tick.idx.stop_frame = (job.stats.frames - 1) as u32;
            }
            job.cur_tick.nframes += 1;
            DatKind::Event
        };

        {
            let dat = job.streams.dat_mut(dat_kind);
            fidx.start = dat.written() + dat.outstanding();
        }

        // ---- statistics and the stream index ----
        // Bad frames take no part in stream assembly.
        if !bad {
            let continues = ((is_trace && job.cur_stream.is_event)
                || (is_mca && !job.cur_stream.is_event))
                && job.cur_stream.size > 0
                && !is_header
                && missed == 0;
            let interrupts = !continues && job.cur_stream.size > 0;
            if interrupts {
                job.cur_stream.discard = true;
                job.cur_stream.size = 0;
                job.cur_stream.cur_size = 0;
            }
            // recomputed after an interruption so an interrupting header
            // starts its own stream
            let starts = (is_trace || is_mca) && is_header && job.cur_stream.size == 0;

            if starts || continues {
                if starts {
                    if is_trace {
                        job.cur_stream.size = pkt.trace_size() as u64;
                        job.cur_stream.is_event = true;
                    } else {
                        job.cur_stream.size = pkt.mca_size(size_mode) as u64;
                        job.cur_stream.is_event = false;
                    }
                    job.cur_stream.discard = false;
                    let dat = job.streams.dat_mut(if is_trace {
                        DatKind::Event
                    } else {
                        DatKind::Mca
                    });
                    job.cur_stream.idx.start = dat.written() + dat.outstanding();
                }

                job.cur_stream.cur_size += paylen as u64;
                if job.cur_stream.cur_size > job.cur_stream.size {
                    // overshoot: the declared size lied, drop the stream
                    job.cur_stream.size = 0;
                    job.cur_stream.cur_size = 0;
                    job.cur_stream.discard = true;
                } else if job.cur_stream.cur_size == job.cur_stream.size {
                    job.cur_stream.idx.length = job.cur_stream.size;
                    let rec = job.cur_stream.idx.encode();
                    job.cur_stream.size = 0;
                    job.cur_stream.cur_size = 0;
                    let sidx = if is_trace {
                        job.stats.events += 1;
                        job.stats.traces += 1;
                        &mut job.streams.ridx
                    } else {
                        job.stats.hists += 1;
                        &mut job.streams.midx
                    };
                    if let Err(e) = sidx.stage(&rec).await {
                        log::error!("[{}] cannot write stream index: {e}", ctx.name);
                        job.write_failed = true;
                        finishing = true;
                    }
                }
            } else if is_mca || is_trace {
                // missed the beginning of a stream, or mid-discard
                if !interrupts && !job.cur_stream.discard {
                    job.cur_stream.discard = true;
                }
            } else if is_tick {
                job.stats.ticks += 1;
                // strictly greater: the opening tick counts too
                if job.stats.ticks > job.min_ticks && job.stats.events >= job.min_events {
                    finishing = true;
                }
            } else {
                job.stats.events += pkt.event_nums() as u64;
            }
        }

        // ---- payload, then the frame index ----
        let payload = pkt.as_bytes().get(HDR_LEN..flen as usize).unwrap_or(&[]);
        if let Err(e) = job.streams.dat_mut(dat_kind).stage(payload).await {
            log::error!("[{}] cannot write payload: {e}", ctx.name);
            job.write_failed = true;
            finishing = true;
        }
        if let Err(e) = job.streams.fidx.stage(&fidx.encode()).await {
            log::error!("[{}] cannot write frame index: {e}", ctx.name);
            job.write_failed = true;
            finishing = true;
        }
        debug_assert!(
            job.stats.frames * FIDX_LEN
                == job.streams.fidx.written() + job.streams.fidx.outstanding()
        );

        if finishing {
            self.finish(ctx).await;
            return Flow::Sleep;
        }
        Flow::Continue
    }

    async fn finalize(&mut self, ctx: &mut TaskCtx) {
        // shutdown mid-job: flush what we have and leave honest files and
        // stats behind; the client gets a best-effort short-count reply
        if self.job.is_some() {
            self.finish(ctx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_index_record_layout() {
        let fidx = FrameIdx {
            start: 0x1122334455667788,
            length: 0xa0b0c0d0,
            esize: [3, 0],
            changed: true,
            pt: FTYPE_TICK,
            hdr: false,
            seq: true,
        };
        let raw = fidx.encode();
        assert_eq!(raw.len(), 16);
        assert_eq!(&raw[0..8], &0x1122334455667788u64.to_le_bytes());
        assert_eq!(&raw[8..12], &0xa0b0c0d0u32.to_le_bytes());
        assert_eq!(raw[12], 3);
        assert_eq!(raw[14], 1);
        assert_eq!(raw[15], FTYPE_TICK | 0x80);
    }

    #[test]
    fn ftype_byte_packs_flags() {
        let fidx = FrameIdx {
            start: 0,
            length: 0,
            esize: [0; 2],
            changed: false,
            pt: FTYPE_MCA,
            hdr: true,
            seq: false,
        };
        assert_eq!(fidx.encode()[15], FTYPE_MCA | 0x40);
    }

    #[test]
    fn stats_record_round_trips() {
        let st = Stats {
            ticks: 2,
            events: 10,
            traces: 1,
            hists: 3,
            frames: 16,
            frames_lost: 0,
            frames_dropped: 1,
            errors: 2,
        };
        let raw = st.to_bytes();
        assert_eq!(raw.len(), 64);
        assert_eq!(Stats::from_bytes(&raw), st);
    }

    #[test]
    fn event_type_transform_is_linear() {
        assert_eq!(linear_etype(tespkt::TYPE_PEAK, 0), 0);
        assert_eq!(linear_etype(tespkt::TYPE_AREA, 0), 1);
        assert_eq!(linear_etype(tespkt::TYPE_PULSE, 0), 2);
        assert_eq!(linear_etype(TYPE_TRACE, tespkt::TRACE_SGL), 3);
        assert_eq!(linear_etype(TYPE_TRACE, tespkt::TRACE_AVG), 4);
        assert_eq!(linear_etype(TYPE_TRACE, tespkt::TRACE_DP), 5);
        assert_eq!(linear_etype(TYPE_TRACE, tespkt::TRACE_DPTR), 6);
    }
}
