//! Coincidence vector publisher.
//!
//! Events landing within the configured time window of each other form a
//! coincidence group; a group becomes a vector of per-channel photon
//! counts, derived from the configured measurement (area, peak height or
//! dot product) by counting how many of that channel's thresholds the
//! value reached. Completed vectors are published in batches at every
//! tick. Configuration arrives over the request socket and is persisted
//! to the config directory.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use tespkt::{Frame, FrameErrors};

use crate::api::{COINC_PUB_PORT, COINC_REP_PORT};
use crate::task::{EndpointSpec, Flow, TaskCtx, TaskEvent, TaskLogic};

const ENDP_REP: usize = 0;
const ENDP_PUB: usize = 1;

/// Detector channels feeding the coincidence logic.
pub const NCHANNELS: usize = 2;
/// Photon thresholds per channel; a zero threshold is unset.
pub const MAX_PHOTONS: usize = 4;
/// Vectors per published batch.
const MAX_VECS: usize = 1024;

const CONF_FILE: &str = "coinc.toml";

pub const STATUS_OK: u8 = 0;
pub const STATUS_EINV: u8 = 1;

/// An unresolvable channel entry in a vector.
pub const VEC_UNRESOLVED: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Measurement {
    Area,
    Peak,
    DotProduct,
}

impl TryFrom<u8> for Measurement {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, ()> {
        match v {
            0 => Ok(Measurement::Area),
            1 => Ok(Measurement::Peak),
            2 => Ok(Measurement::DotProduct),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Conf {
    pub measurement: Measurement,
    /// Maximum spread of time offsets within one group.
    pub window: u16,
    pub thresholds: [[u32; MAX_PHOTONS]; NCHANNELS],
}

impl Default for Conf {
    fn default() -> Self {
        Conf { measurement: Measurement::Area, window: 100, thresholds: [[0; MAX_PHOTONS]; NCHANNELS] }
    }
}

impl Conf {
    /// Wire shape: measurement, window, then per-channel thresholds.
    pub fn decode(mut buf: Bytes) -> Option<Conf> {
        if buf.remaining() < 1 + 2 + NCHANNELS * MAX_PHOTONS * 4 {
            return None;
        }
        let measurement = Measurement::try_from(buf.get_u8()).ok()?;
        let window = buf.get_u16_le();
        let mut thresholds = [[0u32; MAX_PHOTONS]; NCHANNELS];
        for ch in thresholds.iter_mut() {
            for t in ch.iter_mut() {
                *t = buf.get_u32_le();
            }
        }
        Some(Conf { measurement, window, thresholds })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(match self.measurement {
            Measurement::Area => 0,
            Measurement::Peak => 1,
            Measurement::DotProduct => 2,
        });
        buf.put_u16_le(self.window);
        for ch in &self.thresholds {
            for t in ch {
                buf.put_u32_le(*t);
            }
        }
        buf.freeze()
    }
}

/// Measurement value of a frame's leading event, when the frame carries
/// this measurement at all.
fn event_value(meas: Measurement, pkt: &Frame<'_>) -> Option<u32> {
    match meas {
        Measurement::Area => {
            if pkt.is_area()
                || pkt.is_pulse()
                || (pkt.is_trace() && !pkt.is_trace_avg() && pkt.is_header())
            {
                Some(pkt.event_area())
            } else {
                None
            }
        }
        Measurement::Peak => {
            if pkt.is_peak() {
                Some(pkt.peak_height() as u32)
            } else {
                None
            }
        }
        Measurement::DotProduct => {
            if (pkt.is_trace_dp() || pkt.is_trace_dptr()) && pkt.is_header() {
                Some(pkt.trace_dp_value().min(u32::MAX as u64) as u32)
            } else {
                None
            }
        }
    }
}

fn count_from_thresholds(value: u32, thresholds: &[u32; MAX_PHOTONS]) -> u8 {
    thresholds.iter().filter(|t| **t > 0 && value >= **t).count() as u8
}

/// Shared grouping engine: fold event frames into per-channel photon
/// vectors, closing a group when the window is exceeded or a tick
/// arrives.
pub struct Grouper {
    conf: Conf,
    cur: Option<Group>,
}

struct Group {
    vec: [u8; NCHANNELS],
    spread: u16,
}

impl Grouper {
    pub fn new(conf: Conf) -> Self {
        Grouper { conf, cur: None }
    }

    pub fn conf(&self) -> &Conf {
        &self.conf
    }

    /// Feed one event frame; returns a completed vector when this frame
    /// starts a new group.
    pub fn on_event(&mut self, pkt: &Frame<'_>) -> Option<[u8; NCHANNELS]> {
        let value = event_value(self.conf.measurement, pkt);
        let ch = pkt.event_flags(0).ch as usize;
        if ch >= NCHANNELS {
            return None;
        }
        let delay = pkt.event_toff(0);

        let count = match value {
            Some(v) => count_from_thresholds(v, &self.conf.thresholds[ch]),
            None => VEC_UNRESOLVED,
        };

        match &mut self.cur {
            Some(group) if (group.spread as u32 + delay as u32) <= self.conf.window as u32 => {
                group.spread = group.spread.saturating_add(delay);
                if group.vec[ch] == 0 || count == VEC_UNRESOLVED {
                    group.vec[ch] = count;
                } else if group.vec[ch] != VEC_UNRESOLVED {
                    group.vec[ch] = group.vec[ch].saturating_add(count);
                }
                None
            }
            _ => {
                let done = self.cur.take().map(|g| g.vec);
                let mut vec = [0u8; NCHANNELS];
                vec[ch] = count;
                self.cur = Some(Group { vec, spread: 0 });
                done
            }
        }
    }

    /// A tick closes the group in progress.
    pub fn on_tick(&mut self) -> Option<[u8; NCHANNELS]> {
        self.cur.take().map(|g| g.vec)
    }
}

pub struct CoincTask {
    confdir: Option<PathBuf>,
    conf: Conf,
    subscribers: usize,
    grouper: Grouper,
    vecs: Vec<[u8; NCHANNELS]>,
    ticks: u64,
    /// Discard everything before the first tick.
    publishing: bool,
}

impl CoincTask {
    pub fn new(confdir: Option<PathBuf>) -> Self {
        let conf: Conf = confdir
            .as_ref()
            .and_then(|d| std::fs::read_to_string(d.join(CONF_FILE)).ok())
            .and_then(|s| toml::from_str(&s).ok())
            .unwrap_or_default();
        CoincTask {
            confdir,
            conf,
            subscribers: 0,
            grouper: Grouper::new(conf),
            vecs: Vec::with_capacity(MAX_VECS),
            ticks: 0,
            publishing: false,
        }
    }

    fn save_conf(&self) {
        let Some(dir) = &self.confdir else {
            return;
        };
        match toml::to_string(&self.conf) {
            Ok(s) => {
                if let Err(e) = std::fs::write(dir.join(CONF_FILE), s) {
                    log::warn!("cannot save coincidence config: {e}");
                }
            }
            Err(e) => log::warn!("cannot serialize coincidence config: {e}"),
        }
    }

    /// Batch layout: measurement, window, tick count, vector count, then
    /// the vectors.
    fn publish_batch(&mut self, ctx: &TaskCtx) {
        if self.vecs.is_empty() {
            return;
        }
        let mut buf = BytesMut::with_capacity(16 + self.vecs.len() * NCHANNELS);
        buf.put_u8(match self.conf.measurement {
            Measurement::Area => 0,
            Measurement::Peak => 1,
            Measurement::DotProduct => 2,
        });
        buf.put_u16_le(self.conf.window);
        buf.put_u64_le(self.ticks);
        buf.put_u32_le(self.vecs.len() as u32);
        for v in &self.vecs {
            buf.put_slice(v);
        }
        ctx.publish(ENDP_PUB, buf.freeze());
        self.vecs.clear();
    }
}

#[async_trait(?Send)]
impl TaskLogic for CoincTask {
    fn name(&self) -> &'static str {
        "coinc"
    }

    fn endpoints(&self) -> Vec<EndpointSpec> {
        vec![EndpointSpec::rep(COINC_REP_PORT), EndpointSpec::publish(COINC_PUB_PORT)]
    }

    async fn on_event(&mut self, ctx: &mut TaskCtx, ev: TaskEvent) -> Flow {
        match ev {
            TaskEvent::Request { payload, .. } => {
                match Conf::decode(payload) {
                    Some(conf) => {
                        log::info!(
                            "[{}] window {}, measurement {:?}",
                            ctx.name,
                            conf.window,
                            conf.measurement
                        );
                        self.conf = conf;
                        self.save_conf();
                        // applied at next activation; immediately if idle
                        if self.subscribers == 0 {
                            self.grouper = Grouper::new(conf);
                        }
                        ctx.reply(ENDP_REP, Bytes::from_static(&[STATUS_OK]));
                    }
                    None => {
                        log::info!("[{}] malformed request", ctx.name);
                        ctx.reply(ENDP_REP, Bytes::from_static(&[STATUS_EINV]));
                    }
                }
                Flow::Continue
            }
            TaskEvent::Subscribers { count, .. } => {
                let prev = self.subscribers;
                self.subscribers = count;
                if prev == 0 && count > 0 {
                    log::debug!("[{}] first subscription, activating", ctx.name);
                    self.grouper = Grouper::new(self.conf);
                    self.vecs.clear();
                    self.ticks = 0;
                    self.publishing = false;
                    ctx.request_activation();
                } else if prev > 0 && count == 0 {
                    log::debug!("[{}] last unsubscription, deactivating", ctx.name);
                    return Flow::Sleep;
                }
                Flow::Continue
            }
        }
    }

    async fn on_packet(
        &mut self,
        ctx: &mut TaskCtx,
        pkt: Frame<'_>,
        _flen: u16,
        _missed: u16,
        err: FrameErrors,
    ) -> Flow {
        if !err.is_empty() || !pkt.is_event() {
            return Flow::Continue;
        }
        let is_tick = pkt.is_tick();
        if !self.publishing {
            if !is_tick {
                return Flow::Continue;
            }
            self.publishing = true;
        }

        if is_tick {
            if let Some(v) = self.grouper.on_tick() {
                self.vecs.push(v);
            }
            self.ticks += 1;
            self.publish_batch(ctx);
            return Flow::Continue;
        }

        if let Some(v) = self.grouper.on_event(&pkt) {
            self.vecs.push(v);
        }
        if self.vecs.len() >= MAX_VECS {
            self.publish_batch(ctx);
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tespkt::gen;

    #[test]
    fn thresholds_give_photon_counts() {
        let th = [100, 200, 300, 0];
        assert_eq!(count_from_thresholds(50, &th), 0);
        assert_eq!(count_from_thresholds(100, &th), 1);
        assert_eq!(count_from_thresholds(250, &th), 2);
        assert_eq!(count_from_thresholds(1000, &th), 3);
    }

    #[test]
    fn conf_wire_round_trip() {
        let mut conf = Conf::default();
        conf.window = 42;
        conf.thresholds[1][0] = 7;
        let got = Conf::decode(conf.encode()).unwrap();
        assert_eq!(got.window, 42);
        assert_eq!(got.thresholds[1][0], 7);
    }

    #[test]
    fn tick_closes_group() {
        let mut conf = Conf::default();
        conf.thresholds = [[1, 0, 0, 0]; NCHANNELS];
        let mut g = Grouper::new(conf);
        let mut raw = gen::event_frame(tespkt::TYPE_AREA, 0, 1, &[9, 0, 0, 0, 0, 0, 0, 0]);
        gen::set_fseq(&mut raw, 1);
        let pkt = Frame::new(&raw).unwrap();
        assert!(g.on_event(&pkt).is_none());
        let v = g.on_tick().unwrap();
        assert_eq!(v[0], 1);
        assert!(g.on_tick().is_none());
    }
}
