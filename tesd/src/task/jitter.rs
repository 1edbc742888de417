//! Jitter histogram publisher.
//!
//! Tracks, for every non-reference-channel event, the delay since the
//! last reference-channel event and the delay until the next one; the
//! smaller of the two (negated when the event is closer to the upcoming
//! reference) picks a bin. The histogram has 1025 four-byte bins with
//! the middle bin meaning zero delay and the end bins catching under-
//! and overflow. It is published every N ticks.
//!
//! The reference channel and tick window are set over the request
//! socket and take effect at the next histogram; they are persisted to
//! the config directory so a restart keeps the last setting.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use tespkt::{Frame, FrameErrors};

use crate::api::{
    jitter_status, JitterRequest, JITTER_NBINS, JITTER_PUB_PORT, JITTER_REP_PORT,
};
use crate::task::{EndpointSpec, Flow, TaskCtx, TaskEvent, TaskLogic};

const ENDP_REP: usize = 0;
const ENDP_PUB: usize = 1;

/// Non-reference events tracked between two reference events.
const MAX_SIMULT_POINTS: usize = 16;
/// Added to the signed delay so bin 0 is underflow and the middle bin is
/// zero.
const BIN_OFFSET: i64 = (JITTER_NBINS as i64 - 1) / 2;

const CONF_FILE: &str = "jitter.toml";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Conf {
    ref_channel: u8,
    ticks: u64,
}

impl Default for Conf {
    fn default() -> Self {
        Conf { ref_channel: 0, ticks: 5 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Point {
    delay_since: u16,
    delay_until: u16,
}

pub struct JitterTask {
    confdir: Option<PathBuf>,
    /// Applied at the next histogram.
    conf: Conf,
    /// In effect for the current histogram.
    cur_conf: Conf,
    subscribers: usize,
    bins: Vec<u32>,
    ticks: u64,
    points: [Point; MAX_SIMULT_POINTS],
    cur_npts: usize,
    /// Discard frames until the first tick.
    publishing: bool,
}

impl JitterTask {
    pub fn new(confdir: Option<PathBuf>) -> Self {
        let conf = confdir
            .as_ref()
            .and_then(|d| std::fs::read_to_string(d.join(CONF_FILE)).ok())
            .and_then(|s| toml::from_str(&s).ok())
            .unwrap_or_default();
        JitterTask {
            confdir,
            conf,
            cur_conf: conf,
            subscribers: 0,
            bins: vec![0u32; JITTER_NBINS],
            ticks: 0,
            points: [Point::default(); MAX_SIMULT_POINTS],
            cur_npts: 0,
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
                    log::warn!("cannot save jitter config: {e}");
                }
            }
            Err(e) => log::warn!("cannot serialize jitter config: {e}"),
        }
    }

    /// Start a fresh histogram; the last tracked point carries over as
    /// the head of the queue.
    fn reset(&mut self) {
        self.cur_conf = self.conf;
        self.bins.iter_mut().for_each(|b| *b = 0);
        self.ticks = 0;
        self.publishing = false;
        if self.cur_npts > 0 {
            self.points[0] = self.points[self.cur_npts - 1];
            self.cur_npts = 1;
        }
    }

    fn encode_bins(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.bins.len() * 4);
        for b in &self.bins {
            buf.put_u32_le(*b);
        }
        buf
    }
}

#[async_trait(?Send)]
impl TaskLogic for JitterTask {
    fn name(&self) -> &'static str {
        "jitter"
    }

    fn endpoints(&self) -> Vec<EndpointSpec> {
        vec![EndpointSpec::rep(JITTER_REP_PORT), EndpointSpec::publish(JITTER_PUB_PORT)]
    }

    async fn on_event(&mut self, ctx: &mut TaskCtx, ev: TaskEvent) -> Flow {
        match ev {
            TaskEvent::Request { payload, .. } => {
                let req = match JitterRequest::decode(payload) {
                    // two detector channels; delays beyond the window
                    // saturate into the end bins
                    Ok(r) if r.ticks > 0 && r.ref_channel <= 1 => r,
                    _ => {
                        log::info!("[{}] malformed request", ctx.name);
                        ctx.reply(ENDP_REP, Bytes::from_static(&[jitter_status::EINV]));
                        return Flow::Continue;
                    }
                };
                log::info!(
                    "[{}] reference channel {}, publishing every {} tick(s)",
                    ctx.name,
                    req.ref_channel,
                    req.ticks
                );
                self.conf = Conf { ref_channel: req.ref_channel, ticks: req.ticks };
                self.save_conf();
                ctx.reply(ENDP_REP, Bytes::from_static(&[jitter_status::OK]));
                Flow::Continue
            }
            TaskEvent::Subscribers { count, .. } => {
                let prev = self.subscribers;
                self.subscribers = count;
                if prev == 0 && count > 0 {
                    log::debug!("[{}] first subscription, activating", ctx.name);
                    self.reset();
                    // wait for the first reference frame
                    self.points[0] = Point::default();
                    self.cur_npts = 0;
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
        debug_assert!(self.cur_conf.ticks > 0);

        let is_tick = pkt.is_tick();
        if !self.publishing && is_tick {
            self.publishing = true;
        }
        if !self.publishing || !err.is_empty() || !pkt.is_event() {
            return Flow::Continue;
        }

        if is_tick {
            self.ticks += 1;
        }

        let delay = pkt.event_toff(0);
        let ch = pkt.event_flags(0).ch;

        if ch == self.cur_conf.ref_channel && !is_tick {
            // reference frame: bin every completed point
            for p in 0..self.cur_npts.saturating_sub(1) {
                let pt = &mut self.points[p];
                pt.delay_until = pt.delay_until.saturating_add(delay);
                let mut bin = pt.delay_since as i64;
                if bin > pt.delay_until as i64 {
                    bin = -(pt.delay_until as i64);
                }
                let bin = (bin + BIN_OFFSET).clamp(0, JITTER_NBINS as i64 - 1) as usize;
                self.bins[bin] += 1;
                *pt = Point::default();
            }
            self.cur_npts = 1;
        } else if self.cur_npts > 0 {
            // with no reference seen yet there is nothing to track
            if !is_tick && self.cur_npts < MAX_SIMULT_POINTS - 1 {
                // the latest point carries the largest delay so far
                self.points[self.cur_npts] = Point {
                    delay_since: self.points[self.cur_npts - 1].delay_since,
                    delay_until: 0,
                };
                self.cur_npts += 1;
            }
            for p in 0..self.cur_npts {
                let pt = &mut self.points[p];
                pt.delay_since = pt.delay_since.saturating_add(delay);
            }
        }

        if self.ticks >= self.cur_conf.ticks + 1 {
            ctx.publish(ENDP_PUB, self.encode_bins().freeze());
            self.reset();
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_offset_centers_the_histogram() {
        assert_eq!(BIN_OFFSET, 512);
        assert_eq!(JITTER_NBINS, 1025);
    }

    #[test]
    fn encoded_histogram_is_4100_bytes() {
        let t = JitterTask::new(None);
        assert_eq!(t.encode_bins().len(), crate::api::JITTER_SIZE);
    }
}
