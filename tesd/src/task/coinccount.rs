//! Coincidence counter.
//!
//! A client supplies coincidence patterns (per-channel minimum photon
//! counts) and a tick window; the task consumes frames through the same
//! grouping engine as the vector publisher and replies with one match
//! count per pattern once the window has elapsed.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use tespkt::{Frame, FrameErrors};

use crate::api::COINC_COUNT_REP_PORT;
use crate::task::coinc::{Conf, Grouper, NCHANNELS, VEC_UNRESOLVED};
use crate::task::{EndpointSpec, Flow, TaskCtx, TaskEvent, TaskLogic};

const MAX_PATTERNS: usize = 8;
/// Channel entry that matches anything.
pub const PAT_ANY: u8 = 0xff;

const STATUS_OK: u8 = 0;
const STATUS_EINV: u8 = 1;

struct Request {
    ticks: u64,
    conf: Conf,
    patterns: Vec<[u8; NCHANNELS]>,
}

impl Request {
    /// Wire shape: tick count, the grouping configuration, then the
    /// patterns.
    fn decode(mut buf: Bytes) -> Option<Request> {
        if buf.remaining() < 8 {
            return None;
        }
        let ticks = buf.get_u64_le();
        let conf = Conf::decode(buf.split_to(buf.remaining().min(1 + 2 + NCHANNELS * 4 * 4)))?;
        Some(Request { ticks, conf, patterns: Vec::new() })
    }
}

fn matches(vec: &[u8; NCHANNELS], pattern: &[u8; NCHANNELS]) -> bool {
    vec.iter().zip(pattern).all(|(v, p)| {
        *p == PAT_ANY || (*v != VEC_UNRESOLVED && *v >= *p)
    })
}

pub struct CoincCountTask {
    grouper: Grouper,
    patterns: Vec<[u8; NCHANNELS]>,
    counts: Vec<u64>,
    min_ticks: u64,
    ticks: u64,
    publishing: bool,
}

impl CoincCountTask {
    pub fn new() -> Self {
        CoincCountTask {
            grouper: Grouper::new(Conf::default()),
            patterns: Vec::new(),
            counts: Vec::new(),
            min_ticks: 0,
            ticks: 0,
            publishing: false,
        }
    }

    fn reply_counts(&self, ctx: &TaskCtx) {
        let mut buf = BytesMut::with_capacity(1 + 8 * self.counts.len());
        buf.put_u8(STATUS_OK);
        for c in &self.counts {
            buf.put_u64_le(*c);
        }
        ctx.reply(0, buf.freeze());
    }

    fn tally(&mut self, vec: [u8; NCHANNELS]) {
        for (pattern, count) in self.patterns.iter().zip(self.counts.iter_mut()) {
            if matches(&vec, pattern) {
                *count += 1;
            }
        }
    }
}

impl Default for CoincCountTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TaskLogic for CoincCountTask {
    fn name(&self) -> &'static str {
        "coinccount"
    }

    fn endpoints(&self) -> Vec<EndpointSpec> {
        vec![EndpointSpec::rep(COINC_COUNT_REP_PORT)]
    }

    async fn on_event(&mut self, ctx: &mut TaskCtx, ev: TaskEvent) -> Flow {
        let TaskEvent::Request { payload, .. } = ev else {
            return Flow::Continue;
        };

        // the pattern list trails the fixed-size part
        let fixed = 8 + 1 + 2 + NCHANNELS * 4 * 4;
        let trailing = payload.len().saturating_sub(fixed);
        let npatterns = trailing / NCHANNELS;
        let mut req = match Request::decode(payload.clone()) {
            Some(r) if r.ticks > 0 && npatterns > 0 && npatterns <= MAX_PATTERNS => r,
            _ => {
                log::info!("[{}] malformed request", ctx.name);
                ctx.reply(0, Bytes::from_static(&[STATUS_EINV]));
                return Flow::Continue;
            }
        };
        let mut rest = payload.slice(fixed..);
        for _ in 0..npatterns {
            let mut pat = [0u8; NCHANNELS];
            rest.copy_to_slice(&mut pat);
            req.patterns.push(pat);
        }

        log::info!(
            "[{}] counting {} pattern(s) over {} tick(s)",
            ctx.name,
            req.patterns.len(),
            req.ticks
        );
        self.grouper = Grouper::new(req.conf);
        self.counts = vec![0; req.patterns.len()];
        self.patterns = req.patterns;
        self.min_ticks = req.ticks;
        self.ticks = 0;
        self.publishing = false;
        ctx.request_activation();
        Flow::Continue
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
                self.tally(v);
            }
            self.ticks += 1;
            if self.ticks > self.min_ticks {
                self.reply_counts(ctx);
                return Flow::Sleep;
            }
            return Flow::Continue;
        }

        if let Some(v) = self.grouper.on_event(&pkt) {
            self.tally(v);
        }
        Flow::Continue
    }

    async fn finalize(&mut self, ctx: &mut TaskCtx) {
        // a request may still be waiting on its reply
        if !self.patterns.is_empty() && self.publishing {
            self.reply_counts(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matching_respects_wildcards() {
        assert!(matches(&[2, 0], &[1, PAT_ANY]));
        assert!(!matches(&[0, 1], &[1, PAT_ANY]));
        assert!(!matches(&[VEC_UNRESOLVED, 1], &[1, 1]));
        assert!(matches(&[3, 3], &[3, 3]));
    }
}
