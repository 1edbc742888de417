//! Average-trace service.
//!
//! A client asks for the next average trace within a timeout. The task
//! activates, accumulates the first average-trace stream it sees up to
//! the size its header declares, replies with the payload (or a timeout
//! or dropped-trace status) and drops back out of the fan-out.

use async_trait::async_trait;

use tespkt::{Frame, FrameErrors, AVGTR_MAXSIZE, HDR_LEN};

use crate::api::{avgtr_reply, avgtr_status, TimedRequest, AVGTR_PORT};
use crate::task::{EndpointSpec, Flow, TaskCtx, TaskEvent, TaskLogic};

pub struct AvgTrTask {
    recording: bool,
    size: u64,
    cur_size: u64,
    buf: Vec<u8>,
}

impl AvgTrTask {
    pub fn new() -> Self {
        AvgTrTask { recording: false, size: 0, cur_size: 0, buf: vec![0u8; AVGTR_MAXSIZE] }
    }

    fn reset(&mut self) {
        self.recording = false;
        self.size = 0;
        self.cur_size = 0;
    }
}

impl Default for AvgTrTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TaskLogic for AvgTrTask {
    fn name(&self) -> &'static str {
        "avgtr"
    }

    fn endpoints(&self) -> Vec<EndpointSpec> {
        vec![EndpointSpec::rep(AVGTR_PORT)]
    }

    async fn on_event(&mut self, ctx: &mut TaskCtx, ev: TaskEvent) -> Flow {
        let TaskEvent::Request { payload, .. } = ev else {
            return Flow::Continue;
        };
        let req = match TimedRequest::decode(payload) {
            Ok(r) if r.timeout_s > 0 => r,
            _ => {
                log::info!("[{}] malformed request", ctx.name);
                ctx.reply(0, avgtr_reply(avgtr_status::EINV, &[]));
                return Flow::Continue;
            }
        };
        log::info!("[{}] requested a trace within {} s", ctx.name, req.timeout_s);
        ctx.set_timer(std::time::Duration::from_secs(req.timeout_s as u64));
        ctx.request_activation();
        Flow::Continue
    }

    async fn on_timer(&mut self, ctx: &mut TaskCtx) -> Flow {
        log::info!("[{}] average trace timed out", ctx.name);
        ctx.reply(0, avgtr_reply(avgtr_status::ETOUT, &[]));
        self.reset();
        Flow::Sleep
    }

    async fn on_packet(
        &mut self,
        ctx: &mut TaskCtx,
        pkt: Frame<'_>,
        flen: u16,
        _missed: u16,
        err: FrameErrors,
    ) -> Flow {
        if !pkt.is_trace_avg() {
            return Flow::Continue;
        }

        if !self.recording && pkt.is_header() {
            self.recording = true;
            self.size = pkt.trace_size() as u64;
        }
        if !self.recording {
            return Flow::Continue;
        }

        // a bad frame drops the whole trace
        let status = if !err.is_empty() {
            log::debug!("[{}] bad frame: {err}", ctx.name);
            Some(avgtr_status::EERR)
        } else if self.cur_size > 0
            && pkt.pseq().wrapping_sub(ctx.prev_pseq_tr) != 1
        {
            log::debug!(
                "[{}] protocol sequence mismatch after byte {}",
                ctx.name,
                self.cur_size
            );
            Some(avgtr_status::EERR)
        } else {
            let paylen = (flen as usize).saturating_sub(HDR_LEN);
            if self.cur_size as usize + paylen > self.buf.len() {
                Some(avgtr_status::EERR)
            } else {
                self.buf[self.cur_size as usize..self.cur_size as usize + paylen]
                    .copy_from_slice(&pkt.as_bytes()[HDR_LEN..flen as usize]);
                self.cur_size += paylen as u64;
                if self.cur_size >= self.size {
                    Some(avgtr_status::OK)
                } else {
                    None
                }
            }
        };

        let Some(status) = status else {
            return Flow::Continue;
        };

        ctx.cancel_timer();
        match status {
            avgtr_status::OK => {
                log::info!("[{}] average trace complete", ctx.name);
                ctx.reply(0, avgtr_reply(status, &self.buf[..self.size as usize]));
            }
            _ => {
                log::info!("[{}] discarded average trace", ctx.name);
                ctx.reply(0, avgtr_reply(status, &[]));
            }
        }
        self.reset();
        Flow::Sleep
    }
}
