//! MCA histogram publisher.
//!
//! Active only while at least one subscriber is connected. Accumulates
//! the frames of a histogram, driven by the protocol sequence, and
//! publishes the complete buffer the moment the last bin arrives. Any
//! discrepancy (sequence gap, a new header before the previous histogram
//! finished, more bins than the header declared) drops the histogram in
//! progress; accumulation resumes at the next header.

use async_trait::async_trait;
use bytes::Bytes;

use tespkt::{Frame, FrameErrors, McaSizeMode, HDR_LEN};

use crate::api::HIST_PUB_PORT;
use crate::task::{EndpointSpec, Flow, TaskCtx, TaskEvent, TaskLogic};

pub struct HistTask {
    size_mode: McaSizeMode,
    port: u16,
    subscribers: usize,
    nbins: u32,
    cur_nbins: u32,
    size: u64,
    cur_size: u64,
    discard: bool,
    buf: Vec<u8>,
    published: u64,
    dropped: u64,
}

impl HistTask {
    pub fn new(size_mode: McaSizeMode) -> Self {
        HistTask {
            size_mode,
            port: HIST_PUB_PORT,
            subscribers: 0,
            nbins: 0,
            cur_nbins: 0,
            size: 0,
            cur_size: 0,
            discard: true,
            buf: vec![0u8; size_mode.hist_maxsize() as usize],
            published: 0,
            dropped: 0,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn clear(&mut self) {
        self.nbins = 0;
        self.cur_nbins = 0;
        self.size = 0;
        self.cur_size = 0;
        self.discard = false;
    }
}

#[async_trait(?Send)]
impl TaskLogic for HistTask {
    fn name(&self) -> &'static str {
        "hist"
    }

    fn endpoints(&self) -> Vec<EndpointSpec> {
        vec![EndpointSpec::publish(self.port)]
    }

    async fn on_event(&mut self, ctx: &mut TaskCtx, ev: TaskEvent) -> Flow {
        let TaskEvent::Subscribers { count, .. } = ev else {
            return Flow::Continue;
        };
        let prev = self.subscribers;
        self.subscribers = count;
        if prev == 0 && count > 0 {
            log::debug!("[{}] first subscription, activating", ctx.name);
            self.clear();
            self.discard = true; // wait for the next header
            ctx.request_activation();
        } else if prev > 0 && count == 0 {
            log::debug!("[{}] last unsubscription, deactivating", ctx.name);
            return Flow::Sleep;
        }
        Flow::Continue
    }

    async fn on_packet(
        &mut self,
        ctx: &mut TaskCtx,
        pkt: Frame<'_>,
        flen: u16,
        _missed: u16,
        err: FrameErrors,
    ) -> Flow {
        if !err.is_empty() || !pkt.is_mca() {
            return Flow::Continue;
        }

        if !pkt.is_header() {
            if self.discard {
                return Flow::Continue;
            }
            let cur_pseq = pkt.pseq();
            if cur_pseq.wrapping_sub(ctx.prev_pseq_mca) != 1 {
                log::info!(
                    "[{}] frame out of protocol sequence: {} -> {}",
                    ctx.name,
                    ctx.prev_pseq_mca,
                    cur_pseq
                );
                self.discard = true;
                return Flow::Continue;
            }
        } else {
            if self.cur_nbins > 0 {
                log::warn!(
                    "[{}] new header while waiting for {} more bin(s)",
                    ctx.name,
                    self.nbins - self.cur_nbins
                );
                self.discard = true;
            }
            if self.discard {
                self.dropped += 1;
                log::debug!(
                    "[{}] discarded {} of {} histogram(s) so far",
                    ctx.name,
                    self.dropped,
                    self.dropped + self.published
                );
            }
            self.clear();
            self.nbins = pkt.mca_nbins_tot();
            self.size = pkt.mca_size(self.size_mode) as u64;
        }

        self.cur_nbins += pkt.mca_nbins() as u32;
        if self.cur_nbins > self.nbins {
            log::warn!(
                "[{}] extra bins: expected {}, got {}",
                ctx.name,
                self.nbins,
                self.cur_nbins
            );
            self.discard = true;
            return Flow::Continue;
        }

        let paylen = (flen as usize).saturating_sub(HDR_LEN);
        if self.cur_size as usize + paylen > self.buf.len() {
            self.discard = true;
            return Flow::Continue;
        }
        self.buf[self.cur_size as usize..self.cur_size as usize + paylen]
            .copy_from_slice(&pkt.as_bytes()[HDR_LEN..flen as usize]);
        self.cur_size += paylen as u64;

        if self.cur_nbins == self.nbins {
            debug_assert!(self.cur_size == self.size);
            ctx.publish(0, Bytes::copy_from_slice(&self.buf[..self.cur_size as usize]));
            self.published += 1;
            self.clear();
        } else {
            debug_assert!(self.cur_size < self.size);
        }
        Flow::Continue
    }
}
