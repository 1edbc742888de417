//! Packet-info service: accumulate stream statistics over a requested
//! period and reply with the counters and the set of event types seen.

use async_trait::async_trait;

use tespkt::{Frame, FrameErrors, TYPE_TRACE};

use crate::api::{info_status, InfoReply, TimedRequest, INFO_PORT};
use crate::task::{EndpointSpec, Flow, TaskCtx, TaskEvent, TaskLogic};

/// Bit offset in the seen-types mask: 1-4 for peak/area/pulse plus one
/// per trace sub-type above that. Bit 0 stays clear.
fn type_bit(pkt_type: u8, tr_type: u8) -> u8 {
    if pkt_type == TYPE_TRACE {
        4 + tr_type
    } else {
        pkt_type + 1
    }
}

#[derive(Default)]
struct Acc {
    received: u64,
    missed: u64,
    bad: u64,
    ticks: u64,
    mcas: u64,
    traces: u64,
    events: u64,
    event_types: u8,
}

#[derive(Default)]
pub struct InfoTask {
    acc: Acc,
}

impl InfoTask {
    pub fn new() -> Self {
        InfoTask::default()
    }
}

#[async_trait(?Send)]
impl TaskLogic for InfoTask {
    fn name(&self) -> &'static str {
        "info"
    }

    fn endpoints(&self) -> Vec<EndpointSpec> {
        vec![EndpointSpec::rep(INFO_PORT)]
    }

    async fn on_event(&mut self, ctx: &mut TaskCtx, ev: TaskEvent) -> Flow {
        let TaskEvent::Request { payload, .. } = ev else {
            return Flow::Continue;
        };
        let req = match TimedRequest::decode(payload) {
            Ok(r) if r.timeout_s > 0 => r,
            _ => {
                log::info!("[{}] malformed request", ctx.name);
                ctx.reply(0, InfoReply { status: info_status::EINV, ..Default::default() }.encode());
                return Flow::Continue;
            }
        };
        log::info!("[{}] accumulating packet info for {} s", ctx.name, req.timeout_s);
        self.acc = Acc::default();
        ctx.set_timer(std::time::Duration::from_secs(req.timeout_s as u64));
        ctx.request_activation();
        Flow::Continue
    }

    async fn on_timer(&mut self, ctx: &mut TaskCtx) -> Flow {
        let acc = std::mem::take(&mut self.acc);
        log::info!(
            "[{}] packets: {} processed, {} missed, {} bad, {} ticks, {} mcas, \
             {} traces, {} other events",
            ctx.name,
            acc.received,
            acc.missed,
            acc.bad,
            acc.ticks,
            acc.mcas,
            acc.traces,
            acc.events
        );
        ctx.reply(
            0,
            InfoReply {
                status: info_status::OK,
                frames: acc.received,
                missed: acc.missed,
                bad: acc.bad,
                ticks: acc.ticks,
                mcas: acc.mcas,
                traces: acc.traces,
                other_events: acc.events,
                event_types: acc.event_types,
            }
            .encode(),
        );
        Flow::Sleep
    }

    async fn on_packet(
        &mut self,
        _ctx: &mut TaskCtx,
        pkt: Frame<'_>,
        _flen: u16,
        missed: u16,
        err: FrameErrors,
    ) -> Flow {
        let acc = &mut self.acc;
        let is_tick = pkt.is_tick();
        let is_header = pkt.is_header();
        let is_tr_header =
            (pkt.is_trace_long() && is_header) || pkt.is_trace_dp();
        let is_mca_header = pkt.is_mca() && is_header;
        let is_event = pkt.is_event() && !is_tick;

        acc.received += 1;
        acc.missed += missed as u64;
        if !err.is_empty() {
            acc.bad += 1;
        } else if is_tick {
            acc.ticks += 1;
        } else if is_mca_header {
            acc.mcas += 1;
        } else if is_tr_header {
            acc.traces += 1;
        } else if is_event && !pkt.is_trace() {
            acc.events += pkt.event_nums() as u64;
        }

        if is_event {
            acc.event_types |= 1 << type_bit(pkt.etype_pkt(), pkt.etype_tr());
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bits_are_disjoint() {
        let bits: Vec<u8> = [
            type_bit(tespkt::TYPE_PEAK, 0),
            type_bit(tespkt::TYPE_AREA, 0),
            type_bit(tespkt::TYPE_PULSE, 0),
            type_bit(TYPE_TRACE, tespkt::TRACE_SGL),
            type_bit(TYPE_TRACE, tespkt::TRACE_AVG),
            type_bit(TYPE_TRACE, tespkt::TRACE_DP),
            type_bit(TYPE_TRACE, tespkt::TRACE_DPTR),
        ]
        .to_vec();
        let mut mask = 0u8;
        for b in bits {
            assert!(b < 8);
            assert_eq!(mask & (1 << b), 0);
            mask |= 1 << b;
        }
        assert_eq!(mask, 0b1111_1110);
    }
}
