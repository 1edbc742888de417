//! Frame generation helpers.
//!
//! The readout chain normally produces these frames in gateware; building
//! them in software is only needed to drive the receive path in tests and
//! replay tools, so the builders favour clarity over speed.

use crate::{
    ETHERTYPE_EVENT, ETHERTYPE_MCA, HDR_LEN, MCA_HDR_LEN, TICK_HDR_LEN, TYPE_TRACE,
};

const DST_MAC: [u8; 6] = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
const SRC_MAC: [u8; 6] = [0x5a, 0xce, 0xbe, 0x00, 0x00, 0x01];

fn frame_header(ether_type: u16, flen: u16, fseq: u16, pseq: u16, esize: u16, etype: [u8; 2]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(flen as usize);
    buf.extend_from_slice(&DST_MAC);
    buf.extend_from_slice(&SRC_MAC);
    buf.extend_from_slice(&ether_type.to_be_bytes());
    buf.extend_from_slice(&flen.to_le_bytes());
    buf.extend_from_slice(&fseq.to_le_bytes());
    buf.extend_from_slice(&pseq.to_le_bytes());
    buf.extend_from_slice(&esize.to_le_bytes());
    buf.extend_from_slice(&etype);
    buf
}

fn event_etype(pkt_type: u8, tr_type: u8, tick: bool) -> [u8; 2] {
    [tr_type & 3, (tick as u8) << 1 | (pkt_type & 3) << 2]
}

/// Overwrite the frame sequence of an already-built frame.
pub fn set_fseq(buf: &mut [u8], fseq: u16) {
    buf[16..18].copy_from_slice(&fseq.to_le_bytes());
}

/// Overwrite the protocol sequence of an already-built frame.
pub fn set_pseq(buf: &mut [u8], pseq: u16) {
    buf[18..20].copy_from_slice(&pseq.to_le_bytes());
}

/// Builds a tick frame.
pub struct TickBuilder {
    fseq: u16,
    period: u32,
    ts: u64,
    ovrfl: u8,
    err: u8,
    cfd: u8,
    lost: u32,
}

impl Default for TickBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TickBuilder {
    pub fn new() -> Self {
        TickBuilder { fseq: 0, period: 0, ts: 0, ovrfl: 0, err: 0, cfd: 0, lost: 0 }
    }

    pub fn fseq(mut self, fseq: u16) -> Self {
        self.fseq = fseq;
        self
    }

    pub fn period(mut self, period: u32) -> Self {
        self.period = period;
        self
    }

    pub fn ts(mut self, ts: u64) -> Self {
        self.ts = ts;
        self
    }

    pub fn lost(mut self, lost: u32) -> Self {
        self.lost = lost;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let flen = (HDR_LEN + TICK_HDR_LEN) as u16;
        let mut buf = frame_header(
            ETHERTYPE_EVENT,
            flen,
            self.fseq,
            0,
            3,
            event_etype(0, 0, true),
        );
        buf.extend_from_slice(&self.period.to_le_bytes());
        buf.extend_from_slice(&[0u8, 2]); // flags: T bit set
        buf.extend_from_slice(&0u16.to_le_bytes()); // toff
        buf.extend_from_slice(&self.ts.to_le_bytes());
        buf.push(self.ovrfl);
        buf.push(self.err);
        buf.push(self.cfd);
        buf.push(0);
        buf.extend_from_slice(&self.lost.to_le_bytes());
        buf
    }
}

/// A single-frame event (peak, area or pulse) holding `payload` as its
/// event records. The payload length must be a multiple of `esize * 8`.
pub fn event_frame(pkt_type: u8, tr_type: u8, esize: u16, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() % (esize as usize * 8) == 0);
    let flen = (HDR_LEN + payload.len()) as u16;
    let mut buf = frame_header(
        ETHERTYPE_EVENT,
        flen,
        0,
        0,
        esize,
        event_etype(pkt_type, tr_type, false),
    );
    buf.extend_from_slice(payload);
    buf
}

/// The header frame of a multi-frame trace declaring `size` payload bytes.
pub fn trace_header(tr_type: u8, esize: u16, size: u16, payload: &[u8]) -> Vec<u8> {
    let flen = (HDR_LEN + payload.len()) as u16;
    let mut buf = frame_header(
        ETHERTYPE_EVENT,
        flen,
        0,
        0,
        esize,
        event_etype(TYPE_TRACE, tr_type, false),
    );
    let mut body = payload.to_vec();
    body[0..2].copy_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&body);
    buf
}

/// A continuation frame of a multi-frame trace.
pub fn trace_cont(tr_type: u8, pseq: u16, esize: u16, payload: &[u8]) -> Vec<u8> {
    let flen = (HDR_LEN + payload.len()) as u16;
    let mut buf = frame_header(
        ETHERTYPE_EVENT,
        flen,
        0,
        pseq,
        esize,
        event_etype(TYPE_TRACE, tr_type, false),
    );
    buf.extend_from_slice(payload);
    buf
}

/// The header frame of a histogram: the 40-byte MCA header plus the first
/// `bins`. `nbins_tot` sets the last-bin field.
pub fn mca_header(lvalue: u32, nbins_tot: u32, mfreq: u16, bins: &[u32]) -> Vec<u8> {
    let flen = (HDR_LEN + MCA_HDR_LEN + bins.len() * 4) as u16;
    let mut buf = frame_header(ETHERTYPE_MCA, flen, 0, 0, 0, [0, 0]);
    let size = (nbins_tot * 4 + MCA_HDR_LEN as u32).min(u16::MAX as u32) as u16;
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&((nbins_tot - 1) as u16).to_le_bytes());
    buf.extend_from_slice(&lvalue.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes()); // reserved
    buf.extend_from_slice(&mfreq.to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]); // flags
    buf.extend_from_slice(&0u64.to_le_bytes()); // total
    buf.extend_from_slice(&0u64.to_le_bytes()); // start time
    buf.extend_from_slice(&0u64.to_le_bytes()); // stop time
    for b in bins {
        buf.extend_from_slice(&b.to_le_bytes());
    }
    buf
}

/// A continuation frame of a histogram.
pub fn mca_cont(pseq: u16, bins: &[u32]) -> Vec<u8> {
    let flen = (HDR_LEN + bins.len() * 4) as u16;
    let mut buf = frame_header(ETHERTYPE_MCA, flen, 0, pseq, 0, [0, 0]);
    for b in bins {
        buf.extend_from_slice(&b.to_le_bytes());
    }
    buf
}
