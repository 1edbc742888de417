//! Read-only accessors over raw TES ethernet frames.
//!
//! The FPGA front-end emits two EtherTypes: event frames (peaks, areas,
//! pulses, traces and ticks) and MCA histogram frames. Every frame starts
//! with a fixed 24-byte header:
//!
//! ```text
//! [0..6]   destination MAC
//! [6..12]  source MAC
//! [12..14] EtherType (big-endian): 0x88B5 event, 0x88B6 MCA
//! [14..16] frame length, including this header
//! [16..18] frame sequence, wraps at 2^16
//! [18..20] protocol sequence, resets at each stream header
//! [20..22] event size in 8-byte units (undefined for MCA)
//! [22..24] event type (undefined for MCA)
//! ```
//!
//! Multi-byte payload integers are little-endian on the wire; only the
//! EtherType is network order. Accessors decode each field at its declared
//! width, so wide fields (tick timestamp, MCA totals, bins) come out
//! correctly on any host.
//!
//! Accessors documented for a particular frame kind must only be called on
//! that kind; callers gate on the predicates (`is_tick`, `is_mca`, ...) or
//! on [`Frame::validate`] first.

use bitflags::bitflags;

pub mod gen;

/// Length of the frame header, including the ethernet part.
pub const HDR_LEN: usize = 24;
/// Length of the MCA header at the start of a histogram stream.
pub const MCA_HDR_LEN: usize = 40;
pub const TICK_HDR_LEN: usize = 24;
pub const PEAK_HDR_LEN: usize = 8;
pub const AREA_HDR_LEN: usize = 8;
pub const PULSE_HDR_LEN: usize = 16;
pub const TRACE_HDR_LEN: usize = 8;
pub const TRACE_FULL_HDR_LEN: usize = 16;
/// Width of one histogram bin.
pub const MCA_BIN_LEN: usize = 4;
/// Largest frame the FPGA will emit.
pub const MTU: usize = 1496;

pub const ETHERTYPE_EVENT: u16 = 0x88B5;
pub const ETHERTYPE_MCA: u16 = 0x88B6;

/// Largest complete histogram, header included, when the size field is
/// trusted (highest 16-bit multiple of 8).
pub const HIST_MAXSIZE_FROM_FIELD: u32 = 65528;
/// Largest complete histogram when the size is derived from the last-bin
/// field (the FPGA size-field bug work-around).
pub const HIST_MAXSIZE_FROM_LAST_BIN: u32 = 65576;
/// Largest complete average trace.
pub const AVGTR_MAXSIZE: usize = 65528;

/// Packet type codes in the event-type byte.
pub const TYPE_PEAK: u8 = 0;
pub const TYPE_AREA: u8 = 1;
pub const TYPE_PULSE: u8 = 2;
pub const TYPE_TRACE: u8 = 3;

/// Trace sub-type codes.
pub const TRACE_SGL: u8 = 0;
pub const TRACE_AVG: u8 = 1;
pub const TRACE_DP: u8 = 2;
pub const TRACE_DPTR: u8 = 3;

/// The FPGA ships a size field that disagrees with the last-bin field on
/// some firmware revisions. Histogram sizes are computed from whichever
/// side of that disagreement the deployment trusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum McaSizeMode {
    /// Trust the header's size field.
    FromSizeField,
    /// Recompute from `last_bin`: `(last_bin + 1) * 4 + MCA_HDR_LEN`.
    #[default]
    FromLastBin,
}

impl McaSizeMode {
    pub fn hist_maxsize(self) -> u32 {
        match self {
            McaSizeMode::FromSizeField => HIST_MAXSIZE_FROM_FIELD,
            McaSizeMode::FromLastBin => HIST_MAXSIZE_FROM_LAST_BIN,
        }
    }
}

bitflags! {
    /// Bitmask returned by [`Frame::validate`]. Bit values are part of the
    /// on-disk capture format (the stats error register) and must not be
    /// renumbered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameErrors: u32 {
        const ETHTYPE  = 1;
        const ETHLEN   = 2;
        const EVTTYPE  = 4;
        const EVTSIZE  = 8;
        const TRSIZE   = 16;
        const MCASIZE  = 32;
        const MCABINS  = 64;
    }
}

impl FrameErrors {
    /// Fixed description for a single error bit.
    pub fn describe(bit: FrameErrors) -> &'static str {
        if bit == FrameErrors::ETHTYPE {
            "Invalid ether type"
        } else if bit == FrameErrors::ETHLEN {
            "Invalid frame length"
        } else if bit == FrameErrors::EVTTYPE {
            "Invalid event type"
        } else if bit == FrameErrors::EVTSIZE {
            "Invalid event size"
        } else if bit == FrameErrors::TRSIZE {
            "Invalid trace size"
        } else if bit == FrameErrors::MCASIZE {
            "Invalid histogram size"
        } else if bit == FrameErrors::MCABINS {
            "Invalid bin number in histogram"
        } else {
            "Unknown error"
        }
    }
}

impl std::fmt::Display for FrameErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for bit in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(Self::describe(bit))?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PktError {
    #[error("frame shorter than the {HDR_LEN}-byte header")]
    Truncated,
}

/// Event flags common to all event kinds (second field of each event
/// header).
#[derive(Debug, Clone, Copy)]
pub struct EventFlags {
    pub ch: u8,
    pub o: bool,
    pub pc: u8,
    pub n: bool,
    pub t: bool,
    pub pt: u8,
    pub ht: u8,
    pub tt: u8,
}

/// Tick flags.
#[derive(Debug, Clone, Copy)]
pub struct TickFlags {
    pub tl: bool,
    pub el: bool,
    pub mf: bool,
    pub n: bool,
    pub t: bool,
}

/// Trace flags.
#[derive(Debug, Clone, Copy)]
pub struct TraceFlags {
    pub str_: u8,
    pub mp: bool,
    pub mh: bool,
    pub tt: u8,
    pub ts: u8,
    pub off: u8,
}

/// MCA flags.
#[derive(Debug, Clone, Copy)]
pub struct McaFlags {
    pub q: u8,
    pub t: u8,
    pub v: u8,
    pub c: u8,
    pub n: u8,
}

/// A borrowed view over one frame's bytes.
///
/// The slice is the ring slot's contents; it may be longer than the frame
/// (slots are MTU-sized) and, for clipped frames, shorter than the length
/// the header declares.
#[derive(Clone, Copy)]
pub struct Frame<'a> {
    buf: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Frame<'a>, PktError> {
        if buf.len() < HDR_LEN {
            return Err(PktError::Truncated);
        }
        Ok(Frame { buf })
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }

    #[inline]
    fn u16_at(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.buf[off], self.buf[off + 1]])
    }

    #[inline]
    fn u32_at(&self, off: usize) -> u32 {
        u32::from_le_bytes([
            self.buf[off],
            self.buf[off + 1],
            self.buf[off + 2],
            self.buf[off + 3],
        ])
    }

    #[inline]
    fn u64_at(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.buf[off..off + 8]);
        u64::from_le_bytes(b)
    }

    pub fn dst_mac(&self) -> [u8; 6] {
        let mut m = [0u8; 6];
        m.copy_from_slice(&self.buf[0..6]);
        m
    }

    pub fn src_mac(&self) -> [u8; 6] {
        let mut m = [0u8; 6];
        m.copy_from_slice(&self.buf[6..12]);
        m
    }

    fn ether_type(&self) -> u16 {
        u16::from_be_bytes([self.buf[12], self.buf[13]])
    }

    /// Frame length as declared in the header, ethernet part included.
    pub fn flen(&self) -> u16 {
        self.u16_at(14)
    }

    pub fn fseq(&self) -> u16 {
        self.u16_at(16)
    }

    pub fn pseq(&self) -> u16 {
        self.u16_at(18)
    }

    /// True for the first frame of a multi-frame stream.
    pub fn is_header(&self) -> bool {
        // byte order is irrelevant for a zero test
        self.buf[18] == 0 && self.buf[19] == 0
    }

    pub fn is_mca(&self) -> bool {
        self.ether_type() == ETHERTYPE_MCA
    }

    pub fn is_event(&self) -> bool {
        self.ether_type() == ETHERTYPE_EVENT
    }

    /// Tick bit of the event-type pair.
    fn etype_tick(&self) -> bool {
        self.buf[23] >> 1 & 1 == 1
    }

    /// Packet type of the event-type pair.
    pub fn etype_pkt(&self) -> u8 {
        self.buf[23] >> 2 & 3
    }

    /// Trace sub-type of the event-type pair.
    pub fn etype_tr(&self) -> u8 {
        self.buf[22] & 3
    }

    pub fn is_tick(&self) -> bool {
        self.is_event() && self.etype_tick()
    }

    pub fn is_peak(&self) -> bool {
        self.is_event() && !self.etype_tick() && self.etype_pkt() == TYPE_PEAK
    }

    pub fn is_area(&self) -> bool {
        self.is_event() && !self.etype_tick() && self.etype_pkt() == TYPE_AREA
    }

    pub fn is_pulse(&self) -> bool {
        self.is_event() && !self.etype_tick() && self.etype_pkt() == TYPE_PULSE
    }

    pub fn is_trace(&self) -> bool {
        self.is_event() && !self.etype_tick() && self.etype_pkt() == TYPE_TRACE
    }

    /// A trace that spans multiple frames, i.e. anything but a pure
    /// dot-product.
    pub fn is_trace_long(&self) -> bool {
        self.is_trace() && self.etype_tr() != TRACE_DP
    }

    pub fn is_trace_sgl(&self) -> bool {
        self.is_trace() && self.etype_tr() == TRACE_SGL
    }

    pub fn is_trace_avg(&self) -> bool {
        self.is_trace() && self.etype_tr() == TRACE_AVG
    }

    pub fn is_trace_dp(&self) -> bool {
        self.is_trace() && self.etype_tr() == TRACE_DP
    }

    pub fn is_trace_dptr(&self) -> bool {
        self.is_trace() && self.etype_tr() == TRACE_DPTR
    }

    /// Event size in 8-byte units. Undefined for MCA frames.
    pub fn esize(&self) -> u16 {
        self.u16_at(20)
    }

    /// Raw event-size field bytes, preserved for the frame index.
    pub fn esize_raw(&self) -> [u8; 2] {
        [self.buf[20], self.buf[21]]
    }

    /// Event size in bytes.
    pub fn true_esize(&self) -> u16 {
        self.esize() << 3
    }

    /// Number of events in an event frame.
    pub fn event_nums(&self) -> u16 {
        if self.is_trace() {
            return if self.is_header() || self.is_trace_dp() { 1 } else { 0 };
        }
        let esize = self.true_esize();
        if esize == 0 {
            return 0;
        }
        (self.flen() as usize - HDR_LEN) as u16 / esize
    }

    /// Time offset of event `e` within the frame.
    pub fn event_toff(&self, e: u16) -> u16 {
        self.u16_at(HDR_LEN + e as usize * self.true_esize() as usize + 6)
    }

    /// Flags of event `e` within the frame.
    pub fn event_flags(&self, e: u16) -> EventFlags {
        let off = HDR_LEN + e as usize * self.true_esize() as usize + 4;
        let lo = self.buf[off];
        let hi = self.buf[off + 1];
        EventFlags {
            ch: lo & 7,
            o: lo >> 3 & 1 == 1,
            pc: lo >> 4,
            n: hi & 1 == 1,
            t: hi >> 1 & 1 == 1,
            pt: hi >> 2 & 3,
            ht: hi >> 4 & 3,
            tt: hi >> 6,
        }
    }

    /// Area of the event: the area header for area frames, the embedded
    /// pulse header otherwise (pulses and non-average traces).
    pub fn event_area(&self) -> u32 {
        if self.is_area() {
            self.u32_at(HDR_LEN)
        } else {
            self.u32_at(HDR_LEN + 8)
        }
    }

    // ---- tick frames ----

    pub fn tick_period(&self) -> u32 {
        self.u32_at(HDR_LEN)
    }

    pub fn tick_flags(&self) -> TickFlags {
        let lo = self.buf[HDR_LEN + 4];
        let hi = self.buf[HDR_LEN + 5];
        TickFlags {
            tl: lo & 1 == 1,
            el: lo >> 1 & 1 == 1,
            mf: lo >> 2 & 1 == 1,
            n: hi & 1 == 1,
            t: hi >> 1 & 1 == 1,
        }
    }

    pub fn tick_toff(&self) -> u16 {
        self.u16_at(HDR_LEN + 6)
    }

    pub fn tick_ts(&self) -> u64 {
        self.u64_at(HDR_LEN + 8)
    }

    pub fn tick_ovrfl(&self) -> u8 {
        self.buf[HDR_LEN + 16]
    }

    pub fn tick_err(&self) -> u8 {
        self.buf[HDR_LEN + 17]
    }

    pub fn tick_cfd(&self) -> u8 {
        self.buf[HDR_LEN + 18]
    }

    pub fn tick_lost(&self) -> u32 {
        self.u32_at(HDR_LEN + 20)
    }

    // ---- peak frames ----

    pub fn peak_height(&self) -> u16 {
        self.u16_at(HDR_LEN)
    }

    pub fn peak_rise_time(&self) -> u16 {
        self.u16_at(HDR_LEN + 2)
    }

    // ---- area frames ----

    pub fn area_area(&self) -> u32 {
        self.u32_at(HDR_LEN)
    }

    // ---- pulse frames ----

    pub fn pulse_size(&self) -> u16 {
        self.u16_at(HDR_LEN)
    }

    pub fn pulse_area(&self) -> u32 {
        self.u32_at(HDR_LEN + 8)
    }

    pub fn pulse_len(&self) -> u16 {
        self.u16_at(HDR_LEN + 12)
    }

    pub fn pulse_toff(&self) -> u16 {
        self.u16_at(HDR_LEN + 14)
    }

    // ---- trace frames (header frames only) ----

    /// Declared size of the full trace payload.
    pub fn trace_size(&self) -> u16 {
        self.u16_at(HDR_LEN)
    }

    pub fn trace_flags(&self) -> TraceFlags {
        let lo = self.buf[HDR_LEN + 2];
        let hi = self.buf[HDR_LEN + 3];
        TraceFlags {
            str_: lo & 0x1f,
            mp: lo >> 5 & 1 == 1,
            mh: lo >> 6 & 1 == 1,
            tt: hi & 3,
            ts: hi >> 2 & 3,
            off: hi >> 4,
        }
    }

    pub fn trace_area(&self) -> u32 {
        self.u32_at(HDR_LEN + 8)
    }

    pub fn trace_len(&self) -> u16 {
        self.u16_at(HDR_LEN + 12)
    }

    pub fn trace_toff(&self) -> u16 {
        self.u16_at(HDR_LEN + 14)
    }

    /// Dot product of a dot-product trace (48 bits on the wire; header
    /// frames only).
    pub fn trace_dp_value(&self) -> u64 {
        let mut b = [0u8; 8];
        b[..6].copy_from_slice(&self.buf[HDR_LEN + 18..HDR_LEN + 24]);
        u64::from_le_bytes(b)
    }

    // ---- MCA frames ----

    /// Number of bins in this frame.
    pub fn mca_nbins(&self) -> u16 {
        let pay = (self.flen() as usize).saturating_sub(HDR_LEN);
        let pay = if self.is_header() { pay.saturating_sub(MCA_HDR_LEN) } else { pay };
        (pay / MCA_BIN_LEN) as u16
    }

    /// Number of bins in the entire histogram (header frames only).
    pub fn mca_nbins_tot(&self) -> u32 {
        self.u16_at(HDR_LEN + 2) as u32 + 1
    }

    /// Size of the histogram including its header (header frames only).
    pub fn mca_size(&self, mode: McaSizeMode) -> u32 {
        match mode {
            McaSizeMode::FromSizeField => self.u16_at(HDR_LEN) as u32,
            McaSizeMode::FromLastBin => {
                self.mca_nbins_tot() * MCA_BIN_LEN as u32 + MCA_HDR_LEN as u32
            }
        }
    }

    pub fn mca_lvalue(&self) -> u32 {
        self.u32_at(HDR_LEN + 4)
    }

    pub fn mca_mfreq(&self) -> u16 {
        self.u16_at(HDR_LEN + 10)
    }

    pub fn mca_flags(&self) -> McaFlags {
        let b = &self.buf[HDR_LEN + 12..HDR_LEN + 16];
        McaFlags {
            q: b[1] & 0xf,
            t: b[2] & 0xf,
            v: b[2] >> 4,
            c: b[3] & 7,
            n: b[3] >> 3,
        }
    }

    pub fn mca_total(&self) -> u64 {
        self.u64_at(HDR_LEN + 16)
    }

    pub fn mca_start_time(&self) -> u64 {
        self.u64_at(HDR_LEN + 24)
    }

    pub fn mca_stop_time(&self) -> u64 {
        self.u64_at(HDR_LEN + 32)
    }

    /// Bin `bin` of the current frame, counting from 0.
    pub fn mca_bin(&self, bin: u16) -> u32 {
        let base = if self.is_header() { HDR_LEN + MCA_HDR_LEN } else { HDR_LEN };
        self.u32_at(base + bin as usize * MCA_BIN_LEN)
    }

    /// Check the frame against the protocol. Returns the empty set if all
    /// is well, otherwise the OR of every failed check.
    pub fn validate(&self, mode: McaSizeMode) -> FrameErrors {
        let mut rc = FrameErrors::empty();
        let flen = self.flen();

        // frame length must be a multiple of 8, within the MTU, and larger
        // than the bare header
        if flen & 7 != 0 || flen as usize > MTU {
            rc |= FrameErrors::ETHLEN;
        }
        if flen as usize <= HDR_LEN {
            rc |= FrameErrors::ETHLEN;
            return rc | self.type_errors(mode, flen);
        }

        rc | self.type_errors(mode, flen)
    }

    fn type_errors(&self, mode: McaSizeMode, flen: u16) -> FrameErrors {
        let mut rc = FrameErrors::empty();
        if self.is_event() {
            let esize = self.esize();
            if esize == 0 {
                rc |= FrameErrors::EVTSIZE;
            } else if (flen as usize).saturating_sub(HDR_LEN) % (esize as usize * 8) != 0 {
                rc |= FrameErrors::ETHLEN;
            }

            if self.is_tick() {
                if esize != 3 {
                    rc |= FrameErrors::EVTSIZE;
                }
            } else if self.is_peak() || self.is_area() {
                if esize != 1 {
                    rc |= FrameErrors::EVTSIZE;
                }
            } else if self.is_trace() {
                if self.is_header() && self.buf.len() >= HDR_LEN + 2 {
                    let trsize = self.trace_size();
                    if trsize == 0 {
                        rc |= FrameErrors::TRSIZE;
                    }
                    if flen as usize > HDR_LEN + trsize as usize {
                        rc |= FrameErrors::TRSIZE;
                    }
                }
                if !self.is_trace_dp() && esize != 1 {
                    rc |= FrameErrors::EVTSIZE;
                }
            } else if !self.is_pulse() {
                rc |= FrameErrors::EVTTYPE;
            }
        } else if self.is_mca() {
            if self.is_header() && (flen as usize) < HDR_LEN + MCA_HDR_LEN {
                // too short to even hold the histogram header
                rc |= FrameErrors::MCASIZE;
            }
            if self.is_header() && self.buf.len() >= HDR_LEN + MCA_HDR_LEN {
                let nbins_tot = self.mca_nbins_tot();
                let histsize = self.mca_size(mode);
                if mode == McaSizeMode::FromSizeField
                    && histsize != nbins_tot * MCA_BIN_LEN as u32 + MCA_HDR_LEN as u32
                {
                    rc |= FrameErrors::MCASIZE;
                }
                if (flen as u32).saturating_sub(HDR_LEN as u32) > histsize {
                    rc |= FrameErrors::MCASIZE;
                }
                if self.mca_mfreq() as u32 >= nbins_tot {
                    rc |= FrameErrors::MCABINS;
                }
            }
        } else {
            rc |= FrameErrors::ETHTYPE;
        }
        rc
    }
}

impl std::fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_mca() {
            "mca"
        } else if self.is_tick() {
            "tick"
        } else if self.is_event() {
            "event"
        } else {
            "unknown"
        };
        f.debug_struct("Frame")
            .field("kind", &kind)
            .field("flen", &self.flen())
            .field("fseq", &self.fseq())
            .field("pseq", &self.pseq())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gen;

    #[test]
    fn tick_layout_round_trips() {
        let buf = gen::TickBuilder::new()
            .fseq(7)
            .period(1000)
            .ts(0x0102_0304_0506_0708)
            .lost(3)
            .build();
        assert_eq!(buf.len(), HDR_LEN + TICK_HDR_LEN);
        let pkt = Frame::new(&buf).unwrap();
        assert!(pkt.is_event());
        assert!(pkt.is_tick());
        assert!(!pkt.is_mca());
        assert_eq!(pkt.flen(), 48);
        assert_eq!(pkt.fseq(), 7);
        assert_eq!(pkt.esize(), 3);
        assert_eq!(pkt.tick_period(), 1000);
        assert_eq!(pkt.tick_ts(), 0x0102_0304_0506_0708);
        assert_eq!(pkt.tick_lost(), 3);
        assert_eq!(pkt.validate(McaSizeMode::FromLastBin), FrameErrors::empty());
    }

    #[test]
    fn peak_and_area_predicates() {
        let peak = gen::event_frame(TYPE_PEAK, 0, 1, &[0u8; 8]);
        let pkt = Frame::new(&peak).unwrap();
        assert!(pkt.is_peak());
        assert!(!pkt.is_tick());
        assert_eq!(pkt.event_nums(), 1);
        assert_eq!(pkt.validate(McaSizeMode::FromLastBin), FrameErrors::empty());

        let area = gen::event_frame(TYPE_AREA, 0, 1, &[0u8; 16]);
        let pkt = Frame::new(&area).unwrap();
        assert!(pkt.is_area());
        assert_eq!(pkt.event_nums(), 2);
    }

    #[test]
    fn trace_header_and_continuation() {
        let hdr = gen::trace_header(TRACE_SGL, 1, 1000, &[0u8; 40]);
        let pkt = Frame::new(&hdr).unwrap();
        assert!(pkt.is_trace());
        assert!(pkt.is_trace_sgl());
        assert!(pkt.is_trace_long());
        assert!(pkt.is_header());
        assert_eq!(pkt.trace_size(), 1000);
        assert_eq!(pkt.event_nums(), 1);
        assert_eq!(pkt.validate(McaSizeMode::FromLastBin), FrameErrors::empty());

        let cont = gen::trace_cont(TRACE_SGL, 2, 1, &[0u8; 40]);
        let pkt = Frame::new(&cont).unwrap();
        assert!(!pkt.is_header());
        assert_eq!(pkt.event_nums(), 0);
    }

    #[test]
    fn mca_header_fields() {
        // 16 bins total, 4 in the header frame
        let hdr = gen::mca_header(3, 16, 15, &[1, 2, 3, 4]);
        let pkt = Frame::new(&hdr).unwrap();
        assert!(pkt.is_mca());
        assert!(pkt.is_header());
        assert_eq!(pkt.mca_nbins(), 4);
        assert_eq!(pkt.mca_nbins_tot(), 16);
        assert_eq!(
            pkt.mca_size(McaSizeMode::FromLastBin),
            16 * MCA_BIN_LEN as u32 + MCA_HDR_LEN as u32
        );
        assert_eq!(pkt.mca_bin(0), 1);
        assert_eq!(pkt.mca_bin(3), 4);
        assert_eq!(pkt.validate(McaSizeMode::FromLastBin), FrameErrors::empty());
    }

    #[test]
    fn validate_flags_bad_length() {
        let mut buf = gen::TickBuilder::new().build();
        buf[14] = 49; // not a multiple of 8
        buf[15] = 0;
        let pkt = Frame::new(&buf).unwrap();
        assert!(pkt.validate(McaSizeMode::FromLastBin).contains(FrameErrors::ETHLEN));
    }

    #[test]
    fn validate_flags_bad_esize() {
        let mut buf = gen::TickBuilder::new().build();
        buf[20] = 2; // ticks must have esize 3
        let pkt = Frame::new(&buf).unwrap();
        assert!(pkt.validate(McaSizeMode::FromLastBin).contains(FrameErrors::EVTSIZE));
    }

    #[test]
    fn validate_flags_unknown_ethertype() {
        let mut buf = gen::TickBuilder::new().build();
        buf[12] = 0x08;
        buf[13] = 0x00;
        let pkt = Frame::new(&buf).unwrap();
        assert!(pkt.validate(McaSizeMode::FromLastBin).contains(FrameErrors::ETHTYPE));
    }

    #[test]
    fn validate_flags_oversized_trace_payload() {
        // header declares 8 bytes of trace, frame carries 40
        let hdr = gen::trace_header(TRACE_SGL, 1, 8, &[0u8; 40]);
        let pkt = Frame::new(&hdr).unwrap();
        assert!(pkt.validate(McaSizeMode::FromLastBin).contains(FrameErrors::TRSIZE));
    }

    #[test]
    fn validate_flags_mfreq_beyond_last_bin() {
        let hdr = gen::mca_header(3, 16, 16, &[0; 4]);
        let pkt = Frame::new(&hdr).unwrap();
        assert!(pkt.validate(McaSizeMode::FromLastBin).contains(FrameErrors::MCABINS));
    }

    #[test]
    fn error_bits_map_to_fixed_strings() {
        let err = FrameErrors::ETHLEN | FrameErrors::TRSIZE;
        let s = err.to_string();
        assert!(s.contains("Invalid frame length"));
        assert!(s.contains("Invalid trace size"));
    }
}
