//! Client-facing wire protocol: ports, status codes and message codecs.
//!
//! Every message on a client TCP stream is framed with a u32 little-endian
//! length prefix (see `task::endpoint`). Inside a frame, integers are
//! little-endian and strings are u16-length-prefixed UTF-8. Request/reply
//! sockets are strict lockstep: one reply per request, in order.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const INFO_PORT: u16 = 55554;
pub const CAPTURE_PORT: u16 = 55555;
pub const AVGTR_PORT: u16 = 55556;
pub const JITTER_REP_PORT: u16 = 55557;
pub const JITTER_PUB_PORT: u16 = 55567;
pub const HIST_PUB_PORT: u16 = 55565;
pub const COINC_REP_PORT: u16 = 55561;
pub const COINC_PUB_PORT: u16 = 55571;
pub const COINC_COUNT_REP_PORT: u16 = 55562;

/// Capture request statuses.
pub mod cap_status {
    pub const OK: u8 = 0; // accepted or all OK
    pub const EINV: u8 = 1; // malformed request
    pub const EABORT: u8 = 2; // file exists (no-overwrite) or no such job
    pub const EPERM: u8 = 3; // filename not allowed
    pub const EFAIL: u8 = 4; // error initializing
    pub const EWRT: u8 = 5; // error while writing
    pub const ECONV: u8 = 6; // error while converting
    pub const EFIN: u8 = 7; // converted, error writing stats or cleaning up
}

pub mod info_status {
    pub const OK: u8 = 0;
    pub const EINV: u8 = 1;
}

pub mod avgtr_status {
    pub const OK: u8 = 0;
    pub const EINV: u8 = 1;
    pub const ETOUT: u8 = 2;
    pub const EERR: u8 = 3; // dropped trace
}

pub mod jitter_status {
    pub const OK: u8 = 0;
    pub const EINV: u8 = 1;
}

/// Jitter histogram geometry: 2^10 + 1 bins of 4 bytes, middle bin is zero
/// delay, first and last are under-/overflow.
pub const JITTER_NBINS: usize = 1025;
pub const JITTER_SIZE: usize = 4100;

#[derive(Debug, thiserror::Error)]
#[error("malformed message")]
pub struct DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteMode {
    /// Abort if the HDF5 group or a data file exists.
    None = 0,
    /// Move an existing HDF5 group aside instead of failing.
    Relink = 1,
    /// Overwrite the entire HDF5 file.
    File = 2,
}

impl TryFrom<u8> for OverwriteMode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(OverwriteMode::None),
            1 => Ok(OverwriteMode::Relink),
            2 => Ok(OverwriteMode::File),
            _ => Err(DecodeError),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Capture and convert, unless the request is only a status query.
    Auto = 0,
    CaptureOnly = 1,
    ConvertOnly = 2,
}

impl TryFrom<u8> for CaptureMode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(CaptureMode::Auto),
            1 => Ok(CaptureMode::CaptureOnly),
            2 => Ok(CaptureMode::ConvertOnly),
            _ => Err(DecodeError),
        }
    }
}

fn get_string(buf: &mut Bytes) -> Result<String, DecodeError> {
    if buf.remaining() < 2 {
        return Err(DecodeError);
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(DecodeError);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError)
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Request on the capture port. `min_ticks == 0` makes it a status query
/// (or, with `mode == ConvertOnly`, a conversion request).
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub filename: String,
    pub measurement: String,
    pub min_ticks: u64,
    pub min_events: u64,
    pub overwrite: u8,
    pub async_conversion: bool,
    pub mode: u8,
}

impl CaptureRequest {
    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        let filename = get_string(&mut buf)?;
        let measurement = get_string(&mut buf)?;
        if buf.remaining() < 8 + 8 + 3 {
            return Err(DecodeError);
        }
        let min_ticks = buf.get_u64_le();
        let min_events = buf.get_u64_le();
        let overwrite = buf.get_u8();
        let async_conversion = buf.get_u8() != 0;
        let mode = buf.get_u8();
        Ok(CaptureRequest {
            filename,
            measurement,
            min_ticks,
            min_events,
            overwrite,
            async_conversion,
            mode,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.filename);
        put_string(&mut buf, &self.measurement);
        buf.put_u64_le(self.min_ticks);
        buf.put_u64_le(self.min_events);
        buf.put_u8(self.overwrite);
        buf.put_u8(self.async_conversion as u8);
        buf.put_u8(self.mode);
        buf.freeze()
    }
}

/// The seven counters every capture reply carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureCounts {
    pub ticks: u64,
    pub events: u64,
    pub traces: u64,
    pub hists: u64,
    pub frames: u64,
    pub frames_lost: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureReply {
    pub status: u8,
    pub counts: CaptureCounts,
}

impl CaptureReply {
    pub fn err(status: u8) -> Self {
        CaptureReply { status, counts: CaptureCounts::default() }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(57);
        buf.put_u8(self.status);
        buf.put_u64_le(self.counts.ticks);
        buf.put_u64_le(self.counts.events);
        buf.put_u64_le(self.counts.traces);
        buf.put_u64_le(self.counts.hists);
        buf.put_u64_le(self.counts.frames);
        buf.put_u64_le(self.counts.frames_lost);
        buf.put_u64_le(self.counts.frames_dropped);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        if buf.remaining() < 1 + 7 * 8 {
            return Err(DecodeError);
        }
        let status = buf.get_u8();
        Ok(CaptureReply {
            status,
            counts: CaptureCounts {
                ticks: buf.get_u64_le(),
                events: buf.get_u64_le(),
                traces: buf.get_u64_le(),
                hists: buf.get_u64_le(),
                frames: buf.get_u64_le(),
                frames_lost: buf.get_u64_le(),
                frames_dropped: buf.get_u64_le(),
            },
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimedRequest {
    pub timeout_s: u32,
}

impl TimedRequest {
    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        if buf.remaining() < 4 {
            return Err(DecodeError);
        }
        Ok(TimedRequest { timeout_s: buf.get_u32_le() })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32_le(self.timeout_s);
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InfoReply {
    pub status: u8,
    pub frames: u64,
    pub missed: u64,
    pub bad: u64,
    pub ticks: u64,
    pub mcas: u64,
    pub traces: u64,
    pub other_events: u64,
    /// One bit per event type seen; see `task::info` for the bit layout.
    pub event_types: u8,
}

impl InfoReply {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(58);
        buf.put_u8(self.status);
        buf.put_u64_le(self.frames);
        buf.put_u64_le(self.missed);
        buf.put_u64_le(self.bad);
        buf.put_u64_le(self.ticks);
        buf.put_u64_le(self.mcas);
        buf.put_u64_le(self.traces);
        buf.put_u64_le(self.other_events);
        buf.put_u8(self.event_types);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        if buf.remaining() < 1 + 7 * 8 + 1 {
            return Err(DecodeError);
        }
        Ok(InfoReply {
            status: buf.get_u8(),
            frames: buf.get_u64_le(),
            missed: buf.get_u64_le(),
            bad: buf.get_u64_le(),
            ticks: buf.get_u64_le(),
            mcas: buf.get_u64_le(),
            traces: buf.get_u64_le(),
            other_events: buf.get_u64_le(),
            event_types: buf.get_u8(),
        })
    }
}

/// Average-trace reply: a status byte followed by the trace payload (empty
/// unless the status is OK).
pub fn avgtr_reply(status: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(status);
    buf.put_slice(payload);
    buf.freeze()
}

#[derive(Debug, Clone, Copy)]
pub struct JitterRequest {
    pub ref_channel: u8,
    pub ticks: u64,
}

impl JitterRequest {
    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        if buf.remaining() < 9 {
            return Err(DecodeError);
        }
        Ok(JitterRequest { ref_channel: buf.get_u8(), ticks: buf.get_u64_le() })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(self.ref_channel);
        buf.put_u64_le(self.ticks);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_request_round_trip() {
        let req = CaptureRequest {
            filename: "runA".into(),
            measurement: "m1".into(),
            min_ticks: 2,
            min_events: 10,
            overwrite: 0,
            async_conversion: false,
            mode: 0,
        };
        let got = CaptureRequest::decode(req.encode()).unwrap();
        assert_eq!(got.filename, "runA");
        assert_eq!(got.measurement, "m1");
        assert_eq!(got.min_ticks, 2);
        assert_eq!(got.min_events, 10);
    }

    #[test]
    fn capture_reply_round_trip() {
        let rep = CaptureReply {
            status: cap_status::OK,
            counts: CaptureCounts { ticks: 2, events: 10, frames: 12, ..Default::default() },
        };
        assert_eq!(CaptureReply::decode(rep.encode()).unwrap(), rep);
    }

    #[test]
    fn truncated_request_is_malformed() {
        let req = CaptureRequest {
            filename: "runA".into(),
            measurement: String::new(),
            min_ticks: 1,
            min_events: 0,
            overwrite: 0,
            async_conversion: false,
            mode: 0,
        };
        let mut bytes = req.encode();
        let short = bytes.split_to(bytes.len() - 3);
        assert!(CaptureRequest::decode(short).is_err());
    }

    #[test]
    fn unknown_modes_are_rejected() {
        assert!(OverwriteMode::try_from(3).is_err());
        assert!(CaptureMode::try_from(9).is_err());
        assert_eq!(OverwriteMode::try_from(1).unwrap(), OverwriteMode::Relink);
    }
}
