//! netmap(4) ring backend.
//!
//! Registers the interface through `/dev/netmap` and maps the shared
//! region. Ring and slot structs below mirror the netmap ABI; the kernel
//! owns `tail`, userspace owns `head` and `cur`. Reclamation is a
//! volatile store of both indices; the kernel picks them up at the next
//! rxsync.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::ptr;

use tokio::io::unix::AsyncFd;
use tokio::sync::OnceCell;

use super::RingBackend;

const NETMAP_API: u32 = 11;
const NR_REG_ALL_NIC: u32 = 1;
const IFNAMSIZ: usize = 16;

#[repr(C)]
struct NmReq {
    nr_name: [u8; IFNAMSIZ],
    nr_version: u32,
    nr_offset: u32,
    nr_memsize: u32,
    nr_tx_slots: u32,
    nr_rx_slots: u32,
    nr_tx_rings: u16,
    nr_rx_rings: u16,
    nr_ringid: u16,
    nr_cmd: u16,
    nr_arg1: u16,
    nr_arg2: u16,
    nr_arg3: u32,
    nr_flags: u32,
    spare2: [u32; 1],
}

#[repr(C)]
struct NetmapIf {
    ni_name: [u8; IFNAMSIZ],
    ni_version: u32,
    ni_flags: u32,
    ni_tx_rings: u32,
    ni_rx_rings: u32,
    ni_bufs_head: u32,
    ni_spare1: [u32; 5],
    // followed by ssize_t ring_ofs[], tx rings first, then rx, each with
    // one extra entry for the host ring
}

#[repr(C, align(128))]
struct Sem([u8; 128]);

#[repr(C)]
struct NetmapRing {
    buf_ofs: i64,
    num_slots: u32,
    nr_buf_size: u32,
    ringid: u16,
    dir: u16,
    head: u32,
    cur: u32,
    tail: u32,
    flags: u32,
    ts: libc::timeval,
    sem: Sem,
    // followed by struct netmap_slot slot[]
}

#[repr(C)]
#[derive(Clone, Copy)]
struct NetmapSlot {
    buf_idx: u32,
    len: u16,
    flags: u16,
    ptr: u64,
}

nix::ioctl_readwrite!(nioc_regif, b'i', 146, NmReq);
nix::ioctl_none!(nioc_rxsync, b'i', 153);

/// Bring the interface up and put it in promiscuous mode, as the
/// readout chain addresses frames to nobody in particular.
pub fn prepare_if(name: &str) -> io::Result<()> {
    let ifname = name.strip_prefix("netmap:").unwrap_or(name);
    if ifname.len() >= IFNAMSIZ {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
    }
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(io::Error::last_os_error());
    }
    let res = (|| {
        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in req.ifr_name.iter_mut().zip(ifname.bytes()) {
            *dst = src as libc::c_char;
        }
        if unsafe { libc::ioctl(sock, libc::SIOCGIFFLAGS, &mut req) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = unsafe { req.ifr_ifru.ifru_flags }
            | libc::IFF_UP as libc::c_short
            | libc::IFF_PROMISC as libc::c_short;
        req.ifr_ifru.ifru_flags = flags;
        if unsafe { libc::ioctl(sock, libc::SIOCSIFFLAGS, &req) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    })();
    unsafe { libc::close(sock) };
    res
}

struct RingPtr {
    ring: *mut NetmapRing,
    slots: *const NetmapSlot,
}

pub struct NetmapBackend {
    file: File,
    mem: *mut libc::c_void,
    memsize: usize,
    ifname: String,
    rings: Vec<RingPtr>,
    afd: OnceCell<AsyncFd<i32>>,
}

// Safety: the mapped region is shared with the kernel by design; all
// mutable fields are accessed with volatile loads/stores and the
// coordinator is the only writer on our side.
unsafe impl Send for NetmapBackend {}
unsafe impl Sync for NetmapBackend {}

impl NetmapBackend {
    /// Register `name` (with or without the `netmap:` prefix) and map its
    /// receive rings.
    pub fn open(name: &str) -> io::Result<NetmapBackend> {
        let ifname = name.strip_prefix("netmap:").unwrap_or(name);
        if ifname.len() >= IFNAMSIZ {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
        }

        let file = OpenOptions::new().read(true).write(true).open("/dev/netmap")?;

        let mut req: NmReq = unsafe { std::mem::zeroed() };
        req.nr_name[..ifname.len()].copy_from_slice(ifname.as_bytes());
        req.nr_version = NETMAP_API;
        req.nr_flags = NR_REG_ALL_NIC;
        unsafe {
            nioc_regif(file.as_raw_fd(), &mut req).map_err(io::Error::from)?;
        }

        let memsize = req.nr_memsize as usize;
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                memsize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let nifp = unsafe { mem.add(req.nr_offset as usize) } as *const NetmapIf;
        let (ni_tx, ni_rx) = unsafe { ((*nifp).ni_tx_rings, (*nifp).ni_rx_rings) };
        let ring_ofs = unsafe { (nifp as *const u8).add(std::mem::size_of::<NetmapIf>()) }
            as *const libc::ssize_t;

        let mut rings = Vec::with_capacity(ni_rx as usize);
        for r in 0..ni_rx {
            // rx offsets follow the tx ones, host rings included
            let ofs = unsafe { *ring_ofs.add((ni_tx + 1 + r) as usize) };
            let ring = unsafe { (nifp as *const u8).offset(ofs) } as *mut NetmapRing;
            let slots = unsafe { (ring as *const u8).add(std::mem::size_of::<NetmapRing>()) }
                as *const NetmapSlot;
            rings.push(RingPtr { ring, slots });
        }

        log::info!("opened {ifname}: {ni_rx} rx ring(s), {memsize} byte shared region");
        Ok(NetmapBackend {
            file,
            mem,
            memsize,
            ifname: ifname.to_string(),
            rings,
            afd: OnceCell::new(),
        })
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    fn slot_at(&self, ring: usize, idx: u32) -> NetmapSlot {
        let r = &self.rings[ring];
        unsafe { ptr::read_volatile(r.slots.add(idx as usize)) }
    }

    fn rxsync(&self) -> io::Result<()> {
        unsafe { nioc_rxsync(self.file.as_raw_fd()).map_err(io::Error::from)? };
        Ok(())
    }

    fn has_pending(&self) -> bool {
        (0..self.rings.len()).any(|r| self.cursor(r) != self.tail(r))
    }
}

impl Drop for NetmapBackend {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mem, self.memsize);
        }
    }
}

impl RingBackend for NetmapBackend {
    fn num_rings(&self) -> usize {
        self.rings.len()
    }

    fn num_slots(&self, ring: usize) -> u32 {
        unsafe { (*self.rings[ring].ring).num_slots }
    }

    fn head(&self, ring: usize) -> u32 {
        unsafe { ptr::read_volatile(&(*self.rings[ring].ring).head) }
    }

    fn cursor(&self, ring: usize) -> u32 {
        unsafe { ptr::read_volatile(&(*self.rings[ring].ring).cur) }
    }

    fn tail(&self, ring: usize) -> u32 {
        unsafe { ptr::read_volatile(&(*self.rings[ring].ring).tail) }
    }

    fn slot(&self, ring: usize, idx: u32) -> &[u8] {
        let r = self.rings[ring].ring;
        let slot = self.slot_at(ring, idx);
        unsafe {
            let buf = (r as *const u8)
                .offset((*r).buf_ofs as isize)
                .add(slot.buf_idx as usize * (*r).nr_buf_size as usize);
            std::slice::from_raw_parts(buf, slot.len as usize)
        }
    }

    fn advance(&self, ring: usize, head: u32, cursor: u32) {
        let r = self.rings[ring].ring;
        unsafe {
            ptr::write_volatile(&mut (*r).head, head);
            ptr::write_volatile(&mut (*r).cur, cursor);
        }
    }

    async fn wait_rx(&self) -> io::Result<()> {
        let afd = self
            .afd
            .get_or_try_init(|| async { AsyncFd::new(self.file.as_raw_fd()) })
            .await?;
        loop {
            self.rxsync()?;
            if self.has_pending() {
                return Ok(());
            }
            let mut guard = afd.readable().await?;
            guard.clear_ready();
        }
    }
}
