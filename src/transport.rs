use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::debug;

/// Vsock operation codes, as carried in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOp {
    Invalid,
    Request,
    Response,
    Rst,
    Shutdown,
    Rw,
    CreditUpdate,
    CreditRequest,
    Unknown(u16),
}

impl PacketOp {
    pub fn from_wire(op: u16) -> Self {
        match op {
            0 => PacketOp::Invalid,
            1 => PacketOp::Request,
            2 => PacketOp::Response,
            3 => PacketOp::Rst,
            4 => PacketOp::Shutdown,
            5 => PacketOp::Rw,
            6 => PacketOp::CreditUpdate,
            7 => PacketOp::CreditRequest,
            other => PacketOp::Unknown(other),
        }
    }
}

/// The `virtio_vsock_pkt`-shaped header the transport hands us. The core
/// reads `src_cid`, `dst_port`, `op` and `len`; the rest is carried for the
/// transport's benefit.
#[derive(Debug, Clone)]
pub struct PacketHeader {
    pub src_cid: u64,
    pub dst_cid: u64,
    pub src_port: u32,
    pub dst_port: u32,
    pub op: PacketOp,
    pub flags: u32,
    pub len: u32,
}

/// A guest- or worker-originated packet: header plus payload bytes.
#[derive(Debug, Clone)]
pub struct GuestPacket {
    pub hdr: PacketHeader,
    pub payload: Bytes,
}

impl GuestPacket {
    /// A zero-length control packet (REQUEST / SHUTDOWN handshakes).
    pub fn control(src_cid: u64, dst_cid: u64, src_port: u32, dst_port: u32, op: PacketOp) -> Self {
        Self {
            hdr: PacketHeader {
                src_cid,
                dst_cid,
                src_port,
                dst_port,
                op,
                flags: 0,
                len: 0,
            },
            payload: Bytes::new(),
        }
    }

    /// A data packet carrying `payload`.
    pub fn data(src_cid: u64, dst_cid: u64, src_port: u32, dst_port: u32, payload: Bytes) -> Self {
        Self {
            hdr: PacketHeader {
                src_cid,
                dst_cid,
                src_port,
                dst_port,
                op: PacketOp::Rw,
                flags: 0,
                len: payload.len() as u32,
            },
            payload,
        }
    }
}

/// API id marking internal (mediator-directed) commands on the report channel.
pub const INTERNAL_API: i32 = 0;

/// Worker announces itself; reserved area carries its worker port.
pub const NW_NEW_WORKER: i64 = 1;
/// Worker reports device time consumed, in microseconds.
pub const CONSUME_RC_DEVICE_TIME: i64 = 2;
/// Worker reports commands consumed.
pub const CONSUME_RC_COMMAND_RATE: i64 = 3;

pub const RESERVED_AREA_LEN: usize = 44;

/// Wire size of [`CommandHeader`].
pub const COMMAND_HEADER_LEN: usize = 64;

/// The small command prefix the core inspects on every data packet. The
/// payload beyond it is opaque: the mediator never interprets command
/// semantics.
#[derive(Debug, Clone)]
pub struct CommandHeader {
    pub api_id: i32,
    pub command_id: i64,
    pub vm_id: i32,
    pub flags: u32,
    pub reserved: [u8; RESERVED_AREA_LEN],
}

impl CommandHeader {
    pub fn new(api_id: i32, command_id: i64, vm_id: i32) -> Self {
        Self {
            api_id,
            command_id,
            vm_id,
            flags: 0,
            reserved: [0; RESERVED_AREA_LEN],
        }
    }

    /// Parse the little-endian header off the front of `payload`. Returns
    /// `None` when the payload is shorter than the header.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < COMMAND_HEADER_LEN {
            return None;
        }
        let mut buf = payload;
        let api_id = buf.get_i32_le();
        let command_id = buf.get_i64_le();
        let vm_id = buf.get_i32_le();
        let flags = buf.get_u32_le();
        let mut reserved = [0u8; RESERVED_AREA_LEN];
        buf.copy_to_slice(&mut reserved);
        Some(Self {
            api_id,
            command_id,
            vm_id,
            flags,
            reserved,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COMMAND_HEADER_LEN);
        buf.put_i32_le(self.api_id);
        buf.put_i64_le(self.command_id);
        buf.put_i32_le(self.vm_id);
        buf.put_u32_le(self.flags);
        buf.put_slice(&self.reserved);
        buf.freeze()
    }

    /// First eight reserved bytes as a little-endian i64 (consumption amount).
    pub fn reserved_i64(&self) -> i64 {
        let mut buf = &self.reserved[..8];
        buf.get_i64_le()
    }

    /// First four reserved bytes as a little-endian u32 (worker port).
    pub fn reserved_u32(&self) -> u32 {
        let mut buf = &self.reserved[..4];
        buf.get_u32_le()
    }

    pub fn with_reserved_i64(mut self, value: i64) -> Self {
        self.reserved[..8].copy_from_slice(&value.to_le_bytes());
        self
    }

    pub fn with_reserved_u32(mut self, value: u32) -> Self {
        self.reserved[..4].copy_from_slice(&value.to_le_bytes());
        self
    }
}

/// Opaque handle to the virtqueue a packet arrived on; round-tripped back to
/// the transport untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VqToken(pub u64);

/// One slot of the send ring. A `None` packet with a `Some` vq is the
/// notify sentinel: the transport wants its signal callback run instead of a
/// packet delivered.
#[derive(Debug, Clone)]
pub struct PktWrapper {
    pub pkt: Option<GuestPacket>,
    pub vq: Option<VqToken>,
}

pub type NotifyFn = Box<dyn Fn(&VqToken) + Send + Sync>;

/// Single-producer single-consumer ring buffer between the admission path
/// and the transport's delivery task.
///
/// Capacity is rounded up to a power of two. Occupancy is tracked by two
/// counting semaphores: `push` takes the full-semaphore (awaiting when the
/// ring is at capacity) and releases the empty-semaphore; `poll` takes the
/// empty-semaphore non-blockingly and releases the full-semaphore. Head and
/// tail are published with release stores and read with acquire loads.
pub struct SendRing {
    slots: Box<[Mutex<Option<PktWrapper>>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    sem_full: Semaphore,
    sem_empty: Semaphore,
    on_notify: NotifyFn,
    closed: AtomicBool,
}

impl std::fmt::Debug for SendRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendRing")
            .field("capacity", &(self.mask + 1))
            .field("occupied", &self.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl SendRing {
    pub fn new(capacity: usize, on_notify: NotifyFn) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            sem_full: Semaphore::new(capacity),
            sem_empty: Semaphore::new(0),
            on_notify,
            closed: AtomicBool::new(false),
        }
    }

    /// Push one wrapper, waiting for a free slot when the ring is at
    /// capacity. Returns false when the ring has been torn down; the packet
    /// is dropped in that case.
    pub async fn push(&self, wrapper: PktWrapper) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let permit = match self.sem_full.acquire().await {
            Ok(permit) => permit,
            Err(_) => return false, // torn down while waiting
        };
        permit.forget();

        let head = self.head.load(Ordering::Relaxed);
        *self.slots[head & self.mask].lock() = Some(wrapper);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        self.sem_empty.add_permits(1);
        true
    }

    /// Take one wrapper without blocking. Notify sentinels are handled here
    /// (the callback runs, the slot is recycled, and the poll continues).
    pub fn poll(&self) -> Option<PktWrapper> {
        loop {
            let permit = self.sem_empty.try_acquire().ok()?;
            permit.forget();

            let _ = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Relaxed);
            let item = self.slots[tail & self.mask].lock().take();
            self.tail.store(tail.wrapping_add(1), Ordering::Release);
            self.sem_full.add_permits(1);

            match item {
                Some(wrapper) if wrapper.pkt.is_none() => {
                    if let Some(vq) = &wrapper.vq {
                        debug!("send ring signalling transport");
                        (self.on_notify)(vq);
                    }
                    continue;
                }
                Some(wrapper) => return Some(wrapper),
                None => continue,
            }
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.sem_empty.available_permits()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear the ring down. Pending and future pushes fail; queued packets
    /// are dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.sem_full.close();
        self.sem_empty.close();
    }
}
