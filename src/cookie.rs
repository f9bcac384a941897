//! Per-operation context records and the buffers that hand them out.
//!
//! A cookie is taken from its owner's [`CookieBuffer`] right before a work
//! request is posted. The work-request id carries the cookie's address (owner,
//! queue and slot index), so the completion can find it again. Releasing a
//! cookie moves the buffer tail straight to its index, which frees every older
//! cookie of the same queue as well. This is only correct because a reliable
//! connection completes the work requests of one queue in posting order.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::*;
use crate::type_alias::*;

/// Data transfer operation type recorded in a DTO cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtoOp {
    Send,
    Recv,
    RdmaWrite,
    RdmaRead,
    /// Atomic and other extended operations.
    Extension,
}

/// What a cookie records about its work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CookieKind {
    /// Slot not in use.
    #[default]
    Free,
    /// A data transfer operation.
    Dto {
        op: DtoOp,
        user_cookie: u64,
        /// Bytes submitted. Reported as the transferred length for sends and
        /// RDMA writes, whose completions carry no byte count.
        size: u64,
    },
    /// A memory window bind.
    RmrBind { rmr: RmrId, user_cookie: u64 },
}

/// Object that owns a cookie buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CookieOwner {
    Ep(EpId),
    Srq(SrqId),
}

/// Which work queue of the owner the cookie belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CookieQueue {
    Request,
    Receive,
}

/// Address of a cookie, packed into a 64-bit work-request id.
///
/// | bits   | field                             |
/// |--------|-----------------------------------|
/// | 0..32  | slot index                        |
/// | 32..62 | owner identifier                  |
/// | 62     | queue (0: request, 1: receive)    |
/// | 63     | owner kind (0: endpoint, 1: SRQ)  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CookieAddr {
    pub owner: CookieOwner,
    pub queue: CookieQueue,
    pub index: u32,
}

const OWNER_SHIFT: u32 = 32;
const OWNER_MASK: u64 = (1 << 30) - 1;
const QUEUE_BIT: u64 = 1 << 62;
const SRQ_BIT: u64 = 1 << 63;

impl CookieAddr {
    /// Pack into a work-request id. Owner identifiers are truncated to 30
    /// bits.
    pub fn encode(self) -> WrId {
        let (srq, owner) = match self.owner {
            CookieOwner::Ep(id) => (0, id.raw() as u64),
            CookieOwner::Srq(id) => (SRQ_BIT, id.raw() as u64),
        };
        let queue = match self.queue {
            CookieQueue::Request => 0,
            CookieQueue::Receive => QUEUE_BIT,
        };
        srq | queue | ((owner & OWNER_MASK) << OWNER_SHIFT) | self.index as u64
    }

    /// Unpack a work-request id.
    pub fn decode(wr_id: WrId) -> Self {
        let owner_id = ((wr_id >> OWNER_SHIFT) & OWNER_MASK) as u32;
        let owner = if wr_id & SRQ_BIT != 0 {
            CookieOwner::Srq(SrqId(owner_id))
        } else {
            CookieOwner::Ep(EpId(owner_id))
        };
        let queue = if wr_id & QUEUE_BIT != 0 {
            CookieQueue::Receive
        } else {
            CookieQueue::Request
        };
        Self {
            owner,
            queue,
            index: wr_id as u32,
        }
    }
}

/// A cookie handed out by a [`CookieBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie {
    pub index: u32,
    pub owner: CookieOwner,
    pub queue: CookieQueue,
    pub kind: CookieKind,
}

impl Cookie {
    /// Address of this cookie.
    #[inline]
    pub fn addr(&self) -> CookieAddr {
        CookieAddr {
            owner: self.owner,
            queue: self.queue,
            index: self.index,
        }
    }

    /// Work-request id to post with.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.addr().encode()
    }
}

/// Fixed pool of cookies for one work queue of an endpoint or SRQ.
///
/// At most `size` cookies are outstanding at a time; one more allocation fails
/// with [`Resource::Cookie`]. Allocation assumes a single poster per buffer.
pub struct CookieBuffer {
    owner: CookieOwner,
    queue: CookieQueue,
    pool: Box<[Mutex<CookieKind>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl fmt::Debug for CookieBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieBuffer")
            .field("owner", &self.owner)
            .field("queue", &self.queue)
            .field("size", &self.size())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl CookieBuffer {
    /// Create a buffer that admits `size` outstanding cookies.
    pub fn new(owner: CookieOwner, queue: CookieQueue, size: usize) -> DatResult<Self> {
        if size == 0 || size >= u32::MAX as usize {
            return Err(DatError::InvalidParameter(Param::Capacity));
        }
        let mut pool = Vec::new();
        pool.try_reserve_exact(size + 1)
            .map_err(|_| DatError::InsufficientResources(Resource::Memory))?;
        pool.extend((0..=size).map(|_| Mutex::new(CookieKind::Free)));
        Ok(Self {
            owner,
            queue,
            pool: pool.into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        })
    }

    /// Number of cookies that may be outstanding at once.
    #[inline]
    pub fn size(&self) -> usize {
        self.pool.len() - 1
    }

    #[inline]
    pub fn owner(&self) -> CookieOwner {
        self.owner
    }

    #[inline]
    pub fn queue(&self) -> CookieQueue {
        self.queue
    }

    /// Take the next cookie and record `kind` in it.
    pub fn allocate(&self, kind: CookieKind) -> DatResult<Cookie> {
        let pool_size = self.pool.len();
        let mut head = self.head.load(Ordering::Acquire);
        let new_head = loop {
            let new_head = (head + 1) % pool_size;
            if new_head == self.tail.load(Ordering::Acquire) {
                return Err(DatError::InsufficientResources(Resource::Cookie));
            }
            match self
                .head
                .compare_exchange(head, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break new_head,
                Err(cur) => head = cur,
            }
        };

        *self.pool[new_head].lock() = kind;
        Ok(Cookie {
            index: new_head as u32,
            owner: self.owner,
            queue: self.queue,
            kind,
        })
    }

    /// Release `cookie` and every cookie allocated before it.
    pub fn deallocate(&self, cookie: &Cookie) {
        debug_assert_eq!(cookie.owner, self.owner);
        let index = cookie.index as usize;
        if let Some(slot) = self.pool.get(index) {
            *slot.lock() = CookieKind::Free;
            self.tail.store(index, Ordering::Release);
        }
    }

    /// Give back the most recent allocation after its work request failed to
    /// post. Has no effect if another allocation has happened since.
    pub fn cancel(&self, cookie: &Cookie) {
        let index = cookie.index as usize;
        let prev = (index + self.pool.len() - 1) % self.pool.len();
        if self
            .head
            .compare_exchange(index, prev, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.pool[index].lock() = CookieKind::Free;
        }
    }

    /// Number of outstanding cookies.
    pub fn pending_count(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head + self.pool.len() - tail) % self.pool.len()
    }

    /// Look up the cookie stored at `index`, as addressed by a completion.
    pub fn get(&self, index: u32) -> Option<Cookie> {
        let kind = *self.pool.get(index as usize)?.lock();
        Some(Cookie {
            index,
            owner: self.owner,
            queue: self.queue,
            kind,
        })
    }
}
