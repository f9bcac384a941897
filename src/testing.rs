//! In-process loopback transport and fixtures for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub use crate::cr::CmEventSink;
use crate::cno::Cno;
use crate::cq::*;
use crate::ep::{Ep, EpBuilder, EpState};
use crate::evd::{Evd, EvdFlags};
use crate::ia::Ia;
use crate::pd::Pd;
pub use crate::transport::*;
use crate::type_alias::*;
use crate::Config;

#[derive(Default)]
struct MockCqState {
    entries: VecDeque<Wc>,
    depth: usize,
    armed: bool,
    signaled: bool,
}

/// Completion queue whose entries are pushed by the test.
pub struct MockCq {
    evd: EvdId,
    state: Mutex<MockCqState>,
    cond: Condvar,
}

impl MockCq {
    fn new(evd: EvdId, depth: usize) -> Self {
        let cq = Self {
            evd,
            state: Mutex::default(),
            cond: Condvar::new(),
        };
        cq.state.lock().depth = depth;
        cq
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    pub fn push(&self, wc: Wc) {
        let mut state = self.state.lock();
        state.entries.push_back(wc);
        if std::mem::take(&mut state.armed) {
            state.signaled = true;
            self.cond.notify_all();
        }
    }
}

impl CompletionQueue for MockCq {
    fn poll_one(&self) -> io::Result<Option<Wc>> {
        Ok(self.state.lock().entries.pop_front())
    }

    fn arm(&self, _mode: NotifyMode) -> io::Result<()> {
        self.state.lock().armed = true;
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<CqWait> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if std::mem::take(&mut state.signaled) {
                return Ok(CqWait::Notified);
            }
            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        let signaled = std::mem::take(&mut state.signaled);
                        return Ok(if signaled {
                            CqWait::Notified
                        } else {
                            CqWait::TimedOut
                        });
                    }
                }
            }
        }
    }

    fn wake(&self) {
        self.state.lock().signaled = true;
        self.cond.notify_all();
    }

    fn depth(&self) -> usize {
        self.state.lock().depth
    }

    fn resize(&self, depth: usize) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.depth = state.depth.max(depth);
        Ok(state.depth)
    }
}

/// A send-queue work request as the transport saw it.
#[derive(Debug, Clone)]
pub struct SentWr {
    pub wr_id: WrId,
    pub op: SendOp,
    pub len: u64,
    pub signaled: bool,
    pub solicited: bool,
}

/// An active connect as the transport saw it.
#[derive(Debug, Clone)]
pub struct ConnectRecord {
    pub ep: EpId,
    pub remote: SocketAddr,
    pub conn_qual: ConnQual,
    pub private_data: Vec<u8>,
    pub cm: CmHandle,
}

struct MockQp {
    handle: QpHandle,
    send_cq: Option<Arc<MockCq>>,
    recv_cq: Option<Arc<MockCq>>,
    srq: Option<SrqHandle>,
    sends: Vec<SentWr>,
    send_cursor: usize,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    cqs: Vec<Arc<MockCq>>,
    qps: HashMap<u64, MockQp>,
    srqs: HashMap<u64, VecDeque<RecvRecord>>,
    listening: HashSet<SpId>,
    connects: Vec<ConnectRecord>,
    accepts: Vec<(CmHandle, Vec<u8>)>,
    rejects: Vec<(CmHandle, RejectReason)>,
    disconnects: Vec<(CmHandle, DisconnectMode)>,
    last_cm: Option<CmHandle>,
    fail_next_post: bool,
    fail_next_disconnect: bool,
    fail_next_connect: bool,
    fail_next_accept: Option<bool>,
}

#[derive(Debug, Clone, Copy)]
struct RecvRecord {
    wr_id: WrId,
}

/// Loopback transport. Nothing leaves the process: completions and CM events
/// are produced by the test through the helper methods.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_cq(state: &MockState, cq: Option<&Arc<dyn CompletionQueue>>) -> Option<Arc<MockCq>> {
        let cq = Arc::as_ptr(cq?) as *const u8;
        state
            .cqs
            .iter()
            .find(|m| Arc::as_ptr(m) as *const u8 == cq)
            .cloned()
    }

    /// Allocate a fresh CM handle.
    pub fn new_cm(&self) -> CmHandle {
        let mut state = self.state.lock();
        state.next_id += 1;
        let cm = CmHandle(0x1000 + state.next_id);
        state.last_cm = Some(cm);
        cm
    }

    pub fn last_cm(&self) -> CmHandle {
        self.state.lock().last_cm.expect("no connection yet")
    }

    pub fn sends(&self, qp: QpHandle) -> Vec<SentWr> {
        self.state.lock().qps[&qp.id].sends.clone()
    }

    /// Complete `wr_id` on the send CQ of `qp`.
    pub fn complete_send(&self, qp: QpHandle, wr_id: WrId, status: WcStatus, byte_len: u32) {
        let cq = self.state.lock().qps[&qp.id].send_cq.clone();
        cq.expect("QP has no send CQ").push(Wc {
            wr_id,
            status: status as u32,
            opcode: WcOpcode::Send as u32,
            byte_len,
            imm: None,
            qp_num: qp.qpn,
        });
    }

    /// Complete the oldest uncompleted send of `qp`.
    pub fn complete_next_send(&self, qp: QpHandle, status: WcStatus) {
        let wr = {
            let mut state = self.state.lock();
            let mqp = state.qps.get_mut(&qp.id).expect("unknown QP");
            let wr = mqp.sends[mqp.send_cursor].clone();
            mqp.send_cursor += 1;
            wr
        };
        self.complete_send(qp, wr.wr_id, status, wr.len as u32);
    }

    /// Complete the oldest receive of the SRQ behind `qp` on the receive CQ
    /// of `qp`.
    pub fn complete_srq_recv(&self, qp: QpHandle, status: WcStatus, byte_len: u32) {
        let (wr, cq) = {
            let mut state = self.state.lock();
            let mqp = &state.qps[&qp.id];
            let srq = mqp.srq.expect("QP has no SRQ");
            let cq = mqp.recv_cq.clone().expect("QP has no receive CQ");
            let wr = state
                .srqs
                .get_mut(&srq.id)
                .and_then(VecDeque::pop_front)
                .expect("SRQ is empty");
            (wr, cq)
        };
        cq.push(Wc {
            wr_id: wr.wr_id,
            status: status as u32,
            opcode: WcOpcode::Recv as u32,
            byte_len,
            imm: None,
            qp_num: qp.qpn,
        });
    }

    pub fn fail_next_post(&self) {
        self.state.lock().fail_next_post = true;
    }

    /// Make the next disconnect fail after it has been recorded.
    pub fn fail_next_disconnect(&self) {
        self.state.lock().fail_next_disconnect = true;
    }

    pub fn fail_next_connect(&self) {
        self.state.lock().fail_next_connect = true;
    }

    /// Make the next accept fail, as if the requester went away when
    /// `peer_gone` is set.
    pub fn fail_next_accept(&self, peer_gone: bool) {
        self.state.lock().fail_next_accept = Some(peer_gone);
    }

    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.state.lock().connects.clone()
    }

    pub fn accepts(&self) -> Vec<(CmHandle, Vec<u8>)> {
        self.state.lock().accepts.clone()
    }

    pub fn rejects(&self) -> Vec<(CmHandle, RejectReason)> {
        self.state.lock().rejects.clone()
    }

    pub fn disconnects(&self) -> Vec<(CmHandle, DisconnectMode)> {
        self.state.lock().disconnects.clone()
    }

    /// Whether the CQ created for `evd` waits for a notification.
    pub fn cq_armed(&self, evd: EvdId) -> bool {
        self.state
            .lock()
            .cqs
            .iter()
            .any(|cq| cq.evd == evd && cq.is_armed())
    }

    pub fn is_listening(&self, sp: SpId) -> bool {
        self.state.lock().listening.contains(&sp)
    }

    fn take_post_failure(&self) -> Result<(), TransportError> {
        match std::mem::take(&mut self.state.lock().fail_next_post) {
            true => Err(TransportError::NoResources),
            false => Ok(()),
        }
    }
}

impl Transport for MockTransport {
    fn create_cq(&self, evd: EvdId, depth: usize) -> io::Result<Arc<dyn CompletionQueue>> {
        let cq = Arc::new(MockCq::new(evd, depth));
        self.state.lock().cqs.push(cq.clone());
        Ok(cq)
    }

    fn create_qp(&self, init: QpInit<'_>) -> Result<QpHandle, TransportError> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let handle = QpHandle {
            qpn: 100 + state.next_id as Qpn,
            id: state.next_id,
        };
        let qp = MockQp {
            handle,
            send_cq: Self::find_cq(&state, init.send_cq),
            recv_cq: Self::find_cq(&state, init.recv_cq),
            srq: init.srq,
            sends: Vec::new(),
            send_cursor: 0,
        };
        state.qps.insert(handle.id, qp);
        Ok(handle)
    }

    fn destroy_qp(&self, qp: QpHandle) -> Result<(), TransportError> {
        match self.state.lock().qps.remove(&qp.id) {
            Some(mqp) if mqp.handle == qp => Ok(()),
            _ => Err(TransportError::Io(io::Error::from_raw_os_error(libc::EINVAL))),
        }
    }

    fn create_srq(&self, _max_wr: usize) -> Result<SrqHandle, TransportError> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.srqs.insert(id, VecDeque::new());
        Ok(SrqHandle { id })
    }

    fn destroy_srq(&self, srq: SrqHandle) -> Result<(), TransportError> {
        self.state.lock().srqs.remove(&srq.id);
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr<'_>) -> Result<(), TransportError> {
        self.take_post_failure()?;
        let mut state = self.state.lock();
        let mqp = state.qps.get_mut(&qp.id).ok_or(TransportError::PeerGone)?;
        mqp.sends.push(SentWr {
            wr_id: wr.wr_id,
            op: wr.op,
            len: wr.local.iter().map(|seg| seg.segment_length).sum(),
            signaled: wr.signaled,
            solicited: wr.solicited,
        });
        Ok(())
    }

    fn post_recv(&self, qp: QpHandle, _wr: &RecvWr<'_>) -> Result<(), TransportError> {
        self.take_post_failure()?;
        match self.state.lock().qps.contains_key(&qp.id) {
            true => Ok(()),
            false => Err(TransportError::PeerGone),
        }
    }

    fn post_srq_recv(&self, srq: SrqHandle, wr: &RecvWr<'_>) -> Result<(), TransportError> {
        self.take_post_failure()?;
        let mut state = self.state.lock();
        let queue = state.srqs.get_mut(&srq.id).ok_or(TransportError::NoResources)?;
        queue.push_back(RecvRecord { wr_id: wr.wr_id });
        Ok(())
    }

    fn listen(&self, sp: SpId, _conn_qual: ConnQual) -> Result<(), TransportError> {
        self.state.lock().listening.insert(sp);
        Ok(())
    }

    fn stop_listen(&self, sp: SpId, _conn_qual: ConnQual) -> Result<(), TransportError> {
        self.state.lock().listening.remove(&sp);
        Ok(())
    }

    fn connect(
        &self,
        ep: EpId,
        _qp: QpHandle,
        remote: SocketAddr,
        conn_qual: ConnQual,
        private_data: &[u8],
    ) -> Result<CmHandle, TransportError> {
        if std::mem::take(&mut self.state.lock().fail_next_connect) {
            return Err(TransportError::Rejected);
        }
        let cm = self.new_cm();
        self.state.lock().connects.push(ConnectRecord {
            ep,
            remote,
            conn_qual,
            private_data: private_data.to_vec(),
            cm,
        });
        Ok(cm)
    }

    fn accept(
        &self,
        cm: CmHandle,
        _qp: QpHandle,
        private_data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        match state.fail_next_accept.take() {
            Some(true) => Err(TransportError::PeerGone),
            Some(false) => Err(TransportError::NoResources),
            None => {
                state.accepts.push((cm, private_data.to_vec()));
                Ok(())
            }
        }
    }

    fn reject(
        &self,
        cm: CmHandle,
        reason: RejectReason,
        _private_data: &[u8],
    ) -> Result<(), TransportError> {
        self.state.lock().rejects.push((cm, reason));
        Ok(())
    }

    fn disconnect(&self, cm: CmHandle, mode: DisconnectMode) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.disconnects.push((cm, mode));
        match std::mem::take(&mut state.fail_next_disconnect) {
            true => Err(TransportError::NoResources),
            false => Ok(()),
        }
    }
}

pub fn open_ia() -> (Ia, Arc<MockTransport>) {
    open_ia_with(Config::default())
}

pub fn open_ia_with(config: Config) -> (Ia, Arc<MockTransport>) {
    let t = Arc::new(MockTransport::new());
    let ia = Ia::open(t.clone(), config).expect("cannot open IA");
    (ia, t)
}

/// An endpoint with a PD, a DTO EVD for both queues and a connection EVD.
pub struct Fixture {
    pub pd: Pd,
    pub dto: Evd,
    pub conn: Evd,
    pub ep: Ep,
}

impl Fixture {
    pub fn new(ia: &Ia) -> Self {
        let pd = ia.pd_create();
        let dto = ia.evd_create(16, None, EvdFlags::DTO).unwrap();
        let conn = ia.evd_create(16, None, EvdFlags::CONNECTION).unwrap();
        let ep = ia
            .ep_create(
                EpBuilder::new()
                    .pd(&pd)
                    .connect_evd(&conn)
                    .request_evd(&dto)
                    .recv_evd(&dto),
            )
            .unwrap();
        Self { pd, dto, conn, ep }
    }

    /// Like [`Fixture::new`], with the DTO EVD attached to `cno`.
    pub fn with_cno(ia: &Ia, cno: &Cno) -> Self {
        let pd = ia.pd_create();
        let dto = ia.evd_create(16, Some(cno), EvdFlags::DTO).unwrap();
        let conn = ia.evd_create(16, None, EvdFlags::CONNECTION).unwrap();
        let ep = ia
            .ep_create(
                EpBuilder::new()
                    .pd(&pd)
                    .connect_evd(&conn)
                    .request_evd(&dto)
                    .recv_evd(&dto),
            )
            .unwrap();
        Self { pd, dto, conn, ep }
    }

    pub fn force_connected(&self, t: &MockTransport) {
        force_connected(&self.ep, t);
    }
}

/// Put `ep` straight into the connected state with a fresh CM handle.
pub fn force_connected(ep: &Ep, t: &MockTransport) {
    let cm = t.new_cm();
    let mut shared = ep.lock();
    shared.state = EpState::Connected;
    shared.cm = Some(cm);
}

pub fn seg(len: u64) -> LmrTriplet {
    LmrTriplet {
        lmr_context: 1,
        virtual_address: 0x10000,
        segment_length: len,
    }
}

pub fn remote() -> RmrTriplet {
    RmrTriplet {
        rmr_context: 2,
        target_address: 0x20000,
        segment_length: 4096,
    }
}

pub fn peer_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 2], 4791))
}
