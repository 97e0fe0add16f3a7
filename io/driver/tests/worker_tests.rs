//! End-to-end worker tests over loopback sockets.

use relay_driver::{Packet, RelayLogic, Session, Worker, WorkerConfig, WorkerCtx};
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn loopback_config() -> WorkerConfig {
    WorkerConfig {
        client_addr: "127.0.0.1:0".parse().unwrap(),
        peer_addr: "127.0.0.1:0".parse().unwrap(),
    }
}

/// Poll the worker until `done` reports true or the deadline passes.
fn poll_until<L: RelayLogic>(
    worker: &mut Worker,
    logic: &mut L,
    mut done: impl FnMut(&Worker) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !done(worker) {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        worker
            .poll_once(logic, Some(Duration::from_millis(20)))
            .unwrap();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Client(Vec<u8>),
    Peer(Vec<u8>),
    Sent(usize),
}

/// Forwards every peer datagram to a fixed destination over one session and
/// records everything it sees.
struct Forwarder {
    events: Arc<Mutex<Vec<Event>>>,
    forward_to: SocketAddr,
    session: Option<Session>,
    retain: bool,
    retained: Arc<Mutex<Vec<Packet>>>,
}

impl Forwarder {
    fn new(forward_to: SocketAddr) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            forward_to,
            session: None,
            retain: false,
            retained: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl RelayLogic for Forwarder {
    fn on_client_received(&mut self, ctx: &mut WorkerCtx<'_>, _src: SocketAddr, packet: Packet) {
        let bytes = ctx.packet_bytes(packet).to_vec();
        self.events.lock().unwrap().push(Event::Client(bytes));
    }

    fn on_peer_received(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        _src: SocketAddr,
        packet: Packet,
    ) -> bool {
        let bytes = ctx.packet_bytes(packet).to_vec();
        self.events.lock().unwrap().push(Event::Peer(bytes));

        if self.retain {
            self.retained.lock().unwrap().push(packet);
            return true;
        }

        let session = match self.session {
            Some(s) => s,
            None => {
                let s = ctx.open_session(self.forward_to).unwrap();
                self.session = Some(s);
                s
            }
        };
        ctx.start_send(session, packet);
        false
    }

    fn on_session_sent(&mut self, _ctx: &mut WorkerCtx<'_>, _session: Session, packet: Packet) {
        self.events.lock().unwrap().push(Event::Sent(packet.len()));
    }
}

#[test]
fn test_client_receive_notifies_logic() {
    let mut worker = Worker::new(0, &loopback_config()).unwrap();
    let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut logic = Forwarder::new(sink.local_addr().unwrap());
    let events = logic.events.clone();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .send_to(b"allocate", worker.local_client_addr())
        .unwrap();

    poll_until(&mut worker, &mut logic, |_| {
        !events.lock().unwrap().is_empty()
    });

    assert_eq!(
        *events.lock().unwrap(),
        vec![Event::Client(b"allocate".to_vec())]
    );
    // The receive buffer came back to the pool after dispatch.
    assert_eq!(worker.pool().outstanding_count(), 0);
}

#[test]
fn test_peer_datagram_forwarded_through_session() {
    let mut worker = Worker::new(0, &loopback_config()).unwrap();
    let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
    sink.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut logic = Forwarder::new(sink.local_addr().unwrap());
    let events = logic.events.clone();

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.send_to(b"forward me", worker.local_peer_addr()).unwrap();

    poll_until(&mut worker, &mut logic, |w| {
        w.pending_send_count() == 0 && events.lock().unwrap().len() >= 2
    });

    let mut recv = [0u8; 64];
    let (n, from) = sink.recv_from(&mut recv).unwrap();
    assert_eq!(&recv[..n], b"forward me");
    // Sessions send from the relay's client-facing port.
    assert_eq!(from.port(), worker.local_client_addr().port());

    assert_eq!(
        *events.lock().unwrap(),
        vec![Event::Peer(b"forward me".to_vec()), Event::Sent(10)]
    );
    assert_eq!(worker.pool().outstanding_count(), 0);
}

#[test]
fn test_buffer_reuse_across_receive_passes() {
    let mut worker = Worker::new(0, &loopback_config()).unwrap();
    let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut logic = Forwarder::new(sink.local_addr().unwrap());
    let events = logic.events.clone();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    for round in 1..=3u8 {
        client.send_to(&[round], worker.local_client_addr()).unwrap();
        poll_until(&mut worker, &mut logic, |_| {
            events.lock().unwrap().len() >= round as usize
        });
    }

    // One buffer services every pass when traffic is sequential.
    assert_eq!(worker.pool().total_count(), 1);
    assert_eq!(worker.pool().free_count(), 1);
}

#[test]
fn test_retained_packet_survives_the_receive_pass() {
    let mut worker = Worker::new(0, &loopback_config()).unwrap();
    let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut logic = Forwarder::new(sink.local_addr().unwrap());
    logic.retain = true;
    let events = logic.events.clone();
    let retained = logic.retained.clone();

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.send_to(b"keep this", worker.local_peer_addr()).unwrap();

    poll_until(&mut worker, &mut logic, |_| {
        !events.lock().unwrap().is_empty()
    });

    // The buffer stayed out of the pool and the packet bytes stayed intact.
    assert_eq!(worker.pool().outstanding_count(), 1);
    let packet = retained.lock().unwrap()[0];
    assert_eq!(worker.ctx().packet_bytes(packet), b"keep this");

    assert!(worker.ctx().release_packet(packet));
    assert_eq!(worker.pool().outstanding_count(), 0);
}
