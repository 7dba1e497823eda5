//! Integration tests for the urpc transport.
//!
//! Two peers attached to one System V segment stand in for the host and
//! accelerator processes; threads play the two sides.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use urpc::dma::DmaEngine;
use urpc::{Field, MemcpyDma, Peer, Queue, Supervisor, Unpacker};

const CMD_ECHO: u16 = 1;
const CMD_ECHO_REPLY: u16 = 2;
const CMD_SINK: u16 = 3;

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_micros(50));
    }
    cond()
}

#[test]
fn echo_roundtrip_between_two_peers() {
    let mut sup = Supervisor::new();
    let mut host = sup.peer_create().unwrap();
    let segid = host.segment().segid();

    let remote_thread = thread::spawn(move || {
        let remote = Peer::attach(segid).unwrap();
        remote
            .register_handler(
                CMD_ECHO,
                Box::new(|peer, _m, _req, payload| {
                    let mut u = Unpacker::new(payload);
                    let data = match u.bytes() {
                        Ok(d) => d,
                        Err(_) => return -1,
                    };
                    match peer.send_packed(CMD_ECHO_REPLY, &[Field::Bytes(data)]) {
                        Ok(_) => 0,
                        Err(_) => -1,
                    }
                }),
            )
            .unwrap();
        // Serve until traffic has been quiet for a while.
        remote.recv_progress_timeout(8, 300_000).unwrap()
    });

    sup.wait_peer_attach(&mut host).unwrap();

    let req = host
        .send_packed(CMD_ECHO, &[Field::Bytes(b"hi")])
        .unwrap();
    assert_eq!(req, 0);

    // The reply is the first command on the host's recv queue.
    let got = host
        .recv_req_timeout(0, 1_000_000, |m, _req, payload| {
            assert_eq!(m.cmd(), CMD_ECHO_REPLY);
            let mut u = Unpacker::new(payload);
            u.bytes().unwrap().to_vec()
        })
        .unwrap()
        .expect("no echo reply within timeout");
    assert_eq!(got, vec![0x68, 0x69]);

    let served = remote_thread.join().unwrap();
    assert!(served >= 1);
}

#[test]
fn wrap_around_preserves_payload_integrity() {
    const ROUNDS: usize = 40;
    const CHUNK: usize = 4000;

    let mut sup = Supervisor::new();
    let mut host = sup.peer_create().unwrap();
    let segid = host.segment().segid();

    let seen = Arc::new(AtomicUsize::new(0));
    let corrupt = Arc::new(AtomicUsize::new(0));
    let offsets = Arc::new(Mutex::new(Vec::new()));

    let remote_thread = {
        let seen = seen.clone();
        let corrupt = corrupt.clone();
        let offsets = offsets.clone();
        thread::spawn(move || {
            let remote = Peer::attach(segid).unwrap();
            remote
                .register_handler(
                    CMD_SINK,
                    Box::new(move |_peer, m, _req, payload| {
                        let mut u = Unpacker::new(payload);
                        let idx = u.u64().unwrap_or(u64::MAX);
                        let data = u.bytes().unwrap_or(&[]);
                        let want = (idx % 251) as u8;
                        if data.len() != CHUNK || data.iter().any(|&b| b != want) {
                            corrupt.fetch_add(1, Ordering::Relaxed);
                        }
                        offsets.lock().unwrap().push(m.offs());
                        seen.fetch_add(1, Ordering::Relaxed);
                        0
                    }),
                )
                .unwrap();
            remote.recv_progress_timeout(8, 500_000).unwrap();
        })
    };

    sup.wait_peer_attach(&mut host).unwrap();

    for idx in 0..ROUNDS {
        let fill = (idx % 251) as u8;
        let data = vec![fill; CHUNK];
        host.send_packed(CMD_SINK, &[Field::U64(idx as u64), Field::Bytes(&data)])
            .unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(5), || seen.load(Ordering::Relaxed) == ROUNDS),
        "remote saw {} of {} commands",
        seen.load(Ordering::Relaxed),
        ROUNDS
    );
    remote_thread.join().unwrap();

    assert_eq!(corrupt.load(Ordering::Relaxed), 0);

    // More than a full buffer of payload went through, so arena offsets must
    // have wrapped and been reused.
    let offsets = offsets.lock().unwrap();
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert!(
        sorted.len() < offsets.len(),
        "no payload offset was ever reused across {} sends",
        offsets.len()
    );
    assert!(offsets.iter().filter(|&&o| o == 0).count() >= 2);
}

#[test]
fn progress_timeout_reports_total_processed() {
    let mut sup = Supervisor::new();
    let mut host = sup.peer_create().unwrap();
    let segid = host.segment().segid();

    let remote_thread = thread::spawn(move || {
        let remote = Peer::attach(segid).unwrap();
        remote
            .register_handler(CMD_SINK, Box::new(|_, _, _, _| 0))
            .unwrap();
        remote.recv_progress_timeout(4, 200_000).unwrap()
    });

    sup.wait_peer_attach(&mut host).unwrap();
    for i in 0..10u32 {
        host.send_packed(CMD_SINK, &[Field::U32(i), Field::Pad])
            .unwrap();
    }

    let total = remote_thread.join().unwrap();
    assert_eq!(total, 10);
}

#[test]
fn commands_without_handler_are_skipped() {
    let mut sup = Supervisor::new();
    let mut host = sup.peer_create().unwrap();
    let segid = host.segment().segid();

    let remote_thread = thread::spawn(move || {
        let remote = Peer::attach(segid).unwrap();
        remote.recv_progress_timeout(4, 200_000).unwrap()
    });

    sup.wait_peer_attach(&mut host).unwrap();
    host.send_packed(9, &[Field::U32(1)]).unwrap();

    // The command is consumed (and its slot retired) even without a handler.
    let total = remote_thread.join().unwrap();
    assert_eq!(total, 1);
    assert!(wait_until(Duration::from_secs(1), || {
        host.send_queue_consumed() == 0
    }));
}

struct CountingDma {
    transfers: AtomicUsize,
}

unsafe impl DmaEngine for CountingDma {
    fn transfer(&self, dst: u64, src: u64, len: usize) -> i32 {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        MemcpyDma.transfer(dst, src, len)
    }
}

#[test]
fn accelerator_side_inline_threshold() {
    let mut sup = Supervisor::new();
    let mut host = sup.peer_create().unwrap();
    let segid = host.segment().segid();

    let engine = Arc::new(CountingDma {
        transfers: AtomicUsize::new(0),
    });

    let payloads = Arc::new(Mutex::new(Vec::new()));
    let remote_thread = {
        let engine = engine.clone();
        let payloads = payloads.clone();
        thread::spawn(move || {
            let remote = Peer::attach_accelerator(segid, engine).unwrap();
            remote
                .register_handler(
                    CMD_SINK,
                    Box::new(move |_peer, _m, _req, payload| {
                        payloads.lock().unwrap().push(payload.to_vec());
                        0
                    }),
                )
                .unwrap();
            remote.recv_progress_timeout(4, 300_000).unwrap()
        })
    };

    sup.wait_peer_attach(&mut host).unwrap();

    // 16 bytes: inline path. 24 bytes: exactly one DMA transfer.
    host.send_packed(CMD_SINK, &[Field::U64(0x1111), Field::U64(0x2222)])
        .unwrap();
    host.send_packed(
        CMD_SINK,
        &[Field::U64(0x3333), Field::U64(0x4444), Field::U64(0x5555)],
    )
    .unwrap();

    let total = remote_thread.join().unwrap();
    assert_eq!(total, 2);
    assert_eq!(engine.transfers.load(Ordering::Relaxed), 1);

    let payloads = payloads.lock().unwrap();
    assert_eq!(payloads.len(), 2);
    let mut u = Unpacker::new(&payloads[0]);
    assert_eq!(u.u64().unwrap(), 0x1111);
    assert_eq!(u.u64().unwrap(), 0x2222);
    let mut u = Unpacker::new(&payloads[1]);
    assert_eq!(u.u64().unwrap(), 0x3333);
    assert_eq!(u.u64().unwrap(), 0x4444);
    assert_eq!(u.u64().unwrap(), 0x5555);
}

#[test]
fn flag_words_are_shared_between_peers() {
    let mut sup = Supervisor::new();
    let mut host = sup.peer_create().unwrap();
    let segid = host.segment().segid();

    let remote = Peer::attach(segid).unwrap();
    sup.wait_peer_attach(&mut host).unwrap();

    // The remote's recv queue is the host's send queue.
    remote.set_flags(Queue::Recv, true, 0xbeef);
    assert_eq!(host.flags(Queue::Send, true), 0xbeef);

    host.set_flags(Queue::Recv, false, 0x1234);
    assert_eq!(remote.flags(Queue::Send, false), 0x1234);
}
