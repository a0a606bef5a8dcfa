//! Single Ether Dream TCP session
//!
//! One connection owns one TCP stream and one reader thread. The sender
//! loop models the DAC's buffer fullness from the last status report, the
//! elapsed wall clock and the in-flight point counts, and paces DATA
//! commands to hold the buffer near [`TARGET_FULLNESS`].
//!
//! Reader, sender and supervisor share one mutex/condvar pair; the pair is
//! reference-counted so it survives connection swaps on reconnect. Network
//! writes are performed with the lock released - the sender is the only
//! writer, so this is safe.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::{COMM_TIMEOUT, CONNECT_TIMEOUT};
use crate::discovery::DiscoveredDac;
use crate::error::ProtocolError;
use crate::protocol::point::PointBlock;
use crate::protocol::wire::{
    commands, mark_rate_change, DacResponse, DacState, DacStatus, RESPONSE_LEN, VERSION_LEN,
};

/// Never send fewer points than this in one DATA command.
const MIN_POINTS_PER_SEND: usize = 40;

/// Never send more; 80 points plus framing fit an Ethernet MTU.
const MAX_POINTS_PER_SEND: usize = 80;

/// Modeled fullness the sender steers towards (~75 ms at 48 kpps).
const TARGET_FULLNESS: u32 = 3600;

/// Fullness at which BEGIN is issued.
const START_THRESHOLD: u16 = 3000;

/// `add_frame` drops new blocks once this many are already queued.
const MAX_PENDING_FRAMES: usize = 2;

/// Session state shared by the reader thread, the sender loop and the
/// supervisor. Everything mutable lives under one lock.
pub(crate) struct Shared {
    session: Mutex<Session>,
    cond: Condvar,
    shutdown: AtomicBool,
}

struct Session {
    status: DacStatus,
    status_received_at: Instant,
    /// Point counts of DATA commands awaiting their ACK, in send order
    unacked_blocks: VecDeque<u16>,
    /// Pending point blocks; index 0 is partially consumed up to `cursor`
    frames: VecDeque<PointBlock>,
    cursor: usize,
    /// Outstanding ACKs for non-DATA commands
    pending_meta_acks: u32,
    begin_sent: bool,
    /// Deliberate teardown of the current connection
    closing: bool,
    /// The current connection failed
    dead: bool,
    failure: Option<ProtocolError>,
}

impl Session {
    fn new() -> Self {
        Self {
            status: DacStatus::default(),
            status_received_at: Instant::now(),
            unacked_blocks: VecDeque::new(),
            frames: VecDeque::new(),
            cursor: 0,
            pending_meta_acks: 0,
            begin_sent: false,
            closing: false,
            dead: false,
            failure: None,
        }
    }

    /// Fresh per-connection bookkeeping. Whole queued frames survive a
    /// reconnect; a partially-sent head frame is not replayed.
    fn reset_for_connection(&mut self, status: DacStatus) {
        self.status = status;
        self.status_received_at = Instant::now();
        self.unacked_blocks.clear();
        self.pending_meta_acks = 0;
        self.begin_sent = false;
        self.closing = false;
        self.dead = false;
        self.failure = None;
        if self.cursor > 0 {
            self.frames.pop_front();
            self.cursor = 0;
        }
    }

    fn fail(&mut self, error: ProtocolError) {
        self.dead = true;
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    fn take_failure(&mut self) -> ProtocolError {
        self.failure.take().unwrap_or(ProtocolError::ConnectionClosed)
    }
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            session: Mutex::new(Session::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Enqueue a point block for sending. Blocks beyond the queue bound are
    /// dropped rather than blocking the producer.
    pub(crate) fn add_frame(&self, block: PointBlock) -> Result<(), ProtocolError> {
        if self.is_shutdown() {
            return Err(ProtocolError::ShutDown);
        }
        let mut session = self.session.lock().unwrap();
        if session.frames.len() > MAX_PENDING_FRAMES {
            tracing::warn!("Point frame queue full, dropping {} points", block.len());
            return Ok(());
        }
        session.frames.push_back(block);
        self.cond.notify_all();
        Ok(())
    }

    /// True while at most one frame is queued; producers use this to
    /// throttle.
    pub(crate) fn is_ready(&self) -> bool {
        self.session.lock().unwrap().frames.len() <= 1
    }

    /// Block until the frame queue has drained to at most one entry.
    pub(crate) fn wait_for_ready(&self) -> Result<(), ProtocolError> {
        let mut session = self.session.lock().unwrap();
        loop {
            if self.is_shutdown() {
                return Err(ProtocolError::ShutDown);
            }
            if session.frames.len() <= 1 {
                return Ok(());
            }
            let (guard, _) = self.cond.wait_timeout(session, COMM_TIMEOUT).unwrap();
            session = guard;
        }
    }

    /// Terminal shutdown of the whole session.
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut session = self.session.lock().unwrap();
        session.closing = true;
        drop(session);
        self.cond.notify_all();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// One live TCP session with a DAC.
pub(crate) struct DacConnection {
    stream: TcpStream,
    shared: Arc<Shared>,
    reader_handle: Option<JoinHandle<()>>,
    firmware_version: String,
    peer: SocketAddr,
}

impl DacConnection {
    /// Connect, read the unsolicited initial status, probe the firmware
    /// version on software revision 2 or later, and start the reader
    /// thread.
    pub(crate) fn connect(
        dac: &DiscoveredDac,
        port: u16,
        shared: Arc<Shared>,
    ) -> Result<Self, ProtocolError> {
        let peer = SocketAddr::new(dac.ip_addr, port);
        let stream = TcpStream::connect_timeout(&peer, CONNECT_TIMEOUT)
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
        stream.set_read_timeout(Some(COMM_TIMEOUT))?;
        stream.set_write_timeout(Some(COMM_TIMEOUT))?;

        // the DAC reports its status unsolicited right after accepting
        let mut buf = [0u8; RESPONSE_LEN];
        (&stream).read_exact(&mut buf)?;
        let initial = DacResponse::decode(&buf)?;

        stream.set_nodelay(true)?;

        let firmware_version = if dac.software_rev >= 2 {
            (&stream).write_all(&commands::version())?;
            let mut version = [0u8; VERSION_LEN];
            (&stream).read_exact(&mut version)?;
            String::from_utf8_lossy(&version)
                .trim_end_matches(|c| c == '\0' || c == ' ')
                .to_string()
        } else {
            "[old]".to_string()
        };

        {
            let mut session = shared.session.lock().unwrap();
            session.reset_for_connection(initial.status);
        }

        let reader_stream = stream.try_clone()?;
        let reader_shared = Arc::clone(&shared);
        let reader_handle = thread::Builder::new()
            .name(format!("dac-reader-{}", dac.id))
            .spawn(move || run_reader(reader_stream, reader_shared))
            .map_err(ProtocolError::Io)?;

        tracing::info!(
            "Connected to DAC {} at {} (firmware: {})",
            dac.id,
            peer,
            firmware_version
        );

        Ok(Self {
            stream,
            shared,
            reader_handle: Some(reader_handle),
            firmware_version,
            peer,
        })
    }

    #[allow(dead_code)]
    pub(crate) fn firmware_version(&self) -> &str {
        &self.firmware_version
    }

    /// Run the sender until the connection becomes unusable or shutdown is
    /// requested. The connection is torn down before returning; the caller
    /// discards it.
    pub(crate) fn run_sender(&mut self) -> Result<(), ProtocolError> {
        let result = self.sender_loop();
        self.teardown();
        result
    }

    fn sender_loop(&mut self) -> Result<(), ProtocolError> {
        let mut last_rate: Option<u32> = None;

        loop {
            let mut session = self.shared.session.lock().unwrap();

            // wait for work
            loop {
                if self.shared.is_shutdown() || session.closing {
                    return Ok(());
                }
                if session.dead {
                    return Err(session.take_failure());
                }
                if !session.frames.is_empty() {
                    break;
                }
                let (guard, _) = self.shared.cond.wait_timeout(session, COMM_TIMEOUT).unwrap();
                session = guard;
            }

            let frame_rate = session.frames[0].rate();

            // start playback once the DAC holds enough points
            if session.status.buffer_fullness >= START_THRESHOLD && !session.begin_sent {
                session.pending_meta_acks += 1;
                session.begin_sent = true;
                last_rate = Some(frame_rate);
                drop(session);
                tracing::debug!("Sending BEGIN at {} pps", frame_rate);
                self.write_all(&commands::begin(frame_rate))?;
                continue;
            }

            // model the DAC buffer: last report plus in-flight points minus
            // what playback consumed since the report
            let expected_used = if session.status.playback_state == DacState::Playing {
                session.status_received_at.elapsed().as_secs_f64() * frame_rate as f64
            } else {
                0.0
            };
            let in_flight: u32 = session.unacked_blocks.iter().map(|&n| u32::from(n)).sum();
            let expected_fullness =
                f64::from(session.status.buffer_fullness) + f64::from(in_flight) - expected_used;
            let capacity = f64::from(TARGET_FULLNESS) - expected_fullness;

            if capacity < MIN_POINTS_PER_SEND as f64 {
                // wait for the DAC to drain; a status update can wake us early
                let wait_ns = (MAX_POINTS_PER_SEND as f64 - capacity) * 1e9 / frame_rate as f64;
                let wait = Duration::from_nanos(wait_ns.max(0.0) as u64);
                let _ = self.shared.cond.wait_timeout(session, wait).unwrap();
                continue;
            }

            // an idle DAC must be prepared, and the ACK awaited, before DATA
            if session.status.playback_state == DacState::Idle {
                session.pending_meta_acks += 1;
                drop(session);
                self.write_all(&commands::prepare())?;
                session = self.shared.session.lock().unwrap();

                let deadline = Instant::now() + COMM_TIMEOUT;
                while session.pending_meta_acks != 0 {
                    if self.shared.is_shutdown() || session.closing {
                        return Ok(());
                    }
                    if session.dead {
                        return Err(session.take_failure());
                    }
                    let remaining = deadline
                        .checked_duration_since(Instant::now())
                        .ok_or(ProtocolError::AckTimeout)?;
                    let (guard, _) = self.shared.cond.wait_timeout(session, remaining).unwrap();
                    session = guard;
                }
            }

            let frame_len = session.frames[0].len();
            if frame_len == 0 {
                session.frames.pop_front();
                session.cursor = 0;
                self.shared.cond.notify_all();
                continue;
            }

            let points_left = frame_len - session.cursor;
            let send_points = (capacity as usize).min(points_left).min(MAX_POINTS_PER_SEND);

            let queue_change = if last_rate != Some(frame_rate) {
                session.pending_meta_acks += 1;
                last_rate = Some(frame_rate);
                true
            } else {
                false
            };

            session.unacked_blocks.push_back(send_points as u16);

            let mut payload = session.frames[0].point_range(session.cursor, send_points).to_vec();
            session.cursor += send_points;
            if session.cursor == frame_len {
                session.frames.pop_front();
                session.cursor = 0;
                self.shared.cond.notify_all();
            }
            drop(session);

            // writes happen without the lock held
            if queue_change {
                tracing::debug!("Queueing rate change to {} pps", frame_rate);
                self.write_all(&commands::queue_rate(frame_rate))?;
                mark_rate_change(&mut payload);
            }
            self.write_all(&commands::data_header(send_points as u16))?;
            self.write_all(&payload)?;
        }
    }

    fn write_all(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        (&self.stream).write_all(bytes).map_err(ProtocolError::Io)
    }

    fn teardown(&mut self) {
        {
            let mut session = self.shared.session.lock().unwrap();
            session.closing = true;
        }
        self.shared.cond.notify_all();
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
        tracing::info!("Connection to {} closed", self.peer);
    }
}

/// Reader thread: one 22-byte response per outstanding command, in command
/// order. Updates the shared status and the ACK bookkeeping.
fn run_reader(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut buf = [0u8; RESPONSE_LEN];

    loop {
        match stream.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                let mut session = shared.session.lock().unwrap();
                if session.closing {
                    return;
                }
                if session.frames.is_empty() {
                    // idle wait against a quiet DAC is expected
                    continue;
                }
                tracing::error!("DAC response timed out with point data queued");
                session.fail(ProtocolError::ReadTimeout);
                drop(session);
                shared.cond.notify_all();
                return;
            }
            Err(e) => {
                let mut session = shared.session.lock().unwrap();
                if !session.closing {
                    tracing::warn!("DAC connection read failed: {}", e);
                    session.fail(ProtocolError::ConnectionClosed);
                }
                drop(session);
                shared.cond.notify_all();
                return;
            }
        }

        let response = match DacResponse::decode(&buf) {
            Ok(response) => response,
            Err(e) => {
                let mut session = shared.session.lock().unwrap();
                session.fail(e);
                drop(session);
                shared.cond.notify_all();
                return;
            }
        };

        let mut session = shared.session.lock().unwrap();
        session.status = response.status;
        session.status_received_at = Instant::now();
        if session.status.playback_state == DacState::Idle {
            session.begin_sent = false;
        }

        let balanced = if response.command == commands::DATA {
            session.unacked_blocks.pop_front().is_some()
        } else if session.pending_meta_acks > 0 {
            session.pending_meta_acks -= 1;
            true
        } else {
            false
        };
        if !balanced {
            tracing::error!(
                "ACK for '{}' without an outstanding command",
                response.command as char
            );
            session.fail(ProtocolError::AckUnderflow(response.command as char));
            drop(session);
            shared.cond.notify_all();
            return;
        }

        if !response.is_acceptable() {
            tracing::error!("DAC returned response byte 0x{:02x}", response.response);
            session.fail(ProtocolError::UnexpectedResponse(response.response));
            drop(session);
            shared.cond.notify_all();
            return;
        }

        drop(session);
        shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{local_dac, Command, FakeDac, FakeDacConfig};
    use crate::protocol::wire::RATE_CHANGE_BIT;

    fn spawn_sender(mut connection: DacConnection) -> JoinHandle<Result<(), ProtocolError>> {
        thread::spawn(move || connection.run_sender())
    }

    fn full_block(points: usize, rate: u32) -> PointBlock {
        let mut block = PointBlock::new(points, rate);
        for i in 0..points {
            block.set_point(i, i as i32, -(i as i32), 1000, 2000, 3000);
        }
        block
    }

    #[test]
    fn add_frame_drops_beyond_three_queued() {
        let shared = Shared::new();
        for _ in 0..4 {
            shared.add_frame(full_block(10, 30_000)).unwrap();
        }
        let session = shared.session.lock().unwrap();
        assert_eq!(session.frames.len(), 3);
    }

    #[test]
    fn ready_reflects_queue_depth() {
        let shared = Shared::new();
        assert!(shared.is_ready());
        shared.add_frame(full_block(10, 30_000)).unwrap();
        assert!(shared.is_ready());
        shared.add_frame(full_block(10, 30_000)).unwrap();
        assert!(!shared.is_ready());
    }

    #[test]
    fn add_frame_after_shutdown_raises() {
        let shared = Shared::new();
        shared.request_shutdown();
        assert!(matches!(
            shared.add_frame(full_block(1, 30_000)),
            Err(ProtocolError::ShutDown)
        ));
        assert!(matches!(shared.wait_for_ready(), Err(ProtocolError::ShutDown)));
    }

    #[test]
    fn begin_fires_at_start_threshold() {
        let fake = FakeDac::spawn(FakeDacConfig {
            initial_state: DacState::Prepared,
            initial_fullness: 3000,
            ..Default::default()
        });
        let shared = Arc::new(Shared::new());
        shared.add_frame(full_block(400, 48_000)).unwrap();

        let connection =
            DacConnection::connect(&local_dac(), fake.port(), Arc::clone(&shared)).unwrap();
        let handle = spawn_sender(connection);

        thread::sleep(Duration::from_millis(300));
        shared.request_shutdown();
        handle.join().unwrap().unwrap();

        let commands = fake.commands();
        match &commands[0] {
            Command::Begin { rate } => assert_eq!(*rate, 48_000),
            other => panic!("expected BEGIN first, got {:?}", other),
        }
        assert_eq!(
            commands.iter().filter(|c| matches!(c, Command::Begin { .. })).count(),
            1
        );
        assert!(commands.iter().any(|c| matches!(c, Command::Data { .. })));
    }

    #[test]
    fn begin_not_sent_below_start_threshold() {
        let fake = FakeDac::spawn(FakeDacConfig {
            initial_state: DacState::Prepared,
            initial_fullness: 2999,
            ..Default::default()
        });
        let shared = Arc::new(Shared::new());
        shared.add_frame(full_block(400, 48_000)).unwrap();

        let connection =
            DacConnection::connect(&local_dac(), fake.port(), Arc::clone(&shared)).unwrap();
        let handle = spawn_sender(connection);

        thread::sleep(Duration::from_millis(300));
        shared.request_shutdown();
        handle.join().unwrap().unwrap();

        let commands = fake.commands();
        // one point short of the threshold: data has to flow first
        // (a fresh connection queues its rate ahead of the first DATA)
        assert!(matches!(commands[0], Command::QueueRate { rate: 48_000 }));
        assert!(matches!(commands[1], Command::Data { .. }));
        let first_begin = commands
            .iter()
            .position(|c| matches!(c, Command::Begin { .. }))
            .expect("BEGIN after fullness crossed the threshold");
        assert!(first_begin > 1);
    }

    #[test]
    fn idle_dac_gets_prepared_before_data() {
        let fake = FakeDac::spawn(FakeDacConfig::default());
        let shared = Arc::new(Shared::new());
        shared.add_frame(full_block(200, 30_000)).unwrap();

        let connection =
            DacConnection::connect(&local_dac(), fake.port(), Arc::clone(&shared)).unwrap();
        let handle = spawn_sender(connection);

        thread::sleep(Duration::from_millis(300));
        shared.request_shutdown();
        handle.join().unwrap().unwrap();

        let commands = fake.commands();
        assert!(matches!(commands[0], Command::Prepare));
        assert!(commands.iter().any(|c| matches!(c, Command::Data { .. })));
    }

    #[test]
    fn rate_switch_emits_queue_then_flagged_data() {
        let fake = FakeDac::spawn(FakeDacConfig {
            initial_state: DacState::Prepared,
            initial_fullness: 0,
            ..Default::default()
        });
        let shared = Arc::new(Shared::new());
        shared.add_frame(full_block(120, 30_000)).unwrap();
        shared.add_frame(full_block(120, 48_000)).unwrap();

        let connection =
            DacConnection::connect(&local_dac(), fake.port(), Arc::clone(&shared)).unwrap();
        let handle = spawn_sender(connection);

        thread::sleep(Duration::from_millis(400));
        shared.request_shutdown();
        handle.join().unwrap().unwrap();

        let commands = fake.commands();
        let queue_48k = commands
            .iter()
            .position(|c| matches!(c, Command::QueueRate { rate: 48_000 }))
            .expect("rate change queued at the frame boundary");

        match &commands[queue_48k + 1] {
            Command::Data { points } => {
                let control = u16::from_le_bytes([points[0], points[1]]);
                assert_eq!(control & RATE_CHANGE_BIT, RATE_CHANGE_BIT);
            }
            other => panic!("expected DATA right after QUEUE, got {:?}", other),
        }

        // the flag only ever appears on a block directly following a QUEUE
        for (i, command) in commands.iter().enumerate() {
            if let Command::Data { points } = command {
                let after_queue = i > 0 && matches!(commands[i - 1], Command::QueueRate { .. });
                if !after_queue {
                    assert_eq!(points[1] & 0x80, 0, "stray rate-change bit at {}", i);
                }
            }
        }
    }

    #[test]
    fn data_blocks_respect_send_bounds() {
        let fake = FakeDac::spawn(FakeDacConfig {
            initial_state: DacState::Prepared,
            initial_fullness: 0,
            ..Default::default()
        });
        let shared = Arc::new(Shared::new());
        for _ in 0..3 {
            shared.add_frame(full_block(300, 30_000)).unwrap();
        }

        let connection =
            DacConnection::connect(&local_dac(), fake.port(), Arc::clone(&shared)).unwrap();
        let handle = spawn_sender(connection);

        thread::sleep(Duration::from_millis(400));
        shared.request_shutdown();
        handle.join().unwrap().unwrap();

        let commands = fake.commands();
        let mut total = 0usize;
        for command in &commands {
            if let Command::Data { points } = command {
                let n = points.len() / crate::protocol::wire::POINT_LEN;
                assert!(n <= MAX_POINTS_PER_SEND, "oversized data block: {}", n);
                total += n;
            }
        }
        assert!(total > 0);
        // the sender must stop near the fullness target, not stream blindly
        assert!(total as u32 <= TARGET_FULLNESS + MAX_POINTS_PER_SEND as u32);
    }

    #[test]
    fn nak_invalid_is_tolerated() {
        let fake = FakeDac::spawn(FakeDacConfig {
            initial_state: DacState::Prepared,
            initial_fullness: 0,
            nak_data: true,
            ..Default::default()
        });
        let shared = Arc::new(Shared::new());
        shared.add_frame(full_block(100, 30_000)).unwrap();

        let connection =
            DacConnection::connect(&local_dac(), fake.port(), Arc::clone(&shared)).unwrap();
        let handle = spawn_sender(connection);

        thread::sleep(Duration::from_millis(300));
        shared.request_shutdown();
        let result = handle.join().unwrap();
        assert!(result.is_ok(), "NAK_INVALID must not kill the stream: {:?}", result);

        assert!(fake.commands().iter().any(|c| matches!(c, Command::Data { .. })));
    }

    #[test]
    fn unknown_response_byte_is_fatal() {
        let fake = FakeDac::spawn(FakeDacConfig {
            initial_state: DacState::Prepared,
            initial_fullness: 0,
            poison_data: true,
            ..Default::default()
        });
        let shared = Arc::new(Shared::new());
        shared.add_frame(full_block(100, 30_000)).unwrap();

        let connection =
            DacConnection::connect(&local_dac(), fake.port(), Arc::clone(&shared)).unwrap();
        let handle = spawn_sender(connection);

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(ProtocolError::UnexpectedResponse(b'F'))));
    }

    #[test]
    fn firmware_version_is_probed_on_new_software() {
        let fake = FakeDac::spawn(FakeDacConfig::default());
        let shared = Arc::new(Shared::new());

        let mut dac = local_dac();
        dac.software_rev = 2;
        let mut connection = DacConnection::connect(&dac, fake.port(), Arc::clone(&shared)).unwrap();
        assert_eq!(connection.firmware_version(), "ether-dream v2.1");
        connection.teardown();

        assert!(fake.commands().iter().any(|c| matches!(c, Command::Version)));
    }

    #[test]
    fn old_software_skips_the_version_probe() {
        let fake = FakeDac::spawn(FakeDacConfig::default());
        let shared = Arc::new(Shared::new());

        let mut connection =
            DacConnection::connect(&local_dac(), fake.port(), Arc::clone(&shared)).unwrap();
        assert_eq!(connection.firmware_version(), "[old]");
        connection.teardown();

        assert!(!fake.commands().iter().any(|c| matches!(c, Command::Version)));
    }
}
