//! In-process fake Ether Dream DAC for protocol tests.
//!
//! Accepts control-channel connections on an ephemeral loopback port,
//! answers every command with a synthesized status response and records the
//! received command stream for assertions. State transitions follow the
//! device: PREPARE moves IDLE to PREPARED, BEGIN to PLAYING, DATA grows the
//! reported fullness.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;

use crate::discovery::DiscoveredDac;
use crate::protocol::wire::{
    commands, DacResponse, DacState, DacStatus, ACK, NAK_INVALID, POINT_LEN, VERSION_LEN,
};

/// A `DiscoveredDac` pointing at loopback; `software_rev` 0 skips the
/// firmware version probe.
pub(crate) fn local_dac() -> DiscoveredDac {
    DiscoveredDac {
        id: "abcdef".to_string(),
        ip_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        hardware_rev: 1,
        software_rev: 0,
        buffer_capacity: 1800,
    }
}

/// Command stream as observed by the fake DAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    /// A client connected (or reconnected)
    Connected,
    Prepare,
    Begin { rate: u32 },
    QueueRate { rate: u32 },
    /// Raw 18-byte point records of one DATA command
    Data { points: Vec<u8> },
    Version,
}

#[derive(Clone)]
pub(crate) struct FakeDacConfig {
    pub initial_state: DacState,
    pub initial_fullness: u16,
    /// Respond NAK_INVALID to DATA commands
    pub nak_data: bool,
    /// Respond with an unknown response byte to DATA commands
    pub poison_data: bool,
    /// Drop the connection after this many DATA commands
    pub fail_after_data: Option<usize>,
}

impl Default for FakeDacConfig {
    fn default() -> Self {
        Self {
            initial_state: DacState::Idle,
            initial_fullness: 0,
            nak_data: false,
            poison_data: false,
            fail_after_data: None,
        }
    }
}

pub(crate) struct FakeDac {
    port: u16,
    log: Arc<Mutex<Vec<Command>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeDac {
    pub(crate) fn spawn(config: FakeDacConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        listener.set_nonblocking(true).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_log = Arc::clone(&log);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("fake-dac".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            thread_log.lock().unwrap().push(Command::Connected);
                            serve_connection(stream, &config, &thread_log, &thread_stop);
                        }
                        Err(_) => thread::sleep(Duration::from_millis(5)),
                    }
                }
            })
            .unwrap();

        Self {
            port,
            log,
            stop,
            handle: Some(handle),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Commands received so far, connection markers included.
    pub(crate) fn commands(&self) -> Vec<Command> {
        let full = self.log.lock().unwrap().clone();
        full.into_iter().filter(|c| *c != Command::Connected).collect()
    }

    /// The raw log including `Connected` markers.
    pub(crate) fn commands_with_connects(&self) -> Vec<Command> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == Command::Connected)
            .count()
    }
}

impl Drop for FakeDac {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct DeviceState {
    state: DacState,
    fullness: u16,
    rate: u32,
    points_played: u32,
}

fn serve_connection(
    mut stream: TcpStream,
    config: &FakeDacConfig,
    log: &Arc<Mutex<Vec<Command>>>,
    stop: &Arc<AtomicBool>,
) {
    stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();

    let mut device = DeviceState {
        state: config.initial_state,
        fullness: config.initial_fullness,
        rate: 0,
        points_played: 0,
    };

    // unsolicited status straight after accept
    if write_response(&mut stream, ACK, b'?', &device).is_err() {
        return;
    }

    let mut data_commands = 0usize;

    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }

        let mut command = [0u8; 1];
        match stream.read_exact(&mut command) {
            Ok(()) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => return,
        }

        let result = match command[0] {
            commands::PREPARE => {
                log.lock().unwrap().push(Command::Prepare);
                device.state = DacState::Prepared;
                device.fullness = 0;
                write_response(&mut stream, ACK, commands::PREPARE, &device)
            }
            commands::BEGIN => {
                let mut args = [0u8; 6];
                if stream.read_exact(&mut args).is_err() {
                    return;
                }
                let rate = u32::from_le_bytes([args[2], args[3], args[4], args[5]]);
                log.lock().unwrap().push(Command::Begin { rate });
                device.state = DacState::Playing;
                device.rate = rate;
                write_response(&mut stream, ACK, commands::BEGIN, &device)
            }
            commands::QUEUE_RATE => {
                let mut args = [0u8; 4];
                if stream.read_exact(&mut args).is_err() {
                    return;
                }
                let rate = u32::from_le_bytes(args);
                log.lock().unwrap().push(Command::QueueRate { rate });
                write_response(&mut stream, ACK, commands::QUEUE_RATE, &device)
            }
            commands::DATA => {
                let mut header = [0u8; 2];
                if stream.read_exact(&mut header).is_err() {
                    return;
                }
                let count = u16::from_le_bytes(header) as usize;
                let mut points = vec![0u8; count * POINT_LEN];
                if stream.read_exact(&mut points).is_err() {
                    return;
                }
                log.lock().unwrap().push(Command::Data { points });

                data_commands += 1;
                if let Some(limit) = config.fail_after_data {
                    if data_commands >= limit {
                        // simulate a dying connection mid-stream
                        return;
                    }
                }

                device.fullness = device.fullness.saturating_add(count as u16);
                device.points_played = device.points_played.wrapping_add(count as u32);

                let response = if config.poison_data {
                    b'F'
                } else if config.nak_data {
                    NAK_INVALID
                } else {
                    ACK
                };
                write_response(&mut stream, response, commands::DATA, &device)
            }
            commands::VERSION => {
                log.lock().unwrap().push(Command::Version);
                let mut version = [0u8; VERSION_LEN];
                let text = b"ether-dream v2.1";
                version[..text.len()].copy_from_slice(text);
                stream.write_all(&version)
            }
            _ => return,
        };

        if result.is_err() {
            return;
        }
    }
}

fn write_response(
    stream: &mut TcpStream,
    response: u8,
    command: u8,
    device: &DeviceState,
) -> std::io::Result<()> {
    let status = DacStatus {
        playback_state: device.state,
        buffer_fullness: device.fullness,
        point_rate: device.rate,
        point_count: device.points_played,
        ..DacStatus::default()
    };
    let mut buf = BytesMut::new();
    DacResponse {
        response,
        command,
        status,
    }
    .encode(&mut buf);
    stream.write_all(&buf)
}
