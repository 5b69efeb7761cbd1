//! Meter telemetry worker
//!
//! Sleeps for one meter period (or until shutdown is requested), drains the
//! meter ring and sends one `/Alloaudio/meter i f` message per value.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aa_core::RingReader;
use parking_lot::{Condvar, Mutex};
use portable_atomic::AtomicF64;
use rosc::{OscMessage, OscPacket, OscType};

use crate::{MasterError, MasterResult};

/// OSC address of outgoing meter values
pub const METER_ADDR: &str = "/Alloaudio/meter";

/// Shortest wait between drains
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Longest wait between drains
const MAX_PERIOD: Duration = Duration::from_secs(1);

/// Stop flag plus the condvar the worker sleeps on
struct Wake {
    stop: Mutex<bool>,
    condvar: Condvar,
}

/// Background thread forwarding meter values over OSC
pub(crate) struct MeterWorker {
    wake: Arc<Wake>,
    handle: Option<JoinHandle<()>>,
}

impl MeterWorker {
    /// Bind a sending socket and start the worker
    ///
    /// `update_freq` is the meter rate in Hz, shared with the audio side so
    /// rate changes take effect on the next wait.
    pub fn spawn(
        reader: Arc<Mutex<RingReader<f32>>>,
        num_channels: usize,
        destination: SocketAddr,
        update_freq: Arc<AtomicF64>,
    ) -> MasterResult<Self> {
        let bind_addr: SocketAddr = if destination.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(destination)?;

        let wake = Arc::new(Wake {
            stop: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let worker_wake = Arc::clone(&wake);

        let handle = thread::Builder::new()
            .name("aa-meter".into())
            .spawn(move || {
                Self::worker_loop(worker_wake, reader, num_channels, socket, update_freq);
            })?;

        log::info!("Meter telemetry started: sending to {}", destination);
        Ok(Self {
            wake,
            handle: Some(handle),
        })
    }

    fn worker_loop(
        wake: Arc<Wake>,
        reader: Arc<Mutex<RingReader<f32>>>,
        num_channels: usize,
        socket: UdpSocket,
        update_freq: Arc<AtomicF64>,
    ) {
        let mut values = vec![0.0f32; reader.lock().capacity()];

        loop {
            let period = Duration::try_from_secs_f64(1.0 / update_freq.load(Ordering::Relaxed))
                .unwrap_or(MAX_PERIOD)
                .clamp(MIN_PERIOD, MAX_PERIOD);
            {
                let mut stop = wake.stop.lock();
                if !*stop {
                    wake.condvar.wait_for(&mut stop, period);
                }
                if *stop {
                    break;
                }
            }

            let count = reader.lock().pop_into(&mut values);
            for (i, &peak) in values[..count].iter().enumerate() {
                let channel = (i % num_channels) as i32;
                match encode_meter(channel, peak) {
                    Ok(packet) => {
                        if let Err(e) = socket.send(&packet) {
                            log::warn!("Meter send failed: {}", e);
                        }
                    }
                    Err(e) => log::warn!("{}", e),
                }
            }
        }

        log::debug!("Meter worker exiting");
    }

    /// Request exit, wake the worker and join it. Idempotent.
    pub fn shutdown(&mut self) {
        *self.wake.stop.lock() = true;
        self.wake.condvar.notify_all();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Meter worker panicked");
            }
        }
    }
}

impl Drop for MeterWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Encode one `/Alloaudio/meter i f` message
pub fn encode_meter(channel: i32, peak: f32) -> MasterResult<Vec<u8>> {
    let packet = OscPacket::Message(OscMessage {
        addr: METER_ADDR.to_string(),
        args: vec![OscType::Int(channel), OscType::Float(peak)],
    });
    rosc::encoder::encode(&packet).map_err(|e| MasterError::Osc(format!("{:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aa_core::RingBuffer;

    #[test]
    fn test_encode_meter_decodes_back() {
        let bytes = encode_meter(3, 0.25).unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&bytes).unwrap();
        match packet {
            OscPacket::Message(msg) => {
                assert_eq!(msg.addr, METER_ADDR);
                assert_eq!(msg.args, vec![OscType::Int(3), OscType::Float(0.25)]);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_worker_sends_and_stops() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let (mut writer, reader) = RingBuffer::<f32>::with_capacity(8).unwrap();
        writer.push_slice(&[0.5, 0.75]);

        let freq = Arc::new(AtomicF64::new(200.0));
        let mut worker = MeterWorker::spawn(
            Arc::new(Mutex::new(reader)),
            2,
            receiver.local_addr().unwrap(),
            freq,
        )
        .unwrap();

        let mut buf = [0u8; 256];
        let mut received = Vec::new();
        for _ in 0..2 {
            let size = receiver.recv(&mut buf).unwrap();
            let (_, packet) = rosc::decoder::decode_udp(&buf[..size]).unwrap();
            if let OscPacket::Message(msg) = packet {
                received.push(msg.args);
            }
        }
        assert_eq!(
            received,
            vec![
                vec![OscType::Int(0), OscType::Float(0.5)],
                vec![OscType::Int(1), OscType::Float(0.75)],
            ]
        );

        worker.shutdown();
        worker.shutdown();
        assert!(worker.handle.is_none());
    }
}
