//! OSC control surface
//!
//! A UDP server thread decodes incoming packets (bundles recursively), maps
//! each `/Alloaudio/...` message onto a [`Parameter`] and hands it to a
//! caller-supplied closure. The socket read timeout doubles as the polling
//! interval for the stop flag.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rosc::{OscMessage, OscPacket, OscType};

use crate::params::{BassManagementMode, Parameter, SubwooferSet, meter_update_samples};
use crate::{MasterError, MasterResult};

/// Address prefix shared by every control message
pub const OSC_PREFIX: &str = "/Alloaudio";

/// Largest datagram accepted
const MAX_PACKET_SIZE: usize = 65_536;

/// Shortest receive timeout, so shutdown is never blocked indefinitely
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

// ============ Message Parsing ============

fn osc_error(msg: &OscMessage, what: &str) -> MasterError {
    MasterError::Osc(format!("{}: {}", msg.addr, what))
}

fn number(arg: &OscType) -> Option<f64> {
    match *arg {
        OscType::Int(v) => Some(v as f64),
        OscType::Long(v) => Some(v as f64),
        OscType::Float(v) => Some(v as f64),
        OscType::Double(v) => Some(v),
        _ => None,
    }
}

fn integer(arg: &OscType) -> Option<i64> {
    match *arg {
        OscType::Int(v) => Some(v as i64),
        OscType::Long(v) => Some(v),
        OscType::Float(v) => Some(v as i64),
        OscType::Double(v) => Some(v as i64),
        _ => None,
    }
}

fn flag(arg: &OscType) -> Option<bool> {
    match *arg {
        OscType::Bool(v) => Some(v),
        ref other => integer(other).map(|v| v != 0),
    }
}

fn arg<T>(msg: &OscMessage, index: usize, read: fn(&OscType) -> Option<T>) -> MasterResult<T> {
    msg.args
        .get(index)
        .and_then(read)
        .ok_or_else(|| osc_error(msg, "missing or non-numeric argument"))
}

fn channel_index(msg: &OscMessage, index: usize) -> MasterResult<usize> {
    let value = arg(msg, index, integer)?;
    usize::try_from(value).map_err(|_| osc_error(msg, "negative channel index"))
}

/// Map one control message onto a parameter
///
/// `sample_rate` converts `/meter_update_freq` (Hz) into frames.
pub fn parse_message(msg: &OscMessage, sample_rate: f64) -> MasterResult<Parameter> {
    let name = msg
        .addr
        .strip_prefix(OSC_PREFIX)
        .ok_or_else(|| osc_error(msg, "unknown address"))?;

    let parameter = match name {
        "/global_gain" => Parameter::MasterGain(arg(msg, 0, number)?),
        "/gain" => Parameter::ChannelGain {
            channel: channel_index(msg, 0)?,
            gain: arg(msg, 1, number)?,
        },
        "/mute_all" => Parameter::MuteAll(arg(msg, 0, flag)?),
        "/clipper_on" => Parameter::Clipper(arg(msg, 0, flag)?),
        "/room_compensation_on" => Parameter::FiltersActive(arg(msg, 0, flag)?),
        "/bass_management_freq" => Parameter::BassFrequency(arg(msg, 0, number)?),
        "/bass_management_mode" => {
            let raw = arg(msg, 0, integer)?;
            Parameter::BassMode(BassManagementMode::from_raw(
                i32::try_from(raw).unwrap_or(-1),
            )?)
        }
        "/sw_indeces" => {
            let mut raw = Vec::with_capacity(msg.args.len());
            for i in 0..msg.args.len() {
                let index = arg(msg, i, integer)?;
                raw.push(i32::try_from(index).unwrap_or(-1));
            }
            Parameter::Subwoofers(SubwooferSet::from_raw(&raw)?)
        }
        "/meter_on" => Parameter::MeterOn(arg(msg, 0, flag)?),
        "/meter_update_freq" => {
            let freq = arg(msg, 0, number)?;
            Parameter::MeterUpdateSamples(meter_update_samples(freq, sample_rate)?)
        }
        _ => return Err(osc_error(msg, "unknown address")),
    };
    Ok(parameter)
}

/// Parse every message in `packet` (recursing into bundles), forwarding good
/// ones to `handler` and logging the rest
pub fn dispatch_packet<F>(packet: &OscPacket, sample_rate: f64, handler: &mut F)
where
    F: FnMut(Parameter),
{
    match packet {
        OscPacket::Message(msg) => match parse_message(msg, sample_rate) {
            Ok(parameter) => handler(parameter),
            Err(e) => log::warn!("Ignoring OSC message: {}", e),
        },
        OscPacket::Bundle(bundle) => {
            for inner in &bundle.content {
                dispatch_packet(inner, sample_rate, handler);
            }
        }
    }
}

// ============ Control Server ============

/// UDP thread receiving OSC control messages
pub(crate) struct ControlServer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ControlServer {
    /// Bind `addr` and start serving; every decoded parameter goes to `handler`
    pub fn spawn<F>(
        addr: SocketAddr,
        timeout: Duration,
        sample_rate: f64,
        mut handler: F,
    ) -> MasterResult<Self>
    where
        F: FnMut(Parameter) + Send + 'static,
    {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
        let local_addr = socket.local_addr()?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("aa-osc-control".into())
            .spawn(move || {
                let mut buf = vec![0u8; MAX_PACKET_SIZE];
                while !thread_stop.load(Ordering::Acquire) {
                    match socket.recv_from(&mut buf) {
                        Ok((size, _)) => match rosc::decoder::decode_udp(&buf[..size]) {
                            Ok((_, packet)) => dispatch_packet(&packet, sample_rate, &mut handler),
                            Err(e) => log::warn!("Malformed OSC packet: {:?}", e),
                        },
                        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                        Err(e) => {
                            log::error!("OSC control socket failed: {}", e);
                            break;
                        }
                    }
                }
                log::debug!("OSC control server exiting");
            })?;

        log::info!("OSC control server listening on {}", local_addr);
        Ok(Self {
            stop,
            handle: Some(handle),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop and join the server thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("OSC control server panicked");
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosc::{OscBundle, OscTime};
    use std::sync::mpsc;

    fn message(addr: &str, args: Vec<OscType>) -> OscMessage {
        OscMessage {
            addr: addr.to_string(),
            args,
        }
    }

    #[test]
    fn test_parse_gains() {
        let msg = message("/Alloaudio/gain", vec![OscType::Int(3), OscType::Float(0.5)]);
        assert_eq!(
            parse_message(&msg, 48000.0).unwrap(),
            Parameter::ChannelGain {
                channel: 3,
                gain: 0.5
            }
        );

        let msg = message("/Alloaudio/global_gain", vec![OscType::Double(0.25)]);
        assert_eq!(
            parse_message(&msg, 48000.0).unwrap(),
            Parameter::MasterGain(0.25)
        );
    }

    #[test]
    fn test_numeric_types_interchangeable() {
        for arg in [OscType::Int(1), OscType::Float(1.0), OscType::Double(1.0)] {
            let msg = message("/Alloaudio/mute_all", vec![arg]);
            assert_eq!(parse_message(&msg, 48000.0).unwrap(), Parameter::MuteAll(true));
        }
        let msg = message("/Alloaudio/bass_management_freq", vec![OscType::Int(80)]);
        assert_eq!(
            parse_message(&msg, 48000.0).unwrap(),
            Parameter::BassFrequency(80.0)
        );
    }

    #[test]
    fn test_parse_subwoofers_and_mode() {
        let msg = message(
            "/Alloaudio/sw_indeces",
            vec![
                OscType::Int(6),
                OscType::Int(7),
                OscType::Int(-1),
                OscType::Int(-1),
            ],
        );
        match parse_message(&msg, 48000.0).unwrap() {
            Parameter::Subwoofers(set) => assert_eq!(set.as_slice(), &[6, 7]),
            other => panic!("unexpected {:?}", other),
        }

        let msg = message("/Alloaudio/bass_management_mode", vec![OscType::Int(2)]);
        assert_eq!(
            parse_message(&msg, 48000.0).unwrap(),
            Parameter::BassMode(BassManagementMode::Lowpass)
        );
        let msg = message("/Alloaudio/bass_management_mode", vec![OscType::Int(9)]);
        assert!(parse_message(&msg, 48000.0).is_err());
    }

    #[test]
    fn test_parse_meter_messages() {
        let msg = message("/Alloaudio/meter_update_freq", vec![OscType::Float(20.0)]);
        assert_eq!(
            parse_message(&msg, 48000.0).unwrap(),
            Parameter::MeterUpdateSamples(2400)
        );
        let msg = message("/Alloaudio/meter_on", vec![OscType::Bool(true)]);
        assert_eq!(parse_message(&msg, 48000.0).unwrap(), Parameter::MeterOn(true));
    }

    #[test]
    fn test_bad_messages_rejected() {
        assert!(parse_message(&message("/other/gain", vec![]), 48000.0).is_err());
        assert!(parse_message(&message("/Alloaudio/unknown", vec![]), 48000.0).is_err());
        assert!(parse_message(&message("/Alloaudio/gain", vec![OscType::Int(1)]), 48000.0).is_err());
        assert!(
            parse_message(
                &message("/Alloaudio/gain", vec![OscType::Int(-1), OscType::Float(1.0)]),
                48000.0
            )
            .is_err()
        );
        assert!(
            parse_message(
                &message("/Alloaudio/clipper_on", vec![OscType::String("on".into())]),
                48000.0
            )
            .is_err()
        );
    }

    #[test]
    fn test_bundles_unpacked_recursively() {
        let inner = OscPacket::Bundle(OscBundle {
            timetag: OscTime::from((0, 1)),
            content: vec![OscPacket::Message(message(
                "/Alloaudio/clipper_on",
                vec![OscType::Int(1)],
            ))],
        });
        let outer = OscPacket::Bundle(OscBundle {
            timetag: OscTime::from((0, 1)),
            content: vec![
                OscPacket::Message(message("/Alloaudio/mute_all", vec![OscType::Int(0)])),
                inner,
                OscPacket::Message(message("/Alloaudio/bogus", vec![])),
            ],
        });

        let mut seen = Vec::new();
        dispatch_packet(&outer, 48000.0, &mut |p| seen.push(p));
        assert_eq!(seen, vec![Parameter::MuteAll(false), Parameter::Clipper(true)]);
    }

    #[test]
    fn test_server_receives_and_stops() {
        let (tx, rx) = mpsc::channel();
        let mut server = ControlServer::spawn(
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_millis(10),
            48000.0,
            move |p| {
                let _ = tx.send(p);
            },
        )
        .unwrap();

        let packet = OscPacket::Message(message("/Alloaudio/global_gain", vec![OscType::Float(0.5)]));
        let bytes = rosc::encoder::encode(&packet).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&bytes, server.local_addr()).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, Parameter::MasterGain(0.5));

        server.shutdown();
        server.shutdown();
    }
}
