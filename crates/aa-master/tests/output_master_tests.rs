//! Output master integration tests
//!
//! Verifies:
//! - Mute/unmute restores exact levels
//! - Scheduled parameters never act early and apply together
//! - Bass management routing in every mode
//! - Gains, clipper and meter cadence
//! - Room compensation through the convolver
//! - OSC control and telemetry round trips
//! - Lifecycle and validation errors

use std::net::UdpSocket;
use std::thread;
use std::time::{Duration, Instant};

use aa_core::{AudioIoData, Sample};
use aa_master::{
    BassManagementMode, MasterError, OutputMaster, OutputMasterConfig, Parameter,
};
use approx::assert_abs_diff_eq;
use rosc::{OscMessage, OscPacket, OscType};

const SAMPLE_RATE: f64 = 48000.0;
const BLOCK_SIZE: usize = 64;

fn master(channels: usize) -> OutputMaster {
    OutputMaster::new(OutputMasterConfig::new(channels, SAMPLE_RATE)).unwrap()
}

fn sine(freq: f64, amplitude: f64, len: usize) -> Vec<Sample> {
    (0..len)
        .map(|i| amplitude * (2.0 * std::f64::consts::PI * freq * i as f64 / SAMPLE_RATE).sin())
        .collect()
}

/// Feed `signals` (one per output channel) through the master block by block
fn run(master: &mut OutputMaster, signals: &[Vec<Sample>], block: usize) -> Vec<Vec<Sample>> {
    let len = signals[0].len();
    let mut io = AudioIoData::new(block, 0, signals.len());
    let mut collected = vec![Vec::with_capacity(len); signals.len()];
    for start in (0..len).step_by(block) {
        for (ch, signal) in signals.iter().enumerate() {
            io.output_mut(ch)
                .copy_from_slice(&signal[start..start + block]);
        }
        master.process_block(&mut io).unwrap();
        for (ch, out) in collected.iter_mut().enumerate() {
            out.extend_from_slice(io.output(ch));
        }
    }
    collected
}

fn tail(signal: &[Sample]) -> &[Sample] {
    &signal[signal.len() / 2..]
}

fn peak(signal: &[Sample]) -> Sample {
    signal.iter().fold(0.0, |p: Sample, s| p.max(s.abs()))
}

fn energy(signal: &[Sample]) -> Sample {
    signal.iter().map(|s| s * s).sum()
}

fn constant_block(io: &mut AudioIoData, value: Sample) {
    for ch in 0..io.outputs().channels() {
        io.output_mut(ch).fill(value);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GAIN, MUTE, CLIPPER
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_mute_unmute_restores_exact_levels() {
    let mut m = master(2);
    m.set_master_gain(0.7);
    m.set_gain(0, 0.3).unwrap();

    let signal = vec![sine(440.0, 0.8, BLOCK_SIZE), sine(1000.0, 0.5, BLOCK_SIZE)];
    let before = run(&mut m, &signal, BLOCK_SIZE);

    m.set_mute_all(true);
    let muted = run(&mut m, &signal, BLOCK_SIZE);
    assert!(muted.iter().flatten().all(|&s| s == 0.0));
    assert_eq!(m.gain(0), Some(0.3));

    m.set_mute_all(false);
    let after = run(&mut m, &signal, BLOCK_SIZE);
    assert_eq!(before, after);
}

#[test]
fn test_channel_then_master_gain() {
    let mut m = master(3);
    m.set_gain(2, 0.5).unwrap();
    m.set_master_gain(0.25);

    let mut io = AudioIoData::new(BLOCK_SIZE, 0, 3);
    constant_block(&mut io, 1.0);
    m.process_block(&mut io).unwrap();

    assert!(io.output(0).iter().all(|&s| s == 0.25));
    assert!(io.output(2).iter().all(|&s| s == 0.125));
}

#[test]
fn test_clipper_bounds_output() {
    let mut m = master(1);
    m.set_master_gain(4.0);

    let mut io = AudioIoData::new(BLOCK_SIZE, 0, 1);
    io.output_mut(0).copy_from_slice(&sine(500.0, 0.5, BLOCK_SIZE));
    m.process_block(&mut io).unwrap();
    assert!(peak(io.output(0)) > 1.5);

    m.set_clipper_on(true);
    io.output_mut(0).copy_from_slice(&sine(500.0, 0.5, BLOCK_SIZE));
    m.process_block(&mut io).unwrap();
    assert_abs_diff_eq!(peak(io.output(0)), 1.0, epsilon = 1e-12);
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCHEDULED PARAMETERS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_future_parameter_has_no_earlier_effect() {
    let mut m = master(1);
    let control = m.control();
    control.schedule(Parameter::MasterGain(0.5), 200).unwrap();

    let mut io = AudioIoData::new(BLOCK_SIZE, 0, 1);
    for block in 0..6 {
        constant_block(&mut io, 1.0);
        m.process_block(&mut io).unwrap();
        let start = (block * BLOCK_SIZE) as u64;
        let expected = if start >= 200 { 0.5 } else { 1.0 };
        assert!(
            io.output(0).iter().all(|&s| s == expected),
            "block starting at {} expected gain {}",
            start,
            expected
        );
    }
    assert_eq!(control.pending(), 0);
}

#[test]
fn test_due_parameters_apply_together() {
    let mut m = master(2);
    let control = m.control();
    control.schedule(Parameter::MasterGain(0.5), 64).unwrap();
    control
        .schedule(
            Parameter::ChannelGain {
                channel: 1,
                gain: 0.5,
            },
            64,
        )
        .unwrap();

    let mut io = AudioIoData::new(BLOCK_SIZE, 0, 2);
    constant_block(&mut io, 1.0);
    m.process_block(&mut io).unwrap();
    assert!(io.output(1).iter().all(|&s| s == 1.0));

    constant_block(&mut io, 1.0);
    m.process_block(&mut io).unwrap();
    assert!(io.output(0).iter().all(|&s| s == 0.5));
    assert!(io.output(1).iter().all(|&s| s == 0.25));
}

#[test]
fn test_equal_times_apply_in_arrival_order() {
    let mut m = master(1);
    let control = m.control();
    control.schedule(Parameter::MasterGain(0.1), 0).unwrap();
    control.schedule(Parameter::MasterGain(0.9), 0).unwrap();
    control.schedule(Parameter::MasterGain(0.3), 0).unwrap();

    let mut io = AudioIoData::new(BLOCK_SIZE, 0, 1);
    m.process_block(&mut io).unwrap();
    assert_eq!(m.master_gain(), 0.3);
}

#[test]
fn test_control_set_applies_next_block() {
    let mut m = master(2);
    let control = m.control();
    let mut io = AudioIoData::new(BLOCK_SIZE, 0, 2);
    m.process_block(&mut io).unwrap();
    assert_eq!(control.now(), BLOCK_SIZE as u64);

    let remote = control.clone();
    thread::spawn(move || remote.set_mute_all(true).unwrap())
        .join()
        .unwrap();
    assert!(!m.is_muted());

    constant_block(&mut io, 1.0);
    m.process_block(&mut io).unwrap();
    assert!(m.is_muted());
    assert!(io.output(0).iter().all(|&s| s == 0.0));
}

#[test]
fn test_queue_full_reported() {
    let m = OutputMaster::new(OutputMasterConfig {
        queue_capacity: 2,
        ..OutputMasterConfig::new(2, SAMPLE_RATE)
    })
    .unwrap();
    let control = m.control();
    control.set_clipper_on(true).unwrap();
    control.set_meter_on(true).unwrap();
    assert!(matches!(
        control.set_master_gain(0.5),
        Err(MasterError::QueueFull { capacity: 2 })
    ));
}

#[test]
fn test_control_validates_arguments() {
    let m = master(4);
    let control = m.control();
    assert!(matches!(
        control.set_gain(4, 1.0),
        Err(MasterError::InvalidChannel {
            channel: 4,
            available: 4
        })
    ));
    assert!(matches!(
        control.set_sw_indices(&[0, 1, 2, 3, 0, 1]),
        Ok(())
    ));
    assert!(matches!(
        control.set_sw_indices(&[4]),
        Err(MasterError::InvalidChannel { .. })
    ));
    assert!(matches!(
        control.set_meter_update_freq(-1.0),
        Err(MasterError::InvalidParameter(_))
    ));
}

// ═══════════════════════════════════════════════════════════════════════════════
// BASS MANAGEMENT
// ═══════════════════════════════════════════════════════════════════════════════

const FRAMES: usize = 256 * 64;

fn bass_master(mode: BassManagementMode) -> OutputMaster {
    let mut m = master(3);
    m.set_sw_indices(&[2]).unwrap();
    m.set_bass_management_freq(150.0);
    m.set_bass_management_mode(mode);
    m
}

#[test]
fn test_mode_none_is_passthrough() {
    let mut m = bass_master(BassManagementMode::None);
    let signals = vec![
        sine(40.0, 0.3, FRAMES),
        sine(3000.0, 0.3, FRAMES),
        vec![0.5; FRAMES],
    ];
    let out = run(&mut m, &signals, 256);
    assert_eq!(out, signals);
}

#[test]
fn test_mix_routes_low_band_energy_to_subwoofer() {
    let mut m = bass_master(BassManagementMode::Mix);
    let low = sine(40.0, 0.3, FRAMES);
    let signals = vec![low.clone(), vec![0.0; FRAMES], vec![0.0; FRAMES]];
    let out = run(&mut m, &signals, 256);

    // Mains stay full range
    assert_eq!(out[0], low);

    let ratio = energy(tail(&out[2])) / energy(tail(&low));
    assert_abs_diff_eq!(ratio, 1.0, epsilon = 0.03);
}

#[test]
fn test_mix_keeps_high_band_off_subwoofer() {
    let mut m = bass_master(BassManagementMode::Mix);
    let high = sine(4000.0, 0.3, FRAMES);
    let signals = vec![high, vec![0.0; FRAMES], vec![0.0; FRAMES]];
    let out = run(&mut m, &signals, 256);
    assert!(peak(tail(&out[2])) < 1e-3);
}

#[test]
fn test_lowpass_replaces_subwoofer_signal() {
    let mut m = bass_master(BassManagementMode::Lowpass);
    let signals = vec![
        sine(4000.0, 0.3, FRAMES),
        vec![0.0; FRAMES],
        vec![0.5; FRAMES],
    ];
    let out = run(&mut m, &signals, 256);

    assert!(peak(tail(&out[2])) < 1e-3);
    assert_abs_diff_eq!(peak(tail(&out[0])), 0.3, epsilon = 0.01);
}

#[test]
fn test_highpass_leaves_subwoofer_untouched() {
    let mut m = bass_master(BassManagementMode::Highpass);
    let signals = vec![
        sine(40.0, 0.3, FRAMES),
        vec![0.0; FRAMES],
        vec![0.5; FRAMES],
    ];
    let out = run(&mut m, &signals, 256);

    assert!(out[2].iter().all(|&s| s == 0.5));
    assert!(peak(tail(&out[0])) < 0.01);
}

#[test]
fn test_full_sums_low_band_onto_subwoofer_signal() {
    let mut m = bass_master(BassManagementMode::Full);
    let signals = vec![
        sine(40.0, 0.3, FRAMES),
        vec![0.0; FRAMES],
        vec![0.5; FRAMES],
    ];
    let out = run(&mut m, &signals, 256);

    let sub = tail(&out[2]);
    let max = sub.iter().cloned().fold(f64::MIN, f64::max);
    let min = sub.iter().cloned().fold(f64::MAX, f64::min);
    assert_abs_diff_eq!((max + min) / 2.0, 0.5, epsilon = 0.01);
    assert_abs_diff_eq!((max - min) / 2.0, 0.3, epsilon = 0.01);
    assert!(peak(tail(&out[0])) < 0.01);
}

#[test]
fn test_mode_change_never_touches_gains_or_mute() {
    let mut m = bass_master(BassManagementMode::Mix);
    m.set_gain(1, 0.4).unwrap();
    m.set_mute_all(true);
    m.set_bass_management_mode(BassManagementMode::Full);
    assert_eq!(m.gain(1), Some(0.4));
    assert!(m.is_muted());
    assert_eq!(m.bass_management_mode(), BassManagementMode::Full);
}

#[test]
fn test_subwoofer_limits() {
    let mut m = master(8);
    assert!(matches!(
        m.set_sw_indices(&[0, 1, 2, 3, 4]),
        Err(MasterError::TooManySubwoofers { max: 4, got: 5 })
    ));
    assert!(matches!(
        m.set_sw_indices(&[8]),
        Err(MasterError::InvalidChannel {
            channel: 8,
            available: 8
        })
    ));
    m.set_sw_indices(&[6, 7]).unwrap();
    assert_eq!(m.sw_indices(), &[6, 7]);
}

// ═══════════════════════════════════════════════════════════════════════════════
// METERING
// ═══════════════════════════════════════════════════════════════════════════════

fn metered_master(channels: usize) -> OutputMaster {
    let mut m = master(channels);
    m.set_meter_update_freq(480.0).unwrap(); // 100 frames
    m.set_meter_on(true);
    m
}

#[test]
fn test_meter_cadence_and_values() {
    let mut m = metered_master(2);
    let mut io = AudioIoData::new(BLOCK_SIZE, 0, 2);
    for _ in 0..10 {
        io.output_mut(0).fill(0.25);
        io.output_mut(1).fill(-0.75);
        m.process_block(&mut io).unwrap();
    }

    // 640 frames / 100 per update
    let mut values = [0.0f32; 33];
    assert_eq!(m.get_meter_values(&mut values), 12);
    for frame in values[..12].chunks_exact(2) {
        assert_eq!(frame, &[0.25, 0.75]);
    }

    // Read once
    assert_eq!(m.get_meter_values(&mut values), 0);
}

#[test]
fn test_meter_bounded_by_output_peak() {
    let mut m = metered_master(1);
    m.set_master_gain(4.0);
    m.set_clipper_on(true);

    let signal = vec![sine(300.0, 0.5, BLOCK_SIZE * 8)];
    let out = run(&mut m, &signal, BLOCK_SIZE);
    let max = peak(&out[0]) as f32;

    let mut values = [0.0f32; 16];
    let count = m.get_meter_values(&mut values);
    assert_eq!(count, 5);
    for &v in &values[..count] {
        assert!(v <= max && v <= 1.0);
    }
}

#[test]
fn test_meter_off_publishes_nothing() {
    let mut m = master(2);
    let mut io = AudioIoData::new(BLOCK_SIZE, 0, 2);
    constant_block(&mut io, 0.5);
    for _ in 0..100 {
        m.process_block(&mut io).unwrap();
    }
    let mut values = [0.0f32; 8];
    assert_eq!(m.get_meter_values(&mut values), 0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROOM COMPENSATION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_room_compensation_convolves_when_active() {
    let mut m = master(2);
    let delay = [0.0, 1.0, 0.0, 0.0];
    let half = [0.5, 0.0, 0.0, 0.0];
    m.set_room_compensation_filters(&[&delay, &half], 4, BLOCK_SIZE)
        .unwrap();

    let ramp: Vec<Sample> = (0..BLOCK_SIZE).map(|i| i as f64 / 100.0).collect();
    let mut io = AudioIoData::new(BLOCK_SIZE, 0, 2);

    // Installed but inactive: passthrough
    io.output_mut(0).copy_from_slice(&ramp);
    io.output_mut(1).copy_from_slice(&ramp);
    m.process_block(&mut io).unwrap();
    assert_eq!(io.output(0), &ramp[..]);

    m.set_room_compensation_on(true);
    io.output_mut(0).copy_from_slice(&ramp);
    io.output_mut(1).copy_from_slice(&ramp);
    m.process_block(&mut io).unwrap();

    assert_abs_diff_eq!(io.output(0)[0], 0.0, epsilon = 1e-9);
    for i in 1..BLOCK_SIZE {
        assert_abs_diff_eq!(io.output(0)[i], ramp[i - 1], epsilon = 1e-9);
        assert_abs_diff_eq!(io.output(1)[i], ramp[i] * 0.5, epsilon = 1e-9);
    }
    assert_eq!(m.latency(), 0);
}

#[test]
fn test_room_compensation_block_size_mismatch() {
    let mut m = master(1);
    let ir = [1.0, 0.0];
    m.set_room_compensation_filters(&[&ir], 2, BLOCK_SIZE).unwrap();
    m.set_room_compensation_on(true);

    let mut io = AudioIoData::new(BLOCK_SIZE / 2, 0, 1);
    assert!(matches!(
        m.process_block(&mut io),
        Err(MasterError::Convolver(_))
    ));
}

#[test]
fn test_room_compensation_filter_count_checked() {
    let mut m = master(2);
    let ir = [1.0, 0.0];
    assert!(matches!(
        m.set_room_compensation_filters(&[&ir], 2, BLOCK_SIZE),
        Err(MasterError::Convolver(_))
    ));
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_shutdown_is_idempotent() {
    let mut m = master(2);
    m.shutdown();
    m.shutdown();
    assert!(m.is_shut_down());

    let mut io = AudioIoData::new(BLOCK_SIZE, 0, 2);
    assert!(matches!(
        m.process_block(&mut io),
        Err(MasterError::ShutDown)
    ));
}

#[test]
fn test_invalid_construction() {
    assert!(matches!(
        OutputMaster::new(OutputMasterConfig::new(0, SAMPLE_RATE)),
        Err(MasterError::InvalidConfig(_))
    ));
    assert!(matches!(
        OutputMaster::new(OutputMasterConfig::new(2, -1.0)),
        Err(MasterError::InvalidConfig(_))
    ));
}

#[test]
fn test_build_from_json_config() {
    let config = OutputMasterConfig::from_json(
        r#"{ "num_channels": 6, "sample_rate": 96000.0, "sw_indices": [5], "bass_management_mode": "lowpass" }"#,
    )
    .unwrap();
    let m = OutputMaster::new(config).unwrap();
    assert_eq!(m.num_chnls(), 6);
    assert_eq!(m.sw_indices(), &[5]);
    assert_eq!(m.bass_management_mode(), BassManagementMode::Lowpass);
}

// ═══════════════════════════════════════════════════════════════════════════════
// OSC
// ═══════════════════════════════════════════════════════════════════════════════

fn send_osc(to: std::net::SocketAddr, addr: &str, args: Vec<OscType>) {
    let packet = OscPacket::Message(OscMessage {
        addr: addr.to_string(),
        args,
    });
    let bytes = rosc::encoder::encode(&packet).unwrap();
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .send_to(&bytes, to)
        .unwrap();
}

#[test]
fn test_osc_control_round_trip() {
    let mut m = OutputMaster::new(OutputMasterConfig {
        control_addr: Some("127.0.0.1:0".parse().unwrap()),
        message_timeout_ms: 10,
        ..OutputMasterConfig::new(2, SAMPLE_RATE)
    })
    .unwrap();
    let addr = m.control_addr().unwrap();
    let control = m.control();

    send_osc(
        addr,
        "/Alloaudio/gain",
        vec![OscType::Int(1), OscType::Float(0.25)],
    );

    let deadline = Instant::now() + Duration::from_secs(2);
    while control.pending() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(control.pending(), 1);

    let mut io = AudioIoData::new(BLOCK_SIZE, 0, 2);
    constant_block(&mut io, 1.0);
    m.process_block(&mut io).unwrap();
    assert!(io.output(1).iter().all(|&s| s == 0.25));
    assert!(io.output(0).iter().all(|&s| s == 1.0));

    m.shutdown();
    assert_eq!(m.control_addr(), None);
}

#[test]
fn test_osc_meter_telemetry() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    let mut m = OutputMaster::new(OutputMasterConfig {
        telemetry_addr: Some(receiver.local_addr().unwrap()),
        meter_on: true,
        meter_update_freq: 480.0,
        ..OutputMasterConfig::new(2, SAMPLE_RATE)
    })
    .unwrap();

    let mut io = AudioIoData::new(BLOCK_SIZE, 0, 2);
    for _ in 0..4 {
        io.output_mut(0).fill(0.5);
        io.output_mut(1).fill(0.125);
        m.process_block(&mut io).unwrap();
    }

    let mut buf = [0u8; 256];
    let size = receiver.recv(&mut buf).unwrap();
    let (_, packet) = rosc::decoder::decode_udp(&buf[..size]).unwrap();
    match packet {
        OscPacket::Message(msg) => {
            assert_eq!(msg.addr, "/Alloaudio/meter");
            assert_eq!(msg.args, vec![OscType::Int(0), OscType::Float(0.5)]);
        }
        other => panic!("unexpected packet {:?}", other),
    }

    m.shutdown();
}

#[test]
fn test_unreachable_control_addr_is_not_fatal() {
    let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
    let m = OutputMaster::new(OutputMasterConfig {
        control_addr: Some(taken.local_addr().unwrap()),
        ..OutputMasterConfig::new(2, SAMPLE_RATE)
    })
    .unwrap();
    assert_eq!(m.control_addr(), None);
}
