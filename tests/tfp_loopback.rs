#![cfg(feature = "tfp")]

//! Talks to a minimal fake brickd on localhost

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use evse_tester::hardware::{
    DeviceErrorCode, Evse, HardwareError, JumperConfiguration, QuadRelay, RelayChannels,
    tfp::{
        Device, IpConnection,
        devices::{TfpEvse, TfpQuadRelay},
        packet::{HEADER_LEN, PacketHeader, PayloadWriter},
        uid,
    },
};

const EVSE_UID: &str = "Xyz";
const RELAY_UID: &str = "Qrs";

struct FakeBrickd {
    stream: TcpStream,
    old_firmware: bool,
    next_offset: u16,
    relay_value: u8,
}

impl FakeBrickd {
    fn send(&mut self, uid: u32, function_id: u8, seq: u8, error_code: u8, payload: &[u8]) {
        let header = PacketHeader {
            uid,
            length: (HEADER_LEN + payload.len()) as u8,
            function_id,
            sequence_number: seq,
            response_expected: seq != 0,
            error_code,
        };
        let mut buf = header.to_bytes().to_vec();
        buf.extend_from_slice(payload);
        self.stream.write_all(&buf).unwrap();
    }

    fn identity(uid: &str, device_identifier: u16) -> Vec<u8> {
        let mut p = vec![0u8; 16];
        p[..uid.len()].copy_from_slice(uid.as_bytes());
        p[8..14].copy_from_slice(b"6qzRzc");
        p.push(b'a');
        p.extend_from_slice(&[3, 0, 0, 2, 1, 0]);
        p.extend_from_slice(&device_identifier.to_le_bytes());
        p
    }

    fn low_level_state() -> Vec<u8> {
        let mut w = PayloadWriter::new().u8(1).u16(1000);
        for adc in 0..7 {
            w = w.u16(adc);
        }
        w = w.i16(-1234);
        for _ in 1..7 {
            w = w.i16(0);
        }
        w.u32(2700)
            .u32(u32::MAX)
            .u8(0b0010_0000)
            .u8(0b0000_0010)
            .u8(0)
            .u32(42)
            .finish()
    }

    fn detailed_chunk(&mut self) -> Vec<u8> {
        let offset = self.next_offset;
        self.next_offset = (offset + 15) % 90;
        let mut p = offset.to_le_bytes().to_vec();
        for i in offset..offset + 15 {
            let v = if i < 84 { i as f32 } else { 0.0 };
            p.extend_from_slice(&v.to_le_bytes());
        }
        p
    }

    fn serve(mut self) {
        let evse = uid::decode(EVSE_UID).unwrap();
        let relay = uid::decode(RELAY_UID).unwrap();
        loop {
            let mut head = [0u8; HEADER_LEN];
            if self.stream.read_exact(&mut head).is_err() {
                return;
            }
            let h = PacketHeader::from_bytes(&head).unwrap();
            let mut payload = vec![0u8; h.payload_len()];
            if self.stream.read_exact(&mut payload).is_err() {
                return;
            }
            println!("brickd <- uid {} fid {} {payload:02X?}", h.uid, h.function_id);
            let seq = h.sequence_number;
            match (h.uid, h.function_id) {
                (0, 254) => {
                    let mut p = Self::identity(RELAY_UID, TfpQuadRelay::DEVICE_IDENTIFIER);
                    p.push(0);
                    self.send(relay, 253, 0, 0, &p);
                    let mut p = Self::identity(EVSE_UID, TfpEvse::DEVICE_IDENTIFIER);
                    p.push(0);
                    self.send(evse, 253, 0, 0, &p);
                }
                (u, 255) if u == evse => {
                    let p = Self::identity(EVSE_UID, TfpEvse::DEVICE_IDENTIFIER);
                    self.send(u, 255, seq, 0, &p);
                }
                (u, 2) if u == evse => {
                    let p: &[u8] = if self.old_firmware { &[4, 0] } else { &[6, 0, 30, 1] };
                    self.send(u, 2, seq, 0, p);
                }
                (u, 3) if u == evse => self.send(u, 3, seq, 0, &Self::low_level_state()),
                (u, 4) if u == evse => {
                    let ma = u16::from_le_bytes([payload[0], payload[1]]);
                    self.send(u, 4, seq, if ma > 32000 { 1 } else { 0 }, &[]);
                }
                (u, 11) if u == evse => {
                    let p = self.detailed_chunk();
                    self.send(u, 11, seq, 0, &p);
                }
                (u, 12) if u == evse => {
                    let mut p = vec![1u8];
                    p.extend_from_slice(&[0u8; 24]);
                    self.send(u, 12, seq, 0, &p);
                }
                (u, 1) if u == relay => {
                    self.relay_value = payload[0];
                    self.send(u, 1, seq, 0, &[]);
                }
                (u, 2) if u == relay => {
                    let value = self.relay_value;
                    self.send(u, 2, seq, 0, &[value]);
                }
                (u, 5) if u == relay => {
                    let bit = 1 << payload[0];
                    match payload[1] {
                        0 => self.relay_value &= !bit,
                        _ => self.relay_value |= bit,
                    }
                    self.send(u, 5, seq, 0, &[]);
                }
                // Reset and anything unknown stay unanswered
                _ => {}
            }
        }
    }
}

fn start(old_firmware: bool) -> (Arc<IpConnection>, JoinHandle<()>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        FakeBrickd {
            stream,
            old_firmware,
            // Start mid-stream to exercise resyncing
            next_offset: 15,
            relay_value: 0,
        }
        .serve()
    });
    let ipcon = IpConnection::connect("127.0.0.1", port, Duration::from_millis(300)).unwrap();
    (ipcon, handle)
}

#[test]
fn enumerate_finds_evse() {
    let (ipcon, _server) = start(false);
    let identity = ipcon
        .find_device(TfpEvse::DEVICE_IDENTIFIER, Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(identity.uid, EVSE_UID);
    assert_eq!(identity.connected_uid, "6qzRzc");
    assert_eq!(identity.position, 'a');
    assert_eq!(identity.firmware_version, [2, 1, 0]);

    let res = ipcon.find_device(9999, Some(Duration::from_millis(300)));
    assert!(matches!(res, Err(HardwareError::DeviceNotFound(_))));
}

#[test]
fn evse_requests() {
    let (ipcon, _server) = start(false);
    let mut evse = TfpEvse::new(EVSE_UID, ipcon.clone()).unwrap();

    let id = evse.identity().unwrap();
    assert_eq!(id.device_identifier, 2167);
    assert_eq!(id.hardware_version, [3, 0, 0]);

    let hw = evse.hardware_configuration().unwrap();
    assert_eq!(hw.jumper_configuration, Some(JumperConfiguration::A32));
    assert!(!hw.has_lock_switch);
    assert_eq!(hw.evse_version, 30);
    assert_eq!(hw.energy_meter_type, 1);

    let state = evse.low_level_state().unwrap();
    assert_eq!(state.cp_pwm_duty_cycle, 1000);
    assert_eq!(state.voltages[0], -1234);
    assert_eq!(state.cp_pe_resistance(), 2700);
    assert_eq!(state.pp_pe_resistance(), u32::MAX);
    assert!(state.gpio(5));
    assert!(state.gpio(9));
    assert!(!state.gpio(11));
    assert_eq!(state.charging_time, 42);

    evse.set_max_charging_current(16000).unwrap();
    match evse.set_max_charging_current(40000) {
        Err(HardwareError::DeviceError { uid, function_id, code }) => {
            assert_eq!(uid, EVSE_UID);
            assert_eq!(function_id, 4);
            assert_eq!(code, DeviceErrorCode::InvalidParameter);
        }
        other => panic!("Expected a device error, got {other:?}"),
    }

    // Reset has no response, the connection must stay usable
    evse.reset().unwrap();
    assert!(evse.low_level_state().is_ok());
}

#[test]
fn detailed_values_resync() {
    let (ipcon, _server) = start(false);
    let mut evse = TfpEvse::new(EVSE_UID, ipcon).unwrap();
    let values = evse.energy_meter_detailed_values().unwrap();
    assert_eq!(values.len(), 84);
    assert!(values.iter().enumerate().all(|(i, v)| *v == i as f32));
}

#[test]
fn old_firmware_hardware_configuration() {
    let (ipcon, _server) = start(true);
    let mut evse = TfpEvse::new(EVSE_UID, ipcon).unwrap();
    let hw = evse.hardware_configuration().unwrap();
    assert_eq!(hw.jumper_configuration, Some(JumperConfiguration::A20));
    assert_eq!(hw.evse_version, 20);
    assert_eq!(hw.energy_meter_type, 1);
}

#[test]
fn quad_relay_channels() {
    let (ipcon, _server) = start(false);
    let mut iqr = TfpQuadRelay::new(RELAY_UID, ipcon).unwrap();
    iqr.set_value(RelayChannels::CHANNEL_0).unwrap();
    iqr.set_selected_value(2, true).unwrap();
    iqr.set_selected_value(0, false).unwrap();
    assert_eq!(iqr.value().unwrap(), RelayChannels::channel(2));
}

#[test]
fn unanswered_request_times_out() {
    let (ipcon, _server) = start(false);
    let dev = Device::new(EVSE_UID, ipcon.clone()).unwrap();
    match dev.call(99, PayloadWriter::new()) {
        Err(HardwareError::ResponseTimeout { uid, function_id }) => {
            assert_eq!(uid, EVSE_UID);
            assert_eq!(function_id, 99);
        }
        other => panic!("Expected a timeout, got {other:?}"),
    }

    ipcon.disconnect();
    assert!(matches!(dev.identity(), Err(HardwareError::NotConnected)));
}
