mod common;

use std::cell::Cell;

use common::{ubx_bytes, ManualClock, SharedPort};
use stm32f4_aof::aof::{ActiveObject, Event, Mailbox, Scheduler, Timebase};
use stm32f4_aof::controllers::{GpsCallbacks, GpsController, GpsSignal, GpsState};
use stm32f4_aof::drivers::gps::ubx::{class, id};
use stm32f4_aof::drivers::gps::{FixQuality, Gps, GpsConfig, Received, UbxMessage, UploadStatus};
use stm32f4_aof::{Error, Protocol};

const GGA: &[u8] = b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n";

static SETUP: [UbxMessage; 2] = [
    UbxMessage::cfg_prt_uart(1, 115_200, 0x0001, 0x0003),
    UbxMessage::cfg_rate(200, 1, 0),
];

fn ack(acked: bool, msg: &UbxMessage) -> Vec<u8> {
    let reply_id = if acked { id::ACK_ACK } else { id::ACK_NAK };
    ubx_bytes(&UbxMessage::with_payload(class::ACK, reply_id, &[msg.class, msg.id]).unwrap())
}

thread_local! {
    static CONFIGURED: Cell<u32> = const { Cell::new(0) };
}

fn on_configured() {
    CONFIGURED.with(|c| c.set(c.get() + 1));
}

#[test]
fn ack_advances_the_configuration_upload() {
    let port = SharedPort::default();
    let mb: Mailbox<Event<GpsSignal>, 8> = Mailbox::new();
    let tb: Timebase<'_, 1> = Timebase::new();
    let gps = Gps::new(port.clone(), &tb, GpsConfig::default());
    let callbacks = GpsCallbacks {
        on_configured: Some(on_configured),
        ..Default::default()
    };
    let ao = ActiveObject::new(1, &mb, GpsController::new(gps, &SETUP, callbacks), 10);
    let mut sched = Scheduler::new(&tb);
    sched.register(&ao).unwrap();
    let state = || ao.inspect(|c| c.state());

    ao.post(GpsSignal::Start).unwrap();
    sched.run_once();
    assert_eq!(state(), Some(GpsState::Configuring));
    assert_eq!(port.take_tx(), ubx_bytes(&SETUP[0]));

    // The receiver answers 30 ms later
    for ms in 1..=30 {
        if ms == 30 {
            port.inject(&ack(true, &SETUP[0]));
        }
        tb.tick();
        sched.run_once();
    }
    assert_eq!(state(), Some(GpsState::Configuring));
    assert_eq!(ao.inspect(|c| c.gps().upload_progress()), Some(1));
    assert_eq!(port.take_tx(), ubx_bytes(&SETUP[1]));

    port.inject(&ack(true, &SETUP[1]));
    for _ in 0..10 {
        tb.tick();
        sched.run_once();
    }
    assert_eq!(state(), Some(GpsState::Running));
    assert_eq!(CONFIGURED.with(Cell::get), 1);
    assert_eq!(ao.inspect(|c| c.gps().stats().acks), Some(2));
}

#[test]
fn ack_for_another_message_is_ignored() {
    let port = SharedPort::default();
    let clock = ManualClock::default();
    let mut gps = Gps::new(port.clone(), &clock, GpsConfig::default());
    gps.begin_config(&SETUP).unwrap();
    assert_eq!(gps.upload_step(), UploadStatus::InProgress);

    port.inject(&ack(true, &SETUP[1]));
    assert_eq!(gps.upload_step(), UploadStatus::InProgress);
    assert_eq!(gps.upload_progress(), 0);
    assert_eq!(gps.begin_config(&SETUP), Err(Error::Busy));
}

#[test]
fn repeated_nak_fails_the_upload() {
    let port = SharedPort::default();
    let clock = ManualClock::default();
    let mut gps = Gps::new(port.clone(), &clock, GpsConfig::default());
    gps.begin_config(&SETUP).unwrap();
    for _ in 0..4 {
        assert_eq!(gps.upload_step(), UploadStatus::InProgress);
        port.inject(&ack(false, &SETUP[0]));
    }
    assert_eq!(
        gps.upload_step(),
        UploadStatus::Failed(Error::Protocol(Protocol::Nak))
    );
    assert_eq!(gps.stats().naks, 4);
    assert_eq!(gps.stats().retries, 3);
}

#[test]
fn gga_sentence_yields_a_fix() {
    let port = SharedPort::default();
    let clock = ManualClock::default();
    let mut gps = Gps::new(port.clone(), &clock, GpsConfig::default());
    assert!(gps.is_stale());

    let mut received = None;
    for &byte in GGA {
        if let Some(r) = gps.feed(byte) {
            received = Some(r);
        }
    }
    assert!(matches!(received, Some(Received::Gga(_))));

    let fix = gps.fix().unwrap();
    assert!(fix.quality.is_valid());
    assert_eq!(fix.quality, FixQuality::Fix3D);
    assert!((fix.latitude - 481_173_000).abs() <= 1000);
    assert!((fix.longitude - 115_166_667).abs() <= 1000);
    assert_eq!(fix.altitude_cm, Some(54_540));
    assert_eq!(fix.satellites, 8);
    assert_eq!(fix.dop, 90);
    assert_eq!(
        (fix.time.hour, fix.time.minute, fix.time.second),
        (12, 35, 19)
    );
    assert!(!gps.is_stale());

    clock.advance(2001);
    assert!(gps.is_stale());
}

#[test]
fn interleaved_nmea_and_ubx_bytes() {
    let port = SharedPort::default();
    let clock = ManualClock::default();
    let mut gps = Gps::new(port.clone(), &clock, GpsConfig::default());

    port.inject(&GGA[..20]);
    port.inject(&ack(true, &SETUP[0]));
    port.inject(GGA);
    gps.poll();

    let stats = gps.stats();
    assert_eq!(stats.truncated, 1);
    assert_eq!(stats.ubx_frames, 1);
    assert_eq!(stats.nmea_frames, 1);
    assert_eq!(gps.fix_count(), 1);
}
