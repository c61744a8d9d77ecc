mod common;

use std::cell::RefCell;

use common::{CardEmu, Cs, ManualClock, SharedCard, Ticker};
use stm32f4_aof::aof::{ActiveObject, Event, Mailbox, Scheduler, StateMachine, Timebase};
use stm32f4_aof::controllers::{SdCallbacks, SdController, SdSignal, SdState};
use stm32f4_aof::diskio::{
    DResult, DiskIo, WallClock, GET_BLOCK_SIZE, GET_SECTOR_COUNT, GET_SECTOR_SIZE,
};
use stm32f4_aof::drivers::sd::{CardType, SdCard, SdConfig, Status, BLOCK_SIZE};
use stm32f4_aof::{Error, Protocol, Result};

fn card(emu: CardEmu) -> (SharedCard, SdCard<SharedCard, Cs, Ticker>) {
    let bus = SharedCard::new(emu);
    let sd = SdCard::new(bus.clone(), Cs, Ticker::default(), SdConfig::default());
    (bus, sd)
}

#[test]
fn sdhc_initialisation() {
    let (bus, mut sd) = card(CardEmu::sdhc());
    assert_eq!(sd.status(), Status::NotInit);
    assert_eq!(sd.init(), Ok(CardType::SdV2Hc));
    assert_eq!(sd.status(), Status::Ok);
    assert!(sd.card_type().is_some_and(CardType::block_addressed));
    assert_eq!(sd.wire_address(100), Ok(100));

    let emu = bus.0.borrow();
    // CMD0, CMD59, CMD8, three rounds of ACMD41, CMD58
    assert_eq!(emu.commands, [0, 59, 8, 55, 41, 55, 41, 55, 41, 58]);
    assert_eq!(emu.frequency, 25_000_000);
}

#[test]
fn standard_capacity_sets_block_length() {
    let (bus, mut sd) = card(CardEmu::sdsc());
    assert_eq!(sd.init(), Ok(CardType::SdV2));
    assert_eq!(bus.0.borrow().commands.last(), Some(&16));
    assert_eq!(sd.wire_address(100), Ok(51_200));
}

#[test]
fn single_block_read() {
    let (_bus, mut sd) = card(CardEmu::sdhc());
    sd.init().unwrap();
    let mut buf = [0u8; BLOCK_SIZE];
    assert_eq!(sd.read_blocks(100, &mut buf), Ok(()));
    assert!(buf.iter().enumerate().all(|(i, &b)| b == (i % 256) as u8));
    assert_eq!(sd.stats().blocks_read, 1);
}

#[test]
fn byte_addressed_cards_read_the_right_sector() {
    for emu in [CardEmu::sdhc(), CardEmu::sdsc()] {
        let (bus, mut sd) = card(emu);
        bus.0.borrow_mut().sectors.insert(100, [0xAB; BLOCK_SIZE]);
        sd.init().unwrap();
        let mut buf = [0u8; BLOCK_SIZE];
        sd.read_blocks(100, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
    }
}

#[test]
fn crc_mismatch_is_retried() {
    let (bus, mut sd) = card(CardEmu::sdhc());
    sd.init().unwrap();
    let retries = sd.stats().retries;

    bus.0.borrow_mut().corrupt_reads = 1;
    let mut buf = [0u8; BLOCK_SIZE];
    assert_eq!(sd.read_blocks(3, &mut buf), Ok(()));
    assert_eq!(sd.stats().crc_errors, 1);
    assert_eq!(sd.stats().retries, retries + 1);

    // One try plus three retries, all damaged
    bus.0.borrow_mut().corrupt_reads = 4;
    assert_eq!(
        sd.read_blocks(3, &mut buf),
        Err(Error::Protocol(Protocol::Checksum))
    );
    assert_eq!(sd.last_status(), Err(Error::Protocol(Protocol::Checksum)));
}

#[test]
fn refused_crc_checking_still_initialises() {
    let mut emu = CardEmu::sdhc();
    emu.refuse_crc = true;
    let (bus, mut sd) = card(emu);
    assert_eq!(sd.init(), Ok(CardType::SdV2Hc));
    {
        let emu = bus.0.borrow();
        assert_eq!(emu.commands, [0, 59, 8, 55, 41, 55, 41, 55, 41, 58]);
        assert!(!emu.crc_enabled);
    }
    let mut buf = [0u8; BLOCK_SIZE];
    assert_eq!(sd.read_blocks(1, &mut buf), Ok(()));
}

#[test]
fn acmd41_that_never_leaves_idle_times_out() {
    let mut emu = CardEmu::sdhc();
    emu.busy_polls = u32::MAX;
    let (_bus, mut sd) = card(emu);
    assert_eq!(sd.init(), Err(Error::Timeout));
    assert!(!sd.is_initialized());
    assert_eq!(sd.last_status(), Err(Error::Timeout));
    assert!(sd.stats().timeouts >= 1);
}

#[test]
fn rejected_data_block_is_an_error() {
    let (bus, mut sd) = card(CardEmu::sdhc());
    sd.init().unwrap();
    bus.0.borrow_mut().reject_writes = true;

    let rejected = Err(Error::Protocol(Protocol::Rejected(0x0D)));
    assert_eq!(sd.write_blocks(3, &[0x11; BLOCK_SIZE]), rejected);
    assert_eq!(sd.begin_write(3, &[0x11; BLOCK_SIZE]), rejected);
    assert!(!sd.is_transferring());
    assert!(!bus.0.borrow().sectors.contains_key(&3));
    assert_eq!(sd.stats().blocks_written, 0);
}

#[test]
fn card_busy_past_the_write_timeout() {
    let (bus, mut sd) = card(CardEmu::sdhc());
    sd.init().unwrap();
    bus.0.borrow_mut().write_busy = u32::MAX;
    let timeouts = sd.stats().timeouts;
    assert_eq!(sd.write_blocks(3, &[0x22; BLOCK_SIZE]), Err(Error::Timeout));
    assert_eq!(sd.stats().timeouts, timeouts + 1);

    // The split form gives up the same way, one poll at a time
    let (bus, mut sd) = card(CardEmu::sdhc());
    sd.init().unwrap();
    bus.0.borrow_mut().write_busy = u32::MAX;
    sd.begin_write(4, &[0x22; BLOCK_SIZE]).unwrap();
    let mut polls = 0;
    let result = loop {
        polls += 1;
        match sd.poll_write() {
            Ok(false) if polls < 1000 => continue,
            other => break other,
        }
    };
    assert_eq!(result, Err(Error::Timeout));
    assert!(polls > 1);
    assert!(!sd.is_transferring());
}

#[test]
fn missing_card_reports_no_device() {
    let mut emu = CardEmu::sdhc();
    emu.present = false;
    let (_bus, mut sd) = card(emu);
    assert_eq!(sd.init(), Err(Error::NoDevice));
    assert!(!sd.is_initialized());
}

#[test]
fn disk_io_multi_block_round_trip() {
    let clock = ManualClock::default();
    let (bus, sd) = card(CardEmu::sdhc());
    let mut disk = DiskIo::new(sd, WallClock::new(&clock, 1000));
    assert_eq!(disk.disk_initialize(0), 0);

    let mut data = vec![0u8; 3 * BLOCK_SIZE];
    for (i, sector) in data.chunks_exact_mut(BLOCK_SIZE).enumerate() {
        sector.fill(0x10 + i as u8);
    }
    assert_eq!(disk.disk_write(0, &data, 10, 3), DResult::Ok);
    {
        let emu = bus.0.borrow();
        assert!(emu.commands.ends_with(&[55, 23, 25]));
        assert_eq!(emu.sectors.get(&12).map(|s| s[0]), Some(0x12));
    }

    let mut back = vec![0u8; 3 * BLOCK_SIZE];
    assert_eq!(disk.disk_read(0, &mut back, 10, 3), DResult::Ok);
    assert_eq!(back, data);
    assert!(bus.0.borrow().commands.ends_with(&[18, 12]));

    let mut value = 0;
    assert_eq!(disk.disk_ioctl(0, GET_SECTOR_COUNT, &mut value), DResult::Ok);
    assert_eq!(value, 15_523_840);
    assert_eq!(disk.disk_ioctl(0, GET_SECTOR_SIZE, &mut value), DResult::Ok);
    assert_eq!(value, 512);
    assert_eq!(disk.disk_ioctl(0, GET_BLOCK_SIZE, &mut value), DResult::Ok);
    assert_eq!(value, 128);
}

#[test]
fn standard_capacity_sector_count() {
    let (_bus, mut sd) = card(CardEmu::sdsc());
    sd.init().unwrap();
    assert_eq!(sd.read_csd().map(|csd| csd.sector_count), Ok(2_097_152));
    assert_eq!(sd.read_csd().map(|csd| csd.capacity()), Ok(1 << 30));
}

thread_local! {
    static SECTORS: RefCell<Vec<(u32, u8)>> = const { RefCell::new(Vec::new()) };
    static DONE: RefCell<Vec<Result<()>>> = const { RefCell::new(Vec::new()) };
}

fn on_sector_read(block: u32, data: &[u8]) {
    SECTORS.with(|s| s.borrow_mut().push((block, data[1])));
}

fn fill_sector(_block: u32, data: &mut [u8]) {
    data.fill(0x5A);
}

fn on_complete(result: Result<()>) {
    DONE.with(|d| d.borrow_mut().push(result));
}

#[test]
fn controller_reads_and_writes_one_sector_per_tick() {
    let bus = SharedCard::new(CardEmu::sdhc());
    let sd = SdCard::new(bus.clone(), Cs, Ticker::default(), SdConfig::default());
    let callbacks = SdCallbacks {
        on_sector_read: Some(on_sector_read),
        fill_sector: Some(fill_sector),
        on_complete: Some(on_complete),
        ..Default::default()
    };

    let mb: Mailbox<Event<SdSignal>, 8> = Mailbox::new();
    let ao = ActiveObject::new(1, &mb, SdController::new(sd, callbacks), 1);
    let tb: Timebase<'_, 1> = Timebase::new();
    let mut sched = Scheduler::new(&tb);
    sched.register(&ao).unwrap();
    let state = || ao.inspect(|c| c.state());

    ao.post(SdSignal::Start).unwrap();
    sched.run_once();
    assert_eq!(state(), Some(SdState::Initialising));
    for _ in 0..20 {
        tb.tick();
        sched.run_once();
    }
    assert_eq!(state(), Some(SdState::Ready));

    ao.post(SdSignal::Read { block: 5, count: 2 }).unwrap();
    sched.run_once();
    assert_eq!(state(), Some(SdState::Reading { block: 5, end: 7 }));
    tb.tick();
    sched.run_once();
    assert_eq!(state(), Some(SdState::Reading { block: 6, end: 7 }));
    tb.tick();
    sched.run_once();
    assert_eq!(state(), Some(SdState::Ready));
    SECTORS.with(|s| assert_eq!(*s.borrow(), [(5, 1), (6, 1)]));

    ao.post(SdSignal::Write { block: 7, count: 1 }).unwrap();
    sched.run_once();
    tb.tick();
    sched.run_once();
    assert_eq!(state(), Some(SdState::Ready));
    assert_eq!(bus.0.borrow().sectors.get(&7), Some(&[0x5A; BLOCK_SIZE]));
    let both: [Result<()>; 2] = [Ok(()), Ok(())];
    DONE.with(|d| assert_eq!(*d.borrow(), both));

    // Pulled mid-transfer
    ao.post(SdSignal::Read { block: 0, count: 4 }).unwrap();
    sched.run_once();
    bus.0.borrow_mut().present = false;
    ao.post(SdSignal::CardRemoved).unwrap();
    sched.run_once();
    assert_eq!(state(), Some(SdState::Error(Error::NoDevice)));
    let removed: Result<()> = Err(Error::NoDevice);
    DONE.with(|d| assert_eq!(d.borrow().last(), Some(&removed)));

    tb.tick();
    sched.run_once();
    assert_eq!(state(), Some(SdState::Error(Error::NoDevice)));
    ao.post(SdSignal::Reset).unwrap();
    sched.run_once();
    assert_eq!(state(), Some(SdState::Idle));
}

#[test]
fn controller_keeps_polling_a_slow_card() {
    let mut emu = CardEmu::sdhc();
    emu.read_latency = 20;
    emu.write_busy = 30;
    let bus = SharedCard::new(emu);
    let sd = SdCard::new(bus.clone(), Cs, Ticker::default(), SdConfig::default());
    let mut ctl = SdController::new(sd, SdCallbacks::default());
    let mb: Mailbox<Event<SdSignal>, 4> = Mailbox::new();

    ctl.dispatch(Event::Signal(SdSignal::Start), &mb);
    for _ in 0..20 {
        ctl.dispatch(Event::Tick, &mb);
    }
    assert_eq!(ctl.state(), SdState::Ready);

    // Eight bytes are sampled per tick; the token comes after 21 fillers
    ctl.dispatch(Event::Signal(SdSignal::Read { block: 5, count: 1 }), &mb);
    ctl.dispatch(Event::Tick, &mb);
    assert_eq!(ctl.state(), SdState::Reading { block: 5, end: 6 });
    assert!(ctl.card().is_transferring());
    ctl.dispatch(Event::Tick, &mb);
    assert_eq!(ctl.state(), SdState::Reading { block: 5, end: 6 });
    ctl.dispatch(Event::Tick, &mb);
    assert_eq!(ctl.state(), SdState::Ready);
    assert_eq!(ctl.card().stats().blocks_read, 1);

    // Thirty busy bytes after the sector is accepted
    ctl.dispatch(Event::Signal(SdSignal::Write { block: 7, count: 1 }), &mb);
    for _ in 0..3 {
        ctl.dispatch(Event::Tick, &mb);
        assert_eq!(ctl.state(), SdState::Writing { block: 7, end: 8 });
    }
    ctl.dispatch(Event::Tick, &mb);
    assert_eq!(ctl.state(), SdState::Ready);
    assert!(bus.0.borrow().sectors.contains_key(&7));
    assert!(!ctl.card().is_transferring());
}
