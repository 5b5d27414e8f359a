//! End-to-end flash scenarios over the virtual ECU:
//! read, CAL/BIN/PROM writes, and pre-flight validation.

use vyflash::image::{CAL_OFFSET, CAL_SIZE};
use vyflash::{Image, SessionState, WriteMode};
use vyflash_tests::{fast_config, open_virtual, stock_image};

#[test]
fn full_read_returns_the_controller_image() {
    let stock = stock_image();
    let (mut session, _ecu) = open_virtual(&fast_config(), Some(&stock));

    let image = session.read_image(&mut |_| {}).unwrap();
    assert_eq!(image.as_bytes(), stock.as_bytes());
    assert_eq!(image.os_id(), "$060A");
    assert_eq!(session.state(), SessionState::Idle);
}

#[test]
fn cal_write_touches_only_the_calibration_sector() {
    let stock = stock_image();
    let (mut session, ecu) = open_virtual(&fast_config(), Some(&stock));

    // All-0xAA calibration window; its checksum word is 0x5400.
    let mut target = stock.clone();
    target.as_bytes_mut()[CAL_OFFSET..CAL_OFFSET + CAL_SIZE].fill(0xAA);
    target.fix_checksum();
    assert_eq!(target.stored_checksum(), 0x5400);

    let report = session
        .write_image(WriteMode::Cal, &target, &mut |_| {})
        .unwrap();
    assert!(report.completed());
    assert_eq!(report.bytes_written, CAL_SIZE as u64);
    assert_eq!(report.sectors_erased, vec![1]);
    assert_eq!(report.sectors_verified, vec![1]);
    assert_eq!(report.chip_checksum, Some(0x5400));
    assert_eq!(ecu.lock().sector_erases, 1);

    // Everything outside the calibration window is untouched.
    let after = session.read_image(&mut |_| {}).unwrap();
    assert_eq!(after.stored_checksum(), 0x5400);
    assert_eq!(
        &after.as_bytes()[CAL_OFFSET..CAL_OFFSET + CAL_SIZE],
        &target.as_bytes()[CAL_OFFSET..CAL_OFFSET + CAL_SIZE]
    );
    assert_eq!(&after.as_bytes()[..CAL_OFFSET], &stock.as_bytes()[..CAL_OFFSET]);
    assert_eq!(
        &after.as_bytes()[CAL_OFFSET + CAL_SIZE..],
        &stock.as_bytes()[CAL_OFFSET + CAL_SIZE..]
    );
}

#[test]
fn prom_round_trip_is_byte_identical_including_the_boot_sector() {
    let stock = stock_image();
    let (mut session, _ecu) = open_virtual(&fast_config(), Some(&stock));

    let first = session.read_image(&mut |_| {}).unwrap();
    let report = session
        .write_image(WriteMode::Prom, &first, &mut |_| {})
        .unwrap();
    assert!(report.completed());
    assert_eq!(report.sectors_erased, vec![0, 1, 2, 3, 4, 5, 6, 7]);

    let second = session.read_image(&mut |_| {}).unwrap();
    assert_eq!(second.as_bytes(), first.as_bytes());
    // The boot sector went through erase+program and came back intact.
    assert_eq!(
        &second.as_bytes()[0x1C000..],
        &stock.as_bytes()[0x1C000..]
    );
}

#[test]
fn bin_write_never_touches_the_boot_sector() {
    let stock = stock_image();
    let (mut session, ecu) = open_virtual(&fast_config(), Some(&stock));

    // The target asks for changes in sector 3 and (illegitimately) in
    // the boot sector; BIN mode must apply the former and ignore the
    // latter.
    let mut target = stock.clone();
    target.as_bytes_mut()[0xC100] = 0x00;
    target.as_bytes_mut()[0x1C100] = 0x00;
    target.fix_checksum();

    let report = session
        .write_image(WriteMode::Bin, &target, &mut |_| {})
        .unwrap();
    assert!(report.completed());
    assert!(!report.sectors_erased.contains(&7));

    let after = session.read_image(&mut |_| {}).unwrap();
    assert_eq!(after.as_bytes()[0xC100], 0x00);
    assert_eq!(after.as_bytes()[0x1C100], stock.as_bytes()[0x1C100]);
    // The low 8 KiB is RAM-shadowed space: erased, never programmed.
    assert!(after.as_bytes()[..0x2000].iter().all(|&b| b == 0xFF));
    assert_eq!(ecu.lock().sector_erases, 7);
}

#[test]
fn write_rejects_a_bad_checksum_before_any_device_io() {
    let stock = stock_image();
    let (mut session, ecu) = open_virtual(&fast_config(), Some(&stock));

    let mut target = stock.clone();
    target.as_bytes_mut()[0x5000] ^= 0xFF; // invalidates the checksum

    let err = session
        .write_image(WriteMode::Cal, &target, &mut |_| {})
        .unwrap_err();
    assert!(matches!(err, vyflash::Error::Validation(_)), "got {err:?}");
    {
        let ecu = ecu.lock();
        assert_eq!(ecu.sector_erases, 0);
        assert_eq!(ecu.flash_write_frames, 0);
    }
    // The session was never touched and remains usable.
    assert_eq!(session.state(), SessionState::Idle);
}

#[test]
fn auto_checksum_fix_repairs_the_image_in_flight() {
    let stock = stock_image();
    let mut config = fast_config();
    config.auto_checksum_fix = true;
    let (mut session, _ecu) = open_virtual(&config, Some(&stock));

    let mut target = stock.clone();
    target.as_bytes_mut()[0x5000] ^= 0xFF;
    let expected = {
        let mut fixed = target.clone();
        fixed.fix_checksum();
        fixed.stored_checksum()
    };

    let report = session
        .write_image(WriteMode::Cal, &target, &mut |_| {})
        .unwrap();
    assert!(report.completed());
    assert_eq!(report.image_checksum, expected);

    let after = session.read_image(&mut |_| {}).unwrap();
    assert_eq!(after.stored_checksum(), expected);
    assert!(after.verify_checksum());
}

#[test]
fn sixteen_kib_cal_files_flash_after_padding() {
    let (mut session, _ecu) = open_virtual(&fast_config(), Some(&stock_image()));

    let mut cal = vec![0xAA; CAL_SIZE];
    // Leave room for a valid checksum word.
    cal[0x06] = 0x54;
    cal[0x07] = 0x00;
    let mut target = Image::from_bytes(cal).unwrap();
    target.fix_checksum();

    let report = session
        .write_image(WriteMode::Cal, &target, &mut |_| {})
        .unwrap();
    assert!(report.completed());
}

#[test]
fn info_reports_the_flash_chip_and_os_id() {
    let (mut session, _ecu) = open_virtual(&fast_config(), Some(&stock_image()));

    let info = session.info(&mut |_| {}).unwrap();
    assert_eq!(info.flash_manufacturer, 0x01);
    assert_eq!(info.flash_device, 0x20);
    assert_eq!(info.flash_name, Some("AMD Am29F010 (128 KiB)"));
    assert_eq!(info.os_id, "$060A");
    assert_eq!(session.state(), SessionState::Idle);

    // Second call is served from cache without another handshake.
    let again = session.info(&mut |_| {}).unwrap();
    assert_eq!(again, info);
}

#[test]
fn max_chunk_size_still_round_trips() {
    let stock = stock_image();
    let mut config = fast_config();
    config.chunk_size = 64;
    let (mut session, _ecu) = open_virtual(&config, Some(&stock));

    let mut target = stock.clone();
    target.as_bytes_mut()[CAL_OFFSET..CAL_OFFSET + CAL_SIZE].fill(0x77);
    target.fix_checksum();

    let report = session
        .write_image(WriteMode::Cal, &target, &mut |_| {})
        .unwrap();
    assert!(report.completed());
    let after = session.read_image(&mut |_| {}).unwrap();
    assert_eq!(
        &after.as_bytes()[CAL_OFFSET..CAL_OFFSET + CAL_SIZE],
        &target.as_bytes()[CAL_OFFSET..CAL_OFFSET + CAL_SIZE]
    );
}
