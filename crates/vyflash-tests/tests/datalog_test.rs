//! Datalog stream: worker ownership, decoding, and mutual exclusion
//! with the programming path.

use std::sync::Arc;

use parking_lot::Mutex;

use vyflash::{DatalogRow, Error, SessionState, Stage};
use vyflash_tests::{fast_config, open_virtual, stock_image};

#[test]
fn datalog_streams_typed_rows_and_returns_the_session() {
    let (session, _ecu) = open_virtual(&fast_config(), Some(&stock_image()));
    let monitor = session.progress_monitor();

    let rows: Arc<Mutex<Vec<DatalogRow>>> = Arc::new(Mutex::new(Vec::new()));
    let rows_sink = Arc::clone(&rows);
    let handle = session
        .datalog(Box::new(move |row| rows_sink.lock().push(row)))
        .map_err(|(_, e)| e)
        .unwrap();

    // Wait until the worker has streamed a few samples.
    for _ in 0..200 {
        if rows.lock().len() >= 5 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert_eq!(monitor.snapshot().stage, Stage::Datalog);

    let session = handle.stop().unwrap();
    let rows = rows.lock();
    assert!(rows.len() >= 5, "only {} rows streamed", rows.len());

    // The virtual ECU's canned sensor snapshot decodes to engineering
    // values.
    let row = &rows[0];
    assert_eq!(row.value("RPM"), Some(800.0));
    assert_eq!(row.value("ECT Temp"), Some(50.0));
    assert!((row.value("Battery V").unwrap() - 14.0).abs() < 1e-9);
    assert_eq!(row.value("IAC Steps"), Some(30.0));
    // EPROM id bytes mirror the loaded image.
    assert_eq!(row.value("EPROM ID Hi"), Some(6.0));
    assert_eq!(row.value("EPROM ID Lo"), Some(10.0));

    // The worker hands the session back ready for use.
    assert_eq!(session.state(), SessionState::Idle);
    let mut session = session;
    session.silence().unwrap();
}

#[test]
fn datalog_is_refused_once_the_bus_is_silenced() {
    let (mut session, _ecu) = open_virtual(&fast_config(), Some(&stock_image()));
    session.silence().unwrap();

    let (session, err) = session
        .datalog(Box::new(|_| {}))
        .err()
        .expect("datalog after silence must be refused");
    assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    // The session comes back intact in the error path.
    assert_eq!(session.state(), SessionState::Silenced);
}
