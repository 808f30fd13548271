//! `log` backend for the boot path.
//!
//! Records go to COM1 as `[LEVEL] target: message`. Nothing is printed until
//! [`init`] installs the logger; the crate itself only ever uses the `log`
//! macros.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

use crate::serial::SerialPort;

static PORT: Mutex<SerialPort> = Mutex::new(SerialPort::com1());

static LOGGER: SerialLogger = SerialLogger;

/// Logger writing to COM1.
pub struct SerialLogger;

/// Install the serial logger with `level` as the maximum level.
///
/// Returns `false` if some logger was already installed; the maximum level
/// is updated either way.
pub fn init(level: LevelFilter) -> bool {
    let installed = log::set_logger(&LOGGER).is_ok();
    log::set_max_level(level);
    installed
}

/// Format one record as a single line.
pub fn write_record<W: Write>(out: &mut W, record: &Record) -> fmt::Result {
    writeln!(
        out,
        "[{:5}] {}: {}",
        record.level(),
        record.target(),
        record.args()
    )
}

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut port = PORT.lock();
        let _ = write_record(&mut *port, record);
    }

    fn flush(&self) {}
}
