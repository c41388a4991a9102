//! Serial output
//!
//! Log records go to the first serial port (COM1), which QEMU and most bare-metal test setups
//! redirect to the console.

use core::fmt::{self, Write};

use spin::Mutex;
use uart_16550::SerialPort;

const COM1: u16 = 0x3F8;

static SERIAL_PORT: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(COM1) });

/// Configures the UART, must be called before the first print.
pub fn init() {
    SERIAL_PORT.lock().init();
}

/// Prints to the serial port, dropping the output if the port is in use.
///
/// A VM exit can interrupt the guest while it holds the port, waiting would never return.
pub fn _print(args: fmt::Arguments) {
    if let Some(mut port) = SERIAL_PORT.try_lock() {
        // The UART never reports errors
        let _ = port.write_fmt(args);
    }
}
