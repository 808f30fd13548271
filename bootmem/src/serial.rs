//! Serial debug output (COM1 @ 0x3F8)
//!
//! Polling only, no buffering, no interrupts. Usable before and after
//! ExitBootServices since it never calls firmware.

use core::fmt;

const COM1: u16 = 0x3F8;
const COM1_LSR: u16 = COM1 + 5;
const LSR_TX_EMPTY: u8 = 0x20;

/// Spins per byte before giving up on a stuck transmitter.
const TX_SPINS: usize = 100;

/// A 16550-compatible port driven by port I/O.
pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    pub const fn com1() -> Self {
        Self { base: COM1 }
    }

    /// Write one byte. Bounded wait: a byte the UART never accepts is dropped.
    #[inline]
    pub fn putc(&mut self, b: u8) {
        let lsr = self.base + (COM1_LSR - COM1);
        unsafe {
            for _ in 0..TX_SPINS {
                let status: u8;
                core::arch::asm!(
                    "in al, dx",
                    in("dx") lsr,
                    out("al") status,
                    options(nomem, nostack, preserves_flags)
                );
                if status & LSR_TX_EMPTY != 0 {
                    core::arch::asm!(
                        "out dx, al",
                        in("dx") self.base,
                        in("al") b,
                        options(nomem, nostack, preserves_flags)
                    );
                    return;
                }
                core::hint::spin_loop();
            }
        }
    }

    pub fn puts(&mut self, s: &str) {
        for b in s.bytes() {
            if b == b'\n' {
                self.putc(b'\r');
            }
            self.putc(b);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.puts(s);
        Ok(())
    }
}
