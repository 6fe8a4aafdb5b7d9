//! USB interface class codes
//!
//! Only used to filter candidate devices during auto-discovery.

use std::fmt;

/// Class code advertised by a USB interface descriptor (bInterfaceClass)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceClass(pub u8);

impl InterfaceClass {
    pub const AUDIO: InterfaceClass = InterfaceClass(0x01);
    pub const COMMUNICATION: InterfaceClass = InterfaceClass(0x02);
    pub const HID: InterfaceClass = InterfaceClass(0x03);
    pub const STILL_IMAGING: InterfaceClass = InterfaceClass(0x06);
    pub const PRINTER: InterfaceClass = InterfaceClass(0x07);
    pub const MASS_STORAGE: InterfaceClass = InterfaceClass(0x08);
    pub const HUB: InterfaceClass = InterfaceClass(0x09);
    pub const CDC_DATA: InterfaceClass = InterfaceClass(0x0A);
    pub const VIDEO: InterfaceClass = InterfaceClass(0x0E);
    pub const VENDOR: InterfaceClass = InterfaceClass(0xFF);

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0x01 => "AUDIO",
            0x02 => "COMMUNICATION",
            0x03 => "HID",
            0x06 => "STILL_IMAGING",
            0x07 => "PRINTER",
            0x08 => "MASS_STORAGE",
            0x09 => "HUB",
            0x0A => "CDC_DATA",
            0x0E => "VIDEO",
            0xFF => "VENDOR",
            _ => return None,
        })
    }
}

impl From<u8> for InterfaceClass {
    fn from(code: u8) -> Self {
        InterfaceClass(code)
    }
}

impl fmt::Debug for InterfaceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({:#04x})", name, self.0),
            None => write!(f, "InterfaceClass({:#04x})", self.0),
        }
    }
}
