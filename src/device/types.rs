//! Register-level model of a serial adapter.
//!
//! `ControlBlock` mirrors the adapter's control register set and
//! `CommTimeouts` its timeout registers. Both are plain data: the semantic
//! rules for changing them live in the settings store.

use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::time::Duration;

/// "No limit" value of a timeout register.
pub const MAXDWORD: u32 = u32::MAX;

/// Read constant used to emulate an infinite read timeout (about 24.8 days).
///
/// The timeout registers have no "wait forever for at least one byte" mode,
/// so an infinite read is armed with this bound and re-armed on expiry.
pub const INFINITE_READ_CONSTANT: u32 = i32::MAX as u32;

/// Default XON character.
pub const DEFAULT_XON_CHAR: u8 = 0x11;
/// Default XOFF character.
pub const DEFAULT_XOFF_CHAR: u8 = 0x13;
/// End-of-file marker; also programmed as the event character.
pub const EOF_CHAR: u8 = 0x1A;

/// Parity checking modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl DataBits {
    /// Bit count as a number.
    pub fn bits(self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = u8;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            5 => Ok(Self::Five),
            6 => Ok(Self::Six),
            7 => Ok(Self::Seven),
            8 => Ok(Self::Eight),
            other => Err(other),
        }
    }
}

/// Flow-control discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Handshake {
    None,
    XOnXOff,
    RequestToSend,
    RequestToSendXOnXOff,
}

impl Handshake {
    /// Whether RTS is driven by the handshake rather than by the caller.
    pub fn uses_rts(self) -> bool {
        matches!(self, Self::RequestToSend | Self::RequestToSendXOnXOff)
    }

    /// Whether software flow control is active.
    pub fn uses_xon_xoff(self) -> bool {
        matches!(self, Self::XOnXOff | Self::RequestToSendXOnXOff)
    }
}

/// DTR line control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtrControl {
    Disable,
    Enable,
    Handshake,
}

/// RTS line control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtsControl {
    Disable,
    Enable,
    Handshake,
    Toggle,
}

/// In-memory mirror of the adapter's control register set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Binary mode; always on for serial devices.
    pub binary: bool,
    /// Parity checking on receive.
    pub parity_check: bool,
    pub outx_cts_flow: bool,
    pub outx_dsr_flow: bool,
    pub dtr_control: DtrControl,
    pub dsr_sensitivity: bool,
    /// XON/XOFF on transmit.
    pub outx: bool,
    /// XON/XOFF on receive.
    pub inx: bool,
    /// Replace bytes received with a parity error by `error_char`.
    pub error_char_enabled: bool,
    /// Drop received null bytes.
    pub discard_null: bool,
    pub rts_control: RtsControl,
    pub abort_on_error: bool,
    pub xon_limit: u16,
    pub xoff_limit: u16,
    pub xon_char: u8,
    pub xoff_char: u8,
    pub error_char: u8,
    pub eof_char: u8,
    pub event_char: u8,
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            binary: true,
            parity_check: false,
            outx_cts_flow: false,
            outx_dsr_flow: false,
            dtr_control: DtrControl::Disable,
            dsr_sensitivity: false,
            outx: false,
            inx: false,
            error_char_enabled: false,
            discard_null: false,
            rts_control: RtsControl::Disable,
            abort_on_error: false,
            xon_limit: 0,
            xoff_limit: 0,
            xon_char: DEFAULT_XON_CHAR,
            xoff_char: DEFAULT_XOFF_CHAR,
            error_char: 0,
            eof_char: EOF_CHAR,
            event_char: EOF_CHAR,
        }
    }
}

/// A read or write timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeout {
    /// Total milliseconds for the operation. Zero means "return immediately".
    Millis(u32),
    /// Wait until the operation completes or the stream closes.
    Infinite,
}

impl Timeout {
    /// Zero timeout: return whatever is available without waiting.
    pub const IMMEDIATE: Timeout = Timeout::Millis(0);

    /// Whether this is the zero timeout.
    pub fn is_immediate(self) -> bool {
        self == Self::IMMEDIATE
    }

    /// The bound as a `Duration`, or `None` for an infinite timeout.
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Self::Millis(ms) => Some(Duration::from_millis(u64::from(ms))),
            Self::Infinite => None,
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::Infinite
    }
}

/// How long a device read may wait for its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadWait {
    /// Return what is buffered, possibly nothing.
    Immediate,
    /// Return as soon as at least one byte arrives, or after the bound.
    Within(Duration),
}

/// Mirror of the adapter's timeout registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommTimeouts {
    pub read_interval: u32,
    pub read_total_multiplier: u32,
    pub read_total_constant: u32,
    pub write_total_multiplier: u32,
    pub write_total_constant: u32,
}

impl Default for CommTimeouts {
    fn default() -> Self {
        Self::new(Timeout::Infinite, Timeout::Infinite)
    }
}

impl CommTimeouts {
    /// Register values for the given read and write timeouts.
    pub fn new(read: Timeout, write: Timeout) -> Self {
        let mut timeouts = Self {
            read_interval: MAXDWORD,
            read_total_multiplier: 0,
            read_total_constant: 0,
            write_total_multiplier: 0,
            write_total_constant: 0,
        };
        timeouts.set_read(read);
        timeouts.set_write(write);
        timeouts
    }

    /// Program the read registers.
    pub fn set_read(&mut self, read: Timeout) {
        self.read_interval = MAXDWORD;
        match read {
            Timeout::Millis(0) => {
                self.read_total_multiplier = 0;
                self.read_total_constant = 0;
            }
            Timeout::Millis(ms) => {
                self.read_total_multiplier = MAXDWORD;
                self.read_total_constant = ms;
            }
            Timeout::Infinite => {
                self.read_total_multiplier = MAXDWORD;
                self.read_total_constant = INFINITE_READ_CONSTANT;
            }
        }
    }

    /// Program the write registers. A zero write constant means "no bound".
    pub fn set_write(&mut self, write: Timeout) {
        self.write_total_multiplier = 0;
        self.write_total_constant = match write {
            Timeout::Millis(ms) => ms,
            Timeout::Infinite => 0,
        };
    }

    /// Copy with the read registers reprogrammed.
    pub fn with_read(mut self, read: Timeout) -> Self {
        self.set_read(read);
        self
    }

    /// Copy with the write registers reprogrammed.
    pub fn with_write(mut self, write: Timeout) -> Self {
        self.set_write(write);
        self
    }

    /// The read timeout these registers encode.
    pub fn read_timeout(&self) -> Timeout {
        if self.read_total_constant == INFINITE_READ_CONSTANT {
            Timeout::Infinite
        } else {
            Timeout::Millis(self.read_total_constant)
        }
    }

    /// The write timeout these registers encode.
    pub fn write_timeout(&self) -> Timeout {
        match self.write_total_constant {
            0 => Timeout::Infinite,
            ms => Timeout::Millis(ms),
        }
    }

    /// How a device read should wait under these registers.
    pub fn read_wait(&self) -> ReadWait {
        if self.read_total_constant == 0 && self.read_total_multiplier == 0 {
            ReadWait::Immediate
        } else {
            ReadWait::Within(Duration::from_millis(u64::from(self.read_total_constant)))
        }
    }

    /// Total bound for a write, or `None` when unbounded.
    pub fn write_bound(&self) -> Option<Duration> {
        match self.write_total_constant {
            0 => None,
            ms => Some(Duration::from_millis(u64::from(ms))),
        }
    }
}

/// Static capabilities reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommProperties {
    /// Highest supported baud rate; zero when the driver imposes no bound.
    pub max_baud: u32,
    pub current_rx_queue: u32,
    pub current_tx_queue: u32,
}

/// Input line state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModemStatus {
    pub cts: bool,
    pub dsr: bool,
    pub ring: bool,
    /// Receive-line-signal-detect, a.k.a. carrier detect.
    pub rlsd: bool,
}

/// Driver queue occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommStatus {
    pub in_queue: u32,
    pub out_queue: u32,
}

/// Latched transport errors, cleared when read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineErrors {
    pub frame: bool,
    pub overrun: bool,
    pub rx_over: bool,
    pub rx_parity: bool,
    pub tx_full: bool,
}

impl LineErrors {
    pub fn is_empty(&self) -> bool {
        !(self.frame || self.overrun || self.rx_over || self.rx_parity || self.tx_full)
    }
}

/// Hardware events the driver can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u32);

impl EventMask {
    pub const RXCHAR: EventMask = EventMask(0x0001);
    /// The event character (end-of-stream marker) was received.
    pub const RXFLAG: EventMask = EventMask(0x0002);
    pub const TXEMPTY: EventMask = EventMask(0x0004);
    pub const CTS: EventMask = EventMask(0x0008);
    pub const DSR: EventMask = EventMask(0x0010);
    pub const RLSD: EventMask = EventMask(0x0020);
    pub const BREAK: EventMask = EventMask(0x0040);
    pub const ERR: EventMask = EventMask(0x0080);
    pub const RING: EventMask = EventMask(0x0100);

    /// Everything a stream monitors (all events except TXEMPTY).
    pub const ALL: EventMask = EventMask(0x01FB);

    /// Line and pin change events.
    pub const PIN_CHANGES: EventMask = EventMask(0x0008 | 0x0010 | 0x0020 | 0x0040 | 0x0100);
    /// Receive events.
    pub const RECEIVED: EventMask = EventMask(0x0001 | 0x0002);

    pub const fn empty() -> Self {
        EventMask(0)
    }

    /// Mask from raw register bits; unknown bits are dropped.
    pub const fn from_bits(bits: u32) -> Self {
        EventMask(bits & 0x01FF)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        EventMask(self.0 & rhs.0)
    }
}

/// Direct pin commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EscapeFunction {
    SetDtr,
    ClearDtr,
    SetRts,
    ClearRts,
}

/// Which driver buffer to discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purge {
    /// Drop received bytes.
    Input,
    /// Drop bytes not yet transmitted.
    Output,
    /// Drop received bytes and fail outstanding reads with `Aborted`.
    AbortInput,
    /// Drop pending output and fail outstanding writes with `Aborted`.
    AbortOutput,
}

impl Purge {
    /// Whether this purge clears the receive side.
    pub fn is_input(self) -> bool {
        matches!(self, Self::Input | Self::AbortInput)
    }

    /// Whether outstanding requests are aborted.
    pub fn aborts(self) -> bool {
        matches!(self, Self::AbortInput | Self::AbortOutput)
    }
}

/// File class of an opened device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    /// A character device.
    Character,
    /// The class could not be determined; USB adapters often report this.
    Unknown,
    /// Anything else (regular file, pipe, disk).
    Other,
}
