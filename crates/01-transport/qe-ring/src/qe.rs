//! Queue-entry (QE) layout shared by command words and consumer-queue entries.
//!
//! Every QE is 16 bytes, stored as two little-endian words:
//!
//! ```text
//! word0: [63 ........................................................ 0] payload
//! word1: [63..56 cmd][55..48 status][47..32 lock_id][31..29 rsvd]
//!        [28..26 priority][25..24 sched][23..16 qid][15..0 opaque]
//! ```
//!
//! `status` bit 0 is the generation bit on consumer entries, bits 1-2 the
//! queue depth level reported by the device. `cmd` is only meaningful on
//! producer command words.

/// Size in bytes of one queue entry.
pub const QE_SIZE: usize = 16;

/// Number of QEs moved per device transfer (one 64-byte line).
pub const QE_BATCH: usize = 4;

/// Command byte bits and the composite commands built from them.
pub mod cmd {
    pub const INT_ARM: u8 = 1 << 0;
    pub const CQ_TOKEN: u8 = 1 << 1;
    pub const QE_COMP: u8 = 1 << 2;
    pub const QE_FRAG: u8 = 1 << 3;
    pub const QE_VALID: u8 = 1 << 4;

    pub const NOOP: u8 = 0;
    pub const NEW: u8 = QE_VALID;
    pub const NEW_T: u8 = QE_VALID | CQ_TOKEN;
    pub const FWD: u8 = QE_VALID | QE_COMP;
    pub const FWD_T: u8 = QE_VALID | QE_COMP | CQ_TOKEN;
    pub const COMP: u8 = QE_COMP;
    pub const COMP_T: u8 = QE_COMP | CQ_TOKEN;
    /// Batch token return; the lock id carries `count - 1`.
    pub const BAT_T: u8 = CQ_TOKEN;
}

/// Scheduling discipline as encoded on the wire.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HwSchedType {
    #[default]
    Atomic = 0,
    Unordered = 1,
    Ordered = 2,
    Directed = 3,
}

impl HwSchedType {
    /// Decodes the two-bit wire value.
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => HwSchedType::Atomic,
            1 => HwSchedType::Unordered,
            2 => HwSchedType::Ordered,
            _ => HwSchedType::Directed,
        }
    }
}

/// One 16-byte queue entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Qe {
    pub payload: u64,
    pub opaque: u16,
    pub qid: u8,
    pub sched: HwSchedType,
    /// Three-bit device priority (0 is highest).
    pub priority: u8,
    pub lock_id: u16,
    pub status: u8,
    pub cmd: u8,
}

impl Qe {
    /// Pure token-return command handing `count` CQ slots back to the device.
    pub fn token_return(count: u16) -> Self {
        debug_assert!(count > 0, "token return of zero slots");
        Self {
            lock_id: count.saturating_sub(1),
            cmd: cmd::BAT_T,
            ..Self::default()
        }
    }

    /// Number of CQ tokens this command hands back.
    pub fn tokens_returned(&self) -> u32 {
        if self.cmd & cmd::CQ_TOKEN == 0 {
            0
        } else if self.cmd == cmd::BAT_T {
            u32::from(self.lock_id) + 1
        } else {
            1
        }
    }

    pub fn is_valid_event(&self) -> bool {
        self.cmd & cmd::QE_VALID != 0
    }

    pub fn is_completion(&self) -> bool {
        self.cmd & cmd::QE_COMP != 0
    }

    /// Generation bit carried by a consumer entry.
    pub fn gen_bit(&self) -> u8 {
        self.status & 1
    }

    /// Depth level the device attached to a consumer entry.
    pub fn depth_level(&self) -> u8 {
        (self.status >> 1) & 0x3
    }

    pub fn encode(&self) -> [u64; 2] {
        let word1 = u64::from(self.opaque)
            | u64::from(self.qid) << 16
            | u64::from(self.sched as u8) << 24
            | u64::from(self.priority & 0x7) << 26
            | u64::from(self.lock_id) << 32
            | u64::from(self.status) << 48
            | u64::from(self.cmd) << 56;
        [self.payload.to_le(), word1.to_le()]
    }

    pub fn decode(words: [u64; 2]) -> Self {
        let payload = u64::from_le(words[0]);
        let word1 = u64::from_le(words[1]);
        Self {
            payload,
            opaque: word1 as u16,
            qid: (word1 >> 16) as u8,
            sched: HwSchedType::from_bits((word1 >> 24) as u8),
            priority: ((word1 >> 26) & 0x7) as u8,
            lock_id: (word1 >> 32) as u16,
            status: (word1 >> 48) as u8,
            cmd: (word1 >> 56) as u8,
        }
    }
}
