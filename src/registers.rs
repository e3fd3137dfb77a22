//! RFID module register map and host command codes.
//!
//! Addresses are given in natural order; [`RegisterRequest`](crate::protocol::RegisterRequest)
//! takes care of the byte swap the firmware expects on the wire.

pub const FIRMWARE_VER: u16 = 0x0000;

pub const ANT_CYCLES: u16 = 0x0700;
pub const ANT_PORT_DWELL: u16 = 0x0705;
pub const ANT_PORT_POWER: u16 = 0x0706;

pub const TAGMSK_DESC_SEL: u16 = 0x0800;
pub const TAGMSK_DESC_CFG: u16 = 0x0801;
pub const TAGMSK_BANK: u16 = 0x0802;
pub const TAGMSK_PTR: u16 = 0x0803;
pub const TAGMSK_LEN: u16 = 0x0804;
/// First of the eight 32-bit mask registers
pub const TAGMSK_0_3: u16 = 0x0805;
pub const TAGMSK_REGISTER_COUNT: u16 = 8;

pub const QUERY_CFG: u16 = 0x0900;
pub const INV_CFG: u16 = 0x0901;
pub const INV_SEL: u16 = 0x0902;
pub const INV_ALG_PARM_0: u16 = 0x0903;
pub const INV_ALG_PARM_1: u16 = 0x0904;
pub const INV_ALG_PARM_2: u16 = 0x0905;

pub const TAGACC_DESC_CFG: u16 = 0x0A01;
pub const TAGACC_BANK: u16 = 0x0A02;
pub const TAGACC_PTR: u16 = 0x0A03;
pub const TAGACC_CNT: u16 = 0x0A04;
pub const TAGACC_ACCPWD: u16 = 0x0A06;
/// First of the tag write data registers
pub const TAGWRDAT_0: u16 = 0x0A09;

pub const CURRENT_PROFILE: u16 = 0x0B60;

pub const HST_CMD: u16 = 0xF000;

// HST_CMD values
pub const CMD_START_INVENTORY: u32 = 0x0F;
pub const CMD_WRITE: u32 = 0x11;
pub const CMD_CHANGE_LINK_PROFILE: u32 = 0x19;

// Link profiles
pub const PROFILE_LONGEST_RANGE: u32 = 1;

// INV_SEL algorithms
pub const FIXED_Q: u32 = 0;
pub const DYNAMIC_Q: u32 = 3;

/// ANT_CYCLES value meaning "run until aborted"
pub const ANT_CYCLES_CONTINUOUS: u32 = 0xFFFF;

// TAGMSK_DESC_CFG bits
pub const TAGMSK_DISABLE: u32 = 0x00;
pub const TAGMSK_ENABLE: u32 = 0x01;
pub const TAGMSK_TARGET_SL: u32 = 0x04 << 1;

/// Mask pointer in bits: skips the stored CRC and PC words of the EPC bank
pub const TAGMSK_EPC_POINTER: u32 = 0x20;

/// TAGACC_DESC_CFG: verify enabled, retry count 7
pub const TAGACC_VERIFY_WITH_RETRIES: u32 = 0x0F;

pub const TAG_DELAY: u8 = 30;
pub const TAG_READ_NO_BANKS: u8 = 0;
