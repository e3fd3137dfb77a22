//! Inventory session state and the register sequences that drive it.
//!
//! Nothing here talks to the reader: every operation updates the session
//! state and returns the RFID commands to enqueue, in order.

use log::{debug, info};

use crate::protocol::{RegisterRequest, RfidCommand};
use crate::registers::*;
use crate::types::{
    Gen2MemoryBank, InventoryTarget, PaddedEpc, QAlgorithm, ReaderError, RfidParameters,
    parse_access_password,
};

/// Word address of the PC in the EPC bank (word 0 holds the stored CRC)
pub const EPC_PC_WORD: u8 = 1;

/// Inventory and write settings currently applied (or about to be)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Output power in 0.1 dBm
    pub output_power: i32,
    pub q_algorithm: QAlgorithm,
    pub session: u8,
    pub target: InventoryTarget,
    /// Padded EPC used as the select mask; empty for no filter
    pub tag_to_seek: String,
    pub compact_mode: bool,
    pub read_one: bool,
    pub seek_mode: bool,
    pub write_pending: bool,
    pub reader_on: bool,
}

/// Arguments of an EPC bank write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BurnRequest {
    /// New PC word, 4 hex digits
    pub pc: String,
    /// New EPC, hex, whole words
    pub epc: String,
    /// Word address of the first written word
    pub start_address: u8,
    /// EPC of the tag to write; empty writes to whichever tag answers
    pub tag_filter: String,
    /// Hex access password; empty for none
    pub access_password: String,
}

impl BurnRequest {
    /// Write `epc` (and a PC word matching its length) to the EPC bank
    pub fn epc(epc: &str, tag_filter: &str, access_password: &str) -> Result<Self, ReaderError> {
        let padded = PaddedEpc::from_hex(epc)?;
        Ok(Self {
            pc: padded.pc,
            epc: padded.epc,
            start_address: EPC_PC_WORD,
            tag_filter: tag_filter.to_string(),
            access_password: access_password.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct InventorySession {
    config: SessionConfig,
    link_profile: Option<u32>,
    /// Mask last written to the TAGMSK registers
    last_tag_filter: String,
}

fn write(address: u16, data: u32) -> RfidCommand {
    RegisterRequest::write(address, data).into()
}

fn write_raw(address: u16, data: u32) -> RfidCommand {
    RegisterRequest::write_raw(address, data).into()
}

fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, ReaderError> {
    if hex.len() % 2 != 0 {
        return Err(ReaderError::InvalidParameter(format!(
            "odd number of hex digits: {hex:?}"
        )));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| ReaderError::InvalidParameter(format!("{hex:?}: {e}")))
        })
        .collect()
}

/// Select mask covering `epc` (already padded), starting after the PC word
fn mask_commands(epc: &str) -> Result<Vec<RfidCommand>, ReaderError> {
    let bytes = hex_to_bytes(epc)?;
    let mut commands = vec![
        write(TAGMSK_DESC_CFG, TAGMSK_ENABLE | TAGMSK_TARGET_SL),
        write(TAGMSK_BANK, Gen2MemoryBank::Epc as u32),
        write(TAGMSK_PTR, TAGMSK_EPC_POINTER),
        write(TAGMSK_LEN, bytes.len() as u32 * 8),
    ];
    // 32-bit mask registers, last one zero padded on the right
    for (index, chunk) in bytes.chunks(4).enumerate() {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        commands.push(write_raw(TAGMSK_0_3 + index as u16, u32::from_be_bytes(word)));
    }
    Ok(commands)
}

fn clear_mask_commands() -> Vec<RfidCommand> {
    let mut commands = vec![
        write(TAGMSK_DESC_CFG, TAGMSK_DISABLE),
        write(TAGMSK_PTR, 0),
        write(TAGMSK_LEN, 0),
    ];
    commands.extend((0..TAGMSK_REGISTER_COUNT).map(|i| write(TAGMSK_0_3 + i, 0)));
    commands
}

impl InventorySession {
    pub fn new(output_power: i32) -> Self {
        let defaults = RfidParameters::default();
        Self {
            config: SessionConfig {
                output_power,
                q_algorithm: defaults.q_algorithm,
                session: defaults.session,
                target: defaults.target,
                tag_to_seek: String::new(),
                compact_mode: false,
                read_one: false,
                seek_mode: false,
                write_pending: false,
                reader_on: false,
            },
            link_profile: None,
            last_tag_filter: String::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_reader_on(&mut self, on: bool) {
        self.config.reader_on = on;
    }

    /// Link profile, antenna cycles, query and inventory algorithm settings
    pub fn configure(&mut self, params: RfidParameters) -> Vec<RfidCommand> {
        let mut commands = Vec::new();

        if self.link_profile != Some(PROFILE_LONGEST_RANGE) {
            self.link_profile = Some(PROFILE_LONGEST_RANGE);
            commands.push(write(CURRENT_PROFILE, PROFILE_LONGEST_RANGE));
            commands.push(write(HST_CMD, CMD_CHANGE_LINK_PROFILE));
        }

        let cycles = if self.config.read_one {
            1
        } else {
            ANT_CYCLES_CONTINUOUS
        };
        commands.push(write(ANT_CYCLES, cycles));

        self.config.session = params.session.min(3);
        self.config.target = params.target;
        self.config.q_algorithm = params.q_algorithm;
        commands.push(write(QUERY_CFG, self.query_config()));

        self.config.compact_mode = true;
        commands.push(write(INV_CFG, self.inventory_config()));
        commands.extend(self.algorithm_params(u32::from(params.q)));

        debug!("Configured inventory: {:?}", self.config);
        commands
    }

    fn algorithm(&self) -> u32 {
        match self.config.q_algorithm {
            QAlgorithm::Fixed => FIXED_Q,
            QAlgorithm::Dynamic => DYNAMIC_Q,
        }
    }

    fn filtering(&self) -> bool {
        !self.config.tag_to_seek.is_empty() || self.config.seek_mode
    }

    pub fn query_config(&self) -> u32 {
        let target = match self.config.target {
            InventoryTarget::A => 0,
            InventoryTarget::B => 1,
        };
        let select = if self.filtering() { 0x03 } else { 0x00 };
        (target << 4) | (u32::from(self.config.session) << 5) | (select << 7)
    }

    pub fn inventory_config(&self) -> u32 {
        let c = &self.config;
        let tag_delay = if c.compact_mode { 0 } else { u32::from(TAG_DELAY) };
        let tag_select = c.seek_mode || c.write_pending;
        let match_rep = if c.write_pending || c.read_one { 1 } else { 0 };
        let qt_mode = false;
        let crc_err_read = false;
        let disable_inventory = false;

        (u32::from(c.compact_mode) << 26)
            | (tag_delay << 20)
            | (u32::from(qt_mode) << 19)
            | (u32::from(crc_err_read) << 18)
            | (u32::from(TAG_READ_NO_BANKS) << 16)
            | (u32::from(disable_inventory) << 15)
            | (u32::from(tag_select) << 14)
            | (match_rep << 6)
            | self.algorithm().min(3)
    }

    fn algorithm_params(&self, start_q: u32) -> Vec<RfidCommand> {
        let algorithm = self.algorithm();
        let (min_q, max_q, threshold_mult) = (0u32, 15u32, 2u32);
        let param0 = if algorithm == FIXED_Q {
            start_q.min(15)
        } else {
            start_q.min(15) | (max_q.min(15) << 4) | (min_q.min(15) << 8) | (threshold_mult.min(63) << 12)
        };
        let retry_count = 0;
        let toggle_target = !self.config.tag_to_seek.is_empty() && !self.config.write_pending;
        let run_till_zero = false;
        let param2 = u32::from(toggle_target) | (u32::from(run_till_zero) << 1);

        vec![
            write(INV_SEL, algorithm.min(3)),
            write(INV_ALG_PARM_0, param0),
            write(INV_ALG_PARM_1, retry_count),
            write(INV_ALG_PARM_2, param2),
        ]
    }

    /// Program (or clear) the select mask; registers are only rewritten when
    /// the filter changes
    pub fn tag_filter(&mut self, filter: &str) -> Result<Vec<RfidCommand>, ReaderError> {
        let filter = if filter.is_empty() {
            String::new()
        } else {
            PaddedEpc::from_hex(filter)?.epc
        };

        let mut commands = vec![write(TAGMSK_DESC_SEL, 0)];
        if filter != self.last_tag_filter {
            if filter.is_empty() {
                commands.extend(clear_mask_commands());
            } else {
                commands.extend(mask_commands(&filter)?);
            }
        }
        self.last_tag_filter = filter;
        Ok(commands)
    }

    pub fn start_inventory(&mut self) -> Result<Vec<RfidCommand>, ReaderError> {
        self.config.compact_mode = true;
        self.config.write_pending = false;
        let filter = if self.config.seek_mode || self.config.read_one {
            self.config.tag_to_seek.clone()
        } else {
            String::new()
        };
        let mut commands = self.tag_filter(&filter)?;
        self.config.reader_on = true;
        commands.push(write(HST_CMD, CMD_START_INVENTORY));
        Ok(commands)
    }

    /// Abort anything running; the abort is always sent twice
    pub fn abort(&mut self) -> Vec<RfidCommand> {
        self.config.reader_on = false;
        vec![RfidCommand::Abort, RfidCommand::Abort]
    }

    pub fn stop_inventory(&mut self) -> Vec<RfidCommand> {
        let commands = self.abort();
        self.config.compact_mode = false;
        commands
    }

    /// Inventory until the first tag (optionally matching `filter`) is read
    pub fn read_one(&mut self, filter: &str) -> Result<Vec<RfidCommand>, ReaderError> {
        self.config.read_one = true;
        self.config.write_pending = false;
        self.config.seek_mode = false;
        self.config.tag_to_seek = if filter.is_empty() {
            String::new()
        } else {
            PaddedEpc::from_hex(filter)?.epc
        };

        // No verify, no retries
        let mut commands = vec![write(TAGACC_DESC_CFG, 0)];
        commands.extend(self.start_inventory()?);
        Ok(commands)
    }

    /// Clears read-one mode; true if it was set
    pub fn take_read_one(&mut self) -> bool {
        std::mem::take(&mut self.config.read_one)
    }

    /// Arm (or disarm with an empty filter) seek mode for the next inventory
    pub fn seek(&mut self, filter: &str, max_power: i32) -> Result<(), ReaderError> {
        if filter.is_empty() {
            self.config.seek_mode = false;
            self.config.tag_to_seek.clear();
        } else {
            self.config.tag_to_seek = PaddedEpc::from_hex(filter)?.epc;
            self.config.seek_mode = true;
            self.config.output_power = max_power;
        }
        Ok(())
    }

    /// `power` in 0.1 dBm, already limited
    pub fn set_power(&mut self, power: i32) -> Vec<RfidCommand> {
        self.config.output_power = power;
        vec![
            write(ANT_PORT_POWER, power.max(0) as u32),
            write(ANT_PORT_DWELL, 0),
        ]
    }

    /// Everything up to (not including) the final HST_CMD WRITE
    pub fn burn(&mut self, request: &BurnRequest) -> Result<Vec<RfidCommand>, ReaderError> {
        if request.epc.is_empty() {
            return Err(ReaderError::InvalidParameter(
                "refusing to write an empty EPC".into(),
            ));
        }
        let password = parse_access_password(&request.access_password)?;
        let data = hex_to_bytes(&format!("{}{}", request.pc, request.epc))?;
        if data.len() % 2 != 0 {
            return Err(ReaderError::InvalidParameter(
                "PC and EPC must be whole 16-bit words".into(),
            ));
        }
        let filter = if request.tag_filter.is_empty() {
            String::new()
        } else {
            PaddedEpc::from_hex(&request.tag_filter)?.epc
        };

        let mut commands = vec![
            write(ANT_CYCLES, 1),
            write(QUERY_CFG, if filter.is_empty() { 0 } else { 0x180 }),
            write(INV_SEL, 0),
            write(INV_ALG_PARM_0, 0),
            write(INV_ALG_PARM_2, 0),
        ];

        if filter.is_empty() {
            commands.push(write(TAGMSK_DESC_CFG, TAGMSK_DISABLE));
        } else {
            commands.extend(mask_commands(&filter)?);
        }

        // Select before write when a filter is given; stop after one tag
        commands.push(write(INV_CFG, if filter.is_empty() { 0x40 } else { 0x4040 }));

        let words = data.len() / 2;
        commands.extend([
            write(TAGACC_DESC_CFG, TAGACC_VERIFY_WITH_RETRIES),
            write(TAGACC_BANK, Gen2MemoryBank::Epc as u32),
            write(TAGACC_PTR, 0),
            write(TAGACC_CNT, words as u32),
            write(TAGACC_ACCPWD, password),
        ]);

        // Each data register holds the byte-swapped word and its word offset
        for (index, word) in data.chunks(2).enumerate() {
            let value = u16::from_be_bytes([word[0], word[1]]).swap_bytes();
            let offset = (u32::from(request.start_address) + index as u32) & 0xFF;
            commands.push(write_raw(
                TAGWRDAT_0 + index as u16,
                (u32::from(value) << 16) | (offset << 8),
            ));
        }

        self.config.write_pending = true;
        self.last_tag_filter = filter;
        info!("Prepared write of {} words", words);
        Ok(commands)
    }

    pub fn write_command() -> RfidCommand {
        write(HST_CMD, CMD_WRITE)
    }

    /// Soft reset; forgets everything the reader was told
    pub fn reset(&mut self) -> Vec<RfidCommand> {
        self.config.reader_on = false;
        self.config.seek_mode = false;
        self.config.write_pending = false;
        self.config.read_one = false;
        self.config.tag_to_seek.clear();
        self.link_profile = None;
        self.last_tag_filter.clear();
        vec![RfidCommand::Reset]
    }
}
