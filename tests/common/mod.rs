//! Register-level simulated SD card for integration tests.
//!
//! The simulator sits behind the same four registers as the real core and
//! computes its own CRCs bit by bit, independent of the crate's tables.

#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
    sync::Once,
};

use log::{LevelFilter, Log, Metadata, Record};
use tssd_core::{
    CardSession, SdConfig, SdTimeouts,
    common::{RegisterTransport, SdPlatform, commands::DataBuffer},
    regs::{SdReg, SdState},
};

pub const RCA: u16 = 0x1234;
pub const SECTOR: usize = 512;

// Card status bits as the card reports them.
pub const OUT_OF_RANGE: u32 = 1 << 31;
pub const ADDRESS_ERROR: u32 = 1 << 30;
pub const WP_VIOLATION: u32 = 1 << 26;
pub const CARD_IS_LOCKED: u32 = 1 << 25;
pub const LOCK_UNLOCK_FAILED: u32 = 1 << 24;
pub const COM_CRC_ERROR: u32 = 1 << 23;
pub const ILLEGAL_COMMAND: u32 = 1 << 22;
pub const READY_FOR_DATA: u32 = 1 << 8;
pub const APP_CMD: u32 = 1 << 5;

const TOKEN_ACCEPTED: u8 = 0b010;
const TOKEN_CRC_ERROR: u8 = 0b101;
const TOKEN_WRITE_ERROR: u8 = 0b110;

struct TestLogger;

impl Log for TestLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        eprintln!("[{:5}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: TestLogger = TestLogger;

pub fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    });
}

pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        for i in (0..8).rev() {
            let bit = (byte >> i) & 1;
            let top = (crc >> 6) & 1;
            crc = (crc << 1) & 0x7f;
            if top ^ bit != 0 {
                crc ^= 0x09;
            }
        }
    }
    crc
}

pub fn crc16_bits(bits: impl Iterator<Item = u8>) -> u16 {
    let mut crc = 0u16;
    for bit in bits {
        let top = (crc >> 15) as u8;
        crc <<= 1;
        if top ^ (bit & 1) != 0 {
            crc ^= 0x1021;
        }
    }
    crc
}

/// DAT samples of a block followed by its CRC, as the data register moves
/// them: one bit per sample on a 1-bit bus, one nibble on a 4-bit bus.
pub fn encode_block(data: &[u8], wide: bool) -> Vec<u8> {
    let mut samples = Vec::new();
    if wide {
        for &byte in data {
            samples.push(byte >> 4);
            samples.push(byte & 0xf);
        }
        let lanes: [u16; 4] =
            std::array::from_fn(|line| crc16_bits(samples.iter().map(|s| (s >> line) & 1)));
        for k in 0..16 {
            let nibble = (0..4).fold(0u8, |acc, line| {
                acc | ((((lanes[line] >> (15 - k)) & 1) as u8) << line)
            });
            samples.push(nibble);
        }
    } else {
        for &byte in data {
            for i in (0..8).rev() {
                samples.push((byte >> i) & 1);
            }
        }
        let crc = crc16_bits(samples.iter().copied());
        for i in (0..16).rev() {
            samples.push(((crc >> i) & 1) as u8);
        }
    }
    samples
}

/// Data bytes of a received block, `None` when its CRC is wrong.
fn decode_block(samples: &[u8], len: usize, wide: bool) -> Option<Vec<u8>> {
    let data: Vec<u8> = if wide {
        samples[..len * 2]
            .chunks(2)
            .map(|pair| (pair[0] << 4) | pair[1])
            .collect()
    } else {
        samples[..len * 8]
            .chunks(8)
            .map(|bits| bits.iter().fold(0u8, |acc, b| (acc << 1) | b))
            .collect()
    };
    (encode_block(&data, wide) == samples).then_some(data)
}

pub fn set_bits(raw: &mut [u8; 16], msb: usize, lsb: usize, value: u32) {
    for (i, n) in (lsb..=msb).enumerate() {
        let mask = 1u8 << (n % 8);
        if (value >> i) & 1 != 0 {
            raw[15 - n / 8] |= mask;
        } else {
            raw[15 - n / 8] &= !mask;
        }
    }
}

pub fn seal(raw: &mut [u8; 16]) {
    raw[15] = (crc7(&raw[..15]) << 1) | 1;
}

pub fn csd_v1(c_size: u32, mult: u32, read_bl_len: u32) -> [u8; 16] {
    let mut raw = [0u8; 16];
    raw[1] = 0x26;
    raw[3] = 0x32;
    set_bits(&mut raw, 95, 84, 0x5f5);
    set_bits(&mut raw, 83, 80, read_bl_len);
    set_bits(&mut raw, 73, 62, c_size);
    set_bits(&mut raw, 49, 47, mult);
    set_bits(&mut raw, 46, 46, 1);
    set_bits(&mut raw, 25, 22, read_bl_len);
    set_bits(&mut raw, 14, 14, 1);
    seal(&mut raw);
    raw
}

pub fn csd_v2(c_size: u32) -> [u8; 16] {
    let mut raw = [0u8; 16];
    set_bits(&mut raw, 127, 126, 1);
    raw[1] = 0x0e;
    raw[3] = 0x32;
    set_bits(&mut raw, 95, 84, 0x5b5);
    set_bits(&mut raw, 83, 80, 9);
    set_bits(&mut raw, 69, 48, c_size);
    set_bits(&mut raw, 46, 46, 1);
    set_bits(&mut raw, 25, 22, 9);
    set_bits(&mut raw, 14, 14, 1);
    seal(&mut raw);
    raw
}

fn cid() -> [u8; 16] {
    let mut raw = [
        0x1d, b'A', b'D', b'S', b'I', b'M', b'S', b'D', 0x10, 0xca, 0xfe, 0xf0, 0x0d, 0x01,
        0x4a, 0,
    ];
    seal(&mut raw);
    raw
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    Idle = 0,
    Ready = 1,
    Ident = 2,
    Stby = 3,
    Tran = 4,
    Data = 5,
    Rcv = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cmd {
    pub index: u8,
    pub app: bool,
    pub arg: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxTarget {
    Sectors { next: u32, multi: bool },
    Csd,
    Lock,
}

pub struct SimCard {
    pub absent: bool,
    /// Never drives a response.
    pub silent: bool,
    /// Goes silent as soon as it sees CMD0.
    pub vanish_on_reset: bool,
    pub v1: bool,
    pub high_capacity: bool,
    pub wide_capable: bool,
    pub wp_switch: bool,
    pub dma: bool,
    pub sectors: u32,
    pub csd: [u8; 16],
    pub password: Option<Vec<u8>>,
    pub locked: bool,
    pub op_cond_rounds: u32,
    pub resp_latency: u32,
    /// Revision the platform reports for the SD core.
    pub core_version: Option<u32>,
    pub busy_reads: u32,
    /// Busy time after a CMD42 force erase.
    pub erase_busy_reads: u32,
    /// Flip a bit in this many upcoming read blocks.
    pub corrupt_reads: u32,
    /// Reject this many upcoming write blocks with a CRC error token.
    pub reject_writes: u32,
    /// Flip a bit in this many upcoming R1 responses.
    pub corrupt_responses: u32,

    pub storage: HashMap<u32, Vec<u8>>,
    pub commands: Vec<Cmd>,
    pub frames: Vec<[u8; 6]>,
    /// Index and status of every R1 sent.
    pub r1_log: Vec<(u8, u32)>,
    pub erase_counts: Vec<u32>,
    pub accesses: usize,
    pub go_idle: usize,
    pub delayed_us: u64,
    pub irq_waits: usize,
    pub dma_blocks: usize,
    pub dma_prepares: usize,

    control: u8,
    state: SimState,
    app_cmd: bool,
    rca: u16,
    op_cond_polls: u32,
    wide: bool,
    block_len: u32,
    cmd_in: Vec<u8>,
    resp: VecDeque<u8>,
    resp_wait: u32,
    data_out: VecDeque<u8>,
    read_next: Option<u32>,
    rx: Option<RxTarget>,
    rx_samples: Vec<u8>,
    token: Option<u8>,
    busy: u32,
    pending_errors: u32,
}

pub type Sim = Rc<RefCell<SimCard>>;

impl SimCard {
    fn with_csd(csd: [u8; 16], sectors: u32, v1: bool) -> Self {
        SimCard {
            absent: false,
            silent: false,
            vanish_on_reset: false,
            v1,
            high_capacity: !v1,
            wide_capable: true,
            wp_switch: false,
            dma: false,
            sectors,
            csd,
            password: None,
            locked: false,
            op_cond_rounds: 3,
            resp_latency: 0,
            core_version: None,
            busy_reads: 2,
            erase_busy_reads: 1000,
            corrupt_reads: 0,
            reject_writes: 0,
            corrupt_responses: 0,
            storage: HashMap::new(),
            commands: Vec::new(),
            frames: Vec::new(),
            r1_log: Vec::new(),
            erase_counts: Vec::new(),
            accesses: 0,
            go_idle: 0,
            delayed_us: 0,
            irq_waits: 0,
            dma_blocks: 0,
            dma_prepares: 0,
            control: 0,
            state: SimState::Idle,
            app_cmd: false,
            rca: 0,
            op_cond_polls: 0,
            wide: false,
            block_len: 512,
            cmd_in: Vec::new(),
            resp: VecDeque::new(),
            resp_wait: 0,
            data_out: VecDeque::new(),
            read_next: None,
            rx: None,
            rx_samples: Vec::new(),
            token: None,
            busy: 0,
            pending_errors: 0,
        }
    }

    /// High capacity card of `(c_size + 1) * 1024` sectors.
    pub fn sdhc(c_size: u32) -> Self {
        Self::with_csd(csd_v2(c_size), (c_size + 1) * 1024, false)
    }

    /// Version 1 standard capacity card.
    pub fn sdsc(c_size: u32, mult: u32, read_bl_len: u32) -> Self {
        let bytes = ((c_size as u64 + 1) << (mult + 2)) << read_bl_len;
        Self::with_csd(csd_v1(c_size, mult, read_bl_len), (bytes / 512) as u32, true)
    }

    /// The 1000-sector card: C_SIZE 124, C_SIZE_MULT 1, 512-byte blocks.
    pub fn sdsc_1000() -> Self {
        Self::sdsc(124, 1, 9)
    }

    pub fn into_sim(self) -> Sim {
        Rc::new(RefCell::new(self))
    }

    pub fn set_perm_wp(&mut self, enable: bool) {
        set_bits(&mut self.csd, 13, 13, enable as u32);
        seal(&mut self.csd);
    }

    pub fn set_tmp_wp(&mut self, enable: bool) {
        set_bits(&mut self.csd, 12, 12, enable as u32);
        seal(&mut self.csd);
    }

    pub fn tmp_wp(&self) -> bool {
        self.csd[14] & 0x10 != 0
    }

    pub fn is_wide(&self) -> bool {
        self.wide
    }

    /// Last value the host wrote to the control register.
    pub fn control(&self) -> u8 {
        self.control
    }

    pub fn count(&self, index: u8, app: bool) -> usize {
        self.commands
            .iter()
            .filter(|c| c.index == index && c.app == app)
            .count()
    }

    pub fn indices(&self) -> Vec<u8> {
        self.commands.iter().map(|c| c.index).collect()
    }

    pub fn sector(&self, sector: u32) -> Vec<u8> {
        self.storage
            .get(&sector)
            .cloned()
            .unwrap_or_else(|| vec![0; SECTOR])
    }

    fn read_state(&mut self) -> u8 {
        let mut state = 0x01;
        if !self.resp.is_empty() {
            if self.resp_wait > 0 {
                self.resp_wait -= 1;
            } else {
                state |= 0x02;
            }
        }
        if self.token.is_some() || !self.data_out.is_empty() || self.read_next.is_some() {
            state |= 0x04;
        }
        if self.busy > 0 {
            self.busy -= 1;
            state |= 0x08;
        }
        state
    }

    fn read_data(&mut self) -> u8 {
        if let Some(token) = self.token.take() {
            return token;
        }
        if self.data_out.is_empty() {
            if let Some(next) = self.read_next {
                self.queue_sector(next);
                self.read_next = (next + 1 < self.sectors).then_some(next + 1);
            }
        }
        self.data_out.pop_front().unwrap_or(0x0f)
    }

    fn write_data(&mut self, value: u8) {
        let Some(target) = self.rx else {
            return;
        };
        let mask = if self.wide { 0xf } else { 0x1 };
        self.rx_samples.push(value & mask);

        let len = match target {
            RxTarget::Sectors { .. } => SECTOR,
            RxTarget::Csd => 16,
            RxTarget::Lock => self.block_len as usize,
        };
        let per_block = if self.wide { len * 2 + 16 } else { len * 8 + 16 };
        if self.rx_samples.len() == per_block {
            let samples = std::mem::take(&mut self.rx_samples);
            self.receive_block(target, &samples, len);
        }
    }

    fn receive_block(&mut self, target: RxTarget, samples: &[u8], len: usize) {
        let data = decode_block(samples, len, self.wide);
        let single = !matches!(target, RxTarget::Sectors { multi: true, .. });

        let data = match data {
            Some(_) if self.reject_writes > 0 => {
                self.reject_writes -= 1;
                None
            }
            other => other,
        };
        let Some(data) = data else {
            self.token = Some(TOKEN_CRC_ERROR);
            if single {
                self.rx = None;
                self.state = SimState::Tran;
            }
            return;
        };

        self.token = Some(TOKEN_ACCEPTED);
        self.busy = self.busy_reads;
        match target {
            RxTarget::Sectors { next, multi } => {
                if next >= self.sectors {
                    self.token = Some(TOKEN_WRITE_ERROR);
                    return;
                }
                self.storage.insert(next, data);
                if multi {
                    self.rx = Some(RxTarget::Sectors {
                        next: next + 1,
                        multi,
                    });
                }
            }
            RxTarget::Csd => {
                self.csd[14] = (self.csd[14] & !0x10) | (data[14] & 0x10);
                seal(&mut self.csd);
            }
            RxTarget::Lock => self.lock_unlock(&data),
        }
        if single {
            self.rx = None;
            self.state = SimState::Tran;
        }
    }

    fn lock_unlock(&mut self, data: &[u8]) {
        let mode = data[0];
        if mode & 0x08 != 0 {
            self.storage.clear();
            self.password = None;
            self.locked = false;
            self.busy = self.erase_busy_reads;
            return;
        }

        let len = data.get(1).copied().unwrap_or(0) as usize;
        let Some(pwd) = data.get(2..2 + len) else {
            self.pending_errors |= LOCK_UNLOCK_FAILED;
            return;
        };
        let current = self.password.clone();
        let ok = match mode & 0x07 {
            0x01 => {
                let new = match &current {
                    Some(old) if pwd.starts_with(old) => pwd[old.len()..].to_vec(),
                    Some(_) => Vec::new(),
                    None => pwd.to_vec(),
                };
                if new.is_empty() {
                    false
                } else {
                    self.password = Some(new);
                    true
                }
            }
            0x02 if current.as_deref() == Some(pwd) => {
                self.password = None;
                self.locked = false;
                true
            }
            0x04 if current.as_deref() == Some(pwd) => {
                self.locked = true;
                true
            }
            0x00 if self.locked && current.as_deref() == Some(pwd) => {
                self.locked = false;
                true
            }
            _ => false,
        };
        if !ok {
            self.pending_errors |= LOCK_UNLOCK_FAILED;
        }
    }

    fn queue_sector(&mut self, sector: u32) {
        let data = self.sector(sector);
        let mut samples = encode_block(&data, self.wide);
        if self.corrupt_reads > 0 {
            self.corrupt_reads -= 1;
            samples[3] ^= 1;
        }
        self.data_out.extend(samples);
    }

    fn status(&mut self, extra: u32) -> u32 {
        let mut status = ((self.state as u32) << 9) | READY_FOR_DATA | extra;
        status |= std::mem::take(&mut self.pending_errors);
        if self.locked {
            status |= CARD_IS_LOCKED;
        }
        status
    }

    fn respond_r1(&mut self, index: u8, extra: u32) {
        let status = self.status(extra);
        self.r1_log.push((index, status));
        let status = status.to_be_bytes();
        let mut raw = [index, status[0], status[1], status[2], status[3], 0];
        raw[5] = (crc7(&raw[..5]) << 1) | 1;
        if self.corrupt_responses > 0 {
            self.corrupt_responses -= 1;
            raw[2] ^= 0x04;
        }
        self.resp.extend(raw);
    }

    fn respond_r2(&mut self, reg: [u8; 16]) {
        self.resp.push_back(0x3f);
        self.resp.extend(reg);
    }

    fn command(&mut self, frame: [u8; 6]) {
        if self.absent || self.silent {
            return;
        }
        if frame[0] & 0xc0 != 0x40 || (crc7(&frame[..5]) << 1) | 1 != frame[5] {
            self.pending_errors |= COM_CRC_ERROR;
            return;
        }

        let index = frame[0] & 0x3f;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let app = std::mem::take(&mut self.app_cmd);
        self.frames.push(frame);
        self.commands.push(Cmd { index, app, arg });
        self.resp.clear();
        self.resp_wait = self.resp_latency;
        let addressed = (arg >> 16) as u16 == self.rca && self.rca != 0;

        match (app, index) {
            (_, 0) => self.go_idle(),
            (false, 8) => {
                if self.v1 {
                    // Not a v1 command, reported in the next R1.
                    self.pending_errors |= ILLEGAL_COMMAND;
                } else {
                    let mut raw = [8, 0, 0, ((arg >> 8) & 0xf) as u8, arg as u8, 0];
                    raw[5] = (crc7(&raw[..5]) << 1) | 1;
                    self.resp.extend(raw);
                }
            }
            (_, 55) => {
                self.app_cmd = true;
                self.respond_r1(55, APP_CMD);
            }
            (true, 41) => {
                self.op_cond_polls += 1;
                let mut ocr = 0x00ff_8000;
                if self.op_cond_polls >= self.op_cond_rounds {
                    ocr |= 1 << 31;
                    if self.high_capacity && arg & (1 << 30) != 0 {
                        ocr |= 1 << 30;
                    }
                    self.state = SimState::Ready;
                }
                let ocr = u32::to_be_bytes(ocr);
                self.resp.extend([0x3f, ocr[0], ocr[1], ocr[2], ocr[3], 0xff]);
            }
            (false, 2) => {
                self.state = SimState::Ident;
                self.respond_r2(cid());
            }
            (false, 3) => {
                self.rca = RCA;
                let status = ((self.state as u16) << 9) | READY_FOR_DATA as u16;
                let mut raw = [
                    3,
                    (RCA >> 8) as u8,
                    RCA as u8,
                    (status >> 8) as u8,
                    status as u8,
                    0,
                ];
                raw[5] = (crc7(&raw[..5]) << 1) | 1;
                self.resp.extend(raw);
                self.state = SimState::Stby;
            }
            (false, 9) => {
                if addressed {
                    self.respond_r2(self.csd);
                }
            }
            (false, 7) => {
                if addressed {
                    self.respond_r1(7, 0);
                    self.state = SimState::Tran;
                    self.busy = self.busy_reads;
                } else if self.state == SimState::Tran {
                    self.state = SimState::Stby;
                }
            }
            (false, 13) => {
                if addressed {
                    self.respond_r1(13, 0);
                }
            }
            (false, 16) => {
                self.block_len = arg;
                self.respond_r1(16, 0);
            }
            (false, 12) => {
                self.data_out.clear();
                self.read_next = None;
                self.rx = None;
                self.rx_samples.clear();
                self.state = SimState::Tran;
                self.respond_r1(12, 0);
                self.busy = self.busy_reads;
            }
            (false, 17 | 18) => self.start_read(index, arg),
            (false, 24 | 25) => self.start_write(index, arg),
            (false, 27) => {
                self.respond_r1(27, 0);
                self.rx = Some(RxTarget::Csd);
                self.state = SimState::Rcv;
            }
            (false, 42) => {
                self.respond_r1(42, 0);
                self.rx = Some(RxTarget::Lock);
                self.state = SimState::Rcv;
            }
            (true, 6) => {
                self.wide = arg & 0b11 == 0b10;
                self.respond_r1(6, APP_CMD);
            }
            (true, 23) => {
                self.erase_counts.push(arg);
                self.respond_r1(23, APP_CMD);
            }
            (true, 42) => self.respond_r1(42, APP_CMD),
            (true, 51) => {
                self.respond_r1(51, APP_CMD);
                let widths = if self.wide_capable { 0x35 } else { 0x31 };
                let scr = [0x02, widths, 0x80, 0x00, 0, 0, 0, 0];
                let samples = encode_block(&scr, self.wide);
                self.data_out.extend(samples);
            }
            _ => self.respond_r1(index, ILLEGAL_COMMAND),
        }
    }

    fn go_idle(&mut self) {
        self.go_idle += 1;
        if self.vanish_on_reset {
            self.silent = true;
        }
        self.state = SimState::Idle;
        self.rca = 0;
        self.wide = false;
        self.op_cond_polls = 0;
        self.block_len = 512;
        self.data_out.clear();
        self.read_next = None;
        self.rx = None;
        self.rx_samples.clear();
        self.token = None;
        self.busy = 0;
    }

    fn address_to_sector(&mut self, index: u8, arg: u32) -> Option<u32> {
        if self.locked {
            self.respond_r1(index, ILLEGAL_COMMAND);
            return None;
        }
        let sector = if self.high_capacity {
            arg
        } else {
            if arg % SECTOR as u32 != 0 {
                self.respond_r1(index, ADDRESS_ERROR);
                return None;
            }
            arg / SECTOR as u32
        };
        if sector >= self.sectors {
            self.respond_r1(index, OUT_OF_RANGE);
            return None;
        }
        Some(sector)
    }

    fn start_read(&mut self, index: u8, arg: u32) {
        let Some(sector) = self.address_to_sector(index, arg) else {
            return;
        };
        self.respond_r1(index, 0);
        self.queue_sector(sector);
        if index == 18 {
            self.state = SimState::Data;
            self.read_next = (sector + 1 < self.sectors).then_some(sector + 1);
        }
    }

    fn start_write(&mut self, index: u8, arg: u32) {
        let Some(sector) = self.address_to_sector(index, arg) else {
            return;
        };
        if self.csd[14] & 0x30 != 0 {
            self.respond_r1(index, WP_VIOLATION);
            return;
        }
        self.respond_r1(index, 0);
        self.state = SimState::Rcv;
        self.rx = Some(RxTarget::Sectors {
            next: sector,
            multi: index == 25,
        });
    }

    fn read_reg(&mut self, reg: SdReg) -> u8 {
        self.accesses += 1;
        match reg {
            SdReg::Command => self.resp.pop_front().unwrap_or(0xff),
            SdReg::Data => self.read_data(),
            SdReg::State => self.read_state(),
            SdReg::Control => {
                let mut value = self.control;
                if self.absent {
                    value |= 0x08;
                }
                if self.wp_switch {
                    value |= 0x10;
                }
                value
            }
        }
    }

    fn write_reg(&mut self, reg: SdReg, value: u8) {
        self.accesses += 1;
        match reg {
            SdReg::Command => {
                self.cmd_in.push(value);
                if self.cmd_in.len() == 6 {
                    let mut frame = [0u8; 6];
                    frame.copy_from_slice(&self.cmd_in);
                    self.cmd_in.clear();
                    self.command(frame);
                }
            }
            SdReg::Data => self.write_data(value),
            SdReg::State => {}
            SdReg::Control => self.control = value & 0x63,
        }
    }
}

pub struct SimBus(pub Sim);

impl RegisterTransport for SimBus {
    fn read_reg(&mut self, reg: SdReg) -> u8 {
        self.0.borrow_mut().read_reg(reg)
    }

    fn write_reg(&mut self, reg: SdReg, value: u8) {
        self.0.borrow_mut().write_reg(reg, value)
    }
}

pub struct SimPlatform(pub Sim);

impl SdPlatform for SimPlatform {
    fn delay_us(&mut self, us: u32) {
        self.0.borrow_mut().delayed_us += us as u64;
    }

    fn irq_wait(&mut self, us: u32) {
        let mut sim = self.0.borrow_mut();
        sim.irq_waits += 1;
        sim.delayed_us += us as u64;
    }

    fn has_dma(&self) -> bool {
        self.0.borrow().dma
    }

    fn core_version(&self) -> Option<u32> {
        self.0.borrow().core_version
    }

    fn dma_prepare(&mut self, _buf: &[u8]) {
        self.0.borrow_mut().dma_prepares += 1;
    }

    fn dma_stream(&mut self, state: SdState, data: DataBuffer<'_>) -> bool {
        let mut sim = self.0.borrow_mut();
        let wide = state.contains(SdState::WIDE_BUS);
        match data {
            DataBuffer::Read(buf) => {
                for byte in buf.iter_mut() {
                    *byte = if wide {
                        let hi = sim.read_data() & 0xf;
                        (hi << 4) | (sim.read_data() & 0xf)
                    } else {
                        (0..8).fold(0u8, |acc, _| (acc << 1) | (sim.read_data() & 1))
                    };
                }
            }
            DataBuffer::Write(buf) => {
                for &byte in buf {
                    if wide {
                        sim.write_data(byte >> 4);
                        sim.write_data(byte & 0xf);
                    } else {
                        for bit in (0..8).rev() {
                            sim.write_data((byte >> bit) & 1);
                        }
                    }
                }
            }
        }
        sim.dma_blocks += 1;
        true
    }
}

pub type SimSession = CardSession<SimBus, SimPlatform>;

pub fn test_timeouts() -> SdTimeouts {
    SdTimeouts {
        poll_delay_us: 1,
        command_polls: 50,
        data_polls: 200,
        busy_polls: 200,
        erase_polls: 5000,
        op_cond_attempts: 20,
        op_cond_delay_us: 10,
    }
}

pub fn session(sim: &Sim, config: SdConfig) -> SimSession {
    init_logger();
    CardSession::new(
        SimBus(sim.clone()),
        SimPlatform(sim.clone()),
        config.with_timeouts(test_timeouts()),
    )
}

/// A session that went through a successful reset.
pub fn ready(sim: &Sim, config: SdConfig) -> SimSession {
    let mut card = session(sim, config);
    let sectors = card.reset().expect("reset");
    assert_eq!(sectors, sim.borrow().sectors);
    card
}

/// Distinct content per sector and offset.
pub fn pattern(first: u32, count: u32) -> Vec<u8> {
    (0..count as usize * SECTOR)
        .map(|i| {
            let sector = first as usize + i / SECTOR;
            (i as u8) ^ (sector as u8).wrapping_mul(31) ^ 0x5a
        })
        .collect()
}
