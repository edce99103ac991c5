//! GDB Remote Serial Protocol server.
//!
//! One TCP client at a time. Packets are framed `$<payload>#<2-hex-csum>`
//! with `}`-escaping; the framing is parsed by an explicit state machine so
//! escaped `#`/`$` bytes inside binary payloads cannot terminate a packet.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

use tracing::{debug, info, warn};

use crate::core::cpu::instruction::TRAP_INSN;
use crate::core::emu::Simulator;
use crate::core::except::Except;
use crate::core::spr::*;

/// GPR0..31, PPC, NPC, SR.
pub const NUM_REGS: usize = 35;
pub const PPC_REGNUM: usize = 32;
pub const NPC_REGNUM: usize = 33;
pub const SR_REGNUM: usize = 34;

pub const GDB_BUF_MAX: usize = NUM_REGS * 8 + 1;

/// The single thread of control we report to the client.
pub const RSP_TID: u32 = 1;

/* GDB target signal numbers */
pub const SIGNAL_NONE: u32 = 0;
pub const SIGNAL_INT: u32 = 2;
pub const SIGNAL_ILL: u32 = 4;
pub const SIGNAL_TRAP: u32 = 5;
pub const SIGNAL_FPE: u32 = 8;
pub const SIGNAL_BUS: u32 = 10;
pub const SIGNAL_SEGV: u32 = 11;
pub const SIGNAL_ALRM: u32 = 14;
pub const SIGNAL_USR2: u32 = 31;
pub const SIGNAL_PWR: u32 = 32;

const HEXCHARS: &[u8; 16] = b"0123456789abcdef";

/// Matchpoint kinds, numbered as in `Z`/`z` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MpType {
    BpMemory,
    BpHardware,
    WpWrite,
    WpRead,
    WpAccess,
}

impl MpType {
    fn from_digit(d: u32) -> Option<Self> {
        match d {
            0 => Some(MpType::BpMemory),
            1 => Some(MpType::BpHardware),
            2 => Some(MpType::WpWrite),
            3 => Some(MpType::WpRead),
            4 => Some(MpType::WpAccess),
            _ => None,
        }
    }
}

/* ---------------------------------------------------------------------- */
/* Packet framing                                                          */
/* ---------------------------------------------------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Idle,
    Payload,
    PayloadEscape,
    CsumHi,
    CsumLo,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParserEvent {
    /// A complete, checksum-verified packet (payload still escaped).
    Packet(Vec<u8>),
    /// Framing completed but the checksum failed; a '-' should go back.
    BadChecksum,
    /// A break-in character (0x03) outside any packet.
    BreakIn,
}

/// Incremental packet reassembly over the byte stream.
pub struct PacketParser {
    state: ParseState,
    payload: Vec<u8>,
    csum: u8,
    xmit_hi: u8,
}

impl PacketParser {
    pub fn new() -> Self {
        PacketParser {
            state: ParseState::Idle,
            payload: Vec::new(),
            csum: 0,
            xmit_hi: 0,
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<ParserEvent> {
        match self.state {
            ParseState::Idle => match byte {
                b'$' => {
                    self.payload.clear();
                    self.csum = 0;
                    self.state = ParseState::Payload;
                    None
                }
                0x03 => Some(ParserEvent::BreakIn),
                _ => None,
            },
            ParseState::Payload => match byte {
                b'$' => {
                    // restart mid-packet
                    self.payload.clear();
                    self.csum = 0;
                    None
                }
                b'#' => {
                    self.state = ParseState::CsumHi;
                    None
                }
                b'}' => {
                    self.csum = self.csum.wrapping_add(byte);
                    self.payload.push(byte);
                    self.state = ParseState::PayloadEscape;
                    None
                }
                _ => {
                    self.csum = self.csum.wrapping_add(byte);
                    self.payload.push(byte);
                    if self.payload.len() >= GDB_BUF_MAX {
                        warn!("RSP packet overran buffer");
                        self.state = ParseState::Idle;
                    }
                    None
                }
            },
            ParseState::PayloadEscape => {
                self.csum = self.csum.wrapping_add(byte);
                self.payload.push(byte);
                self.state = ParseState::Payload;
                None
            }
            ParseState::CsumHi => {
                self.xmit_hi = byte;
                self.state = ParseState::CsumLo;
                None
            }
            ParseState::CsumLo => {
                self.state = ParseState::Idle;
                let xmit = (hex(self.xmit_hi) << 4) | hex(byte);
                if xmit as u8 == self.csum {
                    Some(ParserEvent::Packet(std::mem::take(&mut self.payload)))
                } else {
                    warn!(
                        "bad RSP checksum: computed 0x{:02x}, received 0x{:02x}",
                        self.csum, xmit
                    );
                    Some(ParserEvent::BadChecksum)
                }
            }
        }
    }
}

/// Frame a payload: `$`, escaped body, `#`, checksum.
pub fn serialise_packet(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    let mut csum: u8 = 0;
    out.push(b'$');
    for &b in payload {
        if b == b'$' || b == b'#' || b == b'*' || b == b'}' {
            csum = csum.wrapping_add(b'}');
            out.push(b'}');
            let e = b ^ 0x20;
            csum = csum.wrapping_add(e);
            out.push(e);
        } else {
            csum = csum.wrapping_add(b);
            out.push(b);
        }
    }
    out.push(b'#');
    out.push(HEXCHARS[(csum >> 4) as usize]);
    out.push(HEXCHARS[(csum & 0xf) as usize]);
    out
}

/// Reverse the `}`-escaping in place; returns the unescaped payload.
pub fn rsp_unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'}' && i + 1 < data.len() {
            out.push(data[i + 1] ^ 0x20);
            i += 2;
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

fn hex(c: u8) -> u32 {
    match c {
        b'0'..=b'9' => (c - b'0') as u32,
        b'a'..=b'f' => (c - b'a') as u32 + 10,
        b'A'..=b'F' => (c - b'A') as u32 + 10,
        _ => 0xffff_ffff,
    }
}

fn reg2hex(val: u32) -> String {
    format!("{val:08x}")
}

fn hex2reg(buf: &[u8]) -> u32 {
    buf.iter().take(8).fold(0, |acc, &c| (acc << 4) | (hex(c) & 0xf))
}

fn hex2ascii(src: &[u8]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i + 1 < src.len() {
        let byte = (((hex(src[i]) & 0xf) << 4) | (hex(src[i + 1]) & 0xf)) as u8;
        if byte == 0 {
            break;
        }
        out.push(byte as char);
        i += 2;
    }
    out
}

fn ascii2hex(src: &str) -> String {
    let mut out = String::new();
    for b in src.bytes() {
        out.push(HEXCHARS[(b >> 4) as usize] as char);
        out.push(HEXCHARS[(b & 0xf) as usize] as char);
    }
    out
}

/// Parse a hex number from the front of `s`, returning it and the rest.
fn take_hex(s: &[u8]) -> (u32, &[u8]) {
    let mut v = 0u32;
    let mut i = 0;
    while i < s.len() && hex(s[i]) != 0xffff_ffff {
        v = (v << 4) | hex(s[i]);
        i += 1;
    }
    (v, &s[i..])
}

/* ---------------------------------------------------------------------- */
/* Server state                                                            */
/* ---------------------------------------------------------------------- */

pub struct RspServer {
    listener: Option<TcpListener>,
    client: Option<TcpStream>,
    parser: PacketParser,
    /// The client awaits a stop reply from a step/continue.
    pub client_waiting: bool,
    /// GDB signal number of the last reported exception.
    pub sigval: u32,
    /// Entry point used by vRun/R restart requests.
    pub start_addr: u32,
    /// Memory breakpoints: (type, address) -> replaced instruction word.
    mp_hash: HashMap<(MpType, u32), u32>,
    pub port: u16,
}

impl RspServer {
    pub fn new(port: u16) -> Self {
        RspServer {
            listener: None,
            client: None,
            parser: PacketParser::new(),
            client_waiting: false,
            sigval: SIGNAL_NONE,
            start_addr: Except::Reset.vector(),
            mp_hash: HashMap::new(),
            port,
        }
    }

    pub fn mp_hash_add(&mut self, ty: MpType, addr: u32, instr: u32) {
        // a duplicate insertion (lost packet) keeps the original word
        self.mp_hash.entry((ty, addr)).or_insert(instr);
    }

    pub fn mp_hash_lookup(&self, ty: MpType, addr: u32) -> Option<u32> {
        self.mp_hash.get(&(ty, addr)).copied()
    }

    pub fn mp_hash_delete(&mut self, ty: MpType, addr: u32) -> Option<u32> {
        self.mp_hash.remove(&(ty, addr))
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Bind the listener on an ephemeral loopback port ahead of
    /// `get_client`, so a test client knows where to connect.
    #[cfg(test)]
    pub(crate) fn listen_for_test(&mut self) -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        self.listener = Some(listener);
        self.port = port;
        port
    }

    /// Block until a GDB client connects.
    fn get_client(&mut self) -> bool {
        if self.listener.is_none() {
            match TcpListener::bind(("0.0.0.0", self.port)) {
                Ok(l) => {
                    println!("Listening for RSP on port {}", self.port);
                    self.listener = Some(l);
                }
                Err(e) => {
                    warn!("cannot bind RSP socket on port {}: {e}", self.port);
                    return false;
                }
            }
        }
        match self.listener.as_ref().unwrap().accept() {
            Ok((stream, peer)) => {
                println!("Remote debugging from host {}", peer.ip());
                let _ = stream.set_nodelay(true);
                self.client = Some(stream);
                self.parser = PacketParser::new();
                true
            }
            Err(e) => {
                warn!("failed to accept RSP client: {e}");
                false
            }
        }
    }

    pub fn client_close(&mut self) {
        self.client = None;
    }

    /// Blocking single byte read; None on EOF or error (client closed).
    fn get_rsp_char(&mut self) -> Option<u8> {
        let stream = self.client.as_mut()?;
        let mut byte = [0u8; 1];
        loop {
            match stream.read(&mut byte) {
                Ok(0) => {
                    self.client_close();
                    return None;
                }
                Ok(_) => return Some(byte[0]),
                Err(e) if e.kind() == ErrorKind::Interrupted || e.kind() == ErrorKind::WouldBlock => {
                    continue
                }
                Err(e) => {
                    warn!("failed to read from RSP client: {e}");
                    self.client_close();
                    return None;
                }
            }
        }
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> bool {
        let Some(stream) = self.client.as_mut() else {
            return false;
        };
        match stream.write_all(bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to write to RSP client: {e}");
                self.client_close();
                false
            }
        }
    }

    /// Read one well-formed packet, acking each frame. None when the
    /// connection died.
    fn get_packet(&mut self) -> Option<Vec<u8>> {
        loop {
            let byte = self.get_rsp_char()?;
            match self.parser.push(byte) {
                Some(ParserEvent::Packet(p)) => {
                    self.put_bytes(b"+");
                    return Some(p);
                }
                Some(ParserEvent::BadChecksum) => {
                    self.put_bytes(b"-");
                }
                Some(ParserEvent::BreakIn) | None => (),
            }
        }
    }

    /// Send a packet, retrying until the client acks it.
    fn put_packet(&mut self, payload: &[u8]) {
        let framed = serialise_packet(payload);
        loop {
            if !self.put_bytes(&framed) {
                return;
            }
            match self.get_rsp_char() {
                Some(b'+') => return,
                Some(_) => continue,
                None => return,
            }
        }
    }

    fn put_str_packet(&mut self, s: &str) {
        self.put_packet(s.as_bytes());
    }

    /// Non-blocking look for a break-in (0x03) or connection drop while the
    /// target is running.
    fn poll_break_in(&mut self) -> bool {
        let Some(stream) = self.client.as_mut() else {
            return false;
        };
        let _ = stream.set_nonblocking(true);
        let mut byte = [0u8; 1];
        let hit = match stream.read(&mut byte) {
            Ok(0) => {
                let _ = stream.set_nonblocking(false);
                self.client_close();
                return false;
            }
            Ok(_) => matches!(self.parser.push(byte[0]), Some(ParserEvent::BreakIn)),
            Err(_) => false,
        };
        if let Some(stream) = self.client.as_mut() {
            let _ = stream.set_nonblocking(false);
        }
        hit
    }
}

/* ---------------------------------------------------------------------- */
/* Protocol handling against the simulator                                 */
/* ---------------------------------------------------------------------- */

impl Simulator {
    /// Record an exception for later reporting to the client, in GDB signal
    /// numbering.
    pub fn rsp_exception(&mut self, ex: Except) {
        let sigval = match ex {
            Except::Reset => SIGNAL_PWR,
            Except::BusErr(_) => SIGNAL_BUS,
            Except::DPageFault(_) | Except::IPageFault(_) => SIGNAL_SEGV,
            Except::Tick => SIGNAL_ALRM,
            Except::Align(_) => SIGNAL_BUS,
            Except::Illegal(_) => SIGNAL_ILL,
            Except::Interrupt => SIGNAL_INT,
            Except::DTlbMiss(_) | Except::ITlbMiss(_) => SIGNAL_SEGV,
            Except::Range => SIGNAL_FPE,
            Except::Syscall => SIGNAL_USR2,
            Except::FloatingPoint => SIGNAL_FPE,
            Except::Trap => SIGNAL_TRAP,
        };
        let Some(rsp) = self.rsp.as_mut() else {
            return;
        };
        if rsp.sigval != SIGNAL_NONE && rsp.sigval != sigval {
            warn!(
                "RSP signal {sigval} received while signal {} pending: replaced",
                rsp.sigval
            );
        }
        rsp.sigval = sigval;
    }

    /// Scheduler job: while running, watch for ^C break-ins from GDB.
    pub fn rsp_poll_job(&mut self) {
        if self.runtime.stalled {
            return;
        }
        let Some(rsp) = self.rsp.as_mut() else {
            return;
        };
        if rsp.poll_break_in() {
            info!("RSP break-in: stalling");
            rsp.sigval = SIGNAL_INT;
            rsp.client_waiting = true;
            self.set_stall_state(true);
        }
    }

    /// The stalled-CPU inner loop body: make sure we have a client, report
    /// any unacknowledged stop, then serve one request.
    pub fn handle_rsp(&mut self) {
        let Some(rsp) = self.rsp.as_mut() else {
            return;
        };
        while !rsp.has_client() {
            if !rsp.get_client() {
                return;
            }
            rsp.client_waiting = false;
        }

        if rsp.client_waiting {
            // A trap from a planted memory breakpoint leaves the PC past
            // the trap; rewind so the client sees the breakpoint address.
            let ppc = self.cpu.sprs.get(SPR_PPC);
            if rsp.sigval == SIGNAL_TRAP && rsp.mp_hash_lookup(MpType::BpMemory, ppc).is_some() {
                self.set_npc(ppc);
            }
            self.rsp_report_exception();
            if let Some(rsp) = self.rsp.as_mut() {
                rsp.client_waiting = false;
            }
        }

        self.rsp_client_request();
    }

    fn rsp_report_exception(&mut self) {
        let Some(rsp) = self.rsp.as_mut() else {
            return;
        };
        let reply = format!(
            "S{}{}",
            HEXCHARS[(rsp.sigval >> 4) as usize] as char,
            HEXCHARS[(rsp.sigval & 0xf) as usize] as char
        );
        rsp.put_str_packet(&reply);
    }

    fn rsp_client_request(&mut self) {
        let pkt = {
            let Some(rsp) = self.rsp.as_mut() else {
                return;
            };
            match rsp.get_packet() {
                Some(p) => p,
                None => {
                    // EOF: carry on without the debugger
                    if let Some(rsp) = self.rsp.as_mut() {
                        rsp.client_close();
                    }
                    self.set_stall_state(false);
                    return;
                }
            }
        };
        if pkt.is_empty() {
            return;
        }
        debug!("RSP packet: {}", String::from_utf8_lossy(&pkt));

        match pkt[0] {
            b'!' => self.rsp_reply("OK"),
            b'?' => self.rsp_report_exception(),
            b'A' => {
                warn!("RSP 'A' packet not supported: ignored");
                self.rsp_reply("E01");
            }
            b'b' | b'B' | b'd' | b'r' | b't' => {
                warn!("deprecated or unsupported RSP packet ignored");
            }
            b'c' => self.rsp_continue(&pkt),
            b'C' => {
                info!("RSP continue with signal received");
            }
            b'D' => {
                self.rsp_reply("OK");
                if let Some(rsp) = self.rsp.as_mut() {
                    rsp.client_close();
                    rsp.sigval = SIGNAL_NONE;
                }
                self.set_stall_state(false);
            }
            b'F' => warn!("RSP file I/O not supported: 'F' packet ignored"),
            b'g' => self.rsp_read_all_regs(),
            b'G' => self.rsp_write_all_regs(&pkt),
            b'H' => self.rsp_reply("OK"),
            b'i' | b'I' => {
                warn!("RSP cycle stepping not supported: target stopped immediately");
                if let Some(rsp) = self.rsp.as_mut() {
                    rsp.client_waiting = true;
                }
            }
            b'k' => (),
            b'm' => self.rsp_read_mem(&pkt),
            b'M' => self.rsp_write_mem(&pkt),
            b'p' => self.rsp_read_reg(&pkt),
            b'P' => self.rsp_write_reg(&pkt),
            b'q' => self.rsp_query(&pkt),
            b'Q' => self.rsp_set(&pkt),
            b'R' => self.rsp_restart(),
            b's' => self.rsp_step(&pkt),
            b'S' => info!("RSP step with signal received"),
            b'T' => self.rsp_reply("OK"),
            b'v' => self.rsp_vpkt(&pkt),
            b'X' => self.rsp_write_mem_bin(&pkt),
            b'z' => self.rsp_matchpoint(&pkt, false),
            b'Z' => self.rsp_matchpoint(&pkt, true),
            _ => {
                warn!("unknown RSP request {}", String::from_utf8_lossy(&pkt));
            }
        }
    }

    fn rsp_reply(&mut self, s: &str) {
        if let Some(rsp) = self.rsp.as_mut() {
            rsp.put_str_packet(s);
        }
    }

    fn rsp_continue(&mut self, pkt: &[u8]) {
        let addr = if pkt.len() > 1 {
            take_hex(&pkt[1..]).0
        } else {
            self.cpu.pc
        };
        self.rsp_continue_generic(addr);
    }

    fn rsp_continue_generic(&mut self, addr: u32) {
        self.set_npc(addr);
        self.cpu.sprs.set(SPR_DRR, 0);
        self.cpu.sprs.clear_bits(SPR_DMR2, SPR_DMR2_WGB);
        self.cpu.sprs.clear_bits(SPR_DMR1, SPR_DMR1_ST);
        self.cpu.sprs.set_bits(SPR_DSR, SPR_DSR_TE);
        self.set_stall_state(false);
        if let Some(rsp) = self.rsp.as_mut() {
            rsp.sigval = SIGNAL_NONE;
            rsp.client_waiting = true;
        }
    }

    fn rsp_step(&mut self, pkt: &[u8]) {
        let addr = if pkt.len() > 1 {
            take_hex(&pkt[1..]).0
        } else {
            self.cpu.pc
        };
        self.rsp_step_generic(addr);
    }

    fn rsp_step_generic(&mut self, addr: u32) {
        self.set_npc(addr);
        self.cpu.sprs.set(SPR_DRR, 0);
        self.cpu.sprs.clear_bits(SPR_DMR2, SPR_DMR2_WGB);
        self.cpu.sprs.set_bits(SPR_DMR1, SPR_DMR1_ST);
        self.cpu.sprs.set_bits(SPR_DSR, SPR_DSR_TE);
        self.set_stall_state(false);
        if let Some(rsp) = self.rsp.as_mut() {
            rsp.sigval = SIGNAL_NONE;
            rsp.client_waiting = true;
        }
    }

    fn rsp_read_all_regs(&mut self) {
        let mut reply = String::with_capacity(NUM_REGS * 8);
        for r in 0..MAX_GPRS {
            reply.push_str(&reg2hex(self.cpu.reg[r]));
        }
        reply.push_str(&reg2hex(self.cpu.sprs.get(SPR_PPC)));
        reply.push_str(&reg2hex(self.cpu.pc));
        reply.push_str(&reg2hex(self.cpu.sprs.get(SPR_SR)));
        self.rsp_reply(&reply);
    }

    fn rsp_write_all_regs(&mut self, pkt: &[u8]) {
        let data = &pkt[1..];
        if data.len() < NUM_REGS * 8 {
            self.rsp_reply("E01");
            return;
        }
        for r in 0..MAX_GPRS {
            self.cpu.reg[r] = hex2reg(&data[r * 8..]);
        }
        self.cpu.reg[0] = 0;
        let ppc = hex2reg(&data[PPC_REGNUM * 8..]);
        let sr = hex2reg(&data[SR_REGNUM * 8..]);
        self.cpu.sprs.set(SPR_PPC, ppc);
        self.cpu.sprs.set(SPR_SR, sr | SPR_SR_FO);
        let npc = hex2reg(&data[NPC_REGNUM * 8..]);
        self.set_npc(npc);
        self.rsp_reply("OK");
    }

    fn rsp_read_reg(&mut self, pkt: &[u8]) {
        let (regnum, _) = take_hex(&pkt[1..]);
        let value = match regnum as usize {
            r if r < MAX_GPRS => self.cpu.reg[r],
            PPC_REGNUM => self.cpu.sprs.get(SPR_PPC),
            NPC_REGNUM => self.cpu.pc,
            SR_REGNUM => self.cpu.sprs.get(SPR_SR),
            _ => {
                warn!("attempt to read unknown register 0x{regnum:x}: ignored");
                self.rsp_reply("E01");
                return;
            }
        };
        let hex = reg2hex(value);
        self.rsp_reply(&hex);
    }

    fn rsp_write_reg(&mut self, pkt: &[u8]) {
        let (regnum, rest) = take_hex(&pkt[1..]);
        if rest.first() != Some(&b'=') {
            self.rsp_reply("E01");
            return;
        }
        let value = hex2reg(&rest[1..]);
        match regnum as usize {
            r if r < MAX_GPRS => self.setsim_reg(r as u32, value),
            PPC_REGNUM => self.cpu.sprs.set(SPR_PPC, value),
            NPC_REGNUM => self.set_npc(value),
            SR_REGNUM => self.cpu.sprs.set(SPR_SR, value | SPR_SR_FO),
            _ => {
                warn!("attempt to write unknown register 0x{regnum:x}: ignored");
                self.rsp_reply("E01");
                return;
            }
        }
        self.rsp_reply("OK");
    }

    fn rsp_read_mem(&mut self, pkt: &[u8]) {
        let (addr, rest) = take_hex(&pkt[1..]);
        if rest.first() != Some(&b',') {
            self.rsp_reply("E01");
            return;
        }
        let (mut len, _) = take_hex(&rest[1..]);
        if (len as usize * 2) >= GDB_BUF_MAX {
            warn!("memory read too large for RSP packet: truncated");
            len = ((GDB_BUF_MAX - 1) / 2) as u32;
        }
        let mut reply = String::with_capacity(len as usize * 2);
        for off in 0..len {
            if self.mem.verify(addr.wrapping_add(off)).is_none() {
                self.rsp_reply("E01");
                return;
            }
            let byte = self.mem.read_direct::<8>(addr.wrapping_add(off));
            reply.push(HEXCHARS[(byte >> 4) as usize] as char);
            reply.push(HEXCHARS[(byte & 0xf) as usize] as char);
        }
        self.rsp_reply(&reply);
    }

    fn rsp_write_mem(&mut self, pkt: &[u8]) {
        let (addr, rest) = take_hex(&pkt[1..]);
        if rest.first() != Some(&b',') {
            self.rsp_reply("E01");
            return;
        }
        let (len, rest) = take_hex(&rest[1..]);
        if rest.first() != Some(&b':') {
            self.rsp_reply("E01");
            return;
        }
        let data = &rest[1..];
        if data.len() != len as usize * 2 {
            warn!(
                "write of {} digits requested, but {} digits supplied: packet ignored",
                len * 2,
                data.len()
            );
            self.rsp_reply("E01");
            return;
        }
        for off in 0..len as usize {
            let a = addr.wrapping_add(off as u32);
            if self.mem.verify(a).is_none() {
                self.rsp_reply("E01");
                return;
            }
            let byte = ((hex(data[off * 2]) & 0xf) << 4) | (hex(data[off * 2 + 1]) & 0xf);
            // go through the caches so stale lines cannot shadow the write
            self.dc_inv(a);
            self.ic_inv(a);
            self.mem.write_prog::<8>(a, byte);
        }
        self.rsp_reply("OK");
    }

    fn rsp_write_mem_bin(&mut self, pkt: &[u8]) {
        let (addr, rest) = take_hex(&pkt[1..]);
        if rest.first() != Some(&b',') {
            self.rsp_reply("E01");
            return;
        }
        let (len, rest) = take_hex(&rest[1..]);
        if rest.first() != Some(&b':') {
            self.rsp_reply("E01");
            return;
        }
        let bindat = rsp_unescape(&rest[1..]);
        let len = if bindat.len() != len as usize {
            let min = bindat.len().min(len as usize);
            warn!(
                "write of {len} bytes requested, but {} bytes supplied. {min} will be written",
                bindat.len()
            );
            min
        } else {
            len as usize
        };
        for (off, &byte) in bindat.iter().take(len).enumerate() {
            let a = addr.wrapping_add(off as u32);
            if self.mem.verify(a).is_none() {
                self.rsp_reply("E01");
                return;
            }
            self.dc_inv(a);
            self.ic_inv(a);
            self.mem.write_prog::<8>(a, byte as u32);
        }
        self.rsp_reply("OK");
    }

    fn rsp_query(&mut self, pkt: &[u8]) {
        let q = String::from_utf8_lossy(pkt).into_owned();
        if q == "qAttached" {
            self.rsp_reply("1");
        } else if q == "qC" {
            let reply = format!("QC{RSP_TID:x}");
            self.rsp_reply(&reply);
        } else if q.starts_with("qCRC") {
            warn!("RSP CRC query not supported");
            self.rsp_reply("E01");
        } else if q == "qfThreadInfo" {
            let reply = format!("m{RSP_TID:x}");
            self.rsp_reply(&reply);
        } else if q == "qsThreadInfo" {
            self.rsp_reply("l");
        } else if q.starts_with("qGetTLSAddr:") {
            self.rsp_reply("");
        } else if q.starts_with("qL") {
            self.rsp_reply("qM001");
        } else if q == "qOffsets" {
            self.rsp_reply("Text=0;Data=0;Bss=0");
        } else if q.starts_with("qP") {
            self.rsp_reply("");
        } else if q.starts_with("qRcmd,") {
            self.rsp_command(&q["qRcmd,".len()..]);
        } else if q.starts_with("qSupported") {
            let reply = format!("PacketSize={GDB_BUF_MAX:x}");
            self.rsp_reply(&reply);
        } else if q.starts_with("qSymbol:") {
            self.rsp_reply("OK");
        } else if q.starts_with("qThreadExtraInfo,") {
            let reply = ascii2hex("Runnable\0");
            self.rsp_reply(&reply);
        } else if q.starts_with("qTStatus") || q.starts_with("qXfer:") {
            self.rsp_reply("");
        } else {
            warn!("unrecognized RSP query {q}: ignored");
        }
    }

    /// `qRcmd` monitor commands: readspr / writespr.
    fn rsp_command(&mut self, hexed: &str) {
        let cmd = hex2ascii(hexed.as_bytes());
        if let Some(arg) = cmd.strip_prefix("readspr ") {
            let Ok(regno) = u32::from_str_radix(arg.trim(), 16) else {
                self.rsp_reply("E01");
                return;
            };
            if regno >= MAX_SPRS as u32 {
                warn!("qRcmd readspr {regno:x} too large: ignored");
                self.rsp_reply("E01");
                return;
            }
            let value = self.mfspr(regno as u16);
            let reply = ascii2hex(&format!("{value:8x}"));
            self.rsp_reply(&reply);
        } else if let Some(arg) = cmd.strip_prefix("writespr ") {
            let mut it = arg.split_whitespace();
            let (Some(r), Some(v)) = (it.next(), it.next()) else {
                self.rsp_reply("E01");
                return;
            };
            let (Ok(regno), Ok(value)) = (u32::from_str_radix(r, 16), u32::from_str_radix(v, 16))
            else {
                self.rsp_reply("E01");
                return;
            };
            if regno >= MAX_SPRS as u32 {
                warn!("qRcmd writespr {regno:x} too large: ignored");
                self.rsp_reply("E01");
                return;
            }
            self.mtspr(regno as u16, value);
            self.rsp_reply("OK");
        } else {
            warn!("qRcmd {cmd} not recognized: ignored");
            self.rsp_reply("E01");
        }
    }

    fn rsp_set(&mut self, pkt: &[u8]) {
        let q = String::from_utf8_lossy(pkt);
        if q.starts_with("QPassSignals:")
            || q.starts_with("QTDP")
            || q.starts_with("QFrame")
            || q.as_ref() == "QTStart"
            || q.as_ref() == "QTStop"
            || q.as_ref() == "QTinit"
            || q.starts_with("QTro")
        {
            self.rsp_reply("");
        } else {
            warn!("unrecognized RSP set request: ignored");
        }
    }

    fn rsp_restart(&mut self) {
        let addr = self.rsp.as_ref().map(|r| r.start_addr).unwrap_or(0x100);
        self.set_npc(addr);
    }

    fn rsp_vpkt(&mut self, pkt: &[u8]) {
        let v = String::from_utf8_lossy(pkt).into_owned();
        if v.starts_with("vAttach;") {
            self.rsp_reply("S05");
        } else if v == "vCont?" {
            self.rsp_reply("");
        } else if v.starts_with("vCont") {
            warn!("RSP vCont not supported: ignored");
        } else if v.starts_with("vFile:") {
            warn!("RSP vFile not supported: ignored");
            self.rsp_reply("");
        } else if v.starts_with("vFlashErase:")
            || v.starts_with("vFlashWrite:")
            || v == "vFlashDone"
        {
            self.rsp_reply("E01");
        } else if v.starts_with("vRun;") {
            if v.len() > "vRun;".len() {
                warn!("unexpected arguments to RSP vRun command: ignored");
            }
            self.rsp_restart();
            self.rsp_reply("S05");
        } else {
            warn!("unknown RSP 'v' packet type {v}: ignored");
            self.rsp_reply("E01");
        }
    }

    /// `Z`/`z`: insert or remove a matchpoint. Only memory breakpoints are
    /// supported; they rewrite the target word to a trap instruction.
    fn rsp_matchpoint(&mut self, pkt: &[u8], insert: bool) {
        let body = &pkt[1..];
        let (ty_digit, rest) = take_hex(body);
        if rest.first() != Some(&b',') {
            self.rsp_reply("E01");
            return;
        }
        let (addr, rest) = take_hex(&rest[1..]);
        if rest.first() != Some(&b',') {
            self.rsp_reply("E01");
            return;
        }
        let (len, _) = take_hex(&rest[1..]);
        if len != 4 {
            warn!("RSP matchpoint length {len} not valid: 4 assumed");
        }
        let Some(ty) = MpType::from_digit(ty_digit) else {
            warn!("RSP matchpoint type {ty_digit} not recognized: ignored");
            self.rsp_reply("E01");
            return;
        };
        match ty {
            MpType::BpMemory => {
                if insert {
                    let orig = self.mem.read_direct::<32>(addr);
                    if let Some(rsp) = self.rsp.as_mut() {
                        rsp.mp_hash_add(MpType::BpMemory, addr, orig);
                    }
                    self.ic_inv(addr);
                    self.mem.write_prog::<32>(addr, TRAP_INSN);
                } else if let Some(orig) = self
                    .rsp
                    .as_mut()
                    .and_then(|r| r.mp_hash_delete(MpType::BpMemory, addr))
                {
                    self.ic_inv(addr);
                    self.mem.write_prog::<32>(addr, orig);
                }
                self.rsp_reply("OK");
            }
            _ => self.rsp_reply(""), // not supported
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut PacketParser, bytes: &[u8]) -> Option<ParserEvent> {
        let mut last = None;
        for &b in bytes {
            if let Some(ev) = parser.push(b) {
                last = Some(ev);
            }
        }
        last
    }

    #[test]
    fn framing_round_trips_plain_payloads() {
        let mut parser = PacketParser::new();
        for payload in [&b"OK"[..], b"S05", b"m4,10:", b"", b"qSupported"] {
            let framed = serialise_packet(payload);
            match parse_all(&mut parser, &framed) {
                Some(ParserEvent::Packet(p)) => assert_eq!(p, payload),
                other => panic!("expected packet, got {other:?}"),
            }
        }
    }

    #[test]
    fn framing_round_trips_escaped_payloads() {
        let mut parser = PacketParser::new();
        let payload = b"X0,4:\x03}$#*\x7d";
        let framed = serialise_packet(payload);
        match parse_all(&mut parser, &framed) {
            Some(ParserEvent::Packet(p)) => {
                assert_eq!(rsp_unescape(&p), payload);
            }
            other => panic!("expected packet, got {other:?}"),
        }
    }

    #[test]
    fn known_checksums() {
        // the canonical GDB examples: $?#3f, $s#73, $c#63
        assert_eq!(serialise_packet(b"?"), b"$?#3f".to_vec());
        assert_eq!(serialise_packet(b"s"), b"$s#73".to_vec());
        assert_eq!(serialise_packet(b"c"), b"$c#63".to_vec());
        assert_eq!(serialise_packet(b"S05"), b"$S05#b8".to_vec());
    }

    #[test]
    fn bad_checksum_is_flagged() {
        let mut parser = PacketParser::new();
        assert_eq!(
            parse_all(&mut parser, b"$OK#00"),
            Some(ParserEvent::BadChecksum)
        );
        // and the stream recovers for the next packet
        let framed = serialise_packet(b"OK");
        assert!(matches!(
            parse_all(&mut parser, &framed),
            Some(ParserEvent::Packet(_))
        ));
    }

    #[test]
    fn restart_mid_packet_keeps_the_second() {
        let mut parser = PacketParser::new();
        let mut bytes = b"$garbage".to_vec();
        bytes.extend_from_slice(&serialise_packet(b"OK"));
        match parse_all(&mut parser, &bytes) {
            Some(ParserEvent::Packet(p)) => assert_eq!(p, b"OK"),
            other => panic!("expected packet, got {other:?}"),
        }
    }

    #[test]
    fn break_in_outside_packet() {
        let mut parser = PacketParser::new();
        assert_eq!(parser.push(0x03), Some(ParserEvent::BreakIn));
    }

    #[test]
    fn mp_hash_round_trips() {
        let mut rsp = RspServer::new(0);
        rsp.mp_hash_add(MpType::BpMemory, 0x1000, 0x1520_0001);
        // duplicate insertion keeps the original word
        rsp.mp_hash_add(MpType::BpMemory, 0x1000, TRAP_INSN);
        assert_eq!(rsp.mp_hash_lookup(MpType::BpMemory, 0x1000), Some(0x1520_0001));
        assert_eq!(rsp.mp_hash_delete(MpType::BpMemory, 0x1000), Some(0x1520_0001));
        assert_eq!(rsp.mp_hash_delete(MpType::BpMemory, 0x1000), None);
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(reg2hex(0xdeadbeef), "deadbeef");
        assert_eq!(hex2reg(b"deadbeef"), 0xdeadbeef);
        assert_eq!(ascii2hex("OK"), "4f4b");
        assert_eq!(hex2ascii(b"4f4b"), "OK");
    }

    use std::io::{Read as _, Write as _};
    use std::net::TcpStream;
    use std::time::Duration;

    use crate::core::config::{Config, MemoryConfig};
    use crate::core::emu::Simulator;

    fn send_packet(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_all(&serialise_packet(payload)).unwrap();
        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).unwrap();
        assert_eq!(
            ack[0],
            b'+',
            "packet {:?} was not acked",
            String::from_utf8_lossy(payload)
        );
    }

    fn recv_packet(stream: &mut TcpStream) -> Vec<u8> {
        let mut parser = PacketParser::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).unwrap();
            if let Some(ParserEvent::Packet(p)) = parser.push(byte[0]) {
                stream.write_all(b"+").unwrap();
                return p;
            }
        }
    }

    #[test]
    fn scenario_attach_step_continue_breakpoint() {
        let mut config = Config::default();
        config.memories.push(MemoryConfig {
            baseaddr: 0,
            size: 0x0020_0000,
            delayr: 0,
            delayw: 0,
            ..Default::default()
        });
        config.debug.enabled = true;
        config.debug.rsp_enabled = true;
        let mut sim = Simulator::new(config).unwrap();

        // l.nop; l.nop; l.nop; l.nop 1 — the breakpoint goes on the exit nop
        for (i, word) in [0x1500_0000u32, 0x1500_0000, 0x1500_0000, 0x1500_0001]
            .iter()
            .enumerate()
        {
            sim.mem.write_prog::<32>(0x100 + 4 * i as u32, *word);
        }

        let port = sim.rsp.as_mut().unwrap().listen_for_test();
        // The target sits stalled waiting for a client; the thread is left
        // parked when the test finishes.
        std::thread::spawn(move || sim.exec_main());

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream.write_all(b"+").unwrap();

        // attach: the target reports a stop with SIGTRAP
        send_packet(&mut stream, b"?");
        assert_eq!(recv_packet(&mut stream), b"S05");

        // we are a bare-metal target with one fixed thread
        send_packet(&mut stream, b"qAttached");
        assert_eq!(recv_packet(&mut stream), b"1");
        send_packet(&mut stream, b"qC");
        assert_eq!(recv_packet(&mut stream), b"QC1");
        send_packet(&mut stream, b"qfThreadInfo");
        assert_eq!(recv_packet(&mut stream), b"m1");

        // point NPC at the first instruction and single step exactly once
        send_packet(&mut stream, b"P21=00000100");
        assert_eq!(recv_packet(&mut stream), b"OK");
        send_packet(&mut stream, b"s");
        assert_eq!(recv_packet(&mut stream), b"S05");
        send_packet(&mut stream, b"p21");
        assert_eq!(recv_packet(&mut stream), b"00000104");

        // plant a memory breakpoint on the exit nop, then continue into it
        send_packet(&mut stream, b"Z0,10c,4");
        assert_eq!(recv_packet(&mut stream), b"OK");
        send_packet(&mut stream, b"c");
        assert_eq!(recv_packet(&mut stream), b"S05");
        // the PC was rewound to the breakpointed instruction
        send_packet(&mut stream, b"p21");
        assert_eq!(recv_packet(&mut stream), b"0000010c");

        // removing the breakpoint puts the original word back
        send_packet(&mut stream, b"z0,10c,4");
        assert_eq!(recv_packet(&mut stream), b"OK");
        send_packet(&mut stream, b"m10c,4");
        assert_eq!(recv_packet(&mut stream), b"15000001");
    }
}
