//! Instruction set tables and the decode automaton.
//!
//! Every opcode is described by its assembler operand string and a 32-column
//! encoding pattern ('0'/'1' fixed bits, '-' don't care, letters operand
//! bits; spaces only for readability). At startup the patterns are compiled
//! into a deterministic automaton: each state tests one bit of the word and
//! branches, leaves carry the opcode index. Operand extraction walks a
//! per-opcode list of bit-field descriptors, so split immediates (l.mtspr,
//! l.sw) assemble without any per-opcode code.

use std::sync::OnceLock;

use crate::core::cpu::{self};
use crate::core::emu::Simulator;
use crate::core::except::Except;

pub type OpHandler = fn(&mut Simulator) -> Result<(), Except>;

pub struct Or32Opcode {
    pub name: &'static str,
    pub args: &'static str,
    pub encoding: &'static str,
    pub exec: OpHandler,
}

macro_rules! op {
    ($name:literal, $args:literal, $enc:literal, $exec:path) => {
        Or32Opcode {
            name: $name,
            args: $args,
            encoding: $enc,
            exec: $exec,
        }
    };
}

#[rustfmt::skip]
pub static OR32_OPCODES: &[Or32Opcode] = &[
    op!("l.j",      "N",        "0000 00NN NNNN NNNN NNNN NNNN NNNN NNNN", cpu::l_j),
    op!("l.jal",    "N",        "0000 01NN NNNN NNNN NNNN NNNN NNNN NNNN", cpu::l_jal),
    op!("l.bnf",    "N",        "0000 11NN NNNN NNNN NNNN NNNN NNNN NNNN", cpu::l_bnf),
    op!("l.bf",     "N",        "0001 00NN NNNN NNNN NNNN NNNN NNNN NNNN", cpu::l_bf),
    op!("l.nop",    "K",        "0001 0101 ---- ---- KKKK KKKK KKKK KKKK", cpu::l_nop),
    op!("l.movhi",  "rD,K",     "0001 10DD DDD- ---0 KKKK KKKK KKKK KKKK", cpu::l_movhi),
    op!("l.macrc",  "rD",       "0001 10DD DDD- ---1 ---- ---- ---- ----", cpu::l_macrc),
    op!("l.sys",    "K",        "0010 0000 0000 0000 KKKK KKKK KKKK KKKK", cpu::l_sys),
    op!("l.trap",   "K",        "0010 0001 0000 0000 KKKK KKKK KKKK KKKK", cpu::l_trap),
    op!("l.msync",  "",         "0010 0010 0000 0000 0000 0000 0000 0000", cpu::l_none),
    op!("l.psync",  "",         "0010 0010 1000 0000 0000 0000 0000 0000", cpu::l_none),
    op!("l.csync",  "",         "0010 0011 0000 0000 0000 0000 0000 0000", cpu::l_none),
    op!("l.rfe",    "",         "0010 01-- ---- ---- ---- ---- ---- ----", cpu::l_rfe),
    op!("l.jr",     "rB",       "0100 01-- ---- ---- BBBB B--- ---- ----", cpu::l_jr),
    op!("l.jalr",   "rB",       "0100 10-- ---- ---- BBBB B--- ---- ----", cpu::l_jalr),
    op!("l.maci",   "rA,I",     "0100 11-- ---A AAAA IIII IIII IIII IIII", cpu::l_maci),
    op!("l.cust1",  "",         "0111 00-- ---- ---- ---- ---- ---- ----", cpu::l_none),
    op!("l.cust2",  "",         "0111 01-- ---- ---- ---- ---- ---- ----", cpu::l_none),
    op!("l.cust3",  "",         "0111 10-- ---- ---- ---- ---- ---- ----", cpu::l_none),
    op!("l.cust4",  "",         "0111 11-- ---- ---- ---- ---- ---- ----", cpu::l_none),
    op!("l.lwz",    "rD,I(rA)", "1000 01DD DDDA AAAA IIII IIII IIII IIII", cpu::l_lwz),
    op!("l.lws",    "rD,I(rA)", "1000 10DD DDDA AAAA IIII IIII IIII IIII", cpu::l_lwz),
    op!("l.lbz",    "rD,I(rA)", "1000 11DD DDDA AAAA IIII IIII IIII IIII", cpu::l_lbz),
    op!("l.lbs",    "rD,I(rA)", "1001 00DD DDDA AAAA IIII IIII IIII IIII", cpu::l_lbs),
    op!("l.lhz",    "rD,I(rA)", "1001 01DD DDDA AAAA IIII IIII IIII IIII", cpu::l_lhz),
    op!("l.lhs",    "rD,I(rA)", "1001 10DD DDDA AAAA IIII IIII IIII IIII", cpu::l_lhs),
    op!("l.addi",   "rD,rA,I",  "1001 11DD DDDA AAAA IIII IIII IIII IIII", cpu::l_add),
    op!("l.addic",  "rD,rA,I",  "1010 00DD DDDA AAAA IIII IIII IIII IIII", cpu::l_addc),
    op!("l.andi",   "rD,rA,K",  "1010 01DD DDDA AAAA KKKK KKKK KKKK KKKK", cpu::l_and),
    op!("l.ori",    "rD,rA,K",  "1010 10DD DDDA AAAA KKKK KKKK KKKK KKKK", cpu::l_or),
    op!("l.xori",   "rD,rA,I",  "1010 11DD DDDA AAAA IIII IIII IIII IIII", cpu::l_xor),
    op!("l.muli",   "rD,rA,I",  "1011 00DD DDDA AAAA IIII IIII IIII IIII", cpu::l_mul),
    op!("l.mfspr",  "rD,rA,K",  "1011 01DD DDDA AAAA KKKK KKKK KKKK KKKK", cpu::l_mfspr),
    op!("l.slli",   "rD,rA,L",  "1011 10DD DDDA AAAA ---- ---- 00LL LLLL", cpu::l_sll),
    op!("l.srli",   "rD,rA,L",  "1011 10DD DDDA AAAA ---- ---- 01LL LLLL", cpu::l_srl),
    op!("l.srai",   "rD,rA,L",  "1011 10DD DDDA AAAA ---- ---- 10LL LLLL", cpu::l_sra),
    op!("l.rori",   "rD,rA,L",  "1011 10DD DDDA AAAA ---- ---- 11LL LLLL", cpu::l_ror),
    op!("l.sfeqi",  "rA,I",     "1011 1100 000A AAAA IIII IIII IIII IIII", cpu::l_sfeq),
    op!("l.sfnei",  "rA,I",     "1011 1100 001A AAAA IIII IIII IIII IIII", cpu::l_sfne),
    op!("l.sfgtui", "rA,I",     "1011 1100 010A AAAA IIII IIII IIII IIII", cpu::l_sfgtu),
    op!("l.sfgeui", "rA,I",     "1011 1100 011A AAAA IIII IIII IIII IIII", cpu::l_sfgeu),
    op!("l.sfltui", "rA,I",     "1011 1100 100A AAAA IIII IIII IIII IIII", cpu::l_sfltu),
    op!("l.sfleui", "rA,I",     "1011 1100 101A AAAA IIII IIII IIII IIII", cpu::l_sfleu),
    op!("l.sfgtsi", "rA,I",     "1011 1101 010A AAAA IIII IIII IIII IIII", cpu::l_sfgts),
    op!("l.sfgesi", "rA,I",     "1011 1101 011A AAAA IIII IIII IIII IIII", cpu::l_sfges),
    op!("l.sfltsi", "rA,I",     "1011 1101 100A AAAA IIII IIII IIII IIII", cpu::l_sflts),
    op!("l.sflesi", "rA,I",     "1011 1101 101A AAAA IIII IIII IIII IIII", cpu::l_sfles),
    op!("l.mtspr",  "rA,rB,K",  "1100 00KK KKKA AAAA BBBB BKKK KKKK KKKK", cpu::l_mtspr),
    op!("l.mac",    "rA,rB",    "1100 01-- ---A AAAA BBBB B--- ---- 0001", cpu::l_mac),
    op!("l.msb",    "rA,rB",    "1100 01-- ---A AAAA BBBB B--- ---- 0010", cpu::l_msb),
    op!("lf.add.s", "rD,rA,rB", "1100 10DD DDDA AAAA BBBB B--- 0000 0000", cpu::lf_add_s),
    op!("lf.sub.s", "rD,rA,rB", "1100 10DD DDDA AAAA BBBB B--- 0000 0001", cpu::lf_sub_s),
    op!("lf.mul.s", "rD,rA,rB", "1100 10DD DDDA AAAA BBBB B--- 0000 0010", cpu::lf_mul_s),
    op!("lf.div.s", "rD,rA,rB", "1100 10DD DDDA AAAA BBBB B--- 0000 0011", cpu::lf_div_s),
    op!("lf.itof.s","rD,rA",    "1100 10DD DDDA AAAA ---- ---- 0000 0100", cpu::lf_itof_s),
    op!("lf.ftoi.s","rD,rA",    "1100 10DD DDDA AAAA ---- ---- 0000 0101", cpu::lf_ftoi_s),
    op!("lf.rem.s", "rD,rA,rB", "1100 10DD DDDA AAAA BBBB B--- 0000 0110", cpu::lf_rem_s),
    op!("lf.madd.s","rD,rA,rB", "1100 10DD DDDA AAAA BBBB B--- 0000 0111", cpu::lf_madd_s),
    op!("lf.sfeq.s","rA,rB",    "1100 10-- ---A AAAA BBBB B--- 0000 1000", cpu::lf_sfeq_s),
    op!("lf.sfne.s","rA,rB",    "1100 10-- ---A AAAA BBBB B--- 0000 1001", cpu::lf_sfne_s),
    op!("lf.sfgt.s","rA,rB",    "1100 10-- ---A AAAA BBBB B--- 0000 1010", cpu::lf_sfgt_s),
    op!("lf.sfge.s","rA,rB",    "1100 10-- ---A AAAA BBBB B--- 0000 1011", cpu::lf_sfge_s),
    op!("lf.sflt.s","rA,rB",    "1100 10-- ---A AAAA BBBB B--- 0000 1100", cpu::lf_sflt_s),
    op!("lf.sfle.s","rA,rB",    "1100 10-- ---A AAAA BBBB B--- 0000 1101", cpu::lf_sfle_s),
    op!("l.sw",     "I(rA),rB", "1101 01II IIIA AAAA BBBB BIII IIII IIII", cpu::l_sw),
    op!("l.sb",     "I(rA),rB", "1101 10II IIIA AAAA BBBB BIII IIII IIII", cpu::l_sb),
    op!("l.sh",     "I(rA),rB", "1101 11II IIIA AAAA BBBB BIII IIII IIII", cpu::l_sh),
    op!("l.add",    "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-00 ---- 0000", cpu::l_add),
    op!("l.addc",   "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-00 ---- 0001", cpu::l_addc),
    op!("l.sub",    "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-00 ---- 0010", cpu::l_sub),
    op!("l.and",    "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-00 ---- 0011", cpu::l_and),
    op!("l.or",     "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-00 ---- 0100", cpu::l_or),
    op!("l.xor",    "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-00 ---- 0101", cpu::l_xor),
    op!("l.mul",    "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-11 ---- 0110", cpu::l_mul),
    op!("l.sll",    "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-00 00-- 1000", cpu::l_sll),
    op!("l.srl",    "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-00 01-- 1000", cpu::l_srl),
    op!("l.sra",    "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-00 10-- 1000", cpu::l_sra),
    op!("l.ror",    "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-00 11-- 1000", cpu::l_ror),
    op!("l.div",    "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-11 ---- 1001", cpu::l_div),
    op!("l.divu",   "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-11 ---- 1010", cpu::l_divu),
    op!("l.mulu",   "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-11 ---- 1011", cpu::l_mulu),
    op!("l.exths",  "rD,rA",    "1110 00DD DDDA AAAA ---- --00 00-- 1100", cpu::l_exths),
    op!("l.extbs",  "rD,rA",    "1110 00DD DDDA AAAA ---- --00 01-- 1100", cpu::l_extbs),
    op!("l.exthz",  "rD,rA",    "1110 00DD DDDA AAAA ---- --00 10-- 1100", cpu::l_exthz),
    op!("l.extbz",  "rD,rA",    "1110 00DD DDDA AAAA ---- --00 11-- 1100", cpu::l_extbz),
    op!("l.extws",  "rD,rA",    "1110 00DD DDDA AAAA ---- --00 00-- 1101", cpu::l_extws),
    op!("l.extwz",  "rD,rA",    "1110 00DD DDDA AAAA ---- --00 01-- 1101", cpu::l_extwz),
    op!("l.cmov",   "rD,rA,rB", "1110 00DD DDDA AAAA BBBB B-00 ---- 1110", cpu::l_cmov),
    op!("l.ff1",    "rD,rA",    "1110 00DD DDDA AAAA ---- --00 ---- 1111", cpu::l_ff1),
    op!("l.fl1",    "rD,rA",    "1110 00DD DDDA AAAA ---- --01 ---- 1111", cpu::l_fl1),
    op!("l.sfeq",   "rA,rB",    "1110 0100 000A AAAA BBBB B--- ---- ----", cpu::l_sfeq),
    op!("l.sfne",   "rA,rB",    "1110 0100 001A AAAA BBBB B--- ---- ----", cpu::l_sfne),
    op!("l.sfgtu",  "rA,rB",    "1110 0100 010A AAAA BBBB B--- ---- ----", cpu::l_sfgtu),
    op!("l.sfgeu",  "rA,rB",    "1110 0100 011A AAAA BBBB B--- ---- ----", cpu::l_sfgeu),
    op!("l.sfltu",  "rA,rB",    "1110 0100 100A AAAA BBBB B--- ---- ----", cpu::l_sfltu),
    op!("l.sfleu",  "rA,rB",    "1110 0100 101A AAAA BBBB B--- ---- ----", cpu::l_sfleu),
    op!("l.sfgts",  "rA,rB",    "1110 0101 010A AAAA BBBB B--- ---- ----", cpu::l_sfgts),
    op!("l.sfges",  "rA,rB",    "1110 0101 011A AAAA BBBB B--- ---- ----", cpu::l_sfges),
    op!("l.sflts",  "rA,rB",    "1110 0101 100A AAAA BBBB B--- ---- ----", cpu::l_sflts),
    op!("l.sfles",  "rA,rB",    "1110 0101 101A AAAA BBBB B--- ---- ----", cpu::l_sfles),
];

/// The trap word planted by RSP memory breakpoints: l.trap 1.
pub const TRAP_INSN: u32 = 0x2100_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bit {
    Zero,
    One,
    DontCare,
    Letter(char),
}

/// pattern[i] describes instruction bit i (LSB first).
fn parse_encoding(encoding: &str) -> [Bit; 32] {
    let mut bits = Vec::with_capacity(32);
    for c in encoding.chars() {
        match c {
            ' ' => continue,
            '0' => bits.push(Bit::Zero),
            '1' => bits.push(Bit::One),
            '-' => bits.push(Bit::DontCare),
            c if c.is_ascii_alphabetic() => bits.push(Bit::Letter(c)),
            _ => panic!("bad encoding char {c:?}"),
        }
    }
    assert_eq!(bits.len(), 32, "encoding {encoding:?} is not 32 bits");
    let mut pattern = [Bit::DontCare; 32];
    for (i, b) in bits.iter().enumerate() {
        pattern[31 - i] = *b;
    }
    pattern
}

/// One contiguous bit field of an operand.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpField {
    /// Shift the instruction word right by this much to align the chunk.
    pub shr: u8,
    pub nbits: u8,
    /// Sign bit of the assembled operand; only meaningful with `sig`.
    pub sbit: u8,
    /// Final chunk of this operand.
    pub chunk_end: bool,
    /// Final field of the whole descriptor list.
    pub last: bool,
    pub reg: bool,
    pub sig: bool,
    /// Displacement immediate: combined with the register field that
    /// follows to form an effective address.
    pub dis: bool,
    pub dst: bool,
}

fn push_operand(
    fields: &mut Vec<OpField>,
    pattern: &[Bit; 32],
    letter: char,
    reg: bool,
    dst: bool,
    sig: bool,
    dis: bool,
) {
    // Chunks are collected least-significant first so split immediates
    // assemble low bits before high bits.
    let mut chunks = Vec::new();
    let mut pos = 0;
    while pos < 32 {
        if pattern[pos] == Bit::Letter(letter) {
            let start = pos;
            while pos < 32 && pattern[pos] == Bit::Letter(letter) {
                pos += 1;
            }
            chunks.push((start as u8, (pos - start) as u8));
        } else {
            pos += 1;
        }
    }
    assert!(!chunks.is_empty(), "operand letter {letter:?} not in encoding");
    let total: u8 = chunks.iter().map(|c| c.1).sum();
    let n = chunks.len();
    for (i, (shr, nbits)) in chunks.into_iter().enumerate() {
        let end = i == n - 1;
        fields.push(OpField {
            shr,
            nbits,
            sbit: total - 1,
            chunk_end: end,
            last: false,
            reg,
            sig: sig && end,
            dis,
            dst,
        });
    }
}

fn build_fields(args: &str, pattern: &[Bit; 32]) -> Vec<OpField> {
    let mut fields = Vec::new();
    let mut chars = args.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ',' | '(' | ')' => (),
            'r' => {
                let letter = chars.next().expect("register letter");
                push_operand(&mut fields, pattern, letter, true, letter == 'D', false, false);
            }
            'I' | 'K' | 'L' | 'N' => {
                let dis = chars.peek() == Some(&'(');
                let sig = c == 'I' || c == 'N';
                push_operand(&mut fields, pattern, c, false, false, sig, dis);
            }
            _ => panic!("bad operand char {c:?} in {args:?}"),
        }
    }
    if let Some(last) = fields.last_mut() {
        last.last = true;
    }
    fields
}

enum Node {
    Branch { bit: u8, zero: usize, one: usize },
    Leaf(Option<u16>),
}

pub struct DecodeTables {
    nodes: Vec<Node>,
    patterns: Vec<[Bit; 32]>,
    fields: Vec<Vec<OpField>>,
}

fn build_node(nodes: &mut Vec<Node>, patterns: &[[Bit; 32]], cands: &[usize], tested: u32) -> usize {
    if cands.is_empty() {
        nodes.push(Node::Leaf(None));
        return nodes.len() - 1;
    }
    // next untested bit that is fixed in at least one candidate, MSB first
    let mut pick = None;
    for bit in (0..32u8).rev() {
        if tested & (1 << bit) != 0 {
            continue;
        }
        if cands
            .iter()
            .any(|&c| matches!(patterns[c][bit as usize], Bit::Zero | Bit::One))
        {
            pick = Some(bit);
            break;
        }
    }
    let Some(bit) = pick else {
        // all fixed bits of the remaining candidates are verified
        debug_assert!(cands.len() == 1, "ambiguous encodings {cands:?}");
        nodes.push(Node::Leaf(Some(cands[0] as u16)));
        return nodes.len() - 1;
    };

    let zero_cands: Vec<usize> = cands
        .iter()
        .copied()
        .filter(|&c| patterns[c][bit as usize] != Bit::One)
        .collect();
    let one_cands: Vec<usize> = cands
        .iter()
        .copied()
        .filter(|&c| patterns[c][bit as usize] != Bit::Zero)
        .collect();

    let slot = nodes.len();
    nodes.push(Node::Leaf(None)); // placeholder
    let zero = build_node(nodes, patterns, &zero_cands, tested | (1 << bit));
    let one = build_node(nodes, patterns, &one_cands, tested | (1 << bit));
    nodes[slot] = Node::Branch { bit, zero, one };
    slot
}

static TABLES: OnceLock<DecodeTables> = OnceLock::new();

pub fn tables() -> &'static DecodeTables {
    TABLES.get_or_init(|| {
        let patterns: Vec<[Bit; 32]> = OR32_OPCODES
            .iter()
            .map(|op| parse_encoding(op.encoding))
            .collect();
        let fields: Vec<Vec<OpField>> = OR32_OPCODES
            .iter()
            .zip(patterns.iter())
            .map(|(op, pat)| build_fields(op.args, pat))
            .collect();
        let mut nodes = Vec::new();
        let all: Vec<usize> = (0..OR32_OPCODES.len()).collect();
        let root = build_node(&mut nodes, &patterns, &all, 0);
        assert_eq!(root, 0);
        DecodeTables {
            nodes,
            patterns,
            fields,
        }
    })
}

impl DecodeTables {
    /// Decode one word to its opcode index, or None for an illegal
    /// instruction.
    pub fn decode(&self, insn: u32) -> Option<usize> {
        let mut node = 0;
        loop {
            match &self.nodes[node] {
                Node::Branch { bit, zero, one } => {
                    node = if insn & (1 << bit) != 0 { *one } else { *zero };
                }
                Node::Leaf(idx) => return idx.map(|i| i as usize),
            }
        }
    }

    pub fn fields(&self, index: usize) -> &[OpField] {
        &self.fields[index]
    }

    /// Assemble an instruction word: fixed pattern bits plus operand values
    /// keyed by encoding letter. Used by tests and the monitor.
    pub fn encode(&self, index: usize, vals: &[(char, u32)]) -> u32 {
        let pattern = &self.patterns[index];
        let mut word = 0u32;
        for (bit, b) in pattern.iter().enumerate() {
            if *b == Bit::One {
                word |= 1 << bit;
            }
        }
        for &(letter, value) in vals {
            let mut consumed = 0;
            let mut pos = 0;
            while pos < 32 {
                if pattern[pos] == Bit::Letter(letter) {
                    let start = pos;
                    while pos < 32 && pattern[pos] == Bit::Letter(letter) {
                        pos += 1;
                    }
                    let nbits = pos - start;
                    let chunk = (value >> consumed) & ((1u64 << nbits) as u32).wrapping_sub(1);
                    word |= chunk << start;
                    consumed += nbits;
                } else {
                    pos += 1;
                }
            }
        }
        word
    }
}

/// Extract the raw (unsigned, then optionally sign-extended) value of the
/// operand whose chunk list starts at `fields[start]`.
pub fn eval_operand_val(insn: u32, fields: &[OpField], start: usize) -> u32 {
    let mut operand: u32 = 0;
    let mut nbits = 0u32;
    let mut idx = start;
    loop {
        let f = &fields[idx];
        let mask = ((1u64 << f.nbits) - 1) as u32;
        operand |= ((insn >> f.shr) & mask) << nbits;
        nbits += f.nbits as u32;
        if f.chunk_end {
            if f.sig && operand & (1 << f.sbit) != 0 {
                operand |= (!0u32) << f.sbit;
            }
            return operand;
        }
        idx += 1;
    }
}

/// Find the descriptor index where logical operand `op_no` starts.
/// Displacement register fields do not count as separate operands.
pub fn operand_start(fields: &[OpField], mut op_no: usize) -> usize {
    let mut idx = 0;
    while op_no > 0 {
        let f = &fields[idx];
        assert!(!f.last, "instruction requested more operands than it has");
        if f.chunk_end && !f.dis {
            op_no -= 1;
        }
        idx += 1;
    }
    idx
}

pub fn insn_name(index: usize) -> &'static str {
    OR32_OPCODES[index].name
}

pub fn index_of(name: &str) -> Option<usize> {
    OR32_OPCODES.iter().position(|op| op.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(name: &str, vals: &[(char, u32)]) -> u32 {
        let idx = index_of(name).unwrap();
        tables().encode(idx, vals)
    }

    #[test]
    fn decode_round_trips_every_opcode() {
        let t = tables();
        for (idx, op) in OR32_OPCODES.iter().enumerate() {
            // arbitrary but in-range operand values
            let word = t.encode(
                idx,
                &[('D', 3), ('A', 5), ('B', 7), ('I', 0x1234), ('K', 0x4321), ('L', 9), ('N', 0x155)],
            );
            assert_eq!(
                t.decode(word),
                Some(idx),
                "{} encoded as {word:#010x} did not decode to itself",
                op.name
            );
        }
    }

    #[test]
    fn known_words_decode() {
        let t = tables();
        assert_eq!(t.decode(0x1500_0000), index_of("l.nop"));
        assert_eq!(t.decode(TRAP_INSN), index_of("l.trap"));
        assert_eq!(t.decode(0x1800_0000), index_of("l.movhi")); // l.movhi r0,0
        assert_eq!(t.decode(0x2400_0000), index_of("l.rfe"));
        // a garbage opcode group is illegal
        assert_eq!(t.decode(0xffff_ffff), None);
        assert_eq!(t.decode(0x3c00_0000), None);
    }

    #[test]
    fn split_immediate_reassembles() {
        let t = tables();
        let idx = index_of("l.sw").unwrap();
        let word = enc("l.sw", &[('I', 0xffff_8004u32), ('A', 1), ('B', 2)]);
        assert_eq!(t.decode(word), Some(idx));
        let fields = t.fields(idx);
        let start = operand_start(fields, 0);
        assert!(fields[start].dis);
        assert_eq!(eval_operand_val(word, fields, start), 0xffff_8004);
    }

    #[test]
    fn signed_operands_extend() {
        let t = tables();
        let idx = index_of("l.addi").unwrap();
        let word = enc("l.addi", &[('D', 1), ('A', 2), ('I', 0xffff_fffe)]);
        let fields = t.fields(idx);
        let start = operand_start(fields, 2);
        assert_eq!(eval_operand_val(word, fields, start), 0xffff_fffe);
        // branch displacement: 26-bit sign extension
        let idx = index_of("l.bf").unwrap();
        let word = enc("l.bf", &[('N', (-2i32) as u32)]);
        assert_eq!(
            eval_operand_val(word, t.fields(idx), 0),
            (-2i32) as u32
        );
    }

    #[test]
    fn operand_counting_skips_displacement_register() {
        let t = tables();
        let idx = index_of("l.lwz").unwrap();
        let fields = t.fields(idx);
        // operand 0: rD (destination)
        let d = operand_start(fields, 0);
        assert!(fields[d].reg && fields[d].dst);
        // operand 1: the displacement
        let ea = operand_start(fields, 1);
        assert!(fields[ea].dis);
        // l.sw: operand 1 is rB, past the displacement pair
        let idx = index_of("l.sw").unwrap();
        let fields = t.fields(idx);
        let b = operand_start(fields, 1);
        assert!(fields[b].reg && !fields[b].dst);
        let word = enc("l.sw", &[('I', 0), ('A', 1), ('B', 17)]);
        assert_eq!(eval_operand_val(word, fields, b), 17);
    }

    #[test]
    fn nop_immediate_is_the_low_halfword() {
        let t = tables();
        let idx = index_of("l.nop").unwrap();
        let word = enc("l.nop", &[('K', 1)]);
        assert_eq!(word, 0x1500_0001);
        assert_eq!(eval_operand_val(word, t.fields(idx), 0), 1);
    }
}
