//! Operand liveness for one function body.
//!
//! Each instruction gets `BPI` bits: `BPI - 1` inline operand tomb bits
//! ("operand dies here") and one "result unused" bit. Instructions with more
//! operands than the inline budget point into an auxiliary bitmap via the
//! `special` table; conditional branches store their branch death lists the
//! same way.

use crate::ir::{Air, Inst, InstIdx, Ref};
use std::collections::{BTreeSet, HashMap};

/// Bits per instruction in the packed tomb table.
pub const BPI: u32 = 4;

const UNUSED_BIT: u32 = BPI - 1;

#[derive(Debug, Clone)]
pub struct Liveness {
    tomb_bits: Vec<u32>,
    extra: Vec<u32>,
    special: HashMap<InstIdx, u32>,
}

/// Death lists applied on entry to the branches of a conditional.
#[derive(Debug, Clone, Copy)]
pub struct CondBrDeaths<'a> {
    pub then_deaths: &'a [u32],
    pub else_deaths: &'a [u32],
}

/// Iterator over the death bits of an instruction with more operands than
/// the inline budget. Draws from the inline bits first, then the auxiliary
/// bitmap.
#[derive(Debug)]
pub struct BigTomb<'a> {
    inline_bits: u32,
    extra: &'a [u32],
    index: u32,
}

impl<'a> BigTomb<'a> {
    /// Death bit for the next operand.
    pub fn feed(&mut self) -> bool {
        let index = self.index;
        self.index += 1;
        if index < BPI - 1 {
            return self.inline_bits & (1 << index) != 0;
        }
        let bit = index - (BPI - 1);
        let word = (bit / 32) as usize;
        if word >= self.extra.len() {
            return false;
        }
        self.extra[word] & (1 << (bit % 32)) != 0
    }
}

impl Liveness {
    /// Compute liveness for `air` with a backward walk over its bodies.
    pub fn analyze(air: &Air) -> Liveness {
        let words = (air.inst_count() * BPI as usize + 31) / 32;
        let mut analysis = Analysis {
            air,
            tomb_bits: vec![0; words],
            extra: Vec::new(),
            special: HashMap::new(),
        };
        let mut live = BTreeSet::new();
        analysis.analyze_body(air.main_body(), &mut live);
        Liveness {
            tomb_bits: analysis.tomb_bits,
            extra: analysis.extra,
            special: analysis.special,
        }
    }

    /// The `BPI` packed bits of one instruction.
    pub fn get_tomb_bits(&self, inst: InstIdx) -> u32 {
        let (word, shift) = bit_position(inst);
        (self.tomb_bits[word] >> shift) & ((1 << BPI) - 1)
    }

    pub fn operand_dies(&self, inst: InstIdx, operand: u32) -> bool {
        if operand < BPI - 1 {
            return self.get_tomb_bits(inst) & (1 << operand) != 0;
        }
        let base = match self.special.get(&inst) {
            Some(base) => *base as usize,
            None => return false,
        };
        let bit = operand - (BPI - 1);
        let word_count = self.extra[base] as usize;
        let word = (bit / 32) as usize;
        if word >= word_count {
            return false;
        }
        self.extra[base + 1 + word] & (1 << (bit % 32)) != 0
    }

    /// Suppress a death that the caller has taken responsibility for.
    pub fn clear_operand_death(&mut self, inst: InstIdx, operand: u32) {
        if operand < BPI - 1 {
            let (word, shift) = bit_position(inst);
            self.tomb_bits[word] &= !(1 << (shift + operand));
            return;
        }
        if let Some(base) = self.special.get(&inst) {
            let base = *base as usize;
            let bit = operand - (BPI - 1);
            let word = (bit / 32) as usize;
            if word < self.extra[base] as usize {
                self.extra[base + 1 + word] &= !(1 << (bit % 32));
            }
        }
    }

    pub fn is_unused(&self, inst: InstIdx) -> bool {
        self.get_tomb_bits(inst) & (1 << UNUSED_BIT) != 0
    }

    pub fn get_cond_br(&self, inst: InstIdx) -> CondBrDeaths<'_> {
        let base = match self.special.get(&inst) {
            Some(base) => *base as usize,
            None => return CondBrDeaths { then_deaths: &[], else_deaths: &[] },
        };
        let then_count = self.extra[base] as usize;
        let else_count = self.extra[base + 1] as usize;
        let then_start = base + 2;
        let else_start = then_start + then_count;
        CondBrDeaths {
            then_deaths: &self.extra[then_start..else_start],
            else_deaths: &self.extra[else_start..else_start + else_count],
        }
    }

    /// Index of `inst`'s payload in the auxiliary array, if it has one.
    pub fn special(&self, inst: InstIdx) -> Option<u32> {
        self.special.get(&inst).cloned()
    }

    /// Death-bit iterator for instructions whose operand count exceeds the
    /// inline budget.
    pub fn big_tomb(&self, inst: InstIdx) -> BigTomb<'_> {
        let extra = match self.special.get(&inst) {
            Some(base) => {
                let base = *base as usize;
                let word_count = self.extra[base] as usize;
                &self.extra[base + 1..base + 1 + word_count]
            }
            None => &[][..],
        };
        BigTomb { inline_bits: self.get_tomb_bits(inst), extra, index: 0 }
    }
}

fn bit_position(inst: InstIdx) -> (usize, u32) {
    let bit = inst.0 * BPI;
    ((bit / 32) as usize, bit % 32)
}

struct Analysis<'a> {
    air: &'a Air,
    tomb_bits: Vec<u32>,
    extra: Vec<u32>,
    special: HashMap<InstIdx, u32>,
}

impl<'a> Analysis<'a> {
    fn analyze_body(&mut self, body: &'a [InstIdx], live: &mut BTreeSet<InstIdx>) {
        let air = self.air;
        for &inst in body.iter().rev() {
            match air.get(inst) {
                Inst::CondBr { cond, then_body, else_body } => {
                    let mut live_then = live.clone();
                    self.analyze_body(then_body, &mut live_then);
                    let mut live_else = live.clone();
                    self.analyze_body(else_body, &mut live_else);

                    // A value needed by only one branch dies on entry to the
                    // other.
                    let then_deaths: Vec<u32> =
                        live_else.difference(&live_then).map(|i| i.0).collect();
                    let else_deaths: Vec<u32> =
                        live_then.difference(&live_else).map(|i| i.0).collect();
                    let base = self.extra.len() as u32;
                    self.extra.push(then_deaths.len() as u32);
                    self.extra.push(else_deaths.len() as u32);
                    self.extra.extend(then_deaths);
                    self.extra.extend(else_deaths);
                    self.special.insert(inst, base);

                    *live = &live_then | &live_else;
                    if let Ref::Inst(cond_inst) = *cond {
                        if live.insert(cond_inst) {
                            self.set_tomb_bit(inst, 0);
                        }
                    }
                    // No-return result; nothing can observe it.
                    self.set_tomb_bit(inst, UNUSED_BIT);
                }
                Inst::Loop { body: loop_body } => {
                    // Values flowing into the loop are needed again on the
                    // back edge, so they must not die inside it.
                    let mut defs = BTreeSet::new();
                    collect_defs(air, loop_body, &mut defs);
                    let mut uses = BTreeSet::new();
                    collect_uses(air, loop_body, &mut uses);
                    for used in uses.difference(&defs) {
                        live.insert(*used);
                    }
                    self.analyze_body(loop_body, live);
                    self.set_tomb_bit(inst, UNUSED_BIT);
                }
                Inst::Block { body: block_body, .. } => {
                    live.remove(&inst);
                    self.analyze_body(block_body, live);
                }
                data => {
                    let was_live = live.remove(&inst);
                    let noreturn = match data {
                        Inst::Ret { .. } | Inst::RetLoad { .. } | Inst::Br { .. }
                        | Inst::SwitchBr { .. } | Inst::Unreach => true,
                        _ => false,
                    };
                    if noreturn || (!was_live && !data.has_side_effects()) {
                        self.set_tomb_bit(inst, UNUSED_BIT);
                    }
                    let operands = data.operands();
                    let mut deaths = Vec::with_capacity(operands.len());
                    for operand in &operands {
                        deaths.push(match operand {
                            Ref::Inst(op_inst) => live.insert(*op_inst),
                            Ref::Value(_) => false,
                        });
                    }
                    for (i, dies) in deaths.iter().enumerate().take((BPI - 1) as usize) {
                        if *dies {
                            self.set_tomb_bit(inst, i as u32);
                        }
                    }
                    if deaths.len() > (BPI - 1) as usize {
                        self.push_big_tomb(inst, &deaths[(BPI - 1) as usize..]);
                    }
                }
            }
        }
    }

    fn set_tomb_bit(&mut self, inst: InstIdx, bit: u32) {
        let (word, shift) = bit_position(inst);
        self.tomb_bits[word] |= 1 << (shift + bit);
    }

    fn push_big_tomb(&mut self, inst: InstIdx, deaths: &[bool]) {
        let word_count = (deaths.len() + 31) / 32;
        let base = self.extra.len() as u32;
        self.extra.push(word_count as u32);
        self.extra.extend(std::iter::repeat(0).take(word_count));
        for (i, dies) in deaths.iter().enumerate() {
            if *dies {
                let word = base as usize + 1 + i / 32;
                self.extra[word] |= 1 << (i % 32);
            }
        }
        self.special.insert(inst, base);
        log::debug!("{}: {} extended tomb bits", inst, deaths.len());
    }
}

fn collect_defs(air: &Air, body: &[InstIdx], defs: &mut BTreeSet<InstIdx>) {
    for &inst in body {
        defs.insert(inst);
        match air.get(inst) {
            Inst::Block { body, .. } | Inst::Loop { body } => collect_defs(air, body, defs),
            Inst::CondBr { then_body, else_body, .. } => {
                collect_defs(air, then_body, defs);
                collect_defs(air, else_body, defs);
            }
            _ => {}
        }
    }
}

fn collect_uses(air: &Air, body: &[InstIdx], uses: &mut BTreeSet<InstIdx>) {
    for &inst in body {
        let data = air.get(inst);
        for operand in data.operands() {
            if let Ref::Inst(op_inst) = operand {
                uses.insert(op_inst);
            }
        }
        match data {
            Inst::Block { body, .. } | Inst::Loop { body } => collect_uses(air, body, uses),
            Inst::CondBr { then_body, else_body, .. } => {
                collect_uses(air, then_body, uses);
                collect_uses(air, else_body, uses);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Builder;
    use crate::types::Type;
    use crate::value::TypedValue;

    fn int_const(b: &mut Builder, x: u64) -> Ref {
        b.value(TypedValue::int(Type::i32(), x))
    }

    #[test]
    fn straight_line_deaths_mark_last_uses() {
        let mut b = Builder::new();
        let x = b.push(Inst::Arg { ty: Type::i32(), name: "x".to_string() });
        let one = int_const(&mut b, 1);
        let sum = b.push(Inst::Add { lhs: Ref::Inst(x), rhs: one });
        let double = b.push(Inst::Add { lhs: Ref::Inst(sum), rhs: Ref::Inst(sum) });
        let ret = b.push(Inst::Ret { operand: Some(Ref::Inst(double)) });
        let air = b.finish(vec![x, sum, double, ret]);
        let liveness = Liveness::analyze(&air);

        // x's last use is the first add.
        assert!(liveness.operand_dies(sum, 0));
        // sum dies at the second add, on the first of its two uses.
        assert!(liveness.operand_dies(double, 0));
        assert!(!liveness.operand_dies(double, 1));
        assert!(liveness.operand_dies(ret, 0));
        assert!(!liveness.is_unused(sum));
    }

    #[test]
    fn unused_pure_results_are_flagged() {
        let mut b = Builder::new();
        let x = b.push(Inst::Arg { ty: Type::i32(), name: "x".to_string() });
        let one = int_const(&mut b, 1);
        let dead_sum = b.push(Inst::Add { lhs: Ref::Inst(x), rhs: one });
        let ret = b.push(Inst::Ret { operand: Some(Ref::Inst(x)) });
        let air = b.finish(vec![x, dead_sum, ret]);
        let liveness = Liveness::analyze(&air);

        assert!(liveness.is_unused(dead_sum));
        // The ret, not the dead add, is x's last use.
        assert!(!liveness.operand_dies(dead_sum, 0));
        assert!(liveness.operand_dies(ret, 0));
    }

    #[test]
    fn cond_br_records_one_sided_deaths() {
        let mut b = Builder::new();
        let cond = b.push(Inst::Arg { ty: Type::Bool, name: "c".to_string() });
        let x = b.push(Inst::Arg { ty: Type::i32(), name: "x".to_string() });
        let one = int_const(&mut b, 1);
        // x is used in the then branch only.
        let then_add = b.push(Inst::Add { lhs: Ref::Inst(x), rhs: one });
        let then_ret = b.push(Inst::Ret { operand: Some(Ref::Inst(then_add)) });
        let else_ret = b.push(Inst::Ret { operand: Some(one) });
        let br = b.push(Inst::CondBr {
            cond: Ref::Inst(cond),
            then_body: vec![then_add, then_ret],
            else_body: vec![else_ret],
        });
        let air = b.finish(vec![cond, x, br]);
        let liveness = Liveness::analyze(&air);

        let deaths = liveness.get_cond_br(br);
        assert_eq!(deaths.then_deaths, &[] as &[u32]);
        assert_eq!(deaths.else_deaths, &[x.0]);
        // The condition's last use is the branch itself.
        assert!(liveness.operand_dies(br, 0));
    }

    #[test]
    fn loop_bound_values_never_die_inside() {
        let mut b = Builder::new();
        let x = b.push(Inst::Arg { ty: Type::i32(), name: "x".to_string() });
        let one = int_const(&mut b, 1);
        let body_add = b.push(Inst::Add { lhs: Ref::Inst(x), rhs: one });
        let lp = b.push(Inst::Loop { body: vec![body_add] });
        let air = b.finish(vec![x, lp]);
        let liveness = Liveness::analyze(&air);

        assert!(!liveness.operand_dies(body_add, 0));
        // The add's own result is unused within the loop.
        assert!(liveness.is_unused(body_add));
    }

    #[test]
    fn calls_with_many_operands_use_the_auxiliary_bitmap() {
        let mut b = Builder::new();
        let fn_ty = Type::Fn(Box::new(crate::types::FnInfo {
            params: vec![Type::i32(); 5],
            ret: Type::Void,
            cc: crate::types::CallConv::C,
        }));
        let callee = b.value(TypedValue::new(fn_ty, crate::value::Value::Function(0)));
        let args: Vec<InstIdx> = (0..5)
            .map(|i| b.push(Inst::Arg { ty: Type::i32(), name: format!("a{}", i) }))
            .collect();
        let call = b.push(Inst::Call {
            callee,
            args: args.iter().map(|a| Ref::Inst(*a)).collect(),
        });
        let mut body: Vec<InstIdx> = args.clone();
        body.push(call);
        let air = b.finish(body);
        let liveness = Liveness::analyze(&air);

        // Operand 0 is the callee constant; all five args die at the call.
        let mut bt = liveness.big_tomb(call);
        assert!(!bt.feed());
        for _ in 0..5 {
            assert!(bt.feed());
        }
        assert!(liveness.operand_dies(call, 4));
    }
}
