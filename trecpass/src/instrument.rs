//! The instrumentation engine.
//!
//! For every eligible function in a module the engine allocates a function
//! identifier from the catalog and brackets the function with
//! `__trec_perf_enter`/`__trec_perf_exit` calls: one enter at the entry
//! block's first insertion point, one exit at every escape point (return,
//! exception resume, or non-returning tail call).
//!
//! With the fine path enabled (the default) the engine additionally clones
//! the function's entire block graph and prepends a dispatcher block that
//! calls `__trec_perf_record_bbl(fid)` and branches to the clone on a
//! non-zero result, to the untouched original otherwise. Each cloned block
//! is bracketed with enter/exit probes carrying a basic-block identifier
//! recorded against the block's source-line range. Keeping the block probes
//! on a clone means the cold path keeps its original schedule; whether the
//! clone ever runs is the runtime's decision, made per call.
//!
//! Probe insertion order matters: the function-level probes go in last, so
//! the enter probe lands ahead of everything else in the original entry
//! block and runs exactly once whenever the dispatcher routes control there.

use crate::{
    catalog::Catalog,
    errors::CatalogError,
    ids,
    ir::{BlockIdx, DeclIdx, Function, FuncIdx, Inst, InstIdx, Module, Operand},
    log::log_instr,
};
use std::collections::HashMap;

/// The synthetic constructor this engine inserts into every module.
pub const MODULE_CTOR: &str = "trec.module_ctor";
/// The runtime initialiser the constructor calls.
pub const INIT_FN: &str = "__trec_init";
/// The probe symbols, in the order (enter, exit, dispatcher predicate).
pub const ENTER_FN: &str = "__trec_perf_enter";
pub const EXIT_FN: &str = "__trec_perf_exit";
pub const RECORD_BBL_FN: &str = "__trec_perf_record_bbl";

/// Functions whose debug file path contains this are C++ standard library
/// code and are never instrumented.
const STDLIB_FRAGMENT: &str = "include/c++";

/// Engine knobs.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Clone each function and probe the clone's basic blocks.
    pub fine: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { fine: true }
    }
}

/// The declared probe callees of the module under rewrite.
struct Probes {
    enter: DeclIdx,
    exit: DeclIdx,
    record_bbl: DeclIdx,
}

impl Probes {
    fn declare(m: &mut Module) -> Self {
        Self {
            enter: m.ensure_decl(ENTER_FN, false, true),
            exit: m.ensure_decl(EXIT_FN, false, true),
            record_bbl: m.ensure_decl(RECORD_BBL_FN, true, true),
        }
    }
}

/// What a function looks like to the catalog.
struct Target {
    name: String,
    file: String,
    line: u32,
}

/// A point where control leaves the function.
struct Escape {
    block: BlockIdx,
    kind: EscapeKind,
}

enum EscapeKind {
    /// Insert ahead of the block's terminator (return or resume).
    Terminator,
    /// Insert ahead of the tail call preceding an `unreachable`.
    TailCall,
}

/// The instrumentation engine. Owns the catalog slot for its lifetime; the
/// slot is released when the engine is dropped.
pub struct Engine {
    catalog: Catalog,
    config: EngineConfig,
}

impl Engine {
    pub fn new(catalog: Catalog) -> Self {
        Self::with_config(catalog, EngineConfig::default())
    }

    pub fn with_config(catalog: Catalog, config: EngineConfig) -> Self {
        Self { catalog, config }
    }

    /// The job slot all identifiers emitted by this engine carry.
    pub fn slot(&self) -> u16 {
        self.catalog.slot()
    }

    /// Rewrite `m` in place, inserting the module constructor and probing
    /// every eligible function.
    pub fn instrument_module(&mut self, m: &mut Module) -> Result<(), CatalogError> {
        ensure_module_ctor(m);
        let probes = Probes::declare(m);
        for i in 0..m.num_funcs() {
            self.instrument_function(m, FuncIdx::new(i), &probes)?;
        }
        Ok(())
    }

    fn instrument_function(
        &mut self,
        m: &mut Module,
        fidx: FuncIdx,
        probes: &Probes,
    ) -> Result<bool, CatalogError> {
        let Some(target) = target_of(m.func(fidx), probes) else {
            return Ok(false);
        };

        self.catalog.begin_batch()?;
        let file_id = self.catalog.file_id(&target.file)?;
        let func_id = self
            .catalog
            .func_id(&format!("{}: {}", target.name, target.line))?;
        let fid = ids::compose_fid(self.catalog.slot(), file_id, func_id)?;
        self.catalog.commit_batch()?;

        log_instr(&format!(
            "instr {}() line {} fid {fid}",
            target.name, target.line
        ));

        let f = m.func_mut(fidx);
        let orig_layout: Vec<BlockIdx> = f.layout().to_vec();
        let entry = orig_layout[0];
        let escapes = find_escapes(f, &orig_layout);

        if self.config.fine {
            let clones = clone_blocks(f, &orig_layout);

            let dispatcher = f.append_block();
            let pred = f.push_inst(
                dispatcher,
                Inst::Call {
                    callee: probes.record_bbl,
                    args: vec![Operand::Const(fid as i64)],
                    tail: false,
                },
                None,
            );
            f.push_inst(
                dispatcher,
                Inst::CondBr {
                    cond: Operand::Local(pred),
                    true_dest: clones[0],
                    false_dest: entry,
                },
                None,
            );
            f.set_entry(dispatcher);

            for &cb in &clones {
                self.instrument_block(f, cb, fid, probes)?;
            }
        }

        // Function-level probes go in last (see the module comment).
        let pos = f.first_insertion_point(entry);
        f.insert_inst(
            entry,
            pos,
            Inst::Call {
                callee: probes.enter,
                args: vec![Operand::Const(fid as i64)],
                tail: false,
            },
            None,
        );
        for esc in &escapes {
            let len = f.block(esc.block).insts().len();
            let pos = match esc.kind {
                EscapeKind::Terminator => len - 1,
                EscapeKind::TailCall => len - 2,
            };
            f.insert_inst(
                esc.block,
                pos,
                Inst::Call {
                    callee: probes.exit,
                    args: vec![Operand::Const(fid as i64)],
                    tail: false,
                },
                None,
            );
        }
        Ok(true)
    }

    /// Bracket one cloned block with enter/exit probes, provided the block
    /// has a usable source-line range.
    ///
    /// The enter line is the first non-zero line scanning forward from the
    /// first insertion point; the exit line the first non-zero line scanning
    /// backward from the terminator. A block where either scan comes up
    /// empty, or where the scans meet, keeps its function-level probes but
    /// gets no block probes.
    fn instrument_block(
        &mut self,
        f: &mut Function,
        b: BlockIdx,
        fid: u64,
        probes: &Probes,
    ) -> Result<(), CatalogError> {
        let insts = f.block(b).insts().to_vec();
        if insts.is_empty() {
            return Ok(());
        }
        let first = f.first_insertion_point(b);
        let term = insts.len() - 1;
        if first > term {
            return Ok(());
        }

        let line_at =
            |f: &Function, p: usize| f.inst_data(insts[p]).dloc.map(|d| d.line).unwrap_or(0);

        let mut ep = first;
        let mut enter_line = line_at(f, ep);
        while ep != term && enter_line == 0 {
            ep += 1;
            enter_line = line_at(f, ep);
        }

        let mut xp = term;
        let mut exit_line = line_at(f, xp);
        while xp != ep && exit_line == 0 {
            xp -= 1;
            exit_line = line_at(f, xp);
        }

        if ep == xp || enter_line == 0 || exit_line == 0 {
            return Ok(());
        }

        let bbid = self.catalog.record_basic_block(fid, enter_line, exit_line)?;

        // Exit first so the insertion at `term` cannot disturb `first`.
        f.insert_inst(
            b,
            term,
            Inst::Call {
                callee: probes.exit,
                args: vec![Operand::Const(bbid as i64)],
                tail: false,
            },
            None,
        );
        f.insert_inst(
            b,
            first,
            Inst::Call {
                callee: probes.enter,
                args: vec![Operand::Const(bbid as i64)],
                tail: false,
            },
            None,
        );
        Ok(())
    }
}

/// Insert `trec.module_ctor` (a call to `__trec_init` followed by a return)
/// and register it at ctor priority 0. A module that already has the
/// constructor is left alone.
fn ensure_module_ctor(m: &mut Module) {
    if m.func_by_name(MODULE_CTOR).is_some() {
        return;
    }
    let init = m.ensure_decl(INIT_FN, false, true);
    let mut ctor = Function::new(MODULE_CTOR, None);
    let b = ctor.append_block();
    ctor.push_inst(
        b,
        Inst::Call {
            callee: init,
            args: Vec::new(),
            tail: false,
        },
        None,
    );
    ctor.push_inst(b, Inst::Ret { value: None }, None);
    let fidx = m.add_func(ctor);
    m.add_ctor(fidx, 0);
}

/// Decide whether `f` is instrumented at all, and if so under which catalog
/// names. `None` means skip: declarations, the module constructor, compiler
/// internals, functions without source debug info, and standard library
/// code. A function that already calls into the probe ABI is also skipped,
/// so re-running the engine cannot double-wrap it.
fn target_of(f: &Function, probes: &Probes) -> Option<Target> {
    if f.is_declaration() {
        return None;
    }
    if f.name() == MODULE_CTOR || f.name().starts_with("__cxx") {
        return None;
    }
    let sp = f.subprogram()?;
    let file = sp.file.as_ref()?;
    let path = file.path();
    if path.contains(STDLIB_FRAGMENT) {
        return None;
    }
    if references_probes(f, probes) {
        return None;
    }
    Some(Target {
        name: sp.name.clone(),
        file: path,
        line: sp.line,
    })
}

fn references_probes(f: &Function, probes: &Probes) -> bool {
    f.layout().iter().any(|&b| {
        f.block(b).insts().iter().any(|&i| match f.inst(i) {
            Inst::Call { callee, .. } => {
                *callee == probes.enter || *callee == probes.exit || *callee == probes.record_bbl
            }
            _ => false,
        })
    })
}

fn find_escapes(f: &Function, blocks: &[BlockIdx]) -> Vec<Escape> {
    let mut out = Vec::new();
    for &b in blocks {
        let insts = f.block(b).insts();
        match insts.last().map(|&i| f.inst(i)) {
            Some(Inst::Ret { .. }) | Some(Inst::Resume { .. }) => out.push(Escape {
                block: b,
                kind: EscapeKind::Terminator,
            }),
            Some(Inst::Unreachable) if insts.len() >= 2 => {
                if let Inst::Call { tail: true, .. } = f.inst(insts[insts.len() - 2]) {
                    out.push(Escape {
                        block: b,
                        kind: EscapeKind::TailCall,
                    });
                }
            }
            _ => (),
        }
    }
    out
}

/// Clone `orig`'s blocks into fresh arena nodes and rewire the clones so
/// they form a parallel graph.
///
/// Three passes over stable arena indices:
///
///  1. clone every instruction, building the value map (original [InstIdx]
///     to clone) and the block map;
///  2. rewire every non-phi clone: local operands through the value map,
///     block operands through the block map, metadata wrappers re-wrapped
///     around the mapped value;
///  3. patch phi nodes: incoming predecessor blocks first, then incoming
///     values.
///
/// Operands that resolve to neither map (values defined outside the cloned
/// region, external declarations, constants) are left untouched.
fn clone_blocks(f: &mut Function, orig: &[BlockIdx]) -> Vec<BlockIdx> {
    let mut vmap: HashMap<InstIdx, InstIdx> = HashMap::new();
    let mut bmap: HashMap<BlockIdx, BlockIdx> = HashMap::new();
    let mut clones = Vec::with_capacity(orig.len());

    for &ob in orig {
        let nb = f.append_block();
        bmap.insert(ob, nb);
        for oi in f.block(ob).insts().to_vec() {
            let data = f.inst_data(oi).clone();
            let ni = f.push_inst_data(nb, data);
            vmap.insert(oi, ni);
        }
        clones.push(nb);
    }

    for &nb in &clones {
        for ni in f.block(nb).insts().to_vec() {
            if f.inst(ni).is_phi() {
                continue;
            }
            remap_inst(f.inst_mut(ni), &vmap, &bmap);
        }
    }

    for &nb in &clones {
        for ni in f.block(nb).insts().to_vec() {
            if let Inst::Phi { incoming } = f.inst_mut(ni) {
                for (v, pred) in incoming.iter_mut() {
                    if let Some(&np) = bmap.get(pred) {
                        *pred = np;
                    }
                    remap_operand(v, &vmap, &bmap);
                }
            }
        }
    }

    clones
}

fn remap_operand(
    op: &mut Operand,
    vmap: &HashMap<InstIdx, InstIdx>,
    bmap: &HashMap<BlockIdx, BlockIdx>,
) {
    match op {
        Operand::Local(i) => {
            if let Some(&n) = vmap.get(i) {
                *i = n;
            }
        }
        Operand::Block(b) => {
            if let Some(&n) = bmap.get(b) {
                *b = n;
            }
        }
        Operand::MetaValue(i) => {
            if let Some(&n) = vmap.get(i) {
                // A fresh wrapper around the mapped value; the original
                // block keeps its own.
                *op = Operand::MetaValue(n);
            }
        }
        Operand::Const(_) | Operand::Func(_) => (),
    }
}

fn remap_inst(
    inst: &mut Inst,
    vmap: &HashMap<InstIdx, InstIdx>,
    bmap: &HashMap<BlockIdx, BlockIdx>,
) {
    let map_block = |b: &mut BlockIdx| {
        if let Some(&n) = bmap.get(b) {
            *b = n;
        }
    };
    match inst {
        Inst::Op { operands, .. } => {
            for op in operands {
                remap_operand(op, vmap, bmap);
            }
        }
        Inst::Call { args, .. } => {
            for a in args {
                remap_operand(a, vmap, bmap);
            }
        }
        Inst::DbgValue { value, .. } => remap_operand(value, vmap, bmap),
        Inst::Br { dest } => map_block(dest),
        Inst::CondBr {
            cond,
            true_dest,
            false_dest,
        } => {
            remap_operand(cond, vmap, bmap);
            map_block(true_dest);
            map_block(false_dest);
        }
        Inst::Switch {
            value,
            default,
            cases,
        } => {
            remap_operand(value, vmap, bmap);
            map_block(default);
            for (_, b) in cases {
                map_block(b);
            }
        }
        Inst::Ret { value: Some(v) } => remap_operand(v, vmap, bmap),
        Inst::Resume { value } => remap_operand(value, vmap, bmap),
        Inst::Phi { .. } | Inst::Ret { value: None } | Inst::Unreachable => (),
    }
}
