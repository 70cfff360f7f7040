//! The IR the instrumentation engine rewrites.
//!
//! A [Module] owns functions, external declarations and a global-constructor
//! list. Within a [Function], basic blocks and instructions both live in
//! arenas and are addressed by the index newtypes [BlockIdx] and [InstIdx];
//! a block is an ordered list of instruction indices and the function's
//! [Function::layout] gives block order, with the entry block first.
//!
//! Keeping instructions in an arena means cloning a control-flow graph never
//! invalidates an index: the clone pass appends nodes and records an
//! old-index to new-index mapping, and a second pass rewires the appended
//! nodes through that mapping. Nothing ever moves.
//!
//! Values are SSA-ish: an instruction that produces a value *is* that value,
//! and operands refer to it by its [InstIdx]. Debug-value metadata wraps a
//! value in [Operand::MetaValue]; the wrapper is distinct from a plain use
//! and is never shared between a block and its clone.
//!
//! The `Display` implementations produce a textual dump of the IR for
//! instrumentation logs and tests.

use std::fmt;

macro_rules! index_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            pub fn new(v: usize) -> Self {
                Self(v)
            }

            pub fn usize(&self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

index_type!(
    /// Index of a function in its module.
    FuncIdx
);
index_type!(
    /// Index of a basic block in its function's block arena.
    BlockIdx
);
index_type!(
    /// Index of an instruction in its function's instruction arena.
    InstIdx
);
index_type!(
    /// Index of an external declaration in its module.
    DeclIdx
);

/// A source file as reported by debug info: directory and basename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub dir: String,
    pub name: String,
}

impl SourceFile {
    pub fn new(dir: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    /// The absolute path, directory and basename joined.
    pub fn path(&self) -> String {
        if self.dir.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.dir.trim_end_matches('/'), self.name)
        }
    }
}

/// Debug information attached to a function definition.
#[derive(Clone, Debug)]
pub struct Subprogram {
    /// The unmangled name.
    pub name: String,
    /// The defining file, if debug info recorded one.
    pub file: Option<SourceFile>,
    /// The definition line.
    pub line: u32,
}

/// A source location attached to an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugLoc {
    pub line: u32,
    pub col: u32,
}

impl DebugLoc {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

/// An operand of an instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    /// The value produced by another instruction.
    Local(InstIdx),
    /// A basic block, as referenced by branch targets and switch cases.
    Block(BlockIdx),
    /// An integer constant.
    Const(i64),
    /// An external declaration (e.g. the callee of a call).
    Func(DeclIdx),
    /// A metadata wrapper around a local value, as used by debug-value
    /// intrinsics. Remapping produces a fresh wrapper.
    MetaValue(InstIdx),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::Local(i) => write!(f, "%{i}"),
            Operand::Block(b) => write!(f, "bb{b}"),
            Operand::Const(c) => write!(f, "{c}"),
            Operand::Func(d) => write!(f, "@{d}"),
            Operand::MetaValue(i) => write!(f, "meta(%{i})"),
        }
    }
}

/// Opcodes for ordinary (non-control, non-phi) operations.
///
/// The engine does not interpret these; they exist so modules under test can
/// contain a plausible variety of value-producing instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Alloca,
    Load,
    Store,
    Add,
    Sub,
    Mul,
    Icmp,
    Gep,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format!("{self:?}").to_lowercase())
    }
}

/// An instruction.
#[derive(Clone, Debug)]
pub enum Inst {
    /// An ordinary operation.
    Op { opcode: Opcode, operands: Vec<Operand> },
    /// A phi node: one `(value, predecessor)` pair per incoming edge.
    Phi { incoming: Vec<(Operand, BlockIdx)> },
    /// A call to an external declaration.
    Call {
        callee: DeclIdx,
        args: Vec<Operand>,
        tail: bool,
    },
    /// A debug-value intrinsic; `value` is normally a [Operand::MetaValue].
    DbgValue { value: Operand, var: String },
    /// Unconditional branch.
    Br { dest: BlockIdx },
    /// Conditional branch.
    CondBr {
        cond: Operand,
        true_dest: BlockIdx,
        false_dest: BlockIdx,
    },
    /// Multi-way branch.
    Switch {
        value: Operand,
        default: BlockIdx,
        cases: Vec<(i64, BlockIdx)>,
    },
    /// Return from the function.
    Ret { value: Option<Operand> },
    /// Resume exception propagation.
    Resume { value: Operand },
    /// No successors; ends a block after a non-returning call.
    Unreachable,
}

impl Inst {
    pub fn is_phi(&self) -> bool {
        matches!(self, Inst::Phi { .. })
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Inst::Br { .. }
                | Inst::CondBr { .. }
                | Inst::Switch { .. }
                | Inst::Ret { .. }
                | Inst::Resume { .. }
                | Inst::Unreachable
        )
    }
}

/// An instruction plus its (optional) source location.
#[derive(Clone, Debug)]
pub struct InstData {
    pub inst: Inst,
    pub dloc: Option<DebugLoc>,
}

/// A basic block: an ordered list of arena indices.
#[derive(Clone, Debug, Default)]
pub struct Block {
    insts: Vec<InstIdx>,
}

impl Block {
    pub fn insts(&self) -> &[InstIdx] {
        &self.insts
    }
}

/// A function definition (or, with no blocks, a declaration).
#[derive(Debug)]
pub struct Function {
    name: String,
    subprogram: Option<Subprogram>,
    insts: Vec<InstData>,
    blocks: Vec<Block>,
    layout: Vec<BlockIdx>,
}

impl Function {
    pub fn new(name: impl Into<String>, subprogram: Option<Subprogram>) -> Self {
        Self {
            name: name.into(),
            subprogram,
            insts: Vec::new(),
            blocks: Vec::new(),
            layout: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subprogram(&self) -> Option<&Subprogram> {
        self.subprogram.as_ref()
    }

    /// A function with no body is a declaration.
    pub fn is_declaration(&self) -> bool {
        self.layout.is_empty()
    }

    /// The entry block. Undefined for declarations.
    pub fn entry(&self) -> BlockIdx {
        self.layout[0]
    }

    /// Append an empty block to the arena and to the end of the layout.
    pub fn append_block(&mut self) -> BlockIdx {
        let b = BlockIdx::new(self.blocks.len());
        self.blocks.push(Block::default());
        self.layout.push(b);
        b
    }

    /// Make `b` the entry block, moving it to the front of the layout.
    pub fn set_entry(&mut self, b: BlockIdx) {
        self.layout.retain(|&x| x != b);
        self.layout.insert(0, b);
    }

    pub fn layout(&self) -> &[BlockIdx] {
        &self.layout
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, b: BlockIdx) -> &Block {
        &self.blocks[b.usize()]
    }

    pub fn inst(&self, i: InstIdx) -> &Inst {
        &self.insts[i.usize()].inst
    }

    pub fn inst_mut(&mut self, i: InstIdx) -> &mut Inst {
        &mut self.insts[i.usize()].inst
    }

    pub fn inst_data(&self, i: InstIdx) -> &InstData {
        &self.insts[i.usize()]
    }

    /// Push an instruction into the arena and onto the end of block `b`.
    pub fn push_inst(&mut self, b: BlockIdx, inst: Inst, dloc: Option<DebugLoc>) -> InstIdx {
        self.push_inst_data(b, InstData { inst, dloc })
    }

    /// As [Function::push_inst], for an already-assembled [InstData].
    pub fn push_inst_data(&mut self, b: BlockIdx, data: InstData) -> InstIdx {
        let i = InstIdx::new(self.insts.len());
        self.insts.push(data);
        self.blocks[b.usize()].insts.push(i);
        i
    }

    /// Push an instruction into the arena and insert it at position `pos`
    /// within block `b`.
    pub fn insert_inst(
        &mut self,
        b: BlockIdx,
        pos: usize,
        inst: Inst,
        dloc: Option<DebugLoc>,
    ) -> InstIdx {
        let i = InstIdx::new(self.insts.len());
        self.insts.push(InstData { inst, dloc });
        self.blocks[b.usize()].insts.insert(pos, i);
        i
    }

    /// The position of the first insertion point of `b`: past any leading
    /// phi nodes.
    pub fn first_insertion_point(&self, b: BlockIdx) -> usize {
        self.blocks[b.usize()]
            .insts
            .iter()
            .position(|&i| !self.inst(i).is_phi())
            .unwrap_or(self.blocks[b.usize()].insts.len())
    }

    /// The terminator of `b`, if the block is non-empty.
    pub fn terminator(&self, b: BlockIdx) -> Option<&Inst> {
        self.blocks[b.usize()].insts.last().map(|&i| self.inst(i))
    }
}

/// An external function declaration.
#[derive(Clone, Debug)]
pub struct Decl {
    pub name: String,
    /// Whether calls to this declaration produce a value.
    pub returns_value: bool,
    /// Whether the declaration is marked non-unwinding.
    pub nounwind: bool,
}

/// An entry in the module's global-constructor list.
#[derive(Clone, Copy, Debug)]
pub struct Ctor {
    pub func: FuncIdx,
    pub priority: u16,
}

/// The top-level IR container for one translation unit.
#[derive(Debug, Default)]
pub struct Module {
    name: String,
    funcs: Vec<Function>,
    decls: Vec<Decl>,
    ctors: Vec<Ctor>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_funcs(&self) -> usize {
        self.funcs.len()
    }

    pub fn func(&self, f: FuncIdx) -> &Function {
        &self.funcs[f.usize()]
    }

    pub fn func_mut(&mut self, f: FuncIdx) -> &mut Function {
        &mut self.funcs[f.usize()]
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncIdx> {
        self.funcs
            .iter()
            .position(|f| f.name == name)
            .map(FuncIdx::new)
    }

    pub fn add_func(&mut self, f: Function) -> FuncIdx {
        self.funcs.push(f);
        FuncIdx::new(self.funcs.len() - 1)
    }

    /// Find or insert an external declaration, `getOrInsertFunction` style.
    pub fn ensure_decl(&mut self, name: &str, returns_value: bool, nounwind: bool) -> DeclIdx {
        if let Some(i) = self.decls.iter().position(|d| d.name == name) {
            return DeclIdx::new(i);
        }
        self.decls.push(Decl {
            name: name.to_owned(),
            returns_value,
            nounwind,
        });
        DeclIdx::new(self.decls.len() - 1)
    }

    pub fn decl(&self, d: DeclIdx) -> &Decl {
        &self.decls[d.usize()]
    }

    pub fn decl_by_name(&self, name: &str) -> Option<DeclIdx> {
        self.decls
            .iter()
            .position(|d| d.name == name)
            .map(DeclIdx::new)
    }

    /// Register `func` in the global-constructor list. Idempotent.
    pub fn add_ctor(&mut self, func: FuncIdx, priority: u16) {
        if !self.ctors.iter().any(|c| c.func == func) {
            self.ctors.push(Ctor { func, priority });
        }
    }

    pub fn ctors(&self) -> &[Ctor] {
        &self.ctors
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "module {} {{", self.name)?;
        for func in &self.funcs {
            writeln!(f, "{func}")?;
        }
        write!(f, "}}")
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_declaration() {
            return write!(f, "func {};", self.name);
        }
        writeln!(f, "func {} {{", self.name)?;
        for &b in &self.layout {
            writeln!(f, "  bb{b}:")?;
            for &i in self.block(b).insts() {
                writeln!(f, "    %{i} = {}", DisplayInst(self, i))?;
            }
        }
        write!(f, "}}")
    }
}

struct DisplayInst<'a>(&'a Function, InstIdx);

impl fmt::Display for DisplayInst<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn operands(f: &mut fmt::Formatter, ops: &[Operand]) -> fmt::Result {
            for (n, op) in ops.iter().enumerate() {
                if n > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{op}")?;
            }
            Ok(())
        }

        match self.0.inst(self.1) {
            Inst::Op { opcode, operands: ops } => {
                write!(f, "{opcode} ")?;
                operands(f, ops)
            }
            Inst::Phi { incoming } => {
                write!(f, "phi ")?;
                for (n, (v, b)) in incoming.iter().enumerate() {
                    if n > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "[{v}, bb{b}]")?;
                }
                Ok(())
            }
            Inst::Call { callee, args, tail } => {
                if *tail {
                    write!(f, "tail ")?;
                }
                write!(f, "call @{callee}(")?;
                operands(f, args)?;
                write!(f, ")")
            }
            Inst::DbgValue { value, var } => write!(f, "dbg.value {value}, \"{var}\""),
            Inst::Br { dest } => write!(f, "br bb{dest}"),
            Inst::CondBr {
                cond,
                true_dest,
                false_dest,
            } => write!(f, "condbr {cond}, bb{true_dest}, bb{false_dest}"),
            Inst::Switch {
                value,
                default,
                cases,
            } => {
                write!(f, "switch {value}, bb{default}")?;
                for (c, b) in cases {
                    write!(f, ", [{c} -> bb{b}]")?;
                }
                Ok(())
            }
            Inst::Ret { value: Some(v) } => write!(f, "ret {v}"),
            Inst::Ret { value: None } => write!(f, "ret"),
            Inst::Resume { value } => write!(f, "resume {value}"),
            Inst::Unreachable => write!(f, "unreachable"),
        }
    }
}
