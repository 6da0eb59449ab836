//! A small typed SSA intermediate representation.
//!
//! The IR is deliberately flat: one value arena, one block arena, and one function arena per
//! [`Module`], with copyable newtype indices tying them together. Instructions are values; so are
//! constants, arguments, and references to functions. Use-def chains are materialized as use lists
//! on every value and are kept consistent by the mutation methods on [`Module`].

use crate::containers::unordered::UnorderedSet;

/// Index of a value (constant, argument, instruction, or function reference) in a module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Val(pub(crate) usize);

/// Index of a basic block in a module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(pub(crate) usize);

/// Index of a function in a module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Func(pub(crate) usize);

impl std::fmt::Debug for Val {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}
impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "b{}", self.0)
    }
}
impl std::fmt::Debug for Func {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// A first-class type.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Ty {
    Void,
    /// An integer of the given bit width.
    Int(u32),
    /// A 64-bit floating point value.
    Float,
    /// A pointer to a value of the pointee type.
    Ptr(Box<Ty>),
    Array(Box<Ty>, u64),
    /// A packed struct; fields are laid out back to back, without padding.
    Struct(Vec<Ty>),
    Func(FuncTy),
}

/// A function signature.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct FuncTy {
    pub ret: Box<Ty>,
    pub params: Vec<Ty>,
    pub varargs: bool,
}

impl Ty {
    /// Storage size in bytes. Structs are packed; a nested struct thus never introduces padding.
    pub fn size_in_bytes(&self) -> u64 {
        match self {
            Ty::Void => 0,
            Ty::Int(bits) => ((*bits as u64) + 7) / 8,
            Ty::Float => 8,
            Ty::Ptr(_) => 8,
            Ty::Array(elem, n) => elem.size_in_bytes() * n,
            Ty::Struct(fields) => fields.iter().map(|f| f.size_in_bytes()).sum(),
            Ty::Func(_) => 0,
        }
    }

    /// The natural (ABI) alignment: a power of two, capped at 8.
    pub fn abi_align(&self) -> u64 {
        match self {
            Ty::Void | Ty::Func(_) => 1,
            Ty::Int(_) => self.size_in_bytes().next_power_of_two().clamp(1, 8),
            Ty::Float | Ty::Ptr(_) => 8,
            Ty::Array(elem, _) => elem.abi_align(),
            Ty::Struct(fields) => fields.iter().map(|f| f.abi_align()).max().unwrap_or(1),
        }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Ty::Ptr(_))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Ty::Void)
    }

    /// The pointee type, for pointer types.
    pub fn pointee(&self) -> Option<&Ty> {
        match self {
            Ty::Ptr(t) => Some(t),
            _ => None,
        }
    }

    /// Flatten into scalar leaf types, in layout order. Used when splitting an aggregate into
    /// individual values.
    pub fn flattened(&self) -> Vec<Ty> {
        self.flattened_with_offsets()
            .into_iter()
            .map(|(ty, _)| ty)
            .collect()
    }

    /// Flatten into `(leaf type, byte offset)` pairs, in layout order.
    pub fn flattened_with_offsets(&self) -> Vec<(Ty, u64)> {
        fn walk(ty: &Ty, base: u64, out: &mut Vec<(Ty, u64)>) {
            match ty {
                Ty::Struct(fields) => {
                    let mut offset = base;
                    for field in fields {
                        walk(field, offset, out);
                        offset += field.size_in_bytes();
                    }
                }
                Ty::Array(elem, n) => {
                    let elem_size = elem.size_in_bytes();
                    for i in 0..*n {
                        walk(elem, base + i * elem_size, out);
                    }
                }
                other => out.push((other.clone(), base)),
            }
        }
        let mut out = vec![];
        walk(self, 0, &mut out);
        out
    }
}

/// Atomic memory ordering on loads and stores.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum AtomicOrdering {
    NotAtomic,
    Unordered,
    Monotonic,
    Acquire,
    Release,
    AcquireRelease,
    SequentiallyConsistent,
}

/// Two-operand integer/float arithmetic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

/// Integer comparison predicates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IcmpPred {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

/// Value conversions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CastKind {
    Bitcast,
    ZExt,
    SExt,
    Trunc,
    PtrToInt,
    IntToPtr,
}

impl CastKind {
    /// Casts through which pointer identity is preserved, i.e., the result refers to the same
    /// object as the operand.
    pub fn preserves_pointer_identity(self) -> bool {
        matches!(self, CastKind::Bitcast)
    }
}

/// An IR-level attribute, attachable to functions, return values, arguments, and their call-site
/// mirrors.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Attr {
    NoUnwind,
    NoSync,
    NoFree,
    NoRecurse,
    WillReturn,
    NoReturn,
    NoAlias,
    NonNull,
    NoCapture,
    ReadNone,
    ReadOnly,
    WriteOnly,
    Returned,
    ByVal,
    Convergent,
    /// The target defines address zero; dereferencing null is not undefined behavior in functions
    /// carrying this.
    NullPointerIsValid,
    Dereferenceable(u64),
    DereferenceableOrNull(u64),
    Align(u64),
}

/// Payload-free discriminant of [`Attr`], for kind-based lookup.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AttrKindTag {
    NoUnwind,
    NoSync,
    NoFree,
    NoRecurse,
    WillReturn,
    NoReturn,
    NoAlias,
    NonNull,
    NoCapture,
    ReadNone,
    ReadOnly,
    WriteOnly,
    Returned,
    ByVal,
    Convergent,
    NullPointerIsValid,
    Dereferenceable,
    DereferenceableOrNull,
    Align,
}

impl Attr {
    pub fn tag(&self) -> AttrKindTag {
        match self {
            Attr::NoUnwind => AttrKindTag::NoUnwind,
            Attr::NoSync => AttrKindTag::NoSync,
            Attr::NoFree => AttrKindTag::NoFree,
            Attr::NoRecurse => AttrKindTag::NoRecurse,
            Attr::WillReturn => AttrKindTag::WillReturn,
            Attr::NoReturn => AttrKindTag::NoReturn,
            Attr::NoAlias => AttrKindTag::NoAlias,
            Attr::NonNull => AttrKindTag::NonNull,
            Attr::NoCapture => AttrKindTag::NoCapture,
            Attr::ReadNone => AttrKindTag::ReadNone,
            Attr::ReadOnly => AttrKindTag::ReadOnly,
            Attr::WriteOnly => AttrKindTag::WriteOnly,
            Attr::Returned => AttrKindTag::Returned,
            Attr::ByVal => AttrKindTag::ByVal,
            Attr::Convergent => AttrKindTag::Convergent,
            Attr::NullPointerIsValid => AttrKindTag::NullPointerIsValid,
            Attr::Dereferenceable(_) => AttrKindTag::Dereferenceable,
            Attr::DereferenceableOrNull(_) => AttrKindTag::DereferenceableOrNull,
            Attr::Align(_) => AttrKindTag::Align,
        }
    }
}

/// A set of [`Attr`]s with at most one attribute per kind.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct AttrSet {
    attrs: Vec<Attr>,
}

impl AttrSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, tag: AttrKindTag) -> bool {
        self.attrs.iter().any(|a| a.tag() == tag)
    }

    pub fn get(&self, tag: AttrKindTag) -> Option<Attr> {
        self.attrs.iter().copied().find(|a| a.tag() == tag)
    }

    /// Add `attr`, replacing a same-kind attribute if present. Returns `true` if the set changed.
    pub fn add(&mut self, attr: Attr) -> bool {
        if let Some(slot) = self.attrs.iter_mut().find(|a| a.tag() == attr.tag()) {
            if *slot == attr {
                false
            } else {
                *slot = attr;
                true
            }
        } else {
            self.attrs.push(attr);
            true
        }
    }

    pub fn remove(&mut self, tag: AttrKindTag) -> bool {
        let before = self.attrs.len();
        self.attrs.retain(|a| a.tag() != tag);
        self.attrs.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attr> {
        self.attrs.iter()
    }

    /// Declared dereferenceable bytes, with whether the `_or_null` variant was used.
    pub fn deref_bytes(&self) -> Option<(u64, bool)> {
        for a in &self.attrs {
            match a {
                Attr::Dereferenceable(n) => return Some((*n, false)),
                Attr::DereferenceableOrNull(n) => return Some((*n, true)),
                _ => {}
            }
        }
        None
    }

    pub fn alignment(&self) -> Option<u64> {
        self.attrs.iter().find_map(|a| match a {
            Attr::Align(n) => Some(*n),
            _ => None,
        })
    }
}

impl FromIterator<Attr> for AttrSet {
    fn from_iter<I: IntoIterator<Item = Attr>>(iter: I) -> Self {
        let mut r = Self::new();
        for a in iter {
            r.add(a);
        }
        r
    }
}

/// Attribute lists attached to one call site, mirroring the callee-side lists.
#[derive(Clone, Default, Debug)]
pub struct CallSiteAttrs {
    pub fn_attrs: AttrSet,
    pub ret_attrs: AttrSet,
    pub arg_attrs: Vec<AttrSet>,
}

/// The operation an instruction performs. Successor blocks and other non-value payload live here;
/// value operands live in [`Inst::operands`].
#[derive(Clone, PartialEq, Debug)]
pub enum Opcode {
    /// Return; the optional returned value is operand 0.
    Ret,
    /// Unconditional branch.
    Br(Block),
    /// Conditional branch on operand 0.
    CondBr { then_dest: Block, else_dest: Block },
    /// Multi-way branch on operand 0.
    Switch {
        default: Block,
        cases: Vec<(i128, Block)>,
    },
    Unreachable,
    /// Direct or indirect call; the callee is operand 0, arguments follow.
    Call,
    /// A call with exceptional control flow; callee/arguments as for `Call`.
    Invoke { normal: Block, unwind: Block },
    /// Load from the pointer at operand 0. `align` of zero means unannotated.
    Load {
        volatile: bool,
        ordering: AtomicOrdering,
        align: u64,
    },
    /// Store operand 0 through the pointer at operand 1. `align` of zero means unannotated.
    Store {
        volatile: bool,
        ordering: AtomicOrdering,
        align: u64,
    },
    /// Stack allocation of the given type; an optional element count is operand 0.
    Alloca { allocated: Ty },
    /// Pointer at operand 0 displaced by the byte offset at operand 1.
    Gep,
    BinOp(BinOpKind),
    /// Integer comparison; yields `i1`.
    Icmp(IcmpPred),
    Cast(CastKind),
    /// Operand 0 selects between operand 1 and operand 2.
    Select,
    /// SSA merge; `blocks[i]` is the predecessor contributing operand `i`.
    Phi { blocks: Vec<Block> },
}

impl Opcode {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Ret
                | Opcode::Br(_)
                | Opcode::CondBr { .. }
                | Opcode::Switch { .. }
                | Opcode::Unreachable
                | Opcode::Invoke { .. }
        )
    }

    pub fn is_call_like(&self) -> bool {
        matches!(self, Opcode::Call | Opcode::Invoke { .. })
    }
}

/// An instruction. Also a value: its result (if its type is non-void) is the [`Val`] that owns it.
#[derive(Clone, Debug)]
pub struct Inst {
    pub block: Block,
    pub op: Opcode,
    pub operands: Vec<Val>,
    /// Present iff `op.is_call_like()`.
    pub call_attrs: Option<Box<CallSiteAttrs>>,
}

/// What a value is.
#[derive(Clone, Debug)]
pub enum ValueKind {
    ConstInt(i128),
    ConstNull,
    Undef,
    FuncRef(Func),
    Argument { func: Func, index: usize },
    Inst(Inst),
}

/// One use of a value: operand slot `index` of the instruction-value `user`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct UseRef {
    pub user: Val,
    pub index: usize,
}

/// Arena slot for one value.
#[derive(Clone, Debug)]
pub struct ValueData {
    pub ty: Ty,
    pub kind: ValueKind,
    pub uses: Vec<UseRef>,
    pub deleted: bool,
    /// `!range [lo, hi]` metadata, attachable to loads and calls.
    pub range: Option<(i128, i128)>,
}

/// Arena slot for one basic block.
#[derive(Clone, Debug)]
pub struct BlockData {
    pub func: Func,
    pub name: String,
    pub insts: Vec<Val>,
    pub deleted: bool,
    /// Annotated maximum trip count, for blocks that head a loop. Absence on a loop header means
    /// the loop has no known bound.
    pub max_trip_count: Option<u64>,
}

/// Arena slot for one function.
#[derive(Clone, Debug)]
pub struct FunctionData {
    pub name: String,
    pub ty: FuncTy,
    pub args: Vec<Val>,
    /// Blocks in layout order; the first is the entry block. Empty for declarations.
    pub blocks: Vec<Block>,
    pub internal: bool,
    /// Whether the function carries an exception personality. Only such functions may keep
    /// `invoke` instructions; conversely only personality-free functions allow an invoke to be
    /// demoted to a plain call.
    pub has_personality: bool,
    pub fn_attrs: AttrSet,
    pub ret_attrs: AttrSet,
    pub arg_attrs: Vec<AttrSet>,
    pub deleted: bool,
}

impl FunctionData {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// A whole translation unit.
#[derive(Clone, Default, Debug)]
pub struct Module {
    pub(crate) values: Vec<ValueData>,
    pub(crate) blocks: Vec<BlockData>,
    pub(crate) functions: Vec<FunctionData>,
}

impl Module {
    pub fn new() -> Self {
        Default::default()
    }

    // ---- raw access ------------------------------------------------------

    pub fn val(&self, v: Val) -> &ValueData {
        &self.values[v.0]
    }

    pub fn val_mut(&mut self, v: Val) -> &mut ValueData {
        &mut self.values[v.0]
    }

    pub fn ty_of(&self, v: Val) -> &Ty {
        &self.values[v.0].ty
    }

    pub fn block(&self, b: Block) -> &BlockData {
        &self.blocks[b.0]
    }

    pub fn block_mut(&mut self, b: Block) -> &mut BlockData {
        &mut self.blocks[b.0]
    }

    pub fn func(&self, f: Func) -> &FunctionData {
        &self.functions[f.0]
    }

    pub fn func_mut(&mut self, f: Func) -> &mut FunctionData {
        &mut self.functions[f.0]
    }

    /// All live functions.
    pub fn funcs(&self) -> impl Iterator<Item = Func> + '_ {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.deleted)
            .map(|(i, _)| Func(i))
    }

    pub fn func_by_name(&self, name: &str) -> Option<Func> {
        self.funcs().find(|&f| self.func(f).name == name)
    }

    /// Live blocks of `f`, in layout order.
    pub fn blocks_of(&self, f: Func) -> impl Iterator<Item = Block> + '_ {
        self.functions[f.0]
            .blocks
            .iter()
            .copied()
            .filter(move |&b| !self.blocks[b.0].deleted)
    }

    pub fn entry_block(&self, f: Func) -> Option<Block> {
        self.functions[f.0].blocks.first().copied()
    }

    /// Live instructions of `b`, in order.
    pub fn insts_of(&self, b: Block) -> impl Iterator<Item = Val> + '_ {
        self.blocks[b.0]
            .insts
            .iter()
            .copied()
            .filter(move |&v| !self.values[v.0].deleted)
    }

    /// Live instructions of `f`, block by block.
    pub fn insts_of_func(&self, f: Func) -> impl Iterator<Item = Val> + '_ {
        self.blocks_of(f).flat_map(move |b| self.insts_of(b))
    }

    // ---- instruction introspection ---------------------------------------

    pub fn inst(&self, v: Val) -> Option<&Inst> {
        match &self.values[v.0].kind {
            ValueKind::Inst(i) => Some(i),
            _ => None,
        }
    }

    pub fn inst_mut(&mut self, v: Val) -> Option<&mut Inst> {
        match &mut self.values[v.0].kind {
            ValueKind::Inst(i) => Some(i),
            _ => None,
        }
    }

    pub fn expect_inst(&self, v: Val) -> &Inst {
        self.inst(v)
            .unwrap_or_else(|| panic!("{:?} expected to be an instruction", v))
    }

    pub fn parent_block(&self, v: Val) -> Option<Block> {
        self.inst(v).map(|i| i.block)
    }

    /// The function a value belongs to, if it belongs to one.
    pub fn parent_func(&self, v: Val) -> Option<Func> {
        match &self.values[v.0].kind {
            ValueKind::Inst(i) => Some(self.blocks[i.block.0].func),
            ValueKind::Argument { func, .. } => Some(*func),
            _ => None,
        }
    }

    pub fn is_call_like(&self, v: Val) -> bool {
        self.inst(v).map_or(false, |i| i.op.is_call_like())
    }

    /// The directly-called function of a call-like instruction, if the callee operand is a plain
    /// function reference.
    pub fn callee_of(&self, call: Val) -> Option<Func> {
        let inst = self.inst(call)?;
        if !inst.op.is_call_like() {
            return None;
        }
        match &self.values[inst.operands[0].0].kind {
            ValueKind::FuncRef(f) => Some(*f),
            _ => None,
        }
    }

    /// The argument operands of a call-like instruction.
    pub fn call_args(&self, call: Val) -> &[Val] {
        &self.expect_inst(call).operands[1..]
    }

    /// Successor blocks of a terminator instruction.
    pub fn successors_of(&self, term: Val) -> Vec<Block> {
        match &self.expect_inst(term).op {
            Opcode::Br(b) => vec![*b],
            Opcode::CondBr {
                then_dest,
                else_dest,
            } => vec![*then_dest, *else_dest],
            Opcode::Switch { default, cases } => {
                let mut r = vec![*default];
                r.extend(cases.iter().map(|(_, b)| *b));
                r
            }
            Opcode::Invoke { normal, unwind } => vec![*normal, *unwind],
            _ => vec![],
        }
    }

    pub fn terminator_of(&self, b: Block) -> Option<Val> {
        self.insts_of(b)
            .last()
            .filter(|&v| self.expect_inst(v).op.is_terminator())
    }

    pub fn is_int_const(&self, v: Val) -> Option<i128> {
        match self.values[v.0].kind {
            ValueKind::ConstInt(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_null_const(&self, v: Val) -> bool {
        matches!(self.values[v.0].kind, ValueKind::ConstNull)
    }

    pub fn is_undef(&self, v: Val) -> bool {
        matches!(self.values[v.0].kind, ValueKind::Undef)
    }

    pub fn is_constant(&self, v: Val) -> bool {
        matches!(
            self.values[v.0].kind,
            ValueKind::ConstInt(_) | ValueKind::ConstNull | ValueKind::Undef | ValueKind::FuncRef(_)
        )
    }

    /// Whether executing this instruction can observably affect memory or control flow, i.e.,
    /// whether it must be kept alive even if its result is unused. Calls are conservatively
    /// side-effecting here; the analyses refine that via deduced facts.
    pub fn has_side_effects(&self, v: Val) -> bool {
        let inst = match self.inst(v) {
            Some(i) => i,
            None => return false,
        };
        match &inst.op {
            Opcode::Store { .. } | Opcode::Call | Opcode::Invoke { .. } => true,
            Opcode::Load {
                volatile, ordering, ..
            } => *volatile || *ordering != AtomicOrdering::NotAtomic,
            op => op.is_terminator(),
        }
    }

    /// Whether the instruction may transfer control out via unwinding, before any facts about the
    /// callee are taken into account.
    pub fn may_unwind(&self, v: Val) -> bool {
        self.is_call_like(v)
    }

    pub fn reads_memory(&self, v: Val) -> bool {
        matches!(
            self.inst(v).map(|i| &i.op),
            Some(Opcode::Load { .. }) | Some(Opcode::Call) | Some(Opcode::Invoke { .. })
        )
    }

    pub fn writes_memory(&self, v: Val) -> bool {
        matches!(
            self.inst(v).map(|i| &i.op),
            Some(Opcode::Store { .. }) | Some(Opcode::Call) | Some(Opcode::Invoke { .. })
        )
    }

    // ---- value construction ----------------------------------------------

    fn push_value(&mut self, ty: Ty, kind: ValueKind) -> Val {
        let v = Val(self.values.len());
        self.values.push(ValueData {
            ty,
            kind,
            uses: vec![],
            deleted: false,
            range: None,
        });
        v
    }

    pub fn const_int(&mut self, bits: u32, value: i128) -> Val {
        self.push_value(Ty::Int(bits), ValueKind::ConstInt(value))
    }

    pub(crate) fn push_arg_value(&mut self, ty: Ty, func: Func, index: usize) -> Val {
        self.push_value(ty, ValueKind::Argument { func, index })
    }

    pub fn const_null(&mut self, pointee: Ty) -> Val {
        self.push_value(Ty::Ptr(Box::new(pointee)), ValueKind::ConstNull)
    }

    pub fn undef(&mut self, ty: Ty) -> Val {
        self.push_value(ty, ValueKind::Undef)
    }

    /// The interned reference value for `f`, if one was ever created.
    pub fn existing_func_ref(&self, f: Func) -> Option<Val> {
        self.values.iter().enumerate().find_map(|(i, vd)| match vd.kind {
            ValueKind::FuncRef(g) if g == f && !vd.deleted => Some(Val(i)),
            _ => None,
        })
    }

    pub fn func_ref(&mut self, f: Func) -> Val {
        // Function references are shared so that use lists double as call-site lists.
        if let Some(v) = self.existing_func_ref(f) {
            return v;
        }
        let ty = Ty::Ptr(Box::new(Ty::Func(self.functions[f.0].ty.clone())));
        self.push_value(ty, ValueKind::FuncRef(f))
    }

    /// Append a new instruction to `b`. Operand use lists are wired up here.
    pub fn append_inst(
        &mut self,
        b: Block,
        ty: Ty,
        op: Opcode,
        operands: Vec<Val>,
        call_attrs: Option<Box<CallSiteAttrs>>,
    ) -> Val {
        let at = self.blocks[b.0].insts.len();
        self.insert_inst_at(b, at, ty, op, operands, call_attrs)
    }

    /// Insert a new instruction at slot `at` of `b`'s instruction list.
    pub fn insert_inst_at(
        &mut self,
        b: Block,
        at: usize,
        ty: Ty,
        op: Opcode,
        operands: Vec<Val>,
        call_attrs: Option<Box<CallSiteAttrs>>,
    ) -> Val {
        debug_assert_eq!(op.is_call_like(), call_attrs.is_some());
        let v = self.push_value(
            ty,
            ValueKind::Inst(Inst {
                block: b,
                op,
                operands: operands.clone(),
                call_attrs,
            }),
        );
        for (index, &operand) in operands.iter().enumerate() {
            self.values[operand.0].uses.push(UseRef { user: v, index });
        }
        self.blocks[b.0].insts.insert(at, v);
        v
    }

    /// Insert a new instruction immediately before `before` in its block.
    pub fn insert_inst_before(
        &mut self,
        before: Val,
        ty: Ty,
        op: Opcode,
        operands: Vec<Val>,
        call_attrs: Option<Box<CallSiteAttrs>>,
    ) -> Val {
        let b = self.parent_block(before).expect("insertion point in a block");
        let at = self.blocks[b.0]
            .insts
            .iter()
            .position(|&i| i == before)
            .expect("insertion point in its block's list");
        self.insert_inst_at(b, at, ty, op, operands, call_attrs)
    }

    // ---- mutation --------------------------------------------------------

    /// Point one operand slot of `user` at `new`, maintaining use lists.
    pub fn replace_use(&mut self, use_ref: UseRef, new: Val) {
        let old = {
            let inst = self.inst_mut(use_ref.user).expect("user is an instruction");
            std::mem::replace(&mut inst.operands[use_ref.index], new)
        };
        self.values[old.0]
            .uses
            .retain(|u| !(u.user == use_ref.user && u.index == use_ref.index));
        self.values[new.0].uses.push(use_ref);
    }

    /// Replace every use of `old` with `new`.
    pub fn replace_all_uses_with(&mut self, old: Val, new: Val) {
        assert_ne!(old, new, "RAUW of a value with itself");
        let uses = std::mem::take(&mut self.values[old.0].uses);
        for use_ref in uses {
            let inst = self.inst_mut(use_ref.user).expect("user is an instruction");
            inst.operands[use_ref.index] = new;
            self.values[new.0].uses.push(use_ref);
        }
    }

    /// Tombstone an instruction: unlink it from its operand use lists and from its block. Uses of
    /// its own result must already be gone.
    pub fn erase_inst(&mut self, v: Val) {
        assert!(
            self.values[v.0].uses.is_empty(),
            "erasing {:?} while it still has uses",
            v
        );
        let (block, operands) = {
            let inst = self.expect_inst(v);
            (inst.block, inst.operands.clone())
        };
        for (index, operand) in operands.into_iter().enumerate() {
            self.values[operand.0]
                .uses
                .retain(|u| !(u.user == v && u.index == index));
        }
        self.blocks[block.0].insts.retain(|&i| i != v);
        self.values[v.0].deleted = true;
    }

    /// Drop every instruction of `b` after `v` (exclusive), in reverse order so use lists drain
    /// cleanly within the block.
    pub fn truncate_block_after(&mut self, b: Block, v: Val) {
        self.truncate_block(b, v, false)
    }

    /// Drop `v` and every instruction of `b` after it.
    pub fn truncate_block_from(&mut self, b: Block, v: Val) {
        self.truncate_block(b, v, true)
    }

    fn truncate_block(&mut self, b: Block, v: Val, inclusive: bool) {
        let insts: Vec<Val> = self.insts_of(b).collect();
        let cut = insts
            .iter()
            .position(|&i| i == v)
            .expect("truncation point not in block");
        let cut = if inclusive { cut } else { cut + 1 };
        for &dead in insts[cut..].iter().rev() {
            let uses = std::mem::take(&mut self.values[dead.0].uses);
            // Any remaining out-of-block uses become undef; the caller has established the tail is
            // unreachable, so those uses can never execute.
            for use_ref in uses {
                let undef = self.undef(self.values[dead.0].ty.clone());
                let inst = self.inst_mut(use_ref.user).expect("user is an instruction");
                inst.operands[use_ref.index] = undef;
                self.values[undef.0].uses.push(use_ref);
            }
            self.erase_inst(dead);
        }
    }

    /// Remove incoming phi entries for predecessor `pred` in every phi of `b`.
    pub fn remove_phi_incoming(&mut self, b: Block, pred: Block) {
        let phis: Vec<Val> = self
            .insts_of(b)
            .filter(|&v| matches!(self.expect_inst(v).op, Opcode::Phi { .. }))
            .collect();
        for phi in phis {
            let drop_indexes: Vec<usize> = {
                let inst = self.expect_inst(phi);
                match &inst.op {
                    Opcode::Phi { blocks } => blocks
                        .iter()
                        .enumerate()
                        .filter(|(_, &pb)| pb == pred)
                        .map(|(i, _)| i)
                        .collect(),
                    _ => unreachable!(),
                }
            };
            for &index in drop_indexes.iter().rev() {
                let operand = {
                    let inst = self.inst_mut(phi).unwrap();
                    let operand = inst.operands.remove(index);
                    match &mut inst.op {
                        Opcode::Phi { blocks } => {
                            blocks.remove(index);
                        }
                        _ => unreachable!(),
                    }
                    operand
                };
                self.values[operand.0]
                    .uses
                    .retain(|u| !(u.user == phi && u.index == index));
                // Shift the remaining use indexes of this phi down past the removed slot.
                let shifted: Vec<Val> = self.inst(phi).unwrap().operands[index..].to_vec();
                for (off, op) in shifted.into_iter().enumerate() {
                    for u in self.values[op.0].uses.iter_mut() {
                        if u.user == phi && u.index == index + off + 1 {
                            u.index -= 1;
                        }
                    }
                }
            }
        }
    }

    pub fn delete_block(&mut self, b: Block) {
        let insts: Vec<Val> = self.insts_of(b).collect();
        for &v in insts.iter().rev() {
            let uses = std::mem::take(&mut self.values[v.0].uses);
            for use_ref in uses {
                let undef = self.undef(self.values[v.0].ty.clone());
                let inst = self.inst_mut(use_ref.user).expect("user is an instruction");
                inst.operands[use_ref.index] = undef;
                self.values[undef.0].uses.push(use_ref);
            }
            self.erase_inst(v);
        }
        self.blocks[b.0].deleted = true;
    }

    pub fn delete_function(&mut self, f: Func) {
        let blocks: Vec<Block> = self.blocks_of(f).collect();
        for b in blocks {
            self.delete_block(b);
        }
        self.functions[f.0].deleted = true;
    }

    // ---- library-function recognizers ------------------------------------

    /// Classify a call as an allocation or deallocation routine by callee name and shape.
    pub fn alloc_kind_of(&self, call: Val) -> Option<AllocKind> {
        let callee = self.callee_of(call)?;
        let fd = self.func(callee);
        let args = self.call_args(call);
        match (fd.name.as_str(), args.len()) {
            ("malloc", 1) => Some(AllocKind::Malloc),
            ("calloc", 2) => Some(AllocKind::Calloc),
            ("aligned_alloc", 2) => Some(AllocKind::AlignedAlloc),
            _ => None,
        }
    }

    pub fn is_free_call(&self, call: Val) -> bool {
        self.callee_of(call).map_or(false, |callee| {
            self.func(callee).name == "free" && self.call_args(call).len() == 1
        })
    }

    /// Whether dereferencing a null pointer is defined behavior inside `f`.
    pub fn null_pointer_is_defined(&self, f: Func) -> bool {
        self.func(f).fn_attrs.has(AttrKindTag::NullPointerIsValid)
    }

    /// Byte size of an allocation call if it is a compile-time constant.
    pub fn constant_alloc_size(&self, call: Val) -> Option<u64> {
        let args = self.call_args(call);
        match self.alloc_kind_of(call)? {
            AllocKind::Malloc => self.is_int_const(args[0]),
            AllocKind::Calloc => {
                let n = self.is_int_const(args[0])?;
                let sz = self.is_int_const(args[1])?;
                n.checked_mul(sz)
            }
            AllocKind::AlignedAlloc => self.is_int_const(args[1]),
        }
        .and_then(|v| u64::try_from(v).ok())
    }
}

/// Recognized allocation routines.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocKind {
    Malloc,
    Calloc,
    AlignedAlloc,
}

// ---- builder --------------------------------------------------------------

/// Convenience layer for constructing modules in tests and drivers. Functions are built one at a
/// time; instructions are appended to the most recently begun block.
pub struct ModuleBuilder {
    pub m: Module,
    cur_func: Option<Func>,
    cur_block: Option<Block>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self {
            m: Module::new(),
            cur_func: None,
            cur_block: None,
        }
    }

    pub fn finish(self) -> Module {
        assert!(
            self.cur_func.is_none(),
            "finish() called inside an unfinished function"
        );
        self.m
    }

    /// Declare a function without a body.
    pub fn declare_function(&mut self, name: &str, ret: Ty, params: Vec<Ty>) -> Func {
        let f = Func(self.m.functions.len());
        let arg_attrs = params.iter().map(|_| AttrSet::new()).collect();
        self.m.functions.push(FunctionData {
            name: name.to_owned(),
            ty: FuncTy {
                ret: Box::new(ret),
                params: params.clone(),
                varargs: false,
            },
            args: vec![],
            blocks: vec![],
            internal: false,
            has_personality: false,
            fn_attrs: AttrSet::new(),
            ret_attrs: AttrSet::new(),
            arg_attrs,
            deleted: false,
        });
        let args = params
            .iter()
            .enumerate()
            .map(|(index, ty)| {
                self.m
                    .push_value(ty.clone(), ValueKind::Argument { func: f, index })
            })
            .collect();
        self.m.functions[f.0].args = args;
        f
    }

    pub fn begin_function(&mut self, name: &str, ret: Ty, params: Vec<Ty>) -> Func {
        assert!(self.cur_func.is_none(), "previous function not ended");
        let f = self.declare_function(name, ret, params);
        self.cur_func = Some(f);
        self.begin_block("entry");
        f
    }

    pub fn end_function(&mut self) {
        let f = self.cur_func.take().expect("no function in progress");
        for &b in &self.m.functions[f.0].blocks {
            assert!(
                self.m.terminator_of(b).is_some(),
                "block {} of @{} lacks a terminator",
                self.m.block(b).name,
                self.m.func(f).name
            );
        }
        self.cur_block = None;
    }

    pub fn set_internal(&mut self, f: Func) {
        self.m.functions[f.0].internal = true;
    }

    pub fn set_personality(&mut self, f: Func) {
        self.m.functions[f.0].has_personality = true;
    }

    pub fn add_fn_attr(&mut self, f: Func, attr: Attr) {
        self.m.functions[f.0].fn_attrs.add(attr);
    }

    pub fn add_ret_attr(&mut self, f: Func, attr: Attr) {
        self.m.functions[f.0].ret_attrs.add(attr);
    }

    pub fn add_arg_attr(&mut self, f: Func, index: usize, attr: Attr) {
        self.m.functions[f.0].arg_attrs[index].add(attr);
    }

    pub fn arg(&self, f: Func, index: usize) -> Val {
        self.m.func(f).args[index]
    }

    pub fn begin_block(&mut self, name: &str) -> Block {
        let f = self.cur_func.expect("no function in progress");
        let b = Block(self.m.blocks.len());
        self.m.blocks.push(BlockData {
            func: f,
            name: name.to_owned(),
            insts: vec![],
            deleted: false,
            max_trip_count: None,
        });
        self.m.functions[f.0].blocks.push(b);
        self.cur_block = Some(b);
        b
    }

    /// Annotate the current block as a loop header with a known trip bound.
    pub fn set_max_trip_count(&mut self, b: Block, n: u64) {
        self.m.blocks[b.0].max_trip_count = Some(n);
    }

    /// Switch instruction appending back to an already-begun block.
    pub fn switch_to_block(&mut self, b: Block) {
        assert_eq!(Some(self.m.block(b).func), self.cur_func);
        self.cur_block = Some(b);
    }

    fn cur(&self) -> Block {
        self.cur_block.expect("no block in progress")
    }

    // Constants.

    pub fn const_int(&mut self, bits: u32, value: i128) -> Val {
        self.m.const_int(bits, value)
    }

    pub fn const_null(&mut self, pointee: Ty) -> Val {
        self.m.const_null(pointee)
    }

    pub fn undef(&mut self, ty: Ty) -> Val {
        self.m.undef(ty)
    }

    pub fn func_ref(&mut self, f: Func) -> Val {
        self.m.func_ref(f)
    }

    // Terminators.

    pub fn ret(&mut self, v: Option<Val>) -> Val {
        let b = self.cur();
        self.m
            .append_inst(b, Ty::Void, Opcode::Ret, v.into_iter().collect(), None)
    }

    pub fn br(&mut self, dest: Block) -> Val {
        let b = self.cur();
        self.m.append_inst(b, Ty::Void, Opcode::Br(dest), vec![], None)
    }

    pub fn cond_br(&mut self, cond: Val, then_dest: Block, else_dest: Block) -> Val {
        let b = self.cur();
        self.m.append_inst(
            b,
            Ty::Void,
            Opcode::CondBr {
                then_dest,
                else_dest,
            },
            vec![cond],
            None,
        )
    }

    pub fn switch(&mut self, on: Val, default: Block, cases: Vec<(i128, Block)>) -> Val {
        let b = self.cur();
        self.m
            .append_inst(b, Ty::Void, Opcode::Switch { default, cases }, vec![on], None)
    }

    pub fn unreachable(&mut self) -> Val {
        let b = self.cur();
        self.m
            .append_inst(b, Ty::Void, Opcode::Unreachable, vec![], None)
    }

    // Calls.

    pub fn call(&mut self, callee: Func, args: Vec<Val>) -> Val {
        let callee_ref = self.m.func_ref(callee);
        self.call_value(callee_ref, (*self.m.func(callee).ty.ret).clone(), args)
    }

    pub fn call_value(&mut self, callee: Val, ret: Ty, args: Vec<Val>) -> Val {
        let b = self.cur();
        let attrs = Box::new(CallSiteAttrs {
            fn_attrs: AttrSet::new(),
            ret_attrs: AttrSet::new(),
            arg_attrs: args.iter().map(|_| AttrSet::new()).collect(),
        });
        let mut operands = vec![callee];
        operands.extend(args);
        self.m
            .append_inst(b, ret, Opcode::Call, operands, Some(attrs))
    }

    pub fn invoke(&mut self, callee: Func, args: Vec<Val>, normal: Block, unwind: Block) -> Val {
        let b = self.cur();
        let callee_ref = self.m.func_ref(callee);
        let ret = (*self.m.func(callee).ty.ret).clone();
        let attrs = Box::new(CallSiteAttrs {
            fn_attrs: AttrSet::new(),
            ret_attrs: AttrSet::new(),
            arg_attrs: args.iter().map(|_| AttrSet::new()).collect(),
        });
        let mut operands = vec![callee_ref];
        operands.extend(args);
        self.m
            .append_inst(b, ret, Opcode::Invoke { normal, unwind }, operands, Some(attrs))
    }

    // Memory.

    pub fn load(&mut self, ty: Ty, ptr: Val) -> Val {
        self.load_with(ty, ptr, false, AtomicOrdering::NotAtomic)
    }

    pub fn load_with(&mut self, ty: Ty, ptr: Val, volatile: bool, ordering: AtomicOrdering) -> Val {
        let b = self.cur();
        self.m.append_inst(
            b,
            ty,
            Opcode::Load {
                volatile,
                ordering,
                align: 0,
            },
            vec![ptr],
            None,
        )
    }

    pub fn store(&mut self, value: Val, ptr: Val) -> Val {
        self.store_with(value, ptr, false, AtomicOrdering::NotAtomic)
    }

    pub fn store_with(
        &mut self,
        value: Val,
        ptr: Val,
        volatile: bool,
        ordering: AtomicOrdering,
    ) -> Val {
        let b = self.cur();
        self.m.append_inst(
            b,
            Ty::Void,
            Opcode::Store {
                volatile,
                ordering,
                align: 0,
            },
            vec![value, ptr],
            None,
        )
    }

    pub fn alloca(&mut self, allocated: Ty) -> Val {
        let b = self.cur();
        self.m.append_inst(
            b,
            Ty::Ptr(Box::new(allocated.clone())),
            Opcode::Alloca { allocated },
            vec![],
            None,
        )
    }

    pub fn gep(&mut self, base: Val, offset: Val) -> Val {
        let b = self.cur();
        let ty = self.m.ty_of(base).clone();
        self.m
            .append_inst(b, ty, Opcode::Gep, vec![base, offset], None)
    }

    // Scalars.

    pub fn binop(&mut self, kind: BinOpKind, a: Val, x: Val) -> Val {
        let b = self.cur();
        let ty = self.m.ty_of(a).clone();
        self.m
            .append_inst(b, ty, Opcode::BinOp(kind), vec![a, x], None)
    }

    pub fn icmp(&mut self, pred: IcmpPred, a: Val, x: Val) -> Val {
        let b = self.cur();
        self.m
            .append_inst(b, Ty::Int(1), Opcode::Icmp(pred), vec![a, x], None)
    }

    pub fn cast(&mut self, kind: CastKind, v: Val, to: Ty) -> Val {
        let b = self.cur();
        self.m.append_inst(b, to, Opcode::Cast(kind), vec![v], None)
    }

    pub fn select(&mut self, cond: Val, t: Val, e: Val) -> Val {
        let b = self.cur();
        let ty = self.m.ty_of(t).clone();
        self.m
            .append_inst(b, ty, Opcode::Select, vec![cond, t, e], None)
    }

    pub fn phi(&mut self, ty: Ty, incoming: Vec<(Block, Val)>) -> Val {
        let b = self.cur();
        let (blocks, operands): (Vec<Block>, Vec<Val>) = incoming.into_iter().unzip();
        self.m
            .append_inst(b, ty, Opcode::Phi { blocks }, operands, None)
    }
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---- printing --------------------------------------------------------------

struct Namer {
    names: crate::containers::unordered::UnorderedMap<Val, String>,
    next: usize,
}

impl Namer {
    fn for_function(m: &Module, f: Func) -> Self {
        let mut r = Self {
            names: Default::default(),
            next: 0,
        };
        for &arg in &m.func(f).args {
            let name = format!("%a{}", r.next);
            r.next += 1;
            r.names.insert(arg, name);
        }
        for b in m.blocks_of(f) {
            for v in m.insts_of(b) {
                if !m.ty_of(v).is_void() {
                    let name = format!("%t{}", r.next);
                    r.next += 1;
                    r.names.insert(v, name);
                }
            }
        }
        r
    }

    fn of(&self, m: &Module, v: Val) -> String {
        if let Some(n) = self.names.get(&v) {
            return n.clone();
        }
        match &m.val(v).kind {
            ValueKind::ConstInt(c) => format!("{}", c),
            ValueKind::ConstNull => "null".to_owned(),
            ValueKind::Undef => "undef".to_owned(),
            ValueKind::FuncRef(f) => format!("@{}", m.func(*f).name),
            _ => format!("%v{}", v.0),
        }
    }
}

fn fmt_ty(ty: &Ty) -> String {
    use itertools::Itertools;
    match ty {
        Ty::Void => "void".to_owned(),
        Ty::Int(bits) => format!("i{}", bits),
        Ty::Float => "float".to_owned(),
        Ty::Ptr(p) => format!("{}*", fmt_ty(p)),
        Ty::Array(elem, n) => format!("[{} x {}]", n, fmt_ty(elem)),
        Ty::Struct(fields) => format!("{{{}}}", fields.iter().map(fmt_ty).join(", ")),
        Ty::Func(ft) => format!(
            "{} ({})",
            fmt_ty(&ft.ret),
            ft.params.iter().map(fmt_ty).join(", ")
        ),
    }
}

fn fmt_attr(attr: &Attr) -> String {
    match attr {
        Attr::NoUnwind => "nounwind".to_owned(),
        Attr::NoSync => "nosync".to_owned(),
        Attr::NoFree => "nofree".to_owned(),
        Attr::NoRecurse => "norecurse".to_owned(),
        Attr::WillReturn => "willreturn".to_owned(),
        Attr::NoReturn => "noreturn".to_owned(),
        Attr::NoAlias => "noalias".to_owned(),
        Attr::NonNull => "nonnull".to_owned(),
        Attr::NoCapture => "nocapture".to_owned(),
        Attr::ReadNone => "readnone".to_owned(),
        Attr::ReadOnly => "readonly".to_owned(),
        Attr::WriteOnly => "writeonly".to_owned(),
        Attr::Returned => "returned".to_owned(),
        Attr::ByVal => "byval".to_owned(),
        Attr::Convergent => "convergent".to_owned(),
        Attr::NullPointerIsValid => "null_pointer_is_valid".to_owned(),
        Attr::Dereferenceable(n) => format!("dereferenceable({})", n),
        Attr::DereferenceableOrNull(n) => format!("dereferenceable_or_null({})", n),
        Attr::Align(n) => format!("align({})", n),
    }
}

fn fmt_attrs(attrs: &AttrSet) -> String {
    let mut parts: Vec<String> = attrs.iter().map(fmt_attr).collect();
    parts.sort();
    parts.join(" ")
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut first = true;
        for func in self.funcs() {
            if !first {
                writeln!(f)?;
            }
            first = false;
            self.fmt_function(f, func)?;
        }
        Ok(())
    }
}

impl Module {
    fn fmt_function(&self, f: &mut std::fmt::Formatter, func: Func) -> std::fmt::Result {
        let fd = self.func(func);
        let namer = Namer::for_function(self, func);
        let keyword = if fd.is_declaration() {
            "declare"
        } else {
            "define"
        };
        write!(f, "{} ", keyword)?;
        if fd.internal {
            write!(f, "internal ")?;
        }
        let ret_attrs = fmt_attrs(&fd.ret_attrs);
        if !ret_attrs.is_empty() {
            write!(f, "{} ", ret_attrs)?;
        }
        write!(f, "{} @{}(", fmt_ty(&fd.ty.ret), fd.name)?;
        for (i, param_ty) in fd.ty.params.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", fmt_ty(param_ty))?;
            let attrs = fmt_attrs(&fd.arg_attrs[i]);
            if !attrs.is_empty() {
                write!(f, " {}", attrs)?;
            }
            if let Some(&arg) = fd.args.get(i) {
                write!(f, " {}", namer.of(self, arg))?;
            }
        }
        write!(f, ")")?;
        let fn_attrs = fmt_attrs(&fd.fn_attrs);
        if !fn_attrs.is_empty() {
            write!(f, " {}", fn_attrs)?;
        }
        if fd.has_personality {
            write!(f, " personality")?;
        }
        if fd.is_declaration() {
            return writeln!(f);
        }
        writeln!(f, " {{")?;
        for b in self.blocks_of(func) {
            let bd = self.block(b);
            write!(f, "{}:", bd.name)?;
            if let Some(n) = bd.max_trip_count {
                write!(f, " !max_trip_count({})", n)?;
            }
            writeln!(f)?;
            for v in self.insts_of(b) {
                write!(f, "  ")?;
                self.fmt_inst(f, v, &namer)?;
                writeln!(f)?;
            }
        }
        writeln!(f, "}}")
    }

    fn fmt_inst(&self, f: &mut std::fmt::Formatter, v: Val, namer: &Namer) -> std::fmt::Result {
        let inst = self.expect_inst(v);
        let ty = self.ty_of(v);
        if !ty.is_void() {
            write!(f, "{} = ", namer.of(self, v))?;
        }
        let operand = |i: usize| {
            let op = inst.operands[i];
            format!("{} {}", fmt_ty(self.ty_of(op)), namer.of(self, op))
        };
        match &inst.op {
            Opcode::Ret => {
                if inst.operands.is_empty() {
                    write!(f, "ret void")?;
                } else {
                    write!(f, "ret {}", operand(0))?;
                }
            }
            Opcode::Br(dest) => write!(f, "br label %{}", self.block(*dest).name)?,
            Opcode::CondBr {
                then_dest,
                else_dest,
            } => write!(
                f,
                "condbr {}, label %{}, label %{}",
                operand(0),
                self.block(*then_dest).name,
                self.block(*else_dest).name
            )?,
            Opcode::Switch { default, cases } => {
                write!(f, "switch {}, label %{} [", operand(0), self.block(*default).name)?;
                for (i, (val, dest)) in cases.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} label %{}", val, self.block(*dest).name)?;
                }
                write!(f, "]")?;
            }
            Opcode::Unreachable => write!(f, "unreachable")?,
            Opcode::Call | Opcode::Invoke { .. } => {
                let attrs = inst.call_attrs.as_ref().unwrap();
                let kw = if matches!(inst.op, Opcode::Call) {
                    "call"
                } else {
                    "invoke"
                };
                write!(f, "{} ", kw)?;
                let ret_attrs = fmt_attrs(&attrs.ret_attrs);
                if !ret_attrs.is_empty() {
                    write!(f, "{} ", ret_attrs)?;
                }
                write!(
                    f,
                    "{} {}(",
                    fmt_ty(ty),
                    namer.of(self, inst.operands[0])
                )?;
                for (i, &arg) in inst.operands[1..].iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} ", fmt_ty(self.ty_of(arg)))?;
                    let arg_attrs = fmt_attrs(&attrs.arg_attrs[i]);
                    if !arg_attrs.is_empty() {
                        write!(f, "{} ", arg_attrs)?;
                    }
                    write!(f, "{}", namer.of(self, arg))?;
                }
                write!(f, ")")?;
                let fn_attrs = fmt_attrs(&attrs.fn_attrs);
                if !fn_attrs.is_empty() {
                    write!(f, " {}", fn_attrs)?;
                }
                if let Opcode::Invoke { normal, unwind } = &inst.op {
                    write!(
                        f,
                        " to label %{} unwind label %{}",
                        self.block(*normal).name,
                        self.block(*unwind).name
                    )?;
                }
            }
            Opcode::Load {
                volatile,
                ordering,
                align,
            } => {
                write!(f, "load ")?;
                if *volatile {
                    write!(f, "volatile ")?;
                }
                if *ordering != AtomicOrdering::NotAtomic {
                    write!(f, "atomic {:?} ", ordering)?;
                }
                write!(f, "{}, {}", fmt_ty(ty), operand(0))?;
                if *align > 0 {
                    write!(f, ", align {}", align)?;
                }
            }
            Opcode::Store {
                volatile,
                ordering,
                align,
            } => {
                write!(f, "store ")?;
                if *volatile {
                    write!(f, "volatile ")?;
                }
                if *ordering != AtomicOrdering::NotAtomic {
                    write!(f, "atomic {:?} ", ordering)?;
                }
                write!(f, "{}, {}", operand(0), operand(1))?;
                if *align > 0 {
                    write!(f, ", align {}", align)?;
                }
            }
            Opcode::Alloca { allocated } => {
                write!(f, "alloca {}", fmt_ty(allocated))?;
                if !inst.operands.is_empty() {
                    write!(f, ", {}", operand(0))?;
                }
            }
            Opcode::Gep => write!(f, "gep {}, {}", operand(0), operand(1))?,
            Opcode::BinOp(kind) => {
                let name = format!("{:?}", kind).to_lowercase();
                write!(f, "{} {}, {}", name, operand(0), operand(1))?;
            }
            Opcode::Icmp(pred) => {
                let name = format!("{:?}", pred).to_lowercase();
                write!(f, "icmp {} {}, {}", name, operand(0), operand(1))?;
            }
            Opcode::Cast(kind) => {
                let name = format!("{:?}", kind).to_lowercase();
                write!(f, "{} {} to {}", name, operand(0), fmt_ty(ty))?;
            }
            Opcode::Select => {
                write!(f, "select {}, {}, {}", operand(0), operand(1), operand(2))?
            }
            Opcode::Phi { blocks } => {
                write!(f, "phi {} ", fmt_ty(ty))?;
                for (i, (&op, &bb)) in inst.operands.iter().zip(blocks.iter()).enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(
                        f,
                        "[{}, %{}]",
                        namer.of(self, op),
                        self.block(bb).name
                    )?;
                }
            }
        }
        if let Some((lo, hi)) = self.val(v).range {
            write!(f, " !range({}, {})", lo, hi)?;
        }
        Ok(())
    }
}

/// Collect the transitive users of `v`, following only live instructions. Used by analyses that
/// need "all uses, ever" rather than a filtered walk.
pub fn transitive_users(m: &Module, v: Val) -> Vec<Val> {
    let mut seen: UnorderedSet<Val> = Default::default();
    let mut worklist = vec![v];
    let mut out = vec![];
    while let Some(cur) = worklist.pop() {
        for use_ref in &m.val(cur).uses {
            if seen.insert(use_ref.user) {
                out.push(use_ref.user);
                worklist.push(use_ref.user);
            }
        }
    }
    out
}
