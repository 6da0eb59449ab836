//! Positions: the IR locations at which deduced facts apply.
//!
//! A fact never floats free; it is always attached to a function, an argument, a return, a call
//! site, a call-site argument, a call-site return, or an intermediate value. Positions are small
//! copyable keys into the IR, totally ordered and hashable so they can index the engine's record
//! cache.

use crate::ir::{Attr, AttrKindTag, Func, Module, Val};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Position {
    Invalid,
    /// A free-floating intermediate value.
    Float(Val),
    Function(Func),
    /// The returned value of a function.
    Returned(Func),
    /// A call-like instruction, standing for facts about the callee as seen from this site.
    CallSite(Val),
    /// The value a call-like instruction produces.
    CallSiteReturned(Val),
    /// Argument `1` of function `0`.
    Argument(Func, usize),
    /// Argument operand `1` of call-like instruction `0`.
    CallSiteArgument(Val, usize),
}

impl Position {
    /// The value this position names, if it names one. For arguments this is the argument value
    /// itself (the *anchor* is the enclosing function); function and returned positions name no
    /// single value.
    pub fn associated_value(&self, m: &Module) -> Option<Val> {
        match *self {
            Position::Invalid | Position::Function(_) | Position::Returned(_) => None,
            Position::Float(v) => Some(v),
            Position::CallSite(c) | Position::CallSiteReturned(c) => Some(c),
            Position::Argument(f, i) => m.func(f).args.get(i).copied(),
            Position::CallSiteArgument(c, i) => m.call_args(c).get(i).copied(),
        }
    }

    /// The function whose body anchors this position. For call-site positions this is the caller.
    pub fn anchor_func(&self, m: &Module) -> Option<Func> {
        match *self {
            Position::Invalid => None,
            Position::Float(v) => m.parent_func(v),
            Position::Function(f) | Position::Returned(f) | Position::Argument(f, _) => Some(f),
            Position::CallSite(c)
            | Position::CallSiteReturned(c)
            | Position::CallSiteArgument(c, _) => m.parent_func(c),
        }
    }

    /// The function the fact is *about*. For call-site positions this is the direct callee, when
    /// there is one.
    pub fn callee_func(&self, m: &Module) -> Option<Func> {
        match *self {
            Position::Function(f) | Position::Returned(f) | Position::Argument(f, _) => Some(f),
            Position::CallSite(c)
            | Position::CallSiteReturned(c)
            | Position::CallSiteArgument(c, _) => m.callee_of(c),
            _ => None,
        }
    }

    pub fn arg_index(&self) -> Option<usize> {
        match *self {
            Position::Argument(_, i) | Position::CallSiteArgument(_, i) => Some(i),
            _ => None,
        }
    }

    /// The instruction that serves as the program point for context-sensitive reasoning
    /// (must-be-executed walks): the call for call-site positions, the instruction itself for
    /// floating instruction values, and the first instruction of the entry block for arguments.
    pub fn context_inst(&self, m: &Module) -> Option<Val> {
        match *self {
            Position::Float(v) => m.inst(v).map(|_| v),
            Position::CallSite(c)
            | Position::CallSiteReturned(c)
            | Position::CallSiteArgument(c, _) => Some(c),
            Position::Argument(f, _) | Position::Function(f) => m
                .entry_block(f)
                .and_then(|b| m.insts_of(b).next()),
            _ => None,
        }
    }

    pub fn is_call_site_position(&self) -> bool {
        matches!(
            self,
            Position::CallSite(_)
                | Position::CallSiteReturned(_)
                | Position::CallSiteArgument(_, _)
        )
    }

    /// The canonical sequence of coarser positions whose facts subsume facts at this position.
    /// The sequence starts with the position itself. A call-site return yields the callee's
    /// returned and function positions, and the callee's `returned`-attributed arguments.
    pub fn subsuming(&self, m: &Module) -> Vec<Position> {
        let mut out = vec![*self];
        match *self {
            Position::CallSiteArgument(c, i) => {
                if let Some(callee) = m.callee_of(c) {
                    if i < m.func(callee).ty.params.len() {
                        out.push(Position::Argument(callee, i));
                    }
                }
            }
            Position::CallSite(c) => {
                if let Some(callee) = m.callee_of(c) {
                    out.push(Position::Function(callee));
                }
            }
            Position::CallSiteReturned(c) => {
                if let Some(callee) = m.callee_of(c) {
                    out.push(Position::Returned(callee));
                    out.push(Position::Function(callee));
                    for (i, attrs) in m.func(callee).arg_attrs.iter().enumerate() {
                        if attrs.has(AttrKindTag::Returned) {
                            out.push(Position::Argument(callee, i));
                        }
                    }
                }
            }
            Position::Returned(f) => {
                out.push(Position::Function(f));
            }
            _ => {}
        }
        out
    }

    /// IR attributes present directly at this position (no subsumption walk).
    pub fn direct_attrs<'m>(&self, m: &'m Module) -> Option<&'m crate::ir::AttrSet> {
        match *self {
            Position::Function(f) => Some(&m.func(f).fn_attrs),
            Position::Returned(f) => Some(&m.func(f).ret_attrs),
            Position::Argument(f, i) => m.func(f).arg_attrs.get(i),
            Position::CallSite(c) => m
                .inst(c)
                .and_then(|inst| inst.call_attrs.as_deref())
                .map(|a| &a.fn_attrs),
            Position::CallSiteReturned(c) => m
                .inst(c)
                .and_then(|inst| inst.call_attrs.as_deref())
                .map(|a| &a.ret_attrs),
            Position::CallSiteArgument(c, i) => m
                .inst(c)
                .and_then(|inst| inst.call_attrs.as_deref())
                .and_then(|a| a.arg_attrs.get(i)),
            Position::Invalid | Position::Float(_) => None,
        }
    }

    /// All IR-level attributes of the given kinds visible at this position, walking the subsuming
    /// sequence from most specific to least.
    pub fn attrs_at(&self, m: &Module, kinds: &[AttrKindTag]) -> Vec<Attr> {
        let mut out = vec![];
        for pos in self.subsuming(m) {
            if let Some(set) = pos.direct_attrs(m) {
                for &kind in kinds {
                    if let Some(attr) = set.get(kind) {
                        out.push(attr);
                    }
                }
            }
        }
        out
    }

    pub fn has_attr(&self, m: &Module, kind: AttrKindTag) -> bool {
        !self.attrs_at(m, &[kind]).is_empty()
    }

    /// Human-readable rendering, for diagnostics and trace logging.
    pub fn describe(&self, m: &Module) -> String {
        match *self {
            Position::Invalid => "invalid".to_owned(),
            Position::Float(v) => format!("value {:?}", v),
            Position::Function(f) => format!("fn @{}", m.func(f).name),
            Position::Returned(f) => format!("ret of @{}", m.func(f).name),
            Position::CallSite(c) => format!("call site {:?}", c),
            Position::CallSiteReturned(c) => format!("ret of call site {:?}", c),
            Position::Argument(f, i) => format!("arg #{} of @{}", i, m.func(f).name),
            Position::CallSiteArgument(c, i) => format!("arg #{} of call site {:?}", i, c),
        }
    }
}
