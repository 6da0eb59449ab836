//! A reader for the textual form of the IR, the same form the printer emits.
//!
//! The format is line-oriented: one `define`/`declare` header per function, one label per block,
//! one instruction per line. The reader is a driver/debugging tool; malformed input panics with
//! the offending line.

use crate::containers::unordered::UnorderedMap;
use crate::ir::{
    AtomicOrdering, Attr, AttrSet, BinOpKind, Block, CallSiteAttrs, CastKind, Func, FuncTy,
    IcmpPred, Module, Opcode, Ty, UseRef, Val,
};

/// Parse a whole module from its textual form.
pub fn parse_module(text: &str) -> Module {
    Parser::new(text).parse()
}

struct Cursor<'a> {
    line: &'a str,
    pos: usize,
    lineno: usize,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str, lineno: usize) -> Self {
        Self { line, pos: 0, lineno }
    }

    fn rest(&self) -> &'a str {
        &self.line[self.pos..]
    }

    fn skip_ws(&mut self) {
        while self.rest().starts_with(|c: char| c == ' ' || c == '\t') {
            self.pos += 1;
        }
    }

    fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.rest().is_empty()
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.rest().chars().next()
    }

    fn eat(&mut self, prefix: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, prefix: &str) {
        if !self.eat(prefix) {
            self.fail(&format!("expected `{}`", prefix));
        }
    }

    fn fail(&self, msg: &str) -> ! {
        panic!(
            "line {}: {} (at `{}` in `{}`)",
            self.lineno,
            msg,
            self.rest(),
            self.line
        );
    }

    /// An identifier-like word: letters, digits, `_`, `.`.
    fn word(&mut self) -> &'a str {
        self.skip_ws();
        let rest = self.rest();
        let end = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
            .unwrap_or(rest.len());
        if end == 0 {
            self.fail("expected a word");
        }
        self.pos += end;
        &rest[..end]
    }

    fn integer(&mut self) -> i128 {
        self.skip_ws();
        let rest = self.rest();
        let mut end = 0;
        let bytes = rest.as_bytes();
        if end < bytes.len() && bytes[end] == b'-' {
            end += 1;
        }
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end == 0 || (end == 1 && bytes[0] == b'-') {
            self.fail("expected an integer");
        }
        self.pos += end;
        rest[..end].parse().unwrap()
    }

    /// `%name` or `@name`, returning the full sigil-prefixed token.
    fn sigil_name(&mut self) -> String {
        self.skip_ws();
        let sigil = match self.rest().chars().next() {
            Some(c @ ('%' | '@')) => c,
            _ => self.fail("expected a %value or @function name"),
        };
        self.pos += 1;
        format!("{}{}", sigil, self.word())
    }

    fn parse_ty(&mut self) -> Ty {
        self.skip_ws();
        let mut base = if self.eat("void") {
            Ty::Void
        } else if self.eat("float") {
            Ty::Float
        } else if self.eat("[") {
            let n = self.integer();
            self.expect("x");
            let elem = self.parse_ty();
            self.expect("]");
            Ty::Array(Box::new(elem), n as u64)
        } else if self.eat("{") {
            let mut fields = vec![];
            if !self.eat("}") {
                loop {
                    fields.push(self.parse_ty());
                    if self.eat("}") {
                        break;
                    }
                    self.expect(",");
                }
            }
            Ty::Struct(fields)
        } else if self.rest().starts_with('i') {
            self.pos += 1;
            let bits: u32 = {
                let rest = self.rest();
                let end = rest
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(rest.len());
                if end == 0 {
                    self.fail("expected an integer width after `i`");
                }
                let bits = rest[..end].parse().unwrap();
                self.pos += end;
                bits
            };
            Ty::Int(bits)
        } else {
            self.fail("expected a type");
        };
        while self.rest().starts_with('*') {
            self.pos += 1;
            base = Ty::Ptr(Box::new(base));
        }
        base
    }

    /// Attribute words, stopping at anything that is not one.
    fn parse_attrs(&mut self) -> AttrSet {
        let mut attrs = AttrSet::new();
        loop {
            self.skip_ws();
            let rest = self.rest();
            let attr = if rest.starts_with("nounwind") {
                self.pos += "nounwind".len();
                Attr::NoUnwind
            } else if rest.starts_with("nosync") {
                self.pos += "nosync".len();
                Attr::NoSync
            } else if rest.starts_with("nofree") {
                self.pos += "nofree".len();
                Attr::NoFree
            } else if rest.starts_with("norecurse") {
                self.pos += "norecurse".len();
                Attr::NoRecurse
            } else if rest.starts_with("willreturn") {
                self.pos += "willreturn".len();
                Attr::WillReturn
            } else if rest.starts_with("noreturn") {
                self.pos += "noreturn".len();
                Attr::NoReturn
            } else if rest.starts_with("noalias") {
                self.pos += "noalias".len();
                Attr::NoAlias
            } else if rest.starts_with("nonnull") {
                self.pos += "nonnull".len();
                Attr::NonNull
            } else if rest.starts_with("nocapture") {
                self.pos += "nocapture".len();
                Attr::NoCapture
            } else if rest.starts_with("readnone") {
                self.pos += "readnone".len();
                Attr::ReadNone
            } else if rest.starts_with("readonly") {
                self.pos += "readonly".len();
                Attr::ReadOnly
            } else if rest.starts_with("writeonly") {
                self.pos += "writeonly".len();
                Attr::WriteOnly
            } else if rest.starts_with("returned") {
                self.pos += "returned".len();
                Attr::Returned
            } else if rest.starts_with("byval") {
                self.pos += "byval".len();
                Attr::ByVal
            } else if rest.starts_with("convergent") {
                self.pos += "convergent".len();
                Attr::Convergent
            } else if rest.starts_with("null_pointer_is_valid") {
                self.pos += "null_pointer_is_valid".len();
                Attr::NullPointerIsValid
            } else if rest.starts_with("dereferenceable_or_null(") {
                self.pos += "dereferenceable_or_null(".len();
                let n = self.integer() as u64;
                self.expect(")");
                Attr::DereferenceableOrNull(n)
            } else if rest.starts_with("dereferenceable(") {
                self.pos += "dereferenceable(".len();
                let n = self.integer() as u64;
                self.expect(")");
                Attr::Dereferenceable(n)
            } else if rest.starts_with("align(") {
                self.pos += "align(".len();
                let n = self.integer() as u64;
                self.expect(")");
                Attr::Align(n)
            } else {
                break;
            };
            attrs.add(attr);
        }
        attrs
    }
}

/// A not-yet-resolved operand of a parsed instruction.
enum RawVal {
    Named(String),
    Int(u32, i128),
    Null(Ty),
    Undef(Ty),
}

struct Parser<'a> {
    lines: Vec<(usize, &'a str)>,
    m: Module,
}

struct FuncEnv {
    values: UnorderedMap<String, Val>,
    blocks: UnorderedMap<String, Block>,
    fixups: Vec<(Val, usize, String)>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        let lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| {
                let l = match l.find(';') {
                    Some(p) => &l[..p],
                    None => l,
                };
                (i + 1, l.trim_end())
            })
            .filter(|(_, l)| !l.trim().is_empty())
            .collect();
        Self {
            lines,
            m: Module::new(),
        }
    }

    fn parse(mut self) -> Module {
        // First pass: register every function signature, so calls can resolve forward.
        let mut i = 0;
        while i < self.lines.len() {
            let (lineno, line) = self.lines[i];
            let trimmed = line.trim_start();
            if trimmed.starts_with("define") || trimmed.starts_with("declare") {
                self.parse_header(line, lineno, true);
            }
            i += 1;
        }
        // Second pass: bodies.
        let mut i = 0;
        while i < self.lines.len() {
            let (lineno, line) = self.lines[i];
            let trimmed = line.trim_start();
            if trimmed.starts_with("define") {
                i = self.parse_body(i, line, lineno);
            } else {
                i += 1;
            }
        }
        self.m
    }

    /// Parse one `define`/`declare` header. With `register`, the function is created; otherwise
    /// the pre-registered one is looked up and its argument names are returned.
    fn parse_header(&mut self, line: &str, lineno: usize, register: bool) -> (Func, Vec<String>) {
        let mut c = Cursor::new(line, lineno);
        if !c.eat("define") {
            c.expect("declare");
        }
        let internal = c.eat("internal");
        let ret_attrs = c.parse_attrs();
        let ret_ty = c.parse_ty();
        c.skip_ws();
        let name = {
            let token = c.sigil_name();
            match token.strip_prefix('@') {
                Some(n) => n.to_owned(),
                None => c.fail("expected @function name"),
            }
        };
        c.expect("(");
        let mut params = vec![];
        let mut param_attrs = vec![];
        let mut param_names = vec![];
        if !c.eat(")") {
            loop {
                let ty = c.parse_ty();
                let attrs = c.parse_attrs();
                let pname = if matches!(c.peek(), Some('%')) {
                    c.sigil_name()
                } else {
                    format!("%__arg{}", params.len())
                };
                params.push(ty);
                param_attrs.push(attrs);
                param_names.push(pname);
                if c.eat(")") {
                    break;
                }
                c.expect(",");
            }
        }
        let fn_attrs = c.parse_attrs();
        let has_personality = c.eat("personality");
        let _ = c.eat("{");

        let f = if register {
            assert!(
                self.m.func_by_name(&name).is_none(),
                "line {}: duplicate function @{}",
                lineno,
                name
            );
            let f = Func(self.m.functions.len());
            let args_attrs = param_attrs.clone();
            self.m.functions.push(crate::ir::FunctionData {
                name: name.clone(),
                ty: FuncTy {
                    ret: Box::new(ret_ty),
                    params: params.clone(),
                    varargs: false,
                },
                args: vec![],
                blocks: vec![],
                internal,
                has_personality,
                fn_attrs,
                ret_attrs,
                arg_attrs: args_attrs,
                deleted: false,
            });
            let args = params
                .iter()
                .enumerate()
                .map(|(index, ty)| self.m.push_arg_value(ty.clone(), f, index))
                .collect();
            self.m.functions[f.0].args = args;
            f
        } else {
            self.m
                .func_by_name(&name)
                .unwrap_or_else(|| panic!("line {}: unknown function @{}", lineno, name))
        };
        (f, param_names)
    }

    /// Parse the body of the definition headed at line index `start`; returns the index past the
    /// closing brace.
    fn parse_body(&mut self, start: usize, header: &str, header_lineno: usize) -> usize {
        let (f, param_names) = self.parse_header(header, header_lineno, false);
        let mut env = FuncEnv {
            values: Default::default(),
            blocks: Default::default(),
            fixups: vec![],
        };
        for (name, &arg) in param_names.iter().zip(self.m.func(f).args.iter()) {
            env.values.insert(name.clone(), arg);
        }

        // Scan for labels first so branches can resolve forward.
        let mut end = start + 1;
        while end < self.lines.len() && self.lines[end].1.trim() != "}" {
            let (lineno, line) = self.lines[end];
            let trimmed = line.trim();
            if let Some(label_part) = Self::label_of(trimmed) {
                let mut c = Cursor::new(label_part, lineno);
                let label = c.word().to_owned();
                c.expect(":");
                let max_trip_count = if c.eat("!max_trip_count(") {
                    let n = c.integer() as u64;
                    c.expect(")");
                    Some(n)
                } else {
                    None
                };
                let b = Block(self.m.blocks.len());
                self.m.blocks.push(crate::ir::BlockData {
                    func: f,
                    name: label.clone(),
                    insts: vec![],
                    deleted: false,
                    max_trip_count,
                });
                self.m.functions[f.0].blocks.push(b);
                assert!(
                    env.blocks.insert(label.clone(), b).is_none(),
                    "line {}: duplicate label {}",
                    lineno,
                    label
                );
            }
            end += 1;
        }
        assert!(
            end < self.lines.len(),
            "line {}: unterminated function body",
            header_lineno
        );

        // Now the instructions, in order.
        let mut cur_block: Option<Block> = None;
        for i in start + 1..end {
            let (lineno, line) = self.lines[i];
            let trimmed = line.trim();
            if let Some(label_part) = Self::label_of(trimmed) {
                let mut c = Cursor::new(label_part, lineno);
                let label = c.word().to_owned();
                cur_block = Some(env.blocks[&label]);
                continue;
            }
            let b = cur_block.unwrap_or_else(|| {
                panic!("line {}: instruction before any label", lineno)
            });
            self.parse_inst(line, lineno, f, b, &mut env);
        }

        // Resolve forward value references.
        for (user, index, name) in std::mem::take(&mut env.fixups) {
            let target = env
                .values
                .get(&name)
                .copied()
                .unwrap_or_else(|| panic!("undefined value {} in @{}", name, self.m.func(f).name));
            self.m.replace_use(UseRef { user, index }, target);
        }
        end + 1
    }

    /// Whether a trimmed line is a block label, returning it if so.
    fn label_of(line: &str) -> Option<&str> {
        let head = line.split_whitespace().next()?;
        if head.ends_with(':')
            && !head.starts_with('%')
            && head
                .chars()
                .next()
                .map_or(false, |c| c.is_alphabetic() || c == '_')
        {
            Some(line)
        } else {
            None
        }
    }

    /// `<ty> <value>` where value is a name, integer, `null`, or `undef`.
    fn parse_typed_value(&mut self, c: &mut Cursor) -> (Ty, RawVal) {
        let ty = c.parse_ty();
        c.skip_ws();
        let raw = self.parse_value_of_ty(c, &ty);
        (ty, raw)
    }

    fn parse_value_of_ty(&mut self, c: &mut Cursor, ty: &Ty) -> RawVal {
        c.skip_ws();
        let rest = c.rest();
        if rest.starts_with('%') || rest.starts_with('@') {
            RawVal::Named(c.sigil_name())
        } else if rest.starts_with("null") {
            c.pos += "null".len();
            match ty.pointee() {
                Some(p) => RawVal::Null(p.clone()),
                None => c.fail("null needs a pointer type"),
            }
        } else if rest.starts_with("undef") {
            c.pos += "undef".len();
            RawVal::Undef(ty.clone())
        } else {
            let v = c.integer();
            match ty {
                Ty::Int(bits) => RawVal::Int(*bits, v),
                _ => c.fail("integer literal needs an integer type"),
            }
        }
    }

    /// Turn a raw operand into a value, creating constants and forward-reference placeholders as
    /// needed. Placeholder slots are recorded for fixup.
    fn resolve(&mut self, raw: RawVal, env: &FuncEnv) -> Result<Val, String> {
        match raw {
            RawVal::Named(name) => {
                if let Some(stripped) = name.strip_prefix('@') {
                    let f = self
                        .m
                        .func_by_name(stripped)
                        .unwrap_or_else(|| panic!("unknown function {}", name));
                    Ok(self.m.func_ref(f))
                } else {
                    match env.values.get(&name) {
                        Some(&v) => Ok(v),
                        None => Err(name),
                    }
                }
            }
            RawVal::Int(bits, v) => Ok(self.m.const_int(bits, v)),
            RawVal::Null(pointee) => Ok(self.m.const_null(pointee)),
            RawVal::Undef(ty) => Ok(self.m.undef(ty)),
        }
    }

    fn parse_label(&mut self, c: &mut Cursor, env: &FuncEnv) -> Block {
        c.expect("label");
        let name = c.sigil_name();
        let name = name.strip_prefix('%').unwrap_or(&name);
        env.blocks
            .get(name)
            .copied()
            .unwrap_or_else(|| c.fail(&format!("unknown label {}", name)))
    }

    fn parse_inst(&mut self, line: &str, lineno: usize, f: Func, b: Block, env: &mut FuncEnv) {
        let mut c = Cursor::new(line, lineno);
        let result_name = if c.rest().trim_start().starts_with('%') {
            let name = c.sigil_name();
            c.expect("=");
            Some(name)
        } else {
            None
        };

        let mut raw_operands: Vec<RawVal> = vec![];
        let mut ty = Ty::Void;
        let op: Opcode;
        let mut call_attrs: Option<Box<CallSiteAttrs>> = None;

        c.skip_ws();
        let keyword = {
            let rest = c.rest();
            let end = rest
                .find(|ch: char| !ch.is_alphanumeric() && ch != '_')
                .unwrap_or(rest.len());
            let kw = &rest[..end];
            c.pos += end;
            kw.to_owned()
        };

        match keyword.as_str() {
            "ret" => {
                if c.eat("void") {
                    op = Opcode::Ret;
                } else {
                    let (_, raw) = self.parse_typed_value(&mut c);
                    raw_operands.push(raw);
                    op = Opcode::Ret;
                }
            }
            "br" => {
                let dest = self.parse_label(&mut c, env);
                op = Opcode::Br(dest);
            }
            "condbr" => {
                let (_, raw) = self.parse_typed_value(&mut c);
                raw_operands.push(raw);
                c.expect(",");
                let then_dest = self.parse_label(&mut c, env);
                c.expect(",");
                let else_dest = self.parse_label(&mut c, env);
                op = Opcode::CondBr {
                    then_dest,
                    else_dest,
                };
            }
            "switch" => {
                let (_, raw) = self.parse_typed_value(&mut c);
                raw_operands.push(raw);
                c.expect(",");
                let default = self.parse_label(&mut c, env);
                c.expect("[");
                let mut cases = vec![];
                if !c.eat("]") {
                    loop {
                        let case = c.integer();
                        let dest = self.parse_label(&mut c, env);
                        cases.push((case, dest));
                        if c.eat("]") {
                            break;
                        }
                        c.expect(",");
                    }
                }
                op = Opcode::Switch { default, cases };
            }
            "unreachable" => {
                op = Opcode::Unreachable;
            }
            "call" | "invoke" => {
                let ret_attrs = c.parse_attrs();
                ty = c.parse_ty();
                let callee = RawVal::Named(c.sigil_name());
                raw_operands.push(callee);
                c.expect("(");
                let mut arg_attrs = vec![];
                if !c.eat(")") {
                    loop {
                        let arg_ty = c.parse_ty();
                        let attrs = c.parse_attrs();
                        let raw = self.parse_value_of_ty(&mut c, &arg_ty);
                        raw_operands.push(raw);
                        arg_attrs.push(attrs);
                        if c.eat(")") {
                            break;
                        }
                        c.expect(",");
                    }
                }
                let fn_attrs = c.parse_attrs();
                call_attrs = Some(Box::new(CallSiteAttrs {
                    fn_attrs,
                    ret_attrs,
                    arg_attrs,
                }));
                if keyword == "invoke" {
                    c.expect("to");
                    let normal = self.parse_label(&mut c, env);
                    c.expect("unwind");
                    let unwind = self.parse_label(&mut c, env);
                    op = Opcode::Invoke { normal, unwind };
                } else {
                    op = Opcode::Call;
                }
            }
            "load" => {
                let volatile = c.eat("volatile");
                let ordering = self.parse_ordering(&mut c);
                ty = c.parse_ty();
                c.expect(",");
                let (_, raw) = self.parse_typed_value(&mut c);
                raw_operands.push(raw);
                let align = if c.eat(", align") { c.integer() as u64 } else { 0 };
                op = Opcode::Load {
                    volatile,
                    ordering,
                    align,
                };
            }
            "store" => {
                let volatile = c.eat("volatile");
                let ordering = self.parse_ordering(&mut c);
                let (_, value) = self.parse_typed_value(&mut c);
                c.expect(",");
                let (_, ptr) = self.parse_typed_value(&mut c);
                raw_operands.push(value);
                raw_operands.push(ptr);
                let align = if c.eat(", align") { c.integer() as u64 } else { 0 };
                op = Opcode::Store {
                    volatile,
                    ordering,
                    align,
                };
            }
            "alloca" => {
                let allocated = c.parse_ty();
                if c.eat(",") {
                    let (_, count) = self.parse_typed_value(&mut c);
                    raw_operands.push(count);
                }
                ty = Ty::Ptr(Box::new(allocated.clone()));
                op = Opcode::Alloca { allocated };
            }
            "gep" => {
                let (base_ty, base) = self.parse_typed_value(&mut c);
                c.expect(",");
                let (_, offset) = self.parse_typed_value(&mut c);
                raw_operands.push(base);
                raw_operands.push(offset);
                ty = base_ty;
                op = Opcode::Gep;
            }
            "select" => {
                let (_, cond) = self.parse_typed_value(&mut c);
                c.expect(",");
                let (arm_ty, t) = self.parse_typed_value(&mut c);
                c.expect(",");
                let (_, e) = self.parse_typed_value(&mut c);
                raw_operands.push(cond);
                raw_operands.push(t);
                raw_operands.push(e);
                ty = arm_ty;
                op = Opcode::Select;
            }
            "phi" => {
                ty = c.parse_ty();
                let mut blocks = vec![];
                loop {
                    c.expect("[");
                    let raw = self.parse_value_of_ty(&mut c, &ty);
                    c.expect(",");
                    let name = c.sigil_name();
                    let name = name.strip_prefix('%').unwrap_or(&name).to_owned();
                    let pred = env
                        .blocks
                        .get(&name)
                        .copied()
                        .unwrap_or_else(|| c.fail(&format!("unknown label {}", name)));
                    c.expect("]");
                    raw_operands.push(raw);
                    blocks.push(pred);
                    if !c.eat(",") {
                        break;
                    }
                }
                op = Opcode::Phi { blocks };
            }
            "icmp" => {
                let pred = match c.word() {
                    "eq" => IcmpPred::Eq,
                    "ne" => IcmpPred::Ne,
                    "ult" => IcmpPred::Ult,
                    "ule" => IcmpPred::Ule,
                    "ugt" => IcmpPred::Ugt,
                    "uge" => IcmpPred::Uge,
                    "slt" => IcmpPred::Slt,
                    "sle" => IcmpPred::Sle,
                    "sgt" => IcmpPred::Sgt,
                    "sge" => IcmpPred::Sge,
                    other => c.fail(&format!("unknown icmp predicate `{}`", other)),
                };
                let (_, x) = self.parse_typed_value(&mut c);
                c.expect(",");
                let (_, y) = self.parse_typed_value(&mut c);
                raw_operands.push(x);
                raw_operands.push(y);
                ty = Ty::Int(1);
                op = Opcode::Icmp(pred);
            }
            "bitcast" | "zext" | "sext" | "trunc" | "ptrtoint" | "inttoptr" => {
                let kind = match keyword.as_str() {
                    "bitcast" => CastKind::Bitcast,
                    "zext" => CastKind::ZExt,
                    "sext" => CastKind::SExt,
                    "trunc" => CastKind::Trunc,
                    "ptrtoint" => CastKind::PtrToInt,
                    _ => CastKind::IntToPtr,
                };
                let (_, raw) = self.parse_typed_value(&mut c);
                raw_operands.push(raw);
                c.expect("to");
                ty = c.parse_ty();
                op = Opcode::Cast(kind);
            }
            binop => {
                let kind = match binop {
                    "add" => BinOpKind::Add,
                    "sub" => BinOpKind::Sub,
                    "mul" => BinOpKind::Mul,
                    "udiv" => BinOpKind::UDiv,
                    "sdiv" => BinOpKind::SDiv,
                    "urem" => BinOpKind::URem,
                    "srem" => BinOpKind::SRem,
                    "and" => BinOpKind::And,
                    "or" => BinOpKind::Or,
                    "xor" => BinOpKind::Xor,
                    "shl" => BinOpKind::Shl,
                    "lshr" => BinOpKind::LShr,
                    "ashr" => BinOpKind::AShr,
                    other => c.fail(&format!("unknown instruction `{}`", other)),
                };
                let (x_ty, x) = self.parse_typed_value(&mut c);
                c.expect(",");
                let (_, y) = self.parse_typed_value(&mut c);
                raw_operands.push(x);
                raw_operands.push(y);
                ty = x_ty;
                op = Opcode::BinOp(kind);
            }
        }

        // Trailing range metadata.
        let range = if c.eat("!range(") {
            let lo = c.integer();
            c.expect(",");
            let hi = c.integer();
            c.expect(")");
            Some((lo, hi))
        } else {
            None
        };
        if !c.at_end() {
            c.fail("trailing tokens");
        }
        let _ = f;

        // Resolve operands, leaving placeholders for forward references.
        let mut operands = vec![];
        let mut pending: Vec<(usize, String)> = vec![];
        for (index, raw) in raw_operands.into_iter().enumerate() {
            match self.resolve(raw, env) {
                Ok(v) => operands.push(v),
                Err(name) => {
                    let placeholder = self.m.undef(Ty::Void);
                    operands.push(placeholder);
                    pending.push((index, name));
                }
            }
        }
        let v = self.m.append_inst(b, ty, op, operands, call_attrs);
        self.m.val_mut(v).range = range;
        for (index, name) in pending {
            env.fixups.push((v, index, name));
        }
        if let Some(name) = result_name {
            assert!(
                env.values.insert(name.clone(), v).is_none(),
                "line {}: duplicate value {}",
                lineno,
                name
            );
        }
    }

    fn parse_ordering(&mut self, c: &mut Cursor) -> AtomicOrdering {
        if !c.eat("atomic") {
            return AtomicOrdering::NotAtomic;
        }
        match c.word() {
            "Unordered" => AtomicOrdering::Unordered,
            "Monotonic" => AtomicOrdering::Monotonic,
            "Acquire" => AtomicOrdering::Acquire,
            "Release" => AtomicOrdering::Release,
            "AcquireRelease" => AtomicOrdering::AcquireRelease,
            "SequentiallyConsistent" => AtomicOrdering::SequentiallyConsistent,
            other => c.fail(&format!("unknown atomic ordering `{}`", other)),
        }
    }
}
