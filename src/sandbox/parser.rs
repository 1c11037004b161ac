//! Recursive-descent parser producing [`Stmt`] trees.

use std::sync::Arc;

use super::ast::*;
use super::fault::Fault;
use super::lexer::{is_keyword, tokenize, unescape, Tok, Token};

/// Maximum nesting of expressions and blocks.
const MAX_NESTING: usize = 100;

/// Parses a whole module body.
pub fn parse_module(src: &str) -> Result<Vec<Stmt>, Fault> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let mut body = Vec::new();
    while !parser.at_eof() {
        if parser.eat_tok(&Tok::Newline) {
            continue;
        }
        body.extend(parser.statement()?);
    }
    Ok(body)
}

/// Parses a single expression, rejecting trailing tokens.
pub fn parse_expression(src: &str) -> Result<Expr, Fault> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.exprlist(true)?;
    parser.eat_tok(&Tok::Newline);
    if !parser.at_eof() {
        return Err(parser.error("invalid syntax"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Tok::Eof)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, msg: impl Into<String>) -> Fault {
        Fault::syntax(self.line(), msg)
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.is_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_tok(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), Fault> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<(), Fault> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", kw)))
        }
    }

    fn identifier(&mut self) -> Result<String, Fault> {
        match self.peek().clone() {
            Tok::Name(name) if !is_keyword(&name) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    fn enter(&mut self) -> Result<(), Fault> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("too many nested parentheses or blocks"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<Vec<Stmt>, Fault> {
        let line = self.line();
        let keyword = match self.peek() {
            Tok::Name(n) => n.clone(),
            Tok::Indent => return Err(self.error("unexpected indent")),
            _ => String::new(),
        };
        let compound = match keyword.as_str() {
            "if" => Some(self.if_stmt()?),
            "while" => Some(self.while_stmt()?),
            "for" => Some(self.for_stmt()?),
            "def" => Some(self.def_stmt()?),
            "try" => Some(self.try_stmt()?),
            "class" => return Err(self.error("class definitions are not supported")),
            "with" => return Err(self.error("'with' statements are not supported")),
            "async" | "await" | "yield" => {
                return Err(self.error(format!("'{}' is not supported", keyword)))
            }
            _ => None,
        };
        if let Some(kind) = compound {
            return Ok(vec![Stmt { kind, line }]);
        }
        if self.is_op("@") {
            return Err(self.error("decorators are not supported"));
        }
        self.simple_statements()
    }

    fn simple_statements(&mut self) -> Result<Vec<Stmt>, Fault> {
        let mut out = Vec::new();
        loop {
            let line = self.line();
            for kind in self.small_statement()? {
                out.push(Stmt { kind, line });
            }
            if !self.eat_op(";") {
                break;
            }
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
        }
        if !self.eat_tok(&Tok::Newline) && !self.at_eof() {
            return Err(self.error("invalid syntax"));
        }
        Ok(out)
    }

    fn small_statement(&mut self) -> Result<Vec<StmtKind>, Fault> {
        let keyword = match self.peek() {
            Tok::Name(n) if is_keyword(n) => n.clone(),
            _ => String::new(),
        };
        let kind = match keyword.as_str() {
            "pass" => {
                self.advance();
                StmtKind::Pass
            }
            "break" => {
                self.advance();
                StmtKind::Break
            }
            "continue" => {
                self.advance();
                StmtKind::Continue
            }
            "return" => {
                self.advance();
                if self.ends_simple() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.exprlist(true)?))
                }
            }
            "raise" => {
                self.advance();
                if self.ends_simple() {
                    StmtKind::Raise(None)
                } else {
                    let exc = self.test()?;
                    if self.eat_kw("from") {
                        self.test()?;
                    }
                    StmtKind::Raise(Some(exc))
                }
            }
            "assert" => {
                self.advance();
                let test = self.test()?;
                let msg = if self.eat_op(",") {
                    Some(self.test()?)
                } else {
                    None
                };
                StmtKind::Assert(test, msg)
            }
            "del" => {
                self.advance();
                let mut targets = vec![self.primary_target()?];
                while self.eat_op(",") {
                    if self.ends_simple() {
                        break;
                    }
                    targets.push(self.primary_target()?);
                }
                StmtKind::Del(targets)
            }
            "global" | "nonlocal" => {
                self.advance();
                let mut names = vec![self.identifier()?];
                while self.eat_op(",") {
                    names.push(self.identifier()?);
                }
                if keyword == "global" {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                }
            }
            "import" => return self.import_stmt(),
            "from" => return self.from_stmt().map(|k| vec![k]),
            _ => self.expr_statement()?,
        };
        Ok(vec![kind])
    }

    fn ends_simple(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof) || self.is_op(";")
    }

    fn dotted_name(&mut self) -> Result<String, Fault> {
        let mut name = self.identifier()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.identifier()?);
        }
        Ok(name)
    }

    fn import_stmt(&mut self) -> Result<Vec<StmtKind>, Fault> {
        self.expect_kw("import")?;
        let mut out = Vec::new();
        loop {
            let module = self.dotted_name()?;
            let alias = if self.eat_kw("as") {
                Some(self.identifier()?)
            } else {
                None
            };
            out.push(StmtKind::Import { module, alias });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(out)
    }

    fn from_stmt(&mut self) -> Result<StmtKind, Fault> {
        self.expect_kw("from")?;
        let module = self.dotted_name()?;
        self.expect_kw("import")?;
        let mut names = Vec::new();
        if self.eat_op("*") {
            names.push(("*".to_string(), None));
            return Ok(StmtKind::ImportFrom { module, names });
        }
        let parens = self.eat_op("(");
        loop {
            let name = self.identifier()?;
            let alias = if self.eat_kw("as") {
                Some(self.identifier()?)
            } else {
                None
            };
            names.push((name, alias));
            if !self.eat_op(",") {
                break;
            }
            if parens && self.is_op(")") {
                break;
            }
        }
        if parens {
            self.expect_op(")")?;
        }
        Ok(StmtKind::ImportFrom { module, names })
    }

    fn expr_statement(&mut self) -> Result<StmtKind, Fault> {
        let first = self.exprlist(true)?;

        if self.eat_op(":") {
            // Annotated assignment; the annotation is evaluated nowhere.
            check_target(&first, self.line())?;
            self.test()?;
            if self.eat_op("=") {
                let value = self.exprlist(true)?;
                return Ok(StmtKind::Assign {
                    targets: vec![first],
                    value,
                });
            }
            return Ok(StmtKind::Pass);
        }

        if let Tok::Op(op) = self.peek().clone() {
            if let Some(bin) = aug_op(op) {
                self.advance();
                if !matches!(first, Expr::Name(_) | Expr::Attribute(..) | Expr::Subscript(..)) {
                    return Err(self.error("illegal expression for augmented assignment"));
                }
                let value = self.exprlist(true)?;
                return Ok(StmtKind::AugAssign {
                    target: first,
                    op: bin,
                    value,
                });
            }
        }

        if self.is_op("=") {
            let mut targets = vec![first];
            let mut value = None;
            while self.eat_op("=") {
                let next = self.exprlist(true)?;
                if let Some(prev) = value.replace(next) {
                    targets.push(prev);
                }
            }
            let line = self.line();
            for target in &targets {
                check_target(target, line)?;
            }
            let value = value.ok_or_else(|| self.error("invalid syntax"))?;
            return Ok(StmtKind::Assign { targets, value });
        }

        Ok(StmtKind::Expr(first))
    }

    fn block(&mut self) -> Result<Vec<Stmt>, Fault> {
        self.expect_op(":")?;
        self.enter()?;
        let body = if self.eat_tok(&Tok::Newline) {
            if !self.eat_tok(&Tok::Indent) {
                return Err(self.error("expected an indented block"));
            }
            let mut body = Vec::new();
            while !self.eat_tok(&Tok::Dedent) {
                if self.at_eof() {
                    break;
                }
                if self.eat_tok(&Tok::Newline) {
                    continue;
                }
                body.extend(self.statement()?);
            }
            body
        } else {
            self.simple_statements()?
        };
        self.leave();
        Ok(body)
    }

    fn if_stmt(&mut self) -> Result<StmtKind, Fault> {
        self.advance();
        let test = self.named_test()?;
        let body = self.block()?;
        let orelse = if self.is_kw("elif") {
            let line = self.line();
            let kind = self.if_stmt()?;
            vec![Stmt { kind, line }]
        } else if self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::If { test, body, orelse })
    }

    fn while_stmt(&mut self) -> Result<StmtKind, Fault> {
        self.advance();
        let test = self.named_test()?;
        let body = self.block()?;
        let orelse = if self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::While { test, body, orelse })
    }

    fn for_stmt(&mut self) -> Result<StmtKind, Fault> {
        self.advance();
        let target = self.target_list()?;
        check_target(&target, self.line())?;
        self.expect_kw("in")?;
        let iter = self.exprlist(false)?;
        let body = self.block()?;
        let orelse = if self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::For {
            target,
            iter,
            body,
            orelse,
        })
    }

    fn def_stmt(&mut self) -> Result<StmtKind, Fault> {
        self.advance();
        let name = self.identifier()?;
        self.expect_op("(")?;
        let mut def = self.parameters(")")?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.test()?;
        }
        def.name = name;
        def.body = self.block()?;
        Ok(StmtKind::FuncDef(Arc::new(def)))
    }

    fn parameters(&mut self, close: &str) -> Result<FuncDef, Fault> {
        let mut def = FuncDef {
            name: String::new(),
            params: Vec::new(),
            vararg: None,
            kwonly: Vec::new(),
            kwarg: None,
            body: Vec::new(),
        };
        let mut seen_star = false;
        let annotations = close == ")";
        while !self.is_op(close) {
            if self.eat_op("**") {
                def.kwarg = Some(self.identifier()?);
                if annotations && self.eat_op(":") {
                    self.test()?;
                }
            } else if self.eat_op("*") {
                seen_star = true;
                if !self.is_op(",") && !self.is_op(close) {
                    def.vararg = Some(self.identifier()?);
                    if annotations && self.eat_op(":") {
                        self.test()?;
                    }
                }
            } else {
                let name = self.identifier()?;
                if annotations && self.eat_op(":") {
                    self.test()?;
                }
                let default = if self.eat_op("=") {
                    Some(self.test()?)
                } else {
                    None
                };
                if def.kwarg.is_some() {
                    return Err(self.error("parameter after **kwargs"));
                }
                let param = Param { name, default };
                if seen_star {
                    def.kwonly.push(param);
                } else {
                    if param.default.is_none() && def.params.iter().any(|p| p.default.is_some()) {
                        return Err(
                            self.error("non-default argument follows default argument")
                        );
                    }
                    def.params.push(param);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(def)
    }

    fn try_stmt(&mut self) -> Result<StmtKind, Fault> {
        self.advance();
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.is_kw("except") {
            let line = self.line();
            self.advance();
            let mut kinds = None;
            let mut name = None;
            if !self.is_op(":") {
                kinds = Some(self.test()?);
                if self.eat_kw("as") {
                    name = Some(self.identifier()?);
                } else if self.eat_op(",") {
                    return Err(self.error("multiple exception types must be parenthesized"));
                }
            }
            let body = self.block()?;
            handlers.push(Handler {
                kinds,
                name,
                body,
                line,
            });
        }
        let orelse = if !handlers.is_empty() && self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_kw("finally") {
            self.block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        })
    }

    // ---- expressions ----

    /// Comma-separated expressions; more than one (or a trailing comma)
    /// forms a tuple.
    fn exprlist(&mut self, allow_named: bool) -> Result<Expr, Fault> {
        let first = self.star_or_test(allow_named)?;
        if !self.is_op(",") {
            if let Expr::Starred(_) = first {
                return Err(self.error("can't use starred expression here"));
            }
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.expression_ends() {
                break;
            }
            items.push(self.star_or_test(allow_named)?);
        }
        Ok(Expr::Tuple(items))
    }

    fn target_list(&mut self) -> Result<Expr, Fault> {
        let first = self.star_or_target()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_kw("in") || self.is_op("=") {
                break;
            }
            items.push(self.star_or_target()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn star_or_target(&mut self) -> Result<Expr, Fault> {
        if self.eat_op("*") {
            return Ok(Expr::Starred(Box::new(self.bitor()?)));
        }
        self.bitor()
    }

    fn expression_ends(&self) -> bool {
        match self.peek() {
            Tok::Newline | Tok::Eof | Tok::Indent | Tok::Dedent => true,
            Tok::Op(op) => matches!(
                *op,
                ")" | "]" | "}" | "=" | ":" | ";" | "+=" | "-=" | "*=" | "/=" | "//=" | "%="
                    | "**=" | "&=" | "|=" | "^=" | ">>=" | "<<="
            ),
            Tok::Name(n) => n == "in",
            _ => false,
        }
    }

    fn star_or_test(&mut self, allow_named: bool) -> Result<Expr, Fault> {
        if self.eat_op("*") {
            return Ok(Expr::Starred(Box::new(self.bitor()?)));
        }
        if allow_named {
            self.named_test()
        } else {
            self.test()
        }
    }

    fn named_test(&mut self) -> Result<Expr, Fault> {
        if matches!(self.peek_at(1), Tok::Op(":=")) {
            if let Tok::Name(name) = self.peek().clone() {
                if !is_keyword(&name) {
                    self.pos += 2;
                    let value = self.test()?;
                    return Ok(Expr::NamedExpr(name, Box::new(value)));
                }
            }
        }
        self.test()
    }

    fn test(&mut self) -> Result<Expr, Fault> {
        self.enter()?;
        let result = self.test_inner();
        self.leave();
        result
    }

    fn test_inner(&mut self) -> Result<Expr, Fault> {
        if self.is_kw("lambda") {
            return self.lambda();
        }
        let body = self.or_test()?;
        if self.eat_kw("if") {
            let test = self.or_test()?;
            self.expect_kw("else")?;
            let orelse = self.test()?;
            return Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn test_no_cond(&mut self) -> Result<Expr, Fault> {
        if self.is_kw("lambda") {
            return self.lambda();
        }
        self.or_test()
    }

    fn lambda(&mut self) -> Result<Expr, Fault> {
        let line = self.line();
        self.advance();
        let mut def = self.parameters(":")?;
        self.expect_op(":")?;
        let body = self.test()?;
        def.name = "<lambda>".to_string();
        def.body = vec![Stmt {
            kind: StmtKind::Return(Some(body)),
            line,
        }];
        Ok(Expr::Lambda(Arc::new(def)))
    }

    fn or_test(&mut self) -> Result<Expr, Fault> {
        let mut left = self.and_test()?;
        while self.eat_kw("or") {
            let right = self.and_test()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_test(&mut self) -> Result<Expr, Fault> {
        let mut left = self.not_test()?;
        while self.eat_kw("and") {
            let right = self.not_test()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_test(&mut self) -> Result<Expr, Fault> {
        if self.eat_kw("not") {
            self.enter()?;
            let operand = self.not_test();
            self.leave();
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, Fault> {
        let left = self.bitor()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::NotEq,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::LtE,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::GtE,
                Tok::Name(n) if n == "in" => CmpOp::In,
                Tok::Name(n) if n == "is" => {
                    if matches!(self.peek_at(1), Tok::Name(m) if m == "not") {
                        self.advance();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                Tok::Name(n) if n == "not" => {
                    if matches!(self.peek_at(1), Tok::Name(m) if m == "in") {
                        self.advance();
                        CmpOp::NotIn
                    } else {
                        break;
                    }
                }
                _ => break,
            };
            self.advance();
            ops.push((op, self.bitor()?));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), ops))
        }
    }

    fn binary_level(
        &mut self,
        table: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Expr, Fault>,
    ) -> Result<Expr, Fault> {
        let mut left = next(self)?;
        'outer: loop {
            for (sym, op) in table {
                if self.eat_op(sym) {
                    let right = next(self)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn bitor(&mut self) -> Result<Expr, Fault> {
        self.binary_level(&[("|", BinOp::BitOr)], Self::bitxor)
    }

    fn bitxor(&mut self) -> Result<Expr, Fault> {
        self.binary_level(&[("^", BinOp::BitXor)], Self::bitand)
    }

    fn bitand(&mut self) -> Result<Expr, Fault> {
        self.binary_level(&[("&", BinOp::BitAnd)], Self::shift)
    }

    fn shift(&mut self) -> Result<Expr, Fault> {
        self.binary_level(&[("<<", BinOp::LShift), (">>", BinOp::RShift)], Self::arith)
    }

    fn arith(&mut self) -> Result<Expr, Fault> {
        self.binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::term)
    }

    fn term(&mut self) -> Result<Expr, Fault> {
        self.binary_level(
            &[
                ("*", BinOp::Mul),
                ("//", BinOp::FloorDiv),
                ("/", BinOp::Div),
                ("%", BinOp::Mod),
            ],
            Self::factor,
        )
    }

    fn factor(&mut self) -> Result<Expr, Fault> {
        let op = match self.peek() {
            Tok::Op("-") => Some(UnaryOp::Neg),
            Tok::Op("+") => Some(UnaryOp::Pos),
            Tok::Op("~") => Some(UnaryOp::Invert),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            self.enter()?;
            let operand = self.factor();
            self.leave();
            let operand = operand?;
            // Negative literals fold into constants.
            if op == UnaryOp::Neg {
                match operand {
                    Expr::Const(Const::Int(n)) => {
                        return Ok(Expr::Const(Const::Int(-n)));
                    }
                    Expr::Const(Const::Float(f)) => {
                        return Ok(Expr::Const(Const::Float(-f)));
                    }
                    other => return Ok(Expr::Unary(op, Box::new(other))),
                }
            }
            return Ok(Expr::Unary(op, Box::new(operand)));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, Fault> {
        let base = self.primary()?;
        if self.eat_op("**") {
            self.enter()?;
            let exp = self.factor();
            self.leave();
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exp?)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, Fault> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                let args = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat_op("[") {
                let index = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::Subscript(Box::new(expr), Box::new(index));
            } else if self.eat_op(".") {
                let name = self.identifier()?;
                expr = Expr::Attribute(Box::new(expr), name);
            } else {
                return Ok(expr);
            }
        }
    }

    /// Target of `del`: a primary expression that is assignable.
    fn primary_target(&mut self) -> Result<Expr, Fault> {
        let target = self.primary()?;
        match target {
            Expr::Name(_) | Expr::Attribute(..) | Expr::Subscript(..) => Ok(target),
            _ => Err(self.error("cannot delete expression")),
        }
    }

    fn call_args(&mut self) -> Result<Vec<Arg>, Fault> {
        self.enter()?;
        let mut args = Vec::new();
        while !self.is_op(")") {
            if self.eat_op("**") {
                args.push(Arg::DoubleStar(self.test()?));
            } else if self.eat_op("*") {
                args.push(Arg::Star(self.test()?));
            } else if let Some(name) = self.keyword_arg_name() {
                self.pos += 2;
                args.push(Arg::Kw(name, self.test()?));
            } else {
                let value = self.named_test()?;
                if self.is_kw("for") {
                    let clauses = self.comp_clauses()?;
                    args.push(Arg::Pos(Expr::Comp {
                        kind: CompKind::Gen,
                        elt: Box::new(value),
                        value: None,
                        clauses,
                    }));
                } else {
                    args.push(Arg::Pos(value));
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        self.leave();
        Ok(args)
    }

    fn keyword_arg_name(&self) -> Option<String> {
        match (self.peek(), self.peek_at(1)) {
            (Tok::Name(name), Tok::Op("=")) if !is_keyword(name) => Some(name.clone()),
            _ => None,
        }
    }

    fn subscript(&mut self) -> Result<Expr, Fault> {
        let first = self.slice_item()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op("]") {
                break;
            }
            items.push(self.slice_item()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn slice_item(&mut self) -> Result<Expr, Fault> {
        let lower = if self.is_op(":") {
            None
        } else {
            let expr = self.named_test()?;
            if !self.is_op(":") {
                return Ok(expr);
            }
            Some(Box::new(expr))
        };
        self.expect_op(":")?;
        let upper = if self.is_op(":") || self.is_op("]") || self.is_op(",") {
            None
        } else {
            Some(Box::new(self.test()?))
        };
        let step = if self.eat_op(":") {
            if self.is_op("]") || self.is_op(",") {
                None
            } else {
                Some(Box::new(self.test()?))
            }
        } else {
            None
        };
        Ok(Expr::Slice { lower, upper, step })
    }

    fn comp_clauses(&mut self) -> Result<Vec<CompClause>, Fault> {
        let mut clauses = Vec::new();
        while self.eat_kw("for") {
            let target = self.target_list()?;
            check_target(&target, self.line())?;
            self.expect_kw("in")?;
            let iter = self.or_test()?;
            let mut conds = Vec::new();
            while self.eat_kw("if") {
                conds.push(self.test_no_cond()?);
            }
            clauses.push(CompClause {
                target,
                iter,
                conds,
            });
        }
        Ok(clauses)
    }

    fn atom(&mut self) -> Result<Expr, Fault> {
        let line = self.line();
        match self.peek().clone() {
            Tok::Int(n) => {
                self.advance();
                Ok(Expr::Const(Const::Int(n)))
            }
            Tok::Float(f) => {
                self.advance();
                Ok(Expr::Const(Const::Float(f)))
            }
            Tok::Str(_) | Tok::FStr(_) => self.strings(),
            Tok::Name(name) => {
                self.advance();
                match name.as_str() {
                    "None" => Ok(Expr::Const(Const::None)),
                    "True" => Ok(Expr::Const(Const::Bool(true))),
                    "False" => Ok(Expr::Const(Const::Bool(false))),
                    n if is_keyword(n) => Err(Fault::syntax(line, "invalid syntax")),
                    _ => Ok(Expr::Name(name)),
                }
            }
            Tok::Op("(") => {
                self.advance();
                self.enter()?;
                let result = self.paren_body();
                self.leave();
                result
            }
            Tok::Op("[") => {
                self.advance();
                self.enter()?;
                let result = self.list_body();
                self.leave();
                result
            }
            Tok::Op("{") => {
                self.advance();
                self.enter()?;
                let result = self.brace_body();
                self.leave();
                result
            }
            Tok::Op("...") => Err(self.error("Ellipsis is not supported")),
            Tok::Indent => Err(self.error("unexpected indent")),
            _ => Err(self.error("invalid syntax")),
        }
    }

    fn paren_body(&mut self) -> Result<Expr, Fault> {
        if self.eat_op(")") {
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.star_or_test(true)?;
        if self.is_kw("for") {
            let clauses = self.comp_clauses()?;
            self.expect_op(")")?;
            return Ok(Expr::Comp {
                kind: CompKind::Gen,
                elt: Box::new(first),
                value: None,
                clauses,
            });
        }
        if self.eat_op(")") {
            if let Expr::Starred(_) = first {
                return Err(self.error("can't use starred expression here"));
            }
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op(")") {
                break;
            }
            items.push(self.star_or_test(true)?);
        }
        self.expect_op(")")?;
        Ok(Expr::Tuple(items))
    }

    fn list_body(&mut self) -> Result<Expr, Fault> {
        if self.eat_op("]") {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.star_or_test(true)?;
        if self.is_kw("for") {
            let clauses = self.comp_clauses()?;
            self.expect_op("]")?;
            return Ok(Expr::Comp {
                kind: CompKind::List,
                elt: Box::new(first),
                value: None,
                clauses,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op("]") {
                break;
            }
            items.push(self.star_or_test(true)?);
        }
        self.expect_op("]")?;
        Ok(Expr::List(items))
    }

    fn brace_body(&mut self) -> Result<Expr, Fault> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        if self.eat_op("**") {
            let mapping = self.bitor()?;
            return self.dict_rest(vec![(None, mapping)]);
        }
        let first = self.star_or_test(false)?;
        if self.eat_op(":") {
            let value = self.test()?;
            if self.is_kw("for") {
                let clauses = self.comp_clauses()?;
                self.expect_op("}")?;
                return Ok(Expr::Comp {
                    kind: CompKind::Dict,
                    elt: Box::new(first),
                    value: Some(Box::new(value)),
                    clauses,
                });
            }
            return self.dict_rest(vec![(Some(first), value)]);
        }
        if self.is_kw("for") {
            let clauses = self.comp_clauses()?;
            self.expect_op("}")?;
            return Ok(Expr::Comp {
                kind: CompKind::Set,
                elt: Box::new(first),
                value: None,
                clauses,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op("}") {
                break;
            }
            items.push(self.star_or_test(false)?);
        }
        self.expect_op("}")?;
        Ok(Expr::Set(items))
    }

    fn dict_rest(&mut self, mut items: Vec<(Option<Expr>, Expr)>) -> Result<Expr, Fault> {
        while self.eat_op(",") {
            if self.is_op("}") {
                break;
            }
            if self.eat_op("**") {
                items.push((None, self.bitor()?));
                continue;
            }
            let key = self.test()?;
            self.expect_op(":")?;
            let value = self.test()?;
            items.push((Some(key), value));
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(items))
    }

    /// Adjacent string literals concatenate; any f-string makes the whole
    /// run an f-string.
    fn strings(&mut self) -> Result<Expr, Fault> {
        let line = self.line();
        let mut parts: Vec<FPart> = Vec::new();
        let mut is_fstring = false;
        loop {
            match self.peek().clone() {
                Tok::Str(s) => {
                    self.advance();
                    push_lit(&mut parts, &s);
                }
                Tok::FStr(body) => {
                    self.advance();
                    is_fstring = true;
                    for part in parse_fstring(&body, line, self.depth)? {
                        match part {
                            FPart::Lit(s) => push_lit(&mut parts, &s),
                            other => parts.push(other),
                        }
                    }
                }
                _ => break,
            }
        }
        if !is_fstring {
            let text = match parts.pop() {
                Some(FPart::Lit(s)) => s,
                _ => String::new(),
            };
            return Ok(Expr::Const(Const::Str(Arc::from(text))));
        }
        Ok(Expr::FString(parts))
    }
}

fn push_lit(parts: &mut Vec<FPart>, text: &str) {
    if let Some(FPart::Lit(last)) = parts.last_mut() {
        last.push_str(text);
    } else {
        parts.push(FPart::Lit(text.to_string()));
    }
}

fn aug_op(op: &str) -> Option<BinOp> {
    Some(match op {
        "+=" => BinOp::Add,
        "-=" => BinOp::Sub,
        "*=" => BinOp::Mul,
        "/=" => BinOp::Div,
        "//=" => BinOp::FloorDiv,
        "%=" => BinOp::Mod,
        "**=" => BinOp::Pow,
        "&=" => BinOp::BitAnd,
        "|=" => BinOp::BitOr,
        "^=" => BinOp::BitXor,
        "<<=" => BinOp::LShift,
        ">>=" => BinOp::RShift,
        _ => return None,
    })
}

fn check_target(target: &Expr, line: usize) -> Result<(), Fault> {
    match target {
        Expr::Name(_) | Expr::Attribute(..) | Expr::Subscript(..) => Ok(()),
        Expr::Tuple(items) | Expr::List(items) => {
            let stars = items
                .iter()
                .filter(|e| matches!(e, Expr::Starred(_)))
                .count();
            if stars > 1 {
                return Err(Fault::syntax(line, "multiple starred expressions in assignment"));
            }
            items.iter().try_for_each(|item| match item {
                Expr::Starred(inner) => check_target(inner, line),
                other => check_target(other, line),
            })
        }
        Expr::Call { .. } => Err(Fault::syntax(line, "cannot assign to function call")),
        Expr::Const(_) => Err(Fault::syntax(line, "cannot assign to literal")),
        _ => Err(Fault::syntax(line, "cannot assign to expression")),
    }
}

/// Splits an f-string body into literal and replacement-field parts.
fn parse_fstring(body: &str, line: usize, depth: usize) -> Result<Vec<FPart>, Fault> {
    if depth > MAX_NESTING {
        return Err(Fault::syntax(line, "f-string nested too deeply"));
    }
    let chars: Vec<char> = body.chars().collect();
    let mut parts = Vec::new();
    let mut lit = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '{' {
            if chars.get(i + 1) == Some(&'{') {
                lit.push('{');
                i += 2;
                continue;
            }
            if !lit.is_empty() {
                parts.push(FPart::Lit(unescape(&std::mem::take(&mut lit))));
            }
            let (field, next) = replacement_field(&chars, i + 1, line)?;
            parts.extend(parse_field(&field, line, depth)?);
            i = next;
            continue;
        }
        if c == '}' {
            if chars.get(i + 1) == Some(&'}') {
                lit.push('}');
                i += 2;
                continue;
            }
            return Err(Fault::syntax(line, "f-string: single '}' is not allowed"));
        }
        lit.push(c);
        i += 1;
    }
    if !lit.is_empty() {
        parts.push(FPart::Lit(unescape(&lit)));
    }
    Ok(parts)
}

/// Returns the text between `{` and its matching `}`, and the index after it.
fn replacement_field(chars: &[char], start: usize, line: usize) -> Result<(String, usize), Fault> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
        } else {
            match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' => depth = depth.saturating_sub(1),
                '}' if depth == 0 => {
                    return Ok((chars[start..i].iter().collect(), i + 1));
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        i += 1;
    }
    Err(Fault::syntax(line, "f-string: expecting '}'"))
}

fn parse_field(field: &str, line: usize, depth: usize) -> Result<Vec<FPart>, Fault> {
    let chars: Vec<char> = field.chars().collect();
    // Locate the top-level `!conv` and `:spec` separators.
    let mut nest = 0usize;
    let mut quote: Option<char> = None;
    let mut expr_end = chars.len();
    let mut conv_at = None;
    let mut spec_at = None;
    for (i, &c) in chars.iter().enumerate() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => nest += 1,
            ')' | ']' | '}' => nest = nest.saturating_sub(1),
            '!' if nest == 0 && chars.get(i + 1) != Some(&'=') && conv_at.is_none() => {
                conv_at = Some(i);
                expr_end = expr_end.min(i);
            }
            ':' if nest == 0 => {
                spec_at = Some(i);
                expr_end = expr_end.min(i);
                break;
            }
            _ => {}
        }
    }

    let mut expr_text: String = chars[..expr_end].iter().collect();
    let mut parts = Vec::new();
    let mut conversion = None;

    let trimmed = expr_text.trim_end();
    let self_doc = trimmed.ends_with('=')
        && !trimmed.ends_with("==")
        && !trimmed.ends_with("!=")
        && !trimmed.ends_with("<=")
        && !trimmed.ends_with(">=");
    if self_doc {
        parts.push(FPart::Lit(expr_text.clone()));
        let cut = trimmed.len() - 1;
        expr_text.truncate(cut);
        conversion = Some('r');
    }

    if let Some(at) = conv_at {
        let end = spec_at.unwrap_or(chars.len());
        let conv: String = chars[at + 1..end].iter().collect();
        conversion = match conv.as_str() {
            "r" => Some('r'),
            "s" => Some('s'),
            "a" => Some('r'),
            _ => return Err(Fault::syntax(line, "f-string: invalid conversion character")),
        };
    }

    if expr_text.trim().is_empty() {
        return Err(Fault::syntax(line, "f-string: empty expression not allowed"));
    }
    let expr = parse_expression(expr_text.trim()).map_err(|mut f| {
        f.line = Some(line);
        f
    })?;

    let spec = match spec_at {
        Some(at) => {
            let spec_text: String = chars[at + 1..].iter().collect();
            parse_fstring(&spec_text, line, depth + 1)?
        }
        None => Vec::new(),
    };
    if self_doc && spec_at.is_some() && conv_at.is_none() {
        conversion = None;
    }

    parts.push(FPart::Expr {
        expr: Box::new(expr),
        conversion,
        spec,
    });
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(src: &str) -> StmtKind {
        let mut body = parse_module(src).unwrap();
        assert_eq!(body.len(), 1, "expected one statement in {:?}", src);
        body.remove(0).kind
    }

    #[test]
    fn parses_assignment_and_expression() {
        assert!(matches!(one("x = 1 + 2"), StmtKind::Assign { .. }));
        assert!(matches!(one("x == 1"), StmtKind::Expr(Expr::Compare(..))));
        assert!(matches!(one("a, b = b, a"), StmtKind::Assign { .. }));
        assert!(matches!(one("x += 1"), StmtKind::AugAssign { op: BinOp::Add, .. }));
    }

    #[test]
    fn chained_assignment_collects_all_targets() {
        match one("a = b = 3") {
            StmtKind::Assign { targets, .. } => assert_eq!(targets.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_compound_statements() {
        let src = "def f(a, b=2, *rest, **kw):\n    if a:\n        return a\n    elif b:\n        pass\n    else:\n        return None\n";
        match one(src) {
            StmtKind::FuncDef(def) => {
                assert_eq!(def.name, "f");
                assert_eq!(def.params.len(), 2);
                assert_eq!(def.vararg.as_deref(), Some("rest"));
                assert_eq!(def.kwarg.as_deref(), Some("kw"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_try_with_handlers() {
        let src = "try:\n    x = 1\nexcept (KeyError, ValueError) as e:\n    pass\nelse:\n    y = 2\nfinally:\n    z = 3\n";
        match one(src) {
            StmtKind::Try {
                handlers,
                orelse,
                finalbody,
                ..
            } => {
                assert_eq!(handlers.len(), 1);
                assert_eq!(handlers[0].name.as_deref(), Some("e"));
                assert_eq!(orelse.len(), 1);
                assert_eq!(finalbody.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_comprehensions_and_slices() {
        assert!(parse_expression("[x * 2 for x in range(10) if x % 2]").is_ok());
        assert!(parse_expression("{k: v for k, v in d.items()}").is_ok());
        assert!(parse_expression("sum(x for x in xs)").is_ok());
        assert!(parse_expression("a[1:-1:2]").is_ok());
        assert!(parse_expression("lambda x, y=1: x + y").is_ok());
    }

    #[test]
    fn parses_fstrings() {
        match parse_expression("f'{name!r:>10} and {{braces}} {x=}'").unwrap() {
            Expr::FString(parts) => {
                assert!(parts.len() >= 4);
                assert!(matches!(&parts[0], FPart::Expr { conversion: Some('r'), .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn single_line_blocks_are_supported() {
        let body = parse_module("for i in range(3): print(i)\nx = 1; y = 2\n").unwrap();
        assert_eq!(body.len(), 3);
    }

    #[test]
    fn rejects_invalid_syntax() {
        assert!(parse_module("x = = 1").is_err());
        assert!(parse_module("1 = x").is_err());
        assert!(parse_module("def f(:\n    pass").is_err());
        assert!(parse_module("class A:\n    pass").is_err());
        assert!(parse_expression("x = 1").is_err());
    }

    #[test]
    fn deep_nesting_is_a_syntax_error() {
        let src = format!("{}1{}", "(".repeat(500), ")".repeat(500));
        let err = parse_module(&src).unwrap_err();
        assert_eq!(err.kind, super::super::fault::FaultKind::SyntaxError);
    }

    #[test]
    fn imports_parse_into_one_statement_per_module() {
        let body = parse_module("import math, json as j\nfrom math import sqrt as s, pi\n").unwrap();
        assert_eq!(body.len(), 3);
    }
}
