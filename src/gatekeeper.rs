//! Structural screening of submissions before anything runs.
//!
//! The check walks the tree produced by `rustpython-parser`, the same parser
//! the runtime compiles with, so aliases, spacing and string tricks that
//! defeat a substring scan make no difference. Security findings stop the walk
//! at once; softer findings (unsupported syntax, curriculum) are only reported
//! when no security finding exists anywhere in the program.

use std::collections::HashSet;
use std::fmt;

use rustpython_parser::ast::{self, Constant, Expr, Ranged, Stmt};
use rustpython_parser::{Parse, ParseError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SyntaxError, SOURCE_PATH};

/// Transcript for every security rejection.
pub const SECURITY_REFUSAL: &str =
    "Security Alert: This sandbox does not allow file/system operations.";

/// Statements plus expressions open at once. Deeper trees are refused before
/// the walk or the compiler can exhaust a stack.
pub const MAX_NESTING: usize = 1000;

const IMPORT_NAMES: &[&str] = &["__import__", "importlib"];
const DYNAMIC_NAMES: &[&str] = &["eval", "exec", "compile"];
const FILE_OR_NETWORK_NAMES: &[&str] = &[
    "open", "file", "socket", "os", "sys", "subprocess", "shutil", "ctypes", "pickle", "builtins",
    "io", "pathlib", "urllib", "http", "requests",
];
const INTROSPECTION_NAMES: &[&str] = &[
    "globals", "locals", "vars", "getattr", "setattr", "delattr", "dir", "type", "breakpoint",
    "memoryview", "help", "input", "exit", "quit",
];

/// Attributes that lead from a generator, coroutine, traceback or code object
/// back to frames and their globals.
const FRAME_ATTRIBUTES: &[&str] = &[
    "gi_frame", "gi_code", "gi_yieldfrom", "cr_frame", "cr_code", "cr_await", "ag_frame",
    "ag_code", "f_globals", "f_locals", "f_builtins", "f_back", "f_code", "tb_frame", "tb_next",
    "co_code", "co_consts", "mro",
];

/// Dunders that classes written in a lesson define or call. None of them
/// reaches a type, module or frame.
const SAFE_DUNDERS: &[&str] = &[
    "__init__", "__str__", "__repr__", "__eq__", "__ne__", "__lt__", "__le__", "__gt__", "__ge__",
    "__hash__", "__len__", "__iter__", "__next__", "__contains__", "__getitem__", "__setitem__",
    "__delitem__", "__add__", "__sub__", "__mul__", "__truediv__", "__floordiv__", "__mod__",
    "__pow__", "__neg__", "__pos__", "__abs__", "__bool__", "__call__", "__radd__", "__rsub__",
    "__rmul__", "__iadd__", "__isub__", "__enter__", "__exit__", "__name__", "__main__", "__doc__",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionKind {
    Import,
    DynamicEvaluation,
    DunderAccess,
    FileOrNetwork,
    Introspection,
    /// Valid Python the sandbox does not run.
    Unsupported,
    /// Not yet taught in the current lesson.
    Curriculum,
    TooLarge,
}

impl RejectionKind {
    pub fn is_security(self) -> bool {
        matches!(
            self,
            RejectionKind::Import
                | RejectionKind::DynamicEvaluation
                | RejectionKind::DunderAccess
                | RejectionKind::FileOrNetwork
                | RejectionKind::Introspection
        )
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} rejection of `{name}` on line {line}")]
pub struct Rejection {
    pub kind: RejectionKind,
    /// The offending identifier, keyword or module.
    pub name: String,
    /// 1-based; 0 when the whole submission is at fault.
    pub line: usize,
    /// What the student sees.
    pub message: String,
}

impl Rejection {
    fn new(kind: RejectionKind, name: impl Into<String>, line: usize) -> Self {
        let name = name.into();
        let message = match kind {
            k if k.is_security() => SECURITY_REFUSAL.to_string(),
            RejectionKind::Unsupported => {
                format!("`{name}` is not supported in this sandbox (line {line}).")
            }
            RejectionKind::Curriculum => format!(
                "`{name}` hasn't been covered yet in this lesson (line {line}). Try solving it without it."
            ),
            _ => format!("Submission rejected (line {line})."),
        };
        Self {
            kind,
            name,
            line,
            message,
        }
    }

    fn too_large(size: usize, limit: usize) -> Self {
        Self {
            kind: RejectionKind::TooLarge,
            name: String::new(),
            line: 0,
            message: format!("Submission is too large ({size} bytes, limit {limit})."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePolicy {
    pub max_source_bytes: usize,
    /// Identifiers refused for teaching reasons. Empty by default.
    pub curriculum: HashSet<String>,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            max_source_bytes: 64 * 1024,
            curriculum: HashSet::new(),
        }
    }
}

impl GatePolicy {
    pub fn with_curriculum<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.curriculum.extend(names.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inspection {
    Accept,
    Reject(Rejection),
    Malformed(SyntaxError),
}

/// Parses `code` and screens the tree against the denylist and `policy`.
///
/// The tree is dropped before returning. Parsing, walking and dropping all
/// recurse with the nesting of the submission, so callers on a small stack
/// should run this on a thread of their own.
pub fn inspect(code: &str, policy: &GatePolicy) -> Inspection {
    if code.len() > policy.max_source_bytes {
        return Inspection::Reject(Rejection::too_large(code.len(), policy.max_source_bytes));
    }
    let lines = LineIndex::new(code);
    let suite = match ast::Suite::parse(code, SOURCE_PATH) {
        Ok(suite) => suite,
        Err(err) => return Inspection::Malformed(malformed(&err, &lines)),
    };
    match screen(&suite, &lines, policy) {
        Ok(()) => Inspection::Accept,
        Err(rejection) => {
            if rejection.kind.is_security() {
                warn!(kind = %rejection.kind, name = %rejection.name, line = rejection.line, "Rejected submission");
            } else {
                debug!(kind = %rejection.kind, name = %rejection.name, line = rejection.line, "Rejected submission");
            }
            Inspection::Reject(rejection)
        }
    }
}

fn malformed(err: &ParseError, lines: &LineIndex) -> SyntaxError {
    let message = err.error.to_string();
    let line = lines.line(u32::from(err.offset));
    if message.contains("indent") {
        SyntaxError::indentation(message, line)
    } else {
        SyntaxError::new(message, line)
    }
}

/// Screens an already parsed suite.
fn screen(suite: &[Stmt], lines: &LineIndex, policy: &GatePolicy) -> Result<(), Rejection> {
    let mut walker = Walker {
        policy,
        lines,
        depth: 0,
        soft: None,
    };
    walker.block(suite)?;
    match walker.soft {
        Some(rejection) => Err(rejection),
        None => Ok(()),
    }
}

/// Byte offsets at which each line starts.
struct LineIndex {
    starts: Vec<u32>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        for (offset, byte) in source.bytes().enumerate() {
            if byte == b'\n' {
                starts.push(offset as u32 + 1);
            }
        }
        Self { starts }
    }

    /// 1-based line holding `offset`.
    fn line(&self, offset: u32) -> usize {
        self.starts.partition_point(|&start| start <= offset).max(1)
    }
}

/// Security classification of a bare identifier.
fn classify(name: &str) -> Option<RejectionKind> {
    if IMPORT_NAMES.contains(&name) {
        Some(RejectionKind::Import)
    } else if DYNAMIC_NAMES.contains(&name) {
        Some(RejectionKind::DynamicEvaluation)
    } else if is_unsafe_dunder(name) {
        Some(RejectionKind::DunderAccess)
    } else if FILE_OR_NETWORK_NAMES.contains(&name) {
        Some(RejectionKind::FileOrNetwork)
    } else if INTROSPECTION_NAMES.contains(&name) {
        Some(RejectionKind::Introspection)
    } else {
        None
    }
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

fn is_unsafe_dunder(name: &str) -> bool {
    is_dunder(name) && !SAFE_DUNDERS.contains(&name)
}

/// Classification of an attribute name, wherever it appears.
fn classify_attribute(attr: &str) -> Option<RejectionKind> {
    if is_unsafe_dunder(attr) {
        Some(RejectionKind::DunderAccess)
    } else if FRAME_ATTRIBUTES.contains(&attr) {
        Some(RejectionKind::Introspection)
    } else {
        None
    }
}

/// `"{0.__class__}".format(x)` walks attributes without an attribute node.
/// Returns the first such attribute named inside a replacement field.
fn format_field_attribute(text: &str) -> Option<&str> {
    text.split('{').skip(1).find_map(|field| {
        let field = field.split('}').next().unwrap_or_default();
        field
            .split(['.', '[', ']', '!', ':'])
            .find(|part| classify_attribute(part).is_some())
    })
}

struct Walker<'p> {
    policy: &'p GatePolicy,
    lines: &'p LineIndex,
    depth: usize,
    /// First non-security finding.
    soft: Option<Rejection>,
}

impl Walker<'_> {
    fn found(&mut self, kind: RejectionKind, name: &str, at: u32) -> Result<(), Rejection> {
        let rejection = Rejection::new(kind, name, self.lines.line(at));
        if kind.is_security() {
            return Err(rejection);
        }
        if self.soft.is_none() {
            self.soft = Some(rejection);
        }
        Ok(())
    }

    fn identifier(&mut self, name: &str, at: u32) -> Result<(), Rejection> {
        if let Some(kind) = classify(name) {
            return self.found(kind, name, at);
        }
        if self.policy.curriculum.contains(name) {
            return self.found(RejectionKind::Curriculum, name, at);
        }
        Ok(())
    }

    /// Attribute names are only checked for dunders, frame access and the
    /// curriculum: `text.format` or `items.copy` must stay usable.
    fn attribute(&mut self, attr: &str, at: u32) -> Result<(), Rejection> {
        if let Some(kind) = classify_attribute(attr) {
            return self.found(kind, attr, at);
        }
        if self.policy.curriculum.contains(attr) {
            return self.found(RejectionKind::Curriculum, attr, at);
        }
        Ok(())
    }

    /// Enters one level of nesting. Too deep is a hard stop, though not a
    /// security finding.
    fn descend(&mut self, at: u32) -> Result<(), Rejection> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(Rejection::new(
                RejectionKind::Unsupported,
                "deeply nested code",
                self.lines.line(at),
            ));
        }
        Ok(())
    }

    fn block(&mut self, body: &[Stmt]) -> Result<(), Rejection> {
        body.iter().try_for_each(|stmt| self.stmt(stmt))
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), Rejection> {
        let at = u32::from(stmt.start());
        self.descend(at)?;
        self.stmt_inner(stmt, at)?;
        self.depth -= 1;
        Ok(())
    }

    fn stmt_inner(&mut self, stmt: &Stmt, at: u32) -> Result<(), Rejection> {
        match stmt {
            Stmt::Import(ast::StmtImport { names, .. }) => {
                let module = names.first().map(|a| a.name.as_str()).unwrap_or("import");
                self.found(RejectionKind::Import, module, at)
            }
            Stmt::ImportFrom(ast::StmtImportFrom { module, .. }) => {
                let module = module.as_ref().map(|m| m.as_str()).unwrap_or(".");
                self.found(RejectionKind::Import, module, at)
            }
            Stmt::FunctionDef(ast::StmtFunctionDef {
                name,
                args,
                body,
                decorator_list,
                returns,
                ..
            }) => {
                self.identifier(name.as_str(), at)?;
                self.function(args, body, decorator_list, returns.as_deref(), at)
            }
            Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
                name,
                args,
                body,
                decorator_list,
                returns,
                ..
            }) => {
                self.found(RejectionKind::Unsupported, "async def", at)?;
                self.identifier(name.as_str(), at)?;
                self.function(args, body, decorator_list, returns.as_deref(), at)
            }
            Stmt::ClassDef(ast::StmtClassDef {
                name,
                bases,
                keywords,
                body,
                decorator_list,
                ..
            }) => {
                self.identifier(name.as_str(), at)?;
                self.exprs(decorator_list)?;
                self.exprs(bases)?;
                self.keywords(keywords, at)?;
                self.block(body)
            }
            Stmt::Return(ast::StmtReturn { value, .. }) => self.optional(value.as_deref()),
            Stmt::Delete(ast::StmtDelete { targets, .. }) => self.exprs(targets),
            Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                self.exprs(targets)?;
                self.expr(value)
            }
            Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
                self.expr(target)?;
                self.expr(value)
            }
            Stmt::AnnAssign(ast::StmtAnnAssign {
                target,
                annotation,
                value,
                ..
            }) => {
                self.expr(target)?;
                self.expr(annotation)?;
                self.optional(value.as_deref())
            }
            Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => self.for_loop(target, iter, body, orelse),
            Stmt::AsyncFor(ast::StmtAsyncFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.found(RejectionKind::Unsupported, "async for", at)?;
                self.for_loop(target, iter, body, orelse)
            }
            Stmt::While(ast::StmtWhile {
                test, body, orelse, ..
            })
            | Stmt::If(ast::StmtIf {
                test, body, orelse, ..
            }) => {
                self.expr(test)?;
                self.block(body)?;
                self.block(orelse)
            }
            Stmt::With(ast::StmtWith { items, body, .. }) => self.with(items, body),
            Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
                self.found(RejectionKind::Unsupported, "async with", at)?;
                self.with(items, body)
            }
            Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
                self.found(RejectionKind::Unsupported, "match", at)?;
                self.expr(subject)?;
                for case in cases {
                    self.optional(case.guard.as_deref())?;
                    self.block(&case.body)?;
                }
                Ok(())
            }
            Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
                self.optional(exc.as_deref())?;
                self.optional(cause.as_deref())
            }
            Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => self.try_block(body, handlers, orelse, finalbody),
            Stmt::TryStar(ast::StmtTryStar {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                self.found(RejectionKind::Unsupported, "except*", at)?;
                self.try_block(body, handlers, orelse, finalbody)
            }
            Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                self.expr(test)?;
                self.optional(msg.as_deref())
            }
            Stmt::Global(ast::StmtGlobal { names, .. })
            | Stmt::Nonlocal(ast::StmtNonlocal { names, .. }) => names
                .iter()
                .try_for_each(|name| self.identifier(name.as_str(), at)),
            Stmt::Expr(ast::StmtExpr { value, .. }) => self.expr(value),
            Stmt::Pass(_) | Stmt::Break(_) | Stmt::Continue(_) => Ok(()),
            #[allow(unreachable_patterns)]
            _ => self.found(RejectionKind::Unsupported, "statement", at),
        }
    }

    fn function(
        &mut self,
        args: &ast::Arguments,
        body: &[Stmt],
        decorators: &[Expr],
        returns: Option<&Expr>,
        at: u32,
    ) -> Result<(), Rejection> {
        self.exprs(decorators)?;
        self.arguments(args, at)?;
        self.optional(returns)?;
        self.block(body)
    }

    fn arguments(&mut self, args: &ast::Arguments, at: u32) -> Result<(), Rejection> {
        for arg in args
            .posonlyargs
            .iter()
            .chain(&args.args)
            .chain(&args.kwonlyargs)
        {
            self.parameter(&arg.def, at)?;
            self.optional(arg.default.as_deref())?;
        }
        for arg in [&args.vararg, &args.kwarg].into_iter().flatten() {
            self.parameter(arg, at)?;
        }
        Ok(())
    }

    fn parameter(&mut self, arg: &ast::Arg, at: u32) -> Result<(), Rejection> {
        self.identifier(arg.arg.as_str(), at)?;
        self.optional(arg.annotation.as_deref())
    }

    fn for_loop(
        &mut self,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> Result<(), Rejection> {
        self.expr(target)?;
        self.expr(iter)?;
        self.block(body)?;
        self.block(orelse)
    }

    fn with(&mut self, items: &[ast::WithItem], body: &[Stmt]) -> Result<(), Rejection> {
        for item in items {
            self.expr(&item.context_expr)?;
            self.optional(item.optional_vars.as_deref())?;
        }
        self.block(body)
    }

    fn try_block(
        &mut self,
        body: &[Stmt],
        handlers: &[ast::ExceptHandler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
    ) -> Result<(), Rejection> {
        self.block(body)?;
        for handler in handlers {
            let at = u32::from(handler.start());
            let ast::ExceptHandler::ExceptHandler(handler) = handler;
            self.optional(handler.type_.as_deref())?;
            if let Some(name) = &handler.name {
                self.identifier(name.as_str(), at)?;
            }
            self.block(&handler.body)?;
        }
        self.block(orelse)?;
        self.block(finalbody)
    }

    fn keywords(&mut self, keywords: &[ast::Keyword], at: u32) -> Result<(), Rejection> {
        for keyword in keywords {
            if let Some(name) = &keyword.arg {
                if is_unsafe_dunder(name.as_str()) {
                    self.found(RejectionKind::DunderAccess, name.as_str(), at)?;
                }
            }
            self.expr(&keyword.value)?;
        }
        Ok(())
    }

    fn optional(&mut self, expr: Option<&Expr>) -> Result<(), Rejection> {
        match expr {
            Some(expr) => self.expr(expr),
            None => Ok(()),
        }
    }

    fn exprs(&mut self, exprs: &[Expr]) -> Result<(), Rejection> {
        exprs.iter().try_for_each(|e| self.expr(e))
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), Rejection> {
        let at = u32::from(expr.start());
        self.descend(at)?;
        self.expr_inner(expr, at)?;
        self.depth -= 1;
        Ok(())
    }

    fn expr_inner(&mut self, expr: &Expr, at: u32) -> Result<(), Rejection> {
        match expr {
            Expr::Name(ast::ExprName { id, .. }) => self.identifier(id.as_str(), at),
            Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                self.expr(value)?;
                self.attribute(attr.as_str(), at)
            }
            Expr::Constant(ast::ExprConstant { value, .. }) => match value {
                Constant::Str(text) => match format_field_attribute(text) {
                    Some(attr) => self.attribute(attr, at),
                    None => Ok(()),
                },
                _ => Ok(()),
            },
            Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => self.exprs(values),
            Expr::FormattedValue(ast::ExprFormattedValue {
                value, format_spec, ..
            }) => {
                self.expr(value)?;
                self.optional(format_spec.as_deref())
            }
            Expr::BoolOp(ast::ExprBoolOp { values, .. }) => self.exprs(values),
            Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
                self.expr(target)?;
                self.expr(value)
            }
            Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
                self.expr(left)?;
                self.expr(right)
            }
            Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => self.expr(operand),
            Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
                self.arguments(args, at)?;
                self.expr(body)
            }
            Expr::IfExp(ast::ExprIfExp {
                test, body, orelse, ..
            }) => {
                self.expr(test)?;
                self.expr(body)?;
                self.expr(orelse)
            }
            Expr::Dict(ast::ExprDict { keys, values, .. }) => {
                for key in keys.iter().flatten() {
                    self.expr(key)?;
                }
                self.exprs(values)
            }
            Expr::Set(ast::ExprSet { elts, .. })
            | Expr::List(ast::ExprList { elts, .. })
            | Expr::Tuple(ast::ExprTuple { elts, .. }) => self.exprs(elts),
            Expr::ListComp(ast::ExprListComp {
                elt, generators, ..
            })
            | Expr::SetComp(ast::ExprSetComp {
                elt, generators, ..
            })
            | Expr::GeneratorExp(ast::ExprGeneratorExp {
                elt, generators, ..
            }) => {
                self.generators(generators)?;
                self.expr(elt)
            }
            Expr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => {
                self.generators(generators)?;
                self.expr(key)?;
                self.expr(value)
            }
            Expr::Await(ast::ExprAwait { value, .. }) => {
                self.found(RejectionKind::Unsupported, "await", at)?;
                self.expr(value)
            }
            Expr::Yield(ast::ExprYield { value, .. }) => self.optional(value.as_deref()),
            Expr::YieldFrom(ast::ExprYieldFrom { value, .. }) => self.expr(value),
            Expr::Compare(ast::ExprCompare {
                left, comparators, ..
            }) => {
                self.expr(left)?;
                self.exprs(comparators)
            }
            Expr::Call(ast::ExprCall {
                func,
                args,
                keywords,
                ..
            }) => {
                self.expr(func)?;
                self.exprs(args)?;
                self.keywords(keywords, at)
            }
            Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.expr(value)?;
                self.expr(slice)
            }
            Expr::Starred(ast::ExprStarred { value, .. }) => self.expr(value),
            Expr::Slice(ast::ExprSlice {
                lower, upper, step, ..
            }) => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.expr(part)?;
                }
                Ok(())
            }
            #[allow(unreachable_patterns)]
            _ => self.found(RejectionKind::Unsupported, "expression", at),
        }
    }

    fn generators(&mut self, generators: &[ast::Comprehension]) -> Result<(), Rejection> {
        for generator in generators {
            self.expr(&generator.target)?;
            self.expr(&generator.iter)?;
            self.exprs(&generator.ifs)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejection(code: &str) -> Rejection {
        match inspect(code, &GatePolicy::default()) {
            Inspection::Reject(rejection) => rejection,
            other => panic!("expected a rejection for {code:?}, got {other:?}"),
        }
    }

    fn accepted(code: &str) -> bool {
        inspect(code, &GatePolicy::default()) == Inspection::Accept
    }

    #[test]
    fn imports_are_rejected_whatever_the_alias() {
        for code in ["import os", "import os as o", "from os import path", "import math"] {
            let r = rejection(code);
            assert_eq!(r.kind, RejectionKind::Import, "{code}");
            assert_eq!(r.message, SECURITY_REFUSAL);
            assert_eq!(r.line, 1);
        }
        assert_eq!(rejection("from os import path").name, "os");
        assert_eq!(rejection("from . import x").name, ".");
    }

    #[test]
    fn dunder_attributes_are_rejected() {
        let r = rejection("x = ().__class__.__bases__");
        assert_eq!(r.kind, RejectionKind::DunderAccess);
        assert_eq!(r.name, "__class__");
        assert_eq!(rejection("print(__builtins__)").kind, RejectionKind::DunderAccess);
        assert_eq!(rejection("__import__('os')").kind, RejectionKind::Import);
        assert_eq!(rejection("f.__globals__").kind, RejectionKind::DunderAccess);
    }

    #[test]
    fn frame_attributes_are_rejected() {
        let code = "def g():\n    yield 1\nprint(g().gi_frame.f_globals)\n";
        let r = rejection(code);
        assert_eq!(r.kind, RejectionKind::Introspection);
        assert_eq!(r.name, "gi_frame");
        assert_eq!(r.line, 3);
    }

    #[test]
    fn format_templates_cannot_walk_attributes() {
        let r = rejection("print('{0.__class__.__mro__}'.format(1))");
        assert_eq!(r.kind, RejectionKind::DunderAccess);
        assert_eq!(r.name, "__class__");
        assert_eq!(
            rejection("t = f'{{0.gi_frame}}'\nprint(t.format(g))").kind,
            RejectionKind::Introspection
        );
        assert!(accepted("print('{0} and {1:>4}'.format(1, 2))"));
        assert!(accepted("print('{__name__}')"));
    }

    #[test]
    fn denylisted_names_are_classified() {
        assert_eq!(rejection("eval(\"1\")").kind, RejectionKind::DynamicEvaluation);
        assert_eq!(rejection("open(\"x\")").kind, RejectionKind::FileOrNetwork);
        assert_eq!(rejection("f = getattr").kind, RejectionKind::Introspection);
        assert_eq!(rejection("print(type(3))").kind, RejectionKind::Introspection);
    }

    #[test]
    fn rejection_reports_the_offending_line() {
        let r = rejection("x = 1\nif x:\n    y = [open(p) for p in 'ab']\n");
        assert_eq!(r.kind, RejectionKind::FileOrNetwork);
        assert_eq!(r.line, 3);

        let r = rejection("print(\n    1,\n    eval('2'),\n)\n");
        assert_eq!(r.line, 3);
    }

    #[test]
    fn names_hidden_in_nested_constructs_are_found() {
        assert_eq!(rejection("f = lambda: exec('x')").kind, RejectionKind::DynamicEvaluation);
        assert_eq!(rejection("print(f\"{open}\")").kind, RejectionKind::FileOrNetwork);
        assert_eq!(
            rejection("def f(x=__import__):\n    return x\n").kind,
            RejectionKind::Import
        );
        assert_eq!(
            rejection("def f(x: open('a')):\n    pass\n").kind,
            RejectionKind::FileOrNetwork
        );
        assert_eq!(rejection("@eval\ndef f():\n    pass\n").kind, RejectionKind::DynamicEvaluation);
        assert_eq!(
            rejection("try:\n    pass\nexcept ValueError as os:\n    pass\n").kind,
            RejectionKind::FileOrNetwork
        );
        assert_eq!(
            rejection("class A(object, metaclass=type):\n    pass\n").kind,
            RejectionKind::Introspection
        );
    }

    #[test]
    fn text_that_only_mentions_names_is_accepted() {
        assert!(accepted("print('import os')"));
        assert!(accepted("opener = 1\nprint(opener)"));
        assert!(accepted("words = 'a b'.split()\nprint(words)"));
    }

    #[test]
    fn ordinary_python_is_accepted() {
        let code = r#"
class Point:
    def __init__(self, x, y=0):
        self.x = x
        self.y = y

    def __repr__(self):
        return f"Point({self.x}, {self.y})"

def f(a, b=2, *args, **kw):
    return a + b + len(args) + len(kw)

def squares(n):
    for i in range(n):
        yield i * i

if __name__ == "__main__":
    print(Point(1), f(1, 2, 3, k=4), list(squares(3)))
"#;
        assert!(accepted(code));
    }

    #[test]
    fn unsupported_constructs_yield_to_security_findings() {
        let r = rejection("async def f():\n    pass\n");
        assert_eq!(r.kind, RejectionKind::Unsupported);
        assert_eq!(r.name, "async def");
        assert_ne!(r.message, SECURITY_REFUSAL);

        let r = rejection("async def f():\n    pass\nimport os\n");
        assert_eq!(r.kind, RejectionKind::Import);
        assert_eq!(r.line, 3);

        assert_eq!(rejection("match x:\n    case 1:\n        pass\n").name, "match");
    }

    #[test]
    fn curriculum_names_get_a_friendly_message() {
        let policy = GatePolicy::default().with_curriculum(["while", "sorted"]);
        match inspect("xs = sorted([3, 1])\n", &policy) {
            Inspection::Reject(r) => {
                assert_eq!(r.kind, RejectionKind::Curriculum);
                assert_eq!(r.name, "sorted");
                assert!(r.message.contains("hasn't been covered yet"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_submissions_are_rejected_before_parsing() {
        let policy = GatePolicy {
            max_source_bytes: 8,
            ..GatePolicy::default()
        };
        match inspect("print('hello world')", &policy) {
            Inspection::Reject(r) => assert_eq!(r.kind, RejectionKind::TooLarge),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn deep_nesting_is_refused() {
        let code = format!("x = {}1{}\n", "[".repeat(MAX_NESTING + 10), "]".repeat(MAX_NESTING + 10));
        let handle = std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(move || inspect(&code, &GatePolicy::default()))
            .unwrap();
        match handle.join().unwrap() {
            Inspection::Reject(r) => {
                assert_eq!(r.kind, RejectionKind::Unsupported);
                assert_eq!(r.line, 1);
            }
            Inspection::Malformed(_) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn syntax_errors_are_malformed() {
        match inspect("x = 1\nprint(1", &GatePolicy::default()) {
            Inspection::Malformed(err) => {
                assert_eq!(err.kind, "SyntaxError");
                assert!(err.line >= 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            inspect("if True\n    print(1)\n", &GatePolicy::default()),
            Inspection::Malformed(_)
        ));
    }

    #[test]
    fn line_index_maps_offsets() {
        let lines = LineIndex::new("a\nbc\n\nd");
        assert_eq!(lines.line(0), 1);
        assert_eq!(lines.line(2), 2);
        assert_eq!(lines.line(5), 3);
        assert_eq!(lines.line(6), 4);
        assert_eq!(lines.line(100), 4);
    }
}
