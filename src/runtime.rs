//! Embedded Python runtime for accepted submissions.
//!
//! Every submission gets a fresh RustPython interpreter without the standard
//! library. Before the program runs, the builtins module is cut down to the
//! [`CapabilitySet`] and `sys.stdout`/`sys.stderr` are replaced with writers
//! that feed an [`OutputSink`].
//!
//! The interpreter and everything the program built are leaked, not dropped.
//! A worker process runs one submission and exits, and tearing down a deeply
//! nested object graph would recurse once per level.

use std::sync::Arc;

use rustpython_vm::builtins::PyBaseExceptionRef;
use rustpython_vm::compiler::Mode;
use rustpython_vm::function::FuncArgs;
use rustpython_vm::{AsObject, Interpreter, PyObjectRef, PyResult, Settings, VirtualMachine};

use crate::capabilities::{CapabilitySet, RUNTIME_NAMES};
use crate::config::Limits;
use crate::error::{SyntaxError, SOURCE_PATH};

/// Stack of the thread a submission runs on. Python calls recurse on the
/// native stack, so this bounds how deep `max_recursion_depth` can go.
pub const WORKER_STACK_BYTES: usize = 256 * 1024 * 1024;

/// Identical frames shown before the rest are folded.
const REPEATED_FRAMES_SHOWN: usize = 3;

/// Where a running program's output goes.
pub trait OutputSink: Send + Sync {
    fn stdout(&self, text: &str);
    fn stderr(&self, text: &str);
    /// The program compiled and is about to run.
    fn started(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Rendered traceback or syntax error.
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Compiles and runs `code` on the calling thread, which should have a stack
/// of [`WORKER_STACK_BYTES`].
pub fn run_submission(
    code: &str,
    capabilities: &CapabilitySet,
    limits: &Limits,
    sink: Arc<dyn OutputSink>,
) -> Outcome {
    let mut settings = Settings::default();
    settings.isolated = true;
    settings.no_site = true;
    settings.no_user_site = true;

    let interpreter = Interpreter::without_stdlib(settings);
    let outcome = interpreter.enter(|vm| execute(vm, code, capabilities, limits, &sink));
    std::mem::forget(interpreter);
    outcome
}

fn execute(
    vm: &VirtualMachine,
    code: &str,
    capabilities: &CapabilitySet,
    limits: &Limits,
    sink: &Arc<dyn OutputSink>,
) -> Outcome {
    if let Err(exc) = prepare(vm, capabilities, limits, sink) {
        return Outcome::Failed(render_exception(vm, exc, code));
    }

    let program = match vm.compile(code, Mode::Exec, SOURCE_PATH.to_owned()) {
        Ok(program) => program,
        Err(err) => {
            let (row, _) = err.python_location();
            let message = err.to_string();
            return Outcome::Failed(SyntaxError::new(message, row as usize).render(code));
        }
    };

    let scope = vm.new_scope_with_builtins();
    if let Err(exc) = scope
        .globals
        .set_item("__name__", vm.ctx.new_str("__main__").into(), vm)
    {
        return Outcome::Failed(render_exception(vm, exc, code));
    }

    sink.started();
    let outcome = match vm.run_code_obj(program, scope.clone()) {
        Ok(_) => Outcome::Completed,
        Err(exc) => Outcome::Failed(render_exception(vm, exc, code)),
    };
    std::mem::forget(scope);
    outcome
}

fn prepare(
    vm: &VirtualMachine,
    capabilities: &CapabilitySet,
    limits: &Limits,
    sink: &Arc<dyn OutputSink>,
) -> PyResult<()> {
    restrict_builtins(vm, capabilities)?;
    vm.sys_module
        .set_attr("stdout", writer(vm, sink.clone(), Stream::Stdout)?, vm)?;
    vm.sys_module
        .set_attr("stderr", writer(vm, sink.clone(), Stream::Stderr)?, vm)?;
    vm.sys_module
        .get_attr("setrecursionlimit", vm)?
        .call((vm.ctx.new_int(limits.max_recursion_depth),), vm)?;
    Ok(())
}

/// Deletes every builtin the capability set does not grant.
fn restrict_builtins(vm: &VirtualMachine, capabilities: &CapabilitySet) -> PyResult<()> {
    let builtins = vm.builtins.dict();
    let mut denied = Vec::new();
    for (key, _) in &builtins {
        let name = key.str(vm)?;
        let name = name.as_str();
        if !capabilities.contains(name) && !RUNTIME_NAMES.contains(&name) {
            denied.push(name.to_owned());
        }
    }
    for name in &denied {
        builtins.del_item(name.as_str(), vm)?;
    }
    Ok(())
}

/// A file-like namespace whose `write` forwards to `sink`.
fn writer(
    vm: &VirtualMachine,
    sink: Arc<dyn OutputSink>,
    stream: Stream,
) -> PyResult<PyObjectRef> {
    let write = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let text = match args.args.first() {
                Some(obj) => obj.str(vm)?,
                None => return Err(vm.new_type_error("write() takes exactly one argument".to_owned())),
            };
            let text = text.as_str();
            match stream {
                Stream::Stdout => sink.stdout(text),
                Stream::Stderr => sink.stderr(text),
            }
            Ok(vm.ctx.new_int(text.len()).into())
        },
    );
    let flush = vm.new_function(
        "flush",
        |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> { Ok(vm.ctx.none()) },
    );

    let ns = vm.new_module("<writer>", vm.ctx.new_dict(), None);
    ns.set_attr("write", write, vm)?;
    ns.set_attr("flush", flush, vm)?;
    ns.set_attr("closed", vm.ctx.new_bool(false), vm)?;
    ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm)?;
    Ok(ns.into())
}

fn render_exception(vm: &VirtualMachine, exc: PyBaseExceptionRef, source: &str) -> String {
    let mut raw = String::new();
    if vm.write_exception(&mut raw, &exc).is_err() {
        raw = "Traceback unavailable\n".to_owned();
    }
    // The exception holds its frames, and through them the program's objects.
    std::mem::forget(exc);
    annotate_traceback(&raw, source)
}

/// Adds the offending source line under each submission frame, since the
/// runtime cannot reopen `<student code>`, and folds runs of identical
/// frames the way CPython does.
pub fn annotate_traceback(raw: &str, source: &str) -> String {
    let frame_prefix = format!("  File \"{SOURCE_PATH}\", line ");
    let source_lines: Vec<&str> = source.lines().collect();

    let mut out = String::with_capacity(raw.len());
    let mut previous: Option<String> = None;
    let mut repeats = 0usize;

    for line in raw.lines() {
        if !line.starts_with("  File \"") {
            if line.starts_with("    ") && previous.is_some() {
                // A source line the runtime did print; it belongs to the frame.
                continue;
            }
            flush_repeats(&mut out, repeats);
            repeats = 0;
            previous = None;
            out.push_str(line);
            out.push('\n');
            continue;
        }

        let mut frame = format!("{line}\n");
        if let Some(rest) = line.strip_prefix(&frame_prefix) {
            let number = rest
                .split(',')
                .next()
                .and_then(|n| n.trim().parse::<usize>().ok());
            let text = number
                .and_then(|n| source_lines.get(n.wrapping_sub(1)))
                .map(|text| text.trim())
                .filter(|text| !text.is_empty());
            if let Some(text) = text {
                frame.push_str("    ");
                frame.push_str(text);
                frame.push('\n');
            }
        }

        if previous.as_deref() == Some(frame.as_str()) {
            repeats += 1;
            if repeats < REPEATED_FRAMES_SHOWN {
                out.push_str(&frame);
            }
        } else {
            flush_repeats(&mut out, repeats);
            repeats = 0;
            out.push_str(&frame);
            previous = Some(frame);
        }
    }
    flush_repeats(&mut out, repeats);
    out
}

fn flush_repeats(out: &mut String, repeats: usize) {
    let hidden = (repeats + 1).saturating_sub(REPEATED_FRAMES_SHOWN);
    if hidden > 0 {
        let noun = if hidden == 1 { "time" } else { "times" };
        out.push_str(&format!("  [Previous line repeated {hidden} more {noun}]\n"));
    }
}
