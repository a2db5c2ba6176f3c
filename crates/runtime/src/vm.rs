//! The `Vm`: ties the heap, thread, module loader, and compiler seam
//! together, and exposes the public entrypoints embedders call.

use std::path::PathBuf;

use vein_core::Value;

use crate::class::{self, SpecialMethod};
use crate::compiler::{CompiledUnit, Compiler, NullCompiler};
use crate::error::VmError;
use crate::frame::Thread;
use crate::heap::Heap;
use crate::module::ModuleLoader;
use crate::obj::{ClosureObj, CodeObjectObj, InstanceObj, ObjData};

/// Embedder-tunable knobs. Kept as one struct (rather than scattered
/// constructor arguments) so the `cli` crate's `clap::Parser` can derive
/// straight onto it.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub search_paths: Vec<PathBuf>,
    pub gc_second_chance: bool,
    pub initial_gc_threshold: Option<usize>,
    /// Caps `Thread::frames`; a call that would exceed it raises
    /// `VmError::StackOverflow` instead of growing the Rust call stack
    /// (the interpreter loop itself never recurses per managed call).
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            search_paths: vec![PathBuf::from(".")],
            gc_second_chance: true,
            initial_gc_threshold: None,
            max_call_depth: 512,
        }
    }
}

/// The distinguished exception classes `SPEC_FULL.md` §7 enumerates,
/// all rooted under `BaseException`. `Exception` is the catch-all most
/// user code derives from and `except`s against; `KeyboardInterrupt`
/// sits directly under `BaseException` so a bare `except Exception`
/// doesn't also swallow it, matching the usual split between "the
/// program broke" and "something outside the program interrupted it".
#[derive(Debug, Clone, Copy)]
pub struct ExceptionClasses {
    pub base_exception: vein_core::ObjRef,
    pub exception: vein_core::ObjRef,
    pub type_error: vein_core::ObjRef,
    pub attribute_error: vein_core::ObjRef,
    pub name_error: vein_core::ObjRef,
    pub value_error: vein_core::ObjRef,
    pub index_error: vein_core::ObjRef,
    pub key_error: vein_core::ObjRef,
    pub import_error: vein_core::ObjRef,
    pub syntax_error: vein_core::ObjRef,
    pub zero_division_error: vein_core::ObjRef,
    pub not_implemented_error: vein_core::ObjRef,
    pub argument_error: vein_core::ObjRef,
    pub keyboard_interrupt: vein_core::ObjRef,
}

pub struct Vm {
    pub heap: Heap,
    pub thread: Thread,
    pub modules: ModuleLoader,
    pub compiler: Box<dyn Compiler>,
    pub config: VmConfig,
    pub object_class: vein_core::ObjRef,
    pub exception_class: vein_core::ObjRef,
    pub module_class: vein_core::ObjRef,
    pub exceptions: ExceptionClasses,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let mut heap = Heap::new();
        heap.set_second_chance(config.gc_second_chance);
        if let Some(threshold) = config.initial_gc_threshold {
            heap.set_initial_gc_threshold(threshold);
        }

        let object_class = class::alloc_class(&mut heap, "object", "<builtin>", None);
        let module_class = class::alloc_class(&mut heap, "module", "<builtin>", Some(object_class));

        let base_exception = class::alloc_class(&mut heap, "BaseException", "<builtin>", Some(object_class));
        let exception = class::alloc_class(&mut heap, "Exception", "<builtin>", Some(base_exception));
        let type_error = class::alloc_class(&mut heap, "TypeError", "<builtin>", Some(exception));
        let attribute_error = class::alloc_class(&mut heap, "AttributeError", "<builtin>", Some(exception));
        let name_error = class::alloc_class(&mut heap, "NameError", "<builtin>", Some(exception));
        let value_error = class::alloc_class(&mut heap, "ValueError", "<builtin>", Some(exception));
        let index_error = class::alloc_class(&mut heap, "IndexError", "<builtin>", Some(exception));
        let key_error = class::alloc_class(&mut heap, "KeyError", "<builtin>", Some(exception));
        let import_error = class::alloc_class(&mut heap, "ImportError", "<builtin>", Some(exception));
        let syntax_error = class::alloc_class(&mut heap, "SyntaxError", "<builtin>", Some(exception));
        let zero_division_error =
            class::alloc_class(&mut heap, "ZeroDivisionError", "<builtin>", Some(exception));
        let not_implemented_error =
            class::alloc_class(&mut heap, "NotImplementedError", "<builtin>", Some(exception));
        let argument_error = class::alloc_class(&mut heap, "ArgumentError", "<builtin>", Some(exception));
        let keyboard_interrupt =
            class::alloc_class(&mut heap, "KeyboardInterrupt", "<builtin>", Some(base_exception));

        let exceptions = ExceptionClasses {
            base_exception,
            exception,
            type_error,
            attribute_error,
            name_error,
            value_error,
            index_error,
            key_error,
            import_error,
            syntax_error,
            zero_division_error,
            not_implemented_error,
            argument_error,
            keyboard_interrupt,
        };

        heap.mark_immortal(object_class);
        heap.mark_immortal(module_class);
        heap.mark_immortal(base_exception);
        heap.mark_immortal(exception);
        heap.mark_immortal(type_error);
        heap.mark_immortal(attribute_error);
        heap.mark_immortal(name_error);
        heap.mark_immortal(value_error);
        heap.mark_immortal(index_error);
        heap.mark_immortal(key_error);
        heap.mark_immortal(import_error);
        heap.mark_immortal(syntax_error);
        heap.mark_immortal(zero_division_error);
        heap.mark_immortal(not_implemented_error);
        heap.mark_immortal(argument_error);
        heap.mark_immortal(keyboard_interrupt);

        class::finalize_class(&mut heap, object_class);
        class::finalize_class(&mut heap, module_class);
        class::finalize_class(&mut heap, base_exception);
        class::finalize_class(&mut heap, exception);
        class::finalize_class(&mut heap, type_error);
        class::finalize_class(&mut heap, attribute_error);
        class::finalize_class(&mut heap, name_error);
        class::finalize_class(&mut heap, value_error);
        class::finalize_class(&mut heap, index_error);
        class::finalize_class(&mut heap, key_error);
        class::finalize_class(&mut heap, import_error);
        class::finalize_class(&mut heap, syntax_error);
        class::finalize_class(&mut heap, zero_division_error);
        class::finalize_class(&mut heap, not_implemented_error);
        class::finalize_class(&mut heap, argument_error);
        class::finalize_class(&mut heap, keyboard_interrupt);

        let modules = ModuleLoader::new(config.search_paths.clone());

        Self {
            heap,
            thread: Thread::new(),
            modules,
            compiler: Box::new(NullCompiler),
            config,
            object_class,
            exception_class: exception,
            module_class,
            exceptions,
        }
    }

    pub fn with_compiler(mut self, compiler: Box<dyn Compiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn set_compiler(&mut self, compiler: Box<dyn Compiler>) {
        self.compiler = compiler;
    }

    // -- Allocation helpers ------------------------------------------

    pub fn alloc_value(&mut self, data: ObjData) -> Value {
        Value::Obj(self.heap.alloc(data))
    }

    pub fn new_instance(&mut self, class_ref: vein_core::ObjRef) -> Value {
        let alloc_fields = matches!(self.heap.get(class_ref), Some(ObjData::Class(c)) if c.alloc_fields);
        let _ = alloc_fields;
        self.alloc_value(ObjData::Instance(InstanceObj {
            class: class_ref,
            fields: vein_core::HashTable::new(),
        }))
    }

    pub fn new_module_instance(&mut self, name: &str) -> Value {
        let instance = self.new_instance(self.module_class);
        let name_key = Value::Obj(self.heap.intern("__name__"));
        let name_value = Value::Obj(self.heap.intern(name));
        if let Value::Obj(r) = instance {
            let mut fields = match self.heap.get_mut(r) {
                Some(ObjData::Instance(i)) => std::mem::take(&mut i.fields),
                _ => return instance,
            };
            {
                let policy = self.heap.key_policy();
                fields.set(&policy, name_key, name_value);
            }
            if let Some(ObjData::Instance(i)) = self.heap.get_mut(r) {
                i.fields = fields;
            }
        }
        instance
    }

    /// Wraps a freshly-compiled unit into a runnable closure whose
    /// globals resolve against `module_instance`.
    pub fn make_module_closure(&mut self, unit: CompiledUnit, module_instance: Value) -> Value {
        let code_ref = self.heap.alloc(ObjData::CodeObject(CodeObjectObj {
            chunk: unit.chunk,
            name: unit.name,
            qualname: unit.qualname,
            doc: unit.doc,
            filename: unit.filename,
        }));
        self.alloc_value(ObjData::Closure(ClosureObj {
            code: code_ref,
            upvalues: Vec::new(),
            globals_owner: module_instance,
            fields: vein_core::HashTable::new(),
            annotations: Value::None,
        }))
    }

    // -- Calling -------------------------------------------------------

    /// Calls `callee` with `args` and runs it to completion, returning its
    /// result or propagating an unhandled exception as `VmError::Unhandled`.
    pub fn invoke(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, VmError> {
        let (target, mut prefix_args) = crate::call::resolve_callee(self, callee)?;
        prefix_args.extend(args);
        match target {
            crate::call::Callee::Native(r) => crate::call::call_native(self, r, &prefix_args),
            crate::call::Callee::Constructor(r) => crate::call::construct(self, r, prefix_args),
            crate::call::Callee::Closure(r) => {
                if let Some(is_coroutine) = crate::call::generator_kind(self, r) {
                    Ok(crate::generator::create(self, r, prefix_args, is_coroutine))
                } else {
                    let target_depth = self.thread.frames.len();
                    crate::call::push_closure_frame(self, r, prefix_args)?;
                    crate::interp::run_to_completion(self, target_depth)
                }
            }
            crate::call::Callee::Generator(r) => crate::call::invoke_generator(self, r, prefix_args),
        }
    }

    pub fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect();
        }
    }

    /// Runs one full mark-and-sweep cycle. Roots are the value stack,
    /// the handler stack's payload-free entries (no `Value` there),
    /// every live frame's closure, and the builtin classes kept
    /// immortal at construction time.
    pub fn collect(&mut self) {
        let before = self.heap.live_count();
        tracing::debug!(live_before = before, "GC cycle starting");
        for v in self.thread.stack.clone() {
            self.heap.mark(v);
        }
        if let Some(exc) = self.thread.current_exception {
            self.heap.mark(exc);
        }
        for frame in self.thread.frames.clone() {
            self.heap.mark(Value::Obj(frame.closure));
            self.heap.mark(Value::Obj(frame.code));
        }
        for module in self.modules.loaded_modules().collect::<Vec<_>>() {
            self.heap.mark(module);
        }
        loop {
            let mut newly_marked = Vec::new();
            let progressed = self.heap.trace_step(&mut |heap, v| {
                if let Value::Obj(r) = v {
                    if heap.get(r).is_some() {
                        newly_marked.push(v);
                    }
                }
            });
            for v in newly_marked {
                self.heap.mark(v);
            }
            if !progressed {
                break;
            }
        }
        self.heap.sweep();
        let after = self.heap.live_count();
        tracing::debug!(
            live_after = after,
            freed = before.saturating_sub(after),
            "GC cycle finished"
        );
    }

    // -- Value introspection helpers used across interp/call/exceptions -

    pub fn type_name(&self, value: Value) -> String {
        match value {
            Value::Int(_) => "int".to_string(),
            Value::Float(_) => "float".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::None => "NoneType".to_string(),
            Value::NotImplemented => "NotImplementedType".to_string(),
            Value::Kwargs(_) => "<kwargs>".to_string(),
            Value::Handler { .. } => "<handler>".to_string(),
            Value::Obj(r) => match self.heap.get(r) {
                Some(ObjData::Instance(i)) => match self.heap.get(i.class) {
                    Some(ObjData::Class(c)) => c.name.clone(),
                    _ => "object".to_string(),
                },
                Some(ObjData::Class(c)) => format!("type[{}]", c.name),
                Some(other) => other.kind_name().to_string(),
                None => "<freed>".to_string(),
            },
        }
    }

    /// Looks up `receiver.<name>`, following the same field/method/
    /// builtin-attribute resolution as the `GET_PROPERTY`/`GET_NAME`
    /// opcodes. An attribute-error surfaces as `VmError::Unhandled`
    /// rather than the bare `Value` the bytecode dispatcher raises
    /// internally, matching `invoke`'s external-facing error convention.
    pub fn get_attribute(&mut self, receiver: Value, name: &str) -> Result<Value, VmError> {
        let key = Value::Obj(self.heap.intern(name));
        match crate::interp::get_attribute(self, receiver, key)? {
            Ok(v) => Ok(v),
            Err(exception) => {
                let frames = self.thread.frames.clone();
                let traceback = crate::exceptions::render_traceback(self, &frames, exception);
                Err(VmError::Unhandled {
                    exception,
                    traceback,
                })
            }
        }
    }

    pub fn exception_type(&self, exc: Value) -> Value {
        if let Value::Obj(r) = exc {
            if let Some(ObjData::Instance(i)) = self.heap.get(r) {
                return Value::Obj(i.class);
            }
        }
        Value::None
    }

    /// Truthiness per `SPEC_FULL.md` §11: `None`/`False`/numeric zero/
    /// empty sequences are falsey; everything else is truthy unless the
    /// value's class defines `__bool__` or (failing that) `__len__`.
    pub fn is_truthy(&mut self, value: Value) -> Result<bool, VmError> {
        Ok(match value {
            Value::None => false,
            Value::Bool(b) => b,
            Value::Int(n) => n != 0,
            Value::Float(f) => f != 0.0,
            Value::NotImplemented => true,
            Value::Kwargs(k) => k != vein_core::KwargsKind::Unset,
            Value::Handler { .. } => true,
            Value::Obj(r) => match self.heap.get(r) {
                Some(ObjData::Tuple(t)) => !t.items.is_empty(),
                Some(ObjData::List(l)) => !l.items.is_empty(),
                Some(ObjData::Dict(d)) => !d.entries.is_empty(),
                Some(ObjData::Set(s)) => !s.entries.is_empty(),
                Some(ObjData::Bytes(b)) => !b.items.is_empty(),
                Some(ObjData::Str(s)) => !s.bytes.is_empty(),
                Some(ObjData::Instance(i)) => {
                    let class_ref = i.class;
                    if let Some(bool_fn) = class::resolve_special(&self.heap, class_ref, SpecialMethod::Bool)
                    {
                        let result = self.invoke(bool_fn, vec![value])?;
                        return self.is_truthy(result);
                    }
                    if let Some(len_fn) = class::resolve_special(&self.heap, class_ref, SpecialMethod::Len)
                    {
                        let result = self.invoke(len_fn, vec![value])?;
                        return Ok(result.as_int().unwrap_or(0) != 0);
                    }
                    true
                }
                _ => true,
            },
        })
    }

    pub fn format_exception_line(&mut self, exception: Value) -> String {
        let class_name = match exception {
            Value::Obj(r) => match self.heap.get(r) {
                Some(ObjData::Instance(i)) => match self.heap.get(i.class) {
                    Some(ObjData::Class(c)) => c.name.clone(),
                    _ => "Exception".to_string(),
                },
                _ => "Exception".to_string(),
            },
            _ => "Exception".to_string(),
        };
        let message = self.exception_message(exception).unwrap_or_default();
        if message.is_empty() {
            format!("{class_name}\n")
        } else {
            format!("{class_name}: {message}\n")
        }
    }

    fn exception_message(&mut self, exception: Value) -> Option<String> {
        let Value::Obj(r) = exception else { return None };
        let key = Value::Obj(self.heap.intern("message"));
        let ObjData::Instance(i) = self.heap.get(r)? else {
            return None;
        };
        let policy = self.heap.key_policy();
        let value = *i.fields.get(&policy, key)?;
        match value {
            Value::Obj(vr) => self.heap.as_str(vr).map(|s| s.to_string()),
            other => Some(other.to_string()),
        }
    }

    // -- Top-level entrypoints ------------------------------------------

    pub fn interpret_source(&mut self, source: &str, filename: &str) -> Result<Value, VmError> {
        let unit = self
            .compiler
            .compile(source, filename)
            .map_err(|e| VmError::CompileError(e.to_string()))?;
        self.run_unit(unit, "__main__")
    }

    pub fn run_unit(&mut self, unit: CompiledUnit, module_name: &str) -> Result<Value, VmError> {
        let module_instance = self.new_module_instance(module_name);
        let closure = self.make_module_closure(unit, module_instance);
        self.invoke(closure, Vec::new())
    }

    pub fn import(&mut self, name: &str) -> Result<Value, VmError> {
        crate::module::import_module(self, name)
    }
}
