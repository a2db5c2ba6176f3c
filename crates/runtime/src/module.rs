//! The module loader. See `SPEC_FULL.md` §4.6.
//!
//! A module is represented the same way a class instance is — an
//! `Instance` of the builtin `module` class, its fields table holding
//! the module's globals — so `GET_GLOBAL`/`SET_GLOBAL` can reuse the
//! same attribute machinery `class.rs` already provides instead of a
//! parallel globals representation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use vein_core::{ObjRef, Value};

use crate::error::VmError;
use crate::obj::ObjData;
use crate::vm::Vm;

#[derive(Debug, Default)]
pub struct ModuleLoader {
    pub search_paths: Vec<PathBuf>,
    loaded: HashMap<String, Value>,
    loading: HashSet<String>,
}

impl ModuleLoader {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            loaded: HashMap::new(),
            loading: HashSet::new(),
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    pub fn get_loaded(&self, name: &str) -> Option<Value> {
        self.loaded.get(name).copied()
    }

    /// Every module currently cached, for the GC to root — an imported
    /// module stays reachable even once nothing on the call stack still
    /// references it directly (matches `import os; del os` still being
    /// able to `import os` again without re-running top-level code).
    pub fn loaded_modules(&self) -> impl Iterator<Item = Value> + '_ {
        self.loaded.values().copied()
    }

    fn resolve_path(&self, name: &str) -> Option<PathBuf> {
        let rel = format!("{}.vn", name.replace('.', "/"));
        for root in &self.search_paths {
            let candidate = root.join(&rel);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

/// Loads (and caches) module `name`. Matches §4.6: search the configured
/// path list, detect import cycles by tracking in-progress loads,
/// compile and run the module body once, then cache the resulting module
/// object under its fully qualified name so a second `import` of the
/// same name is a cache hit rather than a re-run.
pub fn import_module(vm: &mut Vm, name: &str) -> Result<Value, VmError> {
    if let Some(existing) = vm.modules.get_loaded(name) {
        tracing::debug!(module = name, "import cache hit");
        return Ok(existing);
    }
    if vm.modules.loading.contains(name) {
        return Err(VmError::ImportCycle {
            name: name.to_string(),
        });
    }

    let path = vm.modules.resolve_path(name).ok_or_else(|| VmError::ModuleNotFound {
        name: name.to_string(),
        searched: vm
            .modules
            .search_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
    })?;
    tracing::debug!(module = name, path = %path.display(), "resolved module path");

    let source = std::fs::read_to_string(&path).map_err(|source| VmError::ModuleIo {
        path: path.display().to_string(),
        source,
    })?;

    vm.modules.loading.insert(name.to_string());
    let result = load_source(vm, name, &path, &source);
    vm.modules.loading.remove(name);

    let module = result?;
    vm.modules.loaded.insert(name.to_string(), module);
    tracing::debug!(module = name, "module loaded and cached");
    Ok(module)
}

fn load_source(vm: &mut Vm, name: &str, path: &Path, source: &str) -> Result<Value, VmError> {
    let filename = path.display().to_string();
    let unit = vm
        .compiler
        .compile(source, &filename)
        .map_err(|e| VmError::CompileError(e.to_string()))?;
    let module_instance = vm.new_module_instance(name);
    let closure = vm.make_module_closure(unit, module_instance);
    vm.invoke(closure, Vec::new())?;
    Ok(module_instance)
}

/// Relative-import resolution: `from . import x` / `from ..pkg import y`
/// rewrite the target module name relative to the importing module's own
/// dotted name before delegating to `import_module`. `level` is the
/// number of leading dots (1 = current package).
pub fn resolve_relative_name(importing_module: &str, target: &str, level: u32) -> String {
    if level == 0 {
        return target.to_string();
    }
    let mut parts: Vec<&str> = importing_module.split('.').collect();
    for _ in 0..level {
        parts.pop();
    }
    if target.is_empty() {
        parts.join(".")
    } else {
        parts.push(target);
        parts.join(".")
    }
}

/// Looks up `attr` on an already-loaded module instance, for
/// `IMPORT_FROM`'s "pull one name out of the just-imported module" step.
pub fn get_module_attr(vm: &mut Vm, module: Value, attr: &str) -> Option<Value> {
    let Value::Obj(r) = module else { return None };
    let name_value = Value::Obj(vm.heap.intern(attr));
    let ObjData::Instance(instance) = vm.heap.get(r)? else {
        return None;
    };
    let policy = vm.heap.key_policy();
    instance.fields.get(&policy, name_value).copied()
}

pub type ModuleRef = ObjRef;
