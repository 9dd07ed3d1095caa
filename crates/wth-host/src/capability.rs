//! Threads capability negotiation
//!
//! A module gets threads iff it imports `env.memory` as a shared memory.
//! The decision is made once per module; callers pass the resulting
//! [`ThreadsCapability`] around instead of re-inspecting imports.
//!
//! An unshared `env.memory` import still gets a memory with the declared
//! limits, created in the main context only, and no threads.

use tracing::debug;
use wasmtime::{ExternType, MemoryType, Module};
use wth_pool::{MemoryLimits, ThreadsCapability};

use crate::error::HostError;

/// Import module of the shared linear memory.
pub const MEMORY_MODULE: &str = "env";

/// Import name of the shared linear memory.
pub const MEMORY_NAME: &str = "memory";

/// Inspect `module`'s imports and decide whether it runs with threads.
///
/// - no `env.memory` import: [`ThreadsCapability::Absent`]
/// - unshared memory import: [`ThreadsCapability::Absent`]
/// - shared memory import: [`ThreadsCapability::Present`]
pub fn negotiate(module: &Module) -> Result<ThreadsCapability, HostError> {
    match memory_import(module)? {
        Some(limits) if limits.shared => {
            debug!(
                minimum = limits.minimum,
                maximum = ?limits.maximum,
                "shared memory import, threads available"
            );
            Ok(ThreadsCapability::Present(limits))
        }
        Some(_) => {
            debug!("unshared env.memory import, threads unavailable");
            Ok(ThreadsCapability::Absent)
        }
        None => {
            debug!("no env.memory import, threads unavailable");
            Ok(ThreadsCapability::Absent)
        }
    }
}

/// Declared limits and flags of the module's `env.memory` import, if any.
///
/// 64-bit memories and page counts past `u32` are rejected.
pub fn memory_import(module: &Module) -> Result<Option<MemoryLimits>, HostError> {
    let memory = module.imports().find_map(|import| {
        if import.module() != MEMORY_MODULE || import.name() != MEMORY_NAME {
            return None;
        }
        match import.ty() {
            ExternType::Memory(ty) => Some(ty),
            _ => None,
        }
    });

    memory.map(|ty| memory_limits(&ty)).transpose()
}

fn memory_limits(ty: &MemoryType) -> Result<MemoryLimits, HostError> {
    if ty.is_64() {
        return Err(HostError::UnsupportedMemory("64-bit memory".into()));
    }
    let pages = |n: u64| {
        u32::try_from(n)
            .map_err(|_| HostError::UnsupportedMemory(format!("{n} pages exceeds 32-bit limit")))
    };
    Ok(MemoryLimits {
        minimum: pages(ty.minimum())?,
        maximum: ty.maximum().map(pages).transpose()?,
        shared: ty.is_shared(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Config, Engine};

    fn compile(wat: &str) -> Module {
        let mut config = Config::new();
        config.wasm_threads(true);
        let engine = Engine::new(&config).unwrap();
        Module::new(&engine, wat).unwrap()
    }

    #[test]
    fn test_shared_import_is_present() {
        let module = compile(r#"(module (import "env" "memory" (memory 2 16 shared)))"#);
        assert_eq!(
            negotiate(&module).unwrap(),
            ThreadsCapability::Present(MemoryLimits {
                minimum: 2,
                maximum: Some(16),
                shared: true,
            })
        );
    }

    #[test]
    fn test_own_memory_is_absent() {
        let module = compile(r#"(module (memory (export "memory") 1))"#);
        assert_eq!(negotiate(&module).unwrap(), ThreadsCapability::Absent);
    }

    #[test]
    fn test_unshared_import_has_no_threads() {
        let module = compile(r#"(module (import "env" "memory" (memory 1 4)))"#);
        assert_eq!(negotiate(&module).unwrap(), ThreadsCapability::Absent);
        assert_eq!(
            memory_import(&module).unwrap(),
            Some(MemoryLimits {
                minimum: 1,
                maximum: Some(4),
                shared: false,
            })
        );
    }

    #[test]
    fn test_own_memory_has_no_import() {
        let module = compile(r#"(module (memory (export "memory") 1))"#);
        assert_eq!(memory_import(&module).unwrap(), None);
    }

    #[test]
    fn test_other_memory_import_is_ignored() {
        let module = compile(r#"(module (import "js" "mem" (memory 1 1 shared)))"#);
        assert_eq!(negotiate(&module).unwrap(), ThreadsCapability::Absent);
    }
}
