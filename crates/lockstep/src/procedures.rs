//! Deterministic stored procedures.
//!
//! Procedures are Lua sources keyed by name. Each worker owns one sandboxed
//! interpreter: the stdlib is cut down to tables and strings, so a procedure
//! sees no clock, no randomness, and no filesystem. A procedure observes
//! exactly its transaction's argument blobs (`ARGV`/`ARGC`) and a `store`
//! handle whose reads resolve from the transaction's collected environment;
//! touching an undeclared key fails the transaction.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{anyhow, Context};
use mlua::{Lua, LuaOptions, StdLib, Value};

use crate::remote_read::TxnExecEnvironment;
use crate::txn::Transaction;

pub const SIMPLE_SETTER: &str = "__simple_setter__";

const SIMPLE_SETTER_SRC: &str = r#"
for i = 1, ARGC
do
    store:Set(ARGV[i], store:Get(ARGV[i]))
end
"#;

/// Name → Lua source. Built once at engine start, read-only thereafter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcedureRegistry {
    procs: BTreeMap<String, String>,
}

impl ProcedureRegistry {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.procs.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn with_procedure(
        mut self,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        self.procs.insert(name.into(), source.into());
        self
    }
}

/// Build the registry of built-in procedures. Calling this again yields the
/// same contents.
pub fn init_stored_procedures() -> ProcedureRegistry {
    ProcedureRegistry::default().with_procedure(SIMPLE_SETTER, SIMPLE_SETTER_SRC)
}

/// One worker's interpreter plus its compiled-procedure cache.
pub struct LuaExecutor {
    lua: Lua,
    compiled: HashMap<String, mlua::Function>,
}

impl LuaExecutor {
    pub fn new() -> anyhow::Result<Self> {
        let lua = Lua::new_with(StdLib::TABLE | StdLib::STRING, LuaOptions::default())
            .context("create lua interpreter")?;
        Ok(Self {
            lua,
            compiled: HashMap::new(),
        })
    }

    /// Run `txn`'s stored procedure against the resolved read view and
    /// return the writes it produced, in execution order.
    pub fn run(
        &mut self,
        txn: &Transaction,
        env: &TxnExecEnvironment,
        registry: &ProcedureRegistry,
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let func = match self.compiled.get(&txn.stored_procedure) {
            Some(f) => f.clone(),
            None => {
                let source = registry.get(&txn.stored_procedure).ok_or_else(|| {
                    anyhow!("unknown stored procedure [{}]", txn.stored_procedure)
                })?;
                let f = self
                    .lua
                    .load(source)
                    .set_name(&txn.stored_procedure)
                    .into_function()
                    .with_context(|| {
                        format!("compile stored procedure [{}]", txn.stored_procedure)
                    })?;
                self.compiled.insert(txn.stored_procedure.clone(), f.clone());
                f
            }
        };

        let mut view: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (key, value) in env.keys.iter().zip(env.values.iter()) {
            view.insert(key.clone(), value.clone());
        }
        let declared: BTreeSet<Vec<u8>> = txn
            .read_set
            .iter()
            .chain(txn.read_write_set.iter())
            .cloned()
            .collect();
        let writable: BTreeSet<Vec<u8>> = txn.read_write_set.iter().cloned().collect();

        let view = RefCell::new(view);
        let writes = RefCell::new(Vec::<(Vec<u8>, Vec<u8>)>::new());

        self.lua
            .scope(|scope| {
                let globals = self.lua.globals();

                let argv = self.lua.create_table()?;
                for (i, arg) in txn.stored_procedure_args.iter().enumerate() {
                    argv.set(i + 1, self.lua.create_string(arg)?)?;
                }
                globals.set("ARGV", argv)?;
                globals.set("ARGC", txn.stored_procedure_args.len())?;

                let store = self.lua.create_table()?;
                let declared_ref = &declared;
                let view_ref = &view;
                store.set(
                    "Get",
                    scope.create_function(
                        move |lua, (_store, key): (Value, mlua::String)| {
                            let key = key.as_bytes().to_vec();
                            if !declared_ref.contains(&key) {
                                return Err(mlua::Error::RuntimeError(format!(
                                    "get of undeclared key [{}]",
                                    String::from_utf8_lossy(&key)
                                )));
                            }
                            match view_ref.borrow().get(&key) {
                                Some(value) => Ok(Some(lua.create_string(value)?)),
                                None => Ok(None),
                            }
                        },
                    )?,
                )?;
                let writable_ref = &writable;
                let view_ref = &view;
                let writes_ref = &writes;
                store.set(
                    "Set",
                    scope.create_function(
                        move |_lua, (_store, key, value): (Value, mlua::String, mlua::String)| {
                            let key = key.as_bytes().to_vec();
                            if !writable_ref.contains(&key) {
                                return Err(mlua::Error::RuntimeError(format!(
                                    "set of key [{}] outside the read-write set",
                                    String::from_utf8_lossy(&key)
                                )));
                            }
                            let value = value.as_bytes().to_vec();
                            view_ref.borrow_mut().insert(key.clone(), value.clone());
                            writes_ref.borrow_mut().push((key, value));
                            Ok(())
                        },
                    )?,
                )?;
                globals.set("store", store)?;

                func.call::<()>(())
            })
            .with_context(|| format!("run stored procedure [{}]", txn.stored_procedure))?;

        Ok(writes.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TransactionId;

    fn simple_setter_txn(keys: &[&[u8]]) -> Transaction {
        let mut txn = Transaction::new(TransactionId::new(), SIMPLE_SETTER);
        for key in keys {
            txn.add_read_write_key(key.to_vec());
            txn.add_arg(key.to_vec());
        }
        txn
    }

    fn env_for(txn: &Transaction, pairs: &[(&[u8], &[u8])]) -> TxnExecEnvironment {
        TxnExecEnvironment {
            txn_id: txn.id,
            keys: pairs.iter().map(|(k, _)| k.to_vec()).collect(),
            values: pairs.iter().map(|(_, v)| v.to_vec()).collect(),
            total_num_locks: pairs.len() as u32,
        }
    }

    #[test]
    fn init_is_idempotent() {
        assert_eq!(init_stored_procedures(), init_stored_procedures());
    }

    #[test]
    fn simple_setter_writes_resolved_values() {
        let registry = init_stored_procedures();
        let mut exec = LuaExecutor::new().unwrap();
        let txn = simple_setter_txn(&[b"narf"]);
        let env = env_for(&txn, &[(b"narf", b"narf_value")]);

        let writes = exec.run(&txn, &env, &registry).unwrap();
        assert_eq!(writes, vec![(b"narf".to_vec(), b"narf_value".to_vec())]);
    }

    #[test]
    fn undeclared_get_fails_the_procedure() {
        let registry =
            init_stored_procedures().with_procedure("peek", r#"store:Get("other")"#);
        let mut exec = LuaExecutor::new().unwrap();
        let mut txn = Transaction::new(TransactionId::new(), "peek");
        txn.add_read_key(b"narf".to_vec());
        let env = env_for(&txn, &[(b"narf", b"narf_value")]);

        let err = exec.run(&txn, &env, &registry).unwrap_err();
        assert!(format!("{err:#}").contains("undeclared key"));
    }

    #[test]
    fn set_outside_read_write_set_fails() {
        let registry = init_stored_procedures()
            .with_procedure("sneak", r#"store:Set("narf", "x")"#);
        let mut exec = LuaExecutor::new().unwrap();
        let mut txn = Transaction::new(TransactionId::new(), "sneak");
        txn.add_read_key(b"narf".to_vec());
        let env = env_for(&txn, &[(b"narf", b"narf_value")]);

        let err = exec.run(&txn, &env, &registry).unwrap_err();
        assert!(format!("{err:#}").contains("read-write set"));
    }

    #[test]
    fn reads_observe_earlier_writes() {
        let registry = init_stored_procedures().with_procedure(
            "double",
            r#"
store:Set("narf", store:Get("narf") .. "!")
store:Set("narf", store:Get("narf") .. "!")
"#,
        );
        let mut exec = LuaExecutor::new().unwrap();
        let mut txn = Transaction::new(TransactionId::new(), "double");
        txn.add_read_write_key(b"narf".to_vec());
        let env = env_for(&txn, &[(b"narf", b"v")]);

        let writes = exec.run(&txn, &env, &registry).unwrap();
        assert_eq!(writes.last().unwrap().1, b"v!!".to_vec());
    }

    #[test]
    fn unknown_procedure_is_an_error() {
        let registry = init_stored_procedures();
        let mut exec = LuaExecutor::new().unwrap();
        let txn = Transaction::new(TransactionId::new(), "nope");
        let env = env_for(&txn, &[]);
        assert!(exec.run(&txn, &env, &registry).is_err());
    }

    #[test]
    fn sandbox_has_no_ambient_capabilities() {
        let registry = init_stored_procedures()
            .with_procedure("probe", r#"if os ~= nil or io ~= nil then error("leak") end"#);
        let mut exec = LuaExecutor::new().unwrap();
        let txn = Transaction::new(TransactionId::new(), "probe");
        let env = env_for(&txn, &[]);
        assert!(exec.run(&txn, &env, &registry).is_ok());
    }

    #[test]
    fn compiled_procedures_are_cached_per_worker() {
        let registry = init_stored_procedures();
        let mut exec = LuaExecutor::new().unwrap();
        let txn = simple_setter_txn(&[b"narf"]);
        let env = env_for(&txn, &[(b"narf", b"narf_value")]);
        exec.run(&txn, &env, &registry).unwrap();
        exec.run(&txn, &env, &registry).unwrap();
        assert_eq!(exec.compiled.len(), 1);
    }
}
