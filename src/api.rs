//! Typed view of the backend RPC surface, behind one interface that hides
//! the two wire dialects.
//!
//! The v1 server returns raw state/variable objects and takes positional
//! argument shapes; the v2 server wraps results under `{State}` /
//! `{Variables}` / `{Locations}` / `{Args}` / `{Variable}` / `{Breakpoint}` /
//! `{Breakpoints}` and takes named argument records, with every
//! variable-reading call carrying the session load config. Session code
//! references [`Api`] only.

use crate::config::LoadConfig;
use crate::rpc::{RpcCall, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Go reflect kinds, as the backend tags variable shapes.
pub mod kind {
    pub const BOOL: u64 = 1;
    pub const INT: u64 = 2;
    pub const UINT: u64 = 7;
    pub const FLOAT64: u64 = 14;
    pub const ARRAY: u64 = 17;
    pub const CHAN: u64 = 18;
    pub const FUNC: u64 = 19;
    pub const INTERFACE: u64 = 20;
    pub const MAP: u64 = 21;
    pub const PTR: u64 = 22;
    pub const SLICE: u64 = 23;
    pub const STRING: u64 = 24;
    pub const STRUCT: u64 = 25;
    pub const UNSAFE_POINTER: u64 = 26;
}

/// Variable flag bits reported by the backend.
pub mod flags {
    pub const ESCAPED: u64 = 1;
    pub const SHADOWED: u64 = 2;
    pub const CONSTANT: u64 = 4;
    pub const ARGUMENT: u64 = 8;
    pub const RETURN_ARGUMENT: u64 = 16;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VersionInfo {
    #[serde(rename = "DelveVersion")]
    pub backend_version: String,
    #[serde(rename = "APIVersion")]
    pub api_version: i64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FunctionInfo {
    pub name: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendLocation {
    pub pc: u64,
    pub file: String,
    pub line: i64,
    pub function: Option<FunctionInfo>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Goroutine {
    pub id: i64,
    #[serde(rename = "currentLoc")]
    pub current_loc: BackendLocation,
    #[serde(rename = "userCurrentLoc")]
    pub user_current_loc: BackendLocation,
    #[serde(rename = "goStatementLoc")]
    pub go_statement_loc: BackendLocation,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendThread {
    pub id: i64,
    pub file: String,
    pub line: i64,
    pub function: Option<FunctionInfo>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebuggerState {
    pub exited: bool,
    #[serde(rename = "exitStatus")]
    pub exit_status: i64,
    #[serde(rename = "currentThread")]
    pub current_thread: Option<BackendThread>,
    #[serde(rename = "currentGoroutine")]
    pub current_goroutine: Option<Goroutine>,
}

/// One variable node as the backend reports it. `fully_qualified_name` is
/// derived on this side and never crosses the wire.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugVariable {
    pub name: String,
    pub addr: u64,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(rename = "realType")]
    pub real_type: String,
    pub kind: u64,
    pub flags: u64,
    #[serde(rename = "onlyAddr")]
    pub only_addr: bool,
    #[serde(rename = "DeclLine")]
    pub decl_line: i64,
    pub value: String,
    pub len: i64,
    pub cap: i64,
    pub children: Vec<DebugVariable>,
    pub unreadable: String,
    pub base: u64,
    #[serde(skip)]
    pub fully_qualified_name: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendBreakpoint {
    pub id: i64,
    pub file: String,
    pub line: i64,
    #[serde(rename = "functionName", skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(rename = "loadArgs", skip_serializing_if = "Option::is_none")]
    pub load_args: Option<LoadConfig>,
    #[serde(rename = "loadLocals", skip_serializing_if = "Option::is_none")]
    pub load_locals: Option<LoadConfig>,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EvalScope {
    #[serde(rename = "GoroutineID")]
    pub goroutine_id: i64,
    #[serde(rename = "Frame")]
    pub frame: i64,
}

/// The backend surface the session consumes, independent of dialect.
pub trait Api: Send + Sync {
    fn get_version(&self) -> Result<VersionInfo, RpcError>;
    fn state(&self, non_blocking: bool) -> Result<DebuggerState, RpcError>;
    /// `name` is one of continue, next, step, stepOut, halt.
    fn command(&self, name: &str) -> Result<DebuggerState, RpcError>;
    fn create_breakpoint(&self, bp: &BackendBreakpoint) -> Result<BackendBreakpoint, RpcError>;
    fn clear_breakpoint(&self, id: i64) -> Result<(), RpcError>;
    fn list_breakpoints(&self) -> Result<Vec<BackendBreakpoint>, RpcError>;
    fn list_goroutines(&self, count: Option<i64>) -> Result<Vec<Goroutine>, RpcError>;
    fn stacktrace(&self, goroutine_id: i64, depth: i64) -> Result<Vec<BackendLocation>, RpcError>;
    fn list_local_vars(&self, scope: &EvalScope) -> Result<Vec<DebugVariable>, RpcError>;
    fn list_function_args(&self, scope: &EvalScope) -> Result<Vec<DebugVariable>, RpcError>;
    fn list_package_vars(&self, filter: &str) -> Result<Vec<DebugVariable>, RpcError>;
    fn eval(&self, scope: &EvalScope, expr: &str) -> Result<DebugVariable, RpcError>;
    fn set_symbol(&self, scope: &EvalScope, symbol: &str, value: &str) -> Result<(), RpcError>;
    fn detach(&self, kill: bool) -> Result<(), RpcError>;
    fn close(&self);
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, RpcError> {
    Ok(serde_json::from_value(value)?)
}

fn unwrap_field(value: Value, field: &str) -> Result<Value, RpcError> {
    match value {
        Value::Object(mut map) => map
            .remove(field)
            .ok_or_else(|| RpcError::Backend(format!("response missing {field} field"))),
        other => Err(RpcError::Backend(format!(
            "expected object with {field}, got: {other}"
        ))),
    }
}

pub struct V1Api {
    client: Arc<dyn RpcCall>,
}

impl V1Api {
    pub fn new(client: Arc<dyn RpcCall>) -> V1Api {
        V1Api { client }
    }
}

impl Api for V1Api {
    fn get_version(&self) -> Result<VersionInfo, RpcError> {
        decode(self.client.call("GetVersion", json!({}))?)
    }

    fn state(&self, _non_blocking: bool) -> Result<DebuggerState, RpcError> {
        decode(self.client.call("State", json!({}))?)
    }

    fn command(&self, name: &str) -> Result<DebuggerState, RpcError> {
        decode(self.client.call("Command", json!({ "name": name }))?)
    }

    fn create_breakpoint(&self, bp: &BackendBreakpoint) -> Result<BackendBreakpoint, RpcError> {
        decode(self.client.call("CreateBreakpoint", serde_json::to_value(bp)?)?)
    }

    fn clear_breakpoint(&self, id: i64) -> Result<(), RpcError> {
        self.client.call("ClearBreakpoint", json!(id))?;
        Ok(())
    }

    fn list_breakpoints(&self) -> Result<Vec<BackendBreakpoint>, RpcError> {
        decode(self.client.call("ListBreakpoints", json!({}))?)
    }

    fn list_goroutines(&self, _count: Option<i64>) -> Result<Vec<Goroutine>, RpcError> {
        decode(self.client.call("ListGoroutines", json!({}))?)
    }

    fn stacktrace(&self, goroutine_id: i64, depth: i64) -> Result<Vec<BackendLocation>, RpcError> {
        decode(self.client.call(
            "StacktraceGoroutine",
            json!({ "Id": goroutine_id, "Depth": depth }),
        )?)
    }

    fn list_local_vars(&self, scope: &EvalScope) -> Result<Vec<DebugVariable>, RpcError> {
        decode(self.client.call("ListLocalVars", serde_json::to_value(scope)?)?)
    }

    fn list_function_args(&self, scope: &EvalScope) -> Result<Vec<DebugVariable>, RpcError> {
        decode(self.client.call("ListFunctionArgs", serde_json::to_value(scope)?)?)
    }

    fn list_package_vars(&self, filter: &str) -> Result<Vec<DebugVariable>, RpcError> {
        decode(self.client.call("ListPackageVars", json!(filter))?)
    }

    fn eval(&self, scope: &EvalScope, expr: &str) -> Result<DebugVariable, RpcError> {
        decode(
            self.client
                .call("EvalSymbol", json!({ "Symbol": expr, "Scope": scope }))?,
        )
    }

    fn set_symbol(&self, scope: &EvalScope, symbol: &str, value: &str) -> Result<(), RpcError> {
        self.client.call(
            "SetSymbol",
            json!({ "Scope": scope, "Symbol": symbol, "Value": value }),
        )?;
        Ok(())
    }

    fn detach(&self, kill: bool) -> Result<(), RpcError> {
        // the v1 server takes the kill flag as a bare boolean
        self.client.call("Detach", json!(kill))?;
        Ok(())
    }

    fn close(&self) {
        self.client.close();
    }
}

pub struct V2Api {
    client: Arc<dyn RpcCall>,
    load_config: LoadConfig,
}

impl V2Api {
    pub fn new(client: Arc<dyn RpcCall>, load_config: LoadConfig) -> V2Api {
        V2Api { client, load_config }
    }
}

impl Api for V2Api {
    fn get_version(&self) -> Result<VersionInfo, RpcError> {
        decode(self.client.call("GetVersion", json!({}))?)
    }

    fn state(&self, non_blocking: bool) -> Result<DebuggerState, RpcError> {
        let out = self
            .client
            .call("State", json!({ "NonBlocking": non_blocking }))?;
        decode(unwrap_field(out, "State")?)
    }

    fn command(&self, name: &str) -> Result<DebuggerState, RpcError> {
        let out = self.client.call("Command", json!({ "name": name }))?;
        decode(unwrap_field(out, "State")?)
    }

    fn create_breakpoint(&self, bp: &BackendBreakpoint) -> Result<BackendBreakpoint, RpcError> {
        let out = self
            .client
            .call("CreateBreakpoint", json!({ "Breakpoint": bp }))?;
        decode(unwrap_field(out, "Breakpoint")?)
    }

    fn clear_breakpoint(&self, id: i64) -> Result<(), RpcError> {
        self.client.call("ClearBreakpoint", json!({ "Id": id }))?;
        Ok(())
    }

    fn list_breakpoints(&self) -> Result<Vec<BackendBreakpoint>, RpcError> {
        let out = self.client.call("ListBreakpoints", json!({}))?;
        decode(unwrap_field(out, "Breakpoints")?)
    }

    fn list_goroutines(&self, count: Option<i64>) -> Result<Vec<Goroutine>, RpcError> {
        let params = match count {
            Some(n) => json!({ "Count": n }),
            None => json!({}),
        };
        let out = self.client.call("ListGoroutines", params)?;
        decode(unwrap_field(out, "Goroutines")?)
    }

    fn stacktrace(&self, goroutine_id: i64, depth: i64) -> Result<Vec<BackendLocation>, RpcError> {
        let out = self.client.call(
            "Stacktrace",
            json!({
                "Id": goroutine_id,
                "Depth": depth,
                "Full": false,
                "Cfg": self.load_config,
            }),
        )?;
        decode(unwrap_field(out, "Locations")?)
    }

    fn list_local_vars(&self, scope: &EvalScope) -> Result<Vec<DebugVariable>, RpcError> {
        let out = self.client.call(
            "ListLocalVars",
            json!({ "Scope": scope, "Cfg": self.load_config }),
        )?;
        decode(unwrap_field(out, "Variables")?)
    }

    fn list_function_args(&self, scope: &EvalScope) -> Result<Vec<DebugVariable>, RpcError> {
        let out = self.client.call(
            "ListFunctionArgs",
            json!({ "Scope": scope, "Cfg": self.load_config }),
        )?;
        decode(unwrap_field(out, "Args")?)
    }

    fn list_package_vars(&self, filter: &str) -> Result<Vec<DebugVariable>, RpcError> {
        let out = self.client.call(
            "ListPackageVars",
            json!({ "Filter": filter, "Cfg": self.load_config }),
        )?;
        decode(unwrap_field(out, "Variables")?)
    }

    fn eval(&self, scope: &EvalScope, expr: &str) -> Result<DebugVariable, RpcError> {
        let out = self.client.call(
            "Eval",
            json!({ "Expr": expr, "Scope": scope, "Cfg": self.load_config }),
        )?;
        decode(unwrap_field(out, "Variable")?)
    }

    fn set_symbol(&self, scope: &EvalScope, symbol: &str, value: &str) -> Result<(), RpcError> {
        self.client.call(
            "Set",
            json!({ "Scope": scope, "Symbol": symbol, "Value": value }),
        )?;
        Ok(())
    }

    fn detach(&self, kill: bool) -> Result<(), RpcError> {
        self.client.call("Detach", json!({ "Kill": kill }))?;
        Ok(())
    }

    fn close(&self) {
        self.client.close();
    }
}

/// Build the shim for the dialect the client selected.
pub fn new_api(version: i64, client: Arc<dyn RpcCall>, load_config: LoadConfig) -> Arc<dyn Api> {
    if version == 1 {
        Arc::new(V1Api::new(client))
    } else {
        Arc::new(V2Api::new(client, load_config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeCall {
        pub log: Mutex<Vec<(String, Value)>>,
        pub responses: Mutex<Vec<Value>>,
    }

    impl FakeCall {
        fn with_responses(responses: Vec<Value>) -> Arc<FakeCall> {
            Arc::new(FakeCall {
                log: Mutex::new(vec![]),
                responses: Mutex::new(responses),
            })
        }
    }

    impl RpcCall for FakeCall {
        fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            self.log
                .lock()
                .map_err(|_| RpcError::PoisonedLock("log"))?
                .push((method.to_string(), params));
            let mut responses = self
                .responses
                .lock()
                .map_err(|_| RpcError::PoisonedLock("responses"))?;
            if responses.is_empty() {
                return Err(RpcError::Backend("no scripted response".to_string()));
            }
            Ok(responses.remove(0))
        }
    }

    #[test]
    fn v2_unwraps_state_and_carries_load_config() {
        let fake = FakeCall::with_responses(vec![json!({
            "State": { "exited": false, "currentGoroutine": { "id": 7 } }
        })]);
        let api = V2Api::new(fake.clone(), LoadConfig::default());
        let state = api.state(true).expect("state");
        assert_eq!(state.current_goroutine.expect("goroutine").id, 7);

        let log = fake.log.lock().expect("log");
        assert_eq!(log[0].0, "State");
        assert_eq!(log[0].1["NonBlocking"], true);
    }

    #[test]
    fn v2_variable_listing_includes_cfg() {
        let fake = FakeCall::with_responses(vec![json!({ "Variables": [{ "name": "x" }] })]);
        let api = V2Api::new(fake.clone(), LoadConfig::default());
        let scope = EvalScope {
            goroutine_id: 3,
            frame: 0,
        };
        let vars = api.list_local_vars(&scope).expect("vars");
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, "x");

        let log = fake.log.lock().expect("log");
        assert_eq!(log[0].1["Scope"]["GoroutineID"], 3);
        assert_eq!(log[0].1["Cfg"]["maxStringLen"], 64);
    }

    #[test]
    fn v1_returns_raw_shapes_and_bare_detach_bool() {
        let fake = FakeCall::with_responses(vec![
            json!([{ "name": "a" }, { "name": "b" }]),
            json!(null),
        ]);
        let api = V1Api::new(fake.clone());
        let scope = EvalScope {
            goroutine_id: 1,
            frame: 0,
        };
        let vars = api.list_local_vars(&scope).expect("vars");
        assert_eq!(vars.len(), 2);
        api.detach(true).expect("detach");

        let log = fake.log.lock().expect("log");
        assert_eq!(log[0].0, "ListLocalVars");
        assert_eq!(log[1].0, "Detach");
        assert_eq!(log[1].1, json!(true));
    }

    #[test]
    fn v1_and_v2_use_distinct_rpc_names_for_assignment() {
        let fake1 = FakeCall::with_responses(vec![json!(null)]);
        let api1 = V1Api::new(fake1.clone());
        let scope = EvalScope::default();
        api1.set_symbol(&scope, "x", "42").expect("set");
        assert_eq!(fake1.log.lock().expect("log")[0].0, "SetSymbol");

        let fake2 = FakeCall::with_responses(vec![json!(null)]);
        let api2 = V2Api::new(fake2.clone(), LoadConfig::default());
        api2.set_symbol(&scope, "x", "42").expect("set");
        assert_eq!(fake2.log.lock().expect("log")[0].0, "Set");
    }
}
