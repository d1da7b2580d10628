//! Scripted backend shim for driving the session handler without a real
//! debugger process.

use dlv_bridge::api::{
    Api, BackendBreakpoint, BackendLocation, DebugVariable, DebuggerState, EvalScope, Goroutine,
    VersionInfo,
};
use dlv_bridge::rpc::RpcError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct MockApi {
    pub calls: Mutex<Vec<String>>,
    /// Scripted results for `Command`, popped in order; an unscripted
    /// command succeeds with a default (stopped) state.
    pub command_results: Mutex<VecDeque<Result<DebuggerState, String>>>,
    /// Block `halt` commands for this long before answering.
    pub halt_delay: Mutex<Option<Duration>>,
    /// Scripted results for `CreateBreakpoint`, popped in order.
    pub create_results: Mutex<VecDeque<Result<BackendBreakpoint, String>>>,
    pub listing: Mutex<Vec<BackendBreakpoint>>,
    pub goroutines: Mutex<Vec<Goroutine>>,
    pub locals: Mutex<Vec<DebugVariable>>,
    pub function_args: Mutex<Vec<DebugVariable>>,
}

impl MockApi {
    pub fn new() -> MockApi {
        MockApi::default()
    }

    pub fn logged_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }
}

fn backend_err(message: String) -> RpcError {
    RpcError::Backend(message)
}

impl Api for MockApi {
    fn get_version(&self) -> Result<VersionInfo, RpcError> {
        self.log("GetVersion".to_string());
        Ok(VersionInfo {
            backend_version: "mock".to_string(),
            api_version: 2,
        })
    }

    fn state(&self, _non_blocking: bool) -> Result<DebuggerState, RpcError> {
        self.log("State".to_string());
        Ok(DebuggerState::default())
    }

    fn command(&self, name: &str) -> Result<DebuggerState, RpcError> {
        self.log(format!("Command:{name}"));
        if name == "halt" {
            let delay = *self.halt_delay.lock().unwrap();
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
        }
        match self.command_results.lock().unwrap().pop_front() {
            Some(Ok(state)) => Ok(state),
            Some(Err(message)) => Err(backend_err(message)),
            None => Ok(DebuggerState::default()),
        }
    }

    fn create_breakpoint(&self, bp: &BackendBreakpoint) -> Result<BackendBreakpoint, RpcError> {
        self.log(format!("CreateBreakpoint:{}:{}", bp.file, bp.line));
        match self.create_results.lock().unwrap().pop_front() {
            Some(Ok(record)) => Ok(record),
            Some(Err(message)) => Err(backend_err(message)),
            None => Ok(BackendBreakpoint {
                id: bp.line,
                file: bp.file.clone(),
                line: bp.line,
                ..Default::default()
            }),
        }
    }

    fn clear_breakpoint(&self, id: i64) -> Result<(), RpcError> {
        self.log(format!("ClearBreakpoint:{id}"));
        Ok(())
    }

    fn list_breakpoints(&self) -> Result<Vec<BackendBreakpoint>, RpcError> {
        self.log("ListBreakpoints".to_string());
        Ok(self.listing.lock().unwrap().clone())
    }

    fn list_goroutines(&self, _count: Option<i64>) -> Result<Vec<Goroutine>, RpcError> {
        self.log("ListGoroutines".to_string());
        Ok(self.goroutines.lock().unwrap().clone())
    }

    fn stacktrace(
        &self,
        goroutine_id: i64,
        _depth: i64,
    ) -> Result<Vec<BackendLocation>, RpcError> {
        self.log(format!("Stacktrace:{goroutine_id}"));
        Ok(vec![])
    }

    fn list_local_vars(&self, _scope: &EvalScope) -> Result<Vec<DebugVariable>, RpcError> {
        self.log("ListLocalVars".to_string());
        Ok(self.locals.lock().unwrap().clone())
    }

    fn list_function_args(&self, _scope: &EvalScope) -> Result<Vec<DebugVariable>, RpcError> {
        self.log("ListFunctionArgs".to_string());
        Ok(self.function_args.lock().unwrap().clone())
    }

    fn list_package_vars(&self, filter: &str) -> Result<Vec<DebugVariable>, RpcError> {
        self.log(format!("ListPackageVars:{filter}"));
        Ok(vec![])
    }

    fn eval(&self, _scope: &EvalScope, expr: &str) -> Result<DebugVariable, RpcError> {
        self.log(format!("Eval:{expr}"));
        Ok(DebugVariable {
            name: expr.to_string(),
            kind: dlv_bridge::api::kind::INT,
            value: "0".to_string(),
            ..Default::default()
        })
    }

    fn set_symbol(&self, _scope: &EvalScope, symbol: &str, value: &str) -> Result<(), RpcError> {
        self.log(format!("Set:{symbol}={value}"));
        Ok(())
    }

    fn detach(&self, kill: bool) -> Result<(), RpcError> {
        self.log(format!("Detach:{kill}"));
        Ok(())
    }

    fn close(&self) {
        self.log("close".to_string());
    }
}
