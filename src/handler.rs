//! The session controller: owns the backend, drives the run-state machine
//! and implements the DAP request handlers.
//!
//! Handlers queue their responses/events on the session's [`DapSender`];
//! the server loop flushes after each dispatch. Long-running `continue`
//! commands run on their own thread and come back through the session
//! event channel as [`SessionEvent::ContinueDone`].

use crate::api::{self, Api, DebuggerState, EvalScope};
use crate::breakpoints::BreakpointStore;
use crate::config::{
    self, AttachArguments, LaunchArguments, LoadConfig, SessionMode, DEFAULT_STACK_TRACE_DEPTH,
};
use crate::dap::Request;
use crate::dap_types;
use crate::events::{DapSender, SessionEvent};
use crate::launcher::{self, BackendProcess};
use crate::paths::{normalize_path, PathMapper};
use crate::rpc::{RpcClient, RpcError};
use crate::variables::{
    self, FrameRef, HandleArena, PackageInfoCache, VariableEntry, INITDONE_NAME,
};
use log::{error, info, warn};
use serde_json::json;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

pub const ERR_VERSION: i64 = 2001;
pub const ERR_THREADS: i64 = 2003;
pub const ERR_STACKTRACE: i64 = 2004;
pub const ERR_LOCALS: i64 = 2005;
pub const ERR_ARGS: i64 = 2006;
pub const ERR_GLOBALS: i64 = 2007;
pub const ERR_HALT_FOR_BREAKPOINTS: i64 = 2008;
pub const ERR_EVALUATE: i64 = 2009;
pub const ERR_SET_OR_PAUSE: i64 = 2010;
pub const ERR_START_SESSION: i64 = 3000;

/// Thread reported while the backend is running. The backend does not
/// guarantee that goroutine 1 is the main goroutine, but clients depend on
/// a stable id here.
pub const DUMMY_THREAD_ID: i64 = 1;
pub const DUMMY_THREAD_NAME: &str = "Dummy";

const DISCONNECT_HALT_TIMEOUT: Duration = Duration::from_secs(1);
const REMOTE_CONNECT_GRACE: Duration = Duration::from_millis(200);

/// The halt error text the backend produces when the target is already
/// gone. No typed code exists on this wire; keep the predicate in one
/// place so one can replace it.
pub fn halt_error_means_exited(message: &str) -> bool {
    message.ends_with("has exited with status 0")
}

/// A failed session start, carrying the error code the originating
/// request reports.
#[derive(Debug)]
pub struct StartError {
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for StartError {}

impl From<Box<dyn Error>> for StartError {
    fn from(e: Box<dyn Error>) -> StartError {
        StartError {
            code: ERR_START_SESSION,
            message: e.to_string(),
        }
    }
}

impl StartError {
    fn version(message: String) -> StartError {
        StartError {
            code: ERR_VERSION,
            message,
        }
    }

    fn general(message: String) -> StartError {
        StartError {
            code: ERR_START_SESSION,
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotConnected,
    Stopped,
    Running,
    Exited,
}

pub struct Handler {
    pub mode: SessionMode,
    pub api: Option<Arc<dyn Api>>,
    pub backend: Option<BackendProcess>,
    pub path_mapper: PathMapper,
    pub program_dir: PathBuf,
    pub breakpoints: BreakpointStore,
    pub frames: HandleArena<FrameRef>,
    pub variables: HandleArena<VariableEntry>,
    pub packages: PackageInfoCache,
    pub load_config: LoadConfig,
    pub stack_trace_depth: i64,
    pub show_globals: bool,
    pub stop_on_entry: bool,
    pub run_state: RunState,
    pub continue_epoch: u64,
    pub continue_in_flight: bool,
    pub skip_stop_event_once: bool,
    pub pending_stop_reason: Option<String>,
    pub dap: DapSender,
    events_tx: mpsc::Sender<SessionEvent>,
}

fn first_gopath_entry(env_value: Option<String>) -> Option<String> {
    let value = env_value?;
    std::env::split_paths(&value)
        .next()
        .map(|p| p.to_string_lossy().to_string())
}

/// Non-blocking state probe before an attach is considered successful: a
/// target that is already gone should fail the originating request, not a
/// later one.
fn probe_target(api: &dyn Api) -> Result<(), StartError> {
    match api.state(true) {
        Ok(state) if state.exited => Err(StartError::general(format!(
            "the target process has already exited with status {}",
            state.exit_status
        ))),
        Ok(_) => Ok(()),
        Err(e) => {
            warn!("pre-attach state probe failed: {e}");
            Ok(())
        }
    }
}

fn check_api_version(api: &dyn Api, selected: i64) -> Result<(), Box<dyn Error>> {
    let version = api.get_version().map_err(|e| format!("could not query the backend version: {e}"))?;
    info!(
        "backend version {} (api {})",
        version.backend_version, version.api_version
    );
    if version.api_version != selected {
        return Err(format!(
            "the backend speaks API version {}, but apiVersion is set to {selected}; \
             change the apiVersion attribute in the debug configuration",
            version.api_version
        )
        .into());
    }
    Ok(())
}

impl Handler {
    fn base(
        mode: SessionMode,
        api: Option<Arc<dyn Api>>,
        backend: Option<BackendProcess>,
        path_mapper: PathMapper,
        program_dir: PathBuf,
        load_config: LoadConfig,
        events_tx: mpsc::Sender<SessionEvent>,
        seq: i64,
    ) -> Handler {
        Handler {
            mode,
            api,
            backend,
            path_mapper,
            program_dir,
            breakpoints: BreakpointStore::new(),
            frames: HandleArena::new(),
            variables: HandleArena::new(),
            packages: PackageInfoCache::new(),
            load_config,
            stack_trace_depth: DEFAULT_STACK_TRACE_DEPTH,
            show_globals: false,
            stop_on_entry: false,
            run_state: RunState::NotConnected,
            continue_epoch: 0,
            continue_in_flight: false,
            skip_stop_event_once: false,
            pending_stop_reason: None,
            dap: DapSender::with_seq(seq),
            events_tx,
        }
    }

    /// Session constructor used directly by tests; `launch`/`attach` feed
    /// real transports through here.
    pub fn with_api(
        mode: SessionMode,
        api: Arc<dyn Api>,
        events_tx: mpsc::Sender<SessionEvent>,
        seq: i64,
    ) -> Handler {
        let mapper = PathMapper::new("", None, None, None);
        let mut handler = Handler::base(
            mode,
            Some(api),
            None,
            mapper,
            PathBuf::new(),
            LoadConfig::default(),
            events_tx,
            seq,
        );
        handler.run_state = RunState::Stopped;
        handler
    }

    pub fn launch(
        args: &LaunchArguments,
        events_tx: mpsc::Sender<SessionEvent>,
        seq: i64,
    ) -> Result<Handler, StartError> {
        let mode = config::resolve_launch_mode(args).map_err(StartError::from)?;
        if mode == SessionMode::AttachRemote {
            // `launch` with mode=remote behaves exactly like a remote attach
            return Handler::connect_remote(
                args.host.as_deref(),
                args.port,
                args.api_version.unwrap_or(2),
                args.program.as_deref(),
                args.remote_path.as_deref(),
                args.dlv_load_config.clone().unwrap_or_default(),
                args,
                events_tx,
                seq,
            );
        }
        let plan = launcher::plan_launch(&mode, args).map_err(StartError::from)?;
        let load_config = args.dlv_load_config.clone().unwrap_or_default();
        let program_dir = plan.cwd.clone();

        if mode == SessionMode::NoDebugRun {
            let backend =
                BackendProcess::spawn(&plan, events_tx.clone(), false).map_err(StartError::from)?;
            let mapper = PathMapper::new(&program_dir.to_string_lossy(), None, None, None);
            let mut handler = Handler::base(
                mode,
                None,
                Some(backend),
                mapper,
                program_dir,
                load_config,
                events_tx,
                seq,
            );
            handler.run_state = RunState::Running;
            handler.apply_launch_options(args);
            handler.dap.event_initialized();
            return Ok(handler);
        }

        let backend =
            BackendProcess::spawn(&plan, events_tx.clone(), true).map_err(StartError::from)?;
        let api_version = args.api_version.unwrap_or(2);
        let client = match RpcClient::connect(&plan.host, plan.port) {
            Ok(client) => client,
            Err(e) => {
                backend.kill_tree();
                backend.cleanup_artifact();
                return Err(StartError::general(format!(
                    "could not connect to the backend at {}:{}: {e}",
                    plan.host, plan.port
                )));
            }
        };
        let api = api::new_api(api_version, client, load_config.clone());
        if let Err(e) = check_api_version(api.as_ref(), api_version) {
            backend.kill_tree();
            backend.cleanup_artifact();
            return Err(StartError::version(e.to_string()));
        }

        let goroot = plan.env.get("GOROOT").cloned();
        let gopath = first_gopath_entry(plan.env.get("GOPATH").cloned());
        let mapper = PathMapper::new(
            &program_dir.to_string_lossy(),
            args.remote_path.as_deref(),
            goroot,
            gopath,
        );
        let mut handler = Handler::base(
            mode,
            Some(api),
            Some(backend),
            mapper,
            program_dir,
            load_config,
            events_tx,
            seq,
        );
        handler.run_state = RunState::Stopped;
        handler.apply_launch_options(args);
        handler.dap.event_initialized();
        Ok(handler)
    }

    fn apply_launch_options(&mut self, args: &LaunchArguments) {
        if let Some(depth) = args.stack_trace_depth {
            self.stack_trace_depth = depth;
        }
        self.show_globals = args.show_global_variables;
        self.stop_on_entry = args.stop_on_entry;
        match args.trace.as_deref() {
            Some("verbose") => log::set_max_level(log::LevelFilter::Debug),
            Some("log") => log::set_max_level(log::LevelFilter::Info),
            Some("error") => log::set_max_level(log::LevelFilter::Error),
            _ => {}
        }
    }

    pub fn attach(
        args: &AttachArguments,
        events_tx: mpsc::Sender<SessionEvent>,
        seq: i64,
    ) -> Result<Handler, StartError> {
        let mode = config::resolve_attach_mode(args).map_err(StartError::from)?;
        let api_version = args.api_version.unwrap_or(2);
        let load_config = args.dlv_load_config.clone().unwrap_or_default();
        match mode {
            SessionMode::AttachLocal { process_id } => {
                let host = args.host.clone().unwrap_or_else(|| launcher::DEFAULT_HOST.to_string());
                let port = args.port.unwrap_or_else(launcher::random_port);
                let plan = launcher::plan_attach(
                    process_id,
                    &host,
                    port,
                    api_version,
                    args.cwd.as_deref(),
                    args.show_log,
                    args.log_output.as_deref(),
                    args.backend.as_deref(),
                    args.dlv_tool_path.as_deref(),
                )
                .map_err(StartError::from)?;
                let backend = BackendProcess::spawn(&plan, events_tx.clone(), true)
                    .map_err(StartError::from)?;
                let client = match RpcClient::connect(&host, port) {
                    Ok(client) => client,
                    Err(e) => {
                        backend.kill_tree();
                        return Err(StartError::general(format!(
                            "could not connect to the backend at {host}:{port}: {e}"
                        )));
                    }
                };
                let api = api::new_api(api_version, client, load_config.clone());
                if let Err(e) = check_api_version(api.as_ref(), api_version) {
                    backend.kill_tree();
                    return Err(StartError::version(e.to_string()));
                }
                if let Err(e) = probe_target(api.as_ref()) {
                    backend.kill_tree();
                    return Err(e);
                }
                let cwd = args.cwd.clone().unwrap_or_else(|| ".".to_string());
                let mapper = PathMapper::new(&cwd, None, None, None);
                let mut handler = Handler::base(
                    mode,
                    Some(api),
                    Some(backend),
                    mapper,
                    PathBuf::from(cwd),
                    load_config,
                    events_tx,
                    seq,
                );
                handler.run_state = RunState::Stopped;
                handler.stack_trace_depth =
                    args.stack_trace_depth.unwrap_or(DEFAULT_STACK_TRACE_DEPTH);
                handler.show_globals = args.show_global_variables;
                handler.dap.event_initialized();
                Ok(handler)
            }
            SessionMode::AttachRemote => {
                let mut handler = Handler::connect_remote(
                    args.host.as_deref(),
                    args.port,
                    api_version,
                    args.cwd.as_deref(),
                    args.remote_path.as_deref(),
                    load_config,
                    &LaunchArguments::default(),
                    events_tx,
                    seq,
                )?;
                handler.stack_trace_depth =
                    args.stack_trace_depth.unwrap_or(DEFAULT_STACK_TRACE_DEPTH);
                handler.show_globals = args.show_global_variables;
                Ok(handler)
            }
            other => Err(StartError::general(format!(
                "attach cannot produce mode {other:?}"
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn connect_remote(
        host: Option<&str>,
        port: Option<u16>,
        api_version: i64,
        local_root: Option<&str>,
        remote_path: Option<&str>,
        load_config: LoadConfig,
        launch_args: &LaunchArguments,
        events_tx: mpsc::Sender<SessionEvent>,
        seq: i64,
    ) -> Result<Handler, StartError> {
        let host = host.unwrap_or(launcher::DEFAULT_HOST).to_string();
        let port = port.ok_or_else(|| {
            StartError::general("remote configuration is missing the `port` attribute".to_string())
        })?;
        // a too-eager connect can be rejected while the remote backend is
        // still binding its listener
        thread::sleep(REMOTE_CONNECT_GRACE);
        let client = RpcClient::connect(&host, port).map_err(|e| {
            StartError::general(format!("could not connect to the backend at {host}:{port}: {e}"))
        })?;
        let api = api::new_api(api_version, client, load_config.clone());
        check_api_version(api.as_ref(), api_version)
            .map_err(|e| StartError::version(e.to_string()))?;
        probe_target(api.as_ref())?;

        let local_root = local_root.unwrap_or(".").to_string();
        let goroot = std::env::var("GOROOT").ok();
        let gopath = first_gopath_entry(std::env::var("GOPATH").ok());
        let mapper = PathMapper::new(&local_root, remote_path, goroot, gopath);
        let mut handler = Handler::base(
            SessionMode::AttachRemote,
            Some(api),
            None,
            mapper,
            PathBuf::from(local_root),
            load_config,
            events_tx,
            seq,
        );
        handler.run_state = RunState::Stopped;
        handler.apply_launch_options(launch_args);
        handler.dap.event_initialized();
        Ok(handler)
    }

    fn api(&self) -> Result<Arc<dyn Api>, Box<dyn Error>> {
        self.api
            .as_ref()
            .cloned()
            .ok_or_else(|| "no backend connection in this session".into())
    }

    /// Both handle tables are invalidated together on every re-entry to the
    /// stopped state, before any stop event leaves the session.
    fn reset_handles(&mut self) {
        self.frames.reset();
        self.variables.reset();
    }

    fn current_goroutine_id(&self, state: &DebuggerState) -> i64 {
        state
            .current_goroutine
            .as_ref()
            .map(|g| g.id)
            .unwrap_or(DUMMY_THREAD_ID)
    }

    /// Snapshot the current goroutine's stack into the error log; the
    /// message `bad access` stands for a nil-pointer SIGSEGV the backend
    /// cannot propagate (go-delve/delve#852).
    fn log_backend_error(&self, context: &str, message: &str) {
        if message == "bad access" {
            error!(
                "{context}: runtime error: invalid memory address or nil pointer dereference \
                 [signal SIGSEGV: segmentation violation] (see go-delve/delve#852)"
            );
        } else {
            error!("{context}: {message}");
        }
        if let Ok(api) = self.api() {
            match api.stacktrace(-1, self.stack_trace_depth) {
                Ok(locations) => {
                    for (index, location) in locations.iter().enumerate() {
                        let function = location
                            .function
                            .as_ref()
                            .map(|f| f.name.as_str())
                            .unwrap_or("<unknown>");
                        error!("  #{index} {function} {}:{}", location.file, location.line);
                    }
                }
                Err(e) => warn!("could not snapshot stack for error log: {e}"),
            }
        }
    }

    /// Issue `continue` on its own thread; the completion comes back as a
    /// session event carrying the epoch captured here.
    fn start_continue(&mut self) -> Result<(), Box<dyn Error>> {
        let api = self.api()?;
        self.continue_epoch += 1;
        self.continue_in_flight = true;
        self.run_state = RunState::Running;
        let epoch = self.continue_epoch;
        let events = self.events_tx.clone();
        thread::spawn(move || {
            let result = api.command("continue");
            let _ = events.send(SessionEvent::ContinueDone { epoch, result });
        });
        Ok(())
    }

    /// A `continue` completed. Only the completion matching the current
    /// epoch clears the in-flight flag; a stale one must not unmask a newer
    /// continue.
    pub fn on_continue_done(
        &mut self,
        epoch: u64,
        result: Result<DebuggerState, RpcError>,
    ) -> Result<(), Box<dyn Error>> {
        if epoch == self.continue_epoch {
            self.continue_in_flight = false;
        }
        match result {
            Ok(state) if state.exited => {
                self.run_state = RunState::Exited;
                self.dap.event_terminated();
            }
            Ok(state) => {
                self.run_state = RunState::Stopped;
                if self.skip_stop_event_once {
                    // the synthetic stop a halt-edit-resume produced
                    self.skip_stop_event_once = false;
                    return Ok(());
                }
                let reason = self
                    .pending_stop_reason
                    .take()
                    .unwrap_or_else(|| "breakpoint".to_string());
                let goroutine_id = self.current_goroutine_id(&state);
                self.reset_handles();
                self.dap.event_stopped(&reason, goroutine_id);
            }
            Err(e) => {
                let message = e.to_string();
                if halt_error_means_exited(&message) {
                    self.run_state = RunState::Exited;
                    self.dap.event_terminated();
                } else {
                    self.log_backend_error("continue failed", &message);
                }
            }
        }
        Ok(())
    }

    pub fn on_output(&mut self, category: &str, chunk: &str) {
        self.dap.event_output(category, chunk);
    }

    pub fn on_backend_exited(&mut self, code: Option<i32>) {
        info!("backend process exited with code {code:?}");
        let was_exited = self.run_state == RunState::Exited;
        self.run_state = RunState::Exited;
        match self.mode {
            SessionMode::NoDebugRun => {
                if let Some(code) = code {
                    self.dap
                        .event_output("console", &format!("Process exiting with code: {code}\n"));
                }
                self.dap.event_terminated();
            }
            _ => {
                if code.unwrap_or(0) != 0 && !was_exited {
                    self.dap.event_terminated();
                }
            }
        }
    }

    pub fn configuration_done(&mut self, request: Request) -> Result<(), Box<dyn Error>> {
        self.dap.respond(&request, json!({}));
        if self.mode == SessionMode::NoDebugRun {
            return Ok(());
        }
        if self.stop_on_entry {
            self.reset_handles();
            self.dap.event_stopped("entry", DUMMY_THREAD_ID);
            return Ok(());
        }
        self.start_continue()
    }

    pub fn continue_request(
        &mut self,
        request: Request,
        _args: dap_types::ContinueArguments,
    ) -> Result<(), Box<dyn Error>> {
        self.start_continue()?;
        self.dap.respond(
            &request,
            json!(dap_types::ContinueResponseBody {
                all_threads_continued: Some(true),
            }),
        );
        Ok(())
    }

    /// next / stepIn / stepOut: synchronous on the backend, the target is
    /// stopped again when the command returns.
    pub fn step(&mut self, request: Request, command: &str) -> Result<(), Box<dyn Error>> {
        let api = self.api()?;
        match api.command(command) {
            Ok(state) if state.exited => {
                self.run_state = RunState::Exited;
                self.dap.respond(&request, json!({}));
                self.dap.event_terminated();
            }
            Ok(state) => {
                self.run_state = RunState::Stopped;
                let goroutine_id = self.current_goroutine_id(&state);
                self.reset_handles();
                self.dap.respond(&request, json!({}));
                self.dap.event_stopped("step", goroutine_id);
            }
            Err(e) => {
                self.log_backend_error(&format!("{command} failed"), &e.to_string());
                self.dap.respond(&request, json!({}));
            }
        }
        Ok(())
    }

    pub fn pause(
        &mut self,
        request: Request,
        _args: dap_types::PauseArguments,
    ) -> Result<(), Box<dyn Error>> {
        let api = match self.api() {
            Ok(api) => api,
            Err(e) => {
                self.dap
                    .respond_error(&request, ERR_SET_OR_PAUSE, &format!("Unable to halt execution: {e}"));
                return Ok(());
            }
        };
        // the stop surfaces through the in-flight continue completion
        if self.continue_in_flight {
            self.pending_stop_reason = Some("pause".to_string());
        }
        match api.command("halt") {
            Ok(_) => self.dap.respond(&request, json!({})),
            Err(e) => {
                self.pending_stop_reason = None;
                self.dap.respond_error(
                    &request,
                    ERR_SET_OR_PAUSE,
                    &format!("Unable to halt execution: {e}"),
                );
            }
        }
        Ok(())
    }

    pub fn threads(&mut self, request: Request) -> Result<(), Box<dyn Error>> {
        // a synchronous goroutine listing would block behind the running
        // target; answer synthetically instead
        if self.continue_in_flight || self.api.is_none() {
            self.dap.respond(
                &request,
                json!(dap_types::ThreadsResponseBody {
                    threads: vec![dap_types::Thread {
                        id: DUMMY_THREAD_ID,
                        name: DUMMY_THREAD_NAME.to_string(),
                    }],
                }),
            );
            return Ok(());
        }
        let api = self.api()?;
        match api.list_goroutines(None) {
            Ok(goroutines) => {
                let threads: Vec<dap_types::Thread> = if goroutines.is_empty() {
                    vec![dap_types::Thread {
                        id: DUMMY_THREAD_ID,
                        name: DUMMY_THREAD_NAME.to_string(),
                    }]
                } else {
                    goroutines
                        .iter()
                        .map(|g| {
                            let name = g
                                .user_current_loc
                                .function
                                .as_ref()
                                .map(|f| f.name.clone())
                                .unwrap_or_else(|| {
                                    format!(
                                        "{}@{}",
                                        g.user_current_loc.file, g.user_current_loc.line
                                    )
                                });
                            dap_types::Thread { id: g.id, name }
                        })
                        .collect()
                };
                self.dap
                    .respond(&request, json!(dap_types::ThreadsResponseBody { threads }));
            }
            Err(e) => {
                self.log_backend_error("threads failed", &e.to_string());
                self.dap.respond_error(
                    &request,
                    ERR_THREADS,
                    &format!("Unable to display threads: {e}"),
                );
            }
        }
        Ok(())
    }

    pub fn stack_trace(
        &mut self,
        request: Request,
        args: dap_types::StackTraceArguments,
    ) -> Result<(), Box<dyn Error>> {
        let api = self.api()?;
        let locations = match api.stacktrace(args.thread_id, self.stack_trace_depth) {
            Ok(locations) => locations,
            Err(e) => {
                self.log_backend_error("stackTrace failed", &e.to_string());
                self.dap.respond_error(
                    &request,
                    ERR_STACKTRACE,
                    &format!("Unable to produce stack trace: {e}"),
                );
                return Ok(());
            }
        };
        let total = locations.len() as i64;
        let start = args.start_frame.unwrap_or(0).max(0);
        let levels = match args.levels {
            Some(0) | None => total,
            Some(levels) => levels,
        };
        let mut stack_frames = vec![];
        for (offset, location) in locations
            .iter()
            .skip(start as usize)
            .take(levels.max(0) as usize)
            .enumerate()
        {
            let frame_index = start + offset as i64;
            let id = self.frames.insert(FrameRef {
                goroutine_id: args.thread_id,
                frame_index,
            });
            let name = location
                .function
                .as_ref()
                .map(|f| f.name.clone())
                .unwrap_or_else(|| "<unknown>".to_string());
            let local_path = self.path_mapper.to_local(&location.file);
            stack_frames.push(dap_types::StackFrame {
                id,
                name,
                source: Some(dap_types::Source {
                    name: Path::new(&local_path)
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string()),
                    path: Some(local_path),
                    source_reference: None,
                }),
                line: location.line,
                column: 0,
            });
        }
        self.dap.respond(
            &request,
            json!(dap_types::StackTraceResponseBody {
                stack_frames,
                total_frames: Some(total),
            }),
        );
        Ok(())
    }

    pub fn scopes(
        &mut self,
        request: Request,
        args: dap_types::ScopesArguments,
    ) -> Result<(), Box<dyn Error>> {
        let api = self.api()?;
        let frame = match self.frames.get(args.frame_id) {
            Ok(frame) => *frame,
            Err(e) => {
                self.dap.respond_error(
                    &request,
                    ERR_LOCALS,
                    &format!("Unable to list locals: {e}"),
                );
                return Ok(());
            }
        };
        let scope = EvalScope {
            goroutine_id: frame.goroutine_id,
            frame: frame.frame_index,
        };
        let locals = match api.list_local_vars(&scope) {
            Ok(locals) => locals,
            Err(e) => {
                self.log_backend_error("scopes failed", &e.to_string());
                self.dap.respond_error(
                    &request,
                    ERR_LOCALS,
                    &format!("Unable to list locals: {e}"),
                );
                return Ok(());
            }
        };
        let function_args = match api.list_function_args(&scope) {
            Ok(function_args) => function_args,
            Err(e) => {
                self.log_backend_error("scopes failed", &e.to_string());
                self.dap
                    .respond_error(&request, ERR_ARGS, &format!("Unable to list args: {e}"));
                return Ok(());
            }
        };

        // invariant: arguments first, then locals
        let mut combined = function_args;
        combined.extend(locals);
        for variable in combined.iter_mut() {
            variable.fully_qualified_name = variable.name.clone();
        }
        variables::apply_shadow_naming(&mut combined);

        let local_reference = self.variables.insert(VariableEntry {
            scope,
            variable: variables::scope_variable("Local", combined),
        });
        let mut scopes = vec![dap_types::Scope {
            name: "Local".to_string(),
            variables_reference: local_reference,
            expensive: false,
        }];

        if self.show_globals {
            match self.load_globals(api.as_ref(), scope) {
                Ok(Some(reference)) => scopes.push(dap_types::Scope {
                    name: "Global".to_string(),
                    variables_reference: reference,
                    expensive: false,
                }),
                Ok(None) => {}
                Err(e) => {
                    self.dap.respond_error(
                        &request,
                        ERR_GLOBALS,
                        &format!("Unable to list global vars: {e}"),
                    );
                    return Ok(());
                }
            }
        }

        self.dap
            .respond(&request, json!(dap_types::ScopesResponseBody { scopes }));
        Ok(())
    }

    /// Globals are opt-in: resolve the package for the program directory
    /// (cached), list its package vars and strip the package prefix. A
    /// failing `go list` silently omits the scope.
    fn load_globals(
        &mut self,
        api: &dyn Api,
        scope: EvalScope,
    ) -> Result<Option<i64>, Box<dyn Error>> {
        let program_dir = self.program_dir.clone();
        let info = match self.packages.for_dir(&program_dir) {
            Some(info) => info,
            None => return Ok(None),
        };
        let filter = format!("^{}\\.", regex::escape(&info.name));
        let mut globals = api
            .list_package_vars(&filter)
            .map_err(|e| Box::<dyn Error>::from(e.to_string()))?;
        let prefix = format!("{}.", info.name);
        globals.retain(|g| {
            g.name
                .strip_prefix(&prefix)
                .map(|stripped| stripped != INITDONE_NAME)
                .unwrap_or(true)
        });
        for global in globals.iter_mut() {
            global.fully_qualified_name = global.name.clone();
            let stripped = global.name.strip_prefix(&prefix).map(str::to_string);
            if let Some(stripped) = stripped {
                global.name = stripped;
            }
        }
        let reference = self.variables.insert(VariableEntry {
            scope,
            variable: variables::scope_variable("Global", globals),
        });
        Ok(Some(reference))
    }

    pub fn variables(
        &mut self,
        request: Request,
        args: dap_types::VariablesArguments,
    ) -> Result<(), Box<dyn Error>> {
        let api = self.api()?;
        let entry = match self.variables.get(args.variables_reference) {
            Ok(entry) => entry.clone(),
            Err(e) => {
                self.dap.respond_error(
                    &request,
                    ERR_LOCALS,
                    &format!("Unable to lookup variables: {e}"),
                );
                return Ok(());
            }
        };
        match variables::children(api.as_ref(), &mut self.variables, entry.scope, &entry.variable)
        {
            Ok(rendered) => self.dap.respond(
                &request,
                json!(dap_types::VariablesResponseBody {
                    variables: rendered,
                }),
            ),
            Err(e) => {
                self.log_backend_error("variables failed", &e.to_string());
                self.dap.respond_error(
                    &request,
                    ERR_LOCALS,
                    &format!("Unable to lookup variables: {e}"),
                );
            }
        }
        Ok(())
    }

    pub fn evaluate(
        &mut self,
        request: Request,
        args: dap_types::EvaluateArguments,
    ) -> Result<(), Box<dyn Error>> {
        let api = self.api()?;
        let scope = match args.frame_id {
            Some(frame_id) => match self.frames.get(frame_id) {
                Ok(frame) => EvalScope {
                    goroutine_id: frame.goroutine_id,
                    frame: frame.frame_index,
                },
                Err(e) => {
                    self.dap.respond_error(
                        &request,
                        ERR_EVALUATE,
                        &format!("Unable to eval expression: {e}"),
                    );
                    return Ok(());
                }
            },
            None => EvalScope {
                goroutine_id: -1,
                frame: 0,
            },
        };
        match api.eval(&scope, &args.expression) {
            Ok(mut variable) => {
                variable.fully_qualified_name = args.expression.clone();
                let (result, reference) =
                    variables::convert_variable(&mut self.variables, scope, &variable);
                self.dap.respond(
                    &request,
                    json!(dap_types::EvaluateResponseBody {
                        result,
                        r#type: Some(variable.type_name.clone()),
                        variables_reference: reference,
                    }),
                );
            }
            Err(e) => {
                self.log_backend_error("evaluate failed", &e.to_string());
                self.dap.respond_error(
                    &request,
                    ERR_EVALUATE,
                    &format!("Unable to eval expression: {e}"),
                );
            }
        }
        Ok(())
    }

    pub fn set_variable(
        &mut self,
        request: Request,
        args: dap_types::SetVariableArguments,
    ) -> Result<(), Box<dyn Error>> {
        let api = self.api()?;
        let entry = match self.variables.get(args.variables_reference) {
            Ok(entry) => entry.clone(),
            Err(e) => {
                self.dap.respond_error(
                    &request,
                    ERR_SET_OR_PAUSE,
                    &format!("Unable to set variable: {e}"),
                );
                return Ok(());
            }
        };
        let symbol = symbol_for_child(&entry.variable, &args.name);
        if let Err(e) = api.set_symbol(&entry.scope, &symbol, &args.value) {
            self.log_backend_error("setVariable failed", &e.to_string());
            self.dap.respond_error(
                &request,
                ERR_SET_OR_PAUSE,
                &format!("Unable to set variable: {e}"),
            );
            return Ok(());
        }
        // re-read so the client shows what the backend actually stored
        let (value, reference) = match api.eval(&entry.scope, &symbol) {
            Ok(mut variable) => {
                variable.fully_qualified_name = symbol.clone();
                variables::convert_variable(&mut self.variables, entry.scope, &variable)
            }
            Err(_) => (args.value.clone(), 0),
        };
        self.dap.respond(
            &request,
            json!(dap_types::SetVariableResponseBody {
                value,
                r#type: None,
                variables_reference: Some(reference),
            }),
        );
        Ok(())
    }

    pub fn set_breakpoints(
        &mut self,
        request: Request,
        args: dap_types::SetBreakpointsArguments,
    ) -> Result<(), Box<dyn Error>> {
        let source_path = match &args.source.path {
            Some(path) => normalize_path(path),
            None => {
                self.dap.respond_error(
                    &request,
                    ERR_HALT_FOR_BREAKPOINTS,
                    "Unable to set breakpoints: the source has no path",
                );
                return Ok(());
            }
        };
        let requested = args.breakpoints.clone().unwrap_or_else(|| {
            args.lines
                .clone()
                .unwrap_or_default()
                .into_iter()
                .map(|line| dap_types::SourceBreakpoint {
                    line,
                    ..Default::default()
                })
                .collect()
        });

        let api = match self.api() {
            Ok(api) => api,
            Err(_) => {
                // no backend (no-debug run): report everything unverified
                let breakpoints = requested
                    .iter()
                    .map(|bp| dap_types::Breakpoint {
                        verified: false,
                        line: Some(bp.line),
                        ..Default::default()
                    })
                    .collect();
                self.dap.respond(
                    &request,
                    json!(dap_types::SetBreakpointsResponseBody { breakpoints }),
                );
                return Ok(());
            }
        };

        // edits while the target runs: halt, reconcile, resume; the stop
        // the halt produces must not reach the client
        let was_running = self.continue_in_flight;
        if was_running {
            self.skip_stop_event_once = true;
            if let Err(e) = api.command("halt") {
                self.skip_stop_event_once = false;
                self.dap.respond_error(
                    &request,
                    ERR_HALT_FOR_BREAKPOINTS,
                    &format!("Unable to halt execution so breakpoints can be set: {e}"),
                );
                return Ok(());
            }
        }

        let remote_path = self.path_mapper.to_debugger(&source_path);
        let load_config = self.load_config.clone();
        let breakpoints = self.breakpoints.reconcile(
            api.as_ref(),
            &source_path,
            &remote_path,
            &requested,
            &load_config,
        )?;

        if was_running {
            self.start_continue()?;
        }
        self.dap.respond(
            &request,
            json!(dap_types::SetBreakpointsResponseBody { breakpoints }),
        );
        Ok(())
    }

    /// Tri-modal teardown: remote sessions only close the socket; no-debug
    /// runs only stop the child; local sessions halt with a watchdog and
    /// detach, escalating to a forced kill.
    pub fn disconnect(
        &mut self,
        request: Request,
        _args: dap_types::DisconnectArguments,
    ) -> Result<(), Box<dyn Error>> {
        match &self.mode {
            SessionMode::AttachRemote => {
                if let Some(api) = &self.api {
                    api.close();
                }
                self.dap.respond(&request, json!({}));
            }
            SessionMode::NoDebugRun => {
                if let Some(backend) = &self.backend {
                    backend.kill_tree();
                }
                self.dap.respond(&request, json!({}));
            }
            _ => {
                self.disconnect_local();
                self.dap.respond(&request, json!({}));
            }
        }
        Ok(())
    }

    fn disconnect_local(&mut self) {
        let api = match self.api() {
            Ok(api) => api,
            Err(_) => return,
        };
        let (halt_tx, halt_rx) = mpsc::channel();
        let halt_api = Arc::clone(&api);
        thread::spawn(move || {
            let _ = halt_tx.send(halt_api.command("halt"));
        });
        let halt_result = match halt_rx.recv_timeout(DISCONNECT_HALT_TIMEOUT) {
            Ok(result) => result,
            Err(_) => {
                warn!("halt did not complete within the disconnect watchdog");
                self.force_cleanup();
                return;
            }
        };
        if let Err(e) = &halt_result {
            let message = e.to_string();
            if halt_error_means_exited(&message) {
                info!("target already exited, skipping detach");
                return;
            }
            warn!("halt on disconnect failed: {message}");
        }
        let kill = !self.mode.is_remote();
        if let Err(e) = api.detach(kill) {
            warn!("detach failed: {e}");
            self.force_cleanup();
        }
    }

    fn force_cleanup(&mut self) {
        if let Some(backend) = &self.backend {
            backend.kill_tree();
            backend.cleanup_artifact();
        }
    }
}

/// Reconstruct the backend expression for a child picked by its displayed
/// name: struct fields dot in, indexed children (`[0]`, rendered map keys)
/// bracket in.
fn symbol_for_child(parent: &api::DebugVariable, child_name: &str) -> String {
    let parent_fqn = &parent.fully_qualified_name;
    if parent_fqn.is_empty() {
        return child_name.to_string();
    }
    if child_name.starts_with('[') {
        format!("{parent_fqn}{child_name}")
    } else if parent.kind == api::kind::MAP {
        format!("{parent_fqn}[{child_name}]")
    } else {
        format!("{parent_fqn}.{child_name}")
    }
}
