//! Owns the backend child process: locates the binary, builds the argv for
//! the chosen mode, spawns it, watches its stdio and exit.
//!
//! Readiness of a spawned backend is defined as the first byte observed on
//! its stdout; only then is the control connection attempted. Remote
//! sessions spawn nothing.

use crate::config::{self, LaunchArguments, SessionMode};
use crate::events::SessionEvent;
use log::{info, warn};
use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::process::CommandExt;

pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default listen port: uniform in [2000, 50000).
pub fn random_port() -> u16 {
    2000 + (rand::random::<u32>() % 48_000) as u16
}

/// Resolve the backend binary: explicit tool path, then PATH, then
/// GOPATH/bin. Failure names the misconfiguration.
pub fn find_backend_binary(
    tool_path: Option<&str>,
    env: &HashMap<String, String>,
) -> Result<PathBuf, Box<dyn Error>> {
    if let Some(p) = tool_path {
        let candidate = PathBuf::from(p);
        if candidate.is_file() {
            return Ok(candidate);
        }
        return Err(format!(
            "cannot find the backend binary at {p}; check the dlvToolPath attribute"
        )
        .into());
    }
    if let Some(path_var) = env.get("PATH") {
        for dir in std::env::split_paths(path_var) {
            let candidate = dir.join("dlv");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    if let Some(gopath) = env.get("GOPATH") {
        for entry in std::env::split_paths(gopath) {
            let candidate = entry.join("bin").join("dlv");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err("cannot find the `dlv` backend binary in PATH or GOPATH/bin; \
         install it or set the dlvToolPath attribute"
        .into())
}

/// Find the workspace root for GOPATH-style layouts: the prefix before the
/// last `src` component of the program directory.
pub fn infer_gopath(program_dir: &Path) -> Option<PathBuf> {
    let src = std::ffi::OsStr::new("src");
    let mut last_src_parent: Option<PathBuf> = None;
    let mut current = PathBuf::new();
    for component in program_dir.components() {
        if component.as_os_str() == src && !current.as_os_str().is_empty() {
            last_src_parent = Some(current.clone());
        }
        current.push(component);
    }
    last_src_parent
}

/// Everything needed to start one child process for this session.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub binary: PathBuf,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub host: String,
    pub port: u16,
    /// Built binary to unlink on forced teardown (debug/test modes).
    pub artifact: Option<PathBuf>,
}

fn push_common_backend_flags(
    argv: &mut Vec<String>,
    host: &str,
    port: u16,
    api_version: i64,
    show_log: bool,
    log_output: Option<&str>,
    backend: Option<&str>,
) {
    argv.push("--headless=true".to_string());
    argv.push(format!("--listen={host}:{port}"));
    argv.push(format!("--api-version={api_version}"));
    if show_log {
        argv.push("--log".to_string());
    }
    if let Some(output) = log_output {
        argv.push(format!("--log-output={output}"));
    }
    if let Some(backend) = backend {
        argv.push(format!("--backend={backend}"));
    }
}

/// Program/cwd validation shared by debug, test and no-debug runs.
fn resolve_program(program: &str) -> Result<(String, PathBuf), Box<dyn Error>> {
    let path = Path::new(program);
    let metadata = fs::metadata(path)
        .map_err(|_| format!("cannot find the program to debug: {program}"))?;
    if metadata.is_dir() {
        return Ok((".".to_string(), path.to_path_buf()));
    }
    if path.extension().and_then(|e| e.to_str()) != Some("go") {
        return Err(format!(
            "the program attribute must be a directory or a .go file in debug mode, got: {program}"
        )
        .into());
    }
    let cwd = path
        .parent()
        .map(Path::to_path_buf)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((program.to_string(), cwd))
}

pub fn plan_launch(
    mode: &SessionMode,
    args: &LaunchArguments,
) -> Result<LaunchPlan, Box<dyn Error>> {
    let env = config::composed_environment(args.env_file.as_ref(), &args.env)?;
    let program = args
        .program
        .as_deref()
        .ok_or("launch configuration is missing the `program` attribute")?;
    let host = args.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = args.port.unwrap_or_else(random_port);
    let api_version = args.api_version.unwrap_or(2);

    if *mode == SessionMode::NoDebugRun {
        let (program_arg, program_cwd) = resolve_program(program)?;
        let cwd = args.cwd.clone().map(PathBuf::from).unwrap_or(program_cwd);
        let mut argv = vec!["run".to_string(), program_arg];
        argv.extend(args.args.iter().cloned());
        return Ok(LaunchPlan {
            binary: PathBuf::from("go"),
            argv,
            cwd,
            env,
            host,
            port,
            artifact: None,
        });
    }

    let (mut program_arg, cwd) = match mode {
        SessionMode::Debug | SessionMode::Test => resolve_program(program)?,
        SessionMode::Exec => {
            let metadata = fs::metadata(program)
                .map_err(|_| format!("cannot find the program to exec: {program}"))?;
            if !metadata.is_file() {
                return Err(format!(
                    "the program attribute must be an executable file in exec mode, got: {program}"
                )
                .into());
            }
            let cwd = Path::new(program)
                .parent()
                .map(Path::to_path_buf)
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from("."));
            (program.to_string(), cwd)
        }
        other => return Err(format!("plan_launch called for mode {other:?}").into()),
    };

    // GOPATH workspace without module mapping: the backend wants the
    // package import path, not the directory
    if matches!(mode, SessionMode::Debug | SessionMode::Test)
        && args.package_path_to_go_mod_path_map.is_empty()
        && program_arg == "."
    {
        let workspace = env
            .get("GOPATH")
            .map(PathBuf::from)
            .or_else(|| infer_gopath(&cwd));
        if let Some(workspace) = workspace {
            let src_root = workspace.join("src");
            if let Ok(package) = cwd.strip_prefix(&src_root) {
                let package = package.to_string_lossy().replace('\\', "/");
                if !package.is_empty() {
                    program_arg = package;
                }
            }
        }
    }

    let subcommand = mode
        .backend_subcommand()
        .ok_or("mode does not spawn a backend")?;
    let mut argv = vec![subcommand.to_string(), program_arg];
    push_common_backend_flags(
        &mut argv,
        &host,
        port,
        api_version,
        args.show_log,
        args.log_output.as_deref(),
        args.backend.as_deref(),
    );
    if let Some(build_flags) = &args.build_flags {
        argv.push(format!("--build-flags={build_flags}"));
    }
    if let Some(init) = &args.init {
        argv.push(format!("--init={init}"));
    }
    if let Some(output) = &args.output {
        argv.push(format!("--output={output}"));
    }
    if let Some(wd) = &args.cwd {
        argv.push(format!("--wd={wd}"));
    }
    if !args.args.is_empty() {
        argv.push("--".to_string());
        argv.extend(args.args.iter().cloned());
    }

    let artifact = if matches!(mode, SessionMode::Debug | SessionMode::Test) {
        let output = args.output.as_deref().unwrap_or("debug");
        let path = Path::new(output);
        Some(if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        })
    } else {
        None
    };

    let binary = find_backend_binary(args.dlv_tool_path.as_deref(), &env)?;
    Ok(LaunchPlan {
        binary,
        argv,
        cwd,
        env,
        host,
        port,
        artifact,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn plan_attach(
    process_id: i64,
    host: &str,
    port: u16,
    api_version: i64,
    cwd: Option<&str>,
    show_log: bool,
    log_output: Option<&str>,
    backend: Option<&str>,
    tool_path: Option<&str>,
) -> Result<LaunchPlan, Box<dyn Error>> {
    let env: HashMap<String, String> = std::env::vars().collect();
    let mut argv = vec!["attach".to_string(), process_id.to_string()];
    push_common_backend_flags(
        &mut argv,
        host,
        port,
        api_version,
        show_log,
        log_output,
        backend,
    );
    let binary = find_backend_binary(tool_path, &env)?;
    Ok(LaunchPlan {
        binary,
        argv,
        cwd: cwd.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
        env,
        host: host.to_string(),
        port,
        artifact: None,
    })
}

/// A spawned backend (or `go run`) child with its stdio bridged into the
/// session event channel.
pub struct BackendProcess {
    child: Arc<Mutex<Child>>,
    pub pid: u32,
    pub artifact: Option<PathBuf>,
}

impl BackendProcess {
    /// Spawn the planned child. With `wait_ready`, block until the first
    /// stdout byte (or fail if the process dies first).
    pub fn spawn(
        plan: &LaunchPlan,
        events: mpsc::Sender<SessionEvent>,
        wait_ready: bool,
    ) -> Result<BackendProcess, Box<dyn Error>> {
        info!(
            "spawning {} {:?} in {}",
            plan.binary.display(),
            plan.argv,
            plan.cwd.display()
        );
        let mut command = Command::new(&plan.binary);
        command
            .args(&plan.argv)
            .current_dir(&plan.cwd)
            .env_clear()
            .envs(&plan.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn().map_err(|e| {
            format!(
                "cannot start the backend process {}: {e}",
                plan.binary.display()
            )
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or("backend process has no captured stdout")?;
        let stderr = child
            .stderr
            .take()
            .ok_or("backend process has no captured stderr")?;
        let child = Arc::new(Mutex::new(child));

        let (ready_tx, ready_rx) = mpsc::channel();
        let stdout_events = events.clone();
        let child_for_exit = Arc::clone(&child);
        thread::spawn(move || forward_stdout(stdout, stdout_events, ready_tx, child_for_exit));
        let stderr_events = events;
        thread::spawn(move || forward_stream(stderr, "stderr", stderr_events));

        if wait_ready && ready_rx.recv().is_err() {
            let code = child
                .lock()
                .ok()
                .and_then(|mut c| c.try_wait().ok().flatten())
                .and_then(|status| status.code());
            return Err(format!(
                "the backend process exited before becoming ready (exit code {code:?})"
            )
            .into());
        }

        Ok(BackendProcess {
            child,
            pid,
            artifact: plan.artifact.clone(),
        })
    }

    /// Forced teardown: kill the whole process group, then reap.
    pub fn kill_tree(&self) {
        info!("killing backend process tree (pid {})", self.pid);
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
        }
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.try_wait();
        }
    }

    /// Best-effort removal of the built binary; never blocks teardown.
    pub fn cleanup_artifact(&self) {
        if let Some(artifact) = &self.artifact {
            match fs::remove_file(artifact) {
                Ok(()) => info!("removed build artifact {}", artifact.display()),
                Err(e) => warn!("could not remove build artifact {}: {e}", artifact.display()),
            }
        }
    }
}

fn forward_stdout(
    mut stdout: impl Read,
    events: mpsc::Sender<SessionEvent>,
    ready_tx: mpsc::Sender<()>,
    child: Arc<Mutex<Child>>,
) {
    let mut first = [0u8; 1];
    match stdout.read(&mut first) {
        Ok(0) | Err(_) => {}
        Ok(_) => {
            let _ = ready_tx.send(());
            let _ = events.send(SessionEvent::Output {
                category: "stdout",
                chunk: String::from_utf8_lossy(&first).to_string(),
            });
            let mut buffer = [0u8; 4096];
            loop {
                match stdout.read(&mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let _ = events.send(SessionEvent::Output {
                            category: "stdout",
                            chunk: String::from_utf8_lossy(&buffer[..n]).to_string(),
                        });
                    }
                }
            }
        }
    }
    drop(ready_tx);
    // stdout closed: reap the child for its exit code
    let mut code = None;
    for _ in 0..20 {
        if let Ok(mut locked) = child.lock() {
            match locked.try_wait() {
                Ok(Some(status)) => {
                    code = status.code();
                    break;
                }
                Ok(None) => {}
                Err(_) => break,
            }
        }
        thread::sleep(Duration::from_millis(50));
    }
    let _ = events.send(SessionEvent::BackendExited { code });
}

fn forward_stream(mut stream: impl Read, category: &'static str, events: mpsc::Sender<SessionEvent>) {
    let mut buffer = [0u8; 4096];
    loop {
        match stream.read(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let _ = events.send(SessionEvent::Output {
                    category,
                    chunk: String::from_utf8_lossy(&buffer[..n]).to_string(),
                });
            }
        }
    }
}
