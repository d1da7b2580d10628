//! Launch/attach configuration: the argument shapes the client sends,
//! the session mode they resolve to, and the variable load bounds passed
//! to the backend.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

/// How much of a value the backend returns in one variable-reading call.
/// Constant for the session unless overridden in launch arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadConfig {
    #[serde(rename = "followPointers")]
    pub follow_pointers: bool,
    #[serde(rename = "maxVariableRecurse")]
    pub max_variable_recurse: i64,
    #[serde(rename = "maxStringLen")]
    pub max_string_len: i64,
    #[serde(rename = "maxArrayValues")]
    pub max_array_values: i64,
    #[serde(rename = "maxStructFields")]
    pub max_struct_fields: i64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        LoadConfig {
            follow_pointers: true,
            max_variable_recurse: 1,
            max_string_len: 64,
            max_array_values: 64,
            max_struct_fields: -1,
        }
    }
}

pub const DEFAULT_STACK_TRACE_DEPTH: i64 = 50;

/// `envFile` accepts a single path or a list; later files override earlier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EnvFileSetting {
    One(String),
    Many(Vec<String>),
}

impl EnvFileSetting {
    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            EnvFileSetting::One(p) => vec![PathBuf::from(p)],
            EnvFileSetting::Many(ps) => ps.iter().map(PathBuf::from).collect(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchArguments {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(rename = "envFile", skip_serializing_if = "Option::is_none")]
    pub env_file: Option<EnvFileSetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(rename = "buildFlags", skip_serializing_if = "Option::is_none")]
    pub build_flags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(rename = "noDebug", default)]
    pub no_debug: bool,
    #[serde(rename = "stopOnEntry", default)]
    pub stop_on_entry: bool,
    #[serde(rename = "showLog", default)]
    pub show_log: bool,
    #[serde(rename = "logOutput", skip_serializing_if = "Option::is_none")]
    pub log_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(rename = "remotePath", skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
    #[serde(rename = "dlvToolPath", skip_serializing_if = "Option::is_none")]
    pub dlv_tool_path: Option<String>,
    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<i64>,
    #[serde(rename = "stackTraceDepth", skip_serializing_if = "Option::is_none")]
    pub stack_trace_depth: Option<i64>,
    #[serde(rename = "dlvLoadConfig", skip_serializing_if = "Option::is_none")]
    pub dlv_load_config: Option<LoadConfig>,
    #[serde(rename = "showGlobalVariables", default)]
    pub show_global_variables: bool,
    #[serde(rename = "packagePathToGoModPathMap", default)]
    pub package_path_to_go_mod_path_map: HashMap<String, String>,
    #[serde(rename = "__restart", skip_serializing_if = "Option::is_none")]
    pub restart: Option<serde_json::Value>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachArguments {
    #[serde(rename = "processId", skip_serializing_if = "Option::is_none")]
    pub process_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(rename = "remotePath", skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(rename = "showLog", default)]
    pub show_log: bool,
    #[serde(rename = "logOutput", skip_serializing_if = "Option::is_none")]
    pub log_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(rename = "dlvToolPath", skip_serializing_if = "Option::is_none")]
    pub dlv_tool_path: Option<String>,
    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<i64>,
    #[serde(rename = "stackTraceDepth", skip_serializing_if = "Option::is_none")]
    pub stack_trace_depth: Option<i64>,
    #[serde(rename = "dlvLoadConfig", skip_serializing_if = "Option::is_none")]
    pub dlv_load_config: Option<LoadConfig>,
    #[serde(rename = "showGlobalVariables", default)]
    pub show_global_variables: bool,
}

/// Closed set of ways a session can come to own (or reach) a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    Debug,
    Test,
    Exec,
    /// `noDebug` with mode=debug: no backend at all, the program runs under
    /// `go run` and only its output is bridged.
    NoDebugRun,
    AttachLocal {
        process_id: i64,
    },
    AttachRemote,
}

impl SessionMode {
    pub fn is_local_launch(&self) -> bool {
        matches!(self, SessionMode::Debug | SessionMode::Test | SessionMode::Exec)
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, SessionMode::AttachRemote)
    }

    /// The backend subcommand for modes that spawn one.
    pub fn backend_subcommand(&self) -> Option<&'static str> {
        match self {
            SessionMode::Debug => Some("debug"),
            SessionMode::Test => Some("test"),
            SessionMode::Exec => Some("exec"),
            SessionMode::AttachLocal { .. } => Some("attach"),
            SessionMode::NoDebugRun | SessionMode::AttachRemote => None,
        }
    }
}

/// Resolve the launch `mode` key (`auto` picks by program shape).
pub fn resolve_launch_mode(args: &LaunchArguments) -> Result<SessionMode, Box<dyn Error>> {
    let program = args
        .program
        .as_deref()
        .ok_or("launch configuration is missing the `program` attribute")?;
    let mode = args.mode.as_deref().unwrap_or("debug");
    let resolved = match mode {
        "auto" => {
            if program.ends_with(".go") || Path::new(program).is_dir() {
                "debug"
            } else {
                "exec"
            }
        }
        other => other,
    };
    match resolved {
        "debug" if args.no_debug => Ok(SessionMode::NoDebugRun),
        "debug" => Ok(SessionMode::Debug),
        "test" => Ok(SessionMode::Test),
        "exec" => Ok(SessionMode::Exec),
        "remote" => Ok(SessionMode::AttachRemote),
        other => Err(format!("unsupported launch mode: {other}").into()),
    }
}

pub fn resolve_attach_mode(args: &AttachArguments) -> Result<SessionMode, Box<dyn Error>> {
    match args.mode.as_deref().unwrap_or("local") {
        "local" => {
            let pid = args
                .process_id
                .ok_or("attach configuration is missing the `processId` attribute")?;
            Ok(SessionMode::AttachLocal { process_id: pid })
        }
        "remote" => Ok(SessionMode::AttachRemote),
        other => Err(format!("unsupported attach mode: {other}").into()),
    }
}

/// Parse one env file: `KEY=VALUE` lines, `#` comments, optional quoting.
pub fn parse_env_file(path: &Path) -> Result<HashMap<String, String>, Box<dyn Error>> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("cannot read env file {}: {e}", path.display()))?;
    let mut entries = HashMap::new();
    for (index, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            format!(
                "invalid line {} in env file {}: expected KEY=VALUE",
                index + 1,
                path.display()
            )
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!(
                "invalid line {} in env file {}: empty key",
                index + 1,
                path.display()
            )
            .into());
        }
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        entries.insert(key.to_string(), value.to_string());
    }
    Ok(entries)
}

/// Compose the child environment: process env, then env files in order,
/// then per-launch overrides. Last writer wins.
pub fn composed_environment(
    env_file: Option<&EnvFileSetting>,
    overrides: &HashMap<String, String>,
) -> Result<HashMap<String, String>, Box<dyn Error>> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    if let Some(setting) = env_file {
        for path in setting.paths() {
            for (key, value) in parse_env_file(&path)? {
                env.insert(key, value);
            }
        }
    }
    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_config_defaults() {
        let cfg = LoadConfig::default();
        assert!(cfg.follow_pointers);
        assert_eq!(cfg.max_variable_recurse, 1);
        assert_eq!(cfg.max_string_len, 64);
        assert_eq!(cfg.max_array_values, 64);
        assert_eq!(cfg.max_struct_fields, -1);

        let json = serde_json::to_value(&cfg).expect("serialize");
        assert_eq!(json["followPointers"], true);
        assert_eq!(json["maxStringLen"], 64);
    }

    #[test]
    fn launch_mode_resolution() {
        let mut args = LaunchArguments {
            program: Some("/w/main.go".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_launch_mode(&args).expect("mode"), SessionMode::Debug);

        args.mode = Some("auto".to_string());
        assert_eq!(resolve_launch_mode(&args).expect("mode"), SessionMode::Debug);

        args.program = Some("/w/bin/server".to_string());
        assert_eq!(resolve_launch_mode(&args).expect("mode"), SessionMode::Exec);

        args.mode = Some("debug".to_string());
        args.no_debug = true;
        assert_eq!(resolve_launch_mode(&args).expect("mode"), SessionMode::NoDebugRun);

        args.program = None;
        assert!(resolve_launch_mode(&args).is_err());
    }

    #[test]
    fn attach_mode_requires_pid() {
        let args = AttachArguments::default();
        assert!(resolve_attach_mode(&args).is_err());

        let args = AttachArguments {
            process_id: Some(1234),
            ..Default::default()
        };
        assert_eq!(
            resolve_attach_mode(&args).expect("mode"),
            SessionMode::AttachLocal { process_id: 1234 }
        );
    }

    #[test]
    fn env_file_parse_and_override_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("a.env");
        let second = dir.path().join("b.env");
        let mut f = std::fs::File::create(&first).expect("create");
        writeln!(f, "# comment\nA=1\nB=\"two\"\n\nC=3").expect("write");
        let mut f = std::fs::File::create(&second).expect("create");
        writeln!(f, "B=override").expect("write");

        let setting = EnvFileSetting::Many(vec![
            first.to_string_lossy().to_string(),
            second.to_string_lossy().to_string(),
        ]);
        let mut overrides = HashMap::new();
        overrides.insert("C".to_string(), "final".to_string());
        let env = composed_environment(Some(&setting), &overrides).expect("compose");
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("override"));
        assert_eq!(env.get("C").map(String::as_str), Some("final"));
    }

    #[test]
    fn env_file_errors_name_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bad = dir.path().join("bad.env");
        std::fs::write(&bad, "NOT A PAIR").expect("write");
        let err = parse_env_file(&bad).expect_err("parse should fail");
        assert!(err.to_string().contains("bad.env"));
    }
}
