//! Rendering of the backend's reflective variable graph onto DAP's
//! handle-based lazy expansion.
//!
//! The graph can be cyclic; nothing here follows children eagerly. A handle
//! is created only for nodes with expandable children, and partially loaded
//! nodes are completed with a fresh `Eval` of their fully-qualified name
//! when (and only when) the client expands them.

use crate::api::{flags, kind, Api, DebugVariable, EvalScope};
use crate::dap_types;
use log::warn;
use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Integer-keyed arena reset on every stop. The generation is stamped into
/// each handle so a key from a previous stop dereferences to an error, never
/// to cross-generation data.
#[derive(Debug)]
pub struct HandleArena<T> {
    generation: i64,
    entries: Vec<T>,
}

impl<T> HandleArena<T> {
    pub fn new() -> HandleArena<T> {
        HandleArena {
            generation: 1,
            entries: vec![],
        }
    }

    pub fn reset(&mut self) {
        self.generation += 1;
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, value: T) -> i64 {
        let index = self.entries.len() as i64;
        self.entries.push(value);
        (self.generation << 32) | (index + 1)
    }

    pub fn get(&self, handle: i64) -> Result<&T, Box<dyn Error>> {
        if handle >> 32 != self.generation {
            return Err("stale handle from a previous stop".into());
        }
        let index = (handle & 0xffff_ffff) - 1;
        self.entries
            .get(index as usize)
            .ok_or_else(|| "unknown handle".into())
    }
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        HandleArena::new()
    }
}

/// A stack-frame handle resolves back to goroutine + frame index.
#[derive(Debug, Clone, Copy)]
pub struct FrameRef {
    pub goroutine_id: i64,
    pub frame_index: i64,
}

/// A variable handle: the node itself plus the evaluation scope needed to
/// re-query it.
#[derive(Debug, Clone)]
pub struct VariableEntry {
    pub scope: EvalScope,
    pub variable: DebugVariable,
}

/// Synthetic wrapper so a scope ("Local", "Global") can live in the same
/// arena as real variables.
pub fn scope_variable(name: &str, children: Vec<DebugVariable>) -> DebugVariable {
    DebugVariable {
        name: name.to_string(),
        children,
        ..Default::default()
    }
}

/// Shadowed locals keep their real name for evaluation but are displayed
/// with one layer of parentheses per level of shadowing, innermost
/// (highest declaration line) first and bare.
pub fn apply_shadow_naming(variables: &mut [DebugVariable]) {
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, variable) in variables.iter().enumerate() {
        if variable.flags & flags::SHADOWED != 0 {
            groups.entry(variable.name.clone()).or_default().push(index);
        }
    }
    for (name, mut indexes) in groups {
        indexes.sort_by(|a, b| variables[*b].decl_line.cmp(&variables[*a].decl_line));
        for (layer, index) in indexes.into_iter().enumerate() {
            variables[index].name =
                format!("{}{}{}", "(".repeat(layer), name, ")".repeat(layer));
        }
    }
}

fn is_expandable(v: &DebugVariable) -> bool {
    match v.kind {
        kind::UNSAFE_POINTER | kind::STRING => false,
        kind::PTR => match v.children.first() {
            Some(pointee) => pointee.addr != 0 && pointee.type_name != "void" && !pointee.children.is_empty(),
            None => false,
        },
        kind::SLICE | kind::MAP => v.base != 0,
        kind::ARRAY => true,
        _ => !v.children.is_empty(),
    }
}

/// One variable node → its displayed value plus a handle when expandable.
/// For pointers the stored entry is the dereferenced node, inheriting the
/// pointer's fully-qualified name unchanged.
pub fn convert_variable(
    arena: &mut HandleArena<VariableEntry>,
    scope: EvalScope,
    v: &DebugVariable,
) -> (String, i64) {
    let reference = if is_expandable(v) {
        let stored = if v.kind == kind::PTR {
            let mut pointee = v.children[0].clone();
            pointee.fully_qualified_name = v.fully_qualified_name.clone();
            pointee
        } else {
            v.clone()
        };
        arena.insert(VariableEntry {
            scope,
            variable: stored,
        })
    } else {
        0
    };
    (render_value(v), reference)
}

pub fn render_value(v: &DebugVariable) -> String {
    match v.kind {
        kind::UNSAFE_POINTER => {
            let addr = v.children.first().map(|c| c.addr).unwrap_or(v.addr);
            format!("unsafe.Pointer(0x{addr:x})")
        }
        kind::PTR => match v.children.first() {
            None => format!("nil <{}>", v.type_name),
            Some(pointee) if pointee.addr == 0 => format!("nil <{}>", v.type_name),
            Some(pointee) if pointee.type_name == "void" => "void".to_string(),
            Some(pointee) => format!("<{}>(0x{:x})", v.type_name, pointee.addr),
        },
        kind::SLICE => {
            if v.base == 0 {
                format!("nil <{}>", v.type_name)
            } else {
                format!("<{}> (length: {}, cap: {})", v.type_name, v.len, v.cap)
            }
        }
        kind::MAP => {
            if v.base == 0 {
                format!("nil <{}>", v.type_name)
            } else {
                format!("<{}> (length: {})", v.type_name, v.len)
            }
        }
        kind::ARRAY => format!("<{}>", v.type_name),
        kind::STRING => {
            if !v.unreadable.is_empty() {
                return format!("<{}>", v.unreadable);
            }
            let byte_length = v.value.len() as i64;
            if v.len > 0 && byte_length < v.len {
                format!("\"{}\"...+{} more", v.value, v.len - byte_length)
            } else {
                format!("\"{}\"", v.value)
            }
        }
        _ => {
            if v.value.is_empty() {
                format!("<{}>", v.type_name)
            } else {
                v.value.clone()
            }
        }
    }
}

/// The backend's load bounds leave large values partial: a struct whose
/// `len` exceeds its loaded children, or an interface whose first child is
/// an address-only placeholder. Completion re-evaluates the node by its
/// fully-qualified name.
fn ensure_loaded(
    api: &dyn Api,
    scope: &EvalScope,
    v: &mut DebugVariable,
) -> Result<(), Box<dyn Error>> {
    let partial_struct = v.kind == kind::STRUCT && v.len > v.children.len() as i64;
    let placeholder_interface =
        v.kind == kind::INTERFACE && v.children.first().map(|c| c.only_addr).unwrap_or(false);
    if (partial_struct || placeholder_interface) && !v.fully_qualified_name.is_empty() {
        let loaded = api.eval(scope, &v.fully_qualified_name)?;
        v.children = loaded.children;
    }
    Ok(())
}

/// Expand one handle into its DAP-visible children.
pub fn children(
    api: &dyn Api,
    arena: &mut HandleArena<VariableEntry>,
    scope: EvalScope,
    variable: &DebugVariable,
) -> Result<Vec<dap_types::Variable>, Box<dyn Error>> {
    let parent_fqn = variable.fully_qualified_name.clone();
    let mut result = vec![];
    match variable.kind {
        kind::MAP => {
            // children alternate key, value
            let mut index = 0;
            while index + 1 < variable.children.len() {
                let key = &variable.children[index];
                let mut value = variable.children[index + 1].clone();
                let rendered_key = render_value(key);
                value.fully_qualified_name = format!("{parent_fqn}[{rendered_key}]");
                let (rendered, reference) = convert_variable(arena, scope, &value);
                result.push(dap_types::Variable {
                    name: rendered_key,
                    value: rendered,
                    r#type: Some(value.type_name.clone()),
                    evaluate_name: Some(value.fully_qualified_name.clone()),
                    variables_reference: reference,
                });
                index += 2;
            }
        }
        kind::SLICE | kind::ARRAY => {
            for (index, child) in variable.children.iter().enumerate() {
                let mut element = child.clone();
                if element.only_addr {
                    // boxed element: load through its concrete type
                    element = api.eval(
                        &scope,
                        &format!("*(*\"{}\")({})", element.type_name, element.addr),
                    )?;
                }
                element.fully_qualified_name = format!("{parent_fqn}[{index}]");
                let (rendered, reference) = convert_variable(arena, scope, &element);
                result.push(dap_types::Variable {
                    name: format!("[{index}]"),
                    value: rendered,
                    r#type: Some(element.type_name.clone()),
                    evaluate_name: Some(element.fully_qualified_name.clone()),
                    variables_reference: reference,
                });
            }
        }
        _ => {
            let mut loaded = variable.clone();
            ensure_loaded(api, &scope, &mut loaded)?;
            for child in &loaded.children {
                let mut child = child.clone();
                if parent_fqn.is_empty() {
                    // scope wrapper: each local's own name is its root
                    if child.fully_qualified_name.is_empty() {
                        child.fully_qualified_name = child.name.clone();
                    }
                } else {
                    child.fully_qualified_name = format!("{parent_fqn}.{}", child.name);
                }
                let (rendered, reference) = convert_variable(arena, scope, &child);
                result.push(dap_types::Variable {
                    name: child.name.clone(),
                    value: rendered,
                    r#type: Some(child.type_name.clone()),
                    evaluate_name: Some(child.fully_qualified_name.clone()),
                    variables_reference: reference,
                });
            }
        }
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackageInfo {
    pub name: String,
    pub import_path: String,
}

/// Package name/import path per source directory, resolved with `go list`.
/// Append-only for the lifetime of the session.
#[derive(Debug, Default)]
pub struct PackageInfoCache {
    cache: HashMap<PathBuf, Option<PackageInfo>>,
}

impl PackageInfoCache {
    pub fn new() -> PackageInfoCache {
        PackageInfoCache::default()
    }

    pub fn for_dir(&mut self, dir: &Path) -> Option<PackageInfo> {
        if let Some(cached) = self.cache.get(dir) {
            return cached.clone();
        }
        let resolved = query_go_list(dir);
        self.cache.insert(dir.to_path_buf(), resolved.clone());
        resolved
    }
}

fn query_go_list(dir: &Path) -> Option<PackageInfo> {
    let output = Command::new("go")
        .args(["list", "-f", "{{.Name}} {{.ImportPath}}"])
        .current_dir(dir)
        .output();
    let output = match output {
        Ok(out) if out.status.success() => out,
        Ok(out) => {
            warn!(
                "go list failed in {}: {}",
                dir.display(),
                String::from_utf8_lossy(&out.stderr)
            );
            return None;
        }
        Err(e) => {
            warn!("go list could not run in {}: {e}", dir.display());
            return None;
        }
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut parts = stdout.split_whitespace();
    let name = parts.next()?.to_string();
    let import_path = parts.next()?.to_string();
    Some(PackageInfo { name, import_path })
}

/// Compiler-generated package entries that should not reach the client.
pub const INITDONE_NAME: &str = "initdone·";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BackendBreakpoint, BackendLocation, DebuggerState, Goroutine, VersionInfo};
    use crate::rpc::RpcError;

    struct UnusedApi;

    impl Api for UnusedApi {
        fn get_version(&self) -> Result<VersionInfo, RpcError> {
            unreachable!("not used")
        }
        fn state(&self, _non_blocking: bool) -> Result<DebuggerState, RpcError> {
            unreachable!("not used")
        }
        fn command(&self, _name: &str) -> Result<DebuggerState, RpcError> {
            unreachable!("not used")
        }
        fn create_breakpoint(
            &self,
            _bp: &BackendBreakpoint,
        ) -> Result<BackendBreakpoint, RpcError> {
            unreachable!("not used")
        }
        fn clear_breakpoint(&self, _id: i64) -> Result<(), RpcError> {
            unreachable!("not used")
        }
        fn list_breakpoints(&self) -> Result<Vec<BackendBreakpoint>, RpcError> {
            unreachable!("not used")
        }
        fn list_goroutines(&self, _count: Option<i64>) -> Result<Vec<Goroutine>, RpcError> {
            unreachable!("not used")
        }
        fn stacktrace(
            &self,
            _goroutine_id: i64,
            _depth: i64,
        ) -> Result<Vec<BackendLocation>, RpcError> {
            unreachable!("not used")
        }
        fn list_local_vars(&self, _scope: &EvalScope) -> Result<Vec<DebugVariable>, RpcError> {
            unreachable!("not used")
        }
        fn list_function_args(&self, _scope: &EvalScope) -> Result<Vec<DebugVariable>, RpcError> {
            unreachable!("not used")
        }
        fn list_package_vars(&self, _filter: &str) -> Result<Vec<DebugVariable>, RpcError> {
            unreachable!("not used")
        }
        fn eval(&self, _scope: &EvalScope, _expr: &str) -> Result<DebugVariable, RpcError> {
            Err(RpcError::Backend("eval not scripted".to_string()))
        }
        fn set_symbol(
            &self,
            _scope: &EvalScope,
            _symbol: &str,
            _value: &str,
        ) -> Result<(), RpcError> {
            unreachable!("not used")
        }
        fn detach(&self, _kill: bool) -> Result<(), RpcError> {
            unreachable!("not used")
        }
        fn close(&self) {}
    }

    fn string_var(name: &str, value: &str, total_len: i64) -> DebugVariable {
        DebugVariable {
            name: name.to_string(),
            kind: kind::STRING,
            value: value.to_string(),
            len: total_len,
            type_name: "string".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn truncated_string_reports_remaining_bytes() {
        let v = string_var("s", "hello", 12);
        assert_eq!(render_value(&v), "\"hello\"...+7 more");

        let full = string_var("s", "hello", 5);
        assert_eq!(render_value(&full), "\"hello\"");

        // remaining count is in UTF-8 bytes, not characters
        let multibyte = string_var("s", "héllo", 10);
        assert_eq!(render_value(&multibyte), "\"héllo\"...+4 more");
    }

    #[test]
    fn unreadable_string_shows_the_reason() {
        let mut v = string_var("s", "", 5);
        v.unreadable = "read out of bounds".to_string();
        assert_eq!(render_value(&v), "<read out of bounds>");
    }

    #[test]
    fn nil_and_loaded_pointers() {
        let mut v = DebugVariable {
            name: "p".to_string(),
            kind: kind::PTR,
            type_name: "*main.T".to_string(),
            children: vec![DebugVariable {
                addr: 0,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(render_value(&v), "nil <*main.T>");
        assert!(!is_expandable(&v));

        v.children[0].addr = 0xc000010000;
        v.children[0].children = vec![DebugVariable::default()];
        assert_eq!(render_value(&v), "<*main.T>(0xc000010000)");
        assert!(is_expandable(&v));
    }

    #[test]
    fn slice_map_and_array_values() {
        let slice = DebugVariable {
            kind: kind::SLICE,
            type_name: "[]int".to_string(),
            base: 0xc0000a0000,
            len: 3,
            cap: 8,
            ..Default::default()
        };
        assert_eq!(render_value(&slice), "<[]int> (length: 3, cap: 8)");

        let nil_slice = DebugVariable {
            kind: kind::SLICE,
            type_name: "[]int".to_string(),
            ..Default::default()
        };
        assert_eq!(render_value(&nil_slice), "nil <[]int>");
        assert!(!is_expandable(&nil_slice));

        let map = DebugVariable {
            kind: kind::MAP,
            type_name: "map[string]int".to_string(),
            base: 0xc0000b0000,
            len: 2,
            ..Default::default()
        };
        assert_eq!(render_value(&map), "<map[string]int> (length: 2)");

        let array = DebugVariable {
            kind: kind::ARRAY,
            type_name: "[4]int".to_string(),
            ..Default::default()
        };
        assert_eq!(render_value(&array), "<[4]int>");
        assert!(is_expandable(&array));
    }

    #[test]
    fn shadowed_locals_get_parenthesised_names() {
        let mut vars = vec![
            DebugVariable {
                name: "x".to_string(),
                decl_line: 20,
                flags: flags::SHADOWED,
                ..Default::default()
            },
            DebugVariable {
                name: "x".to_string(),
                decl_line: 15,
                flags: flags::SHADOWED,
                ..Default::default()
            },
            DebugVariable {
                name: "x".to_string(),
                decl_line: 25,
                flags: flags::SHADOWED,
                ..Default::default()
            },
            DebugVariable {
                name: "y".to_string(),
                decl_line: 10,
                ..Default::default()
            },
        ];
        apply_shadow_naming(&mut vars);
        assert_eq!(vars[2].name, "x"); // line 25, innermost
        assert_eq!(vars[0].name, "(x)"); // line 20
        assert_eq!(vars[1].name, "((x))"); // line 15
        assert_eq!(vars[3].name, "y");
    }

    #[test]
    fn arena_handles_go_stale_on_reset() {
        let mut arena: HandleArena<FrameRef> = HandleArena::new();
        let handle = arena.insert(FrameRef {
            goroutine_id: 1,
            frame_index: 0,
        });
        assert!(arena.get(handle).is_ok());
        arena.reset();
        assert!(arena.is_empty());
        let err = arena.get(handle).expect_err("stale");
        assert!(err.to_string().contains("stale"));

        // a fresh handle with the same slot works again
        let fresh = arena.insert(FrameRef {
            goroutine_id: 2,
            frame_index: 0,
        });
        assert_ne!(fresh, handle);
        assert_eq!(arena.get(fresh).expect("fresh").goroutine_id, 2);
    }

    #[test]
    fn map_children_pair_keys_with_values() {
        let mut arena = HandleArena::new();
        let scope = EvalScope::default();
        let map = DebugVariable {
            kind: kind::MAP,
            type_name: "map[string]int".to_string(),
            base: 1,
            fully_qualified_name: "m".to_string(),
            children: vec![
                string_var("", "alpha", 5),
                DebugVariable {
                    kind: kind::INT,
                    value: "1".to_string(),
                    type_name: "int".to_string(),
                    ..Default::default()
                },
                string_var("", "beta", 4),
                DebugVariable {
                    kind: kind::INT,
                    value: "2".to_string(),
                    type_name: "int".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let rendered = children(&UnusedApi, &mut arena, scope, &map).expect("children");
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[0].name, "\"alpha\"");
        assert_eq!(rendered[0].value, "1");
        assert_eq!(
            rendered[0].evaluate_name.as_deref(),
            Some("m[\"alpha\"]")
        );
        assert_eq!(rendered[1].name, "\"beta\"");
    }

    #[test]
    fn struct_children_inherit_dotted_names() {
        let mut arena = HandleArena::new();
        let scope = EvalScope::default();
        let parent = DebugVariable {
            kind: kind::STRUCT,
            type_name: "main.Point".to_string(),
            fully_qualified_name: "p".to_string(),
            len: 2,
            children: vec![
                DebugVariable {
                    name: "X".to_string(),
                    kind: kind::INT,
                    value: "3".to_string(),
                    ..Default::default()
                },
                DebugVariable {
                    name: "Y".to_string(),
                    kind: kind::INT,
                    value: "4".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let rendered = children(&UnusedApi, &mut arena, scope, &parent).expect("children");
        assert_eq!(rendered[0].evaluate_name.as_deref(), Some("p.X"));
        assert_eq!(rendered[1].evaluate_name.as_deref(), Some("p.Y"));
    }

    #[test]
    fn scope_children_use_their_own_names_as_roots() {
        let mut arena = HandleArena::new();
        let scope = EvalScope::default();
        let mut local = string_var("greeting", "hi", 2);
        local.fully_qualified_name = "greeting".to_string();
        let wrapper = scope_variable("Local", vec![local]);
        let rendered = children(&UnusedApi, &mut arena, scope, &wrapper).expect("children");
        assert_eq!(rendered[0].evaluate_name.as_deref(), Some("greeting"));
    }
}
