//! Translation between the local workspace path space and the path space
//! the backend reports (which differ for remote sessions).
//!
//! Reverse translation falls back to the standard-library and module-cache
//! roots when a reported path lies outside the configured remote root.

use std::path::MAIN_SEPARATOR;

#[derive(Debug, Clone)]
pub struct PathMapper {
    local_root: String,
    remote_root: String,
    local_sep: char,
    remote_sep: char,
    goroot: Option<String>,
    gopath: Option<String>,
}

fn separator_of(path: &str) -> char {
    if path.contains('\\') {
        '\\'
    } else {
        '/'
    }
}

fn looks_like_windows(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Canonicalise a client-supplied path: on Windows-style input, pick the
/// separator actually present (forward slashes are tolerated) and uppercase
/// the drive letter. Everything else passes through.
pub fn normalize_path(path: &str) -> String {
    if !looks_like_windows(path) {
        return path.to_string();
    }
    let sep = separator_of(path);
    let mut normalized: String = match sep {
        '\\' => path.replace('/', "\\"),
        _ => path.replace('\\', "/"),
    };
    // safe: looks_like_windows checked an ascii drive letter at index 0
    let drive = normalized.as_bytes()[0].to_ascii_uppercase();
    normalized.replace_range(0..1, std::str::from_utf8(&[drive]).unwrap_or("C"));
    normalized
}

fn trim_trailing_sep(root: &str, sep: char) -> String {
    root.trim_end_matches(sep).to_string()
}

fn components(path: &str, sep: char) -> Vec<&str> {
    path.split(sep).filter(|c| !c.is_empty()).collect()
}

impl PathMapper {
    pub fn new(
        local_root: &str,
        remote_root: Option<&str>,
        goroot: Option<String>,
        gopath: Option<String>,
    ) -> PathMapper {
        let local_root = normalize_path(local_root);
        let local_sep = separator_of(&local_root);
        let remote_root = remote_root.unwrap_or("").to_string();
        let remote_sep = if remote_root.is_empty() {
            MAIN_SEPARATOR
        } else {
            separator_of(&remote_root)
        };
        let mut local_root = trim_trailing_sep(&local_root, local_sep);
        let mut remote_root = trim_trailing_sep(&remote_root, remote_sep);

        // roots that end in the same component chain starting at a `src`
        // directory are compared without it
        if !remote_root.is_empty() {
            let local_parts = components(&local_root, local_sep);
            let remote_parts = components(&remote_root, remote_sep);
            let mut common = 0;
            while common < local_parts.len()
                && common < remote_parts.len()
                && local_parts[local_parts.len() - 1 - common]
                    == remote_parts[remote_parts.len() - 1 - common]
            {
                common += 1;
            }
            let suffix_start = local_parts.len() - common;
            if let Some(src_offset) = local_parts[suffix_start..].iter().position(|c| *c == "src") {
                let keep_local = suffix_start + src_offset;
                let keep_remote = remote_parts.len() - common + src_offset;
                local_root = rebuild_root(&local_root, &local_parts[..keep_local], local_sep);
                remote_root = rebuild_root(&remote_root, &remote_parts[..keep_remote], remote_sep);
            }
        }

        PathMapper {
            local_root,
            remote_root,
            local_sep,
            remote_sep,
            goroot,
            gopath,
        }
    }

    pub fn has_remote_root(&self) -> bool {
        !self.remote_root.is_empty()
    }

    /// Local workspace path → path the backend understands.
    pub fn to_debugger(&self, local_path: &str) -> String {
        let normalized = normalize_path(local_path);
        if self.remote_root.is_empty() {
            return normalized;
        }
        if let Some(suffix) = normalized.strip_prefix(&self.local_root) {
            let converted: String = suffix
                .chars()
                .map(|c| if c == self.local_sep { self.remote_sep } else { c })
                .collect();
            return format!("{}{}", self.remote_root, converted);
        }
        normalized
            .chars()
            .map(|c| if c == self.local_sep { self.remote_sep } else { c })
            .collect()
    }

    /// Backend-reported path → local workspace path.
    pub fn to_local(&self, remote_path: &str) -> String {
        if self.remote_root.is_empty() {
            return remote_path.to_string();
        }
        if let Some(suffix) = remote_path.strip_prefix(&self.remote_root) {
            let converted: String = suffix
                .chars()
                .map(|c| if c == self.remote_sep { self.local_sep } else { c })
                .collect();
            return format!("{}{}", self.local_root, converted);
        }
        // outside the remote root: standard library, module cache, or
        // something we cannot place
        let goroot_marker = format!("{0}src{0}", self.remote_sep);
        if let Some(goroot) = &self.goroot {
            if let Some(index) = remote_path.find(&goroot_marker) {
                return format!("{}{}", goroot, &remote_path[index..]);
            }
        }
        let mod_cache_marker = format!("{0}pkg{0}mod{0}", self.remote_sep);
        if let Some(gopath) = &self.gopath {
            if let Some(index) = remote_path.find(&mod_cache_marker) {
                return format!("{}{}", gopath, &remote_path[index..]);
            }
        }
        remote_path.to_string()
    }
}

fn rebuild_root(original: &str, parts: &[&str], sep: char) -> String {
    let rooted = original.starts_with(sep);
    let joined = parts.join(&sep.to_string());
    if rooted {
        format!("{sep}{joined}")
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(local: &str, remote: &str) -> PathMapper {
        PathMapper::new(
            local,
            Some(remote),
            Some("/usr/local/go".to_string()),
            Some("/home/u/go".to_string()),
        )
    }

    #[test]
    fn identity_without_remote_root() {
        let m = PathMapper::new("/home/u/proj", None, None, None);
        assert_eq!(m.to_debugger("/home/u/proj/main.go"), "/home/u/proj/main.go");
        assert_eq!(m.to_local("/home/u/proj/main.go"), "/home/u/proj/main.go");
    }

    #[test]
    fn remote_mapping_both_directions() {
        let m = mapper("/home/u/proj", "/srv/build");
        assert_eq!(
            m.to_debugger("/home/u/proj/pkg/foo.go"),
            "/srv/build/pkg/foo.go"
        );
        assert_eq!(
            m.to_local("/srv/build/pkg/foo.go"),
            "/home/u/proj/pkg/foo.go"
        );
    }

    #[test]
    fn round_trip_inside_program_root() {
        let m = mapper("/home/u/proj", "/srv/build");
        for p in [
            "/home/u/proj/main.go",
            "/home/u/proj/internal/a/b.go",
            "/home/u/proj/deep/x/y/z.go",
        ] {
            assert_eq!(m.to_local(&m.to_debugger(p)), p);
        }
    }

    #[test]
    fn goroot_fallback_for_standard_library() {
        let m = mapper("/home/u/proj", "/srv/build");
        assert_eq!(
            m.to_local("/opt/go/src/fmt/print.go"),
            "/usr/local/go/src/fmt/print.go"
        );
    }

    #[test]
    fn module_cache_fallback_uses_first_gopath_entry() {
        let m = mapper("/home/u/proj", "/srv/build");
        assert_eq!(
            m.to_local("/root/go/pkg/mod/rsc.io/quote@v1.5.2/quote.go"),
            "/home/u/go/pkg/mod/rsc.io/quote@v1.5.2/quote.go"
        );
    }

    #[test]
    fn unplaceable_remote_path_passes_through() {
        let m = PathMapper::new("/home/u/proj", Some("/srv/build"), None, None);
        assert_eq!(m.to_local("/etc/hosts"), "/etc/hosts");
    }

    #[test]
    fn windows_drive_and_separator_normalisation() {
        assert_eq!(normalize_path("c:/Users/dev/proj"), "C:/Users/dev/proj");
        assert_eq!(normalize_path("c:\\Users/dev\\proj"), "C:\\Users\\dev\\proj");
        assert_eq!(normalize_path("/home/u/proj"), "/home/u/proj");
    }

    #[test]
    fn windows_local_root_round_trip() {
        let m = PathMapper::new("c:\\work\\proj", Some("/srv/build"), None, None);
        assert_eq!(
            m.to_debugger("C:\\work\\proj\\cmd\\main.go"),
            "/srv/build/cmd/main.go"
        );
        assert_eq!(
            m.to_local("/srv/build/cmd/main.go"),
            "C:\\work\\proj\\cmd\\main.go"
        );
    }

    #[test]
    fn shared_src_suffix_is_stripped_from_both_roots() {
        let m = PathMapper::new("/home/u/go/src/app", Some("/remote/go/src/app"), None, None);
        assert_eq!(
            m.to_debugger("/home/u/go/other/file.go"),
            "/remote/go/other/file.go"
        );
        assert_eq!(
            m.to_local("/remote/go/src/app/file.go"),
            "/home/u/go/src/app/file.go"
        );
    }

    #[test]
    fn trailing_separators_on_roots_are_ignored() {
        let m = PathMapper::new("/home/u/proj/", Some("/srv/build/"), None, None);
        assert_eq!(m.to_debugger("/home/u/proj/a.go"), "/srv/build/a.go");
    }
}
