//! Lexical path algebra for tree-relative paths.
//!
//! Tree paths are `/`-separated, relative to the tree root, with no `.`,
//! no empty segments and no leading or trailing slash. The empty string is
//! the root itself. Nothing here touches the filesystem.

/// Normalize a raw archive or config path into tree form.
///
/// Leading `/` and `./` are dropped (archives often carry them), `\` is
/// treated as a separator, and `..` is rejected if it climbs above the
/// root.
pub fn normalize(raw: &str) -> Result<String, String> {
    let mut out: Vec<&str> = Vec::new();
    let raw = raw.replace('\\', "/");
    for comp in raw.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if out.pop().is_none() {
                    return Err(format!("path '{raw}' escapes the tree root"));
                }
            }
            other => out.push(other),
        }
    }
    Ok(out.join("/"))
}

/// Directory containing `path` (`""` for top-level entries).
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

pub fn join(base: &str, rel: &str) -> String {
    match (base.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}/{rel}"),
    }
}

/// True if `path` is `dir` or lies beneath it.
pub fn is_within(path: &str, dir: &str) -> bool {
    dir.is_empty() || path == dir || path.starts_with(&format!("{dir}/"))
}

/// `path` with the `dir/` prefix removed.
pub fn strip_dir<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    if dir.is_empty() {
        return Some(path);
    }
    if path == dir {
        return Some("");
    }
    path.strip_prefix(dir)?.strip_prefix('/')
}

/// Result of resolving a relative path lexically from a base directory.
///
/// `ups` counts how many levels the path climbed above the root it was
/// resolved in; `path` is what remains below that point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lexical {
    pub ups: usize,
    pub path: String,
}

/// Resolve `rel` from `base_dir` without following anything.
pub fn lexical(base_dir: &str, rel: &str) -> Lexical {
    let mut stack: Vec<&str> = if base_dir.is_empty() {
        Vec::new()
    } else {
        base_dir.split('/').collect()
    };
    let mut ups = 0usize;
    for comp in rel.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    ups += 1;
                }
            }
            other => stack.push(other),
        }
    }
    Lexical {
        ups,
        path: stack.join("/"),
    }
}

/// Resolve `rel` from `base_dir`, or `None` if it escapes the root.
pub fn resolve_from(base_dir: &str, rel: &str) -> Option<String> {
    let lex = lexical(base_dir, rel);
    if lex.ups > 0 {
        None
    } else {
        Some(lex.path)
    }
}

/// Relative path that leads from directory `from_dir` to `to`.
pub fn relative_to(from_dir: &str, to: &str) -> String {
    let from: Vec<&str> = from_dir.split('/').filter(|c| !c.is_empty()).collect();
    let to_parts: Vec<&str> = to.split('/').filter(|c| !c.is_empty()).collect();
    let common = from
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out: Vec<&str> = Vec::new();
    out.extend(std::iter::repeat("..").take(from.len() - common));
    out.extend(&to_parts[common..]);
    if out.is_empty() {
        ".".to_string()
    } else {
        out.join("/")
    }
}
