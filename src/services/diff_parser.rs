//! Fenced diff extraction and unified-diff header parsing.

use regex::Regex;
use std::sync::OnceLock;

/// Fence languages treated as patches.
const DIFF_FENCES: &[&str] = &["diff", "patch"];

/// Extensions that count as documentation for the salvage path.
const DOC_EXTENSIONS: &[&str] = &[".md", ".txt", ".rst"];

/// One fenced ```diff / ```patch block from an agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffBlock {
    /// Zero-based position among the output's diff blocks.
    pub index: usize,
    pub body: String,
}

/// Changes to one file inside a diff block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileSection {
    pub path: String,
    pub is_new_file: bool,
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

/// Pull every fenced diff block out of `text`, in order.
///
/// An unterminated fence runs to the end of the text.
pub fn extract_blocks(text: &str) -> Vec<DiffBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        match current.as_mut() {
            None => {
                if let Some(lang) = trimmed.strip_prefix("```") {
                    let lang = lang.trim().to_lowercase();
                    if DIFF_FENCES.contains(&lang.as_str()) {
                        current = Some(Vec::new());
                    }
                }
            }
            Some(lines) => {
                if trimmed.starts_with("```") {
                    blocks.push(finish_block(blocks.len(), lines));
                    current = None;
                } else {
                    lines.push(line);
                }
            }
        }
    }
    if let Some(lines) = current {
        blocks.push(finish_block(blocks.len(), &lines));
    }
    blocks
}

fn finish_block(index: usize, lines: &[&str]) -> DiffBlock {
    let mut body = lines.join("\n");
    body.push('\n');
    DiffBlock { index, body }
}

/// `text` with every fenced diff block removed.
pub fn strip_blocks(text: &str) -> String {
    let mut kept = Vec::new();
    let mut inside = false;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if inside {
            if trimmed.starts_with("```") {
                inside = false;
            }
            continue;
        }
        if let Some(lang) = trimmed.strip_prefix("```") {
            if DIFF_FENCES.contains(&lang.trim().to_lowercase().as_str()) {
                inside = true;
                continue;
            }
        }
        kept.push(line);
    }
    kept.join("\n")
}

/// Paths listed on `DECLARED_FILES:` lines, comma or whitespace separated.
pub fn declared_files(text: &str) -> Vec<String> {
    let mut files = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.trim().strip_prefix("DECLARED_FILES:") {
            for raw in rest.split(|c: char| c == ',' || c.is_whitespace()) {
                let path = raw.trim().trim_matches('`');
                if !path.is_empty() && !files.iter().any(|f| f == path) {
                    files.push(path.to_string());
                }
            }
        }
    }
    files
}

/// Normalize a header path: drop `a/` or `b/`, trailing timestamps and quotes.
/// Returns `None` for `/dev/null`.
pub fn normalize_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or("").trim().trim_matches('"');
    if raw.is_empty() || raw == "/dev/null" {
        return None;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(stripped.to_string())
}

/// Refuse paths that escape the working tree.
pub fn check_path(path: &str) -> Result<(), String> {
    if path.starts_with('/') || path.starts_with('\\') || path.chars().nth(1) == Some(':') {
        return Err(format!("absolute path not allowed: {path}"));
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(format!("path escapes repository: {path}"));
    }
    Ok(())
}

impl DiffBlock {
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }

    /// Every path the block can touch, deduplicated in order of appearance.
    ///
    /// `---`/`+++` pairs and `rename`/`copy` headers name the paths of a
    /// file section. The `diff --git` line is only used for sections that
    /// carry neither, such as pure mode changes.
    pub fn touched_paths(&self) -> Vec<String> {
        let lines: Vec<&str> = self.body.lines().collect();
        let mut found: Vec<String> = Vec::new();
        let mut pending: Vec<String> = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];
            if let Some(rest) = line.strip_prefix("diff --git ") {
                found.append(&mut pending);
                let (old, new) = git_header_paths(rest);
                pending.extend(old.into_iter().chain(new));
            } else if is_header_pair(&lines, i) {
                pending.clear();
                found.extend(line.strip_prefix("--- ").and_then(normalize_path));
                found.extend(lines[i + 1].strip_prefix("+++ ").and_then(normalize_path));
                i += 2;
                continue;
            } else if let Some(path) = extended_header_path(line) {
                pending.clear();
                found.push(path);
            }
            i += 1;
        }
        found.append(&mut pending);

        let mut paths: Vec<String> = Vec::new();
        for path in found {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }

    /// Split the block into per-file sections, tracking the current target
    /// file across headers.
    pub fn sections(&self) -> Vec<FileSection> {
        let lines: Vec<&str> = self.body.lines().collect();
        let mut sections: Vec<FileSection> = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];
            if let Some(rest) = line.strip_prefix("diff --git ") {
                let (_, target) = git_header_paths(rest);
                sections.push(FileSection {
                    path: target.unwrap_or_default(),
                    ..FileSection::default()
                });
            } else if line.starts_with("new file mode") {
                if let Some(section) = sections.last_mut() {
                    section.is_new_file = true;
                }
            } else if is_header_pair(&lines, i) {
                let old = line.strip_prefix("--- ").and_then(normalize_path);
                let new = lines[i + 1].strip_prefix("+++ ").and_then(normalize_path);
                let path = new.clone().or_else(|| old.clone()).unwrap_or_default();
                let is_new = old.is_none();
                match sections.last_mut() {
                    // Headers following a `diff --git` line for the same file.
                    Some(section) if section.removed.is_empty() && section.added.is_empty() && (section.path == path || section.path.is_empty()) => {
                        section.path = path;
                        section.is_new_file |= is_new;
                    }
                    _ => sections.push(FileSection {
                        path,
                        is_new_file: is_new,
                        ..FileSection::default()
                    }),
                }
                i += 2;
                continue;
            } else if let Some(section) = sections.last_mut() {
                if let Some(removed) = line.strip_prefix('-') {
                    section.removed.push(removed.to_string());
                } else if let Some(added) = line.strip_prefix('+') {
                    section.added.push(added.to_string());
                }
            }
            i += 1;
        }
        sections.retain(|s| !s.path.is_empty());
        sections
    }

    /// For a block that only creates one documentation file, the path and the
    /// file content rebuilt from its added lines.
    pub fn salvageable_document(&self) -> Option<(String, String)> {
        let sections = self.sections();
        let [section] = sections.as_slice() else {
            return None;
        };
        if !section.is_new_file || !section.removed.is_empty() || !is_documentation(&section.path) {
            return None;
        }
        let mut content = section.added.join("\n");
        content.push('\n');
        Some((section.path.clone(), content))
    }
}

/// Old and new path of a `diff --git` line. Unquoted paths may contain
/// spaces, so the line is split where both sides name the same file.
fn git_header_paths(rest: &str) -> (Option<String>, Option<String>) {
    let rest = rest.trim_end();
    if rest.starts_with('"') {
        let mut parts = rest.split('"').filter(|p| !p.trim().is_empty());
        return (parts.next().and_then(normalize_path), parts.next().and_then(normalize_path));
    }
    let splits: Vec<usize> = rest.match_indices(" b/").map(|(i, _)| i).collect();
    let split = splits
        .iter()
        .copied()
        .find(|&i| rest[..i].strip_prefix("a/") == Some(&rest[i + 3..]))
        .or_else(|| splits.first().copied());
    match split {
        Some(i) => (normalize_path(&rest[..i]), normalize_path(&rest[i + 1..])),
        None => {
            let mut parts = rest.split_whitespace();
            (parts.next().and_then(normalize_path), parts.next().and_then(normalize_path))
        }
    }
}

/// Path named by a `rename`/`copy` extended header. These carry no `a/` or
/// `b/` prefix.
fn extended_header_path(line: &str) -> Option<String> {
    const HEADERS: &[&str] = &[
        "rename from ",
        "rename to ",
        "rename old ",
        "rename new ",
        "copy from ",
        "copy to ",
    ];
    let raw = HEADERS.iter().find_map(|h| line.strip_prefix(h))?;
    let raw = raw.trim().trim_matches('"');
    (!raw.is_empty()).then(|| raw.to_string())
}

/// Paths reported by `git apply --numstat -z`. Renames and copies print an
/// empty path followed by the old and new names as separate fields.
pub fn numstat_paths(output: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    let mut fields = output.split('\0').filter(|f| !f.is_empty());
    while let Some(field) = fields.next() {
        let path = field.splitn(3, '\t').nth(2).unwrap_or("");
        let named: Vec<&str> = if path.is_empty() {
            fields.by_ref().take(2).collect()
        } else {
            vec![path]
        };
        for p in named {
            if !paths.iter().any(|known| known == p) {
                paths.push(p.to_string());
            }
        }
    }
    paths
}

fn is_header_pair(lines: &[&str], i: usize) -> bool {
    lines[i].starts_with("--- ") && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ "))
}

pub fn is_documentation(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.starts_with("docs/") || DOC_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Match a path against a simple glob.
///
/// - a pattern ending in `/` matches everything under that directory;
/// - a pattern without `/` matches the file name;
/// - otherwise the whole path is matched, with `**` spanning directories and
///   `*` / `?` staying inside one segment.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    if let Some(dir) = pattern.strip_suffix('/') {
        let dir = dir.trim_start_matches("./");
        return path.starts_with(&format!("{dir}/")) || path.contains(&format!("/{dir}/"));
    }
    if !pattern.contains('/') {
        let name = path.rsplit('/').next().unwrap_or(path);
        return glob_regex(pattern).is_some_and(|re| re.is_match(name));
    }
    glob_regex(pattern).is_some_and(|re| re.is_match(path))
}

fn glob_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).ok()
}

fn citation_regex() -> &'static Regex {
    static CITATION: OnceLock<Regex> = OnceLock::new();
    CITATION.get_or_init(|| {
        Regex::new(r#"(?:^|[\s`'"(\[])((?:\./)?(?:[A-Za-z0-9_.-]+/)+[A-Za-z0-9_-][A-Za-z0-9_.-]*\.[A-Za-z0-9]{1,6})(?::\d+)?"#)
            .expect("citation pattern is valid")
    })
}

/// Relative file paths cited in prose, outside diff blocks and
/// `DECLARED_FILES:` lines.
pub fn cited_paths(text: &str) -> Vec<String> {
    let prose: String = strip_blocks(text)
        .lines()
        .filter(|line| !line.trim_start().starts_with("DECLARED_FILES:"))
        .collect::<Vec<_>>()
        .join("\n");
    let mut paths: Vec<String> = Vec::new();
    for caps in citation_regex().captures_iter(&prose) {
        let path = caps[1].trim_start_matches("./").to_string();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "Plan below.\n\
DECLARED_FILES: src/lib.rs, docs/notes.md\n\
```diff\n\
diff --git a/src/lib.rs b/src/lib.rs\n\
--- a/src/lib.rs\n\
+++ b/src/lib.rs\n\
@@ -1,2 +1,2 @@\n\
-pub fn old() {}\n\
+pub fn new() {}\n\
```\n\
Some prose citing src/services/governance.rs:42.\n\
```patch\n\
--- /dev/null\n\
+++ b/docs/notes.md\n\
@@ -0,0 +1,2 @@\n\
+# Notes\n\
+hello\n\
```\n";

    #[test]
    fn test_extract_blocks_and_paths() {
        let blocks = extract_blocks(OUTPUT);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].touched_paths(), vec!["src/lib.rs"]);
        assert_eq!(blocks[1].touched_paths(), vec!["docs/notes.md"]);
        assert_eq!(blocks[1].index, 1);
    }

    #[test]
    fn test_declared_files() {
        assert_eq!(declared_files(OUTPUT), vec!["src/lib.rs", "docs/notes.md"]);
    }

    #[test]
    fn test_sections_and_salvage() {
        let blocks = extract_blocks(OUTPUT);
        let sections = blocks[0].sections();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].removed, vec!["pub fn old() {}"]);
        assert_eq!(sections[0].added, vec!["pub fn new() {}"]);

        let (path, content) = blocks[1].salvageable_document().unwrap();
        assert_eq!(path, "docs/notes.md");
        assert_eq!(content, "# Notes\nhello\n");
        assert!(blocks[0].salvageable_document().is_none());
    }

    #[test]
    fn test_sections_track_multiple_files() {
        let block = DiffBlock {
            index: 0,
            body: "diff --git a/a.rs b/a.rs\n--- a/a.rs\n+++ b/a.rs\n-x\ndiff --git a/b.rs b/b.rs\n--- a/b.rs\n+++ b/b.rs\n-y\n+z\n".to_string(),
        };
        let sections = block.sections();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].path, "a.rs");
        assert_eq!(sections[0].removed, vec!["x"]);
        assert_eq!(sections[1].path, "b.rs");
        assert_eq!(sections[1].removed, vec!["y"]);
    }

    #[test]
    fn test_rename_and_copy_headers_are_touched_paths() {
        let rename = DiffBlock {
            index: 0,
            body: "diff --git a/src/ci.yml b/src/ci.yml\nsimilarity index 100%\nrename from src/ci.yml\nrename to .github/workflows/ci.yml\n".to_string(),
        };
        assert_eq!(rename.touched_paths(), vec!["src/ci.yml", ".github/workflows/ci.yml"]);

        let copy = DiffBlock {
            index: 0,
            body: "diff --git a/src/lib.rs b/scripts/lib.rs\nsimilarity index 90%\ncopy from src/lib.rs\ncopy to scripts/lib.rs\n--- a/src/lib.rs\n+++ b/scripts/lib.rs\n@@ -1 +1 @@\n-a\n+b\n".to_string(),
        };
        assert_eq!(copy.touched_paths(), vec!["src/lib.rs", "scripts/lib.rs"]);
    }

    #[test]
    fn test_paths_with_spaces() {
        let block = DiffBlock {
            index: 0,
            body: "diff --git a/docs/release notes.md b/docs/release notes.md\nold mode 100644\nnew mode 100755\n".to_string(),
        };
        assert_eq!(block.touched_paths(), vec!["docs/release notes.md"]);
        assert_eq!(block.sections()[0].path, "docs/release notes.md");

        let with_headers = DiffBlock {
            index: 0,
            body: "diff --git a/src/my mod.rs b/src/my mod.rs\n--- a/src/my mod.rs\n+++ b/src/my mod.rs\n@@ -1 +1 @@\n-a\n+b\n".to_string(),
        };
        assert_eq!(with_headers.touched_paths(), vec!["src/my mod.rs"]);
    }

    #[test]
    fn test_numstat_paths() {
        let output = "1\t1\tsrc/lib.rs\x000\t0\t\x00src/ci.yml\x00.github/workflows/ci.yml\x00";
        assert_eq!(
            numstat_paths(output),
            vec!["src/lib.rs", "src/ci.yml", ".github/workflows/ci.yml"]
        );
        assert!(numstat_paths("").is_empty());
    }

    #[test]
    fn test_check_path() {
        assert!(check_path("src/lib.rs").is_ok());
        assert!(check_path("/etc/passwd").is_err());
        assert!(check_path("src/../../x").is_err());
    }

    #[test]
    fn test_path_matches() {
        assert!(path_matches(".env", "config/.env"));
        assert!(path_matches("*.pem", "certs/server.pem"));
        assert!(path_matches("**/secrets/**", "app/secrets/db.txt"));
        assert!(path_matches("**/secrets/**", "secrets/db.txt"));
        assert!(path_matches(".github/workflows/", ".github/workflows/ci.yml"));
        assert!(path_matches("src/services/governance.rs", "src/services/governance.rs"));
        assert!(!path_matches("*.pem", "src/pem.rs"));
        assert!(!path_matches("src/services/governance.rs", "src/services/governance.rs.bak"));
    }

    #[test]
    fn test_cited_paths_ignore_diff_bodies_and_urls() {
        let text = format!("{OUTPUT}\nSee https://example.com/a/b.html and `tests/it.rs`.");
        assert_eq!(cited_paths(&text), vec!["src/services/governance.rs", "tests/it.rs"]);
    }
}
