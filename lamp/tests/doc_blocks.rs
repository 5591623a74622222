//! Fenced blocks in doc comments must stay inside the doc comment.
//!
//! A plain `//` line in the middle of a `///` block ends the doc comment,
//! and rustdoc then renders an empty code block.

use std::fs;
use std::path::Path;

const DOC_PREFIXES: [&str; 2] = ["///", "//!"];

/// Lines inside a fenced doc block that lost their doc prefix.
fn broken_lines(source: &str) -> Vec<(usize, String)> {
    let mut open: Option<&str> = None;
    let mut broken = Vec::new();
    for (n, line) in source.lines().enumerate() {
        let t = line.trim_start();
        let fence = DOC_PREFIXES
            .into_iter()
            .find(|p| t.strip_prefix(p).is_some_and(|rest| rest.trim_start().starts_with("```")));
        match (open, fence) {
            (None, Some(p)) => open = Some(p),
            (Some(p), Some(q)) if p == q => open = None,
            (Some(p), _) if !t.starts_with(p) => broken.push((n + 1, line.to_string())),
            _ => {}
        }
    }
    broken
}

#[test]
fn detector_flags_a_plain_comment_inside_a_block() {
    let src = "/// ```text\n/// a\n// b\n/// ```\n";
    assert_eq!(broken_lines(src), vec![(3, "// b".to_string())]);
    assert!(broken_lines("//! ```text\n//! a\n//! ```\n").is_empty());
}

#[test]
fn doc_diagrams_are_whole_doc_comments() {
    let src_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    let mut failures = Vec::new();
    for entry in fs::read_dir(&src_dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) != Some("rs") {
            continue;
        }
        let source = fs::read_to_string(&path).unwrap();
        for (line, text) in broken_lines(&source) {
            failures.push(format!("{}:{line}: {text}", path.display()));
        }
    }
    assert!(failures.is_empty(), "broken doc blocks:\n{}", failures.join("\n"));
}
