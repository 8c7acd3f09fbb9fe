//! Virtual path algebra
// (c) 2024 Ross Younger
//!
//! Virtual paths are what the authenticated user sees: absolute,
//! slash-separated, independent of any backend's real layout. These
//! helpers keep them in canonical form (leading `/`, no `.` or `..`
//! segments, no trailing slash except for the root itself).

/// Canonicalizes a virtual path. Relative input is taken as relative to
/// the root; `..` never escapes above `/`.
#[must_use]
pub fn clean(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => (),
            ".." => {
                let _ = stack.pop();
            }
            s => stack.push(s),
        }
    }
    if stack.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", stack.join("/"))
    }
}

/// Joins one element onto a virtual path and canonicalizes.
#[must_use]
pub fn join(base: &str, elem: &str) -> String {
    clean(&format!("{base}/{elem}"))
}

/// The parent of a virtual path; the root is its own parent.
#[must_use]
pub fn parent(path: &str) -> String {
    join(path, "..")
}

/// The last element of a virtual path; `/` for the root.
#[must_use]
pub fn base(path: &str) -> String {
    let cleaned = clean(path);
    match cleaned.rsplit('/').next() {
        Some("") | None => "/".to_string(),
        Some(name) => name.to_string(),
    }
}
