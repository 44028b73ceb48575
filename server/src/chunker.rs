//! Content-addressed chunking: AST-aware where a grammar is available
//! (feature `treesitter`), sliding line windows everywhere else.
//!
//! Chunk ids are stable across reindex: same bytes at the same ordinal yield
//! the same id, which keeps unchanged files from thrashing the backends.

use regex::Regex;
use std::sync::OnceLock;

use crate::types::{chunk_id, Chunk};

/// Chunking knobs. Targets are characters, not tokens — the embedding
/// tokenizer truncates independently.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Window target for the line-based chunker.
    pub target_chars: usize,
    /// Overlap carried between adjacent windows so boundary tokens stay
    /// retrievable from at least one chunk.
    pub overlap_chars: usize,
    /// Semantic nodes larger than this are split at sub-boundaries.
    pub soft_ceiling: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        ChunkerConfig { target_chars: 1000, overlap_chars: 200, soft_ceiling: 2400 }
    }
}

// ---------------------------------------------------------------------------
// Binary & language sniffing
// ---------------------------------------------------------------------------

/// Heuristic binary check: a NUL byte anywhere in the first 8 KiB.
pub fn is_probably_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8 * 1024).any(|&b| b == 0)
}

/// Infer the language tag from the file extension.
pub fn language_for_path(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext {
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "py" | "pyi" => "python",
        "go" => "go",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" | "hh" | "hxx" => "cpp",
        "java" => "java",
        "md" | "markdown" => "markdown",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "sh" | "bash" => "shell",
        _ => "text",
    }
}

// ---------------------------------------------------------------------------
// Spans (0-based inclusive line ranges)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

fn span_chars(lines: &[&str], span: Span) -> usize {
    lines[span.start..=span.end].iter().map(|l| l.len() + 1).sum()
}

/// Sliding line windows over `range`: ~target chars per window with ~overlap
/// chars shared between neighbors.
fn window_spans(lines: &[&str], range: Span, cfg: &ChunkerConfig) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut i = range.start;
    while i <= range.end {
        let mut j = i;
        let mut size = 0usize;
        while j <= range.end {
            let line_len = lines[j].len() + 1;
            if size > 0 && size + line_len > cfg.target_chars {
                break;
            }
            size += line_len;
            j += 1;
        }
        let end = j.saturating_sub(1).max(i);
        spans.push(Span { start: i, end });
        if end >= range.end {
            break;
        }
        // Back up into the window until ~overlap chars are repeated.
        let mut k = j;
        let mut carried = 0usize;
        while k > i + 1 && carried < cfg.overlap_chars {
            k -= 1;
            carried += lines[k].len() + 1;
        }
        i = k.max(i + 1);
    }
    spans
}

fn split_oversized(lines: &[&str], span: Span, cfg: &ChunkerConfig) -> Vec<Span> {
    if span_chars(lines, span) <= cfg.soft_ceiling {
        vec![span]
    } else {
        window_spans(lines, span, cfg)
    }
}

// ---------------------------------------------------------------------------
// Symbol extraction (regex fallback; AST names when the grammar is present)
// ---------------------------------------------------------------------------

fn symbol_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\b(?:function|fn|def|func)\s+([A-Za-z_][A-Za-z0-9_]*)",
            r"\b(?:class|struct|enum|trait|interface|impl|type)\s+([A-Za-z_][A-Za-z0-9_]*)",
            r"\b(?:const|static)\s+([A-Za-z_][A-Za-z0-9_]*)\s*[:=]",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static symbol pattern"))
        .collect()
    })
}

/// Declaration names appearing in `text`, in order of first occurrence.
pub fn extract_symbols(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for pattern in symbol_patterns() {
        for cap in pattern.captures_iter(text) {
            if let Some(name) = cap.get(1) {
                if seen.insert(name.as_str().to_string()) {
                    out.push(name.as_str().to_string());
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// AST pass (feature `treesitter`)
// ---------------------------------------------------------------------------

#[cfg(feature = "treesitter")]
mod ast {
    use super::Span;
    use tree_sitter::{Language, Parser};

    fn language_for_ext(ext: &str) -> Option<Language> {
        match ext {
            "rs" => Some(tree_sitter_rust::LANGUAGE.into()),
            "ts" | "tsx" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            "js" | "jsx" | "mjs" | "cjs" => Some(tree_sitter_javascript::LANGUAGE.into()),
            "py" | "pyi" => Some(tree_sitter_python::LANGUAGE.into()),
            "go" => Some(tree_sitter_go::LANGUAGE.into()),
            "c" | "h" => Some(tree_sitter_c::LANGUAGE.into()),
            "cpp" | "cc" | "cxx" | "hpp" | "hh" | "hxx" => Some(tree_sitter_cpp::LANGUAGE.into()),
            "java" => Some(tree_sitter_java::LANGUAGE.into()),
            _ => None,
        }
    }

    fn is_semantic_node(kind: &str) -> bool {
        matches!(
            kind,
            "function_item"
                | "struct_item"
                | "enum_item"
                | "trait_item"
                | "impl_item"
                | "function_declaration"
                | "class_declaration"
                | "interface_declaration"
                | "method_definition"
                | "function_definition"
                | "class_definition"
                | "method_declaration"
                | "class_specifier"
                | "struct_specifier"
                | "enum_declaration"
        )
    }

    /// Segment the file at top-level semantic node boundaries. Lines between
    /// nodes (imports, comments) become their own spans so every byte stays
    /// retrievable. Returns `None` when no grammar matches or nothing parses.
    pub fn semantic_spans(content: &str, ext: &str, total_lines: usize) -> Option<Vec<Span>> {
        let lang = language_for_ext(ext)?;
        let mut parser = Parser::new();
        parser.set_language(&lang).ok()?;
        let tree = parser.parse(content, None)?;
        let root = tree.root_node();

        let mut spans = Vec::new();
        let mut cursor_line = 0usize;
        let mut walker = root.walk();
        for child in root.children(&mut walker) {
            // Unwrap export wrappers so the exported declaration segments.
            let node = if child.kind() == "export_statement" {
                child.named_child(0).unwrap_or(child)
            } else {
                child
            };
            if !is_semantic_node(node.kind()) {
                continue;
            }
            let start = child.start_position().row;
            let end = child.end_position().row;
            if start > cursor_line {
                spans.push(Span { start: cursor_line, end: start - 1 });
            }
            spans.push(Span { start, end: end.min(total_lines.saturating_sub(1)) });
            cursor_line = end + 1;
        }
        if spans.is_empty() {
            return None;
        }
        if cursor_line < total_lines {
            spans.push(Span { start: cursor_line, end: total_lines - 1 });
        }
        Some(spans)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Chunk one file into an ordered sequence. `content_hash` is the document
/// fingerprint feeding the stable chunk ids. Chunks that are empty after
/// trimming are discarded and never reach a backend.
pub fn chunk_file(
    store: &str,
    path: &str,
    content: &str,
    content_hash: &str,
    cfg: &ChunkerConfig,
) -> Vec<Chunk> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }
    let full = Span { start: 0, end: lines.len() - 1 };
    let language = language_for_path(path);

    #[cfg(feature = "treesitter")]
    let base_spans = {
        let ext = path.rsplit('.').next().unwrap_or("");
        ast::semantic_spans(content, ext, lines.len())
            .unwrap_or_else(|| window_spans(&lines, full, cfg))
    };
    #[cfg(not(feature = "treesitter"))]
    let base_spans = window_spans(&lines, full, cfg);

    let mut chunks = Vec::new();
    let mut ordinal = 0usize;
    for span in base_spans.into_iter().flat_map(|s| split_oversized(&lines, s, cfg)) {
        let text = lines[span.start..=span.end].join("\n");
        if text.trim().is_empty() {
            continue;
        }
        let symbols = extract_symbols(&text);
        chunks.push(Chunk {
            id: chunk_id(store, path, ordinal, content_hash),
            path: path.to_string(),
            language: language.to_string(),
            start_line: span.start + 1,
            end_line: span.end + 1,
            text,
            symbols,
            ordinal,
            content_hash: content_hash.to_string(),
        });
        ordinal += 1;
    }
    chunks
}
