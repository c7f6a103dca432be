//! Source snapshot backed by local checkouts.
//!
//! Repositories live under `{root}/{owner}/{repo}`, checked out at the head
//! being analysed by whatever keeps the workspace in sync. The requested
//! commit is therefore informational only.
//!
//! Symbols are found with a line-oriented declaration scan that recognises
//! the common keywords of Rust, Python, Go, and JavaScript/TypeScript. It is
//! a heuristic, not a parser: good enough for impact analysis, which only
//! needs names, rough complexity, and intra-file call edges.
//!
//! CODEOWNERS is read from the first of the locations GitHub consults.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use pipeline::{
    CommitSha, ComplexityScore, DependencyError, DependencyName, Embedding, FilePath,
    RepositoryName, SourceSnapshot, SymbolFacts, SymbolName, SymbolRef, SymbolType,
    CODEOWNERS_LOCATIONS,
};
use tracing::debug;

/// Size of the hashed bag-of-tokens embedding.
pub const EMBEDDING_DIMENSIONS: usize = 64;

/// [`SourceSnapshot`] reading files from a workspace directory.
#[derive(Debug, Clone)]
pub struct WorkspaceSnapshot {
    root: PathBuf,
    dependency: DependencyName,
}

impl WorkspaceSnapshot {
    pub fn new(dependency: DependencyName, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dependency,
        }
    }

    fn resolve(&self, repository: &RepositoryName, path: &FilePath) -> Result<PathBuf, DependencyError> {
        let relative = Path::new(path.as_str());
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(DependencyError::permanent(
                &self.dependency,
                format!("path '{path}' escapes the repository root"),
            ));
        }
        Ok(self
            .root
            .join(repository.owner())
            .join(repository.short_name())
            .join(relative))
    }
}

#[async_trait]
impl SourceSnapshot for WorkspaceSnapshot {
    async fn symbols(
        &self,
        repository: &RepositoryName,
        sha: Option<&CommitSha>,
        path: &FilePath,
    ) -> Result<Vec<SymbolFacts>, DependencyError> {
        let full_path = self.resolve(repository, path)?;
        let source = match tokio::fs::read_to_string(&full_path).await {
            Ok(source) => source,
            // Deleted files and binaries have no symbols.
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::InvalidData) => {
                return Ok(Vec::new())
            }
            Err(e) => {
                return Err(DependencyError::transient(
                    &self.dependency,
                    format!("reading {}: {e}", full_path.display()),
                ))
            }
        };
        let symbols = scan_symbols(path, &source);
        debug!(
            repository = %repository,
            path = %path,
            sha = sha.map(|s| s.as_str()).unwrap_or("HEAD"),
            symbols = symbols.len(),
            "Scanned source file"
        );
        Ok(symbols)
    }

    async fn code_owners(
        &self,
        repository: &RepositoryName,
        _sha: Option<&CommitSha>,
    ) -> Result<Option<String>, DependencyError> {
        for location in CODEOWNERS_LOCATIONS {
            let Some(path) = FilePath::new(location) else {
                continue;
            };
            let full_path = self.resolve(repository, &path)?;
            match tokio::fs::read_to_string(&full_path).await {
                Ok(text) => {
                    debug!(repository = %repository, path = location, "Read CODEOWNERS");
                    return Ok(Some(text));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(DependencyError::transient(
                        &self.dependency,
                        format!("reading {}: {e}", full_path.display()),
                    ))
                }
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Declaration scan
// ---------------------------------------------------------------------------

const MODIFIERS: &[&str] = &[
    "pub", "pub(crate)", "pub(super)", "async", "unsafe", "const", "extern", "export",
    "default", "static", "public", "private", "protected", "abstract",
];

const BRANCH_WORDS: &[&str] = &[
    "if", "elif", "for", "while", "loop", "match", "case", "catch", "except",
];

struct Declaration {
    line: usize,
    name: String,
    symbol_type: SymbolType,
}

fn declaration_keyword(word: &str, indented: bool) -> Option<SymbolType> {
    match word {
        "fn" | "def" | "func" | "function" => Some(if indented {
            SymbolType::Method
        } else {
            SymbolType::Function
        }),
        "struct" | "enum" | "trait" | "class" | "interface" => Some(SymbolType::Type),
        "mod" => Some(SymbolType::Module),
        _ => None,
    }
}

fn identifier_prefix(text: &str) -> &str {
    let end = text
        .char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}

fn parse_declaration(line_no: usize, line: &str) -> Option<Declaration> {
    let trimmed = line.trim_start();
    let indented = trimmed.len() != line.len();
    let mut rest = trimmed;
    loop {
        let (word, tail) = rest.split_once(char::is_whitespace)?;
        if let Some(mut symbol_type) = declaration_keyword(word, indented) {
            let mut tail = tail.trim_start();
            // Go method receiver: `func (s *Server) Name(`.
            if word == "func" && tail.starts_with('(') {
                tail = tail.split_once(')')?.1.trim_start();
                symbol_type = SymbolType::Method;
            }
            let name = identifier_prefix(tail);
            if name.is_empty() {
                return None;
            }
            return Some(Declaration {
                line: line_no,
                name: name.to_string(),
                symbol_type,
            });
        }
        if !MODIFIERS.contains(&word) {
            return None;
        }
        rest = tail.trim_start();
    }
}

fn tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
}

/// One plus the number of branch points.
fn complexity_of(body: &str) -> Option<ComplexityScore> {
    let branches = tokens(body).filter(|t| BRANCH_WORDS.contains(t)).count()
        + body.matches("&&").count()
        + body.matches("||").count();
    ComplexityScore::new(1.0 + branches as f64)
}

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Deterministic hashed bag-of-tokens embedding, L2-normalised.
fn embed(body: &str) -> Option<Embedding> {
    let mut vector = vec![0.0f32; EMBEDDING_DIMENSIONS];
    for token in tokens(body) {
        let token = token.to_ascii_lowercase();
        let hash = fnv1a(&token);
        let slot = (hash % EMBEDDING_DIMENSIONS as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return None;
    }
    vector.iter_mut().for_each(|v| *v /= norm);
    Embedding::new(vector)
}

/// Scans one file's source for symbol declarations.
///
/// Each symbol's body runs from its declaration to the next one. Calls are
/// recorded for other symbols of the same file that appear followed by `(`.
pub fn scan_symbols(path: &FilePath, source: &str) -> Vec<SymbolFacts> {
    let lines: Vec<&str> = source.lines().collect();
    let declarations: Vec<Declaration> = lines
        .iter()
        .enumerate()
        .filter_map(|(i, line)| parse_declaration(i, line))
        .collect();

    let mut symbols: Vec<SymbolFacts> = Vec::with_capacity(declarations.len());
    for (index, decl) in declarations.iter().enumerate() {
        let end = declarations
            .get(index + 1)
            .map(|next| next.line)
            .unwrap_or(lines.len());
        let body = lines[decl.line..end].join("\n");
        // The declaration line itself names the symbol; only look past it
        // for calls.
        let call_region = lines[(decl.line + 1).min(end)..end].join("\n");

        let (Some(name), Some(complexity)) =
            (SymbolName::new(decl.name.clone()), complexity_of(&body))
        else {
            continue;
        };
        if symbols.iter().any(|s| s.name == name) {
            continue;
        }

        let mut calls: Vec<SymbolRef> = Vec::new();
        for other in &declarations {
            if other.name == decl.name || calls.iter().any(|c| c.name.as_str() == other.name) {
                continue;
            }
            if call_region.contains(&format!("{}(", other.name)) {
                if let Some(callee) = SymbolName::new(other.name.clone()) {
                    calls.push(SymbolRef {
                        name: callee,
                        file_path: path.clone(),
                    });
                }
            }
        }

        symbols.push(SymbolFacts {
            name,
            file_path: path.clone(),
            symbol_type: decl.symbol_type,
            complexity,
            calls,
            embedding: embed(&body),
        });
    }
    symbols
}
