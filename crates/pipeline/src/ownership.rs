//! CODEOWNERS parsing and path ownership.
//!
//! A CODEOWNERS file is a list of `pattern owner...` rules. For any path the
//! **last** matching rule wins, and a matching rule without owners leaves the
//! path unowned. Patterns follow the gitignore conventions GitHub uses:
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `*.rs` | any `.rs` file at any depth |
//! | `docs/` | everything below any `docs` directory |
//! | `/build/` | everything below the root `build` directory |
//! | `src/api` | the root `src/api` file or directory |
//! | `docs/*` | direct children of the root `docs` only |

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::FilePath;

/// Locations GitHub reads a CODEOWNERS file from, in lookup order.
pub const CODEOWNERS_LOCATIONS: [&str; 3] = [".github/CODEOWNERS", "CODEOWNERS", "docs/CODEOWNERS"];

/// Whether an owner handle names a person or a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    User,
    Team,
}

impl OwnerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OwnerKind::User => "user",
            OwnerKind::Team => "team",
        }
    }
}

/// An owner handle with the leading `@` removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub handle: String,
    pub kind: OwnerKind,
}

impl Owner {
    /// Normalises a raw handle (`@org/team`, `@user`, `user@example.com`).
    /// Returns `None` for an empty handle.
    pub fn parse(raw: &str) -> Option<Self> {
        let handle = raw.trim().trim_start_matches('@');
        if handle.is_empty() {
            return None;
        }
        let kind = if handle.contains('/') {
            OwnerKind::Team
        } else {
            OwnerKind::User
        };
        Some(Self {
            handle: handle.to_string(),
            kind,
        })
    }
}

/// The owners of one changed file and the rule that assigned them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOwnership {
    pub path: FilePath,
    pub pattern: String,
    pub owners: Vec<Owner>,
}

/// One parsed CODEOWNERS line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipRule {
    pub pattern: String,
    pub owners: Vec<Owner>,
}

/// A compiled CODEOWNERS file.
#[derive(Debug, Clone)]
pub struct CodeOwners {
    rules: Vec<(GlobSet, OwnershipRule)>,
    rejected: Vec<String>,
}

impl CodeOwners {
    /// Parses CODEOWNERS text. Blank lines and comments are skipped; a
    /// pattern that does not compile is recorded in [`rejected`](Self::rejected)
    /// and otherwise ignored.
    pub fn parse(text: &str) -> Self {
        let mut rules = Vec::new();
        let mut rejected = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let Some(pattern) = tokens.next() else {
                continue;
            };
            let owners: Vec<Owner> = tokens
                .take_while(|t| !t.starts_with('#'))
                .filter_map(Owner::parse)
                .collect();
            match compile(pattern) {
                Some(matcher) => rules.push((
                    matcher,
                    OwnershipRule {
                        pattern: pattern.to_string(),
                        owners,
                    },
                )),
                None => rejected.push(pattern.to_string()),
            }
        }
        Self { rules, rejected }
    }

    /// Number of usable rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Patterns that could not be compiled.
    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }

    /// The last rule matching `path`, if any.
    pub fn rule_for(&self, path: &FilePath) -> Option<&OwnershipRule> {
        let path = path.as_str().trim_start_matches('/');
        self.rules
            .iter()
            .rev()
            .find(|(matcher, _)| matcher.is_match(path))
            .map(|(_, rule)| rule)
    }

    /// Ownership of every path in `paths` that resolves to at least one owner.
    pub fn resolve<'a>(&self, paths: impl IntoIterator<Item = &'a FilePath>) -> Vec<FileOwnership> {
        paths
            .into_iter()
            .filter_map(|path| {
                let rule = self.rule_for(path)?;
                (!rule.owners.is_empty()).then(|| FileOwnership {
                    path: path.clone(),
                    pattern: rule.pattern.clone(),
                    owners: rule.owners.clone(),
                })
            })
            .collect()
    }
}

/// Translates one CODEOWNERS pattern into the globs it stands for.
fn globs(pattern: &str) -> Vec<String> {
    let directory_only = pattern.ends_with('/');
    let trimmed = pattern.trim_end_matches('/');
    let anchored = trimmed.starts_with('/') || trimmed.trim_start_matches('/').contains('/');
    let trimmed = trimmed.trim_start_matches('/');
    if trimmed.is_empty() {
        return vec!["**".to_string()];
    }

    let base = if anchored {
        trimmed.to_string()
    } else {
        format!("**/{trimmed}")
    };
    let descendants = format!("{base}/**");
    if directory_only {
        vec![descendants]
    } else if trimmed.ends_with("/*") {
        vec![base]
    } else {
        vec![base, descendants]
    }
}

fn compile(pattern: &str) -> Option<GlobSet> {
    let mut set = GlobSetBuilder::new();
    for glob in globs(pattern) {
        set.add(GlobBuilder::new(&glob).literal_separator(true).build().ok()?);
    }
    set.build().ok()
}
