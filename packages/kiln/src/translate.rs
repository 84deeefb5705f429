//! Directory translations.
//!
//! A [`DirectoryTranslator`] holds an ordered set of `source → target`
//! prefix rules (junction and subst rewrites, bind mounts, and the like) and
//! rewrites any path whose prefix matches. Translations apply uniformly:
//! fingerprint inputs, sandbox access normalization, and materialization all
//! see translated paths, so a path only ever has one spelling inside the
//! engine.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use color_eyre::{Result, eyre::bail};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

/// One prefix rewrite rule.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct Translation {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl Translation {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// An ordered set of prefix rewrite rules, validated and frozen.
///
/// Build with [`DirectoryTranslator::seal`]; an unsealed rule list is just a
/// `Vec<Translation>`. Sealing validates that the rule set is acyclic, since
/// a cycle (`/a → /b`, `/b → /a`) would make the canonical spelling of a
/// path depend on how many times it crossed the boundary.
#[derive(Clone, Debug, Default)]
pub struct DirectoryTranslator {
    /// Rules sorted by source-prefix length descending, so the longest match
    /// wins without a second pass.
    rules: Vec<Translation>,
}

impl DirectoryTranslator {
    /// Validate the rules and freeze them into a translator.
    ///
    /// ## Errors
    ///
    /// Fails when the rule set contains a cycle; the error lists the
    /// offending chain in source-prefix order.
    #[instrument(skip(rules))]
    pub fn seal(rules: impl IntoIterator<Item = Translation>) -> Result<Self> {
        let mut rules = rules.into_iter().collect::<Vec<_>>();

        detect_cycle(&rules)?;

        rules.sort_by(|a, b| {
            let a_len = a.source.as_os_str().len();
            let b_len = b.source.as_os_str().len();
            b_len.cmp(&a_len).then_with(|| a.source.cmp(&b.source))
        });
        trace!(rules = rules.len(), "sealed directory translator");
        Ok(Self { rules })
    }

    /// An empty translator; every path passes through unchanged.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse translations from the environment injection format:
    /// `src|tgt;src|tgt;…`. Empty segments are ignored.
    #[instrument]
    pub fn parse_injection(value: &str) -> Result<Vec<Translation>> {
        let mut rules = Vec::new();
        for segment in value.split(';').filter(|s| !s.is_empty()) {
            let Some((source, target)) = segment.split_once('|') else {
                bail!("malformed directory translation segment: {segment:?}");
            };
            if source.is_empty() || target.is_empty() {
                bail!("empty side in directory translation segment: {segment:?}");
            }
            rules.push(Translation::new(source, target));
        }
        Ok(rules)
    }

    /// Rewrite the path using the longest matching source prefix.
    ///
    /// Malformed inputs (`\??\`, `\\?\`, bare drive letters, empty paths)
    /// pass through unchanged: they cannot carry a prefix match and the
    /// callers that produce them handle them downstream.
    pub fn translate(&self, path: &Path) -> PathBuf {
        if is_untranslatable(path) {
            return path.to_path_buf();
        }

        for rule in &self.rules {
            if let Ok(suffix) = path.strip_prefix(&rule.source) {
                let translated = if suffix.as_os_str().is_empty() {
                    rule.target.clone()
                } else {
                    rule.target.join(suffix)
                };
                return translated;
            }
        }
        path.to_path_buf()
    }

    /// Whether any rule applies to the path.
    pub fn applies_to(&self, path: &Path) -> bool {
        !is_untranslatable(path) && self.rules.iter().any(|r| path.starts_with(&r.source))
    }

    /// The frozen rules, longest source prefix first.
    pub fn rules(&self) -> &[Translation] {
        &self.rules
    }
}

/// Paths the translator refuses to touch.
fn is_untranslatable(path: &Path) -> bool {
    let raw = path.as_os_str();
    if raw.is_empty() {
        return true;
    }
    let lossy = path.to_string_lossy();
    if lossy.starts_with(r"\??\") || lossy.starts_with(r"\\?\") {
        return true;
    }
    // Bare drive letters ("C:"), which are neither relative nor rooted.
    if lossy.len() == 2 && lossy.ends_with(':') {
        return true;
    }
    false
}

/// Reject rule sets whose source→target edges form a cycle.
///
/// Cycles are detected on prefix reachability: an edge exists from rule A to
/// rule B when A's target lands inside (or at) B's source. DFS with the
/// usual three colors; on a back edge the full chain is reported in
/// source-prefix order.
fn detect_cycle(rules: &[Translation]) -> Result<()> {
    #[derive(Copy, Clone, Eq, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    // A rule may point at its own source (a self-loop), so i == j edges are
    // deliberately included.
    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, a) in rules.iter().enumerate() {
        for (j, b) in rules.iter().enumerate() {
            if a.target.starts_with(&b.source) {
                adjacency.entry(i).or_default().push(j);
            }
        }
    }

    let mut colors = vec![Color::White; rules.len()];
    let mut stack = Vec::new();

    fn visit(
        node: usize,
        rules: &[Translation],
        adjacency: &HashMap<usize, Vec<usize>>,
        colors: &mut [Color],
        stack: &mut Vec<usize>,
    ) -> Result<()> {
        colors[node] = Color::Gray;
        stack.push(node);

        for &next in adjacency.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
            match colors[next] {
                Color::Black => {}
                Color::White => visit(next, rules, adjacency, colors, stack)?,
                Color::Gray => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut chain = stack[start..].to_vec();
                    chain.sort_by(|&a, &b| rules[a].source.cmp(&rules[b].source));
                    let rendered = chain
                        .iter()
                        .map(|&n| {
                            format!("{} -> {}", rules[n].source.display(), rules[n].target.display())
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    bail!("cycle in directory translations: {rendered}");
                }
            }
        }

        stack.pop();
        colors[node] = Color::Black;
        Ok(())
    }

    for node in 0..rules.len() {
        if colors[node] == Color::White {
            visit(node, rules, &adjacency, &mut colors, &mut stack)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use simple_test_case::test_case;

    fn sealed(rules: &[(&str, &str)]) -> DirectoryTranslator {
        DirectoryTranslator::seal(rules.iter().map(|(s, t)| Translation::new(s, t))).unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let translator = sealed(&[("/mnt", "/data"), ("/mnt/special", "/fast")]);
        pretty_assert_eq!(
            translator.translate(Path::new("/mnt/special/file")),
            PathBuf::from("/fast/file")
        );
        pretty_assert_eq!(
            translator.translate(Path::new("/mnt/other/file")),
            PathBuf::from("/data/other/file")
        );
    }

    #[test]
    fn unmatched_paths_pass_through() {
        let translator = sealed(&[("/mnt", "/data")]);
        pretty_assert_eq!(
            translator.translate(Path::new("/usr/bin/cc")),
            PathBuf::from("/usr/bin/cc")
        );
    }

    #[test_case(r"\??\C:\x"; "nt_object_prefix")]
    #[test_case(r"\\?\C:\x"; "verbatim_prefix")]
    #[test_case("C:"; "bare_drive_letter")]
    #[test_case(""; "empty")]
    #[test]
    fn malformed_inputs_pass_through(input: &str) {
        let translator = sealed(&[("/mnt", "/data")]);
        pretty_assert_eq!(
            translator.translate(Path::new(input)),
            PathBuf::from(input)
        );
    }

    #[test]
    fn cycle_is_rejected_with_chain() {
        let err = DirectoryTranslator::seal([
            Translation::new("/a", "/b/inner"),
            Translation::new("/b", "/a"),
        ])
        .unwrap_err();
        let rendered = format!("{err}");
        assert!(rendered.contains("cycle in directory translations"), "{rendered}");
        assert!(rendered.contains("/a -> /b/inner"), "{rendered}");
        assert!(rendered.contains("/b -> /a"), "{rendered}");
    }

    #[test]
    fn self_cycle_is_rejected() {
        // A rule whose target lands back inside its own source never
        // stabilizes.
        let err =
            DirectoryTranslator::seal([Translation::new("/a", "/a/sub")]).unwrap_err();
        assert!(format!("{err}").contains("cycle in directory translations"));
    }

    #[test]
    fn chain_without_cycle_is_accepted() {
        let translator = sealed(&[("/a", "/b"), ("/b", "/c")]);
        // Translation is a single rewrite, not a fixpoint.
        pretty_assert_eq!(
            translator.translate(Path::new("/a/x")),
            PathBuf::from("/b/x")
        );
    }

    #[test]
    fn injection_format_parses() {
        let rules =
            DirectoryTranslator::parse_injection("/mnt|/data;/opt|/tools;").unwrap();
        pretty_assert_eq!(
            rules,
            vec![
                Translation::new("/mnt", "/data"),
                Translation::new("/opt", "/tools"),
            ]
        );
    }

    #[test]
    fn injection_format_rejects_malformed_segment() {
        assert!(DirectoryTranslator::parse_injection("/mnt-/data").is_err());
        assert!(DirectoryTranslator::parse_injection("|/data").is_err());
    }
}
