//! Breakaway processes.
//!
//! A child process matching a configured pattern is allowed to leave the
//! sandbox: its subtree is not observed and none of its accesses are
//! reported. This is load-bearing for shared compilation services, which
//! outlive the pip that first spawned them and serve many pips at once.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// A pattern identifying processes allowed to break away.
///
/// The executable is matched by file name (not full path). When
/// `required_arguments` is non-empty, every listed string must appear
/// somewhere in the child's argument list (substring match, so shell `-c`
/// one-liners are coverable). Matching is case-sensitive unless configured
/// otherwise.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct BreakawayMatcher {
    pub executable: String,
    pub required_arguments: Vec<String>,
    pub case_sensitive: bool,
}

impl BreakawayMatcher {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            required_arguments: Vec::new(),
            case_sensitive: true,
        }
    }

    pub fn with_required_arguments(
        mut self,
        arguments: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.required_arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    /// Whether a process started as `executable arguments...` matches.
    pub fn matches(&self, executable: &Path, arguments: &[String]) -> bool {
        let Some(name) = executable.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };

        let name_matches = if self.case_sensitive {
            name == self.executable.as_str()
        } else {
            name.eq_ignore_ascii_case(&self.executable)
        };
        if !name_matches {
            return false;
        }

        self.required_arguments.iter().all(|required| {
            arguments.iter().any(|argument| {
                if self.case_sensitive {
                    argument.contains(required)
                } else {
                    argument
                        .to_ascii_lowercase()
                        .contains(&required.to_ascii_lowercase())
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn matches_by_file_name() {
        let matcher = BreakawayMatcher::new("sh");
        assert!(matcher.matches(&PathBuf::from("/bin/sh"), &[]));
        assert!(matcher.matches(&PathBuf::from("/usr/bin/sh"), &[]));
        assert!(!matcher.matches(&PathBuf::from("/bin/bash"), &[]));
    }

    #[test]
    fn required_arguments_must_all_appear() {
        let matcher = BreakawayMatcher::new("sh").with_required_arguments(["hi"]);
        assert!(matcher.matches(
            &PathBuf::from("/bin/sh"),
            &["-c".into(), "echo hi > /tmp/out".into()]
        ));
        assert!(!matcher.matches(&PathBuf::from("/bin/sh"), &["-c".into(), "bye".into()]));
    }

    #[test]
    fn case_sensitivity_is_configurable() {
        let sensitive = BreakawayMatcher::new("MSBuild");
        assert!(!sensitive.matches(&PathBuf::from("/tools/msbuild"), &[]));

        let insensitive = BreakawayMatcher::new("MSBuild").case_insensitive();
        assert!(insensitive.matches(&PathBuf::from("/tools/msbuild"), &[]));
    }
}
