//! N-way text merge through a throwaway git repository.
//!
//! The vanilla text is committed on a `vanilla` branch, every differing mod gets its own
//! branch off that commit, and the mod branches are merged back one after another in
//! increasing mod number with `-X theirs`, so on overlapping edits the later (higher
//! numbered) mod wins. Conflict markers that survive a merge are resolved with the same
//! rule, except that an empty incoming side never replaces a non-empty one.
//!
//! Whenever git is missing, times out, fails, or produces an empty result, the merge
//! falls back to taking the highest numbered mod's text verbatim and reports which
//! mods' edits were dropped. The temporary repository is always deleted.

use crate::error::{Error, Result};
use crate::layout::SourceId;
use crate::tool::{ToolInvocation, ToolOutput, ToolRunner};
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::Arc;
use std::time::Duration;

const ASSET_FILE: &str = "asset.txt";
const BASE_BRANCH: &str = "vanilla";

/// How a merged text was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Every head was merged by git.
    ThreeWay,
    /// Highest numbered head taken verbatim.
    HighestWins,
}

/// Result of [`GitService::merge_text`].
#[derive(Debug, Clone)]
pub struct TextMergeOutcome {
    pub text: String,
    pub strategy: MergeStrategy,
    /// Mods whose edits are not part of `text` (only non-empty on fallback).
    pub dropped: Vec<SourceId>,
}

/// Runs merges with the configured `git` executable.
#[derive(Clone)]
pub struct GitService {
    runner: Arc<dyn ToolRunner>,
    program: String,
    timeout: Duration,
}

impl GitService {
    pub fn new(runner: Arc<dyn ToolRunner>, program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            program: program.into(),
            timeout,
        }
    }

    /// Whether the git executable can be started at all.
    pub fn is_available(&self) -> bool {
        self.git(None, &["--version"])
            .map(|o| o.success())
            .unwrap_or(false)
    }

    /// Merge `heads` (mod slot, full text) into `ancestor`.
    ///
    /// `heads` may be given in any order; they are applied in increasing mod number.
    /// Never fails: every problem degrades to the highest-numbered-wins fallback.
    pub fn merge_text(
        &self,
        asset: &str,
        ancestor: &str,
        heads: &[(SourceId, String)],
    ) -> TextMergeOutcome {
        let mut heads: Vec<&(SourceId, String)> = heads.iter().collect();
        heads.sort_by_key(|(source, _)| *source);

        match heads.as_slice() {
            [] => {
                return TextMergeOutcome {
                    text: ancestor.to_string(),
                    strategy: MergeStrategy::ThreeWay,
                    dropped: Vec::new(),
                }
            }
            [(_, only)] => {
                return TextMergeOutcome {
                    text: only.clone(),
                    strategy: MergeStrategy::ThreeWay,
                    dropped: Vec::new(),
                }
            }
            _ => {}
        }

        match self.merge_in_temp_repo(ancestor, &heads) {
            Ok(text) if !text.trim().is_empty() || heads.iter().all(|(_, t)| t.trim().is_empty()) => {
                TextMergeOutcome {
                    text,
                    strategy: MergeStrategy::ThreeWay,
                    dropped: Vec::new(),
                }
            }
            Ok(_) => {
                tracing::warn!("Git merge of '{}' produced empty output", asset);
                highest_wins(asset, &heads)
            }
            Err(e) => {
                tracing::warn!("Git merge of '{}' failed: {}", asset, e);
                highest_wins(asset, &heads)
            }
        }
    }

    fn merge_in_temp_repo(&self, ancestor: &str, heads: &[&(SourceId, String)]) -> Result<String> {
        let temp = tempfile::Builder::new().prefix("xdc-merge-").tempdir()?;
        let repo = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .map_err(Error::NonUtf8Path)?;

        let result = self.run_merge(&repo, ancestor, heads);

        if let Err(e) = temp.close() {
            tracing::warn!("Failed to remove temporary merge repository {}: {}", repo, e);
        }
        result
    }

    fn run_merge(
        &self,
        repo: &Utf8Path,
        ancestor: &str,
        heads: &[&(SourceId, String)],
    ) -> Result<String> {
        let file = repo.join(ASSET_FILE);

        self.git_ok(repo, &["init", "-q"])?;
        self.git_ok(repo, &["symbolic-ref", "HEAD", "refs/heads/vanilla"])?;
        self.git_ok(repo, &["config", "user.name", "xdc"])?;
        self.git_ok(repo, &["config", "user.email", "xdc@localhost"])?;
        self.git_ok(repo, &["config", "core.autocrlf", "false"])?;
        self.git_ok(repo, &["config", "commit.gpgsign", "false"])?;

        std::fs::write(file.as_std_path(), ancestor)?;
        self.git_ok(repo, &["add", ASSET_FILE])?;
        self.git_ok(repo, &["commit", "-q", "--allow-empty", "-m", BASE_BRANCH])?;

        for (source, text) in heads {
            let branch = branch_name(*source);
            self.git_ok(repo, &["checkout", "-q", "-b", &branch, BASE_BRANCH])?;
            std::fs::write(file.as_std_path(), text)?;
            self.git_ok(repo, &["add", ASSET_FILE])?;
            self.git_ok(repo, &["commit", "-q", "--allow-empty", "-m", &branch])?;
        }

        self.git_ok(repo, &["checkout", "-q", BASE_BRANCH])?;

        for (source, _) in heads {
            let branch = branch_name(*source);
            let merged = self.git(
                Some(repo),
                &["merge", "-q", "--no-edit", "-X", "theirs", &branch],
            )?;

            let current = std::fs::read_to_string(file.as_std_path())?;
            if merged.success() && !has_conflict_markers(&current) {
                continue;
            }

            tracing::debug!("Resolving leftover conflicts after merging {}", branch);
            let resolved = resolve_conflict_markers(&current);
            if has_conflict_markers(&resolved) {
                return Err(Error::Other(format!(
                    "unresolvable conflict markers after merging {}",
                    branch
                )));
            }
            std::fs::write(file.as_std_path(), &resolved)?;
            self.git_ok(repo, &["add", ASSET_FILE])?;
            self.git_ok(
                repo,
                &["commit", "-q", "--allow-empty", "-m", &format!("resolve {}", branch)],
            )?;
        }

        let text = std::fs::read_to_string(file.as_std_path())?;
        Ok(resolve_conflict_markers(&text))
    }

    fn git(&self, cwd: Option<&Utf8Path>, args: &[&str]) -> Result<ToolOutput> {
        let mut invocation = ToolInvocation::new(&self.program)
            .args(args)
            .timeout(self.timeout);
        if let Some(cwd) = cwd {
            invocation = invocation.current_dir(cwd);
        }
        self.runner.run(&invocation)
    }

    fn git_ok(&self, cwd: &Utf8Path, args: &[&str]) -> Result<ToolOutput> {
        self.git(Some(cwd), args)?.ensure_success(&self.program)
    }
}

fn branch_name(source: SourceId) -> String {
    format!("mod{}", source.0)
}

fn highest_wins(asset: &str, heads: &[&(SourceId, String)]) -> TextMergeOutcome {
    // `heads` is sorted and has at least two entries here.
    let (winner, text) = heads[heads.len() - 1];
    let dropped: Vec<SourceId> = heads[..heads.len() - 1].iter().map(|(s, _)| *s).collect();

    tracing::warn!(
        "'{}': falling back to {} verbatim; dropped edits from {}",
        asset,
        winner,
        dropped
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    TextMergeOutcome {
        text: text.clone(),
        strategy: MergeStrategy::HighestWins,
        dropped,
    }
}

fn is_marker(line: &str, marker: &str) -> bool {
    line.starts_with(marker)
        && matches!(line[marker.len()..].chars().next(), None | Some(' ' | '\r' | '\n'))
}

pub fn has_conflict_markers(text: &str) -> bool {
    let mut open = false;
    for line in text.split_inclusive('\n') {
        if is_marker(line, "<<<<<<<") {
            open = true;
        } else if open && is_marker(line, ">>>>>>>") {
            return true;
        }
    }
    false
}

/// Replace every conflict block with its incoming side, or with the current side when
/// the incoming side is empty. Handles `diff3` style blocks (base section dropped).
pub fn resolve_conflict_markers(text: &str) -> String {
    enum Section {
        Outside,
        Ours,
        Base,
        Theirs,
    }

    let mut out = String::with_capacity(text.len());
    let mut section = Section::Outside;
    let mut ours = String::new();
    let mut theirs = String::new();
    let mut block = String::new();

    for line in text.split_inclusive('\n') {
        match section {
            Section::Outside if is_marker(line, "<<<<<<<") => {
                section = Section::Ours;
                ours.clear();
                theirs.clear();
                block.clear();
                block.push_str(line);
            }
            Section::Outside => out.push_str(line),
            Section::Ours | Section::Base if is_marker(line, "=======") => {
                section = Section::Theirs;
                block.push_str(line);
            }
            Section::Ours if is_marker(line, "|||||||") => {
                section = Section::Base;
                block.push_str(line);
            }
            Section::Ours => {
                ours.push_str(line);
                block.push_str(line);
            }
            Section::Base => block.push_str(line),
            Section::Theirs if is_marker(line, ">>>>>>>") => {
                section = Section::Outside;
                if theirs.trim().is_empty() && !ours.trim().is_empty() {
                    out.push_str(&ours);
                } else {
                    out.push_str(&theirs);
                }
            }
            Section::Theirs => {
                theirs.push_str(line);
                block.push_str(line);
            }
        }
    }

    // An unterminated block is kept as-is.
    if !matches!(section, Section::Outside) {
        out.push_str(&block);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::SystemToolRunner;

    fn service() -> GitService {
        GitService::new(Arc::new(SystemToolRunner), "git", Duration::from_secs(10))
    }

    #[test]
    fn test_resolve_prefers_incoming() {
        let text = "a\n<<<<<<< HEAD\nmine\n=======\ntheirs\n>>>>>>> mod3\nz\n";
        assert_eq!(resolve_conflict_markers(text), "a\ntheirs\nz\n");
    }

    #[test]
    fn test_resolve_never_prefers_empty_incoming() {
        let text = "<<<<<<< HEAD\nmine\n=======\n>>>>>>> mod3\n";
        assert_eq!(resolve_conflict_markers(text), "mine\n");
    }

    #[test]
    fn test_resolve_diff3_blocks() {
        let text = "<<<<<<< HEAD\nmine\n||||||| base\nold\n=======\ntheirs\n>>>>>>> m\n";
        assert_eq!(resolve_conflict_markers(text), "theirs\n");
        assert!(!has_conflict_markers(&resolve_conflict_markers(text)));
    }

    #[test]
    fn test_plain_text_untouched() {
        let text = "no conflicts here\n=======\njust a divider\n";
        assert!(!has_conflict_markers(text));
        assert_eq!(resolve_conflict_markers(text), text);
    }

    #[test]
    fn test_single_head_is_adopted() {
        let outcome = service().merge_text("a", "base\n", &[(SourceId(2), "mine\n".to_string())]);
        assert_eq!(outcome.text, "mine\n");
        assert!(outcome.dropped.is_empty());
    }

    #[test]
    fn test_missing_git_falls_back_to_highest() {
        let git = GitService::new(
            Arc::new(SystemToolRunner),
            "definitely-not-git-4c2a",
            Duration::from_secs(1),
        );
        let outcome = git.merge_text(
            "gml_Script_a.gml",
            "base\n",
            &[
                (SourceId(3), "three\n".to_string()),
                (SourceId(2), "two\n".to_string()),
            ],
        );

        assert_eq!(outcome.strategy, MergeStrategy::HighestWins);
        assert_eq!(outcome.text, "three\n");
        assert_eq!(outcome.dropped, vec![SourceId(2)]);
        assert!(!git.is_available());
    }

    /// Answers every git call except `merge`, which hangs past its time budget.
    struct StalledMerge {
        timeouts: std::sync::Mutex<Vec<Option<Duration>>>,
    }

    impl ToolRunner for StalledMerge {
        fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
            if invocation.args.first().is_some_and(|a| a == "merge") {
                self.timeouts.lock().unwrap().push(invocation.timeout);
                return Err(Error::ToolTimeout {
                    program: invocation.program_name(),
                    timeout: invocation.timeout.unwrap_or_default(),
                });
            }
            Ok(ToolOutput {
                code: Some(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    #[test]
    fn test_merge_timeout_falls_back_to_highest() {
        let runner = Arc::new(StalledMerge {
            timeouts: std::sync::Mutex::new(Vec::new()),
        });
        let git = GitService::new(runner.clone(), "git", Duration::from_secs(3));

        let outcome = git.merge_text(
            "gml_Script_a.gml",
            "base\n",
            &[
                (SourceId(2), "two\n".to_string()),
                (SourceId(4), "four\n".to_string()),
                (SourceId(3), "three\n".to_string()),
            ],
        );

        assert_eq!(outcome.strategy, MergeStrategy::HighestWins);
        assert_eq!(outcome.text, "four\n");
        assert_eq!(outcome.dropped, vec![SourceId(2), SourceId(3)]);
        assert_eq!(
            *runner.timeouts.lock().unwrap(),
            vec![Some(Duration::from_secs(3))]
        );
    }

    fn ten_lines() -> Vec<String> {
        (1..=10).map(|i| format!("line {}", i)).collect()
    }

    fn join(lines: &[String]) -> String {
        let mut s = lines.join("\n");
        s.push('\n');
        s
    }

    #[test]
    fn test_disjoint_edits_both_survive() {
        let git = service();
        if !git.is_available() {
            eprintln!("git not available, skipping");
            return;
        }

        let base = ten_lines();
        let mut a = base.clone();
        a[1] = "line 2 from mod 2".to_string();
        let mut b = base.clone();
        b[8] = "line 9 from mod 3".to_string();

        let outcome = git.merge_text(
            "gml_Script_a.gml",
            &join(&base),
            &[(SourceId(2), join(&a)), (SourceId(3), join(&b))],
        );

        assert_eq!(outcome.strategy, MergeStrategy::ThreeWay);
        assert!(outcome.text.contains("line 2 from mod 2"));
        assert!(outcome.text.contains("line 9 from mod 3"));
        assert!(!has_conflict_markers(&outcome.text));
    }

    #[test]
    fn test_same_line_edit_prefers_higher_mod() {
        let git = service();
        if !git.is_available() {
            eprintln!("git not available, skipping");
            return;
        }

        let base = ten_lines();
        let mut a = base.clone();
        a[4] = "line 5 from mod 2".to_string();
        let mut b = base.clone();
        b[4] = "line 5 from mod 4".to_string();

        let outcome = git.merge_text(
            "gml_Script_a.gml",
            &join(&base),
            &[(SourceId(4), join(&b)), (SourceId(2), join(&a))],
        );

        assert!(outcome.text.contains("line 5 from mod 4"));
        assert!(!outcome.text.contains("line 5 from mod 2"));
        assert!(!has_conflict_markers(&outcome.text));
    }
}
