//! Locates the authoritative build script for a target.
//!
//! For a target `dir/name`, candidates are considered in least-fuzzy-first
//! order: the direct sibling `name.gup`, the same script under mirrored
//! `gup/` subtrees at each ancestor, then `Gupfile` pattern matches, with the
//! number of target path components consumed by the Gupfile's directory as
//! the dominant dimension. The first candidate whose rule file exists and
//! (for Gupfiles) matches the target wins.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, trace};

use crate::io::paths::{normalize, realpath, relpath};
use crate::ops::error::{GupError, Result};
use crate::GUPFILE;

/// The canonical builder for a target. `script` is the path to the build
/// script even when the builder was obtained indirectly via a Gupfile.
#[derive(Debug, Clone)]
pub struct Builder {
    pub script: PathBuf,
    /// The target name as the script's rule sees it, relative to `basedir`.
    pub target: String,
    /// Directory the script is invoked from.
    pub basedir: PathBuf,
    /// Set when the script is itself declared as a buildable target by an
    /// exact rule in the same Gupfile.
    pub parent: Option<Box<Builder>>,
}

impl Builder {
    pub fn target_path(&self) -> PathBuf {
        self.basedir.join(&self.target)
    }

    /// Find the unique builder for `path` (which must be absolute), or
    /// `None` if the target is not buildable.
    pub fn for_target(path: &Path) -> Result<Option<Builder>> {
        for candidate in candidates(path) {
            if let Some(builder) = candidate.builder()? {
                return Ok(Some(builder));
            }
        }
        Ok(None)
    }
}

/// A potential builder location: either a `<name>.gup` script or a Gupfile,
/// possibly sited under a mirrored `gup/` subtree. It may not exist, and an
/// existing Gupfile may not contain a rule for the target.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Candidate {
    root: PathBuf,
    /// `None`: the rule file sits directly in `root`. `Some(suffix)`: it sits
    /// under `root/gup/<suffix>` (suffix may be empty).
    suffix: Option<PathBuf>,
    indirect: bool,
    /// Target name relative to the candidate's base directory, always
    /// `/`-separated for pattern matching.
    target: String,
}

impl Candidate {
    /// Path of the `.gup` script or Gupfile this candidate denotes.
    pub(crate) fn rule_file(&self) -> PathBuf {
        let mut p = self.root.clone();
        if let Some(suffix) = &self.suffix {
            p.push("gup");
            p.push(suffix);
        }
        if self.indirect {
            p.push(GUPFILE);
        } else {
            p.push(format!("{}.gup", self.target));
        }
        p
    }

    /// The directory the target is built relative to (the mirrored `gup/`
    /// component stripped back out).
    fn base_dir(&self) -> PathBuf {
        match &self.suffix {
            Some(suffix) => self.root.join(suffix),
            None => self.root.clone(),
        }
    }

    fn builder(&self) -> Result<Option<Builder>> {
        let path = self.rule_file();
        if !path.exists() {
            return Ok(None);
        }
        if path.is_dir() {
            trace!("skipping directory: {}", path.display());
            return Ok(None);
        }
        trace!("candidate exists: {}", path.display());

        let basedir = self.base_dir();
        if !self.indirect {
            if target_is_build_rule(&self.target) {
                // Gupfiles and .gup scripts can only be built via exact
                // Gupfile rules, never by a direct script
                debug!("ignoring direct builder for target {}", path.display());
                return Ok(None);
            }
            return Ok(Some(Builder {
                script: path,
                target: self.target.clone(),
                basedir,
                parent: None,
            }));
        }

        let content = fs::read_to_string(&path)?;
        let rules = parse_gupfile(&content).map_err(|reason| {
            GupError::Safe(format!("Invalid {}: {} ({})", GUPFILE, path.display(), reason))
        })?;
        trace!("Parsed gupfile: {:?}", rules);

        let exact = target_is_build_rule(&self.target);
        let mut chain = Vec::new();
        find_matching_rule(&rules, &path, &basedir, &self.target, exact, &mut chain)
    }
}

/// Whether a target name denotes part of the build system itself; such
/// targets only ever match rules exactly, so a catch-all pattern cannot
/// cannibalise scripts or Gupfiles.
fn target_is_build_rule(target: &str) -> bool {
    let name = target.rsplit('/').next().unwrap_or(target);
    name == GUPFILE || name.to_lowercase().ends_with(".gup")
}

fn find_matching_rule(
    rules: &[(String, RuleSet)],
    gupfile: &Path,
    basedir: &Path,
    target: &str,
    exact: bool,
    chain: &mut Vec<String>,
) -> Result<Option<Builder>> {
    for (script, ruleset) in rules {
        let matched = if exact {
            ruleset.matches_exactly(target)
        } else {
            ruleset.matches(target)?
        };
        if !matched {
            continue;
        }

        let base = realpath(basedir);
        let gupfile_dir = gupfile.parent().unwrap_or(Path::new("/"));

        let (script_path, parent) = if let Some(name) = script.strip_prefix('!') {
            let found = which::which(name).map_err(|_| {
                GupError::Safe(format!(
                    "Build command not found on PATH: {name} (specified in {})",
                    gupfile.display()
                ))
            })?;
            (found, None)
        } else {
            let script_path = normalize(&gupfile_dir.join(script));
            let parent = if chain.iter().any(|seen| seen == script) {
                trace!("build script rule cycle at {script}; not recursing");
                None
            } else {
                chain.push(script.clone());
                let found =
                    find_matching_rule(rules, gupfile, basedir, script, true, chain)?;
                chain.pop();
                found
            };
            if parent.is_none() && !script_path.exists() {
                return Err(GupError::Safe(format!(
                    "Build script not found: {} (specified in {})",
                    script_path.display(),
                    gupfile.display()
                )));
            }
            (script_path, parent)
        };

        let target_rel = relpath(&base.join(target), &base);
        return Ok(Some(Builder {
            script: script_path,
            target: target_rel.to_string_lossy().into_owned(),
            basedir: base,
            parent: parent.map(Box::new),
        }));
    }
    Ok(None)
}

/// All candidate rule-file locations for `path`, in priority order. `path`
/// must be absolute; its directory is not required to exist.
pub(crate) fn candidates(path: &Path) -> Vec<Candidate> {
    let abs = normalize(path);
    let dirname = abs.parent().unwrap_or(Path::new("/")).to_path_buf();
    let filename = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let comps: Vec<String> = dirname
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(n) => Some(n.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    let depth = comps.len();

    let ancestor = |levels_up: usize| -> PathBuf {
        let mut p = PathBuf::from("/");
        for c in &comps[..depth - levels_up] {
            p.push(c);
        }
        p
    };
    let span = |from: usize, to: usize| -> PathBuf { comps[from..to].iter().collect() };

    let mut out = Vec::new();

    // direct `<name>.gup` candidates, at decreasing depth of gup/ mirroring
    out.push(Candidate {
        root: dirname.clone(),
        suffix: None,
        indirect: false,
        target: filename.clone(),
    });
    for i in 0..=depth {
        out.push(Candidate {
            root: ancestor(i),
            suffix: Some(span(depth - i, depth)),
            indirect: false,
            target: filename.clone(),
        });
    }

    // Gupfile candidates; `up` consumes leading target path components
    for up in 0..=depth {
        let parent_base = ancestor(up);
        let mut target_id = String::new();
        for c in &comps[depth - up..] {
            target_id.push_str(c);
            target_id.push('/');
        }
        target_id.push_str(&filename);

        out.push(Candidate {
            root: parent_base.clone(),
            suffix: None,
            indirect: true,
            target: target_id.clone(),
        });
        for i in 0..=(depth - up) {
            out.push(Candidate {
                root: ancestor(up + i),
                suffix: Some(span(depth - up - i, depth - up)),
                indirect: true,
                target: target_id.clone(),
            });
        }
    }

    out
}

/// A Gupfile script entry's patterns, split into includes and excludes.
/// A target matches when at least one include matches and no exclude does.
#[derive(Debug)]
pub struct RuleSet {
    includes: Vec<MatchRule>,
    excludes: Vec<MatchRule>,
}

impl RuleSet {
    fn new(rules: Vec<MatchRule>) -> RuleSet {
        let (excludes, includes) = rules.into_iter().partition(|r| r.invert);
        RuleSet { includes, excludes }
    }

    pub fn matches(&self, target: &str) -> Result<bool> {
        for rule in &self.includes {
            if rule.matches(target)? {
                for exclude in &self.excludes {
                    if exclude.matches(target)? {
                        return Ok(false);
                    }
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn matches_exactly(&self, target: &str) -> bool {
        self.includes.iter().any(|r| r.text == target)
    }
}

/// One glob-style pattern: `*` matches anything except `/`, `**` matches
/// anything. Compiled to a regex on first use.
#[derive(Debug)]
pub struct MatchRule {
    text: String,
    invert: bool,
    compiled: OnceLock<std::result::Result<Regex, String>>,
}

impl MatchRule {
    fn new(text: &str) -> MatchRule {
        let invert = text.starts_with('!');
        let text = if invert { &text[1..] } else { text };
        MatchRule {
            text: text.to_string(),
            invert,
            compiled: OnceLock::new(),
        }
    }

    fn matches(&self, target: &str) -> Result<bool> {
        let compiled = self.compiled.get_or_init(|| compile_pattern(&self.text));
        match compiled {
            Ok(regex) => Ok(regex.is_match(target)),
            Err(reason) => Err(GupError::Safe(reason.clone())),
        }
    }
}

fn compile_pattern(text: &str) -> std::result::Result<Regex, String> {
    let mut pattern = String::from("^");
    let mut literal = String::new();
    let mut stars = 0usize;
    let flush_stars = |pattern: &mut String, stars: &mut usize| match *stars {
        0 => Ok(()),
        1 => {
            pattern.push_str("([^/]*)");
            *stars = 0;
            Ok(())
        }
        2 => {
            pattern.push_str("(.*)");
            *stars = 0;
            Ok(())
        }
        _ => Err(format!("Invalid pattern: {text}")),
    };
    for ch in text.chars() {
        if ch == '*' {
            if !literal.is_empty() {
                pattern.push_str(&regex::escape(&literal));
                literal.clear();
            }
            stars += 1;
        } else {
            flush_stars(&mut pattern, &mut stars)?;
            literal.push(ch);
        }
    }
    flush_stars(&mut pattern, &mut stars)?;
    if !literal.is_empty() {
        pattern.push_str(&regex::escape(&literal));
    }
    pattern.push('$');
    trace!("Compiled {:?} -> {:?}", text, pattern);
    Regex::new(&pattern).map_err(|e| e.to_string())
}

/// Parse Gupfile text: unindented lines ending in `:` name a build script,
/// indented lines beneath them are patterns, `#` at column zero starts a
/// comment. Entries with no patterns are dropped.
pub fn parse_gupfile(content: &str) -> std::result::Result<Vec<(String, RuleSet)>, String> {
    let mut entries: Vec<(String, Vec<MatchRule>)> = Vec::new();
    let mut current: Option<(String, Vec<MatchRule>)> = None;

    for (idx, raw) in content.lines().enumerate() {
        if raw.starts_with('#') {
            continue;
        }
        let new_entry = !raw.starts_with(|c: char| c.is_whitespace());
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if new_entry {
            if let Some(entry) = current.take() {
                if !entry.1.is_empty() {
                    entries.push(entry);
                }
            }
            let script = line
                .strip_suffix(':')
                .ok_or_else(|| format!("line {}", idx + 1))?
                .trim()
                .to_string();
            current = Some((script, Vec::new()));
        } else {
            match &mut current {
                Some((_, patterns)) => patterns.push(MatchRule::new(line)),
                None => return Err(format!("line {}", idx + 1)),
            }
        }
    }
    if let Some(entry) = current {
        if !entry.1.is_empty() {
            entries.push(entry);
        }
    }

    Ok(entries
        .into_iter()
        .map(|(script, rules)| (script, RuleSet::new(rules)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn candidate_strings(path: &str) -> Vec<String> {
        candidates(Path::new(path))
            .iter()
            .map(|c| format!("{} ({})", c.rule_file().display(), c.target))
            .collect()
    }

    #[test]
    fn candidate_order_is_least_fuzzy_first() {
        let got = candidate_strings("/a/b/c/d/e");
        let expected = vec![
            "/a/b/c/d/e.gup (e)",
            "/a/b/c/d/gup/e.gup (e)",
            "/a/b/c/gup/d/e.gup (e)",
            "/a/b/gup/c/d/e.gup (e)",
            "/a/gup/b/c/d/e.gup (e)",
            "/gup/a/b/c/d/e.gup (e)",
            "/a/b/c/d/Gupfile (e)",
            "/a/b/c/d/gup/Gupfile (e)",
            "/a/b/c/gup/d/Gupfile (e)",
            "/a/b/gup/c/d/Gupfile (e)",
            "/a/gup/b/c/d/Gupfile (e)",
            "/gup/a/b/c/d/Gupfile (e)",
            "/a/b/c/Gupfile (d/e)",
            "/a/b/c/gup/Gupfile (d/e)",
            "/a/b/gup/c/Gupfile (d/e)",
            "/a/gup/b/c/Gupfile (d/e)",
            "/gup/a/b/c/Gupfile (d/e)",
            "/a/b/Gupfile (c/d/e)",
            "/a/b/gup/Gupfile (c/d/e)",
            "/a/gup/b/Gupfile (c/d/e)",
            "/gup/a/b/Gupfile (c/d/e)",
            "/a/Gupfile (b/c/d/e)",
            "/a/gup/Gupfile (b/c/d/e)",
            "/gup/a/Gupfile (b/c/d/e)",
            "/Gupfile (a/b/c/d/e)",
            "/gup/Gupfile (a/b/c/d/e)",
        ];
        assert_eq!(got, expected);
    }

    #[test]
    fn candidates_for_target_at_root() {
        let got = candidate_strings("/file");
        assert_eq!(
            got,
            vec!["/file.gup (file)", "/gup/file.gup (file)", "/Gupfile (file)", "/gup/Gupfile (file)"]
        );
    }

    #[test]
    fn parses_scripts_and_patterns() {
        let rules = parse_gupfile(
            "foo.gup:\n foo1\n# comment\n\n\t foo2\n# comment\nignoreme:\nbar.gup :\n bar1\t \n    bar2\n",
        )
        .unwrap();
        let names: Vec<&str> = rules.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(names, vec!["foo.gup", "bar.gup"]);
        assert!(rules[0].1.matches("foo1").unwrap());
        assert!(rules[0].1.matches("foo2").unwrap());
        assert!(!rules[0].1.matches("bar1").unwrap());
        assert!(rules[1].1.matches("bar2").unwrap());
    }

    #[test]
    fn empty_and_comment_only_gupfiles_have_no_rules() {
        assert!(parse_gupfile("").unwrap().is_empty());
        assert!(parse_gupfile("# a comment\n# another\n").unwrap().is_empty());
    }

    #[test]
    fn script_line_must_end_with_colon() {
        assert!(parse_gupfile("foo.gup\n bar\n").is_err());
        assert!(parse_gupfile(" orphan-pattern\n").is_err());
    }

    #[test]
    fn star_does_not_cross_slashes() {
        let rules = parse_gupfile("a.gup:\n *.c\nb.gup:\n **.c\n").unwrap();
        assert!(rules[0].1.matches("x.c").unwrap());
        assert!(!rules[0].1.matches("sub/x.c").unwrap());
        assert!(rules[1].1.matches("sub/x.c").unwrap());
    }

    #[test]
    fn excludes_subtract_from_includes() {
        let rules = parse_gupfile("a.gup:\n *\n !skip\n").unwrap();
        assert!(rules[0].1.matches("anything").unwrap());
        assert!(!rules[0].1.matches("skip").unwrap());
    }

    #[test]
    fn exclude_with_no_includes_matches_nothing() {
        let rules = parse_gupfile("a.gup:\n !x\n").unwrap();
        assert!(!rules[0].1.matches("x").unwrap());
        assert!(!rules[0].1.matches("y").unwrap());
    }

    #[test]
    fn triple_star_is_rejected() {
        let rules = parse_gupfile("a.gup:\n a***b\n").unwrap();
        assert!(rules[0].1.matches("anything").is_err());
    }

    #[test]
    fn direct_script_wins_over_gupfile() {
        let dir = tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::write(base.join("t.gup"), "#!/bin/sh\n").unwrap();
        fs::write(base.join("Gupfile"), "other.gup:\n\t*\n").unwrap();
        fs::write(base.join("other.gup"), "#!/bin/sh\n").unwrap();

        let builder = Builder::for_target(&base.join("t")).unwrap().unwrap();
        assert_eq!(builder.script, base.join("t.gup"));
        assert_eq!(builder.target, "t");
        assert_eq!(builder.basedir, base);
        assert!(builder.parent.is_none());
    }

    #[test]
    fn gupfile_rule_matches_nested_target() {
        let dir = tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::create_dir_all(base.join("sub")).unwrap();
        fs::write(base.join("Gupfile"), "build.gup:\n\tsub/**\n").unwrap();
        fs::write(base.join("build.gup"), "#!/bin/sh\n").unwrap();

        let builder = Builder::for_target(&base.join("sub/out")).unwrap().unwrap();
        assert_eq!(builder.script, base.join("build.gup"));
        assert_eq!(builder.target, "sub/out");
        assert_eq!(builder.basedir, base);
    }

    #[test]
    fn mirrored_gup_directory_is_searched() {
        let dir = tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::create_dir_all(base.join("gup/sub")).unwrap();
        fs::write(base.join("gup/sub/t.gup"), "#!/bin/sh\n").unwrap();

        let builder = Builder::for_target(&base.join("sub/t")).unwrap().unwrap();
        assert_eq!(builder.script, base.join("gup/sub/t.gup"));
        assert_eq!(builder.basedir, base.join("sub"));
        assert_eq!(builder.target, "t");
    }

    #[test]
    fn build_system_files_require_exact_rules() {
        let dir = tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::write(base.join("Gupfile"), "build.gup:\n\t*\n").unwrap();
        fs::write(base.join("build.gup"), "#!/bin/sh\n").unwrap();
        // a catch-all rule must not claim scripts or Gupfiles
        assert!(Builder::for_target(&base.join("other.gup")).unwrap().is_none());
        assert!(Builder::for_target(&base.join("Gupfile")).unwrap().is_none());

        fs::write(base.join("Gupfile"), "build.gup:\n\t*\n\tother.gup\n").unwrap();
        let builder = Builder::for_target(&base.join("other.gup")).unwrap().unwrap();
        assert_eq!(builder.script, base.join("build.gup"));
    }

    #[test]
    fn direct_script_cannot_build_another_script() {
        let dir = tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::write(base.join("tool.gup.gup"), "#!/bin/sh\n").unwrap();
        assert!(Builder::for_target(&base.join("tool.gup")).unwrap().is_none());
    }

    #[test]
    fn missing_script_is_a_user_error() {
        let dir = tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::write(base.join("Gupfile"), "nonexistent.gup:\n\t*\n").unwrap();
        let err = Builder::for_target(&base.join("t")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nonexistent.gup"), "message was: {msg}");
        assert!(msg.contains("Gupfile"), "message was: {msg}");
    }

    #[test]
    fn buildable_script_gets_a_parent_builder() {
        let dir = tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::write(
            base.join("Gupfile"),
            "generated.gup:\n\tt\nmakescript.gup:\n\tgenerated.gup\n",
        )
        .unwrap();
        fs::write(base.join("makescript.gup"), "#!/bin/sh\n").unwrap();

        let builder = Builder::for_target(&base.join("t")).unwrap().unwrap();
        assert_eq!(builder.script, base.join("generated.gup"));
        let parent = builder.parent.expect("script should itself be buildable");
        assert_eq!(parent.script, base.join("makescript.gup"));
        assert_eq!(parent.target, "generated.gup");
    }

    #[test]
    fn unbuildable_target_resolves_to_none() {
        let dir = tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        assert!(Builder::for_target(&base.join("plain")).unwrap().is_none());
    }
}
