//! Component A: raw command → canonical form, tool name, argument slots,
//! pipeline segments, risk tags (spec §4.A).
//!
//! The tokenizer is a hand-rolled state machine over raw bytes rather than a
//! shell invocation — the engine only ever observes commands, it never runs
//! them (§1 non-goals).

use regex::Regex;
use std::sync::OnceLock;

pub const NORMALIZER_VERSION: u32 = 1;
const MAX_COMMAND_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalized {
    pub cmd_norm: String,
    pub tool: String,
    pub pipeline_segments: Vec<String>,
    pub risk_tags: Vec<String>,
    pub alias_expanded: bool,
    pub truncated_segments: bool,
    pub oversized: bool,
}

/// Tokenize respecting POSIX-ish quoting: single quotes are fully literal,
/// double quotes allow backslash-escaping of `"` `$` `` ` `` `\`, and a bare
/// backslash outside quotes escapes the next byte. Unquoted `|`, `&&`, `||`,
/// `;` are segment separators; a lone `&` backgrounds a job but does not
/// split the logical segment.
fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut in_token = false;
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    macro_rules! flush {
        () => {
            if in_token {
                tokens.push(Token::Word(std::mem::take(&mut cur)));
                in_token = false;
            }
        };
    }

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' => {
                in_token = true;
                i += 1;
                while i < chars.len() && chars[i] != '\'' {
                    cur.push(chars[i]);
                    i += 1;
                }
                i += 1; // consume closing quote (or end of input)
            }
            '"' => {
                in_token = true;
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\'
                        && i + 1 < chars.len()
                        && matches!(chars[i + 1], '"' | '$' | '`' | '\\')
                    {
                        cur.push(chars[i + 1]);
                        i += 2;
                    } else {
                        cur.push(chars[i]);
                        i += 1;
                    }
                }
                i += 1;
            }
            '\\' if i + 1 < chars.len() => {
                in_token = true;
                cur.push(chars[i + 1]);
                i += 2;
            }
            c if c.is_whitespace() => {
                flush!();
                i += 1;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                flush!();
                tokens.push(Token::Sep("||".to_string()));
                i += 2;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                flush!();
                tokens.push(Token::Sep("&&".to_string()));
                i += 2;
            }
            '|' => {
                flush!();
                tokens.push(Token::Sep("|".to_string()));
                i += 1;
            }
            ';' => {
                flush!();
                tokens.push(Token::Sep(";".to_string()));
                i += 1;
            }
            _ => {
                in_token = true;
                cur.push(c);
                i += 1;
            }
        }
    }
    flush!();
    tokens
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Sep(String),
}

fn split_segments(tokens: &[Token]) -> Vec<Vec<String>> {
    let mut segments = Vec::new();
    let mut cur: Vec<String> = Vec::new();
    for t in tokens {
        match t {
            Token::Word(w) => cur.push(w.clone()),
            Token::Sep(_) => {
                if !cur.is_empty() {
                    segments.push(std::mem::take(&mut cur));
                }
            }
        }
    }
    if !cur.is_empty() {
        segments.push(cur);
    }
    segments
}

const WRAPPERS: &[&str] = &["sudo", "env", "nice", "time", "xargs"];

/// First executable token after leading `VAR=value` assignments and wrappers.
fn detect_tool(words: &[String]) -> (String, usize) {
    let mut i = 0;
    while i < words.len() && is_assignment(&words[i]) {
        i += 1;
    }
    while i < words.len() && WRAPPERS.contains(&words[i].as_str()) {
        i += 1;
        // skip flags like `sudo -u user` minimally: just the wrapper word itself.
    }
    match words.get(i) {
        Some(w) => (w.clone(), i),
        None => (String::new(), i),
    }
}

fn is_assignment(word: &str) -> bool {
    match word.find('=') {
        Some(pos) if pos > 0 => word[..pos]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

struct SlotPatterns {
    url: Regex,
    ip: Regex,
    email: Regex,
    number: Regex,
    hash: Regex,
    duration: Regex,
    path: Regex,
}

fn patterns() -> &'static SlotPatterns {
    static P: OnceLock<SlotPatterns> = OnceLock::new();
    P.get_or_init(|| SlotPatterns {
        url: Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://\S+$").unwrap(),
        ip: Regex::new(r"^\d{1,3}(\.\d{1,3}){3}$").unwrap(),
        email: Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap(),
        number: Regex::new(r"^-?\d+(\.\d+)?$").unwrap(),
        hash: Regex::new(r"^[0-9a-fA-F]{7,64}$").unwrap(),
        duration: Regex::new(r"^\d+(ms|s|m|h|d)$").unwrap(),
        path: Regex::new(r"^(/|\./|\.\./|~/)\S*$").unwrap(),
    })
}

fn classify_slot(word: &str) -> Option<&'static str> {
    let p = patterns();
    if word.len() >= 2 && word.starts_with('"') && word.ends_with('"') {
        return Some("STR");
    }
    if p.url.is_match(word) {
        Some("URL")
    } else if p.email.is_match(word) {
        Some("EMAIL")
    } else if p.ip.is_match(word) {
        Some("IP")
    } else if p.duration.is_match(word) {
        Some("DURATION")
    } else if p.hash.is_match(word) && word.chars().any(|c| c.is_ascii_hexdigit()) && word.len() >= 7
    {
        Some("HASH")
    } else if p.path.is_match(word) {
        Some("PATH")
    } else if p.number.is_match(word) {
        Some("NUM")
    } else {
        None
    }
}

/// Tool-specific placeholder hints — a learned slot classifier per
/// `(tool, flag)` is out of scope for this engine revision; these cover the
/// common cases named in the spec with a fixed table instead.
fn tool_specific_placeholder(tool: &str, prev: &str, word: &str) -> Option<&'static str> {
    match (tool, prev) {
        ("git", "checkout") | ("git", "branch") | ("git", "switch") => Some("BRANCH"),
        ("ssh", _) if !word.starts_with('-') => Some("HOST"),
        ("kubectl", "-n") | ("kubectl", "--namespace") => Some("NS"),
        _ => None,
    }
}

/// Re-derives risk tags straight from a `cmd_norm` string (the Scorer has no
/// other path back to a command's risk shape once it's been aggregated into
/// `transitions`/`frequency`, which don't carry tags of their own).
pub fn risk_tags_for_text(cmd_norm: &str) -> Vec<String> {
    let words: Vec<String> = cmd_norm.split_whitespace().map(|s| s.to_string()).collect();
    risk_tags_for(&[words], cmd_norm)
}

fn risk_tags_for(words: &[Vec<String>], raw: &str) -> Vec<String> {
    let mut tags = Vec::new();
    for seg in words {
        if seg.is_empty() {
            continue;
        }
        let joined = seg.join(" ");
        if seg[0] == "rm" && seg.iter().any(|w| w == "-rf" || w == "-fr" || w == "-r" && seg.contains(&"-f".to_string()))
        {
            tags.push("destructive_rm".to_string());
        }
        if seg[0] == "dd" && seg.iter().any(|w| w.starts_with("of=")) {
            tags.push("disk_write".to_string());
        }
        if joined.contains("DROP TABLE") || joined.to_uppercase().contains("DROP TABLE") {
            tags.push("sql_drop".to_string());
        }
        if matches!(seg[0].as_str(), "git" | "svn" | "hg") && seg.iter().any(|w| w == "--force" || w == "-f")
        {
            tags.push("force_vcs".to_string());
        }
        if seg.iter().any(|w| w.starts_with("/etc/") || w.starts_with("/boot/") || w.starts_with("/sys/"))
            && seg.iter().any(|w| w.starts_with('>') || w == ">")
        {
            tags.push("system_path_write".to_string());
        }
    }
    if raw.replace(' ', "").contains(":(){:|:&};:") || raw.contains(":(){ :|:& };:") {
        tags.push("fork_bomb".to_string());
    }
    tags.sort();
    tags.dedup();
    tags
}

/// Normalize one segment's words into a placeholdered string, e.g.
/// `git checkout <BRANCH>`.
fn normalize_segment(words: &[String]) -> (String, String) {
    let (tool, tool_idx) = detect_tool(words);
    let mut out = Vec::with_capacity(words.len());
    for (i, w) in words.iter().enumerate() {
        if i < tool_idx {
            // assignments / wrapper words are kept verbatim; they are rare and
            // carry useful context (e.g. `sudo`).
            out.push(w.clone());
            continue;
        }
        if i == tool_idx {
            out.push(w.clone());
            continue;
        }
        let prev = words[i - 1].as_str();
        if let Some(kind) = tool_specific_placeholder(&tool, prev, w) {
            out.push(format!("<{kind}>"));
            continue;
        }
        match classify_slot(w) {
            Some(kind) => out.push(format!("<{kind}>")),
            None => out.push(w.clone()),
        }
    }
    (out.join(" "), tool)
}

/// Expand a leading alias token using a session-supplied alias map, bounded
/// to `max_depth` to guard against cyclic alias definitions.
fn expand_alias<'a>(
    first: &str,
    rest: &[String],
    aliases: &std::collections::HashMap<String, String>,
    max_depth: u8,
) -> (Vec<String>, bool) {
    let mut expanded = false;
    let mut current = first.to_string();
    let mut depth = 0;
    while let Some(replacement) = aliases.get(&current) {
        if depth >= max_depth {
            break;
        }
        let mut words = tokenize(replacement)
            .into_iter()
            .filter_map(|t| match t {
                Token::Word(w) => Some(w),
                Token::Sep(_) => None,
            });
        match words.next() {
            Some(w) => current = w,
            None => break,
        }
        expanded = true;
        depth += 1;
    }
    let mut out = vec![current];
    out.extend_from_slice(rest);
    (out, expanded)
}

pub fn normalize(
    cmd_raw: &str,
    aliases: &std::collections::HashMap<String, String>,
    pipeline_max_segments: usize,
    alias_max_depth: u8,
) -> Normalized {
    let oversized = cmd_raw.len() > MAX_COMMAND_BYTES;
    let input = if oversized {
        &cmd_raw[..MAX_COMMAND_BYTES]
    } else {
        cmd_raw
    };

    let tokens = tokenize(input);
    let mut segments = split_segments(&tokens);

    if let Some(first_seg) = segments.first_mut() {
        if let Some((first, rest)) = first_seg.split_first() {
            let (expanded, did_expand) = expand_alias(first, rest, aliases, alias_max_depth);
            if did_expand {
                *first_seg = expanded;
            }
        }
    }
    let alias_expanded = !segments.is_empty()
        && segments[0].first().map(|s| s.as_str()) != tokens.iter().find_map(|t| match t {
            Token::Word(w) => Some(w.as_str()),
            _ => None,
        });

    let truncated_segments = segments.len() > pipeline_max_segments;
    if truncated_segments {
        segments.truncate(pipeline_max_segments);
    }

    let risk_tags = risk_tags_for(&segments, input);

    let mut norm_segments = Vec::with_capacity(segments.len());
    let mut tool = String::new();
    for (idx, seg) in segments.iter().enumerate() {
        let (norm, seg_tool) = normalize_segment(seg);
        if idx == 0 {
            tool = seg_tool;
        }
        norm_segments.push(norm);
    }
    if truncated_segments {
        norm_segments.push("<TRUNCATED>".to_string());
    }

    Normalized {
        cmd_norm: norm_segments.join(" | "),
        tool,
        pipeline_segments: norm_segments,
        risk_tags,
        alias_expanded,
        truncated_segments,
        oversized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn norm(s: &str) -> Normalized {
        normalize(s, &HashMap::new(), 8, 3)
    }

    #[test]
    fn normalization_is_pure() {
        let a = norm("git checkout main");
        let b = norm("git checkout main");
        assert_eq!(a, b);
    }

    #[test]
    fn detects_tool_and_branch_placeholder() {
        let n = norm("git checkout feature/foo");
        assert_eq!(n.tool, "git");
        assert_eq!(n.cmd_norm, "git checkout <BRANCH>");
    }

    #[test]
    fn kubectl_namespace_placeholder() {
        let n = norm("kubectl get pods -n staging");
        assert_eq!(n.cmd_norm, "kubectl get pods -n <NS>");
    }

    #[test]
    fn ssh_host_placeholder() {
        let n = norm("ssh build-box-12.internal");
        assert_eq!(n.tool, "ssh");
        assert!(n.cmd_norm.contains("<HOST>"));
    }

    #[test]
    fn pipeline_segmentation_on_pipe_and_and() {
        let n = norm("git status && git add . | cat");
        assert_eq!(n.pipeline_segments.len(), 3);
    }

    #[test]
    fn pipeline_overflow_is_truncated_with_marker() {
        let cmd = (0..10).map(|_| "true").collect::<Vec<_>>().join(" && ");
        let n = normalize(&cmd, &HashMap::new(), 3, 3);
        assert!(n.truncated_segments);
        assert_eq!(n.pipeline_segments.last().unwrap(), "<TRUNCATED>");
    }

    #[test]
    fn quoted_strings_collapse_to_str_placeholder() {
        let n = norm(r#"git commit -m "fix the thing""#);
        assert!(n.cmd_norm.contains("<STR>"));
    }

    #[test]
    fn single_quotes_are_literal() {
        let n = norm("echo 'hello | world'");
        // the pipe inside single quotes must not split the segment
        assert_eq!(n.pipeline_segments.len(), 1);
    }

    #[test]
    fn leading_assignment_then_sudo_then_tool() {
        let n = norm("FOO=bar sudo systemctl restart nginx");
        assert_eq!(n.tool, "systemctl");
    }

    #[test]
    fn destructive_rm_is_tagged() {
        let n = norm("rm -rf /tmp/build");
        assert!(n.risk_tags.contains(&"destructive_rm".to_string()));
    }

    #[test]
    fn fork_bomb_is_tagged() {
        let n = norm(":(){ :|: & };:");
        assert!(n.risk_tags.contains(&"fork_bomb".to_string()));
    }

    #[test]
    fn safe_command_has_no_risk_tags() {
        let n = norm("git status");
        assert!(n.risk_tags.is_empty());
    }

    #[test]
    fn alias_expansion_replaces_leading_token() {
        let mut aliases = HashMap::new();
        aliases.insert("gs".to_string(), "git status".to_string());
        let n = normalize("gs --short", &aliases, 8, 3);
        assert_eq!(n.tool, "git");
        assert!(n.alias_expanded);
    }

    #[test]
    fn oversized_command_is_flagged_and_truncated() {
        let huge = "x".repeat(MAX_COMMAND_BYTES + 500);
        let n = normalize(&huge, &HashMap::new(), 8, 3);
        assert!(n.oversized);
    }
}
