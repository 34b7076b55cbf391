//! Acquire stage: snapshot the files of a hub repository that match a set of
//! allow-patterns into the local hub cache.

use async_trait::async_trait;
use hf_hub::api::tokio::{Api, ApiBuilder, ApiError};
use hf_hub::{Repo, RepoType};
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::{repo_name, HubConfig};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid repository id '{0}' (expected 'org/name')")]
    InvalidRepoId(String),
    #[error("invalid allow pattern '{pattern}': {source}")]
    InvalidPattern { pattern: String, #[source] source: regex::Error },
    #[error("no file in {repo} matches {patterns:?}")]
    NoMatchingFiles { repo: String, patterns: Vec<String> },
    #[error("hub request failed: {0}")]
    Api(#[from] ApiError),
    #[error("downloaded {file} to unexpected location {path}")]
    SnapshotLayout { file: String, path: PathBuf },
}

/// Shell-style (`fnmatch`) filename filter. `*` also crosses `/`, matching how
/// hub snapshot filters treat nested paths.
#[derive(Debug, Clone)]
pub struct AllowPatterns {
    raw: Vec<String>,
    compiled: Vec<Regex>,
}

impl AllowPatterns {
    pub fn new<I, S>(patterns: I) -> Result<Self, HubError>
    where I: IntoIterator<Item = S>, S: Into<String> {
        let raw: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let compiled = raw
            .iter()
            .map(|p| Regex::new(&glob_to_regex(p)).map_err(|source| HubError::InvalidPattern { pattern: p.clone(), source }))
            .collect::<Result<_, _>>()?;
        Ok(Self { raw, compiled })
    }

    pub fn matches(&self, path: &str) -> bool { self.compiled.iter().any(|re| re.is_match(path)) }

    pub fn select<'a>(&self, files: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        files.into_iter().filter(|f| self.matches(f)).map(String::from).collect()
    }

    pub fn as_slice(&self) -> &[String] { &self.raw }
}

fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?s)^");
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                // a ']' right after '[' or '[!' belongs to the set
                let mut end = i;
                if chars.get(end) == Some(&'!') { end += 1; }
                if chars.get(end) == Some(&']') { end += 1; }
                while end < chars.len() && chars[end] != ']' { end += 1; }
                if end >= chars.len() {
                    // unterminated, so literal
                    out.push_str("\\[");
                    continue;
                }
                out.push_str(&class_to_regex(&chars[i..end]));
                i = end + 1;
            }
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    out
}

/// Bracket expression body (between `[` and `]`) as a regex class. Only `!`
/// negates and only `a-z` forms a range; everything else is literal.
fn class_to_regex(body: &[char]) -> String {
    let (negated, body) = match body.split_first() {
        Some(('!', rest)) => (true, rest),
        _ => (false, body),
    };
    let mut set = String::new();
    let mut i = 0;
    while i < body.len() {
        if i + 2 < body.len() && body[i + 1] == '-' {
            let (lo, hi) = (body[i], body[i + 2]);
            // reversed ranges match nothing
            if lo <= hi {
                push_class_literal(&mut set, lo);
                set.push('-');
                push_class_literal(&mut set, hi);
            }
            i += 3;
        } else {
            push_class_literal(&mut set, body[i]);
            i += 1;
        }
    }
    match (set.is_empty(), negated) {
        (true, false) => "[a&&b]".to_string(),
        (true, true) => ".".to_string(),
        (false, false) => format!("[{set}]"),
        (false, true) => format!("[^{set}]"),
    }
}

fn push_class_literal(set: &mut String, c: char) {
    if matches!(c, '\\' | '[' | ']' | '^' | '-' | '&' | '~' | '|') { set.push('\\'); }
    set.push(c);
}

#[derive(Debug, Clone)]
pub struct HubRequest {
    pub repo_id: String,
    pub revision: String,
    pub patterns: AllowPatterns,
}

impl HubRequest {
    pub fn new(repo_id: &str, revision: &str, patterns: AllowPatterns) -> Result<Self, HubError> {
        repo_name(repo_id).map_err(|_| HubError::InvalidRepoId(repo_id.to_string()))?;
        Ok(Self { repo_id: repo_id.to_string(), revision: revision.to_string(), patterns })
    }

    pub fn from_config(cfg: &HubConfig) -> Result<Self, HubError> {
        Self::new(&cfg.model_id, &cfg.revision, AllowPatterns::new(cfg.allow_patterns.iter().cloned())?)
    }
}

#[async_trait]
pub trait ModelHub: Send + Sync {
    /// Fetch the selected files and return the local directory holding them,
    /// laid out by repository-relative path.
    async fn snapshot(&self, request: &HubRequest) -> Result<PathBuf, HubError>;
}

pub struct HfHub { api: Api }

impl HfHub {
    pub fn connect(cfg: &HubConfig) -> Result<Self, HubError> {
        let mut builder = ApiBuilder::new().with_endpoint(cfg.endpoint.clone()).with_progress(false);
        if let Some(token) = &cfg.token { builder = builder.with_token(Some(token.clone())); }
        if let Some(dir) = &cfg.cache_dir { builder = builder.with_cache_dir(dir.clone()); }
        Ok(Self { api: builder.build()? })
    }
}

#[async_trait]
impl ModelHub for HfHub {
    #[instrument(skip(self, request), fields(repo = %request.repo_id, revision = %request.revision))]
    async fn snapshot(&self, request: &HubRequest) -> Result<PathBuf, HubError> {
        let repo = self.api.repo(Repo::with_revision(request.repo_id.clone(), RepoType::Model, request.revision.clone()));
        let info = repo.info().await?;
        let selected = request.patterns.select(info.siblings.iter().map(|s| s.rfilename.as_str()));
        if selected.is_empty() {
            return Err(HubError::NoMatchingFiles { repo: request.repo_id.clone(), patterns: request.patterns.as_slice().to_vec() });
        }
        info!(files = selected.len(), sha = %info.sha, "hub_snapshot_selected");
        let mut root = None;
        for file in &selected {
            let path = repo.get(file).await?;
            debug!(file = %file, path = %path.display(), "hub_file_ready");
            if root.is_none() {
                root = Some(snapshot_root(&path, file).ok_or_else(|| HubError::SnapshotLayout { file: file.clone(), path: path.clone() })?);
            }
        }
        // selected is non-empty, so root was set on the first file
        root.ok_or_else(|| HubError::NoMatchingFiles { repo: request.repo_id.clone(), patterns: request.patterns.as_slice().to_vec() })
    }
}

/// Strip the repository-relative `rfilename` off the downloaded `path`.
pub(crate) fn snapshot_root(path: &Path, rfilename: &str) -> Option<PathBuf> {
    let rel = Path::new(rfilename);
    if !path.ends_with(rel) { return None; }
    let mut root = path;
    for _ in rel.components() { root = root.parent()?; }
    Some(root.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(p: &[&str]) -> AllowPatterns { AllowPatterns::new(p.iter().copied()).unwrap() }

    #[test]
    fn default_patterns_select_weights_and_configs() {
        let p = patterns(&["*.json", "*.safetensors", "*.model"]);
        let files = ["config.json", "tokenizer.json", "model.safetensors", "tokenizer.model", "README.md", "pytorch_model.bin", ".gitattributes"];
        assert_eq!(p.select(files), vec!["config.json", "tokenizer.json", "model.safetensors", "tokenizer.model"]);
    }

    #[test]
    fn star_crosses_directories() {
        let p = patterns(&["*.json"]);
        assert!(p.matches("onnx/config.json"));
        assert!(!p.matches("config.json.bak"));
    }

    #[test]
    fn question_mark_and_classes() {
        let p = patterns(&["model-0000?-of-00002.safetensors", "shard[12].bin", "x[!a].txt"]);
        assert!(p.matches("model-00001-of-00002.safetensors"));
        assert!(!p.matches("model-001-of-00002.safetensors"));
        assert!(p.matches("shard1.bin"));
        assert!(!p.matches("shard3.bin"));
        assert!(p.matches("xb.txt"));
        assert!(!p.matches("xa.txt"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let p = patterns(&["weights+v1.(final).json", "open[bracket"]);
        assert!(p.matches("weights+v1.(final).json"));
        assert!(!p.matches("weightsv1x(final)xjson"));
        assert!(p.matches("open[bracket"));
    }

    #[test]
    fn class_contents_are_literal() {
        let p = patterns(&["a[^x].bin"]);
        assert!(p.matches("a^.bin") && p.matches("ax.bin"));
        assert!(!p.matches("ay.bin"));

        let p = patterns(&["b[]z].bin"]);
        assert!(p.matches("b].bin") && p.matches("bz.bin"));
        assert!(!p.matches("b[.bin"));

        let p = patterns(&["c[!]].bin"]);
        assert!(p.matches("cq.bin"));
        assert!(!p.matches("c].bin"));

        let p = patterns(&["d[a&&b].bin", "e[[~-].bin", "f[\\\\].bin"]);
        assert!(p.matches("da.bin") && p.matches("d&.bin") && p.matches("db.bin"));
        assert!(p.matches("e[.bin") && p.matches("e~.bin") && p.matches("e-.bin"));
        assert!(p.matches("f\\.bin"));
        assert!(!p.matches("dc.bin"));
    }

    #[test]
    fn ranges_follow_fnmatch() {
        let p = patterns(&["shard-[0-3].bin", "tail[a-].bin", "none[z-a].bin", "any[!z-a].bin"]);
        assert!(p.matches("shard-2.bin"));
        assert!(!p.matches("shard-4.bin"));
        assert!(p.matches("taila.bin") && p.matches("tail-.bin"));
        assert!(!p.matches("nonez.bin") && !p.matches("nonea.bin"));
        assert!(p.matches("anyq.bin"));
    }

    #[test]
    fn repo_id_must_be_org_and_name() {
        let p = patterns(&["*"]);
        assert!(HubRequest::new("Qwen/Qwen3-0.6B", "main", p.clone()).is_ok());
        for bad in ["Qwen3-0.6B", "/Qwen3", "Qwen/", "a/b/c"] {
            assert!(matches!(HubRequest::new(bad, "main", p.clone()), Err(HubError::InvalidRepoId(_))), "{bad}");
        }
    }

    #[test]
    fn snapshot_root_strips_relative_path() {
        let path = Path::new("/cache/models--Qwen--Qwen3-0.6B/snapshots/abc/onnx/config.json");
        assert_eq!(snapshot_root(path, "onnx/config.json").unwrap(), PathBuf::from("/cache/models--Qwen--Qwen3-0.6B/snapshots/abc"));
        assert!(snapshot_root(path, "model.safetensors").is_none());
    }
}
