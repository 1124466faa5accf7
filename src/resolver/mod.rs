//! Artifact resolvers -- pluggable hashers that turn URIs into
//! `{path -> digest-set}` entries.
//!
//! A resolver is selected by URI scheme; URIs without a scheme (plain
//! paths) fall back to the built-in `file` resolver. All resolvers are
//! pure functions of their inputs and the configured hash algorithms, so
//! the recorded artifact set is a deterministic function of the resolved
//! input set.
//!
//! Shared policy lives here: the gitignore-style [`ExcludeFilter`], base
//! path handling, `/`-normalization of recorded keys, and multi-hash
//! digesting.

pub mod dir;
pub mod file;
pub mod ostree;

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobBuilder, GlobMatcher};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};
use crate::models::{ArtifactMap, DigestSet};

/// Hash algorithms supported for artifact digests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256, the default.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl HashAlgorithm {
    /// IANA hash function name, used as the digest-set key.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Parses an IANA hash function name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

/// Hashes a byte slice with every requested algorithm.
pub fn hash_bytes(data: &[u8], algorithms: &[HashAlgorithm]) -> DigestSet {
    let mut out = DigestSet::new();
    for algo in algorithms {
        let digest = match algo {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
        };
        out.insert(algo.name().into(), digest);
    }
    out
}

/// Hashes a file with every requested algorithm in a single pass.
///
/// With `normalize_line_endings` the content is read fully and `\r\n` /
/// `\r` are rewritten to `\n` before hashing; otherwise the file is
/// streamed through a 64 KiB buffer.
///
/// # Errors
///
/// Returns [`Error::Io`] on read failure.
pub fn hash_file(
    path: &Path,
    algorithms: &[HashAlgorithm],
    normalize_line_endings: bool,
) -> Result<DigestSet> {
    if normalize_line_endings {
        let data = std::fs::read(path).map_err(|e| Error::io(path, &e))?;
        let normalized = normalize_line_ending_bytes(&data);
        return Ok(hash_bytes(&normalized, algorithms));
    }

    let mut file = std::fs::File::open(path).map_err(|e| Error::io(path, &e))?;
    let mut sha256 = algorithms
        .contains(&HashAlgorithm::Sha256)
        .then(Sha256::new);
    let mut sha512 = algorithms
        .contains(&HashAlgorithm::Sha512)
        .then(Sha512::new);

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::io(path, &e))?;
        if n == 0 {
            break;
        }
        let chunk = buf.get(..n).unwrap_or_default();
        if let Some(h) = sha256.as_mut() {
            h.update(chunk);
        }
        if let Some(h) = sha512.as_mut() {
            h.update(chunk);
        }
    }

    let mut out = DigestSet::new();
    if let Some(h) = sha256 {
        out.insert("sha256".into(), hex::encode(h.finalize()));
    }
    if let Some(h) = sha512 {
        out.insert("sha512".into(), hex::encode(h.finalize()));
    }
    Ok(out)
}

fn normalize_line_ending_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' {
            if iter.peek() == Some(&&b'\n') {
                iter.next();
            }
            out.push(b'\n');
        } else {
            out.push(b);
        }
    }
    out
}

/// Normalizes a recorded artifact key: backslashes become `/`, repeated
/// separators collapse, leading `./` segments are stripped.
pub fn normalize_uri_path(path: &str) -> String {
    let forward = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for part in forward.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        parts.push(part);
    }
    let mut out = parts.join("/");
    // Absolute inputs keep their root.
    if forward.starts_with('/') {
        out.insert(0, '/');
    }
    out
}

/// One compiled gitignore-style exclude pattern.
#[derive(Debug)]
struct ExcludePattern {
    matcher: GlobMatcher,
    negate: bool,
    dir_only: bool,
}

/// Gitignore-style exclusion over recorded artifact keys.
///
/// Semantics: patterns apply in order with last-match-wins; a leading `!`
/// negates (re-includes); a trailing `/` restricts the pattern to
/// directories; `*` and `?` stop at `/`; `**` crosses directories; a
/// match against a directory excludes its contents recursively (the
/// walker prunes the subtree).
#[derive(Debug)]
pub struct ExcludeFilter {
    patterns: Vec<ExcludePattern>,
}

impl ExcludeFilter {
    /// Compiles a pattern list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] for an uncompilable glob.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let mut pat = raw.as_ref();
            let negate = if let Some(rest) = pat.strip_prefix('!') {
                pat = rest;
                true
            } else {
                false
            };
            let dir_only = if let Some(rest) = pat.strip_suffix('/') {
                pat = rest;
                true
            } else {
                false
            };
            if pat.is_empty() {
                continue;
            }
            let matcher = compile_glob(pat)?.compile_matcher();
            compiled.push(ExcludePattern {
                matcher,
                negate,
                dir_only,
            });
        }
        Ok(Self { patterns: compiled })
    }

    /// An empty filter that excludes nothing.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Returns `true` if `path` (a normalized key) is excluded.
    /// `is_dir` enables trailing-`/` patterns.
    pub fn is_match(&self, path: &str, is_dir: bool) -> bool {
        let mut excluded = false;
        for pattern in &self.patterns {
            if pattern.dir_only && !is_dir {
                continue;
            }
            if pattern.matcher.is_match(path) {
                excluded = !pattern.negate;
            }
        }
        excluded
    }
}

/// Compiles a glob where `*`/`?` stop at `/` and `**` crosses.
pub(crate) fn compile_glob(pattern: &str) -> Result<Glob> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| Error::schema("glob pattern", format!("'{pattern}': {e}")))
}

/// Per-call configuration for artifact resolution. No global state: every
/// knob flows through this value.
pub struct ResolveContext {
    /// Algorithms to digest with; default SHA-256.
    pub hash_algorithms: Vec<HashAlgorithm>,
    /// Paths matching these patterns are omitted.
    pub exclude: ExcludeFilter,
    /// Artifact paths are resolved relative to this directory and recorded
    /// with it stripped. The base path itself never appears in a link.
    pub base_path: Option<PathBuf>,
    /// Follow directory symlinks while walking. Loops surface as errors.
    pub follow_symlink_dirs: bool,
    /// Rewrite `\r\n`/`\r` to `\n` before hashing (text artifacts).
    pub normalize_line_endings: bool,
}

impl Default for ResolveContext {
    fn default() -> Self {
        Self {
            hash_algorithms: vec![HashAlgorithm::Sha256],
            exclude: ExcludeFilter::empty(),
            base_path: None,
            follow_symlink_dirs: false,
            normalize_line_endings: false,
        }
    }
}

/// A pluggable artifact hasher, selected by URI scheme.
pub trait Resolver: Send + Sync {
    /// URI scheme this resolver handles (without the `:`).
    fn scheme(&self) -> &'static str;

    /// Resolves one URI into recorded artifact entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] for unreadable artifacts and [`Error::Schema`]
    /// for malformed URIs.
    fn resolve(&self, uri: &str, ctx: &ResolveContext) -> Result<ArtifactMap>;
}

/// Scheme registry. Additional resolvers may be registered at startup;
/// unknown or absent schemes fall back to `file`.
pub struct ResolverSet {
    by_scheme: HashMap<&'static str, Arc<dyn Resolver>>,
}

impl ResolverSet {
    /// Creates a registry with the built-in `file`, `dir`, and `ostree`
    /// resolvers.
    pub fn with_builtins() -> Self {
        let mut set = Self {
            by_scheme: HashMap::new(),
        };
        set.register(Arc::new(file::FileResolver));
        set.register(Arc::new(dir::DirResolver));
        set.register(Arc::new(ostree::OstreeResolver));
        set
    }

    /// Registers a resolver for its scheme, replacing any previous one.
    pub fn register(&mut self, resolver: Arc<dyn Resolver>) {
        self.by_scheme.insert(resolver.scheme(), resolver);
    }

    fn resolver_for(&self, uri: &str) -> Arc<dyn Resolver> {
        let scheme = uri.split_once(':').map(|(s, _)| s);
        let resolver = scheme.and_then(|s| self.by_scheme.get(s));
        match resolver {
            Some(r) => Arc::clone(r),
            // No scheme, or an unregistered one: treat the whole URI as a
            // file path.
            None => Arc::clone(
                self.by_scheme
                    .get("file")
                    .unwrap_or_else(|| unreachable!("file resolver is always registered")),
            ),
        }
    }

    /// Resolves a list of URIs, merging all entries into one map.
    ///
    /// # Errors
    ///
    /// Propagates the first resolver failure.
    pub fn resolve_all<S: AsRef<str>>(
        &self,
        uris: &[S],
        ctx: &ResolveContext,
    ) -> Result<ArtifactMap> {
        let mut out = ArtifactMap::new();
        for uri in uris {
            let uri = uri.as_ref();
            out.extend(self.resolver_for(uri).resolve(uri, ctx)?);
        }
        Ok(out)
    }
}

impl Default for ResolverSet {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn hash_bytes_multi_algorithm() {
        let digests = hash_bytes(b"hello", &[HashAlgorithm::Sha256, HashAlgorithm::Sha512]);
        assert_eq!(
            digests.get("sha256").map(String::as_str),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        assert_eq!(digests.get("sha512").map(String::len), Some(128));
    }

    #[test]
    fn line_ending_normalization() {
        assert_eq!(normalize_line_ending_bytes(b"a\r\nb"), b"a\nb");
        assert_eq!(normalize_line_ending_bytes(b"a\rb"), b"a\nb");
        assert_eq!(normalize_line_ending_bytes(b"a\nb"), b"a\nb");
        assert_eq!(normalize_line_ending_bytes(b"a\r\n\r\nb"), b"a\n\nb");
        // Lone \r at end of input.
        assert_eq!(normalize_line_ending_bytes(b"a\r"), b"a\n");
    }

    #[test]
    fn path_normalization() {
        assert_eq!(normalize_uri_path("./foo/bar"), "foo/bar");
        assert_eq!(normalize_uri_path("foo//bar"), "foo/bar");
        assert_eq!(normalize_uri_path("foo\\bar"), "foo/bar");
        assert_eq!(normalize_uri_path("./././x"), "x");
        assert_eq!(normalize_uri_path("/abs/path"), "/abs/path");
    }

    #[test]
    fn exclude_basic_glob() {
        let filter = ExcludeFilter::new(&["*.pyc"]).unwrap();
        assert!(filter.is_match("mod.pyc", false));
        assert!(!filter.is_match("mod.py", false));
        // * does not cross /.
        assert!(!filter.is_match("pkg/mod.pyc", false));
    }

    #[test]
    fn exclude_double_star_crosses_directories() {
        let filter = ExcludeFilter::new(&["**/*.pyc"]).unwrap();
        assert!(filter.is_match("mod.pyc", false));
        assert!(filter.is_match("a/b/mod.pyc", false));
    }

    #[test]
    fn exclude_question_mark_single_char() {
        let filter = ExcludeFilter::new(&["file?.txt"]).unwrap();
        assert!(filter.is_match("file1.txt", false));
        assert!(!filter.is_match("file12.txt", false));
        assert!(!filter.is_match("file/.txt", false));
    }

    #[test]
    fn exclude_negation_last_match_wins() {
        let filter = ExcludeFilter::new(&["*.log", "!keep.log"]).unwrap();
        assert!(filter.is_match("debug.log", false));
        assert!(!filter.is_match("keep.log", false));

        // Order matters: a later exclude overrides an earlier negate.
        let filter = ExcludeFilter::new(&["!keep.log", "*.log"]).unwrap();
        assert!(filter.is_match("keep.log", false));
    }

    #[test]
    fn exclude_dir_only_pattern() {
        let filter = ExcludeFilter::new(&["build/"]).unwrap();
        assert!(filter.is_match("build", true));
        // A *file* named build is not excluded by a dir-only pattern.
        assert!(!filter.is_match("build", false));
    }

    #[test]
    fn invalid_pattern_is_schema_error() {
        let err = ExcludeFilter::new(&["a[unclosed"]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
    }

    #[test]
    fn scheme_fallback_to_file() {
        let set = ResolverSet::with_builtins();
        assert_eq!(set.resolver_for("plain/path").scheme(), "file");
        assert_eq!(set.resolver_for("file:x").scheme(), "file");
        assert_eq!(set.resolver_for("dir:x").scheme(), "dir");
        assert_eq!(set.resolver_for("ostree:x").scheme(), "ostree");
        // Unknown scheme falls back to file (the "scheme" is likely part
        // of the file name).
        assert_eq!(set.resolver_for("weird:thing").scheme(), "file");
    }
}
