//! Compilation driver
//!
//! Ties the lexer and parser to an [`IncludeResolver`] and a shared
//! [`InstructionCache`]. Every file is compiled at most once per cache;
//! includers receive the cached list and splice a copy of it.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::error::{CompileError, CompileErrorKind};
use crate::lexer::Lexer;
use crate::parser::{self, Includes};
use crate::program::InstructionList;
use crate::schema::Schema;
use crate::vars::{substitute_config, ConfigSource, StaticConfig};

/// Locates and reads included files
pub trait IncludeResolver: Send + Sync {
    /// Canonical cache key for `path`. Paths naming the same file must map
    /// to the same key.
    fn key(&self, path: &str) -> String {
        normalize(path)
    }

    /// Read the source stored under `key`
    fn resolve(&self, key: &str) -> io::Result<String>;
}

/// Collapse `.` and `..` components of a `/`-separated path
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().map_or(false, |p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Resolves includes relative to a root directory
#[derive(Debug, Clone)]
pub struct FsResolver {
    root: PathBuf,
}

impl FsResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

impl IncludeResolver for FsResolver {
    /// The joined path, so files under different roots never share a key
    fn key(&self, path: &str) -> String {
        normalize(&self.root.join(path).to_string_lossy())
    }

    fn resolve(&self, key: &str) -> io::Result<String> {
        std::fs::read_to_string(key)
    }
}

/// Resolves includes from an in-memory map
#[derive(Debug, Clone, Default)]
pub struct MapResolver {
    files: HashMap<String, String>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, source: impl Into<String>) {
        self.files.insert(normalize(path), source.into());
    }

    pub fn with(mut self, path: &str, source: impl Into<String>) -> Self {
        self.insert(path, source);
        self
    }
}

impl IncludeResolver for MapResolver {
    fn resolve(&self, key: &str) -> io::Result<String> {
        self.files
            .get(key)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }
}

/// Resolves includes from the members of a txtar archive, falling back to
/// a directory for anything the archive does not carry
pub struct ArchiveResolver {
    archive: String,
    files: HashMap<String, String>,
    fallback: Option<FsResolver>,
}

impl ArchiveResolver {
    /// Index the members of `archive`. Keys take the form `name#member`.
    pub fn new(name: impl Into<String>, archive: &emx_txtar::Archive) -> Self {
        let files = archive
            .files
            .iter()
            .map(|f| (normalize(&f.name), String::from_utf8_lossy(bytes(&f.data)).into_owned()))
            .collect();
        Self {
            archive: name.into(),
            files,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: FsResolver) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

fn bytes<T: AsRef<[u8]> + ?Sized>(data: &T) -> &[u8] {
    data.as_ref()
}

impl IncludeResolver for ArchiveResolver {
    fn key(&self, path: &str) -> String {
        let member = normalize(path);
        if self.files.contains_key(&member) || self.fallback.is_none() {
            format!("{}#{}", self.archive, member)
        } else {
            member
        }
    }

    fn resolve(&self, key: &str) -> io::Result<String> {
        let member = key
            .strip_prefix(self.archive.as_str())
            .and_then(|rest| rest.strip_prefix('#'));
        match (member, &self.fallback) {
            (Some(member), _) => self.files.get(member).cloned().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("{} has no member {}", self.archive, member))
            }),
            (None, Some(fs)) => fs.resolve(key),
            (None, None) => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }
}

type Slot = Arc<OnceLock<Result<Arc<InstructionList>, CompileError>>>;

/// Compile and use counts for one cache key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Times the source was compiled; at most one
    pub compiles: usize,
    /// Times the compiled list was handed out
    pub uses: usize,
}

/// Compiled instruction lists keyed by canonical path.
///
/// A key compiles at most once even when several threads ask for it at the
/// same time; later callers block until the first finishes and share its
/// result, errors included.
#[derive(Default)]
pub struct InstructionCache {
    slots: Mutex<HashMap<String, Slot>>,
    stats: Mutex<HashMap<String, CacheStats>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl InstructionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the list cached under `key`, running `compile` if this is the
    /// first request for it.
    pub fn get_or_compile<F>(&self, key: &str, compile: F) -> Result<Arc<InstructionList>, CompileError>
    where
        F: FnOnce() -> Result<InstructionList, CompileError>,
    {
        let slot = lock(&self.slots).entry(key.to_string()).or_default().clone();

        let mut compiled = false;
        let result = slot
            .get_or_init(|| {
                compiled = true;
                compile().map(Arc::new)
            })
            .clone();

        let mut stats = lock(&self.stats);
        let entry = stats.entry(key.to_string()).or_default();
        if compiled {
            entry.compiles += 1;
        }
        entry.uses += 1;
        result
    }

    /// The successfully compiled list under `key`, without counting a use
    pub fn get(&self, key: &str) -> Option<Arc<InstructionList>> {
        let slot = lock(&self.slots).get(key).cloned()?;
        let cached = slot.get()?;
        cached.as_ref().ok().cloned()
    }

    /// Cached keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.slots).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self, key: &str) -> CacheStats {
        lock(&self.stats).get(key).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and its counters
    pub fn clear(&self) {
        lock(&self.slots).clear();
        lock(&self.stats).clear();
    }
}

/// Compiles scripts, resolving includes through the shared cache
#[derive(Clone)]
pub struct Compiler {
    schema: Arc<Schema>,
    resolver: Arc<dyn IncludeResolver>,
    config: Arc<dyn ConfigSource>,
    cache: Arc<InstructionCache>,
}

impl Compiler {
    /// A compiler with the built-in schema, no configuration variables and
    /// a fresh cache
    pub fn new(resolver: Arc<dyn IncludeResolver>) -> Self {
        Self {
            schema: Arc::new(Schema::with_builtins()),
            resolver,
            config: Arc::new(StaticConfig::new()),
            cache: Arc::new(InstructionCache::new()),
        }
    }

    /// Configuration used to expand `$NAME` in include paths
    pub fn with_config(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.config = config;
        self
    }

    pub fn with_schema(mut self, schema: Arc<Schema>) -> Self {
        self.schema = schema;
        self
    }

    /// Share a cache with other compilers
    pub fn with_cache(mut self, cache: Arc<InstructionCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<InstructionCache> {
        &self.cache
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Compile the file at `path`, or fetch it from the cache.
    pub fn compile_file(&self, path: &str) -> Result<Arc<InstructionList>, CompileError> {
        let key = self.resolver.key(path);
        let mut chain = Vec::new();
        self.compile_key(&key, &mut chain).map_err(|e| e.in_file(key.as_str()))
    }

    /// Compile source text that does not live in the resolver, such as the
    /// script section of an archive. The result is not cached.
    pub fn compile_source(&self, name: &str, source: &str) -> Result<InstructionList, CompileError> {
        let mut chain = vec![self.resolver.key(name)];
        self.parse_source(name, source, &mut chain)
    }

    fn compile_key(&self, key: &str, chain: &mut Vec<String>) -> Result<Arc<InstructionList>, CompileError> {
        self.cache.get_or_compile(key, || {
            let source = self.resolver.resolve(key).map_err(|e| {
                CompileError::new(CompileErrorKind::IncludeNotFound, 0, format!("{}: {}", key, e))
            })?;
            chain.push(key.to_string());
            let result = self.parse_source(key, &source, chain);
            chain.pop();
            if let Ok(ref list) = result {
                log::debug!("compiled {} ({} instructions)", key, list.len());
            }
            result
        })
    }

    fn parse_source(&self, name: &str, source: &str, chain: &mut Vec<String>) -> Result<InstructionList, CompileError> {
        let tokens = Lexer::new(&self.schema)
            .tokenize(source)
            .map_err(|e| CompileError::from(e).in_file(name))?;
        let mut ctx = IncludeCtx { compiler: self, chain };
        parser::parse(name, &tokens, &self.schema, &mut ctx).map_err(|e| e.in_file(name))
    }
}

/// Include hook handed to the parser for one file
struct IncludeCtx<'c> {
    compiler: &'c Compiler,
    /// Keys of the files currently being compiled, outermost first
    chain: &'c mut Vec<String>,
}

impl Includes for IncludeCtx<'_> {
    fn include(
        &mut self,
        path: &str,
        device: Option<&str>,
        line: usize,
    ) -> Result<Arc<InstructionList>, CompileError> {
        let path = substitute_config(path, self.compiler.config.as_ref(), device);
        let key = self.compiler.resolver.key(&path);

        if self.chain.contains(&key) {
            let mut cycle = self.chain.clone();
            cycle.push(key);
            return Err(CompileError::new(
                CompileErrorKind::IncludeCycle,
                line,
                format!("include cycle: {}", cycle.join(" -> ")),
            ));
        }

        self.compiler.compile_key(&key, self.chain).map_err(|mut e| {
            // errors raised inside the included file already carry its name
            if e.file.is_none() {
                e.line = line;
            }
            e
        })
    }
}
