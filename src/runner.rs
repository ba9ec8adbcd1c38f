//! Script runner
//!
//! Discovers device scripts in a directory, gives each one a scratch working
//! directory and local shell devices, runs it, and reports results. Plain
//! `.dvs` files are scripts on their own; in a `.txtar` bundle the comment is
//! the script and the members are includable sources and fixtures.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::compiler::{normalize, ArchiveResolver, Compiler, FsResolver, IncludeResolver, InstructionCache};
use crate::engine::Engine;
use crate::error::CompileError;
use crate::program::InstructionList;
use crate::schema::Schema;
use crate::session::{DeviceSession, ShellSession};
use crate::sink::{MemorySink, Outcome};
use crate::state::{RunStatus, SessionFactory, State};
use crate::vars::StaticConfig;

/// Hook run before each script
pub type SetupFn = Box<dyn Fn(&mut SetupEnv) -> Result<(), Box<dyn std::error::Error>> + Send + Sync>;

/// Configuration for the runner
pub struct RunConfig {
    /// Directory (or single file) holding the scripts
    pub dir: PathBuf,
    /// Only run scripts whose name contains this string
    pub filter: Option<String>,
    /// Root directory for temp working directories
    pub workdir_root: Option<PathBuf>,
    /// Keep working directories after each script
    pub preserve_work: bool,
    /// Called before each script runs
    pub setup: Option<SetupFn>,
    /// Print the run transcript of passing scripts too
    pub verbose: bool,
    /// File extensions to scan
    pub extensions: Vec<String>,
    /// Device names backed by a local shell in the working directory. `*`
    /// matches any device.
    pub devices: Vec<String>,
    /// Configuration variables shared by every script
    pub vars: StaticConfig,
}

/// What a setup hook can see and change
pub struct SetupEnv {
    /// The working directory for the script
    pub work_dir: PathBuf,
    /// Script name
    pub test_name: String,
    /// Environment variables exported to shell devices
    pub env: Vec<(String, String)>,
    /// Configuration variables for this script only
    pub vars: StaticConfig,
    sessions: Vec<(String, Box<dyn DeviceSession>)>,
}

impl SetupEnv {
    /// Bind a session to `device` for this script, overriding shell devices
    pub fn bind_session(&mut self, device: impl Into<String>, session: Box<dyn DeviceSession>) {
        self.sessions.push((device.into(), session));
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("testdata"),
            filter: None,
            workdir_root: None,
            preserve_work: false,
            setup: None,
            verbose: false,
            extensions: vec![".dvs".into(), ".txtar".into()],
            devices: Vec::new(),
            vars: StaticConfig::new(),
        }
    }
}

/// Result of running every discovered script
#[derive(Debug)]
pub struct TestResult {
    pub cases: Vec<TestCaseResult>,
    pub duration: Duration,
}

impl TestResult {
    pub fn all_passed(&self) -> bool {
        self.cases.iter().all(|c| c.passed)
    }

    pub fn passed_count(&self) -> usize {
        self.cases.iter().filter(|c| c.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.cases.iter().filter(|c| !c.passed).count()
    }

    /// Outcomes recorded across all scripts
    pub fn outcome_count(&self) -> usize {
        self.cases.iter().map(|c| c.outcomes.len()).sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} passed, {} failed, {} checks ({}ms)",
            self.passed_count(),
            self.failed_count(),
            self.outcome_count(),
            self.duration.as_millis(),
        )
    }
}

/// Result of one script
#[derive(Debug)]
pub struct TestCaseResult {
    /// File name without extension; also the default test case id
    pub name: String,
    pub file: PathBuf,
    pub passed: bool,
    /// Compile error, fatal error or the first recoverable error
    pub error: Option<String>,
    /// Run transcript
    pub log: String,
    /// Outcomes recorded by assertions
    pub outcomes: Vec<Outcome>,
    pub duration: Duration,
    /// Working directory, when kept
    pub workdir: Option<PathBuf>,
}

/// Script loaded from disk, ready to compile
enum Script {
    Plain { root: PathBuf, file: String },
    Bundle { name: String, archive: emx_txtar::Archive, root: PathBuf },
}

/// The runner
pub struct TestRunner {
    engine: Engine,
    config: RunConfig,
    schema: Arc<Schema>,
    cache: Arc<InstructionCache>,
}

impl TestRunner {
    pub fn new(config: RunConfig) -> Self {
        Self::with_engine(Engine::new(), config)
    }

    pub fn with_engine(engine: Engine, config: RunConfig) -> Self {
        Self {
            engine,
            config,
            schema: Arc::new(Schema::with_builtins()),
            cache: Arc::new(InstructionCache::new()),
        }
    }

    /// Mutable engine, for registering custom operations
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Compile with `schema` instead of the built-in one
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Arc::new(schema);
        self
    }

    /// Instruction cache shared by every script of this runner
    pub fn cache(&self) -> &Arc<InstructionCache> {
        &self.cache
    }

    /// Discover script files in the configured directory
    pub fn discover(&self) -> Result<Vec<PathBuf>, std::io::Error> {
        let mut files = Vec::new();
        let dir = &self.config.dir;

        if !dir.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("script directory not found: {}", dir.display()),
            ));
        }

        if dir.is_file() {
            files.push(dir.clone());
            return Ok(files);
        }

        self.scan_dir(dir, &mut files)?;
        files.sort();
        Ok(files)
    }

    fn scan_dir(&self, dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.scan_dir(&path, files)?;
            } else if self.is_test_file(&path) {
                if let Some(ref filter) = self.config.filter {
                    let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
                    if !name.contains(filter.as_str()) {
                        continue;
                    }
                }
                files.push(path);
            }
        }
        Ok(())
    }

    fn is_test_file(&self, path: &Path) -> bool {
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => self.config.extensions.iter().any(|ext| name.ends_with(ext.as_str())),
            None => false,
        }
    }

    pub fn count_tests(&self) -> Result<usize, std::io::Error> {
        Ok(self.discover()?.len())
    }

    /// Run every discovered script, one after another
    pub fn run_all(&self) -> Result<TestResult, std::io::Error> {
        let start = Instant::now();
        let files = self.discover()?;
        let cases = files.iter().map(|f| self.run_one(f)).collect();
        Ok(TestResult {
            cases,
            duration: start.elapsed(),
        })
    }

    /// Compile `file` without running it, with the shared configuration
    pub fn compile(&self, file: &Path) -> Result<Arc<InstructionList>, String> {
        let script = self.load(file)?;
        self.compile_script(&script, Arc::new(self.config.vars.clone()))
            .map_err(|e| e.to_string())
    }

    /// Run a single script file
    pub fn run_one(&self, file: &Path) -> TestCaseResult {
        let start = Instant::now();
        let name = file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        log::info!("running {}", file.display());

        let mut result = TestCaseResult {
            name: name.clone(),
            file: file.to_path_buf(),
            passed: false,
            error: None,
            log: String::new(),
            outcomes: Vec::new(),
            duration: Duration::ZERO,
            workdir: None,
        };

        let prepared = self
            .load(file)
            .and_then(|script| self.create_workdir(&name).map(|dir| (script, dir)).map_err(|e| {
                format!("failed to create workdir: {}", e)
            }));
        let (script, tmpdir) = match prepared {
            Ok(pair) => pair,
            Err(error) => {
                result.error = Some(error);
                result.duration = start.elapsed();
                return result;
            }
        };

        let sink = Arc::new(MemorySink::new());
        let workdir = tmpdir.path().to_path_buf();
        match self.execute(&name, &script, &workdir, sink.clone()) {
            Ok(state) => {
                result.error = match &state.status {
                    RunStatus::Completed => state.errors.first().map(|e| e.to_string()),
                    RunStatus::Failed(e) => Some(e.to_string()),
                    other => Some(format!("run ended {:?}", other)),
                };
                result.passed = result.error.is_none() && sink.failures() == 0;
                result.log = state.log;
            }
            Err(error) => result.error = Some(error),
        }
        result.outcomes = sink.outcomes();

        // keep the working directory of failed scripts for inspection
        if self.config.preserve_work || !result.passed {
            result.workdir = Some(workdir);
            std::mem::forget(tmpdir);
        }
        result.duration = start.elapsed();
        result
    }

    fn load(&self, file: &Path) -> Result<Script, String> {
        let root = file.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let is_bundle = file.extension().map_or(false, |ext| ext == "txtar");
        if !is_bundle {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| format!("invalid file name: {}", file.display()))?;
            return Ok(Script::Plain { root, file: name.to_string() });
        }

        let data = std::fs::read_to_string(file).map_err(|e| format!("failed to read file: {}", e))?;
        let archive = emx_txtar::Decoder::new()
            .decode(&data)
            .map_err(|e| format!("failed to parse txtar: {}", e))?;
        Ok(Script::Bundle {
            name: file.to_string_lossy().into_owned(),
            archive,
            root,
        })
    }

    fn compile_script(
        &self,
        script: &Script,
        config: Arc<StaticConfig>,
    ) -> Result<Arc<InstructionList>, CompileError> {
        match script {
            Script::Plain { root, file } => self
                .compiler(Arc::new(FsResolver::new(root.clone())), config)
                .compile_file(file),
            Script::Bundle { name, archive, root } => {
                let resolver = ArchiveResolver::new(name.as_str(), archive).with_fallback(FsResolver::new(root.clone()));
                self.compiler(Arc::new(resolver), config)
                    .compile_source(name, &archive.comment)
                    .map(Arc::new)
            }
        }
    }

    fn compiler(&self, resolver: Arc<dyn IncludeResolver>, config: Arc<StaticConfig>) -> Compiler {
        Compiler::new(resolver)
            .with_config(config)
            .with_schema(self.schema.clone())
            .with_cache(self.cache.clone())
    }

    /// Extract fixtures, run setup, compile and run. Returns the final state.
    fn execute(
        &self,
        name: &str,
        script: &Script,
        workdir: &Path,
        sink: Arc<MemorySink>,
    ) -> Result<State, String> {
        if let Script::Bundle { archive, .. } = script {
            extract_files(archive, workdir).map_err(|e| format!("failed to extract files: {}", e))?;
        }

        let mut env = SetupEnv {
            work_dir: workdir.to_path_buf(),
            test_name: name.to_string(),
            env: Vec::new(),
            vars: self.config.vars.clone(),
            sessions: Vec::new(),
        };
        env.vars.set("WORK", workdir.to_string_lossy());
        if let Some(ref setup) = self.config.setup {
            setup(&mut env).map_err(|e| format!("setup failed: {}", e))?;
        }
        let SetupEnv { vars, env, sessions, .. } = env;
        let config = Arc::new(vars);

        // cached include lists are keyed by path alone, so include paths only
        // see the shared configuration and never WORK or setup values
        let list = self
            .compile_script(script, Arc::new(self.config.vars.clone()))
            .map_err(|e| e.to_string())?;

        let mut state = State::new(config, sink)
            .with_test_case(name)
            .with_factory(self.shell_factory(workdir, env));
        for (device, session) in sessions {
            state.bind_session(device, session);
        }

        let mut status = self.engine.run(&list, &mut state);
        while status == RunStatus::Suspended {
            log::debug!("{}: resuming after breakpoint at instruction {}", name, state.pc);
            status = self.engine.resume(&list, &mut state);
        }
        Ok(state)
    }

    fn shell_factory(&self, workdir: &Path, env: Vec<(String, String)>) -> SessionFactory {
        let devices = self.config.devices.clone();
        let workdir = workdir.to_path_buf();
        Arc::new(move |name: &str| {
            if !devices.iter().any(|d| d == name || d == "*") {
                return None;
            }
            let mut session = ShellSession::new(workdir.clone()).env("DEVICE", name);
            for (k, v) in &env {
                session = session.env(k, v);
            }
            Some(Box::new(session) as Box<dyn DeviceSession>)
        })
    }

    fn create_workdir(&self, name: &str) -> Result<tempfile::TempDir, std::io::Error> {
        let prefix = format!("devscript-{}-", name);
        if let Some(ref root) = self.config.workdir_root {
            std::fs::create_dir_all(root)?;
            tempfile::Builder::new().prefix(&prefix).tempdir_in(root)
        } else {
            tempfile::Builder::new().prefix(&prefix).tempdir()
        }
    }
}

/// Write the archive members into `workdir`. Members may not escape it.
fn extract_files(archive: &emx_txtar::Archive, workdir: &Path) -> Result<(), std::io::Error> {
    for file in &archive.files {
        let member = normalize(&file.name);
        if member.is_empty() || member.starts_with('/') || member.starts_with("..") {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("archive file '{}' escapes the working directory", file.name),
            ));
        }
        let path = workdir.join(&member);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &file.data)?;
    }
    Ok(())
}

/// Builder for [`TestRunner`]
pub struct TestRunnerBuilder {
    config: RunConfig,
    engine: Option<Engine>,
}

impl TestRunnerBuilder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            config: RunConfig {
                dir: dir.into(),
                ..Default::default()
            },
            engine: None,
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.config.filter = Some(filter.into());
        self
    }

    pub fn workdir_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.workdir_root = Some(root.into());
        self
    }

    pub fn preserve_work(mut self, preserve: bool) -> Self {
        self.config.preserve_work = preserve;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    pub fn extensions(mut self, exts: Vec<String>) -> Self {
        self.config.extensions = exts;
        self
    }

    /// Back `device` with a local shell
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.config.devices.push(device.into());
        self
    }

    /// Apply a `[DEVICE:]KEY=VALUE` assignment
    pub fn var(mut self, assignment: &str) -> Result<Self, crate::vars::ConfigError> {
        self.config.vars.assign(assignment)?;
        Ok(self)
    }

    pub fn setup(
        mut self,
        setup: impl Fn(&mut SetupEnv) -> Result<(), Box<dyn std::error::Error>> + Send + Sync + 'static,
    ) -> Self {
        self.config.setup = Some(Box::new(setup));
        self
    }

    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> TestRunner {
        match self.engine {
            Some(engine) => TestRunner::with_engine(engine, self.config),
            None => TestRunner::new(self.config),
        }
    }

    pub fn run(self) -> Result<TestResult, std::io::Error> {
        self.build().run_all()
    }
}

/// Start building a runner for `dir`
pub fn run(dir: impl Into<PathBuf>) -> TestRunnerBuilder {
    TestRunnerBuilder::new(dir)
}

/// Run the scripts under `dir` from a `#[test]`, panicking on failure.
///
/// ```rust,ignore
/// #[test]
/// fn device_scripts() {
///     emx_devscript::run_and_assert("tests/testscript");
/// }
/// ```
pub fn run_and_assert(dir: impl Into<PathBuf>) {
    run_and_assert_with(dir, |_, _| {});
}

/// Like [`run_and_assert`], with a hook to adjust the configuration and
/// the engine first.
pub fn run_and_assert_with(dir: impl Into<PathBuf>, customize: impl FnOnce(&mut RunConfig, &mut Engine)) {
    let mut config = RunConfig {
        dir: dir.into(),
        verbose: std::env::var("DEVSCRIPT_VERBOSE").is_ok(),
        preserve_work: std::env::var("DEVSCRIPT_WORK").is_ok(),
        ..Default::default()
    };
    let mut engine = Engine::new();
    customize(&mut config, &mut engine);

    let verbose = config.verbose;
    let runner = TestRunner::with_engine(engine, config);
    let result = match runner.run_all() {
        Ok(result) => result,
        Err(e) => panic!("failed to run scripts: {}", e),
    };

    for case in &result.cases {
        if case.passed {
            eprintln!("PASS  {} ({}ms)", case.name, case.duration.as_millis());
            if verbose {
                print_log(&case.log);
            }
        } else {
            eprintln!("FAIL  {}", case.name);
            if let Some(ref err) = case.error {
                eprintln!("  {}", err);
            }
            for outcome in case.outcomes.iter().filter(|o| !o.passed) {
                eprintln!("  [{}] {}", outcome.test_case, outcome.diagnostic);
            }
            print_log(&case.log);
            if let Some(ref wd) = case.workdir {
                eprintln!("  workdir: {}", wd.display());
            }
        }
    }

    eprintln!("\n{}", result.summary());

    if !result.all_passed() {
        panic!("{} script(s) failed", result.failed_count());
    }
}

fn print_log(log: &str) {
    if log.is_empty() {
        return;
    }
    eprintln!("  --- log ---");
    for line in log.lines() {
        eprintln!("  {}", line);
    }
}
