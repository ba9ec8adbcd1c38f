//! emx-devscript CLI
//!
//! Run device test scripts from `.dvs` files and `.txtar` bundles.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use emx_devscript::{Engine, RunConfig, Schema, StaticConfig, TestRunner};
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

#[derive(Parser, Debug)]
#[command(name = "emx-devscript")]
#[command(author = "nzinfo <li.monan@gmail.com>")]
#[command(version)]
#[command(about = "Run device test scripts over interactive CLI sessions")]
struct Cli {
    /// Directory or file to run
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Only run scripts whose name contains this string
    #[arg(short = 'f', long)]
    filter: Option<String>,

    /// Verbose output: show run transcripts and debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Keep working directories after each script
    #[arg(short = 'k', long = "keep")]
    keep: bool,

    /// Root directory for working directories
    #[arg(long = "workdir")]
    workdir: Option<PathBuf>,

    /// File extensions to match
    #[arg(long = "ext", default_values_t = [".dvs".to_string(), ".txtar".to_string()])]
    extensions: Vec<String>,

    /// List built-in operations and exit
    #[arg(long = "list-operations")]
    list_operations: bool,

    /// Configuration variable ([DEVICE:]KEY=VALUE)
    #[arg(short = 'e', long = "var")]
    vars: Vec<String>,

    /// File of configuration variables, one KEY=VALUE per line
    #[arg(long = "vars")]
    vars_files: Vec<PathBuf>,

    /// Device backed by a local shell ('*' for any)
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Fail a script on its first runtime error
    #[arg(long)]
    strict: bool,

    /// Show number of scripts without running
    #[arg(long = "count")]
    count: bool,

    /// Print the compiled instructions of each script without running
    #[arg(long = "dump")]
    dump: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Warn };
    // a logger may already be installed when embedded; that is fine
    let _ = TermLogger::init(level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto);

    if cli.list_operations {
        print_operations();
        return ExitCode::SUCCESS;
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let vars = load_vars(&cli.vars_files, &cli.vars)?;

    let is_file = cli.path.is_file();
    let config = RunConfig {
        dir: cli.path.clone(),
        filter: if is_file { None } else { cli.filter },
        workdir_root: cli.workdir,
        preserve_work: cli.keep,
        setup: None,
        verbose: cli.verbose,
        extensions: cli.extensions,
        devices: cli.devices,
        vars,
    };
    let runner = TestRunner::with_engine(Engine::with_strictness(cli.strict), config);

    if cli.count {
        let count = runner.count_tests().context("discovering scripts")?;
        println!("Found {} script(s)", count);
        return Ok(ExitCode::SUCCESS);
    }

    if cli.dump {
        return dump(&runner);
    }

    let result = runner.run_all().context("running scripts")?;

    for case in &result.cases {
        if case.passed {
            println!("PASS  {} ({}ms)", case.name, case.duration.as_millis());
            if cli.verbose {
                print_indented(&case.log);
            }
        } else {
            println!("FAIL  {}", case.name);
            if let Some(ref err) = case.error {
                print_indented(err);
            }
            for outcome in case.outcomes.iter().filter(|o| !o.passed) {
                println!("      [{}] {}", outcome.test_case, outcome.diagnostic);
            }
            if !case.log.is_empty() {
                println!("      --- log ---");
                print_indented(&case.log);
            }
            if let Some(ref wd) = case.workdir {
                println!("      workdir: {}", wd.display());
            }
        }
    }

    println!();
    println!("{}", result.summary());

    Ok(if result.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn load_vars(files: &[PathBuf], assignments: &[String]) -> anyhow::Result<StaticConfig> {
    let mut vars = StaticConfig::new();
    for file in files {
        let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
        vars.load_str(&text).with_context(|| format!("loading {}", file.display()))?;
    }
    for assignment in assignments {
        vars.assign(assignment).with_context(|| format!("-e {}", assignment))?;
    }
    Ok(vars)
}

fn dump(runner: &TestRunner) -> anyhow::Result<ExitCode> {
    let mut failed = false;
    for file in runner.discover().context("discovering scripts")? {
        println!("== {}", file.display());
        match runner.compile(&file) {
            Ok(list) => print!("{}", list.to_text()),
            Err(e) => {
                println!("      {}", e);
                failed = true;
            }
        }
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn print_indented(text: &str) {
    for line in text.lines() {
        println!("      {}", line);
    }
}

fn print_operations() {
    println!("Built-in operations:");
    println!();

    let engine = Engine::new();
    for name in engine.operation_names() {
        if let Some(op) = engine.operations.get(name) {
            let usage = op.usage();
            println!("  {:<14} {}", name, usage.summary);
            println!("  {:<14} {} {}", "", name, usage.args);
        }
    }

    println!();
    println!("Control keywords:");
    println!();
    let schema = Schema::builtin();
    for kw in emx_devscript::CONTROL_KEYWORDS {
        if let Some(op) = schema.lookup(kw) {
            println!("  <{}>", op.usage());
        }
    }

    println!();
    println!("Variables:");
    println!("  $NAME        configuration variable (-e, --vars), scoped by device");
    println!("  {{$NAME}}      runtime variable set by the script");
}
