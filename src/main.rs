//! lab-bisect: locate the boundary between failing and passing published
//! compiler builds by running a test command against each candidate.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

mod builds;
mod config;
mod errors;
mod filters;
mod sandbox;
mod search;
mod store;

use builds::{Build, Revision};
use config::Config;
use errors::ExitStatusError;
use sandbox::{execute_sandboxed_test, ExecOptions};
use store::{best_match, Repository};

/// The builder bisected when none is named on the command line.
const DEFAULT_BUILDER: &str = "clang-stage1-configure-RA";

#[derive(Debug, Parser)]
#[command(
    version,
    about,
    after_help = "EXAMPLES:
    List the available builders, then the builds of one of them:
    ```
    lab-bisect ls
    lab-bisect ls clang-stage1-configure-RA
    ```

    Find the first build where a crash went away:
    ```
    lab-bisect bisect -b clang-stage1-configure-RA -- \\
      %(path)s/bin/clang -c crash.cpp
    ```

    Run two commands per build, failing the test when the second one takes
    a second or more of CPU time:
    ```
    lab-bisect bisect -- %(clang)s -O2 -c bench.c ---- \\
      '%%user_time < 1.0%%' ./run-benchmark.sh
    ```"
)]
struct Opts {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// List the available builder names, or the builds of one builder
    Ls {
        /// Builder whose builds should be listed, most recent first
        builder: Option<String>,
    },
    /// Fetch and extract a build into the current directory
    Fetch(FetchArgs),
    /// Find the first working build using binary search
    Bisect(BisectArgs),
    /// Run a test command against a single resolved build
    Exec(ExecArgs),
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// Always download and extract, removing conflicting paths first
    #[arg(short, long)]
    force: bool,

    /// Update a symbolic link at PATH to the extracted build on success
    #[arg(long, value_name = "PATH")]
    update_link: Option<PathBuf>,

    /// Resolve and print without downloading or extracting anything
    #[arg(short = 'd', long)]
    dry_run: bool,

    /// Builder to fetch from
    builder: String,

    /// Partial build name; the most recent build when omitted
    build_name: Option<String>,
}

#[derive(Debug, Args)]
struct BisectArgs {
    /// Builder whose builds are bisected
    #[arg(short = 'b', long = "builder", default_value = DEFAULT_BUILDER)]
    builder: String,

    /// Directory to use as the sandbox instead of a fresh temporary one
    #[arg(short = 's', long)]
    sandbox: Option<PathBuf>,

    /// Output more test information
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Output even more test information
    #[arg(short = 'V', long)]
    very_verbose: bool,

    /// Display the output captured from test commands
    #[arg(long)]
    show_output: bool,

    /// Test every build in order instead of binary stepping
    #[arg(long)]
    single_step: bool,

    /// Minimum revision to test
    #[arg(long, value_name = "N")]
    min_rev: Option<u64>,

    /// Maximum revision to test
    #[arg(long, value_name = "N")]
    max_rev: Option<u64>,

    /// Test command; separate multiple commands with ----
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Debug, Args)]
struct ExecArgs {
    /// Builder to resolve the build from
    #[arg(short = 'b', long = "builder", default_value = DEFAULT_BUILDER)]
    builder: String,

    /// Directory to use as the sandbox instead of a fresh temporary one
    #[arg(short = 's', long)]
    sandbox: Option<PathBuf>,

    /// Minimum revision to consider
    #[arg(long, value_name = "N")]
    min_rev: Option<u64>,

    /// Maximum revision to consider
    #[arg(long, value_name = "N")]
    max_rev: Option<u64>,

    /// Use the build nearest NAME instead of the latest
    #[arg(long, value_name = "NAME")]
    near: Option<String>,

    /// Test command; separate multiple commands with ----
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn main() {
    if let Err(err) = run() {
        match err.downcast::<ExitStatusError>() {
            Ok(ExitStatusError(code)) => process::exit(code),
            Err(err) => {
                eprintln!("Error: {}", err);
                process::exit(1);
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    env_logger::try_init()?;
    let opts = Opts::parse();
    let cfg = Config::load()?;
    let repo = Repository::new(&cfg);

    match &opts.command {
        Cmd::Ls { builder } => cmd_ls(&repo, builder.as_deref()),
        Cmd::Fetch(args) => cmd_fetch(&repo, args),
        Cmd::Bisect(args) => cmd_bisect(&repo, args),
        Cmd::Exec(args) => cmd_exec(&repo, args),
    }
}

fn verdict(result: bool) -> colored::ColoredString {
    if result {
        "PASS".green()
    } else {
        "FAIL".red()
    }
}

fn cmd_ls(repo: &Repository<'_>, builder: Option<&str>) -> anyhow::Result<()> {
    match builder {
        None => {
            for name in repo.list_builders()? {
                println!("{name}");
            }
        }
        Some(name) => {
            let builds = repo.list_builds(name)?;
            for build in builds.iter().rev() {
                println!("{}", build.to_basename(false));
            }
            // The list is ascending and every entry carries a revision.
            if let (Some(first), Some(last)) = (builds.first(), builds.last()) {
                if let (Some(min), Some(max)) = (&first.revision, &last.revision) {
                    eprintln!("Summary: found {} builds: r{min}-r{max}", builds.len());
                }
            }
        }
    }
    Ok(())
}

fn cmd_fetch(repo: &Repository<'_>, args: &FetchArgs) -> anyhow::Result<()> {
    let builds = repo.list_builds(&args.builder)?;
    let build = best_match(&builds, args.build_name.as_deref()).with_context(|| {
        format!(
            "no match for build {:?}",
            args.build_name.as_deref().unwrap_or("<latest>")
        )
    })?;

    let path = build.to_basename(true);
    if let Some(requested) = args.build_name.as_deref() {
        if !path.starts_with(requested) {
            eprintln!("no exact match, fetching {path:?}");
        }
    }

    let root_path = PathBuf::from(&path);
    let builddir_path = PathBuf::from(build.to_basename(false));

    if !args.dry_run {
        for p in [&root_path, &builddir_path] {
            if p.exists() {
                if args.force {
                    let _ = if p.is_dir() {
                        fs::remove_dir_all(p)
                    } else {
                        fs::remove_file(p)
                    };
                    continue;
                }
                bail!(
                    "current directory is not clean, {:?} exists (pass --force to replace it)",
                    p
                );
            }
        }
        repo.fetch_build_to_path(&args.builder, build, &root_path, &builddir_path)?;
    }

    println!("downloaded root: {}", root_path.display());
    println!("extracted path : {}", builddir_path.display());

    if !args.dry_run {
        if let Some(link) = &args.update_link {
            update_symlink(&builddir_path, link)?;
            println!("updated link at: {}", link.display());
        }
    }
    Ok(())
}

/// Repoints `link` at `target`, replacing whatever link was there before.
fn update_symlink(target: &Path, link: &Path) -> anyhow::Result<()> {
    match fs::remove_file(link) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "unable to update symbolic link at {}, cannot unlink",
                    link.display()
                )
            })
        }
    }
    let target = fs::canonicalize(target)?;
    #[cfg(unix)]
    std::os::unix::fs::symlink(&target, link)?;
    #[cfg(windows)]
    std::os::windows::fs::symlink_dir(&target, link)?;
    Ok(())
}

/// Drops builds outside the requested revision range.
fn retain_revision_range(builds: &mut Vec<Build>, min_rev: Option<u64>, max_rev: Option<u64>) {
    if let Some(min) = min_rev {
        let bound = Revision::Numbered(min);
        builds.retain(|b| b.revision.as_ref().map_or(false, |r| *r >= bound));
    }
    if let Some(max) = max_rev {
        let bound = Revision::Numbered(max);
        builds.retain(|b| b.revision.as_ref().map_or(false, |r| *r <= bound));
    }
}

/// The located boundary: `first_working` passed the test, and
/// `next_failing` (when present) is the adjacent older build that failed.
#[derive(Debug)]
struct BisectionResult<'b> {
    first_working: &'b Build,
    next_failing: Option<&'b Build>,
}

/// Runs the search over `builds` (ascending, oldest first). The test is
/// expected to fail on old builds and pass from some build onward; the
/// returned boundary is the first build where it passes.
fn run_bisection<'b>(
    repo: &Repository<'_>,
    args: &BisectArgs,
    builds: &'b [Build],
) -> anyhow::Result<BisectionResult<'b>> {
    let opts = ExecOptions {
        sandbox: args.sandbox.clone(),
        reuse_sandbox: false,
        verbose: args.verbose || args.very_verbose,
        very_verbose: args.very_verbose,
        add_path_variables: true,
        show_command_output: args.show_output || args.very_verbose,
    };

    // Infrastructure failures inside the predicate are recorded and
    // short-circuit the remaining probes; the search result is then
    // discarded in favor of the error.
    let mut failure: Option<anyhow::Error> = None;
    let mut predicate = |build: &Build| -> bool {
        if failure.is_some() {
            return false;
        }
        match execute_sandboxed_test(repo, &args.builder, build, &args.command, &opts) {
            Ok((result, _)) => {
                println!("{}: {}", verdict(result), build.to_basename(false));
                result
            }
            Err(err) => {
                failure = Some(err.into());
                false
            }
        }
    };

    let found = if args.single_step {
        builds.iter().find(|&build| predicate(build))
    } else if args.min_rev.is_some() && args.max_rev.is_some() {
        // The caller bounded the search; bisect the range directly.
        search::bisect(&mut predicate, builds)
    } else {
        match search::gallop(&mut predicate, builds) {
            Some(window) => search::bisect(&mut predicate, window),
            None => None,
        }
    };

    if let Some(failure) = failure {
        return Err(failure);
    }
    let first_working = match found {
        Some(build) => build,
        None => bail!("unable to find any passing build!"),
    };

    let index = builds
        .iter()
        .position(|build| build == first_working)
        .unwrap_or(0);
    let next_failing = if index == 0 {
        None
    } else {
        Some(&builds[index - 1])
    };
    Ok(BisectionResult {
        first_working,
        next_failing,
    })
}

fn cmd_bisect(repo: &Repository<'_>, args: &BisectArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let mut builds = repo.list_builds(&args.builder)?;
    if args.very_verbose {
        eprintln!("fetched builds in {:.2}s", start.elapsed().as_secs_f64());
    }

    retain_revision_range(&mut builds, args.min_rev, args.max_rev);
    if builds.is_empty() {
        bail!(
            "no builds in the requested revision range for builder {:?}",
            args.builder
        );
    }

    let result = run_bisection(repo, args, &builds)?;
    println!("{}: first working build", result.first_working.to_basename(false));
    match result.next_failing {
        Some(build) => println!("{}: next failing build", build.to_basename(false)),
        None => println!("no failing builds!?"),
    }
    Ok(())
}

fn cmd_exec(repo: &Repository<'_>, args: &ExecArgs) -> anyhow::Result<()> {
    let mut builds = repo.list_builds(&args.builder)?;
    retain_revision_range(&mut builds, args.min_rev, args.max_rev);
    if builds.is_empty() {
        bail!("no builds available for builder name: {}", args.builder);
    }

    let build = best_match(&builds, args.near.as_deref())
        .with_context(|| format!("no match for build {:?}", args.near.as_deref().unwrap_or("")))?;

    let opts = ExecOptions {
        sandbox: args.sandbox.clone(),
        verbose: true,
        show_command_output: true,
        ..ExecOptions::default()
    };
    let (result, _) = execute_sandboxed_test(repo, &args.builder, build, &args.command, &opts)?;
    println!("{}: {}", verdict(result), build.to_basename(false));

    if !result {
        return Err(ExitStatusError(1).into());
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::store::testing::FakeStore;

    fn test_config(dir: &Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            store_url: "http://localhost:0".to_string(),
            bucket: "unused".to_string(),
            cache_builds: false,
            only_use_cache: false,
        }
    }

    fn bisect_args(command: &[&str]) -> BisectArgs {
        BisectArgs {
            builder: "demo".to_string(),
            sandbox: None,
            verbose: false,
            very_verbose: false,
            show_output: false,
            single_step: false,
            min_rev: None,
            max_rev: None,
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// demo builder: r100 fails the test, r150 and r200 pass it.
    fn demo_store() -> FakeStore {
        let store = FakeStore::default();
        store.add_archive(
            "demo",
            "clang-r100.tar.gz",
            FakeStore::tar_gz_with_marker("bad"),
        );
        store.add_archive(
            "demo",
            "clang-r150.tar.gz",
            FakeStore::tar_gz_with_marker("ok"),
        );
        store.add_archive(
            "demo",
            "clang-r200.tar.gz",
            FakeStore::tar_gz_with_marker("ok"),
        );
        store
    }

    const MARKER_TEST: &[&str] = &["sh", "-c", "grep -q ok %(path)s/marker"];

    fn revision_of(build: &Build) -> u64 {
        build.revision.as_ref().and_then(Revision::as_u64).unwrap()
    }

    #[test]
    fn bisect_finds_first_working_and_next_failing() {
        let home = tempfile::tempdir().unwrap();
        let cfg = test_config(home.path());
        let store = demo_store();
        let repo = Repository::with_store(&cfg, Box::new(&store));

        let builds = repo.list_builds("demo").unwrap();
        let result = run_bisection(&repo, &bisect_args(MARKER_TEST), &builds).unwrap();

        assert_eq!(revision_of(result.first_working), 150);
        assert_eq!(revision_of(result.next_failing.unwrap()), 100);
    }

    #[test]
    fn single_step_agrees_with_bisection() {
        let home = tempfile::tempdir().unwrap();
        let cfg = test_config(home.path());
        let store = demo_store();
        let repo = Repository::with_store(&cfg, Box::new(&store));

        let builds = repo.list_builds("demo").unwrap();
        let mut args = bisect_args(MARKER_TEST);
        args.single_step = true;
        let result = run_bisection(&repo, &args, &builds).unwrap();

        assert_eq!(revision_of(result.first_working), 150);
        assert_eq!(revision_of(result.next_failing.unwrap()), 100);
    }

    #[test]
    fn explicit_bounds_bisect_the_range_directly() {
        let home = tempfile::tempdir().unwrap();
        let cfg = test_config(home.path());
        let store = demo_store();
        let repo = Repository::with_store(&cfg, Box::new(&store));

        let mut builds = repo.list_builds("demo").unwrap();
        let mut args = bisect_args(MARKER_TEST);
        args.min_rev = Some(100);
        args.max_rev = Some(200);
        retain_revision_range(&mut builds, args.min_rev, args.max_rev);
        let result = run_bisection(&repo, &args, &builds).unwrap();

        assert_eq!(revision_of(result.first_working), 150);
        assert_eq!(revision_of(result.next_failing.unwrap()), 100);
    }

    #[test]
    fn revision_range_filter_drops_out_of_range_builds() {
        let home = tempfile::tempdir().unwrap();
        let cfg = test_config(home.path());
        let store = demo_store();
        let repo = Repository::with_store(&cfg, Box::new(&store));

        let mut builds = repo.list_builds("demo").unwrap();
        retain_revision_range(&mut builds, Some(150), None);
        let revisions: Vec<u64> = builds.iter().map(revision_of).collect();
        assert_eq!(revisions, vec![150, 200]);

        retain_revision_range(&mut builds, None, Some(150));
        let revisions: Vec<u64> = builds.iter().map(revision_of).collect();
        assert_eq!(revisions, vec![150]);
    }

    #[test]
    fn no_passing_build_is_fatal() {
        let home = tempfile::tempdir().unwrap();
        let cfg = test_config(home.path());
        let store = FakeStore::default();
        store.add_archive(
            "demo",
            "clang-r100.tar.gz",
            FakeStore::tar_gz_with_marker("bad"),
        );
        store.add_archive(
            "demo",
            "clang-r200.tar.gz",
            FakeStore::tar_gz_with_marker("bad"),
        );
        let repo = Repository::with_store(&cfg, Box::new(&store));

        let builds = repo.list_builds("demo").unwrap();
        let err = run_bisection(&repo, &bisect_args(MARKER_TEST), &builds).unwrap_err();
        assert!(err.to_string().contains("unable to find any passing build"));
    }

    #[test]
    fn oldest_build_passing_means_no_failing_builds() {
        let home = tempfile::tempdir().unwrap();
        let cfg = test_config(home.path());
        let store = FakeStore::default();
        store.add_archive(
            "demo",
            "clang-r100.tar.gz",
            FakeStore::tar_gz_with_marker("ok"),
        );
        store.add_archive(
            "demo",
            "clang-r200.tar.gz",
            FakeStore::tar_gz_with_marker("ok"),
        );
        let repo = Repository::with_store(&cfg, Box::new(&store));

        let builds = repo.list_builds("demo").unwrap();
        let result = run_bisection(&repo, &bisect_args(MARKER_TEST), &builds).unwrap();
        assert_eq!(revision_of(result.first_working), 100);
        assert!(result.next_failing.is_none());
    }
}
