//! The sandboxed test executor.
//!
//! Materializes one build into a scratch directory and runs the
//! user-supplied test commands against it, capturing per-command logs and
//! timing metrics. The command spec is a single argument vector; `----`
//! separates sub-commands, and leading `%%expr%%` tokens of a sub-command
//! are result filters (see [`crate::filters`]).

use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use log::warn;

use crate::builds::Build;
use crate::filters::{FilterExpr, FilterParseError, Metrics};
use crate::store::{Repository, StoreError};

/// Binary names looked up inside the extracted build. Missing binaries are
/// not fatal; the matching interpolation variables stay empty.
const COMPILER_DRIVER: &str = "clang";
const COMPILER_DRIVER_CXX: &str = "clang++";
const LTO_LIBRARIES: &[&str] = &["libLTO.dylib", "libLTO.so"];

#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("sandbox is not clean, {} exists", .0.display())]
    NotClean(PathBuf),
    #[error("invalid command: only contains filter specifications")]
    OnlyFilters,
    #[error("invalid command, executable doesn't exist: {0:?}")]
    MissingExecutable(String),
    #[error(
        "invalid command, executable has a bad format. Did you forget to \
         put a #! at the top of a script?: {0:?}"
    )]
    BadExecutableFormat(String),
    #[error("could not run {command:?}: {err}")]
    Spawn {
        command: String,
        #[source]
        err: io::Error,
    },
    #[error("unknown interpolation variable {0:?}")]
    UnknownVariable(String),
    #[error("malformed interpolation in {0:?}, expected %(name)s")]
    MalformedInterpolation(String),
    #[error(transparent)]
    Filter(#[from] FilterParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Io(#[from] io::Error),
}

pub struct ExecOptions {
    /// Explicit sandbox directory; a fresh temporary directory when unset.
    pub sandbox: Option<PathBuf>,
    /// Skip fetch/extract when the sandbox already holds this build.
    pub reuse_sandbox: bool,
    pub verbose: bool,
    pub very_verbose: bool,
    /// Prepend the extracted build's bin/ and lib/ directories to the
    /// search-path variables of the child environment.
    pub add_path_variables: bool,
    pub show_command_output: bool,
}

impl Default for ExecOptions {
    fn default() -> ExecOptions {
        ExecOptions {
            sandbox: None,
            reuse_sandbox: false,
            verbose: false,
            very_verbose: false,
            add_path_variables: true,
            show_command_output: false,
        }
    }
}

/// One finished (or attempted) sub-command of a test run.
#[derive(Debug)]
pub struct ExecutedCommand {
    pub argv: Vec<String>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub metrics: Metrics,
    pub result: bool,
}

/// Runs the full test spec against `build` inside a sandbox.
///
/// Returns the overall verdict (the AND of every executed sub-command's
/// filtered result) plus the per-command records. A temporary sandbox is
/// removed before returning, success or not.
pub fn execute_sandboxed_test(
    repo: &Repository<'_>,
    builder: &str,
    build: &Build,
    args: &[String],
    opts: &ExecOptions,
) -> Result<(bool, Vec<ExecutedCommand>), SandboxError> {
    let path = build.to_basename(false);
    let fullpath = build.to_basename(true);

    if opts.verbose {
        eprintln!("testing {path:?}");
    }

    // Acquire the sandbox. The TempDir handle owns cleanup: dropping it on
    // any exit path below removes the directory tree.
    let _temp_guard;
    let sandbox = match &opts.sandbox {
        None => {
            let temp = tempfile::tempdir()?;
            let path = temp.path().to_path_buf();
            _temp_guard = Some(temp);
            path
        }
        Some(dir) => {
            _temp_guard = None;
            let dir = if dir.is_absolute() {
                dir.clone()
            } else {
                env::current_dir()?.join(dir)
            };
            if !dir.exists() {
                fs::create_dir(&dir)?;
            }
            dir
        }
    };

    // Materialize the build, refusing to clobber a dirty sandbox.
    let root_path = sandbox.join(&fullpath);
    let builddir_path = sandbox.join(&path);
    let need_build = if opts.reuse_sandbox && root_path.exists() && builddir_path.exists() {
        false
    } else {
        for p in [&root_path, &builddir_path] {
            if p.exists() {
                return Err(SandboxError::NotClean(p.to_path_buf()));
            }
        }
        true
    };
    if need_build {
        let start = Instant::now();
        repo.fetch_build_to_path(builder, build, &root_path, &builddir_path)?;
        if opts.very_verbose {
            eprintln!("extracted build in {:.2}s", start.elapsed().as_secs_f64());
        }
    }

    // Locate toolchain binaries, best effort.
    let clang_path = find_file(&builddir_path, &[COMPILER_DRIVER]);
    let clangpp_path = find_file(&builddir_path, &[COMPILER_DRIVER_CXX]);
    let liblto_dir = find_file(&builddir_path, LTO_LIBRARIES)
        .and_then(|p| p.parent().map(Path::to_path_buf));

    let display = |p: &Option<PathBuf>| {
        p.as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    };
    let vars: Vec<(&str, String)> = vec![
        ("sandbox", sandbox.display().to_string()),
        ("path", builddir_path.display().to_string()),
        (
            "revision",
            build
                .revision
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_default(),
        ),
        (
            "build",
            build
                .build_number
                .as_ref()
                .map(|b| b.to_string())
                .unwrap_or_default(),
        ),
        ("clang", display(&clang_path)),
        ("clang++", display(&clangpp_path)),
        ("libltodir", display(&liblto_dir)),
    ];

    let augment = opts
        .add_path_variables
        .then(|| discover_path_augmentations(&builddir_path));
    let child_env = build_environment(env::vars(), &vars, augment.as_ref());

    // Split the argument vector into sub-commands and their filters.
    let mut commands = Vec::new();
    for spec in args.split(|arg| arg == "----") {
        commands.push(split_command_filters(spec)?);
    }

    // Execute in order, stopping at the first failure.
    let mut executed: Vec<ExecutedCommand> = Vec::new();
    let mut interpolated = false;
    for (index, (filters, argv)) in commands.iter().enumerate() {
        let rendered = argv
            .iter()
            .map(|arg| interpolate(arg, &vars))
            .collect::<Result<Vec<_>, _>>()?;
        if rendered != *argv {
            interpolated = true;
        }

        if opts.verbose {
            let shown: Vec<String> = rendered.iter().map(|a| format!("'{a}'")).collect();
            eprintln!("executing: {}", shown.join(" "));
        }

        let stdout_path = sandbox.join(format!("{path}.{index}.stdout"));
        let stderr_path = sandbox.join(format!("{path}.{index}.stderr"));
        let (status_ok, metrics) = run_command(&rendered, &stdout_path, &stderr_path, &child_env)?;
        if opts.verbose {
            eprintln!(
                "command executed in -- user: {:.4}s, wall: {:.4}s, sys: {:.4}s",
                metrics.user_time, metrics.wall_time, metrics.sys_time
            );
        }

        let mut result = status_ok;
        for filter in filters {
            result = filter.evaluate(result, &metrics);
        }

        if opts.show_command_output {
            echo_captured_output(&stdout_path, &stderr_path);
        }

        executed.push(ExecutedCommand {
            argv: rendered,
            stdout_path,
            stderr_path,
            metrics,
            result,
        });
        if !result {
            break;
        }
    }

    if !interpolated {
        warn!("no substitutions found. Fetched root ignored?");
    }

    let overall = executed.iter().all(|c| c.result);
    Ok((overall, executed))
}

/// Consumes the leading `%%expr%%` tokens of one sub-command. A
/// sub-command with nothing left after them is a configuration error.
fn split_command_filters(
    command: &[String],
) -> Result<(Vec<FilterExpr>, Vec<String>), SandboxError> {
    let mut filters = Vec::new();
    let mut rest = 0;
    for arg in command {
        if arg.len() >= 4 && arg.starts_with("%%") && arg.ends_with("%%") {
            filters.push(FilterExpr::parse(&arg[2..arg.len() - 2])?);
            rest += 1;
        } else {
            break;
        }
    }
    if rest == command.len() {
        return Err(SandboxError::OnlyFilters);
    }
    Ok((filters, command[rest..].to_vec()))
}

/// `%(name)s` substitution over the interpolation variables. Only the
/// string conversion is supported; unknown names are an error.
fn interpolate(arg: &str, vars: &[(&str, String)]) -> Result<String, SandboxError> {
    let mut out = String::new();
    let mut rest = arg;
    while let Some(pos) = rest.find("%(") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let close = after
            .find(')')
            .ok_or_else(|| SandboxError::MalformedInterpolation(arg.to_string()))?;
        let key = &after[..close];
        if !after[close + 1..].starts_with('s') {
            return Err(SandboxError::MalformedInterpolation(arg.to_string()));
        }
        let value = vars
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.as_str())
            .ok_or_else(|| SandboxError::UnknownVariable(key.to_string()))?;
        out.push_str(value);
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Depth-first search of the extracted tree for the first file carrying
/// one of `names`. Best effort; unreadable directories are skipped.
fn find_file(root: &Path, names: &[&str]) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if names.contains(&name) {
                return Some(path);
            }
        }
    }
    subdirs.into_iter().find_map(|dir| find_file(&dir, names))
}

/// Discovered bin/ and lib/ directories to prepend to the child's search
/// paths.
struct PathAugment {
    bin_dirs: Vec<PathBuf>,
    lib_dirs: Vec<PathBuf>,
}

/// Probes the fixed set of known package roots inside an extracted build.
fn discover_path_augmentations(builddir: &Path) -> PathAugment {
    let mut roots = vec![PathBuf::new(), PathBuf::from("Developer/usr")];
    let toolchains = builddir.join("Applications/Xcode.app/Contents/Developer/Toolchains");
    if let Ok(entries) = fs::read_dir(&toolchains) {
        for entry in entries.flatten() {
            roots.push(entry.path().join("usr"));
        }
    }

    let mut augment = PathAugment {
        bin_dirs: Vec::new(),
        lib_dirs: Vec::new(),
    };
    for root in roots {
        let bin = builddir.join(&root).join("bin");
        if bin.exists() {
            augment.bin_dirs.push(bin);
        }
        let lib = builddir.join(&root).join("lib");
        if lib.exists() {
            augment.lib_dirs.push(lib);
        }
    }
    augment
}

const PATH_LIST_SEPARATOR: char = if cfg!(windows) { ';' } else { ':' };

/// Builds the complete child environment from an explicit base. Each
/// interpolation variable is exported as `TEST_<NAME>`; discovered bin/
/// and lib/ directories are prepended to the search-path variables.
fn build_environment(
    base: impl IntoIterator<Item = (String, String)>,
    vars: &[(&str, String)],
    augment: Option<&PathAugment>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = base.into_iter().collect();
    for (name, value) in vars {
        env.insert(format!("TEST_{}", name.to_uppercase()), value.clone());
    }

    if let Some(augment) = augment {
        let prepend = |env: &mut HashMap<String, String>, key: &str, dirs: &[PathBuf]| {
            if dirs.is_empty() {
                return;
            }
            let mut parts: Vec<String> = dirs.iter().map(|d| d.display().to_string()).collect();
            parts.push(env.get(key).cloned().unwrap_or_default());
            env.insert(key.to_string(), parts.join(&PATH_LIST_SEPARATOR.to_string()));
        };
        prepend(&mut env, "PATH", &augment.bin_dirs);
        prepend(&mut env, "LD_LIBRARY_PATH", &augment.lib_dirs);
        prepend(&mut env, "DYLD_LIBRARY_PATH", &augment.lib_dirs);
    }

    env
}

#[derive(Clone, Copy, Default)]
struct CpuTimes {
    user: f64,
    sys: f64,
}

#[cfg(unix)]
fn children_cpu_times() -> CpuTimes {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) };
    if rc != 0 {
        return CpuTimes::default();
    }
    let seconds =
        |tv: libc::timeval| -> f64 { tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0 };
    CpuTimes {
        user: seconds(usage.ru_utime),
        sys: seconds(usage.ru_stime),
    }
}

#[cfg(not(unix))]
fn children_cpu_times() -> CpuTimes {
    CpuTimes::default()
}

/// Spawns one sub-command with the prepared environment, logs captured.
/// The metrics cover the span from just before the spawn to just after
/// the wait, with user/sys time taken from child resource accounting.
fn run_command(
    argv: &[String],
    stdout_path: &Path,
    stderr_path: &Path,
    env: &HashMap<String, String>,
) -> Result<(bool, Metrics), SandboxError> {
    let stdout = fs::File::create(stdout_path)?;
    let stderr = fs::File::create(stderr_path)?;

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .env_clear()
        .envs(env);

    let start_cpu = children_cpu_times();
    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|err| classify_spawn_error(err, &argv[0]))?;
    let status = child.wait().map_err(|err| SandboxError::Spawn {
        command: argv[0].clone(),
        err,
    })?;
    let wall_time = start.elapsed().as_secs_f64();
    let end_cpu = children_cpu_times();

    let metrics = Metrics {
        user_time: end_cpu.user - start_cpu.user,
        sys_time: end_cpu.sys - start_cpu.sys,
        wall_time,
    };
    Ok((status.success(), metrics))
}

/// The two spawn failures users actually hit get tailored messages
/// instead of a raw OS error.
fn classify_spawn_error(err: io::Error, command: &str) -> SandboxError {
    if err.kind() == io::ErrorKind::NotFound {
        return SandboxError::MissingExecutable(command.to_string());
    }
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::ENOEXEC) {
        return SandboxError::BadExecutableFormat(command.to_string());
    }
    SandboxError::Spawn {
        command: command.to_string(),
        err,
    }
}

fn echo_captured_output(stdout_path: &Path, stderr_path: &Path) {
    for (path, kind) in [(stdout_path, "stdout"), (stderr_path, "stderr")] {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(_) => continue,
        };
        if !data.is_empty() {
            println!(
                "-- command {kind} (note: suppressed by default, see sandbox \
                 dir for log files) --"
            );
            println!("--\n{data}--\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::testing::FakeStore;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn filters_are_consumed_from_the_front() {
        let (filters, argv) =
            split_command_filters(&strings(&["%%not result%%", "true", "%%x%%"])).unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(argv, strings(&["true", "%%x%%"]));
    }

    #[test]
    fn filter_only_command_is_an_error() {
        let err = split_command_filters(&strings(&["%%result%%"])).unwrap_err();
        assert!(matches!(err, SandboxError::OnlyFilters));
        let err = split_command_filters(&[]).unwrap_err();
        assert!(matches!(err, SandboxError::OnlyFilters));
    }

    #[test]
    fn interpolation_substitutes_known_variables() {
        let vars = vec![("path", "/sb/build".to_string()), ("revision", "7".to_string())];
        assert_eq!(
            interpolate("%(path)s/bin/clang", &vars).unwrap(),
            "/sb/build/bin/clang"
        );
        assert_eq!(interpolate("r%(revision)s", &vars).unwrap(), "r7");
        assert_eq!(interpolate("no tokens", &vars).unwrap(), "no tokens");
    }

    #[test]
    fn interpolation_rejects_unknown_and_malformed() {
        let vars = vec![("path", "/sb".to_string())];
        assert!(matches!(
            interpolate("%(bogus)s", &vars),
            Err(SandboxError::UnknownVariable(name)) if name == "bogus"
        ));
        assert!(matches!(
            interpolate("%(path", &vars),
            Err(SandboxError::MalformedInterpolation(_))
        ));
        assert!(matches!(
            interpolate("%(path)d", &vars),
            Err(SandboxError::MalformedInterpolation(_))
        ));
    }

    #[test]
    fn environment_gets_test_variables_and_path_prepends() {
        let base = vec![("PATH".to_string(), "/usr/bin".to_string())];
        let vars = vec![
            ("path", "/sb/build".to_string()),
            ("clang++", "/sb/build/bin/clang++".to_string()),
        ];
        let augment = PathAugment {
            bin_dirs: vec![PathBuf::from("/sb/build/bin")],
            lib_dirs: vec![PathBuf::from("/sb/build/lib")],
        };
        let env = build_environment(base, &vars, Some(&augment));

        assert_eq!(env["TEST_PATH"], "/sb/build");
        assert_eq!(env["TEST_CLANG++"], "/sb/build/bin/clang++");
        assert_eq!(
            env["PATH"],
            format!("/sb/build/bin{PATH_LIST_SEPARATOR}/usr/bin")
        );
        assert_eq!(
            env["LD_LIBRARY_PATH"],
            format!("/sb/build/lib{PATH_LIST_SEPARATOR}")
        );
    }

    #[cfg(unix)]
    mod executor {
        use super::*;
        use crate::store::Repository;

        fn demo_config(dir: &Path) -> Config {
            Config {
                data_dir: dir.to_path_buf(),
                store_url: "http://localhost:0".to_string(),
                bucket: "unused".to_string(),
                cache_builds: false,
                only_use_cache: false,
            }
        }

        fn demo_store() -> FakeStore {
            let store = FakeStore::default();
            store.add_archive(
                "demo",
                "clang-r100.tar.gz",
                FakeStore::tar_gz_with_marker("ok"),
            );
            store
        }

        #[test]
        fn passing_command_with_interpolation() {
            let home = tempfile::tempdir().unwrap();
            let cfg = demo_config(home.path());
            let store = demo_store();
            let repo = Repository::with_store(&cfg, Box::new(&store));
            let build = repo.list_builds("demo").unwrap().pop().unwrap();

            let args = strings(&["sh", "-c", "grep -q ok %(path)s/marker"]);
            let (result, executed) =
                execute_sandboxed_test(&repo, "demo", &build, &args, &ExecOptions::default())
                    .unwrap();
            assert!(result);
            assert_eq!(executed.len(), 1);
            assert!(executed[0].metrics.wall_time >= 0.0);
        }

        #[test]
        fn temporary_sandbox_is_removed_after_both_verdicts() {
            let home = tempfile::tempdir().unwrap();
            let cfg = demo_config(home.path());
            let store = demo_store();
            let repo = Repository::with_store(&cfg, Box::new(&store));
            let build = repo.list_builds("demo").unwrap().pop().unwrap();

            for script in ["true", "false"] {
                let args = strings(&["sh", "-c", &format!("{script} %(path)s")]);
                let (result, executed) =
                    execute_sandboxed_test(&repo, "demo", &build, &args, &ExecOptions::default())
                        .unwrap();
                assert_eq!(result, script == "true");
                assert!(!executed[0].stdout_path.exists());
            }
        }

        #[test]
        fn second_command_runs_only_after_first_passes() {
            let home = tempfile::tempdir().unwrap();
            let cfg = demo_config(home.path());
            let store = demo_store();
            let repo = Repository::with_store(&cfg, Box::new(&store));
            let build = repo.list_builds("demo").unwrap().pop().unwrap();

            let args = strings(&[
                "sh", "-c", "exit 1 # %(path)s", "----", "sh", "-c", "true",
            ]);
            let (result, executed) =
                execute_sandboxed_test(&repo, "demo", &build, &args, &ExecOptions::default())
                    .unwrap();
            assert!(!result);
            assert_eq!(executed.len(), 1);
        }

        #[test]
        fn filter_overrides_exit_status() {
            let home = tempfile::tempdir().unwrap();
            let cfg = demo_config(home.path());
            let store = demo_store();
            let repo = Repository::with_store(&cfg, Box::new(&store));
            let build = repo.list_builds("demo").unwrap().pop().unwrap();

            let args = strings(&["%%not result%%", "sh", "-c", "true # %(path)s"]);
            let (result, _) =
                execute_sandboxed_test(&repo, "demo", &build, &args, &ExecOptions::default())
                    .unwrap();
            assert!(!result);
        }

        #[test]
        fn test_variables_reach_the_child_environment() {
            let home = tempfile::tempdir().unwrap();
            let cfg = demo_config(home.path());
            let store = demo_store();
            let repo = Repository::with_store(&cfg, Box::new(&store));
            let build = repo.list_builds("demo").unwrap().pop().unwrap();

            let args = strings(&["sh", "-c", "grep -q ok \"$TEST_PATH/marker\" # %(path)s"]);
            let (result, _) =
                execute_sandboxed_test(&repo, "demo", &build, &args, &ExecOptions::default())
                    .unwrap();
            assert!(result);
        }

        #[test]
        fn reused_sandbox_skips_the_second_fetch() {
            let home = tempfile::tempdir().unwrap();
            let sandbox = tempfile::tempdir().unwrap();
            let cfg = demo_config(home.path());
            let store = demo_store();
            let repo = Repository::with_store(&cfg, Box::new(&store));
            let build = repo.list_builds("demo").unwrap().pop().unwrap();

            let opts = ExecOptions {
                sandbox: Some(sandbox.path().to_path_buf()),
                reuse_sandbox: true,
                ..ExecOptions::default()
            };
            let args = strings(&["sh", "-c", "test -f %(path)s/marker"]);
            execute_sandboxed_test(&repo, "demo", &build, &args, &opts).unwrap();
            assert_eq!(store.downloads.get(), 1);
            execute_sandboxed_test(&repo, "demo", &build, &args, &opts).unwrap();
            assert_eq!(store.downloads.get(), 1);
        }

        #[test]
        fn dirty_sandbox_without_reuse_is_fatal() {
            let home = tempfile::tempdir().unwrap();
            let sandbox = tempfile::tempdir().unwrap();
            let cfg = demo_config(home.path());
            let store = demo_store();
            let repo = Repository::with_store(&cfg, Box::new(&store));
            let build = repo.list_builds("demo").unwrap().pop().unwrap();

            let opts = ExecOptions {
                sandbox: Some(sandbox.path().to_path_buf()),
                ..ExecOptions::default()
            };
            let args = strings(&["sh", "-c", "test -f %(path)s/marker"]);
            execute_sandboxed_test(&repo, "demo", &build, &args, &opts).unwrap();
            let err = execute_sandboxed_test(&repo, "demo", &build, &args, &opts).unwrap_err();
            assert!(matches!(err, SandboxError::NotClean(_)));
        }

        #[test]
        fn missing_executable_is_reported_by_name() {
            let home = tempfile::tempdir().unwrap();
            let cfg = demo_config(home.path());
            let store = demo_store();
            let repo = Repository::with_store(&cfg, Box::new(&store));
            let build = repo.list_builds("demo").unwrap().pop().unwrap();

            let args = strings(&["/no/such/binary-here", "%(path)s"]);
            let err = execute_sandboxed_test(&repo, "demo", &build, &args, &ExecOptions::default())
                .unwrap_err();
            assert!(
                matches!(err, SandboxError::MissingExecutable(name) if name == "/no/such/binary-here")
            );
        }
    }
}
